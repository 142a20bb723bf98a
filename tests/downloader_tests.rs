//! Downloader tests against an in-process object server

use async_trait::async_trait;
use bytes::Bytes;
use object_loader::{
    Cache, Downloader, DownloaderOptions, Error, FetchResponse, Fetcher, Item, MalformedLinePolicy,
    MemoryDatabase, Result,
};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

/// A request as seen by the server
#[derive(Debug, Clone)]
struct Request {
    url: String,
    headers: Vec<(String, String)>,
    ids: Vec<String>,
}

/// Serves canned objects, splitting response bodies into small chunks
struct ObjectServer {
    objects: HashMap<String, String>,
    root: String,
    status: u16,
    chunk_size: usize,
    requests: Mutex<Vec<Request>>,
}

impl ObjectServer {
    fn new(objects: &[(&str, &str)]) -> Self {
        Self {
            objects: objects
                .iter()
                .map(|(id, json)| (id.to_string(), json.to_string()))
                .collect(),
            root: r#"{"id":"root","speckle_type":"Base"}"#.to_string(),
            status: 200,
            chunk_size: 7,
            requests: Mutex::new(Vec::new()),
        }
    }

    fn with_status(mut self, status: u16) -> Self {
        self.status = status;
        self
    }

    fn chunked(&self, body: String) -> FetchResponse {
        let chunks: Vec<Bytes> = body
            .into_bytes()
            .chunks(self.chunk_size)
            .map(Bytes::copy_from_slice)
            .collect();
        FetchResponse::ok(chunks)
    }

    fn requests(&self) -> Vec<Request> {
        self.requests.lock().clone()
    }
}

#[async_trait]
impl Fetcher for ObjectServer {
    async fn get(&self, url: &str, headers: &[(String, String)]) -> Result<FetchResponse> {
        self.requests.lock().push(Request {
            url: url.to_string(),
            headers: headers.to_vec(),
            ids: Vec::new(),
        });
        if self.status != 200 {
            return Ok(FetchResponse::status(self.status, "Denied"));
        }
        Ok(self.chunked(self.root.clone()))
    }

    async fn post(&self, url: &str, headers: &[(String, String)], body: Vec<u8>) -> Result<FetchResponse> {
        let body: serde_json::Value = serde_json::from_slice(&body)?;
        let ids: Vec<String> = serde_json::from_str(body["objects"].as_str().unwrap_or("[]"))?;

        self.requests.lock().push(Request {
            url: url.to_string(),
            headers: headers.to_vec(),
            ids: ids.clone(),
        });
        if self.status != 200 {
            return Ok(FetchResponse::status(self.status, "Denied"));
        }

        let lines: String = ids
            .iter()
            .filter_map(|id| self.objects.get(id).map(|json| format!("{id}\t{json}\n")))
            .collect();
        Ok(self.chunked(lines))
    }
}

fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn options() -> DownloaderOptions {
    DownloaderOptions {
        server_url: "https://app.example.com".to_string(),
        stream_id: "stream".to_string(),
        object_id: "root".to_string(),
        token: Some("token".to_string()),
        headers: vec![("x-client".to_string(), "tests".to_string())],
        batch_max_size: 100,
        batch_max_wait: Duration::from_millis(10),
        max_concurrent_requests: Some(2),
        malformed_lines: MalformedLinePolicy::AbortBatch,
    }
}

fn object(id: &str) -> String {
    format!(r#"{{"id":"{id}","speckle_type":"Base","value":"{id}-payload"}}"#)
}

async fn drain(mut results: mpsc::UnboundedReceiver<Item>) -> Vec<Item> {
    let mut items = Vec::new();
    while let Some(item) = results.recv().await {
        items.push(item);
    }
    items
}

/// Test a batched download that also writes every object through the cache
#[tokio::test]
async fn test_downloads_and_writes_through_cache() {
    init_logging();
    let (a, b, c) = (object("a"), object("b"), object("c"));
    let server = Arc::new(ObjectServer::new(&[("a", a.as_str()), ("b", b.as_str()), ("c", c.as_str())]));
    let cache = Arc::new(Cache::new(Arc::new(MemoryDatabase::new())).unwrap());
    let downloader = Downloader::new(options(), server.clone(), Some(cache.clone()));

    let (tx, rx) = mpsc::unbounded_channel();
    downloader.initialize_pool(tx, 3).unwrap();
    for id in ["a", "b", "c"] {
        downloader.add(id).unwrap();
    }
    downloader.finish().await.unwrap();

    let items = drain(rx).await;
    let ids: Vec<&str> = items.iter().map(|item| item.base_id.as_str()).collect();
    assert_eq!(ids, vec!["a", "b", "c"], "Objects should arrive in response order");
    assert!(items.iter().all(|item| !item.is_placeholder()), "No placeholders expected");
    assert_eq!(items[1].base.as_ref().unwrap().fields["value"], "b-payload");

    assert!(cache.get_item("b").await.unwrap().is_some(), "Downloaded object should be cached");

    let requests = server.requests();
    assert_eq!(requests.len(), 1, "Three ids fit one batch");
    assert_eq!(requests[0].url, "https://app.example.com/api/getobjects/stream");
    assert_eq!(requests[0].ids, vec!["a", "b", "c"]);
    let headers = &requests[0].headers;
    assert!(headers.contains(&("Content-Type".to_string(), "application/json".to_string())));
    assert!(headers.contains(&("Accept".to_string(), "text/plain".to_string())));
    assert!(headers.contains(&("Authorization".to_string(), "Bearer token".to_string())));
    assert!(headers.contains(&("x-client".to_string(), "tests".to_string())));
}

/// Test that ids absent from the response fail the download
#[tokio::test]
async fn test_missing_objects_reported() {
    let a = object("a");
    let server = Arc::new(ObjectServer::new(&[("a", a.as_str())]));
    let downloader = Downloader::new(options(), server, None);

    let (tx, _rx) = mpsc::unbounded_channel();
    downloader.initialize_pool(tx, 2).unwrap();
    downloader.add("a").unwrap();
    downloader.add("gone").unwrap();

    match downloader.finish().await {
        Err(Error::MissingObjects(ids)) => assert_eq!(ids, vec!["gone"]),
        other => panic!("unexpected {other:?}"),
    }
}

/// Test that a 403 surfaces as a permission error
#[tokio::test]
async fn test_permission_denied() {
    let server = Arc::new(ObjectServer::new(&[]).with_status(403));
    let downloader = Downloader::new(options(), server, None);

    let (tx, _rx) = mpsc::unbounded_channel();
    downloader.initialize_pool(tx, 1).unwrap();
    downloader.add("a").unwrap();

    assert!(matches!(downloader.finish().await, Err(Error::PermissionDenied)));
}

/// Test that other non-success statuses carry the status code
#[tokio::test]
async fn test_server_error_status() {
    let server = Arc::new(ObjectServer::new(&[]).with_status(500));
    let downloader = Downloader::new(options(), server, None);

    assert!(matches!(
        downloader.download_single().await,
        Err(Error::Fetch { status: 500, .. })
    ));
}

/// Test that raw encoded payloads are neither cached nor forwarded
#[tokio::test]
async fn test_raw_encoded_objects_not_forwarded() {
    let raw = r#"{"id":"raw","speckle_type":"Objects.Other.RawEncoding"}"#;
    let a = object("a");
    let server = Arc::new(ObjectServer::new(&[("a", a.as_str()), ("raw", raw)]));
    let cache = Arc::new(Cache::new(Arc::new(MemoryDatabase::new())).unwrap());
    let downloader = Downloader::new(options(), server, Some(cache.clone()));

    let (tx, rx) = mpsc::unbounded_channel();
    downloader.initialize_pool(tx, 2).unwrap();
    downloader.add("a").unwrap();
    downloader.add("raw").unwrap();
    downloader.finish().await.unwrap();

    let items = drain(rx).await;
    assert_eq!(items.len(), 1, "Raw object should not be forwarded");
    assert_eq!(items[0].base_id, "a");
    assert!(cache.get_item("raw").await.unwrap().is_none(), "Raw object should not be cached");
}

/// Test that invalid JSON aborts the batch under the default policy
#[tokio::test]
async fn test_malformed_line_aborts_batch_by_default() {
    let a = object("a");
    let server = Arc::new(ObjectServer::new(&[("a", a.as_str()), ("bad", "{nope")]));
    let downloader = Downloader::new(options(), server, None);

    let (tx, _rx) = mpsc::unbounded_channel();
    downloader.initialize_pool(tx, 2).unwrap();
    downloader.add("a").unwrap();
    downloader.add("bad").unwrap();

    assert!(matches!(
        downloader.finish().await,
        Err(Error::InvalidJson { ref base_id, .. }) if base_id == "bad"
    ));
}

/// Test that the placeholder policy replaces a malformed object
#[tokio::test]
async fn test_malformed_line_placeholder_policy() {
    let a = object("a");
    let server = Arc::new(ObjectServer::new(&[("a", a.as_str()), ("bad", r#"{"no_id":true}"#)]));
    let mut options = options();
    options.malformed_lines = MalformedLinePolicy::Placeholder;
    let downloader = Downloader::new(options, server, None);

    let (tx, rx) = mpsc::unbounded_channel();
    downloader.initialize_pool(tx, 2).unwrap();
    downloader.add("a").unwrap();
    downloader.add("bad").unwrap();
    downloader.finish().await.unwrap();

    let items = drain(rx).await;
    assert_eq!(items.len(), 2, "Both ids should be delivered");
    assert!(
        items.iter().any(|item| item.base_id == "bad" && item.is_placeholder()),
        "Malformed object should become a placeholder"
    );
}

/// Test that large downloads are split by the configured batch size
#[tokio::test]
async fn test_large_downloads_use_configured_batch_size() {
    let objects: Vec<(String, String)> = (0..120).map(|i| (format!("id{i}"), object(&format!("id{i}")))).collect();
    let refs: Vec<(&str, &str)> = objects.iter().map(|(id, json)| (id.as_str(), json.as_str())).collect();
    let server = Arc::new(ObjectServer::new(&refs));
    let mut options = options();
    options.batch_max_size = 50;
    let downloader = Downloader::new(options, server.clone(), None);

    assert_eq!(downloader.batch_size_for(10), 10);
    assert_eq!(downloader.batch_size_for(120), 50);

    let (tx, rx) = mpsc::unbounded_channel();
    downloader.initialize_pool(tx, 120).unwrap();
    for (id, _) in &objects {
        downloader.add(id.clone()).unwrap();
    }
    downloader.finish().await.unwrap();

    assert_eq!(drain(rx).await.len(), 120, "Every object should be delivered");
    let mut sizes: Vec<usize> = server.requests().iter().map(|r| r.ids.len()).collect();
    sizes.sort_unstable();
    assert_eq!(sizes, vec![20, 50, 50], "Requests should be split by batch size");
}

/// Test adding before init, double init, and adding after dispose
#[tokio::test]
async fn test_pool_lifecycle_errors() {
    let server = Arc::new(ObjectServer::new(&[]));
    let downloader = Downloader::new(options(), server, None);
    assert!(matches!(downloader.add("a"), Err(Error::Init(_))));

    let (tx, _rx) = mpsc::unbounded_channel();
    downloader.initialize_pool(tx.clone(), 1).unwrap();
    assert!(matches!(downloader.initialize_pool(tx, 1), Err(Error::Init(_))));

    downloader.dispose();
    assert!(matches!(downloader.add("a"), Err(Error::Disposed(_))));
}

/// Test fetching the root object on its own
#[tokio::test]
async fn test_download_single_root() {
    let server = Arc::new(ObjectServer::new(&[]));
    let downloader = Downloader::new(options(), server.clone(), None);

    let root = downloader.download_single().await.unwrap().unwrap();
    assert_eq!(root.base_id, "root");
    assert_eq!(
        server.requests()[0].url,
        "https://app.example.com/objects/stream/root/single"
    );
}

/// Test that a raw encoded root yields nothing
#[tokio::test]
async fn test_download_single_raw_root() {
    let mut server = ObjectServer::new(&[]);
    server.root = r#"{"id":"root","speckle_type":"Objects.Other.RawEncoding"}"#.to_string();
    let downloader = Downloader::new(options(), Arc::new(server), None);

    assert!(downloader.download_single().await.unwrap().is_none(), "Raw root should be skipped");
}
