//! Streaming object downloader
//!
//! Requested ids are coalesced by a [`BatchingQueue`]; every flushed batch
//! becomes one POST to the server, whose response is a stream of
//! `<id>\t<json>\n` lines. Lines are parsed as they arrive, written through
//! to the [`Cache`] and forwarded to the results channel.

pub mod fetch;

pub use fetch::{validate_response, ByteStream, FetchResponse, Fetcher, Headers, ReqwestFetcher};

use crate::batching::{BatchingOptions, BatchingQueue};
use crate::cache::Cache;
use crate::config::{DownloadConfig, ServerConfig};
use crate::error::{Error, Result};
use crate::item::{Item, RAW_ENCODING_MARKER};
use futures::StreamExt;
use once_cell::sync::OnceCell;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, warn};

/// Expected totals up to this size are fetched in a single batch
pub const SMALL_DOWNLOAD_THRESHOLD: usize = 50;

/// Number of ids listed in a missing objects error
const MISSING_IDS_REPORTED: usize = 10;

/// Lines handled between cooperative yields
const LINES_PER_YIELD: usize = 1000;

/// What to do with a line whose payload is not a valid object
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MalformedLinePolicy {
    /// Fail the whole batch
    #[default]
    AbortBatch,
    /// Log it and emit a placeholder for the id instead
    Placeholder,
}

/// Everything the downloader needs to talk to one server
#[derive(Debug, Clone)]
pub struct DownloaderOptions {
    /// Server base URL, without a trailing slash
    pub server_url: String,
    /// Stream holding the objects
    pub stream_id: String,
    /// Root object id
    pub object_id: String,
    /// Bearer token sent with every request
    pub token: Option<String>,
    /// Extra headers sent with every request
    pub headers: Headers,
    /// Ids per request for large downloads
    pub batch_max_size: usize,
    /// How long ids may wait for a batch to fill
    pub batch_max_wait: Duration,
    /// Requests allowed in flight at once
    pub max_concurrent_requests: Option<usize>,
    /// Handling of unparseable lines
    pub malformed_lines: MalformedLinePolicy,
}

impl DownloaderOptions {
    /// Options from the loader configuration sections
    pub fn from_config(server: &ServerConfig, download: &DownloadConfig) -> Self {
        Self {
            server_url: server.server_url.trim_end_matches('/').to_string(),
            stream_id: server.stream_id.clone(),
            object_id: server.object_id.clone(),
            token: server.token.clone(),
            headers: server
                .headers
                .iter()
                .map(|(name, value)| (name.clone(), value.clone()))
                .collect(),
            batch_max_size: download.batch_max_size,
            batch_max_wait: Duration::from_millis(download.batch_max_wait_ms),
            max_concurrent_requests: Some(download.max_concurrent_requests),
            malformed_lines: download.malformed_lines,
        }
    }

    /// URL of the batched children endpoint
    pub fn children_url(&self) -> String {
        format!("{}/api/getobjects/{}", self.server_url, self.stream_id)
    }

    /// URL of the root object endpoint
    pub fn root_url(&self) -> String {
        format!(
            "{}/objects/{}/{}/single",
            self.server_url, self.stream_id, self.object_id
        )
    }

    /// Headers sent with every request
    pub fn request_headers(&self) -> Headers {
        let mut headers = self.headers.clone();
        headers.push(("Accept".to_string(), "text/plain".to_string()));
        if let Some(token) = &self.token {
            headers.push(("Authorization".to_string(), format!("Bearer {token}")));
        }
        headers
    }
}

/// Splits a chunked byte stream into `\n` terminated lines
#[derive(Debug, Default)]
struct LineSplitter {
    leftover: Vec<u8>,
}

impl LineSplitter {
    /// Append a chunk and return every line it completes
    fn push(&mut self, chunk: &[u8]) -> Vec<Vec<u8>> {
        self.leftover.extend_from_slice(chunk);

        let mut lines = Vec::new();
        let mut start = 0;
        while let Some(pos) = self.leftover[start..].iter().position(|b| *b == b'\n') {
            lines.push(self.leftover[start..start + pos].to_vec());
            start += pos + 1;
        }
        self.leftover.drain(..start);
        lines
    }

    /// Whatever is left once the stream ended
    fn finish(self) -> Option<Vec<u8>> {
        (!self.leftover.is_empty()).then_some(self.leftover)
    }
}

/// Outcome of parsing one response line
enum Line {
    /// A parsed object, to cache and forward
    Object(Item),
    /// Raw-encoded payload; counted as received, nothing emitted
    Skipped(String),
    /// Malformed payload replaced by a placeholder
    Placeholder(Item),
}

fn contains(haystack: &[u8], needle: &[u8]) -> bool {
    haystack.windows(needle.len()).any(|window| window == needle)
}

fn parse_line(line: &[u8], policy: MalformedLinePolicy) -> Result<Line> {
    let Some(tab) = line.iter().position(|b| *b == b'\t') else {
        return Err(Error::Protocol(format!(
            "Invalid line format in response: {}",
            String::from_utf8_lossy(line)
        )));
    };

    let base_id = std::str::from_utf8(&line[..tab])
        .map_err(|e| Error::Protocol(format!("object id is not valid UTF-8: {e}")))?
        .to_string();
    let json = &line[tab + 1..];

    if contains(json, RAW_ENCODING_MARKER.as_bytes()) {
        return Ok(Line::Skipped(base_id));
    }

    let parsed = std::str::from_utf8(json)
        .map_err(|e| Error::InvalidJson {
            base_id: base_id.clone(),
            message: e.to_string(),
        })
        .and_then(|json| Item::parse(&base_id, json));

    match (parsed, policy) {
        (Ok(item), _) => Ok(Line::Object(item)),
        (Err(e), MalformedLinePolicy::Placeholder) => {
            warn!(error = %e, base_id = %base_id, "malformed object replaced by placeholder");
            Ok(Line::Placeholder(Item::placeholder(base_id)))
        }
        (Err(e), MalformedLinePolicy::AbortBatch) => Err(e),
    }
}

struct Shared {
    options: DownloaderOptions,
    fetcher: Arc<dyn Fetcher>,
    cache: Option<Arc<Cache>>,
    headers: Headers,
    children_url: String,
    /// Dropped once `total` objects were delivered
    results: Mutex<Option<UnboundedSender<Item>>>,
    total: AtomicUsize,
    delivered: AtomicUsize,
}

impl Shared {
    async fn download_batch(
        &self,
        batch: Vec<String>,
        url: &str,
        headers: &[(String, String)],
        sink: &UnboundedSender<Item>,
    ) -> Result<()> {
        let mut keys: HashSet<&str> = batch.iter().map(String::as_str).collect();
        let body = serde_json::json!({ "objects": serde_json::to_string(&batch)? }).to_string();

        let mut request_headers = headers.to_vec();
        request_headers.push(("Content-Type".to_string(), "application/json".to_string()));

        debug!(ids = batch.len(), "requesting object batch");
        let response = self.fetcher.post(url, &request_headers, body.into_bytes()).await?;
        validate_response(&response)?;
        let mut body = response.into_body()?;

        let mut splitter = LineSplitter::default();
        let mut handled = 0usize;
        while let Some(chunk) = body.next().await {
            for line in splitter.push(&chunk?) {
                self.handle_line(&line, &mut keys, sink)?;
                handled += 1;
                if handled % LINES_PER_YIELD == 0 {
                    tokio::task::yield_now().await;
                }
            }
        }
        if let Some(line) = splitter.finish() {
            self.handle_line(&line, &mut keys, sink)?;
        }

        if !keys.is_empty() {
            let missing = batch
                .iter()
                .filter(|id| keys.contains(id.as_str()))
                .take(MISSING_IDS_REPORTED)
                .cloned()
                .collect();
            return Err(Error::MissingObjects(missing));
        }

        self.mark_delivered(batch.len());
        Ok(())
    }

    fn handle_line(&self, line: &[u8], keys: &mut HashSet<&str>, sink: &UnboundedSender<Item>) -> Result<()> {
        if line.is_empty() {
            return Ok(());
        }

        let item = match parse_line(line, self.options.malformed_lines)? {
            Line::Skipped(base_id) => {
                keys.remove(base_id.as_str());
                return Ok(());
            }
            Line::Placeholder(item) => item,
            Line::Object(item) => {
                if let Some(cache) = &self.cache {
                    cache.add(item.clone());
                }
                item
            }
        };

        keys.remove(item.base_id.as_str());
        sink.send(item).map_err(|_| Error::Disposed("results channel"))
    }

    fn mark_delivered(&self, count: usize) {
        let delivered = self.delivered.fetch_add(count, Ordering::AcqRel) + count;
        if delivered >= self.total.load(Ordering::Acquire) && self.results.lock().take().is_some() {
            debug!(delivered, "all expected objects delivered, closing results");
        }
    }
}

/// Coalescing, streaming object downloader
pub struct Downloader {
    shared: Arc<Shared>,
    pool: OnceCell<BatchingQueue<String>>,
}

impl std::fmt::Debug for Downloader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Downloader")
            .field("options", &self.shared.options)
            .field("pool", &self.pool.get())
            .finish()
    }
}

impl Downloader {
    /// Downloader using `fetcher`, writing through to `cache` when given
    pub fn new(options: DownloaderOptions, fetcher: Arc<dyn Fetcher>, cache: Option<Arc<Cache>>) -> Self {
        let headers = options.request_headers();
        let children_url = options.children_url();
        Self {
            shared: Arc::new(Shared {
                options,
                fetcher,
                cache,
                headers,
                children_url,
                results: Mutex::new(None),
                total: AtomicUsize::new(usize::MAX),
                delivered: AtomicUsize::new(0),
            }),
            pool: OnceCell::new(),
        }
    }

    /// Options the downloader was built with
    pub fn options(&self) -> &DownloaderOptions {
        &self.shared.options
    }

    /// Batch size used for a download of `total` objects
    pub fn batch_size_for(&self, total: usize) -> usize {
        if total <= SMALL_DOWNLOAD_THRESHOLD {
            total.max(1)
        } else {
            self.shared.options.batch_max_size
        }
    }

    /// Set up the request pool for a download of `total` objects
    ///
    /// Parsed objects are sent to `results`; the downloader drops its sender
    /// once `total` objects were delivered. Can only be called once.
    pub fn initialize_pool(&self, results: UnboundedSender<Item>, total: usize) -> Result<()> {
        if self.pool.get().is_some() {
            return Err(Error::Init("download pool is already initialized".into()));
        }

        let mut options = BatchingOptions::new(self.batch_size_for(total), self.shared.options.batch_max_wait);
        options.max_concurrent_flushes = self.shared.options.max_concurrent_requests;

        let shared = Arc::clone(&self.shared);
        let pool = BatchingQueue::new(options, move |batch: Vec<String>| {
            let shared = Arc::clone(&shared);
            async move {
                let sink = shared.results.lock().clone();
                let Some(sink) = sink else {
                    return Err(Error::Disposed("results channel"));
                };
                shared
                    .download_batch(batch, &shared.children_url, &shared.headers, &sink)
                    .await
            }
        })?;

        self.pool
            .set(pool)
            .map_err(|_| Error::Init("download pool is already initialized".into()))?;
        *self.shared.results.lock() = Some(results);
        self.shared.total.store(total, Ordering::Release);
        debug!(total, batch_size = self.batch_size_for(total), "download pool initialized");
        Ok(())
    }

    fn pool(&self) -> Result<&BatchingQueue<String>> {
        self.pool
            .get()
            .ok_or_else(|| Error::Init("download pool is not initialized".into()))
    }

    /// Request an object
    pub fn add(&self, id: impl Into<String>) -> Result<()> {
        if self.pool()?.add(id.into()) {
            Ok(())
        } else {
            Err(Error::Disposed("download pool"))
        }
    }

    /// Fetch the root object on its own
    ///
    /// Returns `None` when the root is raw-encoded.
    pub async fn download_single(&self) -> Result<Option<Item>> {
        let options = &self.shared.options;
        let response = self
            .shared
            .fetcher
            .get(&options.root_url(), &self.shared.headers)
            .await?;
        validate_response(&response)?;

        let mut body = response.into_body()?;
        let mut payload = Vec::new();
        while let Some(chunk) = body.next().await {
            payload.extend_from_slice(&chunk?);
        }

        if contains(&payload, RAW_ENCODING_MARKER.as_bytes()) {
            return Ok(None);
        }
        let json = std::str::from_utf8(&payload).map_err(|e| Error::InvalidJson {
            base_id: options.object_id.clone(),
            message: e.to_string(),
        })?;
        Item::parse(&options.object_id, json).map(Some)
    }

    /// Download one batch of ids from `url`, forwarding parsed objects to `sink`
    pub async fn download_batch(
        &self,
        batch: Vec<String>,
        url: &str,
        headers: &[(String, String)],
        sink: &UnboundedSender<Item>,
    ) -> Result<()> {
        self.shared.download_batch(batch, url, headers, sink).await
    }

    /// Flush every requested id and wait for all requests to finish
    pub async fn finish(&self) -> Result<()> {
        match self.pool.get() {
            Some(pool) => pool.finish().await,
            None => Ok(()),
        }
    }

    /// Stop accepting ids and drop the ones not yet requested
    pub fn dispose(&self) {
        if let Some(pool) = self.pool.get() {
            pool.dispose();
        }
        self.shared.results.lock().take();
    }
}
