//! HTTP transport seam for the downloader

use crate::error::{Error, Result};
use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use futures::StreamExt;
use std::time::Duration;

/// Streamed response body
pub type ByteStream = BoxStream<'static, Result<Bytes>>;

/// Request headers as name/value pairs
pub type Headers = Vec<(String, String)>;

/// What the downloader needs from an HTTP response
pub struct FetchResponse {
    /// Status code
    pub status: u16,
    /// Reason phrase
    pub status_text: String,
    /// Body, when the transport could provide one
    pub body: Option<ByteStream>,
}

impl FetchResponse {
    /// Successful response streaming `chunks`
    pub fn ok<I>(chunks: I) -> Self
    where
        I: IntoIterator<Item = Bytes>,
        I::IntoIter: Send + 'static,
    {
        Self {
            status: 200,
            status_text: "OK".to_string(),
            body: Some(futures::stream::iter(chunks.into_iter().map(Ok)).boxed()),
        }
    }

    /// Response without a body
    pub fn status(status: u16, status_text: impl Into<String>) -> Self {
        Self {
            status,
            status_text: status_text.into(),
            body: None,
        }
    }

    /// Whether the status is 2xx
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Take the body out of a validated response
    pub fn into_body(self) -> Result<ByteStream> {
        self.body
            .ok_or_else(|| Error::Protocol("response has no readable body".into()))
    }
}

impl std::fmt::Debug for FetchResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FetchResponse")
            .field("status", &self.status)
            .field("status_text", &self.status_text)
            .field("has_body", &self.body.is_some())
            .finish()
    }
}

/// HTTP transport
#[async_trait]
pub trait Fetcher: Send + Sync {
    /// Issue a GET request
    async fn get(&self, url: &str, headers: &[(String, String)]) -> Result<FetchResponse>;

    /// Issue a POST request with `body`
    async fn post(&self, url: &str, headers: &[(String, String)], body: Vec<u8>) -> Result<FetchResponse>;
}

/// Map a response status onto the error taxonomy
///
/// 401 and 403 are permission errors, any other non-2xx status is a fetch
/// error, and a success without a body is a protocol error.
pub fn validate_response(response: &FetchResponse) -> Result<()> {
    match response.status {
        401 | 403 => Err(Error::PermissionDenied),
        _ if !response.is_success() => Err(Error::Fetch {
            status: response.status,
            status_text: response.status_text.clone(),
        }),
        _ if response.body.is_none() => Err(Error::Protocol(
            "response has no readable body".into(),
        )),
        _ => Ok(()),
    }
}

/// [`Fetcher`] backed by a `reqwest` client
#[derive(Debug, Clone)]
pub struct ReqwestFetcher {
    client: reqwest::Client,
}

impl ReqwestFetcher {
    /// Fetcher with a connect timeout of `connect_timeout`
    pub fn new(connect_timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(connect_timeout)
            .build()?;
        Ok(Self { client })
    }

    /// Fetcher reusing an existing client
    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }

    async fn send(&self, request: reqwest::RequestBuilder, headers: &[(String, String)]) -> Result<FetchResponse> {
        let request = headers
            .iter()
            .fold(request, |request, (name, value)| request.header(name.as_str(), value.as_str()));
        let response = request.send().await?;

        let status = response.status();
        Ok(FetchResponse {
            status: status.as_u16(),
            status_text: status.canonical_reason().unwrap_or_default().to_string(),
            body: Some(response.bytes_stream().map(|chunk| chunk.map_err(Error::from)).boxed()),
        })
    }
}

#[async_trait]
impl Fetcher for ReqwestFetcher {
    async fn get(&self, url: &str, headers: &[(String, String)]) -> Result<FetchResponse> {
        self.send(self.client.get(url), headers).await
    }

    async fn post(&self, url: &str, headers: &[(String, String)], body: Vec<u8>) -> Result<FetchResponse> {
        self.send(self.client.post(url).body(body), headers).await
    }
}
