//! Loader configuration
//!
//! Every field has a default, so a partial TOML document (or none at all)
//! yields a usable configuration:
//!
//! ```toml
//! [server]
//! server_url = "https://app.example.com"
//! stream_id = "a1b2c3"
//! object_id = "root"
//!
//! [download]
//! batch_max_size = 5000
//! malformed_lines = "placeholder"
//!
//! [worker]
//! queue_capacity_bytes = 65536
//! ```

use crate::batching::BatchingOptions;
use crate::downloader::MalformedLinePolicy;
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

fn default_batch_max_size() -> usize {
    10_000
}

fn default_batch_max_wait_ms() -> u64 {
    100
}

fn default_max_concurrent_requests() -> usize {
    4
}

fn default_write_batch_max_size() -> usize {
    100
}

fn default_write_batch_max_wait_ms() -> u64 {
    500
}

fn default_queue_capacity_bytes() -> usize {
    16 * 1024
}

fn default_poll_batch_size() -> usize {
    10
}

fn default_poll_timeout_ms() -> u64 {
    50
}

fn default_enqueue_timeout_ms() -> u64 {
    5_000
}

/// Server to download from
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Base URL of the server
    pub server_url: String,
    /// Stream holding the objects
    pub stream_id: String,
    /// Root object id
    pub object_id: String,
    /// Pre-obtained bearer token
    pub token: Option<String>,
    /// Extra headers sent with every request
    pub headers: BTreeMap<String, String>,
}

/// Request batching for the downloader
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DownloadConfig {
    /// Ids per request
    #[serde(default = "default_batch_max_size")]
    pub batch_max_size: usize,
    /// Milliseconds ids may wait for a request to fill
    #[serde(default = "default_batch_max_wait_ms")]
    pub batch_max_wait_ms: u64,
    /// Requests in flight at once
    #[serde(default = "default_max_concurrent_requests")]
    pub max_concurrent_requests: usize,
    /// Handling of lines that are not valid objects
    #[serde(default)]
    pub malformed_lines: MalformedLinePolicy,
}

impl Default for DownloadConfig {
    fn default() -> Self {
        Self {
            batch_max_size: default_batch_max_size(),
            batch_max_wait_ms: default_batch_max_wait_ms(),
            max_concurrent_requests: default_max_concurrent_requests(),
            malformed_lines: MalformedLinePolicy::default(),
        }
    }
}

/// Write batching for the cache
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Items per database write
    #[serde(default = "default_write_batch_max_size")]
    pub write_batch_max_size: usize,
    /// Milliseconds before a partial write batch is flushed
    #[serde(default = "default_write_batch_max_wait_ms")]
    pub write_batch_max_wait_ms: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            write_batch_max_size: default_write_batch_max_size(),
            write_batch_max_wait_ms: default_write_batch_max_wait_ms(),
        }
    }
}

impl CacheConfig {
    /// Batching thresholds for the write queue
    pub fn batching_options(&self) -> BatchingOptions {
        BatchingOptions::new(
            self.write_batch_max_size,
            Duration::from_millis(self.write_batch_max_wait_ms),
        )
    }
}

/// Worker thread queues
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Data capacity of each direction's ring buffer
    #[serde(default = "default_queue_capacity_bytes")]
    pub queue_capacity_bytes: usize,
    /// Messages taken per dequeue
    #[serde(default = "default_poll_batch_size")]
    pub poll_batch_size: usize,
    /// Milliseconds a dequeue may wait for messages
    #[serde(default = "default_poll_timeout_ms")]
    pub poll_timeout_ms: u64,
    /// Milliseconds an enqueue may wait for space
    #[serde(default = "default_enqueue_timeout_ms")]
    pub enqueue_timeout_ms: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            queue_capacity_bytes: default_queue_capacity_bytes(),
            poll_batch_size: default_poll_batch_size(),
            poll_timeout_ms: default_poll_timeout_ms(),
            enqueue_timeout_ms: default_enqueue_timeout_ms(),
        }
    }
}

/// Complete loader configuration
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoaderConfig {
    /// Server connection
    pub server: ServerConfig,
    /// Downloader batching
    pub download: DownloadConfig,
    /// Cache write batching
    pub cache: CacheConfig,
    /// Worker queues
    pub worker: WorkerConfig,
}

impl LoaderConfig {
    /// Parse and validate a TOML document
    pub fn from_toml_str(source: &str) -> Result<Self> {
        let config: Self = toml::from_str(source)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject sizes, waits and capacities of zero
    pub fn validate(&self) -> Result<()> {
        let positive = [
            ("download.batch_max_size", self.download.batch_max_size as u64),
            ("download.batch_max_wait_ms", self.download.batch_max_wait_ms),
            ("download.max_concurrent_requests", self.download.max_concurrent_requests as u64),
            ("cache.write_batch_max_size", self.cache.write_batch_max_size as u64),
            ("cache.write_batch_max_wait_ms", self.cache.write_batch_max_wait_ms),
            ("worker.queue_capacity_bytes", self.worker.queue_capacity_bytes as u64),
            ("worker.poll_batch_size", self.worker.poll_batch_size as u64),
        ];

        match positive.iter().find(|(_, value)| *value == 0) {
            Some((name, _)) => Err(Error::Config(format!("{name} must be positive"))),
            None => Ok(()),
        }
    }
}
