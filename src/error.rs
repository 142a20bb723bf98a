//! Error types for the object loader
//!
//! Framing problems on the ring queues are never surfaced here: they are
//! logged and treated as the end of the available data. Everything else that
//! can fail (network, parsing, storage, initialization) is an [`Error`].

use std::io;
use thiserror::Error;

/// Errors raised by the loader pipeline
#[derive(Debug, Error)]
pub enum Error {
    /// The server rejected the credential (HTTP 401 or 403)
    #[error("You do not have access!")]
    PermissionDenied,

    /// The server answered with a non-success status
    #[error("Failed to fetch objects: {status} {status_text}")]
    Fetch {
        /// HTTP status code
        status: u16,
        /// Reason phrase sent with the status
        status_text: String,
    },

    /// The response could not be consumed as the object line protocol
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// A downloaded payload was not valid JSON
    #[error("Error parsing object {base_id}: {message}")]
    InvalidJson {
        /// Id of the offending object
        base_id: String,
        /// Parser message
        message: String,
    },

    /// A downloaded payload parsed but is not an object with a string id
    #[error("{0} is not a base")]
    NotABase(String),

    /// Ids that were requested but never came back in the response
    #[error("Items requested were not downloaded: {}", .0.join(","))]
    MissingObjects(Vec<String>),

    /// Shared memory or worker queue initialization failed
    #[error("Initialization error: {0}")]
    Init(String),

    /// Invalid configuration value
    #[error("Configuration error: {0}")]
    Config(String),

    /// The persistence engine failed
    #[error("Storage error: {0}")]
    Storage(String),

    /// The component was already disposed
    #[error("{0} has been disposed")]
    Disposed(&'static str),

    /// A background task panicked or was cancelled
    #[error("Task failed: {0}")]
    Task(String),

    /// Transport failure from the HTTP client
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// JSON serialization failure
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// An IO error occurred
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

impl From<tokio::task::JoinError> for Error {
    fn from(error: tokio::task::JoinError) -> Self {
        Error::Task(error.to_string())
    }
}

impl From<toml::de::Error> for Error {
    fn from(error: toml::de::Error) -> Self {
        Error::Config(error.to_string())
    }
}

/// Result type for loader operations
pub type Result<T> = std::result::Result<T, Error>;
