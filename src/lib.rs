//! Object Loader - cross-thread transport, batching and streaming download
//! pipeline for loading large object graphs.
//!
//! # Overview
//!
//! Given a root object id, the loader retrieves a graph of immutable JSON
//! objects from a server, deduplicates against a local cache and hands fully
//! parsed objects to the consumer. The crate provides the core pieces:
//!
//! 1. A shared-memory ring buffer ([`RingBuffer`]) with blocking, timeout
//!    bounded `push`/`shift`
//! 2. Length-prefixed message queues over it ([`RingBufferQueue`],
//!    [`StringQueue`], [`ItemQueue`]) for a main thread and a worker thread
//! 3. A size and time bounded batch collector ([`BatchingQueue`])
//! 4. A streaming downloader parsing the `<id>\t<json>` line protocol
//!    ([`Downloader`])
//! 5. A write-behind cache with a pending-write overlay ([`Cache`]) over a
//!    pluggable [`Database`]
//! 6. A worker thread resolving ids against its own cache
//!    ([`WorkerManager`])
//!
//! # Key Features
//!
//! - Full-capacity ring buffers with sequence cursors and wait/notify
//! - Corrupt framing is logged and never poisons a queue
//! - Request coalescing with an optional concurrency cap
//! - CRC32 checked, append-only file database
//! - Structured logging through `tracing`
//!
//! # Usage
//!
//! The library is typically used by:
//! 1. Loading a [`LoaderConfig`]
//! 2. Building a [`Cache`] over a [`FileDatabase`] or [`MemoryDatabase`]
//! 3. Initializing the [`Downloader`] pool and adding ids
//! 4. Consuming items from the results channel
//!
//! See the `demos` directory for a worker round trip.

#![deny(missing_docs)]

pub mod batching;
pub mod cache;
pub mod config;
pub mod downloader;
pub mod error;
pub mod item;
pub mod queue;
pub mod ring;
pub mod shared;
pub mod worker;

pub use batching::{BatchKey, BatchingOptions, BatchingQueue};
pub use cache::{Cache, Database, FileDatabase, MemoryDatabase};
pub use config::LoaderConfig;
pub use downloader::{
    validate_response, Downloader, DownloaderOptions, FetchResponse, Fetcher, MalformedLinePolicy,
    ReqwestFetcher,
};
pub use error::{Error, Result};
pub use item::{Base, Item, RAW_ENCODING_MARKER};
pub use queue::typed::{ItemQueue, MessageCodec, StringQueue, TypedQueue};
pub use queue::{QueueSide, RingBufferQueue};
pub use ring::{RingBuffer, RingBufferState};
pub use shared::{SharedBuffer, SharedRegion, WaitOutcome};
pub use worker::{WorkerCommand, WorkerEvent, WorkerManager, WorkerThread};
