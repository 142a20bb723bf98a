//! Write-behind object cache
//!
//! Items handed to [`Cache::add`] are collected by a [`BatchingQueue`] and
//! persisted in batches through a [`Database`]. Every accepted item is also
//! recorded in a write overlay before it enters the queue, and stays there
//! until the batch carrying it has been written. Reads consult the overlay
//! first, so an item is visible from the moment `add` returned, whether it
//! is still pending, handed to a flush that has not started yet, or being
//! written.
//!
//! When the same id is written more than once, the most recent write wins in
//! the overlay and a finishing older write never evicts a newer one.

pub mod disk;
pub mod memory;

pub use disk::FileDatabase;
pub use memory::MemoryDatabase;

use crate::batching::{BatchingOptions, BatchingQueue};
use crate::error::{Error, Result};
use crate::item::Item;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Default number of items per write batch
pub const DEFAULT_WRITE_BATCH_SIZE: usize = 100;

/// Default delay before a partial write batch is flushed
pub const DEFAULT_WRITE_BATCH_WAIT: Duration = Duration::from_millis(500);

/// Key-value persistence behind the cache
#[async_trait]
pub trait Database: Send + Sync {
    /// Look up several ids, preserving order
    async fn get_all(&self, keys: &[String]) -> Result<Vec<Option<Item>>>;

    /// Look up a single id
    async fn get(&self, key: &str) -> Result<Option<Item>> {
        let mut found = self.get_all(&[key.to_string()]).await?;
        Ok(found.pop().flatten())
    }

    /// Persist a batch; later items win over earlier ones with the same id
    async fn put_all(&self, items: Vec<Item>) -> Result<()>;

    /// Release the store
    async fn dispose(&self) -> Result<()>;
}

/// An accepted item tagged with its write sequence
struct PendingWrite {
    seq: u64,
    item: Item,
}

#[derive(Default)]
struct OverlayState {
    next_seq: u64,
    entries: HashMap<String, (u64, Item)>,
}

/// Writes accepted but not yet confirmed by the database
#[derive(Default)]
struct Overlay {
    state: Mutex<OverlayState>,
}

impl Overlay {
    fn insert(&self, item: Item) -> PendingWrite {
        let mut state = self.state.lock();
        let seq = state.next_seq;
        state.next_seq += 1;
        state.entries.insert(item.base_id.clone(), (seq, item.clone()));
        PendingWrite { seq, item }
    }

    /// Forget entries still owned by these writes
    fn release<'a>(&self, writes: impl IntoIterator<Item = (u64, &'a str)>) {
        let mut state = self.state.lock();
        for (seq, id) in writes {
            if state.entries.get(id).is_some_and(|(current, _)| *current == seq) {
                state.entries.remove(id);
            }
        }
    }

    fn get(&self, key: &str) -> Option<Item> {
        self.state.lock().entries.get(key).map(|(_, item)| item.clone())
    }

    fn len(&self) -> usize {
        self.state.lock().entries.len()
    }
}

/// Shared by the cache and its write queue processor
struct Writer {
    database: Arc<dyn Database>,
    overlay: Overlay,
}

impl Writer {
    async fn save_batch(&self, batch: Vec<PendingWrite>) -> Result<()> {
        debug!(items = batch.len(), "writing cache batch");
        let seqs: Vec<(u64, String)> = batch
            .iter()
            .map(|write| (write.seq, write.item.base_id.clone()))
            .collect();
        let items = batch.into_iter().map(|write| write.item).collect();

        let result = self.database.put_all(items).await;
        self.overlay
            .release(seqs.iter().map(|(seq, id)| (*seq, id.as_str())));
        result
    }
}

/// Object cache with a pending-write overlay
pub struct Cache {
    writer: Arc<Writer>,
    write_queue: BatchingQueue<PendingWrite>,
    disposed: AtomicBool,
}

impl std::fmt::Debug for Cache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cache")
            .field("write_queue", &self.write_queue)
            .field("disposed", &self.disposed.load(Ordering::Relaxed))
            .finish()
    }
}

impl Cache {
    /// Cache over `database` with the default write batching
    pub fn new(database: Arc<dyn Database>) -> Result<Self> {
        Self::with_options(
            database,
            BatchingOptions::new(DEFAULT_WRITE_BATCH_SIZE, DEFAULT_WRITE_BATCH_WAIT),
        )
    }

    /// Cache over `database` with custom write batching
    pub fn with_options(database: Arc<dyn Database>, options: BatchingOptions) -> Result<Self> {
        let writer = Arc::new(Writer {
            database,
            overlay: Overlay::default(),
        });

        let processor = Arc::clone(&writer);
        let write_queue = BatchingQueue::new(options, move |batch: Vec<PendingWrite>| {
            let writer = Arc::clone(&processor);
            async move { writer.save_batch(batch).await }
        })?;

        Ok(Self {
            writer,
            write_queue,
            disposed: AtomicBool::new(false),
        })
    }

    fn ensure_open(&self) -> Result<()> {
        if self.disposed.load(Ordering::Acquire) {
            return Err(Error::Disposed("cache"));
        }
        Ok(())
    }

    fn overlay(&self, key: &str) -> Option<Item> {
        self.writer.overlay.get(key)
    }

    /// Queue an item for writing
    ///
    /// The item is readable as soon as this returns. Returns `false` once the
    /// cache was disposed.
    pub fn add(&self, item: Item) -> bool {
        let write = self.writer.overlay.insert(item);
        let (seq, id) = (write.seq, write.item.base_id.clone());
        if self.write_queue.add(write) {
            return true;
        }
        self.writer.overlay.release([(seq, id.as_str())]);
        false
    }

    /// Look up one id
    pub async fn get_item(&self, id: &str) -> Result<Option<Item>> {
        self.ensure_open()?;
        if let Some(item) = self.overlay(id) {
            return Ok(Some(item));
        }
        self.writer.database.get(id).await
    }

    /// Look up several ids, preserving order
    pub async fn get_all(&self, keys: &[String]) -> Result<Vec<Option<Item>>> {
        self.ensure_open()?;

        let mut found: Vec<Option<Item>> = keys.iter().map(|key| self.overlay(key)).collect();
        let misses: Vec<String> = keys
            .iter()
            .zip(&found)
            .filter(|(_, hit)| hit.is_none())
            .map(|(key, _)| key.clone())
            .collect();
        if misses.is_empty() {
            return Ok(found);
        }

        let mut stored = self.writer.database.get_all(&misses).await?.into_iter();
        for slot in found.iter_mut().filter(|slot| slot.is_none()) {
            *slot = stored.next().flatten();
        }
        Ok(found)
    }

    /// Write a batch straight through the overlay into the database
    pub async fn cache_save_batch(&self, batch: Vec<Item>) -> Result<()> {
        self.ensure_open()?;
        let writes = batch
            .into_iter()
            .map(|item| self.writer.overlay.insert(item))
            .collect();
        self.writer.save_batch(writes).await
    }

    /// Number of items waiting in the write queue
    pub fn pending_writes(&self) -> usize {
        self.write_queue.len()
    }

    /// Number of ids whose latest write has not reached the database yet
    pub fn unconfirmed_writes(&self) -> usize {
        self.writer.overlay.len()
    }

    /// Flush pending writes, then release the database
    pub async fn dispose(&self) -> Result<()> {
        if self.disposed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let flushed = self.write_queue.finish().await;
        self.writer.database.dispose().await?;
        flushed
    }
}
