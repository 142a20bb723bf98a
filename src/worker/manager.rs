//! Main-side coordinator of the worker thread

use crate::cache::Database;
use crate::config::{CacheConfig, WorkerConfig};
use crate::error::{Error, Result};
use crate::item::Item;
use crate::queue::typed::{ItemQueue, StringQueue};
use crate::queue::QueueSide;
use crate::worker::{WorkerCommand, WorkerEvent, WorkerThread};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Both directions, as seen from the main side
#[derive(Debug)]
struct Queues {
    to_worker: StringQueue,
    from_worker: ItemQueue,
}

/// Owns the worker thread and the main-side ends of its queues
///
/// Ids can be sent once the worker reported [`WorkerEvent::Ready`]; results
/// are collected by polling.
#[derive(Debug)]
pub struct WorkerManager {
    config: WorkerConfig,
    worker: WorkerThread,
    /// Created up front, published once the worker is ready
    pending: Option<Queues>,
    queues: Option<Queues>,
}

impl WorkerManager {
    /// Create both queues, start the worker and hand it the queues
    pub fn start(database: Arc<dyn Database>, cache: &CacheConfig, config: WorkerConfig) -> Result<Self> {
        let capacity = config.queue_capacity_bytes;
        let to_worker = StringQueue::create(capacity, QueueSide::Main)?;
        let from_worker = ItemQueue::create(capacity, QueueSide::Main)?;
        debug!(capacity, "worker queues created");

        let mut worker = WorkerThread::spawn(database, cache.batching_options(), config.clone())?;
        worker.init(WorkerCommand::InitQueues {
            main_to_worker: to_worker.shared_buffer(),
            main_to_worker_capacity_bytes: capacity,
            worker_to_main: from_worker.shared_buffer(),
            worker_to_main_capacity_bytes: capacity,
        })?;

        Ok(Self {
            config,
            worker,
            pending: Some(Queues {
                to_worker,
                from_worker,
            }),
            queues: None,
        })
    }

    /// Wait until the worker is serving requests
    ///
    /// Fails with [`Error::Init`] if the worker reports an init failure or
    /// exits first.
    pub async fn wait_ready(&mut self) -> Result<()> {
        if self.is_ready() {
            return Ok(());
        }

        loop {
            match self.worker.next_event().await {
                Some(event) => {
                    if self.handle_event(&event)? {
                        return Ok(());
                    }
                }
                None => return Err(Error::Init("worker exited before becoming ready".into())),
            }
        }
    }

    /// Apply a lifecycle event; returns whether the worker just became ready
    fn handle_event(&mut self, event: &WorkerEvent) -> Result<bool> {
        match event {
            WorkerEvent::Ready => {
                if let Some(queues) = self.pending.take() {
                    self.queues = Some(queues);
                }
                info!("worker is ready");
                Ok(true)
            }
            WorkerEvent::InitFailed { error } => Err(Error::Init(error.clone())),
            WorkerEvent::ProcessingError { error } => {
                warn!(error = %error, "worker reported a processing error");
                Ok(false)
            }
        }
    }

    /// Whether the worker reported ready
    pub fn is_ready(&self) -> bool {
        self.queues.is_some()
    }

    fn queues(&self) -> Result<&Queues> {
        self.queues
            .as_ref()
            .ok_or_else(|| Error::Init("worker queues are not ready".into()))
    }

    /// Request ids from the worker
    ///
    /// Returns `Ok(false)` when the queue stayed full for the whole enqueue
    /// timeout.
    pub fn send(&self, ids: &[String]) -> Result<bool> {
        let queues = self.queues()?;
        if ids.is_empty() {
            return Ok(true);
        }
        Ok(queues.to_worker.enqueue(ids, Some(self.config.enqueue_timeout_ms)))
    }

    /// Collect whatever results arrived, waiting at most the poll timeout
    pub fn poll_results(&self) -> Result<Vec<Item>> {
        let queues = self.queues()?;
        Ok(queues
            .from_worker
            .dequeue(self.config.poll_batch_size, Some(self.config.poll_timeout_ms)))
    }

    /// Drain lifecycle events that arrived since the last call
    ///
    /// Processing errors are returned to the caller; an init failure is an
    /// error.
    pub fn poll_events(&mut self) -> Result<Vec<WorkerEvent>> {
        let mut events = Vec::new();
        while let Some(event) = self.worker.try_event() {
            self.handle_event(&event)?;
            events.push(event);
        }
        Ok(events)
    }

    /// Stop the worker and wait for its thread to exit
    pub fn dispose(mut self) {
        self.worker.shutdown();
        info!("worker manager disposed");
    }
}
