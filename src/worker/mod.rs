//! Worker thread offload
//!
//! The worker runs on its own OS thread with a private single-threaded tokio
//! runtime and its own [`Cache`]. It talks to the main side over two ring
//! buffer queues, one per direction:
//!
//! - main to worker: requested ids ([`StringQueue`])
//! - worker to main: resolved items or placeholders ([`ItemQueue`])
//!
//! The queues are created by the main side and handed over once with
//! [`WorkerCommand::InitQueues`]. Lifecycle is reported back as
//! [`WorkerEvent`]s.

pub mod manager;

pub use manager::WorkerManager;

use crate::batching::BatchingOptions;
use crate::cache::{Cache, Database};
use crate::config::WorkerConfig;
use crate::error::{Error, Result};
use crate::item::Item;
use crate::queue::typed::{ItemQueue, StringQueue};
use crate::queue::QueueSide;
use crate::shared::SharedBuffer;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tokio::runtime::Runtime;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};

/// Message sent from the main side to a starting worker
#[derive(Debug)]
pub enum WorkerCommand {
    /// Attach to the queues created by the main side
    InitQueues {
        /// Region of the main to worker queue
        main_to_worker: SharedBuffer,
        /// Data capacity of the main to worker queue
        main_to_worker_capacity_bytes: usize,
        /// Region of the worker to main queue
        worker_to_main: SharedBuffer,
        /// Data capacity of the worker to main queue
        worker_to_main_capacity_bytes: usize,
    },
}

/// Lifecycle notification from the worker
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerEvent {
    /// Both queues are attached and requests are being served
    Ready,
    /// The worker could not start and has exited
    InitFailed {
        /// Why
        error: String,
    },
    /// A request could not be served; the worker keeps running
    ProcessingError {
        /// Why
        error: String,
    },
}

/// Handle to a running worker thread
///
/// Dropping the handle stops the worker and joins its thread.
#[derive(Debug)]
pub struct WorkerThread {
    commands: Option<oneshot::Sender<WorkerCommand>>,
    events: mpsc::UnboundedReceiver<WorkerEvent>,
    stop: Arc<AtomicBool>,
    join: Option<JoinHandle<()>>,
}

impl WorkerThread {
    /// Start a worker serving lookups from `database`
    ///
    /// The worker waits for [`WorkerCommand::InitQueues`] before doing
    /// anything else.
    pub fn spawn(database: Arc<dyn Database>, cache_options: BatchingOptions, config: WorkerConfig) -> Result<Self> {
        let (command_tx, command_rx) = oneshot::channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let stop = Arc::new(AtomicBool::new(false));

        let host = Host {
            database,
            cache_options,
            config,
            events: event_tx,
            stop: Arc::clone(&stop),
        };
        let join = thread::Builder::new()
            .name("object-loader-worker".to_string())
            .spawn(move || host.run(command_rx))?;

        Ok(Self {
            commands: Some(command_tx),
            events: event_rx,
            stop,
            join: Some(join),
        })
    }

    /// Send the one-time init command
    pub fn init(&mut self, command: WorkerCommand) -> Result<()> {
        let sender = self
            .commands
            .take()
            .ok_or_else(|| Error::Init("worker was already initialized".into()))?;
        sender
            .send(command)
            .map_err(|_| Error::Init("worker exited before initialization".into()))
    }

    /// Wait for the next lifecycle event; `None` once the worker exited
    pub async fn next_event(&mut self) -> Option<WorkerEvent> {
        self.events.recv().await
    }

    /// Next lifecycle event if one is already waiting
    pub fn try_event(&mut self) -> Option<WorkerEvent> {
        self.events.try_recv().ok()
    }

    /// Ask the worker to stop and wait for it to exit
    pub fn shutdown(&mut self) {
        self.stop.store(true, Ordering::Release);
        self.commands.take();
        if let Some(join) = self.join.take() {
            if join.join().is_err() {
                error!("worker thread panicked");
            }
        }
    }
}

impl Drop for WorkerThread {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Everything the worker thread owns
struct Host {
    database: Arc<dyn Database>,
    cache_options: BatchingOptions,
    config: WorkerConfig,
    events: mpsc::UnboundedSender<WorkerEvent>,
    stop: Arc<AtomicBool>,
}

impl Host {
    fn emit(&self, event: WorkerEvent) {
        if self.events.send(event).is_err() {
            debug!("main side stopped listening for worker events");
        }
    }

    fn fail_init(&self, e: Error) {
        error!(error = %e, "worker failed to initialize");
        self.emit(WorkerEvent::InitFailed {
            error: e.to_string(),
        });
    }

    fn run(self, commands: oneshot::Receiver<WorkerCommand>) {
        let Ok(command) = commands.blocking_recv() else {
            debug!("worker dropped before initialization");
            return;
        };

        let runtime = match tokio::runtime::Builder::new_current_thread().enable_time().build() {
            Ok(runtime) => runtime,
            Err(e) => return self.fail_init(e.into()),
        };
        let (inbound, outbound) = match attach(command) {
            Ok(queues) => queues,
            Err(e) => return self.fail_init(e),
        };
        let cache = match Cache::with_options(Arc::clone(&self.database), self.cache_options) {
            Ok(cache) => cache,
            Err(e) => return self.fail_init(e),
        };

        info!("worker ready");
        self.emit(WorkerEvent::Ready);
        self.serve(&runtime, &cache, &inbound, &outbound);

        if let Err(e) = runtime.block_on(cache.dispose()) {
            warn!(error = %e, "worker cache did not shut down cleanly");
        }
        info!("worker stopped");
    }

    fn serve(&self, runtime: &Runtime, cache: &Cache, inbound: &StringQueue, outbound: &ItemQueue) {
        while !self.stop.load(Ordering::Acquire) {
            let ids = inbound.dequeue(self.config.poll_batch_size, Some(self.config.poll_timeout_ms));
            if ids.is_empty() {
                continue;
            }
            debug!(ids = ids.len(), "worker resolving ids");

            let found = match runtime.block_on(cache.get_all(&ids)) {
                Ok(found) => found,
                Err(e) => {
                    error!(error = %e, "worker cache lookup failed");
                    self.emit(WorkerEvent::ProcessingError {
                        error: e.to_string(),
                    });
                    continue;
                }
            };

            for (id, item) in ids.into_iter().zip(found) {
                let item = match item {
                    Some(item) if outbound.fits(&item) => item,
                    Some(_) => {
                        warn!(base_id = %id, "item larger than the result queue, returning placeholder");
                        Item::placeholder(id)
                    }
                    None => Item::placeholder(id),
                };
                self.send_result(outbound, item);
            }
        }
    }

    /// Push one result, reporting it if the main side never made room
    fn send_result(&self, outbound: &ItemQueue, item: Item) {
        if outbound.enqueue(std::slice::from_ref(&item), Some(self.config.enqueue_timeout_ms)) {
            return;
        }
        error!(base_id = %item.base_id, "result queue stayed full, item not returned");
        self.emit(WorkerEvent::ProcessingError {
            error: format!("failed to return {} to the main side", item.base_id),
        });
    }
}

fn attach(command: WorkerCommand) -> Result<(StringQueue, ItemQueue)> {
    let WorkerCommand::InitQueues {
        main_to_worker,
        main_to_worker_capacity_bytes,
        worker_to_main,
        worker_to_main_capacity_bytes,
    } = command;

    let inbound = StringQueue::from_existing(main_to_worker, main_to_worker_capacity_bytes, QueueSide::Worker)?;
    let outbound = ItemQueue::from_existing(worker_to_main, worker_to_main_capacity_bytes, QueueSide::Worker)?;
    Ok((inbound, outbound))
}
