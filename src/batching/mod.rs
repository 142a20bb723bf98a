//! Size and time bounded batch collector
//!
//! Items added to a [`BatchingQueue`] accumulate until either
//! `batch_max_size` items are pending or `batch_max_wait` has elapsed since
//! the first of them arrived. The batch is then handed to the processor on a
//! spawned task and a new cycle can start straight away, so several flushes
//! may run at once unless a concurrency cap is configured.
//!
//! Must be used from within a tokio runtime.

use crate::error::{Error, Result};
use crate::item::Item;
use futures::future::BoxFuture;
use futures::FutureExt;
use parking_lot::Mutex;
use std::future::Future;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

/// Key used for lookups into pending items
pub trait BatchKey {
    /// Identity of this item
    fn batch_key(&self) -> &str;
}

impl BatchKey for String {
    fn batch_key(&self) -> &str {
        self
    }
}

impl BatchKey for Item {
    fn batch_key(&self) -> &str {
        &self.base_id
    }
}

/// Flush thresholds for a [`BatchingQueue`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchingOptions {
    /// Flush as soon as this many items are pending
    pub batch_max_size: usize,
    /// Flush this long after the first pending item arrived
    pub batch_max_wait: Duration,
    /// Upper bound on processors running at once; `None` is unbounded
    pub max_concurrent_flushes: Option<usize>,
}

impl BatchingOptions {
    /// Options without a concurrency cap
    pub fn new(batch_max_size: usize, batch_max_wait: Duration) -> Self {
        Self {
            batch_max_size,
            batch_max_wait,
            max_concurrent_flushes: None,
        }
    }

    /// Cap the number of concurrently running processors
    pub fn with_max_concurrent_flushes(mut self, limit: usize) -> Self {
        self.max_concurrent_flushes = Some(limit);
        self
    }

    fn validate(&self) -> Result<()> {
        if self.batch_max_size == 0 {
            return Err(Error::Config("batch_max_size must be positive".into()));
        }
        if self.batch_max_wait.is_zero() {
            return Err(Error::Config("batch_max_wait must be positive".into()));
        }
        if self.max_concurrent_flushes == Some(0) {
            return Err(Error::Config("max_concurrent_flushes must be positive".into()));
        }
        Ok(())
    }
}

type Processor<T> = Arc<dyn Fn(Vec<T>) -> BoxFuture<'static, Result<()>> + Send + Sync>;

struct State<T> {
    pending: Vec<T>,
    timer: Option<JoinHandle<()>>,
    /// Bumped whenever the armed timer is superseded
    generation: u64,
    flushes: Vec<JoinHandle<()>>,
    closed: bool,
}

/// First processor failure over the queue's lifetime
enum Failure {
    None,
    /// Not yet returned by `finish`
    Pending(Error),
    /// Already returned once; later calls report its message
    Reported(String),
}

struct Inner<T> {
    options: BatchingOptions,
    processor: Processor<T>,
    permits: Option<Arc<Semaphore>>,
    state: Mutex<State<T>>,
    failure: Mutex<Failure>,
}

/// Async batch collector
pub struct BatchingQueue<T> {
    inner: Arc<Inner<T>>,
}

impl<T> std::fmt::Debug for BatchingQueue<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("BatchingQueue")
            .field("options", &self.inner.options)
            .field("pending", &state.pending.len())
            .field("closed", &state.closed)
            .finish()
    }
}

impl<T: Send + 'static> BatchingQueue<T> {
    /// Create a queue feeding batches to `processor`
    pub fn new<F, Fut>(options: BatchingOptions, processor: F) -> Result<Self>
    where
        F: Fn(Vec<T>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        options.validate()?;

        let processor: Processor<T> = Arc::new(move |batch| processor(batch).boxed());
        let permits = options
            .max_concurrent_flushes
            .map(|limit| Arc::new(Semaphore::new(limit)));

        Ok(Self {
            inner: Arc::new(Inner {
                options,
                processor,
                permits,
                state: Mutex::new(State {
                    pending: Vec::new(),
                    timer: None,
                    generation: 0,
                    flushes: Vec::new(),
                    closed: false,
                }),
                failure: Mutex::new(Failure::None),
            }),
        })
    }

    /// Thresholds this queue was built with
    pub fn options(&self) -> &BatchingOptions {
        &self.inner.options
    }

    /// Accept an item
    ///
    /// Returns `false` once the queue was finished or disposed.
    pub fn add(&self, item: T) -> bool {
        let mut state = self.inner.state.lock();
        if state.closed {
            warn!("batching queue is closed, item rejected");
            return false;
        }

        state.pending.push(item);

        if state.pending.len() >= self.inner.options.batch_max_size {
            cancel_timer(&mut state);
            let batch = std::mem::take(&mut state.pending);
            Inner::spawn_flush(&self.inner, &mut state, batch);
        } else if state.pending.len() == 1 {
            Inner::arm_timer(&self.inner, &mut state);
        }
        true
    }

    /// Flush what is pending and wait for every flush to complete
    ///
    /// Further adds are rejected. Returns the first processor error seen
    /// over the queue's lifetime, after all flushes have settled. Once that
    /// error was returned, later calls fail with [`Error::Task`] carrying its
    /// message.
    pub async fn finish(&self) -> Result<()> {
        let flushes = {
            let mut state = self.inner.state.lock();
            state.closed = true;
            cancel_timer(&mut state);

            let batch = std::mem::take(&mut state.pending);
            if !batch.is_empty() {
                Inner::spawn_flush(&self.inner, &mut state, batch);
            }
            std::mem::take(&mut state.flushes)
        };

        for flush in flushes {
            if let Err(e) = flush.await {
                self.inner.record_failure(e.into());
            }
        }

        let mut failure = self.inner.failure.lock();
        match std::mem::replace(&mut *failure, Failure::None) {
            Failure::None => Ok(()),
            Failure::Pending(e) => {
                *failure = Failure::Reported(e.to_string());
                Err(e)
            }
            Failure::Reported(message) => {
                *failure = Failure::Reported(message.clone());
                Err(Error::Task(message))
            }
        }
    }

    /// Stop accepting items and drop whatever is pending
    ///
    /// Flushes already running are left to complete.
    pub fn dispose(&self) {
        let mut state = self.inner.state.lock();
        state.closed = true;
        cancel_timer(&mut state);

        let dropped = state.pending.len();
        state.pending.clear();
        if dropped > 0 {
            warn!(dropped, "batching queue disposed with pending items");
        }
    }

    /// Number of pending items
    pub fn len(&self) -> usize {
        self.inner.state.lock().pending.len()
    }

    /// Whether nothing is pending
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of flushes still running
    pub fn in_flight(&self) -> usize {
        let state = self.inner.state.lock();
        state.flushes.iter().filter(|flush| !flush.is_finished()).count()
    }

    /// Whether `finish` or `dispose` has been called
    pub fn is_closed(&self) -> bool {
        self.inner.state.lock().closed
    }
}

impl<T: BatchKey + Clone + Send + 'static> BatchingQueue<T> {
    /// Look up a pending item by key
    pub fn get(&self, key: &str) -> Option<T> {
        let state = self.inner.state.lock();
        state
            .pending
            .iter()
            .find(|item| item.batch_key() == key)
            .cloned()
    }
}

impl<T: Send + 'static> Inner<T> {
    fn arm_timer(this: &Arc<Self>, state: &mut State<T>) {
        state.generation = state.generation.wrapping_add(1);
        let generation = state.generation;
        let wait = this.options.batch_max_wait;
        let weak = Arc::downgrade(this);

        state.timer = Some(tokio::spawn(async move {
            tokio::time::sleep(wait).await;
            Self::on_timer(weak, generation);
        }));
    }

    fn on_timer(weak: Weak<Self>, generation: u64) {
        let Some(this) = weak.upgrade() else {
            return;
        };
        let mut state = this.state.lock();
        if state.closed || state.generation != generation {
            return;
        }

        state.timer = None;
        let batch = std::mem::take(&mut state.pending);
        if !batch.is_empty() {
            Self::spawn_flush(&this, &mut state, batch);
        }
    }

    /// Drop finished flush handles, keeping any panic they ended with
    fn reap(&self, state: &mut State<T>) {
        let mut running = Vec::with_capacity(state.flushes.len());
        for mut flush in state.flushes.drain(..) {
            if !flush.is_finished() {
                running.push(flush);
                continue;
            }
            match (&mut flush).now_or_never() {
                Some(Ok(())) => {}
                Some(Err(e)) => self.record_failure(e.into()),
                None => running.push(flush),
            }
        }
        state.flushes = running;
    }

    fn spawn_flush(this: &Arc<Self>, state: &mut State<T>, batch: Vec<T>) {
        this.reap(state);

        debug!(items = batch.len(), in_flight = state.flushes.len(), "flushing batch");
        let inner = Arc::clone(this);
        state.flushes.push(tokio::spawn(async move {
            let _permit = match &inner.permits {
                Some(permits) => match Arc::clone(permits).acquire_owned().await {
                    Ok(permit) => Some(permit),
                    Err(_) => {
                        inner.record_failure(Error::Disposed("batching queue"));
                        return;
                    }
                },
                None => None,
            };

            if let Err(e) = (inner.processor)(batch).await {
                inner.record_failure(e);
            }
        }));
    }

    fn record_failure(&self, e: Error) {
        error!(error = %e, "batch processor failed");
        let mut failure = self.failure.lock();
        if matches!(*failure, Failure::None) {
            *failure = Failure::Pending(e);
        }
    }
}

fn cancel_timer<T>(state: &mut State<T>) {
    state.generation = state.generation.wrapping_add(1);
    if let Some(timer) = state.timer.take() {
        timer.abort();
    }
}
