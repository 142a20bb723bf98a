//! Shared memory regions for cross-thread ring buffers
//!
//! A [`SharedRegion`] is an anonymous, zero-initialized memory mapping that
//! both ends of a ring buffer attach to. Handles are cheap to clone and can be
//! moved to the peer thread, which makes a region the equivalent of a buffer
//! handed over at worker start-up.
//!
//! Besides the raw bytes, every region carries the wake-up signal used to
//! implement wait/notify on atomic cells that live inside the mapping:
//!
//! - `wait` blocks while a cell still holds an expected value, bounded by an
//!   optional deadline
//! - `notify` wakes every waiter after a cell has been updated
//!
//! The check-then-wait happens under the signal lock, so a notification that
//! races with a waiter going to sleep is never lost.

use crate::error::{Error, Result};
use memmap2::MmapMut;
use parking_lot::{Condvar, Mutex};
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

/// Cloneable handle to a shared region
pub type SharedBuffer = Arc<SharedRegion>;

/// Result of waiting on an atomic cell
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    /// Woken by a notification
    Ok,
    /// The cell no longer held the expected value when the wait started
    NotEqual,
    /// The deadline elapsed before any notification
    TimedOut,
}

/// Anonymous shared memory mapping with an attached wake-up signal
pub struct SharedRegion {
    /// Keeps the mapping alive; all access goes through `base`
    map: MmapMut,
    /// Start of the mapping
    base: NonNull<u8>,
    /// Signal shared by every waiter on this region
    signal: (Mutex<()>, Condvar),
}

// SAFETY: the mapping is owned by the region and outlives every pointer
// handed out from `base`. Concurrent access to the bytes is coordinated by
// the ring buffer protocol through atomics stored inside the mapping.
unsafe impl Send for SharedRegion {}
unsafe impl Sync for SharedRegion {}

impl SharedRegion {
    /// Allocate a new zeroed region of `len` bytes
    ///
    /// Fails with [`Error::Init`] when the platform refuses the mapping.
    pub fn allocate(len: usize) -> Result<SharedBuffer> {
        if len == 0 {
            return Err(Error::Config("shared region length must be positive".into()));
        }

        let mut map = MmapMut::map_anon(len)
            .map_err(|e| Error::Init(format!("unable to map {len} bytes of shared memory: {e}")))?;
        let base = NonNull::new(map.as_mut_ptr())
            .ok_or_else(|| Error::Init("shared memory mapping returned a null pointer".into()))?;

        Ok(Arc::new(Self {
            map,
            base,
            signal: (Mutex::new(()), Condvar::new()),
        }))
    }

    /// Total size of the region in bytes
    pub fn byte_len(&self) -> usize {
        self.map.len()
    }

    /// Raw pointer to `offset` bytes into the region
    ///
    /// # Panics
    ///
    /// Panics if `offset` is past the end of the region
    pub(crate) fn ptr_at(&self, offset: usize) -> *mut u8 {
        assert!(offset <= self.byte_len(), "offset outside of shared region");
        unsafe { self.base.as_ptr().add(offset) }
    }

    /// Reinterpret the start of the region as a `T`
    ///
    /// # Safety
    ///
    /// `T` must be valid for any bit pattern (atomics, integers) and fit in
    /// the region; the region is page aligned so alignment is satisfied for
    /// any `T` with alignment up to the page size.
    pub(crate) unsafe fn header<T>(&self) -> &T {
        assert!(std::mem::size_of::<T>() <= self.byte_len(), "header larger than region");
        &*(self.base.as_ptr() as *const T)
    }

    /// Block while `cell` holds `expected`, until notified or `deadline`
    pub fn wait(&self, cell: &AtomicU64, expected: u64, deadline: Option<Instant>) -> WaitOutcome {
        let (lock, cvar) = &self.signal;
        let mut guard = lock.lock();

        if cell.load(Ordering::Acquire) != expected {
            return WaitOutcome::NotEqual;
        }

        match deadline {
            Some(deadline) => {
                if cvar.wait_until(&mut guard, deadline).timed_out() {
                    WaitOutcome::TimedOut
                } else {
                    WaitOutcome::Ok
                }
            }
            None => {
                cvar.wait(&mut guard);
                WaitOutcome::Ok
            }
        }
    }

    /// Wake every thread blocked in [`SharedRegion::wait`]
    pub fn notify(&self) {
        let (lock, cvar) = &self.signal;
        let _guard = lock.lock();
        cvar.notify_all();
    }
}

impl std::fmt::Debug for SharedRegion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedRegion")
            .field("byte_len", &self.byte_len())
            .finish()
    }
}
