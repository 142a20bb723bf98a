//! Blocking byte ring buffer over a shared region
//!
//! The region is laid out as a [`ControlBlock`] followed by `capacity` data
//! bytes. The control block holds:
//!
//! - the write sequence, advanced only by the producing end
//! - the read sequence, advanced only by the consuming end
//! - a diagnostic state flag
//!
//! Sequences increase monotonically and are reduced modulo the capacity to
//! get a physical offset, so `occupied = write_seq - read_seq` and the whole
//! data area is usable. Each cursor is cache-line padded so the two ends do
//! not false-share.
//!
//! `push` and `shift` block on the region's wait/notify signal with an
//! optional timeout. A timeout is a normal outcome reported as `false` or
//! `None`, never as an error.

use crate::error::{Error, Result};
use crate::shared::{SharedBuffer, SharedRegion};
use crossbeam_utils::CachePadded;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tracing::error;

/// Diagnostic state recorded in the control block
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum RingBufferState {
    /// No readable data
    Empty = 0,
    /// Data available with room to spare
    Ready = 1,
    /// Every data byte is occupied, or a writer is waiting for space
    Full = 2,
    /// A push larger than the whole buffer was rejected
    Overflow = 3,
}

impl RingBufferState {
    fn from_raw(raw: u32) -> Self {
        match raw {
            1 => RingBufferState::Ready,
            2 => RingBufferState::Full,
            3 => RingBufferState::Overflow,
            _ => RingBufferState::Empty,
        }
    }
}

/// Control block stored at the start of the shared region
#[repr(C)]
pub(crate) struct ControlBlock {
    /// Total bytes ever written
    write_seq: CachePadded<AtomicU64>,
    /// Total bytes ever read
    read_seq: CachePadded<AtomicU64>,
    /// Last recorded [`RingBufferState`]
    state: CachePadded<AtomicU32>,
}

impl ControlBlock {
    /// Size of the control block in bytes
    pub const SIZE: usize = std::mem::size_of::<Self>();
}

/// Fixed-capacity byte ring shared between two threads
///
/// One end pushes and the other shifts. Both ends hold their own
/// `RingBuffer` over the same [`SharedBuffer`].
pub struct RingBuffer {
    /// Region holding the control block and the data bytes
    shared: SharedBuffer,
    /// Data capacity in bytes
    capacity: usize,
}

impl RingBuffer {
    /// Bytes needed in a region backing a ring of `capacity_bytes`
    pub fn required_bytes(capacity_bytes: usize) -> usize {
        ControlBlock::SIZE + capacity_bytes
    }

    /// Allocate a new shared region and initialize an empty ring in it
    pub fn create(capacity_bytes: usize) -> Result<Self> {
        if capacity_bytes == 0 {
            return Err(Error::Config("ring buffer capacity must be positive".into()));
        }

        let shared = SharedRegion::allocate(Self::required_bytes(capacity_bytes))?;
        let ring = Self {
            shared,
            capacity: capacity_bytes,
        };

        let control = ring.control();
        control.write_seq.store(0, Ordering::SeqCst);
        control.read_seq.store(0, Ordering::SeqCst);
        control.state.store(RingBufferState::Empty as u32, Ordering::SeqCst);

        Ok(ring)
    }

    /// Attach to a ring that the peer created, keeping its cursors
    pub fn from_existing(shared: SharedBuffer, capacity_bytes: usize) -> Result<Self> {
        if capacity_bytes == 0 {
            return Err(Error::Config("ring buffer capacity must be positive".into()));
        }

        let required = Self::required_bytes(capacity_bytes);
        if shared.byte_len() < required {
            return Err(Error::Init(format!(
                "Provided shared buffer is too small. Expected at least {} bytes for {} bytes of capacity, but got {} bytes.",
                required,
                capacity_bytes,
                shared.byte_len()
            )));
        }

        Ok(Self {
            shared,
            capacity: capacity_bytes,
        })
    }

    /// Handle to the backing region, to hand to the peer thread
    pub fn shared_buffer(&self) -> SharedBuffer {
        self.shared.clone()
    }

    /// Data capacity in bytes
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of bytes currently stored
    pub fn len(&self) -> usize {
        let control = self.control();
        // Read cursor first: the write cursor can only be ahead of it
        let read_seq = control.read_seq.load(Ordering::Acquire);
        let write_seq = control.write_seq.load(Ordering::Acquire);
        write_seq.saturating_sub(read_seq) as usize
    }

    /// Number of bytes that can be pushed without blocking
    pub fn available_space(&self) -> usize {
        self.capacity - self.len().min(self.capacity)
    }

    /// Whether no bytes are stored
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether every data byte is occupied
    pub fn is_full(&self) -> bool {
        self.len() >= self.capacity
    }

    /// Last recorded diagnostic state
    pub fn state(&self) -> RingBufferState {
        RingBufferState::from_raw(self.control().state.load(Ordering::Acquire))
    }

    /// Write all of `data`, blocking until there is room or the timeout elapses
    ///
    /// `timeout_ms` of `None` waits indefinitely. Returns `false` if the
    /// timeout elapsed or `data` can never fit; nothing is written in that
    /// case.
    pub fn push(&self, data: &[u8], timeout_ms: Option<u64>) -> bool {
        self.push_parts(&[data], timeout_ms)
    }

    /// Write several slices back to back as one all-or-nothing push
    ///
    /// The reader observes either none or all of the parts.
    pub fn push_parts(&self, parts: &[&[u8]], timeout_ms: Option<u64>) -> bool {
        let total: usize = parts.iter().map(|part| part.len()).sum();
        if total == 0 {
            return true;
        }
        if total > self.capacity {
            error!(
                len = total,
                capacity = self.capacity,
                "data to push exceeds ring buffer capacity"
            );
            self.set_state(RingBufferState::Overflow);
            return false;
        }

        let deadline = deadline_after(timeout_ms);
        let control = self.control();

        loop {
            let write_seq = control.write_seq.load(Ordering::Acquire);
            let read_seq = control.read_seq.load(Ordering::Acquire);
            let occupied = (write_seq - read_seq) as usize;

            if self.capacity - occupied >= total {
                let mut seq = write_seq;
                for part in parts {
                    self.copy_in(seq, part);
                    seq += part.len() as u64;
                }

                control.write_seq.store(seq, Ordering::Release);
                self.set_state(if (seq - read_seq) as usize == self.capacity {
                    RingBufferState::Full
                } else {
                    RingBufferState::Ready
                });

                // Wake a reader blocked on the write cursor
                self.shared.notify();
                return true;
            }

            self.set_state(RingBufferState::Full);
            if expired(deadline) {
                return false;
            }

            // Space appears when the reader moves its cursor
            self.shared.wait(&control.read_seq, read_seq, deadline);
        }
    }

    /// Remove exactly `count` bytes, blocking until available or the timeout elapses
    ///
    /// Returns `None` on timeout, leaving the buffer untouched.
    pub fn shift(&self, count: usize, timeout_ms: Option<u64>) -> Option<Vec<u8>> {
        if count == 0 {
            return Some(Vec::new());
        }
        if count > self.capacity {
            error!(
                count,
                capacity = self.capacity,
                "requested more bytes than the ring buffer can hold"
            );
            return None;
        }

        let deadline = deadline_after(timeout_ms);
        let control = self.control();

        loop {
            let read_seq = control.read_seq.load(Ordering::Acquire);
            let write_seq = control.write_seq.load(Ordering::Acquire);
            let occupied = (write_seq - read_seq) as usize;

            if occupied >= count {
                let data = self.copy_out(read_seq, count);

                let next = read_seq + count as u64;
                control.read_seq.store(next, Ordering::Release);
                self.set_state(if next == write_seq {
                    RingBufferState::Empty
                } else {
                    RingBufferState::Ready
                });

                // Wake a writer blocked on the read cursor
                self.shared.notify();
                return Some(data);
            }

            if expired(deadline) {
                return None;
            }

            // Data appears when the writer moves its cursor
            self.shared.wait(&control.write_seq, write_seq, deadline);
        }
    }

    fn control(&self) -> &ControlBlock {
        // SAFETY: the region is at least `required_bytes(capacity)` long and
        // the control block consists only of atomics.
        unsafe { self.shared.header::<ControlBlock>() }
    }

    fn set_state(&self, state: RingBufferState) {
        self.control().state.store(state as u32, Ordering::Release);
    }

    fn data_ptr(&self, offset: usize) -> *mut u8 {
        self.shared.ptr_at(ControlBlock::SIZE + offset)
    }

    /// Copy `data` in at sequence `seq`, splitting at the end of the data area
    fn copy_in(&self, seq: u64, data: &[u8]) {
        if data.is_empty() {
            return;
        }
        let offset = (seq % self.capacity as u64) as usize;
        let first = data.len().min(self.capacity - offset);

        // SAFETY: the bytes in [offset, offset + len) modulo capacity are free,
        // so the reader is not touching them until the write cursor moves.
        unsafe {
            std::ptr::copy_nonoverlapping(data.as_ptr(), self.data_ptr(offset), first);
            if first < data.len() {
                std::ptr::copy_nonoverlapping(
                    data.as_ptr().add(first),
                    self.data_ptr(0),
                    data.len() - first,
                );
            }
        }
    }

    /// Copy `count` bytes out from sequence `seq`, joining across the wrap
    fn copy_out(&self, seq: u64, count: usize) -> Vec<u8> {
        let offset = (seq % self.capacity as u64) as usize;
        let first = count.min(self.capacity - offset);
        let mut data = vec![0u8; count];

        // SAFETY: the bytes were published by the writer before it advanced
        // the write cursor, and it will not reuse them until we advance ours.
        unsafe {
            std::ptr::copy_nonoverlapping(self.data_ptr(offset), data.as_mut_ptr(), first);
            if first < count {
                std::ptr::copy_nonoverlapping(
                    self.data_ptr(0),
                    data.as_mut_ptr().add(first),
                    count - first,
                );
            }
        }

        data
    }
}

impl std::fmt::Debug for RingBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RingBuffer")
            .field("capacity", &self.capacity)
            .field("len", &self.len())
            .field("state", &self.state())
            .finish()
    }
}

fn deadline_after(timeout_ms: Option<u64>) -> Option<Instant> {
    timeout_ms.and_then(|ms| Instant::now().checked_add(Duration::from_millis(ms)))
}

fn expired(deadline: Option<Instant>) -> bool {
    matches!(deadline, Some(deadline) if Instant::now() >= deadline)
}
