//! Length-prefixed message queue over a [`RingBuffer`]
//!
//! Every message is written as a little-endian `u32` length followed by the
//! payload bytes. A length of zero is a real, empty message.
//!
//! Structural corruption (a truncated prefix, a declared length larger than
//! the buffer, a truncated payload) is logged and ends the current dequeue;
//! whatever was decoded before that point is still returned and the queue
//! stays usable.

pub mod typed;

use crate::error::Result;
use crate::ring::RingBuffer;
use crate::shared::SharedBuffer;
use tracing::{error, warn};

/// Size of the length prefix in bytes
pub const LENGTH_PREFIX_BYTES: usize = 4;

/// Bounded wait used by the main side so it never stalls its thread for long
pub const MAIN_SIDE_TIMEOUT_MS: u64 = 50;

/// Which end of the worker pair owns a queue handle
///
/// Both sides share the wire format and decoding algorithm; they differ only
/// in how long they are willing to block by default.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueSide {
    /// The coordinating thread; polls with short bounded waits
    Main,
    /// The dedicated worker thread; may block indefinitely
    Worker,
}

impl QueueSide {
    /// Default timeout for this side, `None` meaning unbounded
    pub fn default_timeout_ms(self) -> Option<u64> {
        match self {
            QueueSide::Main => Some(MAIN_SIDE_TIMEOUT_MS),
            QueueSide::Worker => None,
        }
    }
}

/// Framed message queue over a shared ring buffer
#[derive(Debug)]
pub struct RingBufferQueue {
    ring: RingBuffer,
    side: QueueSide,
}

impl RingBufferQueue {
    /// Create a queue over a freshly allocated ring of `capacity_bytes`
    pub fn create(capacity_bytes: usize, side: QueueSide) -> Result<Self> {
        Ok(Self {
            ring: RingBuffer::create(capacity_bytes)?,
            side,
        })
    }

    /// Attach to a queue the peer created
    pub fn from_existing(shared: SharedBuffer, capacity_bytes: usize, side: QueueSide) -> Result<Self> {
        Ok(Self {
            ring: RingBuffer::from_existing(shared, capacity_bytes)?,
            side,
        })
    }

    /// Handle to the backing region, to hand to the peer thread
    pub fn shared_buffer(&self) -> SharedBuffer {
        self.ring.shared_buffer()
    }

    /// Data capacity of the underlying ring in bytes
    pub fn capacity(&self) -> usize {
        self.ring.capacity()
    }

    /// Which side this handle belongs to
    pub fn side(&self) -> QueueSide {
        self.side
    }

    /// Default timeout for this handle's side
    pub fn default_timeout_ms(&self) -> Option<u64> {
        self.side.default_timeout_ms()
    }

    /// Underlying ring, for occupancy queries
    pub fn ring(&self) -> &RingBuffer {
        &self.ring
    }

    /// Push every item as a framed message
    ///
    /// Returns `false` as soon as one item cannot be written (timeout, or a
    /// framed size larger than the whole buffer). Items pushed before the
    /// failing one stay queued. An item that can never fit is rejected before
    /// any of its bytes are written.
    pub fn enqueue<B: AsRef<[u8]>>(&self, items: &[B], timeout_ms: Option<u64>) -> bool {
        for item in items {
            let payload = item.as_ref();
            let framed = LENGTH_PREFIX_BYTES + payload.len();

            if framed > self.ring.capacity() || payload.len() > u32::MAX as usize {
                error!(
                    framed,
                    capacity = self.ring.capacity(),
                    "message exceeds queue capacity, rejected"
                );
                return false;
            }

            // Prefix and payload land in one push so a timeout never leaves
            // a dangling length prefix behind
            let prefix = (payload.len() as u32).to_le_bytes();
            if !self.ring.push_parts(&[&prefix[..], payload], timeout_ms) {
                warn!(framed, "enqueue timed out waiting for space");
                return false;
            }
        }
        true
    }

    /// Pop up to `max_items` framed messages
    ///
    /// Stops early, returning what was decoded so far, when no further
    /// prefix arrives within the timeout or the stream is corrupt.
    pub fn dequeue(&self, max_items: usize, timeout_ms: Option<u64>) -> Vec<Vec<u8>> {
        let mut messages = Vec::new();

        for _ in 0..max_items {
            let prefix = match self.ring.shift(LENGTH_PREFIX_BYTES, timeout_ms) {
                Some(prefix) => prefix,
                None => break,
            };
            let prefix: [u8; LENGTH_PREFIX_BYTES] = match prefix.as_slice().try_into() {
                Ok(prefix) => prefix,
                Err(_) => {
                    error!(got = prefix.len(), "truncated length prefix, aborting dequeue");
                    break;
                }
            };

            let len = u32::from_le_bytes(prefix) as usize;
            if len == 0 {
                messages.push(Vec::new());
                continue;
            }
            if len > self.ring.capacity() {
                error!(
                    len,
                    capacity = self.ring.capacity(),
                    "declared message length exceeds capacity, aborting dequeue"
                );
                break;
            }

            match self.ring.shift(len, timeout_ms) {
                Some(payload) => messages.push(payload),
                None => {
                    error!(len, "message payload incomplete, aborting dequeue");
                    break;
                }
            }
        }

        messages
    }
}
