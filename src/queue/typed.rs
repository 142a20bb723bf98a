//! Typed adapters over [`RingBufferQueue`]
//!
//! A [`MessageCodec`] turns values into message payloads and back.
//! Encoding problems make `enqueue` fail before anything is written;
//! decoding problems drop only the affected message.

use crate::error::Result;
use crate::item::Item;
use crate::queue::{QueueSide, RingBufferQueue, LENGTH_PREFIX_BYTES};
use crate::shared::SharedBuffer;
use std::marker::PhantomData;
use tracing::{error, warn};

/// Converts values to and from queue payloads
pub trait MessageCodec {
    /// Value carried by each message
    type Value;

    /// Encode a value into a payload
    fn encode(value: &Self::Value) -> Result<Vec<u8>>;

    /// Decode a payload into a value
    fn decode(payload: &[u8]) -> Result<Self::Value>;
}

/// UTF-8 string payloads
#[derive(Debug)]
pub struct Utf8Codec;

impl MessageCodec for Utf8Codec {
    type Value = String;

    fn encode(value: &String) -> Result<Vec<u8>> {
        Ok(value.as_bytes().to_vec())
    }

    fn decode(payload: &[u8]) -> Result<String> {
        String::from_utf8(payload.to_vec())
            .map_err(|e| crate::Error::Protocol(format!("message is not valid UTF-8: {e}")))
    }
}

/// JSON-then-UTF-8 [`Item`] payloads
#[derive(Debug)]
pub struct ItemCodec;

impl MessageCodec for ItemCodec {
    type Value = Item;

    fn encode(value: &Item) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(value)?)
    }

    fn decode(payload: &[u8]) -> Result<Item> {
        Ok(serde_json::from_slice(payload)?)
    }
}

/// Queue of typed values
#[derive(Debug)]
pub struct TypedQueue<C: MessageCodec> {
    inner: RingBufferQueue,
    _codec: PhantomData<C>,
}

/// Queue carrying UTF-8 strings
pub type StringQueue = TypedQueue<Utf8Codec>;

/// Queue carrying [`Item`]s
pub type ItemQueue = TypedQueue<ItemCodec>;

impl<C: MessageCodec> TypedQueue<C> {
    /// Wrap an existing byte queue
    pub fn new(inner: RingBufferQueue) -> Self {
        Self {
            inner,
            _codec: PhantomData,
        }
    }

    /// Create a queue over a freshly allocated ring
    pub fn create(capacity_bytes: usize, side: QueueSide) -> Result<Self> {
        Ok(Self::new(RingBufferQueue::create(capacity_bytes, side)?))
    }

    /// Attach to a queue the peer created
    pub fn from_existing(shared: SharedBuffer, capacity_bytes: usize, side: QueueSide) -> Result<Self> {
        Ok(Self::new(RingBufferQueue::from_existing(shared, capacity_bytes, side)?))
    }

    /// The underlying byte queue
    pub fn raw(&self) -> &RingBufferQueue {
        &self.inner
    }

    /// Handle to the backing region
    pub fn shared_buffer(&self) -> SharedBuffer {
        self.inner.shared_buffer()
    }

    /// Whether `value` could ever be enqueued, i.e. it encodes and its framed
    /// size does not exceed the ring capacity
    pub fn fits(&self, value: &C::Value) -> bool {
        match C::encode(value) {
            Ok(payload) => LENGTH_PREFIX_BYTES + payload.len() <= self.inner.capacity(),
            Err(_) => false,
        }
    }

    /// Encode and push every value
    ///
    /// Returns `false` without writing anything if a value fails to encode,
    /// otherwise behaves like [`RingBufferQueue::enqueue`].
    pub fn enqueue(&self, values: &[C::Value], timeout_ms: Option<u64>) -> bool {
        let mut payloads = Vec::with_capacity(values.len());
        for value in values {
            match C::encode(value) {
                Ok(payload) => payloads.push(payload),
                Err(e) => {
                    error!(error = %e, "failed to encode message, nothing enqueued");
                    return false;
                }
            }
        }
        self.inner.enqueue(&payloads, timeout_ms)
    }

    /// Pop and decode up to `max_items` values
    ///
    /// Messages that fail to decode are logged and skipped.
    pub fn dequeue(&self, max_items: usize, timeout_ms: Option<u64>) -> Vec<C::Value> {
        self.inner
            .dequeue(max_items, timeout_ms)
            .into_iter()
            .filter_map(|payload| match C::decode(&payload) {
                Ok(value) => Some(value),
                Err(e) => {
                    warn!(error = %e, len = payload.len(), "dropping undecodable message");
                    None
                }
            })
            .collect()
    }
}
