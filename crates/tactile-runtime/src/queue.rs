//! Event Queue - thread-safe ingestion buffer
//!
//! Records are packed back to back into one contiguous byte buffer guarded
//! by a `parking_lot::Mutex`. The critical section of an enqueue is a bounds
//! check, one copy and an id assignment. A drain swaps the whole buffer for
//! the consumer's recycled one, so the consumer never walks records while
//! holding the lock and producers are blocked for one pointer swap at most.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, trace, warn};

use tactile_core::{
    aligned_size, EventBatch, EventHeader, EventId, TactileError, TactileResult, UpdateType,
    EVENT_HEADER_SIZE,
};

/// What happens when an enqueue does not fit the buffer
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverflowPolicy {
    /// Fail the enqueue with `QueueFull`
    #[default]
    Reject,
    /// Double the buffer until the record fits
    Grow,
}

struct QueueInner {
    buffer: Vec<u8>,
    count: usize,
    /// Byte limit for `buffer`
    capacity: usize,
    next_id: EventId,
}

/// Multi-producer, single-consumer queue of packed event records
pub struct EventQueue {
    inner: Mutex<QueueInner>,
    max_record_size: usize,
    overflow: OverflowPolicy,
    closed: AtomicBool,
    enqueued: AtomicU64,
    rejected: AtomicU64,
}

impl EventQueue {
    pub fn new(capacity: usize, max_record_size: usize, overflow: OverflowPolicy) -> Self {
        EventQueue {
            inner: Mutex::new(QueueInner {
                buffer: Vec::with_capacity(capacity),
                count: 0,
                capacity,
                next_id: EventId::new(1),
            }),
            max_record_size,
            overflow,
            closed: AtomicBool::new(false),
            enqueued: AtomicU64::new(0),
            rejected: AtomicU64::new(0),
        }
    }

    /// Enqueue an encoded record. The bytes are copied; the caller may reuse
    /// its buffer as soon as this returns.
    pub fn enqueue(&self, record: &[u8]) -> TactileResult<EventId> {
        let header = EventHeader::parse(record)?;
        let size = header.size as usize;
        self.push(size, |dst| dst.copy_from_slice(&record[..size]))
    }

    /// Enqueue a record from its header and payload without encoding it first
    pub fn enqueue_parts(&self, header: &EventHeader, payload: &[u8]) -> TactileResult<EventId> {
        let size = EVENT_HEADER_SIZE + payload.len();
        let mut header = *header;
        header.size = size as u32;
        self.push(size, |dst| {
            // dst is exactly `size` bytes
            let _ = header.write(dst);
            dst[EVENT_HEADER_SIZE..].copy_from_slice(payload);
        })
    }

    fn push(&self, size: usize, write: impl FnOnce(&mut [u8])) -> TactileResult<EventId> {
        if self.closed.load(Ordering::Acquire) {
            return Err(TactileError::Shutdown);
        }
        if size > self.max_record_size {
            self.rejected.fetch_add(1, Ordering::Relaxed);
            return Err(TactileError::RecordTooLarge {
                size,
                max: self.max_record_size,
            });
        }

        let stride = aligned_size(size);
        let mut inner = self.inner.lock();
        let used = inner.buffer.len();

        if used + stride > inner.capacity {
            match self.overflow {
                OverflowPolicy::Reject => {
                    let available = inner.capacity - used;
                    drop(inner);
                    self.rejected.fetch_add(1, Ordering::Relaxed);
                    warn!(requested = stride, available, "event queue full, rejecting event");
                    return Err(TactileError::QueueFull {
                        requested: stride,
                        available,
                    });
                }
                OverflowPolicy::Grow => {
                    let grown = (inner.capacity * 2).max(used + stride);
                    inner.capacity = grown;
                    inner.buffer.reserve(grown - used);
                }
            }
        }

        let id = inner.next_id;
        let next = id.next();
        // Zero stays unused so a default header never collides with a real id
        inner.next_id = if next == EventId::ZERO { EventId::new(1) } else { next };

        inner.buffer.resize(used + stride, 0);
        let slot = &mut inner.buffer[used..used + size];
        write(slot);
        EventHeader::patch_id(slot, id);
        inner.count += 1;
        drop(inner);

        self.enqueued.fetch_add(1, Ordering::Relaxed);
        trace!(event = id.0, size, "event queued");
        Ok(id)
    }

    /// Drain every record queued so far into `out`, destructively.
    ///
    /// Records arriving while the drain runs land in the next drain. Must
    /// only be called from the consumer context.
    pub fn drain_for(&self, phase: UpdateType, out: &mut DrainBuffer) -> usize {
        out.clear();
        {
            let mut inner = self.inner.lock();
            std::mem::swap(&mut inner.buffer, &mut out.bytes);
            out.count = std::mem::take(&mut inner.count);
            // The recycled buffer may be smaller than the current limit
            let capacity = inner.capacity;
            let len = inner.buffer.len();
            if inner.buffer.capacity() < capacity {
                inner.buffer.reserve(capacity - len);
            }
        }
        if out.count > 0 {
            debug!(%phase, events = out.count, bytes = out.bytes.len(), "drained event queue");
        }
        out.count
    }

    /// Stop accepting events; later enqueues fail with `Shutdown`
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Records currently queued
    pub fn len(&self) -> usize {
        self.inner.lock().count
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Bytes currently queued, padding included
    pub fn byte_len(&self) -> usize {
        self.inner.lock().buffer.len()
    }

    /// Current byte limit
    pub fn capacity(&self) -> usize {
        self.inner.lock().capacity
    }

    pub fn max_record_size(&self) -> usize {
        self.max_record_size
    }

    pub fn overflow_policy(&self) -> OverflowPolicy {
        self.overflow
    }

    /// Records accepted since creation
    pub fn enqueued_count(&self) -> u64 {
        self.enqueued.load(Ordering::Relaxed)
    }

    /// Records refused since creation
    pub fn rejected_count(&self) -> u64 {
        self.rejected.load(Ordering::Relaxed)
    }
}

impl std::fmt::Debug for EventQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("EventQueue")
            .field("count", &inner.count)
            .field("bytes", &inner.buffer.len())
            .field("capacity", &inner.capacity)
            .field("overflow", &self.overflow)
            .finish()
    }
}

/// Consumer-owned buffer that drained records are swapped into
#[derive(Debug, Default)]
pub struct DrainBuffer {
    bytes: Vec<u8>,
    count: usize,
}

impl DrainBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn clear(&mut self) {
        self.bytes.clear();
        self.count = 0;
    }

    pub fn len(&self) -> usize {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// Borrow the drained records
    pub fn batch(&self) -> EventBatch<'_> {
        EventBatch::new(&self.bytes, self.count)
    }
}
