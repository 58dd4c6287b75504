//! In-memory message buffer (C5).
//!
//! Holds [`BufferedMessage`]s between reception and persistence. A single
//! producer (the connection manager's receive loop) pushes messages in; a
//! single consumer (the flush timer, owned by the composition root) pulls
//! batches out on a size or time trigger. External producers must go
//! through [`MessageBuffer::push`], which internally synchronizes, so the
//! single-producer/single-consumer contract in §5 is not violated by
//! construction — it is a convention this one entry point enforces.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use tokio::sync::Mutex;

use crate::config::BufferConfig;
use crate::hal::CanFrame;
use crate::j1939::DecodedMessage;

/// One frame (and its decode outcome, if any) waiting to be persisted.
#[derive(Debug, Clone)]
pub struct BufferedMessage {
    pub raw: CanFrame,
    pub decoded: Option<DecodedMessage>,
    pub reception_time: DateTime<Utc>,
    pub interface_id: String,
}

/// The in-memory slab described by §4.5.
///
/// Flushes are triggered externally (by size via [`MessageBuffer::should_flush`]
/// or by a periodic tick owned by the caller); this type only holds state and
/// enforces ordering + back-pressure, it does not run its own timer.
pub struct MessageBuffer {
    config: BufferConfig,
    inner: Mutex<VecDeque<BufferedMessage>>,
    dropped_messages: AtomicU64,
    shedding: AtomicBool,
}

impl MessageBuffer {
    pub fn new(config: BufferConfig) -> Self {
        Self {
            config,
            inner: Mutex::new(VecDeque::new()),
            dropped_messages: AtomicU64::new(0),
            shedding: AtomicBool::new(false),
        }
    }

    /// Enqueue one buffered message. Returns `false` (and increments
    /// `dropped_messages`) if the buffer is in shed mode.
    pub async fn push(&self, message: BufferedMessage) -> bool {
        let mut guard = self.inner.lock().await;

        if guard.len() >= self.config.max_buffer {
            drop(guard);
            self.dropped_messages.fetch_add(1, Ordering::Relaxed);
            if !self.shedding.swap(true, Ordering::Relaxed) {
                #[cfg(feature = "tracing-support")]
                tracing::warn!(
                    max_buffer = self.config.max_buffer,
                    "message buffer at capacity, entering shed mode"
                );
            }
            return false;
        }

        if self.shedding.swap(false, Ordering::Relaxed) {
            #[cfg(feature = "tracing-support")]
            tracing::info!("message buffer below capacity, exiting shed mode");
        }

        guard.push_back(message);
        true
    }

    /// Current buffered length.
    pub async fn len(&self) -> usize {
        self.inner.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Whether the buffer has reached its size-triggered flush threshold.
    pub async fn should_flush(&self) -> bool {
        self.len().await >= self.config.batch_size
    }

    /// Count of messages dropped while in shed mode.
    pub fn dropped_messages(&self) -> u64 {
        self.dropped_messages.load(Ordering::Relaxed)
    }

    pub fn is_shedding(&self) -> bool {
        self.shedding.load(Ordering::Relaxed)
    }

    /// Drain the whole buffer, ordered by `(reception_time, arbitration_id)`
    /// as required by the flush ordering guarantee in §4.5. Empties the
    /// buffer even if the caller discards the result — this is the only
    /// entry point that removes messages, so a failed downstream write must
    /// re-push what it could not persist (see `MessageBuffer::requeue`).
    pub async fn take_batch(&self) -> Vec<BufferedMessage> {
        let mut guard = self.inner.lock().await;
        let mut batch: Vec<BufferedMessage> = guard.drain(..).collect();
        drop(guard);
        batch.sort_by(|a, b| {
            a.reception_time
                .cmp(&b.reception_time)
                .then(a.raw.arbitration_id.cmp(&b.raw.arbitration_id))
        });
        batch
    }

    /// Put a batch back at the front of the queue after a failed write, so
    /// the buffer retains it until the next retry (§4.6 write path, step 5).
    pub async fn requeue(&self, batch: Vec<BufferedMessage>) {
        let mut guard = self.inner.lock().await;
        for message in batch.into_iter().rev() {
            guard.push_front(message);
        }
    }

    /// Flush everything unconditionally; used on `shutdown()`.
    pub async fn shutdown(&self) -> Vec<BufferedMessage> {
        self.take_batch().await
    }

    /// Split an already-ordered batch into `max_batch_size`-sized
    /// sub-batches before a single insert round-trip, so a batch that grew
    /// large during a shed episode doesn't become one unbounded `INSERT`.
    pub fn chunk(&self, batch: Vec<BufferedMessage>) -> Vec<Vec<BufferedMessage>> {
        let max = self.config.max_batch_size.max(1);
        if batch.len() <= max {
            return vec![batch];
        }
        batch
            .chunks(max)
            .map(|chunk| chunk.to_vec())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message_at(reception_time: DateTime<Utc>, arbitration_id: u32) -> BufferedMessage {
        BufferedMessage {
            raw: CanFrame::new_extended(arbitration_id, vec![0; 8]),
            decoded: None,
            reception_time,
            interface_id: "vcan0".to_string(),
        }
    }

    #[tokio::test]
    async fn test_ordering_invariant() {
        // Property 4: a burst of frames out of arrival order is still
        // persisted in (reception_time, arbitration_id) order.
        let buffer = MessageBuffer::new(BufferConfig::default());
        let t0 = Utc::now();
        let t1 = t0 + chrono::Duration::milliseconds(1);

        buffer.push(message_at(t1, 200)).await;
        buffer.push(message_at(t0, 300)).await;
        buffer.push(message_at(t0, 100)).await;

        let batch = buffer.take_batch().await;
        let ordering: Vec<(DateTime<Utc>, u32)> = batch
            .iter()
            .map(|m| (m.reception_time, m.raw.arbitration_id))
            .collect();
        assert_eq!(
            ordering,
            vec![(t0, 100), (t0, 300), (t1, 200)]
        );
    }

    #[tokio::test]
    async fn test_should_flush_at_batch_size() {
        let mut config = BufferConfig::default();
        config.batch_size = 2;
        let buffer = MessageBuffer::new(config);
        buffer.push(message_at(Utc::now(), 1)).await;
        assert!(!buffer.should_flush().await);
        buffer.push(message_at(Utc::now(), 2)).await;
        assert!(buffer.should_flush().await);
    }

    #[tokio::test]
    async fn test_shed_mode_drops_and_counts() {
        let mut config = BufferConfig::default();
        config.max_buffer = 1;
        let buffer = MessageBuffer::new(config);
        assert!(buffer.push(message_at(Utc::now(), 1)).await);
        assert!(!buffer.push(message_at(Utc::now(), 2)).await);
        assert_eq!(buffer.dropped_messages(), 1);
        assert!(buffer.is_shedding());
    }

    #[tokio::test]
    async fn test_requeue_after_failed_write() {
        let buffer = MessageBuffer::new(BufferConfig::default());
        buffer.push(message_at(Utc::now(), 1)).await;
        let batch = buffer.take_batch().await;
        assert!(buffer.is_empty().await);
        buffer.requeue(batch).await;
        assert_eq!(buffer.len().await, 1);
    }

    #[test]
    fn test_chunk_splits_large_batches() {
        let mut config = BufferConfig::default();
        config.max_batch_size = 2;
        let buffer = MessageBuffer::new(config);
        let batch: Vec<BufferedMessage> = (0..5).map(|i| message_at(Utc::now(), i)).collect();
        let chunks = buffer.chunk(batch);
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[0].len(), 2);
        assert_eq!(chunks[2].len(), 1);
    }
}
