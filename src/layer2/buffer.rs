// Event Buffer - Batches MarketEvents into bulk queue writes
// Owned by a single worker; never shared between tasks

use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, error, warn};

use crate::core::types::MarketEvent;
use crate::layer2::queue::{Queue, QueueError};

#[derive(Debug, Error)]
pub enum BufferError {
    #[error("Failed to serialize event: {0}")]
    Serialize(String),
    #[error("Flush failed after retry, {pending} events kept: {source}")]
    Flush {
        pending: usize,
        #[source]
        source: QueueError,
    },
}

/// Buffer counters
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BufferStats {
    pub events_added: u64,
    pub events_flushed: u64,
    pub batches_flushed: u64,
    pub flush_retries: u64,
    pub flush_failures: u64,
    pub events_dropped: u64,
    pub pending: usize,
}

impl fmt::Display for BufferStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Buffer(added={}, flushed={}, batches={}, failures={}, dropped={}, pending={})",
            self.events_added, self.events_flushed, self.batches_flushed,
            self.flush_failures, self.events_dropped, self.pending
        )
    }
}

/// Accumulates events in arrival order and flushes them to the queue as one
/// bulk write once `batch_size` is reached.
///
/// A failed flush keeps the batch; it is retried on the next `add` or
/// `flush`. The backlog is capped at `max_pending`, oldest events first out.
pub struct EventBuffer {
    queue: Arc<dyn Queue>,
    pending: VecDeque<MarketEvent>,
    batch_size: usize,
    max_pending: usize,
    stats: BufferStats,
}

impl EventBuffer {
    pub fn new(queue: Arc<dyn Queue>, batch_size: usize, max_pending: usize) -> Self {
        let batch_size = batch_size.max(1);
        Self {
            queue,
            pending: VecDeque::with_capacity(batch_size),
            batch_size,
            max_pending: max_pending.max(batch_size),
            stats: BufferStats::default(),
        }
    }

    pub fn from_config(queue: Arc<dyn Queue>, config: &crate::core::QueueConfig) -> Self {
        Self::new(queue, config.batch_size, config.max_pending_events)
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn stats(&self) -> BufferStats {
        BufferStats {
            pending: self.pending.len(),
            ..self.stats.clone()
        }
    }

    /// Append one event; flushes before returning when the batch is full
    pub async fn add(&mut self, event: MarketEvent) -> Result<(), BufferError> {
        self.pending.push_back(event);
        self.stats.events_added += 1;

        while self.pending.len() > self.max_pending {
            if let Some(dropped) = self.pending.pop_front() {
                self.stats.events_dropped += 1;
                warn!(
                    symbol = %dropped.symbol,
                    kind = %dropped.kind,
                    max_pending = self.max_pending,
                    "Buffer backlog full, dropping oldest event"
                );
            }
        }

        if self.pending.len() >= self.batch_size {
            self.flush().await?;
        }
        Ok(())
    }

    /// Push everything pending as one batch. On success the buffer is
    /// cleared; on failure one immediate retry is made before giving up.
    pub async fn flush(&mut self) -> Result<(), BufferError> {
        if self.pending.is_empty() {
            return Ok(());
        }

        let records = self
            .pending
            .iter()
            .map(serde_json::to_string)
            .collect::<Result<Vec<String>, _>>()
            .map_err(|e| BufferError::Serialize(e.to_string()))?;

        if let Err(first) = self.queue.push(&records).await {
            warn!(error = %first, events = records.len(), "Queue push failed, retrying once");
            self.stats.flush_retries += 1;

            if let Err(second) = self.queue.push(&records).await {
                self.stats.flush_failures += 1;
                error!(error = %second, events = records.len(), "Queue push failed after retry");
                return Err(BufferError::Flush {
                    pending: self.pending.len(),
                    source: second,
                });
            }
        }

        self.stats.batches_flushed += 1;
        self.stats.events_flushed += records.len() as u64;
        self.pending.clear();

        debug!(events = records.len(), "Buffer flushed");
        Ok(())
    }
}
