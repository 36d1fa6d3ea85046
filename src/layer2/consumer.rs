// Queue Consumer - Pops queued events and persists them
// Order book snapshots are only stored when they differ from the last stored one

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use crate::core::types::{MarketEvent, MarketKind, ShutdownSignal};
use crate::layer2::orderbook::{diff_snapshots, OrderbookSnapshot};
use crate::layer2::queue::Queue;
use crate::layer2::storage::{Storage, StorageError};

/// What happened to one popped record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumeOutcome {
    Inserted(i64),
    /// Order book snapshot identical to the last stored one
    Duplicate,
    /// Unparseable record or failed write; already gone from the queue
    Dropped,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConsumerStats {
    pub popped: u64,
    pub inserted: u64,
    pub duplicates: u64,
    pub dropped: u64,
    pub queue_errors: u64,
}

impl fmt::Display for ConsumerStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Consumer(popped={}, inserted={}, duplicates={}, dropped={}, queue_errors={})",
            self.popped, self.inserted, self.duplicates, self.dropped, self.queue_errors
        )
    }
}

#[derive(Debug, Default)]
struct Counters {
    popped: AtomicU64,
    inserted: AtomicU64,
    duplicates: AtomicU64,
    dropped: AtomicU64,
    queue_errors: AtomicU64,
}

/// Single sequential consumer.
///
/// The latest-snapshot read followed by the insert is not atomic, so only one
/// consumer may serve a given symbol.
pub struct QueueConsumer {
    queue: Arc<dyn Queue>,
    storage: Arc<dyn Storage>,
    idle: Duration,
    shutdown: ShutdownSignal,
    counters: Counters,
}

impl QueueConsumer {
    pub fn new(
        queue: Arc<dyn Queue>,
        storage: Arc<dyn Storage>,
        idle: Duration,
        shutdown: ShutdownSignal,
    ) -> Self {
        Self {
            queue,
            storage,
            idle,
            shutdown,
            counters: Counters::default(),
        }
    }

    pub fn stats(&self) -> ConsumerStats {
        ConsumerStats {
            popped: self.counters.popped.load(Ordering::Relaxed),
            inserted: self.counters.inserted.load(Ordering::Relaxed),
            duplicates: self.counters.duplicates.load(Ordering::Relaxed),
            dropped: self.counters.dropped.load(Ordering::Relaxed),
            queue_errors: self.counters.queue_errors.load(Ordering::Relaxed),
        }
    }

    /// Consume until the shutdown signal is raised
    pub async fn run(&self) {
        info!(idle_ms = self.idle.as_millis() as u64, "Queue consumer started");

        while self.shutdown.is_running() {
            self.poll_once().await;
        }

        info!(stats = %self.stats(), "Queue consumer stopped");
    }

    /// Pop and process at most one record. Sleeps for the idle interval when
    /// the queue is empty or unreachable.
    pub async fn poll_once(&self) -> Option<ConsumeOutcome> {
        match self.queue.pop().await {
            Ok(Some(raw)) => {
                self.counters.popped.fetch_add(1, Ordering::Relaxed);
                Some(self.process_record(&raw).await)
            }
            Ok(None) => {
                tokio::time::sleep(self.idle).await;
                None
            }
            Err(e) => {
                self.counters.queue_errors.fetch_add(1, Ordering::Relaxed);
                error!(error = %e, "Queue pop failed");
                tokio::time::sleep(self.idle).await;
                None
            }
        }
    }

    pub async fn process_record(&self, raw: &str) -> ConsumeOutcome {
        let outcome = match serde_json::from_str::<MarketEvent>(raw) {
            Ok(event) => match self.persist(&event).await {
                Ok(outcome) => outcome,
                Err(e) => {
                    error!(symbol = %event.symbol, kind = %event.kind, error = %e, "Failed to persist event");
                    ConsumeOutcome::Dropped
                }
            },
            Err(e) => {
                warn!(error = %e, len = raw.len(), "Dropping malformed queue record");
                ConsumeOutcome::Dropped
            }
        };

        let counter = match outcome {
            ConsumeOutcome::Inserted(_) => &self.counters.inserted,
            ConsumeOutcome::Duplicate => &self.counters.duplicates,
            ConsumeOutcome::Dropped => &self.counters.dropped,
        };
        counter.fetch_add(1, Ordering::Relaxed);
        outcome
    }

    async fn persist(&self, event: &MarketEvent) -> Result<ConsumeOutcome, StorageError> {
        if event.is_orderbook() {
            let snapshot = match OrderbookSnapshot::from_payload(&event.payload) {
                Ok(snapshot) => snapshot,
                Err(e) => {
                    warn!(symbol = %event.symbol, error = %e, "Dropping malformed order book snapshot");
                    return Ok(ConsumeOutcome::Dropped);
                }
            };

            if let Some(previous) = self.storage.latest_market(&event.symbol, MarketKind::Orderbook).await? {
                match OrderbookSnapshot::from_payload(&previous.payload) {
                    Ok(stored) => {
                        let diff = diff_snapshots(&stored, &snapshot);
                        if diff.is_empty() {
                            debug!(symbol = %event.symbol, "Order book unchanged, skipping");
                            return Ok(ConsumeOutcome::Duplicate);
                        }
                        debug!(
                            symbol = %event.symbol,
                            bids = %diff.bids,
                            asks = %diff.asks,
                            "Order book changed"
                        );
                    }
                    Err(e) => {
                        warn!(id = previous.id, symbol = %event.symbol, error = %e, "Stored snapshot unreadable, storing new one");
                    }
                }
            }
        }

        let record = self.storage.insert_market(event).await?;
        Ok(ConsumeOutcome::Inserted(record.id))
    }
}
