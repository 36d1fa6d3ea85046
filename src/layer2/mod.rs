// Layer 2 - Data Processing & Persistence
// Normalizes pushes, buffers them through the queue, dedups order books into storage

pub mod orderbook;
pub mod parser;
pub mod queue;
pub mod storage;
pub mod buffer;
pub mod consumer;
pub mod ingestor;
pub mod pipeline;

// Re-export commonly used items
pub use orderbook::{BookDiff, OrderbookSnapshot, SideDiff, SnapshotError, diff_side, diff_snapshots};
pub use parser::{ParseError, parse_push, parse_push_str, parse_topic};
pub use queue::{MemoryQueue, Queue, QueueError, SqliteQueue};
pub use storage::{MarketFilter, MemoryStorage, Page, SqliteStorage, Storage, StorageError};
pub use buffer::{BufferError, BufferStats, EventBuffer};
pub use consumer::{ConsumeOutcome, ConsumerStats, QueueConsumer};
pub use ingestor::{IngestorStats, StreamIngestor};
pub use pipeline::{IngestWorker, MarketPipeline, PipelineError, PipelineStats};
