// Market Pipeline - Ingest worker and task orchestration
// Stream -> handoff channel -> EventBuffer -> Queue -> QueueConsumer -> Storage

use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::core::config::{QueueConfig, StreamConfig};
use crate::core::types::{MarketEvent, ShutdownSignal};
use crate::layer1::stream::StreamClient;
use crate::layer2::buffer::{BufferStats, EventBuffer};
use crate::layer2::consumer::{ConsumerStats, QueueConsumer};
use crate::layer2::ingestor::{IngestorStats, StreamIngestor};
use crate::layer2::queue::{Queue, QueueError, SqliteQueue};
use crate::layer2::storage::{SqliteStorage, Storage, StorageError};

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),
    #[error("Pipeline already started")]
    AlreadyStarted,
}

// ============================================================================
// Ingest Worker
// ============================================================================

/// The single owner of the EventBuffer. Everything the stream produces
/// reaches the buffer through this worker's channel.
pub struct IngestWorker {
    buffer: EventBuffer,
    receiver: mpsc::Receiver<MarketEvent>,
    shutdown: ShutdownSignal,
}

impl IngestWorker {
    pub fn new(buffer: EventBuffer, receiver: mpsc::Receiver<MarketEvent>, shutdown: ShutdownSignal) -> Self {
        Self { buffer, receiver, shutdown }
    }

    async fn accept(&mut self, event: MarketEvent) {
        if let Err(e) = self.buffer.add(event).await {
            warn!(error = %e, pending = self.buffer.len(), "Buffer flush failed, batch kept");
        }
    }

    /// Drain the channel until shutdown, then flush whatever is left
    pub async fn run(mut self) -> BufferStats {
        info!("Ingest worker started");

        loop {
            tokio::select! {
                received = self.receiver.recv() => match received {
                    Some(event) => self.accept(event).await,
                    None => break,
                },
                _ = self.shutdown.stopped() => break,
            }
        }

        while let Ok(event) = self.receiver.try_recv() {
            self.accept(event).await;
        }
        if let Err(e) = self.buffer.flush().await {
            error!(error = %e, pending = self.buffer.len(), "Final flush failed, events lost");
        }

        let stats = self.buffer.stats();
        info!(stats = %stats, "Ingest worker stopped");
        stats
    }
}

// ============================================================================
// Pipeline
// ============================================================================

#[derive(Debug, Clone)]
pub struct PipelineStats {
    pub is_running: bool,
    pub ingestor: IngestorStats,
    pub buffer: Option<BufferStats>,
    pub consumer: ConsumerStats,
}

impl fmt::Display for PipelineStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Pipeline(running={}, {}, {}", self.is_running, self.ingestor, self.consumer)?;
        if let Some(buffer) = &self.buffer {
            write!(f, ", {}", buffer)?;
        }
        write!(f, ")")
    }
}

/// Ingestor, ingest worker and queue consumer running as tokio tasks under
/// one shared shutdown signal
pub struct MarketPipeline {
    shutdown: ShutdownSignal,
    ingestor: Arc<StreamIngestor>,
    consumer: Arc<QueueConsumer>,
    worker: Mutex<Option<IngestWorker>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    worker_task: Mutex<Option<JoinHandle<BufferStats>>>,
}

impl MarketPipeline {
    pub fn new(
        client: Arc<dyn StreamClient>,
        queue: Arc<dyn Queue>,
        storage: Arc<dyn Storage>,
        stream_config: &StreamConfig,
        queue_config: &QueueConfig,
    ) -> Self {
        let shutdown = ShutdownSignal::new();
        let (tx, rx) = mpsc::channel(stream_config.channel_capacity.max(1));

        let ingestor = StreamIngestor::from_config(client, stream_config, tx, shutdown.clone());
        let buffer = EventBuffer::from_config(Arc::clone(&queue), queue_config);
        let worker = IngestWorker::new(buffer, rx, shutdown.clone());
        let consumer = QueueConsumer::new(queue, storage, queue_config.pop_idle(), shutdown.clone());

        info!(
            symbols = stream_config.symbols.len(),
            batch_size = queue_config.batch_size,
            "Market pipeline created"
        );

        Self {
            shutdown,
            ingestor: Arc::new(ingestor),
            consumer: Arc::new(consumer),
            worker: Mutex::new(Some(worker)),
            tasks: Mutex::new(Vec::new()),
            worker_task: Mutex::new(None),
        }
    }

    pub fn from_config(
        client: Arc<dyn StreamClient>,
        queue: Arc<dyn Queue>,
        storage: Arc<dyn Storage>,
        config: &crate::core::ConfigManager,
    ) -> Self {
        Self::new(client, queue, storage, &config.stream(), &config.queue())
    }

    /// Pipeline over the durable SQLite queue and storage named in the config
    pub fn with_sqlite(
        client: Arc<dyn StreamClient>,
        config: &crate::core::ConfigManager,
    ) -> Result<Self, PipelineError> {
        let queue = Arc::new(SqliteQueue::from_config(&config.queue())?);
        let storage = Arc::new(SqliteStorage::from_config(&config.storage())?);
        Ok(Self::from_config(client, queue, storage, config))
    }

    /// Spawn the three tasks. A pipeline can only be started once.
    pub fn start(&self) -> Result<(), PipelineError> {
        let worker = self.worker.lock().take().ok_or(PipelineError::AlreadyStarted)?;

        *self.worker_task.lock() = Some(tokio::spawn(worker.run()));

        let ingestor = Arc::clone(&self.ingestor);
        let consumer = Arc::clone(&self.consumer);
        let mut tasks = self.tasks.lock();
        tasks.push(tokio::spawn(async move { ingestor.run().await }));
        tasks.push(tokio::spawn(async move { consumer.run().await }));

        info!("Market pipeline started");
        Ok(())
    }

    /// Raise the shutdown signal and wait for every task to finish its
    /// in-flight work
    pub async fn stop(&self) -> PipelineStats {
        info!("Stopping market pipeline");
        self.shutdown.stop();

        let tasks: Vec<JoinHandle<()>> = self.tasks.lock().drain(..).collect();
        for task in tasks {
            if let Err(e) = task.await {
                error!(error = %e, "Pipeline task panicked");
            }
        }

        let worker_task = self.worker_task.lock().take();
        let buffer = match worker_task {
            Some(task) => match task.await {
                Ok(stats) => Some(stats),
                Err(e) => {
                    error!(error = %e, "Ingest worker panicked");
                    None
                }
            },
            None => None,
        };

        let stats = PipelineStats {
            buffer,
            ..self.get_stats()
        };
        info!(stats = %stats, "Market pipeline stopped");
        stats
    }

    pub fn is_running(&self) -> bool {
        self.shutdown.is_running() && self.worker.lock().is_none()
    }

    pub fn shutdown_signal(&self) -> ShutdownSignal {
        self.shutdown.clone()
    }

    pub fn get_stats(&self) -> PipelineStats {
        PipelineStats {
            is_running: self.is_running(),
            ingestor: self.ingestor.stats(),
            buffer: None,
            consumer: self.consumer.stats(),
        }
    }
}
