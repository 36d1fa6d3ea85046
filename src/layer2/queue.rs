// Event Queue - FIFO of opaque JSON records between buffer and consumer
// In-memory and durable (SQLite) implementations

use async_trait::async_trait;
use parking_lot::Mutex;
use rusqlite::{Connection, ErrorCode, OptionalExtension};
use std::collections::VecDeque;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, error, info, warn};

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("Queue connection error: {0}")]
    Connection(String),
    #[error("Queue backend error: {0}")]
    Backend(String),
    #[error("Queue task failed: {0}")]
    Task(String),
}

impl From<rusqlite::Error> for QueueError {
    fn from(e: rusqlite::Error) -> Self {
        match &e {
            rusqlite::Error::SqliteFailure(err, _)
                if matches!(
                    err.code,
                    ErrorCode::CannotOpen | ErrorCode::SystemIoFailure | ErrorCode::DatabaseBusy
                ) =>
            {
                QueueError::Connection(e.to_string())
            }
            _ => QueueError::Backend(e.to_string()),
        }
    }
}

/// Durable FIFO of JSON records.
///
/// Order is preserved within one producer's pushes; a batch lands as one
/// contiguous run.
#[async_trait]
pub trait Queue: Send + Sync {
    async fn push(&self, records: &[String]) -> Result<(), QueueError>;
    async fn pop(&self) -> Result<Option<String>, QueueError>;
    async fn len(&self) -> Result<usize, QueueError>;
}

// ============================================================================
// In-memory queue
// ============================================================================

#[derive(Debug, Default)]
pub struct MemoryQueue {
    records: Mutex<VecDeque<String>>,
    failing_pushes: AtomicUsize,
}

impl MemoryQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `count` pushes fail with a connection error
    pub fn fail_next_pushes(&self, count: usize) {
        self.failing_pushes.store(count, Ordering::SeqCst);
    }
}

#[async_trait]
impl Queue for MemoryQueue {
    async fn push(&self, records: &[String]) -> Result<(), QueueError> {
        let pending = self
            .failing_pushes
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        if pending.is_ok() {
            return Err(QueueError::Connection("injected push failure".to_string()));
        }
        self.records.lock().extend(records.iter().cloned());
        Ok(())
    }

    async fn pop(&self) -> Result<Option<String>, QueueError> {
        Ok(self.records.lock().pop_front())
    }

    async fn len(&self) -> Result<usize, QueueError> {
        Ok(self.records.lock().len())
    }
}

// ============================================================================
// SQLite queue
// ============================================================================

fn init_queue_schema(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS event_queue (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            payload TEXT NOT NULL
        )",
        [],
    )?;
    Ok(())
}

/// In-memory and temporary SQLite databases vanish when the connection is
/// reopened, taking every queued record with them
fn is_transient_path(path: &str) -> bool {
    path.is_empty() || path == ":memory:" || path.starts_with("file::memory:") || path.contains("mode=memory")
}

fn open_connection(path: &str) -> Result<Connection, QueueError> {
    if let Some(parent) = Path::new(path).parent() {
        std::fs::create_dir_all(parent).map_err(|e| QueueError::Connection(e.to_string()))?;
    }
    let conn = Connection::open(path)?;
    init_queue_schema(&conn)?;
    Ok(conn)
}

/// Durable queue backed by a single SQLite table.
///
/// A connection failure gets one reconnect-and-retry cycle (reopen, short
/// fixed delay, retry once) before the error is surfaced.
pub struct SqliteQueue {
    path: String,
    conn: Arc<Mutex<Option<Connection>>>,
    reconnect_delay: Duration,
}

impl SqliteQueue {
    /// Open or create the queue file at `path`.
    ///
    /// In-memory paths are rejected since a reconnect would silently empty
    /// the queue; use [`MemoryQueue`] for a non-durable queue.
    pub fn open(path: &str, reconnect_delay: Duration) -> Result<Self, QueueError> {
        if is_transient_path(path) {
            return Err(QueueError::Backend(format!(
                "queue path {:?} is not durable, use a file path or the memory backend",
                path
            )));
        }
        let conn = open_connection(path)?;
        info!(path = path, "Queue opened");
        Ok(Self {
            path: path.to_string(),
            conn: Arc::new(Mutex::new(Some(conn))),
            reconnect_delay,
        })
    }

    pub fn from_config(config: &crate::core::QueueConfig) -> Result<Self, QueueError> {
        Self::open(&config.path, config.reconnect_delay())
    }

    async fn execute<T, F>(&self, op: F) -> Result<T, QueueError>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> Result<T, QueueError> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let mut guard = conn.lock();
            let conn = guard
                .as_mut()
                .ok_or_else(|| QueueError::Connection("not connected".to_string()))?;
            op(conn)
        })
        .await
        .map_err(|e| QueueError::Task(e.to_string()))?
    }

    async fn reconnect(&self) -> Result<(), QueueError> {
        warn!(path = %self.path, "Reconnecting queue");

        if let Some(stale) = self.conn.lock().take() {
            if let Err((_, e)) = stale.close() {
                warn!(error = %e, "Error closing stale queue connection");
            }
        }

        tokio::time::sleep(self.reconnect_delay).await;

        let path = self.path.clone();
        let fresh = tokio::task::spawn_blocking(move || open_connection(&path))
            .await
            .map_err(|e| QueueError::Task(e.to_string()))??;
        *self.conn.lock() = Some(fresh);

        info!(path = %self.path, "Queue reconnected");
        Ok(())
    }

    async fn with_retry<T, F>(&self, op_name: &str, op: F) -> Result<T, QueueError>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> Result<T, QueueError> + Send + Clone + 'static,
    {
        match self.execute(op.clone()).await {
            Err(QueueError::Connection(msg)) => {
                error!(op = op_name, error = %msg, "Queue connection failed");
                self.reconnect().await?;
                self.execute(op).await
            }
            other => other,
        }
    }

    #[cfg(test)]
    pub(crate) fn drop_connection(&self) {
        self.conn.lock().take();
    }
}

#[async_trait]
impl Queue for SqliteQueue {
    async fn push(&self, records: &[String]) -> Result<(), QueueError> {
        if records.is_empty() {
            return Ok(());
        }
        let batch: Vec<String> = records.to_vec();
        let count = batch.len();

        self.with_retry("push", move |conn| {
            let tx = conn.transaction()?;
            {
                let mut stmt = tx.prepare_cached("INSERT INTO event_queue (payload) VALUES (?1)")?;
                for record in &batch {
                    stmt.execute([record.as_str()])?;
                }
            }
            tx.commit()?;
            Ok(())
        })
        .await?;

        debug!(count = count, "Queue push");
        Ok(())
    }

    async fn pop(&self) -> Result<Option<String>, QueueError> {
        self.with_retry("pop", |conn| {
            let tx = conn.transaction()?;
            let head: Option<(i64, String)> = tx
                .query_row(
                    "SELECT id, payload FROM event_queue ORDER BY id ASC LIMIT 1",
                    [],
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )
                .optional()?;

            if let Some((id, _)) = &head {
                tx.execute("DELETE FROM event_queue WHERE id = ?1", [id])?;
            }
            tx.commit()?;
            Ok(head.map(|(_, payload)| payload))
        })
        .await
    }

    async fn len(&self) -> Result<usize, QueueError> {
        self.with_retry("len", |conn| {
            let count: i64 = conn.query_row("SELECT COUNT(*) FROM event_queue", [], |row| row.get(0))?;
            Ok(count as usize)
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn records(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test]
    async fn test_memory_queue_fifo() {
        let queue = MemoryQueue::new();
        queue.push(&records(&["a", "b"])).await.unwrap();
        queue.push(&records(&["c"])).await.unwrap();

        assert_eq!(queue.len().await.unwrap(), 3);
        assert_eq!(queue.pop().await.unwrap().as_deref(), Some("a"));
        assert_eq!(queue.pop().await.unwrap().as_deref(), Some("b"));
        assert_eq!(queue.pop().await.unwrap().as_deref(), Some("c"));
        assert_eq!(queue.pop().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_memory_queue_injected_failures() {
        let queue = MemoryQueue::new();
        queue.fail_next_pushes(1);

        assert!(matches!(queue.push(&records(&["a"])).await, Err(QueueError::Connection(_))));
        queue.push(&records(&["b"])).await.unwrap();
        assert_eq!(queue.pop().await.unwrap().as_deref(), Some("b"));
    }

    #[tokio::test]
    async fn test_sqlite_queue_fifo_and_durable() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("queue.db");
        let path = path.to_str().unwrap();

        {
            let queue = SqliteQueue::open(path, Duration::from_millis(1)).unwrap();
            queue.push(&records(&[r#"{"n":1}"#, r#"{"n":2}"#, r#"{"n":3}"#])).await.unwrap();
            assert_eq!(queue.pop().await.unwrap().as_deref(), Some(r#"{"n":1}"#));
        }

        let reopened = SqliteQueue::open(path, Duration::from_millis(1)).unwrap();
        assert_eq!(reopened.len().await.unwrap(), 2);
        assert_eq!(reopened.pop().await.unwrap().as_deref(), Some(r#"{"n":2}"#));
        assert_eq!(reopened.pop().await.unwrap().as_deref(), Some(r#"{"n":3}"#));
        assert_eq!(reopened.pop().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_sqlite_queue_reconnects_once() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("queue.db");
        let queue = SqliteQueue::open(path.to_str().unwrap(), Duration::from_millis(1)).unwrap();

        queue.push(&records(&["kept"])).await.unwrap();
        queue.drop_connection();

        assert_eq!(queue.pop().await.unwrap().as_deref(), Some("kept"));
        assert_eq!(queue.len().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_sqlite_empty_push_is_noop() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("queue.db");
        let queue = SqliteQueue::open(path.to_str().unwrap(), Duration::from_millis(1)).unwrap();
        queue.push(&[]).await.unwrap();
        assert_eq!(queue.len().await.unwrap(), 0);
    }

    #[test]
    fn test_sqlite_rejects_in_memory_paths() {
        for path in [":memory:", "", "file::memory:?cache=shared", "file:queue?mode=memory"] {
            let result = SqliteQueue::open(path, Duration::from_millis(1));
            assert!(matches!(result, Err(QueueError::Backend(_))), "{path:?} accepted");
        }
    }

    #[test]
    fn test_error_classification() {
        let busy = rusqlite::Error::SqliteFailure(
            rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_BUSY),
            None,
        );
        assert!(matches!(QueueError::from(busy), QueueError::Connection(_)));
        assert!(matches!(
            QueueError::from(rusqlite::Error::QueryReturnedNoRows),
            QueueError::Backend(_)
        ));
    }
}
