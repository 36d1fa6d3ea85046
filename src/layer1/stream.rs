// Stream Client Abstraction
// Connection seam between the ingestor and an exchange push stream

use async_trait::async_trait;
use std::sync::Arc;
use thiserror::Error;

use crate::core::types::{ConnectionStatus, Subscription};

/// Callback invoked with every decoded push on a subscribed topic.
/// May run on the client's I/O task, so it must not block.
pub type MessageCallback = Arc<dyn Fn(serde_json::Value) + Send + Sync>;

#[derive(Debug, Error)]
pub enum StreamError {
    /// The send path found the connection closed
    #[error("Stream connection is closed")]
    ConnectionClosed,
    #[error("Failed to connect: {0}")]
    Connect(String),
    #[error("Failed to send frame: {0}")]
    Send(String),
    #[error("Subscription rejected for {topic}: {reason}")]
    Subscribe { topic: String, reason: String },
}

#[async_trait]
pub trait StreamClient: Send + Sync {
    async fn connect(&self) -> Result<(), StreamError>;

    /// Register `callback` for the subscription's topic and request it
    async fn subscribe(&self, subscription: &Subscription, callback: MessageCallback) -> Result<(), StreamError>;

    /// Heartbeat through the send path
    async fn ping(&self) -> Result<(), StreamError>;

    async fn close(&self) -> Result<(), StreamError>;

    fn status(&self) -> ConnectionStatus;
}
