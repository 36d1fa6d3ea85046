// WebSocket Client - Bybit v5 public stream
// One socket, topic-keyed callbacks, commands funneled through a writer channel

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, error, info, warn};

use crate::core::types::{ConnectionStatus, Subscription};
use crate::layer1::stream::{MessageCallback, StreamClient, StreamError};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type Handlers = Arc<RwLock<HashMap<String, MessageCallback>>>;

/// Commands sent to the connection task
#[derive(Debug)]
enum WsCommand {
    Send(String, oneshot::Sender<Result<(), StreamError>>),
    Close(oneshot::Sender<()>),
}

/// Subscribe request frame for one topic
pub fn create_subscribe_message(topic: &str) -> String {
    serde_json::json!({
        "op": "subscribe",
        "args": [topic]
    })
    .to_string()
}

pub fn create_ping_message() -> String {
    serde_json::json!({ "op": "ping" }).to_string()
}

/// WebSocket statistics
#[derive(Debug, Clone)]
pub struct WebSocketStats {
    pub state: ConnectionStatus,
    pub message_count: u64,
    pub error_count: u64,
    pub active_topics: usize,
}

impl fmt::Display for WebSocketStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "WebSocketStats(state={:?}, messages={}, errors={}, topics={})",
            self.state, self.message_count, self.error_count, self.active_topics
        )
    }
}

/// Bybit public stream client
pub struct BybitWebSocket {
    url: String,
    state: Arc<RwLock<ConnectionStatus>>,
    handlers: Handlers,
    cmd_tx: RwLock<Option<mpsc::UnboundedSender<WsCommand>>>,
    task: Mutex<Option<JoinHandle<()>>>,
    message_count: Arc<AtomicU64>,
    error_count: Arc<AtomicU64>,
}

impl BybitWebSocket {
    pub fn new(url: &str) -> Self {
        info!(url = url, "WebSocket client created");
        Self {
            url: url.to_string(),
            state: Arc::new(RwLock::new(ConnectionStatus::Disconnected)),
            handlers: Arc::new(RwLock::new(HashMap::new())),
            cmd_tx: RwLock::new(None),
            task: Mutex::new(None),
            message_count: Arc::new(AtomicU64::new(0)),
            error_count: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn from_config(config: &crate::core::StreamConfig) -> Self {
        Self::new(&config.ws_url)
    }

    pub fn is_connected(&self) -> bool {
        *self.state.read() == ConnectionStatus::Connected
    }

    pub fn active_topics(&self) -> Vec<String> {
        self.handlers.read().keys().cloned().collect()
    }

    pub fn get_stats(&self) -> WebSocketStats {
        WebSocketStats {
            state: *self.state.read(),
            message_count: self.message_count.load(Ordering::Relaxed),
            error_count: self.error_count.load(Ordering::Relaxed),
            active_topics: self.handlers.read().len(),
        }
    }

    /// Queue one text frame and wait for the writer's verdict
    async fn send_frame(&self, frame: String) -> Result<(), StreamError> {
        if !self.is_connected() {
            return Err(StreamError::ConnectionClosed);
        }

        let tx = self.cmd_tx.read().clone().ok_or(StreamError::ConnectionClosed)?;
        let (ack_tx, ack_rx) = oneshot::channel();
        tx.send(WsCommand::Send(frame, ack_tx))
            .map_err(|_| StreamError::ConnectionClosed)?;
        ack_rx.await.map_err(|_| StreamError::ConnectionClosed)?
    }
}

#[async_trait]
impl StreamClient for BybitWebSocket {
    async fn connect(&self) -> Result<(), StreamError> {
        info!(url = %self.url, "Connecting to WebSocket");
        *self.state.write() = ConnectionStatus::Connecting;

        let ws_stream = match connect_async(self.url.as_str()).await {
            Ok((stream, _)) => stream,
            Err(e) => {
                *self.state.write() = ConnectionStatus::Failed;
                self.error_count.fetch_add(1, Ordering::Relaxed);
                return Err(StreamError::Connect(e.to_string()));
            }
        };

        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        *self.cmd_tx.write() = Some(cmd_tx);
        *self.state.write() = ConnectionStatus::Connected;

        let handle = tokio::spawn(run_connection(
            ws_stream,
            cmd_rx,
            self.state.clone(),
            self.handlers.clone(),
            self.message_count.clone(),
            self.error_count.clone(),
        ));
        if let Some(stale) = self.task.lock().replace(handle) {
            stale.abort();
        }

        info!(url = %self.url, "WebSocket connected");
        Ok(())
    }

    async fn subscribe(&self, subscription: &Subscription, callback: MessageCallback) -> Result<(), StreamError> {
        let topic = subscription.topic();
        self.handlers.write().insert(topic.clone(), callback);

        self.send_frame(create_subscribe_message(&topic)).await?;
        debug!(topic = %topic, "Subscribed");
        Ok(())
    }

    async fn ping(&self) -> Result<(), StreamError> {
        self.send_frame(create_ping_message()).await
    }

    async fn close(&self) -> Result<(), StreamError> {
        info!("Closing WebSocket");
        let tx = self.cmd_tx.write().take();
        self.handlers.write().clear();

        if let Some(tx) = tx {
            let (done_tx, done_rx) = oneshot::channel();
            if tx.send(WsCommand::Close(done_tx)).is_ok() {
                let _ = done_rx.await;
            }
        }

        let task = self.task.lock().take();
        if let Some(task) = task {
            task.abort();
        }

        *self.state.write() = ConnectionStatus::Disconnected;
        Ok(())
    }

    fn status(&self) -> ConnectionStatus {
        *self.state.read()
    }
}

impl Drop for BybitWebSocket {
    fn drop(&mut self) {
        if let Some(task) = self.task.lock().take() {
            task.abort();
        }
        debug!("WebSocket client dropped");
    }
}

/// Command acknowledgements and pongs carry `op` / `success` instead of a topic
fn is_control_frame(message: &serde_json::Value) -> bool {
    message.get("op").is_some() || message.get("success").is_some()
}

/// Dispatch one text frame to the callback registered for its topic
fn dispatch_text(text: &str, handlers: &Handlers) {
    let value: serde_json::Value = match serde_json::from_str(text) {
        Ok(v) => v,
        Err(e) => {
            warn!(error = %e, len = text.len(), "Received non-JSON frame");
            return;
        }
    };

    if is_control_frame(&value) {
        let success = value.get("success").and_then(|v| v.as_bool()).unwrap_or(true);
        if success {
            debug!(frame = %value, "Control frame");
        } else {
            warn!(frame = %value, "Command rejected by server");
        }
        return;
    }

    let callback = value
        .get("topic")
        .and_then(|t| t.as_str())
        .and_then(|topic| handlers.read().get(topic).cloned());

    match callback {
        Some(callback) => callback(value),
        None => debug!(frame_len = text.len(), "Frame without a registered topic"),
    }
}

/// Connection task: reads frames and executes writer commands until the
/// socket ends or a close is requested
async fn run_connection(
    ws_stream: WsStream,
    mut cmd_rx: mpsc::UnboundedReceiver<WsCommand>,
    state: Arc<RwLock<ConnectionStatus>>,
    handlers: Handlers,
    message_count: Arc<AtomicU64>,
    error_count: Arc<AtomicU64>,
) {
    let (mut write, mut read) = ws_stream.split();

    loop {
        tokio::select! {
            msg_result = read.next() => {
                match msg_result {
                    Some(Ok(Message::Text(text))) => {
                        let count = message_count.fetch_add(1, Ordering::Relaxed) + 1;
                        dispatch_text(&text, &handlers);
                        if count % 10000 == 0 {
                            debug!(count = count, "WebSocket messages received");
                        }
                    }
                    Some(Ok(Message::Ping(data))) => {
                        let _ = write.send(Message::Pong(data)).await;
                    }
                    Some(Ok(Message::Binary(data))) => {
                        warn!(bytes = data.len(), "Received unexpected binary message");
                    }
                    Some(Ok(Message::Pong(_))) | Some(Ok(Message::Frame(_))) => {}
                    Some(Ok(Message::Close(_))) => {
                        info!("WebSocket closed by server");
                        break;
                    }
                    Some(Err(e)) => {
                        error!(error = %e, "WebSocket error");
                        error_count.fetch_add(1, Ordering::Relaxed);
                        break;
                    }
                    None => {
                        info!("WebSocket stream ended");
                        break;
                    }
                }
            }

            cmd = cmd_rx.recv() => {
                match cmd {
                    Some(WsCommand::Send(frame, ack)) => {
                        let result = write
                            .send(Message::Text(frame))
                            .await
                            .map_err(|e| {
                                error_count.fetch_add(1, Ordering::Relaxed);
                                warn!(error = %e, "Failed to send frame");
                                StreamError::ConnectionClosed
                            });
                        let failed = result.is_err();
                        let _ = ack.send(result);
                        if failed {
                            break;
                        }
                    }
                    Some(WsCommand::Close(done)) => {
                        if let Err(e) = write.close().await {
                            debug!(error = %e, "Error closing socket");
                        }
                        let _ = done.send(());
                        break;
                    }
                    None => {
                        debug!("Command channel closed");
                        break;
                    }
                }
            }
        }
    }

    *state.write() = ConnectionStatus::Disconnected;
    debug!("WebSocket connection task finished");
}
