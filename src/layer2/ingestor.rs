// Stream Ingestor - Subscribes every (symbol, channel) pair and hands
// normalized events to the ingest worker over a bounded channel

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, error, info, warn};

use crate::core::types::{ChannelKind, MarketEvent, ShutdownSignal, Subscription};
use crate::layer1::stream::{MessageCallback, StreamClient, StreamError};
use crate::layer2::parser::parse_push;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct IngestorStats {
    pub received: u64,
    pub malformed: u64,
    pub dropped_full: u64,
    pub reconnects: u64,
    pub restarts: u64,
}

impl fmt::Display for IngestorStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Ingestor(received={}, malformed={}, dropped_full={}, reconnects={}, restarts={})",
            self.received, self.malformed, self.dropped_full, self.reconnects, self.restarts
        )
    }
}

#[derive(Debug, Default)]
struct Counters {
    received: AtomicU64,
    malformed: AtomicU64,
    dropped_full: AtomicU64,
    reconnects: AtomicU64,
    restarts: AtomicU64,
}

/// Drives one stream client.
///
/// Reconnect policy: a `ConnectionClosed` from the send path closes the stale
/// connection, waits `reconnect_delay`, reconnects and resubscribes. Any
/// other session failure waits `restart_delay` and restarts the whole
/// subscribe loop. Neither delay grows and there is no attempt cap.
pub struct StreamIngestor {
    client: Arc<dyn StreamClient>,
    subscriptions: Vec<Subscription>,
    handoff: mpsc::Sender<MarketEvent>,
    shutdown: ShutdownSignal,
    reconnect_delay: Duration,
    restart_delay: Duration,
    heartbeat_interval: Duration,
    counters: Arc<Counters>,
}

impl StreamIngestor {
    pub fn new(
        client: Arc<dyn StreamClient>,
        symbols: &[String],
        channels: &[ChannelKind],
        handoff: mpsc::Sender<MarketEvent>,
        shutdown: ShutdownSignal,
    ) -> Self {
        Self {
            client,
            subscriptions: Subscription::cross(symbols, channels),
            handoff,
            shutdown,
            reconnect_delay: Duration::from_secs(1),
            restart_delay: Duration::from_secs(5),
            heartbeat_interval: Duration::from_secs(20),
            counters: Arc::new(Counters::default()),
        }
    }

    pub fn from_config(
        client: Arc<dyn StreamClient>,
        config: &crate::core::StreamConfig,
        handoff: mpsc::Sender<MarketEvent>,
        shutdown: ShutdownSignal,
    ) -> Self {
        let channels = ChannelKind::standard_set(config.orderbook_depth, &config.kline_interval);
        Self::new(client, &config.symbols, &channels, handoff, shutdown).with_delays(
            config.reconnect_delay(),
            config.restart_delay(),
            config.heartbeat_interval(),
        )
    }

    pub fn with_delays(mut self, reconnect: Duration, restart: Duration, heartbeat: Duration) -> Self {
        self.reconnect_delay = reconnect;
        self.restart_delay = restart;
        self.heartbeat_interval = heartbeat;
        self
    }

    pub fn subscriptions(&self) -> &[Subscription] {
        &self.subscriptions
    }

    pub fn stats(&self) -> IngestorStats {
        IngestorStats {
            received: self.counters.received.load(Ordering::Relaxed),
            malformed: self.counters.malformed.load(Ordering::Relaxed),
            dropped_full: self.counters.dropped_full.load(Ordering::Relaxed),
            reconnects: self.counters.reconnects.load(Ordering::Relaxed),
            restarts: self.counters.restarts.load(Ordering::Relaxed),
        }
    }

    /// Callback handed to the client. It runs on the client's I/O task, so
    /// it only normalizes and posts; the buffer is never touched here.
    fn callback(&self) -> MessageCallback {
        let handoff = self.handoff.clone();
        let counters = Arc::clone(&self.counters);

        Arc::new(move |message: serde_json::Value| {
            counters.received.fetch_add(1, Ordering::Relaxed);

            let event = match parse_push(&message) {
                Ok(event) => event,
                Err(e) => {
                    counters.malformed.fetch_add(1, Ordering::Relaxed);
                    warn!(error = %e, "Dropping malformed push");
                    return;
                }
            };

            match handoff.try_send(event) {
                Ok(()) => {}
                Err(TrySendError::Full(event)) => {
                    counters.dropped_full.fetch_add(1, Ordering::Relaxed);
                    warn!(symbol = %event.symbol, kind = %event.kind, "Handoff channel full, dropping event");
                }
                Err(TrySendError::Closed(_)) => {
                    debug!("Handoff channel closed, ingest worker gone");
                }
            }
        })
    }

    pub async fn subscribe_all(&self) -> Result<(), StreamError> {
        let callback = self.callback();
        for subscription in &self.subscriptions {
            self.client.subscribe(subscription, Arc::clone(&callback)).await?;
        }
        info!(count = self.subscriptions.len(), "Subscribed to all channels");
        Ok(())
    }

    /// close -> wait -> connect -> resubscribe
    pub async fn reconnect(&self) -> Result<(), StreamError> {
        self.counters.reconnects.fetch_add(1, Ordering::Relaxed);
        warn!(delay_ms = self.reconnect_delay.as_millis() as u64, "Connection closed, reconnecting");

        if let Err(e) = self.client.close().await {
            warn!(error = %e, "Error closing stale connection");
        }

        tokio::time::sleep(self.reconnect_delay).await;

        self.client.connect().await?;
        self.subscribe_all().await?;

        info!("Reconnected and resubscribed");
        Ok(())
    }

    /// Send a heartbeat; a closed connection triggers one reconnect sequence
    pub async fn heartbeat(&self) -> Result<(), StreamError> {
        match self.client.ping().await {
            Err(StreamError::ConnectionClosed) => self.reconnect().await,
            other => other,
        }
    }

    async fn serve(&self) -> Result<(), StreamError> {
        while self.shutdown.is_running() {
            tokio::select! {
                _ = tokio::time::sleep(self.heartbeat_interval) => {}
                _ = self.shutdown.stopped() => break,
            }
            self.heartbeat().await?;
        }
        Ok(())
    }

    async fn session(&self) -> Result<(), StreamError> {
        self.client.connect().await?;
        self.subscribe_all().await?;
        self.serve().await
    }

    /// Run until the shutdown signal is raised
    pub async fn run(&self) {
        info!(subscriptions = self.subscriptions.len(), "Stream ingestor started");

        while self.shutdown.is_running() {
            match self.session().await {
                Ok(()) => break,
                Err(e) => {
                    self.counters.restarts.fetch_add(1, Ordering::Relaxed);
                    error!(
                        error = %e,
                        delay_ms = self.restart_delay.as_millis() as u64,
                        "Stream session failed, restarting"
                    );
                    tokio::select! {
                        _ = tokio::time::sleep(self.restart_delay) => {}
                        _ = self.shutdown.stopped() => break,
                    }
                }
            }
        }

        if let Err(e) = self.client.close().await {
            warn!(error = %e, "Error closing stream on shutdown");
        }
        info!(stats = %self.stats(), "Stream ingestor stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::{ConnectionStatus, MarketKind};
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use serde_json::json;

    /// Records every call; `ping` reports a closed connection `failing_pings`
    /// times and `connect` is refused `failing_connects` times
    #[derive(Default)]
    struct ScriptedClient {
        calls: Mutex<Vec<String>>,
        callbacks: Mutex<Vec<MessageCallback>>,
        failing_pings: Mutex<usize>,
        failing_connects: Mutex<usize>,
        connected_at: Mutex<Vec<tokio::time::Instant>>,
    }

    impl ScriptedClient {
        fn calls(&self) -> Vec<String> {
            self.calls.lock().clone()
        }

        fn push(&self, message: serde_json::Value) {
            let callback = self.callbacks.lock().last().cloned().unwrap();
            callback(message);
        }
    }

    #[async_trait]
    impl StreamClient for ScriptedClient {
        async fn connect(&self) -> Result<(), StreamError> {
            self.calls.lock().push("connect".into());
            self.connected_at.lock().push(tokio::time::Instant::now());
            let mut failing = self.failing_connects.lock();
            if *failing > 0 {
                *failing -= 1;
                return Err(StreamError::Connect("refused".into()));
            }
            Ok(())
        }

        async fn subscribe(&self, subscription: &Subscription, callback: MessageCallback) -> Result<(), StreamError> {
            self.calls.lock().push(format!("subscribe {}", subscription.topic()));
            self.callbacks.lock().push(callback);
            Ok(())
        }

        async fn ping(&self) -> Result<(), StreamError> {
            self.calls.lock().push("ping".into());
            let mut failing = self.failing_pings.lock();
            if *failing > 0 {
                *failing -= 1;
                return Err(StreamError::ConnectionClosed);
            }
            Ok(())
        }

        async fn close(&self) -> Result<(), StreamError> {
            self.calls.lock().push("close".into());
            Err(StreamError::Send("already gone".into()))
        }

        fn status(&self) -> ConnectionStatus {
            ConnectionStatus::Connected
        }
    }

    fn ingestor(client: Arc<ScriptedClient>, capacity: usize) -> (StreamIngestor, mpsc::Receiver<MarketEvent>) {
        let (tx, rx) = mpsc::channel(capacity);
        let ingestor = StreamIngestor::new(
            client,
            &["NEARUSDT".to_string()],
            &[ChannelKind::Trade, ChannelKind::Kline { interval: "1".into() }],
            tx,
            ShutdownSignal::new(),
        );
        (ingestor, rx)
    }

    #[tokio::test(start_paused = true)]
    async fn test_closed_ping_triggers_one_reconnect() {
        let client = Arc::new(ScriptedClient::default());
        *client.failing_pings.lock() = 1;
        let (ingestor, _rx) = ingestor(client.clone(), 8);

        ingestor.subscribe_all().await.unwrap();
        let started = tokio::time::Instant::now();
        ingestor.heartbeat().await.unwrap();

        assert!(started.elapsed() >= Duration::from_secs(1));
        assert_eq!(
            client.calls(),
            vec![
                "subscribe publicTrade.NEARUSDT",
                "subscribe kline.1.NEARUSDT",
                "ping",
                "close",
                "connect",
                "subscribe publicTrade.NEARUSDT",
                "subscribe kline.1.NEARUSDT",
            ]
        );
        assert_eq!(ingestor.stats().reconnects, 1);

        ingestor.heartbeat().await.unwrap();
        assert_eq!(client.calls().last().map(String::as_str), Some("ping"));
        assert_eq!(ingestor.stats().reconnects, 1);
    }

    #[tokio::test]
    async fn test_pushes_are_normalized_and_handed_off() {
        let client = Arc::new(ScriptedClient::default());
        let (ingestor, mut rx) = ingestor(client.clone(), 8);
        ingestor.subscribe_all().await.unwrap();

        client.push(json!({"topic": "kline.1.NEARUSDT", "ts": 1700000000000i64, "data": [{"close": "3.2"}]}));
        client.push(json!({"topic": "kline.1.NEARUSDT"}));

        let event = rx.recv().await.unwrap();
        assert_eq!(event.kind, MarketKind::Kline);
        assert_eq!(event.payload, json!({"close": "3.2"}));
        assert!(rx.try_recv().is_err());

        let stats = ingestor.stats();
        assert_eq!(stats.received, 2);
        assert_eq!(stats.malformed, 1);
    }

    #[tokio::test]
    async fn test_full_channel_drops_event() {
        let client = Arc::new(ScriptedClient::default());
        let (ingestor, _rx) = ingestor(client.clone(), 1);
        ingestor.subscribe_all().await.unwrap();

        let push = json!({"topic": "publicTrade.NEARUSDT", "ts": 1, "data": [{"p": "3.2"}]});
        client.push(push.clone());
        client.push(push);

        assert_eq!(ingestor.stats().dropped_full, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_exits_on_shutdown() {
        let client = Arc::new(ScriptedClient::default());
        let (ingestor, _rx) = ingestor(client.clone(), 8);
        let ingestor = Arc::new(ingestor);
        let shutdown = ingestor.shutdown.clone();

        let task = {
            let ingestor = Arc::clone(&ingestor);
            tokio::spawn(async move { ingestor.run().await })
        };
        tokio::time::sleep(Duration::from_secs(45)).await;
        shutdown.stop();
        task.await.unwrap();

        let calls = client.calls();
        assert_eq!(calls.first().map(String::as_str), Some("connect"));
        assert_eq!(calls.iter().filter(|c| *c == "ping").count(), 2);
        assert_eq!(calls.last().map(String::as_str), Some("close"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_session_restarts_after_delay() {
        let client = Arc::new(ScriptedClient::default());
        *client.failing_connects.lock() = 1;
        let (ingestor, _rx) = ingestor(client.clone(), 8);
        let ingestor = Arc::new(ingestor);
        let shutdown = ingestor.shutdown.clone();

        let task = {
            let ingestor = Arc::clone(&ingestor);
            tokio::spawn(async move { ingestor.run().await })
        };
        tokio::time::sleep(Duration::from_secs(6)).await;
        shutdown.stop();
        task.await.unwrap();

        let connected_at = client.connected_at.lock().clone();
        assert_eq!(connected_at.len(), 2);
        assert_eq!(connected_at[1] - connected_at[0], Duration::from_secs(5));
        assert_eq!(ingestor.stats().restarts, 1);
        assert_eq!(ingestor.stats().reconnects, 0);

        let calls = client.calls();
        assert_eq!(calls[0], "connect");
        assert_eq!(calls[1], "connect");
        assert_eq!(calls[2], "subscribe publicTrade.NEARUSDT");
    }
}
