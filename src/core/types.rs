// Core Type Definitions for Smart Trade
// Market events, price levels, recommendations and aggregated windows

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;

// ============================================================================
// Enums
// ============================================================================

/// Channel family a market event was observed on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MarketKind {
    Orderbook,
    Kline,
    Trade,
    Liquidation,
}

impl MarketKind {
    pub const ALL: [MarketKind; 4] = [
        MarketKind::Orderbook,
        MarketKind::Kline,
        MarketKind::Trade,
        MarketKind::Liquidation,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            MarketKind::Orderbook => "orderbook",
            MarketKind::Kline => "kline",
            MarketKind::Trade => "trade",
            MarketKind::Liquidation => "liquidation",
        }
    }
}

impl fmt::Display for MarketKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MarketKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "orderbook" => Ok(MarketKind::Orderbook),
            "kline" => Ok(MarketKind::Kline),
            "trade" => Ok(MarketKind::Trade),
            "liquidation" => Ok(MarketKind::Liquidation),
            _ => Err(format!("Invalid MarketKind: '{}'", s)),
        }
    }
}

/// Channel subscription with its exchange parameters
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ChannelKind {
    Orderbook { depth: u32 },
    Kline { interval: String },
    Trade,
    Liquidation,
}

impl ChannelKind {
    pub fn kind(&self) -> MarketKind {
        match self {
            ChannelKind::Orderbook { .. } => MarketKind::Orderbook,
            ChannelKind::Kline { .. } => MarketKind::Kline,
            ChannelKind::Trade => MarketKind::Trade,
            ChannelKind::Liquidation => MarketKind::Liquidation,
        }
    }

    /// Bybit topic name for this channel on `symbol`
    pub fn topic(&self, symbol: &str) -> String {
        let symbol = symbol.to_uppercase();
        match self {
            ChannelKind::Orderbook { depth } => format!("orderbook.{}.{}", depth, symbol),
            ChannelKind::Kline { interval } => format!("kline.{}.{}", interval, symbol),
            ChannelKind::Trade => format!("publicTrade.{}", symbol),
            ChannelKind::Liquidation => format!("liquidation.{}", symbol),
        }
    }

    /// The four channels recorded per symbol
    pub fn standard_set(depth: u32, kline_interval: &str) -> Vec<ChannelKind> {
        vec![
            ChannelKind::Orderbook { depth },
            ChannelKind::Kline { interval: kline_interval.to_string() },
            ChannelKind::Trade,
            ChannelKind::Liquidation,
        ]
    }
}

impl fmt::Display for ChannelKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChannelKind::Orderbook { depth } => write!(f, "orderbook({})", depth),
            ChannelKind::Kline { interval } => write!(f, "kline({})", interval),
            ChannelKind::Trade => write!(f, "trade"),
            ChannelKind::Liquidation => write!(f, "liquidation"),
        }
    }
}

/// One (symbol, channel) pair registered with the stream
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Subscription {
    pub symbol: String,
    pub channel: ChannelKind,
}

impl Subscription {
    pub fn new(symbol: &str, channel: ChannelKind) -> Self {
        Self {
            symbol: symbol.to_uppercase(),
            channel,
        }
    }

    pub fn topic(&self) -> String {
        self.channel.topic(&self.symbol)
    }

    /// Every (symbol, channel) pair, symbol-major
    pub fn cross(symbols: &[String], channels: &[ChannelKind]) -> Vec<Subscription> {
        symbols
            .iter()
            .flat_map(|s| channels.iter().map(move |c| Subscription::new(s, c.clone())))
            .collect()
    }
}

impl fmt::Display for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.symbol, self.channel)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionStatus {
    Disconnected,
    Connecting,
    Connected,
    Failed,
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

// ============================================================================
// Market Event
// ============================================================================

/// One normalized push from the exchange stream.
///
/// Immutable once built; the payload is passed through untouched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MarketEvent {
    pub symbol: String,
    pub kind: MarketKind,
    pub observed_at: DateTime<Utc>,
    pub payload: serde_json::Value,
}

impl MarketEvent {
    pub fn new(symbol: &str, kind: MarketKind, observed_at: DateTime<Utc>, payload: serde_json::Value) -> Self {
        Self {
            symbol: symbol.to_uppercase(),
            kind,
            observed_at,
            payload,
        }
    }

    pub fn is_orderbook(&self) -> bool {
        self.kind == MarketKind::Orderbook
    }
}

impl fmt::Display for MarketEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "MarketEvent(symbol={}, kind={}, observed_at={})",
            self.symbol, self.kind, self.observed_at.to_rfc3339()
        )
    }
}

/// A persisted market row
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MarketRecord {
    pub id: i64,
    pub symbol: String,
    pub kind: MarketKind,
    pub observed_at: DateTime<Utc>,
    pub payload: serde_json::Value,
}

// ============================================================================
// Order Book Levels
// ============================================================================

/// A price level. The price keeps its exact decimal text and acts as the
/// identity of the level within one side.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PriceLevel {
    pub price: String,
    pub size: f64,
}

impl PriceLevel {
    pub fn new(price: impl Into<String>, size: f64) -> Self {
        Self { price: price.into(), size }
    }
}

impl fmt::Display for PriceLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.size, self.price)
    }
}

// ============================================================================
// Recommendation
// ============================================================================

/// A stored AI recommendation. History is append-only; the newest row per
/// currency is the one the next analysis chains against.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Recommendation {
    pub id: i64,
    pub currency: String,
    pub recommended_at: DateTime<Utc>,
    pub recommended_action: String,
    pub confidence: f64,
    pub raw_data: serde_json::Value,
}

/// Values for a recommendation that has not been stored yet
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewRecommendation {
    pub currency: String,
    pub recommended_at: DateTime<Utc>,
    pub recommended_action: String,
    pub confidence: f64,
    pub raw_data: serde_json::Value,
}

impl NewRecommendation {
    pub fn into_stored(self, id: i64) -> Recommendation {
        Recommendation {
            id,
            currency: self.currency,
            recommended_at: self.recommended_at,
            recommended_action: self.recommended_action,
            confidence: self.confidence,
            raw_data: self.raw_data,
        }
    }
}

impl fmt::Display for Recommendation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Recommendation(id={}, currency={}, action={}, confidence={:.2})",
            self.id, self.currency, self.recommended_action, self.confidence
        )
    }
}

// ============================================================================
// Aggregated Window
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimeRange {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WindowEntry {
    pub observed_at: DateTime<Utc>,
    pub payload: serde_json::Value,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WindowBucket {
    pub entries: Vec<WindowEntry>,
    pub count: usize,
}

impl WindowBucket {
    pub fn push(&mut self, entry: WindowEntry) {
        self.entries.push(entry);
        self.count += 1;
    }
}

/// Market data for one currency over a lookback interval, grouped by kind
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregatedWindow {
    pub currency: String,
    pub time_range: TimeRange,
    pub grouped_data: BTreeMap<String, WindowBucket>,
}

impl AggregatedWindow {
    pub fn empty(currency: &str, time_range: TimeRange) -> Self {
        Self {
            currency: currency.to_uppercase(),
            time_range,
            grouped_data: BTreeMap::new(),
        }
    }

    pub fn add(&mut self, kind: MarketKind, entry: WindowEntry) {
        self.grouped_data
            .entry(kind.as_str().to_string())
            .or_default()
            .push(entry);
    }

    pub fn total_count(&self) -> usize {
        self.grouped_data.values().map(|b| b.count).sum()
    }
}

// ============================================================================
// Shutdown Signal
// ============================================================================

/// Cooperative stop flag shared by the pipeline loops.
///
/// Loops check it once per iteration and exit after finishing the
/// in-flight operation. Sleeping loops can race their timer against
/// `stopped()` to exit promptly.
#[derive(Debug, Clone)]
pub struct ShutdownSignal {
    running: Arc<AtomicBool>,
    notify: Arc<Notify>,
}

impl ShutdownSignal {
    pub fn new() -> Self {
        Self {
            running: Arc::new(AtomicBool::new(true)),
            notify: Arc::new(Notify::new()),
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::Release);
        self.notify.notify_waiters();
    }

    /// Resolves once `stop` has been called
    pub async fn stopped(&self) {
        let notified = self.notify.notified();
        if !self.is_running() {
            return;
        }
        notified.await;
    }
}

impl Default for ShutdownSignal {
    fn default() -> Self {
        Self::new()
    }
}
