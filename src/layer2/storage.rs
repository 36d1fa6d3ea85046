// Market Storage - Append-only market rows and recommendation history
// In-memory and SQLite implementations behind one async trait

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use parking_lot::{Mutex, RwLock};
use rusqlite::types::Value as SqlValue;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info};

use crate::core::types::{
    AggregatedWindow, MarketEvent, MarketKind, MarketRecord, NewRecommendation, Recommendation,
    TimeRange, WindowEntry,
};

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Storage backend error: {0}")]
    Backend(String),
    #[error("Corrupt row {id} in {table}: {reason}")]
    CorruptRow { table: &'static str, id: i64, reason: String },
    #[error("Invalid lookback: {0:?}")]
    InvalidLookback(Duration),
    #[error("Storage task failed: {0}")]
    Task(String),
}

impl From<rusqlite::Error> for StorageError {
    fn from(e: rusqlite::Error) -> Self {
        StorageError::Backend(e.to_string())
    }
}

// ============================================================================
// Queries
// ============================================================================

/// Market row filter; unset fields match everything
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MarketFilter {
    pub symbol: Option<String>,
    pub kind: Option<MarketKind>,
    pub since: Option<DateTime<Utc>>,
    pub until: Option<DateTime<Utc>>,
}

impl MarketFilter {
    pub fn for_symbol(symbol: &str) -> Self {
        Self {
            symbol: Some(symbol.to_uppercase()),
            ..Default::default()
        }
    }

    pub fn with_kind(mut self, kind: MarketKind) -> Self {
        self.kind = Some(kind);
        self
    }

    pub fn between(mut self, since: DateTime<Utc>, until: DateTime<Utc>) -> Self {
        self.since = Some(since);
        self.until = Some(until);
        self
    }

    fn matches(&self, record: &MarketRecord) -> bool {
        self.symbol.as_deref().map_or(true, |s| record.symbol == s)
            && self.kind.map_or(true, |k| record.kind == k)
            && self.since.map_or(true, |t| record.observed_at >= t)
            && self.until.map_or(true, |t| record.observed_at <= t)
    }
}

/// One page of rows, newest first, plus the unpaged total
#[derive(Debug, Clone, PartialEq)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub total: usize,
    pub limit: usize,
    pub offset: usize,
}

/// Persistence for market rows and recommendations.
///
/// Both tables are append-only. "Latest" means highest insertion id.
/// Symbols are stored and looked up uppercased.
#[async_trait]
pub trait Storage: Send + Sync {
    async fn latest_market(&self, symbol: &str, kind: MarketKind) -> Result<Option<MarketRecord>, StorageError>;

    async fn insert_market(&self, event: &MarketEvent) -> Result<MarketRecord, StorageError>;

    async fn query_markets(
        &self,
        filter: &MarketFilter,
        limit: usize,
        offset: usize,
    ) -> Result<Page<MarketRecord>, StorageError>;

    async fn latest_recommendation(&self, currency: &str) -> Result<Option<Recommendation>, StorageError>;

    async fn insert_recommendation(&self, recommendation: NewRecommendation) -> Result<Recommendation, StorageError>;

    async fn query_recommendations(
        &self,
        currency: Option<&str>,
        limit: usize,
        offset: usize,
    ) -> Result<Page<Recommendation>, StorageError>;

    /// Market rows for `currency` observed in `[now - lookback, now]`,
    /// grouped by kind in chronological order
    async fn aggregated_window(&self, currency: &str, lookback: Duration) -> Result<AggregatedWindow, StorageError>;
}

fn window_range(lookback: Duration) -> Result<TimeRange, StorageError> {
    let span = chrono::Duration::from_std(lookback).map_err(|_| StorageError::InvalidLookback(lookback))?;
    let end = Utc::now();
    let start = end
        .checked_sub_signed(span)
        .ok_or(StorageError::InvalidLookback(lookback))?;
    Ok(TimeRange { start, end })
}

fn paginate<T: Clone>(newest_first: Vec<&T>, limit: usize, offset: usize) -> Page<T> {
    let total = newest_first.len();
    let items = newest_first.into_iter().skip(offset).take(limit).cloned().collect();
    Page { items, total, limit, offset }
}

// ============================================================================
// In-memory storage
// ============================================================================

#[derive(Debug, Default)]
pub struct MemoryStorage {
    markets: RwLock<Vec<MarketRecord>>,
    recommendations: RwLock<Vec<Recommendation>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn market_count(&self) -> usize {
        self.markets.read().len()
    }

    pub fn recommendation_count(&self) -> usize {
        self.recommendations.read().len()
    }
}

#[async_trait]
impl Storage for MemoryStorage {
    async fn latest_market(&self, symbol: &str, kind: MarketKind) -> Result<Option<MarketRecord>, StorageError> {
        let symbol = symbol.to_uppercase();
        Ok(self
            .markets
            .read()
            .iter()
            .rev()
            .find(|r| r.symbol == symbol && r.kind == kind)
            .cloned())
    }

    async fn insert_market(&self, event: &MarketEvent) -> Result<MarketRecord, StorageError> {
        let mut markets = self.markets.write();
        let record = MarketRecord {
            id: markets.len() as i64 + 1,
            symbol: event.symbol.to_uppercase(),
            kind: event.kind,
            observed_at: event.observed_at,
            payload: event.payload.clone(),
        };
        markets.push(record.clone());
        Ok(record)
    }

    async fn query_markets(
        &self,
        filter: &MarketFilter,
        limit: usize,
        offset: usize,
    ) -> Result<Page<MarketRecord>, StorageError> {
        let markets = self.markets.read();
        let matching: Vec<&MarketRecord> = markets.iter().rev().filter(|r| filter.matches(r)).collect();
        Ok(paginate(matching, limit, offset))
    }

    async fn latest_recommendation(&self, currency: &str) -> Result<Option<Recommendation>, StorageError> {
        let currency = currency.to_uppercase();
        Ok(self
            .recommendations
            .read()
            .iter()
            .rev()
            .find(|r| r.currency == currency)
            .cloned())
    }

    async fn insert_recommendation(&self, recommendation: NewRecommendation) -> Result<Recommendation, StorageError> {
        let mut recommendations = self.recommendations.write();
        let stored = recommendation.into_stored(recommendations.len() as i64 + 1);
        recommendations.push(stored.clone());
        Ok(stored)
    }

    async fn query_recommendations(
        &self,
        currency: Option<&str>,
        limit: usize,
        offset: usize,
    ) -> Result<Page<Recommendation>, StorageError> {
        let currency = currency.map(|c| c.to_uppercase());
        let recommendations = self.recommendations.read();
        let matching: Vec<&Recommendation> = recommendations
            .iter()
            .rev()
            .filter(|r| currency.as_deref().map_or(true, |c| r.currency == c))
            .collect();
        Ok(paginate(matching, limit, offset))
    }

    async fn aggregated_window(&self, currency: &str, lookback: Duration) -> Result<AggregatedWindow, StorageError> {
        let range = window_range(lookback)?;
        let filter = MarketFilter::for_symbol(currency).between(range.start, range.end);

        let mut rows: Vec<MarketRecord> = self
            .markets
            .read()
            .iter()
            .filter(|r| filter.matches(r))
            .cloned()
            .collect();
        rows.sort_by_key(|r| (r.observed_at, r.id));

        let mut window = AggregatedWindow::empty(currency, range);
        for row in rows {
            window.add(row.kind, WindowEntry { observed_at: row.observed_at, payload: row.payload });
        }
        Ok(window)
    }
}

// ============================================================================
// SQLite storage
// ============================================================================

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS market (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    symbol TEXT NOT NULL,
    kind TEXT NOT NULL,
    observed_at_ms INTEGER NOT NULL,
    payload TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_market_symbol_kind ON market (symbol, kind, id);
CREATE INDEX IF NOT EXISTS idx_market_symbol_time ON market (symbol, observed_at_ms);

CREATE TABLE IF NOT EXISTS trade_recommendation (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    currency TEXT NOT NULL,
    recommended_at_ms INTEGER NOT NULL,
    recommended_action TEXT NOT NULL,
    confidence REAL NOT NULL,
    raw_data TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_recommendation_currency ON trade_recommendation (currency, id);
";

const MARKET_COLUMNS: &str = "id, symbol, kind, observed_at_ms, payload";
const RECOMMENDATION_COLUMNS: &str = "id, currency, recommended_at_ms, recommended_action, confidence, raw_data";

fn from_millis(table: &'static str, id: i64, ms: i64) -> Result<DateTime<Utc>, StorageError> {
    Utc.timestamp_millis_opt(ms).single().ok_or_else(|| StorageError::CorruptRow {
        table,
        id,
        reason: format!("timestamp {}", ms),
    })
}

fn decode_json(table: &'static str, id: i64, raw: &str) -> Result<serde_json::Value, StorageError> {
    serde_json::from_str(raw).map_err(|e| StorageError::CorruptRow {
        table,
        id,
        reason: e.to_string(),
    })
}

struct MarketRow {
    id: i64,
    symbol: String,
    kind: String,
    observed_at_ms: i64,
    payload: String,
}

impl MarketRow {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            symbol: row.get(1)?,
            kind: row.get(2)?,
            observed_at_ms: row.get(3)?,
            payload: row.get(4)?,
        })
    }

    fn into_record(self) -> Result<MarketRecord, StorageError> {
        let kind = self.kind.parse::<MarketKind>().map_err(|reason| StorageError::CorruptRow {
            table: "market",
            id: self.id,
            reason,
        })?;
        Ok(MarketRecord {
            id: self.id,
            observed_at: from_millis("market", self.id, self.observed_at_ms)?,
            payload: decode_json("market", self.id, &self.payload)?,
            symbol: self.symbol,
            kind,
        })
    }
}

struct RecommendationRow {
    id: i64,
    currency: String,
    recommended_at_ms: i64,
    recommended_action: String,
    confidence: f64,
    raw_data: String,
}

impl RecommendationRow {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            currency: row.get(1)?,
            recommended_at_ms: row.get(2)?,
            recommended_action: row.get(3)?,
            confidence: row.get(4)?,
            raw_data: row.get(5)?,
        })
    }

    fn into_recommendation(self) -> Result<Recommendation, StorageError> {
        Ok(Recommendation {
            id: self.id,
            recommended_at: from_millis("trade_recommendation", self.id, self.recommended_at_ms)?,
            raw_data: decode_json("trade_recommendation", self.id, &self.raw_data)?,
            currency: self.currency,
            recommended_action: self.recommended_action,
            confidence: self.confidence,
        })
    }
}

fn market_where(filter: &MarketFilter) -> (String, Vec<SqlValue>) {
    let mut clauses = Vec::new();
    let mut args = Vec::new();

    if let Some(symbol) = &filter.symbol {
        clauses.push("symbol = ?");
        args.push(SqlValue::Text(symbol.to_uppercase()));
    }
    if let Some(kind) = filter.kind {
        clauses.push("kind = ?");
        args.push(SqlValue::Text(kind.as_str().to_string()));
    }
    if let Some(since) = filter.since {
        clauses.push("observed_at_ms >= ?");
        args.push(SqlValue::Integer(since.timestamp_millis()));
    }
    if let Some(until) = filter.until {
        clauses.push("observed_at_ms <= ?");
        args.push(SqlValue::Integer(until.timestamp_millis()));
    }

    if clauses.is_empty() {
        (String::new(), args)
    } else {
        (format!("WHERE {}", clauses.join(" AND ")), args)
    }
}

fn to_sql_int(n: usize) -> SqlValue {
    SqlValue::Integer(i64::try_from(n).unwrap_or(i64::MAX))
}

/// SQLite-backed storage. Blocking calls run on the blocking pool.
pub struct SqliteStorage {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStorage {
    pub fn open(path: &str) -> Result<Self, StorageError> {
        let conn = if path == ":memory:" {
            Connection::open_in_memory()?
        } else {
            if let Some(parent) = Path::new(path).parent() {
                std::fs::create_dir_all(parent).map_err(|e| StorageError::Backend(e.to_string()))?;
            }
            Connection::open(path)?
        };
        conn.execute_batch(SCHEMA)?;

        info!(path = path, "Storage opened");
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub fn from_config(config: &crate::core::StorageConfig) -> Result<Self, StorageError> {
        Self::open(&config.path)
    }

    async fn execute<T, F>(&self, op: F) -> Result<T, StorageError>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> Result<T, StorageError> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let mut guard = conn.lock();
            op(&mut *guard)
        })
        .await
        .map_err(|e| StorageError::Task(e.to_string()))?
    }
}

#[async_trait]
impl Storage for SqliteStorage {
    async fn latest_market(&self, symbol: &str, kind: MarketKind) -> Result<Option<MarketRecord>, StorageError> {
        let symbol = symbol.to_uppercase();
        self.execute(move |conn| {
            let sql = format!(
                "SELECT {} FROM market WHERE symbol = ?1 AND kind = ?2 ORDER BY id DESC LIMIT 1",
                MARKET_COLUMNS
            );
            let row = conn
                .query_row(&sql, params![symbol, kind.as_str()], MarketRow::from_row)
                .optional()?;
            row.map(MarketRow::into_record).transpose()
        })
        .await
    }

    async fn insert_market(&self, event: &MarketEvent) -> Result<MarketRecord, StorageError> {
        let event = event.clone();
        let symbol = event.symbol.to_uppercase();
        self.execute(move |conn| {
            let payload = serde_json::to_string(&event.payload).map_err(|e| StorageError::Backend(e.to_string()))?;
            conn.execute(
                "INSERT INTO market (symbol, kind, observed_at_ms, payload) VALUES (?1, ?2, ?3, ?4)",
                params![symbol, event.kind.as_str(), event.observed_at.timestamp_millis(), payload],
            )?;
            let id = conn.last_insert_rowid();
            debug!(id = id, symbol = %symbol, kind = %event.kind, "Market row inserted");

            Ok(MarketRecord {
                id,
                symbol,
                kind: event.kind,
                observed_at: event.observed_at,
                payload: event.payload,
            })
        })
        .await
    }

    async fn query_markets(
        &self,
        filter: &MarketFilter,
        limit: usize,
        offset: usize,
    ) -> Result<Page<MarketRecord>, StorageError> {
        let (where_sql, args) = market_where(filter);
        self.execute(move |conn| {
            let total: i64 = conn.query_row(
                &format!("SELECT COUNT(*) FROM market {}", where_sql),
                params_from_iter(args.iter()),
                |row| row.get(0),
            )?;

            let mut paged_args = args;
            paged_args.push(to_sql_int(limit));
            paged_args.push(to_sql_int(offset));

            let sql = format!(
                "SELECT {} FROM market {} ORDER BY id DESC LIMIT ? OFFSET ?",
                MARKET_COLUMNS, where_sql
            );
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt
                .query_map(params_from_iter(paged_args.iter()), MarketRow::from_row)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            let items = rows
                .into_iter()
                .map(MarketRow::into_record)
                .collect::<Result<Vec<_>, _>>()?;

            Ok(Page { items, total: total as usize, limit, offset })
        })
        .await
    }

    async fn latest_recommendation(&self, currency: &str) -> Result<Option<Recommendation>, StorageError> {
        let currency = currency.to_uppercase();
        self.execute(move |conn| {
            let sql = format!(
                "SELECT {} FROM trade_recommendation WHERE currency = ?1 ORDER BY id DESC LIMIT 1",
                RECOMMENDATION_COLUMNS
            );
            let row = conn
                .query_row(&sql, params![currency], RecommendationRow::from_row)
                .optional()?;
            row.map(RecommendationRow::into_recommendation).transpose()
        })
        .await
    }

    async fn insert_recommendation(&self, recommendation: NewRecommendation) -> Result<Recommendation, StorageError> {
        self.execute(move |conn| {
            let raw_data =
                serde_json::to_string(&recommendation.raw_data).map_err(|e| StorageError::Backend(e.to_string()))?;
            conn.execute(
                "INSERT INTO trade_recommendation
                    (currency, recommended_at_ms, recommended_action, confidence, raw_data)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    recommendation.currency,
                    recommendation.recommended_at.timestamp_millis(),
                    recommendation.recommended_action,
                    recommendation.confidence,
                    raw_data
                ],
            )?;
            let id = conn.last_insert_rowid();
            Ok(recommendation.into_stored(id))
        })
        .await
    }

    async fn query_recommendations(
        &self,
        currency: Option<&str>,
        limit: usize,
        offset: usize,
    ) -> Result<Page<Recommendation>, StorageError> {
        let currency = currency.map(|c| c.to_uppercase());
        self.execute(move |conn| {
            let (where_sql, mut args) = match currency {
                Some(c) => ("WHERE currency = ?", vec![SqlValue::Text(c)]),
                None => ("", Vec::new()),
            };

            let total: i64 = conn.query_row(
                &format!("SELECT COUNT(*) FROM trade_recommendation {}", where_sql),
                params_from_iter(args.iter()),
                |row| row.get(0),
            )?;

            args.push(to_sql_int(limit));
            args.push(to_sql_int(offset));
            let sql = format!(
                "SELECT {} FROM trade_recommendation {} ORDER BY id DESC LIMIT ? OFFSET ?",
                RECOMMENDATION_COLUMNS, where_sql
            );
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt
                .query_map(params_from_iter(args.iter()), RecommendationRow::from_row)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            let items = rows
                .into_iter()
                .map(RecommendationRow::into_recommendation)
                .collect::<Result<Vec<_>, _>>()?;

            Ok(Page { items, total: total as usize, limit, offset })
        })
        .await
    }

    async fn aggregated_window(&self, currency: &str, lookback: Duration) -> Result<AggregatedWindow, StorageError> {
        let range = window_range(lookback)?;
        let symbol = currency.to_uppercase();

        self.execute(move |conn| {
            let sql = format!(
                "SELECT {} FROM market
                 WHERE symbol = ?1 AND observed_at_ms >= ?2 AND observed_at_ms <= ?3
                 ORDER BY observed_at_ms ASC, id ASC",
                MARKET_COLUMNS
            );
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt
                .query_map(
                    params![symbol, range.start.timestamp_millis(), range.end.timestamp_millis()],
                    MarketRow::from_row,
                )?
                .collect::<rusqlite::Result<Vec<_>>>()?;

            let mut window = AggregatedWindow::empty(&symbol, range);
            for row in rows {
                let record = row.into_record()?;
                window.add(record.kind, WindowEntry { observed_at: record.observed_at, payload: record.payload });
            }
            Ok(window)
        })
        .await
    }
}
