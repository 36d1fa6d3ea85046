// Configuration Management for Smart Trade
// JSON file sections + environment overrides, passed explicitly to components

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use parking_lot::RwLock;
use thiserror::Error;
use tracing::{info, warn};

// ============================================================================
// Error Type
// ============================================================================

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON parse error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Validation error: {0}")]
    Validation(String),
}

/// Default symbol universe (Bybit linear USDT perpetuals)
pub const DEFAULT_SYMBOLS: [&str; 19] = [
    "BTCUSDT", "ETHUSDT", "BNBUSDT", "XRPUSDT", "SOLUSDT",
    "ADAUSDT", "DOGEUSDT", "MATICUSDT", "DOTUSDT", "LTCUSDT",
    "AVAXUSDT", "LINKUSDT", "ATOMUSDT", "XMRUSDT",
    "ETCUSDT", "BCHUSDT", "NEARUSDT", "APTUSDT", "FILUSDT",
];

// ============================================================================
// Configuration Structures
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamConfig {
    pub ws_url: String,
    pub symbols: Vec<String>,
    pub orderbook_depth: u32,
    pub kline_interval: String,

    // Reconnect policy (fixed delays, no cap)
    pub reconnect_delay_ms: u64,
    pub restart_delay_ms: u64,
    pub heartbeat_interval_secs: u64,

    // Capacity of the I/O thread -> worker handoff channel
    pub channel_capacity: usize,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            ws_url: "wss://stream.bybit.com/v5/public/linear".to_string(),
            symbols: DEFAULT_SYMBOLS.iter().map(|s| s.to_string()).collect(),
            orderbook_depth: 50,
            kline_interval: "1".to_string(),
            reconnect_delay_ms: 1_000,
            restart_delay_ms: 5_000,
            heartbeat_interval_secs: 20,
            channel_capacity: 10_000,
        }
    }
}

impl StreamConfig {
    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }

    pub fn restart_delay(&self) -> Duration {
        Duration::from_millis(self.restart_delay_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    pub path: String,
    pub batch_size: usize,
    pub pop_idle_ms: u64,
    pub reconnect_delay_ms: u64,
    pub max_pending_events: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            path: "data/market_queue.db".to_string(),
            batch_size: 100,
            pop_idle_ms: 100,
            reconnect_delay_ms: 1_000,
            max_pending_events: 10_000,
        }
    }
}

impl QueueConfig {
    pub fn pop_idle(&self) -> Duration {
        Duration::from_millis(self.pop_idle_ms)
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub path: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            path: "data/smart_trade.db".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    pub short_term_minutes: u64,
    pub long_term_minutes: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            short_term_minutes: 5,
            long_term_minutes: 1440,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AiConfig {
    pub api_key: String,
    pub base_url: String,
    pub model: String,
    pub temperature: f64,
    pub request_timeout_seconds: u64,
}

impl Default for AiConfig {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            base_url: "https://api.openai.com/v1".to_string(),
            model: "gpt-3.5-turbo".to_string(),
            temperature: 0.7,
            request_timeout_seconds: 60,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitoringConfig {
    pub log_level: String,
    pub json_format: bool,
}

impl Default for MonitoringConfig {
    fn default() -> Self {
        Self {
            log_level: "INFO".to_string(),
            json_format: false,
        }
    }
}

// ============================================================================
// Configuration Summary
// ============================================================================

#[derive(Debug, Clone, Serialize)]
pub struct ConfigSummary {
    pub symbols: usize,
    pub batch_size: usize,
    pub short_term_minutes: u64,
    pub long_term_minutes: u64,
    pub model: String,
    pub log_level: String,
}

// ============================================================================
// Configuration Manager
// ============================================================================

/// Owns every config section. Built once at startup and handed to the
/// components that need it.
pub struct ConfigManager {
    stream: Arc<RwLock<StreamConfig>>,
    queue: Arc<RwLock<QueueConfig>>,
    storage: Arc<RwLock<StorageConfig>>,
    scheduler: Arc<RwLock<SchedulerConfig>>,
    ai: Arc<RwLock<AiConfig>>,
    monitoring: Arc<RwLock<MonitoringConfig>>,
}

impl ConfigManager {
    pub fn new(config_path: Option<&str>) -> Result<Self, ConfigError> {
        let mut manager = Self {
            stream: Arc::new(RwLock::new(StreamConfig::default())),
            queue: Arc::new(RwLock::new(QueueConfig::default())),
            storage: Arc::new(RwLock::new(StorageConfig::default())),
            scheduler: Arc::new(RwLock::new(SchedulerConfig::default())),
            ai: Arc::new(RwLock::new(AiConfig::default())),
            monitoring: Arc::new(RwLock::new(MonitoringConfig::default())),
        };

        if let Some(path) = config_path {
            manager.load_from_file(path)?;
        }

        manager.load_from_env();

        info!("Configuration initialized");
        Ok(manager)
    }

    /// Load configuration from JSON file. Missing sections keep defaults.
    pub fn load_from_file(&mut self, config_path: &str) -> Result<(), ConfigError> {
        let path = Path::new(config_path);
        if !path.exists() {
            warn!(path = config_path, "Config file not found");
            return Ok(());
        }

        let content = fs::read_to_string(path)?;
        let config_data: HashMap<String, serde_json::Value> = serde_json::from_str(&content)?;

        if let Some(data) = config_data.get("stream") {
            *self.stream.write() = serde_json::from_value(data.clone())?;
        }
        if let Some(data) = config_data.get("queue") {
            *self.queue.write() = serde_json::from_value(data.clone())?;
        }
        if let Some(data) = config_data.get("storage") {
            *self.storage.write() = serde_json::from_value(data.clone())?;
        }
        if let Some(data) = config_data.get("scheduler") {
            *self.scheduler.write() = serde_json::from_value(data.clone())?;
        }
        if let Some(data) = config_data.get("ai") {
            *self.ai.write() = serde_json::from_value(data.clone())?;
        }
        if let Some(data) = config_data.get("monitoring") {
            *self.monitoring.write() = serde_json::from_value(data.clone())?;
        }

        info!(path = config_path, "Configuration loaded");
        Ok(())
    }

    /// Load secrets and overrides from environment variables
    pub fn load_from_env(&mut self) {
        if let Ok(api_key) = std::env::var("OPENAI_API_KEY") {
            self.ai.write().api_key = api_key;
        }
        if let Ok(level) = std::env::var("SMART_TRADE_LOG_LEVEL") {
            self.monitoring.write().log_level = level;
        }
        if let Ok(symbols) = std::env::var("SMART_TRADE_SYMBOLS") {
            let parsed: Vec<String> = symbols
                .split(',')
                .map(|s| s.trim().to_uppercase())
                .filter(|s| !s.is_empty())
                .collect();
            if !parsed.is_empty() {
                self.stream.write().symbols = parsed;
            }
        }
    }

    /// Save configuration to JSON file (AI key excluded)
    pub fn save_to_file(&self, config_path: &str) -> Result<(), ConfigError> {
        let mut ai = self.ai.read().clone();
        ai.api_key.clear();

        let mut config_map = HashMap::new();
        config_map.insert("stream", serde_json::to_value(&*self.stream.read())?);
        config_map.insert("queue", serde_json::to_value(&*self.queue.read())?);
        config_map.insert("storage", serde_json::to_value(&*self.storage.read())?);
        config_map.insert("scheduler", serde_json::to_value(&*self.scheduler.read())?);
        config_map.insert("ai", serde_json::to_value(&ai)?);
        config_map.insert("monitoring", serde_json::to_value(&*self.monitoring.read())?);

        if let Some(parent) = Path::new(config_path).parent() {
            fs::create_dir_all(parent)?;
        }

        let json = serde_json::to_string_pretty(&config_map)?;
        fs::write(config_path, json)?;

        info!(path = config_path, "Configuration saved");
        Ok(())
    }

    /// Validate configuration. Returns Ok(false) and logs every problem when
    /// something is off.
    pub fn validate(&self) -> Result<bool, ConfigError> {
        let mut errors = Vec::new();
        let stream = self.stream.read();
        let queue = self.queue.read();
        let scheduler = self.scheduler.read();
        let ai = self.ai.read();

        if stream.symbols.is_empty() {
            errors.push("at least one symbol is required".to_string());
        }
        if stream.channel_capacity == 0 {
            errors.push("channel_capacity must be positive".to_string());
        }
        if queue.batch_size == 0 {
            errors.push("batch_size must be positive".to_string());
        }
        if queue.max_pending_events < queue.batch_size {
            errors.push("max_pending_events must be at least batch_size".to_string());
        }
        if scheduler.short_term_minutes == 0 || scheduler.long_term_minutes == 0 {
            errors.push("scheduler intervals must be positive".to_string());
        }
        if ai.api_key.is_empty() {
            errors.push("AI API key is required".to_string());
        }

        if !errors.is_empty() {
            for error in &errors {
                warn!(error = %error, "Config validation error");
            }
            return Ok(false);
        }

        info!("Configuration validated successfully");
        Ok(true)
    }

    pub fn get_summary(&self) -> ConfigSummary {
        let stream = self.stream.read();
        let queue = self.queue.read();
        let scheduler = self.scheduler.read();

        ConfigSummary {
            symbols: stream.symbols.len(),
            batch_size: queue.batch_size,
            short_term_minutes: scheduler.short_term_minutes,
            long_term_minutes: scheduler.long_term_minutes,
            model: self.ai.read().model.clone(),
            log_level: self.monitoring.read().log_level.clone(),
        }
    }

    pub fn stream(&self) -> StreamConfig {
        self.stream.read().clone()
    }

    pub fn queue(&self) -> QueueConfig {
        self.queue.read().clone()
    }

    pub fn storage(&self) -> StorageConfig {
        self.storage.read().clone()
    }

    pub fn scheduler(&self) -> SchedulerConfig {
        self.scheduler.read().clone()
    }

    pub fn ai(&self) -> AiConfig {
        self.ai.read().clone()
    }

    pub fn monitoring(&self) -> MonitoringConfig {
        self.monitoring.read().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_configs() {
        let stream = StreamConfig::default();
        assert_eq!(stream.symbols.len(), 19);
        assert!(stream.symbols.contains(&"NEARUSDT".to_string()));
        assert_eq!(stream.reconnect_delay(), Duration::from_secs(1));
        assert_eq!(stream.restart_delay(), Duration::from_secs(5));

        let scheduler = SchedulerConfig::default();
        assert_eq!(scheduler.short_term_minutes, 5);
        assert_eq!(scheduler.long_term_minutes, 1440);
    }

    #[test]
    fn test_validation_requires_ai_key() {
        let manager = ConfigManager {
            stream: Arc::new(RwLock::new(StreamConfig::default())),
            queue: Arc::new(RwLock::new(QueueConfig::default())),
            storage: Arc::new(RwLock::new(StorageConfig::default())),
            scheduler: Arc::new(RwLock::new(SchedulerConfig::default())),
            ai: Arc::new(RwLock::new(AiConfig::default())),
            monitoring: Arc::new(RwLock::new(MonitoringConfig::default())),
        };
        assert!(!manager.validate().unwrap());

        manager.ai.write().api_key = "sk-test".to_string();
        assert!(manager.validate().unwrap());
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        fs::write(&path, r#"{"queue": {"batch_size": 5}, "scheduler": {"short_term_minutes": 1}}"#).unwrap();

        let mut manager = ConfigManager::new(None).unwrap();
        manager.load_from_file(path.to_str().unwrap()).unwrap();

        assert_eq!(manager.queue().batch_size, 5);
        assert_eq!(manager.queue().pop_idle_ms, 100);
        assert_eq!(manager.scheduler().short_term_minutes, 1);
        assert_eq!(manager.scheduler().long_term_minutes, 1440);
    }

    #[test]
    fn test_save_excludes_api_key() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.json");

        let manager = ConfigManager::new(None).unwrap();
        manager.ai.write().api_key = "sk-secret".to_string();
        manager.save_to_file(path.to_str().unwrap()).unwrap();

        let saved = fs::read_to_string(&path).unwrap();
        assert!(!saved.contains("sk-secret"));
        assert!(saved.contains("batch_size"));
    }
}
