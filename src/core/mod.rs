// Core Module - Foundational types, config, logging

pub mod types;
pub mod config;
pub mod logger;

// Re-export commonly used items for convenience
pub use types::*;
pub use config::{
    StreamConfig, QueueConfig, StorageConfig, SchedulerConfig, AiConfig, MonitoringConfig,
    ConfigManager, ConfigSummary, ConfigError, DEFAULT_SYMBOLS,
};
pub use logger::{setup_logging, setup_logging_from_config};
