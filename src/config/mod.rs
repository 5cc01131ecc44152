//! Configuration Layer

mod loader;

pub use loader::{
    load_config, AlertsSection, AllocationSection, BotSection, Config, ConfigError,
    ExchangeSection, FeedSection, GridSection, LoggingSection, RiskSection, StorageSection,
    TrendSection,
};
