//! Configuration Loader
//!
//! Loads and validates TOML configuration matching config.toml structure.
//! Secrets come from the environment (.env), never from the config file.

use std::path::Path;

use rust_decimal::Decimal;
use serde::Deserialize;
use thiserror::Error;

use crate::domain::bot::{BotInstance, BotType};
use crate::domain::grid::GridBotConfig;
use crate::domain::risk::RiskSettings;
use crate::strategy::StrategySpec;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse TOML: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Main configuration structure matching config.toml.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub exchange: ExchangeSection,
    #[serde(default)]
    pub feed: FeedSection,
    #[serde(default)]
    pub allocation: AllocationSection,
    #[serde(default)]
    pub trend: TrendSection,
    #[serde(default)]
    pub grid: GridSection,
    #[serde(default)]
    pub risk: RiskSection,
    #[serde(default)]
    pub storage: StorageSection,
    #[serde(default)]
    pub logging: LoggingSection,
    #[serde(default)]
    pub alerts: AlertsSection,
    #[serde(default)]
    pub bots: Vec<BotSection>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ExchangeSection {
    /// Bitget-compatible REST gateway base URL
    pub rest_url: String,
    /// API key; the BOTFLEET_API_KEY env var overrides this
    #[serde(default)]
    pub api_key: Option<String>,
    /// API passphrase; the BOTFLEET_PASSPHRASE env var overrides this
    #[serde(default)]
    pub passphrase: Option<String>,
    #[serde(default = "default_margin_coin")]
    pub margin_coin: String,
    #[serde(default = "default_product_type")]
    pub product_type: String,
}

fn default_margin_coin() -> String {
    "USDT".to_string()
}

fn default_product_type() -> String {
    "USDT-FUTURES".to_string()
}

impl ExchangeSection {
    pub fn get_api_key(&self) -> Option<String> {
        std::env::var("BOTFLEET_API_KEY").ok().or_else(|| self.api_key.clone())
    }

    pub fn get_passphrase(&self) -> Option<String> {
        std::env::var("BOTFLEET_PASSPHRASE").ok().or_else(|| self.passphrase.clone())
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct FeedSection {
    /// REST price-poll interval in seconds
    pub poll_interval_secs: u64,
}

impl Default for FeedSection {
    fn default() -> Self {
        Self { poll_interval_secs: 3 }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct AllocationSection {
    /// Balance cache TTL in seconds
    pub balance_ttl_secs: u64,
    /// Allow two bots to hold the same symbol for one user
    pub allow_shared_symbol: bool,
}

impl Default for AllocationSection {
    fn default() -> Self {
        Self { balance_ttl_secs: 10, allow_shared_symbol: false }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct TrendSection {
    pub tick_wait_secs: u64,
    pub stop_loss_pct: f64,
    pub take_profit_pct: f64,
    pub candle_period_secs: i64,
    pub candle_capacity: usize,
}

impl Default for TrendSection {
    fn default() -> Self {
        Self {
            tick_wait_secs: 3,
            stop_loss_pct: 5.0,
            take_profit_pct: 10.0,
            candle_period_secs: 60,
            candle_capacity: 200,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct GridSection {
    /// Minimum interval between order-status sweeps in seconds
    pub check_interval_secs: u64,
}

impl Default for GridSection {
    fn default() -> Self {
        Self { check_interval_secs: 3 }
    }
}

/// Default per-user risk limits, applied when the store holds none.
#[derive(Debug, Clone, Deserialize)]
pub struct RiskSection {
    pub daily_loss_limit: Decimal,
    pub max_leverage: u32,
    pub max_positions: u32,
}

impl Default for RiskSection {
    fn default() -> Self {
        let defaults = RiskSettings::default();
        Self {
            daily_loss_limit: defaults.daily_loss_limit,
            max_leverage: defaults.max_leverage,
            max_positions: defaults.max_positions,
        }
    }
}

impl RiskSection {
    pub fn to_settings(&self) -> RiskSettings {
        RiskSettings {
            daily_loss_limit: self.daily_loss_limit,
            max_leverage: self.max_leverage,
            max_positions: self.max_positions,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct StorageSection {
    /// Snapshot file for crash recovery; `~` expands to the home directory
    pub snapshot_path: String,
}

impl Default for StorageSection {
    fn default() -> Self {
        Self { snapshot_path: "data/state.json".to_string() }
    }
}

impl StorageSection {
    pub fn expanded_path(&self) -> String {
        shellexpand::tilde(&self.snapshot_path).to_string()
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingSection {
    /// trace | debug | info | warn | error
    pub level: String,
}

impl Default for LoggingSection {
    fn default() -> Self {
        Self { level: "info".to_string() }
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct AlertsSection {
    #[serde(default)]
    pub webhook_enabled: bool,
    #[serde(default)]
    pub webhook_url: String,
}

/// One bot instance declared in config.
#[derive(Debug, Clone, Deserialize)]
pub struct BotSection {
    pub id: i64,
    pub user_id: i64,
    pub name: String,
    #[serde(rename = "type")]
    pub bot_type: BotType,
    pub symbol: String,
    pub max_leverage: u32,
    pub allocation_percent: Decimal,
    #[serde(default)]
    pub strategy: Option<StrategySpec>,
    #[serde(default)]
    pub grid: Option<GridBotConfig>,
}

impl BotSection {
    pub fn to_instance(&self) -> BotInstance {
        let mut bot = BotInstance::new(
            self.id,
            self.user_id,
            self.name.clone(),
            self.bot_type,
            self.symbol.clone(),
            self.max_leverage,
            self.allocation_percent,
        );
        bot.strategy = self.strategy.clone();
        bot.grid = self.grid.clone();
        bot
    }
}

/// Load and validate configuration from a TOML file.
pub fn load_config(path: impl AsRef<Path>) -> Result<Config, ConfigError> {
    let content = std::fs::read_to_string(path)?;
    let config: Config = toml::from_str(&content)?;
    config.validate()?;
    Ok(config)
}

impl Config {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.exchange.rest_url.is_empty() {
            return Err(ConfigError::Invalid("exchange.rest_url must be set".into()));
        }

        self.risk
            .to_settings()
            .validate()
            .map_err(|e| ConfigError::Invalid(e.to_string()))?;

        let mut seen = std::collections::HashSet::new();
        let mut per_user: std::collections::HashMap<i64, Decimal> = std::collections::HashMap::new();

        for bot in &self.bots {
            if !seen.insert(bot.id) {
                return Err(ConfigError::Invalid(format!("duplicate bot id {}", bot.id)));
            }
            match bot.bot_type {
                BotType::Trend => {
                    let spec = bot.strategy.as_ref().ok_or_else(|| {
                        ConfigError::Invalid(format!("trend bot {} needs a [bots.strategy]", bot.id))
                    })?;
                    spec.validate()
                        .map_err(|e| ConfigError::Invalid(format!("bot {}: {e}", bot.id)))?;
                }
                BotType::Grid => {
                    let grid = bot.grid.as_ref().ok_or_else(|| {
                        ConfigError::Invalid(format!("grid bot {} needs a [bots.grid]", bot.id))
                    })?;
                    grid.validate()
                        .map_err(|e| ConfigError::Invalid(format!("bot {}: {e}", bot.id)))?;
                }
            }
            if bot.allocation_percent <= Decimal::ZERO {
                return Err(ConfigError::Invalid(format!(
                    "bot {}: allocation_percent must be positive",
                    bot.id
                )));
            }
            *per_user.entry(bot.user_id).or_default() += bot.allocation_percent;
        }

        for (user, total) in per_user {
            if total > Decimal::ONE_HUNDRED {
                return Err(ConfigError::Invalid(format!(
                    "user {user}: allocations total {total}%, over 100%"
                )));
            }
        }

        if self.alerts.webhook_enabled && self.alerts.webhook_url.is_empty() {
            return Err(ConfigError::Invalid(
                "alerts.webhook_url required when webhook_enabled".into(),
            ));
        }

        Ok(())
    }
}
