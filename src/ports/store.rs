//! Persistence port - CRUD over bots, trades, positions, grid rungs and
//! risk settings. Schema migrations and query policy live behind the
//! adapter; the core only reads and writes through this interface.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::domain::bot::{BotId, BotInstance, UserId};
use crate::domain::grid::GridRung;
use crate::domain::position::PositionRecord;
use crate::domain::risk::RiskSettings;
use crate::domain::trade::{Trade, TradeExit};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Not found: {0}")]
    NotFound(String),
    #[error("Persistence error: {0}")]
    Io(String),
    #[error("Serialization error: {0}")]
    Serialization(String),
}

#[async_trait]
pub trait StorePort: Send + Sync {
    // Bots
    async fn bot(&self, bot_id: BotId) -> Result<Option<BotInstance>, StoreError>;
    async fn save_bot(&self, bot: &BotInstance) -> Result<(), StoreError>;
    async fn bots_for_user(&self, user_id: UserId) -> Result<Vec<BotInstance>, StoreError>;
    async fn all_bots(&self) -> Result<Vec<BotInstance>, StoreError>;

    // Trades
    /// Insert an open trade, returning its assigned id.
    async fn insert_trade(&self, trade: &Trade) -> Result<i64, StoreError>;
    /// Complete a trade exactly once; later calls are no-ops at the store.
    async fn complete_trade(&self, trade_id: i64, exit: &TradeExit) -> Result<(), StoreError>;
    async fn trades_since(
        &self,
        user_id: UserId,
        since: DateTime<Utc>,
    ) -> Result<Vec<Trade>, StoreError>;

    // Positions
    async fn insert_position(&self, position: &PositionRecord) -> Result<i64, StoreError>;
    async fn update_position(&self, position: &PositionRecord) -> Result<(), StoreError>;
    async fn delete_position(&self, position_id: i64) -> Result<(), StoreError>;
    /// Open positions, all users when `user_id` is `None`.
    async fn open_positions(
        &self,
        user_id: Option<UserId>,
    ) -> Result<Vec<PositionRecord>, StoreError>;

    // Grid rungs
    async fn grid_rungs(&self, bot_id: BotId) -> Result<Vec<GridRung>, StoreError>;
    async fn save_grid_rungs(&self, bot_id: BotId, rungs: &[GridRung]) -> Result<(), StoreError>;

    // Risk settings
    /// Per-user settings, falling back to defaults when none are stored.
    async fn risk_settings(&self, user_id: UserId) -> Result<RiskSettings, StoreError>;
}
