//! Bot instance model and runtime-status reconciliation.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::domain::grid::GridBotConfig;
use crate::strategy::StrategySpec;

pub type UserId = i64;
pub type BotId = i64;

/// `last_error` is bounded so a runaway exchange message cannot bloat the
/// persisted record.
pub const MAX_LAST_ERROR_LEN: usize = 250;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BotType {
    Trend,
    Grid,
}

/// Why a bot last stopped. Only a user stop clears `is_running`
/// unconditionally; error stops stay eligible for supervised restart.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StopCause {
    User,
    Error,
}

/// One user-owned, independently runnable trading unit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BotInstance {
    pub id: BotId,
    pub user_id: UserId,
    pub name: String,
    pub bot_type: BotType,
    pub symbol: String,
    pub max_leverage: u32,
    /// Percent of the user's total balance earmarked for this bot.
    pub allocation_percent: Decimal,
    /// Trend bots only.
    pub strategy: Option<StrategySpec>,
    /// Grid bots only.
    pub grid: Option<GridBotConfig>,
    /// Soft-delete flag.
    pub is_active: bool,
    pub is_running: bool,
    pub total_trades: u32,
    pub winning_trades: u32,
    pub total_pnl: Decimal,
    pub last_error: Option<String>,
    pub stop_cause: Option<StopCause>,
    pub last_started_at: Option<DateTime<Utc>>,
    pub last_stopped_at: Option<DateTime<Utc>>,
}

impl BotInstance {
    pub fn new(
        id: BotId,
        user_id: UserId,
        name: impl Into<String>,
        bot_type: BotType,
        symbol: impl Into<String>,
        max_leverage: u32,
        allocation_percent: Decimal,
    ) -> Self {
        Self {
            id,
            user_id,
            name: name.into(),
            bot_type,
            symbol: symbol.into(),
            max_leverage,
            allocation_percent,
            strategy: None,
            grid: None,
            is_active: true,
            is_running: false,
            total_trades: 0,
            winning_trades: 0,
            total_pnl: Decimal::ZERO,
            last_error: None,
            stop_cause: None,
            last_started_at: None,
            last_stopped_at: None,
        }
    }

    pub fn with_strategy(mut self, spec: StrategySpec) -> Self {
        self.strategy = Some(spec);
        self
    }

    pub fn with_grid(mut self, grid: GridBotConfig) -> Self {
        self.grid = Some(grid);
        self
    }

    pub fn mark_started(&mut self) {
        self.is_running = true;
        self.stop_cause = None;
        self.last_error = None;
        self.last_started_at = Some(Utc::now());
    }

    pub fn mark_stopped(&mut self, cause: StopCause) {
        self.is_running = false;
        self.stop_cause = Some(cause);
        self.last_stopped_at = Some(Utc::now());
    }

    /// Store a bounded-length error message.
    pub fn set_last_error(&mut self, message: &str) {
        let mut msg = message.to_string();
        if msg.len() > MAX_LAST_ERROR_LEN {
            let mut end = MAX_LAST_ERROR_LEN;
            while !msg.is_char_boundary(end) {
                end -= 1;
            }
            msg.truncate(end);
        }
        self.last_error = Some(msg);
    }

    /// Update win/loss counters when a round trip closes.
    pub fn record_trade_result(&mut self, pnl: Decimal) {
        self.total_trades += 1;
        if pnl > Decimal::ZERO {
            self.winning_trades += 1;
        }
        self.total_pnl += pnl;
    }

    pub fn win_rate(&self) -> f64 {
        if self.total_trades == 0 {
            0.0
        } else {
            self.winning_trades as f64 / self.total_trades as f64 * 100.0
        }
    }
}

/// Persisted `is_running` vs in-memory task liveness, computed once and
/// branched on exhaustively instead of duck-typed liveness probing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BotRuntimeStatus {
    DbRunningMemoryRunning,
    DbRunningMemoryStopped,
    DbStoppedMemoryRunning,
    DbStoppedMemoryStopped,
}

impl BotRuntimeStatus {
    pub fn of(db_running: bool, task_alive: bool) -> Self {
        match (db_running, task_alive) {
            (true, true) => BotRuntimeStatus::DbRunningMemoryRunning,
            (true, false) => BotRuntimeStatus::DbRunningMemoryStopped,
            (false, true) => BotRuntimeStatus::DbStoppedMemoryRunning,
            (false, false) => BotRuntimeStatus::DbStoppedMemoryStopped,
        }
    }

    /// True when persisted and in-memory state agree.
    pub fn is_consistent(&self) -> bool {
        matches!(
            self,
            BotRuntimeStatus::DbRunningMemoryRunning | BotRuntimeStatus::DbStoppedMemoryStopped
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn bot() -> BotInstance {
        BotInstance::new(1, 100, "eth-trend", BotType::Trend, "ETHUSDT", 10, dec!(25))
    }

    #[test]
    fn test_start_stop_lifecycle() {
        let mut b = bot();
        assert!(!b.is_running);

        b.mark_started();
        assert!(b.is_running);
        assert!(b.last_started_at.is_some());
        assert!(b.stop_cause.is_none());

        b.mark_stopped(StopCause::User);
        assert!(!b.is_running);
        assert_eq!(b.stop_cause, Some(StopCause::User));
        assert!(b.last_stopped_at.is_some());
    }

    #[test]
    fn test_last_error_bounded() {
        let mut b = bot();
        b.set_last_error(&"x".repeat(1000));
        assert_eq!(b.last_error.as_ref().unwrap().len(), MAX_LAST_ERROR_LEN);

        b.set_last_error("short");
        assert_eq!(b.last_error.as_deref(), Some("short"));
    }

    #[test]
    fn test_trade_stats() {
        let mut b = bot();
        b.record_trade_result(dec!(10));
        b.record_trade_result(dec!(-4));
        b.record_trade_result(dec!(6));

        assert_eq!(b.total_trades, 3);
        assert_eq!(b.winning_trades, 2);
        assert_eq!(b.total_pnl, dec!(12));
        assert!((b.win_rate() - 66.666).abs() < 0.01);
    }

    #[test]
    fn test_runtime_status_exhaustive() {
        assert_eq!(
            BotRuntimeStatus::of(true, true),
            BotRuntimeStatus::DbRunningMemoryRunning
        );
        assert_eq!(
            BotRuntimeStatus::of(true, false),
            BotRuntimeStatus::DbRunningMemoryStopped
        );
        assert_eq!(
            BotRuntimeStatus::of(false, true),
            BotRuntimeStatus::DbStoppedMemoryRunning
        );
        assert_eq!(
            BotRuntimeStatus::of(false, false),
            BotRuntimeStatus::DbStoppedMemoryStopped
        );
        assert!(BotRuntimeStatus::of(true, true).is_consistent());
        assert!(!BotRuntimeStatus::of(true, false).is_consistent());
    }
}
