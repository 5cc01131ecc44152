use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::domain::bot::{BotId, UserId};
use crate::domain::position::Side;

/// Why a round trip ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExitReason {
    TakeProfit,
    StopLoss,
    SignalReverse,
    Manual,
    Liquidation,
}

impl std::fmt::Display for ExitReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ExitReason::TakeProfit => "take_profit",
            ExitReason::StopLoss => "stop_loss",
            ExitReason::SignalReverse => "signal_reverse",
            ExitReason::Manual => "manual",
            ExitReason::Liquidation => "liquidation",
        };
        write!(f, "{s}")
    }
}

/// Append-only record of one round trip (entry + exit).
///
/// Created at entry with all exit fields `None`; completed exactly once.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trade {
    pub id: i64,
    pub user_id: UserId,
    pub bot_id: Option<BotId>,
    pub symbol: String,
    pub side: Side,
    pub qty: Decimal,
    pub entry_price: Decimal,
    pub exit_price: Option<Decimal>,
    pub pnl: Option<Decimal>,
    pub pnl_percent: Option<Decimal>,
    pub leverage: u32,
    pub exit_reason: Option<ExitReason>,
    /// Free-text signal provenance for chart markup.
    pub enter_tag: Option<String>,
    pub exit_tag: Option<String>,
    pub opened_at: DateTime<Utc>,
    pub closed_at: Option<DateTime<Utc>>,
}

/// Exit fields applied once when a trade closes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TradeExit {
    pub exit_price: Decimal,
    pub pnl: Decimal,
    pub pnl_percent: Decimal,
    pub exit_reason: ExitReason,
    pub exit_tag: Option<String>,
    pub closed_at: DateTime<Utc>,
}

impl Trade {
    pub fn open(
        user_id: UserId,
        bot_id: Option<BotId>,
        symbol: impl Into<String>,
        side: Side,
        qty: Decimal,
        entry_price: Decimal,
        leverage: u32,
        enter_tag: Option<String>,
    ) -> Self {
        Self {
            id: 0,
            user_id,
            bot_id,
            symbol: symbol.into(),
            side,
            qty,
            entry_price,
            exit_price: None,
            pnl: None,
            pnl_percent: None,
            leverage,
            exit_reason: None,
            enter_tag,
            exit_tag: None,
            opened_at: Utc::now(),
            closed_at: None,
        }
    }

    pub fn is_closed(&self) -> bool {
        self.exit_price.is_some()
    }

    /// Apply exit fields. Ignored (returns false) if already closed.
    pub fn apply_exit(&mut self, exit: TradeExit) -> bool {
        if self.is_closed() {
            return false;
        }
        self.exit_price = Some(exit.exit_price);
        self.pnl = Some(exit.pnl);
        self.pnl_percent = Some(exit.pnl_percent);
        self.exit_reason = Some(exit.exit_reason);
        self.exit_tag = exit.exit_tag;
        self.closed_at = Some(exit.closed_at);
        true
    }

    /// Exit fields for closing at `exit_price`, with leveraged PnL.
    pub fn exit_at(
        &self,
        exit_price: Decimal,
        reason: ExitReason,
        exit_tag: Option<String>,
    ) -> TradeExit {
        let raw = (exit_price - self.entry_price) * self.qty * Decimal::from(self.leverage);
        let pnl = match self.side {
            Side::Long => raw,
            Side::Short => -raw,
        };
        let notional = self.entry_price * self.qty;
        let pnl_percent = if notional.is_zero() {
            Decimal::ZERO
        } else {
            pnl / notional * Decimal::from(100)
        };
        TradeExit {
            exit_price,
            pnl,
            pnl_percent,
            exit_reason: reason,
            exit_tag,
            closed_at: Utc::now(),
        }
    }
}
