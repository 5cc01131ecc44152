use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::domain::bot::{BotId, UserId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Long,
    Short,
}

impl Side {
    pub fn flipped(&self) -> Self {
        match self {
            Side::Long => Side::Short,
            Side::Short => Side::Long,
        }
    }
}

impl std::fmt::Display for Side {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Side::Long => write!(f, "long"),
            Side::Short => write!(f, "short"),
        }
    }
}

#[derive(Debug, Error)]
pub enum PositionError {
    #[error("Invalid size: {0}")]
    InvalidSize(Decimal),
    #[error("Invalid entry price: {0}")]
    InvalidEntryPrice(Decimal),
}

/// A persisted open position.
///
/// `bot_id` is `None` for positions opened outside the multi-bot subsystem
/// (manual trades, legacy records); the isolation registry still counts
/// those as holding the symbol.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PositionRecord {
    pub id: i64,
    pub user_id: UserId,
    pub bot_id: Option<BotId>,
    pub symbol: String,
    pub side: Side,
    pub size: Decimal,
    pub entry_price: Decimal,
    pub leverage: u32,
    pub unrealized_pnl: Decimal,
    pub opened_at: DateTime<Utc>,
}

impl PositionRecord {
    pub fn new(
        user_id: UserId,
        bot_id: Option<BotId>,
        symbol: impl Into<String>,
        side: Side,
        size: Decimal,
        entry_price: Decimal,
        leverage: u32,
    ) -> Result<Self, PositionError> {
        if size <= Decimal::ZERO {
            return Err(PositionError::InvalidSize(size));
        }
        if entry_price <= Decimal::ZERO {
            return Err(PositionError::InvalidEntryPrice(entry_price));
        }

        Ok(Self {
            id: 0,
            user_id,
            bot_id,
            symbol: symbol.into(),
            side,
            size,
            entry_price,
            leverage,
            unrealized_pnl: Decimal::ZERO,
            opened_at: Utc::now(),
        })
    }

    /// Average in an additional fill (pyramiding).
    pub fn average_in(&mut self, add_size: Decimal, fill_price: Decimal) -> Result<(), PositionError> {
        if add_size <= Decimal::ZERO {
            return Err(PositionError::InvalidSize(add_size));
        }
        if fill_price <= Decimal::ZERO {
            return Err(PositionError::InvalidEntryPrice(fill_price));
        }
        let new_size = self.size + add_size;
        self.entry_price =
            (self.entry_price * self.size + fill_price * add_size) / new_size;
        self.size = new_size;
        Ok(())
    }

    /// Leveraged PnL at the given exit price, sign-flipped for shorts.
    pub fn realized_pnl(&self, exit_price: Decimal) -> Decimal {
        let raw = (exit_price - self.entry_price) * self.size * Decimal::from(self.leverage);
        match self.side {
            Side::Long => raw,
            Side::Short => -raw,
        }
    }
}
