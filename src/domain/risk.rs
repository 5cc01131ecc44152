//! Risk gate
//!
//! Layered pre-entry checks: daily loss limit, open-position count and a
//! leverage clamp. All checks read fresh state immediately before order
//! submission - balances and positions move between signals.

use std::sync::Arc;

use chrono::Utc;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::domain::bot::UserId;
use crate::ports::exchange::{ExchangeError, ExchangePort};
use crate::ports::store::{StoreError, StorePort};

#[derive(Debug, Error)]
pub enum RiskError {
    #[error("Invalid risk settings: {0}")]
    InvalidSettings(String),
    #[error("Store error: {0}")]
    Store(#[from] StoreError),
    #[error("Exchange error: {0}")]
    Exchange(#[from] ExchangeError),
}

/// Per-user risk limits. Read-only to the core; mutated by the settings API.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RiskSettings {
    /// Daily loss cap in USDT; new entries are blocked once today's realized
    /// loss reaches it.
    pub daily_loss_limit: Decimal,
    pub max_leverage: u32,
    pub max_positions: u32,
}

impl Default for RiskSettings {
    fn default() -> Self {
        Self {
            daily_loss_limit: dec!(500),
            max_leverage: 20,
            max_positions: 10,
        }
    }
}

impl RiskSettings {
    pub fn validate(&self) -> Result<(), RiskError> {
        if self.daily_loss_limit <= Decimal::ZERO {
            return Err(RiskError::InvalidSettings(format!(
                "daily_loss_limit {} must be positive",
                self.daily_loss_limit
            )));
        }
        if !(1..=100).contains(&self.max_leverage) {
            return Err(RiskError::InvalidSettings(format!(
                "max_leverage {} out of range 1-100",
                self.max_leverage
            )));
        }
        if !(1..=50).contains(&self.max_positions) {
            return Err(RiskError::InvalidSettings(format!(
                "max_positions {} out of range 1-50",
                self.max_positions
            )));
        }
        Ok(())
    }

    /// Requested leverage capped at the user limit; never raised.
    pub fn clamp_leverage(&self, requested: u32) -> u32 {
        requested.min(self.max_leverage).max(1)
    }
}

/// Outcome of a risk check. A block is an expected steady-state outcome,
/// not a fault - callers branch, they do not catch.
#[derive(Debug, Clone, PartialEq)]
pub enum RiskVerdict {
    Allowed,
    Blocked { reason: String },
}

impl RiskVerdict {
    pub fn can_trade(&self) -> bool {
        matches!(self, RiskVerdict::Allowed)
    }

    pub fn blocked(reason: impl Into<String>) -> Self {
        RiskVerdict::Blocked { reason: reason.into() }
    }
}

/// Entry permission with the leverage actually allowed.
#[derive(Debug, Clone, PartialEq)]
pub struct EntryPermit {
    pub leverage: u32,
}

pub struct RiskGate {
    store: Arc<dyn StorePort>,
    exchange: Arc<dyn ExchangePort>,
}

impl RiskGate {
    pub fn new(store: Arc<dyn StorePort>, exchange: Arc<dyn ExchangePort>) -> Self {
        Self { store, exchange }
    }

    /// Sum of today's (00:00 UTC) realized PnL vs the daily loss limit.
    /// Exits are never blocked - this gates entries only.
    pub async fn check_daily_loss_limit(
        &self,
        user_id: UserId,
        settings: &RiskSettings,
    ) -> Result<RiskVerdict, RiskError> {
        let midnight = Utc::now()
            .date_naive()
            .and_hms_opt(0, 0, 0)
            .map(|t| t.and_utc())
            .unwrap_or_else(Utc::now);

        let trades = self.store.trades_since(user_id, midnight).await?;
        let daily_pnl: Decimal = trades.iter().filter_map(|t| t.pnl).sum();

        if daily_pnl < Decimal::ZERO && daily_pnl.abs() >= settings.daily_loss_limit {
            tracing::warn!(
                user_id,
                %daily_pnl,
                limit = %settings.daily_loss_limit,
                "daily loss limit reached, blocking new entries"
            );
            return Ok(RiskVerdict::blocked(format!(
                "daily loss {} reached limit {}",
                daily_pnl.abs(),
                settings.daily_loss_limit
            )));
        }

        Ok(RiskVerdict::Allowed)
    }

    /// Count of live exchange positions (size > 0) vs the user limit.
    pub async fn check_max_positions(
        &self,
        settings: &RiskSettings,
    ) -> Result<RiskVerdict, RiskError> {
        let positions = self.exchange.positions(None).await?;
        let open = positions.iter().filter(|p| p.size > Decimal::ZERO).count() as u32;

        if open >= settings.max_positions {
            return Ok(RiskVerdict::blocked(format!(
                "open positions {} at limit {}",
                open, settings.max_positions
            )));
        }

        Ok(RiskVerdict::Allowed)
    }

    /// Run all entry gates. The leverage check never blocks; it only caps.
    pub async fn evaluate_entry(
        &self,
        user_id: UserId,
        settings: &RiskSettings,
        requested_leverage: u32,
    ) -> Result<Result<EntryPermit, RiskVerdict>, RiskError> {
        let daily = self.check_daily_loss_limit(user_id, settings).await?;
        if !daily.can_trade() {
            return Ok(Err(daily));
        }

        let positions = self.check_max_positions(settings).await?;
        if !positions.can_trade() {
            return Ok(Err(positions));
        }

        Ok(Ok(EntryPermit {
            leverage: settings.clamp_leverage(requested_leverage),
        }))
    }
}
