//! Exchange port - the narrow async interface every exchange adapter implements.
//!
//! The core never inspects transport status codes; adapters surface failures
//! as `ExchangeError` whose message text feeds the error classifier.

use async_trait::async_trait;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::domain::position::Side;

#[derive(Debug, Error)]
pub enum ExchangeError {
    #[error("API request failed: {0}")]
    Api(String),
    #[error("Network error: {0}")]
    Network(String),
    #[error("Authentication failed: {0}")]
    Auth(String),
    #[error("Invalid parameters: {0}")]
    InvalidParameters(String),
    #[error("Order not found: {0}")]
    OrderNotFound(String),
}

/// Order direction as the exchange sees it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderSide {
    Buy,
    Sell,
}

impl OrderSide {
    /// The side that opens a position in the given direction.
    pub fn entry_for(side: Side) -> Self {
        match side {
            Side::Long => OrderSide::Buy,
            Side::Short => OrderSide::Sell,
        }
    }

    /// The side that reduces a position in the given direction.
    pub fn exit_for(side: Side) -> Self {
        match side {
            Side::Long => OrderSide::Sell,
            Side::Short => OrderSide::Buy,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderStatus {
    New,
    PartiallyFilled,
    Filled,
    Canceled,
    Rejected,
}

impl OrderStatus {
    pub fn is_open(&self) -> bool {
        matches!(self, OrderStatus::New | OrderStatus::PartiallyFilled)
    }

    pub fn is_filled(&self) -> bool {
        matches!(self, OrderStatus::Filled)
    }
}

/// An order as reported by the exchange.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExchangeOrder {
    pub order_id: String,
    pub symbol: String,
    pub side: OrderSide,
    /// Limit price; `None` for market orders.
    pub price: Option<Decimal>,
    pub size: Decimal,
    pub filled_size: Decimal,
    pub avg_fill_price: Option<Decimal>,
    pub status: OrderStatus,
    pub reduce_only: bool,
}

impl ExchangeOrder {
    /// Best-effort fill price: average fill, else limit price.
    pub fn fill_price(&self) -> Option<Decimal> {
        self.avg_fill_price.or(self.price)
    }
}

/// An open position as reported by the exchange.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExchangePosition {
    pub symbol: String,
    pub side: Side,
    pub size: Decimal,
    pub entry_price: Decimal,
    pub leverage: u32,
    pub unrealized_pnl: Decimal,
}

/// Async interface to one user's futures account.
///
/// All balance/position reads used for gating must come through here fresh
/// (or bounded-TTL cached) - the exchange owns the truth, not this process.
#[async_trait]
pub trait ExchangePort: Send + Sync {
    /// Available USDT futures balance.
    async fn futures_balance(&self) -> Result<Decimal, ExchangeError>;

    /// Open positions, optionally filtered to one symbol.
    async fn positions(&self, symbol: Option<&str>) -> Result<Vec<ExchangePosition>, ExchangeError>;

    async fn place_market_order(
        &self,
        symbol: &str,
        side: OrderSide,
        size: Decimal,
        reduce_only: bool,
    ) -> Result<ExchangeOrder, ExchangeError>;

    async fn place_limit_order(
        &self,
        symbol: &str,
        side: OrderSide,
        price: Decimal,
        size: Decimal,
    ) -> Result<ExchangeOrder, ExchangeError>;

    async fn cancel_order(&self, symbol: &str, order_id: &str) -> Result<(), ExchangeError>;

    async fn get_order(&self, symbol: &str, order_id: &str) -> Result<ExchangeOrder, ExchangeError>;

    async fn set_leverage(&self, symbol: &str, leverage: u32) -> Result<(), ExchangeError>;

    /// Last traded price for a symbol.
    async fn last_price(&self, symbol: &str) -> Result<Decimal, ExchangeError>;

    /// Minimum order size (lot) for a symbol; undersized computed sizes are
    /// bumped up to this.
    fn min_order_size(&self, _symbol: &str) -> Decimal {
        dec!(0.001)
    }
}
