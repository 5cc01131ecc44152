//! Wire types for the Bitget-compatible mix (futures) REST API.
//!
//! Only the fields the core consumes are modeled; everything else in the
//! gateway responses is ignored.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::domain::position::Side;
use crate::ports::exchange::{ExchangeOrder, ExchangePosition, OrderSide, OrderStatus};

/// Standard response envelope: `code` is "00000" on success.
#[derive(Debug, Deserialize)]
pub struct Envelope<T> {
    pub code: String,
    #[serde(default)]
    pub msg: String,
    pub data: Option<T>,
}

impl<T> Envelope<T> {
    pub fn is_ok(&self) -> bool {
        self.code == "00000"
    }
}

#[derive(Debug, Deserialize)]
pub struct AccountData {
    #[serde(rename = "available")]
    pub available: Decimal,
}

#[derive(Debug, Deserialize)]
pub struct TickerData {
    #[serde(rename = "lastPr")]
    pub last_price: Decimal,
}

#[derive(Debug, Deserialize)]
pub struct PositionData {
    pub symbol: String,
    #[serde(rename = "holdSide")]
    pub hold_side: String,
    #[serde(rename = "total")]
    pub total: Decimal,
    #[serde(rename = "openPriceAvg")]
    pub open_price_avg: Decimal,
    #[serde(rename = "leverage")]
    pub leverage: u32,
    #[serde(rename = "unrealizedPL", default)]
    pub unrealized_pl: Decimal,
}

impl PositionData {
    pub fn into_position(self) -> ExchangePosition {
        let side = if self.hold_side.eq_ignore_ascii_case("short") {
            Side::Short
        } else {
            Side::Long
        };
        ExchangePosition {
            symbol: self.symbol,
            side,
            size: self.total,
            entry_price: self.open_price_avg,
            leverage: self.leverage,
            unrealized_pnl: self.unrealized_pl,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct PlaceOrderRequest {
    pub symbol: String,
    #[serde(rename = "marginCoin")]
    pub margin_coin: String,
    pub side: String,
    #[serde(rename = "orderType")]
    pub order_type: String,
    pub size: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub price: Option<String>,
    #[serde(rename = "reduceOnly")]
    pub reduce_only: String,
}

#[derive(Debug, Deserialize)]
pub struct PlaceOrderData {
    #[serde(rename = "orderId")]
    pub order_id: String,
}

#[derive(Debug, Deserialize)]
pub struct OrderDetailData {
    #[serde(rename = "orderId")]
    pub order_id: String,
    pub symbol: String,
    pub side: String,
    #[serde(rename = "price", default)]
    pub price: Option<Decimal>,
    pub size: Decimal,
    #[serde(rename = "baseVolume", default)]
    pub filled_size: Decimal,
    #[serde(rename = "priceAvg", default)]
    pub price_avg: Option<Decimal>,
    #[serde(rename = "state")]
    pub state: String,
    #[serde(rename = "reduceOnly", default)]
    pub reduce_only: String,
}

impl OrderDetailData {
    pub fn into_order(self) -> ExchangeOrder {
        let side = if self.side.eq_ignore_ascii_case("sell") {
            OrderSide::Sell
        } else {
            OrderSide::Buy
        };
        let status = match self.state.as_str() {
            "live" | "new" => OrderStatus::New,
            "partially_filled" => OrderStatus::PartiallyFilled,
            "filled" => OrderStatus::Filled,
            "canceled" | "cancelled" => OrderStatus::Canceled,
            _ => OrderStatus::Rejected,
        };
        ExchangeOrder {
            order_id: self.order_id,
            symbol: self.symbol,
            side,
            price: self.price,
            size: self.size,
            filled_size: self.filled_size,
            avg_fill_price: self.price_avg,
            status,
            reduce_only: self.reduce_only.eq_ignore_ascii_case("yes"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_envelope_parsing() {
        let json = r#"{"code":"00000","msg":"success","data":{"available":"1234.56"}}"#;
        let env: Envelope<AccountData> = serde_json::from_str(json).unwrap();
        assert!(env.is_ok());
        assert_eq!(env.data.unwrap().available, dec!(1234.56));
    }

    #[test]
    fn test_error_envelope() {
        let json = r#"{"code":"40037","msg":"Apikey does not exist","data":null}"#;
        let env: Envelope<AccountData> = serde_json::from_str(json).unwrap();
        assert!(!env.is_ok());
        assert_eq!(env.msg, "Apikey does not exist");
    }

    #[test]
    fn test_order_state_mapping() {
        let data = OrderDetailData {
            order_id: "1".into(),
            symbol: "BTCUSDT".into(),
            side: "buy".into(),
            price: Some(dec!(100)),
            size: dec!(1),
            filled_size: dec!(1),
            price_avg: Some(dec!(100)),
            state: "filled".into(),
            reduce_only: "no".into(),
        };
        let order = data.into_order();
        assert_eq!(order.status, OrderStatus::Filled);
        assert_eq!(order.side, OrderSide::Buy);
        assert!(!order.reduce_only);
    }

    #[test]
    fn test_position_side_mapping() {
        let data = PositionData {
            symbol: "BTCUSDT".into(),
            hold_side: "short".into(),
            total: dec!(2),
            open_price_avg: dec!(100),
            leverage: 5,
            unrealized_pl: dec!(-3),
        };
        let position = data.into_position();
        assert_eq!(position.side, Side::Short);
        assert_eq!(position.size, dec!(2));
    }
}
