//! Paper exchange
//!
//! Deterministic in-process exchange for paper trading: market orders fill
//! at the current mark price, resting limit orders fill when a fed price
//! crosses them. No real transactions ever leave the process.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use tokio::sync::Mutex;

use crate::application::market_data::{MarketFeed, Tick};
use crate::domain::position::Side;
use crate::ports::exchange::{
    ExchangeError, ExchangeOrder, ExchangePort, ExchangePosition, OrderSide, OrderStatus,
};

#[derive(Default)]
struct PaperState {
    balance: Decimal,
    marks: HashMap<String, Decimal>,
    orders: HashMap<String, ExchangeOrder>,
    positions: HashMap<String, ExchangePosition>,
    leverage: HashMap<String, u32>,
}

pub struct PaperExchange {
    state: Mutex<PaperState>,
    next_order_id: AtomicUsize,
}

impl PaperExchange {
    pub fn new(balance: Decimal) -> Self {
        Self {
            state: Mutex::new(PaperState { balance, ..Default::default() }),
            next_order_id: AtomicUsize::new(1),
        }
    }

    /// Feed a price: updates the mark and fills any resting limit order the
    /// price crossed (buys at or below, sells at or above).
    pub async fn on_tick(&self, symbol: &str, price: Decimal) {
        let mut state = self.state.lock().await;
        state.marks.insert(symbol.to_string(), price);

        let crossed: Vec<String> = state
            .orders
            .values()
            .filter(|o| o.symbol == symbol && o.status.is_open())
            .filter(|o| match (o.side, o.price) {
                (OrderSide::Buy, Some(limit)) => price <= limit,
                (OrderSide::Sell, Some(limit)) => price >= limit,
                _ => false,
            })
            .map(|o| o.order_id.clone())
            .collect();

        for order_id in crossed {
            if let Some(order) = state.orders.get_mut(&order_id) {
                order.status = OrderStatus::Filled;
                order.filled_size = order.size;
                order.avg_fill_price = order.price;
                tracing::debug!(order_id, symbol, %price, "paper limit order filled");
            }
        }
    }

    /// Bridge a market feed into this exchange so limit fills track ticks.
    pub fn attach_feed(self: &std::sync::Arc<Self>, feed: &MarketFeed) -> tokio::task::JoinHandle<()> {
        let mut stream = feed.subscribe_raw();
        let exchange = std::sync::Arc::clone(self);
        tokio::spawn(async move {
            loop {
                match stream.recv().await {
                    Ok(Tick { symbol, price, .. }) => exchange.on_tick(&symbol, price).await,
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    }

    fn next_id(&self) -> String {
        format!("paper-{}", self.next_order_id.fetch_add(1, Ordering::SeqCst))
    }
}

#[async_trait]
impl ExchangePort for PaperExchange {
    async fn futures_balance(&self) -> Result<Decimal, ExchangeError> {
        Ok(self.state.lock().await.balance)
    }

    async fn positions(&self, symbol: Option<&str>) -> Result<Vec<ExchangePosition>, ExchangeError> {
        Ok(self
            .state
            .lock()
            .await
            .positions
            .values()
            .filter(|p| symbol.map_or(true, |s| p.symbol == s))
            .cloned()
            .collect())
    }

    async fn place_market_order(
        &self,
        symbol: &str,
        side: OrderSide,
        size: Decimal,
        reduce_only: bool,
    ) -> Result<ExchangeOrder, ExchangeError> {
        let mut state = self.state.lock().await;
        let price = state
            .marks
            .get(symbol)
            .copied()
            .ok_or_else(|| ExchangeError::Api(format!("no mark price for {symbol}")))?;

        if reduce_only {
            if let Some(pos) = state.positions.get_mut(symbol) {
                pos.size = (pos.size - size).max(Decimal::ZERO);
                if pos.size.is_zero() {
                    state.positions.remove(symbol);
                }
            }
        } else {
            let pos_side = match side {
                OrderSide::Buy => Side::Long,
                OrderSide::Sell => Side::Short,
            };
            let leverage = state.leverage.get(symbol).copied().unwrap_or(1);
            state
                .positions
                .entry(symbol.to_string())
                .and_modify(|p| p.size += size)
                .or_insert(ExchangePosition {
                    symbol: symbol.to_string(),
                    side: pos_side,
                    size,
                    entry_price: price,
                    leverage,
                    unrealized_pnl: Decimal::ZERO,
                });
        }

        let order = ExchangeOrder {
            order_id: self.next_id(),
            symbol: symbol.to_string(),
            side,
            price: None,
            size,
            filled_size: size,
            avg_fill_price: Some(price),
            status: OrderStatus::Filled,
            reduce_only,
        };
        state.orders.insert(order.order_id.clone(), order.clone());
        tracing::info!(symbol, ?side, %size, %price, reduce_only, "paper market order filled");
        Ok(order)
    }

    async fn place_limit_order(
        &self,
        symbol: &str,
        side: OrderSide,
        price: Decimal,
        size: Decimal,
    ) -> Result<ExchangeOrder, ExchangeError> {
        let order = ExchangeOrder {
            order_id: self.next_id(),
            symbol: symbol.to_string(),
            side,
            price: Some(price),
            size,
            filled_size: Decimal::ZERO,
            avg_fill_price: None,
            status: OrderStatus::New,
            reduce_only: false,
        };
        self.state
            .lock()
            .await
            .orders
            .insert(order.order_id.clone(), order.clone());
        Ok(order)
    }

    async fn cancel_order(&self, _symbol: &str, order_id: &str) -> Result<(), ExchangeError> {
        let mut state = self.state.lock().await;
        match state.orders.get_mut(order_id) {
            Some(order) if order.status.is_open() => {
                order.status = OrderStatus::Canceled;
                Ok(())
            }
            Some(_) => Ok(()),
            None => Err(ExchangeError::OrderNotFound(order_id.to_string())),
        }
    }

    async fn get_order(&self, _symbol: &str, order_id: &str) -> Result<ExchangeOrder, ExchangeError> {
        self.state
            .lock()
            .await
            .orders
            .get(order_id)
            .cloned()
            .ok_or_else(|| ExchangeError::OrderNotFound(order_id.to_string()))
    }

    async fn set_leverage(&self, symbol: &str, leverage: u32) -> Result<(), ExchangeError> {
        self.state
            .lock()
            .await
            .leverage
            .insert(symbol.to_string(), leverage);
        Ok(())
    }

    async fn last_price(&self, symbol: &str) -> Result<Decimal, ExchangeError> {
        self.state
            .lock()
            .await
            .marks
            .get(symbol)
            .copied()
            .ok_or_else(|| ExchangeError::Api(format!("no mark price for {symbol}")))
    }

    fn min_order_size(&self, _symbol: &str) -> Decimal {
        dec!(0.001)
    }
}
