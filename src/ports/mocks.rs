//! Hand-rolled recording fakes for the ports layer.
//!
//! Each mock records the calls it receives and serves controlled responses,
//! so unit and integration tests run deterministically with no network.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use tokio::sync::Mutex;

use crate::domain::bot::{BotId, BotInstance, UserId};
use crate::domain::grid::GridRung;
use crate::domain::position::{PositionRecord, Side};
use crate::domain::risk::RiskSettings;
use crate::domain::trade::{ExitReason, Trade, TradeExit};
use crate::ports::exchange::{
    ExchangeError, ExchangeOrder, ExchangePort, ExchangePosition, OrderSide, OrderStatus,
};
use crate::ports::notify::NotifierPort;
use crate::ports::store::{StoreError, StorePort};

// ---------------------------------------------------------------------------
// MockExchange
// ---------------------------------------------------------------------------

#[derive(Default)]
struct ExchangeState {
    balance: Decimal,
    positions: HashMap<String, ExchangePosition>,
    orders: HashMap<String, ExchangeOrder>,
    mark_prices: HashMap<String, Decimal>,
    fail_next: Option<String>,
    leverage_set: Vec<(String, u32)>,
    calls: Vec<String>,
}

/// Scripted exchange: market orders fill immediately at the mark price,
/// limit orders rest until `fill_order` is called.
pub struct MockExchange {
    state: Mutex<ExchangeState>,
    next_order_id: AtomicUsize,
    balance_calls: AtomicUsize,
}

impl MockExchange {
    pub fn new(balance: Decimal) -> Self {
        Self {
            state: Mutex::new(ExchangeState { balance, ..Default::default() }),
            next_order_id: AtomicUsize::new(1),
            balance_calls: AtomicUsize::new(0),
        }
    }

    pub async fn set_balance(&self, balance: Decimal) {
        self.state.lock().await.balance = balance;
    }

    pub async fn set_mark_price(&self, symbol: &str, price: Decimal) {
        self.state.lock().await.mark_prices.insert(symbol.to_string(), price);
    }

    /// Make the next exchange call fail with this message.
    pub async fn fail_next_with(&self, message: &str) {
        self.state.lock().await.fail_next = Some(message.to_string());
    }

    pub async fn seed_position(&self, symbol: &str, size: Decimal, entry_price: Decimal) {
        let mut state = self.state.lock().await;
        state.positions.insert(
            symbol.to_string(),
            ExchangePosition {
                symbol: symbol.to_string(),
                side: Side::Long,
                size,
                entry_price,
                leverage: 1,
                unrealized_pnl: Decimal::ZERO,
            },
        );
    }

    /// Mark a resting order filled at `price`.
    pub async fn fill_order(&self, order_id: &str, price: Decimal) {
        let mut state = self.state.lock().await;
        if let Some(order) = state.orders.get_mut(order_id) {
            order.status = OrderStatus::Filled;
            order.filled_size = order.size;
            order.avg_fill_price = Some(price);
        }
    }

    pub fn balance_calls(&self) -> usize {
        self.balance_calls.load(Ordering::SeqCst)
    }

    pub async fn calls(&self) -> Vec<String> {
        self.state.lock().await.calls.clone()
    }

    pub async fn leverage_calls(&self) -> Vec<(String, u32)> {
        self.state.lock().await.leverage_set.clone()
    }

    pub async fn open_order_count(&self) -> usize {
        self.state
            .lock()
            .await
            .orders
            .values()
            .filter(|o| o.status.is_open())
            .count()
    }

    fn take_failure(state: &mut ExchangeState) -> Result<(), ExchangeError> {
        if let Some(message) = state.fail_next.take() {
            return Err(ExchangeError::Api(message));
        }
        Ok(())
    }

    fn next_id(&self) -> String {
        format!("ord-{}", self.next_order_id.fetch_add(1, Ordering::SeqCst))
    }
}

#[async_trait]
impl ExchangePort for MockExchange {
    async fn futures_balance(&self) -> Result<Decimal, ExchangeError> {
        self.balance_calls.fetch_add(1, Ordering::SeqCst);
        let mut state = self.state.lock().await;
        state.calls.push("futures_balance".into());
        Self::take_failure(&mut state)?;
        Ok(state.balance)
    }

    async fn positions(&self, symbol: Option<&str>) -> Result<Vec<ExchangePosition>, ExchangeError> {
        let mut state = self.state.lock().await;
        state.calls.push(format!("positions({symbol:?})"));
        Self::take_failure(&mut state)?;
        Ok(state
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
        state
            .calls
            .push(format!("market({symbol},{side:?},{size},reduce={reduce_only})"));
        Self::take_failure(&mut state)?;

        let price = state
            .mark_prices
            .get(symbol)
            .copied()
            .ok_or_else(|| ExchangeError::Api(format!("no mark price for {symbol}")))?;

        // Track the position set the way the exchange would.
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
            state
                .positions
                .entry(symbol.to_string())
                .and_modify(|p| p.size += size)
                .or_insert(ExchangePosition {
                    symbol: symbol.to_string(),
                    side: pos_side,
                    size,
                    entry_price: price,
                    leverage: 1,
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
        Ok(order)
    }

    async fn place_limit_order(
        &self,
        symbol: &str,
        side: OrderSide,
        price: Decimal,
        size: Decimal,
    ) -> Result<ExchangeOrder, ExchangeError> {
        let mut state = self.state.lock().await;
        state.calls.push(format!("limit({symbol},{side:?},{price},{size})"));
        Self::take_failure(&mut state)?;

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
        state.orders.insert(order.order_id.clone(), order.clone());
        Ok(order)
    }

    async fn cancel_order(&self, symbol: &str, order_id: &str) -> Result<(), ExchangeError> {
        let mut state = self.state.lock().await;
        state.calls.push(format!("cancel({symbol},{order_id})"));
        Self::take_failure(&mut state)?;
        match state.orders.get_mut(order_id) {
            Some(order) if order.status.is_open() => {
                order.status = OrderStatus::Canceled;
                Ok(())
            }
            Some(_) => Ok(()),
            None => Err(ExchangeError::OrderNotFound(order_id.to_string())),
        }
    }

    async fn get_order(&self, symbol: &str, order_id: &str) -> Result<ExchangeOrder, ExchangeError> {
        let mut state = self.state.lock().await;
        state.calls.push(format!("get_order({symbol},{order_id})"));
        Self::take_failure(&mut state)?;
        state
            .orders
            .get(order_id)
            .cloned()
            .ok_or_else(|| ExchangeError::OrderNotFound(order_id.to_string()))
    }

    async fn set_leverage(&self, symbol: &str, leverage: u32) -> Result<(), ExchangeError> {
        let mut state = self.state.lock().await;
        state.calls.push(format!("set_leverage({symbol},{leverage})"));
        Self::take_failure(&mut state)?;
        state.leverage_set.push((symbol.to_string(), leverage));
        Ok(())
    }

    async fn last_price(&self, symbol: &str) -> Result<Decimal, ExchangeError> {
        let mut state = self.state.lock().await;
        state.calls.push(format!("last_price({symbol})"));
        Self::take_failure(&mut state)?;
        state
            .mark_prices
            .get(symbol)
            .copied()
            .ok_or_else(|| ExchangeError::Api(format!("no mark price for {symbol}")))
    }
}

// ---------------------------------------------------------------------------
// MockStore
// ---------------------------------------------------------------------------

#[derive(Default)]
struct StoreState {
    bots: HashMap<BotId, BotInstance>,
    trades: HashMap<i64, Trade>,
    positions: HashMap<i64, PositionRecord>,
    rungs: HashMap<BotId, Vec<GridRung>>,
    risk: HashMap<UserId, RiskSettings>,
}

/// In-memory store with seed helpers for tests.
#[derive(Default)]
pub struct MockStore {
    state: Mutex<StoreState>,
    next_id: AtomicI64,
}

impl MockStore {
    pub fn new() -> Self {
        Self { state: Mutex::new(StoreState::default()), next_id: AtomicI64::new(1) }
    }

    /// Seed one closed trade carrying today's PnL for daily-loss tests.
    pub async fn seed_daily_pnl(&self, user_id: UserId, pnl: Decimal) {
        let mut trade = Trade::open(
            user_id,
            None,
            "BTCUSDT",
            Side::Long,
            Decimal::ONE,
            Decimal::ONE_HUNDRED,
            1,
            None,
        );
        trade.apply_exit(TradeExit {
            exit_price: Decimal::ONE_HUNDRED,
            pnl,
            pnl_percent: Decimal::ZERO,
            exit_reason: ExitReason::Manual,
            exit_tag: None,
            closed_at: Utc::now(),
        });
        self.insert_trade(&trade).await.expect("seed trade");
    }

    pub async fn seed_risk_settings(&self, user_id: UserId, settings: RiskSettings) {
        self.state.lock().await.risk.insert(user_id, settings);
    }

    pub async fn trade(&self, trade_id: i64) -> Option<Trade> {
        self.state.lock().await.trades.get(&trade_id).cloned()
    }

    pub async fn all_trades(&self) -> Vec<Trade> {
        self.state.lock().await.trades.values().cloned().collect()
    }

    fn assign_id(&self) -> i64 {
        self.next_id.fetch_add(1, Ordering::SeqCst)
    }
}

#[async_trait]
impl StorePort for MockStore {
    async fn bot(&self, bot_id: BotId) -> Result<Option<BotInstance>, StoreError> {
        Ok(self.state.lock().await.bots.get(&bot_id).cloned())
    }

    async fn save_bot(&self, bot: &BotInstance) -> Result<(), StoreError> {
        self.state.lock().await.bots.insert(bot.id, bot.clone());
        Ok(())
    }

    async fn bots_for_user(&self, user_id: UserId) -> Result<Vec<BotInstance>, StoreError> {
        Ok(self
            .state
            .lock()
            .await
            .bots
            .values()
            .filter(|b| b.user_id == user_id)
            .cloned()
            .collect())
    }

    async fn all_bots(&self) -> Result<Vec<BotInstance>, StoreError> {
        Ok(self.state.lock().await.bots.values().cloned().collect())
    }

    async fn insert_trade(&self, trade: &Trade) -> Result<i64, StoreError> {
        let id = self.assign_id();
        let mut stored = trade.clone();
        stored.id = id;
        self.state.lock().await.trades.insert(id, stored);
        Ok(id)
    }

    async fn complete_trade(&self, trade_id: i64, exit: &TradeExit) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        let trade = state
            .trades
            .get_mut(&trade_id)
            .ok_or_else(|| StoreError::NotFound(format!("trade {trade_id}")))?;
        trade.apply_exit(exit.clone());
        Ok(())
    }

    async fn trades_since(
        &self,
        user_id: UserId,
        since: DateTime<Utc>,
    ) -> Result<Vec<Trade>, StoreError> {
        Ok(self
            .state
            .lock()
            .await
            .trades
            .values()
            .filter(|t| t.user_id == user_id && t.opened_at >= since)
            .cloned()
            .collect())
    }

    async fn insert_position(&self, position: &PositionRecord) -> Result<i64, StoreError> {
        let id = self.assign_id();
        let mut stored = position.clone();
        stored.id = id;
        self.state.lock().await.positions.insert(id, stored);
        Ok(id)
    }

    async fn update_position(&self, position: &PositionRecord) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        if !state.positions.contains_key(&position.id) {
            return Err(StoreError::NotFound(format!("position {}", position.id)));
        }
        state.positions.insert(position.id, position.clone());
        Ok(())
    }

    async fn delete_position(&self, position_id: i64) -> Result<(), StoreError> {
        self.state.lock().await.positions.remove(&position_id);
        Ok(())
    }

    async fn open_positions(
        &self,
        user_id: Option<UserId>,
    ) -> Result<Vec<PositionRecord>, StoreError> {
        Ok(self
            .state
            .lock()
            .await
            .positions
            .values()
            .filter(|p| user_id.map_or(true, |u| p.user_id == u))
            .cloned()
            .collect())
    }

    async fn grid_rungs(&self, bot_id: BotId) -> Result<Vec<GridRung>, StoreError> {
        Ok(self.state.lock().await.rungs.get(&bot_id).cloned().unwrap_or_default())
    }

    async fn save_grid_rungs(&self, bot_id: BotId, rungs: &[GridRung]) -> Result<(), StoreError> {
        self.state.lock().await.rungs.insert(bot_id, rungs.to_vec());
        Ok(())
    }

    async fn risk_settings(&self, user_id: UserId) -> Result<RiskSettings, StoreError> {
        Ok(self
            .state
            .lock()
            .await
            .risk
            .get(&user_id)
            .cloned()
            .unwrap_or_default())
    }
}

// ---------------------------------------------------------------------------
// MockNotifier
// ---------------------------------------------------------------------------

/// Records notification events as plain strings.
#[derive(Default)]
pub struct MockNotifier {
    events: Arc<Mutex<Vec<String>>>,
}

impl MockNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn events(&self) -> Vec<String> {
        self.events.lock().await.clone()
    }
}

#[async_trait]
impl NotifierPort for MockNotifier {
    async fn notify_bot_started(&self, user_id: UserId, bot_id: BotId, name: &str) {
        self.events
            .lock()
            .await
            .push(format!("bot_started:{user_id}:{bot_id}:{name}"));
    }

    async fn notify_bot_stopped(&self, user_id: UserId, bot_id: BotId, name: &str, reason: &str) {
        self.events
            .lock()
            .await
            .push(format!("bot_stopped:{user_id}:{bot_id}:{name}:{reason}"));
    }

    async fn notify_trade_opened(
        &self,
        user_id: UserId,
        bot_id: BotId,
        symbol: &str,
        side: Side,
        qty: Decimal,
        entry_price: Decimal,
    ) {
        self.events.lock().await.push(format!(
            "trade_opened:{user_id}:{bot_id}:{symbol}:{side}:{qty}@{entry_price}"
        ));
    }

    async fn notify_trade_closed(
        &self,
        user_id: UserId,
        bot_id: BotId,
        symbol: &str,
        pnl: Decimal,
        reason: ExitReason,
    ) {
        self.events
            .lock()
            .await
            .push(format!("trade_closed:{user_id}:{bot_id}:{symbol}:{pnl}:{reason}"));
    }

    async fn notify_risk_alert(&self, user_id: UserId, message: &str) {
        self.events
            .lock()
            .await
            .push(format!("risk_alert:{user_id}:{message}"));
    }
}
