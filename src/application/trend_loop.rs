//! Trend bot loop
//!
//! Signal-driven control loop for one bot instance: consume ticks, evaluate
//! exit conditions while a position is open, ask the strategy for a signal,
//! then gate entries through the risk gate, the isolation registry and the
//! allocation ledger before anything reaches the exchange.
//!
//! Errors are caught at the tick boundary and classified; the loop only
//! exits as a deliberate user stop, a classified fatal stop, or a backoff
//! request the orchestrator turns into a scheduled restart.

use std::time::Duration;

use chrono::{DateTime, Utc};
use rust_decimal::prelude::*;
use rust_decimal::Decimal;
use thiserror::Error;
use tokio::sync::watch;

use crate::application::market_data::TickStream;
use crate::application::Services;
use crate::domain::allocation::{AllocationError, ReserveDecision};
use crate::domain::bot::{BotInstance, BotType};
use crate::domain::isolation::IsolationError;
use crate::domain::position::Side;
use crate::domain::recovery::RecoveryDirective;
use crate::domain::risk::RiskError;
use crate::domain::trade::{ExitReason, Trade, TradeExit};
use crate::ports::exchange::{ExchangeError, OrderSide};
use crate::ports::store::StoreError;
use crate::strategy::{
    CandleBuffer, CandleBuilder, PositionView, Signal, SignalAction, StrategyError, TrendStrategy,
};

/// Knobs for the tick loop; defaults match production cadence.
#[derive(Debug, Clone)]
pub struct TrendLoopConfig {
    /// Bounded wait for the next tick; elapsing just re-polls.
    pub tick_wait: Duration,
    /// Recoverable-error delays at or below this are slept inside the loop;
    /// longer backoffs exit to the recovery scheduler.
    pub max_inline_backoff: Duration,
    pub stop_loss_pct: f64,
    pub take_profit_pct: f64,
    pub candle_period_secs: i64,
    pub candle_capacity: usize,
}

impl Default for TrendLoopConfig {
    fn default() -> Self {
        Self {
            tick_wait: Duration::from_secs(3),
            max_inline_backoff: Duration::from_secs(10),
            stop_loss_pct: 5.0,
            take_profit_pct: 10.0,
            candle_period_secs: 60,
            candle_capacity: 200,
        }
    }
}

#[derive(Debug, Error)]
pub enum TrendLoopError {
    #[error(transparent)]
    Exchange(#[from] ExchangeError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Strategy(#[from] StrategyError),

    #[error(transparent)]
    Isolation(#[from] IsolationError),

    #[error(transparent)]
    Allocation(#[from] AllocationError),

    #[error(transparent)]
    Risk(#[from] RiskError),

    #[error("Bot {0} is not a trend bot or has no strategy")]
    NotATrendBot(i64),

    #[error("Price conversion failed: {0}")]
    PriceConversion(String),
}

/// How a loop run ended; the orchestrator branches on this.
#[derive(Debug)]
pub enum LoopExit {
    /// Graceful user-requested stop; bookkeeping flushed.
    UserStop,
    /// Non-recoverable error or retries exhausted.
    ErrorStop { reason: String },
    /// Recoverable error with a backoff too long to sleep in-loop; the
    /// recovery scheduler owns the restart.
    Backoff { delay: Duration, reason: String },
}

/// Local state of the bot's one in-flight round trip.
#[derive(Debug, Clone)]
pub struct OpenTrade {
    pub trade_id: i64,
    pub position_id: i64,
    pub side: Side,
    pub qty: Decimal,
    pub entry_price: Decimal,
    pub leverage: u32,
    /// Amount reserved in the allocation ledger for this trade.
    pub reserved: Decimal,
    pub opened_at: DateTime<Utc>,
}

impl OpenTrade {
    fn exit_fields(&self, exit_price: Decimal, reason: ExitReason, tag: Option<String>) -> TradeExit {
        let raw = (exit_price - self.entry_price) * self.qty * Decimal::from(self.leverage);
        let pnl = match self.side {
            Side::Long => raw,
            Side::Short => -raw,
        };
        let notional = self.entry_price * self.qty;
        let pnl_percent = if notional.is_zero() {
            Decimal::ZERO
        } else {
            pnl / notional * Decimal::ONE_HUNDRED
        };
        TradeExit {
            exit_price,
            pnl,
            pnl_percent,
            exit_reason: reason,
            exit_tag: tag,
            closed_at: Utc::now(),
        }
    }

    /// Leveraged PnL percent at the current price, sign-adjusted.
    fn pnl_pct(&self, price: Decimal) -> f64 {
        if self.entry_price.is_zero() {
            return 0.0;
        }
        let raw = (price - self.entry_price) / self.entry_price * Decimal::from(self.leverage);
        let signed = match self.side {
            Side::Long => raw,
            Side::Short => -raw,
        };
        signed.to_f64().unwrap_or(0.0) * 100.0
    }
}

pub struct TrendBotLoop {
    bot: BotInstance,
    services: Services,
    config: TrendLoopConfig,
    strategy: Box<dyn TrendStrategy>,
    candles: CandleBuffer,
    builder: CandleBuilder,
    ticks: TickStream,
    shutdown: watch::Receiver<bool>,
    open: Option<OpenTrade>,
}

impl TrendBotLoop {
    pub fn new(
        bot: BotInstance,
        services: Services,
        config: TrendLoopConfig,
        shutdown: watch::Receiver<bool>,
    ) -> Result<Self, TrendLoopError> {
        if bot.bot_type != BotType::Trend {
            return Err(TrendLoopError::NotATrendBot(bot.id));
        }
        let spec = bot
            .strategy
            .as_ref()
            .ok_or(TrendLoopError::NotATrendBot(bot.id))?;
        let strategy = spec.build()?;
        let ticks = services.feed.subscribe();
        let candles = CandleBuffer::new(config.candle_capacity);
        let builder = CandleBuilder::new(config.candle_period_secs);

        Ok(Self {
            bot,
            services,
            config,
            strategy,
            candles,
            builder,
            ticks,
            shutdown,
            open: None,
        })
    }

    /// Adopt a round trip recovered from the store (restart with an open
    /// position).
    pub fn resume_open_trade(&mut self, open: OpenTrade) {
        tracing::info!(
            bot_id = self.bot.id,
            trade_id = open.trade_id,
            entry = %open.entry_price,
            "resuming with open position"
        );
        self.open = Some(open);
    }

    pub fn open_trade(&self) -> Option<&OpenTrade> {
        self.open.as_ref()
    }

    pub fn bot(&self) -> &BotInstance {
        &self.bot
    }

    /// Run until stopped. Never panics out; every tick error is classified.
    pub async fn run(mut self) -> LoopExit {
        let symbol = self.bot.symbol.clone();
        let mut shutdown = self.shutdown.clone();

        tracing::info!(bot_id = self.bot.id, symbol, strategy = self.strategy.name(), "trend loop running");

        loop {
            if *shutdown.borrow() {
                return self.graceful_stop().await;
            }

            let maybe_tick = tokio::select! {
                changed = shutdown.changed() => {
                    // A dropped sender counts as a stop signal.
                    if changed.is_err() {
                        return self.graceful_stop().await;
                    }
                    continue;
                }
                t = self.ticks.next_for(&symbol, self.config.tick_wait) => t,
            };

            // Wait elapsed: re-poll. This is the stall-detection point, not
            // a cancellation path.
            let Some(tick) = maybe_tick else { continue };

            match self.on_tick(tick.price, tick.ts).await {
                Ok(()) => {
                    self.services.recovery.record_success(self.bot.id).await;
                }
                Err(e) => {
                    let message = e.to_string();
                    match self.services.recovery.on_error(self.bot.id, &message).await {
                        RecoveryDirective::Stop { reason, .. } => {
                            return LoopExit::ErrorStop { reason };
                        }
                        RecoveryDirective::Retry { delay, .. }
                            if delay <= self.config.max_inline_backoff =>
                        {
                            tokio::time::sleep(delay).await;
                        }
                        RecoveryDirective::Retry { delay, .. } => {
                            return LoopExit::Backoff { delay, reason: message };
                        }
                    }
                }
            }
        }
    }

    /// One tick of the state machine. Public so scenario tests can drive the
    /// pipeline without the async loop.
    pub async fn on_tick(
        &mut self,
        price: Decimal,
        ts: DateTime<Utc>,
    ) -> Result<(), TrendLoopError> {
        let price_f = price
            .to_f64()
            .filter(|p| p.is_finite() && *p > 0.0)
            .ok_or_else(|| TrendLoopError::PriceConversion(price.to_string()))?;

        if let Some(candle) = self.builder.update(price_f, ts) {
            self.candles.push(candle);
        }

        // Exit conditions are evaluated continuously while a position is
        // open, regardless of signal cadence.
        if let Some(open) = self.open.clone() {
            let pnl_pct = open.pnl_pct(price);
            if pnl_pct <= -self.config.stop_loss_pct {
                tracing::warn!(bot_id = self.bot.id, pnl_pct, "stop loss hit");
                self.execute_exit(price, ExitReason::StopLoss, Some("stop_loss".into()))
                    .await?;
                return Ok(());
            }
            if pnl_pct >= self.config.take_profit_pct {
                tracing::info!(bot_id = self.bot.id, pnl_pct, "take profit hit");
                self.execute_exit(price, ExitReason::TakeProfit, Some("take_profit".into()))
                    .await?;
                return Ok(());
            }
        }

        let view = self.open.as_ref().map(|o| PositionView {
            side: o.side,
            entry_price: o.entry_price.to_f64().unwrap_or(0.0),
            age_secs: (Utc::now() - o.opened_at).num_seconds(),
        });

        let signal = self
            .strategy
            .evaluate(price_f, &self.candles, view.as_ref())?;

        self.handle_signal(price, signal).await
    }

    /// Route a strategy signal through the gates and the exchange.
    pub async fn handle_signal(
        &mut self,
        price: Decimal,
        signal: Signal,
    ) -> Result<(), TrendLoopError> {
        match signal.action {
            SignalAction::Hold => Ok(()),
            SignalAction::Close => {
                if self.open.is_some() {
                    self.execute_exit(price, ExitReason::SignalReverse, signal.tag)
                        .await?;
                }
                Ok(())
            }
            SignalAction::Buy | SignalAction::Sell => {
                if self.open.is_some() {
                    // One in-flight round trip per bot.
                    return Ok(());
                }
                let side = if signal.action == SignalAction::Buy {
                    Side::Long
                } else {
                    Side::Short
                };
                self.try_enter(side, price, &signal).await
            }
        }
    }

    /// Risk gate → isolation → allocation → exchange. Blocks are expected
    /// outcomes and skip the entry without raising.
    async fn try_enter(
        &mut self,
        side: Side,
        price: Decimal,
        signal: &Signal,
    ) -> Result<(), TrendLoopError> {
        let bot_id = self.bot.id;
        let user_id = self.bot.user_id;
        let symbol = self.bot.symbol.clone();

        let settings = self.services.store.risk_settings(user_id).await?;
        let requested = signal.leverage.unwrap_or(1).min(self.bot.max_leverage);

        let permit = match self
            .services
            .risk
            .evaluate_entry(user_id, &settings, requested)
            .await?
        {
            Ok(permit) => permit,
            Err(verdict) => {
                tracing::debug!(bot_id, reason = ?verdict, "entry blocked by risk gate");
                return Ok(());
            }
        };

        let decision = self
            .services
            .isolation
            .can_open_position(user_id, bot_id, &symbol, side)
            .await?;
        if let Some(reason) = decision.reason() {
            tracing::debug!(bot_id, reason, "entry blocked by isolation");
            return Ok(());
        }

        // Margin to commit: the strategy's hint, else everything this bot
        // has left.
        let available = self.services.ledger.available_balance(user_id, bot_id).await?;
        let amount = signal.size.unwrap_or(available).min(available);

        let reserved = match self
            .services
            .ledger
            .request_order_amount(user_id, bot_id, amount)
            .await?
        {
            ReserveDecision::Approved { .. } => amount,
            ReserveDecision::Rejected { reason } => {
                tracing::debug!(bot_id, reason, "entry blocked by allocation");
                return Ok(());
            }
        };

        // From here on a failure must hand the reservation back.
        let result = self
            .submit_entry(side, price, reserved, permit.leverage, signal)
            .await;
        if result.is_err() {
            self.services.ledger.release_order_amount(bot_id, reserved).await;
        }
        result
    }

    async fn submit_entry(
        &mut self,
        side: Side,
        price: Decimal,
        reserved: Decimal,
        leverage: u32,
        signal: &Signal,
    ) -> Result<(), TrendLoopError> {
        let bot_id = self.bot.id;
        let user_id = self.bot.user_id;
        let symbol = self.bot.symbol.clone();

        let mut qty = (reserved * Decimal::from(leverage) / price).round_dp(6);
        let min_lot = self.services.exchange.min_order_size(&symbol);
        if qty < min_lot {
            qty = min_lot;
        }

        self.services.exchange.set_leverage(&symbol, leverage).await?;

        let order = self
            .services
            .exchange
            .place_market_order(&symbol, OrderSide::entry_for(side), qty, false)
            .await?;
        let entry_price = order.fill_price().unwrap_or(price);

        let position_id = self
            .services
            .isolation
            .register_position(user_id, bot_id, &symbol, side, qty, entry_price, leverage)
            .await?;

        let trade = Trade::open(
            user_id,
            Some(bot_id),
            &symbol,
            side,
            qty,
            entry_price,
            leverage,
            signal.tag.clone(),
        );
        let trade_id = self.services.store.insert_trade(&trade).await?;

        self.open = Some(OpenTrade {
            trade_id,
            position_id,
            side,
            qty,
            entry_price,
            leverage,
            reserved,
            opened_at: Utc::now(),
        });

        tracing::info!(
            bot_id,
            symbol,
            %side,
            %qty,
            %entry_price,
            leverage,
            confidence = signal.confidence,
            "entered position"
        );
        self.services
            .notifier
            .notify_trade_opened(user_id, bot_id, &symbol, side, qty, entry_price)
            .await;

        Ok(())
    }

    /// Reduce-only exit: complete the trade row exactly once, hand back the
    /// reservation, clear the isolation entry, notify best-effort.
    pub async fn execute_exit(
        &mut self,
        price: Decimal,
        reason: ExitReason,
        tag: Option<String>,
    ) -> Result<(), TrendLoopError> {
        let Some(open) = self.open.clone() else {
            return Ok(());
        };
        let bot_id = self.bot.id;
        let user_id = self.bot.user_id;
        let symbol = self.bot.symbol.clone();

        let order = self
            .services
            .exchange
            .place_market_order(&symbol, OrderSide::exit_for(open.side), open.qty, true)
            .await?;
        let exit_price = order.fill_price().unwrap_or(price);

        let exit = open.exit_fields(exit_price, reason, tag);
        self.services
            .store
            .complete_trade(open.trade_id, &exit)
            .await?;

        self.bot.record_trade_result(exit.pnl);
        self.services.store.save_bot(&self.bot).await?;

        self.services
            .ledger
            .release_order_amount(bot_id, open.reserved)
            .await;
        self.services
            .isolation
            .close_position(user_id, bot_id, &symbol)
            .await?;

        tracing::info!(bot_id, symbol, pnl = %exit.pnl, %reason, "closed position");
        self.services
            .notifier
            .notify_trade_closed(user_id, bot_id, &symbol, exit.pnl, reason)
            .await;

        self.open = None;
        Ok(())
    }

    /// User-requested stop: close any open position at market, then flush
    /// bookkeeping. A failed close keeps the persisted position and its
    /// isolation entry so nothing else trades the symbol.
    async fn graceful_stop(&mut self) -> LoopExit {
        if self.open.is_some() {
            let symbol = self.bot.symbol.clone();
            let price = match self.services.exchange.last_price(&symbol).await {
                Ok(p) => p,
                Err(_) => self.open.as_ref().map(|o| o.entry_price).unwrap_or(Decimal::ONE),
            };
            if let Err(e) = self
                .execute_exit(price, ExitReason::Manual, Some("user_stop".into()))
                .await
            {
                tracing::error!(bot_id = self.bot.id, error = %e, "failed to close position on stop");
                if let Some(open) = &self.open {
                    self.services
                        .ledger
                        .release_order_amount(self.bot.id, open.reserved)
                        .await;
                }
            }
        }
        tracing::info!(bot_id = self.bot.id, "trend loop stopped by user");
        LoopExit::UserStop
    }
}
