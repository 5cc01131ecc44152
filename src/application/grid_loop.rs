//! Grid bot loop
//!
//! Drives the grid cycle engine against live prices: resting buys below the
//! market, a paired sell one rung above each filled buy, and a fresh buy at
//! the same price once the sell fills. Rungs persist with their exchange
//! order ids, so a restart reconciles against live order status instead of
//! re-placing orders.

use std::time::Duration;

use chrono::Utc;
use rust_decimal::Decimal;
use thiserror::Error;
use tokio::sync::watch;

use crate::application::market_data::TickStream;
use crate::application::trend_loop::LoopExit;
use crate::application::Services;
use crate::domain::allocation::{AllocationError, ReserveDecision};
use crate::domain::bot::{BotInstance, BotType};
use crate::domain::grid::{build_rungs, GridBotConfig, GridError, GridRung, GridRungStatus};
use crate::domain::position::Side;
use crate::domain::recovery::RecoveryDirective;
use crate::domain::trade::{ExitReason, Trade, TradeExit};
use crate::ports::exchange::{ExchangeError, OrderSide, OrderStatus};
use crate::ports::store::StoreError;

/// Loop cadence knobs.
#[derive(Debug, Clone)]
pub struct GridLoopConfig {
    /// Minimum interval between order-status sweeps, bounding API rate.
    pub check_interval: Duration,
    /// Bounded wait on the shared feed before falling back to REST.
    pub tick_wait: Duration,
    pub max_inline_backoff: Duration,
}

impl Default for GridLoopConfig {
    fn default() -> Self {
        Self {
            check_interval: Duration::from_secs(3),
            tick_wait: Duration::from_secs(3),
            max_inline_backoff: Duration::from_secs(10),
        }
    }
}

#[derive(Debug, Error)]
pub enum GridLoopError {
    #[error(transparent)]
    Exchange(#[from] ExchangeError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Grid(#[from] GridError),

    #[error(transparent)]
    Allocation(#[from] AllocationError),

    #[error("Bot {0} is not a grid bot or has no grid config")]
    NotAGridBot(i64),

    #[error("Persisted ladder has {persisted} rungs but config defines {configured}; refusing to resume")]
    LadderMismatch { persisted: usize, configured: usize },
}

pub struct GridBotLoop {
    bot: BotInstance,
    grid: GridBotConfig,
    services: Services,
    config: GridLoopConfig,
    ticks: TickStream,
    shutdown: watch::Receiver<bool>,
    rungs: Vec<GridRung>,
    prices: Vec<Decimal>,
}

impl GridBotLoop {
    pub fn new(
        bot: BotInstance,
        services: Services,
        config: GridLoopConfig,
        shutdown: watch::Receiver<bool>,
    ) -> Result<Self, GridLoopError> {
        if bot.bot_type != BotType::Grid {
            return Err(GridLoopError::NotAGridBot(bot.id));
        }
        let grid = bot.grid.clone().ok_or(GridLoopError::NotAGridBot(bot.id))?;
        grid.validate()?;
        let prices = grid.grid_prices()?;
        let ticks = services.feed.subscribe();

        Ok(Self {
            bot,
            grid,
            services,
            config,
            ticks,
            shutdown,
            rungs: Vec::new(),
            prices,
        })
    }

    pub fn rungs(&self) -> &[GridRung] {
        &self.rungs
    }

    pub fn bot(&self) -> &BotInstance {
        &self.bot
    }

    /// Load persisted rungs (resuming a prior run) or build a fresh ladder,
    /// then reconcile any resting order ids against live exchange status.
    pub async fn prepare(&mut self) -> Result<(), GridLoopError> {
        let persisted = self.services.store.grid_rungs(self.bot.id).await?;

        if persisted.is_empty() {
            self.rungs = build_rungs(&self.grid)?;
            tracing::info!(
                bot_id = self.bot.id,
                rungs = self.rungs.len(),
                lower = %self.grid.lower_price,
                upper = %self.grid.upper_price,
                "grid ladder created"
            );
        } else {
            if persisted.len() != self.prices.len() {
                return Err(GridLoopError::LadderMismatch {
                    persisted: persisted.len(),
                    configured: self.prices.len(),
                });
            }
            self.rungs = persisted;
            tracing::info!(bot_id = self.bot.id, rungs = self.rungs.len(), "grid ladder resumed");
            self.rebuild_reservations().await;
            self.reconcile().await?;
        }

        self.services
            .store
            .save_grid_rungs(self.bot.id, &self.rungs)
            .await?;
        Ok(())
    }

    /// Run until stopped. `prepare` must have been called.
    pub async fn run(mut self) -> LoopExit {
        let symbol = self.bot.symbol.clone();
        let mut shutdown = self.shutdown.clone();

        tracing::info!(bot_id = self.bot.id, symbol, "grid loop running");

        loop {
            if *shutdown.borrow() {
                return self.graceful_stop().await;
            }

            // Prefer the shared feed; fall back to a direct price read when
            // the wait elapses.
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

            let price = match maybe_tick {
                Some(tick) => Ok(tick.price),
                None => self.services.exchange.last_price(&symbol).await,
            };

            let outcome = match price {
                Ok(price) => self.poll_cycle(price).await,
                Err(e) => Err(GridLoopError::Exchange(e)),
            };

            match outcome {
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

            tokio::time::sleep(self.config.check_interval).await;
        }
    }

    /// One sweep of the ladder at the given market price. Public so tests
    /// can drive the engine without the async loop.
    pub async fn poll_cycle(&mut self, price: Decimal) -> Result<(), GridLoopError> {
        for idx in 0..self.rungs.len() {
            if self.rungs[idx].status == GridRungStatus::BuyPlaced {
                self.check_buy_fill(idx).await?;
            }
            if self.rungs[idx].status == GridRungStatus::BuyFilled {
                self.place_sell(idx).await?;
            }
            if self.rungs[idx].status == GridRungStatus::SellPlaced {
                self.check_sell_fill(idx).await?;
            }
            if self.rungs[idx].status == GridRungStatus::Pending
                && self.rungs[idx].grid_price < price
                && idx + 1 < self.rungs.len()
            {
                self.place_buy(idx).await?;
            }
        }

        self.services
            .store
            .save_grid_rungs(self.bot.id, &self.rungs)
            .await?;
        Ok(())
    }

    /// Re-reserve margin for rungs that were mid-cycle when the process
    /// died; the in-memory ledger starts empty on restart.
    async fn rebuild_reservations(&self) {
        let margin = self.grid.margin_per_grid();
        for rung in &self.rungs {
            if rung.status != GridRungStatus::Pending {
                match self
                    .services
                    .ledger
                    .request_order_amount(self.bot.user_id, self.bot.id, margin)
                    .await
                {
                    Ok(ReserveDecision::Approved { .. }) => {}
                    Ok(ReserveDecision::Rejected { reason }) => {
                        tracing::warn!(
                            bot_id = self.bot.id,
                            rung = rung.grid_index,
                            reason,
                            "could not rebuild reservation on resume"
                        );
                    }
                    Err(e) => {
                        tracing::warn!(bot_id = self.bot.id, error = %e, "reservation rebuild failed");
                    }
                }
            }
        }
    }

    /// Check every resting order id against live exchange status before the
    /// loop resumes, applying fills that happened while we were down.
    async fn reconcile(&mut self) -> Result<(), GridLoopError> {
        for idx in 0..self.rungs.len() {
            match self.rungs[idx].status {
                GridRungStatus::BuyPlaced => self.check_buy_fill(idx).await?,
                GridRungStatus::SellPlaced => self.check_sell_fill(idx).await?,
                _ => {}
            }
        }
        tracing::info!(bot_id = self.bot.id, "grid orders reconciled after restart");
        Ok(())
    }

    async fn check_buy_fill(&mut self, idx: usize) -> Result<(), GridLoopError> {
        let Some(order_id) = self.rungs[idx].buy_order_id.clone() else {
            return Ok(());
        };
        let order = self
            .services
            .exchange
            .get_order(&self.bot.symbol, &order_id)
            .await?;

        match order.status {
            OrderStatus::Filled => {
                let fill_price = order.fill_price().unwrap_or(self.rungs[idx].grid_price);
                let qty = if order.filled_size > Decimal::ZERO {
                    order.filled_size
                } else {
                    order.size
                };
                if self.rungs[idx].record_buy_fill(&order_id, fill_price, qty, Utc::now())? {
                    tracing::info!(
                        bot_id = self.bot.id,
                        rung = idx,
                        %fill_price,
                        %qty,
                        "grid buy filled"
                    );
                }
            }
            OrderStatus::Canceled | OrderStatus::Rejected => {
                self.rungs[idx].mark_buy_canceled()?;
                self.services
                    .ledger
                    .release_order_amount(self.bot.id, self.grid.margin_per_grid())
                    .await;
            }
            _ => {}
        }
        Ok(())
    }

    /// Pair a filled buy with a sell one rung above.
    async fn place_sell(&mut self, idx: usize) -> Result<(), GridLoopError> {
        // The top rung never buys, so idx + 1 is always a valid rung.
        let sell_price = self.prices[idx + 1];
        let qty = self.rungs[idx]
            .buy_filled_qty
            .unwrap_or(Decimal::ZERO);
        if qty <= Decimal::ZERO {
            return Ok(());
        }

        let order = self
            .services
            .exchange
            .place_limit_order(&self.bot.symbol, OrderSide::Sell, sell_price, qty)
            .await?;
        self.rungs[idx].mark_sell_placed(order.order_id, sell_price)?;
        tracing::debug!(bot_id = self.bot.id, rung = idx, %sell_price, "grid sell placed");
        Ok(())
    }

    async fn check_sell_fill(&mut self, idx: usize) -> Result<(), GridLoopError> {
        let Some(order_id) = self.rungs[idx].sell_order_id.clone() else {
            return Ok(());
        };
        let order = self
            .services
            .exchange
            .get_order(&self.bot.symbol, &order_id)
            .await?;

        match order.status {
            OrderStatus::Filled => {
                let fill_price = order
                    .fill_price()
                    .or(self.rungs[idx].sell_price)
                    .unwrap_or(self.rungs[idx].grid_price);
                let buy_price = self.rungs[idx]
                    .buy_filled_price
                    .unwrap_or(self.rungs[idx].grid_price);
                let qty = if order.filled_size > Decimal::ZERO {
                    order.filled_size
                } else {
                    order.size
                };

                let profit = self.rungs[idx].record_sell_fill(
                    &order_id,
                    fill_price,
                    qty,
                    Utc::now(),
                    self.grid.taker_fee_rate,
                )?;

                if let Some(profit) = profit {
                    tracing::info!(
                        bot_id = self.bot.id,
                        rung = idx,
                        %profit,
                        cycles = self.rungs[idx].cycles_completed,
                        "grid cycle completed"
                    );
                    self.record_cycle_trade(buy_price, fill_price, qty, profit)
                        .await?;
                    // Cycle complete: the margin comes back until the next buy.
                    self.services
                        .ledger
                        .release_order_amount(self.bot.id, self.grid.margin_per_grid())
                        .await;
                }
            }
            OrderStatus::Canceled | OrderStatus::Rejected => {
                self.rungs[idx].mark_sell_canceled()?;
            }
            _ => {}
        }
        Ok(())
    }

    /// Place a resting buy at the rung price, reserving its margin first. A
    /// rejected reservation skips the rung without raising.
    async fn place_buy(&mut self, idx: usize) -> Result<(), GridLoopError> {
        let margin = self.grid.margin_per_grid();
        match self
            .services
            .ledger
            .request_order_amount(self.bot.user_id, self.bot.id, margin)
            .await?
        {
            ReserveDecision::Approved { .. } => {}
            ReserveDecision::Rejected { reason } => {
                tracing::debug!(bot_id = self.bot.id, rung = idx, reason, "grid buy skipped");
                return Ok(());
            }
        }

        let grid_price = self.rungs[idx].grid_price;
        let mut qty = (self.grid.per_grid_amount() / grid_price).round_dp(6);
        let min_lot = self.services.exchange.min_order_size(&self.bot.symbol);
        if qty < min_lot {
            qty = min_lot;
        }

        let placed = self
            .services
            .exchange
            .place_limit_order(&self.bot.symbol, OrderSide::Buy, grid_price, qty)
            .await;

        match placed {
            Ok(order) => {
                self.rungs[idx].mark_buy_placed(order.order_id)?;
                tracing::debug!(bot_id = self.bot.id, rung = idx, %grid_price, %qty, "grid buy placed");
                Ok(())
            }
            Err(e) => {
                self.services
                    .ledger
                    .release_order_amount(self.bot.id, margin)
                    .await;
                Err(GridLoopError::Exchange(e))
            }
        }
    }

    /// Persist one completed cycle as a closed round-trip trade.
    async fn record_cycle_trade(
        &mut self,
        buy_price: Decimal,
        sell_price: Decimal,
        qty: Decimal,
        profit: Decimal,
    ) -> Result<(), GridLoopError> {
        let mut trade = Trade::open(
            self.bot.user_id,
            Some(self.bot.id),
            &self.bot.symbol,
            Side::Long,
            qty,
            buy_price,
            self.grid.leverage,
            Some("grid_buy".into()),
        );
        let notional = buy_price * qty;
        let pnl_percent = if notional.is_zero() {
            Decimal::ZERO
        } else {
            profit / notional * Decimal::ONE_HUNDRED
        };
        trade.apply_exit(TradeExit {
            exit_price: sell_price,
            pnl: profit,
            pnl_percent,
            exit_reason: ExitReason::TakeProfit,
            exit_tag: Some("grid_cycle".into()),
            closed_at: Utc::now(),
        });
        self.services.store.insert_trade(&trade).await?;

        self.bot.record_trade_result(profit);
        self.services.store.save_bot(&self.bot).await?;

        self.services
            .notifier
            .notify_trade_closed(
                self.bot.user_id,
                self.bot.id,
                &self.bot.symbol,
                profit,
                ExitReason::TakeProfit,
            )
            .await;
        Ok(())
    }

    /// User stop: cancel every resting order, roll rung states back, persist
    /// the ladder so the next start resumes cleanly.
    async fn graceful_stop(&mut self) -> LoopExit {
        let margin = self.grid.margin_per_grid();

        for idx in 0..self.rungs.len() {
            let Some(order_id) = self.rungs[idx].open_order_id().map(String::from) else {
                continue;
            };
            match self
                .services
                .exchange
                .cancel_order(&self.bot.symbol, &order_id)
                .await
            {
                Ok(()) => {
                    let result = match self.rungs[idx].status {
                        GridRungStatus::BuyPlaced => {
                            self.services
                                .ledger
                                .release_order_amount(self.bot.id, margin)
                                .await;
                            self.rungs[idx].mark_buy_canceled()
                        }
                        GridRungStatus::SellPlaced => self.rungs[idx].mark_sell_canceled(),
                        _ => Ok(()),
                    };
                    if let Err(e) = result {
                        tracing::warn!(bot_id = self.bot.id, rung = idx, error = %e, "rung rollback failed");
                    }
                }
                Err(e) => {
                    tracing::warn!(bot_id = self.bot.id, rung = idx, error = %e, "cancel on stop failed");
                }
            }
        }

        if let Err(e) = self
            .services
            .store
            .save_grid_rungs(self.bot.id, &self.rungs)
            .await
        {
            tracing::error!(bot_id = self.bot.id, error = %e, "failed to persist ladder on stop");
        }

        tracing::info!(bot_id = self.bot.id, "grid loop stopped by user");
        LoopExit::UserStop
    }
}
