//! Bot orchestrator
//!
//! Owns the map of running loop tasks, exposes start/stop/status to the API
//! layer, and turns loop exits into persisted state transitions. Restart
//! after a recoverable failure is delegated to the recovery scheduler - the
//! single retry owner; `runtime_status` only reports.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::DateTime;
use rust_decimal::Decimal;
use thiserror::Error;
use tokio::sync::{watch, RwLock};
use tokio::task::JoinHandle;

use crate::application::grid_loop::{GridBotLoop, GridLoopConfig, GridLoopError};
use crate::application::trend_loop::{
    LoopExit, OpenTrade, TrendBotLoop, TrendLoopConfig, TrendLoopError,
};
use crate::application::Services;
use crate::domain::bot::{BotId, BotInstance, BotRuntimeStatus, BotType, StopCause, UserId};
use crate::domain::allocation::ReserveDecision;
use crate::ports::store::StoreError;

/// How long a stop waits for a graceful loop exit before aborting the task.
pub const DEFAULT_STOP_GRACE: Duration = Duration::from_secs(10);

#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("Bot {0} not found")]
    NotFound(BotId),

    #[error("Bot {bot_id} does not belong to user {user_id}")]
    NotOwned { bot_id: BotId, user_id: UserId },

    #[error("Bot {0} is already running")]
    AlreadyRunning(BotId),

    #[error("Bot {0} is not running")]
    NotRunning(BotId),

    #[error("Bot {0} is disabled")]
    Inactive(BotId),

    #[error("Allocation percentages would total {0}%, over 100%")]
    AllocationExceeded(Decimal),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Trend loop setup failed: {0}")]
    TrendSetup(#[from] TrendLoopError),

    #[error("Grid loop setup failed: {0}")]
    GridSetup(#[from] GridLoopError),
}

struct RunningBot {
    user_id: UserId,
    shutdown: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

pub struct BotOrchestrator {
    services: Services,
    trend_config: TrendLoopConfig,
    grid_config: GridLoopConfig,
    stop_grace: Duration,
    running: RwLock<HashMap<BotId, RunningBot>>,
}

impl BotOrchestrator {
    pub fn new(services: Services) -> Self {
        Self {
            services,
            trend_config: TrendLoopConfig::default(),
            grid_config: GridLoopConfig::default(),
            stop_grace: DEFAULT_STOP_GRACE,
            running: RwLock::new(HashMap::new()),
        }
    }

    pub fn with_trend_config(mut self, config: TrendLoopConfig) -> Self {
        self.trend_config = config;
        self
    }

    pub fn with_grid_config(mut self, config: GridLoopConfig) -> Self {
        self.grid_config = config;
        self
    }

    pub fn with_stop_grace(mut self, grace: Duration) -> Self {
        self.stop_grace = grace;
        self
    }

    pub fn services(&self) -> &Services {
        &self.services
    }

    /// One-time process startup: rebuild the isolation cache from the store
    /// before any loop begins trading.
    pub async fn startup(&self) -> Result<(), OrchestratorError> {
        self.services
            .isolation
            .sync_from_store(None)
            .await
            .map_err(|e| OrchestratorError::Store(StoreError::Io(e.to_string())))?;
        Ok(())
    }

    /// Start one bot instance for its owner.
    pub async fn start_instance(
        self: &Arc<Self>,
        bot_id: BotId,
        user_id: UserId,
    ) -> Result<(), OrchestratorError> {
        let mut bot = self
            .services
            .store
            .bot(bot_id)
            .await?
            .ok_or(OrchestratorError::NotFound(bot_id))?;

        if bot.user_id != user_id {
            return Err(OrchestratorError::NotOwned { bot_id, user_id });
        }
        if !bot.is_active {
            return Err(OrchestratorError::Inactive(bot_id));
        }

        // Hold the map lock across the whole admission so a concurrent start
        // of the same bot cannot double-spawn.
        let mut running = self.running.write().await;
        if let Some(entry) = running.get(&bot_id) {
            if !entry.handle.is_finished() {
                return Err(OrchestratorError::AlreadyRunning(bot_id));
            }
            running.remove(&bot_id);
        }

        match self
            .services
            .ledger
            .validate_allocation(user_id, bot.allocation_percent, Some(bot_id))
            .await
        {
            crate::domain::allocation::AllocationCheck::Valid { .. } => {}
            crate::domain::allocation::AllocationCheck::Exceeded { total_percent } => {
                return Err(OrchestratorError::AllocationExceeded(total_percent));
            }
        }

        // Loop construction has no side effects; build before touching the
        // ledger or the store so failures leave nothing to roll back. The
        // started flags are set first so the loop's own copy of the record
        // carries them when it persists trade stats mid-run.
        bot.mark_started();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        enum BuiltLoop {
            Trend(TrendBotLoop),
            Grid(GridBotLoop),
        }
        let mut built = match bot.bot_type {
            BotType::Trend => BuiltLoop::Trend(TrendBotLoop::new(
                bot.clone(),
                self.services.clone(),
                self.trend_config.clone(),
                shutdown_rx,
            )?),
            BotType::Grid => BuiltLoop::Grid(GridBotLoop::new(
                bot.clone(),
                self.services.clone(),
                self.grid_config.clone(),
                shutdown_rx,
            )?),
        };

        self.services
            .ledger
            .register_bot(user_id, bot_id, bot.allocation_percent)
            .await;

        if let BuiltLoop::Trend(ref mut bot_loop) = built {
            match self.find_open_trade(&bot).await {
                Ok(Some(open)) => {
                    self.restore_reservation(&bot, &open).await;
                    bot_loop.resume_open_trade(open);
                }
                Ok(None) => {}
                Err(e) => {
                    self.services.ledger.unregister_bot(bot_id).await;
                    return Err(e.into());
                }
            }
        }

        if let Err(e) = self.services.store.save_bot(&bot).await {
            self.services.ledger.unregister_bot(bot_id).await;
            return Err(e.into());
        }

        let name = bot.name.clone();
        let handle = match built {
            BuiltLoop::Trend(bot_loop) => {
                let orchestrator = Arc::clone(self);
                tokio::spawn(async move {
                    let exit = bot_loop.run().await;
                    orchestrator.finish(bot_id, user_id, exit).await;
                })
            }
            BuiltLoop::Grid(mut bot_loop) => {
                let orchestrator = Arc::clone(self);
                tokio::spawn(async move {
                    let exit = match bot_loop.prepare().await {
                        Ok(()) => bot_loop.run().await,
                        Err(e) => LoopExit::ErrorStop { reason: e.to_string() },
                    };
                    orchestrator.finish(bot_id, user_id, exit).await;
                })
            }
        };

        running.insert(bot_id, RunningBot { user_id, shutdown: shutdown_tx, handle });
        drop(running);

        tracing::info!(bot_id, user_id, name, "bot instance started");
        self.services
            .notifier
            .notify_bot_started(user_id, bot_id, &name)
            .await;
        Ok(())
    }

    /// Stop one bot instance: graceful shutdown signal, bounded wait, abort
    /// as a last resort. Cancels any pending recovery - a user stop always
    /// wins over a scheduled retry.
    pub async fn stop_instance(
        &self,
        bot_id: BotId,
        user_id: UserId,
    ) -> Result<(), OrchestratorError> {
        let entry = {
            let mut running = self.running.write().await;
            if let Some(existing) = running.get(&bot_id) {
                if existing.user_id != user_id {
                    return Err(OrchestratorError::NotOwned { bot_id, user_id });
                }
            }
            running.remove(&bot_id)
        };

        self.services.recovery.cancel_pending(bot_id).await;

        let Some(entry) = entry else {
            // Not in memory; still normalize the persisted flag so a stale
            // DB_RUNNING_MEMORY_STOPPED record converges.
            return self.persist_stopped(bot_id, StopCause::User, None).await;
        };

        let _ = entry.shutdown.send(true);
        let abort = entry.handle.abort_handle();
        match tokio::time::timeout(self.stop_grace, entry.handle).await {
            Ok(_) => {}
            Err(_) => {
                tracing::warn!(bot_id, "graceful stop timed out, aborting task");
                abort.abort();
            }
        }

        self.persist_stopped(bot_id, StopCause::User, None).await?;
        self.services.ledger.unregister_bot(bot_id).await;
        tracing::info!(bot_id, user_id, "bot instance stopped");
        Ok(())
    }

    pub async fn is_instance_running(&self, bot_id: BotId) -> bool {
        let running = self.running.read().await;
        running
            .get(&bot_id)
            .map(|e| !e.handle.is_finished())
            .unwrap_or(false)
    }

    pub async fn get_user_running_bots(&self, user_id: UserId) -> HashSet<BotId> {
        let running = self.running.read().await;
        running
            .iter()
            .filter(|(_, e)| e.user_id == user_id && !e.handle.is_finished())
            .map(|(id, _)| *id)
            .collect()
    }

    /// Persisted `is_running` vs live task state, as one explicit value.
    pub async fn runtime_status(&self, bot_id: BotId) -> Result<BotRuntimeStatus, OrchestratorError> {
        let bot = self
            .services
            .store
            .bot(bot_id)
            .await?
            .ok_or(OrchestratorError::NotFound(bot_id))?;
        let task_alive = self.is_instance_running(bot_id).await;
        Ok(BotRuntimeStatus::of(bot.is_running, task_alive))
    }

    /// Crash recovery: restart every bot the store still marks as running.
    /// Called once after `startup`.
    pub async fn resume_marked_running(self: &Arc<Self>) -> Result<Vec<BotId>, OrchestratorError> {
        let bots = self.services.store.all_bots().await?;
        let mut resumed = Vec::new();
        for bot in bots.into_iter().filter(|b| b.is_running && b.is_active) {
            match self.start_instance(bot.id, bot.user_id).await {
                Ok(()) => resumed.push(bot.id),
                Err(e) => {
                    tracing::error!(bot_id = bot.id, error = %e, "failed to resume bot");
                }
            }
        }
        if !resumed.is_empty() {
            tracing::info!(count = resumed.len(), "bots resumed after restart");
        }
        Ok(resumed)
    }

    /// Stop everything (process shutdown).
    pub async fn stop_all(&self) {
        let ids: Vec<(BotId, UserId)> = {
            let running = self.running.read().await;
            running.iter().map(|(id, e)| (*id, e.user_id)).collect()
        };
        for (bot_id, user_id) in ids {
            if let Err(e) = self.stop_instance(bot_id, user_id).await {
                tracing::error!(bot_id, error = %e, "stop_all: failed to stop bot");
            }
        }
    }

    /// Handle a loop's exit: persist the outcome and, for a backoff exit,
    /// hand the restart to the recovery scheduler.
    fn finish<'a>(
        self: &'a Arc<Self>,
        bot_id: BotId,
        user_id: UserId,
        exit: LoopExit,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = ()> + Send + 'a>> {
        // Manually boxed (rather than `async fn`) to give this helper a
        // concrete future type. `finish` and `start_instance` call each other,
        // and two mutually-recursive `async fn`s defeat the compiler's `Send`
        // auto-trait inference; erasing one opaque return type breaks the cycle.
        Box::pin(async move {
        match exit {
            LoopExit::UserStop => {
                // stop_instance persists the stop; nothing more to do here
                // beyond making sure the map entry is gone.
                self.running.write().await.remove(&bot_id);
            }
            LoopExit::ErrorStop { reason } => {
                self.running.write().await.remove(&bot_id);
                if let Err(e) = self
                    .persist_stopped(bot_id, StopCause::Error, Some(&reason))
                    .await
                {
                    tracing::error!(bot_id, error = %e, "failed to persist error stop");
                }
                self.services.ledger.unregister_bot(bot_id).await;
                if let Ok(Some(bot)) = self.services.store.bot(bot_id).await {
                    self.services
                        .notifier
                        .notify_bot_stopped(user_id, bot_id, &bot.name, &reason)
                        .await;
                }
                tracing::error!(bot_id, reason, "bot stopped on fatal error");
            }
            LoopExit::Backoff { delay, reason } => {
                // The store keeps is_running=true: runtime_status surfaces
                // the DB-running/memory-stopped mismatch until the retry.
                self.running.write().await.remove(&bot_id);
                tracing::warn!(bot_id, ?delay, reason, "loop parked, retry scheduled");
                let orchestrator = Arc::clone(self);
                self.services
                    .recovery
                    .schedule_recovery(bot_id, delay, move || async move {
                        if let Err(e) = orchestrator.start_instance(bot_id, user_id).await {
                            tracing::error!(bot_id, error = %e, "scheduled restart failed");
                        }
                    })
                    .await;
            }
        }
        })
    }

    async fn persist_stopped(
        &self,
        bot_id: BotId,
        cause: StopCause,
        error: Option<&str>,
    ) -> Result<(), OrchestratorError> {
        let Some(mut bot) = self.services.store.bot(bot_id).await? else {
            return Err(OrchestratorError::NotFound(bot_id));
        };
        if let Some(message) = error {
            bot.set_last_error(message);
        }
        bot.mark_stopped(cause);
        self.services.store.save_bot(&bot).await?;
        Ok(())
    }

    /// Locate a still-open round trip for a trend bot (exit fields unset).
    async fn find_open_trade(&self, bot: &BotInstance) -> Result<Option<OpenTrade>, StoreError> {
        let epoch = DateTime::<chrono::Utc>::UNIX_EPOCH;
        let trades = self.services.store.trades_since(bot.user_id, epoch).await?;
        let open = trades
            .into_iter()
            .find(|t| t.bot_id == Some(bot.id) && !t.is_closed());

        let Some(trade) = open else { return Ok(None) };

        let positions = self.services.store.open_positions(Some(bot.user_id)).await?;
        let position_id = positions
            .iter()
            .find(|p| p.bot_id == Some(bot.id) && p.symbol == bot.symbol)
            .map(|p| p.id)
            .unwrap_or(0);

        // The original reservation amount is not persisted; the committed
        // margin (notional / leverage) is the faithful reconstruction.
        let leverage = trade.leverage.max(1);
        let reserved = trade.entry_price * trade.qty / Decimal::from(leverage);

        Ok(Some(OpenTrade {
            trade_id: trade.id,
            position_id,
            side: trade.side,
            qty: trade.qty,
            entry_price: trade.entry_price,
            leverage: trade.leverage,
            reserved,
            opened_at: trade.opened_at,
        }))
    }

    async fn restore_reservation(&self, bot: &BotInstance, open: &OpenTrade) {
        match self
            .services
            .ledger
            .request_order_amount(bot.user_id, bot.id, open.reserved)
            .await
        {
            Ok(ReserveDecision::Approved { .. }) => {}
            Ok(ReserveDecision::Rejected { reason }) => {
                tracing::warn!(bot_id = bot.id, reason, "could not restore reservation on resume");
            }
            Err(e) => {
                tracing::warn!(bot_id = bot.id, error = %e, "reservation restore failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::market_data::MarketFeed;
    use crate::domain::grid::{GridBotConfig, GridMode};
    use crate::ports::mocks::{MockExchange, MockNotifier, MockStore};
    use crate::ports::store::StorePort;
    use crate::strategy::{SmaCrossParams, StrategySpec};
    use rust_decimal_macros::dec;

    struct Harness {
        exchange: Arc<MockExchange>,
        store: Arc<MockStore>,
        notifier: Arc<MockNotifier>,
        orchestrator: Arc<BotOrchestrator>,
    }

    async fn harness() -> Harness {
        let exchange = Arc::new(MockExchange::new(dec!(10000)));
        let store = Arc::new(MockStore::new());
        let notifier = Arc::new(MockNotifier::new());
        let services = Services::new(
            exchange.clone(),
            store.clone(),
            notifier.clone(),
            MarketFeed::default(),
        );
        let orchestrator = Arc::new(
            BotOrchestrator::new(services).with_stop_grace(Duration::from_secs(2)),
        );
        Harness { exchange, store, notifier, orchestrator }
    }

    fn trend_bot(id: BotId, user: UserId, symbol: &str, percent: Decimal) -> BotInstance {
        BotInstance::new(id, user, format!("trend-{id}"), BotType::Trend, symbol, 10, percent)
            .with_strategy(StrategySpec::SmaCross(SmaCrossParams::default()))
    }

    fn grid_bot(id: BotId, user: UserId) -> BotInstance {
        let grid = GridBotConfig {
            lower_price: dec!(100),
            upper_price: dec!(200),
            grid_count: 5,
            mode: GridMode::Arithmetic,
            total_investment: dec!(500),
            leverage: 1,
            taker_fee_rate: dec!(0.0006),
            effective_grids: None,
        };
        BotInstance::new(id, user, format!("grid-{id}"), BotType::Grid, "BTCUSDT", 5, dec!(50))
            .with_grid(grid)
    }

    #[tokio::test]
    async fn test_start_and_stop_trend_bot() {
        let h = harness().await;
        h.store.save_bot(&trend_bot(1, 100, "ETHUSDT", dec!(50))).await.unwrap();

        h.orchestrator.start_instance(1, 100).await.unwrap();
        assert!(h.orchestrator.is_instance_running(1).await);
        assert_eq!(h.orchestrator.get_user_running_bots(100).await, HashSet::from([1]));

        let bot = h.store.bot(1).await.unwrap().unwrap();
        assert!(bot.is_running);
        assert!(bot.last_started_at.is_some());

        h.orchestrator.stop_instance(1, 100).await.unwrap();
        assert!(!h.orchestrator.is_instance_running(1).await);

        let bot = h.store.bot(1).await.unwrap().unwrap();
        assert!(!bot.is_running);
        assert_eq!(bot.stop_cause, Some(StopCause::User));

        let events = h.notifier.events().await;
        assert!(events.iter().any(|e| e.starts_with("bot_started:100:1")));
    }

    #[tokio::test]
    async fn test_double_start_rejected() {
        let h = harness().await;
        h.store.save_bot(&trend_bot(1, 100, "ETHUSDT", dec!(50))).await.unwrap();

        h.orchestrator.start_instance(1, 100).await.unwrap();
        let err = h.orchestrator.start_instance(1, 100).await.unwrap_err();
        assert!(matches!(err, OrchestratorError::AlreadyRunning(1)));

        h.orchestrator.stop_instance(1, 100).await.unwrap();
    }

    #[tokio::test]
    async fn test_ownership_enforced() {
        let h = harness().await;
        h.store.save_bot(&trend_bot(1, 100, "ETHUSDT", dec!(50))).await.unwrap();

        let err = h.orchestrator.start_instance(1, 999).await.unwrap_err();
        assert!(matches!(err, OrchestratorError::NotOwned { .. }));
    }

    #[tokio::test]
    async fn test_unknown_and_inactive_bots() {
        let h = harness().await;
        assert!(matches!(
            h.orchestrator.start_instance(42, 100).await.unwrap_err(),
            OrchestratorError::NotFound(42)
        ));

        let mut bot = trend_bot(2, 100, "ETHUSDT", dec!(50));
        bot.is_active = false;
        h.store.save_bot(&bot).await.unwrap();
        assert!(matches!(
            h.orchestrator.start_instance(2, 100).await.unwrap_err(),
            OrchestratorError::Inactive(2)
        ));
    }

    #[tokio::test]
    async fn test_allocation_over_100_rejected() {
        let h = harness().await;
        h.store.save_bot(&trend_bot(1, 100, "ETHUSDT", dec!(60))).await.unwrap();
        h.store.save_bot(&trend_bot(2, 100, "BTCUSDT", dec!(60))).await.unwrap();

        h.orchestrator.start_instance(1, 100).await.unwrap();
        let err = h.orchestrator.start_instance(2, 100).await.unwrap_err();
        assert!(matches!(err, OrchestratorError::AllocationExceeded(_)));

        h.orchestrator.stop_instance(1, 100).await.unwrap();
    }

    #[tokio::test]
    async fn test_grid_bot_starts_and_places_ladder() {
        let h = harness().await;
        h.exchange.set_mark_price("BTCUSDT", dec!(160)).await;
        h.store.save_bot(&grid_bot(3, 100)).await.unwrap();

        h.orchestrator.start_instance(3, 100).await.unwrap();
        assert!(h.orchestrator.is_instance_running(3).await);

        // Give the loop a moment to place initial orders via the REST
        // fallback price.
        tokio::time::sleep(Duration::from_millis(300)).await;
        h.orchestrator.stop_instance(3, 100).await.unwrap();

        let rungs = h.store.grid_rungs(3).await.unwrap();
        assert_eq!(rungs.len(), 5);
    }

    #[tokio::test]
    async fn test_runtime_status_reports_mismatch() {
        let h = harness().await;
        let mut bot = trend_bot(1, 100, "ETHUSDT", dec!(50));
        bot.is_running = true; // store says running, no task alive
        h.store.save_bot(&bot).await.unwrap();

        let status = h.orchestrator.runtime_status(1).await.unwrap();
        assert_eq!(status, BotRuntimeStatus::DbRunningMemoryStopped);
        assert!(!status.is_consistent());
    }

    #[tokio::test]
    async fn test_resume_marked_running() {
        let h = harness().await;
        let mut bot = trend_bot(1, 100, "ETHUSDT", dec!(50));
        bot.is_running = true;
        h.store.save_bot(&bot).await.unwrap();

        let resumed = h.orchestrator.resume_marked_running().await.unwrap();
        assert_eq!(resumed, vec![1]);
        assert!(h.orchestrator.is_instance_running(1).await);

        h.orchestrator.stop_instance(1, 100).await.unwrap();
    }

    #[tokio::test]
    async fn test_stop_all() {
        let h = harness().await;
        h.store.save_bot(&trend_bot(1, 100, "ETHUSDT", dec!(30))).await.unwrap();
        h.store.save_bot(&trend_bot(2, 100, "BTCUSDT", dec!(30))).await.unwrap();

        h.orchestrator.start_instance(1, 100).await.unwrap();
        h.orchestrator.start_instance(2, 100).await.unwrap();

        h.orchestrator.stop_all().await;
        assert!(h.orchestrator.get_user_running_bots(100).await.is_empty());
    }

    #[tokio::test]
    async fn test_stop_not_running_normalizes_store() {
        let h = harness().await;
        let mut bot = trend_bot(1, 100, "ETHUSDT", dec!(50));
        bot.is_running = true;
        h.store.save_bot(&bot).await.unwrap();

        h.orchestrator.stop_instance(1, 100).await.unwrap();
        let bot = h.store.bot(1).await.unwrap().unwrap();
        assert!(!bot.is_running);
    }
}
