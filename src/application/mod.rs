//! Application Layer - Orchestration and per-bot loops
//!
//! - `orchestrator`: owns the running-loop map, start/stop/status
//! - `trend_loop`: signal-driven per-bot task
//! - `grid_loop`: grid-ladder per-bot task
//! - `market_data`: shared tick feed and REST price poller

pub mod grid_loop;
pub mod market_data;
pub mod orchestrator;
pub mod trend_loop;

use std::sync::Arc;

use crate::domain::allocation::AllocationLedger;
use crate::domain::isolation::PositionIsolationRegistry;
use crate::domain::recovery::RecoveryScheduler;
use crate::domain::risk::RiskGate;
use crate::ports::exchange::ExchangePort;
use crate::ports::notify::NotifierPort;
use crate::ports::store::StorePort;

pub use market_data::{MarketFeed, Tick, TickStream};
pub use orchestrator::{BotOrchestrator, OrchestratorError};

/// Explicitly constructed service bundle, one instance per process, passed
/// by handle into every bot loop (no module-level singletons).
#[derive(Clone)]
pub struct Services {
    pub exchange: Arc<dyn ExchangePort>,
    pub store: Arc<dyn StorePort>,
    pub notifier: Arc<dyn NotifierPort>,
    pub ledger: Arc<AllocationLedger>,
    pub isolation: Arc<PositionIsolationRegistry>,
    pub risk: Arc<RiskGate>,
    pub recovery: Arc<RecoveryScheduler>,
    pub feed: MarketFeed,
}

impl Services {
    /// Wire the standard service graph over the given adapters.
    pub fn new(
        exchange: Arc<dyn ExchangePort>,
        store: Arc<dyn StorePort>,
        notifier: Arc<dyn NotifierPort>,
        feed: MarketFeed,
    ) -> Self {
        let ledger = Arc::new(AllocationLedger::new(Arc::clone(&exchange)));
        let isolation = Arc::new(PositionIsolationRegistry::new(Arc::clone(&store)));
        let risk = Arc::new(RiskGate::new(Arc::clone(&store), Arc::clone(&exchange)));
        let recovery = Arc::new(RecoveryScheduler::new());

        Self {
            exchange,
            store,
            notifier,
            ledger,
            isolation,
            risk,
            recovery,
            feed,
        }
    }

    pub fn with_ledger(mut self, ledger: Arc<AllocationLedger>) -> Self {
        self.ledger = ledger;
        self
    }

    pub fn with_isolation(mut self, isolation: Arc<PositionIsolationRegistry>) -> Self {
        self.isolation = isolation;
        self
    }
}
