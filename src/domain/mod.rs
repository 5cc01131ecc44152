//! Domain Layer - Core coordination logic for the multi-bot subsystem
//!
//! - `allocation`: per-user capital reservation ledger
//! - `isolation`: per-(user, symbol) position isolation registry
//! - `recovery`: error taxonomy, classification and bounded retry scheduling
//! - `risk`: daily-loss / max-positions / leverage gates
//! - `grid`: grid ladder math and per-rung cycle state machine
//! - `bot`, `position`, `trade`: persisted records shared with the store

pub mod allocation;
pub mod bot;
pub mod grid;
pub mod isolation;
pub mod position;
pub mod recovery;
pub mod risk;
pub mod trade;

pub use allocation::{AllocationCheck, AllocationError, AllocationLedger, ReserveDecision};
pub use bot::{BotId, BotInstance, BotRuntimeStatus, BotType, StopCause, UserId};
pub use grid::{
    build_rungs, calculate_grid_prices, calculate_per_grid_amount, cycle_profit, GridBotConfig,
    GridError, GridMode, GridRung, GridRungStatus,
};
pub use isolation::{IsolationDecision, IsolationError, PositionIsolationRegistry};
pub use position::{PositionError, PositionRecord, Side};
pub use recovery::{
    classify_error, retry_delay, ErrorKind, ErrorPolicy, RecoveryDirective, RecoveryScheduler,
    Severity,
};
pub use risk::{EntryPermit, RiskError, RiskGate, RiskSettings, RiskVerdict};
pub use trade::{ExitReason, Trade, TradeExit};
