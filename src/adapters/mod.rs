//! Adapters Layer - Concrete implementations of the ports
//!
//! - `bitget`: REST client for a Bitget-compatible futures gateway
//! - `paper`: deterministic in-process exchange for paper trading and tests
//! - `store`: in-memory store with JSON snapshot persistence
//! - `notify`: logging and webhook notifiers
//! - `cli`: clap command definitions

pub mod bitget;
pub mod cli;
pub mod notify;
pub mod paper;
pub mod store;
