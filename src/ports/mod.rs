//! Ports Layer - Trait definitions for external collaborators
//!
//! Following hexagonal architecture, these traits abstract:
//! - The futures exchange REST API (balance, positions, orders)
//! - The persistence layer (bots, trades, positions, grid rungs, settings)
//! - The notification channel (fire-and-forget user messages)

pub mod exchange;
pub mod mocks;
pub mod notify;
pub mod store;
