//! Bitget-compatible REST exchange adapter.

mod client;
mod types;

pub use client::{BitgetClient, BitgetConfig};
