//! Shared market feed
//!
//! One broadcast channel fans ticks out to every bot loop; each loop
//! filters to its own symbol with a bounded wait so stalls are detectable.
//! A REST poller task feeds the channel when no push source exists.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use tokio::sync::broadcast;

use crate::ports::exchange::ExchangePort;

/// Default broadcast buffer; slow receivers drop oldest ticks (lag), they
/// never block the publisher.
pub const DEFAULT_FEED_CAPACITY: usize = 1024;

#[derive(Debug, Clone, PartialEq)]
pub struct Tick {
    pub symbol: String,
    pub price: Decimal,
    pub ts: DateTime<Utc>,
}

impl Tick {
    pub fn new(symbol: impl Into<String>, price: Decimal) -> Self {
        Self { symbol: symbol.into(), price, ts: Utc::now() }
    }
}

/// Publisher half of the shared tick queue.
#[derive(Clone)]
pub struct MarketFeed {
    tx: broadcast::Sender<Tick>,
}

impl MarketFeed {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn publish(&self, tick: Tick) {
        // Send only fails when no receiver exists, which is fine.
        let _ = self.tx.send(tick);
    }

    pub fn subscribe(&self) -> TickStream {
        TickStream { rx: self.tx.subscribe() }
    }

    /// Unfiltered receiver for bridges that want every symbol.
    pub fn subscribe_raw(&self) -> broadcast::Receiver<Tick> {
        self.tx.subscribe()
    }

    pub fn receiver_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for MarketFeed {
    fn default() -> Self {
        Self::new(DEFAULT_FEED_CAPACITY)
    }
}

/// Per-loop receiving half with symbol filtering.
pub struct TickStream {
    rx: broadcast::Receiver<Tick>,
}

impl TickStream {
    /// Next tick for `symbol`, waiting at most `wait`. Ticks for other
    /// symbols are skipped; lagged receivers resynchronize silently.
    /// `None` means the wait elapsed (callers re-poll, no action).
    pub async fn next_for(&mut self, symbol: &str, wait: Duration) -> Option<Tick> {
        let deadline = tokio::time::Instant::now() + wait;
        loop {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero() {
                return None;
            }
            match tokio::time::timeout(remaining, self.rx.recv()).await {
                Ok(Ok(tick)) if tick.symbol == symbol => return Some(tick),
                Ok(Ok(_)) => continue,
                Ok(Err(broadcast::error::RecvError::Lagged(skipped))) => {
                    tracing::debug!(skipped, "tick stream lagged, resynchronizing");
                    continue;
                }
                Ok(Err(broadcast::error::RecvError::Closed)) => return None,
                Err(_) => return None,
            }
        }
    }
}

/// Poll REST last-price for each symbol into the feed at a fixed interval.
/// Runs until the returned task is aborted; fetch failures are logged and
/// skipped so one bad symbol cannot stall the feed.
pub fn spawn_price_poller(
    exchange: Arc<dyn ExchangePort>,
    symbols: Vec<String>,
    interval: Duration,
    feed: MarketFeed,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            ticker.tick().await;
            for symbol in &symbols {
                match exchange.last_price(symbol).await {
                    Ok(price) => feed.publish(Tick::new(symbol.clone(), price)),
                    Err(e) => {
                        tracing::warn!(symbol, error = %e, "price poll failed");
                    }
                }
            }
        }
    })
}
