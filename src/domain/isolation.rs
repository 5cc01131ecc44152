//! Position isolation registry
//!
//! Guarantees at most one bot instance holds a position on a given
//! (user, symbol) at a time, unless symbol sharing is explicitly allowed.
//! Open/close decisions for one (user, symbol) are serialized by a lazily
//! created, never-removed async lock; an in-memory cache mirrors the
//! persisted position table and is rebuilt from the store at startup.

use std::collections::HashMap;
use std::sync::Arc;

use rust_decimal::Decimal;
use thiserror::Error;
use tokio::sync::{Mutex, RwLock};

use crate::domain::bot::{BotId, UserId};
use crate::domain::position::{PositionRecord, Side};
use crate::ports::store::{StoreError, StorePort};

#[derive(Debug, Error)]
pub enum IsolationError {
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Position error: {0}")]
    Position(#[from] crate::domain::position::PositionError),

    #[error("Position conflict on {symbol}: {reason}")]
    Conflict { symbol: String, reason: String },

    #[error("No tracked position for bot {bot_id} on {symbol}")]
    NotHolding { bot_id: BotId, symbol: String },
}

/// Outcome of an open-permission check. Denial is an expected steady-state
/// outcome; callers branch on it rather than catching errors.
#[derive(Debug, Clone, PartialEq)]
pub enum IsolationDecision {
    Granted,
    Denied { reason: String },
}

impl IsolationDecision {
    pub fn is_granted(&self) -> bool {
        matches!(self, IsolationDecision::Granted)
    }

    pub fn reason(&self) -> Option<&str> {
        match self {
            IsolationDecision::Granted => None,
            IsolationDecision::Denied { reason } => Some(reason),
        }
    }
}

/// Cached "who holds this symbol" fact.
#[derive(Debug, Clone)]
struct SymbolHolder {
    bot_id: Option<BotId>,
    position_id: i64,
}

type SymbolKey = (UserId, String);

pub struct PositionIsolationRegistry {
    store: Arc<dyn StorePort>,
    /// When true, different bots may hold the same symbol concurrently.
    allow_shared_symbol: bool,
    locks: Mutex<HashMap<SymbolKey, Arc<Mutex<()>>>>,
    cache: RwLock<HashMap<SymbolKey, SymbolHolder>>,
}

impl PositionIsolationRegistry {
    pub fn new(store: Arc<dyn StorePort>) -> Self {
        Self {
            store,
            allow_shared_symbol: false,
            locks: Mutex::new(HashMap::new()),
            cache: RwLock::new(HashMap::new()),
        }
    }

    pub fn with_shared_symbols(mut self, allow: bool) -> Self {
        self.allow_shared_symbol = allow;
        self
    }

    /// Rebuild the cache from persisted positions. Must run once at process
    /// start, before any bot loop begins trading.
    pub async fn sync_from_store(&self, user_id: Option<UserId>) -> Result<usize, IsolationError> {
        let positions = self.store.open_positions(user_id).await?;

        let mut cache = self.cache.write().await;
        match user_id {
            Some(uid) => cache.retain(|(u, _), _| *u != uid),
            None => cache.clear(),
        }

        let mut restored = 0;
        for pos in positions {
            if pos.size <= Decimal::ZERO {
                continue;
            }
            cache.insert(
                (pos.user_id, pos.symbol.clone()),
                SymbolHolder { bot_id: pos.bot_id, position_id: pos.id },
            );
            restored += 1;
        }

        tracing::info!(restored, "position isolation cache synced from store");
        Ok(restored)
    }

    /// Can `bot_id` open a position on (user, symbol)?
    ///
    /// Checks, under the per-(user, symbol) lock: the bot does not already
    /// hold the symbol; no other holder exists when isolation is enforced;
    /// and the persisted table as a fallback against cache staleness.
    pub async fn can_open_position(
        &self,
        user_id: UserId,
        bot_id: BotId,
        symbol: &str,
        _side: Side,
    ) -> Result<IsolationDecision, IsolationError> {
        let lock = self.symbol_lock(user_id, symbol).await;
        let _guard = lock.lock().await;
        self.check_locked(user_id, bot_id, symbol).await
    }

    /// Persist and cache a new position. Called only after the entry order
    /// is confirmed filled; re-checks isolation under the lock so two bots
    /// racing past `can_open_position` cannot both register.
    pub async fn register_position(
        &self,
        user_id: UserId,
        bot_id: BotId,
        symbol: &str,
        side: Side,
        size: Decimal,
        entry_price: Decimal,
        leverage: u32,
    ) -> Result<i64, IsolationError> {
        let lock = self.symbol_lock(user_id, symbol).await;
        let _guard = lock.lock().await;

        if let IsolationDecision::Denied { reason } =
            self.check_locked(user_id, bot_id, symbol).await?
        {
            return Err(IsolationError::Conflict { symbol: symbol.to_string(), reason });
        }

        let mut position =
            PositionRecord::new(user_id, Some(bot_id), symbol, side, size, entry_price, leverage)?;
        let position_id = self.store.insert_position(&position).await?;
        position.id = position_id;

        self.cache.write().await.insert(
            (user_id, symbol.to_string()),
            SymbolHolder { bot_id: Some(bot_id), position_id },
        );

        tracing::info!(user_id, bot_id, symbol, %size, %entry_price, "position registered");
        Ok(position_id)
    }

    /// Update size/average entry on pyramiding.
    pub async fn update_position(
        &self,
        user_id: UserId,
        bot_id: BotId,
        symbol: &str,
        add_size: Decimal,
        fill_price: Decimal,
    ) -> Result<(), IsolationError> {
        let lock = self.symbol_lock(user_id, symbol).await;
        let _guard = lock.lock().await;

        let position_id = self
            .holder_position_id(user_id, bot_id, symbol)
            .await
            .ok_or(IsolationError::NotHolding { bot_id, symbol: symbol.to_string() })?;

        let mut position = self
            .store
            .open_positions(Some(user_id))
            .await?
            .into_iter()
            .find(|p| p.id == position_id)
            .ok_or(IsolationError::NotHolding { bot_id, symbol: symbol.to_string() })?;

        position.average_in(add_size, fill_price)?;
        self.store.update_position(&position).await?;
        Ok(())
    }

    /// Clear the cache entry and delete the persisted position.
    pub async fn close_position(
        &self,
        user_id: UserId,
        bot_id: BotId,
        symbol: &str,
    ) -> Result<(), IsolationError> {
        let lock = self.symbol_lock(user_id, symbol).await;
        let _guard = lock.lock().await;

        let key = (user_id, symbol.to_string());
        let holder = self.cache.write().await.remove(&key);

        match holder {
            Some(h) => {
                self.store.delete_position(h.position_id).await?;
                tracing::info!(user_id, bot_id, symbol, "position closed and cleared");
                Ok(())
            }
            None => {
                tracing::debug!(user_id, bot_id, symbol, "close for untracked position ignored");
                Ok(())
            }
        }
    }

    /// Which bot (if any) holds this symbol, per the cache.
    pub async fn holder(&self, user_id: UserId, symbol: &str) -> Option<Option<BotId>> {
        self.cache
            .read()
            .await
            .get(&(user_id, symbol.to_string()))
            .map(|h| h.bot_id)
    }

    async fn holder_position_id(
        &self,
        user_id: UserId,
        bot_id: BotId,
        symbol: &str,
    ) -> Option<i64> {
        self.cache
            .read()
            .await
            .get(&(user_id, symbol.to_string()))
            .filter(|h| h.bot_id == Some(bot_id))
            .map(|h| h.position_id)
    }

    async fn check_locked(
        &self,
        user_id: UserId,
        bot_id: BotId,
        symbol: &str,
    ) -> Result<IsolationDecision, IsolationError> {
        let key = (user_id, symbol.to_string());

        if let Some(holder) = self.cache.read().await.get(&key) {
            return Ok(match holder.bot_id {
                Some(id) if id == bot_id => IsolationDecision::Denied {
                    reason: format!("bot {bot_id} already holds a position on {symbol}"),
                },
                Some(id) if !self.allow_shared_symbol => IsolationDecision::Denied {
                    reason: format!("bot {id} already holds {symbol} for this user"),
                },
                None if !self.allow_shared_symbol => IsolationDecision::Denied {
                    reason: format!("a position outside bot control holds {symbol}"),
                },
                _ => IsolationDecision::Granted,
            });
        }

        // Cache miss: fall back to the persisted table in case the cache is
        // stale (e.g. a position registered before the last sync).
        let persisted = self
            .store
            .open_positions(Some(user_id))
            .await?
            .into_iter()
            .find(|p| p.symbol == symbol && p.size > Decimal::ZERO);

        if let Some(pos) = persisted {
            self.cache.write().await.insert(
                key,
                SymbolHolder { bot_id: pos.bot_id, position_id: pos.id },
            );
            return Ok(match pos.bot_id {
                Some(id) if id == bot_id => IsolationDecision::Denied {
                    reason: format!("bot {bot_id} already holds a position on {symbol}"),
                },
                Some(_) | None if !self.allow_shared_symbol => IsolationDecision::Denied {
                    reason: format!("a persisted position already holds {symbol}"),
                },
                _ => IsolationDecision::Granted,
            });
        }

        Ok(IsolationDecision::Granted)
    }

    async fn symbol_lock(&self, user_id: UserId, symbol: &str) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().await;
        Arc::clone(
            locks
                .entry((user_id, symbol.to_string()))
                .or_insert_with(|| Arc::new(Mutex::new(()))),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ports::mocks::MockStore;
    use rust_decimal_macros::dec;

    fn registry() -> (PositionIsolationRegistry, Arc<MockStore>) {
        let store = Arc::new(MockStore::new());
        (PositionIsolationRegistry::new(store.clone()), store)
    }

    #[tokio::test]
    async fn test_grant_then_conflict() {
        let (registry, _) = registry();

        let decision = registry
            .can_open_position(1, 10, "BTCUSDT", Side::Long)
            .await
            .unwrap();
        assert!(decision.is_granted());

        registry
            .register_position(1, 10, "BTCUSDT", Side::Long, dec!(1), dec!(100), 5)
            .await
            .unwrap();

        // The same bot cannot double-open.
        let decision = registry
            .can_open_position(1, 10, "BTCUSDT", Side::Long)
            .await
            .unwrap();
        assert!(!decision.is_granted());

        // Another bot is blocked while isolation is enforced.
        let decision = registry
            .can_open_position(1, 11, "BTCUSDT", Side::Long)
            .await
            .unwrap();
        assert!(!decision.is_granted());

        // A different symbol is unaffected.
        let decision = registry
            .can_open_position(1, 11, "ETHUSDT", Side::Long)
            .await
            .unwrap();
        assert!(decision.is_granted());
    }

    #[tokio::test]
    async fn test_shared_symbol_mode() {
        let store = Arc::new(MockStore::new());
        let registry = PositionIsolationRegistry::new(store).with_shared_symbols(true);

        registry
            .register_position(1, 10, "BTCUSDT", Side::Long, dec!(1), dec!(100), 5)
            .await
            .unwrap();

        // Another bot may share the symbol...
        let decision = registry
            .can_open_position(1, 11, "BTCUSDT", Side::Long)
            .await
            .unwrap();
        assert!(decision.is_granted());

        // ...but the holder itself still cannot double-open.
        let decision = registry
            .can_open_position(1, 10, "BTCUSDT", Side::Long)
            .await
            .unwrap();
        assert!(!decision.is_granted());
    }

    #[tokio::test]
    async fn test_close_frees_the_symbol() {
        let (registry, _) = registry();

        registry
            .register_position(1, 10, "BTCUSDT", Side::Long, dec!(1), dec!(100), 5)
            .await
            .unwrap();
        registry.close_position(1, 10, "BTCUSDT").await.unwrap();

        let decision = registry
            .can_open_position(1, 11, "BTCUSDT", Side::Long)
            .await
            .unwrap();
        assert!(decision.is_granted());
    }

    #[tokio::test]
    async fn test_sync_from_store_recovers_cache() {
        let (registry, store) = registry();

        let pos = PositionRecord::new(1, Some(10), "BTCUSDT", Side::Long, dec!(1), dec!(100), 5)
            .unwrap();
        store.insert_position(&pos).await.unwrap();

        // Fresh registry, empty cache - sync restores the holder fact.
        registry.sync_from_store(None).await.unwrap();
        assert_eq!(registry.holder(1, "BTCUSDT").await, Some(Some(10)));

        let decision = registry
            .can_open_position(1, 11, "BTCUSDT", Side::Long)
            .await
            .unwrap();
        assert!(!decision.is_granted());
    }

    #[tokio::test]
    async fn test_store_fallback_on_cache_miss() {
        let (registry, store) = registry();

        // Position exists in the store but the cache was never synced.
        let pos = PositionRecord::new(1, Some(10), "BTCUSDT", Side::Long, dec!(1), dec!(100), 5)
            .unwrap();
        store.insert_position(&pos).await.unwrap();

        let decision = registry
            .can_open_position(1, 11, "BTCUSDT", Side::Long)
            .await
            .unwrap();
        assert!(!decision.is_granted());
    }

    /// Property: two bots racing to register the same (user, symbol) - at
    /// most one succeeds when isolation is enforced.
    #[tokio::test]
    async fn test_concurrent_register_mutual_exclusion() {
        let (registry, _) = registry();
        let registry = Arc::new(registry);

        let mut handles = Vec::new();
        for bot_id in [10, 11] {
            let registry = Arc::clone(&registry);
            handles.push(tokio::spawn(async move {
                let granted = registry
                    .can_open_position(1, bot_id, "BTCUSDT", Side::Long)
                    .await
                    .unwrap()
                    .is_granted();
                if !granted {
                    return false;
                }
                registry
                    .register_position(1, bot_id, "BTCUSDT", Side::Long, dec!(1), dec!(100), 5)
                    .await
                    .is_ok()
            }));
        }

        let mut successes = 0;
        for handle in handles {
            if handle.await.unwrap() {
                successes += 1;
            }
        }
        assert_eq!(successes, 1, "exactly one bot may win the symbol");
    }

    #[tokio::test]
    async fn test_update_position_averages_in() {
        let (registry, store) = registry();

        registry
            .register_position(1, 10, "BTCUSDT", Side::Long, dec!(1), dec!(100), 5)
            .await
            .unwrap();
        registry
            .update_position(1, 10, "BTCUSDT", dec!(1), dec!(110))
            .await
            .unwrap();

        let positions = store.open_positions(Some(1)).await.unwrap();
        assert_eq!(positions.len(), 1);
        assert_eq!(positions[0].size, dec!(2));
        assert_eq!(positions[0].entry_price, dec!(105));
    }
}
