//! In-memory store with JSON snapshot persistence
//!
//! Keeps all records in memory for fast reads and mirrors every mutation to
//! a JSON snapshot on disk, so bots, open positions and grid ladders
//! survive a process restart. The relational backend sits behind the same
//! port in the hosted deployment; this adapter covers the standalone
//! binary and tests.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicI64, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::domain::bot::{BotId, BotInstance, UserId};
use crate::domain::grid::GridRung;
use crate::domain::position::PositionRecord;
use crate::domain::risk::RiskSettings;
use crate::domain::trade::{Trade, TradeExit};
use crate::ports::store::{StoreError, StorePort};

#[derive(Debug, Default, Serialize, Deserialize)]
struct Snapshot {
    bots: Vec<BotInstance>,
    trades: Vec<Trade>,
    positions: Vec<PositionRecord>,
    rungs: HashMap<BotId, Vec<GridRung>>,
    risk: HashMap<UserId, RiskSettings>,
    next_id: i64,
}

#[derive(Default)]
struct Inner {
    bots: HashMap<BotId, BotInstance>,
    trades: HashMap<i64, Trade>,
    positions: HashMap<i64, PositionRecord>,
    rungs: HashMap<BotId, Vec<GridRung>>,
    risk: HashMap<UserId, RiskSettings>,
}

pub struct MemoryStore {
    state: Mutex<Inner>,
    next_id: AtomicI64,
    snapshot_path: Option<PathBuf>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(Inner::default()),
            next_id: AtomicI64::new(1),
            snapshot_path: None,
        }
    }

    /// Load from an existing snapshot, or start empty when none exists.
    /// Every later mutation rewrites the snapshot.
    pub fn with_snapshot(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let path = path.into();
        let store = match Self::read_snapshot(&path)? {
            Some(snapshot) => {
                tracing::info!(
                    path = %path.display(),
                    bots = snapshot.bots.len(),
                    positions = snapshot.positions.len(),
                    "store snapshot loaded"
                );
                let inner = Inner {
                    bots: snapshot.bots.into_iter().map(|b| (b.id, b)).collect(),
                    trades: snapshot.trades.into_iter().map(|t| (t.id, t)).collect(),
                    positions: snapshot.positions.into_iter().map(|p| (p.id, p)).collect(),
                    rungs: snapshot.rungs,
                    risk: snapshot.risk,
                };
                Self {
                    state: Mutex::new(inner),
                    next_id: AtomicI64::new(snapshot.next_id.max(1)),
                    snapshot_path: Some(path),
                }
            }
            None => Self {
                state: Mutex::new(Inner::default()),
                next_id: AtomicI64::new(1),
                snapshot_path: Some(path),
            },
        };
        Ok(store)
    }

    fn read_snapshot(path: &Path) -> Result<Option<Snapshot>, StoreError> {
        if !path.exists() {
            return Ok(None);
        }
        let content =
            std::fs::read_to_string(path).map_err(|e| StoreError::Io(e.to_string()))?;
        let snapshot =
            serde_json::from_str(&content).map_err(|e| StoreError::Serialization(e.to_string()))?;
        Ok(Some(snapshot))
    }

    async fn persist(&self, inner: &Inner) -> Result<(), StoreError> {
        let Some(ref path) = self.snapshot_path else {
            return Ok(());
        };
        let snapshot = Snapshot {
            bots: inner.bots.values().cloned().collect(),
            trades: inner.trades.values().cloned().collect(),
            positions: inner.positions.values().cloned().collect(),
            rungs: inner.rungs.clone(),
            risk: inner.risk.clone(),
            next_id: self.next_id.load(Ordering::SeqCst),
        };
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| StoreError::Io(e.to_string()))?;
        }
        let content = serde_json::to_string_pretty(&snapshot)
            .map_err(|e| StoreError::Serialization(e.to_string()))?;
        std::fs::write(path, content).map_err(|e| StoreError::Io(e.to_string()))?;
        Ok(())
    }

    pub async fn seed_risk_settings(&self, user_id: UserId, settings: RiskSettings) {
        let mut state = self.state.lock().await;
        state.risk.insert(user_id, settings);
        let _ = self.persist(&state).await;
    }

    fn assign_id(&self) -> i64 {
        self.next_id.fetch_add(1, Ordering::SeqCst)
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl StorePort for MemoryStore {
    async fn bot(&self, bot_id: BotId) -> Result<Option<BotInstance>, StoreError> {
        Ok(self.state.lock().await.bots.get(&bot_id).cloned())
    }

    async fn save_bot(&self, bot: &BotInstance) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        state.bots.insert(bot.id, bot.clone());
        self.persist(&state).await
    }

    async fn bots_for_user(&self, user_id: UserId) -> Result<Vec<BotInstance>, StoreError> {
        Ok(self
            .state
            .lock()
            .await
            .bots
            .values()
            .filter(|b| b.user_id == user_id)
            .cloned()
            .collect())
    }

    async fn all_bots(&self) -> Result<Vec<BotInstance>, StoreError> {
        Ok(self.state.lock().await.bots.values().cloned().collect())
    }

    async fn insert_trade(&self, trade: &Trade) -> Result<i64, StoreError> {
        let id = self.assign_id();
        let mut stored = trade.clone();
        stored.id = id;
        let mut state = self.state.lock().await;
        state.trades.insert(id, stored);
        self.persist(&state).await?;
        Ok(id)
    }

    async fn complete_trade(&self, trade_id: i64, exit: &TradeExit) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        let trade = state
            .trades
            .get_mut(&trade_id)
            .ok_or_else(|| StoreError::NotFound(format!("trade {trade_id}")))?;
        if !trade.apply_exit(exit.clone()) {
            tracing::warn!(trade_id, "duplicate trade completion ignored");
        }
        self.persist(&state).await
    }

    async fn trades_since(
        &self,
        user_id: UserId,
        since: DateTime<Utc>,
    ) -> Result<Vec<Trade>, StoreError> {
        Ok(self
            .state
            .lock()
            .await
            .trades
            .values()
            .filter(|t| t.user_id == user_id && t.opened_at >= since)
            .cloned()
            .collect())
    }

    async fn insert_position(&self, position: &PositionRecord) -> Result<i64, StoreError> {
        let id = self.assign_id();
        let mut stored = position.clone();
        stored.id = id;
        let mut state = self.state.lock().await;
        state.positions.insert(id, stored);
        self.persist(&state).await?;
        Ok(id)
    }

    async fn update_position(&self, position: &PositionRecord) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        if !state.positions.contains_key(&position.id) {
            return Err(StoreError::NotFound(format!("position {}", position.id)));
        }
        state.positions.insert(position.id, position.clone());
        self.persist(&state).await
    }

    async fn delete_position(&self, position_id: i64) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        state.positions.remove(&position_id);
        self.persist(&state).await
    }

    async fn open_positions(
        &self,
        user_id: Option<UserId>,
    ) -> Result<Vec<PositionRecord>, StoreError> {
        Ok(self
            .state
            .lock()
            .await
            .positions
            .values()
            .filter(|p| user_id.map_or(true, |u| p.user_id == u))
            .cloned()
            .collect())
    }

    async fn grid_rungs(&self, bot_id: BotId) -> Result<Vec<GridRung>, StoreError> {
        Ok(self
            .state
            .lock()
            .await
            .rungs
            .get(&bot_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn save_grid_rungs(&self, bot_id: BotId, rungs: &[GridRung]) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        state.rungs.insert(bot_id, rungs.to_vec());
        self.persist(&state).await
    }

    async fn risk_settings(&self, user_id: UserId) -> Result<RiskSettings, StoreError> {
        Ok(self
            .state
            .lock()
            .await
            .risk
            .get(&user_id)
            .cloned()
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::bot::BotType;
    use crate::domain::grid::GridRung;
    use crate::domain::position::Side;
    use rust_decimal_macros::dec;

    #[tokio::test]
    async fn test_snapshot_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");

        {
            let store = MemoryStore::with_snapshot(&path).unwrap();
            let bot = BotInstance::new(1, 100, "grid", BotType::Grid, "BTCUSDT", 5, dec!(50));
            store.save_bot(&bot).await.unwrap();

            let rungs = vec![GridRung::new(0, dec!(100)), GridRung::new(1, dec!(125))];
            store.save_grid_rungs(1, &rungs).await.unwrap();

            let position =
                PositionRecord::new(100, Some(1), "BTCUSDT", Side::Long, dec!(1), dec!(110), 3)
                    .unwrap();
            store.insert_position(&position).await.unwrap();
        }

        // A fresh store sees everything the old process persisted.
        let store = MemoryStore::with_snapshot(&path).unwrap();
        assert!(store.bot(1).await.unwrap().is_some());
        assert_eq!(store.grid_rungs(1).await.unwrap().len(), 2);
        assert_eq!(store.open_positions(Some(100)).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_ids_monotonic_across_restart() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");

        let first_id = {
            let store = MemoryStore::with_snapshot(&path).unwrap();
            let trade =
                Trade::open(100, None, "BTCUSDT", Side::Long, dec!(1), dec!(100), 1, None);
            store.insert_trade(&trade).await.unwrap()
        };

        let store = MemoryStore::with_snapshot(&path).unwrap();
        let trade = Trade::open(100, None, "BTCUSDT", Side::Long, dec!(1), dec!(100), 1, None);
        let second_id = store.insert_trade(&trade).await.unwrap();
        assert!(second_id > first_id);
    }

    #[tokio::test]
    async fn test_no_snapshot_path_is_memory_only() {
        let store = MemoryStore::new();
        let bot = BotInstance::new(1, 100, "t", BotType::Trend, "ETHUSDT", 5, dec!(50));
        store.save_bot(&bot).await.unwrap();
        assert!(store.bot(1).await.unwrap().is_some());
    }
}
