//! Allocation ledger
//!
//! Tracks how much of a user's exchange balance is reserved by each bot
//! instance and prevents concurrent orders from jointly over-committing the
//! account. All mutations for one user are serialized by a per-user async
//! mutex; the live balance read is cached with a short TTL to bound API
//! call rate.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use rust_decimal::Decimal;
use thiserror::Error;
use tokio::sync::{Mutex, RwLock};

use crate::domain::bot::{BotId, UserId};
use crate::ports::exchange::{ExchangeError, ExchangePort};

/// How long a fetched balance stays fresh.
pub const DEFAULT_BALANCE_TTL: Duration = Duration::from_secs(10);

const HUNDRED: Decimal = Decimal::from_parts(100, 0, 0, false, 0);

#[derive(Debug, Error)]
pub enum AllocationError {
    #[error("Balance unavailable: {0}")]
    Balance(#[from] ExchangeError),

    #[error("Bot {0} is not registered with the allocation ledger")]
    UnknownBot(BotId),
}

/// Outcome of a reservation request. Rejection is an expected steady-state
/// outcome (insufficient allocated funds), not a fault.
#[derive(Debug, Clone, PartialEq)]
pub enum ReserveDecision {
    Approved {
        /// Allocated balance left for this bot after the reservation.
        available_after: Decimal,
    },
    Rejected {
        reason: String,
    },
}

impl ReserveDecision {
    pub fn is_approved(&self) -> bool {
        matches!(self, ReserveDecision::Approved { .. })
    }

    pub fn reason(&self) -> Option<&str> {
        match self {
            ReserveDecision::Approved { .. } => None,
            ReserveDecision::Rejected { reason } => Some(reason),
        }
    }
}

/// Outcome of an allocation-percent configuration check.
#[derive(Debug, Clone, PartialEq)]
pub enum AllocationCheck {
    Valid { total_percent: Decimal },
    Exceeded { total_percent: Decimal },
}

impl AllocationCheck {
    pub fn is_valid(&self) -> bool {
        matches!(self, AllocationCheck::Valid { .. })
    }
}

#[derive(Debug, Clone)]
struct BotAllocation {
    allocation_percent: Decimal,
    used: Decimal,
}

#[derive(Debug, Default)]
struct UserLedger {
    bots: HashMap<BotId, BotAllocation>,
    cached_balance: Option<(Decimal, Instant)>,
}

impl UserLedger {
    fn available_for(&self, bot_id: BotId, total_balance: Decimal) -> Option<Decimal> {
        self.bots.get(&bot_id).map(|bot| {
            let allocated = total_balance * bot.allocation_percent / HUNDRED;
            (allocated - bot.used).max(Decimal::ZERO)
        })
    }
}

pub struct AllocationLedger {
    exchange: Arc<dyn ExchangePort>,
    balance_ttl: Duration,
    users: RwLock<HashMap<UserId, Arc<Mutex<UserLedger>>>>,
    /// Bot to owner index so release/unregister can find the right ledger.
    bot_owner: RwLock<HashMap<BotId, UserId>>,
}

impl AllocationLedger {
    pub fn new(exchange: Arc<dyn ExchangePort>) -> Self {
        Self {
            exchange,
            balance_ttl: DEFAULT_BALANCE_TTL,
            users: RwLock::new(HashMap::new()),
            bot_owner: RwLock::new(HashMap::new()),
        }
    }

    pub fn with_balance_ttl(mut self, ttl: Duration) -> Self {
        self.balance_ttl = ttl;
        self
    }

    /// Register a bot's allocation before its loop starts.
    pub async fn register_bot(&self, user_id: UserId, bot_id: BotId, allocation_percent: Decimal) {
        let ledger = self.user_ledger(user_id).await;
        let mut guard = ledger.lock().await;
        guard.bots.insert(
            bot_id,
            BotAllocation { allocation_percent, used: Decimal::ZERO },
        );
        self.bot_owner.write().await.insert(bot_id, user_id);
        tracing::debug!(user_id, bot_id, %allocation_percent, "bot registered with allocation ledger");
    }

    /// Remove a bot and zero its reservations (bot stop/crash cleanup).
    pub async fn unregister_bot(&self, bot_id: BotId) {
        let Some(user_id) = self.bot_owner.write().await.remove(&bot_id) else {
            return;
        };
        let ledger = self.user_ledger(user_id).await;
        let mut guard = ledger.lock().await;
        if let Some(bot) = guard.bots.remove(&bot_id) {
            if bot.used > Decimal::ZERO {
                tracing::debug!(bot_id, released = %bot.used, "released outstanding reservation on unregister");
            }
        }
    }

    /// Live total balance, cached for `balance_ttl`. On a fetch failure the
    /// last cached value is returned if one exists.
    pub async fn total_balance(&self, user_id: UserId) -> Result<Decimal, AllocationError> {
        let ledger = self.user_ledger(user_id).await;
        let mut guard = ledger.lock().await;
        self.balance_locked(&mut guard).await
    }

    /// `total × allocation_percent / 100` for one bot.
    pub async fn allocated_balance(
        &self,
        user_id: UserId,
        bot_id: BotId,
    ) -> Result<Decimal, AllocationError> {
        let ledger = self.user_ledger(user_id).await;
        let mut guard = ledger.lock().await;
        let total = self.balance_locked(&mut guard).await?;
        let bot = guard.bots.get(&bot_id).ok_or(AllocationError::UnknownBot(bot_id))?;
        Ok(total * bot.allocation_percent / HUNDRED)
    }

    /// Allocated minus used, floored at zero.
    pub async fn available_balance(
        &self,
        user_id: UserId,
        bot_id: BotId,
    ) -> Result<Decimal, AllocationError> {
        let ledger = self.user_ledger(user_id).await;
        let mut guard = ledger.lock().await;
        let total = self.balance_locked(&mut guard).await?;
        guard
            .available_for(bot_id, total)
            .ok_or(AllocationError::UnknownBot(bot_id))
    }

    /// The only path by which used-amount increases. Recomputes available
    /// balance under the per-user lock, so the sum of approved reservations
    /// can never exceed what is allocated.
    pub async fn request_order_amount(
        &self,
        user_id: UserId,
        bot_id: BotId,
        amount: Decimal,
    ) -> Result<ReserveDecision, AllocationError> {
        if amount <= Decimal::ZERO {
            return Ok(ReserveDecision::Rejected {
                reason: format!("requested amount {amount} must be positive"),
            });
        }

        let ledger = self.user_ledger(user_id).await;
        let mut guard = ledger.lock().await;
        let total = self.balance_locked(&mut guard).await?;

        let available = guard
            .available_for(bot_id, total)
            .ok_or(AllocationError::UnknownBot(bot_id))?;

        if amount > available {
            return Ok(ReserveDecision::Rejected {
                reason: format!(
                    "insufficient allocated funds: requested {amount}, available {available}"
                ),
            });
        }

        let bot = guard
            .bots
            .get_mut(&bot_id)
            .ok_or(AllocationError::UnknownBot(bot_id))?;
        bot.used += amount;
        let available_after = available - amount;

        tracing::debug!(user_id, bot_id, %amount, %available_after, "order amount reserved");
        Ok(ReserveDecision::Approved { available_after })
    }

    /// Release a reservation (order canceled/failed or position closed).
    /// Floored at zero; releasing more than reserved is clamped.
    pub async fn release_order_amount(&self, bot_id: BotId, amount: Decimal) {
        if amount <= Decimal::ZERO {
            return;
        }
        let Some(user_id) = self.bot_owner.read().await.get(&bot_id).copied() else {
            tracing::debug!(bot_id, "release for unregistered bot ignored");
            return;
        };
        let ledger = self.user_ledger(user_id).await;
        let mut guard = ledger.lock().await;
        if let Some(bot) = guard.bots.get_mut(&bot_id) {
            bot.used = (bot.used - amount).max(Decimal::ZERO);
            tracing::debug!(bot_id, released = %amount, used = %bot.used, "order amount released");
        }
    }

    /// Currently reserved amount for one bot.
    pub async fn used_amount(&self, user_id: UserId, bot_id: BotId) -> Decimal {
        let ledger = self.user_ledger(user_id).await;
        let guard = ledger.lock().await;
        guard
            .bots
            .get(&bot_id)
            .map(|b| b.used)
            .unwrap_or(Decimal::ZERO)
    }

    /// Check that active allocation percentages for a user, with `new_percent`
    /// replacing `exclude_bot`'s (or added), stay within 100%.
    pub async fn validate_allocation(
        &self,
        user_id: UserId,
        new_percent: Decimal,
        exclude_bot: Option<BotId>,
    ) -> AllocationCheck {
        let ledger = self.user_ledger(user_id).await;
        let guard = ledger.lock().await;

        let existing: Decimal = guard
            .bots
            .iter()
            .filter(|(id, _)| Some(**id) != exclude_bot)
            .map(|(_, b)| b.allocation_percent)
            .sum();

        let total_percent = existing + new_percent;
        if total_percent > HUNDRED {
            AllocationCheck::Exceeded { total_percent }
        } else {
            AllocationCheck::Valid { total_percent }
        }
    }

    async fn user_ledger(&self, user_id: UserId) -> Arc<Mutex<UserLedger>> {
        if let Some(ledger) = self.users.read().await.get(&user_id) {
            return Arc::clone(ledger);
        }
        let mut users = self.users.write().await;
        Arc::clone(users.entry(user_id).or_default())
    }

    async fn balance_locked(&self, ledger: &mut UserLedger) -> Result<Decimal, AllocationError> {
        if let Some((balance, at)) = ledger.cached_balance {
            if at.elapsed() < self.balance_ttl {
                return Ok(balance);
            }
        }

        match self.exchange.futures_balance().await {
            Ok(balance) => {
                ledger.cached_balance = Some((balance, Instant::now()));
                Ok(balance)
            }
            Err(e) => {
                if let Some((stale, _)) = ledger.cached_balance {
                    tracing::warn!(error = %e, %stale, "balance fetch failed, using last known value");
                    Ok(stale)
                } else {
                    Err(AllocationError::Balance(e))
                }
            }
        }
    }
}
