//! Error classification and bounded recovery
//!
//! Caught errors are classified by message text into a fixed taxonomy, each
//! kind carrying its own recoverability, retry budget and backoff base. The
//! scheduler keeps per-bot occurrence counters inside a rolling reset window
//! and at most one pending recovery task per bot.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use crate::domain::bot::BotId;

/// Backoff ceiling.
pub const MAX_RETRY_DELAY: Duration = Duration::from_secs(1800);

/// Counters reset automatically once the last error is older than this.
pub const COUNTER_RESET_WINDOW: Duration = Duration::from_secs(3600);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

/// Fixed error taxonomy, pattern-matched from error message text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    ApiKeyInvalid,
    ApiKeyExpired,
    InsufficientBalance,
    RateLimit,
    NetworkError,
    ExchangeError,
    StrategyError,
    PositionError,
    Unknown,
}

/// Per-kind recovery policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ErrorPolicy {
    pub severity: Severity,
    pub recoverable: bool,
    pub max_retries: u32,
    pub base_delay: Duration,
}

impl ErrorKind {
    pub fn policy(&self) -> ErrorPolicy {
        match self {
            ErrorKind::ApiKeyInvalid | ErrorKind::ApiKeyExpired => ErrorPolicy {
                severity: Severity::Critical,
                recoverable: false,
                max_retries: 0,
                base_delay: Duration::ZERO,
            },
            ErrorKind::InsufficientBalance => ErrorPolicy {
                severity: Severity::Medium,
                recoverable: true,
                max_retries: 3,
                base_delay: Duration::from_secs(300),
            },
            ErrorKind::RateLimit => ErrorPolicy {
                severity: Severity::Low,
                recoverable: true,
                max_retries: 10,
                base_delay: Duration::from_secs(60),
            },
            ErrorKind::NetworkError => ErrorPolicy {
                severity: Severity::Medium,
                recoverable: true,
                max_retries: 5,
                base_delay: Duration::from_secs(30),
            },
            ErrorKind::ExchangeError => ErrorPolicy {
                severity: Severity::Medium,
                recoverable: true,
                max_retries: 3,
                base_delay: Duration::from_secs(60),
            },
            ErrorKind::StrategyError => ErrorPolicy {
                severity: Severity::High,
                recoverable: false,
                max_retries: 0,
                base_delay: Duration::ZERO,
            },
            ErrorKind::PositionError => ErrorPolicy {
                severity: Severity::High,
                recoverable: true,
                max_retries: 2,
                base_delay: Duration::from_secs(10),
            },
            ErrorKind::Unknown => ErrorPolicy {
                severity: Severity::Medium,
                recoverable: true,
                max_retries: 3,
                base_delay: Duration::from_secs(60),
            },
        }
    }
}

/// Classify an error message into the taxonomy. Pure: the same input always
/// yields the same kind.
pub fn classify_error(message: &str) -> ErrorKind {
    let msg = message.to_lowercase();

    let key_related = msg.contains("api key")
        || msg.contains("apikey")
        || msg.contains("invalid key")
        || msg.contains("signature")
        || msg.contains("passphrase")
        || msg.contains("unauthorized")
        || msg.contains("authentication");
    if key_related {
        if msg.contains("expire") {
            return ErrorKind::ApiKeyExpired;
        }
        return ErrorKind::ApiKeyInvalid;
    }

    if msg.contains("rate limit")
        || msg.contains("too many requests")
        || msg.contains("429")
    {
        return ErrorKind::RateLimit;
    }

    if msg.contains("insufficient")
        || msg.contains("not enough balance")
        || msg.contains("margin is insufficient")
        || msg.contains("exceeds available")
    {
        return ErrorKind::InsufficientBalance;
    }

    if msg.contains("timeout")
        || msg.contains("timed out")
        || msg.contains("connection")
        || msg.contains("network")
        || msg.contains("dns")
        || msg.contains("reset by peer")
    {
        return ErrorKind::NetworkError;
    }

    if msg.contains("exchange")
        || msg.contains("server error")
        || msg.contains("maintenance")
        || msg.contains("502")
        || msg.contains("503")
    {
        return ErrorKind::ExchangeError;
    }

    if msg.contains("strategy") {
        return ErrorKind::StrategyError;
    }

    if msg.contains("position") {
        return ErrorKind::PositionError;
    }

    ErrorKind::Unknown
}

/// Exponential backoff for the nth occurrence: `base × 2^(n−1)`, capped.
/// Non-decreasing in `occurrence` by construction.
pub fn retry_delay(kind: ErrorKind, occurrence: u32) -> Duration {
    let base = kind.policy().base_delay;
    if base.is_zero() {
        return Duration::ZERO;
    }
    let exponent = occurrence.saturating_sub(1).min(31);
    let delay = base.saturating_mul(1u32 << exponent);
    delay.min(MAX_RETRY_DELAY)
}

/// What the loop should do after an error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecoveryDirective {
    /// Recoverable: retry after the backoff delay.
    Retry {
        kind: ErrorKind,
        attempt: u32,
        delay: Duration,
    },
    /// Non-recoverable or retries exhausted: stop the bot.
    Stop { kind: ErrorKind, reason: String },
}

#[derive(Debug, Default)]
struct BotErrorState {
    counts: HashMap<ErrorKind, u32>,
    last_error_at: Option<Instant>,
    pending: Option<JoinHandle<()>>,
}

/// Per-bot error bookkeeping and delayed-restart scheduling. This is the
/// single authoritative retry owner; status reporting elsewhere never
/// restarts on its own.
#[derive(Default)]
pub struct RecoveryScheduler {
    bots: Mutex<HashMap<BotId, BotErrorState>>,
}

impl RecoveryScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an error for a bot and decide retry vs stop.
    pub async fn on_error(&self, bot_id: BotId, message: &str) -> RecoveryDirective {
        let kind = classify_error(message);
        let policy = kind.policy();

        let mut bots = self.bots.lock().await;
        let state = bots.entry(bot_id).or_default();

        // Stale counters from a previous incident reset automatically.
        if let Some(last) = state.last_error_at {
            if last.elapsed() > COUNTER_RESET_WINDOW {
                state.counts.clear();
            }
        }
        state.last_error_at = Some(Instant::now());

        if !policy.recoverable {
            tracing::error!(bot_id, ?kind, message, "non-recoverable error, stopping bot");
            return RecoveryDirective::Stop {
                kind,
                reason: format!("{kind:?}: {message}"),
            };
        }

        let count = state.counts.entry(kind).or_insert(0);
        *count += 1;

        if *count > policy.max_retries {
            tracing::error!(
                bot_id,
                ?kind,
                attempts = *count - 1,
                "retries exhausted, stopping bot"
            );
            return RecoveryDirective::Stop {
                kind,
                reason: format!("{kind:?}: retries exhausted after {} attempts", *count - 1),
            };
        }

        let delay = retry_delay(kind, *count);
        tracing::warn!(bot_id, ?kind, attempt = *count, ?delay, message, "scheduling retry");
        RecoveryDirective::Retry { kind, attempt: *count, delay }
    }

    /// Reset a bot's counters after a successful operation.
    pub async fn record_success(&self, bot_id: BotId) {
        let mut bots = self.bots.lock().await;
        if let Some(state) = bots.get_mut(&bot_id) {
            if !state.counts.is_empty() {
                tracing::info!(bot_id, "error counters reset after successful recovery");
            }
            state.counts.clear();
            state.last_error_at = None;
        }
    }

    /// Occurrence count for one kind (monitoring/tests).
    pub async fn error_count(&self, bot_id: BotId, kind: ErrorKind) -> u32 {
        let bots = self.bots.lock().await;
        bots.get(&bot_id)
            .and_then(|s| s.counts.get(&kind))
            .copied()
            .unwrap_or(0)
    }

    /// Schedule a delayed recovery callback, replacing any pending one for
    /// the same bot (at most one pending recovery per bot). A small random
    /// jitter (up to 10% of the delay) spreads simultaneous recoveries.
    pub async fn schedule_recovery<F, Fut>(&self, bot_id: BotId, delay: Duration, callback: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: std::future::Future<Output = ()> + Send + 'static,
    {
        let jitter_ms = if delay.is_zero() {
            0
        } else {
            let cap = (delay.as_millis() / 10).max(1) as u64;
            rand::thread_rng().gen_range(0..cap)
        };
        let total = delay + Duration::from_millis(jitter_ms);

        let handle = tokio::spawn(async move {
            tokio::time::sleep(total).await;
            callback().await;
        });

        let mut bots = self.bots.lock().await;
        let state = bots.entry(bot_id).or_default();
        if let Some(previous) = state.pending.replace(handle) {
            previous.abort();
            tracing::debug!(bot_id, "previous pending recovery canceled");
        }
    }

    /// Cancel a pending recovery, if any (user stop wins over retry).
    pub async fn cancel_pending(&self, bot_id: BotId) {
        let mut bots = self.bots.lock().await;
        if let Some(state) = bots.get_mut(&bot_id) {
            if let Some(handle) = state.pending.take() {
                handle.abort();
                tracing::debug!(bot_id, "pending recovery canceled");
            }
        }
    }

    pub async fn has_pending(&self, bot_id: BotId) -> bool {
        let bots = self.bots.lock().await;
        bots.get(&bot_id)
            .and_then(|s| s.pending.as_ref())
            .map(|h| !h.is_finished())
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_classification_fixed_messages() {
        assert_eq!(classify_error("Rate limit exceeded (429)"), ErrorKind::RateLimit);
        assert_eq!(classify_error("insufficient margin"), ErrorKind::InsufficientBalance);
        assert_eq!(classify_error("something inexplicable happened"), ErrorKind::Unknown);
        assert_eq!(classify_error("API key invalid"), ErrorKind::ApiKeyInvalid);
        assert_eq!(classify_error("Your API key has expired"), ErrorKind::ApiKeyExpired);
        assert_eq!(classify_error("connection reset by peer"), ErrorKind::NetworkError);
        assert_eq!(classify_error("Exchange under maintenance"), ErrorKind::ExchangeError);
        assert_eq!(classify_error("strategy evaluation failed"), ErrorKind::StrategyError);
        assert_eq!(classify_error("position size mismatch"), ErrorKind::PositionError);
    }

    #[test]
    fn test_classification_is_deterministic() {
        for _ in 0..10 {
            assert_eq!(classify_error("Rate limit exceeded (429)"), ErrorKind::RateLimit);
        }
    }

    #[test]
    fn test_classification_case_insensitive() {
        assert_eq!(classify_error("RATE LIMIT EXCEEDED"), ErrorKind::RateLimit);
        assert_eq!(classify_error("Insufficient Margin"), ErrorKind::InsufficientBalance);
    }

    #[test]
    fn test_retry_delay_monotone_and_capped() {
        let mut previous = Duration::ZERO;
        for occurrence in 1..=20 {
            let delay = retry_delay(ErrorKind::NetworkError, occurrence);
            assert!(delay >= previous, "delay must be non-decreasing");
            assert!(delay <= MAX_RETRY_DELAY);
            previous = delay;
        }
        assert_eq!(retry_delay(ErrorKind::NetworkError, 1), Duration::from_secs(30));
        assert_eq!(retry_delay(ErrorKind::NetworkError, 2), Duration::from_secs(60));
        assert_eq!(retry_delay(ErrorKind::NetworkError, 20), MAX_RETRY_DELAY);
    }

    #[test]
    fn test_policy_table() {
        assert!(!ErrorKind::ApiKeyInvalid.policy().recoverable);
        assert!(!ErrorKind::StrategyError.policy().recoverable);
        assert_eq!(ErrorKind::RateLimit.policy().max_retries, 10);
        assert_eq!(ErrorKind::InsufficientBalance.policy().base_delay, Duration::from_secs(300));
        assert_eq!(ErrorKind::PositionError.policy().max_retries, 2);
        assert_eq!(ErrorKind::ApiKeyInvalid.policy().severity, Severity::Critical);
    }

    #[tokio::test]
    async fn test_non_recoverable_stops_immediately() {
        let scheduler = RecoveryScheduler::new();
        let directive = scheduler.on_error(1, "API key invalid").await;
        assert!(matches!(directive, RecoveryDirective::Stop { kind: ErrorKind::ApiKeyInvalid, .. }));
    }

    #[tokio::test]
    async fn test_retries_then_exhaustion() {
        let scheduler = RecoveryScheduler::new();

        // position_error allows 2 retries.
        for attempt in 1..=2 {
            let directive = scheduler.on_error(1, "position size mismatch").await;
            match directive {
                RecoveryDirective::Retry { attempt: a, .. } => assert_eq!(a, attempt),
                other => panic!("expected retry, got {other:?}"),
            }
        }

        let directive = scheduler.on_error(1, "position size mismatch").await;
        assert!(matches!(directive, RecoveryDirective::Stop { .. }));
    }

    #[tokio::test]
    async fn test_success_resets_counters() {
        let scheduler = RecoveryScheduler::new();

        scheduler.on_error(1, "position size mismatch").await;
        scheduler.on_error(1, "position size mismatch").await;
        assert_eq!(scheduler.error_count(1, ErrorKind::PositionError).await, 2);

        scheduler.record_success(1).await;
        assert_eq!(scheduler.error_count(1, ErrorKind::PositionError).await, 0);

        // Full retry budget is available again.
        let directive = scheduler.on_error(1, "position size mismatch").await;
        assert!(matches!(directive, RecoveryDirective::Retry { attempt: 1, .. }));
    }

    #[tokio::test]
    async fn test_counters_are_per_bot() {
        let scheduler = RecoveryScheduler::new();
        scheduler.on_error(1, "connection refused").await;
        scheduler.on_error(2, "connection refused").await;

        assert_eq!(scheduler.error_count(1, ErrorKind::NetworkError).await, 1);
        assert_eq!(scheduler.error_count(2, ErrorKind::NetworkError).await, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_schedule_recovery_runs_callback() {
        let scheduler = RecoveryScheduler::new();
        let fired = Arc::new(AtomicU32::new(0));

        let f = Arc::clone(&fired);
        scheduler
            .schedule_recovery(1, Duration::from_secs(5), move || async move {
                f.fetch_add(1, Ordering::SeqCst);
            })
            .await;

        assert!(scheduler.has_pending(1).await);
        tokio::time::sleep(Duration::from_secs(7)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reschedule_replaces_pending() {
        let scheduler = RecoveryScheduler::new();
        let fired = Arc::new(AtomicU32::new(0));

        let f1 = Arc::clone(&fired);
        scheduler
            .schedule_recovery(1, Duration::from_secs(5), move || async move {
                f1.fetch_add(1, Ordering::SeqCst);
            })
            .await;

        let f2 = Arc::clone(&fired);
        scheduler
            .schedule_recovery(1, Duration::from_secs(5), move || async move {
                f2.fetch_add(10, Ordering::SeqCst);
            })
            .await;

        tokio::time::sleep(Duration::from_secs(10)).await;
        // Only the replacement fired.
        assert_eq!(fired.load(Ordering::SeqCst), 10);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_pending() {
        let scheduler = RecoveryScheduler::new();
        let fired = Arc::new(AtomicU32::new(0));

        let f = Arc::clone(&fired);
        scheduler
            .schedule_recovery(1, Duration::from_secs(5), move || async move {
                f.fetch_add(1, Ordering::SeqCst);
            })
            .await;
        scheduler.cancel_pending(1).await;

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }
}
