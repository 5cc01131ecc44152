//! Webhook notifier
//!
//! Best-effort JSON POSTs to a configured webhook URL. Failures are logged
//! and swallowed - a dead webhook must never touch a trading loop.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use rust_decimal::Decimal;
use serde_json::json;

use crate::domain::bot::{BotId, UserId};
use crate::domain::position::Side;
use crate::domain::trade::ExitReason;
use crate::ports::notify::NotifierPort;

#[derive(Debug, Clone)]
pub struct WebhookConfig {
    pub url: String,
    pub timeout: Duration,
}

impl WebhookConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into(), timeout: Duration::from_secs(5) }
    }
}

pub struct WebhookNotifier {
    config: WebhookConfig,
    http: Client,
}

impl WebhookNotifier {
    pub fn new(config: WebhookConfig) -> Self {
        let http = Client::builder()
            .timeout(config.timeout)
            .build()
            .unwrap_or_default();
        Self { config, http }
    }

    async fn post(&self, payload: serde_json::Value) {
        let result = self.http.post(&self.config.url).json(&payload).send().await;
        match result {
            Ok(response) if !response.status().is_success() => {
                tracing::warn!(status = %response.status(), "webhook rejected notification");
            }
            Ok(_) => {}
            Err(e) => {
                tracing::warn!(error = %e, "webhook notification failed");
            }
        }
    }
}

#[async_trait]
impl NotifierPort for WebhookNotifier {
    async fn notify_bot_started(&self, user_id: UserId, bot_id: BotId, name: &str) {
        self.post(json!({
            "event": "bot_started",
            "user_id": user_id,
            "bot_id": bot_id,
            "name": name,
        }))
        .await;
    }

    async fn notify_bot_stopped(&self, user_id: UserId, bot_id: BotId, name: &str, reason: &str) {
        self.post(json!({
            "event": "bot_stopped",
            "user_id": user_id,
            "bot_id": bot_id,
            "name": name,
            "reason": reason,
        }))
        .await;
    }

    async fn notify_trade_opened(
        &self,
        user_id: UserId,
        bot_id: BotId,
        symbol: &str,
        side: Side,
        qty: Decimal,
        entry_price: Decimal,
    ) {
        self.post(json!({
            "event": "trade_opened",
            "user_id": user_id,
            "bot_id": bot_id,
            "symbol": symbol,
            "side": side.to_string(),
            "qty": qty.to_string(),
            "entry_price": entry_price.to_string(),
        }))
        .await;
    }

    async fn notify_trade_closed(
        &self,
        user_id: UserId,
        bot_id: BotId,
        symbol: &str,
        pnl: Decimal,
        reason: ExitReason,
    ) {
        self.post(json!({
            "event": "trade_closed",
            "user_id": user_id,
            "bot_id": bot_id,
            "symbol": symbol,
            "pnl": pnl.to_string(),
            "reason": reason.to_string(),
        }))
        .await;
    }

    async fn notify_risk_alert(&self, user_id: UserId, message: &str) {
        self.post(json!({
            "event": "risk_alert",
            "user_id": user_id,
            "message": message,
        }))
        .await;
    }
}
