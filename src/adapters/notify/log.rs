//! Logging notifier - the default when no webhook is configured.

use async_trait::async_trait;
use rust_decimal::Decimal;

use crate::domain::bot::{BotId, UserId};
use crate::domain::position::Side;
use crate::domain::trade::ExitReason;
use crate::ports::notify::NotifierPort;

#[derive(Debug, Default, Clone)]
pub struct LogNotifier;

impl LogNotifier {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl NotifierPort for LogNotifier {
    async fn notify_bot_started(&self, user_id: UserId, bot_id: BotId, name: &str) {
        tracing::info!(user_id, bot_id, name, "notification: bot started");
    }

    async fn notify_bot_stopped(&self, user_id: UserId, bot_id: BotId, name: &str, reason: &str) {
        tracing::info!(user_id, bot_id, name, reason, "notification: bot stopped");
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
        tracing::info!(
            user_id,
            bot_id,
            symbol,
            %side,
            %qty,
            %entry_price,
            "notification: trade opened"
        );
    }

    async fn notify_trade_closed(
        &self,
        user_id: UserId,
        bot_id: BotId,
        symbol: &str,
        pnl: Decimal,
        reason: ExitReason,
    ) {
        tracing::info!(user_id, bot_id, symbol, %pnl, %reason, "notification: trade closed");
    }

    async fn notify_risk_alert(&self, user_id: UserId, message: &str) {
        tracing::warn!(user_id, message, "notification: risk alert");
    }
}
