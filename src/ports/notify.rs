//! Notification port - fire-and-forget user notifications.
//!
//! Failures here must never interrupt a trading loop; implementations and
//! callers both swallow errors after logging.

use async_trait::async_trait;
use rust_decimal::Decimal;

use crate::domain::bot::{BotId, UserId};
use crate::domain::position::Side;
use crate::domain::trade::ExitReason;

#[async_trait]
pub trait NotifierPort: Send + Sync {
    async fn notify_bot_started(&self, user_id: UserId, bot_id: BotId, name: &str);

    async fn notify_bot_stopped(&self, user_id: UserId, bot_id: BotId, name: &str, reason: &str);

    async fn notify_trade_opened(
        &self,
        user_id: UserId,
        bot_id: BotId,
        symbol: &str,
        side: Side,
        qty: Decimal,
        entry_price: Decimal,
    );

    async fn notify_trade_closed(
        &self,
        user_id: UserId,
        bot_id: BotId,
        symbol: &str,
        pnl: Decimal,
        reason: ExitReason,
    );

    async fn notify_risk_alert(&self, user_id: UserId, message: &str);
}
