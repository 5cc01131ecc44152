use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Action a strategy wants the bot loop to take on the current tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignalAction {
    Hold,
    Buy,
    Sell,
    Close,
}

/// A single strategy decision.
///
/// `size` and `leverage` are optional hints; the loop applies its own
/// minimum-lot fallback and leverage clamp before anything reaches the
/// exchange.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Signal {
    pub action: SignalAction,
    /// Strategy confidence in [0, 1].
    pub confidence: f64,
    pub reason: String,
    pub size: Option<Decimal>,
    pub leverage: Option<u32>,
    /// Free-text provenance tag recorded on the Trade row for chart markup.
    pub tag: Option<String>,
}

impl Signal {
    pub fn hold(reason: impl Into<String>) -> Self {
        Self {
            action: SignalAction::Hold,
            confidence: 0.0,
            reason: reason.into(),
            size: None,
            leverage: None,
            tag: None,
        }
    }

    pub fn buy(confidence: f64, reason: impl Into<String>) -> Self {
        Self {
            action: SignalAction::Buy,
            confidence,
            reason: reason.into(),
            size: None,
            leverage: None,
            tag: None,
        }
    }

    pub fn sell(confidence: f64, reason: impl Into<String>) -> Self {
        Self {
            action: SignalAction::Sell,
            confidence,
            reason: reason.into(),
            size: None,
            leverage: None,
            tag: None,
        }
    }

    pub fn close(confidence: f64, reason: impl Into<String>) -> Self {
        Self {
            action: SignalAction::Close,
            confidence,
            reason: reason.into(),
            size: None,
            leverage: None,
            tag: None,
        }
    }

    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tag = Some(tag.into());
        self
    }

    pub fn with_size(mut self, size: Decimal) -> Self {
        self.size = Some(size);
        self
    }

    pub fn is_entry(&self) -> bool {
        matches!(self.action, SignalAction::Buy | SignalAction::Sell)
    }
}
