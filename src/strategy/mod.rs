//! Strategy Layer - Signal generation for trend bots
//!
//! Strategies form a closed set selected by tag with a typed parameter
//! struct each - no runtime-loaded code. The bot loop treats a strategy as
//! opaque and isolates anything it raises as a strategy error.

pub mod candles;
pub mod mean_reversion;
pub mod momentum;
pub mod signal;

pub use candles::{Candle, CandleBuffer, CandleBuilder};
pub use mean_reversion::{MeanReversionParams, MeanReversionStrategy};
pub use momentum::{SmaCrossParams, SmaCrossStrategy};
pub use signal::{Signal, SignalAction};

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error, Clone)]
pub enum StrategyError {
    #[error("Strategy error: invalid parameter: {0}")]
    InvalidParameter(String),

    #[error("Strategy error: calculation failed: {0}")]
    Calculation(String),
}

/// Snapshot of the bot's open position handed to a strategy.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PositionView {
    pub side: crate::domain::position::Side,
    pub entry_price: f64,
    pub age_secs: i64,
}

/// A trend strategy consumes the current price, the candle buffer and the
/// open-position view, and returns a signal.
pub trait TrendStrategy: Send {
    fn name(&self) -> &'static str;

    /// Candles required before the strategy emits non-hold signals.
    fn warmup(&self) -> usize;

    fn evaluate(
        &mut self,
        current_price: f64,
        candles: &CandleBuffer,
        position: Option<&PositionView>,
    ) -> Result<Signal, StrategyError>;
}

/// Closed set of strategies, selected by tag in config or the bot record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StrategySpec {
    SmaCross(SmaCrossParams),
    MeanReversion(MeanReversionParams),
}

impl StrategySpec {
    pub fn validate(&self) -> Result<(), StrategyError> {
        match self {
            StrategySpec::SmaCross(p) => p.validate(),
            StrategySpec::MeanReversion(p) => p.validate(),
        }
    }

    pub fn build(&self) -> Result<Box<dyn TrendStrategy>, StrategyError> {
        self.validate()?;
        Ok(match self {
            StrategySpec::SmaCross(p) => Box::new(SmaCrossStrategy::new(p.clone())),
            StrategySpec::MeanReversion(p) => Box::new(MeanReversionStrategy::new(p.clone())),
        })
    }

    pub fn name(&self) -> &'static str {
        match self {
            StrategySpec::SmaCross(_) => "sma_cross",
            StrategySpec::MeanReversion(_) => "mean_reversion",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_spec_builds_strategy() {
        let spec = StrategySpec::SmaCross(SmaCrossParams::default());
        let strategy = spec.build().unwrap();
        assert_eq!(strategy.name(), "sma_cross");

        let spec = StrategySpec::MeanReversion(MeanReversionParams::default());
        let strategy = spec.build().unwrap();
        assert_eq!(strategy.name(), "mean_reversion");
    }

    #[test]
    fn test_spec_serde_tagged() {
        let spec = StrategySpec::SmaCross(SmaCrossParams::default());
        let json = serde_json::to_string(&spec).unwrap();
        assert!(json.contains("\"kind\":\"sma_cross\""));

        let parsed: StrategySpec = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, spec);
    }

    #[test]
    fn test_spec_rejects_bad_params() {
        let spec = StrategySpec::SmaCross(SmaCrossParams {
            fast_period: 50,
            slow_period: 10,
            ..Default::default()
        });
        assert!(spec.build().is_err());
    }
}
