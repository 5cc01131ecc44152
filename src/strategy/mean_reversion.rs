//! Z-score mean reversion strategy
//!
//! z = (price - rolling_mean) / rolling_std over the candle closes.
//! Oversold (z below -threshold) enters long, overbought enters short, and
//! an open position exits once z reverts through the exit threshold.

use serde::{Deserialize, Serialize};

use crate::domain::position::Side;
use crate::strategy::candles::CandleBuffer;
use crate::strategy::signal::Signal;
use crate::strategy::{PositionView, StrategyError, TrendStrategy};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MeanReversionParams {
    /// Rolling window length in candles.
    pub lookback: usize,
    /// Entry threshold in standard deviations.
    pub z_entry: f64,
    /// Exit once z reverts inside this band.
    pub z_exit: f64,
    pub leverage: u32,
}

impl Default for MeanReversionParams {
    fn default() -> Self {
        Self {
            lookback: 50,
            z_entry: 2.0,
            z_exit: 0.25,
            leverage: 2,
        }
    }
}

impl MeanReversionParams {
    pub fn validate(&self) -> Result<(), StrategyError> {
        if self.lookback < 2 {
            return Err(StrategyError::InvalidParameter(format!(
                "lookback {} must be at least 2",
                self.lookback
            )));
        }
        if self.z_entry <= 0.0 {
            return Err(StrategyError::InvalidParameter(format!(
                "z_entry {} must be positive",
                self.z_entry
            )));
        }
        if self.z_exit < 0.0 || self.z_exit >= self.z_entry {
            return Err(StrategyError::InvalidParameter(format!(
                "z_exit {} must be in [0, z_entry)",
                self.z_exit
            )));
        }
        Ok(())
    }
}

#[derive(Debug)]
pub struct MeanReversionStrategy {
    params: MeanReversionParams,
}

impl MeanReversionStrategy {
    pub fn new(params: MeanReversionParams) -> Self {
        Self { params }
    }

    fn zscore(&self, price: f64, closes: &[f64]) -> Option<f64> {
        if closes.len() < self.params.lookback {
            return None;
        }
        let window = &closes[closes.len() - self.params.lookback..];
        let mean = window.iter().sum::<f64>() / window.len() as f64;
        let variance =
            window.iter().map(|c| (c - mean).powi(2)).sum::<f64>() / window.len() as f64;
        let std_dev = variance.sqrt();
        if std_dev < 1e-10 {
            return None;
        }
        Some((price - mean) / std_dev)
    }

    /// Confidence grows with how far beyond the entry threshold z sits.
    fn confidence(&self, z: f64) -> f64 {
        let excess = (z.abs() - self.params.z_entry).max(0.0);
        (0.6 + excess * 0.1).min(0.95)
    }
}

impl TrendStrategy for MeanReversionStrategy {
    fn name(&self) -> &'static str {
        "mean_reversion"
    }

    fn warmup(&self) -> usize {
        self.params.lookback
    }

    fn evaluate(
        &mut self,
        current_price: f64,
        candles: &CandleBuffer,
        position: Option<&PositionView>,
    ) -> Result<Signal, StrategyError> {
        if !current_price.is_finite() || current_price <= 0.0 {
            return Err(StrategyError::Calculation(format!(
                "non-positive price {current_price}"
            )));
        }

        let closes = candles.closes();
        let Some(z) = self.zscore(current_price, &closes) else {
            return Ok(Signal::hold(format!(
                "warming up ({}/{} candles)",
                closes.len(),
                self.params.lookback
            )));
        };

        if let Some(pos) = position {
            let reverted = match pos.side {
                Side::Long => z >= -self.params.z_exit,
                Side::Short => z <= self.params.z_exit,
            };
            if reverted {
                return Ok(Signal::close(
                    self.confidence(z),
                    format!("z {z:.2} reverted to the mean"),
                )
                .with_tag("zscore_revert"));
            }
            return Ok(Signal::hold(format!("z {z:.2} still stretched")));
        }

        if z < -self.params.z_entry {
            let mut signal =
                Signal::buy(self.confidence(z), format!("oversold: z {z:.2}"));
            signal.leverage = Some(self.params.leverage);
            return Ok(signal.with_tag("zscore_oversold"));
        }
        if z > self.params.z_entry {
            let mut signal =
                Signal::sell(self.confidence(z), format!("overbought: z {z:.2}"));
            signal.leverage = Some(self.params.leverage);
            return Ok(signal.with_tag("zscore_overbought"));
        }

        Ok(Signal::hold(format!("z {z:.2} inside band")))
    }
}
