//! SMA crossover momentum strategy
//!
//! Goes long when the fast moving average crosses above the slow one and
//! short on the opposite cross; an open position is closed when the cross
//! reverses against it.

use serde::{Deserialize, Serialize};

use crate::domain::position::Side;
use crate::strategy::candles::CandleBuffer;
use crate::strategy::signal::Signal;
use crate::strategy::{PositionView, StrategyError, TrendStrategy};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SmaCrossParams {
    pub fast_period: usize,
    pub slow_period: usize,
    /// Confidence assigned to a fresh cross.
    pub base_confidence: f64,
    /// Leverage hint forwarded to the loop (clamped by risk settings).
    pub leverage: u32,
}

impl Default for SmaCrossParams {
    fn default() -> Self {
        Self {
            fast_period: 9,
            slow_period: 21,
            base_confidence: 0.7,
            leverage: 3,
        }
    }
}

impl SmaCrossParams {
    pub fn validate(&self) -> Result<(), StrategyError> {
        if self.fast_period == 0 || self.slow_period == 0 {
            return Err(StrategyError::InvalidParameter("periods must be positive".into()));
        }
        if self.fast_period >= self.slow_period {
            return Err(StrategyError::InvalidParameter(format!(
                "fast_period {} must be below slow_period {}",
                self.fast_period, self.slow_period
            )));
        }
        if !(0.0..=1.0).contains(&self.base_confidence) {
            return Err(StrategyError::InvalidParameter(format!(
                "base_confidence {} out of range 0-1",
                self.base_confidence
            )));
        }
        Ok(())
    }
}

#[derive(Debug)]
pub struct SmaCrossStrategy {
    params: SmaCrossParams,
    prev_diff: Option<f64>,
}

impl SmaCrossStrategy {
    pub fn new(params: SmaCrossParams) -> Self {
        Self { params, prev_diff: None }
    }

    fn sma(closes: &[f64], period: usize) -> Option<f64> {
        if closes.len() < period {
            return None;
        }
        let tail = &closes[closes.len() - period..];
        Some(tail.iter().sum::<f64>() / period as f64)
    }
}

impl TrendStrategy for SmaCrossStrategy {
    fn name(&self) -> &'static str {
        "sma_cross"
    }

    fn warmup(&self) -> usize {
        self.params.slow_period
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
        let (Some(fast), Some(slow)) = (
            Self::sma(&closes, self.params.fast_period),
            Self::sma(&closes, self.params.slow_period),
        ) else {
            return Ok(Signal::hold(format!(
                "warming up ({}/{} candles)",
                closes.len(),
                self.params.slow_period
            )));
        };

        let diff = fast - slow;
        let crossed_up = matches!(self.prev_diff, Some(prev) if prev <= 0.0) && diff > 0.0;
        let crossed_down = matches!(self.prev_diff, Some(prev) if prev >= 0.0) && diff < 0.0;
        self.prev_diff = Some(diff);

        // Reverse-cross closes an open position before anything else.
        if let Some(pos) = position {
            let against = match pos.side {
                Side::Long => crossed_down,
                Side::Short => crossed_up,
            };
            if against {
                return Ok(Signal::close(
                    self.params.base_confidence,
                    format!("sma cross reversed against {} position", pos.side),
                )
                .with_tag("sma_cross_reverse"));
            }
            return Ok(Signal::hold("holding with trend"));
        }

        if crossed_up {
            let mut signal = Signal::buy(self.params.base_confidence, format!(
                "fast sma {fast:.4} crossed above slow {slow:.4}"
            ));
            signal.leverage = Some(self.params.leverage);
            return Ok(signal.with_tag("sma_cross_up"));
        }
        if crossed_down {
            let mut signal = Signal::sell(self.params.base_confidence, format!(
                "fast sma {fast:.4} crossed below slow {slow:.4}"
            ));
            signal.leverage = Some(self.params.leverage);
            return Ok(signal.with_tag("sma_cross_down"));
        }

        Ok(Signal::hold("no cross"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::strategy::candles::Candle;
    use crate::strategy::signal::SignalAction;
    use chrono::{TimeZone, Utc};

    fn buffer_from(closes: &[f64]) -> CandleBuffer {
        let mut buffer = CandleBuffer::new(256);
        for (i, &close) in closes.iter().enumerate() {
            let ts = Utc.timestamp_opt(i as i64 * 60, 0).unwrap();
            buffer.push(Candle::new(close, close, close, close, 1.0, ts));
        }
        buffer
    }

    fn params() -> SmaCrossParams {
        SmaCrossParams { fast_period: 2, slow_period: 4, ..Default::default() }
    }

    #[test]
    fn test_warmup_holds() {
        let mut strategy = SmaCrossStrategy::new(params());
        let buffer = buffer_from(&[100.0, 101.0]);
        let signal = strategy.evaluate(101.0, &buffer, None).unwrap();
        assert_eq!(signal.action, SignalAction::Hold);
        assert!(signal.reason.contains("warming up"));
    }

    #[test]
    fn test_cross_up_emits_buy() {
        let mut strategy = SmaCrossStrategy::new(params());

        // Downtrend first: fast below slow.
        let buffer = buffer_from(&[110.0, 108.0, 106.0, 104.0]);
        let signal = strategy.evaluate(104.0, &buffer, None).unwrap();
        assert_eq!(signal.action, SignalAction::Hold);

        // Sharp rally flips the fast average above the slow one.
        let buffer = buffer_from(&[106.0, 104.0, 112.0, 118.0]);
        let signal = strategy.evaluate(118.0, &buffer, None).unwrap();
        assert_eq!(signal.action, SignalAction::Buy);
        assert_eq!(signal.leverage, Some(3));
        assert_eq!(signal.tag.as_deref(), Some("sma_cross_up"));
    }

    #[test]
    fn test_reverse_cross_closes_long() {
        let mut strategy = SmaCrossStrategy::new(params());

        // Uptrend: fast above slow.
        let buffer = buffer_from(&[100.0, 104.0, 108.0, 112.0]);
        strategy.evaluate(112.0, &buffer, None).unwrap();

        let position = PositionView { side: Side::Long, entry_price: 110.0, age_secs: 60 };
        // Sharp selloff flips the cross.
        let buffer = buffer_from(&[108.0, 112.0, 96.0, 90.0]);
        let signal = strategy.evaluate(90.0, &buffer, Some(&position)).unwrap();
        assert_eq!(signal.action, SignalAction::Close);
    }

    #[test]
    fn test_invalid_price_is_strategy_error() {
        let mut strategy = SmaCrossStrategy::new(params());
        let buffer = buffer_from(&[100.0, 101.0, 102.0, 103.0]);
        assert!(strategy.evaluate(f64::NAN, &buffer, None).is_err());
        assert!(strategy.evaluate(-1.0, &buffer, None).is_err());
    }

    #[test]
    fn test_params_validation() {
        assert!(params().validate().is_ok());
        let bad = SmaCrossParams { fast_period: 4, slow_period: 4, ..Default::default() };
        assert!(bad.validate().is_err());
        let bad = SmaCrossParams { base_confidence: 1.5, ..Default::default() };
        assert!(bad.validate().is_err());
    }
}
