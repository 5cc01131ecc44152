//! Candle aggregation - builds OHLC candles from price ticks
//!
//! Ticks are bucketed by their own timestamps so replayed/backfilled data
//! produces the same candles as live data.

use std::collections::VecDeque;

use chrono::{DateTime, Utc};

/// Default candle ring-buffer capacity.
pub const DEFAULT_BUFFER_CAPACITY: usize = 200;

/// One OHLCV candle.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Candle {
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    /// Tick count used as a volume proxy.
    pub volume: f64,
    pub open_time: DateTime<Utc>,
}

impl Candle {
    pub fn new(open: f64, high: f64, low: f64, close: f64, volume: f64, open_time: DateTime<Utc>) -> Self {
        Self { open, high, low, close, volume, open_time }
    }

    pub fn is_bullish(&self) -> bool {
        self.close > self.open
    }
}

/// Builds OHLC candles from streaming price ticks.
#[derive(Debug)]
pub struct CandleBuilder {
    /// Candle period in seconds.
    period_secs: i64,
    bucket: Option<i64>,
    open: f64,
    high: f64,
    low: f64,
    close: f64,
    tick_count: u64,
    open_time: DateTime<Utc>,
}

impl CandleBuilder {
    pub fn new(period_secs: i64) -> Self {
        Self {
            period_secs: period_secs.max(1),
            bucket: None,
            open: 0.0,
            high: f64::MIN,
            low: f64::MAX,
            close: 0.0,
            tick_count: 0,
            open_time: DateTime::<Utc>::UNIX_EPOCH,
        }
    }

    pub fn one_minute() -> Self {
        Self::new(60)
    }

    /// Update with a new price tick.
    /// Returns `Some(Candle)` when the tick opened a new period, closing the
    /// previous candle.
    pub fn update(&mut self, price: f64, ts: DateTime<Utc>) -> Option<Candle> {
        let bucket = ts.timestamp().div_euclid(self.period_secs);

        match self.bucket {
            None => {
                self.start(price, bucket, ts);
                None
            }
            Some(current) if bucket > current => {
                let completed = self.snapshot();
                self.start(price, bucket, ts);
                Some(completed)
            }
            Some(_) => {
                self.high = self.high.max(price);
                self.low = self.low.min(price);
                self.close = price;
                self.tick_count += 1;
                None
            }
        }
    }

    /// Force-close the building candle (useful on shutdown).
    pub fn force_close(&mut self) -> Option<Candle> {
        if self.bucket.is_some() && self.tick_count > 0 {
            let candle = self.snapshot();
            self.bucket = None;
            Some(candle)
        } else {
            None
        }
    }

    pub fn is_building(&self) -> bool {
        self.bucket.is_some()
    }

    fn start(&mut self, price: f64, bucket: i64, ts: DateTime<Utc>) {
        self.bucket = Some(bucket);
        self.open = price;
        self.high = price;
        self.low = price;
        self.close = price;
        self.tick_count = 1;
        self.open_time = ts;
    }

    fn snapshot(&self) -> Candle {
        Candle::new(self.open, self.high, self.low, self.close, self.tick_count as f64, self.open_time)
    }
}

/// Bounded ring buffer of completed candles.
#[derive(Debug)]
pub struct CandleBuffer {
    candles: VecDeque<Candle>,
    capacity: usize,
}

impl CandleBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            candles: VecDeque::with_capacity(capacity),
            capacity: capacity.max(1),
        }
    }

    pub fn push(&mut self, candle: Candle) {
        if self.candles.len() == self.capacity {
            self.candles.pop_front();
        }
        self.candles.push_back(candle);
    }

    pub fn len(&self) -> usize {
        self.candles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.candles.is_empty()
    }

    pub fn last(&self) -> Option<&Candle> {
        self.candles.back()
    }

    /// Closing prices, oldest first.
    pub fn closes(&self) -> Vec<f64> {
        self.candles.iter().map(|c| c.close).collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Candle> {
        self.candles.iter()
    }
}

impl Default for CandleBuffer {
    fn default() -> Self {
        Self::new(DEFAULT_BUFFER_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn ts(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).unwrap()
    }

    #[test]
    fn test_builder_first_tick_starts_candle() {
        let mut builder = CandleBuilder::new(60);
        assert!(builder.update(100.0, ts(0)).is_none());
        assert!(builder.is_building());
    }

    #[test]
    fn test_builder_completes_on_period_rollover() {
        let mut builder = CandleBuilder::new(60);
        builder.update(100.0, ts(0));
        builder.update(105.0, ts(10));
        builder.update(95.0, ts(20));
        builder.update(101.0, ts(30));

        let candle = builder.update(102.0, ts(65)).expect("candle should close");
        assert_eq!(candle.open, 100.0);
        assert_eq!(candle.high, 105.0);
        assert_eq!(candle.low, 95.0);
        assert_eq!(candle.close, 101.0);
        assert_eq!(candle.volume, 4.0);
    }

    #[test]
    fn test_builder_force_close() {
        let mut builder = CandleBuilder::new(60);
        builder.update(100.0, ts(0));
        let candle = builder.force_close().expect("should close");
        assert_eq!(candle.open, 100.0);
        assert!(!builder.is_building());
        assert!(builder.force_close().is_none());
    }

    #[test]
    fn test_buffer_bounded() {
        let mut buffer = CandleBuffer::new(3);
        for i in 0..5 {
            buffer.push(Candle::new(i as f64, i as f64, i as f64, i as f64, 1.0, ts(i * 60)));
        }
        assert_eq!(buffer.len(), 3);
        assert_eq!(buffer.closes(), vec![2.0, 3.0, 4.0]);
        assert_eq!(buffer.last().unwrap().close, 4.0);
    }
}
