//! Grid cycle engine
//!
//! Pure grid-ladder math plus the per-rung buy/sell cycle state machine.
//! Rungs persist their exchange order ids so a restarted process reconciles
//! against live order status instead of re-placing orders.

use chrono::{DateTime, Utc};
use rust_decimal::prelude::*;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Default taker fee rate applied to both legs of a cycle (0.06%).
pub const DEFAULT_TAKER_FEE_RATE: Decimal = dec!(0.0006);

/// Decimal places grid prices are rounded to.
const PRICE_SCALE: u32 = 10;

#[derive(Debug, Error)]
pub enum GridError {
    #[error("Invalid price range: lower {lower} must be positive and below upper {upper}")]
    InvalidRange { lower: Decimal, upper: Decimal },

    #[error("Grid count {0} too small, need at least 2")]
    TooFewGrids(u32),

    #[error("Invalid rung transition: {rung} cannot {action} while {status:?}")]
    InvalidTransition {
        rung: usize,
        action: &'static str,
        status: GridRungStatus,
    },

    #[error("Order {0} does not belong to this rung")]
    UnknownOrder(String),

    #[error("Price conversion failed for {0}")]
    PriceConversion(f64),
}

/// Ladder spacing mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GridMode {
    /// Constant price step between rungs.
    Arithmetic,
    /// Constant price ratio between rungs.
    Geometric,
}

/// Configuration for one grid bot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GridBotConfig {
    pub lower_price: Decimal,
    pub upper_price: Decimal,
    pub grid_count: u32,
    pub mode: GridMode,
    /// Total USDT committed to the ladder.
    pub total_investment: Decimal,
    pub leverage: u32,
    #[serde(default = "default_taker_fee")]
    pub taker_fee_rate: Decimal,
    /// Override for the resting-order sizing divisor; defaults to the
    /// `count/2 + 1` heuristic when absent.
    #[serde(default)]
    pub effective_grids: Option<u32>,
}

fn default_taker_fee() -> Decimal {
    DEFAULT_TAKER_FEE_RATE
}

impl GridBotConfig {
    pub fn validate(&self) -> Result<(), GridError> {
        if self.lower_price <= Decimal::ZERO || self.upper_price <= self.lower_price {
            return Err(GridError::InvalidRange {
                lower: self.lower_price,
                upper: self.upper_price,
            });
        }
        if self.grid_count < 2 {
            return Err(GridError::TooFewGrids(self.grid_count));
        }
        Ok(())
    }

    pub fn grid_prices(&self) -> Result<Vec<Decimal>, GridError> {
        calculate_grid_prices(self.lower_price, self.upper_price, self.grid_count, self.mode)
    }

    /// Notional per resting order.
    pub fn per_grid_amount(&self) -> Decimal {
        calculate_per_grid_amount(
            self.total_investment,
            self.grid_count,
            self.leverage,
            self.effective_grids,
        )
    }

    /// Margin actually committed per resting order.
    pub fn margin_per_grid(&self) -> Decimal {
        if self.leverage == 0 {
            return self.per_grid_amount();
        }
        self.per_grid_amount() / Decimal::from(self.leverage)
    }
}

/// Compute the ladder of `count` prices, inclusive of both bounds.
pub fn calculate_grid_prices(
    lower: Decimal,
    upper: Decimal,
    count: u32,
    mode: GridMode,
) -> Result<Vec<Decimal>, GridError> {
    if lower <= Decimal::ZERO || upper <= lower {
        return Err(GridError::InvalidRange { lower, upper });
    }
    if count < 2 {
        return Err(GridError::TooFewGrids(count));
    }

    let steps = count - 1;
    let mut prices = Vec::with_capacity(count as usize);

    match mode {
        GridMode::Arithmetic => {
            let step = (upper - lower) / Decimal::from(steps);
            for i in 0..count {
                prices.push((lower + step * Decimal::from(i)).round_dp(PRICE_SCALE));
            }
        }
        GridMode::Geometric => {
            let lf = lower
                .to_f64()
                .ok_or(GridError::PriceConversion(0.0))?;
            let uf = upper
                .to_f64()
                .ok_or(GridError::PriceConversion(0.0))?;
            let ratio = (uf / lf).powf(1.0 / steps as f64);
            for i in 0..count {
                let p = lf * ratio.powi(i as i32);
                let d = Decimal::from_f64(p).ok_or(GridError::PriceConversion(p))?;
                prices.push(d.round_dp(PRICE_SCALE));
            }
        }
    }

    // Endpoints are exact regardless of rounding.
    prices[0] = lower;
    prices[steps as usize] = upper;

    Ok(prices)
}

/// Notional per resting order: `total × leverage / effective_grids`.
///
/// At steady state only roughly half the ladder carries resting buys, hence
/// the `count/2 + 1` default divisor. It is a sizing heuristic, not an
/// invariant - callers may override it.
pub fn calculate_per_grid_amount(
    total_investment: Decimal,
    grid_count: u32,
    leverage: u32,
    effective_grids: Option<u32>,
) -> Decimal {
    let effective = effective_grids.unwrap_or(grid_count / 2 + 1).max(1);
    total_investment * Decimal::from(leverage.max(1)) / Decimal::from(effective)
}

/// Cycle state of one rung.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GridRungStatus {
    Pending,
    BuyPlaced,
    BuyFilled,
    SellPlaced,
    SellFilled,
}

/// Order ids of the most recently completed cycle, kept so a replayed fill
/// event is recognized and ignored instead of double-counted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompletedCycle {
    pub buy_order_id: String,
    pub sell_order_id: String,
    pub profit: Decimal,
}

/// One price level of the ladder with its own buy/sell cycle state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GridRung {
    /// 0-based, ascending price.
    pub grid_index: usize,
    pub grid_price: Decimal,
    pub status: GridRungStatus,
    pub buy_order_id: Option<String>,
    pub buy_filled_price: Option<Decimal>,
    pub buy_filled_qty: Option<Decimal>,
    pub buy_filled_at: Option<DateTime<Utc>>,
    pub sell_order_id: Option<String>,
    pub sell_price: Option<Decimal>,
    pub sell_filled_price: Option<Decimal>,
    pub sell_filled_qty: Option<Decimal>,
    pub sell_filled_at: Option<DateTime<Utc>>,
    /// Net profit accumulated across completed cycles.
    pub profit: Decimal,
    pub cycles_completed: u32,
    pub last_cycle: Option<CompletedCycle>,
}

impl GridRung {
    pub fn new(grid_index: usize, grid_price: Decimal) -> Self {
        Self {
            grid_index,
            grid_price,
            status: GridRungStatus::Pending,
            buy_order_id: None,
            buy_filled_price: None,
            buy_filled_qty: None,
            buy_filled_at: None,
            sell_order_id: None,
            sell_price: None,
            sell_filled_price: None,
            sell_filled_qty: None,
            sell_filled_at: None,
            profit: Decimal::ZERO,
            cycles_completed: 0,
            last_cycle: None,
        }
    }

    /// Order id of the currently resting order, if any.
    pub fn open_order_id(&self) -> Option<&str> {
        match self.status {
            GridRungStatus::BuyPlaced => self.buy_order_id.as_deref(),
            GridRungStatus::SellPlaced => self.sell_order_id.as_deref(),
            _ => None,
        }
    }

    pub fn mark_buy_placed(&mut self, order_id: impl Into<String>) -> Result<(), GridError> {
        if self.status != GridRungStatus::Pending {
            return Err(GridError::InvalidTransition {
                rung: self.grid_index,
                action: "place buy",
                status: self.status,
            });
        }
        self.buy_order_id = Some(order_id.into());
        self.status = GridRungStatus::BuyPlaced;
        Ok(())
    }

    /// Resting buy was canceled before filling; rung returns to Pending.
    pub fn mark_buy_canceled(&mut self) -> Result<(), GridError> {
        if self.status != GridRungStatus::BuyPlaced {
            return Err(GridError::InvalidTransition {
                rung: self.grid_index,
                action: "cancel buy",
                status: self.status,
            });
        }
        self.buy_order_id = None;
        self.status = GridRungStatus::Pending;
        Ok(())
    }

    /// Record a buy fill. Returns `true` when the fill advanced the rung,
    /// `false` when it was a replay of an already-applied fill.
    pub fn record_buy_fill(
        &mut self,
        order_id: &str,
        price: Decimal,
        qty: Decimal,
        at: DateTime<Utc>,
    ) -> Result<bool, GridError> {
        // Replay of a fill already consumed this cycle or last cycle.
        if self.status != GridRungStatus::BuyPlaced {
            let seen_current = self.buy_order_id.as_deref() == Some(order_id);
            let seen_last = self
                .last_cycle
                .as_ref()
                .map_or(false, |c| c.buy_order_id == order_id);
            if seen_current || seen_last {
                return Ok(false);
            }
            return Err(GridError::InvalidTransition {
                rung: self.grid_index,
                action: "fill buy",
                status: self.status,
            });
        }

        if self.buy_order_id.as_deref() != Some(order_id) {
            return Err(GridError::UnknownOrder(order_id.to_string()));
        }

        self.buy_filled_price = Some(price);
        self.buy_filled_qty = Some(qty);
        self.buy_filled_at = Some(at);
        self.status = GridRungStatus::BuyFilled;
        Ok(true)
    }

    pub fn mark_sell_placed(
        &mut self,
        order_id: impl Into<String>,
        sell_price: Decimal,
    ) -> Result<(), GridError> {
        if self.status != GridRungStatus::BuyFilled {
            return Err(GridError::InvalidTransition {
                rung: self.grid_index,
                action: "place sell",
                status: self.status,
            });
        }
        self.sell_order_id = Some(order_id.into());
        self.sell_price = Some(sell_price);
        self.status = GridRungStatus::SellPlaced;
        Ok(())
    }

    /// Resting sell was canceled; inventory is still held.
    pub fn mark_sell_canceled(&mut self) -> Result<(), GridError> {
        if self.status != GridRungStatus::SellPlaced {
            return Err(GridError::InvalidTransition {
                rung: self.grid_index,
                action: "cancel sell",
                status: self.status,
            });
        }
        self.sell_order_id = None;
        self.sell_price = None;
        self.status = GridRungStatus::BuyFilled;
        Ok(())
    }

    /// Record a sell fill, completing the cycle. Returns the cycle's net
    /// profit, or `None` when the fill was a replay.
    ///
    /// On success the rung resets to Pending at the same grid price, ready
    /// for the next cycle.
    pub fn record_sell_fill(
        &mut self,
        order_id: &str,
        price: Decimal,
        qty: Decimal,
        at: DateTime<Utc>,
        taker_fee_rate: Decimal,
    ) -> Result<Option<Decimal>, GridError> {
        if self.status != GridRungStatus::SellPlaced {
            let seen_last = self
                .last_cycle
                .as_ref()
                .map_or(false, |c| c.sell_order_id == order_id);
            if seen_last {
                return Ok(None);
            }
            return Err(GridError::InvalidTransition {
                rung: self.grid_index,
                action: "fill sell",
                status: self.status,
            });
        }

        if self.sell_order_id.as_deref() != Some(order_id) {
            return Err(GridError::UnknownOrder(order_id.to_string()));
        }

        let buy_price = self.buy_filled_price.unwrap_or(self.grid_price);
        let profit = cycle_profit(buy_price, price, qty, taker_fee_rate);

        self.sell_filled_price = Some(price);
        self.sell_filled_qty = Some(qty);
        self.sell_filled_at = Some(at);
        self.profit += profit;
        self.cycles_completed += 1;
        self.last_cycle = Some(CompletedCycle {
            buy_order_id: self.buy_order_id.clone().unwrap_or_default(),
            sell_order_id: order_id.to_string(),
            profit,
        });

        self.reset_for_next_cycle();
        Ok(Some(profit))
    }

    fn reset_for_next_cycle(&mut self) {
        self.status = GridRungStatus::Pending;
        self.buy_order_id = None;
        self.buy_filled_price = None;
        self.buy_filled_qty = None;
        self.buy_filled_at = None;
        self.sell_order_id = None;
        self.sell_price = None;
        self.sell_filled_price = None;
        self.sell_filled_qty = None;
        self.sell_filled_at = None;
    }
}

/// Net profit of one completed cycle: `(sell − buy) × qty` minus taker fees
/// on both legs.
pub fn cycle_profit(buy_price: Decimal, sell_price: Decimal, qty: Decimal, fee_rate: Decimal) -> Decimal {
    let gross = (sell_price - buy_price) * qty;
    let fees = (buy_price + sell_price) * qty * fee_rate;
    gross - fees
}

/// Build the initial rung set for a config.
pub fn build_rungs(config: &GridBotConfig) -> Result<Vec<GridRung>, GridError> {
    let prices = config.grid_prices()?;
    Ok(prices
        .into_iter()
        .enumerate()
        .map(|(i, p)| GridRung::new(i, p))
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn config() -> GridBotConfig {
        GridBotConfig {
            lower_price: dec!(100),
            upper_price: dec!(200),
            grid_count: 5,
            mode: GridMode::Arithmetic,
            total_investment: dec!(1000),
            leverage: 2,
            taker_fee_rate: dec!(0.0006),
            effective_grids: None,
        }
    }

    #[test]
    fn test_arithmetic_prices() {
        let prices = calculate_grid_prices(dec!(100), dec!(200), 5, GridMode::Arithmetic).unwrap();
        assert_eq!(prices, vec![dec!(100), dec!(125), dec!(150), dec!(175), dec!(200)]);
    }

    #[test]
    fn test_geometric_prices_constant_ratio() {
        let prices = calculate_grid_prices(dec!(100), dec!(200), 5, GridMode::Geometric).unwrap();
        assert_eq!(prices.len(), 5);
        assert_eq!(prices[0], dec!(100));
        assert_eq!(prices[4], dec!(200));

        let as_f64: Vec<f64> = prices.iter().map(|p| p.to_f64().unwrap()).collect();
        let first_ratio = as_f64[1] / as_f64[0];
        for w in as_f64.windows(2) {
            assert_relative_eq!(w[1] / w[0], first_ratio, epsilon = 1e-6);
        }
        // 2^(1/4)
        assert_relative_eq!(first_ratio, 2f64.powf(0.25), epsilon = 1e-9);
    }

    #[test]
    fn test_price_validation() {
        assert!(matches!(
            calculate_grid_prices(dec!(200), dec!(100), 5, GridMode::Arithmetic),
            Err(GridError::InvalidRange { .. })
        ));
        assert!(matches!(
            calculate_grid_prices(dec!(0), dec!(100), 5, GridMode::Arithmetic),
            Err(GridError::InvalidRange { .. })
        ));
        assert!(matches!(
            calculate_grid_prices(dec!(100), dec!(200), 1, GridMode::Arithmetic),
            Err(GridError::TooFewGrids(1))
        ));
    }

    #[test]
    fn test_per_grid_amount_heuristic() {
        // effective = 10/2 + 1 = 6
        let amount = calculate_per_grid_amount(dec!(600), 10, 3, None);
        assert_eq!(amount, dec!(300));

        // Explicit override wins.
        let amount = calculate_per_grid_amount(dec!(600), 10, 3, Some(9));
        assert_eq!(amount, dec!(200));
    }

    #[test]
    fn test_config_margin_per_grid() {
        let cfg = config();
        // effective = 5/2 + 1 = 3; notional = 1000*2/3; margin = notional/2
        assert_eq!(cfg.margin_per_grid(), cfg.per_grid_amount() / dec!(2));
    }

    fn ts() -> DateTime<Utc> {
        Utc::now()
    }

    #[test]
    fn test_full_cycle_and_reset() {
        let mut rung = GridRung::new(1, dec!(125));

        rung.mark_buy_placed("b1").unwrap();
        assert_eq!(rung.status, GridRungStatus::BuyPlaced);
        assert_eq!(rung.open_order_id(), Some("b1"));

        assert!(rung.record_buy_fill("b1", dec!(125), dec!(2), ts()).unwrap());
        assert_eq!(rung.status, GridRungStatus::BuyFilled);

        rung.mark_sell_placed("s1", dec!(150)).unwrap();
        let profit = rung
            .record_sell_fill("s1", dec!(150), dec!(2), ts(), dec!(0.001))
            .unwrap()
            .expect("cycle should complete");

        // (150-125)*2 - (125+150)*2*0.001 = 50 - 0.55
        assert_eq!(profit, dec!(49.45));
        assert_eq!(rung.profit, dec!(49.45));
        assert_eq!(rung.cycles_completed, 1);

        // Cycle restarts at the same price.
        assert_eq!(rung.status, GridRungStatus::Pending);
        assert_eq!(rung.grid_price, dec!(125));
        assert!(rung.buy_order_id.is_none());
        assert!(rung.sell_order_id.is_none());
    }

    #[test]
    fn test_fill_replay_is_idempotent() {
        let mut rung = GridRung::new(0, dec!(100));
        rung.mark_buy_placed("b1").unwrap();
        rung.record_buy_fill("b1", dec!(100), dec!(1), ts()).unwrap();

        // Replayed buy fill is ignored.
        assert!(!rung.record_buy_fill("b1", dec!(100), dec!(1), ts()).unwrap());

        rung.mark_sell_placed("s1", dec!(110)).unwrap();
        let first = rung
            .record_sell_fill("s1", dec!(110), dec!(1), ts(), Decimal::ZERO)
            .unwrap();
        assert_eq!(first, Some(dec!(10)));

        // Replayed sell fill after the cycle reset does not double-count.
        let replay = rung
            .record_sell_fill("s1", dec!(110), dec!(1), ts(), Decimal::ZERO)
            .unwrap();
        assert_eq!(replay, None);
        assert_eq!(rung.profit, dec!(10));
        assert_eq!(rung.cycles_completed, 1);

        // Replayed buy fill from the completed cycle is also ignored.
        assert!(!rung.record_buy_fill("b1", dec!(100), dec!(1), ts()).unwrap());
    }

    #[test]
    fn test_invalid_transitions() {
        let mut rung = GridRung::new(0, dec!(100));
        assert!(matches!(
            rung.mark_sell_placed("s1", dec!(110)),
            Err(GridError::InvalidTransition { .. })
        ));
        assert!(matches!(
            rung.record_buy_fill("zzz", dec!(100), dec!(1), ts()),
            Err(GridError::InvalidTransition { .. })
        ));

        rung.mark_buy_placed("b1").unwrap();
        assert!(matches!(
            rung.record_buy_fill("other", dec!(100), dec!(1), ts()),
            Err(GridError::UnknownOrder(_))
        ));
    }

    #[test]
    fn test_cancel_paths() {
        let mut rung = GridRung::new(0, dec!(100));
        rung.mark_buy_placed("b1").unwrap();
        rung.mark_buy_canceled().unwrap();
        assert_eq!(rung.status, GridRungStatus::Pending);
        assert!(rung.buy_order_id.is_none());

        rung.mark_buy_placed("b2").unwrap();
        rung.record_buy_fill("b2", dec!(100), dec!(1), ts()).unwrap();
        rung.mark_sell_placed("s2", dec!(110)).unwrap();
        rung.mark_sell_canceled().unwrap();
        // Inventory still held after sell cancel.
        assert_eq!(rung.status, GridRungStatus::BuyFilled);
    }

    #[test]
    fn test_build_rungs_contiguous_ordered() {
        let rungs = build_rungs(&config()).unwrap();
        assert_eq!(rungs.len(), 5);
        for (i, rung) in rungs.iter().enumerate() {
            assert_eq!(rung.grid_index, i);
            assert_eq!(rung.status, GridRungStatus::Pending);
            if i > 0 {
                assert!(rung.grid_price > rungs[i - 1].grid_price);
            }
        }
    }

    #[test]
    fn test_cycle_profit_net_of_fees() {
        let profit = cycle_profit(dec!(100), dec!(110), dec!(2), dec!(0.001));
        // gross 20, fees (100+110)*2*0.001 = 0.42
        assert_eq!(profit, dec!(19.58));
    }
}
