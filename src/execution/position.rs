use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::models::{OrderRequest, Side, TrailingInfo};

/// Limit price of a stop-limit order sits 0.1% past the trigger
const STOP_LIMIT_OFFSET: f64 = 0.999;

/// Protective-order policy, percentages in percent units (5.0 = 5%)
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct OrderManagerConfig {
    pub take_profit_percent: f64,
    pub stop_loss_percent: f64,
    pub trailing_stop_enabled: bool,
    /// Distance of the trailing stop from the running extreme
    pub trailing_stop_percent: f64,
    /// Profit from entry that switches trailing on
    pub trailing_activation_percent: f64,
    pub update_interval_secs: u64,
}

impl Default for OrderManagerConfig {
    fn default() -> Self {
        Self {
            take_profit_percent: 5.0,
            stop_loss_percent: 2.0,
            trailing_stop_enabled: true,
            trailing_stop_percent: 1.0,
            trailing_activation_percent: 2.0,
            update_interval_secs: 5,
        }
    }
}

impl OrderManagerConfig {
    pub fn update_interval(&self) -> Duration {
        Duration::from_secs(self.update_interval_secs.max(1))
    }

    /// Initial (take profit, stop loss) for an entry on `side`
    pub fn protective_levels(&self, side: Side, entry_price: f64) -> (f64, f64) {
        let tp = self.take_profit_percent / 100.0;
        let sl = self.stop_loss_percent / 100.0;
        match side {
            Side::Buy => (entry_price * (1.0 + tp), entry_price * (1.0 - sl)),
            Side::Sell => (entry_price * (1.0 - tp), entry_price * (1.0 + sl)),
        }
    }
}

/// A position under protective-order management
///
/// Order ids are 0 while no live order backs them.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ManagedPosition {
    pub trade_id: i64,
    pub symbol: String,
    pub side: Side,
    pub entry_price: f64,
    pub quantity: f64,
    pub take_profit_price: f64,
    pub stop_loss_price: f64,
    pub highest_price: f64,
    pub lowest_price: f64,
    pub trailing_active: bool,
    pub tp_order_id: i64,
    pub sl_order_id: i64,
    pub decision_id: Option<i64>,
    pub registered_at: DateTime<Utc>,
}

impl ManagedPosition {
    pub fn new(
        trade_id: i64,
        symbol: &str,
        side: Side,
        entry_price: f64,
        quantity: f64,
        decision_id: Option<i64>,
        config: &OrderManagerConfig,
    ) -> Self {
        let (take_profit_price, stop_loss_price) = config.protective_levels(side, entry_price);

        Self {
            trade_id,
            symbol: symbol.to_string(),
            side,
            entry_price,
            quantity,
            take_profit_price,
            stop_loss_price,
            highest_price: entry_price,
            lowest_price: entry_price,
            trailing_active: false,
            tp_order_id: 0,
            sl_order_id: 0,
            decision_id,
            registered_at: Utc::now(),
        }
    }

    /// Fold a new price into the running extremes
    pub fn observe_price(&mut self, price: f64) {
        if price > self.highest_price {
            self.highest_price = price;
        }
        if price < self.lowest_price || self.lowest_price == 0.0 {
            self.lowest_price = price;
        }
    }

    /// Carry over trailing state recorded for the same trade
    ///
    /// Extremes widen to include the stored ones. A stored stop is taken only
    /// when it is more protective than the current one, which means trailing
    /// had already moved it, so trailing counts as active.
    pub fn restore_trailing(&mut self, info: &TrailingInfo) -> bool {
        if info.trade_id != self.trade_id {
            return false;
        }

        if info.highest_price > self.highest_price {
            self.highest_price = info.highest_price;
        }
        if info.lowest_price > 0.0 && info.lowest_price < self.lowest_price {
            self.lowest_price = info.lowest_price;
        }
        if info.stop_loss > 0.0 && self.improves_stop(info.stop_loss) {
            self.stop_loss_price = info.stop_loss;
            self.trailing_active = true;
        }

        true
    }

    /// Directional profit in percent of entry
    pub fn profit_percent(&self, price: f64) -> f64 {
        if self.entry_price <= 0.0 {
            return 0.0;
        }
        match self.side {
            Side::Buy => (price - self.entry_price) / self.entry_price * 100.0,
            Side::Sell => (self.entry_price - price) / self.entry_price * 100.0,
        }
    }

    /// Stop that trails the running extreme by `trail_percent`
    pub fn trailing_candidate(&self, trail_percent: f64) -> f64 {
        let trail = trail_percent / 100.0;
        match self.side {
            Side::Buy => self.highest_price * (1.0 - trail),
            Side::Sell => self.lowest_price * (1.0 + trail),
        }
    }

    /// Whether `candidate` is strictly more protective than the current stop
    pub fn improves_stop(&self, candidate: f64) -> bool {
        match self.side {
            Side::Buy => candidate > self.stop_loss_price,
            Side::Sell => candidate < self.stop_loss_price,
        }
    }

    /// Side of the orders that close this position
    pub fn exit_side(&self) -> Side {
        self.side.opposite()
    }

    pub fn take_profit_order(&self) -> OrderRequest {
        OrderRequest::limit(
            &self.symbol,
            self.exit_side(),
            self.take_profit_price,
            self.quantity,
        )
    }

    pub fn stop_limit_order(&self) -> OrderRequest {
        OrderRequest::stop_loss_limit(
            &self.symbol,
            self.exit_side(),
            self.stop_loss_price,
            self.stop_loss_price * STOP_LIMIT_OFFSET,
            self.quantity,
        )
    }

    /// Plain stop, used when the exchange refuses the stop-limit
    pub fn stop_market_order(&self) -> OrderRequest {
        OrderRequest::stop_market(
            &self.symbol,
            self.exit_side(),
            self.stop_loss_price,
            self.quantity,
        )
    }
}
