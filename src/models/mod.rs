use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// OHLCV candlestick, ordered oldest first in any sequence
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Candle {
    pub open_time: DateTime<Utc>,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

/// Candle intervals inspected by the multi-timeframe engine
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum Timeframe {
    #[serde(rename = "5m")]
    M5,
    #[serde(rename = "15m")]
    M15,
    #[serde(rename = "1h")]
    H1,
}

impl Timeframe {
    /// Fetch order used by the alignment engine
    pub const ALL: [Timeframe; 3] = [Timeframe::M5, Timeframe::M15, Timeframe::H1];

    /// Exchange interval label
    pub fn label(&self) -> &'static str {
        match self {
            Timeframe::M5 => "5m",
            Timeframe::M15 => "15m",
            Timeframe::H1 => "1h",
        }
    }

    /// Weight of this timeframe in the alignment score
    pub fn weight(&self) -> f64 {
        match self {
            Timeframe::M5 => 0.5,
            Timeframe::M15 => 0.3,
            Timeframe::H1 => 0.2,
        }
    }

    pub fn duration(&self) -> Duration {
        match self {
            Timeframe::M5 => Duration::minutes(5),
            Timeframe::M15 => Duration::minutes(15),
            Timeframe::H1 => Duration::hours(1),
        }
    }
}

impl fmt::Display for Timeframe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Trade direction implied by a reversal setup
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "UPPERCASE")]
pub enum Direction {
    Long,
    Short,
}

impl Direction {
    /// Order side that opens a position in this direction
    pub fn entry_side(&self) -> Side {
        match self {
            Direction::Long => Side::Buy,
            Direction::Short => Side::Sell,
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Long => f.write_str("LONG"),
            Direction::Short => f.write_str("SHORT"),
        }
    }
}

/// Order / position side
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "UPPERCASE")]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    /// Side of the orders that close a position opened on this side
    pub fn opposite(&self) -> Side {
        match self {
            Side::Buy => Side::Sell,
            Side::Sell => Side::Buy,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Side::Buy => "BUY",
            Side::Sell => "SELL",
        }
    }
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderType {
    Limit,
    StopLossLimit,
    StopLoss,
}

impl OrderType {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderType::Limit => "LIMIT",
            OrderType::StopLossLimit => "STOP_LOSS_LIMIT",
            OrderType::StopLoss => "STOP_LOSS",
        }
    }
}

impl fmt::Display for OrderType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum TimeInForce {
    #[serde(rename = "GTC")]
    Gtc,
}

impl TimeInForce {
    pub fn as_str(&self) -> &'static str {
        match self {
            TimeInForce::Gtc => "GTC",
        }
    }
}

/// Order placement parameters
///
/// Typed view over the exchange parameter map. `params()` renders the
/// key/value list an exchange adapter sends on the wire.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OrderRequest {
    pub symbol: String,
    pub side: Side,
    pub order_type: OrderType,
    pub time_in_force: Option<TimeInForce>,
    pub price: Option<f64>,
    pub stop_price: Option<f64>,
    pub quantity: f64,
    pub client_order_id: String,
}

impl OrderRequest {
    fn new(symbol: &str, side: Side, order_type: OrderType, quantity: f64) -> Self {
        Self {
            symbol: symbol.to_string(),
            side,
            order_type,
            time_in_force: None,
            price: None,
            stop_price: None,
            quantity,
            client_order_id: Uuid::new_v4().simple().to_string(),
        }
    }

    /// GTC limit order
    pub fn limit(symbol: &str, side: Side, price: f64, quantity: f64) -> Self {
        Self {
            time_in_force: Some(TimeInForce::Gtc),
            price: Some(price),
            ..Self::new(symbol, side, OrderType::Limit, quantity)
        }
    }

    /// GTC stop-limit order triggering at `stop_price` and resting at `limit_price`
    pub fn stop_loss_limit(
        symbol: &str,
        side: Side,
        stop_price: f64,
        limit_price: f64,
        quantity: f64,
    ) -> Self {
        Self {
            time_in_force: Some(TimeInForce::Gtc),
            price: Some(limit_price),
            stop_price: Some(stop_price),
            ..Self::new(symbol, side, OrderType::StopLossLimit, quantity)
        }
    }

    /// Stop order that executes at market once `stop_price` trades
    pub fn stop_market(symbol: &str, side: Side, stop_price: f64, quantity: f64) -> Self {
        Self {
            time_in_force: Some(TimeInForce::Gtc),
            stop_price: Some(stop_price),
            ..Self::new(symbol, side, OrderType::StopLoss, quantity)
        }
    }

    /// Exchange parameter list, prices and quantity at 8 decimals
    pub fn params(&self) -> Vec<(&'static str, String)> {
        let mut params = vec![
            ("symbol", self.symbol.clone()),
            ("side", self.side.as_str().to_string()),
            ("type", self.order_type.as_str().to_string()),
            ("quantity", format!("{:.8}", self.quantity)),
            ("newClientOrderId", self.client_order_id.clone()),
        ];
        if let Some(tif) = self.time_in_force {
            params.push(("timeInForce", tif.as_str().to_string()));
        }
        if let Some(price) = self.price {
            params.push(("price", format!("{:.8}", price)));
        }
        if let Some(stop) = self.stop_price {
            params.push(("stopPrice", format!("{:.8}", stop)));
        }
        params
    }
}

/// Exchange acknowledgement of a placed order
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct OrderAck {
    pub order_id: i64,
}

/// Persisted trailing state of a trade
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TrailingInfo {
    pub trade_id: i64,
    pub highest_price: f64,
    pub lowest_price: f64,
    pub stop_loss: f64,
    pub updated_at: DateTime<Utc>,
}
