pub mod binance;
pub mod paper;

pub use binance::BinanceMarketClient;
pub use paper::PaperOrderGateway;

use async_trait::async_trait;

use crate::models::{Candle, OrderAck, OrderRequest, Timeframe, TrailingInfo};
use crate::Result;

/// Supplies OHLCV candles, oldest first, last element still forming
#[async_trait]
pub trait CandleSource: Send + Sync {
    async fn fetch_candles(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        limit: usize,
    ) -> Result<Vec<Candle>>;
}

/// Supplies the latest traded price for a symbol
#[async_trait]
pub trait PriceSource: Send + Sync {
    async fn current_price(&self, symbol: &str) -> Result<f64>;
}

/// Places and cancels orders on an exchange (or a simulation of one)
#[async_trait]
pub trait OrderGateway: Send + Sync {
    async fn place_order(&self, request: &OrderRequest) -> Result<OrderAck>;

    async fn cancel_order(&self, symbol: &str, order_id: i64) -> Result<()>;
}

/// Stores the trailing state of a trade across restarts
#[async_trait]
pub trait TradeRecorder: Send + Sync {
    async fn record_trailing_info(
        &self,
        trade_id: i64,
        highest_price: f64,
        lowest_price: f64,
        stop_loss: f64,
    ) -> Result<()>;

    /// Last recorded state, None when the trade is unknown
    async fn load_trailing_info(&self, trade_id: i64) -> Result<Option<TrailingInfo>>;

    /// The trade left management; its trailing state is no longer needed
    async fn close_trade(&self, trade_id: i64) -> Result<()>;
}
