use async_trait::async_trait;
use chrono::Utc;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client};
use tokio::time::{timeout, Duration};

use crate::api::TradeRecorder;
use crate::models::TrailingInfo;
use crate::Result;

/// Trailing state expires a week after the last write
const TRAILING_TTL_SECS: u64 = 7 * 24 * 60 * 60;

fn trailing_key(trade_id: i64) -> String {
    format!("trailing:{}", trade_id)
}

/// Redis store for the latest trailing state of each trade
///
/// One JSON value per trade under `trailing:{trade_id}`.
#[derive(Clone)]
pub struct RedisTrailingStore {
    conn: ConnectionManager,
}

impl RedisTrailingStore {
    /// Connect to Redis
    ///
    /// # Arguments
    /// * `redis_url` - Redis connection URL (e.g., "redis://127.0.0.1:6379")
    pub async fn new(redis_url: &str) -> Result<Self> {
        let client = Client::open(redis_url)?;

        let conn = timeout(Duration::from_secs(5), ConnectionManager::new(client))
            .await
            .map_err(|_| "Redis connection timeout after 5 seconds")??;

        tracing::info!("Connected to Redis at {}", redis_url);

        Ok(Self { conn })
    }

    pub async fn save_trailing_info(&self, info: &TrailingInfo) -> Result<()> {
        let mut conn = self.conn.clone();
        let json = serde_json::to_string(info)?;

        let _: () = conn
            .set_ex(trailing_key(info.trade_id), json, TRAILING_TTL_SECS)
            .await?;

        tracing::debug!(trade_id = info.trade_id, "Saved trailing info to Redis");
        Ok(())
    }

    pub async fn clear_trailing_info(&self, trade_id: i64) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: () = conn.del(trailing_key(trade_id)).await?;
        Ok(())
    }
}

#[async_trait]
impl TradeRecorder for RedisTrailingStore {
    async fn record_trailing_info(
        &self,
        trade_id: i64,
        highest_price: f64,
        lowest_price: f64,
        stop_loss: f64,
    ) -> Result<()> {
        self.save_trailing_info(&TrailingInfo {
            trade_id,
            highest_price,
            lowest_price,
            stop_loss,
            updated_at: Utc::now(),
        })
        .await
    }

    async fn load_trailing_info(&self, trade_id: i64) -> Result<Option<TrailingInfo>> {
        let mut conn = self.conn.clone();
        let json: Option<String> = conn.get(trailing_key(trade_id)).await?;

        match json {
            Some(json) => Ok(Some(serde_json::from_str(&json)?)),
            None => Ok(None),
        }
    }

    async fn close_trade(&self, trade_id: i64) -> Result<()> {
        self.clear_trailing_info(trade_id).await
    }
}
