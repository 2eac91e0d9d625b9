use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use governor::{Quota, RateLimiter};
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use serde_json::Value;
use std::num::NonZeroU32;
use std::sync::Arc;
use tokio::time::{sleep, Duration};

use super::{CandleSource, PriceSource};
use crate::models::{Candle, Timeframe};
use crate::{Error, Result};

// USDⓈ-M futures public market data
// Docs: https://developers.binance.com/docs/derivatives/usds-margined-futures/market-data/rest-api
pub const BINANCE_FUTURES_API: &str = "https://fapi.binance.com";
const MAX_RETRIES: u32 = 3;
const INITIAL_BACKOFF_MS: u64 = 500;

type MarketRateLimiter = RateLimiter<
    governor::state::direct::NotKeyed,
    governor::state::InMemoryState,
    governor::clock::DefaultClock,
>;

/// Unauthenticated Binance futures client for klines and last price
///
/// Cloneable; all clones share the same rate limiter.
#[derive(Clone)]
pub struct BinanceMarketClient {
    client: Client,
    base_url: String,
    rate_limiter: Arc<MarketRateLimiter>,
}

#[derive(Debug, Deserialize)]
struct TickerPrice {
    #[allow(dead_code)]
    symbol: String,
    price: String,
}

#[derive(Debug, Deserialize)]
struct ApiError {
    code: i64,
    msg: String,
}

impl BinanceMarketClient {
    pub fn new(requests_per_second: u32) -> Self {
        Self::with_base_url(BINANCE_FUTURES_API, requests_per_second)
    }

    /// Point the client at another host (testnet, mock server)
    pub fn with_base_url(base_url: &str, requests_per_second: u32) -> Self {
        let rps = NonZeroU32::new(requests_per_second).unwrap_or(NonZeroU32::MIN);
        let client = Client::builder()
            .timeout(std::time::Duration::from_secs(10))
            .build()
            .unwrap_or_default();

        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            rate_limiter: Arc::new(RateLimiter::direct(Quota::per_second(rps))),
        }
    }

    /// Rate-limited GET with retry on transport errors, 429 and 5xx
    async fn get(&self, path: &str, query: &[(&str, String)]) -> Result<String> {
        let url = format!("{}{}", self.base_url, path);
        let mut last_error: Option<Error> = None;

        for attempt in 1..=MAX_RETRIES {
            self.rate_limiter.until_ready().await;

            match self.client.get(&url).query(query).send().await {
                Ok(response) => {
                    let status = response.status();
                    let body = response.text().await?;

                    if status.is_success() {
                        return Ok(body);
                    }

                    if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
                        last_error = Some(if status == StatusCode::TOO_MANY_REQUESTS {
                            Error::RateLimited("binance".to_string())
                        } else {
                            Error::Exchange {
                                code: i64::from(status.as_u16()),
                                message: body,
                            }
                        });
                    } else {
                        // 4xx carries a Binance error payload; retrying will not help
                        return Err(match serde_json::from_str::<ApiError>(&body) {
                            Ok(api) => Error::Exchange {
                                code: api.code,
                                message: api.msg,
                            },
                            Err(_) => Error::Exchange {
                                code: i64::from(status.as_u16()),
                                message: body,
                            },
                        });
                    }
                }
                Err(e) => last_error = Some(e.into()),
            }

            if attempt < MAX_RETRIES {
                let backoff_ms = INITIAL_BACKOFF_MS * 2_u64.pow(attempt - 1);
                tracing::warn!(
                    path,
                    attempt,
                    backoff_ms,
                    "Binance request failed, retrying: {}",
                    last_error.as_ref().map(|e| e.to_string()).unwrap_or_default()
                );
                sleep(Duration::from_millis(backoff_ms)).await;
            }
        }

        Err(last_error.unwrap_or_else(|| "All retry attempts failed".into()))
    }
}

/// Parse `/fapi/v1/klines` rows: [openTime, open, high, low, close, volume, ...]
fn parse_klines(body: &str) -> Result<Vec<Candle>> {
    let rows: Vec<Vec<Value>> = serde_json::from_str(body)?;
    let mut candles = Vec::with_capacity(rows.len());

    for row in rows {
        if row.len() < 6 {
            return Err(format!("kline row has {} fields, expected at least 6", row.len()).into());
        }

        let open_time_ms = row[0]
            .as_i64()
            .ok_or("kline open time is not an integer")?;
        let open_time = Utc
            .timestamp_millis_opt(open_time_ms)
            .single()
            .ok_or("kline open time out of range")?;

        candles.push(Candle {
            open_time,
            open: number_field(&row[1])?,
            high: number_field(&row[2])?,
            low: number_field(&row[3])?,
            close: number_field(&row[4])?,
            volume: number_field(&row[5])?,
        });
    }

    Ok(candles)
}

/// Binance encodes decimals as strings; accept plain numbers too
fn number_field(value: &Value) -> Result<f64> {
    match value {
        Value::String(s) => Ok(s.parse()?),
        Value::Number(n) => n.as_f64().ok_or_else(|| "number out of range".into()),
        other => Err(format!("unexpected kline field: {}", other).into()),
    }
}

#[async_trait]
impl CandleSource for BinanceMarketClient {
    async fn fetch_candles(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        limit: usize,
    ) -> Result<Vec<Candle>> {
        let body = self
            .get(
                "/fapi/v1/klines",
                &[
                    ("symbol", symbol.to_string()),
                    ("interval", timeframe.label().to_string()),
                    ("limit", limit.to_string()),
                ],
            )
            .await?;

        let candles = parse_klines(&body)?;
        tracing::debug!(symbol, %timeframe, count = candles.len(), "Fetched klines");
        Ok(candles)
    }
}

#[async_trait]
impl PriceSource for BinanceMarketClient {
    async fn current_price(&self, symbol: &str) -> Result<f64> {
        let body = self
            .get("/fapi/v1/ticker/price", &[("symbol", symbol.to_string())])
            .await?;
        let ticker: TickerPrice = serde_json::from_str(&body)?;
        Ok(ticker.price.parse()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockito::Matcher;

    const KLINES_BODY: &str = r#"[
        [1700000000000,"100.0","101.5","99.0","100.5","1200.5",1700000299999,"0",10,"0","0","0"],
        [1700000300000,"100.5","102.0","98.5","101.0","900.0",1700000599999,"0",12,"0","0","0"]
    ]"#;

    #[test]
    fn test_parse_klines() {
        let candles = parse_klines(KLINES_BODY).unwrap();

        assert_eq!(candles.len(), 2);
        assert_eq!(candles[0].open, 100.0);
        assert_eq!(candles[0].high, 101.5);
        assert_eq!(candles[0].low, 99.0);
        assert_eq!(candles[0].volume, 1200.5);
        assert_eq!(candles[1].open_time.timestamp_millis(), 1_700_000_300_000);
    }

    #[test]
    fn test_parse_klines_rejects_short_rows() {
        let result = parse_klines(r#"[[1700000000000,"1.0","2.0"]]"#);
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_fetch_candles_from_mock_server() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/fapi/v1/klines")
            .match_query(Matcher::AllOf(vec![
                Matcher::UrlEncoded("symbol".into(), "BTCUSDT".into()),
                Matcher::UrlEncoded("interval".into(), "15m".into()),
                Matcher::UrlEncoded("limit".into(), "13".into()),
            ]))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(KLINES_BODY)
            .create_async()
            .await;

        let client = BinanceMarketClient::with_base_url(&server.url(), 50);
        let candles = client
            .fetch_candles("BTCUSDT", Timeframe::M15, 13)
            .await
            .unwrap();

        mock.assert_async().await;
        assert_eq!(candles.len(), 2);
        assert_eq!(candles[1].close, 101.0);
    }

    #[tokio::test]
    async fn test_current_price_from_mock_server() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("GET", "/fapi/v1/ticker/price")
            .match_query(Matcher::UrlEncoded("symbol".into(), "ETHUSDT".into()))
            .with_status(200)
            .with_body(r#"{"symbol":"ETHUSDT","price":"3021.45","time":1700000000000}"#)
            .create_async()
            .await;

        let client = BinanceMarketClient::with_base_url(&server.url(), 50);
        let price = client.current_price("ETHUSDT").await.unwrap();

        assert_eq!(price, 3021.45);
    }

    #[tokio::test]
    async fn test_client_error_is_not_retried() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/fapi/v1/ticker/price")
            .match_query(Matcher::Any)
            .with_status(400)
            .with_body(r#"{"code":-1121,"msg":"Invalid symbol."}"#)
            .expect(1)
            .create_async()
            .await;

        let client = BinanceMarketClient::with_base_url(&server.url(), 50);
        let result = client.current_price("NOPE").await;

        mock.assert_async().await;
        match result {
            Err(Error::Exchange { code, message }) => {
                assert_eq!(code, -1121);
                assert_eq!(message, "Invalid symbol.");
            }
            other => panic!("expected exchange error, got {:?}", other),
        }
    }
}
