//! Layered configuration
//!
//! Built-in defaults, then an optional TOML file, then `AUTOPILOT__*`
//! environment variables (`AUTOPILOT__ORDER_MANAGER__TAKE_PROFIT_PERCENT=4`).

use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::api::binance::BINANCE_FUTURES_API;
use crate::execution::OrderManagerConfig;
use crate::Result;

const ENV_PREFIX: &str = "AUTOPILOT";
const DEFAULT_CONFIG_FILE: &str = "autopilot";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ReversalConfig {
    /// Candles per pattern window
    pub consecutive_candles: usize,
    pub min_alignment_score: f64,
    pub scan_interval_secs: u64,
    pub symbols: Vec<String>,
}

impl Default for ReversalConfig {
    fn default() -> Self {
        Self {
            consecutive_candles: 3,
            min_alignment_score: 0.0,
            scan_interval_secs: 60,
            symbols: vec!["BTCUSDT".to_string(), "ETHUSDT".to_string()],
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ExchangeConfig {
    pub base_url: String,
    pub requests_per_second: u32,
}

impl Default for ExchangeConfig {
    fn default() -> Self {
        Self {
            base_url: BINANCE_FUTURES_API.to_string(),
            requests_per_second: 10,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct TradingConfig {
    /// Skip entry orders and number trades locally
    pub dry_run: bool,
    /// Position size in quote currency
    pub position_notional_usd: f64,
}

impl Default for TradingConfig {
    fn default() -> Self {
        Self {
            dry_run: true,
            position_notional_usd: 100.0,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct StorageConfig {
    pub database_url: Option<String>,
    pub redis_url: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AppConfig {
    pub order_manager: OrderManagerConfig,
    pub reversal: ReversalConfig,
    pub exchange: ExchangeConfig,
    pub trading: TradingConfig,
    pub storage: StorageConfig,
}

impl AppConfig {
    /// Load from `path` (or `./autopilot.toml` if present) and the environment
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = Self::load_with_prefix(path, ENV_PREFIX)?;

        // Conventional variables fill in storage when not set explicitly
        if config.storage.database_url.is_none() {
            config.storage.database_url = std::env::var("DATABASE_URL").ok();
        }
        if config.storage.redis_url.is_none() {
            config.storage.redis_url = std::env::var("REDIS_URL").ok();
        }

        Ok(config)
    }

    fn load_with_prefix(path: Option<&Path>, env_prefix: &str) -> Result<Self> {
        let mut builder = Config::builder().add_source(Config::try_from(&Self::default())?);

        builder = match path {
            Some(path) => builder.add_source(File::from(path).required(true)),
            None => builder.add_source(File::with_name(DEFAULT_CONFIG_FILE).required(false)),
        };

        let config = builder
            .add_source(
                Environment::with_prefix(env_prefix)
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true)
                    .list_separator(",")
                    .with_list_parse_key("reversal.symbols"),
            )
            .build()?
            .try_deserialize()?;

        Ok(config)
    }
}
