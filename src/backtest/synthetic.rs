use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard};

use crate::api::{CandleSource, PriceSource};
use crate::models::{Candle, Timeframe};
use crate::Result;

/// Market scenario types for synthetic candles
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MarketScenario {
    /// Every candle prints a lower low and a lower high, volume fading
    Selloff,
    /// Every candle prints a higher high and a higher low, volume fading
    Rally,
    /// Candles alternate up and down, no two consecutive extremes
    Sideways,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Seeded market simulator usable as candle and price source
///
/// Scenarios are set per symbol and timeframe (Sideways otherwise). Prices
/// come from a scripted path when one is set, else from a small random walk
/// starting at the last generated 5m close.
pub struct SyntheticMarket {
    rng: Mutex<StdRng>,
    base_price: f64,
    base_volume: f64,
    scenarios: Mutex<HashMap<(String, Timeframe), MarketScenario>>,
    price_paths: Mutex<HashMap<String, VecDeque<f64>>>,
    last_prices: Mutex<HashMap<String, f64>>,
}

impl SyntheticMarket {
    /// Create a market with a seed for reproducibility
    pub fn new(seed: u64) -> Self {
        Self {
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
            base_price: 100.0,
            base_volume: 1_000_000.0,
            scenarios: Mutex::new(HashMap::new()),
            price_paths: Mutex::new(HashMap::new()),
            last_prices: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_base_price(mut self, base_price: f64) -> Self {
        self.base_price = base_price;
        self
    }

    pub fn set_scenario(&self, symbol: &str, timeframe: Timeframe, scenario: MarketScenario) {
        lock(&self.scenarios).insert((symbol.to_string(), timeframe), scenario);
    }

    /// Same scenario on every timeframe
    pub fn set_all_scenarios(&self, symbol: &str, scenario: MarketScenario) {
        for timeframe in Timeframe::ALL {
            self.set_scenario(symbol, timeframe, scenario);
        }
    }

    /// Prices returned by `current_price`, one per call; the last one repeats
    pub fn set_price_path(&self, symbol: &str, prices: &[f64]) {
        lock(&self.price_paths).insert(symbol.to_string(), prices.iter().copied().collect());
    }

    fn scenario(&self, symbol: &str, timeframe: Timeframe) -> MarketScenario {
        lock(&self.scenarios)
            .get(&(symbol.to_string(), timeframe))
            .copied()
            .unwrap_or(MarketScenario::Sideways)
    }

    /// Generate `num_candles` candles ending at the current interval
    pub fn generate(
        &self,
        scenario: MarketScenario,
        timeframe: Timeframe,
        num_candles: usize,
    ) -> Vec<Candle> {
        let step = timeframe.duration();
        let start_time = Utc::now() - step * num_candles as i32;
        let mut rng = lock(&self.rng);

        match scenario {
            MarketScenario::Selloff => {
                self.generate_selloff(&mut rng, start_time, timeframe, num_candles)
            }
            MarketScenario::Rally => {
                self.generate_rally(&mut rng, start_time, timeframe, num_candles)
            }
            MarketScenario::Sideways => {
                self.generate_sideways(&mut rng, start_time, timeframe, num_candles)
            }
        }
    }

    /// Lows fall 0.4-1% per candle; the tight range keeps highs falling too
    fn generate_selloff(
        &self,
        rng: &mut StdRng,
        start_time: DateTime<Utc>,
        timeframe: Timeframe,
        num_candles: usize,
    ) -> Vec<Candle> {
        let mut candles = Vec::with_capacity(num_candles);
        let mut low = self.base_price * 1.05;
        let mut volume = self.base_volume * 2.0;

        for i in 0..num_candles {
            low *= 1.0 - rng.gen_range(0.004..0.01);
            volume *= rng.gen_range(0.80..0.95);
            let high = low * (1.0 + rng.gen_range(0.002..0.004));

            let open_time = start_time + timeframe.duration() * i as i32;
            candles.push(Self::candle_between(rng, open_time, low, high, volume));
        }

        candles
    }

    /// Mirror of the selloff
    fn generate_rally(
        &self,
        rng: &mut StdRng,
        start_time: DateTime<Utc>,
        timeframe: Timeframe,
        num_candles: usize,
    ) -> Vec<Candle> {
        let mut candles = Vec::with_capacity(num_candles);
        let mut high = self.base_price * 0.95;
        let mut volume = self.base_volume * 2.0;

        for i in 0..num_candles {
            high *= 1.0 + rng.gen_range(0.004..0.01);
            volume *= rng.gen_range(0.80..0.95);
            let low = high * (1.0 - rng.gen_range(0.002..0.004));

            let open_time = start_time + timeframe.duration() * i as i32;
            candles.push(Self::candle_between(rng, open_time, low, high, volume));
        }

        candles
    }

    /// Zigzag around the base price
    fn generate_sideways(
        &self,
        rng: &mut StdRng,
        start_time: DateTime<Utc>,
        timeframe: Timeframe,
        num_candles: usize,
    ) -> Vec<Candle> {
        let mut candles = Vec::with_capacity(num_candles);

        for i in 0..num_candles {
            let swing = rng.gen_range(0.002..0.006);
            let mid = if i % 2 == 0 {
                self.base_price * (1.0 + swing)
            } else {
                self.base_price * (1.0 - swing)
            };
            let range = rng.gen_range(0.002..0.004);
            let volume = self.base_volume * rng.gen_range(0.8..1.2);

            let open_time = start_time + timeframe.duration() * i as i32;
            candles.push(Self::candle_between(
                rng,
                open_time,
                mid * (1.0 - range),
                mid * (1.0 + range),
                volume,
            ));
        }

        candles
    }

    fn candle_between(
        rng: &mut StdRng,
        open_time: DateTime<Utc>,
        low: f64,
        high: f64,
        volume: f64,
    ) -> Candle {
        Candle {
            open_time,
            open: rng.gen_range(low..=high),
            high,
            low,
            close: rng.gen_range(low..=high),
            volume,
        }
    }
}

#[async_trait]
impl CandleSource for SyntheticMarket {
    async fn fetch_candles(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        limit: usize,
    ) -> Result<Vec<Candle>> {
        let candles = self.generate(self.scenario(symbol, timeframe), timeframe, limit);

        if timeframe == Timeframe::M5 {
            if let Some(last) = candles.last() {
                lock(&self.last_prices).insert(symbol.to_string(), last.close);
            }
        }

        Ok(candles)
    }
}

#[async_trait]
impl PriceSource for SyntheticMarket {
    async fn current_price(&self, symbol: &str) -> Result<f64> {
        if let Some(path) = lock(&self.price_paths).get_mut(symbol) {
            let price = if path.len() > 1 {
                path.pop_front()
            } else {
                path.front().copied()
            };
            if let Some(price) = price {
                return Ok(price);
            }
        }

        let change = lock(&self.rng).gen_range(-0.002..0.002);
        let mut last_prices = lock(&self.last_prices);
        let price = last_prices
            .entry(symbol.to_string())
            .or_insert(self.base_price);
        *price *= 1.0 + change;
        Ok(*price)
    }
}
