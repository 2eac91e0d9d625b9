use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use super::detector::{detect_reversal_pattern, PatternKind, ReversalPattern};
use crate::api::CandleSource;
use crate::models::{Direction, Timeframe};

/// Extra candles fetched beyond the analysed window
const FETCH_PADDING: usize = 10;
const MIN_ALIGNED_TIMEFRAMES: usize = 2;

/// Outcome of one multi-timeframe reversal analysis
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MtfReversalAnalysis {
    pub symbol: String,
    pub pattern_5m: Option<ReversalPattern>,
    pub pattern_15m: Option<ReversalPattern>,
    pub pattern_1h: Option<ReversalPattern>,
    pub aligned_count: usize,
    pub aligned: bool,
    pub direction: Option<Direction>,
    pub alignment_score: f64,
    /// 0.0 when no entry price could be derived
    pub entry_price: f64,
    pub reason: String,
    pub analyzed_at: DateTime<Utc>,
}

impl MtfReversalAnalysis {
    fn empty(symbol: &str, reason: String) -> Self {
        Self {
            symbol: symbol.to_string(),
            pattern_5m: None,
            pattern_15m: None,
            pattern_1h: None,
            aligned_count: 0,
            aligned: false,
            direction: None,
            alignment_score: 0.0,
            entry_price: 0.0,
            reason,
            analyzed_at: Utc::now(),
        }
    }

    pub fn pattern(&self, timeframe: Timeframe) -> Option<&ReversalPattern> {
        match timeframe {
            Timeframe::M5 => self.pattern_5m.as_ref(),
            Timeframe::M15 => self.pattern_15m.as_ref(),
            Timeframe::H1 => self.pattern_1h.as_ref(),
        }
    }

    /// Fuse per-timeframe detections into one decision
    ///
    /// At least two timeframes must agree on a direction. The score is the
    /// confidence weighted by timeframe over every detected pattern; missing
    /// timeframes contribute nothing. The entry price only ever comes from
    /// the 5m pattern.
    pub fn from_patterns(
        symbol: &str,
        pattern_5m: Option<ReversalPattern>,
        pattern_15m: Option<ReversalPattern>,
        pattern_1h: Option<ReversalPattern>,
    ) -> Self {
        let mut analysis = Self {
            pattern_5m,
            pattern_15m,
            pattern_1h,
            ..Self::empty(symbol, String::new())
        };

        let detected: Vec<(Timeframe, &ReversalPattern)> = Timeframe::ALL
            .iter()
            .filter_map(|tf| analysis.pattern(*tf).map(|p| (*tf, p)))
            .collect();

        let long_count = detected
            .iter()
            .filter(|(_, p)| p.direction == Direction::Long)
            .count();
        let short_count = detected.len() - long_count;

        let aligned_count = long_count.max(short_count);
        let aligned = aligned_count >= MIN_ALIGNED_TIMEFRAMES;

        let mut alignment_score = 0.0;
        let mut direction = None;
        let mut entry_price = 0.0;
        let reason;

        if aligned {
            alignment_score = detected
                .iter()
                .map(|(tf, p)| p.confidence * tf.weight())
                .sum();

            let majority = if long_count > short_count {
                Direction::Long
            } else {
                Direction::Short
            };
            direction = Some(majority);

            if let Some(p5) = analysis.pattern_5m.as_ref() {
                entry_price = p5.entry_reference(majority);
            }

            let agreeing: Vec<&str> = detected
                .iter()
                .filter(|(_, p)| p.direction == majority)
                .map(|(tf, _)| tf.label())
                .collect();
            reason = format!(
                "{} detected on: {}",
                PatternKind::for_direction(majority),
                agreeing.join(", ")
            );
        } else if detected.is_empty() {
            reason = "No reversal pattern detected on any timeframe".to_string();
        } else if aligned_count == 1 {
            reason = "Only 1 timeframe shows pattern - need 2+ for confirmation".to_string();
        } else {
            reason = "Insufficient timeframe alignment".to_string();
        }

        analysis.aligned_count = aligned_count;
        analysis.aligned = aligned;
        analysis.direction = direction;
        analysis.alignment_score = alignment_score;
        analysis.entry_price = entry_price;
        analysis.reason = reason;
        analysis
    }
}

/// Runs the reversal detector on 5m, 15m and 1h candles and fuses the results
#[derive(Clone)]
pub struct MtfReversalAnalyzer {
    source: Arc<dyn CandleSource>,
}

impl MtfReversalAnalyzer {
    pub fn new(source: Arc<dyn CandleSource>) -> Self {
        Self { source }
    }

    /// Analyse `symbol` with a `count`-candle window on every timeframe
    ///
    /// Fetches run sequentially (5m → 15m → 1h); the first fetch that errors
    /// or comes back short aborts the analysis as not aligned.
    pub async fn analyze(&self, symbol: &str, count: usize) -> MtfReversalAnalysis {
        let limit = count + FETCH_PADDING;
        let mut patterns: Vec<Option<ReversalPattern>> = Vec::with_capacity(3);

        for timeframe in Timeframe::ALL {
            let candles = match self.source.fetch_candles(symbol, timeframe, limit).await {
                Ok(candles) if candles.len() > count => candles,
                Ok(candles) => {
                    tracing::warn!(
                        symbol,
                        %timeframe,
                        received = candles.len(),
                        needed = count + 1,
                        "Not enough candles for reversal analysis"
                    );
                    return MtfReversalAnalysis::empty(
                        symbol,
                        format!("Failed to fetch {} klines", timeframe),
                    );
                }
                Err(e) => {
                    tracing::warn!(symbol, %timeframe, "Candle fetch failed: {}", e);
                    return MtfReversalAnalysis::empty(
                        symbol,
                        format!("Failed to fetch {} klines", timeframe),
                    );
                }
            };

            let pattern = detect_reversal_pattern(&candles, count).map(|mut p| {
                p.timeframe = Some(timeframe);
                p
            });
            patterns.push(pattern);
        }

        let mut patterns = patterns.into_iter();
        let analysis = MtfReversalAnalysis::from_patterns(
            symbol,
            patterns.next().flatten(),
            patterns.next().flatten(),
            patterns.next().flatten(),
        );

        if analysis.aligned {
            tracing::info!(
                symbol,
                direction = ?analysis.direction,
                score = analysis.alignment_score,
                entry_price = analysis.entry_price,
                "🔄 {}",
                analysis.reason
            );
        } else {
            tracing::debug!(symbol, aligned_count = analysis.aligned_count, "{}", analysis.reason);
        }

        analysis
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Candle;
    use crate::Result;
    use async_trait::async_trait;
    use chrono::Duration;
    use std::collections::HashMap;
    use std::sync::Mutex;

    fn pattern(direction: Direction, confidence: f64, low: f64, high: f64) -> ReversalPattern {
        ReversalPattern {
            kind: PatternKind::for_direction(direction),
            direction,
            candle_count: 3,
            candles: Vec::new(),
            prev_candle_low: low,
            prev_candle_high: high,
            confidence,
            timeframe: None,
            detected_at: Utc::now(),
        }
    }

    fn falling_candles(n: usize) -> Vec<Candle> {
        let start = Utc::now() - Duration::minutes(5 * n as i64);
        (0..n)
            .map(|i| {
                let low = 100.0 - i as f64;
                Candle {
                    open_time: start + Duration::minutes(5 * i as i64),
                    open: low + 1.0,
                    high: low + 2.0,
                    low,
                    close: low + 0.5,
                    volume: 1000.0,
                }
            })
            .collect()
    }

    fn rising_candles(n: usize) -> Vec<Candle> {
        falling_candles(n)
            .into_iter()
            .enumerate()
            .map(|(i, mut c)| {
                c.low = 100.0 + i as f64;
                c.high = c.low + 2.0;
                c
            })
            .collect()
    }

    /// Scripted candle source; records requested limits
    struct ScriptedCandles {
        responses: HashMap<Timeframe, std::result::Result<Vec<Candle>, String>>,
        requests: Mutex<Vec<(Timeframe, usize)>>,
    }

    impl ScriptedCandles {
        fn new(entries: Vec<(Timeframe, std::result::Result<Vec<Candle>, String>)>) -> Self {
            Self {
                responses: entries.into_iter().collect(),
                requests: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl CandleSource for ScriptedCandles {
        async fn fetch_candles(
            &self,
            _symbol: &str,
            timeframe: Timeframe,
            limit: usize,
        ) -> Result<Vec<Candle>> {
            self.requests.lock().unwrap().push((timeframe, limit));
            match self.responses.get(&timeframe) {
                Some(Ok(candles)) => Ok(candles.clone()),
                Some(Err(msg)) => Err(msg.clone().into()),
                None => Ok(Vec::new()),
            }
        }
    }

    #[test]
    fn test_two_long_patterns_align() {
        let analysis = MtfReversalAnalysis::from_patterns(
            "BTCUSDT",
            Some(pattern(Direction::Long, 80.0, 93.0, 97.0)),
            Some(pattern(Direction::Long, 60.0, 90.0, 99.0)),
            None,
        );

        assert!(analysis.aligned);
        assert_eq!(analysis.aligned_count, 2);
        assert_eq!(analysis.direction, Some(Direction::Long));
        // 80*0.5 + 60*0.3, 1h weight omitted
        assert!((analysis.alignment_score - 58.0).abs() < 1e-9);
        assert_eq!(analysis.entry_price, 93.0);
        assert_eq!(analysis.reason, "lower_lows detected on: 5m, 15m");
    }

    #[test]
    fn test_short_alignment_uses_prev_high() {
        let analysis = MtfReversalAnalysis::from_patterns(
            "ETHUSDT",
            Some(pattern(Direction::Short, 70.0, 95.0, 106.0)),
            Some(pattern(Direction::Long, 50.0, 90.0, 99.0)),
            Some(pattern(Direction::Short, 90.0, 94.0, 110.0)),
        );

        assert!(analysis.aligned);
        assert_eq!(analysis.direction, Some(Direction::Short));
        assert_eq!(analysis.entry_price, 106.0);
        assert_eq!(analysis.reason, "higher_highs detected on: 5m, 1h");
        // Every detected pattern counts toward the score
        assert!((analysis.alignment_score - (35.0 + 15.0 + 18.0)).abs() < 1e-9);
    }

    #[test]
    fn test_alignment_without_5m_has_no_entry_price() {
        let analysis = MtfReversalAnalysis::from_patterns(
            "SOLUSDT",
            None,
            Some(pattern(Direction::Long, 60.0, 90.0, 99.0)),
            Some(pattern(Direction::Long, 70.0, 88.0, 97.0)),
        );

        assert!(analysis.aligned);
        assert_eq!(analysis.direction, Some(Direction::Long));
        assert_eq!(analysis.entry_price, 0.0);
    }

    #[test]
    fn test_single_pattern_is_not_aligned() {
        let analysis = MtfReversalAnalysis::from_patterns(
            "BTCUSDT",
            Some(pattern(Direction::Long, 95.0, 93.0, 97.0)),
            None,
            None,
        );

        assert!(!analysis.aligned);
        assert_eq!(analysis.aligned_count, 1);
        assert_eq!(analysis.direction, None);
        assert_eq!(analysis.alignment_score, 0.0);
        assert_eq!(
            analysis.reason,
            "Only 1 timeframe shows pattern - need 2+ for confirmation"
        );
    }

    #[test]
    fn test_conflicting_patterns_are_not_aligned() {
        let analysis = MtfReversalAnalysis::from_patterns(
            "BTCUSDT",
            Some(pattern(Direction::Long, 95.0, 93.0, 97.0)),
            Some(pattern(Direction::Short, 95.0, 93.0, 97.0)),
            None,
        );

        assert!(!analysis.aligned);
        assert_eq!(analysis.aligned_count, 1);
    }

    #[test]
    fn test_no_patterns_reason() {
        let analysis = MtfReversalAnalysis::from_patterns("BTCUSDT", None, None, None);

        assert!(!analysis.aligned);
        assert_eq!(analysis.reason, "No reversal pattern detected on any timeframe");
    }

    #[tokio::test]
    async fn test_analyze_fetches_padded_limits_in_order() {
        let source = Arc::new(ScriptedCandles::new(vec![
            (Timeframe::M5, Ok(falling_candles(13))),
            (Timeframe::M15, Ok(falling_candles(13))),
            (Timeframe::H1, Ok(rising_candles(13))),
        ]));
        let analyzer = MtfReversalAnalyzer::new(source.clone());

        let analysis = analyzer.analyze("BTCUSDT", 3).await;

        assert_eq!(
            *source.requests.lock().unwrap(),
            vec![
                (Timeframe::M5, 13),
                (Timeframe::M15, 13),
                (Timeframe::H1, 13)
            ]
        );
        assert!(analysis.aligned);
        assert_eq!(analysis.direction, Some(Direction::Long));
        assert_eq!(analysis.pattern_5m.as_ref().unwrap().timeframe, Some(Timeframe::M5));
        assert_eq!(analysis.pattern_1h.as_ref().unwrap().direction, Direction::Short);
        // Entry zone is the candle before the current one: low 100 - 11
        assert_eq!(analysis.entry_price, 89.0);
    }

    #[tokio::test]
    async fn test_first_failed_fetch_aborts() {
        let source = Arc::new(ScriptedCandles::new(vec![
            (Timeframe::M5, Ok(falling_candles(13))),
            (Timeframe::M15, Err("timeout".to_string())),
            (Timeframe::H1, Ok(falling_candles(13))),
        ]));
        let analyzer = MtfReversalAnalyzer::new(source.clone());

        let analysis = analyzer.analyze("BTCUSDT", 3).await;

        assert!(!analysis.aligned);
        assert_eq!(analysis.reason, "Failed to fetch 15m klines");
        assert!(analysis.pattern_5m.is_none());
        // 1h never requested
        assert_eq!(source.requests.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_short_candle_history_counts_as_failure() {
        let source = Arc::new(ScriptedCandles::new(vec![(
            Timeframe::M5,
            Ok(falling_candles(3)),
        )]));
        let analyzer = MtfReversalAnalyzer::new(source);

        let analysis = analyzer.analyze("BTCUSDT", 3).await;

        assert!(!analysis.aligned);
        assert_eq!(analysis.reason, "Failed to fetch 5m klines");
    }
}
