/// Consecutive-extreme pattern detector
///
/// Looks at the `count` closed candles right before the still-forming one:
/// - Lower lows: every low strictly below the previous one → LONG (sellers exhausting)
/// - Higher highs: every high strictly above the previous one → SHORT (buyers exhausting)
///
/// Confidence starts at 50, grows 10 points per 1% of move (capped at +30),
/// and gets +15 when volume fades across the last three candles.
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::models::{Candle, Direction, Timeframe};

const BASE_CONFIDENCE: f64 = 50.0;
const MIN_MOVE_PCT: f64 = 0.5; // below this the move adds nothing
const MOVE_MULTIPLIER: f64 = 10.0;
const MAX_MOVE_BONUS: f64 = 30.0;
const VOLUME_EXHAUSTION_BONUS: f64 = 15.0;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum PatternKind {
    LowerLows,
    HigherHighs,
}

impl PatternKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            PatternKind::LowerLows => "lower_lows",
            PatternKind::HigherHighs => "higher_highs",
        }
    }

    pub fn direction(&self) -> Direction {
        match self {
            PatternKind::LowerLows => Direction::Long,
            PatternKind::HigherHighs => Direction::Short,
        }
    }

    /// Pattern that signals a reversal into `direction`
    pub fn for_direction(direction: Direction) -> Self {
        match direction {
            Direction::Long => PatternKind::LowerLows,
            Direction::Short => PatternKind::HigherHighs,
        }
    }
}

impl fmt::Display for PatternKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A detected reversal setup on one candle sequence
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ReversalPattern {
    pub kind: PatternKind,
    pub direction: Direction,
    pub candle_count: usize,
    /// The analysed window, oldest first
    pub candles: Vec<Candle>,
    /// Low of the entry-zone candle (the one right before the current candle)
    pub prev_candle_low: f64,
    /// High of the entry-zone candle
    pub prev_candle_high: f64,
    pub confidence: f64,
    /// Set by the multi-timeframe engine
    pub timeframe: Option<Timeframe>,
    pub detected_at: DateTime<Utc>,
}

impl ReversalPattern {
    /// Entry-zone price for a trade in `direction`: low for LONG, high for SHORT
    pub fn entry_reference(&self, direction: Direction) -> f64 {
        match direction {
            Direction::Long => self.prev_candle_low,
            Direction::Short => self.prev_candle_high,
        }
    }
}

/// Confidence for a move of `move_pct` percent, clamped to [0, 100]
pub fn confidence_for_move(move_pct: f64, volume_exhaustion: bool) -> f64 {
    let mut confidence = BASE_CONFIDENCE;

    if move_pct > MIN_MOVE_PCT {
        confidence += (move_pct * MOVE_MULTIPLIER).min(MAX_MOVE_BONUS);
    }

    if volume_exhaustion {
        confidence += VOLUME_EXHAUSTION_BONUS;
    }

    confidence.clamp(0.0, 100.0)
}

/// Window of `count` closed candles before the current one, plus the entry-zone candle
fn analysis_window(candles: &[Candle], count: usize) -> Option<(&[Candle], &Candle)> {
    if count == 0 || candles.len() < count + 1 {
        return None;
    }

    let current = candles.len() - 1;
    let window = &candles[current - count..current];
    let entry_zone = &candles[current - 1];
    Some((window, entry_zone))
}

/// Strictly decreasing volume over the three most recent window candles
fn volume_exhausted(window: &[Candle]) -> bool {
    if window.len() < 3 {
        return false;
    }

    let recent = &window[window.len() - 3..];
    recent[0].volume > recent[1].volume && recent[1].volume > recent[2].volume
}

fn build_pattern(
    kind: PatternKind,
    window: &[Candle],
    entry_zone: &Candle,
    move_pct: f64,
) -> ReversalPattern {
    let confidence = confidence_for_move(move_pct, volume_exhausted(window));

    ReversalPattern {
        kind,
        direction: kind.direction(),
        candle_count: window.len(),
        candles: window.to_vec(),
        prev_candle_low: entry_zone.low,
        prev_candle_high: entry_zone.high,
        confidence,
        timeframe: None,
        detected_at: Utc::now(),
    }
}

/// Percentage change from `from` to `to`, zero when `from` is not positive
fn pct_change(from: f64, to: f64) -> f64 {
    if from > 0.0 {
        (to - from) / from * 100.0
    } else {
        0.0
    }
}

/// Detect `count` consecutive lower lows (LONG setup)
///
/// Returns None if there is not enough data or the sequence breaks anywhere.
pub fn detect_lower_lows(candles: &[Candle], count: usize) -> Option<ReversalPattern> {
    let (window, entry_zone) = analysis_window(candles, count)?;

    for (i, pair) in window.windows(2).enumerate() {
        if pair[1].low >= pair[0].low {
            tracing::debug!(
                index = i + 1,
                low = pair[1].low,
                prev_low = pair[0].low,
                "Lower-lows sequence broken"
            );
            return None;
        }
    }

    let total_drop = -pct_change(window[0].low, window[window.len() - 1].low);
    let pattern = build_pattern(PatternKind::LowerLows, window, entry_zone, total_drop);

    tracing::debug!(
        count,
        total_drop_pct = total_drop,
        confidence = pattern.confidence,
        "Lower lows detected"
    );

    Some(pattern)
}

/// Detect `count` consecutive higher highs (SHORT setup)
pub fn detect_higher_highs(candles: &[Candle], count: usize) -> Option<ReversalPattern> {
    let (window, entry_zone) = analysis_window(candles, count)?;

    for (i, pair) in window.windows(2).enumerate() {
        if pair[1].high <= pair[0].high {
            tracing::debug!(
                index = i + 1,
                high = pair[1].high,
                prev_high = pair[0].high,
                "Higher-highs sequence broken"
            );
            return None;
        }
    }

    let total_rise = pct_change(window[0].high, window[window.len() - 1].high);
    let pattern = build_pattern(PatternKind::HigherHighs, window, entry_zone, total_rise);

    tracing::debug!(
        count,
        total_rise_pct = total_rise,
        confidence = pattern.confidence,
        "Higher highs detected"
    );

    Some(pattern)
}

/// Lower lows first, then higher highs
pub fn detect_reversal_pattern(candles: &[Candle], count: usize) -> Option<ReversalPattern> {
    detect_lower_lows(candles, count).or_else(|| detect_higher_highs(candles, count))
}
