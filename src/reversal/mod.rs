/// Reversal setups: consecutive-extreme candle patterns and their
/// multi-timeframe fusion into one entry decision.
pub mod detector;
pub mod mtf;

pub use detector::{
    confidence_for_move, detect_higher_highs, detect_lower_lows, detect_reversal_pattern,
    PatternKind, ReversalPattern,
};
pub use mtf::{MtfReversalAnalysis, MtfReversalAnalyzer};
