// Threshold decision logic
pub mod threshold;

pub use threshold::{ThresholdDecision, ThresholdEngine, DEFAULT_BUY_BUFFER_PCT};
