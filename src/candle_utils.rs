use crate::models::Candle;
use chrono::{DateTime, Utc};
use log::warn;

/// Sorts candles by timestamp and drops duplicate timestamps, keeping the first occurrence.
/// Returns the number of dropped candles.
pub fn sort_and_dedupe(symbol: &str, candles: &mut Vec<Candle>) -> usize {
    // Stable sort keeps the first occurrence of a duplicated timestamp in front.
    candles.sort_by_key(|candle| candle.timestamp);
    let before = candles.len();
    candles.dedup_by(|later, earlier| later.timestamp == earlier.timestamp);
    let dropped = before - candles.len();
    if dropped > 0 {
        warn!(
            "Dropped {} duplicate candle(s) for {} (kept first occurrence)",
            dropped, symbol
        );
    }
    dropped
}

pub fn clip_to_range(candles: &mut Vec<Candle>, start: DateTime<Utc>, end: DateTime<Utc>) {
    candles.retain(|candle| candle.timestamp >= start && candle.timestamp <= end);
}

pub fn valid_closes(window: &[Candle]) -> Vec<f64> {
    window
        .iter()
        .filter(|candle| candle.is_valid())
        .map(|candle| candle.close)
        .collect()
}

pub fn normalize_symbol(value: &str) -> Option<String> {
    let normalized = value.trim().to_uppercase();
    if normalized.is_empty() {
        None
    } else {
        Some(normalized)
    }
}
