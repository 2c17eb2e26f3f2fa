use crate::models::{SignalDirection, StrategySignal};

/// Create a hold signal (default action when no trade signal is generated)
pub fn hold_signal(symbol: &str) -> StrategySignal {
    StrategySignal {
        symbol: symbol.to_string(),
        direction: SignalDirection::Hold,
        confidence: 0.0,
    }
}

pub fn long_signal(symbol: &str, confidence: f64) -> StrategySignal {
    StrategySignal {
        symbol: symbol.to_string(),
        direction: SignalDirection::Long,
        confidence: clamp_confidence(confidence),
    }
}

pub fn short_signal(symbol: &str, confidence: f64) -> StrategySignal {
    StrategySignal {
        symbol: symbol.to_string(),
        direction: SignalDirection::Short,
        confidence: clamp_confidence(confidence),
    }
}

pub fn clamp_confidence(confidence: f64) -> f64 {
    if confidence.is_finite() {
        confidence.clamp(0.0, 1.0)
    } else {
        0.0
    }
}

/// Check if confidence meets the minimum threshold
pub fn meets_confidence_threshold(confidence: f64, min_confidence: f64) -> bool {
    confidence >= min_confidence - 1e-6
}
