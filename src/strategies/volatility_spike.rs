use super::{ParameterSpec, StrategyDescriptor, StrategyState};
use crate::config::StrategyParams;
use crate::indicators::{true_ranges, wilder_step};
use crate::models::*;
use crate::param_utils::{get_param_f64_clamped, get_param_usize_rounded_clamped};
use crate::strategy_utils::{hold_signal, long_signal, short_signal};

pub const NAME: &str = "volatility_spike";

const ATR_KEY: &str = "atr";
const PREV_CLOSE_KEY: &str = "prev_close";

pub const PARAMETERS: &[ParameterSpec] = &[
    ParameterSpec {
        name: "atr_period",
        default: 14.0,
        min: 2.0,
        max: 200.0,
        description: "Wilder ATR period of the volatility baseline",
    },
    ParameterSpec {
        name: "spike_multiplier",
        default: 2.0,
        min: 1.0,
        max: 10.0,
        description: "True range that counts as a spike, in multiples of the baseline ATR",
    },
];

pub fn descriptor() -> StrategyDescriptor {
    StrategyDescriptor::new(
        NAME,
        "Follows the candle body when its true range spikes above the ATR baseline",
        PARAMETERS,
    )
}

pub struct VolatilitySpikeStrategy {
    atr_period: usize,
    spike_multiplier: f64,
}

impl VolatilitySpikeStrategy {
    pub fn new(params: &StrategyParams) -> Self {
        Self {
            atr_period: get_param_usize_rounded_clamped(params, "atr_period", 14, 2, 200),
            spike_multiplier: get_param_f64_clamped(params, "spike_multiplier", 2.0, 1.0, 10.0),
        }
    }

    fn baseline(
        &self,
        window: &[Candle],
        last: &Candle,
        state: &StrategyState,
    ) -> Option<(f64, f64)> {
        if let (true, Some(atr), Some(prev_close)) = (
            state.continues(window.len()),
            state.get(ATR_KEY),
            state.get(PREV_CLOSE_KEY),
        ) {
            return Some((atr, last.true_range(Some(prev_close))));
        }

        let ranges = true_ranges(window);
        // Seed range plus `atr_period` ranges for the baseline, then the current one.
        if ranges.len() < self.atr_period + 1 {
            return None;
        }
        let (current, history) = ranges.split_last()?;
        let mut atr = history[..self.atr_period].iter().sum::<f64>() / self.atr_period as f64;
        for range in &history[self.atr_period..] {
            atr = wilder_step(atr, *range, self.atr_period);
        }
        Some((atr, *current))
    }
}

impl super::Strategy for VolatilitySpikeStrategy {
    fn name(&self) -> &str {
        NAME
    }

    fn min_lookback(&self) -> usize {
        self.atr_period + 1
    }

    fn evaluate(
        &self,
        symbol: &str,
        window: &[Candle],
        state: &StrategyState,
    ) -> (StrategySignal, StrategyState) {
        if window.len() < self.min_lookback() {
            return (hold_signal(symbol), state.clone());
        }
        let Some(last) = window.last().filter(|candle| candle.is_valid()) else {
            return (hold_signal(symbol), state.clone());
        };
        let Some((atr, range)) = self.baseline(window, last, state) else {
            return (hold_signal(symbol), state.clone());
        };

        let mut next = state.clone();
        next.set(ATR_KEY, wilder_step(atr, range, self.atr_period));
        next.set(PREV_CLOSE_KEY, last.close);
        next.mark_seen(window.len());

        if !(atr > 0.0) {
            return (hold_signal(symbol), next);
        }
        let ratio = range / atr;
        if ratio < self.spike_multiplier {
            return (hold_signal(symbol), next);
        }

        let confidence = 0.5 + (ratio - self.spike_multiplier) / self.spike_multiplier;
        let signal = if last.close > last.open {
            long_signal(symbol, confidence)
        } else if last.close < last.open {
            short_signal(symbol, confidence)
        } else {
            hold_signal(symbol)
        };
        (signal, next)
    }
}
