use super::{ParameterSpec, StrategyDescriptor, StrategyState};
use crate::config::StrategyParams;
use crate::indicators::{highest_high, last_valid, lowest_low};
use crate::models::*;
use crate::param_utils::{get_param_f64_clamped, get_param_usize_rounded_clamped};
use crate::strategy_utils::{hold_signal, long_signal, short_signal};

pub const NAME: &str = "breakout";

const UPPER_KEY: &str = "channel_upper";
const LOWER_KEY: &str = "channel_lower";

pub const PARAMETERS: &[ParameterSpec] = &[
    ParameterSpec {
        name: "lookback",
        default: 20.0,
        min: 2.0,
        max: 500.0,
        description: "Donchian channel length in candles (excluding the current one)",
    },
    ParameterSpec {
        name: "min_range_pct",
        default: 0.01,
        min: 0.0,
        max: 0.5,
        description: "Minimum channel width as a fraction of the channel low",
    },
];

pub fn descriptor() -> StrategyDescriptor {
    StrategyDescriptor::new(
        NAME,
        "Trades closes outside the prior Donchian channel when the channel is wide enough",
        PARAMETERS,
    )
}

pub struct BreakoutStrategy {
    lookback: usize,
    min_range_pct: f64,
}

impl BreakoutStrategy {
    pub fn new(params: &StrategyParams) -> Self {
        Self {
            lookback: get_param_usize_rounded_clamped(params, "lookback", 20, 2, 500),
            min_range_pct: get_param_f64_clamped(params, "min_range_pct", 0.01, 0.0, 0.5),
        }
    }
}

impl super::Strategy for BreakoutStrategy {
    fn name(&self) -> &str {
        NAME
    }

    fn min_lookback(&self) -> usize {
        self.lookback + 1
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
        let Some((last, history)) = window
            .split_last()
            .filter(|(candle, _)| candle.is_valid())
        else {
            return (hold_signal(symbol), state.clone());
        };

        let channel = last_valid(history, self.lookback);
        if channel.len() < self.lookback {
            return (hold_signal(symbol), state.clone());
        }
        let (Some(upper), Some(lower)) = (highest_high(&channel), lowest_low(&channel)) else {
            return (hold_signal(symbol), state.clone());
        };

        let mut next = state.clone();
        next.set(UPPER_KEY, upper);
        next.set(LOWER_KEY, lower);
        next.mark_seen(window.len());

        let width = upper - lower;
        // Flat or too-narrow channels carry no breakout information.
        if lower <= 0.0 || width <= 0.0 || width / lower < self.min_range_pct {
            return (hold_signal(symbol), next);
        }

        let signal = if last.close > upper {
            long_signal(symbol, 0.5 + (last.close - upper) / width)
        } else if last.close < lower {
            short_signal(symbol, 0.5 + (lower - last.close) / width)
        } else {
            hold_signal(symbol)
        };
        (signal, next)
    }
}
