use super::{ParameterSpec, StrategyDescriptor, StrategyState};
use crate::candle_utils::valid_closes;
use crate::config::StrategyParams;
use crate::indicators::{calculate_ema, ema_step};
use crate::models::*;
use crate::param_utils::{get_param_f64, get_param_usize_rounded_clamped};
use crate::strategy_utils::{hold_signal, long_signal, short_signal};

pub const NAME: &str = "trend_following";

const FAST_KEY: &str = "ema_fast";
const SLOW_KEY: &str = "ema_slow";

pub const PARAMETERS: &[ParameterSpec] = &[
    ParameterSpec {
        name: "fast_period",
        default: 9.0,
        min: 2.0,
        max: 200.0,
        description: "Fast EMA period",
    },
    ParameterSpec {
        name: "slow_period",
        default: 21.0,
        min: 3.0,
        max: 400.0,
        description: "Slow EMA period",
    },
    ParameterSpec {
        name: "confidence_scale",
        default: 50.0,
        min: 1.0,
        max: 1_000.0,
        description: "Confidence gained per unit of fractional EMA separation",
    },
];

pub fn descriptor() -> StrategyDescriptor {
    StrategyDescriptor::new(
        NAME,
        "Goes with the trend when the fast EMA crosses the slow EMA",
        PARAMETERS,
    )
}

pub struct TrendFollowingStrategy {
    fast_period: usize,
    slow_period: usize,
    confidence_scale: f64,
}

impl TrendFollowingStrategy {
    pub fn new(params: &StrategyParams) -> Self {
        let fast_period = get_param_usize_rounded_clamped(params, "fast_period", 9, 2, 200);
        let slow_period = get_param_usize_rounded_clamped(params, "slow_period", 21, 3, 400);
        // A crossover needs two distinct averages.
        let slow_period = slow_period.max(fast_period + 1);
        Self {
            fast_period,
            slow_period,
            confidence_scale: get_param_f64(params, "confidence_scale", 50.0),
        }
    }

    /// Previous and current (fast, slow) averages, folding in only the newest close when the
    /// carried state is current.
    fn averages(
        &self,
        window: &[Candle],
        close: f64,
        state: &StrategyState,
    ) -> Option<((f64, f64), (f64, f64))> {
        if let (true, Some(fast), Some(slow)) = (
            state.continues(window.len()),
            state.get(FAST_KEY),
            state.get(SLOW_KEY),
        ) {
            let next = (
                ema_step(fast, close, self.fast_period),
                ema_step(slow, close, self.slow_period),
            );
            return Some(((fast, slow), next));
        }

        let closes = valid_closes(window);
        let n = closes.len();
        if n < 2 {
            return None;
        }
        let fast = calculate_ema(&closes, self.fast_period);
        let slow = calculate_ema(&closes, self.slow_period);
        Some(((fast[n - 2], slow[n - 2]), (fast[n - 1], slow[n - 1])))
    }
}

impl super::Strategy for TrendFollowingStrategy {
    fn name(&self) -> &str {
        NAME
    }

    fn min_lookback(&self) -> usize {
        self.slow_period + 1
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
        let Some(((prev_fast, prev_slow), (fast, slow))) =
            self.averages(window, last.close, state)
        else {
            return (hold_signal(symbol), state.clone());
        };

        let mut next = state.clone();
        next.set(FAST_KEY, fast);
        next.set(SLOW_KEY, slow);
        next.mark_seen(window.len());

        if slow <= 0.0 {
            return (hold_signal(symbol), next);
        }
        let separation = (fast - slow).abs() / slow;
        let confidence = 0.5 + separation * self.confidence_scale;

        let signal = if prev_fast <= prev_slow && fast > slow {
            long_signal(symbol, confidence)
        } else if prev_fast >= prev_slow && fast < slow {
            short_signal(symbol, confidence)
        } else {
            hold_signal(symbol)
        };
        (signal, next)
    }
}
