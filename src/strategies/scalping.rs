use super::{ParameterSpec, StrategyDescriptor, StrategyState};
use crate::candle_utils::valid_closes;
use crate::config::StrategyParams;
use crate::indicators::{calculate_ema, ema_step, last_valid};
use crate::models::*;
use crate::param_utils::{get_param_f64_clamped, get_param_usize_rounded_clamped};
use crate::strategy_utils::{hold_signal, long_signal, short_signal};

pub const NAME: &str = "scalping";

const EMA_KEY: &str = "ema";

pub const PARAMETERS: &[ParameterSpec] = &[
    ParameterSpec {
        name: "ema_period",
        default: 5.0,
        min: 2.0,
        max: 100.0,
        description: "Fast EMA the close must be on the right side of",
    },
    ParameterSpec {
        name: "volume_period",
        default: 20.0,
        min: 2.0,
        max: 200.0,
        description: "Candles in the average-volume baseline",
    },
    ParameterSpec {
        name: "volume_multiplier",
        default: 1.5,
        min: 1.0,
        max: 10.0,
        description: "Volume spike threshold relative to the baseline",
    },
];

pub fn descriptor() -> StrategyDescriptor {
    StrategyDescriptor::new(
        NAME,
        "Short-horizon momentum entries on volume spikes confirmed by a fast EMA",
        PARAMETERS,
    )
}

pub struct ScalpingStrategy {
    ema_period: usize,
    volume_period: usize,
    volume_multiplier: f64,
}

impl ScalpingStrategy {
    pub fn new(params: &StrategyParams) -> Self {
        Self {
            ema_period: get_param_usize_rounded_clamped(params, "ema_period", 5, 2, 100),
            volume_period: get_param_usize_rounded_clamped(params, "volume_period", 20, 2, 200),
            volume_multiplier: get_param_f64_clamped(
                params,
                "volume_multiplier",
                1.5,
                1.0,
                10.0,
            ),
        }
    }

    fn ema(&self, window: &[Candle], close: f64, state: &StrategyState) -> Option<f64> {
        if let (true, Some(prev)) = (state.continues(window.len()), state.get(EMA_KEY)) {
            return Some(ema_step(prev, close, self.ema_period));
        }
        calculate_ema(&valid_closes(window), self.ema_period)
            .last()
            .copied()
    }
}

impl super::Strategy for ScalpingStrategy {
    fn name(&self) -> &str {
        NAME
    }

    fn min_lookback(&self) -> usize {
        self.ema_period.max(self.volume_period) + 1
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
            .filter(|(candle, _)| candle.is_valid() && candle.volume.is_finite())
        else {
            return (hold_signal(symbol), state.clone());
        };
        let Some(ema) = self.ema(window, last.close, state) else {
            return (hold_signal(symbol), state.clone());
        };

        let mut next = state.clone();
        next.set(EMA_KEY, ema);
        next.mark_seen(window.len());

        let baseline = last_valid(history, self.volume_period);
        if baseline.len() < self.volume_period {
            return (hold_signal(symbol), next);
        }
        let avg_volume =
            baseline.iter().map(|c| c.volume).sum::<f64>() / baseline.len() as f64;
        if !(avg_volume > 0.0) {
            return (hold_signal(symbol), next);
        }
        let volume_ratio = last.volume / avg_volume;
        if volume_ratio < self.volume_multiplier {
            return (hold_signal(symbol), next);
        }

        let confidence =
            0.5 + (volume_ratio - self.volume_multiplier) / self.volume_multiplier;
        let signal = if last.close > ema && last.close > last.open {
            long_signal(symbol, confidence)
        } else if last.close < ema && last.close < last.open {
            short_signal(symbol, confidence)
        } else {
            hold_signal(symbol)
        };
        (signal, next)
    }
}
