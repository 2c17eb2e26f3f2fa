use super::{ParameterSpec, StrategyDescriptor, StrategyState};
use crate::candle_utils::valid_closes;
use crate::config::StrategyParams;
use crate::indicators::{rsi_from_avgs, seed_gain_loss, wilder_step};
use crate::models::*;
use crate::param_utils::{get_param_f64_clamped, get_param_usize_rounded_clamped};
use crate::strategy_utils::{hold_signal, long_signal, short_signal};

pub const NAME: &str = "mean_reversion";

const AVG_GAIN_KEY: &str = "avg_gain";
const AVG_LOSS_KEY: &str = "avg_loss";
const PREV_CLOSE_KEY: &str = "prev_close";

pub const PARAMETERS: &[ParameterSpec] = &[
    ParameterSpec {
        name: "period",
        default: 14.0,
        min: 2.0,
        max: 100.0,
        description: "RSI period (Wilder smoothing)",
    },
    ParameterSpec {
        name: "oversold",
        default: 30.0,
        min: 1.0,
        max: 50.0,
        description: "RSI level below which the strategy buys",
    },
    ParameterSpec {
        name: "overbought",
        default: 70.0,
        min: 50.0,
        max: 99.0,
        description: "RSI level above which the strategy sells short",
    },
];

pub fn descriptor() -> StrategyDescriptor {
    StrategyDescriptor::new(
        NAME,
        "Fades RSI extremes back toward the mean",
        PARAMETERS,
    )
}

pub struct MeanReversionStrategy {
    period: usize,
    oversold: f64,
    overbought: f64,
}

impl MeanReversionStrategy {
    pub fn new(params: &StrategyParams) -> Self {
        Self {
            period: get_param_usize_rounded_clamped(params, "period", 14, 2, 100),
            oversold: get_param_f64_clamped(params, "oversold", 30.0, 1.0, 50.0),
            overbought: get_param_f64_clamped(params, "overbought", 70.0, 50.0, 99.0),
        }
    }

    /// Wilder averages after folding in `close`, or `None` while fewer than `period + 1`
    /// valid closes exist.
    fn averages(&self, window: &[Candle], close: f64, state: &StrategyState) -> Option<(f64, f64)> {
        if let (true, Some(gain), Some(loss), Some(prev)) = (
            state.continues(window.len()),
            state.get(AVG_GAIN_KEY),
            state.get(AVG_LOSS_KEY),
            state.get(PREV_CLOSE_KEY),
        ) {
            let delta = close - prev;
            return Some((
                wilder_step(gain, delta.max(0.0), self.period),
                wilder_step(loss, (-delta).max(0.0), self.period),
            ));
        }

        let closes = valid_closes(window);
        if closes.len() < self.period + 1 {
            return None;
        }
        let (mut gain, mut loss) = seed_gain_loss(&closes[..=self.period]);
        for pair in closes[self.period..].windows(2) {
            let delta = pair[1] - pair[0];
            gain = wilder_step(gain, delta.max(0.0), self.period);
            loss = wilder_step(loss, (-delta).max(0.0), self.period);
        }
        Some((gain, loss))
    }
}

impl super::Strategy for MeanReversionStrategy {
    fn name(&self) -> &str {
        NAME
    }

    fn min_lookback(&self) -> usize {
        self.period + 1
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
        let Some((avg_gain, avg_loss)) = self.averages(window, last.close, state) else {
            return (hold_signal(symbol), state.clone());
        };

        let mut next = state.clone();
        next.set(AVG_GAIN_KEY, avg_gain);
        next.set(AVG_LOSS_KEY, avg_loss);
        next.set(PREV_CLOSE_KEY, last.close);
        next.mark_seen(window.len());

        let rsi = rsi_from_avgs(avg_gain, avg_loss);
        let signal = if rsi < self.oversold {
            long_signal(symbol, (self.oversold - rsi) / self.oversold + 0.5)
        } else if rsi > self.overbought {
            short_signal(
                symbol,
                (rsi - self.overbought) / (100.0 - self.overbought) + 0.5,
            )
        } else {
            hold_signal(symbol)
        };
        (signal, next)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::strategy::Strategy;
    use chrono::{Duration, TimeZone, Utc};

    fn series(closes: &[f64]) -> Vec<Candle> {
        let base = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        closes
            .iter()
            .enumerate()
            .map(|(i, close)| Candle {
                timestamp: base + Duration::hours(i as i64),
                open: *close,
                high: close + 0.5,
                low: close - 0.5,
                close: *close,
                volume: 1_000.0,
            })
            .collect()
    }

    #[test]
    fn sell_off_triggers_long() {
        let closes: Vec<f64> = (0..20).map(|i| 100.0 - i as f64).collect();
        let candles = series(&closes);
        let strategy = MeanReversionStrategy::new(&StrategyParams::new());
        let (signal, state) = strategy.evaluate("ETHUSDT", &candles, &StrategyState::new());
        assert_eq!(signal.direction, SignalDirection::Long);
        assert_eq!(signal.confidence, 1.0);
        assert_eq!(state.get(PREV_CLOSE_KEY), Some(81.0));
    }

    #[test]
    fn carried_averages_track_batch_rsi() {
        let closes: Vec<f64> = (0..40)
            .map(|i| 100.0 + ((i as f64) * 0.9).cos() * 4.0)
            .collect();
        let candles = series(&closes);
        let strategy = MeanReversionStrategy::new(&StrategyParams::new());

        let mut state = StrategyState::new();
        for end in 1..=candles.len() {
            state = strategy.evaluate("ETHUSDT", &candles[..end], &state).1;
        }
        let carried = rsi_from_avgs(
            state.get(AVG_GAIN_KEY).unwrap(),
            state.get(AVG_LOSS_KEY).unwrap(),
        );
        let (_, fresh) = strategy.evaluate("ETHUSDT", &candles, &StrategyState::new());
        let batch = rsi_from_avgs(
            fresh.get(AVG_GAIN_KEY).unwrap(),
            fresh.get(AVG_LOSS_KEY).unwrap(),
        );
        assert!((carried - batch).abs() < 1e-9);
    }

    #[test]
    fn nan_candle_leaves_state_unchanged() {
        let closes: Vec<f64> = (0..20).map(|i| 100.0 + i as f64).collect();
        let mut candles = series(&closes);
        let strategy = MeanReversionStrategy::new(&StrategyParams::new());
        let (_, state) = strategy.evaluate("ETHUSDT", &candles[..19], &StrategyState::new());
        candles[19].close = f64::NAN;
        let (signal, after) = strategy.evaluate("ETHUSDT", &candles, &state);
        assert_eq!(signal.direction, SignalDirection::Hold);
        assert_eq!(after, state);
    }
}
