use crate::models::Candle;

pub fn calculate_ema(prices: &[f64], period: usize) -> Vec<f64> {
    if prices.is_empty() {
        return Vec::new();
    }

    let mut ema_values = Vec::with_capacity(prices.len());
    ema_values.push(prices[0]);
    for i in 1..prices.len() {
        ema_values.push(ema_step(ema_values[i - 1], prices[i], period));
    }

    ema_values
}

pub fn ema_step(prev: f64, value: f64, period: usize) -> f64 {
    let multiplier = 2.0 / (period as f64 + 1.0);
    value * multiplier + prev * (1.0 - multiplier)
}

pub fn wilder_step(prev: f64, value: f64, period: usize) -> f64 {
    let period = period.max(1) as f64;
    (prev * (period - 1.0) + value) / period
}

pub fn rsi_from_avgs(avg_gain: f64, avg_loss: f64) -> f64 {
    if avg_loss <= 0.0 {
        if avg_gain <= 0.0 {
            50.0
        } else {
            100.0
        }
    } else {
        let rs = avg_gain / avg_loss;
        100.0 - 100.0 / (1.0 + rs)
    }
}

pub fn seed_gain_loss(prices: &[f64]) -> (f64, f64) {
    if prices.len() < 2 {
        return (0.0, 0.0);
    }
    let mut sum_gain = 0.0;
    let mut sum_loss = 0.0;
    for pair in prices.windows(2) {
        let delta = pair[1] - pair[0];
        if delta >= 0.0 {
            sum_gain += delta;
        } else {
            sum_loss -= delta;
        }
    }
    let n = (prices.len() - 1) as f64;
    (sum_gain / n, sum_loss / n)
}

/// True ranges of the valid candles in a window, oldest first. The first range has no
/// previous close and falls back to `high - low`.
pub fn true_ranges(window: &[Candle]) -> Vec<f64> {
    let mut ranges = Vec::with_capacity(window.len());
    let mut prev_close: Option<f64> = None;
    for candle in window.iter().filter(|candle| candle.is_valid()) {
        ranges.push(candle.true_range(prev_close));
        prev_close = Some(candle.close);
    }
    ranges
}

/// Rolling mean of the last `period` true ranges, or `None` when the window holds fewer than
/// `period` valid candles.
pub fn average_true_range(window: &[Candle], period: usize) -> Option<f64> {
    if period == 0 {
        return None;
    }
    // Newest first. One extra candle behind the oldest range supplies its previous close.
    let recent: Vec<&Candle> = window
        .iter()
        .rev()
        .filter(|c| c.is_valid())
        .take(period + 1)
        .collect();
    if recent.len() < period {
        return None;
    }
    let sum: f64 = recent
        .iter()
        .take(period)
        .enumerate()
        .map(|(i, candle)| candle.true_range(recent.get(i + 1).map(|prev| prev.close)))
        .sum();
    let atr = sum / period as f64;
    atr.is_finite().then_some(atr)
}

pub fn highest_high(candles: &[Candle]) -> Option<f64> {
    candles
        .iter()
        .filter(|c| c.is_valid())
        .map(|c| c.high)
        .fold(None, |acc, value| Some(acc.map_or(value, |a: f64| a.max(value))))
}

pub fn lowest_low(candles: &[Candle]) -> Option<f64> {
    candles
        .iter()
        .filter(|c| c.is_valid())
        .map(|c| c.low)
        .fold(None, |acc, value| Some(acc.map_or(value, |a: f64| a.min(value))))
}

pub fn last_valid(window: &[Candle], count: usize) -> Vec<Candle> {
    let mut tail: Vec<Candle> = window
        .iter()
        .rev()
        .filter(|c| c.is_valid())
        .take(count)
        .cloned()
        .collect();
    tail.reverse();
    tail
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone, Utc};

    fn bars(rows: &[(f64, f64, f64, f64)]) -> Vec<Candle> {
        let base = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        rows.iter()
            .enumerate()
            .map(|(i, (open, high, low, close))| Candle {
                timestamp: base + Duration::hours(i as i64),
                open: *open,
                high: *high,
                low: *low,
                close: *close,
                volume: 1_000.0,
            })
            .collect()
    }

    #[test]
    fn atr_is_mean_of_true_ranges() {
        let window = bars(&[
            (100.0, 101.0, 99.0, 100.0),
            (100.0, 101.0, 99.0, 100.0),
            (100.0, 101.0, 99.0, 100.0),
        ]);
        assert_eq!(average_true_range(&window, 3), Some(2.0));
        assert_eq!(average_true_range(&window, 4), None);
    }

    #[test]
    fn atr_uses_previous_close_for_gaps() {
        let window = bars(&[
            (100.0, 101.0, 99.0, 100.0),
            (104.0, 105.0, 103.0, 104.0),
            (104.0, 105.0, 103.0, 104.0),
        ]);
        // Ranges of the last two bars: max(2, 5, 3) = 5 and 2.
        assert_eq!(average_true_range(&window, 2), Some(3.5));
    }

    #[test]
    fn atr_skips_invalid_candles() {
        let mut window = bars(&[
            (100.0, 101.0, 99.0, 100.0),
            (100.0, 101.0, 99.0, 100.0),
            (100.0, 101.0, 99.0, 100.0),
        ]);
        window[1].high = f64::NAN;
        assert_eq!(average_true_range(&window, 2), Some(2.0));
        assert_eq!(average_true_range(&window, 3), None);
    }

    #[test]
    fn rsi_saturates_on_monotonic_series() {
        let rising: Vec<f64> = (0..15).map(|i| 100.0 + i as f64).collect();
        let (gain, loss) = seed_gain_loss(&rising);
        assert_eq!((gain, loss), (1.0, 0.0));
        assert_eq!(rsi_from_avgs(gain, loss), 100.0);
        assert_eq!(rsi_from_avgs(0.0, 0.0), 50.0);
        assert!((rsi_from_avgs(1.0, 1.0) - 50.0).abs() < 1e-12);
    }

    #[test]
    fn atr_only_reads_the_tail_of_a_long_history() {
        let mut rows = vec![(100.0, 150.0, 50.0, 100.0); 1_000];
        rows.extend([(100.0, 101.0, 99.0, 100.0); 4]);
        let window = bars(&rows);
        assert_eq!(average_true_range(&window, 3), Some(2.0));
        // With exactly `period` valid candles the oldest range has no previous close.
        assert_eq!(average_true_range(&window[1_001..], 3), Some(2.0));
    }

    #[test]
    fn ema_matches_step_function() {
        let prices = vec![10.0, 11.0, 12.0, 13.0];
        let ema = calculate_ema(&prices, 3);
        assert_eq!(ema[0], 10.0);
        assert!((ema[1] - 10.5).abs() < 1e-12);
        assert!((ema[3] - ema_step(ema[2], 13.0, 3)).abs() < 1e-12);
    }

    #[test]
    fn channel_extremes_ignore_nan() {
        let mut window = bars(&[(1.0, 5.0, 0.5, 2.0), (1.0, 9.0, 0.1, 2.0)]);
        window[1].close = f64::NAN;
        assert_eq!(highest_high(&window), Some(5.0));
        assert_eq!(lowest_low(&window), Some(0.5));
        assert_eq!(last_valid(&window, 5).len(), 1);
    }
}
