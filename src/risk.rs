use crate::config::{BacktestConfig, RiskSettings, StopMode};
use crate::error::BacktestError;
use crate::indicators::{average_true_range, highest_high, last_valid, lowest_low};
use crate::models::{Candle, Side};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Stop distance used when ATR cannot be computed, as a fraction of the entry price.
pub const DEFAULT_FALLBACK_STOP_PCT: f64 = 0.02;

/// Structure stops never sit closer than this fraction of the entry price.
pub const MIN_STRUCTURE_STOP_PCT: f64 = 0.005;

/// `(balance * risk_fraction) / stop_distance`.
///
/// A non-positive stop distance or a non-positive result is a risk calculation error; callers
/// skip the signal.
pub fn position_size(
    balance: f64,
    risk_fraction: f64,
    stop_distance: f64,
) -> Result<f64, BacktestError> {
    if !stop_distance.is_finite() || stop_distance <= 0.0 {
        return Err(BacktestError::risk(format!(
            "invalid stop distance {}",
            stop_distance
        )));
    }
    let quantity = balance * risk_fraction / stop_distance;
    if !quantity.is_finite() || quantity <= 0.0 {
        return Err(BacktestError::risk(format!(
            "position size {} is not positive (balance {}, risk fraction {})",
            quantity, balance, risk_fraction
        )));
    }
    Ok(quantity)
}

pub fn percent_stop(entry_price: f64, side: Side, pct: f64) -> f64 {
    entry_price * (1.0 - side.sign() * pct)
}

/// `entry ∓ multiplier × ATR`, or the percentage stop when the window is shorter than the
/// ATR period or has no range at all.
pub fn atr_stop(
    window: &[Candle],
    entry_price: f64,
    side: Side,
    atr_period: usize,
    atr_multiplier: f64,
    fallback_pct: f64,
) -> f64 {
    match average_true_range(window, atr_period) {
        Some(atr) if atr > 0.0 => entry_price - side.sign() * atr_multiplier * atr,
        _ => percent_stop(entry_price, side, fallback_pct),
    }
}

/// Beyond the extreme low (long) or high (short) of the last `lookback` candles, padded by
/// `buffer_pct` and never closer than [`MIN_STRUCTURE_STOP_PCT`] to the entry.
pub fn structure_stop(
    window: &[Candle],
    entry_price: f64,
    side: Side,
    lookback: usize,
    buffer_pct: f64,
) -> f64 {
    let recent = last_valid(window, lookback);
    let extreme = match side {
        Side::Long => lowest_low(&recent).map(|low| low * (1.0 - buffer_pct)),
        Side::Short => highest_high(&recent).map(|high| high * (1.0 + buffer_pct)),
    };
    let closest = percent_stop(entry_price, side, MIN_STRUCTURE_STOP_PCT);
    extreme.map_or(closest, |stop| at_least_min_distance(entry_price, stop, side))
}

fn at_least_min_distance(entry_price: f64, stop: f64, side: Side) -> f64 {
    let closest = percent_stop(entry_price, side, MIN_STRUCTURE_STOP_PCT);
    match side {
        Side::Long => stop.min(closest),
        Side::Short => stop.max(closest),
    }
}

/// Target price per named level at `ratio` times the entry-to-stop distance.
pub fn take_profit_levels(
    entry_price: f64,
    stop_loss_price: f64,
    side: Side,
    rr_ratios: &BTreeMap<String, f64>,
) -> Result<BTreeMap<String, f64>, BacktestError> {
    let risk = (entry_price - stop_loss_price).abs();
    if !risk.is_finite() || risk <= 0.0 {
        return Err(BacktestError::risk(format!(
            "invalid stop distance {} for take-profit levels",
            risk
        )));
    }
    if rr_ratios.is_empty() {
        return Err(BacktestError::risk("no risk-reward ratios configured"));
    }
    let mut levels = BTreeMap::new();
    for (name, ratio) in rr_ratios {
        if !ratio.is_finite() || *ratio <= 0.0 {
            return Err(BacktestError::risk(format!(
                "invalid risk-reward ratio {} for {}",
                ratio, name
            )));
        }
        let price = entry_price + side.sign() * risk * ratio;
        if !price.is_finite() || price <= 0.0 {
            return Err(BacktestError::risk(format!(
                "take-profit {} resolves to non-positive price {}",
                name, price
            )));
        }
        levels.insert(name.clone(), price);
    }
    Ok(levels)
}

/// Ratchets a stop toward price by `multiplier × atr` and never loosens it.
pub fn trailing_stop(
    current_price: f64,
    prior_stop: f64,
    atr: f64,
    side: Side,
    multiplier: f64,
) -> f64 {
    let candidate = current_price - side.sign() * multiplier * atr;
    if !candidate.is_finite() {
        return prior_stop;
    }
    match side {
        Side::Long => prior_stop.max(candidate),
        Side::Short => prior_stop.min(candidate),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MarketRegime {
    BaseAssetDominant,
    AltLed,
    Neutral,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RegimeMultipliers {
    pub stop_distance: f64,
    pub rr_ratio: f64,
}

impl MarketRegime {
    /// | regime              | asset | stop × | rr × |
    /// |---------------------|-------|--------|------|
    /// | base-asset-dominant | base  | 1.0    | 1.2  |
    /// | base-asset-dominant | alt   | 1.3    | 0.8  |
    /// | alt-led             | base  | 1.1    | 0.9  |
    /// | alt-led             | alt   | 0.9    | 1.3  |
    /// | neutral             | any   | 1.0    | 1.0  |
    pub fn multipliers(self, is_base_asset: bool) -> RegimeMultipliers {
        let (stop_distance, rr_ratio) = match (self, is_base_asset) {
            (MarketRegime::BaseAssetDominant, true) => (1.0, 1.2),
            (MarketRegime::BaseAssetDominant, false) => (1.3, 0.8),
            (MarketRegime::AltLed, true) => (1.1, 0.9),
            (MarketRegime::AltLed, false) => (0.9, 1.3),
            (MarketRegime::Neutral, _) => (1.0, 1.0),
        };
        RegimeMultipliers {
            stop_distance,
            rr_ratio,
        }
    }
}

pub fn adaptive_stop(
    entry_price: f64,
    stop_loss_price: f64,
    side: Side,
    regime: MarketRegime,
    is_base_asset: bool,
) -> f64 {
    let distance = (entry_price - stop_loss_price).abs();
    let scaled = distance * regime.multipliers(is_base_asset).stop_distance;
    entry_price - side.sign() * scaled
}

pub fn adaptive_take_profit(
    rr_ratios: &BTreeMap<String, f64>,
    regime: MarketRegime,
    is_base_asset: bool,
) -> BTreeMap<String, f64> {
    let factor = regime.multipliers(is_base_asset).rr_ratio;
    rr_ratios
        .iter()
        .map(|(name, ratio)| (name.clone(), ratio * factor))
        .collect()
}

#[derive(Debug, Clone, PartialEq)]
pub struct EntryPlan {
    pub stop_loss: f64,
    pub take_profits: BTreeMap<String, f64>,
    pub quantity: f64,
    pub initial_risk: f64,
}

/// Long: `stop < entry < min(targets)`; short: `stop > entry > max(targets)`.
pub fn check_ordering(
    entry_price: f64,
    stop_loss: f64,
    take_profits: &BTreeMap<String, f64>,
    side: Side,
) -> Result<(), BacktestError> {
    let ordered = match side {
        Side::Long => {
            stop_loss < entry_price && take_profits.values().all(|tp| *tp > entry_price)
        }
        Side::Short => {
            stop_loss > entry_price && take_profits.values().all(|tp| *tp < entry_price)
        }
    };
    if !ordered || take_profits.is_empty() {
        return Err(BacktestError::risk(format!(
            "{} levels out of order: stop {} entry {} targets {:?}",
            side.as_str(),
            stop_loss,
            entry_price,
            take_profits
        )));
    }
    Ok(())
}

#[derive(Debug, Clone)]
pub struct RiskEngine {
    settings: RiskSettings,
    risk_per_trade_fraction: f64,
}

impl RiskEngine {
    pub fn new(settings: RiskSettings, risk_per_trade_fraction: f64) -> Self {
        Self {
            settings,
            risk_per_trade_fraction,
        }
    }

    pub fn from_config(config: &BacktestConfig) -> Self {
        Self::new(config.risk.clone(), config.risk_per_trade_fraction)
    }

    fn base_stop(&self, window: &[Candle], entry_price: f64, side: Side) -> f64 {
        let settings = &self.settings;
        match settings.stop_mode {
            StopMode::Atr => atr_stop(
                window,
                entry_price,
                side,
                settings.atr_period,
                settings.atr_multiplier,
                settings.fallback_stop_pct,
            ),
            StopMode::Structure => structure_stop(
                window,
                entry_price,
                side,
                settings.structure_lookback,
                settings.structure_buffer_pct,
            ),
            StopMode::Percent => percent_stop(entry_price, side, settings.fallback_stop_pct),
        }
    }

    /// Stop, targets and size for a new position entered at `entry_price`, sized against
    /// `balance`. `window` ends with the signal candle.
    pub fn plan_entry(
        &self,
        symbol: &str,
        window: &[Candle],
        entry_price: f64,
        side: Side,
        balance: f64,
    ) -> Result<EntryPlan, BacktestError> {
        if !entry_price.is_finite() || entry_price <= 0.0 {
            return Err(BacktestError::risk(format!(
                "invalid entry price {} for {}",
                entry_price, symbol
            )));
        }

        let mut stop_loss = self.base_stop(window, entry_price, side);
        let mut rr_ratios = self.settings.rr_ratios.clone();
        if let Some(regime) = self.settings.market_regime {
            let is_base = self.settings.is_base_asset(symbol);
            stop_loss = adaptive_stop(entry_price, stop_loss, side, regime, is_base);
            rr_ratios = adaptive_take_profit(&rr_ratios, regime, is_base);
            if self.settings.stop_mode == StopMode::Structure {
                stop_loss = at_least_min_distance(entry_price, stop_loss, side);
            }
        }
        if !stop_loss.is_finite() || stop_loss <= 0.0 {
            return Err(BacktestError::risk(format!(
                "stop {} for {} is not a positive price",
                stop_loss, symbol
            )));
        }

        let stop_distance = (entry_price - stop_loss).abs();
        let quantity = position_size(balance, self.risk_per_trade_fraction, stop_distance)?;
        let take_profits = take_profit_levels(entry_price, stop_loss, side, &rr_ratios)?;
        check_ordering(entry_price, stop_loss, &take_profits, side)?;

        Ok(EntryPlan {
            stop_loss,
            take_profits,
            quantity,
            initial_risk: stop_distance * quantity,
        })
    }

    /// Trailing update from the previous bar's close and ATR. `None` while disabled or
    /// before an ATR exists.
    pub fn trail(&self, window: &[Candle], current_stop: f64, side: Side) -> Option<f64> {
        if !self.settings.trailing_stop {
            return None;
        }
        let prior = window.iter().rev().find(|candle| candle.is_valid())?;
        let atr = average_true_range(window, self.settings.atr_period)?;
        Some(trailing_stop(
            prior.close,
            current_stop,
            atr,
            side,
            self.settings.trailing_atr_multiplier,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone, Utc};

    fn flat_bars(count: usize, high: f64, low: f64, close: f64) -> Vec<Candle> {
        let base = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        (0..count)
            .map(|i| Candle {
                timestamp: base + Duration::hours(i as i64),
                open: close,
                high,
                low,
                close,
                volume: 1_000.0,
            })
            .collect()
    }

    fn ratios(pairs: &[(&str, f64)]) -> BTreeMap<String, f64> {
        pairs
            .iter()
            .map(|(name, ratio)| (name.to_string(), *ratio))
            .collect()
    }

    #[test]
    fn position_size_rejects_zero_stop_distance() {
        let err = position_size(10_000.0, 0.01, 0.0).unwrap_err();
        assert_eq!(err.kind(), "risk_calculation_error");
        assert!(position_size(0.0, 0.01, 5.0).is_err());
        assert_eq!(position_size(10_000.0, 0.01, 5.0).unwrap(), 20.0);
    }

    #[test]
    fn atr_stop_matches_reference_levels() {
        let window = flat_bars(3, 101.0, 99.0, 100.0);
        let stop = atr_stop(&window, 100.0, Side::Long, 3, 2.5, DEFAULT_FALLBACK_STOP_PCT);
        assert!((stop - 95.0).abs() < 1e-12);
        let tps = take_profit_levels(100.0, stop, Side::Long, &ratios(&[("tp1", 1.5)])).unwrap();
        assert!((tps["tp1"] - 107.5).abs() < 1e-12);
    }

    #[test]
    fn atr_stop_falls_back_on_short_window() {
        let window = flat_bars(2, 101.0, 99.0, 100.0);
        let long = atr_stop(&window, 100.0, Side::Long, 14, 2.0, DEFAULT_FALLBACK_STOP_PCT);
        let short = atr_stop(&window, 100.0, Side::Short, 14, 2.0, DEFAULT_FALLBACK_STOP_PCT);
        assert!((long - 98.0).abs() < 1e-12);
        assert!((short - 102.0).abs() < 1e-12);
    }

    #[test]
    fn structure_stop_enforces_minimum_distance() {
        let tight = flat_bars(10, 100.1, 99.9, 100.0);
        let stop = structure_stop(&tight, 100.0, Side::Long, 10, 0.0);
        assert!((stop - 99.5).abs() < 1e-12);

        let wide = flat_bars(10, 110.0, 90.0, 100.0);
        let stop = structure_stop(&wide, 100.0, Side::Short, 10, 0.01);
        assert!((stop - 111.1).abs() < 1e-9);
    }

    #[test]
    fn take_profit_rejects_bad_ratio() {
        let err = take_profit_levels(100.0, 95.0, Side::Long, &ratios(&[("tp1", -1.0)]))
            .unwrap_err();
        assert!(err.is_recoverable());
        let short = take_profit_levels(100.0, 105.0, Side::Short, &ratios(&[("tp1", 2.0)]))
            .unwrap();
        assert!((short["tp1"] - 90.0).abs() < 1e-12);
    }

    #[test]
    fn trailing_stop_never_loosens() {
        assert_eq!(trailing_stop(110.0, 95.0, 2.0, Side::Long, 2.0), 106.0);
        assert_eq!(trailing_stop(96.0, 106.0, 2.0, Side::Long, 2.0), 106.0);
        assert_eq!(trailing_stop(90.0, 105.0, 2.0, Side::Short, 2.0), 94.0);
        assert_eq!(trailing_stop(104.0, 94.0, 2.0, Side::Short, 2.0), 94.0);
        assert_eq!(trailing_stop(f64::NAN, 94.0, 2.0, Side::Short, 2.0), 94.0);
    }

    #[test]
    fn regime_table_scales_stop_and_targets() {
        let stop = adaptive_stop(100.0, 95.0, Side::Long, MarketRegime::BaseAssetDominant, false);
        assert!((stop - 93.5).abs() < 1e-12);
        let stop = adaptive_stop(100.0, 105.0, Side::Short, MarketRegime::AltLed, false);
        assert!((stop - 104.5).abs() < 1e-12);
        let scaled = adaptive_take_profit(&ratios(&[("tp1", 2.0)]), MarketRegime::AltLed, true);
        assert!((scaled["tp1"] - 1.8).abs() < 1e-12);
        assert_eq!(
            MarketRegime::Neutral.multipliers(true),
            MarketRegime::Neutral.multipliers(false)
        );
    }

    #[test]
    fn plan_entry_sizes_against_balance() {
        let mut settings = RiskSettings::default();
        settings.atr_period = 3;
        settings.atr_multiplier = 2.5;
        settings.rr_ratios = ratios(&[("tp1", 1.5), ("tp2", 3.0)]);
        let engine = RiskEngine::new(settings, 0.01);
        let window = flat_bars(3, 101.0, 99.0, 100.0);

        let plan = engine
            .plan_entry("BTCUSDT", &window, 100.0, Side::Long, 10_000.0)
            .unwrap();
        assert!((plan.stop_loss - 95.0).abs() < 1e-12);
        assert!((plan.quantity - 20.0).abs() < 1e-9);
        assert!((plan.initial_risk - 100.0).abs() < 1e-9);
        assert!((plan.take_profits["tp2"] - 115.0).abs() < 1e-12);

        let short = engine
            .plan_entry("BTCUSDT", &window, 100.0, Side::Short, 10_000.0)
            .unwrap();
        assert!((short.stop_loss - 105.0).abs() < 1e-12);
        assert!(short.take_profits.values().all(|tp| *tp < 100.0));
    }

    #[test]
    fn plan_entry_rejects_empty_balance() {
        let engine = RiskEngine::new(RiskSettings::default(), 0.01);
        let window = flat_bars(20, 101.0, 99.0, 100.0);
        let err = engine
            .plan_entry("BTCUSDT", &window, 100.0, Side::Long, 0.0)
            .unwrap_err();
        assert_eq!(err.kind(), "risk_calculation_error");
    }

    #[test]
    fn regime_scaling_keeps_structure_minimum_distance() {
        let mut settings = RiskSettings::default();
        settings.stop_mode = StopMode::Structure;
        settings.structure_lookback = 20;
        settings.structure_buffer_pct = 0.0;
        settings.market_regime = Some(MarketRegime::AltLed);
        let engine = RiskEngine::new(settings, 0.01);
        let tight = flat_bars(20, 100.1, 99.9, 100.0);

        let long = engine
            .plan_entry("SOLUSDT", &tight, 100.0, Side::Long, 10_000.0)
            .unwrap();
        assert!((long.stop_loss - 99.5).abs() < 1e-9);
        let short = engine
            .plan_entry("SOLUSDT", &tight, 100.0, Side::Short, 10_000.0)
            .unwrap();
        assert!((short.stop_loss - 100.5).abs() < 1e-9);

        // Scaling still applies while the stop stays outside the minimum distance.
        let wide = flat_bars(20, 104.0, 96.0, 100.0);
        let scaled = engine
            .plan_entry("BTCUSDT", &wide, 100.0, Side::Long, 10_000.0)
            .unwrap();
        assert!((scaled.stop_loss - 96.4).abs() < 1e-9);
    }

    #[test]
    fn trail_uses_prior_bar() {
        let mut settings = RiskSettings::default();
        settings.trailing_stop = true;
        settings.atr_period = 3;
        settings.trailing_atr_multiplier = 1.0;
        let engine = RiskEngine::new(settings, 0.01);
        let window = flat_bars(3, 111.0, 109.0, 110.0);
        assert_eq!(engine.trail(&window, 95.0, Side::Long), Some(108.0));
        assert_eq!(engine.trail(&window[..2], 95.0, Side::Long), None);
    }
}
