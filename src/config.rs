use crate::error::BacktestError;
use crate::risk::MarketRegime;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::str::FromStr;

pub type StrategyParams = BTreeMap<String, f64>;

pub const DEFAULT_MAX_SWEEP_COMBINATIONS: usize = 10_000;
const SECONDS_PER_YEAR: f64 = 365.0 * 24.0 * 60.0 * 60.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Timeframe {
    #[serde(rename = "1m")]
    M1,
    #[serde(rename = "5m")]
    M5,
    #[serde(rename = "15m")]
    M15,
    #[serde(rename = "1h")]
    H1,
    #[serde(rename = "4h")]
    H4,
    #[serde(rename = "1d")]
    D1,
}

impl Timeframe {
    pub fn as_str(self) -> &'static str {
        match self {
            Timeframe::M1 => "1m",
            Timeframe::M5 => "5m",
            Timeframe::M15 => "15m",
            Timeframe::H1 => "1h",
            Timeframe::H4 => "4h",
            Timeframe::D1 => "1d",
        }
    }

    pub fn duration(self) -> Duration {
        match self {
            Timeframe::M1 => Duration::minutes(1),
            Timeframe::M5 => Duration::minutes(5),
            Timeframe::M15 => Duration::minutes(15),
            Timeframe::H1 => Duration::hours(1),
            Timeframe::H4 => Duration::hours(4),
            Timeframe::D1 => Duration::days(1),
        }
    }

    /// Bars per year for a market that trades around the clock.
    pub fn periods_per_year(self) -> f64 {
        SECONDS_PER_YEAR / self.duration().num_seconds() as f64
    }
}

impl fmt::Display for Timeframe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Timeframe {
    type Err = BacktestError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "1m" => Ok(Timeframe::M1),
            "5m" => Ok(Timeframe::M5),
            "15m" => Ok(Timeframe::M15),
            "1h" => Ok(Timeframe::H1),
            "4h" => Ok(Timeframe::H4),
            "1d" => Ok(Timeframe::D1),
            other => Err(BacktestError::configuration(format!(
                "unsupported timeframe '{}'",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DateRange {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl DateRange {
    pub fn contains(&self, timestamp: DateTime<Utc>) -> bool {
        timestamp >= self.start && timestamp <= self.end
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopMode {
    Atr,
    Structure,
    Percent,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RiskSettings {
    pub stop_mode: StopMode,
    pub atr_period: usize,
    pub atr_multiplier: f64,
    pub structure_lookback: usize,
    pub structure_buffer_pct: f64,
    pub fallback_stop_pct: f64,
    pub rr_ratios: BTreeMap<String, f64>,
    pub trailing_stop: bool,
    pub trailing_atr_multiplier: f64,
    pub partial_exits: bool,
    pub market_regime: Option<MarketRegime>,
    pub base_assets: Vec<String>,
}

impl Default for RiskSettings {
    fn default() -> Self {
        Self {
            stop_mode: StopMode::Atr,
            atr_period: 14,
            atr_multiplier: 2.0,
            structure_lookback: 20,
            structure_buffer_pct: 0.001,
            fallback_stop_pct: crate::risk::DEFAULT_FALLBACK_STOP_PCT,
            rr_ratios: BTreeMap::from([("tp1".to_string(), 2.0)]),
            trailing_stop: false,
            trailing_atr_multiplier: 2.0,
            partial_exits: false,
            market_regime: None,
            base_assets: Vec::new(),
        }
    }
}

impl RiskSettings {
    pub fn is_base_asset(&self, symbol: &str) -> bool {
        self.base_assets
            .iter()
            .any(|asset| asset.eq_ignore_ascii_case(symbol))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BacktestConfig {
    pub symbols: Vec<String>,
    pub date_range: DateRange,
    pub timeframe: Timeframe,
    pub strategy_name: String,
    #[serde(default)]
    pub strategy_params: StrategyParams,
    #[serde(default = "default_initial_capital")]
    pub initial_capital: f64,
    #[serde(default = "default_commission_rate")]
    pub commission_rate: f64,
    #[serde(default = "default_slippage_rate")]
    pub slippage_rate: f64,
    #[serde(default = "default_risk_per_trade_fraction")]
    pub risk_per_trade_fraction: f64,
    #[serde(default = "default_max_positions")]
    pub max_positions: usize,
    #[serde(default)]
    pub max_holding_duration_secs: Option<i64>,
    #[serde(default)]
    pub compounding: bool,
    #[serde(default = "default_min_confidence")]
    pub min_confidence: f64,
    #[serde(default = "default_allow_short")]
    pub allow_short: bool,
    #[serde(default)]
    pub exit_on_opposite_signal: bool,
    #[serde(default)]
    pub risk: RiskSettings,
}

fn default_initial_capital() -> f64 {
    10_000.0
}

fn default_commission_rate() -> f64 {
    0.001
}

fn default_slippage_rate() -> f64 {
    0.0005
}

fn default_risk_per_trade_fraction() -> f64 {
    0.01
}

fn default_max_positions() -> usize {
    3
}

fn default_min_confidence() -> f64 {
    0.5
}

fn default_allow_short() -> bool {
    true
}

impl BacktestConfig {
    pub fn new(
        symbols: Vec<String>,
        date_range: DateRange,
        timeframe: Timeframe,
        strategy_name: &str,
    ) -> Self {
        Self {
            symbols,
            date_range,
            timeframe,
            strategy_name: strategy_name.to_string(),
            strategy_params: StrategyParams::new(),
            initial_capital: default_initial_capital(),
            commission_rate: default_commission_rate(),
            slippage_rate: default_slippage_rate(),
            risk_per_trade_fraction: default_risk_per_trade_fraction(),
            max_positions: default_max_positions(),
            max_holding_duration_secs: None,
            compounding: false,
            min_confidence: default_min_confidence(),
            allow_short: default_allow_short(),
            exit_on_opposite_signal: false,
            risk: RiskSettings::default(),
        }
    }

    pub fn max_holding_duration(&self) -> Option<Duration> {
        self.max_holding_duration_secs.map(Duration::seconds)
    }

    pub fn ordered_symbols(&self) -> Vec<String> {
        let mut symbols = self.symbols.clone();
        symbols.sort();
        symbols.dedup();
        symbols
    }

    pub fn validate(&self) -> Result<(), BacktestError> {
        if self.symbols.is_empty() {
            return Err(BacktestError::configuration("at least one symbol is required"));
        }
        if let Some(blank) = self.symbols.iter().find(|symbol| symbol.trim().is_empty()) {
            return Err(BacktestError::configuration(format!(
                "invalid symbol '{}'",
                blank
            )));
        }
        if self.date_range.start >= self.date_range.end {
            return Err(BacktestError::configuration(format!(
                "date range start {} must be before end {}",
                self.date_range.start, self.date_range.end
            )));
        }
        if self.strategy_name.trim().is_empty() {
            return Err(BacktestError::configuration("strategy name is required"));
        }
        require_finite_in(
            "initial_capital",
            self.initial_capital,
            f64::MIN_POSITIVE,
            f64::MAX,
        )?;
        require_rate("commission_rate", self.commission_rate)?;
        require_rate("slippage_rate", self.slippage_rate)?;
        require_finite_in(
            "risk_per_trade_fraction",
            self.risk_per_trade_fraction,
            f64::MIN_POSITIVE,
            1.0,
        )?;
        require_finite_in("min_confidence", self.min_confidence, 0.0, 1.0)?;
        if self.max_positions == 0 {
            return Err(BacktestError::configuration("max_positions must be >= 1"));
        }
        if let Some(secs) = self.max_holding_duration_secs {
            if secs <= 0 {
                return Err(BacktestError::configuration(format!(
                    "max_holding_duration_secs must be positive (value: {})",
                    secs
                )));
            }
        }
        for (name, value) in &self.strategy_params {
            if !value.is_finite() {
                return Err(BacktestError::configuration(format!(
                    "strategy parameter {} must be finite",
                    name
                )));
            }
        }
        self.validate_risk()
    }

    fn validate_risk(&self) -> Result<(), BacktestError> {
        let risk = &self.risk;
        if risk.atr_period == 0 {
            return Err(BacktestError::configuration("risk.atr_period must be >= 1"));
        }
        require_finite_in(
            "risk.atr_multiplier",
            risk.atr_multiplier,
            f64::MIN_POSITIVE,
            f64::MAX,
        )?;
        if risk.structure_lookback == 0 {
            return Err(BacktestError::configuration(
                "risk.structure_lookback must be >= 1",
            ));
        }
        require_finite_in("risk.structure_buffer_pct", risk.structure_buffer_pct, 0.0, 0.5)?;
        require_finite_in(
            "risk.fallback_stop_pct",
            risk.fallback_stop_pct,
            f64::MIN_POSITIVE,
            0.5,
        )?;
        if risk.rr_ratios.is_empty() {
            return Err(BacktestError::configuration(
                "risk.rr_ratios needs at least one take-profit level",
            ));
        }
        for (level, ratio) in &risk.rr_ratios {
            require_finite_in(
                &format!("risk.rr_ratios.{}", level),
                *ratio,
                f64::MIN_POSITIVE,
                f64::MAX,
            )?;
        }
        if risk.trailing_stop {
            require_finite_in(
                "risk.trailing_atr_multiplier",
                risk.trailing_atr_multiplier,
                f64::MIN_POSITIVE,
                f64::MAX,
            )?;
        }
        Ok(())
    }

    /// Sets one numeric knob by name. Engine and risk fields are matched first; any other
    /// name (or a `param.`-prefixed one) becomes a strategy parameter. Take-profit ratios are
    /// addressed as `rr.<level>`.
    pub fn apply_parameter(&mut self, name: &str, value: f64) -> Result<(), BacktestError> {
        if !value.is_finite() {
            return Err(BacktestError::configuration(format!(
                "parameter {} must be finite",
                name
            )));
        }
        match name {
            "initial_capital" => self.initial_capital = value,
            "commission_rate" => self.commission_rate = value,
            "slippage_rate" => self.slippage_rate = value,
            "risk_per_trade_fraction" => self.risk_per_trade_fraction = value,
            "max_positions" => self.max_positions = rounded_count(name, value)?,
            "min_confidence" => self.min_confidence = value,
            "max_holding_duration_secs" => {
                self.max_holding_duration_secs = Some(value.round() as i64)
            }
            "atr_period" => self.risk.atr_period = rounded_count(name, value)?,
            "atr_multiplier" => self.risk.atr_multiplier = value,
            "structure_lookback" => self.risk.structure_lookback = rounded_count(name, value)?,
            "structure_buffer_pct" => self.risk.structure_buffer_pct = value,
            "fallback_stop_pct" => self.risk.fallback_stop_pct = value,
            "trailing_atr_multiplier" => self.risk.trailing_atr_multiplier = value,
            other => {
                if let Some(level) = other.strip_prefix("rr.") {
                    self.risk.rr_ratios.insert(level.to_string(), value);
                } else {
                    let key = other.strip_prefix("param.").unwrap_or(other);
                    self.strategy_params.insert(key.to_string(), value);
                }
            }
        }
        Ok(())
    }
}

fn rounded_count(name: &str, value: f64) -> Result<usize, BacktestError> {
    let rounded = value.round();
    if rounded < 1.0 {
        return Err(BacktestError::configuration(format!(
            "{} must be >= 1 (value: {})",
            name, value
        )));
    }
    Ok(rounded as usize)
}

fn require_rate(name: &str, value: f64) -> Result<(), BacktestError> {
    if !value.is_finite() || !(0.0..1.0).contains(&value) {
        return Err(BacktestError::configuration(format!(
            "{} must be in [0, 1) (value: {})",
            name, value
        )));
    }
    Ok(())
}

fn require_finite_in(name: &str, value: f64, min: f64, max: f64) -> Result<(), BacktestError> {
    if !value.is_finite() {
        return Err(BacktestError::configuration(format!(
            "{} must be finite (value: {})",
            name, value
        )));
    }
    if value < min || value > max {
        return Err(BacktestError::configuration(format!(
            "{} out of bounds (value: {})",
            name, value
        )));
    }
    Ok(())
}

#[derive(Debug, Clone, PartialEq)]
pub struct EngineSettings {
    pub max_sweep_combinations: usize,
    pub worker_threads: usize,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            max_sweep_combinations: DEFAULT_MAX_SWEEP_COMBINATIONS,
            worker_threads: num_cpus::get().max(1),
        }
    }
}

impl EngineSettings {
    pub fn from_settings_map(settings: &HashMap<String, String>) -> Result<Self, BacktestError> {
        let defaults = Self::default();
        let max_sweep_combinations = optional_setting_usize(
            settings,
            "BACKTEST_MAX_SWEEP_COMBINATIONS",
            defaults.max_sweep_combinations,
            1,
        )?;
        let worker_threads = optional_setting_usize(
            settings,
            "BACKTEST_WORKER_THREADS",
            defaults.worker_threads,
            1,
        )?;
        Ok(Self {
            max_sweep_combinations,
            worker_threads,
        })
    }

    pub fn from_env() -> Result<Self, BacktestError> {
        let settings: HashMap<String, String> = std::env::vars()
            .filter(|(key, _)| key.starts_with("BACKTEST_"))
            .collect();
        Self::from_settings_map(&settings)
    }
}

fn optional_setting<'a>(settings: &'a HashMap<String, String>, key: &str) -> Option<&'a str> {
    settings
        .get(key)
        .map(|value| value.trim())
        .filter(|value| !value.is_empty())
}

fn optional_setting_usize(
    settings: &HashMap<String, String>,
    key: &str,
    default: usize,
    min: usize,
) -> Result<usize, BacktestError> {
    let Some(raw) = optional_setting(settings, key) else {
        return Ok(default);
    };
    let value = raw.parse::<f64>().map_err(|_| {
        BacktestError::configuration(format!("Setting {} must be a number (value: {})", key, raw))
    })?;
    if !value.is_finite() || value.fract() != 0.0 {
        return Err(BacktestError::configuration(format!(
            "Setting {} must be an integer (value: {})",
            key, raw
        )));
    }
    if value < min as f64 {
        return Err(BacktestError::configuration(format!(
            "Setting {} must be >= {} (value: {})",
            key, min, raw
        )));
    }
    Ok(value as usize)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn sample_config() -> BacktestConfig {
        BacktestConfig::new(
            vec!["ETHUSDT".to_string(), "BTCUSDT".to_string()],
            DateRange {
                start: Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
                end: Utc.with_ymd_and_hms(2024, 6, 1, 0, 0, 0).unwrap(),
            },
            Timeframe::H1,
            "breakout",
        )
    }

    #[test]
    fn rejects_inverted_date_range() {
        let mut config = sample_config();
        std::mem::swap(&mut config.date_range.start, &mut config.date_range.end);
        let err = config.validate().unwrap_err();
        assert_eq!(err.kind(), "configuration_error");
    }

    #[test]
    fn rejects_out_of_bounds_risk_fraction() {
        let mut config = sample_config();
        config.risk_per_trade_fraction = 1.5;
        assert!(config.validate().is_err());
        config.risk_per_trade_fraction = 0.0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_non_positive_rr_ratio() {
        let mut config = sample_config();
        config.risk.rr_ratios.insert("tp2".to_string(), 0.0);
        assert!(config.validate().is_err());
    }

    #[test]
    fn apply_parameter_routes_risk_and_strategy_keys() {
        let mut config = sample_config();
        config.apply_parameter("atr_multiplier", 2.5).unwrap();
        config.apply_parameter("atr_period", 9.6).unwrap();
        config.apply_parameter("rr.tp2", 3.0).unwrap();
        config.apply_parameter("lookback", 30.0).unwrap();
        config.apply_parameter("param.min_range_pct", 0.02).unwrap();

        assert_eq!(config.risk.atr_multiplier, 2.5);
        assert_eq!(config.risk.atr_period, 10);
        assert_eq!(config.risk.rr_ratios.get("tp2"), Some(&3.0));
        assert_eq!(config.strategy_params.get("lookback"), Some(&30.0));
        assert_eq!(config.strategy_params.get("min_range_pct"), Some(&0.02));
        assert!(config.apply_parameter("max_positions", 0.2).is_err());
    }

    #[test]
    fn ordered_symbols_are_alphabetical() {
        assert_eq!(
            sample_config().ordered_symbols(),
            vec!["BTCUSDT".to_string(), "ETHUSDT".to_string()]
        );
    }

    #[test]
    fn engine_settings_parse_and_validate() {
        let mut settings = HashMap::new();
        settings.insert("BACKTEST_MAX_SWEEP_COMBINATIONS".to_string(), "250".to_string());
        settings.insert("BACKTEST_WORKER_THREADS".to_string(), " 4 ".to_string());
        let parsed = EngineSettings::from_settings_map(&settings).unwrap();
        assert_eq!(parsed.max_sweep_combinations, 250);
        assert_eq!(parsed.worker_threads, 4);

        settings.insert("BACKTEST_WORKER_THREADS".to_string(), "1.5".to_string());
        assert!(EngineSettings::from_settings_map(&settings).is_err());
    }

    #[test]
    fn config_json_fills_defaults() {
        let json = r#"{
            "symbols": ["BTCUSDT"],
            "date_range": {"start": "2024-01-01T00:00:00Z", "end": "2024-02-01T00:00:00Z"},
            "timeframe": "4h",
            "strategy_name": "trend_following",
            "risk": {"atr_multiplier": 3.0}
        }"#;
        let config: BacktestConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.timeframe, Timeframe::H4);
        assert_eq!(config.max_positions, 3);
        assert_eq!(config.risk.atr_multiplier, 3.0);
        assert_eq!(config.risk.atr_period, 14);
        assert!(config.validate().is_ok());
    }
}
