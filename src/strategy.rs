use crate::config::StrategyParams;
use crate::error::BacktestError;
use crate::models::*;
use crate::param_utils::{validate_params, with_defaults};
use log::debug;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

/// A rule-based signal generator.
///
/// `evaluate` receives every candle of one symbol up to and including the current step, plus
/// the state it returned on the previous step, and hands back the signal together with the
/// state to carry forward. Implementations keep no mutable fields of their own.
pub trait Strategy: Send + Sync {
    fn name(&self) -> &str;

    /// Fewest candles the strategy needs before it will emit anything but hold.
    fn min_lookback(&self) -> usize;

    fn evaluate(
        &self,
        symbol: &str,
        window: &[Candle],
        state: &StrategyState,
    ) -> (StrategySignal, StrategyState);
}

const SEEN_KEY: &str = "seen";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StrategyState {
    values: BTreeMap<String, f64>,
}

impl StrategyState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<f64> {
        self.values.get(key).copied()
    }

    pub fn set(&mut self, key: &str, value: f64) {
        self.values.insert(key.to_string(), value);
    }

    /// True when this state was produced from `window_len - 1` candles, so only the newest
    /// candle still has to be folded in.
    pub fn continues(&self, window_len: usize) -> bool {
        window_len > 0 && self.get(SEEN_KEY) == Some((window_len - 1) as f64)
    }

    pub fn mark_seen(&mut self, window_len: usize) {
        self.set(SEEN_KEY, window_len as f64);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ParameterSpec {
    pub name: &'static str,
    pub default: f64,
    pub min: f64,
    pub max: f64,
    pub description: &'static str,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StrategyDescriptor {
    pub name: String,
    pub description: String,
    pub parameters: Vec<ParameterSpec>,
}

impl StrategyDescriptor {
    pub fn new(name: &str, description: &str, parameters: &[ParameterSpec]) -> Self {
        Self {
            name: name.to_string(),
            description: description.to_string(),
            parameters: parameters.to_vec(),
        }
    }
}

pub type StrategyFactory = Arc<dyn Fn(&StrategyParams) -> Box<dyn Strategy> + Send + Sync>;

#[derive(Clone)]
struct CatalogEntry {
    descriptor: StrategyDescriptor,
    factory: StrategyFactory,
}

/// Name to strategy factory registry. The engine only ever builds strategies through here.
#[derive(Clone, Default)]
pub struct StrategyCatalog {
    entries: BTreeMap<String, CatalogEntry>,
}

impl StrategyCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_builtin() -> Self {
        let mut catalog = Self::new();
        catalog.register(trend_following::descriptor(), |params| {
            Box::new(TrendFollowingStrategy::new(params))
        });
        catalog.register(mean_reversion::descriptor(), |params| {
            Box::new(MeanReversionStrategy::new(params))
        });
        catalog.register(breakout::descriptor(), |params| {
            Box::new(BreakoutStrategy::new(params))
        });
        catalog.register(scalping::descriptor(), |params| {
            Box::new(ScalpingStrategy::new(params))
        });
        catalog.register(volatility_spike::descriptor(), |params| {
            Box::new(VolatilitySpikeStrategy::new(params))
        });
        catalog
    }

    pub fn register<F>(&mut self, descriptor: StrategyDescriptor, factory: F)
    where
        F: Fn(&StrategyParams) -> Box<dyn Strategy> + Send + Sync + 'static,
    {
        if self.entries.contains_key(&descriptor.name) {
            debug!("Replacing registered strategy {}", descriptor.name);
        }
        self.entries.insert(
            descriptor.name.clone(),
            CatalogEntry {
                descriptor,
                factory: Arc::new(factory),
            },
        );
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    pub fn descriptors(&self) -> Vec<&StrategyDescriptor> {
        self.entries.values().map(|entry| &entry.descriptor).collect()
    }

    /// Validates `params` against the strategy's schema and builds an instance with defaults
    /// filled in.
    pub fn create(
        &self,
        name: &str,
        params: &StrategyParams,
    ) -> Result<Box<dyn Strategy>, BacktestError> {
        let entry = self.entries.get(name).ok_or_else(|| {
            BacktestError::configuration(format!("unknown strategy '{}'", name))
        })?;
        validate_params(name, &entry.descriptor.parameters, params)?;
        let resolved = with_defaults(&entry.descriptor.parameters, params);
        Ok((entry.factory)(&resolved))
    }
}

#[path = "strategies/trend_following.rs"]
pub mod trend_following;

pub use trend_following::TrendFollowingStrategy;

#[path = "strategies/mean_reversion.rs"]
pub mod mean_reversion;

pub use mean_reversion::MeanReversionStrategy;

#[path = "strategies/breakout.rs"]
pub mod breakout;

pub use breakout::BreakoutStrategy;

#[path = "strategies/scalping.rs"]
pub mod scalping;

pub use scalping::ScalpingStrategy;

#[path = "strategies/volatility_spike.rs"]
pub mod volatility_spike;

pub use volatility_spike::VolatilitySpikeStrategy;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::strategy_utils::hold_signal;

    struct AlwaysHold;

    impl Strategy for AlwaysHold {
        fn name(&self) -> &str {
            "always_hold"
        }

        fn min_lookback(&self) -> usize {
            1
        }

        fn evaluate(
            &self,
            symbol: &str,
            _window: &[Candle],
            state: &StrategyState,
        ) -> (StrategySignal, StrategyState) {
            (hold_signal(symbol), state.clone())
        }
    }

    #[test]
    fn builtin_catalog_lists_five_strategies() {
        let catalog = StrategyCatalog::with_builtin();
        let names: Vec<&str> = catalog
            .descriptors()
            .iter()
            .map(|d| d.name.as_str())
            .collect();
        assert_eq!(
            names,
            vec![
                "breakout",
                "mean_reversion",
                "scalping",
                "trend_following",
                "volatility_spike"
            ]
        );
    }

    #[test]
    fn unknown_strategy_is_configuration_error() {
        let catalog = StrategyCatalog::with_builtin();
        let err = catalog
            .create("martingale", &StrategyParams::new())
            .err()
            .unwrap();
        assert_eq!(err.kind(), "configuration_error");
    }

    #[test]
    fn create_rejects_out_of_bounds_params() {
        let catalog = StrategyCatalog::with_builtin();
        let mut params = StrategyParams::new();
        params.insert("lookback".to_string(), 1_000_000.0);
        assert!(catalog.create("breakout", &params).is_err());
    }

    #[test]
    fn registered_strategy_is_created_by_name() {
        let mut catalog = StrategyCatalog::new();
        catalog.register(
            StrategyDescriptor::new("always_hold", "never trades", &[]),
            |_| Box::new(AlwaysHold),
        );
        let strategy = catalog.create("always_hold", &StrategyParams::new()).unwrap();
        assert_eq!(strategy.name(), "always_hold");
    }

    #[test]
    fn state_tracks_consumed_window_length() {
        let mut state = StrategyState::new();
        assert!(!state.continues(5));
        state.mark_seen(4);
        assert!(state.continues(5));
        assert!(!state.continues(6));
    }
}
