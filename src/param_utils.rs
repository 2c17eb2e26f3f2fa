use crate::config::StrategyParams;
use crate::error::BacktestError;
use crate::strategy::ParameterSpec;

/// Extract a parameter as f64 with a default value
pub fn get_param_f64(params: &StrategyParams, key: &str, default: f64) -> f64 {
    params.get(key).copied().unwrap_or(default)
}

/// Extract a parameter as f64, clamped to a range with finite checks
pub fn get_param_f64_clamped(
    params: &StrategyParams,
    key: &str,
    default: f64,
    min: f64,
    max: f64,
) -> f64 {
    let raw = params.get(key).copied().unwrap_or(default);
    if !raw.is_finite() {
        return default;
    }
    raw.clamp(min, max)
}

/// Extract a parameter as usize, rounded and clamped to a range with finite checks
pub fn get_param_usize_rounded_clamped(
    params: &StrategyParams,
    key: &str,
    default: usize,
    min: usize,
    max: usize,
) -> usize {
    let raw = params.get(key).copied().unwrap_or(default as f64);
    if !raw.is_finite() {
        return default;
    }
    raw.round().clamp(min as f64, max as f64) as usize
}

/// Checks supplied parameters against a strategy's declared schema.
///
/// Unknown names and values outside `[min, max]` are configuration errors; missing names fall
/// back to the schema default inside the strategy.
pub fn validate_params(
    strategy: &str,
    specs: &[ParameterSpec],
    params: &StrategyParams,
) -> Result<(), BacktestError> {
    for (name, value) in params {
        let Some(spec) = specs.iter().find(|spec| spec.name == *name) else {
            return Err(BacktestError::configuration(format!(
                "unknown parameter '{}' for strategy {}",
                name, strategy
            )));
        };
        if !value.is_finite() || *value < spec.min || *value > spec.max {
            return Err(BacktestError::configuration(format!(
                "parameter {} for strategy {} out of bounds [{}, {}] (value: {})",
                name, strategy, spec.min, spec.max, value
            )));
        }
    }
    Ok(())
}

pub fn with_defaults(specs: &[ParameterSpec], params: &StrategyParams) -> StrategyParams {
    let mut resolved = StrategyParams::new();
    for spec in specs {
        let value = params.get(spec.name).copied().unwrap_or(spec.default);
        resolved.insert(spec.name.to_string(), value);
    }
    resolved
}
