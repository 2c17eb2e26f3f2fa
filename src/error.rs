use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors raised while configuring, running or sweeping a backtest.
///
/// `RiskCalculation` and `Execution` are recoverable: the engine skips the offending signal or
/// order and keeps stepping. Everything else stops the run (or the sweep submission).
#[derive(Debug, Clone, Error, PartialEq)]
pub enum BacktestError {
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("data error: {0}")]
    Data(String),

    #[error("risk calculation error: {0}")]
    RiskCalculation(String),

    #[error("execution error: {0}")]
    Execution(String),

    #[error("sweep grid has {requested} combinations, cap is {cap}")]
    TooManyCombinations { requested: usize, cap: usize },
}

impl BacktestError {
    pub fn configuration<S: Into<String>>(message: S) -> Self {
        Self::Configuration(message.into())
    }

    pub fn data<S: Into<String>>(message: S) -> Self {
        Self::Data(message.into())
    }

    pub fn risk<S: Into<String>>(message: S) -> Self {
        Self::RiskCalculation(message.into())
    }

    pub fn execution<S: Into<String>>(message: S) -> Self {
        Self::Execution(message.into())
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Configuration(_) => "configuration_error",
            Self::Data(_) => "data_error",
            Self::RiskCalculation(_) => "risk_calculation_error",
            Self::Execution(_) => "execution_error",
            Self::TooManyCombinations { .. } => "too_many_combinations",
        }
    }

    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::RiskCalculation(_) | Self::Execution(_))
    }

    pub fn payload(&self) -> ErrorPayload {
        ErrorPayload {
            kind: self.kind().to_string(),
            message: self.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub kind: String,
    pub message: String,
}

impl std::fmt::Display for ErrorPayload {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({})", self.message, self.kind)
    }
}

#[derive(Debug, Clone, Error, PartialEq)]
pub enum JobError {
    #[error("unknown job {0}")]
    UnknownJob(String),

    #[error("job {0} has not finished")]
    NotFinished(String),

    #[error("job failed: {0}")]
    Failed(ErrorPayload),

    #[error(transparent)]
    Rejected(#[from] BacktestError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recoverable_kinds_are_risk_and_execution() {
        assert!(BacktestError::risk("stop distance 0").is_recoverable());
        assert!(BacktestError::execution("cash").is_recoverable());
        assert!(!BacktestError::data("no candles").is_recoverable());
        assert!(!BacktestError::TooManyCombinations {
            requested: 20,
            cap: 10
        }
        .is_recoverable());
    }

    #[test]
    fn payload_carries_kind_and_message() {
        let payload = BacktestError::configuration("unknown strategy 'nope'").payload();
        assert_eq!(payload.kind, "configuration_error");
        assert!(payload.message.contains("unknown strategy 'nope'"));
    }
}
