use serde::Serialize;
use std::sync::{Arc, Mutex};

#[derive(Clone, Default)]
pub struct SweepStatus {
    inner: Arc<Mutex<SweepStatusData>>,
}

#[derive(Default)]
struct SweepStatusData {
    phase: String,
    total_combinations: usize,
    completed_combinations: usize,
    failed_combinations: usize,
    best_sharpe: Option<f64>,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct SweepStatusSnapshot {
    pub phase: String,
    pub total_combinations: usize,
    pub completed_combinations: usize,
    pub failed_combinations: usize,
    pub best_sharpe: Option<f64>,
}

impl SweepStatus {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(SweepStatusData {
                phase: "Pending".to_string(),
                ..Default::default()
            })),
        }
    }

    pub fn set_phase<S: Into<String>>(&self, phase: S) {
        if let Ok(mut data) = self.inner.lock() {
            data.phase = phase.into();
        }
    }

    pub fn set_total(&self, total_combinations: usize) {
        if let Ok(mut data) = self.inner.lock() {
            data.total_combinations = total_combinations;
        }
    }

    /// Counts one finished combination; `sharpe` is `None` for failures and undefined ratios.
    pub fn record_completion(&self, failed: bool, sharpe: Option<f64>) {
        if let Ok(mut data) = self.inner.lock() {
            data.completed_combinations += 1;
            if failed {
                data.failed_combinations += 1;
            }
            if let Some(value) = sharpe.filter(|value| value.is_finite()) {
                data.best_sharpe = Some(data.best_sharpe.map_or(value, |best| best.max(value)));
            }
        }
    }

    pub fn snapshot(&self) -> SweepStatusSnapshot {
        if let Ok(data) = self.inner.lock() {
            SweepStatusSnapshot {
                phase: data.phase.clone(),
                total_combinations: data.total_combinations,
                completed_combinations: data.completed_combinations,
                failed_combinations: data.failed_combinations,
                best_sharpe: data.best_sharpe,
            }
        } else {
            SweepStatusSnapshot {
                phase: "Status unavailable".to_string(),
                total_combinations: 0,
                completed_combinations: 0,
                failed_combinations: 0,
                best_sharpe: None,
            }
        }
    }
}
