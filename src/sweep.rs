use crate::config::{BacktestConfig, EngineSettings};
use crate::data_context::MarketData;
use crate::engine::run_with_catalog;
use crate::error::{BacktestError, ErrorPayload};
use crate::models::{BacktestResult, PerformanceMetrics};
use crate::strategy::StrategyCatalog;
use crate::sweep_status::SweepStatus;
use crossbeam_channel::{bounded, Receiver, Sender};
use indicatif::{ProgressBar, ProgressStyle};
use log::{info, warn};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

const AXIS_TOLERANCE: f64 = 1e-9;

pub type ParameterSet = BTreeMap<String, f64>;

/// One swept knob: every value from `start` to `end` (inclusive) in `step` increments.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SweepAxis {
    pub parameter_name: String,
    pub start: f64,
    pub end: f64,
    pub step: f64,
}

impl SweepAxis {
    pub fn new(parameter_name: &str, start: f64, end: f64, step: f64) -> Self {
        Self {
            parameter_name: parameter_name.to_string(),
            start,
            end,
            step,
        }
    }

    fn validate(&self) -> Result<(), BacktestError> {
        if self.parameter_name.trim().is_empty() {
            return Err(BacktestError::configuration("sweep axis needs a parameter name"));
        }
        if !self.start.is_finite() || !self.end.is_finite() || !self.step.is_finite() {
            return Err(BacktestError::configuration(format!(
                "sweep axis {} has non-finite bounds",
                self.parameter_name
            )));
        }
        if self.step <= 0.0 {
            return Err(BacktestError::configuration(format!(
                "sweep axis {} step must be positive (value: {})",
                self.parameter_name, self.step
            )));
        }
        if self.start > self.end {
            return Err(BacktestError::configuration(format!(
                "sweep axis {} start {} is after end {}",
                self.parameter_name, self.start, self.end
            )));
        }
        Ok(())
    }

    pub fn value_count(&self) -> Result<usize, BacktestError> {
        self.validate()?;
        let spans = ((self.end - self.start) / self.step + AXIS_TOLERANCE).floor();
        if spans >= usize::MAX as f64 {
            return Err(BacktestError::TooManyCombinations {
                requested: usize::MAX,
                cap: usize::MAX,
            });
        }
        Ok(spans as usize + 1)
    }

    /// Values are computed as `start + i * step` so rounding never accumulates.
    pub fn values(&self) -> Result<Vec<f64>, BacktestError> {
        let count = self.value_count()?;
        Ok((0..count)
            .map(|i| {
                let value = self.start + i as f64 * self.step;
                if value > self.end {
                    self.end
                } else {
                    value
                }
            })
            .collect())
    }
}

impl fmt::Display for SweepAxis {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}={}:{}:{}",
            self.parameter_name, self.start, self.end, self.step
        )
    }
}

impl FromStr for SweepAxis {
    type Err = BacktestError;

    /// Parses `name=start:end:step`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || {
            BacktestError::configuration(format!(
                "invalid sweep axis '{}' (expected name=start:end:step)",
                s
            ))
        };
        let (name, range) = s.split_once('=').ok_or_else(invalid)?;
        let parts: Vec<&str> = range.split(':').map(str::trim).collect();
        if parts.len() != 3 {
            return Err(invalid());
        }
        let parse = |raw: &str| raw.parse::<f64>().map_err(|_| invalid());
        let axis = SweepAxis::new(name.trim(), parse(parts[0])?, parse(parts[1])?, parse(parts[2])?);
        axis.validate()?;
        Ok(axis)
    }
}

pub fn combination_count(axes: &[SweepAxis], cap: usize) -> Result<usize, BacktestError> {
    if axes.is_empty() {
        return Err(BacktestError::configuration("a sweep needs at least one axis"));
    }
    let mut seen = BTreeSet::new();
    let mut total: usize = 1;
    for axis in axes {
        if !seen.insert(axis.parameter_name.as_str()) {
            return Err(BacktestError::configuration(format!(
                "sweep axis {} listed twice",
                axis.parameter_name
            )));
        }
        total = total
            .checked_mul(axis.value_count()?)
            .ok_or(BacktestError::TooManyCombinations {
                requested: usize::MAX,
                cap,
            })?;
    }
    if total > cap {
        return Err(BacktestError::TooManyCombinations {
            requested: total,
            cap,
        });
    }
    Ok(total)
}

/// Cartesian product of the axes, the last axis varying fastest.
pub fn generate_combinations(
    axes: &[SweepAxis],
    cap: usize,
) -> Result<Vec<ParameterSet>, BacktestError> {
    let total = combination_count(axes, cap)?;
    let mut combinations: Vec<ParameterSet> = Vec::with_capacity(total);
    combinations.push(ParameterSet::new());
    for axis in axes {
        let values = axis.values()?;
        let mut expanded = Vec::with_capacity(combinations.len() * values.len());
        for combination in &combinations {
            for value in &values {
                let mut next = combination.clone();
                next.insert(axis.parameter_name.clone(), *value);
                expanded.push(next);
            }
        }
        combinations = expanded;
    }
    Ok(combinations)
}

#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    cancelled: Arc<AtomicBool>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, AtomicOrdering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(AtomicOrdering::SeqCst)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RankMetric {
    Sharpe,
    Sortino,
    ProfitFactor,
    WinRate,
    AvgR,
    TotalReturn,
    FinalBalance,
    MaxDrawdown,
    Trades,
}

impl RankMetric {
    pub fn value(self, metrics: &PerformanceMetrics) -> Option<f64> {
        let value = match self {
            RankMetric::Sharpe => metrics.sharpe,
            RankMetric::Sortino => metrics.sortino,
            RankMetric::ProfitFactor => metrics.profit_factor,
            RankMetric::WinRate => metrics.win_rate,
            RankMetric::AvgR => metrics.avg_r,
            RankMetric::TotalReturn => Some(metrics.total_return),
            RankMetric::FinalBalance => Some(metrics.final_balance),
            RankMetric::MaxDrawdown => Some(metrics.max_drawdown),
            RankMetric::Trades => Some(metrics.total_trades as f64),
        };
        value.filter(|value| value.is_finite())
    }

    pub fn higher_is_better(self) -> bool {
        !matches!(self, RankMetric::MaxDrawdown)
    }
}

impl FromStr for RankMetric {
    type Err = BacktestError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "sharpe" => Ok(RankMetric::Sharpe),
            "sortino" => Ok(RankMetric::Sortino),
            "profit_factor" => Ok(RankMetric::ProfitFactor),
            "win_rate" | "winrate" => Ok(RankMetric::WinRate),
            "avg_r" => Ok(RankMetric::AvgR),
            "total_return" => Ok(RankMetric::TotalReturn),
            "final_balance" => Ok(RankMetric::FinalBalance),
            "max_drawdown" => Ok(RankMetric::MaxDrawdown),
            "trades" => Ok(RankMetric::Trades),
            other => Err(BacktestError::configuration(format!(
                "unknown rank metric '{}'",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SweepEntry {
    pub index: usize,
    pub parameters: ParameterSet,
    pub result: BacktestResult,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FailedCombination {
    pub index: usize,
    pub parameters: ParameterSet,
    pub error: ErrorPayload,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize)]
pub struct SweepReport {
    pub entries: Vec<SweepEntry>,
    pub failed: Vec<FailedCombination>,
    pub cancelled: bool,
}

impl SweepReport {
    /// Entries best-first by `metric`; undefined values sort last, ties keep combination order.
    pub fn ranked(&self, metric: RankMetric) -> Vec<&SweepEntry> {
        let mut ranked: Vec<&SweepEntry> = self.entries.iter().collect();
        ranked.sort_by(|a, b| {
            let va = metric.value(&a.result.performance);
            let vb = metric.value(&b.result.performance);
            let by_value = match (va, vb) {
                (Some(x), Some(y)) => {
                    let ord = x.partial_cmp(&y).unwrap_or(Ordering::Equal);
                    if metric.higher_is_better() {
                        ord.reverse()
                    } else {
                        ord
                    }
                }
                (Some(_), None) => Ordering::Less,
                (None, Some(_)) => Ordering::Greater,
                (None, None) => Ordering::Equal,
            };
            by_value.then_with(|| a.index.cmp(&b.index))
        });
        ranked
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SweepOptions {
    pub worker_threads: usize,
    pub max_combinations: usize,
    pub show_progress: bool,
}

impl SweepOptions {
    pub fn from_settings(settings: &EngineSettings) -> Self {
        Self {
            worker_threads: settings.worker_threads,
            max_combinations: settings.max_sweep_combinations,
            show_progress: false,
        }
    }
}

impl Default for SweepOptions {
    fn default() -> Self {
        Self::from_settings(&EngineSettings::default())
    }
}

struct SweepTask {
    index: usize,
    parameters: ParameterSet,
}

enum TaskOutcome {
    Completed(BacktestResult),
    Failed(BacktestError),
    Skipped,
}

struct SweepTaskResult {
    index: usize,
    parameters: ParameterSet,
    outcome: TaskOutcome,
}

fn format_parameters(parameters: &ParameterSet) -> String {
    parameters
        .iter()
        .map(|(name, value)| {
            let formatted = format!("{:.4}", value);
            let trimmed = formatted.trim_end_matches('0').trim_end_matches('.');
            let cleaned = if trimmed.is_empty() || trimmed == "-0" {
                "0"
            } else {
                trimmed
            };
            format!("{}: {}", name, cleaned)
        })
        .collect::<Vec<String>>()
        .join(", ")
}

fn run_combination(
    base: &BacktestConfig,
    data: &MarketData,
    catalog: &StrategyCatalog,
    parameters: &ParameterSet,
) -> Result<BacktestResult, BacktestError> {
    let mut config = base.clone();
    for (name, value) in parameters {
        config.apply_parameter(name, *value)?;
    }
    run_with_catalog(&config, data, catalog)
}

fn progress_bar(total: usize, visible: bool) -> ProgressBar {
    if !visible {
        return ProgressBar::hidden();
    }
    let pb = ProgressBar::new(total as u64);
    if let Ok(style) = ProgressStyle::default_bar()
        .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} ({eta})")
    {
        pb.set_style(style.progress_chars("#>-"));
    }
    pb
}

/// Runs every combination of `axes` over `base` on a worker pool.
///
/// Each combination gets its own config, strategy instance and engine ledger; only the
/// materialized candles are shared. Combinations that fail land in `failed` without stopping
/// the sweep. Cancellation is observed before each combination starts.
pub fn run_sweep(
    base: &BacktestConfig,
    axes: &[SweepAxis],
    data: &MarketData,
    catalog: &StrategyCatalog,
    options: &SweepOptions,
    cancel: &CancellationToken,
    status: &SweepStatus,
) -> Result<SweepReport, BacktestError> {
    base.validate()?;
    if !catalog.contains(&base.strategy_name) {
        return Err(BacktestError::configuration(format!(
            "unknown strategy '{}'",
            base.strategy_name
        )));
    }
    let combinations = generate_combinations(axes, options.max_combinations)?;
    let total = combinations.len();
    status.set_total(total);
    status.set_phase("Running");

    let num_workers = total.min(options.worker_threads.max(1));
    info!(
        "Running {} sweep combinations of {} on {} worker threads",
        total, base.strategy_name, num_workers
    );

    let (tx, rx): (Sender<SweepTask>, Receiver<SweepTask>) = bounded(total);
    let (result_tx, result_rx): (Sender<SweepTaskResult>, Receiver<SweepTaskResult>) =
        bounded(total);

    let mut handles = Vec::with_capacity(num_workers);
    for _worker_id in 0..num_workers {
        let rx = rx.clone();
        let result_tx = result_tx.clone();
        let base = base.clone();
        let data = data.clone();
        let catalog = catalog.clone();
        let cancel = cancel.clone();
        let status = status.clone();

        handles.push(thread::spawn(move || {
            while let Ok(task) = rx.recv() {
                if cancel.is_cancelled() {
                    let skipped = SweepTaskResult {
                        index: task.index,
                        parameters: task.parameters,
                        outcome: TaskOutcome::Skipped,
                    };
                    if result_tx.send(skipped).is_err() {
                        break;
                    }
                    continue;
                }

                let start_time = Instant::now();
                let outcome = match run_combination(&base, &data, &catalog, &task.parameters) {
                    Ok(result) => {
                        info!(
                            "Combination {} finished in {:.2}s. Trades: {}, Sharpe: {:?}, Max DD: {:.2}%, Final: {:.2}, Params: [{}]",
                            task.index,
                            start_time.elapsed().as_secs_f64(),
                            result.performance.total_trades,
                            result.performance.sharpe,
                            result.performance.max_drawdown * 100.0,
                            result.performance.final_balance,
                            format_parameters(&task.parameters)
                        );
                        status.record_completion(false, result.performance.sharpe);
                        TaskOutcome::Completed(result)
                    }
                    Err(err) => {
                        warn!(
                            "Combination {} failed after {:.2}s: {} (params: [{}])",
                            task.index,
                            start_time.elapsed().as_secs_f64(),
                            err,
                            format_parameters(&task.parameters)
                        );
                        status.record_completion(true, None);
                        TaskOutcome::Failed(err)
                    }
                };

                let finished = SweepTaskResult {
                    index: task.index,
                    parameters: task.parameters,
                    outcome,
                };
                if result_tx.send(finished).is_err() {
                    break;
                }
            }
        }));
    }
    drop(result_tx);

    for (index, parameters) in combinations.into_iter().enumerate() {
        // Capacity equals the task count, so this never blocks.
        if tx.send(SweepTask { index, parameters }).is_err() {
            warn!("Sweep task queue closed before all combinations were queued");
            break;
        }
    }
    drop(tx);

    let pb = progress_bar(total, options.show_progress);
    let mut report = SweepReport::default();
    let mut received = 0;
    while received < total {
        match result_rx.recv_timeout(Duration::from_millis(200)) {
            Ok(task_result) => {
                received += 1;
                pb.set_position(received as u64);
                match task_result.outcome {
                    TaskOutcome::Completed(result) => report.entries.push(SweepEntry {
                        index: task_result.index,
                        parameters: task_result.parameters,
                        result,
                    }),
                    TaskOutcome::Failed(err) => report.failed.push(FailedCombination {
                        index: task_result.index,
                        parameters: task_result.parameters,
                        error: err.payload(),
                    }),
                    TaskOutcome::Skipped => report.cancelled = true,
                }
            }
            Err(crossbeam_channel::RecvTimeoutError::Timeout) => {}
            Err(crossbeam_channel::RecvTimeoutError::Disconnected) => {
                warn!("Sweep result channel closed unexpectedly. Some results may be lost.");
                break;
            }
        }
    }

    for handle in handles {
        if handle.join().is_err() {
            warn!("Sweep worker thread panicked");
        }
    }

    report.entries.sort_by_key(|entry| entry.index);
    report.failed.sort_by_key(|failed| failed.index);
    report.cancelled |= cancel.is_cancelled() && report.entries.len() + report.failed.len() < total;

    let phase = if report.cancelled {
        "Cancelled"
    } else {
        "Done"
    };
    pb.finish_with_message(phase);
    status.set_phase(phase);
    info!(
        "Sweep finished: {} completed, {} failed{}",
        report.entries.len(),
        report.failed.len(),
        if report.cancelled { ", cancelled" } else { "" }
    );
    Ok(report)
}

pub fn run_per_symbol(
    config: &BacktestConfig,
    data: &MarketData,
    catalog: &StrategyCatalog,
) -> Result<BTreeMap<String, BacktestResult>, BacktestError> {
    config.validate()?;
    let symbols = data.symbols();
    let results: Result<Vec<(String, BacktestResult)>, BacktestError> = symbols
        .par_iter()
        .map(|symbol| {
            let mut single = config.clone();
            single.symbols = vec![symbol.clone()];
            let view = data.restrict_to_symbol(symbol)?;
            run_with_catalog(&single, &view, catalog).map(|result| (symbol.clone(), result))
        })
        .collect();
    Ok(results?.into_iter().collect())
}
