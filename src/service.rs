use crate::config::{BacktestConfig, EngineSettings};
use crate::data_context::{CandleStore, MarketData};
use crate::engine::run_with_catalog;
use crate::error::{BacktestError, ErrorPayload, JobError};
use crate::models::BacktestResult;
use crate::strategy::StrategyCatalog;
use crate::sweep::{
    combination_count, run_per_symbol, run_sweep, CancellationToken, FailedCombination,
    RankMetric, SweepAxis, SweepEntry, SweepOptions, SweepReport,
};
use crate::sweep_status::{SweepStatus, SweepStatusSnapshot};
use dashmap::DashMap;
use log::{error, info};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::watch;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Running,
    Done,
    Failed { error: ErrorPayload },
}

impl JobStatus {
    pub fn is_finished(&self) -> bool {
        matches!(self, JobStatus::Done | JobStatus::Failed { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SweepJobStatus {
    #[serde(flatten)]
    pub status: JobStatus,
    pub progress: SweepStatusSnapshot,
}

/// Finished sweep as handed back to callers: completed runs best-first plus the failures.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RankedSweep {
    pub rank_by: RankMetric,
    pub ranked: Vec<SweepEntry>,
    pub failed: Vec<FailedCombination>,
    pub cancelled: bool,
}

struct BacktestJob {
    status: JobStatus,
    result: Option<Arc<BacktestResult>>,
    updates: watch::Receiver<JobStatus>,
}

struct SweepJob {
    base_config: BacktestConfig,
    axes: Vec<SweepAxis>,
    status: JobStatus,
    report: Option<Arc<SweepReport>>,
    progress: SweepStatus,
    cancel: CancellationToken,
    updates: watch::Receiver<JobStatus>,
}

/// Job front end over the engine: runs backtests and sweeps on the blocking pool and keeps
/// their status and results addressable by id.
#[derive(Clone)]
pub struct BacktestService {
    catalog: StrategyCatalog,
    store: Arc<dyn CandleStore>,
    settings: EngineSettings,
    jobs: Arc<DashMap<String, BacktestJob>>,
    sweeps: Arc<DashMap<String, SweepJob>>,
}

impl BacktestService {
    pub fn new(
        catalog: StrategyCatalog,
        store: Arc<dyn CandleStore>,
        settings: EngineSettings,
    ) -> Self {
        Self {
            catalog,
            store,
            settings,
            jobs: Arc::new(DashMap::new()),
            sweeps: Arc::new(DashMap::new()),
        }
    }


    pub fn run_backtest(&self, config: &BacktestConfig) -> Result<BacktestResult, BacktestError> {
        config.validate()?;
        let data = MarketData::materialize(self.store.as_ref(), config)?;
        run_with_catalog(config, &data, &self.catalog)
    }

    pub fn run_per_symbol(
        &self,
        config: &BacktestConfig,
    ) -> Result<BTreeMap<String, BacktestResult>, BacktestError> {
        config.validate()?;
        let data = MarketData::materialize(self.store.as_ref(), config)?;
        run_per_symbol(config, &data, &self.catalog)
    }

    pub async fn submit_backtest(&self, config: BacktestConfig) -> String {
        let job_id = Uuid::new_v4().to_string();
        let (tx, rx) = watch::channel(JobStatus::Pending);
        self.jobs.insert(
            job_id.clone(),
            BacktestJob {
                status: JobStatus::Pending,
                result: None,
                updates: rx,
            },
        );

        let service = self.clone();
        let id = job_id.clone();
        tokio::task::spawn_blocking(move || {
            service.update_job(&id, &tx, JobStatus::Running, None);
            match service.run_backtest(&config) {
                Ok(result) => {
                    info!(
                        "Backtest job {} done: {} trades, final balance {:.2}",
                        id, result.performance.total_trades, result.performance.final_balance
                    );
                    service.update_job(&id, &tx, JobStatus::Done, Some(Arc::new(result)));
                }
                Err(err) => {
                    let payload = err.payload();
                    error!("Backtest job {} failed: {}", id, payload);
                    service.update_job(&id, &tx, JobStatus::Failed { error: payload }, None);
                }
            }
        });

        job_id
    }

    fn update_job(
        &self,
        job_id: &str,
        tx: &watch::Sender<JobStatus>,
        status: JobStatus,
        result: Option<Arc<BacktestResult>>,
    ) {
        if let Some(mut job) = self.jobs.get_mut(job_id) {
            job.status = status.clone();
            if result.is_some() {
                job.result = result;
            }
        }
        // The map is updated before waiters wake so they always see the result.
        let _ = tx.send(status);
    }

    pub fn get_job_status(&self, job_id: &str) -> Result<JobStatus, JobError> {
        self.jobs
            .get(job_id)
            .map(|job| job.status.clone())
            .ok_or_else(|| JobError::UnknownJob(job_id.to_string()))
    }

    pub fn get_job_result(&self, job_id: &str) -> Result<Arc<BacktestResult>, JobError> {
        let job = self
            .jobs
            .get(job_id)
            .ok_or_else(|| JobError::UnknownJob(job_id.to_string()))?;
        match (&job.status, &job.result) {
            (JobStatus::Done, Some(result)) => Ok(Arc::clone(result)),
            (JobStatus::Failed { error }, _) => Err(JobError::Failed(error.clone())),
            _ => Err(JobError::NotFinished(job_id.to_string())),
        }
    }

    pub async fn wait_for_job(&self, job_id: &str) -> Result<Arc<BacktestResult>, JobError> {
        let updates = self
            .jobs
            .get(job_id)
            .map(|job| job.updates.clone())
            .ok_or_else(|| JobError::UnknownJob(job_id.to_string()))?;
        wait_until_finished(updates).await;
        self.get_job_result(job_id)
    }

    /// Queues a parameter sweep. Grids over the combination cap (or with malformed axes) are
    /// rejected here, before any work starts.
    pub async fn submit_sweep(
        &self,
        base_config: BacktestConfig,
        axes: Vec<SweepAxis>,
    ) -> Result<String, JobError> {
        let total = combination_count(&axes, self.settings.max_sweep_combinations)?;
        let job_id = Uuid::new_v4().to_string();
        let (tx, rx) = watch::channel(JobStatus::Pending);
        let progress = SweepStatus::new();
        progress.set_total(total);
        let cancel = CancellationToken::new();
        self.sweeps.insert(
            job_id.clone(),
            SweepJob {
                base_config: base_config.clone(),
                axes: axes.clone(),
                status: JobStatus::Pending,
                report: None,
                progress: progress.clone(),
                cancel: cancel.clone(),
                updates: rx,
            },
        );
        info!("Sweep job {} queued with {} combinations", job_id, total);

        let service = self.clone();
        let id = job_id.clone();
        tokio::task::spawn_blocking(move || {
            service.update_sweep(&id, &tx, JobStatus::Running, None);
            let options = SweepOptions::from_settings(&service.settings);
            let outcome = base_config.validate().and_then(|_| {
                let data = MarketData::materialize(service.store.as_ref(), &base_config)?;
                run_sweep(
                    &base_config,
                    &axes,
                    &data,
                    &service.catalog,
                    &options,
                    &cancel,
                    &progress,
                )
            });
            match outcome {
                Ok(report) => {
                    service.update_sweep(&id, &tx, JobStatus::Done, Some(Arc::new(report)));
                }
                Err(err) => {
                    let payload = err.payload();
                    error!("Sweep job {} failed: {}", id, payload);
                    progress.set_phase("Failed");
                    service.update_sweep(&id, &tx, JobStatus::Failed { error: payload }, None);
                }
            }
        });

        Ok(job_id)
    }

    fn update_sweep(
        &self,
        job_id: &str,
        tx: &watch::Sender<JobStatus>,
        status: JobStatus,
        report: Option<Arc<SweepReport>>,
    ) {
        if let Some(mut job) = self.sweeps.get_mut(job_id) {
            job.status = status.clone();
            if report.is_some() {
                job.report = report;
            }
        }
        let _ = tx.send(status);
    }

    pub fn get_sweep_status(&self, job_id: &str) -> Result<SweepJobStatus, JobError> {
        self.sweeps
            .get(job_id)
            .map(|job| SweepJobStatus {
                status: job.status.clone(),
                progress: job.progress.snapshot(),
            })
            .ok_or_else(|| JobError::UnknownJob(job_id.to_string()))
    }

    pub fn get_sweep_definition(
        &self,
        job_id: &str,
    ) -> Result<(BacktestConfig, Vec<SweepAxis>), JobError> {
        self.sweeps
            .get(job_id)
            .map(|job| (job.base_config.clone(), job.axes.clone()))
            .ok_or_else(|| JobError::UnknownJob(job_id.to_string()))
    }

    pub fn get_sweep_result(
        &self,
        job_id: &str,
        rank_by: RankMetric,
    ) -> Result<RankedSweep, JobError> {
        let job = self
            .sweeps
            .get(job_id)
            .ok_or_else(|| JobError::UnknownJob(job_id.to_string()))?;
        match (&job.status, &job.report) {
            (JobStatus::Done, Some(report)) => Ok(RankedSweep {
                rank_by,
                ranked: report.ranked(rank_by).into_iter().cloned().collect(),
                failed: report.failed.clone(),
                cancelled: report.cancelled,
            }),
            (JobStatus::Failed { error }, _) => Err(JobError::Failed(error.clone())),
            _ => Err(JobError::NotFinished(job_id.to_string())),
        }
    }

    /// Stops the sweep before its next combination; runs already started complete.
    pub fn cancel_sweep(&self, job_id: &str) -> Result<(), JobError> {
        let job = self
            .sweeps
            .get(job_id)
            .ok_or_else(|| JobError::UnknownJob(job_id.to_string()))?;
        job.cancel.cancel();
        info!("Sweep job {} cancellation requested", job_id);
        Ok(())
    }

    pub async fn wait_for_sweep(
        &self,
        job_id: &str,
        rank_by: RankMetric,
    ) -> Result<RankedSweep, JobError> {
        let updates = self
            .sweeps
            .get(job_id)
            .map(|job| job.updates.clone())
            .ok_or_else(|| JobError::UnknownJob(job_id.to_string()))?;
        wait_until_finished(updates).await;
        self.get_sweep_result(job_id, rank_by)
    }
}

async fn wait_until_finished(mut updates: watch::Receiver<JobStatus>) {
    loop {
        if updates.borrow_and_update().is_finished() {
            return;
        }
        // A closed channel means the worker is gone; the registry holds the final status.
        if updates.changed().await.is_err() {
            return;
        }
    }
}
