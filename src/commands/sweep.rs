use crate::commands::market_data_snapshot::open_snapshot_store;
use crate::commands::{load_config, write_json};
use crate::config::EngineSettings;
use crate::data_context::MarketData;
use crate::strategy::StrategyCatalog;
use crate::sweep::{
    run_sweep, CancellationToken, FailedCombination, RankMetric, SweepAxis, SweepEntry,
    SweepOptions,
};
use crate::sweep_status::SweepStatus;
use anyhow::Result;
use log::{info, warn};
use serde::Serialize;
use std::path::Path;

#[derive(Serialize)]
struct SweepOutput<'a> {
    rank_by: RankMetric,
    total_combinations: usize,
    cancelled: bool,
    ranked: Vec<&'a SweepEntry>,
    failed: &'a [FailedCombination],
}

#[allow(clippy::too_many_arguments)]
pub async fn run(
    catalog: StrategyCatalog,
    settings: EngineSettings,
    config_path: &Path,
    data_path: &Path,
    axes: Vec<SweepAxis>,
    rank_by: RankMetric,
    top: Option<usize>,
    output: Option<&Path>,
    show_progress: bool,
) -> Result<()> {
    let config = load_config(config_path)?;
    let store = open_snapshot_store(data_path).await?;

    let mut options = SweepOptions::from_settings(&settings);
    options.show_progress = show_progress;
    let cancel = CancellationToken::new();
    let status = SweepStatus::new();

    let ctrl_c_cancel = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received, finishing running combinations and stopping the sweep");
            ctrl_c_cancel.cancel();
        }
    });

    let sweep_status = status.clone();
    let report = tokio::task::spawn_blocking(move || {
        let data = MarketData::materialize(&store, &config)?;
        run_sweep(
            &config,
            &axes,
            &data,
            &catalog,
            &options,
            &cancel,
            &sweep_status,
        )
    })
    .await??;

    let snapshot = status.snapshot();
    let mut ranked = report.ranked(rank_by);
    if let Some(limit) = top {
        ranked.truncate(limit);
    }
    for (position, entry) in ranked.iter().enumerate() {
        info!(
            "#{} combination {}: {} = {:?}, trades {}, params {:?}",
            position + 1,
            entry.index,
            format!("{:?}", rank_by).to_lowercase(),
            rank_by.value(&entry.result.performance),
            entry.result.performance.total_trades,
            entry.parameters
        );
    }
    if !report.failed.is_empty() {
        warn!("{} combinations failed", report.failed.len());
    }

    write_json(
        &SweepOutput {
            rank_by,
            total_combinations: snapshot.total_combinations,
            cancelled: report.cancelled,
            ranked,
            failed: &report.failed,
        },
        output,
    )
}
