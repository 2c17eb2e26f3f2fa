use crate::commands::market_data_snapshot::open_snapshot_store;
use crate::commands::{load_config, write_json};
use crate::config::EngineSettings;
use crate::service::BacktestService;
use crate::strategy::StrategyCatalog;
use anyhow::{anyhow, Result};
use log::info;
use std::path::Path;
use std::sync::Arc;

pub async fn run(
    catalog: StrategyCatalog,
    settings: EngineSettings,
    config_path: &Path,
    data_path: &Path,
    output: Option<&Path>,
    per_symbol: bool,
) -> Result<()> {
    let config = load_config(config_path)?;
    info!(
        "Backtesting {} on {} symbols ({}, {} - {})",
        config.strategy_name,
        config.symbols.len(),
        config.timeframe,
        config.date_range.start.format("%Y-%m-%d %H:%M"),
        config.date_range.end.format("%Y-%m-%d %H:%M")
    );
    let store = open_snapshot_store(data_path).await?;
    let service = BacktestService::new(catalog, Arc::new(store), settings);

    if per_symbol {
        let worker = service.clone();
        let results = tokio::task::spawn_blocking(move || worker.run_per_symbol(&config)).await??;
        for (symbol, result) in &results {
            info!(
                "{}: {} trades, sharpe {:?}, max drawdown {:.2}%, final balance {:.2}",
                symbol,
                result.performance.total_trades,
                result.performance.sharpe,
                result.performance.max_drawdown * 100.0,
                result.performance.final_balance
            );
        }
        return write_json(&results, output);
    }

    let job_id = service.submit_backtest(config).await;
    let result = service
        .wait_for_job(&job_id)
        .await
        .map_err(|err| anyhow!("Backtest job {} did not complete: {}", job_id, err))?;
    info!(
        "Backtest complete: {} trades, win rate {:?}, sharpe {:?}, max drawdown {:.2}%, final balance {:.2}",
        result.performance.total_trades,
        result.performance.win_rate,
        result.performance.sharpe,
        result.performance.max_drawdown * 100.0,
        result.performance.final_balance
    );
    write_json(result.as_ref(), output)
}
