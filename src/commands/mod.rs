pub mod backtest;
pub mod market_data_snapshot;
pub mod strategies;
pub mod sweep;

use crate::config::BacktestConfig;
use anyhow::{Context, Result};
use log::info;
use serde::Serialize;
use std::fs::File;
use std::io::{BufReader, BufWriter, Write};
use std::path::Path;

pub fn load_config(path: &Path) -> Result<BacktestConfig> {
    let file = File::open(path)
        .with_context(|| format!("Failed to open backtest config at {}", path.display()))?;
    let config: BacktestConfig = serde_json::from_reader(BufReader::new(file))
        .with_context(|| format!("Invalid backtest config in {}", path.display()))?;
    config.validate()?;
    Ok(config)
}

pub fn write_json<T: Serialize>(value: &T, output: Option<&Path>) -> Result<()> {
    match output {
        Some(path) => {
            let file = File::create(path)
                .with_context(|| format!("Unable to create output file {}", path.display()))?;
            let mut writer = BufWriter::new(file);
            serde_json::to_writer_pretty(&mut writer, value).context("Result encode failed")?;
            writer.flush()?;
            info!("Results written to {}", path.display());
        }
        None => {
            let stdout = std::io::stdout();
            let mut handle = stdout.lock();
            serde_json::to_writer_pretty(&mut handle, value).context("Result encode failed")?;
            writeln!(handle)?;
        }
    }
    Ok(())
}
