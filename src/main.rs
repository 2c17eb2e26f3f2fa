use anyhow::Result;
use clap::{Parser, Subcommand};
use log::info;
use riskcraft::{
    commands::{backtest, strategies, sweep},
    config::EngineSettings,
    strategy::StrategyCatalog,
    sweep::{RankMetric, SweepAxis},
};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "riskcraft")]
#[command(about = "Strategy backtesting with adaptive stops, targets and position sizing")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run one backtest from a JSON config over a market data snapshot
    Backtest {
        /// Backtest config (JSON)
        #[arg(short, long, value_name = "PATH")]
        config: PathBuf,
        /// Market data snapshot (.bin or .json)
        #[arg(short, long, value_name = "PATH")]
        data: PathBuf,
        /// Write the result JSON here instead of stdout
        #[arg(short, long, value_name = "PATH")]
        output: Option<PathBuf>,
        /// Run every symbol as its own isolated backtest
        #[arg(long)]
        per_symbol: bool,
    },
    /// Sweep parameters over a grid and rank the results
    Sweep {
        /// Base backtest config (JSON)
        #[arg(short, long, value_name = "PATH")]
        config: PathBuf,
        /// Market data snapshot (.bin or .json)
        #[arg(short, long, value_name = "PATH")]
        data: PathBuf,
        /// Swept parameter as name=start:end:step (repeatable)
        #[arg(short, long = "axis", value_name = "AXIS", required = true)]
        axes: Vec<SweepAxis>,
        /// Metric used to rank combinations
        #[arg(long, default_value = "sharpe")]
        rank_by: RankMetric,
        /// Only report the best N combinations
        #[arg(long)]
        top: Option<usize>,
        /// Write the ranked results JSON here instead of stdout
        #[arg(short, long, value_name = "PATH")]
        output: Option<PathBuf>,
        /// Show a progress bar while the sweep runs
        #[arg(long)]
        progress: bool,
    },
    /// List the registered strategies and their parameters
    Strategies,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let settings = EngineSettings::from_env()?;
    let catalog = StrategyCatalog::with_builtin();

    match cli.command {
        Commands::Backtest {
            config,
            data,
            output,
            per_symbol,
        } => {
            backtest::run(
                catalog,
                settings,
                &config,
                &data,
                output.as_deref(),
                per_symbol,
            )
            .await?;
        }
        Commands::Sweep {
            config,
            data,
            axes,
            rank_by,
            top,
            output,
            progress,
        } => {
            info!(
                "Sweeping {} axes with up to {} worker threads (cap {} combinations)",
                axes.len(),
                settings.worker_threads,
                settings.max_sweep_combinations
            );
            sweep::run(
                catalog,
                settings,
                &config,
                &data,
                axes,
                rank_by,
                top,
                output.as_deref(),
                progress,
            )
            .await?;
        }
        Commands::Strategies => {
            strategies::run(&catalog)?;
        }
    }

    Ok(())
}
