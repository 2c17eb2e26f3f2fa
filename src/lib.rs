pub mod candle_utils;
pub mod commands;
pub mod config;
pub mod data_context;
pub mod engine;
pub mod error;
pub mod indicators;
pub mod models;
pub mod param_utils;
pub mod performance;
pub mod risk;
pub mod service;
pub mod strategy;
pub mod strategy_utils;
pub mod sweep;
pub mod sweep_status;

pub use config::{BacktestConfig, DateRange, EngineSettings, RiskSettings, StopMode, Timeframe};
pub use data_context::{CandleStore, InMemoryCandleStore, MarketData, SnapshotCandleStore};
pub use engine::{run_with_catalog, Engine, IntrabarFeed, RecordedIntrabarFeed};
pub use error::{BacktestError, ErrorPayload, JobError};
pub use models::{BacktestResult, Candle, PerformanceMetrics, Side, StrategySignal, Trade};
pub use service::{BacktestService, JobStatus};
pub use strategy::{Strategy, StrategyCatalog, StrategyState};
pub use sweep::{RankMetric, SweepAxis, SweepReport};
