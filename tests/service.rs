use chrono::{DateTime, Duration, TimeZone, Utc};
use riskcraft::config::{BacktestConfig, DateRange, EngineSettings, Timeframe};
use riskcraft::data_context::{InMemoryCandleStore, MarketSnapshot};
use riskcraft::error::JobError;
use riskcraft::models::Candle;
use riskcraft::service::{BacktestService, JobStatus};
use riskcraft::strategy::StrategyCatalog;
use riskcraft::sweep::{RankMetric, SweepAxis};
use std::collections::HashMap;
use std::sync::{Arc, Once};

fn ensure_test_env() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = env_logger::builder().is_test(true).try_init();
    });
}

fn ts(i: usize) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap() + Duration::hours(i as i64)
}

fn wave(count: usize, phase: f64) -> Vec<Candle> {
    let mut prev: f64 = 200.0;
    (0..count)
        .map(|i| {
            let close = 200.0 + 15.0 * ((i as f64 + phase) / 9.0).sin();
            let candle = Candle {
                timestamp: ts(i),
                open: prev,
                high: prev.max(close) + 1.0,
                low: prev.min(close) - 1.0,
                close,
                volume: 500.0 + (i % 7) as f64 * 50.0,
            };
            prev = close;
            candle
        })
        .collect()
}

fn store() -> InMemoryCandleStore {
    let mut store = InMemoryCandleStore::new();
    store.insert("BTCUSDT", Timeframe::H1, wave(200, 0.0));
    store.insert("SOLUSDT", Timeframe::H1, wave(200, 4.0));
    store
}

fn service_with(settings: EngineSettings) -> BacktestService {
    ensure_test_env();
    BacktestService::new(StrategyCatalog::with_builtin(), Arc::new(store()), settings)
}

fn service() -> BacktestService {
    service_with(EngineSettings {
        max_sweep_combinations: 50,
        worker_threads: 2,
    })
}

fn config(strategy: &str) -> BacktestConfig {
    let mut config = BacktestConfig::new(
        vec!["BTCUSDT".to_string(), "SOLUSDT".to_string()],
        DateRange {
            start: ts(0),
            end: ts(500),
        },
        Timeframe::H1,
        strategy,
    );
    config.min_confidence = 0.0;
    config
}

#[tokio::test]
async fn submitted_backtest_matches_direct_run() {
    let service = service();
    let job_id = service.submit_backtest(config("trend_following")).await;
    let result = service.wait_for_job(&job_id).await.unwrap();

    assert_eq!(service.get_job_status(&job_id).unwrap(), JobStatus::Done);
    let direct = service.run_backtest(&config("trend_following")).unwrap();
    assert_eq!(result.as_ref(), &direct);
    assert_eq!(service.get_job_result(&job_id).unwrap().as_ref(), &direct);
}

#[tokio::test]
async fn unknown_job_ids_are_reported() {
    let service = service();
    assert_eq!(
        service.get_job_status("missing"),
        Err(JobError::UnknownJob("missing".to_string()))
    );
    assert!(matches!(
        service.get_job_result("missing"),
        Err(JobError::UnknownJob(_))
    ));
    assert!(matches!(
        service.get_sweep_status("missing"),
        Err(JobError::UnknownJob(_))
    ));
    assert!(matches!(
        service.cancel_sweep("missing"),
        Err(JobError::UnknownJob(_))
    ));
}

#[tokio::test]
async fn fatal_errors_fail_the_job_with_a_payload() {
    let service = service();

    let job_id = service.submit_backtest(config("no_such_strategy")).await;
    let err = service.wait_for_job(&job_id).await.unwrap_err();
    let payload = match err {
        JobError::Failed(payload) => payload,
        other => panic!("expected a failed job, got {:?}", other),
    };
    assert_eq!(payload.kind, "configuration_error");
    assert!(payload.message.contains("no_such_strategy"));
    assert!(matches!(
        service.get_job_status(&job_id).unwrap(),
        JobStatus::Failed { .. }
    ));

    let mut missing = config("trend_following");
    missing.symbols = vec!["DOGEUSDT".to_string()];
    let job_id = service.submit_backtest(missing).await;
    let JobError::Failed(payload) = service.wait_for_job(&job_id).await.unwrap_err() else {
        panic!("expected a failed job");
    };
    assert_eq!(payload.kind, "data_error");

    let status = serde_json::to_value(service.get_job_status(&job_id).unwrap()).unwrap();
    assert_eq!(status["status"], "failed");
    assert_eq!(status["error"]["kind"], "data_error");
}

#[tokio::test]
async fn sweep_job_ranks_results() {
    let service = service();
    let job_id = service
        .submit_sweep(
            config("trend_following"),
            vec![
                SweepAxis::new("atr_multiplier", 1.5, 2.5, 0.5),
                SweepAxis::new("fast_period", 5.0, 7.0, 2.0),
            ],
        )
        .await
        .unwrap();
    let sweep = service
        .wait_for_sweep(&job_id, RankMetric::TotalReturn)
        .await
        .unwrap();

    assert_eq!(sweep.ranked.len(), 6);
    assert!(sweep.failed.is_empty());
    assert!(!sweep.cancelled);
    for pair in sweep.ranked.windows(2) {
        assert!(
            pair[0].result.performance.total_return >= pair[1].result.performance.total_return
        );
    }

    let status = service.get_sweep_status(&job_id).unwrap();
    assert_eq!(status.status, JobStatus::Done);
    assert_eq!(status.progress.total_combinations, 6);
    assert_eq!(status.progress.completed_combinations, 6);

    let by_drawdown = service
        .get_sweep_result(&job_id, RankMetric::MaxDrawdown)
        .unwrap();
    for pair in by_drawdown.ranked.windows(2) {
        assert!(
            pair[0].result.performance.max_drawdown <= pair[1].result.performance.max_drawdown
        );
    }

    let (base, axes) = service.get_sweep_definition(&job_id).unwrap();
    assert_eq!(base.strategy_name, "trend_following");
    assert_eq!(axes.len(), 2);
}

#[tokio::test]
async fn oversized_sweeps_are_rejected_at_submission() {
    let service = service_with(EngineSettings {
        max_sweep_combinations: 10,
        worker_threads: 2,
    });
    let err = service
        .submit_sweep(
            config("trend_following"),
            vec![
                SweepAxis::new("atr_multiplier", 1.0, 3.0, 0.5),
                SweepAxis::new("fast_period", 3.0, 8.0, 1.0),
            ],
        )
        .await
        .unwrap_err();
    let inner = match err {
        JobError::Rejected(inner) => inner,
        other => panic!("expected a rejected submission, got {:?}", other),
    };
    assert_eq!(inner.kind(), "too_many_combinations");
}

#[tokio::test]
async fn sweep_without_axes_is_rejected_at_submission() {
    let service = service();
    let err = service
        .submit_sweep(config("trend_following"), Vec::new())
        .await
        .unwrap_err();
    let inner = match err {
        JobError::Rejected(inner) => inner,
        other => panic!("expected a rejected submission, got {:?}", other),
    };
    assert_eq!(inner.kind(), "configuration_error");
}

#[tokio::test]
async fn cancelled_sweep_still_reports() {
    let service = service_with(EngineSettings {
        max_sweep_combinations: 500,
        worker_threads: 1,
    });
    let job_id = service
        .submit_sweep(
            config("trend_following"),
            vec![SweepAxis::new("atr_multiplier", 1.0, 40.0, 0.25)],
        )
        .await
        .unwrap();
    service.cancel_sweep(&job_id).unwrap();
    let sweep = service
        .wait_for_sweep(&job_id, RankMetric::Sharpe)
        .await
        .unwrap();

    let status = service.get_sweep_status(&job_id).unwrap();
    assert_eq!(status.status, JobStatus::Done);
    let total = status.progress.total_combinations;
    assert_eq!(total, 157);
    // Cancellation lands between combinations; whatever already ran is kept.
    assert!(sweep.ranked.len() < total);
    assert!(sweep.cancelled);
}

#[test]
fn engine_settings_come_from_the_environment_map() {
    let mut settings = HashMap::new();
    settings.insert("BACKTEST_MAX_SWEEP_COMBINATIONS".to_string(), "250".to_string());
    settings.insert("BACKTEST_WORKER_THREADS".to_string(), "3".to_string());
    let parsed = EngineSettings::from_settings_map(&settings).unwrap();
    assert_eq!(parsed.max_sweep_combinations, 250);
    assert_eq!(parsed.worker_threads, 3);

    settings.insert("BACKTEST_WORKER_THREADS".to_string(), "many".to_string());
    assert!(EngineSettings::from_settings_map(&settings).is_err());
}

#[test]
fn snapshot_round_trip_through_a_file_backed_store() {
    let dir = std::env::temp_dir().join(format!("riskcraft-snapshot-{}", std::process::id()));
    let path = dir.join("market-data.bin");
    store().to_snapshot().save_to_file(&path).unwrap();

    let loaded = MarketSnapshot::load_from_file(&path).unwrap();
    assert_eq!(loaded.series.len(), 2);
    assert_eq!(loaded.series[0].symbol, "BTCUSDT");

    let service = BacktestService::new(
        StrategyCatalog::with_builtin(),
        Arc::new(riskcraft::data_context::SnapshotCandleStore::open(&path).unwrap()),
        EngineSettings::default(),
    );
    let from_file = service.run_backtest(&config("mean_reversion")).unwrap();
    let in_memory = service_with(EngineSettings::default())
        .run_backtest(&config("mean_reversion"))
        .unwrap();
    assert_eq!(from_file, in_memory);
    let _ = std::fs::remove_dir_all(&dir);
}
