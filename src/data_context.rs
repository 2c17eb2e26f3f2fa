use crate::candle_utils::{clip_to_range, normalize_symbol, sort_and_dedupe};
use crate::config::{BacktestConfig, DateRange, Timeframe};
use crate::error::BacktestError;
use crate::models::Candle;
use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use log::{debug, info};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fs::{self, File};
use std::io::{BufReader, BufWriter};
use std::path::Path;
use std::sync::Arc;

const MARKET_SNAPSHOT_VERSION: u32 = 1;

pub trait CandleStore: Send + Sync {
    fn load(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        range: &DateRange,
    ) -> Result<Vec<Candle>, BacktestError>;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotSeries {
    pub symbol: String,
    pub timeframe: Timeframe,
    pub candles: Vec<Candle>,
}

/// Versioned on-disk candle bundle: bincode for `.bin`, JSON for `.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MarketSnapshot {
    pub version: u32,
    pub generated_at: DateTime<Utc>,
    pub series: Vec<SnapshotSeries>,
}

fn is_json(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| ext.eq_ignore_ascii_case("json"))
        .unwrap_or(false)
}

impl MarketSnapshot {
    pub fn new(series: Vec<SnapshotSeries>) -> Self {
        Self {
            version: MARKET_SNAPSHOT_VERSION,
            generated_at: Utc::now(),
            series,
        }
    }

    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!("Loading market snapshot from {}", path.display());
        let file = File::open(path).with_context(|| {
            format!("Failed to open market snapshot at {}", path.display())
        })?;
        let reader = BufReader::new(file);
        let snapshot: MarketSnapshot = if is_json(path) {
            serde_json::from_reader(reader).context("Snapshot JSON decode failed")?
        } else {
            bincode::deserialize_from(reader).context("Snapshot decode failed")?
        };

        if snapshot.version != MARKET_SNAPSHOT_VERSION {
            return Err(anyhow!(
                "Market snapshot version mismatch (found {}, expected {})",
                snapshot.version,
                MARKET_SNAPSHOT_VERSION
            ));
        }
        Ok(snapshot)
    }

    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).with_context(|| {
                    format!("Failed to create snapshot directory {}", parent.display())
                })?;
            }
        }

        let file = File::create(path).with_context(|| {
            format!("Unable to create market snapshot at {}", path.display())
        })?;
        let writer = BufWriter::new(file);
        if is_json(path) {
            serde_json::to_writer(writer, self).context("Snapshot JSON encode failed")?;
        } else {
            bincode::serialize_into(writer, self).context("Snapshot encode failed")?;
        }
        let candle_count: usize = self.series.iter().map(|s| s.candles.len()).sum();
        info!(
            "Saved market snapshot with {} series ({} candles) to {}",
            self.series.len(),
            candle_count,
            path.display()
        );
        Ok(())
    }
}

#[derive(Debug, Clone, Default)]
pub struct InMemoryCandleStore {
    series: HashMap<(String, Timeframe), Vec<Candle>>,
}

impl InMemoryCandleStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, symbol: &str, timeframe: Timeframe, candles: Vec<Candle>) {
        let Some(symbol) = normalize_symbol(symbol) else {
            debug!("Ignoring candle series with blank symbol");
            return;
        };
        self.series
            .entry((symbol, timeframe))
            .or_default()
            .extend(candles);
    }

    pub fn from_snapshot(snapshot: MarketSnapshot) -> Self {
        let mut store = Self::new();
        for series in snapshot.series {
            store.insert(&series.symbol, series.timeframe, series.candles);
        }
        store
    }

    pub fn to_snapshot(&self) -> MarketSnapshot {
        let mut keys: Vec<&(String, Timeframe)> = self.series.keys().collect();
        keys.sort_by(|a, b| a.0.cmp(&b.0).then_with(|| a.1.as_str().cmp(b.1.as_str())));
        let series = keys
            .into_iter()
            .filter_map(|key| {
                self.series.get(key).map(|candles| SnapshotSeries {
                    symbol: key.0.clone(),
                    timeframe: key.1,
                    candles: candles.clone(),
                })
            })
            .collect();
        MarketSnapshot::new(series)
    }
}

impl CandleStore for InMemoryCandleStore {
    fn load(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        range: &DateRange,
    ) -> Result<Vec<Candle>, BacktestError> {
        let Some(symbol) = normalize_symbol(symbol) else {
            return Err(BacktestError::data("blank symbol"));
        };
        Ok(self
            .series
            .get(&(symbol, timeframe))
            .map(|candles| {
                candles
                    .iter()
                    .filter(|candle| range.contains(candle.timestamp))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }
}

#[derive(Debug, Clone)]
pub struct SnapshotCandleStore {
    inner: InMemoryCandleStore,
}

impl SnapshotCandleStore {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let snapshot = MarketSnapshot::load_from_file(path)?;
        Ok(Self {
            inner: InMemoryCandleStore::from_snapshot(snapshot),
        })
    }
}

impl CandleStore for SnapshotCandleStore {
    fn load(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        range: &DateRange,
    ) -> Result<Vec<Candle>, BacktestError> {
        self.inner.load(symbol, timeframe, range)
    }
}

/// Fully materialized, read-only candles for one run configuration.
///
/// Series sit behind `Arc` so sweep workers and per-symbol runs share them without copying.
#[derive(Debug, Clone)]
pub struct MarketData {
    timeframe: Timeframe,
    series: BTreeMap<String, Arc<Vec<Candle>>>,
    timeline: Arc<Vec<DateTime<Utc>>>,
}

impl MarketData {
    pub fn materialize(
        store: &dyn CandleStore,
        config: &BacktestConfig,
    ) -> Result<Self, BacktestError> {
        let mut series = BTreeMap::new();
        for symbol in config.ordered_symbols() {
            let mut candles = store.load(&symbol, config.timeframe, &config.date_range)?;
            clip_to_range(
                &mut candles,
                config.date_range.start,
                config.date_range.end,
            );
            series.insert(symbol, candles);
        }
        let data = Self::from_series(config.timeframe, series)?;
        info!(
            "Materialized {} candles across {} symbols ({} steps, {})",
            data.candle_count(),
            data.series.len(),
            data.timeline.len(),
            data.timeframe
        );
        Ok(data)
    }

    /// Sorts and dedupes each series and builds the merged timeline. Gaps stay gaps.
    pub fn from_series(
        timeframe: Timeframe,
        series: BTreeMap<String, Vec<Candle>>,
    ) -> Result<Self, BacktestError> {
        if series.is_empty() {
            return Err(BacktestError::data("no symbols requested"));
        }
        let mut prepared = BTreeMap::new();
        let mut timestamps = BTreeSet::new();
        for (symbol, mut candles) in series {
            if candles.is_empty() {
                return Err(BacktestError::data(format!(
                    "no candles for {} ({})",
                    symbol, timeframe
                )));
            }
            sort_and_dedupe(&symbol, &mut candles);
            timestamps.extend(candles.iter().map(|candle| candle.timestamp));
            prepared.insert(symbol, Arc::new(candles));
        }
        Ok(Self {
            timeframe,
            series: prepared,
            timeline: Arc::new(timestamps.into_iter().collect()),
        })
    }

    pub fn timeframe(&self) -> Timeframe {
        self.timeframe
    }

    pub fn symbols(&self) -> Vec<String> {
        self.series.keys().cloned().collect()
    }

    pub fn candles(&self, symbol: &str) -> Option<&[Candle]> {
        self.series.get(symbol).map(|candles| candles.as_slice())
    }

    pub fn timeline(&self) -> &[DateTime<Utc>] {
        &self.timeline
    }

    pub fn candle_count(&self) -> usize {
        self.series.values().map(|candles| candles.len()).sum()
    }

    pub fn restrict_to_symbol(&self, symbol: &str) -> Result<Self, BacktestError> {
        let candles = self
            .series
            .get(symbol)
            .cloned()
            .ok_or_else(|| BacktestError::data(format!("no candles for {}", symbol)))?;
        let timeline: Vec<DateTime<Utc>> = candles.iter().map(|c| c.timestamp).collect();
        Ok(Self {
            timeframe: self.timeframe,
            series: BTreeMap::from([(symbol.to_string(), candles)]),
            timeline: Arc::new(timeline),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    fn candle(ts: DateTime<Utc>, close: f64) -> Candle {
        Candle {
            timestamp: ts,
            open: close,
            high: close + 1.0,
            low: close - 1.0,
            close,
            volume: 10.0,
        }
    }

    fn config(symbols: &[&str], start: DateTime<Utc>, end: DateTime<Utc>) -> BacktestConfig {
        BacktestConfig::new(
            symbols.iter().map(|s| s.to_string()).collect(),
            DateRange { start, end },
            Timeframe::H1,
            "breakout",
        )
    }

    #[test]
    fn materialize_merges_timeline_without_filling_gaps() {
        let base = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let mut store = InMemoryCandleStore::new();
        store.insert(
            "btcusdt",
            Timeframe::H1,
            vec![
                candle(base + Duration::hours(2), 102.0),
                candle(base, 100.0),
                candle(base, 999.0),
            ],
        );
        store.insert(
            "ETHUSDT",
            Timeframe::H1,
            vec![candle(base + Duration::hours(1), 50.0)],
        );

        let cfg = config(&["ETHUSDT", "BTCUSDT"], base, base + Duration::hours(5));
        let data = MarketData::materialize(&store, &cfg).unwrap();
        assert_eq!(data.symbols(), vec!["BTCUSDT".to_string(), "ETHUSDT".to_string()]);
        assert_eq!(data.timeline().len(), 3);
        let btc = data.candles("BTCUSDT").unwrap();
        assert_eq!(btc.len(), 2);
        assert_eq!(btc[0].close, 100.0);
    }

    #[test]
    fn missing_symbol_is_data_error() {
        let base = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let mut store = InMemoryCandleStore::new();
        store.insert("BTCUSDT", Timeframe::H1, vec![candle(base, 100.0)]);
        let cfg = config(&["BTCUSDT", "DOGEUSDT"], base, base + Duration::hours(5));
        let err = MarketData::materialize(&store, &cfg).unwrap_err();
        assert_eq!(err.kind(), "data_error");

        let out_of_range = config(
            &["BTCUSDT"],
            base + Duration::days(1),
            base + Duration::days(2),
        );
        assert!(MarketData::materialize(&store, &out_of_range).is_err());
    }

    #[test]
    fn snapshot_round_trips_through_bincode_and_json() {
        let base = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let mut store = InMemoryCandleStore::new();
        store.insert(
            "BTCUSDT",
            Timeframe::H4,
            vec![candle(base, 100.0), candle(base + Duration::hours(4), 101.0)],
        );
        let snapshot = store.to_snapshot();
        let dir = std::env::temp_dir().join(format!("riskcraft-snapshot-{}", uuid::Uuid::new_v4()));

        for name in ["market.bin", "market.json"] {
            let path = dir.join(name);
            snapshot.save_to_file(&path).unwrap();
            let reopened = SnapshotCandleStore::open(&path).unwrap();
            let range = DateRange {
                start: base,
                end: base + Duration::days(1),
            };
            let candles = reopened.load("BTCUSDT", Timeframe::H4, &range).unwrap();
            assert_eq!(candles.len(), 2);
            assert!(reopened
                .load("BTCUSDT", Timeframe::H1, &range)
                .unwrap()
                .is_empty());
        }
        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn restrict_to_symbol_keeps_own_timeline() {
        let base = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let mut series = BTreeMap::new();
        series.insert("AAA".to_string(), vec![candle(base, 1.0)]);
        series.insert(
            "BBB".to_string(),
            vec![candle(base + Duration::hours(1), 2.0)],
        );
        let data = MarketData::from_series(Timeframe::H1, series).unwrap();
        assert_eq!(data.timeline().len(), 2);
        let single = data.restrict_to_symbol("BBB").unwrap();
        assert_eq!(single.timeline().len(), 1);
        assert!(single.restrict_to_symbol("AAA").is_err());
    }
}
