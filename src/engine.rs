use crate::config::BacktestConfig;
use crate::data_context::MarketData;
use crate::error::BacktestError;
use crate::models::*;
use crate::performance::PerformanceCalculator;
use crate::risk::RiskEngine;
use crate::strategy::{Strategy, StrategyCatalog, StrategyState};
use crate::strategy_utils::meets_confidence_threshold;
use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

const QUANTITY_EPSILON: f64 = 1e-9;

/// Ordered prices traded inside one bar, used to decide which exit level was touched first.
pub trait IntrabarFeed: Send + Sync {
    fn path(&self, symbol: &str, timestamp: DateTime<Utc>) -> Option<Vec<f64>>;
}

#[derive(Debug, Clone, Default)]
pub struct RecordedIntrabarFeed {
    paths: HashMap<(String, DateTime<Utc>), Vec<f64>>,
}

impl RecordedIntrabarFeed {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, symbol: &str, timestamp: DateTime<Utc>, path: Vec<f64>) {
        self.paths.insert((symbol.to_string(), timestamp), path);
    }
}

impl IntrabarFeed for RecordedIntrabarFeed {
    fn path(&self, symbol: &str, timestamp: DateTime<Utc>) -> Option<Vec<f64>> {
        self.paths.get(&(symbol.to_string(), timestamp)).cloned()
    }
}

#[derive(Debug, Clone, PartialEq)]
struct PlannedExit {
    reason: ExitReason,
    price: f64,
    quantity: f64,
    level: Option<String>,
}

struct RunState {
    cash: f64,
    peak_equity: f64,
    positions: BTreeMap<String, Position>,
    trades: Vec<Trade>,
    equity_curve: Vec<EquityPoint>,
    strategy_states: HashMap<String, StrategyState>,
    last_close: HashMap<String, f64>,
    skipped_signals: u64,
    rejected_orders: u64,
}

impl RunState {
    fn new(initial_capital: f64) -> Self {
        Self {
            cash: initial_capital,
            peak_equity: initial_capital,
            positions: BTreeMap::new(),
            trades: Vec::new(),
            equity_curve: Vec::new(),
            strategy_states: HashMap::new(),
            last_close: HashMap::new(),
            skipped_signals: 0,
            rejected_orders: 0,
        }
    }

    fn mark_price(&self, position: &Position) -> f64 {
        self.last_close
            .get(&position.symbol)
            .copied()
            .unwrap_or(position.entry_price)
    }

    fn equity(&self) -> f64 {
        self.cash
            + self
                .positions
                .values()
                .map(|position| position.mark_to_market(self.mark_price(position)))
                .sum::<f64>()
    }

    fn record_equity(&mut self, timestamp: DateTime<Utc>) {
        let equity = self.equity();
        if equity > self.peak_equity {
            self.peak_equity = equity;
        }
        let drawdown = if self.peak_equity > 0.0 {
            ((self.peak_equity - equity) / self.peak_equity).clamp(0.0, 1.0)
        } else {
            0.0
        };
        self.equity_curve.push(EquityPoint {
            timestamp,
            equity,
            drawdown: if drawdown.is_finite() { drawdown } else { 1.0 },
        });
    }
}

pub struct Engine {
    config: BacktestConfig,
    risk: RiskEngine,
    intrabar: Option<Arc<dyn IntrabarFeed>>,
}

impl Engine {
    pub fn new(config: BacktestConfig) -> Result<Self, BacktestError> {
        config.validate()?;
        let risk = RiskEngine::from_config(&config);
        Ok(Self {
            config,
            risk,
            intrabar: None,
        })
    }

    /// Resolves same-bar stop/target ambiguity from recorded price paths instead of assuming
    /// the stop traded first.
    pub fn with_intrabar_feed(mut self, feed: Arc<dyn IntrabarFeed>) -> Self {
        self.intrabar = Some(feed);
        self
    }

    pub fn run(
        &self,
        strategy: &dyn Strategy,
        data: &MarketData,
    ) -> Result<BacktestResult, BacktestError> {
        if data.timeline().is_empty() {
            return Err(BacktestError::data("no candles to replay"));
        }
        let symbols = data.symbols();
        let mut series: Vec<(&str, &[Candle])> = Vec::with_capacity(symbols.len());
        for symbol in &symbols {
            let candles = data
                .candles(symbol)
                .ok_or_else(|| BacktestError::data(format!("no candles for {}", symbol)))?;
            series.push((symbol.as_str(), candles));
        }
        let mut cursors = vec![0usize; series.len()];
        let mut state = RunState::new(self.config.initial_capital);

        debug!(
            "Starting backtest of {} over {} symbols and {} steps",
            strategy.name(),
            series.len(),
            data.timeline().len()
        );

        for &timestamp in data.timeline() {
            // `series` is alphabetical, which fixes the order of same-timestamp signals.
            for (slot, (symbol, candles)) in series.iter().enumerate() {
                let index = cursors[slot];
                if index >= candles.len() || candles[index].timestamp != timestamp {
                    continue;
                }
                cursors[slot] += 1;
                let window = &candles[..=index];
                let candle = &candles[index];
                if candle.is_valid() {
                    state.last_close.insert(symbol.to_string(), candle.close);
                }

                self.manage_position(&mut state, symbol, window, timestamp);
                self.evaluate_symbol(&mut state, strategy, symbol, window, timestamp);
            }
            state.record_equity(timestamp);
        }

        Ok(self.finish(state, strategy.name()))
    }

    fn finish(&self, state: RunState, strategy_name: &str) -> BacktestResult {
        let unrealized: Vec<UnrealizedPosition> = state
            .positions
            .values()
            .map(|position| {
                let mark_price = state.mark_price(position);
                UnrealizedPosition {
                    symbol: position.symbol.clone(),
                    side: position.side,
                    entry_price: position.entry_price,
                    quantity: position.remaining_quantity,
                    entry_time: position.entry_time,
                    active_stop: position.active_stop(),
                    mark_price,
                    unrealized_pnl: position.unrealized_pnl(mark_price),
                }
            })
            .collect();

        let performance = PerformanceCalculator::calculate_performance(
            &state.trades,
            &state.equity_curve,
            &unrealized,
            self.config.initial_capital,
            self.config.timeframe,
        );

        info!(
            "Backtest {} finished: {} trades, {} open, final balance {:.2}, skipped {} signals, rejected {} orders",
            strategy_name,
            performance.total_trades,
            unrealized.len(),
            performance.final_balance,
            state.skipped_signals,
            state.rejected_orders
        );

        BacktestResult {
            trades: state.trades,
            equity_curve: state.equity_curve,
            performance,
            skipped_signals: state.skipped_signals,
            rejected_orders: state.rejected_orders,
            unrealized,
        }
    }

    fn manage_position(
        &self,
        state: &mut RunState,
        symbol: &str,
        window: &[Candle],
        timestamp: DateTime<Utc>,
    ) {
        let Some(position) = state.positions.get_mut(symbol) else {
            return;
        };
        // Entered on this bar's close; its range belongs to the past.
        if position.entry_time >= timestamp {
            return;
        }
        if position.state == PositionState::Opening {
            position.state = PositionState::Open;
        }
        let Some((candle, prior)) = window.split_last() else {
            return;
        };
        if !candle.is_valid() {
            return;
        }

        if let Some(stop) = self.risk.trail(prior, position.active_stop(), position.side) {
            if position.trailing_stop != Some(stop) {
                debug!(
                    "{} trailing stop {:.6} -> {:.6}",
                    symbol,
                    position.active_stop(),
                    stop
                );
                position.trailing_stop = Some(stop);
            }
        }

        let path = self
            .intrabar
            .as_ref()
            .and_then(|feed| feed.path(symbol, timestamp));
        let mut exits = plan_bar_exits(
            position,
            candle,
            path.as_deref(),
            self.config.risk.partial_exits,
        );

        let remaining_after: f64 =
            position.remaining_quantity - exits.iter().map(|exit| exit.quantity).sum::<f64>();
        if remaining_after > QUANTITY_EPSILON {
            if let Some(limit) = self.config.max_holding_duration() {
                if timestamp - position.entry_time >= limit {
                    exits.push(PlannedExit {
                        reason: ExitReason::TimeExit,
                        price: candle.close,
                        quantity: remaining_after,
                        level: None,
                    });
                }
            }
        }

        for exit in exits {
            self.fill_exit(state, symbol, exit, timestamp);
        }
    }

    fn evaluate_symbol(
        &self,
        state: &mut RunState,
        strategy: &dyn Strategy,
        symbol: &str,
        window: &[Candle],
        timestamp: DateTime<Utc>,
    ) {
        let carried = state.strategy_states.remove(symbol).unwrap_or_default();
        let (signal, next) = strategy.evaluate(symbol, window, &carried);
        state.strategy_states.insert(symbol.to_string(), next);

        let Some(candle) = window.last().filter(|candle| candle.is_valid()) else {
            return;
        };
        let Some(side) = signal.direction.side() else {
            return;
        };
        if !meets_confidence_threshold(signal.confidence, self.config.min_confidence) {
            return;
        }

        if let Some(position) = state.positions.get(symbol) {
            if self.config.exit_on_opposite_signal
                && position.side != side
                && position.entry_time < timestamp
            {
                let quantity = position.remaining_quantity;
                self.fill_exit(
                    state,
                    symbol,
                    PlannedExit {
                        reason: ExitReason::ManualClose,
                        price: candle.close,
                        quantity,
                        level: None,
                    },
                    timestamp,
                );
            }
            return;
        }

        if side == Side::Short && !self.config.allow_short {
            return;
        }
        if state.positions.len() >= self.config.max_positions {
            debug!(
                "{} {} signal skipped at {}: {} positions already open",
                symbol,
                side.as_str(),
                timestamp,
                state.positions.len()
            );
            state.skipped_signals += 1;
            return;
        }

        self.open_position(state, symbol, window, candle.close, side, timestamp);
    }

    fn open_position(
        &self,
        state: &mut RunState,
        symbol: &str,
        window: &[Candle],
        close: f64,
        side: Side,
        timestamp: DateTime<Utc>,
    ) {
        let entry_price = close * (1.0 + side.sign() * self.config.slippage_rate);
        let balance = if self.config.compounding {
            state.equity()
        } else {
            self.config.initial_capital
        };

        let plan = match self
            .risk
            .plan_entry(symbol, window, entry_price, side, balance)
        {
            Ok(plan) => plan,
            Err(err) => {
                debug!("{} signal skipped at {}: {}", symbol, timestamp, err);
                state.skipped_signals += 1;
                return;
            }
        };

        let notional = entry_price * plan.quantity;
        let commission = notional * self.config.commission_rate;
        if notional + commission > state.cash {
            let err = BacktestError::execution(format!(
                "{} {} order for {:.6} needs {:.2}, cash is {:.2}",
                symbol,
                side.as_str(),
                plan.quantity,
                notional + commission,
                state.cash
            ));
            warn!("Order rejected at {}: {}", timestamp, err);
            state.rejected_orders += 1;
            return;
        }

        match side {
            Side::Long => state.cash -= notional + commission,
            Side::Short => state.cash += notional - commission,
        }
        debug!(
            "Opened {} {} qty {:.6} at {:.6} (stop {:.6}) on {}",
            side.as_str(),
            symbol,
            plan.quantity,
            entry_price,
            plan.stop_loss,
            timestamp
        );
        state.positions.insert(
            symbol.to_string(),
            Position {
                symbol: symbol.to_string(),
                side,
                entry_price,
                quantity: plan.quantity,
                remaining_quantity: plan.quantity,
                stop_loss: plan.stop_loss,
                initial_stop_loss: plan.stop_loss,
                take_profit: plan.take_profits,
                trailing_stop: None,
                entry_time: timestamp,
                state: PositionState::Opening,
                entry_commission: commission,
                fills: Vec::new(),
            },
        );
    }

    fn fill_exit(
        &self,
        state: &mut RunState,
        symbol: &str,
        exit: PlannedExit,
        timestamp: DateTime<Utc>,
    ) {
        let Some(position) = state.positions.get_mut(symbol) else {
            return;
        };
        let quantity = exit.quantity.min(position.remaining_quantity);
        if quantity <= 0.0 {
            return;
        }
        let price = exit.price * (1.0 - position.side.sign() * self.config.slippage_rate);
        let proceeds = price * quantity;
        let commission = proceeds * self.config.commission_rate;
        match position.side {
            Side::Long => state.cash += proceeds - commission,
            Side::Short => state.cash -= proceeds + commission,
        }
        position.fills.push(ExitFill {
            timestamp,
            price,
            quantity,
            commission,
            reason: exit.reason,
            level: exit.level,
        });
        position.remaining_quantity -= quantity;
        if position.remaining_quantity > QUANTITY_EPSILON * position.quantity.max(1.0) {
            return;
        }

        position.remaining_quantity = 0.0;
        position.state = exit.reason.as_state();
        let Some(mut closed) = state.positions.remove(symbol) else {
            return;
        };
        closed.state = PositionState::Closed;
        if let Some(trade) = Trade::from_position(&closed) {
            debug!(
                "Closed {} {} via {:?}: pnl {:.4} ({:.3}%)",
                trade.side.as_str(),
                trade.symbol,
                trade.exit_reason,
                trade.pnl,
                trade.pnl_percent
            );
            state.trades.push(trade);
        }
    }
}

pub fn run_with_catalog(
    config: &BacktestConfig,
    data: &MarketData,
    catalog: &StrategyCatalog,
) -> Result<BacktestResult, BacktestError> {
    let engine = Engine::new(config.clone())?;
    let strategy = catalog.create(&config.strategy_name, &config.strategy_params)?;
    engine.run(strategy.as_ref(), data)
}

fn filled_levels(position: &Position) -> Vec<&str> {
    position
        .fills
        .iter()
        .filter_map(|fill| fill.level.as_deref())
        .collect()
}

fn stop_touched(side: Side, stop: f64, low: f64, high: f64) -> bool {
    match side {
        Side::Long => low <= stop,
        Side::Short => high >= stop,
    }
}

fn target_touched(side: Side, target: f64, low: f64, high: f64) -> bool {
    match side {
        Side::Long => high >= target,
        Side::Short => low <= target,
    }
}

/// Quantity a target closes: everything without staged exits, otherwise an equal share of the
/// original size with the last level taking the remainder.
fn target_quantity(
    position: &Position,
    remaining: f64,
    is_last_level: bool,
    partial_exits: bool,
) -> f64 {
    if !partial_exits || is_last_level {
        return remaining;
    }
    let levels = position.take_profit.len().max(1) as f64;
    (position.quantity / levels).min(remaining)
}

/// Exit fills triggered inside one bar.
///
/// Without a price path the stop is assumed to trade first whenever the bar's range reaches
/// it, even if a target is inside the range too. Gaps through a level fill at the open.
fn plan_bar_exits(
    position: &Position,
    candle: &Candle,
    path: Option<&[f64]>,
    partial_exits: bool,
) -> Vec<PlannedExit> {
    let side = position.side;
    let stop = position.active_stop();
    let done = filled_levels(position);
    let targets = position.ordered_targets();
    let total_levels = targets.len();
    let pending: Vec<(usize, String, f64)> = targets
        .into_iter()
        .enumerate()
        .filter(|(_, (name, _))| !done.contains(&name.as_str()))
        .map(|(rank, (name, price))| (rank, name, price))
        .collect();

    let mut exits = Vec::new();
    let mut remaining = position.remaining_quantity;

    if let Some(path) = path.filter(|path| !path.is_empty()) {
        let mut next_target = 0;
        for (i, &price) in path.iter().enumerate() {
            if !price.is_finite() {
                continue;
            }
            if stop_touched(side, stop, price, price) {
                exits.push(PlannedExit {
                    reason: ExitReason::StopLossHit,
                    price: if i == 0 { price } else { stop },
                    quantity: remaining,
                    level: None,
                });
                return exits;
            }
            while let Some((rank, name, target)) = pending.get(next_target) {
                if !target_touched(side, *target, price, price) {
                    break;
                }
                let quantity =
                    target_quantity(position, remaining, *rank + 1 == total_levels, partial_exits);
                exits.push(PlannedExit {
                    reason: ExitReason::TakeProfitHit,
                    price: if i == 0 { price } else { *target },
                    quantity,
                    level: Some(name.clone()),
                });
                remaining -= quantity;
                next_target += 1;
                if remaining <= QUANTITY_EPSILON {
                    return exits;
                }
            }
        }
        return exits;
    }

    if stop_touched(side, stop, candle.low, candle.high) {
        let price = match side {
            Side::Long => stop.min(candle.open),
            Side::Short => stop.max(candle.open),
        };
        exits.push(PlannedExit {
            reason: ExitReason::StopLossHit,
            price,
            quantity: remaining,
            level: None,
        });
        return exits;
    }

    for (rank, name, target) in pending {
        if !target_touched(side, target, candle.low, candle.high) {
            break;
        }
        let price = match side {
            Side::Long => target.max(candle.open),
            Side::Short => target.min(candle.open),
        };
        let quantity = target_quantity(position, remaining, rank + 1 == total_levels, partial_exits);
        exits.push(PlannedExit {
            reason: ExitReason::TakeProfitHit,
            price,
            quantity,
            level: Some(name),
        });
        remaining -= quantity;
        if remaining <= QUANTITY_EPSILON {
            break;
        }
    }
    exits
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    fn position(side: Side, stop: f64, targets: &[(&str, f64)]) -> Position {
        Position {
            symbol: "BTCUSDT".to_string(),
            side,
            entry_price: 100.0,
            quantity: 10.0,
            remaining_quantity: 10.0,
            stop_loss: stop,
            initial_stop_loss: stop,
            take_profit: targets
                .iter()
                .map(|(name, price)| (name.to_string(), *price))
                .collect(),
            trailing_stop: None,
            entry_time: Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
            state: PositionState::Open,
            entry_commission: 0.0,
            fills: Vec::new(),
        }
    }

    fn bar(open: f64, high: f64, low: f64, close: f64) -> Candle {
        Candle {
            timestamp: Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap() + Duration::hours(1),
            open,
            high,
            low,
            close,
            volume: 1.0,
        }
    }

    #[test]
    fn stop_wins_when_both_levels_inside_bar() {
        let position = position(Side::Long, 95.0, &[("tp1", 107.5)]);
        let exits = plan_bar_exits(&position, &bar(100.0, 110.0, 90.0, 100.0), None, false);
        assert_eq!(exits.len(), 1);
        assert_eq!(exits[0].reason, ExitReason::StopLossHit);
        assert_eq!(exits[0].price, 95.0);
    }

    #[test]
    fn path_resolves_target_first() {
        let position = position(Side::Long, 95.0, &[("tp1", 107.5)]);
        let path = [100.0, 108.0, 90.0];
        let exits = plan_bar_exits(
            &position,
            &bar(100.0, 110.0, 90.0, 100.0),
            Some(&path),
            false,
        );
        assert_eq!(exits.len(), 1);
        assert_eq!(exits[0].reason, ExitReason::TakeProfitHit);
        assert_eq!(exits[0].price, 107.5);
    }

    #[test]
    fn gap_through_stop_fills_at_open() {
        let position = position(Side::Short, 105.0, &[("tp1", 90.0)]);
        let exits = plan_bar_exits(&position, &bar(108.0, 109.0, 104.0, 106.0), None, false);
        assert_eq!(exits[0].reason, ExitReason::StopLossHit);
        assert_eq!(exits[0].price, 108.0);
    }

    #[test]
    fn staged_targets_split_quantity() {
        let position = position(Side::Long, 95.0, &[("tp1", 105.0), ("tp2", 110.0)]);
        let exits = plan_bar_exits(&position, &bar(100.0, 106.0, 99.0, 105.5), None, true);
        assert_eq!(exits.len(), 1);
        assert_eq!(exits[0].quantity, 5.0);
        assert_eq!(exits[0].level.as_deref(), Some("tp1"));

        let exits = plan_bar_exits(&position, &bar(100.0, 111.0, 99.0, 110.0), None, true);
        assert_eq!(exits.len(), 2);
        assert_eq!(exits[1].quantity, 5.0);
        assert_eq!(exits[1].level.as_deref(), Some("tp2"));
    }

    #[test]
    fn without_staging_nearest_target_closes_everything() {
        let position = position(Side::Long, 95.0, &[("tp1", 105.0), ("tp2", 110.0)]);
        let exits = plan_bar_exits(&position, &bar(100.0, 111.0, 99.0, 110.0), None, false);
        assert_eq!(exits.len(), 1);
        assert_eq!(exits[0].quantity, 10.0);
    }
}
