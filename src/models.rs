use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candle {
    pub timestamp: DateTime<Utc>,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

impl Candle {
    /// A candle is usable for indicators and exits only when every price field is finite.
    pub fn is_valid(&self) -> bool {
        self.open.is_finite()
            && self.high.is_finite()
            && self.low.is_finite()
            && self.close.is_finite()
            && self.high >= self.low
    }

    pub fn true_range(&self, prev_close: Option<f64>) -> f64 {
        let range = self.high - self.low;
        match prev_close.filter(|value| value.is_finite()) {
            Some(prev) => range
                .max((self.high - prev).abs())
                .max((self.low - prev).abs()),
            None => range,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SignalDirection {
    Long,
    Short,
    Hold,
}

impl SignalDirection {
    pub fn as_str(&self) -> &'static str {
        match self {
            SignalDirection::Long => "long",
            SignalDirection::Short => "short",
            SignalDirection::Hold => "hold",
        }
    }

    pub fn side(&self) -> Option<Side> {
        match self {
            SignalDirection::Long => Some(Side::Long),
            SignalDirection::Short => Some(Side::Short),
            SignalDirection::Hold => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StrategySignal {
    pub symbol: String,
    pub direction: SignalDirection,
    pub confidence: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Long,
    Short,
}

impl Side {
    pub fn sign(self) -> f64 {
        match self {
            Side::Long => 1.0,
            Side::Short => -1.0,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Side::Long => "long",
            Side::Short => "short",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PositionState {
    Opening,
    Open,
    TakeProfitHit,
    StopLossHit,
    TimeExit,
    ManualClose,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExitReason {
    TakeProfitHit,
    StopLossHit,
    TimeExit,
    ManualClose,
}

impl ExitReason {
    pub fn as_state(self) -> PositionState {
        match self {
            ExitReason::TakeProfitHit => PositionState::TakeProfitHit,
            ExitReason::StopLossHit => PositionState::StopLossHit,
            ExitReason::TimeExit => PositionState::TimeExit,
            ExitReason::ManualClose => PositionState::ManualClose,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExitFill {
    pub timestamp: DateTime<Utc>,
    pub price: f64,
    pub quantity: f64,
    pub commission: f64,
    pub reason: ExitReason,
    pub level: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub symbol: String,
    pub side: Side,
    pub entry_price: f64,
    pub quantity: f64,
    pub remaining_quantity: f64,
    pub stop_loss: f64,
    pub initial_stop_loss: f64,
    pub take_profit: BTreeMap<String, f64>,
    pub trailing_stop: Option<f64>,
    pub entry_time: DateTime<Utc>,
    pub state: PositionState,
    pub entry_commission: f64,
    pub fills: Vec<ExitFill>,
}

impl Position {
    /// Stop currently in force: the trailing stop once one exists, otherwise the initial stop.
    pub fn active_stop(&self) -> f64 {
        self.trailing_stop.unwrap_or(self.stop_loss)
    }

    pub fn mark_to_market(&self, price: f64) -> f64 {
        self.side.sign() * self.remaining_quantity * price
    }

    pub fn unrealized_pnl(&self, price: f64) -> f64 {
        self.side.sign() * (price - self.entry_price) * self.remaining_quantity
    }

    pub fn ordered_targets(&self) -> Vec<(String, f64)> {
        let mut targets: Vec<(String, f64)> = self
            .take_profit
            .iter()
            .map(|(name, price)| (name.clone(), *price))
            .collect();
        targets.sort_by(|a, b| {
            let da = (a.1 - self.entry_price).abs();
            let db = (b.1 - self.entry_price).abs();
            da.partial_cmp(&db)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.0.cmp(&b.0))
        });
        targets
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trade {
    pub symbol: String,
    pub side: Side,
    pub entry_price: f64,
    pub exit_price: f64,
    pub quantity: f64,
    pub entry_time: DateTime<Utc>,
    pub exit_time: DateTime<Utc>,
    pub pnl: f64,
    pub pnl_percent: f64,
    pub exit_reason: ExitReason,
    pub commissions_paid: f64,
    pub stop_loss: f64,
    pub initial_risk: f64,
}

impl Trade {
    /// Closes out a fully exited position. The exit price is the quantity-weighted average of
    /// every fill so staged exits still satisfy the single-trade pnl identity.
    pub fn from_position(position: &Position) -> Option<Self> {
        let last_fill = position.fills.last()?;
        let filled: f64 = position.fills.iter().map(|fill| fill.quantity).sum();
        if filled <= 0.0 {
            return None;
        }
        let exit_price = position
            .fills
            .iter()
            .map(|fill| fill.price * fill.quantity)
            .sum::<f64>()
            / filled;
        let commissions_paid = position.entry_commission
            + position
                .fills
                .iter()
                .map(|fill| fill.commission)
                .sum::<f64>();
        let pnl = (exit_price - position.entry_price) * position.quantity * position.side.sign()
            - commissions_paid;
        let notional = position.entry_price * position.quantity;
        let pnl_percent = if notional > 0.0 {
            pnl / notional * 100.0
        } else {
            0.0
        };

        Some(Trade {
            symbol: position.symbol.clone(),
            side: position.side,
            entry_price: position.entry_price,
            exit_price,
            quantity: position.quantity,
            entry_time: position.entry_time,
            exit_time: last_fill.timestamp,
            pnl,
            pnl_percent,
            exit_reason: last_fill.reason,
            commissions_paid,
            stop_loss: position.initial_stop_loss,
            initial_risk: (position.entry_price - position.initial_stop_loss).abs()
                * position.quantity,
        })
    }

    pub fn r_multiple(&self) -> Option<f64> {
        if self.initial_risk > 0.0 && self.initial_risk.is_finite() {
            Some(self.pnl / self.initial_risk)
        } else {
            None
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EquityPoint {
    #[serde(rename = "t")]
    pub timestamp: DateTime<Utc>,
    pub equity: f64,
    pub drawdown: f64,
}

/// Position still open when the candle stream ran out; never folded into realized stats.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnrealizedPosition {
    pub symbol: String,
    pub side: Side,
    pub entry_price: f64,
    pub quantity: f64,
    pub entry_time: DateTime<Utc>,
    pub active_stop: f64,
    pub mark_price: f64,
    pub unrealized_pnl: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PerformanceMetrics {
    #[serde(rename = "trades")]
    pub total_trades: usize,
    pub wins: usize,
    pub losses: usize,
    #[serde(rename = "winrate")]
    pub win_rate: Option<f64>,
    pub profit_factor: Option<f64>,
    pub sharpe: Option<f64>,
    pub sortino: Option<f64>,
    pub max_drawdown: f64,
    #[serde(rename = "avg_R")]
    pub avg_r: Option<f64>,
    pub final_balance: f64,
    pub total_return: f64,
    pub total_commissions: f64,
    pub avg_trade_pnl: Option<f64>,
    pub best_trade: Option<f64>,
    pub worst_trade: Option<f64>,
    pub avg_holding_secs: Option<f64>,
    pub unrealized_pnl: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BacktestResult {
    pub trades: Vec<Trade>,
    pub equity_curve: Vec<EquityPoint>,
    pub performance: PerformanceMetrics,
    pub skipped_signals: u64,
    pub rejected_orders: u64,
    pub unrealized: Vec<UnrealizedPosition>,
}
