use crate::config::Timeframe;
use crate::models::*;
use statrs::statistics::Statistics;

pub struct PerformanceCalculator;

impl PerformanceCalculator {
    /// Realized statistics come from closed trades only; open positions contribute nothing but
    /// `unrealized_pnl`.
    pub fn calculate_performance(
        trades: &[Trade],
        equity_curve: &[EquityPoint],
        unrealized: &[UnrealizedPosition],
        initial_capital: f64,
        timeframe: Timeframe,
    ) -> PerformanceMetrics {
        let total_trades = trades.len();
        let wins = trades.iter().filter(|trade| trade.pnl > 0.0).count();
        let losses = trades.iter().filter(|trade| trade.pnl < 0.0).count();
        let pnls: Vec<f64> = trades.iter().map(|trade| trade.pnl).collect();

        let final_balance = equity_curve
            .last()
            .map(|point| point.equity)
            .unwrap_or(initial_capital);
        let total_return = if initial_capital > 0.0 {
            final_balance / initial_capital - 1.0
        } else {
            0.0
        };

        let returns = Self::period_returns(initial_capital, equity_curve);
        let periods_per_year = timeframe.periods_per_year();

        PerformanceMetrics {
            total_trades,
            wins,
            losses,
            win_rate: Self::ratio(wins as f64, total_trades as f64),
            profit_factor: Self::profit_factor(trades),
            sharpe: Self::sharpe_ratio(&returns, periods_per_year),
            sortino: Self::sortino_ratio(&returns, periods_per_year),
            max_drawdown: Self::max_drawdown(initial_capital, equity_curve),
            avg_r: Self::average_r(trades),
            final_balance,
            total_return,
            total_commissions: trades.iter().map(|trade| trade.commissions_paid).sum(),
            avg_trade_pnl: Self::average(&pnls),
            best_trade: pnls.iter().copied().reduce(f64::max),
            worst_trade: pnls.iter().copied().reduce(f64::min),
            avg_holding_secs: Self::average(
                &trades
                    .iter()
                    .map(|trade| (trade.exit_time - trade.entry_time).num_seconds() as f64)
                    .collect::<Vec<_>>(),
            ),
            unrealized_pnl: unrealized.iter().map(|open| open.unrealized_pnl).sum(),
        }
    }

    fn ratio(numerator: f64, denominator: f64) -> Option<f64> {
        if denominator > 0.0 {
            Some(numerator / denominator)
        } else {
            None
        }
    }

    fn average(values: &[f64]) -> Option<f64> {
        if values.is_empty() {
            return None;
        }
        Some(values.iter().sum::<f64>() / values.len() as f64)
    }

    pub fn profit_factor(trades: &[Trade]) -> Option<f64> {
        let gross_profit: f64 = trades
            .iter()
            .filter(|trade| trade.pnl > 0.0)
            .map(|trade| trade.pnl)
            .sum();
        let gross_loss: f64 = trades
            .iter()
            .filter(|trade| trade.pnl < 0.0)
            .map(|trade| trade.pnl)
            .sum::<f64>()
            .abs();
        Self::ratio(gross_profit, gross_loss).filter(|value| value.is_finite())
    }

    pub fn average_r(trades: &[Trade]) -> Option<f64> {
        let multiples: Vec<f64> = trades.iter().filter_map(Trade::r_multiple).collect();
        Self::average(&multiples)
    }

    pub fn period_returns(initial_capital: f64, equity_curve: &[EquityPoint]) -> Vec<f64> {
        let mut previous = initial_capital;
        let mut returns = Vec::with_capacity(equity_curve.len());
        for point in equity_curve {
            let value = if previous > 0.0 {
                (point.equity - previous) / previous
            } else {
                0.0
            };
            returns.push(if value.is_finite() { value } else { 0.0 });
            previous = point.equity;
        }
        returns
    }

    pub fn sharpe_ratio(returns: &[f64], periods_per_year: f64) -> Option<f64> {
        if returns.len() < 2 {
            return None;
        }
        let mean_return = returns.mean();
        let std_dev = returns.std_dev();
        Self::annualized(mean_return, std_dev, periods_per_year)
    }

    /// Same shape as Sharpe with the stdev of negative returns in the denominator.
    pub fn sortino_ratio(returns: &[f64], periods_per_year: f64) -> Option<f64> {
        if returns.len() < 2 {
            return None;
        }
        let downside: Vec<f64> = returns.iter().copied().filter(|r| *r < 0.0).collect();
        if downside.len() < 2 {
            return None;
        }
        let mean_return = returns.mean();
        let downside_dev = downside.std_dev();
        Self::annualized(mean_return, downside_dev, periods_per_year)
    }

    fn annualized(mean_return: f64, deviation: f64, periods_per_year: f64) -> Option<f64> {
        if !deviation.is_finite() || deviation <= 0.0 || !mean_return.is_finite() {
            return None;
        }
        let value = mean_return / deviation * periods_per_year.sqrt();
        value.is_finite().then_some(value)
    }

    /// Largest fractional fall from the running peak, clamped to `[0, 1]`.
    pub fn max_drawdown(initial_capital: f64, equity_curve: &[EquityPoint]) -> f64 {
        let mut peak = initial_capital;
        let mut max_drawdown: f64 = 0.0;
        for point in equity_curve {
            if point.equity > peak {
                peak = point.equity;
            }
            if peak > 0.0 {
                let drawdown = (peak - point.equity) / peak;
                if drawdown.is_finite() {
                    max_drawdown = max_drawdown.max(drawdown);
                }
            }
        }
        max_drawdown.clamp(0.0, 1.0)
    }
}
