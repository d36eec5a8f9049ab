//! Long/flat backtest of forecasts against realized closes
//!
//! No fees and no slippage. A position is decided from information available
//! before the step it earns.

use crate::error::{ForecastError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BacktestReport {
    /// Compounded strategy return, e.g. 0.12 for +12%
    pub strategy_return: f64,
    pub buy_and_hold_return: f64,
    /// Number of flat-to-long entries
    pub n_trades: usize,
    /// Share of closed or open trades with a positive return
    pub win_rate: f64,
    /// Largest peak-to-trough fall of the strategy equity, as a positive fraction
    pub max_drawdown: f64,
    pub sharpe_ratio: f64,
    /// Strategy equity starting at 1.0, one point per price
    pub equity_curve: Vec<f64>,
    /// Whether the strategy was long over step `t -> t + 1`
    pub positions: Vec<bool>,
}

/// Backtest a price forecaster: long over `t-1 -> t` when `predicted[t] > actual[t-1]`
pub fn run(actual: &[f64], predicted: &[f64], periods_per_year: f64) -> Result<BacktestReport> {
    if actual.len() != predicted.len() {
        return Err(ForecastError::data_integrity(format!(
            "{} actual prices but {} predictions",
            actual.len(),
            predicted.len()
        )));
    }
    let positions: Vec<bool> = (1..actual.len())
        .map(|t| predicted[t] > actual[t - 1])
        .collect();
    run_with_positions(actual, &positions, periods_per_year)
}

/// Backtest a direction classifier: `signals[t] == 1` means long over `t -> t + 1`.
/// The last signal has no following price and is ignored.
pub fn run_direction(prices: &[f64], signals: &[f64], periods_per_year: f64) -> Result<BacktestReport> {
    if prices.len() != signals.len() {
        return Err(ForecastError::data_integrity(format!(
            "{} prices but {} signals",
            prices.len(),
            signals.len()
        )));
    }
    let positions: Vec<bool> = signals
        .iter()
        .take(prices.len().saturating_sub(1))
        .map(|s| *s > 0.5)
        .collect();
    run_with_positions(prices, &positions, periods_per_year)
}

/// `positions[i]` holds the position over `prices[i] -> prices[i + 1]`
pub fn run_with_positions(
    prices: &[f64],
    positions: &[bool],
    periods_per_year: f64,
) -> Result<BacktestReport> {
    if prices.len() < 2 {
        return Err(ForecastError::insufficient("backtest needs at least two prices"));
    }
    if positions.len() != prices.len() - 1 {
        return Err(ForecastError::data_integrity(format!(
            "{} positions for {} price steps",
            positions.len(),
            prices.len() - 1
        )));
    }
    if prices.iter().any(|p| !(p.is_finite() && *p > 0.0)) {
        return Err(ForecastError::data_integrity("backtest prices must be positive"));
    }

    let market: Vec<f64> = prices.windows(2).map(|w| w[1] / w[0] - 1.0).collect();
    let strategy: Vec<f64> = market
        .iter()
        .zip(positions)
        .map(|(r, &long)| if long { *r } else { 0.0 })
        .collect();

    let mut equity_curve = Vec::with_capacity(prices.len());
    equity_curve.push(1.0);
    for r in &strategy {
        let last = equity_curve[equity_curve.len() - 1];
        equity_curve.push(last * (1.0 + r));
    }

    let (n_trades, wins) = count_trades(&strategy, positions);

    Ok(BacktestReport {
        strategy_return: equity_curve[equity_curve.len() - 1] - 1.0,
        buy_and_hold_return: prices[prices.len() - 1] / prices[0] - 1.0,
        n_trades,
        win_rate: if n_trades == 0 { 0.0 } else { wins as f64 / n_trades as f64 },
        max_drawdown: max_drawdown(&equity_curve),
        sharpe_ratio: sharpe_ratio(&strategy, periods_per_year),
        equity_curve,
        positions: positions.to_vec(),
    })
}

/// Count entries and the trades whose compounded return is positive
fn count_trades(returns: &[f64], positions: &[bool]) -> (usize, usize) {
    let mut trades = 0;
    let mut wins = 0;
    let mut growth: Option<f64> = None;

    for (&r, &long) in returns.iter().zip(positions) {
        match (long, growth) {
            (true, None) => {
                trades += 1;
                growth = Some(1.0 + r);
            }
            (true, Some(g)) => growth = Some(g * (1.0 + r)),
            (false, Some(g)) => {
                wins += (g > 1.0) as usize;
                growth = None;
            }
            (false, None) => {}
        }
    }
    if let Some(g) = growth {
        wins += (g > 1.0) as usize;
    }
    (trades, wins)
}

pub fn max_drawdown(equity_curve: &[f64]) -> f64 {
    let mut peak = f64::MIN;
    let mut worst = 0.0;
    for &value in equity_curve {
        peak = peak.max(value);
        if peak > 0.0 {
            worst = f64::max(worst, (peak - value) / peak);
        }
    }
    worst
}

/// Annualized mean over population standard deviation of per-step returns
pub fn sharpe_ratio(returns: &[f64], periods_per_year: f64) -> f64 {
    if returns.len() < 2 {
        return 0.0;
    }
    let n = returns.len() as f64;
    let mean = returns.iter().sum::<f64>() / n;
    let std = (returns.iter().map(|r| (r - mean).powi(2)).sum::<f64>() / n).sqrt();
    if std < 1e-12 {
        0.0
    } else {
        mean / std * periods_per_year.sqrt()
    }
}

impl fmt::Display for BacktestReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "  Strategy return:     {:+.2}%", self.strategy_return * 100.0)?;
        writeln!(f, "  Buy & hold return:   {:+.2}%", self.buy_and_hold_return * 100.0)?;
        writeln!(f, "  Trades:              {}", self.n_trades)?;
        writeln!(f, "  Win rate:            {:.2}%", self.win_rate * 100.0)?;
        writeln!(f, "  Max drawdown:        {:.2}%", self.max_drawdown * 100.0)?;
        write!(f, "  Sharpe (annualized): {:.3}", self.sharpe_ratio)
    }
}
