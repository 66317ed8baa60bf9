//! Summary statistics over a trade ledger and equity curve.

use super::types::{EquityPoint, PerformanceMetrics, Trade};

/// Ceiling for profit factor when there are losses worth zero. Keeps the
/// value finite and JSON-safe.
const MAX_PROFIT_FACTOR: f64 = 999.99;

/// Minimum calendar days in the equity span before CAGR is reported.
/// Below this the annualization exponent inflates tiny windows absurdly.
const MIN_CALENDAR_DAYS_FOR_ANNUALIZED: f64 = 25.0;

const MS_PER_YEAR: f64 = 365.0 * 86_400_000.0;

/// Trade-level aggregates extracted from the ledger.
struct TradeStats {
    win_rate: f64,
    profit_factor: Option<f64>,
    avg_win: f64,
    avg_loss: f64,
    expectancy: f64,
    max_consecutive_losses: usize,
}

/// Compute the full summary. `bar_ms` drives Sharpe annualization
/// (crypto markets trade every day, so a year is 365 days of bars).
pub fn calculate_metrics(
    trades: &[Trade],
    equity: &[EquityPoint],
    initial_cash: f64,
    bar_ms: i64,
) -> PerformanceMetrics {
    if initial_cash <= 0.0 || equity.is_empty() {
        return PerformanceMetrics::empty();
    }

    let ts = trade_stats(trades);

    let final_equity = equity.last().map_or(initial_cash, |p| p.equity);
    let total_return = final_equity / initial_cash - 1.0;

    let (max_drawdown, sharpe) = equity_stats(equity, initial_cash, bar_ms);

    let first_ts = equity.first().map_or(0, |p| p.ts);
    let last_ts = equity.last().map_or(0, |p| p.ts);
    let calendar_days = (last_ts - first_ts) as f64 / 86_400_000.0;
    let cagr = if calendar_days >= MIN_CALENDAR_DAYS_FOR_ANNUALIZED && final_equity > 0.0 {
        let years = calendar_days * 86_400_000.0 / MS_PER_YEAR;
        (final_equity / initial_cash).powf(1.0 / years) - 1.0
    } else {
        0.0
    };

    PerformanceMetrics {
        total_return,
        total_return_pct: total_return * 100.0,
        cagr,
        max_drawdown,
        max_drawdown_pct: max_drawdown * 100.0,
        sharpe,
        win_rate: ts.win_rate,
        num_trades: trades.len(),
        profit_factor: ts.profit_factor,
        avg_win: ts.avg_win,
        avg_loss: ts.avg_loss,
        expectancy: ts.expectancy,
        max_consecutive_losses: ts.max_consecutive_losses,
        regimes: Vec::new(),
    }
}

fn trade_stats(trades: &[Trade]) -> TradeStats {
    if trades.is_empty() {
        return TradeStats {
            win_rate: 0.0,
            profit_factor: None,
            avg_win: 0.0,
            avg_loss: 0.0,
            expectancy: 0.0,
            max_consecutive_losses: 0,
        };
    }

    let total = trades.len() as f64;
    let mut winner_count = 0usize;
    let mut loser_count = 0usize;
    let mut win_sum = 0.0_f64;
    let mut loss_sum = 0.0_f64;
    let mut loss_streak = 0usize;
    let mut max_loss_streak = 0usize;

    for t in trades {
        if t.pnl > 0.0 {
            winner_count += 1;
            win_sum += t.pnl;
            loss_streak = 0;
        } else if t.pnl < 0.0 {
            loser_count += 1;
            loss_sum += t.pnl;
            loss_streak += 1;
            max_loss_streak = max_loss_streak.max(loss_streak);
        } else {
            // Scratch trades break the streak without counting either way.
            loss_streak = 0;
        }
    }

    let win_rate = winner_count as f64 / total;
    let profit_factor = if loss_sum < 0.0 {
        Some(win_sum / loss_sum.abs())
    } else if win_sum > 0.0 {
        Some(MAX_PROFIT_FACTOR)
    } else {
        None
    };

    let avg_win = if winner_count > 0 {
        win_sum / winner_count as f64
    } else {
        0.0
    };
    let avg_loss = if loser_count > 0 {
        loss_sum / loser_count as f64
    } else {
        0.0
    };

    // avg_loss is negative, so this is win_rate·avg_win − loss_rate·|avg_loss|.
    let expectancy = win_rate * avg_win + (1.0 - win_rate) * avg_loss;

    TradeStats {
        win_rate,
        profit_factor,
        avg_win,
        avg_loss,
        expectancy,
        max_consecutive_losses: max_loss_streak,
    }
}

/// Peak-to-trough drawdown and annualized Sharpe from per-bar returns.
fn equity_stats(equity: &[EquityPoint], initial_cash: f64, bar_ms: i64) -> (f64, f64) {
    let mut peak = initial_cash;
    let mut max_dd = 0.0_f64;
    let mut returns = Vec::with_capacity(equity.len());
    let mut prev = initial_cash;

    for point in equity {
        if point.equity > peak {
            peak = point.equity;
        }
        if peak > 0.0 {
            max_dd = max_dd.max((peak - point.equity) / peak);
        }
        if prev > 0.0 {
            returns.push(point.equity / prev - 1.0);
        }
        prev = point.equity;
    }

    let sharpe = if returns.len() < 2 {
        0.0
    } else {
        let mean = returns.iter().sum::<f64>() / returns.len() as f64;
        let variance = returns.iter().map(|r| (r - mean).powi(2)).sum::<f64>()
            / (returns.len() - 1) as f64;
        let std = variance.sqrt();
        if std > 0.0 {
            let bars_per_year = MS_PER_YEAR / bar_ms as f64;
            mean / std * bars_per_year.sqrt()
        } else {
            0.0
        }
    };

    (max_dd, sharpe)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::types::ExitReason;

    const DAY: i64 = 86_400_000;

    fn equity_curve(values: &[f64]) -> Vec<EquityPoint> {
        values
            .iter()
            .enumerate()
            .map(|(i, &equity)| EquityPoint {
                ts: i as i64 * DAY,
                cash: equity,
                position_value: 0.0,
                equity,
            })
            .collect()
    }

    fn trade(pnl: f64) -> Trade {
        Trade {
            entry_ts: 0,
            entry_price: 100.0,
            exit_ts: DAY,
            exit_price: 100.0 + pnl,
            qty: 1.0,
            pnl,
            pnl_pct: pnl / 100.0,
            exit_reason: ExitReason::SignalExit,
            held_bars: 1,
        }
    }

    #[test]
    fn zero_trade_run_boundaries() {
        let m = calculate_metrics(&[], &equity_curve(&[1000.0, 1000.0]), 1000.0, DAY);
        assert_eq!(m.num_trades, 0);
        assert_eq!(m.total_return, 0.0);
        assert_eq!(m.win_rate, 0.0);
        assert!(m.profit_factor.is_none());
        assert_eq!(m.sharpe, 0.0);
    }

    #[test]
    fn total_return_is_compounded_not_summed() {
        // Ten +10% steps from 1000
        let mut values = vec![];
        let mut e = 1000.0;
        for _ in 0..10 {
            e *= 1.1;
            values.push(e);
        }
        let m = calculate_metrics(&[], &equity_curve(&values), 1000.0, DAY);
        let expected = 1.1f64.powi(10) - 1.0;
        assert!((m.total_return - expected).abs() < 1e-12);
        assert!((m.total_return_pct - expected * 100.0).abs() < 1e-9);
        assert!(m.total_return_pct > 159.0); // not the summed 100%
    }

    #[test]
    fn max_drawdown_peak_to_trough() {
        let m = calculate_metrics(
            &[],
            &equity_curve(&[1000.0, 1200.0, 900.0, 1100.0]),
            1000.0,
            DAY,
        );
        let expected = (1200.0 - 900.0) / 1200.0;
        assert!((m.max_drawdown - expected).abs() < 1e-12);
        assert!((m.max_drawdown_pct - expected * 100.0).abs() < 1e-9);
    }

    #[test]
    fn win_rate_and_expectancy() {
        let trades = vec![trade(200.0), trade(-100.0), trade(150.0), trade(-50.0)];
        let m = calculate_metrics(&trades, &equity_curve(&[1000.0, 1200.0]), 1000.0, DAY);
        assert_eq!(m.num_trades, 4);
        assert!((m.win_rate - 0.5).abs() < 1e-12);
        assert!((m.avg_win - 175.0).abs() < 1e-12);
        assert!((m.avg_loss - (-75.0)).abs() < 1e-12);
        // 0.5·175 − 0.5·75 = 50
        assert!((m.expectancy - 50.0).abs() < 1e-12);
        // profit factor 350 / 150
        assert!((m.profit_factor.unwrap() - 350.0 / 150.0).abs() < 1e-12);
    }

    #[test]
    fn all_wins_profit_factor_capped_finite() {
        let trades = vec![trade(100.0), trade(50.0)];
        let m = calculate_metrics(&trades, &equity_curve(&[1000.0, 1150.0]), 1000.0, DAY);
        assert_eq!(m.profit_factor, Some(MAX_PROFIT_FACTOR));
    }

    #[test]
    fn consecutive_loss_streaks() {
        let trades = vec![
            trade(100.0),
            trade(-10.0),
            trade(-10.0),
            trade(-10.0),
            trade(50.0),
            trade(-10.0),
        ];
        let m = calculate_metrics(&trades, &equity_curve(&[1000.0, 1100.0]), 1000.0, DAY);
        assert_eq!(m.max_consecutive_losses, 3);
    }

    #[test]
    fn scratch_trades_break_streaks() {
        let trades = vec![trade(-10.0), trade(0.0), trade(-10.0)];
        let m = calculate_metrics(&trades, &equity_curve(&[1000.0, 980.0]), 1000.0, DAY);
        assert_eq!(m.max_consecutive_losses, 1);
    }

    #[test]
    fn sharpe_positive_for_steady_gains() {
        let values: Vec<f64> = (1..=60).map(|i| 1000.0 + f64::from(i) * 5.0).collect();
        let m = calculate_metrics(&[], &equity_curve(&values), 1000.0, DAY);
        assert!(m.sharpe > 0.0);
    }

    #[test]
    fn flat_curve_zero_sharpe() {
        let m = calculate_metrics(&[], &equity_curve(&[1000.0; 30]), 1000.0, DAY);
        assert_eq!(m.sharpe, 0.0);
    }

    #[test]
    fn cagr_suppressed_for_tiny_windows() {
        let m = calculate_metrics(&[], &equity_curve(&[1000.0, 1100.0, 1200.0]), 1000.0, DAY);
        assert_eq!(m.cagr, 0.0);
        assert!(m.total_return > 0.0);
    }

    #[test]
    fn cagr_matches_total_return_over_one_year() {
        let values: Vec<f64> = (0..=365)
            .map(|i| 1000.0 + f64::from(i) * (500.0 / 365.0))
            .collect();
        let m = calculate_metrics(&[], &equity_curve(&values), 1000.0, DAY);
        // 365-day span is exactly one year under the 365-day convention
        assert!((m.cagr - m.total_return).abs() < 1e-9);
    }
}
