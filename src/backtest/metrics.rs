use serde::{Deserialize, Serialize};

/// Annualization factor: bars are treated as daily observations
const PERIODS_PER_YEAR: f64 = 252.0;

/// Read-only analytics over a completed run. Derived entirely from the
/// equity curve and the trade counts; never writes back into the ledger.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BacktestReport {
    pub initial_balance: f64,
    pub final_equity: f64,
    /// Fractional return over the whole run
    pub total_return: f64,
    /// Total return scaled by 252 / observed periods
    pub annualized_return: f64,
    /// sqrt(252) * mean / std of per-period returns; 0 when std is 0
    pub sharpe_ratio: f64,
    /// Peak-to-trough on the equity curve, always <= 0
    pub max_drawdown: f64,
    pub periods: usize,
    pub trades: usize,
    pub total_fees: f64,
    pub equity_curve: Vec<f64>,
}

impl BacktestReport {
    /// Build the report from per-bar equity samples. The curve is
    /// prefixed with the initial balance before anything is derived.
    pub fn from_equity_curve(
        initial_balance: f64,
        equity: &[f64],
        trades: usize,
        total_fees: f64,
    ) -> Self {
        let mut curve = Vec::with_capacity(equity.len() + 1);
        curve.push(initial_balance);
        curve.extend_from_slice(equity);

        let final_equity = *curve.last().unwrap_or(&initial_balance);
        let total_return = if initial_balance > 0.0 {
            final_equity / initial_balance - 1.0
        } else {
            0.0
        };

        let periods = equity.len().max(1);
        let annualized_return = total_return * PERIODS_PER_YEAR / periods as f64;

        let returns: Vec<f64> = curve
            .windows(2)
            .map(|pair| {
                if pair[0].abs() > f64::EPSILON {
                    pair[1] / pair[0] - 1.0
                } else {
                    0.0
                }
            })
            .collect();

        Self {
            initial_balance,
            final_equity,
            total_return,
            annualized_return,
            sharpe_ratio: sharpe(&returns),
            max_drawdown: max_drawdown(&curve),
            periods,
            trades,
            total_fees,
            equity_curve: curve,
        }
    }

    /// Print a formatted report to stdout
    pub fn print_report(&self) {
        println!("\n================ BACKTEST REPORT ================");
        println!("  Initial Balance:    ${:.2}", self.initial_balance);
        println!("  Final Equity:       ${:.2}", self.final_equity);
        println!("  Total Return:       {:+.2}%", self.total_return * 100.0);
        println!(
            "  Annualized Return:  {:+.2}%",
            self.annualized_return * 100.0
        );
        println!("  Sharpe Ratio:       {:.2}", self.sharpe_ratio);
        println!("  Max Drawdown:       {:.2}%", self.max_drawdown * 100.0);
        println!("  Periods:            {}", self.periods);
        println!("  Trades:             {}", self.trades);
        println!("  Total Fees:         ${:.2}", self.total_fees);
        println!("=================================================\n");
    }
}

fn sharpe(returns: &[f64]) -> f64 {
    if returns.is_empty() {
        return 0.0;
    }
    let mean = returns.iter().sum::<f64>() / returns.len() as f64;
    let variance = returns
        .iter()
        .map(|r| {
            let diff = r - mean;
            diff * diff
        })
        .sum::<f64>()
        / returns.len() as f64;
    let std_dev = variance.sqrt();

    if std_dev > 0.0 {
        PERIODS_PER_YEAR.sqrt() * mean / std_dev
    } else {
        0.0
    }
}

/// Worst peak-to-trough as a (non-positive) fraction of the peak
fn max_drawdown(curve: &[f64]) -> f64 {
    let mut peak = f64::MIN;
    let mut worst = 0.0_f64;

    for &equity in curve {
        if equity > peak {
            peak = equity;
        }
        if peak > 0.0 {
            let drawdown = equity / peak - 1.0;
            if drawdown < worst {
                worst = drawdown;
            }
        }
    }
    worst
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_monotonic_curve_has_zero_drawdown() {
        let report =
            BacktestReport::from_equity_curve(100.0, &[101.0, 102.0, 105.0, 105.0, 110.0], 0, 0.0);
        assert_eq!(report.max_drawdown, 0.0);
        assert!(report.total_return > 0.0);
    }

    #[test]
    fn test_drawdown_never_positive() {
        let curves: [&[f64]; 3] = [
            &[90.0, 80.0, 120.0],
            &[110.0, 95.0, 105.0, 70.0],
            &[100.0, 100.0, 100.0],
        ];
        for curve in curves {
            let report = BacktestReport::from_equity_curve(100.0, curve, 0, 0.0);
            assert!(report.max_drawdown <= 0.0);
        }
    }

    #[test]
    fn test_drawdown_measured_from_peak() {
        // Peak 120, trough 90: drawdown = 90/120 - 1 = -0.25
        let report = BacktestReport::from_equity_curve(100.0, &[120.0, 90.0, 110.0], 0, 0.0);
        assert!((report.max_drawdown - (-0.25)).abs() < 1e-9);
    }

    #[test]
    fn test_total_and_annualized_return() {
        let report = BacktestReport::from_equity_curve(100.0, &[105.0, 110.0], 2, 1.5);
        assert!((report.total_return - 0.10).abs() < 1e-9);
        // 2 observed periods: scaled by 252/2
        assert!((report.annualized_return - 0.10 * 126.0).abs() < 1e-9);
        assert_eq!(report.trades, 2);
    }

    #[test]
    fn test_flat_curve_zero_sharpe() {
        let report = BacktestReport::from_equity_curve(100.0, &[100.0, 100.0, 100.0], 0, 0.0);
        assert_eq!(report.sharpe_ratio, 0.0);
        assert_eq!(report.total_return, 0.0);
    }

    #[test]
    fn test_curve_is_prefixed_with_initial_balance() {
        let report = BacktestReport::from_equity_curve(100.0, &[110.0], 0, 0.0);
        assert_eq!(report.equity_curve.len(), 2);
        assert_eq!(report.equity_curve[0], 100.0);
        // The initial-balance prefix counts toward drawdown: a curve that
        // only ever dips below the starting balance still shows one
        let dipping = BacktestReport::from_equity_curve(100.0, &[95.0, 98.0], 0, 0.0);
        assert!(dipping.max_drawdown < 0.0);
    }

    #[test]
    fn test_empty_equity_is_flat() {
        let report = BacktestReport::from_equity_curve(100.0, &[], 0, 0.0);
        assert_eq!(report.final_equity, 100.0);
        assert_eq!(report.total_return, 0.0);
        assert_eq!(report.max_drawdown, 0.0);
    }
}
