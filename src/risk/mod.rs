use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::ledger::Position;
use crate::models::SIZE_EPSILON;

/// Account-level risk limits
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskThresholds {
    /// Absolute cap on any one position's size
    pub max_position_size: f64,
    /// Max unrealized loss as a fraction of a position's entry notional
    pub max_drawdown_pct: f64,
    /// Max account loss per trading day as a fraction of the day's
    /// starting balance
    pub max_daily_loss_pct: f64,
    /// Max notional relative to available balance on new submissions
    pub max_leverage: f64,
}

impl Default for RiskThresholds {
    fn default() -> Self {
        Self {
            max_position_size: 10.0,
            max_drawdown_pct: 0.10,   // -10% per position
            max_daily_loss_pct: 0.05, // -5% daily
            max_leverage: 1.0,        // spot
        }
    }
}

/// Per-day account statistics. The engine updates these on every closing
/// fill; resetting at the day boundary is the caller's job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DailyStats {
    pub start_balance: f64,
    pub current_balance: f64,
    pub total_pnl: f64,
    pub trade_count: u32,
}

impl DailyStats {
    pub fn new(start_balance: f64) -> Self {
        Self {
            start_balance,
            current_balance: start_balance,
            total_pnl: 0.0,
            trade_count: 0,
        }
    }

    pub fn record_trade_close(&mut self, realized_pnl: f64) {
        self.total_pnl += realized_pnl;
        self.current_balance += realized_pnl;
        self.trade_count += 1;
    }

    pub fn reset(&mut self, start_balance: f64) {
        *self = Self::new(start_balance);
    }
}

/// First threshold a position/account state violates
#[derive(Debug, Clone, PartialEq, Error)]
pub enum RiskBreach {
    #[error("Position size {size:.4} exceeds limit {limit:.4}")]
    PositionSize { size: f64, limit: f64 },

    #[error("Drawdown {pct:.2}% exceeds limit {limit:.2}%")]
    Drawdown { pct: f64, limit: f64 },

    #[error("Daily loss {pct:.2}% exceeds limit {limit:.2}%")]
    DailyLoss { pct: f64, limit: f64 },
}

/// Evaluate thresholds in a fixed order: position size, then per-position
/// drawdown, then account daily loss. The first violation wins; checks
/// never combine.
pub fn check_thresholds(
    position: &Position,
    daily: &DailyStats,
    thresholds: &RiskThresholds,
) -> Result<(), RiskBreach> {
    if position.abs_size() > thresholds.max_position_size {
        return Err(RiskBreach::PositionSize {
            size: position.abs_size(),
            limit: thresholds.max_position_size,
        });
    }

    let entry_notional = position.entry_price * position.abs_size();
    if position.unrealized_pnl < 0.0 && entry_notional > SIZE_EPSILON {
        let loss_pct = -position.unrealized_pnl / entry_notional;
        if loss_pct > thresholds.max_drawdown_pct {
            return Err(RiskBreach::Drawdown {
                pct: loss_pct * 100.0,
                limit: thresholds.max_drawdown_pct * 100.0,
            });
        }
    }

    if daily.start_balance > SIZE_EPSILON {
        let daily_loss_pct = (daily.start_balance - daily.current_balance) / daily.start_balance;
        if daily_loss_pct > thresholds.max_daily_loss_pct {
            return Err(RiskBreach::DailyLoss {
                pct: daily_loss_pct * 100.0,
                limit: thresholds.max_daily_loss_pct * 100.0,
            });
        }
    }

    Ok(())
}
