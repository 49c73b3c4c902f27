use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::errors::EngineError;
use crate::models::{Side, SIZE_EPSILON};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum PositionStatus {
    Open,
    PartiallyClosed,
    Closed,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum PositionSide {
    Long,
    Short,
}

/// One net position per instrument. `size` is signed (positive = long);
/// the `side()` view must always agree with the sign.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Position {
    pub id: Uuid,
    pub instrument: String,
    pub size: f64,
    pub entry_price: f64,
    pub current_price: f64,
    pub realized_pnl: f64,
    pub unrealized_pnl: f64,
    /// Fees paid on the fills still open in this position; shrinks as
    /// closes pro-rate it out
    pub entry_fees: f64,
    pub total_fees: f64,
    pub status: PositionStatus,
    pub order_ids: Vec<String>,
    pub opened_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Position {
    pub fn side(&self) -> PositionSide {
        if self.size >= 0.0 {
            PositionSide::Long
        } else {
            PositionSide::Short
        }
    }

    pub fn abs_size(&self) -> f64 {
        self.size.abs()
    }

    /// Entry fee attributed to closing `closed_qty`, pro-rated against the
    /// size immediately before the closing fill
    pub fn pro_rated_entry_fee(&self, closed_qty: f64) -> f64 {
        let pre_close = self.abs_size();
        if pre_close <= SIZE_EPSILON {
            return 0.0;
        }
        self.entry_fees * (closed_qty / pre_close)
    }

    fn recompute_unrealized(&mut self) {
        self.unrealized_pnl = (self.current_price - self.entry_price) * self.size;
    }
}

/// Summary of what one fill did to the ledger
#[derive(Debug, Clone)]
pub enum PositionUpdate {
    Opened {
        instrument: String,
        size: f64,
        entry_price: f64,
    },
    Increased {
        instrument: String,
        size: f64,
        entry_price: f64,
    },
    Reduced {
        instrument: String,
        remaining: f64,
        realized_delta: f64,
    },
    Closed {
        instrument: String,
        realized_delta: f64,
        realized_total: f64,
        total_fees: f64,
    },
}

/// The only component allowed to mutate positions. Each call touches
/// exactly one instrument's position, so marking different instruments
/// never contends on anything but the map itself.
#[derive(Default)]
pub struct PositionLedger {
    positions: HashMap<String, Position>,
    closed: Vec<Position>,
}

impl PositionLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Route one fill into the position for its instrument
    pub fn on_fill(
        &mut self,
        instrument: &str,
        side: Side,
        fill_qty: f64,
        fill_price: f64,
        fees: f64,
        order_id: &str,
        timestamp: DateTime<Utc>,
    ) -> Result<PositionUpdate, EngineError> {
        if fill_qty <= 0.0 {
            return Err(EngineError::Validation(format!(
                "fill quantity must be positive, got {}",
                fill_qty
            )));
        }

        let signed_qty = fill_qty * side.sign();

        let position = match self.positions.get_mut(instrument) {
            None => {
                let mut position = Position {
                    id: Uuid::new_v4(),
                    instrument: instrument.to_string(),
                    size: signed_qty,
                    entry_price: fill_price,
                    current_price: fill_price,
                    realized_pnl: 0.0,
                    unrealized_pnl: 0.0,
                    entry_fees: fees,
                    total_fees: fees,
                    status: PositionStatus::Open,
                    order_ids: vec![order_id.to_string()],
                    opened_at: timestamp,
                    updated_at: timestamp,
                };
                position.recompute_unrealized();
                let update = PositionUpdate::Opened {
                    instrument: instrument.to_string(),
                    size: position.size,
                    entry_price: position.entry_price,
                };
                self.positions.insert(instrument.to_string(), position);
                return Ok(update);
            }
            Some(position) => position,
        };

        position.order_ids.push(order_id.to_string());
        position.updated_at = timestamp;

        if position.size.signum() == signed_qty.signum() {
            // Adding to the existing exposure: volume-weighted entry
            let old_abs = position.abs_size();
            position.entry_price = (position.entry_price * old_abs + fill_price * fill_qty)
                / (old_abs + fill_qty);
            position.size += signed_qty;
            position.entry_fees += fees;
            position.total_fees += fees;
            position.current_price = fill_price;
            position.recompute_unrealized();

            Ok(PositionUpdate::Increased {
                instrument: instrument.to_string(),
                size: position.size,
                entry_price: position.entry_price,
            })
        } else {
            // Reducing or closing
            let pre_close = position.abs_size();
            if fill_qty > pre_close + SIZE_EPSILON {
                return Err(EngineError::Validation(format!(
                    "fill of {} would flip the {} position of {}",
                    fill_qty, instrument, pre_close
                )));
            }
            let closed_qty = fill_qty.min(pre_close);

            let direction = if position.size > 0.0 { 1.0 } else { -1.0 };
            let gross = (fill_price - position.entry_price) * closed_qty * direction;
            let entry_fee_share = position.pro_rated_entry_fee(closed_qty);
            let realized_delta = gross - fees - entry_fee_share;

            position.realized_pnl += realized_delta;
            position.entry_fees -= entry_fee_share;
            position.total_fees += fees;
            position.size -= closed_qty * direction;
            position.current_price = fill_price;

            if position.abs_size() <= SIZE_EPSILON {
                position.size = 0.0;
                position.status = PositionStatus::Closed;
                position.recompute_unrealized();
                let update = PositionUpdate::Closed {
                    instrument: instrument.to_string(),
                    realized_delta,
                    realized_total: position.realized_pnl,
                    total_fees: position.total_fees,
                };
                if let Some(position) = self.positions.remove(instrument) {
                    self.closed.push(position);
                }
                Ok(update)
            } else {
                position.status = PositionStatus::PartiallyClosed;
                position.recompute_unrealized();
                Ok(PositionUpdate::Reduced {
                    instrument: instrument.to_string(),
                    remaining: position.size,
                    realized_delta,
                })
            }
        }
    }

    /// Refresh the mark and the derived unrealized P&L. Never touches
    /// realized P&L.
    pub fn mark(&mut self, instrument: &str, current_price: f64) -> Option<Position> {
        let position = self.positions.get_mut(instrument)?;
        position.current_price = current_price;
        position.recompute_unrealized();
        Some(position.clone())
    }

    pub fn get(&self, instrument: &str) -> Option<Position> {
        self.positions.get(instrument).cloned()
    }

    pub fn open_positions(&self) -> Vec<Position> {
        self.positions.values().cloned().collect()
    }

    pub fn open_instruments(&self) -> Vec<String> {
        self.positions.keys().cloned().collect()
    }

    pub fn closed_positions(&self) -> &[Position] {
        &self.closed
    }

    /// Sum of realized P&L over closed and still-open positions
    pub fn total_realized_pnl(&self) -> f64 {
        self.closed.iter().map(|p| p.realized_pnl).sum::<f64>()
            + self.positions.values().map(|p| p.realized_pnl).sum::<f64>()
    }
}
