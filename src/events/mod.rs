use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::{OrderType, Side};

/// One variant per lifecycle event. Consumers get the full numeric
/// context of each event; the engine never blocks on the sink.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum EngineEvent {
    OrderSubmitted {
        instrument: String,
        order_id: String,
        client_order_id: Uuid,
        side: Side,
        order_type: OrderType,
        size: f64,
        limit_price: Option<f64>,
        timestamp: DateTime<Utc>,
    },
    OrderFilled {
        instrument: String,
        order_id: String,
        fill_size: f64,
        fill_price: f64,
        filled_total: f64,
        remaining: f64,
        partial: bool,
        timestamp: DateTime<Utc>,
    },
    OrderCancelled {
        instrument: String,
        order_id: String,
        timestamp: DateTime<Utc>,
    },
    OrderRejected {
        instrument: String,
        side: Side,
        size: f64,
        reason: String,
        timestamp: DateTime<Utc>,
    },
    PositionOpened {
        instrument: String,
        size: f64,
        entry_price: f64,
        timestamp: DateTime<Utc>,
    },
    PositionAdjusted {
        instrument: String,
        size: f64,
        entry_price: f64,
        realized_pnl_delta: f64,
        timestamp: DateTime<Utc>,
    },
    PositionClosed {
        instrument: String,
        realized_pnl: f64,
        fees: f64,
        timestamp: DateTime<Utc>,
    },
    PositionMarked {
        instrument: String,
        price: f64,
        unrealized_pnl: f64,
        timestamp: DateTime<Utc>,
    },
    RiskBreached {
        instrument: String,
        reason: String,
        timestamp: DateTime<Utc>,
    },
    TradingHalted {
        reason: String,
        timestamp: DateTime<Utc>,
    },
    TradingResumed {
        timestamp: DateTime<Utc>,
    },
    MonitorError {
        scope: String,
        message: String,
        timestamp: DateTime<Utc>,
    },
}

impl EngineEvent {
    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            EngineEvent::OrderSubmitted { timestamp, .. }
            | EngineEvent::OrderFilled { timestamp, .. }
            | EngineEvent::OrderCancelled { timestamp, .. }
            | EngineEvent::OrderRejected { timestamp, .. }
            | EngineEvent::PositionOpened { timestamp, .. }
            | EngineEvent::PositionAdjusted { timestamp, .. }
            | EngineEvent::PositionClosed { timestamp, .. }
            | EngineEvent::PositionMarked { timestamp, .. }
            | EngineEvent::RiskBreached { timestamp, .. }
            | EngineEvent::TradingHalted { timestamp, .. }
            | EngineEvent::TradingResumed { timestamp }
            | EngineEvent::MonitorError { timestamp, .. } => *timestamp,
        }
    }

    pub fn instrument(&self) -> Option<&str> {
        match self {
            EngineEvent::OrderSubmitted { instrument, .. }
            | EngineEvent::OrderFilled { instrument, .. }
            | EngineEvent::OrderCancelled { instrument, .. }
            | EngineEvent::OrderRejected { instrument, .. }
            | EngineEvent::PositionOpened { instrument, .. }
            | EngineEvent::PositionAdjusted { instrument, .. }
            | EngineEvent::PositionClosed { instrument, .. }
            | EngineEvent::PositionMarked { instrument, .. }
            | EngineEvent::RiskBreached { instrument, .. } => Some(instrument),
            _ => None,
        }
    }
}

/// Consumed by the external audit/log collaborator. Implementations must
/// return promptly; durability is the collaborator's problem.
pub trait EventSink: Send + Sync {
    fn publish(&self, event: EngineEvent);
}

/// Sink that writes every event to the tracing log
pub struct TracingSink;

impl EventSink for TracingSink {
    fn publish(&self, event: EngineEvent) {
        match &event {
            EngineEvent::RiskBreached { instrument, reason, .. } => {
                tracing::warn!(instrument = %instrument, reason = %reason, "risk breached");
            }
            EngineEvent::TradingHalted { reason, .. } => {
                tracing::warn!(reason = %reason, "trading halted");
            }
            EngineEvent::MonitorError { scope, message, .. } => {
                tracing::error!(scope = %scope, message = %message, "monitor error");
            }
            other => {
                tracing::info!(event = ?other, "engine event");
            }
        }
    }
}

/// Sink that buffers events in memory. Used by the backtest runner and tests.
#[derive(Default)]
pub struct MemorySink {
    events: std::sync::Mutex<Vec<EngineEvent>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<EngineEvent> {
        self.events.lock().unwrap().clone()
    }

    pub fn clear(&self) {
        self.events.lock().unwrap().clear();
    }
}

impl EventSink for MemorySink {
    fn publish(&self, event: EngineEvent) {
        self.events.lock().unwrap().push(event);
    }
}
