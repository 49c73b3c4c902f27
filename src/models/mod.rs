use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Tolerance for float residue when deciding a size has reached zero
pub const SIZE_EPSILON: f64 = 1e-9;

/// Order side
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    pub fn opposite(&self) -> Side {
        match self {
            Side::Buy => Side::Sell,
            Side::Sell => Side::Buy,
        }
    }

    /// +1 for buy, -1 for sell (sign applied to position size)
    pub fn sign(&self) -> f64 {
        match self {
            Side::Buy => 1.0,
            Side::Sell => -1.0,
        }
    }
}

impl std::fmt::Display for Side {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Side::Buy => write!(f, "buy"),
            Side::Sell => write!(f, "sell"),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum OrderType {
    Market,
    Limit,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub enum TimeInForce {
    #[default]
    Gtc,
    Ioc,
}

/// Order lifecycle states. Transitions only move forward: once terminal,
/// an order never changes again.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum OrderStatus {
    Pending,
    Open,
    PartiallyFilled,
    Filled,
    Cancelled,
    Rejected,
    Expired,
}

impl OrderStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            OrderStatus::Filled
                | OrderStatus::Cancelled
                | OrderStatus::Rejected
                | OrderStatus::Expired
        )
    }
}

impl std::fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            OrderStatus::Pending => "PENDING",
            OrderStatus::Open => "OPEN",
            OrderStatus::PartiallyFilled => "PARTIALLY_FILLED",
            OrderStatus::Filled => "FILLED",
            OrderStatus::Cancelled => "CANCELLED",
            OrderStatus::Rejected => "REJECTED",
            OrderStatus::Expired => "EXPIRED",
        };
        write!(f, "{}", s)
    }
}

/// One entry in an order's transition log
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateTransition {
    pub from: OrderStatus,
    pub to: OrderStatus,
    pub timestamp: DateTime<Utc>,
    pub filled_size: f64,
    pub remaining_size: f64,
}

/// A single order. Identity fields never change after creation; the
/// lifecycle fields are owned exclusively by the order store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Order {
    pub id: String,
    pub client_order_id: Uuid,
    pub instrument: String,
    pub side: Side,
    pub order_type: OrderType,
    pub requested_size: f64,
    pub limit_price: Option<f64>,
    pub time_in_force: TimeInForce,
    pub status: OrderStatus,
    pub filled_size: f64,
    pub remaining_size: f64,
    pub average_fill_price: f64,
    pub transitions: Vec<StateTransition>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Order {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        id: String,
        client_order_id: Uuid,
        instrument: String,
        side: Side,
        order_type: OrderType,
        requested_size: f64,
        limit_price: Option<f64>,
        time_in_force: TimeInForce,
    ) -> Self {
        let now = Utc::now();
        Self {
            id,
            client_order_id,
            instrument,
            side,
            order_type,
            requested_size,
            limit_price,
            time_in_force,
            status: OrderStatus::Pending,
            filled_size: 0.0,
            remaining_size: requested_size,
            average_fill_price: 0.0,
            transitions: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Whether the order can still be cancelled
    pub fn is_cancellable(&self) -> bool {
        matches!(
            self.status,
            OrderStatus::Pending | OrderStatus::Open | OrderStatus::PartiallyFilled
        )
    }
}

/// A single execution against an order
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Fill {
    pub order_id: String,
    pub size: f64,
    pub price: f64,
    pub fees: f64,
    pub timestamp: DateTime<Utc>,
}

/// OHLCV bar
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Candle {
    pub instrument: String,
    pub timestamp: DateTime<Utc>,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

/// Entry + stop-loss + take-profit managed as one unit. Holds only the
/// order ids; the orders themselves live in the order store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BracketGroup {
    pub id: Uuid,
    pub instrument: String,
    pub side: Side,
    pub size: f64,
    pub entry_id: String,
    pub stop_id: Option<String>,
    pub target_id: Option<String>,
    pub created_at: DateTime<Utc>,
}
