// Execution port abstraction: where orders actually execute.
pub mod retry;
pub mod sim;

pub use retry::RetryPolicy;
pub use sim::{SimConfig, SimulationPort};

use std::collections::HashMap;

use async_trait::async_trait;
use thiserror::Error;
use uuid::Uuid;

use crate::models::{OrderStatus, Side, TimeInForce};

/// Venue/network/simulation failures surfaced by a port
#[derive(Debug, Clone, Error)]
pub enum PortError {
    #[error("network error: {0}")]
    Network(String),

    #[error("venue rejected request: {0}")]
    Venue(String),

    #[error("port call timed out: {0}")]
    Timeout(String),

    #[error("unknown order id: {0}")]
    UnknownOrder(String),

    #[error("insufficient liquidity for {0}")]
    InsufficientLiquidity(String),
}

impl PortError {
    /// Transient failures are worth retrying on the next monitoring tick;
    /// permanent rejections are not.
    pub fn is_transient(&self) -> bool {
        matches!(self, PortError::Network(_) | PortError::Timeout(_))
    }
}

/// Result of a market order that the venue reports as immediately executed
#[derive(Debug, Clone)]
pub struct MarketFill {
    pub order_id: String,
    pub price: f64,
    pub size: f64,
    pub fees: f64,
}

/// Point-in-time view of an order held at the venue
#[derive(Debug, Clone)]
pub struct OrderSnapshot {
    pub status: OrderStatus,
    pub filled_size: f64,
    pub average_fill_price: f64,
}

/// The abstraction over "where orders actually execute": a live exchange
/// adapter or the deterministic simulator. The engine, order store, ledger
/// and risk monitor run unmodified against either implementation.
#[async_trait]
pub trait ExecutionPort: Send + Sync {
    async fn place_market_order(
        &self,
        instrument: &str,
        side: Side,
        size: f64,
        client_order_id: Uuid,
    ) -> Result<MarketFill, PortError>;

    async fn place_limit_order(
        &self,
        instrument: &str,
        side: Side,
        size: f64,
        price: f64,
        client_order_id: Uuid,
        time_in_force: TimeInForce,
    ) -> Result<String, PortError>;

    async fn cancel_order(&self, order_id: &str) -> Result<(), PortError>;

    async fn get_order_status(&self, order_id: &str) -> Result<OrderSnapshot, PortError>;

    async fn get_current_price(&self, instrument: &str) -> Result<f64, PortError>;

    async fn get_balances(&self) -> Result<HashMap<String, f64>, PortError>;
}
