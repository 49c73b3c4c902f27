use thiserror::Error;

use crate::port::PortError;

/// Engine error taxonomy.
///
/// `Validation` and `State` never reach the port. `Port` errors on a
/// placement abort that single order and are surfaced to the caller;
/// the engine performs no automatic placement retries.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("insufficient funds: required {required:.2}, available {available:.2}")]
    InsufficientFunds { required: f64, available: f64 },

    #[error(transparent)]
    Port(#[from] PortError),

    #[error("illegal state transition: {0}")]
    State(String),

    #[error("risk threshold breached: {0}")]
    RiskBreach(String),

    #[error("trading halted: {0}")]
    TradingHalted(String),
}

impl EngineError {
    /// True for failures that were raised before any port call was made
    pub fn is_pre_trade(&self) -> bool {
        matches!(
            self,
            EngineError::Validation(_)
                | EngineError::InsufficientFunds { .. }
                | EngineError::State(_)
                | EngineError::TradingHalted(_)
        )
    }
}
