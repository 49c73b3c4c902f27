// Core modules
pub mod backtest;
pub mod config;
pub mod engine;
pub mod errors;
pub mod events;
pub mod ledger;
pub mod models;
pub mod orders;
pub mod port;
pub mod risk;

// Re-export commonly used types
pub use config::EngineConfig;
pub use engine::{BracketRequest, BracketResult, ExecutionEngine, ExecutionReport};
pub use errors::EngineError;
pub use models::*;

// Error handling
pub type Result<T> = std::result::Result<T, EngineError>;
