use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::risk::RiskThresholds;

/// Engine configuration. Defaults are safe for live polling; tests and
/// backtests compress the intervals.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    pub initial_balance: f64,
    pub cash_currency: String,
    /// Fee rate attributed to limit fills reconciled from status polls
    /// (market fills report their fees directly)
    pub fee_rate: f64,
    pub order_poll_interval_ms: u64,
    pub mark_interval_ms: u64,
    /// Timeout applied to every port call made from a monitoring task
    pub port_timeout_ms: u64,
    pub risk: RiskThresholds,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            initial_balance: 10_000.0,
            cash_currency: "USD".to_string(),
            fee_rate: 0.001,
            order_poll_interval_ms: 1_000,
            mark_interval_ms: 1_000,
            port_timeout_ms: 5_000,
            risk: RiskThresholds::default(),
        }
    }
}

impl EngineConfig {
    /// Load configuration: defaults, then an optional `Engine.toml`, then
    /// `TRADEBOT_*` environment variables (e.g. `TRADEBOT_FEE_RATE`).
    pub fn load() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();

        let cfg = config::Config::builder()
            .add_source(config::Config::try_from(&Self::default())?)
            .add_source(config::File::with_name("Engine").required(false))
            .add_source(config::Environment::with_prefix("TRADEBOT").separator("__"))
            .build()?;

        Ok(cfg.try_deserialize()?)
    }

    pub fn order_poll_interval(&self) -> Duration {
        Duration::from_millis(self.order_poll_interval_ms)
    }

    pub fn mark_interval(&self) -> Duration {
        Duration::from_millis(self.mark_interval_ms)
    }

    pub fn port_timeout(&self) -> Duration {
        Duration::from_millis(self.port_timeout_ms)
    }
}
