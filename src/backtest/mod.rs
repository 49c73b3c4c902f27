// Historical-simulation backend: walk generation, the bar-by-bar driver,
// and read-only run analytics.
pub mod metrics;
pub mod runner;
pub mod walk;

pub use metrics::BacktestReport;
pub use runner::{BacktestRunner, BarAction};
pub use walk::{PriceWalk, WalkScenario};
