use std::sync::Arc;

use crate::backtest::metrics::BacktestReport;
use crate::config::EngineConfig;
use crate::engine::{BracketRequest, ExecutionEngine};
use crate::errors::EngineError;
use crate::events::{EventSink, MemorySink};
use crate::ledger::Position;
use crate::models::{Candle, OrderType, Side, TimeInForce};
use crate::port::{SimConfig, SimulationPort};

/// What a decision callback may ask the engine to do on one bar
#[derive(Debug, Clone)]
pub enum BarAction {
    Market {
        side: Side,
        size: f64,
    },
    Limit {
        side: Side,
        size: f64,
        price: f64,
    },
    Bracket {
        side: Side,
        size: f64,
        stop_loss: f64,
        take_profit: f64,
    },
    CancelOpenOrders,
}

/// Drives the engine bar-by-bar against the simulation port. The same
/// engine code paths run here as in live mode; only the port and the
/// pacing differ.
pub struct BacktestRunner {
    engine: ExecutionEngine,
    sim: Arc<SimulationPort>,
    sink: Arc<MemorySink>,
    initial_balance: f64,
}

impl BacktestRunner {
    pub fn new(sim_config: SimConfig, mut engine_config: EngineConfig, seed: u64) -> Self {
        let initial_balance = sim_config.initial_cash;
        engine_config.initial_balance = initial_balance;
        engine_config.cash_currency = sim_config.cash_currency.clone();
        engine_config.fee_rate = sim_config.fee_rate;

        let sim = Arc::new(SimulationPort::new(sim_config, seed));
        let sink = Arc::new(MemorySink::new());
        let engine = ExecutionEngine::new(
            sim.clone(),
            sink.clone() as Arc<dyn EventSink>,
            engine_config,
        );

        Self {
            engine,
            sim,
            sink,
            initial_balance,
        }
    }

    pub fn engine(&self) -> &ExecutionEngine {
        &self.engine
    }

    pub fn sim(&self) -> &SimulationPort {
        &self.sim
    }

    pub fn sink(&self) -> &MemorySink {
        &self.sink
    }

    /// Replay `candles` through the engine. `decide` sees each bar plus
    /// the current position and returns the actions to take on it.
    pub async fn run<F>(
        &self,
        instrument: &str,
        candles: &[Candle],
        mut decide: F,
    ) -> Result<BacktestReport, EngineError>
    where
        F: FnMut(usize, &Candle, Option<&Position>) -> Vec<BarAction>,
    {
        if candles.is_empty() {
            return Err(EngineError::Validation(
                "backtest requires at least one candle".to_string(),
            ));
        }

        tracing::info!(
            instrument = %instrument,
            bars = candles.len(),
            "starting backtest run"
        );
        self.sim.load_series(instrument, candles.to_vec());

        let mut equity = Vec::with_capacity(candles.len());

        for (i, bar) in candles.iter().enumerate() {
            if i > 0 && self.sim.advance().is_none() {
                break;
            }

            // Fold in fills on resting orders, resolve bracket pairs, then
            // re-mark at the close. This mirrors what the live monitors do
            // once per second.
            self.engine.reconcile_open_orders(instrument).await?;
            self.engine.reconcile_brackets().await?;
            self.engine.mark_and_enforce(instrument, bar.close).await;

            let position = self.engine.get_position(instrument);
            for action in decide(i, bar, position.as_ref()) {
                self.apply_action(instrument, action).await;
            }

            equity.push(self.equity(instrument, bar.close).await?);
        }

        // Leave no spawned bracket monitor mutating state after the run
        self.engine.stop_all_monitoring().await;

        let trades = self.engine.closed_positions().len();
        let total_fees = self.engine.total_fees_paid();
        let report =
            BacktestReport::from_equity_curve(self.initial_balance, &equity, trades, total_fees);

        tracing::info!(
            trades = report.trades,
            total_return_pct = report.total_return * 100.0,
            "backtest complete"
        );
        Ok(report)
    }

    async fn apply_action(&self, instrument: &str, action: BarAction) {
        match action {
            BarAction::Market { side, size } => {
                let report = self.engine.execute_market_order(instrument, side, size).await;
                if !report.success {
                    tracing::debug!(error = ?report.error, "market order skipped");
                }
            }
            BarAction::Limit { side, size, price } => {
                let report = self
                    .engine
                    .execute_limit_order(instrument, side, size, price, TimeInForce::Gtc)
                    .await;
                if !report.success {
                    tracing::debug!(error = ?report.error, "limit order skipped");
                }
            }
            BarAction::Bracket {
                side,
                size,
                stop_loss,
                take_profit,
            } => {
                let result = self
                    .engine
                    .execute_bracket_order(BracketRequest {
                        instrument: instrument.to_string(),
                        side,
                        size,
                        stop_loss,
                        take_profit,
                        entry_price: None,
                        entry_type: OrderType::Market,
                    })
                    .await;
                if !result.success {
                    tracing::debug!(error = ?result.error, "bracket skipped");
                }
            }
            BarAction::CancelOpenOrders => {
                for order_id in self.engine_live_orders(instrument) {
                    if let Err(e) = self.engine.cancel_order(&order_id).await {
                        tracing::debug!(order_id = %order_id, error = %e, "cancel skipped");
                    }
                }
            }
        }
    }

    fn engine_live_orders(&self, instrument: &str) -> Vec<String> {
        self.engine
            .inner
            .orders
            .lock()
            .unwrap()
            .live_orders()
            .into_iter()
            .filter(|o| o.instrument == instrument)
            .map(|o| o.id)
            .collect()
    }

    /// One equity sample: cash plus signed inventory at the bar close
    async fn equity(&self, instrument: &str, close: f64) -> Result<f64, EngineError> {
        let cash = self.sim.cash();
        let inventory = self.sim.inventory(instrument);
        Ok(cash + inventory * close)
    }
}
