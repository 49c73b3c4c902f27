// Execution engine facade and its monitoring tasks.
pub mod bracket;
pub mod monitor;

pub use bracket::{BracketRequest, BracketResult};

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use chrono::Utc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::config::EngineConfig;
use crate::errors::EngineError;
use crate::events::{EngineEvent, EventSink};
use crate::ledger::{Position, PositionLedger, PositionUpdate};
use crate::models::{
    BracketGroup, Order, OrderStatus, OrderType, Side, TimeInForce, SIZE_EPSILON,
};
use crate::orders::{OrderHistoryFilter, OrderStore};
use crate::port::{ExecutionPort, OrderSnapshot, PortError, RetryPolicy};
use crate::risk::{check_thresholds, DailyStats, RiskThresholds};

pub type HaltCallback = Box<dyn Fn(&str) + Send + Sync>;

/// Outcome of a single order submission. Failed submissions keep enough
/// of the attempt to reconstruct what was asked for.
#[derive(Debug)]
pub struct ExecutionReport {
    pub success: bool,
    pub order: Option<Order>,
    pub instrument: String,
    pub side: Side,
    pub size: f64,
    pub error: Option<EngineError>,
}

impl ExecutionReport {
    fn ok(order: Order) -> Self {
        Self {
            success: true,
            instrument: order.instrument.clone(),
            side: order.side,
            size: order.requested_size,
            order: Some(order),
            error: None,
        }
    }

    fn failed(instrument: &str, side: Side, size: f64, error: EngineError) -> Self {
        Self {
            success: false,
            order: None,
            instrument: instrument.to_string(),
            side,
            size,
            error: Some(error),
        }
    }
}

/// Aggregate account view
#[derive(Debug, Clone)]
pub struct PortfolioSnapshot {
    pub equity: f64,
    pub cash: f64,
    pub realized_pnl: f64,
    pub unrealized_pnl: f64,
    pub open_positions: usize,
}

struct MonitorHandle {
    stop: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

pub(crate) struct EngineInner {
    pub(crate) config: EngineConfig,
    pub(crate) port: Arc<dyn ExecutionPort>,
    pub(crate) sink: Arc<dyn EventSink>,
    pub(crate) orders: Mutex<OrderStore>,
    pub(crate) ledger: Mutex<PositionLedger>,
    pub(crate) thresholds: RwLock<RiskThresholds>,
    pub(crate) daily: Mutex<DailyStats>,
    pub(crate) retry: RetryPolicy,
    trading_enabled: AtomicBool,
    monitoring_active: AtomicBool,
    halt_callbacks: Mutex<Vec<HaltCallback>>,
    position_monitors: Mutex<HashMap<String, MonitorHandle>>,
    bracket_monitors: Mutex<HashMap<Uuid, MonitorHandle>>,
    brackets: Mutex<HashMap<Uuid, BracketGroup>>,
}

/// Single entry point for strategy runners and the backtest loop. Cheap
/// to clone; every clone shares the same state.
#[derive(Clone)]
pub struct ExecutionEngine {
    pub(crate) inner: Arc<EngineInner>,
}

impl ExecutionEngine {
    pub fn new(
        port: Arc<dyn ExecutionPort>,
        sink: Arc<dyn EventSink>,
        config: EngineConfig,
    ) -> Self {
        let daily = DailyStats::new(config.initial_balance);
        let thresholds = config.risk.clone();
        Self {
            inner: Arc::new(EngineInner {
                config,
                port,
                sink,
                orders: Mutex::new(OrderStore::new()),
                ledger: Mutex::new(PositionLedger::new()),
                thresholds: RwLock::new(thresholds),
                daily: Mutex::new(daily),
                retry: RetryPolicy::default(),
                trading_enabled: AtomicBool::new(true),
                monitoring_active: AtomicBool::new(false),
                halt_callbacks: Mutex::new(Vec::new()),
                position_monitors: Mutex::new(HashMap::new()),
                bracket_monitors: Mutex::new(HashMap::new()),
                brackets: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    pub fn is_trading_enabled(&self) -> bool {
        self.inner.trading_enabled.load(Ordering::SeqCst)
    }

    fn ensure_trading_enabled(&self) -> Result<(), EngineError> {
        if self.is_trading_enabled() {
            Ok(())
        } else {
            Err(EngineError::TradingHalted(
                "new submissions are blocked".to_string(),
            ))
        }
    }

    pub(crate) fn emit(&self, event: EngineEvent) {
        self.inner.sink.publish(event);
    }

    // ------------------------------------------------------------------
    // Submission paths
    // ------------------------------------------------------------------

    pub async fn execute_market_order(
        &self,
        instrument: &str,
        side: Side,
        size: f64,
    ) -> ExecutionReport {
        let client_order_id = Uuid::new_v4();

        if let Err(e) = self.pre_trade_checks(instrument, side, size, OrderType::Market, None) {
            return self.reject_without_port(instrument, side, size, e);
        }

        // Funds are checked against the live mark for market entries
        if self.increases_exposure(instrument, side) {
            let price = match self
                .with_timeout(
                    "get_current_price",
                    self.inner.port.get_current_price(instrument),
                )
                .await
            {
                Ok(p) => p,
                Err(e) => {
                    return self.reject_without_port(instrument, side, size, EngineError::Port(e))
                }
            };
            if let Err(e) = self.check_funds(instrument, size * price).await {
                return self.reject_without_port(instrument, side, size, e);
            }
        }

        match self
            .with_timeout(
                "place_market_order",
                self.inner
                    .port
                    .place_market_order(instrument, side, size, client_order_id),
            )
            .await
        {
            Ok(fill) => {
                let mut order = Order::new(
                    fill.order_id.clone(),
                    client_order_id,
                    instrument.to_string(),
                    side,
                    OrderType::Market,
                    size,
                    None,
                    TimeInForce::Gtc,
                );
                order.filled_size = fill.size;
                order.remaining_size = (size - fill.size).max(0.0);
                order.average_fill_price = fill.price;
                let status = if order.remaining_size <= SIZE_EPSILON {
                    order.remaining_size = 0.0;
                    order.filled_size = size;
                    OrderStatus::Filled
                } else {
                    OrderStatus::PartiallyFilled
                };

                {
                    let mut orders = self.inner.orders.lock().unwrap();
                    orders.insert_submitted(order.clone(), status);
                }

                self.emit(EngineEvent::OrderSubmitted {
                    instrument: instrument.to_string(),
                    order_id: fill.order_id.clone(),
                    client_order_id,
                    side,
                    order_type: OrderType::Market,
                    size,
                    limit_price: None,
                    timestamp: Utc::now(),
                });
                self.emit(EngineEvent::OrderFilled {
                    instrument: instrument.to_string(),
                    order_id: fill.order_id.clone(),
                    fill_size: fill.size,
                    fill_price: fill.price,
                    filled_total: fill.size,
                    remaining: (size - fill.size).max(0.0),
                    partial: status != OrderStatus::Filled,
                    timestamp: Utc::now(),
                });

                self.record_ledger_fill(instrument, side, fill.size, fill.price, fill.fees, &fill.order_id);

                let stored = self
                    .inner
                    .orders
                    .lock()
                    .unwrap()
                    .get(&fill.order_id)
                    .unwrap_or(order);
                ExecutionReport::ok(stored)
            }
            Err(e) => self.reject_after_port(instrument, side, size, client_order_id, OrderType::Market, None, e),
        }
    }

    pub async fn execute_limit_order(
        &self,
        instrument: &str,
        side: Side,
        size: f64,
        price: f64,
        time_in_force: TimeInForce,
    ) -> ExecutionReport {
        let client_order_id = Uuid::new_v4();

        if let Err(e) =
            self.pre_trade_checks(instrument, side, size, OrderType::Limit, Some(price))
        {
            return self.reject_without_port(instrument, side, size, e);
        }

        if self.increases_exposure(instrument, side) {
            if let Err(e) = self.check_funds(instrument, size * price).await {
                return self.reject_without_port(instrument, side, size, e);
            }
        }

        match self
            .with_timeout(
                "place_limit_order",
                self.inner
                    .port
                    .place_limit_order(instrument, side, size, price, client_order_id, time_in_force),
            )
            .await
        {
            Ok(order_id) => {
                let order = Order::new(
                    order_id.clone(),
                    client_order_id,
                    instrument.to_string(),
                    side,
                    OrderType::Limit,
                    size,
                    Some(price),
                    time_in_force,
                );
                {
                    let mut orders = self.inner.orders.lock().unwrap();
                    orders.insert_submitted(order.clone(), OrderStatus::Open);
                }
                self.emit(EngineEvent::OrderSubmitted {
                    instrument: instrument.to_string(),
                    order_id: order_id.clone(),
                    client_order_id,
                    side,
                    order_type: OrderType::Limit,
                    size,
                    limit_price: Some(price),
                    timestamp: Utc::now(),
                });

                let stored = self
                    .inner
                    .orders
                    .lock()
                    .unwrap()
                    .get(&order_id)
                    .unwrap_or(order);
                ExecutionReport::ok(stored)
            }
            Err(e) => self.reject_after_port(
                instrument,
                side,
                size,
                client_order_id,
                OrderType::Limit,
                Some(price),
                e,
            ),
        }
    }

    pub async fn cancel_order(&self, order_id: &str) -> Result<Order, EngineError> {
        let existing = {
            let orders = self.inner.orders.lock().unwrap();
            orders.get(order_id)
        };
        let existing = existing
            .ok_or_else(|| EngineError::State(format!("unknown order {}", order_id)))?;
        if !existing.is_cancellable() {
            return Err(EngineError::State(format!(
                "cannot cancel order {} in state {}",
                order_id, existing.status
            )));
        }

        self.with_timeout("cancel_order", self.inner.port.cancel_order(order_id))
            .await?;

        let cancelled = {
            let mut orders = self.inner.orders.lock().unwrap();
            match orders.mark_cancelled(order_id) {
                Ok(order) => order,
                // A monitor poll can observe the venue-side cancellation
                // first; that still counts as cancelled
                Err(e) => match orders.get(order_id) {
                    Some(order) if order.status == OrderStatus::Cancelled => return Ok(order),
                    _ => return Err(e),
                },
            }
        };
        self.emit(EngineEvent::OrderCancelled {
            instrument: cancelled.instrument.clone(),
            order_id: order_id.to_string(),
            timestamp: Utc::now(),
        });
        Ok(cancelled)
    }

    // ------------------------------------------------------------------
    // Queries
    // ------------------------------------------------------------------

    pub fn get_position(&self, instrument: &str) -> Option<Position> {
        self.inner.ledger.lock().unwrap().get(instrument)
    }

    pub fn get_all_positions(&self) -> Vec<Position> {
        self.inner.ledger.lock().unwrap().open_positions()
    }

    pub fn closed_positions(&self) -> Vec<Position> {
        self.inner.ledger.lock().unwrap().closed_positions().to_vec()
    }

    /// Fees accumulated across closed and still-open positions
    pub fn total_fees_paid(&self) -> f64 {
        let ledger = self.inner.ledger.lock().unwrap();
        ledger
            .closed_positions()
            .iter()
            .map(|p| p.total_fees)
            .sum::<f64>()
            + ledger
                .open_positions()
                .iter()
                .map(|p| p.total_fees)
                .sum::<f64>()
    }

    pub fn get_order(&self, order_id: &str) -> Option<Order> {
        self.inner.orders.lock().unwrap().get(order_id)
    }

    pub fn get_order_history(&self, filter: &OrderHistoryFilter) -> Vec<Order> {
        self.inner.orders.lock().unwrap().history(filter)
    }

    pub fn get_bracket(&self, group_id: Uuid) -> Option<BracketGroup> {
        self.inner.brackets.lock().unwrap().get(&group_id).cloned()
    }

    pub fn daily_stats(&self) -> DailyStats {
        self.inner.daily.lock().unwrap().clone()
    }

    pub fn risk_thresholds(&self) -> RiskThresholds {
        self.inner.thresholds.read().unwrap().clone()
    }

    pub async fn portfolio_snapshot(&self) -> Result<PortfolioSnapshot, EngineError> {
        let balances = self
            .with_timeout("get_balances", self.inner.port.get_balances())
            .await?;
        let cash = balances
            .get(&self.inner.config.cash_currency)
            .copied()
            .unwrap_or(0.0);

        let ledger = self.inner.ledger.lock().unwrap();
        let open = ledger.open_positions();
        let unrealized: f64 = open.iter().map(|p| p.unrealized_pnl).sum();
        let position_value: f64 = open.iter().map(|p| p.size * p.current_price).sum();

        Ok(PortfolioSnapshot {
            equity: cash + position_value,
            cash,
            realized_pnl: ledger.total_realized_pnl(),
            unrealized_pnl: unrealized,
            open_positions: open.len(),
        })
    }

    // ------------------------------------------------------------------
    // Risk controls
    // ------------------------------------------------------------------

    pub fn update_risk_thresholds(&self, thresholds: RiskThresholds) {
        *self.inner.thresholds.write().unwrap() = thresholds;
    }

    pub fn reset_daily_stats(&self, start_balance: f64) {
        self.inner.daily.lock().unwrap().reset(start_balance);
    }

    /// Register a callback fired synchronously, exactly once per halt event
    pub fn on_halt<F>(&self, callback: F)
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        self.inner
            .halt_callbacks
            .lock()
            .unwrap()
            .push(Box::new(callback));
    }

    /// Close the gate, cancel every open order, fire halt callbacks.
    /// Per-order cancel failures are collected, never abort the halt.
    pub async fn halt_trading(&self, reason: &str) -> Vec<(String, PortError)> {
        let was_enabled = self.inner.trading_enabled.swap(false, Ordering::SeqCst);

        if was_enabled {
            tracing::warn!(reason = %reason, "halting trading");
            self.emit(EngineEvent::TradingHalted {
                reason: reason.to_string(),
                timestamp: Utc::now(),
            });
            let callbacks = self.inner.halt_callbacks.lock().unwrap();
            for callback in callbacks.iter() {
                callback(reason);
            }
        }

        let open_ids = {
            let orders = self.inner.orders.lock().unwrap();
            orders.live_order_ids()
        };

        let mut failures = Vec::new();
        for order_id in open_ids {
            match self
                .with_timeout("cancel_order", self.inner.port.cancel_order(&order_id))
                .await
            {
                Ok(()) => {
                    let cancelled = {
                        let mut orders = self.inner.orders.lock().unwrap();
                        orders.mark_cancelled(&order_id)
                    };
                    if let Ok(order) = cancelled {
                        self.emit(EngineEvent::OrderCancelled {
                            instrument: order.instrument.clone(),
                            order_id,
                            timestamp: Utc::now(),
                        });
                    }
                }
                Err(e) => {
                    tracing::error!(order_id = %order_id, error = %e, "failed to cancel during halt");
                    failures.push((order_id, e));
                }
            }
        }
        failures
    }

    /// Re-open the gate. Cancelled orders are not replaced.
    pub fn resume_trading(&self, confirmation: bool) -> Result<(), EngineError> {
        if !confirmation {
            return Err(EngineError::Validation(
                "resuming requires explicit confirmation".to_string(),
            ));
        }
        self.inner.trading_enabled.store(true, Ordering::SeqCst);
        self.emit(EngineEvent::TradingResumed {
            timestamp: Utc::now(),
        });
        tracing::info!("trading resumed");
        Ok(())
    }

    /// Submit a reducing market order for exactly the size above the cap.
    /// Best-effort: by the time this runs trading is already halted, so a
    /// failure is logged as an event instead of raised.
    pub async fn emergency_reduce_position(&self, instrument: &str) {
        let reduction = {
            let ledger = self.inner.ledger.lock().unwrap();
            let limit = self.inner.thresholds.read().unwrap().max_position_size;
            ledger.get(instrument).and_then(|position| {
                let excess = position.abs_size() - limit;
                if excess > SIZE_EPSILON {
                    let side = if position.size > 0.0 { Side::Sell } else { Side::Buy };
                    Some((excess, side))
                } else {
                    None
                }
            })
        };

        let Some((excess, side)) = reduction else {
            return;
        };

        // Bypasses the halt gate on purpose: this is the risk reduction path
        match self
            .with_timeout(
                "place_market_order",
                self.inner
                    .port
                    .place_market_order(instrument, side, excess, Uuid::new_v4()),
            )
            .await
        {
            Ok(fill) => {
                tracing::warn!(
                    instrument = %instrument,
                    size = excess,
                    price = fill.price,
                    "emergency position reduction executed"
                );
                let mut order = Order::new(
                    fill.order_id.clone(),
                    Uuid::new_v4(),
                    instrument.to_string(),
                    side,
                    OrderType::Market,
                    excess,
                    None,
                    TimeInForce::Gtc,
                );
                order.filled_size = fill.size;
                order.remaining_size = 0.0;
                order.average_fill_price = fill.price;
                {
                    let mut orders = self.inner.orders.lock().unwrap();
                    orders.insert_submitted(order, OrderStatus::Filled);
                }
                self.record_ledger_fill(instrument, side, fill.size, fill.price, fill.fees, &fill.order_id);
            }
            Err(e) => {
                tracing::error!(instrument = %instrument, error = %e, "emergency reduction failed");
                self.emit(EngineEvent::MonitorError {
                    scope: format!("emergency-reduce:{}", instrument),
                    message: e.to_string(),
                    timestamp: Utc::now(),
                });
            }
        }
    }

    /// Mark one position and enforce thresholds on the result. Shared by
    /// the per-position monitors and the backtest loop.
    pub async fn mark_and_enforce(&self, instrument: &str, price: f64) -> Option<Position> {
        let position = {
            let mut ledger = self.inner.ledger.lock().unwrap();
            ledger.mark(instrument, price)
        }?;

        self.emit(EngineEvent::PositionMarked {
            instrument: instrument.to_string(),
            price,
            unrealized_pnl: position.unrealized_pnl,
            timestamp: Utc::now(),
        });

        let breach = {
            let daily = self.inner.daily.lock().unwrap();
            let thresholds = self.inner.thresholds.read().unwrap();
            check_thresholds(&position, &daily, &thresholds).err()
        };

        if let Some(breach) = breach {
            let reason = breach.to_string();
            self.emit(EngineEvent::RiskBreached {
                instrument: instrument.to_string(),
                reason: reason.clone(),
                timestamp: Utc::now(),
            });
            self.halt_trading(&reason).await;
            self.emergency_reduce_position(instrument).await;
        }

        Some(position)
    }

    // ------------------------------------------------------------------
    // Monitoring lifecycle
    // ------------------------------------------------------------------

    /// Spawn one monitoring task per open position. New positions opened
    /// while monitoring is active get their own task automatically.
    pub fn start_position_monitoring(&self) {
        self.inner.monitoring_active.store(true, Ordering::SeqCst);
        let instruments = {
            let ledger = self.inner.ledger.lock().unwrap();
            ledger.open_instruments()
        };
        for instrument in instruments {
            self.spawn_position_monitor(&instrument);
        }
    }

    /// Cancel every per-position task and wait for each to exit
    pub async fn stop_position_monitoring(&self) {
        self.inner.monitoring_active.store(false, Ordering::SeqCst);
        let handles: Vec<MonitorHandle> = {
            let mut monitors = self.inner.position_monitors.lock().unwrap();
            monitors.drain().map(|(_, handle)| handle).collect()
        };
        for monitor in handles {
            let _ = monitor.stop.send(true);
            let _ = monitor.handle.await;
        }
    }

    /// Stop every per-position and per-bracket task, awaiting their exit.
    /// Nothing mutates engine state through a monitor after this returns.
    pub async fn stop_all_monitoring(&self) {
        self.stop_position_monitoring().await;
        let handles: Vec<MonitorHandle> = {
            let mut monitors = self.inner.bracket_monitors.lock().unwrap();
            monitors.drain().map(|(_, handle)| handle).collect()
        };
        for monitor in handles {
            let _ = monitor.stop.send(true);
            let _ = monitor.handle.await;
        }
    }

    pub(crate) fn spawn_position_monitor(&self, instrument: &str) {
        let mut monitors = self.inner.position_monitors.lock().unwrap();
        if let Some(existing) = monitors.get(instrument) {
            if !existing.handle.is_finished() {
                return;
            }
        }
        let (stop_tx, stop_rx) = watch::channel(false);
        let handle = monitor::spawn(self.clone(), instrument.to_string(), stop_rx);
        monitors.insert(
            instrument.to_string(),
            MonitorHandle {
                stop: stop_tx,
                handle,
            },
        );
    }

    pub(crate) fn register_bracket_monitor(&self, group: &BracketGroup) {
        let (stop_tx, stop_rx) = watch::channel(false);
        let handle = bracket::spawn(self.clone(), group.clone(), stop_rx);
        self.inner.bracket_monitors.lock().unwrap().insert(
            group.id,
            MonitorHandle {
                stop: stop_tx,
                handle,
            },
        );
    }

    /// Stop a single bracket's monitor without touching the others
    pub(crate) async fn stop_bracket_monitor(&self, group_id: Uuid) {
        let handle = {
            let mut monitors = self.inner.bracket_monitors.lock().unwrap();
            monitors.remove(&group_id)
        };
        if let Some(monitor) = handle {
            let _ = monitor.stop.send(true);
            let _ = monitor.handle.await;
        }
    }

    // ------------------------------------------------------------------
    // Fill reconciliation
    // ------------------------------------------------------------------

    /// Poll the port for an order's state and fold any new fills into the
    /// store and the ledger. Returns the updated local order.
    pub async fn reconcile_order(&self, order_id: &str) -> Result<Order, EngineError> {
        let existing = {
            let orders = self.inner.orders.lock().unwrap();
            orders.get(order_id)
        };
        let existing = existing
            .ok_or_else(|| EngineError::State(format!("unknown order {}", order_id)))?;
        if existing.is_terminal() {
            return Ok(existing);
        }

        let snapshot = self.port_status(order_id).await?;
        self.fold_snapshot(&existing, &snapshot)
    }

    fn fold_snapshot(
        &self,
        existing: &Order,
        snapshot: &OrderSnapshot,
    ) -> Result<Order, EngineError> {
        let mut current = existing.clone();
        let delta = snapshot.filled_size - existing.filled_size;

        if delta > SIZE_EPSILON {
            // Price of just the new slice, backed out of the averages
            let delta_price = {
                let implied = (snapshot.average_fill_price * snapshot.filled_size
                    - existing.average_fill_price * existing.filled_size)
                    / delta;
                if implied.is_finite() && implied > 0.0 {
                    implied
                } else {
                    snapshot.average_fill_price
                }
            };
            let fees = delta * delta_price * self.inner.config.fee_rate;

            current = {
                let mut orders = self.inner.orders.lock().unwrap();
                orders.apply_fill(&existing.id, delta, delta_price, Utc::now())?
            };
            self.emit(EngineEvent::OrderFilled {
                instrument: current.instrument.clone(),
                order_id: current.id.clone(),
                fill_size: delta,
                fill_price: delta_price,
                filled_total: current.filled_size,
                remaining: current.remaining_size,
                partial: current.status != OrderStatus::Filled,
                timestamp: Utc::now(),
            });
            self.record_ledger_fill(
                &current.instrument.clone(),
                current.side,
                delta,
                delta_price,
                fees,
                &current.id.clone(),
            );
        }

        if !current.is_terminal() {
            match snapshot.status {
                OrderStatus::Cancelled => {
                    current = {
                        let mut orders = self.inner.orders.lock().unwrap();
                        orders.mark_cancelled(&existing.id)?
                    };
                    self.emit(EngineEvent::OrderCancelled {
                        instrument: current.instrument.clone(),
                        order_id: current.id.clone(),
                        timestamp: Utc::now(),
                    });
                }
                OrderStatus::Expired => {
                    current = {
                        let mut orders = self.inner.orders.lock().unwrap();
                        orders.mark_expired(&existing.id)?
                    };
                }
                _ => {}
            }
        }

        Ok(current)
    }

    /// Reconcile every live order for an instrument (backtest loop path)
    pub async fn reconcile_open_orders(&self, instrument: &str) -> Result<(), EngineError> {
        let order_ids: Vec<String> = {
            let orders = self.inner.orders.lock().unwrap();
            orders
                .live_orders()
                .into_iter()
                .filter(|o| o.instrument == instrument)
                .map(|o| o.id)
                .collect()
        };
        for order_id in order_ids {
            self.reconcile_order(&order_id).await?;
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------

    fn pre_trade_checks(
        &self,
        instrument: &str,
        side: Side,
        size: f64,
        order_type: OrderType,
        limit_price: Option<f64>,
    ) -> Result<(), EngineError> {
        OrderStore::validate_request(order_type, size, limit_price)?;
        self.ensure_trading_enabled()?;

        // One net position per instrument: an opposite-side order may
        // reduce or close, never flip through zero
        let position = self.inner.ledger.lock().unwrap().get(instrument);
        if let Some(position) = position {
            let order_sign = side.sign();
            if position.size.signum() != order_sign && size > position.abs_size() + SIZE_EPSILON {
                return Err(EngineError::Validation(format!(
                    "order of {} would flip the open {} position of {}",
                    size, instrument, position.abs_size()
                )));
            }
        }
        Ok(())
    }

    fn increases_exposure(&self, instrument: &str, side: Side) -> bool {
        match self.inner.ledger.lock().unwrap().get(instrument) {
            Some(position) => position.size.signum() == side.sign(),
            None => true,
        }
    }

    async fn check_funds(&self, instrument: &str, notional: f64) -> Result<(), EngineError> {
        let balances = self
            .with_timeout("get_balances", self.inner.port.get_balances())
            .await?;
        let available = balances
            .get(&self.inner.config.cash_currency)
            .copied()
            .unwrap_or(0.0);
        let max_leverage = self.inner.thresholds.read().unwrap().max_leverage;

        if notional > available * max_leverage {
            tracing::debug!(
                instrument = %instrument,
                notional,
                available,
                "rejecting order for insufficient funds"
            );
            return Err(EngineError::InsufficientFunds {
                required: notional,
                available: available * max_leverage,
            });
        }
        Ok(())
    }

    fn reject_without_port(
        &self,
        instrument: &str,
        side: Side,
        size: f64,
        error: EngineError,
    ) -> ExecutionReport {
        self.emit(EngineEvent::OrderRejected {
            instrument: instrument.to_string(),
            side,
            size,
            reason: error.to_string(),
            timestamp: Utc::now(),
        });
        ExecutionReport::failed(instrument, side, size, error)
    }

    #[allow(clippy::too_many_arguments)]
    fn reject_after_port(
        &self,
        instrument: &str,
        side: Side,
        size: f64,
        client_order_id: Uuid,
        order_type: OrderType,
        limit_price: Option<f64>,
        error: PortError,
    ) -> ExecutionReport {
        // The port returned no usable order id: archive the attempt as
        // rejected so it is never silently dropped
        let order = Order::new(
            format!("REJ-{}", client_order_id),
            client_order_id,
            instrument.to_string(),
            side,
            order_type,
            size,
            limit_price,
            TimeInForce::Gtc,
        );
        {
            let mut orders = self.inner.orders.lock().unwrap();
            orders.record_rejected(order);
        }
        self.emit(EngineEvent::OrderRejected {
            instrument: instrument.to_string(),
            side,
            size,
            reason: error.to_string(),
            timestamp: Utc::now(),
        });
        ExecutionReport::failed(instrument, side, size, EngineError::Port(error))
    }

    /// Fold one fill into the position ledger and derived state
    fn record_ledger_fill(
        &self,
        instrument: &str,
        side: Side,
        size: f64,
        price: f64,
        fees: f64,
        order_id: &str,
    ) {
        let update = {
            let mut ledger = self.inner.ledger.lock().unwrap();
            ledger.on_fill(instrument, side, size, price, fees, order_id, Utc::now())
        };

        match update {
            Ok(PositionUpdate::Opened {
                instrument,
                size,
                entry_price,
            }) => {
                self.emit(EngineEvent::PositionOpened {
                    instrument: instrument.clone(),
                    size,
                    entry_price,
                    timestamp: Utc::now(),
                });
                if self.inner.monitoring_active.load(Ordering::SeqCst) {
                    self.spawn_position_monitor(&instrument);
                }
            }
            Ok(PositionUpdate::Increased {
                instrument,
                size,
                entry_price,
            }) => {
                self.emit(EngineEvent::PositionAdjusted {
                    instrument,
                    size,
                    entry_price,
                    realized_pnl_delta: 0.0,
                    timestamp: Utc::now(),
                });
            }
            Ok(PositionUpdate::Reduced {
                instrument,
                remaining,
                realized_delta,
            }) => {
                self.inner
                    .daily
                    .lock()
                    .unwrap()
                    .record_trade_close(realized_delta);
                self.emit(EngineEvent::PositionAdjusted {
                    instrument,
                    size: remaining,
                    entry_price: price,
                    realized_pnl_delta: realized_delta,
                    timestamp: Utc::now(),
                });
            }
            Ok(PositionUpdate::Closed {
                instrument,
                realized_delta,
                realized_total,
                total_fees,
            }) => {
                self.inner
                    .daily
                    .lock()
                    .unwrap()
                    .record_trade_close(realized_delta);
                self.emit(EngineEvent::PositionClosed {
                    instrument,
                    realized_pnl: realized_total,
                    fees: total_fees,
                    timestamp: Utc::now(),
                });
            }
            Err(e) => {
                // Pre-trade validation should make this unreachable; if the
                // venue still over-fills, keep the books and scream
                tracing::error!(
                    instrument = %instrument,
                    order_id = %order_id,
                    error = %e,
                    "ledger rejected a fill"
                );
                self.emit(EngineEvent::MonitorError {
                    scope: format!("ledger:{}", instrument),
                    message: e.to_string(),
                    timestamp: Utc::now(),
                });
            }
        }
    }

    /// Bound any single port call; a timed-out call is a transient port
    /// failure, never an automatic order-state transition
    pub(crate) async fn with_timeout<T, Fut>(&self, what: &str, fut: Fut) -> Result<T, PortError>
    where
        Fut: std::future::Future<Output = Result<T, PortError>>,
    {
        match tokio::time::timeout(self.inner.config.port_timeout(), fut).await {
            Ok(result) => result,
            Err(_) => Err(PortError::Timeout(what.to_string())),
        }
    }

    /// Price poll with timeout + transient retry, for monitoring paths only
    pub(crate) async fn port_price(&self, instrument: &str) -> Result<f64, PortError> {
        self.inner
            .retry
            .run(|| {
                self.with_timeout(
                    "get_current_price",
                    self.inner.port.get_current_price(instrument),
                )
            })
            .await
    }

    /// Status poll with timeout + transient retry, for monitoring paths only
    pub(crate) async fn port_status(&self, order_id: &str) -> Result<OrderSnapshot, PortError> {
        self.inner
            .retry
            .run(|| self.with_timeout("get_order_status", self.inner.port.get_order_status(order_id)))
            .await
    }
}
