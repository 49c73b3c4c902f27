use chrono::Utc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use uuid::Uuid;

use super::ExecutionEngine;
use crate::errors::EngineError;
use crate::events::EngineEvent;
use crate::models::{BracketGroup, Order, OrderStatus, OrderType, Side, TimeInForce};

/// Entry + stop-loss + take-profit, requested as one unit
#[derive(Debug, Clone)]
pub struct BracketRequest {
    pub instrument: String,
    pub side: Side,
    pub size: f64,
    pub stop_loss: f64,
    pub take_profit: f64,
    /// Required for limit entries, ignored for market entries
    pub entry_price: Option<f64>,
    pub entry_type: OrderType,
}

/// What happened to the bracket's placement. `success` means the entry is
/// live; a failed exit leg is surfaced in its error slot, not retried.
#[derive(Debug)]
pub struct BracketResult {
    pub success: bool,
    pub group: Option<BracketGroup>,
    pub entry: Option<Order>,
    pub stop_error: Option<String>,
    pub target_error: Option<String>,
    pub error: Option<EngineError>,
}

impl BracketResult {
    fn failed(error: EngineError) -> Self {
        Self {
            success: false,
            group: None,
            entry: None,
            stop_error: None,
            target_error: None,
            error: Some(error),
        }
    }
}

impl ExecutionEngine {
    /// Place a bracket: entry first, then both exits on the opposite side.
    /// Validation failures abort with zero orders placed; an entry failure
    /// aborts before any exit is placed.
    pub async fn execute_bracket_order(&self, request: BracketRequest) -> BracketResult {
        if let Err(e) = self.validate_bracket(&request).await {
            return BracketResult::failed(e);
        }

        let entry_report = match request.entry_type {
            OrderType::Market => {
                self.execute_market_order(&request.instrument, request.side, request.size)
                    .await
            }
            OrderType::Limit => {
                // validate_bracket guarantees the price is present
                let price = request.entry_price.unwrap_or(request.stop_loss);
                self.execute_limit_order(
                    &request.instrument,
                    request.side,
                    request.size,
                    price,
                    TimeInForce::Gtc,
                )
                .await
            }
        };

        let entry = match (entry_report.success, entry_report.order) {
            (true, Some(order)) => order,
            _ => {
                return BracketResult::failed(entry_report.error.unwrap_or_else(|| {
                    EngineError::State("entry placement returned no order".to_string())
                }));
            }
        };

        // Exits: opposite side, same size, at the protective prices. A leg
        // that fails to place leaves the bracket open; the caller decides
        // whether to cancel the whole group.
        let exit_side = request.side.opposite();
        let stop_result = self
            .place_exit_order(&request.instrument, exit_side, request.size, request.stop_loss)
            .await;
        let target_result = self
            .place_exit_order(
                &request.instrument,
                exit_side,
                request.size,
                request.take_profit,
            )
            .await;

        let (stop_id, stop_error) = match stop_result {
            Ok(id) => (Some(id), None),
            Err(e) => (None, Some(e.to_string())),
        };
        let (target_id, target_error) = match target_result {
            Ok(id) => (Some(id), None),
            Err(e) => (None, Some(e.to_string())),
        };

        let group = BracketGroup {
            id: Uuid::new_v4(),
            instrument: request.instrument.clone(),
            side: request.side,
            size: request.size,
            entry_id: entry.id.clone(),
            stop_id,
            target_id,
            created_at: Utc::now(),
        };

        self.inner
            .brackets
            .lock()
            .unwrap()
            .insert(group.id, group.clone());
        self.register_bracket_monitor(&group);

        BracketResult {
            success: true,
            group: Some(group),
            entry: Some(entry),
            stop_error,
            target_error,
            error: None,
        }
    }

    /// Tear down one bracket: stop its monitor, then cancel whatever legs
    /// are still live. Other brackets are untouched.
    pub async fn cancel_bracket(&self, group_id: Uuid) -> Result<(), EngineError> {
        let group = self
            .inner
            .brackets
            .lock()
            .unwrap()
            .get(&group_id)
            .cloned()
            .ok_or_else(|| EngineError::State(format!("unknown bracket {}", group_id)))?;

        self.stop_bracket_monitor(group_id).await;
        self.cancel_group_orders(&group).await;
        self.inner.brackets.lock().unwrap().remove(&group_id);
        Ok(())
    }

    async fn validate_bracket(&self, request: &BracketRequest) -> Result<(), EngineError> {
        if request.size <= 0.0 || !request.size.is_finite() {
            return Err(EngineError::Validation(format!(
                "bracket size must be positive, got {}",
                request.size
            )));
        }
        if request.stop_loss <= 0.0 || request.take_profit <= 0.0 {
            return Err(EngineError::Validation(
                "bracket exit prices must be positive".to_string(),
            ));
        }
        if request.entry_type == OrderType::Limit && request.entry_price.is_none() {
            return Err(EngineError::Validation(
                "limit entries require an entry price".to_string(),
            ));
        }
        self.ensure_trading_enabled()?;

        // Reference price: the limit price for limit entries, the current
        // mark for market entries
        let reference = match request.entry_type {
            OrderType::Limit => request.entry_price.unwrap_or(0.0),
            OrderType::Market => {
                self.with_timeout(
                    "get_current_price",
                    self.inner.port.get_current_price(&request.instrument),
                )
                .await?
            }
        };

        let ordered = match request.side {
            Side::Buy => request.stop_loss < reference && reference < request.take_profit,
            Side::Sell => request.take_profit < reference && reference < request.stop_loss,
        };
        if !ordered {
            return Err(EngineError::Validation(format!(
                "exit prices do not bracket the reference: stop {}, reference {}, target {} ({})",
                request.stop_loss, reference, request.take_profit, request.side
            )));
        }

        self.check_funds(&request.instrument, request.size * reference)
            .await
    }

    /// Place one protective exit leg. Skips the net-position and funds
    /// checks: the leg is sized exactly against the entry it protects.
    async fn place_exit_order(
        &self,
        instrument: &str,
        side: Side,
        size: f64,
        price: f64,
    ) -> Result<String, EngineError> {
        let client_order_id = Uuid::new_v4();
        let order_id = self
            .with_timeout(
                "place_limit_order",
                self.inner.port.place_limit_order(
                    instrument,
                    side,
                    size,
                    price,
                    client_order_id,
                    TimeInForce::Gtc,
                ),
            )
            .await?;

        let order = Order::new(
            order_id.clone(),
            client_order_id,
            instrument.to_string(),
            side,
            OrderType::Limit,
            size,
            Some(price),
            TimeInForce::Gtc,
        );
        {
            let mut orders = self.inner.orders.lock().unwrap();
            orders.insert_submitted(order, OrderStatus::Open);
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
        Ok(order_id)
    }

    /// Best-effort cancel of every live leg in a group
    pub(crate) async fn cancel_group_orders(&self, group: &BracketGroup) {
        let mut ids = vec![group.entry_id.clone()];
        ids.extend(group.stop_id.clone());
        ids.extend(group.target_id.clone());

        for order_id in ids {
            let live = self
                .get_order(&order_id)
                .map(|o| o.is_cancellable())
                .unwrap_or(false);
            if !live {
                continue;
            }
            if let Err(e) = self.cancel_order(&order_id).await {
                tracing::warn!(order_id = %order_id, error = %e, "bracket leg cancel failed");
            }
        }
    }

    /// Poll every registered bracket once, synchronously. Used by the
    /// backtest loop, which drives reconciliation itself instead of
    /// waiting on the spawned monitors.
    pub async fn reconcile_brackets(&self) -> Result<(), EngineError> {
        let groups: Vec<BracketGroup> = {
            let brackets = self.inner.brackets.lock().unwrap();
            brackets.values().cloned().collect()
        };
        for group in groups {
            if poll_group(self, &group).await? == BracketPoll::Resolved {
                self.inner.brackets.lock().unwrap().remove(&group.id);
            }
        }
        Ok(())
    }
}

#[derive(Debug, PartialEq, Eq)]
pub(crate) enum BracketPoll {
    Pending,
    Resolved,
}

/// One reconciliation pass over a bracket: fold entry fills in, and once
/// the entry is filled enforce one-cancels-other across the two exits.
pub(crate) async fn poll_group(
    engine: &ExecutionEngine,
    group: &BracketGroup,
) -> Result<BracketPoll, EngineError> {
    let entry = engine.reconcile_order(&group.entry_id).await?;

    match entry.status {
        OrderStatus::Cancelled | OrderStatus::Rejected | OrderStatus::Expired => {
            // Entry died before filling: the exits protect nothing,
            // take them down
            cancel_legs(engine, &[&group.stop_id, &group.target_id]).await;
            return Ok(BracketPoll::Resolved);
        }
        OrderStatus::Filled => {}
        _ => return Ok(BracketPoll::Pending),
    }

    // Entry is filled: watch the protective pair
    let stop_status = leg_status(engine, &group.stop_id).await?;
    let target_status = leg_status(engine, &group.target_id).await?;

    if stop_status == Some(OrderStatus::Filled) {
        cancel_legs(engine, &[&group.target_id]).await;
        return Ok(BracketPoll::Resolved);
    }
    if target_status == Some(OrderStatus::Filled) {
        cancel_legs(engine, &[&group.stop_id]).await;
        return Ok(BracketPoll::Resolved);
    }

    // Both exits gone without a fill (external cancel): nothing left to watch
    let stop_live = matches!(
        stop_status,
        Some(OrderStatus::Open) | Some(OrderStatus::PartiallyFilled)
    );
    let target_live = matches!(
        target_status,
        Some(OrderStatus::Open) | Some(OrderStatus::PartiallyFilled)
    );
    if !stop_live && !target_live {
        return Ok(BracketPoll::Resolved);
    }

    Ok(BracketPoll::Pending)
}

/// One long-lived task per open bracket. Polls the entry until it
/// resolves, then enforces one-cancels-other across the two exits.
pub(crate) fn spawn(
    engine: ExecutionEngine,
    group: BracketGroup,
    mut stop_rx: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(engine.config().order_poll_interval());
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = stop_rx.changed() => return,
                _ = ticker.tick() => {}
            }

            match poll_group(&engine, &group).await {
                Ok(BracketPoll::Pending) => continue,
                Ok(BracketPoll::Resolved) => {
                    engine.inner.brackets.lock().unwrap().remove(&group.id);
                    return;
                }
                Err(e) => {
                    abort_bracket(&engine, &group, &e.to_string()).await;
                    return;
                }
            }
        }
    })
}

/// Reconcile one optional leg, returning its current status
async fn leg_status(
    engine: &ExecutionEngine,
    leg: &Option<String>,
) -> Result<Option<OrderStatus>, EngineError> {
    match leg {
        Some(order_id) => {
            let order = engine.reconcile_order(order_id).await?;
            Ok(Some(order.status))
        }
        None => Ok(None),
    }
}

async fn cancel_legs(engine: &ExecutionEngine, legs: &[&Option<String>]) {
    for leg in legs {
        if let Some(order_id) = leg {
            let live = engine
                .get_order(order_id)
                .map(|o| o.is_cancellable())
                .unwrap_or(false);
            if !live {
                continue;
            }
            if let Err(e) = engine.cancel_order(order_id).await {
                tracing::warn!(order_id = %order_id, error = %e, "exit leg cancel failed");
            }
        }
    }
}

/// A poll failed hard: cancel all three legs so no stop or target is
/// left live and unwatched, then report the monitor's exit.
async fn abort_bracket(engine: &ExecutionEngine, group: &BracketGroup, message: &str) {
    engine.emit(EngineEvent::MonitorError {
        scope: format!("bracket:{}", group.id),
        message: message.to_string(),
        timestamp: Utc::now(),
    });
    engine.cancel_group_orders(group).await;
    engine.inner.brackets.lock().unwrap().remove(&group.id);
}
