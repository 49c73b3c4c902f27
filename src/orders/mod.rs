use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::errors::EngineError;
use crate::models::{Order, OrderStatus, OrderType, StateTransition, SIZE_EPSILON};

/// Filter for historical order queries
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OrderHistoryFilter {
    pub instrument: Option<String>,
    pub status: Option<OrderStatus>,
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
}

/// Owns every order's lifecycle. Orders enter through `insert_submitted`
/// (or `record_rejected` when the port refused them), mutate only through
/// `apply_fill`/`mark_cancelled`, and on reaching a terminal state move
/// from the live index into the per-instrument history. Nothing is ever
/// deleted.
#[derive(Default)]
pub struct OrderStore {
    live: HashMap<String, Order>,
    history: HashMap<String, Vec<Order>>,
}

impl OrderStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Validate a request before it is allowed anywhere near a port
    pub fn validate_request(
        order_type: OrderType,
        size: f64,
        limit_price: Option<f64>,
    ) -> Result<(), EngineError> {
        if !size.is_finite() || size <= 0.0 {
            return Err(EngineError::Validation(format!(
                "order size must be positive, got {}",
                size
            )));
        }
        if order_type == OrderType::Limit {
            match limit_price {
                Some(price) if price.is_finite() && price > 0.0 => {}
                other => {
                    return Err(EngineError::Validation(format!(
                        "limit orders require a positive price, got {:?}",
                        other
                    )));
                }
            }
        }
        Ok(())
    }

    /// Store an order the port has accepted. `status` is Open for resting
    /// orders; an immediately-filled market order passes Filled and gets a
    /// single PENDING -> FILLED transition.
    pub fn insert_submitted(&mut self, mut order: Order, status: OrderStatus) {
        let now = Utc::now();
        order.transitions.push(StateTransition {
            from: order.status,
            to: status,
            timestamp: now,
            filled_size: order.filled_size,
            remaining_size: order.remaining_size,
        });
        order.status = status;
        order.updated_at = now;

        if order.is_terminal() {
            self.archive(order);
        } else {
            self.live.insert(order.id.clone(), order);
        }
    }

    /// Archive an order the port refused. The order is recorded, never
    /// silently dropped.
    pub fn record_rejected(&mut self, mut order: Order) {
        let now = Utc::now();
        order.transitions.push(StateTransition {
            from: order.status,
            to: OrderStatus::Rejected,
            timestamp: now,
            filled_size: order.filled_size,
            remaining_size: order.remaining_size,
        });
        order.status = OrderStatus::Rejected;
        order.updated_at = now;
        self.archive(order);
    }

    /// Apply an incremental fill, advancing the state machine. Returns a
    /// snapshot of the order after the update.
    pub fn apply_fill(
        &mut self,
        order_id: &str,
        filled_delta: f64,
        fill_price: f64,
        timestamp: DateTime<Utc>,
    ) -> Result<Order, EngineError> {
        let order = self
            .live
            .get_mut(order_id)
            .ok_or_else(|| EngineError::State(format!("no live order {}", order_id)))?;

        if order.is_terminal() {
            return Err(EngineError::State(format!(
                "order {} is already {}",
                order_id, order.status
            )));
        }
        if filled_delta <= 0.0 {
            return Err(EngineError::Validation(format!(
                "fill delta must be positive, got {}",
                filled_delta
            )));
        }

        let new_filled = order.filled_size + filled_delta;
        order.average_fill_price = (order.average_fill_price * order.filled_size
            + fill_price * filled_delta)
            / new_filled;
        order.filled_size = new_filled;
        order.remaining_size = (order.requested_size - new_filled).max(0.0);

        let next = if order.remaining_size <= SIZE_EPSILON {
            order.remaining_size = 0.0;
            order.filled_size = order.requested_size;
            OrderStatus::Filled
        } else {
            OrderStatus::PartiallyFilled
        };

        order.transitions.push(StateTransition {
            from: order.status,
            to: next,
            timestamp,
            filled_size: order.filled_size,
            remaining_size: order.remaining_size,
        });
        order.status = next;
        order.updated_at = timestamp;

        let snapshot = order.clone();
        if snapshot.is_terminal() {
            if let Some(order) = self.live.remove(order_id) {
                self.archive(order);
            }
        }
        Ok(snapshot)
    }

    /// Record a cancellation confirmed by the port. Only legal from
    /// Pending, Open or PartiallyFilled.
    pub fn mark_cancelled(&mut self, order_id: &str) -> Result<Order, EngineError> {
        let order = self
            .live
            .get_mut(order_id)
            .ok_or_else(|| EngineError::State(format!("no live order {}", order_id)))?;

        if !order.is_cancellable() {
            return Err(EngineError::State(format!(
                "cannot cancel order {} in state {}",
                order_id, order.status
            )));
        }

        let now = Utc::now();
        order.transitions.push(StateTransition {
            from: order.status,
            to: OrderStatus::Cancelled,
            timestamp: now,
            filled_size: order.filled_size,
            remaining_size: order.remaining_size,
        });
        order.status = OrderStatus::Cancelled;
        order.updated_at = now;

        let snapshot = order.clone();
        if let Some(order) = self.live.remove(order_id) {
            self.archive(order);
        }
        Ok(snapshot)
    }

    /// Same transition for orders the venue reports as expired
    pub fn mark_expired(&mut self, order_id: &str) -> Result<Order, EngineError> {
        let order = self
            .live
            .get_mut(order_id)
            .ok_or_else(|| EngineError::State(format!("no live order {}", order_id)))?;

        let now = Utc::now();
        order.transitions.push(StateTransition {
            from: order.status,
            to: OrderStatus::Expired,
            timestamp: now,
            filled_size: order.filled_size,
            remaining_size: order.remaining_size,
        });
        order.status = OrderStatus::Expired;
        order.updated_at = now;

        let snapshot = order.clone();
        if let Some(order) = self.live.remove(order_id) {
            self.archive(order);
        }
        Ok(snapshot)
    }

    pub fn get(&self, order_id: &str) -> Option<Order> {
        if let Some(order) = self.live.get(order_id) {
            return Some(order.clone());
        }
        self.history
            .values()
            .flatten()
            .find(|o| o.id == order_id)
            .cloned()
    }

    pub fn live_orders(&self) -> Vec<Order> {
        self.live.values().cloned().collect()
    }

    pub fn live_order_ids(&self) -> Vec<String> {
        self.live.keys().cloned().collect()
    }

    /// Range query over the archived history
    pub fn history(&self, filter: &OrderHistoryFilter) -> Vec<Order> {
        let mut orders: Vec<Order> = self
            .history
            .iter()
            .filter(|(instrument, _)| match &filter.instrument {
                Some(wanted) => *instrument == wanted,
                None => true,
            })
            .flat_map(|(_, orders)| orders.iter())
            .filter(|order| match filter.status {
                Some(status) => order.status == status,
                None => true,
            })
            .filter(|order| match filter.from {
                Some(from) => order.created_at >= from,
                None => true,
            })
            .filter(|order| match filter.to {
                Some(to) => order.created_at <= to,
                None => true,
            })
            .cloned()
            .collect();
        orders.sort_by_key(|o| o.created_at);
        orders
    }

    fn archive(&mut self, order: Order) {
        self.history
            .entry(order.instrument.clone())
            .or_default()
            .push(order);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Side, TimeInForce};
    use uuid::Uuid;

    fn limit_order(id: &str, size: f64, price: f64) -> Order {
        Order::new(
            id.to_string(),
            Uuid::new_v4(),
            "BTC-USD".to_string(),
            Side::Buy,
            OrderType::Limit,
            size,
            Some(price),
            TimeInForce::Gtc,
        )
    }

    #[test]
    fn test_validate_request() {
        assert!(OrderStore::validate_request(OrderType::Market, 1.0, None).is_ok());
        assert!(OrderStore::validate_request(OrderType::Market, 0.0, None).is_err());
        assert!(OrderStore::validate_request(OrderType::Market, -2.0, None).is_err());
        assert!(OrderStore::validate_request(OrderType::Limit, 1.0, Some(10.0)).is_ok());
        assert!(OrderStore::validate_request(OrderType::Limit, 1.0, None).is_err());
        assert!(OrderStore::validate_request(OrderType::Limit, 1.0, Some(0.0)).is_err());
    }

    #[test]
    fn test_fill_conserves_requested_size() {
        let mut store = OrderStore::new();
        store.insert_submitted(limit_order("L-1", 3.0, 100.0), OrderStatus::Open);

        let order = store.apply_fill("L-1", 1.0, 100.0, Utc::now()).unwrap();
        assert_eq!(order.status, OrderStatus::PartiallyFilled);
        assert!((order.filled_size + order.remaining_size - order.requested_size).abs() < 1e-12);

        let order = store.apply_fill("L-1", 1.5, 99.0, Utc::now()).unwrap();
        assert_eq!(order.status, OrderStatus::PartiallyFilled);
        assert!((order.filled_size + order.remaining_size - order.requested_size).abs() < 1e-12);

        let order = store.apply_fill("L-1", 0.5, 98.0, Utc::now()).unwrap();
        assert_eq!(order.status, OrderStatus::Filled);
        assert_eq!(order.remaining_size, 0.0);
    }

    #[test]
    fn test_volume_weighted_average_price() {
        let mut store = OrderStore::new();
        store.insert_submitted(limit_order("L-1", 3.0, 100.0), OrderStatus::Open);

        store.apply_fill("L-1", 1.0, 100.0, Utc::now()).unwrap();
        store.apply_fill("L-1", 2.0, 103.0, Utc::now()).unwrap();

        let order = store.get("L-1").unwrap();
        // (1*100 + 2*103) / 3 = 102
        assert!((order.average_fill_price - 102.0).abs() < 1e-9);
    }

    #[test]
    fn test_epsilon_residue_completes_fill() {
        let mut store = OrderStore::new();
        store.insert_submitted(limit_order("L-1", 1.0, 100.0), OrderStatus::Open);

        store.apply_fill("L-1", 0.3, 100.0, Utc::now()).unwrap();
        store.apply_fill("L-1", 0.3, 100.0, Utc::now()).unwrap();
        store.apply_fill("L-1", 0.3, 100.0, Utc::now()).unwrap();
        // 0.1 remaining, delta leaves ~1e-17 of float residue
        let order = store
            .apply_fill("L-1", 0.1 - 1e-12, 100.0, Utc::now())
            .unwrap();

        assert_eq!(order.status, OrderStatus::Filled);
        assert_eq!(order.remaining_size, 0.0);
        assert_eq!(order.filled_size, order.requested_size);
    }

    #[test]
    fn test_market_order_pending_to_filled_records_one_transition() {
        let mut store = OrderStore::new();
        let mut order = Order::new(
            "M-1".to_string(),
            Uuid::new_v4(),
            "BTC-USD".to_string(),
            Side::Buy,
            OrderType::Market,
            1.0,
            None,
            TimeInForce::Gtc,
        );
        order.filled_size = 1.0;
        order.remaining_size = 0.0;
        order.average_fill_price = 100.0;
        store.insert_submitted(order, OrderStatus::Filled);

        let order = store.get("M-1").unwrap();
        assert_eq!(order.status, OrderStatus::Filled);
        assert_eq!(order.transitions.len(), 1);
        assert_eq!(order.transitions[0].from, OrderStatus::Pending);
        assert_eq!(order.transitions[0].to, OrderStatus::Filled);
        assert!(store.live_orders().is_empty());
    }

    #[test]
    fn test_cancel_only_from_live_states() {
        let mut store = OrderStore::new();
        store.insert_submitted(limit_order("L-1", 1.0, 100.0), OrderStatus::Open);

        store.mark_cancelled("L-1").unwrap();
        let order = store.get("L-1").unwrap();
        assert_eq!(order.status, OrderStatus::Cancelled);

        // Already terminal and archived: cancelling again is a state error
        let result = store.mark_cancelled("L-1");
        assert!(matches!(result, Err(EngineError::State(_))));
    }

    #[test]
    fn test_no_transition_out_of_terminal() {
        let mut store = OrderStore::new();
        store.insert_submitted(limit_order("L-1", 1.0, 100.0), OrderStatus::Open);
        store.apply_fill("L-1", 1.0, 100.0, Utc::now()).unwrap();

        let result = store.apply_fill("L-1", 0.5, 100.0, Utc::now());
        assert!(matches!(result, Err(EngineError::State(_))));
    }

    #[test]
    fn test_rejected_order_is_archived() {
        let mut store = OrderStore::new();
        store.record_rejected(limit_order("L-1", 1.0, 100.0));

        let order = store.get("L-1").unwrap();
        assert_eq!(order.status, OrderStatus::Rejected);
        assert!(store.live_orders().is_empty());
    }

    #[test]
    fn test_history_filters() {
        let mut store = OrderStore::new();
        store.insert_submitted(limit_order("L-1", 1.0, 100.0), OrderStatus::Open);
        store.apply_fill("L-1", 1.0, 100.0, Utc::now()).unwrap();

        let mut other = limit_order("L-2", 1.0, 10.0);
        other.instrument = "ETH-USD".to_string();
        store.insert_submitted(other, OrderStatus::Open);
        store.mark_cancelled("L-2").unwrap();

        let all = store.history(&OrderHistoryFilter::default());
        assert_eq!(all.len(), 2);

        let btc_only = store.history(&OrderHistoryFilter {
            instrument: Some("BTC-USD".to_string()),
            ..Default::default()
        });
        assert_eq!(btc_only.len(), 1);
        assert_eq!(btc_only[0].id, "L-1");

        let filled_only = store.history(&OrderHistoryFilter {
            status: Some(OrderStatus::Filled),
            ..Default::default()
        });
        assert_eq!(filled_only.len(), 1);

        let future_only = store.history(&OrderHistoryFilter {
            from: Some(Utc::now() + chrono::Duration::hours(1)),
            ..Default::default()
        });
        assert!(future_only.is_empty());
    }
}
