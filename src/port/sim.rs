use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::{Distribution, Normal};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::{ExecutionPort, MarketFill, OrderSnapshot, PortError};
use crate::models::{Candle, OrderStatus, Side, TimeInForce, SIZE_EPSILON};

/// Simulation parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimConfig {
    pub initial_cash: f64,
    pub cash_currency: String,
    pub fee_rate: f64,
    /// Std dev of the normal slippage applied to market fills
    pub slippage_std_dev: f64,
    /// Chance an eligible resting limit order fills on a given check
    pub fill_probability: f64,
    /// Fraction of the remaining size filled per eligible check; 1.0 = full fill
    pub partial_fill_ratio: f64,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            initial_cash: 10_000.0,
            cash_currency: "USD".to_string(),
            fee_rate: 0.001,
            slippage_std_dev: 0.0005,
            fill_probability: 1.0,
            partial_fill_ratio: 1.0,
        }
    }
}

#[derive(Debug, Clone)]
struct SimOrder {
    instrument: String,
    side: Side,
    size: f64,
    price: f64,
    /// Whether the limit sits above the mark it was placed against. An
    /// order only triggers when price crosses it from that side, which
    /// gives a protective stop below market stop semantics and a target
    /// above market plain limit semantics.
    trigger_above: bool,
    filled_size: f64,
    average_fill_price: f64,
    status: OrderStatus,
}

struct SimState {
    cash: f64,
    inventory: HashMap<String, f64>,
    prices: HashMap<String, f64>,
    series: HashMap<String, Vec<Candle>>,
    cursor: usize,
    orders: HashMap<String, SimOrder>,
    rng: StdRng,
    next_id: u64,
}

/// Deterministic execution backend.
///
/// Fills market orders at the current mark plus sampled slippage, rests
/// limit orders until the simulated price crosses them, and tracks cash
/// and inventory so a whole session can be replayed from a seed.
pub struct SimulationPort {
    config: SimConfig,
    slippage_std: f64,
    state: Mutex<SimState>,
}

impl SimulationPort {
    pub fn new(config: SimConfig, seed: u64) -> Self {
        let slippage_std = if config.slippage_std_dev.is_finite() {
            config.slippage_std_dev.abs()
        } else {
            0.0
        };
        let state = SimState {
            cash: config.initial_cash,
            inventory: HashMap::new(),
            prices: HashMap::new(),
            series: HashMap::new(),
            cursor: 0,
            orders: HashMap::new(),
            rng: StdRng::seed_from_u64(seed),
            next_id: 0,
        };
        Self {
            config,
            slippage_std,
            state: Mutex::new(state),
        }
    }

    pub fn config(&self) -> &SimConfig {
        &self.config
    }

    /// Load an OHLCV series for an instrument. The price is positioned at
    /// the first bar; `advance` walks forward from there.
    pub fn load_series(&self, instrument: &str, candles: Vec<Candle>) {
        let mut state = self.state.lock().unwrap();
        if let Some(first) = candles.first() {
            state.prices.insert(instrument.to_string(), first.close);
        }
        state.series.insert(instrument.to_string(), candles);
        state.cursor = 0;
    }

    /// Advance every loaded series one bar, updating marks and re-checking
    /// resting limit orders against the new bar's range. Returns the
    /// timestamp of the new bar, or None once every series is exhausted.
    pub fn advance(&self) -> Option<DateTime<Utc>> {
        let mut state = self.state.lock().unwrap();
        state.cursor += 1;
        let cursor = state.cursor;

        let mut timestamp = None;
        let bars: Vec<(String, Candle)> = state
            .series
            .iter()
            .filter_map(|(instrument, candles)| {
                candles
                    .get(cursor)
                    .map(|bar| (instrument.clone(), bar.clone()))
            })
            .collect();

        if bars.is_empty() {
            return None;
        }

        for (instrument, bar) in bars {
            state.prices.insert(instrument.clone(), bar.close);
            timestamp = Some(bar.timestamp);
            Self::check_limit_orders(&mut state, &self.config, &instrument, bar.low, bar.high);
        }
        timestamp
    }

    /// Inject a mark directly (dry-run mode and tests), re-checking limit
    /// orders against the new price.
    pub fn set_price(&self, instrument: &str, price: f64) {
        let mut state = self.state.lock().unwrap();
        state.prices.insert(instrument.to_string(), price);
        Self::check_limit_orders(&mut state, &self.config, instrument, price, price);
    }

    pub fn cash(&self) -> f64 {
        self.state.lock().unwrap().cash
    }

    pub fn inventory(&self, instrument: &str) -> f64 {
        self.state
            .lock()
            .unwrap()
            .inventory
            .get(instrument)
            .copied()
            .unwrap_or(0.0)
    }

    fn sample_slippage(&self, rng: &mut StdRng) -> f64 {
        if self.slippage_std > 0.0 {
            Normal::new(0.0, self.slippage_std)
                .map(|dist| dist.sample(rng))
                .unwrap_or(0.0)
        } else {
            0.0
        }
    }

    fn next_order_id(state: &mut SimState) -> String {
        state.next_id += 1;
        format!("SIM-{}", state.next_id)
    }

    /// Apply a fill's cash and inventory effects
    fn settle(state: &mut SimState, config: &SimConfig, instrument: &str, side: Side, size: f64, price: f64) -> f64 {
        let notional = size * price;
        let fees = notional * config.fee_rate;
        match side {
            Side::Buy => state.cash -= notional + fees,
            Side::Sell => state.cash += notional - fees,
        }
        *state.inventory.entry(instrument.to_string()).or_insert(0.0) += size * side.sign();
        fees
    }

    /// Walk resting limit orders for one instrument against a price range.
    /// An order fills when the range reaches its limit from the side the
    /// order was resting on.
    fn check_limit_orders(
        state: &mut SimState,
        config: &SimConfig,
        instrument: &str,
        low: f64,
        high: f64,
    ) {
        let eligible: Vec<String> = state
            .orders
            .iter()
            .filter(|(_, order)| {
                order.instrument == instrument
                    && matches!(
                        order.status,
                        OrderStatus::Open | OrderStatus::PartiallyFilled
                    )
                    && if order.trigger_above {
                        high >= order.price
                    } else {
                        low <= order.price
                    }
            })
            .map(|(id, _)| id.clone())
            .collect();

        for id in eligible {
            let roll: f64 = state.rng.gen();
            if roll >= config.fill_probability {
                continue;
            }

            let order = match state.orders.get(&id) {
                Some(o) => o.clone(),
                None => continue,
            };
            let remaining = order.size - order.filled_size;
            let ratio = config.partial_fill_ratio.clamp(0.0, 1.0);
            let mut fill_size = remaining * ratio;
            if fill_size <= SIZE_EPSILON || remaining - fill_size <= SIZE_EPSILON {
                fill_size = remaining;
            }

            Self::settle(state, config, instrument, order.side, fill_size, order.price);

            if let Some(order) = state.orders.get_mut(&id) {
                let filled = order.filled_size + fill_size;
                order.average_fill_price = (order.average_fill_price * order.filled_size
                    + order.price * fill_size)
                    / filled;
                order.filled_size = filled;
                order.status = if order.size - filled <= SIZE_EPSILON {
                    OrderStatus::Filled
                } else {
                    OrderStatus::PartiallyFilled
                };
            }
        }
    }
}

#[async_trait]
impl ExecutionPort for SimulationPort {
    async fn place_market_order(
        &self,
        instrument: &str,
        side: Side,
        size: f64,
        _client_order_id: Uuid,
    ) -> Result<MarketFill, PortError> {
        let mut state = self.state.lock().unwrap();

        let mark = state
            .prices
            .get(instrument)
            .copied()
            .ok_or_else(|| PortError::Venue(format!("no price loaded for {}", instrument)))?;

        let slippage = self.sample_slippage(&mut state.rng);
        let price = mark * (1.0 + slippage);
        let fees = Self::settle(&mut state, &self.config, instrument, side, size, price);

        let order_id = Self::next_order_id(&mut state);
        state.orders.insert(
            order_id.clone(),
            SimOrder {
                instrument: instrument.to_string(),
                side,
                size,
                price,
                trigger_above: false,
                filled_size: size,
                average_fill_price: price,
                status: OrderStatus::Filled,
            },
        );

        Ok(MarketFill {
            order_id,
            price,
            size,
            fees,
        })
    }

    async fn place_limit_order(
        &self,
        instrument: &str,
        side: Side,
        size: f64,
        price: f64,
        _client_order_id: Uuid,
        time_in_force: TimeInForce,
    ) -> Result<String, PortError> {
        let mut state = self.state.lock().unwrap();

        if !state.prices.contains_key(instrument) {
            return Err(PortError::Venue(format!(
                "no price loaded for {}",
                instrument
            )));
        }

        let mark = state.prices[instrument];
        let order_id = Self::next_order_id(&mut state);
        state.orders.insert(
            order_id.clone(),
            SimOrder {
                instrument: instrument.to_string(),
                side,
                size,
                price,
                trigger_above: price > mark,
                filled_size: 0.0,
                average_fill_price: 0.0,
                status: OrderStatus::Open,
            },
        );

        Self::check_limit_orders(&mut state, &self.config, instrument, mark, mark);

        if time_in_force == TimeInForce::Ioc {
            if let Some(order) = state.orders.get_mut(&order_id) {
                if order.status == OrderStatus::Open {
                    order.status = OrderStatus::Expired;
                }
            }
        }

        Ok(order_id)
    }

    async fn cancel_order(&self, order_id: &str) -> Result<(), PortError> {
        let mut state = self.state.lock().unwrap();
        let order = state
            .orders
            .get_mut(order_id)
            .ok_or_else(|| PortError::UnknownOrder(order_id.to_string()))?;

        if order.status.is_terminal() {
            return Err(PortError::Venue(format!(
                "order {} already {}",
                order_id, order.status
            )));
        }
        order.status = OrderStatus::Cancelled;
        Ok(())
    }

    async fn get_order_status(&self, order_id: &str) -> Result<OrderSnapshot, PortError> {
        let state = self.state.lock().unwrap();
        let order = state
            .orders
            .get(order_id)
            .ok_or_else(|| PortError::UnknownOrder(order_id.to_string()))?;

        Ok(OrderSnapshot {
            status: order.status,
            filled_size: order.filled_size,
            average_fill_price: order.average_fill_price,
        })
    }

    async fn get_current_price(&self, instrument: &str) -> Result<f64, PortError> {
        let state = self.state.lock().unwrap();
        state
            .prices
            .get(instrument)
            .copied()
            .ok_or_else(|| PortError::Venue(format!("no price loaded for {}", instrument)))
    }

    async fn get_balances(&self) -> Result<HashMap<String, f64>, PortError> {
        let state = self.state.lock().unwrap();
        let mut balances = HashMap::new();
        balances.insert(self.config.cash_currency.clone(), state.cash);
        for (instrument, quantity) in &state.inventory {
            balances.insert(instrument.clone(), *quantity);
        }
        Ok(balances)
    }
}
