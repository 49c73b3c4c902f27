use chrono::{DateTime, Duration, Utc};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::{Distribution, Normal};

use crate::models::Candle;

/// Market shapes for procedural price generation
#[derive(Debug, Clone, Copy)]
pub enum WalkScenario {
    /// Drifting walk; `daily_drift` of +0.02 is a +2% day
    Trend { daily_drift: f64 },
    /// Mean-reverting chop around the start price
    Sideways,
    /// Wide swings, no drift
    Volatile,
    /// Quiet first half, steep decline in the second
    Crash,
}

/// Seeded log-normal price walk. Same seed, same series.
pub struct PriceWalk {
    rng: StdRng,
    start_price: f64,
    base_volume: f64,
}

impl PriceWalk {
    pub fn new(seed: u64) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
            start_price: 100.0,
            base_volume: 1_000_000.0,
        }
    }

    pub fn with_start_price(mut self, price: f64) -> Self {
        self.start_price = price;
        self
    }

    /// Generate `bars` candles at `interval_minutes` spacing, ending now
    pub fn generate(
        &mut self,
        instrument: &str,
        scenario: WalkScenario,
        bars: usize,
        interval_minutes: i64,
    ) -> Vec<Candle> {
        let bars_per_day = (24 * 60 / interval_minutes.max(1)) as f64;
        let start_time = Utc::now() - Duration::minutes(bars as i64 * interval_minutes);

        let mut out = Vec::with_capacity(bars);
        let mut price = self.start_price;

        for i in 0..bars {
            let (drift, sigma) = match scenario {
                WalkScenario::Trend { daily_drift } => (daily_drift / bars_per_day, 0.002),
                WalkScenario::Sideways => {
                    // Pull back toward the start price
                    let reversion = (self.start_price / price).ln() * 0.05;
                    (reversion, 0.004)
                }
                WalkScenario::Volatile => (0.0, 0.02),
                WalkScenario::Crash => {
                    if i < bars / 2 {
                        (0.005 / bars_per_day, 0.002)
                    } else {
                        // -30% over the back half
                        (-0.3 / (bars as f64 / 2.0), 0.004)
                    }
                }
            };

            let noise = Normal::new(0.0, sigma)
                .map(|dist| dist.sample(&mut self.rng))
                .unwrap_or(0.0);
            price *= (drift + noise).exp();

            let timestamp = start_time + Duration::minutes(i as i64 * interval_minutes);
            out.push(self.bar(instrument, price, timestamp));
        }

        out
    }

    fn bar(&mut self, instrument: &str, close: f64, timestamp: DateTime<Utc>) -> Candle {
        let wiggle = 0.0015;
        let high = close * (1.0 + self.rng.gen_range(0.0..wiggle));
        let low = close * (1.0 - self.rng.gen_range(0.0..wiggle));
        let open = (close * (1.0 + self.rng.gen_range(-wiggle..wiggle))).clamp(low, high);
        let volume = self.base_volume * self.rng.gen_range(0.6..1.4);

        Candle {
            instrument: instrument.to_string(),
            timestamp,
            open,
            high,
            low,
            close,
            volume,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_trend_drifts_up() {
        let mut walk = PriceWalk::new(42);
        let candles = walk.generate("SYNTH", WalkScenario::Trend { daily_drift: 0.03 }, 2000, 5);

        assert_eq!(candles.len(), 2000);
        assert!(
            candles.last().unwrap().close > candles.first().unwrap().close,
            "uptrend should end higher"
        );
    }

    #[test]
    fn test_crash_ends_lower() {
        let mut walk = PriceWalk::new(42);
        let candles = walk.generate("SYNTH", WalkScenario::Crash, 1000, 5);

        let first = candles.first().unwrap().close;
        let last = candles.last().unwrap().close;
        assert!(last < first * 0.9, "crash should lose ground: {} -> {}", first, last);
    }

    #[test]
    fn test_sideways_stays_near_start() {
        let mut walk = PriceWalk::new(42).with_start_price(50.0);
        let candles = walk.generate("SYNTH", WalkScenario::Sideways, 1000, 5);

        for candle in &candles {
            assert!(
                candle.close > 40.0 && candle.close < 62.5,
                "sideways wandered to {}",
                candle.close
            );
        }
    }

    #[test]
    fn test_same_seed_reproduces_series() {
        let a = PriceWalk::new(7).generate("SYNTH", WalkScenario::Volatile, 100, 5);
        let b = PriceWalk::new(7).generate("SYNTH", WalkScenario::Volatile, 100, 5);

        for (x, y) in a.iter().zip(b.iter()) {
            assert_eq!(x.close, y.close);
        }
    }

    #[test]
    fn test_ohlc_consistency() {
        let candles = PriceWalk::new(42).generate("SYNTH", WalkScenario::Volatile, 200, 5);

        for candle in &candles {
            assert!(candle.high >= candle.close);
            assert!(candle.high >= candle.open);
            assert!(candle.low <= candle.close);
            assert!(candle.low <= candle.open);
        }
    }

    #[test]
    fn test_timestamps_sequential() {
        let candles = PriceWalk::new(42).generate("SYNTH", WalkScenario::Sideways, 100, 5);
        for pair in candles.windows(2) {
            assert!(pair[1].timestamp > pair[0].timestamp);
        }
    }
}
