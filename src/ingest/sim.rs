//! Simulated candle source
//!
//! Deterministic random-walk price series seeded per timestamp bucket, so
//! a fetched range and a live subscription agree on the same candles and
//! consecutive candles share open and close. Useful for development and
//! tests without an exchange connection.

use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio::sync::mpsc;
use tracing::debug;

use crate::error::IngestError;
use crate::ingest::candle::{Candle, Timeframe};
use crate::ingest::source::CandleSource;

#[derive(Debug, Clone)]
pub struct SimFeed {
    seed: u64,
    start_price: f64,
    live_tick: Duration,
}

impl SimFeed {
    pub fn new(seed: u64, start_price: f64) -> Self {
        Self {
            seed,
            start_price,
            live_tick: Duration::from_secs(5),
        }
    }

    /// Interval between candles on the live subscription. The simulator
    /// emits faster than real bucket widths so tails are visible quickly.
    pub fn with_live_tick(mut self, live_tick: Duration) -> Self {
        self.live_tick = live_tick;
        self
    }

    /// Price at a bucket boundary, a bounded walk around the start price.
    fn price_at(&self, timestamp_ms: i64) -> f64 {
        let mut rng = StdRng::seed_from_u64(self.seed ^ (timestamp_ms as u64));
        let drift: f64 = rng.gen_range(-0.03..0.03);
        self.start_price * (1.0 + drift)
    }

    /// The candle for one bucket. Symbols do not change the series, they
    /// only label it.
    fn candle_at(&self, timeframe: Timeframe, bucket_ms: i64) -> Candle {
        let open = self.price_at(bucket_ms);
        let close = self.price_at(bucket_ms + timeframe.millis());

        let mut rng =
            StdRng::seed_from_u64(self.seed.wrapping_mul(31).wrapping_add(bucket_ms as u64));
        let high = open.max(close) * (1.0 + rng.gen::<f64>() * 0.005);
        let low = open.min(close) * (1.0 - rng.gen::<f64>() * 0.005);
        let volume = rng.gen_range(1.0..250.0);

        Candle {
            timestamp: bucket_ms,
            open,
            high,
            low,
            close,
            volume,
        }
    }
}

#[async_trait]
impl CandleSource for SimFeed {
    async fn fetch_range(
        &self,
        timeframe: Timeframe,
        symbol: &str,
        start_ms: i64,
        end_ms: i64,
        limit: u32,
    ) -> Result<Vec<Candle>, IngestError> {
        let step = timeframe.millis();
        let mut bucket = timeframe.align(end_ms);
        let mut candles = Vec::new();
        while bucket >= start_ms && (candles.len() as u32) < limit {
            candles.push(self.candle_at(timeframe, bucket));
            bucket -= step;
        }
        debug!(
            symbol,
            count = candles.len(),
            "Simulated history batch"
        );
        Ok(candles)
    }

    async fn subscribe(
        &self,
        timeframe: Timeframe,
        symbol: &str,
    ) -> Result<mpsc::Receiver<Candle>, IngestError> {
        let (tx, rx) = mpsc::channel(64);
        let feed = self.clone();
        let symbol = symbol.to_string();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(feed.live_tick);
            loop {
                ticker.tick().await;
                let now = Utc::now().timestamp_millis();
                let candle = feed.candle_at(timeframe, timeframe.align(now));
                if tx.send(candle).await.is_err() {
                    debug!(symbol = %symbol, "Live subscriber dropped");
                    break;
                }
            }
        });
        Ok(rx)
    }
}
