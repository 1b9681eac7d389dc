//! Upstream candle sources

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::IngestError;
use crate::ingest::candle::{Candle, Timeframe};

/// Where candles come from. Implementations wrap an exchange API or a
/// simulator; the backfiller and the live ingest loop only see this trait.
#[async_trait]
pub trait CandleSource: Send + Sync {
    /// Fetch historical candles between `start_ms` and `end_ms`
    /// (inclusive bucket starts), newest first, at most `limit` of them.
    async fn fetch_range(
        &self,
        timeframe: Timeframe,
        symbol: &str,
        start_ms: i64,
        end_ms: i64,
        limit: u32,
    ) -> Result<Vec<Candle>, IngestError>;

    /// Subscribe to candles as they form. The stream ends when the source
    /// goes away.
    async fn subscribe(
        &self,
        timeframe: Timeframe,
        symbol: &str,
    ) -> Result<mpsc::Receiver<Candle>, IngestError>;
}
