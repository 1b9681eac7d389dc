//! Historical backfill
//!
//! Walks the upstream history backwards from now in paced batches and
//! appends each batch to the tape. Every round asks for candles up to the
//! previous round's oldest timestamp, so the window narrows until the
//! boundary stops moving, which is the signal that history is exhausted.
//! The boundary candle itself appears in consecutive batches; readers
//! treat the tape as a raw capture, duplicates included.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::error::TapeError;
use crate::ingest::candle::Timeframe;
use crate::ingest::source::CandleSource;
use crate::tape::TapeWriter;

#[derive(Debug, Clone)]
pub struct BackfillOptions {
    pub timeframe: Timeframe,
    pub symbol: String,
    /// How far back from now to fetch.
    pub window: Duration,
    /// Candles per request.
    pub batch_limit: u32,
    /// Pause between requests, tuned to upstream rate limits.
    pub request_delay: Duration,
    /// Consecutive upstream failures tolerated before giving up.
    pub max_retries: u32,
}

impl Default for BackfillOptions {
    fn default() -> Self {
        Self {
            timeframe: Timeframe::from_millis(5 * 60 * 1000),
            symbol: "BTCUSD".to_string(),
            window: Duration::from_secs(72 * 3600),
            batch_limit: 240,
            request_delay: Duration::from_millis(1450),
            max_retries: 3,
        }
    }
}

/// What a backfill run accomplished.
#[derive(Debug, Clone, Copy, Default)]
pub struct BackfillReport {
    pub appended: u64,
    pub batches: u32,
    /// History was exhausted.
    pub caught_up: bool,
    /// Shutdown fired mid-run. Neither flag set means upstream retries
    /// were exhausted.
    pub interrupted: bool,
}

pub struct Backfiller {
    source: Arc<dyn CandleSource>,
    opts: BackfillOptions,
}

impl Backfiller {
    pub fn new(source: Arc<dyn CandleSource>, opts: BackfillOptions) -> Self {
        Self { source, opts }
    }

    /// Run the backfill to completion, interruption, or exhausted retries.
    /// Upstream trouble is retried and then given up on with whatever was
    /// already appended; only storage failures are errors.
    pub async fn run(
        &self,
        writer: &mut TapeWriter,
        shutdown: &mut broadcast::Receiver<()>,
    ) -> Result<BackfillReport, TapeError> {
        let now = Utc::now().timestamp_millis();
        let window_start = now - self.opts.window.as_millis() as i64;
        let mut end = now;
        let mut last_boundary: Option<i64> = None;
        let mut report = BackfillReport::default();
        let mut retries = 0u32;

        info!(
            symbol = %self.opts.symbol,
            timeframe = %self.opts.timeframe,
            hours = self.opts.window.as_secs() / 3600,
            "Backfilling history"
        );

        loop {
            let batch = tokio::select! {
                result = self.source.fetch_range(
                    self.opts.timeframe,
                    &self.opts.symbol,
                    window_start,
                    end,
                    self.opts.batch_limit,
                ) => result,
                _ = shutdown.recv() => {
                    info!("Backfill interrupted");
                    report.interrupted = true;
                    return Ok(report);
                }
            };

            let batch = match batch {
                Ok(batch) => {
                    retries = 0;
                    batch
                }
                Err(e) => {
                    retries += 1;
                    if retries > self.opts.max_retries {
                        warn!(
                            error = %e,
                            retries = self.opts.max_retries,
                            "Backfill giving up on upstream"
                        );
                        return Ok(report);
                    }
                    warn!(error = %e, attempt = retries, "Upstream fetch failed, retrying");
                    if !self.pause(shutdown).await {
                        report.interrupted = true;
                        return Ok(report);
                    }
                    continue;
                }
            };

            let boundary = match batch.last() {
                Some(oldest) => oldest.timestamp,
                None => {
                    report.caught_up = true;
                    break;
                }
            };

            // Boundary did not move: the previous round already reached
            // the oldest candle upstream will serve. Nothing new here.
            if last_boundary == Some(boundary) {
                report.caught_up = true;
                break;
            }
            last_boundary = Some(boundary);
            end = boundary;

            for candle in &batch {
                let payload = match candle.to_payload() {
                    Ok(payload) => payload,
                    Err(e) => {
                        warn!(error = %e, "Skipping unencodable candle");
                        continue;
                    }
                };
                writer.write(&payload).await?;
                report.appended += 1;
            }
            report.batches += 1;
            debug!(
                batch = report.batches,
                boundary,
                appended = report.appended,
                "Backfill batch appended"
            );

            if !self.pause(shutdown).await {
                report.interrupted = true;
                return Ok(report);
            }
        }

        info!(
            appended = report.appended,
            batches = report.batches,
            "Backfill complete"
        );
        Ok(report)
    }

    /// Rate-limit pause. Returns false when shutdown fired during it.
    async fn pause(&self, shutdown: &mut broadcast::Receiver<()>) -> bool {
        tokio::select! {
            _ = tokio::time::sleep(self.opts.request_delay) => true,
            _ = shutdown.recv() => {
                info!("Backfill interrupted");
                false
            }
        }
    }
}
