//! Backfill integration tests
//!
//! Runs the backfiller against the simulated feed and against custom
//! sources to cover:
//! - Walking a bounded window to its start and stopping
//! - The repeated-boundary termination signal
//! - Retry behavior for flaky upstreams
//! - Shutdown interruption mid-fetch

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tempfile::TempDir;
use tokio::sync::{broadcast, mpsc};

use tapecast::ingest::{BackfillOptions, Backfiller, Candle, CandleSource, SimFeed, Timeframe};
use tapecast::{IngestError, TapeError, TapeKeypair, TapeStore, TapeWriter};

fn opts(timeframe: &str, window_secs: u64, batch_limit: u32) -> BackfillOptions {
    BackfillOptions {
        timeframe: timeframe.parse().unwrap(),
        symbol: "BTCUSD".to_string(),
        window: Duration::from_secs(window_secs),
        batch_limit,
        request_delay: Duration::from_millis(1),
        max_retries: 3,
    }
}

async fn disk_writer() -> (Arc<TapeStore>, TapeWriter, TempDir) {
    let dir = TempDir::new().unwrap();
    let (tape, _) = TapeStore::open_or_create(dir.path()).await.unwrap();
    let tape = Arc::new(tape);
    let writer = TapeWriter::new(tape.clone());
    (tape, writer, dir)
}

// =============================================================================
// Window Walk Against the Simulated Feed
// =============================================================================

#[tokio::test]
async fn test_backfill_walks_window_to_its_start() {
    let (tape, mut writer, _dir) = disk_writer().await;
    let options = opts("1s", 30, 10);
    let step = options.timeframe.millis();
    let window_ms: i64 = 30_000;

    let (_shutdown_tx, mut shutdown) = broadcast::channel::<()>(1);
    let started_at = Utc::now().timestamp_millis();
    let backfiller = Backfiller::new(Arc::new(SimFeed::new(7, 30_000.0)), options);
    let report = backfiller.run(&mut writer, &mut shutdown).await.unwrap();
    let finished_at = Utc::now().timestamp_millis();

    assert!(report.caught_up, "A bounded window should be exhausted");
    assert!(!report.interrupted);
    assert!(
        report.batches >= 3,
        "30s of 1s candles with batches of 10 needs several rounds, got {}",
        report.batches
    );
    assert_eq!(report.appended, tape.length());

    let mut candles = Vec::new();
    for i in 0..tape.length() {
        let block = tape.get(i).await.unwrap();
        candles.push(Candle::from_payload(&block.payload).unwrap());
    }

    // Tape order is newest first. Timestamps step down one bucket at a
    // time, except at batch seams where the boundary candle repeats.
    let mut seams = 0usize;
    for pair in candles.windows(2) {
        let delta = pair[0].timestamp - pair[1].timestamp;
        assert!(
            delta == step || delta == 0,
            "Unexpected timestamp delta {} between consecutive blocks",
            delta
        );
        if delta == 0 {
            seams += 1;
        }
    }
    assert_eq!(
        seams,
        report.batches as usize - 1,
        "Every batch after the first re-fetches the previous boundary"
    );

    // The oldest candle lands within one bucket of the window floor.
    let oldest = candles.last().unwrap().timestamp;
    assert!(
        oldest >= started_at - window_ms - step,
        "Backfill went past the window start: {}",
        oldest
    );
    assert!(
        oldest <= finished_at - window_ms + step,
        "Backfill stopped short of the window start: {}",
        oldest
    );
}

#[tokio::test]
async fn test_backfill_single_batch_window() {
    let (tape, mut writer, _dir) = disk_writer().await;
    // A 5s window at 1s candles fits one batch of 100 with room to spare.
    let options = opts("1s", 5, 100);

    let (_shutdown_tx, mut shutdown) = broadcast::channel::<()>(1);
    let backfiller = Backfiller::new(Arc::new(SimFeed::new(3, 30_000.0)), options);
    let report = backfiller.run(&mut writer, &mut shutdown).await.unwrap();

    assert!(report.caught_up);
    assert_eq!(report.batches, 1, "One round should cover the whole window");
    assert!(report.appended >= 5, "Expected at least the window's buckets");
    assert_eq!(report.appended, tape.length());
}

// =============================================================================
// Custom Sources: Empty, Flaky, Dead, Hanging
// =============================================================================

struct EmptySource;

#[async_trait]
impl CandleSource for EmptySource {
    async fn fetch_range(
        &self,
        _timeframe: Timeframe,
        _symbol: &str,
        _start_ms: i64,
        _end_ms: i64,
        _limit: u32,
    ) -> Result<Vec<Candle>, IngestError> {
        Ok(Vec::new())
    }

    async fn subscribe(
        &self,
        _timeframe: Timeframe,
        _symbol: &str,
    ) -> Result<mpsc::Receiver<Candle>, IngestError> {
        let (_tx, rx) = mpsc::channel(1);
        Ok(rx)
    }
}

#[tokio::test]
async fn test_backfill_empty_source_catches_up_without_appending() {
    let (tape, mut writer, _dir) = disk_writer().await;

    let (_shutdown_tx, mut shutdown) = broadcast::channel::<()>(1);
    let backfiller = Backfiller::new(Arc::new(EmptySource), opts("1s", 60, 10));
    let report = backfiller.run(&mut writer, &mut shutdown).await.unwrap();

    assert!(report.caught_up);
    assert!(!report.interrupted);
    assert_eq!(report.appended, 0);
    assert_eq!(report.batches, 0);
    assert_eq!(tape.length(), 0);
}

struct FlakySource {
    inner: SimFeed,
    failures_left: AtomicU32,
}

#[async_trait]
impl CandleSource for FlakySource {
    async fn fetch_range(
        &self,
        timeframe: Timeframe,
        symbol: &str,
        start_ms: i64,
        end_ms: i64,
        limit: u32,
    ) -> Result<Vec<Candle>, IngestError> {
        if self.failures_left.load(Ordering::SeqCst) > 0 {
            self.failures_left.fetch_sub(1, Ordering::SeqCst);
            return Err(IngestError::Upstream("simulated outage".to_string()));
        }
        self.inner
            .fetch_range(timeframe, symbol, start_ms, end_ms, limit)
            .await
    }

    async fn subscribe(
        &self,
        timeframe: Timeframe,
        symbol: &str,
    ) -> Result<mpsc::Receiver<Candle>, IngestError> {
        self.inner.subscribe(timeframe, symbol).await
    }
}

#[tokio::test]
async fn test_backfill_rides_out_transient_failures() {
    let (tape, mut writer, _dir) = disk_writer().await;
    let source = Arc::new(FlakySource {
        inner: SimFeed::new(9, 30_000.0),
        failures_left: AtomicU32::new(2),
    });

    let (_shutdown_tx, mut shutdown) = broadcast::channel::<()>(1);
    let backfiller = Backfiller::new(source, opts("1s", 5, 100));
    let report = backfiller.run(&mut writer, &mut shutdown).await.unwrap();

    assert!(report.caught_up, "Two failures stay under the retry budget");
    assert!(report.appended > 0);
    assert_eq!(report.appended, tape.length());
}

struct DeadSource;

#[async_trait]
impl CandleSource for DeadSource {
    async fn fetch_range(
        &self,
        _timeframe: Timeframe,
        _symbol: &str,
        _start_ms: i64,
        _end_ms: i64,
        _limit: u32,
    ) -> Result<Vec<Candle>, IngestError> {
        Err(IngestError::Upstream("unreachable".to_string()))
    }

    async fn subscribe(
        &self,
        _timeframe: Timeframe,
        _symbol: &str,
    ) -> Result<mpsc::Receiver<Candle>, IngestError> {
        Err(IngestError::Closed)
    }
}

#[tokio::test]
async fn test_backfill_gives_up_after_retry_budget() {
    let (tape, mut writer, _dir) = disk_writer().await;
    let mut options = opts("1s", 60, 10);
    options.max_retries = 2;

    let (_shutdown_tx, mut shutdown) = broadcast::channel::<()>(1);
    let backfiller = Backfiller::new(Arc::new(DeadSource), options);
    let report = backfiller.run(&mut writer, &mut shutdown).await.unwrap();

    // Neither caught up nor interrupted marks exhausted retries.
    assert!(!report.caught_up);
    assert!(!report.interrupted);
    assert_eq!(report.appended, 0);
    assert_eq!(tape.length(), 0);
}

struct HangingSource;

#[async_trait]
impl CandleSource for HangingSource {
    async fn fetch_range(
        &self,
        _timeframe: Timeframe,
        _symbol: &str,
        _start_ms: i64,
        _end_ms: i64,
        _limit: u32,
    ) -> Result<Vec<Candle>, IngestError> {
        std::future::pending().await
    }

    async fn subscribe(
        &self,
        _timeframe: Timeframe,
        _symbol: &str,
    ) -> Result<mpsc::Receiver<Candle>, IngestError> {
        std::future::pending().await
    }
}

#[tokio::test]
async fn test_backfill_shutdown_interrupts_hung_fetch() {
    let (tape, mut writer, _dir) = disk_writer().await;

    let (shutdown_tx, mut shutdown) = broadcast::channel::<()>(1);
    shutdown_tx.send(()).unwrap();

    let backfiller = Backfiller::new(Arc::new(HangingSource), opts("1s", 60, 10));
    let report = backfiller.run(&mut writer, &mut shutdown).await.unwrap();

    assert!(report.interrupted, "Shutdown must win over a hung upstream");
    assert!(!report.caught_up);
    assert_eq!(report.appended, 0);
    assert_eq!(tape.length(), 0);
}

// =============================================================================
// Storage Errors Are Fatal
// =============================================================================

#[tokio::test]
async fn test_backfill_propagates_storage_errors() {
    // A replica tape cannot be appended to, which surfaces on the first
    // written candle.
    let foreign = TapeKeypair::generate();
    let tape = Arc::new(TapeStore::memory_replica(foreign.public()).unwrap());
    let mut writer = TapeWriter::new(tape);

    let (_shutdown_tx, mut shutdown) = broadcast::channel::<()>(1);
    let backfiller = Backfiller::new(Arc::new(SimFeed::new(1, 30_000.0)), opts("1s", 5, 10));
    let err = backfiller.run(&mut writer, &mut shutdown).await.unwrap_err();
    assert!(matches!(err, TapeError::ReadOnly));
}
