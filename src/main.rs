use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use tapecast::config::Config;
use tapecast::ingest::{BackfillOptions, Backfiller, Candle, CandleSource, SimFeed, Timeframe};
use tapecast::p2p::{SwarmCommand, SwarmDriver};
use tapecast::replication::ReplicationCoordinator;
use tapecast::{Block, TapeError, TapePublicKey, TapeReader, TapeStore, TapeWriter};

#[derive(Parser)]
#[command(
    name = "tapecast",
    about = "Append-only market-data tapes replicated over a p2p swarm",
    version
)]
struct Cli {
    /// Path to the configuration file
    #[arg(short, long, default_value = "tapecast.toml")]
    config: PathBuf,

    /// Data directory (overrides the config file)
    #[arg(short, long, env = "TAPECAST_DATA_DIR")]
    data_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Create or reopen the writer tape, announce it, and ingest candles
    Seed {
        /// Market symbol to ingest
        #[arg(long)]
        symbol: Option<String>,

        /// Candle timeframe, e.g. 5m
        #[arg(long)]
        timeframe: Option<String>,

        /// Hours of history to backfill before going live (0 disables)
        #[arg(long)]
        backfill_hours: Option<u64>,

        /// Listen multiaddrs (repeatable, overrides the config file)
        #[arg(long)]
        listen: Vec<String>,

        /// Bootstrap peers as /p2p/-suffixed multiaddrs (repeatable)
        #[arg(long = "peer")]
        peers: Vec<String>,
    },

    /// Replicate a tape by its public key and tail it to stdout
    Peer {
        /// Tape public key, hex
        key: String,

        /// Print blocks starting at this index
        #[arg(long, default_value_t = 0)]
        from: u64,

        /// Listen multiaddrs (repeatable, overrides the config file)
        #[arg(long)]
        listen: Vec<String>,

        /// Bootstrap peers as /p2p/-suffixed multiaddrs (repeatable)
        #[arg(long = "peer")]
        peers: Vec<String>,
    },

    /// Print the local tape to stdout
    Cat {
        /// Keep waiting for new blocks instead of stopping at the end
        #[arg(long)]
        follow: bool,

        /// Start at this index
        #[arg(long, default_value_t = 0)]
        from: u64,
    },

    /// Create the tape key and print its public key, without seeding
    Keygen,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("tapecast=info".parse()?),
        )
        .init();

    let mut config = load_config(&cli.config)?;
    if let Some(data_dir) = cli.data_dir {
        config.node.data_dir = data_dir;
    }

    match cli.command {
        Command::Seed {
            symbol,
            timeframe,
            backfill_hours,
            listen,
            peers,
        } => {
            apply_network_overrides(&mut config, listen, peers);
            if let Some(symbol) = symbol {
                config.ingest.symbol = symbol;
            }
            if let Some(timeframe) = timeframe {
                config.ingest.timeframe = timeframe;
            }
            if let Some(hours) = backfill_hours {
                config.ingest.backfill_hours = hours;
            }
            run_seed(config).await
        }
        Command::Peer {
            key,
            from,
            listen,
            peers,
        } => {
            apply_network_overrides(&mut config, listen, peers);
            run_peer(config, &key, from).await
        }
        Command::Cat { follow, from } => run_cat(config, follow, from).await,
        Command::Keygen => run_keygen(config).await,
    }
}

fn load_config(path: &Path) -> anyhow::Result<Config> {
    if path.exists() {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        let config = toml::from_str(&text)
            .with_context(|| format!("Failed to parse {}", path.display()))?;
        info!(path = %path.display(), "Loaded configuration");
        Ok(config)
    } else {
        debug!(path = %path.display(), "No configuration file, using defaults");
        Ok(Config::default())
    }
}

fn apply_network_overrides(config: &mut Config, listen: Vec<String>, peers: Vec<String>) {
    if !listen.is_empty() {
        config.p2p.listen_addrs = listen;
    }
    config.p2p.bootstrap_peers.extend(peers);
}

/// Swarm driver plus replication coordinator, wired over channels and
/// already joined to the tape's topic.
struct Network {
    shutdown: broadcast::Sender<()>,
    swarm_task: JoinHandle<()>,
    coordinator_task: JoinHandle<Result<(), TapeError>>,
}

async fn start_network(config: &Config, tape: Arc<TapeStore>) -> anyhow::Result<Network> {
    let driver = SwarmDriver::new(&config.p2p, &config.node.data_dir)?;
    let (event_tx, event_rx) = mpsc::channel(256);
    let (command_tx, command_rx) = mpsc::channel(256);
    let (shutdown_tx, _) = broadcast::channel(1);

    let topic = tape.topic();
    let coordinator = ReplicationCoordinator::new(tape, command_tx.clone());

    let swarm_task = tokio::spawn(driver.run(event_tx, command_rx, shutdown_tx.subscribe()));
    let coordinator_task = tokio::spawn(coordinator.run(event_rx, shutdown_tx.subscribe()));

    if command_tx
        .send(SwarmCommand::Join {
            topic,
            announce: true,
            lookup: true,
        })
        .await
        .is_err()
    {
        anyhow::bail!("Swarm task is unavailable");
    }

    Ok(Network {
        shutdown: shutdown_tx,
        swarm_task,
        coordinator_task,
    })
}

async fn run_seed(config: Config) -> anyhow::Result<()> {
    let (tape, created) = TapeStore::open_or_create(&config.node.data_dir).await?;
    let tape = Arc::new(tape);
    if created {
        info!("Created a new tape");
    } else {
        info!(length = tape.length(), "Reopened tape");
    }
    println!("tape public key: {}", tape.public_key());
    println!("discovery topic: {}", tape.topic());

    let timeframe: Timeframe = config
        .ingest
        .timeframe
        .parse()
        .map_err(anyhow::Error::msg)?;

    let network = start_network(&config, tape.clone()).await?;

    let source: Arc<dyn CandleSource> = Arc::new(
        SimFeed::new(config.ingest.sim_seed, config.ingest.start_price)
            .with_live_tick(Duration::from_secs(config.ingest.live_tick_secs)),
    );
    let backfill = if config.ingest.backfill_hours > 0 {
        Some(BackfillOptions {
            timeframe,
            symbol: config.ingest.symbol.clone(),
            window: Duration::from_secs(config.ingest.backfill_hours * 3600),
            batch_limit: config.ingest.batch_limit,
            request_delay: Duration::from_millis(config.ingest.backfill_delay_ms),
            ..BackfillOptions::default()
        })
    } else {
        None
    };

    let ingest_task = tokio::spawn(run_ingest(
        tape,
        source,
        backfill,
        timeframe,
        config.ingest.symbol.clone(),
        network.shutdown.subscribe(),
    ));

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Interrupt received, shutting down");
        }
        joined = network.coordinator_task => handle_task_exit("replication", joined)?,
        joined = ingest_task => handle_task_exit("ingestion", joined)?,
    }

    let _ = network.shutdown.send(());
    let _ = tokio::time::timeout(Duration::from_secs(5), network.swarm_task).await;
    Ok(())
}

/// Append candles: backfill history first, then follow the live stream.
async fn run_ingest(
    tape: Arc<TapeStore>,
    source: Arc<dyn CandleSource>,
    backfill: Option<BackfillOptions>,
    timeframe: Timeframe,
    symbol: String,
    mut shutdown: broadcast::Receiver<()>,
) -> Result<(), TapeError> {
    let mut writer = TapeWriter::new(tape);

    if let Some(opts) = backfill {
        let backfiller = Backfiller::new(source.clone(), opts);
        let report = backfiller.run(&mut writer, &mut shutdown).await?;
        if report.interrupted {
            return Ok(());
        }
        if !report.caught_up {
            warn!(
                appended = report.appended,
                "Continuing to live ingestion with incomplete history"
            );
        }
    }

    let mut candles = match source.subscribe(timeframe, &symbol).await {
        Ok(receiver) => receiver,
        Err(e) => {
            warn!(error = %e, "Live subscription failed");
            return Ok(());
        }
    };
    info!(symbol = %symbol, timeframe = %timeframe, "Live ingestion started");

    loop {
        tokio::select! {
            _ = shutdown.recv() => break,
            candle = candles.recv() => match candle {
                Some(candle) => {
                    let payload = match candle.to_payload() {
                        Ok(payload) => payload,
                        Err(e) => {
                            warn!(error = %e, "Skipping unencodable candle");
                            continue;
                        }
                    };
                    let reference = writer.write(&payload).await?;
                    debug!(
                        index = reference.index,
                        timestamp = candle.timestamp,
                        "Appended live candle"
                    );
                }
                None => {
                    warn!("Live candle stream ended");
                    break;
                }
            },
        }
    }
    writer.close();
    Ok(())
}

async fn run_peer(config: Config, key: &str, from: u64) -> anyhow::Result<()> {
    let public_key = TapePublicKey::from_hex(key).context("Invalid tape key")?;
    let tape = Arc::new(TapeStore::open_replica(&config.node.data_dir, public_key).await?);
    println!("replicating tape: {}", tape.public_key());
    println!("discovery topic: {}", tape.topic());
    if tape.length() > 0 {
        info!(length = tape.length(), "Resuming from local replica");
    }

    let network = start_network(&config, tape.clone()).await?;

    let mut reader = TapeReader::new(tape, from, true);
    let printer: JoinHandle<Result<(), TapeError>> = tokio::spawn(async move {
        while let Some(block) = reader.next_block().await? {
            print_block(&block);
        }
        Ok(())
    });

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Interrupt received, shutting down");
        }
        joined = network.coordinator_task => handle_task_exit("replication", joined)?,
        joined = printer => handle_task_exit("printer", joined)?,
    }

    let _ = network.shutdown.send(());
    let _ = tokio::time::timeout(Duration::from_secs(5), network.swarm_task).await;
    Ok(())
}

async fn run_cat(config: Config, follow: bool, from: u64) -> anyhow::Result<()> {
    let tape = Arc::new(TapeStore::open_existing(&config.node.data_dir).await?);
    info!(
        tape = %tape.public_key(),
        length = tape.length(),
        "Opened local tape"
    );

    let mut reader = TapeReader::new(tape, from, follow);
    if follow {
        loop {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => break,
                block = reader.next_block() => match block? {
                    Some(block) => print_block(&block),
                    None => break,
                },
            }
        }
    } else {
        while let Some(block) = reader.next_block().await? {
            print_block(&block);
        }
    }
    Ok(())
}

async fn run_keygen(config: Config) -> anyhow::Result<()> {
    let (tape, created) = TapeStore::open_or_create(&config.node.data_dir).await?;
    if created {
        println!("created new tape under {}", config.node.data_dir.display());
    } else {
        println!(
            "tape already exists under {} ({} blocks)",
            config.node.data_dir.display(),
            tape.length()
        );
    }
    println!("tape public key: {}", tape.public_key());
    println!("discovery topic: {}", tape.topic());
    Ok(())
}

fn print_block(block: &Block) {
    match Candle::from_payload(&block.payload) {
        Ok(candle) => {
            let time = chrono::DateTime::from_timestamp_millis(candle.timestamp)
                .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
                .unwrap_or_else(|| candle.timestamp.to_string());
            println!(
                "[{}] {} O:{:.2} H:{:.2} L:{:.2} C:{:.2} V:{:.2}",
                block.index,
                time,
                candle.open,
                candle.high,
                candle.low,
                candle.close,
                candle.volume
            );
        }
        Err(_) => {
            println!(
                "[{}] {}",
                block.index,
                String::from_utf8_lossy(&block.payload)
            );
        }
    }
}

fn handle_task_exit(
    task: &str,
    joined: Result<Result<(), TapeError>, tokio::task::JoinError>,
) -> anyhow::Result<()> {
    match joined {
        Ok(Ok(())) => {
            info!(task, "Task finished");
            Ok(())
        }
        Ok(Err(e)) => Err(anyhow::Error::new(e).context(format!("Fatal {} failure", task))),
        Err(e) => Err(anyhow::Error::new(e).context(format!("The {} task panicked", task))),
    }
}
