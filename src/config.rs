//! Configuration for the tapecast binary
//!
//! Loaded from a TOML file; every field has a default so a missing or
//! partial file still yields a runnable node. CLI flags override on top.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub node: NodeConfig,
    #[serde(default)]
    pub p2p: P2pConfig,
    #[serde(default)]
    pub ingest: IngestConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            node: NodeConfig::default(),
            p2p: P2pConfig::default(),
            ingest: IngestConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Where tape databases and keys live.
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct P2pConfig {
    /// Multiaddrs to listen on. Port 0 picks free ports.
    #[serde(default = "default_listen_addrs")]
    pub listen_addrs: Vec<String>,
    /// Known peers to dial at startup, `/p2p/`-suffixed multiaddrs.
    #[serde(default)]
    pub bootstrap_peers: Vec<String>,
    /// Discover peers on the local network.
    #[serde(default = "default_true")]
    pub enable_mdns: bool,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    /// How often provider lookups for joined topics are refreshed.
    #[serde(default = "default_lookup_interval_secs")]
    pub lookup_interval_secs: u64,
}

impl Default for P2pConfig {
    fn default() -> Self {
        Self {
            listen_addrs: default_listen_addrs(),
            bootstrap_peers: Vec::new(),
            enable_mdns: default_true(),
            request_timeout_secs: default_request_timeout_secs(),
            lookup_interval_secs: default_lookup_interval_secs(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestConfig {
    #[serde(default = "default_symbol")]
    pub symbol: String,
    #[serde(default = "default_timeframe")]
    pub timeframe: String,
    /// Hours of history to backfill before going live. Zero disables the
    /// backfill entirely.
    #[serde(default = "default_backfill_hours")]
    pub backfill_hours: u64,
    /// Pause between backfill requests, milliseconds.
    #[serde(default = "default_backfill_delay_ms")]
    pub backfill_delay_ms: u64,
    /// Candles per backfill request.
    #[serde(default = "default_batch_limit")]
    pub batch_limit: u32,
    /// Seconds between simulated live candles.
    #[serde(default = "default_live_tick_secs")]
    pub live_tick_secs: u64,
    /// Seed for the simulated price walk.
    #[serde(default = "default_sim_seed")]
    pub sim_seed: u64,
    /// Anchor price for the simulated walk.
    #[serde(default = "default_start_price")]
    pub start_price: f64,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            symbol: default_symbol(),
            timeframe: default_timeframe(),
            backfill_hours: default_backfill_hours(),
            backfill_delay_ms: default_backfill_delay_ms(),
            batch_limit: default_batch_limit(),
            live_tick_secs: default_live_tick_secs(),
            sim_seed: default_sim_seed(),
            start_price: default_start_price(),
        }
    }
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("./tapecast-data")
}

fn default_listen_addrs() -> Vec<String> {
    vec![
        "/ip4/0.0.0.0/tcp/0".to_string(),
        "/ip4/0.0.0.0/udp/0/quic-v1".to_string(),
    ]
}

fn default_true() -> bool {
    true
}

fn default_request_timeout_secs() -> u64 {
    30
}

fn default_lookup_interval_secs() -> u64 {
    30
}

fn default_symbol() -> String {
    "BTCUSD".to_string()
}

fn default_timeframe() -> String {
    "5m".to_string()
}

fn default_backfill_hours() -> u64 {
    72
}

fn default_backfill_delay_ms() -> u64 {
    1450
}

fn default_batch_limit() -> u32 {
    240
}

fn default_live_tick_secs() -> u64 {
    5
}

fn default_sim_seed() -> u64 {
    42
}

fn default_start_price() -> f64 {
    30_000.0
}
