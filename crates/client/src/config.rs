//! Client Configuration

use anyhow::{ensure, Context, Result};
use light_consensus::TrackerConfig;
use light_queue::{QueueConfig, DEFAULT_NONCE_ROUNDS};
use light_types::{Digest, DEFAULT_PEER_SAMPLE, RECORD_BY_HOURS};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Client configuration, read from JSON and overridden by CLI flags
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Genesis digest of the chain to follow
    pub genesis: String,
    /// Peer URLs to start discovery from
    pub seeds: Vec<String>,
    pub account_id: String,
    pub key_name: String,
    /// Password-sealed signing key
    pub key_file: PathBuf,
    pub data_dir: PathBuf,
    /// Service loop period in milliseconds
    pub tick_ms: u64,
    pub probe_timeout_ms: u64,
    /// Required peer agreement; 1.0 means unanimity
    pub threshold: f64,
    pub peer_sample: usize,
    pub nonce_rounds: usize,
    /// Pause between inconclusive nonce rounds in milliseconds
    pub nonce_retry_ms: u64,
    pub record_by_hours: i64,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            genesis: String::new(),
            seeds: Vec::new(),
            account_id: String::new(),
            key_name: "main".to_string(),
            key_file: PathBuf::from("./data/key.sealed"),
            data_dir: PathBuf::from("./data"),
            tick_ms: 5000,
            probe_timeout_ms: 5000,
            threshold: 1.0,
            peer_sample: DEFAULT_PEER_SAMPLE,
            nonce_rounds: DEFAULT_NONCE_ROUNDS,
            nonce_retry_ms: 500,
            record_by_hours: RECORD_BY_HOURS,
        }
    }
}

impl ClientConfig {
    /// Read a JSON config file, or start from defaults
    pub fn load(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => {
                let raw = std::fs::read_to_string(path)
                    .with_context(|| format!("reading config {:?}", path))?;
                serde_json::from_str(&raw).with_context(|| format!("parsing config {:?}", path))
            }
            None => Ok(Self::default()),
        }
    }

    pub fn validate(&self) -> Result<()> {
        ensure!(!self.genesis.is_empty(), "genesis digest is not set");
        ensure!(!self.account_id.is_empty(), "account id is not set");
        ensure!(
            self.threshold > 0.0 && self.threshold <= 1.0,
            "threshold must be in (0, 1], got {}",
            self.threshold
        );
        ensure!(self.tick_ms > 0, "tick interval must be positive");
        ensure!(self.nonce_rounds > 0, "nonce rounds must be positive");
        Ok(())
    }

    pub fn tracker_config(&self) -> TrackerConfig {
        let mut config = TrackerConfig::new(Digest::new(self.genesis.clone()))
            .with_threshold(self.threshold)
            .with_timeout(Duration::from_millis(self.probe_timeout_ms));
        config.sample_size = self.peer_sample;
        config
    }

    pub fn queue_config(&self, sealed_key: Vec<u8>) -> QueueConfig {
        QueueConfig::new(&self.account_id, &self.key_name, sealed_key)
            .with_nonce_rounds(self.nonce_rounds)
            .with_nonce_retry_delay(Duration::from_millis(self.nonce_retry_ms))
            .with_record_window(chrono::Duration::hours(self.record_by_hours))
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_ms)
    }

    pub fn store_path(&self) -> PathBuf {
        self.data_dir.join("store")
    }
}
