//! Configuration, events and stats for the consensus tracker

use light_types::{Digest, DEFAULT_PEER_SAMPLE, LATENCY_WINDOW};
use serde::Serialize;
use std::time::Duration;

/// Configuration for a consensus tracker
#[derive(Debug, Clone)]
pub struct TrackerConfig {
    /// Genesis digest every promoted peer must share
    pub genesis: Digest,
    /// Required agreement fraction; 1.0 means unanimity
    pub threshold: f64,
    /// Deadline for each individual probe
    pub timeout: Duration,
    /// How many peer URLs each probe asks for
    pub sample_size: usize,
    /// Samples in the latency moving average
    pub latency_window: u32,
}

impl TrackerConfig {
    pub fn new(genesis: Digest) -> Self {
        Self {
            genesis,
            threshold: 1.0,
            timeout: Duration::from_secs(5),
            sample_size: DEFAULT_PEER_SAMPLE,
            latency_window: LATENCY_WINDOW,
        }
    }

    pub fn with_threshold(mut self, threshold: f64) -> Self {
        self.threshold = threshold;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

/// Change notifications published by the tracker
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum TrackerEvent {
    Advanced { height: u64, digest: Digest },
    RolledBack,
    CaughtUp { height: u64 },
    PeerPromoted { url: String },
    PeerOffline { url: String },
}

/// Snapshot of tracker health
#[derive(Debug, Clone, Default, Serialize)]
pub struct TrackerStats {
    pub known_urls: usize,
    pub tracked_peers: usize,
    pub online_peers: usize,
    pub current_peers: usize,
    pub height: u64,
    pub step: u64,
    pub is_current: bool,
}
