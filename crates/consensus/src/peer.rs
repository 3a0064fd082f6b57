//! Per-peer tracking state

use light_types::wire::NodeInfo;
use light_types::{Digest, PeerId, LATENCY_WINDOW};
use serde::Serialize;
use std::time::Duration;

/// Exponential moving average of round-trip time
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct LatencyEma {
    window: u32,
    value_ms: Option<f64>,
}

impl LatencyEma {
    pub fn new(window: u32) -> Self {
        Self {
            window: window.max(1),
            value_ms: None,
        }
    }

    /// Fold one sample in; the first sample seeds the average
    pub fn record(&mut self, sample: Duration) {
        let sample_ms = sample.as_secs_f64() * 1000.0;
        let alpha = 2.0 / (f64::from(self.window) + 1.0);
        self.value_ms = Some(match self.value_ms {
            None => sample_ms,
            Some(prev) => prev + alpha * (sample_ms - prev),
        });
    }

    pub fn millis(&self) -> Option<f64> {
        self.value_ms
    }
}

impl Default for LatencyEma {
    fn default() -> Self {
        Self::new(LATENCY_WINDOW)
    }
}

/// What a peer advertises about its software; informational only
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BuildInfo {
    pub identity: String,
    pub build: String,
    pub commit: String,
    pub accepted_release: String,
    pub next_release: String,
}

impl From<&NodeInfo> for BuildInfo {
    fn from(info: &NodeInfo) -> Self {
        Self {
            identity: info.identity.clone(),
            build: info.build.clone(),
            commit: info.commit.clone(),
            accepted_release: info.accepted_release.clone(),
            next_release: info.next_release.clone(),
        }
    }
}

/// One tracked peer
///
/// `confirmed_digest` and `peek_digest` are each tagged with the height they
/// describe, so a report that was requested before the cursor moved can never
/// be mistaken for a report about the new height.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PeerState {
    pub id: PeerId,
    pub url: String,
    pub online: bool,
    /// A probe is in flight
    pub busy: bool,
    /// Locally suppressed
    pub ignored: bool,
    pub confirmed_height: u64,
    pub confirmed_digest: Option<Digest>,
    pub peek_height: u64,
    pub peek_digest: Option<Digest>,
    /// Chain length the peer last reported
    pub reported_height: u64,
    pub latency: LatencyEma,
    pub build: BuildInfo,
}

impl PeerState {
    /// A freshly promoted, online peer with no consensus reports yet
    pub fn new(id: PeerId, url: impl Into<String>) -> Self {
        Self {
            id,
            url: url.into(),
            online: true,
            busy: false,
            ignored: false,
            confirmed_height: 0,
            confirmed_digest: None,
            peek_height: 0,
            peek_digest: None,
            reported_height: 0,
            latency: LatencyEma::default(),
            build: BuildInfo::default(),
        }
    }

    /// Online, not ignored, and agreeing with `digest` at `height`
    pub fn agrees_with(&self, height: u64, digest: &Digest) -> bool {
        self.online
            && !self.ignored
            && self.confirmed_height == height
            && self.confirmed_digest.as_ref() == Some(digest)
    }

    /// Online, not ignored, and reporting something else at `height`
    pub fn disputes(&self, height: u64, digest: &Digest) -> bool {
        self.online
            && !self.ignored
            && self.confirmed_height == height
            && self.confirmed_digest.as_ref() != Some(digest)
    }

    /// Peek this peer casts for `height`, if it has one
    pub fn peek_at(&self, height: u64) -> Option<&Digest> {
        if self.peek_height == height {
            self.peek_digest.as_ref()
        } else {
            None
        }
    }

    /// Move this peer up to an agreed height without waiting for a probe
    pub fn confirm(&mut self, height: u64, digest: Digest) {
        self.confirmed_height = height;
        self.confirmed_digest = Some(digest);
        self.reported_height = self.reported_height.max(height);
        self.peek_digest = None;
    }
}
