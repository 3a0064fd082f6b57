//! Light client peer consensus
//!
//! Architecture:
//! - The peer directory collects URLs learned from seeds and gossip
//! - Peers whose genesis matches are promoted and probed every tick
//! - The consensus cursor advances by exponential search over the digests
//!   peers report ahead of it, and rolls back when every peer disputes it
//! - Consumers see only the peers currently agreeing with the cursor

pub mod cursor;
pub mod directory;
pub mod error;
pub mod peer;
pub mod tracker;
pub mod transport;
pub mod types;

#[cfg(any(test, feature = "test-util"))]
pub mod mock;

pub use cursor::{Advance, ConsensusCursor, Ratio, SKIP_STEP};
pub use directory::{normalize_url, Discovery, PeerDirectory};
pub use error::PeerError;
pub use peer::{BuildInfo, LatencyEma, PeerState};
pub use tracker::{ConsensusTracker, CurrentPeers};
pub use transport::{HttpTransport, PeerTransport};
pub use types::{TrackerConfig, TrackerEvent, TrackerStats};
