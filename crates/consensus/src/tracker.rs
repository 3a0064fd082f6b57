//! Peer Consensus Tracker
//!
//! Owns one [`PeerState`] per promoted peer and the process-wide
//! [`ConsensusCursor`]. A tick is `discover_peers` -> `refresh_peers` ->
//! `advance`; probes to distinct peers run concurrently as spawned tasks so a
//! dropped tick never strands a peer in the `busy` state.

use crate::cursor::{Advance, ConsensusCursor};
use crate::directory::PeerDirectory;
use crate::error::PeerError;
use crate::peer::{BuildInfo, LatencyEma, PeerState};
use crate::transport::PeerTransport;
use crate::types::{TrackerConfig, TrackerEvent, TrackerStats};
use dashmap::DashMap;
use futures::future::join_all;
use light_types::wire::{NodeInfo, PeekQuery};
use light_types::PeerId;
use parking_lot::RwLock;
use rand::seq::SliceRandom;
use std::future::Future;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{broadcast, Mutex};
use url::Url;

/// Read-only view of the peers that agree with the cursor
///
/// This is all the transaction queue ever sees of the tracker.
pub trait CurrentPeers: Send + Sync {
    /// Root URLs of the online, non-ignored peers agreeing with the cursor
    fn current_peer_urls(&self) -> Vec<String>;

    /// A URL on one random current peer, pinned to the cursor height unless
    /// `most_current` is set
    fn service_url(&self, path: &str, query: &[(&str, String)], most_current: bool) -> Option<Url>;
}

struct TrackerInner {
    config: TrackerConfig,
    transport: Arc<dyn PeerTransport>,
    directory: PeerDirectory,
    peers: DashMap<PeerId, PeerState>,
    cursor: RwLock<ConsensusCursor>,
    events: broadcast::Sender<TrackerEvent>,
}

/// Peer Consensus Tracker
#[derive(Clone)]
pub struct ConsensusTracker {
    inner: Arc<TrackerInner>,
    /// Held for the length of a tick; ticks never overlap
    tick_guard: Arc<Mutex<()>>,
}

impl ConsensusTracker {
    /// Create a tracker with no known peers
    pub fn new(config: TrackerConfig, transport: Arc<dyn PeerTransport>) -> Self {
        let cursor = ConsensusCursor::new(config.genesis.clone(), config.threshold);
        let (events, _) = broadcast::channel(256);
        Self {
            inner: Arc::new(TrackerInner {
                config,
                transport,
                directory: PeerDirectory::new(),
                peers: DashMap::new(),
                cursor: RwLock::new(cursor),
                events,
            }),
            tick_guard: Arc::new(Mutex::new(())),
        }
    }

    /// Subscribe to tracker events
    pub fn subscribe(&self) -> broadcast::Receiver<TrackerEvent> {
        self.inner.events.subscribe()
    }

    /// Learn URLs; new ones wait for the next `discover_peers`
    pub fn extend_network<I, S>(&self, urls: I) -> usize
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.inner.directory.extend(urls)
    }

    /// Probe every unprobed URL once and promote the ones on our chain
    ///
    /// Returns how many peers were promoted.
    pub async fn discover_peers(&self) -> usize {
        let urls = self.inner.directory.take_unprobed();
        if urls.is_empty() {
            return 0;
        }
        tracing::debug!("Discovering {} new peer urls", urls.len());

        let handles: Vec<_> = urls
            .into_iter()
            .map(|url| {
                let inner = self.inner.clone();
                tokio::spawn(async move { inner.discover_one(url).await })
            })
            .collect();

        let mut promoted = 0;
        for result in join_all(handles).await {
            match result {
                Ok(true) => promoted += 1,
                Ok(false) => {}
                Err(e) => tracing::warn!("Discovery task failed: {}", e),
            }
        }
        promoted
    }

    /// Ask every idle, non-ignored peer for its headers at the cursor height
    /// and `step` beyond it
    ///
    /// Returns how many peers answered.
    pub async fn refresh_peers(&self) -> usize {
        let query = {
            let cursor = self.inner.cursor.read();
            PeekQuery {
                prev: cursor.height,
                peek: cursor.peek_height(),
                sample_miners: self.inner.config.sample_size,
            }
        };

        let mut targets = Vec::new();
        for mut entry in self.inner.peers.iter_mut() {
            let peer = entry.value_mut();
            if peer.busy || peer.ignored {
                continue;
            }
            peer.busy = true;
            targets.push((peer.id.clone(), peer.url.clone()));
        }

        let handles: Vec<_> = targets
            .into_iter()
            .map(|(id, url)| {
                let inner = self.inner.clone();
                tokio::spawn(async move { inner.probe_one(id, url, query).await })
            })
            .collect();

        let mut answered = 0;
        for result in join_all(handles).await {
            match result {
                Ok(true) => answered += 1,
                Ok(false) => {}
                Err(e) => tracing::warn!("Probe task failed: {}", e),
            }
        }
        answered
    }

    /// Run one consensus step over the current peer reports
    pub fn advance(&self) -> Advance {
        let mut cursor = self.inner.cursor.write();
        let was_current = cursor.is_current;
        let mut snapshot: Vec<PeerState> = self
            .inner
            .peers
            .iter()
            .map(|r| r.value().clone())
            .collect();

        let outcome = cursor.advance(&mut snapshot);

        match &outcome {
            Advance::Advanced { from, to, digest } => {
                for peer in snapshot.iter().filter(|p| p.agrees_with(*to, digest)) {
                    if let Some(mut entry) = self.inner.peers.get_mut(&peer.id) {
                        if entry.confirmed_height < *to {
                            entry.confirm(*to, digest.clone());
                        }
                    }
                }
                tracing::info!(
                    "Consensus advanced {} -> {} ({}), next step {}",
                    from,
                    to,
                    digest,
                    cursor.step
                );
                self.emit(TrackerEvent::Advanced {
                    height: *to,
                    digest: digest.clone(),
                });
            }
            Advance::RolledBack => {
                tracing::warn!("Every reporting peer disagrees with our chain; rolled back to genesis");
                self.emit(TrackerEvent::RolledBack);
            }
            Advance::SkipArmed { count, total } => {
                tracing::debug!(
                    "Majority {}/{} one block ahead, testing a jump to {}",
                    count,
                    total,
                    cursor.peek_height()
                );
            }
            Advance::SkipDiscarded => {
                tracing::debug!("Speculative jump not confirmed at height {}", cursor.height);
            }
            Advance::BackedOff { step } => {
                tracing::trace!("Backed off to step {} at height {}", step, cursor.height);
            }
            Advance::Idle => {
                tracing::trace!("No current peers at height {}", cursor.height);
            }
        }

        if cursor.is_current && !was_current {
            tracing::info!("Caught up at height {}", cursor.height);
            self.emit(TrackerEvent::CaughtUp {
                height: cursor.height,
            });
        }

        outcome
    }

    /// Discover, refresh and advance
    ///
    /// Returns `None` when another tick is still running.
    pub async fn tick(&self) -> Option<Advance> {
        let _guard = match self.tick_guard.try_lock() {
            Ok(guard) => guard,
            Err(_) => {
                tracing::debug!("Previous tracker tick still running, skipping");
                return None;
            }
        };
        self.discover_peers().await;
        self.refresh_peers().await;
        Some(self.advance())
    }

    /// Snapshot of the cursor
    pub fn cursor(&self) -> ConsensusCursor {
        self.inner.cursor.read().clone()
    }

    /// Snapshot of every tracked peer, ordered by id
    pub fn peers(&self) -> Vec<PeerState> {
        let mut peers: Vec<PeerState> = self.inner.peers.iter().map(|r| r.value().clone()).collect();
        peers.sort_by(|a, b| a.id.cmp(&b.id));
        peers
    }

    pub fn peer(&self, id: &PeerId) -> Option<PeerState> {
        self.inner.peers.get(id).map(|r| r.value().clone())
    }

    /// Suppress a peer locally; returns false if it is not tracked
    pub fn ignore_peer(&self, id: &PeerId) -> bool {
        self.set_ignored(id, true)
    }

    pub fn unignore_peer(&self, id: &PeerId) -> bool {
        self.set_ignored(id, false)
    }

    fn set_ignored(&self, id: &PeerId, ignored: bool) -> bool {
        match self.inner.peers.get_mut(id) {
            Some(mut peer) => {
                peer.ignored = ignored;
                tracing::info!("Peer {} ignored={}", id, ignored);
                true
            }
            None => false,
        }
    }

    /// Every URL in the directory, for saving between runs
    pub fn known_urls(&self) -> Vec<String> {
        self.inner.directory.known_urls()
    }

    pub fn stats(&self) -> TrackerStats {
        let cursor = self.inner.cursor.read();
        let mut stats = TrackerStats {
            known_urls: self.inner.directory.len(),
            tracked_peers: self.inner.peers.len(),
            height: cursor.height,
            step: cursor.step,
            is_current: cursor.is_current,
            ..Default::default()
        };
        for peer in self.inner.peers.iter() {
            if peer.online && !peer.ignored {
                stats.online_peers += 1;
            }
            if peer.agrees_with(cursor.height, &cursor.digest) {
                stats.current_peers += 1;
            }
        }
        stats
    }

    fn emit(&self, event: TrackerEvent) {
        self.inner.emit(event);
    }
}

impl TrackerInner {
    fn emit(&self, event: TrackerEvent) {
        // No subscribers is fine
        let _ = self.events.send(event);
    }

    async fn bounded<T, F>(&self, url: &str, request: F) -> Result<T, PeerError>
    where
        F: Future<Output = Result<T, PeerError>>,
    {
        match tokio::time::timeout(self.config.timeout, request).await {
            Ok(result) => result,
            Err(_) => Err(PeerError::Timeout {
                url: url.to_string(),
            }),
        }
    }

    async fn discover_one(&self, url: String) -> bool {
        let info = match self.bounded(&url, self.transport.node_info(&url)).await {
            Ok(info) => info,
            Err(e) => {
                tracing::debug!("Discovery of {} failed: {}", url, e);
                return false;
            }
        };
        if info.genesis != self.config.genesis {
            let e = PeerError::GenesisMismatch {
                url: url.clone(),
                expected: self.config.genesis.clone(),
                found: info.genesis.clone(),
            };
            tracing::warn!("Not promoting peer: {}", e);
            return false;
        }

        self.promote(&url, &info);

        match self.bounded(&url, self.transport.known_peers(&url)).await {
            Ok(list) => {
                let added = self.directory.extend(&list.miners);
                tracing::debug!("Peer {} gossiped {} urls, {} new", url, list.miners.len(), added);
            }
            Err(e) => tracing::debug!("Could not fetch peer list from {}: {}", url, e),
        }
        true
    }

    fn promote(&self, url: &str, info: &NodeInfo) {
        let mut entry = self
            .peers
            .entry(info.miner_id.clone())
            .or_insert_with(|| {
                let mut peer = PeerState::new(info.miner_id.clone(), url);
                peer.latency = LatencyEma::new(self.config.latency_window);
                peer
            });
        entry.url = url.to_string();
        entry.online = true;
        entry.build = BuildInfo::from(info);
        drop(entry);

        tracing::info!("Promoted peer {} at {} (build {})", info.miner_id, url, info.build);
        self.emit(TrackerEvent::PeerPromoted {
            url: url.to_string(),
        });
    }

    async fn probe_one(&self, id: PeerId, url: String, query: PeekQuery) -> bool {
        let started = Instant::now();
        let result = self
            .bounded(&url, self.transport.peek(&url, query))
            .await
            .and_then(|response| {
                if response.genesis == self.config.genesis {
                    Ok(response)
                } else {
                    Err(PeerError::GenesisMismatch {
                        url: url.clone(),
                        expected: self.config.genesis.clone(),
                        found: response.genesis,
                    })
                }
            });
        let elapsed = started.elapsed();

        let mut gossip = Vec::new();
        let mut went_offline = false;
        if let Some(mut peer) = self.peers.get_mut(&id) {
            peer.busy = false;
            match &result {
                Ok(response) => {
                    peer.latency.record(elapsed);
                    peer.online = true;
                    peer.confirmed_height = query.prev;
                    peer.confirmed_digest = response.prev.as_ref().map(|h| h.digest.clone());
                    peer.peek_height = query.peek;
                    peer.peek_digest = response.peek.as_ref().map(|h| h.digest.clone());
                    peer.reported_height = response.total_blocks;
                    gossip = response.miners.clone();
                    gossip.push(peer.url.clone());
                }
                Err(e) => {
                    tracing::debug!("Probe of {} failed: {}", url, e);
                    went_offline = peer.online;
                    peer.online = false;
                }
            }
        }

        if went_offline {
            tracing::info!("Peer {} went offline", url);
            self.emit(TrackerEvent::PeerOffline { url });
        }
        if !gossip.is_empty() {
            self.directory.extend(gossip);
        }
        result.is_ok()
    }
}

impl CurrentPeers for ConsensusTracker {
    fn current_peer_urls(&self) -> Vec<String> {
        let cursor = self.inner.cursor.read();
        let mut urls: Vec<String> = self
            .inner
            .peers
            .iter()
            .filter(|p| p.agrees_with(cursor.height, &cursor.digest))
            .map(|p| p.url.clone())
            .collect();
        urls.sort();
        urls
    }

    fn service_url(&self, path: &str, query: &[(&str, String)], most_current: bool) -> Option<Url> {
        let urls = self.current_peer_urls();
        let root = urls.choose(&mut rand::thread_rng())?;
        let mut url = Url::parse(root).ok()?.join(path.trim_start_matches('/')).ok()?;
        {
            let mut pairs = url.query_pairs_mut();
            for (key, value) in query {
                pairs.append_pair(key, value);
            }
            if !most_current {
                pairs.append_pair("height", &self.inner.cursor.read().height.to_string());
            }
        }
        if url.query() == Some("") {
            url.set_query(None);
        }
        Some(url)
    }
}
