//! In-memory peers for tests

use crate::directory::normalize_url;
use crate::error::PeerError;
use crate::tracker::CurrentPeers;
use crate::transport::PeerTransport;
use async_trait::async_trait;
use dashmap::DashMap;
use light_types::wire::{
    AccountLogResponse, AccountRecord, AccountResponse, HeaderSummary, NodeInfo, PeekQuery,
    PeekResponse, PeerList, PutTransactionResponse, RemoteTxStatus, TransactionStatusResponse,
};
use light_types::{Digest, Envelope, HistoryEntry, PeerId};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::Duration;
use url::Url;
use uuid::Uuid;

/// Scripted behaviour of one fake peer
#[derive(Debug, Clone)]
pub struct MockPeer {
    pub info: NodeInfo,
    pub online: bool,
    pub miners: Vec<String>,
    /// Digest at each height; index 0 is genesis
    pub chain: Vec<Digest>,
    pub account_nonce: Option<u64>,
    pub statuses: HashMap<Uuid, TransactionStatusResponse>,
    pub log: Vec<HistoryEntry>,
    /// Sleep this long before answering
    pub delay: Option<Duration>,
}

impl MockPeer {
    pub fn new(id: &str, genesis: &Digest) -> Self {
        Self {
            info: NodeInfo {
                miner_id: PeerId::from(id),
                genesis: genesis.clone(),
                identity: format!("{}-identity", id),
                build: "test".into(),
                commit: "0000000".into(),
                accepted_release: "1".into(),
                next_release: "1".into(),
            },
            online: true,
            miners: Vec::new(),
            chain: vec![genesis.clone()],
            account_nonce: None,
            statuses: HashMap::new(),
            log: Vec::new(),
            delay: None,
        }
    }

    /// Extend the chain to `len` blocks with digests `d1`, `d2`, ...
    pub fn with_chain(mut self, len: usize) -> Self {
        while self.chain.len() < len {
            let height = self.chain.len();
            self.chain.push(Digest::new(format!("d{}", height)));
        }
        self
    }

    pub fn with_miners(mut self, miners: &[&str]) -> Self {
        self.miners = miners.iter().map(|m| m.to_string()).collect();
        self
    }

    pub fn with_nonce(mut self, nonce: u64) -> Self {
        self.account_nonce = Some(nonce);
        self
    }

    pub fn set_status(&mut self, uuid: Uuid, status: RemoteTxStatus, message: Option<&str>) {
        self.statuses.insert(
            uuid,
            TransactionStatusResponse {
                status,
                message: message.map(str::to_string),
                uuid: Some(uuid),
            },
        );
    }
}

/// Transport answering from a table of [`MockPeer`]s keyed by root url
#[derive(Default)]
pub struct MockTransport {
    peers: DashMap<String, MockPeer>,
    puts: Mutex<Vec<(String, Uuid)>>,
    polls: Mutex<Vec<(String, Uuid)>>,
    peeks: Mutex<Vec<String>>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, url: &str, peer: MockPeer) {
        let root = normalize_url(url).unwrap_or_else(|| url.to_string());
        self.peers.insert(root, peer);
    }

    /// Mutate a peer in place
    pub fn update(&self, url: &str, change: impl FnOnce(&mut MockPeer)) {
        let root = normalize_url(url).unwrap_or_else(|| url.to_string());
        if let Some(mut peer) = self.peers.get_mut(&root) {
            change(&mut peer);
        }
    }

    /// How many times `uuid` was PUT to `url`
    pub fn puts_to(&self, url: &str, uuid: Uuid) -> usize {
        self.puts
            .lock()
            .iter()
            .filter(|(u, id)| u == url && *id == uuid)
            .count()
    }

    /// How many peek requests reached `url`
    pub fn peeks_to(&self, url: &str) -> usize {
        self.peeks.lock().iter().filter(|u| *u == url).count()
    }

    pub fn polls_to(&self, url: &str, uuid: Uuid) -> usize {
        self.polls
            .lock()
            .iter()
            .filter(|(u, id)| u == url && *id == uuid)
            .count()
    }

    async fn reach(&self, root: &str) -> Result<MockPeer, PeerError> {
        let peer = self
            .peers
            .get(root)
            .map(|p| p.value().clone())
            .ok_or_else(|| PeerError::NetworkUnreachable {
                url: root.to_string(),
                reason: "no such host".into(),
            })?;
        if let Some(delay) = peer.delay {
            tokio::time::sleep(delay).await;
        }
        if !peer.online {
            return Err(PeerError::NetworkUnreachable {
                url: root.to_string(),
                reason: "connection refused".into(),
            });
        }
        Ok(peer)
    }
}

#[async_trait]
impl PeerTransport for MockTransport {
    async fn node_info(&self, root: &str) -> Result<NodeInfo, PeerError> {
        Ok(self.reach(root).await?.info)
    }

    async fn known_peers(&self, root: &str) -> Result<PeerList, PeerError> {
        Ok(PeerList {
            miners: self.reach(root).await?.miners,
        })
    }

    async fn peek(&self, root: &str, query: PeekQuery) -> Result<PeekResponse, PeerError> {
        let peer = self.reach(root).await?;
        self.peeks.lock().push(root.to_string());
        let header = |height: u64| {
            peer.chain
                .get(height as usize)
                .map(|digest| HeaderSummary {
                    digest: digest.clone(),
                })
        };
        Ok(PeekResponse {
            genesis: peer.info.genesis.clone(),
            miner_id: peer.info.miner_id.clone(),
            total_blocks: peer.chain.len() as u64,
            prev: header(query.prev),
            peek: header(query.peek),
            miners: peer.miners.iter().take(query.sample_miners).cloned().collect(),
        })
    }

    async fn account(&self, root: &str, _account_id: &str) -> Result<AccountResponse, PeerError> {
        let peer = self.reach(root).await?;
        let nonce = peer.account_nonce.ok_or_else(|| PeerError::BadResponse {
            url: root.to_string(),
            reason: "HTTP 404".into(),
        })?;
        Ok(AccountResponse {
            account: AccountRecord { nonce },
        })
    }

    async fn put_transaction(
        &self,
        root: &str,
        _account_id: &str,
        uuid: Uuid,
        _envelope: &Envelope,
    ) -> Result<PutTransactionResponse, PeerError> {
        self.reach(root).await?;
        self.puts.lock().push((root.to_string(), uuid));
        Ok(PutTransactionResponse {
            status: "OK".into(),
        })
    }

    async fn transaction_status(
        &self,
        root: &str,
        _account_id: &str,
        uuid: Uuid,
    ) -> Result<TransactionStatusResponse, PeerError> {
        let peer = self.reach(root).await?;
        self.polls.lock().push((root.to_string(), uuid));
        Ok(peer
            .statuses
            .get(&uuid)
            .cloned()
            .unwrap_or(TransactionStatusResponse {
                status: RemoteTxStatus::Unknown,
                message: None,
                uuid: Some(uuid),
            }))
    }

    async fn account_log(&self, service_url: &Url) -> Result<AccountLogResponse, PeerError> {
        let root = normalize_url(service_url.as_str())
            .ok_or_else(|| PeerError::InvalidUrl(service_url.to_string()))?;
        let peer = self.reach(&root).await?;
        let base = service_url
            .query_pairs()
            .find(|(k, _)| k == "base")
            .and_then(|(_, v)| v.parse::<usize>().ok())
            .unwrap_or(0);
        Ok(AccountLogResponse {
            entries: peer.log.iter().skip(base).cloned().collect(),
            log_size: peer.log.len() as u64,
        })
    }
}

/// Fixed set of current peers at height 0, standing in for a tracker
#[derive(Default)]
pub struct StaticPeers {
    urls: Mutex<Vec<String>>,
}

impl StaticPeers {
    pub fn new(urls: &[&str]) -> Self {
        Self {
            urls: Mutex::new(urls.iter().filter_map(|u| normalize_url(u)).collect()),
        }
    }

    pub fn set(&self, urls: &[&str]) {
        *self.urls.lock() = urls.iter().filter_map(|u| normalize_url(u)).collect();
    }
}

impl CurrentPeers for StaticPeers {
    fn current_peer_urls(&self) -> Vec<String> {
        self.urls.lock().clone()
    }

    fn service_url(&self, path: &str, query: &[(&str, String)], most_current: bool) -> Option<Url> {
        let root = self.urls.lock().first().cloned()?;
        let mut url = Url::parse(&root).ok()?.join(path.trim_start_matches('/')).ok()?;
        {
            let mut pairs = url.query_pairs_mut();
            for (key, value) in query {
                pairs.append_pair(key, value);
            }
            if !most_current {
                pairs.append_pair("height", "0");
            }
        }
        if url.query() == Some("") {
            url.set_query(None);
        }
        Some(url)
    }
}
