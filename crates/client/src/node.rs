//! Tracker, queue and storage wired together for the service loop

use crate::config::ClientConfig;
use anyhow::{Context, Result};
use light_consensus::{Advance, ConsensusTracker, PeerTransport, TrackerStats};
use light_queue::{
    get_json, put_json, LocalAccount, PasswordKeyStore, ProcessOutcome, QueueContext, Store,
    TransactionQueue,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

const PEERS_TABLE: &str = "peers";
const CHECKPOINT_TABLE: &str = "checkpoint";
const KNOWN_KEY: &str = "known";

/// Last cursor position saved on shutdown
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub height: u64,
    pub digest: String,
    pub is_current: bool,
    pub saved_at: i64,
}

/// What one service tick did
#[derive(Debug)]
pub struct TickReport {
    /// `None` when the previous tracker tick was still running
    pub advance: Option<Advance>,
    pub nonce: Option<u64>,
    pub outcome: ProcessOutcome,
}

/// A running light client
pub struct LightNode {
    pub tracker: ConsensusTracker,
    pub queue: Arc<TransactionQueue>,
    pub account: Arc<LocalAccount>,
    store: Arc<dyn Store>,
}

impl LightNode {
    pub fn open(
        config: &ClientConfig,
        transport: Arc<dyn PeerTransport>,
        store: Arc<dyn Store>,
    ) -> Result<Self> {
        let tracker = ConsensusTracker::new(config.tracker_config(), transport.clone());

        let saved: Vec<String> =
            get_json(store.as_ref(), PEERS_TABLE, KNOWN_KEY)?.unwrap_or_default();
        let added = tracker.extend_network(config.seeds.iter().chain(saved.iter()));
        tracing::info!("Peer directory seeded with {} urls", added);

        let sealed_key = match std::fs::read(&config.key_file) {
            Ok(bytes) => bytes,
            Err(e) => {
                tracing::warn!(
                    "No signing key at {:?} ({}); signing is disabled",
                    config.key_file,
                    e
                );
                Vec::new()
            }
        };

        let account = Arc::new(
            LocalAccount::load(&config.account_id, store.clone()).context("loading account")?,
        );
        let ctx = QueueContext {
            peers: Arc::new(tracker.clone()),
            transport,
            account: account.clone(),
            keys: Arc::new(PasswordKeyStore::new()),
            store: store.clone(),
        };
        let queue = Arc::new(
            TransactionQueue::load(config.queue_config(sealed_key), ctx)
                .context("loading transaction queue")?,
        );

        Ok(Self {
            tracker,
            queue,
            account,
            store,
        })
    }

    /// Advance consensus, then reconcile the account and work the queue
    pub async fn service_tick(&self) -> Result<TickReport> {
        let advance = self.tracker.tick().await;
        if let Some(Advance::RolledBack) = advance {
            self.queue.mark_rollback()?;
        }

        let nonce = self.queue.refresh_account().await?;
        let outcome = self.queue.process_once().await?;
        Ok(TickReport {
            advance,
            nonce,
            outcome,
        })
    }

    /// Run ticks until some peer agrees with the cursor
    pub async fn sync(&self, max_ticks: usize) -> TrackerStats {
        for _ in 0..max_ticks {
            self.tracker.tick().await;
            if self.tracker.stats().current_peers > 0 {
                break;
            }
        }
        self.tracker.stats()
    }

    pub fn checkpoint(&self) -> Result<Option<Checkpoint>> {
        Ok(get_json(self.store.as_ref(), CHECKPOINT_TABLE, KNOWN_KEY)?)
    }

    /// Persist known peers and the cursor, then flush
    pub fn save(&self) -> Result<()> {
        let cursor = self.tracker.cursor();
        let checkpoint = Checkpoint {
            height: cursor.height,
            digest: cursor.digest.to_string(),
            is_current: cursor.is_current,
            saved_at: chrono::Utc::now().timestamp(),
        };
        put_json(
            self.store.as_ref(),
            PEERS_TABLE,
            KNOWN_KEY,
            &self.tracker.known_urls(),
        )?;
        put_json(self.store.as_ref(), CHECKPOINT_TABLE, KNOWN_KEY, &checkpoint)?;
        self.store.flush()?;
        tracing::info!("Saved checkpoint at height {}", checkpoint.height);
        Ok(())
    }
}
