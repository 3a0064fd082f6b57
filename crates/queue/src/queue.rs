//! Nonce-ordered transaction broadcast
//!
//! Transactions are staged, signed as a batch with contiguous nonces, and
//! then pushed to the tracker's current peers one at a time: only the active
//! transaction with the lowest nonce is sent and polled each tick. A
//! transaction is final once the account nonce moves past it.

use crate::account::{AccountView, TransactionError};
use crate::error::{QueueError, Result};
use crate::keystore::KeyStore;
use crate::store::{get_json, put_json, Store};
use crate::types::{NonceLookup, ProcessOutcome, QueueConfig, QueueEvent, QueueStats};
use chrono::Utc;
use futures::future::join_all;
use light_consensus::{CurrentPeers, PeerTransport};
use light_types::wire::RemoteTxStatus;
use light_types::{
    Envelope, HistoryEntry, SideEffects, Transaction, TransactionBody, TransactionKind, TxStatus,
};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::broadcast;
use uuid::Uuid;

const QUEUE_TABLE: &str = "queue";
const HISTORY_TABLE: &str = "history";

/// Collaborators a queue is built from
#[derive(Clone)]
pub struct QueueContext {
    /// Read-only view of the peers agreeing with consensus
    pub peers: Arc<dyn CurrentPeers>,
    pub transport: Arc<dyn PeerTransport>,
    pub account: Arc<dyn AccountView>,
    pub keys: Arc<dyn KeyStore>,
    pub store: Arc<dyn Store>,
}

/// The persisted queue row
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct QueueState {
    transactions: Vec<Transaction>,
    /// Peers never agreed on the nonce after a rollback
    #[serde(default)]
    nonce_divergence: bool,
    /// A rollback was seen and not yet reconciled
    #[serde(default)]
    rollback_pending: bool,
}

/// What one peer said this round
enum Reply {
    Delivered,
    Status {
        status: RemoteTxStatus,
        message: Option<String>,
    },
    Failed,
}

#[derive(Default)]
struct Tally {
    responded: u32,
    accepted: u32,
    rejected: u32,
    message: Option<String>,
}

/// Persisted, nonce-ordered queue of wallet transactions
pub struct TransactionQueue {
    config: QueueConfig,
    ctx: QueueContext,
    state: Mutex<QueueState>,
    history: Mutex<Vec<HistoryEntry>>,
    events: broadcast::Sender<QueueEvent>,
    /// Keeps ticks from overlapping
    tick_guard: tokio::sync::Mutex<()>,
}

impl TransactionQueue {
    /// Load queue and history for the configured account
    pub fn load(config: QueueConfig, ctx: QueueContext) -> Result<Self> {
        let state: QueueState =
            get_json(ctx.store.as_ref(), QUEUE_TABLE, &config.account_id)?.unwrap_or_default();
        let history: Vec<HistoryEntry> =
            get_json(ctx.store.as_ref(), HISTORY_TABLE, &config.account_id)?.unwrap_or_default();

        tracing::info!(
            "Loaded queue for {}: {} transactions, {} history entries",
            config.account_id,
            state.transactions.len(),
            history.len()
        );

        let (events, _) = broadcast::channel(256);
        Ok(Self {
            config,
            ctx,
            state: Mutex::new(state),
            history: Mutex::new(history),
            events,
            tick_guard: tokio::sync::Mutex::new(()),
        })
    }

    pub fn subscribe(&self) -> broadcast::Receiver<QueueEvent> {
        self.events.subscribe()
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    /// Body for this account and key
    pub fn new_body(&self, kind: TransactionKind) -> TransactionBody {
        TransactionBody::new(&self.config.account_id, &self.config.key_name, kind)
    }

    /// Append an unsigned transaction
    pub fn stage(&self, body: TransactionBody) -> Result<Uuid> {
        let tx = Transaction::new(body);
        let uuid = tx.uuid;
        {
            let mut state = self.state.lock();
            state.transactions.push(tx);
            self.persist(&state)?;
        }
        tracing::debug!("Staged transaction {}", uuid);
        self.emit(QueueEvent::StatusChanged {
            uuid,
            status: TxStatus::Staged,
        });
        Ok(uuid)
    }

    /// Drop a transaction that has not been signed yet
    pub fn remove_staged(&self, uuid: Uuid) -> Result<Transaction> {
        let mut state = self.state.lock();
        let index = state
            .transactions
            .iter()
            .position(|tx| tx.uuid == uuid && tx.status == TxStatus::Staged)
            .ok_or(QueueError::UnknownTransaction(uuid))?;
        let removed = state.transactions.remove(index);
        self.persist(&state)?;
        Ok(removed)
    }

    /// Sign every staged transaction with nonces `base_nonce, base_nonce + 1, ...`
    /// in queue order
    pub fn submit(&self, password: &str, base_nonce: u64) -> Result<Vec<Uuid>> {
        if let Some(error) = self.ctx.account.transaction_error() {
            return Err(QueueError::TransactionRejected {
                uuid: error.uuid,
                message: error.message,
            });
        }
        {
            let state = self.state.lock();
            if state.nonce_divergence {
                return Err(QueueError::NonceDivergence);
            }
            if state.rollback_pending {
                return Err(QueueError::ConsensusRollback);
            }
        }

        let key = self.ctx.keys.decrypt_key(password, &self.config.sealed_key)?;
        let public_key = key.public_key_base64();
        let now = Utc::now();

        let signed = {
            let mut state = self.state.lock();
            // Sign a copy so a failure part way leaves the queue untouched
            let mut transactions = state.transactions.clone();
            let mut signed = Vec::new();
            for tx in transactions
                .iter_mut()
                .filter(|tx| tx.status == TxStatus::Staged)
            {
                let nonce = base_nonce + signed.len() as u64;
                tx.prepare(nonce, now, self.config.record_window);
                let body = serde_json::to_string(&tx.body)?;
                let signature = key.sign_base64(body.as_bytes());
                tx.envelope = Some(Envelope {
                    body,
                    signature,
                    public_key: public_key.clone(),
                });
                tx.status = TxStatus::Pending;
                signed.push(tx.uuid);
            }
            state.transactions = transactions;
            self.persist(&state)?;
            signed
        };

        if !signed.is_empty() {
            tracing::info!(
                "Signed {} transactions starting at nonce {}",
                signed.len(),
                base_nonce
            );
        }
        for uuid in &signed {
            self.emit(QueueEvent::StatusChanged {
                uuid: *uuid,
                status: TxStatus::Pending,
            });
        }
        Ok(signed)
    }

    /// Nonce the next submitted batch should start at
    pub fn next_nonce(&self) -> Option<u64> {
        let queued = self
            .state
            .lock()
            .transactions
            .iter()
            .filter(|tx| tx.status.is_active())
            .filter_map(|tx| tx.nonce())
            .max()
            .map(|n| n + 1);
        queued.into_iter().chain(self.ctx.account.nonce()).max()
    }

    /// One processing tick
    pub async fn process_once(&self) -> Result<ProcessOutcome> {
        let Ok(_guard) = self.tick_guard.try_lock() else {
            return Ok(ProcessOutcome::Busy);
        };

        if self.needs_recovery() {
            match self.recover().await {
                Ok(Some(_)) => {}
                Ok(None) => return Ok(ProcessOutcome::AwaitingPeers),
                Err(QueueError::NonceDivergence) => return Ok(ProcessOutcome::Paused),
                Err(e) => return Err(e),
            }
        }

        self.reconcile_history().await?;

        if self.ctx.account.transaction_error().is_some() {
            return Ok(ProcessOutcome::Blocked);
        }

        self.accept_final()?;

        let Some(head) = self.head() else {
            return Ok(ProcessOutcome::Idle);
        };
        let envelope = head
            .envelope
            .clone()
            .ok_or_else(|| QueueError::Signing(format!("{} has no envelope", head.uuid)))?;

        let urls = self.ctx.peers.current_peer_urls();
        let replies = join_all(urls.into_iter().map(|url| {
            let targeted = head.targeted_peers.contains(&url);
            self.exchange(url, head.uuid, &envelope, targeted)
        }))
        .await;

        let status = self.settle(head.uuid, replies)?;
        Ok(ProcessOutcome::Processed {
            uuid: head.uuid,
            status,
        })
    }

    /// Ask every current peer for the account nonce until they all agree
    ///
    /// Returns early when the agreed value matches the local nonce, otherwise
    /// the last unanimous value once the rounds run out. With no current
    /// peers it returns at once rather than spending rounds.
    pub async fn find_nonce(&self, account_id: &str) -> NonceLookup {
        let expected = self.ctx.account.nonce();
        let mut agreed = None;

        for round in 0..self.config.nonce_rounds {
            let urls = self.ctx.peers.current_peer_urls();
            if urls.is_empty() {
                return agreed.map_or(NonceLookup::NoPeers, NonceLookup::Agreed);
            }
            let answers = join_all(
                urls.iter()
                    .map(|url| self.ctx.transport.account(url, account_id)),
            )
            .await;
            let nonces: Option<Vec<u64>> = answers
                .into_iter()
                .map(|answer| answer.ok().map(|a| a.account.nonce))
                .collect();

            match nonces.as_deref() {
                Some([first, rest @ ..]) if rest.iter().all(|n| n == first) => {
                    if Some(*first) == expected {
                        return NonceLookup::Agreed(*first);
                    }
                    agreed = Some(*first);
                }
                _ => tracing::debug!("Nonce round {} for {} inconclusive", round + 1, account_id),
            }
            if round + 1 < self.config.nonce_rounds {
                tokio::time::sleep(self.config.nonce_retry_delay).await;
            }
        }
        agreed.map_or(NonceLookup::Disagreed, NonceLookup::Agreed)
    }

    /// Retag accepted transactions at or past `confirmed_nonce` as lost
    pub fn tag_lost_transactions(&self, confirmed_nonce: u64) -> Result<usize> {
        let lost: Vec<Uuid> = {
            let mut state = self.state.lock();
            let mut lost = Vec::new();
            for tx in state.transactions.iter_mut() {
                if tx.status == TxStatus::Accepted
                    && tx.nonce().is_some_and(|n| n >= confirmed_nonce)
                {
                    tx.status = TxStatus::Lost;
                    lost.push(tx.uuid);
                }
            }
            if !lost.is_empty() {
                self.persist(&state)?;
            }
            lost
        };

        for uuid in &lost {
            tracing::warn!("Transaction {} lost to a consensus rollback", uuid);
            self.emit(QueueEvent::StatusChanged {
                uuid: *uuid,
                status: TxStatus::Lost,
            });
        }
        Ok(lost.len())
    }

    /// Note a tracker rollback; the next tick reconciles before sending
    pub fn mark_rollback(&self) -> Result<()> {
        let mut state = self.state.lock();
        state.rollback_pending = true;
        self.persist(&state)?;
        tracing::warn!("Consensus rolled back; nonce reconciliation pending");
        Ok(())
    }

    /// Reconcile the nonce after a rollback and sweep lost transactions
    ///
    /// `None` means no peer agrees with consensus yet; the rollback stays
    /// pending.
    pub async fn recover_after_rollback(&self) -> Result<Option<usize>> {
        let _guard = self.tick_guard.lock().await;
        self.recover().await
    }

    /// Write the nonce peers agree on into the account view
    pub async fn refresh_account(&self) -> Result<Option<u64>> {
        let Some(nonce) = self.find_nonce(&self.config.account_id).await.nonce() else {
            return Ok(None);
        };
        if self.ctx.account.nonce() != Some(nonce) {
            tracing::debug!("Account {} nonce is now {}", self.config.account_id, nonce);
            self.ctx.account.set_nonce(nonce)?;
        }
        Ok(Some(nonce))
    }

    /// Drop the rejected transaction and return blocked ones to staging
    pub fn clear_transaction_error(&self) -> Result<usize> {
        let restaged: Vec<Uuid> = {
            let mut state = self.state.lock();
            state
                .transactions
                .retain(|tx| tx.status != TxStatus::Rejected);
            let mut restaged = Vec::new();
            for tx in state
                .transactions
                .iter_mut()
                .filter(|tx| tx.status == TxStatus::Blocked)
            {
                tx.status = TxStatus::Staged;
                tx.body.nonce = None;
                tx.body.record_by = None;
                tx.envelope = None;
                tx.message = None;
                tx.clear_peer_bookkeeping();
                restaged.push(tx.uuid);
            }
            self.persist(&state)?;
            restaged
        };
        self.ctx.account.set_transaction_error(None)?;

        tracing::info!("Cleared transaction error; {} restaged", restaged.len());
        for uuid in &restaged {
            self.emit(QueueEvent::StatusChanged {
                uuid: *uuid,
                status: TxStatus::Staged,
            });
        }
        Ok(restaged.len())
    }

    pub fn transactions(&self) -> Vec<Transaction> {
        self.state.lock().transactions.clone()
    }

    pub fn transaction(&self, uuid: Uuid) -> Option<Transaction> {
        self.state
            .lock()
            .transactions
            .iter()
            .find(|tx| tx.uuid == uuid)
            .cloned()
    }

    pub fn history(&self) -> Vec<HistoryEntry> {
        self.history.lock().clone()
    }

    pub fn nonce_divergence(&self) -> bool {
        self.state.lock().nonce_divergence
    }

    pub fn stats(&self) -> QueueStats {
        let history = self.history.lock().len();
        let state = self.state.lock();
        let mut stats = QueueStats {
            history,
            nonce_divergence: state.nonce_divergence,
            ..Default::default()
        };
        for tx in &state.transactions {
            match tx.status {
                TxStatus::Staged => stats.staged += 1,
                TxStatus::Pending | TxStatus::Sent | TxStatus::Mixed => stats.active += 1,
                TxStatus::Accepted => stats.accepted += 1,
                TxStatus::Rejected => stats.rejected += 1,
                TxStatus::Blocked => stats.blocked += 1,
                TxStatus::Lost => stats.lost += 1,
                TxStatus::Restored => stats.restored += 1,
            }
        }
        stats
    }

    pub fn flush(&self) -> Result<()> {
        self.ctx.store.flush()?;
        Ok(())
    }

    fn needs_recovery(&self) -> bool {
        let state = self.state.lock();
        state.rollback_pending || state.nonce_divergence
    }

    async fn recover(&self) -> Result<Option<usize>> {
        let nonce = match self.find_nonce(&self.config.account_id).await {
            NonceLookup::Agreed(nonce) => nonce,
            NonceLookup::NoPeers => {
                tracing::debug!(
                    "No current peers yet; nonce reconciliation for {} deferred",
                    self.config.account_id
                );
                return Ok(None);
            }
            NonceLookup::Disagreed => {
                {
                    let mut state = self.state.lock();
                    if !state.nonce_divergence {
                        state.nonce_divergence = true;
                        self.persist(&state)?;
                    }
                }
                tracing::warn!(
                    "Peers disagree on the nonce of {}; queue paused",
                    self.config.account_id
                );
                self.emit(QueueEvent::NonceDivergence);
                return Err(QueueError::NonceDivergence);
            }
        };

        self.ctx.account.set_nonce(nonce)?;
        let lost = self.tag_lost_transactions(nonce)?;
        {
            let mut state = self.state.lock();
            state.nonce_divergence = false;
            state.rollback_pending = false;
            self.persist(&state)?;
        }
        tracing::info!(
            "Recovered from rollback at nonce {} ({} transactions lost)",
            nonce,
            lost
        );
        Ok(Some(lost))
    }

    /// Pull new entries from the peer account log and restore any the queue lacks
    async fn reconcile_history(&self) -> Result<usize> {
        let base = self.history.lock().len();
        let path = format!("accounts/{}/log", self.config.account_id);
        let Some(url) = self
            .ctx
            .peers
            .service_url(&path, &[("base", base.to_string())], false)
        else {
            return Ok(0);
        };

        let log = match self.ctx.transport.account_log(&url).await {
            Ok(log) => log,
            Err(e) => {
                tracing::debug!("History fetch from {} failed: {}", url, e);
                return Ok(0);
            }
        };
        if log.entries.is_empty() {
            return Ok(0);
        }

        let (restored, lost): (Vec<SideEffects>, Vec<Uuid>) = {
            let mut history = self.history.lock();
            if history.len() != base {
                return Ok(0);
            }
            history.extend(log.entries.iter().cloned());
            put_json(
                self.ctx.store.as_ref(),
                HISTORY_TABLE,
                &self.config.account_id,
                &*history,
            )?;

            let mut state = self.state.lock();

            // A recorded nonce can hold only the recorded transaction
            let mut lost = Vec::new();
            for entry in &log.entries {
                for tx in state.transactions.iter_mut() {
                    let holds_nonce = tx.status.is_active() || tx.status == TxStatus::Accepted;
                    if holds_nonce && tx.uuid != entry.uuid && tx.nonce() == Some(entry.nonce) {
                        tx.status = TxStatus::Lost;
                        tx.clear_peer_bookkeeping();
                        lost.push(tx.uuid);
                    }
                }
            }

            let missing: Vec<Transaction> = log
                .entries
                .iter()
                .filter(|entry| !state.transactions.iter().any(|tx| tx.uuid == entry.uuid))
                .map(Transaction::restored)
                .collect();
            if missing.is_empty() && lost.is_empty() {
                return Ok(0);
            }
            let effects = missing.iter().map(|tx| tx.side_effects.clone()).collect();
            state.transactions.extend(missing);
            // Signed transactions by nonce, unsigned ones after them
            state
                .transactions
                .sort_by_key(|tx| (tx.nonce().is_none(), tx.nonce().unwrap_or(0)));
            self.persist(&state)?;
            (effects, lost)
        };

        for effects in &restored {
            self.ctx.account.merge_side_effects(effects)?;
        }
        for uuid in &lost {
            tracing::warn!("Transaction {} lost; its nonce was recorded for another", uuid);
            self.emit(QueueEvent::StatusChanged {
                uuid: *uuid,
                status: TxStatus::Lost,
            });
        }
        if !restored.is_empty() {
            tracing::info!(
                "Restored {} transactions from the account log",
                restored.len()
            );
            self.emit(QueueEvent::Restored {
                count: restored.len(),
            });
        }
        Ok(restored.len())
    }

    /// Accept every active transaction the account nonce has moved past
    fn accept_final(&self) -> Result<()> {
        let Some(account_nonce) = self.ctx.account.nonce() else {
            return Ok(());
        };
        let accepted: Vec<(Uuid, SideEffects)> = {
            let mut state = self.state.lock();
            let mut accepted = Vec::new();
            for tx in state.transactions.iter_mut() {
                if tx.status.is_active() && tx.nonce().is_some_and(|n| n < account_nonce) {
                    tx.status = TxStatus::Accepted;
                    tx.clear_peer_bookkeeping();
                    accepted.push((tx.uuid, tx.side_effects.clone()));
                }
            }
            if !accepted.is_empty() {
                self.persist(&state)?;
            }
            accepted
        };

        for (uuid, effects) in accepted {
            self.ctx.account.merge_side_effects(&effects)?;
            tracing::info!("Transaction {} accepted", uuid);
            self.emit(QueueEvent::StatusChanged {
                uuid,
                status: TxStatus::Accepted,
            });
        }
        Ok(())
    }

    /// Active transaction with the lowest nonce
    fn head(&self) -> Option<Transaction> {
        self.state
            .lock()
            .transactions
            .iter()
            .filter(|tx| tx.status.is_active())
            .min_by_key(|tx| tx.nonce())
            .cloned()
    }

    async fn exchange(
        &self,
        url: String,
        uuid: Uuid,
        envelope: &Envelope,
        targeted: bool,
    ) -> (String, Reply) {
        let transport = &self.ctx.transport;
        let account_id = &self.config.account_id;

        if !targeted {
            return match transport
                .put_transaction(&url, account_id, uuid, envelope)
                .await
            {
                Ok(_) => (url, Reply::Delivered),
                Err(e) => {
                    tracing::debug!("PUT {} to {} failed: {}", uuid, url, e);
                    (url, Reply::Failed)
                }
            };
        }

        match transport.transaction_status(&url, account_id, uuid).await {
            Ok(response) => {
                if response.status == RemoteTxStatus::Unknown {
                    tracing::debug!("{} forgot {}; resending", url, uuid);
                    if let Err(e) = transport
                        .put_transaction(&url, account_id, uuid, envelope)
                        .await
                    {
                        tracing::debug!("Resend of {} to {} failed: {}", uuid, url, e);
                    }
                }
                (
                    url,
                    Reply::Status {
                        status: response.status,
                        message: response.message,
                    },
                )
            }
            Err(e) => {
                tracing::debug!("Status poll of {} at {} failed: {}", uuid, url, e);
                (url, Reply::Failed)
            }
        }
    }

    /// Fold one round of replies into the head transaction's status
    fn settle(&self, uuid: Uuid, replies: Vec<(String, Reply)>) -> Result<TxStatus> {
        let account_nonce = self.ctx.account.nonce();
        let mut changes: Vec<(Uuid, TxStatus)> = Vec::new();
        let mut accepted_effects = None;
        let mut rejection = None;

        let status = {
            let mut state = self.state.lock();
            let index = state
                .transactions
                .iter()
                .position(|tx| tx.uuid == uuid)
                .ok_or(QueueError::UnknownTransaction(uuid))?;

            let tx = &mut state.transactions[index];
            let mut tally = Tally::default();
            for (url, reply) in replies {
                match reply {
                    Reply::Delivered => {
                        tx.targeted_peers.insert(url);
                    }
                    Reply::Status { status, message } => {
                        tally.responded += 1;
                        match status {
                            RemoteTxStatus::Accepted => tally.accepted += 1,
                            RemoteTxStatus::Rejected | RemoteTxStatus::Ignored => {
                                tally.rejected += 1;
                                if message.is_some() {
                                    tally.message = message;
                                }
                            }
                            RemoteTxStatus::Unknown => {}
                        }
                    }
                    Reply::Failed => {}
                }
            }
            tx.accepted_count = tally.accepted;

            let previous = tx.status;
            let is_final = matches!((account_nonce, tx.nonce()), (Some(a), Some(n)) if a > n);
            let next = if is_final {
                TxStatus::Accepted
            } else if tally.rejected > 0 && tally.rejected == tally.responded {
                TxStatus::Rejected
            } else if tally.accepted > 0 && tally.rejected > 0 {
                TxStatus::Mixed
            } else if !tx.targeted_peers.is_empty() {
                TxStatus::Sent
            } else {
                TxStatus::Pending
            };
            tx.status = next;
            if next != previous {
                changes.push((uuid, next));
            }

            match next {
                TxStatus::Accepted => {
                    tx.clear_peer_bookkeeping();
                    accepted_effects = Some(tx.side_effects.clone());
                }
                TxStatus::Rejected => {
                    let message = tally
                        .message
                        .unwrap_or_else(|| "rejected by every responding peer".to_string());
                    tx.message = Some(message.clone());
                    rejection = Some(TransactionError { uuid, message });

                    // Nothing after a rejected nonce can be recorded
                    for other in state.transactions.iter_mut() {
                        if other.uuid != uuid && !other.status.is_terminal() {
                            other.status = TxStatus::Blocked;
                            changes.push((other.uuid, TxStatus::Blocked));
                        }
                    }
                }
                _ => {}
            }

            self.persist(&state)?;
            next
        };

        if let Some(effects) = accepted_effects {
            self.ctx.account.merge_side_effects(&effects)?;
        }
        if let Some(error) = rejection {
            tracing::error!("Transaction {} rejected: {}", uuid, error.message);
            let message = error.message.clone();
            self.ctx.account.set_transaction_error(Some(error))?;
            self.emit(QueueEvent::Blocked { uuid, message });
        }
        for (changed, status) in changes {
            tracing::info!("Transaction {} is now {}", changed, status);
            self.emit(QueueEvent::StatusChanged {
                uuid: changed,
                status,
            });
        }
        Ok(status)
    }

    fn persist(&self, state: &QueueState) -> Result<()> {
        put_json(
            self.ctx.store.as_ref(),
            QUEUE_TABLE,
            &self.config.account_id,
            state,
        )?;
        Ok(())
    }

    fn emit(&self, event: QueueEvent) {
        let _ = self.events.send(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::account::LocalAccount;
    use crate::keystore::PasswordKeyStore;
    use crate::store::MemoryStore;
    use light_consensus::mock::{MockPeer, MockTransport, StaticPeers};
    use light_types::Digest;
    use std::time::Duration;

    const P1: &str = "http://p1.test/";
    const P2: &str = "http://p2.test/";
    const P3: &str = "http://p3.test/";
    const PASSWORD: &str = "correct horse";

    struct Harness {
        queue: TransactionQueue,
        transport: Arc<MockTransport>,
        peers: Arc<StaticPeers>,
        account: Arc<LocalAccount>,
        store: Arc<MemoryStore>,
    }

    fn open(
        store: Arc<MemoryStore>,
        transport: Arc<MockTransport>,
        peers: Arc<StaticPeers>,
        account: Arc<LocalAccount>,
    ) -> TransactionQueue {
        let sealed = PasswordKeyStore::with_cost(8, 1)
            .seal(PASSWORD, &[7u8; 32])
            .unwrap();
        let config =
            QueueConfig::new("acct-1", "main", sealed).with_nonce_retry_delay(Duration::ZERO);
        let ctx = QueueContext {
            peers,
            transport,
            account,
            keys: Arc::new(PasswordKeyStore::new()),
            store,
        };
        TransactionQueue::load(config, ctx).unwrap()
    }

    fn harness(urls: &[&str]) -> Harness {
        let transport = Arc::new(MockTransport::new());
        let genesis = Digest::from("genesis");
        for (i, url) in urls.iter().enumerate() {
            transport.add(url, MockPeer::new(&format!("peer-{}", i), &genesis));
        }
        let peers = Arc::new(StaticPeers::new(urls));
        let store = Arc::new(MemoryStore::new());
        let account = Arc::new(LocalAccount::new("acct-1"));
        let queue = open(store.clone(), transport.clone(), peers.clone(), account.clone());
        Harness {
            queue,
            transport,
            peers,
            account,
            store,
        }
    }

    fn transfer(queue: &TransactionQueue, amount: u64) -> Uuid {
        let body = queue.new_body(TransactionKind::Transfer {
            recipient: "acct-2".into(),
            amount,
        });
        queue.stage(body).unwrap()
    }

    fn status_of(queue: &TransactionQueue, uuid: Uuid) -> TxStatus {
        queue.transaction(uuid).unwrap().status
    }

    #[tokio::test]
    async fn test_submit_assigns_contiguous_nonces_in_queue_order() {
        let h = harness(&[]);
        let ids: Vec<Uuid> = (1..=3).map(|n| transfer(&h.queue, n)).collect();

        let before = Utc::now();
        let signed = h.queue.submit(PASSWORD, 5).unwrap();
        let after = Utc::now();
        assert_eq!(signed, ids);

        let txs = h.queue.transactions();
        let nonces: Vec<Option<u64>> = txs.iter().map(|tx| tx.nonce()).collect();
        assert_eq!(nonces, vec![Some(5), Some(6), Some(7)]);
        for tx in &txs {
            assert_eq!(tx.status, TxStatus::Pending);
            let record_by = tx.body.record_by.unwrap();
            assert!(record_by >= before + chrono::Duration::hours(8));
            assert!(record_by <= after + chrono::Duration::hours(8));
            let envelope = tx.envelope.as_ref().unwrap();
            let body: TransactionBody = serde_json::from_str(&envelope.body).unwrap();
            assert_eq!(body, tx.body);
        }
        assert_eq!(h.queue.next_nonce(), Some(8));
    }

    #[tokio::test]
    async fn test_wrong_password_leaves_batch_unsigned() {
        let h = harness(&[]);
        transfer(&h.queue, 1);
        transfer(&h.queue, 2);

        assert!(matches!(
            h.queue.submit("wrong", 5),
            Err(QueueError::InvalidPassword)
        ));
        for tx in h.queue.transactions() {
            assert_eq!(tx.status, TxStatus::Staged);
            assert!(tx.nonce().is_none());
            assert!(tx.envelope.is_none());
        }
    }

    #[tokio::test]
    async fn test_first_round_puts_then_later_rounds_poll() {
        let h = harness(&[P1, P2]);
        let uuid = transfer(&h.queue, 1);
        h.queue.submit(PASSWORD, 5).unwrap();

        let outcome = h.queue.process_once().await.unwrap();
        assert_eq!(
            outcome,
            ProcessOutcome::Processed {
                uuid,
                status: TxStatus::Sent
            }
        );
        assert_eq!(h.transport.puts_to(P1, uuid), 1);
        assert_eq!(h.transport.puts_to(P2, uuid), 1);
        assert_eq!(h.transport.polls_to(P1, uuid), 0);

        for url in [P1, P2] {
            h.transport
                .update(url, |p| p.set_status(uuid, RemoteTxStatus::Accepted, None));
        }
        h.queue.process_once().await.unwrap();
        let tx = h.queue.transaction(uuid).unwrap();
        assert_eq!(tx.accepted_count, 2);
        // Votes alone do not finalize
        assert_eq!(tx.status, TxStatus::Sent);
        assert_eq!(h.transport.puts_to(P1, uuid), 1);
    }

    #[tokio::test]
    async fn test_unknown_status_triggers_exactly_one_resend() {
        let h = harness(&[P1]);
        let uuid = transfer(&h.queue, 1);
        h.queue.submit(PASSWORD, 0).unwrap();

        h.queue.process_once().await.unwrap();
        assert_eq!(h.transport.puts_to(P1, uuid), 1);

        // The mock answers UNKNOWN for anything without a scripted status
        h.queue.process_once().await.unwrap();
        assert_eq!(h.transport.polls_to(P1, uuid), 1);
        assert_eq!(h.transport.puts_to(P1, uuid), 2);

        h.queue.process_once().await.unwrap();
        assert_eq!(h.transport.puts_to(P1, uuid), 3);
    }

    #[tokio::test]
    async fn test_unanimous_rejection_blocks_the_rest() {
        let h = harness(&[P1, P2]);
        let mut events = h.queue.subscribe();
        let ids: Vec<Uuid> = (1..=3).map(|n| transfer(&h.queue, n)).collect();
        h.queue.submit(PASSWORD, 5).unwrap();

        h.queue.process_once().await.unwrap();
        for url in [P1, P2] {
            h.transport.update(url, |p| {
                p.set_status(ids[0], RemoteTxStatus::Rejected, Some("insufficient funds"))
            });
        }
        h.queue.process_once().await.unwrap();

        assert_eq!(status_of(&h.queue, ids[0]), TxStatus::Rejected);
        assert_eq!(status_of(&h.queue, ids[1]), TxStatus::Blocked);
        assert_eq!(status_of(&h.queue, ids[2]), TxStatus::Blocked);
        let error = h.account.transaction_error().unwrap();
        assert_eq!(error.uuid, ids[0]);
        assert_eq!(error.message, "insufficient funds");

        let mut saw_blocked = false;
        while let Ok(event) = events.try_recv() {
            if let QueueEvent::Blocked { uuid, .. } = event {
                saw_blocked = uuid == ids[0];
            }
        }
        assert!(saw_blocked);

        assert_eq!(
            h.queue.process_once().await.unwrap(),
            ProcessOutcome::Blocked
        );
        transfer(&h.queue, 4);
        assert!(matches!(
            h.queue.submit(PASSWORD, 5),
            Err(QueueError::TransactionRejected { .. })
        ));

        assert_eq!(h.queue.clear_transaction_error().unwrap(), 2);
        assert!(h.account.transaction_error().is_none());
        assert!(h.queue.transaction(ids[0]).is_none());
        assert_eq!(status_of(&h.queue, ids[1]), TxStatus::Staged);
        assert!(h.queue.transaction(ids[1]).unwrap().nonce().is_none());

        h.queue.submit(PASSWORD, 5).unwrap();
        let nonces: Vec<Option<u64>> = h.queue.transactions().iter().map(|tx| tx.nonce()).collect();
        assert_eq!(nonces, vec![Some(5), Some(6), Some(7)]);
    }

    #[tokio::test]
    async fn test_rejection_ignores_silent_peers_but_counts_unknown() {
        let h = harness(&[P1, P2]);
        let uuid = transfer(&h.queue, 1);
        h.queue.submit(PASSWORD, 0).unwrap();
        h.queue.process_once().await.unwrap();

        // P1 rejects, P2 has forgotten the transaction
        h.transport
            .update(P1, |p| p.set_status(uuid, RemoteTxStatus::Rejected, None));
        h.queue.process_once().await.unwrap();
        assert_eq!(status_of(&h.queue, uuid), TxStatus::Sent);

        // P2 goes dark; the only responder rejects
        h.transport.update(P2, |p| p.online = false);
        h.queue.process_once().await.unwrap();
        assert_eq!(status_of(&h.queue, uuid), TxStatus::Rejected);
    }

    #[tokio::test]
    async fn test_split_votes_are_mixed_and_repolled() {
        let h = harness(&[P1, P2]);
        let uuid = transfer(&h.queue, 1);
        h.queue.submit(PASSWORD, 0).unwrap();
        h.queue.process_once().await.unwrap();

        h.transport
            .update(P1, |p| p.set_status(uuid, RemoteTxStatus::Accepted, None));
        h.transport
            .update(P2, |p| p.set_status(uuid, RemoteTxStatus::Rejected, Some("stale")));
        h.queue.process_once().await.unwrap();
        assert_eq!(status_of(&h.queue, uuid), TxStatus::Mixed);
        assert!(h.account.transaction_error().is_none());

        h.transport
            .update(P2, |p| p.set_status(uuid, RemoteTxStatus::Accepted, None));
        h.queue.process_once().await.unwrap();
        assert_eq!(status_of(&h.queue, uuid), TxStatus::Sent);
        assert_eq!(h.transport.polls_to(P2, uuid), 2);
    }

    #[tokio::test]
    async fn test_account_nonce_finalizes_without_votes() {
        let h = harness(&[]);
        let body = h.queue.new_body(TransactionKind::ReserveAssets {
            asset_ids: vec!["sword".into()],
        });
        let uuid = h.queue.stage(body).unwrap();
        h.queue.submit(PASSWORD, 5).unwrap();
        assert_eq!(status_of(&h.queue, uuid), TxStatus::Pending);

        h.account.set_nonce(6).unwrap();
        assert_eq!(h.queue.process_once().await.unwrap(), ProcessOutcome::Idle);
        assert_eq!(status_of(&h.queue, uuid), TxStatus::Accepted);
        assert!(h.account.is_reserved("sword"));
    }

    #[tokio::test]
    async fn test_find_nonce_needs_every_peer_to_agree() {
        let h = harness(&[P1, P2, P3]);
        for (url, nonce) in [(P1, 5), (P2, 5), (P3, 6)] {
            h.transport.update(url, |p| p.account_nonce = Some(nonce));
        }
        assert_eq!(h.queue.find_nonce("acct-1").await, NonceLookup::Disagreed);
        assert_eq!(h.queue.refresh_account().await.unwrap(), None);
        assert_eq!(h.account.nonce(), None);

        h.transport.update(P3, |p| p.account_nonce = Some(5));
        assert_eq!(h.queue.find_nonce("acct-1").await, NonceLookup::Agreed(5));

        // A silent peer makes the round inconclusive
        h.transport.update(P2, |p| p.online = false);
        assert_eq!(h.queue.find_nonce("acct-1").await, NonceLookup::Disagreed);

        h.peers.set(&[P1, P3]);
        assert_eq!(h.queue.refresh_account().await.unwrap(), Some(5));

        h.peers.set(&[]);
        assert_eq!(h.queue.find_nonce("acct-1").await, NonceLookup::NoPeers);
        assert_eq!(h.account.nonce(), Some(5));
    }

    #[tokio::test]
    async fn test_rollback_tags_lost_and_pauses_on_divergence() {
        let h = harness(&[P1, P2]);
        let first = transfer(&h.queue, 1);
        let second = transfer(&h.queue, 2);
        h.queue.submit(PASSWORD, 5).unwrap();
        h.account.set_nonce(7).unwrap();
        h.queue.process_once().await.unwrap();
        assert_eq!(status_of(&h.queue, first), TxStatus::Accepted);
        assert_eq!(status_of(&h.queue, second), TxStatus::Accepted);

        h.queue.mark_rollback().unwrap();
        h.transport.update(P1, |p| p.account_nonce = Some(5));
        h.transport.update(P2, |p| p.account_nonce = Some(6));
        assert_eq!(
            h.queue.process_once().await.unwrap(),
            ProcessOutcome::Paused
        );
        assert!(h.queue.nonce_divergence());
        transfer(&h.queue, 3);
        assert!(matches!(
            h.queue.submit(PASSWORD, 7),
            Err(QueueError::NonceDivergence)
        ));

        h.transport.update(P1, |p| p.account_nonce = Some(6));
        h.queue.process_once().await.unwrap();
        assert!(!h.queue.nonce_divergence());
        assert_eq!(h.account.nonce(), Some(6));
        assert_eq!(status_of(&h.queue, first), TxStatus::Accepted);
        assert_eq!(status_of(&h.queue, second), TxStatus::Lost);
    }

    #[tokio::test]
    async fn test_rollback_without_current_peers_waits_instead_of_diverging() {
        let h = harness(&[P1, P2]);
        let mut events = h.queue.subscribe();
        let first = transfer(&h.queue, 1);
        let second = transfer(&h.queue, 2);
        h.queue.submit(PASSWORD, 3).unwrap();
        h.account.set_nonce(5).unwrap();
        h.queue.process_once().await.unwrap();

        // A rollback leaves nobody agreeing with the cursor for a while
        h.queue.mark_rollback().unwrap();
        h.peers.set(&[]);
        for _ in 0..2 {
            assert_eq!(
                h.queue.process_once().await.unwrap(),
                ProcessOutcome::AwaitingPeers
            );
        }
        assert!(!h.queue.nonce_divergence());
        assert_eq!(h.queue.refresh_account().await.unwrap(), None);
        assert!(matches!(
            h.queue.submit(PASSWORD, 5),
            Err(QueueError::ConsensusRollback)
        ));

        h.peers.set(&[P1, P2]);
        for url in [P1, P2] {
            h.transport.update(url, |p| p.account_nonce = Some(4));
        }
        assert_eq!(h.queue.recover_after_rollback().await.unwrap(), Some(1));
        assert_eq!(status_of(&h.queue, first), TxStatus::Accepted);
        assert_eq!(status_of(&h.queue, second), TxStatus::Lost);
        assert_eq!(h.queue.process_once().await.unwrap(), ProcessOutcome::Idle);

        while let Ok(event) = events.try_recv() {
            assert_ne!(event, QueueEvent::NonceDivergence);
        }
    }

    #[tokio::test]
    async fn test_recorded_nonce_held_by_another_transaction_is_lost() {
        let h = harness(&[P1]);
        let local = transfer(&h.queue, 1);
        h.queue.submit(PASSWORD, 3).unwrap();

        let recorded = HistoryEntry {
            uuid: Uuid::new_v4(),
            nonce: 3,
            body: h.queue.new_body(TransactionKind::Transfer {
                recipient: "acct-3".into(),
                amount: 7,
            }),
        };
        h.transport.update(P1, |p| p.log = vec![recorded.clone()]);

        h.queue.process_once().await.unwrap();
        assert_eq!(status_of(&h.queue, local), TxStatus::Lost);
        assert_eq!(status_of(&h.queue, recorded.uuid), TxStatus::Restored);

        // Finality past the nonce does not resurrect it
        h.account.set_nonce(4).unwrap();
        assert_eq!(h.queue.process_once().await.unwrap(), ProcessOutcome::Idle);
        assert_eq!(status_of(&h.queue, local), TxStatus::Lost);
    }

    #[tokio::test]
    async fn test_history_restores_missing_transactions_in_nonce_order() {
        let h = harness(&[P1]);
        let staged = transfer(&h.queue, 9);

        let entries: Vec<HistoryEntry> = [3u64, 4]
            .iter()
            .map(|&nonce| HistoryEntry {
                uuid: Uuid::new_v4(),
                nonce,
                body: h.queue.new_body(TransactionKind::ConsumeAssets {
                    asset_ids: vec![format!("gem-{}", nonce)],
                }),
            })
            .collect();
        h.transport.update(P1, |p| p.log = entries.clone());

        h.queue.process_once().await.unwrap();
        let txs = h.queue.transactions();
        assert_eq!(txs.len(), 3);
        assert_eq!(txs[0].uuid, entries[0].uuid);
        assert_eq!(txs[0].status, TxStatus::Restored);
        assert_eq!(txs[1].nonce(), Some(4));
        assert_eq!(txs[2].uuid, staged);
        assert_eq!(h.queue.history().len(), 2);
        assert!(h.account.state().consumed.contains("gem-3"));

        // Paging from the known length fetches nothing new
        h.queue.process_once().await.unwrap();
        assert_eq!(h.queue.transactions().len(), 3);
        assert_eq!(h.queue.stats().restored, 2);
    }

    #[tokio::test]
    async fn test_queue_survives_reload() {
        let h = harness(&[P1]);
        let kept = transfer(&h.queue, 1);
        let dropped = transfer(&h.queue, 2);
        h.queue.remove_staged(dropped).unwrap();
        assert!(matches!(
            h.queue.remove_staged(dropped),
            Err(QueueError::UnknownTransaction(_))
        ));
        h.queue.submit(PASSWORD, 1).unwrap();
        h.queue.process_once().await.unwrap();
        h.queue.mark_rollback().unwrap();

        let reopened = open(
            h.store.clone(),
            h.transport.clone(),
            h.peers.clone(),
            h.account.clone(),
        );
        assert_eq!(reopened.transactions(), h.queue.transactions());
        let tx = reopened.transaction(kept).unwrap();
        assert_eq!(tx.status, TxStatus::Sent);
        assert!(tx.targeted_peers.contains(P1));
        assert!(matches!(
            reopened.submit(PASSWORD, 2),
            Err(QueueError::ConsensusRollback)
        ));
    }
}
