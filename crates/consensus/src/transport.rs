//! How the tracker and the queue talk to peers
//!
//! `PeerTransport` is the seam between the consensus logic and the network;
//! `HttpTransport` speaks the peers' HTTP+JSON contract with reqwest.

use crate::error::PeerError;
use async_trait::async_trait;
use light_types::wire::{
    AccountLogResponse, AccountResponse, NodeInfo, PeekQuery, PeekResponse, PeerList,
    PutTransactionResponse, TransactionStatusResponse,
};
use light_types::Envelope;
use reqwest::Client;
use serde::de::DeserializeOwned;
use std::time::Duration;
use url::Url;
use uuid::Uuid;

/// Requests a light client makes of a peer
///
/// `root` is always a normalized peer root such as `http://host:port/`.
#[async_trait]
pub trait PeerTransport: Send + Sync {
    /// `GET /`
    async fn node_info(&self, root: &str) -> Result<NodeInfo, PeerError>;

    /// `GET /miners`
    async fn known_peers(&self, root: &str) -> Result<PeerList, PeerError>;

    /// `GET /consensus/peek`
    async fn peek(&self, root: &str, query: PeekQuery) -> Result<PeekResponse, PeerError>;

    /// `GET /accounts/{id}`
    async fn account(&self, root: &str, account_id: &str) -> Result<AccountResponse, PeerError>;

    /// `PUT /accounts/{id}/transactions/{uuid}`
    async fn put_transaction(
        &self,
        root: &str,
        account_id: &str,
        uuid: Uuid,
        envelope: &Envelope,
    ) -> Result<PutTransactionResponse, PeerError>;

    /// `GET /accounts/{id}/transactions/{uuid}`
    async fn transaction_status(
        &self,
        root: &str,
        account_id: &str,
        uuid: Uuid,
    ) -> Result<TransactionStatusResponse, PeerError>;

    /// `GET /accounts/{id}/log?base=<n>`, addressed through a service url
    async fn account_log(&self, service_url: &Url) -> Result<AccountLogResponse, PeerError>;
}

/// reqwest-backed transport
#[derive(Clone)]
pub struct HttpTransport {
    client: Client,
}

impl HttpTransport {
    /// Create a transport whose every request gives up after `timeout`
    pub fn new(timeout: Duration) -> Result<Self, PeerError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| PeerError::NetworkUnreachable {
                url: String::new(),
                reason: e.to_string(),
            })?;
        Ok(Self { client })
    }

    /// Create a transport with a custom reqwest client
    pub fn with_client(client: Client) -> Self {
        Self { client }
    }

    fn endpoint(root: &str, path: &str) -> Result<Url, PeerError> {
        Url::parse(root)
            .and_then(|base| base.join(path))
            .map_err(|_| PeerError::InvalidUrl(root.to_string()))
    }

    async fn get_json<T: DeserializeOwned>(&self, url: Url) -> Result<T, PeerError> {
        let shown = url.to_string();
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| classify(&shown, e))?;
        decode(&shown, response).await
    }
}

fn classify(url: &str, error: reqwest::Error) -> PeerError {
    if error.is_timeout() {
        PeerError::Timeout {
            url: url.to_string(),
        }
    } else if error.is_decode() {
        PeerError::BadResponse {
            url: url.to_string(),
            reason: error.to_string(),
        }
    } else {
        PeerError::NetworkUnreachable {
            url: url.to_string(),
            reason: error.to_string(),
        }
    }
}

async fn decode<T: DeserializeOwned>(url: &str, response: reqwest::Response) -> Result<T, PeerError> {
    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        return Err(PeerError::BadResponse {
            url: url.to_string(),
            reason: format!("HTTP {}: {}", status, body),
        });
    }
    response.json().await.map_err(|e| classify(url, e))
}

#[async_trait]
impl PeerTransport for HttpTransport {
    async fn node_info(&self, root: &str) -> Result<NodeInfo, PeerError> {
        self.get_json(Self::endpoint(root, "")?).await
    }

    async fn known_peers(&self, root: &str) -> Result<PeerList, PeerError> {
        self.get_json(Self::endpoint(root, "miners")?).await
    }

    async fn peek(&self, root: &str, query: PeekQuery) -> Result<PeekResponse, PeerError> {
        let mut url = Self::endpoint(root, "consensus/peek")?;
        url.query_pairs_mut()
            .append_pair("peek", &query.peek.to_string())
            .append_pair("prev", &query.prev.to_string())
            .append_pair("sampleMiners", &query.sample_miners.to_string());
        self.get_json(url).await
    }

    async fn account(&self, root: &str, account_id: &str) -> Result<AccountResponse, PeerError> {
        self.get_json(Self::endpoint(root, &format!("accounts/{}", account_id))?)
            .await
    }

    async fn put_transaction(
        &self,
        root: &str,
        account_id: &str,
        uuid: Uuid,
        envelope: &Envelope,
    ) -> Result<PutTransactionResponse, PeerError> {
        let url = Self::endpoint(root, &format!("accounts/{}/transactions/{}", account_id, uuid))?;
        let shown = url.to_string();
        let response = self
            .client
            .put(url)
            .json(envelope)
            .send()
            .await
            .map_err(|e| classify(&shown, e))?;
        decode(&shown, response).await
    }

    async fn transaction_status(
        &self,
        root: &str,
        account_id: &str,
        uuid: Uuid,
    ) -> Result<TransactionStatusResponse, PeerError> {
        self.get_json(Self::endpoint(
            root,
            &format!("accounts/{}/transactions/{}", account_id, uuid),
        )?)
        .await
    }

    async fn account_log(&self, service_url: &Url) -> Result<AccountLogResponse, PeerError> {
        self.get_json(service_url.clone()).await
    }
}
