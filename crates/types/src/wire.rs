//! JSON shapes exchanged with peers over HTTP
//!
//! Field names follow what peers put on the wire, which is why several
//! structs carry camelCase renames.

use crate::chain::{Digest, PeerId};
use crate::transaction::HistoryEntry;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// `GET /` - who a peer is and which chain it follows
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeInfo {
    #[serde(rename = "minerID")]
    pub miner_id: PeerId,
    pub genesis: Digest,
    #[serde(default)]
    pub identity: String,
    #[serde(default)]
    pub build: String,
    #[serde(default)]
    pub commit: String,
    #[serde(default)]
    pub accepted_release: String,
    #[serde(default)]
    pub next_release: String,
}

/// `GET /miners`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerList {
    #[serde(default)]
    pub miners: Vec<String>,
}

/// A header as far as this client cares about it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeaderSummary {
    pub digest: Digest,
}

/// Query of `GET /consensus/peek`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PeekQuery {
    pub peek: u64,
    pub prev: u64,
    pub sample_miners: usize,
}

/// Reply of `GET /consensus/peek`
///
/// `prev`/`peek` are absent when the peer has no header at that height.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PeekResponse {
    pub genesis: Digest,
    #[serde(rename = "minerID")]
    pub miner_id: PeerId,
    pub total_blocks: u64,
    #[serde(default)]
    pub prev: Option<HeaderSummary>,
    #[serde(default)]
    pub peek: Option<HeaderSummary>,
    #[serde(default)]
    pub miners: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountRecord {
    pub nonce: u64,
}

/// `GET /accounts/{id}`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountResponse {
    pub account: AccountRecord,
}

/// `PUT /accounts/{id}/transactions/{uuid}`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PutTransactionResponse {
    pub status: String,
}

/// A peer's view of one transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RemoteTxStatus {
    Accepted,
    Rejected,
    Ignored,
    #[serde(other)]
    Unknown,
}

/// `GET /accounts/{id}/transactions/{uuid}`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionStatusResponse {
    pub status: RemoteTxStatus,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub uuid: Option<Uuid>,
}

/// Query of `GET /accounts/{id}/log`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogQuery {
    pub base: u64,
}

/// Reply of `GET /accounts/{id}/log`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AccountLogResponse {
    #[serde(default)]
    pub entries: Vec<HistoryEntry>,
    pub log_size: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_peek_response_without_headers() {
        let raw = r#"{
            "genesis": "g0",
            "minerID": "m-7",
            "totalBlocks": 41,
            "prev": {"digest": "d40", "height": 40},
            "miners": ["http://a:1/"]
        }"#;
        let parsed: PeekResponse = serde_json::from_str(raw).unwrap();
        assert_eq!(parsed.miner_id.as_str(), "m-7");
        assert_eq!(parsed.prev.unwrap().digest.as_str(), "d40");
        assert!(parsed.peek.is_none());
        assert_eq!(parsed.miners.len(), 1);
    }

    #[test]
    fn test_unrecognized_remote_status_is_unknown() {
        let parsed: TransactionStatusResponse =
            serde_json::from_str(r#"{"status": "SOMETHING_NEW"}"#).unwrap();
        assert_eq!(parsed.status, RemoteTxStatus::Unknown);

        let parsed: TransactionStatusResponse =
            serde_json::from_str(r#"{"status": "REJECTED", "message": "bad nonce"}"#).unwrap();
        assert_eq!(parsed.status, RemoteTxStatus::Rejected);
        assert_eq!(parsed.message.as_deref(), Some("bad nonce"));
    }

    #[test]
    fn test_peek_query_names() {
        let query = PeekQuery {
            peek: 12,
            prev: 11,
            sample_miners: 16,
        };
        let value = serde_json::to_value(query).unwrap();
        assert_eq!(value["sampleMiners"], 16);
    }
}
