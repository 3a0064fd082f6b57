//! HTTP transport and tracker against peers served by axum on loopback

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    routing::get,
    Json, Router,
};
use light_consensus::{
    ConsensusTracker, CurrentPeers, HttpTransport, PeerError, PeerTransport, TrackerConfig,
};
use light_types::wire::{
    AccountLogResponse, AccountRecord, AccountResponse, HeaderSummary, LogQuery, NodeInfo,
    PeekQuery, PeekResponse, PeerList, PutTransactionResponse, RemoteTxStatus,
    TransactionStatusResponse,
};
use light_types::{Digest, Envelope, PeerId};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

struct Fixture {
    id: String,
    genesis: Digest,
    chain_len: u64,
    miners: Mutex<Vec<String>>,
    puts: Mutex<Vec<(Uuid, Envelope)>>,
}

impl Fixture {
    fn digest(&self, height: u64) -> Option<HeaderSummary> {
        if height == 0 {
            Some(HeaderSummary {
                digest: self.genesis.clone(),
            })
        } else if height < self.chain_len {
            Some(HeaderSummary {
                digest: Digest::new(format!("d{}", height)),
            })
        } else {
            None
        }
    }
}

async fn root(State(f): State<Arc<Fixture>>) -> Json<NodeInfo> {
    Json(NodeInfo {
        miner_id: PeerId::new(f.id.clone()),
        genesis: f.genesis.clone(),
        identity: f.id.clone(),
        build: "42".into(),
        commit: "abc".into(),
        accepted_release: "7".into(),
        next_release: "8".into(),
    })
}

async fn miners(State(f): State<Arc<Fixture>>) -> Json<PeerList> {
    Json(PeerList {
        miners: f.miners.lock().clone(),
    })
}

async fn peek(State(f): State<Arc<Fixture>>, Query(q): Query<PeekQuery>) -> Json<PeekResponse> {
    Json(PeekResponse {
        genesis: f.genesis.clone(),
        miner_id: PeerId::new(f.id.clone()),
        total_blocks: f.chain_len,
        prev: f.digest(q.prev),
        peek: f.digest(q.peek),
        miners: f.miners.lock().iter().take(q.sample_miners).cloned().collect(),
    })
}

async fn account(Path(id): Path<String>) -> Result<Json<AccountResponse>, StatusCode> {
    if id == "acct-1" {
        Ok(Json(AccountResponse {
            account: AccountRecord { nonce: 9 },
        }))
    } else {
        Err(StatusCode::NOT_FOUND)
    }
}

async fn put_tx(
    State(f): State<Arc<Fixture>>,
    Path((_id, uuid)): Path<(String, Uuid)>,
    Json(envelope): Json<Envelope>,
) -> Json<PutTransactionResponse> {
    f.puts.lock().push((uuid, envelope));
    Json(PutTransactionResponse {
        status: "OK".into(),
    })
}

async fn get_tx(
    State(f): State<Arc<Fixture>>,
    Path((_id, uuid)): Path<(String, Uuid)>,
) -> Json<TransactionStatusResponse> {
    let known = f.puts.lock().iter().any(|(u, _)| *u == uuid);
    Json(TransactionStatusResponse {
        status: if known {
            RemoteTxStatus::Accepted
        } else {
            RemoteTxStatus::Unknown
        },
        message: None,
        uuid: Some(uuid),
    })
}

async fn log(Query(q): Query<LogQuery>) -> Json<AccountLogResponse> {
    Json(AccountLogResponse {
        entries: Vec::new(),
        log_size: q.base,
    })
}

/// Serve one fake peer, returning its root url
async fn serve(id: &str, genesis: &str, chain_len: u64) -> (String, Arc<Fixture>) {
    let fixture = Arc::new(Fixture {
        id: id.to_string(),
        genesis: Digest::from(genesis),
        chain_len,
        miners: Mutex::new(Vec::new()),
        puts: Mutex::new(Vec::new()),
    });
    let app = Router::new()
        .route("/", get(root))
        .route("/miners", get(miners))
        .route("/consensus/peek", get(peek))
        .route("/accounts/:id", get(account))
        .route("/accounts/:id/transactions/:uuid", get(get_tx).put(put_tx))
        .route("/accounts/:id/log", get(log))
        .with_state(fixture.clone());

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (format!("http://{}/", addr), fixture)
}

fn transport() -> HttpTransport {
    HttpTransport::new(Duration::from_secs(2)).unwrap()
}

#[tokio::test]
async fn test_http_transport_speaks_the_wire_contract() {
    let (url, fixture) = serve("m1", "g", 5).await;
    let http = transport();

    let info = http.node_info(&url).await.unwrap();
    assert_eq!(info.miner_id.as_str(), "m1");
    assert_eq!(info.accepted_release, "7");

    let peek = http
        .peek(
            &url,
            PeekQuery {
                prev: 2,
                peek: 9,
                sample_miners: 16,
            },
        )
        .await
        .unwrap();
    assert_eq!(peek.prev.unwrap().digest.as_str(), "d2");
    assert!(peek.peek.is_none());
    assert_eq!(peek.total_blocks, 5);

    assert_eq!(http.account(&url, "acct-1").await.unwrap().account.nonce, 9);
    assert!(matches!(
        http.account(&url, "nobody").await,
        Err(PeerError::BadResponse { .. })
    ));

    let uuid = Uuid::new_v4();
    let status = http.transaction_status(&url, "acct-1", uuid).await.unwrap();
    assert_eq!(status.status, RemoteTxStatus::Unknown);

    let envelope = Envelope {
        body: "{}".into(),
        signature: "sig".into(),
        public_key: "pk".into(),
    };
    let put = http.put_transaction(&url, "acct-1", uuid, &envelope).await.unwrap();
    assert_eq!(put.status, "OK");
    assert_eq!(fixture.puts.lock()[0].1, envelope);

    let status = http.transaction_status(&url, "acct-1", uuid).await.unwrap();
    assert_eq!(status.status, RemoteTxStatus::Accepted);

    let log_url = url::Url::parse(&url)
        .unwrap()
        .join("accounts/acct-1/log?base=4")
        .unwrap();
    assert_eq!(http.account_log(&log_url).await.unwrap().log_size, 4);
}

#[tokio::test]
async fn test_unreachable_peer_is_a_network_error() {
    // Bind then drop a listener so the port is very likely closed
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let result = transport().node_info(&format!("http://{}/", addr)).await;
    assert!(matches!(result, Err(PeerError::NetworkUnreachable { .. })));
}

#[tokio::test]
async fn test_tracker_follows_http_peers() {
    let (a, fixture_a) = serve("a", "g", 12).await;
    let (b, _) = serve("b", "g", 12).await;
    let (stranger, _) = serve("s", "other-genesis", 12).await;
    fixture_a.miners.lock().extend([b.clone(), stranger.clone()]);

    let config = TrackerConfig::new(Digest::from("g")).with_timeout(Duration::from_secs(2));
    let tracker = ConsensusTracker::new(config, Arc::new(transport()));
    tracker.extend_network([a.clone()]);

    for _ in 0..12 {
        tracker.tick().await;
    }

    let cursor = tracker.cursor();
    assert_eq!(cursor.height, 11);
    assert_eq!(cursor.digest.as_str(), "d11");
    let mut expected = vec![a, b];
    expected.sort();
    assert_eq!(tracker.current_peer_urls(), expected);
    assert_eq!(tracker.stats().tracked_peers, 2);
    assert!(tracker.known_urls().contains(&stranger));
}
