// End-to-end protocol tests: a real TCP client driving the stratum
// state machine against a pool backed by the in-process store.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;

use minepool_common::stratum::Share;
use minepool_daemon::config::{BanConfig, PaymentConfig, PoolConfig, PortConfig};
use minepool_daemon::core::error::PoolError;
use minepool_daemon::core::pool::Pool;
use minepool_daemon::core::storage::MemoryStore;
use minepool_daemon::stratum::session::SessionInfo;
use minepool_daemon::validator::{BlockFound, ShareValidator, ShareVerdict};

/// Verdicts keyed off the share fields: nonce "bad" is invalid, job
/// "blockjob" finds a block, everything else is a plain valid share
struct NonceValidator {
    calls: AtomicUsize,
}

impl NonceValidator {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicUsize::new(0),
        })
    }
}

#[async_trait]
impl ShareValidator for NonceValidator {
    async fn validate(
        &self,
        _session: &SessionInfo,
        share: &Share,
    ) -> Result<ShareVerdict, PoolError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if share.nonce == "bad" {
            return Ok(ShareVerdict::invalid());
        }
        if share.job_id == "blockjob" {
            return Ok(ShareVerdict::block(BlockFound {
                height: 100,
                hash: format!("hash-{}", share.nonce),
                reward: 50.0,
                difficulty: 1000.0,
            }));
        }
        Ok(ShareVerdict::valid())
    }
}

fn test_config(check_threshold: u64) -> PoolConfig {
    PoolConfig {
        name: "test".to_owned(),
        bind_address: "127.0.0.1".parse().unwrap(),
        ports: vec![PortConfig {
            port: 0,
            difficulty: 32.0,
            vardiff: None,
        }],
        max_connections: 16,
        connection_timeout_secs: 600,
        required_confirmations: 1,
        banning: BanConfig {
            enabled: true,
            time_secs: 600,
            invalid_percent: 50.0,
            check_threshold,
            purge_interval_secs: 300,
        },
        payments: PaymentConfig::default(),
        fee_recipients: Vec::new(),
    }
}

async fn start_pool(
    check_threshold: u64,
) -> (Arc<Pool<MemoryStore>>, Arc<NonceValidator>, u16) {
    let validator = NonceValidator::new();
    let pool = Pool::new(
        test_config(check_threshold),
        Arc::new(MemoryStore::new()),
        validator.clone(),
        None,
        None,
    )
    .await
    .unwrap();
    pool.start().await.unwrap();
    let port = pool.stats().await.unwrap().ports[0].port;
    (pool, validator, port)
}

struct Client {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
}

impl Client {
    async fn connect(port: u16) -> Self {
        let stream = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
        let (read_half, writer) = stream.into_split();
        Self {
            reader: BufReader::new(read_half),
            writer,
        }
    }

    async fn send_raw(&mut self, raw: &str) {
        self.writer.write_all(raw.as_bytes()).await.unwrap();
        self.writer.write_all(b"\n").await.unwrap();
    }

    async fn send(&mut self, value: Value) {
        self.send_raw(&value.to_string()).await;
    }

    /// Next frame, or None on EOF
    async fn recv(&mut self) -> Option<Value> {
        let mut line = String::new();
        let read = tokio::time::timeout(Duration::from_secs(5), self.reader.read_line(&mut line))
            .await
            .expect("timed out waiting for a frame")
            .unwrap();
        if read == 0 {
            return None;
        }
        Some(serde_json::from_str(&line).unwrap())
    }

    async fn subscribe(&mut self) -> Value {
        self.send(json!({"id": 1, "method": "mining.subscribe", "params": []}))
            .await;
        self.recv().await.unwrap()
    }

    /// Authorize and consume the set_difficulty push that follows
    async fn authorize(&mut self, worker: &str) -> Value {
        self.send(json!({"id": 2, "method": "mining.authorize", "params": [worker, "x"]}))
            .await;
        let response = self.recv().await.unwrap();
        if response["result"] == json!(true) {
            let difficulty = self.recv().await.unwrap();
            assert_eq!(difficulty["method"], "mining.set_difficulty");
        }
        response
    }

    async fn submit(&mut self, id: u64, job_id: &str, nonce: &str) -> Option<Value> {
        self.send(json!({
            "id": id,
            "method": "mining.submit",
            "params": ["w1", job_id, "00ff", "5f5e1234", nonce]
        }))
        .await;
        self.recv().await
    }
}

fn error_code(frame: &Value) -> i64 {
    frame["error"][0].as_i64().unwrap()
}

#[tokio::test]
async fn test_subscribe_result_shape() {
    let (pool, _, port) = start_pool(500).await;
    let mut client = Client::connect(port).await;

    let response = client.subscribe().await;
    let result = response["result"].as_array().unwrap();
    assert_eq!(result.len(), 3);
    // Channel pairs reference the subscription id
    let sub_id = result[1].as_str().unwrap();
    assert_eq!(result[0][0][1], sub_id);
    assert_eq!(result[2], 8);

    pool.stop().await;
}

#[tokio::test]
async fn test_malformed_json_is_recoverable() {
    let (pool, _, port) = start_pool(500).await;
    let mut client = Client::connect(port).await;

    client.send_raw("this is not json").await;
    let response = client.recv().await.unwrap();
    assert_eq!(error_code(&response), -32700);

    // The session survives a parse error
    let response = client.subscribe().await;
    assert!(response["result"].is_array());

    pool.stop().await;
}

#[tokio::test]
async fn test_invalid_and_unknown_frames() {
    let (pool, _, port) = start_pool(500).await;
    let mut client = Client::connect(port).await;

    client.send(json!({"id": 7})).await;
    let response = client.recv().await.unwrap();
    assert_eq!(error_code(&response), -32600);

    client
        .send(json!({"id": 8, "method": "mining.frobnicate", "params": []}))
        .await;
    let response = client.recv().await.unwrap();
    assert_eq!(error_code(&response), -32601);

    client
        .send(json!({"id": 9, "method": "mining.get_transactions", "params": []}))
        .await;
    let response = client.recv().await.unwrap();
    assert_eq!(response["result"], json!([]));

    pool.stop().await;
}

#[tokio::test]
async fn test_submit_requires_authorization() {
    let (pool, validator, port) = start_pool(500).await;
    let mut client = Client::connect(port).await;
    client.subscribe().await;

    let response = client.submit(5, "job1", "deadbeef").await.unwrap();
    assert_eq!(error_code(&response), 24);

    // The validator was never consulted and nothing was credited
    assert_eq!(validator.calls.load(Ordering::SeqCst), 0);
    assert_eq!(pool.ledger().round_info().await.unwrap().total_weight, 0);

    pool.stop().await;
}

#[tokio::test]
async fn test_authorize_rejects_empty_worker_and_disconnects() {
    let (pool, _, port) = start_pool(500).await;
    let mut client = Client::connect(port).await;
    client.subscribe().await;

    let response = client.authorize("").await;
    assert_eq!(error_code(&response), 24);
    // The listener closes the session after a failed authorize
    assert!(client.recv().await.is_none());

    pool.stop().await;
}

#[tokio::test]
async fn test_valid_share_flow() {
    let (pool, _, port) = start_pool(500).await;
    let mut client = Client::connect(port).await;
    client.subscribe().await;
    assert_eq!(client.authorize("w1").await["result"], json!(true));

    let response = client.submit(5, "job1", "deadbeef").await.unwrap();
    assert_eq!(response["result"], json!(true));
    assert!(response["error"].is_null());

    // The share landed in the round at the session difficulty
    let info = pool.ledger().round_info().await.unwrap();
    assert_eq!(info.weights.get("w1"), Some(&32));

    pool.stop().await;
}

#[tokio::test]
async fn test_missing_submit_params() {
    let (pool, validator, port) = start_pool(500).await;
    let mut client = Client::connect(port).await;
    client.subscribe().await;
    client.authorize("w1").await;

    client
        .send(json!({"id": 5, "method": "mining.submit", "params": ["w1", "job1"]}))
        .await;
    let response = client.recv().await.unwrap();
    assert_eq!(error_code(&response), 20);

    // Counted locally, never forwarded
    assert_eq!(validator.calls.load(Ordering::SeqCst), 0);
    assert_eq!(pool.ledger().round_info().await.unwrap().total_weight, 0);

    pool.stop().await;
}

#[tokio::test]
async fn test_invalid_share_error_code() {
    let (pool, _, port) = start_pool(500).await;
    let mut client = Client::connect(port).await;
    client.subscribe().await;
    client.authorize("w1").await;

    let response = client.submit(5, "job1", "bad").await.unwrap();
    assert_eq!(error_code(&response), 23);
    assert_eq!(pool.ledger().round_info().await.unwrap().total_weight, 0);

    pool.stop().await;
}

#[tokio::test]
async fn test_ban_on_tenth_share() {
    let (pool, _, port) = start_pool(10).await;
    let mut client = Client::connect(port).await;
    client.subscribe().await;
    client.authorize("w1").await;

    for i in 0..4 {
        let response = client.submit(10 + i, "job1", "deadbeef").await.unwrap();
        assert_eq!(response["result"], json!(true));
    }
    // Five invalid shares: nine processed, 55% invalid, not banned yet
    for i in 0..5 {
        let response = client.submit(20 + i, "job1", "bad").await.unwrap();
        assert_eq!(error_code(&response), 23);
    }

    // The tenth processed share crosses the sample threshold at 60%
    // invalid: rejected, banned, socket closed
    let response = client.submit(30, "job1", "bad").await.unwrap();
    assert_eq!(error_code(&response), 23);
    assert!(client.recv().await.is_none());

    // A banned IP is rejected at accept time, before any session exists
    let mut retry = Client::connect(port).await;
    retry
        .send(json!({"id": 1, "method": "mining.subscribe", "params": []}))
        .await;
    assert!(retry.recv().await.is_none());

    pool.stop().await;
}

#[tokio::test]
async fn test_nine_shares_is_never_banned() {
    let (pool, _, port) = start_pool(10).await;
    let mut client = Client::connect(port).await;
    client.subscribe().await;
    client.authorize("w1").await;

    for i in 0..4 {
        client.submit(10 + i, "job1", "deadbeef").await.unwrap();
    }
    for i in 0..5 {
        let response = client.submit(20 + i, "job1", "bad").await.unwrap();
        assert_eq!(error_code(&response), 23);
    }

    // Nine processed shares at 55% invalid: the session stays up. The
    // next share is valid, which drops the ratio to exactly 50% at the
    // threshold, still not over it.
    let response = client.submit(30, "job1", "deadbeef").await.unwrap();
    assert_eq!(response["result"], json!(true));

    pool.stop().await;
}

#[tokio::test]
async fn test_block_discovery_rotates_round() {
    let (pool, _, port) = start_pool(500).await;
    let mut client = Client::connect(port).await;
    client.subscribe().await;
    client.authorize("w1").await;

    client.submit(5, "job1", "deadbeef").await.unwrap();
    let response = client.submit(6, "blockjob", "cafe").await.unwrap();
    assert_eq!(response["result"], json!(true));

    // The round rotated past the found height and the block is pending
    // with the pre-rotation snapshot
    let info = pool.ledger().round_info().await.unwrap();
    assert_eq!(info.height, 101);
    assert_eq!(info.total_weight, 0);
    assert_eq!(pool.blocks().counts().await.unwrap().pending, 1);

    pool.stop().await;
}

#[tokio::test]
async fn test_stop_closes_sessions_and_is_idempotent() {
    let (pool, _, port) = start_pool(500).await;
    let mut client = Client::connect(port).await;
    client.subscribe().await;

    pool.stop().await;
    // The server closed our socket
    assert!(client.recv().await.is_none());

    // A second stop is a no-op
    pool.stop().await;
    assert!(!pool.is_running());
}
