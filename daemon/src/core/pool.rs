// Pool orchestrator: one round ledger, one block registry, one reward
// distributor and any number of stratum listeners, wired together.
//
// The orchestrator is also the listeners' share pipeline: it asks the
// external validator for a verdict, credits the ledger before the miner
// is acknowledged, and turns block discoveries into registry entries and
// round rotations. Session and ledger events flow through one channel
// consumed by a dedicated loop.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use futures::future::join_all;
use log::{debug, error, info, warn};
use minepool_common::stratum::{RpcNotification, Share};
use minepool_common::time::{get_current_time_in_millis, TimestampMillis};
use serde::Serialize;
use serde_json::Value;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;

use crate::config::{PoolConfig, HASHRATE_CLEANUP_INTERVAL_SECS};
use crate::core::blocks::{BlockCounts, BlockRegistry, BlockStatus};
use crate::core::error::PoolError;
use crate::core::payments::{PaymentStats, RewardDistributor, WorkerPayment};
use crate::core::shares::{RoundInfo, RoundLedger, WorkerStats};
use crate::core::storage::SharedStore;
use crate::events::{PoolEvent, EVENT_CHANNEL_SIZE};
use crate::stratum::session::SessionInfo;
use crate::stratum::{ListenerStats, StratumHandler, StratumListener, StratumOptions};
use crate::validator::{
    BlockFound, DisbursementSender, NonEmptyWorkerValidator, ShareValidator, ShareVerdict,
    WorkerValidator,
};

/// Read-only composite snapshot of one pool
#[derive(Debug, Clone, Serialize)]
pub struct PoolStats {
    pub pool: String,
    pub is_running: bool,
    pub uptime_ms: u64,
    pub round: RoundInfo,
    pub ports: Vec<ListenerStats>,
    pub blocks: BlockCounts,
    pub payments: Option<PaymentStats>,
    pub workers: Vec<ConnectedWorker>,
}

/// A worker currently authorized on some session
#[derive(Debug, Clone, Serialize)]
pub struct ConnectedWorker {
    pub worker: String,
    pub connected_at: TimestampMillis,
    pub difficulty: f64,
}

/// Everything known about one worker, for query surfaces
#[derive(Debug, Clone, Serialize)]
pub struct WorkerReport {
    pub connected: bool,
    pub shares: Option<WorkerStats>,
    pub balance: Option<f64>,
    pub payments: Vec<WorkerPayment>,
}

pub struct Pool<S: SharedStore> {
    config: PoolConfig,
    ledger: Arc<RoundLedger<S>>,
    blocks: Arc<BlockRegistry<S>>,
    distributor: Option<Arc<RewardDistributor<S>>>,
    validator: Arc<dyn ShareValidator>,
    worker_policy: Arc<dyn WorkerValidator>,
    listeners: Mutex<Vec<Arc<StratumListener>>>,
    events_tx: mpsc::Sender<PoolEvent>,
    // Consumed once by the event loop on start
    events_rx: Mutex<Option<mpsc::Receiver<PoolEvent>>>,
    workers: DashMap<String, ConnectedWorker>,
    running: AtomicBool,
    started_at: AtomicU64,
    shutdown: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl<S: SharedStore> Pool<S> {
    /// Assemble a pool from its collaborators. Payments only run when a
    /// disbursement sender is supplied and enabled in the config.
    pub async fn new(
        config: PoolConfig,
        store: Arc<S>,
        validator: Arc<dyn ShareValidator>,
        sender: Option<Arc<dyn DisbursementSender>>,
        worker_policy: Option<Arc<dyn WorkerValidator>>,
    ) -> Result<Arc<Self>, PoolError> {
        let ledger = Arc::new(RoundLedger::load(store.clone(), config.name.clone()).await?);
        let blocks = Arc::new(BlockRegistry::new(
            store.clone(),
            config.name.clone(),
            config.required_confirmations,
        ));

        let distributor = match sender {
            Some(sender) => Some(Arc::new(RewardDistributor::new(
                store,
                config.name.clone(),
                config.payments.clone(),
                config.fee_recipients.clone(),
                blocks.clone(),
                sender,
            ))),
            None => {
                if config.payments.enabled {
                    warn!(
                        "pool {} has payments enabled but no disbursement sender",
                        config.name
                    );
                }
                None
            }
        };

        let (events_tx, events_rx) = mpsc::channel(EVENT_CHANNEL_SIZE);
        let (shutdown, _) = watch::channel(false);

        Ok(Arc::new(Self {
            config,
            ledger,
            blocks,
            distributor,
            validator,
            worker_policy: worker_policy
                .unwrap_or_else(|| Arc::new(NonEmptyWorkerValidator)),
            listeners: Mutex::new(Vec::new()),
            events_tx,
            events_rx: Mutex::new(Some(events_rx)),
            workers: DashMap::new(),
            running: AtomicBool::new(false),
            started_at: AtomicU64::new(0),
            shutdown,
            tasks: Mutex::new(Vec::new()),
        }))
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn ledger(&self) -> &Arc<RoundLedger<S>> {
        &self.ledger
    }

    pub fn blocks(&self) -> &Arc<BlockRegistry<S>> {
        &self.blocks
    }

    /// Start listeners, the event loop, the distributor and the
    /// maintenance tasks. Calling start on a running pool is a no-op.
    pub async fn start(self: &Arc<Self>) -> Result<(), PoolError> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        info!("starting pool {}", self.config.name);
        self.shutdown.send_replace(false);
        self.started_at
            .store(get_current_time_in_millis(), Ordering::Relaxed);

        let mut tasks = Vec::new();
        if let Some(events_rx) = self.events_rx.lock().await.take() {
            tasks.push(tokio::spawn(self.clone().event_loop(events_rx)));
        }
        tasks.push(tokio::spawn(self.clone().hashrate_cleanup_loop()));
        *self.tasks.lock().await = tasks;

        let mut listeners = self.listeners.lock().await;
        for port in &self.config.ports {
            let options = StratumOptions {
                bind_address: self.config.bind_address,
                port: port.port,
                difficulty: port.difficulty,
                vardiff: port.vardiff.clone(),
                max_connections: self.config.max_connections,
                connection_timeout_secs: self.config.connection_timeout_secs,
                banning: self.config.banning.clone(),
            };
            let handler: Arc<dyn StratumHandler> = self.clone();
            match StratumListener::start(options, handler, self.events_tx.clone()).await {
                Ok(listener) => listeners.push(listener),
                Err(e) => {
                    // Roll back whatever already came up
                    error!(
                        "pool {} failed to start listener on port {}: {}",
                        self.config.name, port.port, e
                    );
                    join_all(listeners.iter().map(|l| l.stop())).await;
                    listeners.clear();
                    drop(listeners);
                    self.halt_background().await;
                    self.running.store(false, Ordering::SeqCst);
                    return Err(e);
                }
            }
        }
        drop(listeners);

        if let Some(distributor) = &self.distributor {
            distributor.start().await;
        }

        info!(
            "pool {} started on port(s) {:?}",
            self.config.name,
            self.config.ports.iter().map(|p| p.port).collect::<Vec<_>>()
        );
        Ok(())
    }

    /// Stop everything in reverse order. Idempotent.
    pub async fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        info!("stopping pool {}", self.config.name);

        let listeners: Vec<_> = self.listeners.lock().await.drain(..).collect();
        join_all(listeners.iter().map(|l| l.stop())).await;

        if let Some(distributor) = &self.distributor {
            distributor.stop().await;
        }

        self.halt_background().await;
        info!("pool {} stopped", self.config.name);
    }

    async fn halt_background(&self) {
        let _ = self.shutdown.send(true);
        for task in self.tasks.lock().await.drain(..) {
            if let Err(e) = task.await {
                warn!("pool task join failed: {}", e);
            }
        }
    }

    /// Subscriber loop for session and share events: keeps the
    /// connected-worker table and leaves an audit trail in the logs
    async fn event_loop(self: Arc<Self>, mut events_rx: mpsc::Receiver<PoolEvent>) {
        let mut shutdown = self.shutdown.subscribe();
        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                event = events_rx.recv() => {
                    let Some(event) = event else { break };
                    self.apply_event(event);
                }
            }
        }
        // Drain without blocking so late senders are not stuck
        while let Ok(event) = events_rx.try_recv() {
            self.apply_event(event);
        }
        // Hand the receiver back so the pool can be started again
        *self.events_rx.lock().await = Some(events_rx);
        debug!("pool {} event loop exited", self.config.name);
    }

    fn apply_event(&self, event: PoolEvent) {
        match event {
            PoolEvent::Authorized {
                worker, difficulty, ..
            } => {
                self.workers.insert(
                    worker.clone(),
                    ConnectedWorker {
                        worker,
                        connected_at: get_current_time_in_millis(),
                        difficulty,
                    },
                );
            }
            PoolEvent::Disconnected { worker, .. } => {
                if let Some(worker) = worker {
                    self.workers.remove(&worker);
                }
            }
            PoolEvent::DifficultyChanged { .. } | PoolEvent::Connected { .. } => {}
            PoolEvent::Subscribed { .. } => {}
            PoolEvent::ShareAccepted {
                worker,
                difficulty,
                is_block,
            } => {
                debug!(
                    "pool {} accepted share from {} at difficulty {} (block: {})",
                    self.config.name, worker, difficulty, is_block
                );
            }
            PoolEvent::ShareRejected { worker } => {
                debug!("pool {} rejected share from {}", self.config.name, worker);
            }
            PoolEvent::IpBanned { ip, until } => {
                warn!(
                    "pool {} banned {} until {}",
                    self.config.name, ip, until
                );
            }
            PoolEvent::BlockFound {
                height,
                hash,
                worker,
            } => {
                info!(
                    "pool {} block {} found at height {} by {}",
                    self.config.name, hash, height, worker
                );
            }
        }
    }

    async fn hashrate_cleanup_loop(self: Arc<Self>) {
        let mut shutdown = self.shutdown.subscribe();
        let mut ticker =
            tokio::time::interval(Duration::from_secs(HASHRATE_CLEANUP_INTERVAL_SECS));
        // The first tick fires immediately; skip it so startup stays quiet
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = ticker.tick() => {
                    if let Err(e) = self.ledger.prune_hashrate_data().await {
                        warn!("pool {} hashrate cleanup failed: {}", self.config.name, e);
                    }
                }
            }
        }
    }

    /// A share that met network difficulty: freeze the round into the
    /// registry and open the next one
    async fn handle_block_found(
        &self,
        worker: &str,
        found: &BlockFound,
    ) -> Result<(), PoolError> {
        let closed = self.ledger.snapshot_and_rotate(found.height + 1).await?;
        self.blocks
            .record_discovery(
                found.height,
                &found.hash,
                found.reward,
                worker,
                closed.weights,
            )
            .await?;
        self.ledger.record_block_found().await?;
        Ok(())
    }

    /// External reorg signal: the block is void, its contributors keep
    /// their weight in the active round
    pub async fn handle_block_orphaned(&self, hash: &str) -> Result<(), PoolError> {
        let block = self.blocks.mark_orphaned(hash).await?;
        self.ledger.merge_back(&block.share_snapshot).await?;
        warn!(
            "pool {} block {} orphaned, {} weight returned to the round",
            self.config.name,
            hash,
            block.share_snapshot.values().sum::<u64>()
        );
        Ok(())
    }

    /// Chain watcher feed: advance a block's confirmation count
    pub async fn update_confirmations(
        &self,
        hash: &str,
        confirmations: u32,
    ) -> Result<BlockStatus, PoolError> {
        self.blocks.update_confirmations(hash, confirmations).await
    }

    /// Push a new job to every authorized session on every port
    pub async fn notify_new_job(&self, params: Value) -> usize {
        let notification = RpcNotification::notify(params);
        let listeners = self.listeners.lock().await;
        listeners
            .iter()
            .map(|l| l.broadcast_notification(&notification))
            .sum()
    }

    /// Compose the read-only stats snapshot
    pub async fn stats(&self) -> Result<PoolStats, PoolError> {
        let started_at = self.started_at.load(Ordering::Relaxed);
        let uptime_ms = if self.is_running() && started_at > 0 {
            get_current_time_in_millis().saturating_sub(started_at)
        } else {
            0
        };

        let ports = self
            .listeners
            .lock()
            .await
            .iter()
            .map(|l| l.stats())
            .collect();

        let payments = match &self.distributor {
            Some(distributor) => Some(distributor.payment_stats().await?),
            None => None,
        };

        let mut workers: Vec<ConnectedWorker> =
            self.workers.iter().map(|e| e.value().clone()).collect();
        workers.sort_by(|a, b| a.worker.cmp(&b.worker));

        Ok(PoolStats {
            pool: self.config.name.clone(),
            is_running: self.is_running(),
            uptime_ms,
            round: self.ledger.round_info().await?,
            ports,
            blocks: self.blocks.counts().await?,
            payments,
            workers,
        })
    }

    /// Everything known about one worker
    pub async fn worker_report(&self, worker: &str) -> Result<WorkerReport, PoolError> {
        let (balance, payments) = match &self.distributor {
            Some(distributor) => (
                Some(distributor.worker_balance(worker).await?),
                distributor.worker_payment_history(worker, 10).await?,
            ),
            None => (None, Vec::new()),
        };
        Ok(WorkerReport {
            connected: self.workers.contains_key(worker),
            shares: self.ledger.worker_stats(worker).await?,
            balance,
            payments,
        })
    }

    /// Credit a validated share, retrying once before giving up: an
    /// acknowledged share that was never credited would silently lose
    /// miner payout
    async fn credit_with_retry(&self, worker: &str, weight: u64) -> Result<(), PoolError> {
        if let Err(e) = self.ledger.credit_share(worker, weight).await {
            warn!(
                "pool {} credit for {} failed, retrying: {}",
                self.config.name, worker, e
            );
            self.ledger.credit_share(worker, weight).await?;
        }
        Ok(())
    }
}

#[async_trait]
impl<S: SharedStore> StratumHandler for Pool<S> {
    async fn authorize_worker(&self, worker: &str, password: &str) -> Result<bool, PoolError> {
        Ok(self.worker_policy.validate(worker, password).await)
    }

    async fn submit_share(
        &self,
        session: &SessionInfo,
        share: Share,
    ) -> Result<ShareVerdict, PoolError> {
        let verdict = self.validator.validate(session, &share).await?;
        let worker = &share.worker;

        if verdict.valid {
            // Weight is the difficulty the share was accepted at
            let weight = share.difficulty.round().max(1.0) as u64;
            self.credit_with_retry(worker, weight).await?;

            // Stat counters are best-effort; the share is already safe
            if let Err(e) = self.ledger.record_valid_share(worker, share.difficulty).await {
                warn!("pool {} worker stats update failed: {}", self.config.name, e);
            }

            if let Some(found) = &verdict.block {
                match self.handle_block_found(worker, found).await {
                    Ok(()) => {}
                    Err(PoolError::DuplicateBlock(hash)) => {
                        // Another process got there first; the share
                        // itself stays credited
                        warn!("pool {} duplicate block {}", self.config.name, hash);
                    }
                    Err(e) => {
                        error!(
                            "pool {} failed to record block {}: {}",
                            self.config.name, found.hash, e
                        );
                    }
                }
            }
        } else if let Err(e) = self.ledger.record_invalid_share(worker).await {
            warn!("pool {} worker stats update failed: {}", self.config.name, e);
        }

        Ok(verdict)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{BanConfig, PaymentConfig, PortConfig};
    use crate::core::storage::MemoryStore;
    use crate::validator::FormatValidator;
    use std::net::{IpAddr, Ipv4Addr};

    fn test_config() -> PoolConfig {
        PoolConfig {
            name: "test".to_owned(),
            bind_address: IpAddr::V4(Ipv4Addr::LOCALHOST),
            ports: vec![PortConfig {
                port: 0,
                difficulty: 32.0,
                vardiff: None,
            }],
            max_connections: 100,
            connection_timeout_secs: 600,
            required_confirmations: 1,
            banning: BanConfig::default(),
            payments: PaymentConfig::default(),
            fee_recipients: Vec::new(),
        }
    }

    async fn test_pool() -> Arc<Pool<MemoryStore>> {
        Pool::new(
            test_config(),
            Arc::new(MemoryStore::new()),
            Arc::new(FormatValidator),
            None,
            None,
        )
        .await
        .unwrap()
    }

    fn session_info() -> SessionInfo {
        SessionInfo {
            id: 1,
            ip: IpAddr::V4(Ipv4Addr::LOCALHOST),
            port: 12345,
            worker: Some("w1".to_owned()),
            difficulty: 32.0,
        }
    }

    fn share(worker: &str) -> Share {
        Share {
            worker: worker.to_owned(),
            job_id: "job1".to_owned(),
            extra_nonce2: "00ff".to_owned(),
            ntime: "5f5e1234".to_owned(),
            nonce: "deadbeef".to_owned(),
            difficulty: 32.0,
        }
    }

    #[tokio::test]
    async fn test_valid_share_credits_ledger() {
        let pool = test_pool().await;
        let verdict = pool
            .submit_share(&session_info(), share("w1"))
            .await
            .unwrap();
        assert!(verdict.valid);

        let info = pool.ledger().round_info().await.unwrap();
        assert_eq!(info.weights.get("w1"), Some(&32));
    }

    #[tokio::test]
    async fn test_invalid_share_does_not_credit() {
        let pool = test_pool().await;
        let mut bad = share("w1");
        bad.nonce = "not hex".to_owned();
        let verdict = pool.submit_share(&session_info(), bad).await.unwrap();
        assert!(!verdict.valid);

        let info = pool.ledger().round_info().await.unwrap();
        assert_eq!(info.total_weight, 0);
    }

    #[tokio::test]
    async fn test_orphan_merges_snapshot_exactly_once() {
        let pool = test_pool().await;
        pool.ledger().credit_share("a", 30).await.unwrap();
        pool.ledger().credit_share("b", 70).await.unwrap();

        // Discover a block: round rotates, snapshot frozen
        let found = BlockFound {
            height: 100,
            hash: "h1".to_owned(),
            reward: 50.0,
            difficulty: 1000.0,
        };
        pool.handle_block_found("a", &found).await.unwrap();
        assert_eq!(pool.ledger().round_info().await.unwrap().total_weight, 0);

        // New round accrues some weight, then the block is orphaned
        pool.ledger().credit_share("a", 5).await.unwrap();
        pool.handle_block_orphaned("h1").await.unwrap();

        let info = pool.ledger().round_info().await.unwrap();
        assert_eq!(info.weights.get("a"), Some(&35));
        assert_eq!(info.weights.get("b"), Some(&70));

        // A second orphan attempt must fail and not merge again
        assert!(pool.handle_block_orphaned("h1").await.is_err());
        let info = pool.ledger().round_info().await.unwrap();
        assert_eq!(info.total_weight, 105);
    }

    #[tokio::test]
    async fn test_block_found_rotates_to_next_height() {
        let pool = test_pool().await;
        pool.ledger().credit_share("a", 10).await.unwrap();

        let found = BlockFound {
            height: 42,
            hash: "h1".to_owned(),
            reward: 50.0,
            difficulty: 1000.0,
        };
        pool.handle_block_found("a", &found).await.unwrap();

        let info = pool.ledger().round_info().await.unwrap();
        assert_eq!(info.height, 43);
        assert_eq!(pool.blocks().counts().await.unwrap().pending, 1);
    }

    #[tokio::test]
    async fn test_start_stop_idempotent() {
        let pool = test_pool().await;
        pool.start().await.unwrap();
        assert!(pool.is_running());
        pool.start().await.unwrap();

        pool.stop().await;
        assert!(!pool.is_running());
        pool.stop().await;

        let stats = pool.stats().await.unwrap();
        assert!(!stats.is_running);
    }

    #[tokio::test]
    async fn test_stats_compose() {
        let pool = test_pool().await;
        pool.start().await.unwrap();
        pool.submit_share(&session_info(), share("w1")).await.unwrap();

        let stats = pool.stats().await.unwrap();
        assert_eq!(stats.pool, "test");
        assert!(stats.is_running);
        assert_eq!(stats.round.total_weight, 32);
        assert_eq!(stats.ports.len(), 1);
        assert!(stats.payments.is_none());

        pool.stop().await;
    }
}
