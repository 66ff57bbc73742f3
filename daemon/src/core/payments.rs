// Reward distributor: turns confirmed blocks into payouts.
//
// PROP scheme: each worker in the block's share snapshot earns a slice of
// the reward proportional to its weight, after the configured fee
// percentages are taken off the top. Rewards under the minimum payment
// are carried in a per-address balance until they accumulate past it.
//
// Settlement is all-or-nothing per block: balances, the payment record
// and the paid transition are only written once the disbursement request
// succeeded. A failed send leaves everything untouched for the next
// cycle.
//
// The single-flight guard is process-local. Deployments running several
// daemon processes for one pool must designate a single payment process;
// the guard does not coordinate across processes.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use indexmap::IndexMap;
use log::{debug, error, info, warn};
use metrics::counter;
use minepool_common::time::{get_current_time_in_millis, TimestampMillis};
use serde::{Deserialize, Serialize};
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;

use crate::config::{FeeRecipient, PaymentConfig};
use crate::core::blocks::{Block, BlockRegistry};
use crate::core::error::PoolError;
use crate::core::storage::SharedStore;
use crate::validator::DisbursementSender;

/// Append-only record of one disbursement
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaymentRecord {
    pub txid: String,
    pub timestamp: TimestampMillis,
    pub payouts: IndexMap<String, f64>,
    pub total_amount: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct PaymentStats {
    pub total_payments: usize,
    pub total_amount: f64,
    pub last_payment: Option<LastPayment>,
}

#[derive(Debug, Clone, Serialize)]
pub struct LastPayment {
    pub txid: String,
    pub timestamp: TimestampMillis,
}

#[derive(Debug, Clone, Serialize)]
pub struct WorkerPayment {
    pub txid: String,
    pub timestamp: TimestampMillis,
    pub amount: f64,
}

pub struct RewardDistributor<S: SharedStore> {
    store: Arc<S>,
    pool: String,
    config: PaymentConfig,
    fee_recipients: Vec<FeeRecipient>,
    blocks: Arc<BlockRegistry<S>>,
    sender: Arc<dyn DisbursementSender>,
    // Skips a tick while the previous cycle is still settling
    in_flight: AtomicBool,
    shutdown: watch::Sender<bool>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl<S: SharedStore> RewardDistributor<S> {
    pub fn new(
        store: Arc<S>,
        pool: String,
        config: PaymentConfig,
        fee_recipients: Vec<FeeRecipient>,
        blocks: Arc<BlockRegistry<S>>,
        sender: Arc<dyn DisbursementSender>,
    ) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            store,
            pool,
            config,
            fee_recipients,
            blocks,
            sender,
            in_flight: AtomicBool::new(false),
            shutdown,
            task: Mutex::new(None),
        }
    }

    fn balance_key(&self, address: &str) -> String {
        format!("{}:balances:{}", self.pool, address)
    }

    fn payments_key(&self) -> String {
        format!("{}:payments", self.pool)
    }

    fn timeline_key(&self) -> String {
        format!("{}:payments:timeline", self.pool)
    }

    /// Spawn the payment cycle at the configured interval
    pub async fn start(self: &Arc<Self>) {
        if !self.config.enabled {
            info!("pool {} payment processing disabled", self.pool);
            return;
        }

        let mut guard = self.task.lock().await;
        if guard.is_some() {
            return;
        }

        let this = self.clone();
        *guard = Some(tokio::spawn(async move {
            let mut shutdown = this.shutdown.subscribe();
            let mut ticker = tokio::time::interval(Duration::from_secs(this.config.interval_secs));
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(e) = this.run_cycle().await {
                            error!("pool {} payment cycle failed: {}", this.pool, e);
                        }
                    },
                    _ = shutdown.changed() => break,
                }
            }
            debug!("pool {} payment task exited", this.pool);
        }));

        info!(
            "pool {} payment processing started (interval {}s, minimum {})",
            self.pool, self.config.interval_secs, self.config.minimum_payment
        );
    }

    /// Stop the cycle. An in-flight settlement finishes or fails
    /// normally; nothing is cancelled halfway through a disbursement.
    pub async fn stop(&self) {
        let _ = self.shutdown.send(true);
        if let Some(task) = self.task.lock().await.take() {
            if let Err(e) = task.await {
                warn!("pool {} payment task join failed: {}", self.pool, e);
            }
        }
    }

    /// One distribution cycle over all confirmed-unpaid blocks.
    /// Re-entrant calls are skipped while a cycle is running.
    pub async fn run_cycle(&self) -> Result<(), PoolError> {
        if self
            .in_flight
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            debug!("pool {} payment cycle already in progress", self.pool);
            return Ok(());
        }

        let result = self.process_confirmed_blocks().await;
        self.in_flight.store(false, Ordering::SeqCst);
        result
    }

    async fn process_confirmed_blocks(&self) -> Result<(), PoolError> {
        let blocks = self.blocks.confirmed_unpaid().await?;
        if blocks.is_empty() {
            return Ok(());
        }

        info!(
            "pool {} settling {} confirmed block(s)",
            self.pool,
            blocks.len()
        );
        for block in &blocks {
            // A block failing to settle stays confirmed and is retried
            // next cycle; it must not block the others
            if let Err(e) = self.settle_block(block).await {
                error!(
                    "pool {} failed to settle block {}: {}",
                    self.pool, block.hash, e
                );
                counter!("minepool_settlements_failed").increment(1);
            }
        }
        Ok(())
    }

    async fn settle_block(&self, block: &Block) -> Result<(), PoolError> {
        let total_weight: u64 = block.share_snapshot.values().sum();
        if total_weight == 0 {
            warn!(
                "pool {} block {} has no shares, leaving unpaid",
                self.pool, block.hash
            );
            return Ok(());
        }

        let rewards = compute_rewards(
            block.reward,
            &block.share_snapshot,
            total_weight,
            &self.fee_recipients,
        );

        // Minimum-payment batching against the carried balances
        let mut payouts: IndexMap<String, f64> = IndexMap::new();
        let mut carries: Vec<(String, f64)> = Vec::new();
        for (address, amount) in rewards {
            let carried = self.worker_balance(&address).await?;
            let candidate = amount + carried;
            if candidate >= self.config.minimum_payment {
                payouts.insert(address, candidate);
            } else {
                carries.push((address, candidate));
            }
        }

        if !payouts.is_empty() {
            let txid = self.sender.send(&payouts).await?;

            // The send succeeded: now, and only now, persist the outcome
            for address in payouts.keys() {
                self.store.set(&self.balance_key(address), "0").await?;
            }
            self.persist_carries(&carries).await?;
            self.store_payment_record(&txid, payouts).await?;
            self.blocks.mark_paid(&block.hash).await?;

            counter!("minepool_payments_sent").increment(1);
            info!(
                "pool {} block {} paid in tx {}",
                self.pool, block.hash, txid
            );
        } else {
            // Everything stayed under the minimum: the whole reward moved
            // into carried balances, and the block is settled. Leaving it
            // confirmed would re-credit the same snapshot every cycle.
            self.persist_carries(&carries).await?;
            self.blocks.mark_paid(&block.hash).await?;
            debug!(
                "pool {} block {} fully carried over ({} balances)",
                self.pool,
                block.hash,
                carries.len()
            );
        }
        Ok(())
    }

    async fn persist_carries(&self, carries: &[(String, f64)]) -> Result<(), PoolError> {
        for (address, amount) in carries {
            self.store
                .set(&self.balance_key(address), &amount.to_string())
                .await?;
        }
        Ok(())
    }

    async fn store_payment_record(
        &self,
        txid: &str,
        payouts: IndexMap<String, f64>,
    ) -> Result<(), PoolError> {
        let record = PaymentRecord {
            txid: txid.to_owned(),
            timestamp: get_current_time_in_millis(),
            total_amount: payouts.values().sum(),
            payouts,
        };
        self.store
            .hash_set(&self.payments_key(), txid, &serde_json::to_string(&record)?)
            .await?;
        self.store
            .sorted_add(&self.timeline_key(), record.timestamp, txid)
            .await?;
        Ok(())
    }

    /// Carried balance for an address, zero when absent
    pub async fn worker_balance(&self, address: &str) -> Result<f64, PoolError> {
        Ok(self
            .store
            .get(&self.balance_key(address))
            .await?
            .and_then(|v| v.parse().ok())
            .unwrap_or(0.0))
    }

    pub async fn payment_stats(&self) -> Result<PaymentStats, PoolError> {
        let raw = self.store.hash_get_all(&self.payments_key()).await?;
        let mut total_amount = 0.0;
        let mut last: Option<LastPayment> = None;
        for (txid, value) in &raw {
            let record: PaymentRecord = serde_json::from_str(value)?;
            total_amount += record.total_amount;
            if last
                .as_ref()
                .map(|l| record.timestamp > l.timestamp)
                .unwrap_or(true)
            {
                last = Some(LastPayment {
                    txid: txid.clone(),
                    timestamp: record.timestamp,
                });
            }
        }
        Ok(PaymentStats {
            total_payments: raw.len(),
            total_amount,
            last_payment: last,
        })
    }

    /// Most recent payments that included the address, newest first
    pub async fn worker_payment_history(
        &self,
        address: &str,
        limit: usize,
    ) -> Result<Vec<WorkerPayment>, PoolError> {
        let txids = self
            .store
            .sorted_range_by_score(&self.timeline_key(), 0, u64::MAX)
            .await?;

        let mut history = Vec::new();
        for txid in txids.iter().rev() {
            if history.len() >= limit {
                break;
            }
            let Some(raw) = self.store.hash_get(&self.payments_key(), txid).await? else {
                continue;
            };
            let record: PaymentRecord = serde_json::from_str(&raw)?;
            if let Some(amount) = record.payouts.get(address) {
                history.push(WorkerPayment {
                    txid: txid.clone(),
                    timestamp: record.timestamp,
                    amount: *amount,
                });
            }
        }
        Ok(history)
    }
}

/// PROP reward computation for one block.
///
/// The miner pool is `reward * (1 - total_fee_fraction)`, split by weight;
/// each fee recipient then receives its percentage of the full reward. A
/// fee address that also mined accumulates both amounts. The amounts sum
/// to the block reward up to floating-point rounding; residual dust is
/// not reconciled.
pub fn compute_rewards(
    reward: f64,
    snapshot: &HashMap<String, u64>,
    total_weight: u64,
    fee_recipients: &[FeeRecipient],
) -> IndexMap<String, f64> {
    let total_fee: f64 = fee_recipients.iter().map(|r| r.percent / 100.0).sum();
    let miner_reward = reward * (1.0 - total_fee);

    // Deterministic order so payout maps are stable run to run
    let mut workers: Vec<(&String, &u64)> = snapshot.iter().collect();
    workers.sort_by(|a, b| a.0.cmp(b.0));

    let mut rewards = IndexMap::new();
    for (worker, weight) in workers {
        let amount = miner_reward * (*weight as f64 / total_weight as f64);
        if amount > 0.0 {
            rewards.insert(worker.clone(), amount);
        }
    }

    for recipient in fee_recipients {
        let amount = reward * recipient.percent / 100.0;
        *rewards.entry(recipient.address.clone()).or_insert(0.0) += amount;
    }

    rewards
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::storage::MemoryStore;
    use async_trait::async_trait;
    use std::sync::Mutex as StdMutex;

    /// Records every payout map it is asked to send
    #[derive(Default)]
    struct RecordingSender {
        sent: StdMutex<Vec<IndexMap<String, f64>>>,
    }

    #[async_trait]
    impl DisbursementSender for RecordingSender {
        async fn send(&self, payouts: &IndexMap<String, f64>) -> Result<String, PoolError> {
            let mut sent = self.sent.lock().unwrap();
            sent.push(payouts.clone());
            Ok(format!("tx{}", sent.len()))
        }
    }

    struct FailingSender;

    #[async_trait]
    impl DisbursementSender for FailingSender {
        async fn send(&self, _payouts: &IndexMap<String, f64>) -> Result<String, PoolError> {
            Err(PoolError::Disbursement("wallet unreachable".to_owned()))
        }
    }

    fn fee(address: &str, percent: f64) -> FeeRecipient {
        FeeRecipient {
            address: address.to_owned(),
            percent,
        }
    }

    fn snapshot(pairs: &[(&str, u64)]) -> HashMap<String, u64> {
        pairs
            .iter()
            .map(|(w, n)| (w.to_string(), *n))
            .collect()
    }

    fn distributor(
        store: Arc<MemoryStore>,
        minimum_payment: f64,
        fees: Vec<FeeRecipient>,
        sender: Arc<dyn DisbursementSender>,
    ) -> (Arc<RewardDistributor<MemoryStore>>, Arc<BlockRegistry<MemoryStore>>) {
        let blocks = Arc::new(BlockRegistry::new(store.clone(), "test".to_owned(), 1));
        let distributor = Arc::new(RewardDistributor::new(
            store,
            "test".to_owned(),
            PaymentConfig {
                enabled: true,
                interval_secs: 30,
                minimum_payment,
            },
            fees,
            blocks.clone(),
            sender,
        ));
        (distributor, blocks)
    }

    async fn confirm_block(
        blocks: &BlockRegistry<MemoryStore>,
        hash: &str,
        reward: f64,
        weights: HashMap<String, u64>,
    ) {
        blocks
            .record_discovery(100, hash, reward, "a", weights)
            .await
            .unwrap();
        blocks.update_confirmations(hash, 1).await.unwrap();
    }

    #[test]
    fn test_prop_split_without_fees() {
        let rewards = compute_rewards(50.0, &snapshot(&[("A", 30), ("B", 70)]), 100, &[]);
        assert_eq!(rewards.get("A"), Some(&15.0));
        assert_eq!(rewards.get("B"), Some(&35.0));
        assert_eq!(rewards.values().sum::<f64>(), 50.0);
    }

    #[test]
    fn test_prop_split_with_fee_recipient() {
        let rewards = compute_rewards(
            50.0,
            &snapshot(&[("A", 30), ("B", 70)]),
            100,
            &[fee("F", 2.0)],
        );
        assert!((rewards["A"] - 14.7).abs() < 1e-9);
        assert!((rewards["B"] - 34.3).abs() < 1e-9);
        assert!((rewards["F"] - 1.0).abs() < 1e-9);
        assert!((rewards.values().sum::<f64>() - 50.0).abs() < 1e-9);
    }

    #[test]
    fn test_fee_address_that_also_mined_accumulates() {
        let rewards = compute_rewards(100.0, &snapshot(&[("F", 50), ("B", 50)]), 100, &[fee("F", 10.0)]);
        // 45 mined + 10 fee
        assert!((rewards["F"] - 55.0).abs() < 1e-9);
        assert!((rewards["B"] - 45.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_simple_settlement_marks_block_paid() {
        let store = Arc::new(MemoryStore::new());
        let sender = Arc::new(RecordingSender::default());
        let (distributor, blocks) = distributor(store, 0.01, vec![], sender.clone());

        confirm_block(&blocks, "h1", 50.0, snapshot(&[("A", 30), ("B", 70)])).await;
        distributor.run_cycle().await.unwrap();

        let sent = sender.sent.lock().unwrap();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0]["A"], 15.0);
        assert_eq!(sent[0]["B"], 35.0);
        drop(sent);

        assert!(blocks.confirmed_unpaid().await.unwrap().is_empty());
        assert_eq!(blocks.counts().await.unwrap().paid, 1);

        let stats = distributor.payment_stats().await.unwrap();
        assert_eq!(stats.total_payments, 1);
        assert!((stats.total_amount - 50.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_minimum_payment_carry_over() {
        let store = Arc::new(MemoryStore::new());
        let sender = Arc::new(RecordingSender::default());
        let (distributor, blocks) = distributor(store.clone(), 0.01, vec![], sender.clone());

        // Prior carried balance of 0.003 plus a 0.004 reward stays under
        // the 0.01 minimum
        store.set("test:balances:A", "0.003").await.unwrap();
        confirm_block(&blocks, "h1", 0.004, snapshot(&[("A", 100)])).await;
        distributor.run_cycle().await.unwrap();

        assert!(sender.sent.lock().unwrap().is_empty());
        assert!((distributor.worker_balance("A").await.unwrap() - 0.007).abs() < 1e-12);
        // The block is settled even though nothing was sent
        assert_eq!(blocks.counts().await.unwrap().paid, 1);

        // The next 0.004 pushes the candidate to 0.011 and pays out
        confirm_block(&blocks, "h2", 0.004, snapshot(&[("A", 100)])).await;
        distributor.run_cycle().await.unwrap();

        let sent = sender.sent.lock().unwrap();
        assert_eq!(sent.len(), 1);
        assert!((sent[0]["A"] - 0.011).abs() < 1e-12);
        drop(sent);
        assert_eq!(distributor.worker_balance("A").await.unwrap(), 0.0);
    }

    #[tokio::test]
    async fn test_failed_disbursement_changes_nothing() {
        let store = Arc::new(MemoryStore::new());
        let (distributor, blocks) =
            distributor(store.clone(), 0.01, vec![], Arc::new(FailingSender));

        store.set("test:balances:A", "0.5").await.unwrap();
        confirm_block(&blocks, "h1", 50.0, snapshot(&[("A", 100)])).await;
        distributor.run_cycle().await.unwrap();

        // Block still confirmed, carried balance untouched
        assert_eq!(blocks.confirmed_unpaid().await.unwrap().len(), 1);
        assert_eq!(distributor.worker_balance("A").await.unwrap(), 0.5);
        assert_eq!(
            distributor.payment_stats().await.unwrap().total_payments,
            0
        );
    }

    #[tokio::test]
    async fn test_zero_weight_block_is_skipped() {
        let store = Arc::new(MemoryStore::new());
        let sender = Arc::new(RecordingSender::default());
        let (distributor, blocks) = distributor(store, 0.01, vec![], sender.clone());

        confirm_block(&blocks, "h1", 50.0, HashMap::new()).await;
        distributor.run_cycle().await.unwrap();

        assert!(sender.sent.lock().unwrap().is_empty());
        // No payees: the block stays confirmed-unpaid
        assert_eq!(blocks.confirmed_unpaid().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_worker_payment_history_is_newest_first() {
        let store = Arc::new(MemoryStore::new());
        let sender = Arc::new(RecordingSender::default());
        let (distributor, blocks) = distributor(store, 0.01, vec![], sender);

        confirm_block(&blocks, "h1", 10.0, snapshot(&[("A", 100)])).await;
        distributor.run_cycle().await.unwrap();
        confirm_block(&blocks, "h2", 20.0, snapshot(&[("A", 100)])).await;
        distributor.run_cycle().await.unwrap();

        let history = distributor.worker_payment_history("A", 10).await.unwrap();
        assert_eq!(history.len(), 2);
        assert!(history[0].timestamp >= history[1].timestamp);
        assert_eq!(history[0].txid, "tx2");

        assert!(distributor
            .worker_payment_history("nobody", 10)
            .await
            .unwrap()
            .is_empty());
    }
}
