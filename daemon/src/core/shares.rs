// Round ledger: per-pool accounting of proof-of-work weight.
//
// The active round's accumulator lives in the shared store under a single
// hash key, so any number of worker processes can credit shares
// concurrently. Rotation takes that one key atomically, which is the only
// way a credit racing a block discovery cannot be lost.

use std::collections::HashMap;
use std::sync::Arc;

use log::{debug, warn};
use metrics::counter;
use minepool_common::time::{get_current_time_in_millis, TimestampMillis};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::config::{DEFAULT_HASHRATE_WINDOW_SECS, HASHRATE_RETENTION_SECS, HASHRATE_SERIES_TTL_SECS};
use crate::core::error::PoolError;
use crate::core::storage::SharedStore;

/// Metadata of the active round. The authoritative copy lives in the
/// store so a restarted process resumes the same round.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoundMeta {
    /// Block height this round is mining toward
    pub height: u64,

    /// When the round was opened
    pub started_at: TimestampMillis,
}

/// A closed round: its metadata plus the captured per-worker weights
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Round {
    pub height: u64,
    pub started_at: TimestampMillis,
    pub weights: HashMap<String, u64>,
}

impl Round {
    pub fn total_weight(&self) -> u64 {
        self.weights.values().sum()
    }
}

/// Read-only view of the active round for stats
#[derive(Debug, Clone, Serialize)]
pub struct RoundInfo {
    pub height: u64,
    pub started_at: TimestampMillis,
    pub duration_ms: u64,
    pub weights: HashMap<String, u64>,
    pub total_weight: u64,
}

/// Per-worker counters kept alongside the round accumulator
#[derive(Debug, Clone, Serialize)]
pub struct WorkerStats {
    pub worker: String,
    pub valid_shares: u64,
    pub invalid_shares: u64,
    pub last_share: Option<TimestampMillis>,
    pub hashrate: f64,
    /// Percentage of processed shares that were valid
    pub efficiency: f64,
}

pub struct RoundLedger<S: SharedStore> {
    store: Arc<S>,
    pool: String,
    meta: RwLock<RoundMeta>,
}

impl<S: SharedStore> RoundLedger<S> {
    /// Load the active round from the store, opening round 0 when the
    /// pool has never run before
    pub async fn load(store: Arc<S>, pool: String) -> Result<Self, PoolError> {
        let round_key = format!("{}:round", pool);
        let meta = match store.get(&round_key).await? {
            Some(raw) => serde_json::from_str(&raw)?,
            None => {
                let meta = RoundMeta {
                    height: 0,
                    started_at: get_current_time_in_millis(),
                };
                store.set(&round_key, &serde_json::to_string(&meta)?).await?;
                meta
            }
        };

        debug!("pool {} resuming round at height {}", pool, meta.height);
        Ok(Self {
            store,
            pool,
            meta: RwLock::new(meta),
        })
    }

    fn shares_key(&self) -> String {
        format!("{}:shares:current", self.pool)
    }

    fn round_key(&self) -> String {
        format!("{}:round", self.pool)
    }

    fn archive_key(&self, height: u64) -> String {
        format!("{}:rounds:{}", self.pool, height)
    }

    fn worker_key(&self, worker: &str) -> String {
        format!("{}:workers:{}", self.pool, worker)
    }

    fn hashrate_key(&self, worker: &str) -> String {
        format!("{}:hashrate:{}", self.pool, worker)
    }

    fn hashrate_prefix(&self) -> String {
        format!("{}:hashrate:", self.pool)
    }

    fn stats_key(&self) -> String {
        format!("{}:stats", self.pool)
    }

    /// Atomically add `weight` to the worker's accumulator in the active
    /// round. Safe under concurrent callers in any number of processes.
    pub async fn credit_share(&self, worker: &str, weight: u64) -> Result<u64, PoolError> {
        let total = self
            .store
            .hash_incr_by(&self.shares_key(), worker, weight)
            .await?;
        counter!("minepool_shares_credited").increment(1);
        Ok(total)
    }

    /// Close the active round and open a fresh one at `new_height`.
    ///
    /// The accumulator is consumed with a single atomic take, so every
    /// concurrent credit lands either in the returned snapshot or in the
    /// new round. The closed round is archived under its height key.
    pub async fn snapshot_and_rotate(&self, new_height: u64) -> Result<Round, PoolError> {
        let raw = self.store.hash_take(&self.shares_key()).await?;

        let mut meta = self.meta.write().await;
        let closed = Round {
            height: meta.height,
            started_at: meta.started_at,
            weights: parse_weights(raw),
        };

        self.store
            .set(
                &self.archive_key(closed.height),
                &serde_json::to_string(&closed)?,
            )
            .await?;

        *meta = RoundMeta {
            height: new_height,
            started_at: get_current_time_in_millis(),
        };
        self.store
            .set(&self.round_key(), &serde_json::to_string(&*meta)?)
            .await?;

        debug!(
            "pool {} rotated round {} ({} workers, {} weight) -> {}",
            self.pool,
            closed.height,
            closed.weights.len(),
            closed.total_weight(),
            new_height
        );
        Ok(closed)
    }

    /// Re-credit a captured snapshot into the active round. Used when a
    /// block is orphaned so its contributors keep their weight.
    pub async fn merge_back(&self, snapshot: &HashMap<String, u64>) -> Result<(), PoolError> {
        let key = self.shares_key();
        for (worker, weight) in snapshot {
            if *weight > 0 {
                self.store.hash_incr_by(&key, worker, *weight).await?;
            }
        }
        counter!("minepool_rounds_merged_back").increment(1);
        Ok(())
    }

    pub async fn round_info(&self) -> Result<RoundInfo, PoolError> {
        let meta = self.meta.read().await.clone();
        let weights = parse_weights(self.store.hash_get_all(&self.shares_key()).await?);
        let total_weight = weights.values().sum();
        Ok(RoundInfo {
            height: meta.height,
            started_at: meta.started_at,
            duration_ms: get_current_time_in_millis().saturating_sub(meta.started_at),
            weights,
            total_weight,
        })
    }

    /// Update worker and pool counters for an accepted share and append
    /// it to the worker's hashrate time-series
    pub async fn record_valid_share(&self, worker: &str, difficulty: f64) -> Result<(), PoolError> {
        let now = get_current_time_in_millis();
        let worker_key = self.worker_key(worker);
        self.store
            .hash_set(&worker_key, "last_share", &now.to_string())
            .await?;
        self.store.hash_incr_by(&worker_key, "valid_shares", 1).await?;

        let series_key = self.hashrate_key(worker);
        self.store
            .sorted_add(&series_key, now, &format!("{}:{}", now, difficulty))
            .await?;
        self.store.expire(&series_key, HASHRATE_SERIES_TTL_SECS).await?;

        let stats_key = self.stats_key();
        self.store.hash_incr_by(&stats_key, "valid_shares", 1).await?;
        self.store
            .hash_set(&stats_key, "last_update", &now.to_string())
            .await?;
        Ok(())
    }

    /// Update worker and pool counters for a rejected share
    pub async fn record_invalid_share(&self, worker: &str) -> Result<(), PoolError> {
        self.store
            .hash_incr_by(&self.worker_key(worker), "invalid_shares", 1)
            .await?;
        self.store
            .hash_incr_by(&self.stats_key(), "invalid_shares", 1)
            .await?;
        Ok(())
    }

    pub async fn record_block_found(&self) -> Result<(), PoolError> {
        self.store
            .hash_incr_by(&self.stats_key(), "blocks_found", 1)
            .await?;
        Ok(())
    }

    /// Estimated hashrate over the window: sum of accepted difficulty
    /// times 2^32, divided by the window length
    pub async fn worker_hashrate(&self, worker: &str, window_secs: u64) -> Result<f64, PoolError> {
        let now = get_current_time_in_millis();
        let since = now.saturating_sub(window_secs * 1000);
        let entries = self
            .store
            .sorted_range_by_score(&self.hashrate_key(worker), since, now)
            .await?;
        if entries.is_empty() {
            return Ok(0.0);
        }

        let mut total_difficulty = 0.0;
        for entry in &entries {
            match entry.split_once(':').and_then(|(_, d)| d.parse::<f64>().ok()) {
                Some(difficulty) => total_difficulty += difficulty,
                None => warn!("malformed hashrate entry for {}: {}", worker, entry),
            }
        }
        Ok(total_difficulty * 2f64.powi(32) / window_secs as f64)
    }

    pub async fn worker_stats(&self, worker: &str) -> Result<Option<WorkerStats>, PoolError> {
        let fields = self.store.hash_get_all(&self.worker_key(worker)).await?;
        if fields.is_empty() {
            return Ok(None);
        }

        let valid = parse_field(&fields, "valid_shares");
        let invalid = parse_field(&fields, "invalid_shares");
        let total = valid + invalid;
        let efficiency = if total == 0 {
            100.0
        } else {
            valid as f64 / total as f64 * 100.0
        };

        Ok(Some(WorkerStats {
            worker: worker.to_owned(),
            valid_shares: valid,
            invalid_shares: invalid,
            last_share: fields.get("last_share").and_then(|v| v.parse().ok()),
            hashrate: self
                .worker_hashrate(worker, DEFAULT_HASHRATE_WINDOW_SECS)
                .await?,
            efficiency,
        }))
    }

    /// Trim hashrate series entries past the retention horizon
    pub async fn prune_hashrate_data(&self) -> Result<(), PoolError> {
        let cutoff = get_current_time_in_millis().saturating_sub(HASHRATE_RETENTION_SECS * 1000);
        for key in self.store.keys(&self.hashrate_prefix()).await? {
            self.store
                .sorted_remove_range_by_score(&key, 0, cutoff)
                .await?;
        }
        debug!("pool {} pruned hashrate series", self.pool);
        Ok(())
    }
}

fn parse_weights(raw: HashMap<String, String>) -> HashMap<String, u64> {
    raw.into_iter()
        .filter_map(|(worker, value)| match value.parse() {
            Ok(weight) => Some((worker, weight)),
            Err(_) => {
                warn!("dropping malformed share weight for {}: {}", worker, value);
                None
            }
        })
        .collect()
}

fn parse_field(fields: &HashMap<String, String>, name: &str) -> u64 {
    fields.get(name).and_then(|v| v.parse().ok()).unwrap_or(0)
}
