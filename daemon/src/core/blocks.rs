// Block registry: lifecycle of blocks the pool has discovered.
//
// Blocks move pending -> confirmed -> paid, or pending -> orphaned.
// Each status is one store hash keyed by block hash, so moving a block
// is a delete from one hash and an insert into the next.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use log::{debug, info};
use metrics::counter;
use minepool_common::time::{get_current_time_in_millis, TimestampMillis};
use serde::{Deserialize, Serialize};

use crate::core::error::PoolError;
use crate::core::storage::SharedStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BlockStatus {
    /// Discovered, waiting for confirmations
    Pending,
    /// Reached the confirmation threshold, payable
    Confirmed,
    /// Excluded from the canonical chain; terminal
    Orphaned,
    /// Reward distributed; terminal
    Paid,
}

impl BlockStatus {
    pub const ALL: [BlockStatus; 4] = [
        BlockStatus::Pending,
        BlockStatus::Confirmed,
        BlockStatus::Orphaned,
        BlockStatus::Paid,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            BlockStatus::Pending => "pending",
            BlockStatus::Confirmed => "confirmed",
            BlockStatus::Orphaned => "orphaned",
            BlockStatus::Paid => "paid",
        }
    }
}

impl fmt::Display for BlockStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Block {
    pub hash: String,
    pub height: u64,
    /// Coin amount of the block reward
    pub reward: f64,
    pub discovered_by: String,
    pub discovered_at: TimestampMillis,
    /// Round weights frozen at the instant of discovery; the payment
    /// computation runs against this copy, never the live round
    pub share_snapshot: HashMap<String, u64>,
    pub confirmations: u32,
    pub status: BlockStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub paid_at: Option<TimestampMillis>,
}

/// Block counts by status, for stats
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct BlockCounts {
    pub pending: usize,
    pub confirmed: usize,
    pub orphaned: usize,
    pub paid: usize,
}

pub struct BlockRegistry<S: SharedStore> {
    store: Arc<S>,
    pool: String,
    required_confirmations: u32,
}

impl<S: SharedStore> BlockRegistry<S> {
    pub fn new(store: Arc<S>, pool: String, required_confirmations: u32) -> Self {
        Self {
            store,
            pool,
            required_confirmations,
        }
    }

    fn status_key(&self, status: BlockStatus) -> String {
        format!("{}:blocks:{}", self.pool, status)
    }

    async fn read(&self, status: BlockStatus, hash: &str) -> Result<Option<Block>, PoolError> {
        match self.store.hash_get(&self.status_key(status), hash).await? {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    async fn write(&self, block: &Block) -> Result<(), PoolError> {
        self.store
            .hash_set(
                &self.status_key(block.status),
                &block.hash,
                &serde_json::to_string(block)?,
            )
            .await?;
        Ok(())
    }

    /// Move a block between status hashes, updating its status field
    async fn transition(
        &self,
        mut block: Block,
        from: BlockStatus,
        to: BlockStatus,
    ) -> Result<Block, PoolError> {
        self.store.hash_del(&self.status_key(from), &block.hash).await?;
        block.status = to;
        self.write(&block).await?;
        Ok(block)
    }

    /// Find a block in any status hash
    async fn locate(&self, hash: &str) -> Result<Option<Block>, PoolError> {
        for status in BlockStatus::ALL {
            if let Some(block) = self.read(status, hash).await? {
                return Ok(Some(block));
            }
        }
        Ok(None)
    }

    /// Record a newly discovered block in `pending` with the round
    /// snapshot frozen at discovery time
    pub async fn record_discovery(
        &self,
        height: u64,
        hash: &str,
        reward: f64,
        discovered_by: &str,
        share_snapshot: HashMap<String, u64>,
    ) -> Result<Block, PoolError> {
        if self.locate(hash).await?.is_some() {
            return Err(PoolError::DuplicateBlock(hash.to_owned()));
        }

        let block = Block {
            hash: hash.to_owned(),
            height,
            reward,
            discovered_by: discovered_by.to_owned(),
            discovered_at: get_current_time_in_millis(),
            share_snapshot,
            confirmations: 0,
            status: BlockStatus::Pending,
            paid_at: None,
        };
        self.write(&block).await?;

        counter!("minepool_blocks_discovered").increment(1);
        info!(
            "pool {} block {} found at height {} by {} (reward {})",
            self.pool, hash, height, discovered_by, reward
        );
        Ok(block)
    }

    /// Advance the confirmation count; a pending block reaching the
    /// threshold becomes confirmed and is picked up by the next payment
    /// cycle (the distributor polls, nothing is pushed)
    pub async fn update_confirmations(
        &self,
        hash: &str,
        confirmations: u32,
    ) -> Result<BlockStatus, PoolError> {
        if let Some(mut block) = self.read(BlockStatus::Pending, hash).await? {
            block.confirmations = confirmations;
            if confirmations >= self.required_confirmations {
                let block = self
                    .transition(block, BlockStatus::Pending, BlockStatus::Confirmed)
                    .await?;
                info!(
                    "pool {} block {} confirmed at {} confirmations",
                    self.pool, hash, confirmations
                );
                return Ok(block.status);
            }
            self.write(&block).await?;
            return Ok(BlockStatus::Pending);
        }

        // Already past pending: keep the count fresh on confirmed blocks
        if let Some(mut block) = self.read(BlockStatus::Confirmed, hash).await? {
            block.confirmations = confirmations;
            self.write(&block).await?;
            return Ok(BlockStatus::Confirmed);
        }

        Err(PoolError::UnknownBlock(hash.to_owned()))
    }

    /// Mark a pending block orphaned. Returns the block so the caller can
    /// merge its snapshot back into the active round.
    pub async fn mark_orphaned(&self, hash: &str) -> Result<Block, PoolError> {
        match self.read(BlockStatus::Pending, hash).await? {
            Some(block) => {
                let block = self
                    .transition(block, BlockStatus::Pending, BlockStatus::Orphaned)
                    .await?;
                counter!("minepool_blocks_orphaned").increment(1);
                Ok(block)
            }
            None => match self.locate(hash).await? {
                Some(block) => Err(PoolError::InvalidBlockState {
                    hash: hash.to_owned(),
                    expected: BlockStatus::Pending.as_str(),
                    actual: block.status.as_str(),
                }),
                None => Err(PoolError::UnknownBlock(hash.to_owned())),
            },
        }
    }

    /// Mark a confirmed block paid
    pub async fn mark_paid(&self, hash: &str) -> Result<Block, PoolError> {
        match self.read(BlockStatus::Confirmed, hash).await? {
            Some(mut block) => {
                block.paid_at = Some(get_current_time_in_millis());
                let block = self
                    .transition(block, BlockStatus::Confirmed, BlockStatus::Paid)
                    .await?;
                debug!("pool {} block {} marked paid", self.pool, hash);
                Ok(block)
            }
            None => match self.locate(hash).await? {
                Some(block) => Err(PoolError::InvalidBlockState {
                    hash: hash.to_owned(),
                    expected: BlockStatus::Confirmed.as_str(),
                    actual: block.status.as_str(),
                }),
                None => Err(PoolError::UnknownBlock(hash.to_owned())),
            },
        }
    }

    /// All confirmed blocks awaiting payment
    pub async fn confirmed_unpaid(&self) -> Result<Vec<Block>, PoolError> {
        let raw = self
            .store
            .hash_get_all(&self.status_key(BlockStatus::Confirmed))
            .await?;
        let mut blocks = Vec::with_capacity(raw.len());
        for (_, value) in raw {
            blocks.push(serde_json::from_str(&value)?);
        }
        // Oldest first so payments settle in discovery order
        blocks.sort_by_key(|b: &Block| b.height);
        Ok(blocks)
    }

    pub async fn counts(&self) -> Result<BlockCounts, PoolError> {
        Ok(BlockCounts {
            pending: self
                .store
                .hash_len(&self.status_key(BlockStatus::Pending))
                .await?,
            confirmed: self
                .store
                .hash_len(&self.status_key(BlockStatus::Confirmed))
                .await?,
            orphaned: self
                .store
                .hash_len(&self.status_key(BlockStatus::Orphaned))
                .await?,
            paid: self
                .store
                .hash_len(&self.status_key(BlockStatus::Paid))
                .await?,
        })
    }
}
