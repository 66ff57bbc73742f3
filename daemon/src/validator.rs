// Collaborator interfaces consumed by the pool core.
//
// Proof-of-work verification and wallet RPC both live outside this
// process; the core only depends on these traits and receives
// implementations at construction time.

use async_trait::async_trait;
use indexmap::IndexMap;
use minepool_common::config::MAX_EXTRA_NONCE2_HEX_LENGTH;
use minepool_common::stratum::Share;

use crate::core::error::PoolError;
use crate::stratum::session::SessionInfo;

/// A block found by a share that met network difficulty
#[derive(Debug, Clone)]
pub struct BlockFound {
    pub height: u64,
    pub hash: String,
    pub reward: f64,
    pub difficulty: f64,
}

/// Verdict returned by the external share validator
#[derive(Debug, Clone)]
pub struct ShareVerdict {
    pub valid: bool,
    /// Set when the share also solved a block
    pub block: Option<BlockFound>,
}

impl ShareVerdict {
    pub fn valid() -> Self {
        Self {
            valid: true,
            block: None,
        }
    }

    pub fn invalid() -> Self {
        Self {
            valid: false,
            block: None,
        }
    }

    pub fn block(block: BlockFound) -> Self {
        Self {
            valid: true,
            block: Some(block),
        }
    }
}

/// Decides whether a submitted share is acceptable proof-of-work and
/// whether it found a block. The pool awaits the verdict before
/// answering the miner.
#[async_trait]
pub trait ShareValidator: Send + Sync + 'static {
    async fn validate(&self, session: &SessionInfo, share: &Share)
        -> Result<ShareVerdict, PoolError>;
}

/// Submits one batched payout to the coin daemon wallet.
/// Returns the transaction id on success.
#[async_trait]
pub trait DisbursementSender: Send + Sync + 'static {
    async fn send(&self, payouts: &IndexMap<String, f64>) -> Result<String, PoolError>;
}

/// Authorization policy for worker names. The default accepts any
/// non-empty name; deployments plug in address validation here.
#[async_trait]
pub trait WorkerValidator: Send + Sync + 'static {
    async fn validate(&self, worker: &str, password: &str) -> bool;
}

/// Default worker policy: any non-empty name is accepted
#[derive(Debug, Default)]
pub struct NonEmptyWorkerValidator;

#[async_trait]
impl WorkerValidator for NonEmptyWorkerValidator {
    async fn validate(&self, worker: &str, _password: &str) -> bool {
        !worker.is_empty()
    }
}

/// Format-only validator used when no external validator is wired in.
/// It checks the share fields are well-formed hex of sane length and
/// never reports a block.
#[derive(Debug, Default)]
pub struct FormatValidator;

impl FormatValidator {
    fn check(share: &Share) -> Result<(), &'static str> {
        if share.job_id.is_empty() {
            return Err("empty job id");
        }
        if hex::decode(&share.nonce).is_err() {
            return Err("nonce is not hex");
        }
        if hex::decode(&share.ntime).is_err() {
            return Err("ntime is not hex");
        }
        if share.extra_nonce2.len() > MAX_EXTRA_NONCE2_HEX_LENGTH {
            return Err("extra nonce2 too long");
        }
        if !share.extra_nonce2.is_empty() && hex::decode(&share.extra_nonce2).is_err() {
            return Err("extra nonce2 is not hex");
        }
        Ok(())
    }
}

#[async_trait]
impl ShareValidator for FormatValidator {
    async fn validate(
        &self,
        _session: &SessionInfo,
        share: &Share,
    ) -> Result<ShareVerdict, PoolError> {
        Ok(match Self::check(share) {
            Ok(()) => ShareVerdict::valid(),
            Err(_) => ShareVerdict::invalid(),
        })
    }
}
