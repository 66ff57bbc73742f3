use thiserror::Error;

/// Failure of a shared-store operation. The store is an external
/// collaborator, so everything funnels into an opaque backend message;
/// callers decide whether the operation is retryable.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store backend error: {0}")]
    Backend(String),
}

#[derive(Debug, Error)]
pub enum PoolError {
    #[error("failed to bind stratum port {port}: {source}")]
    Bind {
        port: u16,
        source: std::io::Error,
    },

    #[error("connection limit reached ({0} active)")]
    ConnectionLimit(usize),

    #[error("invalid worker credentials")]
    Auth,

    #[error("malformed message: {0}")]
    Protocol(String),

    #[error("invalid share: {0}")]
    InvalidShare(String),

    #[error("block {0} already recorded")]
    DuplicateBlock(String),

    #[error("block {0} not found")]
    UnknownBlock(String),

    #[error("block {hash} is {actual}, expected {expected}")]
    InvalidBlockState {
        hash: String,
        expected: &'static str,
        actual: &'static str,
    },

    #[error("disbursement failed: {0}")]
    Disbursement(String),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Any(#[from] anyhow::Error),
}
