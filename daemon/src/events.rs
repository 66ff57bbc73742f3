// Pool events published by the listeners and consumed by the
// orchestrator's subscriber loop. One bounded channel per pool keeps
// ordering and backpressure explicit instead of fanning out callbacks.

use std::net::IpAddr;

use minepool_common::time::TimestampMillis;

/// Capacity of the per-pool event channel
pub const EVENT_CHANNEL_SIZE: usize = 1024;

#[derive(Debug, Clone)]
pub enum PoolEvent {
    Connected {
        session_id: u64,
        ip: IpAddr,
        port: u16,
    },
    Subscribed {
        session_id: u64,
    },
    Authorized {
        session_id: u64,
        worker: String,
        difficulty: f64,
    },
    Disconnected {
        session_id: u64,
        worker: Option<String>,
    },
    ShareAccepted {
        worker: String,
        difficulty: f64,
        is_block: bool,
    },
    ShareRejected {
        worker: String,
    },
    DifficultyChanged {
        session_id: u64,
        difficulty: f64,
    },
    IpBanned {
        ip: IpAddr,
        until: TimestampMillis,
    },
    BlockFound {
        height: u64,
        hash: String,
        worker: String,
    },
}
