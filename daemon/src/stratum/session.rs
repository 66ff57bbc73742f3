// Per-connection session state.
//
// The connection task owns the mutable `Session`. A shared
// `SessionHandle` carries the few fields other components need: the
// idle watchdog reads activity timestamps, stats reads counters, and
// broadcasts go through the outbound channel. Everything shared is an
// atomic or a channel, so no lock is held across the listener.

use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use log::trace;
use minepool_common::time::{get_current_time_in_millis, TimestampMillis};
use serde::Serialize;
use tokio::sync::{mpsc, Notify};

use crate::stratum::vardiff::VarDiff;

/// Outbound frames queued per session before the writer applies
/// backpressure; broadcast pushes drop when the queue is full
pub const SESSION_OUTBOUND_CAPACITY: usize = 64;

/// Read-only identity of a session, handed to collaborators
#[derive(Debug, Clone)]
pub struct SessionInfo {
    pub id: u64,
    pub ip: IpAddr,
    pub port: u16,
    pub worker: Option<String>,
    pub difficulty: f64,
}

/// Stats snapshot of one live session
#[derive(Debug, Clone, Serialize)]
pub struct SessionSnapshot {
    pub id: u64,
    pub ip: IpAddr,
    pub worker: Option<String>,
    pub authorized: bool,
    pub difficulty: f64,
    pub valid_shares: u64,
    pub invalid_shares: u64,
    pub connected_at: TimestampMillis,
}

/// Shared view of a session, kept in the listener's session table
pub struct SessionHandle {
    id: u64,
    ip: IpAddr,
    connected_at: TimestampMillis,
    last_activity: AtomicU64,
    authorized: AtomicBool,
    worker: RwLock<Option<String>>,
    // f64 difficulty stored through its bit pattern
    difficulty_bits: AtomicU64,
    valid_shares: AtomicU64,
    invalid_shares: AtomicU64,
    outbound: mpsc::Sender<String>,
    close: Notify,
    closed: AtomicBool,
}

impl SessionHandle {
    pub fn new(
        id: u64,
        ip: IpAddr,
        difficulty: f64,
        outbound: mpsc::Sender<String>,
    ) -> Self {
        let now = get_current_time_in_millis();
        Self {
            id,
            ip,
            connected_at: now,
            last_activity: AtomicU64::new(now),
            authorized: AtomicBool::new(false),
            worker: RwLock::new(None),
            difficulty_bits: AtomicU64::new(difficulty.to_bits()),
            valid_shares: AtomicU64::new(0),
            invalid_shares: AtomicU64::new(0),
            outbound,
            close: Notify::new(),
            closed: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn ip(&self) -> IpAddr {
        self.ip
    }

    /// Record traffic on the connection
    pub fn touch(&self) {
        self.last_activity
            .store(get_current_time_in_millis(), Ordering::Relaxed);
    }

    /// Milliseconds since the last traffic
    pub fn idle_ms(&self) -> u64 {
        get_current_time_in_millis().saturating_sub(self.last_activity.load(Ordering::Relaxed))
    }

    pub fn is_authorized(&self) -> bool {
        self.authorized.load(Ordering::Relaxed)
    }

    pub fn set_authorized(&self, worker: &str) {
        self.authorized.store(true, Ordering::Relaxed);
        if let Ok(mut guard) = self.worker.write() {
            *guard = Some(worker.to_owned());
        }
    }

    pub fn worker(&self) -> Option<String> {
        self.worker.read().ok().and_then(|w| w.clone())
    }

    pub fn difficulty(&self) -> f64 {
        f64::from_bits(self.difficulty_bits.load(Ordering::Relaxed))
    }

    pub fn set_difficulty(&self, difficulty: f64) {
        self.difficulty_bits
            .store(difficulty.to_bits(), Ordering::Relaxed);
    }

    pub fn count_valid(&self) {
        self.valid_shares.fetch_add(1, Ordering::Relaxed);
    }

    pub fn count_invalid(&self) {
        self.invalid_shares.fetch_add(1, Ordering::Relaxed);
    }

    /// Queue a frame for the session's writer; drops when the queue is
    /// full or the session is gone
    pub fn push_frame(&self, frame: String) -> bool {
        match self.outbound.try_send(frame) {
            Ok(()) => true,
            Err(e) => {
                trace!("session {} dropped outbound frame: {}", self.id, e);
                false
            }
        }
    }

    /// Ask the connection task to shut the session down
    pub fn close(&self) {
        self.closed.store(true, Ordering::Relaxed);
        self.close.notify_waiters();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Relaxed)
    }

    /// Resolves once `close` has been requested
    pub async fn closed(&self) {
        if self.is_closed() {
            return;
        }
        self.close.notified().await;
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            id: self.id,
            ip: self.ip,
            worker: self.worker(),
            authorized: self.is_authorized(),
            difficulty: self.difficulty(),
            valid_shares: self.valid_shares.load(Ordering::Relaxed),
            invalid_shares: self.invalid_shares.load(Ordering::Relaxed),
            connected_at: self.connected_at,
        }
    }
}

/// Mutable session state, owned by the connection task
pub struct Session {
    pub id: u64,
    pub ip: IpAddr,
    pub remote_port: u16,
    pub connected_at: TimestampMillis,
    pub authorized: bool,
    pub worker: Option<String>,
    pub subscription_id: Option<String>,
    pub difficulty: f64,
    pub vardiff: Option<VarDiff>,
    pub valid_shares: u64,
    pub invalid_shares: u64,
    pub handle: Arc<SessionHandle>,
}

impl Session {
    pub fn new(
        id: u64,
        ip: IpAddr,
        remote_port: u16,
        difficulty: f64,
        vardiff: Option<VarDiff>,
        handle: Arc<SessionHandle>,
    ) -> Self {
        Self {
            id,
            ip,
            remote_port,
            connected_at: get_current_time_in_millis(),
            authorized: false,
            worker: None,
            subscription_id: None,
            difficulty,
            vardiff,
            valid_shares: 0,
            invalid_shares: 0,
            handle,
        }
    }

    pub fn info(&self) -> SessionInfo {
        SessionInfo {
            id: self.id,
            ip: self.ip,
            port: self.remote_port,
            worker: self.worker.clone(),
            difficulty: self.difficulty,
        }
    }

    pub fn count_valid(&mut self) {
        self.valid_shares += 1;
        self.handle.count_valid();
    }

    pub fn count_invalid(&mut self) {
        self.invalid_shares += 1;
        self.handle.count_invalid();
    }
}
