// Stratum listener: one TCP port, many miner sessions.
//
// The accept loop admits connections (ban and capacity checks), spawns
// one task per session, and two maintenance tasks: the ban sweep and the
// idle watchdog. The watchdog polls every session's activity timestamp
// on a fixed cadence instead of arming a timer per session, which keeps
// overhead flat at thousands of connections.
//
// All protocol handling happens in the session task; the rest of the
// system observes sessions through events and read-only snapshots.

pub mod ban;
pub mod session;
pub mod vardiff;

use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use log::{debug, error, info, trace, warn};
use metrics::counter;
use minepool_common::config::MAX_LINE_SIZE;
use minepool_common::stratum::{
    subscribe_result, RpcMessage, RpcNotification, RpcResponse, Share, StratumError,
    ERR_INVALID_PARAMS, ERR_UNAUTHORIZED,
};
use minepool_common::time::get_current_time_in_millis;
use serde::Serialize;
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;

use crate::config::{BanConfig, VarDiffConfig, IDLE_SWEEP_INTERVAL_SECS};
use crate::core::error::PoolError;
use crate::events::PoolEvent;
use crate::validator::ShareVerdict;
use ban::BanRegistry;
use session::{
    Session, SessionHandle, SessionInfo, SessionSnapshot, SESSION_OUTBOUND_CAPACITY,
};
use vardiff::VarDiff;

/// Settings for one listener
#[derive(Debug, Clone)]
pub struct StratumOptions {
    pub bind_address: IpAddr,
    pub port: u16,
    pub difficulty: f64,
    pub vardiff: Option<VarDiffConfig>,
    pub max_connections: usize,
    pub connection_timeout_secs: u64,
    pub banning: BanConfig,
}

/// What the listener needs from the rest of the pool: a worker
/// authorization policy and a share pipeline. The share pipeline must
/// credit the ledger before returning a valid verdict, since the miner
/// is acknowledged as soon as the verdict comes back.
#[async_trait]
pub trait StratumHandler: Send + Sync + 'static {
    async fn authorize_worker(&self, worker: &str, password: &str) -> Result<bool, PoolError>;

    async fn submit_share(
        &self,
        session: &SessionInfo,
        share: Share,
    ) -> Result<ShareVerdict, PoolError>;
}

/// Per-port stats snapshot
#[derive(Debug, Clone, Serialize)]
pub struct ListenerStats {
    pub port: u16,
    pub connections: usize,
    pub banned_ips: usize,
    pub sessions: Vec<SessionSnapshot>,
}

enum Disposition {
    Continue,
    Close,
}

pub struct StratumListener {
    options: StratumOptions,
    /// Actual bound port; differs from options.port when binding port 0
    port: u16,
    handler: Arc<dyn StratumHandler>,
    events: mpsc::Sender<PoolEvent>,
    sessions: DashMap<u64, Arc<SessionHandle>>,
    bans: BanRegistry,
    connections: AtomicUsize,
    next_session_id: AtomicU64,
    running: AtomicBool,
    shutdown: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl StratumListener {
    /// Bind the port and start accepting connections
    pub async fn start(
        options: StratumOptions,
        handler: Arc<dyn StratumHandler>,
        events: mpsc::Sender<PoolEvent>,
    ) -> Result<Arc<Self>, PoolError> {
        let listener = TcpListener::bind((options.bind_address, options.port))
            .await
            .map_err(|source| PoolError::Bind {
                port: options.port,
                source,
            })?;
        let port = listener
            .local_addr()
            .map_err(|source| PoolError::Bind {
                port: options.port,
                source,
            })?
            .port();

        info!(
            "stratum listening on {}:{} (difficulty {}, vardiff {})",
            options.bind_address,
            port,
            options.difficulty,
            options.vardiff.is_some()
        );

        let (shutdown, _) = watch::channel(false);
        let bans = BanRegistry::new(options.banning.clone());
        let this = Arc::new(Self {
            options,
            port,
            handler,
            events,
            sessions: DashMap::new(),
            bans,
            connections: AtomicUsize::new(0),
            next_session_id: AtomicU64::new(1),
            running: AtomicBool::new(true),
            shutdown,
            tasks: Mutex::new(Vec::new()),
        });

        let mut tasks = vec![tokio::spawn(this.clone().accept_loop(listener))];
        if this.bans.enabled() {
            tasks.push(tokio::spawn(this.clone().ban_sweep()));
        }
        tasks.push(tokio::spawn(this.clone().idle_watchdog()));
        *this.tasks.lock().await = tasks;

        Ok(this)
    }

    /// Stop accepting, close every session, and wait for them to drain.
    /// Safe to call more than once.
    pub async fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        info!("stopping stratum listener on port {}", self.port);
        let _ = self.shutdown.send(true);

        for task in self.tasks.lock().await.drain(..) {
            if let Err(e) = task.await {
                warn!("listener task join failed: {}", e);
            }
        }

        // Close signals are re-issued while draining: a session racing
        // its own registration could otherwise miss the first one
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while !self.sessions.is_empty() {
            for entry in self.sessions.iter() {
                entry.close();
            }
            if tokio::time::Instant::now() >= deadline {
                warn!(
                    "{} session(s) still draining on port {}",
                    self.sessions.len(),
                    self.port
                );
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn connection_count(&self) -> usize {
        self.connections.load(Ordering::Relaxed)
    }

    pub fn stats(&self) -> ListenerStats {
        ListenerStats {
            port: self.port,
            connections: self.connection_count(),
            banned_ips: self.bans.len(),
            sessions: self.sessions.iter().map(|e| e.snapshot()).collect(),
        }
    }

    /// Push a notification to every authorized session on this port.
    /// Returns how many sessions it was queued for.
    pub fn broadcast_notification(&self, notification: &RpcNotification) -> usize {
        let frame = match serde_json::to_string(notification) {
            Ok(frame) => frame,
            Err(e) => {
                error!("failed to encode notification: {}", e);
                return 0;
            }
        };
        let mut count = 0;
        for entry in self.sessions.iter() {
            if entry.is_authorized() && entry.push_frame(frame.clone()) {
                count += 1;
            }
        }
        count
    }

    async fn emit(&self, event: PoolEvent) {
        if self.events.send(event).await.is_err() {
            trace!("pool event channel closed");
        }
    }

    async fn accept_loop(self: Arc<Self>, listener: TcpListener) {
        let mut shutdown = self.shutdown.subscribe();
        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => self.admit(stream, peer).await,
                    Err(e) => warn!("accept failed on port {}: {}", self.port, e),
                },
            }
        }
        debug!("accept loop on port {} exited", self.port);
    }

    /// Admission control, then hand the socket to its session task
    async fn admit(self: &Arc<Self>, stream: TcpStream, peer: SocketAddr) {
        let ip = peer.ip();
        if self.bans.is_banned(&ip) {
            debug!("rejected connection from banned ip {}", ip);
            counter!("minepool_connections_rejected").increment(1);
            return;
        }

        let active = self.connections.load(Ordering::Relaxed);
        if active >= self.options.max_connections {
            warn!("connection limit reached ({}), rejecting {}", active, ip);
            counter!("minepool_connections_rejected").increment(1);
            return;
        }
        self.connections.fetch_add(1, Ordering::Relaxed);

        if let Err(e) = stream.set_nodelay(true) {
            trace!("set_nodelay failed for {}: {}", peer, e);
        }

        let id = self.next_session_id.fetch_add(1, Ordering::Relaxed);
        let (outbound_tx, outbound_rx) = mpsc::channel(SESSION_OUTBOUND_CAPACITY);
        let handle = Arc::new(SessionHandle::new(id, ip, self.options.difficulty, outbound_tx));
        self.sessions.insert(id, handle.clone());

        let vardiff = self
            .options
            .vardiff
            .clone()
            .map(|config| VarDiff::new(config, get_current_time_in_millis()));
        let session = Session::new(id, ip, peer.port(), self.options.difficulty, vardiff, handle);

        debug!("new connection from {} (session {})", peer, id);
        self.emit(PoolEvent::Connected {
            session_id: id,
            ip,
            port: self.port,
        })
        .await;

        let this = self.clone();
        tokio::spawn(async move {
            let session = this.run_session(stream, session, outbound_rx).await;
            this.sessions.remove(&session.id);
            this.connections.fetch_sub(1, Ordering::Relaxed);
            debug!("session {} disconnected", session.id);
            this.emit(PoolEvent::Disconnected {
                session_id: session.id,
                worker: session.worker,
            })
            .await;
        });
    }

    /// Session loop: multiplex inbound lines, queued outbound frames,
    /// and the close signal. Returns the final session state.
    async fn run_session(
        self: &Arc<Self>,
        stream: TcpStream,
        mut session: Session,
        mut outbound_rx: mpsc::Receiver<String>,
    ) -> Session {
        let (read_half, mut write_half) = stream.into_split();
        let mut lines = BufReader::new(read_half).lines();
        let handle = session.handle.clone();

        'main: loop {
            tokio::select! {
                _ = handle.closed() => break,
                frame = outbound_rx.recv() => match frame {
                    Some(frame) => {
                        if write_frame(&mut write_half, &frame).await.is_err() {
                            break;
                        }
                    }
                    None => break,
                },
                read = lines.next_line() => match read {
                    Ok(Some(line)) => {
                        session.handle.touch();
                        if line.len() > MAX_LINE_SIZE {
                            debug!("session {} sent an oversized line, closing", session.id);
                            break;
                        }
                        let raw = line.trim();
                        if raw.is_empty() {
                            continue;
                        }

                        let mut out = Vec::new();
                        let disposition = self.handle_message(&mut session, raw, &mut out).await;
                        for frame in &out {
                            if write_frame(&mut write_half, frame).await.is_err() {
                                break 'main;
                            }
                        }
                        if matches!(disposition, Disposition::Close) {
                            break;
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        trace!("session {} read error: {}", session.id, e);
                        break;
                    }
                },
            }
        }
        session
    }

    /// One protocol message through the state machine. Responses are
    /// collected in `out` and written by the caller in order.
    async fn handle_message(
        &self,
        session: &mut Session,
        raw: &str,
        out: &mut Vec<String>,
    ) -> Disposition {
        let msg: RpcMessage = match serde_json::from_str(raw) {
            Ok(msg) => msg,
            Err(_) => {
                debug!("session {} sent invalid JSON", session.id);
                push(out, &RpcResponse::err(None, StratumError::parse_error()));
                return Disposition::Continue;
            }
        };

        if !msg.is_well_formed() {
            push(out, &RpcResponse::err(msg.id, StratumError::invalid_request()));
            return Disposition::Continue;
        }

        let Some(method) = msg.method.clone() else {
            // Response frames from the client carry no method; ignored
            return Disposition::Continue;
        };

        match method.as_str() {
            "mining.subscribe" => self.handle_subscribe(session, msg, out).await,
            "mining.authorize" => self.handle_authorize(session, msg, out).await,
            "mining.submit" => self.handle_submit(session, msg, out).await,
            "mining.get_transactions" => {
                // Stub, kept for miner compatibility
                push(out, &RpcResponse::ok(msg.id, Value::Array(Vec::new())));
                Disposition::Continue
            }
            _ => {
                debug!("session {} called unknown method {}", session.id, method);
                push(out, &RpcResponse::err(msg.id, StratumError::unknown_method()));
                Disposition::Continue
            }
        }
    }

    async fn handle_subscribe(
        &self,
        session: &mut Session,
        msg: RpcMessage,
        out: &mut Vec<String>,
    ) -> Disposition {
        let subscription_id = format!("{:016x}", rand::random::<u64>());
        session.subscription_id = Some(subscription_id.clone());

        push(out, &RpcResponse::ok(msg.id, subscribe_result(&subscription_id)));
        debug!(
            "session {} subscribed as {}",
            session.id, subscription_id
        );
        self.emit(PoolEvent::Subscribed {
            session_id: session.id,
        })
        .await;
        Disposition::Continue
    }

    async fn handle_authorize(
        &self,
        session: &mut Session,
        msg: RpcMessage,
        out: &mut Vec<String>,
    ) -> Disposition {
        let (worker, password) = {
            let params = msg.params();
            (
                params
                    .first()
                    .and_then(|v| v.as_str())
                    .unwrap_or("")
                    .to_owned(),
                params
                    .get(1)
                    .and_then(|v| v.as_str())
                    .unwrap_or("")
                    .to_owned(),
            )
        };

        let accepted = if worker.is_empty() {
            false
        } else {
            match self.handler.authorize_worker(&worker, &password).await {
                Ok(accepted) => accepted,
                Err(e) => {
                    warn!("session {} authorization failed: {}", session.id, e);
                    false
                }
            }
        };

        if !accepted {
            push(
                out,
                &RpcResponse::err(
                    msg.id,
                    StratumError::new(ERR_UNAUTHORIZED, "Invalid worker credentials"),
                ),
            );
            return Disposition::Close;
        }

        session.authorized = true;
        session.worker = Some(worker.clone());
        session.handle.set_authorized(&worker);

        push(out, &RpcResponse::ok(msg.id, Value::Bool(true)));
        // The miner needs its starting difficulty before the first job
        push(out, &RpcNotification::set_difficulty(session.difficulty));

        info!("session {} authorized as {}", session.id, worker);
        self.emit(PoolEvent::Authorized {
            session_id: session.id,
            worker,
            difficulty: session.difficulty,
        })
        .await;
        Disposition::Continue
    }

    async fn handle_submit(
        &self,
        session: &mut Session,
        msg: RpcMessage,
        out: &mut Vec<String>,
    ) -> Disposition {
        if !session.authorized {
            push(out, &RpcResponse::err(msg.id, StratumError::unauthorized()));
            return Disposition::Continue;
        }

        // [workerName, jobId, extraNonce2, nTime, nonce]
        let fields = {
            let params = msg.params();
            let field = |index: usize| {
                params
                    .get(index)
                    .and_then(|v| v.as_str())
                    .filter(|s| !s.is_empty())
                    .map(str::to_owned)
            };
            (field(1), field(2), field(3), field(4))
        };
        let (Some(job_id), Some(extra_nonce2), Some(ntime), Some(nonce)) = fields else {
            session.count_invalid();
            push(out, &RpcResponse::err(msg.id, StratumError::invalid_params()));
            return Disposition::Continue;
        };

        let worker = session.worker.clone().unwrap_or_default();
        let share = Share {
            worker: worker.clone(),
            job_id,
            extra_nonce2,
            ntime,
            nonce,
            difficulty: session.difficulty,
        };

        let verdict = match self.handler.submit_share(&session.info(), share).await {
            Ok(verdict) => verdict,
            Err(e) => {
                // The share may be perfectly fine; it just was not
                // recorded. Refuse the acknowledgement without holding
                // it against the miner.
                warn!("session {} share not recorded: {}", session.id, e);
                push(
                    out,
                    &RpcResponse::err(
                        msg.id,
                        StratumError::new(ERR_INVALID_PARAMS, "Share not recorded, retry"),
                    ),
                );
                return Disposition::Continue;
            }
        };

        if verdict.valid {
            session.count_valid();
            counter!("minepool_shares_accepted").increment(1);
            push(out, &RpcResponse::ok(msg.id, Value::Bool(true)));

            if let Some(found) = &verdict.block {
                self.emit(PoolEvent::BlockFound {
                    height: found.height,
                    hash: found.hash.clone(),
                    worker: worker.clone(),
                })
                .await;
            }
            self.emit(PoolEvent::ShareAccepted {
                worker,
                difficulty: session.difficulty,
                is_block: verdict.block.is_some(),
            })
            .await;

            // Retarget after counting, so this share kept the difficulty
            // it was accepted at
            if let Some(vardiff) = session.vardiff.as_mut() {
                vardiff.record_valid_share();
                if let Some(difficulty) =
                    vardiff.retarget(session.difficulty, get_current_time_in_millis())
                {
                    session.difficulty = difficulty;
                    session.handle.set_difficulty(difficulty);
                    push(out, &RpcNotification::set_difficulty(difficulty));
                    debug!(
                        "session {} difficulty adjusted to {}",
                        session.id, difficulty
                    );
                    self.emit(PoolEvent::DifficultyChanged {
                        session_id: session.id,
                        difficulty,
                    })
                    .await;
                }
            }
        } else {
            session.count_invalid();
            counter!("minepool_shares_rejected").increment(1);
            push(out, &RpcResponse::err(msg.id, StratumError::invalid_share()));
            self.emit(PoolEvent::ShareRejected { worker }).await;

            if self
                .bans
                .should_ban(session.valid_shares, session.invalid_shares)
            {
                let until = self.bans.ban(session.ip);
                warn!(
                    "session {} banned for excessive invalid shares ({}/{})",
                    session.id,
                    session.invalid_shares,
                    session.valid_shares + session.invalid_shares
                );
                self.emit(PoolEvent::IpBanned {
                    ip: session.ip,
                    until,
                })
                .await;
                return Disposition::Close;
            }
        }
        Disposition::Continue
    }

    /// Periodic removal of expired ban entries
    async fn ban_sweep(self: Arc<Self>) {
        let mut shutdown = self.shutdown.subscribe();
        let mut ticker =
            tokio::time::interval(Duration::from_secs(self.bans.purge_interval_secs()));
        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = ticker.tick() => {
                    self.bans.purge_expired();
                }
            }
        }
    }

    /// Fixed-cadence poll that closes idle sessions
    async fn idle_watchdog(self: Arc<Self>) {
        let timeout_ms = self.options.connection_timeout_secs * 1000;
        let mut shutdown = self.shutdown.subscribe();
        let mut ticker = tokio::time::interval(Duration::from_secs(IDLE_SWEEP_INTERVAL_SECS));
        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = ticker.tick() => {
                    for entry in self.sessions.iter() {
                        let idle = entry.idle_ms();
                        if idle > timeout_ms {
                            warn!(
                                "session {} timed out after {}s idle",
                                entry.id(),
                                idle / 1000
                            );
                            entry.close();
                        }
                    }
                }
            }
        }
    }
}

async fn write_frame(write_half: &mut OwnedWriteHalf, frame: &str) -> std::io::Result<()> {
    write_half.write_all(frame.as_bytes()).await?;
    write_half.write_all(b"\n").await
}

fn push(out: &mut Vec<String>, value: &impl Serialize) {
    match serde_json::to_string(value) {
        Ok(frame) => out.push(frame),
        Err(e) => error!("failed to encode frame: {}", e),
    }
}
