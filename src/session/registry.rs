//! Session registry
//!
//! Owns every live session. Sessions are sharded by id hash; each shard is a
//! short-lived `RwLock` over a map of entries. Egress is a bounded channel per
//! session drained by the transport writer; `send` never waits on it.

use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{FabricError, FabricResult};
use crate::models::{ServerFrame, SessionClass, SessionId};

const SESSION_SHARDS: usize = 64;
const EVENT_CHANNEL_CAPACITY: usize = 4096;

/// What the transport writer pulls from a session's egress.
#[derive(Debug, Clone, PartialEq)]
pub enum Outbound {
    Frame(ServerFrame),
    Close(String),
}

#[derive(Debug, Clone)]
pub enum SessionEvent {
    Opened {
        id: SessionId,
        remote: IpAddr,
        shard: u32,
    },
    Closed {
        id: SessionId,
        reason: String,
    },
}

/// Parameters of a newly accepted transport.
#[derive(Debug, Clone)]
pub struct AcceptParams {
    pub remote: SocketAddr,
    pub shard: u32,
    pub class: SessionClass,
    pub identity: Option<String>,
    pub user_agent: Option<String>,
    pub compression: bool,
}

impl AcceptParams {
    pub fn new(remote: SocketAddr, shard: u32) -> Self {
        Self {
            remote,
            shard,
            class: SessionClass::Standard,
            identity: None,
            user_agent: None,
            compression: false,
        }
    }
}

/// Read-only view of a session.
#[derive(Debug, Clone, Serialize)]
pub struct SessionInfo {
    pub id: SessionId,
    pub remote: SocketAddr,
    pub shard: u32,
    pub class: SessionClass,
    pub identity: Option<String>,
    pub user_agent: Option<String>,
    pub compression: bool,
    pub connected_at_ms: i64,
    pub idle_ms: u64,
    pub alive: bool,
    pub frames_sent: u64,
    pub frames_dropped: u64,
}

struct SessionEntry {
    id: SessionId,
    remote: SocketAddr,
    shard: u32,
    class: SessionClass,
    identity: Mutex<Option<String>>,
    user_agent: Option<String>,
    compression: bool,
    connected_at_ms: i64,
    /// Milliseconds since the registry epoch of the last inbound frame.
    last_received_ms: AtomicU64,
    last_sent_ms: AtomicU64,
    alive: AtomicBool,
    frames_sent: AtomicU64,
    frames_dropped: AtomicU64,
    egress: mpsc::Sender<Outbound>,
    closed: CancellationToken,
}

/// Returned to the transport on accept.
pub struct SessionHandle {
    pub id: SessionId,
    pub egress: mpsc::Receiver<Outbound>,
    /// Cancelled when the registry closes the session.
    pub closed: CancellationToken,
}

pub struct SessionRegistry {
    shards: Vec<RwLock<HashMap<SessionId, Arc<SessionEntry>>>>,
    max_sessions: usize,
    egress_capacity: usize,
    active: AtomicUsize,
    accepted_total: AtomicU64,
    refused_total: AtomicU64,
    dropped_total: AtomicU64,
    epoch: Instant,
    events: broadcast::Sender<SessionEvent>,
}

fn shard_of(id: &SessionId) -> usize {
    (id.0.as_u128() % SESSION_SHARDS as u128) as usize
}

impl SessionRegistry {
    pub fn new(max_sessions: usize, egress_capacity: usize) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            shards: (0..SESSION_SHARDS)
                .map(|_| RwLock::new(HashMap::new()))
                .collect(),
            max_sessions,
            egress_capacity: egress_capacity.max(1),
            active: AtomicUsize::new(0),
            accepted_total: AtomicU64::new(0),
            refused_total: AtomicU64::new(0),
            dropped_total: AtomicU64::new(0),
            epoch: Instant::now(),
            events,
        }
    }

    fn millis_since_epoch(&self, now: Instant) -> u64 {
        now.saturating_duration_since(self.epoch).as_millis() as u64
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    /// Register a new session, refusing once `max_sessions` are live.
    pub fn accept(&self, params: AcceptParams) -> FabricResult<SessionHandle> {
        self.accept_at(params, Instant::now())
    }

    pub fn accept_at(&self, params: AcceptParams, now: Instant) -> FabricResult<SessionHandle> {
        let reserved = self
            .active
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (n < self.max_sessions).then_some(n + 1)
            });
        let active = match reserved {
            Ok(prev) => prev + 1,
            Err(_) => {
                self.refused_total.fetch_add(1, Ordering::Relaxed);
                metrics::increment_counter!("fabric_sessions_refused_total");
                return Err(FabricError::unavailable("connection_limit"));
            }
        };

        let id = SessionId::new();
        let (tx, rx) = mpsc::channel(self.egress_capacity);
        let closed = CancellationToken::new();
        let stamp = self.millis_since_epoch(now);
        let entry = Arc::new(SessionEntry {
            id,
            remote: params.remote,
            shard: params.shard,
            class: params.class,
            identity: Mutex::new(params.identity),
            user_agent: params.user_agent,
            compression: params.compression,
            connected_at_ms: chrono::Utc::now().timestamp_millis(),
            last_received_ms: AtomicU64::new(stamp),
            last_sent_ms: AtomicU64::new(stamp),
            alive: AtomicBool::new(true),
            frames_sent: AtomicU64::new(0),
            frames_dropped: AtomicU64::new(0),
            egress: tx,
            closed: closed.clone(),
        });
        self.shards[shard_of(&id)].write().insert(id, entry);
        self.accepted_total.fetch_add(1, Ordering::Relaxed);

        metrics::gauge!("fabric_sessions_active", active as f64);
        debug!(session = %id, remote = %params.remote, shard = params.shard, "Session opened");
        let _ = self.events.send(SessionEvent::Opened {
            id,
            remote: params.remote.ip(),
            shard: params.shard,
        });

        Ok(SessionHandle {
            id,
            egress: rx,
            closed,
        })
    }

    fn entry(&self, id: &SessionId) -> Option<Arc<SessionEntry>> {
        self.shards[shard_of(id)].read().get(id).cloned()
    }

    /// Queue a frame without waiting. A full egress buffer drops the frame.
    pub fn send(&self, id: &SessionId, frame: ServerFrame) -> FabricResult<()> {
        let entry = self
            .entry(id)
            .ok_or_else(|| FabricError::unavailable("session_closed"))?;
        match entry.egress.try_send(Outbound::Frame(frame)) {
            Ok(()) => {
                entry.frames_sent.fetch_add(1, Ordering::Relaxed);
                entry
                    .last_sent_ms
                    .store(self.millis_since_epoch(Instant::now()), Ordering::Relaxed);
                Ok(())
            }
            Err(mpsc::error::TrySendError::Full(_)) => {
                entry.frames_dropped.fetch_add(1, Ordering::Relaxed);
                self.dropped_total.fetch_add(1, Ordering::Relaxed);
                metrics::increment_counter!("fabric_egress_dropped_total");
                Err(FabricError::unavailable("egress_full"))
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                Err(FabricError::unavailable("session_closed"))
            }
        }
    }

    /// Send to every session matching `predicate`. Returns frames delivered.
    pub fn broadcast<F>(&self, frame: &ServerFrame, predicate: F) -> usize
    where
        F: Fn(&SessionInfo) -> bool,
    {
        self.iterate(predicate)
            .into_iter()
            .filter(|id| self.send(id, frame.clone()).is_ok())
            .count()
    }

    /// Remove a session. Returns false if it was already gone.
    pub fn close(&self, id: &SessionId, reason: &str) -> bool {
        let removed = self.shards[shard_of(id)].write().remove(id);
        let Some(entry) = removed else {
            return false;
        };
        entry.alive.store(false, Ordering::Relaxed);
        let _ = entry.egress.try_send(Outbound::Close(reason.to_string()));
        entry.closed.cancel();

        let active = self
            .active
            .fetch_sub(1, Ordering::AcqRel)
            .saturating_sub(1);
        metrics::gauge!("fabric_sessions_active", active as f64);
        info!(session = %id, reason, "Session closed");
        let _ = self.events.send(SessionEvent::Closed {
            id: *id,
            reason: reason.to_string(),
        });
        true
    }

    /// Record an inbound frame.
    pub fn touch(&self, id: &SessionId) {
        self.touch_at(id, Instant::now())
    }

    pub fn touch_at(&self, id: &SessionId, now: Instant) {
        if let Some(entry) = self.entry(id) {
            entry
                .last_received_ms
                .fetch_max(self.millis_since_epoch(now), Ordering::Relaxed);
        }
    }

    pub fn set_identity(&self, id: &SessionId, identity: Option<String>) {
        if let Some(entry) = self.entry(id) {
            *entry.identity.lock() = identity;
        }
    }

    pub fn info(&self, id: &SessionId) -> Option<SessionInfo> {
        self.entry(id)
            .map(|e| self.info_of(&e, self.millis_since_epoch(Instant::now())))
    }

    fn info_of(&self, e: &SessionEntry, now_ms: u64) -> SessionInfo {
        SessionInfo {
            id: e.id,
            remote: e.remote,
            shard: e.shard,
            class: e.class,
            identity: e.identity.lock().clone(),
            user_agent: e.user_agent.clone(),
            compression: e.compression,
            connected_at_ms: e.connected_at_ms,
            idle_ms: now_ms.saturating_sub(e.last_received_ms.load(Ordering::Relaxed)),
            alive: e.alive.load(Ordering::Relaxed),
            frames_sent: e.frames_sent.load(Ordering::Relaxed),
            frames_dropped: e.frames_dropped.load(Ordering::Relaxed),
        }
    }

    /// Ids of sessions matching `predicate`.
    pub fn iterate<F>(&self, predicate: F) -> Vec<SessionId>
    where
        F: Fn(&SessionInfo) -> bool,
    {
        self.iterate_at(predicate, Instant::now())
    }

    fn iterate_at<F>(&self, predicate: F, now: Instant) -> Vec<SessionId>
    where
        F: Fn(&SessionInfo) -> bool,
    {
        let now_ms = self.millis_since_epoch(now);
        let mut out = Vec::new();
        for shard in &self.shards {
            let entries: Vec<Arc<SessionEntry>> = shard.read().values().cloned().collect();
            for e in entries {
                if predicate(&self.info_of(&e, now_ms)) {
                    out.push(e.id);
                }
            }
        }
        out
    }

    /// Close sessions idle for longer than `2 * period`. Returns how many.
    pub fn sweep_idle_at(&self, period: Duration, now: Instant) -> usize {
        let limit_ms = (period * 2).as_millis() as u64;
        let stale = self.iterate_at(|s| s.idle_ms > limit_ms, now);
        let closed = stale
            .iter()
            .filter(|id| self.close(id, "heartbeat timeout"))
            .count();
        if closed > 0 {
            warn!(closed, "Closed sessions on heartbeat timeout");
        }
        closed
    }

    /// Queue a ping to every session.
    pub fn ping_all(&self) -> usize {
        self.broadcast(&ServerFrame::ping(), |_| true)
    }

    /// Close everything, e.g. on shutdown.
    pub fn close_all(&self, reason: &str) -> usize {
        self.iterate(|_| true)
            .iter()
            .filter(|id| self.close(id, reason))
            .count()
    }

    pub fn active(&self) -> usize {
        self.active.load(Ordering::Acquire)
    }

    pub fn max_sessions(&self) -> usize {
        self.max_sessions
    }

    pub fn stats(&self) -> RegistryStats {
        RegistryStats {
            active: self.active(),
            max_sessions: self.max_sessions,
            accepted_total: self.accepted_total.load(Ordering::Relaxed),
            refused_total: self.refused_total.load(Ordering::Relaxed),
            egress_dropped_total: self.dropped_total.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RegistryStats {
    pub active: usize,
    pub max_sessions: usize,
    pub accepted_total: u64,
    pub refused_total: u64,
    pub egress_dropped_total: u64,
}
