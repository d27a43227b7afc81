//! Session tracking against a memory budget.
//!
//! Each session charges a declared byte cost. Admission first drops expired
//! sessions, then evicts least-recently-accessed sessions until the newcomer
//! fits. Lookups refresh recency, so `get` takes the write lock.

use std::any::Any;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use serde::Serialize;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::telemetry::mean_duration;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SessionError {
    #[error("Session already exists: {0}")]
    DuplicateSession(String),

    #[error("Session not found: {0}")]
    SessionNotFound(String),

    #[error("Session memory limit exceeded: requested {requested} bytes, limit {limit} bytes")]
    MemoryLimitExceeded { requested: usize, limit: usize },
}

/// Configuration for session tracking.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub max_sessions: usize,
    pub session_timeout: Duration,
    pub memory_limit_bytes: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            max_sessions: 1000,
            session_timeout: Duration::from_secs(30 * 60),
            memory_limit_bytes: 1024 * 1024 * 1024, // 1GB
        }
    }
}

/// Opaque per-session context, shared between the creator and the tracker.
pub type SessionContext = Arc<dyn Any + Send + Sync>;

struct SessionRecord {
    context: SessionContext,
    memory_usage: usize,
    created_time: Instant,
    last_access: Instant,
    access_seq: u64,
    access_count: u64,
    is_active: bool,
}

/// Snapshot of a session returned to callers.
#[derive(Clone)]
pub struct SessionHandle {
    pub id: String,
    pub context: SessionContext,
    pub memory_usage: usize,
    pub created_time: Instant,
    pub last_access: Instant,
    pub access_count: u64,
    pub is_active: bool,
}

impl SessionHandle {
    /// Borrow the context as a concrete type.
    pub fn context_as<T: Any + Send + Sync>(&self) -> Option<&T> {
        self.context.downcast_ref::<T>()
    }
}

impl std::fmt::Debug for SessionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionHandle")
            .field("id", &self.id)
            .field("memory_usage", &self.memory_usage)
            .field("access_count", &self.access_count)
            .field("is_active", &self.is_active)
            .finish_non_exhaustive()
    }
}

/// Aggregate session statistics.
#[derive(Debug, Clone, Serialize)]
pub struct SessionStats {
    pub total_sessions: usize,
    pub active_sessions: usize,
    pub expired_sessions: usize,
    pub total_memory_usage_bytes: usize,
    pub avg_session_age: Duration,
    pub memory_efficiency_ratio: f64,
    pub evicted_total: u64,
    pub expired_total: u64,
}

struct SessionTable {
    sessions: HashMap<String, SessionRecord>,
    config: SessionConfig,
    total_memory: usize,
    next_seq: u64,
    evicted_total: u64,
    expired_total: u64,
}

impl SessionTable {
    fn tick(&mut self) -> u64 {
        self.next_seq += 1;
        self.next_seq
    }

    fn remove(&mut self, id: &str) -> Option<SessionRecord> {
        let record = self.sessions.remove(id)?;
        self.total_memory -= record.memory_usage;
        Some(record)
    }

    fn cleanup_expired(&mut self, now: Instant) -> usize {
        let timeout = self.config.session_timeout;
        let expired: Vec<String> = self
            .sessions
            .iter()
            .filter(|(_, s)| now.saturating_duration_since(s.last_access) > timeout)
            .map(|(id, _)| id.clone())
            .collect();

        for id in &expired {
            self.remove(id);
            tracing::debug!(session_id = %id, "session expired");
        }
        self.expired_total += expired.len() as u64;
        expired.len()
    }

    /// Evict up to `count` sessions, oldest `last_access` first.
    fn evict_oldest(&mut self, count: usize) -> usize {
        let mut order: Vec<(Instant, u64, String)> = self
            .sessions
            .iter()
            .map(|(id, s)| (s.last_access, s.access_seq, id.clone()))
            .collect();
        order.sort();

        let mut evicted = 0;
        for (_, _, id) in order.into_iter().take(count) {
            if self.remove(&id).is_some() {
                tracing::debug!(session_id = %id, "session evicted");
                evicted += 1;
            }
        }
        self.evicted_total += evicted as u64;
        evicted
    }

    fn over_budget(&self, incoming: usize) -> bool {
        self.total_memory + incoming > self.config.memory_limit_bytes
    }
}

/// Tracks sessions against a count cap and a memory ceiling.
pub struct SessionManager {
    table: RwLock<SessionTable>,
}

impl SessionManager {
    pub fn new(config: SessionConfig) -> Self {
        Self {
            table: RwLock::new(SessionTable {
                sessions: HashMap::new(),
                config,
                total_memory: 0,
                next_seq: 0,
                evicted_total: 0,
                expired_total: 0,
            }),
        }
    }

    /// Admit a new session charging `memory_cost` bytes.
    pub fn create(
        &self,
        id: &str,
        context: SessionContext,
        memory_cost: usize,
    ) -> Result<(), SessionError> {
        let mut table = self.table.write();

        if table.sessions.contains_key(id) {
            return Err(SessionError::DuplicateSession(id.to_string()));
        }
        let limit = table.config.memory_limit_bytes;
        if memory_cost > limit {
            return Err(SessionError::MemoryLimitExceeded { requested: memory_cost, limit });
        }

        let now = Instant::now();
        if table.over_budget(memory_cost) {
            table.cleanup_expired(now);
            while table.over_budget(memory_cost) && table.evict_oldest(1) > 0 {}
        }
        while table.sessions.len() >= table.config.max_sessions && table.evict_oldest(1) > 0 {}

        let seq = table.tick();
        table.sessions.insert(
            id.to_string(),
            SessionRecord {
                context,
                memory_usage: memory_cost,
                created_time: now,
                last_access: now,
                access_seq: seq,
                access_count: 1,
                is_active: true,
            },
        );
        table.total_memory += memory_cost;
        Ok(())
    }

    /// Look up a session, refreshing its recency.
    pub fn get(&self, id: &str) -> Option<SessionHandle> {
        let mut table = self.table.write();
        let seq = table.tick();
        let session = table.sessions.get_mut(id)?;
        session.last_access = Instant::now();
        session.access_seq = seq;
        session.access_count += 1;
        session.is_active = true;

        Some(SessionHandle {
            id: id.to_string(),
            context: session.context.clone(),
            memory_usage: session.memory_usage,
            created_time: session.created_time,
            last_access: session.last_access,
            access_count: session.access_count,
            is_active: session.is_active,
        })
    }

    /// Refresh a session without returning it.
    pub fn touch(&self, id: &str) -> Result<(), SessionError> {
        self.get(id)
            .map(|_| ())
            .ok_or_else(|| SessionError::SessionNotFound(id.to_string()))
    }

    /// Remove a session, returning the memory it released.
    pub fn remove(&self, id: &str) -> Result<usize, SessionError> {
        self.table
            .write()
            .remove(id)
            .map(|s| s.memory_usage)
            .ok_or_else(|| SessionError::SessionNotFound(id.to_string()))
    }

    pub fn contains(&self, id: &str) -> bool {
        self.table.read().sessions.contains_key(id)
    }

    /// Drop every session idle longer than the timeout.
    pub fn cleanup_expired(&self) -> usize {
        self.table.write().cleanup_expired(Instant::now())
    }

    /// Force-evict the `count` least recently accessed sessions.
    pub fn evict_oldest(&self, count: usize) -> usize {
        self.table.write().evict_oldest(count)
    }

    /// Cleanup expired sessions; above 90% of the memory limit, evict oldest
    /// sessions until usage is at or below 75%.
    pub fn optimize_session_memory(&self) -> usize {
        let mut table = self.table.write();
        let mut released = table.cleanup_expired(Instant::now());

        let limit = table.config.memory_limit_bytes as f64;
        if table.total_memory as f64 > limit * 0.9 {
            while table.total_memory as f64 > limit * 0.75 && table.evict_oldest(1) > 0 {
                released += 1;
            }
        }

        // Sessions idle for more than half the timeout are marked inactive.
        let idle_after = table.config.session_timeout / 2;
        let now = Instant::now();
        for session in table.sessions.values_mut() {
            session.is_active = now.saturating_duration_since(session.last_access) <= idle_after;
        }
        released
    }

    /// Ids of sessions that have not expired.
    pub fn active_sessions(&self) -> Vec<String> {
        let table = self.table.read();
        let now = Instant::now();
        let timeout = table.config.session_timeout;
        let mut ids: Vec<String> = table
            .sessions
            .iter()
            .filter(|(_, s)| now.saturating_duration_since(s.last_access) <= timeout)
            .map(|(id, _)| id.clone())
            .collect();
        ids.sort();
        ids
    }

    pub fn set_memory_limit(&self, limit_bytes: usize) {
        self.table.write().config.memory_limit_bytes = limit_bytes;
    }

    pub fn set_session_limit(&self, max_sessions: usize) {
        self.table.write().config.max_sessions = max_sessions.max(1);
    }

    pub fn set_session_timeout(&self, timeout: Duration) {
        self.table.write().config.session_timeout = timeout;
    }

    pub fn len(&self) -> usize {
        self.table.read().sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.table.read().sessions.is_empty()
    }

    pub fn memory_usage(&self) -> usize {
        self.table.read().total_memory
    }

    pub fn stats(&self) -> SessionStats {
        let table = self.table.read();
        let now = Instant::now();
        let timeout = table.config.session_timeout;

        let mut active = 0;
        let mut expired = 0;
        let mut total_age = Duration::ZERO;
        for session in table.sessions.values() {
            total_age += now.saturating_duration_since(session.created_time);
            if now.saturating_duration_since(session.last_access) > timeout {
                expired += 1;
            } else {
                active += 1;
            }
        }

        let total = table.sessions.len();
        let limit = table.config.memory_limit_bytes;
        SessionStats {
            total_sessions: total,
            active_sessions: active,
            expired_sessions: expired,
            total_memory_usage_bytes: table.total_memory,
            avg_session_age: mean_duration(total_age, total as u64),
            memory_efficiency_ratio: if limit > 0 {
                table.total_memory as f64 / limit as f64
            } else {
                0.0
            },
            evicted_total: table.evicted_total,
            expired_total: table.expired_total,
        }
    }

    /// Run `cleanup_expired` every `interval` until `cancel` fires.
    pub fn spawn_reaper(
        self: Arc<Self>,
        interval: Duration,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        tracing::debug!("session reaper: shutdown signal received");
                        break;
                    }
                    _ = ticker.tick() => {
                        let removed = self.cleanup_expired();
                        if removed > 0 {
                            tracing::debug!(removed, "session reaper: expired sessions dropped");
                        }
                    }
                }
            }
        })
    }
}

impl Default for SessionManager {
    fn default() -> Self {
        Self::new(SessionConfig::default())
    }
}
