//! The authoritative map of active sessions.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    sync::atomic::{AtomicU64, Ordering},
    time::{Duration, Instant},
};

use flowhost_core::{
    ErrorCode, ErrorCounters, SessionStatus,
    traits::SessionId,
};
use serde::Serialize;
use thiserror::Error;

use crate::session::{Session, SessionSnapshot};

/// Registry error.
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("Session already exists: {0}")]
    AlreadyExists(SessionId),
    #[error("Registry lock poisoned")]
    Poisoned,
}

struct Inner {
    sessions: HashMap<SessionId, Session>,
    /// Owning client -> session ids in creation order. A session id is
    /// never indexed under more than one client.
    by_client: HashMap<String, Vec<SessionId>>,
}

/// Aggregate registry statistics.
#[derive(Debug, Clone, Serialize)]
pub struct RegistryStats {
    pub total_sessions: usize,
    pub by_status: HashMap<String, usize>,
    pub by_mode: HashMap<String, usize>,
    pub by_client: HashMap<String, usize>,
    pub completed_sessions: usize,
    pub total_duration_secs: f64,
    pub average_duration_secs: f64,
    pub cleaned_up: u64,
}

/// The authoritative session map shared by all connections and the sweep.
///
/// One mutex guards the id map and the client index together and is held
/// only for map operations. Cleanup side effects (stopping runners,
/// deleting temp files) always run outside the lock.
pub struct SessionRegistry {
    inner: Mutex<Inner>,
    errors: Arc<ErrorCounters>,
    cleaned_up: AtomicU64,
}

impl SessionRegistry {
    /// Create an empty registry sharing the given error counters.
    #[must_use]
    pub fn new(errors: Arc<ErrorCounters>) -> Self {
        Self {
            inner: Mutex::new(Inner {
                sessions: HashMap::new(),
                by_client: HashMap::new(),
            }),
            errors,
            cleaned_up: AtomicU64::new(0),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        // A poisoned map is still structurally sound; recover rather than
        // take every caller down with the panicking one.
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a new session.
    ///
    /// # Errors
    /// Returns `AlreadyExists` if the id is taken; the registry is left
    /// unchanged in that case.
    pub fn create(&self, session: Session) -> Result<SessionSnapshot, RegistryError> {
        let mut inner = self.lock();
        if inner.sessions.contains_key(&session.session_id) {
            return Err(RegistryError::AlreadyExists(session.session_id));
        }
        let snapshot = session.snapshot();
        inner
            .by_client
            .entry(session.client_id.clone())
            .or_default()
            .push(session.session_id);
        inner.sessions.insert(session.session_id, session);
        Ok(snapshot)
    }

    /// Look up a session, recording the access.
    #[must_use]
    pub fn get(&self, session_id: SessionId) -> Option<SessionSnapshot> {
        let mut inner = self.lock();
        inner.sessions.get_mut(&session_id).map(|s| {
            s.touch();
            s.snapshot()
        })
    }

    /// All sessions owned by `client_id`, in creation order.
    #[must_use]
    pub fn get_by_client(&self, client_id: &str) -> Vec<SessionSnapshot> {
        let inner = self.lock();
        inner
            .by_client
            .get(client_id)
            .map(|ids| {
                ids.iter()
                    .filter_map(|id| inner.sessions.get(id))
                    .map(Session::snapshot)
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Apply a status transition.
    ///
    /// Returns whether the session exists. Transitions out of a terminal
    /// status are accepted as no-ops and never re-fire side effects.
    pub fn update_status(&self, session_id: SessionId, status: SessionStatus) -> bool {
        let mut inner = self.lock();
        match inner.sessions.get_mut(&session_id) {
            Some(session) => {
                session.set_status(status);
                true
            }
            None => false,
        }
    }

    /// Attach the staged temp file to a session.
    pub fn set_temp_file(&self, session_id: SessionId, path: std::path::PathBuf) {
        let mut inner = self.lock();
        if let Some(session) = inner.sessions.get_mut(&session_id) {
            session.temp_file = Some(path);
        }
    }

    /// Record `key = value` in a session's metadata.
    pub fn set_metadata(&self, session_id: SessionId, key: &str, value: serde_json::Value) {
        let mut inner = self.lock();
        if let Some(session) = inner.sessions.get_mut(&session_id) {
            session.metadata.insert(key.to_string(), value);
        }
    }

    /// Remove a session and release its resources.
    ///
    /// The session is detached from the id map and the client index in one
    /// critical section; cleanup runs afterwards, outside the lock, and
    /// swallows all errors.
    pub async fn remove(&self, session_id: SessionId) -> bool {
        let detached = self.detach(session_id);
        match detached {
            Some(session) => {
                self.cleanup(session).await;
                true
            }
            None => false,
        }
    }

    /// Remove every session owned by `client_id`, returning the count.
    ///
    /// Used on disconnect.
    pub async fn remove_all_for_client(&self, client_id: &str) -> usize {
        let detached: Vec<Session> = {
            let mut inner = self.lock();
            let ids = inner.by_client.remove(client_id).unwrap_or_default();
            ids.iter()
                .filter_map(|id| inner.sessions.remove(id))
                .collect()
        };
        let count = detached.len();
        for session in detached {
            self.cleanup(session).await;
        }
        count
    }

    /// Reclaim finished and abandoned sessions.
    ///
    /// Terminal sessions whose `end_time` is older than `max_age` are
    /// removed, as are non-terminal sessions idle for longer than
    /// `2 * max_age`.
    ///
    /// # Errors
    /// Returns `Poisoned` if the registry lock cannot be acquired cleanly.
    pub async fn sweep(&self, max_age: Duration) -> Result<usize, RegistryError> {
        let now = Instant::now();
        let detached: Vec<Session> = {
            let mut inner = self.inner.lock().map_err(|_| RegistryError::Poisoned)?;
            let expired: Vec<SessionId> = inner
                .sessions
                .values()
                .filter(|s| {
                    if s.status.is_terminal() {
                        s.end_time
                            .is_some_and(|end| now.saturating_duration_since(end) > max_age)
                    } else {
                        now.saturating_duration_since(s.last_accessed) > max_age * 2
                    }
                })
                .map(|s| s.session_id)
                .collect();
            expired
                .into_iter()
                .filter_map(|id| Self::detach_locked(&mut inner, id))
                .collect()
        };
        let count = detached.len();
        for session in detached {
            tracing::debug!(session_id = %session.session_id, status = %session.status, "sweeping session");
            self.cleanup(session).await;
        }
        Ok(count)
    }

    /// Run `sweep` on a fixed interval in a background task.
    ///
    /// A failed iteration is counted on the shared error counters and does
    /// not stop subsequent iterations.
    pub fn spawn_sweeper(
        self: &Arc<Self>,
        interval: Duration,
        max_age: Duration,
    ) -> tokio::task::JoinHandle<()> {
        let registry = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // First tick fires immediately; skip it so a fresh server does
            // not sweep before anything exists.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                match registry.sweep(max_age).await {
                    Ok(0) => {}
                    Ok(removed) => tracing::debug!(removed, "sweep reclaimed sessions"),
                    Err(e) => {
                        registry.errors.record(ErrorCode::InternalError);
                        tracing::warn!(error = %e, "sweep iteration failed");
                    }
                }
            }
        })
    }

    /// Aggregate counts by status, mode, and client, plus completed-session
    /// durations.
    #[must_use]
    pub fn stats(&self) -> RegistryStats {
        let inner = self.lock();
        let mut by_status: HashMap<String, usize> = HashMap::new();
        let mut by_mode: HashMap<String, usize> = HashMap::new();
        let mut by_client: HashMap<String, usize> = HashMap::new();
        let mut completed = 0usize;
        let mut total_duration = Duration::ZERO;

        for session in inner.sessions.values() {
            *by_status.entry(session.status.as_str().to_string()).or_insert(0) += 1;
            *by_mode.entry(session.mode.as_str().to_string()).or_insert(0) += 1;
            *by_client.entry(session.client_id.clone()).or_insert(0) += 1;
            if session.end_time.is_some() {
                completed += 1;
                total_duration += session.duration();
            }
        }

        let average = if completed == 0 {
            0.0
        } else {
            total_duration.as_secs_f64() / completed as f64
        };

        RegistryStats {
            total_sessions: inner.sessions.len(),
            by_status,
            by_mode,
            by_client,
            completed_sessions: completed,
            total_duration_secs: total_duration.as_secs_f64(),
            average_duration_secs: average,
            cleaned_up: self.cleaned_up.load(Ordering::Relaxed),
        }
    }

    /// Sessions cleaned up since startup.
    #[must_use]
    pub fn cleaned_up(&self) -> u64 {
        self.cleaned_up.load(Ordering::Relaxed)
    }

    fn detach(&self, session_id: SessionId) -> Option<Session> {
        let mut inner = self.lock();
        Self::detach_locked(&mut inner, session_id)
    }

    fn detach_locked(inner: &mut Inner, session_id: SessionId) -> Option<Session> {
        let session = inner.sessions.remove(&session_id)?;
        if let Some(ids) = inner.by_client.get_mut(&session.client_id) {
            ids.retain(|id| *id != session_id);
            if ids.is_empty() {
                inner.by_client.remove(&session.client_id);
            }
        }
        Some(session)
    }

    /// Best-effort resource release for a detached session. Runs exactly
    /// once per session and never propagates failures.
    async fn cleanup(&self, session: Session) {
        if let Some(runner) = session.runner {
            if let Err(e) = runner.stop().await {
                tracing::debug!(session_id = %session.session_id, error = %e, "runner stop failed during cleanup");
            }
        }
        if let Some(path) = session.temp_file {
            if let Err(e) = tokio::fs::remove_file(&path).await {
                tracing::debug!(path = %path.display(), error = %e, "temp file removal failed during cleanup");
            }
        }
        self.cleaned_up.fetch_add(1, Ordering::Relaxed);
    }
}
