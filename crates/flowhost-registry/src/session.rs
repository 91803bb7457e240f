//! One tracked execution attempt.

use std::{
    collections::HashMap,
    path::PathBuf,
    sync::Arc,
    time::{Duration, Instant},
};

use flowhost_core::{
    SessionStatus,
    traits::{ExecutionMode, Runner, SessionId},
};
use serde::Serialize;
use serde_json::Value;

/// One execution attempt of a workflow, owned by exactly one client.
pub struct Session {
    pub session_id: SessionId,
    pub client_id: String,
    pub mode: ExecutionMode,
    pub status: SessionStatus,
    pub metadata: HashMap<String, Value>,
    /// Handle to the executor, absent until one is attached.
    pub runner: Option<Arc<dyn Runner>>,
    /// File staged for this execution; deleted on removal.
    pub temp_file: Option<PathBuf>,
    pub start_time: Instant,
    /// Set exactly once, on the first transition into a terminal status.
    pub end_time: Option<Instant>,
    pub last_accessed: Instant,
    pub access_count: u64,
}

impl Session {
    /// Create a session in the initial `Idle` state.
    #[must_use]
    pub fn new(
        session_id: SessionId,
        client_id: impl Into<String>,
        mode: ExecutionMode,
        runner: Option<Arc<dyn Runner>>,
        metadata: HashMap<String, Value>,
    ) -> Self {
        let now = Instant::now();
        Self {
            session_id,
            client_id: client_id.into(),
            mode,
            status: SessionStatus::Idle,
            metadata,
            runner,
            temp_file: None,
            start_time: now,
            end_time: None,
            last_accessed: now,
            access_count: 0,
        }
    }

    /// Record an access for staleness tracking.
    pub fn touch(&mut self) {
        self.last_accessed = Instant::now();
        self.access_count += 1;
    }

    /// Apply a status transition.
    ///
    /// Terminal statuses are sticky: the call is a no-op and returns
    /// `false`. Transitions the state machine does not list are applied
    /// anyway with a warning, since runner events are the source of truth
    /// for lifecycle and refusing them would strand the session.
    pub fn set_status(&mut self, next: SessionStatus) -> bool {
        if self.status.is_terminal() {
            return false;
        }
        if !self.status.can_transition_to(next) {
            tracing::warn!(
                session_id = %self.session_id,
                from = %self.status,
                to = %next,
                "unexpected status transition"
            );
        }
        self.status = next;
        self.touch();
        if next.is_terminal() && self.end_time.is_none() {
            self.end_time = Some(Instant::now());
        }
        true
    }

    /// Wall time from start until completion, or until now if still live.
    #[must_use]
    pub fn duration(&self) -> Duration {
        self.end_time
            .map_or_else(|| self.start_time.elapsed(), |end| end - self.start_time)
    }

    /// Serializable view of this session, without the runner handle.
    #[must_use]
    pub fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            session_id: self.session_id,
            client_id: self.client_id.clone(),
            mode: self.mode,
            status: self.status,
            metadata: self.metadata.clone(),
            has_runner: self.runner.is_some(),
            duration_secs: self.duration().as_secs_f64(),
            access_count: self.access_count,
        }
    }
}

/// Client-visible session state.
#[derive(Debug, Clone, Serialize)]
pub struct SessionSnapshot {
    pub session_id: SessionId,
    pub client_id: String,
    pub mode: ExecutionMode,
    pub status: SessionStatus,
    pub metadata: HashMap<String, Value>,
    pub has_runner: bool,
    pub duration_secs: f64,
    pub access_count: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn session() -> Session {
        Session::new(
            Uuid::new_v4(),
            "client-1",
            ExecutionMode::Standard,
            None,
            HashMap::new(),
        )
    }

    #[test]
    fn end_time_is_set_exactly_once() {
        let mut s = session();
        s.set_status(SessionStatus::Starting);
        s.set_status(SessionStatus::Running);
        assert!(s.end_time.is_none());

        s.set_status(SessionStatus::Completed);
        let end = s.end_time.expect("terminal sets end_time");

        // Terminal is sticky: no status change, no new end_time.
        assert!(!s.set_status(SessionStatus::Failed));
        assert_eq!(s.status, SessionStatus::Completed);
        assert_eq!(s.end_time, Some(end));
    }

    #[test]
    fn touch_tracks_access() {
        let mut s = session();
        let before = s.last_accessed;
        s.touch();
        s.touch();
        assert_eq!(s.access_count, 2);
        assert!(s.last_accessed >= before);
    }

    #[test]
    fn snapshot_omits_runner() {
        let s = session();
        let snap = s.snapshot();
        assert!(!snap.has_runner);
        assert_eq!(snap.status, SessionStatus::Idle);
        assert_eq!(snap.client_id, "client-1");
    }
}
