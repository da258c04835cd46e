//! Session state: the unit the session table owns and the session manager
//! mutates.

use chrono::{DateTime, Utc};
use std::collections::VecDeque;

/// How many calls have been run in a session are remembered before the
/// oldest record is dropped. Resolves the "are journals bounded?" question
/// in favor of a fixed-size ring rather than unbounded growth.
pub const JOURNAL_CAPACITY: usize = 100;

/// Lifecycle state of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// No operation in flight; eligible for reaping once idle long enough.
    Ready,
    /// Exactly one guest operation is in flight; the sweeper skips these.
    Busy,
    /// Teardown has started; the session is about to leave the table.
    Closing,
    /// Torn down. A session in this state is never reachable from the
    /// table — it exists transiently only while a caller still holds a
    /// reference to it.
    Closed,
}

/// Which guest transport a session uses. Fixed at creation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GuestBackend {
    /// One-shot `exec` per call.
    Stateless,
    /// Long-lived evaluator reachable over a binary RPC port.
    Persistent {
        /// Host-side port mapped to the guest evaluator's listening port.
        host_port: u16,
    },
}

/// One entry in a session's execution journal.
#[derive(Debug, Clone)]
pub struct JournalRecord {
    /// When the call completed.
    pub timestamp: DateTime<Utc>,
    /// Whether the call succeeded.
    pub success: bool,
    /// Wall-clock time the call took, in seconds.
    pub elapsed_secs: f64,
    /// Length of the submitted code, in characters.
    pub code_len: usize,
}

/// A live session: one container, owned exclusively, reachable by one id.
#[derive(Debug, Clone)]
pub struct Session {
    /// Opaque, globally unique session id.
    pub id: String,
    /// Runtime-assigned container identifier.
    pub container_id: String,
    /// Guest transport this session was created with.
    pub backend: GuestBackend,
    /// When the session was created.
    pub created_at: DateTime<Utc>,
    /// When the session last completed a successful operation.
    pub last_used: DateTime<Utc>,
    /// Current lifecycle state.
    pub state: SessionState,
    /// Bounded history of executions against this session.
    journal: VecDeque<JournalRecord>,
}

impl Session {
    /// Construct a freshly-created, `Ready` session.
    pub fn new(id: String, container_id: String, backend: GuestBackend) -> Self {
        let now = Utc::now();
        Self {
            id,
            container_id,
            backend,
            created_at: now,
            last_used: now,
            state: SessionState::Ready,
            journal: VecDeque::with_capacity(JOURNAL_CAPACITY),
        }
    }

    /// Append an execution record, evicting the oldest entry if the
    /// journal is at capacity, and bump `last_used`.
    pub fn record(&mut self, success: bool, elapsed_secs: f64, code_len: usize) {
        if self.journal.len() >= JOURNAL_CAPACITY {
            self.journal.pop_front();
        }
        self.journal.push_back(JournalRecord {
            timestamp: Utc::now(),
            success,
            elapsed_secs,
            code_len,
        });
        self.last_used = Utc::now();
    }

    /// Number of records currently retained in the journal.
    pub fn journal_len(&self) -> usize {
        self.journal.len()
    }

    /// Most recent journal entries, oldest first.
    pub fn journal(&self) -> impl Iterator<Item = &JournalRecord> {
        self.journal.iter()
    }

    /// Seconds since this session last completed a call.
    pub fn idle_secs(&self) -> i64 {
        (Utc::now() - self.last_used).num_seconds()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn journal_is_bounded() {
        let mut session = Session::new(
            "s1".to_string(),
            "c1".to_string(),
            GuestBackend::Stateless,
        );
        for i in 0..(JOURNAL_CAPACITY + 10) {
            session.record(true, 0.1, i);
        }
        assert_eq!(session.journal_len(), JOURNAL_CAPACITY);
    }

    #[test]
    fn last_used_never_precedes_created_at() {
        let session = Session::new(
            "s1".to_string(),
            "c1".to_string(),
            GuestBackend::Stateless,
        );
        assert!(session.last_used >= session.created_at);
    }
}
