//! Runtime state of one streamed generation.
//!
//! ```text
//! Pending ──first chunk──▶ Streaming ──┬─ exhausted ─▶ Completed
//!    │                                 ├─ error ─────▶ Failed
//!    └── (ends before any chunk) ──────┴─ cancel ────▶ Cancelled
//! ```
//!
//! Terminal states are absorbing.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use hookscribe_common::protocol::SessionCounts;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Pending,
    Streaming,
    Completed,
    Failed,
    Cancelled,
}

impl SessionState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            SessionState::Completed | SessionState::Failed | SessionState::Cancelled
        )
    }

    fn can_move_to(self, next: SessionState) -> bool {
        use SessionState::*;
        match (self, next) {
            (Pending, Streaming) => true,
            (Pending | Streaming, Completed | Failed | Cancelled) => true,
            _ => false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("invalid session transition {from:?} -> {to:?}")]
pub struct TransitionError {
    pub from: SessionState,
    pub to: SessionState,
}

#[derive(Debug)]
struct Inner {
    state: SessionState,
    output: String,
    chunks: usize,
}

#[derive(Debug)]
pub struct GenerationSession {
    id: Uuid,
    inner: Mutex<Inner>,
    cancel: CancellationToken,
}

impl Default for GenerationSession {
    fn default() -> Self {
        Self::new()
    }
}

impl GenerationSession {
    pub fn new() -> Self {
        GenerationSession {
            id: Uuid::new_v4(),
            inner: Mutex::new(Inner {
                state: SessionState::Pending,
                output: String::new(),
                chunks: 0,
            }),
            cancel: CancellationToken::new(),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn state(&self) -> SessionState {
        self.lock().state
    }

    /// Whether the producer may still emit.
    pub fn is_live(&self) -> bool {
        !self.state().is_terminal()
    }

    /// Signal tied to the consuming connection's lifetime.
    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Output relayed so far.
    pub fn output(&self) -> String {
        self.lock().output.clone()
    }

    pub fn chunk_count(&self) -> usize {
        self.lock().chunks
    }

    /// Account for one pulled chunk; the first one moves the session to
    /// `Streaming`.
    pub fn record_chunk(&self, chunk: &str) -> Result<(), TransitionError> {
        let mut inner = self.lock();
        match inner.state {
            SessionState::Pending => inner.state = SessionState::Streaming,
            SessionState::Streaming => {}
            from => {
                return Err(TransitionError {
                    from,
                    to: SessionState::Streaming,
                })
            }
        }
        inner.output.push_str(chunk);
        inner.chunks += 1;
        Ok(())
    }

    /// Move to a terminal state.
    pub fn finish(&self, to: SessionState) -> Result<(), TransitionError> {
        let mut inner = self.lock();
        let from = inner.state;
        if !to.is_terminal() || !from.can_move_to(to) {
            return Err(TransitionError { from, to });
        }
        inner.state = to;
        Ok(())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|p| p.into_inner())
    }
}

/// Outcome counters over every session started by this process.
#[derive(Debug, Default)]
pub struct SessionStats {
    started: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
    cancelled: AtomicU64,
}

impl SessionStats {
    pub fn started(&self) {
        self.started.fetch_add(1, Ordering::Relaxed);
    }

    /// Count a session that reached `state`; non-terminal states are ignored.
    pub fn record(&self, state: SessionState) {
        let counter = match state {
            SessionState::Completed => &self.completed,
            SessionState::Failed => &self.failed,
            SessionState::Cancelled => &self.cancelled,
            SessionState::Pending | SessionState::Streaming => return,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> SessionCounts {
        let completed = self.completed.load(Ordering::Relaxed);
        let failed = self.failed.load(Ordering::Relaxed);
        let cancelled = self.cancelled.load(Ordering::Relaxed);
        let ended = completed + failed + cancelled;
        SessionCounts {
            active: self.started.load(Ordering::Relaxed).saturating_sub(ended),
            completed,
            failed,
            cancelled,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_chunk_starts_streaming() {
        let session = GenerationSession::new();
        assert_eq!(session.state(), SessionState::Pending);
        session.record_chunk("fn ").unwrap();
        session.record_chunk("main").unwrap();
        assert_eq!(session.state(), SessionState::Streaming);
        assert_eq!(session.output(), "fn main");
        assert_eq!(session.chunk_count(), 2);
        assert!(session.is_live());
    }

    #[test]
    fn test_terminal_states_are_absorbing() {
        for terminal in [
            SessionState::Completed,
            SessionState::Failed,
            SessionState::Cancelled,
        ] {
            let session = GenerationSession::new();
            session.record_chunk("x").unwrap();
            session.finish(terminal).unwrap();
            assert!(!session.is_live());

            assert!(session.record_chunk("y").is_err());
            for next in [
                SessionState::Completed,
                SessionState::Failed,
                SessionState::Cancelled,
            ] {
                assert!(session.finish(next).is_err());
            }
            assert_eq!(session.state(), terminal);
            assert_eq!(session.output(), "x");
        }
    }

    #[test]
    fn test_pending_can_end_directly() {
        let session = GenerationSession::new();
        session.finish(SessionState::Completed).unwrap();
        assert_eq!(session.state(), SessionState::Completed);
    }

    #[test]
    fn test_finish_requires_terminal_target() {
        let session = GenerationSession::new();
        let err = session.finish(SessionState::Streaming).unwrap_err();
        assert_eq!(err.from, SessionState::Pending);
        assert_eq!(err.to, SessionState::Streaming);
    }

    #[test]
    fn test_stats_track_outcomes() {
        let stats = SessionStats::default();
        for _ in 0..3 {
            stats.started();
        }
        stats.record(SessionState::Completed);
        stats.record(SessionState::Cancelled);
        stats.record(SessionState::Streaming);

        assert_eq!(
            stats.snapshot(),
            SessionCounts {
                active: 1,
                completed: 1,
                failed: 0,
                cancelled: 1,
            }
        );
    }

    #[test]
    fn test_cancel_sets_token() {
        let session = GenerationSession::new();
        assert!(!session.cancellation().is_cancelled());
        session.cancel();
        assert!(session.cancellation().is_cancelled());
    }
}
