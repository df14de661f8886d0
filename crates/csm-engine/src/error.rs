//! Error types for the session engine.
//!
//! `EngineError` is `Clone`: a turn's terminal error is stored once in its
//! [`ResultFuture`](crate::ResultFuture) and handed to every waiter.
//!
//! **Panic-Free Policy:** No `.unwrap()`, `.expect()`, `panic!()`,
//! `unreachable!()`, or `todo!()` in this crate outside tests.

use csm_core::{DomainError, SessionId, SessionStatus};
use thiserror::Error;

// ============================================================================
// Engine Error Type
// ============================================================================

/// Errors surfaced by sessions, the manager and the one-shot client.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EngineError {
    /// The agent binary could not be started.
    ///
    /// Reported synchronously, before any event is streamed. Never retried.
    #[error("failed to start {program}: {reason}")]
    ProcessStart { program: String, reason: String },

    /// Reading the agent's stdout failed.
    #[error("failed to read agent output: {0}")]
    StreamRead(String),

    /// One stdout line exceeded the configured ceiling.
    #[error("agent output line {line} exceeds {max} bytes")]
    LineTooLong { max: usize, line: u64 },

    /// The agent exited before emitting a `result` event.
    #[error("agent exited unexpectedly (exit code: {}){}", fmt_code(*code), fmt_stderr(stderr))]
    ProcessExited { code: Option<i32>, stderr: String },

    /// The caller's cancellation token fired.
    #[error("operation cancelled")]
    Cancelled,

    /// The session no longer accepts turns.
    #[error("session {id} is {status}")]
    SessionClosed { id: SessionId, status: SessionStatus },

    #[error("session not found: {0}")]
    SessionNotFound(SessionId),

    #[error("session limit reached (max: {max} sessions)")]
    CapacityExceeded { max: usize },

    #[error("session {0} already exists")]
    SessionExists(SessionId),

    /// A turn was sent while the previous one had no result yet.
    #[error("session {0} already has a turn in flight")]
    TurnInProgress(SessionId),

    #[error("failed to write to agent stdin: {0}")]
    StdinWrite(String),

    /// The agent did not emit its `init` event in time.
    #[error("agent did not initialize within {secs}s")]
    InitTimeout { secs: u64 },

    #[error(transparent)]
    InvalidTransition(#[from] DomainError),

    #[error("invalid configuration: {0}")]
    Config(String),
}

fn fmt_code(code: Option<i32>) -> String {
    code.map_or_else(|| "signal".to_string(), |c| c.to_string())
}

fn fmt_stderr(stderr: &str) -> String {
    if stderr.is_empty() {
        String::new()
    } else {
        format!(": {stderr}")
    }
}

impl EngineError {
    /// Returns true for unknown or no-longer-live sessions.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::SessionNotFound(_))
    }

    pub fn is_capacity(&self) -> bool {
        matches!(self, Self::CapacityExceeded { .. })
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }

    /// Returns true when the error ended the underlying process
    /// rather than a single call.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::ProcessStart { .. }
                | Self::StreamRead(_)
                | Self::LineTooLong { .. }
                | Self::ProcessExited { .. }
        )
    }
}

// ============================================================================
// Result Type Alias
// ============================================================================

/// Convenience Result type alias for engine operations.
pub type Result<T> = std::result::Result<T, EngineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = EngineError::CapacityExceeded { max: 10 };
        assert_eq!(err.to_string(), "session limit reached (max: 10 sessions)");

        let err = EngineError::SessionNotFound(SessionId::new("abc"));
        assert_eq!(err.to_string(), "session not found: abc");

        let err = EngineError::ProcessExited {
            code: Some(2),
            stderr: "boom".to_string(),
        };
        assert_eq!(err.to_string(), "agent exited unexpectedly (exit code: 2): boom");

        let err = EngineError::ProcessExited {
            code: None,
            stderr: String::new(),
        };
        assert_eq!(err.to_string(), "agent exited unexpectedly (exit code: signal)");
    }

    #[test]
    fn test_predicates() {
        assert!(EngineError::Cancelled.is_cancelled());
        assert!(EngineError::CapacityExceeded { max: 1 }.is_capacity());
        assert!(EngineError::SessionNotFound(SessionId::new("x")).is_not_found());
        assert!(!EngineError::Cancelled.is_fatal());
        assert!(EngineError::StreamRead("eof".into()).is_fatal());
    }

    #[test]
    fn test_domain_error_converts() {
        let err: EngineError = SessionStatus::Closed
            .transition(SessionStatus::Active)
            .unwrap_err()
            .into();
        assert!(matches!(err, EngineError::InvalidTransition(_)));
    }
}
