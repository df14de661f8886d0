//! Session identifiers and the session status state machine.

use crate::{DomainError, DomainResult};
use serde::{Deserialize, Serialize};
use std::fmt;

// ============================================================================
// Type-Safe Identifiers
// ============================================================================

/// Unique identifier for a Claude Code session.
///
/// Wraps a UUID string (e.g., "8e11bfb5-7dc2-432b-9206-928fa5c35731").
/// Either chosen by the caller when a session is created or reported by
/// the agent in the `session_id` field of its stream events.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(String);

impl SessionId {
    /// Creates a new SessionId from a string.
    ///
    /// Note: This does not validate UUID format. The agent provides
    /// the session_id, so we trust its format.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Returns the underlying string reference.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Returns true when no identifier has been assigned.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Returns a shortened display form (first 8 characters).
    #[must_use]
    pub fn short(&self) -> &str {
        self.0.get(..8).unwrap_or(&self.0)
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for SessionId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for SessionId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl AsRef<str> for SessionId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Identifier correlating a tool invocation with its result.
///
/// Format: "toolu_..." (e.g., "toolu_01ABC123XYZ").
/// Carried by `tool_use` blocks as `id` and by `tool_result` blocks as `tool_use_id`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ToolUseId(String);

impl ToolUseId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ToolUseId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for ToolUseId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for ToolUseId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

// ============================================================================
// Session Status (state machine)
// ============================================================================

/// Lifecycle status of a managed session.
///
/// ```text
/// Creating ──▶ Active ──▶ Closing ──▶ Closed
///    │           │  │
///    │           │  └────▶ Error
///    └───────────┴───────▶ Terminating ──▶ Closed
/// ```
///
/// Status only moves forward. `Closed` and `Error` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    /// Process is being started; no turn may be sent yet.
    #[default]
    Creating,

    /// Process is running and accepts turns.
    Active,

    /// An explicit close is in progress.
    Closing,

    /// The session is gone and its process has been reaped.
    Closed,

    /// The process died or its stream failed.
    Error,

    /// Cancellation fired; the process group is being killed.
    Terminating,
}

impl SessionStatus {
    /// Returns the display label for this status.
    #[must_use]
    pub fn label(&self) -> &'static str {
        match self {
            Self::Creating => "creating",
            Self::Active => "active",
            Self::Closing => "closing",
            Self::Closed => "closed",
            Self::Error => "error",
            Self::Terminating => "terminating",
        }
    }

    /// Returns true if the session still counts as live for lookups.
    #[must_use]
    pub fn is_live(&self) -> bool {
        matches!(self, Self::Creating | Self::Active)
    }

    /// Returns true for states that can never be left.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Closed | Self::Error)
    }

    /// Returns true if a conversational turn may be sent.
    #[must_use]
    pub fn accepts_turns(&self) -> bool {
        matches!(self, Self::Active)
    }

    /// Returns true if moving from `self` to `next` is a legal transition.
    #[must_use]
    pub fn can_transition_to(&self, next: SessionStatus) -> bool {
        use SessionStatus::*;
        matches!(
            (self, next),
            (Creating, Active)
                | (Creating, Closing)
                | (Creating, Terminating)
                | (Creating, Error)
                | (Active, Closing)
                | (Active, Terminating)
                | (Active, Error)
                | (Closing, Closed)
                | (Terminating, Closed)
        )
    }

    /// Validates and returns the next status.
    ///
    /// # Errors
    ///
    /// Returns `DomainError::InvalidTransition` if the move is not allowed.
    pub fn transition(self, next: SessionStatus) -> DomainResult<SessionStatus> {
        if self.can_transition_to(next) {
            Ok(next)
        } else {
            Err(DomainError::InvalidTransition {
                from: self,
                to: next,
            })
        }
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.label())
    }
}
