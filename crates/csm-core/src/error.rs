//! Domain-specific error types following panic-free policy.

use crate::SessionStatus;
use thiserror::Error;

/// Errors that can occur in domain operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DomainError {
    /// A session status change that the state machine does not allow
    #[error("invalid session transition: {from} -> {to}")]
    InvalidTransition {
        from: SessionStatus,
        to: SessionStatus,
    },
}

/// Result type for domain operations.
pub type DomainResult<T> = Result<T, DomainError>;
