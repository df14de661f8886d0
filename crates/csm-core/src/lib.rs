//! csm Core - Shared types for driving Claude Code sessions
//!
//! This crate provides the domain value types shared between
//! the wire protocol (csm-protocol) and the session engine (csm-engine).
//!
//! All code follows the panic-free policy: no `.unwrap()`, `.expect()`,
//! `panic!()`, `unreachable!()`, `todo!()`, or direct indexing `[i]`.

pub mod cost;
pub mod error;
pub mod hook;
pub mod session;
pub mod usage;

// Re-exports for convenience
pub use cost::Money;
pub use error::{DomainError, DomainResult};
pub use hook::HookEventType;
pub use session::{SessionId, SessionStatus, ToolUseId};
pub use usage::{TokenCount, Usage};
