//! csm Engine - Streaming sessions over Claude Code agent processes
//!
//! This crate drives `claude` child processes speaking the stream-json
//! protocol:
//! - `client` - one-shot queries: one process per prompt
//! - `session` - a long-lived conversation on one process
//! - `manager` - a capacity-limited pool of sessions with idle eviction
//! - `accumulator` - folding an event stream into a final answer
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                        SessionManager                       │
//! │   RwLock<HashMap<SessionId, Arc<Session>>>   + sweep task   │
//! └───────────────┬─────────────────────────────────────────────┘
//!                 │ create / get / close
//!                 ▼
//! ┌──────────────────────┐  stdin   ┌──────────────────────────┐
//! │       Session        │─────────▶│  agent (process group)   │
//! │  ResultFuture/turn   │◀─────────│  stdout: stream-json     │
//! └──────────┬───────────┘  reader  └──────────────────────────┘
//!            │ EventStream (bounded mpsc)
//!            ▼
//!        consumer / Accumulator
//! ```
//!
//! # Panic-Free Guarantees
//!
//! - No `.unwrap()`, `.expect()`, `panic!()` outside tests
//! - Every wait takes a `CancellationToken`
//! - Channel closure is a normal end of stream, not an error

pub mod accumulator;
pub mod client;
pub mod command;
pub mod config;
pub mod error;
pub mod future;
pub mod manager;
pub mod pipe;
pub mod process;
mod reader;
pub mod session;

pub use accumulator::{Accumulator, QueryResponse};
pub use client::{Client, QueryStream};
pub use command::{ClaudeCommand, CommandBuilder, FixedCommand, LaunchMode, LaunchSpec};
pub use config::{EngineConfig, SessionOptions};
pub use error::{EngineError, Result};
pub use future::ResultFuture;
pub use manager::{CloseReason, SessionManager};
pub use pipe::{Delivery, EventSender, EventStream};
pub use process::AgentProcess;
pub use session::{Session, SessionInfo};
