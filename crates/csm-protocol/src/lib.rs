//! csm Protocol - the stream-json event protocol of Claude Code
//!
//! Claude Code started with `--output-format stream-json --verbose` writes
//! one JSON object per line to stdout. This crate turns those lines into
//! typed [`Event`]s and encodes the user turns written back on stdin.
//!
//! ```text
//! stdout bytes ──▶ LineScanner ──▶ parse_line ──▶ Event { payload, raw }
//!                  (split, copy)   (discriminator, then payload)
//! ```

pub mod correlate;
pub mod event;
pub mod message;
pub mod parse;
pub mod payload;
pub mod scanner;

pub use correlate::ToolCorrelator;
pub use event::{ErrorPayload, Event, EventPayload, EventType, UnknownPayload};
pub use message::{MessageContent, UserMessage};
pub use parse::{parse_line, ParseError};
pub use payload::{
    AssistantPayload, CommandToolResult, ContentBlock, FileContents, FileToolResult, HookPayload,
    InitPayload, McpServerStatus, ModelUsage, ResultPayload, ResultSubtype, ToolResultContent,
    ToolResultRef, ToolUseResult, UserPayload,
};
pub use scanner::{LineScanner, ScanError, DEFAULT_MAX_LINE_BYTES};
