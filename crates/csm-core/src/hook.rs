//! Hook event types reported by Claude Code.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Types of hook events Claude Code runs user hooks for.
///
/// Surfaced in the stream as `system` events with subtype `hook_response`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub enum HookEventType {
    /// Before a tool is executed (can be used for permission checks)
    PreToolUse,

    /// After a tool completes execution
    PostToolUse,

    /// A user prompt was submitted
    UserPromptSubmit,

    /// The main agent finished responding
    Stop,

    /// A subagent finished responding
    SubagentStop,

    /// Before the conversation is compacted
    PreCompact,

    /// When a new session starts or resumes
    SessionStart,

    /// When a session ends
    SessionEnd,

    /// Notification event (informational)
    Notification,
}

impl HookEventType {
    /// Parses from a hook event name string.
    pub fn from_event_name(name: &str) -> Option<Self> {
        match name {
            "PreToolUse" => Some(Self::PreToolUse),
            "PostToolUse" => Some(Self::PostToolUse),
            "UserPromptSubmit" => Some(Self::UserPromptSubmit),
            "Stop" => Some(Self::Stop),
            "SubagentStop" => Some(Self::SubagentStop),
            "PreCompact" => Some(Self::PreCompact),
            "SessionStart" => Some(Self::SessionStart),
            "SessionEnd" => Some(Self::SessionEnd),
            "Notification" => Some(Self::Notification),
            _ => None,
        }
    }

    /// Returns the wire name of the event.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::PreToolUse => "PreToolUse",
            Self::PostToolUse => "PostToolUse",
            Self::UserPromptSubmit => "UserPromptSubmit",
            Self::Stop => "Stop",
            Self::SubagentStop => "SubagentStop",
            Self::PreCompact => "PreCompact",
            Self::SessionStart => "SessionStart",
            Self::SessionEnd => "SessionEnd",
            Self::Notification => "Notification",
        }
    }
}

impl fmt::Display for HookEventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
