//! Typed payloads for each recognized stream event.
//!
//! Field names follow what Claude Code emits. Every field that the agent
//! may omit is `#[serde(default)]` so that partial objects still decode.

use std::collections::HashMap;

use csm_core::{HookEventType, Money, SessionId, ToolUseId, Usage};
use serde::{Deserialize, Serialize};
use serde_json::Value;

// ============================================================================
// Init
// ============================================================================

/// `system`/`init`: first event of every run.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct InitPayload {
    #[serde(default)]
    pub session_id: SessionId,
    #[serde(default)]
    pub model: String,
    #[serde(default)]
    pub cwd: String,
    #[serde(default)]
    pub tools: Vec<String>,
    #[serde(default, rename = "permissionMode")]
    pub permission_mode: String,
    #[serde(default)]
    pub mcp_servers: Vec<McpServerStatus>,
    #[serde(default, rename = "claude_code_version")]
    pub version: String,
    #[serde(default, rename = "apiKeySource")]
    pub api_key_source: Option<String>,
}

/// Connection status of one configured tool server.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct McpServerStatus {
    pub name: String,
    #[serde(default)]
    pub status: String,
}

impl McpServerStatus {
    pub fn is_connected(&self) -> bool {
        self.status == "connected"
    }
}

// ============================================================================
// Content Blocks
// ============================================================================

/// One block of message content.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    Text {
        text: String,
    },
    ToolUse {
        id: ToolUseId,
        name: String,
        #[serde(default)]
        input: Value,
    },
    ToolResult {
        tool_use_id: ToolUseId,
        #[serde(default)]
        content: ToolResultContent,
        #[serde(default)]
        is_error: bool,
    },
    Thinking {
        thinking: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        signature: Option<String>,
    },
    /// Block types this crate does not model (images, redacted thinking, ...).
    #[serde(other)]
    Unsupported,
}

impl ContentBlock {
    /// Returns the text of a `Text` block.
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text { text } => Some(text),
            _ => None,
        }
    }
}

/// Body of a `tool_result` block: plain text or a list of sub-blocks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ToolResultContent {
    Text(String),
    Blocks(Vec<Value>),
}

impl Default for ToolResultContent {
    fn default() -> Self {
        Self::Text(String::new())
    }
}

impl ToolResultContent {
    /// Flattens the content to text, joining the `text` sub-blocks.
    pub fn to_text(&self) -> String {
        match self {
            Self::Text(text) => text.clone(),
            Self::Blocks(blocks) => blocks
                .iter()
                .filter_map(|b| b.get("text").and_then(Value::as_str))
                .collect::<Vec<_>>()
                .join("\n"),
        }
    }
}

// ============================================================================
// Assistant
// ============================================================================

/// `assistant`: one model message.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct AssistantPayload {
    pub message_id: String,
    pub content: Vec<ContentBlock>,
    pub model: String,
    /// Only set when the agent reported one.
    pub stop_reason: Option<String>,
    /// Usage of this message alone.
    pub usage: Usage,
    /// Concatenation of every `Text` block, in order.
    pub text: String,
    /// Set when the message belongs to a subagent started by a tool call.
    pub parent_tool_use_id: Option<String>,
    /// Error tag attached by the agent (e.g. authentication failures).
    pub error: Option<String>,
}

impl AssistantPayload {
    /// Iterates the tool invocations requested by this message.
    pub fn tool_uses(&self) -> impl Iterator<Item = (&ToolUseId, &str, &Value)> {
        self.content.iter().filter_map(|block| match block {
            ContentBlock::ToolUse { id, name, input } => Some((id, name.as_str(), input)),
            _ => None,
        })
    }

    /// Concatenates the `Text` blocks of `content`.
    pub fn collect_text(content: &[ContentBlock]) -> String {
        content.iter().filter_map(ContentBlock::as_text).collect()
    }
}

// ============================================================================
// User (tool results)
// ============================================================================

/// `user`: tool results fed back to the model.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct UserPayload {
    pub content: Vec<ContentBlock>,
    /// Structured form of the tool result, when the tool provides one.
    pub tool_use_result: Option<ToolUseResult>,
    pub parent_tool_use_id: Option<String>,
}

/// Borrowed view of one `tool_result` block.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ToolResultRef<'a> {
    pub tool_use_id: &'a ToolUseId,
    pub content: &'a ToolResultContent,
    pub is_error: bool,
}

impl UserPayload {
    /// Iterates the tool results carried by this message.
    pub fn tool_results(&self) -> impl Iterator<Item = ToolResultRef<'_>> {
        self.content.iter().filter_map(|block| match block {
            ContentBlock::ToolResult {
                tool_use_id,
                content,
                is_error,
            } => Some(ToolResultRef {
                tool_use_id,
                content,
                is_error: *is_error,
            }),
            _ => None,
        })
    }
}

/// Structured tool output attached next to the message as `tool_use_result`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ToolUseResult {
    File(FileToolResult),
    Command(CommandToolResult),
    Text(String),
    Other(Value),
}

/// Output of a file read.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileToolResult {
    pub file: FileContents,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileContents {
    pub file_path: String,
    pub content: String,
    #[serde(default)]
    pub num_lines: u64,
    #[serde(default)]
    pub start_line: u64,
    #[serde(default)]
    pub total_lines: u64,
}

/// Captured output of a shell command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandToolResult {
    pub stdout: String,
    #[serde(default)]
    pub stderr: String,
    #[serde(default)]
    pub interrupted: bool,
    #[serde(default)]
    pub is_image: bool,
}

// ============================================================================
// Result
// ============================================================================

/// How a run ended.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum ResultSubtype {
    #[default]
    Success,
    ErrorMaxTurns,
    ErrorDuringExecution,
    ErrorMaxBudgetUsd,
    ErrorMaxStructuredOutputRetries,
    /// A subtype this crate does not know, kept verbatim.
    Other(String),
}

impl ResultSubtype {
    pub fn as_str(&self) -> &str {
        match self {
            Self::Success => "success",
            Self::ErrorMaxTurns => "error_max_turns",
            Self::ErrorDuringExecution => "error_during_execution",
            Self::ErrorMaxBudgetUsd => "error_max_budget_usd",
            Self::ErrorMaxStructuredOutputRetries => "error_max_structured_output_retries",
            Self::Other(s) => s,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success)
    }
}

impl From<String> for ResultSubtype {
    fn from(s: String) -> Self {
        match s.as_str() {
            "success" => Self::Success,
            "error_max_turns" => Self::ErrorMaxTurns,
            "error_during_execution" => Self::ErrorDuringExecution,
            "error_max_budget_usd" => Self::ErrorMaxBudgetUsd,
            "error_max_structured_output_retries" => Self::ErrorMaxStructuredOutputRetries,
            _ => Self::Other(s),
        }
    }
}

impl From<ResultSubtype> for String {
    fn from(subtype: ResultSubtype) -> Self {
        subtype.as_str().to_string()
    }
}

/// `result`: terminal summary of a turn.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ResultPayload {
    #[serde(default)]
    pub subtype: ResultSubtype,
    #[serde(default)]
    pub is_error: bool,
    /// Free-text answer; absent when structured output was requested.
    #[serde(default)]
    pub result: Option<String>,
    /// Schema-validated output, present only when a schema was requested.
    #[serde(default)]
    pub structured_output: Option<Value>,
    /// Cumulative usage for the whole run.
    #[serde(default)]
    pub usage: Usage,
    #[serde(default)]
    pub total_cost_usd: Money,
    #[serde(default)]
    pub duration_ms: u64,
    #[serde(default)]
    pub duration_api_ms: u64,
    #[serde(default)]
    pub num_turns: u32,
    #[serde(default, rename = "modelUsage")]
    pub model_usage: HashMap<String, ModelUsage>,
    #[serde(default)]
    pub permission_denials: Vec<Value>,
}

impl ResultPayload {
    /// Final answer as text: structured output (as JSON) wins over `result`.
    pub fn output_text(&self) -> Option<String> {
        match &self.structured_output {
            Some(value) => Some(value.to_string()),
            None => self.result.clone(),
        }
    }

    /// Raw bytes of the structured output, if any.
    pub fn structured_output_bytes(&self) -> Option<Vec<u8>> {
        self.structured_output
            .as_ref()
            .and_then(|v| serde_json::to_vec(v).ok())
    }

    /// Guesses whether a failed run is worth retrying.
    ///
    /// Advisory only: this matches substrings of the agent's free-text
    /// error, whose wording is not a stable contract.
    pub fn appears_transient(&self) -> bool {
        if !self.is_error {
            return false;
        }
        let text = self.result.as_deref().unwrap_or_default().to_lowercase();
        ["overloaded", "rate limit", "rate_limit", "529", "timed out", "timeout"]
            .iter()
            .any(|needle| text.contains(needle))
    }
}

/// Usage of one model within a run (`modelUsage` map values).
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelUsage {
    #[serde(default)]
    pub input_tokens: u64,
    #[serde(default)]
    pub output_tokens: u64,
    #[serde(default)]
    pub cache_read_input_tokens: u64,
    #[serde(default)]
    pub cache_creation_input_tokens: u64,
    #[serde(default)]
    pub web_search_requests: u64,
    #[serde(default, rename = "costUSD")]
    pub cost_usd: Money,
    #[serde(default)]
    pub context_window: u64,
}

// ============================================================================
// Hook
// ============================================================================

/// `system`/`hook_response`: output of a user-configured hook.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct HookPayload {
    #[serde(default)]
    pub hook_name: String,
    #[serde(default)]
    pub hook_event: String,
    #[serde(default)]
    pub stdout: String,
    #[serde(default)]
    pub stderr: String,
    #[serde(default)]
    pub exit_code: Option<i32>,
}

impl HookPayload {
    pub fn event_type(&self) -> Option<HookEventType> {
        HookEventType::from_event_name(&self.hook_event)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_content_block_variants() {
        let json = r#"[
            {"type": "text", "text": "hi"},
            {"type": "tool_use", "id": "toolu_1", "name": "Bash", "input": {"command": "ls"}},
            {"type": "thinking", "thinking": "hmm", "signature": "sig"},
            {"type": "image", "source": {}}
        ]"#;

        let blocks: Vec<ContentBlock> = serde_json::from_str(json).unwrap();
        assert_eq!(blocks.len(), 4);
        assert_eq!(blocks[0].as_text(), Some("hi"));
        assert!(matches!(&blocks[1], ContentBlock::ToolUse { name, .. } if name == "Bash"));
        assert!(matches!(blocks[2], ContentBlock::Thinking { .. }));
        assert_eq!(blocks[3], ContentBlock::Unsupported);
    }

    #[test]
    fn test_tool_result_content_forms() {
        let text: ToolResultContent = serde_json::from_str(r#""done""#).unwrap();
        assert_eq!(text.to_text(), "done");

        let blocks: ToolResultContent =
            serde_json::from_str(r#"[{"type":"text","text":"a"},{"type":"text","text":"b"}]"#)
                .unwrap();
        assert_eq!(blocks.to_text(), "a\nb");
    }

    #[test]
    fn test_tool_use_result_shapes() {
        let file: ToolUseResult = serde_json::from_str(
            r#"{"type":"text","file":{"filePath":"/a.rs","content":"fn main(){}","numLines":1,"startLine":1,"totalLines":1}}"#,
        )
        .unwrap();
        match file {
            ToolUseResult::File(f) => {
                assert_eq!(f.file.file_path, "/a.rs");
                assert_eq!(f.file.num_lines, 1);
            }
            other => panic!("expected file result, got {other:?}"),
        }

        let cmd: ToolUseResult =
            serde_json::from_str(r#"{"stdout":"ok","stderr":"","interrupted":false,"isImage":false}"#)
                .unwrap();
        assert!(matches!(cmd, ToolUseResult::Command(ref c) if c.stdout == "ok"));

        let text: ToolUseResult = serde_json::from_str(r#""Error: denied""#).unwrap();
        assert!(matches!(text, ToolUseResult::Text(_)));

        let other: ToolUseResult = serde_json::from_str(r#"{"todos": []}"#).unwrap();
        assert!(matches!(other, ToolUseResult::Other(_)));
    }

    #[test]
    fn test_result_subtype_mapping() {
        let known: ResultSubtype = serde_json::from_str(r#""error_max_turns""#).unwrap();
        assert_eq!(known, ResultSubtype::ErrorMaxTurns);

        let unknown: ResultSubtype = serde_json::from_str(r#""error_new_kind""#).unwrap();
        assert_eq!(unknown, ResultSubtype::Other("error_new_kind".to_string()));
        assert_eq!(serde_json::to_string(&unknown).unwrap(), r#""error_new_kind""#);
    }

    #[test]
    fn test_output_text_prefers_structured_output() {
        let payload = ResultPayload {
            result: Some("ignored".to_string()),
            structured_output: Some(serde_json::json!({"answer": 42})),
            ..ResultPayload::default()
        };
        assert_eq!(payload.output_text().as_deref(), Some(r#"{"answer":42}"#));
        assert_eq!(
            payload.structured_output_bytes().unwrap(),
            br#"{"answer":42}"#.to_vec()
        );
    }

    #[test]
    fn test_appears_transient_is_advisory() {
        let overloaded = ResultPayload {
            is_error: true,
            result: Some("API Error: 529 Overloaded".to_string()),
            ..ResultPayload::default()
        };
        assert!(overloaded.appears_transient());

        let success_mentioning_timeout = ResultPayload {
            result: Some("the timeout was fixed".to_string()),
            ..ResultPayload::default()
        };
        assert!(!success_mentioning_timeout.appears_transient());
    }

    #[test]
    fn test_hook_payload_event_type() {
        let hook = HookPayload {
            hook_event: "SessionStart".to_string(),
            ..HookPayload::default()
        };
        assert_eq!(hook.event_type(), Some(HookEventType::SessionStart));
    }
}
