//! Two-phase parsing of stream-json lines.
//!
//! Phase one decodes only the discriminator (`type`, `subtype`,
//! `session_id`). Phase two decodes the full object into the one payload
//! that the discriminator selects. Lines with an unrecognized `type` become
//! [`EventPayload::Unknown`] rather than an error.

use csm_core::{SessionId, Usage};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use thiserror::Error;
use tracing::debug;

use crate::event::{Event, EventPayload, UnknownPayload};
use crate::payload::{
    AssistantPayload, ContentBlock, HookPayload, InitPayload, ResultPayload, ToolUseResult,
    UserPayload,
};

/// Errors for a single line. Always recoverable: the stream goes on.
#[derive(Debug, Error)]
pub enum ParseError {
    /// Not a JSON object, so not even the discriminator could be read.
    #[error("line is not a JSON object: {0}")]
    Discriminator(#[source] serde_json::Error),

    /// The discriminator was recognized but the payload did not match.
    #[error("malformed {kind} event: {source}")]
    Payload {
        kind: &'static str,
        #[source]
        source: serde_json::Error,
    },
}

/// Discriminator fields present on (almost) every line.
#[derive(Debug, Deserialize)]
struct Discriminator {
    #[serde(rename = "type", default)]
    kind: Option<String>,
    #[serde(default)]
    subtype: Option<String>,
    #[serde(default)]
    session_id: Option<String>,
}

/// Wire shape of an `assistant` line.
#[derive(Debug, Deserialize)]
struct RawAssistant {
    message: RawAssistantMessage,
    #[serde(default)]
    parent_tool_use_id: Option<String>,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawAssistantMessage {
    #[serde(default)]
    id: String,
    #[serde(default)]
    model: String,
    #[serde(default)]
    content: Vec<ContentBlock>,
    #[serde(default)]
    stop_reason: Option<String>,
    #[serde(default)]
    usage: Option<Usage>,
}

/// Wire shape of a `user` line.
#[derive(Debug, Deserialize)]
struct RawUser {
    message: RawUserMessage,
    #[serde(default)]
    tool_use_result: Option<ToolUseResult>,
    #[serde(default)]
    parent_tool_use_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawUserMessage {
    #[serde(default)]
    content: RawUserContent,
}

/// Replayed prompts carry a plain string; tool results carry blocks.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RawUserContent {
    Text(String),
    Blocks(Vec<ContentBlock>),
}

impl Default for RawUserContent {
    fn default() -> Self {
        Self::Blocks(Vec::new())
    }
}

impl RawUserContent {
    fn into_blocks(self) -> Vec<ContentBlock> {
        match self {
            Self::Text(text) => vec![ContentBlock::Text { text }],
            Self::Blocks(blocks) => blocks,
        }
    }
}

fn decode<T: DeserializeOwned>(kind: &'static str, line: &[u8]) -> Result<T, ParseError> {
    serde_json::from_slice(line).map_err(|source| ParseError::Payload { kind, source })
}

/// Parses one line into an [`Event`].
///
/// The returned event owns a copy of `line` in [`Event::raw`].
///
/// # Errors
///
/// - `ParseError::Discriminator` if the line is not a JSON object
/// - `ParseError::Payload` if a recognized event fails to decode
pub fn parse_line(line: &[u8]) -> Result<Event, ParseError> {
    let disc: Discriminator = serde_json::from_slice(line).map_err(ParseError::Discriminator)?;

    let kind = disc.kind.as_deref().unwrap_or_default();
    let payload = match (kind, disc.subtype.as_deref()) {
        ("system", Some("init")) => EventPayload::Init(decode::<InitPayload>("init", line)?),
        ("system", Some("hook_response")) => {
            EventPayload::Hook(decode::<HookPayload>("hook_response", line)?)
        }
        ("assistant", _) => {
            let raw: RawAssistant = decode("assistant", line)?;
            let text = AssistantPayload::collect_text(&raw.message.content);
            EventPayload::Assistant(AssistantPayload {
                message_id: raw.message.id,
                content: raw.message.content,
                model: raw.message.model,
                stop_reason: raw.message.stop_reason,
                usage: raw.message.usage.unwrap_or_default(),
                text,
                parent_tool_use_id: raw.parent_tool_use_id,
                error: raw.error,
            })
        }
        ("user", _) => {
            let raw: RawUser = decode("user", line)?;
            EventPayload::User(UserPayload {
                content: raw.message.content.into_blocks(),
                tool_use_result: raw.tool_use_result,
                parent_tool_use_id: raw.parent_tool_use_id,
            })
        }
        ("result", _) => EventPayload::Result(Box::new(decode::<ResultPayload>("result", line)?)),
        _ => {
            debug!(
                event_type = kind,
                subtype = ?disc.subtype,
                "Unrecognized event type, keeping raw"
            );
            EventPayload::Unknown(UnknownPayload {
                type_name: kind.to_string(),
                subtype: disc.subtype.clone(),
            })
        }
    };

    let session_id = disc.session_id.map(SessionId::new).unwrap_or_default();
    Ok(Event::new(session_id, payload, line.to_vec()))
}

/// Returns true if `line` holds nothing but whitespace.
pub fn is_blank(line: &[u8]) -> bool {
    line.iter().all(u8::is_ascii_whitespace)
}

/// Extracts a best-effort preview of a line for log messages.
pub fn preview(line: &[u8]) -> String {
    const PREVIEW_BYTES: usize = 120;
    let end = line.len().min(PREVIEW_BYTES);
    String::from_utf8_lossy(line.get(..end).unwrap_or_default()).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::EventType;
    use crate::payload::ResultSubtype;

    #[test]
    fn test_parse_init() {
        let line = br#"{"type":"system","subtype":"init","session_id":"abc","model":"claude-sonnet-4-5","cwd":"/work","tools":["Bash","Read"],"permissionMode":"default","mcp_servers":[{"name":"fs","status":"connected"}],"claude_code_version":"2.0.14"}"#;

        let event = parse_line(line).unwrap();
        assert_eq!(event.event_type(), EventType::Init);
        assert_eq!(event.session_id.as_str(), "abc");

        let init = event.as_init().unwrap();
        assert_eq!(init.model, "claude-sonnet-4-5");
        assert_eq!(init.tools, vec!["Bash", "Read"]);
        assert_eq!(init.permission_mode, "default");
        assert!(init.mcp_servers[0].is_connected());
        assert_eq!(init.version, "2.0.14");
        assert_eq!(event.raw, line.to_vec());
    }

    #[test]
    fn test_parse_assistant_concatenates_text() {
        let line = br#"{"type":"assistant","session_id":"abc","message":{"id":"msg_1","model":"m","content":[{"type":"text","text":"Hello "},{"type":"tool_use","id":"toolu_1","name":"Read","input":{}},{"type":"text","text":"World"}],"usage":{"input_tokens":10,"output_tokens":5}}}"#;

        let event = parse_line(line).unwrap();
        let assistant = event.as_assistant().unwrap();
        assert_eq!(assistant.text, "Hello World");
        assert_eq!(assistant.message_id, "msg_1");
        assert_eq!(assistant.stop_reason, None);
        assert_eq!(assistant.usage.input_tokens.as_u64(), 10);
        assert_eq!(assistant.tool_uses().count(), 1);
    }

    #[test]
    fn test_parse_assistant_carries_stop_reason_when_present() {
        let line = br#"{"type":"assistant","message":{"id":"m","content":[],"stop_reason":"end_turn"}}"#;
        let event = parse_line(line).unwrap();
        assert_eq!(
            event.as_assistant().unwrap().stop_reason.as_deref(),
            Some("end_turn")
        );
    }

    #[test]
    fn test_parse_user_tool_result() {
        let line = br#"{"type":"user","session_id":"abc","message":{"role":"user","content":[{"type":"tool_result","tool_use_id":"toolu_1","content":"file body"}]},"tool_use_result":{"stdout":"x","stderr":""}}"#;

        let event = parse_line(line).unwrap();
        let user = event.as_user().unwrap();
        let results: Vec<_> = user.tool_results().collect();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].tool_use_id.as_str(), "toolu_1");
        assert_eq!(results[0].content.to_text(), "file body");
        assert!(matches!(user.tool_use_result, Some(ToolUseResult::Command(_))));
    }

    #[test]
    fn test_parse_user_plain_string_content() {
        let line = br#"{"type":"user","message":{"role":"user","content":"replayed prompt"}}"#;
        let event = parse_line(line).unwrap();
        let user = event.as_user().unwrap();
        assert_eq!(user.content[0].as_text(), Some("replayed prompt"));
        assert_eq!(user.tool_results().count(), 0);
    }

    #[test]
    fn test_parse_result() {
        let line = br#"{"type":"result","subtype":"success","is_error":false,"result":"done","session_id":"abc","total_cost_usd":0.0125,"duration_ms":1500,"duration_api_ms":1200,"num_turns":2,"usage":{"input_tokens":30,"output_tokens":12},"modelUsage":{"claude-sonnet-4-5":{"inputTokens":30,"outputTokens":12,"costUSD":0.0125}}}"#;

        let event = parse_line(line).unwrap();
        assert!(event.is_result());
        let result = event.as_result().unwrap();
        assert_eq!(result.subtype, ResultSubtype::Success);
        assert_eq!(result.result.as_deref(), Some("done"));
        assert_eq!(result.num_turns, 2);
        assert_eq!(result.duration_api_ms, 1200);
        assert_eq!(result.usage.output_tokens.as_u64(), 12);
        assert!((result.total_cost_usd.as_usd() - 0.0125).abs() < 1e-9);
        assert_eq!(result.model_usage["claude-sonnet-4-5"].input_tokens, 30);
    }

    #[test]
    fn test_parse_hook_response() {
        let line = br#"{"type":"system","subtype":"hook_response","session_id":"abc","hook_name":"SessionStart:startup","hook_event":"SessionStart","stdout":"ok","stderr":"","exit_code":0}"#;
        let event = parse_line(line).unwrap();
        assert_eq!(event.event_type(), EventType::Hook);
    }

    #[test]
    fn test_unknown_type_is_explicit() {
        let line = br#"{"type":"stream_event","session_id":"abc","event":{"type":"message_start"}}"#;
        let event = parse_line(line).unwrap();
        assert_eq!(event.event_type(), EventType::Unknown);
        match &event.payload {
            EventPayload::Unknown(u) => assert_eq!(u.type_name, "stream_event"),
            other => panic!("expected unknown payload, got {other:?}"),
        }
        assert_eq!(event.session_id.as_str(), "abc");
    }

    #[test]
    fn test_unknown_system_subtype_is_unknown() {
        let line = br#"{"type":"system","subtype":"compact_boundary"}"#;
        let event = parse_line(line).unwrap();
        match &event.payload {
            EventPayload::Unknown(u) => {
                assert_eq!(u.type_name, "system");
                assert_eq!(u.subtype.as_deref(), Some("compact_boundary"));
            }
            other => panic!("expected unknown payload, got {other:?}"),
        }
    }

    #[test]
    fn test_object_without_type_is_unknown() {
        let event = parse_line(br#"{"hello":"world"}"#).unwrap();
        assert_eq!(event.event_type(), EventType::Unknown);
        assert!(event.session_id.is_empty());
    }

    #[test]
    fn test_non_json_is_discriminator_error() {
        let err = parse_line(b"Loading configuration...").unwrap_err();
        assert!(matches!(err, ParseError::Discriminator(_)));

        let err = parse_line(b"[1, 2, 3]").unwrap_err();
        assert!(matches!(err, ParseError::Discriminator(_)));
    }

    #[test]
    fn test_malformed_payload_is_payload_error() {
        let err = parse_line(br#"{"type":"assistant","message":"not an object"}"#).unwrap_err();
        assert!(matches!(err, ParseError::Payload { kind: "assistant", .. }));
    }

    #[test]
    fn test_blank_and_preview_helpers() {
        assert!(is_blank(b""));
        assert!(is_blank(b"  \t"));
        assert!(!is_blank(b" {}"));
        assert_eq!(preview(&[b'a'; 500]).len(), 120);
    }
}
