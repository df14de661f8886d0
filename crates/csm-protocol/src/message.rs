//! Outbound turns written to the agent's stdin.
//!
//! With `--input-format stream-json` the agent reads one user message per
//! line:
//!
//! ```json
//! {"type":"user","message":{"role":"user","content":"hi"},"parent_tool_use_id":null}
//! ```

use csm_core::SessionId;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Content of a user turn: plain text or a list of content blocks
/// (text, images, tool results).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MessageContent {
    Text(String),
    Blocks(Vec<Value>),
}

/// The `message` object of a user turn.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageBody {
    pub role: String,
    pub content: MessageContent,
}

/// One user turn.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename = "user")]
pub struct UserMessage {
    pub message: MessageBody,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<SessionId>,

    #[serde(default)]
    pub parent_tool_use_id: Option<String>,
}

impl UserMessage {
    fn new(content: MessageContent) -> Self {
        Self {
            message: MessageBody {
                role: "user".to_string(),
                content,
            },
            session_id: None,
            parent_tool_use_id: None,
        }
    }

    /// A plain-text turn.
    pub fn text(text: impl Into<String>) -> Self {
        Self::new(MessageContent::Text(text.into()))
    }

    /// A turn made of raw content blocks.
    pub fn blocks(blocks: Vec<Value>) -> Self {
        Self::new(MessageContent::Blocks(blocks))
    }

    /// Addresses the turn to a session. Empty ids are dropped.
    pub fn with_session(mut self, session_id: &SessionId) -> Self {
        self.session_id = if session_id.is_empty() {
            None
        } else {
            Some(session_id.clone())
        };
        self
    }

    pub fn content(&self) -> &MessageContent {
        &self.message.content
    }

    /// Encodes the turn as one newline-terminated line.
    pub fn to_line(&self) -> Result<Vec<u8>, serde_json::Error> {
        let mut line = serde_json::to_vec(self)?;
        line.push(b'\n');
        Ok(line)
    }
}

impl From<&str> for UserMessage {
    fn from(text: &str) -> Self {
        Self::text(text)
    }
}

impl From<String> for UserMessage {
    fn from(text: String) -> Self {
        Self::text(text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_text_turn_wire_shape() {
        let msg = UserMessage::text("hello");
        let value: Value = serde_json::to_value(&msg).unwrap();
        assert_eq!(
            value,
            json!({
                "type": "user",
                "message": {"role": "user", "content": "hello"},
                "parent_tool_use_id": null
            })
        );
    }

    #[test]
    fn test_with_session_sets_id() {
        let msg = UserMessage::from("hi").with_session(&SessionId::new("abc"));
        let value: Value = serde_json::to_value(&msg).unwrap();
        assert_eq!(value["session_id"], "abc");

        let msg = UserMessage::from("hi").with_session(&SessionId::default());
        assert!(msg.session_id.is_none());
    }

    #[test]
    fn test_blocks_turn() {
        let msg = UserMessage::blocks(vec![json!({"type": "text", "text": "look"})]);
        let value: Value = serde_json::to_value(&msg).unwrap();
        assert_eq!(value["message"]["content"][0]["text"], "look");
    }

    #[test]
    fn test_to_line_is_single_line() {
        let line = UserMessage::text("multi\nline").to_line().unwrap();
        assert_eq!(line.last(), Some(&b'\n'));
        assert_eq!(line.iter().filter(|b| **b == b'\n').count(), 1);

        let decoded: UserMessage = serde_json::from_slice(&line).unwrap();
        assert_eq!(
            decoded.content(),
            &MessageContent::Text("multi\nline".to_string())
        );
    }
}
