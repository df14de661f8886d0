//! The typed stream event.

use std::fmt;

use csm_core::SessionId;
use serde::{Deserialize, Serialize};

use crate::payload::{AssistantPayload, HookPayload, InitPayload, ResultPayload, UserPayload};

/// Discriminator of an [`Event`], derived from its payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    Init,
    Assistant,
    User,
    Result,
    Hook,
    Error,
    /// A line with a `type` this crate does not specialize.
    Unknown,
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Init => "init",
            Self::Assistant => "assistant",
            Self::User => "user",
            Self::Result => "result",
            Self::Hook => "hook",
            Self::Error => "error",
            Self::Unknown => "unknown",
        };
        f.write_str(s)
    }
}

/// Exactly one payload per event; the variant is the event's type.
#[derive(Debug, Clone, PartialEq)]
pub enum EventPayload {
    Init(InitPayload),
    Assistant(AssistantPayload),
    User(UserPayload),
    Result(Box<ResultPayload>),
    Hook(HookPayload),
    Error(ErrorPayload),
    Unknown(UnknownPayload),
}

/// An error surfaced inside the stream by the engine itself
/// (read failure, unexpected process exit), never parsed from the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub message: String,
}

/// Discriminator fields of a line whose `type` is not specialized.
///
/// The full object stays available through [`Event::raw`].
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct UnknownPayload {
    /// The `type` value as sent; empty when the object had none.
    pub type_name: String,
    pub subtype: Option<String>,
}

/// One event read from the agent's stdout.
#[derive(Debug, Clone, PartialEq)]
pub struct Event {
    /// Empty until the stream has reported an id.
    pub session_id: SessionId,
    pub payload: EventPayload,
    /// The line exactly as read, without its newline.
    pub raw: Vec<u8>,
}

impl Event {
    pub fn new(session_id: SessionId, payload: EventPayload, raw: Vec<u8>) -> Self {
        Self {
            session_id,
            payload,
            raw,
        }
    }

    /// Builds an engine-side error event.
    pub fn error(session_id: SessionId, message: impl Into<String>) -> Self {
        Self::new(
            session_id,
            EventPayload::Error(ErrorPayload {
                message: message.into(),
            }),
            Vec::new(),
        )
    }

    pub fn event_type(&self) -> EventType {
        match &self.payload {
            EventPayload::Init(_) => EventType::Init,
            EventPayload::Assistant(_) => EventType::Assistant,
            EventPayload::User(_) => EventType::User,
            EventPayload::Result(_) => EventType::Result,
            EventPayload::Hook(_) => EventType::Hook,
            EventPayload::Error(_) => EventType::Error,
            EventPayload::Unknown(_) => EventType::Unknown,
        }
    }

    /// Returns true for the event that ends a turn.
    pub fn is_result(&self) -> bool {
        matches!(self.payload, EventPayload::Result(_))
    }

    pub fn as_init(&self) -> Option<&InitPayload> {
        match &self.payload {
            EventPayload::Init(p) => Some(p),
            _ => None,
        }
    }

    pub fn as_assistant(&self) -> Option<&AssistantPayload> {
        match &self.payload {
            EventPayload::Assistant(p) => Some(p),
            _ => None,
        }
    }

    pub fn as_user(&self) -> Option<&UserPayload> {
        match &self.payload {
            EventPayload::User(p) => Some(p),
            _ => None,
        }
    }

    pub fn as_result(&self) -> Option<&ResultPayload> {
        match &self.payload {
            EventPayload::Result(p) => Some(p),
            _ => None,
        }
    }

    pub fn as_error(&self) -> Option<&ErrorPayload> {
        match &self.payload {
            EventPayload::Error(p) => Some(p),
            _ => None,
        }
    }

    /// The raw line as text (lossy for invalid UTF-8).
    pub fn raw_str(&self) -> std::borrow::Cow<'_, str> {
        String::from_utf8_lossy(&self.raw)
    }
}
