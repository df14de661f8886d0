//! Folding an event stream into a single answer.

use std::sync::{Mutex, MutexGuard, PoisonError};

use csm_core::{Money, SessionId, Usage};
use csm_protocol::{Event, EventPayload, ResultPayload};

use crate::pipe::EventStream;

#[derive(Debug, Default)]
struct State {
    text: String,
    usage: Usage,
    session_id: SessionId,
    model: String,
    done: bool,
    error: Option<String>,
    result: Option<ResultPayload>,
}

/// Thread-safe fold over events.
///
/// - `Init` sets session id and model, first write wins.
/// - `Assistant` appends its text and adds its per-message usage.
/// - `Result` sets `done`. It seeds usage from the result's cumulative
///   usage if nothing was summed yet, and its `result` or
///   `structured_output`, when present, replaces the accumulated text.
/// - `Error` records the error and keeps the text.
#[derive(Debug, Default)]
pub struct Accumulator {
    state: Mutex<State>,
}

impl Accumulator {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Folds one event.
    pub fn add(&self, event: &Event) {
        let mut state = self.lock();
        if state.session_id.is_empty() && !event.session_id.is_empty() {
            state.session_id = event.session_id.clone();
        }

        match &event.payload {
            EventPayload::Init(init) => {
                if state.session_id.is_empty() {
                    state.session_id = init.session_id.clone();
                }
                if state.model.is_empty() {
                    state.model = init.model.clone();
                }
            }
            EventPayload::Assistant(msg) => {
                state.text.push_str(&msg.text);
                state.usage += msg.usage;
                if state.model.is_empty() {
                    state.model = msg.model.clone();
                }
            }
            EventPayload::Result(result) => {
                state.done = true;
                if state.usage.is_zero() {
                    state.usage = result.usage;
                }
                if let Some(text) = result.output_text() {
                    state.text = text;
                }
                if result.is_error && state.error.is_none() {
                    state.error = result.result.clone().or_else(|| {
                        Some(format!("agent reported {}", result.subtype.as_str()))
                    });
                }
                state.result = Some((**result).clone());
            }
            EventPayload::Error(err) => {
                state.error = Some(err.message.clone());
            }
            EventPayload::User(_) | EventPayload::Hook(_) | EventPayload::Unknown(_) => {}
        }
    }

    /// Folds every event until the stream ends. Returns the number folded.
    pub async fn consume(&self, stream: &mut EventStream) -> usize {
        self.consume_with(stream, |_| true).await
    }

    /// Like [`consume`](Self::consume), but `callback` sees each event
    /// first and stops consumption by returning false. The event it
    /// rejected is not folded.
    pub async fn consume_with<F>(&self, stream: &mut EventStream, mut callback: F) -> usize
    where
        F: FnMut(&Event) -> bool,
    {
        let mut folded = 0;
        while let Some(event) = stream.recv().await {
            if !callback(&event) {
                break;
            }
            self.add(&event);
            folded += 1;
        }
        folded
    }

    /// Returns to the zero state.
    pub fn reset(&self) {
        *self.lock() = State::default();
    }

    pub fn content(&self) -> String {
        self.lock().text.clone()
    }

    pub fn usage(&self) -> Usage {
        self.lock().usage
    }

    pub fn session_id(&self) -> SessionId {
        self.lock().session_id.clone()
    }

    pub fn model(&self) -> String {
        self.lock().model.clone()
    }

    pub fn is_done(&self) -> bool {
        self.lock().done
    }

    /// The terminal error: an engine error event or an erroring result.
    pub fn error(&self) -> Option<String> {
        self.lock().error.clone()
    }

    /// The last `result` payload folded.
    pub fn result(&self) -> Option<ResultPayload> {
        self.lock().result.clone()
    }

    /// Snapshot of everything folded so far.
    pub fn response(&self) -> QueryResponse {
        let state = self.lock();
        let result = state.result.as_ref();
        QueryResponse {
            session_id: state.session_id.clone(),
            model: state.model.clone(),
            text: state.text.clone(),
            usage: state.usage,
            cost: result.map(|r| r.total_cost_usd).unwrap_or_default(),
            num_turns: result.map(|r| r.num_turns).unwrap_or_default(),
            duration_ms: result.map(|r| r.duration_ms).unwrap_or_default(),
            is_error: state.error.is_some(),
            error: state.error.clone(),
            structured_output: result.and_then(|r| r.structured_output.clone()),
        }
    }
}

/// Final answer of a query.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueryResponse {
    pub session_id: SessionId,
    pub model: String,
    pub text: String,
    pub usage: Usage,
    pub cost: Money,
    pub num_turns: u32,
    pub duration_ms: u64,
    pub is_error: bool,
    pub error: Option<String>,
    pub structured_output: Option<serde_json::Value>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipe;
    use csm_protocol::parse_line;
    use tokio_util::sync::CancellationToken;

    fn event(line: &str) -> Event {
        parse_line(line.as_bytes()).unwrap()
    }

    const HELLO: &str = r#"{"type":"assistant","message":{"content":[{"type":"text","text":"Hello "}]}}"#;
    const WORLD: &str = r#"{"type":"assistant","message":{"content":[{"type":"text","text":"World"}],"usage":{"input_tokens":10,"output_tokens":5}}}"#;
    const RESULT: &str = r#"{"type":"result","subtype":"success"}"#;

    #[test]
    fn test_hello_world_scenario() {
        let acc = Accumulator::new();
        acc.add(&event(HELLO));
        acc.add(&event(WORLD));
        acc.add(&event(RESULT));

        assert_eq!(acc.content(), "Hello World");
        assert!(acc.is_done());
        assert_eq!(acc.usage().input_tokens.as_u64(), 10);
        assert_eq!(acc.usage().output_tokens.as_u64(), 5);
        assert_eq!(acc.error(), None);
    }

    #[test]
    fn test_usage_is_summed() {
        let acc = Accumulator::new();
        acc.add(&event(WORLD));
        acc.add(&event(WORLD));
        assert_eq!(acc.usage().input_tokens.as_u64(), 20);
    }

    #[test]
    fn test_result_seeds_usage_when_none_seen() {
        let acc = Accumulator::new();
        acc.add(&event(
            r#"{"type":"result","subtype":"success","result":"ok","usage":{"input_tokens":7,"output_tokens":3}}"#,
        ));
        assert_eq!(acc.usage(), Usage::new(7, 3));
        assert_eq!(acc.content(), "ok");
    }

    #[test]
    fn test_result_text_wins() {
        let acc = Accumulator::new();
        acc.add(&event(HELLO));
        acc.add(&event(r#"{"type":"result","subtype":"success","result":"Final"}"#));
        assert_eq!(acc.content(), "Final");

        acc.reset();
        acc.add(&event(HELLO));
        acc.add(&event(
            r#"{"type":"result","subtype":"success","structured_output":{"n":1}}"#,
        ));
        assert_eq!(acc.content(), r#"{"n":1}"#);
        assert_eq!(acc.response().structured_output, Some(serde_json::json!({"n": 1})));
    }

    #[test]
    fn test_init_first_write_wins() {
        let acc = Accumulator::new();
        acc.add(&event(r#"{"type":"system","subtype":"init","session_id":"a","model":"m1"}"#));
        acc.add(&event(r#"{"type":"system","subtype":"init","session_id":"b","model":"m2"}"#));
        assert_eq!(acc.session_id().as_str(), "a");
        assert_eq!(acc.model(), "m1");
    }

    #[test]
    fn test_error_keeps_text() {
        let acc = Accumulator::new();
        acc.add(&event(HELLO));
        acc.add(&Event::error(SessionId::default(), "agent exited"));
        assert_eq!(acc.content(), "Hello ");
        assert_eq!(acc.error().as_deref(), Some("agent exited"));
        assert!(!acc.is_done());
        assert!(acc.response().is_error);
    }

    #[test]
    fn test_reset() {
        let acc = Accumulator::new();
        acc.add(&event(WORLD));
        acc.add(&event(RESULT));
        acc.reset();
        assert_eq!(acc.content(), "");
        assert!(acc.usage().is_zero());
        assert!(!acc.is_done());
    }

    #[tokio::test]
    async fn test_consume_with_stops_early() {
        let (mut tx, mut rx) = pipe::channel(8);
        let cancel = CancellationToken::new();
        for line in [HELLO, WORLD, RESULT] {
            tx.send(event(line), &cancel).await;
        }
        drop(tx);

        let acc = Accumulator::new();
        let mut seen = 0;
        let folded = acc
            .consume_with(&mut rx, |_| {
                seen += 1;
                seen < 2
            })
            .await;

        assert_eq!(folded, 1);
        assert_eq!(acc.content(), "Hello ");
        assert!(!acc.is_done());
    }

    #[tokio::test]
    async fn test_consume_all() {
        let (mut tx, mut rx) = pipe::channel(8);
        let cancel = CancellationToken::new();
        for line in [HELLO, WORLD, RESULT] {
            tx.send(event(line), &cancel).await;
        }
        drop(tx);

        let acc = Accumulator::new();
        assert_eq!(acc.consume(&mut rx).await, 3);
        assert_eq!(acc.content(), "Hello World");
    }
}
