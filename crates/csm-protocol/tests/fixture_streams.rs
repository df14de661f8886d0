//! Whole-stream tests over recorded stream-json fixtures.

use csm_core::{HookEventType, Money, SessionId};
use csm_protocol::parse::is_blank;
use csm_protocol::{
    parse_line, Event, EventType, LineScanner, ResultSubtype, ToolCorrelator, ToolUseResult,
};

const TOOL_ROUNDTRIP: &[u8] = include_bytes!("fixtures/tool_roundtrip.jsonl");
const UNKNOWN_BETWEEN: &[u8] = include_bytes!("fixtures/unknown_between.jsonl");
const HOOKS_AND_ERROR: &[u8] = include_bytes!("fixtures/hooks_and_error.jsonl");

/// Scans and parses a fixture, returning events and the number of
/// lines that failed to parse.
async fn read_fixture(bytes: &[u8]) -> (Vec<Event>, usize) {
    let mut scanner = LineScanner::new(bytes);
    let mut events = Vec::new();
    let mut failures = 0;
    while let Some(line) = scanner.next_line().await.expect("scan") {
        if is_blank(&line) {
            continue;
        }
        match parse_line(&line) {
            Ok(event) => events.push(event),
            Err(_) => failures += 1,
        }
    }
    (events, failures)
}

fn types(events: &[Event]) -> Vec<EventType> {
    events.iter().map(Event::event_type).collect()
}

#[tokio::test]
async fn test_tool_roundtrip_fixture() {
    let (events, failures) = read_fixture(TOOL_ROUNDTRIP).await;
    assert_eq!(failures, 0);
    assert_eq!(
        types(&events),
        vec![
            EventType::Init,
            EventType::Assistant,
            EventType::User,
            EventType::Assistant,
            EventType::User,
            EventType::Assistant,
            EventType::Result,
        ]
    );

    let sid = SessionId::new("8e11bfb5-7dc2-432b-9206-928fa5c35731");
    assert!(events.iter().all(|e| e.session_id == sid));

    let init = events[0].as_init().unwrap();
    assert_eq!(init.model, "claude-sonnet-4-5");
    assert_eq!(init.tools, vec!["Read", "Bash"]);
    assert_eq!(init.version, "2.0.14");
    assert!(init.mcp_servers[0].is_connected());

    let first = events[1].as_assistant().unwrap();
    assert_eq!(first.text, "Reading the file.");
    assert_eq!(first.usage.input_tokens.as_u64(), 12);
    assert_eq!(first.stop_reason, None);

    let read_result = events[2].as_user().unwrap();
    match &read_result.tool_use_result {
        Some(ToolUseResult::File(f)) => {
            assert_eq!(f.file.file_path, "/work/notes.txt");
            assert_eq!(f.file.num_lines, 2);
        }
        other => panic!("expected file result, got {other:?}"),
    }

    let bash_result = events[4].as_user().unwrap();
    match &bash_result.tool_use_result {
        Some(ToolUseResult::Command(c)) => assert_eq!(c.stdout, "2 /work/notes.txt"),
        other => panic!("expected command result, got {other:?}"),
    }
    let refs: Vec<_> = bash_result.tool_results().collect();
    assert_eq!(refs[0].content.to_text(), "2 /work/notes.txt");

    let result = events[6].as_result().unwrap();
    assert!(result.subtype.is_success());
    assert_eq!(result.num_turns, 3);
    assert_eq!(result.total_cost_usd, Money::from_usd(0.0123));
    assert_eq!(
        result.model_usage["claude-sonnet-4-5"].output_tokens,
        24
    );
    assert_eq!(result.output_text().as_deref(), Some("The file has two lines."));
}

#[tokio::test]
async fn test_every_tool_use_has_a_later_result() {
    let (events, _) = read_fixture(TOOL_ROUNDTRIP).await;

    let mut correlator = ToolCorrelator::new();
    for event in &events {
        correlator.observe(event);
    }
    assert_eq!(correlator.completed_count(), 2);
    assert!(
        correlator.is_balanced(),
        "pending: {:?}, orphans: {:?}",
        correlator.pending().collect::<Vec<_>>(),
        correlator.orphans()
    );

    // Each result must come after its use.
    for (i, event) in events.iter().enumerate() {
        if let Some(assistant) = event.as_assistant() {
            for (id, _, _) in assistant.tool_uses() {
                let answered = events[i + 1..].iter().any(|later| {
                    later
                        .as_user()
                        .is_some_and(|u| u.tool_results().any(|r| r.tool_use_id == id))
                });
                assert!(answered, "tool_use {id} has no later tool_result");
            }
        }
    }
}

#[tokio::test]
async fn test_unknown_type_between_assistant_and_result() {
    let (events, failures) = read_fixture(UNKNOWN_BETWEEN).await;

    // The non-JSON line is skipped, not fatal.
    assert_eq!(failures, 1);
    assert_eq!(
        types(&events),
        vec![
            EventType::Assistant,
            EventType::Unknown,
            EventType::Assistant,
            EventType::Result,
        ]
    );

    match &events[1].payload {
        csm_protocol::EventPayload::Unknown(u) => assert_eq!(u.type_name, "stream_event"),
        other => panic!("expected unknown payload, got {other:?}"),
    }
    assert!(events[1].raw_str().contains("content_block_delta"));

    let text: String = events
        .iter()
        .filter_map(Event::as_assistant)
        .map(|a| a.text.as_str())
        .collect();
    assert_eq!(text, "Hello World");

    // The parser does not propagate ids; the second assistant line has none.
    assert!(events[2].session_id.is_empty());
    assert_eq!(events[3].session_id.as_str(), "0c7d");
}

#[tokio::test]
async fn test_hook_and_error_result_fixture() {
    let (events, failures) = read_fixture(HOOKS_AND_ERROR).await;
    assert_eq!(failures, 0);
    assert_eq!(
        types(&events),
        vec![EventType::Hook, EventType::Init, EventType::Result]
    );

    match &events[0].payload {
        csm_protocol::EventPayload::Hook(h) => {
            assert_eq!(h.event_type(), Some(HookEventType::SessionStart));
            assert_eq!(h.exit_code, Some(0));
        }
        other => panic!("expected hook payload, got {other:?}"),
    }

    let result = events[2].as_result().unwrap();
    assert!(result.is_error);
    assert_eq!(result.subtype, ResultSubtype::ErrorMaxTurns);
    assert_eq!(result.output_text(), None);
    assert!(!result.appears_transient());
}
