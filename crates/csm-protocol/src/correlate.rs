//! Tool-use / tool-result correlation.
//!
//! Every `tool_use` block the agent emits is answered by exactly one later
//! `tool_result` block with the same id. The correlator follows a single
//! session's stream and reports calls still waiting for a result, results
//! that answer nothing, and ids seen twice.

use std::collections::{HashMap, HashSet};

use csm_core::ToolUseId;

use crate::event::{Event, EventPayload};
use crate::payload::ContentBlock;

/// Tracks tool calls across one event stream.
#[derive(Debug, Default)]
pub struct ToolCorrelator {
    /// Open calls: id → tool name.
    pending: HashMap<ToolUseId, String>,
    completed: HashSet<ToolUseId>,
    orphans: Vec<ToolUseId>,
    duplicates: Vec<ToolUseId>,
}

impl ToolCorrelator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feeds one event. Events other than assistant/user are ignored.
    pub fn observe(&mut self, event: &Event) {
        match &event.payload {
            EventPayload::Assistant(p) => {
                for (id, name, _) in p.tool_uses() {
                    self.record_use(id, name);
                }
                // Server-side tools report their results inline.
                self.record_results(&p.content);
            }
            EventPayload::User(p) => {
                for result in p.tool_results() {
                    self.record_result(result.tool_use_id);
                }
            }
            _ => {}
        }
    }

    fn record_use(&mut self, id: &ToolUseId, name: &str) {
        if self.pending.contains_key(id) || self.completed.contains(id) {
            self.duplicates.push(id.clone());
            return;
        }
        self.pending.insert(id.clone(), name.to_string());
    }

    fn record_results(&mut self, content: &[ContentBlock]) {
        for block in content {
            if let ContentBlock::ToolResult { tool_use_id, .. } = block {
                self.record_result(tool_use_id);
            }
        }
    }

    fn record_result(&mut self, id: &ToolUseId) {
        if self.pending.remove(id).is_some() {
            self.completed.insert(id.clone());
        } else if self.completed.contains(id) {
            self.duplicates.push(id.clone());
        } else {
            self.orphans.push(id.clone());
        }
    }

    /// Calls without a result yet, with their tool names.
    pub fn pending(&self) -> impl Iterator<Item = (&ToolUseId, &str)> {
        self.pending.iter().map(|(id, name)| (id, name.as_str()))
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    pub fn completed_count(&self) -> usize {
        self.completed.len()
    }

    /// Results whose id was never announced by a `tool_use`.
    pub fn orphans(&self) -> &[ToolUseId] {
        &self.orphans
    }

    /// Ids announced or answered more than once.
    pub fn duplicates(&self) -> &[ToolUseId] {
        &self.duplicates
    }

    /// True when every call has exactly one result and nothing is stray.
    pub fn is_balanced(&self) -> bool {
        self.pending.is_empty() && self.orphans.is_empty() && self.duplicates.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parse::parse_line;

    fn feed(correlator: &mut ToolCorrelator, line: &str) {
        let event = parse_line(line.as_bytes()).unwrap();
        correlator.observe(&event);
    }

    const TOOL_USE: &str = r#"{"type":"assistant","session_id":"s","message":{"id":"m1","model":"claude","content":[{"type":"tool_use","id":"toolu_1","name":"Read","input":{"file_path":"/tmp/a"}}]}}"#;
    const TOOL_RESULT: &str = r#"{"type":"user","session_id":"s","message":{"role":"user","content":[{"type":"tool_result","tool_use_id":"toolu_1","content":"ok"}]}}"#;

    #[test]
    fn test_round_trip_balances() {
        let mut c = ToolCorrelator::new();
        feed(&mut c, TOOL_USE);
        assert_eq!(c.pending_count(), 1);
        assert_eq!(
            c.pending().next().map(|(id, name)| (id.as_str(), name)),
            Some(("toolu_1", "Read"))
        );

        feed(&mut c, TOOL_RESULT);
        assert_eq!(c.pending_count(), 0);
        assert_eq!(c.completed_count(), 1);
        assert!(c.is_balanced());
    }

    #[test]
    fn test_missing_result_is_unbalanced() {
        let mut c = ToolCorrelator::new();
        feed(&mut c, TOOL_USE);
        assert!(!c.is_balanced());
    }

    #[test]
    fn test_orphan_result() {
        let mut c = ToolCorrelator::new();
        feed(&mut c, TOOL_RESULT);
        assert_eq!(c.orphans(), &[ToolUseId::new("toolu_1")]);
        assert!(!c.is_balanced());
    }

    #[test]
    fn test_second_result_is_duplicate() {
        let mut c = ToolCorrelator::new();
        feed(&mut c, TOOL_USE);
        feed(&mut c, TOOL_RESULT);
        feed(&mut c, TOOL_RESULT);
        assert_eq!(c.duplicates(), &[ToolUseId::new("toolu_1")]);
    }
}
