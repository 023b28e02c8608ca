use std::collections::{BTreeMap, HashSet};
use tracing::warn;

use crate::llm::history::ToolCallRequest;

#[derive(Debug, Clone, Default)]
struct PartialToolCall {
    id: Option<String>,
    name: String,
    arguments: String,
}

// Buffer to reconstruct tool_calls from streamed deltas keyed by index
#[derive(Debug, Default)]
pub struct ToolDeltaBuffer {
    calls: BTreeMap<usize, PartialToolCall>,
    last_index: Option<usize>,
}

impl ToolDeltaBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.calls.is_empty()
    }

    /// Append one delta. A missing index continues the most recent call.
    /// Returns the index the delta was applied to.
    pub fn push_delta(
        &mut self,
        index: Option<usize>,
        id: Option<&str>,
        name_delta: Option<&str>,
        args_delta: Option<&str>,
    ) -> usize {
        let index = index.or(self.last_index).unwrap_or(0);
        self.last_index = Some(index);
        let slot = self.calls.entry(index).or_default();
        if let Some(idv) = id
            && !idv.is_empty()
            && slot.id.is_none()
        {
            slot.id = Some(idv.to_string());
        }
        if let Some(n) = name_delta
            && !n.is_empty()
        {
            slot.name.push_str(n);
        }
        if let Some(a) = args_delta
            && !a.is_empty()
        {
            slot.arguments.push_str(a);
        }
        index
    }

    /// Close every open index, in index order. Calls without a name are
    /// dropped; calls without an id, or repeating an earlier id, get a
    /// generated one.
    pub fn finish(self) -> Vec<ToolCallRequest> {
        let mut seen = HashSet::new();
        self.calls
            .into_values()
            .filter(|c| !c.name.is_empty())
            .map(|c| {
                let id = match c.id {
                    Some(id) if !seen.contains(&id) => id,
                    Some(dup) => {
                        warn!(id = %dup, "model repeated a tool call id");
                        generated_id()
                    }
                    None => generated_id(),
                };
                seen.insert(id.clone());
                ToolCallRequest {
                    id,
                    name: c.name,
                    arguments: c.arguments,
                }
            })
            .collect()
    }
}

fn generated_id() -> String {
    format!("call_{}", uuid::Uuid::new_v4().simple())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reassembles_fragmented_arguments() {
        let mut b = ToolDeltaBuffer::new();
        b.push_delta(Some(0), Some("call_1"), Some("browser_open"), Some("{\"ur"));
        b.push_delta(Some(0), None, None, Some("l\":\"https://exa"));
        b.push_delta(None, None, None, Some("mple.com\"}"));
        let calls = b.finish();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].id, "call_1");
        assert_eq!(calls[0].name, "browser_open");
        assert_eq!(calls[0].arguments, r#"{"url":"https://example.com"}"#);
    }

    #[test]
    fn interleaved_indices_come_out_in_order() {
        let mut b = ToolDeltaBuffer::new();
        b.push_delta(Some(1), Some("b"), Some("browser_snapshot"), Some("{}"));
        b.push_delta(Some(0), Some("a"), Some("browser_open"), Some("{\"url\":"));
        b.push_delta(Some(0), None, None, Some("\"x\"}"));
        let calls = b.finish();
        let ids: Vec<_> = calls.iter().map(|c| c.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b"]);
        assert_eq!(calls[0].arguments, r#"{"url":"x"}"#);
    }

    #[test]
    fn missing_id_is_generated_and_nameless_dropped() {
        let mut b = ToolDeltaBuffer::new();
        b.push_delta(Some(0), None, Some("browser_close"), None);
        b.push_delta(Some(3), Some("ghost"), None, Some("{}"));
        let calls = b.finish();
        assert_eq!(calls.len(), 1);
        assert!(calls[0].id.starts_with("call_"));
    }

    #[test]
    fn repeated_id_is_replaced() {
        let mut b = ToolDeltaBuffer::new();
        b.push_delta(Some(0), Some("call_1"), Some("browser_snapshot"), Some("{}"));
        b.push_delta(Some(1), Some("call_1"), Some("browser_click"), Some(r#"{"ref":"e1"}"#));
        let calls = b.finish();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0].id, "call_1");
        assert_ne!(calls[1].id, "call_1");
        assert_eq!(calls[1].name, "browser_click");
    }
}
