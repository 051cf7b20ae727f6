//! Index-keyed accumulation of streamed tool-call fragments.
//!
//! A single tool call arrives spread over many chunks, and several calls can
//! be interleaved:
//!
//! ```text
//! Chunk 1: tool_calls[0] = { id: "call_1", name: "search" }
//! Chunk 2: tool_calls[1] = { id: "call_2", name: "calculate" }
//! Chunk 3: tool_calls[0] = { arguments: "{\"q\"" }
//! Chunk 4: tool_calls[1] = { arguments: "{\"expr\"" }
//! Chunk 5: tool_calls[0] = { arguments: ":\"rust\"}" }
//! Chunk 6: tool_calls[1] = { arguments: ":\"2+2\"}" }
//! ```
//!
//! # Accumulation contract
//!
//! - `id`, `type` and `name`: latest non-empty value wins. Replaying a fragment
//!   with the same scalar value leaves the call unchanged.
//! - `arguments`: every non-empty fragment is appended in arrival order. There
//!   is no deduplication; replaying an argument fragment duplicates its text.
//! - Fragments without an index, or with a negative or out-of-range index, are
//!   rejected and leave all other entries untouched.
//!
//! Arguments are kept as raw text and only validated once the round is over,
//! because the JSON may be split at any byte position.

use crate::types::{ToolCall, ToolCallFragment};
use std::collections::BTreeMap;

/// Request-scoped accumulator for one stream's tool calls.
///
/// Keyed by the stream index in a `BTreeMap`, so iteration is always in
/// ascending index order regardless of arrival order.
#[derive(Debug, Default, Clone)]
pub struct ToolCallMerger {
    calls: BTreeMap<u32, ToolCall>,
}

impl ToolCallMerger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Applies one fragment. Returns `false` if the fragment was rejected for
    /// lack of a usable index.
    pub fn merge(&mut self, fragment: ToolCallFragment) -> bool {
        let Some(index) = fragment.index.and_then(|i| u32::try_from(i).ok()) else {
            log::trace!("rejecting tool-call fragment with index {:?}", fragment.index);
            return false;
        };

        let call = self.calls.entry(index).or_default();

        if let Some(id) = non_empty(fragment.id) {
            call.id = id;
        }
        if let Some(call_type) = non_empty(fragment.call_type) {
            call.call_type = call_type;
        }
        if let Some(name) = non_empty(fragment.name) {
            call.name = name;
        }
        if let Some(arguments) = fragment.arguments {
            call.arguments.push_str(&arguments);
        }

        true
    }

    /// Applies fragments in order; returns how many were accepted.
    pub fn merge_all<I>(&mut self, fragments: I) -> usize
    where
        I: IntoIterator<Item = ToolCallFragment>,
    {
        fragments
            .into_iter()
            .map(|f| self.merge(f))
            .filter(|accepted| *accepted)
            .count()
    }

    pub fn get(&self, index: u32) -> Option<&ToolCall> {
        self.calls.get(&index)
    }

    pub fn len(&self) -> usize {
        self.calls.len()
    }

    pub fn is_empty(&self) -> bool {
        self.calls.is_empty()
    }

    /// Consumes the merger, yielding `(index, call)` pairs in ascending index order.
    pub fn into_calls(self) -> Vec<(u32, ToolCall)> {
        self.calls.into_iter().collect()
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fragment(index: i64) -> ToolCallFragment {
        ToolCallFragment {
            index: Some(index),
            ..Default::default()
        }
    }

    #[test]
    fn test_merges_fragments_into_one_call() {
        let mut merger = ToolCallMerger::new();

        merger.merge(ToolCallFragment {
            id: Some("call_123".to_string()),
            call_type: Some("function".to_string()),
            name: Some("get_weather".to_string()),
            arguments: Some(r#"{"location":"#.to_string()),
            ..fragment(0)
        });
        merger.merge(ToolCallFragment {
            arguments: Some(r#""Paris"}"#.to_string()),
            ..fragment(0)
        });

        let calls = merger.into_calls();
        assert_eq!(calls.len(), 1);
        let (index, call) = &calls[0];
        assert_eq!(*index, 0);
        assert_eq!(call.id, "call_123");
        assert_eq!(call.call_type, "function");
        assert_eq!(call.name, "get_weather");
        assert_eq!(call.arguments, r#"{"location":"Paris"}"#);
    }

    #[test]
    fn test_latest_non_empty_scalar_wins() {
        let mut merger = ToolCallMerger::new();
        merger.merge(ToolCallFragment {
            name: Some("first".to_string()),
            ..fragment(0)
        });
        merger.merge(ToolCallFragment {
            name: Some(String::new()),
            id: Some(String::new()),
            ..fragment(0)
        });
        assert_eq!(merger.get(0).unwrap().name, "first");
        assert_eq!(merger.get(0).unwrap().id, "");

        merger.merge(ToolCallFragment {
            name: Some("second".to_string()),
            ..fragment(0)
        });
        assert_eq!(merger.get(0).unwrap().name, "second");
    }

    #[test]
    fn test_scalar_replay_is_idempotent() {
        let scalar = ToolCallFragment {
            id: Some("call_1".to_string()),
            name: Some("clock".to_string()),
            ..fragment(0)
        };

        let mut once = ToolCallMerger::new();
        once.merge(scalar.clone());

        let mut twice = ToolCallMerger::new();
        twice.merge(scalar.clone());
        twice.merge(scalar);

        assert_eq!(once.get(0), twice.get(0));
    }

    #[test]
    fn test_argument_replay_is_concatenated() {
        let args = ToolCallFragment {
            arguments: Some("ab".to_string()),
            ..fragment(0)
        };

        let mut merger = ToolCallMerger::new();
        merger.merge(args.clone());
        merger.merge(args);

        assert_eq!(merger.get(0).unwrap().arguments, "abab");
    }

    #[test]
    fn test_interleaved_calls_are_kept_apart() {
        let mut merger = ToolCallMerger::new();
        let fragments = vec![
            ToolCallFragment { name: Some("search".to_string()), ..fragment(0) },
            ToolCallFragment { name: Some("calculate".to_string()), ..fragment(1) },
            ToolCallFragment { arguments: Some("{\"q\"".to_string()), ..fragment(0) },
            ToolCallFragment { arguments: Some("{\"expr\"".to_string()), ..fragment(1) },
            ToolCallFragment { arguments: Some(":\"rust\"}".to_string()), ..fragment(0) },
            ToolCallFragment { arguments: Some(":\"2+2\"}".to_string()), ..fragment(1) },
        ];
        assert_eq!(merger.merge_all(fragments), 6);

        assert_eq!(merger.get(0).unwrap().arguments, r#"{"q":"rust"}"#);
        assert_eq!(merger.get(1).unwrap().arguments, r#"{"expr":"2+2"}"#);
    }

    #[test]
    fn test_invalid_indices_are_rejected() {
        let mut merger = ToolCallMerger::new();
        merger.merge(ToolCallFragment {
            name: Some("keep".to_string()),
            ..fragment(0)
        });

        assert!(!merger.merge(ToolCallFragment {
            name: Some("negative".to_string()),
            ..fragment(-1)
        }));
        assert!(!merger.merge(ToolCallFragment {
            name: Some("missing".to_string()),
            index: None,
            ..Default::default()
        }));
        assert!(!merger.merge(ToolCallFragment {
            name: Some("huge".to_string()),
            ..fragment(i64::from(u32::MAX) + 1)
        }));

        assert_eq!(merger.len(), 1);
        assert_eq!(merger.get(0).unwrap().name, "keep");
    }

    #[test]
    fn test_calls_come_out_in_index_order() {
        let mut merger = ToolCallMerger::new();
        for index in [2, 0, 1] {
            merger.merge(ToolCallFragment {
                name: Some(format!("tool_{}", index)),
                ..fragment(index)
            });
        }

        let names: Vec<String> = merger.into_calls().into_iter().map(|(_, c)| c.name).collect();
        assert_eq!(names, vec!["tool_0", "tool_1", "tool_2"]);
    }
}
