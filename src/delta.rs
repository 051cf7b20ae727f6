//! Delta parsing for streamed chat-completion chunks.
//!
//! Each `data:` line of a streamed completion carries one chunk whose first
//! choice holds a `delta`: a text token, one or more tool-call fragments, or
//! nothing of interest. Tool calls come in two wire shapes:
//!
//! ```text
//! modern: {"delta": {"tool_calls": [{"index": 0, "id": "call_1", "function": {"name": "search"}}]}}
//! legacy: {"delta": {"function_call": {"name": "search", "arguments": "{\"q\""}}}
//! ```
//!
//! The legacy shape is normalized into a single fragment at index 0 so the
//! merger only ever sees one representation.
//!
//! Parsing is total: anything that does not match the expected structure is
//! ignored rather than reported. Only the first choice is considered, since
//! streaming servers emit one choice per chunk.

use crate::types::{FUNCTION_TYPE, ToolCallFragment};
use serde::Deserialize;
use serde_json::Value;

/// What one chunk contributes to the current round.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Delta {
    /// Assistant text token, appended verbatim to the round's text.
    pub text: Option<String>,

    /// Tool-call fragments in the order they appear in the chunk.
    pub fragments: Vec<ToolCallFragment>,

    /// True when the chunk carried a tool-call shape at all, even one whose
    /// fragments turned out unusable. A round that saw tool calls is not over
    /// when the upstream stream ends.
    pub saw_tool_calls: bool,
}

impl Delta {
    pub fn is_empty(&self) -> bool {
        self.text.is_none() && self.fragments.is_empty() && !self.saw_tool_calls
    }
}

/// Wire shape of one `tool_calls[]` entry. Parsed per entry, so one broken
/// entry does not take its siblings down with it. Fields stay loosely typed:
/// a field of the wrong type is dropped on its own.
#[derive(Debug, Deserialize)]
struct WireToolCall {
    #[serde(default)]
    index: Option<Value>,
    #[serde(default)]
    id: Option<Value>,
    #[serde(default, rename = "type")]
    call_type: Option<Value>,
    #[serde(default)]
    function: Option<Value>,
}

/// Wire shape of a `function` object, shared by both tool-call shapes.
#[derive(Debug, Default, Deserialize)]
struct WireFunction {
    #[serde(default)]
    name: Option<Value>,
    #[serde(default)]
    arguments: Option<Value>,
}

impl WireFunction {
    fn from_value(value: Option<&Value>) -> Self {
        value
            .filter(|v| v.is_object())
            .and_then(|v| serde_json::from_value(v.clone()).ok())
            .unwrap_or_default()
    }

    fn name_text(&self) -> Option<String> {
        self.name.as_ref().and_then(scalar_text)
    }

    /// Only string argument fragments can be concatenated; anything else is dropped.
    fn argument_text(&self) -> Option<String> {
        match &self.arguments {
            Some(Value::String(s)) => Some(s.clone()),
            _ => None,
        }
    }
}

/// Extracts text and tool-call fragments from one decoded chunk.
pub fn parse_delta(chunk: &Value) -> Delta {
    let mut delta = Delta::default();

    let Some(raw) = chunk
        .get("choices")
        .and_then(Value::as_array)
        .and_then(|choices| choices.first())
        .and_then(|choice| choice.get("delta"))
        .filter(|d| d.is_object())
    else {
        return delta;
    };

    if let Some(text) = raw.get("content").and_then(Value::as_str) {
        delta.text = Some(text.to_string());
    }

    if let Some(calls) = raw.get("tool_calls").and_then(Value::as_array) {
        delta.saw_tool_calls = true;
        delta
            .fragments
            .extend(calls.iter().filter_map(fragment_from_tool_call));
    }

    if let Some(function_call) = raw.get("function_call").filter(|f| f.is_object()) {
        delta.saw_tool_calls = true;
        if let Some(fragment) = normalize_function_call(function_call) {
            delta.fragments.push(fragment);
        }
    }

    delta
}

/// Converts one modern `tool_calls[]` entry into a fragment.
fn fragment_from_tool_call(entry: &Value) -> Option<ToolCallFragment> {
    if !entry.is_object() {
        return None;
    }
    let wire: WireToolCall = match serde_json::from_value(entry.clone()) {
        Ok(w) => w,
        Err(e) => {
            log::trace!("skipping malformed tool-call fragment: {}", e);
            return None;
        }
    };

    let function = WireFunction::from_value(wire.function.as_ref());
    Some(ToolCallFragment {
        index: wire.index.as_ref().and_then(value_to_index),
        id: wire.id.as_ref().and_then(scalar_text),
        call_type: wire.call_type.as_ref().and_then(scalar_text),
        arguments: function.argument_text(),
        name: function.name_text(),
    })
}

/// Normalizes the legacy `delta.function_call` object into a fragment at index 0.
pub fn normalize_function_call(function_call: &Value) -> Option<ToolCallFragment> {
    let function: WireFunction = serde_json::from_value(function_call.clone()).ok()?;
    Some(ToolCallFragment {
        index: Some(0),
        id: None,
        call_type: Some(FUNCTION_TYPE.to_string()),
        arguments: function.argument_text(),
        name: function.name_text(),
    })
}

/// Numeric indices only; a string such as `"0"` is not an index.
fn value_to_index(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f.trunc() as i64)),
        _ => None,
    }
}

/// Text form of a scalar id, type or name. Numbers and booleans are rendered,
/// null and structured values are dropped.
fn scalar_text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn chunk(delta: Value) -> Value {
        json!({
            "id": "chatcmpl-1",
            "object": "chat.completion.chunk",
            "choices": [{"index": 0, "delta": delta, "finish_reason": null}]
        })
    }

    #[test]
    fn test_text_delta() {
        let delta = parse_delta(&chunk(json!({"content": "Hello"})));
        assert_eq!(delta.text.as_deref(), Some("Hello"));
        assert!(delta.fragments.is_empty());
        assert!(!delta.saw_tool_calls);
    }

    #[test]
    fn test_null_content_is_no_text() {
        let delta = parse_delta(&chunk(json!({"role": "assistant", "content": null})));
        assert!(delta.is_empty());
    }

    #[test]
    fn test_modern_tool_call_fragments() {
        let delta = parse_delta(&chunk(json!({
            "tool_calls": [
                {"index": 0, "id": "call_1", "type": "function",
                 "function": {"name": "get_weather", "arguments": "{\"ci"}},
                {"index": 1, "function": {"arguments": "ty\":\"Linz\"}"}}
            ]
        })));

        assert!(delta.saw_tool_calls);
        assert_eq!(delta.fragments.len(), 2);
        assert_eq!(
            delta.fragments[0],
            ToolCallFragment {
                index: Some(0),
                id: Some("call_1".to_string()),
                call_type: Some("function".to_string()),
                name: Some("get_weather".to_string()),
                arguments: Some("{\"ci".to_string()),
            }
        );
        assert_eq!(delta.fragments[1].index, Some(1));
        assert_eq!(delta.fragments[1].name, None);
        assert_eq!(delta.fragments[1].arguments.as_deref(), Some("ty\":\"Linz\"}"));
    }

    #[test]
    fn test_legacy_function_call_normalized_to_index_zero() {
        let delta = parse_delta(&chunk(json!({
            "function_call": {"name": "search", "arguments": "{\"q\":"}
        })));

        assert!(delta.saw_tool_calls);
        assert_eq!(
            delta.fragments,
            vec![ToolCallFragment {
                index: Some(0),
                id: None,
                call_type: Some("function".to_string()),
                name: Some("search".to_string()),
                arguments: Some("{\"q\":".to_string()),
            }]
        );
    }

    #[test]
    fn test_text_and_tool_calls_in_one_chunk() {
        let delta = parse_delta(&chunk(json!({
            "content": "Checking",
            "tool_calls": [{"index": 0, "function": {"name": "clock"}}]
        })));
        assert_eq!(delta.text.as_deref(), Some("Checking"));
        assert_eq!(delta.fragments.len(), 1);
    }

    #[test]
    fn test_empty_tool_calls_array_still_counts_as_seen() {
        let delta = parse_delta(&chunk(json!({"tool_calls": []})));
        assert!(delta.saw_tool_calls);
        assert!(delta.fragments.is_empty());
    }

    #[test]
    fn test_malformed_fragment_does_not_drop_siblings() {
        let delta = parse_delta(&chunk(json!({
            "tool_calls": [
                "not an object",
                {"index": 1, "function": {"name": "clock"}}
            ]
        })));
        assert!(delta.saw_tool_calls);
        assert_eq!(delta.fragments.len(), 1);
        assert_eq!(delta.fragments[0].index, Some(1));
    }

    #[test]
    fn test_numeric_id_is_stringified_and_keeps_other_fields() {
        let delta = parse_delta(&chunk(json!({
            "tool_calls": [{"index": 0, "id": 42, "type": "function",
                "function": {"name": "get_weather", "arguments": "{\"city\":\"Linz\"}"}}]
        })));
        assert_eq!(delta.fragments.len(), 1);
        let fragment = &delta.fragments[0];
        assert_eq!(fragment.id.as_deref(), Some("42"));
        assert_eq!(fragment.name.as_deref(), Some("get_weather"));
        assert_eq!(fragment.arguments.as_deref(), Some("{\"city\":\"Linz\"}"));
    }

    #[test]
    fn test_wrongly_typed_fields_are_dropped_individually() {
        let delta = parse_delta(&chunk(json!({
            "tool_calls": [{"index": 0, "id": {"nested": true}, "type": null,
                "function": {"name": ["clock"], "arguments": "{}"}}]
        })));
        let fragment = &delta.fragments[0];
        assert_eq!(fragment.id, None);
        assert_eq!(fragment.call_type, None);
        assert_eq!(fragment.name, None);
        assert_eq!(fragment.arguments.as_deref(), Some("{}"));

        let delta = parse_delta(&chunk(json!({
            "tool_calls": [{"index": 2, "id": "call_9", "function": "clock"}]
        })));
        assert_eq!(delta.fragments[0].id.as_deref(), Some("call_9"));
        assert_eq!(delta.fragments[0].name, None);
    }

    #[test]
    fn test_missing_or_non_numeric_index() {
        let delta = parse_delta(&chunk(json!({
            "tool_calls": [{"function": {"name": "clock"}}]
        })));
        assert_eq!(delta.fragments[0].index, None);

        let delta = parse_delta(&chunk(json!({
            "tool_calls": [{"index": "0", "function": {"name": "clock"}}]
        })));
        assert_eq!(delta.fragments[0].index, None);
        assert_eq!(delta.fragments[0].name.as_deref(), Some("clock"));
    }

    #[test]
    fn test_non_string_arguments_are_ignored() {
        let delta = parse_delta(&chunk(json!({
            "tool_calls": [{"index": 0, "function": {"name": "clock", "arguments": {"tz": "UTC"}}}]
        })));
        assert_eq!(delta.fragments[0].arguments, None);
        assert_eq!(delta.fragments[0].name.as_deref(), Some("clock"));
    }

    #[test]
    fn test_unrecognized_chunks_are_no_ops() {
        assert!(parse_delta(&json!({})).is_empty());
        assert!(parse_delta(&json!({"choices": []})).is_empty());
        assert!(parse_delta(&json!({"choices": "nope"})).is_empty());
        assert!(parse_delta(&json!({"choices": [{"delta": "text"}]})).is_empty());
        assert!(parse_delta(&json!({"usage": {"total_tokens": 12}})).is_empty());
    }

    #[test]
    fn test_only_first_choice_is_read() {
        let delta = parse_delta(&json!({
            "choices": [
                {"delta": {"content": "first"}},
                {"delta": {"content": "second"}}
            ]
        }));
        assert_eq!(delta.text.as_deref(), Some("first"));
    }
}
