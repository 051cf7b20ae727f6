//! Core types for tool-relay
//!
//! The conversation and the chunks travelling over the wire are kept as
//! `serde_json::Value` wherever the relay does not own their shape: system and
//! user messages belong to the caller, and upstream chunks are forwarded
//! byte-for-byte except for injected metadata. Tool calls and their results
//! are owned by the relay and get concrete types.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};

/// The only tool-call type currently emitted by OpenAI-compatible servers.
pub const FUNCTION_TYPE: &str = "function";

/// A tool call being assembled from streamed fragments, or a completed one.
///
/// All fields start empty and are filled by [`crate::ToolCallMerger`]. Once a
/// round completes, `arguments` (if non-empty) must parse as a JSON object for
/// the call to be executed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ToolCall {
    /// Correlation id assigned by the backend, or synthesized locally.
    pub id: String,

    /// Call type, `"function"` once normalized.
    pub call_type: String,

    /// Tool/function name. May stay empty across early fragments.
    pub name: String,

    /// Concatenation of all argument text fragments, in arrival order.
    pub arguments: String,
}

impl ToolCall {
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        arguments: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            call_type: FUNCTION_TYPE.to_string(),
            name: name.into(),
            arguments: arguments.into(),
        }
    }

    /// OpenAI wire representation, as used in assistant `tool_calls` arrays and
    /// in the injected `tool-calls` metadata.
    pub fn to_json(&self) -> Value {
        json!({
            "id": self.id,
            "type": self.call_type,
            "function": {
                "name": self.name,
                "arguments": self.arguments
            }
        })
    }
}

/// One raw tool-call fragment extracted from a streamed delta.
///
/// Both the modern `delta.tool_calls[]` entries and the legacy
/// `delta.function_call` object are normalized into this shape. Absent fields
/// are `None`; the merger decides what an empty value means.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ToolCallFragment {
    /// Stream-supplied index correlating fragments of the same call.
    pub index: Option<i64>,
    pub id: Option<String>,
    pub call_type: Option<String>,
    pub name: Option<String>,
    pub arguments: Option<String>,
}

/// Output of one executed tool call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolResult {
    pub tool_call_id: String,
    pub name: String,
    pub content: String,
}

/// Ephemeral record of one tool round: the executed calls and their results,
/// position-aligned.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RoundData {
    pub tool_calls: Vec<ToolCall>,
    pub tool_results: Vec<ToolResult>,
}

impl RoundData {
    /// A round without executed calls ends the lifecycle.
    pub fn is_empty(&self) -> bool {
        self.tool_results.is_empty()
    }

    pub fn len(&self) -> usize {
        self.tool_results.len()
    }

    /// The top-level fields injected into the first usable data line of the
    /// follow-up stream.
    pub fn metadata(&self) -> Map<String, Value> {
        let mut fields = Map::new();
        fields.insert(
            "tool-calls".to_string(),
            Value::Array(self.tool_calls.iter().map(ToolCall::to_json).collect()),
        );
        fields.insert(
            "tool-results".to_string(),
            Value::Array(
                self.tool_results
                    .iter()
                    .map(|r| {
                        json!({
                            "tool_call_id": r.tool_call_id,
                            "name": r.name,
                            "content": r.content
                        })
                    })
                    .collect(),
            ),
        );
        fields
    }
}

/// Append-only chat history.
///
/// The caller's initial messages are kept untouched; the relay only ever adds
/// assistant tool-call messages and tool result messages behind them.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Conversation {
    messages: Vec<Value>,
}

impl Conversation {
    pub fn new(messages: Vec<Value>) -> Self {
        Self { messages }
    }

    pub fn messages(&self) -> &[Value] {
        &self.messages
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    /// JSON array for the `messages` field of an upstream request.
    pub fn to_json(&self) -> Value {
        Value::Array(self.messages.clone())
    }

    pub fn into_messages(self) -> Vec<Value> {
        self.messages
    }

    /// Appends the assistant turn that requested `calls`.
    pub fn push_assistant_tool_calls(&mut self, content: &str, calls: &[ToolCall]) {
        self.messages.push(json!({
            "role": "assistant",
            "content": content,
            "tool_calls": calls.iter().map(ToolCall::to_json).collect::<Vec<_>>()
        }));
    }

    /// Appends one `tool` role message carrying an execution result.
    pub fn push_tool_result(&mut self, result: &ToolResult) {
        self.messages.push(json!({
            "role": "tool",
            "tool_call_id": result.tool_call_id,
            "name": result.name,
            "content": result.content
        }));
    }
}

impl From<Vec<Value>> for Conversation {
    fn from(messages: Vec<Value>) -> Self {
        Self::new(messages)
    }
}
