//! Execution of one round's merged tool calls.
//!
//! Calls are taken in ascending stream index, normalized, validated against
//! the per-request call counters and dispatched through the [`ToolRegistry`]
//! one after another. Accepted calls and their results are appended to the
//! conversation as one assistant message followed by one `tool` message per
//! call; a round in which nothing was accepted leaves the conversation as it
//! was.

use crate::merger::ToolCallMerger;
use crate::registry::ToolRegistry;
use crate::types::{Conversation, FUNCTION_TYPE, RoundData, ToolCall, ToolResult};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

/// Executions per tool name over the whole lifecycle of one client request.
///
/// Never reset between rounds and never shared between requests.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct CallCounters {
    counts: HashMap<String, u32>,
}

impl CallCounters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, name: &str) -> u32 {
        self.counts.get(name).copied().unwrap_or(0)
    }

    pub fn increment(&mut self, name: &str) -> u32 {
        let count = self.counts.entry(name.to_string()).or_insert(0);
        *count += 1;
        *count
    }

    /// Executions across all tools.
    pub fn total(&self) -> u32 {
        self.counts.values().sum()
    }
}

/// Why a merged tool call was not executed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Rejection {
    EmptyName,
    InvalidArguments,
    LimitReached { limit: u32 },
}

impl fmt::Display for Rejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Rejection::EmptyName => write!(f, "empty tool name"),
            Rejection::InvalidArguments => write!(f, "arguments are not a JSON object"),
            Rejection::LimitReached { limit } => {
                write!(f, "per-request limit of {} calls reached", limit)
            }
        }
    }
}

/// Fills in a missing id and type and trims the name.
pub fn normalize_call(index: u32, mut call: ToolCall) -> ToolCall {
    if call.id.is_empty() {
        call.id = synthesize_id(index);
    }
    if call.call_type.is_empty() {
        call.call_type = FUNCTION_TYPE.to_string();
    }
    let trimmed = call.name.trim();
    if trimmed.len() != call.name.len() {
        call.name = trimmed.to_string();
    }
    call
}

/// Checks name and argument shape. Empty arguments are allowed; anything else
/// must parse as a JSON object.
pub fn validate_call(call: &ToolCall) -> Result<(), Rejection> {
    if call.name.trim().is_empty() {
        return Err(Rejection::EmptyName);
    }
    if !call.arguments.is_empty() {
        match serde_json::from_str::<Value>(&call.arguments) {
            Ok(Value::Object(_)) => {}
            _ => return Err(Rejection::InvalidArguments),
        }
    }
    Ok(())
}

fn synthesize_id(index: u32) -> String {
    let millis = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or(0);
    format!("toolcall_{}_{}", index, millis)
}

/// Runs tool rounds against a shared registry.
#[derive(Debug, Clone)]
pub struct RoundExecutor {
    registry: Arc<ToolRegistry>,
}

impl RoundExecutor {
    pub fn new(registry: Arc<ToolRegistry>) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &Arc<ToolRegistry> {
        &self.registry
    }

    /// Executes the accepted calls of one round and records them in
    /// `conversation`.
    ///
    /// Returns the executed calls and their results. Empty round data means
    /// nothing was executable; the conversation is then unchanged.
    pub async fn execute(
        &self,
        conversation: &mut Conversation,
        assistant_text: &str,
        calls: ToolCallMerger,
        counters: &mut CallCounters,
    ) -> RoundData {
        let mut round = RoundData::default();

        for (index, call) in calls.into_calls() {
            let call = normalize_call(index, call);

            if let Err(reason) = self.admit(&call, counters) {
                log::debug!(
                    "skipping tool call #{} ({:?}, id {}): {}",
                    index,
                    call.name,
                    call.id,
                    reason
                );
                continue;
            }
            counters.increment(&call.name);

            log::debug!("executing tool {} (id {})", call.name, call.id);
            let content = self.registry.execute(&call.name, &call.arguments).await;

            round.tool_results.push(ToolResult {
                tool_call_id: call.id.clone(),
                name: call.name.clone(),
                content,
            });
            round.tool_calls.push(call);
        }

        if !round.is_empty() {
            conversation.push_assistant_tool_calls(assistant_text, &round.tool_calls);
            for result in &round.tool_results {
                conversation.push_tool_result(result);
            }
        }

        round
    }

    fn admit(&self, call: &ToolCall, counters: &CallCounters) -> Result<(), Rejection> {
        validate_call(call)?;
        let limit = self.registry.max_calls_per_turn(&call.name);
        if counters.get(&call.name) >= limit {
            return Err(Rejection::LimitReached { limit });
        }
        Ok(())
    }
}
