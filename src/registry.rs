//! Shared name-to-handler table for executable tools.
//!
//! A [`ToolRegistry`] is assembled once at startup and then shared by every
//! in-flight request behind an `Arc`. It has no interior mutability: lookups
//! from concurrent requests never contend, and no request can alter another
//! request's view of the tools.

use crate::tools::{DEFAULT_MAX_CALLS_PER_TURN, ToolHandler, error_json};
use serde_json::{Map, Value};
use std::sync::Arc;

/// Read-only registry of tool handlers, kept in registration order.
#[derive(Clone, Default)]
pub struct ToolRegistry {
    handlers: Vec<Arc<dyn ToolHandler>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a handler. A handler registered under an existing name replaces
    /// the earlier one in place.
    pub fn register<H>(self, handler: H) -> Self
    where
        H: ToolHandler + 'static,
    {
        self.register_arc(Arc::new(handler))
    }

    /// Adds an already shared handler.
    pub fn register_arc(mut self, handler: Arc<dyn ToolHandler>) -> Self {
        match self
            .handlers
            .iter()
            .position(|h| h.name() == handler.name())
        {
            Some(pos) => self.handlers[pos] = handler,
            None => self.handlers.push(handler),
        }
        self
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    pub fn names(&self) -> Vec<&str> {
        self.handlers.iter().map(|h| h.name()).collect()
    }

    pub fn get(&self, name: &str) -> Option<&Arc<dyn ToolHandler>> {
        self.handlers.iter().find(|h| h.name() == name)
    }

    /// Function definitions for the upstream `tools` field.
    pub fn definitions(&self) -> Vec<Value> {
        self.handlers.iter().map(|h| h.definition()).collect()
    }

    /// Per-request execution cap for `name`. Unknown tools get the default cap
    /// so a hallucinated name cannot loop either.
    pub fn max_calls_per_turn(&self, name: &str) -> u32 {
        self.get(name)
            .map(|h| h.max_calls_per_turn())
            .unwrap_or(DEFAULT_MAX_CALLS_PER_TURN)
    }

    /// Executes `name` on raw argument text. An unknown tool yields an error
    /// result string instead of failing, so the model learns about it.
    pub async fn execute(&self, name: &str, arguments: &str) -> String {
        match self.get(name) {
            Some(handler) => handler.execute(arguments).await,
            None => error_json(format!("Unknown tool: {}", name)),
        }
    }

    /// Adds the registry's tool definitions to a request body.
    ///
    /// Definitions whose function name already appears in a caller-supplied
    /// `tools` array are not duplicated. `tool_choice` defaults to `"auto"`
    /// whenever the body ends up with a non-empty `tools` array.
    pub fn ensure_tools(&self, body: &mut Map<String, Value>) {
        if !self.is_empty() {
            let tools = body
                .entry("tools")
                .or_insert_with(|| Value::Array(Vec::new()));
            if !tools.is_array() {
                *tools = Value::Array(Vec::new());
            }
            if let Value::Array(list) = tools {
                for definition in self.definitions() {
                    let name = definition_name(&definition);
                    let present = name.is_some()
                        && list.iter().any(|existing| definition_name(existing) == name);
                    if !present {
                        list.push(definition);
                    }
                }
            }
        }

        let has_tools = body
            .get("tools")
            .and_then(Value::as_array)
            .is_some_and(|t| !t.is_empty());
        if has_tools && !body.contains_key("tool_choice") {
            body.insert("tool_choice".to_string(), Value::String("auto".to_string()));
        }
    }
}

impl std::fmt::Debug for ToolRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolRegistry")
            .field("tools", &self.names())
            .finish()
    }
}

fn definition_name(definition: &Value) -> Option<&str> {
    definition
        .get("function")
        .and_then(|f| f.get("name"))
        .and_then(Value::as_str)
}
