//! # Tool collaborators
//!
//! The relay executes tools through the [`ToolHandler`] trait and never looks
//! further inside a tool than that contract:
//!
//! ```text
//! definition()          -> JSON function definition sent upstream in `tools`
//! execute(arguments)    -> result string fed back to the model
//! max_calls_per_turn()  -> cap on executions per client request
//! ```
//!
//! `execute` receives the raw argument text exactly as the model streamed it
//! and always produces a string. Failures inside a tool are reported as an
//! error-shaped JSON string (see [`error_json`]) rather than an `Err`, so the
//! model sees what went wrong and the conversation can continue.
//!
//! ## Closure-backed tools
//!
//! Most tools do not need a dedicated type. [`tool`] builds a [`Tool`] from a
//! name, a description, a parameter schema and an async closure:
//!
//! ```rust,no_run
//! use tool_relay::tool;
//! use serde_json::json;
//!
//! let weather = tool("get_weather", "Get current weather for a city")
//!     .param("city", "string")
//!     .max_calls_per_turn(3)
//!     .build(|args| async move {
//!         let city = args["city"].as_str().unwrap_or("Unknown");
//!         Ok(json!({"city": city, "temperature": 21}))
//!     });
//! ```
//!
//! ## Schema formats
//!
//! Parameter schemas may be given as simple type notation
//! (`{"city": "string"}`), as per-property schemas with `optional`/`required`
//! flags, or as a complete JSON Schema. All are normalized to the JSON Schema
//! object OpenAI-compatible servers expect.

use crate::Result;
use async_trait::async_trait;
use serde_json::{Map, Value, json};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

/// Per-request execution cap applied when a tool does not choose its own.
pub const DEFAULT_MAX_CALLS_PER_TURN: u32 = 1;

/// Builds the error-shaped result string tools return on failure.
///
/// ```rust
/// assert_eq!(tool_relay::error_json("Missing city"), r#"{"error":"Missing city"}"#);
/// ```
pub fn error_json(message: impl Into<String>) -> String {
    json!({ "error": message.into() }).to_string()
}

/// Contract between the relay and an executable tool.
///
/// Implementations are shared by every in-flight request and must therefore be
/// `Send + Sync`; `execute` must not rely on per-request mutable state.
#[async_trait]
pub trait ToolHandler: Send + Sync {
    /// Function name the model uses to call this tool.
    fn name(&self) -> &str;

    /// OpenAI function definition: `{"type":"function","function":{...}}`.
    fn definition(&self) -> Value;

    /// Runs the tool on raw argument text and returns the result string.
    async fn execute(&self, arguments: &str) -> String;

    /// Maximum number of executions within one client request.
    fn max_calls_per_turn(&self) -> u32 {
        DEFAULT_MAX_CALLS_PER_TURN
    }
}

/// Async closure type behind a [`Tool`].
///
/// `Arc` so the tool can be cloned and shared across request tasks, boxed and
/// pinned so closures with different future types fit in one field.
pub type ToolFn =
    Arc<dyn Fn(Value) -> Pin<Box<dyn Future<Output = Result<Value>> + Send>> + Send + Sync>;

/// A tool backed by an async closure over parsed JSON arguments.
///
/// Cloning is cheap: the closure is shared behind an `Arc`.
#[derive(Clone)]
pub struct Tool {
    name: String,
    description: String,
    input_schema: Value,
    max_calls_per_turn: u32,
    handler: ToolFn,
}

impl Tool {
    /// Creates a tool. `input_schema` may be in any of the supported schema
    /// formats and is normalized here.
    pub fn new<F, Fut>(
        name: impl Into<String>,
        description: impl Into<String>,
        input_schema: Value,
        handler: F,
    ) -> Self
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value>> + Send + 'static,
    {
        Self {
            name: name.into(),
            description: description.into(),
            input_schema: convert_schema_to_openai(input_schema),
            max_calls_per_turn: DEFAULT_MAX_CALLS_PER_TURN,
            handler: Arc::new(move |args| Box::pin(handler(args))),
        }
    }

    /// Overrides the per-request execution cap.
    pub fn with_max_calls_per_turn(mut self, max: u32) -> Self {
        self.max_calls_per_turn = max;
        self
    }

    /// Calls the closure with already-parsed arguments.
    pub async fn call(&self, arguments: Value) -> Result<Value> {
        (self.handler)(arguments).await
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn input_schema(&self) -> &Value {
        &self.input_schema
    }
}

#[async_trait]
impl ToolHandler for Tool {
    fn name(&self) -> &str {
        &self.name
    }

    fn definition(&self) -> Value {
        json!({
            "type": "function",
            "function": {
                "name": self.name,
                "description": self.description,
                "parameters": self.input_schema
            }
        })
    }

    async fn execute(&self, arguments: &str) -> String {
        let args = if arguments.trim().is_empty() {
            Value::Object(Map::new())
        } else {
            match serde_json::from_str::<Value>(arguments) {
                Ok(v) => v,
                Err(_) => return error_json("Invalid arguments JSON"),
            }
        };

        match self.call(args).await {
            Ok(Value::String(text)) => text,
            Ok(other) => other.to_string(),
            Err(e) => error_json(e.to_string()),
        }
    }

    fn max_calls_per_turn(&self) -> u32 {
        self.max_calls_per_turn
    }
}

/// The handler is omitted: closures have no useful debug representation.
impl std::fmt::Debug for Tool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tool")
            .field("name", &self.name)
            .field("description", &self.description)
            .field("input_schema", &self.input_schema)
            .field("max_calls_per_turn", &self.max_calls_per_turn)
            .finish()
    }
}

/// Normalizes the supported schema notations into a JSON Schema object.
///
/// A parameter is required unless it is marked `"optional": true` or
/// `"required": false`, or carries a `"default"`; an explicit
/// `"required": true` always wins. The per-property `optional`/`required`
/// flags are stripped since they are not JSON Schema.
fn convert_schema_to_openai(schema: Value) -> Value {
    let Some(obj) = schema.as_object() else {
        return json!({
            "type": "object",
            "properties": {},
            "required": []
        });
    };

    if obj.contains_key("type") && obj.contains_key("properties") {
        return schema;
    }

    let mut properties = Map::new();
    let mut required = Vec::new();

    for (param_name, param_type) in obj {
        if let Some(type_str) = param_type.as_str() {
            properties.insert(param_name.clone(), type_to_json_schema(type_str));
            required.push(param_name.clone());
        } else if let Some(prop_obj) = param_type.as_object() {
            let mut prop = prop_obj.clone();

            let is_optional = prop
                .remove("optional")
                .and_then(|v| v.as_bool())
                .unwrap_or(false);
            let is_required = prop.remove("required").and_then(|v| v.as_bool());
            let has_default = prop.contains_key("default");

            properties.insert(param_name.clone(), Value::Object(prop));

            match is_required {
                Some(true) => required.push(param_name.clone()),
                Some(false) => {}
                None if is_optional || has_default => {}
                None => required.push(param_name.clone()),
            }
        }
    }

    json!({
        "type": "object",
        "properties": properties,
        "required": required
    })
}

/// Maps a simple type name to a JSON Schema type object. Unknown names map to
/// `string`.
fn type_to_json_schema(type_str: &str) -> Value {
    let json_type = match type_str {
        "string" | "str" => "string",
        "integer" | "int" | "i32" | "i64" | "u32" | "u64" => "integer",
        "number" | "float" | "f32" | "f64" => "number",
        "boolean" | "bool" => "boolean",
        "array" | "list" | "vec" => "array",
        "object" | "dict" | "map" => "object",
        _ => "string",
    };
    json!({ "type": json_type })
}

/// Fluent builder for [`Tool`], usually started with [`tool`].
pub struct ToolBuilder {
    name: String,
    description: String,
    schema: Value,
    max_calls_per_turn: u32,
}

impl ToolBuilder {
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            schema: json!({}),
            max_calls_per_turn: DEFAULT_MAX_CALLS_PER_TURN,
        }
    }

    /// Replaces the schema wholesale (any supported notation).
    pub fn schema(mut self, schema: Value) -> Self {
        self.schema = schema;
        self
    }

    /// Adds one required parameter in simple type notation. A non-object schema
    /// set earlier is discarded.
    pub fn param(mut self, name: &str, type_str: &str) -> Self {
        match self.schema.as_object_mut() {
            Some(obj) => {
                obj.insert(name.to_string(), Value::String(type_str.to_string()));
            }
            None => {
                self.schema = json!({ name: type_str });
            }
        }
        self
    }

    pub fn max_calls_per_turn(mut self, max: u32) -> Self {
        self.max_calls_per_turn = max;
        self
    }

    pub fn build<F, Fut>(self, handler: F) -> Tool
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value>> + Send + 'static,
    {
        Tool::new(self.name, self.description, self.schema, handler)
            .with_max_calls_per_turn(self.max_calls_per_turn)
    }
}

/// Starts building a closure-backed tool.
pub fn tool(name: impl Into<String>, description: impl Into<String>) -> ToolBuilder {
    ToolBuilder::new(name, description)
}
