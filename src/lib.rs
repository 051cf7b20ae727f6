//! # tool-relay
//!
//! Streaming tool-call orchestration for OpenAI-compatible chat completion
//! servers such as:
//! - LM Studio
//! - Ollama
//! - llama.cpp
//! - vLLM
//!
//! ## Overview
//!
//! tool-relay sits between a client requesting a streamed chat completion and
//! the model server. It forwards the upstream SSE stream to the client line by
//! line as it arrives, reassembles tool calls from the fragments scattered
//! across the stream, executes them server-side, appends the results to the
//! conversation and keeps the stream going with follow-up requests until the
//! model answers without tools or the round cap is reached.
//!
//! The client sees one continuous, well-formed stream:
//!
//! ```text
//! data: {"choices":[{"delta":{"content":"Let me check."}}]}
//! data: {"choices":[{"delta":{"tool_calls":[{"index":0,"function":{"name":"get_weather"}}]}}]}
//! data: {"choices":[{"delta":{"tool_calls":[{"index":0,"function":{"arguments":"{\"city\":\"Linz\"}"}}]}}]}
//!                                            <- upstream [DONE] suppressed, tool executed
//! data: {"choices":[{"delta":{"content":"It is sunny"}}],"tool-calls":[...],"tool-results":[...]}
//! data: {"choices":[{"delta":{"content":" in Linz."}}]}
//! data: [DONE]
//! ```
//!
//! ## Key Features
//!
//! - **Real-time relay**: no batching, each upstream line is written as soon as it is read
//! - **Fragment merging**: index-keyed reassembly of modern `tool_calls` and legacy `function_call` deltas
//! - **Bounded rounds**: a hard cap on tool rounds plus per-tool call limits per request
//! - **Stream annotation**: executed tools and their results are injected into the follow-up stream
//! - **Clean termination**: every ending writes a proper `data: [DONE]`
//! - **Cancellation**: downstream disconnects and interrupts stop the lifecycle promptly
//!
//! ## Embedding the protocol
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use serde_json::json;
//! use tool_relay::{LifecycleRequest, RelayOptions, ToolCallProtocol, ToolRegistry, tool};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let registry = ToolRegistry::new().register(
//!         tool("get_weather", "Current weather for a city")
//!             .param("city", "string")
//!             .build(|args| async move {
//!                 let city = args["city"].as_str().unwrap_or("unknown");
//!                 Ok(json!({"city": city, "forecast": "sunny"}))
//!             }),
//!     );
//!
//!     let options = RelayOptions::builder()
//!         .base_url("http://localhost:1234/v1")
//!         .max_rounds(4)
//!         .build()?;
//!     let protocol = ToolCallProtocol::from_options(&options, Arc::new(registry))?;
//!
//!     let request = LifecycleRequest::from_body(json!({
//!         "model": "qwen2.5-7b-instruct",
//!         "messages": [{"role": "user", "content": "weather in Linz"}]
//!     }))?;
//!
//!     // Any Downstream works: a Vec<String>, an mpsc::Sender<String> or a LineWriter.
//!     let mut lines: Vec<String> = Vec::new();
//!     let outcome = protocol.proxy(request, &mut lines).await?;
//!
//!     for line in &lines {
//!         println!("{}", line);
//!     }
//!     println!("{:?} after {} tool rounds", outcome.termination, outcome.rounds);
//!     Ok(())
//! }
//! ```
//!
//! ## Serving over HTTP
//!
//! [`build_router`] wraps a [`ToolCallProtocol`] in an axum router exposing
//! `POST /v1/chat/completions` and `GET /health`; the `tool-relay` binary
//! serves it with configuration from the environment.
//!
//! ## Architecture
//!
//! - **delta**: per-chunk extraction of assistant text and tool-call fragments
//! - **merger**: index-keyed accumulation of fragments into tool calls
//! - **tools** / **registry**: tool collaborator contract and the shared registry
//! - **executor**: validation, limits and sequential execution of one round
//! - **relay**: line forwarding with suppression and one-shot injection
//! - **protocol**: the round state machine
//! - **upstream**: transport collaborator and its reqwest implementation
//! - **server**: axum HTTP front
//! - **config**, **error**, **types**, **utils**: supporting pieces

// ============================================================================
// MODULE DECLARATIONS
// ============================================================================

/// Relay options, provider shortcuts and environment loading.
mod config;

/// Delta parsing for streamed chunks, including legacy `function_call` normalization.
mod delta;

/// Error types and the crate-wide `Result<T>` alias.
mod error;

/// Round execution: validation, per-tool limits, conversation updates.
mod executor;

/// Index-keyed merging of tool-call fragments.
mod merger;

/// The multi-round lifecycle and request preparation.
mod protocol;

/// Shared read-only tool registry.
mod registry;

/// Line relay, downstream sinks and the one-shot injection token.
mod relay;

/// axum HTTP front.
mod server;

/// Tool collaborator trait and closure-backed tools.
mod tools;

/// Core data types: tool calls, fragments, results, rounds, conversation.
mod types;

/// Transport collaborator and the reqwest-backed implementation.
mod upstream;

/// SSE line helpers and byte-stream to line-stream decoding.
mod utils;

// ============================================================================
// PUBLIC EXPORTS
// ============================================================================

// --- Configuration ---

pub use config::{
    DEFAULT_LISTEN_ADDR, DEFAULT_TIMEOUT_SECS, MAX_TOOL_ROUNDS, Provider, RelayOptions,
    RelayOptionsBuilder, get_base_url,
};

// --- Error Handling ---

pub use error::{Error, Result};

// --- Stream Parsing ---

pub use delta::{Delta, normalize_function_call, parse_delta};
pub use merger::ToolCallMerger;
pub use utils::{
    DONE_LINE, LineStream, is_done_line, lines_from_bytes, lines_from_response, parse_data_line,
    split_data_line,
};

// --- Tool System ---

pub use registry::ToolRegistry;
pub use tools::{DEFAULT_MAX_CALLS_PER_TURN, Tool, ToolBuilder, ToolHandler, error_json, tool};

// --- Rounds and Relay ---

pub use executor::{CallCounters, Rejection, RoundExecutor, normalize_call, validate_call};
pub use relay::{
    Downstream, Injection, InjectionToken, LineWriter, RelayEnd, RelayReport, RoundCapture,
    StreamRelay,
};

// --- Lifecycle ---

pub use protocol::{
    Lifecycle, LifecycleOutcome, LifecycleRequest, Termination, ToolCallProtocol,
    prepare_tool_request_body,
};
pub use upstream::{HttpUpstream, Upstream, UpstreamResponse};

// --- HTTP Front ---

pub use server::{AppState, CHANNEL_CAPACITY, build_router};

// --- Core Types ---

pub use types::{Conversation, FUNCTION_TYPE, RoundData, ToolCall, ToolCallFragment, ToolResult};

// ============================================================================
// CONVENIENCE PRELUDE
// ============================================================================

/// Convenience module containing the most commonly used types and functions.
/// Import with `use tool_relay::prelude::*;`.
pub mod prelude {
    pub use crate::{
        Downstream, Error, LifecycleOutcome, LifecycleRequest, RelayOptions, Result, Termination,
        Tool, ToolCallProtocol, ToolHandler, ToolRegistry, Upstream, UpstreamResponse, tool,
    };
}
