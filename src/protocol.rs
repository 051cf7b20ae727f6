//! # Tool-call lifecycle
//!
//! [`ToolCallProtocol`] drives one client request through a bounded sequence
//! of streamed rounds:
//!
//! ```text
//! INIT ──► STREAM_INITIAL ──► DONE
//!               │
//!               ▼
//!          EXEC_TOOLS ──► STREAM_FOLLOWUP ──► DONE
//!               ▲                │
//!               └────────────────┘   (at most max_rounds times)
//! ```
//!
//! - `INIT` ([`ToolCallProtocol::start`]) prepares the request and opens the
//!   first upstream stream. Its failures are returned to the caller before a
//!   single byte has been written downstream.
//! - `STREAM_*` relays the upstream lines and captures assistant text and tool
//!   calls ([`StreamRelay`]). A phase that never saw a tool-call shape ends the
//!   lifecycle; its own `[DONE]` has already been forwarded.
//! - `EXEC_TOOLS` runs the captured calls ([`RoundExecutor`]) and opens the
//!   follow-up stream over the extended conversation.
//!
//! Every path that ends after a suppressed `[DONE]` (round cap, nothing
//! executable, follow-up failure, broken stream) writes a clean
//! `data: [DONE]` itself, so the downstream never sees a truncated stream.
//! The only exception is cancellation: once the downstream is gone there is
//! nothing left to terminate.
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use serde_json::json;
//! use tool_relay::{LifecycleRequest, RelayOptions, ToolCallProtocol, ToolRegistry, tool};
//!
//! # async fn example() -> tool_relay::Result<()> {
//! let registry = ToolRegistry::new().register(
//!     tool("clock", "Current time").build(|_| async { Ok(json!("12:00")) }),
//! );
//! let protocol = ToolCallProtocol::from_options(&RelayOptions::from_env()?, Arc::new(registry))?;
//!
//! let request = LifecycleRequest::from_body(json!({
//!     "model": "qwen2.5-7b-instruct",
//!     "messages": [{"role": "user", "content": "What time is it?"}]
//! }))?;
//!
//! let mut lines: Vec<String> = Vec::new();
//! let outcome = protocol.proxy(request, &mut lines).await?;
//! println!("{:?} after {} tool rounds", outcome.termination, outcome.rounds);
//! # Ok(())
//! # }
//! ```

use crate::config::{MAX_TOOL_ROUNDS, RelayOptions};
use crate::executor::{CallCounters, RoundExecutor};
use crate::registry::ToolRegistry;
use crate::relay::{Downstream, InjectionToken, RelayEnd, RoundCapture, StreamRelay};
use crate::types::Conversation;
use crate::upstream::{HttpUpstream, Upstream};
use crate::utils::{DONE_LINE, LineStream};
use crate::{Error, Result};
use serde_json::{Map, Value};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// Builds the request template used for every round.
///
/// Clones the caller's body (a non-object body becomes `{}`), forces
/// `stream = true` and adds the registry's tools. The caller's other fields
/// (model, temperature, ...) are left alone.
pub fn prepare_tool_request_body(body: &Value, registry: &ToolRegistry) -> Map<String, Value> {
    let mut prepared = body.as_object().cloned().unwrap_or_default();
    prepared.insert("stream".to_string(), Value::Bool(true));
    registry.ensure_tools(&mut prepared);
    prepared
}

fn request_body(template: &Map<String, Value>, conversation: &Conversation) -> Value {
    let mut body = template.clone();
    body.insert("messages".to_string(), conversation.to_json());
    Value::Object(body)
}

/// One client request to run through the lifecycle.
#[derive(Debug, Clone, Default)]
pub struct LifecycleRequest {
    /// The client's chat-completion request body, used as the template for
    /// every round.
    pub body: Value,

    /// Initial conversation.
    pub messages: Vec<Value>,

    /// Fields injected once into the first JSON data line of the lifecycle.
    pub metadata: Option<Map<String, Value>>,
}

impl LifecycleRequest {
    pub fn new(body: Value, messages: Vec<Value>) -> Self {
        Self {
            body,
            messages,
            metadata: None,
        }
    }

    /// Takes the initial conversation from the body's `messages` array.
    pub fn from_body(body: Value) -> Result<Self> {
        let messages = body
            .get("messages")
            .and_then(Value::as_array)
            .cloned()
            .ok_or_else(|| Error::invalid_input("request body must contain a messages array"))?;
        Ok(Self::new(body, messages))
    }

    pub fn with_metadata(mut self, metadata: Map<String, Value>) -> Self {
        self.metadata = Some(metadata);
        self
    }
}

/// Why a lifecycle ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    /// A phase finished without requesting tools.
    Completed,
    /// Tool calls were requested but none could be executed.
    NoExecutableCalls,
    /// The configured number of tool rounds was used up.
    RoundCap,
    /// A follow-up request failed or an upstream stream broke off.
    UpstreamFailure,
    /// The downstream disconnected or the lifecycle was interrupted.
    Cancelled,
}

impl Termination {
    pub fn as_str(&self) -> &'static str {
        match self {
            Termination::Completed => "completed",
            Termination::NoExecutableCalls => "no executable tool calls",
            Termination::RoundCap => "round cap reached",
            Termination::UpstreamFailure => "upstream failure",
            Termination::Cancelled => "cancelled",
        }
    }
}

/// Final state of a lifecycle.
#[derive(Debug, Clone)]
pub struct LifecycleOutcome {
    /// HTTP status of the initial upstream request.
    pub status: u16,
    /// Number of executed tool rounds.
    pub rounds: u32,
    pub termination: Termination,
    /// The initial messages followed by everything the lifecycle appended.
    pub conversation: Conversation,
}

/// Shared entry point: upstream transport, tool registry and round cap.
///
/// Cheap to clone; one instance serves all concurrent requests.
#[derive(Clone)]
pub struct ToolCallProtocol {
    upstream: Arc<dyn Upstream>,
    executor: RoundExecutor,
    max_rounds: u32,
}

impl ToolCallProtocol {
    pub fn new(upstream: Arc<dyn Upstream>, registry: Arc<ToolRegistry>) -> Self {
        Self {
            upstream,
            executor: RoundExecutor::new(registry),
            max_rounds: MAX_TOOL_ROUNDS,
        }
    }

    /// Protocol over an [`HttpUpstream`] configured from `options`.
    pub fn from_options(options: &RelayOptions, registry: Arc<ToolRegistry>) -> Result<Self> {
        let upstream = HttpUpstream::new(options)?;
        Ok(Self::new(Arc::new(upstream), registry).with_max_rounds(options.max_rounds()))
    }

    pub fn with_max_rounds(mut self, max_rounds: u32) -> Self {
        self.max_rounds = max_rounds;
        self
    }

    pub fn max_rounds(&self) -> u32 {
        self.max_rounds
    }

    pub fn registry(&self) -> &Arc<ToolRegistry> {
        self.executor.registry()
    }

    /// `INIT`: sends the initial request.
    ///
    /// A transport failure or a non-success status is returned as an error;
    /// nothing has been written downstream at that point.
    pub async fn start(&self, request: LifecycleRequest) -> Result<Lifecycle> {
        let template = prepare_tool_request_body(&request.body, self.registry());
        let conversation = Conversation::new(request.messages);

        let response = self
            .upstream
            .open(&request_body(&template, &conversation))
            .await?;
        if !response.is_success() {
            return Err(Error::upstream_status(response.status(), String::new()));
        }

        log::info!(
            "tool lifecycle started ({} messages, {} tools, max {} rounds)",
            conversation.len(),
            self.registry().len(),
            self.max_rounds
        );

        Ok(Lifecycle {
            protocol: self.clone(),
            status: response.status(),
            template,
            conversation,
            counters: CallCounters::new(),
            rounds: 0,
            interrupted: Arc::new(AtomicBool::new(false)),
            phase: Phase::Stream {
                lines: response.into_lines(),
                token: request.metadata.and_then(InjectionToken::new),
            },
        })
    }

    /// `start` followed by `run`.
    pub async fn proxy<D>(&self, request: LifecycleRequest, downstream: &mut D) -> Result<LifecycleOutcome>
    where
        D: Downstream + ?Sized,
    {
        let lifecycle = self.start(request).await?;
        Ok(lifecycle.run(downstream).await)
    }
}

impl std::fmt::Debug for ToolCallProtocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolCallProtocol")
            .field("registry", self.registry())
            .field("max_rounds", &self.max_rounds)
            .finish_non_exhaustive()
    }
}

enum Phase {
    Stream {
        lines: LineStream,
        token: Option<InjectionToken>,
    },
    ExecTools {
        capture: RoundCapture,
    },
    Done(Termination),
}

/// A started lifecycle, ready to stream.
///
/// Owns all request-scoped state: the growing conversation, the per-tool call
/// counters and the open upstream stream.
pub struct Lifecycle {
    protocol: ToolCallProtocol,
    status: u16,
    template: Map<String, Value>,
    conversation: Conversation,
    counters: CallCounters,
    rounds: u32,
    interrupted: Arc<AtomicBool>,
    phase: Phase,
}

impl Lifecycle {
    /// HTTP status of the initial upstream request.
    pub fn status(&self) -> u16 {
        self.status
    }

    /// Flag that cancels the lifecycle when set. Checked before every line and
    /// before every follow-up request.
    pub fn interrupt_handle(&self) -> Arc<AtomicBool> {
        self.interrupted.clone()
    }

    pub fn conversation(&self) -> &Conversation {
        &self.conversation
    }

    /// Streams every round to `downstream` until the lifecycle ends.
    pub async fn run<D>(mut self, downstream: &mut D) -> LifecycleOutcome
    where
        D: Downstream + ?Sized,
    {
        let mut phase = std::mem::replace(&mut self.phase, Phase::Done(Termination::Completed));

        let termination = loop {
            phase = match phase {
                Phase::Stream { lines, token } => self.stream(lines, token, downstream).await,
                Phase::ExecTools { capture } => self.exec_tools(capture, downstream).await,
                Phase::Done(termination) => break termination,
            };
        };

        log::info!(
            "tool lifecycle ended: {} after {} rounds",
            termination.as_str(),
            self.rounds
        );

        LifecycleOutcome {
            status: self.status,
            rounds: self.rounds,
            termination,
            conversation: self.conversation,
        }
    }

    /// `STREAM_INITIAL` / `STREAM_FOLLOWUP`.
    async fn stream<D>(
        &mut self,
        lines: LineStream,
        token: Option<InjectionToken>,
        downstream: &mut D,
    ) -> Phase
    where
        D: Downstream + ?Sized,
    {
        let report = StreamRelay::new(token)
            .relay(lines, downstream, &self.interrupted)
            .await;

        match report.end {
            RelayEnd::Cancelled(cause) => cancel(cause),
            RelayEnd::UpstreamError(e) => {
                log::warn!("upstream stream failed: {}", e);
                if report.capture.forwarded_done {
                    Phase::Done(Termination::UpstreamFailure)
                } else {
                    Phase::Done(finish(downstream, Termination::UpstreamFailure).await)
                }
            }
            RelayEnd::Finished if report.capture.saw_tool_calls => Phase::ExecTools {
                capture: report.capture,
            },
            RelayEnd::Finished => Phase::Done(Termination::Completed),
        }
    }

    /// `EXEC_TOOLS`: executes the captured calls and opens the follow-up stream.
    async fn exec_tools<D>(&mut self, capture: RoundCapture, downstream: &mut D) -> Phase
    where
        D: Downstream + ?Sized,
    {
        if self.rounds >= self.protocol.max_rounds {
            log::info!("tool round cap of {} reached", self.protocol.max_rounds);
            return Phase::Done(finish(downstream, Termination::RoundCap).await);
        }
        if let Some(cause) = self.cancellation(downstream) {
            return cancel(cause);
        }

        let round = self
            .protocol
            .executor
            .execute(
                &mut self.conversation,
                &capture.assistant_text,
                capture.tool_calls,
                &mut self.counters,
            )
            .await;
        if round.is_empty() {
            return Phase::Done(finish(downstream, Termination::NoExecutableCalls).await);
        }
        self.rounds += 1;

        if let Some(cause) = self.cancellation(downstream) {
            return cancel(cause);
        }

        let body = request_body(&self.template, &self.conversation);
        let opened = tokio::select! {
            biased;
            _ = downstream.closed() => return cancel(Error::Disconnected),
            opened = self.protocol.upstream.open(&body) => opened,
        };
        let response = match opened {
            Ok(response) if response.is_success() => response,
            Ok(response) => {
                log::warn!("follow-up request answered {}", response.status());
                return Phase::Done(finish(downstream, Termination::UpstreamFailure).await);
            }
            Err(e) => {
                log::warn!("follow-up request failed: {}", e);
                return Phase::Done(finish(downstream, Termination::UpstreamFailure).await);
            }
        };

        Phase::Stream {
            lines: response.into_lines(),
            token: InjectionToken::for_round(&round),
        }
    }

    fn cancellation<D>(&self, downstream: &D) -> Option<Error>
    where
        D: Downstream + ?Sized,
    {
        if self.interrupted.load(Ordering::SeqCst) {
            Some(Error::Interrupted)
        } else if downstream.is_closed() {
            Some(Error::Disconnected)
        } else {
            None
        }
    }
}

impl std::fmt::Debug for Lifecycle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Lifecycle")
            .field("status", &self.status)
            .field("rounds", &self.rounds)
            .field("messages", &self.conversation.len())
            .finish_non_exhaustive()
    }
}

fn cancel(cause: Error) -> Phase {
    if cause.is_cancellation() {
        log::debug!("lifecycle cancelled: {}", cause);
    } else {
        log::warn!("downstream write failed: {}", cause);
    }
    Phase::Done(Termination::Cancelled)
}

/// Writes the closing `data: [DONE]`. A failed write turns the ending into a
/// cancellation.
async fn finish<D>(downstream: &mut D, termination: Termination) -> Termination
where
    D: Downstream + ?Sized,
{
    match downstream.send_line(DONE_LINE.to_string()).await {
        Ok(()) => termination,
        Err(e) if e.is_cancellation() => {
            log::debug!("downstream gone before the final termination line");
            Termination::Cancelled
        }
        Err(e) => {
            log::warn!("could not write final termination line: {}", e);
            Termination::Cancelled
        }
    }
}
