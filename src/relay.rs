//! Line-by-line relay of one upstream stream to the downstream consumer.
//!
//! Every upstream line is written downstream as soon as it has been read,
//! with two exceptions:
//!
//! - **Suppression.** A termination line (`data: [DONE]`) is swallowed once the
//!   current phase has seen a tool-call shape, because another round follows
//!   and the client must not see the stream end early.
//! - **Injection.** An [`InjectionToken`] adds extra top-level fields to the
//!   first usable JSON data line. The token is consumed by the line it lands
//!   on, so a relay can inject at most once.
//!
//! While forwarding, each data line is run through the delta parser and the
//! tool-call merger; the result is the phase's [`RoundCapture`].

use crate::delta::parse_delta;
use crate::merger::ToolCallMerger;
use crate::types::RoundData;
use crate::utils::{LineStream, is_done_line, parse_data_line, split_data_line};
use crate::{Error, Result};
use async_trait::async_trait;
use futures::StreamExt;
use serde_json::{Map, Value};
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;

/// Consumer of relayed lines.
///
/// Lines are handed over without a terminator. A failed send means the
/// consumer is gone; the lifecycle stops at that point.
#[async_trait]
pub trait Downstream: Send {
    async fn send_line(&mut self, line: String) -> Result<()>;

    /// True when the consumer is known to be gone without having to write.
    fn is_closed(&self) -> bool {
        false
    }

    /// Resolves once the consumer has gone away. Raced against upstream reads
    /// so a hang-up is noticed while the upstream is silent. Sinks that cannot
    /// observe this never resolve.
    async fn closed(&mut self) {
        std::future::pending::<()>().await
    }
}

#[async_trait]
impl Downstream for mpsc::Sender<String> {
    async fn send_line(&mut self, line: String) -> Result<()> {
        self.send(line).await.map_err(|_| Error::Disconnected)
    }

    fn is_closed(&self) -> bool {
        mpsc::Sender::is_closed(self)
    }

    async fn closed(&mut self) {
        mpsc::Sender::closed(self).await
    }
}

/// Collects lines in memory.
#[async_trait]
impl Downstream for Vec<String> {
    async fn send_line(&mut self, line: String) -> Result<()> {
        self.push(line);
        Ok(())
    }
}

/// Writes newline-terminated lines to an `AsyncWrite`, flushing after each.
#[derive(Debug)]
pub struct LineWriter<W> {
    inner: W,
}

impl<W> LineWriter<W> {
    pub fn new(inner: W) -> Self {
        Self { inner }
    }

    pub fn into_inner(self) -> W {
        self.inner
    }
}

#[async_trait]
impl<W> Downstream for LineWriter<W>
where
    W: AsyncWrite + Unpin + Send,
{
    async fn send_line(&mut self, line: String) -> Result<()> {
        self.inner.write_all(line.as_bytes()).await?;
        self.inner.write_all(b"\n").await?;
        self.inner.flush().await?;
        Ok(())
    }
}

/// One-shot permission to add fields to a single data line.
///
/// Deliberately not `Clone`: applying the token consumes it, and a declined
/// attempt hands it back through [`Injection::Declined`].
#[derive(Debug, PartialEq)]
pub struct InjectionToken {
    fields: Map<String, Value>,
}

/// Result of offering a line to an [`InjectionToken`].
#[derive(Debug, PartialEq)]
pub enum Injection {
    /// The line was a JSON data line; here it is with the fields added.
    Applied(String),
    /// The line was not usable. The token is returned untouched.
    Declined(InjectionToken),
}

impl InjectionToken {
    /// `None` when there is nothing to inject.
    pub fn new(fields: Map<String, Value>) -> Option<Self> {
        if fields.is_empty() {
            None
        } else {
            Some(Self { fields })
        }
    }

    /// Token carrying a round's `tool-calls` and `tool-results`; `None` for an
    /// empty round.
    pub fn for_round(round: &RoundData) -> Option<Self> {
        if round.is_empty() {
            None
        } else {
            Self::new(round.metadata())
        }
    }

    pub fn fields(&self) -> &Map<String, Value> {
        &self.fields
    }

    /// Offers `line` to the token. Non-data lines and data lines without a
    /// JSON object payload are declined.
    pub fn inject(self, line: &str) -> Injection {
        match parse_data_line(line) {
            Some(chunk) => Injection::Applied(self.apply(line, chunk)),
            None => Injection::Declined(self),
        }
    }

    /// Adds every field the chunk does not already carry and re-serializes the
    /// line behind its original prefix.
    fn apply(self, line: &str, chunk: Value) -> String {
        let Value::Object(mut object) = chunk else {
            return line.to_string();
        };
        for (key, value) in self.fields {
            if !object.contains_key(&key) {
                object.insert(key, value);
            }
        }
        let prefix = split_data_line(line).map(|(p, _)| p).unwrap_or("data: ");
        format!("{}{}", prefix, Value::Object(object))
    }
}

/// What one relayed phase observed.
#[derive(Debug, Default)]
pub struct RoundCapture {
    /// Assistant text tokens of this phase, concatenated.
    pub assistant_text: String,

    /// Tool calls merged from this phase's fragments.
    pub tool_calls: ToolCallMerger,

    /// True once any chunk carried a tool-call shape.
    pub saw_tool_calls: bool,

    /// True when a termination line was forwarded downstream.
    pub forwarded_done: bool,
}

/// How a relayed phase ended.
#[derive(Debug)]
pub enum RelayEnd {
    /// The upstream stream ended normally.
    Finished,
    /// Reading from upstream failed mid-stream.
    UpstreamError(Error),
    /// The downstream went away or the lifecycle was interrupted. Carries the
    /// cause: [`Error::Disconnected`], [`Error::Interrupted`] or the failed
    /// write's error.
    Cancelled(Error),
}

#[derive(Debug)]
pub struct RelayReport {
    pub capture: RoundCapture,
    pub end: RelayEnd,
    pub lines_forwarded: usize,
}

/// Relay state for one upstream stream.
#[derive(Debug, Default)]
pub struct StreamRelay {
    token: Option<InjectionToken>,
    capture: RoundCapture,
}

impl StreamRelay {
    pub fn new(token: Option<InjectionToken>) -> Self {
        Self {
            token,
            capture: RoundCapture::default(),
        }
    }

    /// True while the injection token has not been used yet.
    pub fn injection_pending(&self) -> bool {
        self.token.is_some()
    }

    pub fn capture(&self) -> &RoundCapture {
        &self.capture
    }

    pub fn into_capture(self) -> RoundCapture {
        self.capture
    }

    /// Handles one upstream line and returns the line to forward, or `None`
    /// when the line is suppressed.
    pub fn process_line(&mut self, line: String) -> Option<String> {
        let chunk = parse_data_line(&line);

        let line = match self.token.take() {
            Some(token) => match token.inject(&line) {
                Injection::Applied(injected) => injected,
                Injection::Declined(token) => {
                    self.token = Some(token);
                    line
                }
            },
            None => line,
        };

        if let Some(chunk) = &chunk {
            let delta = parse_delta(chunk);
            if let Some(text) = delta.text {
                self.capture.assistant_text.push_str(&text);
            }
            if delta.saw_tool_calls {
                self.capture.saw_tool_calls = true;
            }
            self.capture.tool_calls.merge_all(delta.fragments);
        }

        if is_done_line(&line) {
            if self.capture.saw_tool_calls {
                log::trace!("suppressing termination line, a tool round follows");
                return None;
            }
            self.capture.forwarded_done = true;
        }

        Some(line)
    }

    /// Forwards `lines` to `downstream` until the upstream ends, fails, or the
    /// lifecycle is cancelled. A downstream hang-up is noticed even while
    /// waiting for the next upstream line. The upstream stream is dropped (and
    /// its connection closed) before this returns.
    pub async fn relay<D>(
        mut self,
        mut lines: LineStream,
        downstream: &mut D,
        interrupted: &AtomicBool,
    ) -> RelayReport
    where
        D: Downstream + ?Sized,
    {
        let mut lines_forwarded = 0;

        let end = loop {
            if interrupted.load(Ordering::SeqCst) {
                break RelayEnd::Cancelled(Error::Interrupted);
            }

            let next = tokio::select! {
                biased;
                _ = downstream.closed() => break RelayEnd::Cancelled(Error::Disconnected),
                next = lines.next() => next,
            };

            let line = match next {
                None => break RelayEnd::Finished,
                Some(Err(e)) => break RelayEnd::UpstreamError(e),
                Some(Ok(line)) => line,
            };

            if let Some(out) = self.process_line(line) {
                if let Err(e) = downstream.send_line(out).await {
                    break RelayEnd::Cancelled(e);
                }
                lines_forwarded += 1;
            }
        };

        drop(lines);

        RelayReport {
            capture: self.capture,
            end,
            lines_forwarded,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ToolCall, ToolResult};
    use serde_json::json;
    use std::time::Duration;

    fn data(value: Value) -> String {
        format!("data: {}", value)
    }

    fn text_chunk(text: &str) -> String {
        data(json!({"choices": [{"index": 0, "delta": {"content": text}}]}))
    }

    fn tool_chunk(index: i64, name: Option<&str>, args: &str) -> String {
        let mut function = json!({"arguments": args});
        if let Some(name) = name {
            function["name"] = json!(name);
        }
        data(json!({"choices": [{"index": 0, "delta": {
            "tool_calls": [{"index": index, "function": function}]
        }}]}))
    }

    fn token(fields: Value) -> InjectionToken {
        match fields {
            Value::Object(map) => InjectionToken::new(map).unwrap(),
            _ => panic!("fields must be an object"),
        }
    }

    fn line_stream(lines: Vec<String>) -> LineStream {
        Box::pin(futures::stream::iter(lines.into_iter().map(Ok)))
    }

    #[test]
    fn test_empty_token_is_none() {
        assert!(InjectionToken::new(Map::new()).is_none());
        assert!(InjectionToken::for_round(&RoundData::default()).is_none());
    }

    #[test]
    fn test_injection_preserves_existing_fields() {
        let line = r#"data: {"id":"c1","custom":"keep","tool-results":"upstream"}"#;
        let result = token(json!({"tool-results": ["ours"], "tool-calls": []})).inject(line);

        let Injection::Applied(out) = result else {
            panic!("expected injection");
        };
        let (prefix, payload) = split_data_line(&out).unwrap();
        assert_eq!(prefix, "data: ");
        let value: Value = serde_json::from_str(payload).unwrap();
        assert_eq!(value["custom"], "keep");
        assert_eq!(value["tool-results"], "upstream");
        assert_eq!(value["tool-calls"], json!([]));
        let keys: Vec<&str> = value.as_object().unwrap().keys().map(String::as_str).collect();
        assert_eq!(keys, vec!["id", "custom", "tool-results", "tool-calls"]);
    }

    #[test]
    fn test_injection_declines_unusable_lines() {
        for line in ["", ": ping", "data: [DONE]", "data: {broken", "event: message"] {
            let t = token(json!({"k": 1}));
            assert_eq!(t.inject(line), Injection::Declined(token(json!({"k": 1}))));
        }
    }

    #[test]
    fn test_injection_keeps_compact_prefix() {
        let Injection::Applied(out) = token(json!({"k": 1})).inject(r#"data:{"a":0}"#) else {
            panic!("expected injection");
        };
        assert_eq!(out, r#"data:{"a":0,"k":1}"#);
    }

    #[test]
    fn test_token_lands_on_first_usable_line_only() {
        let mut relay = StreamRelay::new(Some(token(json!({"meta": true}))));

        assert_eq!(relay.process_line(String::new()), Some(String::new()));
        assert_eq!(
            relay.process_line("data: {oops".to_string()),
            Some("data: {oops".to_string())
        );
        assert!(relay.injection_pending());

        let first = relay.process_line(r#"data: {"n":1}"#.to_string()).unwrap();
        assert_eq!(first, r#"data: {"n":1,"meta":true}"#);
        assert!(!relay.injection_pending());

        let second = relay.process_line(r#"data: {"n":2}"#.to_string()).unwrap();
        assert_eq!(second, r#"data: {"n":2}"#);
    }

    #[test]
    fn test_round_token_fields() {
        let round = RoundData {
            tool_calls: vec![ToolCall::new("call_1", "clock", "")],
            tool_results: vec![ToolResult {
                tool_call_id: "call_1".to_string(),
                name: "clock".to_string(),
                content: "12:00".to_string(),
            }],
        };
        let token = InjectionToken::for_round(&round).unwrap();
        assert!(token.fields().contains_key("tool-calls"));
        assert!(token.fields().contains_key("tool-results"));
    }

    #[test]
    fn test_done_forwarded_without_tool_calls() {
        let mut relay = StreamRelay::new(None);
        relay.process_line(text_chunk("Hi"));
        assert_eq!(relay.process_line("data: [DONE]".to_string()).as_deref(), Some("data: [DONE]"));
        assert!(relay.capture().forwarded_done);
        assert_eq!(relay.capture().assistant_text, "Hi");
    }

    #[test]
    fn test_done_suppressed_after_tool_call() {
        let lines = vec![
            text_chunk("Let me "),
            text_chunk("check."),
            tool_chunk(0, Some("get_weather"), "{\"city\":"),
            tool_chunk(0, None, "\"Linz\"}"),
            "data: [DONE]".to_string(),
        ];

        let mut relay = StreamRelay::new(None);
        let forwarded: Vec<String> = lines
            .iter()
            .cloned()
            .filter_map(|l| relay.process_line(l))
            .collect();

        assert_eq!(forwarded, lines[..4].to_vec());
        let capture = relay.into_capture();
        assert!(capture.saw_tool_calls);
        assert!(!capture.forwarded_done);
        assert_eq!(capture.assistant_text, "Let me check.");
        let call = capture.tool_calls.get(0).unwrap();
        assert_eq!(call.name, "get_weather");
        assert_eq!(call.arguments, r#"{"city":"Linz"}"#);
    }

    #[test]
    fn test_malformed_lines_pass_through() {
        let mut relay = StreamRelay::new(None);
        for line in ["data: {\"choices\": [", ": keep-alive", "garbage", ""] {
            assert_eq!(relay.process_line(line.to_string()).as_deref(), Some(line));
        }
        assert!(relay.capture().tool_calls.is_empty());
        assert!(!relay.capture().saw_tool_calls);
    }

    #[tokio::test]
    async fn test_relay_forwards_in_order() {
        let lines = vec![text_chunk("a"), text_chunk("b"), "data: [DONE]".to_string()];
        let mut out: Vec<String> = Vec::new();
        let interrupted = AtomicBool::new(false);

        let report = StreamRelay::new(None)
            .relay(line_stream(lines.clone()), &mut out, &interrupted)
            .await;

        assert!(matches!(report.end, RelayEnd::Finished));
        assert_eq!(report.lines_forwarded, 3);
        assert_eq!(out, lines);
    }

    #[tokio::test]
    async fn test_relay_reports_upstream_error() {
        let lines: LineStream = Box::pin(futures::stream::iter(vec![
            Ok(text_chunk("partial")),
            Err(Error::stream("connection reset")),
            Ok(text_chunk("never")),
        ]));
        let mut out: Vec<String> = Vec::new();

        let report = StreamRelay::new(None)
            .relay(lines, &mut out, &AtomicBool::new(false))
            .await;

        assert!(matches!(report.end, RelayEnd::UpstreamError(Error::Stream(_))));
        assert_eq!(out, vec![text_chunk("partial")]);
        assert_eq!(report.capture.assistant_text, "partial");
    }

    #[tokio::test]
    async fn test_relay_stops_on_closed_receiver() {
        let (mut tx, rx) = mpsc::channel::<String>(4);
        drop(rx);

        let report = StreamRelay::new(None)
            .relay(line_stream(vec![text_chunk("a")]), &mut tx, &AtomicBool::new(false))
            .await;

        assert!(matches!(report.end, RelayEnd::Cancelled(Error::Disconnected)));
        assert_eq!(report.lines_forwarded, 0);
    }

    #[tokio::test]
    async fn test_relay_notices_hang_up_while_upstream_is_silent() {
        let (mut tx, mut rx) = mpsc::channel::<String>(4);
        let lines: LineStream = Box::pin(
            futures::stream::iter(vec![Ok(text_chunk("first"))])
                .chain(futures::stream::pending::<Result<String>>()),
        );
        let interrupted = AtomicBool::new(false);

        let consumer = async move {
            let first = rx.recv().await;
            drop(rx);
            first
        };
        let relay = tokio::time::timeout(
            Duration::from_secs(2),
            StreamRelay::new(None).relay(lines, &mut tx, &interrupted),
        );
        let (first, report) = tokio::join!(consumer, relay);

        assert_eq!(first, Some(text_chunk("first")));
        let report = report.expect("relay must end once the receiver is dropped");
        assert!(matches!(report.end, RelayEnd::Cancelled(Error::Disconnected)));
        assert_eq!(report.lines_forwarded, 1);
        assert_eq!(report.capture.assistant_text, "first");
    }

    #[tokio::test]
    async fn test_relay_honours_interrupt() {
        let mut out: Vec<String> = Vec::new();
        let report = StreamRelay::new(None)
            .relay(line_stream(vec![text_chunk("a")]), &mut out, &AtomicBool::new(true))
            .await;

        assert!(matches!(report.end, RelayEnd::Cancelled(Error::Interrupted)));
        assert!(out.is_empty());
    }

    #[tokio::test]
    async fn test_line_writer_terminates_lines() {
        let mut writer = LineWriter::new(Vec::<u8>::new());
        writer.send_line("data: {}".to_string()).await.unwrap();
        writer.send_line("data: [DONE]".to_string()).await.unwrap();
        assert_eq!(writer.into_inner(), b"data: {}\ndata: [DONE]\n".to_vec());
    }
}
