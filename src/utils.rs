//! Line-level utilities for the SSE wire format.
//!
//! Upstream servers answer a streamed chat completion with lines like:
//!
//! ```text
//! data: {"id":"chatcmpl-1","object":"chat.completion.chunk","choices":[...]}
//!
//! data: {"id":"chatcmpl-1","object":"chat.completion.chunk","choices":[...]}
//!
//! data: [DONE]
//! ```
//!
//! The relay forwards these lines verbatim, so unlike an SSE *event* decoder
//! everything here works on raw lines: blank separator lines, comments and
//! unknown fields are preserved and passed through. Only `data:` lines whose
//! payload is a JSON object are ever parsed.
//!
//! # Byte stream to line stream
//!
//! HTTP bodies arrive in arbitrary byte chunks; a single JSON line may be split
//! across several of them, or several lines may share one chunk.
//! [`lines_from_bytes`] reassembles complete lines before anything looks at
//! them:
//!
//! ```text
//! reqwest bytes_stream()
//!     │  StreamReader (AsyncRead)
//!     ▼
//! FramedRead<LinesCodec>
//!     │
//!     ▼
//! Stream<Result<String>>   one item per line, line terminator stripped
//! ```

use crate::{Error, Result};
use bytes::Bytes;
use futures::stream::{Stream, StreamExt, TryStreamExt};
use serde_json::Value;
use std::pin::Pin;
use tokio_util::codec::{FramedRead, LinesCodec, LinesCodecError};
use tokio_util::io::StreamReader;

/// The termination marker emitted by the relay.
pub const DONE_LINE: &str = "data: [DONE]";

/// Upper bound for a single upstream line. Chunks are small; anything beyond
/// this is a broken upstream.
pub const MAX_LINE_LENGTH: usize = 4 * 1024 * 1024;

/// A stream of upstream lines, terminators stripped.
pub type LineStream = Pin<Box<dyn Stream<Item = Result<String>> + Send>>;

/// Returns true for a stream-termination line (`data: [DONE]` or a bare `[DONE]`).
pub fn is_done_line(line: &str) -> bool {
    let trimmed = line.trim();
    trimmed == DONE_LINE || trimmed == "[DONE]"
}

/// Splits a `data:` line into its prefix (everything before the JSON object,
/// e.g. `"data: "`) and the JSON text.
///
/// Returns `None` for non-data lines and for data lines without an object
/// payload, such as `data: [DONE]`.
pub fn split_data_line(line: &str) -> Option<(&str, &str)> {
    if !line.starts_with("data:") {
        return None;
    }
    let start = line.find('{')?;
    Some((&line[..start], &line[start..]))
}

/// Parses the JSON object carried by a `data:` line.
///
/// Malformed payloads yield `None`; the caller keeps forwarding the raw line.
pub fn parse_data_line(line: &str) -> Option<Value> {
    let (_, payload) = split_data_line(line)?;
    match serde_json::from_str::<Value>(payload.trim_end()) {
        Ok(value) if value.is_object() => Some(value),
        Ok(_) => None,
        Err(e) => {
            log::trace!("skipping malformed stream chunk: {}", e);
            None
        }
    }
}

/// Reassembles a byte stream into complete lines.
pub fn lines_from_bytes<S, E>(bytes: S) -> LineStream
where
    S: Stream<Item = std::result::Result<Bytes, E>> + Send + 'static,
    E: std::error::Error + Send + Sync + 'static,
{
    let reader = StreamReader::new(bytes.map_err(std::io::Error::other));
    let lines = FramedRead::new(reader, LinesCodec::new_with_max_length(MAX_LINE_LENGTH))
        .map(|item| item.map_err(line_error));
    Box::pin(lines)
}

/// Turns a streaming HTTP response body into a [`LineStream`].
pub fn lines_from_response(response: reqwest::Response) -> LineStream {
    lines_from_bytes(response.bytes_stream())
}

fn line_error(error: LinesCodecError) -> Error {
    match error {
        LinesCodecError::MaxLineLengthExceeded => Error::stream(format!(
            "upstream line exceeds {} bytes",
            MAX_LINE_LENGTH
        )),
        LinesCodecError::Io(e) => Error::Io(e),
    }
}
