//! Upstream chat-completion collaborator.
//!
//! The protocol only needs one thing from the transport: send a JSON request
//! body and get back the response as a stream of lines. [`Upstream`] captures
//! that; [`HttpUpstream`] implements it over reqwest against an
//! OpenAI-compatible `/chat/completions` endpoint. Tests and embedders can
//! supply their own implementation.

use crate::config::RelayOptions;
use crate::utils::{LineStream, lines_from_response};
use crate::{Error, Result};
use async_trait::async_trait;
use serde_json::Value;

/// An opened upstream response.
pub struct UpstreamResponse {
    status: u16,
    lines: LineStream,
}

impl UpstreamResponse {
    pub fn new(status: u16, lines: LineStream) -> Self {
        Self { status, lines }
    }

    /// A `200 OK` response over `lines`.
    pub fn ok(lines: LineStream) -> Self {
        Self::new(200, lines)
    }

    pub fn status(&self) -> u16 {
        self.status
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Hands over the body. Dropping the stream closes the connection.
    pub fn into_lines(self) -> LineStream {
        self.lines
    }
}

impl std::fmt::Debug for UpstreamResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UpstreamResponse")
            .field("status", &self.status)
            .finish_non_exhaustive()
    }
}

/// Opens one streamed chat completion.
///
/// Implementations are shared across requests and must be `Send + Sync`.
/// Returning an `UpstreamResponse` with a non-success status is allowed; the
/// protocol treats it like a transport failure.
#[async_trait]
pub trait Upstream: Send + Sync {
    async fn open(&self, body: &Value) -> Result<UpstreamResponse>;
}

/// reqwest-backed upstream.
///
/// The client is built once and reused for every request so connections are
/// pooled. The configured timeout bounds connecting and each individual read,
/// not the whole response, so a long completion that keeps streaming is never
/// cut off while a stalled one still fails.
#[derive(Debug, Clone)]
pub struct HttpUpstream {
    client: reqwest::Client,
    endpoint: String,
    api_key: Option<String>,
}

impl HttpUpstream {
    pub fn new(options: &RelayOptions) -> Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(options.timeout())
            .read_timeout(options.timeout())
            .build()
            .map_err(|e| Error::config(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            endpoint: options.endpoint(),
            api_key: options.api_key().map(str::to_string),
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

#[async_trait]
impl Upstream for HttpUpstream {
    async fn open(&self, body: &Value) -> Result<UpstreamResponse> {
        let mut request = self
            .client
            .post(&self.endpoint)
            .header("Content-Type", "application/json")
            .json(body);
        if let Some(key) = &self.api_key {
            request = request.header("Authorization", format!("Bearer {}", key));
        }

        let response = request.send().await.map_err(transport_error)?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_else(|e| {
                log::warn!("failed to read upstream error body: {}", e);
                String::new()
            });
            return Err(Error::upstream_status(status.as_u16(), body));
        }

        log::debug!("upstream {} answered {}", self.endpoint, status);
        Ok(UpstreamResponse::new(
            status.as_u16(),
            lines_from_response(response),
        ))
    }
}

fn transport_error(error: reqwest::Error) -> Error {
    if error.is_timeout() {
        Error::Timeout
    } else {
        Error::Http(error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;

    #[test]
    fn test_http_upstream_endpoint() {
        let options = RelayOptions::builder()
            .base_url("http://localhost:1234/v1/")
            .build()
            .unwrap();
        let upstream = HttpUpstream::new(&options).unwrap();
        assert_eq!(upstream.endpoint(), "http://localhost:1234/v1/chat/completions");
    }

    #[tokio::test]
    async fn test_upstream_response_status() {
        let lines: LineStream = Box::pin(futures::stream::iter(vec![Ok("data: [DONE]".to_string())]));
        let response = UpstreamResponse::ok(lines);
        assert_eq!(response.status(), 200);
        assert!(response.is_success());

        let mut lines = response.into_lines();
        assert_eq!(lines.next().await.unwrap().unwrap(), "data: [DONE]");

        let failed = UpstreamResponse::new(503, Box::pin(futures::stream::empty()));
        assert!(!failed.is_success());
    }
}
