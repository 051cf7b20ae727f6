// HTTP front for the relay.
//
// Routes:
// - POST /v1/chat/completions: streamed chat completion with server-side tools
// - GET  /health:              liveness probe
//
// The handler runs INIT inline so upstream failures become proper HTTP error
// responses. Once the first upstream stream is open the lifecycle moves to its
// own task and feeds the response body through a bounded channel. A client
// that hangs up drops the receiver, which the lifecycle sees as a disconnect.

use crate::protocol::{LifecycleRequest, ToolCallProtocol};
use crate::{Error, Result};
use axum::Router;
use axum::body::Body;
use axum::extract::State;
use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use bytes::Bytes;
use futures::StreamExt;
use serde_json::{Value, json};
use std::convert::Infallible;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

/// Lines buffered between the lifecycle task and the response body.
pub const CHANNEL_CAPACITY: usize = 64;

/// Shared state injected into axum handlers.
#[derive(Clone, Debug)]
pub struct AppState {
    pub protocol: ToolCallProtocol,
}

/// Builds the router. The protocol (and with it the upstream and the tool
/// registry) is injected.
pub fn build_router(protocol: ToolCallProtocol) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/v1/chat/completions", post(chat_completions))
        .with_state(AppState { protocol })
}

/// GET /health -> 200 {"status":"ok"}
pub async fn health() -> impl IntoResponse {
    axum::Json(json!({"status": "ok"}))
}

/// POST /v1/chat/completions
pub async fn chat_completions(State(state): State<AppState>, body: Bytes) -> Response {
    match open_stream(&state.protocol, &body).await {
        Ok(response) => response,
        Err(e) => e.into_response(),
    }
}

async fn open_stream(protocol: &ToolCallProtocol, body: &[u8]) -> Result<Response> {
    if body.is_empty() {
        return Err(Error::invalid_input("request body is empty"));
    }
    let body: Value = serde_json::from_slice(body)
        .map_err(|e| Error::invalid_input(format!("request body is not valid JSON: {}", e)))?;
    let request = LifecycleRequest::from_body(body)?;

    let lifecycle = protocol.start(request).await?;

    let (tx, rx) = mpsc::channel::<String>(CHANNEL_CAPACITY);
    tokio::spawn(async move {
        let mut tx = tx;
        let outcome = lifecycle.run(&mut tx).await;
        log::debug!(
            "stream closed: {:?}, {} messages",
            outcome.termination,
            outcome.conversation.len()
        );
    });

    let lines = ReceiverStream::new(rx).map(|line| {
        let mut framed = line.into_bytes();
        framed.push(b'\n');
        Ok::<Bytes, Infallible>(Bytes::from(framed))
    });

    Ok((
        [
            (header::CONTENT_TYPE, "text/event-stream"),
            (header::CACHE_CONTROL, "no-cache"),
        ],
        Body::from_stream(lines),
    )
        .into_response())
}

impl Error {
    /// HTTP status used when this error ends a request before streaming began.
    pub fn status_code(&self) -> StatusCode {
        match self {
            Error::InvalidInput(_) | Error::Json(_) => StatusCode::BAD_REQUEST,
            Error::UpstreamStatus { status, .. } => {
                StatusCode::from_u16(*status).unwrap_or(StatusCode::BAD_GATEWAY)
            }
            Error::Timeout => StatusCode::GATEWAY_TIMEOUT,
            Error::Http(_) | Error::Io(_) | Error::Stream(_) => StatusCode::BAD_GATEWAY,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let public_message = match &self {
            Error::InvalidInput(msg) => msg.clone(),
            Error::UpstreamStatus { .. } => "upstream returned an error".to_string(),
            Error::Timeout => "upstream request timed out".to_string(),
            Error::Http(_) | Error::Io(_) | Error::Stream(_) => "upstream request failed".to_string(),
            _ => "internal error".to_string(),
        };
        log::warn!("request failed with {}: {}", status, self);
        (status, axum::Json(json!({"error": public_message}))).into_response()
    }
}
