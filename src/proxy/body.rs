use std::io;
use std::time::Duration;

use axum::body::Body;
use axum::http::header::{CONTENT_LENGTH, TRANSFER_ENCODING};
use axum::http::{HeaderMap, Response, StatusCode};
use bytes::Bytes;
use futures_util::stream;
use tokio::time::timeout;
use tracing::warn;

use crate::error::{Result, RouterError};
use crate::observability::RequestLog;

use super::backend::{BackendEvent, BackendSession};

/// Responses with a declared length under this are buffered whole;
/// anything at or above it is streamed.
pub const MAX_BUFFERED_RESPONSE_BYTES: u64 = 102_400;

/// Strategy for moving the backend response back to the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodyMode {
    Chunked,
    Buffered,
    Streaming,
}

/// Pick the forwarding strategy from the backend's response headers.
/// A chunked transfer-encoding wins over any Content-Length.
pub fn select_mode(headers: &HeaderMap) -> BodyMode {
    if is_chunked(headers) {
        return BodyMode::Chunked;
    }

    let declared_length = headers
        .get(CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.parse::<u64>().ok());

    match declared_length {
        Some(len) if len < MAX_BUFFERED_RESPONSE_BYTES => BodyMode::Buffered,
        _ => BodyMode::Streaming,
    }
}

fn is_chunked(headers: &HeaderMap) -> bool {
    headers.get_all(TRANSFER_ENCODING).iter().any(|value| {
        value
            .to_str()
            .map(|s| s.split(',').any(|t| t.trim().eq_ignore_ascii_case("chunked")))
            .unwrap_or(false)
    })
}

/// A 204/304 without Content-Length or Transfer-Encoding never carries a
/// body; waiting for one would block on upstream clients that close the
/// exchange right after the status line.
pub fn is_bodyless_status(status: StatusCode, headers: &HeaderMap) -> bool {
    (status == StatusCode::NO_CONTENT || status == StatusCode::NOT_MODIFIED)
        && !headers.contains_key(CONTENT_LENGTH)
        && !headers.contains_key(TRANSFER_ENCODING)
}

/// Accumulate the whole response, then reply in one shot. Returns the
/// response together with the backend's total duration in microseconds.
pub async fn forward_buffered(
    status: StatusCode,
    headers: HeaderMap,
    mut session: BackendSession,
    per_event: Duration,
) -> Result<(Response<Body>, u64)> {
    let mut chunks: Vec<Bytes> = Vec::new();

    loop {
        let event = match timeout(per_event, session.next_event()).await {
            Ok(event) => event,
            Err(_) => {
                session.abort();
                return Err(RouterError::StageTimeout {
                    stage: "receiving_response",
                });
            }
        };

        match event {
            Some(BackendEvent::Chunk(chunk)) => chunks.push(chunk),
            Some(BackendEvent::Done { total_us }) => {
                let mut body = Vec::with_capacity(chunks.iter().map(Bytes::len).sum());
                for chunk in &chunks {
                    body.extend_from_slice(chunk);
                }

                let mut response = Response::new(Body::from(body));
                *response.status_mut() = status;
                *response.headers_mut() = headers;
                return Ok((response, total_us));
            }
            Some(BackendEvent::Error { reason, .. }) => {
                return Err(RouterError::BackendIo(reason));
            }
            Some(BackendEvent::InitialResponse { .. }) | None => {
                return Err(RouterError::BackendIo(
                    "backend event stream ended before the response completed".to_string(),
                ));
            }
        }
    }
}

/// Reply with headers now and a lazily-produced body: each backend chunk
/// is written through as it arrives until the backend signals completion.
///
/// In chunked mode the framing headers are dropped so the server layer
/// re-frames the unknown-length body itself; in streaming mode the
/// origin's headers (including any Content-Length) pass through.
pub fn forward_streamed(
    mode: BodyMode,
    status: StatusCode,
    mut headers: HeaderMap,
    session: BackendSession,
    per_event: Duration,
    log: RequestLog,
) -> Response<Body> {
    if mode == BodyMode::Chunked {
        headers.remove(TRANSFER_ENCODING);
        headers.remove(CONTENT_LENGTH);
    }

    let status_code = status.as_u16();
    let body = Body::from_stream(event_stream(session, per_event, log, status_code));

    let mut response = Response::new(body);
    *response.status_mut() = status;
    *response.headers_mut() = headers;
    response
}

struct StreamState {
    session: BackendSession,
    per_event: Duration,
    log: Option<RequestLog>,
    status: u16,
    finished: bool,
}

/// Adapt the remaining session events into a byte stream. The single
/// access-log line for the request is emitted here, once the terminal
/// event (or a timeout) is reached, so streamed responses report their
/// real total duration.
fn event_stream(
    session: BackendSession,
    per_event: Duration,
    log: RequestLog,
    status: u16,
) -> impl futures_util::Stream<Item = io::Result<Bytes>> {
    let state = StreamState {
        session,
        per_event,
        log: Some(log),
        status,
        finished: false,
    };

    stream::unfold(state, |mut state| async move {
        if state.finished {
            return None;
        }

        match timeout(state.per_event, state.session.next_event()).await {
            Ok(Some(BackendEvent::Chunk(chunk))) => Some((Ok(chunk), state)),
            Ok(Some(BackendEvent::Done { total_us })) => {
                if let Some(log) = state.log.take() {
                    log.finish(state.status, "ok", total_us).await;
                }
                None
            }
            Ok(Some(BackendEvent::Error { reason, elapsed_us })) => {
                state.finished = true;
                warn!(reason = %reason, "Backend failed mid-response");
                if let Some(log) = state.log.take() {
                    log.finish(state.status, "error", elapsed_us).await;
                }
                Some((Err(io::Error::new(io::ErrorKind::Other, reason)), state))
            }
            Ok(Some(BackendEvent::InitialResponse { .. })) | Ok(None) => {
                state.finished = true;
                let elapsed_us = state.session.elapsed_us();
                if let Some(log) = state.log.take() {
                    log.finish(state.status, "error", elapsed_us).await;
                }
                Some((
                    Err(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "backend event stream ended before the response completed",
                    )),
                    state,
                ))
            }
            Err(_) => {
                state.finished = true;
                state.session.abort();
                warn!("No backend event within the receiving_response timeout");
                if let Some(log) = state.log.take() {
                    log.finish(state.status, "error", state.session.elapsed_us()).await;
                }
                Some((
                    Err(io::Error::new(
                        io::ErrorKind::TimedOut,
                        "no backend event within the receiving_response timeout",
                    )),
                    state,
                ))
            }
        }
    })
}
