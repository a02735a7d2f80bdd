use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use axum::body::Body;
use axum::extract::{ConnectInfo, Request, State};
use axum::http::{header, HeaderMap, Response};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use bytes::Bytes;
use futures_util::StreamExt;
use tokio::time::timeout;
use tower::limit::GlobalConcurrencyLimitLayer;
use tower_http::trace::TraceLayer;
use tracing::{debug, warn};

use crate::config::{Config, TimeoutConfig};
use crate::error::{Result, RouterError};
use crate::health;
use crate::observability::{Logger, RequestLog};
use crate::routes::{authority_key, RefreshClock, RouteCache};

use super::backend::{BackendClient, BackendEvent, BackendSession};
use super::body::{self, BodyMode};
use super::headers;
use super::RequestContext;

/// The listener speaks plain HTTP; TLS termination is out of scope.
const INBOUND_SCHEME: &str = "http";

/// Request bodies are forwarded to the backend in reads of this size.
const REQUEST_BODY_CHUNK_BYTES: usize = 4_096;

/// Application state injected into handlers.
#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<ProxyEngine>,
    pub clock: Arc<RefreshClock>,
}

/// Build the inbound router: the status-check endpoint plus a catch-all
/// proxy handler, traced and bounded to the configured concurrency.
pub fn router(state: AppState, max_connections: usize) -> Router {
    Router::new()
        .route(health::STATUS_CHECK_PATH, get(health::status_check))
        .fallback(proxy_handler)
        .layer(TraceLayer::new_for_http())
        .layer(GlobalConcurrencyLimitLayer::new(max_connections))
        .with_state(state)
}

async fn proxy_handler(
    State(state): State<AppState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    req: Request,
) -> Response<Body> {
    state.engine.proxy(req, Some(peer)).await
}

/// Orchestrates one proxied request: route lookup, forwarding headers,
/// backend dispatch, body-handler selection, and per-stage timeouts.
pub struct ProxyEngine {
    cache: Arc<RouteCache>,
    backends: BackendClient,
    timeouts: TimeoutConfig,
    logger: Arc<Logger>,
    http_port: u16,
}

impl ProxyEngine {
    pub fn new(config: &Config, cache: Arc<RouteCache>, logger: Arc<Logger>) -> anyhow::Result<Self> {
        Ok(Self {
            cache,
            backends: BackendClient::new(config)?,
            timeouts: config.timeouts.clone(),
            logger,
            http_port: config.server.port,
        })
    }

    /// Proxy a single request, always producing a client response. The
    /// terminal state of every path emits exactly one access-log line.
    pub async fn proxy(&self, req: Request, peer: Option<SocketAddr>) -> Response<Body> {
        let started_at = Instant::now();
        let (parts, inbound_body) = req.into_parts();

        let (host, port) = inbound_host_port(&parts.headers, self.http_port);
        let ctx = RequestContext {
            host,
            port,
            scheme: INBOUND_SCHEME,
            method: headers::canonical_method(parts.method.as_str()),
            path_and_query: parts
                .uri
                .path_and_query()
                .map(|pq| pq.as_str().to_string())
                .unwrap_or_else(|| "/".to_string()),
            peer,
            started_at,
        };

        let authority = authority_key(&ctx.host, ctx.port);
        let mut log = RequestLog::new(
            self.logger.clone(),
            ctx.peer
                .map(|p| p.ip().to_string())
                .unwrap_or_else(|| "unknown".to_string()),
            ctx.method.to_string(),
            ctx.path_and_query.clone(),
            authority.clone(),
            started_at,
        );

        let Some(backend) = self.cache.select(&authority) else {
            let error = RouterError::NoRoute(authority);
            debug!(error = %error, "No route registered for authority");
            log.finish(error.status_code().as_u16(), "ok", 0).await;
            return error.into_response();
        };

        let mut outbound = HeaderMap::new();
        for (name, value) in parts.headers.iter() {
            if !headers::is_hop_by_hop_header(name) && name != header::HOST {
                outbound.append(name.clone(), value.clone());
            }
        }
        headers::insert_forwarding_headers(&mut outbound, ctx.peer, &ctx.host, ctx.port, ctx.scheme);
        if let Some(id) = outbound
            .get(&headers::REQUEST_ID)
            .and_then(|v| v.to_str().ok())
        {
            log.set_request_id(id.to_string());
        }

        let url = headers::backend_url(&backend, &ctx.path_and_query);
        let has_body = headers::has_request_body(&parts.headers);

        debug!(
            authority = %authority,
            backend = %url,
            method = %ctx.method,
            has_body,
            "Dispatching request to backend"
        );

        let mut session = match self
            .backends
            .start(ctx.method.clone(), url, outbound, has_body)
        {
            Ok(session) => session,
            Err(e) => return self.fail(log, e).await,
        };

        if has_body {
            if let Err(e) = self.send_request_body(&mut session, inbound_body).await {
                session.abort();
                return self.fail(log, e).await;
            }
        }

        let event = match timeout(self.timeouts.waiting_for_response(), session.next_event()).await
        {
            Ok(event) => event,
            Err(_) => {
                session.abort();
                return self
                    .fail(
                        log,
                        RouterError::StageTimeout {
                            stage: "waiting_for_response",
                        },
                    )
                    .await;
            }
        };

        let (status, response_headers, initial_elapsed_us) = match event {
            Some(BackendEvent::InitialResponse {
                status,
                headers,
                elapsed_us,
            }) => (status, headers, elapsed_us),
            Some(BackendEvent::Error { reason, elapsed_us }) => {
                let error = RouterError::BackendStart(reason);
                warn!(error = %error, "Backend request failed before a response arrived");
                log.finish(error.status_code().as_u16(), "error", elapsed_us).await;
                return error.into_response();
            }
            _ => {
                return self
                    .fail(
                        log,
                        RouterError::BackendIo(
                            "backend event stream ended before a response arrived".to_string(),
                        ),
                    )
                    .await;
            }
        };

        let sanitized = headers::sanitize_response_headers(&response_headers);

        if body::is_bodyless_status(status, &response_headers) {
            // No body is coming; waiting for a done event would hang on
            // upstreams that keep the exchange open.
            drop(session);
            log.finish(status.as_u16(), "ok", initial_elapsed_us).await;
            let mut response = Response::new(Body::empty());
            *response.status_mut() = status;
            *response.headers_mut() = sanitized;
            return response;
        }

        match body::select_mode(&response_headers) {
            BodyMode::Buffered => {
                let result = body::forward_buffered(
                    status,
                    sanitized,
                    session,
                    self.timeouts.receiving_response(),
                )
                .await;
                match result {
                    Ok((response, total_us)) => {
                        log.finish(status.as_u16(), "ok", total_us).await;
                        response
                    }
                    Err(e) => self.fail(log, e).await,
                }
            }
            mode => body::forward_streamed(
                mode,
                status,
                sanitized,
                session,
                self.timeouts.receiving_response(),
                log,
            ),
        }
    }

    /// Stream the inbound request body to the backend in fixed-size
    /// reads; every read but the last goes out as a non-final chunk.
    async fn send_request_body(&self, session: &mut BackendSession, body: Body) -> Result<()> {
        let per_event = self.timeouts.sending_request_body();
        let mut stream = body.into_data_stream();
        let mut pending: Option<Bytes> = None;

        loop {
            let next = match timeout(per_event, stream.next()).await {
                Ok(next) => next,
                Err(_) => {
                    return Err(RouterError::StageTimeout {
                        stage: "sending_request_body",
                    })
                }
            };

            match next {
                Some(Ok(buf)) => {
                    for chunk in split_into_chunks(buf) {
                        if let Some(prev) = pending.replace(chunk) {
                            match timeout(per_event, session.send_chunk(prev, false)).await {
                                Ok(sent) => {
                                    sent?;
                                }
                                Err(_) => {
                                    return Err(RouterError::StageTimeout {
                                        stage: "sending_request_body",
                                    })
                                }
                            }
                        }
                    }
                }
                Some(Err(e)) => return Err(RouterError::ClientIo(e.to_string())),
                None => break,
            }
        }

        match timeout(per_event, session.send_chunk(pending.unwrap_or_default(), true)).await {
            Ok(sent) => sent.map(|_| ()),
            Err(_) => Err(RouterError::StageTimeout {
                stage: "sending_request_body",
            }),
        }
    }

    async fn fail(&self, log: RequestLog, error: RouterError) -> Response<Body> {
        warn!(error = %error, "Request failed");
        let status = error.status_code();
        log.finish(status.as_u16(), "error", 0).await;
        error.into_response()
    }
}

/// Resolve the inbound authority from the Host header, falling back to
/// the listener port when the header names no port.
fn inbound_host_port(request_headers: &HeaderMap, default_port: u16) -> (String, u16) {
    let raw = request_headers
        .get(header::HOST)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();

    if let Some((host, port)) = raw.rsplit_once(':') {
        if let Ok(port) = port.parse::<u16>() {
            return (host.to_string(), port);
        }
    }

    (raw.to_string(), default_port)
}

/// Slice a buffer into the fixed-size reads the backend receives. An
/// empty buffer produces no chunks.
fn split_into_chunks(mut buf: Bytes) -> Vec<Bytes> {
    if buf.is_empty() {
        return Vec::new();
    }

    let mut chunks = Vec::with_capacity(buf.len() / REQUEST_BODY_CHUNK_BYTES + 1);
    while buf.len() > REQUEST_BODY_CHUNK_BYTES {
        chunks.push(buf.split_to(REQUEST_BODY_CHUNK_BYTES));
    }
    chunks.push(buf);
    chunks
}
