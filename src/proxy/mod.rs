pub mod backend;
pub mod body;
pub mod engine;
pub mod headers;

pub use backend::{BackendClient, BackendEvent, BackendSession};
pub use engine::{AppState, ProxyEngine};

/// Per-request context assembled before the backend is dispatched.
#[derive(Debug, Clone)]
pub struct RequestContext {
    /// Original inbound host, as routed.
    pub host: String,
    /// Original inbound port.
    pub port: u16,
    /// Inbound transport scheme ("http" or "https").
    pub scheme: &'static str,
    /// Canonicalized request method.
    pub method: axum::http::Method,
    /// Path and query, preserved verbatim for the backend URL.
    pub path_and_query: String,
    /// Peer address of the inbound connection, when known.
    pub peer: Option<std::net::SocketAddr>,
    /// Monotonic start of the request, for duration reporting.
    pub started_at: std::time::Instant,
}
