use std::net::SocketAddr;

use axum::http::header::{HeaderName, HeaderValue, CONTENT_LENGTH, TRANSFER_ENCODING};
use axum::http::{HeaderMap, Method};
use uuid::Uuid;

use crate::routes::BackendDescriptor;

pub const REQUEST_ID: HeaderName = HeaderName::from_static("x-openaperture-request-id");
pub const FORWARDED_FOR: HeaderName = HeaderName::from_static("x-forwarded-for");
pub const FORWARDED_HOST: HeaderName = HeaderName::from_static("x-forwarded-host");
pub const FORWARDED_PORT: HeaderName = HeaderName::from_static("x-forwarded-port");
pub const FORWARDED_PROTO: HeaderName = HeaderName::from_static("x-forwarded-proto");

/// Canonicalize an HTTP method string: standard verbs map onto their
/// enumerated forms, anything else is carried through as an opaque
/// uppercased method so unusual verbs reach the backend untouched.
pub fn canonical_method(raw: &str) -> Method {
    match raw.to_ascii_uppercase().as_str() {
        "DELETE" => Method::DELETE,
        "GET" => Method::GET,
        "HEAD" => Method::HEAD,
        "OPTIONS" => Method::OPTIONS,
        "PATCH" => Method::PATCH,
        "POST" => Method::POST,
        "PUT" => Method::PUT,
        other => Method::from_bytes(other.as_bytes()).unwrap_or(Method::GET),
    }
}

/// 128-bit random request identifier, formatted as 32 hex chars.
pub fn generate_request_id() -> String {
    Uuid::new_v4().simple().to_string()
}

/// Append the five forwarding headers, skipping any the client already
/// supplied. Header-name matching is case-insensitive by construction.
pub fn insert_forwarding_headers(
    headers: &mut HeaderMap,
    peer: Option<SocketAddr>,
    host: &str,
    port: u16,
    scheme: &str,
) {
    if !headers.contains_key(&REQUEST_ID) {
        if let Ok(value) = HeaderValue::from_str(&generate_request_id()) {
            headers.append(REQUEST_ID, value);
        }
    }

    if !headers.contains_key(&FORWARDED_FOR) {
        let value = match peer {
            Some(addr) => format!("{}:{}", addr.ip(), addr.port()),
            None => "unknown".to_string(),
        };
        if let Ok(value) = HeaderValue::from_str(&value) {
            headers.append(FORWARDED_FOR, value);
        }
    }

    if !headers.contains_key(&FORWARDED_HOST) {
        if let Ok(value) = HeaderValue::from_str(host) {
            headers.append(FORWARDED_HOST, value);
        }
    }

    if !headers.contains_key(&FORWARDED_PORT) {
        if let Ok(value) = HeaderValue::from_str(&port.to_string()) {
            headers.append(FORWARDED_PORT, value);
        }
    }

    if !headers.contains_key(&FORWARDED_PROTO) {
        if let Ok(value) = HeaderValue::from_str(scheme) {
            headers.append(FORWARDED_PROTO, value);
        }
    }
}

/// Deduplicate response headers by case-insensitive name, keeping the
/// last-supplied value for each. The origin's headers are appended after
/// any the server layer injected, so "keep last" preserves the origin's
/// version of hop headers like `Server` or `Connection`.
///
/// Total by construction: any header map in, a duplicate-free map out.
pub fn sanitize_response_headers(headers: &HeaderMap) -> HeaderMap {
    let mut sanitized = HeaderMap::with_capacity(headers.keys_len());
    for name in headers.keys() {
        if let Some(value) = headers.get_all(name).iter().last() {
            sanitized.insert(name.clone(), value.clone());
        }
    }
    sanitized
}

/// Extract the `host[:port]` authority from a URL string, for diagnostics.
pub fn extract_authority(url: &str) -> Option<&str> {
    let rest = url.split_once("://")?.1;
    match rest.find('/') {
        Some(idx) => Some(&rest[..idx]),
        None => Some(rest),
    }
}

/// Rebuild the request URL against the chosen backend, preserving the
/// original path and query.
pub fn backend_url(backend: &BackendDescriptor, path_and_query: &str) -> String {
    format!(
        "{}://{}:{}{}",
        backend.scheme(),
        backend.host,
        backend.port,
        path_and_query
    )
}

/// A request carries a body iff it has a Content-Length or
/// Transfer-Encoding header.
pub fn has_request_body(headers: &HeaderMap) -> bool {
    headers.contains_key(CONTENT_LENGTH) || headers.contains_key(TRANSFER_ENCODING)
}

/// Hop-by-hop headers that must not be copied onto the outbound request.
pub fn is_hop_by_hop_header(name: &HeaderName) -> bool {
    matches!(
        name.as_str(),
        "connection"
            | "keep-alive"
            | "proxy-authenticate"
            | "proxy-authorization"
            | "te"
            | "trailers"
            | "transfer-encoding"
            | "upgrade"
    )
}
