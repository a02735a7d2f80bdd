//! End-to-end proxy scenarios against raw-TCP mock backends.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

use openaperture_router::config::Config;
use openaperture_router::observability::Logger;
use openaperture_router::proxy::{engine, AppState, ProxyEngine};
use openaperture_router::routes::{refresher::unix_now, BackendDescriptor, RefreshClock, RouteCache};

/// Start the router on an ephemeral port with a pre-seeded route cache.
async fn start_router(cache: Arc<RouteCache>, config: Config) -> SocketAddr {
    let clock = Arc::new(RefreshClock::new());
    clock.mark(unix_now());

    let logger = Arc::new(Logger::new(&config.logging.access_log).unwrap());
    let state = AppState {
        engine: Arc::new(ProxyEngine::new(&config, cache, logger).unwrap()),
        clock,
    };
    let app = engine::router(state, config.server.max_connections);

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .await
        .unwrap();
    });
    addr
}

/// Read one HTTP request: the head, plus a Content-Length body if one is
/// declared. Enough for mock backends; no chunked request parsing.
async fn read_request(socket: &mut TcpStream) -> (String, Vec<u8>) {
    let mut data = Vec::new();
    let mut buf = [0u8; 8192];

    loop {
        let n = socket.read(&mut buf).await.unwrap();
        if n == 0 {
            break;
        }
        data.extend_from_slice(&buf[..n]);

        if let Some(head_end) = data.windows(4).position(|w| w == b"\r\n\r\n") {
            let head = String::from_utf8_lossy(&data[..head_end]).to_string();
            let content_length = head
                .lines()
                .find_map(|line| {
                    let (name, value) = line.split_once(':')?;
                    name.trim()
                        .eq_ignore_ascii_case("content-length")
                        .then(|| value.trim().parse::<usize>().ok())?
                })
                .unwrap_or(0);

            let body_start = head_end + 4;
            if data.len() - body_start >= content_length {
                let body = data[body_start..body_start + content_length].to_vec();
                return (head, body);
            }
        }
    }

    (String::from_utf8_lossy(&data).to_string(), Vec::new())
}

/// Start a mock backend answering every connection with the response
/// produced from the received request.
async fn start_backend<F>(respond: F) -> SocketAddr
where
    F: Fn(String, Vec<u8>) -> Vec<u8> + Send + Sync + 'static,
{
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let respond = Arc::new(respond);

    tokio::spawn(async move {
        loop {
            let Ok((mut socket, _)) = listener.accept().await else {
                break;
            };
            let respond = respond.clone();
            tokio::spawn(async move {
                let (head, body) = read_request(&mut socket).await;
                let response = respond(head, body);
                let _ = socket.write_all(&response).await;
                let _ = socket.shutdown().await;
            });
        }
    });

    addr
}

fn text_response(status_line: &str, extra_headers: &str, body: &str) -> Vec<u8> {
    format!(
        "HTTP/1.1 {}\r\nContent-Length: {}\r\nConnection: close\r\n{}\r\n{}",
        status_line,
        body.len(),
        extra_headers,
        body
    )
    .into_bytes()
}

/// Seed a route for the router's own authority once its port is known.
fn register_backend(cache: &RouteCache, router: SocketAddr, backend: SocketAddr) {
    cache.put(
        &format!("127.0.0.1:{}", router.port()),
        vec![BackendDescriptor {
            host: backend.ip().to_string(),
            port: backend.port(),
            secure: false,
        }],
    );
}

#[tokio::test]
async fn forwarding_headers_reach_the_backend() {
    let backend = start_backend(|head, _| text_response("200 OK", "", &head)).await;
    let cache = Arc::new(RouteCache::new());
    let router = start_router(cache.clone(), Config::default()).await;
    register_backend(&cache, router, backend);

    let response = reqwest::get(format!("http://{}/get?a=1&b=2", router))
        .await
        .unwrap();
    assert_eq!(response.status(), 200);

    let echoed_head = response.text().await.unwrap();
    assert!(echoed_head.starts_with("GET /get?a=1&b=2 HTTP/1.1"));
    assert!(echoed_head.contains("x-forwarded-host: 127.0.0.1"));
    assert!(echoed_head.contains(&format!("x-forwarded-port: {}", router.port())));
    assert!(echoed_head.contains("x-forwarded-proto: http"));
    assert!(echoed_head.contains("x-forwarded-for: 127.0.0.1:"));

    let request_id = echoed_head
        .lines()
        .find_map(|line| line.strip_prefix("x-openaperture-request-id: "))
        .expect("request id header missing");
    assert_eq!(request_id.len(), 32);
    assert!(request_id.chars().all(|c| c.is_ascii_hexdigit()));
}

#[tokio::test]
async fn client_supplied_request_id_is_preserved() {
    let backend = start_backend(|head, _| text_response("200 OK", "", &head)).await;
    let cache = Arc::new(RouteCache::new());
    let router = start_router(cache.clone(), Config::default()).await;
    register_backend(&cache, router, backend);

    let supplied = "c0ffee00c0ffee00c0ffee00c0ffee00";
    let client = reqwest::Client::new();
    let response = client
        .get(format!("http://{}/", router))
        .header("X-OpenAperture-Request-ID", supplied)
        .send()
        .await
        .unwrap();

    let echoed_head = response.text().await.unwrap();
    assert!(echoed_head.contains(&format!("x-openaperture-request-id: {}", supplied)));
    assert_eq!(
        echoed_head.matches("x-openaperture-request-id").count(),
        1,
        "request id must not be duplicated"
    );
}

#[tokio::test]
async fn unknown_authority_yields_503_with_empty_body() {
    let router = start_router(Arc::new(RouteCache::new()), Config::default()).await;

    let response = reqwest::get(format!("http://{}/anything", router))
        .await
        .unwrap();
    assert_eq!(response.status(), 503);
    assert!(response.bytes().await.unwrap().is_empty());
}

#[tokio::test]
async fn request_body_is_streamed_through_to_the_backend() {
    // Large enough to cross several 4096-byte reads.
    let payload: Vec<u8> = (0..1_000_000u32).map(|i| (i % 251) as u8).collect();

    let backend = start_backend(|_, body| {
        let mut response = format!(
            "HTTP/1.1 200 OK\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
            body.len()
        )
        .into_bytes();
        response.extend_from_slice(&body);
        response
    })
    .await;

    let cache = Arc::new(RouteCache::new());
    let router = start_router(cache.clone(), Config::default()).await;
    register_backend(&cache, router, backend);

    let client = reqwest::Client::new();
    let response = client
        .post(format!("http://{}/echo", router))
        .body(payload.clone())
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), 200);
    let echoed = response.bytes().await.unwrap();
    assert_eq!(echoed.len(), payload.len());
    assert_eq!(&echoed[..], &payload[..], "echoed body must match byte-for-byte");
}

#[tokio::test]
async fn chunked_response_is_forwarded_chunk_by_chunk() {
    let backend = start_backend(|_, _| {
        let mut response =
            b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\nConnection: close\r\n\r\n".to_vec();
        for chunk in ["hello", " ", "streamed", " ", "world"] {
            response.extend_from_slice(format!("{:x}\r\n{}\r\n", chunk.len(), chunk).as_bytes());
        }
        response.extend_from_slice(b"0\r\n\r\n");
        response
    })
    .await;

    let cache = Arc::new(RouteCache::new());
    let router = start_router(cache.clone(), Config::default()).await;
    register_backend(&cache, router, backend);

    let response = reqwest::get(format!("http://{}/stream", router)).await.unwrap();
    assert_eq!(response.status(), 200);
    assert_eq!(response.text().await.unwrap(), "hello streamed world");
}

#[tokio::test]
async fn bodyless_204_returns_immediately_without_a_done_event() {
    // Replies 204 and keeps the connection open, so a proxy waiting for
    // end-of-body would hang until its own timeout.
    let backend = {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            loop {
                let Ok((mut socket, _)) = listener.accept().await else {
                    break;
                };
                tokio::spawn(async move {
                    let _ = read_request(&mut socket).await;
                    let _ = socket
                        .write_all(b"HTTP/1.1 204 No Content\r\nServer: mock\r\n\r\n")
                        .await;
                    tokio::time::sleep(Duration::from_secs(10)).await;
                });
            }
        });
        addr
    };

    let cache = Arc::new(RouteCache::new());
    let router = start_router(cache.clone(), Config::default()).await;
    register_backend(&cache, router, backend);

    let started = Instant::now();
    let response = reqwest::get(format!("http://{}/missing", router)).await.unwrap();
    assert_eq!(response.status(), 204);
    assert!(response.bytes().await.unwrap().is_empty());
    assert!(
        started.elapsed() < Duration::from_secs(5),
        "204 must not wait for a body that never arrives"
    );
}

#[tokio::test]
async fn duplicate_response_headers_are_deduplicated() {
    let backend = start_backend(|_, _| {
        text_response(
            "200 OK",
            "Server: Cowboy\r\nServer: nginx\r\n",
            "deduped",
        )
    })
    .await;

    let cache = Arc::new(RouteCache::new());
    let router = start_router(cache.clone(), Config::default()).await;
    register_backend(&cache, router, backend);

    let response = reqwest::get(format!("http://{}/", router)).await.unwrap();
    assert_eq!(response.status(), 200);

    let servers: Vec<_> = response.headers().get_all("server").iter().collect();
    assert_eq!(servers.len(), 1, "duplicate Server headers must collapse");
    assert_eq!(servers[0], "nginx");

    assert_eq!(response.text().await.unwrap(), "deduped");
}

#[tokio::test]
async fn unresponsive_backend_times_out_with_504() {
    // Accepts connections but never responds.
    let backend = {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            loop {
                let Ok((mut socket, _)) = listener.accept().await else {
                    break;
                };
                tokio::spawn(async move {
                    let _ = read_request(&mut socket).await;
                    tokio::time::sleep(Duration::from_secs(30)).await;
                });
            }
        });
        addr
    };

    let mut config = Config::default();
    config.timeouts.waiting_for_response_ms = 250;

    let cache = Arc::new(RouteCache::new());
    let router = start_router(cache.clone(), config).await;
    register_backend(&cache, router, backend);

    let response = reqwest::get(format!("http://{}/slow", router)).await.unwrap();
    assert_eq!(response.status(), 504);
}

#[tokio::test]
async fn refused_backend_yields_503() {
    // Bind and drop so the port refuses connections.
    let backend = {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap()
    };

    let cache = Arc::new(RouteCache::new());
    let router = start_router(cache.clone(), Config::default()).await;
    register_backend(&cache, router, backend);

    let response = reqwest::get(format!("http://{}/", router)).await.unwrap();
    assert_eq!(response.status(), 503);
}

#[tokio::test]
async fn status_check_reflects_refresh_staleness() {
    let cache = Arc::new(RouteCache::new());

    // A router whose clock has never advanced reports unavailable.
    let config = Config::default();
    let logger = Arc::new(Logger::new(&config.logging.access_log).unwrap());
    let clock = Arc::new(RefreshClock::new());
    let state = AppState {
        engine: Arc::new(ProxyEngine::new(&config, cache, logger).unwrap()),
        clock: clock.clone(),
    };
    let app = engine::router(state, config.server.max_connections);
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .await
        .unwrap();
    });

    let url = format!("http://{}/openaperture_router_status_check", addr);
    let response = reqwest::get(&url).await.unwrap();
    assert_eq!(response.status(), 503);

    clock.mark(unix_now());
    let response = reqwest::get(&url).await.unwrap();
    assert_eq!(response.status(), 200);
}
