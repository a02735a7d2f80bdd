use std::io;
use std::time::{Duration, Instant};

use axum::http::{HeaderMap, Method, StatusCode};
use bytes::Bytes;
use futures_util::StreamExt;
use reqwest::Url;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::ReceiverStream;
use tracing::debug;

use crate::config::Config;
use crate::error::{Result, RouterError};

/// Lifecycle events of one upstream exchange, delivered in order:
/// exactly one `InitialResponse` or `Error` first, then zero or more
/// `Chunk`s, then exactly one `Done` or `Error`.
#[derive(Debug)]
pub enum BackendEvent {
    InitialResponse {
        status: StatusCode,
        headers: HeaderMap,
        elapsed_us: u64,
    },
    Chunk(Bytes),
    Done {
        total_us: u64,
    },
    Error {
        reason: String,
        elapsed_us: u64,
    },
}

/// One in-flight upstream exchange: the request-body sender (while the
/// body is still open) and the ordered event channel. Dropping the
/// session aborts the exchange and closes the outbound socket.
pub struct BackendSession {
    events: mpsc::Receiver<BackendEvent>,
    body_tx: Option<mpsc::Sender<io::Result<Bytes>>>,
    started_at: Instant,
    task: JoinHandle<()>,
}

impl BackendSession {
    /// Write one request-body chunk. `is_last` finalizes the body and
    /// lets the exchange move on to awaiting the response.
    pub async fn send_chunk(&mut self, bytes: Bytes, is_last: bool) -> Result<u64> {
        let tx = self
            .body_tx
            .as_ref()
            .ok_or_else(|| RouterError::BackendIo("request body already finalized".to_string()))?;

        if !bytes.is_empty() {
            tx.send(Ok(bytes)).await.map_err(|_| {
                RouterError::BackendIo("backend stopped reading the request body".to_string())
            })?;
        }

        if is_last {
            // Dropping the sender ends the body stream.
            self.body_tx = None;
        }

        Ok(self.elapsed_us())
    }

    pub async fn next_event(&mut self) -> Option<BackendEvent> {
        self.events.recv().await
    }

    pub fn elapsed_us(&self) -> u64 {
        self.started_at.elapsed().as_micros() as u64
    }

    /// Forcibly terminate the exchange, closing the outbound connection.
    pub fn abort(&self) {
        self.task.abort();
    }
}

impl Drop for BackendSession {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Outbound HTTP client issuing one streamed request per session.
///
/// Two underlying clients are kept: one honoring the configured outbound
/// proxy and one connecting directly. HTTPS destinations and the local
/// development hosts bypass the proxy so loopback traffic never detours
/// through it.
pub struct BackendClient {
    direct: reqwest::Client,
    proxied: reqwest::Client,
}

const PROXY_BYPASS_HOSTS: [&str; 3] = ["localhost", "127.0.0.1", "lvh.me"];

impl BackendClient {
    pub fn new(config: &Config) -> anyhow::Result<Self> {
        let builder = |connect_timeout: Duration| {
            reqwest::Client::builder()
                .connect_timeout(connect_timeout)
                .pool_idle_timeout(Duration::from_secs(90))
                .pool_max_idle_per_host(20)
                .user_agent("openaperture-router/0.1")
        };

        let connect_timeout = config.timeouts.connecting();
        let direct = builder(connect_timeout)
            .no_proxy()
            .build()
            .map_err(|e| anyhow::anyhow!("Failed to create backend client: {}", e))?;

        let proxied = match &config.outbound_proxy.url {
            Some(url) => builder(connect_timeout)
                .proxy(
                    reqwest::Proxy::all(url)
                        .map_err(|e| anyhow::anyhow!("Invalid outbound proxy URL: {}", e))?,
                )
                .build()
                .map_err(|e| anyhow::anyhow!("Failed to create proxied backend client: {}", e))?,
            None => direct.clone(),
        };

        Ok(Self { direct, proxied })
    }

    fn client_for(&self, url: &Url) -> &reqwest::Client {
        if bypasses_outbound_proxy(url) {
            &self.direct
        } else {
            &self.proxied
        }
    }

    /// Open one upstream exchange. The request line and headers go out as
    /// soon as the connection is ready; when `has_body` is set the caller
    /// must stream chunks through [`BackendSession::send_chunk`].
    pub fn start(
        &self,
        method: Method,
        url: String,
        headers: HeaderMap,
        has_body: bool,
    ) -> Result<BackendSession> {
        let url = Url::parse(&url).map_err(|e| RouterError::BackendStart(e.to_string()))?;
        let client = self.client_for(&url).clone();
        let started_at = Instant::now();

        let mut builder = client.request(method, url).headers(headers);

        let body_tx = if has_body {
            let (tx, rx) = mpsc::channel::<io::Result<Bytes>>(32);
            builder = builder.body(reqwest::Body::wrap_stream(ReceiverStream::new(rx)));
            Some(tx)
        } else {
            None
        };

        let request = builder
            .build()
            .map_err(|e| RouterError::BackendStart(e.to_string()))?;

        let (event_tx, event_rx) = mpsc::channel(32);
        let task = tokio::spawn(drive_exchange(client, request, event_tx, started_at));

        Ok(BackendSession {
            events: event_rx,
            body_tx,
            started_at,
            task,
        })
    }
}

fn bypasses_outbound_proxy(url: &Url) -> bool {
    if url.scheme() == "https" {
        return true;
    }
    matches!(url.host_str(), Some(host) if PROXY_BYPASS_HOSTS.contains(&host))
}

/// Drive one upstream exchange, translating the response into the
/// ordered event sequence. Runs until the response is fully consumed or
/// the session is aborted.
async fn drive_exchange(
    client: reqwest::Client,
    request: reqwest::Request,
    events: mpsc::Sender<BackendEvent>,
    started_at: Instant,
) {
    let elapsed = |instant: Instant| instant.elapsed().as_micros() as u64;

    let response = match client.execute(request).await {
        Ok(response) => response,
        Err(e) => {
            let _ = events
                .send(BackendEvent::Error {
                    reason: e.to_string(),
                    elapsed_us: elapsed(started_at),
                })
                .await;
            return;
        }
    };

    let initial = BackendEvent::InitialResponse {
        status: response.status(),
        headers: response.headers().clone(),
        elapsed_us: elapsed(started_at),
    };
    if events.send(initial).await.is_err() {
        return;
    }

    let mut stream = response.bytes_stream();
    while let Some(item) = stream.next().await {
        match item {
            Ok(chunk) => {
                if events.send(BackendEvent::Chunk(chunk)).await.is_err() {
                    return;
                }
            }
            Err(e) => {
                debug!(error = %e, "Backend response stream failed");
                let _ = events
                    .send(BackendEvent::Error {
                        reason: e.to_string(),
                        elapsed_us: elapsed(started_at),
                    })
                    .await;
                return;
            }
        }
    }

    let _ = events
        .send(BackendEvent::Done {
            total_us: elapsed(started_at),
        })
        .await;
}
