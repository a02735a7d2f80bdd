use std::sync::Arc;
use std::time::Instant;

use anyhow::Result;
use chrono::{DateTime, Utc};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::warn;

use crate::config::AccessLogConfig;

/// One access-log line per completed request. Durations are measured in
/// microseconds and reported in milliseconds; `overhead_ms` is the time
/// spent inside the router itself (total minus backend).
#[derive(Debug, Clone, serde::Serialize)]
pub struct AccessLogEntry {
    pub timestamp: DateTime<Utc>,
    pub client_ip: String,
    pub method: String,
    pub uri: String,
    pub authority: String,
    pub request_id: String,
    pub status: u16,
    pub outcome: &'static str,
    pub total_ms: f64,
    pub overhead_ms: f64,
}

enum Output {
    Stdout,
    File(Arc<Mutex<tokio::fs::File>>),
}

/// Access logger writing JSON lines or common-log-style lines to stdout
/// or a file.
pub struct Logger {
    config: AccessLogConfig,
    output: Output,
}

impl Logger {
    pub fn new(config: &AccessLogConfig) -> Result<Self> {
        let output = if config.output == "stdout" {
            Output::Stdout
        } else {
            if let Some(parent) = std::path::Path::new(&config.output).parent() {
                std::fs::create_dir_all(parent)?;
            }
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&config.output)?;
            Output::File(Arc::new(Mutex::new(tokio::fs::File::from_std(file))))
        };

        Ok(Self {
            config: config.clone(),
            output,
        })
    }

    pub async fn log_request(&self, entry: AccessLogEntry) {
        if !self.config.enabled {
            return;
        }

        let line = match self.config.format.as_str() {
            "common" => format!(
                "{} - - [{}] \"{} {} HTTP/1.1\" {} {:.3}ms (router {:.3}ms)\n",
                entry.client_ip,
                entry.timestamp.format("%d/%b/%Y:%H:%M:%S %z"),
                entry.method,
                entry.uri,
                entry.status,
                entry.total_ms,
                entry.overhead_ms,
            ),
            _ => format!("{}\n", serde_json::to_string(&entry).unwrap_or_default()),
        };

        match &self.output {
            Output::Stdout => print!("{}", line),
            Output::File(writer) => {
                let mut file = writer.lock().await;
                if let Err(e) = file.write_all(line.as_bytes()).await {
                    warn!(error = %e, "Failed to write access log line");
                }
            }
        }
    }
}

/// Per-request handle that produces exactly one access-log line when the
/// request reaches its terminal state. Consuming `finish` makes a second
/// line unrepresentable, including on the streamed-response paths where
/// completion happens inside the response body.
pub struct RequestLog {
    logger: Arc<Logger>,
    client_ip: String,
    method: String,
    uri: String,
    authority: String,
    request_id: String,
    started_at: Instant,
}

impl RequestLog {
    pub fn new(
        logger: Arc<Logger>,
        client_ip: String,
        method: String,
        uri: String,
        authority: String,
        started_at: Instant,
    ) -> Self {
        Self {
            logger,
            client_ip,
            method,
            uri,
            authority,
            request_id: String::new(),
            started_at,
        }
    }

    pub fn set_request_id(&mut self, request_id: String) {
        self.request_id = request_id;
    }

    pub async fn finish(self, status: u16, outcome: &'static str, backend_us: u64) {
        let total_us = self.started_at.elapsed().as_micros() as u64;
        let entry = AccessLogEntry {
            timestamp: Utc::now(),
            client_ip: self.client_ip,
            method: self.method,
            uri: self.uri,
            authority: self.authority,
            request_id: self.request_id,
            status,
            outcome,
            total_ms: total_us as f64 / 1_000.0,
            overhead_ms: total_us.saturating_sub(backend_us) as f64 / 1_000.0,
        };
        self.logger.log_request(entry).await;
    }
}
