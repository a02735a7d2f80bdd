use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Main configuration structure
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub route_server: RouteServerConfig,
    pub timeouts: TimeoutConfig,
    pub outbound_proxy: OutboundProxyConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Maximum requests handled concurrently.
    pub max_connections: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
            max_connections: 100,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct RouteServerConfig {
    /// Base URL of the control-plane route service.
    pub url: String,

    /// Refresh interval in milliseconds.
    pub ttl_ms: u64,

    /// OAuth client-credentials used to obtain bearer tokens.
    pub client_id: String,
    pub client_secret: String,
    pub oauth_url: String,

    /// Fixed bearer token; when set, OAuth is skipped entirely.
    pub static_token: Option<String>,
}

impl Default for RouteServerConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            ttl_ms: 60_000,
            client_id: String::new(),
            client_secret: String::new(),
            oauth_url: String::new(),
            static_token: None,
        }
    }
}

impl RouteServerConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_millis(self.ttl_ms)
    }
}

/// Per-stage timeouts for one proxied request, all in milliseconds.
///
/// Each value bounds a single inter-event wait, not the request as a whole.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct TimeoutConfig {
    pub connecting_ms: u64,
    pub sending_request_body_ms: u64,
    pub waiting_for_response_ms: u64,
    pub receiving_response_ms: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            connecting_ms: 5_000,
            sending_request_body_ms: 60_000,
            waiting_for_response_ms: 60_000,
            receiving_response_ms: 60_000,
        }
    }
}

impl TimeoutConfig {
    pub fn connecting(&self) -> Duration {
        Duration::from_millis(self.connecting_ms)
    }

    pub fn sending_request_body(&self) -> Duration {
        Duration::from_millis(self.sending_request_body_ms)
    }

    pub fn waiting_for_response(&self) -> Duration {
        Duration::from_millis(self.waiting_for_response_ms)
    }

    pub fn receiving_response(&self) -> Duration {
        Duration::from_millis(self.receiving_response_ms)
    }
}

/// Outbound HTTP proxy applied to backend requests, with the loopback
/// bypass described in the backend client.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct OutboundProxyConfig {
    pub url: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub access_log: AccessLogConfig,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            access_log: AccessLogConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct AccessLogConfig {
    pub enabled: bool,
    /// "json" or "common"
    pub format: String,
    /// "stdout" or a file path
    pub output: String,
}

impl Default for AccessLogConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            format: "json".to_string(),
            output: "stdout".to_string(),
        }
    }
}

impl Config {
    /// Load configuration from file
    pub async fn load(path: &str) -> Result<Self> {
        let content = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("Failed to read config file: {}", path))?;

        let config: Config = serde_yaml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path))?;

        config.validate()?;
        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.server.port == 0 {
            anyhow::bail!("Server port cannot be zero");
        }

        if self.server.max_connections == 0 {
            anyhow::bail!("max_connections cannot be zero");
        }

        if self.route_server.url.is_empty() {
            anyhow::bail!("route_server.url must be set");
        }

        if self.route_server.ttl_ms == 0 {
            anyhow::bail!("route_server.ttl_ms cannot be zero");
        }

        if self.route_server.static_token.is_none() {
            if self.route_server.oauth_url.is_empty() {
                anyhow::bail!("route_server.oauth_url must be set when no static token is configured");
            }
            if self.route_server.client_id.is_empty() || self.route_server.client_secret.is_empty() {
                anyhow::bail!("route_server client credentials must be set when no static token is configured");
            }
        }

        let t = &self.timeouts;
        for (name, value) in [
            ("connecting_ms", t.connecting_ms),
            ("sending_request_body_ms", t.sending_request_body_ms),
            ("waiting_for_response_ms", t.waiting_for_response_ms),
            ("receiving_response_ms", t.receiving_response_ms),
        ] {
            if value == 0 {
                anyhow::bail!("timeouts.{} cannot be zero", name);
            }
        }

        match self.logging.access_log.format.as_str() {
            "json" | "common" => {}
            other => anyhow::bail!("Unknown access log format: {}", other),
        }

        Ok(())
    }
}
