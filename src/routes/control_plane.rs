use std::collections::HashMap;
use std::time::{Duration, Instant};

use serde::Deserialize;
use tokio::sync::Mutex;
use tracing::debug;

use crate::config::RouteServerConfig;
use crate::error::{Result, RouterError};

use super::BackendDescriptor;

/// Wire format of one backend in a route-server payload.
#[derive(Debug, Deserialize)]
struct RouteEntry {
    hostname: String,
    port: u16,
    secure_connection: bool,
}

impl From<RouteEntry> for BackendDescriptor {
    fn from(entry: RouteEntry) -> Self {
        BackendDescriptor {
            host: entry.hostname,
            port: entry.port,
            secure: entry.secure_connection,
        }
    }
}

/// A decoded route payload: the changed authorities and the server's
/// reconciliation timestamp.
#[derive(Debug)]
pub struct RoutePayload {
    pub routes: HashMap<String, Vec<BackendDescriptor>>,
    pub timestamp: u64,
}

#[derive(Debug, Deserialize)]
struct OauthTokenResponse {
    access_token: String,
    #[serde(default)]
    expires_in: Option<u64>,
}

struct CachedToken {
    token: String,
    expires_at: Instant,
}

/// Bearer-token source for the route server: either a fixed token from
/// configuration or an OAuth client-credentials exchange with caching.
enum TokenSource {
    Static(String),
    Oauth {
        oauth_url: String,
        client_id: String,
        client_secret: String,
        cached: Mutex<Option<CachedToken>>,
    },
}

/// Tokens are refreshed this long before their reported expiry.
const TOKEN_REFRESH_MARGIN: Duration = Duration::from_secs(60);

/// Fallback lifetime when the OAuth response omits `expires_in`.
const DEFAULT_TOKEN_LIFETIME: Duration = Duration::from_secs(300);

impl TokenSource {
    async fn bearer(&self, http: &reqwest::Client) -> Result<String> {
        match self {
            TokenSource::Static(token) => Ok(token.clone()),
            TokenSource::Oauth {
                oauth_url,
                client_id,
                client_secret,
                cached,
            } => {
                let mut guard = cached.lock().await;
                if let Some(entry) = guard.as_ref() {
                    if Instant::now() < entry.expires_at {
                        return Ok(entry.token.clone());
                    }
                }

                let response = http
                    .post(oauth_url)
                    .form(&[
                        ("grant_type", "client_credentials"),
                        ("client_id", client_id.as_str()),
                        ("client_secret", client_secret.as_str()),
                    ])
                    .send()
                    .await
                    .map_err(|e| RouterError::RouteRefresh(format!("OAuth request failed: {}", e)))?;

                if !response.status().is_success() {
                    return Err(RouterError::RouteRefresh(format!(
                        "OAuth endpoint returned {}",
                        response.status()
                    )));
                }

                let body: OauthTokenResponse = response
                    .json()
                    .await
                    .map_err(|e| RouterError::RouteRefresh(format!("OAuth response unreadable: {}", e)))?;

                let lifetime = body
                    .expires_in
                    .map(Duration::from_secs)
                    .unwrap_or(DEFAULT_TOKEN_LIFETIME);
                let expires_at = Instant::now() + lifetime.saturating_sub(TOKEN_REFRESH_MARGIN);

                let token = body.access_token;
                *guard = Some(CachedToken {
                    token: token.clone(),
                    expires_at,
                });
                Ok(token)
            }
        }
    }
}

/// HTTP client for the control-plane route service.
pub struct RouteServerClient {
    http: reqwest::Client,
    base_url: String,
    tokens: TokenSource,
}

impl RouteServerClient {
    pub fn new(config: &RouteServerConfig) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .timeout(Duration::from_secs(30))
            .user_agent("openaperture-router/0.1")
            .build()
            .map_err(|e| anyhow::anyhow!("Failed to create route-server client: {}", e))?;

        let tokens = match &config.static_token {
            Some(token) => TokenSource::Static(token.clone()),
            None => TokenSource::Oauth {
                oauth_url: config.oauth_url.clone(),
                client_id: config.client_id.clone(),
                client_secret: config.client_secret.clone(),
                cached: Mutex::new(None),
            },
        };

        Ok(Self {
            http,
            base_url: config.url.trim_end_matches('/').to_string(),
            tokens,
        })
    }

    /// Fetch the full route table, or only the authorities changed since
    /// `updated_since` when given.
    pub async fn fetch_routes(&self, updated_since: Option<u64>) -> Result<RoutePayload> {
        let mut url = self.base_url.clone();
        if let Some(since) = updated_since {
            url.push_str(&format!("?updated_since={}", since));
        }

        let body = self.get_json(&url).await?;
        parse_route_payload(body)
    }

    /// Fetch authorities deleted since `updated_since`.
    pub async fn fetch_deleted(&self, updated_since: u64) -> Result<Vec<String>> {
        let url = format!("{}/deleted?updated_since={}", self.base_url, updated_since);
        let body = self.get_json(&url).await?;

        serde_json::from_value(body)
            .map_err(|e| RouterError::RouteRefresh(format!("Deleted list unreadable: {}", e)))
    }

    async fn get_json(&self, url: &str) -> Result<serde_json::Value> {
        let token = self.tokens.bearer(&self.http).await?;
        debug!(
            authority = crate::proxy::headers::extract_authority(url).unwrap_or("unknown"),
            url = %url,
            "Querying route server"
        );

        let response = self
            .http
            .get(url)
            .bearer_auth(token)
            .send()
            .await
            .map_err(|e| RouterError::RouteRefresh(format!("Route server unreachable: {}", e)))?;

        let status = response.status();
        if status != reqwest::StatusCode::OK {
            return Err(RouterError::RouteRefresh(format!(
                "Route server returned {}",
                status
            )));
        }

        response
            .json()
            .await
            .map_err(|e| RouterError::RouteRefresh(format!("Route server body unreadable: {}", e)))
    }
}

/// Decode a route payload: every key except `timestamp` is an authority
/// mapped to its backend list.
fn parse_route_payload(body: serde_json::Value) -> Result<RoutePayload> {
    let serde_json::Value::Object(map) = body else {
        return Err(RouterError::RouteRefresh(
            "Route payload is not a JSON object".to_string(),
        ));
    };

    let mut routes = HashMap::new();
    let mut timestamp = None;

    for (key, value) in map {
        if key == "timestamp" {
            timestamp = value.as_u64();
            continue;
        }

        let entries: Vec<RouteEntry> = serde_json::from_value(value).map_err(|e| {
            RouterError::RouteRefresh(format!("Backend list for '{}' unreadable: {}", key, e))
        })?;
        routes.insert(key, entries.into_iter().map(BackendDescriptor::from).collect());
    }

    let timestamp = timestamp.ok_or_else(|| {
        RouterError::RouteRefresh("Route payload missing 'timestamp'".to_string())
    })?;

    Ok(RoutePayload { routes, timestamp })
}
