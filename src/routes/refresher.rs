use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use tracing::{debug, info, warn};

use crate::error::Result;

use super::{RouteCache, RouteServerClient};

/// Unix-second timestamp of the last successful route reconciliation.
///
/// Zero means "never": the value a fresh process starts with, and the one
/// the health check reports as unavailable. Written only by the refresher,
/// read lock-free by the health endpoint.
#[derive(Debug, Default)]
pub struct RefreshClock {
    last: AtomicU64,
}

impl RefreshClock {
    pub fn new() -> Self {
        Self {
            last: AtomicU64::new(0),
        }
    }

    pub fn mark(&self, timestamp: u64) {
        self.last.store(timestamp, Ordering::Relaxed);
    }

    /// Last successful refresh, or `None` if none has completed yet.
    pub fn last_refresh(&self) -> Option<u64> {
        match self.last.load(Ordering::Relaxed) {
            0 => None,
            ts => Some(ts),
        }
    }

    /// Seconds elapsed since the last successful refresh.
    pub fn age_secs(&self) -> Option<u64> {
        let last = self.last_refresh()?;
        Some(unix_now().saturating_sub(last))
    }
}

pub fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Background reconciliation loop against the control plane.
///
/// Starts in a bootstrapping state (full fetch on every tick until one
/// succeeds), then switches to incremental reconciliation: deletes first,
/// then updates, so an update in the same interval wins over a delete.
/// A failed iteration is logged and retried on the next tick; the loop
/// itself never exits.
pub struct RouteRefresher {
    cache: Arc<RouteCache>,
    client: RouteServerClient,
    clock: Arc<RefreshClock>,
}

impl RouteRefresher {
    pub fn new(cache: Arc<RouteCache>, client: RouteServerClient, clock: Arc<RefreshClock>) -> Self {
        Self {
            cache,
            client,
            clock,
        }
    }

    pub async fn run(self, interval: std::time::Duration) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            ticker.tick().await;
            if let Err(e) = self.refresh_once().await {
                warn!(error = %e, "Route refresh failed; keeping previous table");
            }
        }
    }

    /// One reconciliation step: a full fetch while bootstrapping, an
    /// incremental delete+update pass afterwards.
    pub async fn refresh_once(&self) -> Result<()> {
        match self.clock.last_refresh() {
            None => self.bootstrap().await,
            Some(since) => self.reconcile(since).await,
        }
    }

    async fn bootstrap(&self) -> Result<()> {
        let payload = self.client.fetch_routes(None).await?;

        let authorities = payload.routes.len();
        for (authority, backends) in payload.routes {
            self.cache.put(&authority, backends);
        }

        self.clock.mark(payload.timestamp);
        info!(
            authorities,
            timestamp = payload.timestamp,
            "Route table bootstrapped"
        );
        Ok(())
    }

    async fn reconcile(&self, since: u64) -> Result<()> {
        // Deletes are applied before updates so that an authority both
        // deleted and re-registered in the same window stays routable.
        let deleted = self.client.fetch_deleted(since).await?;
        for authority in &deleted {
            self.cache.delete(authority);
        }

        let payload = self.client.fetch_routes(Some(since)).await?;
        let updated = payload.routes.len();
        for (authority, backends) in payload.routes {
            self.cache.put(&authority, backends);
        }

        self.clock.mark(payload.timestamp);
        debug!(
            deleted = deleted.len(),
            updated,
            timestamp = payload.timestamp,
            cached = self.cache.len(),
            "Route table reconciled"
        );
        Ok(())
    }
}
