use std::sync::Arc;

use dashmap::DashMap;
use rand::Rng;

use super::BackendDescriptor;

/// In-memory authority -> backend-list mapping.
///
/// Reads stay lock-free on the request path; the refresher is the only
/// writer and replaces whole entries atomically. Entries have no TTL:
/// staleness is managed entirely by the refresh loop.
#[derive(Debug, Default)]
pub struct RouteCache {
    table: DashMap<String, Arc<Vec<BackendDescriptor>>>,
}

impl RouteCache {
    pub fn new() -> Self {
        Self {
            table: DashMap::new(),
        }
    }

    /// Replace the backend list for an authority.
    ///
    /// An empty list is never stored: it removes the entry instead, so a
    /// lookup can only ever observe a non-empty list or nothing.
    pub fn put(&self, authority: &str, backends: Vec<BackendDescriptor>) {
        let key = authority.to_ascii_lowercase();
        if backends.is_empty() {
            self.table.remove(&key);
        } else {
            self.table.insert(key, Arc::new(backends));
        }
    }

    pub fn delete(&self, authority: &str) {
        self.table.remove(&authority.to_ascii_lowercase());
    }

    pub fn get(&self, authority: &str) -> Option<Arc<Vec<BackendDescriptor>>> {
        self.table
            .get(&authority.to_ascii_lowercase())
            .map(|entry| entry.value().clone())
    }

    /// Pick one backend for the authority, uniformly at random when more
    /// than one is registered.
    pub fn select(&self, authority: &str) -> Option<BackendDescriptor> {
        let backends = self.get(authority)?;
        let chosen = if backends.len() == 1 {
            &backends[0]
        } else {
            let idx = rand::thread_rng().gen_range(0..backends.len());
            &backends[idx]
        };
        Some(chosen.clone())
    }

    pub fn len(&self) -> usize {
        self.table.len()
    }

    pub fn is_empty(&self) -> bool {
        self.table.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn backend(host: &str, port: u16) -> BackendDescriptor {
        BackendDescriptor {
            host: host.to_string(),
            port,
            secure: false,
        }
    }

    #[test]
    fn get_returns_last_put_not_superseded_by_delete() {
        let cache = RouteCache::new();

        cache.put("app:8080", vec![backend("one", 4001)]);
        cache.put("app:8080", vec![backend("two", 4002)]);
        assert_eq!(cache.get("app:8080").unwrap()[0].host, "two");

        cache.delete("app:8080");
        assert!(cache.get("app:8080").is_none());

        cache.put("app:8080", vec![backend("three", 4003)]);
        assert_eq!(cache.get("app:8080").unwrap()[0].host, "three");
    }

    #[test]
    fn lookups_are_case_insensitive_on_host() {
        let cache = RouteCache::new();
        cache.put("App.Example.Com:8080", vec![backend("one", 4001)]);
        assert!(cache.get("app.example.com:8080").is_some());
        assert!(cache.select("APP.EXAMPLE.COM:8080").is_some());
    }

    #[test]
    fn empty_put_behaves_like_delete() {
        let cache = RouteCache::new();
        cache.put("app:8080", vec![backend("one", 4001)]);
        cache.put("app:8080", vec![]);
        assert!(cache.get("app:8080").is_none());
        assert!(cache.select("app:8080").is_none());
    }

    #[test]
    fn select_returns_member_of_registered_list() {
        let cache = RouteCache::new();
        let backends = vec![backend("a", 1), backend("b", 2), backend("c", 3)];
        cache.put("app:8080", backends.clone());

        for _ in 0..50 {
            let chosen = cache.select("app:8080").unwrap();
            assert!(backends.contains(&chosen));
        }
    }

    #[test]
    fn select_on_unknown_authority_is_none() {
        let cache = RouteCache::new();
        assert!(cache.select("ghost:8080").is_none());
    }

    #[test]
    fn sole_backend_is_always_selected() {
        let cache = RouteCache::new();
        cache.put("app:8080", vec![backend("only", 4001)]);
        for _ in 0..10 {
            assert_eq!(cache.select("app:8080").unwrap().host, "only");
        }
    }
}
