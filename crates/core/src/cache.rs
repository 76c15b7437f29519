//! Memo of version scans.

use optiflux_common::{Environment, VersionSummary};
use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};

/// Short-lived memo of version listings keyed by `(env, model)`.
#[derive(Debug)]
pub struct VersionCache {
    ttl: Duration,
    entries: Mutex<HashMap<(Environment, String), (Instant, Vec<VersionSummary>)>>,
}

impl VersionCache {
    /// A cache keeping entries for `ttl`. A zero `ttl` disables it.
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Listing stored less than `ttl` ago.
    pub fn get(&self, env: Environment, model: &str) -> Option<Vec<VersionSummary>> {
        if self.ttl.is_zero() {
            return None;
        }
        let entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        entries
            .get(&(env, model.to_string()))
            .filter(|(stored_at, _)| stored_at.elapsed() < self.ttl)
            .map(|(_, versions)| versions.clone())
    }

    /// Stores a listing.
    pub fn insert(&self, env: Environment, model: &str, versions: Vec<VersionSummary>) {
        if self.ttl.is_zero() {
            return;
        }
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert((env, model.to_string()), (Instant::now(), versions));
    }

    /// Drops the listing of one model.
    pub fn invalidate(&self, env: Environment, model: &str) {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&(env, model.to_string()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn summary(version: &str) -> VersionSummary {
        VersionSummary {
            version: version.to_string(),
            timestamp: None,
            size: 1,
            is_serving: false,
            services: std::collections::BTreeMap::new(),
        }
    }

    #[test]
    fn hit_until_invalidated() {
        let cache = VersionCache::new(Duration::from_secs(60));
        cache.insert(Environment::Dev, "m1", vec![summary("1.0.0")]);
        assert_eq!(cache.get(Environment::Dev, "m1").map(|v| v.len()), Some(1));
        assert!(cache.get(Environment::Prod, "m1").is_none());
        cache.invalidate(Environment::Dev, "m1");
        assert!(cache.get(Environment::Dev, "m1").is_none());
    }

    #[test]
    fn expired_entries_miss() {
        let cache = VersionCache::new(Duration::from_millis(20));
        cache.insert(Environment::Dev, "m1", vec![summary("1.0.0")]);
        std::thread::sleep(Duration::from_millis(40));
        assert!(cache.get(Environment::Dev, "m1").is_none());
    }

    #[test]
    fn zero_ttl_disables_caching() {
        let cache = VersionCache::new(Duration::ZERO);
        cache.insert(Environment::Dev, "m1", vec![summary("1.0.0")]);
        assert!(cache.get(Environment::Dev, "m1").is_none());
    }
}
