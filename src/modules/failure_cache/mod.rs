//! Negative cache for permanently rejected requests.
//!
//! A request that came back 404 (or another non-retryable 4xx) is remembered
//! for a while, so repeating it within that window costs no network call and
//! does not count against the circuit.

use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use serde::Serialize;
use tokio::time::Instant;

use crate::config::FailureCacheSettings;
use crate::modules::transport::{RawResponse, RequestSpec};

#[derive(Debug, Clone)]
struct CachedFailure {
    response: RawResponse,
    expires_at: Instant,
}

#[derive(Debug, Default)]
struct CacheState {
    entries: HashMap<String, CachedFailure>,
    // Least recently used first.
    order: VecDeque<String>,
    hits: u64,
    misses: u64,
    evictions: u64,
}

impl CacheState {
    fn touch(&mut self, key: &str) {
        if let Some(position) = self.order.iter().position(|k| k == key) {
            if let Some(k) = self.order.remove(position) {
                self.order.push_back(k);
            }
        }
    }

    fn forget(&mut self, key: &str) {
        self.entries.remove(key);
        self.order.retain(|k| k != key);
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct FailureCacheStats {
    pub size: usize,
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
}

#[derive(Debug)]
pub struct FailureCache {
    settings: FailureCacheSettings,
    state: Mutex<CacheState>,
}

impl FailureCache {
    pub fn new(settings: FailureCacheSettings) -> Self {
        Self {
            settings,
            state: Mutex::new(CacheState::default()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, CacheState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn ttl_for(&self, status: u16) -> Option<Duration> {
        match status {
            404 => Some(Duration::from_millis(self.settings.not_found_ttl_ms)),
            400..=499 => Some(Duration::from_millis(self.settings.client_error_ttl_ms)),
            _ => None,
        }
    }

    /// Cached rejection for this request, if still fresh.
    pub fn lookup(&self, request: &RequestSpec) -> Option<RawResponse> {
        if !self.settings.enabled {
            return None;
        }
        let key = request.cache_key();
        let mut state = self.lock();
        let cached = state.entries.get(&key).cloned();
        let fresh = match cached {
            Some(entry) if Instant::now() < entry.expires_at => Some(entry.response),
            Some(_) => {
                state.forget(&key);
                None
            }
            None => None,
        };

        match fresh {
            Some(response) => {
                state.hits += 1;
                state.touch(&key);
                log::debug!("failure cache hit for {key} ({})", response.status);
                Some(response)
            }
            None => {
                state.misses += 1;
                None
            }
        }
    }

    /// Remember a non-retryable response. Other statuses are ignored.
    pub fn store(&self, request: &RequestSpec, response: &RawResponse) {
        if !self.settings.enabled {
            return;
        }
        let Some(ttl) = self.ttl_for(response.status) else {
            return;
        };

        let key = request.cache_key();
        let mut state = self.lock();
        state.forget(&key);
        while state.entries.len() >= self.settings.max_entries {
            let Some(oldest) = state.order.pop_front() else {
                break;
            };
            state.entries.remove(&oldest);
            state.evictions += 1;
        }
        state.entries.insert(
            key.clone(),
            CachedFailure {
                response: response.clone(),
                expires_at: Instant::now() + ttl,
            },
        );
        state.order.push_back(key);
    }

    pub fn clear(&self) {
        let mut state = self.lock();
        state.entries.clear();
        state.order.clear();
    }

    pub fn stats(&self) -> FailureCacheStats {
        let state = self.lock();
        FailureCacheStats {
            size: state.entries.len(),
            hits: state.hits,
            misses: state.misses,
            evictions: state.evictions,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use url::Url;

    fn request(path: &str) -> RequestSpec {
        RequestSpec::get(Url::parse(&format!("https://api.encar.example/{path}")).unwrap())
    }

    fn response(status: u16) -> RawResponse {
        RawResponse::new(status, Url::parse("https://api.encar.example/").unwrap())
    }

    fn cache(max_entries: usize) -> FailureCache {
        FailureCache::new(FailureCacheSettings {
            max_entries,
            ..FailureCacheSettings::default()
        })
    }

    #[tokio::test(start_paused = true)]
    async fn not_found_is_cached_for_five_minutes() {
        let cache = cache(10);
        let req = request("car/1");
        cache.store(&req, &response(404));
        assert_eq!(cache.lookup(&req).unwrap().status, 404);

        tokio::time::advance(Duration::from_secs(299)).await;
        assert!(cache.lookup(&req).is_some());
        tokio::time::advance(Duration::from_secs(2)).await;
        assert!(cache.lookup(&req).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn other_client_errors_expire_after_a_minute() {
        let cache = cache(10);
        let req = request("car/2");
        cache.store(&req, &response(410));
        tokio::time::advance(Duration::from_secs(61)).await;
        assert!(cache.lookup(&req).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn retryable_statuses_are_not_cached() {
        let cache = cache(10);
        let req = request("car/3");
        cache.store(&req, &response(503));
        cache.store(&req, &response(200));
        assert!(cache.lookup(&req).is_none());
        assert_eq!(cache.stats().size, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn evicts_least_recently_used() {
        let cache = cache(2);
        let (a, b, c) = (request("a"), request("b"), request("c"));
        cache.store(&a, &response(404));
        cache.store(&b, &response(404));
        cache.lookup(&a);
        cache.store(&c, &response(404));

        assert!(cache.lookup(&a).is_some());
        assert!(cache.lookup(&b).is_none());
        assert!(cache.lookup(&c).is_some());
        let stats = cache.stats();
        assert_eq!(stats.evictions, 1);
        assert_eq!(stats.size, 2);
    }
}
