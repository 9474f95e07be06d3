// Process-wide cache for list-models results, keyed by (backend, provider).
// Reads take a short lock; a refresh is single-flight per key, and a stale
// value keeps being served while the refresh is in flight.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Mutex, OnceLock};
use std::time::{Duration, Instant};
use tokio::sync::watch;

use crate::adapter::ListModelsResult;
use crate::error::GatewayError;

pub const DEFAULT_TTL: Duration = Duration::from_secs(3600);

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub backend: String,
    pub provider: String,
}

impl CacheKey {
    pub fn new(backend: impl Into<String>, provider: impl Into<String>) -> Self {
        Self {
            backend: backend.into(),
            provider: provider.into(),
        }
    }
}

struct Entry {
    value: Option<(ListModelsResult, Instant)>,
    inflight: Option<watch::Receiver<bool>>,
}

pub struct ModelCache {
    ttl: Duration,
    entries: Mutex<HashMap<CacheKey, Entry>>,
}

enum Plan {
    Hit(ListModelsResult),
    Wait(watch::Receiver<bool>),
    Fetch(watch::Sender<bool>),
}

impl ModelCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Return the cached list for `key`, fetching through `fetch` when the
    /// entry is missing or expired. Concurrent callers of the same key share
    /// one underlying fetch; callers holding a stale value get it back
    /// immediately while the refresh runs.
    pub async fn get_or_fetch<F, Fut>(
        &self,
        key: CacheKey,
        fetch: F,
    ) -> Result<ListModelsResult, GatewayError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<ListModelsResult, GatewayError>>,
    {
        let mut fetch = Some(fetch);
        loop {
            let plan = {
                let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
                let entry = entries.entry(key.clone()).or_insert(Entry {
                    value: None,
                    inflight: None,
                });

                match (&entry.value, &entry.inflight) {
                    (Some((value, fetched_at)), _) if fetched_at.elapsed() < self.ttl => {
                        Plan::Hit(value.clone())
                    }
                    // Stale but a refresh is already running: serve stale.
                    (Some((value, _)), Some(_)) => Plan::Hit(value.clone()),
                    (None, Some(rx)) => Plan::Wait(rx.clone()),
                    (_, None) => {
                        let (tx, rx) = watch::channel(false);
                        entry.inflight = Some(rx);
                        Plan::Fetch(tx)
                    }
                }
            };

            match plan {
                Plan::Hit(value) => return Ok(value),
                Plan::Wait(mut rx) => {
                    // Wakes on completion or on the sender being dropped;
                    // either way, re-check the entry.
                    let _ = rx.changed().await;
                }
                Plan::Fetch(tx) => {
                    let Some(run) = fetch.take() else {
                        return Err(GatewayError::Config(
                            "model cache attempted a second fetch for one call".to_string(),
                        ));
                    };
                    let result = run().await;
                    {
                        let mut entries =
                            self.entries.lock().unwrap_or_else(|e| e.into_inner());
                        if let Some(entry) = entries.get_mut(&key) {
                            entry.inflight = None;
                            if let Ok(value) = &result {
                                entry.value = Some((value.clone(), Instant::now()));
                            }
                        }
                    }
                    let _ = tx.send(true);
                    return result;
                }
            }
        }
    }

    /// Peek without fetching.
    pub fn get(&self, key: &CacheKey) -> Option<ListModelsResult> {
        let entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries.get(key).and_then(|entry| {
            entry
                .value
                .as_ref()
                .filter(|(_, at)| at.elapsed() < self.ttl)
                .map(|(value, _)| value.clone())
        })
    }

    pub fn invalidate(&self, key: &CacheKey) {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(entry) = entries.get_mut(key) {
            entry.value = None;
        }
    }

    pub fn invalidate_all(&self) {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        for entry in entries.values_mut() {
            entry.value = None;
        }
    }
}

static MODEL_CACHE: OnceLock<ModelCache> = OnceLock::new();

/// The process-wide cache instance used by backend `list_models`
/// implementations. Initialized on first use with the default TTL.
pub fn model_cache() -> &'static ModelCache {
    MODEL_CACHE.get_or_init(|| ModelCache::new(DEFAULT_TTL))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::{ModelInfo, ModelSource};
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn listing(id: &str) -> ListModelsResult {
        ListModelsResult {
            models: vec![ModelInfo {
                id: id.to_string(),
                display_name: None,
                context_window: None,
            }],
            source: ModelSource::Fetched,
        }
    }

    #[tokio::test]
    async fn concurrent_calls_share_one_fetch() {
        let cache = Arc::new(ModelCache::new(Duration::from_secs(60)));
        let fetches = Arc::new(AtomicU32::new(0));
        let key = CacheKey::new("b", "p");

        let mut handles = Vec::new();
        for _ in 0..8 {
            let cache = cache.clone();
            let fetches = fetches.clone();
            let key = key.clone();
            handles.push(tokio::spawn(async move {
                cache
                    .get_or_fetch(key, move || async move {
                        fetches.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(20)).await;
                        Ok(listing("gpt-4o"))
                    })
                    .await
            }));
        }
        for handle in handles {
            let result = handle.await.unwrap().unwrap();
            assert_eq!(result.models[0].id, "gpt-4o");
        }
        assert_eq!(fetches.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn expired_entries_refetch() {
        let cache = ModelCache::new(Duration::from_millis(5));
        let key = CacheKey::new("b", "p");
        cache
            .get_or_fetch(key.clone(), || async { Ok(listing("one")) })
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        let second = cache
            .get_or_fetch(key, || async { Ok(listing("two")) })
            .await
            .unwrap();
        assert_eq!(second.models[0].id, "two");
    }

    #[tokio::test]
    async fn stale_value_served_while_refreshing() {
        let cache = Arc::new(ModelCache::new(Duration::from_millis(1)));
        let key = CacheKey::new("b", "p");
        cache
            .get_or_fetch(key.clone(), || async { Ok(listing("stale")) })
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;

        // First caller starts a slow refresh.
        let (release_tx, release_rx) = tokio::sync::oneshot::channel::<()>();
        let refresher = {
            let cache = cache.clone();
            let key = key.clone();
            tokio::spawn(async move {
                cache
                    .get_or_fetch(key, move || async move {
                        let _ = release_rx.await;
                        Ok(listing("fresh"))
                    })
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(5)).await;

        // Second caller is served the stale entry without fetching.
        let stale = cache
            .get_or_fetch(key.clone(), || async {
                panic!("second caller must not fetch")
            })
            .await
            .unwrap();
        assert_eq!(stale.models[0].id, "stale");

        release_tx.send(()).unwrap();
        let fresh = refresher.await.unwrap().unwrap();
        assert_eq!(fresh.models[0].id, "fresh");
    }

    #[tokio::test]
    async fn invalidate_forces_refetch() {
        let cache = ModelCache::new(Duration::from_secs(60));
        let key = CacheKey::new("b", "p");
        cache
            .get_or_fetch(key.clone(), || async { Ok(listing("one")) })
            .await
            .unwrap();
        cache.invalidate(&key);
        assert!(cache.get(&key).is_none());
        let again = cache
            .get_or_fetch(key, || async { Ok(listing("two")) })
            .await
            .unwrap();
        assert_eq!(again.models[0].id, "two");
    }
}
