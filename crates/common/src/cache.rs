//! Secret retrieval with tiered timeouts.
//!
//! A lookup consults the store and the backend together. Recent cache
//! entries answer immediately. Otherwise the backend is raced against two
//! timers: an optimistic deadline after which cached data is served while
//! the request keeps running in the background, and a hard ceiling after
//! which the lookup fails. Backend responses always land in the store, even
//! when they arrive after the caller has been answered.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::oneshot;
use tokio::time::sleep;

use crate::backend::{BackendError, SecretBackend};
use crate::clock::Clock;
use crate::secret::Secret;
use crate::store::SecretStore;

/// Timeout tiers for secret retrieval.
#[derive(Debug, Clone, Copy)]
pub struct Timeouts {
    /// The kernel tends to issue lookups in quick bursts. Cached data
    /// younger than this is returned without a backend request.
    pub fresh: Duration,
    /// Optimistic ceiling on a backend request before falling back to cached
    /// data. Distinct from the transport timeout; the request keeps running.
    pub backend_deadline: Duration,
    /// Hard ceiling on a whole lookup. Must exceed `backend_deadline`.
    pub max_wait: Duration,
    /// Grace period during which a secret deleted at the source stays
    /// visible.
    pub deletion_delay: Duration,
}

/// Lookup failures surfaced to the filesystem layer.
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    /// The secret does not exist, or no longer exists and its grace window
    /// has passed.
    #[error("secret not found: {0}")]
    NotFound(String),
    /// The backend did not produce an answer in time and nothing usable was
    /// cached.
    #[error("backend unavailable and nothing cached for {0}")]
    Transient(String),
}

/// Serves secrets from cache or server, whichever answers first with usable
/// data. Writes to the store happen only here and in the fetch tasks this
/// spawns.
pub struct Cache {
    store: Arc<SecretStore>,
    backend: Arc<dyn SecretBackend>,
    timeouts: Timeouts,
    clock: Arc<dyn Clock>,
}

impl Cache {
    pub fn new(
        backend: Arc<dyn SecretBackend>,
        timeouts: Timeouts,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let store = Arc::new(SecretStore::new(timeouts.deletion_delay, clock.clone()));
        Self {
            store,
            backend,
            timeouts,
            clock,
        }
    }

    /// Retrieves a secret by name.
    ///
    /// * Fresh cache entry: returned immediately, no backend request.
    /// * Backend answers in time: store updated, value returned.
    /// * Backend reports the secret deleted: deletion is scheduled and the
    ///   cached copy is served for the rest of the grace window.
    /// * Backend is slow: cached copy after `backend_deadline`, with the
    ///   request left running to update the store.
    /// * `max_wait` with nothing cached: the lookup fails.
    pub async fn secret(&self, name: &str) -> Result<Secret, CacheError> {
        let mut cached = None;
        if let Some(entry) = self.store.get(name) {
            if entry.tombstone {
                // Known deleted. Stays invisible for the rest of the grace
                // window without another round trip.
                return Err(CacheError::NotFound(name.to_string()));
            }
            if !entry.secret.content.is_empty() {
                let age = self
                    .clock
                    .now()
                    .duration_since(entry.inserted_at)
                    .unwrap_or_default();
                if age < self.timeouts.fresh {
                    tracing::debug!(name, "cache hit");
                    return Ok(entry.secret);
                }
                cached = Some(entry.secret);
            }
        }

        // Stale or missing. Race the backend against the timeout tiers.
        let mut fetch = self.spawn_fetch(name);
        let backend_deadline = sleep(self.timeouts.backend_deadline);
        let max_wait = sleep(self.timeouts.max_wait);
        tokio::pin!(backend_deadline, max_wait);

        let mut fetch_armed = true;
        let mut deadline_armed = true;
        loop {
            tokio::select! {
                res = &mut fetch, if fetch_armed => {
                    fetch_armed = false;
                    match res {
                        Ok(Ok(secret)) => return Ok(secret),
                        Ok(Err(BackendError::Deleted)) => {
                            // The fetch task has already scheduled delayed
                            // deletion; the cached copy rides out the grace
                            // window.
                            return match cached {
                                Some(secret) => Ok(secret),
                                None => Err(CacheError::NotFound(name.to_string())),
                            };
                        }
                        Ok(Err(BackendError::Transient(err))) => {
                            if let Some(secret) = cached {
                                tracing::warn!(name, error = %err, "backend failed, serving cached copy");
                                return Ok(secret);
                            }
                            tracing::warn!(name, error = %err, "backend failed with nothing cached");
                        }
                        Err(_) => {
                            if let Some(secret) = cached {
                                return Ok(secret);
                            }
                            tracing::warn!(name, "fetch task dropped without a result");
                        }
                    }
                }
                _ = &mut backend_deadline, if deadline_armed => {
                    deadline_armed = false;
                    if let Some(secret) = cached {
                        tracing::debug!(name, "backend deadline reached, serving cached copy");
                        return Ok(secret);
                    }
                }
                _ = &mut max_wait => {
                    tracing::error!(name, "cache and backend timeout");
                    return Err(CacheError::Transient(name.to_string()));
                }
            }
        }
    }

    /// Lists all known secrets.
    ///
    /// A backend listing is requested in parallel with a snapshot of the
    /// store. If the backend answers in time its result is merged into the
    /// store and the post-merge view is returned; on deadline or failure the
    /// pre-call snapshot is returned and any eventual merge happens in the
    /// background.
    pub async fn secret_list(&self) -> Vec<Secret> {
        let snapshot = self.store.values();

        let refresh = self.spawn_list_refresh();
        let backend_deadline = sleep(self.timeouts.backend_deadline);
        let max_wait = sleep(self.timeouts.max_wait);
        tokio::pin!(backend_deadline, max_wait);

        tokio::select! {
            res = refresh => match res {
                Ok(Some(merged)) => merged,
                _ => snapshot,
            },
            _ = &mut backend_deadline => {
                tracing::debug!("backend deadline reached, serving cached listing");
                snapshot
            }
            _ = &mut max_wait => {
                tracing::error!("cache and backend timeout listing secrets");
                snapshot
            }
        }
    }

    /// One-time startup fill: list the backend and adopt the result
    /// wholesale. Failure leaves the store empty and is reported to the
    /// caller so a startup ping can abort.
    pub async fn warmup(&self) -> Result<(), BackendError> {
        match self.backend.list_secrets().await {
            Ok(listing) => {
                let fresh = SecretStore::new(self.timeouts.deletion_delay, self.clock.clone());
                for secret in listing {
                    let name = secret.name.clone();
                    fresh.put(&name, secret, None);
                }
                self.store.overwrite(&fresh);
                tracing::info!(count = self.store.len(), "cache warmed from backend listing");
                Ok(())
            }
            Err(err) => {
                tracing::warn!(error = %err, "warmup listing failed, starting with an empty cache");
                Err(err)
            }
        }
    }

    /// Empties the cache immediately, pending deletions included. Wired to
    /// the control file unlink.
    pub fn clear(&self) {
        tracing::info!("cache cleared");
        self.store.clear();
    }

    /// Inserts a secret directly, bypassing the backend.
    pub fn add(&self, secret: Secret) {
        let name = secret.name.clone();
        self.store.put(&name, secret, None);
    }

    /// Count of live cache entries.
    pub fn len(&self) -> usize {
        self.store.len()
    }

    pub fn is_empty(&self) -> bool {
        self.store.is_empty()
    }

    /// Starts a backend fetch that applies its outcome to the store before
    /// reporting back, so completions that arrive after the caller has given
    /// up still land.
    fn spawn_fetch(&self, name: &str) -> oneshot::Receiver<Result<Secret, BackendError>> {
        let (tx, rx) = oneshot::channel();
        let backend = Arc::clone(&self.backend);
        let store = Arc::clone(&self.store);
        let name = name.to_string();
        tokio::spawn(async move {
            let result = backend.fetch_secret(&name).await;
            match &result {
                Ok(secret) => store.put(&name, secret.clone(), None),
                Err(BackendError::Deleted) => store.delete(&name),
                Err(BackendError::Transient(_)) => {}
            }
            let _ = tx.send(result);
        });
        rx
    }

    /// Starts a backend listing that merges into the store on success and
    /// reports the post-merge view. A listing entry without content never
    /// displaces cached content for the same name.
    fn spawn_list_refresh(&self) -> oneshot::Receiver<Option<Vec<Secret>>> {
        let (tx, rx) = oneshot::channel();
        let backend = Arc::clone(&self.backend);
        let store = Arc::clone(&self.store);
        let clock = Arc::clone(&self.clock);
        let deletion_delay = self.timeouts.deletion_delay;
        tokio::spawn(async move {
            let listing = match backend.list_secrets().await {
                Ok(listing) => listing,
                Err(err) => {
                    tracing::warn!(error = %err, "backend listing failed");
                    let _ = tx.send(None);
                    return;
                }
            };

            let fresh = SecretStore::new(deletion_delay, clock);
            for secret in listing {
                let name = secret.name.clone();
                match store.get(&name) {
                    Some(entry)
                        if !entry.tombstone
                            && !entry.secret.content.is_empty()
                            && secret.content.is_empty() =>
                    {
                        fresh.put(&name, entry.secret, None);
                    }
                    _ => fresh.put(&name, secret, None),
                }
            }
            store.replace(&fresh);
            let _ = tx.send(Some(store.values()));
        });
        rx
    }
}

impl std::fmt::Debug for Cache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cache")
            .field("timeouts", &self.timeouts)
            .field("store", &self.store)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testkit::{DeletedBackend, FailingBackend, MockClock, QueueBackend};
    use chrono::Utc;

    const HOUR: Duration = Duration::from_secs(3600);

    fn timeouts() -> Timeouts {
        Timeouts {
            fresh: Duration::ZERO,
            backend_deadline: Duration::from_millis(10),
            max_wait: Duration::from_millis(20),
            deletion_delay: HOUR,
        }
    }

    fn secret(name: &str, content: &[u8]) -> Secret {
        let mut s = Secret::metadata_only(name, Utc::now());
        s.content = content.to_vec().into();
        s.length = content.len() as u64;
        s
    }

    fn cache_with(
        backend: Arc<dyn SecretBackend>,
        timeouts: Timeouts,
    ) -> (Cache, MockClock) {
        let clock = MockClock::default();
        let cache = Cache::new(backend, timeouts, Arc::new(clock.clone()));
        (cache, clock)
    }

    #[tokio::test]
    async fn secret_returns_backend_value() {
        let backend = Arc::new(QueueBackend::default());
        backend.push_secret(secret("password-file", b"hunter2"));
        let (cache, _clock) = cache_with(backend, timeouts());

        let got = cache.secret("password-file").await.unwrap();
        assert_eq!(got.content.as_bytes(), b"hunter2");
        assert_eq!(cache.len(), 1);
    }

    #[tokio::test]
    async fn cached_value_survives_failing_backend() {
        let (cache, clock) = cache_with(Arc::new(FailingBackend), timeouts());

        assert!(cache.secret("foo").await.is_err());

        cache.add(secret("foo", b"bytes"));
        let got = cache.secret("foo").await.unwrap();
        assert_eq!(got.content.as_bytes(), b"bytes");

        // Still served much later; the backend never confirmed a deletion.
        clock.advance(2 * HOUR);
        assert!(cache.secret("foo").await.is_ok());
    }

    #[tokio::test]
    async fn deleted_secret_rides_out_grace_window_then_vanishes() {
        let (cache, clock) = cache_with(Arc::new(DeletedBackend), timeouts());

        assert!(matches!(
            cache.secret("foo").await,
            Err(CacheError::NotFound(_))
        ));

        cache.add(secret("foo", b"bytes"));
        let got = cache.secret("foo").await.unwrap();
        assert_eq!(got.content.as_bytes(), b"bytes");

        clock.advance(2 * HOUR);
        assert!(cache.secret("foo").await.is_err());
    }

    #[tokio::test]
    async fn cached_value_survives_blocked_backend() {
        let backend = Arc::new(QueueBackend::default()); // empty: hangs
        let (cache, clock) = cache_with(backend, timeouts());

        assert!(matches!(
            cache.secret("foo").await,
            Err(CacheError::Transient(_))
        ));

        cache.add(secret("foo", b"bytes"));
        assert!(cache.secret("foo").await.is_ok());

        // No deletion was ever observed, so age alone does not purge it.
        clock.advance(2 * HOUR);
        assert!(cache.secret("foo").await.is_ok());
    }

    #[tokio::test]
    async fn backend_value_wins_over_stale_cache() {
        let backend = Arc::new(QueueBackend::default());
        backend.push_secret(secret("foo", b"from-backend"));
        let (cache, _clock) = cache_with(backend, timeouts());

        cache.add(secret("foo", b"from-cache"));
        let got = cache.secret("foo").await.unwrap();
        assert_eq!(got.content.as_bytes(), b"from-backend");
        assert_eq!(cache.len(), 1);
    }

    #[tokio::test]
    async fn fresh_cache_entry_short_circuits_backend() {
        let backend = Arc::new(QueueBackend::default());
        backend.push_secret(secret("foo", b"from-backend"));
        let mut t = timeouts();
        t.fresh = HOUR;
        let (cache, _clock) = cache_with(backend.clone(), t);

        cache.add(secret("foo", b"from-cache"));
        for _ in 0..2 {
            let got = cache.secret("foo").await.unwrap();
            assert_eq!(got.content.as_bytes(), b"from-cache");
        }

        // The queued backend response was never consumed.
        assert_eq!(
            backend.fetch_secret("foo").await.unwrap().content.as_bytes(),
            b"from-backend"
        );
    }

    #[tokio::test]
    async fn stale_cache_entry_consults_backend_and_updates_store() {
        let backend = Arc::new(QueueBackend::default());
        backend.push_secret(secret("foo", b"v2"));
        let (cache, clock) = cache_with(backend, timeouts());

        cache.add(secret("foo", b"v1"));
        clock.advance(Duration::from_secs(1));

        let got = cache.secret("foo").await.unwrap();
        assert_eq!(got.content.as_bytes(), b"v2");
        let entry = cache.store.get("foo").unwrap();
        assert_eq!(entry.secret.content.as_bytes(), b"v2");
    }

    #[tokio::test]
    async fn tombstone_blocks_lookups_during_grace() {
        let backend = Arc::new(QueueBackend::default());
        backend.push_secret(secret("foo", b"revived"));
        let (cache, clock) = cache_with(backend, timeouts());

        cache.store.delete("foo");

        // Known deleted: answered from the tombstone, backend not consulted.
        assert!(matches!(
            cache.secret("foo").await,
            Err(CacheError::NotFound(_))
        ));

        // Once the tombstone expires the backend is asked again.
        clock.advance(2 * HOUR);
        let got = cache.secret("foo").await.unwrap();
        assert_eq!(got.content.as_bytes(), b"revived");
    }

    #[tokio::test]
    async fn list_returns_backend_values() {
        let backend = Arc::new(QueueBackend::default());
        backend.push_listing(vec![secret("a", b"a")]);
        let (cache, _clock) = cache_with(backend, timeouts());

        let list = cache.secret_list().await;
        assert_eq!(list.len(), 1);
        assert_eq!(list[0].name, "a");
        assert_eq!(cache.len(), 1);
    }

    #[tokio::test]
    async fn list_serves_cache_when_backend_fails() {
        let (cache, clock) = cache_with(Arc::new(FailingBackend), timeouts());
        cache.add(secret("a", b"a"));

        let list = cache.secret_list().await;
        assert_eq!(list.len(), 1);

        clock.advance(2 * HOUR);
        assert_eq!(cache.secret_list().await.len(), 1);
    }

    #[tokio::test]
    async fn list_serves_cache_when_backend_blocks() {
        let backend = Arc::new(QueueBackend::default());
        let (cache, clock) = cache_with(backend, timeouts());

        assert!(cache.secret_list().await.is_empty());

        cache.add(secret("a", b"a"));
        assert_eq!(cache.secret_list().await.len(), 1);

        clock.advance(2 * HOUR);
        assert_eq!(cache.secret_list().await.len(), 1);
    }

    #[tokio::test]
    async fn list_schedules_entries_missing_from_backend() {
        let backend = Arc::new(QueueBackend::default());
        backend.push_listing(vec![secret("listed", b"x")]);
        let (cache, clock) = cache_with(backend, timeouts());

        cache.add(secret("dropped", b"y"));

        // Post-merge view still shows the dropped entry during its grace
        // window.
        let list = cache.secret_list().await;
        assert_eq!(list.len(), 2);
        assert_eq!(cache.len(), 2);

        clock.advance(2 * HOUR);
        assert_eq!(cache.len(), 1);
    }

    #[tokio::test]
    async fn list_merge_keeps_content_over_metadata_only_entries() {
        let backend = Arc::new(QueueBackend::default());
        backend.push_listing(vec![
            secret("k1", b""),
            secret("k3", b""),
        ]);
        let (cache, clock) = cache_with(backend, timeouts());

        cache.add(secret("k1", b"B"));
        cache.add(secret("k2", b"C"));

        let list = cache.secret_list().await;
        assert_eq!(list.len(), 3);
        let k1 = list.iter().find(|s| s.name == "k1").unwrap();
        assert_eq!(k1.content.as_bytes(), b"B");
        assert!(list.iter().any(|s| s.name == "k3"));
        assert!(list.iter().any(|s| s.name == "k2"));

        // k2 was absent from the listing and only lives through the grace
        // window.
        clock.advance(2 * HOUR);
        let list = cache.secret_list().await;
        assert_eq!(list.len(), 2);
        assert!(!list.iter().any(|s| s.name == "k2"));
    }

    #[tokio::test]
    async fn deleted_backend_listing_empties_cache_after_grace() {
        let (cache, clock) = cache_with(Arc::new(DeletedBackend), timeouts());
        cache.add(secret("a", b"a"));

        assert_eq!(cache.secret_list().await.len(), 1);

        clock.advance(2 * HOUR);
        assert!(cache.secret_list().await.is_empty());
    }

    #[tokio::test]
    async fn clear_drops_everything_immediately() {
        let backend = Arc::new(QueueBackend::default());
        let (cache, _clock) = cache_with(backend, timeouts());
        cache.add(secret("a", b"a"));
        cache.store.delete("a");

        cache.clear();
        assert_eq!(cache.len(), 0);
        assert!(cache.secret_list().await.is_empty());
    }

    #[tokio::test]
    async fn warmup_adopts_listing_wholesale() {
        let backend = Arc::new(QueueBackend::default());
        backend.push_listing(vec![secret("a", b"a"), secret("b", b"b")]);
        let mut t = timeouts();
        t.fresh = HOUR;
        let (cache, _clock) = cache_with(backend, t);

        cache.add(secret("stale", b"stale"));
        cache.warmup().await.unwrap();

        assert_eq!(cache.len(), 2);
        assert!(cache.secret("a").await.is_ok());
        assert!(cache.store.get("stale").is_none());
    }

    #[tokio::test]
    async fn warmup_failure_leaves_cache_empty() {
        let (cache, _clock) = cache_with(Arc::new(FailingBackend), timeouts());
        assert!(cache.warmup().await.is_err());
        assert_eq!(cache.len(), 0);
    }
}
