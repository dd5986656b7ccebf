//! Per-request cache policy.
//!
//! [`CacheManager::prepare`] decides, for one request, whether the mirror
//! must be cloned, refreshed or can be served as it is.  Clones and fetches
//! go through the [`LockTable`], so concurrent requests for the same cold or
//! stale repository cause a single upstream operation.  Serving an
//! up-to-date mirror takes no lock at all.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use thiserror::Error;
use tracing::{debug, info, instrument, warn};

use crate::config::{CacheConfig, UpstreamScheme};
use crate::coordination::{Aborted, LockTable};
use crate::identity::{Phase, RepositoryIdentity};
use crate::metrics::{CacheStatus, MetricsRegistry, SyncOperation};

use super::store::{MirrorStore, StoreError};

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum CacheError {
    /// The mirror could not be created (or was discarded as corrupt); there
    /// is nothing to serve.
    #[error("no mirror available for {identity}: {source}")]
    MirrorUnavailable {
        identity: RepositoryIdentity,
        #[source]
        source: StoreError,
    },

    /// A refresh failed but the previous mirror is still usable.  Never
    /// returned to callers; it is logged and the stale mirror is served.
    #[error(
        "refresh of {identity} failed, serving previous mirror at {}: {source}",
        path.display()
    )]
    StaleServed {
        identity: RepositoryIdentity,
        path: PathBuf,
        #[source]
        source: StoreError,
    },
}

/// A mirror ready to be served.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Prepared {
    pub path: PathBuf,
    pub status: CacheStatus,
}

type SyncOutcome = Result<(), StoreError>;

// ---------------------------------------------------------------------------
// CacheManager
// ---------------------------------------------------------------------------

pub struct CacheManager {
    store: Arc<dyn MirrorStore>,
    locks: LockTable<SyncOutcome>,
    max_staleness: Duration,
    force_refresh: bool,
    scheme: UpstreamScheme,
    metrics: MetricsRegistry,
}

impl CacheManager {
    pub fn new(
        store: Arc<dyn MirrorStore>,
        config: &CacheConfig,
        scheme: UpstreamScheme,
        metrics: MetricsRegistry,
    ) -> Self {
        Self {
            store,
            locks: LockTable::new(metrics.metrics.lock_coalesced.clone()),
            max_staleness: config.max_staleness(),
            force_refresh: config.force_refresh_on_every_request,
            scheme,
            metrics,
        }
    }

    /// The URL a mirror of `identity` is cloned from.
    pub fn upstream_url(&self, identity: &RepositoryIdentity) -> String {
        format!("{}://{}", self.scheme.as_str(), identity)
    }

    /// Make sure a servable mirror of `identity` exists and return its path.
    ///
    /// A missing mirror is cloned from `upstream_url`.  An existing one is
    /// refreshed when it is older than the staleness threshold or refresh is
    /// forced; only the advertise phase refreshes, so the refs a client saw
    /// stay put while it negotiates.  A failed refresh still serves the old
    /// mirror.
    #[instrument(skip(self, upstream_url), fields(%identity, phase = phase.as_str()))]
    pub async fn prepare(
        &self,
        identity: &RepositoryIdentity,
        upstream_url: &str,
        phase: Phase,
    ) -> Result<Prepared, CacheError> {
        let path = self.store.storage_path(identity);

        let status = if !self.store.exists(identity).await {
            self.create(identity, upstream_url).await?
        } else if phase == Phase::Advertise && self.needs_refresh(identity).await {
            self.refresh(identity, &path).await?
        } else {
            CacheStatus::Hot
        };

        self.metrics.metrics.record_cache_status(status);
        Ok(Prepared { path, status })
    }

    async fn needs_refresh(&self, identity: &RepositoryIdentity) -> bool {
        if self.force_refresh {
            return true;
        }
        if self.max_staleness.is_zero() {
            return false;
        }
        is_stale(self.store.freshness(identity).await, self.max_staleness)
    }

    async fn create(
        &self,
        identity: &RepositoryIdentity,
        upstream_url: &str,
    ) -> Result<CacheStatus, CacheError> {
        let store = Arc::clone(&self.store);
        let metrics = self.metrics.clone();
        let id = identity.clone();
        let url = upstream_url.to_string();
        debug!(%upstream_url, known_repositories = self.locks.len(), "mirror missing");

        let outcome = self
            .locks
            .with_lock(identity, move || async move {
                // Another holder may have published it while we waited.
                if store.exists(&id).await {
                    return Ok(());
                }
                let started = Instant::now();
                let result = store.create_mirror(&id, &url).await;
                metrics.metrics.record_sync(
                    SyncOperation::Clone,
                    outcome_label(&result),
                    started.elapsed(),
                );
                match &result {
                    Ok(()) => info!(identity = %id, elapsed = ?started.elapsed(), "mirror cloned"),
                    Err(e) => warn!(identity = %id, error = %e, "mirror clone failed"),
                }
                result
            })
            .await;

        match flatten(outcome) {
            Ok(()) => Ok(CacheStatus::Cold),
            Err(source) => Err(CacheError::MirrorUnavailable {
                identity: identity.clone(),
                source,
            }),
        }
    }

    async fn refresh(
        &self,
        identity: &RepositoryIdentity,
        path: &std::path::Path,
    ) -> Result<CacheStatus, CacheError> {
        let store = Arc::clone(&self.store);
        let metrics = self.metrics.clone();
        let id = identity.clone();
        let force = self.force_refresh;
        let max_staleness = self.max_staleness;

        let outcome = self
            .locks
            .with_lock(identity, move || async move {
                // A refresh that finished while we waited for the lock counts.
                if !force && !is_stale(store.freshness(&id).await, max_staleness) {
                    return Ok(());
                }
                let started = Instant::now();
                let result = store.refresh_mirror(&id).await;
                metrics.metrics.record_sync(
                    SyncOperation::Fetch,
                    outcome_label(&result),
                    started.elapsed(),
                );
                if let Err(StoreError::CorruptMirror(detail)) = &result {
                    warn!(identity = %id, %detail, "quarantining corrupt mirror");
                    if let Err(e) = store.quarantine(&id).await {
                        warn!(identity = %id, error = %e, "failed to quarantine mirror");
                    }
                }
                result
            })
            .await;

        match flatten(outcome) {
            Ok(()) => Ok(CacheStatus::Refreshed),
            Err(source @ StoreError::CorruptMirror(_)) => Err(CacheError::MirrorUnavailable {
                identity: identity.clone(),
                source,
            }),
            Err(source) if self.store.exists(identity).await => {
                let stale = CacheError::StaleServed {
                    identity: identity.clone(),
                    path: path.to_path_buf(),
                    source,
                };
                warn!(error = %stale, "serving stale mirror");
                Ok(CacheStatus::Stale)
            }
            Err(source) => Err(CacheError::MirrorUnavailable {
                identity: identity.clone(),
                source,
            }),
        }
    }
}

/// A mirror whose age is unknown is treated as stale.
fn is_stale(age: Option<Duration>, max_staleness: Duration) -> bool {
    age.map_or(true, |age| age > max_staleness)
}

fn outcome_label(result: &SyncOutcome) -> &'static str {
    match result {
        Ok(()) => "ok",
        Err(e) => e.kind(),
    }
}

fn flatten(outcome: Result<SyncOutcome, Aborted>) -> SyncOutcome {
    outcome.unwrap_or_else(|aborted| Err(StoreError::UpstreamUnreachable(aborted.to_string())))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::path::Path;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;

    use super::*;

    /// In-memory store.  Each mirror is represented by its age.
    #[derive(Default)]
    struct FakeStore {
        mirrors: Mutex<HashMap<RepositoryIdentity, Option<Duration>>>,
        create_error: Mutex<Option<StoreError>>,
        refresh_error: Mutex<Option<StoreError>>,
        delay: Duration,
        creates: AtomicU32,
        refreshes: AtomicU32,
        quarantines: AtomicU32,
    }

    impl FakeStore {
        fn with_mirror(identity: &RepositoryIdentity, age: Option<Duration>) -> Self {
            let store = Self::default();
            store.mirrors.lock().unwrap().insert(identity.clone(), age);
            store
        }

        fn mutations(&self) -> u32 {
            self.creates.load(Ordering::SeqCst)
                + self.refreshes.load(Ordering::SeqCst)
                + self.quarantines.load(Ordering::SeqCst)
        }
    }

    #[async_trait::async_trait]
    impl MirrorStore for FakeStore {
        fn storage_path(&self, identity: &RepositoryIdentity) -> PathBuf {
            Path::new("/cache/mirrors").join(format!("{identity}.git"))
        }

        async fn exists(&self, identity: &RepositoryIdentity) -> bool {
            self.mirrors.lock().unwrap().contains_key(identity)
        }

        async fn freshness(&self, identity: &RepositoryIdentity) -> Option<Duration> {
            self.mirrors.lock().unwrap().get(identity).copied().flatten()
        }

        async fn create_mirror(
            &self,
            identity: &RepositoryIdentity,
            _upstream_url: &str,
        ) -> Result<(), StoreError> {
            self.creates.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            if let Some(err) = self.create_error.lock().unwrap().clone() {
                return Err(err);
            }
            self.mirrors
                .lock()
                .unwrap()
                .insert(identity.clone(), Some(Duration::ZERO));
            Ok(())
        }

        async fn refresh_mirror(&self, identity: &RepositoryIdentity) -> Result<(), StoreError> {
            self.refreshes.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            if let Some(err) = self.refresh_error.lock().unwrap().clone() {
                return Err(err);
            }
            self.mirrors
                .lock()
                .unwrap()
                .insert(identity.clone(), Some(Duration::ZERO));
            Ok(())
        }

        async fn quarantine(&self, identity: &RepositoryIdentity) -> Result<(), StoreError> {
            self.quarantines.fetch_add(1, Ordering::SeqCst);
            self.mirrors.lock().unwrap().remove(identity);
            Ok(())
        }
    }

    fn id(s: &str) -> RepositoryIdentity {
        RepositoryIdentity::parse(s).unwrap()
    }

    fn manager(store: &Arc<FakeStore>, max_staleness: u64, force: bool) -> CacheManager {
        let config = CacheConfig {
            max_staleness,
            force_refresh_on_every_request: force,
            ..CacheConfig::default()
        };
        CacheManager::new(
            Arc::clone(store) as Arc<dyn MirrorStore>,
            &config,
            UpstreamScheme::Https,
            MetricsRegistry::new(),
        )
    }

    async fn advertise(manager: &CacheManager, repo: &RepositoryIdentity) -> Result<Prepared, CacheError> {
        manager
            .prepare(repo, &manager.upstream_url(repo), Phase::Advertise)
            .await
    }

    #[test]
    fn upstream_url_uses_scheme() {
        let store = Arc::new(FakeStore::default());
        let repo = id("GitHub.com/org/repo.git");
        assert_eq!(manager(&store, 60, false).upstream_url(&repo), "https://github.com/org/repo");

        let http = CacheManager::new(
            store as Arc<dyn MirrorStore>,
            &CacheConfig::default(),
            UpstreamScheme::Http,
            MetricsRegistry::new(),
        );
        assert_eq!(http.upstream_url(&repo), "http://github.com/org/repo");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_cold_requests_clone_once() {
        let store = Arc::new(FakeStore {
            delay: Duration::from_millis(100),
            ..FakeStore::default()
        });
        let manager = Arc::new(manager(&store, 60, false));
        let repo = id("example.com/org/repo");

        let requests = (0..10).map(|_| {
            let manager = Arc::clone(&manager);
            let repo = repo.clone();
            async move { advertise(&manager, &repo).await }
        });
        let results = futures::future::join_all(requests).await;

        assert_eq!(store.creates.load(Ordering::SeqCst), 1);
        for result in results {
            let prepared = result.unwrap();
            assert_eq!(prepared.path, Path::new("/cache/mirrors/example.com/org/repo.git"));
            assert_eq!(prepared.status, CacheStatus::Cold);
        }
        assert_eq!(manager.metrics.metrics.lock_coalesced.get(), 9);
        assert_eq!(manager.locks.len(), 1);
    }

    #[tokio::test]
    async fn fresh_mirror_is_served_without_mutation() {
        let store = Arc::new(FakeStore::default());
        let manager = manager(&store, 60, false);
        let repo = id("example.com/org/repo");

        assert_eq!(advertise(&manager, &repo).await.unwrap().status, CacheStatus::Cold);
        let before = store.mutations();
        assert_eq!(advertise(&manager, &repo).await.unwrap().status, CacheStatus::Hot);
        assert_eq!(store.mutations(), before);
    }

    #[tokio::test]
    async fn stale_mirror_is_refreshed() {
        let repo = id("example.com/org/repo");
        let store = Arc::new(FakeStore::with_mirror(&repo, Some(Duration::from_secs(120))));
        let manager = manager(&store, 60, false);

        let prepared = advertise(&manager, &repo).await.unwrap();
        assert_eq!(prepared.status, CacheStatus::Refreshed);
        assert_eq!(store.refreshes.load(Ordering::SeqCst), 1);
        assert_eq!(store.creates.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn unknown_age_counts_as_stale() {
        let repo = id("example.com/org/repo");
        let store = Arc::new(FakeStore::with_mirror(&repo, None));
        let manager = manager(&store, 60, false);

        assert_eq!(advertise(&manager, &repo).await.unwrap().status, CacheStatus::Refreshed);
    }

    #[tokio::test]
    async fn zero_staleness_never_refreshes() {
        let repo = id("example.com/org/repo");
        let store = Arc::new(FakeStore::with_mirror(&repo, Some(Duration::from_secs(86_400 * 365))));
        let manager = manager(&store, 0, false);

        assert_eq!(advertise(&manager, &repo).await.unwrap().status, CacheStatus::Hot);
        assert_eq!(store.mutations(), 0);
    }

    #[tokio::test]
    async fn forced_refresh_fetches_every_advertisement() {
        let repo = id("example.com/org/repo");
        let store = Arc::new(FakeStore::with_mirror(&repo, Some(Duration::ZERO)));
        let manager = manager(&store, 60, true);

        advertise(&manager, &repo).await.unwrap();
        advertise(&manager, &repo).await.unwrap();
        assert_eq!(store.refreshes.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn negotiation_never_refreshes() {
        let repo = id("example.com/org/repo");
        let store = Arc::new(FakeStore::with_mirror(&repo, Some(Duration::from_secs(600))));
        let manager = manager(&store, 60, true);

        let prepared = manager
            .prepare(&repo, &manager.upstream_url(&repo), Phase::Negotiate)
            .await
            .unwrap();
        assert_eq!(prepared.status, CacheStatus::Hot);
        assert_eq!(store.mutations(), 0);
    }

    #[tokio::test]
    async fn negotiation_clones_missing_mirror() {
        let store = Arc::new(FakeStore::default());
        let manager = manager(&store, 60, false);
        let repo = id("example.com/org/repo");

        let prepared = manager
            .prepare(&repo, &manager.upstream_url(&repo), Phase::Negotiate)
            .await
            .unwrap();
        assert_eq!(prepared.status, CacheStatus::Cold);
    }

    #[tokio::test]
    async fn failed_refresh_serves_stale_mirror() {
        let repo = id("example.com/org/repo");
        let store = Arc::new(FakeStore::with_mirror(&repo, Some(Duration::from_secs(120))));
        *store.refresh_error.lock().unwrap() =
            Some(StoreError::UpstreamUnreachable("connection refused".into()));
        let manager = manager(&store, 60, false);

        let prepared = advertise(&manager, &repo).await.unwrap();
        assert_eq!(prepared.status, CacheStatus::Stale);
        assert_eq!(prepared.path, store.storage_path(&repo));
        assert_eq!(store.quarantines.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn failed_clone_is_unavailable() {
        let store = Arc::new(FakeStore::default());
        *store.create_error.lock().unwrap() = Some(StoreError::UpstreamRejected("not found".into()));
        let manager = manager(&store, 60, false);
        let repo = id("example.com/org/missing");

        let err = advertise(&manager, &repo).await.unwrap_err();
        assert!(matches!(
            err,
            CacheError::MirrorUnavailable {
                source: StoreError::UpstreamRejected(_),
                ..
            }
        ));

        // Failures are not cached; the next request tries again.
        *store.create_error.lock().unwrap() = None;
        assert_eq!(advertise(&manager, &repo).await.unwrap().status, CacheStatus::Cold);
        assert_eq!(store.creates.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn corrupt_mirror_is_quarantined_and_recloned_next_time() {
        let repo = id("example.com/org/repo");
        let store = Arc::new(FakeStore::with_mirror(&repo, Some(Duration::from_secs(120))));
        *store.refresh_error.lock().unwrap() = Some(StoreError::CorruptMirror("bad object".into()));
        let manager = manager(&store, 60, false);

        let err = advertise(&manager, &repo).await.unwrap_err();
        assert!(matches!(err, CacheError::MirrorUnavailable { .. }));
        assert_eq!(store.quarantines.load(Ordering::SeqCst), 1);
        assert!(!store.exists(&repo).await);

        assert_eq!(advertise(&manager, &repo).await.unwrap().status, CacheStatus::Cold);
    }
}
