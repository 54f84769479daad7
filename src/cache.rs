//! Freshness cache for the upstream host-list snapshot.
//!
//! Holds the last successful snapshot in memory and serves it with a
//! `live`/`cache` provenance marker.  Refreshes are coalesced: at most one
//! upstream call is in flight per process, and readers that arrive during a
//! refresh receive the pre-refresh snapshot immediately rather than
//! blocking.  Only the very first caller, when no snapshot exists at all,
//! blocks on the mandatory initial fetch.
//!
//! A refresh failure is absorbed whenever stale data can substitute: the
//! previous snapshot is returned unmodified with its original timestamp.
//! Availability of a stale directory beats a hard outage.

use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, OwnedMutexGuard, RwLock};
use tracing::{debug, info, warn};

use crate::persist;
use crate::upstream::lister::HostLister;
use crate::upstream::{HostRecord, UpstreamError};

// ---------------------------------------------------------------------------
// Provenance
// ---------------------------------------------------------------------------

/// Whether a response reflects a fresh upstream fetch performed by the
/// handling request, or a previously stored snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Source {
    Live,
    Cache,
}

impl Source {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Live => "live",
            Self::Cache => "cache",
        }
    }
}

// ---------------------------------------------------------------------------
// Snapshot
// ---------------------------------------------------------------------------

#[derive(Clone)]
struct Snapshot {
    hosts: Arc<Vec<HostRecord>>,
    fetched_at: DateTime<Utc>,
}

/// What callers receive: the host list plus provenance metadata.
#[derive(Debug, Clone)]
pub struct SnapshotView {
    pub hosts: Arc<Vec<HostRecord>>,
    pub source: Source,
    pub fetched_at: DateTime<Utc>,
}

/// On-disk form of a persisted snapshot.
#[derive(Serialize, Deserialize)]
struct SnapshotFile {
    fetched_at: DateTime<Utc>,
    hosts: Vec<HostRecord>,
}

// ---------------------------------------------------------------------------
// Cache
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct FreshnessCache {
    inner: Arc<CacheInner>,
}

struct CacheInner {
    lister: HostLister,
    max_age: Duration,
    snapshot_file: Option<PathBuf>,
    snapshot: RwLock<Option<Snapshot>>,
    /// Single-flight refresh guard.  Owned guards are moved into the
    /// refresh task so an abandoned request cannot cancel a refresh that
    /// other waiters depend on.
    refresh_lock: Arc<Mutex<()>>,
    /// Outcome of the most recent refresh attempt, written before the guard
    /// is released.  Waiters that find no snapshot after queueing on the
    /// guard surface this error instead of piling further calls onto a
    /// dead upstream.
    last_failure: RwLock<Option<UpstreamError>>,
}

impl FreshnessCache {
    pub fn new(lister: HostLister, max_age: std::time::Duration, snapshot_file: Option<PathBuf>) -> Self {
        let initial = snapshot_file.as_deref().and_then(|path| {
            match persist::read_json::<SnapshotFile>(path) {
                Ok(Some(file)) => {
                    info!(
                        hosts = file.hosts.len(),
                        fetched_at = %file.fetched_at,
                        "pre-seeded snapshot from disk"
                    );
                    Some(Snapshot {
                        hosts: Arc::new(file.hosts),
                        fetched_at: file.fetched_at,
                    })
                }
                Ok(None) => None,
                Err(e) => {
                    warn!(error = %e, path = %path.display(), "ignoring unreadable snapshot file");
                    None
                }
            }
        });

        Self {
            inner: Arc::new(CacheInner {
                lister,
                max_age: Duration::from_std(max_age).unwrap_or_else(|_| Duration::seconds(60)),
                snapshot_file,
                snapshot: RwLock::new(initial),
                refresh_lock: Arc::new(Mutex::new(())),
                last_failure: RwLock::new(None),
            }),
        }
    }

    /// Return the current snapshot, refreshing it from upstream when absent,
    /// stale, or when `force_refresh` is set.
    pub async fn snapshot(&self, force_refresh: bool) -> Result<SnapshotView, UpstreamError> {
        // Fast path: a fresh-enough snapshot needs no upstream call.
        if !force_refresh {
            if let Some(current) = self.current().await {
                if !self.is_stale(&current) {
                    return Ok(cache_view(current));
                }
            }
        }

        // A refresh is wanted.  Whoever wins the guard performs it; readers
        // that lose but hold a previous snapshot are served immediately.
        match Arc::clone(&self.inner.refresh_lock).try_lock_owned() {
            Ok(guard) => {
                // Re-check: a refresh may have completed between the fast
                // path and acquiring the guard.
                if !force_refresh {
                    if let Some(current) = self.current().await {
                        if !self.is_stale(&current) {
                            return Ok(cache_view(current));
                        }
                    }
                }

                match self.refresh_detached(guard).await {
                    Ok(snapshot) => Ok(SnapshotView {
                        hosts: snapshot.hosts,
                        source: Source::Live,
                        fetched_at: snapshot.fetched_at,
                    }),
                    Err(e) => match self.current().await {
                        Some(previous) => {
                            warn!(error = %e, "refresh failed; serving cached snapshot");
                            Ok(cache_view(previous))
                        }
                        None => Err(e),
                    },
                }
            }
            Err(_busy) => {
                if let Some(previous) = self.current().await {
                    return Ok(cache_view(previous));
                }

                // No snapshot yet: the mandatory initial fetch is in flight,
                // so wait for it and reuse its result.
                let guard = Arc::clone(&self.inner.refresh_lock).lock_owned().await;
                if let Some(snapshot) = self.current().await {
                    return Ok(cache_view(snapshot));
                }

                // The shared attempt failed.  Surface its outcome rather
                // than queueing another call against a dead upstream.
                if let Some(err) = self.inner.last_failure.read().await.clone() {
                    return Err(err);
                }

                let snapshot = self.refresh_detached(guard).await?;
                Ok(SnapshotView {
                    hosts: snapshot.hosts,
                    source: Source::Live,
                    fetched_at: snapshot.fetched_at,
                })
            }
        }
    }

    async fn current(&self) -> Option<Snapshot> {
        self.inner.snapshot.read().await.clone()
    }

    fn is_stale(&self, snapshot: &Snapshot) -> bool {
        Utc::now() - snapshot.fetched_at > self.inner.max_age
    }

    /// Run one refresh on its own task, releasing `guard` when it finishes.
    /// Spawning keeps the refresh alive even if the initiating request is
    /// abandoned mid-flight, so waiters still observe its result.
    async fn refresh_detached(
        &self,
        guard: OwnedMutexGuard<()>,
    ) -> Result<Snapshot, UpstreamError> {
        let cache = self.clone();
        let task = tokio::spawn(async move {
            let result = cache.refresh().await;
            drop(guard);
            result
        });
        match task.await {
            Ok(result) => result,
            Err(e) => Err(UpstreamError::Unavailable(format!("refresh task failed: {e}"))),
        }
    }

    async fn refresh(&self) -> Result<Snapshot, UpstreamError> {
        let hosts = match self.inner.lister.list_hosts().await {
            Ok(hosts) => hosts,
            Err(e) => {
                *self.inner.last_failure.write().await = Some(e.clone());
                return Err(e);
            }
        };
        *self.inner.last_failure.write().await = None;
        let snapshot = Snapshot {
            hosts: Arc::new(hosts),
            fetched_at: Utc::now(),
        };
        *self.inner.snapshot.write().await = Some(snapshot.clone());

        if let Some(path) = &self.inner.snapshot_file {
            let file = SnapshotFile {
                fetched_at: snapshot.fetched_at,
                hosts: snapshot.hosts.as_ref().clone(),
            };
            if let Err(e) = persist::write_json_atomic(path, &file) {
                warn!(error = %e, path = %path.display(), "failed to persist snapshot");
            }
        }

        debug!(hosts = snapshot.hosts.len(), "snapshot refreshed from upstream");
        Ok(snapshot)
    }
}

fn cache_view(snapshot: Snapshot) -> SnapshotView {
    SnapshotView {
        hosts: snapshot.hosts,
        source: Source::Cache,
        fetched_at: snapshot.fetched_at,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::time::Duration as StdDuration;

    use crate::upstream::session::SessionManager;
    use crate::upstream::{Token, UpstreamApi};

    /// Mock upstream with a toggleable listing failure and a call counter.
    struct MockApi {
        listings: AtomicUsize,
        fail_listing: AtomicBool,
        listing_delay: StdDuration,
    }

    impl MockApi {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                listings: AtomicUsize::new(0),
                fail_listing: AtomicBool::new(false),
                listing_delay: StdDuration::ZERO,
            })
        }

        fn slow(delay: StdDuration) -> Arc<Self> {
            Arc::new(Self {
                listings: AtomicUsize::new(0),
                fail_listing: AtomicBool::new(false),
                listing_delay: delay,
            })
        }

        fn set_fail(&self, fail: bool) {
            self.fail_listing.store(fail, Ordering::SeqCst);
        }
    }

    #[async_trait::async_trait]
    impl UpstreamApi for MockApi {
        async fn renew_token(&self, _: &str, _: &str) -> Result<Token, UpstreamError> {
            Ok(Token {
                secret: "token".to_string(),
                expires_at: None,
            })
        }

        async fn list_hosts(&self, _: &str) -> Result<Vec<HostRecord>, UpstreamError> {
            tokio::time::sleep(self.listing_delay).await;
            let n = self.listings.fetch_add(1, Ordering::SeqCst) + 1;
            if self.fail_listing.load(Ordering::SeqCst) {
                return Err(UpstreamError::Unavailable("connection refused".into()));
            }
            Ok(vec![HostRecord {
                id: n as u64,
                domain_names: vec![format!("fetch-{n}.example.com")],
                forward_host: None,
                forward_port: None,
            }])
        }
    }

    fn cache_over(api: Arc<MockApi>, max_age: StdDuration) -> FreshnessCache {
        let session = Arc::new(SessionManager::new(
            api.clone() as Arc<dyn UpstreamApi>,
            Some(("id".into(), "pw".into())),
        ));
        let lister = HostLister::new(api, session);
        FreshnessCache::new(lister, max_age, None)
    }

    #[tokio::test]
    async fn test_first_fetch_is_live() {
        let api = MockApi::new();
        let cache = cache_over(api.clone(), StdDuration::from_secs(60));

        let view = cache.snapshot(false).await.unwrap();
        assert_eq!(view.source, Source::Live);
        assert_eq!(view.hosts.len(), 1);
        assert_eq!(api.listings.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_fresh_snapshot_served_from_cache_without_upstream_call() {
        let api = MockApi::new();
        let cache = cache_over(api.clone(), StdDuration::from_secs(60));

        let first = cache.snapshot(false).await.unwrap();
        let second = cache.snapshot(false).await.unwrap();
        assert_eq!(second.source, Source::Cache);
        assert_eq!(second.fetched_at, first.fetched_at);
        assert_eq!(second.hosts, first.hosts);
        assert_eq!(api.listings.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_refresh_failure_falls_back_to_stale_snapshot() {
        let api = MockApi::new();
        // Zero max-age: every call wants a refresh.
        let cache = cache_over(api.clone(), StdDuration::ZERO);

        let first = cache.snapshot(false).await.unwrap();
        assert_eq!(first.source, Source::Live);

        api.set_fail(true);
        for _ in 0..3 {
            let view = cache.snapshot(false).await.unwrap();
            assert_eq!(view.source, Source::Cache);
            assert_eq!(view.fetched_at, first.fetched_at);
            assert_eq!(view.hosts, first.hosts);
        }

        // Upstream recovers: the next call flips back to live with new data.
        api.set_fail(false);
        let recovered = cache.snapshot(false).await.unwrap();
        assert_eq!(recovered.source, Source::Live);
        assert!(recovered.fetched_at > first.fetched_at);
        assert_ne!(recovered.hosts, first.hosts);
    }

    #[tokio::test]
    async fn test_initial_failure_propagates() {
        let api = MockApi::new();
        api.set_fail(true);
        let cache = cache_over(api, StdDuration::from_secs(60));

        let err = cache.snapshot(false).await.unwrap_err();
        assert!(matches!(err, UpstreamError::Unavailable(_)));
    }

    #[tokio::test]
    async fn test_force_refresh_bypasses_freshness() {
        let api = MockApi::new();
        let cache = cache_over(api.clone(), StdDuration::from_secs(60));

        cache.snapshot(false).await.unwrap();
        let forced = cache.snapshot(true).await.unwrap();
        assert_eq!(forced.source, Source::Live);
        assert_eq!(api.listings.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_stampede_coalesces_to_one_upstream_call() {
        let api = MockApi::slow(StdDuration::from_millis(80));
        let cache = cache_over(api.clone(), StdDuration::from_secs(60));

        let mut handles = Vec::new();
        for _ in 0..16 {
            let cache = cache.clone();
            handles.push(tokio::spawn(async move { cache.snapshot(false).await }));
        }
        for handle in handles {
            let view = handle.await.unwrap().unwrap();
            assert_eq!(view.hosts.len(), 1);
        }
        assert_eq!(api.listings.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_concurrent_initial_failure_shares_one_attempt() {
        // Cold start against a dead upstream: every queued caller gets the
        // single attempt's failure instead of burning its own timeout.
        let api = MockApi::slow(StdDuration::from_millis(80));
        api.set_fail(true);
        let cache = cache_over(api.clone(), StdDuration::from_secs(60));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let cache = cache.clone();
            handles.push(tokio::spawn(async move { cache.snapshot(false).await }));
        }
        for handle in handles {
            let err = handle.await.unwrap().unwrap_err();
            assert!(matches!(err, UpstreamError::Unavailable(_)));
        }
        assert_eq!(api.listings.load(Ordering::SeqCst), 1);

        // The failure is not sticky: a later caller retries the upstream.
        api.set_fail(false);
        let view = cache.snapshot(false).await.unwrap();
        assert_eq!(view.source, Source::Live);
        assert_eq!(api.listings.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_reader_during_refresh_gets_stale_immediately() {
        let api = MockApi::slow(StdDuration::from_millis(100));
        let cache = cache_over(api.clone(), StdDuration::ZERO);

        // Seed a snapshot.
        let first = cache.snapshot(false).await.unwrap();

        // Kick off a slow forced refresh in the background.
        let background = {
            let cache = cache.clone();
            tokio::spawn(async move { cache.snapshot(true).await })
        };
        tokio::time::sleep(StdDuration::from_millis(20)).await;

        // A reader arriving mid-refresh is served the pre-refresh snapshot
        // without waiting the remaining ~80ms.
        let started = tokio::time::Instant::now();
        let view = cache.snapshot(false).await.unwrap();
        assert!(started.elapsed() < StdDuration::from_millis(50));
        assert_eq!(view.source, Source::Cache);
        assert_eq!(view.fetched_at, first.fetched_at);

        let refreshed = background.await.unwrap().unwrap();
        assert_eq!(refreshed.source, Source::Live);
    }

    #[tokio::test]
    async fn test_snapshot_file_round_trip_preseeds_cache() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("snapshot.json");

        let api = MockApi::new();
        let session = Arc::new(SessionManager::new(
            api.clone() as Arc<dyn UpstreamApi>,
            Some(("id".into(), "pw".into())),
        ));
        let lister = HostLister::new(api.clone(), session.clone());
        let cache = FreshnessCache::new(
            lister.clone(),
            StdDuration::from_secs(60),
            Some(path.clone()),
        );
        let first = cache.snapshot(false).await.unwrap();

        // A new cache instance (fresh process) starts from the file and can
        // serve it without any upstream call, even when the upstream is down.
        api.set_fail(true);
        let restarted = FreshnessCache::new(lister, StdDuration::from_secs(60), Some(path));
        let view = restarted.snapshot(false).await.unwrap();
        assert_eq!(view.source, Source::Cache);
        assert_eq!(view.hosts, first.hosts);
        assert_eq!(
            view.fetched_at.timestamp_millis(),
            first.fetched_at.timestamp_millis()
        );
    }
}
