//! Per-source key-set cache with single-flight refresh.
//!
//! The cache owns one entry per configured source. Each entry holds the
//! current snapshot behind a `RwLock` (readers never block on network
//! I/O) and a flight state behind a `Mutex`/`Condvar` pair that enforces
//! at-most-one concurrent fetch per source: callers arriving while a
//! fetch is in flight wait for it and share its outcome instead of
//! issuing duplicate network calls.
//!
//! ## Invariants
//!
//! - Snapshot installation is atomic: readers see the fully-old or the
//!   fully-new snapshot, never a mix.
//! - A failed refresh never replaces the stored snapshot; after one
//!   successful fetch the cache is never empty.
//! - Sources are independent; one source's refresh never blocks another's.

use std::collections::HashMap;
use std::sync::{Arc, Condvar, Mutex, RwLock};
use std::time::Instant;

use thiserror::Error;

use crate::config::SourceConfig;
use crate::jwks::fetch::{FetchError, KeySetFetcher};
use crate::jwks::schedule::RefreshSchedule;
use crate::jwks::snapshot::KeySetSnapshot;

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("Source is not configured: {0}")]
    UnknownSource(String),

    #[error(transparent)]
    Fetch(#[from] FetchError),
}

struct FlightState {
    schedule: RefreshSchedule,
    in_flight: bool,
    /// Bumped once per completed flight; waiters key off it to read the
    /// outcome of the flight they joined.
    epoch: u64,
    last_outcome: Option<Result<Arc<KeySetSnapshot>, FetchError>>,
}

struct SourceEntry {
    current: RwLock<Option<Arc<KeySetSnapshot>>>,
    flight: Mutex<FlightState>,
    landed: Condvar,
}

/// Thread-safe cache of key-set snapshots, one per configured source.
///
/// Constructed once at startup and passed explicitly to its consumers;
/// there is no process-global instance, so tests can run isolated caches
/// against fake fetchers.
pub struct KeyCache {
    sources: HashMap<String, SourceEntry>,
    fetcher: Box<dyn KeySetFetcher>,
}

impl KeyCache {
    pub fn new(sources: &[SourceConfig], fetcher: Box<dyn KeySetFetcher>) -> Self {
        let sources = sources
            .iter()
            .map(|source| {
                let entry = SourceEntry {
                    current: RwLock::new(None),
                    flight: Mutex::new(FlightState {
                        schedule: RefreshSchedule::new(source.min_refresh_interval),
                        in_flight: false,
                        epoch: 0,
                        last_outcome: None,
                    }),
                    landed: Condvar::new(),
                };
                (source.url.clone(), entry)
            })
            .collect();

        Self { sources, fetcher }
    }

    /// URLs of all configured sources.
    pub fn source_urls(&self) -> impl Iterator<Item = &str> {
        self.sources.keys().map(String::as_str)
    }

    /// The last successfully installed snapshot for `url`, however stale.
    ///
    /// Never blocks on network I/O. `None` only before the first
    /// successful fetch or for an unconfigured source; callers needing
    /// freshness use [`KeyCache::refresh_now`].
    pub fn get(&self, url: &str) -> Option<Arc<KeySetSnapshot>> {
        let entry = self.sources.get(url)?;
        entry.current.read().unwrap().clone()
    }

    /// Fetch every configured source once, synchronously.
    ///
    /// Called at startup before the service accepts traffic; the first
    /// failure aborts, so an unreachable key source is caught at boot
    /// instead of on the first request.
    pub fn warm(&self) -> Result<(), FetchError> {
        for (url, entry) in &self.sources {
            self.refresh_entry(url, entry)?;
        }
        Ok(())
    }

    /// Refresh `url` now, joining an in-flight fetch if one is up.
    ///
    /// All callers that overlap one flight observe that flight's outcome:
    /// the new snapshot on success, a clone of the same error on failure.
    pub fn refresh_now(&self, url: &str) -> Result<Arc<KeySetSnapshot>, CacheError> {
        let entry = self
            .sources
            .get(url)
            .ok_or_else(|| CacheError::UnknownSource(url.to_string()))?;
        Ok(self.refresh_entry(url, entry)?)
    }

    /// Refresh `url` if its schedule says it is due. No-op when not due
    /// or when a flight is already up (the scheduler does not need to
    /// join it).
    pub fn refresh_if_due(&self, url: &str) -> Result<(), CacheError> {
        let entry = self
            .sources
            .get(url)
            .ok_or_else(|| CacheError::UnknownSource(url.to_string()))?;

        let due = {
            let flight = entry.flight.lock().unwrap();
            !flight.in_flight && flight.schedule.is_due(Instant::now())
        };

        if due {
            self.refresh_entry(url, entry)?;
        }
        Ok(())
    }

    /// The shared refresh-or-join path used by both scheduled and
    /// on-demand refreshes.
    fn refresh_entry(
        &self,
        url: &str,
        entry: &SourceEntry,
    ) -> Result<Arc<KeySetSnapshot>, FetchError> {
        {
            let mut flight = entry.flight.lock().unwrap();
            while flight.in_flight {
                let joined = flight.epoch;
                while flight.in_flight && flight.epoch == joined {
                    flight = entry.landed.wait(flight).unwrap();
                }
                if flight.epoch != joined {
                    if let Some(outcome) = flight.last_outcome.clone() {
                        return outcome;
                    }
                }
                // Another caller became leader before us; wait again.
            }
            flight.in_flight = true;
        }

        // Network call happens with no locks held.
        let result = self.fetcher.fetch(url);
        let now = Instant::now();

        let mut flight = entry.flight.lock().unwrap();
        flight.in_flight = false;
        flight.epoch += 1;

        let outcome = match result {
            Ok((snapshot, hints)) => {
                let snapshot = Arc::new(snapshot);
                flight.schedule.mark_refreshed(now, &hints);
                *entry.current.write().unwrap() = Some(Arc::clone(&snapshot));
                tracing::info!(
                    url = %url,
                    keys = snapshot.len(),
                    ttl_hint_secs = hints.ttl.map(|t| t.as_secs()),
                    "Installed JWKS snapshot"
                );
                Ok(snapshot)
            }
            // The previous snapshot stays installed; only the outcome
            // slot records the failure.
            Err(e) => Err(e),
        };

        flight.last_outcome = Some(outcome.clone());
        entry.landed.notify_all();
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jwks::fetch::CacheHints;
    use crate::jwks::snapshot::{Key, KeyFamily};
    use jsonwebtoken::DecodingKey;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::{Duration, SystemTime};

    const SOURCE: &str = "https://issuer.example/certs";

    fn test_key(kid: &str) -> Key {
        let decoding_key = DecodingKey::from_rsa_components(
            "sXchDaQebHnPiGvyDOAT4saGEUetSyo9MKLOoWFsueri23bOdgWp4Dy1Ww",
            "AQAB",
        )
        .unwrap();
        Key::new(kid.to_string(), KeyFamily::Rsa, decoding_key)
    }

    fn test_snapshot(url: &str, kids: &[&str]) -> KeySetSnapshot {
        KeySetSnapshot::new(
            url.to_string(),
            SystemTime::now(),
            kids.iter().map(|kid| test_key(kid)),
        )
    }

    fn test_sources() -> Vec<SourceConfig> {
        vec![SourceConfig::new(SOURCE)]
    }

    /// Serves a fixed set of kids, counting fetches; optional delay to
    /// widen the in-flight window for concurrency tests.
    struct FakeFetcher {
        kids: Vec<&'static str>,
        fetches: AtomicUsize,
        delay: Duration,
        fail: bool,
    }

    impl FakeFetcher {
        fn serving(kids: &[&'static str]) -> Self {
            Self {
                kids: kids.to_vec(),
                fetches: AtomicUsize::new(0),
                delay: Duration::ZERO,
                fail: false,
            }
        }

        fn failing() -> Self {
            Self {
                kids: Vec::new(),
                fetches: AtomicUsize::new(0),
                delay: Duration::ZERO,
                fail: true,
            }
        }

        fn with_delay(mut self, delay: Duration) -> Self {
            self.delay = delay;
            self
        }

        fn count(&self) -> usize {
            self.fetches.load(Ordering::SeqCst)
        }
    }

    impl KeySetFetcher for FakeFetcher {
        fn fetch(&self, source_url: &str) -> Result<(KeySetSnapshot, CacheHints), FetchError> {
            self.fetches.fetch_add(1, Ordering::SeqCst);
            if !self.delay.is_zero() {
                std::thread::sleep(self.delay);
            }
            if self.fail {
                return Err(FetchError::Network {
                    url: source_url.to_string(),
                    reason: "connection refused".to_string(),
                });
            }
            Ok((test_snapshot(source_url, &self.kids), CacheHints::default()))
        }
    }

    #[test]
    fn test_get_before_first_fetch_is_none() {
        let cache = KeyCache::new(&test_sources(), Box::new(FakeFetcher::serving(&["a"])));
        assert!(cache.get(SOURCE).is_none());
    }

    #[test]
    fn test_refresh_now_installs_snapshot() {
        let cache = KeyCache::new(&test_sources(), Box::new(FakeFetcher::serving(&["a", "b"])));

        let snapshot = cache.refresh_now(SOURCE).unwrap();
        assert_eq!(snapshot.len(), 2);

        let got = cache.get(SOURCE).unwrap();
        assert!(Arc::ptr_eq(&snapshot, &got));
    }

    #[test]
    fn test_warm_fetches_every_source() {
        let sources = vec![
            SourceConfig::new("https://a.example/certs"),
            SourceConfig::new("https://b.example/certs"),
        ];
        let fetcher = Arc::new(FakeFetcher::serving(&["k"]));
        let cache = KeyCache::new(&sources, Box::new(SharedFetcher(Arc::clone(&fetcher))));

        cache.warm().unwrap();
        assert_eq!(fetcher.count(), 2);
        assert!(cache.get("https://a.example/certs").is_some());
        assert!(cache.get("https://b.example/certs").is_some());
    }

    #[test]
    fn test_warm_fails_fast_when_source_unreachable() {
        let cache = KeyCache::new(&test_sources(), Box::new(FakeFetcher::failing()));
        assert!(matches!(cache.warm(), Err(FetchError::Network { .. })));
        assert!(cache.get(SOURCE).is_none());
    }

    #[test]
    fn test_failed_refresh_keeps_previous_snapshot() {
        let fetcher = Arc::new(FlakyFetcher::new());
        let cache = KeyCache::new(&test_sources(), Box::new(SharedFlaky(Arc::clone(&fetcher))));

        let first = cache.refresh_now(SOURCE).unwrap();

        fetcher.fail_next.store(true, Ordering::SeqCst);
        let result = cache.refresh_now(SOURCE);
        assert!(matches!(
            result,
            Err(CacheError::Fetch(FetchError::Network { .. }))
        ));

        // Stale snapshot still serves.
        let got = cache.get(SOURCE).unwrap();
        assert!(Arc::ptr_eq(&first, &got));
    }

    #[test]
    fn test_unknown_source_is_rejected() {
        let cache = KeyCache::new(&test_sources(), Box::new(FakeFetcher::serving(&["a"])));
        assert!(matches!(
            cache.refresh_now("https://other.example/certs"),
            Err(CacheError::UnknownSource(_))
        ));
        assert!(cache.get("https://other.example/certs").is_none());
    }

    #[test]
    fn test_refresh_if_due_honors_floor() {
        let fetcher = Arc::new(FakeFetcher::serving(&["a"]));
        let cache = KeyCache::new(&test_sources(), Box::new(SharedFetcher(Arc::clone(&fetcher))));

        cache.refresh_if_due(SOURCE).unwrap();
        assert_eq!(fetcher.count(), 1);

        // Immediately after a fetch the 15-minute floor applies.
        cache.refresh_if_due(SOURCE).unwrap();
        cache.refresh_if_due(SOURCE).unwrap();
        assert_eq!(fetcher.count(), 1);
    }

    #[test]
    fn test_concurrent_refreshes_collapse_to_one_fetch() {
        let fetcher = Arc::new(FakeFetcher::serving(&["a"]).with_delay(Duration::from_millis(200)));
        let cache = Arc::new(KeyCache::new(
            &test_sources(),
            Box::new(SharedFetcher(Arc::clone(&fetcher))),
        ));

        let leader = {
            let cache = Arc::clone(&cache);
            std::thread::spawn(move || cache.refresh_now(SOURCE).unwrap())
        };

        // Let the leader's fetch get in flight, then pile on waiters.
        std::thread::sleep(Duration::from_millis(50));
        let waiters: Vec<_> = (0..4)
            .map(|_| {
                let cache = Arc::clone(&cache);
                std::thread::spawn(move || cache.refresh_now(SOURCE).unwrap())
            })
            .collect();

        let lead_snapshot = leader.join().unwrap();
        for waiter in waiters {
            let snapshot = waiter.join().unwrap();
            assert!(Arc::ptr_eq(&lead_snapshot, &snapshot));
        }

        assert_eq!(fetcher.count(), 1);
    }

    #[test]
    fn test_concurrent_waiters_share_the_failure() {
        let fetcher = Arc::new(FakeFetcher::failing().with_delay(Duration::from_millis(200)));
        let cache = Arc::new(KeyCache::new(
            &test_sources(),
            Box::new(SharedFetcher(Arc::clone(&fetcher))),
        ));

        let leader = {
            let cache = Arc::clone(&cache);
            std::thread::spawn(move || cache.refresh_now(SOURCE))
        };

        std::thread::sleep(Duration::from_millis(50));
        let waiters: Vec<_> = (0..3)
            .map(|_| {
                let cache = Arc::clone(&cache);
                std::thread::spawn(move || cache.refresh_now(SOURCE))
            })
            .collect();

        assert!(leader.join().unwrap().is_err());
        for waiter in waiters {
            assert!(matches!(
                waiter.join().unwrap(),
                Err(CacheError::Fetch(FetchError::Network { .. }))
            ));
        }

        assert_eq!(fetcher.count(), 1);
    }

    #[test]
    fn test_one_sources_flight_never_blocks_another() {
        const SLOW: &str = "https://slow.example/certs";
        const FAST: &str = "https://fast.example/certs";

        let fetcher = Arc::new(SelectiveDelayFetcher {
            slow_url: SLOW,
            delay: Duration::from_millis(400),
            counts: Mutex::new(HashMap::new()),
        });
        let sources = vec![SourceConfig::new(SLOW), SourceConfig::new(FAST)];
        let cache = Arc::new(KeyCache::new(
            &sources,
            Box::new(SharedDelay(Arc::clone(&fetcher))),
        ));

        let slow = {
            let cache = Arc::clone(&cache);
            std::thread::spawn(move || cache.refresh_now(SLOW).unwrap())
        };

        // Let the slow source's fetch get in flight, then hit the other
        // source: it must complete while the slow flight is still asleep.
        std::thread::sleep(Duration::from_millis(50));
        let started = Instant::now();
        let snapshot = cache.refresh_now(FAST).unwrap();
        assert!(started.elapsed() < Duration::from_millis(300));
        assert_eq!(snapshot.source_url(), FAST);
        assert!(cache.get(FAST).is_some());

        slow.join().unwrap();
        assert_eq!(fetcher.count(SLOW), 1);
        assert_eq!(fetcher.count(FAST), 1);
    }

    /// Newtype so one counting fetcher can be observed from the test
    /// while the cache owns a boxed handle to it.
    struct SharedFetcher(Arc<FakeFetcher>);

    impl KeySetFetcher for SharedFetcher {
        fn fetch(&self, source_url: &str) -> Result<(KeySetSnapshot, CacheHints), FetchError> {
            self.0.fetch(source_url)
        }
    }

    /// Delays fetches of one URL only, counting fetches per source.
    struct SelectiveDelayFetcher {
        slow_url: &'static str,
        delay: Duration,
        counts: Mutex<HashMap<String, usize>>,
    }

    impl SelectiveDelayFetcher {
        fn count(&self, url: &str) -> usize {
            self.counts.lock().unwrap().get(url).copied().unwrap_or(0)
        }
    }

    impl KeySetFetcher for SelectiveDelayFetcher {
        fn fetch(&self, source_url: &str) -> Result<(KeySetSnapshot, CacheHints), FetchError> {
            *self
                .counts
                .lock()
                .unwrap()
                .entry(source_url.to_string())
                .or_insert(0) += 1;
            if source_url == self.slow_url {
                std::thread::sleep(self.delay);
            }
            Ok((test_snapshot(source_url, &["k"]), CacheHints::default()))
        }
    }

    struct SharedDelay(Arc<SelectiveDelayFetcher>);

    impl KeySetFetcher for SharedDelay {
        fn fetch(&self, source_url: &str) -> Result<(KeySetSnapshot, CacheHints), FetchError> {
            self.0.fetch(source_url)
        }
    }

    /// Succeeds until `fail_next` is set.
    struct FlakyFetcher {
        fail_next: std::sync::atomic::AtomicBool,
    }

    impl FlakyFetcher {
        fn new() -> Self {
            Self {
                fail_next: std::sync::atomic::AtomicBool::new(false),
            }
        }
    }

    struct SharedFlaky(Arc<FlakyFetcher>);

    impl KeySetFetcher for SharedFlaky {
        fn fetch(&self, source_url: &str) -> Result<(KeySetSnapshot, CacheHints), FetchError> {
            if self.0.fail_next.load(Ordering::SeqCst) {
                return Err(FetchError::Network {
                    url: source_url.to_string(),
                    reason: "connection reset".to_string(),
                });
            }
            Ok((test_snapshot(source_url, &["a"]), CacheHints::default()))
        }
    }
}
