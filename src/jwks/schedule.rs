//! Refresh scheduling.
//!
//! Decides when a source is due for its next fetch and runs the background
//! refresh loop. The next-eligible time is computed from the last fetch,
//! the configured minimum interval (the floor), and the server-supplied
//! TTL hint:
//!
//! ```text
//! next = last_fetch + max(min_interval, hinted_ttl)
//! ```
//!
//! The floor is never violated, even when a source advertises an
//! aggressive TTL or an `Expires` already in the past. The background
//! loop is additive to on-demand refreshes triggered by cache misses;
//! both go through the same single-flight path in the cache.

use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crate::jwks::cache::KeyCache;
use crate::jwks::fetch::CacheHints;

/// Per-source refresh bookkeeping.
///
/// Pure time arithmetic: `is_due` and `mark_refreshed` take an explicit
/// `now` so scenarios can be tested without a clock.
#[derive(Debug)]
pub struct RefreshSchedule {
    min_interval: Duration,
    last_fetch: Option<Instant>,
    next_due: Option<Instant>,
}

impl RefreshSchedule {
    pub fn new(min_interval: Duration) -> Self {
        Self {
            min_interval,
            last_fetch: None,
            next_due: None,
        }
    }

    /// Whether a refresh is due at `now`. A never-fetched source is
    /// always due.
    pub fn is_due(&self, now: Instant) -> bool {
        match self.next_due {
            Some(next) => now >= next,
            None => true,
        }
    }

    /// Record a successful fetch at `now` and compute the next-eligible
    /// time from the response's cache hints.
    pub fn mark_refreshed(&mut self, now: Instant, hints: &CacheHints) {
        let interval = match hints.ttl {
            Some(ttl) => ttl.max(self.min_interval),
            None => self.min_interval,
        };
        self.last_fetch = Some(now);
        self.next_due = Some(now + interval);
    }

    pub fn last_fetch(&self) -> Option<Instant> {
        self.last_fetch
    }
}

struct Shutdown {
    stop: Mutex<bool>,
    signal: Condvar,
}

/// Handle to the background refresh loop.
///
/// The loop wakes at a fixed poll granularity and refreshes every source
/// that is due. Fetch failures are logged and swallowed; the stale
/// snapshot keeps serving. Dropping the handle stops the loop and joins
/// the thread.
pub struct RefreshTask {
    shutdown: Arc<Shutdown>,
    handle: Option<JoinHandle<()>>,
}

impl RefreshTask {
    /// Explicitly stop the loop and wait for the thread to exit.
    pub fn stop(mut self) {
        self.stop_and_join();
    }

    fn stop_and_join(&mut self) {
        {
            let mut stop = self.shutdown.stop.lock().unwrap();
            *stop = true;
        }
        self.shutdown.signal.notify_all();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for RefreshTask {
    fn drop(&mut self) {
        self.stop_and_join();
    }
}

/// Spawn the background refresh loop for every source in `cache`.
pub fn spawn_refresh_task(cache: Arc<KeyCache>, poll_interval: Duration) -> RefreshTask {
    let shutdown = Arc::new(Shutdown {
        stop: Mutex::new(false),
        signal: Condvar::new(),
    });

    let thread_shutdown = Arc::clone(&shutdown);
    let handle = thread::Builder::new()
        .name("jwks-refresh".to_string())
        .spawn(move || refresh_loop(cache, poll_interval, thread_shutdown))
        .expect("failed to spawn jwks refresh thread");

    RefreshTask {
        shutdown,
        handle: Some(handle),
    }
}

fn refresh_loop(cache: Arc<KeyCache>, poll_interval: Duration, shutdown: Arc<Shutdown>) {
    tracing::debug!(poll_secs = poll_interval.as_secs(), "JWKS refresh loop started");

    loop {
        {
            let stop = shutdown.stop.lock().unwrap();
            if *stop {
                break;
            }
            let (stop, _timeout) = shutdown.signal.wait_timeout(stop, poll_interval).unwrap();
            if *stop {
                break;
            }
        }

        for url in cache.source_urls() {
            if let Err(e) = cache.refresh_if_due(url) {
                // Scheduled refresh failures are non-fatal: the previous
                // snapshot stays installed and keeps serving lookups.
                tracing::warn!(url = %url, error = %e, "Scheduled JWKS refresh failed");
            }
        }
    }

    tracing::debug!("JWKS refresh loop stopped");
}
