//! Key resolution: kid -> verification key, tolerating rotation.
//!
//! The common path is a cache hit with no network traffic. On a miss the
//! resolver refreshes the source once (the kid may belong to a freshly
//! rotated key) and retries against the new snapshot. One refresh per
//! resolve call, at most: a malformed or malicious token must not be able
//! to amplify into unbounded refresh traffic.

use std::sync::Arc;

use thiserror::Error;

use crate::jwks::cache::{CacheError, KeyCache};
use crate::jwks::fetch::FetchError;
use crate::jwks::snapshot::Key;

#[derive(Debug, Error)]
pub enum ResolveError {
    #[error("Unknown key ID: {0}")]
    UnknownKey(String),

    #[error("Source is not configured: {0}")]
    UnknownSource(String),

    #[error(transparent)]
    Fetch(#[from] FetchError),
}

/// Resolves key IDs against a [`KeyCache`].
pub struct KeyResolver {
    cache: Arc<KeyCache>,
}

impl KeyResolver {
    pub fn new(cache: Arc<KeyCache>) -> Self {
        Self { cache }
    }

    /// Look up `kid` in the current snapshot of `url`.
    ///
    /// On a hit the key is returned without any network call. On a miss
    /// the source is refreshed once and the lookup retried; a second miss
    /// is [`ResolveError::UnknownKey`] without a further fetch.
    pub fn resolve(&self, url: &str, kid: &str) -> Result<Arc<Key>, ResolveError> {
        if let Some(snapshot) = self.cache.get(url) {
            if let Some(key) = snapshot.key(kid) {
                return Ok(key);
            }
        }

        tracing::debug!(url = %url, kid = %kid, "Key not in snapshot, refreshing");

        let snapshot = match self.cache.refresh_now(url) {
            Ok(snapshot) => snapshot,
            Err(CacheError::UnknownSource(url)) => return Err(ResolveError::UnknownSource(url)),
            Err(CacheError::Fetch(e)) => return Err(ResolveError::Fetch(e)),
        };

        snapshot
            .key(kid)
            .ok_or_else(|| ResolveError::UnknownKey(kid.to_string()))
    }
}
