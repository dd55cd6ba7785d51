//! Auto-refreshing JWKS cache and key resolution for JWT verification.
//!
//! This crate resolves "key identifier -> verification key" against one or
//! more remote JWKS endpoints while minimizing network fetches and
//! tolerating key rotation. The workflow is:
//! 1. Startup performs one blocking fetch per configured source (fail fast
//!    if a source is unreachable: no request could ever be verified)
//! 2. A background task refreshes each source on cache-driven intervals,
//!    never more often than the configured floor (default 15 minutes)
//! 3. Per request, the verification adapter resolves the token's kid from
//!    the cached snapshot; a miss triggers one refresh to catch rotation
//!
//! HTTP routing, CORS, and claim/authorization checks belong to the
//! embedding service; the `jsonwebtoken` primitives do the signature math.
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use jwks_refresh::{bootstrap, Config, VerificationKeys};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = Config::from_env()?;
//! let url = config.sources[0].url.clone();
//!
//! // Aborts startup when a source is unreachable.
//! let (cache, _refresh_task) = bootstrap(&config)?;
//!
//! let keys = Arc::new(VerificationKeys::new(cache, url));
//! let claims = keys.verify("eyJ...")?;
//! # Ok(())
//! # }
//! ```

#![deny(unsafe_code)]

pub mod config;
pub mod jwks;
pub mod verify;

use std::sync::Arc;

pub use config::{Config, ConfigError, SourceConfig};
pub use jwks::{
    spawn_refresh_task, CacheError, CacheHints, FetchError, HttpFetcher, Key, KeyCache, KeyFamily,
    KeyResolver, KeySetFetcher, KeySetSnapshot, RefreshTask, ResolveError,
};
pub use verify::{KeyFn, KeyLookupError, VerificationKeys, VerifyError};

/// Build the cache, perform the mandatory initial fetch of every source,
/// and start the background refresh loop.
///
/// Returns the warmed cache and the running [`RefreshTask`]; keep the task
/// alive for the lifetime of the service (dropping it stops the loop).
///
/// # Errors
///
/// Fails when any source's initial fetch fails. Treat that as fatal to
/// process startup: the embedding `main` should propagate it into a
/// non-zero exit.
pub fn bootstrap(config: &Config) -> Result<(Arc<KeyCache>, RefreshTask), FetchError> {
    let fetcher = HttpFetcher::new(config.fetch_timeout);
    let cache = Arc::new(KeyCache::new(&config.sources, Box::new(fetcher)));

    cache.warm()?;

    let task = spawn_refresh_task(Arc::clone(&cache), config.poll_interval);
    Ok((cache, task))
}
