//! JWKS fetching, caching, scheduling, and key resolution.

pub mod cache;
pub mod fetch;
pub mod resolve;
pub mod schedule;
pub mod snapshot;

pub use cache::{CacheError, KeyCache};
pub use fetch::{CacheHints, FetchError, HttpFetcher, KeySetFetcher};
pub use resolve::{KeyResolver, ResolveError};
pub use schedule::{spawn_refresh_task, RefreshSchedule, RefreshTask};
pub use snapshot::{Key, KeyFamily, KeySetSnapshot};
