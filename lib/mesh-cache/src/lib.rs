//! Caching layer in front of a service registry
//!
//! [`ServiceCache`] answers `get_service` from memory while entries are
//! fresh, collapses concurrent misses into one registry call, keeps entries
//! current through per-service watchers and falls back to stale data when the
//! registry is unreachable.

pub mod backoff;
pub mod cache;
pub mod singleflight;

pub use backoff::Backoff;
pub use cache::{CacheOptions, ServiceCache};
pub use singleflight::Group;
