//! Core service discovery functionality
//!
//! This library provides:
//! - The registry interface consumed by the cache and router, plus an in-memory registry
//! - The shared error type
//! - Configuration loading
//! - Prometheus metrics for discovery components

pub mod config;
pub mod error;
pub mod metrics;
pub mod registry;

pub use config::{CacheConfig, Config, RouterConfig};
pub use error::{CoreError, Result};
pub use metrics::DiscoveryMetrics;
pub use registry::{MemoryRegistry, Registry, WatchOptions, Watcher};
