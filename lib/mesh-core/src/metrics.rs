//! Prometheus metrics for the discovery cache and router

use crate::{CoreError, Result};
use prometheus::{Counter, CounterVec, Encoder, Opts, Registry, TextEncoder};
use std::sync::Arc;

/// Counters shared by the service cache and the router.
///
/// Clones share the same underlying counters and registry.
#[derive(Clone)]
pub struct DiscoveryMetrics {
    /// Lookups answered from a fresh cache entry
    pub cache_hits_total: Counter,
    /// Lookups that had to go to the registry
    pub cache_misses_total: Counter,
    /// Lookups answered from an expired entry because the registry failed
    pub cache_stale_served_total: Counter,
    /// Calls made to the registry on behalf of readers
    pub registry_fetches_total: Counter,
    /// Watch stream open/read failures by component
    pub watch_failures_total: CounterVec,
    /// Full routing table refreshes by result
    pub route_refreshes_total: CounterVec,
    /// Routes removed for not being reconfirmed
    pub routes_pruned_total: Counter,
    /// Router lookups by answer source
    pub route_lookups_total: CounterVec,
    /// Prometheus registry holding the metrics above
    pub registry: Arc<Registry>,
}

impl DiscoveryMetrics {
    /// Create a new metrics set with its own registry
    pub fn new() -> Result<Self> {
        let registry = Arc::new(Registry::new());

        let cache_hits_total = Counter::new(
            "discovery_cache_hits_total",
            "Service lookups answered from a fresh cache entry",
        )
        .map_err(internal)?;

        let cache_misses_total = Counter::new(
            "discovery_cache_misses_total",
            "Service lookups that required a registry fetch",
        )
        .map_err(internal)?;

        let cache_stale_served_total = Counter::new(
            "discovery_cache_stale_served_total",
            "Service lookups answered with stale data after a registry failure",
        )
        .map_err(internal)?;

        let registry_fetches_total = Counter::new(
            "discovery_registry_fetches_total",
            "Registry GetService calls issued by the cache",
        )
        .map_err(internal)?;

        let watch_failures_total = CounterVec::new(
            Opts::new(
                "discovery_watch_failures_total",
                "Registry watch stream failures",
            ),
            &["component"],
        )
        .map_err(internal)?;

        let route_refreshes_total = CounterVec::new(
            Opts::new(
                "discovery_route_refreshes_total",
                "Full routing table refreshes",
            ),
            &["result"],
        )
        .map_err(internal)?;

        let routes_pruned_total = Counter::new(
            "discovery_routes_pruned_total",
            "Routes pruned for not being reconfirmed by a refresh",
        )
        .map_err(internal)?;

        let route_lookups_total = CounterVec::new(
            Opts::new("discovery_route_lookups_total", "Router lookups"),
            &["source"],
        )
        .map_err(internal)?;

        registry
            .register(Box::new(cache_hits_total.clone()))
            .map_err(internal)?;
        registry
            .register(Box::new(cache_misses_total.clone()))
            .map_err(internal)?;
        registry
            .register(Box::new(cache_stale_served_total.clone()))
            .map_err(internal)?;
        registry
            .register(Box::new(registry_fetches_total.clone()))
            .map_err(internal)?;
        registry
            .register(Box::new(watch_failures_total.clone()))
            .map_err(internal)?;
        registry
            .register(Box::new(route_refreshes_total.clone()))
            .map_err(internal)?;
        registry
            .register(Box::new(routes_pruned_total.clone()))
            .map_err(internal)?;
        registry
            .register(Box::new(route_lookups_total.clone()))
            .map_err(internal)?;

        Ok(Self {
            cache_hits_total,
            cache_misses_total,
            cache_stale_served_total,
            registry_fetches_total,
            watch_failures_total,
            route_refreshes_total,
            routes_pruned_total,
            route_lookups_total,
            registry,
        })
    }

    /// Gather all metrics in Prometheus text format
    pub fn gather(&self) -> Result<String> {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = vec![];
        encoder.encode(&metric_families, &mut buffer).map_err(internal)?;
        String::from_utf8(buffer).map_err(internal)
    }
}

impl Default for DiscoveryMetrics {
    fn default() -> Self {
        Self::new().expect("Failed to create default DiscoveryMetrics")
    }
}

fn internal(e: impl std::fmt::Display) -> CoreError {
    CoreError::Internal(format!("metrics: {}", e))
}
