//! Router, lookup and table read options

use mesh_api::{Route, WILDCARD};
use mesh_core::{Registry, RouterConfig};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Router configuration
#[derive(Clone)]
pub struct RouterOptions {
    /// Id stamped on every route this router derives
    pub id: String,
    /// Static default gateway. Seeds one wildcard route when set.
    pub gateway: Option<String>,
    /// Keep the table in sync with the registry in the background
    pub cache: bool,
    /// Period of the full table refresh
    pub refresh_interval: Duration,
    /// Refresh requests arriving sooner than this after the last successful
    /// refresh are dropped
    pub min_refresh_interval: Duration,
    /// Pause before reopening a failed registry watch
    pub watch_retry_delay: Duration,
    /// Source of service membership
    pub registry: Arc<dyn Registry>,
}

impl RouterOptions {
    pub fn new(registry: Arc<dyn Registry>) -> Self {
        Self::from_config(&RouterConfig::default(), registry)
    }

    pub fn from_config(config: &RouterConfig, registry: Arc<dyn Registry>) -> Self {
        Self {
            id: config
                .id
                .clone()
                .unwrap_or_else(|| uuid::Uuid::new_v4().to_string()),
            gateway: config.gateway.clone().filter(|gw| !gw.is_empty()),
            cache: config.cache,
            refresh_interval: config.refresh_interval(),
            min_refresh_interval: config.min_refresh_interval(),
            watch_retry_delay: config.watch_retry_delay(),
            registry,
        }
    }
}

impl fmt::Debug for RouterOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RouterOptions")
            .field("id", &self.id)
            .field("gateway", &self.gateway)
            .field("cache", &self.cache)
            .field("refresh_interval", &self.refresh_interval)
            .field("min_refresh_interval", &self.min_refresh_interval)
            .field("watch_retry_delay", &self.watch_retry_delay)
            .finish_non_exhaustive()
    }
}

/// Filters applied to lookup results. `None` or `"*"` matches anything.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct LookupOptions {
    pub address: Option<String>,
    pub gateway: Option<String>,
    pub network: Option<String>,
    pub router: Option<String>,
    pub link: Option<String>,
}

impl LookupOptions {
    pub fn network(mut self, network: impl Into<String>) -> Self {
        self.network = Some(network.into());
        self
    }

    pub fn router(mut self, router: impl Into<String>) -> Self {
        self.router = Some(router.into());
        self
    }

    pub fn address(mut self, address: impl Into<String>) -> Self {
        self.address = Some(address.into());
        self
    }

    pub fn gateway(mut self, gateway: impl Into<String>) -> Self {
        self.gateway = Some(gateway.into());
        self
    }

    pub fn link(mut self, link: impl Into<String>) -> Self {
        self.link = Some(link.into());
        self
    }

    /// Whether `route` passes every filter
    pub fn matches(&self, route: &Route) -> bool {
        field_matches(&self.address, &route.address)
            && field_matches(&self.gateway, &route.gateway)
            && field_matches(&self.network, &route.network)
            && field_matches(&self.router, &route.router)
            && field_matches(&self.link, &route.link)
    }
}

fn field_matches(filter: &Option<String>, value: &str) -> bool {
    match filter.as_deref() {
        None | Some(WILDCARD) => true,
        Some(filter) => filter == value,
    }
}

/// Keep only the routes passing `options`
pub fn filter(routes: Vec<Route>, options: &LookupOptions) -> Vec<Route> {
    routes.into_iter().filter(|r| options.matches(r)).collect()
}

/// Table read scope
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ReadOptions {
    /// Only routes stored under this service name, `"*"` included. `None`
    /// reads the whole table.
    pub service: Option<String>,
}

impl ReadOptions {
    pub fn service(name: impl Into<String>) -> Self {
        Self {
            service: Some(name.into()),
        }
    }

    pub fn all() -> Self {
        Self::default()
    }
}
