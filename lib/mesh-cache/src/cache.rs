//! Caching front-end over a watchable service registry
//!
//! Lookups are served from memory while fresh. A miss goes to the registry
//! through a per-service call deduplication gate, and a failed refetch falls
//! back to whatever was cached before, however old. Every service read with
//! caching enabled gets one supervised background watcher that merges
//! registry events into the cached copy.

use crate::backoff::{jitter, Backoff};
use crate::singleflight::Group;
use async_trait::async_trait;
use mesh_api::{Action, Service, WatchEvent};
use mesh_core::{
    CacheConfig, CoreError, DiscoveryMetrics, Registry, Result, WatchOptions, Watcher,
};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

/// Upper bound of the random delay before a watcher (re)connects
const MAX_JITTER: Duration = Duration::from_millis(100);

/// Log a warning once every this many consecutive watch failures
const WARN_EVERY: u32 = 4;

/// Service cache options
#[derive(Clone, Debug)]
pub struct CacheOptions {
    /// How long a fetched service stays fresh. Zero disables TTL caching
    /// and background watching.
    pub ttl: Duration,
}

impl Default for CacheOptions {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(60),
        }
    }
}

impl From<&CacheConfig> for CacheOptions {
    fn from(config: &CacheConfig) -> Self {
        Self { ttl: config.ttl() }
    }
}

/// ServiceCache serves registry lookups from memory
pub struct ServiceCache {
    inner: Arc<Inner>,
}

struct Inner {
    registry: Arc<dyn Registry>,
    options: CacheOptions,
    state: RwLock<CacheState>,
    flights: Group<String, Vec<Service>>,
    shutdown: CancellationToken,
    metrics: DiscoveryMetrics,
}

#[derive(Default)]
struct CacheState {
    // Map of service name to every cached version
    services: HashMap<String, Vec<Service>>,
    // Service-level expiry
    ttls: HashMap<String, Instant>,
    // Map of service name to node id to node expiry
    node_ttls: HashMap<String, HashMap<String, Instant>>,
    // Services whose watch events are applied
    watched: HashSet<String>,
    // Services with a live watcher task
    running: HashSet<String>,
    // Upstream error behind the last stale answer or watch failure, cleared
    // by any successful fetch or event
    status: Option<CoreError>,
}

impl ServiceCache {
    /// Create a cache over `registry`
    pub fn new(registry: Arc<dyn Registry>, options: CacheOptions) -> Self {
        Self::with_metrics(registry, options, DiscoveryMetrics::default())
    }

    /// Create a cache recording into a shared metrics set
    pub fn with_metrics(
        registry: Arc<dyn Registry>,
        options: CacheOptions,
        metrics: DiscoveryMetrics,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                registry,
                options,
                state: RwLock::new(CacheState::default()),
                flights: Group::new(),
                shutdown: CancellationToken::new(),
                metrics,
            }),
        }
    }

    /// Get all versions of a service.
    ///
    /// Returns a copy of the cached entry while it and all of its nodes are
    /// fresh. Otherwise fetches from the registry; if that fails and anything
    /// was cached before, the old copy is returned instead of the error.
    pub async fn get_service(&self, name: &str) -> Result<Vec<Service>> {
        let inner = &self.inner;

        let cached = {
            let state = inner.state.read().await;
            if let Some(services) = state.fresh(name, Instant::now()) {
                inner.metrics.cache_hits_total.inc();
                return Ok(services.clone());
            }
            state.services.get(name).cloned().unwrap_or_default()
        };

        inner.metrics.cache_misses_total.inc();
        trace!("Cache miss for service: {}", name);

        let fetcher = inner.clone();
        let key = name.to_string();
        let (result, shared) = inner
            .flights
            .work(key.clone(), move || async move { fetcher.fetch(key).await })
            .await;

        let services = match result {
            Ok(services) => services,
            Err(e) if !cached.is_empty() => {
                inner.metrics.cache_stale_served_total.inc();
                debug!(
                    "Serving stale entry for {} after registry error (shared: {}): {}",
                    name, shared, e
                );
                inner.state.write().await.status = Some(e);
                cached
            }
            Err(e) => return Err(e),
        };

        // Only services that resolved to something are worth watching
        if !inner.options.ttl.is_zero() {
            inner.ensure_watched(name).await;
        }
        Ok(services)
    }

    /// Stop every background watcher. Safe to call more than once.
    pub fn stop(&self) {
        if !self.inner.shutdown.is_cancelled() {
            info!("Stopping service cache");
        }
        self.inner.shutdown.cancel();
    }

    /// Whether watch events are currently applied for `name`
    pub async fn is_watched(&self, name: &str) -> bool {
        self.inner.state.read().await.watched.contains(name)
    }

    /// Number of services with a cached entry, fresh or stale
    pub async fn len(&self) -> usize {
        self.inner.state.read().await.services.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Last upstream error observed, if the registry is currently failing
    pub async fn status(&self) -> Option<CoreError> {
        self.inner.state.read().await.status.clone()
    }
}

impl Drop for ServiceCache {
    fn drop(&mut self) {
        self.inner.shutdown.cancel();
    }
}

#[async_trait]
impl Registry for ServiceCache {
    async fn get_service(&self, name: &str) -> Result<Vec<Service>> {
        ServiceCache::get_service(self, name).await
    }

    async fn list_services(&self) -> Result<Vec<Service>> {
        self.inner.registry.list_services().await
    }

    async fn watch(&self, options: WatchOptions) -> Result<Box<dyn Watcher>> {
        self.inner.registry.watch(options).await
    }
}

impl Inner {
    /// Ask the registry for `name` and cache the answer
    async fn fetch(self: Arc<Self>, name: String) -> Result<Vec<Service>> {
        self.metrics.registry_fetches_total.inc();
        debug!("Fetching service from registry: {}", name);

        let result = match self.registry.get_service(&name).await {
            Ok(services) if services.is_empty() => Err(CoreError::ServiceNotFound(name.clone())),
            other => other,
        };

        let services = result?;
        let mut state = self.state.write().await;
        state.status = None;
        state.store(&name, services.clone(), self.options.ttl);
        Ok(services)
    }

    /// Start a watcher for `name` unless one is already running
    async fn ensure_watched(self: &Arc<Self>, name: &str) {
        if self.shutdown.is_cancelled() {
            return;
        }

        if self.state.read().await.running.contains(name) {
            return;
        }

        {
            // Re-check under the write lock so two readers cannot both spawn
            let mut state = self.state.write().await;
            if state.running.contains(name) {
                return;
            }
            state.watched.insert(name.to_string());
            state.running.insert(name.to_string());
        }

        let inner = self.clone();
        let service = name.to_string();
        tokio::spawn(async move { inner.run_watcher(service).await });
    }

    /// Supervise the watch stream for one service until shutdown
    async fn run_watcher(self: Arc<Self>, service: String) {
        debug!("Starting cache watcher for {}", service);
        let mut backoff = Backoff::default();

        loop {
            if !self.pause(jitter(MAX_JITTER)).await {
                break;
            }

            let result = match self.registry.watch(WatchOptions::service(&service)).await {
                Ok(watcher) => self.watch(watcher, &mut backoff).await,
                Err(e) => Err(e),
            };

            if self.shutdown.is_cancelled() {
                break;
            }

            let Err(e) = result else {
                backoff.reset();
                continue;
            };

            self.state.write().await.status = Some(e.clone());
            self.metrics
                .watch_failures_total
                .with_label_values(&["cache"])
                .inc();

            let delay = backoff.failure();
            if backoff.failures() % WARN_EVERY == 0 {
                warn!(
                    "Cache watcher for {} failed {} times in a row: {}, backing off {:?}",
                    service,
                    backoff.failures(),
                    e,
                    delay
                );
            } else {
                debug!("Cache watcher for {} failed: {}, backing off {:?}", service, e, delay);
            }

            if !self.pause(delay).await {
                break;
            }
        }

        let mut state = self.state.write().await;
        state.watched.remove(&service);
        state.running.remove(&service);
        state.evict(&service);
        debug!("Cache watcher for {} stopped", service);
    }

    /// Apply events from `watcher` until it fails, ends or the cache stops
    async fn watch(&self, mut watcher: Box<dyn Watcher>, backoff: &mut Backoff) -> Result<()> {
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => {
                    watcher.stop().await;
                    return Ok(());
                }
                next = watcher.next() => match next {
                    Ok(event) => {
                        backoff.reset();
                        self.apply(event).await;
                    }
                    Err(CoreError::WatcherStopped) => return Ok(()),
                    Err(e) => {
                        watcher.stop().await;
                        return Err(e);
                    }
                },
            }
        }
    }

    async fn apply(&self, event: WatchEvent) {
        let mut state = self.state.write().await;
        // An event arrived, so the registry is reachable again
        state.status = None;

        if !state.watched.contains(&event.service.name) {
            trace!("Ignoring {} event for unwatched service {}", event.action, event.service.name);
            return;
        }

        trace!("Applying {} event for {}", event.action, event.service.name);
        state.apply(event, self.options.ttl);
    }

    /// Sleep unless shut down first. Returns false on shutdown.
    async fn pause(&self, duration: Duration) -> bool {
        tokio::select! {
            _ = self.shutdown.cancelled() => false,
            _ = tokio::time::sleep(duration) => true,
        }
    }
}

impl CacheState {
    /// The cached entry if it is non-empty, within its service TTL and every
    /// node is within its own TTL
    fn fresh(&self, name: &str, now: Instant) -> Option<&Vec<Service>> {
        let services = self.services.get(name).filter(|s| !s.is_empty())?;

        if !self.ttls.get(name).is_some_and(|expiry| *expiry > now) {
            return None;
        }

        let node_ttls = self.node_ttls.get(name);
        let nodes_fresh = services.iter().flat_map(|s| s.nodes.iter()).all(|node| {
            node_ttls
                .and_then(|ttls| ttls.get(&node.id))
                .is_some_and(|expiry| *expiry > now)
        });

        nodes_fresh.then_some(services)
    }

    /// Replace the entry for `name` with a fetched snapshot
    fn store(&mut self, name: &str, services: Vec<Service>, ttl: Duration) {
        let expiry = Instant::now() + ttl;
        let node_ttls = services
            .iter()
            .flat_map(|s| s.nodes.iter())
            .map(|node| (node.id.clone(), expiry))
            .collect();

        self.node_ttls.insert(name.to_string(), node_ttls);
        self.ttls.insert(name.to_string(), expiry);
        self.services.insert(name.to_string(), services);
    }

    /// Drop the entry for `name` unless the registry is failing, in which
    /// case the entry is kept to serve stale
    fn evict(&mut self, name: &str) {
        if self.status.is_some() {
            return;
        }
        self.remove(name);
    }

    fn remove(&mut self, name: &str) {
        self.services.remove(name);
        self.ttls.remove(name);
        self.node_ttls.remove(name);
    }

    /// Merge a watch event into the cached entry
    fn apply(&mut self, event: WatchEvent, ttl: Duration) {
        let WatchEvent {
            action, service, ..
        } = event;
        let name = service.name.clone();

        if action == Action::Override {
            self.remove(&name);
            return;
        }

        // Nothing is cached until somebody has read the service
        let Some(cached) = self.services.get_mut(&name) else {
            return;
        };
        let index = cached.iter().position(|s| s.version == service.version);

        match action {
            Action::Create | Action::Update => {
                if service.nodes.is_empty() {
                    return;
                }

                let expiry = Instant::now() + ttl;
                let node_ttls = self.node_ttls.entry(name.clone()).or_default();
                for node in &service.nodes {
                    node_ttls.insert(node.id.clone(), expiry);
                }

                match index {
                    Some(i) => {
                        let merged = merge_nodes(&cached[i], service);
                        cached[i] = merged;
                    }
                    None => cached.push(service),
                }
                self.ttls.insert(name, expiry);
            }
            Action::Delete => {
                let Some(i) = index else {
                    return;
                };

                if service.nodes.is_empty() {
                    cached.remove(i);
                } else {
                    cached[i]
                        .nodes
                        .retain(|n| !service.nodes.iter().any(|del| del.id == n.id));
                    if cached[i].nodes.is_empty() {
                        cached.remove(i);
                    }
                }

                if cached.is_empty() {
                    self.evict(&name);
                    return;
                }

                let live: HashSet<&str> = cached
                    .iter()
                    .flat_map(|s| s.nodes.iter())
                    .map(|n| n.id.as_str())
                    .collect();
                if let Some(node_ttls) = self.node_ttls.get_mut(&name) {
                    node_ttls.retain(|id, _| live.contains(id.as_str()));
                }
            }
            Action::Override => {}
        }
    }
}

/// New payload wins for nodes it names; nodes it omits are kept.
///
/// A partial or duplicated event therefore never erases a live node. Kept
/// nodes retain their old expiry, so a node that really went away ages out
/// and forces a refetch.
fn merge_nodes(current: &Service, mut update: Service) -> Service {
    for node in &current.nodes {
        if update.node(&node.id).is_none() {
            update.nodes.push(node.clone());
        }
    }
    update
}
