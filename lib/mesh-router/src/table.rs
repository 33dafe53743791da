//! Routing table interface and an in-memory table

use crate::options::ReadOptions;
use async_trait::async_trait;
use mesh_api::{EventType, Route, RouteEvent};
use mesh_core::{CoreError, Result, WatchOptions};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, RwLock};
use tokio::time::Instant;
use tracing::{trace, warn};

/// Capacity of the route event fan-out channel
const EVENT_BUFFER: usize = 256;

/// Store of routes keyed by identity
#[async_trait]
pub trait Table: Send + Sync {
    /// Insert a new route. Fails with `DuplicateRoute` if it already exists.
    async fn create(&self, route: &Route) -> Result<()>;

    /// Insert or refresh a route
    async fn update(&self, route: &Route) -> Result<()>;

    /// Remove a route. Fails with `RouteNotFound` if it does not exist.
    async fn delete(&self, route: &Route) -> Result<()>;

    /// Routes in scope, empty when nothing matches
    async fn read(&self, options: ReadOptions) -> Result<Vec<Route>>;

    /// Remove every route of `service` in `network`. Returns how many went.
    async fn delete_service(&self, service: &str, network: &str) -> Result<usize>;

    /// Remove routes not created or updated within `age`, except the
    /// default gateway. Returns how many went.
    async fn prune_older_than(&self, age: Duration) -> Result<usize>;

    /// Stream of table changes
    async fn watch(&self, options: WatchOptions) -> Result<Box<dyn TableWatcher>>;
}

/// Stream of routing table changes
#[async_trait]
pub trait TableWatcher: Send {
    /// Block until the next event. Returns `WatcherStopped` once stopped.
    async fn next(&mut self) -> Result<RouteEvent>;

    async fn stop(&mut self);
}

struct Entry {
    route: Route,
    updated: Instant,
}

/// MemoryTable keeps routes in process
pub struct MemoryTable {
    // Map of service name to route hash to entry
    routes: Arc<RwLock<HashMap<String, HashMap<u64, Entry>>>>,
    events: broadcast::Sender<RouteEvent>,
}

impl MemoryTable {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_BUFFER);
        Self {
            routes: Arc::new(RwLock::new(HashMap::new())),
            events,
        }
    }

    /// Number of routes in the table
    pub async fn len(&self) -> usize {
        let routes = self.routes.read().await;
        routes.values().map(HashMap::len).sum()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    fn publish(&self, event_type: EventType, route: Route) {
        trace!("Table {} route {} -> {}", event_type, route.service, route.address);
        // An error only means nobody is watching right now
        let _ = self.events.send(RouteEvent::new(event_type, route));
    }
}

impl Default for MemoryTable {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Table for MemoryTable {
    async fn create(&self, route: &Route) -> Result<()> {
        let mut routes = self.routes.write().await;
        let service = routes.entry(route.service.clone()).or_default();

        let hash = route.hash();
        if service.contains_key(&hash) {
            return Err(CoreError::DuplicateRoute);
        }

        service.insert(
            hash,
            Entry {
                route: route.clone(),
                updated: Instant::now(),
            },
        );
        self.publish(EventType::Create, route.clone());
        Ok(())
    }

    async fn update(&self, route: &Route) -> Result<()> {
        let mut routes = self.routes.write().await;
        let service = routes.entry(route.service.clone()).or_default();

        let changed = match service.get_mut(&route.hash()) {
            Some(entry) => {
                entry.updated = Instant::now();
                let changed = entry.route != *route;
                if changed {
                    entry.route = route.clone();
                }
                changed
            }
            None => {
                service.insert(
                    route.hash(),
                    Entry {
                        route: route.clone(),
                        updated: Instant::now(),
                    },
                );
                true
            }
        };

        if changed {
            self.publish(EventType::Update, route.clone());
        }
        Ok(())
    }

    async fn delete(&self, route: &Route) -> Result<()> {
        let mut routes = self.routes.write().await;
        let service = routes
            .get_mut(&route.service)
            .ok_or(CoreError::RouteNotFound)?;

        let entry = service
            .remove(&route.hash())
            .ok_or(CoreError::RouteNotFound)?;
        if service.is_empty() {
            routes.remove(&route.service);
        }

        self.publish(EventType::Delete, entry.route);
        Ok(())
    }

    async fn read(&self, options: ReadOptions) -> Result<Vec<Route>> {
        let routes = self.routes.read().await;

        let result: Vec<Route> = match options.service.as_deref() {
            None => routes
                .values()
                .flat_map(|service| service.values())
                .map(|entry| entry.route.clone())
                .collect(),
            Some(name) => routes
                .get(name)
                .map(|service| service.values().map(|entry| entry.route.clone()).collect())
                .unwrap_or_default(),
        };

        Ok(result)
    }

    async fn delete_service(&self, service: &str, network: &str) -> Result<usize> {
        let mut routes = self.routes.write().await;
        let Some(entries) = routes.get_mut(service) else {
            return Ok(0);
        };

        let doomed: Vec<u64> = entries
            .iter()
            .filter(|(_, entry)| entry.route.network == network)
            .map(|(hash, _)| *hash)
            .collect();

        for hash in &doomed {
            if let Some(entry) = entries.remove(hash) {
                self.publish(EventType::Delete, entry.route);
            }
        }
        if entries.is_empty() {
            routes.remove(service);
        }

        Ok(doomed.len())
    }

    async fn prune_older_than(&self, age: Duration) -> Result<usize> {
        let mut routes = self.routes.write().await;
        let mut pruned = 0;

        for entries in routes.values_mut() {
            let stale: Vec<u64> = entries
                .iter()
                .filter(|(_, entry)| {
                    !entry.route.is_default_gateway() && entry.updated.elapsed() > age
                })
                .map(|(hash, _)| *hash)
                .collect();

            for hash in stale {
                if let Some(entry) = entries.remove(&hash) {
                    pruned += 1;
                    self.publish(EventType::Delete, entry.route);
                }
            }
        }
        routes.retain(|_, entries| !entries.is_empty());

        Ok(pruned)
    }

    async fn watch(&self, options: WatchOptions) -> Result<Box<dyn TableWatcher>> {
        Ok(Box::new(MemoryTableWatcher {
            rx: self.events.subscribe(),
            options,
            stopped: false,
        }))
    }
}

/// Watcher over a [`MemoryTable`]
pub struct MemoryTableWatcher {
    rx: broadcast::Receiver<RouteEvent>,
    options: WatchOptions,
    stopped: bool,
}

#[async_trait]
impl TableWatcher for MemoryTableWatcher {
    async fn next(&mut self) -> Result<RouteEvent> {
        loop {
            if self.stopped {
                return Err(CoreError::WatcherStopped);
            }

            match self.rx.recv().await {
                Ok(event) if self.options.matches(&event.route.service) => return Ok(event),
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!("Table watcher lagged, {} events dropped", skipped);
                }
                Err(broadcast::error::RecvError::Closed) => return Err(CoreError::WatcherStopped),
            }
        }
    }

    async fn stop(&mut self) {
        self.stopped = true;
    }
}
