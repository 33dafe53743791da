//! Service registry interface and an in-memory registry

use crate::{CoreError, Result};
use async_trait::async_trait;
use mesh_api::{Action, Service, WatchEvent, WILDCARD};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{broadcast, RwLock};
use tracing::{debug, warn};

/// Capacity of the in-memory watch fan-out channel
const WATCH_BUFFER: usize = 128;

/// Scope of a registry watch
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct WatchOptions {
    /// Only deliver events for this service. `None` or `"*"` watches everything.
    pub service: Option<String>,
}

impl WatchOptions {
    /// Watch a single service
    pub fn service(name: impl Into<String>) -> Self {
        Self {
            service: Some(name.into()),
        }
    }

    /// Watch every service
    pub fn all() -> Self {
        Self::default()
    }

    pub fn matches(&self, name: &str) -> bool {
        match self.service.as_deref() {
            None | Some(WILDCARD) => true,
            Some(service) => service == name,
        }
    }
}

/// Authoritative source of service membership
#[async_trait]
pub trait Registry: Send + Sync {
    /// All versions of a service. Fails with `ServiceNotFound` when unknown.
    async fn get_service(&self, name: &str) -> Result<Vec<Service>>;

    /// Every registered service
    async fn list_services(&self) -> Result<Vec<Service>>;

    /// Open a stream of membership changes
    async fn watch(&self, options: WatchOptions) -> Result<Box<dyn Watcher>>;
}

/// Stream of registry changes
#[async_trait]
pub trait Watcher: Send {
    /// Block until the next event. Returns `WatcherStopped` once stopped.
    async fn next(&mut self) -> Result<WatchEvent>;

    /// Stop the watcher
    async fn stop(&mut self);
}

/// MemoryRegistry keeps services in process and fans changes out to watchers
pub struct MemoryRegistry {
    // Map of service name to version to service
    services: Arc<RwLock<HashMap<String, HashMap<String, Service>>>>,
    events: broadcast::Sender<WatchEvent>,
}

impl MemoryRegistry {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(WATCH_BUFFER);
        Self {
            services: Arc::new(RwLock::new(HashMap::new())),
            events,
        }
    }

    /// Register or update a service version.
    ///
    /// Nodes are merged by id into an existing version, so registering a
    /// single node never drops its siblings.
    pub async fn register(&self, service: Service) -> Result<()> {
        if service.name.is_empty() {
            return Err(CoreError::InvalidConfiguration(
                "service name must not be empty".to_string(),
            ));
        }

        let mut services = self.services.write().await;
        let versions = services.entry(service.name.clone()).or_default();

        let action = match versions.get_mut(&service.version) {
            Some(existing) => {
                for node in &service.nodes {
                    match existing.nodes.iter_mut().find(|n| n.id == node.id) {
                        Some(current) => *current = node.clone(),
                        None => existing.nodes.push(node.clone()),
                    }
                }
                existing.metadata = service.metadata.clone();
                existing.endpoints = service.endpoints.clone();
                Action::Update
            }
            None => {
                versions.insert(service.version.clone(), service.clone());
                Action::Create
            }
        };

        debug!(
            "Registered service: {} {} ({})",
            service.name, service.version, action
        );
        self.publish(WatchEvent::new(action, service));
        Ok(())
    }

    /// Remove nodes from a service version.
    ///
    /// With no nodes listed, the whole version is removed.
    pub async fn deregister(&self, service: Service) -> Result<()> {
        let mut services = self.services.write().await;

        let versions = services
            .get_mut(&service.name)
            .ok_or_else(|| CoreError::ServiceNotFound(service.name.clone()))?;

        let remove_version = match versions.get_mut(&service.version) {
            Some(existing) => {
                if service.nodes.is_empty() {
                    true
                } else {
                    existing
                        .nodes
                        .retain(|n| !service.nodes.iter().any(|del| del.id == n.id));
                    existing.nodes.is_empty()
                }
            }
            None => return Err(CoreError::ServiceNotFound(service.name.clone())),
        };

        if remove_version {
            versions.remove(&service.version);
        }
        if versions.is_empty() {
            services.remove(&service.name);
        }

        debug!("Deregistered service: {} {}", service.name, service.version);
        self.publish(WatchEvent::new(Action::Delete, service));
        Ok(())
    }

    /// Get count of registered service names
    pub async fn service_count(&self) -> usize {
        let services = self.services.read().await;
        services.len()
    }

    fn publish(&self, event: WatchEvent) {
        // An error only means nobody is watching right now
        let _ = self.events.send(event);
    }
}

impl Default for MemoryRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Registry for MemoryRegistry {
    async fn get_service(&self, name: &str) -> Result<Vec<Service>> {
        let services = self.services.read().await;
        let versions = services
            .get(name)
            .filter(|v| !v.is_empty())
            .ok_or_else(|| CoreError::ServiceNotFound(name.to_string()))?;

        let mut result: Vec<Service> = versions.values().cloned().collect();
        result.sort_by(|a, b| a.version.cmp(&b.version));
        Ok(result)
    }

    async fn list_services(&self) -> Result<Vec<Service>> {
        let services = self.services.read().await;
        let mut result: Vec<Service> = services
            .values()
            .flat_map(|versions| versions.values().cloned())
            .collect();
        result.sort_by(|a, b| (&a.name, &a.version).cmp(&(&b.name, &b.version)));
        Ok(result)
    }

    async fn watch(&self, options: WatchOptions) -> Result<Box<dyn Watcher>> {
        Ok(Box::new(MemoryWatcher {
            rx: self.events.subscribe(),
            options,
            stopped: false,
        }))
    }
}

/// Watcher over a [`MemoryRegistry`]
pub struct MemoryWatcher {
    rx: broadcast::Receiver<WatchEvent>,
    options: WatchOptions,
    stopped: bool,
}

#[async_trait]
impl Watcher for MemoryWatcher {
    async fn next(&mut self) -> Result<WatchEvent> {
        loop {
            if self.stopped {
                return Err(CoreError::WatcherStopped);
            }

            match self.rx.recv().await {
                Ok(event) if self.options.matches(&event.service.name) => return Ok(event),
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!("Registry watcher lagged, {} events dropped", skipped);
                }
                Err(broadcast::error::RecvError::Closed) => return Err(CoreError::WatcherStopped),
            }
        }
    }

    async fn stop(&mut self) {
        self.stopped = true;
    }
}
