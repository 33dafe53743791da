//! Registry-backed router
//!
//! Lookups are answered from the routing table when it has matching routes
//! and from the registry otherwise. With caching enabled two background
//! tasks keep the table in sync: a rate-limited full refresh that also prunes
//! routes nobody reconfirmed, and a long-lived wildcard watch applying
//! membership changes as they happen.

use crate::options::{filter, LookupOptions, ReadOptions, RouterOptions};
use crate::table::{Table, TableWatcher};
use mesh_api::{Action, Route, Service, WatchEvent, WILDCARD};
use mesh_core::{CoreError, DiscoveryMetrics, Result, WatchOptions, Watcher};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, RwLock};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

/// Router maintains a routing table derived from registry membership
pub struct Router {
    inner: Arc<Inner>,
}

struct Inner {
    options: RwLock<RouterOptions>,
    table: Arc<dyn Table>,
    // Holds at most one pending refresh request
    refresh: mpsc::Sender<()>,
    // Bumped by init to reopen the registry watch
    reset: watch::Sender<()>,
    shutdown: CancellationToken,
    metrics: DiscoveryMetrics,
}

impl Router {
    /// Create a router over `table` and start its background sync
    pub async fn new(options: RouterOptions, table: Arc<dyn Table>) -> Result<Self> {
        Self::with_metrics(options, table, DiscoveryMetrics::default()).await
    }

    /// Create a router recording into a shared metrics set
    pub async fn with_metrics(
        options: RouterOptions,
        table: Arc<dyn Table>,
        metrics: DiscoveryMetrics,
    ) -> Result<Self> {
        if let Some(gateway) = &options.gateway {
            seed_gateway(table.as_ref(), gateway, &options.id).await?;
        }

        info!(
            "Starting router {} (cache: {}, gateway: {:?})",
            options.id, options.cache, options.gateway
        );

        let (refresh, refresh_rx) = mpsc::channel(1);
        let (reset, reset_rx) = watch::channel(());

        let inner = Arc::new(Inner {
            options: RwLock::new(options),
            table,
            refresh,
            reset,
            shutdown: CancellationToken::new(),
            metrics,
        });

        tokio::spawn(inner.clone().run_refresh(refresh_rx));
        tokio::spawn(inner.clone().run_watch(reset_rx));
        inner.request_refresh();

        Ok(Self { inner })
    }

    /// Routes for `service` passing `options`.
    ///
    /// Falls back to the registry when the table has nothing matching, and
    /// caches what it finds there when caching is enabled.
    pub async fn lookup(&self, service: &str, options: &LookupOptions) -> Result<Vec<Route>> {
        let inner = &self.inner;

        let routes = filter(
            inner.table.read(ReadOptions::service(service)).await?,
            options,
        );
        if !routes.is_empty() {
            inner
                .metrics
                .route_lookups_total
                .with_label_values(&["table"])
                .inc();
            return Ok(routes);
        }

        let router = inner.options.read().await.clone();
        trace!("Fetching routes for {} from registry", service);
        inner
            .metrics
            .route_lookups_total
            .with_label_values(&["registry"])
            .inc();

        let services = match router.registry.get_service(service).await {
            Ok(services) => services,
            Err(e) if e.is_not_found() => {
                trace!("Failed to find route for {}", service);
                return Err(CoreError::RouteNotFound);
            }
            Err(e) => {
                debug!("Failed to find route for {}: {}", service, e);
                return Err(e);
            }
        };

        let routes: Vec<Route> = services
            .iter()
            .flat_map(|srv| routes_for(srv, srv.domain(), &router.id))
            .collect();

        if router.cache {
            for route in &routes {
                if let Err(e) = inner.upsert(route).await {
                    debug!("Failed caching route for {}: {}", route.service, e);
                }
            }
        }

        let routes = filter(routes, options);
        if routes.is_empty() {
            return Err(CoreError::RouteNotFound);
        }
        Ok(routes)
    }

    /// Watch routing table changes
    pub async fn watch(&self, options: WatchOptions) -> Result<Box<dyn TableWatcher>> {
        self.inner.table.watch(options).await
    }

    /// Swap the router configuration while running.
    ///
    /// The registry watch is reopened under the new options. A changed
    /// gateway replaces the seeded default route.
    pub async fn init(&self, options: RouterOptions) -> Result<()> {
        let inner = &self.inner;

        let previous = {
            let mut current = inner.options.write().await;
            std::mem::replace(&mut *current, options.clone())
        };

        if previous.gateway != options.gateway || previous.id != options.id {
            if let Some(gateway) = &previous.gateway {
                let route = Route::default_gateway(gateway, &previous.id);
                match inner.table.delete(&route).await {
                    Ok(()) | Err(CoreError::RouteNotFound) => {}
                    Err(e) => return Err(e),
                }
            }
            if let Some(gateway) = &options.gateway {
                seed_gateway(inner.table.as_ref(), gateway, &options.id).await?;
            }
        }

        info!("Router {} re-initialised (cache: {})", options.id, options.cache);
        inner.reset.send_replace(());
        Ok(())
    }

    /// Stop background sync. Safe to call more than once.
    pub fn close(&self) -> Result<()> {
        if !self.inner.shutdown.is_cancelled() {
            info!("Closing router");
        }
        self.inner.shutdown.cancel();
        Ok(())
    }

    pub fn is_closed(&self) -> bool {
        self.inner.shutdown.is_cancelled()
    }

    /// Current router options
    pub async fn options(&self) -> RouterOptions {
        self.inner.options.read().await.clone()
    }

    /// The routing table this router maintains
    pub fn table(&self) -> Arc<dyn Table> {
        self.inner.table.clone()
    }
}

impl Drop for Router {
    fn drop(&mut self) {
        self.inner.shutdown.cancel();
    }
}

impl Inner {
    /// Queue a refresh unless one is already pending
    fn request_refresh(&self) {
        // Full means a refresh is already queued
        let _ = self.refresh.try_send(());
    }

    async fn run_refresh(self: Arc<Self>, mut requests: mpsc::Receiver<()>) {
        // End of the last successful refresh
        let mut last: Option<Instant> = None;

        loop {
            let interval = self.options.read().await.refresh_interval;

            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                request = requests.recv() => {
                    if request.is_none() {
                        break;
                    }
                }
                _ = tokio::time::sleep(interval) => {
                    self.request_refresh();
                    continue;
                }
            }

            let options = self.options.read().await.clone();
            if !options.cache {
                continue;
            }

            if let Some(last) = last {
                if last.elapsed() < options.min_refresh_interval {
                    debug!("Skipping refresh, last one finished {:?} ago", last.elapsed());
                    continue;
                }
            }

            match self.refresh(&options, last).await {
                Ok(()) => last = Some(Instant::now()),
                Err(e) => {
                    self.metrics
                        .route_refreshes_total
                        .with_label_values(&["failure"])
                        .inc();
                    debug!("Failed refreshing registry routes: {}", e);
                }
            }
        }

        debug!("Router refresh loop stopped");
    }

    /// Reload every route from the registry, then prune what was not
    /// reconfirmed since `last`
    async fn refresh(&self, options: &RouterOptions, last: Option<Instant>) -> Result<()> {
        let loaded = self.load_routes(options).await?;

        let mut pruned = 0;
        if let Some(last) = last {
            pruned = self.table.prune_older_than(last.elapsed()).await?;
            self.metrics.routes_pruned_total.inc_by(pruned as f64);
        }

        self.metrics
            .route_refreshes_total
            .with_label_values(&["success"])
            .inc();
        debug!("Refreshed {} routes, pruned {}", loaded, pruned);
        Ok(())
    }

    /// Create or update a route for every node of every listed service.
    /// Individual route failures are logged and skipped.
    async fn load_routes(&self, options: &RouterOptions) -> Result<usize> {
        let services = options.registry.list_services().await?;
        let mut loaded = 0;

        for service in services {
            let network = service.domain().to_string();

            if !service.nodes.is_empty() {
                loaded += self
                    .upsert_all(&routes_for(&service, &network, &options.id))
                    .await;
                continue;
            }

            // Listings may omit nodes, so ask for the full service
            let versions = match options.registry.get_service(&service.name).await {
                Ok(versions) => versions,
                Err(e) => {
                    trace!("Failed to get service {} domain {}: {}", service.name, network, e);
                    continue;
                }
            };
            for version in &versions {
                loaded += self
                    .upsert_all(&routes_for(version, &network, &options.id))
                    .await;
            }
        }

        Ok(loaded)
    }

    async fn upsert_all(&self, routes: &[Route]) -> usize {
        let mut ok = 0;
        for route in routes {
            match self.upsert(route).await {
                Ok(()) => ok += 1,
                Err(e) => warn!(
                    "Error creating route for service {} in domain {}: {}",
                    route.service, route.network, e
                ),
            }
        }
        ok
    }

    /// Create the route, or refresh it if it already exists
    async fn upsert(&self, route: &Route) -> Result<()> {
        match self.table.create(route).await {
            Err(CoreError::DuplicateRoute) => self.table.update(route).await,
            other => other,
        }
    }

    async fn run_watch(self: Arc<Self>, mut reset: watch::Receiver<()>) {
        while !self.shutdown.is_cancelled() {
            let options = self.options.read().await.clone();

            if !options.cache {
                // Nothing to keep in sync until re-initialised
                tokio::select! {
                    _ = self.shutdown.cancelled() => break,
                    _ = reset.changed() => continue,
                }
            }

            trace!("Router starting registry watch");
            let result = match options.registry.watch(WatchOptions::all()).await {
                Ok(watcher) => self.watch_registry(watcher, &mut reset).await,
                Err(e) => {
                    debug!("Failed creating registry watcher: {}", e);
                    Err(e)
                }
            };

            if self.shutdown.is_cancelled() {
                break;
            }

            if let Err(e) = result {
                self.metrics
                    .watch_failures_total
                    .with_label_values(&["router"])
                    .inc();
                debug!("Error watching the registry: {}", e);
                if !self.pause(options.watch_retry_delay).await {
                    break;
                }
            }

            // Events may have been missed while the stream was down
            self.request_refresh();
        }

        debug!("Router watch loop stopped");
    }

    /// Apply events until the stream ends, fails, or a reset or shutdown
    /// stops it
    async fn watch_registry(
        &self,
        mut watcher: Box<dyn Watcher>,
        reset: &mut watch::Receiver<()>,
    ) -> Result<()> {
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => {
                    watcher.stop().await;
                    return Ok(());
                }
                _ = reset.changed() => {
                    debug!("Router reset, reopening registry watch");
                    watcher.stop().await;
                    return Ok(());
                }
                next = watcher.next() => match next {
                    Ok(event) => {
                        if let Err(e) = self.apply(event).await {
                            watcher.stop().await;
                            return Err(e);
                        }
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

    async fn apply(&self, event: WatchEvent) -> Result<()> {
        let WatchEvent {
            action, service, ..
        } = event;

        // The wildcard service belongs to the default gateway
        if service.name == WILDCARD {
            trace!("Ignoring {} event for the wildcard service", action);
            return Ok(());
        }

        let network = service.domain().to_string();
        let router = self.options.read().await.id.clone();
        let routes = routes_for(&service, &network, &router);
        trace!(
            "Router dealing with {} event for {} ({} nodes, domain {})",
            action,
            service.name,
            routes.len(),
            network
        );

        match action {
            Action::Create | Action::Update => {
                for route in &routes {
                    self.upsert(route).await?;
                }
            }
            Action::Delete if routes.is_empty() => {
                self.table.delete_service(&service.name, &network).await?;
            }
            Action::Delete => {
                for route in &routes {
                    match self.table.delete(route).await {
                        Ok(()) | Err(CoreError::RouteNotFound) => {}
                        Err(e) => return Err(e),
                    }
                }
            }
            Action::Override => {
                self.table.delete_service(&service.name, &network).await?;
                for route in &routes {
                    self.upsert(route).await?;
                }
            }
        }

        Ok(())
    }

    /// Sleep unless shut down first. Returns false on shutdown.
    async fn pause(&self, duration: Duration) -> bool {
        tokio::select! {
            _ = self.shutdown.cancelled() => false,
            _ = tokio::time::sleep(duration) => true,
        }
    }
}

/// One direct route per node of `service`
fn routes_for(service: &Service, network: &str, router: &str) -> Vec<Route> {
    service
        .nodes
        .iter()
        .map(|node| Route::for_node(service, node, network, router))
        .collect()
}

async fn seed_gateway(table: &dyn Table, gateway: &str, router: &str) -> Result<()> {
    match table.create(&Route::default_gateway(gateway, router)).await {
        Ok(()) | Err(CoreError::DuplicateRoute) => {
            debug!("Seeded default gateway route via {}", gateway);
            Ok(())
        }
        Err(e) => Err(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::table::MemoryTable;
    use async_trait::async_trait;
    use mesh_api::{EventType, Node, DEFAULT_DOMAIN, DEFAULT_METRIC};
    use mesh_core::Registry;
    use std::future::Future;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Mutex;
    use tokio::sync::broadcast;

    #[derive(Default)]
    struct Counters {
        get: AtomicUsize,
        list: AtomicUsize,
        watch: AtomicUsize,
    }

    #[derive(Default)]
    struct Failures {
        get: AtomicBool,
        list: AtomicBool,
        watch: AtomicBool,
    }

    struct MockRegistry {
        services: Mutex<Vec<Service>>,
        calls: Counters,
        fail: Failures,
        // List services without their nodes
        bare_listing: AtomicBool,
        events: broadcast::Sender<WatchEvent>,
    }

    impl MockRegistry {
        fn new(services: Vec<Service>) -> Arc<Self> {
            let (events, _) = broadcast::channel(16);
            Arc::new(Self {
                services: Mutex::new(services),
                calls: Counters::default(),
                fail: Failures::default(),
                bare_listing: AtomicBool::new(false),
                events,
            })
        }

        fn set_services(&self, services: Vec<Service>) {
            *self.services.lock().unwrap() = services;
        }

        fn send(&self, action: Action, service: Service) {
            self.events.send(WatchEvent::new(action, service)).unwrap();
        }

        fn get_calls(&self) -> usize {
            self.calls.get.load(Ordering::SeqCst)
        }

        fn list_calls(&self) -> usize {
            self.calls.list.load(Ordering::SeqCst)
        }

        fn watchers(&self) -> usize {
            self.events.receiver_count()
        }
    }

    #[async_trait]
    impl Registry for MockRegistry {
        async fn get_service(&self, name: &str) -> Result<Vec<Service>> {
            self.calls.get.fetch_add(1, Ordering::SeqCst);
            if self.fail.get.load(Ordering::SeqCst) {
                return Err(CoreError::Upstream("registry unreachable".to_string()));
            }
            let services: Vec<Service> = self
                .services
                .lock()
                .unwrap()
                .iter()
                .filter(|s| s.name == name)
                .cloned()
                .collect();
            if services.is_empty() {
                return Err(CoreError::ServiceNotFound(name.to_string()));
            }
            Ok(services)
        }

        async fn list_services(&self) -> Result<Vec<Service>> {
            self.calls.list.fetch_add(1, Ordering::SeqCst);
            if self.fail.list.load(Ordering::SeqCst) {
                return Err(CoreError::Upstream("registry unreachable".to_string()));
            }
            let mut services = self.services.lock().unwrap().clone();
            if self.bare_listing.load(Ordering::SeqCst) {
                for service in &mut services {
                    service.nodes.clear();
                }
            }
            Ok(services)
        }

        async fn watch(&self, options: WatchOptions) -> Result<Box<dyn Watcher>> {
            self.calls.watch.fetch_add(1, Ordering::SeqCst);
            if self.fail.watch.load(Ordering::SeqCst) {
                return Err(CoreError::Upstream("watch refused".to_string()));
            }
            Ok(Box::new(MockWatcher {
                rx: self.events.subscribe(),
                options,
            }))
        }
    }

    struct MockWatcher {
        rx: broadcast::Receiver<WatchEvent>,
        options: WatchOptions,
    }

    #[async_trait]
    impl Watcher for MockWatcher {
        async fn next(&mut self) -> Result<WatchEvent> {
            loop {
                match self.rx.recv().await {
                    Ok(event) if self.options.matches(&event.service.name) => return Ok(event),
                    Ok(_) => continue,
                    Err(_) => return Err(CoreError::WatcherStopped),
                }
            }
        }

        async fn stop(&mut self) {}
    }

    /// Table counting successful creates and updates
    #[derive(Default)]
    struct CountingTable {
        table: MemoryTable,
        creates: AtomicUsize,
        updates: AtomicUsize,
    }

    #[async_trait]
    impl Table for CountingTable {
        async fn create(&self, route: &Route) -> Result<()> {
            self.table.create(route).await?;
            self.creates.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn update(&self, route: &Route) -> Result<()> {
            self.table.update(route).await?;
            self.updates.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn delete(&self, route: &Route) -> Result<()> {
            self.table.delete(route).await
        }

        async fn read(&self, options: ReadOptions) -> Result<Vec<Route>> {
            self.table.read(options).await
        }

        async fn delete_service(&self, service: &str, network: &str) -> Result<usize> {
            self.table.delete_service(service, network).await
        }

        async fn prune_older_than(&self, age: Duration) -> Result<usize> {
            self.table.prune_older_than(age).await
        }

        async fn watch(&self, options: WatchOptions) -> Result<Box<dyn TableWatcher>> {
            self.table.watch(options).await
        }
    }

    fn foo_service() -> Service {
        Service::new("foo", "1.0.0")
            .with_node(Node::new("n1", "10.0.0.1"))
            .with_node(Node::new("n2", "10.0.0.2"))
    }

    fn options(registry: &Arc<MockRegistry>, cache: bool) -> RouterOptions {
        let mut options = RouterOptions::new(registry.clone());
        options.id = "router-1".to_string();
        options.cache = cache;
        options.min_refresh_interval = Duration::ZERO;
        options.watch_retry_delay = Duration::from_millis(10);
        options
    }

    async fn eventually<F, Fut>(mut check: F) -> bool
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = bool>,
    {
        for _ in 0..200 {
            if check().await {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        false
    }

    async fn routes(router: &Router, service: &str) -> Vec<Route> {
        router
            .table()
            .read(ReadOptions::service(service))
            .await
            .unwrap()
    }

    async fn routes_of_table(router: &Router) -> Vec<Route> {
        router.table().read(ReadOptions::all()).await.unwrap()
    }

    #[tokio::test]
    async fn test_lookup_queries_registry_once() {
        let registry = MockRegistry::new(vec![foo_service()]);
        let router = Router::new(options(&registry, false), Arc::new(MemoryTable::new()))
            .await
            .unwrap();

        let routes = router
            .lookup("foo", &LookupOptions::default())
            .await
            .unwrap();

        assert_eq!(registry.get_calls(), 1);
        assert_eq!(routes.len(), 2);
        for route in &routes {
            assert_eq!(route.service, "foo");
            assert_eq!(route.network, DEFAULT_DOMAIN);
            assert_eq!(route.metric, DEFAULT_METRIC);
            assert_eq!(route.router, "router-1");
            assert!(route.gateway.is_empty());
        }

        // Without caching nothing lands in the table
        assert!(routes_of_table(&router).await.is_empty());
        router.close().unwrap();
    }

    #[tokio::test]
    async fn test_lookup_caches_registry_answer() {
        let registry = MockRegistry::new(vec![foo_service()]);
        registry.fail.list.store(true, Ordering::SeqCst);
        let router = Router::new(options(&registry, true), Arc::new(MemoryTable::new()))
            .await
            .unwrap();

        router.lookup("foo", &LookupOptions::default()).await.unwrap();
        let routes = router.lookup("foo", &LookupOptions::default()).await.unwrap();

        assert_eq!(routes.len(), 2);
        assert_eq!(registry.get_calls(), 1);
        router.close().unwrap();
    }

    #[tokio::test]
    async fn test_repeated_lookups_never_duplicate_routes() {
        let registry = MockRegistry::new(vec![foo_service()]);
        registry.fail.list.store(true, Ordering::SeqCst);
        let table = Arc::new(CountingTable::default());
        let router = Router::new(options(&registry, true), table.clone())
            .await
            .unwrap();

        router.lookup("foo", &LookupOptions::default()).await.unwrap();
        router.lookup("foo", &LookupOptions::default()).await.unwrap();
        assert_eq!(table.creates.load(Ordering::SeqCst), 2);
        assert_eq!(table.updates.load(Ordering::SeqCst), 0);

        // Nothing in the table matches, so the registry answer is cached again
        let err = router
            .lookup("foo", &LookupOptions::default().network("edge"))
            .await
            .unwrap_err();
        assert_eq!(err, CoreError::RouteNotFound);

        assert_eq!(table.creates.load(Ordering::SeqCst), 2);
        assert_eq!(table.updates.load(Ordering::SeqCst), 2);
        assert_eq!(routes(&router, "foo").await.len(), 2);
        router.close().unwrap();
    }

    #[tokio::test]
    async fn test_lookup_unknown_service() {
        let registry = MockRegistry::new(vec![]);
        let router = Router::new(options(&registry, false), Arc::new(MemoryTable::new()))
            .await
            .unwrap();

        let err = router
            .lookup("missing", &LookupOptions::default())
            .await
            .unwrap_err();
        assert_eq!(err, CoreError::RouteNotFound);
        router.close().unwrap();
    }

    #[tokio::test]
    async fn test_lookup_surfaces_registry_error() {
        let registry = MockRegistry::new(vec![foo_service()]);
        registry.fail.get.store(true, Ordering::SeqCst);
        let router = Router::new(options(&registry, false), Arc::new(MemoryTable::new()))
            .await
            .unwrap();

        let err = router
            .lookup("foo", &LookupOptions::default())
            .await
            .unwrap_err();
        assert!(err.is_transient());
        router.close().unwrap();
    }

    #[tokio::test]
    async fn test_lookup_uses_service_domain() {
        let service = Service::new("foo", "1.0.0")
            .with_metadata("domain", "edge")
            .with_node(Node::new("n1", "10.0.0.1"));
        let registry = MockRegistry::new(vec![service]);
        let router = Router::new(options(&registry, false), Arc::new(MemoryTable::new()))
            .await
            .unwrap();

        let routes = router
            .lookup("foo", &LookupOptions::default().network("edge"))
            .await
            .unwrap();
        assert_eq!(routes.len(), 1);

        let err = router
            .lookup("foo", &LookupOptions::default().network(DEFAULT_DOMAIN))
            .await
            .unwrap_err();
        assert_eq!(err, CoreError::RouteNotFound);
        router.close().unwrap();
    }

    #[tokio::test]
    async fn test_refresh_loads_all_services() {
        let bar = Service::new("bar", "2.0.0").with_node(Node::new("b1", "10.0.1.1"));
        let registry = MockRegistry::new(vec![foo_service(), bar]);
        let router = Router::new(options(&registry, true), Arc::new(MemoryTable::new()))
            .await
            .unwrap();

        assert!(eventually(|| async { routes_of_table(&router).await.len() == 3 }).await);

        // Served from the table
        router.lookup("bar", &LookupOptions::default()).await.unwrap();
        assert_eq!(registry.get_calls(), 0);
        router.close().unwrap();
    }

    #[tokio::test]
    async fn test_refresh_fetches_bare_listings() {
        let registry = MockRegistry::new(vec![foo_service()]);
        registry.bare_listing.store(true, Ordering::SeqCst);
        let router = Router::new(options(&registry, true), Arc::new(MemoryTable::new()))
            .await
            .unwrap();

        assert!(eventually(|| async { routes(&router, "foo").await.len() == 2 }).await);
        assert_eq!(registry.get_calls(), 1);
        router.close().unwrap();
    }

    #[tokio::test]
    async fn test_refresh_prunes_unconfirmed_routes() {
        let registry = MockRegistry::new(vec![foo_service()]);
        let mut options = options(&registry, true);
        options.gateway = Some("10.1.1.1:8080".to_string());
        let router = Router::new(options, Arc::new(MemoryTable::new()))
            .await
            .unwrap();

        assert!(eventually(|| async { routes(&router, "foo").await.len() == 2 }).await);
        tokio::time::sleep(Duration::from_millis(20)).await;

        registry.set_services(vec![
            Service::new("foo", "1.0.0").with_node(Node::new("n1", "10.0.0.1"))
        ]);
        router.inner.request_refresh();

        assert!(eventually(|| async { routes(&router, "foo").await.len() == 1 }).await);
        assert_eq!(routes(&router, "foo").await[0].address, "10.0.0.1");
        assert_eq!(registry.list_calls(), 2);

        // Reconfirmed routes and the default gateway survive
        let all = routes_of_table(&router).await;
        assert!(all.iter().any(Route::is_default_gateway));
        assert_eq!(all.len(), 2);
        router.close().unwrap();
    }

    #[tokio::test]
    async fn test_refresh_rate_limited() {
        let registry = MockRegistry::new(vec![foo_service()]);
        let mut options = options(&registry, true);
        options.min_refresh_interval = Duration::from_secs(60);
        let router = Router::new(options, Arc::new(MemoryTable::new()))
            .await
            .unwrap();

        assert!(eventually(|| async { registry.list_calls() == 1 }).await);
        assert!(eventually(|| async { routes(&router, "foo").await.len() == 2 }).await);

        for _ in 0..5 {
            router.inner.request_refresh();
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(registry.list_calls(), 1);
        router.close().unwrap();
    }

    #[tokio::test]
    async fn test_failed_refresh_does_not_prune() {
        let registry = MockRegistry::new(vec![foo_service()]);
        let router = Router::new(options(&registry, true), Arc::new(MemoryTable::new()))
            .await
            .unwrap();
        assert!(eventually(|| async { routes(&router, "foo").await.len() == 2 }).await);

        registry.fail.list.store(true, Ordering::SeqCst);
        router.inner.request_refresh();
        assert!(eventually(|| async { registry.list_calls() == 2 }).await);
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert_eq!(routes(&router, "foo").await.len(), 2);
        router.close().unwrap();
    }

    #[tokio::test]
    async fn test_watch_events_update_table() {
        let registry = MockRegistry::new(vec![]);
        let router = Router::new(options(&registry, true), Arc::new(MemoryTable::new()))
            .await
            .unwrap();
        assert!(eventually(|| async { registry.watchers() > 0 }).await);

        registry.send(Action::Create, foo_service());
        assert!(eventually(|| async { routes(&router, "foo").await.len() == 2 }).await);

        registry.send(
            Action::Delete,
            Service::new("foo", "1.0.0").with_node(Node::new("n1", "10.0.0.1")),
        );
        assert!(eventually(|| async { routes(&router, "foo").await.len() == 1 }).await);
        assert_eq!(routes(&router, "foo").await[0].address, "10.0.0.2");

        registry.send(Action::Delete, Service::new("foo", "1.0.0"));
        assert!(eventually(|| async { routes(&router, "foo").await.is_empty() }).await);
        router.close().unwrap();
    }

    #[tokio::test]
    async fn test_override_event_replaces_routes() {
        let registry = MockRegistry::new(vec![foo_service()]);
        let router = Router::new(options(&registry, true), Arc::new(MemoryTable::new()))
            .await
            .unwrap();
        assert!(eventually(|| async { routes(&router, "foo").await.len() == 2 }).await);
        assert!(eventually(|| async { registry.watchers() > 0 }).await);

        registry.send(
            Action::Override,
            Service::new("foo", "1.0.0").with_node(Node::new("n3", "10.0.0.3")),
        );

        assert!(
            eventually(|| async {
                let routes = routes(&router, "foo").await;
                routes.len() == 1 && routes[0].address == "10.0.0.3"
            })
            .await
        );
        router.close().unwrap();
    }

    #[tokio::test]
    async fn test_default_gateway_immune_to_delete_events() {
        let registry = MockRegistry::new(vec![]);
        let mut options = options(&registry, true);
        options.gateway = Some("10.1.1.1:8080".to_string());
        let router = Router::new(options, Arc::new(MemoryTable::new()))
            .await
            .unwrap();
        assert!(eventually(|| async { registry.watchers() > 0 }).await);

        let mut wildcard = Service::new(WILDCARD, "");
        wildcard.metadata.insert("domain".to_string(), WILDCARD.to_string());
        registry.send(Action::Delete, wildcard);
        registry.send(Action::Create, foo_service());
        assert!(eventually(|| async { routes(&router, "foo").await.len() == 2 }).await);

        let all = routes_of_table(&router).await;
        assert_eq!(all.len(), 3);
        assert!(all.iter().any(Route::is_default_gateway));
        router.close().unwrap();
    }

    #[tokio::test]
    async fn test_watch_reopens_after_failure() {
        let registry = MockRegistry::new(vec![]);
        registry.fail.watch.store(true, Ordering::SeqCst);
        let metrics = DiscoveryMetrics::new().unwrap();
        let router = Router::with_metrics(
            options(&registry, true),
            Arc::new(MemoryTable::new()),
            metrics.clone(),
        )
        .await
        .unwrap();

        assert!(eventually(|| async { registry.calls.watch.load(Ordering::SeqCst) >= 3 }).await);
        registry.fail.watch.store(false, Ordering::SeqCst);
        assert!(eventually(|| async { registry.watchers() == 1 }).await);

        let failures = metrics
            .watch_failures_total
            .with_label_values(&["router"])
            .get();
        assert!(failures >= 2.0);

        registry.send(Action::Create, foo_service());
        assert!(eventually(|| async { routes(&router, "foo").await.len() == 2 }).await);
        router.close().unwrap();
    }

    #[tokio::test]
    async fn test_init_switches_registry() {
        let first = MockRegistry::new(vec![]);
        let second = MockRegistry::new(vec![]);
        let router = Router::new(options(&first, true), Arc::new(MemoryTable::new()))
            .await
            .unwrap();
        assert!(eventually(|| async { first.watchers() == 1 }).await);

        let mut next = options(&second, true);
        next.gateway = Some("10.2.2.2:8080".to_string());
        router.init(next).await.unwrap();

        assert!(eventually(|| async { second.watchers() == 1 }).await);
        assert!(eventually(|| async { first.watchers() == 0 }).await);

        second.send(Action::Create, foo_service());
        assert!(eventually(|| async { routes(&router, "foo").await.len() == 2 }).await);

        let gateways: Vec<Route> = routes_of_table(&router)
            .await
            .into_iter()
            .filter(Route::is_default_gateway)
            .collect();
        assert_eq!(gateways.len(), 1);
        assert_eq!(gateways[0].gateway, "10.2.2.2:8080");
        assert_eq!(router.options().await.gateway.as_deref(), Some("10.2.2.2:8080"));
        router.close().unwrap();
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let registry = MockRegistry::new(vec![]);
        let router = Router::new(options(&registry, true), Arc::new(MemoryTable::new()))
            .await
            .unwrap();
        assert!(eventually(|| async { registry.watchers() == 1 }).await);

        router.close().unwrap();
        router.close().unwrap();

        assert!(router.is_closed());
        assert!(eventually(|| async { registry.watchers() == 0 }).await);
    }

    #[tokio::test]
    async fn test_refresh_interval_reloads_without_requests() {
        let registry = MockRegistry::new(vec![foo_service()]);
        let mut options = options(&registry, true);
        options.refresh_interval = Duration::from_millis(50);
        let router = Router::new(options, Arc::new(MemoryTable::new()))
            .await
            .unwrap();

        assert!(eventually(|| async { registry.list_calls() >= 3 }).await);
        assert_eq!(routes(&router, "foo").await.len(), 2);
        router.close().unwrap();
    }

    #[tokio::test]
    async fn test_watch_delegates_to_table() {
        let registry = MockRegistry::new(vec![foo_service()]);
        registry.fail.list.store(true, Ordering::SeqCst);
        let router = Router::new(options(&registry, true), Arc::new(MemoryTable::new()))
            .await
            .unwrap();

        let mut watcher = router.watch(WatchOptions::service("foo")).await.unwrap();
        router.lookup("foo", &LookupOptions::default()).await.unwrap();

        let event = watcher.next().await.unwrap();
        assert_eq!(event.event_type, EventType::Create);
        assert_eq!(event.route.service, "foo");
        router.close().unwrap();
    }
}
