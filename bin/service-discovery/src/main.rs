use anyhow::{Context, Result};
use mesh_cache::{CacheOptions, ServiceCache};
use mesh_core::{Config, DiscoveryMetrics, MemoryRegistry, Registry};
use mesh_router::{MemoryTable, ReadOptions, Router, RouterOptions, Table};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

/// Set to `json` for structured log output
const LOG_FORMAT_ENV: &str = "MESH_LOG_FORMAT";

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    info!("Starting service-discovery daemon...");

    let config = Config::from_env().context("Failed to load configuration")?;
    config.validate().context("Invalid configuration")?;
    debug!("Loaded config: {:?}", config);

    let metrics = DiscoveryMetrics::new()?;

    // Create service registry
    let registry = Arc::new(MemoryRegistry::new());
    info!("Service registry initialized");

    // Cache in front of the registry; the router reads through it
    let cache = Arc::new(ServiceCache::with_metrics(
        registry.clone(),
        CacheOptions::from(&config.cache),
        metrics.clone(),
    ));
    info!("Service cache initialized with {:?} TTL", config.cache.ttl());

    let table = Arc::new(MemoryTable::new());
    let options = RouterOptions::from_config(&config.router, cache.clone() as Arc<dyn Registry>);
    let router = Router::with_metrics(options, table.clone(), metrics.clone()).await?;
    info!("Router {} initialized", router.options().await.id);

    let status_interval = config.router.refresh_interval();
    let status = tokio::spawn(report_status(
        table.clone(),
        registry.clone(),
        cache.clone(),
        status_interval,
    ));

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;
    info!("Shutdown signal received");

    status.abort();
    cache.stop();
    router.close().context("Failed to close router")?;

    match metrics.gather() {
        Ok(text) => info!("Final metrics:\n{}", text),
        Err(e) => warn!("Failed to gather metrics: {}", e),
    }

    info!("service-discovery stopped");
    Ok(())
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let json = std::env::var(LOG_FORMAT_ENV)
        .map(|format| format.eq_ignore_ascii_case("json"))
        .unwrap_or(false);

    if json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(true)
            .init();
    }
}

/// Log a status line every `interval`
async fn report_status(
    table: Arc<MemoryTable>,
    registry: Arc<MemoryRegistry>,
    cache: Arc<ServiceCache>,
    interval: Duration,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.tick().await;

    loop {
        ticker.tick().await;

        let routes = match table.read(ReadOptions::all()).await {
            Ok(routes) => routes.len(),
            Err(e) => {
                warn!("Failed to read routing table: {}", e);
                continue;
            }
        };

        info!(
            "Status: {} routes, {} registered services, {} cached services{}",
            routes,
            registry.service_count().await,
            cache.len().await,
            match cache.status().await {
                Some(e) => format!(", registry failing: {}", e),
                None => String::new(),
            }
        );
    }
}
