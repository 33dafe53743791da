//! Service routes

use crate::service::{Node, Service, WILDCARD};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Link assigned to routes derived from registry membership
pub const DEFAULT_LINK: &str = "local";

/// Metric assigned to routes derived from registry membership
pub const DEFAULT_METRIC: i64 = 100;

/// Route maps a service name to a concrete address
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Route {
    /// Destination service name
    pub service: String,
    /// Address of the destination node
    pub address: String,
    /// Gateway the traffic is sent through; empty for direct routes
    #[serde(default)]
    pub gateway: String,
    /// Network (domain) the route belongs to
    pub network: String,
    /// Id of the router that originated the route
    pub router: String,
    #[serde(default = "default_link")]
    pub link: String,
    #[serde(default = "default_metric")]
    pub metric: i64,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

fn default_link() -> String {
    DEFAULT_LINK.to_string()
}

fn default_metric() -> i64 {
    DEFAULT_METRIC
}

impl Default for Route {
    fn default() -> Self {
        Self {
            service: String::new(),
            address: String::new(),
            gateway: String::new(),
            network: String::new(),
            router: String::new(),
            link: default_link(),
            metric: DEFAULT_METRIC,
            metadata: HashMap::new(),
        }
    }
}

impl Route {
    /// Direct route to a single node of a service
    pub fn for_node(service: &Service, node: &Node, network: &str, router: &str) -> Self {
        Self {
            service: service.name.clone(),
            address: node.address.clone(),
            gateway: String::new(),
            network: network.to_string(),
            router: router.to_string(),
            link: default_link(),
            metric: DEFAULT_METRIC,
            metadata: node.metadata.clone(),
        }
    }

    /// Catch-all route sending every service through `gateway`
    pub fn default_gateway(gateway: &str, router: &str) -> Self {
        Self {
            service: WILDCARD.to_string(),
            address: WILDCARD.to_string(),
            gateway: gateway.to_string(),
            network: WILDCARD.to_string(),
            router: router.to_string(),
            ..Default::default()
        }
    }

    /// Whether this is the seeded catch-all gateway route
    pub fn is_default_gateway(&self) -> bool {
        self.service == WILDCARD && self.address == WILDCARD
    }

    /// Identity hash over (service, address, gateway, network, router).
    ///
    /// Link, metric and metadata are not part of the identity, so a route
    /// with a changed metric replaces the existing entry on update.
    pub fn hash(&self) -> u64 {
        // FNV-1a
        const FNV_OFFSET_BASIS: u64 = 14695981039346656037;
        const FNV_PRIME: u64 = 1099511628211;

        let mut hash = FNV_OFFSET_BASIS;
        for field in [
            &self.service,
            &self.address,
            &self.gateway,
            &self.network,
            &self.router,
        ] {
            // 0xff never occurs in UTF-8, so fields cannot bleed into each other
            for byte in field.bytes().chain(std::iter::once(0xff)) {
                hash ^= byte as u64;
                hash = hash.wrapping_mul(FNV_PRIME);
            }
        }
        hash
    }
}
