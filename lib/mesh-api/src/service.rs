//! Registry membership types

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Domain used when neither the service nor its nodes declare one
pub const DEFAULT_DOMAIN: &str = "micro";

/// Matches any value in a query, watch scope or route field
pub const WILDCARD: &str = "*";

/// Metadata key carrying the routing domain of a service
pub const DOMAIN_KEY: &str = "domain";

/// A named, versioned service and the nodes currently serving it
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Service {
    pub name: String,
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
    #[serde(default)]
    pub endpoints: Vec<Endpoint>,
    #[serde(default)]
    pub nodes: Vec<Node>,
}

/// A single instance of a service
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Node {
    pub id: String,
    pub address: String,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

/// Endpoint exposed by a service. Carried through untouched.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Endpoint {
    pub name: String,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

impl Service {
    /// Create a service with no nodes
    pub fn new(name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
            ..Default::default()
        }
    }

    /// Builder helper appending a node
    pub fn with_node(mut self, node: Node) -> Self {
        self.nodes.push(node);
        self
    }

    /// Builder helper setting a service-level metadata entry
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Routing domain of the service.
    ///
    /// Resolution order: service metadata, then the first node's metadata,
    /// then [`DEFAULT_DOMAIN`]. Empty values are skipped.
    pub fn domain(&self) -> &str {
        if let Some(domain) = self.metadata.get(DOMAIN_KEY).filter(|d| !d.is_empty()) {
            return domain;
        }

        self.nodes
            .first()
            .and_then(|node| node.metadata.get(DOMAIN_KEY))
            .filter(|d| !d.is_empty())
            .map(String::as_str)
            .unwrap_or(DEFAULT_DOMAIN)
    }

    /// Find a node by id
    pub fn node(&self, id: &str) -> Option<&Node> {
        self.nodes.iter().find(|n| n.id == id)
    }
}

impl Node {
    pub fn new(id: impl Into<String>, address: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            address: address.into(),
            metadata: HashMap::new(),
        }
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }
}
