//! Mesh API types shared by the discovery cache and the router
//!
//! This library defines the data model exchanged with service registries
//! and routing tables:
//! - Service / Node / Endpoint: registry membership
//! - WatchEvent: membership changes pushed by a registry watch stream
//! - Route / RouteEvent: resolved service routes and routing table changes

pub mod event;
pub mod route;
pub mod service;

pub use event::{Action, EventType, ParseActionError, RouteEvent, WatchEvent};
pub use route::{Route, DEFAULT_LINK, DEFAULT_METRIC};
pub use service::{Endpoint, Node, Service, DEFAULT_DOMAIN, DOMAIN_KEY, WILDCARD};
