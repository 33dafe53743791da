//! Watch events emitted by registries and routing tables

use crate::{Route, Service};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Kind of membership change carried by a [`WatchEvent`].
///
/// The set is closed: unknown actions are rejected when parsing or
/// deserializing instead of being passed through.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    Create,
    Update,
    Delete,
    /// Invalidate everything known about the service
    Override,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Unknown watch action: {0}")]
pub struct ParseActionError(pub String);

impl Action {
    pub fn as_str(&self) -> &'static str {
        match self {
            Action::Create => "create",
            Action::Update => "update",
            Action::Delete => "delete",
            Action::Override => "override",
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Action {
    type Err = ParseActionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "create" => Ok(Action::Create),
            "update" => Ok(Action::Update),
            "delete" => Ok(Action::Delete),
            "override" => Ok(Action::Override),
            other => Err(ParseActionError(other.to_string())),
        }
    }
}

/// A single change observed on a registry watch stream
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct WatchEvent {
    pub action: Action,
    pub service: Service,
    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,
}

impl WatchEvent {
    pub fn new(action: Action, service: Service) -> Self {
        Self {
            action,
            service,
            timestamp: Utc::now(),
        }
    }
}

/// Kind of routing table change
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventType {
    Create,
    Update,
    Delete,
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            EventType::Create => "create",
            EventType::Update => "update",
            EventType::Delete => "delete",
        };
        f.write_str(s)
    }
}

/// A routing table change delivered to table watchers
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RouteEvent {
    pub id: String,
    pub event_type: EventType,
    pub timestamp: DateTime<Utc>,
    pub route: Route,
}

impl RouteEvent {
    pub fn new(event_type: EventType, route: Route) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            event_type,
            timestamp: Utc::now(),
            route,
        }
    }
}
