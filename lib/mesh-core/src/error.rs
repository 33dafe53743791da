use thiserror::Error;

pub type Result<T> = std::result::Result<T, CoreError>;

/// Errors surfaced by registries, tables, the cache and the router.
///
/// `Clone` so a single in-flight registry result can be handed to every
/// caller waiting on it.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CoreError {
    #[error("Service not found: {0}")]
    ServiceNotFound(String),

    #[error("Route not found")]
    RouteNotFound,

    #[error("Duplicate route")]
    DuplicateRoute,

    #[error("Watcher stopped")]
    WatcherStopped,

    #[error("Registry unavailable: {0}")]
    Upstream(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl CoreError {
    /// No such service or route
    pub fn is_not_found(&self) -> bool {
        matches!(self, CoreError::ServiceNotFound(_) | CoreError::RouteNotFound)
    }

    /// Failure talking to the registry or its watch stream; worth retrying
    pub fn is_transient(&self) -> bool {
        matches!(self, CoreError::Upstream(_) | CoreError::Internal(_))
    }
}
