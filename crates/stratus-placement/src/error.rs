//! Placement error types.

use thiserror::Error;

/// Errors raised while selecting a provider for a deployment.
#[derive(Debug, Error)]
pub enum SelectionError {
    /// The catalog advertises a service type this orchestrator does not
    /// recognize. Raised explicitly instead of silently defaulting.
    #[error("unknown cloud provider type: {0}")]
    UnknownServiceType(String),

    /// The candidate has no compute service registered at all.
    #[error("no compute service available for cloud provider: {0}")]
    NoComputeService(String),

    #[error("provider catalog error: {0}")]
    Catalog(String),
}
