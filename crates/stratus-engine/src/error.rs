//! Engine error types.

use thiserror::Error;

use stratus_providers::DriverError;
use stratus_state::StateError;

/// Errors surfaced by the deployment engine.
#[derive(Debug, Error)]
pub enum EngineError {
    /// The selector produced zero candidates for this deployment.
    #[error("no compatible provider found")]
    NoCompatibleProvider,

    /// Every candidate was tried; the message aggregates the
    /// per-candidate failure causes in order.
    #[error("{0}")]
    ProvidersExhausted(String),

    /// A user-initiated undeploy interrupted the deploy.
    #[error("deployment cancelled")]
    Cancelled,

    /// A deployment already has an active background task.
    #[error("deployment <{0}> already has an attempt in flight")]
    AlreadyActive(String),

    #[error("template error: {0}")]
    Template(String),

    #[error("provider ranking failed: {0}")]
    Ranker(String),

    #[error(transparent)]
    Driver(#[from] DriverError),

    #[error(transparent)]
    State(#[from] StateError),
}
