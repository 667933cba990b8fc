//! Driver error taxonomy.
//!
//! Drivers raise typed errors; the engine is the only component that
//! decides retry-vs-fail from the classification. Drivers never decide
//! to try another provider themselves.

use thiserror::Error;

use stratus_core::TemplateError;
use stratus_state::StateError;

/// Errors raised by deployment drivers.
#[derive(Debug, Error)]
pub enum DriverError {
    /// The template itself is broken. Retrying on another provider
    /// cannot help.
    #[error("template error: {0}")]
    Template(String),

    /// Orchestrator misconfiguration (missing driver, missing required
    /// property). Never a transient condition.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// The platform rejected the request, was unreachable, or reported
    /// a capacity problem. The next ranked candidate may succeed.
    #[error("provider error: {0}")]
    Transient(String),

    /// One unit reached a terminal failure state on the platform. The
    /// attempt fails fast; a different provider is still worth trying.
    #[error("unit <{unit}> failed: {detail}")]
    UnitFailed { unit: String, detail: String },

    /// A deploy/poll cycle exceeded its budget. Raised through
    /// `provider_timeout` so the platform diagnostic travels with it.
    #[error("provider timeout: {0}")]
    Timeout(String),

    /// Local persistence failure. Fatal — another provider will not fix
    /// a broken state store.
    #[error("state store error: {0}")]
    State(#[from] StateError),
}

impl DriverError {
    /// Fatal errors stop the whole deployment; the rest advance the
    /// engine to the next ranked candidate.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            DriverError::Template(_) | DriverError::Configuration(_) | DriverError::State(_)
        )
    }
}

impl From<TemplateError> for DriverError {
    fn from(err: TemplateError) -> Self {
        DriverError::Template(err.to_string())
    }
}
