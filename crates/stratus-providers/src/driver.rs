//! The deployment driver contract.
//!
//! Every driver walks the same state machine; the engine owns the loop
//! and the classification of failures, the driver owns the translation
//! to its platform. All operations may be invoked repeatedly — polling
//! in particular happens many times per attempt.

use async_trait::async_trait;

use stratus_core::{CloudEndpoint, ProviderKind};

use crate::error::DriverError;
use crate::units::WorkUnit;

/// Progress of an incremental submission or teardown.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeployProgress {
    /// One unit was processed; call again for the next one.
    MoreUnits,
    /// Every unit has been submitted (or torn down).
    Submitted,
}

/// Teardown behavior when one unit's deletion fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CleanupMode {
    /// Stop at the first deletion error (cleanup-on-error paths).
    FailFast,
    /// Keep deleting the remaining units, report the failures at the
    /// end (final teardown paths).
    BestEffort,
}

/// Mutable per-attempt state threaded through one driver's state
/// machine. Never shared between deployments.
#[derive(Debug)]
pub struct AttemptContext {
    pub deployment_id: String,
    /// The endpoint chosen for this attempt.
    pub endpoint: CloudEndpoint,
    /// Work units in dependency order, built on first use.
    pub units: Option<Vec<WorkUnit>>,
    /// Next unit to submit.
    pub submit_cursor: usize,
    /// Next unit to poll.
    pub poll_cursor: usize,
    /// Next unit to tear down.
    pub delete_cursor: usize,
    /// Deletion failures accumulated in best-effort teardown.
    pub delete_failures: Vec<String>,
    /// Set by drivers that poll one unit per call: when true the engine
    /// moves straight to the next poll without waiting an interval.
    pub skip_poll_interval: bool,
    /// Failure cause recorded by the engine before `finalize_*(false)`.
    pub failure_reason: Option<String>,
}

impl AttemptContext {
    pub fn new(deployment_id: impl Into<String>, endpoint: CloudEndpoint) -> Self {
        Self {
            deployment_id: deployment_id.into(),
            endpoint,
            units: None,
            submit_cursor: 0,
            poll_cursor: 0,
            delete_cursor: 0,
            delete_failures: Vec::new(),
            skip_poll_interval: false,
            failure_reason: None,
        }
    }

    /// The recorded failure cause, or a generic fallback.
    pub fn failure_reason_or_default(&self) -> &str {
        self.failure_reason
            .as_deref()
            .unwrap_or("deployment failed without a recorded cause")
    }
}

/// A provider-specific deployment driver.
///
/// Drivers are stateless between calls except for what they persist in
/// the store and what lives in the [`AttemptContext`]; the registry
/// shares one instance across all deployments.
#[async_trait]
pub trait DeploymentDriver: std::fmt::Debug + Send + Sync {
    /// The provider kind this driver self-declares to the registry.
    fn provider_kind(&self) -> ProviderKind;

    /// Translate and submit the next portion of the deployment.
    ///
    /// Multi-unit drivers submit one unit per call in dependency order
    /// and return [`DeployProgress::MoreUnits`] until done; single-shot
    /// drivers submit everything at once.
    async fn deploy(&self, ctx: &mut AttemptContext) -> Result<DeployProgress, DriverError>;

    /// Non-blocking status check. `Ok(true)` once every unit reached its
    /// platform success state; raises the first time any unit is
    /// observed in a terminal failure state.
    async fn is_deployed(&self, ctx: &mut AttemptContext) -> Result<bool, DriverError>;

    /// Finalize the deploy phase. Idempotent in both directions.
    async fn finalize_deploy(
        &self,
        ctx: &mut AttemptContext,
        succeeded: bool,
    ) -> Result<(), DriverError>;

    /// Remove the half-created provider-side artifact after a failed
    /// attempt. `keep_last_attempt` preserves it for debugging when this
    /// was the final candidate.
    async fn cleanup_failed_deploy(
        &self,
        ctx: &mut AttemptContext,
        keep_last_attempt: bool,
    ) -> Result<(), DriverError>;

    /// Tear down the next portion of the provider-side units.
    async fn undeploy(
        &self,
        ctx: &mut AttemptContext,
        mode: CleanupMode,
    ) -> Result<DeployProgress, DriverError>;

    /// `Ok(true)` once every provider-side unit is gone.
    async fn is_undeployed(&self, ctx: &mut AttemptContext) -> Result<bool, DriverError>;

    /// Finalize the undeploy phase. Idempotent.
    async fn finalize_undeploy(&self, ctx: &mut AttemptContext) -> Result<(), DriverError>;

    /// Called when a deploy/poll cycle exceeded its budget. Returns the
    /// timeout error carrying the most actionable diagnostic the
    /// platform offers.
    async fn provider_timeout(&self, ctx: &mut AttemptContext) -> DriverError;

    /// Best-effort platform-side failure diagnostics. Internal errors
    /// are swallowed — this must never make a bad situation worse.
    async fn error_details(&self, ctx: &AttemptContext) -> Option<String>;
}
