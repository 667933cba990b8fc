//! Batch-scheduler driver.
//!
//! Translates batch-job nodes into dependent scheduler jobs, submitted
//! one per `deploy` call in topological order so the engine can
//! interleave other deployments between submissions. Polling is also
//! per-unit: a job is Fresh until its first run, Success once the
//! success counter moves, Failure once the error counter moves (the
//! scheduler only counts an error after its own retries are exhausted).

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use stratus_core::template::node_types;
use stratus_core::template::parse_and_validate;
use stratus_core::{CloudEndpoint, ProviderKind};
use stratus_state::{ResourceState, StateStore};

use crate::client::{with_auth_retry, PlatformError, TokenSource};
use crate::driver::{AttemptContext, CleanupMode, DeployProgress, DeploymentDriver};
use crate::error::DriverError;
use crate::status::StatusWriter;
use crate::units::{build_work_units, ensure_resources, WorkUnit};

/// A job as submitted to the batch scheduler.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobSpec {
    pub name: String,
    pub command: String,
    pub schedule: Option<String>,
    pub parents: Vec<String>,
    pub cpus: f64,
    pub mem_mb: f64,
    pub image: Option<String>,
    pub env: BTreeMap<String, String>,
    pub retries: u32,
}

/// Scheduler-side view of a job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobStatus {
    pub name: String,
    pub success_count: u32,
    pub error_count: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    Fresh,
    Success,
    Failure,
}

impl JobStatus {
    pub fn state(&self) -> JobState {
        if self.success_count > 0 {
            JobState::Success
        } else if self.error_count > 0 {
            JobState::Failure
        } else {
            JobState::Fresh
        }
    }
}

/// Client for one batch-scheduler deployment target.
#[async_trait]
pub trait BatchClient: Send + Sync {
    /// Create a time-scheduled (parent-less) job.
    async fn create_job(
        &self,
        endpoint: &CloudEndpoint,
        token: &str,
        job: &JobSpec,
    ) -> Result<(), PlatformError>;

    /// Create a job triggered by its parents' completion.
    async fn create_dependent_job(
        &self,
        endpoint: &CloudEndpoint,
        token: &str,
        job: &JobSpec,
    ) -> Result<(), PlatformError>;

    async fn get_job(
        &self,
        endpoint: &CloudEndpoint,
        token: &str,
        name: &str,
    ) -> Result<Option<JobStatus>, PlatformError>;

    async fn delete_job(
        &self,
        endpoint: &CloudEndpoint,
        token: &str,
        name: &str,
    ) -> Result<(), PlatformError>;
}

/// Driver for batch-scheduler providers.
pub struct BatchSchedulerDriver {
    store: StateStore,
    status: StatusWriter,
    client: Arc<dyn BatchClient>,
    tokens: Arc<dyn TokenSource>,
}

impl BatchSchedulerDriver {
    pub fn new(
        store: StateStore,
        client: Arc<dyn BatchClient>,
        tokens: Arc<dyn TokenSource>,
    ) -> Self {
        let status = StatusWriter::new(store.clone());
        Self {
            store,
            status,
            client,
            tokens,
        }
    }

    /// Build the job topology on first use and stash it in the context.
    async fn ensure_units(&self, ctx: &mut AttemptContext) -> Result<(), DriverError> {
        if ctx.units.is_some() {
            return Ok(());
        }
        let deployment = self.store.load_deployment(&ctx.deployment_id)?;
        let template = parse_and_validate(&deployment.template, &deployment.parameters)?;
        let units = build_work_units(&ctx.deployment_id, &template, node_types::BATCH_JOB)?;

        for unit in &units {
            if unit.command.is_none() {
                return Err(DriverError::Template(format!(
                    "<command> property of node <{}> must be provided",
                    unit.node_name
                )));
            }
            if unit.schedule.is_some() && !unit.parents.is_empty() {
                return Err(DriverError::Template(format!(
                    "error creating job <{}>: <schedule> and job dependencies are both specified",
                    unit.node_name
                )));
            }
        }

        ensure_resources(&self.store, &ctx.deployment_id, &units, node_types::BATCH_JOB)?;
        debug!(
            deployment_id = %ctx.deployment_id,
            jobs = units.len(),
            "batch job topology generated"
        );
        ctx.units = Some(units);
        Ok(())
    }

    fn unit_at(ctx: &AttemptContext, index: usize) -> Result<WorkUnit, DriverError> {
        ctx.units
            .as_ref()
            .and_then(|units| units.get(index))
            .cloned()
            .ok_or_else(|| {
                DriverError::Configuration("attempt context lost its work units".to_string())
            })
    }

    fn unit_count(ctx: &AttemptContext) -> usize {
        ctx.units.as_ref().map(Vec::len).unwrap_or(0)
    }

    fn job_spec(unit: &WorkUnit) -> JobSpec {
        JobSpec {
            name: unit.name.clone(),
            command: unit.command.clone().unwrap_or_default(),
            schedule: unit.schedule.clone(),
            parents: unit.parents.clone(),
            cpus: unit.cpus,
            mem_mb: unit.mem_mb,
            image: unit.image.clone(),
            env: unit.env.clone(),
            retries: unit.retries,
        }
    }

    fn mark_node(
        &self,
        ctx: &AttemptContext,
        unit: &WorkUnit,
        state: ResourceState,
    ) -> Result<(), DriverError> {
        self.store.update_resources_for_node(
            &ctx.deployment_id,
            &unit.node_name,
            |resource| {
                resource.state = state;
                resource.iaas_id = Some(unit.name.clone());
            },
        )?;
        Ok(())
    }
}

impl std::fmt::Debug for BatchSchedulerDriver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BatchSchedulerDriver").finish_non_exhaustive()
    }
}

#[async_trait]
impl DeploymentDriver for BatchSchedulerDriver {
    fn provider_kind(&self) -> ProviderKind {
        ProviderKind::BatchScheduler
    }

    async fn deploy(&self, ctx: &mut AttemptContext) -> Result<DeployProgress, DriverError> {
        self.ensure_units(ctx).await?;
        let total = Self::unit_count(ctx);
        if ctx.submit_cursor >= total {
            return Ok(DeployProgress::Submitted);
        }

        let unit = Self::unit_at(ctx, ctx.submit_cursor)?;
        let spec = Self::job_spec(&unit);
        debug!(
            deployment_id = %ctx.deployment_id,
            job = %spec.name,
            position = ctx.submit_cursor + 1,
            total,
            dependent = !spec.parents.is_empty(),
            "creating job on batch scheduler"
        );

        let endpoint = ctx.endpoint.clone();
        let result = with_auth_retry(self.tokens.as_ref(), |token| {
            let spec = &spec;
            let endpoint = &endpoint;
            async move {
                if spec.parents.is_empty() {
                    self.client.create_job(endpoint, &token, spec).await
                } else {
                    self.client.create_dependent_job(endpoint, &token, spec).await
                }
            }
        })
        .await;
        if let Err(err) = result {
            return Err(DriverError::Transient(format!(
                "failed to launch job <{}> on the batch scheduler: {err}",
                spec.name
            )));
        }

        self.mark_node(ctx, &unit, ResourceState::Created)?;
        ctx.submit_cursor += 1;
        if ctx.submit_cursor < total {
            Ok(DeployProgress::MoreUnits)
        } else {
            Ok(DeployProgress::Submitted)
        }
    }

    async fn is_deployed(&self, ctx: &mut AttemptContext) -> Result<bool, DriverError> {
        self.ensure_units(ctx).await?;
        ctx.skip_poll_interval = false;
        let total = Self::unit_count(ctx);
        if ctx.poll_cursor >= total {
            return Ok(true);
        }

        let unit = Self::unit_at(ctx, ctx.poll_cursor)?;
        debug!(
            deployment_id = %ctx.deployment_id,
            job = %unit.name,
            position = ctx.poll_cursor + 1,
            total,
            "polling job on batch scheduler"
        );

        let endpoint = ctx.endpoint.clone();
        let name = unit.name.clone();
        let found = with_auth_retry(self.tokens.as_ref(), |token| {
            let endpoint = &endpoint;
            let name = name.as_str();
            async move { self.client.get_job(endpoint, &token, name).await }
        })
        .await
        .map_err(|err| {
            DriverError::Transient(format!(
                "unable to retrieve job <{}> status from the batch scheduler: {err}",
                unit.name
            ))
        })?;

        let job = found.ok_or_else(|| {
            DriverError::Transient(format!(
                "job <{}> doesn't exist on the batch scheduler",
                unit.name
            ))
        })?;

        match job.state() {
            JobState::Fresh => {
                self.mark_node(ctx, &unit, ResourceState::Configuring)?;
                Ok(false)
            }
            JobState::Success => {
                self.mark_node(ctx, &unit, ResourceState::Started)?;
                ctx.poll_cursor += 1;
                if ctx.poll_cursor >= total {
                    debug!(deployment_id = %ctx.deployment_id, "all jobs are ready");
                    Ok(true)
                } else {
                    // Move straight to the next job; no reason to wait.
                    ctx.skip_poll_interval = true;
                    Ok(false)
                }
            }
            JobState::Failure => Err(DriverError::UnitFailed {
                unit: unit.name.clone(),
                detail: "job failed to execute on the batch scheduler".to_string(),
            }),
        }
    }

    async fn finalize_deploy(
        &self,
        ctx: &mut AttemptContext,
        succeeded: bool,
    ) -> Result<(), DriverError> {
        if succeeded {
            self.status.update_on_success(&ctx.deployment_id)?;
        } else {
            self.status
                .update_on_error(&ctx.deployment_id, ctx.failure_reason_or_default())?;
        }
        Ok(())
    }

    async fn cleanup_failed_deploy(
        &self,
        ctx: &mut AttemptContext,
        keep_last_attempt: bool,
    ) -> Result<(), DriverError> {
        if keep_last_attempt {
            info!(
                deployment_id = %ctx.deployment_id,
                "keeping the jobs of the last deployment attempt"
            );
            return Ok(());
        }
        // Best-effort: remove whatever was already submitted.
        for index in 0..ctx.submit_cursor {
            let unit = Self::unit_at(ctx, index)?;
            let endpoint = ctx.endpoint.clone();
            let name = unit.name.clone();
            let result = with_auth_retry(self.tokens.as_ref(), |token| {
                let endpoint = &endpoint;
                let name = name.as_str();
                async move { self.client.delete_job(endpoint, &token, name).await }
            })
            .await;
            match result {
                Ok(()) => {}
                Err(err) if err.is_not_found() => {}
                Err(err) => {
                    warn!(
                        deployment_id = %ctx.deployment_id,
                        job = %unit.name,
                        error = %err,
                        "failed to clean up job after failed attempt"
                    );
                }
            }
        }
        Ok(())
    }

    async fn undeploy(
        &self,
        ctx: &mut AttemptContext,
        mode: CleanupMode,
    ) -> Result<DeployProgress, DriverError> {
        if ctx.units.is_none() {
            if let Err(err) = self.ensure_units(ctx).await {
                // If the topology can't be regenerated there is nothing
                // addressable left to delete; the deployment can still go.
                warn!(
                    deployment_id = %ctx.deployment_id,
                    error = %err,
                    "could not regenerate job topology during deletion, marking as deleted"
                );
                return Ok(DeployProgress::Submitted);
            }
        }
        let total = Self::unit_count(ctx);
        if ctx.delete_cursor >= total {
            return finish_teardown(ctx);
        }

        let unit = Self::unit_at(ctx, ctx.delete_cursor)?;
        debug!(
            deployment_id = %ctx.deployment_id,
            job = %unit.name,
            position = ctx.delete_cursor + 1,
            total,
            "deleting job on batch scheduler"
        );
        self.mark_node(ctx, &unit, ResourceState::Deleting)?;

        let endpoint = ctx.endpoint.clone();
        let name = unit.name.clone();
        let result = with_auth_retry(self.tokens.as_ref(), |token| {
            let endpoint = &endpoint;
            let name = name.as_str();
            async move { self.client.delete_job(endpoint, &token, name).await }
        })
        .await;
        ctx.delete_cursor += 1;

        match result {
            Ok(()) => {}
            // Jobs already gone (or never created) are fine to skip.
            Err(err) if err.is_not_found() => {}
            Err(err) => match mode {
                CleanupMode::FailFast => {
                    return Err(DriverError::Transient(format!(
                        "failed to delete job <{}> on the batch scheduler: {err}",
                        unit.name
                    )));
                }
                CleanupMode::BestEffort => {
                    warn!(
                        deployment_id = %ctx.deployment_id,
                        job = %unit.name,
                        error = %err,
                        "job deletion failed, continuing with remaining jobs"
                    );
                    ctx.delete_failures
                        .push(format!("{}: {err}", unit.name));
                }
            },
        }

        if ctx.delete_cursor < total {
            Ok(DeployProgress::MoreUnits)
        } else {
            finish_teardown(ctx)
        }
    }

    async fn is_undeployed(&self, _ctx: &mut AttemptContext) -> Result<bool, DriverError> {
        // Job deletions are synchronous on the scheduler side.
        Ok(true)
    }

    async fn finalize_undeploy(&self, ctx: &mut AttemptContext) -> Result<(), DriverError> {
        self.status.update_on_success(&ctx.deployment_id)?;
        Ok(())
    }

    async fn provider_timeout(&self, ctx: &mut AttemptContext) -> DriverError {
        let pending = self
            .error_details(ctx)
            .await
            .map(|detail| format!(": {detail}"))
            .unwrap_or_default();
        DriverError::Timeout(format!(
            "batch scheduler did not complete deployment <{}> in time{pending}",
            ctx.deployment_id
        ))
    }

    async fn error_details(&self, ctx: &AttemptContext) -> Option<String> {
        let units = ctx.units.as_ref()?;
        units
            .get(ctx.poll_cursor)
            .map(|unit| format!("job <{}> still pending", unit.name))
    }
}

fn finish_teardown(ctx: &mut AttemptContext) -> Result<DeployProgress, DriverError> {
    if ctx.delete_failures.is_empty() {
        debug!(deployment_id = %ctx.deployment_id, "all jobs have been deleted");
        Ok(DeployProgress::Submitted)
    } else {
        Err(DriverError::Transient(format!(
            "failed to delete {} job(s): {}",
            ctx.delete_failures.len(),
            ctx.delete_failures.join("; ")
        )))
    }
}
