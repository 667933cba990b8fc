//! Job-scheduler driver.
//!
//! HPC-job nodes become individually submitted jobs. The scheduler
//! assigns its own job ids, recorded on the resource records; units are
//! submitted one per `deploy` call in dependency order and polled one
//! per `is_deployed` call.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use stratus_core::template::{node_types, parse_and_validate};
use stratus_core::{CloudEndpoint, ProviderKind};
use stratus_state::{ResourceState, StateStore};

use crate::client::{with_auth_retry, PlatformError, TokenSource};
use crate::driver::{AttemptContext, CleanupMode, DeployProgress, DeploymentDriver};
use crate::error::DriverError;
use crate::status::StatusWriter;
use crate::units::{build_work_units, ensure_resources, WorkUnit};

/// A job submission request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRequest {
    pub name: String,
    pub command: String,
    pub cpus: f64,
    pub mem_mb: f64,
    pub env: BTreeMap<String, String>,
}

/// Scheduler-side job lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobLifecycle {
    Queued,
    Executing,
    Finished,
    Failed,
}

/// Scheduler-side view of one job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobInfo {
    pub id: String,
    pub state: JobLifecycle,
    /// Human-oriented note from the scheduler (failure detail etc).
    pub note: Option<String>,
}

/// Client for one job-scheduler deployment target.
#[async_trait]
pub trait JobClient: Send + Sync {
    /// Submit a job; returns the scheduler-assigned job id.
    async fn submit_job(
        &self,
        endpoint: &CloudEndpoint,
        token: &str,
        job: &JobRequest,
    ) -> Result<String, PlatformError>;

    async fn get_job(
        &self,
        endpoint: &CloudEndpoint,
        token: &str,
        job_id: &str,
    ) -> Result<Option<JobInfo>, PlatformError>;

    async fn delete_job(
        &self,
        endpoint: &CloudEndpoint,
        token: &str,
        job_id: &str,
    ) -> Result<(), PlatformError>;
}

/// Driver for job-scheduler providers.
pub struct JobSchedulerDriver {
    store: StateStore,
    status: StatusWriter,
    client: Arc<dyn JobClient>,
    tokens: Arc<dyn TokenSource>,
}

impl JobSchedulerDriver {
    pub fn new(
        store: StateStore,
        client: Arc<dyn JobClient>,
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

    async fn ensure_units(&self, ctx: &mut AttemptContext) -> Result<(), DriverError> {
        if ctx.units.is_some() {
            return Ok(());
        }
        let deployment = self.store.load_deployment(&ctx.deployment_id)?;
        let template = parse_and_validate(&deployment.template, &deployment.parameters)?;
        let units = build_work_units(&ctx.deployment_id, &template, node_types::HPC_JOB)?;
        for unit in &units {
            if unit.command.is_none() {
                return Err(DriverError::Template(format!(
                    "<command> property of node <{}> must be provided",
                    unit.node_name
                )));
            }
        }
        ensure_resources(&self.store, &ctx.deployment_id, &units, node_types::HPC_JOB)?;
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

    /// Scheduler job id recorded for a node, if the unit was submitted.
    fn platform_id(&self, ctx: &AttemptContext, node_name: &str) -> Result<Option<String>, DriverError> {
        let resources = self.store.resources_for_deployment(&ctx.deployment_id)?;
        Ok(resources
            .into_iter()
            .filter(|r| r.node_name == node_name)
            .find_map(|r| r.iaas_id))
    }
}

impl std::fmt::Debug for JobSchedulerDriver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobSchedulerDriver").finish_non_exhaustive()
    }
}

#[async_trait]
impl DeploymentDriver for JobSchedulerDriver {
    fn provider_kind(&self) -> ProviderKind {
        ProviderKind::JobScheduler
    }

    async fn deploy(&self, ctx: &mut AttemptContext) -> Result<DeployProgress, DriverError> {
        self.ensure_units(ctx).await?;
        let total = Self::unit_count(ctx);
        if ctx.submit_cursor >= total {
            return Ok(DeployProgress::Submitted);
        }

        let unit = Self::unit_at(ctx, ctx.submit_cursor)?;
        let request = JobRequest {
            name: unit.name.clone(),
            command: unit.command.clone().unwrap_or_default(),
            cpus: unit.cpus,
            mem_mb: unit.mem_mb,
            env: unit.env.clone(),
        };
        info!(
            deployment_id = %ctx.deployment_id,
            job = %request.name,
            position = ctx.submit_cursor + 1,
            total,
            "submitting job to scheduler"
        );

        let endpoint = ctx.endpoint.clone();
        let job_id = with_auth_retry(self.tokens.as_ref(), |token| {
            let endpoint = &endpoint;
            let request = &request;
            async move { self.client.submit_job(endpoint, &token, request).await }
        })
        .await
        .map_err(|err| {
            DriverError::Transient(format!(
                "failed to submit job <{}> to the scheduler: {err}",
                request.name
            ))
        })?;

        self.store
            .update_resources_for_node(&ctx.deployment_id, &unit.node_name, |resource| {
                resource.state = ResourceState::Created;
                resource.iaas_id = Some(job_id.clone());
            })?;
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
        let job_id = self.platform_id(ctx, &unit.node_name)?.ok_or_else(|| {
            DriverError::Transient(format!(
                "no scheduler job id recorded for node <{}>",
                unit.node_name
            ))
        })?;

        let endpoint = ctx.endpoint.clone();
        let info = with_auth_retry(self.tokens.as_ref(), |token| {
            let endpoint = &endpoint;
            let job_id = job_id.as_str();
            async move { self.client.get_job(endpoint, &token, job_id).await }
        })
        .await
        .map_err(|err| {
            DriverError::Transient(format!(
                "unable to retrieve job <{job_id}> status from the scheduler: {err}"
            ))
        })?
        .ok_or_else(|| {
            DriverError::Transient(format!("job <{job_id}> doesn't exist on the scheduler"))
        })?;

        match info.state {
            JobLifecycle::Queued | JobLifecycle::Executing => {
                self.store.update_resources_for_node(
                    &ctx.deployment_id,
                    &unit.node_name,
                    |resource| resource.state = ResourceState::Configuring,
                )?;
                Ok(false)
            }
            JobLifecycle::Finished => {
                self.store.update_resources_for_node(
                    &ctx.deployment_id,
                    &unit.node_name,
                    |resource| resource.state = ResourceState::Started,
                )?;
                ctx.poll_cursor += 1;
                if ctx.poll_cursor >= total {
                    Ok(true)
                } else {
                    ctx.skip_poll_interval = true;
                    Ok(false)
                }
            }
            JobLifecycle::Failed => Err(DriverError::UnitFailed {
                unit: unit.name.clone(),
                detail: info
                    .note
                    .unwrap_or_else(|| "job failed on the scheduler".to_string()),
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
        for index in 0..ctx.submit_cursor {
            let unit = Self::unit_at(ctx, index)?;
            let Some(job_id) = self.platform_id(ctx, &unit.node_name)? else {
                continue;
            };
            let endpoint = ctx.endpoint.clone();
            let result = with_auth_retry(self.tokens.as_ref(), |token| {
                let endpoint = &endpoint;
                let job_id = job_id.as_str();
                async move { self.client.delete_job(endpoint, &token, job_id).await }
            })
            .await;
            if let Err(err) = result {
                if !err.is_not_found() {
                    warn!(
                        deployment_id = %ctx.deployment_id,
                        job = %job_id,
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
                warn!(
                    deployment_id = %ctx.deployment_id,
                    error = %err,
                    "could not regenerate job list during deletion, marking as deleted"
                );
                return Ok(DeployProgress::Submitted);
            }
        }
        let total = Self::unit_count(ctx);
        if ctx.delete_cursor >= total {
            return finish_teardown(ctx);
        }

        let unit = Self::unit_at(ctx, ctx.delete_cursor)?;
        ctx.delete_cursor += 1;
        let Some(job_id) = self.platform_id(ctx, &unit.node_name)? else {
            // Never submitted, nothing to delete.
            return if ctx.delete_cursor < total {
                Ok(DeployProgress::MoreUnits)
            } else {
                finish_teardown(ctx)
            };
        };

        debug!(
            deployment_id = %ctx.deployment_id,
            job = %job_id,
            "deleting job on scheduler"
        );
        self.store
            .update_resources_for_node(&ctx.deployment_id, &unit.node_name, |resource| {
                resource.state = ResourceState::Deleting;
            })?;

        let endpoint = ctx.endpoint.clone();
        let result = with_auth_retry(self.tokens.as_ref(), |token| {
            let endpoint = &endpoint;
            let job_id = job_id.as_str();
            async move { self.client.delete_job(endpoint, &token, job_id).await }
        })
        .await;

        match result {
            Ok(()) => {}
            Err(err) if err.is_not_found() => {}
            Err(err) => match mode {
                CleanupMode::FailFast => {
                    return Err(DriverError::Transient(format!(
                        "failed to delete job <{job_id}> on the scheduler: {err}"
                    )));
                }
                CleanupMode::BestEffort => {
                    warn!(
                        deployment_id = %ctx.deployment_id,
                        job = %job_id,
                        error = %err,
                        "job deletion failed, continuing with remaining jobs"
                    );
                    ctx.delete_failures.push(format!("{job_id}: {err}"));
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
            "job scheduler did not complete deployment <{}> in time{pending}",
            ctx.deployment_id
        ))
    }

    async fn error_details(&self, ctx: &AttemptContext) -> Option<String> {
        let units = ctx.units.as_ref()?;
        let unit = units.get(ctx.poll_cursor)?;
        let job_id = self.platform_id(ctx, &unit.node_name).ok().flatten()?;
        let endpoint = ctx.endpoint.clone();
        let info = with_auth_retry(self.tokens.as_ref(), |token| {
            let endpoint = &endpoint;
            let job_id = job_id.as_str();
            async move { self.client.get_job(endpoint, &token, job_id).await }
        })
        .await
        .ok()
        .flatten()?;
        info.note
            .map(|note| format!("job <{job_id}> reported: {note}"))
    }
}

fn finish_teardown(ctx: &mut AttemptContext) -> Result<DeployProgress, DriverError> {
    if ctx.delete_failures.is_empty() {
        Ok(DeployProgress::Submitted)
    } else {
        Err(DriverError::Transient(format!(
            "failed to delete {} job(s): {}",
            ctx.delete_failures.len(),
            ctx.delete_failures.join("; ")
        )))
    }
}
