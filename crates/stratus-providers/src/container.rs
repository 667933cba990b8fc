//! Container-group driver.
//!
//! Container-app nodes become one app group submitted in a single call;
//! the orchestrator platform then rolls the apps out on its own. An app
//! counts as deployed when no platform rollout is pending and enough
//! tasks are running — or healthy, when the app declares health checks.

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

/// One app inside a group submission.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppSpec {
    pub id: String,
    pub instances: u32,
    pub cpus: f64,
    pub mem_mb: f64,
    pub image: String,
    pub command: Option<String>,
    pub env: BTreeMap<String, String>,
}

/// A whole app group, submitted at once.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroupSpec {
    pub id: String,
    pub apps: Vec<AppSpec>,
}

/// Platform-side view of one app.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppStatus {
    pub id: String,
    pub instances: u32,
    pub tasks_running: u32,
    pub tasks_healthy: u32,
    pub has_health_checks: bool,
    /// Number of platform rollouts still in flight for this app.
    pub pending_deployments: u32,
    /// Message of the last failed task, when the platform kept one.
    pub last_failure: Option<String>,
}

impl AppStatus {
    pub fn is_deployed(&self) -> bool {
        let tasks_ready = if self.has_health_checks {
            self.tasks_healthy >= self.instances
        } else {
            self.tasks_running >= self.instances
        };
        self.pending_deployments == 0 && tasks_ready
    }
}

/// Platform-side view of the group.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroupStatus {
    pub id: String,
    pub apps: Vec<AppStatus>,
}

/// Client for one container-orchestrator deployment target.
#[async_trait]
pub trait ContainerClient: Send + Sync {
    async fn create_group(
        &self,
        endpoint: &CloudEndpoint,
        token: &str,
        group: &GroupSpec,
    ) -> Result<(), PlatformError>;

    async fn get_group(
        &self,
        endpoint: &CloudEndpoint,
        token: &str,
        group_id: &str,
    ) -> Result<Option<GroupStatus>, PlatformError>;

    async fn delete_group(
        &self,
        endpoint: &CloudEndpoint,
        token: &str,
        group_id: &str,
        force: bool,
    ) -> Result<(), PlatformError>;
}

/// Driver for container-orchestrator providers.
pub struct ContainerGroupDriver {
    store: StateStore,
    status: StatusWriter,
    client: Arc<dyn ContainerClient>,
    tokens: Arc<dyn TokenSource>,
}

impl ContainerGroupDriver {
    pub fn new(
        store: StateStore,
        client: Arc<dyn ContainerClient>,
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
        let units = build_work_units(&ctx.deployment_id, &template, node_types::CONTAINER_APP)?;
        for unit in &units {
            if unit.image.is_none() {
                return Err(DriverError::Template(format!(
                    "<image> property of node <{}> must be provided",
                    unit.node_name
                )));
            }
        }
        ensure_resources(
            &self.store,
            &ctx.deployment_id,
            &units,
            node_types::CONTAINER_APP,
        )?;
        ctx.units = Some(units);
        Ok(())
    }

    fn group_spec(ctx: &AttemptContext) -> Result<GroupSpec, DriverError> {
        let units = ctx.units.as_ref().ok_or_else(|| {
            DriverError::Configuration("attempt context lost its work units".to_string())
        })?;
        let apps = units
            .iter()
            .map(|unit| AppSpec {
                id: unit.name.clone(),
                instances: unit.instances,
                cpus: unit.cpus,
                mem_mb: unit.mem_mb,
                image: unit.image.clone().unwrap_or_default(),
                command: unit.command.clone(),
                env: unit.env.clone(),
            })
            .collect();
        Ok(GroupSpec {
            id: ctx.deployment_id.clone(),
            apps,
        })
    }

    fn node_for_app<'a>(units: &'a [WorkUnit], app_id: &str) -> Option<&'a str> {
        units
            .iter()
            .find(|u| u.name == app_id)
            .map(|u| u.node_name.as_str())
    }

    async fn fetch_group(
        &self,
        ctx: &AttemptContext,
    ) -> Result<Option<GroupStatus>, DriverError> {
        let endpoint = ctx.endpoint.clone();
        let group_id = ctx.deployment_id.clone();
        with_auth_retry(self.tokens.as_ref(), |token| {
            let endpoint = &endpoint;
            let group_id = group_id.as_str();
            async move { self.client.get_group(endpoint, &token, group_id).await }
        })
        .await
        .map_err(|err| {
            DriverError::Transient(format!(
                "unable to retrieve app group <{group_id}> status: {err}"
            ))
        })
    }

    async fn delete_group(&self, ctx: &AttemptContext) -> Result<(), DriverError> {
        let endpoint = ctx.endpoint.clone();
        let group_id = ctx.deployment_id.clone();
        let result = with_auth_retry(self.tokens.as_ref(), |token| {
            let endpoint = &endpoint;
            let group_id = group_id.as_str();
            async move {
                self.client
                    .delete_group(endpoint, &token, group_id, true)
                    .await
            }
        })
        .await;
        match result {
            Ok(()) => Ok(()),
            Err(err) if err.is_not_found() => Ok(()),
            Err(err) => Err(DriverError::Transient(format!(
                "failed to delete app group <{group_id}>: {err}"
            ))),
        }
    }
}

impl std::fmt::Debug for ContainerGroupDriver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContainerGroupDriver").finish_non_exhaustive()
    }
}

#[async_trait]
impl DeploymentDriver for ContainerGroupDriver {
    fn provider_kind(&self) -> ProviderKind {
        ProviderKind::ContainerGroup
    }

    async fn deploy(&self, ctx: &mut AttemptContext) -> Result<DeployProgress, DriverError> {
        if ctx.submit_cursor > 0 {
            return Ok(DeployProgress::Submitted);
        }
        self.ensure_units(ctx).await?;
        let group = Self::group_spec(ctx)?;

        info!(
            deployment_id = %ctx.deployment_id,
            apps = group.apps.len(),
            "creating app group on container orchestrator"
        );
        let endpoint = ctx.endpoint.clone();
        with_auth_retry(self.tokens.as_ref(), |token| {
            let endpoint = &endpoint;
            let group = &group;
            async move { self.client.create_group(endpoint, &token, group).await }
        })
        .await
        .map_err(|err| {
            DriverError::Transient(format!(
                "failed to create app group <{}>: {err}",
                group.id
            ))
        })?;

        self.store.update_deployment(&ctx.deployment_id, |d| {
            d.platform_ref = Some(ctx.deployment_id.clone());
        })?;
        if let Some(units) = ctx.units.clone() {
            for unit in &units {
                self.store.update_resources_for_node(
                    &ctx.deployment_id,
                    &unit.node_name,
                    |resource| {
                        resource.state = ResourceState::Creating;
                        resource.iaas_id = Some(unit.name.clone());
                    },
                )?;
            }
        }
        ctx.submit_cursor = Self::group_spec(ctx)?.apps.len().max(1);
        Ok(DeployProgress::Submitted)
    }

    async fn is_deployed(&self, ctx: &mut AttemptContext) -> Result<bool, DriverError> {
        self.ensure_units(ctx).await?;
        let group = self.fetch_group(ctx).await?.ok_or_else(|| {
            DriverError::Transient(format!(
                "app group <{}> doesn't exist on the container orchestrator",
                ctx.deployment_id
            ))
        })?;

        let units = ctx.units.clone().unwrap_or_default();
        let mut all_deployed = true;
        for app in &group.apps {
            let deployed = app.is_deployed();
            all_deployed &= deployed;
            if let Some(node) = Self::node_for_app(&units, &app.id) {
                let state = if deployed {
                    ResourceState::Started
                } else {
                    ResourceState::Configuring
                };
                self.store
                    .update_resources_for_node(&ctx.deployment_id, node, |resource| {
                        resource.state = state;
                    })?;
            }
        }
        debug!(
            deployment_id = %ctx.deployment_id,
            apps = group.apps.len(),
            all_deployed,
            "app group status checked"
        );
        Ok(all_deployed)
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
        if ctx.submit_cursor == 0 {
            debug!(
                deployment_id = %ctx.deployment_id,
                "nothing left to clean up from the last attempt"
            );
            return Ok(());
        }
        if keep_last_attempt {
            info!(
                deployment_id = %ctx.deployment_id,
                "keeping the app group of the last deployment attempt"
            );
            return Ok(());
        }
        if let Err(err) = self.delete_group(ctx).await {
            warn!(
                deployment_id = %ctx.deployment_id,
                error = %err,
                "failed to clean up app group after failed attempt"
            );
        }
        self.store.update_deployment(&ctx.deployment_id, |d| {
            d.platform_ref = None;
        })?;
        Ok(())
    }

    async fn undeploy(
        &self,
        ctx: &mut AttemptContext,
        _mode: CleanupMode,
    ) -> Result<DeployProgress, DriverError> {
        if ctx.delete_cursor > 0 {
            return Ok(DeployProgress::Submitted);
        }
        ctx.delete_cursor = 1;
        self.store
            .update_all_resources(&ctx.deployment_id, |resource| {
                resource.state = ResourceState::Deleting;
            })?;
        self.delete_group(ctx).await?;
        Ok(DeployProgress::Submitted)
    }

    async fn is_undeployed(&self, ctx: &mut AttemptContext) -> Result<bool, DriverError> {
        Ok(self.fetch_group(ctx).await?.is_none())
    }

    async fn finalize_undeploy(&self, ctx: &mut AttemptContext) -> Result<(), DriverError> {
        self.status.update_on_success(&ctx.deployment_id)?;
        Ok(())
    }

    async fn provider_timeout(&self, ctx: &mut AttemptContext) -> DriverError {
        let details = self
            .error_details(ctx)
            .await
            .map(|d| format!("\n{d}"))
            .unwrap_or_default();
        DriverError::Timeout(format!(
            "container orchestrator did not complete deployment <{}> in time{details}",
            ctx.deployment_id
        ))
    }

    async fn error_details(&self, ctx: &AttemptContext) -> Option<String> {
        let group = self.fetch_group(ctx).await.ok().flatten()?;
        let failures: Vec<String> = group
            .apps
            .iter()
            .filter(|app| !app.is_deployed())
            .filter_map(|app| {
                app.last_failure
                    .as_ref()
                    .map(|failure| format!("{}: {failure}", app.id))
            })
            .collect();
        if failures.is_empty() {
            None
        } else {
            Some(format!("some applications failed:\n{}", failures.join("\n")))
        }
    }
}
