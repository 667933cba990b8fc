//! Infrastructure-manager driver.
//!
//! Compute nodes are rendered into one infrastructure document and
//! submitted as a whole; the infrastructure manager owns the per-VM
//! rollout and exposes an aggregated state. While polling, the VM ids
//! it assigns are bound back onto the resource records.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, info, warn};

use stratus_core::template::{node_types, parse_and_validate};
use stratus_core::{CloudEndpoint, ProviderKind};
use stratus_state::{ResourceState, StateStore};

use crate::client::{with_auth_retry, PlatformError, TokenSource};
use crate::driver::{AttemptContext, CleanupMode, DeployProgress, DeploymentDriver};
use crate::error::DriverError;
use crate::status::StatusWriter;
use crate::units::{build_work_units, ensure_resources};

/// Aggregated lifecycle of one infrastructure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InfraLifecycle {
    Pending,
    Running,
    Configured,
    Unconfigured,
    Failed,
    Deleting,
}

/// State of one VM inside an infrastructure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VmState {
    pub id: String,
    /// Template node the manager created this VM for, when reported.
    pub node_name: Option<String>,
    pub state: String,
}

/// Full state snapshot of an infrastructure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InfraState {
    pub state: InfraLifecycle,
    pub vms: Vec<VmState>,
}

/// Client for an infrastructure manager (site-local or brokered).
#[async_trait]
pub trait InfraManagerClient: Send + Sync {
    /// Submit an infrastructure document; returns the infrastructure id.
    async fn create_infrastructure(
        &self,
        endpoint: &CloudEndpoint,
        token: &str,
        document: &str,
    ) -> Result<String, PlatformError>;

    async fn get_state(
        &self,
        endpoint: &CloudEndpoint,
        token: &str,
        infrastructure_id: &str,
    ) -> Result<InfraState, PlatformError>;

    async fn get_outputs(
        &self,
        endpoint: &CloudEndpoint,
        token: &str,
        infrastructure_id: &str,
    ) -> Result<BTreeMap<String, Value>, PlatformError>;

    /// The contextualization log, when the manager kept one.
    async fn get_log(
        &self,
        endpoint: &CloudEndpoint,
        token: &str,
        infrastructure_id: &str,
    ) -> Result<Option<String>, PlatformError>;

    async fn delete_infrastructure(
        &self,
        endpoint: &CloudEndpoint,
        token: &str,
        infrastructure_id: &str,
    ) -> Result<(), PlatformError>;
}

/// Driver for VM infrastructures behind an infrastructure manager.
pub struct InfraManagerDriver {
    store: StateStore,
    status: StatusWriter,
    client: Arc<dyn InfraManagerClient>,
    tokens: Arc<dyn TokenSource>,
}

impl InfraManagerDriver {
    pub fn new(
        store: StateStore,
        client: Arc<dyn InfraManagerClient>,
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

    /// Render the compute nodes into the manager's submission document.
    async fn render_document(&self, ctx: &mut AttemptContext) -> Result<String, DriverError> {
        if ctx.units.is_none() {
            let deployment = self.store.load_deployment(&ctx.deployment_id)?;
            let template = parse_and_validate(&deployment.template, &deployment.parameters)?;
            let units = build_work_units(&ctx.deployment_id, &template, node_types::COMPUTE)?;
            if units.is_empty() {
                return Err(DriverError::Template(
                    "template has no compute nodes to deploy".to_string(),
                ));
            }
            ensure_resources(&self.store, &ctx.deployment_id, &units, node_types::COMPUTE)?;
            ctx.units = Some(units);
        }
        let units = ctx.units.as_ref().ok_or_else(|| {
            DriverError::Configuration("attempt context lost its work units".to_string())
        })?;
        let nodes: Vec<Value> = units
            .iter()
            .map(|unit| {
                json!({
                    "name": unit.name,
                    "node": unit.node_name,
                    "count": unit.instances,
                    "cpus": unit.cpus,
                    "mem_mb": unit.mem_mb,
                    "image": unit.image,
                })
            })
            .collect();
        let document = json!({
            "name": ctx.deployment_id,
            "nodes": nodes,
        });
        Ok(document.to_string())
    }

    fn platform_ref(&self, ctx: &AttemptContext) -> Result<Option<String>, DriverError> {
        Ok(self.store.load_deployment(&ctx.deployment_id)?.platform_ref)
    }

    async fn fetch_state(
        &self,
        ctx: &AttemptContext,
        infrastructure_id: &str,
    ) -> Result<InfraState, PlatformError> {
        let endpoint = ctx.endpoint.clone();
        with_auth_retry(self.tokens.as_ref(), |token| {
            let endpoint = &endpoint;
            let id = infrastructure_id;
            async move { self.client.get_state(endpoint, &token, id).await }
        })
        .await
    }

    /// Attach manager-assigned VM ids to resources that lack one.
    fn bind_vms(&self, ctx: &AttemptContext, state: &InfraState) -> Result<(), DriverError> {
        let mut resources = self.store.resources_for_deployment(&ctx.deployment_id)?;
        for vm in &state.vms {
            let Some(node_name) = &vm.node_name else {
                continue;
            };
            let already_bound = resources
                .iter()
                .any(|r| r.iaas_id.as_deref() == Some(vm.id.as_str()));
            if already_bound {
                continue;
            }
            if let Some(resource) = resources
                .iter_mut()
                .find(|r| &r.node_name == node_name && r.iaas_id.is_none())
            {
                resource.iaas_id = Some(vm.id.clone());
                resource.state = ResourceState::Configuring;
                self.store.put_resource(resource)?;
            } else {
                warn!(
                    deployment_id = %ctx.deployment_id,
                    vm = %vm.id,
                    node = %node_name,
                    "VM could not be bound to any resource"
                );
            }
        }
        Ok(())
    }
}

impl std::fmt::Debug for InfraManagerDriver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InfraManagerDriver").finish_non_exhaustive()
    }
}

#[async_trait]
impl DeploymentDriver for InfraManagerDriver {
    fn provider_kind(&self) -> ProviderKind {
        ProviderKind::InfraManager
    }

    async fn deploy(&self, ctx: &mut AttemptContext) -> Result<DeployProgress, DriverError> {
        if ctx.submit_cursor > 0 {
            return Ok(DeployProgress::Submitted);
        }
        let document = self.render_document(ctx).await?;
        self.store
            .update_all_resources(&ctx.deployment_id, |resource| {
                if resource.state == ResourceState::Initial {
                    resource.state = ResourceState::Creating;
                }
            })?;

        let endpoint = ctx.endpoint.clone();
        let infrastructure_id = with_auth_retry(self.tokens.as_ref(), |token| {
            let endpoint = &endpoint;
            let document = document.as_str();
            async move {
                self.client
                    .create_infrastructure(endpoint, &token, document)
                    .await
            }
        })
        .await
        .map_err(|err| {
            DriverError::Transient(format!(
                "error submitting infrastructure to the manager: {err}"
            ))
        })?;

        info!(
            deployment_id = %ctx.deployment_id,
            infrastructure_id = %infrastructure_id,
            "infrastructure submitted"
        );
        self.store.update_deployment(&ctx.deployment_id, |d| {
            d.platform_ref = Some(infrastructure_id.clone());
        })?;
        ctx.submit_cursor = 1;
        Ok(DeployProgress::Submitted)
    }

    async fn is_deployed(&self, ctx: &mut AttemptContext) -> Result<bool, DriverError> {
        let infrastructure_id = self.platform_ref(ctx)?.ok_or_else(|| {
            DriverError::Transient(
                "no infrastructure id recorded for this deployment".to_string(),
            )
        })?;

        let state = self
            .fetch_state(ctx, &infrastructure_id)
            .await
            .map_err(|err| {
                DriverError::Transient(format!(
                    "error querying infrastructure <{infrastructure_id}> state: {err}"
                ))
            })?;
        debug!(
            deployment_id = %ctx.deployment_id,
            infrastructure_id = %infrastructure_id,
            state = ?state.state,
            vms = state.vms.len(),
            "infrastructure state"
        );
        self.bind_vms(ctx, &state)?;

        match state.state {
            InfraLifecycle::Configured => Ok(true),
            InfraLifecycle::Failed | InfraLifecycle::Unconfigured => {
                let mut message = format!(
                    "error during the contextualization of infrastructure <{infrastructure_id}> (state {:?})",
                    state.state
                );
                if let Some(details) = self.error_details(ctx).await {
                    message.push('\n');
                    message.push_str(&details);
                }
                Err(DriverError::Transient(message))
            }
            InfraLifecycle::Pending | InfraLifecycle::Running | InfraLifecycle::Deleting => {
                Ok(false)
            }
        }
    }

    async fn finalize_deploy(
        &self,
        ctx: &mut AttemptContext,
        succeeded: bool,
    ) -> Result<(), DriverError> {
        if !succeeded {
            self.status
                .update_on_error(&ctx.deployment_id, ctx.failure_reason_or_default())?;
            return Ok(());
        }
        if let Some(infrastructure_id) = self.platform_ref(ctx)? {
            let endpoint = ctx.endpoint.clone();
            let outputs = with_auth_retry(self.tokens.as_ref(), |token| {
                let endpoint = &endpoint;
                let id = infrastructure_id.as_str();
                async move { self.client.get_outputs(endpoint, &token, id).await }
            })
            .await
            .map_err(|err| {
                DriverError::Transient(format!(
                    "error retrieving outputs of infrastructure <{infrastructure_id}>: {err}"
                ))
            })?;
            self.store.update_deployment(&ctx.deployment_id, |d| {
                d.outputs = outputs.clone();
            })?;
        }
        self.status.update_on_success(&ctx.deployment_id)?;
        Ok(())
    }

    async fn cleanup_failed_deploy(
        &self,
        ctx: &mut AttemptContext,
        keep_last_attempt: bool,
    ) -> Result<(), DriverError> {
        let Some(infrastructure_id) = self.platform_ref(ctx)? else {
            info!(
                deployment_id = %ctx.deployment_id,
                "nothing left to clean up from the last deployment attempt"
            );
            return Ok(());
        };
        if keep_last_attempt {
            info!(
                deployment_id = %ctx.deployment_id,
                infrastructure_id = %infrastructure_id,
                "keeping the infrastructure of the last deployment attempt"
            );
            return Ok(());
        }

        info!(
            deployment_id = %ctx.deployment_id,
            infrastructure_id = %infrastructure_id,
            "deleting the infrastructure of the failed attempt"
        );
        let endpoint = ctx.endpoint.clone();
        let result = with_auth_retry(self.tokens.as_ref(), |token| {
            let endpoint = &endpoint;
            let id = infrastructure_id.as_str();
            async move { self.client.delete_infrastructure(endpoint, &token, id).await }
        })
        .await;
        match result {
            Ok(()) => {}
            Err(err) if err.is_not_found() => {}
            Err(err) => {
                warn!(
                    deployment_id = %ctx.deployment_id,
                    infrastructure_id = %infrastructure_id,
                    error = %err,
                    "failed to clean up infrastructure after failed attempt"
                );
            }
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
        let Some(infrastructure_id) = self.platform_ref(ctx)? else {
            debug!(
                deployment_id = %ctx.deployment_id,
                "no infrastructure was ever created, nothing to delete"
            );
            return Ok(DeployProgress::Submitted);
        };

        self.store
            .update_all_resources(&ctx.deployment_id, |resource| {
                resource.state = ResourceState::Deleting;
            })?;

        let endpoint = ctx.endpoint.clone();
        let result = with_auth_retry(self.tokens.as_ref(), |token| {
            let endpoint = &endpoint;
            let id = infrastructure_id.as_str();
            async move { self.client.delete_infrastructure(endpoint, &token, id).await }
        })
        .await;
        match result {
            Ok(()) => {}
            Err(err) if err.is_not_found() => {}
            Err(err) => {
                return Err(DriverError::Transient(format!(
                    "error deleting infrastructure <{infrastructure_id}>: {err}"
                )));
            }
        }
        Ok(DeployProgress::Submitted)
    }

    async fn is_undeployed(&self, ctx: &mut AttemptContext) -> Result<bool, DriverError> {
        let Some(infrastructure_id) = self.platform_ref(ctx)? else {
            return Ok(true);
        };
        match self.fetch_state(ctx, &infrastructure_id).await {
            // Still known to the manager: deletion not finished yet.
            Ok(_) => Ok(false),
            Err(err) if err.is_not_found() => Ok(true),
            Err(err) => Err(DriverError::Transient(format!(
                "error querying infrastructure <{infrastructure_id}> state: {err}"
            ))),
        }
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
            "infrastructure manager timeout during deployment <{}>{details}",
            ctx.deployment_id
        ))
    }

    async fn error_details(&self, ctx: &AttemptContext) -> Option<String> {
        let infrastructure_id = self.platform_ref(ctx).ok().flatten()?;
        let endpoint = ctx.endpoint.clone();
        let log = with_auth_retry(self.tokens.as_ref(), |token| {
            let endpoint = &endpoint;
            let id = infrastructure_id.as_str();
            async move { self.client.get_log(endpoint, &token, id).await }
        })
        .await
        .ok()
        .flatten()?;
        if log.is_empty() {
            None
        } else {
            Some(format!("contextualization log:\n{log}"))
        }
    }
}
