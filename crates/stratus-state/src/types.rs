//! Persisted domain types: deployments and their resources.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

use stratus_core::{CloudEndpoint, ProviderKind};

/// Unique identifier for a deployment.
pub type DeploymentId = String;

/// Lifecycle status of a deployment.
///
/// `Deployed`, `DeployFailed`, `Undeployed` and `UndeployFailed` are
/// terminal; the rest are in-progress states owned by exactly one
/// background task at a time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeploymentStatus {
    NotStarted,
    Deploying,
    PollingDeploy,
    Deployed,
    DeployFailed,
    Undeploying,
    PollingUndeploy,
    Undeployed,
    UndeployFailed,
}

impl DeploymentStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            DeploymentStatus::Deployed
                | DeploymentStatus::DeployFailed
                | DeploymentStatus::Undeployed
                | DeploymentStatus::UndeployFailed
        )
    }

    /// Whether this status belongs to the deploy half of the state machine.
    pub fn is_deploy_phase(self) -> bool {
        matches!(
            self,
            DeploymentStatus::NotStarted
                | DeploymentStatus::Deploying
                | DeploymentStatus::PollingDeploy
                | DeploymentStatus::Deployed
                | DeploymentStatus::DeployFailed
        )
    }
}

/// The step the engine is currently executing for a deployment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    None,
    Deploy,
    Poll,
    Finalize,
    Undeploy,
    Cleanup,
}

/// Lifecycle state of a single resource (one VM, one job, one app).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceState {
    Initial,
    Creating,
    Created,
    Configuring,
    Configured,
    Starting,
    Started,
    Stopping,
    Deleting,
    Error,
}

/// A deployment as persisted in the store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeploymentRecord {
    pub id: DeploymentId,
    /// The template document as submitted.
    pub template: String,
    /// Input parameters for template resolution.
    #[serde(default)]
    pub parameters: BTreeMap<String, Value>,
    pub status: DeploymentStatus,
    pub task: TaskKind,
    /// Name of the provider chosen for the current/last attempt.
    pub provider_name: Option<String>,
    /// Driver discriminator for the chosen provider.
    pub provider_kind: Option<ProviderKind>,
    /// Resolved endpoint of the chosen provider.
    pub endpoint: Option<CloudEndpoint>,
    /// Provider-assigned handle for the deployment as a whole
    /// (infrastructure id, app-group id).
    pub platform_ref: Option<String>,
    /// Latest failure cause, overwritten on every new failure and
    /// cleared on success.
    pub status_reason: Option<String>,
    /// Output values extracted when the deployment completes.
    #[serde(default)]
    pub outputs: BTreeMap<String, Value>,
    /// URL notified when the deployment reaches a terminal status.
    pub callback_url: Option<String>,
    /// Unix timestamp (seconds) when this record was created.
    pub created_at: u64,
    /// Unix timestamp (seconds) of the last status change.
    pub updated_at: u64,
}

impl DeploymentRecord {
    /// A fresh record for a newly submitted deployment.
    pub fn new(id: impl Into<String>, template: impl Into<String>) -> Self {
        let now = epoch_secs();
        Self {
            id: id.into(),
            template: template.into(),
            parameters: BTreeMap::new(),
            status: DeploymentStatus::NotStarted,
            task: TaskKind::None,
            provider_name: None,
            provider_kind: None,
            endpoint: None,
            platform_ref: None,
            status_reason: None,
            outputs: BTreeMap::new(),
            callback_url: None,
            created_at: now,
            updated_at: now,
        }
    }
}

/// One unit of deployable infrastructure, as persisted in the store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceRecord {
    pub id: String,
    pub deployment_id: DeploymentId,
    /// Name of the template node this resource was created for.
    pub node_name: String,
    /// Type of the template node.
    pub node_type: String,
    pub state: ResourceState,
    /// Identifier assigned by the external platform, once known.
    pub iaas_id: Option<String>,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

impl ResourceRecord {
    pub fn new(
        id: impl Into<String>,
        deployment_id: impl Into<String>,
        node_name: impl Into<String>,
        node_type: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            deployment_id: deployment_id.into(),
            node_name: node_name.into(),
            node_type: node_type.into(),
            state: ResourceState::Initial,
            iaas_id: None,
            metadata: BTreeMap::new(),
        }
    }

    /// Build the composite key for the resources table.
    pub fn table_key(&self) -> String {
        format!("{}:{}", self.deployment_id, self.id)
    }
}

/// Current wall-clock time as unix seconds.
pub fn epoch_secs() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
