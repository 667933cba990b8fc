//! Shared domain types: infrastructure kinds, provider kinds, endpoints.

use serde::{Deserialize, Serialize};
use std::fmt;

/// The kind of infrastructure a deployment requires, or a provider's
/// compute service offers.
///
/// Derived once per deployment from the template content and immutable
/// for the lifetime of one attempt sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InfraKind {
    /// VM infrastructure reached through the PaaS-level broker.
    VmBrokered,
    /// VM infrastructure on a directly-addressed OpenStack site.
    VmOpenStack,
    /// VM infrastructure on a directly-addressed OpenNebula site.
    VmOpenNebula,
    /// Legacy container-on-OpenNebula variant. A plain OpenNebula
    /// offering satisfies this requirement; the inverse does not hold.
    VmOnedock,
    /// Dependent batch jobs on a batch scheduler.
    BatchScheduler,
    /// Long-running app groups on a container orchestrator.
    ContainerGroup,
    /// Independent jobs on an HPC-style job scheduler.
    JobScheduler,
}

impl InfraKind {
    /// The driver discriminator serving this infrastructure kind.
    pub fn provider_kind(self) -> ProviderKind {
        match self {
            InfraKind::VmBrokered
            | InfraKind::VmOpenStack
            | InfraKind::VmOpenNebula
            | InfraKind::VmOnedock => ProviderKind::InfraManager,
            InfraKind::BatchScheduler => ProviderKind::BatchScheduler,
            InfraKind::ContainerGroup => ProviderKind::ContainerGroup,
            InfraKind::JobScheduler => ProviderKind::JobScheduler,
        }
    }
}

impl fmt::Display for InfraKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            InfraKind::VmBrokered => "vm_brokered",
            InfraKind::VmOpenStack => "vm_openstack",
            InfraKind::VmOpenNebula => "vm_opennebula",
            InfraKind::VmOnedock => "vm_onedock",
            InfraKind::BatchScheduler => "batch_scheduler",
            InfraKind::ContainerGroup => "container_group",
            InfraKind::JobScheduler => "job_scheduler",
        };
        f.write_str(s)
    }
}

/// Discriminator selecting which deployment driver handles a provider's
/// execution platform. One driver variant per kind, registered at startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderKind {
    InfraManager,
    BatchScheduler,
    ContainerGroup,
    JobScheduler,
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ProviderKind::InfraManager => "infra_manager",
            ProviderKind::BatchScheduler => "batch_scheduler",
            ProviderKind::ContainerGroup => "container_group",
            ProviderKind::JobScheduler => "job_scheduler",
        };
        f.write_str(s)
    }
}

/// Resolved connection info for one cloud provider, attached to a
/// deployment for the duration of one attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CloudEndpoint {
    /// The provider's compute service endpoint URL.
    pub compute_endpoint: String,
    /// Site-local infrastructure-manager endpoint, when the site runs
    /// its own instead of the PaaS-level broker.
    pub infra_endpoint: Option<String>,
    /// What the compute service offers.
    pub iaas_kind: InfraKind,
    /// Routing header for hybrid brokered access.
    pub header_id: Option<String>,
}

impl CloudEndpoint {
    pub fn new(compute_endpoint: impl Into<String>, iaas_kind: InfraKind) -> Self {
        Self {
            compute_endpoint: compute_endpoint.into(),
            infra_endpoint: None,
            iaas_kind,
            header_id: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vm_kinds_map_to_infra_manager() {
        for kind in [
            InfraKind::VmBrokered,
            InfraKind::VmOpenStack,
            InfraKind::VmOpenNebula,
            InfraKind::VmOnedock,
        ] {
            assert_eq!(kind.provider_kind(), ProviderKind::InfraManager);
        }
    }

    #[test]
    fn platform_kinds_map_to_their_driver() {
        assert_eq!(
            InfraKind::BatchScheduler.provider_kind(),
            ProviderKind::BatchScheduler
        );
        assert_eq!(
            InfraKind::ContainerGroup.provider_kind(),
            ProviderKind::ContainerGroup
        );
        assert_eq!(
            InfraKind::JobScheduler.provider_kind(),
            ProviderKind::JobScheduler
        );
    }

    #[test]
    fn serializes_snake_case() {
        let json = serde_json::to_string(&InfraKind::VmOpenStack).unwrap();
        assert_eq!(json, "\"vm_open_stack\"");
    }
}
