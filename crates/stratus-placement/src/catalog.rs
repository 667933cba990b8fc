//! Provider catalog collaborator contract.
//!
//! The catalog (a CMDB-like registry maintained outside this system)
//! knows which services each cloud provider runs. The engine prefetches
//! the compute-service descriptor of every ranked candidate before
//! building the selector, so selection itself never blocks on catalog
//! I/O.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::SelectionError;

/// Compute-service metadata for one provider, as published in the
/// catalog.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceDescriptor {
    /// Catalog id of the service.
    pub id: String,
    /// Raw service-type string, classified via
    /// [`crate::matcher::classify_service_type`].
    pub service_type: String,
    /// Service endpoint URL.
    pub endpoint: String,
    /// Site-local infrastructure-manager endpoint, when the site runs
    /// one.
    pub infra_endpoint: Option<String>,
    pub region: Option<String>,
}

/// Read access to the provider catalog.
#[async_trait]
pub trait ProviderCatalog: Send + Sync {
    /// The compute service registered for `provider`, if any.
    async fn compute_service(
        &self,
        provider: &str,
    ) -> Result<Option<ServiceDescriptor>, SelectionError>;
}
