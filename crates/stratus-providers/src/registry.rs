//! Fixed provider-kind → driver table.
//!
//! Built once at process start from the drivers handed in; each driver
//! self-declares the kind it serves. Resolution failures mean the
//! process is misconfigured for the deployments it receives — fatal,
//! never retried.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::info;

use stratus_core::ProviderKind;

use crate::driver::DeploymentDriver;
use crate::error::DriverError;

/// Registry of all available deployment drivers.
#[derive(Debug)]
pub struct DriverRegistry {
    drivers: HashMap<ProviderKind, Arc<dyn DeploymentDriver>>,
}

impl DriverRegistry {
    /// Build the table. Two drivers declaring the same kind is a
    /// configuration error.
    pub fn new(drivers: Vec<Arc<dyn DeploymentDriver>>) -> Result<Self, DriverError> {
        let mut table: HashMap<ProviderKind, Arc<dyn DeploymentDriver>> = HashMap::new();
        for driver in drivers {
            let kind = driver.provider_kind();
            if table.insert(kind, driver).is_some() {
                return Err(DriverError::Configuration(format!(
                    "duplicate deployment driver registered for provider kind {kind}"
                )));
            }
        }
        info!(kinds = table.len(), "deployment driver registry built");
        Ok(Self { drivers: table })
    }

    /// The driver serving `kind`.
    pub fn resolve(&self, kind: ProviderKind) -> Result<Arc<dyn DeploymentDriver>, DriverError> {
        self.drivers.get(&kind).cloned().ok_or_else(|| {
            DriverError::Configuration(format!(
                "no deployment driver registered for provider kind {kind}"
            ))
        })
    }

    /// Kinds with a registered driver.
    pub fn kinds(&self) -> Vec<ProviderKind> {
        self.drivers.keys().copied().collect()
    }
}
