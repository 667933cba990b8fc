//! Idempotent deployment status transitions.
//!
//! All record-level success/failure bookkeeping funnels through the
//! `StatusWriter` so the transitions stay consistent across drivers:
//! finalizing twice with the same outcome is a no-op after the first
//! application, and the status reason is overwritten with the latest
//! cause.

use tracing::{debug, warn};

use stratus_state::{
    DeploymentRecord, DeploymentStatus, ResourceState, StateResult, StateStore, TaskKind,
};

/// Writes deployment/resource status updates to the store.
#[derive(Clone)]
pub struct StatusWriter {
    store: StateStore,
}

impl StatusWriter {
    pub fn new(store: StateStore) -> Self {
        Self { store }
    }

    /// Mark a deployment failed with the given reason.
    ///
    /// Already-failed deployments keep their status; the reason is still
    /// overwritten so the latest cause is visible.
    pub fn update_on_error(&self, deployment_id: &str, message: &str) -> StateResult<()> {
        self.store.update_deployment(deployment_id, |d| {
            match d.status {
                DeploymentStatus::DeployFailed | DeploymentStatus::UndeployFailed => {
                    warn!(
                        %deployment_id,
                        status = ?d.status,
                        "deployment was already in a failed state"
                    );
                }
                DeploymentStatus::NotStarted
                | DeploymentStatus::Deploying
                | DeploymentStatus::PollingDeploy => {
                    d.status = DeploymentStatus::DeployFailed;
                }
                DeploymentStatus::Undeploying | DeploymentStatus::PollingUndeploy => {
                    d.status = DeploymentStatus::UndeployFailed;
                }
                DeploymentStatus::Deployed | DeploymentStatus::Undeployed => {
                    warn!(
                        %deployment_id,
                        status = ?d.status,
                        "error reported for a deployment in a terminal success state"
                    );
                }
            }
            d.task = TaskKind::None;
            d.status_reason = Some(message.to_string());
        })?;
        self.store
            .update_all_resources(deployment_id, |resource| {
                if !matches!(resource.state, ResourceState::Started | ResourceState::Error) {
                    resource.state = ResourceState::Error;
                }
            })?;
        Ok(())
    }

    /// Mark the current phase of a deployment successfully completed.
    pub fn update_on_success(&self, deployment_id: &str) -> StateResult<DeploymentRecord> {
        let record = self.store.update_deployment(deployment_id, |d| {
            match d.status {
                DeploymentStatus::Deploying | DeploymentStatus::PollingDeploy => {
                    d.status = DeploymentStatus::Deployed;
                }
                DeploymentStatus::Undeploying | DeploymentStatus::PollingUndeploy => {
                    d.status = DeploymentStatus::Undeployed;
                }
                DeploymentStatus::Deployed | DeploymentStatus::Undeployed => {
                    warn!(
                        %deployment_id,
                        status = ?d.status,
                        "deployment was already in a terminal state"
                    );
                }
                other => {
                    warn!(
                        %deployment_id,
                        status = ?other,
                        "success reported for a deployment not in progress"
                    );
                }
            }
            d.task = TaskKind::None;
            d.status_reason = None;
        })?;

        match record.status {
            DeploymentStatus::Deployed => {
                self.store.update_all_resources(deployment_id, |resource| {
                    resource.state = match resource.state {
                        ResourceState::Initial
                        | ResourceState::Creating
                        | ResourceState::Created
                        | ResourceState::Configuring
                        | ResourceState::Configured
                        | ResourceState::Starting => ResourceState::Started,
                        ResourceState::Started => ResourceState::Started,
                        // A resource still being deleted when the deploy
                        // completes is out of sync with the platform.
                        ResourceState::Stopping
                        | ResourceState::Deleting
                        | ResourceState::Error => ResourceState::Error,
                    };
                })?;
            }
            DeploymentStatus::Undeployed => {
                let removed = self.store.delete_resources_for_deployment(deployment_id)?;
                debug!(%deployment_id, removed, "resources removed after undeploy");
            }
            _ => {}
        }
        Ok(record)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use stratus_state::ResourceRecord;

    fn setup(status: DeploymentStatus) -> (StateStore, StatusWriter) {
        let store = StateStore::open_in_memory().unwrap();
        let mut record = DeploymentRecord::new("d-1", "{}");
        record.status = status;
        store.put_deployment(&record).unwrap();
        let writer = StatusWriter::new(store.clone());
        (store, writer)
    }

    #[test]
    fn deploy_error_transitions_to_deploy_failed() {
        let (store, writer) = setup(DeploymentStatus::PollingDeploy);
        writer.update_on_error("d-1", "platform rejected").unwrap();

        let record = store.load_deployment("d-1").unwrap();
        assert_eq!(record.status, DeploymentStatus::DeployFailed);
        assert_eq!(record.task, TaskKind::None);
        assert_eq!(record.status_reason.as_deref(), Some("platform rejected"));
    }

    #[test]
    fn undeploy_error_transitions_to_undeploy_failed() {
        let (store, writer) = setup(DeploymentStatus::PollingUndeploy);
        writer.update_on_error("d-1", "delete refused").unwrap();
        let record = store.load_deployment("d-1").unwrap();
        assert_eq!(record.status, DeploymentStatus::UndeployFailed);
    }

    #[test]
    fn error_overwrites_reason_but_keeps_failed_status() {
        let (store, writer) = setup(DeploymentStatus::Deploying);
        writer.update_on_error("d-1", "first cause").unwrap();
        writer.update_on_error("d-1", "second cause").unwrap();

        let record = store.load_deployment("d-1").unwrap();
        assert_eq!(record.status, DeploymentStatus::DeployFailed);
        assert_eq!(record.status_reason.as_deref(), Some("second cause"));
    }

    #[test]
    fn error_marks_unfinished_resources() {
        let (store, writer) = setup(DeploymentStatus::PollingDeploy);
        let mut started = ResourceRecord::new("r-1", "d-1", "a", "t");
        started.state = ResourceState::Started;
        store.put_resource(&started).unwrap();
        let mut creating = ResourceRecord::new("r-2", "d-1", "b", "t");
        creating.state = ResourceState::Creating;
        store.put_resource(&creating).unwrap();

        writer.update_on_error("d-1", "boom").unwrap();

        let resources = store.resources_for_deployment("d-1").unwrap();
        for r in resources {
            match r.id.as_str() {
                "r-1" => assert_eq!(r.state, ResourceState::Started),
                _ => assert_eq!(r.state, ResourceState::Error),
            }
        }
    }

    #[test]
    fn deploy_success_starts_resources_and_clears_reason() {
        let (store, writer) = setup(DeploymentStatus::PollingDeploy);
        store
            .update_deployment("d-1", |d| d.status_reason = Some("stale".into()))
            .unwrap();
        let mut r = ResourceRecord::new("r-1", "d-1", "a", "t");
        r.state = ResourceState::Configuring;
        store.put_resource(&r).unwrap();

        let record = writer.update_on_success("d-1").unwrap();
        assert_eq!(record.status, DeploymentStatus::Deployed);
        assert!(record.status_reason.is_none());

        let resources = store.resources_for_deployment("d-1").unwrap();
        assert_eq!(resources[0].state, ResourceState::Started);
    }

    #[test]
    fn finalize_success_is_idempotent() {
        let (store, writer) = setup(DeploymentStatus::PollingDeploy);
        store.put_resource(&ResourceRecord::new("r-1", "d-1", "a", "t")).unwrap();

        writer.update_on_success("d-1").unwrap();
        let first = store.load_deployment("d-1").unwrap();
        let first_resources = store.resources_for_deployment("d-1").unwrap();

        writer.update_on_success("d-1").unwrap();
        let second = store.load_deployment("d-1").unwrap();
        let second_resources = store.resources_for_deployment("d-1").unwrap();

        assert_eq!(first.status, second.status);
        assert_eq!(first.status_reason, second.status_reason);
        assert_eq!(first_resources, second_resources);
    }

    #[test]
    fn undeploy_success_removes_resources() {
        let (store, writer) = setup(DeploymentStatus::PollingUndeploy);
        store.put_resource(&ResourceRecord::new("r-1", "d-1", "a", "t")).unwrap();

        let record = writer.update_on_success("d-1").unwrap();
        assert_eq!(record.status, DeploymentStatus::Undeployed);
        assert!(store.resources_for_deployment("d-1").unwrap().is_empty());
    }
}
