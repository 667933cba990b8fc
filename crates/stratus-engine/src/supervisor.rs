//! Per-deployment background tasks.
//!
//! The `Supervisor` owns one task per deployment id, enforcing the
//! invariant that a deployment never has more than one active attempt
//! in flight. A user-initiated undeploy cancels an in-flight deploy via
//! a watch channel; the poll loop observes it within one interval and
//! the task transitions straight to the undeploy path.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{watch, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use crate::engine::Orchestrator;
use crate::error::EngineError;

/// Per-deployment task state.
struct TaskSlot {
    handle: JoinHandle<()>,
    cancel_tx: watch::Sender<bool>,
}

/// Manages the background tasks of all in-flight deployments.
pub struct Supervisor {
    engine: Arc<Orchestrator>,
    tasks: Arc<RwLock<HashMap<String, TaskSlot>>>,
}

impl Supervisor {
    pub fn new(engine: Arc<Orchestrator>) -> Self {
        Self {
            engine,
            tasks: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Launch the deploy task for a submitted deployment.
    pub async fn start_deploy(&self, deployment_id: &str) -> Result<(), EngineError> {
        let mut tasks = self.tasks.write().await;
        if tasks.contains_key(deployment_id) {
            return Err(EngineError::AlreadyActive(deployment_id.to_string()));
        }

        let (cancel_tx, cancel_rx) = watch::channel(false);
        let engine = self.engine.clone();
        let tasks_map = self.tasks.clone();
        let id = deployment_id.to_string();
        let handle = tokio::spawn(async move {
            let result = engine.run_deploy(&id, cancel_rx.clone()).await;
            match result {
                Ok(()) => {}
                Err(EngineError::Cancelled) => {
                    info!(deployment_id = %id, "deploy cancelled, starting undeploy");
                    if let Err(err) = engine.run_undeploy(&id, cancel_rx).await {
                        error!(deployment_id = %id, error = %err, "undeploy after cancel failed");
                    }
                }
                Err(err) => {
                    error!(deployment_id = %id, error = %err, "deployment failed");
                }
            }
            tasks_map.write().await.remove(&id);
        });

        tasks.insert(
            deployment_id.to_string(),
            TaskSlot { handle, cancel_tx },
        );
        info!(%deployment_id, "deploy task started");
        Ok(())
    }

    /// Request an undeploy.
    ///
    /// When a deploy is still in flight its poll loop is signalled and
    /// continues into the undeploy path on its own; otherwise a fresh
    /// undeploy task is spawned.
    pub async fn request_undeploy(&self, deployment_id: &str) -> Result<(), EngineError> {
        {
            let tasks = self.tasks.read().await;
            if let Some(slot) = tasks.get(deployment_id) {
                info!(%deployment_id, "cancelling in-flight task");
                let _ = slot.cancel_tx.send(true);
                return Ok(());
            }
        }

        let mut tasks = self.tasks.write().await;
        if tasks.contains_key(deployment_id) {
            // Raced with another request; the cancel above covers it.
            return Ok(());
        }
        let (cancel_tx, cancel_rx) = watch::channel(false);
        let engine = self.engine.clone();
        let tasks_map = self.tasks.clone();
        let id = deployment_id.to_string();
        let handle = tokio::spawn(async move {
            if let Err(err) = engine.run_undeploy(&id, cancel_rx).await {
                error!(deployment_id = %id, error = %err, "undeploy failed");
            }
            tasks_map.write().await.remove(&id);
        });
        tasks.insert(
            deployment_id.to_string(),
            TaskSlot { handle, cancel_tx },
        );
        info!(%deployment_id, "undeploy task started");
        Ok(())
    }

    /// Whether a deployment currently has a task in flight.
    pub async fn is_active(&self, deployment_id: &str) -> bool {
        self.tasks.read().await.contains_key(deployment_id)
    }

    /// Deployment ids with an active task.
    pub async fn active(&self) -> Vec<String> {
        self.tasks.read().await.keys().cloned().collect()
    }

    /// Abort every task (for shutdown).
    pub async fn stop_all(&self) {
        let mut tasks = self.tasks.write().await;
        for (id, slot) in tasks.drain() {
            let _ = slot.cancel_tx.send(true);
            slot.handle.abort();
            debug!(deployment_id = %id, "task stopped");
        }
        info!("all deployment tasks stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::collections::HashMap;
    use stratus_core::EngineConfig;
    use stratus_placement::{ProviderCatalog, RankedCandidate, SelectionError, ServiceDescriptor};
    use stratus_providers::batch::{BatchClient, BatchSchedulerDriver, JobSpec, JobStatus};
    use stratus_providers::client::{PlatformError, StaticToken};
    use stratus_providers::DriverRegistry;
    use stratus_state::{DeploymentRecord, DeploymentStatus, StateStore};
    use stratus_core::CloudEndpoint;

    use crate::callback::NoopCallback;
    use crate::ranker::{ProviderRanker, RankingRequest};

    struct FixedRanker(Vec<RankedCandidate>);

    #[async_trait]
    impl ProviderRanker for FixedRanker {
        async fn ranking(
            &self,
            _: &RankingRequest,
        ) -> Result<Vec<RankedCandidate>, EngineError> {
            Ok(self.0.clone())
        }
    }

    struct MapCatalog(HashMap<String, ServiceDescriptor>);

    #[async_trait]
    impl ProviderCatalog for MapCatalog {
        async fn compute_service(
            &self,
            provider: &str,
        ) -> Result<Option<ServiceDescriptor>, SelectionError> {
            Ok(self.0.get(provider).cloned())
        }
    }

    #[derive(Default)]
    struct InstantBatch {
        jobs: std::sync::Mutex<HashMap<String, JobStatus>>,
    }

    #[async_trait]
    impl BatchClient for InstantBatch {
        async fn create_job(
            &self,
            _: &CloudEndpoint,
            _: &str,
            job: &JobSpec,
        ) -> Result<(), PlatformError> {
            self.jobs.lock().unwrap().insert(
                job.name.clone(),
                JobStatus {
                    name: job.name.clone(),
                    success_count: 1,
                    error_count: 0,
                },
            );
            Ok(())
        }

        async fn create_dependent_job(
            &self,
            endpoint: &CloudEndpoint,
            token: &str,
            job: &JobSpec,
        ) -> Result<(), PlatformError> {
            self.create_job(endpoint, token, job).await
        }

        async fn get_job(
            &self,
            _: &CloudEndpoint,
            _: &str,
            name: &str,
        ) -> Result<Option<JobStatus>, PlatformError> {
            Ok(self.jobs.lock().unwrap().get(name).cloned())
        }

        async fn delete_job(
            &self,
            _: &CloudEndpoint,
            _: &str,
            name: &str,
        ) -> Result<(), PlatformError> {
            self.jobs.lock().unwrap().remove(name);
            Ok(())
        }
    }

    fn engine(store: &StateStore) -> Arc<Orchestrator> {
        let driver = Arc::new(BatchSchedulerDriver::new(
            store.clone(),
            Arc::new(InstantBatch::default()),
            Arc::new(StaticToken::default()),
        ));
        let registry = Arc::new(DriverRegistry::new(vec![driver]).unwrap());
        let descriptor = ServiceDescriptor {
            id: "svc-1".to_string(),
            service_type: "eu.mesos.chronos".to_string(),
            endpoint: "http://batch.example.org".to_string(),
            infra_endpoint: None,
            region: None,
        };
        Arc::new(Orchestrator::new(
            store.clone(),
            registry,
            Arc::new(FixedRanker(vec![RankedCandidate::new("p1", 1, true)])),
            Arc::new(MapCatalog(
                [("p1".to_string(), descriptor)].into_iter().collect(),
            )),
            Arc::new(NoopCallback),
            EngineConfig {
                poll_interval_secs: 0,
                ..EngineConfig::default()
            },
        ))
    }

    const TEMPLATE: &str = r#"{ "nodes": {
        "job": { "type": "stratus.nodes.BatchJob",
                 "properties": { "command": "true" } }
    } }"#;

    async fn wait_until_idle(supervisor: &Supervisor, deployment_id: &str) {
        for _ in 0..200 {
            if !supervisor.is_active(deployment_id).await {
                return;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        panic!("task for {deployment_id} did not finish");
    }

    #[tokio::test]
    async fn deploy_task_runs_to_completion() {
        let store = StateStore::open_in_memory().unwrap();
        store
            .put_deployment(&DeploymentRecord::new("d-1", TEMPLATE))
            .unwrap();
        let supervisor = Supervisor::new(engine(&store));

        supervisor.start_deploy("d-1").await.unwrap();
        assert!(supervisor.is_active("d-1").await);
        wait_until_idle(&supervisor, "d-1").await;

        let record = store.load_deployment("d-1").unwrap();
        assert_eq!(record.status, DeploymentStatus::Deployed);
    }

    #[tokio::test]
    async fn duplicate_deploy_rejected_while_active() {
        let store = StateStore::open_in_memory().unwrap();
        store
            .put_deployment(&DeploymentRecord::new("d-1", TEMPLATE))
            .unwrap();
        let supervisor = Supervisor::new(engine(&store));

        supervisor.start_deploy("d-1").await.unwrap();
        let err = supervisor.start_deploy("d-1").await;
        assert!(matches!(err, Err(EngineError::AlreadyActive(_))));
        wait_until_idle(&supervisor, "d-1").await;
    }

    #[tokio::test]
    async fn undeploy_of_idle_deployment_spawns_a_task() {
        let store = StateStore::open_in_memory().unwrap();
        store
            .put_deployment(&DeploymentRecord::new("d-1", TEMPLATE))
            .unwrap();
        let supervisor = Supervisor::new(engine(&store));

        supervisor.start_deploy("d-1").await.unwrap();
        wait_until_idle(&supervisor, "d-1").await;

        supervisor.request_undeploy("d-1").await.unwrap();
        wait_until_idle(&supervisor, "d-1").await;

        let record = store.load_deployment("d-1").unwrap();
        assert_eq!(record.status, DeploymentStatus::Undeployed);
    }

    #[tokio::test]
    async fn stop_all_clears_active_tasks() {
        let store = StateStore::open_in_memory().unwrap();
        store
            .put_deployment(&DeploymentRecord::new("d-1", TEMPLATE))
            .unwrap();
        let supervisor = Supervisor::new(engine(&store));

        supervisor.start_deploy("d-1").await.unwrap();
        supervisor.stop_all().await;
        assert!(supervisor.active().await.is_empty());
    }
}
