//! The deployment control loop.
//!
//! One `Orchestrator` is shared by all deployments; each deployment's
//! lifecycle runs strictly sequentially on its own background task.
//! Candidate providers are tried in ascending-rank order, never twice;
//! a fatal (template/configuration) failure ends the deployment
//! immediately, a provider-side failure advances to the next candidate.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use stratus_core::template::parse_and_validate;
use stratus_core::EngineConfig;
use stratus_placement::{
    derive_requirement, CandidateSelector, ProviderCatalog, ProviderRanking, ServiceDescriptor,
};
use stratus_providers::driver::{AttemptContext, CleanupMode, DeployProgress, DeploymentDriver};
use stratus_providers::{DriverError, DriverRegistry, StatusWriter};
use stratus_state::{DeploymentStatus, StateStore, TaskKind};

use crate::callback::CallbackSink;
use crate::error::EngineError;
use crate::ranker::{ProviderRanker, RankingRequest};

/// Outcome of one provider attempt.
enum AttemptFailure {
    Cancelled,
    Driver(DriverError),
}

impl From<stratus_state::StateError> for AttemptFailure {
    fn from(err: stratus_state::StateError) -> Self {
        AttemptFailure::Driver(DriverError::from(err))
    }
}

/// The top-level deployment engine.
pub struct Orchestrator {
    store: StateStore,
    status: StatusWriter,
    registry: Arc<DriverRegistry>,
    ranker: Arc<dyn ProviderRanker>,
    catalog: Arc<dyn ProviderCatalog>,
    callbacks: Arc<dyn CallbackSink>,
    config: EngineConfig,
}

impl Orchestrator {
    pub fn new(
        store: StateStore,
        registry: Arc<DriverRegistry>,
        ranker: Arc<dyn ProviderRanker>,
        catalog: Arc<dyn ProviderCatalog>,
        callbacks: Arc<dyn CallbackSink>,
        config: EngineConfig,
    ) -> Self {
        let status = StatusWriter::new(store.clone());
        Self {
            store,
            status,
            registry,
            ranker,
            catalog,
            callbacks,
            config,
        }
    }

    /// Drive a deployment to a terminal state.
    ///
    /// Returns `EngineError::Cancelled` when the cancel signal fires
    /// mid-flight; the caller is expected to continue with
    /// [`Orchestrator::run_undeploy`].
    pub async fn run_deploy(
        &self,
        deployment_id: &str,
        mut cancel: watch::Receiver<bool>,
    ) -> Result<(), EngineError> {
        let deployment = self.store.load_deployment(deployment_id)?;

        let template = match parse_and_validate(&deployment.template, &deployment.parameters) {
            Ok(template) => template,
            Err(err) => {
                let reason = format!("template error: {err}");
                return self
                    .fail(deployment_id, &reason, EngineError::Template(err.to_string()))
                    .await;
            }
        };
        let requirement = match derive_requirement(&template) {
            Ok(requirement) => requirement,
            Err(err) => {
                let reason = format!("template error: {err}");
                return self
                    .fail(deployment_id, &reason, EngineError::Template(err.to_string()))
                    .await;
            }
        };
        info!(%deployment_id, %requirement, "deployment requirement derived");

        let request = RankingRequest {
            deployment_id: deployment_id.to_string(),
            requirement,
        };
        let candidates = match self.ranker.ranking(&request).await {
            Ok(candidates) => candidates,
            Err(err) => {
                let reason = err.to_string();
                return self.fail(deployment_id, &reason, err).await;
            }
        };
        let ranking = ProviderRanking::new(candidates);

        // Prefetch the compute-service descriptors so selection itself
        // never blocks on catalog I/O; validation stays per-candidate.
        let mut descriptors: HashMap<String, ServiceDescriptor> = HashMap::new();
        for candidate in ranking.ordered_eligible(None) {
            match self.catalog.compute_service(&candidate.provider).await {
                Ok(Some(descriptor)) => {
                    descriptors.insert(candidate.provider.clone(), descriptor);
                }
                Ok(None) => {}
                Err(err) => {
                    warn!(
                        provider = %candidate.provider,
                        error = %err,
                        "catalog lookup failed, candidate will error at dereference"
                    );
                }
            }
        }

        let mut selector = CandidateSelector::build(
            requirement,
            &ranking,
            &descriptors,
            self.config.max_provider_retries,
        );
        if selector.size() == 0 {
            return self
                .fail(
                    deployment_id,
                    "no compatible provider found",
                    EngineError::NoCompatibleProvider,
                )
                .await;
        }

        let kind = requirement.provider_kind();
        let driver = match self.registry.resolve(kind) {
            Ok(driver) => driver,
            Err(err) => {
                let reason = err.to_string();
                return self.fail(deployment_id, &reason, err.into()).await;
            }
        };

        loop {
            let (provider, endpoint) = match selector.next() {
                None => {
                    let report = selector.exhausted_report();
                    return self
                        .fail(
                            deployment_id,
                            &report,
                            EngineError::ProvidersExhausted(report.clone()),
                        )
                        .await;
                }
                Some(Err(err)) => {
                    warn!(%deployment_id, error = %err, "candidate unusable, advancing");
                    selector.record_failure(err.to_string());
                    continue;
                }
                Some(Ok(pair)) => pair,
            };

            info!(%deployment_id, %provider, %kind, "trying candidate provider");
            self.store.update_deployment(deployment_id, |d| {
                d.provider_name = Some(provider.clone());
                d.provider_kind = Some(kind);
                d.endpoint = Some(endpoint.clone());
            })?;

            let mut ctx = AttemptContext::new(deployment_id, endpoint);
            match self.run_attempt(driver.as_ref(), &mut ctx, &mut cancel).await {
                Ok(()) => {
                    driver.finalize_deploy(&mut ctx, true).await?;
                    info!(%deployment_id, %provider, "deployment completed");
                    self.notify(deployment_id).await;
                    return Ok(());
                }
                Err(AttemptFailure::Cancelled) => {
                    info!(%deployment_id, "deployment cancelled while in flight");
                    return Err(EngineError::Cancelled);
                }
                Err(AttemptFailure::Driver(err)) => {
                    let reason = err.to_string();
                    ctx.failure_reason = Some(reason.clone());
                    if let Err(finalize_err) = driver.finalize_deploy(&mut ctx, false).await {
                        warn!(
                            %deployment_id,
                            error = %finalize_err,
                            "failed to finalize failed attempt"
                        );
                    }

                    let keep = self.config.keep_last_attempt && !selector.has_next();
                    if let Err(update_err) = self
                        .store
                        .update_deployment(deployment_id, |d| d.task = TaskKind::Cleanup)
                    {
                        warn!(%deployment_id, error = %update_err, "failed to record cleanup task");
                    }
                    if let Err(cleanup_err) =
                        driver.cleanup_failed_deploy(&mut ctx, keep).await
                    {
                        warn!(
                            %deployment_id,
                            error = %cleanup_err,
                            "failed to clean up after failed attempt"
                        );
                    }

                    if err.is_fatal() {
                        error!(%deployment_id, %provider, error = %reason, "deployment failed");
                        self.notify(deployment_id).await;
                        return Err(err.into());
                    }
                    warn!(
                        %deployment_id,
                        %provider,
                        error = %reason,
                        "attempt failed, advancing to the next candidate"
                    );
                    selector.record_failure(reason);
                }
            }
        }
    }

    /// One deploy attempt against the already-chosen provider.
    async fn run_attempt(
        &self,
        driver: &dyn DeploymentDriver,
        ctx: &mut AttemptContext,
        cancel: &mut watch::Receiver<bool>,
    ) -> Result<(), AttemptFailure> {
        let deployment_id = ctx.deployment_id.clone();
        self.store.update_deployment(&deployment_id, |d| {
            d.status = DeploymentStatus::Deploying;
            d.task = TaskKind::Deploy;
            d.status_reason = None;
        })?;

        // Submission, one unit at a time for the incremental drivers.
        loop {
            if *cancel.borrow() {
                return Err(AttemptFailure::Cancelled);
            }
            match driver.deploy(ctx).await {
                Ok(DeployProgress::Submitted) => break,
                Ok(DeployProgress::MoreUnits) => continue,
                Err(err) => return Err(AttemptFailure::Driver(err)),
            }
        }

        self.store.update_deployment(&deployment_id, |d| {
            d.status = DeploymentStatus::PollingDeploy;
            d.task = TaskKind::Poll;
        })?;

        let deadline = tokio::time::Instant::now() + self.config.deploy_timeout();
        loop {
            if *cancel.borrow() {
                return Err(AttemptFailure::Cancelled);
            }
            match driver.is_deployed(ctx).await {
                Ok(true) => break,
                Ok(false) => {}
                Err(err) => return Err(AttemptFailure::Driver(err)),
            }
            if tokio::time::Instant::now() >= deadline {
                let timeout_err = driver.provider_timeout(ctx).await;
                return Err(AttemptFailure::Driver(timeout_err));
            }
            if !ctx.skip_poll_interval {
                // The cancel branch just wakes the loop; the check at
                // the top decides.
                tokio::select! {
                    _ = tokio::time::sleep(self.config.poll_interval()) => {}
                    _ = cancel.changed() => {}
                }
            }
        }

        self.store
            .update_deployment(&deployment_id, |d| d.task = TaskKind::Finalize)?;
        Ok(())
    }

    /// Tear a deployment down.
    ///
    /// The provider chosen during deploy is reused; a deployment that
    /// never reached one is removed locally without any platform call.
    pub async fn run_undeploy(
        &self,
        deployment_id: &str,
        _cancel: watch::Receiver<bool>,
    ) -> Result<(), EngineError> {
        let deployment = self.store.load_deployment(deployment_id)?;

        let Some(kind) = deployment.provider_kind else {
            info!(
                %deployment_id,
                "no provider was ever chosen, removing the deployment locally"
            );
            self.store.update_deployment(deployment_id, |d| {
                d.status = DeploymentStatus::Undeployed;
                d.task = TaskKind::None;
                d.status_reason = None;
            })?;
            self.notify(deployment_id).await;
            self.store.delete_deployment(deployment_id)?;
            return Ok(());
        };
        let Some(endpoint) = deployment.endpoint.clone() else {
            let reason = format!(
                "provider kind {kind} recorded without an endpoint, cannot undeploy"
            );
            return self
                .fail(
                    deployment_id,
                    &reason,
                    DriverError::Configuration(reason.clone()).into(),
                )
                .await;
        };
        let driver = match self.registry.resolve(kind) {
            Ok(driver) => driver,
            Err(err) => {
                let reason = err.to_string();
                return self.fail(deployment_id, &reason, err.into()).await;
            }
        };

        self.store.update_deployment(deployment_id, |d| {
            d.status = DeploymentStatus::Undeploying;
            d.task = TaskKind::Undeploy;
            d.status_reason = None;
        })?;

        let mut ctx = AttemptContext::new(deployment_id, endpoint);
        loop {
            // Final teardown is best-effort: one stuck unit must not
            // leave the rest behind.
            match driver.undeploy(&mut ctx, CleanupMode::BestEffort).await {
                Ok(DeployProgress::Submitted) => break,
                Ok(DeployProgress::MoreUnits) => continue,
                Err(err) => {
                    let reason = err.to_string();
                    return self.fail(deployment_id, &reason, err.into()).await;
                }
            }
        }

        self.store.update_deployment(deployment_id, |d| {
            d.status = DeploymentStatus::PollingUndeploy;
            d.task = TaskKind::Poll;
        })?;

        let deadline = tokio::time::Instant::now() + self.config.undeploy_timeout();
        loop {
            match driver.is_undeployed(&mut ctx).await {
                Ok(true) => break,
                Ok(false) => {}
                Err(err) => {
                    let reason = err.to_string();
                    return self.fail(deployment_id, &reason, err.into()).await;
                }
            }
            if tokio::time::Instant::now() >= deadline {
                let timeout_err = driver.provider_timeout(&mut ctx).await;
                let reason = timeout_err.to_string();
                return self.fail(deployment_id, &reason, timeout_err.into()).await;
            }
            if !ctx.skip_poll_interval {
                tokio::time::sleep(self.config.poll_interval()).await;
            }
        }

        self.store
            .update_deployment(deployment_id, |d| d.task = TaskKind::Finalize)?;
        driver.finalize_undeploy(&mut ctx).await?;
        info!(%deployment_id, "deployment undeployed");
        self.notify(deployment_id).await;
        Ok(())
    }

    /// Record a terminal failure, notify, and return the error.
    async fn fail(
        &self,
        deployment_id: &str,
        reason: &str,
        err: EngineError,
    ) -> Result<(), EngineError> {
        if let Err(status_err) = self.status.update_on_error(deployment_id, reason) {
            warn!(%deployment_id, error = %status_err, "failed to record terminal failure");
        }
        self.notify(deployment_id).await;
        Err(err)
    }

    async fn notify(&self, deployment_id: &str) {
        match self.store.get_deployment(deployment_id) {
            Ok(Some(record)) => {
                if record.callback_url.is_some() {
                    self.callbacks.notify(&record).await;
                }
            }
            Ok(None) => {}
            Err(err) => {
                debug!(%deployment_id, error = %err, "could not load deployment for callback");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use stratus_core::{CloudEndpoint, ProviderKind};
    use stratus_placement::{RankedCandidate, SelectionError};
    use stratus_state::DeploymentRecord;

    const BATCH_TEMPLATE: &str = r#"{ "nodes": {
        "job": { "type": "stratus.nodes.BatchJob",
                 "properties": { "command": "true" } }
    } }"#;

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

    /// Driver whose deploy outcomes are scripted per attempt.
    struct ScriptedDriver {
        kind: ProviderKind,
        outcomes: Mutex<Vec<Result<(), DriverError>>>,
        deploy_calls: AtomicUsize,
        finalize_success: AtomicUsize,
        finalize_failure: AtomicUsize,
        cleanup_calls: AtomicUsize,
        timeout_calls: AtomicUsize,
        poll_forever: bool,
        status: StatusWriter,
    }

    impl ScriptedDriver {
        fn new(store: &StateStore, outcomes: Vec<Result<(), DriverError>>) -> Self {
            Self {
                kind: ProviderKind::BatchScheduler,
                outcomes: Mutex::new(outcomes),
                deploy_calls: AtomicUsize::new(0),
                finalize_success: AtomicUsize::new(0),
                finalize_failure: AtomicUsize::new(0),
                cleanup_calls: AtomicUsize::new(0),
                timeout_calls: AtomicUsize::new(0),
                poll_forever: false,
                status: StatusWriter::new(store.clone()),
            }
        }
    }

    impl std::fmt::Debug for ScriptedDriver {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            f.debug_struct("ScriptedDriver").finish_non_exhaustive()
        }
    }

    #[async_trait]
    impl DeploymentDriver for ScriptedDriver {
        fn provider_kind(&self) -> ProviderKind {
            self.kind
        }

        async fn deploy(&self, _: &mut AttemptContext) -> Result<DeployProgress, DriverError> {
            self.deploy_calls.fetch_add(1, Ordering::SeqCst);
            let mut outcomes = self.outcomes.lock().unwrap();
            match outcomes.remove(0) {
                Ok(()) => Ok(DeployProgress::Submitted),
                Err(err) => Err(err),
            }
        }

        async fn is_deployed(&self, _: &mut AttemptContext) -> Result<bool, DriverError> {
            Ok(!self.poll_forever)
        }

        async fn finalize_deploy(
            &self,
            ctx: &mut AttemptContext,
            succeeded: bool,
        ) -> Result<(), DriverError> {
            if succeeded {
                self.finalize_success.fetch_add(1, Ordering::SeqCst);
                self.status.update_on_success(&ctx.deployment_id)?;
            } else {
                self.finalize_failure.fetch_add(1, Ordering::SeqCst);
                self.status
                    .update_on_error(&ctx.deployment_id, ctx.failure_reason_or_default())?;
            }
            Ok(())
        }

        async fn cleanup_failed_deploy(
            &self,
            _: &mut AttemptContext,
            _: bool,
        ) -> Result<(), DriverError> {
            self.cleanup_calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn undeploy(
            &self,
            _: &mut AttemptContext,
            _: CleanupMode,
        ) -> Result<DeployProgress, DriverError> {
            Ok(DeployProgress::Submitted)
        }

        async fn is_undeployed(&self, _: &mut AttemptContext) -> Result<bool, DriverError> {
            Ok(true)
        }

        async fn finalize_undeploy(&self, ctx: &mut AttemptContext) -> Result<(), DriverError> {
            self.status.update_on_success(&ctx.deployment_id)?;
            Ok(())
        }

        async fn provider_timeout(&self, ctx: &mut AttemptContext) -> DriverError {
            self.timeout_calls.fetch_add(1, Ordering::SeqCst);
            DriverError::Timeout(format!("scripted timeout for <{}>", ctx.deployment_id))
        }

        async fn error_details(&self, _: &AttemptContext) -> Option<String> {
            None
        }
    }

    fn batch_descriptor(id: &str) -> ServiceDescriptor {
        ServiceDescriptor {
            id: id.to_string(),
            service_type: "eu.mesos.chronos".to_string(),
            endpoint: format!("http://{id}.example.org"),
            infra_endpoint: None,
            region: None,
        }
    }

    fn quick_config() -> EngineConfig {
        EngineConfig {
            poll_interval_secs: 0,
            deploy_timeout_secs: 60,
            undeploy_timeout_secs: 60,
            max_provider_retries: None,
            keep_last_attempt: false,
        }
    }

    struct Harness {
        store: StateStore,
        driver: Arc<ScriptedDriver>,
        engine: Orchestrator,
    }

    fn harness(
        candidates: Vec<RankedCandidate>,
        descriptors: Vec<(&str, ServiceDescriptor)>,
        outcomes: Vec<Result<(), DriverError>>,
        config: EngineConfig,
    ) -> Harness {
        let store = StateStore::open_in_memory().unwrap();
        store
            .put_deployment(&DeploymentRecord::new("d-1", BATCH_TEMPLATE))
            .unwrap();
        let driver = Arc::new(ScriptedDriver::new(&store, outcomes));
        let registry = Arc::new(DriverRegistry::new(vec![driver.clone()]).unwrap());
        let catalog = MapCatalog(
            descriptors
                .into_iter()
                .map(|(name, d)| (name.to_string(), d))
                .collect(),
        );
        let engine = Orchestrator::new(
            store.clone(),
            registry,
            Arc::new(FixedRanker(candidates)),
            Arc::new(catalog),
            Arc::new(crate::callback::NoopCallback),
            config,
        );
        Harness {
            store,
            driver,
            engine,
        }
    }

    fn no_cancel() -> watch::Receiver<bool> {
        let (tx, rx) = watch::channel(false);
        // Keep the sender alive for the duration of the test.
        std::mem::forget(tx);
        rx
    }

    #[tokio::test]
    async fn succeeds_on_first_compatible_candidate() {
        // The better-ranked candidate offers the wrong platform kind and
        // must be skipped entirely.
        let h = harness(
            vec![
                RankedCandidate::new("p1", 100, true),
                RankedCandidate::new("p2", 50, true),
            ],
            vec![
                ("p1", batch_descriptor("svc-p1")),
                ("p2", ServiceDescriptor {
                    id: "svc-p2".to_string(),
                    service_type: "eu.mesos.marathon".to_string(),
                    endpoint: "http://p2.example.org".to_string(),
                    infra_endpoint: None,
                    region: None,
                }),
            ],
            vec![Ok(())],
            quick_config(),
        );

        h.engine.run_deploy("d-1", no_cancel()).await.unwrap();

        let record = h.store.load_deployment("d-1").unwrap();
        assert_eq!(record.status, DeploymentStatus::Deployed);
        assert_eq!(record.provider_name.as_deref(), Some("p1"));
        assert_eq!(record.provider_kind, Some(ProviderKind::BatchScheduler));
        assert!(record.endpoint.is_some());
        assert_eq!(h.driver.deploy_calls.load(Ordering::SeqCst), 1);
        assert_eq!(h.driver.finalize_success.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn template_error_never_tries_a_second_candidate() {
        let h = harness(
            vec![
                RankedCandidate::new("p1", 1, true),
                RankedCandidate::new("p2", 2, true),
            ],
            vec![
                ("p1", batch_descriptor("svc-p1")),
                ("p2", batch_descriptor("svc-p2")),
            ],
            vec![Err(DriverError::Template("bad node".into()))],
            quick_config(),
        );

        let err = h.engine.run_deploy("d-1", no_cancel()).await.unwrap_err();
        assert!(matches!(err, EngineError::Driver(DriverError::Template(_))));

        // Only the first candidate was ever attempted.
        assert_eq!(h.driver.deploy_calls.load(Ordering::SeqCst), 1);
        let record = h.store.load_deployment("d-1").unwrap();
        assert_eq!(record.status, DeploymentStatus::DeployFailed);
        assert_eq!(record.provider_name.as_deref(), Some("p1"));
    }

    #[tokio::test]
    async fn transient_error_advances_exactly_once() {
        let h = harness(
            vec![
                RankedCandidate::new("p1", 1, true),
                RankedCandidate::new("p2", 2, true),
            ],
            vec![
                ("p1", batch_descriptor("svc-p1")),
                ("p2", batch_descriptor("svc-p2")),
            ],
            vec![Err(DriverError::Transient("quota exceeded".into())), Ok(())],
            quick_config(),
        );

        h.engine.run_deploy("d-1", no_cancel()).await.unwrap();

        assert_eq!(h.driver.deploy_calls.load(Ordering::SeqCst), 2);
        assert_eq!(h.driver.cleanup_calls.load(Ordering::SeqCst), 1);
        let record = h.store.load_deployment("d-1").unwrap();
        assert_eq!(record.status, DeploymentStatus::Deployed);
        assert_eq!(record.provider_name.as_deref(), Some("p2"));
    }

    #[tokio::test]
    async fn exhaustion_aggregates_every_cause() {
        let h = harness(
            vec![
                RankedCandidate::new("p1", 1, true),
                RankedCandidate::new("p2", 2, true),
            ],
            vec![
                ("p1", batch_descriptor("svc-p1")),
                ("p2", batch_descriptor("svc-p2")),
            ],
            vec![
                Err(DriverError::Transient("quota exceeded".into())),
                Err(DriverError::Transient("network unreachable".into())),
            ],
            quick_config(),
        );

        let err = h.engine.run_deploy("d-1", no_cancel()).await.unwrap_err();
        match err {
            EngineError::ProvidersExhausted(report) => {
                assert!(report.contains("quota exceeded"));
                assert!(report.contains("network unreachable"));
            }
            other => panic!("unexpected error: {other}"),
        }
        let record = h.store.load_deployment("d-1").unwrap();
        assert_eq!(record.status, DeploymentStatus::DeployFailed);
    }

    #[tokio::test]
    async fn zero_candidates_is_no_compatible_provider() {
        let h = harness(vec![], vec![], vec![], quick_config());

        let err = h.engine.run_deploy("d-1", no_cancel()).await.unwrap_err();
        assert!(matches!(err, EngineError::NoCompatibleProvider));

        let record = h.store.load_deployment("d-1").unwrap();
        assert_eq!(record.status, DeploymentStatus::DeployFailed);
        assert_eq!(
            record.status_reason.as_deref(),
            Some("no compatible provider found")
        );
    }

    #[tokio::test]
    async fn broken_catalog_entry_advances_to_next_candidate() {
        // p1 has no compute service registered at all; p2 works.
        let h = harness(
            vec![
                RankedCandidate::new("p1", 1, true),
                RankedCandidate::new("p2", 2, true),
            ],
            vec![("p2", batch_descriptor("svc-p2"))],
            vec![Ok(())],
            quick_config(),
        );

        h.engine.run_deploy("d-1", no_cancel()).await.unwrap();

        let record = h.store.load_deployment("d-1").unwrap();
        assert_eq!(record.provider_name.as_deref(), Some("p2"));
        assert_eq!(h.driver.deploy_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn retry_cap_limits_attempts() {
        let mut config = quick_config();
        config.max_provider_retries = Some(1);
        let h = harness(
            vec![
                RankedCandidate::new("p1", 1, true),
                RankedCandidate::new("p2", 2, true),
            ],
            vec![
                ("p1", batch_descriptor("svc-p1")),
                ("p2", batch_descriptor("svc-p2")),
            ],
            vec![Err(DriverError::Transient("quota exceeded".into()))],
            config,
        );

        let err = h.engine.run_deploy("d-1", no_cancel()).await.unwrap_err();
        assert!(matches!(err, EngineError::ProvidersExhausted(_)));
        assert_eq!(h.driver.deploy_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn timeout_invokes_provider_timeout_then_advances() {
        let mut config = quick_config();
        config.deploy_timeout_secs = 0;
        let store = StateStore::open_in_memory().unwrap();
        store
            .put_deployment(&DeploymentRecord::new("d-1", BATCH_TEMPLATE))
            .unwrap();
        let mut driver = ScriptedDriver::new(&store, vec![Ok(()), Ok(())]);
        driver.poll_forever = true;
        let driver = Arc::new(driver);
        let registry = Arc::new(DriverRegistry::new(vec![driver.clone()]).unwrap());
        let engine = Orchestrator::new(
            store.clone(),
            registry,
            Arc::new(FixedRanker(vec![
                RankedCandidate::new("p1", 1, true),
                RankedCandidate::new("p2", 2, true),
            ])),
            Arc::new(MapCatalog(
                [
                    ("p1".to_string(), batch_descriptor("svc-p1")),
                    ("p2".to_string(), batch_descriptor("svc-p2")),
                ]
                .into_iter()
                .collect(),
            )),
            Arc::new(crate::callback::NoopCallback),
            config,
        );

        let err = engine.run_deploy("d-1", no_cancel()).await.unwrap_err();
        // Both candidates timed out; diagnostics were captured each time.
        assert!(matches!(err, EngineError::ProvidersExhausted(_)));
        assert_eq!(driver.timeout_calls.load(Ordering::SeqCst), 2);
        assert_eq!(driver.finalize_failure.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn cancellation_exits_the_poll_loop() {
        let store = StateStore::open_in_memory().unwrap();
        store
            .put_deployment(&DeploymentRecord::new("d-1", BATCH_TEMPLATE))
            .unwrap();
        let mut driver = ScriptedDriver::new(&store, vec![Ok(())]);
        driver.poll_forever = true;
        let driver = Arc::new(driver);
        let registry = Arc::new(DriverRegistry::new(vec![driver.clone()]).unwrap());
        let mut config = quick_config();
        config.poll_interval_secs = 1;
        let engine = Arc::new(Orchestrator::new(
            store.clone(),
            registry,
            Arc::new(FixedRanker(vec![RankedCandidate::new("p1", 1, true)])),
            Arc::new(MapCatalog(
                [("p1".to_string(), batch_descriptor("svc-p1"))]
                    .into_iter()
                    .collect(),
            )),
            Arc::new(crate::callback::NoopCallback),
            config,
        ));

        let (cancel_tx, cancel_rx) = watch::channel(false);
        let task = {
            let engine = engine.clone();
            tokio::spawn(async move { engine.run_deploy("d-1", cancel_rx).await })
        };
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        cancel_tx.send(true).unwrap();

        let result = tokio::time::timeout(std::time::Duration::from_secs(5), task)
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(result, Err(EngineError::Cancelled)));
    }

    #[tokio::test]
    async fn undeploy_without_provider_removes_the_record() {
        let h = harness(vec![], vec![], vec![], quick_config());

        h.engine.run_undeploy("d-1", no_cancel()).await.unwrap();
        assert!(h.store.get_deployment("d-1").unwrap().is_none());
    }

    #[tokio::test]
    async fn undeploy_reuses_the_chosen_provider() {
        let h = harness(
            vec![RankedCandidate::new("p1", 1, true)],
            vec![("p1", batch_descriptor("svc-p1"))],
            vec![Ok(())],
            quick_config(),
        );
        h.engine.run_deploy("d-1", no_cancel()).await.unwrap();

        h.engine.run_undeploy("d-1", no_cancel()).await.unwrap();
        let record = h.store.load_deployment("d-1").unwrap();
        assert_eq!(record.status, DeploymentStatus::Undeployed);
    }

    #[tokio::test]
    async fn end_to_end_with_the_batch_driver() {
        use stratus_providers::batch::{
            BatchClient, BatchSchedulerDriver, JobSpec, JobStatus,
        };
        use stratus_providers::client::{PlatformError, StaticToken};

        // Jobs report success as soon as they are created.
        #[derive(Default)]
        struct InstantBatch {
            jobs: Mutex<HashMap<String, JobStatus>>,
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

        let store = StateStore::open_in_memory().unwrap();
        store
            .put_deployment(&DeploymentRecord::new("d-1", BATCH_TEMPLATE))
            .unwrap();
        let driver = Arc::new(BatchSchedulerDriver::new(
            store.clone(),
            Arc::new(InstantBatch::default()),
            Arc::new(StaticToken::default()),
        ));
        let registry = Arc::new(DriverRegistry::new(vec![driver]).unwrap());

        // The incompatible candidate ranks better and must still lose.
        let engine = Orchestrator::new(
            store.clone(),
            registry,
            Arc::new(FixedRanker(vec![
                RankedCandidate::new("batch-site", 100, true),
                RankedCandidate::new("container-site", 50, true),
            ])),
            Arc::new(MapCatalog(
                [
                    ("batch-site".to_string(), batch_descriptor("svc-batch")),
                    (
                        "container-site".to_string(),
                        ServiceDescriptor {
                            id: "svc-cont".to_string(),
                            service_type: "eu.mesos.marathon".to_string(),
                            endpoint: "http://containers.example.org".to_string(),
                            infra_endpoint: None,
                            region: None,
                        },
                    ),
                ]
                .into_iter()
                .collect(),
            )),
            Arc::new(crate::callback::NoopCallback),
            quick_config(),
        );

        engine.run_deploy("d-1", no_cancel()).await.unwrap();

        let record = store.load_deployment("d-1").unwrap();
        assert_eq!(record.status, DeploymentStatus::Deployed);
        assert_eq!(record.provider_name.as_deref(), Some("batch-site"));
        let resources = store.resources_for_deployment("d-1").unwrap();
        assert_eq!(resources.len(), 1);
        assert_eq!(resources[0].state, stratus_state::ResourceState::Started);
    }
}
