//! REST implementations of the platform client contracts.
//!
//! All four platforms speak JSON over HTTP; the shared `RestTransport`
//! handles request building, timeouts and the status-code → error-kind
//! mapping, and each client adds its platform's resource paths on top.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use serde_json::{json, Value};
use tracing::debug;

use stratus_core::CloudEndpoint;

use crate::batch::{BatchClient, JobSpec, JobStatus};
use crate::client::{PlatformError, PlatformErrorKind};
use crate::container::{ContainerClient, GroupSpec, GroupStatus};
use crate::infra::{InfraManagerClient, InfraState};
use crate::jobs::{JobClient, JobInfo, JobRequest};

/// Routing header used by the broker to address a specific site service.
const TARGET_SERVICE_HEADER: &str = "x-target-service";

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Shared HTTP/JSON transport for the platform clients.
#[derive(Clone)]
pub struct RestTransport {
    client: Client<HttpConnector, Full<Bytes>>,
    timeout: Duration,
}

impl Default for RestTransport {
    fn default() -> Self {
        Self::new(DEFAULT_TIMEOUT)
    }
}

impl RestTransport {
    pub fn new(timeout: Duration) -> Self {
        let client = Client::builder(TokioExecutor::new()).build_http();
        Self { client, timeout }
    }

    /// Send a request and return the decoded JSON body.
    ///
    /// Non-success statuses map onto [`PlatformErrorKind`]: 401 →
    /// Unauthorized, 404 → NotFound, other 4xx → BadRequest, the rest
    /// (including connection failures and timeouts) → Unavailable.
    pub async fn request(
        &self,
        method: http::Method,
        url: &str,
        token: &str,
        header_id: Option<&str>,
        body: Option<&Value>,
    ) -> Result<Value, PlatformError> {
        let mut builder = http::Request::builder()
            .method(method.clone())
            .uri(url)
            .header("accept", "application/json");
        if !token.is_empty() {
            builder = builder.header("authorization", format!("Bearer {token}"));
        }
        if let Some(id) = header_id {
            builder = builder.header(TARGET_SERVICE_HEADER, id);
        }
        let payload = match body {
            Some(value) => {
                builder = builder.header("content-type", "application/json");
                serde_json::to_vec(value)
                    .map_err(|e| PlatformError::new(PlatformErrorKind::Other, e.to_string()))?
            }
            None => Vec::new(),
        };
        let request = builder
            .body(Full::new(Bytes::from(payload)))
            .map_err(|e| PlatformError::bad_request(format!("invalid request for {url}: {e}")))?;

        let response = tokio::time::timeout(self.timeout, self.client.request(request))
            .await
            .map_err(|_| PlatformError::unavailable(format!("request to {url} timed out")))?
            .map_err(|e| PlatformError::unavailable(format!("request to {url} failed: {e}")))?;

        let status = response.status();
        let bytes = response
            .into_body()
            .collect()
            .await
            .map_err(|e| {
                PlatformError::unavailable(format!("failed reading response from {url}: {e}"))
            })?
            .to_bytes();
        let value = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap_or(Value::Null)
        };
        debug!(%method, url, status = status.as_u16(), "platform request");
        classify(status, value)
    }
}

fn classify(status: http::StatusCode, value: Value) -> Result<Value, PlatformError> {
    if status.is_success() {
        return Ok(value);
    }
    let message = value
        .get("message")
        .and_then(Value::as_str)
        .map(str::to_string)
        .unwrap_or_else(|| format!("http status {status}"));
    let kind = match status {
        http::StatusCode::UNAUTHORIZED => PlatformErrorKind::Unauthorized,
        http::StatusCode::NOT_FOUND => PlatformErrorKind::NotFound,
        s if s.is_client_error() => PlatformErrorKind::BadRequest,
        _ => PlatformErrorKind::Unavailable,
    };
    Err(PlatformError::new(kind, message))
}

fn base_url(raw: &str) -> String {
    raw.trim_end_matches('/').to_string()
}

fn decode<T: serde::de::DeserializeOwned>(value: Value, what: &str) -> Result<T, PlatformError> {
    serde_json::from_value(value).map_err(|e| {
        PlatformError::new(
            PlatformErrorKind::Other,
            format!("malformed {what} in platform response: {e}"),
        )
    })
}

/// Treat NotFound as an absent object instead of an error.
fn optional<T>(result: Result<T, PlatformError>) -> Result<Option<T>, PlatformError> {
    match result {
        Ok(value) => Ok(Some(value)),
        Err(err) if err.is_not_found() => Ok(None),
        Err(err) => Err(err),
    }
}

// ── Infrastructure manager ─────────────────────────────────────────

/// REST client for infrastructure managers. Requests go to the site's
/// own manager when the endpoint carries one, otherwise to the
/// PaaS-level broker with the routing header set.
pub struct RestInfraManagerClient {
    transport: RestTransport,
    broker_url: String,
}

impl RestInfraManagerClient {
    pub fn new(transport: RestTransport, broker_url: impl Into<String>) -> Self {
        Self {
            transport,
            broker_url: base_url(&broker_url.into()),
        }
    }

    fn resolve<'a>(&'a self, endpoint: &'a CloudEndpoint) -> (String, Option<&'a str>) {
        match &endpoint.infra_endpoint {
            Some(site_manager) => (base_url(site_manager), None),
            None => (self.broker_url.clone(), endpoint.header_id.as_deref()),
        }
    }
}

#[async_trait]
impl InfraManagerClient for RestInfraManagerClient {
    async fn create_infrastructure(
        &self,
        endpoint: &CloudEndpoint,
        token: &str,
        document: &str,
    ) -> Result<String, PlatformError> {
        let (base, header) = self.resolve(endpoint);
        let value = self
            .transport
            .request(
                http::Method::POST,
                &format!("{base}/infrastructures"),
                token,
                header,
                Some(&json!({ "document": document })),
            )
            .await?;
        value
            .get("id")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| {
                PlatformError::new(
                    PlatformErrorKind::Other,
                    "missing infrastructure id in platform response",
                )
            })
    }

    async fn get_state(
        &self,
        endpoint: &CloudEndpoint,
        token: &str,
        infrastructure_id: &str,
    ) -> Result<InfraState, PlatformError> {
        let (base, header) = self.resolve(endpoint);
        let value = self
            .transport
            .request(
                http::Method::GET,
                &format!("{base}/infrastructures/{infrastructure_id}/state"),
                token,
                header,
                None,
            )
            .await?;
        decode(value, "infrastructure state")
    }

    async fn get_outputs(
        &self,
        endpoint: &CloudEndpoint,
        token: &str,
        infrastructure_id: &str,
    ) -> Result<BTreeMap<String, Value>, PlatformError> {
        let (base, header) = self.resolve(endpoint);
        let value = self
            .transport
            .request(
                http::Method::GET,
                &format!("{base}/infrastructures/{infrastructure_id}/outputs"),
                token,
                header,
                None,
            )
            .await?;
        decode(
            value.get("outputs").cloned().unwrap_or(Value::Null),
            "infrastructure outputs",
        )
    }

    async fn get_log(
        &self,
        endpoint: &CloudEndpoint,
        token: &str,
        infrastructure_id: &str,
    ) -> Result<Option<String>, PlatformError> {
        let (base, header) = self.resolve(endpoint);
        let value = self
            .transport
            .request(
                http::Method::GET,
                &format!("{base}/infrastructures/{infrastructure_id}/log"),
                token,
                header,
                None,
            )
            .await?;
        Ok(value
            .get("log")
            .and_then(Value::as_str)
            .map(str::to_string))
    }

    async fn delete_infrastructure(
        &self,
        endpoint: &CloudEndpoint,
        token: &str,
        infrastructure_id: &str,
    ) -> Result<(), PlatformError> {
        let (base, header) = self.resolve(endpoint);
        self.transport
            .request(
                http::Method::DELETE,
                &format!("{base}/infrastructures/{infrastructure_id}"),
                token,
                header,
                None,
            )
            .await?;
        Ok(())
    }
}

// ── Batch scheduler ────────────────────────────────────────────────

/// REST client for batch schedulers.
#[derive(Default)]
pub struct RestBatchClient {
    transport: RestTransport,
}

impl RestBatchClient {
    pub fn new(transport: RestTransport) -> Self {
        Self { transport }
    }
}

#[async_trait]
impl BatchClient for RestBatchClient {
    async fn create_job(
        &self,
        endpoint: &CloudEndpoint,
        token: &str,
        job: &JobSpec,
    ) -> Result<(), PlatformError> {
        let base = base_url(&endpoint.compute_endpoint);
        let body = serde_json::to_value(job)
            .map_err(|e| PlatformError::new(PlatformErrorKind::Other, e.to_string()))?;
        self.transport
            .request(
                http::Method::POST,
                &format!("{base}/v1/jobs"),
                token,
                None,
                Some(&body),
            )
            .await?;
        Ok(())
    }

    async fn create_dependent_job(
        &self,
        endpoint: &CloudEndpoint,
        token: &str,
        job: &JobSpec,
    ) -> Result<(), PlatformError> {
        let base = base_url(&endpoint.compute_endpoint);
        let body = serde_json::to_value(job)
            .map_err(|e| PlatformError::new(PlatformErrorKind::Other, e.to_string()))?;
        self.transport
            .request(
                http::Method::POST,
                &format!("{base}/v1/jobs/dependent"),
                token,
                None,
                Some(&body),
            )
            .await?;
        Ok(())
    }

    async fn get_job(
        &self,
        endpoint: &CloudEndpoint,
        token: &str,
        name: &str,
    ) -> Result<Option<JobStatus>, PlatformError> {
        let base = base_url(&endpoint.compute_endpoint);
        let result = self
            .transport
            .request(
                http::Method::GET,
                &format!("{base}/v1/jobs/{name}"),
                token,
                None,
                None,
            )
            .await
            .and_then(|value| decode(value, "job status"));
        optional(result)
    }

    async fn delete_job(
        &self,
        endpoint: &CloudEndpoint,
        token: &str,
        name: &str,
    ) -> Result<(), PlatformError> {
        let base = base_url(&endpoint.compute_endpoint);
        self.transport
            .request(
                http::Method::DELETE,
                &format!("{base}/v1/jobs/{name}"),
                token,
                None,
                None,
            )
            .await?;
        Ok(())
    }
}

// ── Container orchestrator ─────────────────────────────────────────

/// REST client for container orchestrators.
#[derive(Default)]
pub struct RestContainerClient {
    transport: RestTransport,
}

impl RestContainerClient {
    pub fn new(transport: RestTransport) -> Self {
        Self { transport }
    }
}

#[async_trait]
impl ContainerClient for RestContainerClient {
    async fn create_group(
        &self,
        endpoint: &CloudEndpoint,
        token: &str,
        group: &GroupSpec,
    ) -> Result<(), PlatformError> {
        let base = base_url(&endpoint.compute_endpoint);
        let body = serde_json::to_value(group)
            .map_err(|e| PlatformError::new(PlatformErrorKind::Other, e.to_string()))?;
        self.transport
            .request(
                http::Method::POST,
                &format!("{base}/v2/groups"),
                token,
                None,
                Some(&body),
            )
            .await?;
        Ok(())
    }

    async fn get_group(
        &self,
        endpoint: &CloudEndpoint,
        token: &str,
        group_id: &str,
    ) -> Result<Option<GroupStatus>, PlatformError> {
        let base = base_url(&endpoint.compute_endpoint);
        let result = self
            .transport
            .request(
                http::Method::GET,
                &format!("{base}/v2/groups/{group_id}"),
                token,
                None,
                None,
            )
            .await
            .and_then(|value| decode(value, "group status"));
        optional(result)
    }

    async fn delete_group(
        &self,
        endpoint: &CloudEndpoint,
        token: &str,
        group_id: &str,
        force: bool,
    ) -> Result<(), PlatformError> {
        let base = base_url(&endpoint.compute_endpoint);
        self.transport
            .request(
                http::Method::DELETE,
                &format!("{base}/v2/groups/{group_id}?force={force}"),
                token,
                None,
                None,
            )
            .await?;
        Ok(())
    }
}

// ── Job scheduler ──────────────────────────────────────────────────

/// REST client for job schedulers.
#[derive(Default)]
pub struct RestJobClient {
    transport: RestTransport,
}

impl RestJobClient {
    pub fn new(transport: RestTransport) -> Self {
        Self { transport }
    }
}

#[async_trait]
impl JobClient for RestJobClient {
    async fn submit_job(
        &self,
        endpoint: &CloudEndpoint,
        token: &str,
        job: &JobRequest,
    ) -> Result<String, PlatformError> {
        let base = base_url(&endpoint.compute_endpoint);
        let body = serde_json::to_value(job)
            .map_err(|e| PlatformError::new(PlatformErrorKind::Other, e.to_string()))?;
        let value = self
            .transport
            .request(
                http::Method::POST,
                &format!("{base}/jobs"),
                token,
                None,
                Some(&body),
            )
            .await?;
        value
            .get("id")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| {
                PlatformError::new(
                    PlatformErrorKind::Other,
                    "missing job id in platform response",
                )
            })
    }

    async fn get_job(
        &self,
        endpoint: &CloudEndpoint,
        token: &str,
        job_id: &str,
    ) -> Result<Option<JobInfo>, PlatformError> {
        let base = base_url(&endpoint.compute_endpoint);
        let result = self
            .transport
            .request(
                http::Method::GET,
                &format!("{base}/jobs/{job_id}"),
                token,
                None,
                None,
            )
            .await
            .and_then(|value| decode(value, "job info"));
        optional(result)
    }

    async fn delete_job(
        &self,
        endpoint: &CloudEndpoint,
        token: &str,
        job_id: &str,
    ) -> Result<(), PlatformError> {
        let base = base_url(&endpoint.compute_endpoint);
        self.transport
            .request(
                http::Method::DELETE,
                &format!("{base}/jobs/{job_id}"),
                token,
                None,
                None,
            )
            .await?;
        Ok(())
    }
}
