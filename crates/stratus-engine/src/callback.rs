//! Terminal-status callbacks.
//!
//! When a deployment carries a callback URL, the engine POSTs a status
//! summary there every time a terminal state is reached. Delivery is
//! best-effort: failures are logged and never affect the deployment.

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use http_body_util::Full;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use serde_json::json;
use tracing::{debug, warn};

use stratus_state::DeploymentRecord;

/// Receiver of terminal-status notifications.
#[async_trait]
pub trait CallbackSink: Send + Sync {
    async fn notify(&self, deployment: &DeploymentRecord);
}

/// Sink that drops every notification (no callback configured).
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopCallback;

#[async_trait]
impl CallbackSink for NoopCallback {
    async fn notify(&self, deployment: &DeploymentRecord) {
        debug!(deployment_id = %deployment.id, "no callback sink configured");
    }
}

/// HTTP POST callback sink.
pub struct HttpCallback {
    client: Client<HttpConnector, Full<Bytes>>,
    timeout: Duration,
}

impl Default for HttpCallback {
    fn default() -> Self {
        Self::new(Duration::from_secs(10))
    }
}

impl HttpCallback {
    pub fn new(timeout: Duration) -> Self {
        Self {
            client: Client::builder(TokioExecutor::new()).build_http(),
            timeout,
        }
    }
}

#[async_trait]
impl CallbackSink for HttpCallback {
    async fn notify(&self, deployment: &DeploymentRecord) {
        let Some(url) = deployment.callback_url.clone() else {
            return;
        };
        let payload = json!({
            "uuid": deployment.id,
            "status": deployment.status,
            "status_reason": deployment.status_reason,
            "provider": deployment.provider_name,
            "outputs": deployment.outputs,
        });
        let body = match serde_json::to_vec(&payload) {
            Ok(body) => body,
            Err(err) => {
                warn!(deployment_id = %deployment.id, error = %err, "callback payload failed to serialize");
                return;
            }
        };
        let request = http::Request::builder()
            .method("POST")
            .uri(&url)
            .header("content-type", "application/json")
            .body(Full::new(Bytes::from(body)));
        let request = match request {
            Ok(request) => request,
            Err(err) => {
                warn!(deployment_id = %deployment.id, %url, error = %err, "invalid callback request");
                return;
            }
        };

        match tokio::time::timeout(self.timeout, self.client.request(request)).await {
            Ok(Ok(response)) if response.status().is_success() => {
                debug!(deployment_id = %deployment.id, %url, "callback delivered");
            }
            Ok(Ok(response)) => {
                warn!(
                    deployment_id = %deployment.id,
                    %url,
                    status = response.status().as_u16(),
                    "callback rejected"
                );
            }
            Ok(Err(err)) => {
                warn!(deployment_id = %deployment.id, %url, error = %err, "callback delivery failed");
            }
            Err(_) => {
                warn!(deployment_id = %deployment.id, %url, "callback timed out");
            }
        }
    }
}
