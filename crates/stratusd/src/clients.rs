//! REST clients for the external ranker and catalog services.

use async_trait::async_trait;
use serde_json::{json, Value};

use stratus_engine::{EngineError, ProviderRanker, RankingRequest};
use stratus_placement::{ProviderCatalog, RankedCandidate, SelectionError, ServiceDescriptor};
use stratus_providers::http::RestTransport;

fn base_url(raw: &str) -> String {
    raw.trim_end_matches('/').to_string()
}

/// Client for the provider-ranking service.
pub struct RestRanker {
    transport: RestTransport,
    base: String,
    token: String,
}

impl RestRanker {
    pub fn new(transport: RestTransport, base: impl Into<String>, token: Option<String>) -> Self {
        Self {
            transport,
            base: base_url(&base.into()),
            token: token.unwrap_or_default(),
        }
    }
}

#[async_trait]
impl ProviderRanker for RestRanker {
    async fn ranking(
        &self,
        request: &RankingRequest,
    ) -> Result<Vec<RankedCandidate>, EngineError> {
        let body = json!({
            "deployment_id": request.deployment_id,
            "requirement": request.requirement,
        });
        let value = self
            .transport
            .request(
                http::Method::POST,
                &format!("{}/rank", self.base),
                &self.token,
                None,
                Some(&body),
            )
            .await
            .map_err(|err| EngineError::Ranker(err.to_string()))?;
        let candidates = value.get("candidates").cloned().unwrap_or(Value::Null);
        serde_json::from_value(candidates)
            .map_err(|err| EngineError::Ranker(format!("malformed ranking response: {err}")))
    }
}

/// Client for the provider catalog.
pub struct RestCatalog {
    transport: RestTransport,
    base: String,
    token: String,
}

impl RestCatalog {
    pub fn new(transport: RestTransport, base: impl Into<String>, token: Option<String>) -> Self {
        Self {
            transport,
            base: base_url(&base.into()),
            token: token.unwrap_or_default(),
        }
    }
}

#[async_trait]
impl ProviderCatalog for RestCatalog {
    async fn compute_service(
        &self,
        provider: &str,
    ) -> Result<Option<ServiceDescriptor>, SelectionError> {
        let result = self
            .transport
            .request(
                http::Method::GET,
                &format!("{}/providers/{provider}/compute-service", self.base),
                &self.token,
                None,
                None,
            )
            .await;
        match result {
            Ok(value) => serde_json::from_value(value)
                .map(Some)
                .map_err(|err| {
                    SelectionError::Catalog(format!("malformed catalog response: {err}"))
                }),
            Err(err) if err.is_not_found() => Ok(None),
            Err(err) => Err(SelectionError::Catalog(err.to_string())),
        }
    }
}
