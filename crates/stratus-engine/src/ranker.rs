//! Provider ranker collaborator contract.
//!
//! The ranker is a remote service scoring candidate providers for one
//! deployment; the engine consumes its answer as a single batch result.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use stratus_core::InfraKind;
use stratus_placement::RankedCandidate;

use crate::error::EngineError;

/// One ranking request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RankingRequest {
    pub deployment_id: String,
    /// The infrastructure kind the deployment requires.
    pub requirement: InfraKind,
}

/// Remote provider-ranking service.
#[async_trait]
pub trait ProviderRanker: Send + Sync {
    async fn ranking(
        &self,
        request: &RankingRequest,
    ) -> Result<Vec<RankedCandidate>, EngineError>;
}
