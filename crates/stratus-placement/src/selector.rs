//! Candidate selector — the ordered attempt sequence for one deployment.
//!
//! Built once per deployment from the derived infrastructure requirement,
//! the ranking, and the prefetched compute-service descriptors.
//! Candidates whose descriptor classifies to an incompatible kind are
//! filtered out up front; candidates whose descriptor is missing or
//! unclassifiable stay in the sequence and fail when dereferenced, so a
//! bad catalog entry never blocks trying the next candidate.
//!
//! The sequence is single-pass: the engine consumes endpoints
//! destructively, with real network calls between steps.

use std::collections::HashMap;

use tracing::debug;

use stratus_core::{CloudEndpoint, InfraKind};

use crate::catalog::ServiceDescriptor;
use crate::error::SelectionError;
use crate::matcher::{classify_service_type, is_compatible};
use crate::ranking::ProviderRanking;

const REPORT_DELIMITER: &str = "\n----------------------------------------------------------------\n";

#[derive(Debug, Clone)]
struct Candidate {
    provider: String,
    descriptor: Option<ServiceDescriptor>,
    last_error_cause: Option<String>,
}

/// Ordered, finite, single-pass sequence of admissible providers.
#[derive(Debug)]
pub struct CandidateSelector {
    required: InfraKind,
    candidates: Vec<Candidate>,
    cursor: usize,
    current: Option<usize>,
}

impl CandidateSelector {
    /// Build the attempt sequence.
    ///
    /// `descriptors` maps provider name to its prefetched compute-service
    /// descriptor; providers absent from the map are kept and error at
    /// dereference time.
    pub fn build(
        required: InfraKind,
        ranking: &ProviderRanking,
        descriptors: &HashMap<String, ServiceDescriptor>,
        cap: Option<usize>,
    ) -> Self {
        let mut candidates = Vec::new();
        for ranked in ranking.ordered_eligible(None) {
            let descriptor = descriptors.get(&ranked.provider).cloned();
            if let Some(d) = &descriptor {
                if let Ok(offered) = classify_service_type(&d.service_type) {
                    if !is_compatible(required, offered) {
                        debug!(
                            provider = %ranked.provider,
                            %required,
                            %offered,
                            "candidate filtered: incompatible infrastructure kind"
                        );
                        continue;
                    }
                }
                // Unclassifiable types stay in; the error surfaces when
                // the candidate is dereferenced.
            }
            candidates.push(Candidate {
                provider: ranked.provider.clone(),
                descriptor,
                last_error_cause: None,
            });
        }
        if let Some(cap) = cap {
            candidates.truncate(cap);
        }
        debug!(
            %required,
            candidates = candidates.len(),
            "candidate selector built"
        );
        Self {
            required,
            candidates,
            cursor: 0,
            current: None,
        }
    }

    /// Number of candidates in the sequence, fixed at build time.
    pub fn size(&self) -> usize {
        self.candidates.len()
    }

    /// The infrastructure kind this sequence was built for.
    pub fn required(&self) -> InfraKind {
        self.required
    }

    /// Whether another candidate remains after the current one.
    pub fn has_next(&self) -> bool {
        self.cursor < self.candidates.len()
    }

    /// Advance to the next candidate and resolve its endpoint.
    ///
    /// Resolution errors (no compute service, unknown type) are yielded
    /// per candidate rather than ending the sequence, so the caller can
    /// record the cause and keep going.
    pub fn next(&mut self) -> Option<Result<(String, CloudEndpoint), SelectionError>> {
        if self.cursor >= self.candidates.len() {
            return None;
        }
        let index = self.cursor;
        self.cursor += 1;
        self.current = Some(index);

        let candidate = &self.candidates[index];
        let provider = candidate.provider.clone();
        let resolved = resolve_endpoint(&provider, candidate.descriptor.as_ref());
        Some(resolved.map(|endpoint| (provider, endpoint)))
    }

    /// Record why the current candidate failed; shows up in the
    /// exhaustion report.
    pub fn record_failure(&mut self, cause: impl Into<String>) {
        if let Some(index) = self.current {
            self.candidates[index].last_error_cause = Some(cause.into());
        }
    }

    /// Aggregated failure causes of every tried candidate, in order.
    pub fn exhausted_report(&self) -> String {
        let causes: Vec<String> = self
            .candidates
            .iter()
            .take(self.cursor)
            .map(|c| {
                format!(
                    "Cloud provider <{}>\n{}",
                    c.provider,
                    c.last_error_cause.as_deref().unwrap_or("no cause recorded")
                )
            })
            .collect();
        format!(
            "retries on cloud providers exhausted, error list is:{}{}",
            REPORT_DELIMITER,
            causes.join(REPORT_DELIMITER)
        )
    }
}

fn resolve_endpoint(
    provider: &str,
    descriptor: Option<&ServiceDescriptor>,
) -> Result<CloudEndpoint, SelectionError> {
    let descriptor = descriptor
        .ok_or_else(|| SelectionError::NoComputeService(provider.to_string()))?;
    let offered = classify_service_type(&descriptor.service_type)?;

    // Sites without their own infrastructure manager are reached through
    // the broker, which routes on the service id.
    let brokered_vm = matches!(
        offered,
        InfraKind::VmBrokered
            | InfraKind::VmOpenStack
            | InfraKind::VmOpenNebula
            | InfraKind::VmOnedock
    ) && descriptor.infra_endpoint.is_none();

    Ok(CloudEndpoint {
        compute_endpoint: descriptor.endpoint.clone(),
        infra_endpoint: descriptor.infra_endpoint.clone(),
        iaas_kind: offered,
        header_id: brokered_vm.then(|| descriptor.id.clone()),
    })
}
