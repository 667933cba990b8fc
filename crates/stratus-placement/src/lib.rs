//! stratus-placement — choosing where a deployment runs.
//!
//! Given the ranked candidate providers returned by the external ranker
//! and the compute-service descriptors from the provider catalog, this
//! crate produces the ordered, compatibility-filtered sequence of
//! `(provider, endpoint)` pairs the engine tries one by one.
//!
//! # Components
//!
//! - **`ranking`** — ordered-eligible iteration over ranked candidates
//! - **`matcher`** — infrastructure-kind compatibility and service-type
//!   classification
//! - **`catalog`** — provider catalog collaborator contract
//! - **`selector`** — the single-pass candidate selector with lazy
//!   endpoint validation

pub mod catalog;
pub mod error;
pub mod matcher;
pub mod ranking;
pub mod selector;

pub use catalog::{ProviderCatalog, ServiceDescriptor};
pub use error::SelectionError;
pub use matcher::{classify_service_type, derive_requirement, is_compatible};
pub use ranking::{ProviderRanking, RankedCandidate};
pub use selector::CandidateSelector;
