//! stratus-engine — the deployment control loop.
//!
//! For each deployment the engine derives the required infrastructure
//! kind once, walks the ranked candidate providers in order, resolves
//! the matching driver and drives it through deploy → poll → finalize
//! (and undeploy → poll → finalize), deciding after every failure
//! whether to advance to the next candidate or fail for good.
//!
//! # Architecture
//!
//! ```text
//! Supervisor (one background task per deployment id)
//!   └── Orchestrator
//!       ├── ProviderRanker (remote ranking, one batch call)
//!       ├── ProviderCatalog (compute-service descriptors)
//!       ├── CandidateSelector (ordered, compatibility-filtered)
//!       ├── DriverRegistry → DeploymentDriver (per provider kind)
//!       ├── StateStore (single source of truth for status)
//!       └── CallbackSink (terminal-status notifications)
//! ```

pub mod callback;
pub mod engine;
pub mod error;
pub mod ranker;
pub mod supervisor;

pub use callback::{CallbackSink, HttpCallback, NoopCallback};
pub use engine::Orchestrator;
pub use error::EngineError;
pub use ranker::{ProviderRanker, RankingRequest};
pub use supervisor::Supervisor;
