//! stratus-state — embedded state store for the Stratus orchestrator.
//!
//! Backed by [redb](https://docs.rs/redb), this crate is the single
//! source of truth for deployment status. Every mutation is one
//! atomically-committed transaction, so concurrent readers (the API
//! layer, the engine's poll loops) never observe a torn intermediate
//! state.
//!
//! All domain types are JSON-serialized into redb's `&[u8]` value
//! columns. Resources use composite `{deployment_id}:{resource_id}` keys
//! so the records of one deployment can be scanned by prefix.
//!
//! The `StateStore` is `Clone` + `Send` + `Sync` (backed by
//! `Arc<Database>`) and is shared across the per-deployment tasks.

pub mod error;
pub mod store;
pub mod tables;
pub mod types;

pub use error::{StateError, StateResult};
pub use store::StateStore;
pub use types::*;
