//! stratus-providers — the deployment drivers.
//!
//! A driver translates a generic deployment into one execution
//! platform's native submission and walks it through the shared state
//! machine: deploy → poll → finalize, undeploy → poll → finalize.
//!
//! # Components
//!
//! - **`driver`** — the `DeploymentDriver` contract and per-attempt context
//! - **`registry`** — fixed provider-kind → driver table built at startup
//! - **`units`** — topological work-unit builder shared by all drivers
//! - **`status`** — idempotent deployment/resource status transitions
//! - **`client`** — platform error model, token refresh, auth retry
//! - **`infra`** / **`batch`** / **`container`** / **`jobs`** — the four
//!   driver variants and their platform client contracts
//! - **`http`** — hyper-based REST implementations of the clients

pub mod batch;
pub mod client;
pub mod container;
pub mod driver;
pub mod error;
pub mod http;
pub mod infra;
pub mod jobs;
pub mod registry;
pub mod status;
pub mod units;

pub use client::{PlatformError, PlatformErrorKind, TokenSource};
pub use driver::{AttemptContext, CleanupMode, DeployProgress, DeploymentDriver};
pub use error::DriverError;
pub use registry::DriverRegistry;
pub use status::StatusWriter;
pub use units::WorkUnit;
