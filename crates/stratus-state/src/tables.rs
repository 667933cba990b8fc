//! redb table definitions for the Stratus state store.
//!
//! Each table uses `&str` keys and `&[u8]` values (JSON-serialized
//! domain types).

use redb::TableDefinition;

/// Deployment records keyed by deployment id.
pub const DEPLOYMENTS: TableDefinition<&str, &[u8]> = TableDefinition::new("deployments");

/// Resource records keyed by `{deployment_id}:{resource_id}`.
pub const RESOURCES: TableDefinition<&str, &[u8]> = TableDefinition::new("resources");
