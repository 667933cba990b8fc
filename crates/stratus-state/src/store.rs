//! StateStore — redb-backed persistence for deployments and resources.
//!
//! Provides typed CRUD plus atomic read-modify-write helpers. The
//! update helpers run the whole read-mutate-insert cycle inside a single
//! write transaction, which is what keeps driver mutations from ever
//! being observed half-applied.

use std::path::Path;
use std::sync::Arc;

use redb::{Database, ReadableDatabase, ReadableTable};
use tracing::debug;

use crate::error::{StateError, StateResult};
use crate::tables::*;
use crate::types::*;

/// Convert any `Display` error into a `StateError` variant via a closure factory.
macro_rules! map_err {
    ($variant:ident) => {
        |e| StateError::$variant(e.to_string())
    };
}

/// Thread-safe state store backed by redb.
#[derive(Clone)]
pub struct StateStore {
    db: Arc<Database>,
}

impl StateStore {
    /// Open (or create) a persistent state store at the given path.
    pub fn open(path: &Path) -> StateResult<Self> {
        let db = Database::create(path).map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!(?path, "state store opened");
        Ok(store)
    }

    /// Create an ephemeral in-memory state store (for testing).
    pub fn open_in_memory() -> StateResult<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder()
            .create_with_backend(backend)
            .map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!("in-memory state store opened");
        Ok(store)
    }

    /// Create all tables if they don't exist yet.
    fn ensure_tables(&self) -> StateResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        // Opening a table in a write transaction creates it if absent.
        txn.open_table(DEPLOYMENTS).map_err(map_err!(Table))?;
        txn.open_table(RESOURCES).map_err(map_err!(Table))?;
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    // ── Deployments ────────────────────────────────────────────────

    /// Insert or update a deployment record.
    pub fn put_deployment(&self, record: &DeploymentRecord) -> StateResult<()> {
        let value = serde_json::to_vec(record).map_err(map_err!(Serialize))?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(DEPLOYMENTS).map_err(map_err!(Table))?;
            table
                .insert(record.id.as_str(), value.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(deployment_id = %record.id, status = ?record.status, "deployment stored");
        Ok(())
    }

    /// Get a deployment by id.
    pub fn get_deployment(&self, id: &str) -> StateResult<Option<DeploymentRecord>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(DEPLOYMENTS).map_err(map_err!(Table))?;
        match table.get(id).map_err(map_err!(Read))? {
            Some(guard) => {
                let record: DeploymentRecord =
                    serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?;
                Ok(Some(record))
            }
            None => Ok(None),
        }
    }

    /// Get a deployment by id, erroring when it does not exist.
    pub fn load_deployment(&self, id: &str) -> StateResult<DeploymentRecord> {
        self.get_deployment(id)?
            .ok_or_else(|| StateError::NotFound(format!("deployment {id}")))
    }

    /// List all deployments.
    pub fn list_deployments(&self) -> StateResult<Vec<DeploymentRecord>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(DEPLOYMENTS).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in table.iter().map_err(map_err!(Read))? {
            let (_, value) = entry.map_err(map_err!(Read))?;
            let record: DeploymentRecord =
                serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
            results.push(record);
        }
        Ok(results)
    }

    /// Atomically read, mutate and write back a deployment record.
    ///
    /// The whole cycle runs inside one write transaction; concurrent
    /// readers see either the old or the new record, never a mix.
    pub fn update_deployment<F>(&self, id: &str, mutate: F) -> StateResult<DeploymentRecord>
    where
        F: FnOnce(&mut DeploymentRecord),
    {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let record = {
            let mut table = txn.open_table(DEPLOYMENTS).map_err(map_err!(Table))?;
            let bytes = {
                match table.get(id).map_err(map_err!(Read))? {
                    Some(guard) => guard.value().to_vec(),
                    None => return Err(StateError::NotFound(format!("deployment {id}"))),
                }
            };
            let mut record: DeploymentRecord =
                serde_json::from_slice(&bytes).map_err(map_err!(Deserialize))?;
            mutate(&mut record);
            record.updated_at = epoch_secs();
            let value = serde_json::to_vec(&record).map_err(map_err!(Serialize))?;
            table
                .insert(id, value.as_slice())
                .map_err(map_err!(Write))?;
            record
        };
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(record)
    }

    /// Delete a deployment and all of its resources. Returns true if the
    /// deployment existed.
    pub fn delete_deployment(&self, id: &str) -> StateResult<bool> {
        let resource_keys = self.resource_keys_for(id)?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let existed;
        {
            let mut table = txn.open_table(DEPLOYMENTS).map_err(map_err!(Table))?;
            existed = table.remove(id).map_err(map_err!(Write))?.is_some();
            let mut resources = txn.open_table(RESOURCES).map_err(map_err!(Table))?;
            for key in &resource_keys {
                resources.remove(key.as_str()).map_err(map_err!(Write))?;
            }
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(deployment_id = %id, existed, "deployment deleted");
        Ok(existed)
    }

    // ── Resources ──────────────────────────────────────────────────

    /// Insert or update a resource record.
    pub fn put_resource(&self, resource: &ResourceRecord) -> StateResult<()> {
        let key = resource.table_key();
        let value = serde_json::to_vec(resource).map_err(map_err!(Serialize))?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(RESOURCES).map_err(map_err!(Table))?;
            table
                .insert(key.as_str(), value.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    /// List all resources for a given deployment, in key order.
    pub fn resources_for_deployment(
        &self,
        deployment_id: &str,
    ) -> StateResult<Vec<ResourceRecord>> {
        let prefix = format!("{deployment_id}:");
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(RESOURCES).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in table.iter().map_err(map_err!(Read))? {
            let (key, value) = entry.map_err(map_err!(Read))?;
            if key.value().starts_with(&prefix) {
                let resource: ResourceRecord =
                    serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
                results.push(resource);
            }
        }
        Ok(results)
    }

    /// Atomically mutate every resource of a deployment attached to the
    /// given node name (all instances of one template node).
    pub fn update_resources_for_node<F>(
        &self,
        deployment_id: &str,
        node_name: &str,
        mutate: F,
    ) -> StateResult<u32>
    where
        F: Fn(&mut ResourceRecord),
    {
        let prefix = format!("{deployment_id}:");
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let mut updated = 0;
        {
            let mut table = txn.open_table(RESOURCES).map_err(map_err!(Table))?;
            let mut changed: Vec<(String, Vec<u8>)> = Vec::new();
            for entry in table.iter().map_err(map_err!(Read))? {
                let (key, value) = entry.map_err(map_err!(Read))?;
                if !key.value().starts_with(&prefix) {
                    continue;
                }
                let mut resource: ResourceRecord =
                    serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
                if resource.node_name != node_name {
                    continue;
                }
                mutate(&mut resource);
                let bytes = serde_json::to_vec(&resource).map_err(map_err!(Serialize))?;
                changed.push((key.value().to_string(), bytes));
            }
            for (key, bytes) in changed {
                table
                    .insert(key.as_str(), bytes.as_slice())
                    .map_err(map_err!(Write))?;
                updated += 1;
            }
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(updated)
    }

    /// Atomically mutate every resource of a deployment.
    pub fn update_all_resources<F>(&self, deployment_id: &str, mutate: F) -> StateResult<u32>
    where
        F: Fn(&mut ResourceRecord),
    {
        let prefix = format!("{deployment_id}:");
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let mut updated = 0;
        {
            let mut table = txn.open_table(RESOURCES).map_err(map_err!(Table))?;
            let mut changed: Vec<(String, Vec<u8>)> = Vec::new();
            for entry in table.iter().map_err(map_err!(Read))? {
                let (key, value) = entry.map_err(map_err!(Read))?;
                if !key.value().starts_with(&prefix) {
                    continue;
                }
                let mut resource: ResourceRecord =
                    serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
                mutate(&mut resource);
                let bytes = serde_json::to_vec(&resource).map_err(map_err!(Serialize))?;
                changed.push((key.value().to_string(), bytes));
            }
            for (key, bytes) in changed {
                table
                    .insert(key.as_str(), bytes.as_slice())
                    .map_err(map_err!(Write))?;
                updated += 1;
            }
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(updated)
    }

    /// Delete all resources of a deployment. Returns number deleted.
    pub fn delete_resources_for_deployment(&self, deployment_id: &str) -> StateResult<u32> {
        let keys = self.resource_keys_for(deployment_id)?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let count = keys.len() as u32;
        {
            let mut table = txn.open_table(RESOURCES).map_err(map_err!(Table))?;
            for key in &keys {
                table.remove(key.as_str()).map_err(map_err!(Write))?;
            }
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(count)
    }

    fn resource_keys_for(&self, deployment_id: &str) -> StateResult<Vec<String>> {
        let prefix = format!("{deployment_id}:");
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(RESOURCES).map_err(map_err!(Table))?;
        Ok(table
            .iter()
            .map_err(map_err!(Read))?
            .filter_map(|entry| {
                let (key, _) = entry.ok()?;
                let k = key.value().to_string();
                k.starts_with(&prefix).then_some(k)
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> StateStore {
        StateStore::open_in_memory().unwrap()
    }

    fn resource(deployment_id: &str, id: &str, node: &str) -> ResourceRecord {
        ResourceRecord::new(id, deployment_id, node, "stratus.nodes.BatchJob")
    }

    #[test]
    fn deployment_roundtrip() {
        let store = store();
        let record = DeploymentRecord::new("d-1", r#"{"nodes":{}}"#);
        store.put_deployment(&record).unwrap();

        let loaded = store.get_deployment("d-1").unwrap().unwrap();
        assert_eq!(loaded.id, "d-1");
        assert_eq!(loaded.status, DeploymentStatus::NotStarted);
        assert!(store.get_deployment("missing").unwrap().is_none());
    }

    #[test]
    fn load_missing_deployment_errors() {
        let err = store().load_deployment("ghost").unwrap_err();
        assert!(matches!(err, StateError::NotFound(_)));
    }

    #[test]
    fn update_deployment_mutates_atomically() {
        let store = store();
        store
            .put_deployment(&DeploymentRecord::new("d-1", "{}"))
            .unwrap();

        let updated = store
            .update_deployment("d-1", |d| {
                d.status = DeploymentStatus::Deploying;
                d.task = TaskKind::Deploy;
            })
            .unwrap();
        assert_eq!(updated.status, DeploymentStatus::Deploying);

        let loaded = store.load_deployment("d-1").unwrap();
        assert_eq!(loaded.status, DeploymentStatus::Deploying);
        assert_eq!(loaded.task, TaskKind::Deploy);
    }

    #[test]
    fn update_missing_deployment_errors() {
        let err = store()
            .update_deployment("ghost", |_| {})
            .unwrap_err();
        assert!(matches!(err, StateError::NotFound(_)));
    }

    #[test]
    fn resources_scanned_by_deployment_prefix() {
        let store = store();
        store.put_resource(&resource("d-1", "r-1", "job1")).unwrap();
        store.put_resource(&resource("d-1", "r-2", "job2")).unwrap();
        store.put_resource(&resource("d-2", "r-1", "job1")).unwrap();

        let resources = store.resources_for_deployment("d-1").unwrap();
        assert_eq!(resources.len(), 2);
        assert!(resources.iter().all(|r| r.deployment_id == "d-1"));
    }

    #[test]
    fn update_resources_for_node_targets_one_node() {
        let store = store();
        store.put_resource(&resource("d-1", "r-1", "job1")).unwrap();
        store.put_resource(&resource("d-1", "r-2", "job1")).unwrap();
        store.put_resource(&resource("d-1", "r-3", "job2")).unwrap();

        let updated = store
            .update_resources_for_node("d-1", "job1", |r| r.state = ResourceState::Started)
            .unwrap();
        assert_eq!(updated, 2);

        let resources = store.resources_for_deployment("d-1").unwrap();
        for r in resources {
            if r.node_name == "job1" {
                assert_eq!(r.state, ResourceState::Started);
            } else {
                assert_eq!(r.state, ResourceState::Initial);
            }
        }
    }

    #[test]
    fn delete_deployment_cascades_to_resources() {
        let store = store();
        store
            .put_deployment(&DeploymentRecord::new("d-1", "{}"))
            .unwrap();
        store.put_resource(&resource("d-1", "r-1", "job1")).unwrap();

        assert!(store.delete_deployment("d-1").unwrap());
        assert!(store.get_deployment("d-1").unwrap().is_none());
        assert!(store.resources_for_deployment("d-1").unwrap().is_empty());
        assert!(!store.delete_deployment("d-1").unwrap());
    }

    #[test]
    fn persistent_store_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stratus.redb");
        {
            let store = StateStore::open(&path).unwrap();
            store
                .put_deployment(&DeploymentRecord::new("d-1", "{}"))
                .unwrap();
        }
        let store = StateStore::open(&path).unwrap();
        assert!(store.get_deployment("d-1").unwrap().is_some());
    }
}
