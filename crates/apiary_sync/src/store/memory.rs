//! In-memory store implementations, used by tests and single-process setups.

use super::{AtomStore, ConnectionStore};
use crate::error::{Result, SyncError};
use crate::protocol::{Atom, DeviceConnection, NamespaceConnection};
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard};

fn lock<'a, T>(mutex: &'a Mutex<T>, what: &str) -> Result<MutexGuard<'a, T>> {
    mutex
        .lock()
        .map_err(|_| SyncError::Store(format!("Failed to lock in-memory {} store", what)))
}

/// Atom store that keeps every namespace in RAM.
#[derive(Default)]
pub struct MemoryAtomStore {
    namespaces: Mutex<HashMap<String, BTreeMap<String, Atom>>>,
}

impl MemoryAtomStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl AtomStore for MemoryAtomStore {
    async fn save_atoms(&self, namespace: &str, atoms: &[Atom]) -> Result<()> {
        if atoms.is_empty() {
            return Ok(());
        }
        let mut namespaces = lock(&self.namespaces, "atom")?;
        let list = namespaces.entry(namespace.to_string()).or_default();
        for atom in atoms {
            list.entry(atom.hash.clone()).or_insert_with(|| atom.clone());
        }
        Ok(())
    }

    async fn load_atoms(&self, namespace: &str) -> Result<Vec<Atom>> {
        let namespaces = lock(&self.namespaces, "atom")?;
        let mut atoms: Vec<Atom> = namespaces
            .get(namespace)
            .map(|list| list.values().cloned().collect())
            .unwrap_or_default();
        atoms.sort_by_key(|a| a.id.timestamp);
        Ok(atoms)
    }

    async fn delete_atoms(&self, namespace: &str, hashes: &[String]) -> Result<()> {
        let mut namespaces = lock(&self.namespaces, "atom")?;
        if let Some(list) = namespaces.get_mut(namespace) {
            for hash in hashes {
                list.remove(hash);
            }
        }
        Ok(())
    }

    async fn clear_namespace(&self, namespace: &str) -> Result<()> {
        lock(&self.namespaces, "atom")?.remove(namespace);
        Ok(())
    }
}

#[derive(Default)]
struct ConnectionState {
    connections: HashMap<String, DeviceConnection>,
    /// Memberships per namespace, in insertion order.
    namespaces: HashMap<String, Vec<NamespaceConnection>>,
}

/// Connection store that keeps connections and memberships in RAM.
#[derive(Default)]
pub struct MemoryConnectionStore {
    state: Mutex<ConnectionState>,
}

impl MemoryConnectionStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ConnectionStore for MemoryConnectionStore {
    async fn save_connection(&self, connection: &DeviceConnection) -> Result<()> {
        lock(&self.state, "connection")?
            .connections
            .insert(connection.connection_id.clone(), connection.clone());
        Ok(())
    }

    async fn get_connection(&self, connection_id: &str) -> Result<Option<DeviceConnection>> {
        Ok(lock(&self.state, "connection")?
            .connections
            .get(connection_id)
            .cloned())
    }

    async fn clear_connection(&self, connection_id: &str) -> Result<()> {
        let mut state = lock(&self.state, "connection")?;
        state.connections.remove(connection_id);
        state.namespaces.retain(|_, members| {
            members.retain(|m| m.connection_id != connection_id);
            !members.is_empty()
        });
        Ok(())
    }

    async fn save_namespace_connection(&self, connection: &NamespaceConnection) -> Result<()> {
        let mut state = lock(&self.state, "connection")?;
        let members = state
            .namespaces
            .entry(connection.namespace.clone())
            .or_default();
        match members
            .iter_mut()
            .find(|m| m.connection_id == connection.connection_id)
        {
            Some(existing) => *existing = connection.clone(),
            None => members.push(connection.clone()),
        }
        Ok(())
    }

    async fn delete_namespace_connection(
        &self,
        connection_id: &str,
        namespace: &str,
    ) -> Result<()> {
        let mut state = lock(&self.state, "connection")?;
        if let Some(members) = state.namespaces.get_mut(namespace) {
            members.retain(|m| m.connection_id != connection_id);
            if members.is_empty() {
                state.namespaces.remove(namespace);
            }
        }
        Ok(())
    }

    async fn get_namespace_connection(
        &self,
        connection_id: &str,
        namespace: &str,
    ) -> Result<Option<NamespaceConnection>> {
        Ok(lock(&self.state, "connection")?
            .namespaces
            .get(namespace)
            .and_then(|members| members.iter().find(|m| m.connection_id == connection_id))
            .cloned())
    }

    async fn get_connections_by_namespace(
        &self,
        namespace: &str,
    ) -> Result<Vec<NamespaceConnection>> {
        Ok(lock(&self.state, "connection")?
            .namespaces
            .get(namespace)
            .cloned()
            .unwrap_or_default())
    }

    async fn count_connections_by_namespace(&self, namespace: &str) -> Result<usize> {
        Ok(lock(&self.state, "connection")?
            .namespaces
            .get(namespace)
            .map(Vec::len)
            .unwrap_or(0))
    }

    async fn get_connections(&self, connection_id: &str) -> Result<Vec<NamespaceConnection>> {
        let state = lock(&self.state, "connection")?;
        let mut memberships: Vec<NamespaceConnection> = state
            .namespaces
            .values()
            .flat_map(|members| members.iter())
            .filter(|m| m.connection_id == connection_id)
            .cloned()
            .collect();
        memberships.sort_by(|a, b| a.namespace.cmp(&b.namespace));
        Ok(memberships)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{AtomId, branch_namespace, watch_branch_namespace};
    use serde_json::json;

    fn atom(site: &str, timestamp: u64, hash: &str) -> Atom {
        Atom {
            hash: hash.to_string(),
            id: AtomId {
                site: site.to_string(),
                timestamp,
                priority: None,
            },
            cause: None,
            value: json!({ "n": timestamp }),
        }
    }

    fn device(id: &str) -> DeviceConnection {
        DeviceConnection {
            connection_id: id.to_string(),
            session_id: id.to_string(),
            username: id.to_string(),
            token: id.to_string(),
        }
    }

    #[tokio::test]
    async fn test_save_same_hash_twice_keeps_one_copy() {
        let store = MemoryAtomStore::new();
        let a1 = atom("a", 1, "hash1");

        store.save_atoms("ns", &[a1.clone()]).await.unwrap();
        store.save_atoms("ns", &[a1.clone()]).await.unwrap();

        assert_eq!(store.load_atoms("ns").await.unwrap(), vec![a1]);
    }

    #[tokio::test]
    async fn test_load_orders_by_timestamp() {
        let store = MemoryAtomStore::new();
        let a1 = atom("a", 1, "zzz");
        let a2 = atom("a", 2, "aaa");
        let a3 = atom("b", 3, "mmm");

        store
            .save_atoms("ns", &[a3.clone(), a1.clone(), a2.clone()])
            .await
            .unwrap();

        assert_eq!(store.load_atoms("ns").await.unwrap(), vec![a1, a2, a3]);
    }

    #[tokio::test]
    async fn test_delete_missing_hash_is_noop() {
        let store = MemoryAtomStore::new();
        let a1 = atom("a", 1, "hash1");
        store.save_atoms("ns", &[a1.clone()]).await.unwrap();

        store
            .delete_atoms("ns", &["missing".to_string()])
            .await
            .unwrap();
        store
            .delete_atoms("other", &["hash1".to_string()])
            .await
            .unwrap();

        assert_eq!(store.load_atoms("ns").await.unwrap(), vec![a1]);
    }

    #[tokio::test]
    async fn test_clear_namespace_only_clears_that_namespace() {
        let store = MemoryAtomStore::new();
        store.save_atoms("ns1", &[atom("a", 1, "h1")]).await.unwrap();
        store.save_atoms("ns2", &[atom("a", 2, "h2")]).await.unwrap();

        store.clear_namespace("ns1").await.unwrap();

        assert!(store.load_atoms("ns1").await.unwrap().is_empty());
        assert_eq!(store.load_atoms("ns2").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_clear_connection_cascades_memberships() {
        let store = MemoryConnectionStore::new();
        let d1 = device("device1");
        let d2 = device("device2");
        store.save_connection(&d1).await.unwrap();
        store.save_connection(&d2).await.unwrap();

        let branch = branch_namespace("abc");
        let watched = watch_branch_namespace("abc");
        store
            .save_namespace_connection(&d1.in_namespace(&branch, false))
            .await
            .unwrap();
        store
            .save_namespace_connection(&d1.in_namespace(&watched, true))
            .await
            .unwrap();
        store
            .save_namespace_connection(&d2.in_namespace(&branch, false))
            .await
            .unwrap();

        assert_eq!(store.get_connections("device1").await.unwrap().len(), 2);

        store.clear_connection("device1").await.unwrap();

        assert!(store.get_connection("device1").await.unwrap().is_none());
        assert!(store.get_connections("device1").await.unwrap().is_empty());
        assert_eq!(store.count_connections_by_namespace(&branch).await.unwrap(), 1);
        assert_eq!(store.count_connections_by_namespace(&watched).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_namespace_connections_keep_insertion_order() {
        let store = MemoryConnectionStore::new();
        let branch = branch_namespace("abc");
        for id in ["device3", "device1", "device2"] {
            store
                .save_namespace_connection(&device(id).in_namespace(&branch, false))
                .await
                .unwrap();
        }
        // re-saving replaces in place
        store
            .save_namespace_connection(&device("device1").in_namespace(&branch, true))
            .await
            .unwrap();

        let members = store.get_connections_by_namespace(&branch).await.unwrap();
        let ids: Vec<_> = members.iter().map(|m| m.connection_id.as_str()).collect();
        assert_eq!(ids, vec!["device3", "device1", "device2"]);
        assert!(members[1].temporary);

        store
            .delete_namespace_connection("device1", &branch)
            .await
            .unwrap();
        assert!(
            store
                .get_namespace_connection("device1", &branch)
                .await
                .unwrap()
                .is_none()
        );
        assert_eq!(store.count_connections_by_namespace(&branch).await.unwrap(), 2);
    }
}
