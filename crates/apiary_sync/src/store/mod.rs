//! Store contracts for atoms and connections.
//!
//! The sync server keeps no state of its own; everything it knows about
//! branches, memberships and atoms is re-read from these stores on every call.

mod memory;

pub use memory::{MemoryAtomStore, MemoryConnectionStore};

use crate::error::Result;
use crate::protocol::{Atom, DeviceConnection, NamespaceConnection};
use async_trait::async_trait;

/// Durable per-namespace set of atoms, keyed by hash.
///
/// Saving a known hash or deleting an unknown one must be a no-op, and empty
/// lists must be accepted. A completed `save_atoms` must be visible to any
/// later `load_atoms`.
#[async_trait]
pub trait AtomStore: Send + Sync {
    /// Save the given atoms to the namespace.
    async fn save_atoms(&self, namespace: &str, atoms: &[Atom]) -> Result<()>;

    /// Load every atom in the namespace.
    async fn load_atoms(&self, namespace: &str) -> Result<Vec<Atom>>;

    /// Delete the atoms with the given hashes from the namespace.
    async fn delete_atoms(&self, namespace: &str, hashes: &[String]) -> Result<()>;

    /// Delete every atom in the namespace.
    async fn clear_namespace(&self, namespace: &str) -> Result<()>;
}

/// Durable registry of connections and their namespace memberships.
#[async_trait]
pub trait ConnectionStore: Send + Sync {
    /// Save (or replace) a connection record.
    async fn save_connection(&self, connection: &DeviceConnection) -> Result<()>;

    /// Get a connection record by ID.
    async fn get_connection(&self, connection_id: &str) -> Result<Option<DeviceConnection>>;

    /// Remove a connection record and every membership it holds.
    async fn clear_connection(&self, connection_id: &str) -> Result<()>;

    /// Save (or replace) the membership of a connection in a namespace.
    async fn save_namespace_connection(&self, connection: &NamespaceConnection) -> Result<()>;

    /// Remove the membership of a connection in a namespace.
    async fn delete_namespace_connection(&self, connection_id: &str, namespace: &str)
    -> Result<()>;

    /// Get the membership of a connection in a namespace.
    async fn get_namespace_connection(
        &self,
        connection_id: &str,
        namespace: &str,
    ) -> Result<Option<NamespaceConnection>>;

    /// Get every membership in a namespace, in the order they were created.
    async fn get_connections_by_namespace(&self, namespace: &str)
    -> Result<Vec<NamespaceConnection>>;

    /// Count the memberships in a namespace.
    async fn count_connections_by_namespace(&self, namespace: &str) -> Result<usize>;

    /// Get every membership held by a connection.
    async fn get_connections(&self, connection_id: &str) -> Result<Vec<NamespaceConnection>>;
}
