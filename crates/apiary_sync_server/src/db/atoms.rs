use super::{SharedConnection, lock, store_err};
use apiary_sync::batch::{BatchWriter, check_item_size, process_batch};
use apiary_sync::protocol::Atom;
use apiary_sync::{AtomStore, Result, SyncError};
use async_trait::async_trait;
use rusqlite::{Connection, ErrorCode, params};

/// A single write against the atoms table.
#[derive(Debug, Clone)]
pub enum AtomWrite {
    Put {
        namespace: String,
        hash: String,
        timestamp: i64,
        json: String,
    },
    Delete {
        namespace: String,
        hash: String,
    },
}

/// Atom store backed by the `atoms` table.
///
/// Writes are applied in batched transactions; a batch that hits a busy or
/// locked database is retried as a whole.
#[derive(Clone)]
pub struct SqliteAtomStore {
    conn: SharedConnection,
}

impl SqliteAtomStore {
    pub fn new(conn: SharedConnection) -> Self {
        Self { conn }
    }
}

fn is_busy(e: &rusqlite::Error) -> bool {
    matches!(
        e,
        rusqlite::Error::SqliteFailure(err, _)
            if matches!(err.code, ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked)
    )
}

fn apply_writes(conn: &mut Connection, writes: &[AtomWrite]) -> rusqlite::Result<()> {
    let tx = conn.transaction()?;
    for write in writes {
        match write {
            AtomWrite::Put {
                namespace,
                hash,
                timestamp,
                json,
            } => {
                tx.execute(
                    "INSERT OR IGNORE INTO atoms (namespace, hash, timestamp, atom_json) VALUES (?, ?, ?, ?)",
                    params![namespace, hash, timestamp, json],
                )?;
            }
            AtomWrite::Delete { namespace, hash } => {
                tx.execute(
                    "DELETE FROM atoms WHERE namespace = ? AND hash = ?",
                    params![namespace, hash],
                )?;
            }
        }
    }
    tx.commit()
}

#[async_trait]
impl BatchWriter<AtomWrite> for SqliteAtomStore {
    async fn write_batch(&self, writes: Vec<AtomWrite>) -> Result<Vec<AtomWrite>> {
        let mut conn = lock(&self.conn)?;
        match apply_writes(&mut conn, &writes) {
            Ok(()) => Ok(Vec::new()),
            Err(e) if is_busy(&e) => Ok(writes),
            Err(e) => Err(store_err(e)),
        }
    }
}

#[async_trait]
impl AtomStore for SqliteAtomStore {
    async fn save_atoms(&self, namespace: &str, atoms: &[Atom]) -> Result<()> {
        let mut writes = Vec::with_capacity(atoms.len());
        for atom in atoms {
            let json = serde_json::to_string(atom)?;
            check_item_size(&atom.hash, json.len())?;
            let timestamp = i64::try_from(atom.id.timestamp).map_err(|_| {
                SyncError::Store(format!("Atom {} timestamp out of range", atom.hash))
            })?;
            writes.push(AtomWrite::Put {
                namespace: namespace.to_string(),
                hash: atom.hash.clone(),
                timestamp,
                json,
            });
        }
        process_batch(self, writes).await
    }

    async fn load_atoms(&self, namespace: &str) -> Result<Vec<Atom>> {
        let rows: Vec<String> = {
            let conn = lock(&self.conn)?;
            let mut stmt = conn
                .prepare(
                    "SELECT atom_json FROM atoms WHERE namespace = ? ORDER BY timestamp, hash",
                )
                .map_err(store_err)?;
            let rows = stmt
                .query_map([namespace], |row| row.get(0))
                .map_err(store_err)?
                .collect::<rusqlite::Result<_>>()
                .map_err(store_err)?;
            rows
        };
        rows.iter()
            .map(|json| serde_json::from_str(json).map_err(SyncError::from))
            .collect()
    }

    async fn delete_atoms(&self, namespace: &str, hashes: &[String]) -> Result<()> {
        let writes = hashes
            .iter()
            .map(|hash| AtomWrite::Delete {
                namespace: namespace.to_string(),
                hash: hash.clone(),
            })
            .collect();
        process_batch(self, writes).await
    }

    async fn clear_namespace(&self, namespace: &str) -> Result<()> {
        let conn = lock(&self.conn)?;
        conn.execute("DELETE FROM atoms WHERE namespace = ?", [namespace])
            .map_err(store_err)?;
        Ok(())
    }
}
