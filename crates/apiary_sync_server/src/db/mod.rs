mod atoms;
mod connections;
mod schema;

pub use atoms::SqliteAtomStore;
pub use connections::SqliteConnectionStore;
pub use schema::init_database;

use apiary_sync::SyncError;
use rusqlite::Connection;
use std::sync::{Arc, Mutex, MutexGuard};

/// Connection shared by the SQLite-backed stores.
pub type SharedConnection = Arc<Mutex<Connection>>;

/// Open (or create) the database at `path` and apply the schema.
pub fn open_database(path: &std::path::Path) -> Result<SharedConnection, rusqlite::Error> {
    let conn = Connection::open(path)?;
    init_database(&conn)?;
    Ok(Arc::new(Mutex::new(conn)))
}

fn lock(conn: &SharedConnection) -> Result<MutexGuard<'_, Connection>, SyncError> {
    conn.lock()
        .map_err(|_| SyncError::Store("Failed to lock database connection".to_string()))
}

fn store_err(e: rusqlite::Error) -> SyncError {
    SyncError::Store(e.to_string())
}

#[cfg(test)]
fn open_in_memory() -> SharedConnection {
    let conn = Connection::open_in_memory().unwrap();
    init_database(&conn).unwrap();
    Arc::new(Mutex::new(conn))
}
