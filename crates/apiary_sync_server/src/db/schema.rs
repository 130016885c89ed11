use rusqlite::Connection;

/// SQL schema for atom and connection tables
const SCHEMA: &str = r#"
-- Atoms, one row per hash per namespace
CREATE TABLE IF NOT EXISTS atoms (
    namespace TEXT NOT NULL,
    hash TEXT NOT NULL,
    timestamp INTEGER NOT NULL,
    atom_json TEXT NOT NULL,
    PRIMARY KEY (namespace, hash)
);

CREATE INDEX IF NOT EXISTS idx_atoms_namespace_timestamp ON atoms(namespace, timestamp);

-- Live connections
CREATE TABLE IF NOT EXISTS connections (
    connection_id TEXT PRIMARY KEY,
    session_id TEXT NOT NULL,
    username TEXT NOT NULL,
    token TEXT NOT NULL
);

-- Namespace memberships (branch watchers and presence watchers)
CREATE TABLE IF NOT EXISTS namespace_connections (
    seq INTEGER PRIMARY KEY AUTOINCREMENT,
    namespace TEXT NOT NULL,
    connection_id TEXT NOT NULL REFERENCES connections(connection_id) ON DELETE CASCADE,
    session_id TEXT NOT NULL,
    username TEXT NOT NULL,
    token TEXT NOT NULL,
    temporary INTEGER NOT NULL DEFAULT 0,
    UNIQUE (namespace, connection_id)
);

CREATE INDEX IF NOT EXISTS idx_namespace_connections_connection
    ON namespace_connections(connection_id);
"#;

/// Initialize the database with the sync schema
pub fn init_database(conn: &Connection) -> Result<(), rusqlite::Error> {
    conn.execute_batch("PRAGMA foreign_keys = ON;")?;
    conn.execute_batch(SCHEMA)?;
    Ok(())
}
