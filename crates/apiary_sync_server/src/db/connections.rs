use super::{SharedConnection, lock, store_err};
use apiary_sync::protocol::{DeviceConnection, NamespaceConnection};
use apiary_sync::{ConnectionStore, Result};
use async_trait::async_trait;
use rusqlite::{OptionalExtension, Row, params};

const NAMESPACE_COLUMNS: &str =
    "connection_id, session_id, username, token, namespace, temporary";

fn namespace_connection(row: &Row<'_>) -> rusqlite::Result<NamespaceConnection> {
    Ok(NamespaceConnection {
        connection_id: row.get(0)?,
        session_id: row.get(1)?,
        username: row.get(2)?,
        token: row.get(3)?,
        namespace: row.get(4)?,
        temporary: row.get(5)?,
    })
}

/// Connection store backed by the `connections` and `namespace_connections` tables.
///
/// Memberships reference their connection with `ON DELETE CASCADE`, so
/// clearing a connection removes everything it was watching.
#[derive(Clone)]
pub struct SqliteConnectionStore {
    conn: SharedConnection,
}

impl SqliteConnectionStore {
    pub fn new(conn: SharedConnection) -> Self {
        Self { conn }
    }

    fn query_memberships(
        &self,
        filter: &str,
        param: &str,
    ) -> Result<Vec<NamespaceConnection>> {
        let conn = lock(&self.conn)?;
        let sql = format!(
            "SELECT {} FROM namespace_connections WHERE {} ORDER BY seq",
            NAMESPACE_COLUMNS, filter
        );
        let mut stmt = conn.prepare(&sql).map_err(store_err)?;
        let rows = stmt
            .query_map([param], namespace_connection)
            .map_err(store_err)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(store_err)?;
        Ok(rows)
    }
}

#[async_trait]
impl ConnectionStore for SqliteConnectionStore {
    async fn save_connection(&self, connection: &DeviceConnection) -> Result<()> {
        let conn = lock(&self.conn)?;
        conn.execute(
            "INSERT INTO connections (connection_id, session_id, username, token)
             VALUES (?, ?, ?, ?)
             ON CONFLICT(connection_id) DO UPDATE SET
                session_id = excluded.session_id,
                username = excluded.username,
                token = excluded.token",
            params![
                connection.connection_id,
                connection.session_id,
                connection.username,
                connection.token
            ],
        )
        .map_err(store_err)?;
        Ok(())
    }

    async fn get_connection(&self, connection_id: &str) -> Result<Option<DeviceConnection>> {
        let conn = lock(&self.conn)?;
        conn.query_row(
            "SELECT connection_id, session_id, username, token FROM connections WHERE connection_id = ?",
            [connection_id],
            |row| {
                Ok(DeviceConnection {
                    connection_id: row.get(0)?,
                    session_id: row.get(1)?,
                    username: row.get(2)?,
                    token: row.get(3)?,
                })
            },
        )
        .optional()
        .map_err(store_err)
    }

    async fn clear_connection(&self, connection_id: &str) -> Result<()> {
        let conn = lock(&self.conn)?;
        conn.execute(
            "DELETE FROM connections WHERE connection_id = ?",
            [connection_id],
        )
        .map_err(store_err)?;
        Ok(())
    }

    async fn save_namespace_connection(&self, connection: &NamespaceConnection) -> Result<()> {
        let conn = lock(&self.conn)?;
        conn.execute(
            "INSERT INTO namespace_connections
                (connection_id, session_id, username, token, namespace, temporary)
             VALUES (?, ?, ?, ?, ?, ?)
             ON CONFLICT(namespace, connection_id) DO UPDATE SET
                session_id = excluded.session_id,
                username = excluded.username,
                token = excluded.token,
                temporary = excluded.temporary",
            params![
                connection.connection_id,
                connection.session_id,
                connection.username,
                connection.token,
                connection.namespace,
                connection.temporary
            ],
        )
        .map_err(store_err)?;
        Ok(())
    }

    async fn delete_namespace_connection(
        &self,
        connection_id: &str,
        namespace: &str,
    ) -> Result<()> {
        let conn = lock(&self.conn)?;
        conn.execute(
            "DELETE FROM namespace_connections WHERE connection_id = ? AND namespace = ?",
            params![connection_id, namespace],
        )
        .map_err(store_err)?;
        Ok(())
    }

    async fn get_namespace_connection(
        &self,
        connection_id: &str,
        namespace: &str,
    ) -> Result<Option<NamespaceConnection>> {
        let conn = lock(&self.conn)?;
        let sql = format!(
            "SELECT {} FROM namespace_connections WHERE connection_id = ? AND namespace = ?",
            NAMESPACE_COLUMNS
        );
        conn.query_row(&sql, params![connection_id, namespace], namespace_connection)
            .optional()
            .map_err(store_err)
    }

    async fn get_connections_by_namespace(
        &self,
        namespace: &str,
    ) -> Result<Vec<NamespaceConnection>> {
        self.query_memberships("namespace = ?", namespace)
    }

    async fn count_connections_by_namespace(&self, namespace: &str) -> Result<usize> {
        let conn = lock(&self.conn)?;
        let count: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM namespace_connections WHERE namespace = ?",
                [namespace],
                |row| row.get(0),
            )
            .map_err(store_err)?;
        Ok(count.max(0) as usize)
    }

    async fn get_connections(&self, connection_id: &str) -> Result<Vec<NamespaceConnection>> {
        self.query_memberships("connection_id = ?", connection_id)
    }
}
