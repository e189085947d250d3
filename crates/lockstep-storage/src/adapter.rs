// SPDX-FileCopyrightText: 2026 Lockstep Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! SQLite implementation of the EngineGateway trait.
//!
//! Each open store gets its own `tokio_rusqlite::Connection`, which runs
//! every statement on that connection's background thread.

use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use rusqlite::types::{Value as SqlValue, ValueRef};
use tokio_rusqlite::Connection;
use tracing::{debug, warn};

use lockstep_config::StorageConfig;
use lockstep_core::{
    ConnectionId, EngineGateway, EngineOperation, HealthStatus, LockstepError, PluginAdapter, Row,
    Value,
};

const IN_MEMORY: &str = ":memory:";

/// SQLite-backed engine gateway.
///
/// Connection settings (WAL, busy timeout, foreign keys) come from
/// [`StorageConfig`] and are applied to every connection it opens.
pub struct SqliteGateway {
    config: StorageConfig,
    connections: DashMap<ConnectionId, Connection>,
    next_id: AtomicU64,
}

impl SqliteGateway {
    pub fn new(config: StorageConfig) -> Self {
        Self {
            config,
            connections: DashMap::new(),
            next_id: AtomicU64::new(1),
        }
    }

    /// The connection for `id`, cloned out of the map so no map guard is
    /// held across an await.
    fn connection(
        &self,
        operation: EngineOperation,
        id: ConnectionId,
    ) -> Result<Connection, LockstepError> {
        self.connections
            .get(&id)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| {
                LockstepError::engine_message(operation, format!("database_closed: {id}"))
            })
    }

    async fn configure(&self, conn: &Connection) -> Result<(), LockstepError> {
        let busy_timeout = Duration::from_millis(self.config.busy_timeout_ms);
        let wal_mode = self.config.wal_mode;
        let foreign_keys = self.config.foreign_keys;
        conn.call(move |conn| -> Result<(), rusqlite::Error> {
            conn.busy_timeout(busy_timeout)?;
            if wal_mode {
                let mode: String = conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| {
                    row.get(0)
                })?;
                if !mode.eq_ignore_ascii_case("wal") {
                    warn!(mode, "WAL journal mode not available; continuing");
                }
            }
            conn.pragma_update(None, "foreign_keys", foreign_keys)?;
            Ok(())
        })
        .await
        .map_err(engine_err(EngineOperation::Open))
    }
}

fn engine_err(
    operation: EngineOperation,
) -> impl FnOnce(tokio_rusqlite::Error<rusqlite::Error>) -> LockstepError {
    move |e| LockstepError::engine(operation, e)
}

fn to_sql(value: &Value) -> SqlValue {
    match value {
        Value::Null => SqlValue::Null,
        Value::Integer(i) => SqlValue::Integer(*i),
        Value::Real(f) => SqlValue::Real(*f),
        Value::Text(s) => SqlValue::Text(s.clone()),
        Value::Blob(b) => SqlValue::Blob(b.clone()),
    }
}

fn from_sql(value: ValueRef<'_>) -> Value {
    match value {
        ValueRef::Null => Value::Null,
        ValueRef::Integer(i) => Value::Integer(i),
        ValueRef::Real(f) => Value::Real(f),
        ValueRef::Text(t) => Value::Text(String::from_utf8_lossy(t).into_owned()),
        ValueRef::Blob(b) => Value::Blob(b.to_vec()),
    }
}

fn bind(args: &[Value]) -> Vec<SqlValue> {
    args.iter().map(to_sql).collect()
}

#[async_trait]
impl PluginAdapter for SqliteGateway {
    fn name(&self) -> &str {
        "sqlite"
    }

    fn version(&self) -> semver::Version {
        semver::Version::new(0, 1, 0)
    }

    async fn health_check(&self) -> Result<HealthStatus, LockstepError> {
        let connections: Vec<(ConnectionId, Connection)> = self
            .connections
            .iter()
            .map(|entry| (*entry.key(), entry.value().clone()))
            .collect();
        for (id, conn) in connections {
            let probe = conn
                .call(|conn| -> Result<(), rusqlite::Error> {
                    conn.execute_batch("SELECT 1;")?;
                    Ok(())
                })
                .await;
            if let Err(e) = probe {
                return Ok(HealthStatus::Unhealthy(format!("{id}: {e}")));
            }
        }
        Ok(HealthStatus::Healthy)
    }

    async fn shutdown(&self) -> Result<(), LockstepError> {
        let ids: Vec<ConnectionId> = self.connections.iter().map(|entry| *entry.key()).collect();
        for id in ids {
            if let Err(err) = self.close(id).await {
                warn!(connection = %id, error = %err, "close during shutdown failed");
            }
        }
        debug!("shutdown: all connections closed");
        Ok(())
    }
}

#[async_trait]
impl EngineGateway for SqliteGateway {
    async fn open(&self, path: &Path) -> Result<ConnectionId, LockstepError> {
        let opened = if path == Path::new(IN_MEMORY) {
            Connection::open_in_memory().await
        } else {
            if let Some(parent) = path.parent()
                && !parent.as_os_str().is_empty()
            {
                tokio::fs::create_dir_all(parent)
                    .await
                    .map_err(|e| LockstepError::engine(EngineOperation::Open, e))?;
            }
            Connection::open(path).await
        };
        let conn = opened.map_err(|e| LockstepError::engine(EngineOperation::Open, e))?;

        self.configure(&conn).await?;

        let id = ConnectionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.connections.insert(id, conn);
        debug!(path = %path.display(), connection = %id, "sqlite connection opened");
        Ok(id)
    }

    async fn close(&self, connection: ConnectionId) -> Result<(), LockstepError> {
        let (_, conn) = self.connections.remove(&connection).ok_or_else(|| {
            LockstepError::engine_message(
                EngineOperation::Close,
                format!("database_closed: {connection}"),
            )
        })?;
        conn.close()
            .await
            .map_err(engine_err(EngineOperation::Close))
    }

    async fn execute(
        &self,
        connection: ConnectionId,
        sql: &str,
        args: &[Value],
    ) -> Result<(), LockstepError> {
        let conn = self.connection(EngineOperation::Execute, connection)?;
        let sql = sql.to_string();
        let args = bind(args);
        conn.call(move |conn| -> Result<(), rusqlite::Error> {
            if args.is_empty() {
                conn.execute_batch(&sql)?;
            } else {
                conn.execute(&sql, rusqlite::params_from_iter(args))?;
            }
            Ok(())
        })
        .await
        .map_err(engine_err(EngineOperation::Execute))
    }

    async fn insert(
        &self,
        connection: ConnectionId,
        sql: &str,
        args: &[Value],
    ) -> Result<i64, LockstepError> {
        let conn = self.connection(EngineOperation::Insert, connection)?;
        let sql = sql.to_string();
        let args = bind(args);
        conn.call(move |conn| -> Result<i64, rusqlite::Error> {
            let changed = conn.execute(&sql, rusqlite::params_from_iter(args))?;
            Ok(if changed == 0 {
                0
            } else {
                conn.last_insert_rowid()
            })
        })
        .await
        .map_err(engine_err(EngineOperation::Insert))
    }

    async fn update(
        &self,
        connection: ConnectionId,
        sql: &str,
        args: &[Value],
    ) -> Result<u64, LockstepError> {
        let conn = self.connection(EngineOperation::Update, connection)?;
        let sql = sql.to_string();
        let args = bind(args);
        conn.call(move |conn| -> Result<u64, rusqlite::Error> {
            let changed = conn.execute(&sql, rusqlite::params_from_iter(args))?;
            Ok(changed as u64)
        })
        .await
        .map_err(engine_err(EngineOperation::Update))
    }

    async fn query(
        &self,
        connection: ConnectionId,
        sql: &str,
        args: &[Value],
    ) -> Result<Vec<Row>, LockstepError> {
        let conn = self.connection(EngineOperation::Query, connection)?;
        let sql = sql.to_string();
        let args = bind(args);
        conn.call(move |conn| -> Result<Vec<Row>, rusqlite::Error> {
            let mut stmt = conn.prepare(&sql)?;
            let columns: Vec<String> = stmt
                .column_names()
                .into_iter()
                .map(String::from)
                .collect();
            let mut rows = stmt.query(rusqlite::params_from_iter(args))?;
            let mut out = Vec::new();
            while let Some(row) = rows.next()? {
                let mut record = Row::new();
                for (i, name) in columns.iter().enumerate() {
                    record.push(name.clone(), from_sql(row.get_ref(i)?));
                }
                out.push(record);
            }
            Ok(out)
        })
        .await
        .map_err(engine_err(EngineOperation::Query))
    }

    /// Removes the database file and its WAL, shared-memory and rollback
    /// journal companions. Files that do not exist are skipped.
    async fn delete_store(&self, path: &Path) -> Result<(), LockstepError> {
        if path == Path::new(IN_MEMORY) {
            return Ok(());
        }
        let base = path.as_os_str().to_os_string();
        for suffix in ["", "-wal", "-shm", "-journal"] {
            let mut file = base.clone();
            file.push(suffix);
            match tokio::fs::remove_file(&file).await {
                Ok(()) => debug!(file = %Path::new(&file).display(), "removed store file"),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(LockstepError::engine(EngineOperation::DeleteStore, e)),
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn memory_gateway() -> SqliteGateway {
        SqliteGateway::new(StorageConfig {
            database_path: IN_MEMORY.into(),
            ..StorageConfig::default()
        })
    }

    #[tokio::test]
    async fn insert_query_update_round() {
        let gateway = memory_gateway();
        let conn = gateway.open(Path::new(IN_MEMORY)).await.unwrap();

        gateway
            .execute(conn, "CREATE TABLE people (id INTEGER PRIMARY KEY, name TEXT, photo BLOB)", &[])
            .await
            .unwrap();
        let id = gateway
            .insert(
                conn,
                "INSERT INTO people (name, photo) VALUES (?, ?)",
                &[Value::from("ada"), Value::Blob(vec![1, 2])],
            )
            .await
            .unwrap();
        assert_eq!(id, 1);

        let changed = gateway
            .update(conn, "UPDATE people SET name = ? WHERE id = ?", &[Value::from("grace"), Value::from(id)])
            .await
            .unwrap();
        assert_eq!(changed, 1);

        let rows = gateway
            .query(conn, "SELECT id, name, photo FROM people", &[])
            .await
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].get_i64("id"), Some(1));
        assert_eq!(rows[0].get_str("name"), Some("grace"));
        assert_eq!(rows[0].get("photo"), Some(&Value::Blob(vec![1, 2])));
    }

    #[tokio::test]
    async fn insert_or_ignore_reports_zero_when_nothing_inserted() {
        let gateway = memory_gateway();
        let conn = gateway.open(Path::new(IN_MEMORY)).await.unwrap();
        gateway
            .execute(conn, "CREATE TABLE tags (name TEXT PRIMARY KEY)", &[])
            .await
            .unwrap();

        let sql = "INSERT OR IGNORE INTO tags (name) VALUES (?)";
        assert_eq!(gateway.insert(conn, sql, &[Value::from("x")]).await.unwrap(), 1);
        assert_eq!(gateway.insert(conn, sql, &[Value::from("x")]).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn engine_errors_are_classified() {
        let gateway = memory_gateway();
        let conn = gateway.open(Path::new(IN_MEMORY)).await.unwrap();

        let err = gateway.query(conn, "SELECT * FROM missing", &[]).await.unwrap_err();
        assert!(err.is_no_such_table());

        let err = gateway.execute(conn, "SELEC 1", &[]).await.unwrap_err();
        assert!(err.is_syntax_error());

        gateway
            .execute(conn, "CREATE TABLE u (k TEXT UNIQUE)", &[])
            .await
            .unwrap();
        gateway.insert(conn, "INSERT INTO u VALUES ('a')", &[]).await.unwrap();
        let err = gateway
            .insert(conn, "INSERT INTO u VALUES ('a')", &[])
            .await
            .unwrap_err();
        assert!(err.is_unique_constraint());
    }

    #[tokio::test]
    async fn closed_connection_is_reported() {
        let gateway = memory_gateway();
        let conn = gateway.open(Path::new(IN_MEMORY)).await.unwrap();
        gateway.close(conn).await.unwrap();

        let err = gateway.query(conn, "SELECT 1", &[]).await.unwrap_err();
        assert!(err.is_database_closed());
        assert!(gateway.close(conn).await.unwrap_err().is_database_closed());
    }

    #[tokio::test]
    async fn file_store_applies_pragmas_and_deletes_cleanly() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("app.db");
        let gateway = SqliteGateway::new(StorageConfig {
            database_path: path.to_string_lossy().into_owned(),
            ..StorageConfig::default()
        });

        let conn = gateway.open(&path).await.unwrap();
        let mode = gateway.query(conn, "PRAGMA journal_mode", &[]).await.unwrap();
        assert_eq!(mode[0].first().and_then(Value::as_str), Some("wal"));
        let fk = gateway.query(conn, "PRAGMA foreign_keys", &[]).await.unwrap();
        assert_eq!(fk[0].first().and_then(Value::as_i64), Some(1));

        gateway.close(conn).await.unwrap();
        gateway.delete_store(&path).await.unwrap();
        assert!(!path.exists());
        // Deleting again is not an error.
        gateway.delete_store(&path).await.unwrap();
    }

    #[tokio::test]
    async fn health_check_and_shutdown() {
        let gateway = memory_gateway();
        gateway.open(Path::new(IN_MEMORY)).await.unwrap();
        gateway.open(Path::new(IN_MEMORY)).await.unwrap();

        assert_eq!(gateway.health_check().await.unwrap(), HealthStatus::Healthy);
        gateway.shutdown().await.unwrap();
        assert!(gateway.connections.is_empty());
    }
}
