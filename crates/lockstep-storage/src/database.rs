// SPDX-FileCopyrightText: 2026 Lockstep Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Serialized database handle.
//!
//! Every operation against a handle, including an entire transaction, runs
//! while holding the handle's single lock. The lock is held across every
//! engine call, so a second caller cannot start anything (not even `BEGIN`)
//! until the first has fully returned. `tokio::sync::Mutex` queues waiters
//! in FIFO order, so operations complete in submission order.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use futures::future::BoxFuture;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, info};

use lockstep_core::{
    CleanupAction, ConnectionId, DiagnosticSink, EngineGateway, LockstepError, Row, Value,
};

use crate::transaction::Transaction;

/// Mutable state guarded by the handle's lock.
#[derive(Debug, Default)]
pub(crate) struct HandleState {
    /// `None` once the handle is closed.
    pub(crate) connection: Option<ConnectionId>,
    /// The transaction currently open on the connection, for observability.
    pub(crate) transaction: Option<Transaction>,
    /// Set after the one permitted store recreation.
    pub(crate) recreated: bool,
    pub(crate) next_transaction: u64,
}

/// A handle to one open store.
///
/// Cloning is cheap and every clone shares the same lock and connection.
#[derive(Clone)]
pub struct Database {
    path: Arc<Path>,
    gateway: Arc<dyn EngineGateway>,
    diagnostics: Arc<dyn DiagnosticSink>,
    state: Arc<Mutex<HandleState>>,
    /// Mirrors `state.connection.is_some()`, readable without the lock.
    open: Arc<AtomicBool>,
}

impl fmt::Debug for Database {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Database")
            .field("path", &self.path)
            .field("gateway", &self.gateway.name())
            .finish_non_exhaustive()
    }
}

impl Database {
    /// Opens the store through the gateway without any schema management.
    pub(crate) async fn connect(
        gateway: Arc<dyn EngineGateway>,
        diagnostics: Arc<dyn DiagnosticSink>,
        path: &Path,
    ) -> Result<Self, LockstepError> {
        let connection = gateway.open(path).await?;
        info!(path = %path.display(), connection = %connection, "database opened");
        Ok(Self {
            path: Arc::from(path),
            gateway,
            diagnostics,
            state: Arc::new(Mutex::new(HandleState {
                connection: Some(connection),
                ..HandleState::default()
            })),
            open: Arc::new(AtomicBool::new(true)),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Whether `self` and `other` are clones of one handle.
    pub(crate) fn same_handle(&self, other: &Database) -> bool {
        Arc::ptr_eq(&self.state, &other.state)
    }

    /// Waits for exclusive access to the handle.
    pub(crate) async fn lock(&self) -> HandleGuard {
        HandleGuard {
            path: Arc::clone(&self.path),
            gateway: Arc::clone(&self.gateway),
            diagnostics: Arc::clone(&self.diagnostics),
            open: Arc::clone(&self.open),
            state: Arc::clone(&self.state).lock_owned().await,
        }
    }

    /// Runs `operation` with exclusive access to the handle.
    ///
    /// The lock is released once `operation` finishes, whether it succeeded
    /// or failed. Its result is returned unchanged.
    pub async fn run_exclusive<T, F>(&self, operation: F) -> Result<T, LockstepError>
    where
        F: for<'a> FnOnce(&'a mut HandleGuard) -> BoxFuture<'a, Result<T, LockstepError>> + Send,
        T: Send,
    {
        let mut guard = self.lock().await;
        operation(&mut guard).await
    }

    pub async fn execute(&self, sql: &str, args: &[Value]) -> Result<(), LockstepError> {
        self.lock().await.execute(sql, args).await
    }

    /// Inserts a row and returns its row id (0 when nothing was inserted).
    pub async fn insert(&self, sql: &str, args: &[Value]) -> Result<i64, LockstepError> {
        self.lock().await.insert(sql, args).await
    }

    /// Runs an update and returns the number of affected rows.
    pub async fn update(&self, sql: &str, args: &[Value]) -> Result<u64, LockstepError> {
        self.lock().await.update(sql, args).await
    }

    /// Runs a delete and returns the number of affected rows.
    pub async fn delete(&self, sql: &str, args: &[Value]) -> Result<u64, LockstepError> {
        self.lock().await.delete(sql, args).await
    }

    pub async fn query(&self, sql: &str, args: &[Value]) -> Result<Vec<Row>, LockstepError> {
        self.lock().await.query(sql, args).await
    }

    pub async fn query_first(
        &self,
        sql: &str,
        args: &[Value],
    ) -> Result<Option<Row>, LockstepError> {
        self.lock().await.query_first(sql, args).await
    }

    /// The stored schema version (0 when never set).
    pub async fn version(&self) -> Result<u32, LockstepError> {
        self.lock().await.version().await
    }

    pub async fn set_version(&self, version: u32) -> Result<(), LockstepError> {
        check_version(version)?;
        self.lock().await.set_version(version).await
    }

    /// Whether the handle still has a connection. Does not wait for the lock.
    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }

    /// Closes the handle once in-flight work has finished.
    ///
    /// The handle is marked closed even if the engine reports a failure;
    /// that failure goes to the diagnostic sink. Closing twice is a no-op.
    pub async fn close(&self) {
        self.lock().await.close_best_effort().await;
    }
}

fn check_version(version: u32) -> Result<(), LockstepError> {
    if version == 0 {
        return Err(LockstepError::Config(
            "schema version must be greater than 0".into(),
        ));
    }
    Ok(())
}

/// Exclusive access to a [`Database`], held for as long as the guard lives.
///
/// Transaction bodies and migration callbacks receive a `&mut HandleGuard`
/// and issue their statements through it without re-entering the lock.
pub struct HandleGuard {
    path: Arc<Path>,
    gateway: Arc<dyn EngineGateway>,
    diagnostics: Arc<dyn DiagnosticSink>,
    open: Arc<AtomicBool>,
    pub(crate) state: OwnedMutexGuard<HandleState>,
}

impl HandleGuard {
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_open(&self) -> bool {
        self.state.connection.is_some()
    }

    /// The current connection id, or `Closed` once the handle is closed.
    pub fn connection_id(&self) -> Result<ConnectionId, LockstepError> {
        self.state.connection.ok_or_else(|| LockstepError::Closed {
            path: PathBuf::from(&*self.path),
        })
    }

    pub async fn execute(&self, sql: &str, args: &[Value]) -> Result<(), LockstepError> {
        let connection = self.connection_id()?;
        debug!(connection = %connection, sql, args = args.len(), "execute");
        self.gateway.execute(connection, sql, args).await
    }

    pub async fn insert(&self, sql: &str, args: &[Value]) -> Result<i64, LockstepError> {
        let connection = self.connection_id()?;
        debug!(connection = %connection, sql, args = args.len(), "insert");
        self.gateway.insert(connection, sql, args).await
    }

    pub async fn update(&self, sql: &str, args: &[Value]) -> Result<u64, LockstepError> {
        let connection = self.connection_id()?;
        debug!(connection = %connection, sql, args = args.len(), "update");
        self.gateway.update(connection, sql, args).await
    }

    /// Deletes go through the engine's update path: both report affected rows.
    pub async fn delete(&self, sql: &str, args: &[Value]) -> Result<u64, LockstepError> {
        self.update(sql, args).await
    }

    pub async fn query(&self, sql: &str, args: &[Value]) -> Result<Vec<Row>, LockstepError> {
        let connection = self.connection_id()?;
        debug!(connection = %connection, sql, args = args.len(), "query");
        self.gateway.query(connection, sql, args).await
    }

    pub async fn query_first(
        &self,
        sql: &str,
        args: &[Value],
    ) -> Result<Option<Row>, LockstepError> {
        Ok(self.query(sql, args).await?.into_iter().next())
    }

    /// Reads `PRAGMA user_version`; 0 means the schema was never initialized.
    pub async fn version(&self) -> Result<u32, LockstepError> {
        let row = self.query_first("PRAGMA user_version", &[]).await?;
        let raw = row
            .as_ref()
            .and_then(Row::first)
            .and_then(Value::as_i64)
            .unwrap_or(0);
        u32::try_from(raw)
            .map_err(|_| LockstepError::Internal(format!("stored schema version {raw} is out of range")))
    }

    /// Writes `PRAGMA user_version`. 0 is reserved for "never initialized".
    pub async fn set_version(&self, version: u32) -> Result<(), LockstepError> {
        check_version(version)?;
        self.execute(&format!("PRAGMA user_version = {version}"), &[])
            .await
    }

    pub(crate) fn report_cleanup_failure(&self, action: CleanupAction, error: &LockstepError) {
        self.diagnostics.cleanup_failed(action, &self.path, error);
    }

    /// Closes the connection, reporting (not returning) any engine failure.
    pub(crate) async fn close_best_effort(&mut self) {
        let Some(connection) = self.state.connection.take() else {
            return;
        };
        self.open.store(false, Ordering::Release);
        self.state.transaction = None;
        match self.gateway.close(connection).await {
            Ok(()) => info!(path = %self.path.display(), connection = %connection, "database closed"),
            Err(err) => self.report_cleanup_failure(CleanupAction::Close, &err),
        }
    }

    /// Replaces the store with an empty one under the same path.
    ///
    /// Abandons the open transaction with `ROLLBACK`, closes the connection,
    /// deletes the backing data, reopens the path on a new connection, and
    /// begins a fresh transaction of the same kind. Allowed once per handle.
    pub(crate) async fn recreate_store(&mut self) -> Result<(), LockstepError> {
        if self.state.recreated {
            return Err(LockstepError::Internal(
                "store has already been recreated on this handle".into(),
            ));
        }
        let exclusive = self.state.transaction.is_none_or(|txn| txn.exclusive());

        if self.state.transaction.take().is_some() {
            self.execute("ROLLBACK", &[]).await?;
        }
        self.close_best_effort().await;

        if let Err(err) = self.gateway.delete_store(&self.path).await {
            self.report_cleanup_failure(CleanupAction::DeleteStore, &err);
        }

        let connection = self.gateway.open(&self.path).await?;
        self.state.connection = Some(connection);
        self.open.store(true, Ordering::Release);
        self.state.recreated = true;
        info!(path = %self.path.display(), connection = %connection, "store deleted and recreated");

        self.begin(exclusive).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use lockstep_core::TracingSink;
    use lockstep_test_utils::{CapturingSink, MockGateway};

    async fn open_mock(gateway: &Arc<MockGateway>) -> Database {
        Database::connect(
            gateway.clone(),
            Arc::new(TracingSink),
            Path::new("/mock/test.db"),
        )
        .await
        .unwrap()
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_operations_never_overlap() {
        let gateway = Arc::new(MockGateway::new().with_latency(Duration::from_millis(2)));
        let db = open_mock(&gateway).await;

        let mut tasks = Vec::new();
        for i in 0..16i64 {
            let db = db.clone();
            tasks.push(tokio::spawn(async move {
                db.insert("INSERT INTO t (n) VALUES (?)", &[Value::Integer(i)])
                    .await
                    .unwrap();
                db.query("SELECT * FROM t", &[]).await.unwrap();
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }

        assert_eq!(gateway.reentrancy_violations(), 0);
        assert_eq!(gateway.committed_rows(Path::new("/mock/test.db")).len(), 16);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn separate_handles_run_concurrently() {
        let gateway = Arc::new(MockGateway::new().with_latency(Duration::from_millis(20)));
        let a = Database::connect(gateway.clone(), Arc::new(TracingSink), Path::new("/mock/a.db"))
            .await
            .unwrap();
        let b = Database::connect(gateway.clone(), Arc::new(TracingSink), Path::new("/mock/b.db"))
            .await
            .unwrap();

        let (ra, rb) = tokio::join!(
            a.execute("CREATE TABLE x (id)", &[]),
            b.execute("CREATE TABLE y (id)", &[])
        );
        ra.unwrap();
        rb.unwrap();

        assert_eq!(gateway.reentrancy_violations(), 0);
        assert!(gateway.peak_concurrency() >= 2);
    }

    #[tokio::test]
    async fn run_exclusive_keeps_sequence_together() {
        let gateway = Arc::new(MockGateway::new());
        let db = open_mock(&gateway).await;

        let count = db
            .run_exclusive(|guard| {
                Box::pin(async move {
                    guard.execute("CREATE TABLE t (n)", &[]).await?;
                    guard.insert("INSERT INTO t VALUES (1)", &[]).await?;
                    guard.update("UPDATE t SET n = 2", &[]).await
                })
            })
            .await
            .unwrap();

        assert_eq!(count, 1);
        let sql = gateway.executed_sql();
        assert_eq!(
            sql,
            vec![
                "CREATE TABLE t (n)",
                "INSERT INTO t VALUES (1)",
                "UPDATE t SET n = 2"
            ]
        );
    }

    #[tokio::test]
    async fn run_exclusive_propagates_failure_unchanged() {
        let gateway = Arc::new(MockGateway::new());
        gateway.fail_when("DROP", "no such table: ghosts");
        let db = open_mock(&gateway).await;

        let err = db
            .run_exclusive(|guard| Box::pin(guard.execute("DROP TABLE ghosts", &[])))
            .await
            .unwrap_err();
        assert!(err.is_no_such_table());

        // The lock was released: the next operation goes through.
        db.execute("SELECT 1", &[]).await.unwrap();
    }

    #[tokio::test]
    async fn version_defaults_to_zero_and_round_trips() {
        let gateway = Arc::new(MockGateway::new());
        let db = open_mock(&gateway).await;

        assert_eq!(db.version().await.unwrap(), 0);
        db.set_version(3).await.unwrap();
        assert_eq!(db.version().await.unwrap(), 3);
        assert_eq!(gateway.version(Path::new("/mock/test.db")), 3);
    }

    #[tokio::test]
    async fn set_version_rejects_zero_without_io() {
        let gateway = Arc::new(MockGateway::new());
        let db = open_mock(&gateway).await;
        let before = gateway.calls().len();

        let err = db.set_version(0).await.unwrap_err();
        assert!(err.is_configuration());
        assert_eq!(gateway.calls().len(), before);
    }

    #[tokio::test]
    async fn guard_set_version_rejects_zero_without_io() {
        let gateway = Arc::new(MockGateway::new());
        gateway.seed_version(Path::new("/mock/test.db"), 4);
        let db = open_mock(&gateway).await;
        let before = gateway.calls().len();

        let err = db
            .run_exclusive(|guard| Box::pin(guard.set_version(0)))
            .await
            .unwrap_err();

        assert!(err.is_configuration());
        assert_eq!(gateway.calls().len(), before);
        assert_eq!(gateway.version(Path::new("/mock/test.db")), 4);
    }

    #[tokio::test]
    async fn operations_after_close_fail_with_closed() {
        let gateway = Arc::new(MockGateway::new());
        let db = open_mock(&gateway).await;

        db.close().await;
        assert!(!db.is_open());
        assert_eq!(gateway.open_connections(), 0);

        let err = db.query("SELECT 1", &[]).await.unwrap_err();
        assert!(matches!(err, LockstepError::Closed { .. }));
        assert!(err.is_database_closed());

        // Second close is a no-op.
        db.close().await;
    }

    #[tokio::test]
    async fn close_failure_goes_to_the_sink() {
        let gateway = Arc::new(MockGateway::new());
        gateway.fail_close("close refused");
        let sink = Arc::new(CapturingSink::new());
        let db = Database::connect(gateway.clone(), sink.clone(), Path::new("/mock/test.db"))
            .await
            .unwrap();

        db.close().await;

        assert!(!db.is_open());
        let events = sink.events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].action, CleanupAction::Close);
        assert!(events[0].message.contains("close refused"));
    }

    #[tokio::test]
    async fn query_first_returns_first_row_or_none() {
        let gateway = Arc::new(MockGateway::new());
        let mut first = Row::new();
        first.push("name", Value::from("a"));
        let mut second = Row::new();
        second.push("name", Value::from("b"));
        gateway.respond_to_query("FROM names", vec![first.clone(), second]);
        let db = open_mock(&gateway).await;

        assert_eq!(
            db.query_first("SELECT name FROM names", &[]).await.unwrap(),
            Some(first)
        );
        assert_eq!(db.query_first("SELECT 1 FROM empty", &[]).await.unwrap(), None);
    }
}
