// SPDX-FileCopyrightText: 2026 Lockstep Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Transaction coordinator.
//!
//! A transaction body returns `Result`; `Ok` commits and `Err` rolls back.
//! Exactly one `COMMIT` or `ROLLBACK` is issued per `BEGIN`, and a body's
//! failure is returned only after the rollback has completed.

use futures::future::BoxFuture;
use tracing::{debug, warn};

use lockstep_core::{CleanupAction, LockstepError, Value};

use crate::database::{Database, HandleGuard};

/// An open transaction on a handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transaction {
    id: u64,
    exclusive: bool,
}

impl Transaction {
    /// Sequence number of this transaction on its handle, starting at 1.
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn exclusive(&self) -> bool {
        self.exclusive
    }
}

impl HandleGuard {
    /// The transaction currently open on this handle, if any.
    pub fn current_transaction(&self) -> Option<Transaction> {
        self.state.transaction
    }

    pub fn in_transaction(&self) -> bool {
        self.state.transaction.is_some()
    }

    /// Issues `BEGIN EXCLUSIVE` or `BEGIN IMMEDIATE`.
    pub async fn begin(&mut self, exclusive: bool) -> Result<Transaction, LockstepError> {
        if let Some(active) = self.state.transaction {
            return Err(LockstepError::Internal(format!(
                "transaction {} is already open on this handle",
                active.id
            )));
        }
        let sql = if exclusive {
            "BEGIN EXCLUSIVE"
        } else {
            "BEGIN IMMEDIATE"
        };
        self.execute(sql, &[]).await?;

        self.state.next_transaction += 1;
        let transaction = Transaction {
            id: self.state.next_transaction,
            exclusive,
        };
        self.state.transaction = Some(transaction);
        debug!(transaction = transaction.id, exclusive, "transaction started");
        Ok(transaction)
    }

    /// Ends the open transaction with `COMMIT` when `successful`, else `ROLLBACK`.
    ///
    /// A no-op when no transaction is open (the store recreation path may
    /// have abandoned it). A rejected `COMMIT` is followed by a best-effort
    /// `ROLLBACK` so the engine is not left inside the transaction; the
    /// commit error is returned.
    pub async fn end(&mut self, successful: bool) -> Result<(), LockstepError> {
        let Some(transaction) = self.state.transaction.take() else {
            return Ok(());
        };
        let sql = if successful { "COMMIT" } else { "ROLLBACK" };
        debug!(transaction = transaction.id, sql, "transaction ending");
        let result = self.execute(sql, &[]).await;
        if successful && let Err(commit_err) = &result {
            warn!(transaction = transaction.id, error = %commit_err, "commit failed, rolling back");
            if let Err(rollback_err) = self.execute("ROLLBACK", &[]).await {
                self.report_cleanup_failure(CleanupAction::Rollback, &rollback_err);
            }
        }
        result
    }

    /// Runs `body` inside a transaction on this already-locked handle.
    pub async fn run_in_transaction<T, F>(
        &mut self,
        exclusive: bool,
        body: F,
    ) -> Result<T, LockstepError>
    where
        F: for<'a> FnOnce(&'a mut HandleGuard) -> BoxFuture<'a, Result<T, LockstepError>> + Send,
        T: Send,
    {
        self.begin(exclusive).await?;
        match body(&mut *self).await {
            Ok(value) => {
                self.end(true).await?;
                Ok(value)
            }
            Err(err) => {
                if let Err(rollback_err) = self.end(false).await {
                    warn!(error = %rollback_err, "rollback after failed transaction body failed");
                    self.report_cleanup_failure(CleanupAction::Rollback, &rollback_err);
                }
                Err(err)
            }
        }
    }

    /// Inserts every row with `sql` inside the current lock, returning how
    /// many rows were inserted. Stops at the first failure.
    async fn insert_each(&self, sql: &str, rows: &[Vec<Value>]) -> Result<u64, LockstepError> {
        let mut inserted = 0;
        for args in rows {
            self.insert(sql, args).await?;
            inserted += 1;
        }
        Ok(inserted)
    }
}

impl Database {
    /// Runs `body` in a transaction while holding the handle's lock.
    ///
    /// `exclusive` selects `BEGIN EXCLUSIVE` over `BEGIN IMMEDIATE`. The
    /// body's `Ok` value is returned after `COMMIT`; its `Err` after `ROLLBACK`.
    pub async fn transaction<T, F>(&self, exclusive: bool, body: F) -> Result<T, LockstepError>
    where
        F: for<'a> FnOnce(&'a mut HandleGuard) -> BoxFuture<'a, Result<T, LockstepError>> + Send,
        T: Send,
    {
        let mut guard = self.lock().await;
        guard.run_in_transaction(exclusive, body).await
    }

    /// Inserts all `rows` with one statement in a single transaction.
    ///
    /// Either every row is committed or, on the first failing row, none are;
    /// that row's error is returned.
    pub async fn insert_all(&self, sql: &str, rows: Vec<Vec<Value>>) -> Result<u64, LockstepError> {
        let sql = sql.to_string();
        let mut guard = self.lock().await;
        guard
            .run_in_transaction(false, move |guard| {
                Box::pin(async move { guard.insert_each(&sql, &rows).await })
            })
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;
    use std::sync::Arc;
    use std::time::Duration;

    use lockstep_core::{EngineGateway, TracingSink};
    use lockstep_test_utils::{CapturingSink, MockGateway};

    const PATH: &str = "/mock/txn.db";

    async fn open_mock(gateway: &Arc<MockGateway>) -> Database {
        Database::connect(gateway.clone(), Arc::new(TracingSink), Path::new(PATH))
            .await
            .unwrap()
    }

    fn rows(n: i64) -> Vec<Vec<Value>> {
        (1..=n).map(|i| vec![Value::Integer(i)]).collect()
    }

    #[tokio::test]
    async fn successful_body_commits() {
        let gateway = Arc::new(MockGateway::new());
        let db = open_mock(&gateway).await;

        let id = db
            .transaction(false, |guard| {
                Box::pin(async move { guard.insert("INSERT INTO t VALUES (?)", &[Value::Integer(7)]).await })
            })
            .await
            .unwrap();

        assert_eq!(id, 1);
        assert_eq!(
            gateway.executed_sql(),
            vec!["BEGIN IMMEDIATE", "INSERT INTO t VALUES (?)", "COMMIT"]
        );
        assert_eq!(gateway.committed_rows(Path::new(PATH)).len(), 1);
    }

    #[tokio::test]
    async fn failing_body_rolls_back_and_surfaces_error() {
        let gateway = Arc::new(MockGateway::new());
        gateway.fail_when("INSERT", "UNIQUE constraint failed: t.id");
        let db = open_mock(&gateway).await;

        let err = db
            .transaction(true, |guard| {
                Box::pin(async move {
                    guard.execute("UPDATE t SET x = 1", &[]).await?;
                    guard.insert("INSERT INTO t VALUES (1)", &[]).await
                })
            })
            .await
            .unwrap_err();

        assert!(err.is_unique_constraint());
        let sql = gateway.executed_sql();
        assert_eq!(sql.first().map(String::as_str), Some("BEGIN EXCLUSIVE"));
        assert_eq!(sql.last().map(String::as_str), Some("ROLLBACK"));
        assert!(!sql.iter().any(|s| s == "COMMIT"));
    }

    #[tokio::test]
    async fn body_sees_current_transaction() {
        let gateway = Arc::new(MockGateway::new());
        let db = open_mock(&gateway).await;

        let seen = db
            .transaction(true, |guard| {
                Box::pin(async move { Ok(guard.current_transaction()) })
            })
            .await
            .unwrap()
            .unwrap();
        assert!(seen.exclusive());
        assert_eq!(seen.id(), 1);

        // Cleared after the transaction ends.
        let open_after = db
            .run_exclusive(|guard| Box::pin(async move { Ok(guard.in_transaction()) }))
            .await
            .unwrap();
        assert!(!open_after);
    }

    #[tokio::test]
    async fn nested_begin_is_rejected() {
        let gateway = Arc::new(MockGateway::new());
        let db = open_mock(&gateway).await;

        let err = db
            .transaction(false, |guard| Box::pin(async move { guard.begin(false).await }))
            .await
            .unwrap_err();
        assert!(matches!(err, LockstepError::Internal(_)));
        assert_eq!(gateway.executed_sql().last().map(String::as_str), Some("ROLLBACK"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn second_transaction_queues_behind_the_first() {
        let gateway = Arc::new(MockGateway::new().with_latency(Duration::from_millis(5)));
        let db = open_mock(&gateway).await;

        let a = {
            let db = db.clone();
            tokio::spawn(async move {
                db.transaction(true, |guard| {
                    Box::pin(async move {
                        guard.insert("INSERT INTO t VALUES ('a1')", &[]).await?;
                        guard.insert("INSERT INTO t VALUES ('a2')", &[]).await
                    })
                })
                .await
            })
        };
        let b = {
            let db = db.clone();
            tokio::spawn(async move {
                db.transaction(true, |guard| {
                    Box::pin(async move {
                        guard.insert("INSERT INTO t VALUES ('b1')", &[]).await?;
                        guard.insert("INSERT INTO t VALUES ('b2')", &[]).await
                    })
                })
                .await
            })
        };
        a.await.unwrap().unwrap();
        b.await.unwrap().unwrap();

        // Each BEGIN..COMMIT block is contiguous in the engine's log.
        let sql = gateway.executed_sql();
        assert_eq!(sql.len(), 8);
        for block in sql.chunks(4) {
            assert_eq!(block[0], "BEGIN EXCLUSIVE");
            assert_eq!(block[3], "COMMIT");
            let owner = &block[1][block[1].len() - 4..block[1].len() - 3];
            assert!(block[2].contains(&format!("'{owner}2'")));
        }
        assert_eq!(gateway.reentrancy_violations(), 0);
    }

    #[tokio::test]
    async fn bulk_insert_commits_every_row() {
        let gateway = Arc::new(MockGateway::new());
        let db = open_mock(&gateway).await;

        let count = db
            .insert_all("INSERT INTO t (n) VALUES (?)", rows(5))
            .await
            .unwrap();

        assert_eq!(count, 5);
        assert_eq!(gateway.committed_rows(Path::new(PATH)).len(), 5);
    }

    #[tokio::test]
    async fn bulk_insert_failure_rolls_back_whole_batch() {
        let gateway = Arc::new(MockGateway::new());
        gateway.fail_insert_at(3, "UNIQUE constraint failed: t.n");
        let db = open_mock(&gateway).await;

        let err = db
            .insert_all("INSERT INTO t (n) VALUES (?)", rows(5))
            .await
            .unwrap_err();

        assert!(err.is_unique_constraint());
        assert!(err.to_string().contains("t.n"));
        assert!(gateway.committed_rows(Path::new(PATH)).is_empty());
        // Rows after the failing one were never sent.
        assert_eq!(gateway.insert_count(), 3);
        assert_eq!(gateway.executed_sql().last().map(String::as_str), Some("ROLLBACK"));
    }

    #[tokio::test]
    async fn rollback_failure_is_reported_and_original_error_kept() {
        let gateway = Arc::new(MockGateway::new());
        gateway.fail_when("INSERT", "no such table: t");
        gateway.fail_when("ROLLBACK", "disk I/O error");
        let sink = Arc::new(CapturingSink::new());
        let db = Database::connect(gateway.clone(), sink.clone(), Path::new(PATH))
            .await
            .unwrap();

        let err = db
            .insert_all("INSERT INTO t VALUES (?)", rows(1))
            .await
            .unwrap_err();

        assert!(err.is_no_such_table());
        let events = sink.events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].action, CleanupAction::Rollback);
        assert!(events[0].message.contains("disk I/O error"));
    }

    #[tokio::test]
    async fn rejected_commit_rolls_back_so_the_next_transaction_can_begin() {
        let gateway = Arc::new(MockGateway::new());
        let db = open_mock(&gateway).await;
        gateway.fail_when("COMMIT", "database is locked");

        let err = db
            .insert_all("INSERT INTO t VALUES (?)", rows(2))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("database is locked"));
        assert_eq!(
            gateway.executed_sql()[3..],
            ["COMMIT".to_string(), "ROLLBACK".to_string()]
        );
        assert!(gateway.committed_rows(Path::new(PATH)).is_empty());

        // The engine left the transaction, so a fresh BEGIN succeeds.
        let open_after = db
            .run_exclusive(|guard| Box::pin(async move { Ok(guard.in_transaction()) }))
            .await
            .unwrap();
        assert!(!open_after);
        db.execute("BEGIN IMMEDIATE", &[]).await.unwrap();
        assert_eq!(gateway.reentrancy_violations(), 0);
    }

    #[tokio::test]
    async fn rollback_after_rejected_commit_reports_to_the_sink() {
        let gateway = Arc::new(MockGateway::new());
        gateway.fail_when("COMMIT", "database is locked");
        gateway.fail_when("ROLLBACK", "disk I/O error");
        let sink = Arc::new(CapturingSink::new());
        let db = Database::connect(gateway.clone(), sink.clone(), Path::new(PATH))
            .await
            .unwrap();

        let err = db
            .transaction(false, |guard| Box::pin(guard.execute("UPDATE t SET n = 1", &[])))
            .await
            .unwrap_err();

        assert!(err.to_string().contains("database is locked"));
        let events = sink.events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].action, CleanupAction::Rollback);
        assert!(events[0].message.contains("disk I/O error"));
    }

    #[tokio::test]
    async fn begin_failure_skips_body_and_end() {
        let gateway = Arc::new(MockGateway::new());
        gateway.fail_when("BEGIN", "database is locked");
        let db = open_mock(&gateway).await;

        let err = db
            .transaction(false, |guard| Box::pin(guard.execute("DELETE FROM t", &[])))
            .await
            .unwrap_err();

        assert!(err.to_string().contains("database is locked"));
        assert_eq!(gateway.executed_sql(), vec!["BEGIN IMMEDIATE"]);
    }

    #[tokio::test]
    async fn gateway_is_usable_as_trait_object() {
        let gateway: Arc<dyn EngineGateway> = Arc::new(MockGateway::new());
        let db = Database::connect(gateway, Arc::new(TracingSink), Path::new(PATH))
            .await
            .unwrap();
        assert_eq!(db.insert_all("INSERT INTO t VALUES (?)", Vec::new()).await.unwrap(), 0);
    }
}
