// SPDX-FileCopyrightText: 2026 Lockstep Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! In-memory engine gateway for deterministic handle and migration tests.
//!
//! `MockGateway` models just enough of a transactional engine to observe the
//! handle's behavior: `BEGIN`/`COMMIT`/`ROLLBACK`, `PRAGMA user_version`, and
//! inserted rows (one row list per store, table names are ignored). Every call
//! is captured, failures can be scripted per statement, and overlapping calls
//! on one connection are counted as reentrancy violations.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;

use lockstep_core::{
    ConnectionId, EngineGateway, EngineOperation, HealthStatus, LockstepError, PluginAdapter, Row,
    Value,
};

/// A call received by the gateway, in arrival order.
#[derive(Debug, Clone, PartialEq)]
pub enum GatewayCall {
    Open(PathBuf),
    Close(ConnectionId),
    Execute(ConnectionId, String, Vec<Value>),
    Insert(ConnectionId, String, Vec<Value>),
    Update(ConnectionId, String, Vec<Value>),
    Query(ConnectionId, String, Vec<Value>),
    DeleteStore(PathBuf),
}

impl GatewayCall {
    /// The SQL text of statement calls.
    pub fn sql(&self) -> Option<&str> {
        match self {
            GatewayCall::Execute(_, sql, _)
            | GatewayCall::Insert(_, sql, _)
            | GatewayCall::Update(_, sql, _)
            | GatewayCall::Query(_, sql, _) => Some(sql),
            _ => None,
        }
    }
}

#[derive(Debug, Default)]
struct Store {
    version: u32,
    rows: Vec<Vec<Value>>,
}

#[derive(Debug, Default)]
struct Pending {
    version: Option<u32>,
    rows: Vec<Vec<Value>>,
}

#[derive(Debug)]
struct Connection {
    path: PathBuf,
    transaction: Option<Pending>,
}

#[derive(Debug, Default)]
struct State {
    stores: HashMap<PathBuf, Store>,
    connections: HashMap<u64, Connection>,
    next_connection: u64,
    calls: Vec<GatewayCall>,

    statement_failures: Vec<(String, String)>,
    insert_failures: HashMap<usize, String>,
    open_failure: Option<(usize, String)>,
    close_failure: Option<String>,
    delete_failure: Option<String>,
    query_responses: Vec<(String, Vec<Row>)>,

    opens: usize,
    inserts: usize,
    deleted: Vec<PathBuf>,

    in_flight: HashSet<u64>,
    active: usize,
    peak: usize,
    violations: usize,
}

/// A scripted, in-memory [`EngineGateway`].
#[derive(Debug, Default)]
pub struct MockGateway {
    state: Mutex<State>,
    latency: Option<Duration>,
}

impl MockGateway {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sleeps for `latency` inside every statement call, widening the window
    /// in which overlapping calls would be detected.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // --- scripting ---

    /// Fails every statement whose SQL contains `needle` with `message`.
    pub fn fail_when(&self, needle: &str, message: &str) {
        self.state()
            .statement_failures
            .push((needle.to_string(), message.to_string()));
    }

    /// Fails the `n`-th insert call (1-based, counted across all connections).
    pub fn fail_insert_at(&self, n: usize, message: &str) {
        self.state().insert_failures.insert(n, message.to_string());
    }

    /// Fails every open.
    pub fn fail_open(&self, message: &str) {
        self.fail_open_after(0, message);
    }

    /// Lets `successful` opens through, then fails every later one.
    pub fn fail_open_after(&self, successful: usize, message: &str) {
        self.state().open_failure = Some((successful, message.to_string()));
    }

    /// Fails every close. The connection is dropped regardless.
    pub fn fail_close(&self, message: &str) {
        self.state().close_failure = Some(message.to_string());
    }

    /// Fails every store deletion, leaving the store intact.
    pub fn fail_delete_store(&self, message: &str) {
        self.state().delete_failure = Some(message.to_string());
    }

    /// Returns `rows` for queries whose SQL contains `needle`.
    pub fn respond_to_query(&self, needle: &str, rows: Vec<Row>) {
        self.state()
            .query_responses
            .push((needle.to_string(), rows));
    }

    /// Sets the committed schema version of the store at `path`.
    pub fn seed_version(&self, path: &Path, version: u32) {
        self.state()
            .stores
            .entry(path.to_path_buf())
            .or_default()
            .version = version;
    }

    /// Adds a committed row to the store at `path`.
    pub fn seed_row(&self, path: &Path, row: Vec<Value>) {
        self.state()
            .stores
            .entry(path.to_path_buf())
            .or_default()
            .rows
            .push(row);
    }

    // --- inspection ---

    pub fn calls(&self) -> Vec<GatewayCall> {
        self.state().calls.clone()
    }

    /// SQL of every statement call, in arrival order (failed ones included).
    pub fn executed_sql(&self) -> Vec<String> {
        self.state()
            .calls
            .iter()
            .filter_map(GatewayCall::sql)
            .map(str::to_string)
            .collect()
    }

    pub fn committed_rows(&self, path: &Path) -> Vec<Vec<Value>> {
        self.state()
            .stores
            .get(path)
            .map(|store| store.rows.clone())
            .unwrap_or_default()
    }

    /// The committed schema version of the store at `path`.
    pub fn version(&self, path: &Path) -> u32 {
        self.state()
            .stores
            .get(path)
            .map_or(0, |store| store.version)
    }

    pub fn insert_count(&self) -> usize {
        self.state().inserts
    }

    pub fn open_connections(&self) -> usize {
        self.state().connections.len()
    }

    /// Paths whose stores were deleted, in order.
    pub fn deleted_stores(&self) -> Vec<PathBuf> {
        self.state().deleted.clone()
    }

    /// Number of calls that arrived while another call on the same
    /// connection was still in flight.
    pub fn reentrancy_violations(&self) -> usize {
        self.state().violations
    }

    /// Highest number of statement calls in flight at once, across connections.
    pub fn peak_concurrency(&self) -> usize {
        self.state().peak
    }

    // --- statement pipeline ---

    async fn statement<T>(
        &self,
        call: GatewayCall,
        connection: ConnectionId,
        apply: impl FnOnce(&mut State) -> Result<T, LockstepError>,
    ) -> Result<T, LockstepError> {
        {
            let mut state = self.state();
            state.calls.push(call);
            if !state.in_flight.insert(connection.0) {
                state.violations += 1;
            }
            state.active += 1;
            state.peak = state.peak.max(state.active);
        }

        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }

        let mut state = self.state();
        state.active -= 1;
        state.in_flight.remove(&connection.0);
        apply(&mut *state)
    }
}

fn closed(operation: EngineOperation) -> LockstepError {
    LockstepError::engine_message(operation, "database_closed")
}

impl State {
    fn scripted_failure(&self, operation: EngineOperation, sql: &str) -> Result<(), LockstepError> {
        match self
            .statement_failures
            .iter()
            .find(|(needle, _)| sql.contains(needle.as_str()))
        {
            Some((_, message)) => Err(LockstepError::engine_message(operation, message.clone())),
            None => Ok(()),
        }
    }

    fn connection(
        &mut self,
        operation: EngineOperation,
        connection: ConnectionId,
    ) -> Result<&mut Connection, LockstepError> {
        self.connections
            .get_mut(&connection.0)
            .ok_or_else(|| closed(operation))
    }

    fn execute(&mut self, connection: ConnectionId, sql: &str) -> Result<(), LockstepError> {
        let op = EngineOperation::Execute;
        self.connection(op, connection)?;
        self.scripted_failure(op, sql)?;

        let conn = self.connection(op, connection)?;
        let statement = sql.trim();
        if statement.starts_with("BEGIN") {
            if conn.transaction.is_some() {
                return Err(LockstepError::engine_message(
                    op,
                    "cannot start a transaction within a transaction",
                ));
            }
            conn.transaction = Some(Pending::default());
        } else if statement == "COMMIT" {
            let pending = conn.transaction.take().ok_or_else(|| {
                LockstepError::engine_message(op, "cannot commit - no transaction is active")
            })?;
            let path = conn.path.clone();
            let store = self.stores.entry(path).or_default();
            if let Some(version) = pending.version {
                store.version = version;
            }
            store.rows.extend(pending.rows);
        } else if statement == "ROLLBACK" {
            conn.transaction.take().ok_or_else(|| {
                LockstepError::engine_message(op, "cannot rollback - no transaction is active")
            })?;
        } else if let Some(raw) = statement.strip_prefix("PRAGMA user_version =") {
            let version = raw
                .trim()
                .parse::<u32>()
                .map_err(|e| LockstepError::engine(op, e))?;
            match conn.transaction.as_mut() {
                Some(pending) => pending.version = Some(version),
                None => {
                    let path = conn.path.clone();
                    self.stores.entry(path).or_default().version = version;
                }
            }
        }
        Ok(())
    }

    fn insert(
        &mut self,
        connection: ConnectionId,
        sql: &str,
        args: &[Value],
    ) -> Result<i64, LockstepError> {
        let op = EngineOperation::Insert;
        self.connection(op, connection)?;
        self.inserts += 1;
        if let Some(message) = self.insert_failures.get(&self.inserts) {
            return Err(LockstepError::engine_message(op, message.clone()));
        }
        self.scripted_failure(op, sql)?;

        let conn = self.connection(op, connection)?;
        let path = conn.path.clone();
        let pending_rows = match conn.transaction.as_mut() {
            Some(pending) => {
                pending.rows.push(args.to_vec());
                pending.rows.len()
            }
            None => {
                self.stores
                    .entry(path.clone())
                    .or_default()
                    .rows
                    .push(args.to_vec());
                0
            }
        };
        let committed = self.stores.get(&path).map_or(0, |store| store.rows.len());
        Ok((committed + pending_rows) as i64)
    }

    fn query(
        &mut self,
        connection: ConnectionId,
        sql: &str,
    ) -> Result<Vec<Row>, LockstepError> {
        let op = EngineOperation::Query;
        self.connection(op, connection)?;
        self.scripted_failure(op, sql)?;

        if sql.trim() == "PRAGMA user_version" {
            let conn = self.connection(op, connection)?;
            let pending = conn.transaction.as_ref().and_then(|p| p.version);
            let path = conn.path.clone();
            let version = pending.unwrap_or_else(|| {
                self.stores.get(&path).map_or(0, |store| store.version)
            });
            let mut row = Row::new();
            row.push("user_version", Value::from(version));
            return Ok(vec![row]);
        }

        Ok(self
            .query_responses
            .iter()
            .find(|(needle, _)| sql.contains(needle.as_str()))
            .map(|(_, rows)| rows.clone())
            .unwrap_or_default())
    }
}

#[async_trait]
impl PluginAdapter for MockGateway {
    fn name(&self) -> &str {
        "mock-gateway"
    }

    fn version(&self) -> semver::Version {
        semver::Version::new(0, 1, 0)
    }

    async fn health_check(&self) -> Result<HealthStatus, LockstepError> {
        Ok(HealthStatus::Healthy)
    }

    async fn shutdown(&self) -> Result<(), LockstepError> {
        self.state().connections.clear();
        Ok(())
    }
}

#[async_trait]
impl EngineGateway for MockGateway {
    async fn open(&self, path: &Path) -> Result<ConnectionId, LockstepError> {
        let mut state = self.state();
        state.calls.push(GatewayCall::Open(path.to_path_buf()));
        if let Some((successful, message)) = &state.open_failure
            && state.opens >= *successful
        {
            return Err(LockstepError::engine_message(
                EngineOperation::Open,
                message.clone(),
            ));
        }
        state.opens += 1;
        state.next_connection += 1;
        let id = state.next_connection;
        state.stores.entry(path.to_path_buf()).or_default();
        state.connections.insert(
            id,
            Connection {
                path: path.to_path_buf(),
                transaction: None,
            },
        );
        Ok(ConnectionId(id))
    }

    async fn close(&self, connection: ConnectionId) -> Result<(), LockstepError> {
        let mut state = self.state();
        state.calls.push(GatewayCall::Close(connection));
        if state.connections.remove(&connection.0).is_none() {
            return Err(closed(EngineOperation::Close));
        }
        match &state.close_failure {
            Some(message) => Err(LockstepError::engine_message(
                EngineOperation::Close,
                message.clone(),
            )),
            None => Ok(()),
        }
    }

    async fn execute(
        &self,
        connection: ConnectionId,
        sql: &str,
        args: &[Value],
    ) -> Result<(), LockstepError> {
        let call = GatewayCall::Execute(connection, sql.to_string(), args.to_vec());
        self.statement(call, connection, |state| state.execute(connection, sql))
            .await
    }

    async fn insert(
        &self,
        connection: ConnectionId,
        sql: &str,
        args: &[Value],
    ) -> Result<i64, LockstepError> {
        let call = GatewayCall::Insert(connection, sql.to_string(), args.to_vec());
        self.statement(call, connection, |state| state.insert(connection, sql, args))
            .await
    }

    /// Reports one affected row for every successful update.
    async fn update(
        &self,
        connection: ConnectionId,
        sql: &str,
        args: &[Value],
    ) -> Result<u64, LockstepError> {
        let call = GatewayCall::Update(connection, sql.to_string(), args.to_vec());
        self.statement(call, connection, |state| {
            let op = EngineOperation::Update;
            state.connection(op, connection)?;
            state.scripted_failure(op, sql)?;
            Ok(1)
        })
        .await
    }

    async fn query(
        &self,
        connection: ConnectionId,
        sql: &str,
        args: &[Value],
    ) -> Result<Vec<Row>, LockstepError> {
        let call = GatewayCall::Query(connection, sql.to_string(), args.to_vec());
        self.statement(call, connection, |state| state.query(connection, sql))
            .await
    }

    async fn delete_store(&self, path: &Path) -> Result<(), LockstepError> {
        let mut state = self.state();
        state.calls.push(GatewayCall::DeleteStore(path.to_path_buf()));
        if let Some(message) = &state.delete_failure {
            return Err(LockstepError::engine_message(
                EngineOperation::DeleteStore,
                message.clone(),
            ));
        }
        state.stores.remove(path);
        state.deleted.push(path.to_path_buf());
        Ok(())
    }
}
