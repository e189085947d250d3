// SPDX-FileCopyrightText: 2026 Lockstep Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Engine gateway trait: the request/response contract to the storage engine.

use std::path::Path;

use async_trait::async_trait;

use crate::error::LockstepError;
use crate::traits::adapter::PluginAdapter;
use crate::types::{ConnectionId, Row, Value};

/// Executes operations against a store identified by a [`ConnectionId`].
///
/// Every call is a potential suspension point. Implementations report
/// failures as [`LockstepError::Engine`]; callers pass them through unchanged.
/// Gateways are injected into each handle, so tests swap in doubles freely.
#[async_trait]
pub trait EngineGateway: PluginAdapter {
    /// Opens (creating if needed) the store at `path`.
    async fn open(&self, path: &Path) -> Result<ConnectionId, LockstepError>;

    /// Closes a connection. The id is invalid afterwards.
    async fn close(&self, connection: ConnectionId) -> Result<(), LockstepError>;

    /// Runs a statement that produces no result.
    async fn execute(
        &self,
        connection: ConnectionId,
        sql: &str,
        args: &[Value],
    ) -> Result<(), LockstepError>;

    /// Runs an insert and returns the last inserted row id.
    async fn insert(
        &self,
        connection: ConnectionId,
        sql: &str,
        args: &[Value],
    ) -> Result<i64, LockstepError>;

    /// Runs an update or delete and returns the number of affected rows.
    async fn update(
        &self,
        connection: ConnectionId,
        sql: &str,
        args: &[Value],
    ) -> Result<u64, LockstepError>;

    /// Runs a query and returns its rows in order.
    async fn query(
        &self,
        connection: ConnectionId,
        sql: &str,
        args: &[Value],
    ) -> Result<Vec<Row>, LockstepError>;

    /// Removes the store's backing data entirely.
    async fn delete_store(&self, path: &Path) -> Result<(), LockstepError>;
}
