// SPDX-FileCopyrightText: 2026 Lockstep Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Serialized store handles for the Lockstep store.
//!
//! Provides a handle that runs every operation (whole transactions
//! included) one at a time, an open-time schema migration driven by
//! `PRAGMA user_version`, a single-instance factory, and a SQLite engine
//! gateway built on `tokio-rusqlite`.

pub mod adapter;
pub mod database;
pub mod factory;
pub mod migration;
pub mod transaction;

pub use adapter::SqliteGateway;
pub use database::{Database, HandleGuard};
pub use factory::DatabaseFactory;
pub use migration::{
    CreateCallback, DowngradeStrategy, HandleCallback, OpenOptions, VersionChangeCallback, open,
};
pub use transaction::Transaction;
