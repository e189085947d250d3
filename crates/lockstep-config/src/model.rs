// SPDX-FileCopyrightText: 2026 Lockstep Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Configuration model structs for the Lockstep store.
//!
//! All structs use `#[serde(deny_unknown_fields)]` to reject unrecognized
//! config keys at startup, providing actionable error messages.

use serde::{Deserialize, Serialize};

/// Top-level Lockstep configuration.
///
/// Loaded from TOML files following XDG hierarchy, with environment variable overrides.
/// All sections are optional and default to sensible values.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct LockstepConfig {
    /// Storage engine settings.
    #[serde(default)]
    pub storage: StorageConfig,

    /// Open-time schema migration settings.
    #[serde(default)]
    pub migration: MigrationConfig,
}

/// Storage engine configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct StorageConfig {
    /// Path to the SQLite database file.
    #[serde(default = "default_database_path")]
    pub database_path: String,

    /// Enable WAL (Write-Ahead Logging) mode for SQLite.
    #[serde(default = "default_wal_mode")]
    pub wal_mode: bool,

    /// How long the engine waits on a locked database file, in milliseconds.
    #[serde(default = "default_busy_timeout_ms")]
    pub busy_timeout_ms: u64,

    /// Enforce foreign key constraints on every connection.
    #[serde(default = "default_foreign_keys")]
    pub foreign_keys: bool,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            database_path: default_database_path(),
            wal_mode: default_wal_mode(),
            busy_timeout_ms: default_busy_timeout_ms(),
            foreign_keys: default_foreign_keys(),
        }
    }
}

fn default_database_path() -> String {
    dirs::data_dir()
        .map(|p| p.join("lockstep").join("lockstep.db"))
        .unwrap_or_else(|| std::path::PathBuf::from("lockstep.db"))
        .to_string_lossy()
        .into_owned()
}

fn default_wal_mode() -> bool {
    true
}

fn default_busy_timeout_ms() -> u64 {
    5_000
}

fn default_foreign_keys() -> bool {
    true
}

/// What to do when the stored schema version is newer than the requested one.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DowngradePolicy {
    /// Refuse to open and report both versions.
    #[default]
    Reject,
    /// Destroy the store and run the create callback against a fresh one.
    DeleteAndRecreate,
    /// Rewrite the stored version without running any callback.
    Ignore,
}

/// Open-time schema migration configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct MigrationConfig {
    /// Downgrade handling for handles opened through the factory.
    #[serde(default)]
    pub downgrade: DowngradePolicy,

    /// Reuse one handle per path instead of opening a second connection.
    #[serde(default = "default_single_instance")]
    pub single_instance: bool,
}

impl Default for MigrationConfig {
    fn default() -> Self {
        Self {
            downgrade: DowngradePolicy::default(),
            single_instance: default_single_instance(),
        }
    }
}

fn default_single_instance() -> bool {
    true
}
