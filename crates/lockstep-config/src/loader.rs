// SPDX-FileCopyrightText: 2026 Lockstep Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Configuration loader using Figment for layered config merging.
//!
//! Supports XDG hierarchy: `./lockstep.toml` > `~/.config/lockstep/lockstep.toml` > `/etc/lockstep/lockstep.toml`
//! with environment variable overrides via `LOCKSTEP_` prefix.

#![allow(clippy::result_large_err)] // figment::Error is external and cannot be boxed without wrapper

use std::path::Path;

use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use tracing::debug;

use crate::model::LockstepConfig;

/// Load configuration from the standard XDG hierarchy with env var overrides.
///
/// Merge order (later overrides earlier):
/// 1. Compiled defaults
/// 2. `/etc/lockstep/lockstep.toml` (system-wide)
/// 3. `~/.config/lockstep/lockstep.toml` (user XDG config)
/// 4. `./lockstep.toml` (local directory)
/// 5. `LOCKSTEP_*` environment variables
pub fn load_config() -> Result<LockstepConfig, figment::Error> {
    let config: LockstepConfig = build_figment().extract()?;
    debug!(database_path = %config.storage.database_path, "configuration loaded");
    Ok(config)
}

/// Load configuration from a TOML string only (no XDG lookup, no env).
///
/// Used for testing and explicit configuration.
pub fn load_config_from_str(toml_content: &str) -> Result<LockstepConfig, figment::Error> {
    Figment::new()
        .merge(Serialized::defaults(LockstepConfig::default()))
        .merge(Toml::string(toml_content))
        .extract()
}

/// Load configuration from a specific file path with env var overrides.
pub fn load_config_from_path(path: &Path) -> Result<LockstepConfig, figment::Error> {
    Figment::new()
        .merge(Serialized::defaults(LockstepConfig::default()))
        .merge(Toml::file(path))
        .merge(env_provider())
        .extract()
}

/// Build the Figment used internally for config loading (exposed for diagnostic use).
///
/// Returns the Figment before extraction so callers can inspect metadata.
pub fn build_figment() -> Figment {
    Figment::new()
        .merge(Serialized::defaults(LockstepConfig::default()))
        .merge(Toml::file("/etc/lockstep/lockstep.toml"))
        .merge(Toml::file(
            dirs::config_dir()
                .map(|d| d.join("lockstep/lockstep.toml"))
                .unwrap_or_default(),
        ))
        .merge(Toml::file("lockstep.toml"))
        .merge(env_provider())
}

/// Create the environment variable provider using explicit `map()` for section-to-dot mapping.
///
/// Uses `Env::map()` rather than `Env::split("_")`: `LOCKSTEP_STORAGE_BUSY_TIMEOUT_MS`
/// must map to `storage.busy_timeout_ms`, not `storage.busy.timeout.ms`.
fn env_provider() -> Env {
    Env::prefixed("LOCKSTEP_").map(|key| {
        // Keys arrive with the variable's original case.
        let mapped = key
            .as_str()
            .to_ascii_lowercase()
            .replacen("storage_", "storage.", 1)
            .replacen("migration_", "migration.", 1);
        mapped.into()
    })
}
