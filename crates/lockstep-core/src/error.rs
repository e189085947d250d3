// SPDX-FileCopyrightText: 2026 Lockstep Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Error types for the Lockstep store.

use std::path::PathBuf;

use thiserror::Error;

use crate::types::{EngineOperation, MigrationStage};

/// The primary error type used across the gateway traits and handle operations.
#[derive(Debug, Error)]
pub enum LockstepError {
    /// Invalid caller arguments (version 0, callbacks without a version).
    ///
    /// Always raised before any engine I/O takes place.
    #[error("configuration error: {0}")]
    Config(String),

    /// A failure reported by the engine gateway (I/O, constraint, SQL error).
    #[error("engine error during {operation}: {message}")]
    Engine {
        operation: EngineOperation,
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// The stored schema version is newer than the requested one and the
    /// downgrade strategy refuses to go back.
    #[error("cannot downgrade schema from version {old} to {new}")]
    VersionDowngrade { old: u32, new: u32 },

    /// A create/upgrade/downgrade callback failed; the migration was rolled back.
    #[error("{stage} callback failed: {source}")]
    MigrationCallback {
        stage: MigrationStage,
        #[source]
        source: Box<LockstepError>,
    },

    /// The handle was closed before the operation was issued.
    #[error("database is closed: {}", path.display())]
    Closed { path: PathBuf },

    /// Internal or unexpected errors.
    #[error("internal error: {0}")]
    Internal(String),
}

impl LockstepError {
    /// Wrap an underlying engine error, keeping it as the source.
    pub fn engine<E>(operation: EngineOperation, error: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Self::Engine {
            operation,
            message: error.to_string(),
            source: Some(Box::new(error)),
        }
    }

    /// Build an engine error from a bare message.
    pub fn engine_message(operation: EngineOperation, message: impl Into<String>) -> Self {
        Self::Engine {
            operation,
            message: message.into(),
            source: None,
        }
    }

    /// Follows `MigrationCallback` wrappers down to the error that caused them.
    pub fn root_engine_error(&self) -> &LockstepError {
        match self {
            LockstepError::MigrationCallback { source, .. } => source.root_engine_error(),
            other => other,
        }
    }

    /// True for invalid-argument failures raised before any I/O.
    pub fn is_configuration(&self) -> bool {
        matches!(self, LockstepError::Config(_))
    }

    pub fn is_unique_constraint(&self) -> bool {
        self.engine_message_contains(&["UNIQUE constraint failed"])
    }

    pub fn is_no_such_table(&self) -> bool {
        self.engine_message_contains(&["no such table"])
    }

    pub fn is_syntax_error(&self) -> bool {
        self.engine_message_contains(&["syntax error"])
    }

    pub fn is_read_only(&self) -> bool {
        self.engine_message_contains(&["readonly database", "read-only"])
    }

    /// True when the engine failed to open the store.
    pub fn is_open_failed(&self) -> bool {
        matches!(
            self.root_engine_error(),
            LockstepError::Engine {
                operation: EngineOperation::Open,
                ..
            }
        )
    }

    /// True when the handle (or the engine's connection) was already closed.
    pub fn is_database_closed(&self) -> bool {
        matches!(self.root_engine_error(), LockstepError::Closed { .. })
            || self.engine_message_contains(&["database_closed", "database is closed"])
    }

    fn engine_message_contains(&self, needles: &[&str]) -> bool {
        match self.root_engine_error() {
            LockstepError::Engine { message, .. } => {
                let lowered = message.to_lowercase();
                needles
                    .iter()
                    .any(|needle| lowered.contains(&needle.to_lowercase()))
            }
            _ => false,
        }
    }
}
