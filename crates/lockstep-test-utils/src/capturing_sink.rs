// SPDX-FileCopyrightText: 2026 Lockstep Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Diagnostic sink that keeps every reported cleanup failure.

use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use lockstep_core::{CleanupAction, DiagnosticSink, LockstepError};

/// One reported cleanup failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CleanupEvent {
    pub action: CleanupAction,
    pub path: PathBuf,
    /// The error's display text.
    pub message: String,
}

#[derive(Debug, Default)]
pub struct CapturingSink {
    events: Mutex<Vec<CleanupEvent>>,
}

impl CapturingSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Events in the order they were reported.
    pub fn events(&self) -> Vec<CleanupEvent> {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl DiagnosticSink for CapturingSink {
    fn cleanup_failed(&self, action: CleanupAction, path: &Path, error: &LockstepError) {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(CleanupEvent {
                action,
                path: path.to_path_buf(),
                message: error.to_string(),
            });
    }
}
