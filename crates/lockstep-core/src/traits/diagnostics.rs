// SPDX-FileCopyrightText: 2026 Lockstep Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Diagnostic sink for failures that must be reported but never propagated.

use std::path::Path;

use tracing::warn;

use crate::error::LockstepError;
use crate::types::CleanupAction;

/// Receives best-effort cleanup failures (close on a failure path, store deletion).
///
/// These never replace the primary error; the sink is the only place they surface.
pub trait DiagnosticSink: Send + Sync + 'static {
    fn cleanup_failed(&self, action: CleanupAction, path: &Path, error: &LockstepError);
}

/// Default sink: emits a `warn!` event through `tracing`.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingSink;

impl DiagnosticSink for TracingSink {
    fn cleanup_failed(&self, action: CleanupAction, path: &Path, error: &LockstepError) {
        warn!(
            action = %action,
            path = %path.display(),
            error = %error,
            "best-effort cleanup failed"
        );
    }
}
