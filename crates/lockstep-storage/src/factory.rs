// SPDX-FileCopyrightText: 2026 Lockstep Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Factory owning a gateway, with one shared handle per path.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::Mutex;
use tracing::{debug, info};

use lockstep_config::{DowngradePolicy, LockstepConfig};
use lockstep_core::{CleanupAction, DiagnosticSink, EngineGateway, LockstepError, TracingSink};

use crate::database::Database;
use crate::migration::{self, DowngradeStrategy, OpenOptions};

/// The cached handle for one path. Its lock serializes opens, closes and
/// deletes of that path only.
type Slot = Arc<Mutex<Option<Database>>>;

/// Opens, caches and deletes stores through a single engine gateway.
///
/// With `single_instance` enabled, every `open` of a path that already has
/// an open handle returns that handle, and concurrent opens of one path
/// result in a single engine open. Different paths never wait on each other.
pub struct DatabaseFactory {
    gateway: Arc<dyn EngineGateway>,
    diagnostics: Arc<dyn DiagnosticSink>,
    single_instance: bool,
    default_downgrade: Option<DowngradePolicy>,
    default_path: Option<PathBuf>,
    // Slots are never removed, so every caller for a path shares one lock.
    handles: DashMap<PathBuf, Slot>,
}

impl DatabaseFactory {
    /// A single-instance factory with no configured downgrade policy.
    pub fn new(gateway: Arc<dyn EngineGateway>, diagnostics: Arc<dyn DiagnosticSink>) -> Self {
        Self {
            gateway,
            diagnostics,
            single_instance: true,
            default_downgrade: None,
            default_path: None,
            handles: DashMap::new(),
        }
    }

    /// A factory following the `[migration]` section, with
    /// `storage.database_path` as the default store.
    pub fn from_config(config: &LockstepConfig, gateway: Arc<dyn EngineGateway>) -> Self {
        Self {
            single_instance: config.migration.single_instance,
            default_downgrade: Some(config.migration.downgrade),
            default_path: Some(PathBuf::from(&config.storage.database_path)),
            ..Self::new(gateway, Arc::new(TracingSink))
        }
    }

    /// Opens `path`, or returns its cached handle when one is still open.
    ///
    /// `options` only take effect when a new handle is opened. When they
    /// request a version without choosing a downgrade strategy, the
    /// configured policy is used.
    pub async fn open(
        &self,
        path: impl AsRef<Path>,
        options: OpenOptions,
    ) -> Result<Database, LockstepError> {
        let path = path.as_ref();
        let options = self.with_defaults(options);
        if !self.single_instance {
            return migration::open(Arc::clone(&self.gateway), path, options).await;
        }

        let slot = self.slot(path);
        let mut cached = slot.lock().await;
        if let Some(db) = cached.as_ref()
            && db.is_open()
        {
            debug!(path = %path.display(), "reusing open handle");
            return Ok(db.clone());
        }
        *cached = None;

        let db = migration::open(Arc::clone(&self.gateway), path, options).await?;
        *cached = Some(db.clone());
        Ok(db)
    }

    /// Opens the configured `storage.database_path`.
    pub async fn open_default(&self, options: OpenOptions) -> Result<Database, LockstepError> {
        let path = self.default_path.clone().ok_or_else(|| {
            LockstepError::Config("factory has no configured database path".into())
        })?;
        self.open(path, options).await
    }

    /// Closes `db` and forgets it, so the next `open` of its path reconnects.
    pub async fn close(&self, db: &Database) {
        db.close().await;
        let Some(slot) = self.existing_slot(db.path()) else {
            return;
        };
        let mut cached = slot.lock().await;
        if cached.as_ref().is_some_and(|cached| cached.same_handle(db)) {
            *cached = None;
        }
    }

    /// Closes any cached handle for `path` and deletes the store's data.
    ///
    /// Best-effort: a deletion failure is reported to the diagnostic sink.
    pub async fn delete_database(&self, path: impl AsRef<Path>) {
        let path = path.as_ref();
        let slot = self.slot(path);
        let mut cached = slot.lock().await;
        if let Some(db) = cached.take() {
            db.close().await;
        }
        match self.gateway.delete_store(path).await {
            Ok(()) => info!(path = %path.display(), "database deleted"),
            Err(err) => self
                .diagnostics
                .cleanup_failed(CleanupAction::DeleteStore, path, &err),
        }
    }

    /// Whether a store file exists at `path`. In-memory paths never exist.
    pub async fn database_exists(&self, path: impl AsRef<Path>) -> bool {
        let path = path.as_ref();
        if path == Path::new(":memory:") {
            return false;
        }
        tokio::fs::try_exists(path).await.unwrap_or(false)
    }

    /// The slot for `path`, created on first use. The map guard is released
    /// before this returns.
    fn slot(&self, path: &Path) -> Slot {
        Arc::clone(self.handles.entry(path.to_path_buf()).or_default().value())
    }

    fn existing_slot(&self, path: &Path) -> Option<Slot> {
        self.handles.get(path).map(|entry| Arc::clone(entry.value()))
    }

    fn with_defaults(&self, mut options: OpenOptions) -> OpenOptions {
        if !options.has_diagnostics() {
            options = options.diagnostics(Arc::clone(&self.diagnostics));
        }
        if options.requested_version().is_some()
            && !options.has_downgrade_strategy()
            && let Some(policy) = self.default_downgrade
        {
            options = options.on_downgrade(DowngradeStrategy::from(policy));
        }
        options
    }
}
