// SPDX-FileCopyrightText: 2026 Lockstep Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Open-time schema migration.
//!
//! [`open`] connects to a store, compares the stored `user_version` against the
//! requested version and runs at most one of the create/upgrade/downgrade
//! callbacks inside a single exclusive transaction, followed by the new
//! version. The open callback runs after that transaction has committed, so
//! its failure cannot undo the migration.

use std::fmt;
use std::path::Path;
use std::sync::Arc;

use futures::future::BoxFuture;
use tracing::{debug, info};

use lockstep_config::DowngradePolicy;
use lockstep_core::{DiagnosticSink, EngineGateway, LockstepError, MigrationStage, TracingSink};

use crate::database::{Database, HandleGuard};

/// Callback receiving the locked handle only.
pub type HandleCallback = Box<
    dyn for<'a> FnOnce(&'a mut HandleGuard) -> BoxFuture<'a, Result<(), LockstepError>> + Send,
>;

/// Callback receiving the locked handle and the requested version.
pub type CreateCallback = Box<
    dyn for<'a> FnOnce(&'a mut HandleGuard, u32) -> BoxFuture<'a, Result<(), LockstepError>>
        + Send,
>;

/// Callback receiving the locked handle, the stored version and the requested version.
pub type VersionChangeCallback = Box<
    dyn for<'a> FnOnce(&'a mut HandleGuard, u32, u32) -> BoxFuture<'a, Result<(), LockstepError>>
        + Send,
>;

/// How to handle a requested version lower than the stored one.
pub enum DowngradeStrategy {
    /// Fail with [`LockstepError::VersionDowngrade`]; the store is left untouched.
    Reject,
    /// Delete the store, reopen it empty, and run the create callback.
    DeleteAndRecreate,
    /// Write the requested version without running any callback.
    Ignore,
    /// Run a caller-supplied downgrade callback.
    Custom(VersionChangeCallback),
}

impl DowngradeStrategy {
    pub fn custom<F>(callback: F) -> Self
    where
        F: for<'a> FnOnce(&'a mut HandleGuard, u32, u32) -> BoxFuture<'a, Result<(), LockstepError>>
            + Send
            + 'static,
    {
        DowngradeStrategy::Custom(Box::new(callback))
    }
}

impl From<DowngradePolicy> for DowngradeStrategy {
    fn from(policy: DowngradePolicy) -> Self {
        match policy {
            DowngradePolicy::Reject => DowngradeStrategy::Reject,
            DowngradePolicy::DeleteAndRecreate => DowngradeStrategy::DeleteAndRecreate,
            DowngradePolicy::Ignore => DowngradeStrategy::Ignore,
        }
    }
}

impl fmt::Debug for DowngradeStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DowngradeStrategy::Reject => f.write_str("Reject"),
            DowngradeStrategy::DeleteAndRecreate => f.write_str("DeleteAndRecreate"),
            DowngradeStrategy::Ignore => f.write_str("Ignore"),
            DowngradeStrategy::Custom(_) => f.write_str("Custom(..)"),
        }
    }
}

/// Options for [`open`].
#[derive(Default)]
pub struct OpenOptions {
    version: Option<u32>,
    on_configure: Option<HandleCallback>,
    on_create: Option<CreateCallback>,
    on_upgrade: Option<VersionChangeCallback>,
    on_downgrade: Option<DowngradeStrategy>,
    on_open: Option<HandleCallback>,
    diagnostics: Option<Arc<dyn DiagnosticSink>>,
}

impl fmt::Debug for OpenOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OpenOptions")
            .field("version", &self.version)
            .field("on_configure", &self.on_configure.is_some())
            .field("on_create", &self.on_create.is_some())
            .field("on_upgrade", &self.on_upgrade.is_some())
            .field("on_downgrade", &self.on_downgrade)
            .field("on_open", &self.on_open.is_some())
            .finish_non_exhaustive()
    }
}

impl OpenOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Requests schema management at `version` (must be greater than 0).
    pub fn version(mut self, version: u32) -> Self {
        self.version = Some(version);
        self
    }

    /// Runs right after the engine opens the store, before any version check.
    pub fn on_configure<F>(mut self, callback: F) -> Self
    where
        F: for<'a> FnOnce(&'a mut HandleGuard) -> BoxFuture<'a, Result<(), LockstepError>>
            + Send
            + 'static,
    {
        self.on_configure = Some(Box::new(callback));
        self
    }

    /// Runs when the store has no schema yet (stored version 0).
    pub fn on_create<F>(mut self, callback: F) -> Self
    where
        F: for<'a> FnOnce(&'a mut HandleGuard, u32) -> BoxFuture<'a, Result<(), LockstepError>>
            + Send
            + 'static,
    {
        self.on_create = Some(Box::new(callback));
        self
    }

    /// Runs when the requested version is higher than the stored one, and
    /// for a fresh store when no create callback is set.
    pub fn on_upgrade<F>(mut self, callback: F) -> Self
    where
        F: for<'a> FnOnce(&'a mut HandleGuard, u32, u32) -> BoxFuture<'a, Result<(), LockstepError>>
            + Send
            + 'static,
    {
        self.on_upgrade = Some(Box::new(callback));
        self
    }

    /// Selects the downgrade handling. Without one, a downgrade just
    /// rewrites the stored version.
    pub fn on_downgrade(mut self, strategy: DowngradeStrategy) -> Self {
        self.on_downgrade = Some(strategy);
        self
    }

    /// Runs after the version transaction, still under the handle's lock.
    pub fn on_open<F>(mut self, callback: F) -> Self
    where
        F: for<'a> FnOnce(&'a mut HandleGuard) -> BoxFuture<'a, Result<(), LockstepError>>
            + Send
            + 'static,
    {
        self.on_open = Some(Box::new(callback));
        self
    }

    /// Sink for best-effort cleanup failures. Defaults to [`TracingSink`].
    pub fn diagnostics(mut self, sink: Arc<dyn DiagnosticSink>) -> Self {
        self.diagnostics = Some(sink);
        self
    }

    pub(crate) fn requested_version(&self) -> Option<u32> {
        self.version
    }

    pub(crate) fn has_downgrade_strategy(&self) -> bool {
        self.on_downgrade.is_some()
    }

    pub(crate) fn has_diagnostics(&self) -> bool {
        self.diagnostics.is_some()
    }

    /// Rejects invalid combinations before any engine I/O.
    fn validate(&self) -> Result<(), LockstepError> {
        match self.version {
            Some(0) => Err(LockstepError::Config(
                "schema version must be greater than 0".into(),
            )),
            Some(_) => Ok(()),
            None if self.on_create.is_some()
                || self.on_upgrade.is_some()
                || self.on_downgrade.is_some() =>
            {
                Err(LockstepError::Config(
                    "create/upgrade/downgrade callbacks require a schema version".into(),
                ))
            }
            None => Ok(()),
        }
    }
}

/// The version-change part of the options, applied inside the transaction.
struct MigrationPlan {
    version: u32,
    on_create: Option<CreateCallback>,
    on_upgrade: Option<VersionChangeCallback>,
    on_downgrade: Option<DowngradeStrategy>,
}

fn callback_failed(stage: MigrationStage) -> impl FnOnce(LockstepError) -> LockstepError {
    move |err| LockstepError::MigrationCallback {
        stage,
        source: Box::new(err),
    }
}

impl MigrationPlan {
    async fn apply(self, db: &mut HandleGuard) -> Result<(), LockstepError> {
        let MigrationPlan {
            version,
            on_create,
            on_upgrade,
            on_downgrade,
        } = self;

        let stored = db.version().await?;
        if stored == version {
            debug!(version, "schema version unchanged");
            return Ok(());
        }

        if stored == 0 {
            if let Some(create) = on_create {
                create(&mut *db, version)
                    .await
                    .map_err(callback_failed(MigrationStage::Create))?;
            } else if let Some(upgrade) = on_upgrade {
                upgrade(&mut *db, 0, version)
                    .await
                    .map_err(callback_failed(MigrationStage::Upgrade))?;
            }
        } else if version > stored {
            if let Some(upgrade) = on_upgrade {
                upgrade(&mut *db, stored, version)
                    .await
                    .map_err(callback_failed(MigrationStage::Upgrade))?;
            }
        } else {
            match on_downgrade {
                None | Some(DowngradeStrategy::Ignore) => {}
                Some(DowngradeStrategy::Reject) => {
                    return Err(LockstepError::VersionDowngrade {
                        old: stored,
                        new: version,
                    });
                }
                Some(DowngradeStrategy::Custom(downgrade)) => {
                    downgrade(&mut *db, stored, version)
                        .await
                        .map_err(callback_failed(MigrationStage::Downgrade))?;
                }
                Some(DowngradeStrategy::DeleteAndRecreate) => {
                    db.recreate_store().await?;
                    if let Some(create) = on_create {
                        create(&mut *db, version)
                            .await
                            .map_err(callback_failed(MigrationStage::Create))?;
                    }
                }
            }
        }

        db.set_version(version).await?;
        info!(from = stored, to = version, "schema version updated");
        Ok(())
    }
}

/// Opens the store at `path` and reconciles its schema version.
///
/// Without a version the handle is returned as-is after `on_configure`:
/// there is no version bookkeeping and `on_open` is not invoked. Any
/// failure after the engine open closes the handle (best-effort) before
/// the error is returned; a failed migration leaves the store rolled back.
pub async fn open(
    gateway: Arc<dyn EngineGateway>,
    path: impl AsRef<Path>,
    mut options: OpenOptions,
) -> Result<Database, LockstepError> {
    options.validate()?;
    let path = path.as_ref();
    let diagnostics = options
        .diagnostics
        .take()
        .unwrap_or_else(|| Arc::new(TracingSink));

    let db = Database::connect(gateway, diagnostics, path).await?;
    let mut guard = db.lock().await;
    if let Err(err) = run_open_sequence(&mut guard, options).await {
        guard.close_best_effort().await;
        return Err(err);
    }
    drop(guard);
    Ok(db)
}

async fn run_open_sequence(
    guard: &mut HandleGuard,
    options: OpenOptions,
) -> Result<(), LockstepError> {
    let OpenOptions {
        version,
        on_configure,
        on_create,
        on_upgrade,
        on_downgrade,
        on_open,
        ..
    } = options;

    if let Some(configure) = on_configure {
        configure(&mut *guard).await?;
    }

    let Some(version) = version else {
        if on_open.is_some() {
            debug!(path = %guard.path().display(), "no schema version requested; open callback skipped");
        }
        return Ok(());
    };

    let plan = MigrationPlan {
        version,
        on_create,
        on_upgrade,
        on_downgrade,
    };
    guard
        .run_in_transaction(true, move |db| Box::pin(plan.apply(db)))
        .await?;

    if let Some(on_open) = on_open {
        on_open(&mut *guard).await?;
    }
    Ok(())
}
