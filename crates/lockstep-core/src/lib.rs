// SPDX-FileCopyrightText: 2026 Lockstep Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Core library for the Lockstep store.
//!
//! This crate provides the foundational trait definitions, error types, and
//! common types used throughout the Lockstep workspace. Engine gateways and
//! diagnostic sinks implement traits defined here.

pub mod error;
pub mod traits;
pub mod types;

// Re-export key items at crate root for ergonomic imports.
pub use error::LockstepError;
pub use types::{
    CleanupAction, ConnectionId, EngineOperation, HealthStatus, MigrationStage, Row, Value,
};

// Re-export all adapter traits at crate root.
pub use traits::{DiagnosticSink, EngineGateway, PluginAdapter, TracingSink};
