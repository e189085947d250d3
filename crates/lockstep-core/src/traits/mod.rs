// SPDX-FileCopyrightText: 2026 Lockstep Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Trait definitions for the pluggable seams of the store.
//!
//! Gateways extend the [`PluginAdapter`] base trait and use
//! `#[async_trait]` for dynamic dispatch compatibility.

pub mod adapter;
pub mod diagnostics;
pub mod gateway;

pub use adapter::PluginAdapter;
pub use diagnostics::{DiagnosticSink, TracingSink};
pub use gateway::EngineGateway;
