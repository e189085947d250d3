// SPDX-FileCopyrightText: 2026 Lockstep Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Test doubles for Lockstep.
//!
//! # Components
//!
//! - [`MockGateway`] - In-memory engine gateway with scripted failures and call capture
//! - [`CapturingSink`] - Diagnostic sink that records cleanup failures

pub mod capturing_sink;
pub mod mock_gateway;

pub use capturing_sink::{CapturingSink, CleanupEvent};
pub use mock_gateway::{GatewayCall, MockGateway};
