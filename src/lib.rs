// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (C) 2026 Mark Wells <contact@markwells.dev>

//! Tether manages the lifecycle of language server processes and routes
//! editor requests to them.
//!
//! A [`LanguageServers`] context owns every server for one host session.
//! Documents are routed to the servers whose selectors match them; servers
//! start lazily, and one request can be fanned out to all of them with
//! per-server failures isolated.

/// Command-line output helpers.
pub mod cli;
/// Layered configuration for timeouts, restart policy and servers.
pub mod config;
/// Document snapshots and path helpers.
pub mod document;
/// Error taxonomy shared by the whole crate.
pub mod error;
/// Editor features built on the executors.
pub mod features;
/// Server lifecycle, routing and the JSON-RPC connection.
pub mod lsp;

pub use document::DocumentSnapshot;
pub use error::{Error, Result};
pub use lsp::LanguageServers;
