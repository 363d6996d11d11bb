// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (C) 2026 Mark Wells <contact@markwells.dev>

/// Client capabilities and server capability filters.
pub mod capabilities;
/// Process launch configuration and transports.
pub mod connection;
/// Fan-out of requests across matching servers.
pub mod executor;
/// The routing table from documents and projects to wrappers.
pub mod manager;
/// Work-done progress sessions.
pub mod progress;
/// JSON-RPC message types and framing.
pub mod protocol;
/// Server definitions and document selectors.
pub mod registry;
/// Request correlation, cancellation and the dispatcher loop.
pub mod rpc;
/// Server state and status reporting.
pub mod state;
/// Cancellable handles for spawned work.
pub mod task;
/// Lifecycle of one server process.
pub mod wrapper;

pub use capabilities::{Capability, CapabilityFilter};
pub use connection::{ProcessConnection, Transport};
pub use executor::{DocumentExecutor, ProjectExecutor, ServerResult};
pub use manager::{LanguageServers, WrapperKey};
pub use progress::{MonitorFactory, ProgressManager, ProgressMonitor, ProgressSnapshot};
pub use registry::{DocumentSelector, ServerDefinition, ServerRegistry};
pub use rpc::{LanguageServer, MessageHandler, RequestHandle};
pub use state::{ServerState, ServerStatus};
pub use task::Pending;
pub use wrapper::{ServerWrapper, WrapperOptions};
