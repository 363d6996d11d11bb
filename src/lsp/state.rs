// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (C) 2026 Mark Wells <contact@markwells.dev>

//! Server lifecycle state and status reporting types.

use serde::Serialize;
use std::fmt;

use super::progress::ProgressSnapshot;

/// Lifecycle state of a server wrapper.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ServerState {
    /// Never started.
    NotStarted,
    /// Process is being spawned.
    Starting,
    /// `initialize` has been sent, waiting for the response.
    Initializing,
    /// Handshake complete, accepting work.
    Running,
    /// Shutdown in progress.
    Stopping,
    /// Stopped cleanly (or after a failed start).
    Stopped,
    /// The process exited or its output closed unexpectedly.
    Crashed,
}

impl ServerState {
    /// States from which `start()` may spawn a new process.
    #[must_use]
    pub const fn can_start(self) -> bool {
        matches!(self, Self::NotStarted | Self::Stopped | Self::Crashed)
    }

    /// States in which a live process exists (or is being brought up).
    #[must_use]
    pub const fn is_alive(self) -> bool {
        matches!(self, Self::Starting | Self::Initializing | Self::Running)
    }
}

impl fmt::Display for ServerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::NotStarted => "not started",
            Self::Starting => "starting",
            Self::Initializing => "initializing",
            Self::Running => "running",
            Self::Stopping => "stopping",
            Self::Stopped => "stopped",
            Self::Crashed => "crashed",
        };
        f.write_str(name)
    }
}

/// Detailed status for a single server wrapper.
#[derive(Debug, Clone, Serialize)]
pub struct ServerStatus {
    /// Definition id.
    pub server: String,
    /// Scope root the wrapper is bound to, `None` for singleton servers.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub root: Option<String>,
    /// Current lifecycle state.
    pub state: ServerState,
    /// Number of tracked documents.
    pub open_documents: usize,
    /// Active progress sessions.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub progress: Vec<ProgressSnapshot>,
    /// Seconds since the current process was started.
    pub uptime_secs: u64,
    /// Number of processes spawned over the wrapper's lifetime.
    pub spawn_count: u64,
}

impl ServerStatus {
    /// Returns the most significant active progress (lowest percentage first).
    #[must_use]
    pub fn primary_progress(&self) -> Option<&ProgressSnapshot> {
        self.progress
            .iter()
            .min_by_key(|p| p.percentage.unwrap_or(0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_start_eligibility() {
        assert!(ServerState::NotStarted.can_start());
        assert!(ServerState::Stopped.can_start());
        assert!(ServerState::Crashed.can_start());
        assert!(!ServerState::Running.can_start());
        assert!(!ServerState::Stopping.can_start());
        assert!(ServerState::Initializing.is_alive());
        assert!(!ServerState::Crashed.is_alive());
    }

    #[test]
    fn test_primary_progress_prefers_least_complete() {
        let status = ServerStatus {
            server: "rust".to_string(),
            root: None,
            state: ServerState::Running,
            open_documents: 0,
            progress: vec![
                ProgressSnapshot {
                    token: "indexing".to_string(),
                    title: "Indexing".to_string(),
                    message: None,
                    percentage: Some(50),
                },
                ProgressSnapshot {
                    token: "analyzing".to_string(),
                    title: "Analyzing".to_string(),
                    message: None,
                    percentage: Some(10),
                },
            ],
            uptime_secs: 3,
            spawn_count: 1,
        };
        assert_eq!(
            status.primary_progress().map(|p| p.title.as_str()),
            Some("Analyzing")
        );
        assert_eq!(ServerState::NotStarted.to_string(), "not started");
    }
}
