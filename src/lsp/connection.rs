// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (C) 2026 Mark Wells <contact@markwells.dev>

//! Process-backed transports for language servers.
//!
//! A [`ProcessConnection`] describes how to launch a server; starting it
//! yields a [`Transport`] carrying the server's stdout (inbound), stdin
//! (outbound) and the child process handle. Transports can also be built
//! over arbitrary streams, which the tests use with in-memory pipes.

use std::collections::BTreeMap;
use std::hash::{Hash, Hasher};
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, BufReader};
use tokio::process::{Child, Command};
use tracing::{debug, warn};

use crate::error::{Error, Result};

/// Boxed inbound half of a transport.
pub type BoxReader = Box<dyn AsyncRead + Send + Unpin>;
/// Boxed outbound half of a transport.
pub type BoxWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Launch configuration for a server process.
///
/// Two connections are equal when they run the same command line in the
/// same working directory; environment overrides do not participate.
#[derive(Debug, Clone, Default)]
pub struct ProcessConnection {
    /// Program to execute.
    pub command: String,
    /// Program arguments.
    pub args: Vec<String>,
    /// Working directory, defaults to the scope root when unset.
    pub cwd: Option<PathBuf>,
    /// Extra environment variables.
    pub env: BTreeMap<String, String>,
}

impl PartialEq for ProcessConnection {
    fn eq(&self, other: &Self) -> bool {
        self.command == other.command && self.args == other.args && self.cwd == other.cwd
    }
}

impl Eq for ProcessConnection {}

impl Hash for ProcessConnection {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.command.hash(state);
        self.args.hash(state);
        self.cwd.hash(state);
    }
}

impl ProcessConnection {
    /// Creates a launch configuration for `command` with `args`.
    pub fn new(command: impl Into<String>, args: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            command: command.into(),
            args: args.into_iter().map(Into::into).collect(),
            cwd: None,
            env: BTreeMap::new(),
        }
    }

    /// Sets the working directory.
    #[must_use]
    pub fn with_cwd(mut self, cwd: impl Into<PathBuf>) -> Self {
        self.cwd = Some(cwd.into());
        self
    }

    /// Adds an environment override.
    #[must_use]
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    /// The full command line, for logs and status output.
    #[must_use]
    pub fn command_line(&self) -> String {
        std::iter::once(self.command.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }

    /// Spawns the server process.
    ///
    /// `fallback_cwd` is used when no working directory is configured.
    /// Stderr is drained line by line into the debug log.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Connection`] if the process cannot be created or has
    /// already exited by the time its pipes are captured.
    pub fn start(&self, server: &str, fallback_cwd: Option<&std::path::Path>) -> Result<Transport> {
        let connection_error = |reason: String| Error::Connection {
            server: server.to_string(),
            reason,
        };

        let mut cmd = Command::new(&self.command);
        cmd.args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        for (key, value) in &self.env {
            cmd.env(key, value);
        }

        if let Some(dir) = self.cwd.as_deref().or(fallback_cwd) {
            cmd.current_dir(dir);
        }

        let mut child = cmd
            .spawn()
            .map_err(|e| connection_error(format!("failed to spawn '{}': {e}", self.command)))?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| connection_error("failed to capture stdin".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| connection_error("failed to capture stdout".to_string()))?;

        if let Some(stderr) = child.stderr.take() {
            let server = server.to_string();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    debug!(server = %server, "stderr: {line}");
                }
            });
        }

        if let Ok(Some(status)) = child.try_wait() {
            return Err(connection_error(format!("process exited immediately ({status})")));
        }

        debug!(server, command = %self.command_line(), pid = ?child.id(), "spawned language server");

        Ok(Transport {
            reader: Box::new(stdout),
            writer: Box::new(stdin),
            process: Some(ServerProcess { child }),
        })
    }
}

/// The I/O halves of a server connection.
pub struct Transport {
    /// Messages from the server.
    pub reader: BoxReader,
    /// Messages to the server.
    pub writer: BoxWriter,
    /// The backing process, absent for stream transports.
    pub process: Option<ServerProcess>,
}

impl Transport {
    /// Wraps existing streams (sockets, in-memory pipes).
    pub fn from_streams(
        reader: impl AsyncRead + Send + Unpin + 'static,
        writer: impl AsyncWrite + Send + Unpin + 'static,
    ) -> Self {
        Self {
            reader: Box::new(reader),
            writer: Box::new(writer),
            process: None,
        }
    }
}

impl std::fmt::Debug for Transport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transport")
            .field("process", &self.process)
            .finish_non_exhaustive()
    }
}

/// A spawned server process.
#[derive(Debug)]
pub struct ServerProcess {
    child: Child,
}

impl ServerProcess {
    /// OS process id, if still known.
    #[must_use]
    pub fn id(&self) -> Option<u32> {
        self.child.id()
    }

    /// Waits up to `grace` for the process to exit on its own, then kills it.
    pub async fn terminate(mut self, grace: Duration) {
        match tokio::time::timeout(grace, self.child.wait()).await {
            Ok(Ok(status)) => debug!(%status, "language server exited"),
            Ok(Err(e)) => debug!("failed to wait for language server: {e}"),
            Err(_) => {
                debug!("language server did not exit within {grace:?}, killing");
                if let Err(e) = self.child.start_kill() {
                    warn!("failed to kill language server: {e}");
                }
                let _ = tokio::time::timeout(Duration::from_secs(2), self.child.wait()).await;
            }
        }
    }
}

#[cfg(test)]
#[allow(
    clippy::unwrap_used,
    clippy::expect_used,
    reason = "Tests use unwrap for clear failure messages"
)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_equality_ignores_env() {
        let a = ProcessConnection::new("rust-analyzer", ["--stdio"]).with_env("RUST_LOG", "debug");
        let b = ProcessConnection::new("rust-analyzer", ["--stdio"]);
        assert_eq!(a, b);

        let mut set = HashSet::new();
        set.insert(a);
        assert!(set.contains(&b));
    }

    #[test]
    fn test_equality_respects_cwd_and_args() {
        let base = ProcessConnection::new("pylsp", Vec::<String>::new());
        assert_ne!(base, base.clone().with_cwd("/tmp"));
        assert_ne!(base, ProcessConnection::new("pylsp", ["-v"]));
    }

    #[test]
    fn test_command_line() {
        let conn = ProcessConnection::new("gopls", ["serve", "-rpc.trace"]);
        assert_eq!(conn.command_line(), "gopls serve -rpc.trace");
    }

    #[tokio::test]
    async fn test_missing_binary_is_connection_error() {
        let conn = ProcessConnection::new("/nonexistent/tether-test-binary", Vec::<String>::new());
        let err = conn.start("missing", None).unwrap_err();
        assert!(matches!(err, Error::Connection { ref server, .. } if server == "missing"));
    }
}
