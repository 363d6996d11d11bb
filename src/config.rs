// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (C) 2026 Mark Wells <contact@markwells.dev>

//! Layered configuration: defaults, user file, explicit file, environment.

use anyhow::{Context, Result, bail};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// What to do with a server that crashed.
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum RestartPolicy {
    /// Stay crashed until `start()` is called explicitly.
    Never,
    /// Restart lazily on the next request.
    #[default]
    OnDemand,
    /// Restart as soon as the crash is detected.
    Eager,
}

/// How many wrappers a definition gets.
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum LaunchMode {
    /// One wrapper for the whole workspace.
    Singleton,
    /// One wrapper per project root.
    #[default]
    PerProject,
}

/// Top-level settings.
#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    /// Upper bound for any request, in milliseconds (default: 30000)
    #[serde(default = "default_request_timeout")]
    pub request_timeout_ms: u64,

    /// Upper bound for the `initialize` handshake, in milliseconds (default: 30000)
    #[serde(default = "default_request_timeout")]
    pub init_timeout_ms: u64,

    /// Time a server gets to answer `shutdown` and exit (default: 5000)
    #[serde(default = "default_shutdown_grace")]
    pub shutdown_grace_ms: u64,

    /// Hover deadline (default: 500)
    #[serde(default = "default_hover_timeout")]
    pub hover_timeout_ms: u64,

    /// Document link deadline (default: 800)
    #[serde(default = "default_link_timeout")]
    pub link_timeout_ms: u64,

    /// How often progress monitors are polled for cancellation (default: 1000)
    #[serde(default = "default_progress_poll")]
    pub progress_poll_ms: u64,

    /// Restart behaviour after a crash
    #[serde(default)]
    pub restart_policy: RestartPolicy,

    /// Restarts allowed per wrapper before giving up (default: 3)
    #[serde(default = "default_max_restarts")]
    pub max_restarts: u32,

    /// Server definitions keyed by id (e.g., "rust-analyzer", "pylsp").
    /// Iteration order is the registry order.
    #[serde(default)]
    pub server: BTreeMap<String, ServerConfig>,
}

/// One `[server.<id>]` table.
#[derive(Debug, Deserialize, Clone, Default)]
pub struct ServerConfig {
    /// The command to execute (e.g., "rust-analyzer")
    pub command: String,

    /// Arguments to pass to the command
    #[serde(default)]
    pub args: Vec<String>,

    /// Working directory, defaults to the project root
    #[serde(default)]
    pub cwd: Option<PathBuf>,

    /// Extra environment variables
    #[serde(default)]
    pub env: BTreeMap<String, String>,

    /// Language ids this server handles (e.g., "rust")
    #[serde(default)]
    pub languages: Vec<String>,

    /// File globs this server handles (e.g., "**/*.rs")
    #[serde(default)]
    pub patterns: Vec<String>,

    /// `singleton` or `per_project`
    #[serde(default)]
    pub mode: LaunchMode,

    /// Initialization options to pass to the LSP server
    #[serde(default)]
    pub initialization_options: Option<serde_json::Value>,

    /// Display name
    #[serde(default)]
    pub label: Option<String>,

    /// Log every frame at trace level
    #[serde(default)]
    pub log_traffic: bool,

    /// Glob → language id overrides for documents sent to this server
    #[serde(default)]
    pub language_ids: BTreeMap<String, String>,

    /// Stop the process when its last document is closed
    #[serde(default)]
    pub stop_when_unused: bool,
}

impl ServerConfig {
    /// Shorthand for a server launched with `command` and `args`.
    pub fn command(command: impl Into<String>, args: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            command: command.into(),
            args: args.into_iter().map(Into::into).collect(),
            ..Self::default()
        }
    }

    /// Adds handled language ids.
    #[must_use]
    pub fn languages(mut self, languages: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.languages.extend(languages.into_iter().map(Into::into));
        self
    }

    /// Adds handled file globs.
    #[must_use]
    pub fn patterns(mut self, patterns: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.patterns.extend(patterns.into_iter().map(Into::into));
        self
    }

    /// Sets the launch mode.
    #[must_use]
    pub const fn mode(mut self, mode: LaunchMode) -> Self {
        self.mode = mode;
        self
    }
}

const fn default_request_timeout() -> u64 {
    30_000
}

const fn default_shutdown_grace() -> u64 {
    5_000
}

const fn default_hover_timeout() -> u64 {
    500
}

const fn default_link_timeout() -> u64 {
    800
}

const fn default_progress_poll() -> u64 {
    1_000
}

const fn default_max_restarts() -> u32 {
    3
}

impl Default for Config {
    fn default() -> Self {
        Self {
            request_timeout_ms: default_request_timeout(),
            init_timeout_ms: default_request_timeout(),
            shutdown_grace_ms: default_shutdown_grace(),
            hover_timeout_ms: default_hover_timeout(),
            link_timeout_ms: default_link_timeout(),
            progress_poll_ms: default_progress_poll(),
            restart_policy: RestartPolicy::default(),
            max_restarts: default_max_restarts(),
            server: BTreeMap::new(),
        }
    }
}

impl Config {
    /// Load configuration from standard paths or a specific file.
    ///
    /// # Errors
    ///
    /// Returns an error if a source cannot be read or does not deserialize.
    pub fn load(explicit_file: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();

        // 1. Start with defaults
        builder = builder
            .set_default("request_timeout_ms", default_request_timeout())?
            .set_default("init_timeout_ms", default_request_timeout())?
            .set_default("shutdown_grace_ms", default_shutdown_grace())?
            .set_default("hover_timeout_ms", default_hover_timeout())?
            .set_default("link_timeout_ms", default_link_timeout())?
            .set_default("progress_poll_ms", default_progress_poll())?
            .set_default("restart_policy", "on_demand")?
            .set_default("max_restarts", default_max_restarts())?;

        // 2. Load from user config directory (~/.config/tether/config.toml)
        if let Some(config_dir) = dirs::config_dir() {
            let config_path = config_dir.join("tether").join("config.toml");
            if config_path.exists() {
                builder = builder.add_source(config::File::from(config_path));
            }
        }

        // 3. Load from explicit file if provided
        if let Some(path) = explicit_file {
            builder = builder.add_source(config::File::from(path));
        }

        // 4. Load from environment variables (TETHER_REQUEST_TIMEOUT_MS, etc.)
        builder = builder.add_source(config::Environment::with_prefix("TETHER"));

        let config: Self = builder
            .build()
            .context("Failed to build configuration")?
            .try_deserialize()
            .context("Failed to deserialize configuration")?;
        config.validate()?;
        Ok(config)
    }

    /// Parses a TOML document on top of the defaults.
    ///
    /// # Errors
    ///
    /// Returns an error if the document does not deserialize.
    pub fn from_toml(source: &str) -> Result<Self> {
        let config: Self = config::Config::builder()
            .add_source(config::File::from_str(source, config::FileFormat::Toml))
            .build()
            .context("Failed to build configuration")?
            .try_deserialize()
            .context("Failed to deserialize configuration")?;
        config.validate()?;
        Ok(config)
    }

    /// Adds or replaces a server definition.
    #[must_use]
    pub fn with_server(mut self, id: impl Into<String>, server: ServerConfig) -> Self {
        self.server.insert(id.into(), server);
        self
    }

    fn validate(&self) -> Result<()> {
        for (id, server) in &self.server {
            if server.command.trim().is_empty() {
                bail!("server '{id}' has an empty command");
            }
        }
        if self.progress_poll_ms == 0 {
            bail!("progress_poll_ms must be greater than zero");
        }
        Ok(())
    }

    /// Upper bound for any request.
    #[must_use]
    pub const fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    /// Upper bound for the `initialize` handshake.
    #[must_use]
    pub const fn init_timeout(&self) -> Duration {
        Duration::from_millis(self.init_timeout_ms)
    }

    /// Time a server gets to shut down before it is killed.
    #[must_use]
    pub const fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }

    /// Hover deadline.
    #[must_use]
    pub const fn hover_timeout(&self) -> Duration {
        Duration::from_millis(self.hover_timeout_ms)
    }

    /// Document link deadline.
    #[must_use]
    pub const fn link_timeout(&self) -> Duration {
        Duration::from_millis(self.link_timeout_ms)
    }

    /// Progress cancellation poll interval.
    #[must_use]
    pub const fn progress_poll(&self) -> Duration {
        Duration::from_millis(self.progress_poll_ms)
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

    #[test]
    fn test_defaults() {
        let config = Config::from_toml("").unwrap();
        assert_eq!(config.request_timeout(), Duration::from_secs(30));
        assert_eq!(config.shutdown_grace(), Duration::from_secs(5));
        assert_eq!(config.hover_timeout(), Duration::from_millis(500));
        assert_eq!(config.link_timeout(), Duration::from_millis(800));
        assert_eq!(config.restart_policy, RestartPolicy::OnDemand);
        assert_eq!(config.max_restarts, 3);
        assert!(config.server.is_empty());
    }

    #[test]
    fn test_server_table() {
        let config = Config::from_toml(
            r#"
            restart_policy = "never"
            hover_timeout_ms = 250

            [server.rust-analyzer]
            command = "rust-analyzer"
            languages = ["rust"]
            patterns = ["**/*.rs"]
            stop_when_unused = true

            [server.taplo]
            command = "taplo"
            args = ["lsp", "stdio"]
            mode = "singleton"
            initialization_options = { formatter = { alignEntries = true } }
            "#,
        )
        .unwrap();

        assert_eq!(config.restart_policy, RestartPolicy::Never);
        assert_eq!(config.hover_timeout(), Duration::from_millis(250));

        let ids: Vec<&str> = config.server.keys().map(String::as_str).collect();
        assert_eq!(ids, ["rust-analyzer", "taplo"]);

        let ra = &config.server["rust-analyzer"];
        assert_eq!(ra.mode, LaunchMode::PerProject);
        assert!(ra.stop_when_unused);

        let taplo = &config.server["taplo"];
        assert_eq!(taplo.mode, LaunchMode::Singleton);
        assert_eq!(taplo.args, ["lsp", "stdio"]);
        assert!(taplo.initialization_options.is_some());
    }

    #[test]
    fn test_empty_command_rejected() {
        let err = Config::from_toml("[server.broken]\ncommand = \" \"\n").unwrap_err();
        assert!(err.to_string().contains("broken"));
    }
}
