// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (C) 2026 Mark Wells <contact@markwells.dev>

//! Shared helpers for integration tests that drive `mockls`.

#![allow(dead_code, reason = "Each test binary uses a subset of the helpers")]

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use serde::Deserialize;
use serde_json::Value;
use tempfile::TempDir;

use tether_lsp::config::{Config, RestartPolicy};
use tether_lsp::document::path_to_uri;
use tether_lsp::lsp::{
    LanguageServer, ProcessConnection, ServerDefinition, ServerRegistry, WrapperOptions,
};
use tether_lsp::{DocumentSnapshot, LanguageServers};

/// A definition that launches `mockls` with `args` for every document.
pub fn mockls(id: &str, args: &[&str]) -> ServerDefinition {
    ServerDefinition::new(
        id,
        ProcessConnection::new(env!("CARGO_BIN_EXE_mockls"), args.iter().copied()),
    )
}

/// Settings with deadlines short enough for tests.
pub fn fast_config() -> Config {
    Config {
        request_timeout_ms: 5_000,
        init_timeout_ms: 5_000,
        shutdown_grace_ms: 1_000,
        hover_timeout_ms: 2_000,
        link_timeout_ms: 2_000,
        progress_poll_ms: 50,
        ..Config::default()
    }
}

pub fn fast_options() -> WrapperOptions {
    WrapperOptions::from(&fast_config())
}

pub fn options_with_policy(policy: RestartPolicy) -> WrapperOptions {
    WrapperOptions {
        restart_policy: policy,
        ..fast_options()
    }
}

/// A routing table over `definitions`.
pub fn servers(definitions: Vec<ServerDefinition>) -> Result<Arc<LanguageServers>> {
    let registry = ServerRegistry::new(definitions)?;
    Ok(Arc::new(LanguageServers::new(registry, fast_config())))
}

/// A throwaway project directory.
pub struct Project {
    dir: TempDir,
}

impl Project {
    pub fn new() -> Result<Self> {
        let dir = tempfile::tempdir().context("Failed to create temp dir")?;
        std::fs::write(dir.path().join("Cargo.toml"), "[package]\nname = \"demo\"\n")
            .context("Failed to write project marker")?;
        Ok(Self { dir })
    }

    pub fn root(&self) -> &Path {
        self.dir.path()
    }

    /// Writes `name` and returns a snapshot rooted at this project.
    pub fn document(&self, name: &str, text: &str) -> Result<DocumentSnapshot> {
        let path = self.dir.path().join(name);
        std::fs::write(&path, text).with_context(|| format!("Failed to write {name}"))?;
        let uri = path_to_uri(&path)?;
        Ok(DocumentSnapshot::new(uri, "rust", text).with_root(self.dir.path()))
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Received {
    pub method: String,
    pub uri: Option<String>,
    pub language_id: Option<String>,
}

/// Notifications `mockls` has received so far, in order.
pub async fn received(server: &LanguageServer) -> Result<Vec<Received>> {
    let value: Value = server
        .request("mockls/receivedNotifications", Value::Null)
        .await?;
    serde_json::from_value(value).context("Failed to decode received notifications")
}

pub async fn count(server: &LanguageServer, method: &str) -> Result<usize> {
    Ok(received(server)
        .await?
        .iter()
        .filter(|n| n.method == method)
        .count())
}

/// Polls `check` until it returns true or two seconds pass.
pub async fn eventually(what: &str, mut check: impl FnMut() -> bool) -> Result<()> {
    for _ in 0..40 {
        if check() {
            return Ok(());
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    bail!("timed out waiting for {what}")
}

/// Polls until `server` has received `method` exactly `expected` times.
pub async fn eventually_count(server: &LanguageServer, method: &str, expected: usize) -> Result<()> {
    let mut seen = 0;
    for _ in 0..40 {
        seen = count(server, method).await?;
        if seen == expected {
            return Ok(());
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    bail!("expected {expected} {method}, saw {seen}")
}
