// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (C) 2026 Mark Wells <contact@markwells.dev>

#![deny(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
//! Configuration files flowing through to running servers.

mod common;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use tempfile::TempDir;

use common::{Project, received};
use tether_lsp::LanguageServers;
use tether_lsp::config::{Config, LaunchMode, RestartPolicy};
use tether_lsp::lsp::ServerState;

fn write_config(dir: &TempDir, body: &str) -> Result<std::path::PathBuf> {
    let path = dir.path().join("tether.toml");
    std::fs::write(&path, body).context("Failed to write config")?;
    Ok(path)
}

fn mockls_table(id: &str, extra: &str) -> String {
    format!(
        "[server.{id}]\ncommand = \"{}\"\nargs = [\"--tag\", \"{id}\"]\n{extra}\n",
        env!("CARGO_BIN_EXE_mockls")
    )
}

#[test]
fn test_explicit_file_sets_timeouts_and_servers() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let body = format!(
        "request_timeout_ms = 1234\nrestart_policy = \"eager\"\nmax_restarts = 7\n\n{}{}",
        mockls_table("zeta", "languages = [\"rust\"]\nmode = \"singleton\""),
        mockls_table("alpha", "patterns = [\"**/*.py\"]\nstop_when_unused = true"),
    );
    let config = Config::load(Some(&write_config(&dir, &body)?))?;

    assert_eq!(config.request_timeout(), Duration::from_millis(1234));
    assert_eq!(config.restart_policy, RestartPolicy::Eager);
    assert_eq!(config.max_restarts, 7);

    let ids: Vec<&str> = config.server.keys().map(String::as_str).collect();
    assert_eq!(ids, ["alpha", "zeta"]);
    let zeta = config.server.get("zeta").context("zeta missing")?;
    assert_eq!(zeta.mode, LaunchMode::Singleton);
    assert_eq!(zeta.args, ["--tag", "zeta"]);
    assert!(config.server.get("alpha").is_some_and(|s| s.stop_when_unused));
    Ok(())
}

#[test]
fn test_invalid_files_are_rejected() -> Result<()> {
    let dir = tempfile::tempdir()?;

    let empty_command = write_config(&dir, "[server.broken]\ncommand = \"  \"\n")?;
    match Config::load(Some(&empty_command)) {
        Err(e) => assert!(format!("{e:#}").contains("empty command")),
        Ok(_) => bail!("empty command accepted"),
    }

    let bad_policy = write_config(&dir, "restart_policy = \"sometimes\"\n")?;
    assert!(Config::load(Some(&bad_policy)).is_err());

    let bad_glob = Config::from_toml("[server.a]\ncommand = \"a\"\npatterns = [\"[\"]\n")?;
    assert!(LanguageServers::from_config(bad_glob).is_err());
    Ok(())
}

#[tokio::test]
async fn test_configured_servers_route_by_selector() -> Result<()> {
    let body = format!(
        "shutdown_grace_ms = 1000\n\n{}{}",
        mockls_table(
            "rusty",
            "languages = [\"rust\"]\nlanguage_ids = { \"**/generated/**\" = \"rust-generated\" }"
        ),
        mockls_table("snake", "patterns = [\"**/*.py\"]"),
    );
    let config = Config::from_toml(&body)?;
    let servers = Arc::new(LanguageServers::from_config(config)?);

    let project = Project::new()?;
    std::fs::create_dir(project.root().join("generated"))?;
    let document = project.document("generated/out.rs", "fn out() {}\n")?;

    let wrappers = servers.connect_document(&document).await;
    assert_eq!(wrappers.len(), 1);
    assert_eq!(wrappers[0].server_id(), "rusty");
    assert_eq!(wrappers[0].state(), ServerState::Running);

    let server = wrappers[0]
        .language_server()
        .context("rusty is not running")?;
    let opened = received(&server).await?;
    let open = opened
        .iter()
        .find(|n| n.method == "textDocument/didOpen")
        .context("no didOpen recorded")?;
    assert_eq!(open.language_id.as_deref(), Some("rust-generated"));
    assert_eq!(open.uri.as_deref(), Some(document.uri.as_str()));

    servers.shutdown_all().await;
    Ok(())
}
