// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (C) 2026 Mark Wells <contact@markwells.dev>

#![deny(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
//! End-to-end tests for the `tether` binary backed by `mockls`.

use std::path::{Path, PathBuf};
use std::process::{Command, Output};

use anyhow::{Context, Result};
use tempfile::TempDir;

const SOURCE: &str = "fn helper() {}\nfn main() { helper(); }\n";

struct Workspace {
    dir: TempDir,
}

impl Workspace {
    fn new() -> Result<Self> {
        let dir = tempfile::tempdir().context("Failed to create temp dir")?;
        std::fs::write(dir.path().join("Cargo.toml"), "[package]\nname = \"demo\"\n")?;
        std::fs::write(dir.path().join("main.rs"), SOURCE)?;
        Ok(Self { dir })
    }

    fn file(&self) -> PathBuf {
        self.dir.path().join("main.rs")
    }

    /// Runs `tether` with one mockls server for Rust files.
    fn tether(&self, mockls_args: &str, args: &[&str]) -> Result<Output> {
        let lsp = format!("rust:{} {mockls_args}", env!("CARGO_BIN_EXE_mockls"));
        let mut full = vec!["--lsp", lsp.as_str(), "--root", path_str(self.dir.path())?];
        full.extend_from_slice(args);
        self.run(&full)
    }

    fn run(&self, args: &[&str]) -> Result<Output> {
        Command::new(env!("CARGO_BIN_EXE_tether"))
            .args(args)
            .current_dir(self.dir.path())
            // Isolate from user-level config
            .env("XDG_CONFIG_HOME", self.dir.path())
            .env("RUST_LOG", "off")
            .output()
            .context("Failed to run tether")
    }
}

fn path_str(path: &Path) -> Result<&str> {
    path.to_str().context("non UTF-8 temp path")
}

fn stdout(output: &Output) -> String {
    String::from_utf8_lossy(&output.stdout).into_owned()
}

#[test]
fn test_hover_prints_server_text() -> Result<()> {
    let workspace = Workspace::new()?;
    let file = workspace.file();
    let output = workspace.tether("--tag alpha", &["hover", path_str(&file)?, "2", "14"])?;

    assert!(output.status.success(), "{output:?}");
    assert_eq!(stdout(&output).trim(), "alpha: `helper`");
    Ok(())
}

#[test]
fn test_definition_prints_location() -> Result<()> {
    let workspace = Workspace::new()?;
    let file = workspace.file();
    let output = workspace.tether("", &["definition", path_str(&file)?, "2", "14"])?;

    assert!(output.status.success(), "{output:?}");
    let text = stdout(&output);
    assert!(text.trim().ends_with("main.rs:1:1"), "unexpected output: {text}");
    Ok(())
}

#[test]
fn test_symbols_prints_outline() -> Result<()> {
    let workspace = Workspace::new()?;
    let file = workspace.file();
    let output = workspace.tether("", &["symbols", path_str(&file)?])?;

    assert!(output.status.success(), "{output:?}");
    let text = stdout(&output);
    let lines: Vec<&str> = text.lines().collect();
    assert_eq!(lines.len(), 2, "unexpected output: {text}");
    assert!(lines[0].starts_with("helper ["));
    assert!(lines[1].starts_with("main ["));
    assert!(lines[1].ends_with("line 2"));
    Ok(())
}

#[test]
fn test_status_lists_running_server() -> Result<()> {
    let workspace = Workspace::new()?;
    let file = workspace.file();
    let output = workspace.tether("", &["status", "--nocolor", path_str(&file)?])?;

    assert!(output.status.success(), "{output:?}");
    let text = stdout(&output);
    assert!(text.starts_with("SERVER"), "unexpected output: {text}");
    let row = text.lines().nth(1).context("missing status row")?;
    assert!(row.starts_with("rust"));
    assert!(row.contains("running"));
    Ok(())
}

#[test]
fn test_doctor_reports_capabilities() -> Result<()> {
    let workspace = Workspace::new()?;
    let config = workspace.dir.path().join("tether.toml");
    std::fs::write(
        &config,
        format!(
            "[server.mock]\ncommand = \"{}\"\nargs = [\"--disable\", \"hoverProvider\"]\n\n[server.ghost]\ncommand = \"tether-no-such-server\"\n",
            env!("CARGO_BIN_EXE_mockls")
        ),
    )?;

    let output = workspace.run(&["doctor", "--nocolor", "--config", path_str(&config)?])?;
    assert!(output.status.success(), "{output:?}");

    let text = stdout(&output);
    let ghost = text
        .lines()
        .find(|l| l.starts_with("ghost"))
        .context("ghost missing")?;
    assert!(ghost.contains("command not found"));

    let mock = text
        .lines()
        .position(|l| l.starts_with("mock"))
        .context("mock missing")?;
    let lines: Vec<&str> = text.lines().collect();
    assert!(lines[mock].contains("ready"));
    let capabilities: Vec<&str> = lines[mock + 1].split_whitespace().collect();
    assert!(capabilities.contains(&"Definition"));
    assert!(!capabilities.contains(&"Hover"));
    Ok(())
}

#[test]
fn test_invalid_lsp_spec_fails() -> Result<()> {
    let workspace = Workspace::new()?;
    let file = workspace.file();
    let output = workspace.run(&["--lsp", "no-colon", "symbols", path_str(&file)?])?;

    assert!(!output.status.success());
    assert!(String::from_utf8_lossy(&output.stderr).contains("Invalid LSP spec"));
    Ok(())
}

#[test]
fn test_unhandled_file_fails() -> Result<()> {
    let workspace = Workspace::new()?;
    let notes = workspace.dir.path().join("notes.txt");
    std::fs::write(&notes, "hello\n")?;
    let output = workspace.tether("", &["symbols", path_str(&notes)?])?;

    assert!(!output.status.success());
    assert!(String::from_utf8_lossy(&output.stderr).contains("No running language server"));
    Ok(())
}
