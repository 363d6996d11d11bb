// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (C) 2026 Mark Wells <contact@markwells.dev>

//! Tether CLI.
//!
//! Runs one editor feature against the configured language servers for a
//! file and prints the merged result, or reports server health.

#![allow(clippy::print_stdout, reason = "CLI tool needs to output to stdout")]
#![allow(clippy::print_stderr, reason = "CLI tool needs to output to stderr")]

use anyhow::{Context, Result, anyhow};
use clap::{Parser, Subcommand};
use lsp_types::Position;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::debug;
use tracing_subscriber::EnvFilter;

use tether_lsp::cli::{self, ColorConfig, ColumnWidths};
use tether_lsp::config::{Config, ServerConfig};
use tether_lsp::features;
use tether_lsp::lsp::{Capability, ServerWrapper, WrapperOptions};
use tether_lsp::{DocumentSnapshot, LanguageServers};

/// Command-line arguments for Tether.
#[derive(Parser, Debug)]
#[command(name = "tether")]
#[command(about = "Language server lifecycle and multi-server request routing")]
#[command(version = env!("TETHER_VERSION"))]
struct Args {
    /// The subcommand to run.
    #[command(subcommand)]
    command: Command,

    /// LSP servers in "id:command" format (e.g., "rust:rust-analyzer").
    /// The id doubles as the handled language. Can be specified multiple
    /// times; these override/append to the config file.
    #[arg(short, long = "lsp", global = true)]
    lsps: Vec<String>,

    /// Path to configuration file.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Project root, instead of detecting it from the file.
    #[arg(short, long, global = true)]
    root: Option<PathBuf>,
}

/// Subcommands supported by Tether.
#[derive(Subcommand, Debug)]
enum Command {
    /// Show hover information from every server handling the file.
    Hover {
        /// File to query.
        file: PathBuf,
        /// Line (1-based).
        line: u32,
        /// Column (1-based).
        column: u32,
    },

    /// Find definitions across every server handling the file.
    Definition {
        /// File to query.
        file: PathBuf,
        /// Line (1-based).
        line: u32,
        /// Column (1-based).
        column: u32,
    },

    /// Print the outline of a file from the first server that has one.
    Symbols {
        /// File to query.
        file: PathBuf,
    },

    /// Open files on their servers and print the status table.
    Status {
        /// Files to open.
        #[arg(required = true)]
        files: Vec<PathBuf>,

        /// Disable colored output.
        #[arg(long)]
        nocolor: bool,
    },

    /// Start every configured server once and report its capabilities.
    Doctor {
        /// Disable colored output.
        #[arg(long)]
        nocolor: bool,
    },
}

/// Entry point for the Tether binary.
///
/// # Errors
///
/// Returns an error if the configuration is invalid or the subcommand fails.
#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("tether=info".parse()?))
        .with_writer(std::io::stderr)
        .init();

    let config = load_config(args.config.as_deref(), &args.lsps)?;
    let root = args
        .root
        .map(|r| r.canonicalize())
        .transpose()
        .context("Invalid --root")?;

    match args.command {
        Command::Hover { file, line, column } => {
            run_hover(config, &file, root, position(line, column)?).await
        }
        Command::Definition { file, line, column } => {
            run_definition(config, &file, root, position(line, column)?).await
        }
        Command::Symbols { file } => run_symbols(config, &file, root).await,
        Command::Status { files, nocolor } => run_status(config, &files, root, nocolor).await,
        Command::Doctor { nocolor } => run_doctor(config, root, nocolor).await,
    }
}

/// Loads the layered configuration and merges `--lsp` overrides.
fn load_config(path: Option<&Path>, lsps: &[String]) -> Result<Config> {
    let mut config = Config::load(path)?;

    for lsp_spec in lsps {
        let (id, command_str) = lsp_spec
            .split_once(':')
            .ok_or_else(|| anyhow!("Invalid LSP spec: {lsp_spec}. Expected 'id:command'"))?;

        let id = id.trim().to_string();
        let mut parts = command_str.split_whitespace();
        let program = parts
            .next()
            .ok_or_else(|| anyhow!("command cannot be empty"))?
            .to_string();

        let server = ServerConfig::command(program, parts).languages([id.clone()]);
        config.server.insert(id, server);
    }

    Ok(config)
}

/// Converts a 1-based line and column into an LSP position.
fn position(line: u32, column: u32) -> Result<Position> {
    if line == 0 || column == 0 {
        return Err(anyhow!("line and column are 1-based"));
    }
    Ok(Position::new(line - 1, column - 1))
}

async fn open_document(
    servers: &LanguageServers,
    file: &Path,
    root: Option<PathBuf>,
) -> Result<DocumentSnapshot> {
    let mut document = DocumentSnapshot::from_path(file)
        .await
        .with_context(|| format!("Failed to read {}", file.display()))?;
    if let Some(root) = root {
        document = document.with_root(root);
    }

    let connected = servers.connect_document(&document).await;
    if connected.is_empty() {
        return Err(anyhow!(
            "No running language server handles {} ({})",
            file.display(),
            document.language_id
        ));
    }
    debug!(servers = connected.len(), "document opened");
    Ok(document)
}

async fn run_hover(config: Config, file: &Path, root: Option<PathBuf>, at: Position) -> Result<()> {
    let servers = Arc::new(LanguageServers::from_config(config)?);
    let result = match open_document(&servers, file, root).await {
        Ok(document) => features::hover(&servers, &document, at)
            .await
            .map_err(anyhow::Error::from),
        Err(e) => Err(e),
    };
    servers.shutdown_all().await;

    let hovers = result?;
    if hovers.is_empty() {
        println!("No hover information available");
    } else {
        let text: Vec<String> = hovers.iter().map(features::format_hover).collect();
        println!("{}", text.join("\n\n---\n\n"));
    }
    Ok(())
}

async fn run_definition(
    config: Config,
    file: &Path,
    root: Option<PathBuf>,
    at: Position,
) -> Result<()> {
    let servers = Arc::new(LanguageServers::from_config(config)?);
    let result = match open_document(&servers, file, root).await {
        Ok(document) => features::definition(&servers, &document, at)
            .await
            .map_err(anyhow::Error::from),
        Err(e) => Err(e),
    };
    servers.shutdown_all().await;

    let locations = result?;
    if locations.is_empty() {
        println!("No definition found");
    }
    for location in &locations {
        println!("{}", features::format_location(location));
    }
    Ok(())
}

async fn run_symbols(config: Config, file: &Path, root: Option<PathBuf>) -> Result<()> {
    let servers = Arc::new(LanguageServers::from_config(config)?);
    let result = match open_document(&servers, file, root).await {
        Ok(document) => features::document_symbols(&servers, &document)
            .await
            .map_err(anyhow::Error::from),
        Err(e) => Err(e),
    };
    servers.shutdown_all().await;

    match result? {
        Some(symbols) => println!("{}", features::format_document_symbols(&symbols)),
        None => println!("No symbols found"),
    }
    Ok(())
}

async fn run_status(
    config: Config,
    files: &[PathBuf],
    root: Option<PathBuf>,
    nocolor: bool,
) -> Result<()> {
    let servers = Arc::new(LanguageServers::from_config(config)?);
    for file in files {
        if let Err(e) = open_document(&servers, file, root.clone()).await {
            eprintln!("{e:#}");
        }
    }

    let colors = ColorConfig::new(nocolor);
    let widths = ColumnWidths::calculate(cli::terminal_width());
    let statuses = servers.statuses();
    if statuses.is_empty() {
        println!("No language servers matched.");
    } else {
        println!("{}", cli::status_header(&widths, &colors));
        for status in &statuses {
            println!("{}", cli::status_row(status, &widths, &colors));
        }
    }

    servers.shutdown_all().await;
    Ok(())
}

async fn run_doctor(config: Config, root: Option<PathBuf>, nocolor: bool) -> Result<()> {
    let colors = ColorConfig::new(nocolor);

    println!("Tether {}", env!("TETHER_VERSION"));
    println!();

    let root = match root {
        Some(root) => root,
        None => std::env::current_dir()?.canonicalize()?,
    };
    println!("{} {}", colors.bold("Root:"), root.display());
    println!();

    let servers = LanguageServers::from_config(config.clone())?;
    let definitions = servers.registry().definitions();
    if definitions.is_empty() {
        println!("No language servers configured.");
        return Ok(());
    }

    let max_id_width = definitions.iter().map(|d| d.id.len()).max().unwrap_or(10);
    let max_cmd_width = definitions
        .iter()
        .map(|d| d.launch.command.len())
        .max()
        .unwrap_or(10);

    for definition in definitions {
        let id_display = format!("{:<max_id_width$}", definition.id);
        let cmd_display = format!("{:<max_cmd_width$}", definition.launch.command);

        if !binary_exists(&definition.launch.command) {
            println!(
                "{}  {}  {}",
                id_display,
                cmd_display,
                colors.red("✗ command not found"),
            );
            continue;
        }

        let wrapper = ServerWrapper::new(
            Arc::clone(definition),
            Some(root.clone()),
            WrapperOptions::from(&config),
        );
        match wrapper.start().await {
            Ok(()) => {
                let supported: Vec<String> = wrapper
                    .capabilities()
                    .map(|caps| {
                        Capability::ALL
                            .iter()
                            .filter(|c| c.is_supported(&caps))
                            .map(ToString::to_string)
                            .collect()
                    })
                    .unwrap_or_default();
                println!("{}  {}  {}", id_display, cmd_display, colors.green("✓ ready"));
                if !supported.is_empty() {
                    println!(
                        "{}  {}",
                        " ".repeat(max_id_width + max_cmd_width + 4),
                        colors.dim(&supported.join(" ")),
                    );
                }
            }
            Err(e) => {
                println!(
                    "{}  {}  {}",
                    id_display,
                    cmd_display,
                    colors.red(&format!("✗ {e}")),
                );
            }
        }
        wrapper.stop().await;
    }

    Ok(())
}

/// Checks whether a binary can be found on `$PATH`.
fn binary_exists(command: &str) -> bool {
    // If the command contains a path separator, check it directly
    if command.contains('/') {
        return Path::new(command).exists();
    }

    let path_var = std::env::var("PATH").unwrap_or_default();
    std::env::split_paths(&path_var).any(|dir| dir.join(command).is_file())
}
