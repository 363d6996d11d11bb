// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (C) 2026 Mark Wells <contact@markwells.dev>

#![deny(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
//! Routing and fan-out tests across several `mockls` instances.

mod common;

use std::time::Duration;

use anyhow::{Context, Result, bail};
use lsp_types::{
    DocumentSymbolResponse, HoverParams, Position, TextDocumentIdentifier,
    TextDocumentPositionParams, WorkDoneProgressParams,
};
use tokio_util::sync::CancellationToken;

use common::{Project, eventually, eventually_count, mockls, servers};
use tether_lsp::config::LaunchMode;
use tether_lsp::lsp::{Capability, LanguageServer, ServerState, ServerWrapper};
use tether_lsp::{DocumentSnapshot, Error, features};

const SOURCE: &str = "fn main() {}\nfn helper() {}\n";

fn hover_params(document: &DocumentSnapshot) -> HoverParams {
    HoverParams {
        text_document_position_params: TextDocumentPositionParams {
            text_document: TextDocumentIdentifier {
                uri: document.uri.clone(),
            },
            position: Position::new(0, 1),
        },
        work_done_progress_params: WorkDoneProgressParams::default(),
    }
}

fn rpc(wrapper: &ServerWrapper) -> Result<LanguageServer> {
    wrapper
        .language_server()
        .with_context(|| format!("{} is not running", wrapper.server_id()))
}

#[tokio::test]
async fn test_hover_merges_results_in_registry_order() -> Result<()> {
    let servers = servers(vec![
        mockls("gamma", &["--tag", "gamma"]),
        mockls("alpha", &["--tag", "alpha"]),
        mockls("beta", &["--fail-on", "textDocument/hover"]),
    ])?;
    let project = Project::new()?;
    let document = project.document("main.rs", SOURCE)?;
    assert_eq!(servers.connect_document(&document).await.len(), 3);

    let hovers = features::hover(&servers, &document, Position::new(0, 1)).await?;
    let text: Vec<String> = hovers.iter().map(features::format_hover).collect();
    assert_eq!(text, ["alpha: `fn`", "gamma: `fn`"]);

    servers.shutdown_all().await;
    Ok(())
}

#[tokio::test]
async fn test_collect_all_fails_when_every_server_fails() -> Result<()> {
    let servers = servers(vec![
        mockls("alpha", &["--fail-on", "textDocument/hover"]),
        mockls("beta", &["--fail-on", "textDocument/hover"]),
    ])?;
    let project = Project::new()?;
    let document = project.document("main.rs", SOURCE)?;

    match features::hover(&servers, &document, Position::new(0, 1)).await {
        Err(Error::Response { code, .. }) => assert_eq!(code, -32603),
        other => bail!("expected a server error, got {other:?}"),
    }

    servers.shutdown_all().await;
    Ok(())
}

#[tokio::test]
async fn test_no_matching_server_yields_empty_result() -> Result<()> {
    let mut python = mockls("python", &[]);
    python.selector = tether_lsp::lsp::DocumentSelector::new(&["python".to_string()], &[])?;
    let servers = servers(vec![python])?;
    let project = Project::new()?;
    let document = project.document("main.rs", SOURCE)?;

    assert!(servers.for_document(&document).wrappers().is_empty());
    let hovers = features::hover(&servers, &document, Position::new(0, 1)).await?;
    assert!(hovers.is_empty());
    assert!(servers.statuses().is_empty());
    Ok(())
}

#[tokio::test]
async fn test_compute_first_ignores_cancelled_servers() -> Result<()> {
    let servers = servers(vec![
        mockls("alpha", &["--cancel-on", "textDocument/documentSymbol"]),
        mockls("beta", &[]),
    ])?;
    let project = Project::new()?;
    let document = project.document("main.rs", SOURCE)?;

    let symbols = features::document_symbols(&servers, &document)
        .await?
        .context("expected symbols from beta")?;
    let DocumentSymbolResponse::Nested(symbols) = symbols else {
        bail!("mockls answers with nested symbols");
    };
    let names: Vec<&str> = symbols.iter().map(|s| s.name.as_str()).collect();
    assert_eq!(names, ["main", "helper"]);

    servers.shutdown_all().await;
    Ok(())
}

#[tokio::test]
async fn test_compute_first_with_only_cancelled_servers_is_empty() -> Result<()> {
    let servers = servers(vec![
        mockls("alpha", &["--cancel-on", "textDocument/documentSymbol"]),
        mockls("beta", &["--cancel-on", "textDocument/documentSymbol"]),
    ])?;
    let project = Project::new()?;
    let document = project.document("main.rs", SOURCE)?;

    assert!(features::document_symbols(&servers, &document).await?.is_none());
    servers.shutdown_all().await;
    Ok(())
}

#[tokio::test]
async fn test_capability_filter_skips_servers() -> Result<()> {
    let servers = servers(vec![
        mockls("alpha", &[]),
        mockls("beta", &["--disable", "hoverProvider"]),
    ])?;
    let project = Project::new()?;
    let document = project.document("main.rs", SOURCE)?;

    let params = hover_params(&document);
    let results = servers
        .for_document(&document)
        .with_capability(Capability::Hover)
        .compute_all(move |server: LanguageServer| server.hover(params.clone()));
    assert_eq!(results.len(), 2);

    let mut answered = Vec::new();
    for run in results {
        if run.result.await?.is_some() {
            answered.push(run.server);
        }
    }
    assert_eq!(answered, ["alpha"]);

    servers.shutdown_all().await;
    Ok(())
}

#[tokio::test]
async fn test_cancelling_fan_out_cancels_every_request() -> Result<()> {
    let servers = servers(vec![
        mockls("alpha", &["--hang-on", "textDocument/hover"]),
        mockls("beta", &["--hang-on", "textDocument/hover"]),
    ])?;
    let project = Project::new()?;
    let document = project.document("main.rs", SOURCE)?;
    let wrappers = servers.connect_document(&document).await;
    assert_eq!(wrappers.len(), 2);

    let token = CancellationToken::new();
    let params = hover_params(&document);
    let pending = servers
        .for_document(&document)
        .with_cancellation(&token)
        .collect_all(move |server: LanguageServer| server.hover(params.clone()));

    for wrapper in &wrappers {
        let server = rpc(wrapper)?;
        eventually("hover in flight", || server.pending_count() == 1).await?;
    }
    token.cancel();
    assert!(matches!(pending.await, Err(Error::Cancelled)));

    for wrapper in &wrappers {
        let server = rpc(wrapper)?;
        eventually_count(&server, "$/cancelRequest", 1).await?;
        assert_eq!(server.pending_count(), 0);
    }

    servers.shutdown_all().await;
    Ok(())
}

#[tokio::test]
async fn test_slow_server_does_not_delay_dispatch() -> Result<()> {
    let servers = servers(vec![
        mockls("fast", &["--tag", "fast"]),
        mockls("slow", &["--tag", "slow", "--response-delay", "300"]),
    ])?;
    let project = Project::new()?;
    let document = project.document("main.rs", SOURCE)?;
    servers.connect_document(&document).await;

    let params = hover_params(&document);
    let started = std::time::Instant::now();
    let pending = servers
        .for_document(&document)
        .collect_all(move |server: LanguageServer| server.hover(params.clone()));
    assert!(started.elapsed() < Duration::from_millis(50));

    let hovers = pending.await?;
    let text: Vec<String> = hovers.iter().map(features::format_hover).collect();
    assert_eq!(text, ["fast: `fn`", "slow: `fn`"]);

    servers.shutdown_all().await;
    Ok(())
}

#[tokio::test]
async fn test_close_document_closes_on_every_server() -> Result<()> {
    let servers = servers(vec![mockls("alpha", &[]), mockls("beta", &[])])?;
    let project = Project::new()?;
    let document = project.document("main.rs", SOURCE)?;

    let first = servers.connect_document(&document).await;
    servers.connect_document(&document).await;
    servers.close_document(&document.uri);
    for wrapper in &first {
        assert!(wrapper.is_connected_to(&document.uri));
    }

    servers.close_document(&document.uri);
    for wrapper in &first {
        assert!(!wrapper.is_connected_to(&document.uri));
        let server = rpc(wrapper)?;
        eventually_count(&server, "textDocument/didOpen", 1).await?;
        eventually_count(&server, "textDocument/didClose", 1).await?;
    }

    servers.shutdown_all().await;
    Ok(())
}

#[tokio::test]
async fn test_editor_takes_over_document_opened_for_a_request() -> Result<()> {
    let servers = servers(vec![mockls("alpha", &[])])?;
    let project = Project::new()?;
    let document = project.document("main.rs", SOURCE)?;

    let hovers = features::hover(&servers, &document, Position::new(0, 1)).await?;
    assert_eq!(hovers.len(), 1);
    let wrapper = servers
        .wrappers_for_document(&document)
        .pop()
        .context("no wrapper for document")?;
    assert!(wrapper.is_connected_to(&document.uri));

    servers.connect_document(&document).await;
    servers.close_document(&document.uri);
    assert!(!wrapper.is_connected_to(&document.uri));

    let server = rpc(&wrapper)?;
    eventually_count(&server, "textDocument/didOpen", 1).await?;
    eventually_count(&server, "textDocument/didClose", 1).await?;

    servers.shutdown_all().await;
    Ok(())
}

#[tokio::test]
async fn test_changes_reach_every_bound_server() -> Result<()> {
    let servers = servers(vec![mockls("alpha", &[]), mockls("beta", &[])])?;
    let project = Project::new()?;
    let document = project.document("main.rs", SOURCE)?;
    let wrappers = servers.connect_document(&document).await;

    servers.change_document(&document.uri, "fn renamed() {}\n");
    servers.save_document(&document.uri, None);
    for wrapper in &wrappers {
        let server = rpc(wrapper)?;
        eventually_count(&server, "textDocument/didChange", 1).await?;
        eventually_count(&server, "textDocument/didSave", 1).await?;
    }

    servers.shutdown_all().await;
    Ok(())
}

#[tokio::test]
async fn test_per_project_servers_are_separate() -> Result<()> {
    let servers = servers(vec![mockls("alpha", &[])])?;
    let first = Project::new()?;
    let second = Project::new()?;

    let a = servers
        .connect_document(&first.document("a.rs", SOURCE)?)
        .await;
    let b = servers
        .connect_document(&second.document("b.rs", SOURCE)?)
        .await;
    assert!(!a[0].same_as(&b[0]));
    assert_eq!(servers.statuses().len(), 2);

    servers.close_project(first.root()).await;
    assert_eq!(a[0].state(), ServerState::Stopped);
    assert_eq!(b[0].state(), ServerState::Running);
    assert_eq!(servers.statuses().len(), 1);

    servers.shutdown_all().await;
    Ok(())
}

#[tokio::test]
async fn test_folder_aware_server_is_shared_between_projects() -> Result<()> {
    let servers = servers(vec![mockls("alpha", &["--workspace-folders"])])?;
    let first = Project::new()?;
    let second = Project::new()?;

    let a = servers
        .connect_document(&first.document("a.rs", SOURCE)?)
        .await;
    let b = servers
        .connect_document(&second.document("b.rs", SOURCE)?)
        .await;
    assert!(a[0].same_as(&b[0]));
    assert_eq!(a[0].spawn_count(), 1);
    assert_eq!(servers.statuses().len(), 1);
    eventually_count(&rpc(&a[0])?, "workspace/didChangeWorkspaceFolders", 1).await?;

    servers.close_project(first.root()).await;
    assert_eq!(b[0].state(), ServerState::Running);

    servers.shutdown_all().await;
    Ok(())
}

#[tokio::test]
async fn test_singleton_serves_every_root() -> Result<()> {
    let mut singleton = mockls("alpha", &["--workspace-folders"]);
    singleton.mode = LaunchMode::Singleton;
    let servers = servers(vec![singleton])?;
    let first = Project::new()?;
    let second = Project::new()?;

    let a = servers
        .connect_document(&first.document("a.rs", SOURCE)?)
        .await;
    let b = servers
        .connect_document(&second.document("b.rs", SOURCE)?)
        .await;
    assert!(a[0].same_as(&b[0]));
    assert!(a[0].root().is_none());
    assert_eq!(a[0].watched_roots().len(), 2);
    eventually_count(&rpc(&a[0])?, "workspace/didChangeWorkspaceFolders", 1).await?;

    servers.shutdown_all().await;
    Ok(())
}

#[tokio::test]
async fn test_workspace_symbols_skip_stopped_servers() -> Result<()> {
    let servers = servers(vec![mockls("alpha", &[]), mockls("beta", &[])])?;
    let project = Project::new()?;
    let document = project.document("main.rs", SOURCE)?;
    let wrappers = servers.connect_document(&document).await;
    wrappers[1].stop().await;

    let responses = features::workspace_symbols(&servers, project.root(), "main").await?;
    assert_eq!(responses.len(), 1);
    assert_eq!(wrappers[1].state(), ServerState::Stopped);

    servers.shutdown_all().await;
    Ok(())
}

#[tokio::test]
async fn test_stop_when_unused() -> Result<()> {
    let mut definition = mockls("alpha", &[]);
    definition.stop_when_unused = true;
    let servers = servers(vec![definition])?;
    let project = Project::new()?;
    let document = project.document("main.rs", SOURCE)?;

    let wrappers = servers.connect_document(&document).await;
    servers.close_document(&document.uri);
    eventually("idle server to stop", || {
        wrappers[0].state() == ServerState::Stopped
    })
    .await?;
    Ok(())
}

#[tokio::test]
async fn test_shutdown_all_stops_everything() -> Result<()> {
    let servers = servers(vec![mockls("alpha", &[]), mockls("beta", &[])])?;
    let project = Project::new()?;
    let document = project.document("main.rs", SOURCE)?;
    let wrappers = servers.connect_document(&document).await;

    servers.shutdown_all().await;
    for wrapper in &wrappers {
        assert_eq!(wrapper.state(), ServerState::Stopped);
    }
    assert!(servers.statuses().is_empty());
    Ok(())
}
