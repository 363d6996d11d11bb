// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (C) 2026 Mark Wells <contact@markwells.dev>

#![deny(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
//! Lifecycle tests for a single `ServerWrapper` driving `mockls`.

mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use anyhow::{Context, Result, bail};
use serde_json::{Value, json};
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::Layer;
use tracing_subscriber::layer::{Context as LayerContext, SubscriberExt};

use common::{
    Project, count, eventually, eventually_count, fast_options, mockls, options_with_policy,
};
use tether_lsp::Error;
use tether_lsp::config::RestartPolicy;
use tether_lsp::lsp::progress::ProgressToken;
use tether_lsp::lsp::{
    MonitorFactory, ProcessConnection, ProgressMonitor, ServerDefinition, ServerState,
    ServerWrapper, WrapperOptions,
};

fn wrapper(args: &[&str], project: &Project) -> ServerWrapper {
    ServerWrapper::new(
        Arc::new(mockls("mock", args)),
        Some(project.root().to_path_buf()),
        fast_options(),
    )
}

fn hover_params(uri: &str) -> Value {
    json!({
        "textDocument": { "uri": uri },
        "position": { "line": 0, "character": 0 }
    })
}

#[tokio::test]
async fn test_starts_lazily_and_stops() -> Result<()> {
    let project = Project::new()?;
    let wrapper = wrapper(&[], &project);
    assert_eq!(wrapper.state(), ServerState::NotStarted);
    assert_eq!(wrapper.spawn_count(), 0);

    let server = wrapper.activate().await?;
    assert_eq!(wrapper.state(), ServerState::Running);
    assert_eq!(wrapper.spawn_count(), 1);
    assert!(wrapper.capabilities().is_some_and(|c| c.hover_provider.is_some()));
    assert!(!server.is_closed());

    wrapper.stop().await;
    assert_eq!(wrapper.state(), ServerState::Stopped);
    assert!(server.is_closed());
    Ok(())
}

#[tokio::test]
async fn test_concurrent_activation_spawns_one_process() -> Result<()> {
    let project = Project::new()?;
    let wrapper = wrapper(&["--response-delay", "50"], &project);

    let attempts = (0..8).map(|_| {
        let wrapper = wrapper.clone();
        tokio::spawn(async move { wrapper.activate().await.map(|_| ()) })
    });
    for result in futures::future::join_all(attempts).await {
        result.context("activation task panicked")??;
    }

    assert_eq!(wrapper.spawn_count(), 1);
    assert_eq!(wrapper.state(), ServerState::Running);
    wrapper.stop().await;
    Ok(())
}

#[tokio::test]
async fn test_document_opened_and_closed_once() -> Result<()> {
    let project = Project::new()?;
    let wrapper = wrapper(&[], &project);
    let document = project.document("main.rs", "fn main() {}\n")?;

    assert!(wrapper.connect_document(&document).await?);
    assert!(!wrapper.connect_document(&document).await?);
    assert!(wrapper.is_connected_to(&document.uri));

    assert!(!wrapper.disconnect_document(&document.uri)?);
    assert!(wrapper.is_connected_to(&document.uri));
    assert!(wrapper.disconnect_document(&document.uri)?);
    assert!(!wrapper.is_connected_to(&document.uri));

    let server = wrapper.activate().await?;
    assert_eq!(count(&server, "textDocument/didOpen").await?, 1);
    assert_eq!(count(&server, "textDocument/didClose").await?, 1);

    wrapper.stop().await;
    Ok(())
}

#[tokio::test]
async fn test_change_and_save_follow_sync_options() -> Result<()> {
    let project = Project::new()?;
    let wrapper = wrapper(&[], &project);
    let document = project.document("lib.rs", "fn a() {}\n")?;

    assert!(!wrapper.change_document(&document.uri, "fn b() {}\n")?);
    wrapper.connect_document(&document).await?;
    assert!(wrapper.change_document(&document.uri, "fn b() {}\n")?);
    assert!(wrapper.save_document(&document.uri, None)?);

    let server = wrapper.activate().await?;
    assert_eq!(count(&server, "textDocument/didChange").await?, 1);
    assert_eq!(count(&server, "textDocument/didSave").await?, 1);

    wrapper.stop().await;
    Ok(())
}

#[tokio::test]
async fn test_diagnostics_are_cached() -> Result<()> {
    let project = Project::new()?;
    let wrapper = wrapper(&[], &project);
    let document = project.document("main.rs", "fn main() {}\n")?;
    wrapper.connect_document(&document).await?;

    eventually("diagnostics", || {
        !wrapper.diagnostics(&document.uri).is_empty()
    })
    .await?;
    let diagnostics = wrapper.diagnostics(&document.uri);
    assert_eq!(diagnostics[0].source.as_deref(), Some("mockls"));

    wrapper.stop().await;
    assert!(wrapper.diagnostics(&document.uri).is_empty());
    Ok(())
}

#[tokio::test]
async fn test_crash_fails_pending_requests() -> Result<()> {
    let project = Project::new()?;
    let wrapper = wrapper(
        &["--drop-after", "2", "--hang-on", "textDocument/hover"],
        &project,
    );
    let server = wrapper.activate().await?;

    let hover = server.request::<_, Value>("textDocument/hover", hover_params("file:///x.rs"));
    // The second response makes mockls exit.
    let _ = server
        .request::<_, Value>("mockls/receivedNotifications", Value::Null)
        .await;

    match hover.await {
        Err(Error::ServerDisconnected { server }) => assert_eq!(server, "mock"),
        other => bail!("expected ServerDisconnected, got {other:?}"),
    }

    let mut state = wrapper.subscribe();
    tokio::time::timeout(
        Duration::from_secs(2),
        state.wait_for(|s| *s == ServerState::Crashed),
    )
    .await
    .context("wrapper never reported the crash")??;
    assert!(!wrapper.is_active());
    Ok(())
}

#[tokio::test]
async fn test_crashed_wrapper_restarts_on_demand() -> Result<()> {
    let project = Project::new()?;
    let wrapper = wrapper(&["--drop-after", "2"], &project);
    let server = wrapper.activate().await?;
    let _ = server
        .request::<_, Value>("mockls/receivedNotifications", Value::Null)
        .await;

    eventually("crash", || wrapper.state() == ServerState::Crashed).await?;

    wrapper.activate().await?;
    assert_eq!(wrapper.state(), ServerState::Running);
    assert_eq!(wrapper.spawn_count(), 2);
    wrapper.stop().await;
    Ok(())
}

#[tokio::test]
async fn test_crashed_wrapper_stays_down_without_restart_policy() -> Result<()> {
    let project = Project::new()?;
    let wrapper = ServerWrapper::new(
        Arc::new(mockls("mock", &["--drop-after", "2"])),
        Some(project.root().to_path_buf()),
        options_with_policy(RestartPolicy::Never),
    );
    let server = wrapper.activate().await?;
    let _ = server
        .request::<_, Value>("mockls/receivedNotifications", Value::Null)
        .await;

    eventually("crash", || wrapper.state() == ServerState::Crashed).await?;

    match wrapper.activate().await {
        Err(Error::ServerNotActive { state, .. }) => assert_eq!(state, "crashed"),
        other => bail!("expected ServerNotActive, got {other:?}"),
    }
    assert_eq!(wrapper.spawn_count(), 1);

    // An explicit start is always allowed.
    wrapper.start().await?;
    assert_eq!(wrapper.spawn_count(), 2);
    wrapper.stop().await;
    Ok(())
}

#[tokio::test]
async fn test_missing_binary_fails_to_start() -> Result<()> {
    let definition = ServerDefinition::new(
        "ghost",
        ProcessConnection::new("/nonexistent/tether-test-server", Vec::<String>::new()),
    );
    let wrapper = ServerWrapper::new(Arc::new(definition), None, fast_options());

    match wrapper.activate().await {
        Err(Error::Connection { server, .. }) => assert_eq!(server, "ghost"),
        other => bail!("expected Connection error, got {other:?}"),
    }
    assert_eq!(wrapper.state(), ServerState::Stopped);
    Ok(())
}

#[tokio::test]
async fn test_failed_initialize_leaves_wrapper_stopped() -> Result<()> {
    let project = Project::new()?;
    let wrapper = wrapper(&["--fail-on", "initialize"], &project);

    let (first, second) = tokio::join!(wrapper.start(), wrapper.start());
    assert!(first.is_err());
    assert!(second.is_err());
    assert_eq!(wrapper.spawn_count(), 1);
    assert_eq!(wrapper.state(), ServerState::Stopped);
    Ok(())
}

/// Counts warn and error events.
#[derive(Clone, Default)]
struct Problems(Arc<AtomicUsize>);

impl Problems {
    fn count(&self) -> usize {
        self.0.load(Ordering::SeqCst)
    }
}

impl<S: Subscriber> Layer<S> for Problems {
    fn on_event(&self, event: &Event<'_>, _ctx: LayerContext<'_, S>) {
        if *event.metadata().level() <= Level::WARN {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }
}

#[tokio::test]
async fn test_cancelled_work_does_not_abort_startup() -> Result<()> {
    let project = Project::new()?;
    let wrapper = wrapper(&["--response-delay", "300"], &project);

    for _ in 0..3 {
        let pending = wrapper.submit(|server| async move {
            server
                .request::<_, Value>("mockls/receivedNotifications", Value::Null)
                .await
        });
        tokio::time::sleep(Duration::from_millis(100)).await;
        drop(pending);
    }

    eventually("startup to finish", || wrapper.state() == ServerState::Running).await?;
    assert_eq!(wrapper.spawn_count(), 1);

    let notifications = wrapper
        .execute(|server| async move {
            server
                .request::<_, Value>("mockls/receivedNotifications", Value::Null)
                .await
        })
        .await?;
    assert!(notifications.is_array());
    assert_eq!(wrapper.spawn_count(), 1);
    wrapper.stop().await;
    Ok(())
}

/// Makes a running `--drop-after 2` mockls exit.
async fn crash(wrapper: &ServerWrapper) -> Result<()> {
    let server = wrapper
        .language_server()
        .context("wrapper is not running")?;
    let _ = server
        .request::<_, Value>("mockls/receivedNotifications", Value::Null)
        .await;
    Ok(())
}

#[tokio::test]
async fn test_on_demand_restarts_are_not_capped() -> Result<()> {
    let project = Project::new()?;
    let options = WrapperOptions {
        max_restarts: 0,
        ..options_with_policy(RestartPolicy::OnDemand)
    };
    let wrapper = ServerWrapper::new(
        Arc::new(mockls("mock", &["--drop-after", "2"])),
        Some(project.root().to_path_buf()),
        options,
    );

    wrapper.activate().await?;
    for round in 2..=4 {
        crash(&wrapper).await?;
        eventually("crash", || wrapper.state() == ServerState::Crashed).await?;
        wrapper.activate().await?;
        assert_eq!(wrapper.spawn_count(), round);
    }
    wrapper.stop().await;
    Ok(())
}

#[tokio::test]
async fn test_eager_restart_budget() -> Result<()> {
    let project = Project::new()?;
    let options = WrapperOptions {
        max_restarts: 2,
        ..options_with_policy(RestartPolicy::Eager)
    };
    let wrapper = ServerWrapper::new(
        Arc::new(mockls("mock", &["--drop-after", "2"])),
        Some(project.root().to_path_buf()),
        options,
    );
    wrapper.activate().await?;

    // Callers racing the automatic restart share its credit.
    crash(&wrapper).await?;
    let callers = (0..4).map(|_| {
        let wrapper = wrapper.clone();
        tokio::spawn(async move { wrapper.activate().await.map(|_| ()) })
    });
    for result in futures::future::join_all(callers).await {
        let _ = result.context("activation task panicked")?;
    }
    eventually("first restart", || {
        wrapper.spawn_count() == 2 && wrapper.state() == ServerState::Running
    })
    .await?;

    crash(&wrapper).await?;
    eventually("second restart", || {
        wrapper.spawn_count() == 3 && wrapper.state() == ServerState::Running
    })
    .await?;

    // The budget is spent.
    crash(&wrapper).await?;
    eventually("crash", || wrapper.state() == ServerState::Crashed).await?;
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(wrapper.state(), ServerState::Crashed);
    assert!(matches!(
        wrapper.activate().await,
        Err(Error::ServerNotActive { .. })
    ));

    // An explicit start refills it.
    wrapper.start().await?;
    assert_eq!(wrapper.spawn_count(), 4);
    crash(&wrapper).await?;
    eventually("restart after refill", || {
        wrapper.spawn_count() == 5 && wrapper.state() == ServerState::Running
    })
    .await?;
    wrapper.stop().await;
    Ok(())
}

#[tokio::test]
async fn test_stop_is_idempotent() -> Result<()> {
    let problems = Problems::default();
    let subscriber = tracing_subscriber::registry().with(problems.clone());
    let _guard = tracing::subscriber::set_default(subscriber);

    let project = Project::new()?;
    let wrapper = wrapper(&[], &project);
    wrapper.stop().await;
    assert_eq!(wrapper.state(), ServerState::NotStarted);

    wrapper.activate().await?;
    tokio::join!(wrapper.stop(), wrapper.stop());
    wrapper.stop().await;

    assert_eq!(wrapper.state(), ServerState::Stopped);
    assert_eq!(problems.count(), 0);
    Ok(())
}

#[tokio::test]
async fn test_stop_dispatcher_with_request_in_flight() -> Result<()> {
    let problems = Problems::default();
    let subscriber = tracing_subscriber::registry().with(problems.clone());
    let _guard = tracing::subscriber::set_default(subscriber);

    let project = Project::new()?;
    let wrapper = wrapper(&["--hang-on", "textDocument/hover"], &project);
    let server = wrapper.activate().await?;

    let pending = wrapper.submit(|server| async move {
        server
            .request::<_, Value>("textDocument/hover", hover_params("file:///x.rs"))
            .await
    });
    eventually("hover in flight", || server.pending_count() == 1).await?;

    let started = Instant::now();
    let stopping = wrapper.stop_dispatcher();
    assert!(started.elapsed() < Duration::from_millis(50));

    match pending.await {
        Err(Error::ServerNotActive { state, .. }) => assert_eq!(state, "stopping"),
        other => bail!("expected ServerNotActive, got {other:?}"),
    }
    stopping.await.context("stop task panicked")?;
    assert_eq!(wrapper.state(), ServerState::Stopped);
    assert_eq!(problems.count(), 0);
    Ok(())
}

#[tokio::test]
async fn test_submit_returns_before_the_response() -> Result<()> {
    let project = Project::new()?;
    let wrapper = wrapper(&["--response-delay", "300"], &project);
    wrapper.activate().await?;

    let started = Instant::now();
    let pending = wrapper.submit(|server| async move {
        server
            .request::<_, Value>("mockls/receivedNotifications", Value::Null)
            .await
    });
    assert!(started.elapsed() < Duration::from_millis(50));
    assert!(!pending.is_finished());

    let value = pending.await?;
    assert!(value.is_array());
    assert!(started.elapsed() >= Duration::from_millis(250));
    wrapper.stop().await;
    Ok(())
}

#[tokio::test]
async fn test_cancel_sends_cancel_request() -> Result<()> {
    let project = Project::new()?;
    let wrapper = wrapper(&["--hang-on", "textDocument/hover"], &project);
    let server = wrapper.activate().await?;

    let pending = wrapper.submit(|server| async move {
        server
            .request::<_, Value>("textDocument/hover", hover_params("file:///x.rs"))
            .await
    });
    tokio::time::sleep(Duration::from_millis(50)).await;
    pending.cancel();
    assert!(matches!(pending.await, Err(Error::Cancelled)));

    eventually_count(&server, "$/cancelRequest", 1).await?;
    assert_eq!(server.pending_count(), 0);
    wrapper.stop().await;
    Ok(())
}

#[tokio::test]
async fn test_cancel_after_completion_reports_cancelled() -> Result<()> {
    let project = Project::new()?;
    let wrapper = wrapper(&[], &project);
    let server = wrapper.activate().await?;

    let pending = wrapper.submit(|server| async move {
        server
            .request::<_, Value>("mockls/receivedNotifications", Value::Null)
            .await
    });
    eventually("completion", || pending.is_finished()).await?;
    pending.cancel();
    assert!(matches!(pending.await, Err(Error::Cancelled)));

    assert_eq!(count(&server, "$/cancelRequest").await?, 0);
    wrapper.stop().await;
    Ok(())
}

#[derive(Clone, Default)]
struct Recorder(Arc<Mutex<Vec<String>>>);

impl Recorder {
    fn push(&self, event: String) {
        self.0
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(event);
    }

    fn events(&self) -> Vec<String> {
        self.0.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }
}

impl ProgressMonitor for Recorder {
    fn begin_task(&mut self, title: &str, total: Option<u32>) {
        self.push(format!("begin {title} {total:?}"));
    }

    fn worked(&mut self, amount: u32) {
        self.push(format!("worked {amount}"));
    }

    fn sub_task(&mut self, message: &str) {
        self.push(format!("sub {message}"));
    }

    fn done(&mut self) {
        self.push("done".to_string());
    }
}

impl MonitorFactory for Recorder {
    fn create(&self, _server: &str, _token: &ProgressToken) -> Box<dyn ProgressMonitor> {
        Box::new(self.clone())
    }
}

#[tokio::test]
async fn test_server_progress_reaches_monitor() -> Result<()> {
    let project = Project::new()?;
    let recorder = Recorder::default();
    let wrapper = ServerWrapper::with_monitors(
        Arc::new(mockls("mock", &["--indexing-delay", "300"])),
        Some(project.root().to_path_buf()),
        fast_options(),
        Arc::new(recorder.clone()),
    );
    wrapper.activate().await?;

    eventually("progress report", || {
        wrapper
            .status()
            .progress
            .iter()
            .any(|p| p.title == "Indexing" && p.percentage == Some(50))
    })
    .await?;
    eventually("progress end", || {
        recorder.events().last().is_some_and(|e| e == "done")
    })
    .await?;

    assert_eq!(
        recorder.events(),
        [
            "begin Indexing Some(100)",
            "sub files",
            "worked 50",
            "sub Indexing complete",
            "done"
        ]
    );
    assert!(wrapper.status().progress.is_empty());
    wrapper.stop().await;
    Ok(())
}

#[tokio::test]
async fn test_watch_root_notifies_folder_aware_server() -> Result<()> {
    let project = Project::new()?;
    let other = Project::new()?;
    let wrapper = wrapper(&["--workspace-folders"], &project);
    let server = wrapper.activate().await?;

    assert!(wrapper.can_operate(other.root()));
    assert!(wrapper.watch_root(other.root())?);
    assert!(!wrapper.watch_root(other.root())?);
    assert_eq!(wrapper.watched_roots().len(), 2);
    assert!(wrapper.unwatch_root(other.root())?);

    assert_eq!(
        count(&server, "workspace/didChangeWorkspaceFolders").await?,
        2
    );
    wrapper.stop().await;
    Ok(())
}

#[tokio::test]
async fn test_dynamic_folder_registration() -> Result<()> {
    let project = Project::new()?;
    let other = Project::new()?;
    let wrapper = wrapper(&["--register-folders"], &project);
    assert!(!wrapper.can_operate(other.root()));

    wrapper.activate().await?;
    eventually("dynamic registration", || {
        wrapper.can_operate(other.root())
    })
    .await?;
    wrapper.stop().await;
    Ok(())
}

#[tokio::test]
async fn test_eager_policy_restarts_after_crash() -> Result<()> {
    let project = Project::new()?;
    let wrapper = ServerWrapper::new(
        Arc::new(mockls("mock", &["--drop-after", "2"])),
        Some(project.root().to_path_buf()),
        options_with_policy(RestartPolicy::Eager),
    );
    let server = wrapper.activate().await?;
    let _ = server
        .request::<_, Value>("mockls/receivedNotifications", Value::Null)
        .await;

    eventually("eager restart", || {
        wrapper.spawn_count() == 2 && wrapper.state() == ServerState::Running
    })
    .await?;
    wrapper.stop().await;
    Ok(())
}
