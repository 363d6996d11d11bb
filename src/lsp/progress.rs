// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (C) 2026 Mark Wells <contact@markwells.dev>

//! Work done progress sessions for one server.
//!
//! Each progress token gets a session task that drains a queue of
//! `begin`/`report`/`end` values and drives a [`ProgressMonitor`] supplied by
//! the host. Monitors that report cancellation cause a
//! `window/workDoneProgress/cancel` notification to be sent to the server.

use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use dashmap::{DashMap, DashSet};
use lsp_types::{
    NumberOrString, ProgressParams, ProgressParamsValue, WorkDoneProgress,
    WorkDoneProgressCancelParams,
};
use serde::Serialize;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace};

use super::rpc::LanguageServer;

/// Token type for progress tracking (string or number).
pub type ProgressToken = NumberOrString;

/// Receives progress updates for one session.
///
/// Methods are called from the session task, one at a time.
pub trait ProgressMonitor: Send {
    /// A task started. `total` is `None` when the amount of work is unknown.
    fn begin_task(&mut self, title: &str, total: Option<u32>);
    /// `amount` more units of work completed.
    fn worked(&mut self, amount: u32);
    /// A new status line for the running task.
    fn sub_task(&mut self, message: &str);
    /// The task finished or was cancelled.
    fn done(&mut self);
    /// Returns true if the user asked to cancel the task.
    fn is_cancelled(&self) -> bool {
        false
    }
}

/// Creates monitors for new progress sessions.
pub trait MonitorFactory: Send + Sync {
    /// Builds a monitor for `token` on `server`.
    fn create(&self, server: &str, token: &ProgressToken) -> Box<dyn ProgressMonitor>;
}

/// Factory whose monitors write progress to the log.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogMonitors;

impl MonitorFactory for LogMonitors {
    fn create(&self, server: &str, token: &ProgressToken) -> Box<dyn ProgressMonitor> {
        Box::new(LogMonitor {
            server: server.to_string(),
            token: token_key(token),
            title: String::new(),
            worked: 0,
        })
    }
}

struct LogMonitor {
    server: String,
    token: String,
    title: String,
    worked: u32,
}

impl ProgressMonitor for LogMonitor {
    fn begin_task(&mut self, title: &str, total: Option<u32>) {
        title.clone_into(&mut self.title);
        info!(server = %self.server, token = %self.token, ?total, "{title}");
    }

    fn worked(&mut self, amount: u32) {
        self.worked = self.worked.saturating_add(amount);
        debug!(server = %self.server, token = %self.token, "{}: {}%", self.title, self.worked);
    }

    fn sub_task(&mut self, message: &str) {
        debug!(server = %self.server, token = %self.token, "{}: {message}", self.title);
    }

    fn done(&mut self) {
        debug!(server = %self.server, token = %self.token, "{}: done", self.title);
    }
}

/// Point-in-time view of an active session.
#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
pub struct ProgressSnapshot {
    /// The progress token.
    pub token: String,
    /// The title of the progress operation.
    pub title: String,
    /// The latest progress message.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// Highest percentage reported so far.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub percentage: Option<u32>,
}

struct Session {
    queue: mpsc::UnboundedSender<WorkDoneProgress>,
    cancel: CancellationToken,
    snapshot: Arc<Mutex<ProgressSnapshot>>,
}

struct Inner {
    server: String,
    rpc: LanguageServer,
    factory: Arc<dyn MonitorFactory>,
    poll_interval: Duration,
    sessions: DashMap<String, Session>,
    done: DashSet<String>,
    root: CancellationToken,
}

/// Registry of progress sessions for one server connection.
#[derive(Clone)]
pub struct ProgressManager {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for ProgressManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProgressManager")
            .field("server", &self.inner.server)
            .field("sessions", &self.inner.sessions.len())
            .finish_non_exhaustive()
    }
}

/// Stable map key for a token.
fn token_key(token: &ProgressToken) -> String {
    match token {
        NumberOrString::Number(n) => n.to_string(),
        NumberOrString::String(s) => s.clone(),
    }
}

impl ProgressManager {
    /// Creates a manager that sends cancellations through `rpc`.
    #[must_use]
    pub fn new(rpc: LanguageServer, factory: Arc<dyn MonitorFactory>, poll_interval: Duration) -> Self {
        Self {
            inner: Arc::new(Inner {
                server: rpc.server_id().to_string(),
                rpc,
                factory,
                poll_interval,
                sessions: DashMap::new(),
                done: DashSet::new(),
                root: CancellationToken::new(),
            }),
        }
    }

    /// Allocates a session for `token` (`window/workDoneProgress/create`).
    ///
    /// If the server already ended this token, the session finishes at once.
    pub fn create_progress(&self, token: &ProgressToken) {
        let key = token_key(token);
        if self.inner.done.remove(&key).is_some() {
            trace!(server = %self.inner.server, token = %key, "progress already ended");
            return;
        }
        if self.inner.root.is_cancelled() {
            return;
        }

        self.inner.sessions.entry(key.clone()).or_insert_with(|| {
            let (tx, rx) = mpsc::unbounded_channel();
            let cancel = self.inner.root.child_token();
            let snapshot = Arc::new(Mutex::new(ProgressSnapshot {
                token: key.clone(),
                ..ProgressSnapshot::default()
            }));
            let monitor = self.inner.factory.create(&self.inner.server, token);

            tokio::spawn(run_session(
                Arc::clone(&self.inner),
                token.clone(),
                rx,
                cancel.clone(),
                monitor,
                Arc::clone(&snapshot),
            ));

            Session {
                queue: tx,
                cancel,
                snapshot,
            }
        });
    }

    /// Routes a `$/progress` notification to its session.
    pub fn notify_progress(&self, params: ProgressParams) {
        let ProgressParamsValue::WorkDone(value) = params.value;
        let key = token_key(&params.token);

        if !self.inner.sessions.contains_key(&key) {
            match &value {
                WorkDoneProgress::End(_) => {
                    self.inner.done.insert(key);
                    return;
                }
                // Servers may begin without asking to create the token first.
                WorkDoneProgress::Begin(_) => self.create_progress(&params.token),
                WorkDoneProgress::Report(_) => {
                    trace!(server = %self.inner.server, token = %key, "report for unknown progress token");
                    return;
                }
            }
        }

        if let Some(session) = self.inner.sessions.get(&key) {
            let _ = session.queue.send(value);
        }
    }

    /// Cancels a session and asks the server to stop the work.
    pub fn cancel(&self, token: &ProgressToken) {
        let key = token_key(token);
        if let Some((_, session)) = self.inner.sessions.remove(&key) {
            send_cancel(&self.inner, token);
            session.cancel.cancel();
        }
    }

    /// Cancels every session and clears all state.
    pub fn dispose(&self) {
        self.inner.root.cancel();
        self.inner.sessions.clear();
        self.inner.done.clear();
    }

    /// Active sessions.
    #[must_use]
    pub fn active(&self) -> Vec<ProgressSnapshot> {
        let mut snapshots: Vec<ProgressSnapshot> = self
            .inner
            .sessions
            .iter()
            .map(|s| {
                s.snapshot
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .clone()
            })
            .collect();
        snapshots.sort_by(|a, b| a.token.cmp(&b.token));
        snapshots
    }

    /// Returns true if any session is active.
    #[must_use]
    pub fn is_busy(&self) -> bool {
        !self.inner.sessions.is_empty()
    }
}

fn send_cancel(inner: &Inner, token: &ProgressToken) {
    let params = WorkDoneProgressCancelParams {
        token: token.clone(),
    };
    if let Err(e) = inner.rpc.work_done_progress_cancel(params) {
        debug!(server = %inner.server, "failed to send progress cancel: {e}");
    }
}

/// Tracks the monitor side of one session.
struct Accounting {
    begun: bool,
    max_percentage: u32,
}

impl Accounting {
    /// Units of work to report for a new percentage. Never negative.
    fn advance(&mut self, percentage: u32) -> u32 {
        let delta = percentage.saturating_sub(self.max_percentage);
        self.max_percentage = self.max_percentage.max(percentage);
        delta
    }
}

fn apply(
    monitor: &mut dyn ProgressMonitor,
    state: &mut Accounting,
    snapshot: &Mutex<ProgressSnapshot>,
    value: WorkDoneProgress,
) -> bool {
    let mut snap = snapshot.lock().unwrap_or_else(PoisonError::into_inner);
    match value {
        WorkDoneProgress::Begin(begin) => {
            state.begun = true;
            monitor.begin_task(&begin.title, begin.percentage.map(|_| 100));
            snap.title.clone_from(&begin.title);
            if let Some(message) = &begin.message {
                monitor.sub_task(message);
                snap.message = Some(message.clone());
            }
            if let Some(percentage) = begin.percentage {
                let delta = state.advance(percentage);
                if delta > 0 {
                    monitor.worked(delta);
                }
                snap.percentage = Some(state.max_percentage);
            }
            false
        }
        WorkDoneProgress::Report(report) => {
            if !state.begun {
                state.begun = true;
                monitor.begin_task(&snap.title, None);
            }
            if let Some(message) = &report.message {
                monitor.sub_task(message);
                snap.message = Some(message.clone());
            }
            if let Some(percentage) = report.percentage {
                let delta = state.advance(percentage);
                if delta > 0 {
                    monitor.worked(delta);
                }
                snap.percentage = Some(state.max_percentage);
            }
            false
        }
        WorkDoneProgress::End(end) => {
            if let Some(message) = &end.message {
                monitor.sub_task(message);
            }
            true
        }
    }
}

async fn run_session(
    inner: Arc<Inner>,
    token: ProgressToken,
    mut queue: mpsc::UnboundedReceiver<WorkDoneProgress>,
    cancel: CancellationToken,
    mut monitor: Box<dyn ProgressMonitor>,
    snapshot: Arc<Mutex<ProgressSnapshot>>,
) {
    let key = token_key(&token);
    let mut state = Accounting {
        begun: false,
        max_percentage: 0,
    };
    let mut poll = tokio::time::interval(inner.poll_interval);
    poll.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    let mut healthy = true;
    loop {
        tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            value = queue.recv() => {
                let Some(value) = value else { break };
                match guarded(&inner, &key, || apply(monitor.as_mut(), &mut state, &snapshot, value)) {
                    Some(false) => {}
                    Some(true) => break,
                    None => {
                        healthy = false;
                        break;
                    }
                }
            }
            _ = poll.tick() => {
                match guarded(&inner, &key, || monitor.is_cancelled()) {
                    Some(false) => {}
                    Some(true) => {
                        debug!(server = %inner.server, token = %key, "progress cancelled by monitor");
                        send_cancel(&inner, &token);
                        break;
                    }
                    None => {
                        healthy = false;
                        break;
                    }
                }
            }
        }
    }

    if healthy {
        guarded(&inner, &key, || monitor.done());
    }
    inner.sessions.remove_if(&key, |_, session| session.snapshot_is(&snapshot));
}

/// Runs one monitor callback, logging instead of unwinding if it panics.
fn guarded<T>(inner: &Inner, key: &str, call: impl FnOnce() -> T) -> Option<T> {
    match std::panic::catch_unwind(AssertUnwindSafe(call)) {
        Ok(value) => Some(value),
        Err(_) => {
            error!(server = %inner.server, token = %key, "progress monitor panicked");
            None
        }
    }
}

impl Session {
    fn snapshot_is(&self, snapshot: &Arc<Mutex<ProgressSnapshot>>) -> bool {
        Arc::ptr_eq(&self.snapshot, snapshot)
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
    use lsp_types::{WorkDoneProgressBegin, WorkDoneProgressEnd, WorkDoneProgressReport};
    use std::sync::atomic::{AtomicBool, Ordering};

    #[derive(Debug, Default)]
    struct Recorded {
        begun: Vec<(String, Option<u32>)>,
        worked: Vec<u32>,
        messages: Vec<String>,
        done: bool,
    }

    #[derive(Clone, Default)]
    struct Recorder {
        log: Arc<Mutex<Recorded>>,
        cancelled: Arc<AtomicBool>,
    }

    impl ProgressMonitor for Recorder {
        fn begin_task(&mut self, title: &str, total: Option<u32>) {
            self.log.lock().unwrap().begun.push((title.to_string(), total));
        }
        fn worked(&mut self, amount: u32) {
            self.log.lock().unwrap().worked.push(amount);
        }
        fn sub_task(&mut self, message: &str) {
            self.log.lock().unwrap().messages.push(message.to_string());
        }
        fn done(&mut self) {
            self.log.lock().unwrap().done = true;
        }
        fn is_cancelled(&self) -> bool {
            self.cancelled.load(Ordering::SeqCst)
        }
    }

    struct RecorderFactory(Recorder);

    impl MonitorFactory for RecorderFactory {
        fn create(&self, _server: &str, _token: &ProgressToken) -> Box<dyn ProgressMonitor> {
            Box::new(self.0.clone())
        }
    }

    fn manager(recorder: &Recorder) -> (ProgressManager, super::super::rpc::Outbound) {
        let (rpc, outbound) = LanguageServer::channel("test", super::super::rpc::RpcOptions::default());
        let manager = ProgressManager::new(
            rpc,
            Arc::new(RecorderFactory(recorder.clone())),
            Duration::from_millis(10),
        );
        (manager, outbound)
    }

    fn token() -> ProgressToken {
        NumberOrString::String("indexing".to_string())
    }

    fn begin(title: &str, percentage: Option<u32>) -> ProgressParams {
        ProgressParams {
            token: token(),
            value: ProgressParamsValue::WorkDone(WorkDoneProgress::Begin(WorkDoneProgressBegin {
                title: title.to_string(),
                cancellable: Some(true),
                message: None,
                percentage,
            })),
        }
    }

    fn report(percentage: u32) -> ProgressParams {
        ProgressParams {
            token: token(),
            value: ProgressParamsValue::WorkDone(WorkDoneProgress::Report(
                WorkDoneProgressReport {
                    cancellable: None,
                    message: Some(format!("{percentage}%")),
                    percentage: Some(percentage),
                },
            )),
        }
    }

    fn end() -> ProgressParams {
        ProgressParams {
            token: token(),
            value: ProgressParamsValue::WorkDone(WorkDoneProgress::End(WorkDoneProgressEnd {
                message: None,
            })),
        }
    }

    async fn wait_until(mut check: impl FnMut() -> bool) {
        for _ in 0..200 {
            if check() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(check(), "condition not reached");
    }

    #[test]
    fn test_accounting_is_monotonic() {
        let mut state = Accounting {
            begun: true,
            max_percentage: 0,
        };
        let worked: u32 = [10, 5, 30].into_iter().map(|p| state.advance(p)).sum();
        assert_eq!(worked, 30);
        assert_eq!(state.max_percentage, 30);
    }

    #[tokio::test]
    async fn test_session_reports_monotonic_work() {
        let recorder = Recorder::default();
        let (manager, _outbound) = manager(&recorder);

        manager.create_progress(&token());
        manager.notify_progress(begin("Indexing", Some(0)));
        manager.notify_progress(report(10));
        manager.notify_progress(report(5));
        manager.notify_progress(report(30));
        manager.notify_progress(end());

        wait_until(|| recorder.log.lock().unwrap().done).await;
        let log = recorder.log.lock().unwrap();
        assert_eq!(log.begun, vec![("Indexing".to_string(), Some(100))]);
        assert_eq!(log.worked.iter().sum::<u32>(), 30);
        assert_eq!(log.worked, vec![10, 20]);
        drop(log);
        wait_until(|| !manager.is_busy()).await;
    }

    #[tokio::test]
    async fn test_report_without_begin_synthesizes_task() {
        let recorder = Recorder::default();
        let (manager, _outbound) = manager(&recorder);

        manager.create_progress(&token());
        manager.notify_progress(report(40));
        manager.notify_progress(end());

        wait_until(|| recorder.log.lock().unwrap().done).await;
        let log = recorder.log.lock().unwrap();
        assert_eq!(log.begun, vec![(String::new(), None)]);
        assert_eq!(log.worked, vec![40]);
    }

    #[tokio::test]
    async fn test_end_before_create_finishes_immediately() {
        let recorder = Recorder::default();
        let (manager, _outbound) = manager(&recorder);

        manager.notify_progress(end());
        manager.create_progress(&token());

        assert!(!manager.is_busy());
        assert!(recorder.log.lock().unwrap().begun.is_empty());
    }

    #[tokio::test]
    async fn test_begin_without_create_opens_session() {
        let recorder = Recorder::default();
        let (manager, _outbound) = manager(&recorder);

        manager.notify_progress(begin("Loading", Some(20)));
        wait_until(|| !recorder.log.lock().unwrap().begun.is_empty()).await;

        let active = manager.active();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].title, "Loading");
        assert_eq!(active[0].percentage, Some(20));
    }

    #[tokio::test]
    async fn test_monitor_cancel_notifies_server() {
        let recorder = Recorder::default();
        let (manager, outbound) = manager(&recorder);
        let super::super::rpc::Outbound(mut rx) = outbound;

        manager.create_progress(&token());
        manager.notify_progress(begin("Indexing", None));
        recorder.cancelled.store(true, Ordering::SeqCst);

        let frame = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        let text = String::from_utf8_lossy(&frame);
        assert!(text.contains("window/workDoneProgress/cancel"), "got {text}");
        assert!(text.contains("indexing"));

        wait_until(|| recorder.log.lock().unwrap().done).await;
        wait_until(|| !manager.is_busy()).await;
    }

    struct Exploding;

    impl ProgressMonitor for Exploding {
        #[allow(clippy::panic, reason = "Exercises the panic guard around monitors")]
        fn begin_task(&mut self, _title: &str, _total: Option<u32>) {
            panic!("monitor failed");
        }
        fn worked(&mut self, _amount: u32) {}
        fn sub_task(&mut self, _message: &str) {}
        fn done(&mut self) {}
    }

    struct ExplodingFactory;

    impl MonitorFactory for ExplodingFactory {
        fn create(&self, _server: &str, _token: &ProgressToken) -> Box<dyn ProgressMonitor> {
            Box::new(Exploding)
        }
    }

    #[tokio::test]
    async fn test_panicking_monitor_releases_session() {
        let (rpc, _outbound) = LanguageServer::channel("test", super::super::rpc::RpcOptions::default());
        let manager = ProgressManager::new(rpc, Arc::new(ExplodingFactory), Duration::from_millis(10));

        manager.create_progress(&token());
        manager.notify_progress(begin("Indexing", Some(0)));
        manager.notify_progress(end());

        wait_until(|| !manager.is_busy()).await;
        assert!(manager.active().is_empty());

        // A new session for the same token starts cleanly.
        manager.create_progress(&token());
        assert!(manager.is_busy());
        manager.notify_progress(end());
        wait_until(|| !manager.is_busy()).await;
    }

    #[tokio::test]
    async fn test_dispose_stops_sessions() {
        let recorder = Recorder::default();
        let (manager, _outbound) = manager(&recorder);

        manager.create_progress(&token());
        manager.notify_progress(begin("Indexing", None));
        manager.dispose();

        wait_until(|| recorder.log.lock().unwrap().done).await;
        assert!(!manager.is_busy());

        // Disposed managers ignore new tokens.
        manager.create_progress(&token());
        assert!(!manager.is_busy());
    }
}
