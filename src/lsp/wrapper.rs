// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (C) 2026 Mark Wells <contact@markwells.dev>

//! Lifecycle of one running language server.
//!
//! A [`ServerWrapper`] owns the process for one definition and scope. It is
//! started lazily by the first unit of work, tracks which documents are open
//! on the server, and tears everything down on stop or crash.

use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, Weak};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use lsp_types::{
    ClientInfo, ConfigurationParams, Diagnostic, DidChangeTextDocumentParams,
    DidChangeWorkspaceFoldersParams, DidCloseTextDocumentParams, DidOpenTextDocumentParams,
    DidSaveTextDocumentParams, InitializeParams, PositionEncodingKind, ProgressParams,
    PublishDiagnosticsParams, ServerCapabilities, TextDocumentContentChangeEvent,
    TextDocumentIdentifier, TextDocumentItem, TextDocumentSyncKind, Uri,
    VersionedTextDocumentIdentifier, WorkDoneProgressCreateParams, WorkspaceFolder,
    WorkspaceFoldersChangeEvent,
};
use serde_json::Value;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use super::capabilities::{self, CapabilityFilter};
use super::connection::{ServerProcess, Transport};
use super::progress::{LogMonitors, MonitorFactory, ProgressManager};
use super::protocol::ResponseError;
use super::registry::ServerDefinition;
use super::rpc::{self, LanguageServer, MessageHandler, RpcOptions};
use super::state::{ServerState, ServerStatus};
use super::task::Pending;
use crate::config::{Config, LaunchMode, RestartPolicy};
use crate::document::{DocumentSnapshot, path_to_uri};
use crate::error::{Error, Result};

/// How long a dispatcher gets to finish after the process is gone.
const DISPATCHER_JOIN_TIMEOUT: Duration = Duration::from_secs(1);

/// Timeouts and policies applied to every wrapper.
#[derive(Debug, Clone, Copy)]
pub struct WrapperOptions {
    /// Upper bound for any request.
    pub request_timeout: Duration,
    /// Upper bound for the `initialize` handshake.
    pub init_timeout: Duration,
    /// Time the server gets to shut down before it is killed.
    pub shutdown_grace: Duration,
    /// Progress monitor poll interval.
    pub progress_poll: Duration,
    /// What happens after a crash.
    pub restart_policy: RestartPolicy,
    /// Restarts allowed before the wrapper stays crashed.
    pub max_restarts: u32,
}

impl Default for WrapperOptions {
    fn default() -> Self {
        Self::from(&Config::default())
    }
}

impl From<&Config> for WrapperOptions {
    fn from(config: &Config) -> Self {
        Self {
            request_timeout: config.request_timeout(),
            init_timeout: config.init_timeout(),
            shutdown_grace: config.shutdown_grace(),
            progress_poll: config.progress_poll(),
            restart_policy: config.restart_policy,
            max_restarts: config.max_restarts,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Launch {
    /// Explicit or first start; resets the restart budget on success.
    Start,
    /// Recovery from `Crashed`, subject to the restart policy.
    Restart,
}

#[derive(Debug)]
struct DocumentEntry {
    /// Editor references. Zero for documents opened only to serve a request.
    refcount: usize,
    version: i32,
}

/// One live connection.
struct Session {
    rpc: LanguageServer,
    capabilities: ServerCapabilities,
    encoding: PositionEncodingKind,
    progress: ProgressManager,
    process: Mutex<Option<ServerProcess>>,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
    started: Instant,
}

struct Inner {
    definition: Arc<ServerDefinition>,
    root: Option<PathBuf>,
    options: WrapperOptions,
    monitors: Arc<dyn MonitorFactory>,
    state: watch::Sender<ServerState>,
    lifecycle: tokio::sync::Mutex<()>,
    session: RwLock<Option<Arc<Session>>>,
    generation: AtomicU64,
    spawn_count: AtomicU64,
    /// Start attempts that have finished, successfully or not.
    attempts: AtomicU64,
    restarts: AtomicU32,
    last_error: Mutex<Option<Error>>,
    documents: DashMap<Uri, DocumentEntry>,
    roots: Mutex<Vec<PathBuf>>,
    dynamic_folders: AtomicBool,
    diagnostics: DashMap<Uri, Vec<Diagnostic>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Owns one server process for a definition and scope.
///
/// Cheap to clone; clones share the same server.
#[derive(Clone)]
pub struct ServerWrapper {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for ServerWrapper {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerWrapper")
            .field("server", &self.inner.definition.id)
            .field("root", &self.inner.root)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl ServerWrapper {
    /// Creates a wrapper in `NotStarted` state. Nothing is spawned yet.
    #[must_use]
    pub fn new(definition: Arc<ServerDefinition>, root: Option<PathBuf>, options: WrapperOptions) -> Self {
        Self::with_monitors(definition, root, options, Arc::new(LogMonitors))
    }

    /// Like [`new`](Self::new) with a custom progress monitor factory.
    #[must_use]
    pub fn with_monitors(
        definition: Arc<ServerDefinition>,
        root: Option<PathBuf>,
        options: WrapperOptions,
        monitors: Arc<dyn MonitorFactory>,
    ) -> Self {
        let (state, _) = watch::channel(ServerState::NotStarted);
        let roots = root.iter().cloned().collect();
        Self {
            inner: Arc::new(Inner {
                definition,
                root,
                options,
                monitors,
                state,
                lifecycle: tokio::sync::Mutex::new(()),
                session: RwLock::new(None),
                generation: AtomicU64::new(0),
                spawn_count: AtomicU64::new(0),
                attempts: AtomicU64::new(0),
                restarts: AtomicU32::new(0),
                last_error: Mutex::new(None),
                documents: DashMap::new(),
                roots: Mutex::new(roots),
                dynamic_folders: AtomicBool::new(false),
                diagnostics: DashMap::new(),
            }),
        }
    }

    /// The definition this wrapper runs.
    #[must_use]
    pub fn definition(&self) -> &Arc<ServerDefinition> {
        &self.inner.definition
    }

    /// The definition id.
    #[must_use]
    pub fn server_id(&self) -> &str {
        &self.inner.definition.id
    }

    /// The scope root, `None` for singleton servers.
    #[must_use]
    pub fn root(&self) -> Option<&Path> {
        self.inner.root.as_deref()
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> ServerState {
        *self.inner.state.borrow()
    }

    /// Receives every state transition.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<ServerState> {
        self.inner.state.subscribe()
    }

    /// Returns true while a process is alive (starting, initializing or running).
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.state().is_alive()
    }

    /// Returns true if `uri` is open on this server.
    #[must_use]
    pub fn is_connected_to(&self, uri: &Uri) -> bool {
        self.inner.documents.contains_key(uri)
    }

    /// Returns true if both handles refer to the same wrapper.
    #[must_use]
    pub fn same_as(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Number of processes spawned over the wrapper's lifetime.
    #[must_use]
    pub fn spawn_count(&self) -> u64 {
        self.inner.spawn_count.load(Ordering::SeqCst)
    }

    /// Negotiated capabilities, if running.
    #[must_use]
    pub fn capabilities(&self) -> Option<ServerCapabilities> {
        self.running_session().map(|s| s.capabilities.clone())
    }

    /// Negotiated position encoding, if running.
    #[must_use]
    pub fn position_encoding(&self) -> Option<PositionEncodingKind> {
        self.running_session().map(|s| s.encoding.clone())
    }

    /// The RPC handle, if running.
    #[must_use]
    pub fn language_server(&self) -> Option<LanguageServer> {
        self.running_session().map(|s| s.rpc.clone())
    }

    /// Returns true if the server is running and its capabilities pass `filter`.
    #[must_use]
    pub fn matches(&self, filter: &CapabilityFilter) -> bool {
        self.running_session()
            .is_some_and(|s| filter.matches(&s.capabilities))
    }

    /// Latest diagnostics published for `uri`.
    #[must_use]
    pub fn diagnostics(&self, uri: &Uri) -> Vec<Diagnostic> {
        self.inner
            .diagnostics
            .get(uri)
            .map(|d| d.clone())
            .unwrap_or_default()
    }

    /// Snapshot for status displays.
    #[must_use]
    pub fn status(&self) -> ServerStatus {
        let session = self.running_session();
        ServerStatus {
            server: self.inner.definition.id.clone(),
            root: self.inner.root.as_ref().map(|r| r.display().to_string()),
            state: self.state(),
            open_documents: self.inner.documents.len(),
            progress: session.as_ref().map(|s| s.progress.active()).unwrap_or_default(),
            uptime_secs: session.as_ref().map_or(0, |s| s.started.elapsed().as_secs()),
            spawn_count: self.spawn_count(),
        }
    }

    fn running_session(&self) -> Option<Arc<Session>> {
        if self.state() != ServerState::Running {
            return None;
        }
        self.inner
            .session
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn not_active(&self, state: ServerState) -> Error {
        Error::ServerNotActive {
            server: self.inner.definition.id.clone(),
            state: state.to_string(),
        }
    }

    fn set_state(&self, state: ServerState) {
        self.inner.state.send_replace(state);
    }

    /// Starts the server if it is not running.
    ///
    /// Concurrent callers share one attempt: exactly one process is spawned
    /// and every caller observes its outcome. The attempt runs on its own
    /// task, so dropping the returned future does not abort the handshake.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Connection`] if the process cannot be spawned or dies
    /// during the handshake, [`Error::RequestTimeout`] if `initialize` takes
    /// too long, or [`Error::ServerNotActive`] while stopping.
    pub async fn start(&self) -> Result<()> {
        self.launch(Launch::Start).await
    }

    async fn launch(&self, launch: Launch) -> Result<()> {
        let seen = self.inner.attempts.load(Ordering::SeqCst);
        let wrapper = self.clone();
        let attempt = tokio::spawn(async move { wrapper.attempt(seen, launch).await });
        attempt.await.unwrap_or_else(|e| {
            Err(Error::Connection {
                server: self.inner.definition.id.clone(),
                reason: format!("start task failed: {e}"),
            })
        })
    }

    async fn attempt(&self, seen: u64, launch: Launch) -> Result<()> {
        let _guard = self.inner.lifecycle.lock().await;

        match self.state() {
            ServerState::Running => return Ok(()),
            ServerState::Crashed if launch == Launch::Restart => {
                if !self.take_restart() {
                    return Err(self.not_active(ServerState::Crashed));
                }
                info!(server = %self.server_id(), "restarting crashed language server");
            }
            state if !state.can_start() => return Err(self.not_active(state)),
            _ => {}
        }

        if self.inner.attempts.load(Ordering::SeqCst) != seen
            && let Some(err) = lock(&self.inner.last_error).clone()
        {
            return Err(err);
        }

        let result = self.start_locked().await;
        if result.is_ok() && launch == Launch::Start {
            self.inner.restarts.store(0, Ordering::SeqCst);
        }
        *lock(&self.inner.last_error) = result.as_ref().err().cloned();
        self.inner.attempts.fetch_add(1, Ordering::SeqCst);
        result
    }

    async fn start_locked(&self) -> Result<()> {
        let definition = Arc::clone(&self.inner.definition);
        let server = definition.id.as_str();

        self.set_state(ServerState::Starting);
        let generation = self.inner.generation.fetch_add(1, Ordering::SeqCst) + 1;
        self.inner.spawn_count.fetch_add(1, Ordering::SeqCst);
        self.inner.dynamic_folders.store(false, Ordering::SeqCst);

        let transport = match definition.launch.start(server, self.inner.root.as_deref()) {
            Ok(transport) => transport,
            Err(e) => {
                warn!(server, "failed to start language server: {e}");
                self.set_state(ServerState::Stopped);
                return Err(e);
            }
        };
        let Transport {
            reader,
            writer,
            process,
        } = transport;

        let (rpc, outbound) = LanguageServer::channel(
            server,
            RpcOptions {
                request_timeout: self.inner.options.request_timeout,
                log_traffic: definition.log_traffic,
            },
        );
        let progress = ProgressManager::new(
            rpc.clone(),
            Arc::clone(&self.inner.monitors),
            self.inner.options.progress_poll,
        );
        let handler = Arc::new(ServerEvents {
            progress: progress.clone(),
            wrapper: Arc::downgrade(&self.inner),
        });

        let weak = Arc::downgrade(&self.inner);
        let dispatcher = tokio::spawn({
            let rpc = rpc.clone();
            async move {
                rpc::serve(rpc, outbound, reader, writer, handler).await;
                if let Some(inner) = weak.upgrade() {
                    Self { inner }.on_disconnect(generation);
                }
            }
        });

        let session = Session {
            rpc: rpc.clone(),
            capabilities: ServerCapabilities::default(),
            encoding: PositionEncodingKind::UTF16,
            progress,
            process: Mutex::new(process),
            dispatcher: Mutex::new(Some(dispatcher)),
            started: Instant::now(),
        };

        self.set_state(ServerState::Initializing);
        let init = rpc
            .request_with_timeout::<_, lsp_types::InitializeResult>(
                "initialize",
                self.initialize_params(),
                self.inner.options.init_timeout,
            )
            .await;

        let init = match init.and_then(|init| rpc.initialized().map(|()| init)) {
            Ok(init) => init,
            Err(e) => {
                let err = match e {
                    Error::ServerDisconnected { .. } => Error::Connection {
                        server: server.to_string(),
                        reason: "server exited during initialization".to_string(),
                    },
                    other => other,
                };
                warn!(server, "initialization failed: {err}");
                self.set_state(ServerState::Stopping);
                self.teardown(session, Duration::from_millis(200)).await;
                self.set_state(ServerState::Stopped);
                return Err(err);
            }
        };

        let encoding = init
            .capabilities
            .position_encoding
            .clone()
            .unwrap_or(PositionEncodingKind::UTF16);
        debug!(server, "Negotiated position encoding: {encoding:?}");

        let session = Arc::new(Session {
            capabilities: init.capabilities,
            encoding,
            ..session
        });
        *self
            .inner
            .session
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Some(Arc::clone(&session));

        let promoted = self.inner.state.send_if_modified(|state| {
            if *state == ServerState::Initializing {
                *state = ServerState::Running;
                true
            } else {
                false
            }
        });
        if !promoted {
            self.inner
                .session
                .write()
                .unwrap_or_else(PoisonError::into_inner)
                .take();
            if let Ok(session) = Arc::try_unwrap(session) {
                self.teardown(session, Duration::from_millis(200)).await;
            }
            self.set_state(ServerState::Stopped);
            return Err(Error::Connection {
                server: server.to_string(),
                reason: "server exited during initialization".to_string(),
            });
        }

        info!(
            server,
            root = ?self.inner.root,
            name = init.server_info.as_ref().map_or("", |i| i.name.as_str()),
            "language server started"
        );
        Ok(())
    }

    fn initialize_params(&self) -> InitializeParams {
        let folders: Vec<WorkspaceFolder> = lock(&self.inner.roots)
            .iter()
            .filter_map(|root| workspace_folder(root))
            .collect();

        InitializeParams {
            process_id: Some(std::process::id()),
            client_info: Some(ClientInfo {
                name: "tether".to_string(),
                version: Some(env!("CARGO_PKG_VERSION").to_string()),
            }),
            capabilities: capabilities::client_capabilities(),
            initialization_options: self.inner.definition.initialization_options.clone(),
            workspace_folders: (!folders.is_empty()).then_some(folders),
            ..Default::default()
        }
    }

    /// Closes the connection and reaps the process and dispatcher.
    async fn teardown(&self, session: Session, grace: Duration) {
        session.rpc.fail_pending(|| self.not_active(ServerState::Stopping));
        session.rpc.close();
        session.progress.dispose();

        let process = lock(&session.process).take();
        if let Some(process) = process {
            process.terminate(grace).await;
        }

        let dispatcher = lock(&session.dispatcher).take();
        if let Some(mut dispatcher) = dispatcher
            && tokio::time::timeout(DISPATCHER_JOIN_TIMEOUT, &mut dispatcher)
                .await
                .is_err()
        {
            debug!(server = %self.inner.definition.id, "dispatcher did not finish, aborting");
            dispatcher.abort();
        }
    }

    /// Called by the dispatcher when the server's output closes.
    fn on_disconnect(&self, generation: u64) {
        let server = self.inner.definition.id.as_str();
        if self.inner.generation.load(Ordering::SeqCst) != generation {
            trace!(server, generation, "stale dispatcher finished");
            return;
        }

        let mut previous = ServerState::NotStarted;
        let crashed = self.inner.state.send_if_modified(|state| {
            previous = *state;
            if state.is_alive() {
                *state = ServerState::Crashed;
                true
            } else {
                false
            }
        });
        if !crashed {
            debug!(server, state = %previous, "connection closed");
            return;
        }

        warn!(server, root = ?self.inner.root, "language server exited unexpectedly");

        let session = self
            .inner
            .session
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(session) = session {
            session.progress.dispose();
            let process = lock(&session.process).take();
            if let Some(process) = process {
                tokio::spawn(process.terminate(Duration::from_millis(100)));
            }
        }
        self.inner.documents.clear();
        self.inner.diagnostics.clear();

        if previous == ServerState::Running
            && self.inner.options.restart_policy == RestartPolicy::Eager
        {
            let wrapper = self.clone();
            tokio::spawn(async move {
                if let Err(e) = wrapper.launch(Launch::Restart).await {
                    warn!(server = %wrapper.server_id(), "restart failed: {e}");
                }
            });
        }
    }

    /// Whether a crashed wrapper may start again. Called under the lifecycle lock.
    fn take_restart(&self) -> bool {
        match self.inner.options.restart_policy {
            RestartPolicy::Never => false,
            RestartPolicy::OnDemand => true,
            RestartPolicy::Eager => {
                let max = self.inner.options.max_restarts;
                self.inner
                    .restarts
                    .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
                        (n < max).then_some(n + 1)
                    })
                    .is_ok()
            }
        }
    }

    async fn ensure_running(&self) -> Result<Arc<Session>> {
        if let Some(session) = self.running_session() {
            return Ok(session);
        }
        match self.state() {
            ServerState::Stopping => return Err(self.not_active(ServerState::Stopping)),
            ServerState::Crashed => self.launch(Launch::Restart).await?,
            _ => self.start().await?,
        }
        self.running_session()
            .ok_or_else(|| self.not_active(self.state()))
    }

    /// Starts the server if needed and returns its RPC handle.
    ///
    /// A crashed wrapper is restarted only when the restart policy allows it.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ServerNotActive`] if the wrapper cannot run work, or
    /// any start failure.
    pub async fn activate(&self) -> Result<LanguageServer> {
        Ok(self.ensure_running().await?.rpc.clone())
    }

    /// Runs `work` against the server, starting it first if needed.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ServerNotActive`] if the wrapper cannot run work,
    /// any start failure, or whatever `work` returns.
    pub async fn execute<F, Fut, R>(&self, work: F) -> Result<R>
    where
        F: FnOnce(LanguageServer) -> Fut,
        Fut: Future<Output = Result<R>>,
    {
        let session = self.ensure_running().await?;
        work(session.rpc.clone()).await
    }

    /// Spawns [`execute`](Self::execute) and returns a cancellable handle at once.
    pub fn submit<F, Fut, R>(&self, work: F) -> Pending<R>
    where
        F: FnOnce(LanguageServer) -> Fut + Send + 'static,
        Fut: Future<Output = Result<R>> + Send,
        R: Send + 'static,
    {
        let wrapper = self.clone();
        Pending::spawn(&CancellationToken::new(), async move {
            wrapper.execute(work).await
        })
    }

    /// Opens `document` on the server, or adds a reference if already open.
    ///
    /// Returns true if `didOpen` was sent.
    ///
    /// # Errors
    ///
    /// Returns an error if the server cannot be started or the connection is closed.
    pub async fn connect_document(&self, document: &DocumentSnapshot) -> Result<bool> {
        let session = self.ensure_running().await?;
        match self.inner.documents.entry(document.uri.clone()) {
            Entry::Occupied(mut entry) => {
                entry.get_mut().refcount += 1;
                trace!(server = %self.server_id(), uri = document.uri.as_str(), refcount = entry.get().refcount, "document already open");
                Ok(false)
            }
            Entry::Vacant(entry) => {
                self.open(&session, document)?;
                entry.insert(DocumentEntry {
                    refcount: 1,
                    version: document.version,
                });
                Ok(true)
            }
        }
    }

    /// Opens `document` unless it is already open, without adding a reference.
    ///
    /// The document stays open until an editor connects and later releases
    /// it, or the server stops. Returns true if `didOpen` was sent.
    ///
    /// # Errors
    ///
    /// Returns an error if the server cannot be started or the connection is closed.
    pub async fn ensure_document(&self, document: &DocumentSnapshot) -> Result<bool> {
        if self.is_connected_to(&document.uri) && self.state() == ServerState::Running {
            return Ok(false);
        }
        let session = self.ensure_running().await?;
        match self.inner.documents.entry(document.uri.clone()) {
            Entry::Occupied(_) => Ok(false),
            Entry::Vacant(entry) => {
                self.open(&session, document)?;
                entry.insert(DocumentEntry {
                    refcount: 0,
                    version: document.version,
                });
                Ok(true)
            }
        }
    }

    fn open(&self, session: &Session, document: &DocumentSnapshot) -> Result<()> {
        session.rpc.did_open(DidOpenTextDocumentParams {
            text_document: TextDocumentItem {
                uri: document.uri.clone(),
                language_id: self.inner.definition.language_id_for(document),
                version: document.version,
                text: document.text.clone(),
            },
        })?;
        debug!(server = %self.server_id(), uri = document.uri.as_str(), "opened document");
        Ok(())
    }

    /// Sends the full new text of an open document.
    ///
    /// Returns true if `didChange` was sent.
    ///
    /// # Errors
    ///
    /// Returns an error if the connection is closed.
    pub fn change_document(&self, uri: &Uri, text: &str) -> Result<bool> {
        self.change_document_with(
            uri,
            vec![TextDocumentContentChangeEvent {
                range: None,
                range_length: None,
                text: text.to_string(),
            }],
        )
    }

    /// Sends content changes for an open document.
    ///
    /// Nothing is sent when the server does not synchronize documents or the
    /// document is not open. Returns true if `didChange` was sent.
    ///
    /// # Errors
    ///
    /// Returns an error if the connection is closed.
    pub fn change_document_with(
        &self,
        uri: &Uri,
        changes: Vec<TextDocumentContentChangeEvent>,
    ) -> Result<bool> {
        let Some(session) = self.running_session() else {
            return Ok(false);
        };
        if capabilities::sync_kind(&session.capabilities) == TextDocumentSyncKind::NONE {
            return Ok(false);
        }
        let Some(mut entry) = self.inner.documents.get_mut(uri) else {
            return Ok(false);
        };
        entry.version += 1;
        session.rpc.did_change(DidChangeTextDocumentParams {
            text_document: VersionedTextDocumentIdentifier {
                uri: uri.clone(),
                version: entry.version,
            },
            content_changes: changes,
        })?;
        Ok(true)
    }

    /// Notifies the server that a document was saved, if it asked for that.
    ///
    /// Returns true if `didSave` was sent.
    ///
    /// # Errors
    ///
    /// Returns an error if the connection is closed.
    pub fn save_document(&self, uri: &Uri, text: Option<&str>) -> Result<bool> {
        let Some(session) = self.running_session() else {
            return Ok(false);
        };
        if !self.is_connected_to(uri) {
            return Ok(false);
        }
        let Some(include_text) = capabilities::save_options(&session.capabilities) else {
            return Ok(false);
        };
        session.rpc.did_save(DidSaveTextDocumentParams {
            text_document: TextDocumentIdentifier { uri: uri.clone() },
            text: if include_text {
                text.map(str::to_string)
            } else {
                None
            },
        })?;
        Ok(true)
    }

    /// Drops one reference to `uri`; the last one sends `didClose`.
    ///
    /// Returns true if `didClose` was sent.
    ///
    /// # Errors
    ///
    /// Returns an error if the connection is closed.
    pub fn disconnect_document(&self, uri: &Uri) -> Result<bool> {
        let closed = match self.inner.documents.entry(uri.clone()) {
            Entry::Vacant(_) => return Ok(false),
            Entry::Occupied(mut entry) => {
                let refcount = &mut entry.get_mut().refcount;
                *refcount = refcount.saturating_sub(1);
                if *refcount > 0 {
                    return Ok(false);
                }
                entry.remove();
                match self.running_session() {
                    Some(session) => {
                        session.rpc.did_close(DidCloseTextDocumentParams {
                            text_document: TextDocumentIdentifier { uri: uri.clone() },
                        })?;
                        debug!(server = %self.server_id(), uri = uri.as_str(), "closed document");
                        true
                    }
                    None => false,
                }
            }
        };

        if closed && self.inner.definition.stop_when_unused && self.inner.documents.is_empty() {
            debug!(server = %self.server_id(), "last document closed, stopping");
            drop(self.stop_dispatcher());
        }
        Ok(closed)
    }

    /// Returns true if this wrapper can serve documents under `root`.
    #[must_use]
    pub fn can_operate(&self, root: &Path) -> bool {
        if self.inner.definition.mode == LaunchMode::Singleton {
            return true;
        }
        if lock(&self.inner.roots).iter().any(|r| r == root) {
            return true;
        }
        self.supports_workspace_folders()
    }

    fn supports_workspace_folders(&self) -> bool {
        self.inner.dynamic_folders.load(Ordering::SeqCst)
            || self
                .running_session()
                .is_some_and(|s| capabilities::supports_workspace_folders(&s.capabilities))
    }

    /// Adds `root` to the workspace folders served by this wrapper.
    ///
    /// A running server that supports workspace folders is notified.
    /// Returns true if the root was new.
    ///
    /// # Errors
    ///
    /// Returns an error if the notification cannot be sent.
    pub fn watch_root(&self, root: &Path) -> Result<bool> {
        {
            let mut roots = lock(&self.inner.roots);
            if roots.iter().any(|r| r == root) {
                return Ok(false);
            }
            roots.push(root.to_path_buf());
        }
        self.notify_folders(Some(root), None)?;
        Ok(true)
    }

    /// Removes `root` from the workspace folders. Returns true if it was watched.
    ///
    /// # Errors
    ///
    /// Returns an error if the notification cannot be sent.
    pub fn unwatch_root(&self, root: &Path) -> Result<bool> {
        let removed = {
            let mut roots = lock(&self.inner.roots);
            let before = roots.len();
            roots.retain(|r| r != root);
            before != roots.len()
        };
        if removed {
            self.notify_folders(None, Some(root))?;
        }
        Ok(removed)
    }

    /// Roots currently served.
    #[must_use]
    pub fn watched_roots(&self) -> Vec<PathBuf> {
        lock(&self.inner.roots).clone()
    }

    fn notify_folders(&self, added: Option<&Path>, removed: Option<&Path>) -> Result<()> {
        if !self.supports_workspace_folders() {
            return Ok(());
        }
        let Some(session) = self.running_session() else {
            return Ok(());
        };
        session
            .rpc
            .did_change_workspace_folders(DidChangeWorkspaceFoldersParams {
                event: WorkspaceFoldersChangeEvent {
                    added: added.and_then(workspace_folder).into_iter().collect(),
                    removed: removed.and_then(workspace_folder).into_iter().collect(),
                },
            })
    }

    /// Shuts the server down. Always ends in `Stopped`; calling it again is a no-op.
    ///
    /// Requests still in flight complete with [`Error::ServerNotActive`].
    pub async fn stop(&self) {
        let _guard = self.inner.lifecycle.lock().await;
        let state = self.state();
        if matches!(state, ServerState::NotStarted | ServerState::Stopped) {
            return;
        }

        let server = self.inner.definition.id.as_str();
        self.set_state(ServerState::Stopping);

        let session = self
            .inner
            .session
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(session) = session {
            let stopping = || self.not_active(ServerState::Stopping);
            session.rpc.fail_pending(stopping);
            let grace = self.inner.options.shutdown_grace;
            if !session.rpc.is_closed() {
                match session.rpc.shutdown(grace).await {
                    Ok(_) => debug!(server, "shutdown acknowledged"),
                    Err(e) => debug!(server, "shutdown request failed: {e}"),
                }
                if let Err(e) = session.rpc.exit() {
                    debug!(server, "failed to send exit: {e}");
                }
            }
            match Arc::try_unwrap(session) {
                Ok(session) => self.teardown(session, grace).await,
                Err(shared) => {
                    // Someone still holds the session; close it and let them finish.
                    shared.rpc.fail_pending(stopping);
                    shared.rpc.close();
                    shared.progress.dispose();
                    let process = lock(&shared.process).take();
                    if let Some(process) = process {
                        process.terminate(grace).await;
                    }
                }
            }
        }

        self.inner.documents.clear();
        self.inner.diagnostics.clear();
        self.set_state(ServerState::Stopped);
        info!(server, root = ?self.inner.root, "language server stopped");
    }

    /// Starts [`stop`](Self::stop) in the background and returns at once.
    pub fn stop_dispatcher(&self) -> JoinHandle<()> {
        let wrapper = self.clone();
        tokio::spawn(async move { wrapper.stop().await })
    }
}

fn workspace_folder(root: &Path) -> Option<WorkspaceFolder> {
    let uri = path_to_uri(root).ok()?;
    let name = root
        .file_name()
        .map_or_else(|| "workspace".to_string(), |s| s.to_string_lossy().to_string());
    Some(WorkspaceFolder { uri, name })
}

/// Methods a server may register dynamically.
fn registered_methods(params: &Value, key: &str) -> Vec<String> {
    params
        .get(key)
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(|item| item.get("method").and_then(Value::as_str))
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

const WORKSPACE_FOLDERS_METHOD: &str = "workspace/didChangeWorkspaceFolders";

/// Handles server-initiated traffic for one wrapper.
struct ServerEvents {
    progress: ProgressManager,
    wrapper: Weak<Inner>,
}

impl MessageHandler for ServerEvents {
    fn on_notification(&self, method: &str, params: Value) {
        match method {
            "$/progress" => match serde_json::from_value::<ProgressParams>(params) {
                Ok(params) => self.progress.notify_progress(params),
                Err(e) => debug!("Failed to parse progress params: {e}"),
            },
            "textDocument/publishDiagnostics" => {
                match serde_json::from_value::<PublishDiagnosticsParams>(params) {
                    Ok(params) => {
                        debug!(
                            "Received {} diagnostics for {:?}",
                            params.diagnostics.len(),
                            params.uri.as_str()
                        );
                        if let Some(inner) = self.wrapper.upgrade() {
                            inner.diagnostics.insert(params.uri, params.diagnostics);
                        }
                    }
                    Err(e) => debug!("Failed to parse publishDiagnostics params: {e}"),
                }
            }
            "window/logMessage" | "window/showMessage" => {
                if let Some(message) = params.get("message").and_then(Value::as_str) {
                    debug!("LSP server message: {message}");
                }
            }
            _ => trace!("Ignoring notification: {method} params={params}"),
        }
    }

    fn on_request(&self, method: &str, params: Value) -> Result<Value, ResponseError> {
        let invalid = |e: serde_json::Error| ResponseError {
            code: -32602,
            message: format!("invalid params: {e}"),
            data: None,
        };

        match method {
            "window/workDoneProgress/create" => {
                let params: WorkDoneProgressCreateParams =
                    serde_json::from_value(params).map_err(invalid)?;
                self.progress.create_progress(&params.token);
                Ok(Value::Null)
            }
            "client/registerCapability" => {
                if registered_methods(&params, "registrations")
                    .iter()
                    .any(|m| m == WORKSPACE_FOLDERS_METHOD)
                    && let Some(inner) = self.wrapper.upgrade()
                {
                    inner.dynamic_folders.store(true, Ordering::SeqCst);
                }
                Ok(Value::Null)
            }
            "client/unregisterCapability" => {
                // The protocol spells this field "unregisterations".
                if registered_methods(&params, "unregisterations")
                    .iter()
                    .any(|m| m == WORKSPACE_FOLDERS_METHOD)
                    && let Some(inner) = self.wrapper.upgrade()
                {
                    inner.dynamic_folders.store(false, Ordering::SeqCst);
                }
                Ok(Value::Null)
            }
            "workspace/configuration" => {
                let params: ConfigurationParams = serde_json::from_value(params).map_err(invalid)?;
                Ok(Value::Array(vec![Value::Null; params.items.len()]))
            }
            "workspace/workspaceFolders" => {
                let folders: Vec<WorkspaceFolder> = self
                    .wrapper
                    .upgrade()
                    .map(|inner| lock(&inner.roots).iter().filter_map(|r| workspace_folder(r)).collect())
                    .unwrap_or_default();
                serde_json::to_value(folders).map_err(invalid)
            }
            "window/showMessageRequest" => Ok(Value::Null),
            _ => Err(rpc::method_not_found(method)),
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
    use crate::lsp::connection::ProcessConnection;

    fn wrapper(command: &str) -> ServerWrapper {
        let definition = ServerDefinition::new("test", ProcessConnection::new(command, Vec::<String>::new()));
        ServerWrapper::new(Arc::new(definition), None, WrapperOptions::default())
    }

    #[test]
    fn test_registered_methods() {
        let params = serde_json::json!({
            "registrations": [
                {"id": "1", "method": "workspace/didChangeWorkspaceFolders"},
                {"id": "2", "method": "textDocument/formatting", "registerOptions": {}}
            ]
        });
        assert_eq!(
            registered_methods(&params, "registrations"),
            ["workspace/didChangeWorkspaceFolders", "textDocument/formatting"]
        );
        assert!(registered_methods(&params, "unregisterations").is_empty());
    }

    #[tokio::test]
    async fn test_new_wrapper_is_idle() {
        let wrapper = wrapper("/nonexistent/server");
        assert_eq!(wrapper.state(), ServerState::NotStarted);
        assert!(!wrapper.is_active());
        assert_eq!(wrapper.spawn_count(), 0);
        assert!(wrapper.capabilities().is_none());
        assert!(wrapper.same_as(&wrapper.clone()));
    }

    #[tokio::test]
    async fn test_spawn_failure_leaves_stopped() {
        let wrapper = wrapper("/nonexistent/server");
        let err = wrapper.start().await.unwrap_err();
        assert!(matches!(err, Error::Connection { .. }));
        assert_eq!(wrapper.state(), ServerState::Stopped);

        let err = wrapper.execute(|_| async { Ok(()) }).await.unwrap_err();
        assert!(matches!(err, Error::Connection { .. }));
    }

    #[tokio::test]
    async fn test_stop_before_start_is_noop() {
        let wrapper = wrapper("/nonexistent/server");
        wrapper.stop().await;
        wrapper.stop().await;
        assert_eq!(wrapper.state(), ServerState::NotStarted);
    }

    #[tokio::test]
    async fn test_disconnect_unknown_document() {
        let wrapper = wrapper("/nonexistent/server");
        let uri = path_to_uri(Path::new("/tmp/nothing.rs")).unwrap();
        assert!(!wrapper.disconnect_document(&uri).unwrap());
        assert!(!wrapper.change_document(&uri, "x").unwrap());
        assert!(!wrapper.save_document(&uri, None).unwrap());
    }

    #[tokio::test]
    async fn test_roots_are_tracked_without_server() {
        let definition = ServerDefinition::new("test", ProcessConnection::new("x", Vec::<String>::new()));
        let wrapper = ServerWrapper::new(
            Arc::new(definition),
            Some(PathBuf::from("/work/a")),
            WrapperOptions::default(),
        );
        assert!(wrapper.can_operate(Path::new("/work/a")));
        assert!(!wrapper.can_operate(Path::new("/work/b")));
        assert!(wrapper.watch_root(Path::new("/work/b")).unwrap());
        assert!(!wrapper.watch_root(Path::new("/work/b")).unwrap());
        assert!(wrapper.can_operate(Path::new("/work/b")));
        assert!(wrapper.unwatch_root(Path::new("/work/b")).unwrap());
        assert_eq!(wrapper.watched_roots(), [PathBuf::from("/work/a")]);
    }

    #[tokio::test]
    async fn test_server_requests_are_answered() {
        let definition = ServerDefinition::new("test", ProcessConnection::new("x", Vec::<String>::new()));
        let wrapper = ServerWrapper::new(
            Arc::new(definition),
            Some(PathBuf::from("/work/a")),
            WrapperOptions::default(),
        );
        let (server, _outbound) = LanguageServer::channel("test", RpcOptions::default());
        let events = ServerEvents {
            progress: ProgressManager::new(server, Arc::new(LogMonitors), Duration::from_millis(10)),
            wrapper: Arc::downgrade(&wrapper.inner),
        };

        let items = serde_json::json!({ "items": [{ "section": "a" }, { "section": "b" }] });
        assert_eq!(
            events.on_request("workspace/configuration", items).unwrap(),
            serde_json::json!([null, null])
        );

        let folders = events
            .on_request("workspace/workspaceFolders", Value::Null)
            .unwrap();
        assert_eq!(folders.as_array().map(Vec::len), Some(1));
        assert!(folders[0]["uri"].as_str().unwrap().ends_with("/work/a"));

        let registration = serde_json::json!({
            "registrations": [{ "id": "1", "method": WORKSPACE_FOLDERS_METHOD }]
        });
        events.on_request("client/registerCapability", registration).unwrap();
        assert!(wrapper.inner.dynamic_folders.load(Ordering::SeqCst));

        let err = events.on_request("custom/unknown", Value::Null).unwrap_err();
        assert_eq!(err.code, rpc::method_not_found("custom/unknown").code);
        let err = events
            .on_request("workspace/configuration", serde_json::json!({ "items": 3 }))
            .unwrap_err();
        assert_eq!(err.code, -32602);
    }
}
