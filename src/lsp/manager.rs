// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (C) 2026 Mark Wells <contact@markwells.dev>

//! The routing table from documents and projects to running servers.

use dashmap::DashMap;
use lsp_types::Uri;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::executor::{DocumentExecutor, ProjectExecutor};
use super::progress::{LogMonitors, MonitorFactory};
use super::registry::{ServerDefinition, ServerRegistry};
use super::state::ServerStatus;
use super::wrapper::{ServerWrapper, WrapperOptions};
use crate::config::{Config, LaunchMode};
use crate::document::DocumentSnapshot;
use crate::error::Result;

/// Identifies one wrapper: a definition bound to a scope.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct WrapperKey {
    /// Definition id.
    pub server: String,
    /// Project root, `None` for singleton servers.
    pub root: Option<PathBuf>,
}

/// Every server known to one host session.
///
/// Constructed once and shared through an `Arc`. Wrappers are created on
/// first use and live until [`close_project`](Self::close_project) or
/// [`shutdown_all`](Self::shutdown_all).
pub struct LanguageServers {
    registry: ServerRegistry,
    config: Config,
    options: WrapperOptions,
    monitors: Arc<dyn MonitorFactory>,
    wrappers: DashMap<WrapperKey, ServerWrapper>,
    shutdown: CancellationToken,
}

impl std::fmt::Debug for LanguageServers {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LanguageServers")
            .field("registry", &self.registry)
            .field("wrappers", &self.wrappers.len())
            .finish_non_exhaustive()
    }
}

impl LanguageServers {
    /// Creates an empty routing table over `registry`.
    #[must_use]
    pub fn new(registry: ServerRegistry, config: Config) -> Self {
        Self {
            options: WrapperOptions::from(&config),
            registry,
            config,
            monitors: Arc::new(LogMonitors),
            wrappers: DashMap::new(),
            shutdown: CancellationToken::new(),
        }
    }

    /// Builds the registry from the `[server.*]` tables of `config`.
    ///
    /// # Errors
    ///
    /// Returns an error if a server definition is invalid.
    pub fn from_config(config: Config) -> Result<Self> {
        let registry = ServerRegistry::from_config(&config)?;
        Ok(Self::new(registry, config))
    }

    /// Uses `monitors` for progress reported by servers created from now on.
    #[must_use]
    pub fn with_monitors(mut self, monitors: Arc<dyn MonitorFactory>) -> Self {
        self.monitors = monitors;
        self
    }

    /// The server definitions.
    #[must_use]
    pub const fn registry(&self) -> &ServerRegistry {
        &self.registry
    }

    /// The settings this context was built with.
    #[must_use]
    pub const fn config(&self) -> &Config {
        &self.config
    }

    /// Cancelled by [`shutdown_all`](Self::shutdown_all); parent of every executor token.
    #[must_use]
    pub fn cancellation_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Executor over the servers handling `document`.
    #[must_use]
    pub fn for_document(self: &Arc<Self>, document: &DocumentSnapshot) -> DocumentExecutor {
        DocumentExecutor::new(Arc::clone(self), document.clone())
    }

    /// Executor over the servers already bound to `root`.
    #[must_use]
    pub fn for_project(self: &Arc<Self>, root: impl Into<PathBuf>) -> ProjectExecutor {
        ProjectExecutor::new(Arc::clone(self), root.into())
    }

    /// The wrapper for `definition` in the scope of `root`, creating it if needed.
    ///
    /// Creation is atomic: concurrent callers for the same key receive the
    /// same wrapper. A running per-project server that can serve extra
    /// workspace folders is reused for a new root.
    pub fn wrapper_for(&self, definition: &Arc<ServerDefinition>, root: Option<&Path>) -> ServerWrapper {
        let scope = match definition.mode {
            LaunchMode::Singleton => None,
            LaunchMode::PerProject => root.map(Path::to_path_buf),
        };
        let key = WrapperKey {
            server: definition.id.clone(),
            root: scope.clone(),
        };

        if let Some(existing) = self.wrappers.get(&key) {
            let wrapper = existing.clone();
            drop(existing);
            if scope.is_none() {
                self.watch(&wrapper, root);
            }
            return wrapper;
        }

        if let Some(root) = scope.as_deref()
            && let Some(shared) = self.shared_wrapper(&definition.id, root)
        {
            self.watch(&shared, Some(root));
            return self.wrappers.entry(key).or_insert(shared).clone();
        }

        let wrapper = self
            .wrappers
            .entry(key)
            .or_insert_with(|| {
                debug!(server = %definition.id, root = ?scope, "creating server wrapper");
                ServerWrapper::with_monitors(
                    Arc::clone(definition),
                    scope.clone(),
                    self.options,
                    Arc::clone(&self.monitors),
                )
            })
            .clone();
        if scope.is_none() {
            self.watch(&wrapper, root);
        }
        wrapper
    }

    fn shared_wrapper(&self, server: &str, root: &Path) -> Option<ServerWrapper> {
        let candidates: Vec<ServerWrapper> = self
            .wrappers
            .iter()
            .filter(|entry| entry.key().server == server)
            .map(|entry| entry.value().clone())
            .collect();
        candidates
            .into_iter()
            .find(|wrapper| wrapper.is_active() && wrapper.can_operate(root))
    }

    fn watch(&self, wrapper: &ServerWrapper, root: Option<&Path>) {
        let Some(root) = root else {
            return;
        };
        if let Err(e) = wrapper.watch_root(root) {
            warn!(server = %wrapper.server_id(), "failed to add workspace folder {}: {e}", root.display());
        }
    }

    /// Wrappers for every definition matching `document`, in registry order.
    #[must_use]
    pub fn wrappers_for_document(&self, document: &DocumentSnapshot) -> Vec<ServerWrapper> {
        let root = document.project_root();
        self.registry
            .matching(document)
            .iter()
            .map(|definition| self.wrapper_for(definition, root.as_deref()))
            .collect()
    }

    /// Wrappers already bound to `root`, in registry order.
    ///
    /// With `exclude_inactive`, only wrappers with a live process are returned.
    #[must_use]
    pub fn project_wrappers(&self, root: &Path, exclude_inactive: bool) -> Vec<ServerWrapper> {
        let mut found: Vec<ServerWrapper> = Vec::new();
        let bound: Vec<(WrapperKey, ServerWrapper)> = self
            .wrappers
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect();

        for definition in self.registry.definitions() {
            for (key, wrapper) in &bound {
                if key.server != definition.id {
                    continue;
                }
                let serves_root = key.root.as_deref() == Some(root)
                    || wrapper.watched_roots().iter().any(|r| r == root);
                if !serves_root || (exclude_inactive && !wrapper.is_active()) {
                    continue;
                }
                if !found.iter().any(|w| w.same_as(wrapper)) {
                    found.push(wrapper.clone());
                }
            }
        }
        found
    }

    /// Opens `document` on every matching server, adding an editor reference.
    ///
    /// Servers that fail to start are logged and skipped. Returns the
    /// wrappers the document is now bound to.
    pub async fn connect_document(&self, document: &DocumentSnapshot) -> Vec<ServerWrapper> {
        let wrappers = self.wrappers_for_document(document);
        let attempts = futures::future::join_all(
            wrappers
                .iter()
                .map(|wrapper| async move { (wrapper, wrapper.connect_document(document).await) }),
        )
        .await;

        let mut connected = Vec::new();
        for (wrapper, result) in attempts {
            match result {
                Ok(_) => connected.push(wrapper.clone()),
                Err(e) => warn!(server = %wrapper.server_id(), uri = document.uri.as_str(), "failed to open document: {e}"),
            }
        }
        connected
    }

    fn bound_to(&self, uri: &Uri) -> Vec<ServerWrapper> {
        let mut found: Vec<ServerWrapper> = Vec::new();
        for entry in &self.wrappers {
            let wrapper = entry.value();
            if wrapper.is_connected_to(uri) && !found.iter().any(|w| w.same_as(wrapper)) {
                found.push(wrapper.clone());
            }
        }
        found
    }

    /// Sends the new full text of `uri` to every server it is open on.
    pub fn change_document(&self, uri: &Uri, text: &str) {
        for wrapper in self.bound_to(uri) {
            if let Err(e) = wrapper.change_document(uri, text) {
                warn!(server = %wrapper.server_id(), uri = uri.as_str(), "failed to send change: {e}");
            }
        }
    }

    /// Notifies every server `uri` is open on that it was saved.
    pub fn save_document(&self, uri: &Uri, text: Option<&str>) {
        for wrapper in self.bound_to(uri) {
            if let Err(e) = wrapper.save_document(uri, text) {
                warn!(server = %wrapper.server_id(), uri = uri.as_str(), "failed to send save: {e}");
            }
        }
    }

    /// Drops one editor reference to `uri` on every server it is open on.
    pub fn close_document(&self, uri: &Uri) {
        for wrapper in self.bound_to(uri) {
            if let Err(e) = wrapper.disconnect_document(uri) {
                debug!(server = %wrapper.server_id(), uri = uri.as_str(), "failed to send close: {e}");
            }
        }
    }

    /// Stops the servers bound to `root` and forgets them.
    ///
    /// Shared servers keep running for their other roots.
    pub async fn close_project(&self, root: &Path) {
        let keys: Vec<WrapperKey> = self
            .wrappers
            .iter()
            .filter(|entry| entry.key().root.as_deref() == Some(root))
            .map(|entry| entry.key().clone())
            .collect();

        let mut stopping = Vec::new();
        for key in keys {
            let Some((_, wrapper)) = self.wrappers.remove(&key) else {
                continue;
            };
            let _ = wrapper.unwatch_root(root);
            let still_bound = self.wrappers.iter().any(|entry| entry.value().same_as(&wrapper));
            if !still_bound && !stopping.iter().any(|w: &ServerWrapper| w.same_as(&wrapper)) {
                stopping.push(wrapper);
            }
        }

        let singletons: Vec<ServerWrapper> = self
            .wrappers
            .iter()
            .filter(|entry| entry.key().root.is_none())
            .map(|entry| entry.value().clone())
            .collect();
        for wrapper in singletons {
            if let Err(e) = wrapper.unwatch_root(root) {
                debug!(server = %wrapper.server_id(), "failed to remove workspace folder: {e}");
            }
        }

        futures::future::join_all(stopping.iter().map(ServerWrapper::stop)).await;
        info!(root = %root.display(), "closed project");
    }

    /// Cancels outstanding executor work and stops every server.
    pub async fn shutdown_all(&self) {
        self.shutdown.cancel();
        let mut wrappers: Vec<ServerWrapper> = Vec::new();
        for entry in &self.wrappers {
            if !wrappers.iter().any(|w| w.same_as(entry.value())) {
                wrappers.push(entry.value().clone());
            }
        }
        self.wrappers.clear();
        futures::future::join_all(wrappers.iter().map(ServerWrapper::stop)).await;
        info!(count = wrappers.len(), "all language servers stopped");
    }

    /// Status of every wrapper, ordered by server id then root.
    #[must_use]
    pub fn statuses(&self) -> Vec<ServerStatus> {
        let mut entries: Vec<(WrapperKey, ServerWrapper)> = self
            .wrappers
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect();
        entries.sort_by(|a, b| a.0.cmp(&b.0));

        let mut seen: Vec<ServerWrapper> = Vec::new();
        let mut statuses = Vec::new();
        for (_, wrapper) in entries {
            if seen.iter().any(|w| w.same_as(&wrapper)) {
                continue;
            }
            statuses.push(wrapper.status());
            seen.push(wrapper);
        }
        statuses
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
    use crate::config::ServerConfig;
    use crate::document::path_to_uri;

    fn servers() -> Arc<LanguageServers> {
        let config = Config::default()
            .with_server("rust", ServerConfig::command("ra", Vec::<String>::new()).languages(["rust"]))
            .with_server(
                "spell",
                ServerConfig::command("typos", Vec::<String>::new()).mode(LaunchMode::Singleton),
            );
        Arc::new(LanguageServers::from_config(config).unwrap())
    }

    fn doc(path: &str, root: &str) -> DocumentSnapshot {
        DocumentSnapshot::new(path_to_uri(Path::new(path)).unwrap(), "rust", "").with_root(root)
    }

    #[test]
    fn test_same_scope_same_wrapper() {
        let servers = servers();
        let a = servers.wrappers_for_document(&doc("/w/a/src/lib.rs", "/w/a"));
        let b = servers.wrappers_for_document(&doc("/w/a/src/main.rs", "/w/a"));
        assert_eq!(a.len(), 2);
        assert!(a[0].same_as(&b[0]));
        assert!(a[1].same_as(&b[1]));
    }

    #[test]
    fn test_per_project_and_singleton_scopes() {
        let servers = servers();
        let a = servers.wrappers_for_document(&doc("/w/a/lib.rs", "/w/a"));
        let b = servers.wrappers_for_document(&doc("/w/b/lib.rs", "/w/b"));

        assert_eq!(a[0].server_id(), "rust");
        assert!(!a[0].same_as(&b[0]));
        assert_eq!(a[0].root(), Some(Path::new("/w/a")));

        assert_eq!(a[1].server_id(), "spell");
        assert!(a[1].same_as(&b[1]));
        assert!(a[1].root().is_none());
        assert_eq!(
            a[1].watched_roots(),
            [PathBuf::from("/w/a"), PathBuf::from("/w/b")]
        );
    }

    #[test]
    fn test_project_wrappers_in_registry_order() {
        let servers = servers();
        servers.wrappers_for_document(&doc("/w/a/lib.rs", "/w/a"));

        let ids: Vec<String> = servers
            .project_wrappers(Path::new("/w/a"), false)
            .iter()
            .map(|w| w.server_id().to_string())
            .collect();
        assert_eq!(ids, ["rust", "spell"]);
        assert!(servers.project_wrappers(Path::new("/w/a"), true).is_empty());
        assert!(servers.project_wrappers(Path::new("/w/other"), false).is_empty());
    }

    #[tokio::test]
    async fn test_close_project_forgets_wrappers() {
        let servers = servers();
        servers.wrappers_for_document(&doc("/w/a/lib.rs", "/w/a"));
        servers.wrappers_for_document(&doc("/w/b/lib.rs", "/w/b"));
        assert_eq!(servers.statuses().len(), 3);

        servers.close_project(Path::new("/w/a")).await;
        let statuses = servers.statuses();
        assert_eq!(statuses.len(), 2);
        assert!(statuses.iter().all(|s| s.root.as_deref() != Some("/w/a")));
    }

    #[tokio::test]
    async fn test_shutdown_all_cancels_token() {
        let servers = servers();
        let token = servers.cancellation_token();
        servers.wrappers_for_document(&doc("/w/a/lib.rs", "/w/a"));
        servers.shutdown_all().await;
        assert!(token.is_cancelled());
        assert!(servers.statuses().is_empty());
    }
}
