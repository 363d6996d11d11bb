// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (C) 2026 Mark Wells <contact@markwells.dev>

//! Static server definitions and document selectors.

use globset::{Glob, GlobMatcher, GlobSet, GlobSetBuilder};
use std::path::Path;
use std::sync::Arc;

use super::connection::ProcessConnection;
use crate::config::{Config, LaunchMode, ServerConfig};
use crate::document::DocumentSnapshot;
use crate::error::{Error, Result};

/// Language ids and file globs a server handles.
///
/// A document matches when its language id is listed or its path matches a
/// glob. A selector with neither matches every document.
#[derive(Debug, Clone, Default)]
pub struct DocumentSelector {
    languages: Vec<String>,
    patterns: Option<GlobSet>,
}

impl DocumentSelector {
    /// Builds a selector.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if a glob is invalid.
    pub fn new(languages: &[String], patterns: &[String]) -> Result<Self> {
        let patterns = if patterns.is_empty() {
            None
        } else {
            let mut builder = GlobSetBuilder::new();
            for pattern in patterns {
                builder.add(compile(pattern)?.glob().clone());
            }
            Some(
                builder
                    .build()
                    .map_err(|e| Error::Config(format!("invalid file patterns: {e}")))?,
            )
        };
        Ok(Self {
            languages: languages.to_vec(),
            patterns,
        })
    }

    /// Returns true if the document is handled.
    #[must_use]
    pub fn matches(&self, language_id: &str, path: Option<&Path>) -> bool {
        if self.languages.is_empty() && self.patterns.is_none() {
            return true;
        }
        if self.languages.iter().any(|l| l == language_id) {
            return true;
        }
        match (&self.patterns, path) {
            (Some(set), Some(path)) => set.is_match(path),
            _ => false,
        }
    }
}

fn compile(pattern: &str) -> Result<GlobMatcher> {
    Glob::new(pattern)
        .map(|glob| glob.compile_matcher())
        .map_err(|e| Error::Config(format!("invalid file pattern '{pattern}': {e}")))
}

/// Immutable description of one language server.
#[derive(Debug, Clone)]
pub struct ServerDefinition {
    /// Unique id.
    pub id: String,
    /// Display name.
    pub label: String,
    /// How to launch the process.
    pub launch: ProcessConnection,
    /// Documents this server handles.
    pub selector: DocumentSelector,
    /// One wrapper per project, or one for the workspace.
    pub mode: LaunchMode,
    /// Sent as `initializationOptions`.
    pub initialization_options: Option<serde_json::Value>,
    /// Log every frame at trace level.
    pub log_traffic: bool,
    /// Stop the process when its last document is closed.
    pub stop_when_unused: bool,
    language_ids: Vec<(GlobMatcher, String)>,
}

impl ServerDefinition {
    /// A definition that launches `launch` for every document.
    #[must_use]
    pub fn new(id: impl Into<String>, launch: ProcessConnection) -> Self {
        let id = id.into();
        Self {
            label: id.clone(),
            id,
            launch,
            selector: DocumentSelector::default(),
            mode: LaunchMode::PerProject,
            initialization_options: None,
            log_traffic: false,
            stop_when_unused: false,
            language_ids: Vec::new(),
        }
    }

    /// Builds a definition from a `[server.<id>]` table.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if a glob is invalid.
    pub fn from_config(id: &str, config: &ServerConfig) -> Result<Self> {
        let launch = ProcessConnection {
            command: config.command.clone(),
            args: config.args.clone(),
            cwd: config.cwd.clone(),
            env: config.env.clone(),
        };

        let language_ids = config
            .language_ids
            .iter()
            .map(|(pattern, language)| Ok((compile(pattern)?, language.clone())))
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            id: id.to_string(),
            label: config.label.clone().unwrap_or_else(|| id.to_string()),
            launch,
            selector: DocumentSelector::new(&config.languages, &config.patterns)?,
            mode: config.mode,
            initialization_options: config.initialization_options.clone(),
            log_traffic: config.log_traffic,
            stop_when_unused: config.stop_when_unused,
            language_ids,
        })
    }

    /// Sets the document selector.
    #[must_use]
    pub fn with_selector(mut self, selector: DocumentSelector) -> Self {
        self.selector = selector;
        self
    }

    /// Sets the launch mode.
    #[must_use]
    pub const fn with_mode(mut self, mode: LaunchMode) -> Self {
        self.mode = mode;
        self
    }

    /// Returns true if this server handles `document`.
    #[must_use]
    pub fn matches(&self, document: &DocumentSnapshot) -> bool {
        self.selector
            .matches(&document.language_id, document.path().as_deref())
    }

    /// The language id to announce for `document` on this server.
    #[must_use]
    pub fn language_id_for(&self, document: &DocumentSnapshot) -> String {
        if let Some(path) = document.path() {
            for (matcher, language) in &self.language_ids {
                if matcher.is_match(&path) {
                    return language.clone();
                }
            }
        }
        document.language_id.clone()
    }
}

/// All configured servers, in registry order.
#[derive(Debug, Clone, Default)]
pub struct ServerRegistry {
    definitions: Vec<Arc<ServerDefinition>>,
}

impl ServerRegistry {
    /// Creates a registry from definitions, keeping their order.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if two definitions share an id.
    pub fn new(definitions: impl IntoIterator<Item = ServerDefinition>) -> Result<Self> {
        let mut registry = Self::default();
        for definition in definitions {
            if registry.get(&definition.id).is_some() {
                return Err(Error::Config(format!(
                    "duplicate server id '{}'",
                    definition.id
                )));
            }
            registry.definitions.push(Arc::new(definition));
        }
        Ok(registry)
    }

    /// Builds the registry from the `[server.*]` tables.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if a definition is invalid.
    pub fn from_config(config: &Config) -> Result<Self> {
        Self::new(
            config
                .server
                .iter()
                .map(|(id, server)| ServerDefinition::from_config(id, server))
                .collect::<Result<Vec<_>>>()?,
        )
    }

    /// Looks up a definition by id.
    #[must_use]
    pub fn get(&self, id: &str) -> Option<&Arc<ServerDefinition>> {
        self.definitions.iter().find(|d| d.id == id)
    }

    /// All definitions.
    #[must_use]
    pub fn definitions(&self) -> &[Arc<ServerDefinition>] {
        &self.definitions
    }

    /// Definitions that handle `document`, in registry order.
    #[must_use]
    pub fn matching(&self, document: &DocumentSnapshot) -> Vec<Arc<ServerDefinition>> {
        self.definitions
            .iter()
            .filter(|d| d.matches(document))
            .cloned()
            .collect()
    }

    /// Returns true if no servers are configured.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.definitions.is_empty()
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
    use crate::document::path_to_uri;

    fn doc(path: &str, language: &str) -> DocumentSnapshot {
        DocumentSnapshot::new(path_to_uri(Path::new(path)).unwrap(), language, "")
    }

    #[test]
    fn test_selector_by_language_and_pattern() {
        let selector =
            DocumentSelector::new(&["rust".to_string()], &["**/Cargo.toml".to_string()]).unwrap();
        assert!(selector.matches("rust", None));
        assert!(selector.matches("toml", Some(Path::new("/work/app/Cargo.toml"))));
        assert!(!selector.matches("toml", Some(Path::new("/work/app/pyproject.toml"))));
        assert!(!selector.matches("python", None));
    }

    #[test]
    fn test_invalid_glob_is_config_error() {
        let err = DocumentSelector::new(&[], &["a[".to_string()]).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn test_registry_order_and_matching() {
        let config = Config::default()
            .with_server("b-python", ServerConfig::command("pylsp", Vec::<String>::new()).languages(["python"]))
            .with_server("a-rust", ServerConfig::command("rust-analyzer", Vec::<String>::new()).languages(["rust"]))
            .with_server("c-any", ServerConfig::command("typos-lsp", Vec::<String>::new()));
        let registry = ServerRegistry::from_config(&config).unwrap();

        let ids: Vec<&str> = registry.definitions().iter().map(|d| d.id.as_str()).collect();
        assert_eq!(ids, ["a-rust", "b-python", "c-any"]);

        let matched: Vec<String> = registry
            .matching(&doc("/w/main.rs", "rust"))
            .iter()
            .map(|d| d.id.clone())
            .collect();
        assert_eq!(matched, ["a-rust", "c-any"]);
    }

    #[test]
    fn test_duplicate_ids_rejected() {
        let launch = ProcessConnection::new("x", Vec::<String>::new());
        let err = ServerRegistry::new([
            ServerDefinition::new("dup", launch.clone()),
            ServerDefinition::new("dup", launch),
        ])
        .unwrap_err();
        assert!(err.to_string().contains("dup"));
    }

    #[test]
    fn test_language_id_override() {
        let mut server = ServerConfig::command("vscode-json-language-server", ["--stdio"]);
        server
            .language_ids
            .insert("**/tsconfig*.json".to_string(), "jsonc".to_string());
        let definition = ServerDefinition::from_config("json", &server).unwrap();

        assert_eq!(definition.language_id_for(&doc("/w/tsconfig.base.json", "json")), "jsonc");
        assert_eq!(definition.language_id_for(&doc("/w/package.json", "json")), "json");
    }
}
