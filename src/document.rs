// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (C) 2026 Mark Wells <contact@markwells.dev>

//! Document snapshots and path helpers.

use lsp_types::Uri;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use crate::error::{Error, Result};

/// Files that mark the root of a project.
const ROOT_MARKERS: &[&str] = &[
    ".git",
    "Cargo.toml",
    "go.mod",
    "package.json",
    "pyproject.toml",
    "setup.py",
    "pom.xml",
    "build.gradle",
    "CMakeLists.txt",
    "Makefile",
];

/// The content of a document at one point in time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DocumentSnapshot {
    /// Document URI.
    pub uri: Uri,
    /// LSP language id.
    pub language_id: String,
    /// Full text.
    pub text: String,
    /// Version sent with `didOpen`.
    pub version: i32,
    /// Project root the document belongs to, if known.
    pub root: Option<PathBuf>,
}

impl DocumentSnapshot {
    /// Creates a snapshot from in-memory content.
    pub fn new(uri: Uri, language_id: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            uri,
            language_id: language_id.into(),
            text: text.into(),
            version: 1,
            root: None,
        }
    }

    /// Reads a file from disk.
    ///
    /// The project root is detected from the nearest marker file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or its path is not absolute.
    pub async fn from_path(path: &Path) -> Result<Self> {
        let path = tokio::fs::canonicalize(path).await?;
        let text = tokio::fs::read_to_string(&path).await?;
        Ok(Self {
            uri: path_to_uri(&path)?,
            language_id: detect_language_id(&path).to_string(),
            text,
            version: 1,
            root: find_project_root(&path),
        })
    }

    /// Sets the project root.
    #[must_use]
    pub fn with_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.root = Some(root.into());
        self
    }

    /// Filesystem path for `file://` documents.
    #[must_use]
    pub fn path(&self) -> Option<PathBuf> {
        uri_to_path(&self.uri)
    }

    /// The project root: explicit, detected from markers, or the parent directory.
    #[must_use]
    pub fn project_root(&self) -> Option<PathBuf> {
        if let Some(root) = &self.root {
            return Some(root.clone());
        }
        let path = self.path()?;
        find_project_root(&path).or_else(|| path.parent().map(Path::to_path_buf))
    }
}

/// Converts an absolute path to a `file://` URI.
///
/// # Errors
///
/// Returns [`Error::Config`] if the path is relative or not representable.
pub fn path_to_uri(path: &Path) -> Result<Uri> {
    let url = url::Url::from_file_path(path)
        .map_err(|()| Error::Config(format!("Invalid path for URI: {}", path.display())))?;
    Uri::from_str(url.as_str())
        .map_err(|e| Error::Config(format!("Invalid path for URI: {}: {e}", path.display())))
}

/// Converts a `file://` URI back to a path.
#[must_use]
pub fn uri_to_path(uri: &Uri) -> Option<PathBuf> {
    let url = url::Url::parse(uri.as_str()).ok()?;
    url.to_file_path().ok()
}

/// Walks up from `path` to the nearest directory containing a root marker.
#[must_use]
pub fn find_project_root(path: &Path) -> Option<PathBuf> {
    let start = if path.is_dir() { path } else { path.parent()? };
    start
        .ancestors()
        .find(|dir| ROOT_MARKERS.iter().any(|marker| dir.join(marker).exists()))
        .map(Path::to_path_buf)
}

/// Maps a file extension to an LSP language id.
#[must_use]
pub fn detect_language_id(path: &Path) -> &'static str {
    match path.extension().and_then(|e| e.to_str()) {
        Some("rs") => "rust",
        Some("go") => "go",
        Some("py") => "python",
        Some("js" | "mjs" | "cjs") => "javascript",
        Some("ts" | "mts" | "cts") => "typescript",
        Some("tsx") => "typescriptreact",
        Some("jsx") => "javascriptreact",
        Some("c") => "c",
        Some("cpp" | "cc" | "cxx" | "h" | "hpp") => "cpp",
        Some("java") => "java",
        Some("rb") => "ruby",
        Some("sh" | "bash" | "zsh") => "shellscript",
        Some("json") => "json",
        Some("yaml" | "yml") => "yaml",
        Some("toml") => "toml",
        Some("md") => "markdown",
        Some("html") => "html",
        Some("css") => "css",
        Some("lua") => "lua",
        Some("sql") => "sql",
        _ => "plaintext",
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

    #[test]
    fn test_language_detection() {
        assert_eq!(detect_language_id(Path::new("test.rs")), "rust");
        assert_eq!(detect_language_id(Path::new("test.py")), "python");
        assert_eq!(detect_language_id(Path::new("test.mjs")), "javascript");
        assert_eq!(detect_language_id(Path::new("test.ts")), "typescript");
        assert_eq!(detect_language_id(Path::new("test.zsh")), "shellscript");
        assert_eq!(detect_language_id(Path::new("test.unknown")), "plaintext");
        assert_eq!(detect_language_id(Path::new("noextension")), "plaintext");
    }

    #[test]
    fn test_path_uri_roundtrip_with_spaces() {
        let path = Path::new("/home/user/my project/test.rs");
        let uri = path_to_uri(path).unwrap();
        assert_eq!(uri.as_str(), "file:///home/user/my%20project/test.rs");
        assert_eq!(uri_to_path(&uri).unwrap(), path);
    }

    #[test]
    fn test_relative_path_rejected() {
        assert!(path_to_uri(Path::new("src/main.rs")).is_err());
    }

    #[tokio::test]
    async fn test_from_path_detects_root() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("Cargo.toml"), "[package]\n").unwrap();
        std::fs::create_dir(dir.path().join("src")).unwrap();
        let file = dir.path().join("src/lib.rs");
        std::fs::write(&file, "pub fn f() {}\n").unwrap();

        let snapshot = DocumentSnapshot::from_path(&file).await.unwrap();
        assert_eq!(snapshot.language_id, "rust");
        assert_eq!(snapshot.version, 1);
        assert!(snapshot.text.contains("pub fn f"));
        assert_eq!(
            snapshot.project_root().unwrap(),
            dir.path().canonicalize().unwrap()
        );
    }

    #[test]
    fn test_explicit_root_wins() {
        let uri = path_to_uri(Path::new("/tmp/a/b.py")).unwrap();
        let snapshot = DocumentSnapshot::new(uri, "python", "").with_root("/tmp/a");
        assert_eq!(snapshot.project_root().unwrap(), PathBuf::from("/tmp/a"));
    }
}
