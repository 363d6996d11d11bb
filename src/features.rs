// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (C) 2026 Mark Wells <contact@markwells.dev>

//! Editor features built on the executors.
//!
//! Each feature picks a fan-out policy and, where interactive latency
//! matters, bounds the wait itself. Timing out drops the aggregate handle,
//! which cancels the requests still running on every server.

use lsp_types::{
    CodeActionContext, CodeActionOrCommand, CodeActionParams, Diagnostic, DocumentFormattingParams,
    DocumentHighlight, DocumentHighlightParams, DocumentLink, DocumentLinkParams,
    DocumentSymbol, DocumentSymbolParams, DocumentSymbolResponse, FormattingOptions,
    GotoDefinitionParams, GotoDefinitionResponse, Hover, HoverContents, HoverParams, Location,
    MarkedString, PartialResultParams, Position, Range, ReferenceContext, ReferenceParams,
    SymbolInformation, TextDocumentIdentifier, TextDocumentPositionParams, TextEdit,
    WorkDoneProgressParams, WorkspaceSymbolParams, WorkspaceSymbolResponse,
};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use crate::document::DocumentSnapshot;
use crate::error::{Error, Result};
use crate::lsp::capabilities::Capability;
use crate::lsp::manager::LanguageServers;
use crate::lsp::rpc::LanguageServer;
use crate::lsp::task::Pending;

async fn bounded<T>(method: &str, timeout: Duration, pending: Pending<T>) -> Result<T> {
    tokio::time::timeout(timeout, pending)
        .await
        .unwrap_or_else(|_| {
            Err(Error::RequestTimeout {
                method: method.to_string(),
                timeout,
            })
        })
}

fn position_params(document: &DocumentSnapshot, position: Position) -> TextDocumentPositionParams {
    TextDocumentPositionParams {
        text_document: TextDocumentIdentifier {
            uri: document.uri.clone(),
        },
        position,
    }
}

fn identifier(document: &DocumentSnapshot) -> TextDocumentIdentifier {
    TextDocumentIdentifier {
        uri: document.uri.clone(),
    }
}

/// Hover from every server that offers it, bounded by `hover_timeout_ms`.
///
/// # Errors
///
/// Returns [`Error::RequestTimeout`] when the deadline passes, or the last
/// error if every server failed.
pub async fn hover(
    servers: &Arc<LanguageServers>,
    document: &DocumentSnapshot,
    position: Position,
) -> Result<Vec<Hover>> {
    let params = HoverParams {
        text_document_position_params: position_params(document, position),
        work_done_progress_params: WorkDoneProgressParams::default(),
    };
    let pending = servers
        .for_document(document)
        .with_capability(Capability::Hover)
        .collect_all(move |server: LanguageServer| server.hover(params.clone()));
    bounded("textDocument/hover", servers.config().hover_timeout(), pending).await
}

/// Definition locations from every server, links flattened to locations.
///
/// # Errors
///
/// Returns the last error if every server failed.
pub async fn definition(
    servers: &Arc<LanguageServers>,
    document: &DocumentSnapshot,
    position: Position,
) -> Result<Vec<Location>> {
    let params = GotoDefinitionParams {
        text_document_position_params: position_params(document, position),
        work_done_progress_params: WorkDoneProgressParams::default(),
        partial_result_params: PartialResultParams::default(),
    };
    let responses = servers
        .for_document(document)
        .with_capability(Capability::Definition)
        .collect_all(move |server: LanguageServer| server.definition(params.clone()))
        .await?;
    Ok(responses.into_iter().flat_map(definition_locations).collect())
}

fn definition_locations(response: GotoDefinitionResponse) -> Vec<Location> {
    match response {
        GotoDefinitionResponse::Scalar(location) => vec![location],
        GotoDefinitionResponse::Array(locations) => locations,
        GotoDefinitionResponse::Link(links) => links
            .into_iter()
            .map(|link| Location {
                uri: link.target_uri,
                range: link.target_selection_range,
            })
            .collect(),
    }
}

/// References from every server.
///
/// # Errors
///
/// Returns the last error if every server failed.
pub async fn references(
    servers: &Arc<LanguageServers>,
    document: &DocumentSnapshot,
    position: Position,
    include_declaration: bool,
) -> Result<Vec<Location>> {
    let params = ReferenceParams {
        text_document_position: position_params(document, position),
        work_done_progress_params: WorkDoneProgressParams::default(),
        partial_result_params: PartialResultParams::default(),
        context: ReferenceContext {
            include_declaration,
        },
    };
    let results = servers
        .for_document(document)
        .with_capability(Capability::References)
        .collect_all(move |server: LanguageServer| server.references(params.clone()))
        .await?;
    Ok(results.into_iter().flatten().collect())
}

/// Highlights from the first server that has any.
///
/// # Errors
///
/// Returns the last error if every server failed.
pub async fn document_highlights(
    servers: &Arc<LanguageServers>,
    document: &DocumentSnapshot,
    position: Position,
) -> Result<Vec<DocumentHighlight>> {
    let params = DocumentHighlightParams {
        text_document_position_params: position_params(document, position),
        work_done_progress_params: WorkDoneProgressParams::default(),
        partial_result_params: PartialResultParams::default(),
    };
    let highlights = servers
        .for_document(document)
        .with_capability(Capability::DocumentHighlight)
        .compute_first(move |server: LanguageServer| {
            let request = server.document_highlight(params.clone());
            async move { Ok(request.await?.filter(|h| !h.is_empty())) }
        })
        .await?;
    Ok(highlights.unwrap_or_default())
}

/// Code actions from every server for `range`.
///
/// # Errors
///
/// Returns the last error if every server failed.
pub async fn code_actions(
    servers: &Arc<LanguageServers>,
    document: &DocumentSnapshot,
    range: Range,
    diagnostics: Vec<Diagnostic>,
) -> Result<Vec<CodeActionOrCommand>> {
    let params = CodeActionParams {
        text_document: identifier(document),
        range,
        context: CodeActionContext {
            diagnostics,
            only: None,
            trigger_kind: None,
        },
        work_done_progress_params: WorkDoneProgressParams::default(),
        partial_result_params: PartialResultParams::default(),
    };
    let results = servers
        .for_document(document)
        .with_capability(Capability::CodeAction)
        .collect_all(move |server: LanguageServer| server.code_actions(params.clone()))
        .await?;
    Ok(results.into_iter().flatten().collect())
}

/// Document links from every server, bounded by `link_timeout_ms`.
///
/// # Errors
///
/// Returns [`Error::RequestTimeout`] when the deadline passes, or the last
/// error if every server failed.
pub async fn document_links(
    servers: &Arc<LanguageServers>,
    document: &DocumentSnapshot,
) -> Result<Vec<DocumentLink>> {
    let params = DocumentLinkParams {
        text_document: identifier(document),
        work_done_progress_params: WorkDoneProgressParams::default(),
        partial_result_params: PartialResultParams::default(),
    };
    let pending = servers
        .for_document(document)
        .with_capability(Capability::DocumentLink)
        .collect_all(move |server: LanguageServer| server.document_link(params.clone()));
    let links = bounded(
        "textDocument/documentLink",
        servers.config().link_timeout(),
        pending,
    )
    .await?;
    Ok(links.into_iter().flatten().collect())
}

/// Formatting edits from the first server that produces any.
///
/// # Errors
///
/// Returns the last error if every server failed.
pub async fn formatting(
    servers: &Arc<LanguageServers>,
    document: &DocumentSnapshot,
    tab_size: u32,
    insert_spaces: bool,
) -> Result<Vec<TextEdit>> {
    let params = DocumentFormattingParams {
        text_document: identifier(document),
        options: FormattingOptions {
            tab_size,
            insert_spaces,
            ..FormattingOptions::default()
        },
        work_done_progress_params: WorkDoneProgressParams::default(),
    };
    let edits = servers
        .for_document(document)
        .with_capability(Capability::Formatting)
        .compute_first(move |server: LanguageServer| {
            let request = server.formatting(params.clone());
            async move { Ok(request.await?.filter(|edits| !edits.is_empty())) }
        })
        .await?;
    Ok(edits.unwrap_or_default())
}

/// The outline from the first server that offers one.
///
/// # Errors
///
/// Returns the last error if every server failed.
pub async fn document_symbols(
    servers: &Arc<LanguageServers>,
    document: &DocumentSnapshot,
) -> Result<Option<DocumentSymbolResponse>> {
    let params = DocumentSymbolParams {
        text_document: identifier(document),
        work_done_progress_params: WorkDoneProgressParams::default(),
        partial_result_params: PartialResultParams::default(),
    };
    servers
        .for_document(document)
        .with_capability(Capability::DocumentSymbol)
        .compute_first(move |server: LanguageServer| server.document_symbols(params.clone()))
        .await
}

/// Workspace symbols from the running servers of a project.
///
/// Servers that are not running are not started for this.
///
/// # Errors
///
/// Returns the last error if every server failed.
pub async fn workspace_symbols(
    servers: &Arc<LanguageServers>,
    root: &Path,
    query: &str,
) -> Result<Vec<WorkspaceSymbolResponse>> {
    let params = WorkspaceSymbolParams {
        query: query.to_string(),
        work_done_progress_params: WorkDoneProgressParams::default(),
        partial_result_params: PartialResultParams::default(),
    };
    servers
        .for_project(root)
        .exclude_inactive()
        .with_capability(Capability::WorkspaceSymbol)
        .collect_all(move |server: LanguageServer| server.workspace_symbols(params.clone()))
        .await
}

/// Renders hover contents as plain text.
#[must_use]
pub fn format_hover(hover: &Hover) -> String {
    match &hover.contents {
        HoverContents::Scalar(marked) => format_marked_string(marked),
        HoverContents::Array(strings) => strings
            .iter()
            .map(format_marked_string)
            .collect::<Vec<_>>()
            .join("\n\n"),
        HoverContents::Markup(markup) => markup.value.clone(),
    }
}

fn format_marked_string(marked: &MarkedString) -> String {
    match marked {
        MarkedString::String(s) => s.clone(),
        MarkedString::LanguageString(ls) => format!("```{}\n{}\n```", ls.language, ls.value),
    }
}

/// `path:line:col` with one-based line and column.
#[must_use]
pub fn format_location(location: &Location) -> String {
    let path = location.uri.path();
    let line = location.range.start.line + 1;
    let col = location.range.start.character + 1;
    format!("{path}:{line}:{col}")
}

/// Renders an outline, nested symbols indented by depth.
#[must_use]
pub fn format_document_symbols(response: &DocumentSymbolResponse) -> String {
    match response {
        DocumentSymbolResponse::Flat(symbols) => symbols
            .iter()
            .map(format_symbol_info)
            .collect::<Vec<_>>()
            .join("\n"),
        DocumentSymbolResponse::Nested(symbols) => format_nested_symbols(symbols, 0),
    }
}

fn format_symbol_info(sym: &SymbolInformation) -> String {
    format!("{} [{:?}] {}", sym.name, sym.kind, format_location(&sym.location))
}

fn format_nested_symbols(symbols: &[DocumentSymbol], indent: usize) -> String {
    let mut result = Vec::new();
    for sym in symbols {
        let prefix = "  ".repeat(indent);
        let line = sym.range.start.line + 1;
        result.push(format!("{prefix}{} [{:?}] line {line}", sym.name, sym.kind));
        if let Some(children) = &sym.children
            && !children.is_empty()
        {
            result.push(format_nested_symbols(children, indent + 1));
        }
    }
    result.join("\n")
}

#[cfg(test)]
#[allow(
    clippy::unwrap_used,
    clippy::expect_used,
    reason = "Tests use unwrap for clear failure messages"
)]
mod tests {
    use super::*;
    use lsp_types::{LanguageString, LocationLink, MarkupContent, MarkupKind, SymbolKind, Uri};
    use std::str::FromStr;

    fn uri() -> Uri {
        Uri::from_str("file:///w/src/lib.rs").unwrap()
    }

    fn range(line: u32) -> Range {
        Range {
            start: Position::new(line, 4),
            end: Position::new(line, 8),
        }
    }

    #[test]
    fn test_format_hover_variants() {
        let markup = Hover {
            contents: HoverContents::Markup(MarkupContent {
                kind: MarkupKind::Markdown,
                value: "**fn** main".to_string(),
            }),
            range: None,
        };
        assert_eq!(format_hover(&markup), "**fn** main");

        let marked = Hover {
            contents: HoverContents::Array(vec![
                MarkedString::String("doc".to_string()),
                MarkedString::LanguageString(LanguageString {
                    language: "rust".to_string(),
                    value: "fn main()".to_string(),
                }),
            ]),
            range: None,
        };
        assert_eq!(format_hover(&marked), "doc\n\n```rust\nfn main()\n```");
    }

    #[test]
    fn test_definition_links_use_selection_range() {
        let link = LocationLink {
            origin_selection_range: None,
            target_uri: uri(),
            target_range: range(1),
            target_selection_range: range(3),
        };
        let locations = definition_locations(GotoDefinitionResponse::Link(vec![link]));
        assert_eq!(locations.len(), 1);
        assert_eq!(format_location(&locations[0]), "/w/src/lib.rs:4:5");
    }

    #[test]
    #[allow(deprecated, reason = "DocumentSymbol still carries the deprecated field")]
    fn test_nested_symbols() {
        let child = DocumentSymbol {
            name: "new".to_string(),
            detail: None,
            kind: SymbolKind::METHOD,
            tags: None,
            deprecated: None,
            range: range(2),
            selection_range: range(2),
            children: None,
        };
        let parent = DocumentSymbol {
            name: "Parser".to_string(),
            detail: None,
            kind: SymbolKind::STRUCT,
            tags: None,
            deprecated: None,
            range: range(0),
            selection_range: range(0),
            children: Some(vec![child]),
        };
        let text = format_document_symbols(&DocumentSymbolResponse::Nested(vec![parent]));
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].starts_with("Parser ["));
        assert!(lines[0].ends_with("line 1"));
        assert!(lines[1].starts_with("  new ["));
        assert!(lines[1].ends_with("line 3"));
    }

    #[tokio::test]
    async fn test_bounded_times_out() {
        let pending = Pending::spawn(
            &tokio_util::sync::CancellationToken::new(),
            std::future::pending::<Result<()>>(),
        );
        let err = bounded("textDocument/hover", Duration::from_millis(10), pending)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::RequestTimeout { .. }));
    }
}
