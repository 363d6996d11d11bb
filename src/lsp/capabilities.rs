// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (C) 2026 Mark Wells <contact@markwells.dev>

//! Client capabilities sent during initialization and server capability filters.

use lsp_types::{
    CallHierarchyServerCapability, ClientCapabilities, CodeActionProviderCapability,
    FoldingRangeProviderCapability, GeneralClientCapabilities, HoverClientCapabilities,
    HoverProviderCapability, ImplementationProviderCapability, MarkupKind, OneOf,
    PositionEncodingKind, SelectionRangeProviderCapability, ServerCapabilities,
    TextDocumentClientCapabilities, TextDocumentSyncCapability, TextDocumentSyncKind,
    TextDocumentSyncSaveOptions, TypeDefinitionProviderCapability, WindowClientCapabilities,
    WorkspaceClientCapabilities,
};
use std::fmt;

/// A server feature that requests can be filtered on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Capability {
    /// `textDocument/hover`
    Hover,
    /// `textDocument/definition`
    Definition,
    /// `textDocument/typeDefinition`
    TypeDefinition,
    /// `textDocument/implementation`
    Implementation,
    /// `textDocument/references`
    References,
    /// `textDocument/documentHighlight`
    DocumentHighlight,
    /// `textDocument/documentSymbol`
    DocumentSymbol,
    /// `workspace/symbol`
    WorkspaceSymbol,
    /// `textDocument/codeAction`
    CodeAction,
    /// `textDocument/codeLens`
    CodeLens,
    /// `textDocument/completion`
    Completion,
    /// `textDocument/signatureHelp`
    SignatureHelp,
    /// `textDocument/formatting`
    Formatting,
    /// `textDocument/rangeFormatting`
    RangeFormatting,
    /// `textDocument/rename`
    Rename,
    /// `textDocument/documentLink`
    DocumentLink,
    /// `textDocument/foldingRange`
    FoldingRange,
    /// `textDocument/selectionRange`
    SelectionRange,
    /// `textDocument/prepareCallHierarchy`
    CallHierarchy,
    /// `textDocument/semanticTokens`
    SemanticTokens,
    /// `textDocument/inlayHint`
    InlayHint,
    /// `workspace/executeCommand`
    ExecuteCommand,
    /// Multi-root workspace folders.
    WorkspaceFolders,
}

fn one_of<T>(value: Option<&OneOf<bool, T>>) -> bool {
    match value {
        Some(OneOf::Left(enabled)) => *enabled,
        Some(OneOf::Right(_)) => true,
        None => false,
    }
}

impl Capability {
    /// Every capability, in display order.
    pub const ALL: [Self; 23] = [
        Self::Hover,
        Self::Definition,
        Self::TypeDefinition,
        Self::Implementation,
        Self::References,
        Self::DocumentHighlight,
        Self::DocumentSymbol,
        Self::WorkspaceSymbol,
        Self::CodeAction,
        Self::CodeLens,
        Self::Completion,
        Self::SignatureHelp,
        Self::Formatting,
        Self::RangeFormatting,
        Self::Rename,
        Self::DocumentLink,
        Self::FoldingRange,
        Self::SelectionRange,
        Self::CallHierarchy,
        Self::SemanticTokens,
        Self::InlayHint,
        Self::ExecuteCommand,
        Self::WorkspaceFolders,
    ];

    /// Returns true if `caps` advertises this feature.
    #[must_use]
    pub fn is_supported(self, caps: &ServerCapabilities) -> bool {
        match self {
            Self::Hover => match &caps.hover_provider {
                Some(HoverProviderCapability::Simple(enabled)) => *enabled,
                Some(_) => true,
                None => false,
            },
            Self::Definition => one_of(caps.definition_provider.as_ref()),
            Self::TypeDefinition => match &caps.type_definition_provider {
                Some(TypeDefinitionProviderCapability::Simple(enabled)) => *enabled,
                Some(_) => true,
                None => false,
            },
            Self::Implementation => match &caps.implementation_provider {
                Some(ImplementationProviderCapability::Simple(enabled)) => *enabled,
                Some(_) => true,
                None => false,
            },
            Self::References => one_of(caps.references_provider.as_ref()),
            Self::DocumentHighlight => one_of(caps.document_highlight_provider.as_ref()),
            Self::DocumentSymbol => one_of(caps.document_symbol_provider.as_ref()),
            Self::WorkspaceSymbol => one_of(caps.workspace_symbol_provider.as_ref()),
            Self::CodeAction => match &caps.code_action_provider {
                Some(CodeActionProviderCapability::Simple(enabled)) => *enabled,
                Some(_) => true,
                None => false,
            },
            Self::CodeLens => caps.code_lens_provider.is_some(),
            Self::Completion => caps.completion_provider.is_some(),
            Self::SignatureHelp => caps.signature_help_provider.is_some(),
            Self::Formatting => one_of(caps.document_formatting_provider.as_ref()),
            Self::RangeFormatting => one_of(caps.document_range_formatting_provider.as_ref()),
            Self::Rename => one_of(caps.rename_provider.as_ref()),
            Self::DocumentLink => caps.document_link_provider.is_some(),
            Self::FoldingRange => match &caps.folding_range_provider {
                Some(FoldingRangeProviderCapability::Simple(enabled)) => *enabled,
                Some(_) => true,
                None => false,
            },
            Self::SelectionRange => match &caps.selection_range_provider {
                Some(SelectionRangeProviderCapability::Simple(enabled)) => *enabled,
                Some(_) => true,
                None => false,
            },
            Self::CallHierarchy => match &caps.call_hierarchy_provider {
                Some(CallHierarchyServerCapability::Simple(enabled)) => *enabled,
                Some(_) => true,
                None => false,
            },
            Self::SemanticTokens => caps.semantic_tokens_provider.is_some(),
            Self::InlayHint => caps.inlay_hint_provider.is_some(),
            Self::ExecuteCommand => caps.execute_command_provider.is_some(),
            Self::WorkspaceFolders => supports_workspace_folders(caps),
        }
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Which servers a request should be sent to.
#[derive(Debug, Clone, Default)]
pub enum CapabilityFilter {
    /// Every matching server.
    #[default]
    Any,
    /// Servers advertising one feature.
    Capability(Capability),
    /// Servers advertising every listed feature.
    All(Vec<Capability>),
    /// Arbitrary predicate over the negotiated capabilities.
    Predicate(fn(&ServerCapabilities) -> bool),
}

impl CapabilityFilter {
    /// Applies the filter to negotiated capabilities.
    #[must_use]
    pub fn matches(&self, caps: &ServerCapabilities) -> bool {
        match self {
            Self::Any => true,
            Self::Capability(cap) => cap.is_supported(caps),
            Self::All(caps_required) => caps_required.iter().all(|cap| cap.is_supported(caps)),
            Self::Predicate(predicate) => predicate(caps),
        }
    }
}

impl From<Capability> for CapabilityFilter {
    fn from(cap: Capability) -> Self {
        Self::Capability(cap)
    }
}

/// Returns true if the server accepts workspace folder changes.
#[must_use]
pub fn supports_workspace_folders(caps: &ServerCapabilities) -> bool {
    caps.workspace
        .as_ref()
        .and_then(|ws| ws.workspace_folders.as_ref())
        .is_some_and(|folders| folders.supported == Some(true))
}

/// How document changes are sent to a server.
#[must_use]
pub fn sync_kind(caps: &ServerCapabilities) -> TextDocumentSyncKind {
    match &caps.text_document_sync {
        Some(TextDocumentSyncCapability::Kind(kind)) => *kind,
        Some(TextDocumentSyncCapability::Options(options)) => {
            options.change.unwrap_or(TextDocumentSyncKind::NONE)
        }
        None => TextDocumentSyncKind::NONE,
    }
}

/// Whether the server wants `didSave`, and whether it wants the text with it.
///
/// Returns `None` when no save notification should be sent.
#[must_use]
pub fn save_options(caps: &ServerCapabilities) -> Option<bool> {
    match &caps.text_document_sync {
        Some(TextDocumentSyncCapability::Options(options)) => match &options.save {
            Some(TextDocumentSyncSaveOptions::Supported(true)) => Some(false),
            Some(TextDocumentSyncSaveOptions::SaveOptions(save)) => {
                Some(save.include_text.unwrap_or(false))
            }
            _ => None,
        },
        _ => None,
    }
}

/// Build client capabilities for initialization.
#[must_use]
pub fn client_capabilities() -> ClientCapabilities {
    ClientCapabilities {
        workspace: Some(WorkspaceClientCapabilities {
            configuration: Some(true),
            workspace_folders: Some(true),
            apply_edit: Some(false),
            symbol: Some(lsp_types::WorkspaceSymbolClientCapabilities {
                dynamic_registration: Some(false),
                ..Default::default()
            }),
            execute_command: Some(lsp_types::DynamicRegistrationClientCapabilities {
                dynamic_registration: Some(false),
            }),
            ..Default::default()
        }),
        text_document: Some(TextDocumentClientCapabilities {
            synchronization: Some(lsp_types::TextDocumentSyncClientCapabilities {
                dynamic_registration: Some(false),
                will_save: Some(false),
                will_save_wait_until: Some(false),
                did_save: Some(true),
            }),
            hover: Some(HoverClientCapabilities {
                content_format: Some(vec![MarkupKind::Markdown, MarkupKind::PlainText]),
                ..Default::default()
            }),
            definition: Some(lsp_types::GotoCapability {
                dynamic_registration: Some(false),
                link_support: Some(true),
            }),
            references: Some(lsp_types::DynamicRegistrationClientCapabilities {
                dynamic_registration: Some(false),
            }),
            document_highlight: Some(lsp_types::DynamicRegistrationClientCapabilities {
                dynamic_registration: Some(false),
            }),
            document_symbol: Some(lsp_types::DocumentSymbolClientCapabilities {
                hierarchical_document_symbol_support: Some(true),
                ..Default::default()
            }),
            formatting: Some(lsp_types::DocumentFormattingClientCapabilities {
                dynamic_registration: Some(false),
            }),
            document_link: Some(lsp_types::DocumentLinkClientCapabilities {
                dynamic_registration: Some(false),
                tooltip_support: Some(true),
            }),
            publish_diagnostics: Some(lsp_types::PublishDiagnosticsClientCapabilities {
                version_support: Some(true),
                ..Default::default()
            }),
            ..Default::default()
        }),
        window: Some(WindowClientCapabilities {
            work_done_progress: Some(true),
            ..Default::default()
        }),
        general: Some(GeneralClientCapabilities {
            position_encodings: Some(vec![PositionEncodingKind::UTF8, PositionEncodingKind::UTF16]),
            ..Default::default()
        }),
        ..Default::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lsp_types::{SaveOptions, TextDocumentSyncOptions};

    #[test]
    fn test_simple_false_is_unsupported() {
        let caps = ServerCapabilities {
            hover_provider: Some(HoverProviderCapability::Simple(false)),
            definition_provider: Some(OneOf::Left(true)),
            ..Default::default()
        };
        assert!(!Capability::Hover.is_supported(&caps));
        assert!(Capability::Definition.is_supported(&caps));
        assert!(!Capability::References.is_supported(&caps));
    }

    #[test]
    fn test_filters() {
        let caps = ServerCapabilities {
            hover_provider: Some(HoverProviderCapability::Simple(true)),
            code_action_provider: Some(CodeActionProviderCapability::Simple(true)),
            ..Default::default()
        };
        assert!(CapabilityFilter::Any.matches(&caps));
        assert!(CapabilityFilter::from(Capability::Hover).matches(&caps));
        assert!(
            CapabilityFilter::All(vec![Capability::Hover, Capability::CodeAction]).matches(&caps)
        );
        assert!(
            !CapabilityFilter::All(vec![Capability::Hover, Capability::Rename]).matches(&caps)
        );
        assert!(
            CapabilityFilter::Predicate(|caps| caps.rename_provider.is_none()).matches(&caps)
        );
    }

    #[test]
    fn test_sync_kind_and_save() {
        let caps = ServerCapabilities {
            text_document_sync: Some(TextDocumentSyncCapability::Options(
                TextDocumentSyncOptions {
                    open_close: Some(true),
                    change: Some(TextDocumentSyncKind::INCREMENTAL),
                    save: Some(TextDocumentSyncSaveOptions::SaveOptions(SaveOptions {
                        include_text: Some(true),
                    })),
                    ..Default::default()
                },
            )),
            ..Default::default()
        };
        assert_eq!(sync_kind(&caps), TextDocumentSyncKind::INCREMENTAL);
        assert_eq!(save_options(&caps), Some(true));

        let full = ServerCapabilities {
            text_document_sync: Some(TextDocumentSyncCapability::Kind(TextDocumentSyncKind::FULL)),
            ..Default::default()
        };
        assert_eq!(sync_kind(&full), TextDocumentSyncKind::FULL);
        assert_eq!(save_options(&full), None);
        assert_eq!(sync_kind(&ServerCapabilities::default()), TextDocumentSyncKind::NONE);
    }
}
