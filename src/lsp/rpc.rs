// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (C) 2026 Mark Wells <contact@markwells.dev>

//! JSON-RPC plumbing for one server connection.
//!
//! [`LanguageServer`] is the cloneable handle used to talk to a server. All
//! outbound frames go through a single FIFO queue drained by a writer task,
//! so notifications reach the server in the order they were issued. The
//! dispatcher ([`serve`]) reads frames, completes pending requests, and hands
//! notifications and server-initiated requests to a [`MessageHandler`].

use std::future::Future;
use std::marker::PhantomData;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};
use std::task::{Context, Poll};
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use dashmap::DashMap;
use lsp_types::{
    CallHierarchyIncomingCall, CallHierarchyIncomingCallsParams, CallHierarchyItem,
    CallHierarchyOutgoingCall, CallHierarchyOutgoingCallsParams, CallHierarchyPrepareParams,
    CodeActionParams, CodeActionResponse, CodeLens, CodeLensParams, CompletionParams,
    CompletionResponse, DidChangeTextDocumentParams, DidChangeWorkspaceFoldersParams,
    DidCloseTextDocumentParams, DidOpenTextDocumentParams, DidSaveTextDocumentParams,
    DocumentFormattingParams, DocumentHighlight, DocumentHighlightParams, DocumentLink,
    DocumentLinkParams, DocumentRangeFormattingParams, DocumentSymbolParams,
    DocumentSymbolResponse, ExecuteCommandParams, FoldingRange, FoldingRangeParams,
    GotoDefinitionParams, GotoDefinitionResponse, Hover, HoverParams, InitializeParams,
    InitializeResult, InitializedParams, InlayHint, InlayHintParams, Location, ReferenceParams,
    RenameParams, SelectionRange, SelectionRangeParams, SemanticTokensParams,
    SemanticTokensResult, SignatureHelp, SignatureHelpParams, TextEdit, WorkDoneProgressCancelParams,
    WorkspaceEdit, WorkspaceSymbolParams, WorkspaceSymbolResponse,
};
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::{mpsc, oneshot};
use tokio::time::Sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, trace, warn};

use super::connection::{BoxReader, BoxWriter};
use super::protocol::{
    self, Incoming, NotificationMessage, RequestId, RequestMessage, ResponseError,
    ResponseMessage,
};
use crate::error::{Error, Result};

/// Log target for raw protocol traffic.
pub const TRAFFIC_TARGET: &str = "tether::traffic";

/// Per-connection RPC settings.
#[derive(Debug, Clone, Copy)]
pub struct RpcOptions {
    /// Upper bound for any single request.
    pub request_timeout: Duration,
    /// Log every frame at trace level under [`TRAFFIC_TARGET`].
    pub log_traffic: bool,
}

impl Default for RpcOptions {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(30),
            log_traffic: false,
        }
    }
}

/// Handles messages initiated by the server.
///
/// Implementations must not block; they run on the dispatcher task.
pub trait MessageHandler: Send + Sync + 'static {
    /// Called for every notification.
    fn on_notification(&self, method: &str, params: Value) {
        trace!("Ignoring notification: {method} params={params}");
    }

    /// Called for every server-to-client request. The returned value is sent
    /// back as the response.
    ///
    /// # Errors
    ///
    /// The default implementation answers `MethodNotFound`.
    fn on_request(&self, method: &str, _params: Value) -> Result<Value, ResponseError> {
        Err(method_not_found(method))
    }
}

/// Handler that ignores notifications and rejects every server request.
#[derive(Debug, Default, Clone, Copy)]
pub struct IgnoreMessages;

impl MessageHandler for IgnoreMessages {}

/// Standard `MethodNotFound` error for unsupported server requests.
#[must_use]
pub fn method_not_found(method: &str) -> ResponseError {
    ResponseError {
        code: protocol::METHOD_NOT_FOUND,
        message: format!("Method '{method}' not supported by client"),
        data: None,
    }
}

type Completion = oneshot::Sender<Result<Value>>;

struct Shared {
    server: String,
    next_id: AtomicI64,
    outbound: mpsc::UnboundedSender<Bytes>,
    pending: DashMap<RequestId, Completion>,
    closed: CancellationToken,
    options: RpcOptions,
}

/// Receiving end of the outbound queue, consumed by [`serve`].
pub struct Outbound(pub(crate) mpsc::UnboundedReceiver<Bytes>);

impl std::fmt::Debug for Outbound {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Outbound")
    }
}

/// Cloneable handle for sending requests and notifications to one server.
#[derive(Clone)]
pub struct LanguageServer {
    shared: Arc<Shared>,
}

impl std::fmt::Debug for LanguageServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LanguageServer")
            .field("server", &self.shared.server)
            .field("pending", &self.shared.pending.len())
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl LanguageServer {
    /// Creates a handle and its outbound queue. Nothing is sent until the
    /// queue is attached to a transport with [`serve`].
    #[must_use]
    pub fn channel(server: &str, options: RpcOptions) -> (Self, Outbound) {
        let (tx, rx) = mpsc::unbounded_channel();
        let shared = Arc::new(Shared {
            server: server.to_string(),
            next_id: AtomicI64::new(1),
            outbound: tx,
            pending: DashMap::new(),
            closed: CancellationToken::new(),
            options,
        });
        (Self { shared }, Outbound(rx))
    }

    /// The server id used in errors and logs.
    #[must_use]
    pub fn server_id(&self) -> &str {
        &self.shared.server
    }

    /// Returns true once the connection no longer accepts messages.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.shared.closed.is_cancelled()
    }

    /// Number of requests awaiting a response.
    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.shared.pending.len()
    }

    /// Sends a request with the default timeout.
    pub fn request<P: Serialize, R: DeserializeOwned>(
        &self,
        method: &str,
        params: P,
    ) -> RequestHandle<R> {
        self.request_with_timeout(method, params, self.shared.options.request_timeout)
    }

    /// Sends a request that fails with [`Error::RequestTimeout`] after `timeout`.
    ///
    /// The request is queued before this returns. Dropping the handle before
    /// it completes sends `$/cancelRequest`.
    pub fn request_with_timeout<P: Serialize, R: DeserializeOwned>(
        &self,
        method: &str,
        params: P,
        timeout: Duration,
    ) -> RequestHandle<R> {
        let id = RequestId::Number(self.shared.next_id.fetch_add(1, Ordering::SeqCst));
        let (tx, rx) = oneshot::channel();

        let frame = serde_json::to_value(params)
            .map_err(Error::from)
            .and_then(|params| {
                protocol::encode_message(&RequestMessage::new(id.clone(), method, params))
            });

        match frame {
            Ok(frame) => {
                self.shared.pending.insert(id.clone(), tx);
                if let Err(e) = self.enqueue(frame) {
                    if let Some((_, tx)) = self.shared.pending.remove(&id) {
                        let _ = tx.send(Err(e));
                    }
                } else {
                    debug!(server = %self.shared.server, %id, method, "sent request");
                }
            }
            Err(e) => {
                let _ = tx.send(Err(e));
            }
        }

        RequestHandle {
            id,
            method: method.to_string(),
            rx: Some(rx),
            deadline: Box::pin(tokio::time::sleep(timeout)),
            timeout,
            server: self.clone(),
            _marker: PhantomData,
        }
    }

    /// Sends a notification (no response expected).
    ///
    /// # Errors
    ///
    /// Returns an error if the params cannot be serialized or the connection
    /// is closed.
    pub fn notify<P: Serialize>(&self, method: &str, params: P) -> Result<()> {
        let message = NotificationMessage::new(method, serde_json::to_value(params)?);
        self.enqueue(protocol::encode_message(&message)?)
    }

    /// Cancels an outstanding request, sending `$/cancelRequest`.
    ///
    /// Returns false if the request had already completed or was cancelled.
    pub fn cancel_request(&self, id: &RequestId) -> bool {
        if self.shared.pending.remove(id).is_none() {
            return false;
        }
        trace!(server = %self.shared.server, %id, "cancelling request");
        let id_value = match id {
            RequestId::Number(n) => Value::from(*n),
            RequestId::String(s) => Value::from(s.as_str()),
        };
        let _ = self.notify("$/cancelRequest", serde_json::json!({ "id": id_value }));
        true
    }

    fn enqueue(&self, frame: Bytes) -> Result<()> {
        if self.is_closed() {
            return Err(Error::ServerDisconnected {
                server: self.shared.server.clone(),
            });
        }
        self.shared
            .outbound
            .send(frame)
            .map_err(|_| Error::ServerDisconnected {
                server: self.shared.server.clone(),
            })
    }

    fn respond(&self, response: &ResponseMessage) {
        let sent = protocol::encode_message(response).and_then(|frame| self.enqueue(frame));
        if let Err(e) = sent {
            debug!(server = %self.shared.server, "failed to send response: {e}");
        }
    }

    /// Stops accepting outbound messages. Frames already queued are still written.
    pub(crate) fn close(&self) {
        self.shared.closed.cancel();
    }

    /// Completes every pending request with the error produced by `err`.
    pub(crate) fn fail_pending(&self, err: impl Fn() -> Error) {
        let ids: Vec<RequestId> = self.shared.pending.iter().map(|e| e.key().clone()).collect();
        for id in ids {
            if let Some((_, tx)) = self.shared.pending.remove(&id) {
                let _ = tx.send(Err(err()));
            }
        }
    }

    fn complete(&self, response: ResponseMessage) {
        let Some(id) = response.id else {
            debug!(server = %self.shared.server, "response without id");
            return;
        };
        let Some((_, tx)) = self.shared.pending.remove(&id) else {
            // Late responses to cancelled or timed out requests land here.
            debug!(server = %self.shared.server, %id, "response for unknown request id");
            return;
        };
        let result = match response.error {
            Some(err) => Err(Error::from(err)),
            None => Ok(response.result.unwrap_or(Value::Null)),
        };
        let _ = tx.send(result);
    }

    // Typed LSP methods

    /// Sends `initialize`.
    pub fn initialize(&self, params: InitializeParams) -> RequestHandle<InitializeResult> {
        self.request("initialize", params)
    }

    /// Sends `initialized`.
    ///
    /// # Errors
    ///
    /// Returns an error if the connection is closed.
    pub fn initialized(&self) -> Result<()> {
        self.notify("initialized", InitializedParams {})
    }

    /// Sends `shutdown`. The result varies by server (null, true, ...).
    pub fn shutdown(&self, timeout: Duration) -> RequestHandle<Value> {
        self.request_with_timeout("shutdown", Value::Null, timeout)
    }

    /// Sends `exit`.
    ///
    /// # Errors
    ///
    /// Returns an error if the connection is closed.
    pub fn exit(&self) -> Result<()> {
        self.notify("exit", Value::Null)
    }

    /// Notifies the server that a document was opened.
    ///
    /// # Errors
    ///
    /// Returns an error if the connection is closed.
    pub fn did_open(&self, params: DidOpenTextDocumentParams) -> Result<()> {
        self.notify("textDocument/didOpen", params)
    }

    /// Notifies the server that a document changed.
    ///
    /// # Errors
    ///
    /// Returns an error if the connection is closed.
    pub fn did_change(&self, params: DidChangeTextDocumentParams) -> Result<()> {
        self.notify("textDocument/didChange", params)
    }

    /// Notifies the server that a document was saved.
    ///
    /// # Errors
    ///
    /// Returns an error if the connection is closed.
    pub fn did_save(&self, params: DidSaveTextDocumentParams) -> Result<()> {
        self.notify("textDocument/didSave", params)
    }

    /// Notifies the server that a document was closed.
    ///
    /// # Errors
    ///
    /// Returns an error if the connection is closed.
    pub fn did_close(&self, params: DidCloseTextDocumentParams) -> Result<()> {
        self.notify("textDocument/didClose", params)
    }

    /// Notifies the server that workspace folders were added or removed.
    ///
    /// # Errors
    ///
    /// Returns an error if the connection is closed.
    pub fn did_change_workspace_folders(&self, params: DidChangeWorkspaceFoldersParams) -> Result<()> {
        self.notify("workspace/didChangeWorkspaceFolders", params)
    }

    /// Asks the server to cancel a work done progress.
    ///
    /// # Errors
    ///
    /// Returns an error if the connection is closed.
    pub fn work_done_progress_cancel(&self, params: WorkDoneProgressCancelParams) -> Result<()> {
        self.notify("window/workDoneProgress/cancel", params)
    }

    /// Gets hover information for a position in a document.
    pub fn hover(&self, params: HoverParams) -> RequestHandle<Option<Hover>> {
        self.request("textDocument/hover", params)
    }

    /// Gets the definition location for a symbol.
    pub fn definition(
        &self,
        params: GotoDefinitionParams,
    ) -> RequestHandle<Option<GotoDefinitionResponse>> {
        self.request("textDocument/definition", params)
    }

    /// Gets the type definition location for a symbol.
    pub fn type_definition(
        &self,
        params: GotoDefinitionParams,
    ) -> RequestHandle<Option<GotoDefinitionResponse>> {
        self.request("textDocument/typeDefinition", params)
    }

    /// Gets implementation locations for a symbol.
    pub fn implementation(
        &self,
        params: GotoDefinitionParams,
    ) -> RequestHandle<Option<GotoDefinitionResponse>> {
        self.request("textDocument/implementation", params)
    }

    /// Gets all references to a symbol.
    pub fn references(&self, params: ReferenceParams) -> RequestHandle<Option<Vec<Location>>> {
        self.request("textDocument/references", params)
    }

    /// Gets the occurrences of the symbol under the cursor.
    pub fn document_highlight(
        &self,
        params: DocumentHighlightParams,
    ) -> RequestHandle<Option<Vec<DocumentHighlight>>> {
        self.request("textDocument/documentHighlight", params)
    }

    /// Gets document symbols (outline) for a file.
    pub fn document_symbols(
        &self,
        params: DocumentSymbolParams,
    ) -> RequestHandle<Option<DocumentSymbolResponse>> {
        self.request("textDocument/documentSymbol", params)
    }

    /// Searches for symbols across the workspace.
    pub fn workspace_symbols(
        &self,
        params: WorkspaceSymbolParams,
    ) -> RequestHandle<Option<WorkspaceSymbolResponse>> {
        self.request("workspace/symbol", params)
    }

    /// Gets code actions (quick fixes, refactorings) for a range.
    pub fn code_actions(&self, params: CodeActionParams) -> RequestHandle<Option<CodeActionResponse>> {
        self.request("textDocument/codeAction", params)
    }

    /// Gets code lenses for a document.
    pub fn code_lens(&self, params: CodeLensParams) -> RequestHandle<Option<Vec<CodeLens>>> {
        self.request("textDocument/codeLens", params)
    }

    /// Gets links embedded in a document.
    pub fn document_link(&self, params: DocumentLinkParams) -> RequestHandle<Option<Vec<DocumentLink>>> {
        self.request("textDocument/documentLink", params)
    }

    /// Gets completion suggestions at a position.
    pub fn completion(&self, params: CompletionParams) -> RequestHandle<Option<CompletionResponse>> {
        self.request("textDocument/completion", params)
    }

    /// Gets signature help for a function call.
    pub fn signature_help(&self, params: SignatureHelpParams) -> RequestHandle<Option<SignatureHelp>> {
        self.request("textDocument/signatureHelp", params)
    }

    /// Formats an entire document.
    pub fn formatting(&self, params: DocumentFormattingParams) -> RequestHandle<Option<Vec<TextEdit>>> {
        self.request("textDocument/formatting", params)
    }

    /// Formats a range within a document.
    pub fn range_formatting(
        &self,
        params: DocumentRangeFormattingParams,
    ) -> RequestHandle<Option<Vec<TextEdit>>> {
        self.request("textDocument/rangeFormatting", params)
    }

    /// Computes a rename operation across the workspace.
    pub fn rename(&self, params: RenameParams) -> RequestHandle<Option<WorkspaceEdit>> {
        self.request("textDocument/rename", params)
    }

    /// Gets folding ranges for a document.
    pub fn folding_range(&self, params: FoldingRangeParams) -> RequestHandle<Option<Vec<FoldingRange>>> {
        self.request("textDocument/foldingRange", params)
    }

    /// Gets selection ranges for positions.
    pub fn selection_range(
        &self,
        params: SelectionRangeParams,
    ) -> RequestHandle<Option<Vec<SelectionRange>>> {
        self.request("textDocument/selectionRange", params)
    }

    /// Gets semantic tokens for a whole document.
    pub fn semantic_tokens_full(
        &self,
        params: SemanticTokensParams,
    ) -> RequestHandle<Option<SemanticTokensResult>> {
        self.request("textDocument/semanticTokens/full", params)
    }

    /// Gets inlay hints for a range.
    pub fn inlay_hint(&self, params: InlayHintParams) -> RequestHandle<Option<Vec<InlayHint>>> {
        self.request("textDocument/inlayHint", params)
    }

    /// Prepares call hierarchy for a position.
    pub fn prepare_call_hierarchy(
        &self,
        params: CallHierarchyPrepareParams,
    ) -> RequestHandle<Option<Vec<CallHierarchyItem>>> {
        self.request("textDocument/prepareCallHierarchy", params)
    }

    /// Gets incoming calls to a call hierarchy item.
    pub fn incoming_calls(
        &self,
        params: CallHierarchyIncomingCallsParams,
    ) -> RequestHandle<Option<Vec<CallHierarchyIncomingCall>>> {
        self.request("callHierarchy/incomingCalls", params)
    }

    /// Gets outgoing calls from a call hierarchy item.
    pub fn outgoing_calls(
        &self,
        params: CallHierarchyOutgoingCallsParams,
    ) -> RequestHandle<Option<Vec<CallHierarchyOutgoingCall>>> {
        self.request("callHierarchy/outgoingCalls", params)
    }

    /// Runs a server-side command.
    pub fn execute_command(&self, params: ExecuteCommandParams) -> RequestHandle<Option<Value>> {
        self.request("workspace/executeCommand", params)
    }
}

/// An in-flight request.
///
/// Resolves to the decoded result, the server's error, or
/// [`Error::RequestTimeout`]. Dropping it before completion cancels the
/// request on the server.
#[must_use = "dropping a request handle cancels the request"]
pub struct RequestHandle<R> {
    id: RequestId,
    method: String,
    rx: Option<oneshot::Receiver<Result<Value>>>,
    deadline: Pin<Box<Sleep>>,
    timeout: Duration,
    server: LanguageServer,
    _marker: PhantomData<fn() -> R>,
}

impl<R> RequestHandle<R> {
    /// The JSON-RPC id of this request.
    #[must_use]
    pub const fn id(&self) -> &RequestId {
        &self.id
    }

    /// The LSP method of this request.
    #[must_use]
    pub fn method(&self) -> &str {
        &self.method
    }

    /// Cancels the request. Its result will never be observed.
    pub fn cancel(mut self) {
        if self.rx.take().is_some() {
            self.server.cancel_request(&self.id);
        }
    }
}

impl<R> std::fmt::Debug for RequestHandle<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestHandle")
            .field("id", &self.id)
            .field("method", &self.method)
            .field("done", &self.rx.is_none())
            .finish_non_exhaustive()
    }
}

impl<R: DeserializeOwned> Future for RequestHandle<R> {
    type Output = Result<R>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        let Some(rx) = this.rx.as_mut() else {
            return Poll::Ready(Err(Error::Cancelled));
        };

        match Pin::new(rx).poll(cx) {
            Poll::Ready(Ok(result)) => {
                this.rx = None;
                Poll::Ready(result.and_then(|value| {
                    serde_json::from_value(value).map_err(|e| {
                        Error::Json(format!("failed to parse '{}' response: {e}", this.method))
                    })
                }))
            }
            Poll::Ready(Err(_)) => {
                this.rx = None;
                Poll::Ready(Err(Error::ServerDisconnected {
                    server: this.server.server_id().to_string(),
                }))
            }
            Poll::Pending => {
                if this.deadline.as_mut().poll(cx).is_ready() {
                    this.rx = None;
                    this.server.cancel_request(&this.id);
                    return Poll::Ready(Err(Error::RequestTimeout {
                        method: this.method.clone(),
                        timeout: this.timeout,
                    }));
                }
                Poll::Pending
            }
        }
    }
}

impl<R> Drop for RequestHandle<R> {
    fn drop(&mut self) {
        if self.rx.take().is_some() {
            self.server.cancel_request(&self.id);
        }
    }
}

/// Runs the connection: spawns the writer task and reads frames until the
/// server closes its output.
///
/// When the read side ends the handle is closed and every pending request
/// completes with [`Error::ServerDisconnected`].
pub async fn serve(
    server: LanguageServer,
    outbound: Outbound,
    mut reader: BoxReader,
    writer: BoxWriter,
    handler: Arc<dyn MessageHandler>,
) {
    tokio::spawn(run_writer(
        server.shared.server.clone(),
        outbound,
        writer,
        server.shared.closed.clone(),
        server.shared.options.log_traffic,
    ));

    let mut buffer = BytesMut::with_capacity(8192);
    let mut temp = [0u8; 4096];

    'read: loop {
        match reader.read(&mut temp).await {
            Ok(0) => {
                debug!(server = %server.shared.server, "LSP stdout closed");
                break;
            }
            Ok(n) => buffer.extend_from_slice(&temp[..n]),
            Err(e) => {
                debug!(server = %server.shared.server, "error reading from LSP stdout: {e}");
                break;
            }
        }

        loop {
            match protocol::try_parse_message(&mut buffer) {
                Ok(Some(body)) => dispatch(&server, handler.as_ref(), &body),
                Ok(None) => break,
                Err(e) => {
                    warn!(server = %server.shared.server, "malformed frame, dropping connection: {e}");
                    break 'read;
                }
            }
        }
    }

    server.close();
    server.fail_pending(|| Error::ServerDisconnected {
        server: server.shared.server.clone(),
    });
}

fn dispatch(server: &LanguageServer, handler: &dyn MessageHandler, body: &str) {
    if server.shared.options.log_traffic {
        trace!(target: TRAFFIC_TARGET, server = %server.shared.server, "<-- {body}");
    }

    let message = match Incoming::parse(body) {
        Ok(message) => message,
        Err(e) => {
            warn!(server = %server.shared.server, "failed to parse message: {e}");
            return;
        }
    };

    match message {
        Incoming::Response(response) => server.complete(response),
        Incoming::Notification(notification) => {
            let method = notification.method;
            let outcome = std::panic::catch_unwind(AssertUnwindSafe(|| {
                handler.on_notification(&method, notification.params);
            }));
            if outcome.is_err() {
                error!(server = %server.shared.server, %method, "notification handler panicked");
            }
        }
        Incoming::Request(request) => {
            debug!(server = %server.shared.server, method = %request.method, id = %request.id, "received server request");
            let outcome = std::panic::catch_unwind(AssertUnwindSafe(|| {
                handler.on_request(&request.method, request.params)
            }));
            let response = match outcome {
                Ok(Ok(result)) => ResponseMessage::ok(request.id, result),
                Ok(Err(err)) => ResponseMessage {
                    jsonrpc: "2.0".to_string(),
                    id: Some(request.id),
                    result: None,
                    error: Some(err),
                },
                Err(_) => {
                    error!(server = %server.shared.server, method = %request.method, "request handler panicked");
                    ResponseMessage::err(request.id, protocol::INTERNAL_ERROR, "client handler failed")
                }
            };
            server.respond(&response);
        }
    }
}

async fn run_writer(
    server: String,
    Outbound(mut rx): Outbound,
    mut writer: BoxWriter,
    closed: CancellationToken,
    log_traffic: bool,
) {
    loop {
        // Queued frames are always written before honouring close.
        tokio::select! {
            biased;
            frame = rx.recv() => {
                let Some(frame) = frame else { break };
                if let Err(e) = write_frame(&server, &mut writer, &frame, log_traffic).await {
                    debug!(server = %server, "write to LSP stdin failed: {e}");
                    closed.cancel();
                    break;
                }
            }
            () = closed.cancelled() => {
                while let Ok(frame) = rx.try_recv() {
                    if write_frame(&server, &mut writer, &frame, log_traffic).await.is_err() {
                        break;
                    }
                }
                break;
            }
        }
    }

    let _ = writer.shutdown().await;
    debug!(server = %server, "writer task finished");
}

async fn write_frame(
    server: &str,
    writer: &mut BoxWriter,
    frame: &Bytes,
    log_traffic: bool,
) -> std::io::Result<()> {
    if log_traffic {
        trace!(target: TRAFFIC_TARGET, server, "--> {}", String::from_utf8_lossy(frame));
    }
    writer.write_all(frame).await?;
    writer.flush().await
}

#[cfg(test)]
#[allow(
    clippy::unwrap_used,
    clippy::expect_used,
    reason = "Tests use unwrap for clear failure messages"
)]
mod tests {
    use super::*;
    use tokio::io::{AsyncRead, AsyncWrite, DuplexStream, duplex};

    /// In-memory peer that speaks framed JSON-RPC on the other end of the pipes.
    struct Peer {
        reader: DuplexStream,
        writer: DuplexStream,
        buffer: BytesMut,
    }

    impl Peer {
        async fn recv(&mut self) -> Value {
            loop {
                if let Some(body) = protocol::try_parse_message(&mut self.buffer).unwrap() {
                    return serde_json::from_str(&body).unwrap();
                }
                let mut temp = [0u8; 1024];
                let n = self.reader.read(&mut temp).await.unwrap();
                assert!(n > 0, "client closed the pipe");
                self.buffer.extend_from_slice(&temp[..n]);
            }
        }

        async fn send(&mut self, value: &Value) {
            let frame = protocol::encode_message(value).unwrap();
            self.writer.write_all(&frame).await.unwrap();
        }
    }

    fn connect(options: RpcOptions) -> (LanguageServer, Peer, tokio::task::JoinHandle<()>) {
        let (client_out, peer_in) = duplex(64 * 1024);
        let (peer_out, client_in) = duplex(64 * 1024);
        let (server, outbound) = LanguageServer::channel("test", options);
        let reader: Box<dyn AsyncRead + Send + Unpin> = Box::new(client_in);
        let writer: Box<dyn AsyncWrite + Send + Unpin> = Box::new(client_out);
        let task = tokio::spawn(serve(
            server.clone(),
            outbound,
            reader,
            writer,
            Arc::new(IgnoreMessages),
        ));
        let peer = Peer {
            reader: peer_in,
            writer: peer_out,
            buffer: BytesMut::new(),
        };
        (server, peer, task)
    }

    #[tokio::test]
    async fn test_request_response_roundtrip() {
        let (server, mut peer, _task) = connect(RpcOptions::default());

        let handle: RequestHandle<Value> = server.request("test/echo", serde_json::json!({"x": 1}));
        let request = peer.recv().await;
        assert_eq!(request["method"], "test/echo");
        peer.send(&serde_json::json!({"jsonrpc": "2.0", "id": request["id"], "result": {"ok": true}}))
            .await;

        let result = handle.await.unwrap();
        assert_eq!(result["ok"], true);
        assert_eq!(server.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_error_response_passthrough() {
        let (server, mut peer, _task) = connect(RpcOptions::default());

        let handle: RequestHandle<Value> = server.request("test/fail", Value::Null);
        let request = peer.recv().await;
        peer.send(&serde_json::json!({
            "jsonrpc": "2.0",
            "id": request["id"],
            "error": {"code": -32800, "message": "cancelled", "data": {"retry": false}}
        }))
        .await;

        let err = handle.await.unwrap_err();
        assert!(err.is_request_cancelled());
        assert!(matches!(err, Error::Response { data: Some(_), .. }));
    }

    #[tokio::test]
    async fn test_drop_sends_cancel_request() {
        let (server, mut peer, _task) = connect(RpcOptions::default());

        let handle: RequestHandle<Value> = server.request("test/slow", Value::Null);
        let id = handle.id().clone();
        let request = peer.recv().await;
        drop(handle);

        let cancel = peer.recv().await;
        assert_eq!(cancel["method"], "$/cancelRequest");
        assert_eq!(cancel["params"]["id"], request["id"]);
        assert_eq!(id, RequestId::Number(request["id"].as_i64().unwrap()));
        assert_eq!(server.pending_count(), 0);

        // A late response is ignored.
        peer.send(&serde_json::json!({"jsonrpc": "2.0", "id": request["id"], "result": 1}))
            .await;
    }

    #[tokio::test]
    async fn test_timeout_cancels() {
        let options = RpcOptions {
            request_timeout: Duration::from_millis(20),
            log_traffic: true,
        };
        let (server, mut peer, _task) = connect(options);

        let handle: RequestHandle<Value> = server.request("test/hang", Value::Null);
        let err = handle.await.unwrap_err();
        assert!(matches!(err, Error::RequestTimeout { ref method, .. } if method == "test/hang"));

        let _request = peer.recv().await;
        let cancel = peer.recv().await;
        assert_eq!(cancel["method"], "$/cancelRequest");
    }

    #[tokio::test]
    async fn test_notifications_keep_order() {
        let (server, mut peer, _task) = connect(RpcOptions::default());

        for i in 0..20 {
            server.notify("test/seq", serde_json::json!({ "n": i })).unwrap();
        }
        for i in 0..20 {
            let message = peer.recv().await;
            assert_eq!(message["params"]["n"], i);
        }
    }

    #[tokio::test]
    async fn test_server_request_gets_method_not_found() {
        let (_server, mut peer, _task) = connect(RpcOptions::default());

        peer.send(&serde_json::json!({"jsonrpc": "2.0", "id": 99, "method": "custom/thing"}))
            .await;
        let response = peer.recv().await;
        assert_eq!(response["id"], 99);
        assert_eq!(response["error"]["code"], protocol::METHOD_NOT_FOUND);
    }

    #[tokio::test]
    async fn test_eof_fails_pending_with_disconnected() {
        let (server, peer, task) = connect(RpcOptions::default());

        let handle: RequestHandle<Value> = server.request("test/never", Value::Null);
        drop(peer);
        task.await.unwrap();

        let err = handle.await.unwrap_err();
        assert!(matches!(err, Error::ServerDisconnected { .. }));
        assert!(server.is_closed());
        assert!(server.notify("test/after", Value::Null).is_err());
    }

    #[tokio::test]
    async fn test_oversized_frame_drops_connection() {
        let (server, mut peer, task) = connect(RpcOptions::default());

        let handle: RequestHandle<Value> = server.request("test/big", Value::Null);
        let _request = peer.recv().await;
        let header = format!("Content-Length: {}\r\n\r\n", protocol::MAX_FRAME_BYTES + 1);
        peer.writer.write_all(header.as_bytes()).await.unwrap();
        task.await.unwrap();

        let err = handle.await.unwrap_err();
        assert!(matches!(err, Error::ServerDisconnected { .. }));
        assert!(server.is_closed());
    }

    #[tokio::test]
    async fn test_handler_panic_does_not_kill_dispatcher() {
        struct Panicky;
        impl MessageHandler for Panicky {
            #[allow(clippy::panic, reason = "Exercising panic containment")]
            fn on_notification(&self, _method: &str, _params: Value) {
                panic!("handler bug");
            }
        }

        let (client_out, peer_in) = duplex(4096);
        let (peer_out, client_in) = duplex(4096);
        let (server, outbound) = LanguageServer::channel("panicky", RpcOptions::default());
        let _task = tokio::spawn(serve(
            server.clone(),
            outbound,
            Box::new(client_in),
            Box::new(client_out),
            Arc::new(Panicky),
        ));
        let mut peer = Peer {
            reader: peer_in,
            writer: peer_out,
            buffer: BytesMut::new(),
        };

        peer.send(&serde_json::json!({"jsonrpc": "2.0", "method": "window/logMessage", "params": {}}))
            .await;
        let handle: RequestHandle<Value> = server.request("test/after", Value::Null);
        let request = peer.recv().await;
        peer.send(&serde_json::json!({"jsonrpc": "2.0", "id": request["id"], "result": "alive"}))
            .await;
        assert_eq!(handle.await.unwrap(), "alive");
    }
}
