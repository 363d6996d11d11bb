// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (C) 2026 Mark Wells <contact@markwells.dev>

//! A configurable mock LSP server for testing.
//!
//! Speaks Content-Length framed JSON-RPC over stdin/stdout using the same
//! codec as the client. CLI flags control capabilities, timing and failure
//! modes. The custom `mockls/receivedNotifications` request returns every
//! notification the client has sent so far, which lets tests count
//! `didOpen`/`didClose` and observe `$/cancelRequest`.

use std::collections::HashMap;
use std::io::{Read, Write};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::BytesMut;
use clap::Parser;
use serde::Serialize;
use serde_json::{Value, json};
use tether_lsp::lsp::protocol::{
    self, INTERNAL_ERROR, Incoming, METHOD_NOT_FOUND, NotificationMessage, REQUEST_CANCELLED,
    RequestId, RequestMessage, ResponseMessage,
};

const PROGRESS_TOKEN: &str = "mockls-indexing";

/// Mock LSP server for integration testing.
#[derive(Parser, Debug, Default)]
#[command(name = "mockls")]
struct Args {
    /// Advertise workspace folder support with change notifications.
    #[arg(long)]
    workspace_folders: bool,

    /// Register workspace folder notifications dynamically after `initialized`.
    #[arg(long)]
    register_folders: bool,

    /// Emit a progress begin/report/end sequence after `initialized` (milliseconds).
    #[arg(long, default_value_t = 0)]
    indexing_delay: u64,

    /// Sleep before every response (milliseconds).
    #[arg(long, default_value_t = 0)]
    response_delay: u64,

    /// Exit with status 1 after n responses (simulate crash).
    #[arg(long)]
    drop_after: Option<u64>,

    /// Never respond to this method (repeatable).
    #[arg(long)]
    hang_on: Vec<String>,

    /// Return `InternalError` for this method (repeatable).
    #[arg(long)]
    fail_on: Vec<String>,

    /// Return `RequestCancelled` for this method (repeatable).
    #[arg(long)]
    cancel_on: Vec<String>,

    /// Omit a server capability key such as `hoverProvider` (repeatable).
    #[arg(long)]
    disable: Vec<String>,

    /// Label prefixed to hover text so fan-out results can be told apart.
    #[arg(long)]
    tag: Option<String>,
}

/// Outgoing side of the connection, shared with the indexing thread.
#[derive(Clone)]
struct Outbox {
    writer: Arc<Mutex<Box<dyn Write + Send>>>,
    next_id: Arc<AtomicI64>,
}

impl Outbox {
    fn new(writer: Box<dyn Write + Send>) -> Self {
        Self {
            writer: Arc::new(Mutex::new(writer)),
            next_id: Arc::new(AtomicI64::new(1)),
        }
    }

    fn send<T: Serialize>(&self, message: &T) {
        let Ok(frame) = protocol::encode_message(message) else {
            return;
        };
        let Ok(mut writer) = self.writer.lock() else {
            return;
        };
        let _ = writer.write_all(&frame).and_then(|()| writer.flush());
    }

    fn notify(&self, method: &str, params: Value) {
        self.send(&NotificationMessage::new(method, params));
    }

    /// Sends a server to client request. Replies are read and dropped.
    fn request(&self, method: &str, params: Value) {
        let id = RequestId::Number(self.next_id.fetch_add(1, Ordering::SeqCst));
        self.send(&RequestMessage::new(id, method, params));
    }
}

struct MockServer {
    args: Args,
    documents: HashMap<String, String>,
    /// Every client notification received, as `{ method, uri, languageId }`.
    received: Vec<Value>,
    responses: u64,
    outbox: Outbox,
}

impl MockServer {
    fn new(args: Args, outbox: Outbox) -> Self {
        Self {
            args,
            documents: HashMap::new(),
            received: Vec::new(),
            responses: 0,
            outbox,
        }
    }

    /// Serves until the reader closes or sends a malformed frame.
    fn run(&mut self, reader: &mut dyn Read) {
        let mut buffer = BytesMut::new();
        let mut chunk = [0u8; 4096];

        loop {
            match reader.read(&mut chunk) {
                Ok(0) | Err(_) => return,
                Ok(n) => buffer.extend_from_slice(&chunk[..n]),
            }

            loop {
                match protocol::try_parse_message(&mut buffer) {
                    Ok(Some(body)) => self.dispatch(&body),
                    Ok(None) => break,
                    Err(_) => return,
                }
            }
        }
    }

    fn dispatch(&mut self, body: &str) {
        match Incoming::parse(body) {
            Ok(Incoming::Request(request)) => self.handle_request(request),
            Ok(Incoming::Notification(notification)) => {
                self.handle_notification(&notification.method, &notification.params);
            }
            Ok(Incoming::Response(_)) | Err(_) => {}
        }
    }

    fn handle_request(&mut self, request: RequestMessage) {
        let RequestMessage {
            id, method, params, ..
        } = request;

        if self.args.hang_on.contains(&method) {
            return;
        }

        if self.args.response_delay > 0 {
            std::thread::sleep(Duration::from_millis(self.args.response_delay));
        }

        let response = if self.args.fail_on.contains(&method) {
            ResponseMessage::err(
                id,
                INTERNAL_ERROR,
                format!("mockls: configured to fail on {method}"),
            )
        } else if self.args.cancel_on.contains(&method) {
            ResponseMessage::err(id, REQUEST_CANCELLED, format!("mockls: cancelled {method}"))
        } else {
            match self.answer(&method, &params) {
                Some(result) => ResponseMessage::ok(id, result),
                None => ResponseMessage::err(
                    id,
                    METHOD_NOT_FOUND,
                    format!("mockls: method not found: {method}"),
                ),
            }
        };

        self.outbox.send(&response);
        self.responses += 1;
        if self.args.drop_after.is_some_and(|max| self.responses >= max) {
            std::process::exit(1);
        }
    }

    /// Result for a supported method, `None` for an unknown one.
    fn answer(&self, method: &str, params: &Value) -> Option<Value> {
        let result = match method {
            "initialize" => self.initialize_result(),
            "shutdown" => Value::Null,
            "mockls/receivedNotifications" => Value::Array(self.received.clone()),
            "textDocument/hover" => json!(self.word_at(params).map(|at| self.hover(&at.word))),
            "textDocument/definition" => {
                json!(self.word_at(params).as_ref().and_then(WordAt::definition))
            }
            "textDocument/references" => json!(self.word_at(params).map(|at| {
                at.occurrences()
                    .map(|(line, col)| at.location(line, col))
                    .collect::<Vec<_>>()
            })),
            "textDocument/documentHighlight" => json!(self.word_at(params).map(|at| {
                at.occurrences()
                    .map(|(line, col)| json!({ "range": at.range(line, col), "kind": 1 }))
                    .collect::<Vec<_>>()
            })),
            "textDocument/documentSymbol" => {
                json!(self.document(params).map(|(_, text)| symbols(text)))
            }
            "textDocument/formatting" => {
                json!(self.document(params).map(|(_, text)| trailing_whitespace_edits(text)))
            }
            "workspace/symbol" => self.workspace_symbols(params),
            _ => return None,
        };
        Some(result)
    }

    fn handle_notification(&mut self, method: &str, params: &Value) {
        let field = |name: &str| params["textDocument"][name].clone();
        self.received.push(json!({
            "method": method,
            "uri": field("uri"),
            "languageId": field("languageId")
        }));

        let uri = params["textDocument"]["uri"].as_str().unwrap_or_default();
        match method {
            "initialized" => {
                if self.args.register_folders {
                    self.outbox.request(
                        "client/registerCapability",
                        json!({
                            "registrations": [{
                                "id": "mockls-folders",
                                "method": "workspace/didChangeWorkspaceFolders"
                            }]
                        }),
                    );
                }
                if self.args.indexing_delay > 0 {
                    simulate_indexing(self.outbox.clone(), self.args.indexing_delay);
                }
            }
            "textDocument/didOpen" => {
                let text = params["textDocument"]["text"].as_str().unwrap_or_default();
                self.documents.insert(uri.to_string(), text.to_string());
                self.publish_diagnostics(uri);
            }
            "textDocument/didChange" => {
                if let Some(text) = params["contentChanges"]
                    .as_array()
                    .and_then(|changes| changes.last())
                    .and_then(|change| change["text"].as_str())
                {
                    self.documents.insert(uri.to_string(), text.to_string());
                }
                self.publish_diagnostics(uri);
            }
            "textDocument/didClose" => {
                self.documents.remove(uri);
            }
            "exit" => std::process::exit(0),
            // Everything else is only recorded
            _ => {}
        }
    }

    fn initialize_result(&self) -> Value {
        let mut capabilities = json!({
            "hoverProvider": true,
            "definitionProvider": true,
            "referencesProvider": true,
            "documentHighlightProvider": true,
            "documentSymbolProvider": true,
            "documentFormattingProvider": true,
            "workspaceSymbolProvider": true,
            "textDocumentSync": {
                "openClose": true,
                "change": 1,
                "save": { "includeText": false }
            }
        });

        if self.args.workspace_folders {
            capabilities["workspace"] = json!({
                "workspaceFolders": { "supported": true, "changeNotifications": true }
            });
        }

        if let Some(map) = capabilities.as_object_mut() {
            for key in &self.args.disable {
                map.remove(key);
            }
        }

        json!({
            "capabilities": capabilities,
            "serverInfo": { "name": "mockls", "version": env!("CARGO_PKG_VERSION") }
        })
    }

    fn hover(&self, word: &str) -> Value {
        let value = match &self.args.tag {
            Some(tag) => format!("{tag}: `{word}`"),
            None => format!("```\n{word}\n```"),
        };
        json!({ "contents": { "kind": "markdown", "value": value } })
    }

    /// Every document symbol whose name contains the query, as flat
    /// `SymbolInformation`.
    fn workspace_symbols(&self, params: &Value) -> Value {
        let query = params["query"].as_str().unwrap_or_default();
        let found: Vec<Value> = self
            .documents
            .iter()
            .flat_map(|(uri, text)| {
                symbols(text).into_iter().filter_map(move |symbol| {
                    let name = symbol["name"].as_str()?;
                    name.contains(query).then(|| {
                        json!({
                            "name": name,
                            "kind": symbol["kind"],
                            "location": { "uri": uri, "range": symbol["range"] }
                        })
                    })
                })
            })
            .collect();
        Value::Array(found)
    }

    /// The open document named by `params.textDocument.uri`.
    fn document<'a>(&'a self, params: &'a Value) -> Option<(&'a str, &'a str)> {
        let uri = params["textDocument"]["uri"].as_str()?;
        let text = self.documents.get(uri)?;
        Some((uri, text))
    }

    /// The word under `params.position`.
    fn word_at<'a>(&'a self, params: &'a Value) -> Option<WordAt<'a>> {
        let (uri, text) = self.document(params)?;
        let line = usize::try_from(params["position"]["line"].as_u64()?).ok()?;
        let col = usize::try_from(params["position"]["character"].as_u64()?).ok()?;
        let word = word_in(text.lines().nth(line)?, col)?;
        Some(WordAt { uri, text, word })
    }

    fn publish_diagnostics(&self, uri: &str) {
        self.outbox.notify(
            "textDocument/publishDiagnostics",
            json!({
                "uri": uri,
                "diagnostics": [{
                    "range": range(0, 0, 1),
                    "severity": 2,
                    "source": "mockls",
                    "message": "mockls: mock diagnostic"
                }]
            }),
        );
    }
}

/// A word found under a position in an open document.
struct WordAt<'a> {
    uri: &'a str,
    text: &'a str,
    word: String,
}

impl WordAt<'_> {
    fn occurrences(&self) -> impl Iterator<Item = (usize, usize)> + '_ {
        self.text.lines().enumerate().flat_map(move |(line, text)| {
            text.match_indices(self.word.as_str())
                .map(move |(col, _)| (line, col))
        })
    }

    fn range(&self, line: usize, col: usize) -> Value {
        range(line, col, col + self.word.len())
    }

    fn location(&self, line: usize, col: usize) -> Value {
        json!({ "uri": self.uri, "range": self.range(line, col) })
    }

    /// The `fn`/`let`/... line introducing the word, else its first use.
    fn definition(&self) -> Option<Value> {
        let declared = self.text.lines().enumerate().find_map(|(line, text)| {
            DECLARATIONS.iter().find_map(|(keyword, _)| {
                let pattern = format!("{keyword}{}", self.word);
                let col = text.find(&pattern)?;
                Some(json!({
                    "uri": self.uri,
                    "range": range(line, col, col + pattern.len())
                }))
            })
        });
        declared.or_else(|| {
            self.occurrences()
                .next()
                .map(|(line, col)| self.location(line, col))
        })
    }
}

/// Declaration keywords and the `SymbolKind` they introduce.
const DECLARATIONS: [(&str, u8); 6] = [
    ("fn ", 12),
    ("function ", 12),
    ("def ", 12),
    ("let ", 13),
    ("const ", 14),
    ("var ", 13),
];

fn range(line: usize, start: usize, end: usize) -> Value {
    json!({
        "start": { "line": line, "character": start },
        "end": { "line": line, "character": end }
    })
}

const fn is_word_byte(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b == b'_'
}

fn word_in(line: &str, col: usize) -> Option<String> {
    let bytes = line.as_bytes();
    if !is_word_byte(*bytes.get(col)?) {
        return None;
    }
    let start = bytes[..col]
        .iter()
        .rposition(|&b| !is_word_byte(b))
        .map_or(0, |i| i + 1);
    let end = bytes[col..]
        .iter()
        .position(|&b| !is_word_byte(b))
        .map_or(bytes.len(), |i| col + i);
    line.get(start..end).map(str::to_string)
}

/// One `DocumentSymbol` per declaration line.
fn symbols(text: &str) -> Vec<Value> {
    text.lines()
        .enumerate()
        .filter_map(|(line, line_text)| {
            let trimmed = line_text.trim_start();
            let indent = line_text.len() - trimmed.len();
            DECLARATIONS.iter().find_map(|(keyword, kind)| {
                let rest = trimmed.strip_prefix(*keyword)?;
                let len = rest.bytes().take_while(|&b| is_word_byte(b)).count();
                let name = rest.get(..len).filter(|name| !name.is_empty())?;
                let start = indent + keyword.len();
                Some(json!({
                    "name": name,
                    "kind": kind,
                    "range": range(line, indent, line_text.len()),
                    "selectionRange": range(line, start, start + len)
                }))
            })
        })
        .collect()
}

/// Edits that strip trailing whitespace from every line.
fn trailing_whitespace_edits(text: &str) -> Vec<Value> {
    text.lines()
        .enumerate()
        .filter_map(|(line, line_text)| {
            let kept = line_text.trim_end().len();
            (kept < line_text.len())
                .then(|| json!({ "range": range(line, kept, line_text.len()), "newText": "" }))
        })
        .collect()
}

/// Announces a progress token, then runs begin/report/end over `delay` ms.
fn simulate_indexing(outbox: Outbox, delay: u64) {
    std::thread::spawn(move || {
        let progress = |value: Value| {
            outbox.notify("$/progress", json!({ "token": PROGRESS_TOKEN, "value": value }));
        };

        outbox.request(
            "window/workDoneProgress/create",
            json!({ "token": PROGRESS_TOKEN }),
        );
        std::thread::sleep(Duration::from_millis(50));
        progress(json!({ "kind": "begin", "title": "Indexing", "percentage": 0 }));
        std::thread::sleep(Duration::from_millis(delay / 2));
        progress(json!({ "kind": "report", "message": "files", "percentage": 50 }));
        std::thread::sleep(Duration::from_millis(delay - delay / 2));
        progress(json!({ "kind": "end", "message": "Indexing complete" }));
    });
}

fn main() {
    let args = Args::parse();
    let mut server = MockServer::new(args, Outbox::new(Box::new(std::io::stdout())));
    server.run(&mut std::io::stdin().lock());
}

#[cfg(test)]
#[allow(
    clippy::expect_used,
    clippy::unwrap_used,
    reason = "Tests use expect/unwrap for clear failure messages"
)]
mod tests {
    use super::*;
    use std::io::Cursor;

    /// Captures everything the server writes.
    #[derive(Clone, Default)]
    struct Captured(Arc<Mutex<Vec<u8>>>);

    impl Write for Captured {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0
                .lock()
                .map_err(|e| std::io::Error::other(e.to_string()))?
                .extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    impl Captured {
        fn messages(&self) -> Vec<Value> {
            let mut buffer = BytesMut::from(self.0.lock().unwrap().as_slice());
            let mut messages = Vec::new();
            while let Some(body) = protocol::try_parse_message(&mut buffer).unwrap() {
                messages.push(serde_json::from_str(&body).unwrap());
            }
            messages
        }
    }

    fn frames(messages: &[Value]) -> Vec<u8> {
        messages
            .iter()
            .flat_map(|m| protocol::encode_message(m).unwrap().to_vec())
            .collect()
    }

    fn serve(args: Args, input: &[Value]) -> Captured {
        let captured = Captured::default();
        let mut server = MockServer::new(args, Outbox::new(Box::new(captured.clone())));
        server.run(&mut Cursor::new(frames(input)));
        captured
    }

    fn reply(messages: &[Value], id: u64) -> Value {
        messages
            .iter()
            .find(|m| m["id"].as_u64() == Some(id) && m.get("method").is_none())
            .cloned()
            .expect("reply with the request id")
    }

    fn request(id: u64, method: &str, params: Value) -> Value {
        json!({ "jsonrpc": "2.0", "id": id, "method": method, "params": params })
    }

    fn notification(method: &str, params: Value) -> Value {
        json!({ "jsonrpc": "2.0", "method": method, "params": params })
    }

    fn initialize() -> Value {
        request(1, "initialize", json!({ "processId": null, "capabilities": {} }))
    }

    fn did_open(uri: &str, text: &str) -> Value {
        notification(
            "textDocument/didOpen",
            json!({
                "textDocument": { "uri": uri, "languageId": "rust", "version": 1, "text": text }
            }),
        )
    }

    fn at(id: u64, method: &str, uri: &str, line: u64, character: u64) -> Value {
        request(
            id,
            method,
            json!({
                "textDocument": { "uri": uri },
                "position": { "line": line, "character": character }
            }),
        )
    }

    const URI: &str = "file:///tmp/main.rs";
    const SOURCE: &str = "fn helper() {}\nfn main() { helper(); }\n";

    #[test]
    fn test_capabilities_follow_flags() {
        let args = Args {
            workspace_folders: true,
            disable: vec!["hoverProvider".to_string()],
            ..Args::default()
        };
        let messages = serve(args, &[initialize()]).messages();

        let result = &reply(&messages, 1)["result"];
        let caps = &result["capabilities"];
        assert!(caps.get("hoverProvider").is_none());
        assert_eq!(caps["definitionProvider"], true);
        assert_eq!(caps["textDocumentSync"]["save"]["includeText"], false);
        assert_eq!(caps["workspace"]["workspaceFolders"]["changeNotifications"], true);
        assert_eq!(result["serverInfo"]["name"], "mockls");
    }

    #[test]
    fn test_open_publishes_diagnostics() {
        let messages = serve(Args::default(), &[initialize(), did_open(URI, SOURCE)]).messages();

        let published = messages
            .iter()
            .find(|m| m["method"] == "textDocument/publishDiagnostics")
            .expect("publishDiagnostics");
        assert_eq!(published["params"]["uri"], URI);
        assert_eq!(published["params"]["diagnostics"][0]["severity"], 2);
        assert_eq!(published["params"]["diagnostics"][0]["source"], "mockls");
    }

    #[test]
    fn test_word_queries() {
        let args = Args {
            tag: Some("alpha".to_string()),
            ..Args::default()
        };
        let messages = serve(
            args,
            &[
                initialize(),
                did_open(URI, SOURCE),
                at(2, "textDocument/hover", URI, 1, 13),
                at(3, "textDocument/definition", URI, 1, 13),
                at(4, "textDocument/references", URI, 1, 13),
                at(5, "textDocument/hover", URI, 1, 2),
            ],
        )
        .messages();

        assert_eq!(reply(&messages, 2)["result"]["contents"]["value"], "alpha: `helper`");
        let definition = reply(&messages, 3);
        assert_eq!(definition["result"]["range"]["start"], json!({ "line": 0, "character": 0 }));
        assert_eq!(reply(&messages, 4)["result"].as_array().map(Vec::len), Some(2));
        // Space between words
        assert_eq!(reply(&messages, 5)["result"], Value::Null);
    }

    #[test]
    fn test_symbols() {
        let messages = serve(
            Args::default(),
            &[
                initialize(),
                did_open(URI, "fn main() {}\n    let count = 1;\n"),
                request(2, "textDocument/documentSymbol", json!({ "textDocument": { "uri": URI } })),
                request(3, "workspace/symbol", json!({ "query": "cou" })),
            ],
        )
        .messages();

        let outline = reply(&messages, 2)["result"].clone();
        assert_eq!(outline[0]["name"], "main");
        assert_eq!(outline[1]["name"], "count");
        assert_eq!(outline[1]["kind"], 13);
        assert_eq!(outline[1]["selectionRange"]["start"]["character"], 8);

        let found = reply(&messages, 3)["result"].clone();
        assert_eq!(found.as_array().map(Vec::len), Some(1));
        assert_eq!(found[0]["location"]["uri"], URI);
    }

    #[test]
    fn test_formatting_strips_trailing_whitespace() {
        let messages = serve(
            Args::default(),
            &[
                initialize(),
                did_open(URI, "fn a() {}   \nok\n"),
                request(2, "textDocument/formatting", json!({ "textDocument": { "uri": URI } })),
            ],
        )
        .messages();

        let edits = reply(&messages, 2)["result"].clone();
        assert_eq!(edits.as_array().map(Vec::len), Some(1));
        assert_eq!(edits[0]["range"]["start"]["character"], 9);
    }

    #[test]
    fn test_configured_failures() {
        let args = Args {
            fail_on: vec!["textDocument/hover".to_string()],
            cancel_on: vec!["textDocument/documentSymbol".to_string()],
            hang_on: vec!["textDocument/definition".to_string()],
            ..Args::default()
        };
        let messages = serve(
            args,
            &[
                initialize(),
                at(2, "textDocument/hover", URI, 0, 0),
                request(3, "textDocument/documentSymbol", json!({ "textDocument": { "uri": URI } })),
                at(4, "textDocument/definition", URI, 0, 0),
                request(5, "custom/unknown", Value::Null),
            ],
        )
        .messages();

        assert_eq!(reply(&messages, 2)["error"]["code"], INTERNAL_ERROR);
        assert_eq!(reply(&messages, 3)["error"]["code"], REQUEST_CANCELLED);
        assert!(!messages.iter().any(|m| m["id"] == 4));
        assert_eq!(reply(&messages, 5)["error"]["code"], METHOD_NOT_FOUND);
    }

    #[test]
    fn test_received_notifications_are_recorded() {
        let messages = serve(
            Args::default(),
            &[
                initialize(),
                did_open(URI, SOURCE),
                notification("$/cancelRequest", json!({ "id": 7 })),
                notification("textDocument/didClose", json!({ "textDocument": { "uri": URI } })),
                request(2, "mockls/receivedNotifications", Value::Null),
            ],
        )
        .messages();

        let received = reply(&messages, 2)["result"].clone();
        let methods: Vec<&str> = received
            .as_array()
            .expect("array")
            .iter()
            .filter_map(|n| n["method"].as_str())
            .collect();
        assert_eq!(
            methods,
            ["textDocument/didOpen", "$/cancelRequest", "textDocument/didClose"]
        );
        assert_eq!(received[0]["uri"], URI);
        assert_eq!(received[0]["languageId"], "rust");
        assert_eq!(received[1]["uri"], Value::Null);
    }

    #[test]
    fn test_progress_sequence() {
        let args = Args {
            indexing_delay: 100,
            ..Args::default()
        };
        let captured = serve(args, &[initialize(), notification("initialized", json!({}))]);
        std::thread::sleep(Duration::from_millis(300));
        let messages = captured.messages();

        assert!(
            messages
                .iter()
                .any(|m| m["method"] == "window/workDoneProgress/create"),
            "{messages:?}"
        );
        let kinds: Vec<&str> = messages
            .iter()
            .filter(|m| m["method"] == "$/progress")
            .filter_map(|m| m["params"]["value"]["kind"].as_str())
            .collect();
        assert_eq!(kinds, ["begin", "report", "end"]);
    }
}
