// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (C) 2026 Mark Wells <contact@markwells.dev>

//! Fan-out of one request to every matching server.
//!
//! An executor resolves its wrappers when a policy runs, starts them as
//! needed, skips servers whose capabilities do not pass the filter, and
//! issues the work to all remaining servers at once. Every policy returns
//! immediately with a [`Pending`] handle; cancelling or dropping it cancels
//! every per-server request still in flight.

use futures::StreamExt;
use futures::stream::FuturesUnordered;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::capabilities::{Capability, CapabilityFilter};
use super::manager::LanguageServers;
use super::rpc::LanguageServer;
use super::task::Pending;
use super::wrapper::ServerWrapper;
use crate::document::DocumentSnapshot;
use crate::error::Result;

/// The outcome of one server in [`compute_all`](DocumentExecutor::compute_all).
#[derive(Debug)]
pub struct ServerResult<R> {
    /// Definition id of the server.
    pub server: String,
    /// The server's answer; `Ok(None)` when it had nothing or was filtered out.
    pub result: Pending<Option<R>>,
}

/// Options shared by both executor kinds.
#[derive(Debug, Clone)]
struct Plan {
    filter: CapabilityFilter,
    token: CancellationToken,
}

impl Plan {
    fn new(servers: &LanguageServers) -> Self {
        Self {
            filter: CapabilityFilter::Any,
            token: servers.cancellation_token().child_token(),
        }
    }

    fn dispatch<F, Fut, R>(
        &self,
        wrappers: Vec<ServerWrapper>,
        document: Option<&DocumentSnapshot>,
        parent: &CancellationToken,
        work: F,
    ) -> Vec<ServerResult<R>>
    where
        F: Fn(LanguageServer) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Option<R>>> + Send + 'static,
        R: Send + 'static,
    {
        let work = Arc::new(work);
        wrappers
            .into_iter()
            .map(|wrapper| {
                let server = wrapper.server_id().to_string();
                let filter = self.filter.clone();
                let document = document.cloned();
                let work = Arc::clone(&work);
                let result = Pending::spawn(parent, async move {
                    run_on(&wrapper, &filter, document.as_ref(), work.as_ref()).await
                });
                ServerResult { server, result }
            })
            .collect()
    }
}

/// Runs `work` on one server: start, filter, open the document, request.
async fn run_on<F, Fut, R>(
    wrapper: &ServerWrapper,
    filter: &CapabilityFilter,
    document: Option<&DocumentSnapshot>,
    work: &F,
) -> Result<Option<R>>
where
    F: Fn(LanguageServer) -> Fut,
    Fut: Future<Output = Result<Option<R>>>,
{
    let server = wrapper.activate().await?;
    if !wrapper.matches(filter) {
        debug!(server = %wrapper.server_id(), "skipped by capability filter");
        return Ok(None);
    }
    if let Some(document) = document {
        wrapper.ensure_document(document).await?;
    }
    work(server).await
}

/// Merges per-server results in server order, omitting failures.
fn collect_all<R: Send + 'static>(
    token: CancellationToken,
    runs: Vec<ServerResult<R>>,
) -> Pending<Vec<R>> {
    Pending::with_token(token, async move {
        let total = runs.len();
        let outcomes = futures::future::join_all(
            runs.into_iter()
                .map(|run| async move { (run.server, run.result.await) }),
        )
        .await;

        let mut values = Vec::new();
        let mut failures = 0;
        let mut last_error = None;
        for (server, outcome) in outcomes {
            match outcome {
                Ok(Some(value)) => values.push(value),
                Ok(None) => {}
                Err(e) => {
                    warn!(server, "request failed: {e}");
                    failures += 1;
                    last_error = Some(e);
                }
            }
        }

        match last_error {
            Some(e) if failures == total => Err(e),
            _ => Ok(values),
        }
    })
}

/// Returns the first non-empty answer and cancels the others.
fn compute_first<R: Send + 'static>(
    token: CancellationToken,
    runs: Vec<ServerResult<R>>,
) -> Pending<Option<R>> {
    Pending::with_token(token, async move {
        let total = runs.len();
        let mut racing: FuturesUnordered<_> = runs
            .into_iter()
            .map(|run| async move { (run.server, run.result.await) })
            .collect();

        let mut failures = 0;
        let mut last_error = None;
        while let Some((server, outcome)) = racing.next().await {
            match outcome {
                Ok(Some(value)) => {
                    debug!(server, "first result");
                    return Ok(Some(value));
                }
                Ok(None) => {}
                Err(e) if e.is_request_cancelled() => {
                    debug!(server, "request cancelled by server");
                }
                Err(e) => {
                    warn!(server, "request failed: {e}");
                    failures += 1;
                    last_error = Some(e);
                }
            }
        }

        match last_error {
            Some(e) if failures == total => Err(e),
            _ => Ok(None),
        }
    })
}

/// Runs work on the servers that handle one document.
///
/// The document is opened on each server before the work runs.
#[derive(Debug, Clone)]
pub struct DocumentExecutor {
    servers: Arc<LanguageServers>,
    document: DocumentSnapshot,
    plan: Plan,
}

impl DocumentExecutor {
    pub(crate) fn new(servers: Arc<LanguageServers>, document: DocumentSnapshot) -> Self {
        let plan = Plan::new(&servers);
        Self {
            servers,
            document,
            plan,
        }
    }

    /// Only servers advertising `capability`.
    #[must_use]
    pub fn with_capability(mut self, capability: Capability) -> Self {
        self.plan.filter = CapabilityFilter::Capability(capability);
        self
    }

    /// Only servers passing `filter`.
    #[must_use]
    pub fn with_filter(mut self, filter: CapabilityFilter) -> Self {
        self.plan.filter = filter;
        self
    }

    /// Cancels all work from this executor when `token` is cancelled.
    #[must_use]
    pub fn with_cancellation(mut self, token: &CancellationToken) -> Self {
        self.plan.token = token.child_token();
        self
    }

    /// The document this executor targets.
    #[must_use]
    pub const fn document(&self) -> &DocumentSnapshot {
        &self.document
    }

    /// The wrappers the work would be sent to, before capability filtering.
    #[must_use]
    pub fn wrappers(&self) -> Vec<ServerWrapper> {
        self.servers.wrappers_for_document(&self.document)
    }

    fn runs<F, Fut, R>(&self, parent: &CancellationToken, work: F) -> Vec<ServerResult<R>>
    where
        F: Fn(LanguageServer) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Option<R>>> + Send + 'static,
        R: Send + 'static,
    {
        self.plan
            .dispatch(self.wrappers(), Some(&self.document), parent, work)
    }

    /// Runs `work` on every server and returns the non-empty results in server order.
    ///
    /// Failing servers are logged and omitted. The aggregate fails only
    /// when every server failed; no matching server yields an empty list.
    pub fn collect_all<F, Fut, R>(&self, work: F) -> Pending<Vec<R>>
    where
        F: Fn(LanguageServer) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Option<R>>> + Send + 'static,
        R: Send + 'static,
    {
        let token = self.plan.token.child_token();
        let runs = self.runs(&token, work);
        collect_all(token, runs)
    }

    /// Races every server and returns the first non-empty result.
    ///
    /// The remaining requests are cancelled once a winner is found.
    /// Servers answering "request cancelled" do not count as failures.
    pub fn compute_first<F, Fut, R>(&self, work: F) -> Pending<Option<R>>
    where
        F: Fn(LanguageServer) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Option<R>>> + Send + 'static,
        R: Send + 'static,
    {
        let token = self.plan.token.child_token();
        let runs = self.runs(&token, work);
        compute_first(token, runs)
    }

    /// Runs `work` on every server and returns one handle per server.
    pub fn compute_all<F, Fut, R>(&self, work: F) -> Vec<ServerResult<R>>
    where
        F: Fn(LanguageServer) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Option<R>>> + Send + 'static,
        R: Send + 'static,
    {
        self.runs(&self.plan.token, work)
    }
}

/// Runs work on the servers already bound to one project root.
#[derive(Debug, Clone)]
pub struct ProjectExecutor {
    servers: Arc<LanguageServers>,
    root: PathBuf,
    exclude_inactive: bool,
    plan: Plan,
}

impl ProjectExecutor {
    pub(crate) fn new(servers: Arc<LanguageServers>, root: PathBuf) -> Self {
        let plan = Plan::new(&servers);
        Self {
            servers,
            root,
            exclude_inactive: false,
            plan,
        }
    }

    /// Only servers advertising `capability`.
    #[must_use]
    pub fn with_capability(mut self, capability: Capability) -> Self {
        self.plan.filter = CapabilityFilter::Capability(capability);
        self
    }

    /// Only servers passing `filter`.
    #[must_use]
    pub fn with_filter(mut self, filter: CapabilityFilter) -> Self {
        self.plan.filter = filter;
        self
    }

    /// Cancels all work from this executor when `token` is cancelled.
    #[must_use]
    pub fn with_cancellation(mut self, token: &CancellationToken) -> Self {
        self.plan.token = token.child_token();
        self
    }

    /// Skip servers without a live process instead of restarting them.
    #[must_use]
    pub const fn exclude_inactive(mut self) -> Self {
        self.exclude_inactive = true;
        self
    }

    /// The project root this executor targets.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// The wrappers the work would be sent to, before capability filtering.
    #[must_use]
    pub fn wrappers(&self) -> Vec<ServerWrapper> {
        self.servers
            .project_wrappers(&self.root, self.exclude_inactive)
    }

    fn runs<F, Fut, R>(&self, parent: &CancellationToken, work: F) -> Vec<ServerResult<R>>
    where
        F: Fn(LanguageServer) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Option<R>>> + Send + 'static,
        R: Send + 'static,
    {
        self.plan.dispatch(self.wrappers(), None, parent, work)
    }

    /// Runs `work` on every server and returns the non-empty results in server order.
    ///
    /// See [`DocumentExecutor::collect_all`].
    pub fn collect_all<F, Fut, R>(&self, work: F) -> Pending<Vec<R>>
    where
        F: Fn(LanguageServer) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Option<R>>> + Send + 'static,
        R: Send + 'static,
    {
        let token = self.plan.token.child_token();
        let runs = self.runs(&token, work);
        collect_all(token, runs)
    }

    /// Races every server and returns the first non-empty result.
    pub fn compute_first<F, Fut, R>(&self, work: F) -> Pending<Option<R>>
    where
        F: Fn(LanguageServer) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Option<R>>> + Send + 'static,
        R: Send + 'static,
    {
        let token = self.plan.token.child_token();
        let runs = self.runs(&token, work);
        compute_first(token, runs)
    }

    /// Runs `work` on every server and returns one handle per server.
    pub fn compute_all<F, Fut, R>(&self, work: F) -> Vec<ServerResult<R>>
    where
        F: Fn(LanguageServer) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Option<R>>> + Send + 'static,
        R: Send + 'static,
    {
        self.runs(&self.plan.token, work)
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
    use crate::error::Error;

    fn run<R: Send + 'static>(server: &str, outcome: Result<Option<R>>) -> ServerResult<R> {
        ServerResult {
            server: server.to_string(),
            result: Pending::ready(outcome),
        }
    }

    fn failed(message: &str) -> Error {
        Error::Response {
            code: -32603,
            message: message.to_string(),
            data: None,
        }
    }

    #[tokio::test]
    async fn test_collect_all_keeps_order_and_skips_failures() {
        let runs = vec![
            run("a", Ok(Some(1))),
            run("b", Err(failed("boom"))),
            run("c", Ok(None)),
            run("d", Ok(Some(4))),
        ];
        let values = collect_all(CancellationToken::new(), runs).await.unwrap();
        assert_eq!(values, [1, 4]);
    }

    #[tokio::test]
    async fn test_collect_all_fails_only_when_all_fail() {
        let runs = vec![run::<i32>("a", Err(failed("one"))), run("b", Err(failed("two")))];
        let err = collect_all(CancellationToken::new(), runs).await.unwrap_err();
        assert!(err.to_string().contains("two"));

        let none: Vec<ServerResult<i32>> = Vec::new();
        assert!(collect_all(CancellationToken::new(), none).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_compute_first_ignores_cancelled_and_empty() {
        let cancelled = Error::Response {
            code: crate::lsp::protocol::REQUEST_CANCELLED,
            message: "cancelled".to_string(),
            data: None,
        };
        let runs = vec![run::<i32>("a", Err(cancelled)), run("b", Ok(None))];
        assert_eq!(compute_first(CancellationToken::new(), runs).await.unwrap(), None);

        let runs = vec![run("a", Err(failed("x"))), run("b", Ok(Some(7)))];
        assert_eq!(compute_first(CancellationToken::new(), runs).await.unwrap(), Some(7));

        let runs = vec![run::<i32>("a", Err(failed("x")))];
        assert!(compute_first(CancellationToken::new(), runs).await.is_err());
    }

    #[tokio::test]
    async fn test_cancel_aggregate_cancels_children() {
        let token = CancellationToken::new();
        let child = Pending::spawn(&token, std::future::pending::<Result<Option<i32>>>());
        let child_token = child.cancellation_token();
        let aggregate = collect_all(
            token,
            vec![ServerResult {
                server: "slow".to_string(),
                result: child,
            }],
        );
        aggregate.cancel();
        assert!(child_token.is_cancelled());
        assert!(matches!(aggregate.await, Err(Error::Cancelled)));
    }
}
