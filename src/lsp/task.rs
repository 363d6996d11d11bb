// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (C) 2026 Mark Wells <contact@markwells.dev>

//! Cancellable handles for spawned work.

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};

/// A spawned unit of work whose result can be awaited or cancelled.
///
/// The work starts running as soon as the handle is created. Cancelling it,
/// cancelling its parent token, or dropping the handle stops the work; a
/// cancelled handle always resolves to [`Error::Cancelled`], even if the
/// work had already produced a value.
#[must_use = "dropping a pending handle cancels the work"]
pub struct Pending<T> {
    handle: JoinHandle<Result<T>>,
    token: CancellationToken,
}

impl<T: Send + 'static> Pending<T> {
    /// Spawns `work`, cancelled when `parent` is cancelled.
    pub fn spawn<F>(parent: &CancellationToken, work: F) -> Self
    where
        F: Future<Output = Result<T>> + Send + 'static,
    {
        Self::with_token(parent.child_token(), work)
    }

    /// Spawns `work`, cancelled through `token` itself.
    ///
    /// Used when other work is already parented on `token` and must stop
    /// together with this handle.
    pub fn with_token<F>(token: CancellationToken, work: F) -> Self
    where
        F: Future<Output = Result<T>> + Send + 'static,
    {
        let cancelled = token.clone();
        let handle = tokio::spawn(async move {
            tokio::select! {
                biased;
                () = cancelled.cancelled() => Err(Error::Cancelled),
                result = work => result,
            }
        });
        Self { handle, token }
    }

    /// A handle that is already complete.
    pub fn ready(value: Result<T>) -> Self {
        Self::spawn(&CancellationToken::new(), async move { value })
    }
}

impl<T> Pending<T> {
    /// Stops the work. Idempotent.
    pub fn cancel(&self) {
        self.token.cancel();
    }

    /// Returns true once [`cancel`](Self::cancel) was called or the parent was cancelled.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Returns true if the work has finished (successfully or not).
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Token that cancels this work.
    #[must_use]
    pub fn cancellation_token(&self) -> CancellationToken {
        self.token.clone()
    }
}

impl<T> std::fmt::Debug for Pending<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pending")
            .field("cancelled", &self.is_cancelled())
            .field("finished", &self.is_finished())
            .finish()
    }
}

impl<T> Future for Pending<T> {
    type Output = Result<T>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        if this.token.is_cancelled() {
            return Poll::Ready(Err(Error::Cancelled));
        }
        match Pin::new(&mut this.handle).poll(cx) {
            Poll::Ready(Ok(result)) => {
                if this.token.is_cancelled() {
                    return Poll::Ready(Err(Error::Cancelled));
                }
                Poll::Ready(result)
            }
            Poll::Ready(Err(e)) if e.is_cancelled() => Poll::Ready(Err(Error::Cancelled)),
            Poll::Ready(Err(e)) => Poll::Ready(Err(Error::Internal(format!("task failed: {e}")))),
            Poll::Pending => Poll::Pending,
        }
    }
}

impl<T> Drop for Pending<T> {
    fn drop(&mut self) {
        self.token.cancel();
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
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn test_completes_with_value() {
        let pending = Pending::spawn(&CancellationToken::new(), async { Ok(42) });
        assert_eq!(pending.await.unwrap(), 42);
    }

    #[tokio::test]
    async fn test_cancel_is_idempotent_and_wins() {
        let pending = Pending::spawn(&CancellationToken::new(), async {
            tokio::time::sleep(Duration::from_secs(10)).await;
            Ok(1)
        });
        pending.cancel();
        pending.cancel();
        assert!(matches!(pending.await, Err(Error::Cancelled)));
    }

    #[tokio::test]
    async fn test_cancel_after_completion_hides_result() {
        let pending = Pending::spawn(&CancellationToken::new(), async { Ok("done") });
        while !pending.is_finished() {
            tokio::task::yield_now().await;
        }
        pending.cancel();
        assert!(matches!(pending.await, Err(Error::Cancelled)));
    }

    #[tokio::test]
    async fn test_parent_cancellation_propagates() {
        let parent = CancellationToken::new();
        let pending = Pending::spawn(&parent, std::future::pending::<Result<()>>());
        parent.cancel();
        assert!(pending.is_cancelled());
        assert!(matches!(pending.await, Err(Error::Cancelled)));
    }

    #[tokio::test]
    async fn test_shared_token_cancels_children() {
        let token = CancellationToken::new();
        let child = Pending::spawn(&token, std::future::pending::<Result<()>>());
        let aggregate = Pending::with_token(token, async { Ok(()) });
        aggregate.cancel();
        assert!(child.is_cancelled());
        assert!(matches!(child.await, Err(Error::Cancelled)));
    }

    #[tokio::test]
    async fn test_drop_stops_work() {
        struct SetOnDrop(Arc<AtomicBool>);
        impl Drop for SetOnDrop {
            fn drop(&mut self) {
                self.0.store(true, Ordering::SeqCst);
            }
        }

        let dropped = Arc::new(AtomicBool::new(false));
        let guard = SetOnDrop(Arc::clone(&dropped));
        let pending = Pending::spawn(&CancellationToken::new(), async move {
            let _guard = guard;
            std::future::pending::<Result<()>>().await
        });
        tokio::task::yield_now().await;
        drop(pending);

        for _ in 0..100 {
            if dropped.load(Ordering::SeqCst) {
                return;
            }
            tokio::task::yield_now().await;
        }
        assert!(dropped.load(Ordering::SeqCst), "work was not stopped");
    }
}
