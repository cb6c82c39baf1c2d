//! Cancellation and deadlines for fetch operations.
//!
//! Every fetch takes a [`FetchContext`]. Backends wrap their I/O in [`FetchContext::run`]
//! so that a cancelled context or an expired deadline aborts the in-flight request and
//! returns promptly, instead of relying on the caller dropping the whole future (which
//! would also drop any partial results already gathered).

use std::{future::Future, time::Duration};

use thiserror::Error;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ContextError {
    #[error("fetch cancelled")]
    Cancelled,
    #[error("fetch deadline exceeded")]
    DeadlineExceeded,
}

#[derive(Debug, Clone, Default)]
pub struct FetchContext {
    cancel: CancellationToken,
    deadline: Option<Instant>,
}

impl FetchContext {
    /// A context that is never cancelled and has no deadline.
    pub fn background() -> Self {
        Self::default()
    }

    pub fn with_timeout(timeout: Duration) -> Self {
        Self { cancel: CancellationToken::new(), deadline: Some(Instant::now() + timeout) }
    }

    pub fn with_cancellation(cancel: CancellationToken) -> Self {
        Self { cancel, deadline: None }
    }

    /// A context cancelled together with `self`, whose deadline is the earliest of
    /// `self`'s and `now + timeout`.
    pub fn child_with_timeout(&self, timeout: Duration) -> Self {
        let deadline = Instant::now() + timeout;
        let deadline = match self.deadline {
            Some(parent) if parent < deadline => parent,
            _ => deadline,
        };
        Self { cancel: self.cancel.child_token(), deadline: Some(deadline) }
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// `Err` if the context is already cancelled or past its deadline.
    pub fn check(&self) -> Result<(), ContextError> {
        if self.cancel.is_cancelled() {
            return Err(ContextError::Cancelled);
        }
        match self.deadline {
            Some(deadline) if deadline <= Instant::now() => {
                Err(ContextError::DeadlineExceeded)
            }
            _ => Ok(()),
        }
    }

    /// Drives `fut` to completion unless the context is cancelled or times out first,
    /// in which case `fut` is dropped.
    pub async fn run<F: Future>(&self, fut: F) -> Result<F::Output, ContextError> {
        self.check()?;
        let deadline = async {
            match self.deadline {
                Some(deadline) => tokio::time::sleep_until(deadline).await,
                None => std::future::pending::<()>().await,
            }
        };
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(ContextError::Cancelled),
            _ = deadline => Err(ContextError::DeadlineExceeded),
            output = fut => Ok(output),
        }
    }
}
