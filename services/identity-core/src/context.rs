use std::future::Future;
use std::time::Duration;

use thiserror::Error;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Why a suspended backend call was abandoned.
#[derive(Debug, Clone, Copy, Error, PartialEq, Eq)]
pub enum Interrupted {
    #[error("request deadline exceeded during {0}")]
    DeadlineExceeded(&'static str),
    #[error("request cancelled during {0}")]
    Cancelled(&'static str),
}

/// Deadline and cancellation signal propagated from the originating request.
///
/// Every repository and cache call made on behalf of a request runs through
/// [`RequestContext::run`], so an elapsed deadline or a cancelled request
/// stops the workflow before the next backend round-trip.
#[derive(Debug, Clone, Default)]
pub struct RequestContext {
    deadline: Option<Instant>,
    cancellation: CancellationToken,
}

impl RequestContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_timeout(timeout: Duration) -> Self {
        Self::new().deadline_at(Instant::now() + timeout)
    }

    pub fn deadline_at(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancellation = token;
        self
    }

    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancellation
    }

    pub async fn run<F>(&self, operation: &'static str, fut: F) -> Result<F::Output, Interrupted>
    where
        F: Future,
    {
        if self.cancellation.is_cancelled() {
            return Err(Interrupted::Cancelled(operation));
        }
        if self.deadline.is_some_and(|deadline| deadline <= Instant::now()) {
            return Err(Interrupted::DeadlineExceeded(operation));
        }

        let deadline = async {
            match self.deadline {
                Some(deadline) => tokio::time::sleep_until(deadline).await,
                None => std::future::pending::<()>().await,
            }
        };

        tokio::select! {
            biased;
            _ = self.cancellation.cancelled() => Err(Interrupted::Cancelled(operation)),
            _ = deadline => Err(Interrupted::DeadlineExceeded(operation)),
            output = fut => Ok(output),
        }
    }
}
