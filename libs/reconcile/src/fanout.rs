//! Bounded fan-out of remote operations with fail-fast cancellation.
//!
//! Every work item becomes one future that first takes a [`Limiter`] token and
//! then checks a shared cancellation signal. The first failing operation
//! raises the signal: items that have not issued their remote call yet are
//! skipped, while calls already in flight run to completion. All outcomes are
//! collected before [`fan_out`] returns, so no token and no remote call is
//! left unaccounted for.

use std::fmt;
use std::future::Future;

use futures_util::stream::{FuturesUnordered, StreamExt};
use tokio::sync::watch;
use tracing::debug;

use crate::limiter::Limiter;

/// Collected outcome of a fan-out.
#[derive(Debug)]
pub struct FanOut<T, E> {
    /// Results of operations that succeeded, in completion order.
    pub succeeded: Vec<T>,

    /// Errors of operations that failed, in completion order.
    pub failed: Vec<E>,

    /// Items that never issued their remote call because of an earlier failure.
    pub skipped: usize,
}

impl<T, E> FanOut<T, E> {
    /// True when no operation failed and none was skipped.
    pub fn is_success(&self) -> bool {
        self.failed.is_empty() && self.skipped == 0
    }

    /// Turn the report into a result carrying the first failure.
    pub fn into_result(self) -> Result<Vec<T>, FanOutError<E>> {
        let succeeded = self.succeeded.len();
        let mut failed = self.failed.into_iter();
        match failed.next() {
            None if self.skipped == 0 => Ok(self.succeeded),
            None => Err(FanOutError {
                first: None,
                additional_failures: 0,
                skipped: self.skipped,
                succeeded,
            }),
            Some(first) => Err(FanOutError {
                first: Some(first),
                additional_failures: failed.count(),
                skipped: self.skipped,
                succeeded,
            }),
        }
    }
}

/// A fan-out where at least one operation did not succeed.
#[derive(Debug)]
pub struct FanOutError<E> {
    first: Option<E>,
    additional_failures: usize,
    skipped: usize,
    succeeded: usize,
}

impl<E> FanOutError<E> {
    /// The first failure, in completion order.
    ///
    /// `None` only when items were skipped without any failure, which the
    /// fan-out itself never produces but a closed limiter could.
    pub fn first(&self) -> Option<&E> {
        self.first.as_ref()
    }

    /// Consume the error and return the first failure.
    pub fn into_first(self) -> Option<E> {
        self.first
    }

    /// Total number of failed operations.
    pub fn failures(&self) -> usize {
        self.additional_failures + usize::from(self.first.is_some())
    }

    /// Number of items skipped after the first failure.
    pub fn skipped(&self) -> usize {
        self.skipped
    }

    /// Number of operations that completed successfully.
    pub fn succeeded(&self) -> usize {
        self.succeeded
    }
}

impl<E: fmt::Display> fmt::Display for FanOutError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.first {
            Some(first) => write!(f, "{first}")?,
            None => write!(f, "operations were cancelled")?,
        }
        if self.additional_failures > 0 {
            write!(f, " (and {} more failure(s))", self.additional_failures)?;
        }
        Ok(())
    }
}

impl<E> std::error::Error for FanOutError<E>
where
    E: std::error::Error + 'static,
{
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.first.as_ref().map(|e| e as &(dyn std::error::Error + 'static))
    }
}

enum Outcome<T, E> {
    Succeeded(T),
    Failed(E),
    Skipped,
}

/// Run `op` once per item, at most `limiter.capacity()` at a time.
pub async fn fan_out<I, F, Fut, T, E>(limiter: &Limiter, items: I, op: F) -> FanOut<T, E>
where
    I: IntoIterator,
    F: Fn(I::Item) -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let (cancel_tx, cancel_rx) = watch::channel(false);
    let cancel_tx = &cancel_tx;
    let op = &op;

    let mut pending: FuturesUnordered<_> = items
        .into_iter()
        .map(|item| {
            let cancel_rx = cancel_rx.clone();
            async move {
                let Ok(_token) = limiter.acquire().await else {
                    return Outcome::Skipped;
                };
                if *cancel_rx.borrow() {
                    return Outcome::Skipped;
                }
                match op(item).await {
                    Ok(value) => Outcome::Succeeded(value),
                    Err(e) => {
                        cancel_tx.send_replace(true);
                        Outcome::Failed(e)
                    }
                }
            }
        })
        .collect();

    let mut report = FanOut {
        succeeded: Vec::new(),
        failed: Vec::new(),
        skipped: 0,
    };

    while let Some(outcome) = pending.next().await {
        match outcome {
            Outcome::Succeeded(value) => report.succeeded.push(value),
            Outcome::Failed(e) => report.failed.push(e),
            Outcome::Skipped => report.skipped += 1,
        }
    }

    debug!(
        succeeded = report.succeeded.len(),
        failed = report.failed.len(),
        skipped = report.skipped,
        "Fan-out complete"
    );

    report
}
