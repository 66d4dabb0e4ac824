//! Bounded concurrency for remote operations.
//!
//! A [`Limiter`] is a counting semaphore sized at construction. Callers
//! acquire a [`Token`] before issuing a backend call; dropping the token
//! returns it to the pool, so a token is released on every exit path of the
//! guarded operation, including errors and unwinding.
//!
//! Each reconciliation pass builds its own limiter. Tokens are never shared
//! across passes or resources.

use tokio::sync::{Semaphore, SemaphorePermit};

pub use tokio::sync::AcquireError;

/// Default number of simultaneous backend operations per pass.
pub const DEFAULT_CONCURRENCY: usize = 3;

/// Counting-semaphore token pool.
#[derive(Debug)]
pub struct Limiter {
    semaphore: Semaphore,
    capacity: usize,
}

/// A held concurrency token. Released on drop.
#[derive(Debug)]
pub struct Token<'a> {
    _permit: SemaphorePermit<'a>,
}

impl Limiter {
    /// Create a limiter with `capacity` tokens. A capacity of zero is raised
    /// to one so that acquirers can always make progress.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            semaphore: Semaphore::new(capacity),
            capacity,
        }
    }

    /// Wait until a token is available and take it.
    ///
    /// Waiters are served in FIFO order by the underlying semaphore, which
    /// gives every acquirer a bounded wait while tokens keep being returned.
    /// The only error is a closed pool, which never happens for a limiter
    /// that is still alive.
    pub async fn acquire(&self) -> Result<Token<'_>, AcquireError> {
        let permit = self.semaphore.acquire().await?;
        Ok(Token { _permit: permit })
    }

    /// Take a token if one is free right now.
    pub fn try_acquire(&self) -> Option<Token<'_>> {
        self.semaphore
            .try_acquire()
            .ok()
            .map(|permit| Token { _permit: permit })
    }

    /// Number of tokens the pool was built with.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of tokens currently free.
    pub fn available(&self) -> usize {
        self.semaphore.available_permits()
    }
}

impl Default for Limiter {
    fn default() -> Self {
        Self::new(DEFAULT_CONCURRENCY)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    use rstest::rstest;

    use super::*;

    #[test]
    fn test_zero_capacity_is_raised() {
        let limiter = Limiter::new(0);
        assert_eq!(limiter.capacity(), 1);
        assert_eq!(limiter.available(), 1);
    }

    #[tokio::test]
    async fn test_token_released_on_drop() {
        let limiter = Limiter::new(2);

        let first = limiter.acquire().await.unwrap();
        let second = limiter.acquire().await.unwrap();
        assert_eq!(limiter.available(), 0);
        assert!(limiter.try_acquire().is_none());

        drop(first);
        assert_eq!(limiter.available(), 1);
        drop(second);
        assert_eq!(limiter.available(), 2);
    }

    #[tokio::test]
    async fn test_token_released_on_error_path() {
        let limiter = Limiter::new(1);

        async fn guarded(limiter: &Limiter) -> Result<(), &'static str> {
            let _token = limiter.acquire().await.map_err(|_| "closed")?;
            Err("backend refused")
        }

        assert!(guarded(&limiter).await.is_err());
        assert_eq!(limiter.available(), 1);
    }

    #[rstest]
    #[case(1, 10)]
    #[case(3, 20)]
    #[case(5, 5)]
    #[case(4, 64)]
    #[tokio::test]
    async fn test_never_exceeds_capacity(#[case] capacity: usize, #[case] workload: usize) {
        let limiter = Arc::new(Limiter::new(capacity));
        let in_flight = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let mut tasks = tokio::task::JoinSet::new();
        for _ in 0..workload {
            let limiter = Arc::clone(&limiter);
            let in_flight = Arc::clone(&in_flight);
            let peak = Arc::clone(&peak);
            tasks.spawn(async move {
                let _token = limiter.acquire().await.unwrap();
                let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(2)).await;
                in_flight.fetch_sub(1, Ordering::SeqCst);
            });
        }
        while let Some(joined) = tasks.join_next().await {
            joined.unwrap();
        }

        assert!(peak.load(Ordering::SeqCst) <= capacity);
        assert_eq!(limiter.available(), capacity);
    }

    #[tokio::test]
    async fn test_waiters_complete_under_load() {
        // Every acquirer finishes while tokens are continuously recycled.
        let limiter = Arc::new(Limiter::new(2));
        let done = Arc::new(AtomicUsize::new(0));

        let mut tasks = tokio::task::JoinSet::new();
        for _ in 0..200 {
            let limiter = Arc::clone(&limiter);
            let done = Arc::clone(&done);
            tasks.spawn(async move {
                let _token = limiter.acquire().await.unwrap();
                tokio::task::yield_now().await;
                done.fetch_add(1, Ordering::SeqCst);
            });
        }

        let drained = tokio::time::timeout(Duration::from_secs(10), async {
            while let Some(joined) = tasks.join_next().await {
                joined.unwrap();
            }
        })
        .await;

        assert!(drained.is_ok(), "an acquirer starved");
        assert_eq!(done.load(Ordering::SeqCst), 200);
    }
}
