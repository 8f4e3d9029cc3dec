//! Global cap on simultaneous pipeline executions.

use std::sync::Arc;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::error::GatewayError;

/// Counting permit pool shared by the worker pool and the streaming path.
///
/// A permit is returned to the pool when the [`OwnedSemaphorePermit`] is
/// dropped, so every exit path of the holder releases it.
#[derive(Debug, Clone)]
pub struct ConcurrencyLimiter {
    semaphore: Arc<Semaphore>,
    capacity: usize,
}

impl ConcurrencyLimiter {
    pub fn new(capacity: usize) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(capacity)),
            capacity,
        }
    }

    /// Wait until a permit is free.
    pub async fn acquire(&self) -> Result<OwnedSemaphorePermit, GatewayError> {
        self.semaphore
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| GatewayError::Internal("concurrency limiter closed".to_string()))
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Permits currently free.
    pub fn available(&self) -> usize {
        self.semaphore.available_permits()
    }

    /// Permits currently held.
    pub fn in_use(&self) -> usize {
        self.capacity.saturating_sub(self.available())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use rand::Rng;

    #[tokio::test]
    async fn test_in_flight_never_exceeds_capacity() {
        let limiter = ConcurrencyLimiter::new(3);
        let in_flight = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..20)
            .map(|i| {
                let limiter = limiter.clone();
                let in_flight = in_flight.clone();
                let peak = peak.clone();
                tokio::spawn(async move {
                    let _permit = limiter.acquire().await.unwrap();
                    let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(2 + (i % 3) as u64)).await;
                    in_flight.fetch_sub(1, Ordering::SeqCst);
                })
            })
            .collect();

        for handle in handles {
            handle.await.unwrap();
        }

        assert!(peak.load(Ordering::SeqCst) <= 3);
        assert_eq!(limiter.available(), 3);
    }

    #[tokio::test]
    async fn test_no_permit_leak_under_random_failures() {
        let limiter = ConcurrencyLimiter::new(15);
        let acquired = Arc::new(AtomicUsize::new(0));
        let released = Arc::new(AtomicUsize::new(0));

        async fn flaky_run(fail: bool) -> Result<(), &'static str> {
            tokio::task::yield_now().await;
            if fail {
                Err("pipeline failed")
            } else {
                Ok(())
            }
        }

        let handles: Vec<_> = (0..1000)
            .map(|_| {
                let limiter = limiter.clone();
                let acquired = acquired.clone();
                let released = released.clone();
                let fail = rand::thread_rng().gen_bool(0.3);
                tokio::spawn(async move {
                    let permit = limiter.acquire().await.unwrap();
                    acquired.fetch_add(1, Ordering::SeqCst);
                    let _ = flaky_run(fail).await;
                    drop(permit);
                    released.fetch_add(1, Ordering::SeqCst);
                })
            })
            .collect();

        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(acquired.load(Ordering::SeqCst), 1000);
        assert_eq!(released.load(Ordering::SeqCst), 1000);
        assert_eq!(limiter.available(), 15);
        assert_eq!(limiter.in_use(), 0);
    }

    #[tokio::test]
    async fn test_cancelled_waiter_and_holder_release() {
        let limiter = ConcurrencyLimiter::new(1);
        let held = limiter.acquire().await.unwrap();

        let waiter = {
            let limiter = limiter.clone();
            tokio::spawn(async move {
                let _permit = limiter.acquire().await.unwrap();
                tokio::time::sleep(Duration::from_secs(60)).await;
            })
        };

        drop(held);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(limiter.available(), 0);

        waiter.abort();
        let _ = waiter.await;
        assert_eq!(limiter.available(), 1);
    }
}
