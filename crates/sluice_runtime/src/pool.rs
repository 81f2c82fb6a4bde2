//! Bounded worker pool for blocking bodies.
//!
//! Blocking work runs on tokio's blocking threads; a semaphore caps how many
//! bodies run at once across every run sharing the pool.

use sluice_core::TaskError;
use std::any::Any;
use std::sync::Arc;
use tokio::sync::Semaphore;

/// Semaphore-gated access to blocking threads
#[derive(Debug, Clone)]
pub struct WorkerPool {
    permits: Arc<Semaphore>,
    size: usize,
}

impl WorkerPool {
    /// Create a pool running at most `size` bodies at once (minimum 1)
    #[must_use]
    pub fn new(size: usize) -> Self {
        let size = size.max(1);
        Self {
            permits: Arc::new(Semaphore::new(size)),
            size,
        }
    }

    /// Configured worker count
    #[must_use]
    pub fn size(&self) -> usize {
        self.size
    }

    /// Workers not currently running a body
    #[must_use]
    pub fn available(&self) -> usize {
        self.permits.available_permits()
    }

    /// Run `f` on a blocking thread once a worker is free.
    ///
    /// # Errors
    ///
    /// Returns a `TaskError` if `f` panics or the pool is shut down
    pub async fn run<F, R>(&self, f: F) -> Result<R, TaskError>
    where
        F: FnOnce() -> R + Send + 'static,
        R: Send + 'static,
    {
        let permit = Arc::clone(&self.permits)
            .acquire_owned()
            .await
            .map_err(|_| TaskError::new("worker pool is shut down"))?;

        tokio::task::spawn_blocking(move || {
            let _permit = permit;
            f()
        })
        .await
        .map_err(|err| {
            if err.is_panic() {
                TaskError::new(format!("task panicked: {}", panic_message(&*err.into_panic())))
            } else {
                TaskError::new("blocking worker was cancelled")
            }
        })
    }
}

impl Default for WorkerPool {
    fn default() -> Self {
        Self::new(default_workers())
    }
}

/// Available parallelism, or 4 when it cannot be determined
#[must_use]
pub fn default_workers() -> usize {
    std::thread::available_parallelism().map_or(4, std::num::NonZeroUsize::get)
}

/// Render a panic payload
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn test_run_returns_value() {
        let pool = WorkerPool::new(2);
        assert_eq!(pool.run(|| 6 * 7).await, Ok(42));
        assert_eq!(pool.available(), 2);
    }

    #[tokio::test]
    async fn test_panic_becomes_error() {
        let pool = WorkerPool::new(1);
        let err = pool
            .run(|| -> u32 { panic!("worker exploded") })
            .await
            .unwrap_err();
        assert_eq!(err.message(), "task panicked: worker exploded");
        // The permit is released even though the body panicked.
        assert_eq!(pool.available(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_pool_caps_concurrency() {
        let pool = WorkerPool::new(2);
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let jobs = (0..6).map(|_| {
            let pool = pool.clone();
            let running = Arc::clone(&running);
            let peak = Arc::clone(&peak);
            async move {
                pool.run(move || {
                    let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    std::thread::sleep(Duration::from_millis(20));
                    running.fetch_sub(1, Ordering::SeqCst);
                })
                .await
            }
        });
        for result in futures::future::join_all(jobs).await {
            result.unwrap();
        }
        assert!(peak.load(Ordering::SeqCst) <= 2);
    }

    #[test]
    fn test_minimum_size() {
        assert_eq!(WorkerPool::new(0).size(), 1);
        assert!(default_workers() >= 1);
    }
}
