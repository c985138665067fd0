//! Bounded worker pool.
//!
//! Submitted jobs run on tokio's blocking threads; at most `size` of them
//! run at a time, the others wait for a permit. Submission never blocks.

use crate::error::PoolError;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::runtime::Handle;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tracing::Instrument;

/// A fixed-size pool of blocking job slots.
pub struct WorkerPool {
    handle: Handle,
    permits: Arc<Semaphore>,
    size: usize,
    closed: AtomicBool,
}

impl WorkerPool {
    pub fn new(size: usize, handle: Handle) -> Self {
        let size = size.max(1);
        Self {
            handle,
            permits: Arc::new(Semaphore::new(size)),
            size,
            closed: AtomicBool::new(false),
        }
    }

    /// Creates a pool on the current tokio runtime.
    pub fn current(size: usize) -> Result<Self, PoolError> {
        let handle = Handle::try_current().map_err(|_| PoolError::NoRuntime)?;
        Ok(Self::new(size, handle))
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Number of free slots.
    pub fn available(&self) -> usize {
        self.permits.available_permits()
    }

    /// Queues `job`. The `tag` names the job in logs.
    pub fn spawn<F>(&self, tag: &str, job: F) -> Result<JoinHandle<()>, PoolError>
    where
        F: FnOnce() + Send + 'static,
    {
        self.spawn_or_else(tag, job, || {})
    }

    /// Queues `job`; `dropped` runs instead if the pool is closed before the
    /// job gets a slot.
    pub fn spawn_or_else<F, D>(
        &self,
        tag: &str,
        job: F,
        dropped: D,
    ) -> Result<JoinHandle<()>, PoolError>
    where
        F: FnOnce() + Send + 'static,
        D: FnOnce() + Send + 'static,
    {
        if self.closed.load(Ordering::SeqCst) {
            return Err(PoolError::Closed);
        }

        let permits = self.permits.clone();
        let span = tracing::info_span!("pool", tag = %tag);
        let tag = tag.to_string();

        let task = async move {
            let _permit = match permits.acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => {
                    tracing::warn!("Pool closed before {} could start", tag);
                    dropped();
                    return;
                }
            };
            let span = tracing::Span::current();
            let result = tokio::task::spawn_blocking(move || span.in_scope(job)).await;
            if let Err(e) = result {
                if e.is_panic() {
                    tracing::error!("Job {} panicked", tag);
                } else {
                    tracing::warn!("Job {} was cancelled", tag);
                }
            }
        };

        Ok(self.handle.spawn(task.instrument(span)))
    }

    /// Rejects further submissions. Queued jobs that have not started are
    /// dropped and their `dropped` callbacks run.
    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.permits.close();
            tracing::info!("Worker pool closed");
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_pool_bounds_concurrency() {
        let pool = WorkerPool::current(2).unwrap();
        assert_eq!(pool.size(), 2);

        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let mut handles = Vec::new();
        for i in 0..6 {
            let running = running.clone();
            let peak = peak.clone();
            handles.push(
                pool.spawn(&format!("job {}", i), move || {
                    let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    std::thread::sleep(Duration::from_millis(30));
                    running.fetch_sub(1, Ordering::SeqCst);
                })
                .unwrap(),
            );
        }
        for handle in handles {
            handle.await.unwrap();
        }
        assert!(peak.load(Ordering::SeqCst) <= 2);
        assert_eq!(pool.available(), 2);
    }

    #[tokio::test]
    async fn test_closed_pool_rejects() {
        let pool = WorkerPool::current(1).unwrap();
        pool.close();
        assert!(pool.is_closed());
        assert!(matches!(pool.spawn("late", || {}), Err(PoolError::Closed)));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_panicking_job_releases_slot() {
        let pool = WorkerPool::current(1).unwrap();
        pool.spawn("boom", || panic!("boom")).unwrap().await.unwrap();

        let done = Arc::new(AtomicBool::new(false));
        let flag = done.clone();
        pool.spawn("after", move || flag.store(true, Ordering::SeqCst))
            .unwrap()
            .await
            .unwrap();
        assert!(done.load(Ordering::SeqCst));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_close_runs_dropped_callback_of_queued_job() {
        let pool = WorkerPool::current(1).unwrap();
        let release = Arc::new(AtomicBool::new(false));
        let gate = release.clone();
        let first = pool
            .spawn("busy", move || {
                while !gate.load(Ordering::SeqCst) {
                    std::thread::sleep(Duration::from_millis(5));
                }
            })
            .unwrap();

        let ran = Arc::new(AtomicBool::new(false));
        let dropped = Arc::new(AtomicBool::new(false));
        let (ran_flag, dropped_flag) = (ran.clone(), dropped.clone());
        let queued = pool
            .spawn_or_else(
                "queued",
                move || ran_flag.store(true, Ordering::SeqCst),
                move || dropped_flag.store(true, Ordering::SeqCst),
            )
            .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        pool.close();
        queued.await.unwrap();
        release.store(true, Ordering::SeqCst);
        first.await.unwrap();

        assert!(dropped.load(Ordering::SeqCst));
        assert!(!ran.load(Ordering::SeqCst));
    }

    #[test]
    fn test_no_runtime() {
        assert!(matches!(WorkerPool::current(1), Err(PoolError::NoRuntime)));
    }
}
