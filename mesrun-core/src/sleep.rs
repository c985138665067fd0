//! Cancellable sleeps.
//!
//! Worker code runs on blocking threads and uses [`sleep_blocking`]; the
//! scheduling loop is async and uses [`sleep`].

use crate::error::Cancelled;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

/// Granularity at which a blocking sleep observes cancellation.
const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Sleeps on the current thread, waking early with `Err(Cancelled)` if the
/// token is cancelled.
pub fn sleep_blocking(duration: Duration, cancel: &CancellationToken) -> Result<(), Cancelled> {
    sleep_blocking_with_exit(duration, cancel, || false)
}

/// Like [`sleep_blocking`], but also returns early (with `Ok`) once
/// `exit_requested` reports true.
pub fn sleep_blocking_with_exit<F>(
    duration: Duration,
    cancel: &CancellationToken,
    exit_requested: F,
) -> Result<(), Cancelled>
where
    F: Fn() -> bool,
{
    let deadline = Instant::now() + duration;
    loop {
        if cancel.is_cancelled() {
            return Err(Cancelled);
        }
        if exit_requested() {
            return Ok(());
        }
        let now = Instant::now();
        if now >= deadline {
            return Ok(());
        }
        std::thread::sleep((deadline - now).min(POLL_INTERVAL));
    }
}

/// Async sleep, waking early with `Err(Cancelled)` on cancellation.
pub async fn sleep(duration: Duration, cancel: &CancellationToken) -> Result<(), Cancelled> {
    if cancel.is_cancelled() {
        return Err(Cancelled);
    }
    tokio::select! {
        _ = cancel.cancelled() => Err(Cancelled),
        _ = tokio::time::sleep(duration) => Ok(()),
    }
}

/// Async sleep that also stops early once `exit_requested` reports true.
///
/// The flag is polled every [`POLL_INTERVAL`].
pub async fn sleep_with_exit<F>(
    duration: Duration,
    cancel: &CancellationToken,
    exit_requested: F,
) -> Result<(), Cancelled>
where
    F: Fn() -> bool,
{
    let deadline = tokio::time::Instant::now() + duration;
    loop {
        if cancel.is_cancelled() {
            return Err(Cancelled);
        }
        if exit_requested() {
            return Ok(());
        }
        let now = tokio::time::Instant::now();
        if now >= deadline {
            return Ok(());
        }
        let step = (deadline - now).min(POLL_INTERVAL);
        sleep(step, cancel).await?;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_blocking_sleep_completes() {
        let cancel = CancellationToken::new();
        let start = Instant::now();
        assert!(sleep_blocking(Duration::from_millis(20), &cancel).is_ok());
        assert!(start.elapsed() >= Duration::from_millis(20));
    }

    #[test]
    fn test_blocking_sleep_cancelled() {
        let cancel = CancellationToken::new();
        let c = cancel.clone();
        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(30));
            c.cancel();
        });
        let start = Instant::now();
        assert_eq!(sleep_blocking(Duration::from_secs(10), &cancel), Err(Cancelled));
        assert!(start.elapsed() < Duration::from_secs(5));
        handle.join().unwrap();
    }

    #[test]
    fn test_blocking_sleep_exit_flag() {
        let cancel = CancellationToken::new();
        let exit = AtomicBool::new(true);
        let start = Instant::now();
        assert!(sleep_blocking_with_exit(Duration::from_secs(10), &cancel, || exit
            .load(Ordering::SeqCst))
        .is_ok());
        assert!(start.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_async_sleep_cancelled() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        assert_eq!(sleep(Duration::from_secs(10), &cancel).await, Err(Cancelled));
    }

    #[tokio::test]
    async fn test_async_sleep_with_exit() {
        let cancel = CancellationToken::new();
        let exit = Arc::new(AtomicBool::new(false));
        let e = exit.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(30)).await;
            e.store(true, Ordering::SeqCst);
        });
        let start = std::time::Instant::now();
        sleep_with_exit(Duration::from_secs(10), &cancel, || exit.load(Ordering::SeqCst))
            .await
            .unwrap();
        assert!(start.elapsed() < Duration::from_secs(5));
    }
}
