//! Engine-wide exit request.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Set-once shutdown request shared by the engine, its workers and the
/// health checker. Never cleared.
#[derive(Debug, Clone, Default)]
pub struct ExitFlag(Arc<AtomicBool>);

impl ExitFlag {
    pub fn new() -> Self {
        Self::default()
    }

    /// Requests the exit. Returns true for the first request only.
    pub fn request(&self, reason: &str) -> bool {
        let first = !self.0.swap(true, Ordering::SeqCst);
        if first {
            tracing::error!("Exit requested: {}", reason);
        }
        first
    }

    pub fn is_requested(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_flag_is_set_once_and_shared() {
        let flag = ExitFlag::new();
        let shared = flag.clone();
        assert!(!shared.is_requested());

        assert!(flag.request("out of memory"));
        assert!(!shared.request("again"));
        assert!(shared.is_requested());
    }
}
