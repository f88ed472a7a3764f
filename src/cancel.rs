//! Cooperative cancellation shared between a suite, its trials and the
//! cache purger.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Cloneable handle to a one-way cancellation flag.
///
/// Every clone observes the same flag. Once cancelled a token stays
/// cancelled; a suite that needs to run again installs a fresh token.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    flag: Arc<AtomicBool>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation. Idempotent and safe to call from any thread.
    pub fn cancel(&self) {
        self.flag.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::Acquire)
    }

    /// Predicate form of [`is_cancelled`](Self::is_cancelled), for
    /// collaborators that only accept a closure.
    pub fn as_predicate(&self) -> impl Fn() -> bool + Send + Sync + 'static {
        let flag = Arc::clone(&self.flag);
        move || flag.load(Ordering::Acquire)
    }
}
