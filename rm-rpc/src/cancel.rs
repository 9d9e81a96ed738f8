//! A cooperative stand-in for `pthread_cancel` (§9 Design Notes,
//! "Exceptions / `longjmp` from pager"): the RPC bodies this crate runs
//! are plain Rust, so cancellation can't unwind a worker out from under
//! it the way the original's `pthread_cancel` does. Instead every
//! in-flight RPC is handed a token it is expected to poll at its own
//! suspension points.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Shared between the worker running an RPC body and whoever calls
/// `inhibit`/the cancellation RPC on it.
#[derive(Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        CancelToken(Arc::new(AtomicBool::new(false)))
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_canceled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    fn ptr_eq(&self, other: &CancelToken) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl PartialEq for CancelToken {
    fn eq(&self, other: &Self) -> bool {
        self.ptr_eq(other)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cancel_is_observed_through_clones() {
        let t = CancelToken::new();
        let clone = t.clone();
        assert!(!clone.is_canceled());
        t.cancel();
        assert!(clone.is_canceled());
    }
}
