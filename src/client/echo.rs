//! Local echo suppression
//!
//! A remote mutation applied to the local model fires the model's change
//! listener just like a user edit would. The listener asks the suppressor
//! whether a remote apply is in progress and, if so, does not publish.
//!
//! Suppression is a depth counter rather than a flag so nested or
//! back-to-back remote applies cannot clear each other's scope. The scope
//! covers only the synchronous apply call; it is released by a guard even if
//! the apply panics.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Shared handle; clone it into the model's change listener.
#[derive(Debug, Clone, Default)]
pub struct EchoSuppressor {
    depth: Arc<AtomicUsize>,
}

impl EchoSuppressor {
    pub fn new() -> Self {
        Self::default()
    }

    /// True while any remote apply scope is open.
    pub fn is_suppressing(&self) -> bool {
        self.depth.load(Ordering::Acquire) > 0
    }

    pub fn depth(&self) -> usize {
        self.depth.load(Ordering::Acquire)
    }

    /// Open a suppression scope that lasts until the guard is dropped.
    pub fn suppress(&self) -> SuppressionGuard {
        self.depth.fetch_add(1, Ordering::AcqRel);
        SuppressionGuard {
            depth: Arc::clone(&self.depth),
        }
    }

    /// Run `apply` with suppression on, returning its result.
    pub fn apply_remote<T>(&self, apply: impl FnOnce() -> T) -> T {
        let _guard = self.suppress();
        apply()
    }
}

#[must_use = "suppression ends when the guard is dropped"]
#[derive(Debug)]
pub struct SuppressionGuard {
    depth: Arc<AtomicUsize>,
}

impl Drop for SuppressionGuard {
    fn drop(&mut self) {
        self.depth.fetch_sub(1, Ordering::AcqRel);
    }
}
