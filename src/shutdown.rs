//! Process-wide shutdown signal shared between the distributor and sinks.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// Write-once flag raised when an orderly shutdown begins.
///
/// Clones share the same flag. Reconnect attempts read it to decide whether to
/// keep retrying; it is never reset.
#[derive(Debug, Clone, Default)]
pub struct ShutdownFlag(Arc<AtomicBool>);

impl ShutdownFlag {
    pub fn new() -> Self {
        Self::default()
    }

    /// Raise the flag. Returns `true` only for the call that raised it.
    pub fn trigger(&self) -> bool {
        !self.0.swap(true, Ordering::AcqRel)
    }

    pub fn is_set(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}
