//! Shutdown coordination shared by every worker.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// A cloneable signal for triggering graceful shutdown.
///
/// Multiple clones can trigger shutdown - only the first has effect,
/// subsequent calls are no-ops. Workers observe the flag at each wake;
/// termination of the pipeline itself travels in-band as `None` sentinels
/// on the channels, so a worker that is blocked on its input still exits
/// promptly.
#[derive(Debug, Clone, Default)]
pub struct ShutdownSignal {
    flag: Arc<AtomicBool>,
}

impl ShutdownSignal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Triggers graceful shutdown. Idempotent.
    pub fn shutdown(&self) {
        self.flag.store(true, Ordering::Release);
    }

    /// Returns `true` once shutdown has been initiated.
    #[inline]
    pub fn is_shutdown(&self) -> bool {
        self.flag.load(Ordering::Acquire)
    }
}
