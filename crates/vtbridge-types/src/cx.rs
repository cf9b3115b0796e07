//! Statement context (`Cx`) threaded through every effectful callback.
//!
//! The protocol has no cancellation channel of its own. The engine's
//! statement-interrupt flag lives here, and long-running modules poll it
//! cooperatively through [`Cx::checkpoint`].

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use vtbridge_error::{BridgeError, Result};

#[derive(Debug, Default)]
struct CxInner {
    interrupted: AtomicBool,
    checkpoints: AtomicU64,
    last_checkpoint_msg: Mutex<Option<String>>,
}

/// Cloneable handle to one statement's interrupt state.
///
/// Clones share state, so the thread driving the statement and the thread
/// requesting the interrupt see the same flag.
#[derive(Debug, Clone, Default)]
pub struct Cx {
    inner: Arc<CxInner>,
}

impl Cx {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Request that the statement stop at its next checkpoint.
    pub fn interrupt(&self) {
        self.inner.interrupted.store(true, Ordering::Release);
    }

    /// Clear a previous interrupt so the context can drive a new statement.
    pub fn reset(&self) {
        self.inner.interrupted.store(false, Ordering::Release);
    }

    #[must_use]
    pub fn is_interrupted(&self) -> bool {
        self.inner.interrupted.load(Ordering::Acquire)
    }

    /// Yield point: `Err(Interrupt)` once an interrupt was requested.
    pub fn checkpoint(&self) -> Result<()> {
        self.inner.checkpoints.fetch_add(1, Ordering::Relaxed);
        if self.is_interrupted() {
            return Err(BridgeError::Interrupt);
        }
        Ok(())
    }

    /// Checkpoint and record a progress message.
    pub fn checkpoint_with(&self, msg: impl Into<String>) -> Result<()> {
        *self
            .inner
            .last_checkpoint_msg
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(msg.into());
        self.checkpoint()
    }

    #[must_use]
    pub fn last_checkpoint_message(&self) -> Option<String> {
        self.inner
            .last_checkpoint_msg
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Number of checkpoints polled so far.
    #[must_use]
    pub fn checkpoint_count(&self) -> u64 {
        self.inner.checkpoints.load(Ordering::Relaxed)
    }
}
