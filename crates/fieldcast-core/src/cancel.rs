use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::Result;

use crate::failure::{failure, FailureCode};

/// Set from the process signal handler; async-signal-safe (single atomic
/// store, no allocation).
static TERMINATION_SIGNALLED: AtomicBool = AtomicBool::new(false);

/// Record an operator-sent termination signal. The only thing a signal
/// handler may do; every blocking step observes it through its token.
pub fn note_termination_signal() {
    TERMINATION_SIGNALLED.store(true, Ordering::SeqCst);
}

/// Cooperative cancellation handle threaded into every polling or blocking
/// step. While disarmed (rollback in progress) cancellation is ignored so
/// cleanup cannot be interrupted into a second rollback.
#[derive(Debug, Clone)]
pub struct CancelToken {
    inner: Arc<Inner>,
}

#[derive(Debug)]
struct Inner {
    cancelled: AtomicBool,
    armed: AtomicBool,
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

impl CancelToken {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                cancelled: AtomicBool::new(false),
                armed: AtomicBool::new(true),
            }),
        }
    }

    pub fn cancel(&self) {
        self.inner.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        if !self.inner.armed.load(Ordering::SeqCst) {
            return false;
        }
        self.inner.cancelled.load(Ordering::SeqCst) || TERMINATION_SIGNALLED.load(Ordering::SeqCst)
    }

    /// Fail with an `interrupted` error if cancellation was requested.
    pub fn check(&self, step: &str) -> Result<()> {
        if self.is_cancelled() {
            return Err(failure(
                FailureCode::Interrupted,
                format!("cancelled during {step}"),
            ));
        }
        Ok(())
    }

    /// Stop observing cancellation. Called at the top of rollback.
    pub fn disarm(&self) {
        self.inner.armed.store(false, Ordering::SeqCst);
    }

    pub fn rearm(&self) {
        self.inner.armed.store(true, Ordering::SeqCst);
    }
}
