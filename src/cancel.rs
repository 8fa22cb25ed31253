use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use crate::error::{Error, Result};

/// A cooperative cancellation handle threaded through registry calls and long copies.
///
/// There is no async runtime here — everything is synchronous — so cancellation can't
/// ride a `Future`'s drop glue; instead every suspension point
/// (before a network call, between chunks of a copy, between prune candidates) calls
/// `check()` and bails out with `Error::Cancelled` once the flag is set or the deadline has
/// passed.
#[derive(Debug, Clone)]
pub struct Context {
    cancelled: Arc<AtomicBool>,
    deadline: Option<Instant>,
}

impl Context {
    /// A context that never cancels and never times out.
    pub fn background() -> Context {
        Context {
            cancelled: Arc::new(AtomicBool::new(false)),
            deadline: None,
        }
    }

    pub fn with_deadline(deadline: Instant) -> Context {
        Context {
            cancelled: Arc::new(AtomicBool::new(false)),
            deadline: Some(deadline),
        }
    }

    /// A clone of this context that shares the same cancellation flag: calling `cancel()`
    /// on either handle cancels both.
    pub fn child(&self) -> Context {
        Context {
            cancelled: self.cancelled.clone(),
            deadline: self.deadline,
        }
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
            || self.deadline.is_some_and(|d| Instant::now() >= d)
    }

    pub fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            return Err(Error::Cancelled);
        }
        Ok(())
    }
}

impl Default for Context {
    fn default() -> Context {
        Context::background()
    }
}
