//! Cooperative cancellation token.
//!
//! A token can derive children that also observe their parents, so "user
//! stop OR watchdog alarm" collapses into a single token downstream code
//! checks without knowing how many triggers feed it.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

#[derive(Debug)]
struct StopInner {
    flag: AtomicBool,
    parents: Vec<StopToken>,
}

/// Observable stop signal shared across a batch.
#[derive(Debug, Clone)]
pub struct StopToken {
    inner: Arc<StopInner>,
}

impl StopToken {
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Arc::new(StopInner {
                flag: AtomicBool::new(false),
                parents: Vec::new(),
            }),
        }
    }

    /// Derive a child that is set when either this token or `other` is set.
    /// Setting the child does not propagate upward.
    #[must_use]
    pub fn child_with(&self, other: &StopToken) -> Self {
        Self {
            inner: Arc::new(StopInner {
                flag: AtomicBool::new(false),
                parents: vec![self.clone(), other.clone()],
            }),
        }
    }

    /// Request a stop.
    pub fn set(&self) {
        self.inner.flag.store(true, Ordering::SeqCst);
    }

    /// True when this token or any parent has been set.
    #[must_use]
    pub fn is_set(&self) -> bool {
        self.inner.flag.load(Ordering::SeqCst)
            || self.inner.parents.iter().any(StopToken::is_set)
    }

    /// Clear only this token's own flag. Parent signals remain visible.
    pub fn clear(&self) {
        self.inner.flag.store(false, Ordering::SeqCst);
    }
}

impl Default for StopToken {
    fn default() -> Self {
        Self::new()
    }
}

/// Sleep in small steps so a stop request interrupts promptly. Returns false
/// when interrupted.
pub async fn sleep_with_stop(duration: Duration, stop: &StopToken) -> bool {
    const STEP: Duration = Duration::from_millis(200);
    let mut remaining = duration;
    while !remaining.is_zero() {
        if stop.is_set() {
            return false;
        }
        let chunk = remaining.min(STEP);
        tokio::time::sleep(chunk).await;
        remaining = remaining.saturating_sub(chunk);
    }
    !stop.is_set()
}
