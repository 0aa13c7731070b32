//! Cancellation token for cooperative cancellation
//!
//! There is no preemptive cancellation. A cooperative thread observes its
//! token at its own suspension points and winds down by returning.

use core::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::error::{SchedError, SchedResult};

/// Token for checking and triggering cancellation
///
/// Tokens can have parents: cancelling a parent is observed by every child.
#[derive(Clone, Default)]
pub struct CancellationToken {
    inner: Option<Arc<Inner>>,
}

struct Inner {
    cancelled: AtomicBool,
    parent: Option<CancellationToken>,
}

impl CancellationToken {
    /// Create a new independent cancellation token
    pub fn new() -> Self {
        Self {
            inner: Some(Arc::new(Inner {
                cancelled: AtomicBool::new(false),
                parent: None,
            })),
        }
    }

    /// Create a token that never cancels
    pub fn dummy() -> Self {
        Self { inner: None }
    }

    /// Create a child token linked to this one
    pub fn child(&self) -> Self {
        Self {
            inner: Some(Arc::new(Inner {
                cancelled: AtomicBool::new(false),
                parent: Some(self.clone()),
            })),
        }
    }

    /// Check if cancellation was requested here or on any ancestor
    #[inline]
    pub fn is_cancelled(&self) -> bool {
        let mut cur = self;
        loop {
            match &cur.inner {
                None => return false,
                Some(inner) => {
                    if inner.cancelled.load(Ordering::Acquire) {
                        return true;
                    }
                    match &inner.parent {
                        Some(parent) => cur = parent,
                        None => return false,
                    }
                }
            }
        }
    }

    /// Request cancellation; only this token's flag is set
    pub fn cancel(&self) {
        if let Some(inner) = &self.inner {
            inner.cancelled.store(true, Ordering::Release);
        }
    }

    /// Return `Err(Cancelled)` once cancellation was requested
    ///
    /// ```ignore
    /// fn worker(token: &CancellationToken) -> SchedResult<()> {
    ///     loop {
    ///         token.check()?;
    ///         cothread::sleep(Duration::from_millis(10));
    ///     }
    /// }
    /// ```
    #[inline]
    pub fn check(&self) -> SchedResult<()> {
        if self.is_cancelled() {
            Err(SchedError::Cancelled)
        } else {
            Ok(())
        }
    }
}

impl core::fmt::Debug for CancellationToken {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("CancellationToken")
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}
