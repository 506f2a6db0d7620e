//! Cancellation token for future-style socket calls.
//!
//! A future-returning call checks its token once, before anything is
//! issued. If cancellation was already requested it resolves immediately
//! without touching the operation pool or the socket. An operation already
//! handed to the kernel cannot be aborted through the token.
//!
//! Tokens can be linked to form parent-child relationships.

use crate::error::{Error, Result};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Token for checking and triggering cancellation.
#[derive(Clone)]
pub struct CancellationToken {
    inner: Option<Arc<Inner>>,
}

struct Inner {
    cancelled: AtomicBool,
    parent: Option<CancellationToken>,
}

impl CancellationToken {
    /// Create a new independent token.
    pub fn new() -> Self {
        Self {
            inner: Some(Arc::new(Inner {
                cancelled: AtomicBool::new(false),
                parent: None,
            })),
        }
    }

    /// A token that can never be cancelled. Does not allocate.
    pub const fn never() -> Self {
        Self { inner: None }
    }

    /// Create a child token linked to this one.
    ///
    /// Cancelling this token cancels the child; not the other way around.
    pub fn child(&self) -> Self {
        Self {
            inner: Some(Arc::new(Inner {
                cancelled: AtomicBool::new(false),
                parent: Some(self.clone()),
            })),
        }
    }

    /// Check if cancellation was requested, here or on any ancestor.
    #[inline]
    pub fn is_cancelled(&self) -> bool {
        match &self.inner {
            Some(inner) => {
                if inner.cancelled.load(Ordering::Acquire) {
                    return true;
                }
                match inner.parent {
                    Some(ref parent) => parent.is_cancelled(),
                    None => false,
                }
            }
            None => false,
        }
    }

    /// Request cancellation. No-op on a `never()` token.
    pub fn cancel(&self) {
        if let Some(inner) = &self.inner {
            inner.cancelled.store(true, Ordering::Release);
        }
    }

    /// `Err(Error::Cancelled)` if cancellation was requested.
    #[inline]
    pub fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            Err(Error::Cancelled)
        } else {
            Ok(())
        }
    }
}

impl Default for CancellationToken {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for CancellationToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CancellationToken")
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_basic_cancellation() {
        let token = CancellationToken::new();
        assert!(!token.is_cancelled());
        assert!(token.check().is_ok());

        token.cancel();
        assert!(token.is_cancelled());
        assert!(matches!(token.check(), Err(Error::Cancelled)));
    }

    #[test]
    fn test_never_ignores_cancel() {
        let token = CancellationToken::never();
        token.cancel();
        assert!(!token.is_cancelled());
    }

    #[test]
    fn test_child_follows_parent() {
        let parent = CancellationToken::new();
        let child = parent.child();
        let grandchild = child.child();
        assert!(!grandchild.is_cancelled());

        parent.cancel();
        assert!(child.is_cancelled());
        assert!(grandchild.is_cancelled());
    }

    #[test]
    fn test_child_cancel_stays_local() {
        let parent = CancellationToken::new();
        let child = parent.child();

        child.cancel();
        assert!(child.is_cancelled());
        assert!(!parent.is_cancelled());
    }

    #[test]
    fn test_clone_shares_state() {
        let a = CancellationToken::new();
        let b = a.clone();
        b.cancel();
        assert!(a.is_cancelled());
    }
}
