//! Reactor wake-up abstraction.
//!
//! The reactor sleeps inside `io_uring_enter` waiting for completions.
//! Callers on other threads queue new submissions and then `notify()` so the
//! reactor comes back around and pushes them to the ring.
//!
//! # Implementors
//!
//! - `EventFdNotifier` (default): writes 1 to an eventfd that the reactor
//!   keeps a `PollAdd` armed on.

use crate::error::Result;

/// Wakes the reactor when new submissions are queued.
///
/// **Contract:**
/// - `notify()` must NEVER block.
/// - Multiple calls before the reactor wakes are coalesced
///   (eventfd semantics: counter increments, one read drains).
pub trait Notifier: Send + Sync {
    /// Signal that new work is queued.
    fn notify(&self) -> Result<()>;

    /// Consume pending notifications. Called by the reactor after waking.
    fn drain(&self);
}
