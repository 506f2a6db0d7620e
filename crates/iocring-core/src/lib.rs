//! # iocring-core: types and seam traits for iocring
//!
//! This crate holds everything in iocring that does not touch `io_uring`
//! directly: the error taxonomy, operation kinds, completion entries, and the
//! trait boundaries the Linux implementation plugs into.
//!
//! | Trait        | Default impl (in `iocring`) |
//! |--------------|-----------------------------|
//! | `Notifier`   | `EventFdNotifier`           |
//! | `WorkerPool` | `FixedPool`                 |
//!
//! Keeping these platform-neutral lets the pending-result and cancellation
//! machinery be tested without a kernel ring.

pub mod entry;
pub mod error;
pub mod notifier;
pub mod worker;
pub mod cancel;
pub mod env;

pub use cancel::CancellationToken;
pub use entry::{Completion, OpKind, Token};
pub use error::{Error, Result, SocketError};
