//! Worker pool abstraction.
//!
//! Completion callbacks and accepted-client dispatches run on a shared pool
//! of threads, never on the reactor thread, so a slow callback cannot stall
//! the completion queue.
//!
//! # Implementors
//!
//! - `FixedPool` (default): N OS threads spawned at creation, lock-free
//!   job queue, park/unpark for idle workers.

use crate::error::Result;

/// A unit of work handed to the pool.
pub type Job = Box<dyn FnOnce() + Send + 'static>;

/// Executes jobs on a pool of threads.
///
/// **Contract:**
/// - `execute()` must NEVER block the caller.
/// - Jobs may block; they only hold up the worker running them.
/// - After `shutdown()`, `execute()` fails with `PortClosed`; jobs queued
///   before shutdown still run.
pub trait WorkerPool: Send + Sync {
    /// Queue a job for execution on some worker thread.
    fn execute(&self, job: Job) -> Result<()>;

    /// Number of workers currently running a job.
    fn active_workers(&self) -> usize;

    /// Total number of workers.
    fn total_workers(&self) -> usize;

    /// Stop accepting jobs; workers exit once the queue is drained.
    fn shutdown(&self);
}
