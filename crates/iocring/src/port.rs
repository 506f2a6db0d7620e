//! # CompletionPort
//!
//! One reactor thread owns the `io_uring`. Callers on any thread hand it
//! submission entries through a lock-free MPSC queue and wake it with an
//! eventfd. Completions are routed back to their operation by token and
//! dispatched on the worker pool, never on the reactor thread.
//!
//! ```text
//!   caller threads            reactor thread             worker pool
//!   ──────────────            ──────────────             ───────────
//!   submit(token, sqe) ──►  request queue ──► SQ
//!   notify() ──► eventfd ──► PollAdd CQE (wake)
//!                             CQE(token) ──► execute(op.complete(res)) ──► callback
//! ```
//!
//! Shutdown cancels everything still in flight and waits until each of
//! those operations has completed (with `ECANCELED`), so no callback is
//! ever lost.

use crate::config::PortConfig;
use crate::eventfd::EventFdNotifier;
use crate::fixed_pool::FixedPool;
use crate::operation::CompletionOperation;
use crate::uring::Ring;

use iocring_core::entry::{Completion, Token};
use iocring_core::error::{Error, Result};
use iocring_core::notifier::Notifier;
use iocring_core::worker::WorkerPool;

use crossbeam_queue::SegQueue;
use io_uring::{opcode, squeue, types};
use std::os::unix::io::AsRawFd;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

enum Request {
    Submit(squeue::Entry),
    Cancel(Token),
}

/// State shared between handles, the reactor and the owner.
struct PortShared {
    requests: SegQueue<Request>,
    notifier: EventFdNotifier,
    workers: FixedPool,
    /// No new submissions are accepted.
    closed: AtomicBool,
    /// Set once every submitter that raced with `closed` has finished
    /// pushing; the reactor may then cancel everything and exit.
    draining: AtomicBool,
    /// Callers currently inside `submit`.
    submitters: AtomicUsize,
}

/// Cheap, cloneable handle to a running port.
#[derive(Clone)]
pub struct PortHandle {
    shared: Arc<PortShared>,
}

impl PortHandle {
    /// Queue a submission entry for the reactor.
    ///
    /// # Safety
    ///
    /// `token` must be the token of a `CompletionOperation` that was turned
    /// into its raw form, and `entry` must carry it as `user_data`. The
    /// reactor reclaims the operation from the token when the entry
    /// completes. On error the caller still owns the operation.
    pub(crate) unsafe fn submit(&self, token: Token, entry: squeue::Entry) -> Result<()> {
        debug_assert_eq!(entry.get_user_data(), token.0);
        let shared = &self.shared;
        shared.submitters.fetch_add(1, Ordering::SeqCst);
        if shared.closed.load(Ordering::SeqCst) {
            shared.submitters.fetch_sub(1, Ordering::SeqCst);
            return Err(Error::PortClosed);
        }
        shared.requests.push(Request::Submit(entry));
        shared.submitters.fetch_sub(1, Ordering::SeqCst);
        self.wake();
        Ok(())
    }

    /// Best-effort cancel of an in-flight operation.
    ///
    /// If it is still pending its callback fires with `ECANCELED`; if it
    /// already completed nothing happens.
    pub fn cancel(&self, token: Token) -> Result<()> {
        if self.shared.closed.load(Ordering::SeqCst) {
            // Shutdown cancels everything anyway.
            return Err(Error::PortClosed);
        }
        self.shared.requests.push(Request::Cancel(token));
        self.wake();
        Ok(())
    }

    /// Run a job on the worker pool.
    pub fn execute<F>(&self, job: F) -> Result<()>
    where
        F: FnOnce() + Send + 'static,
    {
        self.shared.workers.execute(Box::new(job))
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::Acquire)
    }

    /// Number of completion worker threads.
    pub fn workers(&self) -> usize {
        self.shared.workers.total_workers()
    }

    /// Workers currently running a callback.
    pub fn busy_workers(&self) -> usize {
        self.shared.workers.active_workers()
    }

    fn wake(&self) {
        if let Err(e) = self.shared.notifier.notify() {
            tracing::warn!(error = %e, "reactor wake failed");
        }
    }
}

impl std::fmt::Debug for PortHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PortHandle")
            .field("closed", &self.is_closed())
            .field("workers", &self.workers())
            .finish()
    }
}

/// Owner of the reactor thread and worker pool.
///
/// Dropping it shuts the port down.
pub struct CompletionPort {
    handle: PortHandle,
    reactor: Option<JoinHandle<()>>,
}

impl CompletionPort {
    pub fn start(config: PortConfig) -> Result<Self> {
        config.validate().map_err(Error::InvalidArgument)?;

        let ring = Ring::new(config.sq_entries)?;
        let notifier = EventFdNotifier::create()?;
        let workers = FixedPool::new("iocring-worker", config.workers, config.park_timeout)?;

        let shared = Arc::new(PortShared {
            requests: SegQueue::new(),
            notifier,
            workers,
            closed: AtomicBool::new(false),
            draining: AtomicBool::new(false),
            submitters: AtomicUsize::new(0),
        });

        let reactor_shared = Arc::clone(&shared);
        let batch = config.completion_batch;
        let reactor = thread::Builder::new()
            .name("iocring-reactor".into())
            .spawn(move || reactor_loop(ring, reactor_shared, batch))?;

        tracing::info!(
            sq_entries = config.sq_entries,
            workers = config.workers,
            "completion port started"
        );

        Ok(Self {
            handle: PortHandle { shared },
            reactor: Some(reactor),
        })
    }

    pub fn handle(&self) -> PortHandle {
        self.handle.clone()
    }

    /// Stop the port. Every in-flight operation completes with `ECANCELED`
    /// before this returns. Idempotent.
    pub fn shutdown(&mut self) {
        let Some(reactor) = self.reactor.take() else {
            return;
        };
        let shared = &self.handle.shared;

        shared.closed.store(true, Ordering::SeqCst);
        while shared.submitters.load(Ordering::SeqCst) != 0 {
            thread::yield_now();
        }
        shared.draining.store(true, Ordering::SeqCst);
        if let Err(e) = shared.notifier.notify() {
            tracing::error!(error = %e, "cannot wake reactor for shutdown");
        }

        if reactor.join().is_err() {
            tracing::error!("reactor thread panicked");
        }

        shared.workers.shutdown();
        shared.workers.join();
        tracing::info!("completion port stopped");
    }
}

impl Drop for CompletionPort {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn wake_entry(shared: &PortShared) -> squeue::Entry {
    opcode::PollAdd::new(types::Fd(shared.notifier.as_raw_fd()), libc::POLLIN as u32)
        .build()
        .user_data(Token::WAKE.0)
}

fn reactor_loop(mut ring: Ring, shared: Arc<PortShared>, batch: usize) {
    tracing::debug!("reactor started");
    ring.push(wake_entry(&shared));

    let mut completions: Vec<Completion> = Vec::with_capacity(batch);
    let mut shutting_down = false;

    loop {
        // Load before draining: everything pushed before `draining` was set
        // is then guaranteed to be drained below.
        let draining = shared.draining.load(Ordering::SeqCst);

        while let Some(req) = shared.requests.pop() {
            match req {
                Request::Submit(entry) => ring.push(entry),
                Request::Cancel(token) => {
                    if ring.cancel(token) {
                        dispatch(&shared, token, -libc::ECANCELED);
                    }
                }
            }
        }

        if draining && !shutting_down {
            shutting_down = true;
            let pending = ring.inflight();
            for token in ring.cancel_all() {
                dispatch(&shared, token, -libc::ECANCELED);
            }
            tracing::debug!(pending, "cancelling in-flight operations");
        }

        if shutting_down && ring.inflight() == 0 {
            break;
        }

        if let Err(e) = ring.submit_and_wait(1) {
            tracing::error!(error = %e, inflight = ring.inflight(), "io_uring_enter failed, reactor exiting");
            shared.closed.store(true, Ordering::SeqCst);
            break;
        }

        ring.reap(&mut completions, batch);
        for c in completions.drain(..) {
            match c.token {
                Token::WAKE => {
                    shared.notifier.drain();
                    if !shutting_down {
                        ring.push(wake_entry(&shared));
                    }
                }
                Token::CANCEL => {
                    tracing::trace!(result = c.result, "cancel completed");
                }
                token if token.is_operation() => dispatch(&shared, token, c.result),
                token => tracing::warn!(token = token.0, "completion with unknown token"),
            }
        }
    }
    tracing::debug!("reactor exited");
}

/// Reclaim the operation behind `token` and run its completion on a worker.
fn dispatch(shared: &PortShared, token: Token, result: i32) {
    // Safety: operation tokens only enter the ring through
    // `PortHandle::submit`, whose contract makes them raw operations, and
    // each one completes exactly once.
    let op = unsafe { CompletionOperation::from_token(token) };
    let job = Box::new(move || op.complete(result));
    if let Err(rejected) = shared.workers.execute(job) {
        // Workers are joined only after the reactor exits.
        tracing::error!(error = %rejected, "worker pool closed, completion lost");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;
    use std::time::Duration;

    #[test]
    fn start_and_shutdown_twice() {
        let mut port = CompletionPort::start(PortConfig::new().workers(2)).unwrap();
        let handle = port.handle();
        assert_eq!(handle.workers(), 2);
        assert!(!handle.is_closed());
        port.shutdown();
        port.shutdown();
        assert!(handle.is_closed());
    }

    #[test]
    fn execute_runs_on_worker() {
        let port = CompletionPort::start(PortConfig::new().workers(1)).unwrap();
        let (tx, rx) = mpsc::channel();
        port.handle()
            .execute(move || {
                let name = thread::current().name().map(str::to_string);
                tx.send(name).unwrap();
            })
            .unwrap();
        let name = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(name.as_deref(), Some("iocring-worker-0"));
    }

    #[test]
    fn cancel_after_shutdown_reports_closed() {
        let mut port = CompletionPort::start(PortConfig::new().workers(1)).unwrap();
        let handle = port.handle();
        port.shutdown();
        assert!(matches!(handle.cancel(Token(0x1000)), Err(Error::PortClosed)));
        assert!(matches!(handle.execute(|| {}), Err(Error::PortClosed)));
    }

    #[test]
    fn invalid_config_is_refused() {
        let err = CompletionPort::start(PortConfig::new().sq_entries(3)).err().unwrap();
        assert!(matches!(err, Error::InvalidArgument(_)));
    }
}
