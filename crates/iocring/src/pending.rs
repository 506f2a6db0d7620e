//! # PendingResult
//!
//! The single-assignment outcome of one caller-visible stream call.
//!
//! A result is created before the kernel operation is issued and completes
//! exactly once: synchronously with `set_failed` when issuance is refused,
//! or from the completion path, which records the outcome and then calls
//! `call_user_callback`.
//!
//! Waiting is cheap on the async path: the blocking wait handle is only
//! created if someone actually calls `wait` before completion.

use crate::operation::UserState;

use iocring_core::entry::OpKind;
use iocring_core::error::{Error, Result, SocketError};

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};

/// Invoked once when the call completes, on whichever thread completed it.
pub type UserCallback = Box<dyn FnOnce(&PendingResult) + Send>;

struct Waiter {
    lock: Mutex<()>,
    cond: Condvar,
}

#[derive(Default)]
struct Slot {
    error: Option<Error>,
    socket_error: Option<SocketError>,
    bytes: usize,
    buffer: Option<Vec<u8>>,
    callback: Option<UserCallback>,
}

struct Inner {
    owner: u64,
    kind: OpKind,
    offset: usize,
    size: usize,
    completed: AtomicBool,
    failed: AtomicBool,
    ended: AtomicBool,
    slot: Mutex<Slot>,
    waiter: Mutex<Option<Arc<Waiter>>>,
    state: Option<UserState>,
}

/// Shared handle to one call's outcome. Clones refer to the same result.
#[derive(Clone)]
pub struct PendingResult {
    inner: Arc<Inner>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    // A panicking user callback never runs under these locks.
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl PendingResult {
    pub fn new(
        callback: Option<UserCallback>,
        state: Option<UserState>,
        owner: u64,
        kind: OpKind,
        offset: usize,
        size: usize,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                owner,
                kind,
                offset,
                size,
                completed: AtomicBool::new(false),
                failed: AtomicBool::new(false),
                ended: AtomicBool::new(false),
                slot: Mutex::new(Slot { callback, ..Slot::default() }),
                waiter: Mutex::new(None),
                state,
            }),
        }
    }

    pub fn is_completed(&self) -> bool {
        self.inner.completed.load(Ordering::Acquire)
    }

    /// Completed with an error. Meaningless before completion.
    pub fn is_failed(&self) -> bool {
        self.inner.failed.load(Ordering::Acquire)
    }

    /// The OS status behind a failure, if it was a socket error.
    pub fn socket_error(&self) -> Option<SocketError> {
        lock(&self.inner.slot).socket_error
    }

    /// Bytes transferred. Meaningless if the call failed.
    pub fn bytes_transferred(&self) -> usize {
        lock(&self.inner.slot).bytes
    }

    pub fn kind(&self) -> OpKind {
        self.inner.kind
    }

    pub fn offset(&self) -> usize {
        self.inner.offset
    }

    pub fn size(&self) -> usize {
        self.inner.size
    }

    pub fn owner(&self) -> u64 {
        self.inner.owner
    }

    /// The caller-supplied state passed at begin time.
    pub fn state(&self) -> Option<&UserState> {
        self.inner.state.as_ref()
    }

    /// Take the buffer back. Available once the call has completed.
    pub fn take_buffer(&self) -> Option<Vec<u8>> {
        lock(&self.inner.slot).buffer.take()
    }

    pub(crate) fn set_buffer(&self, buf: Vec<u8>) {
        if self.is_completed() {
            return;
        }
        lock(&self.inner.slot).buffer = Some(buf);
    }

    pub(crate) fn set_transferred(&self, bytes: usize) {
        if self.is_completed() {
            return;
        }
        lock(&self.inner.slot).bytes = bytes;
    }

    /// Record a failure and complete. Does not run the user callback.
    pub fn set_failed(&self, error: Error) {
        {
            let mut slot = lock(&self.inner.slot);
            if self.inner.completed.load(Ordering::Acquire) {
                tracing::debug!(%error, "result already completed, failure ignored");
                return;
            }
            slot.socket_error = error.socket_error();
            slot.error = Some(error);
            self.inner.failed.store(true, Ordering::Release);
        }
        self.mark_completed();
    }

    /// Complete (if not already) and run the user callback, at most once.
    pub fn call_user_callback(&self) {
        self.mark_completed();
        let callback = lock(&self.inner.slot).callback.take();
        if let Some(cb) = callback {
            cb(self);
        }
    }

    fn mark_completed(&self) {
        if self.inner.completed.swap(true, Ordering::AcqRel) {
            return;
        }
        let waiter = lock(&self.inner.waiter).clone();
        if let Some(w) = waiter {
            let _g = lock(&w.lock);
            w.cond.notify_all();
        }
    }

    /// Block the calling thread until the result completes.
    pub fn wait(&self) {
        if self.is_completed() {
            return;
        }
        let waiter = {
            let mut slot = lock(&self.inner.waiter);
            Arc::clone(slot.get_or_insert_with(|| {
                Arc::new(Waiter { lock: Mutex::new(()), cond: Condvar::new() })
            }))
        };
        let mut guard = lock(&waiter.lock);
        while !self.is_completed() {
            guard = waiter
                .cond
                .wait(guard)
                .unwrap_or_else(|poisoned| poisoned.into_inner());
        }
    }

    /// Drop the wait handle if one was created. Legal in any state; a thread
    /// already waiting keeps its own reference.
    pub fn dispose(&self) {
        lock(&self.inner.waiter).take();
    }

    /// The end half of a begin/end pair: check the caller's claim to this
    /// result, block until completion, then surface the outcome.
    pub(crate) fn end(&self, owner: u64, kind: OpKind) -> Result<usize> {
        if self.inner.owner != owner {
            return Err(Error::Misuse("result was not issued by this stream"));
        }
        if self.inner.kind != kind {
            return Err(Error::Misuse("result belongs to a different operation"));
        }
        if self.inner.ended.swap(true, Ordering::AcqRel) {
            return Err(Error::Misuse("end called twice for the same result"));
        }
        self.wait();
        self.dispose();

        let mut slot = lock(&self.inner.slot);
        match slot.error.take() {
            Some(e) => Err(e),
            None => Ok(slot.bytes),
        }
    }
}

impl fmt::Debug for PendingResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PendingResult")
            .field("owner", &self.inner.owner)
            .field("kind", &self.inner.kind)
            .field("offset", &self.inner.offset)
            .field("size", &self.inner.size)
            .field("completed", &self.is_completed())
            .field("failed", &self.is_failed())
            .finish()
    }
}
