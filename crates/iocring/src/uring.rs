//! `Ring`: a thin driver over the `io-uring` crate.
//!
//! Owned by the reactor thread only. Tracks which operation tokens the
//! kernel still holds so shutdown can cancel them and wait them out.
//! No SQPOLL, no fixed files, no fixed buffers.

use iocring_core::entry::{Completion, Token};
use iocring_core::error::{Error, Result};

use io_uring::{opcode, squeue, IoUring};
use std::collections::{HashSet, VecDeque};

pub(crate) struct Ring {
    ring: IoUring,
    /// Operation tokens pushed but not yet completed.
    inflight: HashSet<u64>,
    /// Entries that did not fit in the SQ; pushed on the next flush.
    backlog: VecDeque<squeue::Entry>,
}

impl Ring {
    pub(crate) fn new(sq_entries: u32) -> Result<Self> {
        let ring = IoUring::builder()
            .build(sq_entries)
            .map_err(|e| Error::Setup(e.raw_os_error().unwrap_or(-1)))?;
        Ok(Self {
            ring,
            inflight: HashSet::new(),
            backlog: VecDeque::new(),
        })
    }

    /// Queue an entry. Never fails: a full SQ is submitted to make room,
    /// and anything still left over waits in the backlog.
    pub(crate) fn push(&mut self, entry: squeue::Entry) {
        let token = Token(entry.get_user_data());
        if token.is_operation() {
            self.inflight.insert(token.0);
        }
        if !self.backlog.is_empty() || !self.try_push(&entry) {
            tracing::trace!(backlog = self.backlog.len() + 1, "submission queue full");
            self.backlog.push_back(entry);
        }
    }

    fn try_push(&mut self, entry: &squeue::Entry) -> bool {
        // Safety: every pointer an entry carries lives in a boxed operation
        // state that is not freed until its completion is reaped.
        unsafe {
            if self.ring.submission().push(entry).is_ok() {
                return true;
            }
        }
        if self.ring.submit().is_err() {
            return false;
        }
        unsafe { self.ring.submission().push(entry).is_ok() }
    }

    /// Move backlogged entries into the SQ while there is room.
    fn drain_backlog(&mut self) {
        while let Some(entry) = self.backlog.pop_front() {
            let pushed = unsafe { self.ring.submission().push(&entry).is_ok() };
            if !pushed {
                self.backlog.push_front(entry);
                break;
            }
        }
    }

    /// Submit everything queued and block until at least `want` completions
    /// are ready. Interrupted waits return normally.
    pub(crate) fn submit_and_wait(&mut self, want: usize) -> Result<()> {
        self.drain_backlog();
        let want = if self.backlog.is_empty() { want } else { 0 };
        match self.ring.submit_and_wait(want) {
            Ok(_) => Ok(()),
            Err(e) => match e.raw_os_error() {
                Some(libc::EINTR) | Some(libc::EBUSY) | Some(libc::EAGAIN) => Ok(()),
                _ => Err(Error::Io(e)),
            },
        }
    }

    /// Reap up to `max` completions into `out`.
    pub(crate) fn reap(&mut self, out: &mut Vec<Completion>, max: usize) -> usize {
        let mut count = 0;
        for cqe in self.ring.completion() {
            let token = Token(cqe.user_data());
            if token.is_operation() {
                self.inflight.remove(&token.0);
            }
            out.push(Completion { token, result: cqe.result() });
            count += 1;
            if count >= max {
                break;
            }
        }
        count
    }

    /// Cancel one operation.
    ///
    /// Returns `true` if the entry never reached the kernel; it has been
    /// dropped from the backlog and the caller must complete it itself.
    pub(crate) fn cancel(&mut self, token: Token) -> bool {
        if !self.inflight.contains(&token.0) {
            return false;
        }
        if let Some(pos) = self
            .backlog
            .iter()
            .position(|e| e.get_user_data() == token.0)
        {
            self.backlog.remove(pos);
            self.inflight.remove(&token.0);
            return true;
        }
        let entry = opcode::AsyncCancel::new(token.0)
            .build()
            .user_data(Token::CANCEL.0);
        self.push(entry);
        false
    }

    /// Cancel every in-flight operation. Returns the tokens that were still
    /// backlogged; their completions never arrive from the kernel.
    pub(crate) fn cancel_all(&mut self) -> Vec<Token> {
        let tokens: Vec<u64> = self.inflight.iter().copied().collect();
        let mut dropped = Vec::new();
        for t in tokens {
            if self.cancel(Token(t)) {
                dropped.push(Token(t));
            }
        }
        dropped
    }

    pub(crate) fn inflight(&self) -> usize {
        self.inflight.len()
    }

    #[cfg(test)]
    fn capacity(&self) -> usize {
        self.ring.params().sq_entries() as usize
    }
}

impl std::fmt::Debug for Ring {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Ring")
            .field("inflight", &self.inflight.len())
            .field("backlog", &self.backlog.len())
            .finish()
    }
}
