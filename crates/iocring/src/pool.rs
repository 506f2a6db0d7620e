//! Reusable operation objects.
//!
//! `acquire` pops an idle operation or builds a new one; `release` clears it
//! and pushes it back. The idle set is a lock-free queue, so completion
//! callbacks on any worker can release into it.

use crate::config::PoolConfig;
use crate::operation::CompletionOperation;

use crossbeam_queue::SegQueue;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

struct PoolInner {
    idle: SegQueue<CompletionOperation>,
    idle_count: AtomicUsize,
    created: AtomicUsize,
    max_idle: usize,
}

/// Cloneable handle to a shared operation pool.
#[derive(Clone)]
pub struct OperationPool {
    inner: Arc<PoolInner>,
}

impl OperationPool {
    pub fn new(config: PoolConfig) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                idle: SegQueue::new(),
                idle_count: AtomicUsize::new(0),
                created: AtomicUsize::new(0),
                max_idle: config.max_idle,
            }),
        }
    }

    /// An idle operation, or a new one. Never blocks, never fails.
    pub fn acquire(&self) -> CompletionOperation {
        match self.inner.idle.pop() {
            Some(op) => {
                self.inner.idle_count.fetch_sub(1, Ordering::Relaxed);
                op
            }
            None => {
                self.inner.created.fetch_add(1, Ordering::Relaxed);
                CompletionOperation::new()
            }
        }
    }

    /// Clear `op` and return it to the idle set. Dropped instead once
    /// `max_idle` operations are already idle.
    pub fn release(&self, mut op: CompletionOperation) {
        if op.is_armed() {
            tracing::warn!(?op, "released an armed operation");
        }
        op.reset();
        if self.inner.idle_count.fetch_add(1, Ordering::Relaxed) >= self.inner.max_idle {
            self.inner.idle_count.fetch_sub(1, Ordering::Relaxed);
            return;
        }
        self.inner.idle.push(op);
    }

    /// Create up to `n` operations ahead of time.
    pub fn prewarm(&self, n: usize) {
        for _ in 0..n {
            if self.idle() >= self.inner.max_idle {
                break;
            }
            self.inner.created.fetch_add(1, Ordering::Relaxed);
            self.release(CompletionOperation::new());
        }
    }

    /// Operations currently idle.
    pub fn idle(&self) -> usize {
        self.inner.idle_count.load(Ordering::Relaxed)
    }

    /// Operations ever constructed by this pool.
    pub fn created(&self) -> usize {
        self.inner.created.load(Ordering::Relaxed)
    }
}

impl Default for OperationPool {
    fn default() -> Self {
        Self::new(PoolConfig::default())
    }
}

impl std::fmt::Debug for OperationPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OperationPool")
            .field("idle", &self.idle())
            .field("created", &self.created())
            .field("max_idle", &self.inner.max_idle)
            .finish()
    }
}
