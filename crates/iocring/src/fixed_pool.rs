//! `FixedPool`, the default `WorkerPool` implementation.
//!
//! Spawns N OS threads at creation. Workers pop jobs from a lock-free MPMC
//! queue and run them. Idle workers park with a timeout; `execute()` unparks
//! one of them round-robin.
//!
//! No dynamic scaling: the thread count is fixed at construction.

use iocring_core::error::{Error, Result};
use iocring_core::worker::{Job, WorkerPool};

use crossbeam_queue::SegQueue;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::thread::{self, JoinHandle, Thread};
use std::time::Duration;

/// Shared state between submitters and workers.
struct PoolInner {
    queue: SegQueue<Job>,
    /// Number of workers currently running a job.
    active: AtomicUsize,
    shutdown: AtomicBool,
    total: usize,
    park_timeout: Duration,
    /// Worker thread handles for unparking. Set once after spawn.
    threads: OnceLock<Vec<Thread>>,
    next: AtomicUsize,
}

impl PoolInner {
    fn wake_one(&self) {
        if let Some(threads) = self.threads.get() {
            let i = self.next.fetch_add(1, Ordering::Relaxed) % threads.len();
            threads[i].unpark();
        }
    }

    fn wake_all(&self) {
        if let Some(threads) = self.threads.get() {
            for t in threads {
                t.unpark();
            }
        }
    }
}

pub struct FixedPool {
    inner: Arc<PoolInner>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl FixedPool {
    /// Create a pool with `n` workers named `{name}-{i}`.
    pub fn new(name: &str, n: usize, park_timeout: Duration) -> Result<Self> {
        let n = n.max(1);
        let inner = Arc::new(PoolInner {
            queue: SegQueue::new(),
            active: AtomicUsize::new(0),
            shutdown: AtomicBool::new(false),
            total: n,
            park_timeout,
            threads: OnceLock::new(),
            next: AtomicUsize::new(0),
        });

        let mut handles = Vec::with_capacity(n);
        for worker_id in 0..n {
            let worker_inner = Arc::clone(&inner);
            let spawned = thread::Builder::new()
                .name(format!("{}-{}", name, worker_id))
                .spawn(move || worker_loop(worker_inner, worker_id));
            match spawned {
                Ok(handle) => handles.push(handle),
                Err(e) => {
                    // Let the ones already running exit.
                    inner.shutdown.store(true, Ordering::SeqCst);
                    let threads = handles.iter().map(|h| h.thread().clone()).collect();
                    let _ = inner.threads.set(threads);
                    inner.wake_all();
                    return Err(Error::Io(e));
                }
            }
        }

        let threads = handles.iter().map(|h| h.thread().clone()).collect();
        let _ = inner.threads.set(threads);

        Ok(FixedPool { inner, handles: Mutex::new(handles) })
    }

    /// Jobs queued but not yet picked up.
    pub fn queued(&self) -> usize {
        self.inner.queue.len()
    }

    /// Wait for all workers to exit. Call after `shutdown()`.
    ///
    /// A worker calling this skips joining itself.
    pub fn join(&self) {
        let handles = match self.handles.lock() {
            Ok(mut guard) => std::mem::take(&mut *guard),
            Err(poisoned) => std::mem::take(&mut *poisoned.into_inner()),
        };
        let me = thread::current().id();
        for handle in handles {
            if handle.thread().id() == me {
                continue;
            }
            let _ = handle.join();
        }
    }
}

impl WorkerPool for FixedPool {
    fn execute(&self, job: Job) -> Result<()> {
        if self.inner.shutdown.load(Ordering::Acquire) {
            return Err(Error::PortClosed);
        }
        self.inner.queue.push(job);
        self.inner.wake_one();
        Ok(())
    }

    fn active_workers(&self) -> usize {
        self.inner.active.load(Ordering::Relaxed)
    }

    fn total_workers(&self) -> usize {
        self.inner.total
    }

    fn shutdown(&self) {
        self.inner.shutdown.store(true, Ordering::SeqCst);
        self.inner.wake_all();
    }
}

impl Drop for FixedPool {
    fn drop(&mut self) {
        self.shutdown();
        self.join();
    }
}

/// Worker thread main loop. Exits once shut down and the queue is empty.
fn worker_loop(inner: Arc<PoolInner>, worker_id: usize) {
    loop {
        match inner.queue.pop() {
            Some(job) => {
                inner.active.fetch_add(1, Ordering::Relaxed);
                // A panicking callback must not take the worker down with it.
                if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(job)) {
                    let msg = payload
                        .downcast_ref::<&str>()
                        .map(|s| s.to_string())
                        .or_else(|| payload.downcast_ref::<String>().cloned())
                        .unwrap_or_else(|| "<non-string panic>".to_string());
                    tracing::error!(worker = worker_id, panic = %msg, "job panicked");
                }
                inner.active.fetch_sub(1, Ordering::Relaxed);
            }
            None => {
                if inner.shutdown.load(Ordering::Acquire) {
                    break;
                }
                thread::park_timeout(inner.park_timeout);
            }
        }
    }
    tracing::trace!(worker = worker_id, "worker exit");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;

    #[test]
    fn runs_jobs_on_named_threads() {
        let pool = FixedPool::new("test-pool", 2, Duration::from_millis(1)).unwrap();
        let (tx, rx) = mpsc::channel();
        for i in 0..8 {
            let tx = tx.clone();
            pool.execute(Box::new(move || {
                let name = thread::current().name().unwrap_or("").to_string();
                tx.send((i, name)).unwrap();
            }))
            .unwrap();
        }
        let mut seen: Vec<_> = (0..8).map(|_| rx.recv().unwrap()).collect();
        seen.sort();
        assert_eq!(seen.len(), 8);
        assert!(seen.iter().all(|(_, n)| n.starts_with("test-pool-")));
    }

    #[test]
    fn every_worker_shares_the_pool_state() {
        let pool = FixedPool::new("shared", 3, Duration::from_millis(1)).unwrap();
        // The pool itself plus one handle per worker thread.
        assert_eq!(Arc::strong_count(&pool.inner), 4);
        assert_eq!(pool.inner.threads.get().map(Vec::len), Some(3));
    }

    #[test]
    fn panic_does_not_kill_worker() {
        let pool = FixedPool::new("panicky", 1, Duration::from_millis(1)).unwrap();
        pool.execute(Box::new(|| panic!("boom"))).unwrap();

        let (tx, rx) = mpsc::channel();
        pool.execute(Box::new(move || tx.send(7).unwrap())).unwrap();
        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), 7);
    }

    #[test]
    fn execute_after_shutdown_fails_but_queue_drains() {
        let pool = FixedPool::new("drain", 1, Duration::from_millis(1)).unwrap();
        let (tx, rx) = mpsc::channel();
        pool.execute(Box::new(move || tx.send(1).unwrap())).unwrap();
        pool.shutdown();
        assert!(matches!(pool.execute(Box::new(|| {})), Err(Error::PortClosed)));
        pool.join();
        assert_eq!(rx.try_recv().unwrap(), 1);
    }
}
