//! Event dispatcher
//!
//! Every engine task (executing a request, firing its events, committing a
//! transaction) runs on one worker thread in submission order. Callers never
//! see events on their own thread, and tasks never race each other.

use parking_lot::{Condvar, Mutex};
use std::cell::Cell;
use std::collections::VecDeque;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use tracing::{error, trace};

type Task = Box<dyn FnOnce() + Send>;

thread_local! {
    static ON_DISPATCHER: Cell<bool> = Cell::new(false);
}

/// Whether the current thread is a dispatcher worker
pub fn is_dispatch_thread() -> bool {
    ON_DISPATCHER.with(Cell::get)
}

/// Dispatcher metrics snapshot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DispatcherStats {
    /// Tasks waiting in the queue
    pub queue_depth: usize,
    /// Tasks run since the dispatcher started, including ones that panicked
    pub tasks_completed: u64,
}

struct Inner {
    queue: Mutex<VecDeque<Task>>,
    work_ready: Condvar,
    drain_cond: Condvar,
    shutdown: AtomicBool,
    queue_depth: AtomicUsize,
    busy: AtomicBool,
    tasks_completed: AtomicU64,
}

/// A single FIFO worker thread
pub struct Dispatcher {
    inner: Arc<Inner>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl Dispatcher {
    /// Start the worker thread.
    ///
    /// # Errors
    ///
    /// Returns the OS error if the thread cannot be spawned.
    pub fn new(thread_name: &str) -> io::Result<Self> {
        let inner = Arc::new(Inner {
            queue: Mutex::new(VecDeque::new()),
            work_ready: Condvar::new(),
            drain_cond: Condvar::new(),
            shutdown: AtomicBool::new(false),
            queue_depth: AtomicUsize::new(0),
            busy: AtomicBool::new(false),
            tasks_completed: AtomicU64::new(0),
        });
        let worker_inner = Arc::clone(&inner);
        let handle = std::thread::Builder::new()
            .name(thread_name.to_string())
            .spawn(move || {
                ON_DISPATCHER.with(|flag| flag.set(true));
                worker_loop(&worker_inner)
            })?;
        Ok(Self {
            inner,
            worker: Mutex::new(Some(handle)),
        })
    }

    /// Queue `work` behind every task submitted before it.
    ///
    /// Returns false if the dispatcher has shut down; the task is dropped.
    pub fn submit(&self, work: impl FnOnce() + Send + 'static) -> bool {
        if self.inner.shutdown.load(Ordering::Acquire) {
            return false;
        }
        {
            let mut queue = self.inner.queue.lock();
            queue.push_back(Box::new(work));
            self.inner.queue_depth.fetch_add(1, Ordering::Release);
        }
        self.inner.work_ready.notify_one();
        true
    }

    /// Block until the queue is empty and the worker is idle.
    ///
    /// Returns immediately on the dispatcher thread itself, which could
    /// never observe itself idle.
    pub fn drain(&self) {
        if is_dispatch_thread() {
            return;
        }
        let mut queue = self.inner.queue.lock();
        while !queue.is_empty() || self.inner.busy.load(Ordering::Acquire) {
            self.inner.drain_cond.wait(&mut queue);
        }
    }

    /// Stop the worker after it runs the tasks already queued
    pub fn shutdown(&self) {
        self.inner.shutdown.store(true, Ordering::Release);
        {
            let _queue = self.inner.queue.lock();
            self.inner.work_ready.notify_all();
        }
        let handle = self.worker.lock().take();
        if let Some(handle) = handle {
            // The last engine handle may be dropped by a task; never join ourselves
            if !is_dispatch_thread() {
                let _ = handle.join();
            }
        }
    }

    /// Snapshot of dispatcher metrics
    pub fn stats(&self) -> DispatcherStats {
        DispatcherStats {
            queue_depth: self.inner.queue_depth.load(Ordering::Relaxed),
            tasks_completed: self.inner.tasks_completed.load(Ordering::Relaxed),
        }
    }
}

impl Drop for Dispatcher {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Marks the worker idle and wakes drain waiters, even if the task panicked
struct BusyGuard<'a> {
    inner: &'a Inner,
}

impl Drop for BusyGuard<'_> {
    fn drop(&mut self) {
        self.inner.tasks_completed.fetch_add(1, Ordering::Relaxed);
        let queue = self.inner.queue.lock();
        self.inner.busy.store(false, Ordering::Release);
        if queue.is_empty() {
            self.inner.drain_cond.notify_all();
        }
    }
}

fn worker_loop(inner: &Inner) {
    loop {
        let task = {
            let mut queue = inner.queue.lock();
            loop {
                if let Some(task) = queue.pop_front() {
                    inner.queue_depth.fetch_sub(1, Ordering::Release);
                    inner.busy.store(true, Ordering::Release);
                    break task;
                }
                if inner.shutdown.load(Ordering::Acquire) {
                    trace!(target: "idbind::engine", "Dispatcher stopped");
                    return;
                }
                inner.work_ready.wait(&mut queue);
            }
        };

        let _guard = BusyGuard { inner };
        if let Err(payload) = std::panic::catch_unwind(std::panic::AssertUnwindSafe(task)) {
            let message = payload
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| payload.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "(non-string panic)".to_string());
            error!(target: "idbind::engine", panic = %message, "Engine task panicked");
        }
    }
}
