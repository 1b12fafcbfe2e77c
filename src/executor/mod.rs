//! # Flush / compaction executors
//!
//! Dedicated bounded thread pools: flushes run on a pool sized by the
//! flush-writer count with a bounded submission queue (submitters block
//! on admission), compactions on a pool sized by the configured
//! concurrency, and live-ratio metering on a singleton pool.
//!
//! The [`PostFlushSignaller`] is the commit-log ordering stage: flush
//! completions are signalled to the commit log strictly in submission
//! order, even when flushes finish out of order, preserving the
//! invariant that the log below a signalled position is fully persisted.

#[cfg(test)]
mod tests;

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, SyncSender};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use thiserror::Error;
use tracing::{debug, error, trace};

use crate::stats::ReplayPosition;
use crate::store::CommitLog;

// ------------------------------------------------------------------------------------------------
// Errors
// ------------------------------------------------------------------------------------------------

/// Errors surfaced by executor interactions.
#[derive(Debug, Error)]
pub enum ExecutorError {
    /// The pool was shut down before the task could run or report.
    #[error("executor shut down")]
    Shutdown,
}

// ------------------------------------------------------------------------------------------------
// Thread pool
// ------------------------------------------------------------------------------------------------

type Job = Box<dyn FnOnce() + Send + 'static>;

/// A fixed-size worker pool with a bounded submission queue.
pub struct ThreadPool {
    name: &'static str,
    sender: Option<SyncSender<Job>>,
    workers: Vec<JoinHandle<()>>,
}

impl ThreadPool {
    /// Spawns `threads` workers; `queue_bound` submissions may wait
    /// before `submit` blocks the caller.
    pub fn new(name: &'static str, threads: usize, queue_bound: usize) -> Self {
        let (sender, receiver) = mpsc::sync_channel::<Job>(queue_bound.max(1));
        let receiver = Arc::new(Mutex::new(receiver));
        let workers = (0..threads.max(1))
            .map(|i| {
                let receiver = Arc::clone(&receiver);
                std::thread::Builder::new()
                    .name(format!("{name}-{i}"))
                    .spawn(move || Self::worker_loop(receiver))
                    .unwrap_or_else(|e| panic!("failed to spawn {name} worker: {e}"))
            })
            .collect();
        debug!(name, threads, queue_bound, "thread pool started");
        Self {
            name,
            sender: Some(sender),
            workers,
        }
    }

    fn worker_loop(receiver: Arc<Mutex<Receiver<Job>>>) {
        loop {
            let job = {
                let guard = match receiver.lock() {
                    Ok(guard) => guard,
                    Err(_) => return,
                };
                guard.recv()
            };
            match job {
                Ok(job) => job(),
                Err(_) => return,
            }
        }
    }

    /// Enqueues a task, blocking on admission when the queue is full.
    pub fn submit(&self, job: impl FnOnce() + Send + 'static) -> Result<(), ExecutorError> {
        match &self.sender {
            Some(sender) => sender
                .send(Box::new(job))
                .map_err(|_| ExecutorError::Shutdown),
            None => Err(ExecutorError::Shutdown),
        }
    }

    /// Enqueues a task and returns a handle for its result.
    pub fn submit_with_result<T: Send + 'static>(
        &self,
        job: impl FnOnce() -> T + Send + 'static,
    ) -> Result<TaskHandle<T>, ExecutorError> {
        let (tx, rx) = mpsc::channel();
        self.submit(move || {
            let _ = tx.send(job());
        })?;
        Ok(TaskHandle { rx })
    }

    /// Stops accepting work and joins every worker.
    pub fn shutdown(&mut self) {
        self.sender = None;
        for worker in self.workers.drain(..) {
            if worker.join().is_err() {
                error!(name = self.name, "worker panicked during shutdown");
            }
        }
    }
}

impl Drop for ThreadPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Awaitable result of a submitted task.
pub struct TaskHandle<T> {
    rx: Receiver<T>,
}

impl<T> TaskHandle<T> {
    /// Blocks until the task reports its result.
    pub fn wait(self) -> Result<T, ExecutorError> {
        self.rx.recv().map_err(|_| ExecutorError::Shutdown)
    }
}

// ------------------------------------------------------------------------------------------------
// Post-flush signaller
// ------------------------------------------------------------------------------------------------

/// One registered flush awaiting its commit-log signal.
pub struct FlushSignal {
    position: ReplayPosition,
    done: AtomicBool,
}

impl FlushSignal {
    /// True once the flush task finished and marked this signal; the
    /// commit-log callback may still be pending behind earlier flushes.
    pub fn is_done(&self) -> bool {
        self.done.load(Ordering::Acquire)
    }

    /// The replay position this flush covered.
    pub fn position(&self) -> ReplayPosition {
        self.position
    }
}

struct SignallerInner {
    queue: Mutex<VecDeque<Arc<FlushSignal>>>,
    wakeup: Condvar,
    shutdown: AtomicBool,
    commit_log: Arc<dyn CommitLog>,
}

/// Delivers `on_flush` callbacks to the commit log in registration
/// order, no matter in which order the flush tasks complete.
///
/// Registration happens under the store's memtable switch lock, so the
/// registration order *is* commit-log order; the signal thread only ever
/// pops the completed prefix of the queue.
pub struct PostFlushSignaller {
    inner: Arc<SignallerInner>,
    worker: Option<JoinHandle<()>>,
}

impl PostFlushSignaller {
    /// Starts the signal thread.
    pub fn new(commit_log: Arc<dyn CommitLog>) -> Self {
        let inner = Arc::new(SignallerInner {
            queue: Mutex::new(VecDeque::new()),
            wakeup: Condvar::new(),
            shutdown: AtomicBool::new(false),
            commit_log,
        });
        let worker_inner = Arc::clone(&inner);
        let worker = std::thread::Builder::new()
            .name("post-flush-signal".into())
            .spawn(move || Self::signal_loop(worker_inner))
            .ok();
        Self { inner, worker }
    }

    fn signal_loop(inner: Arc<SignallerInner>) {
        loop {
            // pop the completed prefix under the lock, deliver outside it
            let mut ready = Vec::new();
            {
                let mut queue = match inner.queue.lock() {
                    Ok(guard) => guard,
                    Err(_) => return,
                };
                while queue
                    .front()
                    .is_some_and(|signal| signal.done.load(Ordering::Acquire))
                {
                    if let Some(signal) = queue.pop_front() {
                        ready.push(signal);
                    }
                }
                if ready.is_empty() {
                    if inner.shutdown.load(Ordering::Acquire) {
                        return;
                    }
                    let _ = inner.wakeup.wait_timeout(queue, Duration::from_millis(100));
                }
            }
            for signal in ready {
                trace!(
                    segment = signal.position.segment,
                    position = signal.position.position,
                    "signalling flushed replay position"
                );
                inner.commit_log.on_flush(signal.position);
            }
        }
    }

    /// Registers a flush at its replay position. Call in commit-log
    /// order (under the memtable switch lock).
    pub fn register(&self, position: ReplayPosition) -> Arc<FlushSignal> {
        let signal = Arc::new(FlushSignal {
            position,
            done: AtomicBool::new(false),
        });
        if let Ok(mut queue) = self.inner.queue.lock() {
            queue.push_back(Arc::clone(&signal));
        }
        signal
    }

    /// Marks a registered flush complete; the signal thread delivers it
    /// once every earlier registration has completed too.
    pub fn complete(&self, signal: &Arc<FlushSignal>) {
        signal.done.store(true, Ordering::Release);
        self.inner.wakeup.notify_all();
    }
}

impl Drop for PostFlushSignaller {
    fn drop(&mut self) {
        self.inner.shutdown.store(true, Ordering::Release);
        self.inner.wakeup.notify_all();
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}
