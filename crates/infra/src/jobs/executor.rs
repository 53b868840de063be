//! Execution contexts for job work units.

use std::io;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{mpsc, Arc};
use std::thread;

use parking_lot::Mutex;
use thiserror::Error;
use tracing::{debug, info, warn};

/// A work unit packaged for execution.
pub type Task = Box<dyn FnOnce() + Send + 'static>;

#[derive(Debug, Error)]
pub enum SpawnError {
    #[error("failed to spawn thread: {0}")]
    Io(#[from] io::Error),

    #[error("worker pool is shut down")]
    Closed,
}

/// Starts work units on an execution context independent of the caller.
pub trait JobSpawner: Send + Sync {
    fn spawn(&self, name: String, task: Task) -> Result<(), SpawnError>;

    /// Queue statistics, for contexts that keep a queue.
    fn pool_stats(&self) -> Option<PoolStats> {
        None
    }
}

impl<T: JobSpawner + ?Sized> JobSpawner for Arc<T> {
    fn spawn(&self, name: String, task: Task) -> Result<(), SpawnError> {
        (**self).spawn(name, task)
    }

    fn pool_stats(&self) -> Option<PoolStats> {
        (**self).pool_stats()
    }
}

/// One named OS thread per work unit. No upper bound on concurrency.
#[derive(Debug, Default, Clone, Copy)]
pub struct ThreadSpawner;

impl JobSpawner for ThreadSpawner {
    fn spawn(&self, name: String, task: Task) -> Result<(), SpawnError> {
        thread::Builder::new().name(name).spawn(task)?;
        Ok(())
    }
}

/// Worker pool runtime statistics.
#[derive(Debug, Clone, Copy, Default, serde::Serialize)]
pub struct PoolStats {
    pub workers: usize,
    pub queued: usize,
    pub tasks_processed: u64,
}

#[derive(Default)]
struct Counters {
    queued: AtomicUsize,
    processed: AtomicU64,
}

/// Fixed number of worker threads draining a shared queue.
///
/// Work units beyond the worker count wait in FIFO order. Dropping the pool
/// (or calling [`WorkerPool::shutdown`]) closes the queue; workers finish
/// what was already queued, then exit.
pub struct WorkerPool {
    name: String,
    sender: Mutex<Option<mpsc::Sender<(String, Task)>>>,
    workers: Mutex<Vec<thread::JoinHandle<()>>>,
    counters: Arc<Counters>,
}

impl WorkerPool {
    pub fn new(name: impl Into<String>, size: usize) -> Result<Self, SpawnError> {
        let name = name.into();
        let size = size.max(1);
        let (tx, rx) = mpsc::channel::<(String, Task)>();
        let rx = Arc::new(Mutex::new(rx));
        let counters = Arc::new(Counters::default());

        let mut workers = Vec::with_capacity(size);
        for index in 0..size {
            let rx = Arc::clone(&rx);
            let counters = Arc::clone(&counters);
            let worker_name = format!("{name}-{index}");
            let handle = thread::Builder::new()
                .name(worker_name.clone())
                .spawn(move || worker_loop(&worker_name, &rx, &counters))?;
            workers.push(handle);
        }

        info!(pool = %name, workers = size, "worker pool started");
        Ok(Self {
            name,
            sender: Mutex::new(Some(tx)),
            workers: Mutex::new(workers),
            counters,
        })
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            workers: self.workers.lock().len(),
            queued: self.counters.queued.load(Ordering::Relaxed),
            tasks_processed: self.counters.processed.load(Ordering::Relaxed),
        }
    }

    /// Stop accepting work and join the workers once the queue is drained.
    pub fn shutdown(&self) {
        let Some(sender) = self.sender.lock().take() else {
            return;
        };
        drop(sender);
        let workers = std::mem::take(&mut *self.workers.lock());
        for worker in workers {
            if worker.join().is_err() {
                warn!(pool = %self.name, "worker thread panicked");
            }
        }
        info!(pool = %self.name, "worker pool stopped");
    }
}

impl JobSpawner for WorkerPool {
    fn spawn(&self, name: String, task: Task) -> Result<(), SpawnError> {
        let sender = self.sender.lock();
        let sender = sender.as_ref().ok_or(SpawnError::Closed)?;
        self.counters.queued.fetch_add(1, Ordering::Relaxed);
        sender.send((name, task)).map_err(|_| {
            self.counters.queued.fetch_sub(1, Ordering::Relaxed);
            SpawnError::Closed
        })
    }

    fn pool_stats(&self) -> Option<PoolStats> {
        Some(self.stats())
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPool")
            .field("name", &self.name)
            .field("stats", &self.stats())
            .finish()
    }
}

fn worker_loop(worker: &str, rx: &Mutex<mpsc::Receiver<(String, Task)>>, counters: &Counters) {
    loop {
        // Hold the lock only while waiting for the next message.
        let next = rx.lock().recv();
        let Ok((task_name, task)) = next else {
            break;
        };
        counters.queued.fetch_sub(1, Ordering::Relaxed);
        debug!(worker, task = %task_name, "running task");
        // Work units catch their own panics; a stray one must not kill the worker.
        if std::panic::catch_unwind(std::panic::AssertUnwindSafe(task)).is_err() {
            warn!(worker, task = %task_name, "task panicked");
        }
        counters.processed.fetch_add(1, Ordering::Relaxed);
    }
    debug!(worker, "worker exiting");
}
