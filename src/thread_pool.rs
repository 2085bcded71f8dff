//! Fixed-size worker pool for parallel host-side decoding.
//!
//! Tasks are nothrow from the pool's point of view: a panicking task is
//! caught inside the worker and never crosses the submit boundary. On drop,
//! tasks that have not started yet are discarded (but still accounted, so
//! `wait_all` cannot hang on a racing shutdown).

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use crossbeam_channel::{unbounded, Receiver, Sender};
use parking_lot::{Condvar, Mutex};
use tracing::warn;

type Job = Box<dyn FnOnce() + Send + 'static>;

struct PoolShared {
    stop: AtomicBool,
    /// Queued plus running tasks.
    outstanding: Mutex<usize>,
    idle: Condvar,
}

pub struct ThreadPool {
    tx: Option<Sender<Job>>,
    workers: Vec<JoinHandle<()>>,
    shared: Arc<PoolShared>,
}

impl ThreadPool {
    /// `num_threads == 0` means half the hardware concurrency; either way
    /// the count is capped at 16 (decode work saturates well before that).
    pub fn new(num_threads: usize) -> Self {
        let count = Self::resolve_thread_count(num_threads);
        let (tx, rx) = unbounded::<Job>();
        let shared = Arc::new(PoolShared {
            stop: AtomicBool::new(false),
            outstanding: Mutex::new(0),
            idle: Condvar::new(),
        });

        let workers = (0..count)
            .map(|i| {
                let rx: Receiver<Job> = rx.clone();
                let shared = Arc::clone(&shared);
                std::thread::Builder::new()
                    .name(format!("demandtex-worker-{i}"))
                    .spawn(move || worker_loop(rx, shared))
                    .expect("spawn worker thread")
            })
            .collect();

        Self {
            tx: Some(tx),
            workers,
            shared,
        }
    }

    fn resolve_thread_count(requested: usize) -> usize {
        let count = if requested == 0 {
            std::thread::available_parallelism()
                .map(|n| n.get() / 2)
                .unwrap_or(1)
                .max(1)
        } else {
            requested
        };
        count.min(16)
    }

    /// Enqueue a task and wake one worker.
    pub fn submit<F: FnOnce() + Send + 'static>(&self, task: F) {
        *self.shared.outstanding.lock() += 1;
        if let Some(tx) = &self.tx {
            if tx.send(Box::new(task)).is_err() {
                // channel closed mid-shutdown; undo the accounting
                let mut outstanding = self.shared.outstanding.lock();
                *outstanding -= 1;
                if *outstanding == 0 {
                    self.shared.idle.notify_all();
                }
            }
        }
    }

    /// Block until the queue is empty and no worker is mid-task.
    pub fn wait_all(&self) {
        let mut outstanding = self.shared.outstanding.lock();
        while *outstanding > 0 {
            self.shared.idle.wait(&mut outstanding);
        }
    }

    pub fn size(&self) -> usize {
        self.workers.len()
    }
}

impl Drop for ThreadPool {
    fn drop(&mut self) {
        self.shared.stop.store(true, Ordering::Release);
        self.tx = None; // close the channel so workers drain out
        for worker in self.workers.drain(..) {
            let _ = worker.join();
        }
    }
}

fn worker_loop(rx: Receiver<Job>, shared: Arc<PoolShared>) {
    while let Ok(job) = rx.recv() {
        // Tasks already queued when the pool is stopping are discarded,
        // not run; the accounting below still releases wait_all.
        if !shared.stop.load(Ordering::Acquire) {
            if catch_unwind(AssertUnwindSafe(job)).is_err() {
                warn!("worker task panicked; panic contained in pool");
            }
        }
        let mut outstanding = shared.outstanding.lock();
        *outstanding -= 1;
        if *outstanding == 0 {
            shared.idle.notify_all();
        }
    }
}
