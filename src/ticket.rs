//! Deferred request-processing tasks: tickets and the serialized worker.
//!
//! A [`Ticket`] tracks completion of exactly one deferred host task. The
//! [`AsyncWorker`] executes those tasks on a single dedicated thread, in
//! submission order; serialization is required because each task mutates
//! loader state (registry, dirty intervals, residency). A panicking task is
//! contained; failures travel through the loader's error fields instead.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::JoinHandle;

use crossbeam_channel::{unbounded, Sender};
use parking_lot::{Condvar, Mutex};
use tracing::warn;

use crate::gpu::{Event, GpuRuntime, Stream};

type Task = Box<dyn FnOnce() + Send + 'static>;

struct TicketInner {
    gpu: Arc<dyn GpuRuntime>,
    stream: Stream,
    done: Mutex<bool>,
    cv: Condvar,
}

impl TicketInner {
    fn mark_done(&self) {
        *self.done.lock() = true;
        self.cv.notify_all();
    }
}

/// Completion handle for one asynchronously scheduled drain-and-load task.
///
/// A default-constructed ticket is empty: it reports zero tasks and
/// `wait` returns immediately.
#[derive(Clone, Default)]
pub struct Ticket {
    inner: Option<Arc<TicketInner>>,
}

impl Ticket {
    /// Total scheduled tasks: 0 for an empty ticket, otherwise 1.
    pub fn num_tasks_total(&self) -> i32 {
        if self.inner.is_some() {
            1
        } else {
            0
        }
    }

    /// Remaining tasks: 1 until the task finishes, then 0. Monotone.
    pub fn num_tasks_remaining(&self) -> i32 {
        match &self.inner {
            Some(inner) => {
                if *inner.done.lock() {
                    0
                } else {
                    1
                }
            }
            None => 0,
        }
    }

    /// Block until the task finishes. If `event` is supplied, it is recorded
    /// on the ticket's stream after host work completes, so further GPU work
    /// can be chained on it.
    pub fn wait(&self, event: Option<Event>) {
        let Some(inner) = &self.inner else {
            return;
        };
        let mut done = inner.done.lock();
        while !*done {
            inner.cv.wait(&mut done);
        }
        drop(done);
        if let Some(event) = event {
            if let Err(err) = inner.gpu.record_event(event, inner.stream) {
                warn!(?err, "ticket: failed to record completion event");
            }
        }
    }
}

/// Single-threaded executor draining `(ticket, task)` pairs in order.
pub(crate) struct AsyncWorker {
    tx: Option<Sender<(Arc<TicketInner>, Task)>>,
    handle: Option<JoinHandle<()>>,
}

impl AsyncWorker {
    pub fn new() -> Self {
        let (tx, rx) = unbounded::<(Arc<TicketInner>, Task)>();
        let handle = std::thread::Builder::new()
            .name("demandtex-async".into())
            .spawn(move || {
                while let Ok((ticket, task)) = rx.recv() {
                    if catch_unwind(AssertUnwindSafe(task)).is_err() {
                        warn!("async task panicked; panic contained in worker");
                    }
                    ticket.mark_done();
                }
            })
            .expect("spawn async worker thread");
        Self {
            tx: Some(tx),
            handle: Some(handle),
        }
    }

    /// Schedule `task` and return the ticket observing its completion.
    pub fn submit<F: FnOnce() + Send + 'static>(
        &self,
        gpu: Arc<dyn GpuRuntime>,
        stream: Stream,
        task: F,
    ) -> Ticket {
        let inner = Arc::new(TicketInner {
            gpu,
            stream,
            done: Mutex::new(false),
            cv: Condvar::new(),
        });
        if let Some(tx) = &self.tx {
            if tx.send((Arc::clone(&inner), Box::new(task))).is_ok() {
                return Ticket { inner: Some(inner) };
            }
        }
        // worker already shut down; nothing will run
        inner.mark_done();
        Ticket { inner: Some(inner) }
    }
}

impl Drop for AsyncWorker {
    fn drop(&mut self) {
        // Closing the channel lets the worker finish queued tasks, then join.
        self.tx = None;
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gpu::mock::MockGpu;
    use crate::gpu::GpuRuntime as _;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn mock() -> Arc<MockGpu> {
        Arc::new(MockGpu::new())
    }

    #[test]
    fn empty_ticket_reports_zero_and_returns() {
        let ticket = Ticket::default();
        assert_eq!(ticket.num_tasks_total(), 0);
        assert_eq!(ticket.num_tasks_remaining(), 0);
        ticket.wait(None);
    }

    #[test]
    fn ticket_counts_transition() {
        let gpu = mock();
        let worker = AsyncWorker::new();
        let gate = Arc::new(Mutex::new(()));
        let held = gate.lock();

        let g = Arc::clone(&gate);
        let ticket = worker.submit(gpu.clone(), Stream::DEFAULT, move || {
            let _unblock = g.lock();
        });
        assert_eq!(ticket.num_tasks_total(), 1);
        assert_eq!(ticket.num_tasks_remaining(), 1);

        drop(held);
        ticket.wait(None);
        assert_eq!(ticket.num_tasks_remaining(), 0);
        assert_eq!(ticket.num_tasks_total(), 1);
    }

    #[test]
    fn wait_records_supplied_event() {
        let gpu = mock();
        let stream = gpu.create_stream(true).unwrap();
        let event = gpu.create_event().unwrap();
        let worker = AsyncWorker::new();
        let ticket = worker.submit(gpu.clone(), stream, || {});
        ticket.wait(Some(event));
        // event is still alive and was recorded without error
        gpu.synchronize_event(event).unwrap();
        gpu.destroy_event(event).unwrap();
        gpu.destroy_stream(stream).unwrap();
    }

    #[test]
    fn tasks_run_in_submission_order() {
        let gpu = mock();
        let worker = AsyncWorker::new();
        let order = Arc::new(Mutex::new(Vec::new()));
        let mut tickets = Vec::new();
        for i in 0..8 {
            let order = Arc::clone(&order);
            tickets.push(worker.submit(gpu.clone(), Stream::DEFAULT, move || {
                std::thread::sleep(Duration::from_millis(2));
                order.lock().push(i);
            }));
        }
        for ticket in &tickets {
            ticket.wait(None);
        }
        assert_eq!(*order.lock(), (0..8).collect::<Vec<_>>());
    }

    #[test]
    fn panicking_task_still_completes_ticket() {
        let gpu = mock();
        let worker = AsyncWorker::new();
        let ticket = worker.submit(gpu.clone(), Stream::DEFAULT, || panic!("boom"));
        ticket.wait(None);
        assert_eq!(ticket.num_tasks_remaining(), 0);

        // worker survives for the next task
        let ran = Arc::new(AtomicUsize::new(0));
        let r = Arc::clone(&ran);
        let ticket = worker.submit(gpu, Stream::DEFAULT, move || {
            r.fetch_add(1, Ordering::Relaxed);
        });
        ticket.wait(None);
        assert_eq!(ran.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn drop_finishes_queued_tasks() {
        let gpu = mock();
        let counter = Arc::new(AtomicUsize::new(0));
        let worker = AsyncWorker::new();
        for _ in 0..4 {
            let counter = Arc::clone(&counter);
            worker.submit(gpu.clone(), Stream::DEFAULT, move || {
                counter.fetch_add(1, Ordering::Relaxed);
            });
        }
        drop(worker);
        assert_eq!(counter.load(Ordering::Relaxed), 4);
    }
}
