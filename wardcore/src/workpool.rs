//! Worker threads draining a shared bounded ring. Tasks are boxed
//! `FnOnce() + Send` closures; `dispatch`/`multi_dispatch` mirror the
//! reference `work_dispatch`/`work_multi_dispatch` pair.

use crate::ring::BoundedRing;
use slog::Logger;
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};

pub type Work = Box<dyn FnOnce() + Send + 'static>;

struct Shared {
    ring: Mutex<BoundedRing<Work>>,
    condvar: Condvar,
    running: Mutex<bool>,
}

pub struct WorkPool {
    shared: Arc<Shared>,
    workers: Vec<JoinHandle<()>>,
    logger: Logger,
}

impl WorkPool {
    /// Default ring capacity, matching the reference `MAX_WORK`.
    pub const DEFAULT_CAPACITY: usize = 0xFFFF;

    /// Spawns `max(1, worker_count)` worker threads draining a ring of
    /// `capacity` slots. Callers typically pass `num_cpus::get().saturating_sub(1)`
    /// for `worker_count`.
    pub fn new(worker_count: usize, capacity: usize, logger: Logger) -> WorkPool {
        let worker_count = worker_count.max(1);
        let shared = Arc::new(Shared {
            ring: Mutex::new(BoundedRing::new(capacity)),
            condvar: Condvar::new(),
            running: Mutex::new(true),
        });

        let mut workers = Vec::with_capacity(worker_count);
        for id in 0..worker_count {
            let shared = Arc::clone(&shared);
            let worker_logger = logger.new(slog::o!("worker" => id));
            workers.push(thread::spawn(move || Self::worker_loop(shared, worker_logger)));
        }

        slog::info!(logger, "work pool started"; "workers" => worker_count, "capacity" => capacity);
        WorkPool { shared, workers, logger }
    }

    fn worker_loop(shared: Arc<Shared>, logger: Logger) {
        loop {
            let mut ring = shared.ring.lock().expect("work ring mutex poisoned");
            loop {
                if !*shared.running.lock().expect("running flag mutex poisoned") {
                    return;
                }
                if ring.is_empty() {
                    ring = shared
                        .condvar
                        .wait(ring)
                        .expect("work ring condvar wait poisoned");
                    continue;
                }
                break;
            }

            let task = ring.pop();
            drop(ring);

            match task {
                Some(task) => task(),
                None => {
                    if !*shared.running.lock().expect("running flag mutex poisoned") {
                        return;
                    }
                    slog::debug!(logger, "worker woke with nothing to do");
                }
            }
        }
    }

    /// Submits a single unit of work. Logs and drops it if the ring is full
    /// rather than blocking the caller.
    pub fn dispatch<F>(&self, work: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let mut ring = self.shared.ring.lock().expect("work ring mutex poisoned");
        if ring.push(Box::new(work)).is_err() {
            slog::error!(self.logger, "work ring buffer is at maximum capacity";
                "capacity" => ring.capacity());
            return;
        }
        self.shared.condvar.notify_one();
    }

    /// Submits `count` clones of the same work item, refusing (and logging)
    /// if it would overflow the ring.
    pub fn multi_dispatch<F>(&self, count: usize, work: F)
    where
        F: Fn() + Send + Clone + 'static,
    {
        let mut ring = self.shared.ring.lock().expect("work ring mutex poisoned");
        if ring.len() + count >= ring.capacity() {
            slog::error!(self.logger, "requested amount of work would overflow the ring";
                "requested" => count, "current" => ring.len());
            return;
        }
        for _ in 0..count {
            let item = work.clone();
            let _ = ring.push(Box::new(move || item()));
        }
        self.shared.condvar.notify_all();
    }

    /// Submits each item in `items` as its own unit of work.
    pub fn multi_dispatch_each<F>(&self, items: Vec<F>)
    where
        F: FnOnce() + Send + 'static,
    {
        let mut ring = self.shared.ring.lock().expect("work ring mutex poisoned");
        if ring.len() + items.len() >= ring.capacity() {
            slog::error!(self.logger, "requested amount of work would overflow the ring";
                "requested" => items.len(), "current" => ring.len());
            return;
        }
        for item in items {
            let _ = ring.push(Box::new(item));
        }
        self.shared.condvar.notify_all();
    }

    pub fn shutdown(mut self) {
        {
            let mut running = self.shared.running.lock().expect("running flag mutex poisoned");
            *running = false;
            self.shared.condvar.notify_all();
        }
        for worker in self.workers.drain(..) {
            let _ = worker.join();
        }
        slog::info!(self.logger, "work pool shut down");
    }
}
