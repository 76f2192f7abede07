//! Deadline scheduler: a single timer thread firing entries in
//! earliest-deadline-first order, with O(log n) cancellation from any
//! thread. Used by the connection runtime for read/write timeouts and by
//! protocol bodies for delayed work.
//!
//! Timer callbacks should hold only a weak reference to whatever they
//! guard (typically a connection) so the scheduler and its owner never
//! form an ownership cycle; the scheduler itself is agnostic to that and
//! just stores a boxed closure.

use crate::avlset::{Handle as SetHandle, OrderedSet};
use slog::Logger;
use std::collections::HashMap;
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

pub type Task = Box<dyn FnOnce() + Send + 'static>;

/// A stable reference to a pending timed entry. Cancellation is idempotent:
/// cancelling twice, or cancelling after the entry has already fired, is a
/// no-op.
#[derive(Debug, Copy, Clone)]
pub struct SchedHandle {
    set_handle: SetHandle,
    seq: u64,
}

#[derive(Debug, Copy, Clone, PartialEq)]
struct EntryKey {
    deadline: Instant,
    seq: u64,
}

impl PartialOrd for EntryKey {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some((self.deadline, self.seq).cmp(&(other.deadline, other.seq)))
    }
}

struct Inner {
    entries: OrderedSet<EntryKey>,
    tasks: HashMap<u64, Task>,
    next_seq: u64,
    shutdown: bool,
}

pub struct Scheduler {
    inner: Mutex<Inner>,
    condvar: Condvar,
    logger: Logger,
    timer_thread: Mutex<Option<JoinHandle<()>>>,
}

impl Scheduler {
    /// Starts the scheduler and its single timer thread. `capacity` bounds
    /// the number of entries outstanding at once.
    pub fn start(capacity: usize, logger: Logger) -> Arc<Scheduler> {
        let scheduler = Arc::new(Scheduler {
            inner: Mutex::new(Inner {
                entries: OrderedSet::new(capacity),
                tasks: HashMap::new(),
                next_seq: 0,
                shutdown: false,
            }),
            condvar: Condvar::new(),
            logger,
            timer_thread: Mutex::new(None),
        });

        let worker = Arc::clone(&scheduler);
        let handle = thread::spawn(move || worker.timer_loop());
        *scheduler.timer_thread.lock().expect("timer thread slot poisoned") = Some(handle);
        scheduler
    }

    /// Arms `task` to run after `delay`. Returns `None` if the entry arena
    /// is exhausted.
    pub fn add<F>(&self, delay: Duration, task: F) -> Option<SchedHandle>
    where
        F: FnOnce() + Send + 'static,
    {
        let mut inner = self.inner.lock().expect("scheduler mutex poisoned");
        let seq = inner.next_seq;
        inner.next_seq += 1;
        let deadline = Instant::now() + delay;

        let set_handle = inner.entries.insert(EntryKey { deadline, seq })?;
        inner.tasks.insert(seq, Box::new(task));
        drop(inner);

        self.condvar.notify_one();
        Some(SchedHandle { set_handle, seq })
    }

    /// Cancels a pending entry. Safe to call concurrently with the entry
    /// firing: if the timer thread wins the race, this becomes a no-op.
    pub fn cancel(&self, handle: SchedHandle) {
        let mut inner = self.inner.lock().expect("scheduler mutex poisoned");
        // The seq-keyed task map is never subject to index reuse (unlike
        // the ordered set's arena slots), so using it to gate the set
        // removal avoids acting on a stale handle whose slot was recycled
        // by an unrelated insert after this entry fired.
        if inner.tasks.remove(&handle.seq).is_some() {
            inner.entries.remove(handle.set_handle);
        }
    }

    /// Alias for [`Scheduler::cancel`], matching the reference API's
    /// `pop` naming.
    pub fn pop(&self, handle: SchedHandle) {
        self.cancel(handle);
    }

    fn timer_loop(&self) {
        loop {
            let mut inner = self.inner.lock().expect("scheduler mutex poisoned");
            if inner.shutdown {
                return;
            }

            let earliest = inner.entries.begin().map(|h| (h, *inner.entries.get(h).unwrap()));

            match earliest {
                None => {
                    let _ = self
                        .condvar
                        .wait(inner)
                        .expect("scheduler condvar wait poisoned");
                }
                Some((set_handle, entry)) => {
                    let now = Instant::now();
                    if entry.deadline > now {
                        let _ = self
                            .condvar
                            .wait_timeout(inner, entry.deadline - now)
                            .expect("scheduler condvar wait poisoned");
                    } else {
                        inner.entries.remove(set_handle);
                        let task = inner.tasks.remove(&entry.seq);
                        drop(inner);

                        if let Some(task) = task {
                            task();
                        }
                    }
                }
            }
        }
    }

    /// Stops the timer thread and joins it. Entries still pending are
    /// dropped without running.
    pub fn shutdown(&self) {
        {
            let mut inner = self.inner.lock().expect("scheduler mutex poisoned");
            inner.shutdown = true;
        }
        self.condvar.notify_all();
        if let Some(handle) = self.timer_thread.lock().expect("timer thread slot poisoned").take() {
            let _ = handle.join();
        }
        slog::info!(self.logger, "scheduler shut down");
    }
}
