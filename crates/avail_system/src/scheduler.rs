//! The priority scheduler.
//!
//! A small pool of OS threads (sized to hardware parallelism) multiplexes
//! the runnable fibers. Each worker repeatedly picks a fiber (usually from
//! the highest non-empty priority queue, but every
//! [`ANTI_STARVATION_PERIOD`]th dispatch from the lowest instead, so
//! low-priority fibers always make progress) and asks the host to drive it
//! until its next outcome. Fibers migrate between threads only at those
//! boundaries.

use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::thread::JoinHandle;

use parking_lot::{Condvar, Mutex};
use tracing::debug;

use crate::fiber::Fiber;

/// One in this many dispatches services the lowest priority first.
const ANTI_STARVATION_PERIOD: u64 = 61;

/// The runtime side of the scheduler: drives one fiber until it yields,
/// suspends, completes, or aborts.
pub trait FiberHost: Send + Sync {
    fn run_slice(&self, fiber: Arc<Fiber>);
}

#[derive(Default)]
struct ReadyQueues {
    queues: BTreeMap<u8, VecDeque<Arc<Fiber>>>,
    dispatches: u64,
}

impl ReadyQueues {
    fn push(&mut self, fiber: Arc<Fiber>) {
        self.queues
            .entry(fiber.priority())
            .or_default()
            .push_back(fiber);
    }

    fn pop(&mut self) -> Option<Arc<Fiber>> {
        self.dispatches += 1;
        let from_lowest = self.dispatches % ANTI_STARVATION_PERIOD == 0;
        let key = if from_lowest {
            self.queues.keys().next().copied()?
        } else {
            self.queues.keys().next_back().copied()?
        };
        let queue = self.queues.get_mut(&key)?;
        let fiber = queue.pop_front();
        if queue.is_empty() {
            self.queues.remove(&key);
        }
        fiber
    }
}

struct SchedulerInner {
    ready: Mutex<ReadyQueues>,
    available: Condvar,
    shutdown: AtomicBool,
    host: Mutex<Weak<dyn FiberHost>>,
}

/// The worker pool plus its run queues.
pub struct Scheduler {
    inner: Arc<SchedulerInner>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl Scheduler {
    pub fn new() -> Scheduler {
        let unbound: Weak<dyn FiberHost> = Weak::<Never>::new();
        Scheduler {
            inner: Arc::new(SchedulerInner {
                ready: Mutex::new(ReadyQueues::default()),
                available: Condvar::new(),
                shutdown: AtomicBool::new(false),
                host: Mutex::new(unbound),
            }),
            workers: Mutex::new(Vec::new()),
        }
    }

    /// Binds the host and spawns the worker pool. Called once, after the
    /// runtime owning this scheduler is fully constructed.
    pub fn start(&self, host: Weak<dyn FiberHost>, worker_threads: usize) {
        *self.inner.host.lock() = host;
        let mut workers = self.workers.lock();
        for index in 0..worker_threads.max(1) {
            let inner = self.inner.clone();
            let handle = std::thread::Builder::new()
                .name(format!("avail-worker-{}", index))
                .spawn(move || worker_loop(inner));
            if let Ok(handle) = handle {
                workers.push(handle);
            }
        }
        debug!(workers = workers.len(), "scheduler started");
    }

    /// Makes a fiber runnable.
    pub fn enqueue(&self, fiber: Arc<Fiber>) {
        if self.inner.shutdown.load(Ordering::SeqCst) {
            return;
        }
        self.inner.ready.lock().push(fiber);
        self.inner.available.notify_one();
    }

    /// Stops the workers. Queued fibers are dropped.
    pub fn shutdown(&self) {
        self.inner.shutdown.store(true, Ordering::SeqCst);
        self.inner.available.notify_all();
        let mut workers = self.workers.lock();
        for worker in workers.drain(..) {
            let _ = worker.join();
        }
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Scheduler::new()
    }
}

/// Placeholder host type for the unbound state.
struct Never;
impl FiberHost for Never {
    fn run_slice(&self, _fiber: Arc<Fiber>) {}
}

fn worker_loop(inner: Arc<SchedulerInner>) {
    loop {
        let fiber = {
            let mut ready = inner.ready.lock();
            loop {
                if inner.shutdown.load(Ordering::SeqCst) {
                    return;
                }
                if let Some(fiber) = ready.pop() {
                    break fiber;
                }
                inner.available.wait(&mut ready);
            }
        };
        let host = inner.host.lock().clone();
        match host.upgrade() {
            Some(host) => host.run_slice(fiber),
            None => return,
        }
    }
}
