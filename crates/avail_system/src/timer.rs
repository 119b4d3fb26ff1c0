//! The shared timer source.
//!
//! One dedicated thread owns a deadline heap. Sleeping and timeout-bearing
//! primitives schedule wake-up tasks through a command channel; every
//! handle supports cancellation, and cancelling a fired or unknown timer is
//! a harmless no-op. Shutting the service down drops all pending tasks.

use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use tracing::trace;

type Task = Box<dyn FnOnce() + Send>;

enum Command {
    Schedule {
        id: u64,
        deadline: Instant,
        task: Task,
    },
    Cancel(u64),
    Shutdown,
}

/// A cancellable scheduled wake-up.
pub struct TimerHandle {
    id: u64,
    sender: Sender<Command>,
}

impl TimerHandle {
    /// Retracts the wake-up if it has not fired yet.
    pub fn cancel(self) {
        let _ = self.sender.send(Command::Cancel(self.id));
    }
}

/// The shared timer thread.
pub struct TimerService {
    sender: Sender<Command>,
    next_id: AtomicU64,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl TimerService {
    pub fn new() -> TimerService {
        let (sender, receiver) = bounded::<Command>(256);
        let thread = std::thread::Builder::new()
            .name("avail-timer".to_string())
            .spawn(move || timer_loop(receiver))
            .ok();
        TimerService {
            sender,
            next_id: AtomicU64::new(1),
            thread: Mutex::new(thread),
        }
    }

    /// Schedules `task` to run after `delay` on the timer thread.
    pub fn schedule(&self, delay: Duration, task: impl FnOnce() + Send + 'static) -> TimerHandle {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let _ = self.sender.send(Command::Schedule {
            id,
            deadline: Instant::now() + delay,
            task: Box::new(task),
        });
        TimerHandle {
            id,
            sender: self.sender.clone(),
        }
    }

    /// Stops the timer thread, dropping pending tasks.
    pub fn shutdown(&self) {
        let _ = self.sender.send(Command::Shutdown);
        if let Some(thread) = self.thread.lock().take() {
            let _ = thread.join();
        }
    }
}

impl Default for TimerService {
    fn default() -> Self {
        TimerService::new()
    }
}

fn timer_loop(receiver: Receiver<Command>) {
    let mut deadlines: BinaryHeap<Reverse<(Instant, u64)>> = BinaryHeap::new();
    let mut tasks: FxHashMap<u64, Task> = FxHashMap::default();
    loop {
        // Fire everything due.
        let now = Instant::now();
        while let Some(Reverse((deadline, id))) = deadlines.peek().copied() {
            if deadline > now {
                break;
            }
            deadlines.pop();
            if let Some(task) = tasks.remove(&id) {
                trace!(timer = id, "firing");
                task();
            }
        }
        let command = match deadlines.peek() {
            Some(Reverse((deadline, _))) => {
                let timeout = deadline.saturating_duration_since(Instant::now());
                match receiver.recv_timeout(timeout) {
                    Ok(command) => command,
                    Err(RecvTimeoutError::Timeout) => continue,
                    Err(RecvTimeoutError::Disconnected) => return,
                }
            }
            None => match receiver.recv() {
                Ok(command) => command,
                Err(_) => return,
            },
        };
        match command {
            Command::Schedule { id, deadline, task } => {
                deadlines.push(Reverse((deadline, id)));
                tasks.insert(id, task);
            }
            Command::Cancel(id) => {
                tasks.remove(&id);
            }
            Command::Shutdown => return,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;
    use std::sync::Arc;

    #[test]
    fn timers_fire_in_order() {
        let service = TimerService::new();
        let (tx, rx) = bounded(4);
        let tx2 = tx.clone();
        service.schedule(Duration::from_millis(30), move || {
            let _ = tx2.send(2);
        });
        service.schedule(Duration::from_millis(5), move || {
            let _ = tx.send(1);
        });
        assert_eq!(rx.recv_timeout(Duration::from_secs(2)).unwrap(), 1);
        assert_eq!(rx.recv_timeout(Duration::from_secs(2)).unwrap(), 2);
        service.shutdown();
    }

    #[test]
    fn cancellation_prevents_firing() {
        let service = TimerService::new();
        let fired = Arc::new(AtomicBool::new(false));
        let probe = fired.clone();
        let handle = service.schedule(Duration::from_millis(40), move || {
            probe.store(true, Ordering::SeqCst);
        });
        handle.cancel();
        std::thread::sleep(Duration::from_millis(80));
        assert!(!fired.load(Ordering::SeqCst));
        service.shutdown();
    }
}
