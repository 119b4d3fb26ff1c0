//! Fibers: cooperatively scheduled execution threads.
//!
//! A fiber owns its execution state, priority, current (reified)
//! continuation, interrupt and trace flags, fiber-local and heritable
//! bindings, the set of fibers joined on it, its pending wake-up task, and
//! the success/failure callbacks the embedder registered.
//!
//! State machine:
//!
//! ```text
//! Unstarted ─▶ Running ─┬─▶ Suspended ──▶ Running
//!                       ├─▶ Interrupted ─▶ Running
//!                       ├─▶ Parked ──────▶ Running
//!                       ├─▶ Asleep ──────▶ Running
//!                       ├─▶ Terminated   (final)
//!                       └─▶ Aborted      (final)
//! ```
//!
//! Any non-final state may also transition to Aborted (cancellation).

use std::sync::atomic::{AtomicU32, Ordering};

use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use tracing::debug;

use avail_base::{AvailObject, ErrorKind, VmError, WeakAvailObject};
use avail_exec::VariableTracer;

use crate::timer::TimerHandle;

/// Runtime-scoped fiber identifier.
pub type FiberId = u64;

/// Where a fiber is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionState {
    /// Created but never scheduled.
    Unstarted,
    /// Currently executing on a worker thread.
    Running,
    /// Reified and runnable again (yield, debugger pause).
    Suspended,
    /// Stopped at a safe point by an interrupt flag; runnable.
    Interrupted,
    /// Waiting for another fiber (join) or an explicit resume.
    Parked,
    /// Waiting for a timer.
    Asleep,
    /// Completed normally; result available.
    Terminated,
    /// Completed abnormally; failure available.
    Aborted,
}

impl ExecutionState {
    /// Whether the fiber will never run again.
    pub fn is_final(self) -> bool {
        matches!(self, ExecutionState::Terminated | ExecutionState::Aborted)
    }

    /// The legal transitions of the state machine.
    pub fn may_transition_to(self, to: ExecutionState) -> bool {
        use ExecutionState::*;
        if self.is_final() {
            return false;
        }
        match (self, to) {
            (_, Aborted) => true,
            (Unstarted, Running) => true,
            (Running, Suspended | Interrupted | Parked | Asleep | Terminated) => true,
            (Suspended | Interrupted | Parked | Asleep, Running) => true,
            _ => false,
        }
    }
}

/// General (non-interrupt) flag bits.
pub mod general_flags {
    /// Record variables read before they are written, for transaction
    /// retry support.
    pub const TRACE_VARIABLE_READS_BEFORE_WRITES: u32 = 1;
    /// Record written variables.
    pub const TRACE_VARIABLE_WRITES: u32 = 2;
}

/// Invoked with the fiber's result when it terminates normally.
pub type SuccessCallback = Box<dyn FnOnce(AvailObject) + Send>;
/// Invoked with the error and its first-class value when a fiber aborts.
pub type FailureCallback = Box<dyn FnOnce(VmError, AvailObject) + Send>;

/// How a parked/asleep fiber should re-enter the interpreter.
pub enum ResumePlan {
    Normal,
    WithValue(AvailObject),
    WithError(ErrorKind),
}

/// The fiber's pending-work payload: either its initial invocation or a
/// reified continuation plus resume plan.
pub enum Work {
    Start {
        function: AvailObject,
        args: Vec<AvailObject>,
    },
    Continue {
        continuation: AvailObject,
        resume: ResumePlan,
    },
}

/// A cooperatively scheduled execution thread.
pub struct Fiber {
    id: FiberId,
    name: String,
    priority: AtomicU32,
    state: Mutex<ExecutionState>,
    work: Mutex<Option<Work>>,
    /// Interrupt flags sampled by the interpreter at safe points.
    pub interrupt_flags: AtomicU32,
    general_flags: AtomicU32,
    result: Mutex<AvailObject>,
    failure: Mutex<Option<VmError>>,
    joiners: Mutex<Vec<FiberId>>,
    wake_up: Mutex<Option<TimerHandle>>,
    locals: Mutex<FxHashMap<usize, (AvailObject, AvailObject)>>,
    heritable: Mutex<FxHashMap<usize, (AvailObject, AvailObject)>>,
    success_callback: Mutex<Option<SuccessCallback>>,
    failure_callback: Mutex<Option<FailureCallback>>,
    traced_reads: Mutex<Vec<WeakAvailObject>>,
    traced_writes: Mutex<Vec<WeakAvailObject>>,
}

impl Fiber {
    pub fn new(id: FiberId, name: impl Into<String>, priority: u8) -> Fiber {
        Fiber {
            id,
            name: name.into(),
            priority: AtomicU32::new(priority as u32),
            state: Mutex::new(ExecutionState::Unstarted),
            work: Mutex::new(None),
            interrupt_flags: AtomicU32::new(0),
            general_flags: AtomicU32::new(0),
            result: Mutex::new(AvailObject::nil()),
            failure: Mutex::new(None),
            joiners: Mutex::new(Vec::new()),
            wake_up: Mutex::new(None),
            locals: Mutex::new(FxHashMap::default()),
            heritable: Mutex::new(FxHashMap::default()),
            success_callback: Mutex::new(None),
            failure_callback: Mutex::new(None),
            traced_reads: Mutex::new(Vec::new()),
            traced_writes: Mutex::new(Vec::new()),
        }
    }

    pub fn id(&self) -> FiberId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn priority(&self) -> u8 {
        self.priority.load(Ordering::Relaxed) as u8
    }

    /// Takes effect at the fiber's next safe point, when the scheduler
    /// requeues it.
    pub fn set_priority(&self, priority: u8) {
        self.priority.store(priority as u32, Ordering::Relaxed);
    }

    pub fn state(&self) -> ExecutionState {
        *self.state.lock()
    }

    /// Transitions the state machine, panicking on illegal transitions;
    /// those are scheduler bugs, not runtime conditions.
    pub fn set_state(&self, to: ExecutionState) {
        let mut state = self.state.lock();
        assert!(
            state.may_transition_to(to),
            "fiber {}: illegal transition {:?} → {:?}",
            self.id,
            *state,
            to
        );
        debug!(fiber = self.id, from = ?*state, to = ?to, "state transition");
        *state = to;
    }

    /// The state lock, for transitions that must be atomic with other
    /// bookkeeping (joins, completion).
    pub(crate) fn state_mutex(&self) -> &Mutex<ExecutionState> {
        &self.state
    }

    // -- flags --------------------------------------------------------------

    pub fn request_termination(&self) {
        self.interrupt_flags.fetch_or(
            avail_exec::interpreter::interrupt_bits::TERMINATION_REQUESTED,
            Ordering::SeqCst,
        );
    }

    pub fn termination_requested(&self) -> bool {
        self.interrupt_flags.load(Ordering::SeqCst)
            & avail_exec::interpreter::interrupt_bits::TERMINATION_REQUESTED
            != 0
    }

    pub fn set_general_flag(&self, flag: u32) {
        self.general_flags.fetch_or(flag, Ordering::SeqCst);
    }

    pub fn general_flag(&self, flag: u32) -> bool {
        self.general_flags.load(Ordering::SeqCst) & flag != 0
    }

    // -- work ---------------------------------------------------------------

    pub fn set_work(&self, work: Work) {
        *self.work.lock() = Some(work);
    }

    pub fn take_work(&self) -> Option<Work> {
        self.work.lock().take()
    }

    /// Replaces the resume plan of parked work (join delivery, unpark).
    pub fn override_resume(&self, plan: ResumePlan) {
        if let Some(Work::Continue { resume, .. }) = &mut *self.work.lock() {
            *resume = plan;
        }
    }

    /// The reified continuation, for introspection; nil while running.
    pub fn continuation(&self) -> AvailObject {
        match &*self.work.lock() {
            Some(Work::Continue { continuation, .. }) => continuation.clone(),
            _ => AvailObject::nil(),
        }
    }

    // -- completion ---------------------------------------------------------

    pub fn set_callbacks(&self, success: SuccessCallback, failure: FailureCallback) {
        *self.success_callback.lock() = Some(success);
        *self.failure_callback.lock() = Some(failure);
    }

    pub(crate) fn take_success_callback(&self) -> Option<SuccessCallback> {
        self.success_callback.lock().take()
    }

    pub(crate) fn take_failure_callback(&self) -> Option<FailureCallback> {
        self.failure_callback.lock().take()
    }

    pub fn set_result(&self, value: AvailObject) {
        *self.result.lock() = value;
    }

    pub fn result(&self) -> AvailObject {
        self.result.lock().clone()
    }

    pub fn set_failure(&self, error: VmError) {
        *self.failure.lock() = Some(error);
    }

    pub fn failure(&self) -> Option<VmError> {
        self.failure.lock().clone()
    }

    pub(crate) fn joiners_mutex(&self) -> &Mutex<Vec<FiberId>> {
        &self.joiners
    }

    // -- timers -------------------------------------------------------------

    pub fn set_wake_up(&self, handle: TimerHandle) {
        *self.wake_up.lock() = Some(handle);
    }

    /// Cancels any pending wake-up; mandatory on completion.
    pub fn cancel_wake_up(&self) {
        if let Some(handle) = self.wake_up.lock().take() {
            handle.cancel();
        }
    }

    /// Drops the wake-up handle without cancelling. Used by the timer task
    /// itself after firing (cancelling from the timer thread would talk
    /// back to its own command channel).
    pub fn discard_wake_up(&self) {
        self.wake_up.lock().take();
    }

    pub fn has_pending_wake_up(&self) -> bool {
        self.wake_up.lock().is_some()
    }

    // -- fiber-local and heritable bindings ---------------------------------

    pub fn set_local(&self, key: &AvailObject, value: AvailObject) {
        self.locals
            .lock()
            .insert(key.addr(), (key.clone(), value));
    }

    pub fn local(&self, key: &AvailObject) -> Option<AvailObject> {
        self.locals.lock().get(&key.addr()).map(|(_, v)| v.clone())
    }

    pub fn set_heritable(&self, key: &AvailObject, value: AvailObject) {
        self.heritable
            .lock()
            .insert(key.addr(), (key.clone(), value));
    }

    pub fn heritable(&self, key: &AvailObject) -> Option<AvailObject> {
        self.heritable
            .lock()
            .get(&key.addr())
            .map(|(_, v)| v.clone())
    }

    /// Copies heritable bindings into a freshly forked fiber.
    pub fn inherit_from(&self, parent: &Fiber) {
        let parent_heritable = parent.heritable.lock().clone();
        *self.heritable.lock() = parent_heritable;
    }

    // -- variable traces ----------------------------------------------------

    /// Variables read before being written, as weak handles.
    pub fn traced_reads(&self) -> Vec<AvailObject> {
        self.traced_reads
            .lock()
            .iter()
            .filter_map(WeakAvailObject::upgrade)
            .collect()
    }

    pub fn traced_writes(&self) -> Vec<AvailObject> {
        self.traced_writes
            .lock()
            .iter()
            .filter_map(WeakAvailObject::upgrade)
            .collect()
    }

    pub fn clear_traces(&self) {
        self.traced_reads.lock().clear();
        self.traced_writes.lock().clear();
    }
}

impl VariableTracer for Fiber {
    fn record_read_before_write(&self, variable: &AvailObject) {
        if !self.general_flag(general_flags::TRACE_VARIABLE_READS_BEFORE_WRITES) {
            return;
        }
        let addr = variable.addr();
        let written = self
            .traced_writes
            .lock()
            .iter()
            .any(|w| w.addr() == addr);
        if written {
            return;
        }
        let mut reads = self.traced_reads.lock();
        if !reads.iter().any(|r| r.addr() == addr) {
            reads.push(variable.downgrade());
        }
    }

    fn record_write(&self, variable: &AvailObject) {
        if !self.general_flag(general_flags::TRACE_VARIABLE_WRITES)
            && !self.general_flag(general_flags::TRACE_VARIABLE_READS_BEFORE_WRITES)
        {
            return;
        }
        let mut writes = self.traced_writes.lock();
        let addr = variable.addr();
        if !writes.iter().any(|w| w.addr() == addr) {
            writes.push(variable.downgrade());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use avail_data::{types, variable};

    #[test]
    fn lifecycle_transitions() {
        let fiber = Fiber::new(1, "test", 128);
        assert_eq!(fiber.state(), ExecutionState::Unstarted);
        fiber.set_state(ExecutionState::Running);
        fiber.set_state(ExecutionState::Asleep);
        fiber.set_state(ExecutionState::Running);
        fiber.set_state(ExecutionState::Terminated);
        assert!(fiber.state().is_final());
    }

    #[test]
    #[should_panic]
    fn final_states_are_sticky() {
        let fiber = Fiber::new(2, "done", 128);
        fiber.set_state(ExecutionState::Aborted);
        fiber.set_state(ExecutionState::Running);
    }

    #[test]
    fn any_live_state_may_abort() {
        for intermediate in [
            ExecutionState::Running,
            ExecutionState::Parked,
            ExecutionState::Asleep,
        ] {
            let fiber = Fiber::new(3, "abortable", 128);
            fiber.set_state(ExecutionState::Running);
            if intermediate != ExecutionState::Running {
                fiber.set_state(intermediate);
            }
            fiber.set_state(ExecutionState::Aborted);
        }
    }

    #[test]
    fn read_before_write_tracing_honors_flags_and_order() {
        let fiber = Fiber::new(4, "tracer", 128);
        let read_first = variable::new(types::any());
        let written_first = variable::new(types::any());

        // Flag off: nothing recorded.
        fiber.record_read_before_write(&read_first);
        assert!(fiber.traced_reads().is_empty());

        fiber.set_general_flag(general_flags::TRACE_VARIABLE_READS_BEFORE_WRITES);
        fiber.record_write(&written_first);
        fiber.record_read_before_write(&written_first);
        fiber.record_read_before_write(&read_first);
        let reads = fiber.traced_reads();
        assert_eq!(reads.len(), 1);
        assert!(reads[0].same_object(&read_first));
    }

    #[test]
    fn traces_are_weak() {
        let fiber = Fiber::new(5, "weak", 128);
        fiber.set_general_flag(general_flags::TRACE_VARIABLE_READS_BEFORE_WRITES);
        {
            let transient = variable::new(types::any());
            fiber.record_read_before_write(&transient);
            assert_eq!(fiber.traced_reads().len(), 1);
        }
        assert!(fiber.traced_reads().is_empty());
    }

    #[test]
    fn heritable_bindings_copy_to_children() {
        let parent = Fiber::new(6, "parent", 128);
        let key = avail_data::atom::create("setting", None);
        parent.set_heritable(&key, avail_data::number::from_i64(9));
        let child = Fiber::new(7, "child", 128);
        child.inherit_from(&parent);
        assert!(child.heritable(&key).is_some());
        assert!(child.local(&key).is_none());
    }
}
