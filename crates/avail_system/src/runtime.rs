//! The runtime: registries, lifecycle, and the embedding API.
//!
//! A `Runtime` owns everything process-wide the source kept in global
//! singletons (the atom table, the bundle registry, nil and the booleans,
//! the chunk registry, the allocation budget) and hands collaborators
//! explicit handles instead. It implements the interpreter's bundle
//! resolution and the scheduler's fiber-driving callback.
//!
//! Embedders interact through:
//! - [`Runtime::create`] / [`Runtime::shutdown`],
//! - [`Runtime::run_function`] / [`Runtime::abort_fiber`],
//! - the method/bundle mutation API (gated by the loading phase),
//! - read-only introspection (fiber snapshots, continuation chains,
//!   single-stepping), and
//! - the serializer (see `serializer`).

use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use dashmap::DashMap;
use parking_lot::RwLock;
use tracing::debug;

use avail_base::{AvailObject, ErrorKind, VmError, VmResult};
use avail_data::{atom, number, values};
use avail_exec::interpreter::interrupt_bits;
use avail_exec::{
    run_continuation, run_function, BundleResolver, ChunkRegistry, Outcome, Resume,
    SuspendReason, VariableTracer, VmEnv,
};
use avail_kernel::{
    BundleTree, Definition, GrammaticalRestriction, MessageBundle, Method,
};

use crate::config::RuntimeConfig;
use crate::fiber::{
    ExecutionState, Fiber, FailureCallback, FiberId, ResumePlan, SuccessCallback, Work,
};
use crate::loader::{FileManager, ModuleLoader, ModuleRootResolver, StandardLoader};
use crate::scheduler::{FiberHost, Scheduler};
use crate::timer::TimerService;

/// Read-only view of one fiber, for debuggers.
#[derive(Debug, Clone)]
pub struct FiberSnapshot {
    pub id: FiberId,
    pub name: String,
    pub state: ExecutionState,
    pub priority: u8,
}

/// Read-only view of one reified frame.
#[derive(Debug, Clone)]
pub struct FrameSnapshot {
    /// Level One program counter.
    pub pc: usize,
    /// Stack pointer within the frame slots.
    pub stack_pointer: usize,
    /// Number of frame slots.
    pub slot_count: usize,
}

/// The Avail virtual machine.
pub struct Runtime {
    config: RuntimeConfig,
    scheduler: Scheduler,
    timers: TimerService,
    chunks: ChunkRegistry,
    atoms: DashMap<(String, String), AvailObject>,
    bundles: DashMap<usize, Arc<MessageBundle>>,
    fibers: DashMap<FiberId, Arc<Fiber>>,
    next_fiber_id: AtomicU64,
    allocation_budget: AtomicI64,
    loading_over: AtomicBool,
    shut_down: AtomicBool,
    nil: AvailObject,
    true_value: AvailObject,
    false_value: AvailObject,
    module_roots: Arc<dyn ModuleRootResolver>,
    file_manager: Arc<dyn FileManager>,
    self_weak: RwLock<Weak<Runtime>>,
}

impl Runtime {
    /// Creates a runtime with default configuration.
    pub fn create(
        module_roots: Arc<dyn ModuleRootResolver>,
        file_manager: Arc<dyn FileManager>,
    ) -> Arc<Runtime> {
        Self::create_with_config(module_roots, file_manager, RuntimeConfig::default())
    }

    /// Creates a runtime, constructing the singletons and starting the
    /// worker pool and timer source.
    pub fn create_with_config(
        module_roots: Arc<dyn ModuleRootResolver>,
        file_manager: Arc<dyn FileManager>,
        config: RuntimeConfig,
    ) -> Arc<Runtime> {
        let runtime = Arc::new(Runtime {
            allocation_budget: AtomicI64::new(config.allocation_budget),
            scheduler: Scheduler::new(),
            timers: TimerService::new(),
            chunks: ChunkRegistry::new(),
            atoms: DashMap::new(),
            bundles: DashMap::new(),
            fibers: DashMap::new(),
            next_fiber_id: AtomicU64::new(1),
            loading_over: AtomicBool::new(false),
            shut_down: AtomicBool::new(false),
            nil: values::nil(),
            true_value: values::boolean(true),
            false_value: values::boolean(false),
            module_roots,
            file_manager,
            self_weak: RwLock::new(Weak::new()),
            config,
        });
        *runtime.self_weak.write() = Arc::downgrade(&runtime);
        let host: Arc<dyn FiberHost> = runtime.clone();
        runtime
            .scheduler
            .start(Arc::downgrade(&host), runtime.config.effective_worker_threads());
        runtime
    }

    /// Stops workers and timers. Queued and sleeping fibers never resume.
    pub fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::SeqCst) {
            return;
        }
        debug!("runtime shutting down");
        self.scheduler.shutdown();
        self.timers.shutdown();
        // Sleeping fibers lose their wake-ups.
        for entry in self.fibers.iter() {
            let fiber = entry.value().clone();
            if fiber.state() == ExecutionState::Asleep && fiber.has_pending_wake_up() {
                fiber.cancel_wake_up();
                self.finish_aborted(&fiber, ErrorKind::TimerCancelled.into());
            }
        }
    }

    // -- singletons ---------------------------------------------------------

    pub fn nil(&self) -> AvailObject {
        self.nil.clone()
    }

    pub fn true_value(&self) -> AvailObject {
        self.true_value.clone()
    }

    pub fn false_value(&self) -> AvailObject {
        self.false_value.clone()
    }

    /// The Level Two chunk registry.
    pub fn chunks(&self) -> &ChunkRegistry {
        &self.chunks
    }

    // -- atoms and bundles --------------------------------------------------

    /// Interns an atom by issuing module and name: repeated requests return
    /// the identical atom.
    pub fn atom(&self, name: &str, module: Option<&str>) -> AvailObject {
        let key = (module.unwrap_or_default().to_string(), name.to_string());
        self.atoms
            .entry(key)
            .or_insert_with(|| atom::create(name, module))
            .value()
            .clone()
    }

    /// The bundle for the named message, creating the atom, method, and
    /// bundle on first use.
    pub fn method_bundle(
        &self,
        name: &str,
        module: Option<&str>,
    ) -> VmResult<Arc<MessageBundle>> {
        let atom_object = self.atom(name, module);
        if let Some(existing) = self.bundles.get(&atom_object.addr()) {
            return Ok(existing.value().clone());
        }
        let bundle = MessageBundle::new(atom_object.clone(), name, Method::new())?;
        // entry() keeps the first registration if another thread raced us.
        let canonical = self
            .bundles
            .entry(atom_object.addr())
            .or_insert(bundle)
            .value()
            .clone();
        Ok(canonical)
    }

    /// Adds a definition to the named method. Fails with `LoadingIsOver`
    /// once the loading phase has been closed.
    pub fn add_definition(
        &self,
        name: &str,
        module: Option<&str>,
        definition: Definition,
    ) -> VmResult<Arc<Definition>> {
        self.check_loading()?;
        self.method_bundle(name, module)?
            .method()
            .add_definition(definition)
    }

    /// Adds a grammatical restriction excluding the named bundles at one
    /// argument position of the parent message.
    pub fn add_grammatical_restriction(
        &self,
        parent: &str,
        module: Option<&str>,
        argument_index: usize,
        excluded: &[&str],
    ) -> VmResult<()> {
        self.check_loading()?;
        let parent_bundle = self.method_bundle(parent, module)?;
        let mut excluded_bundles = Vec::with_capacity(excluded.len());
        for name in excluded {
            excluded_bundles.push(self.method_bundle(name, module)?);
        }
        parent_bundle.add_restriction(GrammaticalRestriction::new(
            argument_index,
            excluded_bundles,
        ));
        Ok(())
    }

    /// A bundle tree spanning every registered bundle, for the parser.
    pub fn root_bundle_tree(&self) -> Arc<BundleTree> {
        let bundles: Vec<Arc<MessageBundle>> =
            self.bundles.iter().map(|e| e.value().clone()).collect();
        BundleTree::root_for(bundles)
    }

    /// Declares module loading finished; definition mutation now fails.
    pub fn set_loading_over(&self) {
        self.loading_over.store(true, Ordering::SeqCst);
    }

    fn check_loading(&self) -> VmResult<()> {
        if self.loading_over.load(Ordering::SeqCst) {
            return Err(ErrorKind::LoadingIsOver.into());
        }
        Ok(())
    }

    /// The module loader assembled from the embedder's resolver and file
    /// manager.
    pub fn module_loader(&self) -> impl ModuleLoader {
        StandardLoader::new(self.module_roots.clone(), self.file_manager.clone())
    }

    // -- execution ----------------------------------------------------------

    /// Starts a fiber running `function(args)`. The success callback
    /// receives the final value; the failure callback receives the error
    /// and its first-class value.
    pub fn run_function(
        &self,
        function: AvailObject,
        args: Vec<AvailObject>,
        success: SuccessCallback,
        failure: FailureCallback,
    ) -> VmResult<FiberId> {
        self.run_function_named(function, args, "unnamed fiber", success, failure)
    }

    /// As [`Runtime::run_function`], with an explicit fiber name.
    pub fn run_function_named(
        &self,
        function: AvailObject,
        args: Vec<AvailObject>,
        name: &str,
        success: SuccessCallback,
        failure: FailureCallback,
    ) -> VmResult<FiberId> {
        if self.shut_down.load(Ordering::SeqCst) {
            return Err(ErrorKind::NotSupported.into());
        }
        let id = self.next_fiber_id.fetch_add(1, Ordering::Relaxed);
        let fiber = Arc::new(Fiber::new(id, name, self.config.default_priority));
        fiber.set_callbacks(success, failure);
        fiber.set_work(Work::Start { function, args });
        self.fibers.insert(id, fiber.clone());
        debug!(fiber = id, name, "fiber created");
        self.scheduler.enqueue(fiber);
        Ok(id)
    }

    /// Requests cancellation: the fiber observes the flag at its next safe
    /// point; parked and sleeping fibers are woken to observe it at once.
    pub fn abort_fiber(&self, id: FiberId) {
        let Some(fiber) = self.fibers.get(&id).map(|f| f.value().clone()) else {
            return;
        };
        fiber.request_termination();
        let state = fiber.state();
        if matches!(
            state,
            ExecutionState::Parked
                | ExecutionState::Asleep
                | ExecutionState::Suspended
                | ExecutionState::Interrupted
                | ExecutionState::Unstarted
        ) {
            fiber.cancel_wake_up();
            self.scheduler.enqueue(fiber);
        }
    }

    /// The fiber record itself, for debuggers and tests.
    pub fn fiber(&self, id: FiberId) -> Option<Arc<Fiber>> {
        self.fibers.get(&id).map(|f| f.value().clone())
    }

    /// The fiber's final result, once Terminated.
    pub fn fiber_result(&self, id: FiberId) -> Option<AvailObject> {
        let fiber = self.fibers.get(&id)?;
        if fiber.state() == ExecutionState::Terminated {
            Some(fiber.result())
        } else {
            None
        }
    }

    // -- introspection ------------------------------------------------------

    /// Snapshots of every fiber the runtime has created.
    pub fn fiber_snapshots(&self) -> Vec<FiberSnapshot> {
        let mut out: Vec<FiberSnapshot> = self
            .fibers
            .iter()
            .map(|entry| {
                let fiber = entry.value();
                FiberSnapshot {
                    id: fiber.id(),
                    name: fiber.name().to_string(),
                    state: fiber.state(),
                    priority: fiber.priority(),
                }
            })
            .collect();
        out.sort_by_key(|snapshot| snapshot.id);
        out
    }

    /// The reified frames of a paused fiber, outermost last.
    pub fn continuation_frames(&self, id: FiberId) -> VmResult<Vec<FrameSnapshot>> {
        let fiber = self
            .fibers
            .get(&id)
            .ok_or_else(|| VmError::with_detail(ErrorKind::NotSupported, "no such fiber"))?;
        let mut frames = Vec::new();
        let mut cont = fiber.continuation();
        while !cont.is_nil() {
            frames.push(FrameSnapshot {
                pc: avail_exec::continuation::pc(&cont)?,
                stack_pointer: avail_exec::continuation::stack_pointer(&cont)?,
                slot_count: avail_exec::continuation::frame(&cont)?.len(),
            });
            cont = avail_exec::continuation::caller(&cont)?;
        }
        Ok(frames)
    }

    /// Executes exactly one instruction of a paused fiber on the calling
    /// thread, leaving it paused again (unless it completed).
    pub fn step_fiber(&self, id: FiberId) -> VmResult<()> {
        let fiber = self
            .fibers
            .get(&id)
            .map(|f| f.value().clone())
            .ok_or_else(|| VmError::with_detail(ErrorKind::NotSupported, "no such fiber"))?;
        if !matches!(
            fiber.state(),
            ExecutionState::Interrupted | ExecutionState::Suspended | ExecutionState::Parked
        ) {
            return Err(VmError::with_detail(
                ErrorKind::NotSupported,
                "fiber is not paused",
            ));
        }
        self.drive(&fiber, Some(1));
        Ok(())
    }

    /// Makes a parked or paused fiber runnable again.
    pub fn resume_fiber(&self, id: FiberId) {
        if let Some(fiber) = self.fibers.get(&id).map(|f| f.value().clone()) {
            if matches!(
                fiber.state(),
                ExecutionState::Parked
                    | ExecutionState::Interrupted
                    | ExecutionState::Suspended
            ) {
                fiber.override_resume(ResumePlan::WithValue(values::nil()));
                self.scheduler.enqueue(fiber);
            }
        }
    }

    /// Names and definition counts of every registered bundle.
    pub fn bundle_names(&self) -> Vec<(String, usize)> {
        let mut out: Vec<(String, usize)> = self
            .bundles
            .iter()
            .map(|entry| {
                let bundle = entry.value();
                (
                    bundle.name().to_string(),
                    bundle.method().definition_count(),
                )
            })
            .collect();
        out.sort();
        out
    }

    // -- fiber driving ------------------------------------------------------

    fn drive(&self, fiber: &Arc<Fiber>, fuel: Option<u64>) {
        if fiber.termination_requested() {
            self.finish_aborted(fiber, ErrorKind::FiberCancelled.into());
            return;
        }
        {
            // Tolerate duplicate wake-ups: only one claimant runs the fiber.
            let mut state = fiber.state_mutex().lock();
            if state.is_final() || *state == ExecutionState::Running {
                return;
            }
            *state = ExecutionState::Running;
        }
        let trace = fiber.general_flag(crate::fiber::general_flags::TRACE_VARIABLE_READS_BEFORE_WRITES)
            || fiber.general_flag(crate::fiber::general_flags::TRACE_VARIABLE_WRITES);
        let tracer: Option<&dyn VariableTracer> = if trace {
            Some(fiber.as_ref())
        } else {
            None
        };
        let env = VmEnv {
            resolver: self,
            chunks: &self.chunks,
            interrupt_flags: &fiber.interrupt_flags,
            tracer,
            allocation_budget: &self.allocation_budget,
            fiber_id: fiber.id(),
        };
        let outcome = match fiber.take_work() {
            Some(Work::Start { function, args }) => run_function(&env, &function, args, fuel),
            Some(Work::Continue {
                continuation,
                resume,
            }) => {
                let resume = match resume {
                    ResumePlan::Normal => Resume::Normal,
                    ResumePlan::WithValue(value) => Resume::WithValue(value),
                    ResumePlan::WithError(kind) => Resume::WithError(kind),
                };
                run_continuation(&env, &continuation, resume, fuel)
            }
            None => return,
        };
        // A fuel-limited drive is a debugger step: leave the fiber paused
        // instead of requeueing it.
        self.handle_outcome(fiber, outcome, fuel.is_none());
    }

    fn handle_outcome(&self, fiber: &Arc<Fiber>, outcome: Outcome, requeue: bool) {
        match outcome {
            Outcome::Returned(value) => self.finish_terminated(fiber, value),
            Outcome::Failed { error, value } => {
                fiber.set_result(value);
                self.finish_aborted(fiber, error);
            }
            Outcome::Interrupted { continuation } => {
                if fiber.termination_requested() {
                    self.finish_aborted(fiber, ErrorKind::FiberCancelled.into());
                    return;
                }
                fiber.interrupt_flags.fetch_and(
                    !interrupt_bits::REIFICATION_REQUESTED,
                    Ordering::SeqCst,
                );
                fiber.set_work(Work::Continue {
                    continuation,
                    resume: ResumePlan::Normal,
                });
                fiber.set_state(ExecutionState::Interrupted);
                if requeue {
                    self.scheduler.enqueue(fiber.clone());
                }
            }
            Outcome::Suspended {
                continuation,
                reason,
            } => match reason {
                SuspendReason::Sleep(duration) => {
                    fiber.set_work(Work::Continue {
                        continuation,
                        resume: ResumePlan::WithValue(values::nil()),
                    });
                    fiber.set_state(ExecutionState::Asleep);
                    let weak = self.self_weak.read().clone();
                    let sleeper = fiber.clone();
                    let handle = self.timers.schedule(duration, move || {
                        if let Some(runtime) = weak.upgrade() {
                            sleeper.discard_wake_up();
                            runtime.scheduler.enqueue(sleeper);
                        }
                    });
                    fiber.set_wake_up(handle);
                }
                SuspendReason::Join(target_id) => self.park_for_join(fiber, continuation, target_id),
                SuspendReason::Park => {
                    fiber.set_work(Work::Continue {
                        continuation,
                        resume: ResumePlan::WithValue(values::nil()),
                    });
                    fiber.set_state(ExecutionState::Parked);
                }
            },
        }
    }

    fn park_for_join(&self, fiber: &Arc<Fiber>, continuation: AvailObject, target_id: FiberId) {
        if target_id == fiber.id() {
            // Joining oneself would deadlock; fail the join at once.
            fiber.set_work(Work::Continue {
                continuation,
                resume: ResumePlan::WithError(ErrorKind::JoinFailed),
            });
            fiber.set_state(ExecutionState::Suspended);
            self.scheduler.enqueue(fiber.clone());
            return;
        }
        let Some(target) = self.fibers.get(&target_id).map(|f| f.value().clone()) else {
            // Unknown fiber: the join fails immediately.
            fiber.set_work(Work::Continue {
                continuation,
                resume: ResumePlan::WithError(ErrorKind::JoinFailed),
            });
            fiber.set_state(ExecutionState::Suspended);
            self.scheduler.enqueue(fiber.clone());
            return;
        };
        // Hold the target's state lock so completion cannot race the
        // joiner registration.
        let state = target.state_mutex().lock();
        match *state {
            ExecutionState::Terminated => {
                drop(state);
                fiber.set_work(Work::Continue {
                    continuation,
                    resume: ResumePlan::WithValue(target.result()),
                });
                fiber.set_state(ExecutionState::Suspended);
                self.scheduler.enqueue(fiber.clone());
            }
            ExecutionState::Aborted => {
                drop(state);
                fiber.set_work(Work::Continue {
                    continuation,
                    resume: ResumePlan::WithError(ErrorKind::JoinFailed),
                });
                fiber.set_state(ExecutionState::Suspended);
                self.scheduler.enqueue(fiber.clone());
            }
            _ => {
                target.joiners_mutex().lock().push(fiber.id());
                fiber.set_work(Work::Continue {
                    continuation,
                    resume: ResumePlan::Normal,
                });
                fiber.set_state(ExecutionState::Parked);
            }
        }
    }

    fn finish_terminated(&self, fiber: &Arc<Fiber>, value: AvailObject) {
        fiber.cancel_wake_up();
        {
            let mut state = fiber.state_mutex().lock();
            if state.is_final() {
                return;
            }
            *state = ExecutionState::Terminated;
        }
        fiber.set_result(value.clone());
        debug!(fiber = fiber.id(), "terminated");
        if let Some(callback) = fiber.take_success_callback() {
            callback(value.clone());
        }
        self.wake_joiners(fiber, Ok(value));
    }

    fn finish_aborted(&self, fiber: &Arc<Fiber>, error: VmError) {
        fiber.cancel_wake_up();
        {
            let mut state = fiber.state_mutex().lock();
            if state.is_final() {
                return;
            }
            *state = ExecutionState::Aborted;
        }
        fiber.set_failure(error.clone());
        debug!(fiber = fiber.id(), error = %error, "aborted");
        let value = number::from_u32(error.kind.code());
        if let Some(callback) = fiber.take_failure_callback() {
            callback(error, value);
        }
        self.wake_joiners(fiber, Err(ErrorKind::JoinFailed));
    }

    fn wake_joiners(&self, fiber: &Arc<Fiber>, delivery: Result<AvailObject, ErrorKind>) {
        let joiners: Vec<FiberId> = fiber.joiners_mutex().lock().drain(..).collect();
        for id in joiners {
            if let Some(joiner) = self.fibers.get(&id).map(|f| f.value().clone()) {
                match &delivery {
                    Ok(value) => joiner.override_resume(ResumePlan::WithValue(value.clone())),
                    Err(kind) => joiner.override_resume(ResumePlan::WithError(*kind)),
                }
                self.scheduler.enqueue(joiner);
            }
        }
    }
}

impl BundleResolver for Runtime {
    fn bundle_for_atom(&self, atom_object: &AvailObject) -> Option<Arc<MessageBundle>> {
        self.bundles
            .get(&atom_object.traverse().addr())
            .map(|b| b.value().clone())
    }
}

impl FiberHost for Runtime {
    fn run_slice(&self, fiber: Arc<Fiber>) {
        self.drive(&fiber, None);
    }
}
