//! The Level One interpreter (with Level Two fast paths).
//!
//! One conceptual interpreter steps the current fiber's continuation.
//! Native [`Frame`]s are the hot path; any operation needing first-class
//! access to the current continuation (push-label, suspension, interrupts,
//! the debugger's fuel limit) *reifies*, materializing the native frames
//! into continuation objects. Resumption materializes only the top
//! continuation back into a native frame and leaves the rest of the chain
//! reified until control returns into it.
//!
//! Safe points are method calls, returns, applies, and the explicit
//! interrupt-check instruction. At each, the interpreter samples the
//! fiber's interrupt flags and, when set, hands a reified continuation back
//! to the scheduler.
//!
//! Exception handling is frame-marker based: the catch primitive's frame is
//! recognized by its primitive number during unwinding, surviving
//! reification because the marker is the code itself, not native state.

use std::sync::atomic::{AtomicI64, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tracing::trace;

use avail_base::{AvailObject, ErrorKind, Kind, VmError, VmResult};
use avail_data::{map, number, set, tuple, types, values, variable};
use avail_kernel::{Definition, MessageBundle};

use crate::chunk::{ChunkOp, ChunkRegistry};
use crate::continuation;
use crate::nybblecodes::{self, L1Op};
use crate::primitive::{self, PrimResult};
use crate::raw_function;

/// Interrupt flag bits.
pub mod interrupt_bits {
    /// The fiber must observe cancellation at the next safe point.
    pub const TERMINATION_REQUESTED: u32 = 1;
    /// The scheduler wants the fiber to yield (priority change, debugger).
    pub const REIFICATION_REQUESTED: u32 = 2;
}

/// Resolves send-site atoms to bundles; implemented by the runtime.
pub trait BundleResolver: Send + Sync {
    fn bundle_for_atom(&self, atom: &AvailObject) -> Option<Arc<MessageBundle>>;
}

/// Receives variable accesses when the fiber traces reads-before-writes.
pub trait VariableTracer: Send + Sync {
    fn record_read_before_write(&self, variable: &AvailObject);
    fn record_write(&self, variable: &AvailObject);
}

/// Everything the interpreter needs from the fiber and runtime.
pub struct VmEnv<'a> {
    pub resolver: &'a dyn BundleResolver,
    pub chunks: &'a ChunkRegistry,
    pub interrupt_flags: &'a AtomicU32,
    pub tracer: Option<&'a dyn VariableTracer>,
    pub allocation_budget: &'a AtomicI64,
    pub fiber_id: u64,
}

/// Why a fiber stopped running before completion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SuspendReason {
    /// Sleep for at least this long.
    Sleep(Duration),
    /// Park until the given fiber terminates.
    Join(u64),
    /// Park until explicitly resumed.
    Park,
}

/// The result of driving a fiber's continuation.
pub enum Outcome {
    /// The fiber's root function returned this value.
    Returned(AvailObject),
    /// A primitive suspended the fiber; resume the continuation later.
    Suspended {
        continuation: AvailObject,
        reason: SuspendReason,
    },
    /// An interrupt flag (or the fuel limit) was observed at a safe point.
    Interrupted { continuation: AvailObject },
    /// An error reached the fiber root unhandled.
    Failed {
        error: VmError,
        /// The first-class error value, for the failure callback.
        value: AvailObject,
    },
}

/// How to re-enter a suspended continuation.
pub enum Resume {
    /// Continue exactly where the fiber left off.
    Normal,
    /// Push a value first (a primitive's delivered result).
    WithValue(AvailObject),
    /// Raise an error at the resumption point (join failure, cancelled
    /// timer).
    WithError(ErrorKind),
}

enum Mode {
    L1,
    L2(Arc<crate::chunk::Chunk>),
}

struct Frame {
    function: AvailObject,
    code: AvailObject,
    nybbles: Vec<u8>,
    mode: Mode,
    pc: usize,
    slots: Vec<AvailObject>,
    stack_pointer: usize,
    num_args: usize,
    num_locals: usize,
}

impl Frame {
    fn for_invocation(
        function: AvailObject,
        code: AvailObject,
        mode: Mode,
        args: Vec<AvailObject>,
    ) -> VmResult<Frame> {
        let num_args = raw_function::num_args(&code)?;
        let num_locals = raw_function::num_locals(&code)?;
        let total = raw_function::frame_slots(&code)?;
        let nybbles = raw_function::nybblecodes(&code)?;
        let mut slots = args;
        for _ in 0..num_locals {
            slots.push(variable::new(types::any()));
        }
        slots.resize_with(total, AvailObject::nil);
        Ok(Frame {
            function,
            code,
            nybbles,
            mode,
            pc: 0,
            stack_pointer: total,
            slots,
            num_args,
            num_locals,
        })
    }

    fn from_continuation(cont: &AvailObject, chunks: &ChunkRegistry) -> VmResult<Frame> {
        let function = continuation::function(cont)?;
        let code = raw_function::function_code(&function)?;
        let nybbles = raw_function::nybblecodes(&code)?;
        let chunk_id = continuation::chunk_id(cont)?;
        let (mode, pc) = match chunk_id {
            0 => (Mode::L1, continuation::pc(cont)?),
            id => match chunks.get(id).filter(|c| c.is_valid()) {
                Some(chunk) => (Mode::L2(chunk), continuation::chunk_offset(cont)?),
                None => (Mode::L1, continuation::pc(cont)?),
            },
        };
        let slots = continuation::frame(cont)?;
        Ok(Frame {
            num_args: raw_function::num_args(&code)?,
            num_locals: raw_function::num_locals(&code)?,
            function,
            code,
            nybbles,
            mode,
            pc,
            stack_pointer: continuation::stack_pointer(cont)?,
            slots,
        })
    }

    fn to_continuation(&self, caller: AvailObject) -> AvailObject {
        let (l1_pc, chunk_id, chunk_offset) = match &self.mode {
            Mode::L1 => (self.pc, 0, 0),
            Mode::L2(chunk) => {
                let l1_pc = chunk
                    .ops()
                    .get(self.pc)
                    .map(|op| op.l1_pc())
                    .unwrap_or(self.nybbles.len());
                (l1_pc, chunk.id(), self.pc)
            }
        };
        continuation::new(
            caller,
            self.function.clone(),
            l1_pc,
            self.stack_pointer,
            chunk_id,
            chunk_offset,
            self.slots.clone(),
        )
    }

    fn push(&mut self, value: AvailObject) {
        self.stack_pointer -= 1;
        debug_assert!(self.stack_pointer >= self.num_args + self.num_locals);
        self.slots[self.stack_pointer] = value;
    }

    fn pop(&mut self) -> AvailObject {
        let value = std::mem::replace(&mut self.slots[self.stack_pointer], AvailObject::nil());
        self.stack_pointer += 1;
        value
    }

    /// Pops `n` values, returned in push order (deepest first).
    fn pop_n(&mut self, n: usize) -> Vec<AvailObject> {
        let mut out = Vec::with_capacity(n);
        for i in 0..n {
            let index = self.stack_pointer + n - 1 - i;
            out.push(std::mem::replace(&mut self.slots[index], AvailObject::nil()));
        }
        self.stack_pointer += n;
        out
    }

    fn top_or_nil(&self) -> AvailObject {
        if self.stack_pointer < self.slots.len() {
            self.slots[self.stack_pointer].clone()
        } else {
            AvailObject::nil()
        }
    }

    fn at_end(&self) -> bool {
        match &self.mode {
            Mode::L1 => self.pc >= self.nybbles.len(),
            Mode::L2(chunk) => self.pc >= chunk.ops().len(),
        }
    }
}

enum Step {
    Continue,
    Done(Outcome),
}

enum Fetched {
    Op(L1Op, usize),
    Direct {
        function: AvailObject,
        num_args: usize,
        next_pc: usize,
    },
    Deopt {
        l1_pc: usize,
    },
}

struct Interpreter<'a> {
    env: &'a VmEnv<'a>,
    frames: Vec<Frame>,
    base_caller: AvailObject,
}

/// Runs `function(args)` to an [`Outcome`]. `fuel` bounds the number of
/// executed instructions (debugger stepping); `None` runs unbounded.
pub fn run_function(
    env: &VmEnv,
    function: &AvailObject,
    args: Vec<AvailObject>,
    fuel: Option<u64>,
) -> Outcome {
    let mut interpreter = Interpreter {
        env,
        frames: Vec::new(),
        base_caller: AvailObject::nil(),
    };
    let first = match interpreter.invoke(function.clone(), args) {
        Ok(step) => step,
        Err(error) => interpreter.raise(error),
    };
    interpreter.execute(first, fuel)
}

/// Resumes a reified continuation.
pub fn run_continuation(
    env: &VmEnv,
    continuation: &AvailObject,
    resume: Resume,
    fuel: Option<u64>,
) -> Outcome {
    let continuation = continuation.traverse();
    if continuation.kind() != Kind::Continuation {
        // A nil continuation is a completed fiber; deliver the injection.
        return match resume {
            Resume::WithValue(value) => Outcome::Returned(value),
            Resume::Normal => Outcome::Returned(values::nil()),
            Resume::WithError(kind) => Outcome::Failed {
                error: kind.into(),
                value: number::from_u32(kind.code()),
            },
        };
    }
    let mut interpreter = Interpreter {
        env,
        frames: Vec::new(),
        base_caller: continuation,
    };
    let first = match interpreter.resume_top(resume) {
        Ok(step) => step,
        Err(error) => interpreter.raise(error),
    };
    interpreter.execute(first, fuel)
}

impl<'a> Interpreter<'a> {
    fn execute(mut self, mut step: Step, mut fuel: Option<u64>) -> Outcome {
        loop {
            match step {
                Step::Done(outcome) => return outcome,
                Step::Continue => {}
            }
            step = match self.step(&mut fuel) {
                Ok(next) => next,
                Err(error) => self.raise(error),
            };
        }
    }

    fn resume_top(&mut self, resume: Resume) -> VmResult<Step> {
        let cont = std::mem::replace(&mut self.base_caller, AvailObject::nil());
        self.base_caller = continuation::caller(&cont)?;
        self.frames.push(Frame::from_continuation(&cont, self.env.chunks)?);
        match resume {
            Resume::Normal => Ok(Step::Continue),
            Resume::WithValue(value) => {
                if let Some(frame) = self.frames.last_mut() {
                    frame.push(value);
                }
                Ok(Step::Continue)
            }
            Resume::WithError(kind) => Ok(self.raise(kind.into())),
        }
    }

    fn reify(&mut self) -> AvailObject {
        let mut cont = std::mem::replace(&mut self.base_caller, AvailObject::nil());
        for frame in self.frames.drain(..) {
            cont = frame.to_continuation(cont);
        }
        cont
    }

    fn snapshot(&self) -> AvailObject {
        let mut cont = self.base_caller.clone();
        for frame in &self.frames {
            cont = frame.to_continuation(cont);
        }
        cont
    }

    fn interrupted(&self) -> bool {
        self.env.interrupt_flags.load(Ordering::SeqCst) != 0
    }

    fn charge(&self, amount: usize) -> VmResult<()> {
        let amount = amount.max(1) as i64;
        let before = self.env.allocation_budget.fetch_sub(amount, Ordering::Relaxed);
        if before - amount < 0 {
            return Err(ErrorKind::MemoryExhausted.into());
        }
        Ok(())
    }

    fn fetch(&mut self) -> VmResult<Option<Fetched>> {
        let Some(frame) = self.frames.last_mut() else {
            return Ok(None);
        };
        match &frame.mode {
            Mode::L1 => {
                let (op, next_pc) = nybblecodes::decode(&frame.nybbles, frame.pc)?;
                Ok(Some(Fetched::Op(op, next_pc)))
            }
            Mode::L2(chunk) => {
                if !chunk.is_valid() {
                    let l1_pc = chunk
                        .ops()
                        .get(frame.pc)
                        .map(|op| op.l1_pc())
                        .unwrap_or(frame.nybbles.len());
                    return Ok(Some(Fetched::Deopt { l1_pc }));
                }
                match &chunk.ops()[frame.pc] {
                    ChunkOp::Plain { op, .. } => Ok(Some(Fetched::Op(*op, frame.pc + 1))),
                    ChunkOp::CallDirect {
                        function, num_args, ..
                    } => Ok(Some(Fetched::Direct {
                        function: function.clone(),
                        num_args: *num_args,
                        next_pc: frame.pc + 1,
                    })),
                }
            }
        }
    }

    fn deoptimize(&mut self, l1_pc: usize) -> VmResult<()> {
        if let Some(frame) = self.frames.last_mut() {
            trace!(fiber = self.env.fiber_id, "deoptimizing invalidated chunk");
            if let Mode::L2(chunk) = &frame.mode {
                self.env.chunks.remove(chunk.id());
            }
            frame.mode = Mode::L1;
            frame.pc = l1_pc;
            raw_function::set_chunk_id(&frame.code, 0)?;
            raw_function::reset_countdown(&frame.code)?;
        }
        Ok(())
    }

    fn step(&mut self, fuel: &mut Option<u64>) -> VmResult<Step> {
        if self.frames.is_empty() {
            // Only reachable through internal misuse; finish quietly.
            return Ok(Step::Done(Outcome::Returned(values::nil())));
        }
        if let Some(remaining) = fuel {
            if *remaining == 0 {
                let continuation = self.reify();
                return Ok(Step::Done(Outcome::Interrupted { continuation }));
            }
            *remaining -= 1;
        }
        if self.frames[self.frames.len() - 1].at_end() {
            let value = self.frames[self.frames.len() - 1].top_or_nil();
            return self.return_value(value);
        }
        let fetched = match self.fetch()? {
            Some(fetched) => fetched,
            None => return Ok(Step::Done(Outcome::Returned(values::nil()))),
        };
        match fetched {
            Fetched::Deopt { l1_pc } => {
                self.deoptimize(l1_pc)?;
                Ok(Step::Continue)
            }
            Fetched::Direct {
                function,
                num_args,
                next_pc,
            } => {
                if self.interrupted() {
                    let continuation = self.reify();
                    return Ok(Step::Done(Outcome::Interrupted { continuation }));
                }
                let args = {
                    let frame = self.last_frame()?;
                    frame.pc = next_pc;
                    frame.pop_n(num_args)
                };
                self.invoke(function, args)
            }
            Fetched::Op(op, next_pc) => self.execute_op(op, next_pc),
        }
    }

    fn last_frame(&mut self) -> VmResult<&mut Frame> {
        self.frames
            .last_mut()
            .ok_or_else(|| VmError::with_detail(ErrorKind::NotSupported, "no active frame"))
    }

    fn execute_op(&mut self, op: L1Op, next_pc: usize) -> VmResult<Step> {
        use L1Op::*;
        // Safe points observe interrupts before any effect, with the pc
        // still aimed at the instruction, so resumption re-executes it.
        if matches!(
            op,
            Call { .. } | SuperCall { .. } | Apply { .. } | Return | CheckInterrupts
        ) && self.interrupted()
        {
            let continuation = self.reify();
            return Ok(Step::Done(Outcome::Interrupted { continuation }));
        }
        self.last_frame()?.pc = next_pc;
        match op {
            Call {
                bundle_literal,
                num_args,
            } => self.do_call(bundle_literal, num_args, None),
            SuperCall {
                bundle_literal,
                num_args,
                types_literal,
            } => self.do_call(bundle_literal, num_args, Some(types_literal)),
            Apply { num_args } => {
                let (function, args) = {
                    let frame = self.last_frame()?;
                    let args = frame.pop_n(num_args);
                    (frame.pop(), args)
                };
                self.invoke(function, args)
            }
            Return => {
                let value = self.last_frame()?.pop();
                self.return_value(value)
            }
            CheckInterrupts => Ok(Step::Continue),
            PushLiteral(index) => {
                let frame = self.last_frame()?;
                let literal = raw_function::literal_at(&frame.code, index)?;
                frame.push(literal);
                Ok(Step::Continue)
            }
            PushLocal(index) => {
                let frame = self.last_frame()?;
                let value = frame.slots[index].clone();
                frame.push(value);
                Ok(Step::Continue)
            }
            PushOuter(index) => {
                let frame = self.last_frame()?;
                let outer = raw_function::function_outer(&frame.function, index)?;
                frame.push(outer);
                Ok(Step::Continue)
            }
            Close {
                num_copied,
                code_literal,
            } => {
                self.charge(num_copied + 1)?;
                let frame = self.last_frame()?;
                let outers = frame.pop_n(num_copied);
                let code = raw_function::literal_at(&frame.code, code_literal)?;
                let function = raw_function::new_function(code, outers)?;
                frame.push(function);
                Ok(Step::Continue)
            }
            GetLocal(index) => {
                let variable_obj = { self.last_frame()?.slots[index].clone() };
                if let Some(tracer) = self.env.tracer {
                    tracer.record_read_before_write(&variable_obj);
                }
                let value = variable::get(&variable_obj)?;
                self.last_frame()?.push(value);
                Ok(Step::Continue)
            }
            SetLocal(index) => {
                let (variable_obj, value) = {
                    let frame = self.last_frame()?;
                    (frame.slots[index].clone(), frame.pop())
                };
                self.write_variable(&variable_obj, &value)?;
                Ok(Step::Continue)
            }
            GetOuter(index) => {
                let variable_obj = {
                    let frame = self.last_frame()?;
                    raw_function::function_outer(&frame.function, index)?
                };
                if let Some(tracer) = self.env.tracer {
                    tracer.record_read_before_write(&variable_obj);
                }
                let value = variable::get(&variable_obj)?;
                self.last_frame()?.push(value);
                Ok(Step::Continue)
            }
            SetOuter(index) => {
                let (variable_obj, value) = {
                    let frame = self.last_frame()?;
                    (
                        raw_function::function_outer(&frame.function, index)?,
                        frame.pop(),
                    )
                };
                self.write_variable(&variable_obj, &value)?;
                Ok(Step::Continue)
            }
            GetVariable => {
                let variable_obj = self.last_frame()?.pop();
                if let Some(tracer) = self.env.tracer {
                    tracer.record_read_before_write(&variable_obj);
                }
                let value = variable::get(&variable_obj)?;
                self.last_frame()?.push(value);
                Ok(Step::Continue)
            }
            SetVariable => {
                let (variable_obj, value) = {
                    let frame = self.last_frame()?;
                    (frame.pop(), frame.pop())
                };
                self.write_variable(&variable_obj, &value)?;
                Ok(Step::Continue)
            }
            MakeTuple(count) => {
                self.charge(count)?;
                let elements = self.last_frame()?.pop_n(count);
                let value = tuple::from_values(elements);
                self.last_frame()?.push(value);
                Ok(Step::Continue)
            }
            MakeSet(count) => {
                self.charge(count)?;
                let elements = self.last_frame()?.pop_n(count);
                let value = set::from_values(elements)?;
                self.last_frame()?.push(value);
                Ok(Step::Continue)
            }
            MakeMap(count) => {
                self.charge(count * 2)?;
                let pairs = self.last_frame()?.pop_n(count * 2);
                let mut built = map::empty();
                for pair in pairs.chunks(2) {
                    built = map::put(&built, &pair[0], &pair[1])?;
                }
                self.last_frame()?.push(built);
                Ok(Step::Continue)
            }
            Permute(index) => {
                let frame = self.last_frame()?;
                let permutation = raw_function::literal_at(&frame.code, index)?;
                let positions = tuple::to_vec(&permutation)?;
                let n = positions.len();
                let old = frame.pop_n(n);
                let mut reordered = Vec::with_capacity(n);
                for position in &positions {
                    let p = number::to_i64(position)
                        .and_then(|v| usize::try_from(v).ok())
                        .filter(|&v| v >= 1 && v <= n)
                        .ok_or(ErrorKind::NotSupported)?;
                    reordered.push(old[p - 1].clone());
                }
                for value in reordered {
                    frame.push(value);
                }
                Ok(Step::Continue)
            }
            PushLabel => {
                let label = self.snapshot();
                self.last_frame()?.push(label);
                Ok(Step::Continue)
            }
            Pop => {
                self.last_frame()?.pop();
                Ok(Step::Continue)
            }
            Dup => {
                let frame = self.last_frame()?;
                let top = frame.top_or_nil();
                frame.push(top);
                Ok(Step::Continue)
            }
        }
    }

    fn write_variable(&mut self, variable_obj: &AvailObject, value: &AvailObject) -> VmResult<()> {
        if let Some(tracer) = self.env.tracer {
            tracer.record_write(variable_obj);
        }
        variable::set(variable_obj, value)?;
        let observers = variable::write_observers(variable_obj)?;
        for observer in observers {
            self.call_to_completion(observer, vec![variable_obj.clone(), value.clone()])
                .map_err(|error| {
                    VmError::with_detail(ErrorKind::ObserveFailed, error.to_string())
                })?;
        }
        Ok(())
    }

    /// Runs a function in a nested interpreter until it returns; used for
    /// write observers, which may not suspend.
    fn call_to_completion(
        &self,
        function: AvailObject,
        args: Vec<AvailObject>,
    ) -> VmResult<AvailObject> {
        match run_function(self.env, &function, args, None) {
            Outcome::Returned(value) => Ok(value),
            Outcome::Failed { error, .. } => Err(error),
            _ => Err(ErrorKind::ObserveFailed.into()),
        }
    }

    fn do_call(
        &mut self,
        bundle_literal: usize,
        num_args: usize,
        types_literal: Option<usize>,
    ) -> VmResult<Step> {
        let (atom, args, super_types) = {
            let frame = self.last_frame()?;
            let atom = raw_function::literal_at(&frame.code, bundle_literal)?;
            let super_types = match types_literal {
                Some(index) => Some(raw_function::literal_at(&frame.code, index)?),
                None => None,
            };
            (atom, frame.pop_n(num_args), super_types)
        };
        let bundle = self.env.resolver.bundle_for_atom(&atom).ok_or_else(|| {
            VmError::with_detail(
                ErrorKind::NoDefinition,
                format!(
                    "no bundle for atom {:?}",
                    avail_data::atom::name(&atom).unwrap_or_default()
                ),
            )
        })?;
        let definition = match super_types {
            None => bundle.method().lookup_by_values(&args)?,
            Some(type_tuple) => {
                let argument_types = tuple::to_vec(&type_tuple)?;
                bundle.method().lookup_by_types(&argument_types)?
            }
        };
        match &*definition {
            Definition::Method { body, .. } | Definition::Macro { body, .. } => {
                self.invoke(body.clone(), args)
            }
            Definition::Abstract { .. } => Err(ErrorKind::AbstractMethodInvoked.into()),
            Definition::Forward { .. } => Err(ErrorKind::ForwardMethodInvoked.into()),
        }
    }

    fn invoke(&mut self, function: AvailObject, args: Vec<AvailObject>) -> VmResult<Step> {
        let code = raw_function::function_code(&function)?;
        let parameter_types = raw_function::parameter_types(&code)?;
        if parameter_types.len() != args.len() {
            return Err(ErrorKind::IncorrectNumberOfArguments.into());
        }
        for (argument, parameter) in args.iter().zip(&parameter_types) {
            if !types::is_instance(argument, parameter)? {
                return Err(ErrorKind::IncorrectArgumentType.into());
            }
        }
        let primitive_number = raw_function::primitive_number(&code)?;
        if primitive_number != 0 {
            match primitive::invoke(primitive_number, self.env, &args)? {
                PrimResult::Value(value) => {
                    self.check_return(&code, &value)?;
                    return self.push_result(value);
                }
                PrimResult::Fail(kind) => {
                    return self.push_body_frame(function, code, args, Some(kind));
                }
                PrimResult::Suspend(reason) => {
                    let continuation = self.reify();
                    return Ok(Step::Done(Outcome::Suspended {
                        continuation,
                        reason,
                    }));
                }
                PrimResult::Raise(value) => {
                    let error =
                        VmError::with_detail(ErrorKind::NotSupported, "unhandled exception");
                    return Ok(self.raise_value(value, error));
                }
                PrimResult::CallFunction {
                    function: target,
                    args: target_args,
                } => {
                    return self.invoke(target, target_args);
                }
                PrimResult::SwitchContinuation {
                    continuation,
                    value,
                } => {
                    self.frames.clear();
                    if continuation.kind() != Kind::Continuation {
                        self.base_caller = AvailObject::nil();
                        return Ok(Step::Done(Outcome::Returned(value)));
                    }
                    self.base_caller = continuation;
                    return self.resume_top(Resume::WithValue(value));
                }
            }
        }
        self.push_body_frame(function, code, args, None)
    }

    fn push_body_frame(
        &mut self,
        function: AvailObject,
        code: AvailObject,
        args: Vec<AvailObject>,
        primitive_failure: Option<ErrorKind>,
    ) -> VmResult<Step> {
        let nybbles = raw_function::nybblecodes(&code)?;
        if nybbles.is_empty()
            || (primitive_failure.is_some() && raw_function::num_locals(&code)? == 0)
        {
            // A fail-only primitive: no backup body (or nowhere to bind the
            // failure code), so unwind.
            if let Some(kind) = primitive_failure {
                return Err(kind.into());
            }
        }
        let mode = self.select_mode(&code)?;
        let frame = Frame::for_invocation(function, code, mode, args)?;
        if let Some(kind) = primitive_failure {
            // Bind the failure code into the first local.
            let failure_slot = frame.slots[frame.num_args].clone();
            variable::set(&failure_slot, &number::from_u32(kind.code()))?;
        }
        self.charge(frame.slots.len())?;
        self.frames.push(frame);
        Ok(Step::Continue)
    }

    fn select_mode(&mut self, code: &AvailObject) -> VmResult<Mode> {
        let chunk_id = raw_function::chunk_id(code)?;
        if chunk_id != 0 {
            if let Some(chunk) = self.env.chunks.get(chunk_id) {
                if chunk.is_valid() {
                    return Ok(Mode::L2(chunk));
                }
                self.env.chunks.remove(chunk_id);
            }
            raw_function::set_chunk_id(code, 0)?;
            raw_function::reset_countdown(code)?;
            return Ok(Mode::L1);
        }
        if raw_function::tick_countdown(code)? {
            if let Some(chunk) = self.env.chunks.translate(self.env.resolver, code)? {
                return Ok(Mode::L2(chunk));
            }
        }
        Ok(Mode::L1)
    }

    fn check_return(&self, code: &AvailObject, value: &AvailObject) -> VmResult<()> {
        let declared = raw_function::return_type(code)?;
        if !types::is_instance(value, &declared)? {
            return Err(ErrorKind::IncorrectReturnType.into());
        }
        Ok(())
    }

    fn return_value(&mut self, value: AvailObject) -> VmResult<Step> {
        let code = self.last_frame()?.code.clone();
        self.check_return(&code, &value)?;
        self.frames.pop();
        self.push_result(value)
    }

    fn push_result(&mut self, value: AvailObject) -> VmResult<Step> {
        if let Some(frame) = self.frames.last_mut() {
            frame.push(value);
            return Ok(Step::Continue);
        }
        let caller = std::mem::replace(&mut self.base_caller, AvailObject::nil());
        if caller.kind() != Kind::Continuation {
            return Ok(Step::Done(Outcome::Returned(value)));
        }
        self.base_caller = caller;
        self.resume_top(Resume::WithValue(value))
    }

    fn raise(&mut self, error: VmError) -> Step {
        let value = number::from_u32(error.kind.code());
        self.raise_value(value, error)
    }

    fn raise_value(&mut self, value: AvailObject, error: VmError) -> Step {
        if error.kind == ErrorKind::MemoryExhausted {
            // Fatal for the fiber; handlers never see it.
            self.frames.clear();
            return Step::Done(Outcome::Failed { error, value });
        }
        loop {
            let catch_index = self.frames.iter().rposition(|frame| {
                raw_function::primitive_number(&frame.code)
                    .map(|p| p == primitive::P_CATCH_EXCEPTION)
                    .unwrap_or(false)
            });
            if let Some(index) = catch_index {
                let handler = self.frames[index].slots[1].clone();
                self.frames.truncate(index);
                return match self.invoke(handler, vec![value]) {
                    Ok(step) => step,
                    Err(nested) => self.raise(nested),
                };
            }
            // Nothing native; pull one reified caller in and look again.
            let base = self.base_caller.clone();
            if base.kind() != Kind::Continuation {
                return Step::Done(Outcome::Failed { error, value });
            }
            match (
                continuation::caller(&base),
                Frame::from_continuation(&base, self.env.chunks),
            ) {
                (Ok(next), Ok(frame)) => {
                    self.base_caller = next;
                    self.frames.insert(0, frame);
                }
                _ => return Step::Done(Outcome::Failed { error, value }),
            }
        }
    }
}
