//! Raw functions (compiled code) and the functions that close over them.
//!
//! A raw function owns its Level One nybblecodes, a literal pool, the
//! argument/local/stack counts, an optional primitive number, the declared
//! parameter/return types, outer-variable types, the id of its current
//! Level Two chunk (0 = none), and the invocation countdown that triggers
//! chunk translation.
//!
//! Builders validate the primitive number and literal references up front
//! and compute the frame's stack requirement by simulating the (branchless)
//! instruction stream.

use avail_base::{AvailObject, Descriptor, ErrorKind, Kind, VmError, VmResult};
use avail_data::{tuple, types};

use crate::nybblecodes::{L1Op, NybbleWriter};
use crate::primitive;

/// Object slots.
const NYBBLECODES: usize = 0;
const LITERALS: usize = 1;
const OUTER_TYPES: usize = 2;
const PARAM_TYPES: usize = 3;
const RETURN_TYPE: usize = 4;
/// Integer slots.
const NUM_ARGS: usize = 0;
const NUM_LOCALS: usize = 1;
const MAX_STACK: usize = 2;
const PRIMITIVE: usize = 3;
const CHUNK_ID: usize = 4;
const COUNTDOWN: usize = 5;

/// Invocations of a raw function before the chunk engine translates it.
pub const DEFAULT_COUNTDOWN: u32 = 10;

/// Accumulates the pieces of a raw function.
pub struct RawFunctionBuilder {
    ops: Vec<L1Op>,
    literals: Vec<AvailObject>,
    parameter_types: Vec<AvailObject>,
    return_type: AvailObject,
    outer_types: Vec<AvailObject>,
    num_locals: usize,
    primitive: u32,
    countdown: u32,
}

impl RawFunctionBuilder {
    /// Starts a builder for code taking the given parameters.
    pub fn new(parameter_types: Vec<AvailObject>, return_type: AvailObject) -> Self {
        RawFunctionBuilder {
            ops: Vec::new(),
            literals: Vec::new(),
            parameter_types,
            return_type,
            outer_types: Vec::new(),
            num_locals: 0,
            primitive: 0,
            countdown: DEFAULT_COUNTDOWN,
        }
    }

    /// Adds a literal, returning its pool index.
    pub fn literal(&mut self, value: AvailObject) -> usize {
        self.literals.push(value);
        self.literals.len() - 1
    }

    /// Appends an instruction.
    pub fn op(&mut self, op: L1Op) -> &mut Self {
        self.ops.push(op);
        self
    }

    /// Declares `count` local variable slots (beyond the arguments).
    pub fn locals(&mut self, count: usize) -> &mut Self {
        self.num_locals = count;
        self
    }

    /// Declares the types of captured outers.
    pub fn outers(&mut self, outer_types: Vec<AvailObject>) -> &mut Self {
        self.outer_types = outer_types;
        self
    }

    /// Attaches a primitive attempted before the nybblecode body.
    pub fn primitive(&mut self, number: u32) -> &mut Self {
        self.primitive = number;
        self
    }

    /// Overrides the reoptimization countdown.
    pub fn countdown(&mut self, countdown: u32) -> &mut Self {
        self.countdown = countdown;
        self
    }

    fn max_stack(&self) -> VmResult<usize> {
        let mut depth: isize = 0;
        let mut max: isize = 0;
        for op in &self.ops {
            let delta: isize = match *op {
                L1Op::Call { num_args, .. } => 1 - num_args as isize,
                L1Op::SuperCall { num_args, .. } => 1 - num_args as isize,
                L1Op::PushLiteral(_)
                | L1Op::PushLocal(_)
                | L1Op::PushOuter(_)
                | L1Op::GetLocal(_)
                | L1Op::GetOuter(_)
                | L1Op::PushLabel
                | L1Op::Dup => 1,
                L1Op::Close { num_copied, .. } => 1 - num_copied as isize,
                L1Op::SetLocal(_) | L1Op::SetOuter(_) | L1Op::Pop | L1Op::Return => -1,
                L1Op::MakeTuple(count) | L1Op::MakeSet(count) => 1 - count as isize,
                L1Op::MakeMap(count) => 1 - 2 * count as isize,
                L1Op::Permute(_) | L1Op::GetVariable | L1Op::CheckInterrupts => 0,
                L1Op::SetVariable => -2,
                L1Op::Apply { num_args } => -(num_args as isize),
            };
            depth += delta;
            max = max.max(depth);
        }
        if depth < 0 {
            return Err(VmError::with_detail(
                ErrorKind::NotSupported,
                "instruction stream underflows its stack",
            ));
        }
        Ok(max.max(1) as usize)
    }

    fn check_literals(&self) -> VmResult<()> {
        let in_range = |index: usize| -> VmResult<()> {
            if index < self.literals.len() {
                Ok(())
            } else {
                Err(VmError::with_detail(
                    ErrorKind::NotSupported,
                    format!("literal index {} out of range", index),
                ))
            }
        };
        for op in &self.ops {
            match *op {
                L1Op::Call { bundle_literal, .. } => in_range(bundle_literal)?,
                L1Op::PushLiteral(index) | L1Op::Permute(index) => in_range(index)?,
                L1Op::Close { code_literal, .. } => in_range(code_literal)?,
                L1Op::SuperCall {
                    bundle_literal,
                    types_literal,
                    ..
                } => {
                    in_range(bundle_literal)?;
                    in_range(types_literal)?;
                }
                _ => {}
            }
        }
        Ok(())
    }

    /// Produces the (shared) raw function object.
    pub fn build(self) -> VmResult<AvailObject> {
        if self.primitive != 0 && !primitive::exists(self.primitive) {
            return Err(VmError::with_detail(
                ErrorKind::InvalidPrimitiveNumber,
                format!("primitive {}", self.primitive),
            ));
        }
        self.check_literals()?;
        let max_stack = self.max_stack()?;
        let mut writer = NybbleWriter::new();
        for op in &self.ops {
            writer.op(*op);
        }
        let code = AvailObject::allocate(Descriptor::mutable(Kind::RawFunction), 0, 0);
        code.set_object_slot(NYBBLECODES, tuple::nybble_tuple_from(&writer.finish()));
        code.set_object_slot(LITERALS, tuple::object_tuple(self.literals));
        code.set_object_slot(OUTER_TYPES, tuple::object_tuple(self.outer_types));
        code.set_object_slot(
            PARAM_TYPES,
            tuple::object_tuple(self.parameter_types.clone()),
        );
        code.set_object_slot(RETURN_TYPE, self.return_type);
        code.set_integer_slot(NUM_ARGS, self.parameter_types.len() as u32);
        code.set_integer_slot(NUM_LOCALS, self.num_locals as u32);
        code.set_integer_slot(MAX_STACK, max_stack as u32);
        code.set_integer_slot(PRIMITIVE, self.primitive);
        code.set_integer_slot(CHUNK_ID, 0);
        code.set_integer_slot(COUNTDOWN, self.countdown);
        code.make_shared();
        Ok(code)
    }
}

fn expect_code(obj: &AvailObject) -> VmResult<AvailObject> {
    let obj = obj.traverse();
    if obj.kind() != Kind::RawFunction {
        return Err(ErrorKind::NotSupported.into());
    }
    Ok(obj)
}

/// The packed nybblecode stream, one nybble per byte.
pub fn nybblecodes(code: &AvailObject) -> VmResult<Vec<u8>> {
    tuple::nybbles_to_vec(&expect_code(code)?.object_slot(NYBBLECODES))
}

/// The literal at `index` (0-based).
pub fn literal_at(code: &AvailObject, index: usize) -> VmResult<AvailObject> {
    tuple::at(&expect_code(code)?.object_slot(LITERALS), index + 1)
}

pub fn num_args(code: &AvailObject) -> VmResult<usize> {
    Ok(expect_code(code)?.integer_slot(NUM_ARGS) as usize)
}

pub fn num_locals(code: &AvailObject) -> VmResult<usize> {
    Ok(expect_code(code)?.integer_slot(NUM_LOCALS) as usize)
}

/// Total frame slots: arguments, locals, then stack.
pub fn frame_slots(code: &AvailObject) -> VmResult<usize> {
    let code = expect_code(code)?;
    Ok((code.integer_slot(NUM_ARGS)
        + code.integer_slot(NUM_LOCALS)
        + code.integer_slot(MAX_STACK)) as usize)
}

pub fn primitive_number(code: &AvailObject) -> VmResult<u32> {
    Ok(expect_code(code)?.integer_slot(PRIMITIVE))
}

/// The declared parameter types.
pub fn parameter_types(code: &AvailObject) -> VmResult<Vec<AvailObject>> {
    tuple::to_vec(&expect_code(code)?.object_slot(PARAM_TYPES))
}

pub fn return_type(code: &AvailObject) -> VmResult<AvailObject> {
    Ok(expect_code(code)?.object_slot(RETURN_TYPE))
}

/// The whole literal pool, in index order.
pub fn literals(code: &AvailObject) -> VmResult<Vec<AvailObject>> {
    tuple::to_vec(&expect_code(code)?.object_slot(LITERALS))
}

/// The tuple of outer-variable types.
pub fn outer_types_tuple(code: &AvailObject) -> VmResult<AvailObject> {
    Ok(expect_code(code)?.object_slot(OUTER_TYPES))
}

/// The tuple of parameter types, as a tuple object.
pub fn parameter_types_tuple(code: &AvailObject) -> VmResult<AvailObject> {
    Ok(expect_code(code)?.object_slot(PARAM_TYPES))
}

/// The current Level Two chunk id, 0 when unoptimized.
pub fn chunk_id(code: &AvailObject) -> VmResult<u64> {
    Ok(expect_code(code)?.integer_slot(CHUNK_ID) as u64)
}

pub fn set_chunk_id(code: &AvailObject, id: u64) -> VmResult<()> {
    expect_code(code)?.set_integer_slot(CHUNK_ID, id as u32);
    Ok(())
}

/// Decrements the reoptimization countdown, reporting whether it hit zero.
pub fn tick_countdown(code: &AvailObject) -> VmResult<bool> {
    let code = expect_code(code)?;
    let remaining = code.integer_slot(COUNTDOWN);
    if remaining == 0 {
        return Ok(true);
    }
    code.set_integer_slot(COUNTDOWN, remaining - 1);
    Ok(remaining - 1 == 0)
}

/// Resets the countdown after a chunk invalidation.
pub fn reset_countdown(code: &AvailObject) -> VmResult<()> {
    expect_code(code)?.set_integer_slot(COUNTDOWN, DEFAULT_COUNTDOWN);
    Ok(())
}

// ---------------------------------------------------------------------------
// Functions: raw function + captured outers
// ---------------------------------------------------------------------------

/// Function object slot holding the code.
const CODE: usize = 0;

/// Binds a raw function with its captured outers.
pub fn new_function(code: AvailObject, outers: Vec<AvailObject>) -> VmResult<AvailObject> {
    let code = expect_code(&code)?;
    let mut slots = vec![code];
    slots.extend(outers);
    Ok(AvailObject::with_slots(
        Descriptor::mutable(Kind::Function),
        slots,
        Vec::new(),
    ))
}

fn expect_function(obj: &AvailObject) -> VmResult<AvailObject> {
    let obj = obj.traverse();
    if obj.kind() != Kind::Function {
        return Err(ErrorKind::NotSupported.into());
    }
    Ok(obj)
}

/// The function's raw function.
pub fn function_code(function: &AvailObject) -> VmResult<AvailObject> {
    Ok(expect_function(function)?.object_slot(CODE))
}

/// The captured outer at `index` (0-based).
pub fn function_outer(function: &AvailObject, index: usize) -> VmResult<AvailObject> {
    Ok(expect_function(function)?.object_slot(CODE + 1 + index))
}

/// A function with no outers over fresh code; the common case.
pub fn plain_function(code: AvailObject) -> VmResult<AvailObject> {
    new_function(code, Vec::new())
}

/// The declared type of a function object, for instance checks.
pub fn function_type_of(function: &AvailObject) -> VmResult<AvailObject> {
    let code = function_code(function)?;
    Ok(types::function_type(
        parameter_types(&code)?,
        return_type(&code)?,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use avail_data::number;

    #[test]
    fn builder_produces_decodable_code() {
        let mut builder = RawFunctionBuilder::new(vec![], types::any());
        let lit = builder.literal(number::from_i64(42));
        builder.op(L1Op::PushLiteral(lit)).op(L1Op::Return);
        let code = builder.build().unwrap();
        let stream = nybblecodes(&code).unwrap();
        let ops: Vec<L1Op> = crate::nybblecodes::decode_all(&stream)
            .unwrap()
            .into_iter()
            .map(|(_, op)| op)
            .collect();
        assert_eq!(ops, vec![L1Op::PushLiteral(0), L1Op::Return]);
        assert_eq!(
            number::to_i64(&literal_at(&code, 0).unwrap()),
            Some(42)
        );
    }

    #[test]
    fn unknown_primitive_is_rejected() {
        let mut builder = RawFunctionBuilder::new(vec![], types::any());
        builder.primitive(0xDEAD);
        builder.op(L1Op::Return);
        let err = builder.build().unwrap_err();
        assert_eq!(err.kind, ErrorKind::InvalidPrimitiveNumber);
    }

    #[test]
    fn dangling_literal_reference_is_rejected() {
        let mut builder = RawFunctionBuilder::new(vec![], types::any());
        builder.op(L1Op::PushLiteral(3)).op(L1Op::Return);
        assert!(builder.build().is_err());
    }

    #[test]
    fn stack_underflow_is_rejected() {
        let mut builder = RawFunctionBuilder::new(vec![], types::any());
        builder.op(L1Op::Pop);
        assert!(builder.build().is_err());
    }

    #[test]
    fn countdown_ticks_to_zero_once() {
        let mut builder = RawFunctionBuilder::new(vec![], types::any());
        builder.op(L1Op::Return);
        builder.countdown(2);
        let lit = builder.literal(number::from_i64(0));
        builder.ops.insert(0, L1Op::PushLiteral(lit));
        let code = builder.build().unwrap();
        assert!(!tick_countdown(&code).unwrap());
        assert!(tick_countdown(&code).unwrap());
        assert!(tick_countdown(&code).unwrap());
    }
}
