//! The numbered primitive registry.
//!
//! Primitives are VM-implemented operations invocable from compiled code,
//! identified by stable integer numbers that are part of the compiled-code
//! wire format. A primitive-capable function attempts its primitive before
//! the nybblecode body; on failure the interpreter binds the failure code
//! into the function's failure variable and runs the body instead.
//!
//! A primitive returns one of:
//! - a value (pushed to the caller after a return-type check),
//! - a failure code (fall through to the body),
//! - a suspension request (the scheduler parks the fiber),
//! - a raised value (unwind to the nearest exception handler),
//! - a tail invocation of another function, or
//! - a continuation switch (non-local return).

use std::time::Duration;

use once_cell::sync::Lazy;
use rustc_hash::FxHashMap;

use avail_base::{AvailObject, ErrorKind, Kind, VmError, VmResult};
use avail_data::{
    equality, fiber_handle, map, number, set, tuple, types, values, variable,
};

use crate::interpreter::{SuspendReason, VmEnv};
use crate::nybblecodes::L1Op;
use crate::raw_function::{self, RawFunctionBuilder};

/// What a primitive attempt produced.
pub enum PrimResult {
    /// Success: push the value to the caller.
    Value(AvailObject),
    /// Failure: bind the code and run the nybblecode body.
    Fail(ErrorKind),
    /// Park the fiber; the scheduler resumes it with an injected value.
    Suspend(SuspendReason),
    /// Unwind to the nearest exception handler with this value.
    Raise(AvailObject),
    /// Tail-invoke another function with the given arguments.
    CallFunction {
        function: AvailObject,
        args: Vec<AvailObject>,
    },
    /// Abandon the current frames and continue the given continuation with
    /// an injected value (non-local return).
    SwitchContinuation {
        continuation: AvailObject,
        value: AvailObject,
    },
}

type PrimitiveFn = fn(&VmEnv, &[AvailObject]) -> VmResult<PrimResult>;

struct Entry {
    name: &'static str,
    arity: usize,
    function: PrimitiveFn,
}

// Stable primitive numbers.
pub const P_ADDITION: u32 = 1;
pub const P_SUBTRACTION: u32 = 2;
pub const P_MULTIPLICATION: u32 = 3;
pub const P_DIVISION: u32 = 4;
pub const P_LESS_THAN: u32 = 5;
pub const P_LESS_OR_EQUAL: u32 = 6;
pub const P_EQUALITY: u32 = 7;
pub const P_TUPLE_SIZE: u32 = 10;
pub const P_TUPLE_AT: u32 = 11;
pub const P_TUPLE_CONCAT: u32 = 12;
pub const P_TUPLE_SLICE: u32 = 13;
pub const P_SET_SIZE: u32 = 20;
pub const P_SET_WITH: u32 = 21;
pub const P_SET_WITHOUT: u32 = 22;
pub const P_SET_HAS: u32 = 23;
pub const P_MAP_SIZE: u32 = 30;
pub const P_MAP_AT: u32 = 31;
pub const P_MAP_PUT: u32 = 32;
pub const P_MAP_REMOVE: u32 = 33;
pub const P_MAP_HAS_KEY: u32 = 34;
pub const P_GET_VALUE: u32 = 40;
pub const P_SET_VALUE: u32 = 41;
pub const P_COMPARE_AND_SWAP: u32 = 42;
pub const P_GET_AND_SET: u32 = 43;
pub const P_CREATE_VARIABLE: u32 = 44;
pub const P_ADD_WRITE_OBSERVER: u32 = 45;
pub const P_FIBER_SLEEP: u32 = 50;
pub const P_FIBER_JOIN: u32 = 51;
pub const P_CURRENT_FIBER: u32 = 52;
pub const P_PARK_FIBER: u32 = 53;
pub const P_CATCH_EXCEPTION: u32 = 60;
pub const P_RAISE_EXCEPTION: u32 = 61;
pub const P_INVOKE_WITH_TUPLE: u32 = 62;
pub const P_TYPE_OF: u32 = 70;
pub const P_IS_INSTANCE_OF: u32 = 71;
pub const P_IS_SUBTYPE: u32 = 72;
pub const P_EXIT_CONTINUATION: u32 = 80;

fn err_to_fail(result: VmResult<AvailObject>) -> VmResult<PrimResult> {
    match result {
        Ok(value) => Ok(PrimResult::Value(value)),
        Err(error) => Ok(PrimResult::Fail(error.kind)),
    }
}

fn index_arg(args: &[AvailObject], at: usize) -> Option<usize> {
    number::to_i64(&args[at]).and_then(|v| usize::try_from(v).ok())
}

static TABLE: Lazy<FxHashMap<u32, Entry>> = Lazy::new(|| {
    let mut table: FxHashMap<u32, Entry> = FxHashMap::default();
    let mut add = |number: u32, name: &'static str, arity: usize, function: PrimitiveFn| {
        table.insert(
            number,
            Entry {
                name,
                arity,
                function,
            },
        );
    };

    add(P_ADDITION, "addition", 2, |_env, args| {
        err_to_fail(number::add(&args[0], &args[1]))
    });
    add(P_SUBTRACTION, "subtraction", 2, |_env, args| {
        err_to_fail(number::subtract(&args[0], &args[1]))
    });
    add(P_MULTIPLICATION, "multiplication", 2, |_env, args| {
        err_to_fail(number::multiply(&args[0], &args[1]))
    });
    add(P_DIVISION, "division", 2, |_env, args| {
        err_to_fail(number::divide(&args[0], &args[1]))
    });
    add(P_LESS_THAN, "less than", 2, |_env, args| {
        match number::compare(&args[0], &args[1]) {
            Ok(order) => Ok(PrimResult::Value(values::boolean(order.is_lt()))),
            Err(error) => Ok(PrimResult::Fail(error.kind)),
        }
    });
    add(P_LESS_OR_EQUAL, "less or equal", 2, |_env, args| {
        match number::compare(&args[0], &args[1]) {
            Ok(order) => Ok(PrimResult::Value(values::boolean(order.is_le()))),
            Err(error) => Ok(PrimResult::Fail(error.kind)),
        }
    });
    add(P_EQUALITY, "equality", 2, |_env, args| {
        Ok(PrimResult::Value(values::boolean(equality::equals(
            &args[0], &args[1],
        ))))
    });

    add(P_TUPLE_SIZE, "tuple size", 1, |_env, args| {
        err_to_fail(tuple::size(&args[0]).map(|n| number::from_u64(n as u64)))
    });
    add(P_TUPLE_AT, "tuple at", 2, |_env, args| {
        let Some(index) = index_arg(args, 1) else {
            return Ok(PrimResult::Fail(ErrorKind::NotSupported));
        };
        err_to_fail(tuple::at(&args[0], index))
    });
    add(P_TUPLE_CONCAT, "tuple concatenation", 2, |_env, args| {
        err_to_fail(tuple::concat(&args[0], &args[1]))
    });
    add(P_TUPLE_SLICE, "tuple slice", 3, |_env, args| {
        let (Some(from), Some(to)) = (index_arg(args, 1), index_arg(args, 2)) else {
            return Ok(PrimResult::Fail(ErrorKind::NotSupported));
        };
        err_to_fail(tuple::slice(&args[0], from, to))
    });

    add(P_SET_SIZE, "set size", 1, |_env, args| {
        err_to_fail(set::size(&args[0]).map(|n| number::from_u64(n as u64)))
    });
    add(P_SET_WITH, "set with", 2, |_env, args| {
        err_to_fail(set::with(&args[0], &args[1]))
    });
    add(P_SET_WITHOUT, "set without", 2, |_env, args| {
        err_to_fail(set::without(&args[0], &args[1]))
    });
    add(P_SET_HAS, "set membership", 2, |_env, args| {
        err_to_fail(set::has(&args[0], &args[1]).map(values::boolean))
    });

    add(P_MAP_SIZE, "map size", 1, |_env, args| {
        err_to_fail(map::size(&args[0]).map(|n| number::from_u64(n as u64)))
    });
    add(P_MAP_AT, "map at", 2, |_env, args| {
        match map::at(&args[0], &args[1]) {
            Ok(Some(value)) => Ok(PrimResult::Value(value)),
            Ok(None) => Ok(PrimResult::Fail(ErrorKind::MapKeyNotFound)),
            Err(error) => Ok(PrimResult::Fail(error.kind)),
        }
    });
    add(P_MAP_PUT, "map put", 3, |_env, args| {
        err_to_fail(map::put(&args[0], &args[1], &args[2]))
    });
    add(P_MAP_REMOVE, "map remove", 2, |_env, args| {
        err_to_fail(map::remove(&args[0], &args[1]))
    });
    add(P_MAP_HAS_KEY, "map has key", 2, |_env, args| {
        match map::at(&args[0], &args[1]) {
            Ok(found) => Ok(PrimResult::Value(values::boolean(found.is_some()))),
            Err(error) => Ok(PrimResult::Fail(error.kind)),
        }
    });

    add(P_GET_VALUE, "variable get", 1, |env, args| {
        if let Some(tracer) = env.tracer {
            tracer.record_read_before_write(&args[0]);
        }
        err_to_fail(variable::get(&args[0]))
    });
    add(P_SET_VALUE, "variable set", 2, |env, args| {
        if let Some(tracer) = env.tracer {
            tracer.record_write(&args[0]);
        }
        match variable::set(&args[0], &args[1]) {
            Ok(()) => Ok(PrimResult::Value(values::nil())),
            Err(error) => Ok(PrimResult::Fail(error.kind)),
        }
    });
    add(P_COMPARE_AND_SWAP, "compare and swap", 3, |env, args| {
        if let Some(tracer) = env.tracer {
            tracer.record_write(&args[0]);
        }
        match variable::compare_and_swap(&args[0], &args[1], &args[2]) {
            Ok(swapped) => Ok(PrimResult::Value(values::boolean(swapped))),
            Err(error) => Ok(PrimResult::Fail(error.kind)),
        }
    });
    add(P_GET_AND_SET, "get and set", 2, |env, args| {
        if let Some(tracer) = env.tracer {
            tracer.record_write(&args[0]);
        }
        err_to_fail(variable::get_and_set(&args[0], &args[1]))
    });
    add(P_CREATE_VARIABLE, "create variable", 1, |_env, args| {
        if args[0].traverse().kind() != Kind::Type {
            return Ok(PrimResult::Fail(ErrorKind::NotSupported));
        }
        Ok(PrimResult::Value(variable::new(args[0].clone())))
    });
    add(P_ADD_WRITE_OBSERVER, "add write observer", 2, |_env, args| {
        match variable::add_write_observer(&args[0], &args[1]) {
            Ok(()) => Ok(PrimResult::Value(values::nil())),
            Err(error) => Ok(PrimResult::Fail(error.kind)),
        }
    });

    add(P_FIBER_SLEEP, "fiber sleep", 1, |_env, args| {
        match number::to_i64(&args[0]) {
            Some(millis) if millis >= 0 => Ok(PrimResult::Suspend(SuspendReason::Sleep(
                Duration::from_millis(millis as u64),
            ))),
            _ => Ok(PrimResult::Fail(ErrorKind::NotSupported)),
        }
    });
    add(P_FIBER_JOIN, "fiber join", 1, |_env, args| {
        match fiber_handle::id(&args[0]) {
            Ok(id) => Ok(PrimResult::Suspend(SuspendReason::Join(id))),
            Err(error) => Ok(PrimResult::Fail(error.kind)),
        }
    });
    add(P_CURRENT_FIBER, "current fiber", 0, |env, _args| {
        Ok(PrimResult::Value(fiber_handle::new(env.fiber_id)))
    });
    add(P_PARK_FIBER, "park fiber", 0, |_env, _args| {
        Ok(PrimResult::Suspend(SuspendReason::Park))
    });

    // The catch primitive always fails; its body invokes the protected
    // function while the frame itself is the marker unwinding searches for.
    add(P_CATCH_EXCEPTION, "catch exception", 2, |_env, _args| {
        Ok(PrimResult::Fail(ErrorKind::NotSupported))
    });
    add(P_RAISE_EXCEPTION, "raise exception", 1, |_env, args| {
        Ok(PrimResult::Raise(args[0].clone()))
    });
    add(P_INVOKE_WITH_TUPLE, "invoke with tuple", 2, |_env, args| {
        match tuple::to_vec(&args[1]) {
            Ok(call_args) => Ok(PrimResult::CallFunction {
                function: args[0].clone(),
                args: call_args,
            }),
            Err(error) => Ok(PrimResult::Fail(error.kind)),
        }
    });

    add(P_TYPE_OF, "type of", 1, |_env, args| {
        Ok(PrimResult::Value(types::instance_type(args[0].clone())))
    });
    add(P_IS_INSTANCE_OF, "is instance of", 2, |_env, args| {
        err_to_fail(types::is_instance(&args[0], &args[1]).map(values::boolean))
    });
    add(P_IS_SUBTYPE, "is subtype", 2, |_env, args| {
        err_to_fail(types::is_subtype(&args[0], &args[1]).map(values::boolean))
    });

    add(P_EXIT_CONTINUATION, "exit continuation", 2, |_env, args| {
        let target = args[0].traverse();
        if target.kind() != Kind::Continuation && target.kind() != Kind::Nil {
            return Ok(PrimResult::Fail(ErrorKind::NotSupported));
        }
        Ok(PrimResult::SwitchContinuation {
            continuation: target,
            value: args[1].clone(),
        })
    });

    table
});

/// Whether a primitive number has an implementation.
pub fn exists(number: u32) -> bool {
    TABLE.contains_key(&number)
}

/// The primitive's display name.
pub fn name(number: u32) -> Option<&'static str> {
    TABLE.get(&number).map(|e| e.name)
}

/// Attempts the primitive.
pub fn invoke(number: u32, env: &VmEnv, args: &[AvailObject]) -> VmResult<PrimResult> {
    let entry = TABLE
        .get(&number)
        .ok_or_else(|| VmError::with_detail(ErrorKind::InvalidPrimitiveNumber, number.to_string()))?;
    if entry.arity != args.len() {
        return Ok(PrimResult::Fail(ErrorKind::IncorrectNumberOfArguments));
    }
    (entry.function)(env, args)
}

/// Builds the canonical exception-catching function: primitive
/// [`P_CATCH_EXCEPTION`] over `(body, handler)`, whose backup body invokes
/// `body` with no arguments. Unwinding recognizes frames running this code
/// by the primitive number and diverts to their `handler` argument.
pub fn catch_exception_function() -> VmResult<AvailObject> {
    let body_type = types::function_type(vec![], types::any());
    let handler_type = types::function_type(vec![types::any()], types::any());
    let mut builder = RawFunctionBuilder::new(vec![body_type, handler_type], types::any());
    builder.primitive(P_CATCH_EXCEPTION);
    builder.locals(1);
    builder
        .op(L1Op::PushLocal(0))
        .op(L1Op::Apply { num_args: 0 })
        .op(L1Op::Return);
    raw_function::plain_function(builder.build()?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_declared_number_exists() {
        for n in [
            P_ADDITION,
            P_DIVISION,
            P_TUPLE_AT,
            P_MAP_AT,
            P_SET_VALUE,
            P_FIBER_JOIN,
            P_CATCH_EXCEPTION,
            P_EXIT_CONTINUATION,
        ] {
            assert!(exists(n), "{}", n);
            assert!(name(n).is_some());
        }
        assert!(!exists(9999));
    }
}
