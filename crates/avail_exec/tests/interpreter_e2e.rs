//! End-to-end interpreter tests: dispatch through bundles, primitive
//! attempt/backup semantics, exception unwinding, and chunk translation
//! with invalidation.

use std::sync::atomic::{AtomicI64, AtomicU32};
use std::sync::Arc;

use parking_lot::Mutex;
use rustc_hash::FxHashMap;

use avail_base::{AvailObject, ErrorKind};
use avail_data::{number, tuple, types};
use avail_exec::interpreter::{run_function, BundleResolver, Outcome, VmEnv};
use avail_exec::nybblecodes::L1Op;
use avail_exec::primitive;
use avail_exec::raw_function::{self, RawFunctionBuilder};
use avail_exec::ChunkRegistry;
use avail_kernel::{Definition, MessageBundle, Method, Signature};

#[derive(Default)]
struct TestResolver {
    bundles: Mutex<FxHashMap<usize, Arc<MessageBundle>>>,
}

impl TestResolver {
    fn register(&self, atom: &AvailObject, bundle: Arc<MessageBundle>) {
        self.bundles.lock().insert(atom.addr(), bundle);
    }
}

impl BundleResolver for TestResolver {
    fn bundle_for_atom(&self, atom: &AvailObject) -> Option<Arc<MessageBundle>> {
        self.bundles.lock().get(&atom.traverse().addr()).cloned()
    }
}

struct Harness {
    resolver: TestResolver,
    chunks: ChunkRegistry,
    interrupts: AtomicU32,
    budget: AtomicI64,
}

impl Harness {
    fn new() -> Harness {
        Harness {
            resolver: TestResolver::default(),
            chunks: ChunkRegistry::new(),
            interrupts: AtomicU32::new(0),
            budget: AtomicI64::new(1 << 24),
        }
    }

    fn env(&self) -> VmEnv<'_> {
        VmEnv {
            resolver: &self.resolver,
            chunks: &self.chunks,
            interrupt_flags: &self.interrupts,
            tracer: None,
            allocation_budget: &self.budget,
            fiber_id: 1,
        }
    }

    fn run(&self, function: &AvailObject, args: Vec<AvailObject>) -> Outcome {
        run_function(&self.env(), function, args, None)
    }
}

/// A function wrapping a fallible primitive: the backup body answers the
/// failure code from the failure variable.
fn primitive_function(
    number: u32,
    parameter_types: Vec<AvailObject>,
    return_type: AvailObject,
) -> AvailObject {
    let arg_count = parameter_types.len();
    let mut builder = RawFunctionBuilder::new(parameter_types, return_type);
    builder.primitive(number);
    builder.locals(1);
    builder
        .op(L1Op::GetLocal(arg_count))
        .op(L1Op::Return);
    raw_function::plain_function(builder.build().expect("primitive function")).expect("function")
}

/// Registers `name` with a single definition whose body is `body`.
fn define_method(
    harness: &Harness,
    name: &str,
    parameter_types: Vec<AvailObject>,
    body: AvailObject,
) -> (AvailObject, Arc<MessageBundle>) {
    let atom = avail_data::atom::create(name, Some("Test"));
    let method = Method::new();
    let bundle = MessageBundle::new(atom.clone(), name, method.clone()).expect("bundle");
    harness.resolver.register(&atom, bundle.clone());
    method
        .add_definition(Definition::Method {
            signature: Signature::new(parameter_types, types::any()),
            body,
        })
        .expect("definition");
    (atom, bundle)
}

fn expect_value(outcome: Outcome) -> AvailObject {
    match outcome {
        Outcome::Returned(value) => value,
        Outcome::Failed { error, .. } => panic!("fiber failed: {}", error),
        _ => panic!("fiber did not complete"),
    }
}

#[test]
fn calling_a_method_through_its_bundle() {
    let harness = Harness::new();
    let adder = primitive_function(
        primitive::P_ADDITION,
        vec![types::integers(), types::integers()],
        types::integers(),
    );
    let (atom, _bundle) = define_method(
        &harness,
        "_+_",
        vec![types::integers(), types::integers()],
        adder,
    );

    let mut caller = RawFunctionBuilder::new(vec![], types::any());
    let plus = caller.literal(atom);
    let two = caller.literal(number::from_i64(2));
    let three = caller.literal(number::from_i64(3));
    caller
        .op(L1Op::PushLiteral(two))
        .op(L1Op::PushLiteral(three))
        .op(L1Op::Call {
            bundle_literal: plus,
            num_args: 2,
        })
        .op(L1Op::Return);
    let caller = raw_function::plain_function(caller.build().unwrap()).unwrap();

    let result = expect_value(harness.run(&caller, vec![]));
    assert_eq!(number::to_i64(&result), Some(5));
}

#[test]
fn primitive_failure_falls_through_to_the_body() {
    let harness = Harness::new();
    let divider = primitive_function(
        primitive::P_DIVISION,
        vec![types::integers(), types::integers()],
        types::any(),
    );
    // 10 / 2 succeeds through the primitive.
    let ok = expect_value(harness.run(&divider, vec![number::from_i64(10), number::from_i64(2)]));
    assert_eq!(number::to_i64(&ok), Some(5));
    // 1 / 0 fails over to the body, which returns the failure code.
    let code = expect_value(harness.run(&divider, vec![number::from_i64(1), number::from_i64(0)]));
    assert_eq!(
        number::to_i64(&code),
        Some(ErrorKind::DivisionByZero.code() as i64)
    );
}

#[test]
fn argument_checks_reject_bad_calls() {
    let harness = Harness::new();
    let adder = primitive_function(
        primitive::P_ADDITION,
        vec![types::integers(), types::integers()],
        types::integers(),
    );
    match harness.run(&adder, vec![number::from_i64(1)]) {
        Outcome::Failed { error, .. } => {
            assert_eq!(error.kind, ErrorKind::IncorrectNumberOfArguments)
        }
        _ => panic!("expected failure"),
    }
    match harness.run(
        &adder,
        vec![number::from_i64(1), tuple::string_from_str("no")],
    ) {
        Outcome::Failed { error, .. } => {
            assert_eq!(error.kind, ErrorKind::IncorrectArgumentType)
        }
        _ => panic!("expected failure"),
    }
}

#[test]
fn return_types_are_enforced() {
    let harness = Harness::new();
    // Declares an integer return but produces a string.
    let mut builder = RawFunctionBuilder::new(vec![], types::integers());
    let lie = builder.literal(tuple::string_from_str("surprise"));
    builder.op(L1Op::PushLiteral(lie)).op(L1Op::Return);
    let liar = raw_function::plain_function(builder.build().unwrap()).unwrap();
    match harness.run(&liar, vec![]) {
        Outcome::Failed { error, .. } => assert_eq!(error.kind, ErrorKind::IncorrectReturnType),
        _ => panic!("expected failure"),
    }
}

#[test]
fn raised_exceptions_reach_the_nearest_handler() {
    let harness = Harness::new();
    // raiser: always raises its argument.
    let raiser = {
        let mut builder = RawFunctionBuilder::new(vec![types::any()], types::any());
        builder.primitive(primitive::P_RAISE_EXCEPTION);
        raw_function::plain_function(builder.build().unwrap()).unwrap()
    };
    // body: raise 99.
    let body = {
        let mut builder = RawFunctionBuilder::new(vec![], types::any());
        let r = builder.literal(raiser);
        let payload = builder.literal(number::from_i64(99));
        builder
            .op(L1Op::PushLiteral(r))
            .op(L1Op::PushLiteral(payload))
            .op(L1Op::Apply { num_args: 1 })
            .op(L1Op::Return);
        raw_function::plain_function(builder.build().unwrap()).unwrap()
    };
    // handler: return the raised value unchanged.
    let handler = {
        let mut builder = RawFunctionBuilder::new(vec![types::any()], types::any());
        builder.op(L1Op::PushLocal(0)).op(L1Op::Return);
        raw_function::plain_function(builder.build().unwrap()).unwrap()
    };
    let catcher = primitive::catch_exception_function().unwrap();
    let result = expect_value(harness.run(&catcher, vec![body, handler]));
    assert_eq!(number::to_i64(&result), Some(99));
}

#[test]
fn unhandled_errors_abort_with_the_error_value() {
    let harness = Harness::new();
    let raiser = {
        let mut builder = RawFunctionBuilder::new(vec![types::any()], types::any());
        builder.primitive(primitive::P_RAISE_EXCEPTION);
        raw_function::plain_function(builder.build().unwrap()).unwrap()
    };
    match harness.run(&raiser, vec![tuple::string_from_str("boom")]) {
        Outcome::Failed { value, .. } => {
            assert_eq!(tuple::to_string(&value).unwrap(), "boom");
        }
        _ => panic!("expected failure"),
    }
}

#[test]
fn collections_build_from_the_stack() {
    let harness = Harness::new();
    let mut builder = RawFunctionBuilder::new(vec![], types::any());
    let lits: Vec<usize> = (1..=3)
        .map(|v| builder.literal(number::from_i64(v)))
        .collect();
    for &l in &lits {
        builder.op(L1Op::PushLiteral(l));
    }
    builder.op(L1Op::MakeTuple(3)).op(L1Op::Return);
    let function = raw_function::plain_function(builder.build().unwrap()).unwrap();
    let result = expect_value(harness.run(&function, vec![]));
    assert_eq!(tuple::size(&result).unwrap(), 3);
    assert_eq!(
        number::to_i64(&tuple::at(&result, 1).unwrap()),
        Some(1)
    );
    assert_eq!(
        number::to_i64(&tuple::at(&result, 3).unwrap()),
        Some(3)
    );
}

#[test]
fn locals_hold_variables() {
    let harness = Harness::new();
    let mut builder = RawFunctionBuilder::new(vec![], types::any());
    let seven = builder.literal(number::from_i64(7));
    builder.locals(1);
    builder
        .op(L1Op::PushLiteral(seven))
        .op(L1Op::SetLocal(0))
        .op(L1Op::GetLocal(0))
        .op(L1Op::Return);
    let function = raw_function::plain_function(builder.build().unwrap()).unwrap();
    let result = expect_value(harness.run(&function, vec![]));
    assert_eq!(number::to_i64(&result), Some(7));
}

#[test]
fn hot_functions_translate_to_chunks_and_invalidate() {
    let harness = Harness::new();
    let adder = primitive_function(
        primitive::P_ADDITION,
        vec![types::integers(), types::integers()],
        types::integers(),
    );
    let (atom, bundle) = define_method(
        &harness,
        "_plus_",
        vec![types::integers(), types::integers()],
        adder,
    );

    let mut caller = RawFunctionBuilder::new(
        vec![types::integers(), types::integers()],
        types::integers(),
    );
    let plus = caller.literal(atom);
    caller.countdown(1);
    caller
        .op(L1Op::PushLocal(0))
        .op(L1Op::PushLocal(1))
        .op(L1Op::Call {
            bundle_literal: plus,
            num_args: 2,
        })
        .op(L1Op::Return);
    let code = caller.build().unwrap();
    let caller = raw_function::plain_function(code.clone()).unwrap();

    // First call burns the countdown; the second translates and runs the
    // chunk.
    for _ in 0..3 {
        let v = expect_value(harness.run(
            &caller,
            vec![number::from_i64(20), number::from_i64(22)],
        ));
        assert_eq!(number::to_i64(&v), Some(42));
    }
    let chunk_id = raw_function::chunk_id(&code).unwrap();
    assert_ne!(chunk_id, 0, "hot function should have a chunk");
    let chunk = harness.chunks.get(chunk_id).unwrap();
    assert!(chunk.is_valid());
    assert_eq!(chunk.dependencies().len(), 1);

    // Mutating the method flips the validity flag.
    bundle
        .method()
        .add_definition(Definition::Method {
            signature: Signature::new(vec![types::any(), types::any()], types::any()),
            body: primitive_function(
                primitive::P_ADDITION,
                vec![types::any(), types::any()],
                types::any(),
            ),
        })
        .unwrap();
    assert!(!chunk.is_valid(), "definition change must invalidate");

    // The next call deoptimizes and still answers correctly through the
    // updated definition set.
    let v = expect_value(harness.run(
        &caller,
        vec![number::from_i64(20), number::from_i64(22)],
    ));
    assert_eq!(number::to_i64(&v), Some(42));
    assert_eq!(raw_function::chunk_id(&code).unwrap(), 0);
}

#[test]
fn ambiguous_send_fails_with_ambiguous_lookup() {
    let harness = Harness::new();
    let any_adder = primitive_function(
        primitive::P_ADDITION,
        vec![types::any(), types::any()],
        types::any(),
    );
    let (atom, bundle) = define_method(
        &harness,
        "_mix_",
        vec![types::integers(), types::any()],
        any_adder.clone(),
    );
    bundle
        .method()
        .add_definition(Definition::Method {
            signature: Signature::new(vec![types::any(), types::integers()], types::any()),
            body: any_adder,
        })
        .unwrap();

    let mut caller = RawFunctionBuilder::new(vec![], types::any());
    let mix = caller.literal(atom);
    let one = caller.literal(number::from_i64(1));
    let two = caller.literal(number::from_i64(2));
    caller
        .op(L1Op::PushLiteral(one))
        .op(L1Op::PushLiteral(two))
        .op(L1Op::Call {
            bundle_literal: mix,
            num_args: 2,
        })
        .op(L1Op::Return);
    let caller = raw_function::plain_function(caller.build().unwrap()).unwrap();
    match harness.run(&caller, vec![]) {
        Outcome::Failed { error, .. } => assert_eq!(error.kind, ErrorKind::AmbiguousLookup),
        _ => panic!("expected ambiguity"),
    }
}
