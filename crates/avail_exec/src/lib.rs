//! The two-level execution engine.
//!
//! Level One is the portable layer: compiled code is a raw function holding
//! nybble-packed instructions and a literal pool, executed against reified
//! continuations (with native frames as a transparent fast path). Level Two
//! is a cache of optimized wordcode *chunks*: straight-line rewrites with
//! call sites resolved to their monomorphic targets, invalidated whenever a
//! method they depend on changes.
//!
//! ```text
//!            invoke function
//!                  │
//!        primitive? ──▶ attempt ──▶ success: push result
//!                  │                 failure: bind failure var, fall through
//!                  ▼
//!        chunk valid? ──▶ run wordcodes (Level Two)
//!                  │
//!                  ▼
//!        countdown zero? ──▶ translate a new chunk
//!                  │
//!                  ▼
//!        run nybblecodes (Level One)
//! ```
//!
//! The interpreter owns no fiber state: the scheduler passes a [`VmEnv`]
//! describing the current fiber's interrupt flags, variable tracer, and
//! allocation budget, and receives an [`Outcome`] telling it whether the
//! fiber returned, suspended, was interrupted, or failed.

pub mod chunk;
pub mod continuation;
pub mod interpreter;
pub mod nybblecodes;
pub mod primitive;
pub mod raw_function;

pub use chunk::{Chunk, ChunkRegistry};
pub use interpreter::{
    run_continuation, run_function, BundleResolver, Outcome, Resume, SuspendReason,
    VariableTracer, VmEnv,
};
pub use nybblecodes::L1Op;
pub use raw_function::RawFunctionBuilder;
