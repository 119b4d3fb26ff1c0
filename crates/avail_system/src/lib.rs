//! Fibers, scheduling, and the embedding API.
//!
//! This crate is the top of the stack: it owns the worker thread pool, the
//! timer source, the runtime-wide registries (atoms, bundles, fibers,
//! chunks), and the surface embedders program against.
//!
//! # Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────────┐
//! │                       Runtime                         │
//! │  atom table · bundle registry · chunk registry        │
//! │  allocation budget · loading gate · singletons        │
//! └───────────────────────────────────────────────────────┘
//!         │                    │                   │
//!         ▼                    ▼                   ▼
//! ┌───────────────┐   ┌────────────────┐   ┌──────────────┐
//! │   Scheduler   │   │  TimerService  │   │  Serializer  │
//! │ priority run  │   │ deadline heap, │   │ per-kind ops │
//! │ queues + pool │   │ cancellation   │   │ + crc32      │
//! └───────────────┘   └────────────────┘   └──────────────┘
//!         │
//!         ▼
//! ┌───────────────┐
//! │     Fiber     │  state machine, flags, joiners, locals
//! └───────────────┘
//! ```
//!
//! A worker picks the highest-priority runnable fiber (with a periodic
//! anti-starvation pass), drives the interpreter until an outcome, and
//! reacts: delivering results to success callbacks, parking joiners,
//! scheduling timer wake-ups, or aborting on cancellation. Fibers migrate
//! between threads only at these outcome boundaries, never mid-execution.

pub mod config;
pub mod fiber;
pub mod loader;
pub mod runtime;
pub mod scheduler;
pub mod serializer;
pub mod timer;

pub use config::RuntimeConfig;
pub use fiber::{ExecutionState, Fiber, FiberId};
pub use loader::{FileManager, ModuleLoader, ModuleRootResolver};
pub use runtime::{FiberSnapshot, FrameSnapshot, Runtime};
pub use serializer::{Deserializer, Serializer};
