//! Object memory and descriptor dispatch for the Avail VM.
//!
//! Every Avail value is a single uniform heap record: a descriptor (kind +
//! mutability) plus two variable-length slot arrays: object slots holding
//! references to other objects, and integer slots holding raw 32-bit words.
//! Behavior is selected by the descriptor's kind; an operation applied to a
//! kind that does not support it reports a typed [`ErrorKind::NotSupported`]
//! error instead of dispatching to an abstract stub.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────┐
//! │                     AvailObject                      │
//! │  (shared handle; clone = new reference, not a copy)  │
//! └──────────────────────────────────────────────────────┘
//!                          │
//!                          ▼
//! ┌──────────────────────────────────────────────────────┐
//! │ Descriptor { kind, mutability }                      │
//! │ object slots: [AvailObject; fixed + variable]        │
//! │ integer slots: [u32; fixed + variable]               │
//! └──────────────────────────────────────────────────────┘
//! ```
//!
//! Mutability forms a one-way lattice: `Mutable → Immutable → Shared`. Once
//! an object is Shared it may be observed by any fiber and never reverts.
//!
//! Indirections are first-class: when two structurally equal objects are
//! discovered, the less compact one is rewritten in place into a forwarding
//! pointer to the other. [`AvailObject::traverse`] resolves the chain, and
//! every higher layer calls it at its boundaries so raw indirections are
//! never observed.

pub mod descriptor;
pub mod error;
pub mod hash;
pub mod object;

pub use descriptor::{Descriptor, Kind, Mutability, OpFamily};
pub use error::{ErrorKind, VmError, VmResult};
pub use object::{AvailObject, WeakAvailObject};
