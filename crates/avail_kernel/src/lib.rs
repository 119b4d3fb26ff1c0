//! The method dispatch graph and message-bundle trees.
//!
//! This crate is the shared heart of runtime dispatch and parsing:
//!
//! ```text
//! atom ──▶ MessageBundle ──▶ Method ──▶ [Definition, ...]
//!              │                │             │
//!              │                └─ testing tree (value dispatch cache)
//!              │
//!              ├─ parsing instructions (from the message splitter)
//!              ├─ grammatical restrictions
//!              └─ parsing plans ──▶ BundleTree (lazily expanded trie)
//! ```
//!
//! A method name like `"_+_"` is split once into keyword parts and a tuple
//! of parsing instructions. Those instructions drive two consumers: the
//! parser walks a [`bundle_tree::BundleTree`] whose edges are instructions,
//! and the runtime selects definitions through a per-method
//! [`lookup_tree::LookupTree`].
//!
//! Mutations (adding a definition, adding a grammatical restriction) bump
//! the grammar epoch; expanded bundle-tree nodes notice the stale epoch and
//! re-expand lazily along the affected paths. The same mutations walk the
//! method's dependent-chunk list so optimized code is never consulted after
//! the dispatch graph changed underneath it.
//!
//! Lock order (matching the rest of the VM): Method → Bundle → BundleTree →
//! chunk dependents. All locks here are leaf-scoped and never held across a
//! call back up the stack.

pub mod bundle;
pub mod bundle_tree;
pub mod instruction;
pub mod lookup_tree;
pub mod method;
pub mod restriction;
pub mod splitter;

pub use bundle::{MessageBundle, ParsingPlan};
pub use bundle_tree::{BundleTree, PlanInProgress};
pub use instruction::ParsingInstruction;
pub use method::{ChunkDependent, Definition, Method, Signature};
pub use restriction::GrammaticalRestriction;
