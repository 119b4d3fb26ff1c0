//! The uniform heap object.
//!
//! An [`AvailObject`] is a cheap clonable handle (reference semantics) to a
//! locked slot record. All state, including the descriptor itself, lives
//! behind one per-object lock, which is what makes descriptor swaps
//! (make-shared, become-indirection) safe publication points.
//!
//! Accessors take the lock for the duration of a single slot read or write,
//! never across a call into another object, so operations over two objects
//! (equality, coalescing) cannot deadlock on object locks.
//!
//! Slot-bounds violations are programming errors, not runtime conditions:
//! they panic (in both build profiles the underlying `Vec` index does).

use std::sync::{Arc, Weak};

use parking_lot::RwLock;
use rustc_hash::FxHashSet;

use crate::descriptor::{Descriptor, Kind, Mutability};
use crate::hash::mix;

#[derive(Debug)]
struct ObjState {
    descriptor: Descriptor,
    object_slots: Vec<AvailObject>,
    integer_slots: Vec<u32>,
}

/// A shared handle to one uniform heap object.
#[derive(Clone)]
pub struct AvailObject(Arc<RwLock<ObjState>>);

/// A non-owning handle, used by fiber variable-trace sets so the collector
/// can reclaim traced variables.
#[derive(Clone, Debug)]
pub struct WeakAvailObject(Weak<RwLock<ObjState>>);

impl WeakAvailObject {
    /// Recovers a strong handle if the object is still alive.
    pub fn upgrade(&self) -> Option<AvailObject> {
        self.0.upgrade().map(AvailObject)
    }

    /// Stable address of the referent, whether or not it is alive.
    pub fn addr(&self) -> usize {
        self.0.as_ptr() as usize
    }
}

impl AvailObject {
    /// Allocates an object with the given variable-slot counts, object slots
    /// filled with nil and integer slots zeroed.
    ///
    /// The fixed-slot counts come from the descriptor's kind; `n_obj` and
    /// `n_int` extend only the variable regions and must be zero for kinds
    /// without one.
    pub fn allocate(descriptor: Descriptor, n_obj: usize, n_int: usize) -> AvailObject {
        let info = descriptor.kind.info();
        debug_assert!(n_obj == 0 || info.variable_object_slots);
        debug_assert!(n_int == 0 || info.variable_integer_slots);
        let total_obj = info.fixed_object_slots + n_obj;
        let total_int = info.fixed_integer_slots + n_int;
        let fill = AvailObject::nil();
        let mut object_slots = Vec::with_capacity(total_obj);
        object_slots.resize_with(total_obj, || fill.clone());
        AvailObject(Arc::new(RwLock::new(ObjState {
            descriptor,
            object_slots,
            integer_slots: vec![0; total_int],
        })))
    }

    /// Allocates an object directly from its slot vectors.
    ///
    /// Panics if the slot counts contradict the kind's layout row.
    pub fn with_slots(
        descriptor: Descriptor,
        object_slots: Vec<AvailObject>,
        integer_slots: Vec<u32>,
    ) -> AvailObject {
        let info = descriptor.kind.info();
        assert!(
            object_slots.len() >= info.fixed_object_slots
                && (info.variable_object_slots || object_slots.len() == info.fixed_object_slots),
            "{}: bad object slot count {}",
            info.name,
            object_slots.len()
        );
        assert!(
            integer_slots.len() >= info.fixed_integer_slots
                && (info.variable_integer_slots
                    || integer_slots.len() == info.fixed_integer_slots),
            "{}: bad integer slot count {}",
            info.name,
            integer_slots.len()
        );
        AvailObject(Arc::new(RwLock::new(ObjState {
            descriptor,
            object_slots,
            integer_slots,
        })))
    }

    /// A fresh nil object. Nil compares structurally equal to every other
    /// nil, so callers needing the singleton identity go through the runtime.
    pub fn nil() -> AvailObject {
        AvailObject(Arc::new(RwLock::new(ObjState {
            descriptor: Descriptor::shared(Kind::Nil),
            object_slots: Vec::new(),
            integer_slots: Vec::new(),
        })))
    }

    /// The current descriptor (kind + mutability), without traversal.
    pub fn descriptor(&self) -> Descriptor {
        self.0.read().descriptor
    }

    /// The current kind, without traversal.
    pub fn kind(&self) -> Kind {
        self.0.read().descriptor.kind
    }

    /// The current mutability.
    pub fn mutability(&self) -> Mutability {
        self.0.read().descriptor.mutability
    }

    /// Whether this object (after traversal) is nil.
    pub fn is_nil(&self) -> bool {
        self.traverse().kind() == Kind::Nil
    }

    /// Follows indirection forwarding to the canonical object.
    pub fn traverse(&self) -> AvailObject {
        let mut current = self.clone();
        loop {
            let next = {
                let state = current.0.read();
                if state.descriptor.kind != Kind::Indirection {
                    return current.clone();
                }
                state.object_slots[0].clone()
            };
            current = next;
        }
    }

    /// Reads an object slot.
    pub fn object_slot(&self, index: usize) -> AvailObject {
        self.0.read().object_slots[index].clone()
    }

    /// Writes an object slot.
    pub fn set_object_slot(&self, index: usize, value: AvailObject) {
        self.0.write().object_slots[index] = value;
    }

    /// Reads an integer slot.
    pub fn integer_slot(&self, index: usize) -> u32 {
        self.0.read().integer_slots[index]
    }

    /// Writes an integer slot.
    pub fn set_integer_slot(&self, index: usize, value: u32) {
        self.0.write().integer_slots[index] = value;
    }

    /// Total object-slot count (fixed + variable).
    pub fn object_slot_count(&self) -> usize {
        self.0.read().object_slots.len()
    }

    /// Total integer-slot count (fixed + variable).
    pub fn integer_slot_count(&self) -> usize {
        self.0.read().integer_slots.len()
    }

    /// Number of object slots beyond the fixed region.
    pub fn variable_object_count(&self) -> usize {
        let state = self.0.read();
        state.object_slots.len() - state.descriptor.kind.info().fixed_object_slots
    }

    /// Number of integer slots beyond the fixed region.
    pub fn variable_integer_count(&self) -> usize {
        let state = self.0.read();
        state.integer_slots.len() - state.descriptor.kind.info().fixed_integer_slots
    }

    /// Snapshot of all object slots under one lock acquisition.
    pub fn object_slots_snapshot(&self) -> Vec<AvailObject> {
        self.0.read().object_slots.clone()
    }

    /// Snapshot of all integer slots under one lock acquisition.
    pub fn integer_slots_snapshot(&self) -> Vec<u32> {
        self.0.read().integer_slots.clone()
    }

    /// Runs `f` with exclusive access to both slot vectors.
    ///
    /// This is the atomicity primitive for read-modify-write cells
    /// (variables). `f` must not touch other objects' locked state: calling
    /// back into an accessor of this same object would deadlock.
    pub fn with_slots_mut<R>(
        &self,
        f: impl FnOnce(&mut Vec<AvailObject>, &mut Vec<u32>) -> R,
    ) -> R {
        let mut state = self.0.write();
        let state = &mut *state;
        f(&mut state.object_slots, &mut state.integer_slots)
    }

    /// Identity comparison: same heap record, ignoring indirections.
    pub fn same_object(&self, other: &AvailObject) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }

    /// Stable address, used for identity hashing and visited sets.
    pub fn addr(&self) -> usize {
        Arc::as_ptr(&self.0) as *const () as usize
    }

    /// Identity hash, stable for the object's lifetime.
    pub fn identity_hash(&self) -> u32 {
        let a = self.addr();
        mix((a as u32) ^ ((a >> 32) as u32))
    }

    /// Downgrades to a non-owning handle.
    pub fn downgrade(&self) -> WeakAvailObject {
        WeakAvailObject(Arc::downgrade(&self.0))
    }

    /// Rewrites this object in place into an indirection to `target`.
    ///
    /// The mutability is preserved so a Shared object stays safely visible;
    /// slot contents are dropped. Callers must have established structural
    /// equality first; this is the hash-preserving half of coalescing.
    pub fn become_indirection_to(&self, target: &AvailObject) {
        debug_assert!(!self.same_object(target));
        let mut state = self.0.write();
        let mutability = state.descriptor.mutability;
        state.descriptor = Descriptor {
            kind: Kind::Indirection,
            mutability,
        };
        state.object_slots = vec![target.clone()];
        state.integer_slots = Vec::new();
    }

    /// Recursively freezes this object: every reachable Mutable object
    /// becomes Immutable. Idempotent; Shared objects are left alone.
    pub fn make_immutable(&self) -> AvailObject {
        self.transition(Mutability::Immutable);
        self.clone()
    }

    /// Recursively publishes this object: every reachable non-Shared object
    /// becomes Shared. This is the only sanctioned way to let another fiber
    /// observe a previously Mutable object.
    pub fn make_shared(&self) -> AvailObject {
        self.transition(Mutability::Shared);
        self.clone()
    }

    fn transition(&self, to: Mutability) {
        let mut visited: FxHashSet<usize> = FxHashSet::default();
        let mut work = vec![self.clone()];
        while let Some(obj) = work.pop() {
            if !visited.insert(obj.addr()) {
                continue;
            }
            let children = {
                let mut state = obj.0.write();
                let from = state.descriptor.mutability;
                if from == to || !from.may_become(to) {
                    // Already at or past the target. Transitions always
                    // recurse, so a frozen object's subtree is frozen too.
                    None
                } else {
                    state.descriptor.mutability = to;
                    Some(state.object_slots.clone())
                }
            };
            if let Some(children) = children {
                work.extend(children);
            }
        }
    }

    /// Total slot count of the object graph reachable from here, used to
    /// pick the more compact representative when coalescing.
    pub fn total_slot_count(&self) -> usize {
        let mut visited: FxHashSet<usize> = FxHashSet::default();
        let mut work = vec![self.clone()];
        let mut total = 0usize;
        while let Some(obj) = work.pop() {
            if !visited.insert(obj.addr()) {
                continue;
            }
            let state = obj.0.read();
            total += state.object_slots.len() + state.integer_slots.len();
            work.extend(state.object_slots.iter().cloned());
        }
        total
    }
}

impl std::fmt::Debug for AvailObject {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.0.read();
        write!(
            f,
            "{}[{:?}, {} obj, {} int]",
            state.descriptor.kind.info().name,
            state.descriptor.mutability,
            state.object_slots.len(),
            state.integer_slots.len()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocate_fills_slots() {
        let obj = AvailObject::allocate(Descriptor::mutable(Kind::ObjectTuple), 3, 0);
        assert_eq!(obj.object_slot_count(), 3);
        assert_eq!(obj.integer_slot_count(), 1);
        assert!(obj.object_slot(0).is_nil());
        assert_eq!(obj.integer_slot(0), 0);
    }

    #[test]
    fn slot_write_read_round_trip() {
        let obj = AvailObject::allocate(Descriptor::mutable(Kind::ObjectTuple), 2, 0);
        let nested = AvailObject::allocate(Descriptor::mutable(Kind::ObjectTuple), 0, 0);
        obj.set_object_slot(0, nested.clone());
        assert!(obj.object_slot(0).same_object(&nested));
        obj.set_integer_slot(0, 0xDEAD_BEEF);
        assert_eq!(obj.integer_slot(0), 0xDEAD_BEEF);
    }

    #[test]
    #[should_panic]
    fn out_of_bounds_slot_panics() {
        let obj = AvailObject::allocate(Descriptor::mutable(Kind::ObjectTuple), 1, 0);
        obj.object_slot(5);
    }

    #[test]
    fn traverse_follows_indirection_chains() {
        let a = AvailObject::allocate(Descriptor::mutable(Kind::ObjectTuple), 0, 0);
        let b = AvailObject::allocate(Descriptor::mutable(Kind::ObjectTuple), 0, 0);
        let c = AvailObject::allocate(Descriptor::mutable(Kind::ObjectTuple), 0, 0);
        a.become_indirection_to(&b);
        b.become_indirection_to(&c);
        assert!(a.traverse().same_object(&c));
        assert!(c.traverse().same_object(&c));
    }

    #[test]
    fn make_immutable_is_idempotent_and_recursive() {
        let inner = AvailObject::allocate(Descriptor::mutable(Kind::ObjectTuple), 0, 0);
        let outer = AvailObject::allocate(Descriptor::mutable(Kind::ObjectTuple), 1, 0);
        outer.set_object_slot(0, inner.clone());
        outer.make_immutable();
        assert_eq!(outer.mutability(), Mutability::Immutable);
        assert_eq!(inner.mutability(), Mutability::Immutable);
        outer.make_immutable();
        assert_eq!(outer.mutability(), Mutability::Immutable);
    }

    #[test]
    fn once_shared_never_reverts() {
        let obj = AvailObject::allocate(Descriptor::mutable(Kind::ObjectTuple), 0, 0);
        obj.make_shared();
        assert_eq!(obj.mutability(), Mutability::Shared);
        obj.make_immutable();
        assert_eq!(obj.mutability(), Mutability::Shared);
    }

    #[test]
    fn make_shared_handles_cycles() {
        let a = AvailObject::allocate(Descriptor::mutable(Kind::ObjectTuple), 1, 0);
        let b = AvailObject::allocate(Descriptor::mutable(Kind::ObjectTuple), 1, 0);
        a.set_object_slot(0, b.clone());
        b.set_object_slot(0, a.clone());
        a.make_shared();
        assert_eq!(a.mutability(), Mutability::Shared);
        assert_eq!(b.mutability(), Mutability::Shared);
    }

    #[test]
    fn identity_hash_is_stable() {
        let obj = AvailObject::nil();
        assert_eq!(obj.identity_hash(), obj.clone().identity_hash());
    }

    #[test]
    fn become_indirection_preserves_mutability() {
        let a = AvailObject::allocate(Descriptor::mutable(Kind::ObjectTuple), 0, 0);
        a.make_shared();
        let b = AvailObject::allocate(Descriptor::mutable(Kind::ObjectTuple), 0, 0);
        a.become_indirection_to(&b);
        assert_eq!(a.kind(), Kind::Indirection);
        assert_eq!(a.mutability(), Mutability::Shared);
    }
}
