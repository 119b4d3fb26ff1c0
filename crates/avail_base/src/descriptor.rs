//! Descriptors: the per-kind behavior carriers.
//!
//! The source model's deep descriptor inheritance collapses here into a
//! copyable `(kind, mutability)` pair. A [`Kind`] selects one of the concrete
//! layouts; a [`KindInfo`] table declares each kind's fixed slot counts,
//! whether trailing slots are variable-length, and which operation families
//! the kind participates in. Operations consult [`Kind::supports`] and report
//! `NotSupported` for everything else; there are no abstract stubs.

/// Mutability of a heap object.
///
/// The lattice is one-way: `Mutable → Immutable → Shared`. A Mutable object
/// has a single owning fiber; an Immutable object may be referenced freely
/// within a fiber; a Shared object may be observed by any fiber. Once Shared,
/// an object never reverts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Mutability {
    /// Writable, visible only to the owning fiber.
    Mutable,
    /// Frozen, but not yet published across fibers.
    Immutable,
    /// Frozen or lock-mediated, visible to every fiber.
    Shared,
}

impl Mutability {
    /// Whether a transition from `self` to `to` moves forward (or stays put)
    /// in the mutability lattice.
    pub fn may_become(self, to: Mutability) -> bool {
        use Mutability::*;
        matches!(
            (self, to),
            (Mutable, _) | (Immutable, Immutable) | (Immutable, Shared) | (Shared, Shared)
        )
    }
}

/// Families of operations a kind can participate in.
///
/// The source's abstract descriptors each contributed a bag of overridable
/// operations; the union of both typing revisions is flattened into these
/// families. A kind supports an operation iff its info row lists the
/// operation's family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OpFamily {
    /// Hashing and structural equality (every kind).
    Value,
    /// Ordered-sequence operations: size, element access, concat, slice.
    Tuple,
    /// Membership, insertion, removal over unordered unique elements.
    Set,
    /// Keyed lookup, insertion, removal.
    Map,
    /// Arithmetic and comparison.
    Number,
    /// Name, issuing module, property map.
    Atom,
    /// Atomic cell read/write and observer management.
    Variable,
    /// Invocation: code, outers, parameter and return types.
    Function,
    /// Frame access: caller, program counter, frame slots.
    Continuation,
    /// Subtype tests and instance checks.
    Type,
    /// Code-point access.
    Character,
    /// Scheduler handle operations.
    Fiber,
}

/// The concrete object kinds.
///
/// One tag per layout. Specialised tuple representations are distinct kinds
/// that share the `Tuple` family and must hash and compare identically to an
/// object-tuple of the same elements.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Kind {
    /// The unique placeholder value.
    Nil,
    /// `true` or `false`, payload in one integer slot.
    Boolean,
    /// A Unicode scalar value.
    Character,
    /// Interned module-scoped name with a property map.
    Atom,
    /// Tuple of characters with code points ≤ 255, packed four per word.
    ByteString,
    /// Tuple of characters with code points ≤ 65535, packed two per word.
    TwoByteString,
    /// Tuple of arbitrary objects, one object slot per element.
    ObjectTuple,
    /// Tuple of integers 0..=255, packed four per word.
    ByteTuple,
    /// Tuple of integers 0..=15, packed eight per word.
    NybbleTuple,
    /// Concatenation node over two sub-tuples.
    SplicedTuple,
    /// Hash-array-mapped-trie set root.
    Set,
    /// Set trie node storing elements linearly.
    SetLinearBin,
    /// Set trie node with a 32-way population bitmap.
    SetHashedBin,
    /// Hash-array-mapped-trie map root.
    Map,
    /// Map trie node storing key/value pairs linearly.
    MapLinearBin,
    /// Map trie node with a 32-way population bitmap.
    MapHashedBin,
    /// Signed-magnitude variable-precision integer.
    Integer,
    /// The value `∞`.
    PositiveInfinity,
    /// The value `-∞`.
    NegativeInfinity,
    /// IEEE-754 single-precision float.
    SingleFloat,
    /// IEEE-754 double-precision float.
    DoubleFloat,
    /// A raw function closed over captured outer variables.
    Function,
    /// Compiled code: nybblecodes, literals, counts, chunk reference.
    RawFunction,
    /// A reified call frame.
    Continuation,
    /// An atomic cell with a declared inner type.
    Variable,
    /// A handle naming a scheduler fiber.
    FiberHandle,
    /// A type in the metatype lattice, discriminated by an integer tag.
    Type,
    /// A forwarding pointer left behind by coalescing.
    Indirection,
}

/// Static layout and capability facts about a kind.
#[derive(Debug, Clone, Copy)]
pub struct KindInfo {
    /// Canonical display name.
    pub name: &'static str,
    /// Number of named object slots before any variable-length region.
    pub fixed_object_slots: usize,
    /// Number of named integer slots before any variable-length region.
    pub fixed_integer_slots: usize,
    /// Whether a variable-length object-slot region follows the fixed slots.
    pub variable_object_slots: bool,
    /// Whether a variable-length integer-slot region follows the fixed slots.
    pub variable_integer_slots: bool,
    /// Operation families this kind participates in.
    pub families: &'static [OpFamily],
}

use OpFamily as F;

impl Kind {
    /// The layout and capability row for this kind.
    pub fn info(self) -> &'static KindInfo {
        macro_rules! row {
            ($name:literal, $fo:expr, $fi:expr, $vo:expr, $vi:expr, $fams:expr) => {
                &KindInfo {
                    name: $name,
                    fixed_object_slots: $fo,
                    fixed_integer_slots: $fi,
                    variable_object_slots: $vo,
                    variable_integer_slots: $vi,
                    families: $fams,
                }
            };
        }
        match self {
            Kind::Nil => row!("nil", 0, 0, false, false, &[F::Value]),
            Kind::Boolean => row!("boolean", 0, 1, false, false, &[F::Value]),
            Kind::Character => row!("character", 0, 1, false, false, &[F::Value, F::Character]),
            Kind::Atom => row!("atom", 3, 1, false, false, &[F::Value, F::Atom]),
            Kind::ByteString => {
                row!("byte string", 0, 2, false, true, &[F::Value, F::Tuple])
            }
            Kind::TwoByteString => {
                row!("two-byte string", 0, 2, false, true, &[F::Value, F::Tuple])
            }
            Kind::ObjectTuple => row!("object tuple", 0, 1, true, false, &[F::Value, F::Tuple]),
            Kind::ByteTuple => row!("byte tuple", 0, 2, false, true, &[F::Value, F::Tuple]),
            Kind::NybbleTuple => row!("nybble tuple", 0, 2, false, true, &[F::Value, F::Tuple]),
            Kind::SplicedTuple => row!("spliced tuple", 2, 3, false, false, &[F::Value, F::Tuple]),
            Kind::Set => row!("set", 1, 2, false, false, &[F::Value, F::Set]),
            Kind::SetLinearBin => row!("set linear bin", 0, 0, true, false, &[F::Value]),
            Kind::SetHashedBin => row!("set hashed bin", 0, 1, true, false, &[F::Value]),
            Kind::Map => row!("map", 1, 2, false, false, &[F::Value, F::Map]),
            Kind::MapLinearBin => row!("map linear bin", 0, 0, true, false, &[F::Value]),
            Kind::MapHashedBin => row!("map hashed bin", 0, 1, true, false, &[F::Value]),
            Kind::Integer => row!("integer", 0, 1, false, true, &[F::Value, F::Number]),
            Kind::PositiveInfinity => row!("∞", 0, 0, false, false, &[F::Value, F::Number]),
            Kind::NegativeInfinity => row!("-∞", 0, 0, false, false, &[F::Value, F::Number]),
            Kind::SingleFloat => row!("float", 0, 1, false, false, &[F::Value, F::Number]),
            Kind::DoubleFloat => row!("double", 0, 2, false, false, &[F::Value, F::Number]),
            Kind::Function => row!("function", 1, 0, true, false, &[F::Value, F::Function]),
            Kind::RawFunction => row!("raw function", 5, 6, false, false, &[F::Value, F::Function]),
            Kind::Continuation => {
                row!("continuation", 2, 4, true, false, &[F::Value, F::Continuation])
            }
            Kind::Variable => row!("variable", 3, 1, false, false, &[F::Value, F::Variable]),
            Kind::FiberHandle => row!("fiber", 0, 2, false, false, &[F::Value, F::Fiber]),
            Kind::Type => row!("type", 0, 2, true, false, &[F::Value, F::Type]),
            Kind::Indirection => row!("indirection", 1, 0, false, false, &[]),
        }
    }

    /// Whether this kind participates in the given operation family.
    pub fn supports(self, family: OpFamily) -> bool {
        self.info().families.contains(&family)
    }

    /// Whether this kind is one of the tuple representations.
    pub fn is_tuple(self) -> bool {
        self.supports(OpFamily::Tuple)
    }
}

/// The behavior carrier attached to every object: kind plus mutability.
///
/// Conceptually a singleton per `(kind, mutability)` pair; encoded as a
/// copyable value so the mutability transition graph is a single code path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Descriptor {
    pub kind: Kind,
    pub mutability: Mutability,
}

impl Descriptor {
    /// A mutable descriptor of the given kind.
    pub fn mutable(kind: Kind) -> Self {
        Descriptor {
            kind,
            mutability: Mutability::Mutable,
        }
    }

    /// An immutable descriptor of the given kind.
    pub fn immutable(kind: Kind) -> Self {
        Descriptor {
            kind,
            mutability: Mutability::Immutable,
        }
    }

    /// A shared descriptor of the given kind.
    pub fn shared(kind: Kind) -> Self {
        Descriptor {
            kind,
            mutability: Mutability::Shared,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mutability_lattice_is_one_way() {
        use Mutability::*;
        assert!(Mutable.may_become(Immutable));
        assert!(Mutable.may_become(Shared));
        assert!(Immutable.may_become(Shared));
        assert!(!Immutable.may_become(Mutable));
        assert!(!Shared.may_become(Immutable));
        assert!(!Shared.may_become(Mutable));
    }

    #[test]
    fn every_kind_supports_value_except_indirection() {
        let kinds = [
            Kind::Nil,
            Kind::Boolean,
            Kind::Character,
            Kind::Atom,
            Kind::ByteString,
            Kind::ObjectTuple,
            Kind::Set,
            Kind::Map,
            Kind::Integer,
            Kind::Function,
            Kind::Continuation,
            Kind::Variable,
            Kind::Type,
        ];
        for kind in kinds {
            assert!(kind.supports(OpFamily::Value), "{:?}", kind);
        }
        assert!(!Kind::Indirection.supports(OpFamily::Value));
    }

    #[test]
    fn tuple_representations_share_the_tuple_family() {
        for kind in [
            Kind::ByteString,
            Kind::TwoByteString,
            Kind::ObjectTuple,
            Kind::ByteTuple,
            Kind::NybbleTuple,
            Kind::SplicedTuple,
        ] {
            assert!(kind.is_tuple(), "{:?}", kind);
        }
        assert!(!Kind::Set.is_tuple());
    }

    #[test]
    fn sets_do_not_support_map_operations() {
        assert!(Kind::Set.supports(OpFamily::Set));
        assert!(!Kind::Set.supports(OpFamily::Map));
        assert!(!Kind::Set.supports(OpFamily::Tuple));
    }
}
