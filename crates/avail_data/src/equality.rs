//! Structural equality, the kind-dispatched hash, and coalescing.
//!
//! `equals` compares values by structure, never by representation: every
//! tuple kind compares elementwise, sets by membership, maps by per-key
//! lookup. Kinds with identity semantics (atoms, variables, functions, raw
//! functions, continuations, fiber handles) are equal only to themselves.
//!
//! When two *distinct* structurally-equal values are discovered, the less
//! compact one (by total reachable slot count) is rewritten into an
//! indirection to the other, so future comparisons short-circuit on
//! identity and the duplicate's storage can be reclaimed. The winner is
//! frozen (or left Shared); the transformation preserves hashes by
//! construction.

use avail_base::{AvailObject, Kind, Mutability};

use crate::atom;
use crate::character;
use crate::map;
use crate::number;
use crate::set;
use crate::tuple;
use crate::types;
use crate::values;

/// The 32-bit hash of any value. Stable across mutability transitions,
/// representation changes, and coalescing.
pub fn hash_of(obj: &AvailObject) -> u32 {
    let obj = obj.traverse();
    match obj.kind() {
        Kind::Nil => values::NIL_HASH,
        Kind::Boolean => {
            if obj.integer_slot(0) != 0 {
                values::TRUE_HASH
            } else {
                values::FALSE_HASH
            }
        }
        Kind::Character => character::hash_code_point(obj.integer_slot(0)),
        Kind::Atom => atom::hash(&obj).unwrap_or_else(|_| obj.identity_hash()),
        k if k.is_tuple() => tuple::hash(&obj).unwrap_or_else(|_| obj.identity_hash()),
        Kind::Set => set::hash(&obj).unwrap_or_else(|_| obj.identity_hash()),
        Kind::Map => map::hash(&obj).unwrap_or_else(|_| obj.identity_hash()),
        Kind::Integer
        | Kind::PositiveInfinity
        | Kind::NegativeInfinity
        | Kind::SingleFloat
        | Kind::DoubleFloat => number::hash_number(&obj).unwrap_or_else(|_| obj.identity_hash()),
        Kind::Type => types::hash(&obj).unwrap_or_else(|_| obj.identity_hash()),
        // Identity-semantics kinds, and bin internals that never escape
        // their container.
        _ => obj.identity_hash(),
    }
}

/// Structural equality. May coalesce the operands as a side effect.
pub fn equals(a: &AvailObject, b: &AvailObject) -> bool {
    let a = a.traverse();
    let b = b.traverse();
    if a.same_object(&b) {
        return true;
    }
    let equal = structurally_equal(&a, &b);
    if equal && coalescible(a.kind()) {
        coalesce(&a, &b);
    }
    equal
}

fn structurally_equal(a: &AvailObject, b: &AvailObject) -> bool {
    let (ka, kb) = (a.kind(), b.kind());
    if ka.is_tuple() && kb.is_tuple() {
        return tuples_equal(a, b);
    }
    match (ka, kb) {
        (Kind::Nil, Kind::Nil) => true,
        (Kind::Boolean, Kind::Boolean) => a.integer_slot(0) == b.integer_slot(0),
        (Kind::Character, Kind::Character) => a.integer_slot(0) == b.integer_slot(0),
        (Kind::Set, Kind::Set) => sets_equal(a, b),
        (Kind::Map, Kind::Map) => maps_equal(a, b),
        (Kind::Integer, Kind::Integer) => {
            a.integer_slots_snapshot() == b.integer_slots_snapshot()
        }
        (Kind::PositiveInfinity, Kind::PositiveInfinity) => true,
        (Kind::NegativeInfinity, Kind::NegativeInfinity) => true,
        (Kind::SingleFloat, Kind::SingleFloat) => {
            f32::from_bits(a.integer_slot(0)) == f32::from_bits(b.integer_slot(0))
        }
        (Kind::DoubleFloat, Kind::DoubleFloat) => {
            let bits = |o: &AvailObject| o.integer_slot(0) as u64 | ((o.integer_slot(1) as u64) << 32);
            f64::from_bits(bits(a)) == f64::from_bits(bits(b))
        }
        (Kind::Type, Kind::Type) => types_equal(a, b),
        // Atoms, variables, functions, raw functions, continuations, and
        // fiber handles have identity semantics; same_object already said no.
        _ => false,
    }
}

fn tuples_equal(a: &AvailObject, b: &AvailObject) -> bool {
    let (Ok(na), Ok(nb)) = (tuple::size(a), tuple::size(b)) else {
        return false;
    };
    if na != nb {
        return false;
    }
    if let (Ok(ha), Ok(hb)) = (tuple::hash(a), tuple::hash(b)) {
        if ha != hb {
            return false;
        }
    }
    for i in 1..=na {
        let (Ok(ea), Ok(eb)) = (tuple::at(a, i), tuple::at(b, i)) else {
            return false;
        };
        if !equals(&ea, &eb) {
            return false;
        }
    }
    true
}

fn sets_equal(a: &AvailObject, b: &AvailObject) -> bool {
    let (Ok(na), Ok(nb)) = (set::size(a), set::size(b)) else {
        return false;
    };
    if na != nb {
        return false;
    }
    let Ok(elements) = set::to_vec(a) else {
        return false;
    };
    elements
        .iter()
        .all(|element| set::has(b, element).unwrap_or(false))
}

fn maps_equal(a: &AvailObject, b: &AvailObject) -> bool {
    let (Ok(na), Ok(nb)) = (map::size(a), map::size(b)) else {
        return false;
    };
    if na != nb {
        return false;
    }
    let Ok(pairs) = map::to_pairs(a) else {
        return false;
    };
    pairs.iter().all(|(key, value)| {
        matches!(map::at(b, key), Ok(Some(found)) if equals(&found, value))
    })
}

fn types_equal(a: &AvailObject, b: &AvailObject) -> bool {
    if a.integer_slots_snapshot() != b.integer_slots_snapshot() {
        return false;
    }
    let pa = a.object_slots_snapshot();
    let pb = b.object_slots_snapshot();
    pa.len() == pb.len() && pa.iter().zip(&pb).all(|(x, y)| equals(x, y))
}

/// Kinds whose values are logically immutable and therefore safe to rewrite
/// into indirections when a structural twin is found.
fn coalescible(kind: Kind) -> bool {
    kind.is_tuple() || matches!(kind, Kind::Set | Kind::Map | Kind::Integer | Kind::Type)
}

fn coalesce(a: &AvailObject, b: &AvailObject) {
    let slots_a = a.total_slot_count();
    let slots_b = b.total_slot_count();
    // The more compact object survives; ties keep the left operand.
    let (winner, loser) = if slots_b < slots_a { (b, a) } else { (a, b) };
    if winner.mutability() != Mutability::Shared {
        winner.make_immutable();
    }
    loser.become_indirection_to(winner);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn representation_equal_tuples_coalesce() {
        let packed = tuple::string_from_str("coalesce me");
        let objects = tuple::object_tuple(
            "coalesce me".chars().map(character::from_char).collect(),
        );
        assert!(equals(&packed, &objects));
        // The object tuple is bulkier; it must have become the indirection.
        assert_eq!(objects.kind(), Kind::Indirection);
        assert!(objects.traverse().same_object(&packed));
        // Hash is preserved through the rewrite.
        assert_eq!(hash_of(&objects), hash_of(&packed));
    }

    #[test]
    fn unequal_values_do_not_coalesce() {
        let a = tuple::string_from_str("left");
        let b = tuple::string_from_str("right");
        assert!(!equals(&a, &b));
        assert_ne!(a.kind(), Kind::Indirection);
        assert_ne!(b.kind(), Kind::Indirection);
    }

    #[test]
    fn identity_kinds_never_equal_structurally() {
        let v1 = crate::variable::new(types::integers());
        let v2 = crate::variable::new(types::integers());
        assert!(!equals(&v1, &v2));
        assert!(equals(&v1, &v1));
    }

    #[test]
    fn hash_survives_mutability_transitions() {
        let t = tuple::string_from_str("frozen");
        let before = hash_of(&t);
        t.make_immutable();
        assert_eq!(hash_of(&t), before);
        t.make_shared();
        assert_eq!(hash_of(&t), before);
    }

    #[test]
    fn nan_is_not_equal_to_itself_structurally() {
        let a = number::single_from_f32(f32::NAN);
        let b = number::single_from_f32(f32::NAN);
        assert!(!equals(&a, &b));
    }

    #[test]
    fn cross_kind_comparisons_are_false() {
        assert!(!equals(&number::from_i64(0), &values::nil()));
        assert!(!equals(&tuple::empty(), &set::empty()));
    }
}
