//! Cross-module value properties: representation-independent hashing,
//! concatenation identities, set/map algebra, and coalescing.

use avail_base::{AvailObject, Kind};
use avail_data::{equality, map, number, set, tuple, values};

fn int(v: i64) -> AvailObject {
    number::from_i64(v)
}

fn int_tuple(values: &[i64]) -> AvailObject {
    tuple::from_values(values.iter().map(|&v| int(v)).collect())
}

#[test]
fn spliced_and_flat_tuples_agree_everywhere() {
    // A = [1,2,3,4,5] flat; B = [1,2,3] ++ [4,5] spliced.
    let a = tuple::object_tuple((1..=5).map(int).collect());
    let b = tuple::splice(&int_tuple(&[1, 2, 3]), &int_tuple(&[4, 5])).unwrap();
    assert_eq!(b.kind(), Kind::SplicedTuple);
    assert_eq!(
        tuple::hash(&a).unwrap(),
        tuple::hash(&b).unwrap(),
        "hash must not depend on representation"
    );
    assert_eq!(number::to_i64(&tuple::at(&b, 3).unwrap()), Some(3));
    assert!(equality::equals(&a, &b));
}

#[test]
fn concat_with_empty_is_identity_both_ways() {
    let t = int_tuple(&[9, 8, 7]);
    let e = tuple::empty();
    assert!(equality::equals(&tuple::concat(&e, &t).unwrap(), &t));
    assert!(equality::equals(&tuple::concat(&t, &e).unwrap(), &t));
}

#[test]
fn equal_sets_coalesce_after_comparison() {
    let mut left = set::empty();
    let mut right = set::empty();
    for v in 1..=1000 {
        left = set::with(&left, &int(v)).unwrap();
    }
    for v in (1..=1000).rev() {
        right = set::with(&right, &int(v)).unwrap();
    }
    assert!(equality::equals(&left, &right));
    // One of the roots has been rewritten into an indirection to the other.
    let left_forwards = left.kind() == Kind::Indirection;
    let right_forwards = right.kind() == Kind::Indirection;
    assert!(
        left_forwards ^ right_forwards,
        "exactly one of the equal sets must forward to the other"
    );
    let (forwarder, survivor) = if left_forwards {
        (&left, &right)
    } else {
        (&right, &left)
    };
    assert!(forwarder.traverse().same_object(&survivor.traverse()));
    // Membership and hashing keep working through the indirection.
    assert!(set::has(forwarder, &int(500)).unwrap());
    assert_eq!(set::hash(forwarder).unwrap(), set::hash(survivor).unwrap());
}

#[test]
fn set_insert_then_remove_is_observably_identity() {
    let base = {
        let mut s = set::empty();
        for v in 0..64 {
            s = set::with(&s, &int(v)).unwrap();
        }
        s
    };
    let through = set::without(&set::with(&base, &int(4096)).unwrap(), &int(4096)).unwrap();
    assert!(equality::equals(&through, &base));
    assert_eq!(set::hash(&through).unwrap(), set::hash(&base).unwrap());
}

#[test]
fn map_put_then_at_and_remove() {
    let m = map::put(&map::empty(), &int(1), &tuple::string_from_str("one")).unwrap();
    let found = map::at(&m, &int(1)).unwrap().unwrap();
    assert_eq!(tuple::to_string(&found).unwrap(), "one");
    let gone = map::remove(&m, &int(1)).unwrap();
    assert!(map::at(&gone, &int(1)).unwrap().is_none());
}

#[test]
fn hashes_survive_mutability_transitions() {
    let witnesses = [
        int_tuple(&[1, 2, 3]),
        set::from_values((0..10).map(int).collect()).unwrap(),
        map::put(&map::empty(), &int(1), &int(2)).unwrap(),
        number::from_i64(123456789),
        tuple::string_from_str("stable"),
    ];
    for value in witnesses {
        let before = equality::hash_of(&value);
        value.make_immutable();
        assert_eq!(equality::hash_of(&value), before);
        value.make_shared();
        assert_eq!(equality::hash_of(&value), before);
        assert_eq!(value.make_immutable().mutability(), value.mutability());
    }
}

#[test]
fn concat_hash_is_derivable_from_operand_hashes() {
    let a = int_tuple(&[1, 2, 3]);
    let b = int_tuple(&[4, 5]);
    let joined = tuple::concat(&a, &b).unwrap();
    let derived = avail_base::hash::tuple_concat_hash(
        tuple::hash(&a).unwrap(),
        3,
        tuple::hash(&b).unwrap(),
        2,
    );
    assert_eq!(tuple::hash(&joined).unwrap(), derived);
}

#[test]
fn nil_booleans_and_characters_are_plain_values() {
    assert!(equality::equals(&values::nil(), &values::nil()));
    assert!(equality::equals(&values::boolean(true), &values::boolean(true)));
    assert!(!equality::equals(
        &values::boolean(true),
        &values::boolean(false)
    ));
    assert!(!equality::equals(&values::nil(), &values::boolean(false)));
}

#[test]
fn packed_and_object_strings_interchange_as_map_keys() {
    let packed = tuple::string_from_str("key");
    let chars = tuple::object_tuple(
        "key".chars().map(avail_data::character::from_char).collect(),
    );
    let m = map::put(&map::empty(), &packed, &int(5)).unwrap();
    let hit = map::at(&m, &chars).unwrap().unwrap();
    assert_eq!(number::to_i64(&hit), Some(5));
}
