//! Tuples: one logical sequence type, five physical representations.
//!
//! | Kind | Storage | Element |
//! |------|---------|---------|
//! | `ObjectTuple` | one object slot per element | any value |
//! | `ByteString` | four code points per word | characters ≤ U+00FF |
//! | `TwoByteString` | two code points per word | characters ≤ U+FFFF |
//! | `ByteTuple` | four integers per word | integers 0..=255 |
//! | `NybbleTuple` | eight integers per word | integers 0..=15 |
//! | `SplicedTuple` | left + right sub-tuples | composite |
//!
//! All representations hash identically and compare equal for the same
//! element sequence. Indices are 1-based throughout, matching the language's
//! view of tuples.
//!
//! Concatenation of two large tuples builds a spliced node in O(1); element
//! access through a splice tree is O(log n) in the number of splice nodes.
//! Every tuple caches its hash in integer slot 0 (`0` = not yet computed).

use avail_base::hash::{tuple_concat_hash, tuple_finish, tuple_fold};
use avail_base::{AvailObject, Descriptor, ErrorKind, Kind, VmError, VmResult};

use crate::character;
use crate::equality;
use crate::number;

/// Integer slot caching the hash for every tuple representation.
const HASH_OR_ZERO: usize = 0;
/// Integer slot holding the element count for packed representations.
const SIZE: usize = 1;
/// First packed-data integer slot.
const PACKED: usize = 2;

/// Spliced-tuple object slots.
const LEFT: usize = 0;
const RIGHT: usize = 1;
/// Spliced-tuple integer slot holding the left sub-tuple's size.
const LEFT_SIZE: usize = 2;

/// Tuples no larger than this are flattened on concatenation instead of
/// building a splice node.
const SPLICE_THRESHOLD: usize = 32;

fn expect_tuple(obj: &AvailObject) -> VmResult<AvailObject> {
    let obj = obj.traverse();
    if obj.kind().is_tuple() {
        Ok(obj)
    } else {
        Err(VmError::with_detail(
            ErrorKind::NotSupported,
            format!("{:?} is not a tuple", obj.kind()),
        ))
    }
}

/// The empty tuple.
pub fn empty() -> AvailObject {
    AvailObject::allocate(Descriptor::mutable(Kind::ObjectTuple), 0, 0)
}

/// An object-tuple over the given elements, with no re-representation.
pub fn object_tuple(elements: Vec<AvailObject>) -> AvailObject {
    let ints = vec![0u32];
    AvailObject::with_slots(Descriptor::mutable(Kind::ObjectTuple), elements, ints)
}

/// A tuple over the given elements, choosing the most compact
/// representation that can hold them.
pub fn from_values(elements: Vec<AvailObject>) -> AvailObject {
    if elements.is_empty() {
        return empty();
    }
    let mut max_code_point: Option<u32> = Some(0);
    let mut max_small_int: Option<u32> = Some(0);
    for element in &elements {
        let element = element.traverse();
        match element.kind() {
            Kind::Character => {
                max_small_int = None;
                if let Some(m) = max_code_point {
                    max_code_point = Some(m.max(element.integer_slot(0)));
                }
            }
            Kind::Integer => {
                max_code_point = None;
                match (max_small_int, number::to_u32(&element)) {
                    (Some(m), Some(v)) => max_small_int = Some(m.max(v)),
                    _ => max_small_int = None,
                }
            }
            _ => {
                max_code_point = None;
                max_small_int = None;
            }
        }
        if max_code_point.is_none() && max_small_int.is_none() {
            break;
        }
    }
    match (max_code_point, max_small_int) {
        (Some(m), _) if m <= 0xFF => {
            packed_from(Kind::ByteString, elements.len(), 4, 8, |i| {
                elements[i].traverse().integer_slot(0)
            })
        }
        (Some(m), _) if m <= 0xFFFF => {
            packed_from(Kind::TwoByteString, elements.len(), 2, 16, |i| {
                elements[i].traverse().integer_slot(0)
            })
        }
        (_, Some(m)) if m <= 0xF => packed_from(Kind::NybbleTuple, elements.len(), 8, 4, |i| {
            number::to_u32(&elements[i].traverse()).unwrap_or(0)
        }),
        (_, Some(m)) if m <= 0xFF => packed_from(Kind::ByteTuple, elements.len(), 4, 8, |i| {
            number::to_u32(&elements[i].traverse()).unwrap_or(0)
        }),
        _ => object_tuple(elements),
    }
}

fn packed_from(
    kind: Kind,
    size: usize,
    per_word: usize,
    bits: u32,
    unit: impl Fn(usize) -> u32,
) -> AvailObject {
    let words = size.div_ceil(per_word);
    let mut ints = vec![0u32; PACKED + words];
    ints[SIZE] = size as u32;
    for i in 0..size {
        let shift = (i % per_word) as u32 * bits;
        ints[PACKED + i / per_word] |= unit(i) << shift;
    }
    AvailObject::with_slots(Descriptor::mutable(kind), Vec::new(), ints)
}

/// A string tuple for the given text, packed as tightly as its widest
/// character allows.
pub fn string_from_str(text: &str) -> AvailObject {
    let max = text.chars().map(|c| c as u32).max().unwrap_or(0);
    if max <= 0xFFFF {
        let units: Vec<u32> = text.chars().map(|c| c as u32).collect();
        if max <= 0xFF {
            packed_from(Kind::ByteString, units.len(), 4, 8, |i| units[i])
        } else {
            packed_from(Kind::TwoByteString, units.len(), 2, 16, |i| units[i])
        }
    } else {
        object_tuple(text.chars().map(character::from_char).collect())
    }
}

/// A byte-tuple over the given bytes.
pub fn byte_tuple_from_bytes(bytes: &[u8]) -> AvailObject {
    packed_from(Kind::ByteTuple, bytes.len(), 4, 8, |i| bytes[i] as u32)
}

/// A nybble-tuple over the given values, each 0..=15.
pub fn nybble_tuple_from(nybbles: &[u8]) -> AvailObject {
    debug_assert!(nybbles.iter().all(|&n| n <= 0xF));
    packed_from(Kind::NybbleTuple, nybbles.len(), 8, 4, |i| nybbles[i] as u32)
}

/// Number of elements.
pub fn size(obj: &AvailObject) -> VmResult<usize> {
    let t = expect_tuple(obj)?;
    Ok(match t.kind() {
        Kind::ObjectTuple => t.variable_object_count(),
        Kind::SplicedTuple => t.integer_slot(SIZE) as usize,
        _ => t.integer_slot(SIZE) as usize,
    })
}

fn packed_unit(t: &AvailObject, kind: Kind, index0: usize) -> u32 {
    let (per_word, bits, mask) = match kind {
        Kind::ByteString | Kind::ByteTuple => (4, 8u32, 0xFFu32),
        Kind::TwoByteString => (2, 16, 0xFFFF),
        Kind::NybbleTuple => (8, 4, 0xF),
        _ => unreachable!("not a packed representation"),
    };
    let word = t.integer_slot(PACKED + index0 / per_word);
    (word >> ((index0 % per_word) as u32 * bits)) & mask
}

/// The element at 1-based `index`. O(log n) through splice nodes.
pub fn at(obj: &AvailObject, index: usize) -> VmResult<AvailObject> {
    let t = expect_tuple(obj)?;
    let n = size(&t)?;
    if index == 0 || index > n {
        return Err(VmError::with_detail(
            ErrorKind::NotSupported,
            format!("index {} out of 1..={}", index, n),
        ));
    }
    let mut t = t;
    let mut index = index;
    loop {
        match t.kind() {
            Kind::ObjectTuple => return Ok(t.object_slot(index - 1)),
            Kind::ByteString | Kind::TwoByteString => {
                let unit = packed_unit(&t, t.kind(), index - 1);
                let c = char::from_u32(unit).ok_or(ErrorKind::NotSupported)?;
                return Ok(character::from_char(c));
            }
            Kind::ByteTuple | Kind::NybbleTuple => {
                return Ok(number::from_u32(packed_unit(&t, t.kind(), index - 1)));
            }
            Kind::SplicedTuple => {
                let left_size = t.integer_slot(LEFT_SIZE) as usize;
                if index <= left_size {
                    t = t.object_slot(LEFT).traverse();
                } else {
                    index -= left_size;
                    t = t.object_slot(RIGHT).traverse();
                }
            }
            _ => unreachable!(),
        }
    }
}

/// All elements, materialized.
pub fn to_vec(obj: &AvailObject) -> VmResult<Vec<AvailObject>> {
    let t = expect_tuple(obj)?;
    let n = size(&t)?;
    let mut out = Vec::with_capacity(n);
    collect_into(&t, &mut out)?;
    debug_assert_eq!(out.len(), n);
    Ok(out)
}

fn collect_into(t: &AvailObject, out: &mut Vec<AvailObject>) -> VmResult<()> {
    match t.kind() {
        Kind::SplicedTuple => {
            collect_into(&t.object_slot(LEFT).traverse(), out)?;
            collect_into(&t.object_slot(RIGHT).traverse(), out)
        }
        _ => {
            let n = size(t)?;
            for i in 1..=n {
                out.push(at(t, i)?);
            }
            Ok(())
        }
    }
}

/// Concatenation. Produces a spliced node when both halves are large,
/// otherwise flattens into the most compact representation.
pub fn concat(a: &AvailObject, b: &AvailObject) -> VmResult<AvailObject> {
    let a = expect_tuple(a)?;
    let b = expect_tuple(b)?;
    let (na, nb) = (size(&a)?, size(&b)?);
    if na == 0 {
        return Ok(b);
    }
    if nb == 0 {
        return Ok(a);
    }
    if na + nb <= SPLICE_THRESHOLD {
        let mut elements = to_vec(&a)?;
        elements.extend(to_vec(&b)?);
        Ok(from_values(elements))
    } else {
        splice(&a, &b)
    }
}

/// Builds a spliced tuple directly over two non-empty halves.
///
/// Both halves are frozen: the splice shares their storage, so neither may
/// be mutated afterward.
pub fn splice(a: &AvailObject, b: &AvailObject) -> VmResult<AvailObject> {
    let a = expect_tuple(a)?;
    let b = expect_tuple(b)?;
    let (na, nb) = (size(&a)?, size(&b)?);
    assert!(na > 0 && nb > 0, "splice halves must be non-empty");
    a.make_immutable();
    b.make_immutable();
    let spliced = AvailObject::with_slots(
        Descriptor::mutable(Kind::SplicedTuple),
        vec![a, b],
        vec![0, (na + nb) as u32, na as u32],
    );
    Ok(spliced)
}

/// The sub-tuple from 1-based `from` through `to`, inclusive. `from` one
/// past `to` yields the empty tuple. Shares storage with the receiver where
/// the range covers a whole splice branch; copies otherwise, so a small
/// slice never retains a large tuple.
pub fn slice(obj: &AvailObject, from: usize, to: usize) -> VmResult<AvailObject> {
    let t = expect_tuple(obj)?;
    let n = size(&t)?;
    if from > to {
        if from > n + 1 || to > n {
            return Err(ErrorKind::NotSupported.into());
        }
        return Ok(empty());
    }
    if from == 0 || to > n {
        return Err(ErrorKind::NotSupported.into());
    }
    if from == 1 && to == n {
        return Ok(t);
    }
    if t.kind() == Kind::SplicedTuple {
        let left_size = t.integer_slot(LEFT_SIZE) as usize;
        let left = t.object_slot(LEFT).traverse();
        let right = t.object_slot(RIGHT).traverse();
        if to <= left_size {
            return slice(&left, from, to);
        }
        if from > left_size {
            return slice(&right, from - left_size, to - left_size);
        }
        let left_part = slice(&left, from, left_size)?;
        let right_part = slice(&right, 1, to - left_size)?;
        return concat(&left_part, &right_part);
    }
    let mut elements = Vec::with_capacity(to - from + 1);
    for i in from..=to {
        elements.push(at(&t, i)?);
    }
    Ok(from_values(elements))
}

/// The tuple's hash, computed lazily and cached in slot 0.
///
/// The value depends only on the element sequence: a spliced tuple combines
/// its halves' hashes with the mixing constants, matching the flat fold.
pub fn hash(obj: &AvailObject) -> VmResult<u32> {
    let t = expect_tuple(obj)?;
    let cached = t.integer_slot(HASH_OR_ZERO);
    if cached != 0 {
        return Ok(cached);
    }
    let n = size(&t)?;
    let h = match t.kind() {
        Kind::SplicedTuple => {
            let left = t.object_slot(LEFT).traverse();
            let right = t.object_slot(RIGHT).traverse();
            let left_size = t.integer_slot(LEFT_SIZE) as usize;
            tuple_concat_hash(
                hash(&left)?,
                left_size as u64,
                hash(&right)?,
                (n - left_size) as u64,
            )
        }
        Kind::ObjectTuple => {
            let mut raw = 0u32;
            for i in 0..n {
                raw = tuple_fold(raw, equality::hash_of(&t.object_slot(i)));
            }
            tuple_finish(raw, n as u64)
        }
        Kind::ByteString | Kind::TwoByteString => {
            let mut raw = 0u32;
            for i in 0..n {
                raw = tuple_fold(raw, character::hash_code_point(packed_unit(&t, t.kind(), i)));
            }
            tuple_finish(raw, n as u64)
        }
        Kind::ByteTuple | Kind::NybbleTuple => {
            let mut raw = 0u32;
            for i in 0..n {
                raw = tuple_fold(raw, number::hash_u32(packed_unit(&t, t.kind(), i)));
            }
            tuple_finish(raw, n as u64)
        }
        _ => unreachable!(),
    };
    // A computed hash of zero is simply never cached.
    t.set_integer_slot(HASH_OR_ZERO, h);
    Ok(h)
}

/// Extracts a Rust `String` from a tuple of characters.
pub fn to_string(obj: &AvailObject) -> VmResult<String> {
    let t = expect_tuple(obj)?;
    let n = size(&t)?;
    let mut out = String::with_capacity(n);
    for i in 1..=n {
        out.push(character::to_char(&at(&t, i)?)?);
    }
    Ok(out)
}

/// Reads a nybble-tuple into a plain byte vector, one nybble per byte.
pub fn nybbles_to_vec(obj: &AvailObject) -> VmResult<Vec<u8>> {
    let t = expect_tuple(obj)?;
    if t.kind() != Kind::NybbleTuple {
        return Err(ErrorKind::NotSupported.into());
    }
    let n = size(&t)?;
    Ok((0..n).map(|i| packed_unit(&t, Kind::NybbleTuple, i) as u8).collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::equality::equals;

    fn int_tuple(values: &[i64]) -> AvailObject {
        from_values(values.iter().map(|&v| number::from_i64(v)).collect())
    }

    #[test]
    fn small_int_tuples_pack_to_nybbles() {
        let t = int_tuple(&[1, 2, 3]);
        assert_eq!(t.kind(), Kind::NybbleTuple);
        assert_eq!(size(&t).unwrap(), 3);
    }

    #[test]
    fn at_is_one_based() {
        let t = int_tuple(&[10, 20, 30]);
        assert_eq!(number::to_i64(&at(&t, 1).unwrap()), Some(10));
        assert_eq!(number::to_i64(&at(&t, 3).unwrap()), Some(30));
        assert!(at(&t, 0).is_err());
        assert!(at(&t, 4).is_err());
    }

    #[test]
    fn strings_choose_narrowest_packing() {
        assert_eq!(string_from_str("hello").kind(), Kind::ByteString);
        assert_eq!(string_from_str("héllo✓").kind(), Kind::TwoByteString);
        assert_eq!(string_from_str("a🎴b").kind(), Kind::ObjectTuple);
    }

    #[test]
    fn string_round_trip() {
        for text in ["", "plain", "tvåbyte✓", "wide 🎴 char"] {
            assert_eq!(to_string(&string_from_str(text)).unwrap(), text);
        }
    }

    #[test]
    fn representations_hash_identically() {
        let packed = string_from_str("abc");
        let objects = object_tuple("abc".chars().map(character::from_char).collect());
        assert_eq!(hash(&packed).unwrap(), hash(&objects).unwrap());
        assert!(equals(&packed, &objects));
    }

    #[test]
    fn concat_of_empty_is_identity() {
        let t = int_tuple(&[1, 2, 3]);
        let e = empty();
        assert!(equals(&concat(&e, &t).unwrap(), &t));
        assert!(equals(&concat(&t, &e).unwrap(), &t));
    }

    #[test]
    fn spliced_hash_matches_flat_hash() {
        let flat = int_tuple(&[1, 2, 3, 4, 5]);
        let spliced = splice(&int_tuple(&[1, 2, 3]), &int_tuple(&[4, 5])).unwrap();
        assert_eq!(spliced.kind(), Kind::SplicedTuple);
        assert_eq!(hash(&spliced).unwrap(), hash(&flat).unwrap());
        assert!(equals(&spliced, &flat));
    }

    #[test]
    fn spliced_at_reaches_both_halves() {
        let spliced = splice(&int_tuple(&[1, 2, 3]), &int_tuple(&[4, 5])).unwrap();
        assert_eq!(number::to_i64(&at(&spliced, 3).unwrap()), Some(3));
        assert_eq!(number::to_i64(&at(&spliced, 4).unwrap()), Some(4));
    }

    #[test]
    fn large_concat_builds_a_splice() {
        let a = int_tuple(&(0..30).collect::<Vec<i64>>());
        let b = int_tuple(&(30..60).collect::<Vec<i64>>());
        let c = concat(&a, &b).unwrap();
        assert_eq!(c.kind(), Kind::SplicedTuple);
        assert_eq!(size(&c).unwrap(), 60);
        assert_eq!(number::to_i64(&at(&c, 31).unwrap()), Some(30));
    }

    #[test]
    fn slice_shares_whole_branches() {
        let a = int_tuple(&(0..40).collect::<Vec<i64>>());
        let b = int_tuple(&(40..80).collect::<Vec<i64>>());
        let c = splice(&a, &b).unwrap();
        let left = slice(&c, 1, 40).unwrap();
        assert!(left.same_object(&a.traverse()));
        let inner = slice(&c, 39, 42).unwrap();
        assert_eq!(size(&inner).unwrap(), 4);
        assert_eq!(number::to_i64(&at(&inner, 1).unwrap()), Some(38));
        assert_eq!(number::to_i64(&at(&inner, 4).unwrap()), Some(41));
    }

    #[test]
    fn empty_slice_at_upper_edge() {
        let t = int_tuple(&[1, 2, 3]);
        assert_eq!(size(&slice(&t, 4, 3).unwrap()).unwrap(), 0);
    }

    #[test]
    fn nybble_round_trip() {
        let t = nybble_tuple_from(&[0, 7, 15, 3]);
        assert_eq!(nybbles_to_vec(&t).unwrap(), vec![0, 7, 15, 3]);
    }
}
