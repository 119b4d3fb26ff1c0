//! Sets as hash-array-mapped tries.
//!
//! A set root carries its size and cached hash; the payload is a tree of
//! bins. A *linear bin* stores up to [`LINEAR_BIN_MAX`] elements side by
//! side; overflowing one below the deepest level splits it into a *hashed
//! bin*: a 32-bit population bitmap plus packed child bins, indexed by five
//! bits of the element hash rotated by `5·level`.
//!
//! All update operations are persistent: they return a new set sharing
//! unchanged bins with the original. The set hash is the exclusive-or of
//! the element hashes, so insertion order can never matter.

use avail_base::{AvailObject, Descriptor, ErrorKind, Kind, VmResult};

use crate::equality::{equals, hash_of};

/// Set-root object slot holding the root bin (nil when empty).
const ROOT: usize = 0;
/// Set-root integer slots.
const HASH_OR_ZERO: usize = 0;
const SIZE: usize = 1;

/// Hashed-bin integer slot.
const BITMAP: usize = 0;

/// A linear bin overflows past this many elements.
pub const LINEAR_BIN_MAX: usize = 10;
/// Deepest level at which a linear bin still splits.
pub const MAX_SPLIT_LEVEL: u32 = 6;

fn child_index(hash: u32, level: u32) -> u32 {
    hash.rotate_right(5 * level) & 31
}

fn expect_set(obj: &AvailObject) -> VmResult<AvailObject> {
    let obj = obj.traverse();
    if obj.kind() == Kind::Set {
        Ok(obj)
    } else {
        Err(ErrorKind::NotSupported.into())
    }
}

fn new_root(root_bin: Option<AvailObject>, size: usize, hash: u32) -> AvailObject {
    let set = AvailObject::allocate(Descriptor::mutable(Kind::Set), 0, 0);
    set.set_object_slot(ROOT, root_bin.unwrap_or_else(AvailObject::nil));
    set.set_integer_slot(SIZE, size as u32);
    set.set_integer_slot(HASH_OR_ZERO, hash);
    set
}

fn linear_bin(elements: Vec<AvailObject>) -> AvailObject {
    AvailObject::with_slots(Descriptor::mutable(Kind::SetLinearBin), elements, Vec::new())
}

fn hashed_bin(bitmap: u32, children: Vec<AvailObject>) -> AvailObject {
    debug_assert_eq!(bitmap.count_ones() as usize, children.len());
    AvailObject::with_slots(
        Descriptor::mutable(Kind::SetHashedBin),
        children,
        vec![bitmap],
    )
}

/// The empty set.
pub fn empty() -> AvailObject {
    new_root(None, 0, 0)
}

/// A set over the given elements, ignoring duplicates.
pub fn from_values(elements: Vec<AvailObject>) -> VmResult<AvailObject> {
    let mut set = empty();
    for element in elements {
        set = with(&set, &element)?;
    }
    Ok(set)
}

/// Number of elements.
pub fn size(obj: &AvailObject) -> VmResult<usize> {
    Ok(expect_set(obj)?.integer_slot(SIZE) as usize)
}

/// Membership test.
pub fn has(obj: &AvailObject, element: &AvailObject) -> VmResult<bool> {
    let set = expect_set(obj)?;
    let root = set.object_slot(ROOT);
    if root.is_nil() {
        return Ok(false);
    }
    let hash = hash_of(element);
    Ok(bin_has(&root.traverse(), element, hash, 0))
}

fn bin_has(bin: &AvailObject, element: &AvailObject, hash: u32, level: u32) -> bool {
    match bin.kind() {
        Kind::SetLinearBin => bin
            .object_slots_snapshot()
            .iter()
            .any(|e| equals(e, element)),
        Kind::SetHashedBin => {
            let bitmap = bin.integer_slot(BITMAP);
            let bit = 1u32 << child_index(hash, level);
            if bitmap & bit == 0 {
                return false;
            }
            let position = (bitmap & (bit - 1)).count_ones() as usize;
            bin_has(&bin.object_slot(position).traverse(), element, hash, level + 1)
        }
        _ => unreachable!("not a set bin"),
    }
}

/// The set including `element`; the receiver is unchanged.
pub fn with(obj: &AvailObject, element: &AvailObject) -> VmResult<AvailObject> {
    let set = expect_set(obj)?;
    let hash = hash_of(element);
    let root = set.object_slot(ROOT);
    let (new_bin, inserted) = if root.is_nil() {
        (linear_bin(vec![element.clone()]), true)
    } else {
        bin_with(&root.traverse(), element, hash, 0)
    };
    if !inserted {
        return Ok(set);
    }
    let old_hash = set.integer_slot(HASH_OR_ZERO);
    let new_hash = if old_hash != 0 || set.integer_slot(SIZE) == 0 {
        old_hash ^ hash
    } else {
        0
    };
    Ok(new_root(
        Some(new_bin),
        set.integer_slot(SIZE) as usize + 1,
        new_hash,
    ))
}

fn bin_with(bin: &AvailObject, element: &AvailObject, hash: u32, level: u32) -> (AvailObject, bool) {
    match bin.kind() {
        Kind::SetLinearBin => {
            let elements = bin.object_slots_snapshot();
            if elements.iter().any(|e| equals(e, element)) {
                return (bin.clone(), false);
            }
            if elements.len() < LINEAR_BIN_MAX || level > MAX_SPLIT_LEVEL {
                let mut grown = elements;
                grown.push(element.clone());
                return (linear_bin(grown), true);
            }
            // Split into a hashed bin, then insert into that.
            let mut split = split_linear(&elements, level);
            let (with_elem, inserted) = bin_with(&split, element, hash, level);
            debug_assert!(inserted);
            split = with_elem;
            (split, true)
        }
        Kind::SetHashedBin => {
            let bitmap = bin.integer_slot(BITMAP);
            let bit = 1u32 << child_index(hash, level);
            let position = (bitmap & (bit - 1)).count_ones() as usize;
            let mut children = bin.object_slots_snapshot();
            if bitmap & bit == 0 {
                children.insert(position, linear_bin(vec![element.clone()]));
                (hashed_bin(bitmap | bit, children), true)
            } else {
                let (child, inserted) =
                    bin_with(&children[position].traverse(), element, hash, level + 1);
                if !inserted {
                    return (bin.clone(), false);
                }
                children[position] = child;
                (hashed_bin(bitmap, children), true)
            }
        }
        _ => unreachable!("not a set bin"),
    }
}

fn split_linear(elements: &[AvailObject], level: u32) -> AvailObject {
    let mut bitmap = 0u32;
    let mut buckets: Vec<(u32, Vec<AvailObject>)> = Vec::new();
    for element in elements {
        let index = child_index(hash_of(element), level);
        match buckets.binary_search_by_key(&index, |&(i, _)| i) {
            Ok(at) => buckets[at].1.push(element.clone()),
            Err(at) => buckets.insert(at, (index, vec![element.clone()])),
        }
        bitmap |= 1 << index;
    }
    let children = buckets.into_iter().map(|(_, es)| linear_bin(es)).collect();
    hashed_bin(bitmap, children)
}

/// The set excluding `element`; the receiver is unchanged.
pub fn without(obj: &AvailObject, element: &AvailObject) -> VmResult<AvailObject> {
    let set = expect_set(obj)?;
    let root = set.object_slot(ROOT);
    if root.is_nil() {
        return Ok(set);
    }
    let hash = hash_of(element);
    match bin_without(&root.traverse(), element, hash, 0) {
        None => Ok(set),
        Some(new_bin) => {
            let old_hash = set.integer_slot(HASH_OR_ZERO);
            let new_hash = if old_hash != 0 { old_hash ^ hash } else { 0 };
            Ok(new_root(
                new_bin,
                set.integer_slot(SIZE) as usize - 1,
                new_hash,
            ))
        }
    }
}

/// `Some(replacement)` if the element was present (`None` bin = now empty);
/// `None` if absent.
fn bin_without(
    bin: &AvailObject,
    element: &AvailObject,
    hash: u32,
    level: u32,
) -> Option<Option<AvailObject>> {
    match bin.kind() {
        Kind::SetLinearBin => {
            let mut elements = bin.object_slots_snapshot();
            let found = elements.iter().position(|e| equals(e, element))?;
            elements.remove(found);
            if elements.is_empty() {
                Some(None)
            } else {
                Some(Some(linear_bin(elements)))
            }
        }
        Kind::SetHashedBin => {
            let bitmap = bin.integer_slot(BITMAP);
            let bit = 1u32 << child_index(hash, level);
            if bitmap & bit == 0 {
                return None;
            }
            let position = (bitmap & (bit - 1)).count_ones() as usize;
            let mut children = bin.object_slots_snapshot();
            let replacement =
                bin_without(&children[position].traverse(), element, hash, level + 1)?;
            let new_bitmap = match replacement {
                Some(child) => {
                    children[position] = child;
                    bitmap
                }
                None => {
                    children.remove(position);
                    bitmap & !bit
                }
            };
            if children.is_empty() {
                return Some(None);
            }
            // Collapse tiny bins back to linear form.
            let total: usize = children.iter().map(|c| bin_count(&c.traverse())).sum();
            if total <= 2 {
                let mut survivors = Vec::with_capacity(total);
                for child in &children {
                    collect_bin(&child.traverse(), &mut survivors);
                }
                return Some(Some(linear_bin(survivors)));
            }
            Some(Some(hashed_bin(new_bitmap, children)))
        }
        _ => unreachable!("not a set bin"),
    }
}

fn bin_count(bin: &AvailObject) -> usize {
    match bin.kind() {
        Kind::SetLinearBin => bin.object_slot_count(),
        Kind::SetHashedBin => bin
            .object_slots_snapshot()
            .iter()
            .map(|c| bin_count(&c.traverse()))
            .sum(),
        _ => unreachable!("not a set bin"),
    }
}

fn collect_bin(bin: &AvailObject, out: &mut Vec<AvailObject>) {
    match bin.kind() {
        Kind::SetLinearBin => out.extend(bin.object_slots_snapshot()),
        Kind::SetHashedBin => {
            for child in bin.object_slots_snapshot() {
                collect_bin(&child.traverse(), out);
            }
        }
        _ => unreachable!("not a set bin"),
    }
}

/// All elements, in trie order.
pub fn to_vec(obj: &AvailObject) -> VmResult<Vec<AvailObject>> {
    let set = expect_set(obj)?;
    let root = set.object_slot(ROOT);
    let mut out = Vec::with_capacity(set.integer_slot(SIZE) as usize);
    if !root.is_nil() {
        collect_bin(&root.traverse(), &mut out);
    }
    Ok(out)
}

/// The set's hash: the exclusive-or of its element hashes. Cached in the
/// root (zero = not yet computed, recomputed on demand).
pub fn hash(obj: &AvailObject) -> VmResult<u32> {
    let set = expect_set(obj)?;
    if set.integer_slot(SIZE) == 0 {
        return Ok(0);
    }
    let cached = set.integer_slot(HASH_OR_ZERO);
    if cached != 0 {
        return Ok(cached);
    }
    let mut h = 0u32;
    for element in to_vec(&set)? {
        h ^= hash_of(&element);
    }
    set.set_integer_slot(HASH_OR_ZERO, h);
    Ok(h)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::number;

    fn int_set(values: impl IntoIterator<Item = i64>) -> AvailObject {
        from_values(values.into_iter().map(number::from_i64).collect()).unwrap()
    }

    #[test]
    fn insertion_and_membership() {
        let set = int_set(0..100);
        assert_eq!(size(&set).unwrap(), 100);
        for v in 0..100 {
            assert!(has(&set, &number::from_i64(v)).unwrap());
        }
        assert!(!has(&set, &number::from_i64(100)).unwrap());
    }

    #[test]
    fn duplicate_insertion_returns_same_set() {
        let set = int_set(0..10);
        let again = with(&set, &number::from_i64(5)).unwrap();
        assert!(again.same_object(&set));
    }

    #[test]
    fn hash_is_insertion_order_independent() {
        let forward = int_set(0..50);
        let backward = int_set((0..50).rev());
        assert_eq!(hash(&forward).unwrap(), hash(&backward).unwrap());
        assert!(equals(&forward, &backward));
    }

    #[test]
    fn hash_is_xor_of_element_hashes() {
        let set = int_set([3, 17, 99]);
        let expected = hash_of(&number::from_i64(3))
            ^ hash_of(&number::from_i64(17))
            ^ hash_of(&number::from_i64(99));
        assert_eq!(hash(&set).unwrap(), expected);
    }

    #[test]
    fn insert_then_remove_restores_equality() {
        let set = int_set(0..20);
        let grown = with(&set, &number::from_i64(1000)).unwrap();
        let shrunk = without(&grown, &number::from_i64(1000)).unwrap();
        assert!(equals(&shrunk, &set));
        assert_eq!(hash(&shrunk).unwrap(), hash(&set).unwrap());
    }

    #[test]
    fn removal_of_absent_element_is_identity() {
        let set = int_set(0..5);
        let same = without(&set, &number::from_i64(77)).unwrap();
        assert!(same.same_object(&set));
    }

    #[test]
    fn removal_collapses_to_linear_form() {
        let mut set = int_set(0..40);
        for v in 2..40 {
            set = without(&set, &number::from_i64(v)).unwrap();
        }
        assert_eq!(size(&set).unwrap(), 2);
        let root = set.object_slot(0).traverse();
        assert_eq!(root.kind(), Kind::SetLinearBin);
    }

    #[test]
    fn persistence_leaves_original_untouched() {
        let set = int_set(0..30);
        let _grown = with(&set, &number::from_i64(999)).unwrap();
        assert_eq!(size(&set).unwrap(), 30);
        assert!(!has(&set, &number::from_i64(999)).unwrap());
    }

    #[test]
    fn large_sets_develop_hashed_bins() {
        let set = int_set(0..1000);
        assert_eq!(size(&set).unwrap(), 1000);
        let root = set.object_slot(0).traverse();
        assert_eq!(root.kind(), Kind::SetHashedBin);
    }
}
