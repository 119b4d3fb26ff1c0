//! Maps as hash-array-mapped tries keyed by key hash.
//!
//! Bin structure mirrors `set`: linear bins hold key/value pairs
//! interleaved; hashed bins split on five bits of the *key* hash rotated by
//! `5·level`. Updates are persistent. The map hash folds each entry into a
//! single word first (so key and value both contribute), then combines the
//! entry words with exclusive-or.

use avail_base::hash::{combine2, MAP_ENTRY_SALT};
use avail_base::{AvailObject, Descriptor, ErrorKind, Kind, VmResult};

use crate::equality::{equals, hash_of};

const ROOT: usize = 0;
const HASH_OR_ZERO: usize = 0;
const SIZE: usize = 1;
const BITMAP: usize = 0;

/// A linear bin overflows past this many entries.
const LINEAR_BIN_MAX: usize = 10;
const MAX_SPLIT_LEVEL: u32 = 6;

fn child_index(hash: u32, level: u32) -> u32 {
    hash.rotate_right(5 * level) & 31
}

fn entry_hash(key_hash: u32, value_hash: u32) -> u32 {
    combine2(key_hash, value_hash) ^ MAP_ENTRY_SALT
}

fn expect_map(obj: &AvailObject) -> VmResult<AvailObject> {
    let obj = obj.traverse();
    if obj.kind() == Kind::Map {
        Ok(obj)
    } else {
        Err(ErrorKind::NotSupported.into())
    }
}

fn new_root(root_bin: Option<AvailObject>, size: usize, hash: u32) -> AvailObject {
    let map = AvailObject::allocate(Descriptor::mutable(Kind::Map), 0, 0);
    map.set_object_slot(ROOT, root_bin.unwrap_or_else(AvailObject::nil));
    map.set_integer_slot(SIZE, size as u32);
    map.set_integer_slot(HASH_OR_ZERO, hash);
    map
}

fn linear_bin(pairs: Vec<AvailObject>) -> AvailObject {
    debug_assert!(pairs.len() % 2 == 0);
    AvailObject::with_slots(Descriptor::mutable(Kind::MapLinearBin), pairs, Vec::new())
}

fn hashed_bin(bitmap: u32, children: Vec<AvailObject>) -> AvailObject {
    debug_assert_eq!(bitmap.count_ones() as usize, children.len());
    AvailObject::with_slots(
        Descriptor::mutable(Kind::MapHashedBin),
        children,
        vec![bitmap],
    )
}

/// The empty map.
pub fn empty() -> AvailObject {
    new_root(None, 0, 0)
}

/// Number of entries.
pub fn size(obj: &AvailObject) -> VmResult<usize> {
    Ok(expect_map(obj)?.integer_slot(SIZE) as usize)
}

/// The value bound to `key`, or `None`.
pub fn at(obj: &AvailObject, key: &AvailObject) -> VmResult<Option<AvailObject>> {
    let map = expect_map(obj)?;
    let root = map.object_slot(ROOT);
    if root.is_nil() {
        return Ok(None);
    }
    Ok(bin_at(&root.traverse(), key, hash_of(key), 0))
}

fn bin_at(bin: &AvailObject, key: &AvailObject, hash: u32, level: u32) -> Option<AvailObject> {
    match bin.kind() {
        Kind::MapLinearBin => {
            let pairs = bin.object_slots_snapshot();
            pairs
                .chunks(2)
                .find(|pair| equals(&pair[0], key))
                .map(|pair| pair[1].clone())
        }
        Kind::MapHashedBin => {
            let bitmap = bin.integer_slot(BITMAP);
            let bit = 1u32 << child_index(hash, level);
            if bitmap & bit == 0 {
                return None;
            }
            let position = (bitmap & (bit - 1)).count_ones() as usize;
            bin_at(&bin.object_slot(position).traverse(), key, hash, level + 1)
        }
        _ => unreachable!("not a map bin"),
    }
}

/// The map binding `key` to `value`; the receiver is unchanged.
pub fn put(obj: &AvailObject, key: &AvailObject, value: &AvailObject) -> VmResult<AvailObject> {
    let map = expect_map(obj)?;
    let key_hash = hash_of(key);
    let root = map.object_slot(ROOT);
    let (new_bin, replaced) = if root.is_nil() {
        (linear_bin(vec![key.clone(), value.clone()]), None)
    } else {
        bin_put(&root.traverse(), key, value, key_hash, 0)
    };
    let old_size = map.integer_slot(SIZE) as usize;
    let new_size = if replaced.is_some() { old_size } else { old_size + 1 };
    let old_hash = map.integer_slot(HASH_OR_ZERO);
    let new_hash = if old_hash != 0 || old_size == 0 {
        let mut h = old_hash;
        if let Some(old_value) = &replaced {
            h ^= entry_hash(key_hash, hash_of(old_value));
        }
        h ^ entry_hash(key_hash, hash_of(value))
    } else {
        0
    };
    Ok(new_root(Some(new_bin), new_size, new_hash))
}

fn bin_put(
    bin: &AvailObject,
    key: &AvailObject,
    value: &AvailObject,
    hash: u32,
    level: u32,
) -> (AvailObject, Option<AvailObject>) {
    match bin.kind() {
        Kind::MapLinearBin => {
            let mut pairs = bin.object_slots_snapshot();
            for i in (0..pairs.len()).step_by(2) {
                if equals(&pairs[i], key) {
                    let old = pairs[i + 1].clone();
                    pairs[i + 1] = value.clone();
                    return (linear_bin(pairs), Some(old));
                }
            }
            if pairs.len() / 2 < LINEAR_BIN_MAX || level > MAX_SPLIT_LEVEL {
                pairs.push(key.clone());
                pairs.push(value.clone());
                return (linear_bin(pairs), None);
            }
            let split = split_linear(&pairs, level);
            bin_put(&split, key, value, hash, level)
        }
        Kind::MapHashedBin => {
            let bitmap = bin.integer_slot(BITMAP);
            let bit = 1u32 << child_index(hash, level);
            let position = (bitmap & (bit - 1)).count_ones() as usize;
            let mut children = bin.object_slots_snapshot();
            if bitmap & bit == 0 {
                children.insert(position, linear_bin(vec![key.clone(), value.clone()]));
                (hashed_bin(bitmap | bit, children), None)
            } else {
                let (child, replaced) =
                    bin_put(&children[position].traverse(), key, value, hash, level + 1);
                children[position] = child;
                (hashed_bin(bitmap, children), replaced)
            }
        }
        _ => unreachable!("not a map bin"),
    }
}

fn split_linear(pairs: &[AvailObject], level: u32) -> AvailObject {
    let mut bitmap = 0u32;
    let mut buckets: Vec<(u32, Vec<AvailObject>)> = Vec::new();
    for pair in pairs.chunks(2) {
        let index = child_index(hash_of(&pair[0]), level);
        match buckets.binary_search_by_key(&index, |&(i, _)| i) {
            Ok(found) => buckets[found].1.extend([pair[0].clone(), pair[1].clone()]),
            Err(insert) => {
                buckets.insert(insert, (index, vec![pair[0].clone(), pair[1].clone()]))
            }
        }
        bitmap |= 1 << index;
    }
    let children = buckets.into_iter().map(|(_, ps)| linear_bin(ps)).collect();
    hashed_bin(bitmap, children)
}

/// The map without any binding for `key`; the receiver is unchanged.
pub fn remove(obj: &AvailObject, key: &AvailObject) -> VmResult<AvailObject> {
    let map = expect_map(obj)?;
    let root = map.object_slot(ROOT);
    if root.is_nil() {
        return Ok(map);
    }
    let key_hash = hash_of(key);
    match bin_remove(&root.traverse(), key, key_hash, 0) {
        None => Ok(map),
        Some((new_bin, old_value)) => {
            let old_hash = map.integer_slot(HASH_OR_ZERO);
            let new_hash = if old_hash != 0 {
                old_hash ^ entry_hash(key_hash, hash_of(&old_value))
            } else {
                0
            };
            Ok(new_root(
                new_bin,
                map.integer_slot(SIZE) as usize - 1,
                new_hash,
            ))
        }
    }
}

fn bin_remove(
    bin: &AvailObject,
    key: &AvailObject,
    hash: u32,
    level: u32,
) -> Option<(Option<AvailObject>, AvailObject)> {
    match bin.kind() {
        Kind::MapLinearBin => {
            let mut pairs = bin.object_slots_snapshot();
            let found = (0..pairs.len())
                .step_by(2)
                .find(|&i| equals(&pairs[i], key))?;
            let old_value = pairs[found + 1].clone();
            pairs.drain(found..found + 2);
            if pairs.is_empty() {
                Some((None, old_value))
            } else {
                Some((Some(linear_bin(pairs)), old_value))
            }
        }
        Kind::MapHashedBin => {
            let bitmap = bin.integer_slot(BITMAP);
            let bit = 1u32 << child_index(hash, level);
            if bitmap & bit == 0 {
                return None;
            }
            let position = (bitmap & (bit - 1)).count_ones() as usize;
            let mut children = bin.object_slots_snapshot();
            let (replacement, old_value) =
                bin_remove(&children[position].traverse(), key, hash, level + 1)?;
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
                return Some((None, old_value));
            }
            let total: usize = children.iter().map(|c| bin_entry_count(&c.traverse())).sum();
            if total <= 2 {
                let mut pairs = Vec::with_capacity(total * 2);
                for child in &children {
                    collect_bin(&child.traverse(), &mut pairs);
                }
                return Some((Some(linear_bin(pairs)), old_value));
            }
            Some((Some(hashed_bin(new_bitmap, children)), old_value))
        }
        _ => unreachable!("not a map bin"),
    }
}

fn bin_entry_count(bin: &AvailObject) -> usize {
    match bin.kind() {
        Kind::MapLinearBin => bin.object_slot_count() / 2,
        Kind::MapHashedBin => bin
            .object_slots_snapshot()
            .iter()
            .map(|c| bin_entry_count(&c.traverse()))
            .sum(),
        _ => unreachable!("not a map bin"),
    }
}

fn collect_bin(bin: &AvailObject, out: &mut Vec<AvailObject>) {
    match bin.kind() {
        Kind::MapLinearBin => out.extend(bin.object_slots_snapshot()),
        Kind::MapHashedBin => {
            for child in bin.object_slots_snapshot() {
                collect_bin(&child.traverse(), out);
            }
        }
        _ => unreachable!("not a map bin"),
    }
}

/// All `(key, value)` pairs, in trie order.
pub fn to_pairs(obj: &AvailObject) -> VmResult<Vec<(AvailObject, AvailObject)>> {
    let map = expect_map(obj)?;
    let root = map.object_slot(ROOT);
    let mut flat = Vec::with_capacity(map.integer_slot(SIZE) as usize * 2);
    if !root.is_nil() {
        collect_bin(&root.traverse(), &mut flat);
    }
    Ok(flat
        .chunks(2)
        .map(|pair| (pair[0].clone(), pair[1].clone()))
        .collect())
}

/// The map's hash: exclusive-or over per-entry words. Cached in the root.
pub fn hash(obj: &AvailObject) -> VmResult<u32> {
    let map = expect_map(obj)?;
    if map.integer_slot(SIZE) == 0 {
        return Ok(0);
    }
    let cached = map.integer_slot(HASH_OR_ZERO);
    if cached != 0 {
        return Ok(cached);
    }
    let mut h = 0u32;
    for (key, value) in to_pairs(&map)? {
        h ^= entry_hash(hash_of(&key), hash_of(&value));
    }
    map.set_integer_slot(HASH_OR_ZERO, h);
    Ok(h)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::number;
    use crate::tuple;

    fn put_int(map: &AvailObject, k: i64, v: i64) -> AvailObject {
        put(map, &number::from_i64(k), &number::from_i64(v)).unwrap()
    }

    #[test]
    fn put_then_at() {
        let map = put_int(&empty(), 1, 10);
        let found = at(&map, &number::from_i64(1)).unwrap().unwrap();
        assert_eq!(number::to_i64(&found), Some(10));
    }

    #[test]
    fn remove_erases_binding() {
        let map = put_int(&put_int(&empty(), 1, 10), 2, 20);
        let map = remove(&map, &number::from_i64(1)).unwrap();
        assert!(at(&map, &number::from_i64(1)).unwrap().is_none());
        assert_eq!(size(&map).unwrap(), 1);
    }

    #[test]
    fn overwrite_keeps_size_and_updates_hash() {
        let mut map = empty();
        for k in 0..50 {
            map = put_int(&map, k, k);
        }
        let rewritten = put_int(&map, 7, 700);
        assert_eq!(size(&rewritten).unwrap(), 50);
        let direct = {
            let mut m = empty();
            for k in 0..50 {
                m = put_int(&m, k, if k == 7 { 700 } else { k });
            }
            m
        };
        assert_eq!(hash(&rewritten).unwrap(), hash(&direct).unwrap());
        assert!(equals(&rewritten, &direct));
    }

    #[test]
    fn insertion_order_does_not_matter() {
        let mut forward = empty();
        let mut backward = empty();
        for k in 0..100 {
            forward = put_int(&forward, k, k * 2);
        }
        for k in (0..100).rev() {
            backward = put_int(&backward, k, k * 2);
        }
        assert!(equals(&forward, &backward));
        assert_eq!(hash(&forward).unwrap(), hash(&backward).unwrap());
    }

    #[test]
    fn string_keys_work() {
        let map = put(
            &empty(),
            &tuple::string_from_str("name"),
            &tuple::string_from_str("avail"),
        )
        .unwrap();
        let hit = at(&map, &tuple::string_from_str("name")).unwrap().unwrap();
        assert_eq!(tuple::to_string(&hit).unwrap(), "avail");
    }

    #[test]
    fn persistent_updates_share_structure() {
        let mut map = empty();
        for k in 0..200 {
            map = put_int(&map, k, k);
        }
        let removed = remove(&map, &number::from_i64(100)).unwrap();
        assert_eq!(size(&map).unwrap(), 200);
        assert_eq!(size(&removed).unwrap(), 199);
        assert!(at(&map, &number::from_i64(100)).unwrap().is_some());
    }
}
