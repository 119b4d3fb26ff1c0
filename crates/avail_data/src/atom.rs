//! Atoms: interned, module-scoped names.
//!
//! An atom's equality is its identity: two atoms spelled the same are
//! different values when issued by different modules (or by two separate
//! creation calls). The runtime's atom table is what makes repeated lookups
//! of `module/name` return the same atom; this module only supplies the
//! representation.
//!
//! Each atom carries a property map (atom-keyed) used by higher layers, for
//! example to attach a message bundle to the name that induced it.

use std::sync::atomic::{AtomicU32, Ordering};

use avail_base::hash::mix;
use avail_base::{AvailObject, Descriptor, ErrorKind, Kind, VmResult};

use crate::map;
use crate::tuple;

/// Object slots.
const NAME: usize = 0;
const MODULE_NAME: usize = 1;
const PROPERTIES: usize = 2;
/// Integer slot holding the identity hash, fixed at creation.
const HASH: usize = 0;

static NEXT_HASH_SEED: AtomicU32 = AtomicU32::new(0x0A70_0001);

/// Creates a fresh atom. The atom is Shared from birth: names are meant to
/// cross fiber boundaries.
pub fn create(name: &str, module_name: Option<&str>) -> AvailObject {
    let atom = AvailObject::allocate(Descriptor::mutable(Kind::Atom), 0, 0);
    atom.set_object_slot(NAME, tuple::string_from_str(name));
    atom.set_object_slot(
        MODULE_NAME,
        match module_name {
            Some(m) => tuple::string_from_str(m),
            None => AvailObject::nil(),
        },
    );
    atom.set_object_slot(PROPERTIES, AvailObject::nil());
    let seed = NEXT_HASH_SEED.fetch_add(0x9E37_79B9, Ordering::Relaxed);
    let mut h = mix(seed);
    if h == 0 {
        h = 1;
    }
    atom.set_integer_slot(HASH, h);
    atom.make_shared();
    atom
}

fn expect_atom(obj: &AvailObject) -> VmResult<AvailObject> {
    let obj = obj.traverse();
    if obj.kind() == Kind::Atom {
        Ok(obj)
    } else {
        Err(ErrorKind::NotSupported.into())
    }
}

/// The atom's name as a Rust string.
pub fn name(obj: &AvailObject) -> VmResult<String> {
    tuple::to_string(&expect_atom(obj)?.object_slot(NAME))
}

/// The issuing module's name, or `None` for atoms created outside a module.
pub fn module_name(obj: &AvailObject) -> VmResult<Option<String>> {
    let slot = expect_atom(obj)?.object_slot(MODULE_NAME);
    if slot.is_nil() {
        Ok(None)
    } else {
        Ok(Some(tuple::to_string(&slot)?))
    }
}

/// The atom's identity hash.
pub fn hash(obj: &AvailObject) -> VmResult<u32> {
    Ok(expect_atom(obj)?.integer_slot(HASH))
}

/// Reads a property, or `None` if absent.
pub fn property(obj: &AvailObject, key: &AvailObject) -> VmResult<Option<AvailObject>> {
    let atom = expect_atom(obj)?;
    let properties = atom.object_slot(PROPERTIES);
    if properties.is_nil() {
        return Ok(None);
    }
    map::at(&properties, key)
}

/// Writes a property, replacing any previous binding for `key`.
pub fn set_property(obj: &AvailObject, key: &AvailObject, value: &AvailObject) -> VmResult<()> {
    let atom = expect_atom(obj)?;
    let properties = atom.object_slot(PROPERTIES);
    let properties = if properties.is_nil() {
        map::empty()
    } else {
        properties
    };
    let updated = map::put(&properties, key, value)?;
    updated.make_shared();
    atom.set_object_slot(PROPERTIES, updated);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::equality::equals;
    use crate::number;

    #[test]
    fn atoms_know_their_names() {
        let atom = create("true", Some("Avail"));
        assert_eq!(name(&atom).unwrap(), "true");
        assert_eq!(module_name(&atom).unwrap().as_deref(), Some("Avail"));
    }

    #[test]
    fn same_spelling_different_identity() {
        let a = create("x", Some("A"));
        let b = create("x", Some("B"));
        assert!(!equals(&a, &b));
        assert!(!a.same_object(&b));
    }

    #[test]
    fn atoms_equal_only_themselves() {
        let a = create("x", None);
        assert!(equals(&a, &a));
    }

    #[test]
    fn properties_round_trip() {
        let atom = create("holder", None);
        let key = create("key", None);
        set_property(&atom, &key, &number::from_i64(7)).unwrap();
        let got = property(&atom, &key).unwrap().unwrap();
        assert_eq!(number::to_i64(&got), Some(7));
        let other = create("key", None);
        assert!(property(&atom, &other).unwrap().is_none());
    }

    #[test]
    fn atoms_are_born_shared() {
        let atom = create("shared", None);
        assert_eq!(atom.mutability(), avail_base::Mutability::Shared);
    }
}
