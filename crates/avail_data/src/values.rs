//! Nil and the booleans.

use avail_base::{AvailObject, Descriptor, ErrorKind, Kind, VmResult};

/// Integer slot holding 0 for `false`, 1 for `true`.
const VALUE: usize = 0;

/// Hash of nil. Arbitrary but fixed.
pub const NIL_HASH: u32 = 0x4E49_4C21;

/// Hash of `false`.
pub const FALSE_HASH: u32 = 0x0FA1_5E00;

/// Hash of `true`.
pub const TRUE_HASH: u32 = 0x0072_14E5;

/// A fresh nil object.
pub fn nil() -> AvailObject {
    AvailObject::nil()
}

/// A boolean object.
pub fn boolean(value: bool) -> AvailObject {
    let obj = AvailObject::allocate(Descriptor::shared(Kind::Boolean), 0, 0);
    obj.set_integer_slot(VALUE, value as u32);
    obj
}

/// Extracts a boolean's value.
pub fn boolean_value(obj: &AvailObject) -> VmResult<bool> {
    let obj = obj.traverse();
    if obj.kind() != Kind::Boolean {
        return Err(ErrorKind::NotSupported.into());
    }
    Ok(obj.integer_slot(VALUE) != 0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn booleans_round_trip() {
        assert!(boolean_value(&boolean(true)).unwrap());
        assert!(!boolean_value(&boolean(false)).unwrap());
    }

    #[test]
    fn nil_is_nil() {
        assert!(nil().is_nil());
    }

    #[test]
    fn boolean_value_rejects_non_booleans() {
        let err = boolean_value(&nil()).unwrap_err();
        assert_eq!(err.kind, ErrorKind::NotSupported);
    }
}
