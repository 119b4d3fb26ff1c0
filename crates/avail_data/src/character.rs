//! Unicode characters.
//!
//! Strings are tuples of characters, so the character hash defined here is
//! also the element hash used by every string representation.

use avail_base::hash::mix;
use avail_base::{AvailObject, Descriptor, ErrorKind, Kind, VmResult};

/// Integer slot holding the code point.
const CODE_POINT: usize = 0;

/// Salt separating character hashes from integer hashes of the same word.
const CHARACTER_SALT: u32 = 0x00C0_DE90;

/// A character object for the given scalar value.
pub fn from_char(c: char) -> AvailObject {
    let obj = AvailObject::allocate(Descriptor::shared(Kind::Character), 0, 0);
    obj.set_integer_slot(CODE_POINT, c as u32);
    obj
}

/// Extracts a character's scalar value.
pub fn to_char(obj: &AvailObject) -> VmResult<char> {
    let obj = obj.traverse();
    if obj.kind() != Kind::Character {
        return Err(ErrorKind::NotSupported.into());
    }
    char::from_u32(obj.integer_slot(CODE_POINT)).ok_or_else(|| ErrorKind::NotSupported.into())
}

/// The hash of a character with the given code point.
pub fn hash_code_point(code_point: u32) -> u32 {
    mix(code_point ^ CHARACTER_SALT)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip() {
        for c in ['a', 'ø', '∞', '🎴'] {
            assert_eq!(to_char(&from_char(c)).unwrap(), c);
        }
    }

    #[test]
    fn distinct_code_points_hash_differently() {
        assert_ne!(hash_code_point('a' as u32), hash_code_point('b' as u32));
    }
}
