//! Fiber handles: values naming a scheduler fiber.
//!
//! The scheduler owns fiber state; programs see only these identity-bearing
//! handles, which primitives translate back to fiber ids.

use avail_base::{AvailObject, Descriptor, ErrorKind, Kind, VmResult};

const ID_LOW: usize = 0;
const ID_HIGH: usize = 1;

/// A handle for the fiber with the given id.
pub fn new(id: u64) -> AvailObject {
    let handle = AvailObject::allocate(Descriptor::shared(Kind::FiberHandle), 0, 0);
    handle.set_integer_slot(ID_LOW, id as u32);
    handle.set_integer_slot(ID_HIGH, (id >> 32) as u32);
    handle
}

/// The fiber id inside a handle.
pub fn id(obj: &AvailObject) -> VmResult<u64> {
    let obj = obj.traverse();
    if obj.kind() != Kind::FiberHandle {
        return Err(ErrorKind::NotSupported.into());
    }
    Ok(obj.integer_slot(ID_LOW) as u64 | ((obj.integer_slot(ID_HIGH) as u64) << 32))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn id_round_trip() {
        for value in [0u64, 1, u32::MAX as u64 + 7, u64::MAX] {
            assert_eq!(id(&new(value)).unwrap(), value);
        }
    }
}
