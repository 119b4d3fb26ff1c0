//! Reified continuations.
//!
//! A continuation freezes one call frame: the caller continuation (nil at
//! the fiber root), the executing function, the Level One program counter,
//! the stack pointer, the Level Two chunk id and wordcode offset (zero when
//! unoptimized), and the flat frame slots: arguments, then locals, then
//! stack, with the stack growing downward toward the locals.

use avail_base::{AvailObject, Descriptor, ErrorKind, Kind, VmResult};

/// Object slots.
const CALLER: usize = 0;
const FUNCTION: usize = 1;
const FRAME: usize = 2;
/// Integer slots.
const PC: usize = 0;
const STACK_POINTER: usize = 1;
const CHUNK_ID: usize = 2;
const CHUNK_OFFSET: usize = 3;

/// Materializes a frame into a continuation object.
#[allow(clippy::too_many_arguments)]
pub fn new(
    caller: AvailObject,
    function: AvailObject,
    pc: usize,
    stack_pointer: usize,
    chunk_id: u64,
    chunk_offset: usize,
    frame_slots: Vec<AvailObject>,
) -> AvailObject {
    let mut slots = vec![caller, function];
    slots.extend(frame_slots);
    let ints = vec![
        pc as u32,
        stack_pointer as u32,
        chunk_id as u32,
        chunk_offset as u32,
    ];
    AvailObject::with_slots(Descriptor::mutable(Kind::Continuation), slots, ints)
}

fn expect_continuation(obj: &AvailObject) -> VmResult<AvailObject> {
    let obj = obj.traverse();
    if obj.kind() != Kind::Continuation {
        return Err(ErrorKind::NotSupported.into());
    }
    Ok(obj)
}

/// The caller continuation, nil at the fiber root.
pub fn caller(obj: &AvailObject) -> VmResult<AvailObject> {
    Ok(expect_continuation(obj)?.object_slot(CALLER))
}

/// The executing function.
pub fn function(obj: &AvailObject) -> VmResult<AvailObject> {
    Ok(expect_continuation(obj)?.object_slot(FUNCTION))
}

/// The Level One program counter (a nybble index).
pub fn pc(obj: &AvailObject) -> VmResult<usize> {
    Ok(expect_continuation(obj)?.integer_slot(PC) as usize)
}

/// The stack pointer: index of the top-of-stack slot; the frame length when
/// the stack is empty.
pub fn stack_pointer(obj: &AvailObject) -> VmResult<usize> {
    Ok(expect_continuation(obj)?.integer_slot(STACK_POINTER) as usize)
}

/// The Level Two chunk the frame was running, 0 for Level One.
pub fn chunk_id(obj: &AvailObject) -> VmResult<u64> {
    Ok(expect_continuation(obj)?.integer_slot(CHUNK_ID) as u64)
}

/// The wordcode offset within the chunk.
pub fn chunk_offset(obj: &AvailObject) -> VmResult<usize> {
    Ok(expect_continuation(obj)?.integer_slot(CHUNK_OFFSET) as usize)
}

/// The frame slots: arguments, locals, stack.
pub fn frame(obj: &AvailObject) -> VmResult<Vec<AvailObject>> {
    let obj = expect_continuation(obj)?;
    Ok(obj.object_slots_snapshot()[FRAME..].to_vec())
}

/// The depth of a continuation chain, for introspection.
pub fn chain_depth(obj: &AvailObject) -> VmResult<usize> {
    let mut depth = 0;
    let mut current = obj.traverse();
    while current.kind() == Kind::Continuation {
        depth += 1;
        current = caller(&current)?.traverse();
    }
    Ok(depth)
}

#[cfg(test)]
mod tests {
    use super::*;
    use avail_data::number;

    #[test]
    fn fields_round_trip() {
        let frame_slots = vec![number::from_i64(1), number::from_i64(2), AvailObject::nil()];
        let k = new(
            AvailObject::nil(),
            AvailObject::nil(),
            7,
            2,
            0,
            0,
            frame_slots,
        );
        assert_eq!(pc(&k).unwrap(), 7);
        assert_eq!(stack_pointer(&k).unwrap(), 2);
        assert_eq!(chunk_id(&k).unwrap(), 0);
        assert_eq!(frame(&k).unwrap().len(), 3);
        assert!(caller(&k).unwrap().is_nil());
    }

    #[test]
    fn chains_count_their_frames() {
        let inner = new(AvailObject::nil(), AvailObject::nil(), 0, 0, 0, 0, vec![]);
        let outer = new(inner, AvailObject::nil(), 0, 0, 0, 0, vec![]);
        assert_eq!(chain_depth(&outer).unwrap(), 2);
    }
}
