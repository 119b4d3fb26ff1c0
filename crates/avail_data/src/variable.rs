//! Variables: atomic cells with a declared inner type.
//!
//! A variable holds at most one value, always an instance of the inner type
//! declared at creation. Reads of a never-assigned variable fail; writes
//! outside the inner type fail; a write-once variable rejects its second
//! assignment. `get`/`set`/`compare-and-swap`/`get-and-set` are atomic with
//! respect to each other (sequentially consistent through the object lock).
//!
//! Variables carry a write-observer list (a tuple of functions the
//! execution engine invokes after each observed write) and are the unit the
//! fiber trace sets record for read-before-write tracking.

use avail_base::{AvailObject, Descriptor, ErrorKind, Kind, VmResult};

use crate::equality::equals;
use crate::tuple;
use crate::types;

/// Object slots.
const VALUE: usize = 0;
const INNER_TYPE: usize = 1;
const WRITE_OBSERVERS: usize = 2;
/// Flag word.
const FLAGS: usize = 0;

const WRITE_ONCE: u32 = 1;

/// Creates an unassigned variable with the given inner type.
pub fn new(inner_type: AvailObject) -> AvailObject {
    let variable = AvailObject::allocate(Descriptor::mutable(Kind::Variable), 0, 0);
    variable.set_object_slot(INNER_TYPE, inner_type);
    variable
}

/// Creates a write-once variable with the given inner type.
pub fn new_write_once(inner_type: AvailObject) -> AvailObject {
    let variable = new(inner_type);
    variable.set_integer_slot(FLAGS, WRITE_ONCE);
    variable
}

fn expect_variable(obj: &AvailObject) -> VmResult<AvailObject> {
    let obj = obj.traverse();
    if obj.kind() == Kind::Variable {
        Ok(obj)
    } else {
        Err(ErrorKind::NotSupported.into())
    }
}

/// The declared inner type.
pub fn inner_type(obj: &AvailObject) -> VmResult<AvailObject> {
    Ok(expect_variable(obj)?.object_slot(INNER_TYPE))
}

/// Whether the variable rejects second assignments.
pub fn is_write_once(obj: &AvailObject) -> VmResult<bool> {
    Ok(expect_variable(obj)?.integer_slot(FLAGS) & WRITE_ONCE != 0)
}

/// The current value.
pub fn get(obj: &AvailObject) -> VmResult<AvailObject> {
    let variable = expect_variable(obj)?;
    let value = variable.object_slot(VALUE);
    if value.is_nil() {
        return Err(ErrorKind::CannotReadUnassignedVariable.into());
    }
    Ok(value)
}

fn check_assignable(variable: &AvailObject, value: &AvailObject) -> VmResult<()> {
    if value.is_nil() {
        return Err(ErrorKind::VariableTypeMismatch.into());
    }
    if !types::is_instance(value, &variable.object_slot(INNER_TYPE))? {
        return Err(ErrorKind::VariableTypeMismatch.into());
    }
    Ok(())
}

/// Assigns a value, enforcing the inner type and the write-once rule.
pub fn set(obj: &AvailObject, value: &AvailObject) -> VmResult<()> {
    let variable = expect_variable(obj)?;
    check_assignable(&variable, value)?;
    let write_once = variable.integer_slot(FLAGS) & WRITE_ONCE != 0;
    variable.with_slots_mut(|objects, _ints| {
        if write_once && !objects[VALUE].is_nil() {
            return Err(ErrorKind::CannotOverwriteWriteOnceVariable.into());
        }
        objects[VALUE] = value.clone();
        Ok(())
    })
}

/// Atomically replaces the value, returning the previous one.
pub fn get_and_set(obj: &AvailObject, value: &AvailObject) -> VmResult<AvailObject> {
    let variable = expect_variable(obj)?;
    check_assignable(&variable, value)?;
    if is_write_once(&variable)? {
        return Err(ErrorKind::CannotOverwriteWriteOnceVariable.into());
    }
    let old = variable.with_slots_mut(|objects, _ints| {
        std::mem::replace(&mut objects[VALUE], value.clone())
    });
    if old.is_nil() {
        return Err(ErrorKind::CannotReadUnassignedVariable.into());
    }
    Ok(old)
}

/// Atomically replaces the value if the current one equals `expected`.
///
/// Equality runs outside the cell lock, so the implementation retries when
/// the cell changed identity underneath the comparison.
pub fn compare_and_swap(
    obj: &AvailObject,
    expected: &AvailObject,
    value: &AvailObject,
) -> VmResult<bool> {
    let variable = expect_variable(obj)?;
    check_assignable(&variable, value)?;
    if is_write_once(&variable)? {
        return Err(ErrorKind::CannotOverwriteWriteOnceVariable.into());
    }
    loop {
        let current = variable.object_slot(VALUE);
        if current.is_nil() {
            return Err(ErrorKind::CannotReadUnassignedVariable.into());
        }
        let matches = equals(&current, expected);
        enum Step {
            Done(bool),
            Retry,
        }
        let step = variable.with_slots_mut(|objects, _ints| {
            if !objects[VALUE].same_object(&current) {
                return Step::Retry;
            }
            if matches {
                objects[VALUE] = value.clone();
            }
            Step::Done(matches)
        });
        match step {
            Step::Done(swapped) => return Ok(swapped),
            Step::Retry => continue,
        }
    }
}

/// Appends a write observer; the engine calls it after observed writes.
pub fn add_write_observer(obj: &AvailObject, observer: &AvailObject) -> VmResult<()> {
    let variable = expect_variable(obj)?;
    if observer.traverse().kind() != Kind::Function {
        return Err(ErrorKind::ObserveFailed.into());
    }
    let current = variable.object_slot(WRITE_OBSERVERS);
    let observers = if current.is_nil() {
        tuple::object_tuple(vec![observer.clone()])
    } else {
        tuple::concat(&current, &tuple::object_tuple(vec![observer.clone()]))?
    };
    variable.set_object_slot(WRITE_OBSERVERS, observers);
    Ok(())
}

/// The registered write observers, oldest first.
pub fn write_observers(obj: &AvailObject) -> VmResult<Vec<AvailObject>> {
    let variable = expect_variable(obj)?;
    let observers = variable.object_slot(WRITE_OBSERVERS);
    if observers.is_nil() {
        Ok(Vec::new())
    } else {
        tuple::to_vec(&observers)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::number;

    #[test]
    fn read_before_write_fails() {
        let v = new(types::integers());
        let err = get(&v).unwrap_err();
        assert_eq!(err.kind, ErrorKind::CannotReadUnassignedVariable);
    }

    #[test]
    fn set_then_get() {
        let v = new(types::integers());
        set(&v, &number::from_i64(5)).unwrap();
        assert_eq!(number::to_i64(&get(&v).unwrap()), Some(5));
    }

    #[test]
    fn inner_type_is_enforced() {
        let v = new(types::inclusive_range(0, 9));
        let err = set(&v, &number::from_i64(10)).unwrap_err();
        assert_eq!(err.kind, ErrorKind::VariableTypeMismatch);
        set(&v, &number::from_i64(9)).unwrap();
    }

    #[test]
    fn write_once_rejects_second_assignment() {
        let v = new_write_once(types::integers());
        set(&v, &number::from_i64(1)).unwrap();
        let err = set(&v, &number::from_i64(2)).unwrap_err();
        assert_eq!(err.kind, ErrorKind::CannotOverwriteWriteOnceVariable);
        assert_eq!(number::to_i64(&get(&v).unwrap()), Some(1));
    }

    #[test]
    fn compare_and_swap_swaps_on_match() {
        let v = new(types::integers());
        set(&v, &number::from_i64(1)).unwrap();
        assert!(compare_and_swap(&v, &number::from_i64(1), &number::from_i64(2)).unwrap());
        assert_eq!(number::to_i64(&get(&v).unwrap()), Some(2));
        assert!(!compare_and_swap(&v, &number::from_i64(1), &number::from_i64(3)).unwrap());
        assert_eq!(number::to_i64(&get(&v).unwrap()), Some(2));
    }

    #[test]
    fn get_and_set_returns_previous() {
        let v = new(types::integers());
        set(&v, &number::from_i64(7)).unwrap();
        let old = get_and_set(&v, &number::from_i64(8)).unwrap();
        assert_eq!(number::to_i64(&old), Some(7));
        assert_eq!(number::to_i64(&get(&v).unwrap()), Some(8));
    }

    #[test]
    fn observers_must_be_functions() {
        let v = new(types::integers());
        let err = add_write_observer(&v, &number::from_i64(1)).unwrap_err();
        assert_eq!(err.kind, ErrorKind::ObserveFailed);
        assert!(write_observers(&v).unwrap().is_empty());
    }
}
