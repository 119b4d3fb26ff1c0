//! The metatype lattice used by method dispatch.
//!
//! Types are ordinary heap objects of kind `Type`: an integer tag selects
//! the variant, a flags word carries small payloads (range inclusivity), and
//! the variable object slots hold type parameters or wrapped values.
//!
//! The lattice is intentionally compact: just enough structure for the
//! dispatch engine: `⊥` and `any` at the extremes, the numeric tower with
//! integer ranges, the container types with covariant parameters,
//! contravariant-parameter function types, and exact instance types.
//!
//! Subtyping is sound and decidable; disjointness is *conservative*: it
//! answers `true` only when two types provably share no instances, which is
//! the direction the dispatch-tree pruning needs.

use std::cmp::Ordering;

use avail_base::hash::{combine2, mix};
use avail_base::{AvailObject, Descriptor, ErrorKind, Kind, VmResult};

use crate::equality::{equals, hash_of};
use crate::number;
use crate::tuple;

/// Integer slots.
const TAG: usize = 0;
const FLAGS: usize = 1;

/// Range inclusivity bits in `FLAGS`.
const LOW_INCLUSIVE: u32 = 1;
const HIGH_INCLUSIVE: u32 = 2;

const TYPE_SALT: u32 = 0x7479_7065;

/// The variants of the type lattice.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum TypeTag {
    /// The impossible type; subtype of everything.
    Bottom = 0,
    /// The universal type; supertype of everything.
    Any = 1,
    /// The type whose sole instance is nil.
    NilType = 2,
    /// All numbers, finite or not.
    Number = 3,
    /// Integers plus the two infinities.
    ExtendedInteger = 4,
    /// A contiguous span of extended integers. Params: low, high bounds.
    IntegerRange = 5,
    /// All characters.
    Character = 6,
    /// Tuples of characters.
    String = 7,
    /// Tuples with a homogeneous element type. Param: element type.
    Tuple = 8,
    /// Sets. Param: element type.
    Set = 9,
    /// Maps. Params: key type, value type.
    Map = 10,
    /// All atoms.
    Atom = 11,
    /// The two booleans.
    Boolean = 12,
    /// Functions. Params: parameter-types tuple, return type.
    Function = 13,
    /// Continuations.
    Continuation = 14,
    /// Variables. Param: inner type (invariant).
    Variable = 15,
    /// Fiber handles.
    Fiber = 16,
    /// The type whose sole instance is a given value. Param: the value.
    Instance = 17,
    /// Single-precision floats.
    Float = 18,
    /// Double-precision floats.
    Double = 19,
}

impl TypeTag {
    fn from_u32(tag: u32) -> TypeTag {
        use TypeTag::*;
        match tag {
            0 => Bottom,
            1 => Any,
            2 => NilType,
            3 => Number,
            4 => ExtendedInteger,
            5 => IntegerRange,
            6 => Character,
            7 => String,
            8 => Tuple,
            9 => Set,
            10 => Map,
            11 => Atom,
            12 => Boolean,
            13 => Function,
            14 => Continuation,
            15 => Variable,
            16 => Fiber,
            17 => Instance,
            18 => Float,
            19 => Double,
            _ => unreachable!("bad type tag {}", tag),
        }
    }
}

fn make(tag: TypeTag, flags: u32, params: Vec<AvailObject>) -> AvailObject {
    AvailObject::with_slots(
        Descriptor::mutable(Kind::Type),
        params,
        vec![tag as u32, flags],
    )
}

fn expect_type(obj: &AvailObject) -> VmResult<AvailObject> {
    let obj = obj.traverse();
    if obj.kind() == Kind::Type {
        Ok(obj)
    } else {
        Err(ErrorKind::NotSupported.into())
    }
}

/// The tag of a type object.
pub fn tag(obj: &AvailObject) -> VmResult<TypeTag> {
    Ok(TypeTag::from_u32(expect_type(obj)?.integer_slot(TAG)))
}

// ---------------------------------------------------------------------------
// Constructors
// ---------------------------------------------------------------------------

pub fn bottom() -> AvailObject {
    make(TypeTag::Bottom, 0, Vec::new())
}

pub fn any() -> AvailObject {
    make(TypeTag::Any, 0, Vec::new())
}

pub fn nil_type() -> AvailObject {
    make(TypeTag::NilType, 0, Vec::new())
}

pub fn number() -> AvailObject {
    make(TypeTag::Number, 0, Vec::new())
}

pub fn extended_integers() -> AvailObject {
    make(TypeTag::ExtendedInteger, 0, Vec::new())
}

/// A range of extended integers with explicit bounds and inclusivity.
pub fn integer_range(
    low: AvailObject,
    low_inclusive: bool,
    high: AvailObject,
    high_inclusive: bool,
) -> AvailObject {
    let mut flags = 0;
    if low_inclusive {
        flags |= LOW_INCLUSIVE;
    }
    if high_inclusive {
        flags |= HIGH_INCLUSIVE;
    }
    make(TypeTag::IntegerRange, flags, vec![low, high])
}

/// All finite integers: `(-∞..∞)` exclusive of both infinities.
pub fn integers() -> AvailObject {
    integer_range(
        number::negative_infinity(),
        false,
        number::positive_infinity(),
        false,
    )
}

/// The inclusive range `[low..high]`.
pub fn inclusive_range(low: i64, high: i64) -> AvailObject {
    integer_range(number::from_i64(low), true, number::from_i64(high), true)
}

pub fn character() -> AvailObject {
    make(TypeTag::Character, 0, Vec::new())
}

pub fn string_type() -> AvailObject {
    make(TypeTag::String, 0, Vec::new())
}

/// Tuples whose elements are all instances of `element`.
pub fn tuple_of(element: AvailObject) -> AvailObject {
    make(TypeTag::Tuple, 0, vec![element])
}

pub fn set_of(element: AvailObject) -> AvailObject {
    make(TypeTag::Set, 0, vec![element])
}

pub fn map_of(key: AvailObject, value: AvailObject) -> AvailObject {
    make(TypeTag::Map, 0, vec![key, value])
}

pub fn atom_type() -> AvailObject {
    make(TypeTag::Atom, 0, Vec::new())
}

pub fn boolean_type() -> AvailObject {
    make(TypeTag::Boolean, 0, Vec::new())
}

/// A function type from explicit parameter types to a return type.
pub fn function_type(params: Vec<AvailObject>, return_type: AvailObject) -> AvailObject {
    make(
        TypeTag::Function,
        0,
        vec![tuple::object_tuple(params), return_type],
    )
}

pub fn continuation_type() -> AvailObject {
    make(TypeTag::Continuation, 0, Vec::new())
}

/// The (invariant) type of variables holding `inner`.
pub fn variable_type(inner: AvailObject) -> AvailObject {
    make(TypeTag::Variable, 0, vec![inner])
}

pub fn fiber_type() -> AvailObject {
    make(TypeTag::Fiber, 0, Vec::new())
}

/// The type whose only instance is `value`.
pub fn instance_type(value: AvailObject) -> AvailObject {
    make(TypeTag::Instance, 0, vec![value])
}

pub fn float_type() -> AvailObject {
    make(TypeTag::Float, 0, Vec::new())
}

pub fn double_type() -> AvailObject {
    make(TypeTag::Double, 0, Vec::new())
}

/// Accessors for function types: the parameter types and return type.
pub fn function_parts(obj: &AvailObject) -> VmResult<(Vec<AvailObject>, AvailObject)> {
    let t = expect_type(obj)?;
    if tag(&t)? != TypeTag::Function {
        return Err(ErrorKind::NotSupported.into());
    }
    let params = tuple::to_vec(&t.object_slot(0))?;
    Ok((params, t.object_slot(1)))
}

// ---------------------------------------------------------------------------
// Subtyping
// ---------------------------------------------------------------------------

/// Whether the low bound of `a` is at or above the low bound of `b`.
fn low_bound_within(a: &AvailObject, b: &AvailObject) -> VmResult<bool> {
    let (a_low, a_incl) = (a.object_slot(0), a.integer_slot(FLAGS) & LOW_INCLUSIVE != 0);
    let (b_low, b_incl) = (b.object_slot(0), b.integer_slot(FLAGS) & LOW_INCLUSIVE != 0);
    Ok(match number::compare(&a_low, &b_low)? {
        Ordering::Greater => true,
        Ordering::Less => false,
        Ordering::Equal => b_incl || !a_incl,
    })
}

fn high_bound_within(a: &AvailObject, b: &AvailObject) -> VmResult<bool> {
    let (a_high, a_incl) = (a.object_slot(1), a.integer_slot(FLAGS) & HIGH_INCLUSIVE != 0);
    let (b_high, b_incl) = (b.object_slot(1), b.integer_slot(FLAGS) & HIGH_INCLUSIVE != 0);
    Ok(match number::compare(&a_high, &b_high)? {
        Ordering::Less => true,
        Ordering::Greater => false,
        Ordering::Equal => b_incl || !a_incl,
    })
}

/// Whether `a ⊆ b` in the type lattice.
pub fn is_subtype(a: &AvailObject, b: &AvailObject) -> VmResult<bool> {
    let a = expect_type(a)?;
    let b = expect_type(b)?;
    let (ta, tb) = (tag(&a)?, tag(&b)?);
    if ta == TypeTag::Bottom || tb == TypeTag::Any {
        return Ok(true);
    }
    if tb == TypeTag::Bottom {
        return Ok(false);
    }
    if ta == TypeTag::Instance {
        return is_instance(&a.object_slot(0), &b);
    }
    Ok(match (ta, tb) {
        (x, y) if x == y => match ta {
            TypeTag::IntegerRange => {
                low_bound_within(&a, &b)? && high_bound_within(&a, &b)?
            }
            TypeTag::Tuple | TypeTag::Set => is_subtype(&a.object_slot(0), &b.object_slot(0))?,
            TypeTag::Map => {
                is_subtype(&a.object_slot(0), &b.object_slot(0))?
                    && is_subtype(&a.object_slot(1), &b.object_slot(1))?
            }
            TypeTag::Function => {
                let (a_params, a_return) = function_parts(&a)?;
                let (b_params, b_return) = function_parts(&b)?;
                if a_params.len() != b_params.len() {
                    return Ok(false);
                }
                for (ap, bp) in a_params.iter().zip(&b_params) {
                    // Parameters are contravariant.
                    if !is_subtype(bp, ap)? {
                        return Ok(false);
                    }
                }
                is_subtype(&a_return, &b_return)?
            }
            TypeTag::Variable => equals(&a.object_slot(0), &b.object_slot(0)),
            _ => true,
        },
        (TypeTag::IntegerRange, TypeTag::ExtendedInteger) => true,
        (TypeTag::IntegerRange, TypeTag::Number) => true,
        (TypeTag::ExtendedInteger, TypeTag::Number) => true,
        (TypeTag::Float, TypeTag::Number) => true,
        (TypeTag::Double, TypeTag::Number) => true,
        (TypeTag::String, TypeTag::Tuple) => is_subtype(&character(), &b.object_slot(0))?,
        (TypeTag::Tuple, TypeTag::String) => is_subtype(&a.object_slot(0), &character())?,
        _ => false,
    })
}

/// Whether `value` is an instance of `of_type`.
pub fn is_instance(value: &AvailObject, of_type: &AvailObject) -> VmResult<bool> {
    let value = value.traverse();
    let t = expect_type(of_type)?;
    Ok(match tag(&t)? {
        TypeTag::Bottom => false,
        TypeTag::Any => true,
        TypeTag::NilType => value.kind() == Kind::Nil,
        TypeTag::Number => value.kind().supports(avail_base::OpFamily::Number),
        TypeTag::ExtendedInteger => matches!(
            value.kind(),
            Kind::Integer | Kind::PositiveInfinity | Kind::NegativeInfinity
        ),
        TypeTag::IntegerRange => {
            if !matches!(
                value.kind(),
                Kind::Integer | Kind::PositiveInfinity | Kind::NegativeInfinity
            ) {
                return Ok(false);
            }
            let low_ok = match number::compare(&value, &t.object_slot(0))? {
                Ordering::Greater => true,
                Ordering::Equal => t.integer_slot(FLAGS) & LOW_INCLUSIVE != 0,
                Ordering::Less => false,
            };
            let high_ok = match number::compare(&value, &t.object_slot(1))? {
                Ordering::Less => true,
                Ordering::Equal => t.integer_slot(FLAGS) & HIGH_INCLUSIVE != 0,
                Ordering::Greater => false,
            };
            low_ok && high_ok
        }
        TypeTag::Character => value.kind() == Kind::Character,
        TypeTag::String => {
            if !value.kind().is_tuple() {
                return Ok(false);
            }
            all_elements_are(&value, |element| Ok(element.kind() == Kind::Character))?
        }
        TypeTag::Tuple => {
            if !value.kind().is_tuple() {
                return Ok(false);
            }
            let element_type = t.object_slot(0);
            all_elements_are(&value, |element| is_instance(element, &element_type))?
        }
        TypeTag::Set => {
            if value.kind() != Kind::Set {
                return Ok(false);
            }
            let element_type = t.object_slot(0);
            let mut ok = true;
            for element in crate::set::to_vec(&value)? {
                if !is_instance(&element, &element_type)? {
                    ok = false;
                    break;
                }
            }
            ok
        }
        TypeTag::Map => {
            if value.kind() != Kind::Map {
                return Ok(false);
            }
            let key_type = t.object_slot(0);
            let value_type = t.object_slot(1);
            let mut ok = true;
            for (k, v) in crate::map::to_pairs(&value)? {
                if !is_instance(&k, &key_type)? || !is_instance(&v, &value_type)? {
                    ok = false;
                    break;
                }
            }
            ok
        }
        TypeTag::Atom => value.kind() == Kind::Atom,
        TypeTag::Boolean => value.kind() == Kind::Boolean,
        TypeTag::Function => value.kind() == Kind::Function,
        TypeTag::Continuation => value.kind() == Kind::Continuation,
        TypeTag::Variable => value.kind() == Kind::Variable,
        TypeTag::Fiber => value.kind() == Kind::FiberHandle,
        TypeTag::Instance => equals(&value, &t.object_slot(0)),
        TypeTag::Float => value.kind() == Kind::SingleFloat,
        TypeTag::Double => value.kind() == Kind::DoubleFloat,
    })
}

fn all_elements_are(
    t: &AvailObject,
    predicate: impl Fn(&AvailObject) -> VmResult<bool>,
) -> VmResult<bool> {
    let n = tuple::size(t)?;
    for i in 1..=n {
        if !predicate(&tuple::at(t, i)?.traverse())? {
            return Ok(false);
        }
    }
    Ok(true)
}

// ---------------------------------------------------------------------------
// Disjointness (conservative)
// ---------------------------------------------------------------------------

#[derive(PartialEq, Eq, Clone, Copy)]
enum Category {
    Nil,
    Number,
    Character,
    Tuple,
    Set,
    Map,
    Atom,
    Boolean,
    Function,
    Continuation,
    Variable,
    Fiber,
}

fn category_of_kind(kind: Kind) -> Option<Category> {
    Some(match kind {
        Kind::Nil => Category::Nil,
        Kind::Boolean => Category::Boolean,
        Kind::Character => Category::Character,
        Kind::Atom => Category::Atom,
        k if k.is_tuple() => Category::Tuple,
        Kind::Set => Category::Set,
        Kind::Map => Category::Map,
        Kind::Integer
        | Kind::PositiveInfinity
        | Kind::NegativeInfinity
        | Kind::SingleFloat
        | Kind::DoubleFloat => Category::Number,
        Kind::Function => Category::Function,
        Kind::Continuation => Category::Continuation,
        Kind::Variable => Category::Variable,
        Kind::FiberHandle => Category::Fiber,
        _ => return None,
    })
}

fn category(t: &AvailObject) -> VmResult<Option<Category>> {
    Ok(match tag(t)? {
        TypeTag::Bottom | TypeTag::Any => None,
        TypeTag::NilType => Some(Category::Nil),
        TypeTag::Number
        | TypeTag::ExtendedInteger
        | TypeTag::IntegerRange
        | TypeTag::Float
        | TypeTag::Double => Some(Category::Number),
        TypeTag::Character => Some(Category::Character),
        TypeTag::String | TypeTag::Tuple => Some(Category::Tuple),
        TypeTag::Set => Some(Category::Set),
        TypeTag::Map => Some(Category::Map),
        TypeTag::Atom => Some(Category::Atom),
        TypeTag::Boolean => Some(Category::Boolean),
        TypeTag::Function => Some(Category::Function),
        TypeTag::Continuation => Some(Category::Continuation),
        TypeTag::Variable => Some(Category::Variable),
        TypeTag::Fiber => Some(Category::Fiber),
        TypeTag::Instance => category_of_kind(t.object_slot(0).traverse().kind()),
    })
}

/// Whether `a` and `b` provably share no instance. Answers `false` whenever
/// unsure; callers use this only to prune.
pub fn is_disjoint(a: &AvailObject, b: &AvailObject) -> VmResult<bool> {
    let a = expect_type(a)?;
    let b = expect_type(b)?;
    if tag(&a)? == TypeTag::Bottom || tag(&b)? == TypeTag::Bottom {
        return Ok(true);
    }
    if tag(&a)? == TypeTag::Instance {
        return Ok(!is_instance(&a.object_slot(0), &b)?);
    }
    if tag(&b)? == TypeTag::Instance {
        return Ok(!is_instance(&b.object_slot(0), &a)?);
    }
    if tag(&a)? == TypeTag::IntegerRange && tag(&b)? == TypeTag::IntegerRange {
        // Disjoint when one range ends before the other begins.
        let a_high = a.object_slot(1);
        let b_low = b.object_slot(0);
        let a_before_b = match number::compare(&a_high, &b_low)? {
            Ordering::Less => true,
            Ordering::Equal => {
                a.integer_slot(FLAGS) & HIGH_INCLUSIVE == 0
                    || b.integer_slot(FLAGS) & LOW_INCLUSIVE == 0
            }
            Ordering::Greater => false,
        };
        let b_high = b.object_slot(1);
        let a_low = a.object_slot(0);
        let b_before_a = match number::compare(&b_high, &a_low)? {
            Ordering::Less => true,
            Ordering::Equal => {
                b.integer_slot(FLAGS) & HIGH_INCLUSIVE == 0
                    || a.integer_slot(FLAGS) & LOW_INCLUSIVE == 0
            }
            Ordering::Greater => false,
        };
        return Ok(a_before_b || b_before_a);
    }
    match (category(&a)?, category(&b)?) {
        (Some(ca), Some(cb)) => Ok(ca != cb),
        _ => Ok(false),
    }
}

/// The structural hash of a type object.
pub fn hash(obj: &AvailObject) -> VmResult<u32> {
    let t = expect_type(obj)?;
    let mut h = mix(TYPE_SALT ^ t.integer_slot(TAG));
    h = combine2(h, t.integer_slot(FLAGS));
    for param in t.object_slots_snapshot() {
        h = combine2(h, hash_of(&param));
    }
    Ok(h)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::values;

    #[test]
    fn bottom_below_everything_any_above() {
        for t in [integers(), string_type(), any(), atom_type()] {
            assert!(is_subtype(&bottom(), &t).unwrap());
            assert!(is_subtype(&t, &any()).unwrap());
        }
        assert!(!is_subtype(&any(), &integers()).unwrap());
    }

    #[test]
    fn integer_range_subtyping_respects_bounds() {
        assert!(is_subtype(&inclusive_range(1, 5), &inclusive_range(0, 10)).unwrap());
        assert!(!is_subtype(&inclusive_range(0, 11), &inclusive_range(0, 10)).unwrap());
        assert!(is_subtype(&inclusive_range(0, 10), &integers()).unwrap());
        assert!(is_subtype(&integers(), &extended_integers()).unwrap());
        assert!(!is_subtype(&extended_integers(), &integers()).unwrap());
    }

    #[test]
    fn exclusive_bounds_exclude_the_endpoints() {
        let open = integer_range(number::from_i64(0), false, number::from_i64(10), false);
        assert!(!is_instance(&number::from_i64(0), &open).unwrap());
        assert!(is_instance(&number::from_i64(1), &open).unwrap());
        assert!(!is_instance(&number::from_i64(10), &open).unwrap());
        assert!(is_subtype(&open, &inclusive_range(0, 10)).unwrap());
        assert!(!is_subtype(&inclusive_range(0, 10), &open).unwrap());
    }

    #[test]
    fn infinities_inhabit_extended_integers_only() {
        assert!(is_instance(&number::positive_infinity(), &extended_integers()).unwrap());
        assert!(!is_instance(&number::positive_infinity(), &integers()).unwrap());
    }

    #[test]
    fn strings_are_tuples_of_characters() {
        let s = tuple::string_from_str("hi");
        assert!(is_instance(&s, &string_type()).unwrap());
        assert!(is_instance(&s, &tuple_of(character())).unwrap());
        assert!(is_subtype(&string_type(), &tuple_of(character())).unwrap());
        assert!(is_subtype(&string_type(), &tuple_of(any())).unwrap());
        assert!(is_subtype(&tuple_of(character()), &string_type()).unwrap());
        assert!(!is_subtype(&tuple_of(any()), &string_type()).unwrap());
    }

    #[test]
    fn instance_types_are_singletons() {
        let three = number::from_i64(3);
        let t = instance_type(three.clone());
        assert!(is_instance(&number::from_i64(3), &t).unwrap());
        assert!(!is_instance(&number::from_i64(4), &t).unwrap());
        assert!(is_subtype(&t, &inclusive_range(0, 5)).unwrap());
        assert!(!is_subtype(&t, &inclusive_range(4, 5)).unwrap());
    }

    #[test]
    fn function_types_are_contravariant_in_parameters() {
        let narrow = function_type(vec![integers()], any());
        let wide = function_type(vec![any()], any());
        assert!(is_subtype(&wide, &narrow).unwrap());
        assert!(!is_subtype(&narrow, &wide).unwrap());
    }

    #[test]
    fn disjointness_is_conservative() {
        assert!(is_disjoint(&inclusive_range(0, 5), &inclusive_range(6, 9)).unwrap());
        assert!(!is_disjoint(&inclusive_range(0, 5), &inclusive_range(5, 9)).unwrap());
        assert!(is_disjoint(&string_type(), &integers()).unwrap());
        assert!(!is_disjoint(&any(), &integers()).unwrap());
        assert!(!is_disjoint(&number(), &integers()).unwrap());
    }

    #[test]
    fn nil_type_holds_only_nil() {
        assert!(is_instance(&values::nil(), &nil_type()).unwrap());
        assert!(!is_instance(&number::from_i64(0), &nil_type()).unwrap());
    }

    #[test]
    fn equal_types_hash_equal() {
        assert_eq!(
            hash(&inclusive_range(1, 9)).unwrap(),
            hash(&inclusive_range(1, 9)).unwrap()
        );
        assert_ne!(
            hash(&inclusive_range(1, 9)).unwrap(),
            hash(&inclusive_range(1, 8)).unwrap()
        );
    }
}
