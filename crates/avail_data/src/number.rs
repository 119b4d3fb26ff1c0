//! Numbers: variable-precision integers, signed infinities, floats.
//!
//! Integers are signed-magnitude: one integer slot for the sign, then
//! little-endian 32-bit limbs with no trailing zero limb (zero is the empty
//! magnitude with a non-negative sign). The two infinities are slotless
//! kinds of their own. Floats store raw IEEE-754 bits.
//!
//! Binary arithmetic dispatches on the first operand's kind to a dedicated
//! `<op>_by_<kind>` function which in turn matches the second operand,
//! keeping overload resolution explicit and closed.
//!
//! Domain rules for the extended integers:
//! - `±∞ + ±∞` (same sign) → that infinity
//! - `±∞ + ∓∞` → `ArithmeticDomain`
//! - `±∞ · 0` → `ArithmeticDomain`
//! - anything `/ 0` (integer) → `DivisionByZero`
//! - `±∞ / ±∞` → `ArithmeticDomain`; finite `/ ±∞` → `0`
//!
//! Integer division truncates toward zero.

use std::cmp::Ordering;

use avail_base::hash::{combine2, mix};
use avail_base::{AvailObject, Descriptor, ErrorKind, Kind, VmResult};

/// Integer slot holding 1 for negative magnitudes.
const SIGN: usize = 0;
/// First limb slot.
const LIMBS: usize = 1;

/// Float bit slots.
const FLOAT_BITS: usize = 0;
const DOUBLE_LOW: usize = 0;
const DOUBLE_HIGH: usize = 1;

const POSITIVE_SALT: u32 = 0x1237_BEAD;
const NEGATIVE_SALT: u32 = 0x8811_FACE;
const POSITIVE_INFINITY_HASH: u32 = 0x7F80_0001;
const NEGATIVE_INFINITY_HASH: u32 = 0xFF80_0001;
const FLOAT_SALT: u32 = 0x5EAF_0A77;

// ---------------------------------------------------------------------------
// Construction and extraction
// ---------------------------------------------------------------------------

/// An integer from little-endian limbs, normalized to canonical form.
pub fn from_limbs(negative: bool, mut limbs: Vec<u32>) -> AvailObject {
    while limbs.last() == Some(&0) {
        limbs.pop();
    }
    let negative = negative && !limbs.is_empty();
    let mut ints = Vec::with_capacity(LIMBS + limbs.len());
    ints.push(negative as u32);
    ints.extend(limbs);
    AvailObject::with_slots(Descriptor::mutable(Kind::Integer), Vec::new(), ints)
}

/// An integer from an `i64`.
pub fn from_i64(value: i64) -> AvailObject {
    let negative = value < 0;
    let magnitude = (value as i128).unsigned_abs() as u64;
    from_limbs(negative, vec![magnitude as u32, (magnitude >> 32) as u32])
}

/// An integer from a `u32`.
pub fn from_u32(value: u32) -> AvailObject {
    from_limbs(false, vec![value])
}

/// An integer from a `u64`.
pub fn from_u64(value: u64) -> AvailObject {
    from_limbs(false, vec![value as u32, (value >> 32) as u32])
}

/// The value `∞`.
pub fn positive_infinity() -> AvailObject {
    AvailObject::allocate(Descriptor::shared(Kind::PositiveInfinity), 0, 0)
}

/// The value `-∞`.
pub fn negative_infinity() -> AvailObject {
    AvailObject::allocate(Descriptor::shared(Kind::NegativeInfinity), 0, 0)
}

/// A single-precision float object.
pub fn single_from_f32(value: f32) -> AvailObject {
    let obj = AvailObject::allocate(Descriptor::mutable(Kind::SingleFloat), 0, 0);
    obj.set_integer_slot(FLOAT_BITS, value.to_bits());
    obj
}

/// A double-precision float object.
pub fn double_from_f64(value: f64) -> AvailObject {
    let obj = AvailObject::allocate(Descriptor::mutable(Kind::DoubleFloat), 0, 0);
    let bits = value.to_bits();
    obj.set_integer_slot(DOUBLE_LOW, bits as u32);
    obj.set_integer_slot(DOUBLE_HIGH, (bits >> 32) as u32);
    obj
}

fn magnitude(obj: &AvailObject) -> Vec<u32> {
    let ints = obj.integer_slots_snapshot();
    ints[LIMBS..].to_vec()
}

fn is_negative(obj: &AvailObject) -> bool {
    obj.integer_slot(SIGN) != 0
}

/// Whether the (traversed) object is the integer zero.
pub fn is_zero(obj: &AvailObject) -> bool {
    let obj = obj.traverse();
    obj.kind() == Kind::Integer && obj.integer_slot_count() == LIMBS
}

/// Extracts an `i64` if the integer fits.
pub fn to_i64(obj: &AvailObject) -> Option<i64> {
    let obj = obj.traverse();
    if obj.kind() != Kind::Integer {
        return None;
    }
    let limbs = magnitude(&obj);
    if limbs.len() > 2 {
        return None;
    }
    let mut mag = 0u64;
    for (i, &l) in limbs.iter().enumerate() {
        mag |= (l as u64) << (32 * i);
    }
    if is_negative(&obj) {
        if mag > (i64::MAX as u64) + 1 {
            return None;
        }
        Some((mag as i64).wrapping_neg())
    } else {
        if mag > i64::MAX as u64 {
            return None;
        }
        Some(mag as i64)
    }
}

/// Extracts a `u32` if the integer is non-negative and fits.
pub fn to_u32(obj: &AvailObject) -> Option<u32> {
    let obj = obj.traverse();
    if obj.kind() != Kind::Integer || is_negative(&obj) {
        return None;
    }
    let limbs = magnitude(&obj);
    match limbs.len() {
        0 => Some(0),
        1 => Some(limbs[0]),
        _ => None,
    }
}

/// The closest `f64`, for mixed-mode arithmetic. Infinities map to IEEE
/// infinities.
pub fn to_f64(obj: &AvailObject) -> VmResult<f64> {
    let obj = obj.traverse();
    match obj.kind() {
        Kind::Integer => {
            let mut value = 0f64;
            for &limb in magnitude(&obj).iter().rev() {
                value = value * 4294967296.0 + limb as f64;
            }
            Ok(if is_negative(&obj) { -value } else { value })
        }
        Kind::PositiveInfinity => Ok(f64::INFINITY),
        Kind::NegativeInfinity => Ok(f64::NEG_INFINITY),
        Kind::SingleFloat => Ok(f32::from_bits(obj.integer_slot(FLOAT_BITS)) as f64),
        Kind::DoubleFloat => {
            let bits = obj.integer_slot(DOUBLE_LOW) as u64
                | ((obj.integer_slot(DOUBLE_HIGH) as u64) << 32);
            Ok(f64::from_bits(bits))
        }
        _ => Err(ErrorKind::NotSupported.into()),
    }
}

/// Reads a single-float's value.
pub fn single_value(obj: &AvailObject) -> VmResult<f32> {
    let obj = obj.traverse();
    if obj.kind() != Kind::SingleFloat {
        return Err(ErrorKind::NotSupported.into());
    }
    Ok(f32::from_bits(obj.integer_slot(FLOAT_BITS)))
}

// ---------------------------------------------------------------------------
// Hashing
// ---------------------------------------------------------------------------

/// The hash of a canonical signed magnitude.
pub fn hash_magnitude(negative: bool, limbs: &[u32]) -> u32 {
    let mut h = if negative { NEGATIVE_SALT } else { POSITIVE_SALT };
    for &limb in limbs {
        h = combine2(h, limb);
    }
    mix(h)
}

/// The hash of a small non-negative integer, matching [`hash_magnitude`]
/// for its canonical limb form. This is the element hash used by byte- and
/// nybble-tuples.
pub fn hash_u32(value: u32) -> u32 {
    if value == 0 {
        hash_magnitude(false, &[])
    } else {
        hash_magnitude(false, &[value])
    }
}

/// The hash of any number object.
pub fn hash_number(obj: &AvailObject) -> VmResult<u32> {
    let obj = obj.traverse();
    match obj.kind() {
        Kind::Integer => Ok(hash_magnitude(is_negative(&obj), &magnitude(&obj))),
        Kind::PositiveInfinity => Ok(POSITIVE_INFINITY_HASH),
        Kind::NegativeInfinity => Ok(NEGATIVE_INFINITY_HASH),
        Kind::SingleFloat => Ok(mix(obj.integer_slot(FLOAT_BITS) ^ FLOAT_SALT)),
        Kind::DoubleFloat => Ok(mix(combine2(
            obj.integer_slot(DOUBLE_LOW),
            obj.integer_slot(DOUBLE_HIGH),
        ) ^ FLOAT_SALT)),
        _ => Err(ErrorKind::NotSupported.into()),
    }
}

// ---------------------------------------------------------------------------
// Magnitude arithmetic
// ---------------------------------------------------------------------------

fn cmp_mag(a: &[u32], b: &[u32]) -> Ordering {
    if a.len() != b.len() {
        return a.len().cmp(&b.len());
    }
    for (x, y) in a.iter().rev().zip(b.iter().rev()) {
        match x.cmp(y) {
            Ordering::Equal => {}
            other => return other,
        }
    }
    Ordering::Equal
}

fn add_mag(a: &[u32], b: &[u32]) -> Vec<u32> {
    let mut out = Vec::with_capacity(a.len().max(b.len()) + 1);
    let mut carry = 0u64;
    for i in 0..a.len().max(b.len()) {
        let x = *a.get(i).unwrap_or(&0) as u64;
        let y = *b.get(i).unwrap_or(&0) as u64;
        let sum = x + y + carry;
        out.push(sum as u32);
        carry = sum >> 32;
    }
    if carry != 0 {
        out.push(carry as u32);
    }
    out
}

/// `a - b`, requiring `a ≥ b`.
fn sub_mag(a: &[u32], b: &[u32]) -> Vec<u32> {
    debug_assert!(cmp_mag(a, b) != Ordering::Less);
    let mut out = Vec::with_capacity(a.len());
    let mut borrow = 0i64;
    for i in 0..a.len() {
        let x = a[i] as i64;
        let y = *b.get(i).unwrap_or(&0) as i64;
        let mut diff = x - y - borrow;
        if diff < 0 {
            diff += 1 << 32;
            borrow = 1;
        } else {
            borrow = 0;
        }
        out.push(diff as u32);
    }
    out
}

fn mul_mag(a: &[u32], b: &[u32]) -> Vec<u32> {
    if a.is_empty() || b.is_empty() {
        return Vec::new();
    }
    let mut out = vec![0u32; a.len() + b.len()];
    for (i, &x) in a.iter().enumerate() {
        let mut carry = 0u64;
        for (j, &y) in b.iter().enumerate() {
            let acc = out[i + j] as u64 + (x as u64) * (y as u64) + carry;
            out[i + j] = acc as u32;
            carry = acc >> 32;
        }
        let mut k = i + b.len();
        while carry != 0 {
            let acc = out[k] as u64 + carry;
            out[k] = acc as u32;
            carry = acc >> 32;
            k += 1;
        }
    }
    out
}

fn bit_at(v: &[u32], bit: usize) -> bool {
    (v[bit / 32] >> (bit % 32)) & 1 == 1
}

fn shift_left_one_or(v: &mut Vec<u32>, low_bit: bool) {
    let mut carry = low_bit as u32;
    for limb in v.iter_mut() {
        let next_carry = *limb >> 31;
        *limb = (*limb << 1) | carry;
        carry = next_carry;
    }
    if carry != 0 {
        v.push(carry);
    }
}

/// Quotient and remainder by binary long division.
fn div_mod_mag(n: &[u32], d: &[u32]) -> (Vec<u32>, Vec<u32>) {
    debug_assert!(!d.is_empty());
    if cmp_mag(n, d) == Ordering::Less {
        return (Vec::new(), n.to_vec());
    }
    let bits = n.len() * 32;
    let mut quotient = vec![0u32; n.len()];
    let mut remainder: Vec<u32> = Vec::new();
    for bit in (0..bits).rev() {
        shift_left_one_or(&mut remainder, bit_at(n, bit));
        while remainder.last() == Some(&0) {
            remainder.pop();
        }
        if cmp_mag(&remainder, d) != Ordering::Less {
            remainder = sub_mag(&remainder, d);
            while remainder.last() == Some(&0) {
                remainder.pop();
            }
            quotient[bit / 32] |= 1 << (bit % 32);
        }
    }
    (quotient, remainder)
}

fn signed_sum(a_neg: bool, a_mag: &[u32], b_neg: bool, b_mag: &[u32]) -> AvailObject {
    if a_neg == b_neg {
        from_limbs(a_neg, add_mag(a_mag, b_mag))
    } else {
        match cmp_mag(a_mag, b_mag) {
            Ordering::Equal => from_limbs(false, Vec::new()),
            Ordering::Greater => from_limbs(a_neg, sub_mag(a_mag, b_mag)),
            Ordering::Less => from_limbs(b_neg, sub_mag(b_mag, a_mag)),
        }
    }
}

// ---------------------------------------------------------------------------
// Comparison over the extended integers (and floats, by value)
// ---------------------------------------------------------------------------

/// Numeric comparison over integers, infinities, and floats.
pub fn compare(a: &AvailObject, b: &AvailObject) -> VmResult<Ordering> {
    let a = a.traverse();
    let b = b.traverse();
    match (a.kind(), b.kind()) {
        (Kind::Integer, Kind::Integer) => {
            let (an, bn) = (is_negative(&a), is_negative(&b));
            Ok(match (an, bn) {
                (false, true) => Ordering::Greater,
                (true, false) => Ordering::Less,
                (false, false) => cmp_mag(&magnitude(&a), &magnitude(&b)),
                (true, true) => cmp_mag(&magnitude(&b), &magnitude(&a)),
            })
        }
        (Kind::PositiveInfinity, Kind::PositiveInfinity) => Ok(Ordering::Equal),
        (Kind::NegativeInfinity, Kind::NegativeInfinity) => Ok(Ordering::Equal),
        (Kind::PositiveInfinity, _) => Ok(Ordering::Greater),
        (_, Kind::PositiveInfinity) => Ok(Ordering::Less),
        (Kind::NegativeInfinity, _) => Ok(Ordering::Less),
        (_, Kind::NegativeInfinity) => Ok(Ordering::Greater),
        _ => {
            let (x, y) = (to_f64(&a)?, to_f64(&b)?);
            x.partial_cmp(&y).ok_or_else(|| ErrorKind::ArithmeticDomain.into())
        }
    }
}

// ---------------------------------------------------------------------------
// Pair-dispatched arithmetic
// ---------------------------------------------------------------------------

fn number_kind_check(obj: &AvailObject) -> VmResult<AvailObject> {
    let obj = obj.traverse();
    if obj.kind().supports(avail_base::OpFamily::Number) {
        Ok(obj)
    } else {
        Err(ErrorKind::NotSupported.into())
    }
}

/// `a + b`.
pub fn add(a: &AvailObject, b: &AvailObject) -> VmResult<AvailObject> {
    let a = number_kind_check(a)?;
    let b = number_kind_check(b)?;
    match a.kind() {
        Kind::Integer => add_by_integer(&b, &a),
        Kind::PositiveInfinity => add_by_infinity(&b, true),
        Kind::NegativeInfinity => add_by_infinity(&b, false),
        _ => float_binary(&a, &b, |x, y| x + y),
    }
}

fn add_by_integer(b: &AvailObject, a: &AvailObject) -> VmResult<AvailObject> {
    match b.kind() {
        Kind::Integer => Ok(signed_sum(
            is_negative(a),
            &magnitude(a),
            is_negative(b),
            &magnitude(b),
        )),
        Kind::PositiveInfinity => Ok(positive_infinity()),
        Kind::NegativeInfinity => Ok(negative_infinity()),
        _ => float_binary(a, b, |x, y| x + y),
    }
}

fn add_by_infinity(b: &AvailObject, positive: bool) -> VmResult<AvailObject> {
    match b.kind() {
        Kind::Integer => Ok(if positive {
            positive_infinity()
        } else {
            negative_infinity()
        }),
        Kind::PositiveInfinity if positive => Ok(positive_infinity()),
        Kind::NegativeInfinity if !positive => Ok(negative_infinity()),
        Kind::PositiveInfinity | Kind::NegativeInfinity => {
            Err(ErrorKind::ArithmeticDomain.into())
        }
        _ => {
            let a = if positive {
                positive_infinity()
            } else {
                negative_infinity()
            };
            float_binary(&a, b, |x, y| x + y)
        }
    }
}

/// `a - b`.
pub fn subtract(a: &AvailObject, b: &AvailObject) -> VmResult<AvailObject> {
    let a = number_kind_check(a)?;
    let b = number_kind_check(b)?;
    match (a.kind(), b.kind()) {
        (Kind::Integer, Kind::Integer) => Ok(signed_sum(
            is_negative(&a),
            &magnitude(&a),
            !is_negative(&b),
            &magnitude(&b),
        )),
        (Kind::Integer, Kind::PositiveInfinity) => Ok(negative_infinity()),
        (Kind::Integer, Kind::NegativeInfinity) => Ok(positive_infinity()),
        (Kind::PositiveInfinity, Kind::Integer) => Ok(positive_infinity()),
        (Kind::NegativeInfinity, Kind::Integer) => Ok(negative_infinity()),
        (Kind::PositiveInfinity, Kind::NegativeInfinity) => Ok(positive_infinity()),
        (Kind::NegativeInfinity, Kind::PositiveInfinity) => Ok(negative_infinity()),
        (Kind::PositiveInfinity, Kind::PositiveInfinity)
        | (Kind::NegativeInfinity, Kind::NegativeInfinity) => {
            Err(ErrorKind::ArithmeticDomain.into())
        }
        _ => float_binary(&a, &b, |x, y| x - y),
    }
}

/// `a · b`.
pub fn multiply(a: &AvailObject, b: &AvailObject) -> VmResult<AvailObject> {
    let a = number_kind_check(a)?;
    let b = number_kind_check(b)?;
    match a.kind() {
        Kind::Integer => multiply_by_integer(&b, &a),
        Kind::PositiveInfinity => multiply_by_infinity(&b, false),
        Kind::NegativeInfinity => multiply_by_infinity(&b, true),
        _ => float_binary(&a, &b, |x, y| x * y),
    }
}

fn multiply_by_integer(b: &AvailObject, a: &AvailObject) -> VmResult<AvailObject> {
    match b.kind() {
        Kind::Integer => Ok(from_limbs(
            is_negative(a) != is_negative(b),
            mul_mag(&magnitude(a), &magnitude(b)),
        )),
        Kind::PositiveInfinity => multiply_by_infinity(a, false),
        Kind::NegativeInfinity => multiply_by_infinity(a, true),
        _ => float_binary(a, b, |x, y| x * y),
    }
}

fn multiply_by_infinity(b: &AvailObject, negated: bool) -> VmResult<AvailObject> {
    let negative = match b.kind() {
        Kind::Integer => {
            if is_zero(b) {
                return Err(ErrorKind::ArithmeticDomain.into());
            }
            is_negative(b) != negated
        }
        Kind::PositiveInfinity => negated,
        Kind::NegativeInfinity => !negated,
        _ => {
            let a = if negated {
                negative_infinity()
            } else {
                positive_infinity()
            };
            return float_binary(&a, b, |x, y| x * y);
        }
    };
    Ok(if negative {
        negative_infinity()
    } else {
        positive_infinity()
    })
}

/// `a / b`, truncating toward zero for integers.
pub fn divide(a: &AvailObject, b: &AvailObject) -> VmResult<AvailObject> {
    let a = number_kind_check(a)?;
    let b = number_kind_check(b)?;
    match (a.kind(), b.kind()) {
        (Kind::Integer, Kind::Integer) => {
            if is_zero(&b) {
                return Err(ErrorKind::DivisionByZero.into());
            }
            let (q, _r) = div_mod_mag(&magnitude(&a), &magnitude(&b));
            Ok(from_limbs(is_negative(&a) != is_negative(&b), q))
        }
        (Kind::Integer, Kind::PositiveInfinity) | (Kind::Integer, Kind::NegativeInfinity) => {
            Ok(from_limbs(false, Vec::new()))
        }
        (Kind::PositiveInfinity | Kind::NegativeInfinity, Kind::Integer) => {
            if is_zero(&b) {
                return Err(ErrorKind::DivisionByZero.into());
            }
            let negative = (a.kind() == Kind::NegativeInfinity) != is_negative(&b);
            Ok(if negative {
                negative_infinity()
            } else {
                positive_infinity()
            })
        }
        (
            Kind::PositiveInfinity | Kind::NegativeInfinity,
            Kind::PositiveInfinity | Kind::NegativeInfinity,
        ) => Err(ErrorKind::ArithmeticDomain.into()),
        _ => float_binary(&a, &b, |x, y| x / y),
    }
}

/// Promotes to the wider of the operands' float precisions and applies `op`.
fn float_binary(
    a: &AvailObject,
    b: &AvailObject,
    op: impl Fn(f64, f64) -> f64,
) -> VmResult<AvailObject> {
    let result = op(to_f64(a)?, to_f64(b)?);
    let single = a.kind() != Kind::DoubleFloat && b.kind() != Kind::DoubleFloat;
    Ok(if single {
        single_from_f32(result as f32)
    } else {
        double_from_f64(result)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::equality::equals;

    #[test]
    fn i64_round_trip() {
        for v in [0, 1, -1, 42, i64::MAX, i64::MIN, 1 << 40] {
            assert_eq!(to_i64(&from_i64(v)), Some(v));
        }
    }

    #[test]
    fn zero_is_canonical() {
        let z = from_i64(0);
        assert!(is_zero(&z));
        assert_eq!(z.integer_slot_count(), 1);
        assert!(equals(&from_limbs(true, vec![0, 0]), &z));
    }

    #[test]
    fn addition_crosses_limb_boundaries() {
        let a = from_u64(u32::MAX as u64);
        let b = from_i64(1);
        let sum = add(&a, &b).unwrap();
        assert_eq!(to_i64(&sum), Some(1 << 32));
    }

    #[test]
    fn subtraction_borrows_and_flips_sign() {
        let diff = subtract(&from_i64(3), &from_i64(10)).unwrap();
        assert_eq!(to_i64(&diff), Some(-7));
    }

    #[test]
    fn multiplication_of_large_values() {
        let a = from_u64(0x1_0000_0001);
        let b = from_u64(0x1_0000_0001);
        let product = multiply(&a, &b).unwrap();
        // (2^32 + 1)^2 = 2^64 + 2^33 + 1
        let expected = from_limbs(false, vec![1, 2, 1]);
        assert!(equals(&product, &expected));
    }

    #[test]
    fn division_truncates_toward_zero() {
        assert_eq!(to_i64(&divide(&from_i64(7), &from_i64(2)).unwrap()), Some(3));
        assert_eq!(to_i64(&divide(&from_i64(-7), &from_i64(2)).unwrap()), Some(-3));
    }

    #[test]
    fn large_division() {
        let n = multiply(&from_u64(123_456_789_123), &from_u64(987_654_321)).unwrap();
        let q = divide(&n, &from_u64(987_654_321)).unwrap();
        assert_eq!(to_i64(&q), Some(123_456_789_123));
    }

    #[test]
    fn division_by_zero_fails() {
        let err = divide(&from_i64(1), &from_i64(0)).unwrap_err();
        assert_eq!(err.kind, ErrorKind::DivisionByZero);
    }

    #[test]
    fn same_sign_infinities_add() {
        let sum = add(&positive_infinity(), &positive_infinity()).unwrap();
        assert_eq!(sum.kind(), Kind::PositiveInfinity);
    }

    #[test]
    fn opposite_infinities_fail() {
        let err = add(&positive_infinity(), &negative_infinity()).unwrap_err();
        assert_eq!(err.kind, ErrorKind::ArithmeticDomain);
    }

    #[test]
    fn infinity_times_zero_fails() {
        let err = multiply(&positive_infinity(), &from_i64(0)).unwrap_err();
        assert_eq!(err.kind, ErrorKind::ArithmeticDomain);
        let err = multiply(&from_i64(0), &negative_infinity()).unwrap_err();
        assert_eq!(err.kind, ErrorKind::ArithmeticDomain);
    }

    #[test]
    fn infinity_signs_multiply() {
        let v = multiply(&negative_infinity(), &from_i64(-3)).unwrap();
        assert_eq!(v.kind(), Kind::PositiveInfinity);
    }

    #[test]
    fn finite_over_infinity_is_zero() {
        let q = divide(&from_i64(1000), &positive_infinity()).unwrap();
        assert!(is_zero(&q));
    }

    #[test]
    fn comparison_orders_the_extended_integers() {
        assert_eq!(
            compare(&negative_infinity(), &from_i64(i64::MIN)).unwrap(),
            Ordering::Less
        );
        assert_eq!(
            compare(&from_i64(5), &from_i64(3)).unwrap(),
            Ordering::Greater
        );
        assert_eq!(
            compare(&positive_infinity(), &from_i64(i64::MAX)).unwrap(),
            Ordering::Greater
        );
    }

    #[test]
    fn hash_matches_small_int_form() {
        assert_eq!(hash_number(&from_i64(9)).unwrap(), hash_u32(9));
        assert_eq!(hash_number(&from_i64(0)).unwrap(), hash_u32(0));
    }

    #[test]
    fn negative_and_positive_hash_differently() {
        assert_ne!(
            hash_number(&from_i64(-5)).unwrap(),
            hash_number(&from_i64(5)).unwrap()
        );
    }

    #[test]
    fn float_arithmetic_stays_single_precision() {
        let sum = add(&single_from_f32(1.5), &single_from_f32(2.25)).unwrap();
        assert_eq!(sum.kind(), Kind::SingleFloat);
        assert_eq!(single_value(&sum).unwrap(), 3.75);
    }

    #[test]
    fn mixed_int_and_double_promotes() {
        let sum = add(&from_i64(1), &double_from_f64(0.5)).unwrap();
        assert_eq!(sum.kind(), Kind::DoubleFloat);
        assert_eq!(to_f64(&sum).unwrap(), 1.5);
    }
}
