//! Hashing substrate: mixing constants and combinators.
//!
//! Hash values are 32-bit and must be stable across mutability transitions,
//! representation coalescing, and tuple re-representation. The tuple scheme
//! is a polynomial fold chosen so the hash of a concatenation is derivable
//! from the operand hashes and sizes alone:
//!
//! ```text
//! raw([e1..en])   = Σ h(ei) · M^(n-i)          (mod 2^32)
//! hash(t)         = raw(t) ⊕ (n·C1 + C2)
//! raw(a ++ b)     = raw(a) · M^|b| + raw(b)
//! ```
//!
//! Sets hash to the exclusive-or of their element hashes, so insertion order
//! is irrelevant by construction; maps fold each entry into a single word
//! first.

/// Polynomial multiplier for tuple hashing. Odd, so it is invertible mod 2^32.
pub const TUPLE_MULTIPLIER: u32 = 0x9E37_79B1;

/// Size-mixing constants applied after the polynomial fold.
pub const TUPLE_SIZE_C1: u32 = 0x85EB_CA6B;
pub const TUPLE_SIZE_C2: u32 = 0xC2B2_AE35;

/// Salt separating map entry hashes from bare value hashes.
pub const MAP_ENTRY_SALT: u32 = 0x27D4_EB2F;

/// Finalizing mix (xorshift-multiply avalanche).
pub fn mix(mut h: u32) -> u32 {
    h ^= h >> 16;
    h = h.wrapping_mul(0x85EB_CA6B);
    h ^= h >> 13;
    h = h.wrapping_mul(0xC2B2_AE35);
    h ^ (h >> 16)
}

/// Order-sensitive combination of two hash values.
pub fn combine2(a: u32, b: u32) -> u32 {
    mix(a.wrapping_mul(TUPLE_MULTIPLIER) ^ b)
}

/// Order-sensitive combination of three hash values.
pub fn combine3(a: u32, b: u32, c: u32) -> u32 {
    combine2(combine2(a, b), c)
}

/// `TUPLE_MULTIPLIER` raised to `exp`, mod 2^32, by binary exponentiation.
pub fn multiplier_power(exp: u64) -> u32 {
    let mut base = TUPLE_MULTIPLIER;
    let mut result: u32 = 1;
    let mut e = exp;
    while e > 0 {
        if e & 1 == 1 {
            result = result.wrapping_mul(base);
        }
        base = base.wrapping_mul(base);
        e >>= 1;
    }
    result
}

/// Folds one element hash into a running tuple polynomial.
pub fn tuple_fold(raw: u32, element_hash: u32) -> u32 {
    raw.wrapping_mul(TUPLE_MULTIPLIER).wrapping_add(element_hash)
}

/// Finalizes a tuple polynomial given the tuple's size.
pub fn tuple_finish(raw: u32, size: u64) -> u32 {
    raw ^ (size as u32).wrapping_mul(TUPLE_SIZE_C1).wrapping_add(TUPLE_SIZE_C2)
}

/// Recovers the polynomial from a finished tuple hash and size.
pub fn tuple_unfinish(hash: u32, size: u64) -> u32 {
    hash ^ (size as u32).wrapping_mul(TUPLE_SIZE_C1).wrapping_add(TUPLE_SIZE_C2)
}

/// The hash of `a ++ b`, computed from the operand hashes and sizes only.
pub fn tuple_concat_hash(hash_a: u32, size_a: u64, hash_b: u32, size_b: u64) -> u32 {
    let raw_a = tuple_unfinish(hash_a, size_a);
    let raw_b = tuple_unfinish(hash_b, size_b);
    let raw = raw_a.wrapping_mul(multiplier_power(size_b)).wrapping_add(raw_b);
    tuple_finish(raw, size_a + size_b)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tuple_hash(elements: &[u32]) -> u32 {
        let raw = elements.iter().fold(0u32, |r, &h| tuple_fold(r, h));
        tuple_finish(raw, elements.len() as u64)
    }

    #[test]
    fn concat_hash_matches_direct_hash() {
        let a = [mix(1), mix(2), mix(3)];
        let b = [mix(4), mix(5)];
        let whole = [mix(1), mix(2), mix(3), mix(4), mix(5)];
        let combined = tuple_concat_hash(
            tuple_hash(&a),
            a.len() as u64,
            tuple_hash(&b),
            b.len() as u64,
        );
        assert_eq!(combined, tuple_hash(&whole));
    }

    #[test]
    fn concat_with_empty_is_identity() {
        let a = [mix(7), mix(8)];
        let empty = tuple_hash(&[]);
        assert_eq!(
            tuple_concat_hash(tuple_hash(&a), 2, empty, 0),
            tuple_hash(&a)
        );
        assert_eq!(
            tuple_concat_hash(empty, 0, tuple_hash(&a), 2),
            tuple_hash(&a)
        );
    }

    #[test]
    fn size_distinguishes_padded_tuples() {
        // [0] and [0, 0] share a raw polynomial of zero; the size term must
        // separate them.
        assert_ne!(tuple_hash(&[0]), tuple_hash(&[0, 0]));
    }

    #[test]
    fn multiplier_power_agrees_with_repeated_multiplication() {
        let mut expected: u32 = 1;
        for e in 0..40u64 {
            assert_eq!(multiplier_power(e), expected);
            expected = expected.wrapping_mul(TUPLE_MULTIPLIER);
        }
    }

    #[test]
    fn mix_has_no_trivial_fixed_point_at_small_values() {
        for v in 0..16 {
            assert_ne!(mix(v), v);
        }
    }
}
