//! Scalar implementations of the EVM arithmetic, comparison and bitwise
//! operations over 256-bit words.
//!
//! All results are reduced modulo 2^256. Signed variants interpret their
//! operands as two's-complement values. Division or modulo by zero yields
//! zero, matching EVM semantics.

use alloy::primitives::{I256, U256};

/// ADD: wrapping sum of the inputs.
pub fn add(l: U256, r: U256) -> U256 {
    l.wrapping_add(r)
}

/// MUL: wrapping product of the inputs.
pub fn mul(l: U256, r: U256) -> U256 {
    l.wrapping_mul(r)
}

/// SUB: wrapping difference of the inputs.
pub fn sub(l: U256, r: U256) -> U256 {
    l.wrapping_sub(r)
}

/// DIV: unsigned quotient; division by zero yields zero.
pub fn div(l: U256, r: U256) -> U256 {
    if r.is_zero() { U256::ZERO } else { l / r }
}

/// SDIV: signed quotient, truncated towards zero.
/// The lone overflow case, MIN / -1, wraps back to MIN.
pub fn sdiv(l: U256, r: U256) -> U256 {
    let (l, r) = (I256::from_raw(l), I256::from_raw(r));
    if r.is_zero() {
        U256::ZERO
    } else {
        l.checked_div(r).unwrap_or(I256::MIN).into_raw()
    }
}

/// MOD: unsigned remainder; modulo zero yields zero.
pub fn modulo(v: U256, m: U256) -> U256 {
    if m.is_zero() { U256::ZERO } else { v % m }
}

/// SMOD: signed remainder. The output takes the sign of the dividend.
pub fn smod(v: U256, m: U256) -> U256 {
    let (v, m) = (I256::from_raw(v), I256::from_raw(m));
    if m.is_zero() {
        U256::ZERO
    } else {
        v.checked_rem(m).map(I256::into_raw).unwrap_or(U256::ZERO)
    }
}

/// ADDMOD: (l + r) % m at full precision; modulo zero yields zero.
pub fn addmod(l: U256, r: U256, m: U256) -> U256 {
    if m.is_zero() { U256::ZERO } else { l.add_mod(r, m) }
}

/// MULMOD: (l * r) % m at full precision; modulo zero yields zero.
pub fn mulmod(l: U256, r: U256, m: U256) -> U256 {
    if m.is_zero() { U256::ZERO } else { l.mul_mod(r, m) }
}

/// EXP: wrapping exponentiation.
pub fn exp(b: U256, e: U256) -> U256 {
    b.pow(e)
}

/// SIGNEXTEND: extend the high bit of the b'th byte (counting from the least
/// significant) to the most significant bit of the output. Byte indices of
/// 31 and above leave the value unchanged.
pub fn signextend(b: U256, v: U256) -> U256 {
    if b >= U256::from(32) {
        return v;
    }
    let bit = b.to::<usize>() * 8 + 7;
    let mask = U256::MAX >> (255 - bit);
    if v.bit(bit) { v | !mask } else { v & mask }
}

/// LT: unsigned less-than comparison.
pub fn lt(l: U256, r: U256) -> U256 {
    if l < r { U256::ONE } else { U256::ZERO }
}

/// GT: unsigned greater-than comparison.
pub fn gt(l: U256, r: U256) -> U256 {
    if l > r { U256::ONE } else { U256::ZERO }
}

/// SLT: signed less-than comparison.
pub fn slt(l: U256, r: U256) -> U256 {
    if I256::from_raw(l) < I256::from_raw(r) {
        U256::ONE
    } else {
        U256::ZERO
    }
}

/// SGT: signed greater-than comparison.
pub fn sgt(l: U256, r: U256) -> U256 {
    if I256::from_raw(l) > I256::from_raw(r) {
        U256::ONE
    } else {
        U256::ZERO
    }
}

/// EQ: equality comparison.
pub fn eq(l: U256, r: U256) -> U256 {
    if l == r { U256::ONE } else { U256::ZERO }
}

/// ISZERO: 1 if the input is zero, 0 otherwise.
pub fn iszero(v: U256) -> U256 {
    if v.is_zero() { U256::ONE } else { U256::ZERO }
}

/// AND: bitwise conjunction.
pub fn and(l: U256, r: U256) -> U256 {
    l & r
}

/// OR: bitwise disjunction.
pub fn or(l: U256, r: U256) -> U256 {
    l | r
}

/// XOR: bitwise exclusive or.
pub fn xor(l: U256, r: U256) -> U256 {
    l ^ r
}

/// NOT: bitwise negation.
pub fn not(v: U256) -> U256 {
    !v
}

/// BYTE: the b'th byte of v, counting from the most significant.
/// Indices of 32 and above yield zero.
pub fn byte(b: U256, v: U256) -> U256 {
    if b >= U256::from(32) {
        return U256::ZERO;
    }
    U256::from(v.byte(31 - b.to::<usize>()))
}

/// SHL: logical shift left; shifts of 256 or more yield zero.
pub fn shl(shift: U256, v: U256) -> U256 {
    if shift >= U256::from(256) {
        U256::ZERO
    } else {
        v.wrapping_shl(shift.to::<usize>())
    }
}

/// SHR: logical shift right; shifts of 256 or more yield zero.
pub fn shr(shift: U256, v: U256) -> U256 {
    if shift >= U256::from(256) {
        U256::ZERO
    } else {
        v.wrapping_shr(shift.to::<usize>())
    }
}

/// SAR: arithmetic shift right. Shifts of 256 or more saturate to all-ones
/// for negative values and zero otherwise.
pub fn sar(shift: U256, v: U256) -> U256 {
    if shift >= U256::from(256) {
        if v.bit(255) { U256::MAX } else { U256::ZERO }
    } else {
        v.arithmetic_shr(shift.to::<usize>())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn u(n: u64) -> U256 {
        U256::from(n)
    }

    /// -n as a 256-bit two's complement word.
    fn neg(n: u64) -> U256 {
        U256::ZERO.wrapping_sub(U256::from(n))
    }

    #[test]
    fn add_wraps() {
        assert_eq!(add(u(2), u(3)), u(5));
        assert_eq!(add(U256::MAX, u(1)), U256::ZERO);
    }

    #[test]
    fn sub_wraps() {
        assert_eq!(sub(u(5), u(2)), u(3));
        assert_eq!(sub(u(0), u(1)), U256::MAX);
    }

    #[test]
    fn division_by_zero_is_zero() {
        assert_eq!(div(u(10), u(0)), u(0));
        assert_eq!(sdiv(u(10), u(0)), u(0));
        assert_eq!(modulo(u(10), u(0)), u(0));
        assert_eq!(smod(u(10), u(0)), u(0));
        assert_eq!(addmod(u(1), u(2), u(0)), u(0));
        assert_eq!(mulmod(u(2), u(3), u(0)), u(0));
    }

    #[test]
    fn signed_division() {
        assert_eq!(sdiv(neg(10), u(2)), neg(5));
        assert_eq!(sdiv(neg(10), neg(2)), u(5));
        assert_eq!(sdiv(u(10), neg(3)), neg(3));
        // MIN / -1 wraps back to MIN.
        let min = U256::ONE << 255;
        assert_eq!(sdiv(min, neg(1)), min);
    }

    #[test]
    fn signed_modulo_takes_dividend_sign() {
        assert_eq!(smod(neg(10), u(3)), neg(1));
        assert_eq!(smod(u(10), neg(3)), u(1));
        let min = U256::ONE << 255;
        assert_eq!(smod(min, neg(1)), u(0));
    }

    #[test]
    fn modular_ops_are_full_precision() {
        assert_eq!(addmod(U256::MAX, U256::MAX, u(7)), (U256::MAX % u(7)) * u(2) % u(7));
        assert_eq!(mulmod(U256::MAX, U256::MAX, u(12)), u(9));
    }

    #[test]
    fn exp_wraps() {
        assert_eq!(exp(u(2), u(10)), u(1024));
        assert_eq!(exp(u(2), u(256)), u(0));
    }

    #[test]
    fn signextend_extends_the_chosen_byte() {
        assert_eq!(signextend(u(0), u(0x7f)), u(0x7f));
        assert_eq!(signextend(u(0), u(0x80)), neg(0x80));
        assert_eq!(signextend(u(0), u(0x1234)), u(0x34));
        assert_eq!(signextend(u(1), u(0x1234)), u(0x1234));
        assert_eq!(signextend(u(32), U256::MAX), U256::MAX);
    }

    #[test]
    fn comparisons() {
        assert_eq!(lt(u(2), u(3)), u(1));
        assert_eq!(gt(u(2), u(3)), u(0));
        assert_eq!(slt(neg(1), u(0)), u(1));
        assert_eq!(sgt(neg(1), u(0)), u(0));
        assert_eq!(eq(u(7), u(7)), u(1));
        assert_eq!(iszero(u(0)), u(1));
        assert_eq!(iszero(u(3)), u(0));
    }

    #[test]
    fn byte_counts_from_most_significant() {
        let v = U256::from_be_bytes({
            let mut b = [0u8; 32];
            b[0] = 0xaa;
            b[31] = 0xbb;
            b
        });
        assert_eq!(byte(u(0), v), u(0xaa));
        assert_eq!(byte(u(31), v), u(0xbb));
        assert_eq!(byte(u(32), v), u(0));
    }

    #[test]
    fn shifts() {
        assert_eq!(shl(u(4), u(1)), u(16));
        assert_eq!(shr(u(4), u(16)), u(1));
        assert_eq!(shl(u(256), u(1)), u(0));
        assert_eq!(shr(u(256), U256::MAX), u(0));
        assert_eq!(sar(u(1), neg(2)), neg(1));
        assert_eq!(sar(u(256), neg(2)), U256::MAX);
        assert_eq!(sar(u(256), u(2)), u(0));
    }
}
