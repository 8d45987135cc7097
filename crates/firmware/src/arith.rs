//! Host-side modular exponentiation, the reference for the `modpow` fixture.

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum ArithError {
    #[error("modulus must be positive")]
    ZeroModulus,
    #[error("exponent must not be negative")]
    NegativeExponent,
}

/// Right-to-left square-and-multiply, `base^exp mod m`.
///
/// Products are formed in 128 bits, so any 64-bit modulus is exact.
pub fn mod_pow(base: u64, exp: u64, m: u64) -> Result<u64, ArithError> {
    if m == 0 {
        return Err(ArithError::ZeroModulus);
    }

    let m = m as u128;
    let mut acc: u128 = 1;
    let mut base = base as u128 % m;
    let mut exp = exp;

    while exp != 0 {
        if exp & 1 == 1 {
            acc = acc * base % m;
        }
        base = base * base % m;
        exp >>= 1;
    }

    Ok((acc % m) as u64)
}

/// The same loop on signed 64-bit values with wrapping products and
/// truncating remainder.
///
/// Agrees with [`mod_pow`] while `m * m` fits in an `i64`; beyond that the
/// squares wrap and the result is wrong.
pub fn mod_pow_textbook(base: i64, exp: i64, m: i64) -> Result<i64, ArithError> {
    if m <= 0 {
        return Err(ArithError::ZeroModulus);
    }
    if exp < 0 {
        return Err(ArithError::NegativeExponent);
    }

    let mut acc: i64 = 1;
    let mut base = base;
    let mut exp = exp;

    while exp != 0 {
        if exp & 1 == 1 {
            acc = acc.wrapping_mul(base) % m;
        }
        base = base.wrapping_mul(base) % m;
        exp >>= 1;
    }

    Ok(acc % m)
}

#[cfg(test)]
mod tests {
    use super::*;

    const BIG_MODULUS: u64 = 0x7fff_ffff_ffff_ffe7;

    #[test]
    fn test_benchmark_constants() {
        assert_eq!(mod_pow(0x1234, 0x7a69, 0xa590_68FF), Ok(0x5412_0558));
        assert_eq!(mod_pow_textbook(0x1234, 0x7a69, 0xa590_68FF), Ok(0x5412_0558));
    }

    #[test]
    fn test_small_values() {
        assert_eq!(mod_pow(2, 10, 1000), Ok(24));
        assert_eq!(mod_pow(7, 0, 13), Ok(1));
        assert_eq!(mod_pow(5, 3, 1), Ok(0));
        assert_eq!(mod_pow(3, 5, 0), Err(ArithError::ZeroModulus));
    }

    #[test]
    fn test_textbook_wraps_on_large_modulus() {
        assert_eq!(mod_pow(3, 65537, BIG_MODULUS), Ok(3_868_895_754_856_397_334));
        assert_eq!(
            mod_pow_textbook(3, 65537, BIG_MODULUS as i64),
            Ok(917_085_678_152_187_907)
        );
    }

    #[test]
    fn test_textbook_rejects_bad_arguments() {
        assert_eq!(mod_pow_textbook(2, 3, 0), Err(ArithError::ZeroModulus));
        assert_eq!(mod_pow_textbook(2, 3, -7), Err(ArithError::ZeroModulus));
        assert_eq!(mod_pow_textbook(2, -1, 7), Err(ArithError::NegativeExponent));
    }
}
