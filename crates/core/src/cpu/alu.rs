//! Flag computation for the AVR arithmetic and logic unit.

use super::Sreg;

fn bit(value: u8, n: u8) -> bool {
    value & (1 << n) != 0
}

fn set_nzs(sreg: &mut Sreg, res: u8) {
    sreg.set(Sreg::N, bit(res, 7));
    sreg.set(Sreg::Z, res == 0);
    let s = sreg.contains(Sreg::N) ^ sreg.contains(Sreg::V);
    sreg.set(Sreg::S, s);
}

/// ADD / ADC.
pub fn add8(sreg: &mut Sreg, d: u8, r: u8, carry: bool) -> u8 {
    let res = d.wrapping_add(r).wrapping_add(carry as u8);
    let carries = (d & r) | (r & !res) | (!res & d);
    sreg.set(Sreg::H, bit(carries, 3));
    sreg.set(Sreg::C, bit(carries, 7));
    sreg.set(Sreg::V, bit((d & r & !res) | (!d & !r & res), 7));
    set_nzs(sreg, res);
    res
}

/// SUB / SUBI / SBC / SBCI / CP / CPC / CPI / NEG.
///
/// With `keep_zero` (SBC, SBCI, CPC) Z is only ever cleared, so multi-byte
/// comparisons chain correctly.
pub fn sub8(sreg: &mut Sreg, d: u8, r: u8, borrow: bool, keep_zero: bool) -> u8 {
    let res = d.wrapping_sub(r).wrapping_sub(borrow as u8);
    let borrows = (!d & r) | (r & res) | (res & !d);
    sreg.set(Sreg::H, bit(borrows, 3));
    sreg.set(Sreg::C, bit(borrows, 7));
    sreg.set(Sreg::V, bit((d & !r & !res) | (!d & r & res), 7));
    let zero = res == 0 && (!keep_zero || sreg.contains(Sreg::Z));
    sreg.set(Sreg::N, bit(res, 7));
    sreg.set(Sreg::Z, zero);
    let s = sreg.contains(Sreg::N) ^ sreg.contains(Sreg::V);
    sreg.set(Sreg::S, s);
    res
}

/// AND / ANDI / OR / ORI / EOR.
pub fn logic8(sreg: &mut Sreg, res: u8) -> u8 {
    sreg.remove(Sreg::V);
    set_nzs(sreg, res);
    res
}

pub fn com8(sreg: &mut Sreg, d: u8) -> u8 {
    let res = !d;
    sreg.insert(Sreg::C);
    logic8(sreg, res)
}

pub fn inc8(sreg: &mut Sreg, d: u8) -> u8 {
    let res = d.wrapping_add(1);
    sreg.set(Sreg::V, res == 0x80);
    set_nzs(sreg, res);
    res
}

pub fn dec8(sreg: &mut Sreg, d: u8) -> u8 {
    let res = d.wrapping_sub(1);
    sreg.set(Sreg::V, res == 0x7F);
    set_nzs(sreg, res);
    res
}

fn shift_flags(sreg: &mut Sreg, res: u8, carry_out: bool) -> u8 {
    sreg.set(Sreg::C, carry_out);
    sreg.set(Sreg::N, bit(res, 7));
    sreg.set(Sreg::Z, res == 0);
    let v = sreg.contains(Sreg::N) ^ carry_out;
    sreg.set(Sreg::V, v);
    sreg.set(Sreg::S, sreg.contains(Sreg::N) ^ v);
    res
}

pub fn lsr8(sreg: &mut Sreg, d: u8) -> u8 {
    shift_flags(sreg, d >> 1, bit(d, 0))
}

pub fn ror8(sreg: &mut Sreg, d: u8) -> u8 {
    let carry_in = (sreg.contains(Sreg::C) as u8) << 7;
    shift_flags(sreg, (d >> 1) | carry_in, bit(d, 0))
}

pub fn asr8(sreg: &mut Sreg, d: u8) -> u8 {
    shift_flags(sreg, (d >> 1) | (d & 0x80), bit(d, 0))
}

fn word_flags(sreg: &mut Sreg, res: u16) {
    sreg.set(Sreg::N, res & 0x8000 != 0);
    sreg.set(Sreg::Z, res == 0);
    let s = sreg.contains(Sreg::N) ^ sreg.contains(Sreg::V);
    sreg.set(Sreg::S, s);
}

pub fn adiw(sreg: &mut Sreg, value: u16, k: u8) -> u16 {
    let res = value.wrapping_add(k as u16);
    sreg.set(Sreg::V, !value & res & 0x8000 != 0);
    sreg.set(Sreg::C, !res & value & 0x8000 != 0);
    word_flags(sreg, res);
    res
}

pub fn sbiw(sreg: &mut Sreg, value: u16, k: u8) -> u16 {
    let res = value.wrapping_sub(k as u16);
    sreg.set(Sreg::V, value & !res & 0x8000 != 0);
    sreg.set(Sreg::C, res & !value & 0x8000 != 0);
    word_flags(sreg, res);
    res
}

/// Multiplier flavour for the MUL family.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MulKind {
    Unsigned,
    Signed,
    SignedUnsigned,
}

/// MUL / MULS / MULSU and, with `fractional`, FMUL / FMULS / FMULSU.
/// Returns the 16-bit product destined for r1:r0.
pub fn mul(sreg: &mut Sreg, d: u8, r: u8, kind: MulKind, fractional: bool) -> u16 {
    let product = match kind {
        MulKind::Unsigned => (d as u16) * (r as u16),
        MulKind::Signed => ((d as i8 as i16) * (r as i8 as i16)) as u16,
        MulKind::SignedUnsigned => ((d as i8 as i16) * (r as i16)) as u16,
    };
    sreg.set(Sreg::C, product & 0x8000 != 0);
    let res = if fractional { product << 1 } else { product };
    sreg.set(Sreg::Z, res == 0);
    res
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_add_half_carry_and_overflow() {
        let mut sreg = Sreg::empty();
        assert_eq!(add8(&mut sreg, 0x0F, 0x01, false), 0x10);
        assert!(sreg.contains(Sreg::H));
        assert!(!sreg.contains(Sreg::C));

        assert_eq!(add8(&mut sreg, 0x7F, 0x01, false), 0x80);
        assert!(sreg.contains(Sreg::V));
        assert!(sreg.contains(Sreg::N));
        assert!(!sreg.contains(Sreg::S));

        assert_eq!(add8(&mut sreg, 0xFF, 0x00, true), 0x00);
        assert!(sreg.contains(Sreg::C));
        assert!(sreg.contains(Sreg::Z));
    }

    #[test]
    fn test_sub_borrow_chain_keeps_zero() {
        let mut sreg = Sreg::empty();
        // 0x0100 - 0x0001: low byte borrows
        assert_eq!(sub8(&mut sreg, 0x00, 0x01, false, false), 0xFF);
        assert!(sreg.contains(Sreg::C));
        assert_eq!(sub8(&mut sreg, 0x01, 0x00, true, true), 0x00);
        // Z stays clear because the low byte was nonzero
        assert!(!sreg.contains(Sreg::Z));
        assert!(!sreg.contains(Sreg::C));
    }

    #[test]
    fn test_neg_flags() {
        let mut sreg = Sreg::empty();
        assert_eq!(sub8(&mut sreg, 0, 0x80, false, false), 0x80);
        assert!(sreg.contains(Sreg::V));
        assert!(sreg.contains(Sreg::C));
        assert_eq!(sub8(&mut sreg, 0, 0, false, false), 0);
        assert!(!sreg.contains(Sreg::C));
        assert!(sreg.contains(Sreg::Z));
    }

    #[test]
    fn test_inc_dec_overflow() {
        let mut sreg = Sreg::C;
        assert_eq!(inc8(&mut sreg, 0x7F), 0x80);
        assert!(sreg.contains(Sreg::V));
        // carry untouched
        assert!(sreg.contains(Sreg::C));
        assert_eq!(dec8(&mut sreg, 0x80), 0x7F);
        assert!(sreg.contains(Sreg::V));
        assert!(!sreg.contains(Sreg::N));
    }

    #[test]
    fn test_ror_through_carry() {
        let mut sreg = Sreg::C;
        assert_eq!(ror8(&mut sreg, 0x02), 0x81);
        assert!(!sreg.contains(Sreg::C));
        assert_eq!(lsr8(&mut sreg, 0x01), 0x00);
        assert!(sreg.contains(Sreg::C));
        assert!(sreg.contains(Sreg::Z));
        assert!(sreg.contains(Sreg::V));
        assert_eq!(asr8(&mut sreg, 0x84), 0xC2);
    }

    #[test]
    fn test_word_arithmetic() {
        let mut sreg = Sreg::empty();
        assert_eq!(adiw(&mut sreg, 0xFFFF, 1), 0);
        assert!(sreg.contains(Sreg::C));
        assert!(sreg.contains(Sreg::Z));
        assert_eq!(sbiw(&mut sreg, 0x8000, 1), 0x7FFF);
        assert!(sreg.contains(Sreg::V));
        assert!(!sreg.contains(Sreg::C));
    }

    #[test]
    fn test_multiply_variants() {
        let mut sreg = Sreg::empty();
        assert_eq!(mul(&mut sreg, 0xFF, 0xFF, MulKind::Unsigned, false), 0xFE01);
        assert!(sreg.contains(Sreg::C));
        assert_eq!(mul(&mut sreg, 0xFF, 0x02, MulKind::Signed, false), 0xFFFE);
        assert_eq!(mul(&mut sreg, 0xFF, 0x02, MulKind::SignedUnsigned, false), 0xFFFE);
        // 0.5 * 0.5 = 0.25 in 1.7 fixed point
        assert_eq!(mul(&mut sreg, 0x40, 0x40, MulKind::Unsigned, true), 0x2000);
        assert!(!sreg.contains(Sreg::C));
    }
}
