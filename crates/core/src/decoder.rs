//! AVRxm instruction decoding.
//!
//! Register operands are absolute register numbers (`r16`..`r31` for the
//! immediate forms, even numbers for `movw`/`adiw`). Relative offsets are in
//! words, absolute targets are word addresses.

use std::fmt;

/// Pointer register pair used by indirect loads and stores.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pointer {
    X,
    Y,
    Z,
}

impl Pointer {
    /// Number of the low register of the pair.
    pub fn low_register(self) -> usize {
        match self {
            Pointer::X => 26,
            Pointer::Y => 28,
            Pointer::Z => 30,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddrMode {
    Plain,
    PostInc,
    PreDec,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Instruction {
    Nop,
    Movw { rd: u8, rr: u8 },
    Muls { rd: u8, rr: u8 },
    Mulsu { rd: u8, rr: u8 },
    Fmul { rd: u8, rr: u8 },
    Fmuls { rd: u8, rr: u8 },
    Fmulsu { rd: u8, rr: u8 },
    Cpc { rd: u8, rr: u8 },
    Sbc { rd: u8, rr: u8 },
    Add { rd: u8, rr: u8 },
    Cpse { rd: u8, rr: u8 },
    Cp { rd: u8, rr: u8 },
    Sub { rd: u8, rr: u8 },
    Adc { rd: u8, rr: u8 },
    And { rd: u8, rr: u8 },
    Eor { rd: u8, rr: u8 },
    Or { rd: u8, rr: u8 },
    Mov { rd: u8, rr: u8 },
    Mul { rd: u8, rr: u8 },
    Cpi { rd: u8, k: u8 },
    Sbci { rd: u8, k: u8 },
    Subi { rd: u8, k: u8 },
    Ori { rd: u8, k: u8 },
    Andi { rd: u8, k: u8 },
    Ldi { rd: u8, k: u8 },
    /// `ldd rd, Y+q` / `ldd rd, Z+q`
    Ldd { rd: u8, ptr: Pointer, q: u8 },
    Std { ptr: Pointer, q: u8, rr: u8 },
    Lds { rd: u8, k: u16 },
    Sts { k: u16, rr: u8 },
    Ld { rd: u8, ptr: Pointer, mode: AddrMode },
    St { ptr: Pointer, mode: AddrMode, rr: u8 },
    Lpm { rd: u8, post_inc: bool },
    Elpm { rd: u8, post_inc: bool },
    Spm { post_inc: bool },
    Push { rr: u8 },
    Pop { rd: u8 },
    Com { rd: u8 },
    Neg { rd: u8 },
    Swap { rd: u8 },
    Inc { rd: u8 },
    Asr { rd: u8 },
    Lsr { rd: u8 },
    Ror { rd: u8 },
    Dec { rd: u8 },
    Bset { s: u8 },
    Bclr { s: u8 },
    Ijmp,
    Eijmp,
    Icall,
    Eicall,
    Ret,
    Reti,
    Sleep,
    Break,
    Wdr,
    Jmp { k: u32 },
    Call { k: u32 },
    Adiw { rd: u8, k: u8 },
    Sbiw { rd: u8, k: u8 },
    Cbi { a: u8, b: u8 },
    Sbic { a: u8, b: u8 },
    Sbi { a: u8, b: u8 },
    Sbis { a: u8, b: u8 },
    In { rd: u8, a: u8 },
    Out { a: u8, rr: u8 },
    Rjmp { k: i16 },
    Rcall { k: i16 },
    Brbs { s: u8, k: i8 },
    Brbc { s: u8, k: i8 },
    Bld { rd: u8, b: u8 },
    Bst { rd: u8, b: u8 },
    Sbrc { rr: u8, b: u8 },
    Sbrs { rr: u8, b: u8 },
    Unknown(u16),
}

impl Instruction {
    /// Size in 16-bit words.
    pub fn size(&self) -> u32 {
        match self {
            Instruction::Lds { .. }
            | Instruction::Sts { .. }
            | Instruction::Jmp { .. }
            | Instruction::Call { .. } => 2,
            _ => 1,
        }
    }

    /// Whether the opcode word `w0` starts a 32-bit instruction.
    pub fn is_two_word(w0: u16) -> bool {
        matches!(w0 & 0xFE0F, 0x9000 | 0x9200) || matches!(w0 & 0xFE0E, 0x940C | 0x940E)
    }
}

fn d5(op: u16) -> u8 {
    ((op >> 4) & 0x1F) as u8
}

fn r5(op: u16) -> u8 {
    (((op >> 5) & 0x10) | (op & 0x0F)) as u8
}

fn d4_high(op: u16) -> u8 {
    16 + ((op >> 4) & 0x0F) as u8
}

fn k8(op: u16) -> u8 {
    (((op >> 4) & 0xF0) | (op & 0x0F)) as u8
}

fn sign_extend(value: u16, bits: u32) -> i16 {
    let shift = 16 - bits;
    ((value << shift) as i16) >> shift
}

/// Decodes one instruction. `w1` is the word following `w0` and is only
/// consulted for 32-bit instructions.
pub fn decode(w0: u16, w1: u16) -> Instruction {
    use Instruction::*;

    let op = w0;
    match op >> 12 {
        0x0 => match (op >> 10) & 0x3 {
            0 => match (op >> 8) & 0x3 {
                0 if op == 0 => Nop,
                1 => Movw {
                    rd: (((op >> 4) & 0xF) * 2) as u8,
                    rr: ((op & 0xF) * 2) as u8,
                },
                2 => Muls {
                    rd: d4_high(op),
                    rr: 16 + (op & 0xF) as u8,
                },
                3 => {
                    let rd = 16 + ((op >> 4) & 0x7) as u8;
                    let rr = 16 + (op & 0x7) as u8;
                    match ((op >> 6) & 0x2) | ((op >> 3) & 0x1) {
                        0 => Mulsu { rd, rr },
                        1 => Fmul { rd, rr },
                        2 => Fmuls { rd, rr },
                        _ => Fmulsu { rd, rr },
                    }
                }
                _ => Unknown(op),
            },
            1 => Cpc { rd: d5(op), rr: r5(op) },
            2 => Sbc { rd: d5(op), rr: r5(op) },
            _ => Add { rd: d5(op), rr: r5(op) },
        },
        0x1 => match (op >> 10) & 0x3 {
            0 => Cpse { rd: d5(op), rr: r5(op) },
            1 => Cp { rd: d5(op), rr: r5(op) },
            2 => Sub { rd: d5(op), rr: r5(op) },
            _ => Adc { rd: d5(op), rr: r5(op) },
        },
        0x2 => match (op >> 10) & 0x3 {
            0 => And { rd: d5(op), rr: r5(op) },
            1 => Eor { rd: d5(op), rr: r5(op) },
            2 => Or { rd: d5(op), rr: r5(op) },
            _ => Mov { rd: d5(op), rr: r5(op) },
        },
        0x3 => Cpi { rd: d4_high(op), k: k8(op) },
        0x4 => Sbci { rd: d4_high(op), k: k8(op) },
        0x5 => Subi { rd: d4_high(op), k: k8(op) },
        0x6 => Ori { rd: d4_high(op), k: k8(op) },
        0x7 => Andi { rd: d4_high(op), k: k8(op) },
        0x8 | 0xA => decode_displacement(op),
        0x9 => decode_group_9(op, w1),
        0xB => {
            let a = (((op >> 5) & 0x30) | (op & 0x0F)) as u8;
            if op & 0x0800 == 0 {
                In { rd: d5(op), a }
            } else {
                Out { a, rr: d5(op) }
            }
        }
        0xC => Rjmp {
            k: sign_extend(op & 0x0FFF, 12),
        },
        0xD => Rcall {
            k: sign_extend(op & 0x0FFF, 12),
        },
        0xE => Ldi { rd: d4_high(op), k: k8(op) },
        _ => {
            let s = (op & 0x7) as u8;
            match (op >> 9) & 0x7 {
                0 | 1 => Brbs {
                    s,
                    k: sign_extend((op >> 3) & 0x7F, 7) as i8,
                },
                2 | 3 => Brbc {
                    s,
                    k: sign_extend((op >> 3) & 0x7F, 7) as i8,
                },
                _ if op & 0x0008 != 0 => Unknown(op),
                4 => Bld { rd: d5(op), b: s },
                5 => Bst { rd: d5(op), b: s },
                6 => Sbrc { rr: d5(op), b: s },
                _ => Sbrs { rr: d5(op), b: s },
            }
        }
    }
}

fn decode_displacement(op: u16) -> Instruction {
    let q = (((op >> 8) & 0x20) | ((op >> 7) & 0x18) | (op & 0x7)) as u8;
    let ptr = if op & 0x0008 != 0 { Pointer::Y } else { Pointer::Z };
    let store = op & 0x0200 != 0;
    let reg = d5(op);

    // A zero displacement is the plain `ld`/`st` form.
    match (store, q) {
        (false, 0) => Instruction::Ld {
            rd: reg,
            ptr,
            mode: AddrMode::Plain,
        },
        (true, 0) => Instruction::St {
            ptr,
            mode: AddrMode::Plain,
            rr: reg,
        },
        (false, q) => Instruction::Ldd { rd: reg, ptr, q },
        (true, q) => Instruction::Std { ptr, q, rr: reg },
    }
}

fn decode_group_9(op: u16, w1: u16) -> Instruction {
    use Instruction::*;

    let reg = d5(op);
    match (op >> 9) & 0x7 {
        0 => match op & 0xF {
            0x0 => Lds { rd: reg, k: w1 },
            0x1 => Ld { rd: reg, ptr: Pointer::Z, mode: AddrMode::PostInc },
            0x2 => Ld { rd: reg, ptr: Pointer::Z, mode: AddrMode::PreDec },
            0x4 => Lpm { rd: reg, post_inc: false },
            0x5 => Lpm { rd: reg, post_inc: true },
            0x6 => Elpm { rd: reg, post_inc: false },
            0x7 => Elpm { rd: reg, post_inc: true },
            0x9 => Ld { rd: reg, ptr: Pointer::Y, mode: AddrMode::PostInc },
            0xA => Ld { rd: reg, ptr: Pointer::Y, mode: AddrMode::PreDec },
            0xC => Ld { rd: reg, ptr: Pointer::X, mode: AddrMode::Plain },
            0xD => Ld { rd: reg, ptr: Pointer::X, mode: AddrMode::PostInc },
            0xE => Ld { rd: reg, ptr: Pointer::X, mode: AddrMode::PreDec },
            0xF => Pop { rd: reg },
            _ => Unknown(op),
        },
        1 => match op & 0xF {
            0x0 => Sts { k: w1, rr: reg },
            0x1 => St { ptr: Pointer::Z, mode: AddrMode::PostInc, rr: reg },
            0x2 => St { ptr: Pointer::Z, mode: AddrMode::PreDec, rr: reg },
            0x9 => St { ptr: Pointer::Y, mode: AddrMode::PostInc, rr: reg },
            0xA => St { ptr: Pointer::Y, mode: AddrMode::PreDec, rr: reg },
            0xC => St { ptr: Pointer::X, mode: AddrMode::Plain, rr: reg },
            0xD => St { ptr: Pointer::X, mode: AddrMode::PostInc, rr: reg },
            0xE => St { ptr: Pointer::X, mode: AddrMode::PreDec, rr: reg },
            0xF => Push { rr: reg },
            _ => Unknown(op),
        },
        2 => decode_one_operand(op, w1),
        3 => {
            let rd = 24 + ((op >> 3) & 0x6) as u8;
            let k = (((op >> 2) & 0x30) | (op & 0x0F)) as u8;
            if op & 0x0100 == 0 {
                Adiw { rd, k }
            } else {
                Sbiw { rd, k }
            }
        }
        4 | 5 => {
            let a = ((op >> 3) & 0x1F) as u8;
            let b = (op & 0x7) as u8;
            match (op >> 8) & 0x3 {
                0 => Cbi { a, b },
                1 => Sbic { a, b },
                2 => Sbi { a, b },
                _ => Sbis { a, b },
            }
        }
        _ => Mul { rd: reg, rr: r5(op) },
    }
}

fn decode_one_operand(op: u16, w1: u16) -> Instruction {
    use Instruction::*;

    let rd = d5(op);
    match op & 0xF {
        0x0 => Com { rd },
        0x1 => Neg { rd },
        0x2 => Swap { rd },
        0x3 => Inc { rd },
        0x5 => Asr { rd },
        0x6 => Lsr { rd },
        0x7 => Ror { rd },
        0xA => Dec { rd },
        0xC | 0xD => Jmp {
            k: absolute_target(op, w1),
        },
        0xE | 0xF => Call {
            k: absolute_target(op, w1),
        },
        0x8 => match op {
            0x9508 => Ret,
            0x9518 => Reti,
            0x9588 => Sleep,
            0x9598 => Break,
            0x95A8 => Wdr,
            0x95C8 => Lpm { rd: 0, post_inc: false },
            0x95D8 => Elpm { rd: 0, post_inc: false },
            0x95E8 => Spm { post_inc: false },
            0x95F8 => Spm { post_inc: true },
            _ if op & 0xFF0F == 0x9408 => {
                let s = ((op >> 4) & 0x7) as u8;
                if op & 0x0080 == 0 {
                    Bset { s }
                } else {
                    Bclr { s }
                }
            }
            _ => Unknown(op),
        },
        0x9 => match op {
            0x9409 => Ijmp,
            0x9419 => Eijmp,
            0x9509 => Icall,
            0x9519 => Eicall,
            _ => Unknown(op),
        },
        _ => Unknown(op),
    }
}

fn absolute_target(op: u16, w1: u16) -> u32 {
    (((op as u32) & 0x01F0) << 13) | (((op as u32) & 0x1) << 16) | w1 as u32
}

const SET_FLAG: [&str; 8] = ["sec", "sez", "sen", "sev", "ses", "seh", "set", "sei"];
const CLEAR_FLAG: [&str; 8] = ["clc", "clz", "cln", "clv", "cls", "clh", "clt", "cli"];
const BRANCH_SET: [&str; 8] = ["brcs", "breq", "brmi", "brvs", "brlt", "brhs", "brts", "brie"];
const BRANCH_CLEAR: [&str; 8] = ["brcc", "brne", "brpl", "brvc", "brge", "brhc", "brtc", "brid"];

impl fmt::Display for Pointer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Pointer::X => write!(f, "X"),
            Pointer::Y => write!(f, "Y"),
            Pointer::Z => write!(f, "Z"),
        }
    }
}

struct Indirect(Pointer, AddrMode);

impl fmt::Display for Indirect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.1 {
            AddrMode::Plain => write!(f, "{}", self.0),
            AddrMode::PostInc => write!(f, "{}+", self.0),
            AddrMode::PreDec => write!(f, "-{}", self.0),
        }
    }
}

/// Relative jump operand in bytes, `.+N` / `.-N` like avr-objdump.
struct Rel(i32);

impl fmt::Display for Rel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let bytes = self.0 * 2;
        if bytes < 0 {
            write!(f, ".-{}", -bytes)
        } else {
            write!(f, ".+{}", bytes)
        }
    }
}

impl fmt::Display for Instruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        use Instruction::*;

        match *self {
            Nop => write!(f, "nop"),
            Movw { rd, rr } => write!(f, "movw\tr{}, r{}", rd, rr),
            Muls { rd, rr } => write!(f, "muls\tr{}, r{}", rd, rr),
            Mulsu { rd, rr } => write!(f, "mulsu\tr{}, r{}", rd, rr),
            Fmul { rd, rr } => write!(f, "fmul\tr{}, r{}", rd, rr),
            Fmuls { rd, rr } => write!(f, "fmuls\tr{}, r{}", rd, rr),
            Fmulsu { rd, rr } => write!(f, "fmulsu\tr{}, r{}", rd, rr),
            Cpc { rd, rr } => write!(f, "cpc\tr{}, r{}", rd, rr),
            Sbc { rd, rr } => write!(f, "sbc\tr{}, r{}", rd, rr),
            Add { rd, rr } if rd == rr => write!(f, "lsl\tr{}", rd),
            Add { rd, rr } => write!(f, "add\tr{}, r{}", rd, rr),
            Cpse { rd, rr } => write!(f, "cpse\tr{}, r{}", rd, rr),
            Cp { rd, rr } => write!(f, "cp\tr{}, r{}", rd, rr),
            Sub { rd, rr } => write!(f, "sub\tr{}, r{}", rd, rr),
            Adc { rd, rr } if rd == rr => write!(f, "rol\tr{}", rd),
            Adc { rd, rr } => write!(f, "adc\tr{}, r{}", rd, rr),
            And { rd, rr } if rd == rr => write!(f, "tst\tr{}", rd),
            And { rd, rr } => write!(f, "and\tr{}, r{}", rd, rr),
            Eor { rd, rr } if rd == rr => write!(f, "clr\tr{}", rd),
            Eor { rd, rr } => write!(f, "eor\tr{}, r{}", rd, rr),
            Or { rd, rr } => write!(f, "or\tr{}, r{}", rd, rr),
            Mov { rd, rr } => write!(f, "mov\tr{}, r{}", rd, rr),
            Mul { rd, rr } => write!(f, "mul\tr{}, r{}", rd, rr),
            Cpi { rd, k } => write!(f, "cpi\tr{}, 0x{:02X}", rd, k),
            Sbci { rd, k } => write!(f, "sbci\tr{}, 0x{:02X}", rd, k),
            Subi { rd, k } => write!(f, "subi\tr{}, 0x{:02X}", rd, k),
            Ori { rd, k } => write!(f, "ori\tr{}, 0x{:02X}", rd, k),
            Andi { rd, k } => write!(f, "andi\tr{}, 0x{:02X}", rd, k),
            Ldi { rd, k } => write!(f, "ldi\tr{}, 0x{:02X}", rd, k),
            Ldd { rd, ptr, q } => write!(f, "ldd\tr{}, {}+{}", rd, ptr, q),
            Std { ptr, q, rr } => write!(f, "std\t{}+{}, r{}", ptr, q, rr),
            Lds { rd, k } => write!(f, "lds\tr{}, 0x{:04X}", rd, k),
            Sts { k, rr } => write!(f, "sts\t0x{:04X}, r{}", k, rr),
            Ld { rd, ptr, mode } => write!(f, "ld\tr{}, {}", rd, Indirect(ptr, mode)),
            St { ptr, mode, rr } => write!(f, "st\t{}, r{}", Indirect(ptr, mode), rr),
            Lpm { rd, post_inc } => {
                write!(f, "lpm\tr{}, Z{}", rd, if post_inc { "+" } else { "" })
            }
            Elpm { rd, post_inc } => {
                write!(f, "elpm\tr{}, Z{}", rd, if post_inc { "+" } else { "" })
            }
            Spm { post_inc: false } => write!(f, "spm"),
            Spm { post_inc: true } => write!(f, "spm\tZ+"),
            Push { rr } => write!(f, "push\tr{}", rr),
            Pop { rd } => write!(f, "pop\tr{}", rd),
            Com { rd } => write!(f, "com\tr{}", rd),
            Neg { rd } => write!(f, "neg\tr{}", rd),
            Swap { rd } => write!(f, "swap\tr{}", rd),
            Inc { rd } => write!(f, "inc\tr{}", rd),
            Asr { rd } => write!(f, "asr\tr{}", rd),
            Lsr { rd } => write!(f, "lsr\tr{}", rd),
            Ror { rd } => write!(f, "ror\tr{}", rd),
            Dec { rd } => write!(f, "dec\tr{}", rd),
            Bset { s } => write!(f, "{}", SET_FLAG[s as usize & 7]),
            Bclr { s } => write!(f, "{}", CLEAR_FLAG[s as usize & 7]),
            Ijmp => write!(f, "ijmp"),
            Eijmp => write!(f, "eijmp"),
            Icall => write!(f, "icall"),
            Eicall => write!(f, "eicall"),
            Ret => write!(f, "ret"),
            Reti => write!(f, "reti"),
            Sleep => write!(f, "sleep"),
            Break => write!(f, "break"),
            Wdr => write!(f, "wdr"),
            Jmp { k } => write!(f, "jmp\t0x{:x}", k * 2),
            Call { k } => write!(f, "call\t0x{:x}", k * 2),
            Adiw { rd, k } => write!(f, "adiw\tr{}, 0x{:02X}", rd, k),
            Sbiw { rd, k } => write!(f, "sbiw\tr{}, 0x{:02X}", rd, k),
            Cbi { a, b } => write!(f, "cbi\t0x{:02X}, {}", a, b),
            Sbic { a, b } => write!(f, "sbic\t0x{:02X}, {}", a, b),
            Sbi { a, b } => write!(f, "sbi\t0x{:02X}, {}", a, b),
            Sbis { a, b } => write!(f, "sbis\t0x{:02X}, {}", a, b),
            In { rd, a } => write!(f, "in\tr{}, 0x{:02X}", rd, a),
            Out { a, rr } => write!(f, "out\t0x{:02X}, r{}", a, rr),
            Rjmp { k } => write!(f, "rjmp\t{}", Rel(k as i32)),
            Rcall { k } => write!(f, "rcall\t{}", Rel(k as i32)),
            Brbs { s, k } => write!(f, "{}\t{}", BRANCH_SET[s as usize & 7], Rel(k as i32)),
            Brbc { s, k } => write!(f, "{}\t{}", BRANCH_CLEAR[s as usize & 7], Rel(k as i32)),
            Bld { rd, b } => write!(f, "bld\tr{}, {}", rd, b),
            Bst { rd, b } => write!(f, "bst\tr{}, {}", rd, b),
            Sbrc { rr, b } => write!(f, "sbrc\tr{}, {}", rr, b),
            Sbrs { rr, b } => write!(f, "sbrs\tr{}, {}", rr, b),
            Unknown(op) => write!(f, ".word\t0x{:04x}", op),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_ldi() {
        // ldi r24, 0x2A
        assert_eq!(decode(0xE28A, 0), Instruction::Ldi { rd: 24, k: 0x2A });
    }

    #[test]
    fn test_decode_register_pairs() {
        assert_eq!(decode(0x0000, 0), Instruction::Nop);
        // add r1, r31
        assert_eq!(decode(0x0E1F, 0), Instruction::Add { rd: 1, rr: 31 });
        // movw r24, r30
        assert_eq!(decode(0x01CF, 0), Instruction::Movw { rd: 24, rr: 30 });
        // mul r2, r3
        assert_eq!(decode(0x9C23, 0), Instruction::Mul { rd: 2, rr: 3 });
        // fmulsu r23, r16
        assert_eq!(decode(0x03F8, 0), Instruction::Fmulsu { rd: 23, rr: 16 });
    }

    #[test]
    fn test_decode_relative_flow() {
        // rjmp .-2 (self loop)
        assert_eq!(decode(0xCFFF, 0), Instruction::Rjmp { k: -1 });
        // rcall .+4
        assert_eq!(decode(0xD002, 0), Instruction::Rcall { k: 2 });
        // brne .-6
        assert_eq!(decode(0xF7E9, 0), Instruction::Brbc { s: 1, k: -3 });
        // breq .+2
        assert_eq!(decode(0xF009, 0), Instruction::Brbs { s: 1, k: 1 });
    }

    #[test]
    fn test_decode_two_word() {
        // lds r25, 0x08A1
        assert!(Instruction::is_two_word(0x9190));
        assert_eq!(decode(0x9190, 0x08A1), Instruction::Lds { rd: 25, k: 0x08A1 });
        // sts 0x08A0, r24
        assert_eq!(decode(0x9380, 0x08A0), Instruction::Sts { k: 0x08A0, rr: 24 });
        // jmp 0x1FFFE (word 0xFFFF)
        assert_eq!(decode(0x940C, 0xFFFF), Instruction::Jmp { k: 0xFFFF });
        // call with bit 16 set
        assert_eq!(decode(0x940F, 0x0010), Instruction::Call { k: 0x10010 });
        assert_eq!(decode(0x940F, 0).size(), 2);
        assert!(!Instruction::is_two_word(0x9508));
    }

    #[test]
    fn test_decode_indirect() {
        // ld r24, X+
        assert_eq!(
            decode(0x918D, 0),
            Instruction::Ld { rd: 24, ptr: Pointer::X, mode: AddrMode::PostInc }
        );
        // st -Y, r0
        assert_eq!(
            decode(0x920A, 0),
            Instruction::St { ptr: Pointer::Y, mode: AddrMode::PreDec, rr: 0 }
        );
        // ld r16, Z (ldd with q = 0)
        assert_eq!(
            decode(0x8100, 0),
            Instruction::Ld { rd: 16, ptr: Pointer::Z, mode: AddrMode::Plain }
        );
        // ldd r24, Y+63
        assert_eq!(
            decode(0xAD8F, 0),
            Instruction::Ldd { rd: 24, ptr: Pointer::Y, q: 63 }
        );
        // std Z+5, r1
        assert_eq!(
            decode(0x8215, 0),
            Instruction::Std { ptr: Pointer::Z, q: 5, rr: 1 }
        );
        // lpm r24, Z+
        assert_eq!(decode(0x9185, 0), Instruction::Lpm { rd: 24, post_inc: true });
    }

    #[test]
    fn test_decode_system_and_flags() {
        assert_eq!(decode(0x9598, 0), Instruction::Break);
        assert_eq!(decode(0x9588, 0), Instruction::Sleep);
        assert_eq!(decode(0x9518, 0), Instruction::Reti);
        assert_eq!(decode(0x9478, 0), Instruction::Bset { s: 7 });
        assert_eq!(decode(0x94F8, 0), Instruction::Bclr { s: 7 });
        // adiw r30, 1 / sbiw r24, 63
        assert_eq!(decode(0x9631, 0), Instruction::Adiw { rd: 30, k: 1 });
        assert_eq!(decode(0x97CF, 0), Instruction::Sbiw { rd: 24, k: 63 });
        // out 0x3F, r0 / in r24, 0x3D
        assert_eq!(decode(0xBE0F, 0), Instruction::Out { a: 0x3F, rr: 0 });
        assert_eq!(decode(0xB78D, 0), Instruction::In { rd: 24, a: 0x3D });
        // sbrs r25, 5
        assert_eq!(decode(0xFF95, 0), Instruction::Sbrs { rr: 25, b: 5 });
    }

    #[test]
    fn test_unassigned_opcodes_are_unknown() {
        assert_eq!(decode(0xFFFF, 0), Instruction::Unknown(0xFFFF));
        assert_eq!(decode(0x9003, 0), Instruction::Unknown(0x9003));
        assert_eq!(decode(0x0001, 0), Instruction::Unknown(0x0001));
    }

    #[test]
    fn test_display_matches_objdump() {
        assert_eq!(decode(0xE28A, 0).to_string(), "ldi\tr24, 0x2A");
        assert_eq!(decode(0xCFFE, 0).to_string(), "rjmp\t.-4");
        assert_eq!(decode(0xF7E9, 0).to_string(), "brne\t.-6");
        assert_eq!(decode(0x2411, 0).to_string(), "clr\tr1");
        assert_eq!(decode(0x9478, 0).to_string(), "sei");
        assert_eq!(decode(0x918D, 0).to_string(), "ld\tr24, X+");
        assert_eq!(decode(0x9190, 0x08A1).to_string(), "lds\tr25, 0x08A1");
    }

    #[test]
    fn test_every_opcode_reencodes() {
        const NEXT: u16 = 0x1234;
        for w0 in 0..=0xFFFFu16 {
            let instr = decode(w0, NEXT);
            if matches!(instr, Instruction::Unknown(_)) {
                continue;
            }
            let words = instr
                .encode()
                .unwrap_or_else(|e| panic!("{:04x} -> {:?}: {}", w0, instr, e));
            let expected = match w0 {
                // implicit r0 forms of lpm/elpm
                0x95C8 => vec![0x9004],
                0x95D8 => vec![0x9006],
                _ if Instruction::is_two_word(w0) => vec![w0, NEXT],
                _ => vec![w0],
            };
            assert_eq!(words, expected, "{:04x} -> {:?}", w0, instr);
            assert_eq!(instr.size() as usize, words.len(), "{:04x}", w0);
        }
    }
}
