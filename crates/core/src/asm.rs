//! A small AVR assembler: instruction encoding plus a label-resolving
//! builder for in-memory firmware images.

use crate::decoder::{AddrMode, Instruction, Pointer};
use crate::memory::ProgramImage;
use std::collections::{BTreeMap, HashMap};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AsmError {
    #[error("operand out of range: {0}")]
    OperandOutOfRange(String),
    #[error("undefined label '{0}'")]
    UndefinedLabel(String),
    #[error("label '{0}' defined twice")]
    DuplicateLabel(String),
    #[error("target '{label}' out of range ({offset} words)")]
    TargetOutOfRange { label: String, offset: i64 },
    #[error("origin {origin:#x} is behind the current address {here:#x}")]
    OriginBehind { origin: u32, here: u32 },
}

fn check(ok: bool, instruction: &Instruction) -> Result<(), AsmError> {
    if ok {
        Ok(())
    } else {
        Err(AsmError::OperandOutOfRange(format!("{:?}", instruction)))
    }
}

fn two_reg(base: u16, rd: u8, rr: u8) -> u16 {
    let (rd, rr) = (rd as u16, rr as u16);
    base | ((rr & 0x10) << 5) | ((rd & 0x1F) << 4) | (rr & 0x0F)
}

fn imm(base: u16, rd: u8, k: u8) -> u16 {
    let (rd, k) = (rd as u16, k as u16);
    base | ((k & 0xF0) << 4) | ((rd - 16) << 4) | (k & 0x0F)
}

fn indirect_nibble(ptr: Pointer, mode: AddrMode) -> Option<u16> {
    match (ptr, mode) {
        (Pointer::Z, AddrMode::PostInc) => Some(0x1),
        (Pointer::Z, AddrMode::PreDec) => Some(0x2),
        (Pointer::Y, AddrMode::PostInc) => Some(0x9),
        (Pointer::Y, AddrMode::PreDec) => Some(0xA),
        (Pointer::X, AddrMode::Plain) => Some(0xC),
        (Pointer::X, AddrMode::PostInc) => Some(0xD),
        (Pointer::X, AddrMode::PreDec) => Some(0xE),
        // Y and Z without update use the displacement form
        _ => None,
    }
}

fn displacement(base: u16, ptr: Pointer, q: u8, reg: u8) -> u16 {
    let q = q as u16;
    let y = if ptr == Pointer::Y { 0x0008 } else { 0 };
    base | ((q & 0x20) << 8) | ((q & 0x18) << 7) | (q & 0x07) | y | ((reg as u16) << 4)
}

fn absolute(base: u16, k: u32) -> [u16; 2] {
    [
        base | ((k >> 13) & 0x01F0) as u16 | ((k >> 16) & 0x1) as u16,
        k as u16,
    ]
}

impl Instruction {
    /// Encode into one or two opcode words, validating operand ranges.
    pub fn encode(&self) -> Result<Vec<u16>, AsmError> {
        use Instruction::*;

        let reg = |r: u8| r <= 31;
        let high = |r: u8| (16..=31).contains(&r);
        let mid = |r: u8| (16..=23).contains(&r);

        let word = match *self {
            Nop => 0x0000,
            Movw { rd, rr } => {
                check(reg(rd) && reg(rr) && rd % 2 == 0 && rr % 2 == 0, self)?;
                0x0100 | ((rd as u16 / 2) << 4) | (rr as u16 / 2)
            }
            Muls { rd, rr } => {
                check(high(rd) && high(rr), self)?;
                0x0200 | ((rd as u16 - 16) << 4) | (rr as u16 - 16)
            }
            Mulsu { rd, rr } | Fmul { rd, rr } | Fmuls { rd, rr } | Fmulsu { rd, rr } => {
                check(mid(rd) && mid(rr), self)?;
                let base = match self {
                    Mulsu { .. } => 0x0300,
                    Fmul { .. } => 0x0308,
                    Fmuls { .. } => 0x0380,
                    _ => 0x0388,
                };
                base | ((rd as u16 - 16) << 4) | (rr as u16 - 16)
            }
            Cpc { rd, rr }
            | Sbc { rd, rr }
            | Add { rd, rr }
            | Cpse { rd, rr }
            | Cp { rd, rr }
            | Sub { rd, rr }
            | Adc { rd, rr }
            | And { rd, rr }
            | Eor { rd, rr }
            | Or { rd, rr }
            | Mov { rd, rr }
            | Mul { rd, rr } => {
                check(reg(rd) && reg(rr), self)?;
                let base = match self {
                    Cpc { .. } => 0x0400,
                    Sbc { .. } => 0x0800,
                    Add { .. } => 0x0C00,
                    Cpse { .. } => 0x1000,
                    Cp { .. } => 0x1400,
                    Sub { .. } => 0x1800,
                    Adc { .. } => 0x1C00,
                    And { .. } => 0x2000,
                    Eor { .. } => 0x2400,
                    Or { .. } => 0x2800,
                    Mov { .. } => 0x2C00,
                    _ => 0x9C00,
                };
                two_reg(base, rd, rr)
            }
            Cpi { rd, k } | Sbci { rd, k } | Subi { rd, k } | Ori { rd, k } | Andi { rd, k }
            | Ldi { rd, k } => {
                check(high(rd), self)?;
                let base = match self {
                    Cpi { .. } => 0x3000,
                    Sbci { .. } => 0x4000,
                    Subi { .. } => 0x5000,
                    Ori { .. } => 0x6000,
                    Andi { .. } => 0x7000,
                    _ => 0xE000,
                };
                imm(base, rd, k)
            }
            Ldd { rd, ptr, q } => {
                check(reg(rd) && ptr != Pointer::X && q <= 63, self)?;
                displacement(0x8000, ptr, q, rd)
            }
            Std { ptr, q, rr } => {
                check(reg(rr) && ptr != Pointer::X && q <= 63, self)?;
                displacement(0x8200, ptr, q, rr)
            }
            Lds { rd, k } => {
                check(reg(rd), self)?;
                return Ok(vec![0x9000 | ((rd as u16) << 4), k]);
            }
            Sts { k, rr } => {
                check(reg(rr), self)?;
                return Ok(vec![0x9200 | ((rr as u16) << 4), k]);
            }
            Ld { rd, ptr, mode } => {
                check(reg(rd), self)?;
                match indirect_nibble(ptr, mode) {
                    Some(n) => 0x9000 | ((rd as u16) << 4) | n,
                    None => displacement(0x8000, ptr, 0, rd),
                }
            }
            St { ptr, mode, rr } => {
                check(reg(rr), self)?;
                match indirect_nibble(ptr, mode) {
                    Some(n) => 0x9200 | ((rr as u16) << 4) | n,
                    None => displacement(0x8200, ptr, 0, rr),
                }
            }
            Lpm { rd, post_inc } => {
                check(reg(rd), self)?;
                0x9004 | ((rd as u16) << 4) | post_inc as u16
            }
            Elpm { rd, post_inc } => {
                check(reg(rd), self)?;
                0x9006 | ((rd as u16) << 4) | post_inc as u16
            }
            Spm { post_inc } => 0x95E8 | ((post_inc as u16) << 4),
            Push { rr } => {
                check(reg(rr), self)?;
                0x920F | ((rr as u16) << 4)
            }
            Pop { rd } => {
                check(reg(rd), self)?;
                0x900F | ((rd as u16) << 4)
            }
            Com { rd } | Neg { rd } | Swap { rd } | Inc { rd } | Asr { rd } | Lsr { rd }
            | Ror { rd } | Dec { rd } => {
                check(reg(rd), self)?;
                let n = match self {
                    Com { .. } => 0x0,
                    Neg { .. } => 0x1,
                    Swap { .. } => 0x2,
                    Inc { .. } => 0x3,
                    Asr { .. } => 0x5,
                    Lsr { .. } => 0x6,
                    Ror { .. } => 0x7,
                    _ => 0xA,
                };
                0x9400 | ((rd as u16) << 4) | n
            }
            Bset { s } => {
                check(s <= 7, self)?;
                0x9408 | ((s as u16) << 4)
            }
            Bclr { s } => {
                check(s <= 7, self)?;
                0x9488 | ((s as u16) << 4)
            }
            Ijmp => 0x9409,
            Eijmp => 0x9419,
            Icall => 0x9509,
            Eicall => 0x9519,
            Ret => 0x9508,
            Reti => 0x9518,
            Sleep => 0x9588,
            Break => 0x9598,
            Wdr => 0x95A8,
            Jmp { k } => {
                check(k < 1 << 22, self)?;
                return Ok(absolute(0x940C, k).to_vec());
            }
            Call { k } => {
                check(k < 1 << 22, self)?;
                return Ok(absolute(0x940E, k).to_vec());
            }
            Adiw { rd, k } | Sbiw { rd, k } => {
                check(matches!(rd, 24 | 26 | 28 | 30) && k <= 63, self)?;
                let base = if matches!(self, Adiw { .. }) { 0x9600 } else { 0x9700 };
                let k = k as u16;
                base | ((k & 0x30) << 2) | (((rd as u16 - 24) / 2) << 4) | (k & 0x0F)
            }
            Cbi { a, b } | Sbic { a, b } | Sbi { a, b } | Sbis { a, b } => {
                check(a <= 31 && b <= 7, self)?;
                let base = match self {
                    Cbi { .. } => 0x9800,
                    Sbic { .. } => 0x9900,
                    Sbi { .. } => 0x9A00,
                    _ => 0x9B00,
                };
                base | ((a as u16) << 3) | b as u16
            }
            In { rd, a } => {
                check(reg(rd) && a <= 63, self)?;
                let a = a as u16;
                0xB000 | ((a & 0x30) << 5) | ((rd as u16) << 4) | (a & 0x0F)
            }
            Out { a, rr } => {
                check(reg(rr) && a <= 63, self)?;
                let a = a as u16;
                0xB800 | ((a & 0x30) << 5) | ((rr as u16) << 4) | (a & 0x0F)
            }
            Rjmp { k } | Rcall { k } => {
                check((-2048..=2047).contains(&k), self)?;
                let base = if matches!(self, Rjmp { .. }) { 0xC000 } else { 0xD000 };
                base | (k as u16 & 0x0FFF)
            }
            Brbs { s, k } | Brbc { s, k } => {
                check(s <= 7 && (-64..=63).contains(&k), self)?;
                let base = if matches!(self, Brbs { .. }) { 0xF000 } else { 0xF400 };
                base | (((k as u16) & 0x7F) << 3) | s as u16
            }
            Bld { rd, b } | Bst { rd, b } | Sbrc { rr: rd, b } | Sbrs { rr: rd, b } => {
                check(reg(rd) && b <= 7, self)?;
                let base = match self {
                    Bld { .. } => 0xF800,
                    Bst { .. } => 0xFA00,
                    Sbrc { .. } => 0xFC00,
                    _ => 0xFE00,
                };
                base | ((rd as u16) << 4) | b as u16
            }
            Unknown(op) => op,
        };

        Ok(vec![word])
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FixupKind {
    /// rjmp / rcall
    Relative12,
    /// brbs / brbc
    Branch7,
    /// jmp / call
    Absolute22,
    /// ldi with the low or high byte of the label's byte address
    Lo8,
    Hi8,
}

#[derive(Debug, Clone)]
struct Fixup {
    at: usize,
    label: String,
    kind: FixupKind,
}

/// Assembled program memory with its symbol table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Program {
    pub bytes: Vec<u8>,
    /// Label byte addresses.
    pub labels: BTreeMap<String, u32>,
}

impl Program {
    pub fn label(&self, name: &str) -> Option<u32> {
        self.labels.get(name).copied()
    }

    pub fn into_image(self) -> ProgramImage {
        ProgramImage::from_flash_bytes(self.bytes)
    }
}

/// Builder for a flash image.
///
/// Errors are deferred: the first one is kept and reported by
/// [`Assembler::finish`], so programs can be written as one chain.
#[derive(Debug, Default)]
pub struct Assembler {
    words: Vec<u16>,
    labels: HashMap<String, u32>,
    fixups: Vec<Fixup>,
    error: Option<AsmError>,
}

impl Assembler {
    pub fn new() -> Self {
        Self::default()
    }

    fn fail(&mut self, err: AsmError) {
        if self.error.is_none() {
            self.error = Some(err);
        }
    }

    /// Current word address.
    pub fn here(&self) -> u32 {
        self.words.len() as u32
    }

    /// Pad with `nop` up to word address `origin`, e.g. an interrupt vector.
    pub fn org(&mut self, origin: u32) -> &mut Self {
        let here = self.here();
        if origin < here {
            self.fail(AsmError::OriginBehind { origin, here });
        } else {
            self.words.resize(origin as usize, 0x0000);
        }
        self
    }

    pub fn label(&mut self, name: &str) -> &mut Self {
        if self.labels.insert(name.to_string(), self.here()).is_some() {
            self.fail(AsmError::DuplicateLabel(name.to_string()));
        }
        self
    }

    pub fn emit(&mut self, instruction: Instruction) -> &mut Self {
        match instruction.encode() {
            Ok(words) => self.words.extend(words),
            Err(err) => self.fail(err),
        }
        self
    }

    fn emit_fixup(&mut self, instruction: Instruction, label: &str, kind: FixupKind) -> &mut Self {
        self.fixups.push(Fixup {
            at: self.words.len(),
            label: label.to_string(),
            kind,
        });
        self.emit(instruction)
    }

    pub fn rjmp(&mut self, label: &str) -> &mut Self {
        self.emit_fixup(Instruction::Rjmp { k: 0 }, label, FixupKind::Relative12)
    }

    pub fn rcall(&mut self, label: &str) -> &mut Self {
        self.emit_fixup(Instruction::Rcall { k: 0 }, label, FixupKind::Relative12)
    }

    pub fn jmp(&mut self, label: &str) -> &mut Self {
        self.emit_fixup(Instruction::Jmp { k: 0 }, label, FixupKind::Absolute22)
    }

    pub fn call(&mut self, label: &str) -> &mut Self {
        self.emit_fixup(Instruction::Call { k: 0 }, label, FixupKind::Absolute22)
    }

    /// Branch if SREG bit `s` is set.
    pub fn brbs(&mut self, s: u8, label: &str) -> &mut Self {
        self.emit_fixup(Instruction::Brbs { s, k: 0 }, label, FixupKind::Branch7)
    }

    /// Branch if SREG bit `s` is cleared.
    pub fn brbc(&mut self, s: u8, label: &str) -> &mut Self {
        self.emit_fixup(Instruction::Brbc { s, k: 0 }, label, FixupKind::Branch7)
    }

    pub fn breq(&mut self, label: &str) -> &mut Self {
        self.brbs(1, label)
    }

    pub fn brne(&mut self, label: &str) -> &mut Self {
        self.brbc(1, label)
    }

    /// Branch if lower (unsigned), i.e. carry set.
    pub fn brlo(&mut self, label: &str) -> &mut Self {
        self.brbs(0, label)
    }

    /// Branch if same or higher (unsigned), i.e. carry clear.
    pub fn brsh(&mut self, label: &str) -> &mut Self {
        self.brbc(0, label)
    }

    pub fn brmi(&mut self, label: &str) -> &mut Self {
        self.brbs(2, label)
    }

    pub fn brpl(&mut self, label: &str) -> &mut Self {
        self.brbc(2, label)
    }

    /// `ldi rd, lo8(label)` with the label's byte address.
    pub fn ldi_lo8(&mut self, rd: u8, label: &str) -> &mut Self {
        self.emit_fixup(Instruction::Ldi { rd, k: 0 }, label, FixupKind::Lo8)
    }

    /// `ldi rd, hi8(label)` with the label's byte address.
    pub fn ldi_hi8(&mut self, rd: u8, label: &str) -> &mut Self {
        self.emit_fixup(Instruction::Ldi { rd, k: 0 }, label, FixupKind::Hi8)
    }

    /// Raw bytes, padded with a zero to a whole word.
    pub fn db(&mut self, bytes: &[u8]) -> &mut Self {
        for pair in bytes.chunks(2) {
            let lo = pair[0];
            let hi = pair.get(1).copied().unwrap_or(0);
            self.words.push(u16::from_le_bytes([lo, hi]));
        }
        self
    }

    /// NUL-terminated string.
    pub fn asciz(&mut self, text: &str) -> &mut Self {
        let mut bytes = text.as_bytes().to_vec();
        bytes.push(0);
        self.db(&bytes)
    }

    /// Resolve labels and return the program memory image.
    pub fn finish(&mut self) -> Result<Program, AsmError> {
        if let Some(err) = self.error.take() {
            return Err(err);
        }

        let mut words = self.words.clone();
        for fixup in &self.fixups {
            let target = *self
                .labels
                .get(&fixup.label)
                .ok_or_else(|| AsmError::UndefinedLabel(fixup.label.clone()))?;
            let offset = target as i64 - (fixup.at as i64 + 1);
            let out_of_range = || AsmError::TargetOutOfRange {
                label: fixup.label.clone(),
                offset,
            };

            match fixup.kind {
                FixupKind::Relative12 => {
                    if !(-2048..=2047).contains(&offset) {
                        return Err(out_of_range());
                    }
                    words[fixup.at] |= (offset as u16) & 0x0FFF;
                }
                FixupKind::Branch7 => {
                    if !(-64..=63).contains(&offset) {
                        return Err(out_of_range());
                    }
                    words[fixup.at] |= ((offset as u16) & 0x7F) << 3;
                }
                FixupKind::Absolute22 => {
                    let [w0, w1] = absolute(0, target);
                    words[fixup.at] |= w0;
                    words[fixup.at + 1] = w1;
                }
                FixupKind::Lo8 | FixupKind::Hi8 => {
                    let byte_addr = target * 2;
                    let k = if fixup.kind == FixupKind::Lo8 {
                        byte_addr & 0xFF
                    } else {
                        (byte_addr >> 8) & 0xFF
                    } as u16;
                    words[fixup.at] |= ((k & 0xF0) << 4) | (k & 0x0F);
                }
            }
        }

        let bytes = words.iter().flat_map(|w| w.to_le_bytes()).collect();
        let labels = self
            .labels
            .iter()
            .map(|(name, addr)| (name.clone(), addr * 2))
            .collect();
        Ok(Program { bytes, labels })
    }
}
