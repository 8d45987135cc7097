//! avr-gdb register layout: r0..r31, SREG, SP (2 bytes), PC (4 bytes,
//! byte address). Memory uses the unified map with SRAM at 0x800000.

use core::num::NonZeroUsize;
use gdbstub::arch::{Arch, RegId, Registers};

/// Size of the `g` packet payload.
pub const REGISTERS_LEN: usize = 32 + 1 + 2 + 4;

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct AvrRegs {
    pub r: [u8; 32],
    pub sreg: u8,
    pub sp: u16,
    pub pc: u32,
}

impl Registers for AvrRegs {
    type ProgramCounter = u32;

    fn pc(&self) -> Self::ProgramCounter {
        self.pc
    }

    fn gdb_serialize(&self, mut write_byte: impl FnMut(Option<u8>)) {
        for byte in self.r {
            write_byte(Some(byte));
        }
        write_byte(Some(self.sreg));
        for byte in self.sp.to_le_bytes() {
            write_byte(Some(byte));
        }
        for byte in self.pc.to_le_bytes() {
            write_byte(Some(byte));
        }
    }

    fn gdb_deserialize(&mut self, bytes: &[u8]) -> Result<(), ()> {
        if bytes.len() < REGISTERS_LEN {
            return Err(());
        }
        self.r.copy_from_slice(&bytes[..32]);
        self.sreg = bytes[32];
        self.sp = u16::from_le_bytes([bytes[33], bytes[34]]);
        self.pc = u32::from_le_bytes([bytes[35], bytes[36], bytes[37], bytes[38]]);
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AvrRegId {
    Gpr(u8),
    Sreg,
    Sp,
    Pc,
}

impl RegId for AvrRegId {
    fn from_raw_id(id: usize) -> Option<(Self, Option<NonZeroUsize>)> {
        let (reg, size) = match id {
            0..=31 => (AvrRegId::Gpr(id as u8), 1),
            32 => (AvrRegId::Sreg, 1),
            33 => (AvrRegId::Sp, 2),
            34 => (AvrRegId::Pc, 4),
            _ => return None,
        };
        Some((reg, NonZeroUsize::new(size)))
    }
}

pub enum Avr {}

impl Arch for Avr {
    type Usize = u32;
    type Registers = AvrRegs;
    type RegId = AvrRegId;
    type BreakpointKind = usize;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_packet_layout() {
        let mut regs = AvrRegs::default();
        regs.r[31] = 0xAB;
        regs.sreg = 0x80;
        regs.sp = 0x3FFD;
        regs.pc = 0x1_0002;

        let mut bytes = Vec::new();
        regs.gdb_serialize(|b| bytes.push(b.unwrap()));
        assert_eq!(bytes.len(), REGISTERS_LEN);
        assert_eq!(&bytes[31..], &[0xAB, 0x80, 0xFD, 0x3F, 0x02, 0x00, 0x01, 0x00]);

        let mut back = AvrRegs::default();
        back.gdb_deserialize(&bytes).unwrap();
        assert_eq!(back, regs);
        assert!(back.gdb_deserialize(&bytes[..10]).is_err());
    }

    #[test]
    fn test_register_ids() {
        assert!(matches!(AvrRegId::from_raw_id(5), Some((AvrRegId::Gpr(5), _))));
        assert!(matches!(AvrRegId::from_raw_id(34), Some((AvrRegId::Pc, Some(n))) if n.get() == 4));
        assert!(AvrRegId::from_raw_id(35).is_none());
    }
}
