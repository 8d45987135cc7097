use crate::SimResult;
use std::any::Any;

pub const DIR: u32 = 0x00;
pub const DIRSET: u32 = 0x01;
pub const DIRCLR: u32 = 0x02;
pub const DIRTGL: u32 = 0x03;
pub const OUT: u32 = 0x04;
pub const OUTSET: u32 = 0x05;
pub const OUTCLR: u32 = 0x06;
pub const OUTTGL: u32 = 0x07;
pub const IN: u32 = 0x08;
pub const INTCTRL: u32 = 0x09;
pub const INTFLAGS: u32 = 0x0C;

pub const REGISTER_BLOCK_SIZE: u32 = 0x20;

/// XMEGA I/O port (PORTA..PORTE).
#[derive(Debug, Default)]
pub struct GpioPort {
    dir: u8,  // 0x00: data direction, 1 = output
    out: u8,  // 0x04: output value
    ext: u8,  // levels driven onto input pins by the host
    intctrl: u8,
    int0mask: u8,
    int1mask: u8,
    intflags: u8,
    pinctrl: [u8; 8],
}

impl GpioPort {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drive an input pin from outside the chip.
    pub fn set_input(&mut self, pin: u8, high: bool) {
        if high {
            self.ext |= 1 << pin;
        } else {
            self.ext &= !(1 << pin);
        }
    }

    /// Pin levels: OUT on output pins, the external level on input pins.
    pub fn pins(&self) -> u8 {
        (self.out & self.dir) | (self.ext & !self.dir)
    }

    pub fn direction(&self) -> u8 {
        self.dir
    }

    pub fn output(&self) -> u8 {
        self.out
    }
}

impl crate::Peripheral for GpioPort {
    fn read(&mut self, offset: u32) -> SimResult<u8> {
        self.peek(offset)
    }

    fn peek(&self, offset: u32) -> SimResult<u8> {
        Ok(match offset {
            DIR | DIRSET | DIRCLR | DIRTGL => self.dir,
            OUT | OUTSET | OUTCLR | OUTTGL => self.out,
            IN => self.pins(),
            INTCTRL => self.intctrl,
            0x0A => self.int0mask,
            0x0B => self.int1mask,
            INTFLAGS => self.intflags,
            0x10..=0x17 => self.pinctrl[(offset - 0x10) as usize],
            _ => 0,
        })
    }

    fn write(&mut self, offset: u32, value: u8) -> SimResult<()> {
        match offset {
            DIR => self.dir = value,
            DIRSET => self.dir |= value,
            DIRCLR => self.dir &= !value,
            DIRTGL => self.dir ^= value,
            OUT => self.out = value,
            OUTSET => self.out |= value,
            OUTCLR => self.out &= !value,
            OUTTGL => self.out ^= value,
            INTCTRL => self.intctrl = value,
            0x0A => self.int0mask = value,
            0x0B => self.int1mask = value,
            // write one to clear
            INTFLAGS => self.intflags &= !value,
            0x10..=0x17 => self.pinctrl[(offset - 0x10) as usize] = value,
            _ => {}
        }
        tracing::debug!("PORT write {:#04x} -> +{:#x}, pins {:#010b}", value, offset, self.pins());
        Ok(())
    }

    fn snapshot(&self) -> serde_json::Value {
        serde_json::json!({
            "dir": self.dir,
            "out": self.out,
            "in": self.pins(),
        })
    }

    fn as_any(&self) -> Option<&dyn Any> {
        Some(self)
    }

    fn as_any_mut(&mut self) -> Option<&mut dyn Any> {
        Some(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Peripheral;

    #[test]
    fn test_set_clear_toggle() {
        let mut port = GpioPort::new();
        port.write(DIRSET, 0x0F).unwrap();
        port.write(OUTSET, 0x05).unwrap();
        port.write(OUTTGL, 0x03).unwrap();
        assert_eq!(port.peek(OUT).unwrap(), 0x06);
        port.write(OUTCLR, 0x02).unwrap();
        assert_eq!(port.output(), 0x04);
        port.write(DIRCLR, 0x01).unwrap();
        assert_eq!(port.direction(), 0x0E);
    }

    #[test]
    fn test_in_mixes_outputs_and_external_levels() {
        let mut port = GpioPort::new();
        port.write(DIR, 0xF0).unwrap();
        port.write(OUT, 0xA0).unwrap();
        port.set_input(0, true);
        port.set_input(7, false);
        assert_eq!(port.read(IN).unwrap(), 0xA1);
    }
}
