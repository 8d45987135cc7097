//! Polled USARTC0 driver shared by the fixtures.
//!
//! Calling convention follows avr-gcc: the byte argument or result is in
//! `r24`, `r25` is scratch, everything else is preserved.

use avrlab_core::asm::Assembler;
use avrlab_core::decoder::Instruction::*;
use avrlab_core::decoder::{AddrMode, Pointer};
use avrlab_core::peripherals::usart;

pub const USARTC0: u16 = 0x08A0;

const fn reg(offset: u32) -> u16 {
    USARTC0 + offset as u16
}

pub const DATA: u16 = reg(usart::DATA);
pub const STATUS: u16 = reg(usart::STATUS);

const RXCIF_BIT: u8 = 7;
const DREIF_BIT: u8 = 5;

/// Register writes performed by `uart_init`.
pub const INIT_SEQUENCE: [(u16, u8); 5] = [
    (reg(usart::BAUDCTRLB), 0x00),
    (reg(usart::BAUDCTRLA), 0x84),
    // RXCINTLVL = HI; never taken, the fixtures leave PMIC and I disabled
    (reg(usart::CTRLA), 0x30),
    (reg(usart::CTRLB), usart::CTRLB_TXEN | usart::CTRLB_RXEN),
    // CHSIZE = 8 bit
    (reg(usart::CTRLC), 0x03),
];

/// Emit the init sequence inline, clobbering `r16`.
pub fn emit_init(asm: &mut Assembler) -> &mut Assembler {
    for (addr, value) in INIT_SEQUENCE {
        asm.emit(Ldi { rd: 16, k: value }).emit(Sts { k: addr, rr: 16 });
    }
    asm
}

/// Emit the `uart_init`, `uart_putc`, `uart_getc`, `uart_puts` (string in
/// flash at Z) and `uart_puts_ram` (string in SRAM at X) subroutines.
pub fn emit_routines(asm: &mut Assembler) -> &mut Assembler {
    asm.label("uart_init");
    emit_init(asm).emit(Ret);

    asm.label("uart_putc")
        .emit(Lds { rd: 25, k: STATUS })
        .emit(Sbrs { rr: 25, b: DREIF_BIT })
        .rjmp("uart_putc")
        .emit(Sts { k: DATA, rr: 24 })
        .emit(Ret);

    asm.label("uart_getc")
        .emit(Lds { rd: 25, k: STATUS })
        .emit(Sbrs { rr: 25, b: RXCIF_BIT })
        .rjmp("uart_getc")
        .emit(Lds { rd: 24, k: DATA })
        .emit(Ret);

    asm.label("uart_puts")
        .emit(Lpm { rd: 24, post_inc: true })
        .emit(And { rd: 24, rr: 24 })
        .breq("uart_puts_end")
        .rcall("uart_putc")
        .rjmp("uart_puts")
        .label("uart_puts_end")
        .emit(Ret);

    asm.label("uart_puts_ram")
        .emit(Ld { rd: 24, ptr: Pointer::X, mode: AddrMode::PostInc })
        .emit(And { rd: 24, rr: 24 })
        .breq("uart_puts_ram_end")
        .rcall("uart_putc")
        .rjmp("uart_puts_ram")
        .label("uart_puts_ram_end")
        .emit(Ret)
}

/// `ldi` a 16-bit value into a register pair.
pub fn load_pair(asm: &mut Assembler, low: u8, value: u16) -> &mut Assembler {
    asm.emit(Ldi { rd: low, k: value as u8 })
        .emit(Ldi { rd: low + 1, k: (value >> 8) as u8 })
}

/// Point Z at a flash label.
pub fn load_z<'a>(asm: &'a mut Assembler, label: &str) -> &'a mut Assembler {
    asm.ldi_lo8(30, label).ldi_hi8(31, label)
}
