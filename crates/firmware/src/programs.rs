//! Fixture programs. Each initialises USARTC0, moves bytes or computes, and
//! halts with `break`.

use crate::uart::{self, load_pair, load_z};
use avrlab_core::asm::{AsmError, Assembler, Program};
use avrlab_core::decoder::Instruction::*;
use avrlab_core::decoder::{AddrMode, Pointer};

pub const HELLO: &str = "Hello World!\n";

/// `base64encode` buffers: 100 input bytes plus terminator, 136 output
/// characters plus terminator.
pub const B64_INPUT: u16 = 0x2000;
pub const B64_OUTPUT: u16 = 0x2080;
pub const B64_MAX_INPUT: u8 = 100;

const B64_TABLE: &str = "ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789+/";

/// `modpow` working set in SRAM, 64-bit little-endian each.
pub const MODULUS_ADDR: u16 = 0x2000;
/// The accumulator; holds the result once the program halts.
pub const RESULT_ADDR: u16 = 0x2008;
pub const BASE_ADDR: u16 = 0x2010;
pub const EXP_ADDR: u16 = 0x2018;

pub const BENCH_BASE: u64 = 0x1234;
pub const BENCH_EXP: u64 = 0x7a69;
pub const BENCH_MODULUS: u64 = 0xa590_68FF;

pub fn hello_world() -> Result<Program, AsmError> {
    let mut asm = Assembler::new();
    asm.rcall("uart_init");
    load_z(&mut asm, "message")
        .rcall("uart_puts")
        .emit(Break);
    uart::emit_routines(&mut asm)
        .label("message")
        .asciz(HELLO)
        .finish()
}

/// Hello world with the driver written inline instead of as subroutines.
pub fn usart_out() -> Result<Program, AsmError> {
    let mut asm = Assembler::new();
    uart::emit_init(&mut asm);
    load_z(&mut asm, "message")
        .label("next")
        .emit(Lpm { rd: 24, post_inc: true })
        .emit(And { rd: 24, rr: 24 })
        .breq("done")
        .label("wait")
        .emit(Lds { rd: 25, k: uart::STATUS })
        .emit(Sbrs { rr: 25, b: 5 })
        .rjmp("wait")
        .emit(Sts { k: uart::DATA, rr: 24 })
        .rjmp("next")
        .label("done")
        .emit(Break)
        .label("message")
        .asciz(HELLO)
        .finish()
}

/// Echo every received byte up to and including the first NUL.
pub fn echo() -> Result<Program, AsmError> {
    let mut asm = Assembler::new();
    asm.rcall("uart_init")
        .label("loop")
        .rcall("uart_getc")
        .rcall("uart_putc")
        .emit(And { rd: 24, rr: 24 })
        .brne("loop")
        .emit(Break);
    uart::emit_routines(&mut asm).finish()
}

/// Read a NUL-terminated string of at most 100 bytes, print its base64
/// encoding with `=` padding.
pub fn base64encode() -> Result<Program, AsmError> {
    let mut asm = Assembler::new();
    asm.rcall("uart_init");

    // uart_gets: r18 counts the bytes stored at X
    load_pair(&mut asm, 26, B64_INPUT)
        .emit(Ldi { rd: 18, k: 0 })
        .label("gets")
        .emit(Cpi { rd: 18, k: B64_MAX_INPUT })
        .breq("gets_done")
        .rcall("uart_getc")
        .emit(And { rd: 24, rr: 24 })
        .breq("gets_done")
        .emit(St { ptr: Pointer::X, mode: AddrMode::PostInc, rr: 24 })
        .emit(Inc { rd: 18 })
        .rjmp("gets")
        .label("gets_done")
        .emit(Ldi { rd: 24, k: 0 })
        .emit(St { ptr: Pointer::X, mode: AddrMode::Plain, rr: 24 });

    // Y walks the input, X the output
    load_pair(&mut asm, 28, B64_INPUT);
    load_pair(&mut asm, 26, B64_OUTPUT)
        .label("encode")
        .emit(Cpi { rd: 18, k: 3 })
        .brlo("tail")
        .emit(Ld { rd: 20, ptr: Pointer::Y, mode: AddrMode::PostInc })
        .emit(Ld { rd: 21, ptr: Pointer::Y, mode: AddrMode::PostInc })
        .emit(Ld { rd: 22, ptr: Pointer::Y, mode: AddrMode::PostInc })
        .emit(Subi { rd: 18, k: 3 })
        .emit(Ldi { rd: 23, k: 3 })
        .rcall("encode_group")
        .rjmp("encode")
        .label("tail")
        .emit(And { rd: 18, rr: 18 })
        .breq("encoded")
        .emit(Ld { rd: 20, ptr: Pointer::Y, mode: AddrMode::PostInc })
        .emit(Ldi { rd: 21, k: 0 })
        .emit(Ldi { rd: 22, k: 0 })
        .emit(Mov { rd: 23, rr: 18 })
        .emit(Cpi { rd: 18, k: 1 })
        .breq("tail_group")
        .emit(Ld { rd: 21, ptr: Pointer::Y, mode: AddrMode::PostInc })
        .label("tail_group")
        .rcall("encode_group")
        .label("encoded")
        .emit(Ldi { rd: 24, k: 0 })
        .emit(St { ptr: Pointer::X, mode: AddrMode::Plain, rr: 24 });

    load_pair(&mut asm, 26, B64_OUTPUT)
        .rcall("uart_puts_ram")
        .emit(Break);

    // encode_group: bytes in r20..r22, r23 of them significant; appends
    // four characters at X
    asm.label("encode_group")
        .emit(Mov { rd: 24, rr: 20 })
        .emit(Lsr { rd: 24 })
        .emit(Lsr { rd: 24 })
        .rcall("b64_char")
        .emit(Mov { rd: 24, rr: 20 })
        .emit(Andi { rd: 24, k: 0x03 })
        .emit(Swap { rd: 24 })
        .emit(Mov { rd: 25, rr: 21 })
        .emit(Swap { rd: 25 })
        .emit(Andi { rd: 25, k: 0x0F })
        .emit(Or { rd: 24, rr: 25 })
        .rcall("b64_char")
        .emit(Cpi { rd: 23, k: 2 })
        .brlo("pad_two")
        .emit(Mov { rd: 24, rr: 21 })
        .emit(Andi { rd: 24, k: 0x0F })
        .emit(Add { rd: 24, rr: 24 })
        .emit(Add { rd: 24, rr: 24 })
        .emit(Mov { rd: 25, rr: 22 })
        .emit(Swap { rd: 25 })
        .emit(Lsr { rd: 25 })
        .emit(Lsr { rd: 25 })
        .emit(Andi { rd: 25, k: 0x03 })
        .emit(Or { rd: 24, rr: 25 })
        .rcall("b64_char")
        .emit(Cpi { rd: 23, k: 3 })
        .brlo("pad_one")
        .emit(Mov { rd: 24, rr: 22 })
        .emit(Andi { rd: 24, k: 0x3F })
        .rcall("b64_char")
        .emit(Ret)
        .label("pad_two")
        .emit(Ldi { rd: 24, k: b'=' })
        .emit(St { ptr: Pointer::X, mode: AddrMode::PostInc, rr: 24 })
        .label("pad_one")
        .emit(Ldi { rd: 24, k: b'=' })
        .emit(St { ptr: Pointer::X, mode: AddrMode::PostInc, rr: 24 })
        .emit(Ret);

    // b64_char: table[r24] appended at X
    asm.label("b64_char");
    load_z(&mut asm, "b64_table")
        .emit(Ldi { rd: 25, k: 0 })
        .emit(Add { rd: 30, rr: 24 })
        .emit(Adc { rd: 31, rr: 25 })
        .emit(Lpm { rd: 24, post_inc: false })
        .emit(St { ptr: Pointer::X, mode: AddrMode::PostInc, rr: 24 })
        .emit(Ret);

    uart::emit_routines(&mut asm)
        .label("b64_table")
        .asciz(B64_TABLE)
        .finish()
}

/// The benchmark: `0x1234^0x7a69 mod 0xa59068FF`.
pub fn modpow() -> Result<Program, AsmError> {
    modpow_with(BENCH_BASE, BENCH_EXP, BENCH_MODULUS)
}

/// Registers: mulmod computes r2..r9 = r10..r17 * r18..r25 mod m, reading m
/// from SRAM through Z with r26 as scratch.
const PRODUCT: u8 = 2;
const MULTIPLICAND: u8 = 10;
const MULTIPLIER: u8 = 18;

fn lds_u64(asm: &mut Assembler, first: u8, addr: u16) -> &mut Assembler {
    for i in 0..8 {
        asm.emit(Lds { rd: first + i, k: addr + i as u16 });
    }
    asm
}

fn sts_u64(asm: &mut Assembler, addr: u16, first: u8) -> &mut Assembler {
    for i in 0..8 {
        asm.emit(Sts { k: addr + i as u16, rr: first + i });
    }
    asm
}

/// `if value >= m { value -= m }` for the 64-bit value starting at `first`.
/// Valid whenever `value < 2m`.
fn emit_reduce<'a>(asm: &'a mut Assembler, label: &str, first: u8) -> &'a mut Assembler {
    let done = format!("{label}_done");
    asm.label(label);
    load_pair(asm, 30, MODULUS_ADDR);
    for i in 0..8 {
        asm.emit(Ld { rd: 26, ptr: Pointer::Z, mode: AddrMode::PostInc });
        if i == 0 {
            asm.emit(Sub { rd: first, rr: 26 });
        } else {
            asm.emit(Sbc { rd: first + i, rr: 26 });
        }
    }
    asm.brsh(&done);
    // Borrow: value was below m, add it back
    load_pair(asm, 30, MODULUS_ADDR);
    for i in 0..8 {
        asm.emit(Ld { rd: 26, ptr: Pointer::Z, mode: AddrMode::PostInc });
        if i == 0 {
            asm.emit(Add { rd: first, rr: 26 });
        } else {
            asm.emit(Adc { rd: first + i, rr: 26 });
        }
    }
    asm.label(&done).emit(Ret)
}

/// Right-to-left square-and-multiply over 64-bit operands, printing the
/// result as 16 lowercase hex digits and a newline.
///
/// The mulmod is double-and-add, so intermediate sums stay below 2^64 as
/// long as the modulus is below 2^63.
pub fn modpow_with(base: u64, exp: u64, m: u64) -> Result<Program, AsmError> {
    if m == 0 || m >= 1 << 63 {
        return Err(AsmError::OperandOutOfRange(format!(
            "modulus {m:#x} must be in 1..2^63"
        )));
    }

    let mut constants = Vec::with_capacity(32);
    constants.extend_from_slice(&m.to_le_bytes());
    constants.extend_from_slice(&(1 % m).to_le_bytes());
    constants.extend_from_slice(&(base % m).to_le_bytes());
    constants.extend_from_slice(&exp.to_le_bytes());

    let mut asm = Assembler::new();
    asm.rcall("uart_init");
    load_z(&mut asm, "constants");
    load_pair(&mut asm, 26, MODULUS_ADDR)
        .emit(Ldi { rd: 16, k: constants.len() as u8 })
        .label("copy")
        .emit(Lpm { rd: 0, post_inc: true })
        .emit(St { ptr: Pointer::X, mode: AddrMode::PostInc, rr: 0 })
        .emit(Dec { rd: 16 })
        .brne("copy");

    asm.label("loop").emit(Lds { rd: 26, k: EXP_ADDR });
    for i in 1..8 {
        asm.emit(Lds { rd: 27, k: EXP_ADDR + i })
            .emit(Or { rd: 26, rr: 27 });
    }
    asm.brne("exp_bit").rjmp("print").label("exp_bit");

    asm.emit(Lds { rd: 26, k: EXP_ADDR })
        .emit(Sbrs { rr: 26, b: 0 })
        .rjmp("square");
    lds_u64(&mut asm, MULTIPLICAND, RESULT_ADDR);
    lds_u64(&mut asm, MULTIPLIER, BASE_ADDR).rcall("mulmod");
    sts_u64(&mut asm, RESULT_ADDR, PRODUCT);

    asm.label("square");
    lds_u64(&mut asm, MULTIPLICAND, BASE_ADDR);
    lds_u64(&mut asm, MULTIPLIER, BASE_ADDR).rcall("mulmod");
    sts_u64(&mut asm, BASE_ADDR, PRODUCT);

    // exp >>= 1
    lds_u64(&mut asm, MULTIPLIER, EXP_ADDR).emit(Lsr { rd: MULTIPLIER + 7 });
    for i in (0..7).rev() {
        asm.emit(Ror { rd: MULTIPLIER + i });
    }
    sts_u64(&mut asm, EXP_ADDR, MULTIPLIER).rjmp("loop");

    // Most significant byte first
    asm.label("print");
    load_pair(&mut asm, 26, RESULT_ADDR + 8)
        .emit(Ldi { rd: 16, k: 8 })
        .label("print_byte")
        .emit(Ld { rd: 20, ptr: Pointer::X, mode: AddrMode::PreDec })
        .emit(Mov { rd: 24, rr: 20 })
        .emit(Swap { rd: 24 })
        .emit(Andi { rd: 24, k: 0x0F })
        .rcall("hex_digit")
        .emit(Mov { rd: 24, rr: 20 })
        .emit(Andi { rd: 24, k: 0x0F })
        .rcall("hex_digit")
        .emit(Dec { rd: 16 })
        .brne("print_byte")
        .emit(Ldi { rd: 24, k: b'\n' })
        .rcall("uart_putc")
        .emit(Break);

    // hex_digit: nibble in r24 to '0'..'9' / 'a'..'f', then uart_putc
    asm.label("hex_digit")
        .emit(Cpi { rd: 24, k: 10 })
        .brlo("hex_decimal")
        .emit(Subi { rd: 24, k: 0u8.wrapping_sub(b'a' - 10) })
        .rjmp("uart_putc")
        .label("hex_decimal")
        .emit(Subi { rd: 24, k: 0u8.wrapping_sub(b'0') })
        .rjmp("uart_putc");

    asm.label("mulmod");
    for i in 0..8 {
        asm.emit(Eor { rd: PRODUCT + i, rr: PRODUCT + i });
    }
    asm.label("mulmod_loop")
        .emit(Mov { rd: 26, rr: MULTIPLIER });
    for i in 1..8 {
        asm.emit(Or { rd: 26, rr: MULTIPLIER + i });
    }
    asm.breq("mulmod_done")
        .emit(Sbrs { rr: MULTIPLIER, b: 0 })
        .rjmp("mulmod_double")
        .emit(Add { rd: PRODUCT, rr: MULTIPLICAND });
    for i in 1..8 {
        asm.emit(Adc { rd: PRODUCT + i, rr: MULTIPLICAND + i });
    }
    asm.rcall("reduce_product")
        .label("mulmod_double")
        .emit(Add { rd: MULTIPLICAND, rr: MULTIPLICAND });
    for i in 1..8 {
        asm.emit(Adc { rd: MULTIPLICAND + i, rr: MULTIPLICAND + i });
    }
    asm.rcall("reduce_multiplicand")
        .emit(Lsr { rd: MULTIPLIER + 7 });
    for i in (0..7).rev() {
        asm.emit(Ror { rd: MULTIPLIER + i });
    }
    asm.rjmp("mulmod_loop")
        .label("mulmod_done")
        .emit(Ret);

    emit_reduce(&mut asm, "reduce_product", PRODUCT);
    emit_reduce(&mut asm, "reduce_multiplicand", MULTIPLICAND);

    uart::emit_routines(&mut asm)
        .label("constants")
        .db(&constants)
        .finish()
}
