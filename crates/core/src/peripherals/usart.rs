use crate::interrupt::{InterruptLevel, InterruptRequest};
use crate::SimResult;
use crossbeam_channel::{Receiver, Sender};
use std::any::Any;
use std::collections::VecDeque;

pub const DATA: u32 = 0x00;
pub const STATUS: u32 = 0x01;
pub const CTRLA: u32 = 0x03;
pub const CTRLB: u32 = 0x04;
pub const CTRLC: u32 = 0x05;
pub const BAUDCTRLA: u32 = 0x06;
pub const BAUDCTRLB: u32 = 0x07;

/// Size of the register block in the data space.
pub const REGISTER_BLOCK_SIZE: u32 = 0x08;

pub const STATUS_RXCIF: u8 = 1 << 7;
pub const STATUS_TXCIF: u8 = 1 << 6;
pub const STATUS_DREIF: u8 = 1 << 5;

pub const CTRLB_RXEN: u8 = 1 << 4;
pub const CTRLB_TXEN: u8 = 1 << 3;
pub const CTRLB_CLK2X: u8 = 1 << 2;

/// XMEGA USART.
///
/// Transmission completes instantly: DREIF never clears and TXCIF is raised
/// by every transmitted byte. Received bytes come from a host-fed queue.
#[derive(Debug, Default)]
pub struct Usart {
    /// Vector of the RXC interrupt; DRE and TXC follow it.
    base_vector: u16,
    ctrla: u8,
    ctrlb: u8,
    ctrlc: u8,
    baudctrla: u8,
    baudctrlb: u8,
    txc: bool,
    last_rx: u8,
    rx: VecDeque<u8>,
    output: Vec<u8>,
    listeners: Vec<Sender<u8>>,
}

impl Usart {
    pub fn new(base_vector: u16) -> Self {
        Self {
            base_vector,
            ctrlc: 0x06,
            ..Default::default()
        }
    }

    pub fn rxc_vector(&self) -> u16 {
        self.base_vector
    }

    pub fn dre_vector(&self) -> u16 {
        self.base_vector + 1
    }

    pub fn txc_vector(&self) -> u16 {
        self.base_vector + 2
    }

    /// Queue bytes for the firmware to receive.
    pub fn push_input(&mut self, bytes: &[u8]) {
        self.rx.extend(bytes.iter().copied());
    }

    pub fn pending_input(&self) -> usize {
        self.rx.len()
    }

    /// Stream every transmitted byte to a new receiver.
    pub fn connect_tx(&mut self) -> Receiver<u8> {
        let (tx, rx) = crossbeam_channel::unbounded();
        self.listeners.push(tx);
        rx
    }

    /// Transmitted bytes so far.
    pub fn output(&self) -> &[u8] {
        &self.output
    }

    pub fn take_output(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.output)
    }

    pub fn tx_enabled(&self) -> bool {
        self.ctrlb & CTRLB_TXEN != 0
    }

    pub fn rx_enabled(&self) -> bool {
        self.ctrlb & CTRLB_RXEN != 0
    }

    fn status(&self) -> u8 {
        let mut status = STATUS_DREIF;
        if self.rx_enabled() && !self.rx.is_empty() {
            status |= STATUS_RXCIF;
        }
        if self.txc {
            status |= STATUS_TXCIF;
        }
        status
    }

    /// Baud rate for peripheral clock `f_per`, from BSEL, BSCALE and CLK2X.
    pub fn baud_rate(&self, f_per: u32) -> f64 {
        let bsel = (((self.baudctrlb & 0x0F) as u32) << 8) | self.baudctrla as u32;
        // BSCALE is a 4-bit two's complement value
        let bscale = ((self.baudctrlb as i8) >> 4) as i32;
        let divisor = if self.ctrlb & CTRLB_CLK2X != 0 { 8.0 } else { 16.0 };
        let f_per = f_per as f64;

        if bscale >= 0 {
            f_per / (2f64.powi(bscale) * divisor * (bsel as f64 + 1.0))
        } else {
            f_per / (divisor * (2f64.powi(bscale) * bsel as f64 + 1.0))
        }
    }

    fn transmit(&mut self, value: u8) {
        if !self.tx_enabled() {
            tracing::warn!("USART: byte {:#04x} written with TXEN clear, dropped", value);
            return;
        }
        tracing::debug!("USART TX {:#04x} {:?}", value, value as char);
        self.output.push(value);
        // Disconnected listeners are pruned.
        self.listeners.retain(|listener| listener.send(value).is_ok());
        self.txc = true;
    }

    fn level(&self, shift: u8) -> Option<InterruptLevel> {
        InterruptLevel::from_field(self.ctrla >> shift)
    }
}

impl crate::Peripheral for Usart {
    fn read(&mut self, offset: u32) -> SimResult<u8> {
        if offset == DATA {
            if let Some(byte) = self.rx.pop_front() {
                tracing::debug!("USART RX {:#04x} {:?}", byte, byte as char);
                self.last_rx = byte;
            }
            return Ok(self.last_rx);
        }
        self.peek(offset)
    }

    fn peek(&self, offset: u32) -> SimResult<u8> {
        Ok(match offset {
            DATA => self.rx.front().copied().unwrap_or(self.last_rx),
            STATUS => self.status(),
            CTRLA => self.ctrla,
            CTRLB => self.ctrlb,
            CTRLC => self.ctrlc,
            BAUDCTRLA => self.baudctrla,
            BAUDCTRLB => self.baudctrlb,
            _ => 0,
        })
    }

    fn write(&mut self, offset: u32, value: u8) -> SimResult<()> {
        match offset {
            DATA => self.transmit(value),
            STATUS => {
                if value & STATUS_TXCIF != 0 {
                    self.txc = false;
                }
            }
            CTRLA => self.ctrla = value & 0x3F,
            CTRLB => self.ctrlb = value & 0x1F,
            CTRLC => self.ctrlc = value,
            BAUDCTRLA => self.baudctrla = value,
            BAUDCTRLB => self.baudctrlb = value,
            _ => {}
        }
        Ok(())
    }

    fn interrupt(&self) -> Option<InterruptRequest> {
        let status = self.status();
        let mut candidates = Vec::with_capacity(3);
        if status & STATUS_RXCIF != 0 {
            if let Some(level) = self.level(4) {
                candidates.push(InterruptRequest { vector: self.rxc_vector(), level });
            }
        }
        if status & STATUS_DREIF != 0 {
            if let Some(level) = self.level(0) {
                candidates.push(InterruptRequest { vector: self.dre_vector(), level });
            }
        }
        if status & STATUS_TXCIF != 0 {
            if let Some(level) = self.level(2) {
                candidates.push(InterruptRequest { vector: self.txc_vector(), level });
            }
        }
        candidates
            .into_iter()
            .min_by_key(|req| (std::cmp::Reverse(req.level), req.vector))
    }

    fn acknowledge(&mut self, vector: u16) {
        // TXCIF clears when its vector executes; RXCIF and DREIF clear only
        // through DATA accesses.
        if vector == self.txc_vector() {
            self.txc = false;
        }
    }

    fn snapshot(&self) -> serde_json::Value {
        serde_json::json!({
            "ctrla": self.ctrla,
            "ctrlb": self.ctrlb,
            "ctrlc": self.ctrlc,
            "status": self.status(),
            "pending_input": self.rx.len(),
            "output": String::from_utf8_lossy(&self.output),
        })
    }

    fn as_any(&self) -> Option<&dyn Any> {
        Some(self)
    }

    fn as_any_mut(&mut self) -> Option<&mut dyn Any> {
        Some(self)
    }
}
