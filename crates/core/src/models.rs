//! Built-in device models.

use crate::bus::SystemBus;
use crate::cpu::CoreConfig;
use crate::peripherals::gpio::{self, GpioPort};
use crate::peripherals::usart::{self, Usart};
use anyhow::Context;

/// Internal SRAM start on every XMEGA.
pub const INTERNAL_SRAM_BASE: u32 = 0x2000;

/// Clock after reset: the internal 2 MHz RC oscillator.
pub const DEFAULT_CLOCK_HZ: u32 = 2_000_000;

/// Flash above 128 KiB needs 22-bit program counters.
const WIDE_PC_FLASH_BYTES: u32 = 128 * 1024;

/// USART instances of the A4U family: name, base address, RXC vector.
pub const A4U_USARTS: [(&str, u32, u16); 5] = [
    ("USARTC0", 0x08A0, 25),
    ("USARTC1", 0x08B0, 28),
    ("USARTD0", 0x09A0, 88),
    ("USARTD1", 0x09B0, 91),
    ("USARTE0", 0x0AA0, 58),
];

pub const A4U_PORTS: [(&str, u32); 5] = [
    ("PORTA", 0x0600),
    ("PORTB", 0x0620),
    ("PORTC", 0x0640),
    ("PORTD", 0x0660),
    ("PORTE", 0x0680),
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryLayout {
    /// Application plus boot section.
    pub flash_bytes: u32,
    pub sram_base: u32,
    pub sram_bytes: u32,
    pub clock_hz: u32,
}

impl MemoryLayout {
    pub fn core_config(&self) -> CoreConfig {
        CoreConfig {
            pc_bytes: if self.flash_bytes > WIDE_PC_FLASH_BYTES { 3 } else { 2 },
            reset_sp: (self.sram_base + self.sram_bytes - 1) as u16,
        }
    }

    pub fn from_config(chip: &avrlab_config::ChipDescriptor) -> anyhow::Result<Self> {
        if chip.arch != "avrxm" {
            anyhow::bail!("Unsupported architecture '{}' (expected 'avrxm')", chip.arch);
        }

        let flash_bytes = u32::try_from(chip.flash_bytes()?).context("Flash size too large")?;
        let sram_bytes = u32::try_from(chip.sram_bytes()?).context("SRAM size too large")?;
        // A zero base means the descriptor left it out; SRAM cannot start in I/O space.
        let sram_base = if chip.sram.base == 0 {
            INTERNAL_SRAM_BASE
        } else {
            chip.sram.base
        };

        if flash_bytes == 0 || flash_bytes % 2 != 0 {
            anyhow::bail!("Flash size must be a non-zero number of words");
        }
        let sram_end = sram_base.checked_add(sram_bytes);
        if sram_bytes == 0 || sram_end.map_or(true, |end| end > 0x1_0000) {
            anyhow::bail!("SRAM must be non-empty and end below 0x10000");
        }

        Ok(Self {
            flash_bytes,
            sram_base,
            sram_bytes,
            clock_hz: chip.clock_hz.unwrap_or(DEFAULT_CLOCK_HZ),
        })
    }
}

/// The ATxmega A4U family.
#[allow(non_camel_case_types)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum XmegaA4U {
    ATxmega16A4U,
    ATxmega32A4U,
    ATxmega64A4U,
    ATxmega128A4U,
}

impl XmegaA4U {
    pub const ALL: [XmegaA4U; 4] = [
        XmegaA4U::ATxmega16A4U,
        XmegaA4U::ATxmega32A4U,
        XmegaA4U::ATxmega64A4U,
        XmegaA4U::ATxmega128A4U,
    ];

    pub fn name(self) -> &'static str {
        match self {
            XmegaA4U::ATxmega16A4U => "ATxmega16A4U",
            XmegaA4U::ATxmega32A4U => "ATxmega32A4U",
            XmegaA4U::ATxmega64A4U => "ATxmega64A4U",
            XmegaA4U::ATxmega128A4U => "ATxmega128A4U",
        }
    }

    /// Case-insensitive lookup by device name.
    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|model| model.name().eq_ignore_ascii_case(name))
    }

    pub fn layout(self) -> MemoryLayout {
        let (flash_bytes, sram_bytes) = match self {
            XmegaA4U::ATxmega16A4U => (0x5000, 2 * 1024),
            XmegaA4U::ATxmega32A4U => (0x9000, 4 * 1024),
            XmegaA4U::ATxmega64A4U => (0x1_1000, 4 * 1024),
            XmegaA4U::ATxmega128A4U => (0x2_2000, 8 * 1024),
        };
        MemoryLayout {
            flash_bytes,
            sram_base: INTERNAL_SRAM_BASE,
            sram_bytes,
            clock_hz: DEFAULT_CLOCK_HZ,
        }
    }

    pub fn create_bus(self) -> SystemBus {
        let mut bus = SystemBus::with_layout(&self.layout());
        for (name, base, vector) in A4U_USARTS {
            bus.add_peripheral(name, base, usart::REGISTER_BLOCK_SIZE, Box::new(Usart::new(vector)));
        }
        for (name, base) in A4U_PORTS {
            bus.add_peripheral(name, base, gpio::REGISTER_BLOCK_SIZE, Box::new(GpioPort::new()));
        }
        bus
    }
}

impl std::fmt::Display for XmegaA4U {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}
