use crate::interrupt::{InterruptRequest, Pmic, PMIC_BASE, PMIC_SIZE};
use crate::memory::LinearMemory;
use crate::models::MemoryLayout;
use crate::peripherals::gpio::{self, GpioPort};
use crate::peripherals::usart::{self, Usart};
use crate::{Peripheral, SimResult, SimulationError};

/// End of the I/O register area of the data space.
const IO_SPACE_END: u32 = 0x1000;

#[derive(Debug)]
pub struct PeripheralEntry {
    pub name: String,
    pub base: u32,
    pub size: u32,
    pub dev: Box<dyn Peripheral>,
}

impl PeripheralEntry {
    fn contains(&self, addr: u32) -> bool {
        addr >= self.base && addr < self.base + self.size
    }
}

/// Program memory plus the XMEGA data space: I/O registers, peripherals,
/// PMIC and internal SRAM.
#[derive(Debug)]
pub struct SystemBus {
    pub flash: LinearMemory,
    pub sram: LinearMemory,
    /// Backing store for I/O registers no modelled peripheral claims.
    io: Vec<u8>,
    pub pmic: Pmic,
    pub peripherals: Vec<PeripheralEntry>,
}

impl SystemBus {
    pub fn with_layout(layout: &MemoryLayout) -> Self {
        Self {
            flash: LinearMemory::new(layout.flash_bytes as usize, 0),
            sram: LinearMemory::new(layout.sram_bytes as usize, layout.sram_base),
            io: vec![0; IO_SPACE_END as usize],
            pmic: Pmic::new(),
            peripherals: Vec::new(),
        }
    }

    pub fn add_peripheral(&mut self, name: &str, base: u32, size: u32, dev: Box<dyn Peripheral>) {
        tracing::debug!("Mapping {} at {:#06x}..{:#06x}", name, base, base + size);
        self.peripherals.push(PeripheralEntry {
            name: name.to_string(),
            base,
            size,
            dev,
        });
    }

    fn overlaps(&self, base: u32, size: u32) -> bool {
        let end = base + size;
        let pmic_end = PMIC_BASE + PMIC_SIZE;
        (base < pmic_end && PMIC_BASE < end)
            || self
                .peripherals
                .iter()
                .any(|p| base < p.base + p.size && p.base < end)
    }

    /// Build the bus described by a chip descriptor.
    pub fn from_config(
        chip: &avrlab_config::ChipDescriptor,
        layout: &MemoryLayout,
    ) -> anyhow::Result<Self> {
        let mut bus = Self::with_layout(layout);

        for p in &chip.peripherals {
            let (size, dev): (u32, Box<dyn Peripheral>) = match p.r#type.as_str() {
                "usart" => {
                    let vector = p.vector.ok_or_else(|| {
                        anyhow::anyhow!("USART '{}' needs an interrupt 'vector'", p.id)
                    })?;
                    (usart::REGISTER_BLOCK_SIZE, Box::new(Usart::new(vector)))
                }
                "gpio" => (gpio::REGISTER_BLOCK_SIZE, Box::new(GpioPort::new())),
                other => {
                    anyhow::bail!("Unsupported peripheral type '{}' for '{}'", other, p.id)
                }
            };

            let end = p.base_address.checked_add(size);
            if end.map_or(true, |end| end > IO_SPACE_END) {
                anyhow::bail!(
                    "Peripheral '{}' at {:#x} lies outside the I/O space",
                    p.id,
                    p.base_address
                );
            }
            if bus.overlaps(p.base_address, size) {
                anyhow::bail!("Peripheral '{}' at {:#x} overlaps another mapping", p.id, p.base_address);
            }
            bus.add_peripheral(&p.id, p.base_address, size, dev);
        }

        Ok(bus)
    }

    pub fn peripheral<T: 'static>(&self, name: &str) -> Option<&T> {
        self.peripherals
            .iter()
            .find(|p| p.name == name)
            .and_then(|p| p.dev.as_any())
            .and_then(|any| any.downcast_ref::<T>())
    }

    pub fn peripheral_mut<T: 'static>(&mut self, name: &str) -> Option<&mut T> {
        self.peripherals
            .iter_mut()
            .find(|p| p.name == name)
            .and_then(|p| p.dev.as_any_mut())
            .and_then(|any| any.downcast_mut::<T>())
    }

    /// Names of all USART instances on the bus.
    pub fn usart_names(&self) -> Vec<String> {
        self.peripherals
            .iter()
            .filter(|p| p.dev.as_any().map_or(false, |any| any.is::<Usart>()))
            .map(|p| p.name.clone())
            .collect()
    }

    pub fn reset_interrupts(&mut self) {
        self.pmic.reset();
    }

    fn is_pmic(addr: u32) -> bool {
        (PMIC_BASE..PMIC_BASE + PMIC_SIZE).contains(&addr)
    }
}

impl crate::Bus for SystemBus {
    fn read_u8(&mut self, addr: u32) -> SimResult<u8> {
        if Self::is_pmic(addr) {
            return Ok(self.pmic.read(addr - PMIC_BASE));
        }
        if let Some(p) = self.peripherals.iter_mut().find(|p| p.contains(addr)) {
            return p.dev.read(addr - p.base);
        }
        if let Some(byte) = self.sram.read_u8(addr) {
            return Ok(byte);
        }
        if addr < IO_SPACE_END {
            tracing::trace!("Read of unmodelled I/O register {:#06x}", addr);
            return Ok(self.io[addr as usize]);
        }
        Err(SimulationError::MemoryViolation(addr))
    }

    fn peek_u8(&self, addr: u32) -> SimResult<u8> {
        if Self::is_pmic(addr) {
            return Ok(self.pmic.read(addr - PMIC_BASE));
        }
        if let Some(p) = self.peripherals.iter().find(|p| p.contains(addr)) {
            return p.dev.peek(addr - p.base);
        }
        if let Some(byte) = self.sram.read_u8(addr) {
            return Ok(byte);
        }
        if addr < IO_SPACE_END {
            return Ok(self.io[addr as usize]);
        }
        Err(SimulationError::MemoryViolation(addr))
    }

    fn write_u8(&mut self, addr: u32, value: u8) -> SimResult<()> {
        if Self::is_pmic(addr) {
            self.pmic.write(addr - PMIC_BASE, value);
            return Ok(());
        }
        if let Some(p) = self.peripherals.iter_mut().find(|p| p.contains(addr)) {
            return p.dev.write(addr - p.base, value);
        }
        if self.sram.write_u8(addr, value) {
            return Ok(());
        }
        if addr < IO_SPACE_END {
            tracing::trace!("Write {:#04x} to unmodelled I/O register {:#06x}", value, addr);
            self.io[addr as usize] = value;
            return Ok(());
        }
        // Program memory is not reachable through the data bus.
        Err(SimulationError::MemoryViolation(addr))
    }

    fn fetch(&self, word_addr: u32) -> SimResult<u16> {
        let addr = word_addr * 2;
        match (self.flash.read_u8(addr), self.flash.read_u8(addr + 1)) {
            (Some(lo), Some(hi)) => Ok(u16::from_le_bytes([lo, hi])),
            _ => Err(SimulationError::PcOutOfBounds(addr as i64)),
        }
    }

    fn read_program_u8(&self, addr: u32) -> SimResult<u8> {
        self.flash
            .read_u8(addr)
            .ok_or(SimulationError::MemoryViolation(addr))
    }

    fn program_words(&self) -> u32 {
        (self.flash.data.len() / 2) as u32
    }

    fn tick_peripherals(&mut self, cycles: u32) {
        for p in &mut self.peripherals {
            p.dev.tick(cycles);
        }
    }

    fn pending_interrupt(&self) -> Option<InterruptRequest> {
        self.pmic
            .select(self.peripherals.iter().filter_map(|p| p.dev.interrupt()))
    }

    fn acknowledge_interrupt(&mut self, request: InterruptRequest) {
        self.pmic.acknowledge(request);
        for p in &mut self.peripherals {
            p.dev.acknowledge(request.vector);
        }
    }

    fn return_from_interrupt(&mut self) {
        self.pmic.return_from_interrupt();
    }
}
