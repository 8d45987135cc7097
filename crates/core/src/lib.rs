pub mod asm;
pub mod bus;
pub mod cpu;
pub mod decoder;
pub mod interrupt;
pub mod memory;
pub mod metrics;
pub mod models;
pub mod peripherals;
pub mod snapshot;

use std::any::Any;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use crate::cpu::{AvrCore, ExecOutcome};
use crate::interrupt::InterruptRequest;
use crate::peripherals::usart::Usart;


/// Start of the data space in the avr-gdb/ELF unified address space.
pub const DATA_SPACE_OFFSET: u32 = 0x80_0000;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SimulationError {
    #[error("Memory access violation at {0:#x}")]
    MemoryViolation(u32),
    #[error("Instruction decoding error at {pc:#x}: opcode {opcode:#06x}")]
    DecodeError { pc: u32, opcode: u16 },
    #[error("Program counter out of bounds: {0:#x}")]
    PcOutOfBounds(i64),
    #[error("Unsupported instruction at {pc:#x}: {mnemonic}")]
    Unsupported { pc: u32, mnemonic: String },
}

pub type SimResult<T> = Result<T, SimulationError>;

/// Trait for observing simulation events in a modular way.
pub trait SimulationObserver: std::fmt::Debug + Send + Sync {
    fn on_simulation_start(&self) {}
    fn on_simulation_stop(&self) {}
    fn on_step_start(&self, _pc: u32, _opcode: u16) {}
    fn on_step_end(&self, _cycles: u32) {}
}

/// Trait representing a CPU core.
///
/// Program counters crossing this boundary are byte addresses.
pub trait Cpu {
    fn reset(&mut self);
    fn step(
        &mut self,
        bus: &mut dyn Bus,
        observers: &[Arc<dyn SimulationObserver>],
    ) -> SimResult<ExecOutcome>;
    fn get_pc(&self) -> u32;
    fn set_pc(&mut self, val: u32);
    fn cycles(&self) -> u64;
    fn interrupts_enabled(&self) -> bool;
    fn enter_interrupt(&mut self, bus: &mut dyn Bus, vector: u16) -> SimResult<()>;
    /// Data-space read that sees CPU-owned I/O registers (SP, SREG, RAMP*).
    fn peek_data(&self, bus: &dyn Bus, addr: u32) -> SimResult<u8>;
    fn poke_data(&mut self, bus: &mut dyn Bus, addr: u32, value: u8) -> SimResult<()>;
    fn snapshot(&self) -> snapshot::CpuSnapshot;
}

/// Trait representing a memory-mapped peripheral in the data space.
///
/// `read` may have side effects (popping a receive buffer); `peek` must not.
pub trait Peripheral: std::fmt::Debug + Send {
    fn read(&mut self, offset: u32) -> SimResult<u8>;
    fn peek(&self, offset: u32) -> SimResult<u8>;
    fn write(&mut self, offset: u32, value: u8) -> SimResult<()>;
    fn tick(&mut self, _cycles: u32) {}
    /// Highest priority interrupt this peripheral currently requests.
    fn interrupt(&self) -> Option<InterruptRequest> {
        None
    }
    fn acknowledge(&mut self, _vector: u16) {}
    fn snapshot(&self) -> serde_json::Value {
        serde_json::Value::Null
    }
    fn as_any(&self) -> Option<&dyn Any> {
        None
    }
    fn as_any_mut(&mut self) -> Option<&mut dyn Any> {
        None
    }
}

/// Trait representing the system bus: the data space plus program memory.
pub trait Bus {
    fn read_u8(&mut self, addr: u32) -> SimResult<u8>;
    fn peek_u8(&self, addr: u32) -> SimResult<u8>;
    fn write_u8(&mut self, addr: u32, value: u8) -> SimResult<()>;

    /// Fetch a program word by word address.
    fn fetch(&self, word_addr: u32) -> SimResult<u16>;
    /// Read a program memory byte by byte address (LPM/ELPM).
    fn read_program_u8(&self, addr: u32) -> SimResult<u8>;
    /// Size of program memory in words.
    fn program_words(&self) -> u32;

    fn tick_peripherals(&mut self, cycles: u32);
    /// Interrupt the controller would dispatch now, ignoring the global enable flag.
    fn pending_interrupt(&self) -> Option<InterruptRequest>;
    fn acknowledge_interrupt(&mut self, request: InterruptRequest);
    fn return_from_interrupt(&mut self);

    fn read_u16(&mut self, addr: u32) -> SimResult<u16> {
        let b0 = self.read_u8(addr)? as u16;
        let b1 = self.read_u8(addr + 1)? as u16;
        // Little Endian
        Ok(b0 | (b1 << 8))
    }

    fn write_u16(&mut self, addr: u32, value: u16) -> SimResult<()> {
        self.write_u8(addr, (value & 0xFF) as u8)?;
        self.write_u8(addr + 1, (value >> 8) as u8)?;
        Ok(())
    }
}

/// Why a run stopped without an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// The firmware executed `break`.
    Break,
    /// The firmware executed `sleep` with no interrupt able to wake it.
    Sleep,
    /// A breakpoint at this byte address was reached.
    Breakpoint(u32),
    MaxSteps,
    StepDone,
}

pub struct Machine<C: Cpu> {
    pub cpu: C,
    pub bus: bus::SystemBus,
    pub observers: Vec<Arc<dyn SimulationObserver>>,
    breakpoints: HashSet<u32>,
    steps: u64,
}

pub type AvrMachine = Machine<AvrCore>;

impl<C: Cpu> Machine<C> {
    pub fn new(cpu: C, bus: bus::SystemBus) -> Self {
        Self {
            cpu,
            bus,
            observers: Vec::new(),
            breakpoints: HashSet::new(),
            steps: 0,
        }
    }

    pub fn load_firmware(&mut self, image: &memory::ProgramImage) -> SimResult<()> {
        for segment in &image.segments {
            if segment.start_addr < DATA_SPACE_OFFSET as u64 {
                if !self.bus.flash.load_from_segment(segment) {
                    tracing::warn!(
                        "Failed to load segment at {:#x} - outside of program memory",
                        segment.start_addr
                    );
                }
            } else {
                // Initialised data placed directly in SRAM (ELF VMA images)
                let base = (segment.start_addr - DATA_SPACE_OFFSET as u64) as u32;
                for (i, byte) in segment.data.iter().enumerate() {
                    self.bus.write_u8(base + i as u32, *byte)?;
                }
            }
        }

        for observer in &self.observers {
            observer.on_simulation_start();
        }
        self.reset();

        if image.entry_point != 0 {
            self.cpu.set_pc(image.entry_point as u32);
        }

        Ok(())
    }

    pub fn reset(&mut self) {
        self.cpu.reset();
        self.bus.reset_interrupts();
        self.steps = 0;
    }

    /// Execute one instruction, then let peripherals run and interrupts dispatch.
    pub fn step(&mut self) -> SimResult<Option<StopReason>> {
        let before = self.cpu.cycles();
        let outcome = self.cpu.step(&mut self.bus, &self.observers)?;
        self.steps += 1;

        let spent = self.cpu.cycles().saturating_sub(before) as u32;
        self.bus.tick_peripherals(spent);

        match outcome {
            ExecOutcome::Continue => {}
            ExecOutcome::InterruptReturn => self.bus.return_from_interrupt(),
            ExecOutcome::Break => {
                tracing::debug!("BREAK at {:#x}", self.cpu.get_pc().wrapping_sub(2));
                return Ok(Some(StopReason::Break));
            }
            ExecOutcome::Sleep => {
                if !(self.cpu.interrupts_enabled() && self.bus.pending_interrupt().is_some()) {
                    return Ok(Some(StopReason::Sleep));
                }
            }
        }

        self.service_interrupts()?;
        Ok(None)
    }

    fn service_interrupts(&mut self) -> SimResult<()> {
        if !self.cpu.interrupts_enabled() {
            return Ok(());
        }
        if let Some(request) = self.bus.pending_interrupt() {
            tracing::debug!(
                "Interrupt vector {} ({:?}) taken at {:#x}",
                request.vector,
                request.level,
                self.cpu.get_pc()
            );
            self.cpu.enter_interrupt(&mut self.bus, request.vector)?;
            self.bus.acknowledge_interrupt(request);
        }
        Ok(())
    }

    /// Run until the firmware halts, a breakpoint is hit or `max_steps` elapse.
    ///
    /// A breakpoint at the current PC does not stop the first step, so resuming
    /// from a breakpoint makes progress.
    pub fn run(&mut self, max_steps: Option<u64>) -> SimResult<StopReason> {
        let mut executed = 0u64;
        loop {
            if let Some(max) = max_steps {
                if executed >= max {
                    return Ok(StopReason::MaxSteps);
                }
            }

            let pc = self.cpu.get_pc();
            if executed > 0 && self.breakpoints.contains(&pc) {
                return Ok(StopReason::Breakpoint(pc));
            }

            if let Some(reason) = self.step()? {
                for observer in &self.observers {
                    observer.on_simulation_stop();
                }
                return Ok(reason);
            }
            executed += 1;
        }
    }

    pub fn steps(&self) -> u64 {
        self.steps
    }

    pub fn add_breakpoint(&mut self, addr: u32) {
        self.breakpoints.insert(addr);
    }

    pub fn remove_breakpoint(&mut self, addr: u32) -> bool {
        self.breakpoints.remove(&addr)
    }

    pub fn breakpoints(&self) -> impl Iterator<Item = &u32> {
        self.breakpoints.iter()
    }

    /// Read memory in the unified address space: program memory below
    /// [`DATA_SPACE_OFFSET`], data space above it. Reads have no side effects.
    pub fn read_memory(&self, addr: u32, len: usize) -> SimResult<Vec<u8>> {
        let mut data = Vec::with_capacity(len);
        for i in 0..len as u32 {
            let a = addr + i;
            let byte = if a >= DATA_SPACE_OFFSET {
                self.cpu.peek_data(&self.bus, a - DATA_SPACE_OFFSET)?
            } else {
                self.bus.read_program_u8(a)?
            };
            data.push(byte);
        }
        Ok(data)
    }

    pub fn write_memory(&mut self, addr: u32, data: &[u8]) -> SimResult<()> {
        for (i, byte) in data.iter().enumerate() {
            let a = addr + i as u32;
            if a >= DATA_SPACE_OFFSET {
                self.cpu
                    .poke_data(&mut self.bus, a - DATA_SPACE_OFFSET, *byte)?;
            } else if !self.bus.flash.write_u8(a, *byte) {
                return Err(SimulationError::MemoryViolation(a));
            }
        }
        Ok(())
    }

    pub fn usart(&self, name: &str) -> Option<&Usart> {
        self.bus.peripheral::<Usart>(name)
    }

    pub fn usart_mut(&mut self, name: &str) -> Option<&mut Usart> {
        self.bus.peripheral_mut::<Usart>(name)
    }

    pub fn snapshot(&self) -> snapshot::MachineSnapshot {
        let mut peripherals = HashMap::new();
        for entry in &self.bus.peripherals {
            let value = entry.dev.snapshot();
            if !value.is_null() {
                peripherals.insert(entry.name.clone(), value);
            }
        }
        snapshot::MachineSnapshot {
            cpu: self.cpu.snapshot(),
            steps: self.steps,
            peripherals,
        }
    }
}

impl Machine<AvrCore> {
    /// Build a machine for one of the built-in device models.
    pub fn from_model(model: models::XmegaA4U) -> Self {
        let layout = model.layout();
        Self::new(AvrCore::new(layout.core_config()), model.create_bus())
    }

    /// Build a machine from a YAML chip descriptor.
    pub fn from_config(chip: &avrlab_config::ChipDescriptor) -> anyhow::Result<Self> {
        let layout = models::MemoryLayout::from_config(chip)?;
        let bus = bus::SystemBus::from_config(chip, &layout)?;
        Ok(Self::new(AvrCore::new(layout.core_config()), bus))
    }
}
