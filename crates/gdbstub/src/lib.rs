// AvrLab - AVR Firmware Simulation Platform
// Copyright (C) 2026 Andrii Shylenko
//
// This software is released under the MIT License.
// See the LICENSE file in the project root for full license information.

pub mod arch;

use arch::{Avr, AvrRegs};
use avrlab_core::cpu::Sreg;
use avrlab_core::{AvrMachine, Cpu, SimulationError, StopReason};
use core::convert::Infallible;
use gdbstub::common::Signal;
use gdbstub::stub::{BaseStopReason, GdbStub, SingleThreadStopReason};
use gdbstub::target::ext::base::singlethread::{
    SingleThreadBase, SingleThreadResume, SingleThreadSingleStep,
};
use gdbstub::target::ext::base::BaseOps;
use gdbstub::target::{Target, TargetError, TargetResult};
use std::net::{TcpListener, TcpStream};

/// Instructions executed between polls of the connection while running.
const RUN_SLICE: u64 = 4096;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ExecMode {
    Continue,
    Step,
}

pub struct AvrTarget {
    pub machine: AvrMachine,
    exec: ExecMode,
}

impl AvrTarget {
    pub fn new(machine: AvrMachine) -> Self {
        Self {
            machine,
            exec: ExecMode::Continue,
        }
    }

    /// Advance according to the last resume request. `None` means the
    /// target is still running.
    fn advance(&mut self) -> Option<SingleThreadStopReason<u32>> {
        match self.exec {
            ExecMode::Step => Some(match self.machine.step() {
                Ok(None) => BaseStopReason::DoneStep,
                Ok(Some(reason)) => stop_signal(reason),
                Err(e) => fault_signal(&e),
            }),
            ExecMode::Continue => match self.machine.run(Some(RUN_SLICE)) {
                Ok(StopReason::MaxSteps) => None,
                Ok(reason) => Some(stop_signal(reason)),
                Err(e) => Some(fault_signal(&e)),
            },
        }
    }
}

fn stop_signal(reason: StopReason) -> SingleThreadStopReason<u32> {
    match reason {
        StopReason::Breakpoint(_) => BaseStopReason::SwBreak(()),
        StopReason::StepDone | StopReason::MaxSteps => BaseStopReason::DoneStep,
        StopReason::Break | StopReason::Sleep => BaseStopReason::Signal(Signal::SIGTRAP),
    }
}

fn fault_signal(error: &SimulationError) -> SingleThreadStopReason<u32> {
    tracing::warn!("Target stopped: {}", error);
    let signal = match error {
        SimulationError::MemoryViolation(_) | SimulationError::PcOutOfBounds(_) => {
            Signal::SIGSEGV
        }
        SimulationError::DecodeError { .. } | SimulationError::Unsupported { .. } => {
            Signal::SIGILL
        }
    };
    BaseStopReason::Signal(signal)
}

impl Target for AvrTarget {
    type Arch = Avr;
    type Error = Infallible;

    fn base_ops(&mut self) -> BaseOps<'_, Self::Arch, Self::Error> {
        BaseOps::SingleThread(self)
    }

    fn support_breakpoints(
        &mut self,
    ) -> Option<gdbstub::target::ext::breakpoints::BreakpointsOps<'_, Self>> {
        Some(self)
    }
}

impl SingleThreadBase for AvrTarget {
    fn read_registers(&mut self, regs: &mut AvrRegs) -> TargetResult<(), Self> {
        let cpu = &self.machine.cpu;
        regs.r = cpu.regs;
        regs.sreg = cpu.sreg.bits();
        regs.sp = cpu.sp;
        regs.pc = cpu.get_pc();
        Ok(())
    }

    fn write_registers(&mut self, regs: &AvrRegs) -> TargetResult<(), Self> {
        let cpu = &mut self.machine.cpu;
        cpu.regs = regs.r;
        cpu.sreg = Sreg::from_bits_retain(regs.sreg);
        cpu.sp = regs.sp;
        cpu.set_pc(regs.pc);
        Ok(())
    }

    fn read_addrs(&mut self, start_addr: u32, data: &mut [u8]) -> TargetResult<usize, Self> {
        let mem = self
            .machine
            .read_memory(start_addr, data.len())
            .map_err(|_| TargetError::NonFatal)?;
        let len = mem.len().min(data.len());
        data[..len].copy_from_slice(&mem[..len]);
        Ok(len)
    }

    fn write_addrs(&mut self, start_addr: u32, data: &[u8]) -> TargetResult<(), Self> {
        self.machine
            .write_memory(start_addr, data)
            .map_err(|_| TargetError::NonFatal)?;
        Ok(())
    }

    fn support_resume(
        &mut self,
    ) -> Option<gdbstub::target::ext::base::singlethread::SingleThreadResumeOps<'_, Self>> {
        Some(self)
    }
}

impl SingleThreadResume for AvrTarget {
    fn resume(&mut self, _signal: Option<Signal>) -> Result<(), Self::Error> {
        self.exec = ExecMode::Continue;
        Ok(())
    }

    fn support_single_step(
        &mut self,
    ) -> Option<gdbstub::target::ext::base::singlethread::SingleThreadSingleStepOps<'_, Self>> {
        Some(self)
    }
}

impl SingleThreadSingleStep for AvrTarget {
    fn step(&mut self, _signal: Option<Signal>) -> Result<(), Self::Error> {
        self.exec = ExecMode::Step;
        Ok(())
    }
}

impl gdbstub::target::ext::breakpoints::Breakpoints for AvrTarget {
    fn support_sw_breakpoint(
        &mut self,
    ) -> Option<gdbstub::target::ext::breakpoints::SwBreakpointOps<'_, Self>> {
        Some(self)
    }
}

impl gdbstub::target::ext::breakpoints::SwBreakpoint for AvrTarget {
    fn add_sw_breakpoint(&mut self, addr: u32, _kind: usize) -> TargetResult<bool, Self> {
        self.machine.add_breakpoint(addr);
        Ok(true)
    }

    fn remove_sw_breakpoint(&mut self, addr: u32, _kind: usize) -> TargetResult<bool, Self> {
        Ok(self.machine.remove_breakpoint(addr))
    }
}

pub struct GdbServer {
    port: u16,
}

impl GdbServer {
    pub fn new(port: u16) -> Self {
        Self { port }
    }

    pub fn run(&self, machine: AvrMachine) -> anyhow::Result<()> {
        let listener = TcpListener::bind(format!("127.0.0.1:{}", self.port))?;
        tracing::info!("GDB server listening on 127.0.0.1:{}", self.port);

        let (stream, addr) = listener.accept()?;
        tracing::info!("GDB client connected from {}", addr);

        let mut target = AvrTarget::new(machine);
        let gdb = GdbStub::new(stream);

        match gdb.run_blocking::<GdbEventLoop>(&mut target) {
            Ok(reason) => tracing::info!("GDB session ended: {:?}", reason),
            Err(e) => tracing::error!("GDB session error: {:?}", e),
        }

        Ok(())
    }
}

struct GdbEventLoop;

impl gdbstub::stub::run_blocking::BlockingEventLoop for GdbEventLoop {
    type Target = AvrTarget;
    type Connection = TcpStream;
    type StopReason = SingleThreadStopReason<u32>;

    fn wait_for_stop_reason(
        target: &mut Self::Target,
        conn: &mut Self::Connection,
    ) -> Result<
        gdbstub::stub::run_blocking::Event<Self::StopReason>,
        gdbstub::stub::run_blocking::WaitForStopReasonError<
            <Self::Target as Target>::Error,
            <Self::Connection as gdbstub::conn::Connection>::Error,
        >,
    > {
        use gdbstub::stub::run_blocking::Event;
        use std::io::Read;

        loop {
            // Non-blocking peek for a Ctrl-C or a new packet
            let mut byte = [0];
            conn.set_nonblocking(true).ok();
            let incoming = match conn.read(&mut byte) {
                Ok(1) => Some(byte[0]),
                _ => None,
            };
            conn.set_nonblocking(false).ok();

            if let Some(b) = incoming {
                return Ok(Event::IncomingData(b));
            }

            if let Some(reason) = target.advance() {
                return Ok(Event::TargetStopped(reason));
            }
        }
    }

    fn on_interrupt(
        _target: &mut Self::Target,
    ) -> Result<Option<Self::StopReason>, <Self::Target as Target>::Error> {
        Ok(Some(BaseStopReason::Signal(Signal::SIGINT)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use avrlab_core::asm::Assembler;
    use avrlab_core::decoder::Instruction::*;
    use avrlab_core::models::XmegaA4U;
    use avrlab_core::DATA_SPACE_OFFSET;
    use gdbstub::target::ext::breakpoints::SwBreakpoint;

    fn target() -> AvrTarget {
        let program = Assembler::new()
            .emit(Ldi { rd: 16, k: 1 })
            .emit(Ldi { rd: 17, k: 2 })
            .emit(Nop)
            .emit(Break)
            .finish()
            .unwrap();
        let mut machine = AvrMachine::from_model(XmegaA4U::ATxmega128A4U);
        machine.load_firmware(&program.into_image()).unwrap();
        AvrTarget::new(machine)
    }

    #[test]
    fn test_target_register_access() {
        let mut target = target();

        let mut regs = AvrRegs::default();
        target
            .read_registers(&mut regs)
            .unwrap_or_else(|_| panic!("Failed to read registers"));
        assert_eq!(regs.sp, 0x3FFF);
        assert_eq!(regs.pc, 0);

        regs.r[1] = 0xA5;
        regs.pc = 4;
        regs.sreg = 0x02;
        target
            .write_registers(&regs)
            .unwrap_or_else(|_| panic!("Failed to write registers"));
        assert_eq!(target.machine.cpu.regs[1], 0xA5);
        assert_eq!(target.machine.cpu.get_pc(), 4);
        assert!(target.machine.cpu.sreg.contains(Sreg::Z));
    }

    #[test]
    fn test_target_memory_access() {
        let mut target = target();

        let mut data = [0u8; 2];
        let len = target
            .read_addrs(0, &mut data)
            .unwrap_or_else(|_| panic!("Failed to read flash"));
        assert_eq!(len, 2);
        assert_eq!(data, [0x01, 0xE0]);

        target
            .write_addrs(DATA_SPACE_OFFSET + 0x2000, &[7, 8])
            .unwrap_or_else(|_| panic!("Failed to write SRAM"));
        let mut back = [0u8; 2];
        target
            .read_addrs(DATA_SPACE_OFFSET + 0x2000, &mut back)
            .unwrap_or_else(|_| panic!("Failed to read SRAM"));
        assert_eq!(back, [7, 8]);

        assert!(target.read_addrs(DATA_SPACE_OFFSET + 0x9000, &mut back).is_err());
    }

    #[test]
    fn test_step_and_continue() {
        let mut target = target();

        target.step(None).unwrap();
        assert!(matches!(target.advance(), Some(BaseStopReason::DoneStep)));
        assert_eq!(target.machine.cpu.regs[16], 1);

        target.add_sw_breakpoint(4, 2).unwrap_or_else(|_| panic!("Failed to add breakpoint"));
        target.resume(None).unwrap();
        assert!(matches!(target.advance(), Some(BaseStopReason::SwBreak(()))));
        assert_eq!(target.machine.cpu.get_pc(), 4);

        assert!(target
            .remove_sw_breakpoint(4, 2)
            .unwrap_or_else(|_| panic!("Failed to remove breakpoint")));
        assert!(matches!(
            target.advance(),
            Some(BaseStopReason::Signal(Signal::SIGTRAP))
        ));
    }
}
