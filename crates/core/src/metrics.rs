use crate::SimulationObserver;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Instant;

/// Counts retired instructions and core cycles of a run.
#[derive(Debug)]
pub struct PerformanceMetrics {
    instruction_count: AtomicU64,
    cycle_count: AtomicU64,
    start_time: Mutex<Instant>,
}

#[derive(Debug, Clone, Copy, Serialize, PartialEq)]
pub struct MetricsSummary {
    pub instructions: u64,
    pub cycles: u64,
    pub instructions_per_second: f64,
    /// Time the cycles take on the device at the given clock.
    pub simulated_seconds: f64,
}

impl Default for PerformanceMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl PerformanceMetrics {
    pub fn new() -> Self {
        Self {
            instruction_count: AtomicU64::new(0),
            cycle_count: AtomicU64::new(0),
            start_time: Mutex::new(Instant::now()),
        }
    }

    pub fn reset(&self) {
        self.instruction_count.store(0, Ordering::SeqCst);
        self.cycle_count.store(0, Ordering::SeqCst);
        if let Ok(mut start) = self.start_time.lock() {
            *start = Instant::now();
        }
    }

    pub fn get_instructions(&self) -> u64 {
        self.instruction_count.load(Ordering::SeqCst)
    }

    pub fn get_cycles(&self) -> u64 {
        self.cycle_count.load(Ordering::SeqCst)
    }

    pub fn get_ips(&self) -> f64 {
        let elapsed = match self.start_time.lock() {
            Ok(start) => start.elapsed().as_secs_f64(),
            Err(_) => 0.0,
        };
        if elapsed > 0.0 {
            self.get_instructions() as f64 / elapsed
        } else {
            0.0
        }
    }

    pub fn summary(&self, clock_hz: u32) -> MetricsSummary {
        let cycles = self.get_cycles();
        MetricsSummary {
            instructions: self.get_instructions(),
            cycles,
            instructions_per_second: self.get_ips(),
            simulated_seconds: if clock_hz == 0 {
                0.0
            } else {
                cycles as f64 / clock_hz as f64
            },
        }
    }
}

impl SimulationObserver for PerformanceMetrics {
    fn on_simulation_start(&self) {
        self.reset();
    }

    fn on_step_start(&self, _pc: u32, _opcode: u16) {
        self.instruction_count.fetch_add(1, Ordering::SeqCst);
    }

    fn on_step_end(&self, cycles: u32) {
        self.cycle_count.fetch_add(cycles as u64, Ordering::SeqCst);
    }
}
