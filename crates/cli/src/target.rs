//! Machine construction from a device name, chip descriptor or system
//! manifest, plus the bounded run loop shared by the subcommands.

use anyhow::{anyhow, bail, Context, Result};
use avrlab_config::{ChipDescriptor, SystemManifest};
use avrlab_core::models::{XmegaA4U, DEFAULT_CLOCK_HZ};
use avrlab_core::{AvrMachine, SimulationError, StopReason};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::path::Path;
use std::time::{Duration, Instant};
use tracing::info;

/// Device used when neither a chip nor a system manifest is given.
pub const DEFAULT_MODEL: XmegaA4U = XmegaA4U::ATxmega128A4U;

/// Instructions per slice of the run loop; output is flushed and the wall
/// clock checked between slices.
const RUN_SLICE: u64 = 10_000;

pub struct Target {
    pub machine: AvrMachine,
    pub chip_name: String,
    pub clock_hz: u32,
    /// USART input queued before every run.
    pub stimulus: BTreeMap<String, Vec<u8>>,
}

impl Target {
    /// Queue input on the named USARTs.
    pub fn push_input(&mut self, input: &BTreeMap<String, Vec<u8>>) -> Result<()> {
        for (name, bytes) in input {
            let usart = self
                .machine
                .usart_mut(name)
                .ok_or_else(|| anyhow!("No USART named '{}' on {}", name, self.chip_name))?;
            usart.push_input(bytes);
        }
        Ok(())
    }
}

fn from_descriptor(chip: &ChipDescriptor) -> Result<Target> {
    Ok(Target {
        machine: AvrMachine::from_config(chip)?,
        chip_name: chip.name.clone(),
        clock_hz: chip.clock_hz.unwrap_or(DEFAULT_CLOCK_HZ),
        stimulus: BTreeMap::new(),
    })
}

fn from_model(model: XmegaA4U) -> Target {
    Target {
        machine: AvrMachine::from_model(model),
        chip_name: model.name().to_string(),
        clock_hz: model.layout().clock_hz,
        stimulus: BTreeMap::new(),
    }
}

fn is_yaml(path: &Path) -> bool {
    matches!(
        path.extension().and_then(|e| e.to_str()),
        Some("yaml") | Some("yml")
    )
}

/// A built-in device name or a chip descriptor path relative to `base_dir`.
pub fn resolve_chip(chip: &str, base_dir: &Path) -> Result<Target> {
    if let Some(model) = XmegaA4U::from_name(chip) {
        return Ok(from_model(model));
    }
    if is_yaml(Path::new(chip)) {
        let path = base_dir.join(chip);
        info!("Loading chip descriptor: {:?}", path);
        return from_descriptor(&ChipDescriptor::from_file(&path)?);
    }

    let known: Vec<&str> = XmegaA4U::ALL.iter().map(|m| m.name()).collect();
    bail!("Unknown device '{}' (known: {})", chip, known.join(", "))
}

pub fn load_system(path: &Path) -> Result<Target> {
    info!("Loading system manifest: {:?}", path);
    let manifest = SystemManifest::from_file(path)?;
    let dir = path.parent().unwrap_or_else(|| Path::new("."));

    let mut target = match manifest.chip_path(dir) {
        Some(chip_path) => {
            info!("Loading chip descriptor: {:?}", chip_path);
            let mut chip = ChipDescriptor::from_file(&chip_path)?;
            manifest.apply_overrides(&mut chip)?;
            from_descriptor(&chip)?
        }
        None => {
            if !manifest.memory_overrides.is_empty() {
                bail!(
                    "memory_overrides need a chip descriptor, '{}' is a built-in device",
                    manifest.chip
                );
            }
            resolve_chip(&manifest.chip, dir)?
        }
    };
    target.stimulus = manifest
        .stimulus()?
        .into_iter()
        .map(|(name, bytes)| (usart_name(&name), bytes))
        .collect();
    Ok(target)
}

pub fn build(chip: Option<&str>, system: Option<&Path>, base_dir: &Path) -> Result<Target> {
    match (chip, system) {
        (Some(_), Some(_)) => bail!("A chip and a system manifest are mutually exclusive"),
        (Some(chip), None) => resolve_chip(chip, base_dir),
        (None, Some(system)) => load_system(system),
        (None, None) => {
            info!("Using default device {}", DEFAULT_MODEL);
            Ok(from_model(DEFAULT_MODEL))
        }
    }
}

/// Hex SHA-256 of a firmware file.
pub fn firmware_hash(path: &Path) -> Result<String> {
    let bytes = std::fs::read(path).with_context(|| format!("Failed to read {:?}", path))?;
    let digest = Sha256::digest(&bytes);
    Ok(digest.iter().map(|b| format!("{:02x}", b)).collect())
}

/// `C0` and `USARTC0` both name USARTC0.
pub fn usart_name(name: &str) -> String {
    let upper = name.to_ascii_uppercase();
    if upper.starts_with("USART") {
        upper
    } else {
        format!("USART{}", upper)
    }
}

#[derive(Debug)]
pub enum Outcome {
    Stopped(StopReason),
    WallTime,
    Fault(SimulationError),
}

impl Outcome {
    pub fn stop_reason(&self) -> avrlab_config::StopReason {
        use avrlab_config::StopReason as R;
        match self {
            Outcome::Stopped(StopReason::Break) => R::Break,
            Outcome::Stopped(StopReason::Sleep) => R::Sleep,
            Outcome::Stopped(StopReason::Breakpoint(_)) => R::Breakpoint,
            Outcome::Stopped(StopReason::MaxSteps | StopReason::StepDone) => R::MaxSteps,
            Outcome::WallTime => R::WallTime,
            Outcome::Fault(SimulationError::MemoryViolation(_)) => R::MemoryViolation,
            Outcome::Fault(SimulationError::DecodeError { .. }) => R::DecodeError,
            Outcome::Fault(SimulationError::PcOutOfBounds(_)) => R::PcOutOfBounds,
            Outcome::Fault(SimulationError::Unsupported { .. }) => R::Unsupported,
        }
    }

    pub fn is_fault(&self) -> bool {
        matches!(self, Outcome::Fault(_))
    }

    pub fn message(&self) -> Option<String> {
        match self {
            Outcome::Fault(e) => Some(e.to_string()),
            _ => None,
        }
    }
}

/// Run in slices until the firmware stops, `max_steps` instructions have
/// executed or `wall_time` has elapsed. `after_slice` runs between slices.
pub fn execute(
    machine: &mut AvrMachine,
    max_steps: u64,
    wall_time: Option<Duration>,
    mut after_slice: impl FnMut(&mut AvrMachine),
) -> Outcome {
    let start = Instant::now();
    let mut remaining = max_steps;

    loop {
        if let Some(limit) = wall_time {
            if start.elapsed() >= limit {
                return Outcome::WallTime;
            }
        }

        let slice = remaining.min(RUN_SLICE);
        let result = machine.run(Some(slice));
        after_slice(machine);

        match result {
            Ok(StopReason::MaxSteps) => {
                remaining -= slice;
                if remaining == 0 {
                    return Outcome::Stopped(StopReason::MaxSteps);
                }
            }
            Ok(reason) => return Outcome::Stopped(reason),
            Err(e) => return Outcome::Fault(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_usart_name() {
        assert_eq!(usart_name("C0"), "USARTC0");
        assert_eq!(usart_name("usartd1"), "USARTD1");
    }

    #[test]
    fn test_resolve_chip() {
        let target = resolve_chip("atxmega32a4u", Path::new(".")).unwrap();
        assert_eq!(target.chip_name, "ATxmega32A4U");
        assert!(resolve_chip("ATmega328P", Path::new(".")).is_err());
    }

    #[test]
    fn test_execute_stops_at_step_budget() {
        // Erased flash is all nops
        let mut target = resolve_chip("ATxmega128A4U", Path::new(".")).unwrap();
        let mut slices = 0;
        let outcome = execute(&mut target.machine, 25_000, None, |_| slices += 1);
        assert!(matches!(outcome, Outcome::Stopped(StopReason::MaxSteps)));
        assert_eq!(slices, 3);
        assert_eq!(target.machine.steps(), 25_000);

        let outcome = execute(&mut target.machine, 100, Some(Duration::ZERO), |_| {});
        assert_eq!(outcome.stop_reason(), avrlab_config::StopReason::WallTime);
    }
}
