mod objdump;
mod target;
mod test_mode;

use anyhow::{anyhow, bail, Context, Result};
use avrlab_config::annotation::{parse_annotations, unescape};
use avrlab_core::metrics::PerformanceMetrics;
use avrlab_core::StopReason;
use clap::{Args, Parser, Subcommand};
use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use target::Outcome;
use tracing::{error, info, warn};

pub const EXIT_ASSERT_FAIL: u8 = 1;
pub const EXIT_CONFIG_ERROR: u8 = 2;
pub const EXIT_RUNTIME_ERROR: u8 = 3;

#[derive(Parser, Debug)]
#[command(name = "avrlab", author, version, about = "AVR XMEGA firmware simulator", long_about = None)]
struct Cli {
    /// Enable debug logging (loader, bus mapping, peripheral accesses)
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Enable instruction-level execution tracing
    #[arg(short, long, global = true)]
    trace: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run firmware and stream USART output to stdout
    Run(RunArgs),
    /// Run a YAML test script
    Test(test_mode::TestArgs),
    /// Write a built-in fixture image
    Fixture(FixtureArgs),
    /// Replay the `// TEST:` annotations of a source file against firmware
    Check(CheckArgs),
    /// Disassemble firmware
    Objdump(ObjdumpArgs),
    /// Serve the GDB remote protocol
    Gdb(GdbArgs),
}

#[derive(Args, Debug)]
struct TargetArgs {
    /// Built-in device name or chip descriptor (YAML)
    #[arg(long, conflicts_with = "system")]
    chip: Option<String>,

    /// Path to the system manifest (YAML)
    #[arg(short, long)]
    system: Option<PathBuf>,
}

impl TargetArgs {
    fn build(&self) -> Result<target::Target> {
        target::build(self.chip.as_deref(), self.system.as_deref(), Path::new("."))
    }
}

#[derive(Args, Debug)]
struct RunArgs {
    /// Path to the firmware (ELF, Intel HEX or raw binary)
    #[arg(short, long)]
    firmware: PathBuf,

    #[command(flatten)]
    target: TargetArgs,

    /// USART fed with --input and echoed to stdout
    #[arg(long, default_value = "C0")]
    usart: String,

    /// Bytes queued on the USART before the run, C escapes allowed
    #[arg(long)]
    input: Option<String>,

    /// Maximum number of instructions to execute
    #[arg(long, default_value = "1000000")]
    max_steps: u64,

    /// Write a JSON machine snapshot here when the run stops
    #[arg(long)]
    snapshot: Option<PathBuf>,
}

#[derive(Args, Debug)]
struct FixtureArgs {
    /// Fixture name
    #[arg(required_unless_present = "list")]
    name: Option<String>,

    /// Output file (defaults to <name>.bin)
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// List the built-in fixtures
    #[arg(long)]
    list: bool,
}

#[derive(Args, Debug)]
struct CheckArgs {
    /// Source file carrying `// TEST:` annotations
    source: PathBuf,

    /// Firmware built from the source
    #[arg(short, long)]
    firmware: PathBuf,

    #[command(flatten)]
    target: TargetArgs,

    /// Instruction budget per annotation
    #[arg(long, default_value = "1000000")]
    max_steps: u64,
}

#[derive(Args, Debug)]
struct ObjdumpArgs {
    /// Firmware to disassemble
    firmware: PathBuf,
}

#[derive(Args, Debug)]
struct GdbArgs {
    #[arg(short, long)]
    firmware: PathBuf,

    #[command(flatten)]
    target: TargetArgs,

    /// TCP port on 127.0.0.1
    #[arg(long, default_value = "1234")]
    port: u16,
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    // Logs go to stderr, stdout carries USART output
    tracing_subscriber::fmt()
        .with_max_level(log_level(cli.verbose, cli.trace))
        .with_writer(std::io::stderr)
        .init();

    let result = match cli.command {
        Command::Run(args) => run(args),
        Command::Test(args) => test_mode::run_test(args),
        Command::Fixture(args) => fixture(args),
        Command::Check(args) => check(args),
        Command::Objdump(args) => objdump(args),
        Command::Gdb(args) => gdb(args),
    };

    match result {
        Ok(code) => code,
        Err(e) => test_mode::config_error(&e),
    }
}

fn log_level(verbose: bool, trace: bool) -> tracing::Level {
    if trace {
        tracing::Level::TRACE
    } else if verbose {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    }
}

fn load(target: &mut target::Target, firmware: &Path) -> Result<()> {
    info!("Loading firmware: {:?}", firmware);
    let image = avrlab_loader::load_firmware(firmware)?;
    target
        .machine
        .load_firmware(&image)
        .with_context(|| format!("Failed to load {:?} into {}", firmware, target.chip_name))?;
    info!("Entry Point: {:#x}", image.entry_point);
    Ok(())
}

fn run(args: RunArgs) -> Result<ExitCode> {
    let mut target = args.target.build()?;
    let metrics = Arc::new(PerformanceMetrics::new());
    target.machine.observers.push(metrics.clone());
    load(&mut target, &args.firmware)?;

    let usart = target::usart_name(&args.usart);
    let mut input = std::mem::take(&mut target.stimulus);
    if let Some(text) = &args.input {
        let bytes = unescape(text).with_context(|| format!("Invalid --input {:?}", text))?;
        input.entry(usart.clone()).or_default().extend(bytes);
    }
    target.push_input(&input)?;

    let rx = target
        .machine
        .usart_mut(&usart)
        .ok_or_else(|| anyhow!("No USART named '{}' on {}", usart, target.chip_name))?
        .connect_tx();

    info!("Running on {} for at most {} steps", target.chip_name, args.max_steps);
    let mut stdout = std::io::stdout().lock();
    let mut write_error = None;
    let outcome = target::execute(&mut target.machine, args.max_steps, None, |_| {
        let bytes: Vec<u8> = rx.try_iter().collect();
        if let Err(e) = stdout.write_all(&bytes).and_then(|_| stdout.flush()) {
            write_error.get_or_insert(e);
        }
    });
    if let Some(e) = write_error {
        warn!("Failed to write USART output: {}", e);
    }

    let summary = metrics.summary(target.clock_hz);
    info!(
        "Stopped after {} instructions, {} cycles ({:.6} s simulated, {:.0} IPS)",
        summary.instructions,
        summary.cycles,
        summary.simulated_seconds,
        summary.instructions_per_second
    );

    if let Some(path) = &args.snapshot {
        let mut value = serde_json::to_value(target.machine.snapshot())?;
        if let Some(obj) = value.as_object_mut() {
            obj.insert("type".into(), "avrlab_snapshot".into());
            obj.insert("chip".into(), target.chip_name.clone().into());
            obj.insert(
                "stop_reason".into(),
                serde_json::to_value(outcome.stop_reason())?,
            );
        }
        std::fs::write(path, serde_json::to_string_pretty(&value)?)
            .with_context(|| format!("Failed to write snapshot {:?}", path))?;
        info!("Snapshot written to {:?}", path);
    }

    match outcome {
        Outcome::Fault(e) => {
            error!("Simulation error: {}", e);
            Ok(ExitCode::from(EXIT_RUNTIME_ERROR))
        }
        other => {
            info!("Stop reason: {:?}", other.stop_reason());
            Ok(ExitCode::SUCCESS)
        }
    }
}

fn fixture(args: FixtureArgs) -> Result<ExitCode> {
    if args.list {
        let mut stdout = std::io::stdout().lock();
        for f in avrlab_firmware::fixtures() {
            writeln!(stdout, "{:<14} {}", f.name, f.description)?;
            writeln!(stdout, "{:<14} {}", "", f.annotation)?;
        }
        return Ok(ExitCode::SUCCESS);
    }

    let name = args.name.context("A fixture name is required")?;
    let Some(fixture) = avrlab_firmware::find(&name) else {
        let known: Vec<&str> = avrlab_firmware::fixtures().iter().map(|f| f.name).collect();
        bail!("Unknown fixture '{}' (known: {})", name, known.join(", "));
    };

    let program = fixture
        .build()
        .with_context(|| format!("Failed to assemble fixture '{}'", name))?;
    let output = args
        .output
        .unwrap_or_else(|| PathBuf::from(format!("{}.bin", name)));
    std::fs::write(&output, &program.bytes)
        .with_context(|| format!("Failed to write {:?}", output))?;
    info!("Wrote {} ({} bytes) to {:?}", name, program.bytes.len(), output);
    Ok(ExitCode::SUCCESS)
}

fn check(args: CheckArgs) -> Result<ExitCode> {
    let source = std::fs::read_to_string(&args.source)
        .with_context(|| format!("Failed to read {:?}", args.source))?;
    let annotations = parse_annotations(&source)
        .with_context(|| format!("Invalid annotation in {:?}", args.source))?;
    if annotations.is_empty() {
        bail!("{:?} has no `// TEST:` annotations", args.source);
    }

    let mut failures = 0;
    let mut stdout = std::io::stdout().lock();
    for annotation in &annotations {
        let mut target = args.target.build()?;
        load(&mut target, &args.firmware)?;
        let mut input = BTreeMap::new();
        input.insert(annotation.usart.clone(), annotation.input.clone());
        target.push_input(&input)?;

        let outcome = target::execute(&mut target.machine, args.max_steps, None, |_| {});
        let output = target
            .machine
            .usart(&annotation.usart)
            .map(|u| u.output().to_vec())
            .unwrap_or_default();

        let verdict = match &outcome {
            Outcome::Stopped(StopReason::Break) if output == annotation.output => None,
            Outcome::Stopped(StopReason::Break) => Some(format!(
                "expected {:?}, got {:?}",
                String::from_utf8_lossy(&annotation.output),
                String::from_utf8_lossy(&output)
            )),
            other => Some(format!(
                "stopped with {:?} after {:?}",
                other.stop_reason(),
                String::from_utf8_lossy(&output)
            )),
        };

        match verdict {
            None => writeln!(stdout, "PASS line {}", annotation.line)?,
            Some(reason) => {
                failures += 1;
                writeln!(stdout, "FAIL line {}: {}", annotation.line, reason)?;
            }
        }
    }

    writeln!(
        stdout,
        "{} of {} annotations passed",
        annotations.len() - failures,
        annotations.len()
    )?;
    if failures == 0 {
        Ok(ExitCode::SUCCESS)
    } else {
        Ok(ExitCode::from(EXIT_ASSERT_FAIL))
    }
}

fn objdump(args: ObjdumpArgs) -> Result<ExitCode> {
    let image = avrlab_loader::load_firmware(&args.firmware)?;
    let mut stdout = std::io::stdout().lock();
    writeln!(stdout, "{}:\tfile format avr", args.firmware.display())?;
    stdout.write_all(objdump::listing(&image).as_bytes())?;
    Ok(ExitCode::SUCCESS)
}

fn gdb(args: GdbArgs) -> Result<ExitCode> {
    let mut target = args.target.build()?;
    load(&mut target, &args.firmware)?;
    avrlab_gdbstub::GdbServer::new(args.port).run(target.machine)?;
    Ok(ExitCode::SUCCESS)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_level() {
        assert_eq!(log_level(false, false), tracing::Level::INFO);
        assert_eq!(log_level(true, false), tracing::Level::DEBUG);
        assert_eq!(log_level(false, true), tracing::Level::TRACE);
        assert_eq!(log_level(true, true), tracing::Level::TRACE);
    }

    #[test]
    fn test_verbose_flag_is_global() {
        let cli = Cli::parse_from(["avrlab", "fixture", "--list", "-v"]);
        assert!(cli.verbose);
        assert!(!cli.trace);
    }
}
