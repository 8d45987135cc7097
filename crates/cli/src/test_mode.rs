//! `avrlab test`: run a YAML test script and report the result as JSON and
//! JUnit XML.

use crate::target::{self, Outcome};
use crate::{EXIT_ASSERT_FAIL, EXIT_CONFIG_ERROR, EXIT_RUNTIME_ERROR};
use anyhow::{bail, Context, Result};
use avrlab_config::{StopReason, TestAssertion, TestScript, DEFAULT_USART};
use avrlab_core::AvrMachine;
use clap::Args;
use serde::Serialize;
use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::time::{Duration, Instant};
use tracing::{error, info};

/// Upper bound on `limits.max_steps` accepted from a script.
pub const MAX_ALLOWED_STEPS: u64 = 50_000_000;

pub const RESULT_SCHEMA_VERSION: &str = "1.0";

#[derive(Args, Debug)]
pub struct TestArgs {
    /// Path to the test script (YAML)
    #[arg(long)]
    pub script: PathBuf,

    /// Directory receiving result.json and junit.xml
    #[arg(long)]
    pub output_dir: Option<PathBuf>,

    /// Write a JUnit XML report to this file
    #[arg(long)]
    pub junit: Option<PathBuf>,

    /// Do not echo USART output to stdout
    #[arg(long)]
    pub no_uart_stdout: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    Pass,
    Fail,
    Error,
}

#[derive(Debug, Clone, Serialize)]
pub struct AssertionResult {
    pub assertion: TestAssertion,
    pub passed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct ResultConfig {
    pub firmware: String,
    pub chip: Option<String>,
    pub system: Option<String>,
    pub max_steps: u64,
    pub wall_time_ms: Option<u64>,
}

#[derive(Debug, Serialize)]
pub struct TestResult {
    pub result_schema_version: &'static str,
    pub status: Status,
    pub stop_reason: StopReason,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stop_message: Option<String>,
    pub steps: u64,
    pub cycles: u64,
    pub duration_ms: u128,
    pub firmware_hash: String,
    /// Output per USART, lossily decoded as UTF-8.
    pub uart: BTreeMap<String, String>,
    pub assertions: Vec<AssertionResult>,
    pub config: ResultConfig,
}

impl TestResult {
    pub fn exit_code(&self) -> ExitCode {
        match self.status {
            Status::Pass => ExitCode::SUCCESS,
            Status::Fail => ExitCode::from(EXIT_ASSERT_FAIL),
            Status::Error => ExitCode::from(EXIT_RUNTIME_ERROR),
        }
    }
}

fn usart_output<'a>(
    uart: &'a BTreeMap<String, Vec<u8>>,
    usart: &Option<String>,
) -> Result<&'a [u8], String> {
    let name = usart
        .as_deref()
        .map(target::usart_name)
        .unwrap_or_else(|| DEFAULT_USART.to_string());
    uart.get(&name)
        .map(|bytes| bytes.as_slice())
        .ok_or_else(|| format!("no USART named '{}'", name))
}

pub fn evaluate(
    assertion: &TestAssertion,
    uart: &BTreeMap<String, Vec<u8>>,
    stop_reason: StopReason,
) -> AssertionResult {
    let verdict: Result<(), String> = match assertion {
        TestAssertion::UartEquals(a) => usart_output(uart, &a.usart).and_then(|out| {
            if out == a.uart_equals.as_bytes() {
                Ok(())
            } else {
                Err(format!(
                    "expected {:?}, got {:?}",
                    a.uart_equals,
                    String::from_utf8_lossy(out)
                ))
            }
        }),
        TestAssertion::UartContains(a) => usart_output(uart, &a.usart).and_then(|out| {
            if String::from_utf8_lossy(out).contains(&a.uart_contains) {
                Ok(())
            } else {
                Err(format!("output does not contain {:?}", a.uart_contains))
            }
        }),
        TestAssertion::UartRegex(a) => usart_output(uart, &a.usart).and_then(|out| {
            match regex::Regex::new(&a.uart_regex) {
                Ok(re) if re.is_match(&String::from_utf8_lossy(out)) => Ok(()),
                Ok(_) => Err(format!("output does not match /{}/", a.uart_regex)),
                Err(e) => Err(format!("invalid regex: {}", e)),
            }
        }),
        TestAssertion::ExpectedStopReason(a) => {
            if a.expected_stop_reason == stop_reason {
                Ok(())
            } else {
                Err(format!(
                    "expected stop reason {:?}, got {:?}",
                    a.expected_stop_reason, stop_reason
                ))
            }
        }
    };

    AssertionResult {
        assertion: assertion.clone(),
        passed: verdict.is_ok(),
        message: verdict.err(),
    }
}

/// A fault is an error unless the script asserts on the stop reason.
pub fn status(outcome: &Outcome, assertions: &[AssertionResult]) -> Status {
    let expects_stop = assertions
        .iter()
        .any(|r| matches!(r.assertion, TestAssertion::ExpectedStopReason(_)));

    if outcome.is_fault() && !expects_stop {
        Status::Error
    } else if assertions.iter().all(|r| r.passed) {
        Status::Pass
    } else {
        Status::Fail
    }
}

fn collect_output(machine: &AvrMachine) -> BTreeMap<String, Vec<u8>> {
    machine
        .bus
        .usart_names()
        .into_iter()
        .filter_map(|name| {
            let output = machine.usart(&name)?.output().to_vec();
            Some((name, output))
        })
        .collect()
}

fn assertion_kind(assertion: &TestAssertion) -> &'static str {
    match assertion {
        TestAssertion::UartEquals(_) => "uart_equals",
        TestAssertion::UartContains(_) => "uart_contains",
        TestAssertion::UartRegex(_) => "uart_regex",
        TestAssertion::ExpectedStopReason(_) => "expected_stop_reason",
    }
}

fn xml_escape(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&apos;"),
            c if (c as u32) < 0x20 && !matches!(c, '\n' | '\r' | '\t') => {
                out.push_str(&format!("&#x{:x};", c as u32))
            }
            c => out.push(c),
        }
    }
    out
}

pub fn junit_xml(result: &TestResult) -> String {
    let time = result.duration_ms as f64 / 1000.0;
    let mut cases = Vec::new();

    if result.status == Status::Error {
        cases.push(format!(
            "    <testcase name=\"run\" classname=\"avrlab\">\n      <error message=\"{}\"/>\n    </testcase>\n",
            xml_escape(result.stop_message.as_deref().unwrap_or("simulation error"))
        ));
    }
    for (i, r) in result.assertions.iter().enumerate() {
        let name = format!("assertion {}: {}", i + 1, assertion_kind(&r.assertion));
        let body = match (&r.passed, &r.message) {
            (false, Some(msg)) => format!("      <failure message=\"{}\"/>\n", xml_escape(msg)),
            (false, None) => "      <failure/>\n".to_string(),
            (true, _) => String::new(),
        };
        cases.push(format!(
            "    <testcase name=\"{}\" classname=\"avrlab\">\n{}    </testcase>\n",
            xml_escape(&name),
            body
        ));
    }
    if cases.is_empty() {
        cases.push("    <testcase name=\"run\" classname=\"avrlab\"/>\n".to_string());
    }

    let failures = result.assertions.iter().filter(|r| !r.passed).count();
    let errors = usize::from(result.status == Status::Error);
    format!(
        "<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n<testsuites>\n  <testsuite name=\"avrlab test\" tests=\"{}\" failures=\"{}\" errors=\"{}\" time=\"{:.3}\">\n{}  </testsuite>\n</testsuites>\n",
        cases.len(),
        failures,
        errors,
        time,
        cases.concat()
    )
}

fn write_file(path: &Path, contents: &str) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {:?}", parent))?;
        }
    }
    std::fs::write(path, contents).with_context(|| format!("Failed to write {:?}", path))
}

pub fn run_test(args: TestArgs) -> Result<ExitCode> {
    let script = TestScript::from_file(&args.script)?;
    if script.limits.max_steps > MAX_ALLOWED_STEPS {
        bail!(
            "limits.max_steps {} exceeds the allowed maximum of {}",
            script.limits.max_steps,
            MAX_ALLOWED_STEPS
        );
    }

    let base_dir = args.script.parent().unwrap_or_else(|| Path::new("."));
    let firmware_path = base_dir.join(&script.inputs.firmware);
    let system_path = script.inputs.system.as_ref().map(|s| base_dir.join(s));

    let mut target = target::build(
        script.inputs.chip.as_deref(),
        system_path.as_deref(),
        base_dir,
    )?;

    let firmware_hash = target::firmware_hash(&firmware_path)?;
    let image = match avrlab_loader::load_firmware(&firmware_path) {
        Ok(image) => image,
        Err(e) => {
            error!("{:#}", e);
            return Ok(ExitCode::from(EXIT_RUNTIME_ERROR));
        }
    };
    if let Err(e) = target.machine.load_firmware(&image) {
        error!("Failed to load firmware: {}", e);
        return Ok(ExitCode::from(EXIT_RUNTIME_ERROR));
    }

    // Script stimulus replaces manifest input for the same USART
    let mut stimulus = std::mem::take(&mut target.stimulus);
    for (name, bytes) in script.stimulus.decoded()? {
        stimulus.insert(target::usart_name(&name), bytes);
    }
    target.push_input(&stimulus)?;

    info!(
        "Running {:?} on {} (max {} steps)",
        firmware_path, target.chip_name, script.limits.max_steps
    );
    let started = Instant::now();
    let outcome = target::execute(
        &mut target.machine,
        script.limits.max_steps,
        script.limits.wall_time_ms.map(Duration::from_millis),
        |_| {},
    );
    let duration_ms = started.elapsed().as_millis();
    let stop_reason = outcome.stop_reason();
    info!("Stopped: {:?}", stop_reason);

    let uart = collect_output(&target.machine);
    let assertions: Vec<AssertionResult> = script
        .assertions
        .iter()
        .map(|a| evaluate(a, &uart, stop_reason))
        .collect();
    let status = status(&outcome, &assertions);

    let result = TestResult {
        result_schema_version: RESULT_SCHEMA_VERSION,
        status,
        stop_reason,
        stop_message: outcome.message(),
        steps: target.machine.steps(),
        cycles: avrlab_core::Cpu::cycles(&target.machine.cpu),
        duration_ms,
        firmware_hash,
        uart: uart
            .iter()
            .map(|(k, v)| (k.clone(), String::from_utf8_lossy(v).into_owned()))
            .collect(),
        assertions,
        config: ResultConfig {
            firmware: firmware_path.display().to_string(),
            chip: script.inputs.chip.clone(),
            system: system_path.map(|p| p.display().to_string()),
            max_steps: script.limits.max_steps,
            wall_time_ms: script.limits.wall_time_ms,
        },
    };

    if !args.no_uart_stdout {
        let mut stdout = std::io::stdout().lock();
        if let Some(bytes) = uart.get(DEFAULT_USART) {
            stdout.write_all(bytes)?;
        }
        stdout.flush()?;
    }

    for failed in result.assertions.iter().filter(|r| !r.passed) {
        error!(
            "Assertion failed: {}",
            failed.message.as_deref().unwrap_or("no detail")
        );
    }
    if let Some(message) = &result.stop_message {
        error!("Simulation error: {}", message);
    }

    if let Some(dir) = &args.output_dir {
        let json = serde_json::to_string_pretty(&result)?;
        write_file(&dir.join("result.json"), &json)?;
        write_file(&dir.join("junit.xml"), &junit_xml(&result))?;
        info!("Wrote results to {:?}", dir);
    }
    if let Some(path) = &args.junit {
        write_file(path, &junit_xml(&result))?;
    }

    info!("Status: {:?}", result.status);
    Ok(result.exit_code())
}

/// Exit code for a script that could not be loaded.
pub fn config_error(e: &anyhow::Error) -> ExitCode {
    error!("Configuration error: {:#}", e);
    ExitCode::from(EXIT_CONFIG_ERROR)
}
