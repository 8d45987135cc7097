use std::path::{Path, PathBuf};
use std::process::{Command, Output};
use std::time::{SystemTime, UNIX_EPOCH};

fn temp_dir(prefix: &str) -> PathBuf {
    let nonce = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap()
        .as_nanos();
    let dir = std::env::temp_dir()
        .join("avrlab-tests")
        .join(format!("{}-{}", prefix, nonce));
    std::fs::create_dir_all(&dir).expect("Failed to create temp dir");
    dir
}

fn avrlab(args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_avrlab"))
        .args(args)
        .output()
        .expect("Failed to execute command")
}

fn write_fixture(dir: &Path, name: &str) -> PathBuf {
    let path = dir.join(format!("{}.bin", name));
    let output = avrlab(&["fixture", name, "--output", path.to_str().unwrap()]);
    assert!(output.status.success(), "fixture {} failed", name);
    path
}

fn write_script(dir: &Path, contents: &str) -> PathBuf {
    let path = dir.join("script.yaml");
    std::fs::write(&path, contents).expect("Failed to write script");
    path
}

fn run_script(script: &Path) -> Output {
    avrlab(&["test", "--script", script.to_str().unwrap(), "--no-uart-stdout"])
}

#[test]
fn test_cli_test_mode_outputs() {
    let dir = temp_dir("outputs");
    write_fixture(&dir, "hello_world");

    // Firmware path is resolved relative to the script
    let script = write_script(
        &dir,
        r#"
schema_version: "1.0"
inputs:
  firmware: "hello_world.bin"
  chip: "ATxmega128A4U"
limits:
  max_steps: 100000
assertions:
  - uart_equals: "Hello World!\n"
  - uart_regex: "^Hello"
  - expected_stop_reason: break
"#,
    );
    let output_dir = dir.join("artifacts");

    let output = avrlab(&[
        "test",
        "--script",
        script.to_str().unwrap(),
        "--no-uart-stdout",
        "--output-dir",
        output_dir.to_str().unwrap(),
    ]);
    assert!(output.status.success());
    assert!(output.stdout.is_empty());

    let junit = std::fs::read_to_string(output_dir.join("junit.xml")).unwrap();
    assert!(junit.contains("<testsuite"));
    assert!(junit.contains("<testcase"));
    assert!(!junit.contains("<failure"));

    let result_content = std::fs::read_to_string(output_dir.join("result.json")).unwrap();
    let result: serde_json::Value = serde_json::from_str(&result_content).unwrap();

    assert_eq!(result["status"], "pass");
    assert_eq!(result["stop_reason"], "break");
    assert_eq!(result["firmware_hash"].as_str().unwrap().len(), 64);
    assert_eq!(result["uart"]["USARTC0"], "Hello World!\n");
    assert!(result["steps"].as_u64().unwrap() > 0);
    assert!(result["cycles"].as_u64().unwrap() >= result["steps"].as_u64().unwrap());
    assert_eq!(result["assertions"].as_array().unwrap().len(), 3);
    assert!(result["config"]["firmware"]
        .as_str()
        .unwrap()
        .contains("hello_world.bin"));

    let _ = std::fs::remove_dir_all(&dir);
}

#[test]
fn test_cli_test_mode_junit_flag_writes_file() {
    let dir = temp_dir("junit");
    let firmware = write_fixture(&dir, "echo");
    let script = write_script(
        &dir,
        &format!(
            r#"
schema_version: "1.0"
inputs:
  firmware: "{}"
limits:
  max_steps: 1
assertions:
  - expected_stop_reason: max_steps
"#,
            firmware.to_str().unwrap()
        ),
    );
    let junit_path = dir.join("reports").join("junit.xml");

    let output = avrlab(&[
        "test",
        "--script",
        script.to_str().unwrap(),
        "--no-uart-stdout",
        "--junit",
        junit_path.to_str().unwrap(),
    ]);
    assert!(output.status.success());

    let junit = std::fs::read_to_string(&junit_path).unwrap();
    assert!(junit.contains("<testsuite"));
    assert!(junit.contains("avrlab test"));

    let _ = std::fs::remove_dir_all(&dir);
}

#[test]
fn test_cli_test_mode_stimulus_and_uart_stdout() {
    let dir = temp_dir("stimulus");
    write_fixture(&dir, "echo");
    let script = write_script(
        &dir,
        r#"
schema_version: "1.0"
inputs:
  firmware: "echo.bin"
stimulus:
  usart:
    C0: 'ping\0'
limits:
  max_steps: 100000
assertions:
  - uart_contains: "ping"
  - expected_stop_reason: break
"#,
    );

    let output = avrlab(&["test", "--script", script.to_str().unwrap()]);
    assert!(output.status.success());
    assert_eq!(output.stdout, b"ping\0");

    let _ = std::fs::remove_dir_all(&dir);
}

#[test]
fn test_cli_test_mode_wall_time() {
    let dir = temp_dir("walltime");
    write_fixture(&dir, "echo");
    // Without input the echo loop polls forever
    let script = write_script(
        &dir,
        r#"
schema_version: "1.0"
inputs:
  firmware: "echo.bin"
limits:
  max_steps: 10000000
  wall_time_ms: 0
assertions:
  - expected_stop_reason: wall_time
"#,
    );

    let output = run_script(&script);
    assert!(output.status.success());

    let _ = std::fs::remove_dir_all(&dir);
}

#[test]
fn test_cli_test_mode_memory_violation() {
    let dir = temp_dir("memviol");
    // sts 0x9000, r0
    std::fs::write(dir.join("bad.bin"), [0x00, 0x92, 0x00, 0x90]).unwrap();
    let script = write_script(
        &dir,
        r#"
schema_version: "1.0"
inputs:
  firmware: "bad.bin"
limits:
  max_steps: 1000
assertions:
  - expected_stop_reason: memory_violation
"#,
    );

    let output = run_script(&script);
    assert!(output.status.success());

    let _ = std::fs::remove_dir_all(&dir);
}

#[test]
fn test_cli_test_mode_unexpected_fault_is_error() {
    let dir = temp_dir("fault");
    std::fs::write(dir.join("bad.bin"), [0x00, 0x92, 0x00, 0x90]).unwrap();
    let script = write_script(
        &dir,
        r#"
schema_version: "1.0"
inputs:
  firmware: "bad.bin"
limits:
  max_steps: 1000
"#,
    );
    let output_dir = dir.join("out");

    let output = avrlab(&[
        "test",
        "--script",
        script.to_str().unwrap(),
        "--output-dir",
        output_dir.to_str().unwrap(),
    ]);
    assert_eq!(output.status.code(), Some(3)); // EXIT_RUNTIME_ERROR

    let result: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(output_dir.join("result.json")).unwrap())
            .unwrap();
    assert_eq!(result["status"], "error");
    assert_eq!(result["stop_reason"], "memory_violation");
    assert!(result["stop_message"].as_str().unwrap().contains("0x9000"));

    let junit = std::fs::read_to_string(output_dir.join("junit.xml")).unwrap();
    assert!(junit.contains("<error"));

    let _ = std::fs::remove_dir_all(&dir);
}

#[test]
fn test_cli_test_mode_max_steps_guard() {
    let dir = temp_dir("huge");
    write_fixture(&dir, "echo");
    let script = write_script(
        &dir,
        r#"
schema_version: "1.0"
inputs:
  firmware: "echo.bin"
limits:
  max_steps: 60000000
"#,
    );

    let output = avrlab(&["test", "--script", script.to_str().unwrap()]);
    assert!(!output.status.success());
    assert_eq!(output.status.code(), Some(2)); // EXIT_CONFIG_ERROR

    let _ = std::fs::remove_dir_all(&dir);
}

#[test]
fn test_cli_test_mode_regex_fail() {
    let dir = temp_dir("regex-fail");
    write_fixture(&dir, "hello_world");
    let script = write_script(
        &dir,
        r#"
schema_version: "1.0"
inputs:
  firmware: "hello_world.bin"
limits:
  max_steps: 100000
assertions:
  - uart_regex: "^ThisTextWillNeverBeFound$"
"#,
    );

    let output = avrlab(&["test", "--script", script.to_str().unwrap()]);
    assert!(!output.status.success());
    assert_eq!(output.status.code(), Some(1)); // EXIT_ASSERT_FAIL

    let _ = std::fs::remove_dir_all(&dir);
}

#[test]
fn test_cli_run_streams_output_and_writes_snapshot() {
    let dir = temp_dir("run");
    let firmware = write_fixture(&dir, "hello_world");
    let snapshot = dir.join("snapshot.json");

    let output = avrlab(&[
        "run",
        "--firmware",
        firmware.to_str().unwrap(),
        "--chip",
        "ATxmega32A4U",
        "--snapshot",
        snapshot.to_str().unwrap(),
    ]);
    assert!(output.status.success());
    assert_eq!(output.stdout, b"Hello World!\n");

    let value: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(&snapshot).unwrap()).unwrap();
    assert_eq!(value["type"], "avrlab_snapshot");
    assert_eq!(value["chip"], "ATxmega32A4U");
    assert_eq!(value["stop_reason"], "break");
    assert_eq!(value["cpu"]["registers"].as_array().unwrap().len(), 32);
    assert_eq!(value["peripherals"]["USARTC0"]["output"], "Hello World!\n");

    let _ = std::fs::remove_dir_all(&dir);
}

#[test]
fn test_cli_run_with_input() {
    let dir = temp_dir("run-input");
    let firmware = write_fixture(&dir, "echo");

    let output = avrlab(&[
        "run",
        "--firmware",
        firmware.to_str().unwrap(),
        "--input",
        "ok\\n\\0",
    ]);
    assert!(output.status.success());
    assert_eq!(output.stdout, b"ok\n\0");

    let _ = std::fs::remove_dir_all(&dir);
}

#[test]
fn test_cli_verbose_enables_debug_logs() {
    let dir = temp_dir("verbose");
    let firmware = write_fixture(&dir, "hello_world");
    let firmware = firmware.to_str().unwrap();

    let quiet = avrlab(&["run", "--firmware", firmware]);
    assert!(quiet.status.success());
    assert!(!String::from_utf8_lossy(&quiet.stderr).contains("DEBUG"));

    let verbose = avrlab(&["-v", "run", "--firmware", firmware]);
    assert!(verbose.status.success());
    assert_eq!(verbose.stdout, b"Hello World!\n");
    let stderr = String::from_utf8_lossy(&verbose.stderr);
    assert!(stderr.contains("DEBUG"), "{}", stderr);
    assert!(!stderr.contains("TRACE"), "{}", stderr);

    let _ = std::fs::remove_dir_all(&dir);
}

#[test]
fn test_cli_fixture_list_and_unknown() {
    let output = avrlab(&["fixture", "--list"]);
    assert!(output.status.success());
    let listing = String::from_utf8(output.stdout).unwrap();
    for name in ["hello_world", "usart_out", "echo", "base64encode", "modpow"] {
        assert!(listing.contains(name), "{} missing", name);
    }

    let output = avrlab(&["fixture", "no_such_fixture"]);
    assert_eq!(output.status.code(), Some(2));
}

#[test]
fn test_cli_check_annotations() {
    let dir = temp_dir("check");
    let firmware = write_fixture(&dir, "echo");

    let good = dir.join("good.c");
    std::fs::write(
        &good,
        "// TEST: \"abc\\0\" >> USARTC0 >> \"abc\\0\"\nint main(void) { return 0; }\n",
    )
    .unwrap();
    let output = avrlab(&[
        "check",
        good.to_str().unwrap(),
        "--firmware",
        firmware.to_str().unwrap(),
    ]);
    assert!(output.status.success());
    assert!(String::from_utf8_lossy(&output.stdout).contains("PASS line 1"));

    let bad = dir.join("bad.c");
    std::fs::write(&bad, "int x;\n// TEST: \"abc\\0\" >> USARTC0 >> \"xyz\\0\"\n").unwrap();
    let output = avrlab(&[
        "check",
        bad.to_str().unwrap(),
        "--firmware",
        firmware.to_str().unwrap(),
    ]);
    assert_eq!(output.status.code(), Some(1));
    assert!(String::from_utf8_lossy(&output.stdout).contains("FAIL line 2"));

    let none = dir.join("none.c");
    std::fs::write(&none, "int main(void) { return 0; }\n").unwrap();
    let output = avrlab(&[
        "check",
        none.to_str().unwrap(),
        "--firmware",
        firmware.to_str().unwrap(),
    ]);
    assert_eq!(output.status.code(), Some(2));

    let _ = std::fs::remove_dir_all(&dir);
}

#[test]
fn test_cli_objdump() {
    let dir = temp_dir("objdump");
    let firmware = write_fixture(&dir, "hello_world");

    let output = avrlab(&["objdump", firmware.to_str().unwrap()]);
    assert!(output.status.success());
    let listing = String::from_utf8_lossy(&output.stdout);
    assert!(listing.contains("Disassembly of segment at 0x0"));
    assert!(listing.contains("break"));

    let _ = std::fs::remove_dir_all(&dir);
}

#[test]
fn test_cli_run_with_system_manifest() {
    let dir = temp_dir("system");
    let firmware = write_fixture(&dir, "echo");
    let manifest = Path::new(env!("CARGO_MANIFEST_DIR")).join("../../systems/echo_board.yaml");

    let output = avrlab(&[
        "run",
        "--firmware",
        firmware.to_str().unwrap(),
        "--system",
        manifest.to_str().unwrap(),
    ]);
    assert!(output.status.success());
    assert_eq!(output.stdout, b"board says hi\n\0");

    let output = avrlab(&[
        "run",
        "--firmware",
        firmware.to_str().unwrap(),
        "--chip",
        "ATmega328P",
    ]);
    assert_eq!(output.status.code(), Some(2));

    let _ = std::fs::remove_dir_all(&dir);
}
