pub mod annotation;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct MemoryRange {
    #[serde(default)]
    pub base: u32,
    pub size: String, // e.g. "136 KiB"
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct PeripheralConfig {
    pub id: String,
    pub r#type: String, // "usart" or "gpio"
    pub base_address: u32,
    /// First interrupt vector of the instance (RXC for a USART).
    #[serde(default)]
    pub vector: Option<u16>,
    #[serde(default)]
    pub config: HashMap<String, serde_yaml::Value>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ChipDescriptor {
    pub name: String,
    #[serde(default = "default_arch")]
    pub arch: String, // "avrxm"
    pub flash: MemoryRange,
    #[serde(alias = "ram")]
    pub sram: MemoryRange,
    #[serde(default)]
    pub clock_hz: Option<u32>,
    #[serde(default)]
    pub peripherals: Vec<PeripheralConfig>,
}

fn default_arch() -> String {
    "avrxm".to_string()
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct SystemManifest {
    pub name: String,
    /// Built-in device name (`ATxmega128A4U`) or a chip descriptor path
    /// relative to the manifest.
    pub chip: String,
    #[serde(default)]
    pub memory_overrides: HashMap<String, String>,
    /// Bytes queued on each USART before the run starts, C escapes allowed.
    #[serde(default)]
    pub usart_input: BTreeMap<String, String>,
}

impl ChipDescriptor {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let f = std::fs::File::open(&path)
            .with_context(|| format!("Failed to open chip descriptor at {:?}", path.as_ref()))?;
        serde_yaml::from_reader(f).context("Failed to parse Chip Descriptor")
    }

    pub fn flash_bytes(&self) -> Result<u64> {
        parse_size(&self.flash.size).context("Invalid flash size")
    }

    pub fn sram_bytes(&self) -> Result<u64> {
        parse_size(&self.sram.size).context("Invalid sram size")
    }
}

impl SystemManifest {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let f = std::fs::File::open(&path)
            .with_context(|| format!("Failed to open system manifest at {:?}", path.as_ref()))?;
        serde_yaml::from_reader(f).context("Failed to parse System Manifest")
    }

    /// Path of the chip descriptor when `chip` names a YAML file.
    pub fn chip_path(&self, manifest_dir: &Path) -> Option<PathBuf> {
        let chip = Path::new(&self.chip);
        match chip.extension().and_then(|e| e.to_str()) {
            Some("yaml") | Some("yml") => Some(manifest_dir.join(chip)),
            _ => None,
        }
    }

    /// Apply `memory_overrides` (`flash`, `sram`) to a chip descriptor.
    pub fn apply_overrides(&self, chip: &mut ChipDescriptor) -> Result<()> {
        for (region, size) in &self.memory_overrides {
            parse_size(size).with_context(|| format!("Invalid override for '{}'", region))?;
            match region.as_str() {
                "flash" => chip.flash.size = size.clone(),
                "sram" | "ram" => chip.sram.size = size.clone(),
                other => anyhow::bail!("Unknown memory region override '{}'", other),
            }
        }
        Ok(())
    }

    /// Decoded `usart_input` bytes per USART.
    pub fn stimulus(&self) -> Result<BTreeMap<String, Vec<u8>>> {
        decode_stimulus(&self.usart_input)
    }
}

fn decode_stimulus(raw: &BTreeMap<String, String>) -> Result<BTreeMap<String, Vec<u8>>> {
    raw.iter()
        .map(|(usart, text)| {
            let bytes = annotation::unescape(text)
                .with_context(|| format!("Invalid stimulus for {}", usart))?;
            Ok((usart.clone(), bytes))
        })
        .collect()
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(deny_unknown_fields)]
pub struct TestInputs {
    pub firmware: String,
    #[serde(default)]
    pub chip: Option<String>,
    #[serde(default)]
    pub system: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, Clone, Default)]
#[serde(deny_unknown_fields)]
pub struct TestStimulus {
    /// Input per USART, C escapes allowed.
    #[serde(default)]
    pub usart: BTreeMap<String, String>,
}

impl TestStimulus {
    pub fn decoded(&self) -> Result<BTreeMap<String, Vec<u8>>> {
        decode_stimulus(&self.usart)
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(deny_unknown_fields)]
pub struct TestLimits {
    pub max_steps: u64,
    #[serde(default)]
    pub wall_time_ms: Option<u64>,
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    Break,
    Sleep,
    Breakpoint,
    MaxSteps,
    WallTime,
    MemoryViolation,
    DecodeError,
    PcOutOfBounds,
    Unsupported,
}

/// USART the output assertions look at when none is named.
pub const DEFAULT_USART: &str = "USARTC0";

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(deny_unknown_fields)]
pub struct UartEqualsAssertion {
    pub uart_equals: String,
    #[serde(default)]
    pub usart: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(deny_unknown_fields)]
pub struct UartContainsAssertion {
    pub uart_contains: String,
    #[serde(default)]
    pub usart: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(deny_unknown_fields)]
pub struct UartRegexAssertion {
    pub uart_regex: String,
    #[serde(default)]
    pub usart: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(deny_unknown_fields)]
pub struct StopReasonAssertion {
    pub expected_stop_reason: StopReason,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(untagged)]
pub enum TestAssertion {
    UartEquals(UartEqualsAssertion),
    UartContains(UartContainsAssertion),
    UartRegex(UartRegexAssertion),
    ExpectedStopReason(StopReasonAssertion),
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(deny_unknown_fields)]
pub struct TestScript {
    pub schema_version: String,
    pub inputs: TestInputs,
    #[serde(default)]
    pub stimulus: TestStimulus,
    pub limits: TestLimits,
    #[serde(default)]
    pub assertions: Vec<TestAssertion>,
}

impl TestScript {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let f = std::fs::File::open(&path)
            .with_context(|| format!("Failed to open test script at {:?}", path.as_ref()))?;
        let script: Self =
            serde_yaml::from_reader(f).context("Failed to parse Test Script YAML")?;
        script.validate()?;
        Ok(script)
    }

    pub fn validate(&self) -> Result<()> {
        if self.schema_version != "1.0" {
            anyhow::bail!(
                "Unsupported schema_version '{}'. Supported versions: '1.0'",
                self.schema_version
            );
        }

        if self.inputs.firmware.trim().is_empty() {
            anyhow::bail!("Input 'firmware' path cannot be empty");
        }

        if self.inputs.chip.is_some() && self.inputs.system.is_some() {
            anyhow::bail!("Inputs 'chip' and 'system' are mutually exclusive");
        }

        if self.limits.max_steps == 0 {
            anyhow::bail!("Limit 'max_steps' must be greater than zero");
        }

        self.stimulus.decoded()?;

        for assertion in &self.assertions {
            if let TestAssertion::UartRegex(a) = assertion {
                regex::Regex::new(&a.uart_regex)
                    .with_context(|| format!("Invalid uart_regex '{}'", a.uart_regex))?;
            }
        }

        Ok(())
    }
}

pub fn parse_size(size_str: &str) -> Result<u64> {
    use human_size::{Byte, Size, SpecificSize};
    let s: Size = size_str
        .parse()
        .map_err(|e| anyhow::anyhow!("Invalid size format: {}", e))?;
    let bytes: SpecificSize<Byte> = s.into();
    Ok(bytes.value() as u64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_script() {
        let yaml = r#"
schema_version: "1.0"
inputs:
  firmware: "path/to/echo.bin"
  chip: "ATxmega128A4U"
stimulus:
  usart:
    USARTC0: "ECHO\\n\\0"
limits:
  max_steps: 1000
  wall_time_ms: 5000
assertions:
  - uart_equals: "ECHO\n\0"
  - uart_contains: "ECHO"
    usart: USARTC0
  - uart_regex: "^E.*O"
  - expected_stop_reason: break
"#;
        let script: TestScript = serde_yaml::from_str(yaml).unwrap();
        assert!(script.validate().is_ok());
        assert_eq!(script.inputs.firmware, "path/to/echo.bin");
        assert_eq!(script.limits.max_steps, 1000);
        assert_eq!(script.assertions.len(), 4);
        assert!(matches!(script.assertions[0], TestAssertion::UartEquals(_)));
        assert!(matches!(
            script.assertions[3],
            TestAssertion::ExpectedStopReason(StopReasonAssertion {
                expected_stop_reason: StopReason::Break
            })
        ));

        let stimulus = script.stimulus.decoded().unwrap();
        assert_eq!(stimulus["USARTC0"], b"ECHO\n\0".to_vec());
    }

    #[test]
    fn test_invalid_version() {
        let yaml = r#"
schema_version: "2.0"
inputs:
  firmware: "fw.elf"
limits:
  max_steps: 100
"#;
        let script: TestScript = serde_yaml::from_str(yaml).unwrap();
        let err = script.validate().unwrap_err();
        assert!(err.to_string().contains("Unsupported schema_version"));
    }

    #[test]
    fn test_invalid_max_steps() {
        let yaml = r#"
schema_version: "1.0"
inputs:
  firmware: "fw.elf"
limits:
  max_steps: 0
"#;
        let script: TestScript = serde_yaml::from_str(yaml).unwrap();
        let err = script.validate().unwrap_err();
        assert!(err.to_string().contains("max_steps"));
    }

    #[test]
    fn test_empty_firmware() {
        let yaml = r#"
schema_version: "1.0"
inputs:
  firmware: ""
limits:
  max_steps: 100
"#;
        let script: TestScript = serde_yaml::from_str(yaml).unwrap();
        let err = script.validate().unwrap_err();
        assert!(err.to_string().contains("firmware"));
    }

    #[test]
    fn test_chip_and_system_are_exclusive() {
        let yaml = r#"
schema_version: "1.0"
inputs:
  firmware: "fw.bin"
  chip: "ATxmega16A4U"
  system: "system.yaml"
limits:
  max_steps: 10
"#;
        let script: TestScript = serde_yaml::from_str(yaml).unwrap();
        assert!(script.validate().is_err());
    }

    #[test]
    fn test_bad_regex_and_unknown_fields() {
        let yaml = r#"
schema_version: "1.0"
inputs:
  firmware: "fw.bin"
limits:
  max_steps: 10
assertions:
  - uart_regex: "(unclosed"
"#;
        let script: TestScript = serde_yaml::from_str(yaml).unwrap();
        assert!(script.validate().is_err());

        let yaml = r#"
schema_version: "1.0"
inputs:
  firmware: "fw.bin"
  extra: 1
limits:
  max_steps: 10
"#;
        assert!(serde_yaml::from_str::<TestScript>(yaml).is_err());
    }

    #[test]
    fn test_chip_descriptor() {
        let yaml = r#"
name: ATxmega32A4U
flash:
  size: "36 KiB"
ram:
  base: 0x2000
  size: "4 KiB"
peripherals:
  - id: USARTC0
    type: usart
    base_address: 0x08A0
    vector: 25
  - id: PORTA
    type: gpio
    base_address: 0x0600
"#;
        let chip: ChipDescriptor = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(chip.arch, "avrxm");
        assert_eq!(chip.flash_bytes().unwrap(), 36 * 1024);
        assert_eq!(chip.sram.base, 0x2000);
        assert_eq!(chip.sram_bytes().unwrap(), 4096);
        assert_eq!(chip.peripherals[0].vector, Some(25));
        assert_eq!(chip.peripherals[1].r#type, "gpio");
    }

    #[test]
    fn test_system_manifest_overrides() {
        let yaml = r#"
name: bench
chip: chips/atxmega128a4u.yaml
memory_overrides:
  sram: "16 KiB"
usart_input:
  USARTC0: "hi\\0"
"#;
        let manifest: SystemManifest = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(
            manifest.chip_path(Path::new("/cfg")),
            Some(PathBuf::from("/cfg/chips/atxmega128a4u.yaml"))
        );
        assert_eq!(manifest.stimulus().unwrap()["USARTC0"], b"hi\0".to_vec());

        let mut chip: ChipDescriptor = serde_yaml::from_str(
            "name: x\nflash:\n  size: \"16 KiB\"\nsram:\n  base: 0x2000\n  size: \"2 KiB\"\n",
        )
        .unwrap();
        manifest.apply_overrides(&mut chip).unwrap();
        assert_eq!(chip.sram_bytes().unwrap(), 16 * 1024);
    }

    #[test]
    fn test_parse_size() {
        assert_eq!(parse_size("8 KiB").unwrap(), 8192);
        assert_eq!(parse_size("136 KiB").unwrap(), 0x22000);
        assert!(parse_size("lots").is_err());
    }
}
