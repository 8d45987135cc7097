//! Firmware image loading: ELF, Intel HEX and raw binaries.

use anyhow::{anyhow, bail, Context, Result};
use avrlab_core::memory::ProgramImage;
use avrlab_core::DATA_SPACE_OFFSET;
use goblin::elf::program_header::PT_LOAD;
use goblin::elf::Elf;
use std::fs;
use std::path::Path;
use tracing::{debug, info, warn};

/// EEPROM, fuses and lock bits live above this in the avr-gcc address space.
const DATA_SPACE_END: u64 = 0x81_0000;

/// Load a firmware file, choosing the format from its extension.
pub fn load_firmware(path: &Path) -> Result<ProgramImage> {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase());

    match ext.as_deref() {
        Some("elf") => load_elf(path),
        Some("hex") | Some("ihex") => load_ihex(path),
        _ => load_binary(path),
    }
}

pub fn load_elf(path: &Path) -> Result<ProgramImage> {
    let buffer = fs::read(path).with_context(|| format!("Failed to read ELF file: {:?}", path))?;
    parse_elf(&buffer)
}

pub fn parse_elf(buffer: &[u8]) -> Result<ProgramImage> {
    let elf = Elf::parse(buffer).context("Failed to parse ELF binary")?;

    info!("ELF Entry Point: {:#x}", elf.entry);

    let mut program_image = ProgramImage::new(elf.entry);

    for ph in &elf.program_headers {
        if ph.p_type != PT_LOAD {
            continue;
        }

        // The load address places .data initialisers in flash after .text.
        let start_addr = ph.p_paddr;
        let size = ph.p_filesz as usize;
        let offset = ph.p_offset as usize;

        if size == 0 {
            continue;
        }
        if start_addr >= DATA_SPACE_END {
            warn!(
                "Skipping segment at {:#x}: EEPROM/fuse sections are not simulated",
                start_addr
            );
            continue;
        }

        debug!(
            "Found Loadable Segment: Addr={:#x}, Size={} bytes, Offset={:#x}",
            start_addr, size, offset
        );

        if offset + size > buffer.len() {
            return Err(anyhow!("Segment out of bounds in ELF file"));
        }

        program_image.add_segment(start_addr, buffer[offset..offset + size].to_vec());
    }

    if program_image.segments.is_empty() {
        warn!("No loadable segments found in ELF file");
    }

    Ok(program_image)
}

/// Address of an ELF symbol. Data-space symbols keep their 0x800000 offset.
pub fn find_symbol(path: &Path, name: &str) -> Result<Option<u64>> {
    let buffer = fs::read(path).with_context(|| format!("Failed to read ELF file: {:?}", path))?;
    let elf = Elf::parse(&buffer).context("Failed to parse ELF binary")?;

    Ok(elf
        .syms
        .iter()
        .find(|sym| elf.strtab.get_at(sym.st_name) == Some(name))
        .map(|sym| sym.st_value))
}

pub fn load_ihex(path: &Path) -> Result<ProgramImage> {
    let text = fs::read_to_string(path)
        .with_context(|| format!("Failed to read Intel HEX file: {:?}", path))?;
    parse_ihex(&text).with_context(|| format!("Invalid Intel HEX file: {:?}", path))
}

/// Parse Intel HEX records 00 (data), 01 (EOF), 02 (segment base) and
/// 04 (linear base). Consecutive data records are merged into one segment.
pub fn parse_ihex(text: &str) -> Result<ProgramImage> {
    let mut image = ProgramImage::new(0);
    let mut base: u32 = 0;
    let mut current: Option<(u32, Vec<u8>)> = None;
    let mut seen_eof = false;

    for (index, line) in text.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let lineno = index + 1;

        let body = line
            .strip_prefix(':')
            .ok_or_else(|| anyhow!("line {}: record does not start with ':'", lineno))?;
        if body.len() % 2 != 0 {
            bail!("line {}: odd number of hex digits", lineno);
        }
        let bytes = body
            .as_bytes()
            .chunks(2)
            .map(|pair| Some((hex_digit(pair[0])? << 4) | hex_digit(pair[1])?))
            .collect::<Option<Vec<u8>>>()
            .ok_or_else(|| anyhow!("line {}: invalid hex digit", lineno))?;

        if bytes.len() < 5 || bytes.len() != bytes[0] as usize + 5 {
            bail!("line {}: record length mismatch", lineno);
        }
        let sum = bytes.iter().fold(0u8, |acc, b| acc.wrapping_add(*b));
        if sum != 0 {
            bail!("line {}: checksum mismatch", lineno);
        }

        let offset = u16::from_be_bytes([bytes[1], bytes[2]]) as u32;
        let data = &bytes[4..bytes.len() - 1];

        match bytes[3] {
            0x00 => {
                let addr = base + offset;
                match current.as_mut() {
                    Some((start, buf)) if *start + buf.len() as u32 == addr => {
                        buf.extend_from_slice(data);
                    }
                    _ => {
                        if let Some((start, buf)) = current.take() {
                            image.add_segment(start as u64, buf);
                        }
                        current = Some((addr, data.to_vec()));
                    }
                }
            }
            0x01 => {
                seen_eof = true;
                break;
            }
            0x02 | 0x04 => {
                if data.len() != 2 {
                    bail!("line {}: address record needs two data bytes", lineno);
                }
                let value = u16::from_be_bytes([data[0], data[1]]) as u32;
                base = if bytes[3] == 0x02 { value << 4 } else { value << 16 };
            }
            0x03 | 0x05 => debug!("line {}: ignoring start address record", lineno),
            other => bail!("line {}: unsupported record type {:02X}", lineno, other),
        }
    }

    if let Some((start, buf)) = current.take() {
        image.add_segment(start as u64, buf);
    }
    if !seen_eof {
        warn!("Intel HEX input has no end-of-file record");
    }

    Ok(image)
}

fn hex_digit(c: u8) -> Option<u8> {
    (c as char).to_digit(16).map(|d| d as u8)
}

/// A raw program memory dump, loaded at address 0.
pub fn load_binary(path: &Path) -> Result<ProgramImage> {
    let bytes = fs::read(path).with_context(|| format!("Failed to read binary file: {:?}", path))?;
    if bytes.is_empty() {
        bail!("Firmware file {:?} is empty", path);
    }
    info!("Loaded {} bytes of raw firmware", bytes.len());
    Ok(ProgramImage::from_flash_bytes(bytes))
}

/// True when an image address targets the data space rather than flash.
pub fn is_data_address(addr: u64) -> bool {
    addr >= DATA_SPACE_OFFSET as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tiny_elf(entry: u32, segments: &[(u32, u32, &[u8])]) -> Vec<u8> {
        const EHSIZE: u32 = 52;
        const PHENTSIZE: u32 = 32;

        let mut out = vec![0x7F, b'E', b'L', b'F', 1, 1, 1, 0, 0, 0, 0, 0, 0, 0, 0, 0];
        out.extend_from_slice(&2u16.to_le_bytes()); // ET_EXEC
        out.extend_from_slice(&83u16.to_le_bytes()); // EM_AVR
        out.extend_from_slice(&1u32.to_le_bytes());
        out.extend_from_slice(&entry.to_le_bytes());
        out.extend_from_slice(&EHSIZE.to_le_bytes());
        out.extend_from_slice(&0u32.to_le_bytes());
        out.extend_from_slice(&0u32.to_le_bytes());
        out.extend_from_slice(&(EHSIZE as u16).to_le_bytes());
        out.extend_from_slice(&(PHENTSIZE as u16).to_le_bytes());
        out.extend_from_slice(&(segments.len() as u16).to_le_bytes());
        out.extend_from_slice(&40u16.to_le_bytes());
        out.extend_from_slice(&0u16.to_le_bytes());
        out.extend_from_slice(&0u16.to_le_bytes());

        let mut offset = EHSIZE + PHENTSIZE * segments.len() as u32;
        for (vaddr, paddr, data) in segments {
            for field in [
                1, // PT_LOAD
                offset,
                *vaddr,
                *paddr,
                data.len() as u32,
                data.len() as u32,
                5,
                1,
            ] {
                out.extend_from_slice(&field.to_le_bytes());
            }
            offset += data.len() as u32;
        }
        for (_, _, data) in segments {
            out.extend_from_slice(data);
        }
        out
    }

    #[test]
    fn test_elf_segments_by_load_address() {
        let elf = tiny_elf(
            0,
            &[
                (0x0, 0x0, &[0x98, 0x95]),
                // .data: runs from SRAM, initialisers stored in flash
                (0x80_2000, 0x2, &[1, 2]),
                (0x81_0000, 0x81_0000, &[0xFF]),
            ],
        );
        let image = parse_elf(&elf).unwrap();

        assert_eq!(image.segments.len(), 2);
        assert_eq!(image.segments[0].data, vec![0x98, 0x95]);
        assert_eq!(image.segments[1].start_addr, 0x2);
        assert!(!is_data_address(image.segments[1].start_addr));
    }

    #[test]
    fn test_ihex_records() {
        let text = "\
:020000040001F9
:040000001122334452
:04000400556677883E
:00000001FF
";
        let image = parse_ihex(text).unwrap();
        assert_eq!(image.segments.len(), 1);
        assert_eq!(image.segments[0].start_addr, 0x1_0000);
        assert_eq!(
            image.segments[0].data,
            vec![0x11, 0x22, 0x33, 0x44, 0x55, 0x66, 0x77, 0x88]
        );
    }

    #[test]
    fn test_ihex_rejects_corruption() {
        assert!(parse_ihex(":040000001122334453\n").is_err());
        assert!(parse_ihex("040000001122334452\n").is_err());
        assert!(parse_ihex(":0500000011223344\n").is_err());
        assert!(parse_ihex(":00000006FA\n").is_err());
    }

    #[test]
    fn test_ihex_non_ascii_digit() {
        let err = parse_ihex(":0é0000001FF\n").unwrap_err();
        assert!(err.to_string().contains("invalid hex digit"), "{}", err);
        assert!(parse_ihex(":+00000001FF\n").is_err());
    }

    #[test]
    fn test_dispatch_on_extension() {
        let dir = std::env::temp_dir().join(format!("avrlab-loader-{}", std::process::id()));
        fs::create_dir_all(&dir).unwrap();

        let bin = dir.join("fw.bin");
        fs::write(&bin, [0x98, 0x95]).unwrap();
        let image = load_firmware(&bin).unwrap();
        assert_eq!(image.segments[0].start_addr, 0);

        let hex = dir.join("fw.HEX");
        fs::write(&hex, ":020000009895D1\n:00000001FF\n").unwrap();
        let image = load_firmware(&hex).unwrap();
        assert_eq!(image.segments[0].data, vec![0x98, 0x95]);

        let elf = dir.join("fw.elf");
        fs::write(&elf, tiny_elf(0, &[(0, 0, &[0x00, 0x00])])).unwrap();
        assert_eq!(find_symbol(&elf, "main").unwrap(), None);
        assert!(load_firmware(&elf).is_ok());

        fs::remove_dir_all(&dir).unwrap();
    }
}
