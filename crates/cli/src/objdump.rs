use avrlab_core::decoder::{decode, Instruction};
use avrlab_core::memory::ProgramImage;
use avrlab_core::DATA_SPACE_OFFSET;
use std::fmt::Write;

/// Disassemble a program memory blob loaded at byte address `base`.
pub fn disassemble(data: &[u8], base: u64) -> Vec<String> {
    let word = |i: usize| u16::from_le_bytes([data[i], data[i + 1]]);
    let mut lines = Vec::new();
    let mut offset = 0;

    while offset + 1 < data.len() {
        let w0 = word(offset);
        let two_words = Instruction::is_two_word(w0) && offset + 3 < data.len();
        let w1 = if two_words { word(offset + 2) } else { 0 };
        let len = if two_words { 4 } else { 2 };

        let mut hex = String::new();
        for byte in &data[offset..offset + len] {
            let _ = write!(hex, "{:02x} ", byte);
        }
        let text = if Instruction::is_two_word(w0) && !two_words {
            format!(".word\t{:#06x}", w0)
        } else {
            decode(w0, w1).to_string()
        };
        lines.push(format!(
            "{:>8x}:\t{:<12}\t{}",
            base + offset as u64,
            hex.trim_end(),
            text
        ));
        offset += len;
    }

    if offset < data.len() {
        lines.push(format!(
            "{:>8x}:\t{:02x}\t.byte\t{:#04x}",
            base + offset as u64,
            data[offset],
            data[offset]
        ));
    }
    lines
}

/// Listing of every program memory segment in the image.
pub fn listing(image: &ProgramImage) -> String {
    let mut out = String::new();
    for segment in &image.segments {
        if segment.start_addr >= DATA_SPACE_OFFSET as u64 {
            continue;
        }
        let _ = writeln!(
            out,
            "\nDisassembly of segment at {:#x} ({} bytes):\n",
            segment.start_addr,
            segment.data.len()
        );
        for line in disassemble(&segment.data, segment.start_addr) {
            out.push_str(&line);
            out.push('\n');
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_disassemble_mixed_widths() {
        // ldi r24, 0x2A; sts 0x08A0, r24; break; stray byte
        let data = [0x8A, 0xE2, 0x80, 0x93, 0xA0, 0x08, 0x98, 0x95, 0xFF];
        let lines = disassemble(&data, 0x100);
        assert_eq!(lines.len(), 4);
        assert!(lines[0].starts_with("     100:"));
        assert!(lines[0].ends_with("ldi\tr24, 0x2A"));
        assert!(lines[1].starts_with("     102:\t80 93 a0 08"));
        assert!(lines[1].contains("sts"));
        assert!(lines[2].starts_with("     106:"));
        assert!(lines[2].ends_with("break"));
        assert!(lines[3].contains(".byte\t0xff"));
    }

    #[test]
    fn test_truncated_two_word_instruction() {
        let lines = disassemble(&[0x0E, 0x94], 0);
        assert_eq!(lines.len(), 1);
        assert!(lines[0].ends_with(".word\t0x940e"));
    }

    #[test]
    fn test_listing_skips_data_segments() {
        let mut image = ProgramImage::from_flash_bytes(vec![0x00, 0x00]);
        image.add_segment(DATA_SPACE_OFFSET as u64 + 0x2000, vec![1, 2, 3, 4]);
        let text = listing(&image);
        assert_eq!(text.matches("Disassembly of segment").count(), 1);
        assert!(text.contains("nop"));
    }
}
