//! Serial test annotations embedded in firmware sources:
//!
//! ```text
//! // TEST: "ECHO\0" >> USARTC0 >> "ECHO\0"
//! ```
//!
//! The first string is fed to the named USART, the second is the exact byte
//! sequence the firmware must transmit before it executes `break`.

use regex::Regex;
use std::sync::OnceLock;

const MARKER: &str = "// TEST:";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Annotation {
    /// 1-based source line.
    pub line: usize,
    pub input: Vec<u8>,
    /// Peripheral name, e.g. `USARTC0`.
    pub usart: String,
    pub output: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EscapeError {
    #[error("dangling backslash at end of string")]
    Dangling,
    #[error("\\x escape without hex digits")]
    EmptyHex,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AnnotationError {
    #[error("line {line}: malformed TEST annotation `{text}`")]
    Malformed { line: usize, text: String },
    #[error("line {line}: {source}")]
    Escape {
        line: usize,
        #[source]
        source: EscapeError,
    },
}

fn annotation_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r#"//\s*TEST:\s*"((?:[^"\\]|\\.)*)"\s*>>\s*(USART[A-Z][0-9])\s*>>\s*"((?:[^"\\]|\\.)*)"\s*$"#,
        )
        .unwrap_or_else(|e| unreachable!("annotation pattern is valid: {e}"))
    })
}

/// Extract every `// TEST:` annotation from a source file.
///
/// A marker that does not match the annotation grammar is an error rather
/// than being skipped, so a typo cannot silently disable a test.
pub fn parse_annotations(source: &str) -> Result<Vec<Annotation>, AnnotationError> {
    let mut annotations = Vec::new();

    for (idx, text) in source.lines().enumerate() {
        let line = idx + 1;
        if !text.contains(MARKER) {
            continue;
        }

        let captures = annotation_regex()
            .captures(text)
            .ok_or_else(|| AnnotationError::Malformed {
                line,
                text: text.trim().to_string(),
            })?;

        let escape = |source| AnnotationError::Escape { line, source };
        annotations.push(Annotation {
            line,
            input: unescape(&captures[1]).map_err(escape)?,
            usart: captures[2].to_string(),
            output: unescape(&captures[3]).map_err(escape)?,
        });
    }

    tracing::debug!("Parsed {} TEST annotation(s)", annotations.len());
    Ok(annotations)
}

/// Decode C string-literal escapes into raw bytes.
///
/// Supports `\n \t \r \a \b \f \v \\ \" \' \?`, octal `\N`..`\NNN` and hex
/// `\xN`/`\xNN`. Any other escaped character stands for itself.
pub fn unescape(text: &str) -> Result<Vec<u8>, EscapeError> {
    let mut out = Vec::with_capacity(text.len());
    let mut chars = text.chars().peekable();

    while let Some(c) = chars.next() {
        if c != '\\' {
            let mut buf = [0u8; 4];
            out.extend_from_slice(c.encode_utf8(&mut buf).as_bytes());
            continue;
        }

        let escaped = chars.next().ok_or(EscapeError::Dangling)?;
        match escaped {
            'n' => out.push(b'\n'),
            't' => out.push(b'\t'),
            'r' => out.push(b'\r'),
            'a' => out.push(0x07),
            'b' => out.push(0x08),
            'f' => out.push(0x0C),
            'v' => out.push(0x0B),
            'x' => {
                let mut value: u32 = 0;
                let mut digits = 0;
                while digits < 2 {
                    match chars.peek().and_then(|d| d.to_digit(16)) {
                        Some(d) => {
                            value = value * 16 + d;
                            digits += 1;
                            chars.next();
                        }
                        None => break,
                    }
                }
                if digits == 0 {
                    return Err(EscapeError::EmptyHex);
                }
                out.push(value as u8);
            }
            '0'..='7' => {
                let mut value = escaped.to_digit(8).unwrap_or(0);
                let mut digits = 1;
                while digits < 3 {
                    match chars.peek().and_then(|d| d.to_digit(8)) {
                        Some(d) => {
                            value = value * 8 + d;
                            digits += 1;
                            chars.next();
                        }
                        None => break,
                    }
                }
                out.push(value as u8);
            }
            other => {
                let mut buf = [0u8; 4];
                out.extend_from_slice(other.encode_utf8(&mut buf).as_bytes());
            }
        }
    }

    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unescape_common_sequences() {
        assert_eq!(unescape(r"ECHO ECHO\nECHO\0").unwrap(), b"ECHO ECHO\nECHO\0".to_vec());
        assert_eq!(unescape(r#"a\tb\\c\"d"#).unwrap(), b"a\tb\\c\"d".to_vec());
        assert_eq!(unescape(r"\x41\x7e\x4").unwrap(), vec![0x41, 0x7E, 0x04]);
        assert_eq!(unescape(r"\101\0101").unwrap(), vec![0x41, 0x08, b'1']);
        assert_eq!(unescape("").unwrap(), Vec::<u8>::new());
    }

    #[test]
    fn test_unescape_errors() {
        assert_eq!(unescape(r"abc\"), Err(EscapeError::Dangling));
        assert_eq!(unescape(r"\xZZ"), Err(EscapeError::EmptyHex));
    }

    #[test]
    fn test_parse_annotations() {
        let source = r#"// TEST: "ECHO ECHO\nECHO\0" >> USARTC0 >> "ECHO ECHO\nECHO\0"

#include "uart_io.h"
// TEST: "" >> USARTD1 >> "Hello World!\n"
int main(void) {}
"#;
        let annotations = parse_annotations(source).unwrap();
        assert_eq!(annotations.len(), 2);
        assert_eq!(annotations[0].line, 1);
        assert_eq!(annotations[0].usart, "USARTC0");
        assert_eq!(annotations[0].input, b"ECHO ECHO\nECHO\0".to_vec());
        assert_eq!(annotations[1].line, 4);
        assert_eq!(annotations[1].usart, "USARTD1");
        assert!(annotations[1].input.is_empty());
        assert_eq!(annotations[1].output, b"Hello World!\n".to_vec());
    }

    #[test]
    fn test_corrupt_marker_is_rejected() {
        let source = "// TEST: \"abc\" > USARTC0 >> \"abc\"\n";
        let err = parse_annotations(source).unwrap_err();
        assert!(matches!(err, AnnotationError::Malformed { line: 1, .. }));
    }

    #[test]
    fn test_source_without_markers() {
        assert!(parse_annotations("int main(void) { return 0; }").unwrap().is_empty());
    }
}
