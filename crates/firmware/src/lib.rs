//! Built-in fixture firmware for the XMEGA A4U family.
//!
//! Every fixture carries a `// TEST:` annotation describing the bytes fed to
//! USARTC0 and the exact bytes it must print before executing `break`.

pub mod arith;
pub mod programs;
pub mod uart;

use avrlab_config::annotation::{parse_annotations, Annotation, AnnotationError};
use avrlab_core::asm::{AsmError, Program};

#[derive(Debug, Clone, Copy)]
pub struct Fixture {
    pub name: &'static str,
    pub description: &'static str,
    pub annotation: &'static str,
    builder: fn() -> Result<Program, AsmError>,
}

impl Fixture {
    pub fn build(&self) -> Result<Program, AsmError> {
        let program = (self.builder)()?;
        tracing::debug!("Assembled fixture '{}': {} bytes", self.name, program.bytes.len());
        Ok(program)
    }

    pub fn annotations(&self) -> Result<Vec<Annotation>, AnnotationError> {
        parse_annotations(self.annotation)
    }
}

static FIXTURES: [Fixture; 5] = [
    Fixture {
        name: "hello_world",
        description: "print a fixed greeting",
        annotation: r#"// TEST: "" >> USARTC0 >> "Hello World!\n""#,
        builder: programs::hello_world,
    },
    Fixture {
        name: "usart_out",
        description: "print a fixed greeting with an inlined driver",
        annotation: r#"// TEST: "ignored input\0" >> USARTC0 >> "Hello World!\n""#,
        builder: programs::usart_out,
    },
    Fixture {
        name: "echo",
        description: "echo input up to and including NUL",
        annotation: r#"// TEST: "ECHO ECHO\nECHO\0" >> USARTC0 >> "ECHO ECHO\nECHO\0""#,
        builder: programs::echo,
    },
    Fixture {
        name: "base64encode",
        description: "base64-encode a NUL-terminated line of at most 100 bytes",
        annotation: r#"// TEST: "TEST-base64/encode\n\0" >> USARTC0 >> "VEVTVC1iYXNlNjQvZW5jb2RlCg==""#,
        builder: programs::base64encode,
    },
    Fixture {
        name: "modpow",
        description: "64-bit modular exponentiation benchmark",
        annotation: r#"// TEST: "" >> USARTC0 >> "0000000054120558\n""#,
        builder: programs::modpow,
    },
];

pub fn fixtures() -> &'static [Fixture] {
    &FIXTURES
}

pub fn find(name: &str) -> Option<&'static Fixture> {
    FIXTURES.iter().find(|f| f.name == name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registry() {
        let names: Vec<_> = fixtures().iter().map(|f| f.name).collect();
        assert_eq!(names, ["hello_world", "usart_out", "echo", "base64encode", "modpow"]);
        assert!(find("echo").is_some());
        assert!(find("missing").is_none());
    }

    #[test]
    fn test_every_annotation_parses() {
        for fixture in fixtures() {
            let annotations = fixture.annotations().unwrap();
            assert_eq!(annotations.len(), 1, "{}", fixture.name);
            assert_eq!(annotations[0].usart, "USARTC0");
        }
        let echo = find("echo").unwrap().annotations().unwrap();
        assert_eq!(echo[0].input, b"ECHO ECHO\nECHO\0");
        assert_eq!(echo[0].input, echo[0].output);
    }
}
