use avrlab_core::models::XmegaA4U;
use avrlab_core::{AvrMachine, StopReason};
use avrlab_firmware::{fixtures, find};
use base64::Engine;

const MAX_STEPS: u64 = 5_000_000;

fn run_fixture(name: &str, input: &[u8]) -> Vec<u8> {
    let program = find(name).unwrap().build().unwrap();
    let mut machine = AvrMachine::from_model(XmegaA4U::ATxmega128A4U);
    machine.load_firmware(&program.into_image()).unwrap();
    machine.usart_mut("USARTC0").unwrap().push_input(input);

    assert_eq!(machine.run(Some(MAX_STEPS)).unwrap(), StopReason::Break);
    machine.usart_mut("USARTC0").unwrap().take_output()
}

#[test]
fn test_annotations_hold() {
    for fixture in fixtures() {
        for annotation in fixture.annotations().unwrap() {
            let program = fixture.build().unwrap();
            let mut machine = AvrMachine::from_model(XmegaA4U::ATxmega128A4U);
            machine.load_firmware(&program.into_image()).unwrap();

            let usart = machine.usart_mut(&annotation.usart).unwrap();
            usart.push_input(&annotation.input);
            let tx = usart.connect_tx();

            assert_eq!(
                machine.run(Some(MAX_STEPS)).unwrap(),
                StopReason::Break,
                "{}",
                fixture.name
            );
            drop(machine);
            let output: Vec<u8> = tx.iter().collect();
            assert_eq!(
                String::from_utf8_lossy(&output),
                String::from_utf8_lossy(&annotation.output),
                "{}",
                fixture.name
            );
        }
    }
}

#[test]
fn test_fixtures_run_on_every_a4u_model() {
    for model in XmegaA4U::ALL {
        let program = find("hello_world").unwrap().build().unwrap();
        let mut machine = AvrMachine::from_model(model);
        machine.load_firmware(&program.into_image()).unwrap();
        assert_eq!(machine.run(Some(MAX_STEPS)).unwrap(), StopReason::Break, "{model}");
        assert_eq!(machine.usart("USARTC0").unwrap().output(), b"Hello World!\n");
    }
}

#[test]
fn test_echo_returns_input_through_terminator() {
    for input in [&b"\0"[..], b"a\0", b"line one\r\nline two\0trailing"] {
        let output = run_fixture("echo", input);
        let end = input.iter().position(|&b| b == 0).unwrap() + 1;
        assert_eq!(output, &input[..end]);
    }
}

#[test]
fn test_hello_world_ignores_input() {
    assert_eq!(run_fixture("hello_world", b"whatever\0"), b"Hello World!\n");
}

#[test]
fn test_base64_matches_reference_encoder() {
    let engine = base64::engine::general_purpose::STANDARD;
    let inputs: [&[u8]; 5] = [
        b"TEST-base64/decode",
        b"\x01\x02\x03\xfe\xff",
        b"The quick brown fox jumps over the lazy dog",
        b"?>",
        b"\xfb\xff",
    ];
    for input in inputs {
        let mut fed = input.to_vec();
        fed.push(0);
        let output = run_fixture("base64encode", &fed);
        assert_eq!(String::from_utf8(output).unwrap(), engine.encode(input));
    }
    assert_eq!(
        engine.encode(b"TEST-base64/decode"),
        "VEVTVC1iYXNlNjQvZGVjb2Rl"
    );
}

#[test]
fn test_modpow_benchmark_output() {
    assert_eq!(run_fixture("modpow", b""), b"0000000054120558\n");
}
