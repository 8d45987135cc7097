use serde::{Deserialize, Serialize};
use std::collections::HashMap;

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct MachineSnapshot {
    pub cpu: CpuSnapshot,
    pub steps: u64,
    /// Per-peripheral state keyed by instance name (`USARTC0`, `PORTA`, ...).
    pub peripherals: HashMap<String, serde_json::Value>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct CpuSnapshot {
    /// r0..r31
    pub registers: Vec<u8>,
    /// Byte address.
    pub pc: u32,
    pub sp: u16,
    pub sreg: u8,
    pub cycles: u64,
}
