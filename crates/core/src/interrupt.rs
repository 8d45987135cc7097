//! XMEGA Programmable Multilevel Interrupt Controller (PMIC).

use serde::{Deserialize, Serialize};

/// Data-space base of the PMIC registers.
pub const PMIC_BASE: u32 = 0x00A0;
pub const PMIC_SIZE: u32 = 3;

const STATUS: u32 = 0x00;
const INTPRI: u32 = 0x01;
const CTRL: u32 = 0x02;

/// Interrupt priority level. Ordering follows priority.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum InterruptLevel {
    Low,
    Medium,
    High,
}

impl InterruptLevel {
    /// Decode a 2-bit `INTLVL` field as found in peripheral CTRL registers.
    /// Zero means the interrupt is off.
    pub fn from_field(value: u8) -> Option<Self> {
        match value & 0x3 {
            1 => Some(InterruptLevel::Low),
            2 => Some(InterruptLevel::Medium),
            3 => Some(InterruptLevel::High),
            _ => None,
        }
    }

    /// Bit of this level in PMIC.STATUS and PMIC.CTRL.
    pub fn mask(self) -> u8 {
        match self {
            InterruptLevel::Low => 0x01,
            InterruptLevel::Medium => 0x02,
            InterruptLevel::High => 0x04,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct InterruptRequest {
    pub vector: u16,
    pub level: InterruptLevel,
}

#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct Pmic {
    status: u8,
    intpri: u8,
    ctrl: u8,
}

impl Pmic {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }

    pub fn status(&self) -> u8 {
        self.status
    }

    pub fn level_enabled(&self, level: InterruptLevel) -> bool {
        self.ctrl & level.mask() != 0
    }

    fn highest_active(&self) -> Option<InterruptLevel> {
        [InterruptLevel::High, InterruptLevel::Medium, InterruptLevel::Low]
            .into_iter()
            .find(|level| self.status & level.mask() != 0)
    }

    /// Pick the request to dispatch: enabled, above every level currently
    /// executing, highest level first and lowest vector within a level.
    pub fn select<I>(&self, requests: I) -> Option<InterruptRequest>
    where
        I: IntoIterator<Item = InterruptRequest>,
    {
        let active = self.highest_active();
        requests
            .into_iter()
            .filter(|req| self.level_enabled(req.level))
            .filter(|req| active.map_or(true, |level| req.level > level))
            .min_by_key(|req| (std::cmp::Reverse(req.level), req.vector))
    }

    pub fn acknowledge(&mut self, request: InterruptRequest) {
        self.status |= request.level.mask();
    }

    /// RETI: the highest executing level is done.
    pub fn return_from_interrupt(&mut self) {
        if let Some(level) = self.highest_active() {
            self.status &= !level.mask();
        }
    }

    pub fn read(&self, offset: u32) -> u8 {
        match offset {
            STATUS => self.status,
            INTPRI => self.intpri,
            CTRL => self.ctrl,
            _ => 0,
        }
    }

    pub fn write(&mut self, offset: u32, value: u8) {
        match offset {
            INTPRI => self.intpri = value,
            CTRL => self.ctrl = value,
            // STATUS is read-only
            _ => tracing::debug!("PMIC: ignored write {:#04x} to offset {:#x}", value, offset),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn req(vector: u16, level: InterruptLevel) -> InterruptRequest {
        InterruptRequest { vector, level }
    }

    #[test]
    fn test_disabled_levels_are_masked() {
        let mut pmic = Pmic::new();
        assert_eq!(pmic.select([req(25, InterruptLevel::Low)]), None);
        pmic.write(CTRL, 0x01);
        assert_eq!(
            pmic.select([req(25, InterruptLevel::Low)]),
            Some(req(25, InterruptLevel::Low))
        );
    }

    #[test]
    fn test_priority_then_vector_order() {
        let mut pmic = Pmic::new();
        pmic.write(CTRL, 0x07);
        let picked = pmic.select([
            req(88, InterruptLevel::Medium),
            req(25, InterruptLevel::Low),
            req(26, InterruptLevel::Medium),
        ]);
        assert_eq!(picked, Some(req(26, InterruptLevel::Medium)));
    }

    #[test]
    fn test_nesting_requires_higher_level() {
        let mut pmic = Pmic::new();
        pmic.write(CTRL, 0x07);
        pmic.acknowledge(req(26, InterruptLevel::Medium));
        assert_eq!(pmic.read(STATUS), 0x02);

        assert_eq!(pmic.select([req(25, InterruptLevel::Medium)]), None);
        assert!(pmic.select([req(58, InterruptLevel::High)]).is_some());

        pmic.acknowledge(req(58, InterruptLevel::High));
        pmic.return_from_interrupt();
        assert_eq!(pmic.read(STATUS), 0x02);
        pmic.return_from_interrupt();
        assert_eq!(pmic.read(STATUS), 0x00);
    }

    #[test]
    fn test_status_is_read_only() {
        let mut pmic = Pmic::new();
        pmic.write(STATUS, 0xFF);
        assert_eq!(pmic.status(), 0);
    }

    #[test]
    fn test_level_field_decoding() {
        assert_eq!(InterruptLevel::from_field(0), None);
        assert_eq!(InterruptLevel::from_field(0x3), Some(InterruptLevel::High));
        assert!(InterruptLevel::High > InterruptLevel::Low);
    }
}
