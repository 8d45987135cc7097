use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Segment {
    pub start_addr: u64,
    pub data: Vec<u8>,
}

impl Segment {
    pub fn end_addr(&self) -> u64 {
        self.start_addr + self.data.len() as u64
    }
}

/// A loadable firmware image in the unified AVR address space
/// (program memory at 0, data space at 0x800000).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProgramImage {
    pub entry_point: u64,
    pub segments: Vec<Segment>,
}

impl ProgramImage {
    pub fn new(entry_point: u64) -> Self {
        Self {
            entry_point,
            segments: Vec::new(),
        }
    }

    /// An image holding one raw program memory blob at address 0.
    pub fn from_flash_bytes(data: Vec<u8>) -> Self {
        let mut image = Self::new(0);
        image.add_segment(0, data);
        image
    }

    pub fn add_segment(&mut self, start_addr: u64, data: Vec<u8>) {
        self.segments.push(Segment { start_addr, data });
    }

    pub fn total_bytes(&self) -> usize {
        self.segments.iter().map(|s| s.data.len()).sum()
    }
}

/// A simple flat memory storage
#[derive(Debug, Clone)]
pub struct LinearMemory {
    pub data: Vec<u8>,
    pub base_addr: u32,
}

impl LinearMemory {
    pub fn new(size: usize, base_addr: u32) -> Self {
        Self {
            data: vec![0; size],
            base_addr,
        }
    }

    pub fn contains(&self, addr: u32) -> bool {
        addr >= self.base_addr && ((addr - self.base_addr) as usize) < self.data.len()
    }

    pub fn read_u8(&self, addr: u32) -> Option<u8> {
        if self.contains(addr) {
            Some(self.data[(addr - self.base_addr) as usize])
        } else {
            None
        }
    }

    pub fn write_u8(&mut self, addr: u32, value: u8) -> bool {
        if self.contains(addr) {
            self.data[(addr - self.base_addr) as usize] = value;
            true
        } else {
            false
        }
    }

    pub fn end_addr(&self) -> u32 {
        self.base_addr + self.data.len() as u32
    }

    pub fn load_from_segment(&mut self, segment: &Segment) -> bool {
        let mem_end = self.end_addr() as u64;

        if segment.start_addr >= self.base_addr as u64 && segment.end_addr() <= mem_end {
            let offset = (segment.start_addr - self.base_addr as u64) as usize;
            self.data[offset..offset + segment.data.len()].copy_from_slice(&segment.data);
            return true;
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_segment_inside_memory_is_loaded() {
        let mut mem = LinearMemory::new(16, 0x2000);
        let segment = Segment {
            start_addr: 0x2004,
            data: vec![1, 2, 3],
        };
        assert!(mem.load_from_segment(&segment));
        assert_eq!(mem.read_u8(0x2005), Some(2));
        assert_eq!(mem.read_u8(0x2010), None);
    }

    #[test]
    fn test_segment_crossing_end_is_rejected() {
        let mut mem = LinearMemory::new(4, 0);
        let segment = Segment {
            start_addr: 2,
            data: vec![0xAA; 4],
        };
        assert!(!mem.load_from_segment(&segment));
        assert_eq!(mem.data, vec![0; 4]);
    }
}
