use std::fmt;

use crc::{Crc, Digest, CRC_64_ECMA_182};

static CRC64: Crc<u64> = Crc::<u64>::new(&CRC_64_ECMA_182);

/// Incremental CRC-64 over header text and checkpoint journal entries.
#[derive(Clone)]
pub struct Checksum {
    digest: Digest<'static, u64>,
}

impl fmt::Debug for Checksum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Checksum")
    }
}

impl Checksum {
    pub fn new() -> Self {
        Self {
            digest: CRC64.digest(),
        }
    }

    pub fn write(&mut self, data: &[u8]) {
        self.digest.update(data);
    }

    /// Current value; the digest keeps accepting data afterwards.
    pub fn value(&self) -> u64 {
        self.digest.clone().finalize()
    }

    pub fn reset(&mut self) {
        self.digest = CRC64.digest();
    }

    pub fn of(data: &[u8]) -> u64 {
        CRC64.checksum(data)
    }
}

impl Default for Checksum {
    fn default() -> Self {
        Self::new()
    }
}
