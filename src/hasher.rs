use std::fmt;

use crc::{Crc, Digest, CRC_64_ECMA_182};

static CRC64: Crc<u64> = Crc::<u64>::new(&CRC_64_ECMA_182);

/// Running CRC-64 over the key/value entries of one WAL.
#[derive(Clone)]
pub struct Hasher {
    digest: Digest<'static, u64>,
}

impl fmt::Debug for Hasher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Hasher({:#x})", self.value())
    }
}

impl Hasher {
    pub fn new() -> Self {
        Self {
            digest: CRC64.digest(),
        }
    }

    /// Adds one entry. The key length is mixed in so that moving bytes
    /// between key and value changes the sum.
    pub fn update(&mut self, key: &[u8], value: &[u8]) {
        self.digest.update(&(key.len() as u32).to_be_bytes());
        self.digest.update(key);
        self.digest.update(value);
    }

    pub fn value(&self) -> u64 {
        self.digest.clone().finalize()
    }
}

impl Default for Hasher {
    fn default() -> Self {
        Self::new()
    }
}
