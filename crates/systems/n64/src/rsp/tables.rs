//! Reciprocal and inverse square root lookup tables used by VRCP/VRSQ.
//!
//! Both tables are 512 entries of 16-bit mantissas, generated from their
//! closed forms the first time they are needed and shared afterwards.

use std::sync::OnceLock;

pub const TABLE_LEN: usize = 512;

pub struct Tables {
    pub reciprocal: [u16; TABLE_LEN],
    pub inverse_sqrt: [u16; TABLE_LEN],
    identity: u32,
}

impl Tables {
    fn build() -> Self {
        let mut reciprocal = [0u16; TABLE_LEN];
        let mut inverse_sqrt = [0u16; TABLE_LEN];

        for (i, entry) in reciprocal.iter_mut().enumerate() {
            let value = ((1u64 << 34) / (512 + i as u64) + 1) >> 8;
            *entry = value.min(0x1FFFF) as u16;
        }

        for (i, entry) in inverse_sqrt.iter_mut().enumerate() {
            let a = (512 + i as u64) >> (i & 1);
            let mut b = 1u64 << 17;
            // Largest b with a * (b + 1)^2 < 2^44
            while a * (b + 1) * (b + 1) < (1u64 << 44) {
                b += 1;
            }
            *entry = (b >> 1) as u16;
        }

        let mut hasher = crc32fast::Hasher::new();
        for value in reciprocal.iter().chain(inverse_sqrt.iter()) {
            hasher.update(&value.to_le_bytes());
        }

        Self {
            reciprocal,
            inverse_sqrt,
            identity: hasher.finalize(),
        }
    }

    /// CRC32 over both tables; recorded in snapshots
    pub fn identity(&self) -> u32 {
        self.identity
    }
}

pub fn tables() -> &'static Tables {
    static TABLES: OnceLock<Tables> = OnceLock::new();
    TABLES.get_or_init(Tables::build)
}
