//! CRC-32C (Castagnoli) frame checksum (§4.1).
//!
//! Grounded on the `crc` crate's `CRC_32_ISCSI` table — the original's
//! `crc32c.h` is an out-of-scope ambient collaborator, so this crate is
//! imported fresh rather than hand-rolled.

use crc::{Crc, CRC_32_ISCSI};

static CASTAGNOLI: Crc<u32> = Crc::<u32>::new(&CRC_32_ISCSI);

pub fn crc32c(data: &[u8]) -> u32 {
    CASTAGNOLI.checksum(data)
}
