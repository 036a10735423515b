use std::fmt;

use blob_basic_types::{BlobId, BlobKind};
use byteorder::{BigEndian, ByteOrder};
use serde::{Deserialize, Serialize};

/// Half-open `[lo, hi)` window of partition offsets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct OffsetRange {
    pub lo: u64,
    pub hi: u64,
}

impl OffsetRange {
    pub fn new(lo: u64, hi: u64) -> Self {
        debug_assert!(lo <= hi, "inverted offset range [{lo}, {hi})");
        Self { lo, hi }
    }

    pub fn contains(&self, offset: u64) -> bool {
        self.lo <= offset && offset < self.hi
    }

    pub fn is_empty(&self) -> bool {
        self.lo == self.hi
    }

    pub fn len(&self) -> u64 {
        self.hi - self.lo
    }
}

impl fmt::Display for OffsetRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {})", self.lo, self.hi)
    }
}

/// Canonical descriptor of one index entry, the unit fed into leaf hashes.
///
/// Two peers holding the same live entries must produce identical leaf
/// input, so the encoding is fixed: big-endian `id`, `kind`, `crc`,
/// `length`, 28 bytes total.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Block {
    pub id: BlobId,
    pub kind: BlobKind,
    pub crc: u64,
    pub length: u64,
}

impl Block {
    pub const ENCODED_LEN: usize = 28;

    pub fn canonical_bytes(&self) -> [u8; Self::ENCODED_LEN] {
        let mut buf = [0_u8; Self::ENCODED_LEN];
        BigEndian::write_u64(&mut buf[0..8], self.id.0);
        BigEndian::write_i32(&mut buf[8..12], self.kind.0);
        BigEndian::write_u64(&mut buf[12..20], self.crc);
        BigEndian::write_u64(&mut buf[20..28], self.length);
        buf
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn canonical_encoding_is_big_endian() {
        let block = Block {
            id: BlobId(0x0102_0304_0506_0708),
            kind: BlobKind(-1),
            crc: 0x0A0B_0C0D_0E0F_1011,
            length: 4,
        };
        let bytes = block.canonical_bytes();
        assert_eq!(&bytes[0..8], &[1, 2, 3, 4, 5, 6, 7, 8]);
        assert_eq!(&bytes[8..12], &[0xFF, 0xFF, 0xFF, 0xFF]);
        assert_eq!(&bytes[12..20], &[0x0A, 0x0B, 0x0C, 0x0D, 0x0E, 0x0F, 0x10, 0x11]);
        assert_eq!(&bytes[20..28], &[0, 0, 0, 0, 0, 0, 0, 4]);
    }

    #[test]
    fn blocks_order_by_id_then_kind() {
        let a = Block { id: BlobId(1), kind: BlobKind(0), crc: 9, length: 9 };
        let b = Block { id: BlobId(1), kind: BlobKind(2), crc: 0, length: 0 };
        let c = Block { id: BlobId(2), kind: BlobKind(-5), crc: 0, length: 0 };
        assert!(a < b && b < c);
    }
}
