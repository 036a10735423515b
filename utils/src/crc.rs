use crc32fast::Hasher;

/// Running CRC over a stream of payload chunks.
///
/// The checksum is kept as a widened `u64` everywhere it is persisted, so
/// the on-disk format does not change if the algorithm is ever upgraded to
/// a 64-bit one.
#[derive(Debug, Clone, Default)]
pub struct CrcAccumulator {
    hasher: Hasher,
}

impl CrcAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&mut self, bytes: &[u8]) {
        self.hasher.update(bytes);
    }

    /// Checksum of everything fed so far. The accumulator stays usable.
    pub fn value(&self) -> u64 {
        self.hasher.clone().finalize() as u64
    }
}

pub fn crc_of(bytes: &[u8]) -> u64 {
    let mut hasher = Hasher::new();
    hasher.update(bytes);
    hasher.finalize() as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accumulator_matches_one_shot() {
        let mut acc = CrcAccumulator::new();
        acc.update(b"hello ");
        acc.update(b"world");
        assert_eq!(acc.value(), crc_of(b"hello world"));
    }

    #[test]
    fn empty_input_has_stable_value() {
        assert_eq!(crc_of(&[]), CrcAccumulator::new().value());
    }
}
