use std::sync::{Mutex, PoisonError};

use blob_basic_types::BlobId;

use crate::time::millis_since_epoch;

/// Bits reserved for the per-millisecond sequence counter.
const SEQUENCE_BITS: u32 = 22;
const SEQUENCE_MASK: u64 = (1 << SEQUENCE_BITS) - 1;

#[derive(Debug, Default)]
struct LastId {
    millis: u64,
    sequence: u64,
}

/// Monotonic blob id allocator.
///
/// Ids are `millis_since_epoch << 22 | sequence`, which keeps them
/// time-sortable while allowing up to 2^22 allocations per millisecond.
/// A clock that jumps backwards never produces a smaller id: allocation
/// continues from the last observed millisecond.
#[derive(Debug, Default)]
pub struct IdGenerator {
    last: Mutex<LastId>,
}

impl IdGenerator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn generate(&self) -> BlobId {
        let mut last = self.last.lock().unwrap_or_else(PoisonError::into_inner);
        let now = millis_since_epoch().max(last.millis);
        if now == last.millis {
            last.sequence += 1;
            if last.sequence > SEQUENCE_MASK {
                // Sequence exhausted within one millisecond; borrow from the next one.
                last.millis += 1;
                last.sequence = 0;
            }
        } else {
            last.millis = now;
            last.sequence = 0;
        }
        BlobId(last.millis << SEQUENCE_BITS | last.sequence)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_are_strictly_increasing() {
        let generator = IdGenerator::new();
        let mut previous = generator.generate();
        for _ in 0..10_000 {
            let next = generator.generate();
            assert!(next > previous, "{next} should be greater than {previous}");
            previous = next;
        }
    }

    #[test]
    fn sequence_wraps_into_next_millisecond() {
        let generator = IdGenerator::new();
        {
            let mut last = generator.last.lock().unwrap();
            last.millis = millis_since_epoch() + 10_000;
            last.sequence = SEQUENCE_MASK;
        }
        let before = generator.last.lock().unwrap().millis;
        let id = generator.generate();
        let after = generator.last.lock().unwrap().millis;
        assert_eq!(after, before + 1);
        assert_eq!(id.0, after << SEQUENCE_BITS);
    }
}
