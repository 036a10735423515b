use sha2::{Digest, Sha256};

/// Hashes are SHA-256 truncated to 128 bits. The truncation width and the
/// all-zero empty-leaf constant are part of the wire contract: peers must
/// agree on both bit-for-bit.
pub const HASH_LEN: usize = 16;

pub type NodeHash = [u8; HASH_LEN];

/// Hash of a leaf that covers no blocks.
pub const EMPTY_HASH: NodeHash = [0; HASH_LEN];

#[derive(Debug, Default)]
pub(crate) struct RangeHasher {
    inner: Sha256,
    fed: bool,
}

impl RangeHasher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&mut self, bytes: &[u8]) {
        self.fed = true;
        self.inner.update(bytes);
    }

    pub fn finalize(self) -> NodeHash {
        if !self.fed {
            return EMPTY_HASH;
        }
        truncate(self.inner.finalize().as_slice())
    }
}

pub(crate) fn hash_pair(left: &NodeHash, right: &NodeHash) -> NodeHash {
    let mut hasher = Sha256::new();
    hasher.update(left);
    hasher.update(right);
    truncate(hasher.finalize().as_slice())
}

fn truncate(digest: &[u8]) -> NodeHash {
    let mut hash = EMPTY_HASH;
    hash.copy_from_slice(&digest[..HASH_LEN]);
    hash
}
