//! Range-partitioned hash tree used to reconcile partition contents between
//! peers without shipping the full index.
//!
//! The tree has a fixed shape fully determined by its offset range and
//! `max_level`, so two nodes that agree on those parameters can compare
//! subtrees hash-by-hash and pinpoint divergent leaf ranges in
//! `O(differences * log(leaves))` comparisons.

mod block;
mod hasher;
mod tree;

pub use block::{Block, OffsetRange};
pub use hasher::{NodeHash, EMPTY_HASH, HASH_LEN};
pub use tree::{MerkleTree, TreeError};

/// Deepest supported tree: 2^15 = 32 768 leaves.
pub const MAX_LEVEL: u32 = 15;
