use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::{
    block::{Block, OffsetRange},
    hasher::{hash_pair, NodeHash, RangeHasher, EMPTY_HASH},
    MAX_LEVEL,
};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TreeError {
    #[error(
        "cannot diff trees over {local} at level {local_level} and {remote} at level {remote_level}"
    )]
    IncompatibleTrees {
        local: OffsetRange,
        local_level: u32,
        remote: OffsetRange,
        remote_level: u32,
    },
    #[error("max level {0} exceeds the supported depth {1}")]
    LevelOutOfBounds(u32, u32),
    #[error("offset range {0} is empty")]
    EmptyRange(OffsetRange),
    #[error("block offset {0} falls outside the tree range {1}")]
    OffsetOutOfRange(u64, OffsetRange),
    #[error("serialized tree carries {actual} leaves, shape requires {expected}")]
    LeafCountMismatch { expected: usize, actual: usize },
}

/// Fixed-shape hash tree over the offset range of one partition.
///
/// Interior nodes are kept in a 1-based heap layout: `nodes[1]` is the
/// root, children of `i` are `2i` and `2i + 1`, leaves occupy
/// `[leaf_count, 2 * leaf_count)`. Only the leaves travel over the wire;
/// interior hashes are recomputed on receipt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "RawMerkleTree", into = "RawMerkleTree")]
pub struct MerkleTree {
    range: OffsetRange,
    max_level: u32,
    nodes: Vec<NodeHash>,
}

/// Wire shape: `(range, max_level, leaves)`, leaves left-to-right.
#[derive(Debug, Serialize, Deserialize)]
struct RawMerkleTree {
    range: OffsetRange,
    max_level: u32,
    leaves: Vec<NodeHash>,
}

impl MerkleTree {
    /// Builds the tree for `blocks`, a map from partition offset to the
    /// block stored at that offset. Blocks must already be the live set:
    /// deleted entries are the caller's concern.
    pub fn build(
        range: OffsetRange,
        max_level: u32,
        blocks: &BTreeMap<u64, Block>,
    ) -> Result<Self, TreeError> {
        validate_shape(range, max_level)?;
        let leaf_count = 1_usize << max_level;
        let mut leaves = vec![EMPTY_HASH; leaf_count];

        let mut current: Option<(usize, RangeHasher)> = None;
        for (&offset, block) in blocks {
            if !range.contains(offset) {
                return Err(TreeError::OffsetOutOfRange(offset, range));
            }
            let leaf = leaf_index(range, max_level, offset);
            match &mut current {
                Some((index, hasher)) if *index == leaf => {
                    hasher.update(&block.canonical_bytes());
                }
                _ => {
                    if let Some((index, hasher)) = current.take() {
                        leaves[index] = hasher.finalize();
                    }
                    let mut hasher = RangeHasher::new();
                    hasher.update(&block.canonical_bytes());
                    current = Some((leaf, hasher));
                }
            }
        }
        if let Some((index, hasher)) = current.take() {
            leaves[index] = hasher.finalize();
        }

        Ok(Self::from_leaf_hashes(range, max_level, leaves))
    }

    pub fn empty(range: OffsetRange, max_level: u32) -> Result<Self, TreeError> {
        Self::build(range, max_level, &BTreeMap::new())
    }

    fn from_leaf_hashes(range: OffsetRange, max_level: u32, leaves: Vec<NodeHash>) -> Self {
        let leaf_count = leaves.len();
        let mut nodes = vec![EMPTY_HASH; leaf_count * 2];
        nodes[leaf_count..].copy_from_slice(&leaves);
        for index in (1..leaf_count).rev() {
            nodes[index] = hash_pair(&nodes[index * 2], &nodes[index * 2 + 1]);
        }
        Self {
            range,
            max_level,
            nodes,
        }
    }

    pub fn range(&self) -> OffsetRange {
        self.range
    }

    pub fn max_level(&self) -> u32 {
        self.max_level
    }

    pub fn leaf_count(&self) -> usize {
        1 << self.max_level
    }

    pub fn root_hash(&self) -> NodeHash {
        self.nodes[1]
    }

    pub fn leaves(&self) -> &[NodeHash] {
        &self.nodes[self.leaf_count()..]
    }

    /// Offset window covered by leaf `index`. The last leaf absorbs the
    /// division remainder; with more leaves than offsets trailing leaves
    /// collapse to empty windows.
    pub fn leaf_range(&self, index: usize) -> OffsetRange {
        let span = leaf_span(self.range, self.max_level);
        let leaf_count = self.leaf_count() as u64;
        let lo = (self.range.lo + index as u64 * span).min(self.range.hi);
        let hi = if index as u64 == leaf_count - 1 {
            self.range.hi
        } else {
            (self.range.lo + (index as u64 + 1) * span).min(self.range.hi)
        };
        OffsetRange::new(lo, hi)
    }

    /// Offset ranges whose contents differ between `self` and `other`.
    ///
    /// Equal subtree hashes prune the descent; divergent leaves are emitted
    /// left-to-right, so the result is sorted and non-overlapping. Adjacent
    /// divergent leaves are coalesced into one range.
    pub fn difference(&self, other: &Self) -> Result<Vec<OffsetRange>, TreeError> {
        if self.range != other.range || self.max_level != other.max_level {
            return Err(TreeError::IncompatibleTrees {
                local: self.range,
                local_level: self.max_level,
                remote: other.range,
                remote_level: other.max_level,
            });
        }

        let mut divergent = Vec::new();
        self.collect_divergent(other, 1, &mut divergent);

        let mut ranges: Vec<OffsetRange> = Vec::with_capacity(divergent.len());
        for range in divergent {
            if range.is_empty() {
                continue;
            }
            match ranges.last_mut() {
                Some(previous) if previous.hi == range.lo => previous.hi = range.hi,
                _ => ranges.push(range),
            }
        }
        Ok(ranges)
    }

    fn collect_divergent(&self, other: &Self, index: usize, out: &mut Vec<OffsetRange>) {
        if self.nodes[index] == other.nodes[index] {
            return;
        }
        let leaf_count = self.leaf_count();
        if index >= leaf_count {
            out.push(self.leaf_range(index - leaf_count));
            return;
        }
        self.collect_divergent(other, index * 2, out);
        self.collect_divergent(other, index * 2 + 1, out);
    }
}

impl TryFrom<RawMerkleTree> for MerkleTree {
    type Error = TreeError;

    fn try_from(raw: RawMerkleTree) -> Result<Self, TreeError> {
        validate_shape(raw.range, raw.max_level)?;
        let expected = 1_usize << raw.max_level;
        if raw.leaves.len() != expected {
            return Err(TreeError::LeafCountMismatch {
                expected,
                actual: raw.leaves.len(),
            });
        }
        Ok(Self::from_leaf_hashes(raw.range, raw.max_level, raw.leaves))
    }
}

impl From<MerkleTree> for RawMerkleTree {
    fn from(tree: MerkleTree) -> Self {
        let leaves = tree.leaves().to_vec();
        Self {
            range: tree.range,
            max_level: tree.max_level,
            leaves,
        }
    }
}

fn validate_shape(range: OffsetRange, max_level: u32) -> Result<(), TreeError> {
    if max_level > MAX_LEVEL {
        return Err(TreeError::LevelOutOfBounds(max_level, MAX_LEVEL));
    }
    if range.is_empty() || range.lo > range.hi {
        return Err(TreeError::EmptyRange(range));
    }
    Ok(())
}

fn leaf_span(range: OffsetRange, max_level: u32) -> u64 {
    (range.len() >> max_level).max(1)
}

fn leaf_index(range: OffsetRange, max_level: u32, offset: u64) -> usize {
    let span = leaf_span(range, max_level);
    let leaf_count = 1_u64 << max_level;
    (((offset - range.lo) / span).min(leaf_count - 1)) as usize
}
