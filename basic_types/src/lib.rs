use serde::{Deserialize, Serialize};
use std::fmt;
use std::num::ParseIntError;
use std::ops::{Add, Deref, DerefMut, Sub};
use std::str::FromStr;

#[macro_use]
mod macros;

basic_type!(
    /// Globally unique 64-bit blob identifier.
    BlobId,
    u64
);

basic_type!(
    /// Small integer discriminator separating variants of one logical blob
    /// (e.g. original vs transcoded form).
    BlobKind,
    i32
);

basic_type!(
    /// Local disk ordinal a partition lives on.
    DiskId,
    u32
);

basic_type!(
    /// Per-disk partition ordinal; dense and monotonically increasing.
    PartitionId,
    u32
);

basic_type!(
    /// Cluster node identifier handed out by the membership collaborator.
    NodeId,
    u64
);

impl BlobKind {
    /// The variant every uploaded blob gets before any transcoding.
    pub const ORIGINAL: BlobKind = BlobKind(0);
}

#[allow(clippy::derivable_impls)]
impl Default for BlobKind {
    fn default() -> Self {
        Self(0)
    }
}

#[allow(clippy::derivable_impls)]
impl Default for PartitionId {
    fn default() -> Self {
        Self(0)
    }
}
