//! Shared value types for buckets and replicas.
//!
//! These are kept dependency-light because they flow through every layer:
//! the bucket database, the reconciliation algorithms and the wire messages.

use std::cmp::Ordering;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Index of a node within its node type (storage or distributor).
pub type NodeIndex = u16;
/// Distributor-assigned identifier correlating a command with its reply.
pub type MessageId = u64;

/// Highest number of significant bits a bucket id may use.
pub const MAX_USED_BITS: u8 = 58;

fn low_bits_mask(bits: u32) -> u64 {
    if bits >= 64 {
        u64::MAX
    } else {
        (1u64 << bits) - 1
    }
}

/// Logical namespace of buckets; every space has its own database.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BucketSpace(pub u64);

impl BucketSpace {
    pub const DEFAULT: Self = Self(1);
    pub const GLOBAL: Self = Self(2);

    pub fn name(&self) -> &'static str {
        match *self {
            Self::DEFAULT => "default",
            Self::GLOBAL => "global",
            _ => "unknown",
        }
    }
}

impl fmt::Display for BucketSpace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Bucket identifier.
///
/// The `used_bits` least significant bits of `id` are significant. The low
/// distribution-bit-count bits form the superbucket, which alone decides the
/// owning distributor. Ordering follows the bit-reversed id so that a bucket
/// sorts directly before all buckets it contains.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BucketId {
    used_bits: u8,
    id: u64,
}

impl BucketId {
    /// Placeholder bucket (raw id 0) meaning "every bucket" in requests.
    pub const fn all() -> Self {
        Self {
            used_bits: 0,
            id: 0,
        }
    }

    pub fn new(used_bits: u8, id: u64) -> Self {
        let used_bits = used_bits.min(MAX_USED_BITS);
        Self {
            used_bits,
            id: id & low_bits_mask(u32::from(used_bits)),
        }
    }

    pub fn used_bits(&self) -> u8 {
        self.used_bits
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// Raw encoding: used-bit count in the top 6 bits, id in the rest.
    pub fn raw(&self) -> u64 {
        (u64::from(self.used_bits) << MAX_USED_BITS) | self.id
    }

    pub fn is_all(&self) -> bool {
        self.raw() == 0
    }

    /// Whether `other` is this bucket or one of its sub-buckets.
    pub fn contains(&self, other: &BucketId) -> bool {
        other.used_bits >= self.used_bits
            && (other.id & low_bits_mask(u32::from(self.used_bits))) == self.id
    }

    /// Superbucket number: the `distribution_bits` least significant id bits.
    pub fn superbucket(&self, distribution_bits: u16) -> u64 {
        self.id & low_bits_mask(u32::from(distribution_bits))
    }

    /// Database key: reversed id bits with the used-bit count in the low bits.
    pub fn sort_key(&self) -> u64 {
        self.id.reverse_bits() | u64::from(self.used_bits)
    }
}

impl Ord for BucketId {
    fn cmp(&self, other: &Self) -> Ordering {
        self.sort_key().cmp(&other.sort_key())
    }
}

impl PartialOrd for BucketId {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for BucketId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BucketId(0x{:016x})", self.raw())
    }
}

/// Bucket id qualified with its bucket space.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Bucket {
    pub space: BucketSpace,
    pub id: BucketId,
}

impl Bucket {
    pub fn new(space: BucketSpace, id: BucketId) -> Self {
        Self { space, id }
    }
}

impl fmt::Display for Bucket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Bucket(space: {}, {})", self.space, self.id)
    }
}

/// Replica metadata reported by a storage node.
///
/// A default-constructed value (`last_modified == 0`) is invalid: storage
/// stamps every replica it creates or writes.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BucketInfo {
    pub checksum: u32,
    pub doc_count: u32,
    pub total_bytes: u32,
    pub ready: bool,
    pub active: bool,
    pub last_modified: u64,
}

impl BucketInfo {
    pub fn new(checksum: u32, doc_count: u32, total_bytes: u32, last_modified: u64) -> Self {
        Self {
            checksum,
            doc_count,
            total_bytes,
            ready: false,
            active: false,
            last_modified,
        }
    }

    pub fn valid(&self) -> bool {
        self.last_modified != 0
    }
}

impl fmt::Display for BucketInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if !self.valid() {
            return f.write_str("BucketInfo(invalid)");
        }
        write!(
            f,
            "BucketInfo(crc 0x{:x}, docs {}, bytes {}, ready {}, active {}, modified {})",
            self.checksum,
            self.doc_count,
            self.total_bytes,
            self.ready,
            self.active,
            self.last_modified
        )
    }
}

/// One replica of a bucket on a storage node. Replaced wholesale on update.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BucketCopy {
    pub node: NodeIndex,
    pub timestamp: u64,
    pub info: BucketInfo,
}

impl BucketCopy {
    pub fn new(timestamp: u64, node: NodeIndex, info: BucketInfo) -> Self {
        Self {
            node,
            timestamp,
            info,
        }
    }
}
