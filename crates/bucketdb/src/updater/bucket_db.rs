//! Ordered in-memory bucket database.
//!
//! Entries are keyed by `BucketId` (bit-reversed order, so a bucket's
//! sub-buckets are contiguous). The database is shared with query paths on
//! other threads; every mutation goes through one of the locked primitives
//! below and never assumes exclusivity beyond a single call.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::RwLock;

use super::types::{BucketCopy, BucketId, NodeIndex};

/// Replica list for one bucket, ordered by ideal-node preference.
///
/// Invariant: no two copies share a node index.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Entry {
    bucket: BucketId,
    copies: Vec<BucketCopy>,
}

impl Entry {
    pub fn new(bucket: BucketId) -> Self {
        Self {
            bucket,
            copies: Vec::new(),
        }
    }

    pub fn with_copies(
        bucket: BucketId,
        copies: Vec<BucketCopy>,
        ideal_order: &[NodeIndex],
    ) -> Self {
        let mut entry = Self::new(bucket);
        entry.add_nodes(&copies, ideal_order);
        entry
    }

    pub fn bucket(&self) -> BucketId {
        self.bucket
    }

    pub fn copies(&self) -> &[BucketCopy] {
        &self.copies
    }

    pub fn node_count(&self) -> usize {
        self.copies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.copies.is_empty()
    }

    pub fn node(&self, node: NodeIndex) -> Option<&BucketCopy> {
        self.copies.iter().find(|c| c.node == node)
    }

    pub fn nodes(&self) -> Vec<NodeIndex> {
        self.copies.iter().map(|c| c.node).collect()
    }

    pub fn clear(&mut self) {
        self.copies.clear();
    }

    /// Insert or replace copies, then reorder by `ideal_order`. Nodes missing
    /// from the ideal order sort after it, by index.
    pub fn add_nodes(&mut self, copies: &[BucketCopy], ideal_order: &[NodeIndex]) {
        for copy in copies {
            match self.copies.iter_mut().find(|c| c.node == copy.node) {
                Some(existing) => *existing = *copy,
                None => self.copies.push(*copy),
            }
        }
        self.copies.sort_by_key(|c| {
            let rank = ideal_order
                .iter()
                .position(|n| *n == c.node)
                .unwrap_or(ideal_order.len());
            (rank, c.node)
        });
    }

    pub fn remove_node(&mut self, node: NodeIndex) -> bool {
        let before = self.copies.len();
        self.copies.retain(|c| c.node != node);
        self.copies.len() != before
    }
}

impl fmt::Display for Entry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} [", self.bucket)?;
        for (i, copy) in self.copies.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "node {}: {}", copy.node, copy.info)?;
        }
        f.write_str("]")
    }
}

/// Per-entry decision returned by a merge processor.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MergeResult {
    /// Entry is retained as it was.
    KeepUnchanged,
    /// Entry was modified in place and must be written back.
    Update,
    /// Entry is dropped from the database.
    Skip,
}

#[derive(Debug, Default)]
pub struct BucketDatabase {
    entries: RwLock<BTreeMap<BucketId, Entry>>,
}

impl BucketDatabase {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().unwrap().is_empty()
    }

    pub fn get(&self, bucket: BucketId) -> Option<Entry> {
        self.entries.read().unwrap().get(&bucket).cloned()
    }

    /// All entries overlapping `bucket`: its parents, itself and its sub-buckets.
    pub fn get_all(&self, bucket: BucketId) -> Vec<Entry> {
        let entries = self.entries.read().unwrap();
        let mut out = Vec::new();
        for bits in 0..bucket.used_bits() {
            let parent = BucketId::new(bits, bucket.id());
            if let Some(entry) = entries.get(&parent) {
                out.push(entry.clone());
            }
        }
        out.extend(
            entries
                .range(bucket..)
                .take_while(|(id, _)| bucket.contains(id))
                .map(|(_, entry)| entry.clone()),
        );
        out
    }

    /// Write `entry`, removing the bucket when it has no copies.
    pub fn update(&self, entry: Entry) {
        let mut entries = self.entries.write().unwrap();
        if entry.is_empty() {
            entries.remove(&entry.bucket);
        } else {
            entries.insert(entry.bucket, entry);
        }
    }

    /// Insert or replace the copy for `copy.node`. A missing entry is only
    /// created when `create_if_nonexisting` is set.
    pub fn update_copy(
        &self,
        bucket: BucketId,
        copy: BucketCopy,
        ideal_order: &[NodeIndex],
        create_if_nonexisting: bool,
    ) -> bool {
        let mut entries = self.entries.write().unwrap();
        match entries.get_mut(&bucket) {
            Some(entry) => {
                entry.add_nodes(&[copy], ideal_order);
                true
            }
            None if create_if_nonexisting => {
                entries.insert(bucket, Entry::with_copies(bucket, vec![copy], ideal_order));
                true
            }
            None => false,
        }
    }

    /// Drop `node`'s copy of `bucket`; the entry goes away with its last copy.
    pub fn remove_node(&self, bucket: BucketId, node: NodeIndex) -> bool {
        let mut entries = self.entries.write().unwrap();
        let Some(entry) = entries.get_mut(&bucket) else {
            return false;
        };
        let removed = entry.remove_node(node);
        if entry.is_empty() {
            entries.remove(&bucket);
        }
        removed
    }

    pub fn remove(&self, bucket: BucketId) -> Option<Entry> {
        self.entries.write().unwrap().remove(&bucket)
    }

    pub fn clear(&self) {
        self.entries.write().unwrap().clear();
    }

    /// Visit entries in key order under the read lock.
    pub fn for_each(&self, mut f: impl FnMut(&Entry)) {
        for entry in self.entries.read().unwrap().values() {
            f(entry);
        }
    }

    pub fn snapshot(&self) -> Vec<Entry> {
        self.entries.read().unwrap().values().cloned().collect()
    }

    /// Stream every entry through `processor` in key order, applying its
    /// decision. Entries left without copies after `Update` are removed.
    pub fn merge(&self, mut processor: impl FnMut(&mut Entry) -> MergeResult) {
        let mut entries = self.entries.write().unwrap();
        entries.retain(|_, entry| match processor(entry) {
            MergeResult::KeepUnchanged => true,
            MergeResult::Update => !entry.is_empty(),
            MergeResult::Skip => false,
        });
    }
}
