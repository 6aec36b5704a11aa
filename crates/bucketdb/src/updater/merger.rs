//! Per-node reconciliation of database contents against a fresh report.

use super::bucket_db::BucketDatabase;
use super::types::{BucketCopy, BucketId, BucketInfo, NodeIndex};

pub type BucketEntry = (BucketId, BucketInfo);

/// Sort a bucket list into the order `BucketListMerger` expects.
pub fn sort_bucket_list(list: &mut [BucketEntry]) {
    list.sort_by_key(|(bucket, _)| *bucket);
}

/// Linear merge-join of what the database believes a node holds
/// (`existing`) against what the node reported (`new_list`).
///
/// Both inputs must be sorted by bucket id. Reported entries with invalid
/// info count as absent.
#[derive(Clone, Debug)]
pub struct BucketListMerger {
    added: Vec<BucketEntry>,
    removed: Vec<BucketId>,
    timestamp: u64,
}

impl BucketListMerger {
    pub fn new(new_list: &[BucketEntry], existing: &[BucketEntry], timestamp: u64) -> Self {
        debug_assert!(new_list.windows(2).all(|w| w[0].0 <= w[1].0));
        debug_assert!(existing.windows(2).all(|w| w[0].0 <= w[1].0));

        let mut added = Vec::new();
        let mut removed = Vec::new();
        let mut reported = new_list.iter().filter(|(_, info)| info.valid()).peekable();
        let mut known = existing.iter().peekable();

        loop {
            match (reported.peek(), known.peek()) {
                (Some(n), Some(e)) => {
                    if n.0 < e.0 {
                        added.push(**n);
                        reported.next();
                    } else if e.0 < n.0 {
                        removed.push(e.0);
                        known.next();
                    } else {
                        if n.1 != e.1 {
                            added.push(**n);
                        }
                        reported.next();
                        known.next();
                    }
                }
                (Some(n), None) => {
                    added.push(**n);
                    reported.next();
                }
                (None, Some(e)) => {
                    removed.push(e.0);
                    known.next();
                }
                (None, None) => break,
            }
        }

        Self {
            added,
            removed,
            timestamp,
        }
    }

    /// Entries to add or update, in bucket order.
    pub fn added_entries(&self) -> &[BucketEntry] {
        &self.added
    }

    /// Buckets the node no longer holds, in bucket order.
    pub fn removed_entries(&self) -> &[BucketId] {
        &self.removed
    }

    pub fn timestamp(&self) -> u64 {
        self.timestamp
    }

    pub fn is_noop(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty()
    }

    /// Write the result for `node` into `db`. Added copies carry the merger
    /// timestamp; `ideal_order` gives each touched entry its replica order.
    pub fn apply_to(
        &self,
        db: &BucketDatabase,
        node: NodeIndex,
        ideal_order: impl Fn(BucketId) -> Vec<NodeIndex>,
    ) {
        for bucket in &self.removed {
            db.remove_node(*bucket, node);
        }
        for (bucket, info) in &self.added {
            let copy = BucketCopy::new(self.timestamp, node, *info);
            db.update_copy(*bucket, copy, &ideal_order(*bucket), true);
        }
    }
}
