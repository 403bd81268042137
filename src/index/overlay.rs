//! Transaction-scoped log of index mutations.
//!
//! One overlay exists per `(transaction, index)` pair, created lazily on the
//! first mutation. It is an ordered log: reads inside the transaction replay
//! a key's entries in issue order over the persisted lookup, and commit
//! replays every entry against the persisted index. No persisted state is
//! touched before commit, and other transactions never see the overlay.

use super::IndexKey;
use crate::types::RecordId;

/// One logged index mutation.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum OverlayOp {
    /// Associate a record with the key.
    Put(RecordId),
    /// Remove one record from the key, or every record when `None`.
    Remove(Option<RecordId>),
}

#[derive(Clone, Debug)]
pub(crate) struct OverlayEntry {
    pub key: IndexKey,
    pub op: OverlayOp,
}

/// Ordered log of uncommitted changes to a single index.
#[derive(Clone, Debug, Default)]
pub struct IndexOverlay {
    entries: Vec<OverlayEntry>,
}

impl IndexOverlay {
    /// Empty overlay.
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a put.
    pub fn put(&mut self, key: IndexKey, rid: RecordId) {
        self.entries.push(OverlayEntry {
            key,
            op: OverlayOp::Put(rid),
        });
    }

    /// Appends a remove; `None` clears the whole key.
    pub fn remove(&mut self, key: IndexKey, rid: Option<RecordId>) {
        self.entries.push(OverlayEntry {
            key,
            op: OverlayOp::Remove(rid),
        });
    }

    /// `true` when the overlay logs no operation.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Number of logged operations.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Replays this key's entries, in issue order, over `base`.
    pub fn apply_to_key(&self, key: &IndexKey, base: Vec<RecordId>) -> Vec<RecordId> {
        let mut rids = base;
        for entry in &self.entries {
            if entry.key != *key {
                continue;
            }
            match entry.op {
                OverlayOp::Put(rid) => {
                    if !rids.contains(&rid) {
                        rids.push(rid);
                    }
                }
                OverlayOp::Remove(Some(rid)) => rids.retain(|existing| *existing != rid),
                OverlayOp::Remove(None) => rids.clear(),
            }
        }
        rids
    }

    /// Keys this overlay touches, deduplicated, in first-touch order.
    pub fn touched_keys(&self) -> Vec<IndexKey> {
        let mut keys: Vec<IndexKey> = Vec::new();
        for entry in &self.entries {
            if !keys.contains(&entry.key) {
                keys.push(entry.key.clone());
            }
        }
        keys
    }
}
