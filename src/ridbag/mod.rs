//! Dual-representation collections of record references.
//!
//! A [`RidBag`] presents one `add/remove/size/iter` contract over two
//! interchangeable representations: a small inline multiset serialized with
//! the owning record, and a pointer to a disk-resident tree for large
//! collections. Mutations always land in the in-memory pending changelog;
//! the representation is only reconsidered at save time, by a pure function
//! of the current state, the logical size, and the configured thresholds.
//!
//! A bag is bound to the session that created or loaded it. While a
//! transaction is open on that session, the first mutation snapshots the
//! bag; when the bag next observes that the transaction rolled back it
//! restores the snapshot — the exact last-committed representation and
//! contents, not merely the last-saved ones.

pub mod changelog;

use std::sync::Arc;

use parking_lot::Mutex;
use smallvec::SmallVec;
use tracing::debug;

use crate::bonsai::manager::{CollectionManager, TreeScan};
use crate::config::StorageConfig;
use crate::error::{Result, StorageError};
use crate::tx::{SessionShared, TxOutcome, TxStatus};
use crate::types::{read_i32, BonsaiCollectionPointer, RecordId};
use changelog::{replay_with_cancellation, BagChangeLog, BagOp};

/// Session facilities a bag needs after it leaves the session's hands.
#[derive(Clone)]
pub(crate) struct BagContext {
    pub shared: Arc<SessionShared>,
    pub collections: Arc<CollectionManager>,
}

/// Backing representation of a bag.
#[derive(Clone, Debug)]
pub(crate) enum RidBagState {
    /// Inline multiset, serialized with the owning record.
    Embedded {
        entries: SmallVec<[RecordId; 4]>,
    },
    /// Disk-resident tree plus its last-committed entry count.
    Tree {
        pointer: BonsaiCollectionPointer,
        tree_size: i64,
    },
}

/// Representation tag used by the transition decision.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) enum BagRepr {
    Embedded,
    Tree,
}

/// Pure save-time transition decision.
pub(crate) fn decide_transition(
    current: BagRepr,
    size: i64,
    config: &StorageConfig,
) -> Option<BagRepr> {
    match current {
        BagRepr::Embedded
            if config.top_threshold != -1 && size > i64::from(config.top_threshold) =>
        {
            Some(BagRepr::Tree)
        }
        BagRepr::Tree if size < i64::from(config.bottom_threshold) => Some(BagRepr::Embedded),
        _ => None,
    }
}

#[derive(Clone)]
struct BagSnapshot {
    state: RidBagState,
    changes: BagChangeLog,
}

struct TxMark {
    outcome: Arc<TxOutcome>,
    snapshot: BagSnapshot,
}

/// A collection of record references owned by one document field.
pub struct RidBag {
    pub(crate) ctx: BagContext,
    pub(crate) state: RidBagState,
    pub(crate) changes: BagChangeLog,
    /// Ops already handed to the open transaction for flushing; shared so
    /// mid-transaction reads keep seeing them.
    pub(crate) pending_flush: Option<Arc<Mutex<Vec<BagOp>>>>,
    tx_mark: Option<TxMark>,
}

impl RidBag {
    pub(crate) fn new_embedded(ctx: BagContext) -> Self {
        Self {
            ctx,
            state: RidBagState::Embedded {
                entries: SmallVec::new(),
            },
            changes: BagChangeLog::new(),
            pending_flush: None,
            tx_mark: None,
        }
    }

    pub(crate) fn from_state(ctx: BagContext, state: RidBagState) -> Self {
        Self {
            ctx,
            state,
            changes: BagChangeLog::new(),
            pending_flush: None,
            tx_mark: None,
        }
    }

    /// Folds or restores state left over from a finished transaction.
    pub(crate) fn reconcile(&mut self) {
        let Some(mark) = &self.tx_mark else {
            return;
        };
        match mark.outcome.status() {
            TxStatus::Active => {}
            TxStatus::Committed => {
                if let Some(flushed) = self.pending_flush.take() {
                    let delta: i64 = flushed.lock().iter().map(BagOp::delta).sum();
                    if let RidBagState::Tree { tree_size, .. } = &mut self.state {
                        *tree_size += delta;
                    }
                }
                self.tx_mark = None;
            }
            TxStatus::RolledBack => {
                let mark = self.tx_mark.take();
                if let Some(mark) = mark {
                    self.state = mark.snapshot.state;
                    self.changes = mark.snapshot.changes;
                }
                self.pending_flush = None;
            }
        }
    }

    /// Snapshots the bag the first time it is touched inside a transaction.
    pub(crate) fn observe_mutation(&mut self) {
        self.reconcile();
        if self.tx_mark.is_some() {
            return;
        }
        if let Some(outcome) = self.ctx.shared.active_outcome() {
            self.tx_mark = Some(TxMark {
                outcome,
                snapshot: BagSnapshot {
                    state: self.state.clone(),
                    changes: self.changes.clone(),
                },
            });
        }
    }

    /// Appends one occurrence of `rid`.
    pub fn add(&mut self, rid: RecordId) {
        self.observe_mutation();
        self.changes.push_add(rid);
    }

    /// Removes one occurrence of `rid`. Returns `false` when the bag
    /// verifiably holds no occurrence; in the tree representation absence
    /// cannot be checked without a scan, so the removal is recorded and
    /// reconciled when the changelog is flushed.
    pub fn remove(&mut self, rid: RecordId) -> bool {
        self.observe_mutation();
        match &self.state {
            RidBagState::Embedded { entries } => {
                if self.changes.pending_adds_of(rid) > 0 {
                    self.changes.push_remove(rid);
                    return true;
                }
                let in_base = entries.iter().filter(|entry| **entry == rid).count();
                if in_base > self.changes.pending_removes_of(rid) {
                    self.changes.push_remove(rid);
                    true
                } else {
                    false
                }
            }
            RidBagState::Tree { .. } => {
                self.changes.push_remove(rid);
                true
            }
        }
    }

    /// Logical size: base representation plus every pending delta. Never a
    /// full materialization.
    pub fn size(&mut self) -> i64 {
        self.reconcile();
        let base = match &self.state {
            RidBagState::Embedded { entries } => entries.len() as i64,
            RidBagState::Tree { tree_size, .. } => *tree_size,
        };
        let queued: i64 = self
            .pending_flush
            .as_ref()
            .map(|ops| ops.lock().iter().map(BagOp::delta).sum())
            .unwrap_or(0);
        (base + queued + self.changes.delta()).max(0)
    }

    /// `true` while the bag is in its inline representation.
    pub fn is_embedded(&mut self) -> bool {
        self.reconcile();
        matches!(self.state, RidBagState::Embedded { .. })
    }

    /// Pending ops merged over anything already queued for flushing.
    pub(crate) fn combined_ops(&self) -> Vec<BagOp> {
        let queued = self
            .pending_flush
            .as_ref()
            .map(|ops| ops.lock().clone())
            .unwrap_or_default();
        replay_with_cancellation(queued, self.changes.ops())
    }

    /// Iterates the logical contents: base entries with pending removals
    /// cancelled (first matching occurrence each), pending additions
    /// appended. Tree-backed bags stream the tree lazily.
    pub fn iter(&mut self) -> Result<BagIter> {
        self.reconcile();
        let combined = self.combined_ops();
        let mut adds = Vec::new();
        let mut removals = Vec::new();
        for op in combined {
            match op {
                BagOp::Add(rid) => adds.push(rid),
                BagOp::Remove(rid) => removals.push(rid),
            }
        }
        match &self.state {
            RidBagState::Embedded { entries } => {
                let mut merged: Vec<RecordId> = entries.iter().copied().collect();
                for rid in removals {
                    if let Some(position) = merged.iter().position(|entry| *entry == rid) {
                        merged.remove(position);
                    }
                }
                merged.extend(adds);
                Ok(BagIter {
                    inner: BagIterInner::Inline(merged.into_iter()),
                })
            }
            RidBagState::Tree { pointer, .. } => {
                let scan = self.ctx.collections.iterate(*pointer)?;
                Ok(BagIter {
                    inner: BagIterInner::Tree {
                        scan,
                        removals,
                        adds: adds.into_iter(),
                    },
                })
            }
        }
    }

    /// Collects the logical contents eagerly. Convenience over [`iter`].
    ///
    /// [`iter`]: RidBag::iter
    pub fn to_vec(&mut self) -> Result<Vec<RecordId>> {
        self.iter()?.collect()
    }

    pub(crate) fn repr(&self) -> BagRepr {
        match self.state {
            RidBagState::Embedded { .. } => BagRepr::Embedded,
            RidBagState::Tree { .. } => BagRepr::Tree,
        }
    }

    pub(crate) fn tree_pointer(&self) -> Option<BonsaiCollectionPointer> {
        match &self.state {
            RidBagState::Tree { pointer, .. } => Some(*pointer),
            RidBagState::Embedded { .. } => None,
        }
    }
}

enum BagIterInner {
    Inline(std::vec::IntoIter<RecordId>),
    Tree {
        scan: TreeScan,
        removals: Vec<RecordId>,
        adds: std::vec::IntoIter<RecordId>,
    },
}

/// Iterator over a bag's logical contents.
pub struct BagIter {
    inner: BagIterInner,
}

impl Iterator for BagIter {
    type Item = Result<RecordId>;

    fn next(&mut self) -> Option<Self::Item> {
        match &mut self.inner {
            BagIterInner::Inline(entries) => entries.next().map(Ok),
            BagIterInner::Tree {
                scan,
                removals,
                adds,
            } => loop {
                match scan.next() {
                    Some(Ok(rid)) => {
                        if let Some(position) = removals.iter().position(|entry| *entry == rid) {
                            removals.remove(position);
                            continue;
                        }
                        return Some(Ok(rid));
                    }
                    Some(Err(err)) => return Some(Err(err)),
                    None => return adds.next().map(Ok),
                }
            },
        }
    }
}

const CONFIG_EMBEDDED: u8 = 0x01;

/// Decoded persisted form of a bag.
pub(crate) enum DecodedBag {
    Embedded(Vec<RecordId>),
    Tree(BonsaiCollectionPointer),
}

/// Serializes the inline form: config byte, entry count, entries.
pub(crate) fn encode_embedded(entries: &[RecordId]) -> Vec<u8> {
    let mut out = Vec::with_capacity(1 + 4 + entries.len() * RecordId::ENCODED_LEN);
    out.push(CONFIG_EMBEDDED);
    out.extend_from_slice(&(entries.len() as i32).to_be_bytes());
    for rid in entries {
        rid.encode_into(&mut out);
    }
    out
}

/// Serializes the tree form: config byte, then the pointer triple in place
/// of the entry array.
pub(crate) fn encode_tree(pointer: BonsaiCollectionPointer) -> Vec<u8> {
    let mut out = Vec::with_capacity(1 + BonsaiCollectionPointer::ENCODED_LEN);
    out.push(0);
    pointer.encode_into(&mut out);
    out
}

/// Decodes either persisted form.
pub(crate) fn decode(bytes: &[u8]) -> Result<DecodedBag> {
    let (&config, rest) = bytes
        .split_first()
        .ok_or_else(|| StorageError::Corruption("empty rid bag payload".into()))?;
    if config & CONFIG_EMBEDDED != 0 {
        if rest.len() < 4 {
            return Err(StorageError::Corruption("rid bag count truncated".into()));
        }
        let count = read_i32(rest, 0);
        if count < 0 {
            return Err(StorageError::Corruption("negative rid bag count".into()));
        }
        let count = count as usize;
        let body = &rest[4..];
        if body.len() < count * RecordId::ENCODED_LEN {
            return Err(StorageError::Corruption("rid bag entries truncated".into()));
        }
        let mut entries = Vec::with_capacity(count);
        for index in 0..count {
            entries.push(RecordId::decode(&body[index * RecordId::ENCODED_LEN..])?);
        }
        debug!(entries = entries.len(), "decoded embedded rid bag");
        Ok(DecodedBag::Embedded(entries))
    } else {
        let pointer = BonsaiCollectionPointer::decode(rest)?;
        Ok(DecodedBag::Tree(pointer))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transition_promotes_above_top() {
        let config = StorageConfig {
            top_threshold: 5,
            bottom_threshold: 4,
            ..StorageConfig::default()
        };
        assert_eq!(
            decide_transition(BagRepr::Embedded, 6, &config),
            Some(BagRepr::Tree)
        );
        assert_eq!(decide_transition(BagRepr::Embedded, 5, &config), None);
    }

    #[test]
    fn transition_demotes_below_bottom() {
        let config = StorageConfig {
            top_threshold: 5,
            bottom_threshold: 4,
            ..StorageConfig::default()
        };
        assert_eq!(
            decide_transition(BagRepr::Tree, 3, &config),
            Some(BagRepr::Embedded)
        );
        assert_eq!(decide_transition(BagRepr::Tree, 4, &config), None);
    }

    #[test]
    fn disabled_top_threshold_never_promotes() {
        let config = StorageConfig::embedded_only();
        assert_eq!(
            decide_transition(BagRepr::Embedded, i64::from(i32::MAX), &config),
            None
        );
    }

    #[test]
    fn embedded_encoding_roundtrip() {
        let entries = vec![RecordId::new(1, 10), RecordId::new(2, 20)];
        let bytes = encode_embedded(&entries);
        match decode(&bytes).expect("decode") {
            DecodedBag::Embedded(decoded) => assert_eq!(decoded, entries),
            DecodedBag::Tree(_) => panic!("expected embedded form"),
        }
    }

    #[test]
    fn tree_encoding_roundtrip() {
        let pointer = BonsaiCollectionPointer::new(4, 7);
        let bytes = encode_tree(pointer);
        match decode(&bytes).expect("decode") {
            DecodedBag::Tree(decoded) => assert_eq!(decoded, pointer),
            DecodedBag::Embedded(_) => panic!("expected tree form"),
        }
    }

    #[test]
    fn truncated_payloads_are_rejected() {
        assert!(decode(&[]).is_err());
        assert!(decode(&[CONFIG_EMBEDDED, 0, 0]).is_err());
        let entries = vec![RecordId::new(1, 1)];
        let mut bytes = encode_embedded(&entries);
        bytes.truncate(bytes.len() - 1);
        assert!(decode(&bytes).is_err());
    }
}
