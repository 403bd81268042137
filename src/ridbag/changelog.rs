//! Pending changelog of an open collection.
//!
//! Every bag mutation lands here first, regardless of representation. An add
//! and a remove of the same record id inside one uncommitted window cancel
//! each other instead of double-applying; everything else is kept in issue
//! order so replays against the backing tree are deterministic.

use crate::types::RecordId;

/// One pending bag mutation.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum BagOp {
    /// Append one occurrence of the record id.
    Add(RecordId),
    /// Drop the first matching occurrence of the record id.
    Remove(RecordId),
}

impl BagOp {
    /// Record id the operation refers to.
    pub fn rid(&self) -> RecordId {
        match *self {
            BagOp::Add(rid) | BagOp::Remove(rid) => rid,
        }
    }

    /// Signed size contribution of the operation.
    pub fn delta(&self) -> i64 {
        match self {
            BagOp::Add(_) => 1,
            BagOp::Remove(_) => -1,
        }
    }
}

/// Ordered log of not-yet-durable bag mutations.
#[derive(Clone, Debug, Default)]
pub struct BagChangeLog {
    ops: Vec<BagOp>,
    delta: i64,
}

impl BagChangeLog {
    /// Empty changelog.
    pub fn new() -> Self {
        Self::default()
    }

    /// Records an add, cancelling the newest pending remove of `rid` if one
    /// exists.
    pub fn push_add(&mut self, rid: RecordId) {
        if let Some(position) = self
            .ops
            .iter()
            .rposition(|op| *op == BagOp::Remove(rid))
        {
            self.ops.remove(position);
        } else {
            self.ops.push(BagOp::Add(rid));
        }
        self.delta += 1;
    }

    /// Records a remove, cancelling the newest pending add of `rid` if one
    /// exists.
    pub fn push_remove(&mut self, rid: RecordId) {
        if let Some(position) = self.ops.iter().rposition(|op| *op == BagOp::Add(rid)) {
            self.ops.remove(position);
        } else {
            self.ops.push(BagOp::Remove(rid));
        }
        self.delta -= 1;
    }

    /// Net size contribution of the log.
    pub fn delta(&self) -> i64 {
        self.delta
    }

    /// `true` when no operation is pending.
    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    /// Pending operations in issue order.
    pub fn ops(&self) -> &[BagOp] {
        &self.ops
    }

    /// Number of pending adds of `rid` still in the log.
    pub fn pending_adds_of(&self, rid: RecordId) -> usize {
        self.ops.iter().filter(|op| **op == BagOp::Add(rid)).count()
    }

    /// Number of pending removes of `rid` still in the log.
    pub fn pending_removes_of(&self, rid: RecordId) -> usize {
        self.ops
            .iter()
            .filter(|op| **op == BagOp::Remove(rid))
            .count()
    }

    /// Drains the log, returning the ops in issue order.
    pub fn take_ops(&mut self) -> Vec<BagOp> {
        self.delta = 0;
        std::mem::take(&mut self.ops)
    }

    /// Discards every pending operation.
    pub fn clear(&mut self) {
        self.ops.clear();
        self.delta = 0;
    }
}

/// Replays `ops` onto an `(adds, removes)` pair with the same cancellation
/// rule the live log applies, starting from `base`. Used to merge a bag's
/// already-queued flush with its newer pending operations.
pub fn replay_with_cancellation(base: Vec<BagOp>, ops: &[BagOp]) -> Vec<BagOp> {
    let mut log = BagChangeLog {
        delta: base.iter().map(BagOp::delta).sum(),
        ops: base,
    };
    for op in ops {
        match op {
            BagOp::Add(rid) => log.push_add(*rid),
            BagOp::Remove(rid) => log.push_remove(*rid),
        }
    }
    log.ops
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn rid(position: i64) -> RecordId {
        RecordId::new(1, position)
    }

    #[test]
    fn add_then_remove_cancels() {
        let mut log = BagChangeLog::new();
        log.push_add(rid(1));
        log.push_remove(rid(1));
        assert!(log.is_empty());
        assert_eq!(log.delta(), 0);
    }

    #[test]
    fn remove_then_add_cancels() {
        let mut log = BagChangeLog::new();
        log.push_remove(rid(2));
        log.push_add(rid(2));
        assert!(log.is_empty());
        assert_eq!(log.delta(), 0);
    }

    #[test]
    fn duplicates_survive_single_cancellation() {
        let mut log = BagChangeLog::new();
        log.push_add(rid(3));
        log.push_add(rid(3));
        log.push_remove(rid(3));
        assert_eq!(log.ops(), &[BagOp::Add(rid(3))]);
        assert_eq!(log.delta(), 1);
    }

    #[test]
    fn order_is_preserved_for_distinct_rids() {
        let mut log = BagChangeLog::new();
        log.push_add(rid(1));
        log.push_remove(rid(9));
        log.push_add(rid(2));
        assert_eq!(
            log.ops(),
            &[BagOp::Add(rid(1)), BagOp::Remove(rid(9)), BagOp::Add(rid(2))]
        );
        assert_eq!(log.delta(), 1);
    }

    #[test]
    fn replay_merges_queued_and_new_ops() {
        let queued = vec![BagOp::Add(rid(1)), BagOp::Add(rid(2))];
        let newer = [BagOp::Remove(rid(1)), BagOp::Add(rid(3))];
        let merged = replay_with_cancellation(queued, &newer);
        assert_eq!(merged, vec![BagOp::Add(rid(2)), BagOp::Add(rid(3))]);
    }

    proptest! {
        #[test]
        fn delta_always_tracks_ops(choices in proptest::collection::vec((0i64..8, prop::bool::ANY), 0..64)) {
            let mut log = BagChangeLog::new();
            let mut expected = 0i64;
            for (position, is_add) in choices {
                if is_add {
                    log.push_add(rid(position));
                } else {
                    log.push_remove(rid(position));
                }
                expected += if is_add { 1 } else { -1 };
            }
            prop_assert_eq!(log.delta(), expected);
            let from_ops: i64 = log.ops().iter().map(BagOp::delta).sum();
            prop_assert_eq!(from_ops, log.delta());
        }
    }
}
