//! Transaction state owned by a session.
//!
//! A transaction is a per-session value: pending record writes with their
//! base versions, one index overlay per touched index, deferred collection
//! flushes, and a compensation list of trees created inside the window.
//! Nothing here is shared between sessions; the only cross-object handle is
//! the [`TxOutcome`] cell, which lets bags bound to the session observe how
//! the window ended and reconcile lazily.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use rustc_hash::{FxHashMap, FxHashSet};

use crate::index::overlay::IndexOverlay;
use crate::ridbag::changelog::BagOp;
use crate::types::{BonsaiCollectionPointer, ClusterId, RecordId, Version};

/// Externally observable transaction state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxState {
    /// No transaction is open on the session.
    None,
    /// Transaction is open and accepting operations.
    Active,
    /// Outermost commit is running.
    Committing,
    /// Transaction committed durably.
    Committed,
    /// Transaction was rolled back.
    RolledBack,
}

/// How a finished transaction ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxStatus {
    /// Still open.
    Active,
    /// Ended in a durable commit.
    Committed,
    /// Ended discarded.
    RolledBack,
}

const STATUS_ACTIVE: u8 = 0;
const STATUS_COMMITTED: u8 = 1;
const STATUS_ROLLED_BACK: u8 = 2;

/// Shared cell resolved exactly once when the transaction ends.
#[derive(Debug)]
pub struct TxOutcome(AtomicU8);

impl TxOutcome {
    pub(crate) fn new() -> Self {
        Self(AtomicU8::new(STATUS_ACTIVE))
    }

    /// Current status of the transaction this cell belongs to.
    pub fn status(&self) -> TxStatus {
        match self.0.load(Ordering::Acquire) {
            STATUS_COMMITTED => TxStatus::Committed,
            STATUS_ROLLED_BACK => TxStatus::RolledBack,
            _ => TxStatus::Active,
        }
    }

    pub(crate) fn resolve(&self, status: TxStatus) {
        let raw = match status {
            TxStatus::Active => STATUS_ACTIVE,
            TxStatus::Committed => STATUS_COMMITTED,
            TxStatus::RolledBack => STATUS_ROLLED_BACK,
        };
        self.0.store(raw, Ordering::Release);
    }
}

/// Session-lifetime state bags hold onto: which transaction, if any, is
/// currently open on the owning session.
#[derive(Debug, Default)]
pub struct SessionShared {
    current: RwLock<Option<Arc<TxOutcome>>>,
}

impl SessionShared {
    pub(crate) fn set_current(&self, outcome: Option<Arc<TxOutcome>>) {
        *self.current.write() = outcome;
    }

    /// Outcome cell of the transaction currently open on the session.
    pub(crate) fn active_outcome(&self) -> Option<Arc<TxOutcome>> {
        self.current.read().as_ref().map(Arc::clone)
    }
}

/// A pending record mutation carried until commit.
#[derive(Debug, Clone)]
pub(crate) enum RecordOp {
    /// Record created in this transaction; position already reserved.
    Create {
        /// Payload to persist at commit.
        bytes: Vec<u8>,
    },
    /// Update of an existing record against its base version.
    Update {
        /// Payload to persist at commit.
        bytes: Vec<u8>,
        /// Version observed when the record was first loaded.
        base: Version,
    },
    /// Deletion of an existing record against its base version.
    Delete {
        /// Version observed when the record was first loaded.
        base: Version,
    },
}

/// A deferred changelog flush for one tree-backed bag.
#[derive(Debug)]
pub(crate) struct BagFlush {
    pub pointer: BonsaiCollectionPointer,
    /// Shared with the owning bag so mid-transaction reads merge these ops.
    pub ops: Arc<Mutex<Vec<BagOp>>>,
}

/// Everything a session accumulates between `begin` and the outermost
/// `commit`/`rollback`.
#[derive(Debug)]
pub(crate) struct TxContext {
    pub id: u64,
    pub nesting: u32,
    pub state: TxState,
    pub outcome: Arc<TxOutcome>,
    /// Pending record ops, insertion-ordered for deterministic replay.
    pub record_order: Vec<RecordId>,
    pub record_ops: FxHashMap<RecordId, RecordOp>,
    /// Base versions captured on first load inside the transaction.
    pub read_versions: FxHashMap<RecordId, Version>,
    pub overlays: FxHashMap<String, IndexOverlay>,
    pub bag_flushes: Vec<BagFlush>,
    /// Trees created inside the window; deleted again on rollback.
    pub created_trees: Vec<BonsaiCollectionPointer>,
    /// Trees whose deletion is deferred to commit.
    pub deleted_trees: Vec<BonsaiCollectionPointer>,
    pub touched_clusters: FxHashSet<ClusterId>,
}

impl TxContext {
    pub fn new(id: u64) -> Self {
        Self {
            id,
            nesting: 1,
            state: TxState::Active,
            outcome: Arc::new(TxOutcome::new()),
            record_order: Vec::new(),
            record_ops: FxHashMap::default(),
            read_versions: FxHashMap::default(),
            overlays: FxHashMap::default(),
            bag_flushes: Vec::new(),
            created_trees: Vec::new(),
            deleted_trees: Vec::new(),
            touched_clusters: FxHashSet::default(),
        }
    }

    /// Registers a pending op, replacing any earlier op on the same record.
    pub fn push_record_op(&mut self, rid: RecordId, op: RecordOp) {
        if self.record_ops.insert(rid, op).is_none() {
            self.record_order.push(rid);
        }
        self.touched_clusters.insert(rid.cluster);
    }

    /// Queues (or re-queues) the full pending op list for one bag.
    pub fn queue_bag_flush(&mut self, pointer: BonsaiCollectionPointer, ops: Vec<BagOp>) -> Arc<Mutex<Vec<BagOp>>> {
        if let Some(existing) = self
            .bag_flushes
            .iter()
            .find(|flush| flush.pointer == pointer)
        {
            *existing.ops.lock() = ops;
            return Arc::clone(&existing.ops);
        }
        let shared = Arc::new(Mutex::new(ops));
        self.bag_flushes.push(BagFlush {
            pointer,
            ops: Arc::clone(&shared),
        });
        shared
    }

    /// Drops any queued flush for the pointer (bag demoted or deleted).
    pub fn cancel_bag_flush(&mut self, pointer: BonsaiCollectionPointer) {
        self.bag_flushes.retain(|flush| flush.pointer != pointer);
    }
}
