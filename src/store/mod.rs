//! The record store and its per-thread sessions.
//!
//! [`RecordStore`] owns the shared state: record clusters (the record-layer
//! collaborator), the persisted indexes, the collection manager, and the
//! commit choke point. It is a cheap clone-able handle; every thread takes
//! its own [`Session`] and no transaction state is ever shared between
//! sessions.
//!
//! Outside a transaction every operation commits on its own. Inside one,
//! record writes, index mutations, and collection flushes accumulate on the
//! session and are applied at the outermost `commit` as one atomic unit:
//! base versions are checked first, unique constraints second, and only then
//! is anything applied — a conflict or violation aborts the whole
//! transaction with nothing persisted.

use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use rustc_hash::FxHashMap;
use smallvec::SmallVec;
use tracing::{debug, info, warn};

use crate::bonsai::manager::CollectionManager;
use crate::config::StorageConfig;
use crate::error::{Result, StorageError};
use crate::index::overlay::IndexOverlay;
use crate::index::{IndexDefinition, IndexKey, IndexStore};
use crate::ridbag::changelog::{replay_with_cancellation, BagOp};
use crate::ridbag::{
    decode as decode_bag, encode_embedded, encode_tree, decide_transition, BagContext, BagRepr,
    DecodedBag, RidBag, RidBagState,
};
use crate::tx::{RecordOp, SessionShared, TxContext, TxState, TxStatus};
use crate::types::{ClusterId, ClusterPosition, RecordId, Version};

#[derive(Debug)]
struct StoredRecord {
    bytes: Vec<u8>,
    version: Version,
}

#[derive(Clone, Copy)]
enum PendingKind {
    Create,
    Update(Version),
    Delete,
}

#[derive(Debug, Default)]
struct Cluster {
    records: FxHashMap<ClusterPosition, StoredRecord>,
    next_position: ClusterPosition,
}

pub(crate) struct StoreInner {
    config: StorageConfig,
    clusters: RwLock<FxHashMap<ClusterId, Cluster>>,
    indexes: IndexStore,
    collections: Arc<CollectionManager>,
    commit_lock: Mutex<()>,
    next_tx_id: AtomicU64,
}

impl StoreInner {
    fn load_committed(&self, rid: RecordId) -> Result<(Vec<u8>, Version)> {
        let clusters = self.clusters.read();
        let record = clusters
            .get(&rid.cluster)
            .and_then(|cluster| cluster.records.get(&rid.position))
            .ok_or(StorageError::NotFound("record"))?;
        Ok((record.bytes.clone(), record.version))
    }

    fn committed_version(&self, rid: RecordId) -> Option<Version> {
        let clusters = self.clusters.read();
        clusters
            .get(&rid.cluster)
            .and_then(|cluster| cluster.records.get(&rid.position))
            .map(|record| record.version)
    }

    fn reserve_position(&self, cluster: ClusterId) -> ClusterPosition {
        let mut clusters = self.clusters.write();
        let cluster = clusters.entry(cluster).or_default();
        let position = cluster.next_position;
        cluster.next_position += 1;
        position
    }

    /// Record-layer save: `expected == None` creates, otherwise the current
    /// version must match or the save fails with a conflict.
    fn save_committed(
        &self,
        rid: RecordId,
        bytes: &[u8],
        expected: Option<Version>,
    ) -> Result<Version> {
        let mut clusters = self.clusters.write();
        let cluster = clusters.entry(rid.cluster).or_default();
        match (cluster.records.get_mut(&rid.position), expected) {
            (None, None) => {
                cluster.records.insert(
                    rid.position,
                    StoredRecord {
                        bytes: bytes.to_vec(),
                        version: 1,
                    },
                );
                Ok(1)
            }
            (Some(record), Some(expected)) => {
                if record.version != expected {
                    return Err(StorageError::VersionConflict {
                        rid,
                        expected,
                        actual: record.version,
                    });
                }
                record.bytes = bytes.to_vec();
                record.version += 1;
                Ok(record.version)
            }
            (Some(_), None) => Err(StorageError::InvalidArgument(format!(
                "record {rid} already exists"
            ))),
            (None, Some(expected)) => Err(StorageError::VersionConflict {
                rid,
                expected,
                actual: 0,
            }),
        }
    }

    fn delete_committed(&self, rid: RecordId, expected: Version) -> Result<()> {
        let mut clusters = self.clusters.write();
        let cluster = clusters
            .get_mut(&rid.cluster)
            .ok_or(StorageError::NotFound("record"))?;
        let record = cluster
            .records
            .get(&rid.position)
            .ok_or(StorageError::NotFound("record"))?;
        if record.version != expected {
            return Err(StorageError::VersionConflict {
                rid,
                expected,
                actual: record.version,
            });
        }
        cluster.records.remove(&rid.position);
        Ok(())
    }
}

/// Shared handle to one open store.
#[derive(Clone)]
pub struct RecordStore {
    inner: Arc<StoreInner>,
}

impl RecordStore {
    /// Opens a store rooted at `path`; collection files live underneath it.
    pub fn open(path: impl AsRef<Path>, config: StorageConfig) -> Result<Self> {
        config.validate()?;
        let path = path.as_ref();
        std::fs::create_dir_all(path)?;
        info!(path = %path.display(), "opened record store");
        Ok(Self {
            inner: Arc::new(StoreInner {
                collections: Arc::new(CollectionManager::new(path, config.clone())),
                config,
                clusters: RwLock::new(FxHashMap::default()),
                indexes: IndexStore::new(),
                commit_lock: Mutex::new(()),
                next_tx_id: AtomicU64::new(1),
            }),
        })
    }

    /// Opens a per-thread session.
    pub fn session(&self) -> Session {
        Session {
            store: Arc::clone(&self.inner),
            shared: Arc::new(SessionShared::default()),
            tx: None,
            last_tx_state: TxState::None,
        }
    }

    /// Length of a cluster's collection file in pages, for diagnostics.
    pub fn collection_file_pages(&self, cluster: ClusterId) -> Result<u64> {
        self.inner.collections.cluster_file_pages(cluster)
    }
}

/// Per-thread handle carrying at most one open transaction.
pub struct Session {
    store: Arc<StoreInner>,
    shared: Arc<SessionShared>,
    tx: Option<TxContext>,
    last_tx_state: TxState,
}

impl Session {
    fn bag_ctx(&self) -> BagContext {
        BagContext {
            shared: Arc::clone(&self.shared),
            collections: Arc::clone(&self.store.collections),
        }
    }

    /// Current transaction state of this session.
    pub fn tx_state(&self) -> TxState {
        match &self.tx {
            Some(tx) => tx.state,
            None => self.last_tx_state,
        }
    }

    /// Opens a transaction, or deepens the nesting of the open one.
    pub fn begin(&mut self) {
        if let Some(tx) = &mut self.tx {
            tx.nesting += 1;
            debug!(tx_id = tx.id, nesting = tx.nesting, "transaction nested");
            return;
        }
        let id = self.store.next_tx_id.fetch_add(1, Ordering::Relaxed);
        let tx = TxContext::new(id);
        self.shared.set_current(Some(Arc::clone(&tx.outcome)));
        self.tx = Some(tx);
        debug!(tx_id = id, "transaction started");
    }

    /// Commits the transaction. Nested commits only unwind the counter; the
    /// outermost commit checks every base version and applies everything
    /// atomically, or rolls the whole transaction back.
    pub fn commit(&mut self) -> Result<()> {
        let Some(tx) = &mut self.tx else {
            return Err(StorageError::InvalidArgument(
                "commit without an active transaction".into(),
            ));
        };
        if tx.nesting > 1 {
            tx.nesting -= 1;
            debug!(tx_id = tx.id, nesting = tx.nesting, "nested commit unwound");
            return Ok(());
        }
        let mut tx = self.tx.take().expect("checked above");
        tx.state = TxState::Committing;
        match self.apply_commit(&mut tx) {
            Ok(()) => {
                tx.outcome.resolve(TxStatus::Committed);
                self.shared.set_current(None);
                self.last_tx_state = TxState::Committed;
                info!(
                    tx_id = tx.id,
                    records = tx.record_order.len(),
                    indexes = tx.overlays.len(),
                    "transaction committed"
                );
                Ok(())
            }
            Err(err) => {
                self.discard_tx(tx);
                Err(err)
            }
        }
    }

    /// Rolls the whole transaction back, at any nesting depth, discarding
    /// overlays and pending writes with zero persisted effect.
    pub fn rollback(&mut self) -> Result<()> {
        let Some(tx) = self.tx.take() else {
            return Err(StorageError::InvalidArgument(
                "rollback without an active transaction".into(),
            ));
        };
        self.discard_tx(tx);
        Ok(())
    }

    fn discard_tx(&mut self, tx: TxContext) {
        for pointer in &tx.created_trees {
            // Trees created inside the window were never published; their
            // pages go straight back to the free list.
            if let Err(err) = self.store.collections.delete_tree(*pointer) {
                warn!(?pointer, %err, "failed to reclaim transaction-created tree");
            }
        }
        tx.outcome.resolve(TxStatus::RolledBack);
        self.shared.set_current(None);
        self.last_tx_state = TxState::RolledBack;
        warn!(tx_id = tx.id, "transaction rolled back");
    }

    fn apply_commit(&mut self, tx: &mut TxContext) -> Result<()> {
        let store = &self.store;
        let _choke = store.commit_lock.lock();

        // Base-version checks for every touched record; any mismatch aborts
        // the whole transaction before anything is applied.
        for rid in &tx.record_order {
            let Some(op) = tx.record_ops.get(rid) else {
                continue;
            };
            let base = match op {
                RecordOp::Create { .. } => continue,
                RecordOp::Update { base, .. } | RecordOp::Delete { base } => *base,
            };
            let actual = store.committed_version(*rid).unwrap_or(0);
            if actual != base {
                return Err(StorageError::VersionConflict {
                    rid: *rid,
                    expected: base,
                    actual,
                });
            }
        }

        // Unique constraints across every touched index.
        for (name, overlay) in &tx.overlays {
            if !overlay.is_empty() {
                store.indexes.check_unique(name, overlay)?;
            }
        }

        // Fallible page I/O first: collection flushes and deferred deletes.
        for flush in &tx.bag_flushes {
            let ops = flush.ops.lock().clone();
            for op in ops {
                match op {
                    BagOp::Add(rid) => store.collections.add(flush.pointer, rid)?,
                    BagOp::Remove(rid) => {
                        store.collections.remove_first(flush.pointer, rid)?;
                    }
                }
            }
            if let Ok(cluster) = ClusterId::try_from(flush.pointer.file_id) {
                tx.touched_clusters.insert(cluster);
            }
        }
        for pointer in &tx.deleted_trees {
            store.collections.delete_tree(*pointer)?;
            if let Ok(cluster) = ClusterId::try_from(pointer.file_id) {
                tx.touched_clusters.insert(cluster);
            }
        }

        // Record writes; version checks above make these infallible.
        for rid in &tx.record_order {
            match tx.record_ops.get(rid) {
                Some(RecordOp::Create { bytes }) => {
                    store.save_committed(*rid, bytes, None)?;
                }
                Some(RecordOp::Update { bytes, base }) => {
                    store.save_committed(*rid, bytes, Some(*base))?;
                }
                Some(RecordOp::Delete { base }) => {
                    store.delete_committed(*rid, *base)?;
                }
                None => {}
            }
        }

        // Overlay replay into the persisted indexes.
        for (name, overlay) in &tx.overlays {
            if !overlay.is_empty() {
                store.indexes.apply_overlay(name, overlay)?;
            }
        }

        // The fsync boundary: every touched collection file.
        for cluster in &tx.touched_clusters {
            store.collections.flush_cluster(*cluster)?;
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Records
    // ------------------------------------------------------------------

    /// Creates a record and returns its id. The position is reserved
    /// immediately; inside a transaction the record stays invisible to
    /// other sessions until commit.
    pub fn create_record(&mut self, cluster: ClusterId, bytes: &[u8]) -> Result<RecordId> {
        let position = self.store.reserve_position(cluster);
        let rid = RecordId::new(cluster, position);
        if let Some(tx) = &mut self.tx {
            tx.push_record_op(
                rid,
                RecordOp::Create {
                    bytes: bytes.to_vec(),
                },
            );
        } else {
            let _choke = self.store.commit_lock.lock();
            self.store.save_committed(rid, bytes, None)?;
        }
        Ok(rid)
    }

    /// Loads a record. Inside a transaction, pending writes win
    /// (read-your-writes); otherwise this is the last-committed state. The
    /// version observed on the first committed load becomes the record's
    /// base version for this transaction.
    pub fn load_record(&mut self, rid: RecordId) -> Result<(Vec<u8>, Version)> {
        if let Some(tx) = &mut self.tx {
            match tx.record_ops.get(&rid) {
                Some(RecordOp::Create { bytes }) => return Ok((bytes.clone(), 0)),
                Some(RecordOp::Update { bytes, base }) => return Ok((bytes.clone(), *base)),
                Some(RecordOp::Delete { .. }) => return Err(StorageError::NotFound("record")),
                None => {}
            }
            let (bytes, version) = self.store.load_committed(rid)?;
            tx.read_versions.entry(rid).or_insert(version);
            return Ok((bytes, version));
        }
        self.store.load_committed(rid)
    }

    /// Updates a record against the version this session first observed.
    pub fn update_record(&mut self, rid: RecordId, bytes: &[u8]) -> Result<()> {
        if self.tx.is_some() {
            let new_op = match self.pending_op_kind(rid) {
                Some(PendingKind::Create) => RecordOp::Create {
                    bytes: bytes.to_vec(),
                },
                Some(PendingKind::Update(base)) => RecordOp::Update {
                    bytes: bytes.to_vec(),
                    base,
                },
                Some(PendingKind::Delete) => return Err(StorageError::NotFound("record")),
                None => RecordOp::Update {
                    bytes: bytes.to_vec(),
                    base: self.base_version_for(rid)?,
                },
            };
            let tx = self.tx.as_mut().expect("checked");
            tx.push_record_op(rid, new_op);
            return Ok(());
        }
        let _choke = self.store.commit_lock.lock();
        let (_, version) = self.store.load_committed(rid)?;
        self.store.save_committed(rid, bytes, Some(version))?;
        Ok(())
    }

    /// Deletes a record against the version this session first observed.
    pub fn delete_record(&mut self, rid: RecordId) -> Result<()> {
        if self.tx.is_some() {
            let base = match self.pending_op_kind(rid) {
                Some(PendingKind::Create) => {
                    // Created and deleted inside the same window: vanish.
                    let tx = self.tx.as_mut().expect("checked");
                    tx.record_ops.remove(&rid);
                    return Ok(());
                }
                Some(PendingKind::Delete) => return Err(StorageError::NotFound("record")),
                Some(PendingKind::Update(base)) => base,
                None => self.base_version_for(rid)?,
            };
            let tx = self.tx.as_mut().expect("checked");
            tx.push_record_op(rid, RecordOp::Delete { base });
            return Ok(());
        }
        let _choke = self.store.commit_lock.lock();
        let (_, version) = self.store.load_committed(rid)?;
        self.store.delete_committed(rid, version)
    }

    fn pending_op_kind(&self, rid: RecordId) -> Option<PendingKind> {
        match self.tx.as_ref()?.record_ops.get(&rid)? {
            RecordOp::Create { .. } => Some(PendingKind::Create),
            RecordOp::Update { base, .. } => Some(PendingKind::Update(*base)),
            RecordOp::Delete { .. } => Some(PendingKind::Delete),
        }
    }

    fn base_version_for(&mut self, rid: RecordId) -> Result<Version> {
        let tx = self.tx.as_mut().expect("transaction required");
        if let Some(version) = tx.read_versions.get(&rid) {
            return Ok(*version);
        }
        let (_, version) = self.store.load_committed(rid)?;
        tx.read_versions.insert(rid, version);
        Ok(version)
    }

    // ------------------------------------------------------------------
    // Indexes
    // ------------------------------------------------------------------

    /// Registers an index. Not valid inside a transaction: definitions are
    /// global state, not transactional.
    pub fn create_index(&mut self, definition: IndexDefinition) -> Result<()> {
        if self.tx.is_some() {
            return Err(StorageError::InvalidArgument(
                "create_index cannot be called within a transaction".into(),
            ));
        }
        self.store.indexes.create(definition)
    }

    /// Associates `rid` with `key`. Inside a transaction this only appends
    /// to the session's overlay; nothing persisted changes until commit.
    pub fn index_put(&mut self, name: &str, key: IndexKey, rid: RecordId) -> Result<()> {
        let definition = self.store.indexes.definition(name)?;
        definition.validate_key(&key)?;
        if let Some(tx) = &mut self.tx {
            tx.overlays.entry(name.to_string()).or_default().put(key, rid);
            return Ok(());
        }
        let mut overlay = IndexOverlay::new();
        overlay.put(key, rid);
        let _choke = self.store.commit_lock.lock();
        self.store.indexes.check_unique(name, &overlay)?;
        self.store.indexes.apply_overlay(name, &overlay)
    }

    /// Removes `rid` from `key` (every record of the key when `None`).
    pub fn index_remove(
        &mut self,
        name: &str,
        key: IndexKey,
        rid: Option<RecordId>,
    ) -> Result<()> {
        let definition = self.store.indexes.definition(name)?;
        definition.validate_key(&key)?;
        if let Some(tx) = &mut self.tx {
            tx.overlays
                .entry(name.to_string())
                .or_default()
                .remove(key, rid);
            return Ok(());
        }
        let mut overlay = IndexOverlay::new();
        overlay.remove(key, rid);
        let _choke = self.store.commit_lock.lock();
        self.store.indexes.apply_overlay(name, &overlay)
    }

    /// Records under `key`. With no overlay for the index in this
    /// transaction, the persisted lookup is returned directly; otherwise the
    /// key's overlay entries replay over it in issue order.
    pub fn index_get(&mut self, name: &str, key: &IndexKey) -> Result<Vec<RecordId>> {
        let definition = self.store.indexes.definition(name)?;
        definition.validate_key(key)?;
        let persisted = self.store.indexes.lookup(name, key)?;
        match self.get_index_changes(name) {
            Some(overlay) => Ok(overlay.apply_to_key(key, persisted)),
            None => Ok(persisted),
        }
    }

    /// The overlay this transaction holds for `name`, or `None` when the
    /// transaction never touched the index (callers use this as the
    /// fast-path signal).
    pub fn get_index_changes(&self, name: &str) -> Option<&IndexOverlay> {
        self.tx.as_ref()?.overlays.get(name)
    }

    /// Streams `(key, rid)` pairs for the requested keys, each key merged
    /// under the same overlay-replay rule, in ascending or descending key
    /// order.
    pub fn index_stream(
        &mut self,
        name: &str,
        keys: Vec<IndexKey>,
        ascending: bool,
    ) -> Result<EntryStream> {
        let definition = self.store.indexes.definition(name)?;
        for key in &keys {
            definition.validate_key(key)?;
        }
        let mut keys = keys;
        keys.sort();
        keys.dedup();
        if !ascending {
            keys.reverse();
        }
        Ok(EntryStream {
            store: Arc::clone(&self.store),
            index: name.to_string(),
            overlay: self.get_index_changes(name).cloned(),
            keys: keys.into(),
            buffer: std::collections::VecDeque::new(),
        })
    }

    /// Every key visible to this session, ascending: persisted keys plus
    /// overlay-introduced ones, minus keys the merge empties.
    pub fn index_keys(&mut self, name: &str) -> Result<Vec<IndexKey>> {
        let mut keys = self.store.indexes.keys(name)?;
        if let Some(overlay) = self.get_index_changes(name) {
            for key in overlay.touched_keys() {
                let persisted = self.store.indexes.lookup(name, &key)?;
                let merged = overlay.apply_to_key(&key, persisted);
                let present = keys.contains(&key);
                if merged.is_empty() {
                    if present {
                        keys.retain(|existing| *existing != key);
                    }
                } else if !present {
                    keys.push(key);
                }
            }
            keys.sort();
        }
        Ok(keys)
    }

    // ------------------------------------------------------------------
    // RidBags
    // ------------------------------------------------------------------

    /// Fresh embedded bag bound to this session.
    pub fn new_bag(&self) -> RidBag {
        RidBag::new_embedded(self.bag_ctx())
    }

    /// Rebuilds a bag from its persisted form.
    pub fn load_bag(&mut self, bytes: &[u8]) -> Result<RidBag> {
        match decode_bag(bytes)? {
            DecodedBag::Embedded(entries) => Ok(RidBag::from_state(
                self.bag_ctx(),
                RidBagState::Embedded {
                    entries: SmallVec::from_vec(entries),
                },
            )),
            DecodedBag::Tree(pointer) => {
                let tree_size = self.store.collections.tree_size(pointer)? as i64;
                Ok(RidBag::from_state(
                    self.bag_ctx(),
                    RidBagState::Tree { pointer, tree_size },
                ))
            }
        }
    }

    /// Decides the bag's representation and returns its persisted form.
    ///
    /// Outside a transaction every effect — changelog flush, promotion,
    /// demotion, tree create/delete — applies immediately and durably.
    /// Inside one, tree mutations are deferred onto the transaction and the
    /// returned bytes are final either way, so the caller can embed them in
    /// the owning record's payload.
    pub fn save_bag(&mut self, bag: &mut RidBag, cluster: ClusterId) -> Result<Vec<u8>> {
        bag.observe_mutation();
        let size = bag.size();
        let decision = decide_transition(bag.repr(), size, &self.store.config);
        if self.tx.is_some() {
            self.save_bag_in_tx(bag, cluster, decision)
        } else {
            self.save_bag_autocommit(bag, cluster, decision)
        }
    }

    fn save_bag_autocommit(
        &mut self,
        bag: &mut RidBag,
        cluster: ClusterId,
        decision: Option<BagRepr>,
    ) -> Result<Vec<u8>> {
        let collections = Arc::clone(&self.store.collections);
        match (bag.repr(), decision) {
            (BagRepr::Embedded, None) => {
                let merged = bag.to_vec()?;
                bag.state = RidBagState::Embedded {
                    entries: SmallVec::from_vec(merged),
                };
                bag.changes.clear();
                let RidBagState::Embedded { entries } = &bag.state else {
                    unreachable!();
                };
                Ok(encode_embedded(entries))
            }
            (BagRepr::Embedded, Some(BagRepr::Tree)) => {
                let merged = bag.to_vec()?;
                let pointer = collections.create_tree(cluster)?;
                for rid in &merged {
                    collections.add(pointer, *rid)?;
                }
                collections.flush_cluster(cluster)?;
                info!(?pointer, entries = merged.len(), "rid bag promoted to tree");
                bag.state = RidBagState::Tree {
                    pointer,
                    tree_size: merged.len() as i64,
                };
                bag.changes.clear();
                Ok(encode_tree(pointer))
            }
            (BagRepr::Tree, None) => {
                let pointer = bag.tree_pointer().expect("tree state");
                let ops = bag.changes.take_ops();
                for op in ops {
                    match op {
                        BagOp::Add(rid) => collections.add(pointer, rid)?,
                        BagOp::Remove(rid) => {
                            // Removals of rids the tree never held reconcile
                            // to no-ops here.
                            collections.remove_first(pointer, rid)?;
                        }
                    }
                }
                let tree_size = collections.tree_size(pointer)? as i64;
                bag.state = RidBagState::Tree { pointer, tree_size };
                collections.flush_cluster(cluster)?;
                Ok(encode_tree(pointer))
            }
            (BagRepr::Tree, Some(BagRepr::Embedded)) => {
                let pointer = bag.tree_pointer().expect("tree state");
                let merged = bag.to_vec()?;
                collections.delete_tree(pointer)?;
                collections.flush_cluster(cluster)?;
                info!(?pointer, entries = merged.len(), "rid bag demoted to embedded");
                bag.state = RidBagState::Embedded {
                    entries: SmallVec::from_vec(merged),
                };
                bag.changes.clear();
                let RidBagState::Embedded { entries } = &bag.state else {
                    unreachable!();
                };
                Ok(encode_embedded(entries))
            }
            (BagRepr::Embedded, Some(BagRepr::Embedded))
            | (BagRepr::Tree, Some(BagRepr::Tree)) => unreachable!("transition to same state"),
        }
    }

    fn save_bag_in_tx(
        &mut self,
        bag: &mut RidBag,
        cluster: ClusterId,
        decision: Option<BagRepr>,
    ) -> Result<Vec<u8>> {
        match (bag.repr(), decision) {
            (BagRepr::Embedded, None) => {
                let merged = bag.to_vec()?;
                bag.state = RidBagState::Embedded {
                    entries: SmallVec::from_vec(merged),
                };
                bag.changes.clear();
                let RidBagState::Embedded { entries } = &bag.state else {
                    unreachable!();
                };
                Ok(encode_embedded(entries))
            }
            (BagRepr::Embedded, Some(BagRepr::Tree)) => {
                // The tree is allocated eagerly so the pointer can be
                // serialized now; its contents arrive at commit. Rollback
                // deletes the (unpublished) tree again.
                let pointer = self.store.collections.create_tree(cluster)?;
                let RidBagState::Embedded { entries } = &bag.state else {
                    unreachable!();
                };
                let base_adds: Vec<BagOp> =
                    entries.iter().map(|rid| BagOp::Add(*rid)).collect();
                let ops = replay_with_cancellation(base_adds, bag.changes.ops());
                let tx = self.tx.as_mut().expect("transaction required");
                tx.created_trees.push(pointer);
                tx.touched_clusters.insert(cluster);
                let handle = tx.queue_bag_flush(pointer, ops);
                bag.pending_flush = Some(handle);
                bag.state = RidBagState::Tree {
                    pointer,
                    tree_size: 0,
                };
                bag.changes.clear();
                info!(tx_id = tx.id, ?pointer, "rid bag promotion deferred to commit");
                Ok(encode_tree(pointer))
            }
            (BagRepr::Tree, None) => {
                let pointer = bag.tree_pointer().expect("tree state");
                let ops = bag.combined_ops();
                bag.changes.clear();
                let tx = self.tx.as_mut().expect("transaction required");
                tx.touched_clusters.insert(cluster);
                let handle = tx.queue_bag_flush(pointer, ops);
                bag.pending_flush = Some(handle);
                Ok(encode_tree(pointer))
            }
            (BagRepr::Tree, Some(BagRepr::Embedded)) => {
                let pointer = bag.tree_pointer().expect("tree state");
                let merged = bag.to_vec()?;
                let tx = self.tx.as_mut().expect("transaction required");
                tx.cancel_bag_flush(pointer);
                tx.deleted_trees.push(pointer);
                tx.touched_clusters.insert(cluster);
                bag.pending_flush = None;
                bag.state = RidBagState::Embedded {
                    entries: SmallVec::from_vec(merged),
                };
                bag.changes.clear();
                let RidBagState::Embedded { entries } = &bag.state else {
                    unreachable!();
                };
                Ok(encode_embedded(entries))
            }
            (BagRepr::Embedded, Some(BagRepr::Embedded))
            | (BagRepr::Tree, Some(BagRepr::Tree)) => unreachable!("transition to same state"),
        }
    }

    /// Tears a bag down alongside its owning record: a tree-backed bag's
    /// pages are marked for reuse (at commit when inside a transaction).
    pub fn delete_bag(&mut self, bag: &mut RidBag) -> Result<()> {
        bag.observe_mutation();
        if let Some(pointer) = bag.tree_pointer() {
            if let Some(tx) = &mut self.tx {
                tx.cancel_bag_flush(pointer);
                tx.deleted_trees.push(pointer);
                if let Ok(cluster) = ClusterId::try_from(pointer.file_id) {
                    tx.touched_clusters.insert(cluster);
                }
            } else {
                self.store.collections.delete_tree(pointer)?;
                if let Ok(cluster) = ClusterId::try_from(pointer.file_id) {
                    self.store.collections.flush_cluster(cluster)?;
                }
            }
            bag.pending_flush = None;
        }
        bag.state = RidBagState::Embedded {
            entries: SmallVec::new(),
        };
        bag.changes.clear();
        Ok(())
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if let Some(tx) = self.tx.take() {
            warn!(tx_id = tx.id, "session dropped with an open transaction");
            self.discard_tx(tx);
        }
    }
}

/// Lazy `(key, rid)` stream: one key is merged per refill.
pub struct EntryStream {
    store: Arc<StoreInner>,
    index: String,
    overlay: Option<IndexOverlay>,
    keys: std::collections::VecDeque<IndexKey>,
    buffer: std::collections::VecDeque<(IndexKey, RecordId)>,
}

impl Iterator for EntryStream {
    type Item = Result<(IndexKey, RecordId)>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(pair) = self.buffer.pop_front() {
                return Some(Ok(pair));
            }
            let key = self.keys.pop_front()?;
            let persisted = match self.store.indexes.lookup(&self.index, &key) {
                Ok(persisted) => persisted,
                Err(err) => return Some(Err(err)),
            };
            let merged = match &self.overlay {
                Some(overlay) => overlay.apply_to_key(&key, persisted),
                None => persisted,
            };
            self.buffer
                .extend(merged.into_iter().map(|rid| (key.clone(), rid)));
        }
    }
}
