//! Collection files and the shared allocation choke point.
//!
//! Every cluster owns one collection file, `collections_<clusterId>.sbc`,
//! hosting all tree-backed collections of records in that cluster; the file
//! id of a pointer equals the owning cluster id. All page allocation and
//! free-list decisions for a file go through its [`CollectionFile`], so no
//! caller ever caches an allocation decision locally.
//!
//! Deleting a tree while scans are open on its file parks the tree's pages
//! on a pending list; they join the free list when the last scan closes, so
//! physical reuse never overlaps a live cursor.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use rustc_hash::FxHashMap;
use tracing::{debug, warn};

use super::tree::{TreeCursor, TreeOps};
use crate::config::StorageConfig;
use crate::error::{Result, StorageError};
use crate::pager::{PageId, Pager};
use crate::types::{BonsaiCollectionPointer, ClusterId, RecordId};

/// Prefix of every collection file name.
pub const FILE_NAME_PREFIX: &str = "collections_";
/// Extension of every collection file name.
pub const FILE_EXTENSION: &str = ".sbc";

/// Derives the file id from a collection file name, if it is one.
pub fn file_id_by_name(name: &str) -> Option<i64> {
    let stem = name
        .strip_prefix(FILE_NAME_PREFIX)?
        .strip_suffix(FILE_EXTENSION)?;
    stem.parse::<i64>().ok()
}

struct ReaderState {
    open_readers: usize,
    pending_free: Vec<PageId>,
}

/// One open collection file: pager plus reader bookkeeping.
pub struct CollectionFile {
    file_id: i64,
    pager: Mutex<Pager>,
    readers: Mutex<ReaderState>,
}

impl CollectionFile {
    fn with_ops<T>(
        &self,
        trigger: f64,
        f: impl FnOnce(&mut TreeOps<'_>) -> Result<T>,
    ) -> Result<T> {
        let mut pager = self.pager.lock();
        let mut ops = TreeOps::new(&mut pager, self.file_id, trigger);
        f(&mut ops)
    }

    fn open_reader(&self) {
        self.readers.lock().open_readers += 1;
    }

    fn close_reader(&self, trigger: f64) {
        // The readers lock is held across the reclaim so no scan can open
        // against pages that are on their way to the free list. Lock order
        // is always readers, then pager.
        let mut readers = self.readers.lock();
        readers.open_readers = readers.open_readers.saturating_sub(1);
        if readers.open_readers == 0 && !readers.pending_free.is_empty() {
            let drained = std::mem::take(&mut readers.pending_free);
            // Reclaim failures leave the pages unreferenced but unrecycled;
            // the file merely grows until the next successful release.
            if let Err(err) = self.with_ops(trigger, |ops| ops.release_pages(&drained)) {
                warn!(file_id = self.file_id, %err, "failed to drain parked tree pages");
            }
        }
    }
}

/// Owns every open collection file of a store.
pub struct CollectionManager {
    dir: PathBuf,
    config: StorageConfig,
    files: RwLock<FxHashMap<ClusterId, Arc<CollectionFile>>>,
}

impl CollectionManager {
    /// Creates a manager rooted at `dir` (created on demand).
    pub fn new(dir: &Path, config: StorageConfig) -> Self {
        Self {
            dir: dir.to_path_buf(),
            config,
            files: RwLock::new(FxHashMap::default()),
        }
    }

    fn file_path(&self, cluster: ClusterId) -> PathBuf {
        self.dir
            .join(format!("{FILE_NAME_PREFIX}{cluster}{FILE_EXTENSION}"))
    }

    /// Opens (creating and formatting if needed) the cluster's file.
    pub fn file_for_cluster(&self, cluster: ClusterId) -> Result<Arc<CollectionFile>> {
        if let Some(file) = self.files.read().get(&cluster) {
            return Ok(Arc::clone(file));
        }
        let mut files = self.files.write();
        if let Some(file) = files.get(&cluster) {
            return Ok(Arc::clone(file));
        }
        std::fs::create_dir_all(&self.dir)?;
        let path = self.file_path(cluster);
        let pager = Pager::open(&path, self.config.page_size, self.config.page_cache_size)?;
        let file = Arc::new(CollectionFile {
            file_id: i64::from(cluster),
            pager: Mutex::new(pager),
            readers: Mutex::new(ReaderState {
                open_readers: 0,
                pending_free: Vec::new(),
            }),
        });
        file.with_ops(self.config.free_space_reuse_trigger, |ops| {
            ops.format_file_if_empty()
        })?;
        files.insert(cluster, Arc::clone(&file));
        debug!(cluster, path = %path.display(), "opened collection file");
        Ok(file)
    }

    fn file_by_id(&self, file_id: i64) -> Result<Arc<CollectionFile>> {
        let cluster = ClusterId::try_from(file_id).map_err(|_| StorageError::CorruptPointer {
            file_id,
            root_index: 0,
        })?;
        if self.files.read().get(&cluster).is_none() && !self.file_path(cluster).exists() {
            return Err(StorageError::CorruptPointer {
                file_id,
                root_index: 0,
            });
        }
        self.file_for_cluster(cluster)
    }

    fn resolve(&self, pointer: BonsaiCollectionPointer) -> Result<(Arc<CollectionFile>, PageId)> {
        if !pointer.is_valid() {
            return Err(StorageError::CorruptPointer {
                file_id: pointer.file_id,
                root_index: pointer.root_index,
            });
        }
        let file = self.file_by_id(pointer.file_id)?;
        let root = file.with_ops(self.config.free_space_reuse_trigger, |ops| {
            ops.validate_root(pointer.root_index, pointer.root_offset)
        })?;
        Ok((file, root))
    }

    /// Creates an empty tree in the cluster's file.
    pub fn create_tree(&self, cluster: ClusterId) -> Result<BonsaiCollectionPointer> {
        let file = self.file_for_cluster(cluster)?;
        let root = file.with_ops(self.config.free_space_reuse_trigger, |ops| {
            ops.create_tree()
        })?;
        Ok(BonsaiCollectionPointer::new(
            i64::from(cluster),
            i64::from(root),
        ))
    }

    /// Appends `rid` to the tree.
    pub fn add(&self, pointer: BonsaiCollectionPointer, rid: RecordId) -> Result<()> {
        let (file, root) = self.resolve(pointer)?;
        file.with_ops(self.config.free_space_reuse_trigger, |ops| {
            ops.insert(root, rid)
        })
    }

    /// Removes the first occurrence of `rid`; `false` when absent.
    pub fn remove_first(&self, pointer: BonsaiCollectionPointer, rid: RecordId) -> Result<bool> {
        let (file, root) = self.resolve(pointer)?;
        file.with_ops(self.config.free_space_reuse_trigger, |ops| {
            ops.remove_first(root, rid)
        })
    }

    /// Entry count of the tree.
    pub fn tree_size(&self, pointer: BonsaiCollectionPointer) -> Result<u64> {
        let (file, root) = self.resolve(pointer)?;
        file.with_ops(self.config.free_space_reuse_trigger, |ops| {
            ops.tree_size(root)
        })
    }

    /// Deletes the tree, marking its pages for reuse. With scans open on the
    /// file, reclaim is parked until the last one closes.
    pub fn delete_tree(&self, pointer: BonsaiCollectionPointer) -> Result<()> {
        let (file, root) = self.resolve(pointer)?;
        let pages = file.with_ops(self.config.free_space_reuse_trigger, |ops| {
            ops.collect_tree_pages(root)
        })?;
        let mut readers = file.readers.lock();
        if readers.open_readers > 0 {
            readers.pending_free.extend_from_slice(&pages);
            debug!(
                file_id = pointer.file_id,
                root = pointer.root_index,
                pages = pages.len(),
                "tree delete parked behind open scans"
            );
            return Ok(());
        }
        file.with_ops(self.config.free_space_reuse_trigger, |ops| {
            ops.release_pages(&pages)
        })
    }

    /// Opens a lazy scan over the tree's entries. The scan holds a reader
    /// handle from before the first page is read.
    pub fn iterate(&self, pointer: BonsaiCollectionPointer) -> Result<TreeScan> {
        let (file, root) = self.resolve(pointer)?;
        file.open_reader();
        let cursor = match file.with_ops(self.config.free_space_reuse_trigger, |ops| {
            TreeCursor::open(ops, root)
        }) {
            Ok(cursor) => cursor,
            Err(err) => {
                file.close_reader(self.config.free_space_reuse_trigger);
                return Err(err);
            }
        };
        Ok(TreeScan {
            file,
            cursor,
            trigger: self.config.free_space_reuse_trigger,
            done: false,
        })
    }

    /// Flushes and syncs the cluster's file, if it is open.
    pub fn flush_cluster(&self, cluster: ClusterId) -> Result<()> {
        let file = {
            let files = self.files.read();
            files.get(&cluster).map(Arc::clone)
        };
        if let Some(file) = file {
            file.pager.lock().flush()?;
        }
        Ok(())
    }

    /// On-disk length of the cluster's file in pages, for diagnostics.
    pub fn cluster_file_pages(&self, cluster: ClusterId) -> Result<u64> {
        let file = self.file_for_cluster(cluster)?;
        let pages = file.pager.lock().page_count();
        Ok(pages)
    }
}

/// Lazy iterator over a tree's record ids.
///
/// Holds a reader handle on the backing file: trees deleted while the scan
/// is open keep their pages off the free list until the scan drops.
pub struct TreeScan {
    file: Arc<CollectionFile>,
    cursor: TreeCursor,
    trigger: f64,
    done: bool,
}

impl Iterator for TreeScan {
    type Item = Result<RecordId>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        let step = self
            .file
            .with_ops(self.trigger, |ops| self.cursor.next(ops));
        match step {
            Ok(Some(rid)) => Some(Ok(rid)),
            Ok(None) => {
                self.done = true;
                None
            }
            Err(err) => {
                self.done = true;
                Some(Err(err))
            }
        }
    }
}

impl Drop for TreeScan {
    fn drop(&mut self) {
        self.file.close_reader(self.trigger);
    }
}
