//! Page-based persistent tree for large record-id collections.
//!
//! The tree is an allocation-ordered multiset: every inserted record id is
//! keyed by a monotonically issued `u64` sequence, so inserts always land on
//! the rightmost path and duplicates of the same rid are distinct entries.
//! The root page never moves — splitting the root rebuilds it in place —
//! which keeps persisted collection pointers stable for the life of the
//! tree.
//!
//! Removal unlinks a single entry (first occurrence in sequence order) and
//! never rebalances; leaves emptied by removals stay chained until the whole
//! tree is deleted, at which point every page of the tree joins the file's
//! free list.

use tracing::debug;

use super::bucket::{self, BucketHeader, FileHeader, PageKind};
use crate::error::{Result, StorageError};
use crate::pager::{PageId, Pager};
use crate::types::RecordId;

/// Tree operations over one open collection file.
pub struct TreeOps<'a> {
    pager: &'a mut Pager,
    file_id: i64,
    reuse_trigger: f64,
}

impl<'a> TreeOps<'a> {
    /// Wraps a pager for tree work.
    pub fn new(pager: &'a mut Pager, file_id: i64, reuse_trigger: f64) -> Self {
        Self {
            pager,
            file_id,
            reuse_trigger,
        }
    }

    /// Formats page 0 of a fresh file; no-op for already formatted files.
    pub fn format_file_if_empty(&mut self) -> Result<()> {
        if self.pager.page_count() > 0 {
            return Ok(());
        }
        let page_size = self.pager.page_size();
        let header_page = self.pager.allocate_page()?;
        self.pager
            .with_page_mut(header_page, |page| FileHeader::format(page, page_size))
    }

    fn file_header(&mut self) -> Result<FileHeader> {
        let page_size = self.pager.page_size();
        self.pager
            .with_page(0, |page| FileHeader::parse(page, page_size))
    }

    fn store_file_header(&mut self, header: FileHeader) -> Result<()> {
        self.pager.with_page_mut(0, |page| header.store(page))
    }

    /// Allocates a page for a bucket, preferring the free list once the
    /// free-to-total ratio reaches the configured trigger.
    pub fn allocate_bucket_page(&mut self) -> Result<PageId> {
        let mut header = self.file_header()?;
        let total_pages = self.pager.page_count().saturating_sub(1);
        if header.free_head != 0 && total_pages > 0 {
            let ratio = header.free_count as f64 / total_pages as f64;
            if ratio >= self.reuse_trigger {
                let reused = page_id_from_disk(header.free_head)?;
                let next = self.pager.with_page(reused, bucket::free_page_next)?;
                header.free_head = next;
                header.free_count = header.free_count.saturating_sub(1);
                self.store_file_header(header)?;
                debug!(
                    file_id = self.file_id,
                    page = reused,
                    free_remaining = header.free_count,
                    "reused free page"
                );
                return Ok(reused);
            }
        }
        self.pager.allocate_page()
    }

    /// Chains the given pages onto the file's free list.
    pub fn release_pages(&mut self, pages: &[PageId]) -> Result<()> {
        if pages.is_empty() {
            return Ok(());
        }
        let mut header = self.file_header()?;
        for &page_id in pages {
            let next = header.free_head;
            self.pager
                .with_page_mut(page_id, |page| bucket::format_free_page(page, next))?;
            header.free_head = u64::from(page_id);
            header.free_count += 1;
        }
        self.store_file_header(header)?;
        debug!(
            file_id = self.file_id,
            released = pages.len(),
            free_total = header.free_count,
            "released tree pages"
        );
        Ok(())
    }

    /// Creates an empty tree and returns its root page.
    pub fn create_tree(&mut self) -> Result<PageId> {
        let root = self.allocate_bucket_page()?;
        self.pager.with_page_mut(root, |page| {
            bucket::init_bucket(page, PageKind::Leaf, true)?;
            bucket::set_next_seq(page, 1)
        })?;
        debug!(file_id = self.file_id, root, "created collection tree");
        Ok(root)
    }

    fn root_header(&mut self, root: PageId) -> Result<BucketHeader> {
        let header = self.pager.with_page(root, |page| BucketHeader::parse(page));
        match header {
            Ok(header) if header.is_root => Ok(header),
            Ok(_) => Err(StorageError::CorruptPointer {
                file_id: self.file_id,
                root_index: i64::from(root),
            }),
            Err(StorageError::Io(err)) => Err(StorageError::Io(err)),
            Err(_) => Err(StorageError::CorruptPointer {
                file_id: self.file_id,
                root_index: i64::from(root),
            }),
        }
    }

    /// Entry count recorded in the root.
    pub fn tree_size(&mut self, root: PageId) -> Result<u64> {
        Ok(self.root_header(root)?.tree_size)
    }

    /// Inserts `rid` under a freshly issued sequence key.
    pub fn insert(&mut self, root: PageId, rid: RecordId) -> Result<()> {
        let root_header = self.root_header(root)?;
        let seq = root_header.next_seq;

        // Descend the rightmost path, remembering parents for splits.
        let mut path: Vec<PageId> = Vec::new();
        let mut current = root;
        let mut header = root_header;
        while header.kind == PageKind::Internal {
            if header.count == 0 {
                return Err(StorageError::Corruption(
                    "internal bucket without children".into(),
                ));
            }
            path.push(current);
            let last = header.count as usize - 1;
            let (_, child) = self
                .pager
                .with_page(current, |page| bucket::internal_entry(page, last))?;
            current = page_id_from_disk(child)?;
            header = self.pager.with_page(current, |page| BucketHeader::parse(page))?;
        }

        let capacity = bucket::leaf_capacity(self.pager.page_size());
        if (header.count as usize) < capacity {
            let index = header.count as usize;
            let new_count = header.count + 1;
            self.pager.with_page_mut(current, |page| {
                bucket::write_leaf_entry(page, index, seq, rid)?;
                bucket::set_count(page, new_count)
            })?;
        } else if current == root {
            self.split_leaf_root(root, seq, rid)?;
        } else {
            let new_leaf = self.allocate_bucket_page()?;
            self.pager.with_page_mut(new_leaf, |page| {
                bucket::init_bucket(page, PageKind::Leaf, false)?;
                bucket::write_leaf_entry(page, 0, seq, rid)?;
                bucket::set_count(page, 1)?;
                bucket::set_left_sibling(page, u64::from(current))
            })?;
            self.pager
                .with_page_mut(current, |page| bucket::set_right_sibling(page, u64::from(new_leaf)))?;
            self.insert_into_parent(&mut path, root, seq, new_leaf)?;
        }

        // The root page may have been rebuilt; refresh and bump metadata.
        let updated = self.pager.with_page(root, |page| BucketHeader::parse(page))?;
        let size = updated.tree_size + 1;
        self.pager.with_page_mut(root, |page| {
            bucket::set_tree_size(page, size)?;
            bucket::set_next_seq(page, seq + 1)
        })?;
        Ok(())
    }

    fn split_leaf_root(&mut self, root: PageId, seq: u64, rid: RecordId) -> Result<()> {
        let count = self
            .pager
            .with_page(root, |page| Ok(BucketHeader::parse(page)?.count as usize))?;
        let mut moved = Vec::with_capacity(count);
        self.pager.with_page(root, |page| {
            moved.clear();
            for index in 0..count {
                moved.push(bucket::leaf_entry(page, index)?);
            }
            Ok(())
        })?;

        let left = self.allocate_bucket_page()?;
        let right = self.allocate_bucket_page()?;
        self.pager.with_page_mut(left, |page| {
            bucket::init_bucket(page, PageKind::Leaf, false)?;
            for (index, &(entry_seq, entry_rid)) in moved.iter().enumerate() {
                bucket::write_leaf_entry(page, index, entry_seq, entry_rid)?;
            }
            bucket::set_count(page, count as u16)?;
            bucket::set_right_sibling(page, u64::from(right))
        })?;
        self.pager.with_page_mut(right, |page| {
            bucket::init_bucket(page, PageKind::Leaf, false)?;
            bucket::write_leaf_entry(page, 0, seq, rid)?;
            bucket::set_count(page, 1)?;
            bucket::set_left_sibling(page, u64::from(left))
        })?;

        let low_seq = moved.first().map(|&(entry_seq, _)| entry_seq).unwrap_or(seq);
        self.rebuild_root_as_internal(root, &[(low_seq, left), (seq, right)])
    }

    fn insert_into_parent(
        &mut self,
        path: &mut Vec<PageId>,
        root: PageId,
        min_seq: u64,
        child: PageId,
    ) -> Result<()> {
        let mut min_seq = min_seq;
        let mut child = child;
        loop {
            let Some(parent) = path.pop() else {
                // A full leaf root is split before reaching here, so an empty
                // path means the tree grew a level without touching the root.
                return Err(StorageError::Corruption(
                    "split propagation lost the tree root".into(),
                ));
            };
            let header = self.pager.with_page(parent, |page| BucketHeader::parse(page))?;
            let capacity = bucket::internal_capacity(self.pager.page_size());
            if (header.count as usize) < capacity {
                let index = header.count as usize;
                let new_count = header.count + 1;
                self.pager.with_page_mut(parent, |page| {
                    bucket::write_internal_entry(page, index, min_seq, u64::from(child))?;
                    bucket::set_count(page, new_count)
                })?;
                return Ok(());
            }
            if parent == root {
                let count = header.count as usize;
                let mut moved = Vec::with_capacity(count);
                self.pager.with_page(parent, |page| {
                    moved.clear();
                    for index in 0..count {
                        moved.push(bucket::internal_entry(page, index)?);
                    }
                    Ok(())
                })?;
                let shifted = self.allocate_bucket_page()?;
                self.pager.with_page_mut(shifted, |page| {
                    bucket::init_bucket(page, PageKind::Internal, false)?;
                    for (index, &(entry_seq, entry_child)) in moved.iter().enumerate() {
                        bucket::write_internal_entry(page, index, entry_seq, entry_child)?;
                    }
                    bucket::set_count(page, count as u16)
                })?;
                let low_seq = moved.first().map(|&(entry_seq, _)| entry_seq).unwrap_or(min_seq);
                return self.rebuild_root_as_internal(
                    root,
                    &[(low_seq, shifted), (min_seq, child)],
                );
            }
            // Full non-root internal bucket: push the entry into a fresh
            // sibling and propagate its separator upward.
            let sibling = self.allocate_bucket_page()?;
            self.pager.with_page_mut(sibling, |page| {
                bucket::init_bucket(page, PageKind::Internal, false)?;
                bucket::write_internal_entry(page, 0, min_seq, u64::from(child))?;
                bucket::set_count(page, 1)
            })?;
            child = sibling;
            // min_seq carries through: the sibling covers the same low bound.
        }
    }

    fn rebuild_root_as_internal(
        &mut self,
        root: PageId,
        entries: &[(u64, PageId)],
    ) -> Result<()> {
        let header = self.root_header(root)?;
        let (tree_size, next_seq) = (header.tree_size, header.next_seq);
        self.pager.with_page_mut(root, |page| {
            bucket::init_bucket(page, PageKind::Internal, true)?;
            for (index, &(entry_seq, entry_child)) in entries.iter().enumerate() {
                bucket::write_internal_entry(page, index, entry_seq, u64::from(entry_child))?;
            }
            bucket::set_count(page, entries.len() as u16)?;
            bucket::set_tree_size(page, tree_size)?;
            bucket::set_next_seq(page, next_seq)
        })
    }

    /// Removes the first entry holding `rid`, in sequence order. Returns
    /// `false` when the tree holds no such entry.
    pub fn remove_first(&mut self, root: PageId, rid: RecordId) -> Result<bool> {
        let size = self.root_header(root)?.tree_size;
        let mut leaf = self.leftmost_leaf(root)?;
        loop {
            let header = self.pager.with_page(leaf, |page| BucketHeader::parse(page))?;
            let mut found = None;
            self.pager.with_page(leaf, |page| {
                for index in 0..header.count as usize {
                    let (_, entry_rid) = bucket::leaf_entry(page, index)?;
                    if entry_rid == rid {
                        found = Some(index);
                        break;
                    }
                }
                Ok(())
            })?;
            if let Some(index) = found {
                self.pager.with_page_mut(leaf, |page| {
                    bucket::remove_leaf_entry(page, index)?;
                    Ok(())
                })?;
                self.pager
                    .with_page_mut(root, |page| bucket::set_tree_size(page, size - 1))?;
                return Ok(true);
            }
            if header.right_sibling == 0 {
                return Ok(false);
            }
            leaf = page_id_from_disk(header.right_sibling)?;
        }
    }

    /// Leftmost leaf of the tree; the root itself while it is still a leaf.
    pub fn leftmost_leaf(&mut self, root: PageId) -> Result<PageId> {
        let mut current = root;
        let mut header = self.root_header(root)?;
        while header.kind == PageKind::Internal {
            if header.count == 0 {
                return Err(StorageError::Corruption(
                    "internal bucket without children".into(),
                ));
            }
            let (_, child) = self
                .pager
                .with_page(current, |page| bucket::internal_entry(page, 0))?;
            current = page_id_from_disk(child)?;
            header = self.pager.with_page(current, |page| BucketHeader::parse(page))?;
        }
        Ok(current)
    }

    /// Reads all entries of a leaf plus its right-sibling link.
    pub fn read_leaf(&mut self, leaf: PageId) -> Result<(Vec<RecordId>, u64)> {
        let header = self.pager.with_page(leaf, |page| BucketHeader::parse(page))?;
        if header.kind != PageKind::Leaf {
            return Err(StorageError::Corruption(
                "leaf chain reached a non-leaf bucket".into(),
            ));
        }
        let mut entries = Vec::with_capacity(header.count as usize);
        self.pager.with_page(leaf, |page| {
            entries.clear();
            for index in 0..header.count as usize {
                let (_, rid) = bucket::leaf_entry(page, index)?;
                entries.push(rid);
            }
            Ok(())
        })?;
        Ok((entries, header.right_sibling))
    }

    /// Collects every page of the tree, root included.
    pub fn collect_tree_pages(&mut self, root: PageId) -> Result<Vec<PageId>> {
        self.root_header(root)?;
        let mut pages = Vec::new();
        let mut stack = vec![root];
        while let Some(page_id) = stack.pop() {
            pages.push(page_id);
            let header = self.pager.with_page(page_id, |page| BucketHeader::parse(page))?;
            if header.kind == PageKind::Internal {
                let mut children = Vec::with_capacity(header.count as usize);
                self.pager.with_page(page_id, |page| {
                    children.clear();
                    for index in 0..header.count as usize {
                        let (_, child) = bucket::internal_entry(page, index)?;
                        children.push(child);
                    }
                    Ok(())
                })?;
                for child in children {
                    stack.push(page_id_from_disk(child)?);
                }
            }
        }
        Ok(pages)
    }

    /// Validates that a persisted pointer resolves to an allocated root.
    pub fn validate_root(&mut self, root_index: i64, root_offset: i32) -> Result<PageId> {
        let corrupt = || StorageError::CorruptPointer {
            file_id: self.file_id,
            root_index,
        };
        if root_offset != 0 || root_index <= 0 {
            return Err(corrupt());
        }
        let root = PageId::try_from(root_index).map_err(|_| corrupt())?;
        if u64::from(root) >= self.pager.page_count() {
            return Err(corrupt());
        }
        self.root_header(root)?;
        Ok(root)
    }
}

/// Lazy leaf-chain cursor. Buffers one leaf at a time; the caller supplies
/// the [`TreeOps`] on every refill so no page lock is held between chunks.
#[derive(Debug)]
pub struct TreeCursor {
    buffered: Vec<RecordId>,
    position: usize,
    next_leaf: u64,
}

impl TreeCursor {
    /// Opens a cursor positioned before the first entry.
    pub fn open(ops: &mut TreeOps<'_>, root: PageId) -> Result<Self> {
        let leftmost = ops.leftmost_leaf(root)?;
        Ok(Self {
            buffered: Vec::new(),
            position: 0,
            next_leaf: u64::from(leftmost),
        })
    }

    /// Returns the next record id, refilling from the leaf chain as needed.
    pub fn next(&mut self, ops: &mut TreeOps<'_>) -> Result<Option<RecordId>> {
        loop {
            if self.position < self.buffered.len() {
                let rid = self.buffered[self.position];
                self.position += 1;
                return Ok(Some(rid));
            }
            if self.next_leaf == 0 {
                return Ok(None);
            }
            let leaf = page_id_from_disk(self.next_leaf)?;
            let (entries, right) = ops.read_leaf(leaf)?;
            self.buffered = entries;
            self.position = 0;
            self.next_leaf = right;
        }
    }
}

fn page_id_from_disk(value: u64) -> Result<PageId> {
    PageId::try_from(value)
        .map_err(|_| StorageError::Corruption("page reference exceeds file range".into()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    const PAGE_SIZE: usize = 512;

    fn open_pager(path: &std::path::Path) -> Pager {
        Pager::open(path, PAGE_SIZE, 64).expect("open pager")
    }

    fn drain(ops: &mut TreeOps<'_>, root: PageId) -> Vec<RecordId> {
        let mut cursor = TreeCursor::open(ops, root).expect("open cursor");
        let mut out = Vec::new();
        while let Some(rid) = cursor.next(ops).expect("cursor next") {
            out.push(rid);
        }
        out
    }

    #[test]
    fn insert_and_iterate_across_splits() {
        let tmp = NamedTempFile::new().expect("temp file");
        let mut pager = open_pager(tmp.path());
        let mut ops = TreeOps::new(&mut pager, 1, 0.5);
        ops.format_file_if_empty().expect("format");
        let root = ops.create_tree().expect("create");

        let total = bucket::leaf_capacity(PAGE_SIZE) * 3 + 7;
        for position in 0..total {
            ops.insert(root, RecordId::new(1, position as i64)).expect("insert");
        }
        assert_eq!(ops.tree_size(root).expect("size"), total as u64);

        let entries = drain(&mut ops, root);
        assert_eq!(entries.len(), total);
        for (position, rid) in entries.iter().enumerate() {
            assert_eq!(*rid, RecordId::new(1, position as i64));
        }
    }

    #[test]
    fn duplicates_are_distinct_entries() {
        let tmp = NamedTempFile::new().expect("temp file");
        let mut pager = open_pager(tmp.path());
        let mut ops = TreeOps::new(&mut pager, 1, 0.5);
        ops.format_file_if_empty().expect("format");
        let root = ops.create_tree().expect("create");

        let rid = RecordId::new(2, 5);
        for _ in 0..4 {
            ops.insert(root, rid).expect("insert duplicate");
        }
        assert_eq!(ops.tree_size(root).expect("size"), 4);
        assert_eq!(drain(&mut ops, root), vec![rid; 4]);
    }

    #[test]
    fn remove_first_takes_one_occurrence() {
        let tmp = NamedTempFile::new().expect("temp file");
        let mut pager = open_pager(tmp.path());
        let mut ops = TreeOps::new(&mut pager, 1, 0.5);
        ops.format_file_if_empty().expect("format");
        let root = ops.create_tree().expect("create");

        let rid = RecordId::new(3, 9);
        ops.insert(root, RecordId::new(3, 1)).expect("insert");
        ops.insert(root, rid).expect("insert");
        ops.insert(root, rid).expect("insert");

        assert!(ops.remove_first(root, rid).expect("remove"));
        assert_eq!(ops.tree_size(root).expect("size"), 2);
        assert_eq!(drain(&mut ops, root), vec![RecordId::new(3, 1), rid]);

        assert!(ops.remove_first(root, rid).expect("remove second"));
        assert!(!ops.remove_first(root, rid).expect("nothing left"));
    }

    #[test]
    fn removal_survives_splits() {
        let tmp = NamedTempFile::new().expect("temp file");
        let mut pager = open_pager(tmp.path());
        let mut ops = TreeOps::new(&mut pager, 1, 0.5);
        ops.format_file_if_empty().expect("format");
        let root = ops.create_tree().expect("create");

        let total = bucket::leaf_capacity(PAGE_SIZE) * 2 + 3;
        for position in 0..total {
            ops.insert(root, RecordId::new(1, position as i64)).expect("insert");
        }
        let victim = RecordId::new(1, 0);
        assert!(ops.remove_first(root, victim).expect("remove leftmost"));
        let entries = drain(&mut ops, root);
        assert_eq!(entries.len(), total - 1);
        assert!(!entries.contains(&victim));
    }

    #[test]
    fn deleted_tree_pages_are_reused() {
        let tmp = NamedTempFile::new().expect("temp file");
        let mut pager = open_pager(tmp.path());
        // Trigger 0: any free page is preferred over growing the file.
        let mut ops = TreeOps::new(&mut pager, 1, 0.0);
        ops.format_file_if_empty().expect("format");

        let root = ops.create_tree().expect("create");
        for position in 0..bucket::leaf_capacity(PAGE_SIZE) * 2 {
            ops.insert(root, RecordId::new(1, position as i64)).expect("insert");
        }
        let pages = ops.collect_tree_pages(root).expect("collect");
        ops.release_pages(&pages).expect("release");
        let baseline = ops.pager.page_count();

        let root = ops.create_tree().expect("recreate");
        for position in 0..bucket::leaf_capacity(PAGE_SIZE) {
            ops.insert(root, RecordId::new(1, position as i64)).expect("insert");
        }
        assert_eq!(
            ops.pager.page_count(),
            baseline,
            "allocations should come from the free list"
        );
    }

    #[test]
    fn dangling_root_is_a_corrupt_pointer() {
        let tmp = NamedTempFile::new().expect("temp file");
        let mut pager = open_pager(tmp.path());
        let mut ops = TreeOps::new(&mut pager, 7, 0.5);
        ops.format_file_if_empty().expect("format");
        let err = ops.validate_root(42, 0).expect_err("dangling pointer");
        assert!(matches!(
            err,
            StorageError::CorruptPointer { file_id: 7, root_index: 42 }
        ));
    }
}
