//! Fixed-size page storage over a single file.
//!
//! One [`Pager`] owns one collection file: an LRU cache of pages with dirty
//! tracking, sequential page allocation, and a `flush` that writes every
//! dirty page and syncs the file — the fsync boundary invoked at commit.
//!
//! Every page begins with an 8-byte header: a crc32 over the payload,
//! a kind byte owned by the layer above, and three reserved bytes. The crc
//! is stamped at flush time and verified whenever a page is read back from
//! disk.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::num::NonZeroUsize;
use std::path::Path;

use lru::LruCache;

use crate::error::{Result, StorageError};

/// Size of the per-page header maintained by the pager.
pub const PAGE_HEADER_LEN: usize = 8;

const CRC_OFFSET: usize = 0;
/// Offset of the kind byte inside the page header. The pager never
/// interprets it.
pub const PAGE_KIND_OFFSET: usize = 4;

/// Index of a page within its file.
pub type PageId = u32;

/// An in-memory page image.
#[derive(Debug)]
pub struct Page {
    /// Page index within the file.
    pub id: PageId,
    /// Full page image, header included.
    pub data: Vec<u8>,
    /// Set when the image differs from the on-disk state.
    pub dirty: bool,
}

impl Page {
    fn new(id: PageId, page_size: usize) -> Self {
        Self {
            id,
            data: vec![0; page_size],
            dirty: false,
        }
    }
}

/// Page cache and allocator for one file.
pub struct Pager {
    file: File,
    page_size: usize,
    cache: LruCache<PageId, Page>,
    file_len: u64,
}

impl Pager {
    /// Opens (creating if absent) the file at `path`.
    pub fn open(path: &Path, page_size: usize, cache_size: usize) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;

        let file_len = file.metadata()?.len();
        if file_len % page_size as u64 != 0 {
            return Err(StorageError::Corruption(format!(
                "file length {file_len} is not a multiple of the page size"
            )));
        }

        let cache_size = NonZeroUsize::new(cache_size)
            .ok_or_else(|| StorageError::InvalidArgument("page cache size must be nonzero".into()))?;
        Ok(Self {
            file,
            page_size,
            cache: LruCache::new(cache_size),
            file_len,
        })
    }

    /// Page size this file was opened with.
    pub fn page_size(&self) -> usize {
        self.page_size
    }

    /// Number of pages the file currently holds, allocated-but-unflushed
    /// pages included.
    pub fn page_count(&self) -> u64 {
        self.file_len / self.page_size as u64
    }

    /// Appends a zeroed page to the file and returns its id.
    pub fn allocate_page(&mut self) -> Result<PageId> {
        let next_page_id = PageId::try_from(self.file_len / self.page_size as u64)
            .map_err(|_| StorageError::Corruption("file exceeds addressable page range".into()))?;
        let mut page = Page::new(next_page_id, self.page_size);
        page.dirty = true;
        self.insert_into_cache(next_page_id, page)?;
        self.file_len = (u64::from(next_page_id) + 1) * self.page_size as u64;
        Ok(next_page_id)
    }

    /// Runs `f` over a read-only view of the page.
    pub fn with_page<F, T>(&mut self, page_id: PageId, mut f: F) -> Result<T>
    where
        F: FnMut(&[u8]) -> Result<T>,
    {
        let page = self.fetch_page(page_id)?;
        f(&page.data)
    }

    /// Runs `f` over a mutable view of the page and marks it dirty.
    pub fn with_page_mut<F, T>(&mut self, page_id: PageId, mut f: F) -> Result<T>
    where
        F: FnMut(&mut [u8]) -> Result<T>,
    {
        let page = self.fetch_page(page_id)?;
        let result = f(&mut page.data)?;
        page.dirty = true;
        Ok(result)
    }

    /// Writes every dirty page, stamping its crc, then syncs the file.
    pub fn flush(&mut self) -> Result<()> {
        let mut dirty_pages: Vec<PageId> = self
            .cache
            .iter()
            .filter_map(|(&id, page)| page.dirty.then_some(id))
            .collect();
        if dirty_pages.is_empty() {
            return Ok(());
        }
        dirty_pages.sort_unstable();

        for &page_id in &dirty_pages {
            let page = self
                .cache
                .get_mut(&page_id)
                .ok_or_else(|| StorageError::Corruption("dirty page missing from cache".into()))?;
            stamp_crc(&mut page.data);
            let image = page.data.clone();
            self.write_page_to_disk(page_id, &image)?;
            if let Some(page) = self.cache.get_mut(&page_id) {
                page.dirty = false;
            }
        }
        self.file.sync_data()?;
        Ok(())
    }

    fn fetch_page(&mut self, page_id: PageId) -> Result<&mut Page> {
        if u64::from(page_id) >= self.page_count() {
            return Err(StorageError::Corruption(format!(
                "page {page_id} lies beyond the end of the file"
            )));
        }
        if !self.cache.contains(&page_id) {
            let mut page = Page::new(page_id, self.page_size);
            self.read_page_from_disk(&mut page)?;
            self.insert_into_cache(page_id, page)?;
        }
        self.cache
            .get_mut(&page_id)
            .ok_or_else(|| StorageError::Corruption("page evicted during fetch".into()))
    }

    fn insert_into_cache(&mut self, page_id: PageId, page: Page) -> Result<()> {
        if let Some((evicted_id, mut evicted)) = self.cache.push(page_id, page) {
            if evicted_id != page_id && evicted.dirty {
                stamp_crc(&mut evicted.data);
                self.write_page_to_disk(evicted_id, &evicted.data)?;
            }
        }
        Ok(())
    }

    fn read_page_from_disk(&mut self, page: &mut Page) -> Result<()> {
        let offset = page_offset(page.id, self.page_size)?;
        self.file.seek(SeekFrom::Start(offset))?;
        let bytes_read = self.file.read(&mut page.data)?;
        if bytes_read < page.data.len() {
            page.data[bytes_read..].fill(0);
        }
        verify_crc(&page.data, page.id)?;
        Ok(())
    }

    fn write_page_to_disk(&mut self, page_id: PageId, data: &[u8]) -> Result<()> {
        if data.len() != self.page_size {
            return Err(StorageError::InvalidArgument(
                "page size mismatch during flush".into(),
            ));
        }
        let offset = page_offset(page_id, self.page_size)?;
        self.file.seek(SeekFrom::Start(offset))?;
        self.file.write_all(data)?;
        Ok(())
    }
}

fn page_offset(page_id: PageId, page_size: usize) -> Result<u64> {
    u64::from(page_id)
        .checked_mul(page_size as u64)
        .ok_or_else(|| StorageError::InvalidArgument("page offset overflow".into()))
}

fn stamp_crc(data: &mut [u8]) {
    let crc = payload_crc(data);
    data[CRC_OFFSET..CRC_OFFSET + 4].copy_from_slice(&crc.to_be_bytes());
}

fn verify_crc(data: &[u8], page_id: PageId) -> Result<()> {
    if data.iter().all(|&b| b == 0) {
        // Allocated but never flushed; nothing to check.
        return Ok(());
    }
    let mut stored = [0u8; 4];
    stored.copy_from_slice(&data[CRC_OFFSET..CRC_OFFSET + 4]);
    let stored = u32::from_be_bytes(stored);
    let actual = payload_crc(data);
    if stored != actual {
        return Err(StorageError::Corruption(format!(
            "checksum mismatch on page {page_id}"
        )));
    }
    Ok(())
}

fn payload_crc(data: &[u8]) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(&data[PAGE_HEADER_LEN..]);
    hasher.finalize()
}
