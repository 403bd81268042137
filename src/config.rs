//! Storage configuration.
//!
//! The configuration is a plain value handed to [`RecordStore::open`]
//! (`crate::store::RecordStore::open`) and carried by the store for its
//! lifetime. Nothing in this crate reads process-wide settings.

use crate::error::{Result, StorageError};

/// Tuning knobs for a store instance.
#[derive(Debug, Clone)]
pub struct StorageConfig {
    /// Embedded bag size above which a save promotes the bag to a tree.
    /// `-1` disables promotion entirely.
    pub top_threshold: i32,
    /// Tree-backed bag size below which a save demotes it back to the
    /// embedded form. Must stay below `top_threshold`.
    pub bottom_threshold: i32,
    /// Free-to-total page ratio at or above which new tree allocations are
    /// carved from a file's free list instead of extending the file.
    pub free_space_reuse_trigger: f64,
    /// Page size of collection files, in bytes.
    pub page_size: usize,
    /// Pages cached per open collection file.
    pub page_cache_size: usize,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            top_threshold: 40,
            bottom_threshold: 30,
            free_space_reuse_trigger: 0.5,
            page_size: 4096,
            page_cache_size: 1024,
        }
    }
}

impl StorageConfig {
    /// Configuration for environments without tree-backed storage: bags
    /// never leave the embedded representation.
    pub fn embedded_only() -> Self {
        Self {
            top_threshold: -1,
            bottom_threshold: -1,
            ..Self::default()
        }
    }

    /// Favors file-size stability under heavy collection create/delete
    /// churn: any free page is reused before the file grows.
    pub fn churn_tolerant() -> Self {
        Self {
            free_space_reuse_trigger: 0.0,
            ..Self::default()
        }
    }

    pub(crate) fn validate(&self) -> Result<()> {
        if self.top_threshold >= 0 && self.bottom_threshold >= self.top_threshold {
            return Err(StorageError::InvalidArgument(format!(
                "bottom_threshold {} must stay below top_threshold {}",
                self.bottom_threshold, self.top_threshold
            )));
        }
        if !(0.0..=1.0).contains(&self.free_space_reuse_trigger) {
            return Err(StorageError::InvalidArgument(
                "free_space_reuse_trigger must lie in [0, 1]".into(),
            ));
        }
        if self.page_size < 512 || self.page_size % 256 != 0 {
            return Err(StorageError::InvalidArgument(format!(
                "unsupported page size {}",
                self.page_size
            )));
        }
        if self.page_cache_size == 0 {
            return Err(StorageError::InvalidArgument(
                "page_cache_size must be nonzero".into(),
            ));
        }
        Ok(())
    }
}
