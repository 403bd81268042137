//! Index definitions, keys, and the persisted index store.
//!
//! Keys are opaque byte sequences; composite tuples encode each segment with
//! an order-preserving escape so that tuple order equals byte order. The
//! store validates only structure (segment arity against the definition) —
//! domain semantics of keys stay with the caller.
//!
//! Persisted index state belongs to the storage layer: it is mutated solely
//! at commit, under the store's commit choke point, by replaying a
//! transaction's overlay. Readers without an overlay read it directly.

pub mod overlay;

use std::collections::BTreeMap;

use parking_lot::RwLock;
use rustc_hash::FxHashMap;

use crate::error::{Result, StorageError};
use crate::types::RecordId;
use overlay::IndexOverlay;

const SEGMENT_ESCAPE: u8 = 0x00;
const SEGMENT_ESCAPED_ZERO: u8 = 0xFF;
const SEGMENT_TERMINATOR: [u8; 2] = [0x00, 0x00];

/// An opaque, totally ordered index key.
///
/// Single-segment keys wrap a byte sequence; composite keys concatenate
/// escaped segments so that comparing encoded keys compares the tuples
/// segment by segment.
#[derive(Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct IndexKey {
    bytes: Vec<u8>,
    arity: u16,
}

impl IndexKey {
    /// Single-segment key over an opaque byte sequence.
    pub fn from_bytes(segment: &[u8]) -> Self {
        Self::composite(&[segment])
    }

    /// Composite key over ordered segments.
    pub fn composite(segments: &[&[u8]]) -> Self {
        let mut bytes = Vec::with_capacity(segments.iter().map(|s| s.len() + 2).sum());
        for segment in segments {
            for &byte in *segment {
                if byte == SEGMENT_ESCAPE {
                    bytes.push(SEGMENT_ESCAPE);
                    bytes.push(SEGMENT_ESCAPED_ZERO);
                } else {
                    bytes.push(byte);
                }
            }
            bytes.extend_from_slice(&SEGMENT_TERMINATOR);
        }
        Self {
            bytes,
            arity: segments.len() as u16,
        }
    }

    /// Number of segments the key was built from.
    pub fn arity(&self) -> u16 {
        self.arity
    }
}

/// Caller-supplied description of an index.
#[derive(Clone, Debug)]
pub struct IndexDefinition {
    /// Name the index is addressed by.
    pub name: String,
    /// Whether a key may hold at most one record.
    pub unique: bool,
    /// Number of segments every key must carry.
    pub key_arity: u16,
}

impl IndexDefinition {
    /// Non-unique index over `key_arity`-segment keys.
    pub fn new(name: impl Into<String>, key_arity: u16) -> Self {
        Self {
            name: name.into(),
            unique: false,
            key_arity,
        }
    }

    /// Unique index over `key_arity`-segment keys.
    pub fn unique(name: impl Into<String>, key_arity: u16) -> Self {
        Self {
            name: name.into(),
            unique: true,
            key_arity,
        }
    }

    pub(crate) fn validate_key(&self, key: &IndexKey) -> Result<()> {
        if key.arity() != self.key_arity {
            return Err(StorageError::SchemaMismatch(
                "key segment count does not match the index definition",
            ));
        }
        Ok(())
    }
}

struct PersistedIndex {
    definition: IndexDefinition,
    entries: BTreeMap<IndexKey, Vec<RecordId>>,
}

/// Storage-owned persisted indexes.
pub struct IndexStore {
    indexes: RwLock<FxHashMap<String, PersistedIndex>>,
}

impl IndexStore {
    pub(crate) fn new() -> Self {
        Self {
            indexes: RwLock::new(FxHashMap::default()),
        }
    }

    pub(crate) fn create(&self, definition: IndexDefinition) -> Result<()> {
        let mut indexes = self.indexes.write();
        if indexes.contains_key(&definition.name) {
            return Err(StorageError::InvalidArgument(format!(
                "index '{}' already exists",
                definition.name
            )));
        }
        indexes.insert(
            definition.name.clone(),
            PersistedIndex {
                definition,
                entries: BTreeMap::new(),
            },
        );
        Ok(())
    }

    pub(crate) fn definition(&self, name: &str) -> Result<IndexDefinition> {
        let indexes = self.indexes.read();
        indexes
            .get(name)
            .map(|index| index.definition.clone())
            .ok_or(StorageError::NotFound("index"))
    }

    /// Persisted lookup; last-committed state only.
    pub(crate) fn lookup(&self, name: &str, key: &IndexKey) -> Result<Vec<RecordId>> {
        let indexes = self.indexes.read();
        let index = indexes.get(name).ok_or(StorageError::NotFound("index"))?;
        Ok(index.entries.get(key).cloned().unwrap_or_default())
    }

    /// Persisted keys in ascending order.
    pub(crate) fn keys(&self, name: &str) -> Result<Vec<IndexKey>> {
        let indexes = self.indexes.read();
        let index = indexes.get(name).ok_or(StorageError::NotFound("index"))?;
        Ok(index.entries.keys().cloned().collect())
    }

    /// Pre-commit check: replaying `overlay` must not leave any key of a
    /// unique index with more than one record.
    pub(crate) fn check_unique(&self, name: &str, overlay: &IndexOverlay) -> Result<()> {
        let indexes = self.indexes.read();
        let index = indexes.get(name).ok_or(StorageError::NotFound("index"))?;
        if !index.definition.unique {
            return Ok(());
        }
        for key in overlay.touched_keys() {
            let base = index.entries.get(&key).cloned().unwrap_or_default();
            if overlay.apply_to_key(&key, base).len() > 1 {
                return Err(StorageError::UniquenessViolation {
                    index: name.to_string(),
                });
            }
        }
        Ok(())
    }

    /// Commit-time replay of an overlay into the persisted index.
    pub(crate) fn apply_overlay(&self, name: &str, overlay: &IndexOverlay) -> Result<()> {
        let mut indexes = self.indexes.write();
        let index = indexes.get_mut(name).ok_or(StorageError::NotFound("index"))?;
        for key in overlay.touched_keys() {
            let base = index.entries.get(&key).cloned().unwrap_or_default();
            let merged = overlay.apply_to_key(&key, base);
            if merged.is_empty() {
                index.entries.remove(&key);
            } else {
                index.entries.insert(key, merged);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rid(position: i64) -> RecordId {
        RecordId::new(1, position)
    }

    #[test]
    fn composite_keys_order_like_tuples() {
        let ab = IndexKey::composite(&[b"a", b"b"]);
        let b = IndexKey::composite(&[b"b"]);
        // Segment-wise: ("a", "b") < ("b",) because "a" < "b".
        assert!(ab < b);

        let short = IndexKey::composite(&[b"ab"]);
        let long = IndexKey::composite(&[b"ab", b"x"]);
        assert!(short < long);
    }

    #[test]
    fn embedded_zero_bytes_do_not_collide_with_terminators() {
        let with_zero = IndexKey::composite(&[b"a\x00b"]);
        let split = IndexKey::composite(&[b"a", b"b"]);
        assert_ne!(with_zero, split);
    }

    #[test]
    fn arity_mismatch_is_a_schema_error() {
        let definition = IndexDefinition::new("byName", 2);
        let narrow = IndexKey::from_bytes(b"solo");
        assert!(matches!(
            definition.validate_key(&narrow),
            Err(StorageError::SchemaMismatch(_))
        ));
    }

    #[test]
    fn unique_check_rejects_second_rid() {
        let store = IndexStore::new();
        store
            .create(IndexDefinition::unique("uq", 1))
            .expect("create");
        let key = IndexKey::from_bytes(b"k");
        let mut seed = IndexOverlay::new();
        seed.put(key.clone(), rid(1));
        store.check_unique("uq", &seed).expect("first rid passes");
        store.apply_overlay("uq", &seed).expect("apply");

        let mut second = IndexOverlay::new();
        second.put(key.clone(), rid(2));
        assert!(matches!(
            store.check_unique("uq", &second),
            Err(StorageError::UniquenessViolation { .. })
        ));

        // Replacing the rid in the same transaction is fine.
        let mut replace = IndexOverlay::new();
        replace.remove(key.clone(), Some(rid(1)));
        replace.put(key, rid(2));
        store.check_unique("uq", &replace).expect("replacement passes");
    }

    #[test]
    fn apply_overlay_prunes_emptied_keys() {
        let store = IndexStore::new();
        store.create(IndexDefinition::new("ix", 1)).expect("create");
        let key = IndexKey::from_bytes(b"k");
        let mut seed = IndexOverlay::new();
        seed.put(key.clone(), rid(1));
        store.apply_overlay("ix", &seed).expect("apply");
        assert_eq!(store.keys("ix").expect("keys").len(), 1);

        let mut clear = IndexOverlay::new();
        clear.remove(key.clone(), None);
        store.apply_overlay("ix", &clear).expect("apply clear");
        assert!(store.keys("ix").expect("keys").is_empty());
        assert!(store.lookup("ix", &key).expect("lookup").is_empty());
    }
}
