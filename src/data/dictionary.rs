//! Per-section dictionary mapping small integer ids to pooled entries.
//!
//! Ids are list indices, so the valid range is always `0..len()`. The list is
//! append-only while a section loads; merges either append blindly
//! ([`FullDataDictionary::add_all`]) or dedupe and hand back an id remap
//! ([`FullDataDictionary::merge_and_return_remapped_ids`]).

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::core::error::{Error, Result};
use crate::data::entry::DictionaryEntry;

#[derive(Default, Clone)]
struct Inner {
    entries: Vec<Arc<DictionaryEntry>>,
    /// First id assigned to each distinct entry
    ids: HashMap<Arc<DictionaryEntry>, u32>,
}

impl Inner {
    fn add_if_not_present(&mut self, entry: Arc<DictionaryEntry>) -> u32 {
        if let Some(&id) = self.ids.get(&entry) {
            return id;
        }
        self.push(entry)
    }

    fn push(&mut self, entry: Arc<DictionaryEntry>) -> u32 {
        let id = self.entries.len() as u32;
        self.ids.entry(Arc::clone(&entry)).or_insert(id);
        self.entries.push(entry);
        id
    }
}

/// Interning dictionary owned by one full data source
///
/// Reads may proceed concurrently; adds and merges take the write lock.
#[derive(Default)]
pub struct FullDataDictionary {
    inner: RwLock<Inner>,
}

impl FullDataDictionary {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a dictionary from entries in id order (duplicates are kept)
    pub fn from_entries(entries: Vec<Arc<DictionaryEntry>>) -> Self {
        let mut inner = Inner::default();
        for entry in entries {
            inner.push(entry);
        }
        Self {
            inner: RwLock::new(inner),
        }
    }

    /// Return the id of `entry`, appending it if no value-equal entry exists
    pub fn add_if_not_present_and_get_id(&self, entry: Arc<DictionaryEntry>) -> u32 {
        self.write().add_if_not_present(entry)
    }

    /// Append every entry of `other`, duplicates included
    ///
    /// Ids already handed out by either dictionary stay meaningful: an id `i`
    /// from `other` becomes `old_len + i` here. Used when no compaction step
    /// follows.
    pub fn add_all(&self, other: &FullDataDictionary) -> u32 {
        let incoming = other.entries();
        let mut inner = self.write();
        let offset = inner.entries.len() as u32;
        for entry in incoming {
            inner.push(entry);
        }
        offset
    }

    /// Merge `other` into this dictionary without creating duplicates
    ///
    /// Returns a table indexed by `other`'s ids holding the id of the same
    /// entry in this dictionary.
    pub fn merge_and_return_remapped_ids(&self, other: &FullDataDictionary) -> Vec<u32> {
        let incoming = other.entries();
        let mut inner = self.write();
        incoming
            .into_iter()
            .map(|entry| inner.add_if_not_present(entry))
            .collect()
    }

    /// Look up an entry; an out-of-range id means the caller's data is corrupt
    pub fn get_entry(&self, id: u32) -> Result<Arc<DictionaryEntry>> {
        let inner = self.read();
        inner.entries.get(id as usize).cloned().ok_or_else(|| {
            Error::Corrupted(format!(
                "dictionary id {} out of range (size {})",
                id,
                inner.entries.len()
            ))
        })
    }

    /// Id of a value-equal entry, if present
    pub fn id_of(&self, entry: &DictionaryEntry) -> Option<u32> {
        self.read().ids.get(entry).copied()
    }

    pub fn len(&self) -> usize {
        self.read().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().entries.is_empty()
    }

    /// Snapshot of all entries in id order
    pub fn entries(&self) -> Vec<Arc<DictionaryEntry>> {
        self.read().entries.clone()
    }

    /// Whether two list slots hold value-equal entries
    pub fn has_duplicates(&self) -> bool {
        let inner = self.read();
        inner.ids.len() != inner.entries.len()
    }

    /// Rebuild without duplicates
    ///
    /// Returns the compacted dictionary and a remap table from old ids to new
    /// ones.
    pub fn compacted(&self) -> (FullDataDictionary, Vec<u32>) {
        let compacted = FullDataDictionary::new();
        let remap = {
            let mut target = compacted.write();
            self.read()
                .entries
                .iter()
                .map(|entry| target.add_if_not_present(Arc::clone(entry)))
                .collect()
        };
        (compacted, remap)
    }

    pub fn clear(&self) {
        let mut inner = self.write();
        inner.entries.clear();
        inner.ids.clear();
    }

    fn read(&self) -> RwLockReadGuard<'_, Inner> {
        self.inner.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, Inner> {
        self.inner.write().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Clone for FullDataDictionary {
    fn clone(&self) -> Self {
        Self {
            inner: RwLock::new(self.read().clone()),
        }
    }
}

impl std::fmt::Debug for FullDataDictionary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FullDataDictionary")
            .field("len", &self.len())
            .finish()
    }
}
