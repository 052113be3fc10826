use std::collections::HashMap;
use std::sync::RwLock;

use crate::changeset::Change;
use crate::model::{DataKind, StoreItem};
use crate::store::ReadStore;
use crate::Result;

/// Thread-safe in-memory store for flag and segment data.
///
/// Writes are atomic: a basis or delta is validated in full before anything
/// is committed, and the commit happens under a single write lock. Reads are
/// cheap `Arc` clones under a read lock.
#[derive(Default)]
pub struct MemoryStore {
    inner: RwLock<Collections>,
}

#[derive(Default)]
struct Collections {
    flags: HashMap<String, StoreItem>,
    segments: HashMap<String, StoreItem>,
    initialized: bool,
}

impl Collections {
    fn collection(&self, kind: DataKind) -> &HashMap<String, StoreItem> {
        match kind {
            DataKind::Flag => &self.flags,
            DataKind::Segment => &self.segments,
        }
    }

    fn collection_mut(&mut self, kind: DataKind) -> &mut HashMap<String, StoreItem> {
        match kind {
            DataKind::Flag => &mut self.flags,
            DataKind::Segment => &mut self.segments,
        }
    }
}

impl MemoryStore {
    pub fn new() -> MemoryStore {
        MemoryStore::default()
    }

    /// Atomically replace all stored data and mark the store initialized.
    ///
    /// Returns the keys whose visible state differs from before the swap
    /// (new, removed, or re-versioned items), for change fan-out. On a
    /// validation error nothing is modified.
    pub fn set_basis(&self, changes: &[Change]) -> Result<Vec<(DataKind, String)>> {
        let mut flags = HashMap::new();
        let mut segments = HashMap::new();
        for change in changes {
            let (kind, key, item) = change.as_entry();
            item.validate(kind, key)?;
            match kind {
                DataKind::Flag => flags.insert(key.to_owned(), item),
                DataKind::Segment => segments.insert(key.to_owned(), item),
            };
        }

        let mut inner = self
            .inner
            .write()
            .expect("thread holding store lock should not panic");
        let mut changed = diff_keys(DataKind::Flag, &inner.flags, &flags);
        changed.extend(diff_keys(DataKind::Segment, &inner.segments, &segments));
        inner.flags = flags;
        inner.segments = segments;
        inner.initialized = true;
        Ok(changed)
    }

    /// Atomically apply a delta on top of existing data.
    ///
    /// Each change is gated on version: a write whose version is not greater
    /// than the stored version (tombstones included) is skipped. Returns the
    /// keys actually written. On a validation error nothing is modified.
    pub fn apply_delta(&self, changes: &[Change]) -> Result<Vec<(DataKind, String)>> {
        for change in changes {
            let (kind, key, item) = change.as_entry();
            item.validate(kind, key)?;
        }

        let mut inner = self
            .inner
            .write()
            .expect("thread holding store lock should not panic");
        let mut applied = Vec::new();
        for change in changes {
            let (kind, key, item) = change.as_entry();
            let collection = inner.collection_mut(kind);
            match collection.get(key) {
                Some(existing) if existing.version() >= item.version() => {
                    log::debug!(target: "switchgear",
                        kind:display = kind,
                        key,
                        stored_version = existing.version(),
                        write_version = item.version();
                        "skipping stale write");
                }
                _ => {
                    collection.insert(key.to_owned(), item);
                    applied.push((kind, key.to_owned()));
                }
            }
        }
        Ok(applied)
    }

    /// All entries of a kind, tombstones included. Used for write-through to
    /// persistent mirrors, which need deletions preserved.
    pub(crate) fn dump(&self, kind: DataKind) -> HashMap<String, StoreItem> {
        let inner = self
            .inner
            .read()
            .expect("thread holding store lock should not panic");
        inner.collection(kind).clone()
    }
}

impl ReadStore for MemoryStore {
    fn get(&self, kind: DataKind, key: &str) -> Option<StoreItem> {
        let inner = self
            .inner
            .read()
            .expect("thread holding store lock should not panic");
        inner
            .collection(kind)
            .get(key)
            .filter(|item| !item.is_tombstone())
            .cloned()
    }

    fn all(&self, kind: DataKind) -> HashMap<String, StoreItem> {
        let inner = self
            .inner
            .read()
            .expect("thread holding store lock should not panic");
        inner
            .collection(kind)
            .iter()
            .filter(|(_, item)| !item.is_tombstone())
            .map(|(key, item)| (key.clone(), item.clone()))
            .collect()
    }

    fn initialized(&self) -> bool {
        let inner = self
            .inner
            .read()
            .expect("thread holding store lock should not panic");
        inner.initialized
    }
}

fn diff_keys(
    kind: DataKind,
    old: &HashMap<String, StoreItem>,
    new: &HashMap<String, StoreItem>,
) -> Vec<(DataKind, String)> {
    let mut changed = Vec::new();
    for (key, item) in new {
        let same = old
            .get(key)
            .is_some_and(|o| o.version() == item.version() && o.is_tombstone() == item.is_tombstone());
        if !same {
            changed.push((kind, key.clone()));
        }
    }
    for key in old.keys() {
        if !new.contains_key(key) {
            changed.push((kind, key.clone()));
        }
    }
    changed
}
