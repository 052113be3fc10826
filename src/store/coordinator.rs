use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, Weak};

use crate::broadcast::{Broadcaster, ListenerId};
use crate::changeset::{ChangeSet, IntentCode, Selector};
use crate::model::{DataKind, StoreItem};
use crate::status::{DataStoreStatus, DataStoreStatusManager};
use crate::store::{
    DependencyTracker, MemoryStore, PersistentDataStore, PersistentStoreAdapter,
    PersistentStoreConfig, ReadStore, StoreCacheTtl,
};
use crate::Result;

/// Notification that a flag's evaluation may have changed, either because
/// the flag itself changed or because something it depends on did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlagChange {
    pub key: String,
}

/// Coordinates the in-memory store, an optional persistent mirror, and
/// change notifications.
///
/// Memory is authoritative: change sets commit there first and reads are
/// served from it once it holds a basis. The persistent mirror is written
/// through best-effort; while memory is still empty (e.g. another process
/// populates the database), reads fall through to the mirror.
pub struct Store {
    memory: Arc<MemoryStore>,
    persistent: Option<Arc<PersistentStoreAdapter>>,
    store_status: Option<Arc<DataStoreStatusManager>>,
    dependencies: Mutex<DependencyTracker>,
    selector: Mutex<Option<Selector>>,
    flag_changes: Broadcaster<FlagChange>,
    change_sets: Broadcaster<ChangeSet>,
}

impl Store {
    /// A memory-only store.
    pub fn new() -> Result<Arc<Store>> {
        Store::build(None, None)
    }

    /// A store mirrored to a persistent backend.
    pub fn with_persistence(
        backend: Arc<dyn PersistentDataStore>,
        config: &PersistentStoreConfig,
    ) -> Result<Arc<Store>> {
        // An infinite cache masks an outage from readers, so recoveries are
        // broadcast without the stale flag.
        let refresh_on_recovery = !matches!(config.cache_ttl, StoreCacheTtl::Infinite);
        let probe_backend = Arc::clone(&backend);
        let status = Arc::new(DataStoreStatusManager::new(
            Arc::new(move || probe_backend.available()),
            refresh_on_recovery,
            config.status_poll_interval,
        )?);
        let adapter = Arc::new(PersistentStoreAdapter::new(
            backend,
            config,
            Some(Arc::clone(&status)),
        ));
        Store::build(Some(adapter), Some(status))
    }

    fn build(
        persistent: Option<Arc<PersistentStoreAdapter>>,
        store_status: Option<Arc<DataStoreStatusManager>>,
    ) -> Result<Arc<Store>> {
        let store = Arc::new(Store {
            memory: Arc::new(MemoryStore::new()),
            persistent,
            store_status,
            dependencies: Mutex::new(DependencyTracker::new()),
            selector: Mutex::new(None),
            flag_changes: Broadcaster::new()?,
            change_sets: Broadcaster::new()?,
        });

        if let Some(status) = &store.store_status {
            // When the backend comes back from an outage it may have missed
            // writes; rewrite it from memory.
            let weak: Weak<Store> = Arc::downgrade(&store);
            status.add_listener(Box::new(move |status: &DataStoreStatus| {
                if !status.available {
                    return;
                }
                let Some(store) = weak.upgrade() else {
                    return;
                };
                match store.commit() {
                    Ok(()) => {
                        if let Some(status) = &store.store_status {
                            status.record_refreshed();
                        }
                    }
                    Err(err) => {
                        // The adapter reported the failure; another recovery
                        // cycle will retry.
                        log::warn!(target: "switchgear", error:display = err; "failed to rewrite persistent store after recovery");
                    }
                }
            }));
        }
        Ok(store)
    }

    /// Apply a change set: memory first, then the persistent mirror when
    /// `persist` is set, then notifications.
    ///
    /// A persistence failure does not fail the apply; memory keeps serving
    /// and the mirror is rewritten once its status recovers.
    pub fn apply(&self, change_set: &ChangeSet, persist: bool) -> Result<()> {
        let changed = match change_set.intent() {
            IntentCode::TransferNone => return Ok(()),
            IntentCode::TransferFull => self.memory.set_basis(change_set.changes())?,
            IntentCode::TransferChanges => self.memory.apply_delta(change_set.changes())?,
        };

        if let Some(selector) = change_set.selector() {
            *self
                .selector
                .lock()
                .expect("thread holding selector lock should not panic") = Some(selector.clone());
        }

        let affected = self.refresh_dependencies(change_set, &changed);

        if persist {
            if let Some(adapter) = &self.persistent {
                let result = match change_set.intent() {
                    IntentCode::TransferFull => adapter.init_full(&self.full_dump()),
                    IntentCode::TransferChanges => adapter.apply_changes(change_set.changes()),
                    IntentCode::TransferNone => Ok(()),
                };
                if let Err(err) = result {
                    log::warn!(target: "switchgear", error:display = err; "failed to write changes to persistent store");
                }
            }
        }

        if self.flag_changes.has_listeners() {
            for key in affected {
                self.flag_changes.broadcast(FlagChange { key });
            }
        }
        if self.change_sets.has_listeners() {
            self.change_sets.broadcast(change_set.clone());
        }
        Ok(())
    }

    /// Rewrite the persistent mirror from memory, tombstones included.
    pub fn commit(&self) -> Result<()> {
        if let Some(adapter) = &self.persistent {
            adapter.init_full(&self.full_dump())?;
        }
        Ok(())
    }

    /// Maintain the dependency index and compute the ordered flag fan-out
    /// for the applied changes.
    fn refresh_dependencies(
        &self,
        change_set: &ChangeSet,
        changed: &[(DataKind, String)],
    ) -> Vec<String> {
        let mut tracker = self
            .dependencies
            .lock()
            .expect("thread holding dependency lock should not panic");

        if change_set.intent() == IntentCode::TransferFull {
            tracker.reset();
            for kind in [DataKind::Flag, DataKind::Segment] {
                for (key, item) in self.memory.all(kind) {
                    tracker.update_dependencies_of(kind, &key, &item);
                }
            }
        } else {
            let applied: HashSet<(DataKind, &str)> = changed
                .iter()
                .map(|(kind, key)| (*kind, key.as_str()))
                .collect();
            for change in change_set.changes() {
                let (kind, key, item) = change.as_entry();
                // Version-gated skips keep their old dependencies.
                if applied.contains(&(kind, key)) {
                    tracker.update_dependencies_of(kind, key, &item);
                }
            }
        }

        let mut affected = Vec::new();
        let mut seen = HashSet::new();
        for (kind, key) in changed {
            for flag_key in tracker.affected_flag_keys(*kind, key) {
                if seen.insert(flag_key.clone()) {
                    affected.push(flag_key);
                }
            }
        }
        affected
    }

    fn full_dump(&self) -> Vec<(DataKind, Vec<(String, StoreItem)>)> {
        [DataKind::Flag, DataKind::Segment]
            .into_iter()
            .map(|kind| (kind, self.memory.dump(kind).into_iter().collect()))
            .collect()
    }

    pub fn add_flag_change_listener(
        &self,
        listener: Box<dyn Fn(&FlagChange) + Send + Sync>,
    ) -> ListenerId {
        self.flag_changes.add_listener(listener)
    }

    pub fn remove_flag_change_listener(&self, id: ListenerId) {
        self.flag_changes.remove_listener(id)
    }

    pub fn add_change_set_listener(
        &self,
        listener: Box<dyn Fn(&ChangeSet) + Send + Sync>,
    ) -> ListenerId {
        self.change_sets.add_listener(listener)
    }

    pub fn remove_change_set_listener(&self, id: ListenerId) {
        self.change_sets.remove_listener(id)
    }

    /// Snapshot token of the most recently applied change set, handed to
    /// data sources so they can resume where the stored data left off.
    pub fn selector(&self) -> Option<Selector> {
        self.selector
            .lock()
            .expect("thread holding selector lock should not panic")
            .clone()
    }

    /// Persistent store status, present when a backend is configured.
    pub fn store_status(&self) -> Option<&Arc<DataStoreStatusManager>> {
        self.store_status.as_ref()
    }

    pub fn stop(&self) {
        if let Some(adapter) = &self.persistent {
            adapter.stop();
        }
    }
}

impl ReadStore for Store {
    fn get(&self, kind: DataKind, key: &str) -> Option<StoreItem> {
        if !self.memory.initialized() {
            if let Some(adapter) = &self.persistent {
                return adapter.get(kind, key);
            }
        }
        self.memory.get(kind, key)
    }

    fn all(&self, kind: DataKind) -> HashMap<String, StoreItem> {
        if !self.memory.initialized() {
            if let Some(adapter) = &self.persistent {
                return adapter.all(kind);
            }
        }
        self.memory.all(kind)
    }

    fn initialized(&self) -> bool {
        if self.memory.initialized() {
            return true;
        }
        self.persistent
            .as_ref()
            .is_some_and(|adapter| adapter.initialized())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::Ordering;
    use std::sync::mpsc;
    use std::time::{Duration, Instant};

    use crate::changeset::ChangeSetBuilder;
    use crate::test_util::{FlagBuilder, MockBackend, SegmentBuilder};

    fn full_basis(store: &Store, flags: Vec<crate::model::Flag>) {
        let mut builder = ChangeSetBuilder::start_full(None);
        for flag in flags {
            let key = flag.key.clone();
            builder.add_put(DataKind::Flag, key, flag);
        }
        store.apply(&builder.finish(), false).unwrap();
    }

    #[test]
    fn serves_reads_after_full_transfer() {
        let store = Store::new().unwrap();
        assert!(!store.initialized());
        full_basis(&store, vec![FlagBuilder::new("f1").version(1).build()]);
        assert!(store.initialized());
        assert!(store.flag("f1").is_some());
        assert!(store.flag("other").is_none());
    }

    #[test]
    fn delta_on_top_of_full_transfer_accumulates() {
        let store = Store::new().unwrap();
        full_basis(
            &store,
            vec![
                FlagBuilder::new("f1").version(1).build(),
                FlagBuilder::new("f2").version(1).build(),
                FlagBuilder::new("f3").version(1).build(),
            ],
        );

        let mut delta = ChangeSetBuilder::start_changes(None);
        delta
            .add_put(DataKind::Flag, "f2", FlagBuilder::new("f2").version(2).build())
            .add_put(DataKind::Flag, "f4", FlagBuilder::new("f4").version(1).build());
        store.apply(&delta.finish(), false).unwrap();

        let all = store.all(DataKind::Flag);
        assert_eq!(all.len(), 4);
        assert_eq!(store.flag("f2").unwrap().version, 2);
    }

    #[test]
    fn transfer_none_applies_without_touching_data() {
        let store = Store::new().unwrap();
        store.apply(&ChangeSet::no_changes(), false).unwrap();
        assert!(!store.initialized());
    }

    #[test]
    fn fan_out_notifies_dependents_in_order() {
        let store = Store::new().unwrap();
        full_basis(
            &store,
            vec![
                FlagBuilder::new("base").version(1).build(),
                FlagBuilder::new("mid").version(1).prerequisite("base", 0).build(),
                FlagBuilder::new("top").version(1).prerequisite("mid", 0).build(),
            ],
        );

        let (tx, rx) = mpsc::channel();
        store.add_flag_change_listener(Box::new(move |change| {
            let _ = tx.send(change.key.clone());
        }));

        let mut delta = ChangeSetBuilder::start_changes(None);
        delta.add_put(
            DataKind::Flag,
            "base",
            FlagBuilder::new("base").version(2).build(),
        );
        store.apply(&delta.finish(), false).unwrap();

        let received: Vec<String> = (0..3)
            .map(|_| rx.recv_timeout(Duration::from_secs(1)).unwrap())
            .collect();
        assert_eq!(received, vec!["base", "mid", "top"]);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn segment_change_notifies_referencing_flags_then_their_dependents() {
        let store = Store::new().unwrap();
        let mut builder = ChangeSetBuilder::start_full(None);
        builder.add_put(
            DataKind::Flag,
            "f1",
            FlagBuilder::new("f1").version(1).segment_match_rule("seg").build(),
        );
        builder.add_put(
            DataKind::Flag,
            "f2",
            FlagBuilder::new("f2").version(1).prerequisite("f1", 0).build(),
        );
        builder.add_put(
            DataKind::Segment,
            "seg",
            SegmentBuilder::new("seg").version(1).build(),
        );
        store.apply(&builder.finish(), false).unwrap();

        let (tx, rx) = mpsc::channel();
        store.add_flag_change_listener(Box::new(move |change| {
            let _ = tx.send(change.key.clone());
        }));

        let mut delta = ChangeSetBuilder::start_changes(None);
        delta.add_put(
            DataKind::Segment,
            "seg",
            SegmentBuilder::new("seg").version(2).included(&["alice"]).build(),
        );
        store.apply(&delta.finish(), false).unwrap();

        // The flag whose rule references the segment, then the flag that
        // depends on it through a prerequisite, once each.
        assert_eq!(rx.recv_timeout(Duration::from_secs(1)).unwrap(), "f1");
        assert_eq!(rx.recv_timeout(Duration::from_secs(1)).unwrap(), "f2");
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn selector_tracks_the_latest_applied_change_set() {
        let store = Store::new().unwrap();
        assert!(store.selector().is_none());

        let mut builder = ChangeSetBuilder::start_full(Some(Selector::new("s-1")));
        builder.add_put(DataKind::Flag, "f1", FlagBuilder::new("f1").version(1).build());
        store.apply(&builder.finish(), false).unwrap();
        assert_eq!(store.selector(), Some(Selector::new("s-1")));

        // A delta without a selector keeps the last one.
        let mut delta = ChangeSetBuilder::start_changes(None);
        delta.add_put(DataKind::Flag, "f1", FlagBuilder::new("f1").version(2).build());
        store.apply(&delta.finish(), false).unwrap();
        assert_eq!(store.selector(), Some(Selector::new("s-1")));

        let mut delta = ChangeSetBuilder::start_changes(Some(Selector::new("s-2")));
        delta.add_put(DataKind::Flag, "f1", FlagBuilder::new("f1").version(3).build());
        store.apply(&delta.finish(), false).unwrap();
        assert_eq!(store.selector(), Some(Selector::new("s-2")));
    }

    #[test]
    fn stale_writes_notify_nobody() {
        let store = Store::new().unwrap();
        full_basis(&store, vec![FlagBuilder::new("f1").version(5).build()]);

        let (tx, rx) = mpsc::channel();
        store.add_flag_change_listener(Box::new(move |change| {
            let _ = tx.send(change.key.clone());
        }));

        let mut delta = ChangeSetBuilder::start_changes(None);
        delta.add_put(DataKind::Flag, "f1", FlagBuilder::new("f1").version(5).build());
        store.apply(&delta.finish(), false).unwrap();
        assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());
    }

    #[test]
    fn full_transfer_notifies_only_the_diff() {
        let store = Store::new().unwrap();
        full_basis(
            &store,
            vec![
                FlagBuilder::new("same").version(1).build(),
                FlagBuilder::new("bumped").version(1).build(),
            ],
        );

        let (tx, rx) = mpsc::channel();
        store.add_flag_change_listener(Box::new(move |change| {
            let _ = tx.send(change.key.clone());
        }));

        full_basis(
            &store,
            vec![
                FlagBuilder::new("same").version(1).build(),
                FlagBuilder::new("bumped").version(2).build(),
            ],
        );
        assert_eq!(rx.recv_timeout(Duration::from_secs(1)).unwrap(), "bumped");
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn change_set_listener_receives_raw_change_sets() {
        let store = Store::new().unwrap();
        let (tx, rx) = mpsc::channel();
        store.add_change_set_listener(Box::new(move |change_set| {
            let _ = tx.send(change_set.intent());
        }));

        full_basis(&store, vec![FlagBuilder::new("f1").version(1).build()]);
        assert_eq!(
            rx.recv_timeout(Duration::from_secs(1)).unwrap(),
            IntentCode::TransferFull
        );
    }

    #[test]
    fn persistence_outage_recovers_with_rewrite() {
        let backend = Arc::new(MockBackend::default());
        let config = PersistentStoreConfig {
            status_poll_interval: Duration::from_millis(10),
            ..PersistentStoreConfig::default()
        };
        let store =
            Store::with_persistence(Arc::clone(&backend) as Arc<dyn PersistentDataStore>, &config)
                .unwrap();

        full_basis(&store, vec![FlagBuilder::new("f1").version(1).build()]);
        // `persist` was false above; write-through happens only when asked.
        let mut delta = ChangeSetBuilder::start_changes(None);
        delta.add_put(DataKind::Flag, "f2", FlagBuilder::new("f2").version(1).build());
        store.apply(&delta.finish(), true).unwrap();
        assert_eq!(backend.version_of(DataKind::Flag, "f2"), Some(1));

        // Outage: memory keeps the write, the mirror misses it.
        backend.fail.store(true, Ordering::SeqCst);
        let mut delta = ChangeSetBuilder::start_changes(None);
        delta.add_put(DataKind::Flag, "f3", FlagBuilder::new("f3").version(1).build());
        store.apply(&delta.finish(), true).unwrap();
        assert!(store.flag("f3").is_some());
        assert_eq!(backend.version_of(DataKind::Flag, "f3"), None);
        let status = store.store_status().unwrap();
        assert!(!status.status().available);

        // Recovery: the monitor notices and the store rewrites the mirror.
        backend.fail.store(false, Ordering::SeqCst);
        let deadline = Instant::now() + Duration::from_secs(2);
        while backend.version_of(DataKind::Flag, "f3").is_none() {
            assert!(Instant::now() < deadline, "mirror was not rewritten in time");
            std::thread::sleep(Duration::from_millis(10));
        }
        let deadline = Instant::now() + Duration::from_secs(2);
        while status.status().stale {
            assert!(Instant::now() < deadline, "stale status was not cleared");
            std::thread::sleep(Duration::from_millis(10));
        }
        assert!(status.status().available);
    }

    #[test]
    fn infinite_cache_outage_still_rewrites_the_mirror() {
        let backend = Arc::new(MockBackend::default());
        let config = PersistentStoreConfig {
            cache_ttl: StoreCacheTtl::Infinite,
            status_poll_interval: Duration::from_millis(10),
            ..PersistentStoreConfig::default()
        };
        let store =
            Store::with_persistence(Arc::clone(&backend) as Arc<dyn PersistentDataStore>, &config)
                .unwrap();
        full_basis(&store, vec![FlagBuilder::new("f1").version(1).build()]);

        backend.fail.store(true, Ordering::SeqCst);
        let mut delta = ChangeSetBuilder::start_changes(None);
        delta.add_put(DataKind::Flag, "f2", FlagBuilder::new("f2").version(1).build());
        store.apply(&delta.finish(), true).unwrap();
        assert_eq!(backend.version_of(DataKind::Flag, "f2"), None);

        // Readers never saw stale data, but the mirror still lost the write
        // and gets rewritten once the backend comes back.
        backend.fail.store(false, Ordering::SeqCst);
        let deadline = Instant::now() + Duration::from_secs(2);
        while backend.version_of(DataKind::Flag, "f2").is_none() {
            assert!(Instant::now() < deadline, "mirror was not rewritten in time");
            std::thread::sleep(Duration::from_millis(10));
        }
        assert!(!store.store_status().unwrap().status().stale);
    }

    #[test]
    fn reads_fall_through_to_persistent_store_until_memory_is_initialized() {
        let backend = Arc::new(MockBackend::default());
        backend.put(
            DataKind::Flag,
            "f1",
            &FlagBuilder::new("f1").version(1).build().into(),
        );
        backend.inited.store(true, Ordering::SeqCst);
        let store = Store::with_persistence(
            Arc::clone(&backend) as Arc<dyn PersistentDataStore>,
            &PersistentStoreConfig::default(),
        )
        .unwrap();

        // Memory is empty; the mirror answers.
        assert!(store.initialized());
        assert!(store.flag("f1").is_some());

        // Once memory holds a basis, it wins.
        full_basis(&store, vec![FlagBuilder::new("f2").version(1).build()]);
        assert!(store.flag("f1").is_none());
        assert!(store.flag("f2").is_some());
    }
}
