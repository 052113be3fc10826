use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crate::changeset::Change;
use crate::error::StoreError;
use crate::model::{DataKind, Flag, Segment, StoreItem};
use crate::status::DataStoreStatusManager;
use crate::store::{ReadStore, TtlCache};
use crate::{Error, Result};

/// Wire form of a stored item, as persistent backends see it.
///
/// `version` and `deleted` are duplicated outside the JSON so backends can
/// implement version-gated writes without parsing flag data.
#[derive(Debug, Clone, PartialEq)]
pub struct SerializedItem {
    pub version: u64,
    pub deleted: bool,
    pub json: String,
}

impl SerializedItem {
    pub fn from_item(key: &str, item: &StoreItem) -> Result<SerializedItem> {
        let json = match item {
            StoreItem::Flag(flag) => serde_json::to_string(flag)
                .map_err(|err| Error::malformed_data(DataKind::Flag, Some(key), err.to_string()))?,
            StoreItem::Segment(segment) => serde_json::to_string(segment).map_err(|err| {
                Error::malformed_data(DataKind::Segment, Some(key), err.to_string())
            })?,
            StoreItem::Tombstone(version) => {
                serde_json::json!({"key": key, "version": version, "deleted": true}).to_string()
            }
        };
        Ok(SerializedItem {
            version: item.version(),
            deleted: item.is_tombstone(),
            json,
        })
    }

    pub fn to_item(&self, kind: DataKind, key: &str) -> Result<StoreItem> {
        if self.deleted {
            return Ok(StoreItem::Tombstone(self.version));
        }
        let item = match kind {
            DataKind::Flag => serde_json::from_str::<Flag>(&self.json)
                .map(|flag| StoreItem::Flag(Arc::new(flag))),
            DataKind::Segment => serde_json::from_str::<Segment>(&self.json)
                .map(|segment| StoreItem::Segment(Arc::new(segment))),
        };
        item.map_err(|err| Error::malformed_data(kind, Some(key), err.to_string()))
    }
}

/// A database-backed store for flag and segment data.
///
/// Implementations are expected to keep one record per
/// `(prefix, kind.namespace(), key)` plus a single per-prefix marker
/// recording that [`PersistentDataStore::init`] has ever completed, so
/// multiple SDK instances can share one database.
///
/// All operations must be safe to call from multiple threads.
pub trait PersistentDataStore: Send + Sync {
    /// Atomically replace all stored data with the given data set and set
    /// the initialized marker.
    fn init(
        &self,
        data: &[(DataKind, Vec<(String, SerializedItem)>)],
    ) -> std::result::Result<(), StoreError>;

    fn get(&self, kind: DataKind, key: &str)
        -> std::result::Result<Option<SerializedItem>, StoreError>;

    fn all(&self, kind: DataKind) -> std::result::Result<Vec<(String, SerializedItem)>, StoreError>;

    /// Version-gated write: store `item` unless the existing record's
    /// version is greater or equal, atomically, and return whichever item is
    /// now authoritative.
    fn upsert(
        &self,
        kind: DataKind,
        key: &str,
        item: SerializedItem,
    ) -> std::result::Result<SerializedItem, StoreError>;

    /// Whether the initialized marker is set (possibly by another SDK
    /// instance).
    fn initialized(&self) -> std::result::Result<bool, StoreError>;

    /// Availability probe used while recovering from an outage. The default
    /// asks for the initialized marker and treats any answer as healthy.
    fn available(&self) -> bool {
        self.initialized().is_ok()
    }

    fn stop(&self) {}
}

/// Read caching mode for [`PersistentStoreAdapter`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreCacheTtl {
    /// No caching; every read goes to the backend.
    Off,
    /// Cache reads for the given duration.
    Ttl(Duration),
    /// Cache reads forever. The cache then holds a full replica, and a
    /// backend outage can be ridden out without serving stale-then-fresh
    /// flip-flops.
    Infinite,
}

impl StoreCacheTtl {
    pub const DEFAULT: StoreCacheTtl = StoreCacheTtl::Ttl(Duration::from_secs(15));

    fn expiry(self) -> Option<Duration> {
        match self {
            StoreCacheTtl::Off => None,
            StoreCacheTtl::Ttl(ttl) => Some(ttl),
            StoreCacheTtl::Infinite => None,
        }
    }
}

impl Default for StoreCacheTtl {
    fn default() -> StoreCacheTtl {
        StoreCacheTtl::DEFAULT
    }
}

/// Configuration for [`PersistentStoreAdapter`].
#[derive(Debug, Clone)]
pub struct PersistentStoreConfig {
    pub cache_ttl: StoreCacheTtl,
    /// Bound on cached point reads. The all-items cache holds one entry per
    /// data kind regardless.
    pub cache_capacity: NonZeroUsize,
    /// How often to probe an unavailable backend for recovery.
    pub status_poll_interval: Duration,
}

impl PersistentStoreConfig {
    pub const DEFAULT_CACHE_CAPACITY: usize = 10_000;
    pub const DEFAULT_STATUS_POLL_INTERVAL: Duration = Duration::from_millis(500);
}

impl Default for PersistentStoreConfig {
    fn default() -> PersistentStoreConfig {
        PersistentStoreConfig {
            cache_ttl: StoreCacheTtl::default(),
            cache_capacity: NonZeroUsize::new(PersistentStoreConfig::DEFAULT_CACHE_CAPACITY)
                .expect("default cache capacity is non-zero"),
            status_poll_interval: PersistentStoreConfig::DEFAULT_STATUS_POLL_INTERVAL,
        }
    }
}

/// [`ReadStore`] over a [`PersistentDataStore`] backend, adding read
/// caching (including negative caching), a sticky initialized check, and
/// failure reporting to the store status manager.
///
/// Backend read errors surface as missing data, never as panics; writes
/// return errors to the caller.
pub struct PersistentStoreAdapter {
    backend: Arc<dyn PersistentDataStore>,
    item_cache: Option<TtlCache<(DataKind, String), Option<StoreItem>>>,
    all_cache: Option<TtlCache<DataKind, Arc<HashMap<String, StoreItem>>>>,
    initialized: AtomicBool,
    last_init_check: Mutex<Option<Instant>>,
    status: Option<Arc<DataStoreStatusManager>>,
}

impl PersistentStoreAdapter {
    /// How often an uninitialized backend is re-asked for its marker.
    const INIT_CHECK_INTERVAL: Duration = Duration::from_millis(500);

    pub fn new(
        backend: Arc<dyn PersistentDataStore>,
        config: &PersistentStoreConfig,
        status: Option<Arc<DataStoreStatusManager>>,
    ) -> PersistentStoreAdapter {
        let (item_cache, all_cache) = match config.cache_ttl {
            StoreCacheTtl::Off => (None, None),
            mode => (
                Some(TtlCache::new(config.cache_capacity, mode.expiry())),
                Some(TtlCache::new(
                    NonZeroUsize::new(2).expect("two data kinds"),
                    mode.expiry(),
                )),
            ),
        };
        PersistentStoreAdapter {
            backend,
            item_cache,
            all_cache,
            initialized: AtomicBool::new(false),
            last_init_check: Mutex::new(None),
            status,
        }
    }

    /// Report backend failures to the status manager on the way through.
    fn guard<T>(
        &self,
        result: std::result::Result<T, StoreError>,
    ) -> std::result::Result<T, StoreError> {
        if result.is_err() {
            if let Some(status) = &self.status {
                status.record_unavailable();
            }
        }
        result
    }

    /// Write a full data set through to the backend. The read caches are
    /// refreshed only once the backend accepts the data; a failed init
    /// leaves them untouched so reads never serve items the backend
    /// rejected.
    pub(crate) fn init_full(
        &self,
        data: &[(DataKind, Vec<(String, StoreItem)>)],
    ) -> std::result::Result<(), StoreError> {
        let mut serialized: Vec<(DataKind, Vec<(String, SerializedItem)>)> = Vec::new();
        for (kind, items) in data {
            let mut entries = Vec::with_capacity(items.len());
            for (key, item) in items {
                let entry = SerializedItem::from_item(key, item)
                    .map_err(|err| StoreError::InvalidData(err.to_string()))?;
                entries.push((key.clone(), entry));
            }
            serialized.push((*kind, entries));
        }

        self.guard(self.backend.init(&serialized))?;

        if let Some(cache) = &self.item_cache {
            cache.clear();
            for (kind, items) in data {
                for (key, item) in items {
                    let live = (!item.is_tombstone()).then(|| item.clone());
                    cache.insert((*kind, key.clone()), live);
                }
            }
        }
        if let Some(cache) = &self.all_cache {
            for (kind, items) in data {
                let live: HashMap<String, StoreItem> = items
                    .iter()
                    .filter(|(_, item)| !item.is_tombstone())
                    .map(|(key, item)| (key.clone(), item.clone()))
                    .collect();
                cache.insert(*kind, Arc::new(live));
            }
        }

        self.initialized.store(true, Ordering::Release);
        Ok(())
    }

    /// Write a delta through to the backend. Stops at the first backend
    /// error; the caller re-syncs via [`PersistentStoreAdapter::init_full`]
    /// once the backend recovers.
    pub(crate) fn apply_changes(&self, changes: &[Change]) -> std::result::Result<(), StoreError> {
        for change in changes {
            let (kind, key, item) = change.as_entry();
            let serialized = SerializedItem::from_item(key, &item)
                .map_err(|err| StoreError::InvalidData(err.to_string()))?;
            let stored = self.guard(self.backend.upsert(kind, key, serialized))?;

            // The backend may have kept a newer item; its answer is
            // authoritative for the caches.
            if let Some(cache) = &self.item_cache {
                let live = match stored.to_item(kind, key) {
                    Ok(item) => (!item.is_tombstone()).then_some(item),
                    Err(err) => {
                        log::error!(target: "switchgear", error:display = err, key; "dropping malformed item returned by persistent store");
                        None
                    }
                };
                cache.insert((kind, key.to_owned()), live);
            }
            if let Some(cache) = &self.all_cache {
                cache.remove(&kind);
            }
        }
        Ok(())
    }

    pub(crate) fn stop(&self) {
        self.backend.stop();
    }
}

impl ReadStore for PersistentStoreAdapter {
    fn get(&self, kind: DataKind, key: &str) -> Option<StoreItem> {
        let cache_key = (kind, key.to_owned());
        if let Some(cache) = &self.item_cache {
            if let Some(cached) = cache.get(&cache_key) {
                return cached;
            }
        }

        let fetched = match self.guard(self.backend.get(kind, key)) {
            Ok(fetched) => fetched,
            Err(err) => {
                log::warn!(target: "switchgear", error:display = err, key; "persistent store read failed");
                return None;
            }
        };
        let item = fetched.and_then(|serialized| match serialized.to_item(kind, key) {
            Ok(item) => (!item.is_tombstone()).then_some(item),
            Err(err) => {
                log::error!(target: "switchgear", error:display = err, key; "dropping malformed item from persistent store");
                None
            }
        });

        if let Some(cache) = &self.item_cache {
            cache.insert(cache_key, item.clone());
        }
        item
    }

    fn all(&self, kind: DataKind) -> HashMap<String, StoreItem> {
        if let Some(cache) = &self.all_cache {
            if let Some(cached) = cache.get(&kind) {
                return cached.as_ref().clone();
            }
        }

        let fetched = match self.guard(self.backend.all(kind)) {
            Ok(fetched) => fetched,
            Err(err) => {
                log::warn!(target: "switchgear", error:display = err; "persistent store read failed");
                return HashMap::new();
            }
        };
        let mut items = HashMap::with_capacity(fetched.len());
        for (key, serialized) in fetched {
            match serialized.to_item(kind, &key) {
                Ok(item) if !item.is_tombstone() => {
                    items.insert(key, item);
                }
                Ok(_) => {}
                Err(err) => {
                    log::error!(target: "switchgear", error:display = err, key; "dropping malformed item from persistent store");
                }
            }
        }

        if let Some(cache) = &self.all_cache {
            cache.insert(kind, Arc::new(items.clone()));
        }
        items
    }

    fn initialized(&self) -> bool {
        if self.initialized.load(Ordering::Acquire) {
            return true;
        }
        {
            // An uninitialized backend is polled at a bounded rate; callers
            // hit this on every evaluation until data arrives.
            let mut last_check = self
                .last_init_check
                .lock()
                .expect("thread holding init-check lock should not panic");
            if last_check.is_some_and(|at| at.elapsed() < PersistentStoreAdapter::INIT_CHECK_INTERVAL)
            {
                return false;
            }
            *last_check = Some(Instant::now());
        }
        match self.guard(self.backend.initialized()) {
            Ok(true) => {
                self.initialized.store(true, Ordering::Release);
                true
            }
            Ok(false) => false,
            Err(err) => {
                log::warn!(target: "switchgear", error:display = err; "persistent store initialized check failed");
                false
            }
        }
    }
}
