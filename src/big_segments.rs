//! Big segments: segments whose membership lists are too large to ship in
//! the flag payload and live in an external store instead.
//!
//! The evaluator never talks to a [`BigSegmentStore`] directly; it goes
//! through [`BigSegmentStoreWrapper`], which caches per-context membership
//! records and tracks backend health on a polling thread.

use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::sync::{mpsc, Arc, RwLock};
use std::thread;
use std::time::Duration;

use base64::prelude::*;
use chrono::Utc;

use crate::broadcast::{Broadcaster, ListenerId};
use crate::error::{Result, StoreError};
use crate::model::Timestamp;
use crate::store::TtlCache;

/// Freshness metadata reported by a big segment store backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BigSegmentStoreMetadata {
    /// When the backend's membership data was last synchronized, if ever.
    pub last_up_to_date: Option<Timestamp>,
}

/// One context's membership across all big segments: segment reference
/// (`"{key}.g{generation}"`) to included (`true`) or excluded (`false`).
/// A reference absent from the map is undetermined and falls through to the
/// segment's rules.
pub type BigSegmentMembership = HashMap<String, bool>;

/// Read access to an external big segment store.
///
/// Implementations are expected to be cheap to query but not free; the
/// wrapper caches membership records per context for a configurable TTL.
pub trait BigSegmentStore: Send + Sync {
    /// Fetch freshness metadata. Called periodically by the wrapper's
    /// polling thread.
    fn metadata(&self) -> std::result::Result<BigSegmentStoreMetadata, StoreError>;

    /// Fetch the membership record for one context, addressed by its
    /// hashed key. `None` means the store has no record for this context.
    fn membership(
        &self,
        context_hash: &str,
    ) -> std::result::Result<Option<BigSegmentMembership>, StoreError>;

    /// Release any resources held by the backend.
    fn stop(&self) {}
}

/// Health of big segment data for a single query, as seen by the evaluator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BigSegmentsStatus {
    /// Membership was fetched and the backend data is fresh.
    Healthy,
    /// Membership was fetched but the backend has not synchronized within
    /// the configured staleness window.
    Stale,
    /// A flag referenced a big segment but no store is configured.
    NotConfigured,
    /// The backend could not be queried.
    StoreError,
}

/// Availability status of the big segment store, for status listeners.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BigSegmentStoreStatus {
    /// Whether the last metadata poll succeeded.
    pub available: bool,
    /// Whether the backend data is older than the staleness window.
    pub stale: bool,
}

/// Tuning for [`BigSegmentStoreWrapper`].
#[derive(Debug, Clone)]
pub struct BigSegmentsConfig {
    /// Maximum number of per-context membership records to cache.
    pub context_cache_capacity: NonZeroUsize,
    /// How long a cached membership record stays valid.
    pub context_cache_ttl: Duration,
    /// How often the backend's metadata is polled for freshness.
    pub status_poll_interval: Duration,
    /// How old the backend data may be before queries report
    /// [`BigSegmentsStatus::Stale`].
    pub stale_after: Duration,
}

impl BigSegmentsConfig {
    pub const DEFAULT_CONTEXT_CACHE_CAPACITY: usize = 1000;
    pub const DEFAULT_CONTEXT_CACHE_TTL: Duration = Duration::from_secs(5);
    pub const DEFAULT_STATUS_POLL_INTERVAL: Duration = Duration::from_secs(5);
    pub const DEFAULT_STALE_AFTER: Duration = Duration::from_secs(120);
}

impl Default for BigSegmentsConfig {
    fn default() -> BigSegmentsConfig {
        BigSegmentsConfig {
            context_cache_capacity: NonZeroUsize::new(
                BigSegmentsConfig::DEFAULT_CONTEXT_CACHE_CAPACITY,
            )
            .expect("default context cache capacity is non-zero"),
            context_cache_ttl: BigSegmentsConfig::DEFAULT_CONTEXT_CACHE_TTL,
            status_poll_interval: BigSegmentsConfig::DEFAULT_STATUS_POLL_INTERVAL,
            stale_after: BigSegmentsConfig::DEFAULT_STALE_AFTER,
        }
    }
}

struct WrapperInner {
    status: RwLock<BigSegmentStoreStatus>,
    broadcaster: Broadcaster<BigSegmentStoreStatus>,
}

/// Caching, health-tracking front for a [`BigSegmentStore`].
///
/// Owned by the evaluator (via the client); queries come in on evaluation
/// threads while a dedicated thread polls backend metadata.
pub struct BigSegmentStoreWrapper {
    store: Arc<dyn BigSegmentStore>,
    cache: TtlCache<String, Arc<BigSegmentMembership>>,
    inner: Arc<WrapperInner>,
    sender: Option<mpsc::SyncSender<()>>,
    join_handle: Option<thread::JoinHandle<()>>,
}

impl BigSegmentStoreWrapper {
    pub fn new(
        store: Arc<dyn BigSegmentStore>,
        config: &BigSegmentsConfig,
    ) -> Result<BigSegmentStoreWrapper> {
        let inner = Arc::new(WrapperInner {
            status: RwLock::new(BigSegmentStoreStatus {
                available: true,
                stale: false,
            }),
            broadcaster: Broadcaster::new()?,
        });

        let (sender, receiver) = mpsc::sync_channel::<()>(1);
        let join_handle = {
            let store = store.clone();
            let inner = inner.clone();
            let stale_after = config.stale_after;
            let poll_interval = config.status_poll_interval;
            thread::Builder::new()
                .name("switchgear-bigseg-poll".to_owned())
                .spawn(move || loop {
                    poll_metadata(store.as_ref(), &inner, stale_after);
                    match receiver.recv_timeout(poll_interval) {
                        // A failed membership query asks for an immediate
                        // re-poll.
                        Ok(()) => continue,
                        Err(mpsc::RecvTimeoutError::Timeout) => continue,
                        // Sender dropped: the wrapper is shutting down.
                        Err(mpsc::RecvTimeoutError::Disconnected) => return,
                    }
                })
                .map_err(crate::Error::from)?
        };

        Ok(BigSegmentStoreWrapper {
            store,
            cache: TtlCache::new(config.context_cache_capacity, Some(config.context_cache_ttl)),
            inner,
            sender: Some(sender),
            join_handle: Some(join_handle),
        })
    }

    /// Membership record and data health for one context key.
    ///
    /// The membership is `Some` whenever it could be determined, even when
    /// the status is [`BigSegmentsStatus::Stale`]; stale data is served and
    /// the staleness is surfaced through the status instead. A failed lookup
    /// also wakes the metadata poll so the outage shows up in the status
    /// without waiting out the poll interval.
    pub fn query(
        &self,
        context_key: &str,
    ) -> (Option<Arc<BigSegmentMembership>>, BigSegmentsStatus) {
        let hash = context_hash(context_key);
        let membership = match self.cache.get(&hash) {
            Some(membership) => membership,
            None => match self.store.membership(&hash) {
                Ok(record) => {
                    let membership = Arc::new(record.unwrap_or_default());
                    self.cache.insert(hash, membership.clone());
                    membership
                }
                Err(err) => {
                    log::warn!(target: "switchgear", error:display = err; "big segment membership query failed");
                    if let Some(sender) = &self.sender {
                        // Full buffer means the poll thread is already being
                        // woken.
                        let _ = sender.try_send(());
                    }
                    return (None, BigSegmentsStatus::StoreError);
                }
            },
        };

        let status = self
            .inner
            .status
            .read()
            .expect("thread holding big segment status lock should not panic");
        let health = if !status.available {
            BigSegmentsStatus::StoreError
        } else if status.stale {
            BigSegmentsStatus::Stale
        } else {
            BigSegmentsStatus::Healthy
        };
        (Some(membership), health)
    }

    /// Availability as of the last metadata poll.
    pub fn status(&self) -> BigSegmentStoreStatus {
        *self
            .inner
            .status
            .read()
            .expect("thread holding big segment status lock should not panic")
    }

    pub fn add_status_listener(
        &self,
        listener: Box<dyn Fn(&BigSegmentStoreStatus) + Send + Sync>,
    ) -> ListenerId {
        self.inner.broadcaster.add_listener(listener)
    }

    pub fn remove_status_listener(&self, id: ListenerId) {
        self.inner.broadcaster.remove_listener(id);
    }
}

impl Drop for BigSegmentStoreWrapper {
    fn drop(&mut self) {
        // Disconnect the poll thread, then wait for it to exit.
        drop(self.sender.take());
        if let Some(handle) = self.join_handle.take() {
            let _ = handle.join();
        }
        self.store.stop();
    }
}

fn poll_metadata(store: &dyn BigSegmentStore, inner: &WrapperInner, stale_after: Duration) {
    let polled = match store.metadata() {
        Ok(metadata) => BigSegmentStoreStatus {
            available: true,
            stale: is_stale(metadata.last_up_to_date, stale_after),
        },
        Err(err) => {
            log::warn!(target: "switchgear", error:display = err; "big segment store metadata poll failed");
            BigSegmentStoreStatus {
                available: false,
                stale: false,
            }
        }
    };

    let changed = {
        let mut status = inner
            .status
            .write()
            .expect("thread holding big segment status lock should not panic");
        let changed = *status != polled;
        *status = polled;
        changed
    };
    if changed {
        log::debug!(
            target: "switchgear",
            available = polled.available,
            stale = polled.stale;
            "big segment store status changed"
        );
        inner.broadcaster.broadcast(polled);
    }
}

fn is_stale(last_up_to_date: Option<Timestamp>, stale_after: Duration) -> bool {
    match last_up_to_date {
        None => true,
        Some(at) => match (Utc::now() - at).to_std() {
            Ok(age) => age > stale_after,
            // Timestamp in the future: clock skew, treat as fresh.
            Err(_) => false,
        },
    }
}

/// Hash of a context key as used to address membership records: the
/// base64-encoded MD5 of the key.
pub(crate) fn context_hash(context_key: &str) -> String {
    BASE64_STANDARD.encode(md5::compute(context_key).0)
}
