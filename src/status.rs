//! Health reporting for the data pipeline.
//!
//! Two surfaces: [`DataSourceStatusProvider`] tracks whether flag data is
//! flowing from the source, [`DataStoreStatusManager`] tracks whether a
//! persistent store backend is reachable. Both let callers read the current
//! status and subscribe to changes.

use std::sync::{mpsc, Arc, RwLock};
use std::time::Duration;

use chrono::Utc;

use crate::broadcast::{Broadcaster, ListenerId};
use crate::model::Timestamp;
use crate::{Error, Result};

/// State of the data synchronization pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataSourceState {
    /// Starting up; no data received yet.
    Initializing,
    /// Data received and current.
    Valid,
    /// An error occurred after data had been received; last known data is
    /// still being served.
    Interrupted,
    /// Permanently stopped.
    Off,
}

impl std::fmt::Display for DataSourceState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            DataSourceState::Initializing => "initializing",
            DataSourceState::Valid => "valid",
            DataSourceState::Interrupted => "interrupted",
            DataSourceState::Off => "off",
        })
    }
}

/// Classifies data source failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataSourceErrorKind {
    Unknown,
    NetworkError,
    /// The source responded with an error status.
    ErrorResponse,
    /// The source delivered data that could not be used.
    InvalidData,
    /// A store rejected the delivered data.
    StoreError,
}

/// Description of the most recent data source failure.
#[derive(Debug, Clone, PartialEq)]
pub struct ErrorInfo {
    pub kind: DataSourceErrorKind,
    /// HTTP-ish status code, when the failure has one.
    pub status_code: Option<u16>,
    pub message: String,
    pub time: Timestamp,
}

impl ErrorInfo {
    pub fn new(kind: DataSourceErrorKind, message: impl Into<String>) -> ErrorInfo {
        ErrorInfo {
            kind,
            status_code: None,
            message: message.into(),
            time: Utc::now(),
        }
    }

    pub fn with_status_code(mut self, status_code: u16) -> ErrorInfo {
        self.status_code = Some(status_code);
        self
    }

    pub(crate) fn from_error(error: &Error) -> ErrorInfo {
        let kind = match error {
            Error::MalformedData { .. } => DataSourceErrorKind::InvalidData,
            Error::Store(_) => DataSourceErrorKind::StoreError,
            Error::Network(_) => DataSourceErrorKind::NetworkError,
            _ => DataSourceErrorKind::Unknown,
        };
        ErrorInfo::new(kind, error.to_string())
    }
}

/// Current status of the data source.
#[derive(Debug, Clone, PartialEq)]
pub struct DataSourceStatus {
    pub state: DataSourceState,
    /// When the pipeline entered `state`. Advances only on state changes,
    /// not on repeated errors within one state.
    pub state_since: Timestamp,
    pub last_error: Option<ErrorInfo>,
}

/// Readable, subscribable data source status.
pub struct DataSourceStatusProvider {
    status: RwLock<DataSourceStatus>,
    broadcaster: Broadcaster<DataSourceStatus>,
}

impl DataSourceStatusProvider {
    pub(crate) fn new() -> Result<DataSourceStatusProvider> {
        Ok(DataSourceStatusProvider {
            status: RwLock::new(DataSourceStatus {
                state: DataSourceState::Initializing,
                state_since: Utc::now(),
                last_error: None,
            }),
            broadcaster: Broadcaster::new()?,
        })
    }

    pub fn status(&self) -> DataSourceStatus {
        self.status
            .read()
            .expect("thread holding status lock should not panic")
            .clone()
    }

    pub fn add_listener(
        &self,
        listener: Box<dyn Fn(&DataSourceStatus) + Send + Sync>,
    ) -> ListenerId {
        self.broadcaster.add_listener(listener)
    }

    pub fn remove_listener(&self, id: ListenerId) {
        self.broadcaster.remove_listener(id)
    }

    /// Record a state transition and/or error, applying the transition
    /// rules:
    /// - `Interrupted` before any data has arrived stays `Initializing`;
    /// - `Initializing` cannot be re-entered once left;
    /// - `Off` is terminal;
    /// - updates changing neither state nor error are suppressed.
    pub(crate) fn update(&self, state: DataSourceState, error: Option<ErrorInfo>) {
        let broadcast_status = {
            let mut status = self
                .status
                .write()
                .expect("thread holding status lock should not panic");
            if status.state == DataSourceState::Off {
                return;
            }
            let effective = match state {
                DataSourceState::Interrupted
                    if status.state == DataSourceState::Initializing =>
                {
                    DataSourceState::Initializing
                }
                DataSourceState::Initializing
                    if status.state != DataSourceState::Initializing =>
                {
                    status.state
                }
                other => other,
            };
            let state_changed = effective != status.state;
            let has_error = error.is_some();
            if let Some(error) = error {
                status.last_error = Some(error);
            }
            if state_changed {
                status.state = effective;
                status.state_since = Utc::now();
                log::debug!(target: "switchgear", state:display = effective; "data source state changed");
            }
            if !state_changed && !has_error {
                return;
            }
            status.clone()
        };
        self.broadcaster.broadcast(broadcast_status);
    }
}

/// Current status of the persistent store backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DataStoreStatus {
    pub available: bool,
    /// Set on recovery when readers may have been served stale data during
    /// the outage. An infinite cache keeps serving current data, so it
    /// recovers with `stale` unset.
    pub stale: bool,
}

/// Tracks persistent store availability.
///
/// When a backend operation fails, the adapter reports it here; a monitor
/// thread then probes the backend until it answers again and broadcasts the
/// recovery.
pub struct DataStoreStatusManager {
    inner: Arc<StoreStatusInner>,
    // Taking the sender disconnects the monitor thread, stopping it.
    sender: Option<mpsc::SyncSender<()>>,
    join_handle: Option<std::thread::JoinHandle<()>>,
}

struct StoreStatusInner {
    status: RwLock<DataStoreStatus>,
    broadcaster: Broadcaster<DataStoreStatus>,
}

impl DataStoreStatusManager {
    /// `probe` is called from the monitor thread to ask the backend whether
    /// it is reachable. `refresh_on_recovery` marks recoveries as stale,
    /// meaning readers may have seen outdated data during the outage.
    pub(crate) fn new(
        probe: Arc<dyn Fn() -> bool + Send + Sync>,
        refresh_on_recovery: bool,
        poll_interval: Duration,
    ) -> Result<DataStoreStatusManager> {
        let inner = Arc::new(StoreStatusInner {
            status: RwLock::new(DataStoreStatus {
                available: true,
                stale: false,
            }),
            broadcaster: Broadcaster::new()?,
        });
        let (sender, receiver) = mpsc::sync_channel::<()>(1);

        let join_handle = {
            let inner = Arc::clone(&inner);
            std::thread::Builder::new()
                .name("switchgear-store-monitor".to_owned())
                .spawn(move || loop {
                    // Sleep until an outage is reported (or the manager is
                    // dropped and the channel disconnects).
                    if receiver.recv().is_err() {
                        return;
                    }
                    loop {
                        match receiver.recv_timeout(poll_interval) {
                            // Redundant outage reports while already probing.
                            Ok(()) => continue,
                            Err(mpsc::RecvTimeoutError::Disconnected) => return,
                            Err(mpsc::RecvTimeoutError::Timeout) => {}
                        }
                        if probe() {
                            let recovered = DataStoreStatus {
                                available: true,
                                stale: refresh_on_recovery,
                            };
                            *inner
                                .status
                                .write()
                                .expect("thread holding status lock should not panic") = recovered;
                            log::info!(target: "switchgear", "persistent store is available again");
                            inner.broadcaster.broadcast(recovered);
                            break;
                        }
                    }
                })?
        };

        Ok(DataStoreStatusManager {
            inner,
            sender: Some(sender),
            join_handle: Some(join_handle),
        })
    }

    pub fn status(&self) -> DataStoreStatus {
        *self
            .inner
            .status
            .read()
            .expect("thread holding status lock should not panic")
    }

    pub fn add_listener(&self, listener: Box<dyn Fn(&DataStoreStatus) + Send + Sync>) -> ListenerId {
        self.inner.broadcaster.add_listener(listener)
    }

    pub fn remove_listener(&self, id: ListenerId) {
        self.inner.broadcaster.remove_listener(id)
    }

    /// Called by the adapter when a backend operation fails. Starts probing
    /// for recovery; repeated reports while already unavailable are no-ops.
    pub(crate) fn record_unavailable(&self) {
        {
            let mut status = self
                .inner
                .status
                .write()
                .expect("thread holding status lock should not panic");
            if !status.available {
                return;
            }
            *status = DataStoreStatus {
                available: false,
                stale: false,
            };
        }
        log::warn!(target: "switchgear", "persistent store is unavailable");
        self.inner.broadcaster.broadcast(DataStoreStatus {
            available: false,
            stale: false,
        });
        if let Some(sender) = &self.sender {
            // Full buffer means the monitor is already being woken.
            let _ = sender.try_send(());
        }
    }

    /// Called after the backend has been rewritten from memory following a
    /// recovery.
    pub(crate) fn record_refreshed(&self) {
        let mut status = self
            .inner
            .status
            .write()
            .expect("thread holding status lock should not panic");
        status.stale = false;
    }
}

impl Drop for DataStoreStatusManager {
    fn drop(&mut self) {
        drop(self.sender.take());
        if let Some(handle) = self.join_handle.take() {
            let _ = handle.join();
        }
    }
}
