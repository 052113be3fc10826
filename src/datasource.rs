//! Data sources and the background thread that runs them.
//!
//! Flag data enters the SDK through two collaborator traits: an
//! [`Initializer`] fetches one basis to start from, a [`Synchronizer`]
//! streams updates for as long as it runs. [`DataSystem`] owns both, applies
//! whatever they produce through the [`Store`](crate::store::Store)
//! coordinator, and reports pipeline health through a
//! [`DataSourceStatusProvider`].

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use crate::changeset::{ChangeSet, Selector};
use crate::status::{DataSourceErrorKind, DataSourceState, DataSourceStatusProvider, ErrorInfo};
use crate::store::Store;
use crate::{Error, Result};

/// The payload of a successful [`Initializer`] fetch.
#[derive(Debug, Clone)]
pub struct Basis {
    pub change_set: ChangeSet,
    /// Whether the basis should be written through to the persistent store.
    /// A source replaying from a local cache sets this to `false` so it does
    /// not overwrite fresher persisted data.
    pub persist: bool,
    /// Environment the data belongs to, when the source knows it.
    pub environment_id: Option<String>,
}

/// A one-shot source of initial flag data.
pub trait Initializer: Send {
    fn name(&self) -> &str;

    /// Fetch a complete basis. Called at most once per attempt; the data
    /// system moves on to the next initializer on error.
    ///
    /// `resume_from` is the selector of the data already in the store, if
    /// any. Sources that support it may fetch only what changed since then.
    fn fetch(&mut self, resume_from: Option<&Selector>) -> Result<Basis>;
}

/// One message from a running [`Synchronizer`].
#[derive(Debug, Clone)]
pub struct Update {
    pub state: DataSourceState,
    pub change_set: Option<ChangeSet>,
    pub error: Option<ErrorInfo>,
}

/// Receives [`Update`]s from a running synchronizer.
pub trait UpdateSink: Send + Sync {
    fn apply(&self, update: &Update);
}

/// An ongoing source of flag data updates.
///
/// `sync` runs until the source fails permanently or `stop` fires.
/// Implementations must return promptly once stopped; poll-style sources
/// should sleep via [`StopToken::wait_timeout`] so they wake immediately
/// instead of waiting out their interval.
pub trait Synchronizer: Send {
    fn name(&self) -> &str;

    /// `resume_from` is the selector of the data already in the store, so a
    /// reconnecting source can pick up where the stored data left off.
    fn sync(
        &mut self,
        resume_from: Option<Selector>,
        sink: Arc<dyn UpdateSink>,
        stop: StopToken,
    ) -> Result<()>;
}

/// Cooperative cancellation flag shared between [`DataSystem`] and a running
/// synchronizer.
#[derive(Clone)]
pub struct StopToken {
    inner: Arc<(Mutex<bool>, Condvar)>,
}

impl StopToken {
    fn new() -> StopToken {
        StopToken {
            inner: Arc::new((Mutex::new(false), Condvar::new())),
        }
    }

    /// True once [`DataSystem::stop`] has been called.
    pub fn is_stopped(&self) -> bool {
        *self
            .inner
            .0
            .lock()
            .expect("thread holding stop lock should not panic")
    }

    /// Block for up to `timeout`, waking early if the token is stopped.
    /// Returns whether the token is stopped.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let guard = self
            .inner
            .0
            .lock()
            .expect("thread holding stop lock should not panic");
        let (guard, _) = self
            .inner
            .1
            .wait_timeout_while(guard, timeout, |stopped| !*stopped)
            .expect("thread holding stop lock should not panic");
        *guard
    }

    fn stop(&self) {
        let mut stopped = self
            .inner
            .0
            .lock()
            .expect("thread holding stop lock should not panic");
        *stopped = true;
        self.inner.1.notify_all();
    }
}

/// Data sources for a [`DataSystem`]: initializers are tried in order until
/// one produces a basis, then the synchronizer (if any) runs until stopped.
#[derive(Default)]
pub struct DataSystemConfig {
    pub initializers: Vec<Box<dyn Initializer>>,
    pub synchronizer: Option<Box<dyn Synchronizer>>,
}

/// Resolves at most once; later calls keep the first result.
type ReadyLatch = (Mutex<Option<Result<()>>>, Condvar);

fn resolve(latch: &ReadyLatch, value: Result<()>) {
    let mut slot = latch
        .0
        .lock()
        .expect("thread holding readiness lock should not panic");
    if slot.is_none() {
        *slot = Some(value);
        latch.1.notify_all();
    }
}

/// Runs the configured data sources on a background thread and applies their
/// output through the store coordinator.
pub struct DataSystem {
    join_handle: std::thread::JoinHandle<()>,
    stop: StopToken,
    status: Arc<DataSourceStatusProvider>,

    /// Holds `None` until the first basis lands. Holds `Some(Ok(()))` once
    /// flag data has been applied. Holds `Some(Err(...))` if the sources
    /// failed before delivering any data.
    result: Arc<ReadyLatch>,
}

impl DataSystem {
    /// Spawn the data system thread.
    ///
    /// # Errors
    ///
    /// Returns an IO error if the thread failed to start.
    pub fn start(store: Arc<Store>, config: DataSystemConfig) -> Result<DataSystem> {
        let status = Arc::new(DataSourceStatusProvider::new()?);
        let result: Arc<ReadyLatch> = Arc::new((Mutex::new(None), Condvar::new()));
        let stop = StopToken::new();

        let join_handle = {
            let status = Arc::clone(&status);
            let ready = Arc::clone(&result);
            let stop = stop.clone();
            std::thread::Builder::new()
                .name("switchgear-datasystem".to_owned())
                .spawn(move || {
                    let outcome = catch_unwind(AssertUnwindSafe(|| {
                        run(store, config, &status, &ready, stop);
                    }));
                    if outcome.is_err() {
                        status.update(
                            DataSourceState::Off,
                            Some(ErrorInfo::new(
                                DataSourceErrorKind::Unknown,
                                "data system thread panicked",
                            )),
                        );
                        resolve(&ready, Err(Error::DataSystemPanicked));
                    }
                })?
        };

        Ok(DataSystem {
            join_handle,
            stop,
            status,
            result,
        })
    }

    /// Pipeline health: current state plus change subscription.
    pub fn status_provider(&self) -> &Arc<DataSourceStatusProvider> {
        &self.status
    }

    /// Block until the first flag data basis has been applied.
    ///
    /// # Errors
    ///
    /// Returns the source error if every configured source failed before
    /// delivering data, or [`Error::DataSystemPanicked`] if the background
    /// thread panicked.
    pub fn wait_for_initialization(&self) -> Result<()> {
        let mut lock = self
            .result
            .0
            .lock()
            .map_err(|_| Error::DataSystemPanicked)?;
        loop {
            match &*lock {
                Some(result) => return result.clone(),
                None => {
                    lock = self
                        .result
                        .1
                        .wait(lock)
                        .map_err(|_| Error::DataSystemPanicked)?;
                }
            }
        }
    }

    /// Signal the background thread to stop without waiting for it to exit.
    ///
    /// Idempotent; a running synchronizer wakes from any
    /// [`StopToken::wait_timeout`] sleep immediately.
    pub fn stop(&self) {
        self.stop.stop();
    }

    /// Stop the background thread and block waiting for it to exit.
    ///
    /// # Errors
    ///
    /// Returns [`Error::DataSystemPanicked`] if the thread panicked.
    pub fn shutdown(self) -> Result<()> {
        self.stop();
        self.join_handle
            .join()
            .map_err(|_| Error::DataSystemPanicked)?;
        Ok(())
    }
}

fn run(
    store: Arc<Store>,
    config: DataSystemConfig,
    status: &Arc<DataSourceStatusProvider>,
    ready: &Arc<ReadyLatch>,
    stop: StopToken,
) {
    let mut initialized = false;
    let mut last_error = None;

    for mut initializer in config.initializers {
        if stop.is_stopped() {
            break;
        }
        log::debug!(target: "switchgear", initializer = initializer.name(); "fetching initial flag data");
        let applied = initializer.fetch(store.selector().as_ref()).and_then(|basis| {
            if let Some(environment_id) = &basis.environment_id {
                log::debug!(target: "switchgear", environment_id; "data source identified the environment");
            }
            store.apply(&basis.change_set, basis.persist)
        });
        match applied {
            Ok(()) => {
                status.update(DataSourceState::Valid, None);
                resolve(ready, Ok(()));
                initialized = true;
                break;
            }
            Err(err) => {
                log::warn!(
                    target: "switchgear",
                    initializer = initializer.name(),
                    error:display = err;
                    "initializer failed"
                );
                status.update(
                    DataSourceState::Interrupted,
                    Some(ErrorInfo::from_error(&err)),
                );
                last_error = Some(err);
            }
        }
    }

    let Some(mut synchronizer) = config.synchronizer else {
        if !initialized && !stop.is_stopped() {
            let err = last_error.unwrap_or_else(|| {
                Error::InvalidConfiguration("no data sources configured".to_owned())
            });
            status.update(DataSourceState::Off, None);
            resolve(ready, Err(err));
        }
        return;
    };
    if stop.is_stopped() {
        return;
    }

    let resume_from = store.selector();
    let sink = Arc::new(StoreSink {
        store,
        status: Arc::clone(status),
        ready: Arc::clone(ready),
    });
    log::debug!(target: "switchgear", synchronizer = synchronizer.name(); "starting synchronizer");
    match synchronizer.sync(resume_from, sink, stop) {
        Ok(()) => {
            status.update(DataSourceState::Off, None);
        }
        Err(err) => {
            log::warn!(
                target: "switchgear",
                synchronizer = synchronizer.name(),
                error:display = err;
                "synchronizer failed"
            );
            status.update(DataSourceState::Off, Some(ErrorInfo::from_error(&err)));
            resolve(ready, Err(err));
        }
    }
}

/// The [`UpdateSink`] handed to synchronizers: change sets go through the
/// store coordinator, states and errors through the status provider.
struct StoreSink {
    store: Arc<Store>,
    status: Arc<DataSourceStatusProvider>,
    ready: Arc<ReadyLatch>,
}

impl UpdateSink for StoreSink {
    fn apply(&self, update: &Update) {
        let mut state = update.state;
        let mut error = update.error.clone();
        if let Some(change_set) = &update.change_set {
            match self.store.apply(change_set, true) {
                Ok(()) => resolve(&self.ready, Ok(())),
                Err(err) => {
                    log::warn!(target: "switchgear", error:display = err; "failed to apply a flag data update");
                    state = DataSourceState::Interrupted;
                    error = Some(ErrorInfo::from_error(&err));
                }
            }
        }
        self.status.update(state, error);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::changeset::ChangeSetBuilder;
    use crate::model::{DataKind, Flag};
    use crate::store::ReadStore;
    use crate::test_util::FlagBuilder;
    use std::sync::mpsc;
    use std::time::Instant;

    fn basis_with(flags: Vec<Flag>) -> Basis {
        let mut builder = ChangeSetBuilder::start_full(None);
        for flag in flags {
            let key = flag.key.clone();
            builder.add_put(DataKind::Flag, key, flag);
        }
        Basis {
            change_set: builder.finish(),
            persist: true,
            environment_id: None,
        }
    }

    /// Serves its basis once; any later fetch fails like a dead network.
    struct TestInitializer {
        basis: Option<Basis>,
    }

    impl TestInitializer {
        fn serving(basis: Basis) -> Box<TestInitializer> {
            Box::new(TestInitializer { basis: Some(basis) })
        }

        fn failing() -> Box<TestInitializer> {
            Box::new(TestInitializer { basis: None })
        }
    }

    impl Initializer for TestInitializer {
        fn name(&self) -> &str {
            "test-initializer"
        }

        fn fetch(&mut self, _resume_from: Option<&Selector>) -> Result<Basis> {
            self.basis
                .take()
                .ok_or_else(|| Error::Network("connection refused".to_owned()))
        }
    }

    /// Pushes its queued updates, then sleeps until stopped.
    struct TestSynchronizer {
        updates: Vec<Update>,
        resume_tx: Option<mpsc::Sender<Option<Selector>>>,
    }

    impl Synchronizer for TestSynchronizer {
        fn name(&self) -> &str {
            "test-synchronizer"
        }

        fn sync(
            &mut self,
            resume_from: Option<Selector>,
            sink: Arc<dyn UpdateSink>,
            stop: StopToken,
        ) -> Result<()> {
            if let Some(tx) = &self.resume_tx {
                let _ = tx.send(resume_from);
            }
            for update in self.updates.drain(..) {
                sink.apply(&update);
            }
            while !stop.wait_timeout(Duration::from_secs(3600)) {}
            Ok(())
        }
    }

    #[test]
    fn initializer_basis_reaches_the_store() {
        let store = Store::new().unwrap();
        let system = DataSystem::start(
            Arc::clone(&store),
            DataSystemConfig {
                initializers: vec![TestInitializer::serving(basis_with(vec![
                    FlagBuilder::new("f").build(),
                ]))],
                synchronizer: None,
            },
        )
        .unwrap();

        system.wait_for_initialization().unwrap();
        assert!(store.flag("f").is_some());
        assert_eq!(
            system.status_provider().status().state,
            DataSourceState::Valid
        );
        system.shutdown().unwrap();
    }

    #[test]
    fn initializers_are_tried_in_order() {
        let _ = env_logger::builder().is_test(true).try_init();
        let store = Store::new().unwrap();
        let system = DataSystem::start(
            Arc::clone(&store),
            DataSystemConfig {
                initializers: vec![
                    TestInitializer::failing(),
                    TestInitializer::serving(basis_with(vec![FlagBuilder::new("f").build()])),
                ],
                synchronizer: None,
            },
        )
        .unwrap();

        system.wait_for_initialization().unwrap();
        assert!(store.flag("f").is_some());
        let status = system.status_provider().status();
        assert_eq!(status.state, DataSourceState::Valid);
        // The first initializer's failure is retained for diagnostics.
        assert_eq!(
            status.last_error.unwrap().kind,
            DataSourceErrorKind::NetworkError
        );
        system.shutdown().unwrap();
    }

    #[test]
    fn failure_without_synchronizer_switches_off() {
        let store = Store::new().unwrap();
        let system = DataSystem::start(
            Arc::clone(&store),
            DataSystemConfig {
                initializers: vec![TestInitializer::failing()],
                synchronizer: None,
            },
        )
        .unwrap();

        assert!(matches!(
            system.wait_for_initialization(),
            Err(Error::Network(_))
        ));
        assert!(!store.initialized());
        assert_eq!(
            system.status_provider().status().state,
            DataSourceState::Off
        );
        system.shutdown().unwrap();
    }

    #[test]
    fn synchronizer_updates_flow_through() {
        let store = Store::new().unwrap();
        let update = Update {
            state: DataSourceState::Valid,
            change_set: Some(basis_with(vec![FlagBuilder::new("f").build()]).change_set),
            error: None,
        };
        let system = DataSystem::start(
            Arc::clone(&store),
            DataSystemConfig {
                initializers: vec![],
                synchronizer: Some(Box::new(TestSynchronizer {
                    updates: vec![update],
                    resume_tx: None,
                })),
            },
        )
        .unwrap();

        system.wait_for_initialization().unwrap();
        assert!(store.flag("f").is_some());
        assert_eq!(
            system.status_provider().status().state,
            DataSourceState::Valid
        );
        system.shutdown().unwrap();
    }

    #[test]
    fn synchronizer_receives_the_selector_of_the_applied_basis() {
        let store = Store::new().unwrap();
        let mut builder = ChangeSetBuilder::start_full(Some(Selector::new("basis-1")));
        builder.add_put(DataKind::Flag, "f", FlagBuilder::new("f").build());
        let basis = Basis {
            change_set: builder.finish(),
            persist: true,
            environment_id: None,
        };

        let (resume_tx, resume_rx) = mpsc::channel();
        let system = DataSystem::start(
            store,
            DataSystemConfig {
                initializers: vec![TestInitializer::serving(basis)],
                synchronizer: Some(Box::new(TestSynchronizer {
                    updates: vec![],
                    resume_tx: Some(resume_tx),
                })),
            },
        )
        .unwrap();

        system.wait_for_initialization().unwrap();
        assert_eq!(
            resume_rx.recv_timeout(Duration::from_secs(1)).unwrap(),
            Some(Selector::new("basis-1"))
        );
        system.shutdown().unwrap();
    }

    #[test]
    fn stop_wakes_a_sleeping_synchronizer_promptly() {
        let store = Store::new().unwrap();
        let system = DataSystem::start(
            store,
            DataSystemConfig {
                initializers: vec![],
                synchronizer: Some(Box::new(TestSynchronizer {
                    updates: vec![],
                    resume_tx: None,
                })),
            },
        )
        .unwrap();

        let started = Instant::now();
        system.stop();
        // A second stop is a no-op.
        system.stop();
        system.shutdown().unwrap();
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn stop_token_wait_reports_stopped() {
        let token = StopToken::new();
        assert!(!token.is_stopped());
        assert!(!token.wait_timeout(Duration::from_millis(1)));

        token.stop();
        assert!(token.is_stopped());
        assert!(token.wait_timeout(Duration::from_secs(3600)));
    }
}
