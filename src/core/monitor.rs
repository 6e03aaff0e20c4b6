//! Polling engine shared by the reader and card monitors.
//!
//! A [`DeviceMonitor`] owns one backend context, the last status snapshot,
//! the inventory of its kind and one polling thread per registered observer.
//! Every clone of a monitor handle shares that state, so all observers of a
//! kind see the same inventory and each change is reported once.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use pcsc::State;

use crate::core::backend::{BackendContext, DeviceStatusBackend, ReaderState};
use crate::core::error::{Result, SmartcardError};
use crate::core::observable::{same_observer, ObservableRegistry, Observer};
use crate::core::pcsc_backend::PcscBackend;

/// Polling timeout used when the backend cannot notify reader arrivals.
pub const DEFAULT_POLLING_TIMEOUT: Duration = Duration::from_millis(5000);

const STOP_RETRY_INTERVAL: Duration = Duration::from_millis(10);
const IDLE_SLICE: Duration = Duration::from_millis(50);

/// What a monitor tracks and how a fresh snapshot turns into events.
pub trait MonitorKind: Default + Send + 'static {
    type Event: Send + Sync + 'static;

    /// Name used for logging and thread names.
    const LABEL: &'static str;

    /// Update the inventory from the entries flagged as changed and return
    /// the event to publish, if any.
    fn diff(&mut self, states: &[ReaderState]) -> Option<Self::Event>;
}

struct Poller<E> {
    observer: Arc<dyn Observer<E>>,
    stop: Arc<AtomicBool>,
    handle: JoinHandle<()>,
}

impl<E> Poller<E> {
    fn stop(self, context: Option<&dyn BackendContext>) {
        self.stop.store(true, Ordering::SeqCst);

        // An observer removing itself from its own callback
        if self.handle.thread().id() == thread::current().id() {
            return;
        }

        // The cancel may land before the thread enters its wait, retry until it is out
        while !self.handle.is_finished() {
            if let Some(context) = context {
                if let Err(err) = context.cancel() {
                    log::debug!("Cancel failed: {}", err);
                }
            }
            thread::sleep(STOP_RETRY_INTERVAL);
        }

        if self.handle.join().is_err() {
            log::error!("Polling thread panicked");
        }
    }
}

struct MonitorState<K: MonitorKind> {
    context: Option<Arc<dyn BackendContext>>,
    pnp: Option<bool>,
    snapshot: Vec<ReaderState>,
    inventory: K,
    registry: ObservableRegistry<K::Event>,
    pollers: Vec<Poller<K::Event>>,
}

struct Shared<K: MonitorKind> {
    backend: Arc<dyn DeviceStatusBackend>,
    state: Mutex<MonitorState<K>>,
}

/// Handle on the monitoring state of one kind of device.
pub struct DeviceMonitor<K: MonitorKind> {
    shared: Arc<Shared<K>>,
}

impl<K: MonitorKind> Clone for DeviceMonitor<K> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<K: MonitorKind> Default for DeviceMonitor<K> {
    fn default() -> Self {
        Self::new(Arc::new(PcscBackend::new()))
    }
}

impl<K: MonitorKind> DeviceMonitor<K> {
    pub fn new(backend: Arc<dyn DeviceStatusBackend>) -> Self {
        Self {
            shared: Arc::new(Shared {
                backend,
                state: Mutex::new(MonitorState {
                    context: None,
                    pnp: None,
                    snapshot: Vec::new(),
                    inventory: K::default(),
                    registry: ObservableRegistry::new(),
                    pollers: Vec::new(),
                }),
            }),
        }
    }

    /// Register `observer` and start its polling thread.
    ///
    /// The wait blocks indefinitely when the backend notifies reader
    /// arrivals, otherwise it returns every [`DEFAULT_POLLING_TIMEOUT`].
    /// Registering an observer twice is a no-op while its thread runs. Once
    /// that thread ended on a failure, registering it again starts a new one.
    pub fn add_observer(&self, observer: Arc<dyn Observer<K::Event>>) -> Result<()> {
        self.register(observer, None)
    }

    /// Same as [`DeviceMonitor::add_observer`] with an explicit wait timeout,
    /// `None` meaning no timeout.
    pub fn add_observer_with_timeout(
        &self,
        observer: Arc<dyn Observer<K::Event>>,
        timeout: Option<Duration>,
    ) -> Result<()> {
        self.register(observer, Some(timeout))
    }

    fn register(
        &self,
        observer: Arc<dyn Observer<K::Event>>,
        timeout: Option<Option<Duration>>,
    ) -> Result<()> {
        let mut guard = self.shared.state.lock();
        let state = &mut *guard;

        if state.registry.contains(&observer) {
            let running = state.pollers.iter().any(|poller| {
                same_observer(&poller.observer, &observer) && !poller.handle.is_finished()
            });
            if running {
                return Ok(());
            }

            // Its thread ended on a failure, replace it with a fresh one
            let (dead, rest): (Vec<_>, Vec<_>) = state
                .pollers
                .drain(..)
                .partition(|poller| same_observer(&poller.observer, &observer));
            state.pollers = rest;
            for poller in dead {
                poller.stop(None);
            }
            if state.pollers.is_empty() && state.context.take().is_some() {
                log::debug!("{} monitor context released", K::LABEL);
                state.snapshot.clear();
            }
            log::info!("{} observer re-added, restarting its polling thread", K::LABEL);
        }

        let context = match &state.context {
            Some(context) => Arc::clone(context),
            None => {
                let context = self
                    .shared
                    .backend
                    .establish_context()
                    .map_err(SmartcardError::EstablishContext)?;
                log::debug!("{} monitor context established", K::LABEL);
                state.context = Some(Arc::clone(&context));
                context
            }
        };

        let pnp = *state
            .pnp
            .get_or_insert_with(|| detect_pnp(context.as_ref()));
        let timeout = timeout.unwrap_or(if pnp {
            None
        } else {
            Some(DEFAULT_POLLING_TIMEOUT)
        });

        let stop = Arc::new(AtomicBool::new(false));
        let spawned = {
            let shared = Arc::clone(&self.shared);
            let context = Arc::clone(&context);
            let stop = Arc::clone(&stop);
            thread::Builder::new()
                .name(format!("{}-monitor", K::LABEL))
                .spawn(move || poll(shared, context, stop, timeout))
        };

        let handle = match spawned {
            Ok(handle) => handle,
            Err(err) => {
                if state.pollers.is_empty() {
                    state.context = None;
                }
                return Err(err.into());
            }
        };

        log::debug!(
            "{} observer added (timeout: {:?}, pnp: {})",
            K::LABEL,
            timeout,
            pnp
        );
        state.registry.add_observer(Arc::clone(&observer));
        state.pollers.push(Poller {
            observer,
            stop,
            handle,
        });
        Ok(())
    }

    /// Stop the polling thread of `observer` and forget it. The context is
    /// released once the last observer is gone.
    pub fn remove_observer(&self, observer: &Arc<dyn Observer<K::Event>>) -> bool {
        let (pollers, context) = {
            let mut state = self.shared.state.lock();
            if !state.registry.remove_observer(observer) {
                return false;
            }
            let (mine, rest): (Vec<_>, Vec<_>) = state
                .pollers
                .drain(..)
                .partition(|poller| same_observer(&poller.observer, observer));
            state.pollers = rest;
            (mine, state.context.clone())
        };

        for poller in pollers {
            poller.stop(context.as_deref());
        }
        drop(context);

        let mut state = self.shared.state.lock();
        if state.pollers.is_empty() && state.registry.count_observers() == 0 {
            if state.context.take().is_some() {
                log::debug!("{} monitor context released", K::LABEL);
            }
            state.snapshot.clear();
        }
        true
    }

    pub fn remove_all_observers(&self) {
        let observers: Vec<_> = self.shared.state.lock().registry.observers().to_vec();
        for observer in &observers {
            self.remove_observer(observer);
        }
    }

    pub fn count_observers(&self) -> usize {
        self.shared.state.lock().registry.count_observers()
    }

    /// Number of polling threads still running. A thread ends on its own
    /// after a backend failure or an observer error.
    pub fn running_pollers(&self) -> usize {
        self.shared
            .state
            .lock()
            .pollers
            .iter()
            .filter(|poller| !poller.handle.is_finished())
            .count()
    }

    /// `None` until the first observer established a context.
    pub fn is_pnp_supported(&self) -> Option<bool> {
        self.shared.state.lock().pnp
    }

    pub fn snapshot(&self) -> Vec<ReaderState> {
        self.shared.state.lock().snapshot.clone()
    }

    /// Copy of the inventory kept by this kind of monitor.
    pub fn inventory(&self) -> K
    where
        K: Clone,
    {
        self.shared.state.lock().inventory.clone()
    }
}

impl<K: MonitorKind> Shared<K> {
    /// Bring the snapshot in line with the enumerated readers. Returns the
    /// states to wait on and the entries of readers that disappeared.
    fn reconcile(&self, readers: &[String]) -> (Vec<ReaderState>, Vec<ReaderState>) {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        let pnp = state.pnp.unwrap_or(false);

        let mut vanished = Vec::new();
        state.snapshot.retain(|entry| {
            if entry.is_notification() {
                return pnp;
            }
            let present = readers.contains(&entry.name);
            if !present {
                let mut gone = entry.clone();
                gone.event_state = State::UNKNOWN | State::CHANGED;
                gone.atr.clear();
                vanished.push(gone);
            }
            present
        });

        for name in readers {
            if !state.snapshot.iter().any(|entry| &entry.name == name) {
                state.snapshot.push(ReaderState::new(name.as_str()));
            }
        }
        if pnp && !state.snapshot.iter().any(ReaderState::is_notification) {
            state.snapshot.insert(0, ReaderState::notification());
        }

        (state.snapshot.clone(), vanished)
    }

    /// Replace the snapshot with the result of a wait and publish its changes.
    fn apply_snapshot(&self, states: Vec<ReaderState>) -> anyhow::Result<()> {
        self.publish(|state| {
            state.snapshot = states;
            state.inventory.diff(&state.snapshot)
        })
    }

    fn apply_vanished(&self, vanished: &[ReaderState]) -> anyhow::Result<()> {
        self.publish(|state| state.inventory.diff(vanished))
    }

    /// Run `diff` under the lock, then notify observers without holding it.
    fn publish(
        &self,
        diff: impl FnOnce(&mut MonitorState<K>) -> Option<K::Event>,
    ) -> anyhow::Result<()> {
        let (event, observers) = {
            let mut guard = self.state.lock();
            let state = &mut *guard;
            match diff(state) {
                Some(event) => {
                    state.registry.set_changed();
                    (event, state.registry.take_pending())
                }
                None => return Ok(()),
            }
        };

        for observer in observers {
            observer.update(&event)?;
        }
        Ok(())
    }
}

/// Zero-timeout probe of the notification pseudo-reader.
fn detect_pnp(context: &dyn BackendContext) -> bool {
    let mut states = [ReaderState::notification()];
    let supported = match context.get_status_change(Some(Duration::ZERO), &mut states) {
        Ok(()) | Err(pcsc::Error::Timeout) => !states[0].event_state.contains(State::UNKNOWN),
        Err(pcsc::Error::UnknownReader) => false,
        Err(err) => {
            log::warn!("PnP detection failed: {}", err);
            false
        }
    };
    log::debug!("PnP notification supported: {}", supported);
    supported
}

fn poll<K: MonitorKind>(
    shared: Arc<Shared<K>>,
    context: Arc<dyn BackendContext>,
    stop: Arc<AtomicBool>,
    timeout: Option<Duration>,
) {
    log::debug!("{} polling thread started", K::LABEL);
    match poll_loop(&shared, context.as_ref(), &stop, timeout) {
        Ok(()) => log::debug!("{} polling thread stopped", K::LABEL),
        Err(err) => log::error!("{} monitoring stopped: {:#}", K::LABEL, err),
    }
}

fn poll_loop<K: MonitorKind>(
    shared: &Shared<K>,
    context: &dyn BackendContext,
    stop: &AtomicBool,
    timeout: Option<Duration>,
) -> anyhow::Result<()> {
    while !stop.load(Ordering::SeqCst) {
        let readers = context
            .list_readers()
            .map_err(SmartcardError::ListReaders)?;
        let (mut states, vanished) = shared.reconcile(&readers);
        if !vanished.is_empty() {
            shared.apply_vanished(&vanished)?;
        }

        if states.is_empty() {
            idle(stop, timeout.unwrap_or(DEFAULT_POLLING_TIMEOUT));
            continue;
        }

        for state in &mut states {
            state.sync_current_state();
        }

        log::debug!("{} waiting on {} reader state(s)", K::LABEL, states.len());
        match context.get_status_change(timeout, &mut states) {
            Ok(()) | Err(pcsc::Error::UnknownReader) => shared.apply_snapshot(states)?,
            Err(pcsc::Error::Timeout) => {}
            Err(pcsc::Error::Cancelled) => {
                // A cancel meant for another poller of this context just re-arms
                if stop.load(Ordering::SeqCst) {
                    break;
                }
            }
            Err(err) => return Err(SmartcardError::StatusChange(err).into()),
        }
    }
    Ok(())
}

fn idle(stop: &AtomicBool, duration: Duration) {
    let deadline = Instant::now() + duration;
    while !stop.load(Ordering::SeqCst) {
        let now = Instant::now();
        if now >= deadline {
            break;
        }
        thread::sleep(IDLE_SLICE.min(deadline - now));
    }
}
