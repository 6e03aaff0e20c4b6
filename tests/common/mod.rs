//! In-memory PCSC service shared by the integration tests
#![allow(dead_code)]

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use pcsc::{Disposition, ShareMode, State};

use smartcard_control::core::backend::{
    BackendContext, CardChannel, DeviceStatusBackend, ReaderState,
};

pub const ATR_A: [u8; 4] = [0x3B, 0x65, 0x00, 0x00];
pub const ATR_B: [u8; 5] = [0x3B, 0x75, 0x13, 0x00, 0x01];

/// Bits compared to decide whether a reader changed.
const STATUS_BITS: State = State::EMPTY
    .union(State::PRESENT)
    .union(State::UNKNOWN)
    .union(State::UNAVAILABLE);

#[derive(Debug, Default)]
struct Slot {
    atr: Option<Vec<u8>>,
    /// Bumped on every card insertion or removal
    events: u32,
}

#[derive(Default)]
struct Service {
    readers: BTreeMap<String, Slot>,
    pnp: bool,
    /// Bumped on every reader arrival or departure
    reader_events: u32,
    cancel_generation: u64,
    failure: Option<pcsc::Error>,
    establish_failure: Option<pcsc::Error>,
    transmit_failure: Option<pcsc::Error>,
    responses: BTreeMap<Vec<u8>, Vec<u8>>,
    established: usize,
    released: usize,
    waits: usize,
    dispositions: Vec<Disposition>,
    reconnects: Vec<Disposition>,
    transmitted: Vec<Vec<u8>>,
}

impl Service {
    fn status(&self, name: &str) -> (State, Vec<u8>, u32) {
        match self.readers.get(name) {
            None => (State::UNKNOWN, Vec::new(), 0),
            Some(Slot {
                atr: Some(atr),
                events,
            }) => (State::PRESENT, atr.clone(), *events),
            Some(Slot { atr: None, events }) => (State::EMPTY, Vec::new(), *events),
        }
    }
}

struct Inner {
    service: Mutex<Service>,
    changed: Condvar,
}

/// Fake smart card service. Every clone drives the same readers.
#[derive(Clone)]
pub struct MockBackend {
    inner: Arc<Inner>,
}

impl MockBackend {
    pub fn new(pnp: bool) -> Self {
        Self {
            inner: Arc::new(Inner {
                service: Mutex::new(Service {
                    pnp,
                    ..Service::default()
                }),
                changed: Condvar::new(),
            }),
        }
    }

    pub fn as_backend(&self) -> Arc<dyn DeviceStatusBackend> {
        Arc::new(self.clone())
    }

    fn update(&self, change: impl FnOnce(&mut Service)) {
        change(&mut self.inner.service.lock());
        self.inner.changed.notify_all();
    }

    pub fn plug_reader(&self, name: &str) {
        self.update(|service| {
            service.readers.insert(name.to_string(), Slot::default());
            service.reader_events += 1;
        });
    }

    pub fn unplug_reader(&self, name: &str) {
        self.update(|service| {
            service.readers.remove(name);
            service.reader_events += 1;
        });
    }

    pub fn insert_card(&self, reader: &str, atr: &[u8]) {
        self.update(|service| {
            if let Some(slot) = service.readers.get_mut(reader) {
                slot.atr = Some(atr.to_vec());
                slot.events += 1;
            }
        });
    }

    pub fn remove_card(&self, reader: &str) {
        self.update(|service| {
            if let Some(slot) = service.readers.get_mut(reader) {
                slot.atr = None;
                slot.events += 1;
            }
        });
    }

    /// Let status-change calls succeed again after [`Self::fail_status_change`].
    pub fn restore_status_change(&self) {
        self.update(|service| service.failure = None);
    }

    /// Make every following status-change call fail with `err`.
    pub fn fail_status_change(&self, err: pcsc::Error) {
        self.update(|service| service.failure = Some(err));
    }

    pub fn fail_establish(&self, err: pcsc::Error) {
        self.update(|service| service.establish_failure = Some(err));
    }

    pub fn fail_transmit(&self, err: pcsc::Error) {
        self.update(|service| service.transmit_failure = Some(err));
    }

    pub fn add_response(&self, command: &[u8], response: &[u8]) {
        self.update(|service| {
            service
                .responses
                .insert(command.to_vec(), response.to_vec());
        });
    }

    pub fn established(&self) -> usize {
        self.inner.service.lock().established
    }

    pub fn released(&self) -> usize {
        self.inner.service.lock().released
    }

    /// Number of status-change calls made so far.
    pub fn waits(&self) -> usize {
        self.inner.service.lock().waits
    }

    /// Dispositions applied by closed channels, in order.
    pub fn dispositions(&self) -> Vec<Disposition> {
        self.inner.service.lock().dispositions.clone()
    }

    pub fn reconnects(&self) -> Vec<Disposition> {
        self.inner.service.lock().reconnects.clone()
    }

    pub fn transmitted(&self) -> Vec<Vec<u8>> {
        self.inner.service.lock().transmitted.clone()
    }
}

impl DeviceStatusBackend for MockBackend {
    fn establish_context(&self) -> Result<Arc<dyn BackendContext>, pcsc::Error> {
        let mut service = self.inner.service.lock();
        if let Some(err) = service.establish_failure {
            return Err(err);
        }
        service.established += 1;
        Ok(Arc::new(MockContext {
            inner: Arc::clone(&self.inner),
        }))
    }
}

pub struct MockContext {
    inner: Arc<Inner>,
}

impl Drop for MockContext {
    fn drop(&mut self) {
        self.inner.service.lock().released += 1;
    }
}

impl MockContext {
    /// Fill `states` from the service, returns whether one of them changed.
    fn refresh(service: &Service, states: &mut [ReaderState]) -> (bool, bool) {
        let mut changed = false;
        let mut unknown = false;

        for state in states.iter_mut() {
            if state.is_notification() {
                if !service.pnp {
                    state.event_state = State::UNKNOWN | State::CHANGED;
                    unknown = true;
                    changed = true;
                    continue;
                }
                if state.event_count != service.reader_events {
                    state.event_count = service.reader_events;
                    state.event_state = State::CHANGED;
                    changed = true;
                } else {
                    state.event_state = State::empty();
                }
                continue;
            }

            let (status, atr, events) = service.status(&state.name);
            if status == State::UNKNOWN {
                unknown = true;
            }
            let differs = state.current_state == State::UNAWARE
                || (state.current_state & STATUS_BITS) != status
                || state.event_count != events;
            state.event_count = events;
            state.atr = atr;
            state.event_state = if differs {
                changed = true;
                status | State::CHANGED
            } else {
                status
            };
        }

        (changed, unknown)
    }
}

impl BackendContext for MockContext {
    fn list_readers(&self) -> Result<Vec<String>, pcsc::Error> {
        Ok(self.inner.service.lock().readers.keys().cloned().collect())
    }

    fn get_status_change(
        &self,
        timeout: Option<Duration>,
        states: &mut [ReaderState],
    ) -> Result<(), pcsc::Error> {
        let deadline = timeout.map(|timeout| Instant::now() + timeout);
        let mut service = self.inner.service.lock();
        service.waits += 1;
        let generation = service.cancel_generation;

        loop {
            if let Some(err) = service.failure {
                return Err(err);
            }
            if service.cancel_generation != generation {
                return Err(pcsc::Error::Cancelled);
            }

            let (changed, unknown) = Self::refresh(&service, states);
            if changed {
                return if unknown {
                    Err(pcsc::Error::UnknownReader)
                } else {
                    Ok(())
                };
            }

            match deadline {
                Some(deadline) => {
                    if Instant::now() >= deadline
                        || self
                            .inner
                            .changed
                            .wait_until(&mut service, deadline)
                            .timed_out()
                    {
                        if service.cancel_generation != generation {
                            return Err(pcsc::Error::Cancelled);
                        }
                        Self::refresh(&service, states);
                        return Err(pcsc::Error::Timeout);
                    }
                }
                None => self.inner.changed.wait(&mut service),
            }
        }
    }

    fn cancel(&self) -> Result<(), pcsc::Error> {
        let mut service = self.inner.service.lock();
        service.cancel_generation += 1;
        drop(service);
        self.inner.changed.notify_all();
        Ok(())
    }

    fn connect(
        &self,
        reader: &str,
        _share_mode: ShareMode,
    ) -> Result<Box<dyn CardChannel>, pcsc::Error> {
        let service = self.inner.service.lock();
        match service.readers.get(reader) {
            None => Err(pcsc::Error::UnknownReader),
            Some(Slot { atr: None, .. }) => Err(pcsc::Error::NoSmartcard),
            Some(Slot { atr: Some(atr), .. }) => Ok(Box::new(MockChannel {
                inner: Arc::clone(&self.inner),
                reader: reader.to_string(),
                atr: atr.clone(),
            })),
        }
    }
}

/// Channel to a fake card. Fails once the card left its reader.
pub struct MockChannel {
    inner: Arc<Inner>,
    reader: String,
    atr: Vec<u8>,
}

impl MockChannel {
    fn card_present(&self, service: &Service) -> Result<(), pcsc::Error> {
        match service.readers.get(&self.reader) {
            Some(Slot { atr: Some(atr), .. }) if *atr == self.atr => Ok(()),
            _ => Err(pcsc::Error::RemovedCard),
        }
    }
}

impl CardChannel for MockChannel {
    fn reader(&self) -> &str {
        &self.reader
    }

    fn status(&self) -> Result<Vec<u8>, pcsc::Error> {
        let service = self.inner.service.lock();
        self.card_present(&service)?;
        Ok(self.atr.clone())
    }

    fn transmit(&self, apdu: &[u8]) -> Result<Vec<u8>, pcsc::Error> {
        let mut service = self.inner.service.lock();
        self.card_present(&service)?;
        if let Some(err) = service.transmit_failure {
            return Err(err);
        }
        service.transmitted.push(apdu.to_vec());
        Ok(service
            .responses
            .get(apdu)
            .cloned()
            .unwrap_or_else(|| vec![0x6D, 0x00]))
    }

    fn reconnect(
        &mut self,
        _share_mode: ShareMode,
        initialization: Disposition,
    ) -> Result<(), pcsc::Error> {
        let mut service = self.inner.service.lock();
        self.card_present(&service)?;
        service.reconnects.push(initialization);
        Ok(())
    }

    fn disconnect(self: Box<Self>, disposition: Disposition) -> Result<(), pcsc::Error> {
        let mut service = self.inner.service.lock();
        service.dispositions.push(disposition);
        if disposition == Disposition::EjectCard {
            if let Some(slot) = service.readers.get_mut(&self.reader) {
                slot.atr = None;
                slot.events += 1;
            }
            drop(service);
            self.inner.changed.notify_all();
        }
        Ok(())
    }
}

/// Poll `condition` until it holds or `timeout` elapses.
pub fn wait_for(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    condition()
}
