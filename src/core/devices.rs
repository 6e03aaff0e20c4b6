//! Live list of readers and cards fed by the two monitors.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;

use crate::core::backend::DeviceStatusBackend;
use crate::core::card_monitor::{Card, CardEvent, CardMonitor};
use crate::core::error::{Result, SmartcardError};
use crate::core::observable::Observer;
use crate::core::reader_monitor::{ReaderEvent, ReaderMonitor};
use crate::core::utils::format_hex;

#[derive(Debug, Default)]
struct Devices {
    readers: Vec<String>,
    cards: Vec<Card>,
    last_change: Option<DateTime<Utc>>,
}

impl Devices {
    fn apply_readers(&mut self, event: &ReaderEvent) {
        for reader in &event.added {
            if !self.readers.contains(reader) {
                log::info!("detected new reader: {}", reader);
                self.readers.push(reader.clone());
            }
        }
        for reader in &event.removed {
            if self.readers.contains(reader) {
                log::info!("removed reader: {}", reader);
                self.readers.retain(|name| name != reader);
            }
        }
        self.last_change = Some(Utc::now());
    }

    fn apply_cards(&mut self, event: &CardEvent) {
        for card in &event.added {
            log::info!(
                "detected new card added with atr: {} on reader: {}",
                format_hex(&card.atr),
                card.reader
            );
            match self.cards.iter_mut().find(|known| known.reader == card.reader) {
                Some(known) => known.atr = card.atr.clone(),
                None => self.cards.push(card.clone()),
            }
        }
        for card in &event.removed {
            log::info!(
                "removed card with atr: {} from reader {}",
                format_hex(&card.atr),
                card.reader
            );
            self.cards.retain(|known| known.reader != card.reader);
        }
        self.last_change = Some(Utc::now());
    }
}

/// Keeps the readers and cards currently plugged in, as reported by a
/// [`ReaderMonitor`] and a [`CardMonitor`].
pub struct DeviceList {
    reader_monitor: ReaderMonitor,
    card_monitor: CardMonitor,
    devices: Arc<Mutex<Devices>>,
    reader_observer: Arc<dyn Observer<ReaderEvent>>,
    card_observer: Arc<dyn Observer<CardEvent>>,
}

impl DeviceList {
    pub fn new(backend: Arc<dyn DeviceStatusBackend>) -> Self {
        Self::with_monitors(
            ReaderMonitor::new(Arc::clone(&backend)),
            CardMonitor::new(backend),
        )
    }

    pub fn with_monitors(reader_monitor: ReaderMonitor, card_monitor: CardMonitor) -> Self {
        let devices = Arc::new(Mutex::new(Devices::default()));

        let reader_devices = Arc::clone(&devices);
        let reader_observer: Arc<dyn Observer<ReaderEvent>> =
            Arc::new(move |event: &ReaderEvent| -> anyhow::Result<()> {
                reader_devices.lock().apply_readers(event);
                Ok(())
            });

        let card_devices = Arc::clone(&devices);
        let card_observer: Arc<dyn Observer<CardEvent>> =
            Arc::new(move |event: &CardEvent| -> anyhow::Result<()> {
                card_devices.lock().apply_cards(event);
                Ok(())
            });

        Self {
            reader_monitor,
            card_monitor,
            devices,
            reader_observer,
            card_observer,
        }
    }

    /// Start following reader and card changes.
    pub fn start(&self) -> Result<()> {
        self.reader_monitor
            .add_observer(Arc::clone(&self.reader_observer))?;
        if let Err(err) = self
            .card_monitor
            .add_observer(Arc::clone(&self.card_observer))
        {
            self.reader_monitor.remove_observer(&self.reader_observer);
            return Err(err);
        }
        Ok(())
    }

    /// Stop both monitoring threads. The lists keep their last content.
    pub fn stop(&self) {
        self.reader_monitor.remove_observer(&self.reader_observer);
        self.card_monitor.remove_observer(&self.card_observer);
    }

    pub fn readers(&self) -> Vec<String> {
        self.devices.lock().readers.clone()
    }

    pub fn cards(&self) -> Vec<Card> {
        self.devices.lock().cards.clone()
    }

    pub fn no_reader_available(&self) -> bool {
        self.devices.lock().readers.is_empty()
    }

    pub fn no_card_available(&self) -> bool {
        self.devices.lock().cards.is_empty()
    }

    /// ATR of the card listed at `index` by [`DeviceList::cards`].
    pub fn atr_for_card_index(&self, index: usize) -> Result<Vec<u8>> {
        self.devices
            .lock()
            .cards
            .get(index)
            .map(|card| card.atr.clone())
            .ok_or(SmartcardError::UnknownCardIndex(index))
    }

    pub fn last_change(&self) -> Option<DateTime<Utc>> {
        self.devices.lock().last_change
    }

    pub fn reader_monitor(&self) -> &ReaderMonitor {
        &self.reader_monitor
    }

    pub fn card_monitor(&self) -> &CardMonitor {
        &self.card_monitor
    }
}

impl Drop for DeviceList {
    fn drop(&mut self) {
        self.stop();
    }
}
