//! Boundary between the core and the platform smart card service.
//!
//! The monitors and the connection manager only talk to the traits defined
//! here. [`crate::core::pcsc_backend::PcscBackend`] implements them over the
//! PC/SC stack; tests plug in an in-memory implementation.

use std::sync::Arc;
use std::time::Duration;

use pcsc::{Disposition, ShareMode, State};
use serde::Serialize;

/// Name of the pseudo-reader used for reader plug-and-play notifications.
pub const PNP_NOTIFICATION: &str = r"\\?PnP?\Notification";

/// Last known status of one reader, as exchanged with the status-change call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReaderState {
    pub name: String,
    /// State the caller believes the reader is in.
    pub current_state: State,
    /// State reported by the last status-change call.
    pub event_state: State,
    /// Event counter kept by the service (reader count for the PnP entry).
    pub event_count: u32,
    pub atr: Vec<u8>,
}

impl ReaderState {
    /// A reader the caller knows nothing about yet.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            current_state: State::UNAWARE,
            event_state: State::UNAWARE,
            event_count: 0,
            atr: Vec::new(),
        }
    }

    /// The plug-and-play notification pseudo-reader.
    pub fn notification() -> Self {
        Self::new(PNP_NOTIFICATION)
    }

    /// Promote the last reported state to the state we wait on next.
    pub fn sync_current_state(&mut self) {
        self.current_state = self.event_state - State::CHANGED;
    }

    pub fn is_notification(&self) -> bool {
        self.name == PNP_NOTIFICATION
    }

    pub fn is_changed(&self) -> bool {
        self.event_state.contains(State::CHANGED)
    }

    /// A card sits in the reader and answered with an ATR.
    pub fn has_card(&self) -> bool {
        self.event_state.intersects(State::PRESENT | State::MUTE) && !self.atr.is_empty()
    }
}

/// Information about a PCSC reader, as shown by one-shot listings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReaderInfo {
    pub name: String,
    pub is_connected: bool,
    pub atr: Option<Vec<u8>>,
}

/// Entry point of the platform service: hands out contexts.
pub trait DeviceStatusBackend: Send + Sync {
    /// Establish a new context. Dropping the last handle releases it.
    fn establish_context(&self) -> Result<Arc<dyn BackendContext>, pcsc::Error>;
}

/// An established context with the platform service.
pub trait BackendContext: Send + Sync {
    /// Names of the readers currently plugged in. No reader is an empty list.
    fn list_readers(&self) -> Result<Vec<String>, pcsc::Error>;

    /// Block until one of `states` differs from its `current_state`, the
    /// timeout elapses (`None` waits forever) or [`BackendContext::cancel`]
    /// is called.
    ///
    /// The `event_state`, `event_count` and `atr` of every entry are updated
    /// in place, including when [`pcsc::Error::UnknownReader`] is returned.
    fn get_status_change(
        &self,
        timeout: Option<Duration>,
        states: &mut [ReaderState],
    ) -> Result<(), pcsc::Error>;

    /// Unblock every pending status-change call on this context.
    fn cancel(&self) -> Result<(), pcsc::Error>;

    /// Open a channel to the card inserted in `reader`.
    fn connect(&self, reader: &str, share_mode: ShareMode)
        -> Result<Box<dyn CardChannel>, pcsc::Error>;
}

/// An open connection to one card.
pub trait CardChannel: Send {
    fn reader(&self) -> &str;

    /// Read the card ATR through the channel (a cheap round trip).
    fn status(&self) -> Result<Vec<u8>, pcsc::Error>;

    /// Send a command APDU, returns payload plus SW1 SW2.
    fn transmit(&self, apdu: &[u8]) -> Result<Vec<u8>, pcsc::Error>;

    /// Re-establish the connection, applying `initialization` to the card.
    fn reconnect(
        &mut self,
        share_mode: ShareMode,
        initialization: Disposition,
    ) -> Result<(), pcsc::Error>;

    /// Close the connection, applying `disposition` to the card.
    fn disconnect(self: Box<Self>, disposition: Disposition) -> Result<(), pcsc::Error>;
}

/// Read the current status of every reader without waiting.
pub fn probe_readers(context: &dyn BackendContext) -> Result<Vec<ReaderInfo>, pcsc::Error> {
    let names = context.list_readers()?;
    let mut states: Vec<ReaderState> = names.into_iter().map(ReaderState::new).collect();
    if states.is_empty() {
        return Ok(Vec::new());
    }

    match context.get_status_change(Some(Duration::ZERO), &mut states) {
        Ok(()) | Err(pcsc::Error::Timeout) | Err(pcsc::Error::UnknownReader) => {}
        Err(err) => return Err(err),
    }

    Ok(states
        .into_iter()
        .map(|state| {
            let is_connected = state.has_card();
            ReaderInfo {
                name: state.name,
                is_connected,
                atr: is_connected.then_some(state.atr),
            }
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_reader_state_is_unaware() {
        let state = ReaderState::new("ACS1");
        assert_eq!(state.current_state, State::UNAWARE);
        assert_eq!(state.event_state, State::UNAWARE);
        assert!(state.atr.is_empty());
        assert!(!state.is_notification());
        assert!(ReaderState::notification().is_notification());
    }

    #[test]
    fn test_sync_current_state_drops_changed() {
        let mut state = ReaderState::new("ACS1");
        state.event_state = State::PRESENT | State::CHANGED;
        state.sync_current_state();
        assert_eq!(state.current_state, State::PRESENT);
    }

    #[test]
    fn test_has_card_requires_atr() {
        let mut state = ReaderState::new("ACS1");
        state.event_state = State::PRESENT | State::CHANGED;
        assert!(!state.has_card());

        state.atr = vec![0x3B, 0x65, 0x00];
        assert!(state.has_card());

        state.event_state = State::MUTE | State::CHANGED;
        assert!(state.has_card());

        state.event_state = State::EMPTY | State::CHANGED;
        assert!(!state.has_card());
    }
}
