//! Lifecycle of one connection to a card: wait for it, open a session,
//! exchange APDUs, reset, eject and close.

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use pcsc::{Disposition, ShareMode, State};

use crate::core::apdu::describe_response;
use crate::core::backend::{BackendContext, CardChannel, DeviceStatusBackend, ReaderState};
use crate::core::error::{Result, SmartcardError};
use crate::core::utils::format_hex_spaced;

/// Longest single wait while looking for a card, so the deadline is honoured.
const CARD_WAIT_SLICE: Duration = Duration::from_secs(1);
const NO_READER_RETRY: Duration = Duration::from_millis(200);

/// Which cards a connection request accepts.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum CardType {
    #[default]
    Any,
    /// Cards whose ATR equals `atr`, compared on the bits set in `mask`.
    Atr { atr: Vec<u8>, mask: Option<Vec<u8>> },
}

impl CardType {
    pub fn atr(atr: impl Into<Vec<u8>>) -> Self {
        CardType::Atr {
            atr: atr.into(),
            mask: None,
        }
    }

    pub fn matches(&self, atr: &[u8]) -> bool {
        match self {
            CardType::Any => true,
            CardType::Atr {
                atr: expected,
                mask,
            } => {
                if expected.len() != atr.len() {
                    return false;
                }
                match mask {
                    None => expected.as_slice() == atr,
                    Some(mask) => {
                        mask.len() == atr.len()
                            && atr
                                .iter()
                                .zip(expected)
                                .zip(mask)
                                .all(|((a, e), m)| a & m == e & m)
                    }
                }
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionSettings {
    pub request_timeout: Duration,
    pub card_type: CardType,
    pub share_mode: ShareMode,
    pub disposition: Disposition,
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(10),
            card_type: CardType::Any,
            share_mode: ShareMode::Shared,
            disposition: Disposition::LeaveCard,
        }
    }
}

impl ConnectionSettings {
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn with_card_type(mut self, card_type: CardType) -> Self {
        self.card_type = card_type;
        self
    }

    pub fn with_share_mode(mut self, share_mode: ShareMode) -> Self {
        self.share_mode = share_mode;
        self
    }

    pub fn with_disposition(mut self, disposition: Disposition) -> Self {
        self.disposition = disposition;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connected,
}

/// Traffic and lifecycle events of a card session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    Connect,
    Reconnect,
    Disconnect,
    Command { apdu: Vec<u8> },
    /// Payload followed by SW1 SW2.
    Response { response: Vec<u8> },
}

pub trait ConnectionObserver: Send + Sync {
    fn update(&self, reader: &str, event: &ConnectionEvent);
}

/// Logs every event of the session it is attached to.
#[derive(Debug, Default)]
pub struct LoggingConnectionObserver;

impl ConnectionObserver for LoggingConnectionObserver {
    fn update(&self, reader: &str, event: &ConnectionEvent) {
        match event {
            ConnectionEvent::Connect => log::info!("connect event on reader {}", reader),
            ConnectionEvent::Reconnect => log::info!("reconnect event on reader {}", reader),
            ConnectionEvent::Disconnect => log::info!("disconnect event on reader {}", reader),
            ConnectionEvent::Command { apdu } => {
                log::info!("command > {}", format_hex_spaced(apdu))
            }
            ConnectionEvent::Response { response } => {
                log::debug!("response : {}", format_hex_spaced(response));
                log::info!("{}", describe_response(response));
            }
        }
    }
}

/// ATR and reader of the connected card.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CardInfo {
    pub reader: String,
    pub atr: Vec<u8>,
}

/// An open connection, owned by the [`CardConnectionManager`].
pub struct CardSession {
    channel: Box<dyn CardChannel>,
    // Keeps the context alive as long as the channel
    _context: Arc<dyn BackendContext>,
    reader: String,
    atr: Vec<u8>,
    share_mode: ShareMode,
    disposition: Disposition,
    card_type: CardType,
    observers: Vec<Arc<dyn ConnectionObserver>>,
}

impl CardSession {
    pub fn reader(&self) -> &str {
        &self.reader
    }

    /// ATR read when the session was opened or last reconnected.
    pub fn atr(&self) -> &[u8] {
        &self.atr
    }

    pub fn share_mode(&self) -> ShareMode {
        self.share_mode
    }

    pub fn disposition(&self) -> Disposition {
        self.disposition
    }

    pub fn card_type(&self) -> &CardType {
        &self.card_type
    }

    fn notify(&self, event: ConnectionEvent) {
        for observer in &self.observers {
            observer.update(&self.reader, &event);
        }
    }

    fn reconnect_with(&mut self, initialization: Disposition) -> Result<()> {
        self.channel
            .reconnect(self.share_mode, initialization)
            .map_err(SmartcardError::from_card)?;
        self.atr = self.channel.status().map_err(SmartcardError::from_card)?;
        self.notify(ConnectionEvent::Reconnect);
        Ok(())
    }

    fn close(self, disposition: Disposition) -> Result<()> {
        self.notify(ConnectionEvent::Disconnect);
        let CardSession {
            channel, _context, ..
        } = self;
        channel
            .disconnect(disposition)
            .map_err(SmartcardError::from_card)
    }
}

/// Connects to one card at a time. Not meant to be shared between threads
/// without external serialisation.
pub struct CardConnectionManager {
    backend: Arc<dyn DeviceStatusBackend>,
    settings: ConnectionSettings,
    observers: Vec<Arc<dyn ConnectionObserver>>,
    session: Option<CardSession>,
}

impl CardConnectionManager {
    pub fn new(backend: Arc<dyn DeviceStatusBackend>) -> Self {
        Self::with_settings(backend, ConnectionSettings::default())
    }

    pub fn with_settings(backend: Arc<dyn DeviceStatusBackend>, settings: ConnectionSettings) -> Self {
        Self {
            backend,
            settings,
            observers: Vec::new(),
            session: None,
        }
    }

    pub fn settings(&self) -> &ConnectionSettings {
        &self.settings
    }

    pub fn set_share_mode(&mut self, share_mode: ShareMode) {
        self.settings.share_mode = share_mode;
    }

    pub fn set_disposition(&mut self, disposition: Disposition) {
        self.settings.disposition = disposition;
    }

    /// Observer added to the current session and every later one.
    pub fn add_observer(&mut self, observer: Arc<dyn ConnectionObserver>) {
        if let Some(session) = self.session.as_mut() {
            session.observers.push(Arc::clone(&observer));
        }
        self.observers.push(observer);
    }

    pub fn state(&self) -> ConnectionState {
        if self.session.is_some() {
            ConnectionState::Connected
        } else {
            ConnectionState::Disconnected
        }
    }

    pub fn is_connected(&self) -> bool {
        self.session.is_some()
    }

    pub fn session(&self) -> Option<&CardSession> {
        self.session.as_ref()
    }

    /// Wait up to the request timeout for a card accepted by the card type
    /// and open a session on it.
    ///
    /// `card_type` and `share_mode` replace the stored settings when given.
    /// A previous session is closed first, leaving its card untouched.
    pub fn connect(&mut self, card_type: Option<CardType>, share_mode: Option<ShareMode>) -> Result<()> {
        if let Some(card_type) = card_type {
            self.settings.card_type = card_type;
        }
        if let Some(share_mode) = share_mode {
            self.settings.share_mode = share_mode;
        }

        if let Some(previous) = self.session.take() {
            if let Err(err) = previous.close(Disposition::LeaveCard) {
                log::warn!("Closing previous session failed: {}", err);
            }
        }

        let context = self
            .backend
            .establish_context()
            .map_err(SmartcardError::EstablishContext)?;
        let reader = self.wait_for_card(context.as_ref())?;

        let channel = context
            .connect(&reader, self.settings.share_mode)
            .map_err(SmartcardError::from_card)?;
        let atr = channel.status().map_err(SmartcardError::from_card)?;

        let mut observers: Vec<Arc<dyn ConnectionObserver>> =
            vec![Arc::new(LoggingConnectionObserver)];
        observers.extend(self.observers.iter().cloned());

        let session = CardSession {
            channel,
            _context: context,
            reader,
            atr,
            share_mode: self.settings.share_mode,
            disposition: self.settings.disposition,
            card_type: self.settings.card_type.clone(),
            observers,
        };
        session.notify(ConnectionEvent::Connect);
        self.session = Some(session);
        Ok(())
    }

    fn wait_for_card(&self, context: &dyn BackendContext) -> Result<String> {
        let timeout = self.settings.request_timeout;
        let deadline = Instant::now() + timeout;
        let mut states: Vec<ReaderState> = Vec::new();

        loop {
            let readers = context.list_readers().map_err(SmartcardError::ListReaders)?;
            states.retain(|state| readers.contains(&state.name));
            for name in &readers {
                if !states.iter().any(|state| &state.name == name) {
                    states.push(ReaderState::new(name.as_str()));
                }
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            if states.is_empty() {
                if remaining.is_zero() {
                    return Err(SmartcardError::NoMatchingCard(timeout));
                }
                thread::sleep(remaining.min(NO_READER_RETRY));
                continue;
            }

            for state in &mut states {
                state.sync_current_state();
            }
            match context.get_status_change(Some(remaining.min(CARD_WAIT_SLICE)), &mut states) {
                Ok(()) | Err(pcsc::Error::Timeout) | Err(pcsc::Error::UnknownReader) => {}
                Err(err) => return Err(SmartcardError::StatusChange(err)),
            }

            let found = states.iter().find(|state| {
                state.event_state.contains(State::PRESENT)
                    && !state.atr.is_empty()
                    && self.settings.card_type.matches(&state.atr)
            });
            if let Some(state) = found {
                log::debug!("matching card found in reader {}", state.name);
                return Ok(state.name.clone());
            }

            if Instant::now() >= deadline {
                return Err(SmartcardError::NoMatchingCard(timeout));
            }
        }
    }

    /// Reconnect the session, storing `disposition` as its new policy.
    pub fn reconnect(&mut self, disposition: Option<Disposition>) -> Result<()> {
        let session = self.session.as_mut().ok_or(SmartcardError::NoSession)?;
        if let Some(disposition) = disposition {
            session.disposition = disposition;
            self.settings.disposition = disposition;
        }
        let initialization = session.disposition;
        session.reconnect_with(initialization)
    }

    /// Close the session. The card is always left as is; `disposition` only
    /// updates the stored policy.
    pub fn disconnect(&mut self, disposition: Option<Disposition>) -> Result<()> {
        let session = self.session.take().ok_or(SmartcardError::NoSession)?;
        if let Some(disposition) = disposition {
            self.settings.disposition = disposition;
        }
        session.close(Disposition::LeaveCard)
    }

    /// Reset the card and keep the session usable.
    pub fn warm_reset(&mut self) -> Result<()> {
        let session = self.session.as_mut().ok_or(SmartcardError::NoSession)?;
        session.reconnect_with(Disposition::ResetCard)
    }

    /// Power-cycle the card and keep the session usable.
    pub fn cold_reset(&mut self) -> Result<()> {
        let session = self.session.as_mut().ok_or(SmartcardError::NoSession)?;
        session.reconnect_with(Disposition::UnpowerCard)
    }

    /// Close the session asking the reader to eject the card.
    pub fn eject(&mut self) -> Result<()> {
        let session = self.session.take().ok_or(SmartcardError::NoSession)?;
        session.close(Disposition::EjectCard)
    }

    /// Send `apdu` and return the response payload followed by SW1 SW2.
    pub fn transmit(&mut self, apdu: &[u8]) -> Result<Vec<u8>> {
        let session = self.session.as_ref().ok_or(SmartcardError::NoSession)?;
        if apdu.is_empty() {
            return Err(SmartcardError::InvalidApdu("empty command".to_string()));
        }

        session.notify(ConnectionEvent::Command {
            apdu: apdu.to_vec(),
        });
        let response = session
            .channel
            .transmit(apdu)
            .map_err(SmartcardError::from_card)?;
        session.notify(ConnectionEvent::Response {
            response: response.clone(),
        });
        Ok(response)
    }

    /// Round trip to the card to check it is still there. The session is
    /// kept on failure; closing it is up to the caller.
    pub fn verify_card_connected(&self) -> Result<()> {
        let session = self.session.as_ref().ok_or(SmartcardError::NoSession)?;
        session
            .channel
            .status()
            .map(|_| ())
            .map_err(SmartcardError::ConnectivityLost)
    }

    /// Reader name and live ATR of the connected card.
    pub fn card_info(&self) -> Result<CardInfo> {
        let session = self.session.as_ref().ok_or(SmartcardError::NoSession)?;
        let atr = session
            .channel
            .status()
            .map_err(SmartcardError::from_card)?;
        Ok(CardInfo {
            reader: session.reader.clone(),
            atr,
        })
    }
}

impl Drop for CardConnectionManager {
    fn drop(&mut self) {
        if let Some(session) = self.session.take() {
            if let Err(err) = session.close(Disposition::LeaveCard) {
                log::debug!("Closing session on drop failed: {}", err);
            }
        }
    }
}
