use std::ffi::CString;
use std::sync::Arc;
use std::time::Duration;

use pcsc::{Card, Context, Disposition, Protocols, Scope, ShareMode, State, MAX_BUFFER_SIZE};

use crate::core::backend::{BackendContext, CardChannel, DeviceStatusBackend, ReaderState};

/// Platform backend talking to the PC/SC service of the host
#[derive(Debug, Clone, Copy, Default)]
pub struct PcscBackend;

impl PcscBackend {
    pub fn new() -> Self {
        Self
    }
}

impl DeviceStatusBackend for PcscBackend {
    fn establish_context(&self) -> Result<Arc<dyn BackendContext>, pcsc::Error> {
        let context = Context::establish(Scope::User)?;
        log::debug!("PCSC context established");
        Ok(Arc::new(PcscContext { context }))
    }
}

/// Established PC/SC context; released when the last handle is dropped
pub struct PcscContext {
    context: Context,
}

impl BackendContext for PcscContext {
    fn list_readers(&self) -> Result<Vec<String>, pcsc::Error> {
        match self.context.list_readers_owned() {
            Ok(readers) => Ok(readers
                .into_iter()
                .map(|name| name.to_string_lossy().into_owned())
                .collect()),
            Err(pcsc::Error::NoReadersAvailable) => Ok(Vec::new()),
            Err(err) => Err(err),
        }
    }

    fn get_status_change(
        &self,
        timeout: Option<Duration>,
        states: &mut [ReaderState],
    ) -> Result<(), pcsc::Error> {
        let mut pcsc_states = states
            .iter()
            .map(|state| {
                let name = reader_cstring(&state.name)?;
                Ok(pcsc::ReaderState::new(
                    name,
                    with_event_count(state.current_state, state.event_count),
                ))
            })
            .collect::<Result<Vec<_>, pcsc::Error>>()?;

        let result = self.context.get_status_change(timeout, &mut pcsc_states);

        for (state, pcsc_state) in states.iter_mut().zip(&pcsc_states) {
            state.event_state = pcsc_state.event_state();
            state.event_count = pcsc_state.event_count();
            state.atr = pcsc_state.atr().to_vec();
        }

        result
    }

    fn cancel(&self) -> Result<(), pcsc::Error> {
        self.context.cancel()
    }

    fn connect(
        &self,
        reader: &str,
        share_mode: ShareMode,
    ) -> Result<Box<dyn CardChannel>, pcsc::Error> {
        log::info!("Connecting to reader: {}", reader);

        let reader_cstr = reader_cstring(reader)?;
        let card = self
            .context
            .connect(&reader_cstr, share_mode, Protocols::ANY)?;

        log::info!("Successfully connected to reader: {}", reader);
        Ok(Box::new(PcscCardChannel {
            reader: reader.to_string(),
            card,
        }))
    }
}

/// Card handle opened through [`PcscContext::connect`]
pub struct PcscCardChannel {
    reader: String,
    card: Card,
}

impl CardChannel for PcscCardChannel {
    fn reader(&self) -> &str {
        &self.reader
    }

    fn status(&self) -> Result<Vec<u8>, pcsc::Error> {
        let status = self.card.status2_owned()?;
        Ok(status.atr().to_vec())
    }

    fn transmit(&self, apdu: &[u8]) -> Result<Vec<u8>, pcsc::Error> {
        let mut response_buf = [0; MAX_BUFFER_SIZE];
        let response = self.card.transmit(apdu, &mut response_buf)?;
        Ok(response.to_vec())
    }

    fn reconnect(
        &mut self,
        share_mode: ShareMode,
        initialization: Disposition,
    ) -> Result<(), pcsc::Error> {
        self.card.reconnect(share_mode, Protocols::ANY, initialization)
    }

    fn disconnect(self: Box<Self>, disposition: Disposition) -> Result<(), pcsc::Error> {
        self.card.disconnect(disposition).map_err(|(_card, err)| err)
    }
}

fn reader_cstring(name: &str) -> Result<CString, pcsc::Error> {
    CString::new(name).map_err(|_| pcsc::Error::InvalidParameter)
}

/// Put the event counter back in the upper 16 bits of the state word, the
/// service compares it to detect changes it already reported.
fn with_event_count(state: State, event_count: u32) -> State {
    let flags: u64 = u64::from(state.bits()) & 0xFFFF;
    match (flags | (u64::from(event_count) << 16)).try_into() {
        Ok(bits) => State::from_bits_retain(bits),
        Err(_) => state,
    }
}
