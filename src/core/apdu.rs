//! APDU helpers: response splitting, diagnosis and the predefined PIN
//! commands offered by the interactive menu.

use crate::core::error::{Result, SmartcardError};
use crate::core::status_words::StatusWordCatalog;
use crate::core::utils::format_hex_spaced;

pub const PIN_1234: [u8; 5] = [0x04, 0x01, 0x02, 0x03, 0x04];
pub const PIN_9876: [u8; 5] = [0x04, 0x09, 0x08, 0x07, 0x06];
pub const PIN_PADDING: [u8; 11] = [0xFF; 11];

/// VERIFY header (CLA INS P1 P2).
pub const VERIFY_HEADER: [u8; 4] = [0x80, 0x20, 0x00, 0x00];
/// CHANGE REFERENCE DATA header (CLA INS P1 P2).
pub const MODIFY_HEADER: [u8; 4] = [0x80, 0x24, 0x00, 0x00];

/// Split response of a card.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApduResponse {
    pub data: Vec<u8>,
    pub sw1: u8,
    pub sw2: u8,
}

impl ApduResponse {
    /// Split `raw` into payload and the two trailing status bytes.
    pub fn from_raw(raw: &[u8]) -> Result<Self> {
        match raw {
            [data @ .., sw1, sw2] => Ok(Self {
                data: data.to_vec(),
                sw1: *sw1,
                sw2: *sw2,
            }),
            _ => Err(SmartcardError::InvalidApdu(format!(
                "response too short: {} byte(s)",
                raw.len()
            ))),
        }
    }

    pub fn status_word(&self) -> u16 {
        u16::from_be_bytes([self.sw1, self.sw2])
    }

    /// `90 00`, or `61 xx` (more data available).
    pub fn is_success(&self) -> bool {
        matches!((self.sw1, self.sw2), (0x90, 0x00) | (0x61, _))
    }

    /// Diagnosis from the global status word table, or the raw status bytes
    /// when the table has no entry for them.
    pub fn describe(&self) -> String {
        self.describe_with(StatusWordCatalog::global())
    }

    pub fn describe_with(&self, catalog: &StatusWordCatalog) -> String {
        catalog
            .format_bytes(self.sw1, self.sw2, Some(&self.data))
            .unwrap_or_else(|| {
                let mut text = format!(
                    "response (unknown status word)\n\tsw1 : {:02X}\n\tsw2 : {:02X}",
                    self.sw1, self.sw2
                );
                if !self.data.is_empty() {
                    text.push_str(&format!("\n\tmessage : {}", format_hex_spaced(&self.data)));
                }
                text
            })
    }
}

/// Diagnosis of a raw response, see [`ApduResponse::describe`].
pub fn describe_response(raw: &[u8]) -> String {
    match ApduResponse::from_raw(raw) {
        Ok(response) => response.describe(),
        Err(err) => format!("{} ({})", err, format_hex_spaced(raw)),
    }
}

/// Build `CLA INS P1 P2 [Lc DATA] [Le]` (short APDU).
pub fn build_command(header: [u8; 4], data: &[u8], le: Option<u8>) -> Result<Vec<u8>> {
    let lc = u8::try_from(data.len()).map_err(|_| {
        SmartcardError::InvalidApdu(format!("data too long: {} bytes", data.len()))
    })?;

    let mut apdu = header.to_vec();
    if lc > 0 {
        apdu.push(lc);
        apdu.extend_from_slice(data);
    }
    if let Some(le) = le {
        apdu.push(le);
    }
    Ok(apdu)
}

fn verify(lc: u8, data: &[u8]) -> Vec<u8> {
    let mut apdu = VERIFY_HEADER.to_vec();
    apdu.push(lc);
    apdu.extend_from_slice(data);
    apdu
}

fn padded(pin: &[u8]) -> Vec<u8> {
    [pin, &PIN_PADDING[..]].concat()
}

fn modify(old: &[u8], new: &[u8]) -> Vec<u8> {
    let mut apdu = MODIFY_HEADER.to_vec();
    apdu.push(0x20);
    apdu.extend(padded(old));
    apdu.extend(padded(new));
    apdu
}

/// A test command of the transmit menu.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PredefinedCommand {
    pub label: &'static str,
    pub apdu: Vec<u8>,
}

/// VERIFY and CHANGE REFERENCE DATA commands exercising PIN handling,
/// including deliberately malformed ones.
pub fn predefined_commands() -> Vec<PredefinedCommand> {
    let command = |label, apdu| PredefinedCommand { label, apdu };
    vec![
        // Lc announces 21 bytes, 16 follow
        command("verify wrong sized pin", verify(0x15, &padded(&PIN_1234))),
        command(
            "verify wrong formatted pin",
            verify(
                0x10,
                &[
                    0x04, 0x01, 0x02, 0x03, 0x04, 0x40, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF,
                    0xAA, 0xFF, 0xFF,
                ],
            ),
        ),
        command(
            "verify wrong pin",
            verify(0x10, &padded(&[0x04, 0x01, 0x02, 0x04, 0x04])),
        ),
        command("verify pin is 1234", verify(0x10, &padded(&PIN_1234))),
        command("verify pin is 9876", verify(0x10, &padded(&PIN_9876))),
        command("modify pin from 1234 to 1234", modify(&PIN_1234, &PIN_1234)),
        command("modify pin from 1234 to 9876", modify(&PIN_1234, &PIN_9876)),
        command("modify pin from 9876 to 1234", modify(&PIN_9876, &PIN_1234)),
    ]
}
