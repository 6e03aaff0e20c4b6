/// Smartcard Control - PC/SC reader and card monitoring
///
/// This library watches readers and cards through background pollers,
/// manages a single card session at a time and explains ISO 7816-4
/// status words.
pub mod cli;
pub mod core;

// Re-export commonly used types
pub use crate::core::{
    apdu::{describe_response, ApduResponse},
    backend::{DeviceStatusBackend, ReaderState},
    card_monitor::{Card, CardEvent, CardMonitor},
    connection::{CardConnectionManager, CardType, ConnectionEvent, ConnectionSettings},
    devices::DeviceList,
    error::SmartcardError,
    observable::{event_channel, Observer},
    pcsc_backend::PcscBackend,
    reader_monitor::{ReaderEvent, ReaderMonitor},
    status_words::StatusWordCatalog,
    utils::{format_hex, parse_hex},
};

// Common error type
pub type Result<T> = anyhow::Result<T>;
