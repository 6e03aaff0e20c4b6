pub mod apdu;
pub mod backend;
pub mod card_monitor;
pub mod connection;
pub mod devices;
pub mod error;
pub mod monitor;
pub mod observable;
pub mod pcsc_backend;
pub mod reader_monitor;
pub mod status_words;
pub mod utils;
