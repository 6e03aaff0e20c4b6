use std::time::Duration;

use thiserror::Error;

/// Errors raised by the monitoring engine, the connection manager and the
/// status-word catalog.
#[derive(Debug, Error)]
pub enum SmartcardError {
    #[error("Failed to establish context: {0}")]
    EstablishContext(pcsc::Error),

    #[error("Unable to list readers: {0}")]
    ListReaders(pcsc::Error),

    #[error("Unable to get status change: {0}")]
    StatusChange(pcsc::Error),

    #[error("Failed to start polling thread: {0}")]
    Thread(#[from] std::io::Error),

    #[error("No matching card within {0:?}")]
    NoMatchingCard(Duration),

    #[error("No active card session")]
    NoSession,

    #[error("Card connectivity lost: {0}")]
    ConnectivityLost(pcsc::Error),

    #[error("Card operation failed: {0}")]
    Card(pcsc::Error),

    #[error("Invalid status word table: {0}")]
    Catalog(String),

    #[error("Invalid APDU: {0}")]
    InvalidApdu(String),

    #[error("Unknown card (wrong index {0})")]
    UnknownCardIndex(usize),
}

impl SmartcardError {
    /// Classify an error returned by an open card channel.
    ///
    /// Codes meaning the card is no longer reachable become
    /// [`SmartcardError::ConnectivityLost`], everything else stays a plain
    /// card failure.
    pub fn from_card(err: pcsc::Error) -> Self {
        match err {
            pcsc::Error::RemovedCard
            | pcsc::Error::NoSmartcard
            | pcsc::Error::UnpoweredCard
            | pcsc::Error::UnresponsiveCard
            | pcsc::Error::ReaderUnavailable => SmartcardError::ConnectivityLost(err),
            other => SmartcardError::Card(other),
        }
    }

    /// Whether this error means the physical card went away.
    pub fn is_connectivity_lost(&self) -> bool {
        matches!(self, SmartcardError::ConnectivityLost(_))
    }
}

pub type Result<T, E = SmartcardError> = std::result::Result<T, E>;
