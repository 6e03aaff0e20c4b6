use pcsc::State;
use serde::Serialize;

use crate::core::backend::ReaderState;
use crate::core::monitor::{DeviceMonitor, MonitorKind};

/// Readers plugged and unplugged during one poll cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReaderEvent {
    pub added: Vec<String>,
    pub removed: Vec<String>,
}

impl ReaderEvent {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty()
    }
}

/// Readers currently known to the reader monitors.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReaderInventory {
    readers: Vec<String>,
}

impl ReaderInventory {
    pub fn readers(&self) -> &[String] {
        &self.readers
    }

    pub fn contains(&self, reader: &str) -> bool {
        self.readers.iter().any(|name| name == reader)
    }
}

impl MonitorKind for ReaderInventory {
    type Event = ReaderEvent;
    const LABEL: &'static str = "reader";

    fn diff(&mut self, states: &[ReaderState]) -> Option<ReaderEvent> {
        let mut event = ReaderEvent::default();

        for state in states.iter().filter(|state| state.is_changed()) {
            let unreachable = state
                .event_state
                .intersects(State::UNKNOWN | State::IGNORE | State::UNAVAILABLE);

            if unreachable {
                if self.contains(&state.name) {
                    log::debug!("reader removed: {}", state.name);
                    self.readers.retain(|name| name != &state.name);
                    event.removed.push(state.name.clone());
                }
            } else if !state.is_notification() && !self.contains(&state.name) {
                log::debug!("reader added: {}", state.name);
                self.readers.push(state.name.clone());
                event.added.push(state.name.clone());
            }
        }

        (!event.is_empty()).then_some(event)
    }
}

/// Monitor publishing [`ReaderEvent`]s.
pub type ReaderMonitor = DeviceMonitor<ReaderInventory>;

#[cfg(test)]
mod tests {
    use super::*;

    fn changed(name: &str, flags: State) -> ReaderState {
        let mut state = ReaderState::new(name);
        state.event_state = flags | State::CHANGED;
        state
    }

    #[test]
    fn test_reader_added_then_removed() {
        let mut inventory = ReaderInventory::default();

        let event = inventory.diff(&[changed("ACS1", State::EMPTY)]).unwrap();
        assert_eq!(event.added, vec!["ACS1".to_string()]);
        assert!(inventory.contains("ACS1"));

        assert!(inventory.diff(&[changed("ACS1", State::PRESENT)]).is_none());

        let event = inventory.diff(&[changed("ACS1", State::UNKNOWN)]).unwrap();
        assert_eq!(event.removed, vec!["ACS1".to_string()]);
        assert!(inventory.readers().is_empty());
    }

    #[test]
    fn test_notification_entry_is_never_reported() {
        let mut inventory = ReaderInventory::default();
        let mut pnp = ReaderState::notification();
        pnp.event_state = State::CHANGED;
        assert!(inventory.diff(&[pnp.clone()]).is_none());

        pnp.event_state = State::CHANGED | State::UNKNOWN;
        assert!(inventory.diff(&[pnp]).is_none());
    }

    #[test]
    fn test_unknown_reader_without_record_is_not_added() {
        let mut inventory = ReaderInventory::default();
        assert!(inventory
            .diff(&[changed("Ghost", State::UNAVAILABLE)])
            .is_none());
        assert!(!inventory.contains("Ghost"));
    }

    #[test]
    fn test_empty_snapshot_produces_nothing() {
        let mut inventory = ReaderInventory::default();
        assert!(inventory.diff(&[]).is_none());
    }
}
