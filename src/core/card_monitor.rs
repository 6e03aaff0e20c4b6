use pcsc::State;
use serde::Serialize;

use crate::core::backend::ReaderState;
use crate::core::monitor::{DeviceMonitor, MonitorKind};
use crate::core::utils::{format_hex, serialize_hex};

/// A card sitting in a reader.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Card {
    pub reader: String,
    #[serde(serialize_with = "serialize_hex")]
    pub atr: Vec<u8>,
}

impl Card {
    pub fn new(reader: impl Into<String>, atr: impl Into<Vec<u8>>) -> Self {
        Self {
            reader: reader.into(),
            atr: atr.into(),
        }
    }
}

impl std::fmt::Display for Card {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} [{}]", format_hex(&self.atr), self.reader)
    }
}

/// Cards inserted and removed during one poll cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CardEvent {
    pub added: Vec<Card>,
    pub removed: Vec<Card>,
}

impl CardEvent {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty()
    }
}

/// Cards currently known to the card monitors, at most one per reader.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CardInventory {
    cards: Vec<Card>,
}

impl CardInventory {
    pub fn cards(&self) -> &[Card] {
        &self.cards
    }

    pub fn get(&self, reader: &str) -> Option<&Card> {
        self.cards.iter().find(|card| card.reader == reader)
    }

    fn take(&mut self, reader: &str) -> Option<Card> {
        let index = self.cards.iter().position(|card| card.reader == reader)?;
        Some(self.cards.remove(index))
    }
}

impl MonitorKind for CardInventory {
    type Event = CardEvent;
    const LABEL: &'static str = "card";

    fn diff(&mut self, states: &[ReaderState]) -> Option<CardEvent> {
        let mut event = CardEvent::default();

        for state in states
            .iter()
            .filter(|state| state.is_changed() && !state.is_notification())
        {
            let flags = state.event_state;

            if state.has_card() {
                match self.cards.iter_mut().find(|card| card.reader == state.name) {
                    Some(card) if card.atr == state.atr => {}
                    Some(card) => {
                        // Swapped between two polls: the new card replaces the old one
                        card.atr = state.atr.clone();
                        log::debug!("card replaced: {}", card);
                        event.added.push(card.clone());
                    }
                    None => {
                        let card = Card::new(state.name.as_str(), state.atr.as_slice());
                        log::debug!("card added: {}", card);
                        self.cards.push(card.clone());
                        event.added.push(card);
                    }
                }
            } else if flags.intersects(State::EMPTY | State::UNKNOWN | State::IGNORE | State::UNAVAILABLE)
            {
                if let Some(card) = self.take(&state.name) {
                    log::debug!("card removed: {}", card);
                    event.removed.push(card);
                }
            }
        }

        (!event.is_empty()).then_some(event)
    }
}

/// Monitor publishing [`CardEvent`]s.
pub type CardMonitor = DeviceMonitor<CardInventory>;

#[cfg(test)]
mod tests {
    use super::*;

    const ATR: [u8; 4] = [0x3B, 0x65, 0x00, 0x00];

    fn changed(name: &str, flags: State, atr: &[u8]) -> ReaderState {
        let mut state = ReaderState::new(name);
        state.event_state = flags | State::CHANGED;
        state.atr = atr.to_vec();
        state
    }

    #[test]
    fn test_card_insertion_then_removal() {
        let mut inventory = CardInventory::default();

        let event = inventory
            .diff(&[changed("ACS1", State::PRESENT, &ATR)])
            .unwrap();
        assert_eq!(event.added, vec![Card::new("ACS1", ATR)]);
        assert!(event.removed.is_empty());
        assert!(inventory.get("ACS1").is_some());

        let event = inventory.diff(&[changed("ACS1", State::EMPTY, &[])]).unwrap();
        assert!(event.added.is_empty());
        assert_eq!(event.removed, vec![Card::new("ACS1", ATR)]);
        assert!(inventory.cards().is_empty());
    }

    #[test]
    fn test_mute_card_with_atr_is_added() {
        let mut inventory = CardInventory::default();
        let event = inventory.diff(&[changed("ACS1", State::MUTE, &ATR)]).unwrap();
        assert_eq!(event.added.len(), 1);
    }

    #[test]
    fn test_present_without_atr_is_ignored() {
        let mut inventory = CardInventory::default();
        assert!(inventory.diff(&[changed("ACS1", State::PRESENT, &[])]).is_none());
    }

    #[test]
    fn test_empty_reader_without_record_is_silent() {
        let mut inventory = CardInventory::default();
        assert!(inventory.diff(&[changed("ACS1", State::EMPTY, &[])]).is_none());
    }

    #[test]
    fn test_unchanged_entries_are_skipped() {
        let mut inventory = CardInventory::default();
        let mut state = changed("ACS1", State::PRESENT, &ATR);
        state.event_state = State::PRESENT;
        assert!(inventory.diff(&[state]).is_none());
    }

    #[test]
    fn test_known_card_is_not_reported_twice() {
        let mut inventory = CardInventory::default();
        inventory.diff(&[changed("ACS1", State::PRESENT, &ATR)]);
        assert!(inventory
            .diff(&[changed("ACS1", State::PRESENT | State::INUSE, &ATR)])
            .is_none());
    }

    #[test]
    fn test_unreachable_reader_removes_its_own_card() {
        let mut inventory = CardInventory::default();
        inventory.diff(&[
            changed("ACS1", State::PRESENT, &ATR),
            changed("ACS2", State::PRESENT, &[0x3B, 0x00]),
        ]);

        let event = inventory
            .diff(&[
                changed("ACS2", State::UNKNOWN, &[]),
                changed("ACS1", State::PRESENT, &ATR),
            ])
            .unwrap();
        assert!(event.added.is_empty());
        assert_eq!(event.removed, vec![Card::new("ACS2", [0x3B, 0x00])]);
        assert_eq!(inventory.cards(), &[Card::new("ACS1", ATR)]);
    }

    #[test]
    fn test_swapped_card_replaces_record() {
        let mut inventory = CardInventory::default();
        inventory.diff(&[changed("ACS1", State::PRESENT, &ATR)]);

        let event = inventory
            .diff(&[changed("ACS1", State::PRESENT, &[0x3B, 0x01])])
            .unwrap();
        assert_eq!(event.added, vec![Card::new("ACS1", [0x3B, 0x01])]);
        assert_eq!(inventory.cards().len(), 1);
    }

    #[test]
    fn test_notification_entry_is_ignored() {
        let mut inventory = CardInventory::default();
        let mut pnp = ReaderState::notification();
        pnp.event_state = State::CHANGED | State::PRESENT;
        pnp.atr = ATR.to_vec();
        assert!(inventory.diff(&[pnp]).is_none());
    }

    #[test]
    fn test_card_event_json() {
        let event = CardEvent {
            added: vec![Card::new("ACS1", ATR)],
            removed: Vec::new(),
        };
        let json = serde_json::to_string(&event).unwrap();
        assert_eq!(
            json,
            r#"{"added":[{"reader":"ACS1","atr":"3B650000"}],"removed":[]}"#
        );
    }
}
