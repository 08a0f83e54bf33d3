// Copyright (C) 2026 Michael Wilson <mike@mdwn.dev>
//
// This program is free software: you can redistribute it and/or modify it under
// the terms of the GNU General Public License as published by the Free Software
// Foundation, version 3.
//
// This program is distributed in the hope that it will be useful, but WITHOUT
// ANY WARRANTY; without even the implied warranty of MERCHANTABILITY or FITNESS
// FOR A PARTICULAR PURPOSE. See the GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License along with
// this program. If not, see <https://www.gnu.org/licenses/>.
//

//! MIDI note to slot mapping.
//!
//! Note-on bangs the mapped slot, note-off unbangs it. Velocity is ignored
//! by the state machine (consumers may use it for gain). Everything that is
//! not a note message is dropped.

use std::collections::HashMap;

use midly::live::LiveEvent;
use midly::MidiMessage;

/// The default first mapped note (middle C).
pub const DEFAULT_BASE_NOTE: u8 = 60;

/// The default number of mapped notes.
pub const DEFAULT_MAPPED_NOTES: u8 = 10;

/// A note stimulus extracted from a raw MIDI event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NoteStimulus {
    /// Note-on for the given note number.
    On(u8),
    /// Note-off (or note-on with velocity zero) for the given note number.
    Off(u8),
}

/// Classifies a raw MIDI event as a note stimulus, dropping everything else.
pub fn classify(raw: &[u8]) -> Option<NoteStimulus> {
    let event = LiveEvent::parse(raw).ok()?;
    let LiveEvent::Midi { message, .. } = event else {
        return None;
    };
    match message {
        MidiMessage::NoteOn { key, vel } if u8::from(vel) == 0 => {
            // Note-on with velocity zero is a note-off.
            Some(NoteStimulus::Off(u8::from(key)))
        }
        MidiMessage::NoteOn { key, .. } => Some(NoteStimulus::On(u8::from(key))),
        MidiMessage::NoteOff { key, .. } => Some(NoteStimulus::Off(u8::from(key))),
        _ => None,
    }
}

/// A fixed mapping from MIDI note numbers to slot indices.
#[derive(Debug, Clone)]
pub struct MidiTriggerMap {
    map: HashMap<u8, usize>,
}

impl MidiTriggerMap {
    /// Creates the default mapping: ten notes upward from `base_note`,
    /// mapped to slots 0..10.
    pub fn with_base_note(base_note: u8) -> Self {
        let mut map = HashMap::new();
        for n in 0..DEFAULT_MAPPED_NOTES {
            if let Some(note) = base_note.checked_add(n) {
                map.insert(note, n as usize);
            }
        }
        Self { map }
    }

    /// Creates an empty mapping.
    pub fn empty() -> Self {
        Self {
            map: HashMap::new(),
        }
    }

    /// Maps `note` to `slot`, replacing any previous mapping for that note.
    pub fn map_note(&mut self, note: u8, slot: usize) {
        self.map.insert(note, slot);
    }

    /// The slot a note is mapped to, if any.
    pub fn slot_for_note(&self, note: u8) -> Option<usize> {
        self.map.get(&note).copied()
    }
}

impl Default for MidiTriggerMap {
    fn default() -> Self {
        Self::with_base_note(DEFAULT_BASE_NOTE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn note_on(note: u8, vel: u8) -> Vec<u8> {
        vec![0x90, note, vel]
    }

    fn note_off(note: u8) -> Vec<u8> {
        vec![0x80, note, 64]
    }

    #[test]
    fn test_classify_notes() {
        assert_eq!(classify(&note_on(60, 100)), Some(NoteStimulus::On(60)));
        assert_eq!(classify(&note_off(61)), Some(NoteStimulus::Off(61)));
        // Velocity-zero note-on is a note-off.
        assert_eq!(classify(&note_on(62, 0)), Some(NoteStimulus::Off(62)));
    }

    #[test]
    fn test_classify_drops_non_notes() {
        // Controller change.
        assert_eq!(classify(&[0xB0, 1, 64]), None);
        // Program change.
        assert_eq!(classify(&[0xC0, 5]), None);
        // Garbage.
        assert_eq!(classify(&[0xFF]), None);
        assert_eq!(classify(&[]), None);
    }

    #[test]
    fn test_default_map() {
        let map = MidiTriggerMap::default();
        assert_eq!(map.slot_for_note(60), Some(0));
        assert_eq!(map.slot_for_note(69), Some(9));
        assert_eq!(map.slot_for_note(59), None);
        assert_eq!(map.slot_for_note(70), None);
    }

    #[test]
    fn test_remapping_replaces() {
        let mut map = MidiTriggerMap::empty();
        map.map_note(36, 0);
        map.map_note(36, 3);
        assert_eq!(map.slot_for_note(36), Some(3));
    }
}
