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
use serde::{Deserialize, Serialize};

use crate::midi::DEFAULT_BASE_NOTE;
use crate::triggerbox::{DataType, DEFAULT_TRIGGERS_PER_BOX};

/// A YAML representation of a trigger box configuration.
#[derive(Deserialize, Clone, Serialize, Debug)]
pub struct TriggerBoxConfig {
    /// The media type of the box's slots.
    #[serde(default)]
    data_type: DataType,

    /// Number of slots in the bank.
    #[serde(default = "default_slots")]
    slots: usize,

    /// The engine sample rate in Hz.
    #[serde(default = "default_sample_rate")]
    sample_rate: u32,

    /// The session tempo in beats per minute.
    #[serde(default = "default_tempo")]
    tempo: f64,

    /// The first MIDI note of the note-to-slot mapping.
    #[serde(default = "default_midi_base_note")]
    midi_base_note: u8,
}

fn default_slots() -> usize {
    DEFAULT_TRIGGERS_PER_BOX
}

fn default_sample_rate() -> u32 {
    48000
}

fn default_tempo() -> f64 {
    120.0
}

fn default_midi_base_note() -> u8 {
    DEFAULT_BASE_NOTE
}

impl Default for TriggerBoxConfig {
    fn default() -> Self {
        Self {
            data_type: DataType::Audio,
            slots: default_slots(),
            sample_rate: default_sample_rate(),
            tempo: default_tempo(),
            midi_base_note: default_midi_base_note(),
        }
    }
}

impl TriggerBoxConfig {
    /// Parses a configuration from YAML.
    pub fn from_yaml(yaml: &str) -> Result<Self, serde_yaml::Error> {
        serde_yaml::from_str(yaml)
    }

    /// Gets the media type of the box's slots.
    pub fn data_type(&self) -> DataType {
        self.data_type
    }

    /// Gets the number of slots in the bank.
    pub fn slots(&self) -> usize {
        self.slots
    }

    /// Gets the engine sample rate.
    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    /// Gets the session tempo.
    pub fn tempo(&self) -> f64 {
        self.tempo
    }

    /// Gets the first mapped MIDI note.
    pub fn midi_base_note(&self) -> u8 {
        self.midi_base_note
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = TriggerBoxConfig::default();
        assert_eq!(config.data_type(), DataType::Audio);
        assert_eq!(config.slots(), 8);
        assert_eq!(config.sample_rate(), 48000);
        assert_eq!(config.tempo(), 120.0);
        assert_eq!(config.midi_base_note(), 60);
    }

    #[test]
    fn test_parse_partial_yaml() {
        let config = TriggerBoxConfig::from_yaml("slots: 16\ntempo: 98.5\n").unwrap();
        assert_eq!(config.slots(), 16);
        assert_eq!(config.tempo(), 98.5);
        // Unspecified fields fall back to defaults.
        assert_eq!(config.sample_rate(), 48000);
        assert_eq!(config.midi_base_note(), 60);
    }

    #[test]
    fn test_parse_data_type() {
        let config = TriggerBoxConfig::from_yaml("data_type: midi\n").unwrap();
        assert_eq!(config.data_type(), DataType::Midi);
    }
}
