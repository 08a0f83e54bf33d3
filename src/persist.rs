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

//! Snapshot and restore of the trigger bank.
//!
//! Only behavioral fields are persisted: launch policy, follow actions,
//! quantization, names, and region references (by id) with each clip's
//! start/length window. Live playback state (cursors, wait flags, queues)
//! never round-trips.

use serde::{Deserialize, Serialize};

use crate::tempo::BbtOffset;
use crate::trigger::{FollowAction, LaunchStyle};
use crate::triggerbox::DataType;

/// Errors from serializing or parsing snapshots.
#[derive(Debug, thiserror::Error)]
pub enum PersistError {
    #[error("snapshot serialization failed: {0}")]
    Serialize(#[source] serde_yaml::Error),

    #[error("snapshot parse failed: {0}")]
    Parse(#[source] serde_yaml::Error),
}

/// The persisted state of one slot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TriggerSnapshot {
    pub index: usize,
    pub name: String,
    pub legato: bool,
    pub launch_style: LaunchStyle,
    pub follow_action_0: FollowAction,
    pub follow_action_1: FollowAction,
    pub follow_action_probability: u8,
    pub quantization: BbtOffset,
    /// Region reference by id; resolved by the caller on restore.
    pub region: Option<String>,
    /// Clip start offset in samples.
    #[serde(default)]
    pub start: u64,
    /// Clip usable length in samples.
    #[serde(default)]
    pub length: u64,
}

/// The persisted state of the whole bank.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TriggerBoxSnapshot {
    pub data_type: DataType,
    pub triggers: Vec<TriggerSnapshot>,
}

impl TriggerBoxSnapshot {
    /// Serializes the snapshot to YAML.
    pub fn to_yaml(&self) -> Result<String, PersistError> {
        serde_yaml::to_string(self).map_err(PersistError::Serialize)
    }

    /// Parses a snapshot from YAML.
    pub fn from_yaml(yaml: &str) -> Result<Self, PersistError> {
        serde_yaml::from_str(yaml).map_err(PersistError::Parse)
    }
}
