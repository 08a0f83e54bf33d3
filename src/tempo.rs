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

//! Musical time: beats, quantization grids, and the tempo map.
//!
//! The engine asks exactly three questions of the tempo map: what beat a
//! sample position falls on, what sample a beat position falls on, and how
//! many samples a grid interval spans. Beats are integer tick counts so
//! grid snapping is exact.

use std::fmt;
use std::str::FromStr;

use serde::de::Error as DeError;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Ticks per quarter-note beat.
pub const TICKS_PER_BEAT: i64 = 1920;

/// Errors from musical-time operations.
#[derive(Debug, thiserror::Error)]
pub enum TempoError {
    /// Bar-level quantization is not implemented; offsets with `bars > 0`
    /// are rejected rather than silently ignored.
    #[error("bar-level quantization is not supported: {0}")]
    BarQuantization(BbtOffset),

    #[error("malformed bbt offset {0:?}, expected \"bars|beats|ticks\"")]
    MalformedOffset(String),
}

/// A position or distance in musical time, stored as integer ticks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub struct Beats(i64);

impl Beats {
    /// Zero beats.
    pub const ZERO: Beats = Beats(0);

    /// Creates a beat value from whole beats and leftover ticks.
    pub fn new(beats: i64, ticks: i64) -> Self {
        Beats(beats * TICKS_PER_BEAT + ticks)
    }

    /// Creates a beat value from raw ticks.
    pub fn from_ticks(ticks: i64) -> Self {
        Beats(ticks)
    }

    /// The raw tick count.
    pub fn ticks(&self) -> i64 {
        self.0
    }

    /// Snaps this position up to the next multiple of `grid`. A position
    /// already on the grid stays where it is; with a zero grid the position
    /// is returned unchanged.
    pub fn snap_up(&self, grid: Beats) -> Beats {
        if grid.0 <= 0 {
            return *self;
        }
        Beats(self.0.div_euclid(grid.0) * grid.0
            + if self.0.rem_euclid(grid.0) == 0 { 0 } else { grid.0 })
    }
}

impl fmt::Display for Beats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.0 / TICKS_PER_BEAT, self.0 % TICKS_PER_BEAT)
    }
}

/// A quantization grid expressed as (bars, beats, ticks).
///
/// Only `(0, beats, ticks)` grids are honored; constructors accept any
/// value but [`BbtOffset::validate`] rejects bar-level offsets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BbtOffset {
    pub bars: i32,
    pub beats: i32,
    pub ticks: i32,
}

impl BbtOffset {
    /// A zero offset, meaning "no grid": starts and stops are immediate.
    pub const ZERO: BbtOffset = BbtOffset {
        bars: 0,
        beats: 0,
        ticks: 0,
    };

    /// Creates an offset.
    pub fn new(bars: i32, beats: i32, ticks: i32) -> Self {
        Self { bars, beats, ticks }
    }

    /// Returns true if this offset expresses no grid at all.
    pub fn is_zero(&self) -> bool {
        *self == Self::ZERO
    }

    /// Rejects offsets the engine cannot honor.
    pub fn validate(&self) -> Result<(), TempoError> {
        if self.bars > 0 {
            return Err(TempoError::BarQuantization(*self));
        }
        Ok(())
    }

    /// The beat-and-tick portion of this offset as a tick count.
    pub fn as_beats(&self) -> Beats {
        Beats::new(self.beats as i64, self.ticks as i64)
    }
}

impl fmt::Display for BbtOffset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}|{}|{}", self.bars, self.beats, self.ticks)
    }
}

impl FromStr for BbtOffset {
    type Err = TempoError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.split('|');
        let mut next = || {
            parts
                .next()
                .and_then(|p| p.trim().parse::<i32>().ok())
                .ok_or_else(|| TempoError::MalformedOffset(s.to_string()))
        };
        let offset = BbtOffset::new(next()?, next()?, next()?);
        if parts.next().is_some() {
            return Err(TempoError::MalformedOffset(s.to_string()));
        }
        Ok(offset)
    }
}

// Persisted as the string form "bars|beats|ticks".
impl Serialize for BbtOffset {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for BbtOffset {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(DeError::custom)
    }
}

/// A constant-tempo map converting between sample positions and beats.
///
/// The surrounding application may hold a far richer tempo model; the
/// engine only needs these conversions at slice edges.
#[derive(Debug, Clone, Copy)]
pub struct TempoMap {
    bpm: f64,
    sample_rate: u32,
}

impl TempoMap {
    /// Creates a tempo map at the given tempo and sample rate.
    pub fn new(bpm: f64, sample_rate: u32) -> Self {
        Self { bpm, sample_rate }
    }

    /// The tempo in beats per minute.
    pub fn bpm(&self) -> f64 {
        self.bpm
    }

    /// The sample rate in Hz.
    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    /// Samples per quarter-note beat at this tempo.
    pub fn samples_per_beat(&self) -> f64 {
        self.sample_rate as f64 * 60.0 / self.bpm
    }

    /// The musical position of a sample position.
    pub fn beats_at_sample(&self, sample: u64) -> Beats {
        let ticks = sample as f64 * TICKS_PER_BEAT as f64 / self.samples_per_beat();
        Beats::from_ticks(ticks.round() as i64)
    }

    /// The sample position of a musical position.
    pub fn sample_at_beats(&self, beats: Beats) -> u64 {
        let samples = beats.ticks() as f64 * self.samples_per_beat() / TICKS_PER_BEAT as f64;
        samples.round().max(0.0) as u64
    }

    /// The length in samples of one grid interval.
    pub fn grid_samples(&self, grid: BbtOffset) -> u64 {
        self.sample_at_beats(grid.as_beats())
    }
}
