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

//! Audio regions: the narrow source abstraction the engine loads clips from.
//!
//! A region exposes channel count, length, and a per-channel read. Slots
//! accept a [`Region`], which is either audio or the (unrealized) MIDI
//! placeholder; clip loading checks the variant explicitly and rejects
//! non-audio media.

use std::fmt;
use std::path::Path;
use std::sync::Arc;

use hound::{SampleFormat, WavReader};
use tracing::info;

use crate::util::filename_display;

/// Errors raised while reading region data.
#[derive(Debug, thiserror::Error)]
pub enum RegionError {
    #[error("WAV file error: {0}")]
    Wav(#[from] hound::Error),

    #[error("unsupported bit depth: {0}")]
    UnsupportedBitDepth(u16),

    #[error("read past region end: offset {offset} length {length}")]
    ReadPastEnd { offset: u64, length: u64 },

    #[error("no such channel: {0}")]
    NoSuchChannel(usize),

    #[error("region holds no audio data")]
    Empty,
}

/// A source of deinterleaved audio the engine can pull clip data from.
pub trait AudioRegion: Send + Sync {
    /// A stable identifier used by persistence to reference this region.
    fn id(&self) -> &str;

    /// A human-readable name.
    fn name(&self) -> &str;

    /// Number of audio channels.
    fn n_channels(&self) -> usize;

    /// Length of the region in samples per channel.
    fn length_samples(&self) -> u64;

    /// Reads up to `dst.len()` samples of `channel` starting at `offset`.
    /// Returns the number of samples read.
    fn read(&self, dst: &mut [f32], offset: u64, channel: usize) -> Result<usize, RegionError>;
}

/// The media a slot can hold.
#[derive(Clone)]
pub enum Region {
    /// An audio region.
    Audio(Arc<dyn AudioRegion>),
    /// MIDI slot media. The variant exists so the bank can model MIDI
    /// slots, but playback is not realized.
    Midi,
}

impl fmt::Debug for Region {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Region::Audio(r) => f
                .debug_struct("Region::Audio")
                .field("id", &r.id())
                .field("channels", &r.n_channels())
                .field("length", &r.length_samples())
                .finish(),
            Region::Midi => write!(f, "Region::Midi"),
        }
    }
}

/// An in-memory region, planar storage.
pub struct MemoryRegion {
    id: String,
    name: String,
    channels: Vec<Vec<f32>>,
}

impl MemoryRegion {
    /// Creates a region from planar channel data.
    pub fn new(id: impl Into<String>, channels: Vec<Vec<f32>>) -> Result<Self, RegionError> {
        if channels.is_empty() || channels[0].is_empty() {
            return Err(RegionError::Empty);
        }
        let id = id.into();
        Ok(Self {
            name: id.clone(),
            id,
            channels,
        })
    }
}

impl AudioRegion for MemoryRegion {
    fn id(&self) -> &str {
        &self.id
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn n_channels(&self) -> usize {
        self.channels.len()
    }

    fn length_samples(&self) -> u64 {
        self.channels[0].len() as u64
    }

    fn read(&self, dst: &mut [f32], offset: u64, channel: usize) -> Result<usize, RegionError> {
        let data = self
            .channels
            .get(channel)
            .ok_or(RegionError::NoSuchChannel(channel))?;
        if offset > data.len() as u64 {
            return Err(RegionError::ReadPastEnd {
                offset,
                length: data.len() as u64,
            });
        }
        let start = offset as usize;
        let n = dst.len().min(data.len() - start);
        dst[..n].copy_from_slice(&data[start..start + n]);
        Ok(n)
    }
}

/// A region backed by a WAV file, fully decoded into memory at load time
/// for zero-latency playback.
pub struct WavRegion {
    id: String,
    name: String,
    channels: Vec<Vec<f32>>,
}

impl WavRegion {
    /// Loads a WAV file, scaling integer formats into `[-1.0, 1.0]`.
    pub fn from_path(path: &Path) -> Result<Self, RegionError> {
        let mut reader = WavReader::open(path)?;
        let spec = reader.spec();
        let n_channels = spec.channels as usize;

        let interleaved: Vec<f32> = match (spec.sample_format, spec.bits_per_sample) {
            (SampleFormat::Float, 32) => reader
                .samples::<f32>()
                .collect::<Result<Vec<_>, _>>()?,
            (SampleFormat::Int, 16) => reader
                .samples::<i16>()
                .map(|s| s.map(|s| s as f32 / 32768.0))
                .collect::<Result<Vec<_>, _>>()?,
            (SampleFormat::Int, 24) => reader
                .samples::<i32>()
                .map(|s| s.map(|s| s as f32 / 8388608.0))
                .collect::<Result<Vec<_>, _>>()?,
            (SampleFormat::Int, 32) => reader
                .samples::<i32>()
                .map(|s| s.map(|s| s as f32 / 2147483648.0))
                .collect::<Result<Vec<_>, _>>()?,
            (_, bits) => return Err(RegionError::UnsupportedBitDepth(bits)),
        };

        if interleaved.is_empty() || n_channels == 0 {
            return Err(RegionError::Empty);
        }

        // Deinterleave into planar storage.
        let frames = interleaved.len() / n_channels;
        let mut channels = vec![Vec::with_capacity(frames); n_channels];
        for frame in interleaved.chunks_exact(n_channels) {
            for (channel, sample) in channels.iter_mut().zip(frame) {
                channel.push(*sample);
            }
        }

        let name = filename_display(path).to_string();
        info!(
            path = ?path,
            channels = n_channels,
            frames,
            sample_rate = spec.sample_rate,
            "Loaded WAV region"
        );

        Ok(Self {
            id: path.to_string_lossy().to_string(),
            name,
            channels,
        })
    }
}

impl AudioRegion for WavRegion {
    fn id(&self) -> &str {
        &self.id
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn n_channels(&self) -> usize {
        self.channels.len()
    }

    fn length_samples(&self) -> u64 {
        self.channels[0].len() as u64
    }

    fn read(&self, dst: &mut [f32], offset: u64, channel: usize) -> Result<usize, RegionError> {
        let data = self
            .channels
            .get(channel)
            .ok_or(RegionError::NoSuchChannel(channel))?;
        if offset > data.len() as u64 {
            return Err(RegionError::ReadPastEnd {
                offset,
                length: data.len() as u64,
            });
        }
        let start = offset as usize;
        let n = dst.len().min(data.len() - start);
        dst[..n].copy_from_slice(&data[start..start + n]);
        Ok(n)
    }
}
