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

//! In-memory audio clip data and the per-slice sample copy.
//!
//! A clip owns one deinterleaved `f32` array per channel, pulled from its
//! region at load time, plus the cursor bookkeeping: a read index, a start
//! offset into the data, a usable-length window, and the one-shot legato
//! offset consumed by the next retrigger.

use std::sync::Arc;

use tracing::{debug, info};

use crate::buffers::BufferSet;
use crate::region::{AudioRegion, RegionError};
use crate::stretch::{stretch_channels, StretchError, TimeStretcher};

/// A loaded audio clip.
pub struct AudioClip {
    region: Arc<dyn AudioRegion>,
    /// Planar sample data, one array per channel.
    data: Vec<Vec<f32>>,
    /// Samples per channel.
    data_length: u64,
    read_index: u64,
    start_offset: u64,
    /// Consumed exactly once by the next retrigger.
    legato_offset: u64,
    usable_length: u64,
    /// `start_offset + usable_length`, never past `data_length`.
    last_sample: u64,
}

impl AudioClip {
    /// Pulls the region's channels into freshly allocated arrays.
    ///
    /// All-or-nothing: a failed read drops every buffer and returns the
    /// error, leaving the caller's slot empty.
    pub fn load(region: Arc<dyn AudioRegion>) -> Result<Self, RegionError> {
        let n_channels = region.n_channels();
        let data_length = region.length_samples();
        if n_channels == 0 || data_length == 0 {
            return Err(RegionError::Empty);
        }

        let mut data = Vec::with_capacity(n_channels);
        for channel in 0..n_channels {
            let mut samples = vec![0.0f32; data_length as usize];
            let mut filled = 0usize;
            while filled < samples.len() {
                let n = region.read(&mut samples[filled..], filled as u64, channel)?;
                if n == 0 {
                    return Err(RegionError::ReadPastEnd {
                        offset: filled as u64,
                        length: data_length,
                    });
                }
                filled += n;
            }
            data.push(samples);
        }

        debug!(
            region = region.id(),
            channels = n_channels,
            samples = data_length,
            "Loaded clip data"
        );

        Ok(Self {
            region,
            data,
            data_length,
            read_index: 0,
            start_offset: 0,
            legato_offset: 0,
            usable_length: data_length,
            last_sample: data_length,
        })
    }

    /// The region this clip was loaded from.
    pub fn region(&self) -> &Arc<dyn AudioRegion> {
        &self.region
    }

    /// Channel count of the clip data.
    pub fn n_channels(&self) -> usize {
        self.data.len()
    }

    /// Samples per channel in the clip data.
    pub fn data_length(&self) -> u64 {
        self.data_length
    }

    /// The read cursor.
    pub fn read_index(&self) -> u64 {
        self.read_index
    }

    /// Offset from the start of the data where playback begins.
    pub fn start_offset(&self) -> u64 {
        self.start_offset
    }

    /// The playable window length.
    pub fn usable_length(&self) -> u64 {
        self.usable_length
    }

    /// One past the final playable sample.
    pub fn last_sample(&self) -> u64 {
        self.last_sample
    }

    /// Sets where playback begins inside the data.
    pub fn set_start(&mut self, offset: u64) {
        self.start_offset = offset.min(self.data_length.saturating_sub(1));
        self.clamp_window();
    }

    /// Truncates the playable window to `samples`.
    pub fn set_usable_length(&mut self, samples: u64) {
        self.usable_length = samples.max(1);
        self.clamp_window();
    }

    /// Opens the playable window to the remainder of the data.
    pub fn use_full_length(&mut self) {
        self.usable_length = self.data_length - self.start_offset;
        self.last_sample = self.data_length;
    }

    fn clamp_window(&mut self) {
        let remaining = self.data_length - self.start_offset;
        self.usable_length = self.usable_length.min(remaining).max(1);
        self.last_sample = self.start_offset + self.usable_length;
    }

    /// Arms the one-shot splice offset for the next retrigger.
    pub fn set_legato_offset(&mut self, offset: u64) {
        self.legato_offset = offset;
    }

    /// Drops any armed splice offset.
    pub fn clear_legato_offset(&mut self) {
        self.legato_offset = 0;
    }

    /// Resets the read cursor to `start_offset + legato_offset`, consuming
    /// the legato offset. A splice point at or past the playable window
    /// falls back to the start offset.
    pub fn retrigger(&mut self) {
        let target = self.start_offset + self.legato_offset;
        self.read_index = if target >= self.last_sample {
            self.start_offset
        } else {
            target
        };
        self.legato_offset = 0;
    }

    /// True once the cursor has consumed the playable window.
    pub fn at_end(&self) -> bool {
        self.read_index >= self.last_sample
    }

    /// Copies up to `nframes` samples into every output channel at
    /// `dest_offset`. Clip channel `c` feeds output channel `o` where
    /// `c = o mod n_channels`, so a mono clip duplicates across stereo
    /// outputs. Returns the number of samples copied.
    pub fn fill(
        &mut self,
        bufs: &mut BufferSet,
        nframes: usize,
        dest_offset: usize,
        first: bool,
    ) -> usize {
        let remaining = (self.last_sample - self.read_index) as usize;
        let this_read = nframes.min(remaining);
        if this_read == 0 {
            return 0;
        }

        let start = self.read_index as usize;
        for output in 0..bufs.audio_channels() {
            let src = &self.data[output % self.data.len()][start..start + this_read];
            let buf = bufs.audio_mut(output);
            if first {
                buf.read_from(src, dest_offset);
            } else {
                buf.accumulate_from(src, dest_offset);
            }
        }

        self.read_index += this_read as u64;
        this_read
    }

    /// Clones the channel arrays so a stretch can run without holding the
    /// slot lock.
    pub(crate) fn data_clone(&self) -> Vec<Vec<f32>> {
        self.data.clone()
    }

    /// Swaps in replacement channel arrays (the stretcher's output) and
    /// resets the cursor bookkeeping around them.
    pub(crate) fn replace_data(&mut self, data: Vec<Vec<f32>>) {
        let new_length = data[0].len() as u64;
        info!(
            region = self.region.id(),
            old_length = self.data_length,
            new_length,
            "Replaced clip data"
        );

        self.data = data;
        self.data_length = new_length;
        if self.start_offset >= self.data_length {
            self.start_offset = 0;
        }
        // The owner reapplies launch-policy truncation on top of this.
        self.use_full_length();
        self.read_index = self.start_offset;
    }

    /// Stretches the clip data so its length matches `target_samples`,
    /// replacing the channel arrays in place. Control-thread only.
    pub fn stretch_to(
        &mut self,
        target_samples: u64,
        stretcher: &mut dyn TimeStretcher,
    ) -> Result<(), StretchError> {
        if target_samples == self.data_length {
            // No stretch required.
            return Ok(());
        }
        if target_samples == 0 {
            return Err(StretchError::InvalidRatio(0.0));
        }

        let ratio = target_samples as f64 / self.data_length as f64;
        let stretched = stretch_channels(&self.data, ratio, stretcher)?;
        self.replace_data(stretched);
        Ok(())
    }
}
