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

//! Offline time stretching of clip data.
//!
//! This module provides:
//! - The [`TimeStretcher`] contract: a two-pass (study then process)
//!   offline stretcher that is drained through `available`/`retrieve`
//! - [`ResampleStretcher`], a repitch-style implementation built on
//!   rubato's sinc resampler
//! - [`stretch_channels`], the blocking driver that runs both passes over
//!   16384-sample blocks and collects the stretched output
//!
//! Stretching is a control-thread operation; it sleeps while waiting for
//! the stretcher to flush and must never run on the audio thread.

use std::collections::VecDeque;
use std::sync::LazyLock;
use std::thread;
use std::time::Duration;

use rubato::{
    calculate_cutoff, Resampler, SincFixedIn, SincInterpolationParameters, SincInterpolationType,
    WindowFunction,
};
use tracing::{debug, info};

/// Block size for feeding the stretcher, in samples per channel.
const STRETCH_BLOCK_SIZE: usize = 16384;

/// Input chunk size for the underlying resampler.
const RESAMPLER_CHUNK_SIZE: usize = 1024;

/// Length of the sinc interpolation filter.
const SINC_LENGTH: usize = 128;

/// Oversampling factor for the interpolation filter.
const OVERSAMPLING_FACTOR: usize = 256;

/// How long to wait between drain polls while the stretcher flushes.
const DRAIN_POLL: Duration = Duration::from_millis(10);

/// Anti-aliasing cutoff for our sinc length and window function.
static F_CUTOFF: LazyLock<f32> =
    LazyLock::new(|| calculate_cutoff::<f32>(SINC_LENGTH, WindowFunction::BlackmanHarris2));

/// Errors from the stretch pipeline.
#[derive(Debug, thiserror::Error)]
pub enum StretchError {
    #[error("invalid stretch ratio: {0}")]
    InvalidRatio(f64),

    #[error("stretcher resampler construction failed: {0}")]
    Construction(String),

    #[error("stretcher processing failed: {0}")]
    Process(String),

    #[error("no clip data to stretch")]
    NoData,

    #[error("time ratio was not set before processing")]
    RatioNotSet,
}

/// An offline time stretcher.
///
/// The protocol mirrors the external stretching libraries this adapts:
/// one full study pass over the input, then one process pass, retrieving
/// output as it becomes available. `available` returns `None` once the
/// stretcher has flushed everything it will ever produce.
pub trait TimeStretcher: Send {
    /// Sets the output/input length ratio. Must be called before either pass.
    fn set_time_ratio(&mut self, ratio: f64) -> Result<(), StretchError>;

    /// Feeds one block to the study pass. `last` marks the final block.
    fn study(&mut self, input: &[&[f32]], last: bool);

    /// Feeds one block to the process pass. `last` marks the final block.
    fn process(&mut self, input: &[&[f32]], last: bool) -> Result<(), StretchError>;

    /// Frames ready to retrieve, or `None` once fully drained.
    fn available(&self) -> Option<usize>;

    /// Appends all ready frames to `output` (one Vec per channel) and
    /// returns the number of frames appended.
    fn retrieve(&mut self, output: &mut [Vec<f32>]) -> usize;
}

/// A repitch-style stretcher: changing length by `ratio` is resampling by
/// `ratio` and playing the result back at the original rate. Pitch moves
/// with duration, which is the classic repitch trade-off.
pub struct ResampleStretcher {
    channels: usize,
    ratio: Option<f64>,
    resampler: Option<SincFixedIn<f32>>,
    /// Input buffered until a full resampler chunk is available.
    pending: Vec<Vec<f32>>,
    /// Output waiting for retrieval.
    ready: Vec<VecDeque<f32>>,
    /// Total input frames seen by the study pass.
    studied_frames: u64,
    /// Total input frames fed to the process pass (without padding).
    processed_input: u64,
    /// Total output frames produced so far.
    produced: u64,
    /// Set once the final block has been processed and flushed.
    input_done: bool,
}

impl ResampleStretcher {
    /// Creates a stretcher for the given channel count.
    pub fn new(channels: usize) -> Self {
        Self {
            channels,
            ratio: None,
            resampler: None,
            pending: vec![Vec::new(); channels],
            ready: (0..channels).map(|_| VecDeque::new()).collect(),
            studied_frames: 0,
            processed_input: 0,
            produced: 0,
            input_done: false,
        }
    }

    /// Runs the resampler over every complete buffered chunk.
    fn process_full_chunks(&mut self) -> Result<(), StretchError> {
        let resampler = self.resampler.as_mut().ok_or(StretchError::RatioNotSet)?;

        while self.pending[0].len() >= RESAMPLER_CHUNK_SIZE {
            let chunk: Vec<Vec<f32>> = self
                .pending
                .iter_mut()
                .map(|p| p.drain(..RESAMPLER_CHUNK_SIZE).collect())
                .collect();

            let out = resampler
                .process(&chunk, None)
                .map_err(|e| StretchError::Process(e.to_string()))?;

            self.produced += out[0].len() as u64;
            for (ready, channel_out) in self.ready.iter_mut().zip(out) {
                ready.extend(channel_out);
            }
        }

        Ok(())
    }

    /// Pads the final partial chunk with silence, processes it, and trims
    /// the output back to the exact expected length.
    fn flush(&mut self) -> Result<(), StretchError> {
        let remainder = self.pending[0].len();
        if remainder > 0 {
            for pending in &mut self.pending {
                pending.resize(RESAMPLER_CHUNK_SIZE, 0.0);
            }
            self.process_full_chunks()?;
        }

        let ratio = self.ratio.ok_or(StretchError::RatioNotSet)?;
        let expected = (self.processed_input as f64 * ratio).ceil() as u64;
        if self.produced > expected {
            let excess = (self.produced - expected) as usize;
            for ready in &mut self.ready {
                let keep = ready.len().saturating_sub(excess);
                ready.truncate(keep);
            }
            self.produced = expected;
        }

        self.input_done = true;
        Ok(())
    }
}

impl TimeStretcher for ResampleStretcher {
    fn set_time_ratio(&mut self, ratio: f64) -> Result<(), StretchError> {
        if !(ratio.is_finite() && ratio > 0.0) {
            return Err(StretchError::InvalidRatio(ratio));
        }

        let params = SincInterpolationParameters {
            sinc_len: SINC_LENGTH,
            f_cutoff: *F_CUTOFF,
            interpolation: SincInterpolationType::Linear,
            oversampling_factor: OVERSAMPLING_FACTOR,
            window: WindowFunction::BlackmanHarris2,
        };
        // Generous headroom so extreme stretches still construct.
        let max_ratio = (ratio * 1.5).max(10.0);

        self.resampler = Some(
            SincFixedIn::<f32>::new(ratio, max_ratio, params, RESAMPLER_CHUNK_SIZE, self.channels)
                .map_err(|e| StretchError::Construction(e.to_string()))?,
        );
        self.ratio = Some(ratio);
        Ok(())
    }

    fn study(&mut self, input: &[&[f32]], last: bool) {
        // The resampler needs no spectral pre-pass; the study pass
        // establishes the total input duration ahead of processing.
        self.studied_frames += input.first().map(|c| c.len()).unwrap_or(0) as u64;
        if last {
            debug!(frames = self.studied_frames, "Stretch study pass complete");
        }
    }

    fn process(&mut self, input: &[&[f32]], last: bool) -> Result<(), StretchError> {
        let frames = input.first().map(|c| c.len()).unwrap_or(0);
        self.processed_input += frames as u64;
        for (pending, channel_in) in self.pending.iter_mut().zip(input) {
            pending.extend_from_slice(channel_in);
        }

        self.process_full_chunks()?;
        if last {
            self.flush()?;
        }
        Ok(())
    }

    fn available(&self) -> Option<usize> {
        let buffered = self.ready.first().map(|r| r.len()).unwrap_or(0);
        if self.input_done && buffered == 0 {
            None
        } else {
            Some(buffered)
        }
    }

    fn retrieve(&mut self, output: &mut [Vec<f32>]) -> usize {
        let frames = self.ready.first().map(|r| r.len()).unwrap_or(0);
        for (ready, out) in self.ready.iter_mut().zip(output) {
            out.extend(ready.drain(..));
        }
        frames
    }
}

/// Stretches planar clip data to `ratio` times its length.
///
/// Runs the study pass, then the process pass, over fixed-size blocks,
/// retrieving output as it appears, and finally waits out the stretcher's
/// flush with a cooperative sleep. Returns the stretched planar data.
pub fn stretch_channels(
    data: &[Vec<f32>],
    ratio: f64,
    stretcher: &mut dyn TimeStretcher,
) -> Result<Vec<Vec<f32>>, StretchError> {
    if data.is_empty() || data[0].is_empty() {
        return Err(StretchError::NoData);
    }
    let data_length = data[0].len();

    stretcher.set_time_ratio(ratio)?;

    // Study pass: the stretcher wants to know the whole input before it
    // produces anything.
    let mut read = 0;
    while read < data_length {
        let to_read = STRETCH_BLOCK_SIZE.min(data_length - read);
        let block: Vec<&[f32]> = data.iter().map(|c| &c[read..read + to_read]).collect();
        read += to_read;
        stretcher.study(&block, read >= data_length);
    }

    // Process pass, draining output as it becomes available.
    let mut stretched: Vec<Vec<f32>> = vec![Vec::new(); data.len()];
    let mut read = 0;
    while read < data_length {
        let to_read = STRETCH_BLOCK_SIZE.min(data_length - read);
        let block: Vec<&[f32]> = data.iter().map(|c| &c[read..read + to_read]).collect();
        read += to_read;
        stretcher.process(&block, read >= data_length)?;

        while matches!(stretcher.available(), Some(n) if n > 0) {
            stretcher.retrieve(&mut stretched);
        }
    }

    // Collect the final chunk, possibly delayed by stretcher internals.
    loop {
        match stretcher.available() {
            None => break,
            Some(0) => thread::sleep(DRAIN_POLL),
            Some(_) => {
                stretcher.retrieve(&mut stretched);
            }
        }
    }

    info!(
        input_frames = data_length,
        output_frames = stretched[0].len(),
        ratio,
        "Stretched clip data"
    );

    Ok(stretched)
}
