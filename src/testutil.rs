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

//! Test fixtures shared across the crate's tests.

use std::path::Path;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, SystemTime};

use hound::{SampleFormat, WavSpec, WavWriter};

use crate::region::{MemoryRegion, Region};

/// Writes planar float samples to a WAV file.
pub fn write_wav(path: &Path, channels: &[Vec<f32>], sample_rate: u32) {
    let spec = WavSpec {
        channels: channels.len() as u16,
        sample_rate,
        bits_per_sample: 32,
        sample_format: SampleFormat::Float,
    };
    let mut writer = WavWriter::create(path, spec).expect("create WAV file");
    let frames = channels[0].len();
    for frame in 0..frames {
        for channel in channels {
            writer.write_sample(channel[frame]).expect("write sample");
        }
    }
    writer.finalize().expect("finalize WAV file");
}

/// An in-memory mono region holding `samples` copies of `value`.
pub fn constant_region(id: &str, value: f32, samples: usize) -> Region {
    Region::Audio(Arc::new(
        MemoryRegion::new(id, vec![vec![value; samples]]).expect("build region"),
    ))
}

/// An in-memory mono region counting 0, 1, 2, ... so cursor positions are
/// visible in the output.
pub fn ramp_region(id: &str, samples: usize) -> Region {
    Region::Audio(Arc::new(
        MemoryRegion::new(id, vec![(0..samples).map(|i| i as f32).collect()]).expect("build region"),
    ))
}

/// Wait for the given predicate to return true or fail.
#[allow(dead_code)]
pub fn eventually<F>(predicate: F, error_msg: &str)
where
    F: Fn() -> bool,
{
    let start = SystemTime::now();
    let tick = Duration::from_millis(10);
    let timeout = Duration::from_secs(3);

    loop {
        let elapsed = start.elapsed().expect("system time error");
        if elapsed > timeout {
            panic!("{}", error_msg);
        }
        if predicate() {
            return;
        }
        thread::sleep(tick);
    }
}
