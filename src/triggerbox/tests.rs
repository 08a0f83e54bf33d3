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

//! End-to-end slice-driver tests.
//!
//! Timing reference throughout: 120 bpm at 48kHz, so one beat is exactly
//! 24000 samples and the default one-beat grid lands on multiples of it.

use std::sync::Arc;
use std::thread;

use crate::buffers::BufferSet;
use crate::region::{MemoryRegion, Region};
use crate::tempo::{BbtOffset, TempoMap, TICKS_PER_BEAT};
use crate::testutil::{constant_region, eventually, ramp_region};
use crate::trigger::{FollowAction, LaunchStyle, TriggerState};
use crate::triggerbox::{DataType, TriggerBox};

fn make_box(slots: usize) -> TriggerBox {
    TriggerBox::new(DataType::Audio, slots, TempoMap::new(120.0, 48000))
}

/// Runs one slice through the box and returns the output buffers.
fn run_slice(tb: &TriggerBox, start: i64, nframes: usize) -> BufferSet {
    let mut bufs = BufferSet::new(2, nframes, 1);
    tb.run(&mut bufs, start, start + nframes as i64, 1.0, nframes, true);
    bufs
}

fn assert_silent(bufs: &BufferSet) {
    for channel in 0..bufs.audio_channels() {
        assert!(
            bufs.audio(channel).samples().iter().all(|&s| s == 0.0),
            "expected silence on channel {}",
            channel
        );
    }
}

fn active_slots(tb: &TriggerBox) -> usize {
    (0..tb.n_slots())
        .filter(|&n| tb.state(n).unwrap() >= TriggerState::WaitingToStart)
        .count()
}

#[test]
fn test_quantized_start() {
    let tb = make_box(8);
    tb.set_region(0, constant_region("clip", 0.5, 48000)).unwrap();
    tb.set_follow_action(0, 0, FollowAction::Stop).unwrap();

    tb.bang(0).unwrap();

    // The bang slice: the slot arms but the one-beat grid point (24000) is
    // still ahead, so no audio.
    let bufs = run_slice(&tb, 4096, 4096);
    assert_eq!(tb.state(0).unwrap(), TriggerState::WaitingToStart);
    assert_eq!(tb.currently_playing(), Some(0));
    assert_silent(&bufs);

    // A slice ending exactly on the boundary: the start must not fire here
    // (half-open interval).
    let bufs = run_slice(&tb, 22976, 1024);
    assert_eq!(tb.state(0).unwrap(), TriggerState::WaitingToStart);
    assert_silent(&bufs);

    // The slice starting on the boundary plays from dest_offset 0.
    let bufs = run_slice(&tb, 24000, 1024);
    assert_eq!(tb.state(0).unwrap(), TriggerState::Running);
    assert!(bufs.audio(0).samples().iter().all(|&s| s == 0.5));
    // The mono clip duplicates across both outputs.
    assert!(bufs.audio(1).samples().iter().all(|&s| s == 0.5));
    assert_eq!(bufs.audio_count(), 1);
}

#[test]
fn test_gate_unbang() {
    let tb = make_box(8);
    tb.set_region(0, constant_region("clip", 0.5, 48000)).unwrap();
    tb.set_launch_style(0, LaunchStyle::Gate).unwrap();
    tb.set_follow_action(0, 0, FollowAction::Stop).unwrap();

    tb.bang(0).unwrap();
    run_slice(&tb, 4096, 4096);

    // Quantized start on beat boundary 24000.
    let bufs = run_slice(&tb, 24000, 1024);
    assert_eq!(tb.state(0).unwrap(), TriggerState::Running);
    assert!(bufs.audio(0).samples().iter().all(|&s| s == 0.5));

    run_slice(&tb, 25024, 4976);

    // Release around sample 30000: the stop snaps to the next beat
    // boundary, 48000, so the clip keeps playing until then.
    tb.unbang(0).unwrap();
    let bufs = run_slice(&tb, 30000, 1024);
    assert_eq!(tb.state(0).unwrap(), TriggerState::WaitingToStop);
    assert!(bufs.audio(0).samples().iter().all(|&s| s == 0.5));

    // The boundary slice: play up to sample 48000, fade, stop.
    let bufs = run_slice(&tb, 47104, 1024);
    assert_eq!(tb.state(0).unwrap(), TriggerState::Stopped);
    assert_eq!(tb.currently_playing(), None);

    let samples = bufs.audio(0).samples();
    assert_eq!(samples[0], 0.5);
    // The stop segment ramps down toward the boundary.
    assert!(samples[895] < 0.01);
    assert!(samples[896..].iter().all(|&s| s == 0.0));
}

#[test]
fn test_repeat_truncates_and_loops() {
    let tb = make_box(8);
    tb.set_region(0, ramp_region("ramp", 48000)).unwrap();
    tb.set_quantization(0, BbtOffset::new(0, 0, (TICKS_PER_BEAT / 2) as i32))
        .unwrap();
    tb.set_launch_style(0, LaunchStyle::Repeat).unwrap();

    tb.bang(0).unwrap();
    run_slice(&tb, 4096, 4096);

    // Half-beat grid: the start lands on sample 24000 too (a multiple of
    // 12000). One 100000-sample slice wraps the truncated clip eight full
    // times plus a tail.
    let bufs = run_slice(&tb, 24000, 100_000);
    assert_eq!(tb.state(0).unwrap(), TriggerState::Running);

    let samples = bufs.audio(0).samples();
    assert_eq!(samples[0], 0.0);
    assert_eq!(samples[11_999], 11_999.0);
    // Wrapped back to the clip start.
    assert_eq!(samples[12_000], 0.0);
    assert_eq!(samples[95_999], 11_999.0);
    // The tail is the ninth pass, 4000 samples in.
    assert_eq!(samples[99_999], 3_999.0);
}

#[test]
fn test_legato_splice() {
    let tb = make_box(8);
    tb.set_region(0, constant_region("a", 0.25, 48000)).unwrap();
    tb.set_region(1, ramp_region("b", 48000)).unwrap();
    tb.set_follow_action(0, 0, FollowAction::Stop).unwrap();
    tb.set_follow_action(1, 0, FollowAction::Stop).unwrap();
    tb.set_legato(1, true).unwrap();

    tb.bang(0).unwrap();
    run_slice(&tb, 4096, 4096);
    run_slice(&tb, 24000, 1024);
    // Advance slot 0's cursor to 16000.
    run_slice(&tb, 25024, 14976);

    // Bang slot 1: with legato it splices in mid-slice at the same
    // internal position, without waiting for the grid.
    tb.bang(1).unwrap();
    let bufs = run_slice(&tb, 40000, 1024);

    assert_eq!(tb.state(0).unwrap(), TriggerState::Stopped);
    assert_eq!(tb.state(1).unwrap(), TriggerState::Running);
    assert_eq!(tb.currently_playing(), Some(1));
    assert_eq!(active_slots(&tb), 1);

    let samples = bufs.audio(0).samples();
    assert_eq!(samples[0], 16000.0);
    assert_eq!(samples[1023], 17023.0);
}

#[test]
fn test_follow_action_next_trigger_skips_gap() {
    let tb = make_box(8);
    // Slots 0, 2, 5 loaded; 1, 3, 4, 6, 7 empty.
    tb.set_region(0, ramp_region("r0", 12000)).unwrap();
    tb.set_region(2, constant_region("r2", 0.75, 48000)).unwrap();
    tb.set_region(5, constant_region("r5", 0.25, 48000)).unwrap();
    tb.set_follow_action(0, 0, FollowAction::NextTrigger).unwrap();
    tb.set_follow_action_probability(0, 100).unwrap();

    tb.bang(0).unwrap();
    run_slice(&tb, 4096, 4096);
    run_slice(&tb, 24000, 1024);
    assert_eq!(tb.state(0).unwrap(), TriggerState::Running);

    // Clip 0 runs out mid-slice; the follow-up resolved at start was slot
    // 2 (the first runnable one after 0), already queued implicitly.
    run_slice(&tb, 25024, 10976);
    assert_eq!(tb.state(0).unwrap(), TriggerState::Stopped);
    assert_eq!(tb.state(1).unwrap(), TriggerState::Stopped);
    assert_eq!(tb.state(2).unwrap(), TriggerState::WaitingToStart);
    assert_eq!(tb.currently_playing(), Some(2));

    // Slot 2 starts at the next beat boundary.
    let bufs = run_slice(&tb, 48000, 1024);
    assert_eq!(tb.state(2).unwrap(), TriggerState::Running);
    assert!(bufs.audio(0).samples().iter().all(|&s| s == 0.75));
}

#[test]
fn test_stop_all_latch() {
    let tb = make_box(8);
    tb.set_region(0, constant_region("clip", 0.5, 96000)).unwrap();

    tb.bang(0).unwrap();
    run_slice(&tb, 4096, 4096);
    run_slice(&tb, 24000, 1024);
    assert_eq!(tb.state(0).unwrap(), TriggerState::Running);

    // The latch is cleared at the next slice's dispatch prologue: every
    // slot stops, both queues reset, nothing is playing.
    tb.request_stop_all();
    let bufs = run_slice(&tb, 25024, 1024);

    for slot in 0..tb.n_slots() {
        assert_eq!(tb.state(slot).unwrap(), TriggerState::Stopped);
    }
    assert_eq!(tb.currently_playing(), None);
    assert_eq!(active_slots(&tb), 0);
    assert_silent(&bufs);

    // And playback does not resume on its own.
    let bufs = run_slice(&tb, 26048, 1024);
    assert_eq!(tb.currently_playing(), None);
    assert_silent(&bufs);
}

#[test]
fn test_non_legato_switch_waits_for_clip_end() {
    let tb = make_box(8);
    tb.set_region(0, constant_region("a", 0.5, 12000)).unwrap();
    tb.set_region(1, constant_region("b", 0.75, 48000)).unwrap();
    tb.set_follow_action(0, 0, FollowAction::Stop).unwrap();
    tb.set_follow_action(1, 0, FollowAction::Stop).unwrap();
    tb.set_legato(1, false).unwrap();

    tb.bang(0).unwrap();
    run_slice(&tb, 4096, 4096);
    run_slice(&tb, 24000, 1024);

    // Banging slot 1 queues it explicitly but, without legato, slot 0
    // keeps the slice.
    tb.bang(1).unwrap();
    let bufs = run_slice(&tb, 25024, 1024);
    assert_eq!(tb.currently_playing(), Some(0));
    assert_eq!(tb.state(1).unwrap(), TriggerState::Stopped);
    assert!(bufs.audio(0).samples().iter().all(|&s| s == 0.5));

    // Clip 0 exhausts (12000 samples from 24000 ends at 36000); slot 1
    // takes over and waits for its grid point.
    run_slice(&tb, 26048, 12000);
    assert_eq!(tb.state(0).unwrap(), TriggerState::Stopped);
    assert_eq!(tb.currently_playing(), Some(1));
    assert_eq!(tb.state(1).unwrap(), TriggerState::WaitingToStart);

    let bufs = run_slice(&tb, 48000, 1024);
    assert_eq!(tb.state(1).unwrap(), TriggerState::Running);
    assert!(bufs.audio(0).samples().iter().all(|&s| s == 0.75));
}

#[test]
fn test_clip_shorter_than_slice_silences_tail() {
    let tb = make_box(8);
    tb.set_region(0, constant_region("short", 1.0, 3000)).unwrap();
    tb.set_follow_action(0, 0, FollowAction::Stop).unwrap();

    tb.bang(0).unwrap();
    run_slice(&tb, 4096, 4096);

    let bufs = run_slice(&tb, 24000, 8192);
    assert_eq!(tb.state(0).unwrap(), TriggerState::Stopped);

    let samples = bufs.audio(0).samples();
    assert!(samples[..3000].iter().all(|&s| s == 1.0));
    assert!(samples[3000..].iter().all(|&s| s == 0.0));
}

#[test]
fn test_midi_note_on_bangs_mapped_slot() {
    let tb = make_box(8);
    tb.set_region(0, constant_region("clip", 0.5, 48000)).unwrap();
    tb.set_follow_action(0, 0, FollowAction::Stop).unwrap();

    // Note 60 maps to slot 0; the bang arrives inside the slice itself.
    let mut bufs = BufferSet::new(2, 1024, 1);
    bufs.midi_mut(0).push(vec![0x90, 60, 100]);
    tb.run(&mut bufs, 4096, 5120, 1.0, 1024, true);

    assert_eq!(tb.state(0).unwrap(), TriggerState::WaitingToStart);
    assert_eq!(tb.currently_playing(), Some(0));
}

#[test]
fn test_midi_unmapped_and_overflow_notes_dropped() {
    let tb = make_box(8);
    tb.set_region(0, constant_region("clip", 0.5, 48000)).unwrap();

    let mut bufs = BufferSet::new(2, 1024, 1);
    // Note 59 is unmapped; note 69 maps to slot 9, which this bank does
    // not have.
    bufs.midi_mut(0).push(vec![0x90, 59, 100]);
    bufs.midi_mut(0).push(vec![0x90, 69, 100]);
    // A controller change is not a note at all.
    bufs.midi_mut(0).push(vec![0xB0, 7, 100]);
    tb.run(&mut bufs, 4096, 5120, 1.0, 1024, true);

    assert_eq!(tb.currently_playing(), None);
    assert_eq!(active_slots(&tb), 0);
}

#[test]
fn test_midi_note_off_unbangs_gate() {
    let tb = make_box(8);
    tb.set_region(0, constant_region("clip", 0.5, 96000)).unwrap();
    tb.set_launch_style(0, LaunchStyle::Gate).unwrap();
    tb.set_follow_action(0, 0, FollowAction::Stop).unwrap();

    let mut bufs = BufferSet::new(2, 1024, 1);
    bufs.midi_mut(0).push(vec![0x90, 60, 100]);
    tb.run(&mut bufs, 4096, 5120, 1.0, 1024, true);
    run_slice(&tb, 24000, 1024);
    assert_eq!(tb.state(0).unwrap(), TriggerState::Running);

    let mut bufs = BufferSet::new(2, 1024, 1);
    bufs.midi_mut(0).push(vec![0x80, 60, 0]);
    tb.run(&mut bufs, 25024, 26048, 1.0, 1024, true);
    assert_eq!(tb.state(0).unwrap(), TriggerState::WaitingToStop);
}

#[test]
fn test_negative_slice_start_refused() {
    let tb = make_box(8);
    tb.set_region(0, constant_region("clip", 0.5, 48000)).unwrap();
    tb.bang(0).unwrap();

    let mut bufs = BufferSet::new(2, 64, 1);
    bufs.audio_mut(0).read_from(&[1.0; 64], 0);
    tb.run(&mut bufs, -64, 0, 1.0, 64, true);

    // Nothing was processed, nothing was written.
    assert_eq!(tb.currently_playing(), None);
    assert!(bufs.audio(0).samples().iter().all(|&s| s == 1.0));
}

#[test]
fn test_slice_without_midi_input_refused() {
    let tb = make_box(8);
    tb.set_region(0, constant_region("clip", 0.5, 48000)).unwrap();
    tb.bang(0).unwrap();

    let mut bufs = BufferSet::new(2, 64, 0);
    tb.run(&mut bufs, 0, 64, 1.0, 64, true);
    assert_eq!(tb.currently_playing(), None);
}

#[test]
fn test_queue_bang_coalescing_path() {
    let tb = make_box(8);
    tb.set_region(0, constant_region("clip", 0.5, 48000)).unwrap();
    tb.set_follow_action(0, 0, FollowAction::Stop).unwrap();

    // The coalescing ring is drained into the per-slot counters at the
    // top of the slice, so this behaves exactly like a direct bang.
    tb.queue_bang(0).unwrap();
    run_slice(&tb, 4096, 4096);
    assert_eq!(tb.state(0).unwrap(), TriggerState::WaitingToStart);
}

#[test]
fn test_toggle_bang_sequence_starts_then_stops() {
    // bang(); run(); bang(); run(): the first drain starts a Toggle slot,
    // the second turns into a quantized stop request.
    let tb = make_box(8);
    tb.set_region(0, constant_region("clip", 0.5, 96000)).unwrap();
    tb.set_follow_action(0, 0, FollowAction::Stop).unwrap();

    tb.bang(0).unwrap();
    run_slice(&tb, 4096, 4096);
    run_slice(&tb, 24000, 1024);
    assert_eq!(tb.state(0).unwrap(), TriggerState::Running);

    tb.bang(0).unwrap();
    run_slice(&tb, 25024, 1024);
    assert_eq!(tb.state(0).unwrap(), TriggerState::WaitingToStop);

    // The stop lands on beat 2.
    run_slice(&tb, 47104, 1024);
    assert_eq!(tb.state(0).unwrap(), TriggerState::Stopped);
    assert_eq!(tb.currently_playing(), None);
}

#[test]
fn test_bang_on_empty_slot_is_ignored() {
    let tb = make_box(8);
    tb.bang(3).unwrap();
    run_slice(&tb, 4096, 4096);
    assert_eq!(tb.currently_playing(), None);
    assert_eq!(tb.state(3).unwrap(), TriggerState::Stopped);
}

#[test]
fn test_slot_bounds_are_checked() {
    let tb = make_box(4);
    assert!(tb.bang(4).is_err());
    assert!(tb.unbang(99).is_err());
    assert!(tb.set_legato(4, true).is_err());
    assert!(tb.state(4).is_err());
    assert!(tb.set_follow_action(0, 2, FollowAction::Stop).is_err());
}

#[test]
fn test_set_region_requires_stopped_slot() {
    let tb = make_box(8);
    tb.set_region(0, constant_region("clip", 0.5, 48000)).unwrap();
    tb.bang(0).unwrap();
    run_slice(&tb, 4096, 4096);
    assert_eq!(tb.state(0).unwrap(), TriggerState::WaitingToStart);

    assert!(tb.set_region(0, constant_region("other", 0.1, 1000)).is_err());
    assert!(tb.set_length(0, 1000).is_err());
}

#[test]
fn test_set_length_stretches_stopped_clip() {
    let tb = make_box(8);
    tb.set_region(0, constant_region("clip", 0.5, 20000)).unwrap();
    tb.set_length(0, 40000).unwrap();

    let snapshot = tb.snapshot();
    let length = snapshot.triggers[0].length;
    assert!(
        (length as i64 - 40000).unsigned_abs() <= 400,
        "expected ~40000 samples, got {}",
        length
    );
}

#[test]
fn test_set_quantization_rejects_bar_grids() {
    let tb = make_box(8);
    assert!(tb.set_quantization(0, BbtOffset::new(1, 0, 0)).is_err());
    assert!(tb.set_quantization(0, BbtOffset::new(0, 2, 0)).is_ok());
}

#[test]
fn test_snapshot_restore_round_trip() {
    let r0 = constant_region("region-0", 0.5, 48000);
    let r1 = ramp_region("region-1", 24000);

    let tb = make_box(4);
    tb.set_region(0, r0.clone()).unwrap();
    tb.set_region(1, r1.clone()).unwrap();
    tb.set_name(0, "verse loop").unwrap();
    tb.set_launch_style(0, LaunchStyle::Gate).unwrap();
    tb.set_legato(0, false).unwrap();
    tb.set_quantization(0, BbtOffset::new(0, 0, 480)).unwrap();
    tb.set_follow_action(0, 0, FollowAction::AnyTrigger).unwrap();
    tb.set_follow_action(0, 1, FollowAction::Again).unwrap();
    tb.set_follow_action_probability(0, 40).unwrap();
    tb.set_clip_start(0, 120).unwrap();
    tb.set_launch_style(1, LaunchStyle::Repeat).unwrap();

    let saved = tb.snapshot();

    let restored = make_box(4);
    restored
        .restore(&saved, |id| match id {
            "region-0" => Some(r0.clone()),
            "region-1" => Some(r1.clone()),
            _ => None,
        })
        .unwrap();

    // Every behavioral field round-trips exactly.
    assert_eq!(saved, restored.snapshot());

    // Live state did not: nothing is playing in the restored bank.
    assert_eq!(restored.currently_playing(), None);
    for slot in 0..restored.n_slots() {
        assert_eq!(restored.state(slot).unwrap(), TriggerState::Stopped);
    }
}

#[test]
fn test_snapshot_yaml_round_trip() {
    let tb = make_box(2);
    tb.set_region(0, constant_region("r", 0.5, 24000)).unwrap();
    let saved = tb.snapshot();

    let yaml = saved.to_yaml().unwrap();
    let parsed = crate::persist::TriggerBoxSnapshot::from_yaml(&yaml).unwrap();
    assert_eq!(saved, parsed);
}

#[test]
fn test_restore_skips_unresolvable_regions() {
    let tb = make_box(2);
    tb.set_region(0, constant_region("gone", 0.5, 24000)).unwrap();
    let saved = tb.snapshot();

    let restored = make_box(2);
    restored.restore(&saved, |_| None).unwrap();
    assert!(!restored.runnable(0).unwrap());
    // Behavioral fields still applied.
    assert_eq!(restored.name(0).unwrap(), tb.name(0).unwrap());
}

#[test]
fn test_control_thread_bang_reaches_the_driver() {
    let tb = Arc::new(make_box(8));
    tb.set_region(0, constant_region("clip", 0.5, 48000)).unwrap();
    tb.set_follow_action(0, 0, FollowAction::Stop).unwrap();

    // Stimuli are lock-free; a bang from any control thread lands in the
    // slot's mailbox and is drained by the next slice.
    let control = {
        let tb = Arc::clone(&tb);
        thread::spawn(move || tb.bang(0).unwrap())
    };
    control.join().unwrap();

    eventually(
        || {
            run_slice(&tb, 4096, 4096);
            tb.currently_playing() == Some(0)
        },
        "bang never armed the slot",
    );
    assert_eq!(tb.state(0).unwrap(), TriggerState::WaitingToStart);
}

#[test]
fn test_region_variant_is_checked_at_load() {
    let tb = make_box(2);
    assert!(tb.set_region(0, Region::Midi).is_err());
    assert!(!tb.runnable(0).unwrap());

    let region = Region::Audio(Arc::new(
        MemoryRegion::new("ok", vec![vec![0.0; 100]]).unwrap(),
    ));
    assert!(tb.set_region(0, region).is_ok());
    assert!(tb.runnable(0).unwrap());
}

#[test]
fn test_midi_box_slots_are_stubs() {
    let tb = TriggerBox::new(DataType::Midi, 4, TempoMap::new(120.0, 48000));

    // A MIDI box holds the placeholder media and rejects audio regions.
    assert!(tb.set_region(0, constant_region("clip", 0.5, 1000)).is_err());
    assert!(tb.set_region(0, Region::Midi).is_ok());

    // The stub is not runnable and never produces output.
    assert!(!tb.runnable(0).unwrap());
    tb.bang(0).unwrap();
    let bufs = run_slice(&tb, 4096, 4096);
    assert_eq!(tb.currently_playing(), None);
    assert_silent(&bufs);
}
