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

//! The trigger box: a fixed bank of slots and the per-slice dispatcher.
//!
//! This module provides:
//! - The per-slice driver: MIDI intake, stimulus drains, quantized
//!   dispatch of exactly one playing slot, legato hand-off
//! - Lock-free explicit (user) and implicit (follow-action) queues
//! - The follow-action resolver
//! - The control surface: bang/unbang/stop, slot parameter setters,
//!   region loading, offline stretching
//!
//! The audio thread never blocks: stimuli are atomics outside the slot
//! lock, and the driver takes the slot lock with `try_write`, skipping the
//! slice if a control thread is mid-update.

#[cfg(test)]
mod tests;

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use ringbuf::traits::{Consumer, Observer, Producer, Split};
use ringbuf::{HeapCons, HeapProd, HeapRb};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, trace, warn};

use crate::buffers::BufferSet;
use crate::config::TriggerBoxConfig;
use crate::midi::{classify, MidiTriggerMap, NoteStimulus};
use crate::notify::{ChangeObserver, LocalTransport, NullObserver, Transport};
use crate::persist::{TriggerBoxSnapshot, TriggerSnapshot};
use crate::region::{Region, WavRegion};
use crate::stretch::ResampleStretcher;
use crate::tempo::{BbtOffset, TempoMap};
use crate::trigger::{
    FollowAction, LaunchStyle, RequestedState, RunType, SlotStimulus, Transition, Trigger,
    TriggerError, TriggerState,
};

/// Default number of slots in a box.
pub const DEFAULT_TRIGGERS_PER_BOX: usize = 8;

/// Depth of the explicit and implicit slot queues.
const SLOT_QUEUE_DEPTH: usize = 64;

/// Depth of the UI-side coalescing bang/unbang queues.
const STIMULUS_QUEUE_DEPTH: usize = 1024;

/// The media type a box's slots hold.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum DataType {
    #[default]
    Audio,
    /// Modeled but not realized; a MIDI box's slots never produce output.
    Midi,
}

/// Audio-thread state: the slots plus everything only the slice driver
/// mutates.
struct Inner {
    slots: Vec<Trigger>,
    explicit_prod: HeapProd<usize>,
    explicit_cons: HeapCons<usize>,
    implicit_prod: HeapProd<usize>,
    implicit_cons: HeapCons<usize>,
    bang_cons: HeapCons<usize>,
    unbang_cons: HeapCons<usize>,
    currently_playing: Option<usize>,
    rng: SmallRng,
}

// `HeapProd`/`HeapCons` cache their positions in a `Cell`, which makes
// `Inner` `!Sync` by default. That caching is only ever touched by whoever
// holds the `RwLock`'s write guard (the slice driver); shared `read()`
// access is only ever used to observe fields that aren't part of that
// caching, so sharing `&Inner` across threads is sound.
unsafe impl Sync for Inner {}

/// A fixed-capacity bank of named slots with quantized dispatch.
pub struct TriggerBox {
    data_type: DataType,
    inner: RwLock<Inner>,
    /// One lock-free stimulus mailbox per slot, outside the slot lock so
    /// producers never contend with the audio thread.
    stimuli: Box<[SlotStimulus]>,
    stop_all: AtomicBool,
    /// Producer halves of the UI coalescing queues. Control threads are
    /// funneled through these mutexes; the audio thread only consumes.
    bang_prod: Mutex<HeapProd<usize>>,
    unbang_prod: Mutex<HeapProd<usize>>,
    midi_map: MidiTriggerMap,
    tempo: TempoMap,
    transport: Arc<dyn Transport>,
}

impl TriggerBox {
    /// Creates a box with default collaborators: a no-op change observer
    /// and a free-standing transport.
    pub fn new(data_type: DataType, slots: usize, tempo: TempoMap) -> Self {
        Self::with_collaborators(
            data_type,
            slots,
            tempo,
            MidiTriggerMap::default(),
            Arc::new(NullObserver),
            Arc::new(LocalTransport::new()),
        )
    }

    /// Creates a box from a configuration file's settings.
    pub fn from_config(config: &TriggerBoxConfig) -> Self {
        Self::with_collaborators(
            config.data_type(),
            config.slots(),
            TempoMap::new(config.tempo(), config.sample_rate()),
            MidiTriggerMap::with_base_note(config.midi_base_note()),
            Arc::new(NullObserver),
            Arc::new(LocalTransport::new()),
        )
    }

    /// Creates a box wired to the host's observer and transport.
    pub fn with_collaborators(
        data_type: DataType,
        slots: usize,
        tempo: TempoMap,
        midi_map: MidiTriggerMap,
        observer: Arc<dyn ChangeObserver>,
        transport: Arc<dyn Transport>,
    ) -> Self {
        let (explicit_prod, explicit_cons) = HeapRb::new(SLOT_QUEUE_DEPTH).split();
        let (implicit_prod, implicit_cons) = HeapRb::new(SLOT_QUEUE_DEPTH).split();
        let (bang_prod, bang_cons) = HeapRb::new(STIMULUS_QUEUE_DEPTH).split();
        let (unbang_prod, unbang_cons) = HeapRb::new(STIMULUS_QUEUE_DEPTH).split();

        let slots: Vec<Trigger> = (0..slots)
            .map(|n| Trigger::new(n, Arc::clone(&observer)))
            .collect();
        let stimuli: Box<[SlotStimulus]> =
            (0..slots.len()).map(|_| SlotStimulus::new()).collect();

        Self {
            data_type,
            inner: RwLock::new(Inner {
                slots,
                explicit_prod,
                explicit_cons,
                implicit_prod,
                implicit_cons,
                bang_cons,
                unbang_cons,
                currently_playing: None,
                rng: SmallRng::from_entropy(),
            }),
            stimuli,
            stop_all: AtomicBool::new(false),
            bang_prod: Mutex::new(bang_prod),
            unbang_prod: Mutex::new(unbang_prod),
            midi_map,
            tempo,
            transport,
        }
    }

    /// The media type of this box's slots.
    pub fn data_type(&self) -> DataType {
        self.data_type
    }

    /// Number of slots in the bank.
    pub fn n_slots(&self) -> usize {
        self.stimuli.len()
    }

    /// The tempo map driving quantization.
    pub fn tempo(&self) -> TempoMap {
        self.tempo
    }

    /// The slot currently playing, if any.
    pub fn currently_playing(&self) -> Option<usize> {
        self.inner.read().currently_playing
    }

    fn check_slot(&self, slot: usize) -> Result<(), TriggerError> {
        if slot >= self.stimuli.len() {
            return Err(TriggerError::NoSuchSlot(slot));
        }
        Ok(())
    }

    // --- control surface (non-audio threads) ---------------------------

    /// Registers a start stimulus on a slot. Lock-free.
    pub fn bang(&self, slot: usize) -> Result<(), TriggerError> {
        self.check_slot(slot)?;
        trace!(slot, "Bang");
        self.stimuli[slot].bang();
        Ok(())
    }

    /// Registers a release stimulus on a slot. Lock-free.
    pub fn unbang(&self, slot: usize) -> Result<(), TriggerError> {
        self.check_slot(slot)?;
        trace!(slot, "Unbang");
        self.stimuli[slot].unbang();
        Ok(())
    }

    /// Explicitly requests that a slot start, replacing any pending
    /// request. Lock-free.
    pub fn start(&self, slot: usize) -> Result<(), TriggerError> {
        self.check_slot(slot)?;
        self.stimuli[slot].request(RequestedState::Running);
        Ok(())
    }

    /// Explicitly requests that a slot stop at its next quantization
    /// point, replacing any pending request. Lock-free.
    pub fn stop(&self, slot: usize) -> Result<(), TriggerError> {
        self.check_slot(slot)?;
        self.stimuli[slot].request(RequestedState::Stopped);
        Ok(())
    }

    /// Latches a stop of every slot; the audio thread clears the latch at
    /// its next slice prologue. Lock-free.
    pub fn request_stop_all(&self) {
        self.stop_all.store(true, Ordering::Release);
    }

    /// Bangs a slot through the coalescing queue instead of the direct
    /// counter. UI threads that batch gestures use this entry point.
    pub fn queue_bang(&self, slot: usize) -> Result<(), TriggerError> {
        self.check_slot(slot)?;
        if self.bang_prod.lock().try_push(slot).is_err() {
            warn!(slot, "Bang queue full, dropping stimulus");
        }
        Ok(())
    }

    /// Unbangs a slot through the coalescing queue.
    pub fn queue_unbang(&self, slot: usize) -> Result<(), TriggerError> {
        self.check_slot(slot)?;
        if self.unbang_prod.lock().try_push(slot).is_err() {
            warn!(slot, "Unbang queue full, dropping stimulus");
        }
        Ok(())
    }

    /// Assigns a region to a stopped slot, pulling its data into memory.
    /// The region's media must match the box's data type.
    pub fn set_region(&self, slot: usize, region: Region) -> Result<(), TriggerError> {
        self.check_slot(slot)?;
        let mut inner = self.inner.write();
        if inner.slots[slot].state() != TriggerState::Stopped {
            return Err(TriggerError::SlotActive(slot));
        }
        match (self.data_type, &region) {
            (DataType::Audio, _) => inner.slots[slot].set_region(region, &self.tempo),
            (DataType::Midi, Region::Midi) => {
                // MIDI playback is not realized; the slot holds the stub
                // and stays non-runnable.
                inner.slots[slot].set_midi_stub();
                Ok(())
            }
            (DataType::Midi, Region::Audio(_)) => Err(TriggerError::MediaMismatch),
        }
    }

    /// Loads an audio file into a stopped slot.
    pub fn set_from_path(&self, slot: usize, path: &Path) -> Result<(), TriggerError> {
        self.check_slot(slot)?;
        let region = match WavRegion::from_path(path) {
            Ok(region) => region,
            Err(e) => {
                error!(slot, path = ?path, error = %e, "Cannot load audio file into slot");
                return Err(e.into());
            }
        };
        self.set_region(slot, Region::Audio(Arc::new(region)))
    }

    /// Stretches a stopped slot's clip to `target_samples`.
    ///
    /// The stretch itself runs without holding the slot lock so the audio
    /// thread keeps running; the stretched buffers are swapped in under
    /// the write lock afterwards. A second `set_length` must not be issued
    /// against the same slot while one is in flight.
    pub fn set_length(&self, slot: usize, target_samples: u64) -> Result<(), TriggerError> {
        self.check_slot(slot)?;

        // Snapshot the clip data under the read lock.
        let (data, data_length) = {
            let inner = self.inner.read();
            let trigger = &inner.slots[slot];
            if trigger.state() != TriggerState::Stopped {
                return Err(TriggerError::SlotActive(slot));
            }
            let clip = trigger.clip().ok_or(TriggerError::SlotEmpty(slot))?;
            (clip.data_clone(), clip.data_length())
        };

        if target_samples == data_length {
            // No stretch required.
            return Ok(());
        }

        let ratio = target_samples as f64 / data_length as f64;
        let mut stretcher = ResampleStretcher::new(data.len());
        let stretched = crate::stretch::stretch_channels(&data, ratio, &mut stretcher)?;

        // Swap in under the write lock, but only if the slot is still
        // reloadable.
        let mut inner = self.inner.write();
        if inner.slots[slot].state() != TriggerState::Stopped {
            return Err(TriggerError::SlotActive(slot));
        }
        inner.slots[slot].apply_stretched(stretched, &self.tempo);
        Ok(())
    }

    /// Sets where playback begins inside a stopped slot's clip data.
    pub fn set_clip_start(&self, slot: usize, offset: u64) -> Result<(), TriggerError> {
        self.check_slot(slot)?;
        let mut inner = self.inner.write();
        if inner.slots[slot].state() != TriggerState::Stopped {
            return Err(TriggerError::SlotActive(slot));
        }
        match inner.slots[slot].clip_mut() {
            Some(clip) => {
                clip.set_start(offset);
                // A stopped slot's cursor rests at its start offset.
                clip.retrigger();
                Ok(())
            }
            None => Err(TriggerError::SlotEmpty(slot)),
        }
    }

    /// Sets a slot's launch style.
    pub fn set_launch_style(&self, slot: usize, style: LaunchStyle) -> Result<(), TriggerError> {
        self.check_slot(slot)?;
        self.inner.write().slots[slot].set_launch_style(style, &self.tempo);
        Ok(())
    }

    /// Sets one of a slot's two follow actions.
    pub fn set_follow_action(
        &self,
        slot: usize,
        which: usize,
        action: FollowAction,
    ) -> Result<(), TriggerError> {
        self.check_slot(slot)?;
        self.inner.write().slots[slot].set_follow_action(which, action)
    }

    /// Sets the probability weight selecting follow action 0, clamped to
    /// 0..=100.
    pub fn set_follow_action_probability(
        &self,
        slot: usize,
        probability: i32,
    ) -> Result<(), TriggerError> {
        self.check_slot(slot)?;
        self.inner.write().slots[slot].set_follow_action_probability(probability);
        Ok(())
    }

    /// Sets a slot's quantization grid. Bar-level grids are rejected.
    pub fn set_quantization(&self, slot: usize, quantization: BbtOffset) -> Result<(), TriggerError> {
        self.check_slot(slot)?;
        self.inner.write().slots[slot].set_quantization(quantization, &self.tempo)
    }

    /// Sets a slot's legato flag.
    pub fn set_legato(&self, slot: usize, legato: bool) -> Result<(), TriggerError> {
        self.check_slot(slot)?;
        self.inner.write().slots[slot].set_legato(legato);
        Ok(())
    }

    /// Renames a slot.
    pub fn set_name(&self, slot: usize, name: &str) -> Result<(), TriggerError> {
        self.check_slot(slot)?;
        self.inner.write().slots[slot].set_name(name);
        Ok(())
    }

    /// A slot's lifecycle state.
    pub fn state(&self, slot: usize) -> Result<TriggerState, TriggerError> {
        self.check_slot(slot)?;
        Ok(self.inner.read().slots[slot].state())
    }

    /// True if a slot has a region loaded.
    pub fn runnable(&self, slot: usize) -> Result<bool, TriggerError> {
        self.check_slot(slot)?;
        Ok(self.inner.read().slots[slot].runnable())
    }

    /// A slot's name.
    pub fn name(&self, slot: usize) -> Result<String, TriggerError> {
        self.check_slot(slot)?;
        Ok(self.inner.read().slots[slot].name().to_string())
    }

    /// A slot's legato flag.
    pub fn legato(&self, slot: usize) -> Result<bool, TriggerError> {
        self.check_slot(slot)?;
        Ok(self.inner.read().slots[slot].legato())
    }

    // --- persistence ----------------------------------------------------

    /// Captures the bank's behavioral state. Live playback state (cursors,
    /// wait flags, queues) is not part of the snapshot.
    pub fn snapshot(&self) -> TriggerBoxSnapshot {
        let inner = self.inner.read();
        TriggerBoxSnapshot {
            data_type: self.data_type,
            triggers: inner
                .slots
                .iter()
                .map(|trigger| {
                    let clip = trigger.clip();
                    TriggerSnapshot {
                        index: trigger.index(),
                        name: trigger.name().to_string(),
                        legato: trigger.legato(),
                        launch_style: trigger.launch_style(),
                        follow_action_0: trigger.follow_action(0).expect("two follow actions"),
                        follow_action_1: trigger.follow_action(1).expect("two follow actions"),
                        follow_action_probability: trigger.follow_action_probability(),
                        quantization: trigger.quantization(),
                        region: clip.map(|c| c.region().id().to_string()),
                        start: clip.map(|c| c.start_offset()).unwrap_or(0),
                        length: clip.map(|c| c.usable_length()).unwrap_or(0),
                    }
                })
                .collect(),
        }
    }

    /// Restores a snapshot onto this bank, resolving region references
    /// through `resolver`. Snapshot entries for slots the bank doesn't
    /// have, or regions the resolver can't find, are skipped with a
    /// warning; nothing poisons the remaining slots.
    pub fn restore<F>(&self, snapshot: &TriggerBoxSnapshot, resolver: F) -> Result<(), TriggerError>
    where
        F: Fn(&str) -> Option<Region>,
    {
        let mut inner = self.inner.write();
        for saved in &snapshot.triggers {
            let Some(trigger) = inner.slots.get_mut(saved.index) else {
                warn!(slot = saved.index, "Snapshot refers to a slot beyond the bank");
                continue;
            };

            trigger.set_name(saved.name.clone());
            trigger.set_legato(saved.legato);
            trigger.set_launch_style(saved.launch_style, &self.tempo);
            trigger.set_follow_action(0, saved.follow_action_0)?;
            trigger.set_follow_action(1, saved.follow_action_1)?;
            trigger.set_follow_action_probability(saved.follow_action_probability as i32);
            trigger.set_quantization(saved.quantization, &self.tempo)?;

            if let Some(region_id) = &saved.region {
                match resolver(region_id) {
                    Some(region) => match trigger.set_region(region, &self.tempo) {
                        Ok(()) => {
                            if let Some(clip) = trigger.clip_mut() {
                                clip.set_start(saved.start);
                                clip.set_usable_length(saved.length);
                                clip.retrigger();
                            }
                            // The snapshot's name wins over the region's.
                            trigger.set_name(saved.name.clone());
                        }
                        Err(e) => {
                            error!(
                                slot = saved.index,
                                region = region_id.as_str(),
                                error = %e,
                                "Region failed to load while restoring, slot left empty"
                            );
                        }
                    },
                    None => {
                        warn!(
                            slot = saved.index,
                            region = region_id.as_str(),
                            "Region not found while restoring, slot left empty"
                        );
                    }
                }
            }
        }
        Ok(())
    }

    // --- audio-thread driver --------------------------------------------

    /// Runs one processing slice.
    ///
    /// `nframes` must equal `end_sample - start_sample`. A negative
    /// `start_sample` (latency compensation the engine cannot service) and
    /// a buffer set without a MIDI input are refused.
    pub fn run(
        &self,
        bufs: &mut BufferSet,
        start_sample: i64,
        end_sample: i64,
        _speed: f64,
        nframes: usize,
        _result_required: bool,
    ) {
        if start_sample < 0 {
            return;
        }
        debug_assert_eq!((end_sample - start_sample).max(0) as usize, nframes);
        if bufs.midi_ports() < 1 {
            trace!("No MIDI input configured, refusing slice");
            return;
        }

        // Never block the audio thread: if a control thread holds the slot
        // lock, output silence and pick up next slice.
        let Some(mut guard) = self.inner.try_write() else {
            bufs.silence_all();
            return;
        };
        let inner = &mut *guard;

        bufs.silence_all();

        // Drain the UI coalescing queues into the per-slot counters.
        while let Some(slot) = inner.bang_cons.try_pop() {
            if let Some(stimulus) = self.stimuli.get(slot) {
                stimulus.bang();
            }
        }
        while let Some(slot) = inner.unbang_cons.try_pop() {
            if let Some(stimulus) = self.stimuli.get(slot) {
                stimulus.unbang();
            }
        }

        self.process_midi_trigger_requests(bufs);

        // Let each slot translate its pending stimuli into state changes.
        for n in 0..inner.slots.len() {
            let outcome = inner.slots[n].process_state_requests(&self.stimuli[n]);
            if outcome.clear_implicit {
                inner.implicit_cons.clear();
            }
            if outcome.queue_explicit {
                Self::queue_explicit(inner, &self.stimuli, n);
            }
        }

        if inner.currently_playing.is_none() {
            if let Some(next) = Self::get_next_trigger(inner) {
                debug!(slot = next, "Starting from queue");
                inner.slots[next].startup();
                inner.currently_playing = Some(next);
            }
        }
        if inner.currently_playing.is_none() {
            return;
        }

        // Triggers only make sense against a rolling transport.
        if !self.transport.rolling() {
            self.transport.request_roll();
        }

        // Legato peek: an explicitly queued slot with legato set splices in
        // right now instead of waiting for quantization.
        let head = inner.explicit_cons.iter().next().copied();
        if let Some(head) = head {
            let playing = inner.currently_playing.expect("checked above");
            if head == playing {
                // The user re-triggered the playing slot; nothing to do.
                inner.explicit_cons.try_pop();
            } else if inner.slots[head].legato() {
                inner.explicit_cons.try_pop();
                let position = inner.slots[playing].legato_position();
                inner.slots[head].set_legato_offset(position);
                inner.slots[head].jump_start();
                inner.slots[playing].jump_stop();
                Self::prepare_next(inner, head);
                debug!(from = playing, to = head, position, "Legato splice");
                inner.currently_playing = Some(head);
            }
            // Without legato the queued slot waits for the current clip's
            // end; the pop is delayed until then.
        }

        if self.stop_all.swap(false, Ordering::AcqRel) {
            debug!("Stop-all latched, stopping every slot");
            for trigger in &mut inner.slots {
                trigger.jump_stop();
            }
            inner.explicit_cons.clear();
            inner.implicit_cons.clear();
            inner.currently_playing = None;
            return;
        }

        let start_beats = self.tempo.beats_at_sample(start_sample as u64);
        let end_beats = self.tempo.beats_at_sample(end_sample as u64);
        let mut max_chans = 0usize;
        let mut first = true;

        while let Some(playing) = inner.currently_playing {
            let transition = match inner.slots[playing].state() {
                TriggerState::WaitingToStop
                | TriggerState::WaitingToStart
                | TriggerState::WaitingForRetrigger => inner.slots[playing]
                    .maybe_compute_next_transition(start_beats, end_beats, &self.tempo),
                _ => Transition {
                    run: RunType::RunAll,
                    prepare_follow: false,
                },
            };

            if transition.run == RunType::RunNone {
                // Still waiting for a boundary on a later slice.
                return;
            }

            let (dest_offset, trigger_samples) = match transition.run {
                RunType::RunEnd => {
                    // Play only up to the stop boundary; the next slot or
                    // silence owns the rest of the slice.
                    let until = (inner.slots[playing].bang_sample() as i64 - start_sample)
                        .clamp(0, nframes as i64) as usize;
                    (0, until)
                }
                RunType::RunStart => {
                    let dest = (inner.slots[playing].bang_sample() as i64 - start_sample)
                        .clamp(0, nframes as i64) as usize;
                    (dest, nframes - dest)
                }
                RunType::RunAll => (0, nframes),
                RunType::RunNone => unreachable!(),
            };

            if transition.prepare_follow {
                Self::prepare_next(inner, playing);
            }

            let next_is_self = Self::peek_next_trigger(inner) == Some(playing);
            let channels = inner.slots[playing].run_slice(
                bufs,
                trigger_samples,
                dest_offset,
                first,
                next_is_self,
            );
            max_chans = max_chans.max(channels);
            first = false;

            if inner.slots[playing].state() == TriggerState::Stopped {
                debug!(slot = playing, "Slot finished");
                if let Some(next) = Self::get_next_trigger(inner) {
                    if inner.slots[next].legato() {
                        let position = inner.slots[playing].legato_position();
                        inner.slots[next].set_legato_offset(position);
                    }
                    inner.slots[next].startup();
                    inner.currently_playing = Some(next);
                } else {
                    inner.currently_playing = None;
                }
            } else {
                // The clip owns the rest of the slice.
                break;
            }
        }

        bufs.set_audio_count(max_chans);
    }

    /// Walks the slice's MIDI input buffers, banging and unbanging mapped
    /// slots. Non-note events and unmapped notes are dropped.
    fn process_midi_trigger_requests(&self, bufs: &BufferSet) {
        for port in 0..bufs.midi_ports() {
            for raw in bufs.midi(port).events() {
                let Some(stimulus) = classify(raw) else {
                    continue;
                };
                let (note, on) = match stimulus {
                    NoteStimulus::On(note) => (note, true),
                    NoteStimulus::Off(note) => (note, false),
                };
                let Some(slot) = self.midi_map.slot_for_note(note) else {
                    continue;
                };
                let Some(mailbox) = self.stimuli.get(slot) else {
                    // Mapped beyond the bank; drop it.
                    continue;
                };
                if on {
                    mailbox.bang();
                } else {
                    mailbox.unbang();
                }
            }
        }
    }

    /// Enqueues a user-driven start. Explicit always wins: the implicit
    /// queue is reset and the playing slot gets an unbang to start its
    /// wind-down.
    fn queue_explicit(inner: &mut Inner, stimuli: &[SlotStimulus], slot: usize) {
        inner.implicit_cons.clear();
        if let Some(playing) = inner.currently_playing {
            stimuli[playing].unbang();
        }
        if inner.explicit_cons.iter().any(|&queued| queued == slot) {
            return;
        }
        if inner.explicit_prod.try_push(slot).is_err() {
            warn!(slot, "Explicit queue full, dropping");
        }
    }

    /// Enqueues a follow-action start, unless the user has something
    /// queued.
    fn queue_implicit(inner: &mut Inner, slot: usize) {
        if !inner.explicit_cons.is_empty() {
            return;
        }
        if inner.implicit_cons.iter().any(|&queued| queued == slot) {
            return;
        }
        trace!(slot, "Implicit queue");
        if inner.implicit_prod.try_push(slot).is_err() {
            warn!(slot, "Implicit queue full, dropping");
        }
    }

    /// The next queued slot without consuming it. Explicit first.
    fn peek_next_trigger(inner: &Inner) -> Option<usize> {
        inner
            .explicit_cons
            .iter()
            .next()
            .or_else(|| inner.implicit_cons.iter().next())
            .copied()
    }

    /// Pops the next queued slot. Explicit first.
    fn get_next_trigger(inner: &mut Inner) -> Option<usize> {
        inner
            .explicit_cons
            .try_pop()
            .or_else(|| inner.implicit_cons.try_pop())
    }

    /// Resolves the follow action for `current` and queues the result, so
    /// the next slot is ready before the current one ends.
    fn prepare_next(inner: &mut Inner, current: usize) {
        if let Some(next) = Self::determine_next_trigger(inner, current) {
            trace!(current, next, "Prepared follow-up");
            Self::queue_implicit(inner, next);
        }
    }

    /// The follow-action resolver: picks one of the slot's two actions by
    /// probability, then maps it to a concrete slot (or no follow at all).
    fn determine_next_trigger(inner: &mut Inner, current: usize) -> Option<usize> {
        let n_slots = inner.slots.len();
        let runnable = inner.slots.iter().filter(|t| t.runnable()).count();

        let r = inner.rng.gen_range(0..100u8);
        let which = if r <= inner.slots[current].follow_action_probability() {
            0
        } else {
            1
        };
        let action = inner.slots[current]
            .follow_action(which)
            .unwrap_or(FollowAction::Stop);

        // No-follow actions hold even on the single-runnable fast path.
        match action {
            FollowAction::Stop => return None,
            // Reserved; resolves like Stop.
            FollowAction::QueuedTrigger => return None,
            _ => {}
        }

        if runnable == 1 {
            // The only runnable slot is the current one.
            return Some(current);
        }

        let usable = |t: &Trigger| t.runnable() && !t.active();

        match action {
            FollowAction::Again => Some(current),
            FollowAction::NextTrigger => {
                let mut n = current;
                loop {
                    n = (n + 1) % n_slots;
                    if n == current {
                        break Some(current);
                    }
                    if usable(&inner.slots[n]) {
                        break Some(n);
                    }
                }
            }
            FollowAction::PrevTrigger => {
                let mut n = current;
                loop {
                    n = n.checked_sub(1).unwrap_or(n_slots - 1);
                    if n == current {
                        break Some(current);
                    }
                    if usable(&inner.slots[n]) {
                        break Some(n);
                    }
                }
            }
            FollowAction::FirstTrigger => inner
                .slots
                .iter()
                .position(usable)
                .or(Some(current)),
            FollowAction::LastTrigger => inner
                .slots
                .iter()
                .rposition(usable)
                .or(Some(current)),
            FollowAction::AnyTrigger => loop {
                let n = inner.rng.gen_range(0..n_slots);
                if usable(&inner.slots[n]) {
                    break Some(n);
                }
            },
            FollowAction::OtherTrigger => loop {
                let n = inner.rng.gen_range(0..n_slots);
                if n != current && usable(&inner.slots[n]) {
                    break Some(n);
                }
            },
            FollowAction::Stop | FollowAction::QueuedTrigger => unreachable!(),
        }
    }
}

impl std::fmt::Debug for TriggerBox {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.read();
        f.debug_struct("TriggerBox")
            .field("data_type", &self.data_type)
            .field("slots", &inner.slots.len())
            .field("currently_playing", &inner.currently_playing)
            .finish()
    }
}
