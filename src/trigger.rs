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

//! The per-slot trigger state machine.
//!
//! This module provides:
//! - Stimulus intake: lock-free bang/unbang counters and the replace-only
//!   requested-state cell, drained once per slice
//! - Quantized transition computation against the slice's musical interval
//! - The slot's launch policy: launch style, follow actions, quantization
//!   grid, legato flag
//!
//! The state machine is shared by every slot regardless of media type; the
//! audio clip itself lives in [`clip`]. Methods called on the audio thread
//! return instruction values instead of calling back into the box, so the
//! box applies queue effects itself.

pub mod clip;

use std::sync::atomic::{AtomicU32, AtomicU8, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use crate::buffers::BufferSet;
use crate::notify::{ChangeObserver, Property};
use crate::region::Region;
use crate::stretch::{StretchError, TimeStretcher};
use crate::tempo::{BbtOffset, Beats, TempoError, TempoMap};

use self::clip::AudioClip;

/// Slices shorter than this cannot contain an inaudible fade-out; a
/// stopping clip holds its fade until a long-enough slice arrives.
pub const MIN_FADE_SAMPLES: usize = 64;

/// Errors from slot operations.
#[derive(Debug, thiserror::Error)]
pub enum TriggerError {
    #[error("no such slot: {0}")]
    NoSuchSlot(usize),

    #[error("slot {0} is not stopped")]
    SlotActive(usize),

    #[error("slot {0} has no region loaded")]
    SlotEmpty(usize),

    #[error("follow action index out of range: {0}")]
    BadFollowActionIndex(usize),

    #[error("region media does not match slot media")]
    MediaMismatch,

    #[error("failed to load region data: {0}")]
    Load(#[from] crate::region::RegionError),

    #[error(transparent)]
    Quantization(#[from] TempoError),

    #[error(transparent)]
    Stretch(#[from] StretchError),
}

/// The lifecycle of one slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum TriggerState {
    Stopped,
    WaitingToStart,
    Running,
    WaitingForRetrigger,
    WaitingToStop,
    /// Distinct from `Stopped` only to reserve a short fade-out window.
    Stopping,
}

impl TriggerState {
    /// True once the slot has reached its quantized start.
    pub fn active(&self) -> bool {
        *self >= TriggerState::Running
    }
}

/// What a bang does, per slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum LaunchStyle {
    /// Bang starts; the next bang re-arms a retrigger.
    OneShot,
    /// Runs while held; unbang stops at the next quantization point.
    Gate,
    /// Bang starts, the next bang stops.
    #[default]
    Toggle,
    /// Like Gate, but the effective clip length is truncated to one
    /// quantization unit.
    Repeat,
}

/// What happens when a clip reaches its end.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FollowAction {
    Stop,
    Again,
    /// Reserved; resolves like `Stop`.
    QueuedTrigger,
    NextTrigger,
    PrevTrigger,
    FirstTrigger,
    LastTrigger,
    AnyTrigger,
    OtherTrigger,
}

/// An explicit state request from the control surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestedState {
    Stopped,
    Running,
}

const REQ_NONE: u8 = 0;
const REQ_STOPPED: u8 = 1;
const REQ_RUNNING: u8 = 2;

/// The per-slot lock-free stimulus mailbox.
///
/// Producers (UI, MIDI import) increment the saturating counters and store
/// requests; the audio thread drains them once per slice. Bangs are
/// processed in FIFO order by count only; setting the requested state
/// replaces any previous request.
#[derive(Debug, Default)]
pub struct SlotStimulus {
    bang: AtomicU32,
    unbang: AtomicU32,
    requested: AtomicU8,
}

impl SlotStimulus {
    /// Creates an idle mailbox.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers one bang.
    pub fn bang(&self) {
        let _ = self
            .bang
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |v| v.checked_add(1));
    }

    /// Registers one unbang.
    pub fn unbang(&self) {
        let _ = self
            .unbang
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |v| v.checked_add(1));
    }

    /// Stores an explicit state request, replacing any pending one.
    pub fn request(&self, state: RequestedState) {
        let raw = match state {
            RequestedState::Stopped => REQ_STOPPED,
            RequestedState::Running => REQ_RUNNING,
        };
        self.requested.store(raw, Ordering::Release);
    }

    /// Reads and clears the pending request.
    fn take_request(&self) -> Option<RequestedState> {
        match self.requested.swap(REQ_NONE, Ordering::AcqRel) {
            REQ_STOPPED => Some(RequestedState::Stopped),
            REQ_RUNNING => Some(RequestedState::Running),
            _ => None,
        }
    }

    /// Consumes one pending bang, if any.
    fn take_bang(&self) -> bool {
        self.bang
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |v| v.checked_sub(1))
            .is_ok()
    }

    /// Consumes one pending unbang, if any.
    fn take_unbang(&self) -> bool {
        self.unbang
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |v| v.checked_sub(1))
            .is_ok()
    }
}

/// Queue effects a stimulus drain asks the box to apply.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct StateRequestOutcome {
    /// Enqueue this slot on the explicit queue.
    pub queue_explicit: bool,
    /// Reset the implicit queue so follow actions don't pile up behind a
    /// requested stop.
    pub clear_implicit: bool,
}

/// How much of the slice the slot should produce.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunType {
    /// Play until the stop boundary, then end.
    RunEnd,
    /// Start at the quantized boundary, play through slice end.
    RunStart,
    /// Play the full slice.
    RunAll,
    /// Produce nothing.
    RunNone,
}

/// The verdict of a quantized transition check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    pub run: RunType,
    /// The slot just entered `Running`; the box should resolve and queue
    /// its follow-up now, hiding scheduling latency inside the clip's
    /// remaining duration.
    pub prepare_follow: bool,
}

impl Transition {
    fn just(run: RunType) -> Self {
        Self {
            run,
            prepare_follow: false,
        }
    }
}

/// The media behind a slot.
pub enum TriggerMedia {
    /// No region loaded; the slot is not runnable.
    Empty,
    /// A loaded audio clip.
    Audio(AudioClip),
    /// MIDI slot media: modeled, never realized. The per-slice fill
    /// produces nothing.
    Midi,
}

/// One slot of the trigger box.
pub struct Trigger {
    index: usize,
    name: String,
    state: TriggerState,
    launch_style: LaunchStyle,
    follow_action: [FollowAction; 2],
    follow_action_probability: u8,
    quantization: BbtOffset,
    legato: bool,
    /// Sample position of the most recent quantized transition.
    bang_sample: u64,
    /// Musical position of the most recent quantized transition.
    bang_beat: Beats,
    media: TriggerMedia,
    observer: Arc<dyn ChangeObserver>,
}

impl Trigger {
    /// Creates an empty slot.
    pub fn new(index: usize, observer: Arc<dyn ChangeObserver>) -> Self {
        Self {
            index,
            name: String::new(),
            state: TriggerState::Stopped,
            launch_style: LaunchStyle::default(),
            follow_action: [FollowAction::NextTrigger, FollowAction::Stop],
            follow_action_probability: 100,
            quantization: BbtOffset::new(0, 1, 0),
            legato: true,
            bang_sample: 0,
            bang_beat: Beats::ZERO,
            media: TriggerMedia::Empty,
            observer,
        }
    }

    /// The slot's index in the bank.
    pub fn index(&self) -> usize {
        self.index
    }

    /// The slot's name, usually taken from the loaded region.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Renames the slot.
    pub fn set_name(&mut self, name: impl Into<String>) {
        self.name = name.into();
        self.observer.property_changed(self.index, Property::Name);
    }

    /// The current lifecycle state.
    pub fn state(&self) -> TriggerState {
        self.state
    }

    /// True once the slot has reached its quantized start.
    pub fn active(&self) -> bool {
        self.state.active()
    }

    /// True if a region is loaded, whether or not the slot is playing.
    pub fn runnable(&self) -> bool {
        matches!(self.media, TriggerMedia::Audio(_))
    }

    /// The launch style.
    pub fn launch_style(&self) -> LaunchStyle {
        self.launch_style
    }

    /// Sets the launch style and recomputes the usable clip window.
    pub fn set_launch_style(&mut self, style: LaunchStyle, tempo: &TempoMap) {
        self.launch_style = style;
        self.set_usable_length(tempo);
    }

    /// One of the two follow actions.
    pub fn follow_action(&self, n: usize) -> Result<FollowAction, TriggerError> {
        self.follow_action
            .get(n)
            .copied()
            .ok_or(TriggerError::BadFollowActionIndex(n))
    }

    /// Sets one of the two follow actions.
    pub fn set_follow_action(&mut self, n: usize, action: FollowAction) -> Result<(), TriggerError> {
        *self
            .follow_action
            .get_mut(n)
            .ok_or(TriggerError::BadFollowActionIndex(n))? = action;
        Ok(())
    }

    /// The probability weight (0..=100) selecting follow action 0.
    pub fn follow_action_probability(&self) -> u8 {
        self.follow_action_probability
    }

    /// Sets the follow action probability, clamped to 0..=100.
    pub fn set_follow_action_probability(&mut self, probability: i32) {
        self.follow_action_probability = probability.clamp(0, 100) as u8;
    }

    /// The quantization grid.
    pub fn quantization(&self) -> BbtOffset {
        self.quantization
    }

    /// Sets the quantization grid. Bar-level grids are rejected.
    pub fn set_quantization(
        &mut self,
        quantization: BbtOffset,
        tempo: &TempoMap,
    ) -> Result<(), TriggerError> {
        quantization.validate()?;
        self.quantization = quantization;
        self.set_usable_length(tempo);
        Ok(())
    }

    /// Whether this slot splices into a running clip without waiting for a
    /// quantization point.
    pub fn legato(&self) -> bool {
        self.legato
    }

    /// Sets the legato flag.
    pub fn set_legato(&mut self, legato: bool) {
        self.legato = legato;
        self.observer.property_changed(self.index, Property::Legato);
    }

    /// Sample position of the most recent quantized transition.
    pub fn bang_sample(&self) -> u64 {
        self.bang_sample
    }

    /// Musical position of the most recent quantized transition.
    pub fn bang_beat(&self) -> Beats {
        self.bang_beat
    }

    /// The loaded clip, if any.
    pub fn clip(&self) -> Option<&AudioClip> {
        match &self.media {
            TriggerMedia::Audio(clip) => Some(clip),
            _ => None,
        }
    }

    /// The loaded clip for mutation, if any.
    pub(crate) fn clip_mut(&mut self) -> Option<&mut AudioClip> {
        match &mut self.media {
            TriggerMedia::Audio(clip) => Some(clip),
            _ => None,
        }
    }

    /// Assigns a region to this slot, pulling its data into memory.
    ///
    /// All-or-nothing: on failure the slot is left empty. Only legal while
    /// the slot is stopped; the box enforces that.
    pub fn set_region(&mut self, region: Region, tempo: &TempoMap) -> Result<(), TriggerError> {
        match region {
            Region::Audio(region) => {
                let name = region.name().to_string();
                match AudioClip::load(region) {
                    Ok(clip) => {
                        self.media = TriggerMedia::Audio(clip);
                        self.set_name(name);
                        self.set_usable_length(tempo);
                        Ok(())
                    }
                    Err(e) => {
                        self.media = TriggerMedia::Empty;
                        Err(e.into())
                    }
                }
            }
            // An audio slot refuses MIDI media outright.
            Region::Midi => Err(TriggerError::MediaMismatch),
        }
    }

    /// Marks this slot as holding MIDI media. The variant is modeled but
    /// playback is not realized, so the slot stays non-runnable.
    pub(crate) fn set_midi_stub(&mut self) {
        self.media = TriggerMedia::Midi;
    }

    /// Stretches the clip so its data length matches `target_samples`.
    /// Control-thread only, and only while the slot is stopped.
    pub fn set_length(
        &mut self,
        target_samples: u64,
        stretcher: &mut dyn TimeStretcher,
        tempo: &TempoMap,
    ) -> Result<(), TriggerError> {
        let index = self.index;
        let clip = match self.clip_mut() {
            Some(clip) => clip,
            None => return Err(TriggerError::SlotEmpty(index)),
        };
        clip.stretch_to(target_samples, stretcher)?;
        self.set_usable_length(tempo);
        Ok(())
    }

    /// Swaps in stretched clip data prepared off-lock and reapplies the
    /// launch-policy window on top of it.
    pub(crate) fn apply_stretched(&mut self, data: Vec<Vec<f32>>, tempo: &TempoMap) {
        if let Some(clip) = self.clip_mut() {
            clip.replace_data(data);
        }
        self.set_usable_length(tempo);
    }

    /// Recomputes the usable clip window: Repeat truncates to one
    /// quantization unit, everything else plays the full data length.
    fn set_usable_length(&mut self, tempo: &TempoMap) {
        let style = self.launch_style;
        let quantization = self.quantization;
        if let Some(clip) = self.clip_mut() {
            match style {
                LaunchStyle::Repeat if !quantization.is_zero() => {
                    clip.set_usable_length(tempo.grid_samples(quantization));
                }
                _ => clip.use_full_length(),
            }
        }
    }

    fn set_state(&mut self, state: TriggerState) {
        if self.state != state {
            trace!(slot = self.index, from = ?self.state, to = ?state, "State change");
            self.state = state;
            self.observer.property_changed(self.index, Property::Running);
        }
    }

    /// Enters `Stopped`, resetting the read cursor so a stopped slot
    /// always sits at its start offset.
    fn enter_stopped(&mut self) {
        self.set_state(TriggerState::Stopped);
        if let Some(clip) = self.clip_mut() {
            clip.clear_legato_offset();
            clip.retrigger();
        }
    }

    /// Begins a normal (quantized) start: the slot waits for the grid.
    pub fn startup(&mut self) {
        self.set_state(TriggerState::WaitingToStart);
        if let Some(clip) = self.clip_mut() {
            clip.retrigger();
        }
    }

    /// Starts immediately, without waiting for quantization. Used for the
    /// incoming side of a legato splice.
    pub fn jump_start(&mut self) {
        self.set_state(TriggerState::Running);
        if let Some(clip) = self.clip_mut() {
            clip.retrigger();
        }
    }

    /// Stops immediately, without waiting for quantization. Used for the
    /// outgoing side of a legato splice and for stop-all.
    pub fn jump_stop(&mut self) {
        self.enter_stopped();
    }

    /// Hands the outgoing clip's position to this slot for a legato
    /// splice; consumed by the next retrigger.
    pub fn set_legato_offset(&mut self, offset: u64) {
        if let Some(clip) = self.clip_mut() {
            clip.set_legato_offset(offset);
        }
    }

    /// The clip position a legato successor should splice in at: the read
    /// cursor relative to the clip's start offset.
    pub fn legato_position(&self) -> u64 {
        self.clip()
            .map(|clip| clip.read_index().saturating_sub(clip.start_offset()))
            .unwrap_or(0)
    }

    /// Drains the stimulus mailbox, applying state transitions. Called
    /// once per slice per slot, before any playback.
    pub fn process_state_requests(&mut self, stimulus: &SlotStimulus) -> StateRequestOutcome {
        let mut outcome = StateRequestOutcome::default();

        match stimulus.take_request() {
            Some(RequestedState::Stopped) => {
                if self.state != TriggerState::Stopped && self.state != TriggerState::WaitingToStop
                {
                    debug!(slot = self.index, "Requested stop, waiting for grid");
                    // The actual stop is deferred to the next quantization
                    // boundary.
                    self.set_state(TriggerState::WaitingToStop);
                }
            }
            Some(RequestedState::Running) => {
                // An empty slot is not runnable; the request is dropped.
                if self.state != TriggerState::Running && self.runnable() {
                    outcome.queue_explicit = true;
                }
            }
            None => {}
        }

        while stimulus.take_bang() {
            trace!(slot = self.index, state = ?self.state, "Handling bang");
            match self.state {
                TriggerState::Running => match self.launch_style {
                    LaunchStyle::OneShot => {
                        self.set_state(TriggerState::WaitingForRetrigger);
                    }
                    LaunchStyle::Gate | LaunchStyle::Toggle | LaunchStyle::Repeat => {
                        self.set_state(TriggerState::WaitingToStop);
                        outcome.clear_implicit = true;
                    }
                },
                TriggerState::Stopped => {
                    if self.runnable() {
                        outcome.queue_explicit = true;
                    }
                }
                // A stacked bang during a quantization wait is absorbed.
                TriggerState::WaitingToStart
                | TriggerState::WaitingToStop
                | TriggerState::WaitingForRetrigger
                | TriggerState::Stopping => {}
            }
        }

        while stimulus.take_unbang() {
            if self.launch_style == LaunchStyle::Gate || self.launch_style == LaunchStyle::Repeat {
                match self.state {
                    TriggerState::Running => {
                        debug!(slot = self.index, "Unbanged, waiting for grid to stop");
                        self.set_state(TriggerState::WaitingToStop);
                    }
                    TriggerState::Stopped => {}
                    _ => {
                        // The start never happened; cancel it.
                        debug!(slot = self.index, "Unbanged before start, stopping");
                        self.enter_stopped();
                    }
                }
            }
        }

        outcome
    }

    /// Checks whether a quantized transition falls inside the slice
    /// `[start, end)` and applies it.
    pub fn maybe_compute_next_transition(
        &mut self,
        start: Beats,
        end: Beats,
        tempo: &TempoMap,
    ) -> Transition {
        // In these states there is no transition to wait for.
        match self.state {
            TriggerState::Stopped => return Transition::just(RunType::RunNone),
            TriggerState::Running | TriggerState::Stopping => {
                return Transition::just(RunType::RunAll)
            }
            _ => {}
        }

        let ev_time = start.snap_up(self.quantization.as_beats());
        debug_assert!(ev_time >= start);

        if ev_time < end {
            self.bang_sample = tempo.sample_at_beats(ev_time);
            self.bang_beat = ev_time;

            match self.state {
                TriggerState::WaitingToStop => {
                    self.set_state(TriggerState::Stopping);
                    Transition::just(RunType::RunEnd)
                }
                TriggerState::WaitingToStart => {
                    if let Some(clip) = self.clip_mut() {
                        clip.retrigger();
                    }
                    self.set_state(TriggerState::Running);
                    Transition {
                        run: RunType::RunStart,
                        prepare_follow: true,
                    }
                }
                TriggerState::WaitingForRetrigger => {
                    if let Some(clip) = self.clip_mut() {
                        clip.retrigger();
                    }
                    self.set_state(TriggerState::Running);
                    // The retrigger itself is the event; the whole slice
                    // plays.
                    Transition {
                        run: RunType::RunAll,
                        prepare_follow: true,
                    }
                }
                _ => unreachable!("non-waiting states returned above"),
            }
        } else {
            match self.state {
                // The boundary hasn't arrived; the old clip keeps playing.
                TriggerState::WaitingForRetrigger | TriggerState::WaitingToStop => {
                    Transition::just(RunType::RunAll)
                }
                _ => Transition::just(RunType::RunNone),
            }
        }
    }

    /// Fills `trigger_samples` of output starting at `dest_offset`.
    ///
    /// `first` selects replace vs accumulate semantics; `next_is_self` is
    /// the box's peek at the queues, enabling the self-repeat loop
    /// shorthand. Returns the clip's channel count for the box's reported
    /// channel bookkeeping.
    pub fn run_slice(
        &mut self,
        bufs: &mut BufferSet,
        trigger_samples: usize,
        dest_offset: usize,
        first: bool,
        next_is_self: bool,
    ) -> usize {
        debug_assert!(self.active() || self.state == TriggerState::WaitingToStop);

        let long_enough_to_fade = trigger_samples >= MIN_FADE_SAMPLES;
        let fade = self.state == TriggerState::Stopping && long_enough_to_fade;
        let repeat = self.launch_style == LaunchStyle::Repeat || next_is_self;

        let index = self.index;
        let clip = match &mut self.media {
            TriggerMedia::Audio(clip) => clip,
            // MIDI playback is not realized; the other media produce
            // nothing.
            _ => return 0,
        };

        let fade_start = dest_offset;
        let mut nframes = trigger_samples;
        let mut dest_offset = dest_offset;
        let mut exhausted = false;

        while nframes > 0 {
            let this_read = clip.fill(bufs, nframes, dest_offset, first);

            if clip.at_end() {
                if repeat {
                    nframes -= this_read;
                    dest_offset += this_read;
                    trace!(slot = index, "Clip end reached, looping");
                    clip.retrigger();
                    continue;
                }

                if this_read < nframes {
                    trace!(slot = index, "Clip end reached, silencing tail");
                    for channel in 0..bufs.audio_channels() {
                        bufs.audio_mut(channel)
                            .silence(nframes - this_read, dest_offset + this_read);
                    }
                }
                exhausted = true;
                break;
            }

            nframes -= this_read;
        }

        let channels = clip.n_channels();

        // Ramp the final segment down so the stop lands silently. Only the
        // replace fill can be scaled in place; an accumulated splice keeps
        // its level.
        if fade && first && trigger_samples > 0 {
            for channel in 0..bufs.audio_channels() {
                let samples = bufs.audio_mut(channel).samples_mut();
                for (k, sample) in samples[fade_start..fade_start + trigger_samples]
                    .iter_mut()
                    .enumerate()
                {
                    *sample *= 1.0 - k as f32 / trigger_samples as f32;
                }
            }
        }

        if exhausted {
            self.enter_stopped();
        } else if self.state == TriggerState::Stopping && long_enough_to_fade {
            self.enter_stopped();
        }

        channels
    }
}
