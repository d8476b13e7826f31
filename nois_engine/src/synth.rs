//! The control shell around the voice pool.
//!
//! Owns the SPSC event queue feeding the audio thread, the command channel
//! from the control plane, and the outbound engine events. `process` is
//! the audio-thread entry point: drain commands, drain note events, then
//! advance the pool sample by sample.

use crossbeam_channel::{Receiver, Sender, TrySendError};
use log::debug;
use ringbuf::traits::{Consumer, Producer, Split};
use ringbuf::{HeapCons, HeapProd, HeapRb};

use nois_shared::events::NoteEvent;
use nois_shared::expression::{NoteExpression, NoteId};
use nois_shared::DEFAULT_VOICE_COUNT;

use crate::envelope::EnvelopeParams;
use crate::pool::VoicePool;
use crate::voice::{VoiceFrame, VoiceParams};

/// Capacity of the control-to-audio event queue.
const EVENT_QUEUE_CAPACITY: usize = 1024;

/// Control-plane commands, applied between audio blocks.
pub enum EngineCommand {
    SetAmpEnvelope(EnvelopeParams),
    SetFilterEnvelope(EnvelopeParams),
    SetGlideTime(f32),
    AllNotesOff,
    Reset,
}

/// Events the engine reports back to observers. Pushed with `try_send`
/// into a bounded channel; a slow consumer loses events rather than
/// stalling the audio thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineEvent {
    NoteTriggered(NoteId),
    NoteReleased(NoteId),
    /// Envelope completed; the voice and its record were reclaimed
    VoiceFinished(NoteId),
}

/// Handle given to the control plane: push note events, send commands.
pub struct EngineHandle {
    events: HeapProd<NoteEvent>,
    commands: Sender<EngineCommand>,
}

impl EngineHandle {
    /// Pushes a note event toward the audio thread. Returns false when
    /// the queue is full and the event was dropped.
    pub fn push_event(&mut self, event: NoteEvent) -> bool {
        self.events.try_push(event).is_ok()
    }

    pub fn send_command(&self, command: EngineCommand) {
        let _ = self.commands.send(command);
    }
}

/// Polyphonic expression synth: voice pool plus control glue.
pub struct Synth {
    pool: VoicePool,
    voice_params: VoiceParams,
    sample_rate: f32,
    dt: f32,
    event_rx: HeapCons<NoteEvent>,
    command_rx: Receiver<EngineCommand>,
    engine_events: Sender<EngineEvent>,
}

impl Synth {
    /// Builds the synth and its control handle. `engine_events` should be
    /// a bounded channel; overflow drops.
    pub fn new(
        sample_rate: f32,
        voice_count: usize,
        engine_events: Sender<EngineEvent>,
    ) -> (Self, EngineHandle) {
        let (event_tx, event_rx) = HeapRb::<NoteEvent>::new(EVENT_QUEUE_CAPACITY).split();
        let (command_tx, command_rx) = crossbeam_channel::unbounded();
        let synth = Self {
            pool: VoicePool::new(voice_count.max(1)),
            voice_params: VoiceParams::default(),
            sample_rate,
            dt: 1.0 / sample_rate,
            event_rx,
            command_rx,
            engine_events,
        };
        let handle = EngineHandle {
            events: event_tx,
            commands: command_tx,
        };
        (synth, handle)
    }

    pub fn with_defaults(sample_rate: f32, engine_events: Sender<EngineEvent>) -> (Self, EngineHandle) {
        Self::new(sample_rate, DEFAULT_VOICE_COUNT, engine_events)
    }

    pub fn sample_rate(&self) -> f32 {
        self.sample_rate
    }

    pub fn pool(&self) -> &VoicePool {
        &self.pool
    }

    pub fn voice_params(&self) -> VoiceParams {
        self.voice_params
    }

    /// Audio-thread entry point: applies pending control traffic, then
    /// advances all voices by `samples`. Frames land in `frames`, one
    /// slot per voice, for the DSP stage that renders them.
    pub fn process(&mut self, samples: usize, frames: &mut [VoiceFrame]) {
        self.drain_commands();
        self.drain_events();
        for _ in 0..samples {
            self.advance_sample();
        }
        for (slot, voice) in frames.iter_mut().zip(self.pool.voices()) {
            *slot = voice.frame();
        }
    }

    /// Applies one event inline. Also usable directly when the producer
    /// is the audio thread itself.
    pub fn apply_event(&mut self, event: NoteEvent) {
        match event {
            NoteEvent::NoteTriggered {
                id,
                velocity,
                bend_range,
            } => {
                let mut expression = NoteExpression::new(id.channel(), id.note(), velocity);
                expression.bend_range = bend_range;
                self.pool.note_on(expression, self.voice_params);
                self.emit(EngineEvent::NoteTriggered(id));
            }
            NoteEvent::NoteReleased { id, velocity } => {
                if self.pool.note_off(id, velocity) {
                    self.emit(EngineEvent::NoteReleased(id));
                }
            }
            NoteEvent::Expression { id, kind, value } => {
                self.pool.update_expression(id, kind, value);
            }
            NoteEvent::AllNotesOff => self.all_notes_off(),
        }
    }

    fn drain_events(&mut self) {
        while let Some(event) = self.event_rx.try_pop() {
            self.apply_event(event);
        }
    }

    fn drain_commands(&mut self) {
        while let Ok(command) = self.command_rx.try_recv() {
            match command {
                EngineCommand::SetAmpEnvelope(p) => self.voice_params.amp_envelope = p,
                EngineCommand::SetFilterEnvelope(p) => self.voice_params.filter_envelope = p,
                EngineCommand::SetGlideTime(t) => self.voice_params.glide_time = t.max(0.0),
                EngineCommand::AllNotesOff => self.all_notes_off(),
                EngineCommand::Reset => {
                    debug!("engine reset");
                    self.pool.reset();
                }
            }
        }
    }

    fn all_notes_off(&mut self) {
        for id in self.pool.all_notes_off() {
            self.emit(EngineEvent::NoteReleased(id));
        }
    }

    fn advance_sample(&mut self) {
        let dt = self.dt;
        let events = &self.engine_events;
        self.pool.process(dt, |id| {
            match events.try_send(EngineEvent::VoiceFinished(id)) {
                Ok(()) | Err(TrySendError::Full(_)) | Err(TrySendError::Disconnected(_)) => {}
            }
        });
    }

    fn emit(&self, event: EngineEvent) {
        // Bounded channel: drop on overflow, never block the audio path.
        let _ = self.engine_events.try_send(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam_channel::bounded;

    fn synth() -> (Synth, EngineHandle, Receiver<EngineEvent>) {
        let (event_tx, event_rx) = bounded(256);
        let (synth, handle) = Synth::new(48_000.0, 2, event_tx);
        (synth, handle, event_rx)
    }

    #[test]
    fn events_flow_through_queue_to_voices() {
        let (mut synth, mut handle, events) = synth();
        assert!(handle.push_event(NoteEvent::NoteTriggered {
            id: NoteId::new(0, 60),
            velocity: 0.8,
            bend_range: 48.0,
        }));
        let mut frames = vec![VoiceFrame::default(); 2];
        synth.process(16, &mut frames);
        assert_eq!(synth.pool().active_count(), 1);
        assert_eq!(
            events.try_recv().unwrap(),
            EngineEvent::NoteTriggered(NoteId::new(0, 60))
        );
        assert!(frames.iter().any(|f| f.amplitude > 0.0));
    }

    #[test]
    fn note_off_for_stolen_note_is_noop() {
        let (mut synth, mut handle, _events) = synth();
        for note in [60, 61, 62] {
            handle.push_event(NoteEvent::NoteTriggered {
                id: NoteId::new(0, note),
                velocity: 0.8,
                bend_range: 48.0,
            });
        }
        // Note 62 stole 60's voice.
        handle.push_event(NoteEvent::NoteReleased {
            id: NoteId::new(0, 60),
            velocity: 0.5,
        });
        let mut frames = vec![VoiceFrame::default(); 2];
        synth.process(4, &mut frames);
        // Both surviving voices still held.
        assert!(synth.pool().voice_for(NoteId::new(0, 61)).is_some());
        assert!(synth.pool().voice_for(NoteId::new(0, 62)).is_some());
    }

    #[test]
    fn all_notes_off_command_emits_releases() {
        let (mut synth, mut handle, events) = synth();
        handle.push_event(NoteEvent::NoteTriggered {
            id: NoteId::new(0, 60),
            velocity: 0.8,
            bend_range: 48.0,
        });
        let mut frames = vec![VoiceFrame::default(); 2];
        synth.process(4, &mut frames);
        let _ = events.try_recv(); // NoteTriggered

        handle.send_command(EngineCommand::AllNotesOff);
        synth.process(4, &mut frames);
        assert_eq!(
            events.try_recv().unwrap(),
            EngineEvent::NoteReleased(NoteId::new(0, 60))
        );
    }

    #[test]
    fn parameter_changes_apply_to_new_triggers_only() {
        let (mut synth, mut handle, _events) = synth();
        handle.push_event(NoteEvent::NoteTriggered {
            id: NoteId::new(0, 60),
            velocity: 0.8,
            bend_range: 48.0,
        });
        let mut frames = vec![VoiceFrame::default(); 2];
        synth.process(4, &mut frames);

        handle.send_command(EngineCommand::SetGlideTime(0.5));
        synth.process(4, &mut frames);
        // The sounding voice kept the params copied at its trigger.
        assert_eq!(synth.voice_params().glide_time, 0.5);
    }
}
