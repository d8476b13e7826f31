//! Voice allocation and expression binding.
//!
//! Sits at the boundary between control-rate events and audio-rate DSP:
//! a fixed voice pool, ADSR envelopes, per-sample parameter smoothing,
//! and the queues that marshal events onto the audio thread.

pub mod envelope;
pub mod pool;
pub mod synth;
pub mod transport;
pub mod voice;

pub use envelope::{AdsrEnvelope, EnvelopeParams, EnvelopeStage};
pub use pool::VoicePool;
pub use synth::{EngineCommand, EngineEvent, EngineHandle, Synth};
pub use transport::{SharedTransport, TransportRunState, TransportState};
pub use voice::{Voice, VoiceFrame, VoiceParams};
