pub mod events;
pub mod expression;
pub mod ids;
pub mod project;
pub mod voicing;

pub use events::{ExpressionKind, NoteEvent};
pub use expression::{NoteExpression, NoteId, DEFAULT_BEND_RANGE};
pub use ids::{EntityId, MessageId, OperationId, PeerId, SessionId};

/// Number of member channels available to an MPE zone (1-15).
pub const MPE_MAX_MEMBER_CHANNELS: u8 = 15;

/// Default size of the synth voice pool.
pub const DEFAULT_VOICE_COUNT: usize = 16;
