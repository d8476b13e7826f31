//! Real-time collaboration: sessions, peers, causally ordered edits over
//! a framed TCP transport, and operational transform for concurrent
//! conflict resolution.

pub mod client;
pub mod clock;
pub mod error;
pub mod framing;
pub mod history;
pub mod op;
pub mod ot;
pub mod peer;
pub mod protocol;
pub mod server;
pub mod session;

pub use client::{ClientConfig, ClientEvent, CollabClient};
pub use clock::{ClockOrder, VectorClock};
pub use error::CollabError;
pub use history::OpHistory;
pub use op::{OpDomain, Operation, OperationKind};
pub use ot::{transform, Conflict, TransformResult};
pub use peer::{ConnectionState, LatencyWindow, Peer, PeerRole};
pub use protocol::{ErrorCode, Message, Payload};
pub use server::{CollabServer, ServerConfig};
pub use session::{Session, SessionEvent, SessionState};
