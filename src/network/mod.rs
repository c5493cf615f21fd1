//! Network Layer
//!
//! Connection handshake and protocol-stage state machine: packet
//! interception, stage-gated dispatch, the challenge-response handshake,
//! DoS guarding, and session handoff. Everything past handoff belongs to
//! the game layer behind [`session::GameHooks`].

pub mod crypto;
pub mod dispatch;
pub mod envelope;
pub mod guard;
pub mod handshake;
pub mod protocol;
pub mod server;
pub mod session;
pub mod stage;
pub mod transport;
pub mod wire;

pub use dispatch::{DispatchTable, Verdict};
pub use envelope::{Channel, Envelope, PriorityTable};
pub use guard::DosGuard;
pub use handshake::{LegacyJoin, TAG_CHALLENGE, TAG_CONNECT, TAG_PROVE, TAG_SNAPSHOT};
pub use protocol::{Protocol, ProtocolConfig, ProtocolEvent};
pub use server::{ServerConfig, ServerError, WardenServer};
pub use session::{GameHooks, LifecycleEvent, PlayerSession, SessionAuth, SessionId};
pub use stage::{ConnectionStates, Stage, StageKind};
pub use transport::{ConnId, OutboundFrame, Transport};
