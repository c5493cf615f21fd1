//! # Netwarden
//!
//! Connection warden for a real-time multiplayer game server: a
//! public-key challenge-response handshake layered over the host
//! transport's wire protocol, backward compatible with legacy
//! (unauthenticated) clients.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                       NETWARDEN                              │
//! ├─────────────────────────────────────────────────────────────┤
//! │  network/                                                    │
//! │  ├── wire.rs      - Big-endian wire codec                    │
//! │  ├── envelope.rs  - Tag extraction + priority override       │
//! │  ├── stage.rs     - Protocol stages + connection registry    │
//! │  ├── dispatch.rs  - Stage-gated dispatch table               │
//! │  ├── crypto.rs    - Proof-of-possession primitives           │
//! │  ├── handshake.rs - Challenge-response state machine         │
//! │  ├── guard.rs     - Duplicate-connection / DoS guard         │
//! │  ├── session.rs   - Session handoff + game-layer hooks       │
//! │  ├── protocol.rs  - Context object + serial event loop       │
//! │  └── server.rs    - WebSocket front end                      │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Safety Property
//!
//! Every inbound frame passes through tag extraction and the stage gate
//! before any handler runs: a message tagged for stage X is only ever
//! processed by a connection currently in stage X. Anything else
//! terminates the connection and absorbs it into `Panic`.
//!
//! All mutable protocol state is owned by one [`network::Protocol`]
//! context driven by a single serial event loop; slow steps re-enter the
//! loop as continuation events and revalidate the connection first.

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_code)]

pub mod network;

// Re-export commonly used types
pub use network::{
    Channel, ConnId, GameHooks, LifecycleEvent, PlayerSession, Protocol, ProtocolConfig,
    ProtocolEvent, ServerConfig, SessionAuth, Stage, StageKind, Transport, WardenServer,
};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Fixed header constant opening every proof plaintext.
pub const AUTH_MAGIC: [u8; 4] = [43, 76, 12, 45];

/// Challenge nonce length in bytes.
pub const NONCE_LEN: usize = 32;

/// Minimum accepted enhanced-protocol version.
pub const MIN_COMPAT_VERSION: u32 = 2;

/// Minimum display-name length after trimming.
pub const MIN_NAME_LEN: usize = 2;

/// Maximum display-name length after trimming.
pub const MAX_NAME_LEN: usize = 128;
