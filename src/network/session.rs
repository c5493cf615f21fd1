//! Session Handoff
//!
//! The point where this subsystem's responsibility ends: a connection that
//! reached a terminal success stage gets a `PlayerSession` bound to it, a
//! team assignment, an announce payload written to the game layer, and a
//! world snapshot pushed - in that order, with the announce write gating
//! everything after it. The game side of the boundary is the `GameHooks`
//! collaborator.

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::network::transport::ConnId;
use crate::{MAX_NAME_LEN, MIN_NAME_LEN};

/// Unique session identifier.
pub type SessionId = Uuid;

/// How a session authenticated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionAuth {
    /// Enhanced protocol: proven key possession.
    Enhanced {
        /// SHA-256 fingerprint of the submitted key material.
        key_fingerprint: [u8; 32],
        /// Client's enhanced-protocol version.
        compat_version: u32,
    },
    /// Legacy unauthenticated join path.
    Legacy,
}

impl SessionAuth {
    /// Whether this session proved key possession.
    pub fn is_enhanced(&self) -> bool {
        matches!(self, SessionAuth::Enhanced { .. })
    }
}

/// A player session bound to a live connection.
#[derive(Debug, Clone)]
pub struct PlayerSession {
    /// Session identifier.
    pub id: SessionId,
    /// Connection this session is bound to.
    pub conn: ConnId,
    /// Validated display name (trimmed).
    pub name: String,
    /// Client-reported persistent id.
    pub uuid: String,
    /// Client-reported per-server id.
    pub usid: String,
    /// Client locale.
    pub locale: String,
    /// Player color as packed RGBA.
    pub color: u32,
    /// Mobile client flag.
    pub mobile: bool,
    /// Installed mod list reported by the client.
    pub mods: Vec<String>,
    /// Client build flavor string.
    pub client_flavor: String,
    /// Assigned team (set during handoff).
    pub team: u8,
    /// How the session authenticated.
    pub auth: SessionAuth,
}

/// Session construction and handoff failures.
#[derive(Debug, Error)]
pub enum SessionError {
    /// The game layer could not write the announce payload.
    #[error("announce write failed: {0}")]
    AnnounceFailed(String),

    /// Announce serialization failed.
    #[error("announce serialization failed: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Name validation failures, each carrying the kick reason shown to the
/// peer.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum NameError {
    /// Name is empty after trimming.
    #[error("cannot join with empty name")]
    Empty,
    /// Name is below the minimum length.
    #[error("player name is too short")]
    TooShort,
    /// Name exceeds the maximum length.
    #[error("player name is too long")]
    TooLong,
}

/// Validate and normalize a display name.
///
/// Trims surrounding whitespace, then enforces the 2..=128 character
/// bounds. Returns the trimmed name on success.
pub fn validate_name(raw: &str) -> Result<String, NameError> {
    let name = raw.trim();
    if name.chars().count() > MAX_NAME_LEN {
        return Err(NameError::TooLong);
    }
    if name.is_empty() {
        return Err(NameError::Empty);
    }
    if name.chars().count() < MIN_NAME_LEN {
        return Err(NameError::TooShort);
    }
    Ok(name.to_string())
}

/// Game-layer collaborator consumed at handoff.
///
/// Everything past these four calls - naming policy beyond length bounds,
/// team balance, world delivery specifics - belongs to the game layer.
pub trait GameHooks: Send + Sync {
    /// Identity/ban predicate consulted on the legacy join path.
    fn identity_allowed(&self, uuid: &str, usid: &str) -> bool;

    /// Assign the session to a team/grouping.
    fn assign_team(&self, session: &PlayerSession) -> u8;

    /// Write the session's initial announce payload to the game layer.
    ///
    /// Failure aborts the handoff: the connection is kicked with a generic
    /// reason and no snapshot is sent.
    fn write_announce(&self, session: &PlayerSession) -> Result<Vec<u8>, SessionError>;

    /// Full world-state snapshot for a freshly admitted session.
    fn world_snapshot(&self, session: &PlayerSession) -> Vec<u8>;
}

/// Announce payload written to the game layer for a new session.
#[derive(Debug, Serialize, Deserialize)]
pub struct AnnouncePayload {
    /// Session identifier.
    pub session: SessionId,
    /// Display name.
    pub name: String,
    /// Assigned team.
    pub team: u8,
    /// Whether the session proved key possession.
    pub enhanced: bool,
    /// Client locale.
    pub locale: String,
}

/// Default `GameHooks`: permissive identity check, single team, JSON
/// announce and snapshot. Stands in until a real game layer is attached.
#[derive(Debug, Default)]
pub struct DefaultHooks;

impl GameHooks for DefaultHooks {
    fn identity_allowed(&self, _uuid: &str, _usid: &str) -> bool {
        true
    }

    fn assign_team(&self, _session: &PlayerSession) -> u8 {
        0
    }

    fn write_announce(&self, session: &PlayerSession) -> Result<Vec<u8>, SessionError> {
        let payload = AnnouncePayload {
            session: session.id,
            name: session.name.clone(),
            team: session.team,
            enhanced: session.auth.is_enhanced(),
            locale: session.locale.clone(),
        };
        Ok(serde_json::to_vec(&payload)?)
    }

    fn world_snapshot(&self, session: &PlayerSession) -> Vec<u8> {
        serde_json::json!({ "snapshot": "world", "for": session.id })
            .to_string()
            .into_bytes()
    }
}

/// Lifecycle events emitted to the rest of the system.
#[derive(Debug, Clone)]
pub enum LifecycleEvent {
    /// A transport-level connection was accepted.
    ConnectionOpened {
        /// The new connection.
        conn: ConnId,
    },
    /// A legacy join packet was received (not fired for enhanced clients).
    LegacyJoin {
        /// The joining connection.
        conn: ConnId,
    },
    /// Handoff completed: the player is in the game.
    PlayerConnected {
        /// The admitted connection.
        conn: ConnId,
        /// The bound session id.
        session: SessionId,
        /// Display name.
        name: String,
        /// Whether the session proved key possession.
        enhanced: bool,
    },
}
