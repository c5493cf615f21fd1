//! Protocol Stages
//!
//! The tagged-union value describing what a connection may legally do next,
//! plus the registry associating each live connection with exactly one
//! stage. Transitions are one-directional; `Panic` is absorbing and
//! `Authenticated`/`LegacyClient` are terminal for this subsystem.

use std::collections::HashMap;

use rsa::RsaPublicKey;

use crate::network::transport::ConnId;
use crate::NONCE_LEN;

/// Per-connection protocol stage.
#[derive(Debug, Clone, PartialEq)]
pub enum Stage {
    /// Just connected, nothing received yet.
    Begin,
    /// Key submitted, challenge sent, awaiting signed proof.
    VerificationPending {
        /// The client's submitted public key.
        key: RsaPublicKey,
        /// Challenge nonce, bound to this attempt only.
        nonce: [u8; NONCE_LEN],
        /// Challenge issue time (unix millis).
        issued_at: i64,
    },
    /// Handshake complete; enhanced-protocol session.
    Authenticated {
        /// The proven public key.
        key: RsaPublicKey,
        /// Client's enhanced-protocol version.
        compat_version: u32,
    },
    /// Completed the legacy unauthenticated join path.
    LegacyClient,
    /// Protocol violation detected; connection being torn down.
    Panic,
}

impl Stage {
    /// The stage's variant, for dispatch-table matching.
    pub fn kind(&self) -> StageKind {
        match self {
            Stage::Begin => StageKind::Begin,
            Stage::VerificationPending { .. } => StageKind::VerificationPending,
            Stage::Authenticated { .. } => StageKind::Authenticated,
            Stage::LegacyClient => StageKind::LegacyClient,
            Stage::Panic => StageKind::Panic,
        }
    }

    /// Whether this is a terminal success state (control has passed to the
    /// session layer).
    pub fn is_terminal_success(&self) -> bool {
        matches!(self, Stage::Authenticated { .. } | Stage::LegacyClient)
    }
}

/// Stage variant without payload, used as the dispatch-table matcher.
///
/// Matching is exact: a handler registered for `VerificationPending` never
/// fires for `Authenticated`, terminal or not.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StageKind {
    /// Matches [`Stage::Begin`].
    Begin,
    /// Matches [`Stage::VerificationPending`].
    VerificationPending,
    /// Matches [`Stage::Authenticated`].
    Authenticated,
    /// Matches [`Stage::LegacyClient`].
    LegacyClient,
    /// Matches [`Stage::Panic`].
    Panic,
}

/// Authoritative map from connection handle to current stage.
///
/// Keyed by [`ConnId`] with explicit removal on the transport's disconnect
/// event; entries never outlive their connection. Only ever touched from
/// the protocol event loop, so no interior locking.
#[derive(Debug, Default)]
pub struct ConnectionStates {
    map: HashMap<ConnId, Stage>,
}

impl ConnectionStates {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Current stage of a connection. Absence means the connection has not
    /// begun (or was never seen); callers must not treat it as any stage.
    pub fn get(&self, conn: ConnId) -> Option<&Stage> {
        self.map.get(&conn)
    }

    /// Record a connection's stage.
    pub fn set(&mut self, conn: ConnId, stage: Stage) {
        self.map.insert(conn, stage);
    }

    /// Whether a connection has any recorded stage.
    pub fn contains(&self, conn: ConnId) -> bool {
        self.map.contains_key(&conn)
    }

    /// Drop a connection's entry. Called from the disconnect event only.
    pub fn remove(&mut self, conn: ConnId) -> Option<Stage> {
        self.map.remove(&conn)
    }

    /// Number of tracked connections.
    pub fn len(&self) -> usize {
        self.map.len()
    }

    /// Whether no connections are tracked.
    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_matching() {
        assert_eq!(Stage::Begin.kind(), StageKind::Begin);
        assert_eq!(Stage::LegacyClient.kind(), StageKind::LegacyClient);
        assert_eq!(Stage::Panic.kind(), StageKind::Panic);
        assert_ne!(StageKind::Begin, StageKind::Panic);
    }

    #[test]
    fn test_terminal_success() {
        assert!(Stage::LegacyClient.is_terminal_success());
        assert!(!Stage::Begin.is_terminal_success());
        assert!(!Stage::Panic.is_terminal_success());
    }

    #[test]
    fn test_registry_lifecycle() {
        let mut states = ConnectionStates::new();
        let conn = ConnId(1);

        assert!(states.get(conn).is_none());
        states.set(conn, Stage::Begin);
        assert_eq!(states.get(conn), Some(&Stage::Begin));

        states.set(conn, Stage::Panic);
        assert_eq!(states.get(conn), Some(&Stage::Panic));
        assert_eq!(states.len(), 1);

        states.remove(conn);
        assert!(states.get(conn).is_none());
        assert!(states.is_empty());
    }
}
