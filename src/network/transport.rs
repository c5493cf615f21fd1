//! Transport Collaborator
//!
//! The narrow interface the protocol core uses to talk back to the host
//! transport: send a frame, close a connection. The core never owns a
//! connection's lifetime - it only associates state with its handle.

use std::fmt;

use crate::network::envelope::Channel;

/// Opaque identifier for a live network peer.
///
/// Allocated monotonically by the front end and never reused within a
/// process lifetime, so a stale handle can never alias a new connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnId(pub u64);

impl fmt::Display for ConnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn#{}", self.0)
    }
}

/// An outbound frame handed to the transport.
#[derive(Debug, Clone)]
pub struct OutboundFrame {
    /// Wire shape to send on.
    pub channel: Channel,
    /// Scheduling priority (tag override or channel native).
    pub priority: i8,
    /// Tagged payload bytes.
    pub bytes: Vec<u8>,
}

/// Send/close primitives provided by the host transport.
///
/// Framing, retransmission and channel encryption stay on the transport's
/// side of this boundary; the handshake's cryptography is an application
/// layer on top.
pub trait Transport: Send + Sync {
    /// Queue a frame for delivery to a connection.
    fn send(&self, conn: ConnId, frame: OutboundFrame);

    /// Close a connection, delivering the reason to the peer.
    fn close(&self, conn: ConnId, reason: &str);
}
