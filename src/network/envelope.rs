//! Packet Envelope Interceptor
//!
//! Every inbound frame of the four wire shapes passes through tag extraction
//! here before anything else sees the payload. A frame whose head decodes as
//! a length-prefixed string carries a message-type tag; the remainder is
//! re-exposed unchanged. A malformed head is not an error - the frame falls
//! through to default handling with no tag.
//!
//! The interceptor also owns the per-tag priority override: registered tags
//! supersede the channel's native scheduling priority, unregistered tags
//! fall back to it.

use std::collections::HashMap;

use crate::network::wire::{WireReader, WireWriter};

/// Lowest scheduling priority (unreliable traffic default).
pub const PRIORITY_LOW: i8 = 0;
/// Default scheduling priority.
pub const PRIORITY_NORMAL: i8 = 1;
/// Elevated scheduling priority (handshake traffic).
pub const PRIORITY_HIGH: i8 = 2;

/// The four wire shapes the interceptor overrides.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Channel {
    /// Reliable delivery, binary payload.
    ReliableBinary,
    /// Unreliable delivery, binary payload.
    UnreliableBinary,
    /// Reliable delivery, text payload.
    ReliableText,
    /// Unreliable delivery, text payload.
    UnreliableText,
}

impl Channel {
    /// Whether the transport retransmits frames on this channel.
    pub fn is_reliable(self) -> bool {
        matches!(self, Channel::ReliableBinary | Channel::ReliableText)
    }

    /// Whether the payload after the tag is a wire string.
    pub fn is_text(self) -> bool {
        matches!(self, Channel::ReliableText | Channel::UnreliableText)
    }

    /// The transport's native priority for untagged traffic.
    pub fn native_priority(self) -> i8 {
        if self.is_reliable() {
            PRIORITY_NORMAL
        } else {
            PRIORITY_LOW
        }
    }

    /// Wire discriminant used by the front end.
    pub fn discriminant(self) -> u8 {
        match self {
            Channel::ReliableBinary => 0,
            Channel::UnreliableBinary => 1,
            Channel::ReliableText => 2,
            Channel::UnreliableText => 3,
        }
    }

    /// Decode a wire discriminant.
    pub fn from_discriminant(d: u8) -> Option<Self> {
        match d {
            0 => Some(Channel::ReliableBinary),
            1 => Some(Channel::UnreliableBinary),
            2 => Some(Channel::ReliableText),
            3 => Some(Channel::UnreliableText),
            _ => None,
        }
    }
}

/// An inbound frame after tag extraction.
#[derive(Debug)]
pub struct Envelope {
    /// Wire shape the frame arrived on.
    pub channel: Channel,
    /// Extracted message-type tag, if the head decoded as one.
    pub tag: Option<String>,
    /// Payload after the tag (the whole frame when no tag decoded).
    pub body: Vec<u8>,
}

impl Envelope {
    /// Extract the leading tag from a raw frame.
    ///
    /// Never fails: a head that does not decode as a length-prefixed string
    /// yields `tag = None` with the raw frame intact, so legacy handling
    /// sees exactly what was sent.
    pub fn parse(channel: Channel, raw: &[u8]) -> Self {
        let mut reader = WireReader::new(raw);
        match reader.read_string() {
            Ok(tag) => {
                let body = reader.read_bytes(reader.remaining()).unwrap_or(&[]).to_vec();
                Self {
                    channel,
                    tag: Some(tag),
                    body,
                }
            }
            Err(_) => Self {
                channel,
                tag: None,
                body: raw.to_vec(),
            },
        }
    }
}

/// Build an outbound tagged payload: wire string tag followed by the body.
pub fn tagged(tag: &str, body: &[u8]) -> Vec<u8> {
    let mut w = WireWriter::new();
    w.put_string(tag).put_bytes(body);
    w.into_bytes()
}

/// Per-tag priority overrides, built once at registration time.
#[derive(Debug, Clone, Default)]
pub struct PriorityTable {
    map: HashMap<String, i8>,
}

impl PriorityTable {
    /// Create an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a tag's priority override.
    pub fn set(&mut self, tag: &str, priority: i8) {
        self.map.insert(tag.to_string(), priority);
    }

    /// Priority for a frame: the tag's override, or the channel's native
    /// priority when the tag is absent or unregistered.
    pub fn priority_for(&self, tag: Option<&str>, channel: Channel) -> i8 {
        tag.and_then(|t| self.map.get(t).copied())
            .unwrap_or_else(|| channel.native_priority())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tag_extraction() {
        let raw = tagged("warden.connect", &[1, 2, 3]);
        let env = Envelope::parse(Channel::ReliableBinary, &raw);
        assert_eq!(env.tag.as_deref(), Some("warden.connect"));
        assert_eq!(env.body, vec![1, 2, 3]);
    }

    #[test]
    fn test_tag_extraction_empty_body() {
        let raw = tagged("warden.ping", &[]);
        let env = Envelope::parse(Channel::UnreliableBinary, &raw);
        assert_eq!(env.tag.as_deref(), Some("warden.ping"));
        assert!(env.body.is_empty());
    }

    #[test]
    fn test_malformed_tag_falls_through() {
        // Length prefix claims more bytes than exist: no tag, raw preserved.
        let raw = vec![0xff, 0xff, b'x'];
        let env = Envelope::parse(Channel::ReliableBinary, &raw);
        assert!(env.tag.is_none());
        assert_eq!(env.body, raw);
    }

    #[test]
    fn test_empty_frame_falls_through() {
        let env = Envelope::parse(Channel::ReliableText, &[]);
        assert!(env.tag.is_none());
        assert!(env.body.is_empty());
    }

    #[test]
    fn test_priority_override() {
        let mut table = PriorityTable::new();
        table.set("warden.connect", PRIORITY_HIGH);

        assert_eq!(
            table.priority_for(Some("warden.connect"), Channel::ReliableBinary),
            PRIORITY_HIGH
        );
        // Unregistered tag: native priority of the channel.
        assert_eq!(
            table.priority_for(Some("game.move"), Channel::UnreliableBinary),
            PRIORITY_LOW
        );
        // No tag at all: native priority.
        assert_eq!(
            table.priority_for(None, Channel::ReliableBinary),
            PRIORITY_NORMAL
        );
    }

    #[test]
    fn test_channel_discriminant_round_trip() {
        for ch in [
            Channel::ReliableBinary,
            Channel::UnreliableBinary,
            Channel::ReliableText,
            Channel::UnreliableText,
        ] {
            assert_eq!(Channel::from_discriminant(ch.discriminant()), Some(ch));
        }
        assert_eq!(Channel::from_discriminant(9), None);
    }
}
