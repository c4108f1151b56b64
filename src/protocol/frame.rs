//! Frame definitions
//!
//! A frame is the unit exchanged over a connection: a one byte tag selecting
//! how the payload is dispatched, followed by opaque payload bytes.

use bytes::Bytes;
use serde::Serialize;

/// Reserved tag values.
///
/// Everything outside this set (0-14 and 18-255) is free for applications to
/// register handlers on.
pub mod tags {
    /// Connection greeting and session negotiation
    pub const HANDSHAKE: u8 = 15;
    /// Structured (protobuf encoded) payload forwarded both ways
    pub const PROTOBUF: u8 = 16;
    /// File contents to edit or upload
    pub const FILE: u8 = 17;

    /// All reserved tags
    pub const RESERVED: [u8; 3] = [HANDSHAKE, PROTOBUF, FILE];
}

/// Get a human-readable name for a reserved tag
pub fn tag_name(tag: u8) -> Option<&'static str> {
    match tag {
        tags::HANDSHAKE => Some("handshake"),
        tags::PROTOBUF => Some("protobuf"),
        tags::FILE => Some("file"),
        _ => None,
    }
}

/// Check whether a tag is one of the reserved values
pub fn is_reserved(tag: u8) -> bool {
    tags::RESERVED.contains(&tag)
}

/// A single tagged message.
///
/// Frames are immutable once built; the payload is a cheaply clonable
/// [`Bytes`] so echoing a frame back never copies it.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Frame {
    tag: u8,
    payload: Bytes,
}

impl Frame {
    pub fn new(tag: u8, payload: impl Into<Bytes>) -> Self {
        Self {
            tag,
            payload: payload.into(),
        }
    }

    /// Frame carrying only a tag
    pub fn empty(tag: u8) -> Self {
        Self::new(tag, Bytes::new())
    }

    /// The greeting frame sent when a connection is accepted
    pub fn greeting(payload: impl Into<Bytes>) -> Self {
        Self::new(tags::HANDSHAKE, payload)
    }

    pub fn tag(&self) -> u8 {
        self.tag
    }

    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    /// Consume the frame, returning its payload
    pub fn into_payload(self) -> Bytes {
        self.payload
    }

    /// Length as declared in the wire header (tag + payload)
    pub fn wire_len(&self) -> usize {
        1 + self.payload.len()
    }

    /// Build a serializable view of this frame for display
    pub fn summary(&self) -> FrameSummary {
        FrameSummary {
            tag: self.tag,
            kind: tag_name(self.tag),
            len: self.payload.len(),
            payload: String::from_utf8_lossy(&self.payload).into_owned(),
        }
    }
}

/// Display-oriented view of a frame
#[derive(Debug, Clone, Serialize)]
pub struct FrameSummary {
    pub tag: u8,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kind: Option<&'static str>,
    pub len: usize,
    /// Payload decoded as UTF-8, lossy
    pub payload: String,
}

impl std::fmt::Display for FrameSummary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.kind {
            Some(kind) => write!(f, "[{} {}] {:?}", self.tag, kind, self.payload),
            None => write!(f, "[{}] {:?}", self.tag, self.payload),
        }
    }
}
