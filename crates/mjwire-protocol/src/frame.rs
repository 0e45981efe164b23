//! Byte-level frame header: category tag and correlation id.
//!
//! ```text
//! byte 0:     category tag (1 = Notify, 2 = Request, 3 = Response)
//! [Request / Response only]
//! byte 1:     correlation id & 0x7F
//! byte 2:     correlation id >> 7      (only bit 0 is ever set)
//! remaining:  envelope bytes
//! ```
//!
//! The id field has room for more than 8 bits but the remote service has
//! only ever seen ids in `0..=255` split this way, so that is exactly what
//! is produced and accepted here.

use std::fmt;

use crate::ProtocolError;

/// The first byte of every frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Category {
    /// Unsolicited server push.
    Notify = 1,
    /// Client call.
    Request = 2,
    /// Server reply to a call.
    Response = 3,
}

impl TryFrom<u8> for Category {
    type Error = ProtocolError;

    fn try_from(tag: u8) -> Result<Self, Self::Error> {
        match tag {
            1 => Ok(Self::Notify),
            2 => Ok(Self::Request),
            3 => Ok(Self::Response),
            other => Err(ProtocolError::MalformedFrame(format!(
                "unknown category tag {other}"
            ))),
        }
    }
}

/// Links a Request frame to its Response.
///
/// Backed by a `u8`, so an id outside `0..=255` cannot be constructed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CorrelationId(u8);

impl CorrelationId {
    /// Wraps a raw id.
    pub const fn new(id: u8) -> Self {
        Self(id)
    }

    /// Returns the raw id.
    pub const fn get(self) -> u8 {
        self.0
    }

    /// The id the counter hands out after this one (wraps at 256).
    pub const fn next(self) -> Self {
        Self(self.0.wrapping_add(1))
    }

    /// Splits the id into its two wire bytes.
    pub const fn to_wire(self) -> [u8; 2] {
        [self.0 & 0x7F, self.0 >> 7]
    }

    /// Joins the two wire bytes back into an id.
    ///
    /// # Errors
    /// Returns [`ProtocolError::MalformedFrame`] if the low byte uses its
    /// top bit or the joined value does not fit in `0..=255`.
    pub fn from_wire(low: u8, high: u8) -> Result<Self, ProtocolError> {
        if low & 0x80 != 0 {
            return Err(ProtocolError::MalformedFrame(format!(
                "correlation id low byte {low:#04x} has bit 7 set"
            )));
        }
        let joined = u16::from(low) | (u16::from(high) << 7);
        u8::try_from(joined).map(Self).map_err(|_| {
            ProtocolError::MalformedFrame(format!(
                "correlation id {joined} exceeds 255"
            ))
        })
    }
}

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Category plus the correlation id where the category carries one.
///
/// Making the id part of the variant means a Request without an id (or a
/// Notify with one) cannot be expressed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameHeader {
    /// Push event; the envelope follows the tag directly.
    Notify,
    /// Outgoing call.
    Request(CorrelationId),
    /// Reply to the call with this id.
    Response(CorrelationId),
}

impl FrameHeader {
    /// The category tag this header encodes to.
    pub fn category(self) -> Category {
        match self {
            Self::Notify => Category::Notify,
            Self::Request(_) => Category::Request,
            Self::Response(_) => Category::Response,
        }
    }

    /// The correlation id, if the category carries one.
    pub fn correlation_id(self) -> Option<CorrelationId> {
        match self {
            Self::Notify => None,
            Self::Request(id) | Self::Response(id) => Some(id),
        }
    }
}

/// A decoded frame that borrows its envelope bytes from the input buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Frame<'a> {
    /// Category and correlation id.
    pub header: FrameHeader,
    /// Serialized [`Envelope`](crate::Envelope).
    pub envelope: &'a [u8],
}

/// Builds a frame from a header and serialized envelope bytes.
pub fn encode_frame(header: FrameHeader, envelope: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(3 + envelope.len());
    out.push(header.category() as u8);
    if let Some(id) = header.correlation_id() {
        out.extend_from_slice(&id.to_wire());
    }
    out.extend_from_slice(envelope);
    out
}

/// Classifies a raw frame and splits off its envelope bytes.
///
/// # Errors
/// Returns [`ProtocolError::MalformedFrame`] if the buffer is empty, the
/// tag byte is unknown, or a Request/Response header is truncated.
pub fn decode_frame(bytes: &[u8]) -> Result<Frame<'_>, ProtocolError> {
    let (&tag, rest) = bytes
        .split_first()
        .ok_or_else(|| ProtocolError::MalformedFrame("empty frame".into()))?;

    let category = Category::try_from(tag)?;
    if category == Category::Notify {
        return Ok(Frame {
            header: FrameHeader::Notify,
            envelope: rest,
        });
    }

    let [low, high, envelope @ ..] = rest else {
        return Err(ProtocolError::MalformedFrame(format!(
            "{category:?} frame too short for a correlation id ({} bytes)",
            bytes.len()
        )));
    };
    let id = CorrelationId::from_wire(*low, *high)?;
    let header = match category {
        Category::Request => FrameHeader::Request(id),
        _ => FrameHeader::Response(id),
    };
    Ok(Frame { header, envelope })
}
