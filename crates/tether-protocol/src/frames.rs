//! Transport frames.
//!
//! A frame is what actually crosses the transport: a text frame carrying a
//! JSON envelope or a binary frame carrying a tagged binary envelope.

use bytes::Bytes;

/// Binary envelope kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum BinaryKind {
    /// Client push, or a server push without a ref.
    Push = 0,
    /// Reply to a request.
    Reply = 1,
    /// Broadcast with neither join ref nor ref.
    Broadcast = 2,
}

impl From<BinaryKind> for u8 {
    fn from(kind: BinaryKind) -> u8 {
        kind as u8
    }
}

impl TryFrom<u8> for BinaryKind {
    type Error = u8;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(BinaryKind::Push),
            1 => Ok(BinaryKind::Reply),
            2 => Ok(BinaryKind::Broadcast),
            other => Err(other),
        }
    }
}

/// A frame as sent over or received from a transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// UTF-8 text frame.
    Text(String),
    /// Binary frame.
    Binary(Bytes),
}

impl Frame {
    /// Size of the frame in bytes.
    #[must_use]
    pub fn len(&self) -> usize {
        match self {
            Frame::Text(text) => text.len(),
            Frame::Binary(bytes) => bytes.len(),
        }
    }

    /// Whether the frame is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether this is a binary frame.
    #[must_use]
    pub fn is_binary(&self) -> bool {
        matches!(self, Frame::Binary(_))
    }
}

impl From<String> for Frame {
    fn from(text: String) -> Self {
        Frame::Text(text)
    }
}

impl From<Bytes> for Frame {
    fn from(bytes: Bytes) -> Self {
        Frame::Binary(bytes)
    }
}
