//! Serializer for protocol messages.
//!
//! JSON payloads are sent as text frames holding the array
//! `[join_ref, ref, topic, event, payload]`. Binary payloads use a tagged
//! binary layout with single-byte length prefixes:
//!
//! ```text
//! push (encode):  [0][join_ref_len][ref_len][topic_len][event_len][join_ref][ref][topic][event][payload]
//! push (decode):  [0][join_ref_len][topic_len][event_len][join_ref][topic][event][payload]
//! reply:          [1][join_ref_len][ref_len][topic_len][event_len][join_ref][ref][topic][event][payload]
//! broadcast:      [2][topic_len][event_len][topic][event][payload]
//! ```
//!
//! Header strings are encoded one byte per character.

use bytes::{BufMut, Bytes, BytesMut};
use serde_json::Value;
use thiserror::Error;

use crate::events::PHX_REPLY;
use crate::frames::{BinaryKind, Frame};
use crate::message::{Message, Payload};

/// Size of the kind tag.
pub const HEADER_LENGTH: usize = 1;

/// Number of length bytes in an encoded push.
pub const META_LENGTH: usize = 4;

/// Protocol errors that can occur during encoding/decoding.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// JSON encoding or decoding failed.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Binary frame with an unrecognized kind tag.
    #[error("Unknown binary kind: {0}")]
    UnknownKind(u8),

    /// Binary frame shorter than its header says.
    #[error("Truncated frame: need {needed} bytes, have {available}")]
    Truncated {
        /// Bytes required by the header.
        needed: usize,
        /// Bytes actually present.
        available: usize,
    },

    /// Empty binary frame.
    #[error("Empty frame")]
    Empty,

    /// Header field outside the ASCII range.
    #[error("Field {0} is not ASCII")]
    NonAscii(&'static str),

    /// Header field longer than a single length byte can describe.
    #[error("Field {field} is {len} bytes, maximum is 255")]
    FieldTooLong {
        /// Field name.
        field: &'static str,
        /// Field length.
        len: usize,
    },

    /// Message that cannot be represented on the wire.
    #[error("Invalid envelope: {0}")]
    InvalidEnvelope(&'static str),
}

/// Encode a message into a frame.
///
/// # Errors
///
/// Returns an error if JSON serialization fails or a binary header field is
/// not representable.
pub fn encode(message: &Message) -> Result<Frame, ProtocolError> {
    match &message.payload {
        Payload::Json(payload) => {
            let envelope = (
                &message.join_ref,
                &message.msg_ref,
                &message.topic,
                &message.event,
                payload,
            );
            Ok(Frame::Text(serde_json::to_string(&envelope)?))
        }
        Payload::Binary(payload) => binary_encode(message, payload).map(Frame::Binary),
        Payload::BinaryReply { .. } => Err(ProtocolError::InvalidEnvelope(
            "binary replies are only sent by the server",
        )),
    }
}

/// Decode a frame into a message.
///
/// # Errors
///
/// Returns an error if the frame is malformed.
pub fn decode(frame: &Frame) -> Result<Message, ProtocolError> {
    match frame {
        Frame::Text(text) => decode_text(text),
        Frame::Binary(bytes) => decode_binary(bytes),
    }
}

/// Decode a text frame.
///
/// # Errors
///
/// Returns an error if the text is not a five-element JSON envelope.
pub fn decode_text(text: &str) -> Result<Message, ProtocolError> {
    let (join_ref, msg_ref, topic, event, payload): (
        Option<String>,
        Option<String>,
        String,
        String,
        Value,
    ) = serde_json::from_str(text)?;

    Ok(Message {
        join_ref,
        msg_ref,
        topic,
        event,
        payload: Payload::Json(payload),
    })
}

/// Decode a binary frame.
///
/// # Errors
///
/// Returns an error for empty input, an unknown kind, or lengths that run
/// past the end of the buffer.
pub fn decode_binary(buf: &Bytes) -> Result<Message, ProtocolError> {
    let mut cursor = Cursor::new(buf);
    let kind = cursor.u8().map_err(|_| ProtocolError::Empty)?;

    match BinaryKind::try_from(kind).map_err(ProtocolError::UnknownKind)? {
        BinaryKind::Push => {
            let join_ref_len = cursor.u8()?;
            let topic_len = cursor.u8()?;
            let event_len = cursor.u8()?;
            let join_ref = cursor.string(join_ref_len)?;
            let topic = cursor.string(topic_len)?;
            let event = cursor.string(event_len)?;
            Ok(Message {
                join_ref: Some(join_ref),
                msg_ref: None,
                topic,
                event,
                payload: Payload::Binary(cursor.rest()),
            })
        }
        BinaryKind::Reply => {
            let join_ref_len = cursor.u8()?;
            let ref_len = cursor.u8()?;
            let topic_len = cursor.u8()?;
            let event_len = cursor.u8()?;
            let join_ref = cursor.string(join_ref_len)?;
            let msg_ref = cursor.string(ref_len)?;
            let topic = cursor.string(topic_len)?;
            let status = cursor.string(event_len)?;
            Ok(Message {
                join_ref: Some(join_ref),
                msg_ref: Some(msg_ref),
                topic,
                event: PHX_REPLY.to_string(),
                payload: Payload::BinaryReply {
                    status,
                    response: cursor.rest(),
                },
            })
        }
        BinaryKind::Broadcast => {
            let topic_len = cursor.u8()?;
            let event_len = cursor.u8()?;
            let topic = cursor.string(topic_len)?;
            let event = cursor.string(event_len)?;
            Ok(Message {
                join_ref: None,
                msg_ref: None,
                topic,
                event,
                payload: Payload::Binary(cursor.rest()),
            })
        }
    }
}

fn binary_encode(message: &Message, payload: &Bytes) -> Result<Bytes, ProtocolError> {
    let fields = [
        ("join_ref", message.join_ref.as_deref().unwrap_or("")),
        ("ref", message.msg_ref.as_deref().unwrap_or("")),
        ("topic", message.topic.as_str()),
        ("event", message.event.as_str()),
    ];

    let mut meta_len = 0;
    for (name, value) in fields {
        if !value.is_ascii() {
            return Err(ProtocolError::NonAscii(name));
        }
        if value.len() > usize::from(u8::MAX) {
            return Err(ProtocolError::FieldTooLong {
                field: name,
                len: value.len(),
            });
        }
        meta_len += value.len();
    }

    let mut buf = BytesMut::with_capacity(HEADER_LENGTH + META_LENGTH + meta_len + payload.len());
    buf.put_u8(BinaryKind::Push.into());
    for (_, value) in fields {
        buf.put_u8(value.len() as u8);
    }
    for (_, value) in fields {
        buf.put_slice(value.as_bytes());
    }
    buf.put_slice(payload);

    Ok(buf.freeze())
}

/// Bounds-checked reader over a binary frame.
struct Cursor<'a> {
    buf: &'a Bytes,
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(buf: &'a Bytes) -> Self {
        Self { buf, pos: 0 }
    }

    fn take(&mut self, len: usize) -> Result<&'a [u8], ProtocolError> {
        let buf: &'a Bytes = self.buf;
        let end = self.pos + len;
        if end > buf.len() {
            return Err(ProtocolError::Truncated {
                needed: end,
                available: buf.len(),
            });
        }
        let slice = &buf[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    fn u8(&mut self) -> Result<u8, ProtocolError> {
        Ok(self.take(1)?[0])
    }

    fn string(&mut self, len: u8) -> Result<String, ProtocolError> {
        Ok(self.take(usize::from(len))?.iter().map(|&b| char::from(b)).collect())
    }

    fn rest(self) -> Bytes {
        self.buf.slice(self.pos..)
    }
}

/// Stateless codec handle, convenient where a value is expected.
#[derive(Debug, Default, Clone, Copy)]
pub struct Serializer;

impl Serializer {
    /// Create a new serializer.
    #[must_use]
    pub fn new() -> Self {
        Self
    }

    /// Encode a message.
    ///
    /// # Errors
    ///
    /// Returns an error if encoding fails.
    pub fn encode(&self, message: &Message) -> Result<Frame, ProtocolError> {
        encode(message)
    }

    /// Decode a frame.
    ///
    /// # Errors
    ///
    /// Returns an error if decoding fails.
    pub fn decode(&self, frame: &Frame) -> Result<Message, ProtocolError> {
        decode(frame)
    }
}
