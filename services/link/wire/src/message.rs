//! Message envelope exchanged by the reliable-delivery layer.
//!
//! The default [`TextCodec`] renders a message as printable ASCII:
//!
//! ```text
//! +------+----+-----------------+
//! | SSSS | TT | content         |
//! +------+----+-----------------+
//!   seq   type  [0-9A-Z*]+
//! ```
//!
//! `SSSS` is the sequence number in upper-case hex (`****` when not yet
//! assigned) and `TT` a two-character type code. Acknowledgements use type
//! `AK`, sequence `0000` and carry the confirmed sequence number as content.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::sequence::{SequenceNumber, SEQUENCE_FIELD_LEN};
use crate::WireError;

/// Width of the type field
pub const TYPE_FIELD_LEN: usize = 2;

/// Two-character message type code
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MessageType([u8; TYPE_FIELD_LEN]);

impl MessageType {
    /// Acknowledgement
    pub const AK: MessageType = MessageType(*b"AK");

    /// Create a type code from two upper-case ASCII letters or digits
    pub fn new(code: &str) -> Result<Self, WireError> {
        let bytes = code.as_bytes();
        let valid = bytes.len() == TYPE_FIELD_LEN
            && bytes
                .iter()
                .all(|b| b.is_ascii_uppercase() || b.is_ascii_digit());
        if !valid {
            return Err(WireError::Field {
                field: "message_type",
                value: code.to_string(),
            });
        }
        Ok(Self([bytes[0], bytes[1]]))
    }

    /// Type code as text
    pub fn as_str(&self) -> &str {
        // Only ASCII bytes are ever stored
        std::str::from_utf8(&self.0).unwrap_or("??")
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A numbered, typed message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    sequence_number: SequenceNumber,
    message_type: MessageType,
    content: String,
}

impl Message {
    /// Create an unnumbered message; the link assigns the number on send
    pub fn new(message_type: MessageType, content: impl Into<String>) -> Self {
        Self {
            sequence_number: SequenceNumber::NOT_DEFINED,
            message_type,
            content: content.into(),
        }
    }

    /// Create an acknowledgement confirming `confirmed`
    pub fn ack(confirmed: SequenceNumber) -> Self {
        Self {
            sequence_number: SequenceNumber::ACK,
            message_type: MessageType::AK,
            content: confirmed.to_field(),
        }
    }

    /// Sequence number, possibly not defined
    pub fn sequence_number(&self) -> SequenceNumber {
        self.sequence_number
    }

    /// Assign the sequence number
    pub fn set_sequence_number(&mut self, sequence_number: SequenceNumber) {
        self.sequence_number = sequence_number;
    }

    /// Builder-style variant of [`Message::set_sequence_number`]
    pub fn with_sequence_number(mut self, sequence_number: SequenceNumber) -> Self {
        self.sequence_number = sequence_number;
        self
    }

    /// Type code
    pub fn message_type(&self) -> MessageType {
        self.message_type
    }

    /// Payload text
    pub fn content(&self) -> &str {
        &self.content
    }

    /// Whether this is an acknowledgement
    pub fn is_ack(&self) -> bool {
        self.message_type == MessageType::AK
    }

    /// Sequence number confirmed by an acknowledgement
    pub fn confirmed_sequence_number(&self) -> Option<SequenceNumber> {
        if !self.is_ack() {
            return None;
        }
        SequenceNumber::parse_field(&self.content)
            .ok()
            .filter(SequenceNumber::is_defined)
    }

    /// Check the message against the envelope grammar
    pub fn validate(&self) -> Result<(), WireError> {
        let content_ok = !self.content.is_empty()
            && self
                .content
                .bytes()
                .all(|b| b.is_ascii_digit() || b.is_ascii_uppercase() || b == b'*');
        if !content_ok {
            return Err(WireError::Field {
                field: "content",
                value: self.content.clone(),
            });
        }

        if self.is_ack() && self.confirmed_sequence_number().is_none() {
            return Err(WireError::Field {
                field: "confirmed_sequence_number",
                value: self.content.clone(),
            });
        }

        Ok(())
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}{}{}",
            self.sequence_number.to_field(),
            self.message_type,
            self.content
        )
    }
}

/// Converts messages to and from link payloads
pub trait MessageCodec: Send + Sync + fmt::Debug {
    /// Encode a message into a payload
    fn encode(&self, message: &Message) -> Result<Bytes, WireError>;

    /// Decode a payload into a message
    fn decode(&self, payload: &[u8]) -> Result<Message, WireError>;
}

/// Codec for the printable text envelope
#[derive(Debug, Clone, Copy, Default)]
pub struct TextCodec;

impl MessageCodec for TextCodec {
    fn encode(&self, message: &Message) -> Result<Bytes, WireError> {
        message.validate()?;
        Ok(Bytes::from(message.to_string()))
    }

    fn decode(&self, payload: &[u8]) -> Result<Message, WireError> {
        let text = std::str::from_utf8(payload)
            .map_err(|_| WireError::Malformed("message is not valid utf-8"))?;
        if !text.is_ascii() || text.len() <= SEQUENCE_FIELD_LEN + TYPE_FIELD_LEN {
            return Err(WireError::Field {
                field: "message",
                value: text.to_string(),
            });
        }

        let (seq, rest) = text.split_at(SEQUENCE_FIELD_LEN);
        let (kind, content) = rest.split_at(TYPE_FIELD_LEN);

        let message = Message {
            sequence_number: SequenceNumber::parse_field(seq)?,
            message_type: MessageType::new(kind)?,
            content: content.to_string(),
        };
        message.validate()?;
        Ok(message)
    }
}
