//! Message sequence numbers.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Mutex;

use crate::WireError;

/// Width of the sequence number field in the text envelope
pub const SEQUENCE_FIELD_LEN: usize = 4;

/// Field value of a sequence number that was never assigned
pub const NOT_DEFINED_FIELD: &str = "****";

/// 16-bit message sequence number.
///
/// `0x0000` is reserved for acknowledgements. Numbers assigned to regular
/// messages run from `0x0001` to `0xFFFF` and then wrap back to `0x0001`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct SequenceNumber(Option<u16>);

impl SequenceNumber {
    /// Sequence number of a message that has not been numbered yet
    pub const NOT_DEFINED: SequenceNumber = SequenceNumber(None);

    /// Sequence number carried by acknowledgements
    pub const ACK: SequenceNumber = SequenceNumber(Some(0x0000));

    /// Create a defined sequence number
    pub const fn new(value: u16) -> Self {
        Self(Some(value))
    }

    /// Raw value, `None` when not defined
    pub fn value(&self) -> Option<u16> {
        self.0
    }

    /// Whether a number has been assigned
    pub fn is_defined(&self) -> bool {
        self.0.is_some()
    }

    /// Successor in the numbering cycle (`0xFFFF` is followed by `0x0001`)
    pub fn next(&self) -> SequenceNumber {
        match self.0 {
            Some(u16::MAX) => SequenceNumber(Some(0x0001)),
            Some(value) => SequenceNumber(Some(value + 1)),
            None => SequenceNumber(Some(0x0001)),
        }
    }

    /// Render as the 4-character envelope field
    pub fn to_field(&self) -> String {
        match self.0 {
            Some(value) => format!("{:04X}", value),
            None => NOT_DEFINED_FIELD.to_string(),
        }
    }

    /// Parse the 4-character envelope field
    pub fn parse_field(field: &str) -> Result<Self, WireError> {
        if field == NOT_DEFINED_FIELD {
            return Ok(Self::NOT_DEFINED);
        }

        let valid = field.len() == SEQUENCE_FIELD_LEN
            && field
                .bytes()
                .all(|b| b.is_ascii_digit() || (b'A'..=b'F').contains(&b));
        if !valid {
            return Err(WireError::Field {
                field: "sequence_number",
                value: field.to_string(),
            });
        }

        u16::from_str_radix(field, 16)
            .map(Self::new)
            .map_err(|_| WireError::Field {
                field: "sequence_number",
                value: field.to_string(),
            })
    }
}

impl fmt::Display for SequenceNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0 {
            Some(value) => write!(f, "{:#06X}", value),
            None => write!(f, "SEQ NUMBER NOT DEFINED"),
        }
    }
}

/// Per-connection sequence number source
#[derive(Debug, Default)]
pub struct SequenceGenerator {
    current: Mutex<SequenceNumber>,
}

impl SequenceGenerator {
    /// Create a generator; the first number handed out is `0x0001`
    pub fn new() -> Self {
        Self {
            current: Mutex::new(SequenceNumber::ACK),
        }
    }

    /// Advance and return the new current number
    pub fn next(&self) -> SequenceNumber {
        let mut current = self
            .current
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        *current = current.next();
        *current
    }
}
