//! Wire protocol error types.

use thiserror::Error;

/// Wire protocol errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum WireError {
    /// Unsupported TPKT version
    #[error("version unsupported: {0}")]
    Version(u8),

    /// Encoded TPKT larger than the negotiated maximum
    #[error("tpkt too long: {size} bytes (max {max})")]
    TooLong {
        /// Size the TPKT would have had
        size: usize,
        /// Maximum accepted TPKT size
        max: usize,
    },

    /// Reassembly buffer cannot hold the incoming bytes
    #[error("reassembly buffer overflow: {0} bytes pending")]
    Overflow(usize),

    /// Unknown TSDU code
    #[error("unknown tsdu code {0:#04x}")]
    Type(u8),

    /// Malformed frame structure
    #[error("malformed frame: {0}")]
    Malformed(&'static str),

    /// TSAP identifier that cannot be carried in a connection TSDU
    #[error("invalid tsap: {0}")]
    Tsap(String),

    /// Text envelope that does not follow the message grammar
    #[error("invalid message field {field}: {value:?}")]
    Field {
        /// Name of the offending field
        field: &'static str,
        /// Raw value found
        value: String,
    },
}
