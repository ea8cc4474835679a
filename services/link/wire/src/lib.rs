//! TPKT framing, stream reassembly, sequence numbers and the message envelope for link.
//!
//! This crate holds every byte-level format used by the link: the RFC1006
//! TPKT packet and the TSDUs it carries, the reassembly of packets from a TCP
//! byte stream, and the text envelope of the messages exchanged on top.
//!
//! ## Features
//!
//! - **Bit-exact TPKT/TSDU encoding**: CR, CC and DT units with a 128-byte cap
//! - **Bounded reassembly**: partial and coalesced reads handled incrementally
//! - **Zero-Copy I/O**: Uses `Bytes`/`BytesMut` for minimal allocations
//! - **Sequence numbers**: 16-bit, wrap-around skipping the acknowledgement number
//!
//! ## Wire Format
//!
//! ```text
//! +------+------+-----------+---------------------------------------------+
//! | 0x03 | 0x00 | u16 len   | TSDU                                        |
//! +------+------+-----------+---------------------------------------------+
//!
//! DT    : [0x02][0xF0][0x80] payload
//! CR/CC : [LI][0xE0|0xD0][00 00][4F 45][00][C0 01 07][C1 n calling][C2 n called]
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod codec;
pub mod error;
pub mod message;
pub mod sequence;
pub mod tpkt;

// Re-export main types
pub use codec::{TpktDecoder, REASSEMBLY_CAPACITY};
pub use error::WireError;
pub use message::{Message, MessageCodec, MessageType, TextCodec};
pub use sequence::{SequenceGenerator, SequenceNumber};
pub use tpkt::{
    encode_connection, encode_data, Tsaps, Tsdu, TsduCode, MAX_TPKT_SIZE, TPKT_HEADER_SIZE,
};
