//! TPKT packets and the TSDUs they carry.
//!
//! Every unit on the wire is a TPKT: a 4-byte header followed by exactly one
//! TSDU. Three TSDU kinds are used by the link: Connection-Request and
//! Connection-Confirm during the handshake, and Data afterwards.

use bytes::{BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};

use crate::WireError;

/// TPKT protocol version
pub const TPKT_VERSION: u8 = 0x03;

/// TPKT header size in bytes
pub const TPKT_HEADER_SIZE: usize = 4;

/// Largest TPKT (header included) the link will put on the wire
pub const MAX_TPKT_SIZE: usize = 128;

/// Data TSDU sub-header size in bytes
pub const DT_HEADER_SIZE: usize = 3;

/// End-of-TSDU flag carried by every Data TSDU
pub const DT_EOT: u8 = 0x80;

/// Size of the fixed part of a connection TSDU (LI, code, references, options)
pub const CONNECTION_FIXED_SIZE: usize = 7;

/// Destination reference sent in connection TSDUs
pub const DST_REF: [u8; 2] = [0x00, 0x00];

/// Source reference sent in connection TSDUs
pub const SRC_REF: [u8; 2] = [0x4F, 0x45];

/// Class/options byte sent in connection TSDUs
pub const CLASS_OPTIONS: u8 = 0x00;

/// TPDU size parameter: code, length, value (2^7 = 128 bytes)
pub const TPDU_SIZE_PARAM: [u8; 3] = [0xC0, 0x01, 0x07];

/// Calling TSAP parameter code
pub const CALLING_TSAP_CODE: u8 = 0xC1;

/// Called TSAP parameter code
pub const CALLED_TSAP_CODE: u8 = 0xC2;

/// TSDU codes
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TsduCode {
    /// Connection request
    ConnectionRequest = 0xE0,
    /// Connection confirm
    ConnectionConfirm = 0xD0,
    /// Data
    Data = 0xF0,
}

impl TryFrom<u8> for TsduCode {
    type Error = crate::WireError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0xE0 => Ok(TsduCode::ConnectionRequest),
            0xD0 => Ok(TsduCode::ConnectionConfirm),
            0xF0 => Ok(TsduCode::Data),
            _ => Err(crate::WireError::Type(value)),
        }
    }
}

/// Calling/called TSAP pair carried by CR and CC TSDUs
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Tsaps {
    /// Calling TSAP, `None` when the parameter is absent or empty
    pub calling: Option<Bytes>,
    /// Called TSAP, `None` when the parameter is absent or empty
    pub called: Option<Bytes>,
}

impl Tsaps {
    /// Build a TSAP pair from configured identifiers.
    ///
    /// Each identifier must be non-empty and fit a one-byte parameter length.
    pub fn new(calling: &str, called: &str) -> Result<Self, WireError> {
        Ok(Self {
            calling: Some(tsap_bytes("calling", calling)?),
            called: Some(tsap_bytes("called", called)?),
        })
    }
}

fn tsap_bytes(name: &str, tsap: &str) -> Result<Bytes, WireError> {
    if tsap.is_empty() {
        return Err(WireError::Tsap(format!("{} tsap is empty", name)));
    }
    if tsap.len() > u8::MAX as usize {
        return Err(WireError::Tsap(format!(
            "{} tsap is {} bytes long (max {})",
            name,
            tsap.len(),
            u8::MAX
        )));
    }
    Ok(Bytes::copy_from_slice(tsap.as_bytes()))
}

/// A decoded TSDU
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Tsdu {
    /// CR sent by the client to open the session
    ConnectionRequest(Tsaps),
    /// CC sent back by the server
    ConnectionConfirm(Tsaps),
    /// DT carrying one upper-layer payload
    Data(Bytes),
}

impl Tsdu {
    /// TSDU code of this unit
    pub fn code(&self) -> TsduCode {
        match self {
            Tsdu::ConnectionRequest(_) => TsduCode::ConnectionRequest,
            Tsdu::ConnectionConfirm(_) => TsduCode::ConnectionConfirm,
            Tsdu::Data(_) => TsduCode::Data,
        }
    }

    /// Encode this TSDU inside a TPKT.
    ///
    /// Fails with [`WireError::TooLong`] when the TPKT would exceed
    /// [`MAX_TPKT_SIZE`]; nothing is produced in that case.
    pub fn encode(&self) -> Result<Bytes, WireError> {
        match self {
            Tsdu::Data(payload) => encode_data(payload),
            Tsdu::ConnectionRequest(tsaps) => {
                encode_connection(TsduCode::ConnectionRequest, tsaps)
            }
            Tsdu::ConnectionConfirm(tsaps) => {
                encode_connection(TsduCode::ConnectionConfirm, tsaps)
            }
        }
    }

    /// Parse the TSDU that follows a TPKT header.
    pub fn parse(body: Bytes) -> Result<Self, WireError> {
        if body.len() < 2 {
            return Err(WireError::Malformed("missing tsdu code"));
        }

        match TsduCode::try_from(body[1])? {
            TsduCode::Data => {
                if body.len() < DT_HEADER_SIZE {
                    return Err(WireError::Malformed("truncated data header"));
                }
                Ok(Tsdu::Data(body.slice(DT_HEADER_SIZE..)))
            }
            TsduCode::ConnectionRequest => Ok(Tsdu::ConnectionRequest(parse_tsaps(&body)?)),
            TsduCode::ConnectionConfirm => Ok(Tsdu::ConnectionConfirm(parse_tsaps(&body)?)),
        }
    }
}

/// Encode a DT TSDU wrapping `payload`
pub fn encode_data(payload: &[u8]) -> Result<Bytes, WireError> {
    let total = TPKT_HEADER_SIZE + DT_HEADER_SIZE + payload.len();
    check_size(total)?;

    let mut buf = BytesMut::with_capacity(total);
    put_header(&mut buf, total);
    buf.put_u8((DT_HEADER_SIZE - 1) as u8);
    buf.put_u8(TsduCode::Data as u8);
    buf.put_u8(DT_EOT);
    buf.put_slice(payload);

    Ok(buf.freeze())
}

/// Encode a CR or CC TSDU carrying `tsaps`
pub fn encode_connection(code: TsduCode, tsaps: &Tsaps) -> Result<Bytes, WireError> {
    let calling = tsaps.calling.as_deref().unwrap_or_default();
    let called = tsaps.called.as_deref().unwrap_or_default();

    let tsdu_len = CONNECTION_FIXED_SIZE
        + TPDU_SIZE_PARAM.len()
        + 2
        + calling.len()
        + 2
        + called.len();
    let total = TPKT_HEADER_SIZE + tsdu_len;
    check_size(total)?;

    let mut buf = BytesMut::with_capacity(total);
    put_header(&mut buf, total);
    buf.put_u8((tsdu_len - 1) as u8);
    buf.put_u8(code as u8);
    buf.put_slice(&DST_REF);
    buf.put_slice(&SRC_REF);
    buf.put_u8(CLASS_OPTIONS);
    buf.put_slice(&TPDU_SIZE_PARAM);
    buf.put_u8(CALLING_TSAP_CODE);
    buf.put_u8(calling.len() as u8);
    buf.put_slice(calling);
    buf.put_u8(CALLED_TSAP_CODE);
    buf.put_u8(called.len() as u8);
    buf.put_slice(called);

    Ok(buf.freeze())
}

fn check_size(total: usize) -> Result<(), WireError> {
    if total > MAX_TPKT_SIZE {
        return Err(WireError::TooLong {
            size: total,
            max: MAX_TPKT_SIZE,
        });
    }
    Ok(())
}

fn put_header(buf: &mut BytesMut, total: usize) {
    buf.put_u8(TPKT_VERSION);
    buf.put_u8(0x00);
    buf.put_u16(total as u16);
}

/// Walk the variable part of a connection TSDU.
///
/// Parameters are `[code][len][value..]`; a truncated parameter ends the walk.
fn parse_tsaps(body: &Bytes) -> Result<Tsaps, WireError> {
    if body.len() < CONNECTION_FIXED_SIZE {
        return Err(WireError::Malformed("truncated connection tsdu"));
    }

    let mut tsaps = Tsaps::default();
    let mut pos = CONNECTION_FIXED_SIZE;
    while pos + 2 <= body.len() {
        let code = body[pos];
        let len = body[pos + 1] as usize;
        let start = pos + 2;
        if start + len > body.len() {
            break;
        }

        let value = (len > 0).then(|| body.slice(start..start + len));
        match code {
            CALLING_TSAP_CODE => tsaps.calling = value,
            CALLED_TSAP_CODE => tsaps.called = value,
            _ => {}
        }
        pos = start + len;
    }

    Ok(tsaps)
}
