//! Stream reassembly for TPKT packets.
//!
//! TCP delivers bytes, not packets: a read can end in the middle of a TPKT or
//! carry several of them. [`TpktDecoder`] accumulates bytes in a bounded buffer
//! and hands out complete TSDUs one at a time. The bound applies to bytes still
//! waiting for the rest of their packet, never to the size of a single read.

use bytes::{Buf, BytesMut};
use tracing::trace;

use crate::tpkt::{Tsdu, MAX_TPKT_SIZE, TPKT_HEADER_SIZE, TPKT_VERSION};
use crate::WireError;

/// Default reassembly buffer size (ten maximum-size TPKTs)
pub const REASSEMBLY_CAPACITY: usize = MAX_TPKT_SIZE * 10;

/// Smallest TPKT that can hold a TSDU (header, LI and code)
const MIN_TPKT_SIZE: usize = TPKT_HEADER_SIZE + 2;

/// Incremental TPKT decoder
#[derive(Debug)]
pub struct TpktDecoder {
    buf: BytesMut,
    capacity: usize,
}

impl TpktDecoder {
    /// Create a decoder with the default buffer size
    pub fn new() -> Self {
        Self::with_capacity(REASSEMBLY_CAPACITY)
    }

    /// Create a decoder holding at most `capacity` pending bytes
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buf: BytesMut::with_capacity(capacity),
            capacity,
        }
    }

    /// Append received bytes to the reassembly buffer without decoding.
    ///
    /// Fails when the bytes do not fit next to what is already buffered;
    /// [`TpktDecoder::feed`] decodes as it goes and has no such limit.
    pub fn extend(&mut self, data: &[u8]) -> Result<(), WireError> {
        let pending = self.buf.len() + data.len();
        if pending > self.capacity {
            return Err(WireError::Overflow(pending));
        }
        self.buf.extend_from_slice(data);
        trace!("Reassembly buffer holds {} bytes", self.buf.len());
        Ok(())
    }

    /// Feed a received chunk and decode every TSDU it completes.
    ///
    /// The chunk enters the buffer piece by piece, each piece no larger than
    /// the free space, and complete packets are taken out in between. A read
    /// of any size is accepted as long as it is made of packets that fit the
    /// buffer. Unknown TSDU codes are returned as [`WireError::Type`] and
    /// decoding goes on; any other error drops the buffer and the rest of the
    /// chunk and ends the result.
    pub fn feed(&mut self, mut data: &[u8]) -> Vec<Result<Tsdu, WireError>> {
        let mut decoded = Vec::new();
        loop {
            let take = self.capacity.saturating_sub(self.buf.len()).min(data.len());
            let (piece, rest) = data.split_at(take);
            self.buf.extend_from_slice(piece);
            data = rest;

            loop {
                match self.decode() {
                    Ok(Some(tsdu)) => decoded.push(Ok(tsdu)),
                    Ok(None) => break,
                    Err(WireError::Type(code)) => decoded.push(Err(WireError::Type(code))),
                    Err(e) => {
                        self.buf.clear();
                        decoded.push(Err(e));
                        return decoded;
                    }
                }
            }

            if data.is_empty() {
                trace!("Reassembly buffer holds {} bytes", self.buf.len());
                return decoded;
            }
            if self.buf.len() >= self.capacity {
                // Full and still no complete packet
                let pending = self.buf.len() + data.len();
                self.buf.clear();
                decoded.push(Err(WireError::Overflow(pending)));
                return decoded;
            }
        }
    }

    /// Decode one TSDU from the buffered bytes.
    ///
    /// Returns `Ok(None)` until a whole TPKT is available. A packet is removed
    /// from the buffer before its TSDU is parsed, so a [`WireError::Type`] for
    /// an unknown code leaves the decoder positioned on the next packet.
    pub fn decode(&mut self) -> Result<Option<Tsdu>, WireError> {
        // Need the full TPKT header to know the packet length
        if self.buf.len() < TPKT_HEADER_SIZE {
            return Ok(None);
        }

        if self.buf[0] != TPKT_VERSION {
            return Err(WireError::Version(self.buf[0]));
        }

        let tpkt_len = u16::from_be_bytes([self.buf[2], self.buf[3]]) as usize;
        if tpkt_len < MIN_TPKT_SIZE {
            return Err(WireError::Malformed("tpkt length shorter than tsdu header"));
        }
        if tpkt_len > self.capacity {
            return Err(WireError::Malformed("tpkt length exceeds reassembly buffer"));
        }

        // Check if we have the complete packet
        if self.buf.len() < tpkt_len {
            return Ok(None);
        }

        let mut packet = self.buf.split_to(tpkt_len).freeze();
        packet.advance(TPKT_HEADER_SIZE);

        Tsdu::parse(packet).map(Some)
    }

    /// Drop every buffered byte
    pub fn clear(&mut self) {
        self.buf.clear();
    }

    /// Number of bytes waiting for the rest of their packet
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }
}

impl Default for TpktDecoder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tpkt::{encode_data, Tsaps, TsduCode};
    use bytes::Bytes;

    #[test]
    fn test_partial_packet() {
        let frame = encode_data(b"0001PR1234").unwrap();
        let mut decoder = TpktDecoder::new();

        decoder.extend(&frame[..2]).unwrap();
        assert_eq!(decoder.decode().unwrap(), None);

        decoder.extend(&frame[2..9]).unwrap();
        assert_eq!(decoder.decode().unwrap(), None);

        decoder.extend(&frame[9..]).unwrap();
        assert_eq!(
            decoder.decode().unwrap(),
            Some(Tsdu::Data(Bytes::from_static(b"0001PR1234")))
        );
        assert_eq!(decoder.buffered(), 0);
    }

    #[test]
    fn test_several_packets_in_one_read() {
        let mut stream = Vec::new();
        stream.extend_from_slice(&encode_data(b"0001PR1111").unwrap());
        stream.extend_from_slice(&encode_data(b"0002PR2222").unwrap());
        let third = encode_data(b"0003PR3333").unwrap();
        stream.extend_from_slice(&third[..5]);

        let mut decoder = TpktDecoder::new();
        decoder.extend(&stream).unwrap();

        assert_eq!(
            decoder.decode().unwrap(),
            Some(Tsdu::Data(Bytes::from_static(b"0001PR1111")))
        );
        assert_eq!(
            decoder.decode().unwrap(),
            Some(Tsdu::Data(Bytes::from_static(b"0002PR2222")))
        );
        assert_eq!(decoder.decode().unwrap(), None);
        assert_eq!(decoder.buffered(), 5);
    }

    #[test]
    fn test_unknown_code_is_skipped() {
        let mut decoder = TpktDecoder::new();
        decoder
            .extend(&[0x03, 0x00, 0x00, 0x07, 0x02, 0x70, 0x80])
            .unwrap();
        let confirm = crate::tpkt::encode_connection(
            TsduCode::ConnectionConfirm,
            &Tsaps::new("A", "B").unwrap(),
        )
        .unwrap();
        decoder.extend(&confirm).unwrap();

        assert_eq!(decoder.decode(), Err(WireError::Type(0x70)));
        assert!(matches!(
            decoder.decode().unwrap(),
            Some(Tsdu::ConnectionConfirm(_))
        ));
    }

    #[test]
    fn test_bad_header() {
        let mut decoder = TpktDecoder::new();
        decoder.extend(&[0x04, 0x00, 0x00, 0x07]).unwrap();
        assert_eq!(decoder.decode(), Err(WireError::Version(0x04)));

        decoder.clear();
        decoder.extend(&[0x03, 0x00, 0x00, 0x02]).unwrap();
        assert!(matches!(decoder.decode(), Err(WireError::Malformed(_))));
    }

    #[test]
    fn test_overflow() {
        let mut decoder = TpktDecoder::with_capacity(16);
        decoder.extend(&[0x03; 10]).unwrap();
        assert_eq!(decoder.extend(&[0x03; 7]), Err(WireError::Overflow(17)));
        assert_eq!(decoder.buffered(), 10);
    }

    fn max_size_frame(fill: u8) -> Vec<u8> {
        let payload = vec![fill; MAX_TPKT_SIZE - 7];
        let frame = encode_data(&payload).unwrap();
        assert_eq!(frame.len(), MAX_TPKT_SIZE);
        frame.to_vec()
    }

    #[test]
    fn test_feed_burst_larger_than_buffer() {
        let stream: Vec<u8> = (0..11u8).flat_map(|i| max_size_frame(b'A' + i)).collect();
        assert!(stream.len() > REASSEMBLY_CAPACITY);

        let mut decoder = TpktDecoder::new();
        let decoded = decoder.feed(&stream);

        assert_eq!(decoded.len(), 11);
        for (i, tsdu) in decoded.into_iter().enumerate() {
            match tsdu {
                Ok(Tsdu::Data(payload)) => {
                    assert_eq!(payload.len(), MAX_TPKT_SIZE - 7);
                    assert!(payload.iter().all(|b| *b == b'A' + i as u8));
                }
                other => panic!("Expected data, got {:?}", other),
            }
        }
        assert_eq!(decoder.buffered(), 0);
    }

    #[test]
    fn test_feed_partial_then_large_read() {
        let frames: Vec<Vec<u8>> = (0..12u8).map(|i| max_size_frame(b'a' + i)).collect();
        let stream: Vec<u8> = frames.concat();

        let mut decoder = TpktDecoder::new();
        assert!(decoder.feed(&stream[..100]).is_empty());
        assert_eq!(decoder.buffered(), 100);

        // Rest of the first packet, ten more and half of the last one
        let cut = stream.len() - MAX_TPKT_SIZE / 2;
        let decoded = decoder.feed(&stream[100..cut]);
        assert_eq!(decoded.len(), 11);
        assert!(decoded.iter().all(|tsdu| matches!(tsdu, Ok(Tsdu::Data(_)))));
        assert_eq!(decoder.buffered(), MAX_TPKT_SIZE / 2);

        let decoded = decoder.feed(&stream[cut..]);
        assert_eq!(
            decoded,
            vec![Ok(Tsdu::Data(Bytes::from(vec![b'a' + 11; MAX_TPKT_SIZE - 7])))]
        );
        assert_eq!(decoder.buffered(), 0);
    }

    #[test]
    fn test_feed_skips_unknown_code_and_stops_on_bad_header() {
        let mut stream = vec![0x03, 0x00, 0x00, 0x07, 0x02, 0x70, 0x80];
        stream.extend_from_slice(&encode_data(b"0001PR1").unwrap());
        stream.extend_from_slice(&[0x04, 0x00, 0x00, 0x07]);
        stream.extend_from_slice(&encode_data(b"0002PR2").unwrap());

        let mut decoder = TpktDecoder::new();
        let decoded = decoder.feed(&stream);

        assert_eq!(
            decoded,
            vec![
                Err(WireError::Type(0x70)),
                Ok(Tsdu::Data(Bytes::from_static(b"0001PR1"))),
                Err(WireError::Version(0x04)),
            ]
        );
        assert_eq!(decoder.buffered(), 0);
    }

    #[test]
    fn test_feed_reports_overflow_when_no_packet_fits() {
        let mut decoder = TpktDecoder::with_capacity(3);
        let decoded = decoder.feed(&[0x03, 0x00, 0x00, 0x07, 0x02]);
        assert_eq!(decoded, vec![Err(WireError::Overflow(5))]);
        assert_eq!(decoder.buffered(), 0);
    }
}
