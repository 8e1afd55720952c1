//! RTMP chunk stream codec
//!
//! RTMP messages are split into chunks for multiplexing. Each chunk carries a
//! basic header (fmt + chunk stream id), a message header whose size depends
//! on fmt, and up to one chunk size worth of payload.
//!
//! ```text
//! Basic Header formats:
//! - 1 byte:  fmt(2) + csid(6)           for csid 2-63
//! - 2 bytes: fmt(2) + 0 + (csid-64)(8)  for csid 64-319
//! - 3 bytes: fmt(2) + 1 + (csid-64)(16 LE) for csid 64-65599
//!
//! Message Header formats (based on fmt):
//! - Type 0 (11 bytes): timestamp(3) + length(3) + type(1) + stream_id(4 LE)
//! - Type 1 (7 bytes):  timestamp_delta(3) + length(3) + type(1)
//! - Type 2 (3 bytes):  timestamp_delta(3)
//! - Type 3 (0 bytes):  continuation / inherit previous values
//!
//! The 32-bit big-endian extended timestamp follows the message header iff
//! the 24-bit timestamp field carries the escape value 0xFFFFFF. The message
//! stream id is little-endian on the wire; everything else is big-endian.
//! ```
//!
//! Reference: RTMP Specification Section 5.3

use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::collections::HashMap;

use crate::error::{ProtocolError, Result};
use crate::protocol::constants::*;

/// A chunk header with every field the wire can carry.
///
/// Fields a given fmt does not carry are left at zero. `timestamp` holds the
/// raw 24-bit field (absolute for fmt 0, delta for fmt 1/2); when it equals
/// [`EXTENDED_TIMESTAMP`] the real value is in `extended_timestamp`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChunkHeader {
    pub fmt: u8,
    pub csid: u32,
    pub timestamp: u32,
    pub message_length: u32,
    pub message_type: u8,
    pub stream_id: u32,
    pub extended_timestamp: u32,
}

impl ChunkHeader {
    /// Resolve the timestamp field, following the extended-timestamp escape
    pub fn resolved_timestamp(&self) -> u32 {
        if self.timestamp == EXTENDED_TIMESTAMP {
            self.extended_timestamp
        } else {
            self.timestamp
        }
    }

    /// Encode this header into `buf`
    pub fn encode(&self, buf: &mut BytesMut) {
        // Basic header
        if self.csid >= 64 + 256 {
            buf.put_u8((self.fmt << 6) | 1);
            buf.put_u16_le((self.csid - 64) as u16);
        } else if self.csid >= 64 {
            buf.put_u8(self.fmt << 6);
            buf.put_u8((self.csid - 64) as u8);
        } else {
            buf.put_u8((self.fmt << 6) | (self.csid as u8));
        }

        // Message header
        match self.fmt {
            0 => {
                put_u24(buf, self.timestamp);
                put_u24(buf, self.message_length);
                buf.put_u8(self.message_type);
                buf.put_u32_le(self.stream_id);
            }
            1 => {
                put_u24(buf, self.timestamp);
                put_u24(buf, self.message_length);
                buf.put_u8(self.message_type);
            }
            2 => {
                put_u24(buf, self.timestamp);
            }
            _ => {}
        }

        // Extended timestamp
        if self.fmt != 3 && self.timestamp == EXTENDED_TIMESTAMP {
            buf.put_u32(self.extended_timestamp);
        }
    }

    /// Parse a header from the front of `buf` without consuming anything.
    ///
    /// Returns `None` when more bytes are needed, otherwise the header and
    /// the number of bytes it occupies.
    pub fn peek(buf: &[u8]) -> Option<(ChunkHeader, usize)> {
        if buf.is_empty() {
            return None;
        }

        let first = buf[0];
        let fmt = first >> 6;
        let csid0 = (first & 0x3F) as u32;

        let (csid, basic_len) = match csid0 {
            0 => {
                if buf.len() < 2 {
                    return None;
                }
                (buf[1] as u32 + 64, 2)
            }
            1 => {
                if buf.len() < 3 {
                    return None;
                }
                (u16::from_le_bytes([buf[1], buf[2]]) as u32 + 64, 3)
            }
            _ => (csid0, 1),
        };

        let msg_header_len = match fmt {
            0 => 11,
            1 => 7,
            2 => 3,
            _ => 0,
        };

        if buf.len() < basic_len + msg_header_len {
            return None;
        }

        let mut header = ChunkHeader {
            fmt,
            csid,
            ..Default::default()
        };

        let h = &buf[basic_len..];
        match fmt {
            0 => {
                header.timestamp = get_u24(&h[0..3]);
                header.message_length = get_u24(&h[3..6]);
                header.message_type = h[6];
                header.stream_id = u32::from_le_bytes([h[7], h[8], h[9], h[10]]);
            }
            1 => {
                header.timestamp = get_u24(&h[0..3]);
                header.message_length = get_u24(&h[3..6]);
                header.message_type = h[6];
            }
            2 => {
                header.timestamp = get_u24(&h[0..3]);
            }
            _ => {}
        }

        let mut total = basic_len + msg_header_len;
        if fmt != 3 && header.timestamp == EXTENDED_TIMESTAMP {
            if buf.len() < total + 4 {
                return None;
            }
            let e = &buf[total..];
            header.extended_timestamp = u32::from_be_bytes([e[0], e[1], e[2], e[3]]);
            total += 4;
        }

        Some((header, total))
    }

    /// Parse a header from `buf`, consuming its bytes.
    ///
    /// Returns `None` when more bytes are needed.
    pub fn decode(buf: &mut BytesMut) -> Option<ChunkHeader> {
        let (header, len) = Self::peek(buf)?;
        buf.advance(len);
        Some(header)
    }
}

/// A complete RTMP message, reassembled from chunks
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawMessage {
    /// Chunk stream the message arrived on
    pub csid: u32,
    /// Absolute timestamp in milliseconds
    pub timestamp: u32,
    /// Message type id
    pub type_id: u8,
    /// Message stream id
    pub stream_id: u32,
    /// Message payload, exactly `length` bytes
    pub payload: Bytes,
}

/// Per-chunk-stream reassembly state.
///
/// The non-payload fields double as the "last seen header" memo that fmt-3
/// chunks starting a fresh message inherit from.
#[derive(Debug, Default)]
struct ChunkStreamState {
    timestamp: u32,
    message_length: u32,
    message_type: u8,
    stream_id: u32,
    /// Payload collected so far for the in-progress message
    partial: BytesMut,
    /// Total length of the in-progress message, 0 when idle
    expected: u32,
}

/// Chunk stream decoder: demultiplexes chunk streams and reassembles messages
pub struct ChunkDecoder {
    /// Maximum payload bytes per incoming chunk
    chunk_size: u32,
    /// Per-chunk-stream state, keyed by csid
    streams: HashMap<u32, ChunkStreamState>,
}

impl ChunkDecoder {
    /// Create a decoder with the protocol default chunk size
    pub fn new() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            streams: HashMap::new(),
        }
    }

    /// Apply a Set Chunk Size from the peer, capped at the 24-bit maximum
    pub fn set_chunk_size(&mut self, size: u32) {
        self.chunk_size = size.min(MAX_CHUNK_SIZE);
    }

    /// Current read chunk size
    pub fn chunk_size(&self) -> u32 {
        self.chunk_size
    }

    /// Discard the in-progress message on a chunk stream (Abort message)
    pub fn abort(&mut self, csid: u32) {
        if let Some(state) = self.streams.get_mut(&csid) {
            state.partial.clear();
            state.expected = 0;
        }
    }

    /// Try to decode one chunk from `buf`.
    ///
    /// Returns `Ok(Some(message))` when the chunk completed a message,
    /// `Ok(None)` when more data is needed or the chunk was a fragment.
    /// Nothing is consumed from `buf` until a whole chunk is available.
    pub fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<RawMessage>> {
        let (header, header_len) = match ChunkHeader::peek(buf) {
            Some(v) => v,
            None => return Ok(None),
        };

        let chunk_size = self.chunk_size;
        let state = self.streams.entry(header.csid).or_default();
        let starting = state.expected == 0;

        // The first chunk ever seen on a csid must carry a full header:
        // there is nothing to inherit from yet.
        if starting && header.fmt != 0 && state.message_type == 0 && state.message_length == 0 {
            return Err(ProtocolError::InvalidChunkHeader.into());
        }

        // Work out the message fields this chunk implies, without touching
        // the state until the payload is known to be buffered.
        let (timestamp, message_length, message_type, stream_id) = match header.fmt {
            0 => (
                header.resolved_timestamp(),
                header.message_length,
                header.message_type,
                header.stream_id,
            ),
            1 => (
                state.timestamp.wrapping_add(header.resolved_timestamp()),
                header.message_length,
                header.message_type,
                state.stream_id,
            ),
            2 => (
                state.timestamp.wrapping_add(header.resolved_timestamp()),
                state.message_length,
                state.message_type,
                state.stream_id,
            ),
            _ => (
                // A fmt-3 chunk that starts a new message inherits the whole
                // last-seen header; a continuation leaves it alone.
                state.timestamp,
                state.message_length,
                state.message_type,
                state.stream_id,
            ),
        };

        let expected = if starting {
            message_length
        } else {
            state.expected
        };

        let remaining = expected.saturating_sub(state.partial.len() as u32);
        let chunk_data_len = remaining.min(chunk_size) as usize;

        if buf.len() < header_len + chunk_data_len {
            return Ok(None);
        }

        buf.advance(header_len);
        state.timestamp = timestamp;
        state.message_length = message_length;
        state.message_type = message_type;
        state.stream_id = stream_id;

        if starting {
            state.expected = expected;
            state.partial.reserve(expected as usize);
        }

        state.partial.put_slice(&buf[..chunk_data_len]);
        buf.advance(chunk_data_len);

        if state.partial.len() as u32 >= state.expected {
            let payload = state.partial.split().freeze();
            state.expected = 0;

            Ok(Some(RawMessage {
                csid: header.csid,
                timestamp: state.timestamp,
                type_id: state.message_type,
                stream_id: state.stream_id,
                payload,
            }))
        } else {
            Ok(None)
        }
    }

    /// Drain every complete message currently buffered
    pub fn decode_all(&mut self, buf: &mut BytesMut) -> Result<Vec<RawMessage>> {
        let mut out = Vec::new();
        loop {
            let before = buf.len();
            match self.decode(buf)? {
                Some(msg) => out.push(msg),
                None => {
                    if buf.len() == before {
                        return Ok(out);
                    }
                }
            }
        }
    }
}

impl Default for ChunkDecoder {
    fn default() -> Self {
        Self::new()
    }
}

/// Chunk stream encoder: fragments messages into chunks
pub struct ChunkEncoder {
    /// Maximum payload bytes per outgoing chunk
    chunk_size: u32,
}

impl ChunkEncoder {
    /// Create an encoder with the protocol default chunk size
    pub fn new() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
        }
    }

    /// Set the outgoing chunk size (announce with Set Chunk Size first)
    pub fn set_chunk_size(&mut self, size: u32) {
        self.chunk_size = size.min(MAX_CHUNK_SIZE).max(1);
    }

    /// Current write chunk size
    pub fn chunk_size(&self) -> u32 {
        self.chunk_size
    }

    /// Encode a message into chunks: one fmt-0 header, then fmt-3
    /// continuations every `chunk_size` payload bytes.
    pub fn encode(&self, msg: &RawMessage, buf: &mut BytesMut) {
        let (ts_field, ext) = if msg.timestamp >= EXTENDED_TIMESTAMP {
            (EXTENDED_TIMESTAMP, msg.timestamp)
        } else {
            (msg.timestamp, 0)
        };

        let header = ChunkHeader {
            fmt: 0,
            csid: msg.csid,
            timestamp: ts_field,
            message_length: msg.payload.len() as u32,
            message_type: msg.type_id,
            stream_id: msg.stream_id,
            extended_timestamp: ext,
        };
        header.encode(buf);

        let continuation = ChunkHeader {
            fmt: 3,
            csid: msg.csid,
            ..Default::default()
        };

        let chunk_size = self.chunk_size as usize;
        let mut offset = 0;
        loop {
            let n = (msg.payload.len() - offset).min(chunk_size);
            buf.put_slice(&msg.payload[offset..offset + n]);
            offset += n;
            if offset >= msg.payload.len() {
                break;
            }
            continuation.encode(buf);
        }
    }
}

impl Default for ChunkEncoder {
    fn default() -> Self {
        Self::new()
    }
}

fn put_u24(buf: &mut BytesMut, value: u32) {
    buf.put_u8((value >> 16) as u8);
    buf.put_u8((value >> 8) as u8);
    buf.put_u8(value as u8);
}

fn get_u24(b: &[u8]) -> u32 {
    ((b[0] as u32) << 16) | ((b[1] as u32) << 8) | (b[2] as u32)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(header: &ChunkHeader) -> ChunkHeader {
        let mut buf = BytesMut::new();
        header.encode(&mut buf);
        let decoded = ChunkHeader::decode(&mut buf).expect("complete header");
        assert!(buf.is_empty(), "decode must consume the whole header");
        decoded
    }

    #[test]
    fn test_header_roundtrip_all_formats() {
        let csids = [3u32, 63, 64, 319, 320, 65599];
        let timestamps = [0u32, 1, 0xFFFFFE, 0xFFFFFF, 0x0100_0000, 0xFFFF_FFFF];

        for &csid in &csids {
            for &ts in &timestamps {
                let (field, ext) = if ts >= 0xFFFFFF { (0xFFFFFF, ts) } else { (ts, 0) };

                let h0 = ChunkHeader {
                    fmt: 0,
                    csid,
                    timestamp: field,
                    message_length: 1234,
                    message_type: MSG_VIDEO,
                    stream_id: 7,
                    extended_timestamp: ext,
                };
                assert_eq!(roundtrip(&h0), h0);

                let h1 = ChunkHeader {
                    fmt: 1,
                    csid,
                    timestamp: field,
                    message_length: 0xFFFFFF,
                    message_type: MSG_AUDIO,
                    extended_timestamp: ext,
                    ..Default::default()
                };
                assert_eq!(roundtrip(&h1), h1);

                let h2 = ChunkHeader {
                    fmt: 2,
                    csid,
                    timestamp: field,
                    extended_timestamp: ext,
                    ..Default::default()
                };
                assert_eq!(roundtrip(&h2), h2);

                let h3 = ChunkHeader {
                    fmt: 3,
                    csid,
                    ..Default::default()
                };
                assert_eq!(roundtrip(&h3), h3);
            }
        }
    }

    #[test]
    fn test_basic_header_sizes() {
        let mut buf = BytesMut::new();
        ChunkHeader {
            fmt: 3,
            csid: 3,
            ..Default::default()
        }
        .encode(&mut buf);
        assert_eq!(buf.len(), 1);

        buf.clear();
        ChunkHeader {
            fmt: 3,
            csid: 319,
            ..Default::default()
        }
        .encode(&mut buf);
        assert_eq!(buf.len(), 2);

        buf.clear();
        ChunkHeader {
            fmt: 3,
            csid: 320,
            ..Default::default()
        }
        .encode(&mut buf);
        assert_eq!(buf.len(), 3);
    }

    #[test]
    fn test_stream_id_is_little_endian() {
        let header = ChunkHeader {
            fmt: 0,
            csid: 3,
            timestamp: 0,
            message_length: 0,
            message_type: MSG_COMMAND_AMF0,
            stream_id: 1,
            extended_timestamp: 0,
        };
        let mut buf = BytesMut::new();
        header.encode(&mut buf);
        // basic(1) + ts(3) + len(3) + type(1), then stream id LE
        assert_eq!(&buf[8..12], &[1, 0, 0, 0]);
    }

    #[test]
    fn test_peek_needs_more_data() {
        // fmt 0 header truncated after the basic header
        let bytes = [0x03u8, 0x00, 0x00];
        assert!(ChunkHeader::peek(&bytes).is_none());
        assert!(ChunkHeader::peek(&[]).is_none());

        // 3-byte basic header, only two bytes present
        assert!(ChunkHeader::peek(&[0xC1, 0x00]).is_none());
    }

    fn encode_message(encoder: &ChunkEncoder, msg: &RawMessage) -> BytesMut {
        let mut buf = BytesMut::new();
        encoder.encode(msg, &mut buf);
        buf
    }

    #[test]
    fn test_fragmentation_chunk_count() {
        // 1000-byte payload at chunk size 128: one fmt-0 chunk plus seven
        // fmt-3 continuations.
        let msg = RawMessage {
            csid: 4,
            timestamp: 100,
            type_id: MSG_VIDEO,
            stream_id: 1,
            payload: Bytes::from(vec![0xCC; 1000]),
        };

        let encoder = ChunkEncoder::new();
        let mut buf = encode_message(&encoder, &msg);

        // fmt-0 header is 12 bytes for a one-byte csid; each continuation
        // basic header is 1 byte.
        assert_eq!(buf.len(), 12 + 7 + 1000);

        let mut decoder = ChunkDecoder::new();
        let mut out = None;
        while out.is_none() && !buf.is_empty() {
            out = decoder.decode(&mut buf).unwrap();
        }
        assert_eq!(out.unwrap(), msg);
        assert!(buf.is_empty());
    }

    #[test]
    fn test_fragment_reassembly_any_chunk_size() {
        let payload: Vec<u8> = (0..=255u8).cycle().take(5000).collect();
        let msg = RawMessage {
            csid: 9,
            timestamp: 42,
            type_id: MSG_AUDIO,
            stream_id: 3,
            payload: Bytes::from(payload),
        };

        for chunk_size in [1u32, 2, 127, 128, 129, 4096, 0xFFFFFF] {
            let mut encoder = ChunkEncoder::new();
            encoder.set_chunk_size(chunk_size);
            let mut decoder = ChunkDecoder::new();
            decoder.set_chunk_size(chunk_size);

            let mut buf = encode_message(&encoder, &msg);
            let mut out = None;
            while out.is_none() && !buf.is_empty() {
                out = decoder.decode(&mut buf).unwrap();
            }
            assert_eq!(out.unwrap(), msg, "chunk_size {}", chunk_size);
        }
    }

    #[test]
    fn test_extended_timestamp_on_wire() {
        let msg = RawMessage {
            csid: 4,
            timestamp: 0x0100_0000,
            type_id: MSG_VIDEO,
            stream_id: 1,
            payload: Bytes::from_static(&[0u8; 4]),
        };

        let encoder = ChunkEncoder::new();
        let buf = encode_message(&encoder, &msg);

        // 24-bit field carries the escape
        assert_eq!(&buf[1..4], &[0xFF, 0xFF, 0xFF]);
        // extended timestamp after the 11-byte message header
        assert_eq!(&buf[12..16], &[0x01, 0x00, 0x00, 0x00]);

        let mut decoder = ChunkDecoder::new();
        let mut buf = buf;
        let out = decoder.decode(&mut buf).unwrap().unwrap();
        assert_eq!(out.timestamp, 0x0100_0000);
    }

    #[test]
    fn test_timestamp_delta_accumulates() {
        let mut buf = BytesMut::new();

        // fmt 0 at t=100
        ChunkHeader {
            fmt: 0,
            csid: 4,
            timestamp: 100,
            message_length: 1,
            message_type: MSG_AUDIO,
            stream_id: 1,
            extended_timestamp: 0,
        }
        .encode(&mut buf);
        buf.put_u8(0xAA);

        // fmt 2 with delta 33, twice
        for _ in 0..2 {
            ChunkHeader {
                fmt: 2,
                csid: 4,
                timestamp: 33,
                ..Default::default()
            }
            .encode(&mut buf);
            buf.put_u8(0xAB);
        }

        let mut decoder = ChunkDecoder::new();
        let m1 = decoder.decode(&mut buf).unwrap().unwrap();
        let m2 = decoder.decode(&mut buf).unwrap().unwrap();
        let m3 = decoder.decode(&mut buf).unwrap().unwrap();
        assert_eq!(m1.timestamp, 100);
        assert_eq!(m2.timestamp, 133);
        assert_eq!(m3.timestamp, 166);
        assert_eq!(m3.stream_id, 1);
        assert_eq!(m3.type_id, MSG_AUDIO);
    }

    #[test]
    fn test_fmt3_inherits_last_header() {
        let mut buf = BytesMut::new();

        ChunkHeader {
            fmt: 0,
            csid: 4,
            timestamp: 500,
            message_length: 2,
            message_type: MSG_VIDEO,
            stream_id: 9,
            extended_timestamp: 0,
        }
        .encode(&mut buf);
        buf.put_slice(&[1, 2]);

        // A fresh message on the same csid announced with fmt 3 only.
        ChunkHeader {
            fmt: 3,
            csid: 4,
            ..Default::default()
        }
        .encode(&mut buf);
        buf.put_slice(&[3, 4]);

        let mut decoder = ChunkDecoder::new();
        let m1 = decoder.decode(&mut buf).unwrap().unwrap();
        let m2 = decoder.decode(&mut buf).unwrap().unwrap();

        assert_eq!(m1.payload.as_ref(), &[1, 2]);
        assert_eq!(m2.payload.as_ref(), &[3, 4]);
        assert_eq!(m2.timestamp, 500);
        assert_eq!(m2.type_id, MSG_VIDEO);
        assert_eq!(m2.stream_id, 9);
    }

    #[test]
    fn test_abort_drops_only_one_stream() {
        let long = RawMessage {
            csid: 4,
            timestamp: 0,
            type_id: MSG_VIDEO,
            stream_id: 1,
            payload: Bytes::from(vec![0x11; 200]),
        };
        let other = RawMessage {
            csid: 5,
            timestamp: 0,
            type_id: MSG_AUDIO,
            stream_id: 1,
            payload: Bytes::from(vec![0x22; 200]),
        };

        let encoder = ChunkEncoder::new();
        let enc_long = encode_message(&encoder, &long);
        let enc_other = encode_message(&encoder, &other);

        let mut decoder = ChunkDecoder::new();

        // Feed only the first chunk (header + 128 bytes) of each message.
        let mut partial = BytesMut::new();
        partial.put_slice(&enc_long[..12 + 128]);
        partial.put_slice(&enc_other[..12 + 128]);
        assert!(decoder.decode(&mut partial).unwrap().is_none());
        assert!(decoder.decode(&mut partial).unwrap().is_none());

        // Abort csid 4: its partial payload disappears, csid 5 is intact.
        decoder.abort(4);

        let mut rest = BytesMut::new();
        rest.put_slice(&enc_other[12 + 128..]);
        let out = decoder.decode_all(&mut rest).unwrap();
        assert_eq!(out, vec![other]);
    }

    #[test]
    fn test_interleaved_chunk_streams() {
        let a = RawMessage {
            csid: 4,
            timestamp: 10,
            type_id: MSG_VIDEO,
            stream_id: 1,
            payload: Bytes::from(vec![0xAA; 300]),
        };
        let b = RawMessage {
            csid: 5,
            timestamp: 20,
            type_id: MSG_AUDIO,
            stream_id: 1,
            payload: Bytes::from(vec![0xBB; 300]),
        };

        let encoder = ChunkEncoder::new();
        let enc_a = encode_message(&encoder, &a);
        let enc_b = encode_message(&encoder, &b);

        // Interleave: a[0], b[0], a[1], b[1], a[2], b[2]
        // Chunk boundaries for 300 bytes at 128: 12+128, 1+128, 1+44.
        let a_parts = [&enc_a[..140], &enc_a[140..269], &enc_a[269..]];
        let b_parts = [&enc_b[..140], &enc_b[140..269], &enc_b[269..]];

        let mut buf = BytesMut::new();
        for i in 0..3 {
            buf.put_slice(a_parts[i]);
            buf.put_slice(b_parts[i]);
        }

        let mut decoder = ChunkDecoder::new();
        let messages = decoder.decode_all(&mut buf).unwrap();
        assert_eq!(messages, vec![a, b]);
    }
}
