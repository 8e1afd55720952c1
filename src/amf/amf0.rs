//! AMF0 encoder and decoder
//!
//! AMF0 is the tag-prefixed serialization used by RTMP command and data
//! messages. Only the subset that appears on an RTMP control path is
//! implemented:
//!
//! ```text
//! 0x00 - Number (IEEE 754 double, big-endian)
//! 0x01 - Boolean (1 byte, 0 = false)
//! 0x02 - String (16-bit length prefix)
//! 0x03 - Object (key-value pairs until 00 00 09)
//! 0x05 - Null
//! 0x08 - ECMA Array (32-bit count hint, then key-value pairs until 00 00 09)
//! 0x0C - Long String (32-bit length prefix)
//! ```
//!
//! Any other marker fails with `UnsupportedMarker`. The ECMA array count is
//! advisory; the `00 00 09` terminator is authoritative.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use super::value::{AmfProperties, AmfValue};
use crate::error::AmfError;

// AMF0 type markers
const MARKER_NUMBER: u8 = 0x00;
const MARKER_BOOLEAN: u8 = 0x01;
const MARKER_STRING: u8 = 0x02;
const MARKER_OBJECT: u8 = 0x03;
const MARKER_NULL: u8 = 0x05;
const MARKER_ECMA_ARRAY: u8 = 0x08;
const MARKER_OBJECT_END: u8 = 0x09;
const MARKER_LONG_STRING: u8 = 0x0C;

/// Maximum nesting depth for objects/arrays (prevent stack overflow)
const MAX_NESTING_DEPTH: usize = 64;

/// AMF0 decoder
pub struct Amf0Decoder {
    /// Current nesting depth
    depth: usize,
}

impl Amf0Decoder {
    /// Create a new decoder
    pub fn new() -> Self {
        Self { depth: 0 }
    }

    /// Decode a single AMF0 value from the buffer
    pub fn decode(&mut self, buf: &mut Bytes) -> Result<AmfValue, AmfError> {
        if buf.is_empty() {
            return Err(AmfError::UnexpectedEof);
        }

        self.depth += 1;
        if self.depth > MAX_NESTING_DEPTH {
            self.depth -= 1;
            return Err(AmfError::NestingTooDeep);
        }

        let marker = buf.get_u8();
        let result = self.decode_value(marker, buf);
        self.depth -= 1;
        result
    }

    /// Decode all values from buffer until exhausted
    pub fn decode_all(&mut self, buf: &mut Bytes) -> Result<Vec<AmfValue>, AmfError> {
        let mut values = Vec::new();
        while buf.has_remaining() {
            values.push(self.decode(buf)?);
        }
        Ok(values)
    }

    fn decode_value(&mut self, marker: u8, buf: &mut Bytes) -> Result<AmfValue, AmfError> {
        match marker {
            MARKER_NUMBER => {
                if buf.remaining() < 8 {
                    return Err(AmfError::UnexpectedEof);
                }
                Ok(AmfValue::Number(buf.get_f64()))
            }
            MARKER_BOOLEAN => {
                if buf.is_empty() {
                    return Err(AmfError::UnexpectedEof);
                }
                Ok(AmfValue::Boolean(buf.get_u8() != 0))
            }
            MARKER_STRING => {
                let s = read_utf8(buf)?;
                Ok(AmfValue::String(s))
            }
            MARKER_OBJECT => {
                let props = self.decode_properties(buf)?;
                Ok(AmfValue::Object(props))
            }
            MARKER_NULL => Ok(AmfValue::Null),
            MARKER_ECMA_ARRAY => {
                if buf.remaining() < 4 {
                    return Err(AmfError::UnexpectedEof);
                }
                // Associative count hint; the terminator decides.
                let _count = buf.get_u32();
                let props = self.decode_properties(buf)?;
                Ok(AmfValue::EcmaArray(props))
            }
            MARKER_LONG_STRING => {
                let s = read_utf8_long(buf)?;
                Ok(AmfValue::String(s))
            }
            _ => Err(AmfError::UnsupportedMarker(marker)),
        }
    }

    /// Read key-value pairs until the 00 00 09 terminator
    fn decode_properties(&mut self, buf: &mut Bytes) -> Result<AmfProperties, AmfError> {
        let mut properties = Vec::new();

        loop {
            if buf.remaining() < 2 {
                return Err(AmfError::UnexpectedEof);
            }
            let len = buf.get_u16() as usize;

            if len == 0 {
                if buf.is_empty() {
                    return Err(AmfError::UnexpectedEof);
                }
                // A zero-length key is only legal as the terminator prefix.
                if buf.get_u8() != MARKER_OBJECT_END {
                    return Err(AmfError::EmptyKey);
                }
                break;
            }

            if buf.remaining() < len {
                return Err(AmfError::UnexpectedEof);
            }
            let raw = buf.copy_to_bytes(len);
            let key = String::from_utf8(raw.to_vec()).map_err(|_| AmfError::InvalidUtf8)?;

            let value = self.decode(buf)?;
            properties.push((key, value));
        }

        Ok(properties)
    }
}

impl Default for Amf0Decoder {
    fn default() -> Self {
        Self::new()
    }
}

/// Read UTF-8 string with 16-bit length prefix
fn read_utf8(buf: &mut Bytes) -> Result<String, AmfError> {
    if buf.remaining() < 2 {
        return Err(AmfError::UnexpectedEof);
    }

    let len = buf.get_u16() as usize;
    if buf.remaining() < len {
        return Err(AmfError::UnexpectedEof);
    }

    let bytes = buf.copy_to_bytes(len);
    String::from_utf8(bytes.to_vec()).map_err(|_| AmfError::InvalidUtf8)
}

/// Read UTF-8 string with 32-bit length prefix
fn read_utf8_long(buf: &mut Bytes) -> Result<String, AmfError> {
    if buf.remaining() < 4 {
        return Err(AmfError::UnexpectedEof);
    }

    let len = buf.get_u32() as usize;
    if buf.remaining() < len {
        return Err(AmfError::UnexpectedEof);
    }

    let bytes = buf.copy_to_bytes(len);
    String::from_utf8(bytes.to_vec()).map_err(|_| AmfError::InvalidUtf8)
}

/// AMF0 encoder
pub struct Amf0Encoder {
    buf: BytesMut,
}

impl Amf0Encoder {
    /// Create a new encoder
    pub fn new() -> Self {
        Self {
            buf: BytesMut::with_capacity(256),
        }
    }

    /// Get the encoded bytes and reset encoder
    pub fn finish(&mut self) -> Bytes {
        self.buf.split().freeze()
    }

    /// Get current encoded length
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    /// Check if encoder is empty
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Encode a single AMF0 value
    pub fn encode(&mut self, value: &AmfValue) {
        match value {
            AmfValue::Number(n) => {
                self.buf.put_u8(MARKER_NUMBER);
                self.buf.put_f64(*n);
            }
            AmfValue::Boolean(b) => {
                self.buf.put_u8(MARKER_BOOLEAN);
                self.buf.put_u8(u8::from(*b));
            }
            AmfValue::String(s) => {
                if s.len() > 0xFFFF {
                    self.buf.put_u8(MARKER_LONG_STRING);
                    self.buf.put_u32(s.len() as u32);
                } else {
                    self.buf.put_u8(MARKER_STRING);
                    self.buf.put_u16(s.len() as u16);
                }
                self.buf.put_slice(s.as_bytes());
            }
            AmfValue::Object(props) => {
                self.buf.put_u8(MARKER_OBJECT);
                self.encode_properties(props);
            }
            AmfValue::Null => {
                self.buf.put_u8(MARKER_NULL);
            }
            AmfValue::EcmaArray(props) => {
                self.buf.put_u8(MARKER_ECMA_ARRAY);
                self.buf.put_u32(props.len() as u32);
                self.encode_properties(props);
            }
        }
    }

    /// Encode multiple values
    pub fn encode_all(&mut self, values: &[AmfValue]) {
        for value in values {
            self.encode(value);
        }
    }

    fn encode_properties(&mut self, props: &AmfProperties) {
        for (key, val) in props {
            self.write_utf8(key);
            self.encode(val);
        }
        // Object end marker: empty key + 0x09
        self.buf.put_u16(0);
        self.buf.put_u8(MARKER_OBJECT_END);
    }

    /// Write UTF-8 string with 16-bit length prefix (no type marker)
    fn write_utf8(&mut self, s: &str) {
        let len = s.len().min(0xFFFF);
        self.buf.put_u16(len as u16);
        self.buf.put_slice(&s.as_bytes()[..len]);
    }
}

impl Default for Amf0Encoder {
    fn default() -> Self {
        Self::new()
    }
}

/// Convenience function to encode a single value
pub fn encode(value: &AmfValue) -> Bytes {
    let mut encoder = Amf0Encoder::new();
    encoder.encode(value);
    encoder.finish()
}

/// Convenience function to encode multiple values
pub fn encode_all(values: &[AmfValue]) -> Bytes {
    let mut encoder = Amf0Encoder::new();
    encoder.encode_all(values);
    encoder.finish()
}

/// Convenience function to decode a single value
pub fn decode(data: &[u8]) -> Result<AmfValue, AmfError> {
    let mut decoder = Amf0Decoder::new();
    let mut buf = Bytes::copy_from_slice(data);
    decoder.decode(&mut buf)
}

/// Convenience function to decode all values
pub fn decode_all(data: &[u8]) -> Result<Vec<AmfValue>, AmfError> {
    let mut decoder = Amf0Decoder::new();
    let mut buf = Bytes::copy_from_slice(data);
    decoder.decode_all(&mut buf)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_number_roundtrip() {
        for n in [0.0, 42.5, -1.0, f64::MAX, 1e-300] {
            let value = AmfValue::Number(n);
            let encoded = encode(&value);
            assert_eq!(encoded[0], MARKER_NUMBER);
            assert_eq!(encoded.len(), 9);
            assert_eq!(decode(&encoded).unwrap(), value);
        }
    }

    #[test]
    fn test_boolean_roundtrip() {
        for b in [true, false] {
            let value = AmfValue::Boolean(b);
            let encoded = encode(&value);
            assert_eq!(decode(&encoded).unwrap(), value);
        }
    }

    #[test]
    fn test_string_roundtrip() {
        let value = AmfValue::String("hello world".into());
        let encoded = encode(&value);
        assert_eq!(encoded[0], MARKER_STRING);
        assert_eq!(decode(&encoded).unwrap(), value);

        let value = AmfValue::String(String::new());
        assert_eq!(decode(&encode(&value)).unwrap(), value);
    }

    #[test]
    fn test_long_string() {
        let long_str = "x".repeat(70_000);
        let value = AmfValue::String(long_str.clone());
        let encoded = encode(&value);
        assert_eq!(encoded[0], MARKER_LONG_STRING);
        assert_eq!(decode(&encoded).unwrap(), AmfValue::String(long_str));
    }

    #[test]
    fn test_null_roundtrip() {
        let encoded = encode(&AmfValue::Null);
        assert_eq!(&encoded[..], &[MARKER_NULL]);
        assert_eq!(decode(&encoded).unwrap(), AmfValue::Null);
    }

    #[test]
    fn test_object_roundtrip() {
        let value = AmfValue::Object(vec![
            ("name".to_string(), AmfValue::String("test".into())),
            ("value".to_string(), AmfValue::Number(123.0)),
            ("flag".to_string(), AmfValue::Boolean(true)),
        ]);

        let encoded = encode(&value);
        // Property order survives the roundtrip.
        assert_eq!(decode(&encoded).unwrap(), value);

        // Terminator is the last three bytes.
        assert_eq!(&encoded[encoded.len() - 3..], &[0, 0, MARKER_OBJECT_END]);
    }

    #[test]
    fn test_nested_object_roundtrip() {
        let inner = AmfValue::Object(vec![("x".to_string(), AmfValue::Number(1.0))]);
        let value = AmfValue::Object(vec![
            ("inner".to_string(), inner),
            ("tail".to_string(), AmfValue::Null),
        ]);
        assert_eq!(decode(&encode(&value)).unwrap(), value);
    }

    #[test]
    fn test_ecma_array_roundtrip() {
        let value = AmfValue::EcmaArray(vec![
            ("duration".to_string(), AmfValue::Number(0.0)),
            ("encoder".to_string(), AmfValue::String("test".into())),
        ]);
        let encoded = encode(&value);
        assert_eq!(encoded[0], MARKER_ECMA_ARRAY);
        assert_eq!(decode(&encoded).unwrap(), value);
    }

    #[test]
    fn test_ecma_array_count_is_advisory() {
        // Count hint says 99, but the terminator ends the array after one pair.
        let mut encoder = Amf0Encoder::new();
        encoder.buf.put_u8(MARKER_ECMA_ARRAY);
        encoder.buf.put_u32(99);
        encoder.write_utf8("only");
        encoder.encode(&AmfValue::Number(1.0));
        encoder.buf.put_u16(0);
        encoder.buf.put_u8(MARKER_OBJECT_END);
        let encoded = encoder.finish();

        let decoded = decode(&encoded).unwrap();
        assert_eq!(
            decoded,
            AmfValue::EcmaArray(vec![("only".to_string(), AmfValue::Number(1.0))])
        );
    }

    #[test]
    fn test_empty_key_is_error() {
        // Object with a zero-length key followed by a value marker rather
        // than the end marker.
        let data = [MARKER_OBJECT, 0x00, 0x00, MARKER_NUMBER];
        assert_eq!(decode(&data), Err(AmfError::EmptyKey));
    }

    #[test]
    fn test_unsupported_marker() {
        // Strict array (0x0A) is outside the supported subset.
        let data = [0x0A, 0, 0, 0, 0];
        assert_eq!(decode(&data), Err(AmfError::UnsupportedMarker(0x0A)));
    }

    #[test]
    fn test_truncated_input() {
        assert_eq!(decode(&[MARKER_NUMBER, 1, 2]), Err(AmfError::UnexpectedEof));
        assert_eq!(
            decode(&[MARKER_STRING, 0x00, 0x05, b'a']),
            Err(AmfError::UnexpectedEof)
        );
        assert_eq!(decode(&[]), Err(AmfError::UnexpectedEof));
    }

    #[test]
    fn test_multiple_values() {
        let values = vec![
            AmfValue::String("connect".into()),
            AmfValue::Number(1.0),
            AmfValue::Null,
        ];

        let encoded = encode_all(&values);
        let decoded = decode_all(&encoded).unwrap();
        assert_eq!(decoded, values);
    }

    #[test]
    fn test_integer_inputs_decode_as_numbers() {
        // Integral inputs widen to doubles on the way in.
        let encoded = encode(&AmfValue::from(7u32));
        assert_eq!(decode(&encoded).unwrap(), AmfValue::Number(7.0));
    }
}
