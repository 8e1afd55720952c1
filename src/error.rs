//! Unified error types for rtmp-live

use std::fmt;
use std::io;

/// Result type alias using the library's Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Unified error type for all RTMP operations
#[derive(Debug)]
pub enum Error {
    /// I/O error during network operations
    Io(io::Error),
    /// AMF0 encoding/decoding error
    Amf(AmfError),
    /// RTMP protocol violation
    Protocol(ProtocolError),
    /// Handshake failure
    Handshake(HandshakeError),
    /// AMF command parameter of the wrong type
    CommandParam {
        command: String,
        field: &'static str,
        actual: &'static str,
    },
    /// Connection was closed by the peer
    ConnectionClosed,
    /// Operation timed out
    Timeout,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Io(e) => write!(f, "I/O error: {}", e),
            Error::Amf(e) => write!(f, "AMF error: {}", e),
            Error::Protocol(e) => write!(f, "Protocol error: {}", e),
            Error::Handshake(e) => write!(f, "Handshake error: {}", e),
            Error::CommandParam {
                command,
                field,
                actual,
            } => write!(
                f,
                "Command '{}': field '{}' has invalid type '{}'",
                command, field, actual
            ),
            Error::ConnectionClosed => write!(f, "Connection closed"),
            Error::Timeout => write!(f, "Operation timed out"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        Error::Io(err)
    }
}

impl From<AmfError> for Error {
    fn from(err: AmfError) -> Self {
        Error::Amf(err)
    }
}

impl From<ProtocolError> for Error {
    fn from(err: ProtocolError) -> Self {
        Error::Protocol(err)
    }
}

impl From<HandshakeError> for Error {
    fn from(err: HandshakeError) -> Self {
        Error::Handshake(err)
    }
}

/// AMF0 encoding/decoding errors
#[derive(Debug, PartialEq)]
pub enum AmfError {
    /// Marker byte outside the supported AMF0 subset
    UnsupportedMarker(u8),
    /// Empty property key inside an object
    EmptyKey,
    /// Buffer ended in the middle of a value
    UnexpectedEof,
    /// String payload is not valid UTF-8
    InvalidUtf8,
    /// Objects nested beyond the decoder's depth limit
    NestingTooDeep,
}

impl fmt::Display for AmfError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AmfError::UnsupportedMarker(m) => write!(f, "Unsupported AMF marker: 0x{:02x}", m),
            AmfError::EmptyKey => write!(f, "Empty AMF object key"),
            AmfError::UnexpectedEof => write!(f, "Unexpected end of AMF data"),
            AmfError::InvalidUtf8 => write!(f, "Invalid UTF-8 in AMF string"),
            AmfError::NestingTooDeep => write!(f, "AMF nesting too deep"),
        }
    }
}

impl std::error::Error for AmfError {}

/// Protocol-level errors
#[derive(Debug, PartialEq)]
pub enum ProtocolError {
    /// Malformed chunk header
    InvalidChunkHeader,
    /// Message type id outside the supported set
    UnsupportedMessageType(u8),
    /// Protocol control message payload of the wrong size
    InvalidControlMessageLength { type_id: u8, length: usize },
    /// Stream declares a codec other than H.264/AAC
    UnsupportedCodec { field: &'static str, id: u32 },
    /// Command carried data the server cannot act on
    InvalidCommand(String),
}

impl fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProtocolError::InvalidChunkHeader => write!(f, "Invalid chunk header"),
            ProtocolError::UnsupportedMessageType(t) => {
                write!(f, "Unsupported message type: {}", t)
            }
            ProtocolError::InvalidControlMessageLength { type_id, length } => write!(
                f,
                "Control message type {} has invalid length {}",
                type_id, length
            ),
            ProtocolError::UnsupportedCodec { field, id } => {
                write!(f, "Unsupported codec: {} = {}", field, id)
            }
            ProtocolError::InvalidCommand(msg) => write!(f, "Invalid command: {}", msg),
        }
    }
}

impl std::error::Error for ProtocolError {}

/// Handshake-specific errors. All of them are fatal for the connection.
#[derive(Debug, PartialEq)]
pub enum HandshakeError {
    /// C0/S0 protocol version byte other than 3
    InvalidProtocolVersion(u8),
    /// C1 digest did not verify under either schema
    DigestC1Failed,
    /// C2 trailing digest mismatch
    DigestC2Failed,
    /// S1 digest did not verify under either schema
    DigestS1Failed,
    /// S2 trailing digest mismatch
    DigestS2Failed,
    /// Simple-mode echo carried the wrong time1
    TimeEchoMismatch {
        which: &'static str,
        expected: u32,
        actual: u32,
    },
    /// Simple-mode echo diverged from the sent random block
    RandomEchoMismatch { which: &'static str, index: usize },
}

impl fmt::Display for HandshakeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HandshakeError::InvalidProtocolVersion(v) => {
                write!(f, "Invalid RTMP protocol version: {}", v)
            }
            HandshakeError::DigestC1Failed => write!(f, "C1 digest verification failed"),
            HandshakeError::DigestC2Failed => write!(f, "C2 digest verification failed"),
            HandshakeError::DigestS1Failed => write!(f, "S1 digest verification failed"),
            HandshakeError::DigestS2Failed => write!(f, "S2 digest verification failed"),
            HandshakeError::TimeEchoMismatch {
                which,
                expected,
                actual,
            } => write!(
                f,
                "{} time echo mismatch: expected {}, got {}",
                which, expected, actual
            ),
            HandshakeError::RandomEchoMismatch { which, index } => {
                write!(f, "{} random echo mismatch at byte {}", which, index)
            }
        }
    }
}

impl std::error::Error for HandshakeError {}

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error as StdError;

    #[test]
    fn test_error_display() {
        let io_err = io::Error::new(io::ErrorKind::ConnectionReset, "connection reset");
        let err = Error::Io(io_err);
        assert!(err.to_string().contains("I/O error"));

        let err = Error::Amf(AmfError::UnsupportedMarker(0xFF));
        assert!(err.to_string().contains("0xff"));

        let err = Error::Protocol(ProtocolError::InvalidControlMessageLength {
            type_id: 5,
            length: 3,
        });
        assert!(err.to_string().contains("5"));
        assert!(err.to_string().contains("3"));

        let err = Error::Handshake(HandshakeError::InvalidProtocolVersion(6));
        assert!(err.to_string().contains("6"));

        let err = Error::CommandParam {
            command: "publish".into(),
            field: "publishingType",
            actual: "number",
        };
        assert!(err.to_string().contains("publish"));
        assert!(err.to_string().contains("publishingType"));

        assert!(Error::ConnectionClosed.to_string().contains("closed"));
        assert!(Error::Timeout.to_string().contains("timed out"));
    }

    #[test]
    fn test_error_source() {
        let io_err = io::Error::new(io::ErrorKind::NotFound, "gone");
        let err = Error::Io(io_err);
        assert!(StdError::source(&err).is_some());

        let err = Error::Protocol(ProtocolError::InvalidChunkHeader);
        assert!(StdError::source(&err).is_none());
    }

    #[test]
    fn test_from_conversions() {
        let err: Error = AmfError::EmptyKey.into();
        assert!(matches!(err, Error::Amf(AmfError::EmptyKey)));

        let err: Error = ProtocolError::UnsupportedMessageType(99).into();
        assert!(matches!(err, Error::Protocol(_)));

        let err: Error = HandshakeError::DigestC1Failed.into();
        assert!(matches!(err, Error::Handshake(_)));

        let io_err = io::Error::new(io::ErrorKind::TimedOut, "timeout");
        let err: Error = io_err.into();
        assert!(matches!(err, Error::Io(_)));
    }

    #[test]
    fn test_handshake_error_display() {
        let err = HandshakeError::TimeEchoMismatch {
            which: "C2",
            expected: 1000,
            actual: 999,
        };
        assert!(err.to_string().contains("C2"));
        assert!(err.to_string().contains("1000"));

        let err = HandshakeError::RandomEchoMismatch {
            which: "S2",
            index: 42,
        };
        assert!(err.to_string().contains("42"));
    }
}
