//! RTMP message types and parsing
//!
//! Reassembled messages fall into three families:
//! - Protocol control messages (types 1-6): chunk/flow control, strict
//!   payload lengths
//! - Command and data messages (types 15/17/18/20): AMF-encoded; the AMF3
//!   type ids carry the same payload and are routed through the AMF0 parser
//! - Audio/video messages (types 8, 9): opaque media payloads
//!
//! Reference: RTMP Specification Section 5.4

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::amf::{Amf0Decoder, Amf0Encoder, AmfValue};
use crate::error::{Error, ProtocolError, Result};
use crate::protocol::chunk::RawMessage;
use crate::protocol::constants::*;

/// Parsed RTMP message
#[derive(Debug, Clone)]
pub enum RtmpMessage {
    /// Set Chunk Size (type 1)
    SetChunkSize(u32),

    /// Abort Message (type 2)
    Abort { csid: u32 },

    /// Acknowledgement (type 3)
    Acknowledgement { sequence: u32 },

    /// User Control Message (type 4)
    UserControl(UserControlEvent),

    /// Window Acknowledgement Size (type 5)
    WindowAckSize(u32),

    /// Set Peer Bandwidth (type 6)
    SetPeerBandwidth { size: u32, limit_type: u8 },

    /// Audio data (type 8)
    Audio { timestamp: u32, data: Bytes },

    /// Video data (type 9)
    Video { timestamp: u32, data: Bytes },

    /// AMF command (types 17 and 20)
    Command(Command),

    /// AMF data message (types 15 and 18)
    Data(DataMessage),
}

/// User Control event (message type 4)
#[derive(Debug, Clone)]
pub enum UserControlEvent {
    StreamBegin(u32),
    StreamEof(u32),
    StreamDry(u32),
    SetBufferLength { stream_id: u32, buffer_ms: u32 },
    StreamIsRecorded(u32),
    PingRequest(u32),
    PingResponse(u32),
    /// Unrecognized events are logged and ignored
    Unknown { event_type: u16, data: Bytes },
}

/// RTMP command (connect, publish, play, ...)
#[derive(Debug, Clone)]
pub struct Command {
    /// Command name
    pub name: String,
    /// Transaction id
    pub transaction_id: f64,
    /// Command object (null for most stream commands)
    pub command_object: AmfValue,
    /// Remaining arguments
    pub arguments: Vec<AmfValue>,
    /// Message stream id the command arrived on
    pub stream_id: u32,
}

/// Data message (@setDataFrame, onMetaData, ...)
#[derive(Debug, Clone)]
pub struct DataMessage {
    /// Handler name
    pub name: String,
    /// Data values following the name
    pub values: Vec<AmfValue>,
    /// Message stream id
    pub stream_id: u32,
}

impl RtmpMessage {
    /// Parse a reassembled message.
    ///
    /// Protocol control payload lengths are validated strictly; a mismatch
    /// is fatal for the connection.
    pub fn from_raw(raw: &RawMessage) -> Result<Self> {
        let mut payload = raw.payload.clone();

        match raw.type_id {
            MSG_SET_CHUNK_SIZE => {
                expect_control_len(raw.type_id, &payload, 4)?;
                Ok(RtmpMessage::SetChunkSize(payload.get_u32()))
            }

            MSG_ABORT => {
                expect_control_len(raw.type_id, &payload, 4)?;
                Ok(RtmpMessage::Abort {
                    csid: payload.get_u32(),
                })
            }

            MSG_ACKNOWLEDGEMENT => {
                expect_control_len(raw.type_id, &payload, 4)?;
                Ok(RtmpMessage::Acknowledgement {
                    sequence: payload.get_u32(),
                })
            }

            MSG_USER_CONTROL => parse_user_control(&mut payload),

            MSG_WINDOW_ACK_SIZE => {
                expect_control_len(raw.type_id, &payload, 4)?;
                Ok(RtmpMessage::WindowAckSize(payload.get_u32()))
            }

            MSG_SET_PEER_BANDWIDTH => {
                expect_control_len(raw.type_id, &payload, 5)?;
                let size = payload.get_u32();
                let limit_type = payload.get_u8();
                Ok(RtmpMessage::SetPeerBandwidth { size, limit_type })
            }

            MSG_AUDIO => Ok(RtmpMessage::Audio {
                timestamp: raw.timestamp,
                data: payload,
            }),

            MSG_VIDEO => Ok(RtmpMessage::Video {
                timestamp: raw.timestamp,
                data: payload,
            }),

            MSG_COMMAND_AMF0 | MSG_COMMAND_AMF3 => {
                if raw.type_id == MSG_COMMAND_AMF3 {
                    skip_amf3_marker(&mut payload);
                }
                let cmd = parse_command(&mut payload, raw.stream_id)?;
                Ok(RtmpMessage::Command(cmd))
            }

            MSG_DATA_AMF0 | MSG_DATA_AMF3 => {
                if raw.type_id == MSG_DATA_AMF3 {
                    skip_amf3_marker(&mut payload);
                }
                let data = parse_data(&mut payload, raw.stream_id)?;
                Ok(RtmpMessage::Data(data))
            }

            other => Err(ProtocolError::UnsupportedMessageType(other).into()),
        }
    }

    /// Encode to (message type id, payload)
    pub fn encode(&self) -> (u8, Bytes) {
        match self {
            RtmpMessage::SetChunkSize(size) => {
                let mut buf = BytesMut::with_capacity(4);
                buf.put_u32(*size);
                (MSG_SET_CHUNK_SIZE, buf.freeze())
            }

            RtmpMessage::Abort { csid } => {
                let mut buf = BytesMut::with_capacity(4);
                buf.put_u32(*csid);
                (MSG_ABORT, buf.freeze())
            }

            RtmpMessage::Acknowledgement { sequence } => {
                let mut buf = BytesMut::with_capacity(4);
                buf.put_u32(*sequence);
                (MSG_ACKNOWLEDGEMENT, buf.freeze())
            }

            RtmpMessage::WindowAckSize(size) => {
                let mut buf = BytesMut::with_capacity(4);
                buf.put_u32(*size);
                (MSG_WINDOW_ACK_SIZE, buf.freeze())
            }

            RtmpMessage::SetPeerBandwidth { size, limit_type } => {
                let mut buf = BytesMut::with_capacity(5);
                buf.put_u32(*size);
                buf.put_u8(*limit_type);
                (MSG_SET_PEER_BANDWIDTH, buf.freeze())
            }

            RtmpMessage::UserControl(event) => {
                let mut buf = BytesMut::with_capacity(10);
                match event {
                    UserControlEvent::StreamBegin(id) => {
                        buf.put_u16(UC_STREAM_BEGIN);
                        buf.put_u32(*id);
                    }
                    UserControlEvent::StreamEof(id) => {
                        buf.put_u16(UC_STREAM_EOF);
                        buf.put_u32(*id);
                    }
                    UserControlEvent::StreamDry(id) => {
                        buf.put_u16(UC_STREAM_DRY);
                        buf.put_u32(*id);
                    }
                    UserControlEvent::SetBufferLength {
                        stream_id,
                        buffer_ms,
                    } => {
                        buf.put_u16(UC_SET_BUFFER_LENGTH);
                        buf.put_u32(*stream_id);
                        buf.put_u32(*buffer_ms);
                    }
                    UserControlEvent::StreamIsRecorded(id) => {
                        buf.put_u16(UC_STREAM_IS_RECORDED);
                        buf.put_u32(*id);
                    }
                    UserControlEvent::PingRequest(ts) => {
                        buf.put_u16(UC_PING_REQUEST);
                        buf.put_u32(*ts);
                    }
                    UserControlEvent::PingResponse(ts) => {
                        buf.put_u16(UC_PING_RESPONSE);
                        buf.put_u32(*ts);
                    }
                    UserControlEvent::Unknown { event_type, data } => {
                        buf.put_u16(*event_type);
                        buf.put_slice(data);
                    }
                }
                (MSG_USER_CONTROL, buf.freeze())
            }

            RtmpMessage::Audio { data, .. } => (MSG_AUDIO, data.clone()),

            RtmpMessage::Video { data, .. } => (MSG_VIDEO, data.clone()),

            RtmpMessage::Command(cmd) => (MSG_COMMAND_AMF0, encode_command(cmd)),

            RtmpMessage::Data(data) => (MSG_DATA_AMF0, encode_data(data)),
        }
    }
}

/// Reject a control message whose payload is not exactly `expected` bytes
fn expect_control_len(type_id: u8, payload: &Bytes, expected: usize) -> Result<()> {
    if payload.len() != expected {
        return Err(ProtocolError::InvalidControlMessageLength {
            type_id,
            length: payload.len(),
        }
        .into());
    }
    Ok(())
}

/// Some AMF3-typed messages open with a spurious 0x00 before AMF0 data
fn skip_amf3_marker(payload: &mut Bytes) {
    if !payload.is_empty() && payload[0] == 0x00 {
        payload.advance(1);
    }
}

fn parse_user_control(payload: &mut Bytes) -> Result<RtmpMessage> {
    if payload.len() < 2 {
        return Err(ProtocolError::InvalidControlMessageLength {
            type_id: MSG_USER_CONTROL,
            length: payload.len(),
        }
        .into());
    }

    let event_type = payload.get_u16();
    let need = |payload: &Bytes, n: usize| -> Result<()> {
        if payload.len() < n {
            Err(ProtocolError::InvalidControlMessageLength {
                type_id: MSG_USER_CONTROL,
                length: payload.len() + 2,
            }
            .into())
        } else {
            Ok(())
        }
    };

    let event = match event_type {
        UC_STREAM_BEGIN => {
            need(payload, 4)?;
            UserControlEvent::StreamBegin(payload.get_u32())
        }
        UC_STREAM_EOF => {
            need(payload, 4)?;
            UserControlEvent::StreamEof(payload.get_u32())
        }
        UC_STREAM_DRY => {
            need(payload, 4)?;
            UserControlEvent::StreamDry(payload.get_u32())
        }
        UC_SET_BUFFER_LENGTH => {
            need(payload, 8)?;
            let stream_id = payload.get_u32();
            let buffer_ms = payload.get_u32();
            UserControlEvent::SetBufferLength {
                stream_id,
                buffer_ms,
            }
        }
        UC_STREAM_IS_RECORDED => {
            need(payload, 4)?;
            UserControlEvent::StreamIsRecorded(payload.get_u32())
        }
        UC_PING_REQUEST => {
            need(payload, 4)?;
            UserControlEvent::PingRequest(payload.get_u32())
        }
        UC_PING_RESPONSE => {
            need(payload, 4)?;
            UserControlEvent::PingResponse(payload.get_u32())
        }
        _ => UserControlEvent::Unknown {
            event_type,
            data: payload.clone(),
        },
    };

    Ok(RtmpMessage::UserControl(event))
}

/// Parse an AMF command: name, transaction id, command object, arguments
fn parse_command(payload: &mut Bytes, stream_id: u32) -> Result<Command> {
    let mut decoder = Amf0Decoder::new();

    let name = match decoder.decode(payload)? {
        AmfValue::String(s) => s,
        other => {
            return Err(Error::CommandParam {
                command: String::new(),
                field: "name",
                actual: other.type_name(),
            })
        }
    };

    let transaction_id = match decoder.decode(payload)? {
        AmfValue::Number(n) => n,
        other => {
            return Err(Error::CommandParam {
                command: name,
                field: "transactionID",
                actual: other.type_name(),
            })
        }
    };

    let command_object = if payload.has_remaining() {
        decoder.decode(payload)?
    } else {
        AmfValue::Null
    };

    let mut arguments = Vec::new();
    while payload.has_remaining() {
        arguments.push(decoder.decode(payload)?);
    }

    Ok(Command {
        name,
        transaction_id,
        command_object,
        arguments,
        stream_id,
    })
}

/// Parse an AMF data message: name, then values
fn parse_data(payload: &mut Bytes, stream_id: u32) -> Result<DataMessage> {
    let mut decoder = Amf0Decoder::new();

    let name = match decoder.decode(payload)? {
        AmfValue::String(s) => s,
        other => {
            return Err(Error::CommandParam {
                command: "data".into(),
                field: "name",
                actual: other.type_name(),
            })
        }
    };

    let mut values = Vec::new();
    while payload.has_remaining() {
        values.push(decoder.decode(payload)?);
    }

    Ok(DataMessage {
        name,
        values,
        stream_id,
    })
}

/// Encode a command to AMF0 bytes
fn encode_command(cmd: &Command) -> Bytes {
    let mut encoder = Amf0Encoder::new();
    encoder.encode(&AmfValue::String(cmd.name.clone()));
    encoder.encode(&AmfValue::Number(cmd.transaction_id));
    encoder.encode(&cmd.command_object);
    for arg in &cmd.arguments {
        encoder.encode(arg);
    }
    encoder.finish()
}

/// Encode a data message to AMF0 bytes
fn encode_data(data: &DataMessage) -> Bytes {
    let mut encoder = Amf0Encoder::new();
    encoder.encode(&AmfValue::String(data.name.clone()));
    for value in &data.values {
        encoder.encode(value);
    }
    encoder.finish()
}

impl Command {
    /// Create a `_result` response
    pub fn result(transaction_id: f64, properties: AmfValue, info: AmfValue) -> Self {
        Command {
            name: CMD_RESULT.to_string(),
            transaction_id,
            command_object: properties,
            arguments: vec![info],
            stream_id: 0,
        }
    }

    /// Create an `onStatus` notification
    pub fn on_status(stream_id: u32, level: &str, code: &str, description: Option<&str>) -> Self {
        let mut info = vec![
            ("level".to_string(), AmfValue::from(level)),
            ("code".to_string(), AmfValue::from(code)),
        ];
        if let Some(description) = description {
            info.push(("description".to_string(), AmfValue::from(description)));
        }

        Command {
            name: CMD_ON_STATUS.to_string(),
            transaction_id: 0.0,
            command_object: AmfValue::Null,
            arguments: vec![AmfValue::Object(info)],
            stream_id,
        }
    }

    /// Typed access to a positional argument, for command handlers
    pub fn arg(&self, index: usize) -> &AmfValue {
        static NULL: AmfValue = AmfValue::Null;
        self.arguments.get(index).unwrap_or(&NULL)
    }

    /// String argument at `index`, or a typed-parameter error
    pub fn string_arg(&self, index: usize, field: &'static str) -> Result<&str> {
        self.arg(index).as_str().ok_or_else(|| Error::CommandParam {
            command: self.name.clone(),
            field,
            actual: self.arg(index).type_name(),
        })
    }

    /// Boolean argument at `index`, or a typed-parameter error
    pub fn bool_arg(&self, index: usize, field: &'static str) -> Result<bool> {
        self.arg(index).as_bool().ok_or_else(|| Error::CommandParam {
            command: self.name.clone(),
            field,
            actual: self.arg(index).type_name(),
        })
    }
}
