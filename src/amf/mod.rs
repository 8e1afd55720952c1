//! AMF (Action Message Format) implementation
//!
//! AMF0 is Adobe's binary serialization used in RTMP for command parameters
//! and metadata. AMF3-typed messages (type ids 15/17) carry the same payload
//! for our purposes and are routed through the AMF0 parser.

pub mod amf0;
pub mod value;

pub use amf0::{Amf0Decoder, Amf0Encoder};
pub use value::{AmfProperties, AmfValue};
