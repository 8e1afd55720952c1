//! rtmp-live: RTMP live-streaming server library
//!
//! This library implements the parts of RTMP a live relay needs:
//! - Chunk codec: bit-exact header encode/decode, timestamp-delta
//!   compression, extended timestamps, chunk-size fragmentation
//! - Handshake: simple (echo) and complex (HMAC-SHA256 digest) variants,
//!   both roles
//! - Session protocol machine: chunk reassembly, protocol control messages,
//!   AMF0 commands (connect/createStream/publish/play/pause/...)
//! - Broadcast engine: per-stream GOP buffering with non-blocking fan-out
//!   from one publisher to many subscribers
//!
//! Supported media is H.264 video and AAC audio, passed through untouched.
//!
//! # Example: running a server
//!
//! ```no_run
//! use rtmp_live::{RtmpServer, ServerConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = ServerConfig::default();
//!     let server = RtmpServer::new(config);
//!     server.run().await?;
//!     Ok(())
//! }
//! ```

pub mod amf;
pub mod broadcast;
pub mod error;
pub mod media;
pub mod protocol;
pub mod server;
pub mod session;

// Re-export main types for convenience
pub use broadcast::Broadcast;
pub use error::{Error, Result};
pub use server::{RtmpServer, ServerConfig};
