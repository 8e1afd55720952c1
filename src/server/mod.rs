//! RTMP server implementation
//!
//! - TCP listener and accept loop
//! - Per-connection driver (handshake, commands, media)
//! - Server configuration

pub mod config;
pub mod connection;
pub mod listener;

pub use config::ServerConfig;
pub use connection::Connection;
pub use listener::RtmpServer;
