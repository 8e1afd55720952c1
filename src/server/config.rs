//! Server configuration

use std::net::SocketAddr;
use std::time::Duration;

use crate::protocol::constants::*;

/// Server configuration options
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: SocketAddr,

    /// Chunk size the server announces for its own writes
    pub chunk_size: u32,

    /// Window acknowledgement size announced on connect
    pub window_ack_size: u32,

    /// Peer bandwidth announced on connect
    pub bandwidth: u32,

    /// Bandwidth limit type (0 hard, 1 soft, 2 dynamic)
    pub bandwidth_limit: u8,

    /// Implementation version carried in the S1 handshake block
    pub version: u32,

    /// fmsVer string reported in the connect result
    pub fms_ver: String,

    /// Handshake must complete within this time
    pub connection_timeout: Duration,

    /// Disconnect when no data is received for this long
    pub idle_timeout: Duration,

    /// Application-level read buffer size
    pub read_buffer_size: usize,

    /// Application-level write buffer size
    pub write_buffer_size: usize,

    /// Enable TCP_NODELAY (disable Nagle's algorithm)
    pub tcp_nodelay: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:1935".parse().unwrap(),
            chunk_size: DEFAULT_SERVER_CHUNK_SIZE,
            window_ack_size: DEFAULT_WINDOW_ACK_SIZE,
            bandwidth: DEFAULT_BANDWIDTH,
            bandwidth_limit: BANDWIDTH_LIMIT_DYNAMIC,
            version: DEFAULT_SERVER_VERSION,
            fms_ver: "FMS/3,5,7,7009".to_string(),
            connection_timeout: Duration::from_secs(10),
            idle_timeout: Duration::from_secs(60),
            read_buffer_size: 64 * 1024,
            write_buffer_size: 64 * 1024,
            tcp_nodelay: true,
        }
    }
}

impl ServerConfig {
    /// Create a config with a custom bind address
    pub fn with_addr(addr: SocketAddr) -> Self {
        Self {
            bind_addr: addr,
            ..Default::default()
        }
    }

    /// Set the bind address
    pub fn bind(mut self, addr: SocketAddr) -> Self {
        self.bind_addr = addr;
        self
    }

    /// Set the server's write chunk size
    pub fn chunk_size(mut self, size: u32) -> Self {
        self.chunk_size = size.min(MAX_CHUNK_SIZE);
        self
    }

    /// Set the window acknowledgement size
    pub fn window_ack_size(mut self, size: u32) -> Self {
        self.window_ack_size = size;
        self
    }

    /// Set the announced peer bandwidth and limit type
    pub fn bandwidth(mut self, size: u32, limit: u8) -> Self {
        self.bandwidth = size;
        self.bandwidth_limit = limit;
        self
    }

    /// Set the handshake version integer
    pub fn version(mut self, version: u32) -> Self {
        self.version = version;
        self
    }

    /// Set the handshake timeout
    pub fn connection_timeout(mut self, timeout: Duration) -> Self {
        self.connection_timeout = timeout;
        self
    }

    /// Set the idle timeout
    pub fn idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = timeout;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ServerConfig::default();
        assert_eq!(config.bind_addr.port(), RTMP_PORT);
        assert_eq!(config.chunk_size, 4 * 1024);
        assert_eq!(config.window_ack_size, 512 * 1024);
        assert_eq!(config.bandwidth, 512 * 1024);
        assert_eq!(config.bandwidth_limit, BANDWIDTH_LIMIT_DYNAMIC);
    }

    #[test]
    fn test_builder_caps_chunk_size() {
        let config = ServerConfig::default().chunk_size(0x2000000);
        assert_eq!(config.chunk_size, MAX_CHUNK_SIZE);
    }
}
