//! Per-connection protocol state
//!
//! Tracks everything the session FSM needs between messages: the lifecycle
//! stage, the parsed connect URL, stream-id allocation, the acknowledgement
//! window, peer bandwidth, and the playback flags toggled by `pause` /
//! `receiveAudio` / `receiveVideo`.

use std::net::SocketAddr;

use url::Url;

use crate::protocol::constants::DEFAULT_WINDOW_ACK_SIZE;

/// Lifecycle stage of a server-side session.
///
/// The handshake runs before the message loop, so the earliest stage a
/// message can observe is `AwaitConnect`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStage {
    /// Handshake done, `connect` not yet received
    AwaitConnect,
    /// `connect` accepted; streams may be created
    Ready,
    /// Session is the publisher of a stream
    Publishing,
    /// Session is a subscriber of a stream
    Playing,
    /// Session is shutting down
    Closed,
}

/// Mutable per-connection state
#[derive(Debug)]
pub struct SessionState {
    /// Unique session id
    pub id: u64,

    /// Remote peer address
    pub peer_addr: SocketAddr,

    /// Current lifecycle stage
    pub stage: SessionStage,

    /// Parsed tcUrl from the connect command
    pub connect_url: Option<Url>,

    /// Window after which received message bytes are acknowledged
    pub window_ack_size: u32,

    /// Peer bandwidth announced via Set Peer Bandwidth
    pub bandwidth: u32,

    /// Bandwidth limit type (0 hard, 1 soft, 2 dynamic)
    pub bandwidth_limit: u8,

    /// Whether audio frames are delivered during playback
    pub receive_audio: bool,

    /// Whether video frames are delivered during playback
    pub receive_video: bool,

    /// Playback paused via the pause command
    pub paused: bool,

    /// Last allocated message stream id
    next_stream_id: u32,

    /// Message bytes received since the last acknowledgement
    received_bytes: u32,
}

impl SessionState {
    /// Create state for a fresh connection
    pub fn new(id: u64, peer_addr: SocketAddr) -> Self {
        Self {
            id,
            peer_addr,
            stage: SessionStage::AwaitConnect,
            connect_url: None,
            window_ack_size: DEFAULT_WINDOW_ACK_SIZE,
            bandwidth: 0,
            bandwidth_limit: 0,
            receive_audio: true,
            receive_video: true,
            paused: false,
            next_stream_id: 0,
            received_bytes: 0,
        }
    }

    /// Path component of the connect URL, e.g. "/live"
    pub fn app_path(&self) -> &str {
        self.connect_url.as_ref().map(Url::path).unwrap_or("")
    }

    /// Allocate the next message stream id, monotonic from 1
    pub fn allocate_stream_id(&mut self) -> u32 {
        self.next_stream_id += 1;
        self.next_stream_id
    }

    /// Account for a completed message.
    ///
    /// Returns the sequence number to send in an Acknowledgement once the
    /// received-byte counter crosses the window, resetting the counter.
    pub fn add_message_bytes(&mut self, len: u32) -> Option<u32> {
        self.received_bytes = self.received_bytes.wrapping_add(len);
        if self.window_ack_size > 0 && self.received_bytes >= self.window_ack_size {
            let sequence = self.received_bytes;
            self.received_bytes = 0;
            Some(sequence)
        } else {
            None
        }
    }

    /// Record the connect command: URL stored, stage advances to Ready
    pub fn on_connect(&mut self, url: Url) {
        self.connect_url = Some(url);
        self.stage = SessionStage::Ready;
    }

    /// Stage transition for a successful publish
    pub fn begin_publishing(&mut self) {
        self.stage = SessionStage::Publishing;
    }

    /// Stage transition for a successful play
    pub fn begin_playing(&mut self) {
        self.stage = SessionStage::Playing;
    }

    /// Stage transition on disconnect
    pub fn close(&mut self) {
        self.stage = SessionStage::Closed;
    }
}
