//! RTMP protocol constants
//!
//! Reference: Adobe RTMP Specification (December 2012)

/// RTMP wire protocol version (always 3)
pub const RTMP_VERSION: u8 = 3;

/// Default RTMP port
pub const RTMP_PORT: u16 = 1935;

/// Size of the C1/S1/C2/S2 handshake block (time + version + random)
pub const HANDSHAKE_SIZE: usize = 1536;

/// Random portion of a handshake block
pub const HANDSHAKE_RANDOM_SIZE: usize = HANDSHAKE_SIZE - 8;

/// Default chunk size before Set Chunk Size is negotiated
pub const DEFAULT_CHUNK_SIZE: u32 = 128;

/// Maximum chunk size a peer may set
pub const MAX_CHUNK_SIZE: u32 = 0xFFFFFF;

/// Maximum message size (sanity limit, matches the 24-bit length field)
pub const MAX_MESSAGE_SIZE: u32 = 0xFFFFFF;

/// Timestamp escape value: the 24-bit field carries this when the real
/// timestamp lives in the extended timestamp field
pub const EXTENDED_TIMESTAMP: u32 = 0xFFFFFF;

// ============================================================================
// Chunk Stream IDs (CSID)
// ============================================================================

/// Protocol control messages (Set Chunk Size, Abort, ...)
pub const CSID_PROTOCOL_CONTROL: u32 = 2;

/// Command messages (connect, createStream, ...)
pub const CSID_COMMAND: u32 = 3;

/// Video data sent to subscribers
pub const CSID_VIDEO: u32 = 4;

/// Audio data sent to subscribers
pub const CSID_AUDIO: u32 = 5;

// ============================================================================
// Message Type IDs
// ============================================================================

/// Set Chunk Size (1) - protocol control
pub const MSG_SET_CHUNK_SIZE: u8 = 1;

/// Abort Message (2) - protocol control
pub const MSG_ABORT: u8 = 2;

/// Acknowledgement (3) - protocol control
pub const MSG_ACKNOWLEDGEMENT: u8 = 3;

/// User Control Message (4)
pub const MSG_USER_CONTROL: u8 = 4;

/// Window Acknowledgement Size (5) - protocol control
pub const MSG_WINDOW_ACK_SIZE: u8 = 5;

/// Set Peer Bandwidth (6) - protocol control
pub const MSG_SET_PEER_BANDWIDTH: u8 = 6;

/// Audio Message (8)
pub const MSG_AUDIO: u8 = 8;

/// Video Message (9)
pub const MSG_VIDEO: u8 = 9;

/// AMF3 Data Message (15)
pub const MSG_DATA_AMF3: u8 = 15;

/// AMF3 Command Message (17)
pub const MSG_COMMAND_AMF3: u8 = 17;

/// AMF0 Data Message (18) - @setDataFrame, onMetaData
pub const MSG_DATA_AMF0: u8 = 18;

/// AMF0 Command Message (20) - connect, play, publish, ...
pub const MSG_COMMAND_AMF0: u8 = 20;

// ============================================================================
// User Control Event Types
// ============================================================================

/// Stream Begin - server sends when a stream becomes functional
pub const UC_STREAM_BEGIN: u16 = 0;

/// Stream EOF - server sends when playback ends
pub const UC_STREAM_EOF: u16 = 1;

/// Stream Dry - no more data available
pub const UC_STREAM_DRY: u16 = 2;

/// Set Buffer Length - client tells server its buffer size
pub const UC_SET_BUFFER_LENGTH: u16 = 3;

/// Stream Is Recorded
pub const UC_STREAM_IS_RECORDED: u16 = 4;

/// Ping Request - server pings client
pub const UC_PING_REQUEST: u16 = 6;

/// Ping Response - client responds to ping
pub const UC_PING_RESPONSE: u16 = 7;

// ============================================================================
// Peer Bandwidth Limit Types
// ============================================================================

/// Hard limit - peer should limit output to this bandwidth
pub const BANDWIDTH_LIMIT_HARD: u8 = 0;

/// Soft limit - peer can exceed if it has excess bandwidth
pub const BANDWIDTH_LIMIT_SOFT: u8 = 1;

/// Dynamic - hard or soft depending on prior state
pub const BANDWIDTH_LIMIT_DYNAMIC: u8 = 2;

// ============================================================================
// Command Names
// ============================================================================

pub const CMD_CONNECT: &str = "connect";
pub const CMD_CALL: &str = "call";
pub const CMD_CREATE_STREAM: &str = "createStream";
pub const CMD_DELETE_STREAM: &str = "deleteStream";
pub const CMD_CLOSE_STREAM: &str = "closeStream";
pub const CMD_RELEASE_STREAM: &str = "releaseStream";
pub const CMD_PLAY: &str = "play";
pub const CMD_PLAY2: &str = "play2";
pub const CMD_PUBLISH: &str = "publish";
pub const CMD_SEEK: &str = "seek";
pub const CMD_PAUSE: &str = "pause";
pub const CMD_RECEIVE_AUDIO: &str = "receiveAudio";
pub const CMD_RECEIVE_VIDEO: &str = "receiveVideo";
pub const CMD_FC_PUBLISH: &str = "FCPublish";

/// Server response commands
pub const CMD_RESULT: &str = "_result";
pub const CMD_ON_STATUS: &str = "onStatus";

/// Data message names
pub const CMD_SET_DATA_FRAME: &str = "@setDataFrame";
pub const CMD_ON_METADATA: &str = "onMetaData";
pub const CMD_SAMPLE_ACCESS: &str = "|RtmpSampleAccess";

/// Publish type accepted by the server
pub const PUBLISH_TYPE_LIVE: &str = "live";

// ============================================================================
// Status Codes
// ============================================================================

pub const NC_CONNECT_SUCCESS: &str = "NetConnection.Connect.Success";

pub const NS_PUBLISH_START: &str = "NetStream.Publish.Start";
pub const NS_PUBLISH_ERROR: &str = "NetStream.Publish.Error";
pub const NS_PLAY_START: &str = "NetStream.Play.Start";
pub const NS_PLAY_STOP: &str = "NetStream.Play.Stop";
pub const NS_PLAY_STREAM_NOT_FOUND: &str = "NetStream.Play.StreamNotFound";

// ============================================================================
// Default Server Settings
// ============================================================================

/// Default window acknowledgement size (512 KiB)
pub const DEFAULT_WINDOW_ACK_SIZE: u32 = 512 * 1024;

/// Default peer bandwidth (512 KiB)
pub const DEFAULT_BANDWIDTH: u32 = 512 * 1024;

/// Chunk size the server negotiates for its own writes (4 KiB)
pub const DEFAULT_SERVER_CHUNK_SIZE: u32 = 4 * 1024;

/// RTMP-level version integer the server reports in S1
pub const DEFAULT_SERVER_VERSION: u32 = 1381256528;
