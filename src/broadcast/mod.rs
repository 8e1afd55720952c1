//! Publish/play routing
//!
//! The [`Broadcast`] registry maps stream keys to live [`Stream`]s. A
//! publish claims a key (exactly one publisher per key at any time), a play
//! looks the key up and subscribes, and a publisher disconnect invalidates
//! the stream so subscribers drain.

pub mod stream;

pub use stream::{FrameKind, Priming, Stream, StreamData, StreamGop};

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use tokio::sync::RwLock;

/// Error type for registry operations
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BroadcastError {
    /// Another session is already publishing this stream key
    AlreadyPublishing(String),
}

impl fmt::Display for BroadcastError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BroadcastError::AlreadyPublishing(key) => {
                write!(f, "Stream already publishing: {}", key)
            }
        }
    }
}

impl std::error::Error for BroadcastError {}

/// Build the registry key for a stream: the connect URL path joined with
/// the publish/play stream name.
pub fn stream_key(path: &str, name: &str) -> String {
    let path = path.trim_end_matches('/');
    if name.is_empty() {
        path.to_string()
    } else {
        format!("{}/{}", path, name)
    }
}

/// Registry of named live streams.
///
/// Lookups on play take the read lock; publish registration and stream
/// deletion take the write lock.
pub struct Broadcast {
    streams: RwLock<HashMap<String, Arc<Stream>>>,
}

impl Broadcast {
    /// Create an empty registry
    pub fn new() -> Self {
        Self {
            streams: RwLock::new(HashMap::new()),
        }
    }

    /// Claim `key` for a new publisher.
    ///
    /// Fails when a valid stream already holds the key. A stream whose
    /// publisher is gone but which has not been cleaned up yet is replaced.
    pub async fn publish(&self, key: &str) -> Result<Arc<Stream>, BroadcastError> {
        let mut streams = self.streams.write().await;

        if let Some(existing) = streams.get(key) {
            if existing.is_valid() {
                return Err(BroadcastError::AlreadyPublishing(key.to_string()));
            }
        }

        let stream = Stream::new(key);
        streams.insert(key.to_string(), Arc::clone(&stream));

        tracing::info!(stream = key, "Publisher registered");
        Ok(stream)
    }

    /// Find the live stream registered under `key`
    pub async fn lookup(&self, key: &str) -> Option<Arc<Stream>> {
        let streams = self.streams.read().await;
        streams.get(key).filter(|s| s.is_valid()).cloned()
    }

    /// Remove `key` and invalidate its stream; subscribers drain on their
    /// next channel receive.
    pub async fn unpublish(&self, key: &str) {
        let stream = self.streams.write().await.remove(key);
        if let Some(stream) = stream {
            stream.invalidate();
            tracing::info!(stream = key, "Publisher unregistered");
        }
    }

    /// Number of registered streams
    pub async fn stream_count(&self) -> usize {
        self.streams.read().await.len()
    }
}

impl Default for Broadcast {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stream_key_joins_path_and_name() {
        assert_eq!(stream_key("/live", "x"), "/live/x");
        assert_eq!(stream_key("/live/", "x"), "/live/x");
        assert_eq!(stream_key("/live", ""), "/live");
    }

    #[tokio::test]
    async fn test_publish_conflict() {
        let broadcast = Broadcast::new();

        let _stream = broadcast.publish("/live/x").await.unwrap();

        // A second publisher on the same key is refused, the first stays up.
        let err = broadcast.publish("/live/x").await.unwrap_err();
        assert_eq!(err, BroadcastError::AlreadyPublishing("/live/x".into()));
        assert!(broadcast.lookup("/live/x").await.unwrap().is_valid());
    }

    #[tokio::test]
    async fn test_play_before_publish_finds_nothing() {
        let broadcast = Broadcast::new();
        assert!(broadcast.lookup("/live/x").await.is_none());
    }

    #[tokio::test]
    async fn test_unpublish_invalidates_and_frees_key() {
        let broadcast = Broadcast::new();

        let stream = broadcast.publish("/live/x").await.unwrap();
        broadcast.unpublish("/live/x").await;

        assert!(!stream.is_valid());
        assert!(broadcast.lookup("/live/x").await.is_none());
        assert_eq!(broadcast.stream_count().await, 0);

        // The key can be claimed again.
        assert!(broadcast.publish("/live/x").await.is_ok());
    }

    #[tokio::test]
    async fn test_independent_keys() {
        let broadcast = Broadcast::new();
        broadcast.publish("/live/x").await.unwrap();
        broadcast.publish("/live/y").await.unwrap();
        assert_eq!(broadcast.stream_count().await, 2);
    }
}
