//! A named live stream: GOP assembly and fan-out
//!
//! The publisher's session appends every audio/video frame to the current
//! GOP. A key frame closes the GOP: it is handed to the dispatcher through a
//! one-slot channel and a fresh GOP begins with the key frame. The
//! dispatcher clones the GOP to every subscriber's own one-slot channel with
//! a non-blocking send, so a slow subscriber misses whole GOPs and resumes
//! at a later key frame; the publisher never stalls.
//!
//! ```text
//!  [publisher session] --frames--> gop --key frame--> data_tx (cap 1)
//!                                                        |
//!                                                  [dispatcher task]
//!                                                   /     |      \
//!                                         try_send cap-1 channels per subscriber
//!                                               /         |        \
//!                                      [play loop A] [play loop B] [play loop C]
//! ```
//!
//! `Bytes` and `Arc` reference counting make the fan-out zero-copy: every
//! subscriber shares the same frame allocations, released when the last
//! reader drops its handle.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use tokio::sync::mpsc;

use crate::media;

/// Frame kind inside a GOP
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
    Audio,
    Video,
}

/// A single audio or video frame
#[derive(Debug, Clone)]
pub struct StreamData {
    pub kind: FrameKind,
    pub timestamp: u32,
    pub payload: Bytes,
}

impl StreamData {
    pub fn video(timestamp: u32, payload: Bytes) -> Self {
        Self {
            kind: FrameKind::Video,
            timestamp,
            payload,
        }
    }

    pub fn audio(timestamp: u32, payload: Bytes) -> Self {
        Self {
            kind: FrameKind::Audio,
            timestamp,
            payload,
        }
    }
}

/// A key-frame-prefixed run of frames, shared between subscribers
#[derive(Debug)]
pub struct StreamGop {
    pub frames: Vec<StreamData>,
}

/// Frames a new subscriber needs before its first GOP
#[derive(Debug, Clone, Default)]
pub struct Priming {
    /// Pre-serialized onMetaData payload
    pub metadata: Option<Bytes>,
    /// H.264 sequence header (sps/pps)
    pub avc_config: Option<StreamData>,
    /// AAC sequence header
    pub aac_config: Option<StreamData>,
}

#[derive(Debug)]
struct SubscriberEntry {
    id: u64,
    tx: mpsc::Sender<Arc<StreamGop>>,
}

#[derive(Debug)]
struct StreamInner {
    /// Hand-off to the dispatcher; None once the stream is invalidated
    data_tx: Option<mpsc::Sender<Arc<StreamGop>>>,
    metadata: Option<Bytes>,
    avc_config: Option<StreamData>,
    aac_config: Option<StreamData>,
    /// Frames since the last key frame
    gop: Vec<StreamData>,
    subscribers: Vec<SubscriberEntry>,
}

/// A named live channel with exactly one publisher and N subscribers
#[derive(Debug)]
pub struct Stream {
    name: String,
    valid: AtomicBool,
    inner: Mutex<StreamInner>,
}

impl Stream {
    /// Create a stream and spawn its dispatcher task
    pub fn new(name: impl Into<String>) -> Arc<Self> {
        let (data_tx, data_rx) = mpsc::channel(1);

        let stream = Arc::new(Self {
            name: name.into(),
            valid: AtomicBool::new(true),
            inner: Mutex::new(StreamInner {
                data_tx: Some(data_tx),
                metadata: None,
                avc_config: None,
                aac_config: None,
                gop: Vec::new(),
                subscribers: Vec::new(),
            }),
        });

        tokio::spawn(Self::dispatch(Arc::clone(&stream), data_rx));
        stream
    }

    /// Stream key this stream is registered under
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether the publisher is still feeding the stream
    pub fn is_valid(&self) -> bool {
        self.valid.load(Ordering::Acquire)
    }

    /// Dispatcher: pull closed GOPs and fan them out.
    ///
    /// The refcount of a GOP rises only for subscribers whose channel
    /// accepted it, and the increment happens under the subscriber-list lock
    /// so nobody can join between the fan-out and the count.
    async fn dispatch(stream: Arc<Stream>, mut data_rx: mpsc::Receiver<Arc<StreamGop>>) {
        while let Some(gop) = data_rx.recv().await {
            let inner = stream.inner.lock().unwrap();
            for sub in &inner.subscribers {
                // A full channel means the subscriber is still on an older
                // GOP; this one is dropped for them.
                if sub.tx.try_send(Arc::clone(&gop)).is_err() {
                    tracing::trace!(
                        stream = stream.name.as_str(),
                        subscriber = sub.id,
                        "Subscriber busy, GOP dropped"
                    );
                }
            }
        }

        // Publisher is gone. Dropping the senders wakes every play loop
        // with a closed channel.
        stream.inner.lock().unwrap().subscribers.clear();
        tracing::debug!(stream = stream.name.as_str(), "Dispatcher finished");
    }

    /// Ingest a video frame from the publisher.
    ///
    /// The first video frame is kept aside as the AVC sequence header; every
    /// later key frame closes the current GOP.
    pub fn push_video(&self, timestamp: u32, payload: Bytes) {
        let mut inner = self.inner.lock().unwrap();

        if inner.avc_config.is_none() {
            inner.avc_config = Some(StreamData::video(timestamp, payload));
            return;
        }

        if media::is_video_key_frame(&payload) {
            Self::rotate_gop(&mut inner);
        }
        inner.gop.push(StreamData::video(timestamp, payload));
    }

    /// Ingest an audio frame from the publisher.
    ///
    /// The first audio frame is kept aside as the AAC sequence header.
    pub fn push_audio(&self, timestamp: u32, payload: Bytes) {
        let mut inner = self.inner.lock().unwrap();

        if inner.aac_config.is_none() {
            inner.aac_config = Some(StreamData::audio(timestamp, payload));
            return;
        }

        inner.gop.push(StreamData::audio(timestamp, payload));
    }

    /// Hand the current GOP to the dispatcher without blocking; a full
    /// hand-off slot releases the GOP instead.
    fn rotate_gop(inner: &mut StreamInner) {
        if inner.gop.is_empty() {
            return;
        }
        let frames = std::mem::take(&mut inner.gop);
        if let Some(tx) = &inner.data_tx {
            let _ = tx.try_send(Arc::new(StreamGop { frames }));
        }
    }

    /// Store the pre-serialized onMetaData payload
    pub fn set_metadata(&self, payload: Bytes) {
        self.inner.lock().unwrap().metadata = Some(payload);
    }

    /// Register a subscriber: returns its GOP channel and the priming
    /// frames to send before the first GOP.
    pub fn subscribe(&self, id: u64) -> (mpsc::Receiver<Arc<StreamGop>>, Priming) {
        let (tx, rx) = mpsc::channel(1);
        let mut inner = self.inner.lock().unwrap();

        let priming = Priming {
            metadata: inner.metadata.clone(),
            avc_config: inner.avc_config.clone(),
            aac_config: inner.aac_config.clone(),
        };

        inner.subscribers.retain(|s| s.id != id);
        inner.subscribers.push(SubscriberEntry { id, tx });

        (rx, priming)
    }

    /// Remove a subscriber; its channel closes when the entry drops
    pub fn unsubscribe(&self, id: u64) {
        self.inner.lock().unwrap().subscribers.retain(|s| s.id != id);
    }

    /// Number of registered subscribers
    pub fn subscriber_count(&self) -> usize {
        self.inner.lock().unwrap().subscribers.len()
    }

    /// Publisher is gone: mark invalid and close the GOP channel so the
    /// dispatcher drains and every subscriber unblocks.
    pub fn invalidate(&self) {
        self.valid.store(false, Ordering::Release);
        let mut inner = self.inner.lock().unwrap();
        inner.data_tx = None;
        inner.gop.clear();
    }
}
