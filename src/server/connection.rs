//! Per-connection RTMP driver
//!
//! Owns the lifecycle of one TCP connection:
//! 1. Handshake (simple or digest, chosen by the client)
//! 2. connect command and control negotiation
//! 3. createStream / publish / play and the stream commands
//! 4. Media ingest (publisher) or playback (subscriber)
//! 5. Disconnect cleanup
//!
//! The task multiplexes the socket read loop with the subscriber's GOP
//! channel; a publisher session only ever waits on the socket.

use std::net::SocketAddr;
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufReader, BufWriter};
use tokio::net::TcpStream;
use tokio::time::timeout;
use url::Url;

use crate::amf::AmfValue;
use crate::broadcast::{stream_key, Broadcast, BroadcastError, FrameKind, Stream, StreamData, StreamGop};
use crate::error::{Error, ProtocolError, Result};
use crate::media;
use crate::protocol::chunk::{ChunkDecoder, ChunkEncoder, RawMessage};
use crate::protocol::constants::*;
use crate::protocol::handshake::{Handshake, HandshakeRole};
use crate::protocol::message::{Command, DataMessage, RtmpMessage, UserControlEvent};
use crate::server::config::ServerConfig;
use crate::session::{SessionStage, SessionState};

/// Per-connection handler
pub struct Connection {
    /// Session state machine
    state: SessionState,

    /// TCP stream halves (buffered)
    reader: BufReader<tokio::io::ReadHalf<TcpStream>>,
    writer: BufWriter<tokio::io::WriteHalf<TcpStream>>,

    /// Bytes read from the socket, not yet decoded
    read_buf: BytesMut,

    /// Chunk codec
    decoder: ChunkDecoder,
    encoder: ChunkEncoder,

    /// Scratch buffer for outgoing chunks
    write_buf: BytesMut,

    /// Server configuration
    config: ServerConfig,

    /// Stream registry
    broadcast: Arc<Broadcast>,

    /// Stream this session publishes to
    publishing: Option<Arc<Stream>>,

    /// Stream this session plays
    playing: Option<Arc<Stream>>,

    /// GOP channel while playing
    gop_rx: Option<tokio::sync::mpsc::Receiver<Arc<StreamGop>>>,

    /// Message stream id playback frames are sent on
    playback_stream_id: u32,
}

impl Connection {
    /// Create a new connection handler
    pub fn new(
        session_id: u64,
        socket: TcpStream,
        peer_addr: SocketAddr,
        config: ServerConfig,
        broadcast: Arc<Broadcast>,
    ) -> Self {
        let (read_half, write_half) = tokio::io::split(socket);

        Self {
            state: SessionState::new(session_id, peer_addr),
            reader: BufReader::with_capacity(config.read_buffer_size, read_half),
            writer: BufWriter::with_capacity(config.write_buffer_size, write_half),
            read_buf: BytesMut::with_capacity(config.read_buffer_size),
            decoder: ChunkDecoder::new(),
            encoder: ChunkEncoder::new(),
            write_buf: BytesMut::with_capacity(config.write_buffer_size),
            config,
            broadcast,
            publishing: None,
            playing: None,
            gop_rx: None,
            playback_stream_id: 0,
        }
    }

    /// Run the connection to completion
    pub async fn run(&mut self) -> Result<()> {
        self.do_handshake().await?;

        let idle_timeout = self.config.idle_timeout;
        let result = loop {
            let mut gop_rx = self.gop_rx.take();

            let step = if let Some(ref mut rx) = gop_rx {
                tokio::select! {
                    biased;

                    gop = rx.recv() => {
                        self.gop_rx = gop_rx;
                        match gop {
                            Some(gop) => self.send_gop(&gop).await.map(|_| true),
                            None => {
                                // Publisher ended the stream.
                                if let Err(e) = self.notify_stream_ended().await {
                                    tracing::debug!(
                                        session_id = self.state.id,
                                        error = %e,
                                        "Error notifying stream end"
                                    );
                                }
                                Ok(false)
                            }
                        }
                    }

                    result = timeout(idle_timeout, self.read_and_process()) => {
                        self.gop_rx = gop_rx;
                        match result {
                            Ok(step) => step,
                            Err(_) => {
                                tracing::debug!(session_id = self.state.id, "Idle timeout");
                                Ok(false)
                            }
                        }
                    }
                }
            } else {
                self.gop_rx = gop_rx;
                match timeout(idle_timeout, self.read_and_process()).await {
                    Ok(step) => step,
                    Err(_) => {
                        tracing::debug!(session_id = self.state.id, "Idle timeout");
                        Ok(false)
                    }
                }
            };

            match step {
                Ok(true) => continue,
                Ok(false) => break Ok(()),
                Err(e) => break Err(e),
            }
        };

        self.cleanup().await;
        result
    }

    /// Release stream resources on disconnect
    async fn cleanup(&mut self) {
        self.state.close();

        if let Some(stream) = self.publishing.take() {
            self.broadcast.unpublish(stream.name()).await;
            tracing::debug!(
                session_id = self.state.id,
                stream = stream.name(),
                "Unpublished on disconnect"
            );
        }

        if let Some(stream) = self.playing.take() {
            stream.unsubscribe(self.state.id);
            tracing::debug!(
                session_id = self.state.id,
                stream = stream.name(),
                "Unsubscribed on disconnect"
            );
        }
    }

    /// Drive the handshake state machine over the socket
    async fn do_handshake(&mut self) -> Result<()> {
        let mut handshake = Handshake::new(HandshakeRole::Server, self.config.version);
        handshake.generate_initial();

        let connection_timeout = self.config.connection_timeout;
        timeout(connection_timeout, async {
            while !handshake.is_done() {
                let needed = handshake.bytes_needed();
                while self.read_buf.len() < needed {
                    let n = self.reader.read_buf(&mut self.read_buf).await?;
                    if n == 0 {
                        return Err(Error::ConnectionClosed);
                    }
                }

                if let Some(response) = handshake.process(&mut self.read_buf)? {
                    self.writer.write_all(&response).await?;
                    self.writer.flush().await?;
                }
            }
            Ok::<_, Error>(())
        })
        .await
        .map_err(|_| Error::Timeout)??;

        tracing::debug!(
            session_id = self.state.id,
            peer_version = handshake.peer_version(),
            "Handshake complete"
        );
        Ok(())
    }

    /// Read from the socket and process every complete message.
    ///
    /// Returns Ok(false) when the peer closed the connection.
    async fn read_and_process(&mut self) -> Result<bool> {
        // Data buffered during the handshake (the connect command usually
        // tailgates C2) is decoded before the first socket read.
        let buffered = self.decoder.decode_all(&mut self.read_buf)?;
        if !buffered.is_empty() {
            for raw in buffered {
                self.handle_raw(raw).await?;
            }
            return Ok(true);
        }

        let n = self.reader.read_buf(&mut self.read_buf).await?;
        if n == 0 {
            return Ok(false);
        }

        let messages = self.decoder.decode_all(&mut self.read_buf)?;
        for raw in messages {
            self.handle_raw(raw).await?;
        }

        Ok(true)
    }

    /// Dispatch one reassembled message
    async fn handle_raw(&mut self, raw: RawMessage) -> Result<()> {
        let ack = self.state.add_message_bytes(raw.payload.len() as u32);

        let message = RtmpMessage::from_raw(&raw)?;
        match message {
            RtmpMessage::SetChunkSize(size) => {
                tracing::debug!(session_id = self.state.id, size = size, "Peer set chunk size");
                self.decoder.set_chunk_size(size);
            }

            RtmpMessage::Abort { csid } => {
                self.decoder.abort(csid);
            }

            RtmpMessage::Acknowledgement { sequence } => {
                tracing::trace!(session_id = self.state.id, sequence = sequence, "Peer ack");
            }

            RtmpMessage::WindowAckSize(size) => {
                self.state.window_ack_size = size;
            }

            RtmpMessage::SetPeerBandwidth { size, limit_type } => {
                self.state.bandwidth = size;
                self.state.bandwidth_limit = limit_type;
            }

            RtmpMessage::UserControl(event) => {
                self.handle_user_control(event).await?;
            }

            RtmpMessage::Command(cmd) => {
                self.handle_command(cmd).await?;
            }

            RtmpMessage::Data(data) => {
                self.handle_data(data)?;
            }

            RtmpMessage::Audio { timestamp, data } => {
                if let Some(stream) = &self.publishing {
                    stream.push_audio(timestamp, data);
                }
            }

            RtmpMessage::Video { timestamp, data } => {
                if let Some(stream) = &self.publishing {
                    stream.push_video(timestamp, data);
                }
            }
        }

        if let Some(sequence) = ack {
            self.send_control(RtmpMessage::Acknowledgement { sequence })
                .await?;
        }

        Ok(())
    }

    /// Handle a user control event
    async fn handle_user_control(&mut self, event: UserControlEvent) -> Result<()> {
        match event {
            UserControlEvent::PingRequest(ts) => {
                self.send_user_control(UserControlEvent::PingResponse(ts))
                    .await?;
            }
            UserControlEvent::SetBufferLength { .. } => {}
            UserControlEvent::Unknown { event_type, .. } => {
                tracing::debug!(
                    session_id = self.state.id,
                    event_type = event_type,
                    "Unknown user control event"
                );
            }
            _ => {}
        }
        Ok(())
    }

    /// Dispatch a command by name
    async fn handle_command(&mut self, cmd: Command) -> Result<()> {
        tracing::debug!(session_id = self.state.id, command = cmd.name.as_str(), "Command");

        match cmd.name.as_str() {
            CMD_CONNECT => self.handle_connect(cmd).await,
            CMD_CREATE_STREAM => self.handle_create_stream(cmd).await,
            CMD_PUBLISH => self.handle_publish(cmd).await,
            CMD_PLAY => self.handle_play(cmd).await,
            CMD_PAUSE => self.handle_pause(cmd),
            CMD_RECEIVE_AUDIO => {
                self.state.receive_audio = cmd.bool_arg(0, "bool")?;
                Ok(())
            }
            CMD_RECEIVE_VIDEO => {
                self.state.receive_video = cmd.bool_arg(0, "bool")?;
                Ok(())
            }
            // Accepted without a reply.
            CMD_DELETE_STREAM | CMD_CLOSE_STREAM | CMD_RELEASE_STREAM | CMD_FC_PUBLISH
            | CMD_CALL | CMD_PLAY2 | CMD_SEEK => Ok(()),
            other => {
                tracing::trace!(session_id = self.state.id, command = other, "Unknown command");
                Ok(())
            }
        }
    }

    /// connect: store the URL, negotiate control values, reply _result
    async fn handle_connect(&mut self, cmd: Command) -> Result<()> {
        let tc_url = cmd
            .command_object
            .get_string("tcUrl")
            .ok_or_else(|| Error::CommandParam {
                command: cmd.name.clone(),
                field: "tcUrl",
                actual: cmd
                    .command_object
                    .get("tcUrl")
                    .map(AmfValue::type_name)
                    .unwrap_or("null"),
            })?;

        let url = Url::parse(tc_url)
            .map_err(|e| ProtocolError::InvalidCommand(format!("tcUrl: {}", e)))?;

        self.state.on_connect(url);

        self.send_control(RtmpMessage::WindowAckSize(self.config.window_ack_size))
            .await?;
        self.send_control(RtmpMessage::SetPeerBandwidth {
            size: self.config.bandwidth,
            limit_type: self.config.bandwidth_limit,
        })
        .await?;

        // Announce and adopt the server's write chunk size.
        self.send_control(RtmpMessage::SetChunkSize(self.config.chunk_size))
            .await?;
        self.encoder.set_chunk_size(self.config.chunk_size);

        let properties = AmfValue::Object(vec![
            ("fmsVer".to_string(), AmfValue::from(self.config.fms_ver.as_str())),
            ("capabilities".to_string(), AmfValue::from(13)),
        ]);
        let info = AmfValue::Object(vec![
            ("level".to_string(), AmfValue::from("status")),
            ("code".to_string(), AmfValue::from(NC_CONNECT_SUCCESS)),
            ("objectEncoding".to_string(), AmfValue::from(0)),
        ]);
        let result = Command::result(cmd.transaction_id, properties, info);
        self.send_command(0, &result).await?;

        tracing::info!(
            session_id = self.state.id,
            app = self.state.app_path(),
            "Connected"
        );
        Ok(())
    }

    /// createStream: allocate a message stream id
    async fn handle_create_stream(&mut self, cmd: Command) -> Result<()> {
        let stream_id = self.state.allocate_stream_id();

        let result = Command::result(
            cmd.transaction_id,
            AmfValue::Null,
            AmfValue::from(stream_id),
        );
        self.send_command(0, &result).await?;

        tracing::debug!(session_id = self.state.id, stream_id = stream_id, "Stream created");
        Ok(())
    }

    /// publish: claim the stream key and become the publisher
    async fn handle_publish(&mut self, cmd: Command) -> Result<()> {
        let name = cmd.string_arg(0, "publishingName")?.to_string();
        let publish_type = cmd.string_arg(1, "publishingType")?;

        if publish_type != PUBLISH_TYPE_LIVE {
            let status = Command::on_status(
                cmd.stream_id,
                "error",
                NS_PUBLISH_ERROR,
                Some("server only support live"),
            );
            return self.send_command(cmd.stream_id, &status).await;
        }

        let key = stream_key(self.state.app_path(), &name);
        match self.broadcast.publish(&key).await {
            Ok(stream) => {
                self.publishing = Some(stream);
                self.state.begin_publishing();

                self.send_user_control(UserControlEvent::StreamBegin(cmd.stream_id))
                    .await?;
                let status =
                    Command::on_status(cmd.stream_id, "status", NS_PUBLISH_START, None);
                self.send_command(cmd.stream_id, &status).await?;

                tracing::info!(
                    session_id = self.state.id,
                    stream = key.as_str(),
                    "Publishing started"
                );
                Ok(())
            }
            Err(BroadcastError::AlreadyPublishing(_)) => {
                let status = Command::on_status(
                    cmd.stream_id,
                    "error",
                    NS_PUBLISH_ERROR,
                    Some("other stream is publishing"),
                );
                self.send_command(cmd.stream_id, &status).await
            }
        }
    }

    /// play: subscribe to the stream and start the playback flow
    async fn handle_play(&mut self, cmd: Command) -> Result<()> {
        let name = cmd.string_arg(0, "streamName")?.to_string();

        let key = stream_key(self.state.app_path(), &name);
        let stream = match self.broadcast.lookup(&key).await {
            Some(stream) => stream,
            None => {
                tracing::debug!(
                    session_id = self.state.id,
                    stream = key.as_str(),
                    "Play on missing stream"
                );
                let status =
                    Command::on_status(cmd.stream_id, "error", NS_PLAY_STREAM_NOT_FOUND, None);
                return self.send_command(cmd.stream_id, &status).await;
            }
        };

        self.playback_stream_id = cmd.stream_id;

        self.send_user_control(UserControlEvent::StreamBegin(cmd.stream_id))
            .await?;
        let status = Command::on_status(cmd.stream_id, "status", NS_PLAY_START, None);
        self.send_command(cmd.stream_id, &status).await?;

        let access = DataMessage {
            name: CMD_SAMPLE_ACCESS.to_string(),
            values: vec![AmfValue::Boolean(true), AmfValue::Boolean(true)],
            stream_id: cmd.stream_id,
        };
        self.send_message(CSID_COMMAND, cmd.stream_id, 0, &RtmpMessage::Data(access))
            .await?;

        let (rx, priming) = stream.subscribe(self.state.id);

        // Metadata and codec configs before the first GOP.
        if let Some(metadata) = priming.metadata {
            self.send_data_payload(cmd.stream_id, metadata).await?;
        }
        if let Some(config) = priming.avc_config {
            self.send_frame(&config).await?;
        }
        if let Some(config) = priming.aac_config {
            self.send_frame(&config).await?;
        }
        self.writer.flush().await?;

        self.gop_rx = Some(rx);
        self.playing = Some(stream);
        self.state.begin_playing();

        tracing::info!(session_id = self.state.id, stream = key.as_str(), "Playing started");
        Ok(())
    }

    /// pause: set the playback pause flag
    fn handle_pause(&mut self, cmd: Command) -> Result<()> {
        self.state.paused = cmd.bool_arg(0, "pause")?;
        Ok(())
    }

    /// Metadata (@setDataFrame / onMetaData): validate codecs, cache the
    /// serialized form on the published stream
    fn handle_data(&mut self, data: DataMessage) -> Result<()> {
        let metadata = match data.name.as_str() {
            CMD_SET_DATA_FRAME => {
                if data.values.first().and_then(AmfValue::as_str) != Some(CMD_ON_METADATA) {
                    return Ok(());
                }
                match data.values.get(1) {
                    Some(value) => value.clone(),
                    None => return Ok(()),
                }
            }
            CMD_ON_METADATA => match data.values.first() {
                Some(value) => value.clone(),
                None => return Ok(()),
            },
            other => {
                tracing::trace!(session_id = self.state.id, name = other, "Data message");
                return Ok(());
            }
        };

        // H.264 + AAC only.
        if let Some(codec) = metadata.get_number("videocodecid") {
            if codec as u32 != media::VIDEO_CODEC_H264 {
                return Err(ProtocolError::UnsupportedCodec {
                    field: "videocodecid",
                    id: codec as u32,
                }
                .into());
            }
        }
        if let Some(codec) = metadata.get_number("audiocodecid") {
            if codec as u32 != media::AUDIO_CODEC_AAC {
                return Err(ProtocolError::UnsupportedCodec {
                    field: "audiocodecid",
                    id: codec as u32,
                }
                .into());
            }
        }

        if let Some(stream) = &self.publishing {
            let serialized = RtmpMessage::Data(DataMessage {
                name: CMD_ON_METADATA.to_string(),
                values: vec![metadata],
                stream_id: 0,
            })
            .encode()
            .1;
            stream.set_metadata(serialized);
        }

        Ok(())
    }

    /// Forward one GOP to the peer, honoring pause and the receive flags
    async fn send_gop(&mut self, gop: &StreamGop) -> Result<()> {
        for frame in &gop.frames {
            if self.state.paused {
                continue;
            }
            match frame.kind {
                FrameKind::Video if !self.state.receive_video => continue,
                FrameKind::Audio if !self.state.receive_audio => continue,
                _ => {}
            }
            self.send_frame(frame).await?;
        }
        self.writer.flush().await?;
        Ok(())
    }

    /// Tell a subscriber the stream is over
    async fn notify_stream_ended(&mut self) -> Result<()> {
        let stream_id = self.playback_stream_id;
        self.send_user_control(UserControlEvent::StreamEof(stream_id))
            .await?;
        let status = Command::on_status(stream_id, "status", NS_PLAY_STOP, Some("Stream ended"));
        self.send_command(stream_id, &status).await?;

        tracing::info!(
            session_id = self.state.id,
            stream_id = stream_id,
            "Stream ended, subscriber notified"
        );
        Ok(())
    }

    // === Message sending helpers ===

    async fn send_message(
        &mut self,
        csid: u32,
        stream_id: u32,
        timestamp: u32,
        msg: &RtmpMessage,
    ) -> Result<()> {
        let (type_id, payload) = msg.encode();
        let raw = RawMessage {
            csid,
            timestamp,
            type_id,
            stream_id,
            payload,
        };

        self.write_buf.clear();
        self.encoder.encode(&raw, &mut self.write_buf);
        self.writer.write_all(&self.write_buf).await?;
        self.writer.flush().await?;
        Ok(())
    }

    /// Protocol control message: csid 2, stream id 0
    async fn send_control(&mut self, msg: RtmpMessage) -> Result<()> {
        self.send_message(CSID_PROTOCOL_CONTROL, 0, 0, &msg).await
    }

    async fn send_user_control(&mut self, event: UserControlEvent) -> Result<()> {
        self.send_control(RtmpMessage::UserControl(event)).await
    }

    async fn send_command(&mut self, stream_id: u32, cmd: &Command) -> Result<()> {
        self.send_message(
            CSID_COMMAND,
            stream_id,
            0,
            &RtmpMessage::Command(cmd.clone()),
        )
        .await
    }

    /// Pre-serialized AMF0 data message (cached onMetaData)
    async fn send_data_payload(&mut self, stream_id: u32, payload: Bytes) -> Result<()> {
        let raw = RawMessage {
            csid: CSID_COMMAND,
            timestamp: 0,
            type_id: MSG_DATA_AMF0,
            stream_id,
            payload,
        };

        self.write_buf.clear();
        self.encoder.encode(&raw, &mut self.write_buf);
        self.writer.write_all(&self.write_buf).await?;
        Ok(())
    }

    /// Queue one media frame; the caller flushes
    async fn send_frame(&mut self, frame: &StreamData) -> Result<()> {
        let (csid, type_id) = match frame.kind {
            FrameKind::Video => (CSID_VIDEO, MSG_VIDEO),
            FrameKind::Audio => (CSID_AUDIO, MSG_AUDIO),
        };

        let raw = RawMessage {
            csid,
            timestamp: frame.timestamp,
            type_id,
            stream_id: self.playback_stream_id,
            payload: frame.payload.clone(),
        };

        self.write_buf.clear();
        self.encoder.encode(&raw, &mut self.write_buf);
        self.writer.write_all(&self.write_buf).await?;
        Ok(())
    }

    /// Current lifecycle stage, for tests and introspection
    pub fn stage(&self) -> SessionStage {
        self.state.stage
    }
}
