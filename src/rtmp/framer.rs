//! Thin adapter around `rml_rtmp`'s sans-I/O `Handshake` and `ServerSession`
//! state machines: owns the socket reads/writes, deadline handling, and
//! exposes exactly the operations a connection pipeline needs.

use crate::error::ConnError;
use crate::rtmp::url::{self, ParsedUrl};
use bytes::Bytes;
use rml_rtmp::handshake::{Handshake, HandshakeProcessResult, PeerType};
use rml_rtmp::sessions::{
    ServerSession, ServerSessionConfig, ServerSessionEvent, ServerSessionResult,
};
use rml_rtmp::time::RtmpTimestamp;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::time::timeout;

/// Shared handle to the underlying socket. A watcher task can lock this
/// and call `shutdown()` to unblock an in-flight read/write from another
/// task -- the framer library's advertised "close from any task is safe"
/// contract, translated to tokio's socket model.
pub type SharedSocket = Arc<Mutex<TcpStream>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketType {
    H264DecoderConfig,
    H264,
    AacSequenceHeader,
    Aac,
}

/// One FLV-style packet as exchanged with the RTMP peer.
#[derive(Debug, Clone)]
pub struct RtmpPacket {
    pub packet_type: PacketType,
    pub data: Bytes,
    /// DTS.
    pub time: Duration,
    /// PTS - DTS.
    pub ctime: Duration,
}

#[derive(Debug, Clone, Default)]
pub struct VideoTrack {
    pub sps: Bytes,
    pub pps: Bytes,
}

#[derive(Debug, Clone, Default)]
pub struct AudioTrack {
    pub clock_rate: u32,
}

#[derive(Debug, Clone, Default)]
pub struct TrackList {
    pub video: Option<VideoTrack>,
    pub audio: Option<AudioTrack>,
}

pub struct RtmpFramer {
    socket: SharedSocket,
    read_buf: [u8; 4096],
    session: Option<ServerSession>,
    msg_queue: VecDeque<ServerSessionResult>,
    is_publishing: bool,
    app_name: String,
    stream_key: String,
    read_deadline: Option<Instant>,
    write_deadline: Option<Instant>,
}

impl RtmpFramer {
    pub fn new(socket: SharedSocket) -> Self {
        Self {
            socket,
            read_buf: [0u8; 4096],
            session: None,
            msg_queue: VecDeque::new(),
            is_publishing: false,
            app_name: String::new(),
            stream_key: String::new(),
            read_deadline: None,
            write_deadline: None,
        }
    }

    pub fn set_read_deadline(&mut self, deadline: Option<Instant>) {
        self.read_deadline = deadline;
    }

    pub fn set_write_deadline(&mut self, deadline: Option<Instant>) {
        self.write_deadline = deadline;
    }

    pub fn is_publishing(&self) -> bool {
        self.is_publishing
    }

    pub fn url(&self) -> ParsedUrl {
        url::parse(&self.app_name, &self.stream_key)
    }

    /// Drives the RTMP handshake to completion (server side).
    pub async fn server_handshake(&mut self) -> Result<(), ConnError> {
        let mut handshake = Handshake::new(PeerType::Server);
        let start = handshake
            .generate_outbound_p0_and_p1()
            .map_err(|e| ConnError::Setup(format!("handshake: {e}")))?;
        self.write_all_with_deadline(&start).await?;

        loop {
            let n = self.read_with_deadline().await?;
            if n == 0 {
                return Err(ConnError::Setup("handshake: peer closed connection".into()));
            }
            match handshake
                .process_bytes(&self.read_buf[..n])
                .map_err(|e| ConnError::Setup(format!("handshake: {e}")))?
            {
                HandshakeProcessResult::InProgress { response_bytes } => {
                    if !response_bytes.is_empty() {
                        self.write_all_with_deadline(&response_bytes).await?;
                    }
                }
                HandshakeProcessResult::Completed { response_bytes, remaining_bytes } => {
                    if !response_bytes.is_empty() {
                        self.write_all_with_deadline(&response_bytes).await?;
                    }
                    let (session, results) = ServerSession::new(ServerSessionConfig::new())
                        .map_err(|e| ConnError::Setup(format!("session init: {e}")))?;
                    self.session = Some(session);
                    self.msg_queue.extend(results);
                    if !remaining_bytes.is_empty() {
                        self.feed_bytes(&remaining_bytes)?;
                    }
                    break;
                }
            }
        }
        Ok(())
    }

    fn session_mut(&mut self) -> &mut ServerSession {
        self.session.as_mut().expect("handshake must complete before session use")
    }

    fn feed_bytes(&mut self, bytes: &[u8]) -> Result<(), ConnError> {
        let results = self
            .session_mut()
            .handle_input(bytes)
            .map_err(|e| ConnError::Setup(format!("rtmp session: {e}")))?;
        self.msg_queue.extend(results);
        Ok(())
    }

    /// Pumps the message queue: writes outbound responses, runs event side
    /// effects, and returns the first incoming media packet it encounters
    /// (if any), leaving the rest queued for the next call.
    async fn drain_queue(&mut self) -> Result<Option<RtmpPacket>, ConnError> {
        while let Some(result) = self.msg_queue.pop_front() {
            match result {
                ServerSessionResult::OutboundResponse(packet) => {
                    self.write_all_with_deadline(&packet.bytes).await?;
                }
                ServerSessionResult::RaisedEvent(event) => {
                    if let Some(packet) = self.handle_event(event)? {
                        return Ok(Some(packet));
                    }
                }
                ServerSessionResult::UnhandleableMessageReceived(_) => {}
            }
        }
        Ok(None)
    }

    fn handle_event(&mut self, event: ServerSessionEvent) -> Result<Option<RtmpPacket>, ConnError> {
        match event {
            ServerSessionEvent::ConnectionRequested { request_id, .. } => {
                let actions = self
                    .session_mut()
                    .accept_request(request_id)
                    .map_err(|e| ConnError::Setup(format!("accept connection: {e}")))?;
                self.msg_queue.extend(actions);
            }
            ServerSessionEvent::PublishStreamRequested { request_id, app_name, stream_key, .. } => {
                self.app_name = app_name;
                self.stream_key = stream_key;
                self.is_publishing = true;
                let actions = self
                    .session_mut()
                    .accept_request(request_id)
                    .map_err(|e| ConnError::Setup(format!("accept publish: {e}")))?;
                self.msg_queue.extend(actions);
            }
            ServerSessionEvent::PlayStreamRequested { request_id, app_name, stream_key, .. } => {
                self.app_name = app_name;
                self.stream_key = stream_key;
                self.is_publishing = false;
                let actions = self
                    .session_mut()
                    .accept_request(request_id)
                    .map_err(|e| ConnError::Setup(format!("accept play: {e}")))?;
                self.msg_queue.extend(actions);
            }
            ServerSessionEvent::VideoDataReceived { data, timestamp, .. } => {
                return Ok(decode_video_tag(&data, timestamp));
            }
            ServerSessionEvent::AudioDataReceived { data, timestamp, .. } => {
                return Ok(decode_audio_tag(&data, timestamp));
            }
            _ => {}
        }
        Ok(None)
    }

    /// Reads media from the peer until one complete packet is available.
    pub async fn read_packet(&mut self) -> Result<RtmpPacket, ConnError> {
        loop {
            if let Some(packet) = self.drain_queue().await? {
                return Ok(packet);
            }
            let n = self.read_with_deadline().await?;
            if n == 0 {
                return Err(ConnError::Io(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    "peer closed connection",
                )));
            }
            let buf = self.read_buf[..n].to_vec();
            self.feed_bytes(&buf)?;
        }
    }

    /// Publisher-side track negotiation: consumes events until a video
    /// decoder config and/or audio sequence header have arrived (bounded
    /// by the caller's read deadline), then returns the negotiated tracks.
    pub async fn read_tracks(&mut self) -> Result<TrackList, ConnError> {
        let mut tracks = TrackList::default();
        let mut video_seen = false;
        let mut audio_seen = false;
        let deadline_budget = Instant::now() + Duration::from_secs(10);

        loop {
            if Instant::now() > deadline_budget {
                break;
            }
            let packet = match self.read_packet().await {
                Ok(p) => p,
                Err(ConnError::Io(_)) => break,
                Err(e) => return Err(e),
            };
            match packet.packet_type {
                PacketType::H264DecoderConfig => {
                    let (sps, pps) = crate::codec::h264::parse_decoder_config(&packet.data)?;
                    if let Some(existing) = &tracks.video {
                        if existing.sps != sps || existing.pps != pps {
                            return Err(ConnError::Setup("too many tracks".into()));
                        }
                    }
                    tracks.video = Some(VideoTrack { sps, pps });
                    video_seen = true;
                    if tracks.audio.is_some() || audio_seen {
                        break;
                    }
                }
                PacketType::AacSequenceHeader => {
                    let clock_rate = crate::codec::aac::parse_audio_specific_config(&packet.data)?;
                    if let Some(existing) = &tracks.audio {
                        if existing.clock_rate != clock_rate {
                            return Err(ConnError::Setup("too many tracks".into()));
                        }
                    }
                    tracks.audio = Some(AudioTrack { clock_rate });
                    audio_seen = true;
                    if tracks.video.is_some() || video_seen {
                        break;
                    }
                }
                PacketType::H264 | PacketType::Aac => {
                    // media arrived before a decoder config/sequence header
                    // was observed; nothing to anchor tracks on yet, keep
                    // waiting.
                }
            }
        }

        if tracks.video.is_none() && tracks.audio.is_none() {
            return Err(ConnError::Setup("no suitable tracks found while publishing".into()));
        }
        Ok(tracks)
    }

    /// Reader-side track announcement: sends an `onMetaData` message ahead
    /// of any media so the RTMP peer can configure its decoders.
    pub async fn write_tracks(&mut self, tracks: &TrackList) -> Result<(), ConnError> {
        use rml_rtmp::sessions::StreamMetadata;
        let metadata = StreamMetadata {
            video_width: None,
            video_height: None,
            video_codec_id: tracks.video.as_ref().map(|_| "avc1".to_string()),
            video_frame_rate: None,
            video_bitrate_kbps: None,
            audio_codec_id: tracks.audio.as_ref().map(|_| "mp4a".to_string()),
            audio_bitrate_kbps: None,
            audio_sample_rate: tracks.audio.as_ref().map(|a| a.clock_rate),
            audio_channels: tracks.audio.as_ref().map(|_| 2),
            audio_is_stereo: tracks.audio.as_ref().map(|_| true),
            encoder: Some("rtmp-conn-engine".to_string()),
        };
        let actions = self
            .session_mut()
            .send_metadata(self.stream_key.clone(), std::rc::Rc::new(metadata))
            .map_err(|e| ConnError::Setup(format!("send metadata: {e}")))?;
        self.msg_queue.extend(actions);
        self.drain_queue_no_media().await
    }

    pub async fn write_packet(&mut self, pkt: RtmpPacket) -> Result<(), ConnError> {
        let timestamp = RtmpTimestamp::new(pkt.time.as_millis() as u32);
        let actions = match pkt.packet_type {
            PacketType::H264DecoderConfig | PacketType::H264 => {
                let body = encode_video_tag(&pkt);
                self.session_mut()
                    .send_video_data(self.stream_key.clone(), body, timestamp, false)
                    .map_err(|e| ConnError::Setup(format!("send video: {e}")))?
            }
            PacketType::AacSequenceHeader | PacketType::Aac => {
                let body = encode_audio_tag(&pkt);
                self.session_mut()
                    .send_audio_data(self.stream_key.clone(), body, timestamp, false)
                    .map_err(|e| ConnError::Setup(format!("send audio: {e}")))?
            }
        };
        self.msg_queue.extend(actions);
        self.drain_queue_no_media().await
    }

    async fn drain_queue_no_media(&mut self) -> Result<(), ConnError> {
        if let Some(_unexpected_media) = self.drain_queue().await? {
            // Reader pipeline never expects inbound media on the write path;
            // drop it rather than losing outbound responses already sent.
        }
        Ok(())
    }

    async fn read_with_deadline(&mut self) -> Result<usize, ConnError> {
        let n = match self.read_deadline {
            Some(deadline) => {
                let remaining = deadline.saturating_duration_since(Instant::now());
                timeout(remaining, async {
                    let mut socket = self.socket.lock().await;
                    socket.read(&mut self.read_buf).await
                })
                .await
                .map_err(|_| {
                    ConnError::Io(std::io::Error::new(
                        std::io::ErrorKind::TimedOut,
                        "read deadline exceeded",
                    ))
                })??
            }
            None => {
                let mut socket = self.socket.lock().await;
                socket.read(&mut self.read_buf).await?
            }
        };
        Ok(n)
    }

    async fn write_all_with_deadline(&mut self, bytes: &[u8]) -> Result<(), ConnError> {
        match self.write_deadline {
            Some(deadline) => {
                let remaining = deadline.saturating_duration_since(Instant::now());
                timeout(remaining, async {
                    let mut socket = self.socket.lock().await;
                    socket.write_all(bytes).await
                })
                .await
                .map_err(|_| {
                    ConnError::Io(std::io::Error::new(std::io::ErrorKind::TimedOut, "write deadline exceeded"))
                })??
            }
            None => {
                let mut socket = self.socket.lock().await;
                socket.write_all(bytes).await?
            }
        };
        Ok(())
    }
}

fn decode_video_tag(data: &[u8], timestamp: RtmpTimestamp) -> Option<RtmpPacket> {
    if data.len() < 5 {
        return None;
    }
    let avc_packet_type = data[1];
    let composition_time =
        i32::from_be_bytes([0, data[2], data[3], data[4]]) << 8 >> 8; // sign-extend 24-bit
    let payload = Bytes::copy_from_slice(&data[5..]);
    let time = Duration::from_millis(timestamp.value as u64);
    let ctime = Duration::from_millis(composition_time.max(0) as u64);

    let packet_type = match avc_packet_type {
        0 => PacketType::H264DecoderConfig,
        1 => PacketType::H264,
        _ => return None,
    };
    Some(RtmpPacket { packet_type, data: payload, time, ctime })
}

fn decode_audio_tag(data: &[u8], timestamp: RtmpTimestamp) -> Option<RtmpPacket> {
    if data.len() < 2 {
        return None;
    }
    let aac_packet_type = data[1];
    let payload = Bytes::copy_from_slice(&data[2..]);
    let time = Duration::from_millis(timestamp.value as u64);

    let packet_type = match aac_packet_type {
        0 => PacketType::AacSequenceHeader,
        1 => PacketType::Aac,
        _ => return None,
    };
    Some(RtmpPacket { packet_type, data: payload, time, ctime: Duration::ZERO })
}

fn encode_video_tag(pkt: &RtmpPacket) -> Bytes {
    let mut body = Vec::with_capacity(5 + pkt.data.len());
    let avc_packet_type: u8 = match pkt.packet_type {
        PacketType::H264DecoderConfig => 0,
        _ => 1,
    };
    let frame_type: u8 = 1; // inter/keyframe distinction left to the player; both decode identically
    body.push((frame_type << 4) | 0x07); // codec id 7 = AVC
    body.push(avc_packet_type);
    let ctime_ms = pkt.ctime.as_millis() as i32;
    body.extend_from_slice(&ctime_ms.to_be_bytes()[1..]);
    body.extend_from_slice(&pkt.data);
    Bytes::from(body)
}

fn encode_audio_tag(pkt: &RtmpPacket) -> Bytes {
    let mut body = Vec::with_capacity(2 + pkt.data.len());
    body.push(0xAF); // AAC, 44kHz, 16-bit, stereo marker bits (informational only)
    let aac_packet_type: u8 = match pkt.packet_type {
        PacketType::AacSequenceHeader => 0,
        _ => 1, // AACPacketType::Raw
    };
    body.push(aac_packet_type);
    body.extend_from_slice(&pkt.data);
    Bytes::from(body)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn video_tag_round_trips_decoder_config() {
        let pkt = RtmpPacket {
            packet_type: PacketType::H264DecoderConfig,
            data: Bytes::from_static(&[0x01, 0x42, 0x00, 0x1e]),
            time: Duration::from_millis(0),
            ctime: Duration::ZERO,
        };
        let body = encode_video_tag(&pkt);
        let decoded = decode_video_tag(&body, RtmpTimestamp::new(0)).unwrap();
        assert_eq!(decoded.packet_type, PacketType::H264DecoderConfig);
        assert_eq!(decoded.data, pkt.data);
    }

    #[test]
    fn video_tag_round_trips_frame_with_composition_time() {
        let pkt = RtmpPacket {
            packet_type: PacketType::H264,
            data: Bytes::from_static(&[0, 0, 0, 3, 1, 2, 3]),
            time: Duration::from_millis(1000),
            ctime: Duration::from_millis(40),
        };
        let body = encode_video_tag(&pkt);
        let decoded = decode_video_tag(&body, RtmpTimestamp::new(1000)).unwrap();
        assert_eq!(decoded.packet_type, PacketType::H264);
        assert_eq!(decoded.data, pkt.data);
        assert_eq!(decoded.time, pkt.time);
        assert_eq!(decoded.ctime, pkt.ctime);
    }

    #[test]
    fn audio_tag_round_trips_sequence_header() {
        let pkt = RtmpPacket {
            packet_type: PacketType::AacSequenceHeader,
            data: Bytes::from_static(&[0x12, 0x10]),
            time: Duration::ZERO,
            ctime: Duration::ZERO,
        };
        let body = encode_audio_tag(&pkt);
        let decoded = decode_audio_tag(&body, RtmpTimestamp::new(0)).unwrap();
        assert_eq!(decoded.packet_type, PacketType::AacSequenceHeader);
        assert_eq!(decoded.data, pkt.data);
    }

    #[test]
    fn audio_tag_round_trips_raw_access_unit() {
        let pkt = RtmpPacket {
            packet_type: PacketType::Aac,
            data: Bytes::from_static(&[1, 2, 3, 4]),
            time: Duration::from_millis(21),
            ctime: Duration::ZERO,
        };
        let body = encode_audio_tag(&pkt);
        let decoded = decode_audio_tag(&body, RtmpTimestamp::new(21)).unwrap();
        assert_eq!(decoded.packet_type, PacketType::Aac);
        assert_eq!(decoded.data, pkt.data);
        assert_eq!(decoded.time, pkt.time);
    }

    #[test]
    fn decode_video_tag_rejects_truncated_data() {
        assert!(decode_video_tag(&[0u8; 2], RtmpTimestamp::new(0)).is_none());
    }

    #[test]
    fn decode_audio_tag_rejects_truncated_data() {
        assert!(decode_audio_tag(&[0u8; 1], RtmpTimestamp::new(0)).is_none());
    }
}
