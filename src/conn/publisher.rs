//! Publisher (record) pipeline: reads RTMP packets from the peer, re-encodes
//! them into RTP, and publishes `Data` items onto the path's fan-out stream.

use crate::auth::{Action, AuthRequest, CRITICAL_AUTH_DELAY};
use crate::codec::{aac, h264};
use crate::conn::{ConnState, Connection, RemovalGuard};
use crate::data::Data;
use crate::error::ConnError;
use crate::path::{Path, PathManager};
use crate::rtmp::framer::{PacketType, RtmpFramer};
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;

const H264_PAYLOAD_TYPE: u8 = 96;
const AAC_PAYLOAD_TYPE: u8 = 97;

pub async fn run(
    conn: Arc<Connection>,
    mut framer: RtmpFramer,
    path_manager: Arc<PathManager>,
    cancel: CancellationToken,
) -> Result<(), ConnError> {
    framer.set_read_deadline(Some(Instant::now() + conn.settings.read_timeout));
    let tracks = tokio::select! {
        res = framer.read_tracks() => res?,
        _ = cancel.cancelled() => return Err(ConnError::Terminated),
    };

    let video_track_id: Option<usize> = tracks.video.as_ref().map(|_| 0);
    let audio_track_id: Option<usize> =
        tracks.audio.as_ref().map(|_| if tracks.video.is_some() { 1 } else { 0 });

    let url = framer.url();
    let req = AuthRequest {
        path_name: url.path_name.clone(),
        action: Action::Publish,
        remote_ip: conn.remote_addr().ip(),
        query_user: url.query.get("user").cloned().unwrap_or_default(),
        query_pass: url.query.get("pass").cloned().unwrap_or_default(),
        raw_query: url.raw_query.clone(),
    };

    let path = match path_manager.on_publisher_announce(conn.id(), &req).await {
        Ok(path) => path,
        Err(ConnError::AuthCritical(msg)) => {
            tokio::time::sleep(CRITICAL_AUTH_DELAY).await;
            return Err(ConnError::AuthCritical(msg));
        }
        Err(e) => return Err(e),
    };

    conn.transition(ConnState::Publish);
    conn.set_path(path.clone());
    let _removal = RemovalGuard::for_publisher(path_manager.clone(), path.clone(), conn.id().to_string());

    // Publisher never writes media back to the peer.
    framer.set_write_deadline(None);

    path_manager.on_publisher_record(&path, tracks.clone()).await?;

    let mut video_seq: u16 = 0;
    let video_ssrc = ssrc_for("video", conn.id());
    let mut audio_encoder =
        tracks.audio.as_ref().map(|a| aac::AacRtpEncoder::new(a.clock_rate, ssrc_for("audio", conn.id())));

    loop {
        framer.set_read_deadline(Some(Instant::now() + conn.settings.read_timeout));
        let pkt = tokio::select! {
            res = framer.read_packet() => res?,
            _ = cancel.cancelled() => return Err(ConnError::Terminated),
        };
        let pts = pkt.time + pkt.ctime;

        match pkt.packet_type {
            PacketType::H264DecoderConfig => {
                let Some(track_id) = video_track_id else {
                    return Err(ConnError::Codec("received H264 decoder config without a video track".into()));
                };
                let (sps, pps) = h264::parse_decoder_config(&pkt.data)?;
                let nalus = vec![sps, pps];
                let fragments = h264::fragment_to_rtp(&nalus, pts, video_ssrc, &mut video_seq, H264_PAYLOAD_TYPE)?;
                publish_video_fragments(&path, track_id, fragments, &nalus, pts);
            }
            PacketType::H264 => {
                let Some(track_id) = video_track_id else {
                    return Err(ConnError::Codec("received H264 frame without a video track".into()));
                };
                let nalus = h264::avcc_to_nalus(&pkt.data)?;
                let fragments = h264::fragment_to_rtp(&nalus, pts, video_ssrc, &mut video_seq, H264_PAYLOAD_TYPE)?;
                publish_video_fragments(&path, track_id, fragments, &nalus, pts);
            }
            PacketType::Aac => {
                let Some(track_id) = audio_track_id else {
                    return Err(ConnError::Codec("received AAC frame without an audio track".into()));
                };
                let encoder = audio_encoder.as_mut().expect("audio track implies an encoder");
                let rtp = encoder.encode_au(&pkt.data, pts, AAC_PAYLOAD_TYPE)?;
                path.publish(Data::Audio { track_id, rtp });
            }
            PacketType::AacSequenceHeader => {
                // The audio track's clock rate was already established from
                // this same packet type during `read_tracks`; a repeated
                // sequence header mid-stream carries nothing new for the bus.
            }
        }
    }
}

/// Publishes one access unit's RTP fragments, attaching the decoded NALUs
/// and PTS only to the last fragment in encoding order.
fn publish_video_fragments(
    path: &Arc<Path>,
    track_id: usize,
    fragments: Vec<bytes::Bytes>,
    nalus: &[bytes::Bytes],
    pts: std::time::Duration,
) {
    let total = fragments.len();
    for (i, rtp) in fragments.into_iter().enumerate() {
        let is_last = i + 1 == total;
        path.publish(Data::Video {
            track_id,
            rtp,
            last_fragment: is_last,
            nalus: is_last.then(|| nalus.to_vec()),
            pts: is_last.then_some(pts),
        });
    }
}

fn ssrc_for(label: &str, conn_id: &str) -> u32 {
    let mut hasher = DefaultHasher::new();
    label.hash(&mut hasher);
    conn_id.hash(&mut hasher);
    hasher.finish() as u32
}
