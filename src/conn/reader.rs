//! Reader (play) pipeline: subscribes to a path's fan-out stream and
//! translates `Data` items back into RTMP packets written to the peer.

use crate::auth::{Action, AuthRequest, CRITICAL_AUTH_DELAY};
use crate::codec::{aac, h264};
use crate::conn::{ConnState, Connection, RemovalGuard};
use crate::data::Data;
use crate::error::ConnError;
use crate::path::PathManager;
use crate::proc::ChildCommand;
use crate::ringbuf::RingBuffer;
use crate::rtmp::framer::{PacketType, RtmpFramer, RtmpPacket};
use log::warn;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

pub async fn run(
    conn: Arc<Connection>,
    mut framer: RtmpFramer,
    path_manager: Arc<PathManager>,
    cancel: CancellationToken,
) -> Result<(), ConnError> {
    let url = framer.url();
    let req = AuthRequest {
        path_name: url.path_name.clone(),
        action: Action::Read,
        remote_ip: conn.remote_addr().ip(),
        query_user: url.query.get("user").cloned().unwrap_or_default(),
        query_pass: url.query.get("pass").cloned().unwrap_or_default(),
        raw_query: url.raw_query.clone(),
    };

    let (path, mut rx) = match path_manager.on_reader_setup_play(&req).await {
        Ok(ok) => ok,
        Err(ConnError::AuthCritical(msg)) => {
            tokio::time::sleep(CRITICAL_AUTH_DELAY).await;
            return Err(ConnError::AuthCritical(msg));
        }
        Err(e) => return Err(e),
    };

    conn.transition(ConnState::Read);
    conn.set_path(path.clone());
    let _removal = RemovalGuard::for_reader(path_manager.clone(), path.clone(), conn.id().to_string());

    let tracks = path.tracks().await.unwrap_or_default();
    if tracks.video.is_none() && tracks.audio.is_none() {
        return Err(ConnError::Setup("path has no tracks to read".into()));
    }
    let video_track_id: Option<usize> = tracks.video.as_ref().map(|_| 0);
    let audio_track_id: Option<usize> =
        tracks.audio.as_ref().map(|_| if tracks.video.is_some() { 1 } else { 0 });
    let audio_clock_rate = tracks.audio.as_ref().map(|a| a.clock_rate);
    let mut aac_decoder = tracks.audio.as_ref().map(|a| aac::AacRtpDecoder::new(a.clock_rate));

    framer.set_write_deadline(Some(Instant::now() + conn.settings.write_timeout));
    framer.write_tracks(&tracks).await?;

    let ring = Arc::new(RingBuffer::new(conn.settings.read_buffer_count));
    conn.set_ring(ring.clone());

    let subscriber = {
        let ring = ring.clone();
        let sub_cancel = cancel.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = sub_cancel.cancelled() => break,
                    res = rx.recv() => match res {
                        Ok(item) => ring.push(item),
                        Err(broadcast::error::RecvError::Lagged(_)) => continue,
                        Err(broadcast::error::RecvError::Closed) => break,
                    },
                }
            }
            ring.close();
        })
    };

    path_manager.on_reader_play(&path, conn.id()).await;

    // spec.md §6: `runOnRead` gets the path's environment (its name) plus
    // the same standard variables `runOnConnect` receives.
    let mut child_command = path.run_on_read.clone().map(|cmd| {
        ChildCommand::new(
            cmd,
            vec![
                ("RTSP_PATH".to_string(), path.name.clone()),
                ("RTSP_PORT".to_string(), conn.settings.rtsp_port.to_string()),
            ],
        )
    });
    if let Some(cmd) = &mut child_command {
        if let Err(e) = cmd.spawn() {
            warn!("conn {}: runOnRead failed to spawn: {e}", conn.id());
        }
    }

    // Reader never reads from the peer again; only writes.
    framer.set_read_deadline(None);

    let result = pump(
        &conn,
        &mut framer,
        &ring,
        &tracks.video.map(|v| (v.sps, v.pps)),
        video_track_id,
        audio_track_id,
        audio_clock_rate,
        &mut aac_decoder,
    )
    .await;

    subscriber.abort();
    ring.close();
    if let Some(mut cmd) = child_command {
        cmd.shutdown().await;
    }

    result
}

async fn pump(
    conn: &Arc<Connection>,
    framer: &mut RtmpFramer,
    ring: &Arc<RingBuffer<Data>>,
    video_sps_pps: &Option<(bytes::Bytes, bytes::Bytes)>,
    video_track_id: Option<usize>,
    audio_track_id: Option<usize>,
    audio_clock_rate: Option<u32>,
    aac_decoder: &mut Option<aac::AacRtpDecoder>,
) -> Result<(), ConnError> {
    let mut video_initial_pts: Option<Duration> = None;
    let mut video_first_idr_found = false;
    let mut video_first_idr_pts = Duration::ZERO;
    let mut video_dts_est = h264::DtsEstimator::new();

    loop {
        let Some(item) = ring.pull().await else {
            return Err(ConnError::Terminated);
        };

        match item {
            Data::Video { track_id, nalus: Some(nalus), pts: Some(pts), .. } => {
                if Some(track_id) != video_track_id {
                    continue;
                }
                let Some((sps, pps)) = video_sps_pps else { continue };

                let initial = *video_initial_pts.get_or_insert(pts);
                let rel_pts = pts.saturating_sub(initial);

                let has_idr = h264::contains_idr(&nalus);
                if !video_first_idr_found {
                    if !has_idr {
                        continue;
                    }
                    video_first_idr_found = true;
                    video_first_idr_pts = rel_pts;
                }

                if has_idr {
                    let cfg = h264::build_decoder_config(sps, pps)?;
                    framer.set_write_deadline(Some(Instant::now() + conn.settings.write_timeout));
                    framer
                        .write_packet(RtmpPacket {
                            packet_type: PacketType::H264DecoderConfig,
                            data: cfg,
                            time: Duration::ZERO,
                            ctime: Duration::ZERO,
                        })
                        .await?;
                }

                let avcc = h264::nalus_to_avcc(&nalus);
                let zeroed_pts = rel_pts.saturating_sub(video_first_idr_pts);
                let dts = video_dts_est.feed(zeroed_pts);
                let ctime = zeroed_pts.saturating_sub(dts);

                framer.set_write_deadline(Some(Instant::now() + conn.settings.write_timeout));
                framer
                    .write_packet(RtmpPacket { packet_type: PacketType::H264, data: avcc, time: dts, ctime })
                    .await?;
            }
            Data::Video { .. } => {
                // Non-terminal RTP fragment of an access unit: nothing to
                // reconstruct from yet.
            }
            Data::Audio { track_id, rtp } => {
                if Some(track_id) != audio_track_id {
                    continue;
                }
                let Some(decoder) = aac_decoder.as_mut() else { continue };
                let Some(clock_rate) = audio_clock_rate else { continue };
                if video_sps_pps.is_some() && !video_first_idr_found {
                    continue;
                }

                let Ok((timestamp, payload)) = unmarshal_rtp(&rtp) else { continue };
                let item_pts = rtp_timestamp_to_duration(timestamp, clock_rate);
                let Some(mut pts) = item_pts.checked_sub(video_first_idr_pts) else { continue };

                match decoder.decode(&payload) {
                    aac::DecodeOutcome::AccessUnits(aus) => {
                        for au in aus {
                            framer.set_write_deadline(Some(Instant::now() + conn.settings.write_timeout));
                            framer
                                .write_packet(RtmpPacket {
                                    packet_type: PacketType::Aac,
                                    data: au,
                                    time: pts,
                                    ctime: Duration::ZERO,
                                })
                                .await?;
                            pts += Duration::from_nanos(aac::au_duration_ns(clock_rate));
                        }
                    }
                    aac::DecodeOutcome::NeedMorePackets => {}
                    aac::DecodeOutcome::Warning(msg) => {
                        warn!("conn {}: aac decode warning: {msg}", conn.id());
                    }
                }
            }
        }
    }
}

/// Unmarshals a full RTP packet into its timestamp (at the track's own
/// clock rate) and payload.
fn unmarshal_rtp(bytes: &bytes::Bytes) -> Result<(u32, bytes::Bytes), ConnError> {
    use rtp::packetizer::Marshaller;
    let packet = rtp::packet::Packet::unmarshal(bytes)
        .map_err(|e| ConnError::Codec(format!("rtp unmarshal: {e}")))?;
    Ok((packet.header.timestamp, packet.payload))
}

fn rtp_timestamp_to_duration(timestamp: u32, clock_rate: u32) -> Duration {
    Duration::from_secs_f64(timestamp as f64 / clock_rate as f64)
}
