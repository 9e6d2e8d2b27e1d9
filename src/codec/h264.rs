//! H.264 AVCC<->NALU conversion, AVCDecoderConfigurationRecord build/parse,
//! IDR detection, DTS estimation, and RTP fragmentation.

use crate::error::ConnError;
use bytes::{Bytes, BytesMut};
use rtp::codecs::h264::H264Payloader;
use rtp::header::Header;
use rtp::packet::Packet;
use rtp::packetizer::Payloader;
use std::time::Duration;

const NALU_TYPE_IDR: u8 = 5;
const H264_CLOCK_RATE: u32 = 90_000;
const RTP_MTU: usize = 1200;

/// Splits AVCC (4-byte length-prefixed NALUs, the FLV/MP4 convention) into
/// a list of raw NALU byte slices.
pub fn avcc_to_nalus(avcc: &[u8]) -> Result<Vec<Bytes>, ConnError> {
    let mut nalus = Vec::new();
    let mut pos = 0usize;
    while pos + 4 <= avcc.len() {
        let len = u32::from_be_bytes([avcc[pos], avcc[pos + 1], avcc[pos + 2], avcc[pos + 3]])
            as usize;
        pos += 4;
        if pos + len > avcc.len() {
            return Err(ConnError::Codec("avcc: NALU length exceeds buffer".into()));
        }
        nalus.push(Bytes::copy_from_slice(&avcc[pos..pos + len]));
        pos += len;
    }
    if pos != avcc.len() {
        return Err(ConnError::Codec("avcc: trailing bytes after last NALU".into()));
    }
    Ok(nalus)
}

/// Re-encodes a list of raw NALUs as AVCC.
pub fn nalus_to_avcc(nalus: &[Bytes]) -> Bytes {
    let mut out = BytesMut::with_capacity(nalus.iter().map(|n| n.len() + 4).sum());
    for nalu in nalus {
        out.extend_from_slice(&(nalu.len() as u32).to_be_bytes());
        out.extend_from_slice(nalu);
    }
    out.freeze()
}

/// Builds an AVCDecoderConfigurationRecord (the FLV/MP4 sequence header)
/// carrying exactly one SPS and one PPS.
pub fn build_decoder_config(sps: &[u8], pps: &[u8]) -> Result<Bytes, ConnError> {
    if sps.len() < 4 {
        return Err(ConnError::Codec("SPS too short to build decoder config".into()));
    }
    let mut cfg = BytesMut::new();
    cfg.extend_from_slice(&[0x01]); // configurationVersion
    cfg.extend_from_slice(&sps[1..4]); // profile, profile_compat, level
    cfg.extend_from_slice(&[0xFF]); // reserved(6) + lengthSizeMinusOne=3 (4-byte lengths)
    cfg.extend_from_slice(&[0xE1]); // reserved(3) + numOfSPS=1
    cfg.extend_from_slice(&(sps.len() as u16).to_be_bytes());
    cfg.extend_from_slice(sps);
    cfg.extend_from_slice(&[0x01]); // numOfPPS
    cfg.extend_from_slice(&(pps.len() as u16).to_be_bytes());
    cfg.extend_from_slice(pps);
    Ok(cfg.freeze())
}

/// Parses an AVCDecoderConfigurationRecord back into its SPS and PPS.
pub fn parse_decoder_config(cfg: &[u8]) -> Result<(Bytes, Bytes), ConnError> {
    if cfg.len() < 6 {
        return Err(ConnError::Codec("decoder config too short".into()));
    }
    let num_sps = cfg[5] & 0x1F;
    if num_sps != 1 {
        return Err(ConnError::Codec(format!(
            "decoder config: expected exactly one SPS, found {num_sps}"
        )));
    }
    let sps_len = u16::from_be_bytes([cfg[6], cfg[7]]) as usize;
    let sps_start = 8;
    if sps_start + sps_len > cfg.len() {
        return Err(ConnError::Codec("decoder config: SPS length overruns buffer".into()));
    }
    let sps = Bytes::copy_from_slice(&cfg[sps_start..sps_start + sps_len]);

    let num_pps_off = sps_start + sps_len;
    if num_pps_off >= cfg.len() {
        return Err(ConnError::Codec("decoder config: missing PPS count".into()));
    }
    let num_pps = cfg[num_pps_off];
    if num_pps != 1 {
        return Err(ConnError::Codec(format!(
            "decoder config: expected exactly one PPS, found {num_pps}"
        )));
    }
    let pps_len_off = num_pps_off + 1;
    if pps_len_off + 2 > cfg.len() {
        return Err(ConnError::Codec("decoder config: missing PPS length".into()));
    }
    let pps_len = u16::from_be_bytes([cfg[pps_len_off], cfg[pps_len_off + 1]]) as usize;
    let pps_start = pps_len_off + 2;
    if pps_start + pps_len > cfg.len() {
        return Err(ConnError::Codec("decoder config: PPS length overruns buffer".into()));
    }
    let pps = Bytes::copy_from_slice(&cfg[pps_start..pps_start + pps_len]);

    Ok((sps, pps))
}

pub fn contains_idr(nalus: &[Bytes]) -> bool {
    nalus.iter().any(|n| !n.is_empty() && (n[0] & 0x1F) == NALU_TYPE_IDR)
}

/// Fragments an access unit's NALUs into RTP packets (FU-A for anything
/// larger than the MTU, single-NALU packets otherwise), stamping each with
/// the given 90kHz RTP timestamp and SSRC.
pub fn fragment_to_rtp(
    nalus: &[Bytes],
    pts: Duration,
    ssrc: u32,
    sequence_number: &mut u16,
    payload_type: u8,
) -> Result<Vec<Bytes>, ConnError> {
    let payloader = H264Payloader;
    let timestamp = pts_to_rtp_timestamp(pts);

    let mut fragments = Vec::new();
    for nalu in nalus {
        let pieces = payloader
            .payload(RTP_MTU, nalu)
            .map_err(|e| ConnError::Codec(format!("h264 payloader: {e}")))?;
        fragments.extend(pieces);
    }

    let total = fragments.len();
    let mut packets = Vec::with_capacity(total);
    for (i, payload) in fragments.into_iter().enumerate() {
        let header = Header {
            version: 2,
            marker: i + 1 == total,
            payload_type,
            sequence_number: *sequence_number,
            timestamp,
            ssrc,
            ..Default::default()
        };
        *sequence_number = sequence_number.wrapping_add(1);
        let packet = Packet { header, payload };
        packets.push(marshal_packet(&packet)?);
    }
    Ok(packets)
}

fn pts_to_rtp_timestamp(pts: Duration) -> u32 {
    ((pts.as_secs_f64() * H264_CLOCK_RATE as f64) as u64 & 0xFFFF_FFFF) as u32
}

fn marshal_packet(packet: &Packet) -> Result<Bytes, ConnError> {
    use rtp::packetizer::Marshaller;
    packet
        .marshal()
        .map_err(|e| ConnError::Codec(format!("rtp marshal: {e}")))
}

/// Estimates DTS from a monotonically-observed PTS stream, assuming a
/// fixed small B-frame reorder depth (the common GOP structure with one
/// level of forward reference reordering: IPPP or IBP).
///
/// This is deliberately conservative rather than a full reorder buffer: it
/// only needs to produce a non-decreasing DTS <= PTS, which is all the
/// wire format requires (`CTime = PTS - DTS` must be non-negative).
pub struct DtsEstimator {
    last_dts: Option<Duration>,
    reorder_depth: Duration,
}

impl DtsEstimator {
    pub fn new() -> Self {
        Self {
            last_dts: None,
            reorder_depth: Duration::from_millis(40),
        }
    }

    /// Feeds the next access unit's PTS and returns its estimated DTS.
    pub fn feed(&mut self, pts: Duration) -> Duration {
        let candidate = pts.saturating_sub(self.reorder_depth);
        let dts = match self.last_dts {
            Some(last) if candidate < last => last,
            _ => candidate,
        };
        self.last_dts = Some(dts);
        dts
    }
}

impl Default for DtsEstimator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn avcc_round_trip() {
        let nalus = vec![Bytes::from_static(&[0x67, 1, 2, 3]), Bytes::from_static(&[0x68, 4, 5])];
        let avcc = nalus_to_avcc(&nalus);
        let decoded = avcc_to_nalus(&avcc).unwrap();
        assert_eq!(decoded, nalus);
    }

    #[test]
    fn decoder_config_round_trip() {
        let sps = [0x67, 0x42, 0x00, 0x1e, 0xaa, 0xbb];
        let pps = [0x68, 0xce, 0x3c, 0x80];
        let cfg = build_decoder_config(&sps, &pps).unwrap();
        let (got_sps, got_pps) = parse_decoder_config(&cfg).unwrap();
        assert_eq!(&got_sps[..], &sps[..]);
        assert_eq!(&got_pps[..], &pps[..]);
    }

    #[test]
    fn idr_detection() {
        let idr = Bytes::from_static(&[0x65, 0, 0]);
        let non_idr = Bytes::from_static(&[0x61, 0, 0]);
        assert!(contains_idr(&[non_idr.clone(), idr]));
        assert!(!contains_idr(&[non_idr]));
    }

    #[test]
    fn dts_estimator_never_exceeds_pts_and_is_monotonic() {
        let mut est = DtsEstimator::new();
        let pts_seq = [
            Duration::from_millis(0),
            Duration::from_millis(40),
            Duration::from_millis(80),
            Duration::from_millis(120),
        ];
        let mut last = Duration::ZERO;
        for pts in pts_seq {
            let dts = est.feed(pts);
            assert!(dts <= pts);
            assert!(dts >= last);
            last = dts;
        }
    }

    #[test]
    fn fragment_to_rtp_produces_markers_on_last_fragment() {
        let nalu = Bytes::from(vec![0x65u8; 2000]);
        let mut seq = 0u16;
        let packets = fragment_to_rtp(&[nalu], Duration::from_millis(0), 0x1234, &mut seq, 96)
            .unwrap();
        assert!(packets.len() > 1, "large NALU should fragment across multiple RTP packets");
    }
}
