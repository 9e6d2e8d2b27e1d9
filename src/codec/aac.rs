//! AAC access-unit <-> RTP packetization for MPEG-4-generic audio (RFC 3640),
//! using a single 16-bit AU-header per RTP packet (one AU per packet, the
//! common case for AAC-LC over RTMP-originated streams).

use crate::error::ConnError;
use bytes::{Bytes, BytesMut};
use rtp::header::Header;
use rtp::packet::Packet;
use std::time::Duration;

/// One AU-header slot: 13 bits of AU-size, 3 bits of AU-index(-delta).
const AU_HEADER_BITS: u16 = 16;

/// Standard AAC access unit size in samples; used to advance the playback
/// clock between access units on the reader side.
pub const SAMPLES_PER_AU: u64 = 1024;

/// Outcome of feeding one RTP packet to the decoder. A dedicated enum
/// (rather than folding `NeedMorePackets` into the error type) forces every
/// caller to handle the "silent, continue" case explicitly.
#[derive(Debug)]
pub enum DecodeOutcome {
    /// Zero or more complete access units were extracted from this packet.
    AccessUnits(Vec<Bytes>),
    /// The packet didn't carry a complete AU-header section; not an error.
    NeedMorePackets,
    /// A malformed AU-header was found; log and continue, don't fail the
    /// session over a single glitched packet.
    Warning(String),
}

pub struct AacRtpEncoder {
    clock_rate: u32,
    ssrc: u32,
    sequence_number: u16,
}

impl AacRtpEncoder {
    pub fn new(clock_rate: u32, ssrc: u32) -> Self {
        Self { clock_rate, ssrc, sequence_number: 0 }
    }

    /// Wraps one raw AAC access unit (ADTS-less, as carried on the RTMP
    /// side) into a single RTP packet with a 4-byte AU-header section.
    pub fn encode_au(&mut self, au: &[u8], pts: Duration, payload_type: u8) -> Result<Bytes, ConnError> {
        if au.len() >= (1 << 13) {
            return Err(ConnError::Codec("aac access unit too large for 13-bit AU-size field".into()));
        }

        let mut payload = BytesMut::with_capacity(4 + au.len());
        payload.extend_from_slice(&AU_HEADER_BITS.to_be_bytes());
        let au_header: u16 = ((au.len() as u16) << 3) | 0; // AU-index(-delta) = 0
        payload.extend_from_slice(&au_header.to_be_bytes());
        payload.extend_from_slice(au);

        let header = Header {
            version: 2,
            marker: true,
            payload_type,
            sequence_number: self.sequence_number,
            timestamp: pts_to_rtp_timestamp(pts, self.clock_rate),
            ssrc: self.ssrc,
            ..Default::default()
        };
        self.sequence_number = self.sequence_number.wrapping_add(1);

        let packet = Packet { header, payload: payload.freeze() };
        use rtp::packetizer::Marshaller;
        packet
            .marshal()
            .map_err(|e| ConnError::Codec(format!("rtp marshal: {e}")))
    }
}

pub struct AacRtpDecoder {
    #[allow(dead_code)]
    clock_rate: u32,
}

impl AacRtpDecoder {
    pub fn new(clock_rate: u32) -> Self {
        Self { clock_rate }
    }

    /// Extracts access units from one RTP payload (header already stripped).
    pub fn decode(&mut self, rtp_payload: &[u8]) -> DecodeOutcome {
        if rtp_payload.len() < 4 {
            return DecodeOutcome::NeedMorePackets;
        }
        let headers_len_bits = u16::from_be_bytes([rtp_payload[0], rtp_payload[1]]);
        if headers_len_bits == 0 || headers_len_bits % AU_HEADER_BITS != 0 {
            return DecodeOutcome::Warning(format!(
                "unsupported AU-headers-length {headers_len_bits} bits"
            ));
        }
        let num_headers = (headers_len_bits / AU_HEADER_BITS) as usize;
        let headers_bytes = num_headers * 2;
        let headers_start = 2;
        let headers_end = headers_start + headers_bytes;
        if rtp_payload.len() < headers_end {
            return DecodeOutcome::NeedMorePackets;
        }

        let mut sizes = Vec::with_capacity(num_headers);
        for i in 0..num_headers {
            let off = headers_start + i * 2;
            let raw = u16::from_be_bytes([rtp_payload[off], rtp_payload[off + 1]]);
            sizes.push((raw >> 3) as usize);
        }

        let mut aus = Vec::with_capacity(num_headers);
        let mut data_off = headers_end;
        for size in sizes {
            if data_off + size > rtp_payload.len() {
                return DecodeOutcome::NeedMorePackets;
            }
            aus.push(Bytes::copy_from_slice(&rtp_payload[data_off..data_off + size]));
            data_off += size;
        }

        DecodeOutcome::AccessUnits(aus)
    }
}

/// MPEG-4 `samplingFrequencyIndex` -> Hz, per the AudioSpecificConfig table
/// (ISO/IEC 14496-3). Index 15 means "explicit frequency follows"; not
/// supported here since RTMP/FLV AAC never emits it in practice.
const SAMPLE_RATES: [u32; 13] =
    [96_000, 88_200, 64_000, 48_000, 44_100, 32_000, 24_000, 22_050, 16_000, 12_000, 11_025, 8_000, 7_350];

/// Parses the 2-byte AudioSpecificConfig carried in an AAC sequence header
/// (FLV `AACPacketType::SequenceHeader`) and returns the real sample rate.
pub fn parse_audio_specific_config(asc: &[u8]) -> Result<u32, ConnError> {
    if asc.len() < 2 {
        return Err(ConnError::Codec("AudioSpecificConfig too short".into()));
    }
    let sampling_frequency_index = ((asc[0] & 0x07) << 1) | (asc[1] >> 7);
    SAMPLE_RATES
        .get(sampling_frequency_index as usize)
        .copied()
        .ok_or_else(|| ConnError::Codec(format!("unsupported samplingFrequencyIndex {sampling_frequency_index}")))
}

fn pts_to_rtp_timestamp(pts: Duration, clock_rate: u32) -> u32 {
    ((pts.as_secs_f64() * clock_rate as f64) as u64 & 0xFFFF_FFFF) as u32
}

/// Nanoseconds one access unit advances the playback clock at `clock_rate`.
/// Resolves the AU-duration open question: an AAC access unit spans 1024
/// samples, not one sample period, so the advance is `1024 / clock_rate`
/// seconds -- not `1 / clock_rate`.
pub fn au_duration_ns(clock_rate: u32) -> u64 {
    1_000_000_000u64 * SAMPLES_PER_AU / clock_rate as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_then_decode_single_au() {
        let mut enc = AacRtpEncoder::new(44_100, 0xABCD);
        let au = [1u8, 2, 3, 4, 5];
        let packet = enc.encode_au(&au, Duration::from_millis(0), 97).unwrap();

        use rtp::packetizer::Marshaller;
        let parsed = rtp::packet::Packet::unmarshal(&packet).unwrap();

        let mut dec = AacRtpDecoder::new(44_100);
        match dec.decode(&parsed.payload) {
            DecodeOutcome::AccessUnits(aus) => {
                assert_eq!(aus.len(), 1);
                assert_eq!(&aus[0][..], &au[..]);
            }
            other => panic!("expected AccessUnits, got {other:?}"),
        }
    }

    #[test]
    fn decode_short_payload_needs_more_packets() {
        let mut dec = AacRtpDecoder::new(44_100);
        match dec.decode(&[0u8, 0]) {
            DecodeOutcome::NeedMorePackets => {}
            other => panic!("expected NeedMorePackets, got {other:?}"),
        }
    }

    #[test]
    fn au_duration_matches_1024_samples() {
        assert_eq!(au_duration_ns(48_000), 1_000_000_000 * 1024 / 48_000);
    }

    #[test]
    fn parses_44100hz_stereo_audio_specific_config() {
        // AAC-LC, 44100Hz, stereo.
        assert_eq!(parse_audio_specific_config(&[0x12, 0x10]).unwrap(), 44_100);
    }

    #[test]
    fn parses_48000hz_stereo_audio_specific_config() {
        // AAC-LC, 48000Hz, stereo.
        assert_eq!(parse_audio_specific_config(&[0x11, 0x90]).unwrap(), 48_000);
    }

    #[test]
    fn rejects_short_audio_specific_config() {
        assert!(parse_audio_specific_config(&[0x12]).is_err());
    }
}
