//! Codec-level reshaping between RTMP's FLV-style packets and the internal
//! RTP-based path bus: H.264 AVCC<->NALU<->RTP and AAC RTP packetization.

pub mod aac;
pub mod h264;
