//! The unit exchanged on the internal path bus between the publisher
//! pipeline (producer) and any number of reader pipelines (consumers).

use bytes::Bytes;
use std::time::Duration;

/// One item on a path's fan-out stream.
///
/// Modeled as a tagged variant rather than a struct of optionals: a video
/// item only carries decoded NALUs and a PTS on its *last* RTP fragment,
/// and audio items never carry NALUs at all. Matching on the tag makes both
/// of those invariants unrepresentable as anything else.
#[derive(Debug, Clone)]
pub enum Data {
    Video {
        /// Track index this item belongs to.
        track_id: usize,
        /// Raw RTP packet bytes ready to write to a reader's socket.
        rtp: Bytes,
        /// Whether this is the last RTP fragment of the access unit.
        last_fragment: bool,
        /// Decoded NALUs for the access unit; only set on `last_fragment`.
        nalus: Option<Vec<Bytes>>,
        /// Presentation timestamp of the access unit; only set on `last_fragment`.
        pts: Option<Duration>,
    },
    Audio {
        track_id: usize,
        rtp: Bytes,
    },
}

impl Data {
    pub fn track_id(&self) -> usize {
        match self {
            Data::Video { track_id, .. } => *track_id,
            Data::Audio { track_id, .. } => *track_id,
        }
    }

    /// `ptsEqualsDTS` flag: true for audio. For H.264, non-terminal RTP
    /// fragments of an access unit are always false; the last fragment
    /// reflects whether the access unit contained an IDR.
    pub fn pts_equals_dts(&self, idr_present: bool) -> bool {
        match self {
            Data::Audio { .. } => true,
            Data::Video { last_fragment, .. } => *last_fragment && idr_present,
        }
    }
}
