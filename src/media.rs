//! The media segment layer: ordering and timing metadata.
//!
//! A media segment is a multiplexing frame prefixed with the metadata a
//! video player would attach to a downloaded segment. `segment_index` is the
//! ordering key the server-side [`Reassembler`] consumes; `pts_ms` and
//! `duration_ms` exist purely to complete the disguise.
//!
//! All four header fields are `i32` little-endian. The byte order is part of
//! the wire format and must never follow the host's native order.
//!
//! [`Reassembler`]: crate::reassembler::Reassembler

use crate::{error::Error, specification::MEDIA_HDR_LEN};

/// Metadata attached to one media segment.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct MediaSegmentMeta {
    /// Identifier of the logical media stream.
    pub stream_id: i32,
    /// Position of this segment within the stream. Monotonically increasing
    /// per direction, starting at 0.
    pub segment_index: i32,
    /// Presentation timestamp, in milliseconds.
    pub pts_ms: i32,
    /// Nominal segment duration, in milliseconds.
    pub duration_ms: i32,
}

/// Encodes `meta` followed by `raw` into one media segment payload.
pub fn encode(meta: &MediaSegmentMeta, raw: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(MEDIA_HDR_LEN + raw.len());
    buf.extend_from_slice(&meta.stream_id.to_le_bytes());
    buf.extend_from_slice(&meta.segment_index.to_le_bytes());
    buf.extend_from_slice(&meta.pts_ms.to_le_bytes());
    buf.extend_from_slice(&meta.duration_ms.to_le_bytes());
    buf.extend_from_slice(raw);
    buf
}

/// Splits a media segment payload back into its metadata and raw bytes.
///
/// # Errors
///
/// Returns [`Error::TruncatedFrame`] if `payload` is shorter than the
/// 16-byte header.
pub fn decode(payload: &[u8]) -> Result<(MediaSegmentMeta, Vec<u8>), Error> {
    if payload.len() < MEDIA_HDR_LEN {
        return Err(Error::TruncatedFrame {
            expected: MEDIA_HDR_LEN,
            available: payload.len(),
        });
    }

    let read_i32 = |at: usize| i32::from_le_bytes(payload[at..at + 4].try_into().unwrap());
    let meta = MediaSegmentMeta {
        stream_id: read_i32(0),
        segment_index: read_i32(4),
        pts_ms: read_i32(8),
        duration_ms: read_i32(12),
    };
    Ok((meta, payload[MEDIA_HDR_LEN..].to_vec()))
}
