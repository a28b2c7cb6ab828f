//! VP8 bitstream utilities.
//!
//! Reads the uncompressed frame tag (RFC 6386 §9.1) to spot keyframes and
//! recover keyframe dimensions, used to flag packets for late-joining
//! viewers and to sanity-check encoder output.

/// Sync code present in every VP8 keyframe header.
const KEYFRAME_SYNC: [u8; 3] = [0x9d, 0x01, 0x2a];

/// True if the payload starts a VP8 keyframe.
/// Bit 0 of the first frame-tag byte is the frame type: 0 = key frame.
pub fn vp8_is_keyframe(data: &[u8]) -> bool {
    data.first().map(|b| b & 0x01 == 0).unwrap_or(false)
}

/// Width/height from a keyframe header, if present and well-formed.
pub fn vp8_keyframe_dimensions(data: &[u8]) -> Option<(u16, u16)> {
    if !vp8_is_keyframe(data) || data.len() < 10 {
        return None;
    }
    if data[3..6] != KEYFRAME_SYNC {
        return None;
    }
    let width = u16::from_le_bytes([data[6], data[7]]) & 0x3fff;
    let height = u16::from_le_bytes([data[8], data[9]]) & 0x3fff;
    Some((width, height))
}
