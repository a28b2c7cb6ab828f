//! Binary header for encoded packets on the worker uplink.
//!
//! 32 bytes, little-endian:
//! ```text
//! [0..4]   magic: 0x50454756 ("VGEP")
//! [4]      version: 1
//! [5]      flags: bit 0 = keyframe, bit 1 = pass-through, bit 2 = snapshot
//! [6..8]   width (u16)
//! [8..10]  height (u16)
//! [10..12] reserved (u16, must be 0)
//! [12..20] frame_index (u64), scoped to one pipeline instance
//! [20..28] timestamp_ns (u64), monotonic nanoseconds since capture start
//! [28..32] payload_length (u32)
//! [32..]   payload (VP8 bitstream, or JPEG when the snapshot flag is set)
//! ```

pub const PACKET_HEADER_SIZE: usize = 32;
pub const PACKET_MAGIC: u32 = 0x5045_4756; // "VGEP" in LE
pub const PACKET_VERSION: u8 = 1;

pub const FLAG_KEYFRAME: u8 = 0x01;
/// Set when the overlay deadline expired and the frame was encoded unannotated.
pub const FLAG_PASSTHROUGH: u8 = 0x02;
/// Set on JPEG still images for the snapshot endpoint (not part of the stream).
pub const FLAG_SNAPSHOT: u8 = 0x04;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PacketHeader {
    pub flags: u8,
    pub width: u16,
    pub height: u16,
    pub frame_index: u64,
    pub timestamp_ns: u64,
    pub payload_length: u32,
}

impl PacketHeader {
    /// Header for an encoded video packet.
    pub fn video(
        width: u16,
        height: u16,
        frame_index: u64,
        timestamp_ns: u64,
        payload_length: u32,
        keyframe: bool,
        passthrough: bool,
    ) -> Self {
        let mut flags = 0;
        if keyframe {
            flags |= FLAG_KEYFRAME;
        }
        if passthrough {
            flags |= FLAG_PASSTHROUGH;
        }
        Self {
            flags,
            width,
            height,
            frame_index,
            timestamp_ns,
            payload_length,
        }
    }

    /// Header for a JPEG snapshot still.
    pub fn snapshot(width: u16, height: u16, timestamp_ns: u64, payload_length: u32) -> Self {
        Self {
            flags: FLAG_SNAPSHOT,
            width,
            height,
            frame_index: 0,
            timestamp_ns,
            payload_length,
        }
    }

    pub fn is_keyframe(&self) -> bool {
        self.flags & FLAG_KEYFRAME != 0
    }

    pub fn is_passthrough(&self) -> bool {
        self.flags & FLAG_PASSTHROUGH != 0
    }

    pub fn is_snapshot(&self) -> bool {
        self.flags & FLAG_SNAPSHOT != 0
    }

    /// Serialize header to a 32-byte little-endian buffer.
    pub fn serialize(&self, buf: &mut [u8; PACKET_HEADER_SIZE]) {
        buf[0..4].copy_from_slice(&PACKET_MAGIC.to_le_bytes());
        buf[4] = PACKET_VERSION;
        buf[5] = self.flags;
        buf[6..8].copy_from_slice(&self.width.to_le_bytes());
        buf[8..10].copy_from_slice(&self.height.to_le_bytes());
        buf[10..12].copy_from_slice(&0u16.to_le_bytes()); // reserved
        buf[12..20].copy_from_slice(&self.frame_index.to_le_bytes());
        buf[20..28].copy_from_slice(&self.timestamp_ns.to_le_bytes());
        buf[28..32].copy_from_slice(&self.payload_length.to_le_bytes());
    }

    /// Serialize header + payload into a single Vec.
    pub fn serialize_with_payload(&self, payload: &[u8]) -> Vec<u8> {
        let mut buf = vec![0u8; PACKET_HEADER_SIZE + payload.len()];
        let mut header_buf = [0u8; PACKET_HEADER_SIZE];
        self.serialize(&mut header_buf);
        buf[..PACKET_HEADER_SIZE].copy_from_slice(&header_buf);
        buf[PACKET_HEADER_SIZE..].copy_from_slice(payload);
        buf
    }

    /// Deserialize header from a byte slice (must be at least 32 bytes).
    pub fn deserialize(buf: &[u8]) -> Result<Self, PacketError> {
        if buf.len() < PACKET_HEADER_SIZE {
            return Err(PacketError::TooShort(buf.len()));
        }

        let magic = u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]);
        if magic != PACKET_MAGIC {
            return Err(PacketError::BadMagic(magic));
        }

        let version = buf[4];
        if version != PACKET_VERSION {
            return Err(PacketError::UnsupportedVersion(version));
        }

        Ok(Self {
            flags: buf[5],
            width: u16::from_le_bytes([buf[6], buf[7]]),
            height: u16::from_le_bytes([buf[8], buf[9]]),
            frame_index: u64::from_le_bytes([
                buf[12], buf[13], buf[14], buf[15], buf[16], buf[17], buf[18], buf[19],
            ]),
            timestamp_ns: u64::from_le_bytes([
                buf[20], buf[21], buf[22], buf[23], buf[24], buf[25], buf[26], buf[27],
            ]),
            payload_length: u32::from_le_bytes([buf[28], buf[29], buf[30], buf[31]]),
        })
    }

    /// Validate that the buffer contains a complete packet (header + payload).
    pub fn validate_complete(buf: &[u8]) -> Result<(), PacketError> {
        let header = Self::deserialize(buf)?;
        let expected = PACKET_HEADER_SIZE + header.payload_length as usize;
        if buf.len() < expected {
            return Err(PacketError::IncompletePayload {
                expected: header.payload_length as usize,
                actual: buf.len() - PACKET_HEADER_SIZE,
            });
        }
        Ok(())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum PacketError {
    #[error("buffer too short: {0} bytes (need at least {PACKET_HEADER_SIZE})")]
    TooShort(usize),
    #[error("bad magic: 0x{0:08x} (expected 0x{PACKET_MAGIC:08x})")]
    BadMagic(u32),
    #[error("unsupported version: {0} (expected {PACKET_VERSION})")]
    UnsupportedVersion(u8),
    #[error("incomplete payload: expected {expected} bytes, got {actual}")]
    IncompletePayload { expected: usize, actual: usize },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn video_header_roundtrip() {
        let header = PacketHeader::video(1280, 720, 42, 123_456_789, 65_536, true, false);
        let mut buf = [0u8; PACKET_HEADER_SIZE];
        header.serialize(&mut buf);
        let parsed = PacketHeader::deserialize(&buf).unwrap();
        assert_eq!(header, parsed);
        assert!(parsed.is_keyframe());
        assert!(!parsed.is_passthrough());
        assert!(!parsed.is_snapshot());
        assert_eq!(parsed.frame_index, 42);
    }

    #[test]
    fn passthrough_flag_roundtrip() {
        let header = PacketHeader::video(640, 480, 7, 1, 100, false, true);
        let mut buf = [0u8; PACKET_HEADER_SIZE];
        header.serialize(&mut buf);
        let parsed = PacketHeader::deserialize(&buf).unwrap();
        assert!(!parsed.is_keyframe());
        assert!(parsed.is_passthrough());
    }

    #[test]
    fn snapshot_header_roundtrip() {
        let header = PacketHeader::snapshot(1920, 1080, 999, 480);
        let mut buf = [0u8; PACKET_HEADER_SIZE];
        header.serialize(&mut buf);
        let parsed = PacketHeader::deserialize(&buf).unwrap();
        assert!(parsed.is_snapshot());
        assert_eq!(parsed.frame_index, 0);
    }

    #[test]
    fn serialize_with_payload() {
        let payload = vec![0xDE, 0xAD, 0xBE, 0xEF];
        let header = PacketHeader::video(640, 480, 3, 42, 4, true, false);
        let buf = header.serialize_with_payload(&payload);
        assert_eq!(buf.len(), PACKET_HEADER_SIZE + 4);
        let parsed = PacketHeader::deserialize(&buf).unwrap();
        assert_eq!(parsed.width, 640);
        assert_eq!(parsed.height, 480);
        assert_eq!(parsed.frame_index, 3);
        assert_eq!(parsed.payload_length, 4);
        assert_eq!(&buf[PACKET_HEADER_SIZE..], &payload);
    }

    #[test]
    fn deserialize_too_short() {
        let buf = [0u8; 10];
        match PacketHeader::deserialize(&buf) {
            Err(PacketError::TooShort(10)) => {}
            other => panic!("expected TooShort(10), got {:?}", other),
        }
    }

    #[test]
    fn deserialize_bad_magic() {
        let mut buf = [0u8; PACKET_HEADER_SIZE];
        buf[0..4].copy_from_slice(&0xDEADBEEFu32.to_le_bytes());
        match PacketHeader::deserialize(&buf) {
            Err(PacketError::BadMagic(0xDEADBEEF)) => {}
            other => panic!("expected BadMagic, got {:?}", other),
        }
    }

    #[test]
    fn deserialize_bad_version() {
        let mut buf = [0u8; PACKET_HEADER_SIZE];
        buf[0..4].copy_from_slice(&PACKET_MAGIC.to_le_bytes());
        buf[4] = 9;
        match PacketHeader::deserialize(&buf) {
            Err(PacketError::UnsupportedVersion(9)) => {}
            other => panic!("expected UnsupportedVersion(9), got {:?}", other),
        }
    }

    #[test]
    fn validate_complete_incomplete_payload() {
        let payload = vec![0u8; 50];
        let header = PacketHeader::video(1280, 720, 0, 0, 100, false, false);
        let buf = header.serialize_with_payload(&payload);
        match PacketHeader::validate_complete(&buf) {
            Err(PacketError::IncompletePayload {
                expected: 100,
                actual: 50,
            }) => {}
            other => panic!("expected IncompletePayload, got {:?}", other),
        }
    }

    #[test]
    fn magic_bytes_spell_vgep() {
        let bytes = PACKET_MAGIC.to_le_bytes();
        assert_eq!(&bytes, b"VGEP");
    }

    #[test]
    fn header_size_is_32() {
        assert_eq!(PACKET_HEADER_SIZE, 32);
    }
}
