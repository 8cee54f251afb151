//! Frame header assembly/parsing (§4.1).

use crate::error::{Result, SelvaError};
use crate::wire::crc32c::crc32c;

pub const FRAME_HEADER_LEN: usize = 16;
pub const SELVA_PROTO_FRAME_SIZE_MAX: usize = 5840;
pub const SELVA_PROTO_MSG_SIZE_MAX: usize = 1 << 30; // 1 GiB

pub const FLAG_RESPONSE: u8 = 0x80;
pub const FLAG_FFMASK: u8 = 0x60;
pub const FLAG_FIRST: u8 = 0x20;
pub const FLAG_LAST: u8 = 0x40;
pub const FLAG_STREAM: u8 = 0x10;
pub const FLAG_BATCH: u8 = 0x08;
pub const FLAG_DEFLATE: u8 = 0x01;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub cmd: i8,
    pub flags: u8,
    pub seqno: u32,
    pub frame_bsize: u16,
    pub msg_bsize: u32,
    pub chk: u32,
}

impl FrameHeader {
    pub fn is_first(&self) -> bool {
        self.flags & FLAG_FIRST != 0
    }

    pub fn is_last(&self) -> bool {
        self.flags & FLAG_LAST != 0
    }

    pub fn is_response(&self) -> bool {
        self.flags & FLAG_RESPONSE != 0
    }

    pub fn is_stream(&self) -> bool {
        self.flags & FLAG_STREAM != 0
    }

    pub fn is_batch(&self) -> bool {
        self.flags & FLAG_BATCH != 0
    }

    pub fn is_deflate(&self) -> bool {
        self.flags & FLAG_DEFLATE != 0
    }

    /// Encode the 16-byte header in little-endian order, with `chk` zeroed —
    /// used both to build the real header and as the scratch buffer the CRC
    /// is computed over (§4.1: "CRC-32C of the whole frame with `chk=0`").
    fn encode_with_chk(&self, chk: u32) -> [u8; FRAME_HEADER_LEN] {
        let mut buf = [0u8; FRAME_HEADER_LEN];
        buf[0] = self.cmd as u8;
        buf[1] = self.flags;
        buf[2..6].copy_from_slice(&self.seqno.to_le_bytes());
        buf[6..8].copy_from_slice(&self.frame_bsize.to_le_bytes());
        buf[8..12].copy_from_slice(&self.msg_bsize.to_le_bytes());
        buf[12..16].copy_from_slice(&chk.to_le_bytes());
        buf
    }

    /// Build and checksum a complete frame (header + payload) ready to write
    /// to the wire.
    pub fn build_frame(mut self, payload: &[u8]) -> Result<Vec<u8>> {
        let total = FRAME_HEADER_LEN + payload.len();
        if total > SELVA_PROTO_FRAME_SIZE_MAX {
            return Err(SelvaError::Ebadmsg("frame too large".into()));
        }
        self.frame_bsize = total as u16;

        let header_zero_chk = self.encode_with_chk(0);
        let mut scratch = Vec::with_capacity(total);
        scratch.extend_from_slice(&header_zero_chk);
        scratch.extend_from_slice(payload);
        let chk = crc32c(&scratch);

        let header = self.encode_with_chk(chk);
        let mut out = Vec::with_capacity(total);
        out.extend_from_slice(&header);
        out.extend_from_slice(payload);
        Ok(out)
    }

    /// Parse a 16-byte header from the wire.
    pub fn decode(buf: &[u8]) -> Result<FrameHeader> {
        if buf.len() < FRAME_HEADER_LEN {
            return Err(SelvaError::Ebadmsg("short frame header".into()));
        }
        Ok(FrameHeader {
            cmd: buf[0] as i8,
            flags: buf[1],
            seqno: u32::from_le_bytes(buf[2..6].try_into().unwrap()),
            frame_bsize: u16::from_le_bytes(buf[6..8].try_into().unwrap()),
            msg_bsize: u32::from_le_bytes(buf[8..12].try_into().unwrap()),
            chk: u32::from_le_bytes(buf[12..16].try_into().unwrap()),
        })
    }
}

/// `verify_frame_chk(header, payload) → bool` (§4.1): recompute the CRC over
/// the whole frame with `chk` zeroed and compare.
pub fn verify_frame_chk(header: &FrameHeader, payload: &[u8]) -> bool {
    let zeroed = FrameHeader { chk: 0, ..*header };
    let mut scratch = Vec::with_capacity(FRAME_HEADER_LEN + payload.len());
    scratch.extend_from_slice(&zeroed.encode_with_chk(0));
    scratch.extend_from_slice(payload);
    crc32c(&scratch) == header.chk
}

/// Parse a full on-wire frame (header + payload) out of `buf`, returning the
/// header, payload slice, and number of bytes consumed.
pub fn parse_frame(buf: &[u8]) -> Result<(FrameHeader, &[u8], usize)> {
    let header = FrameHeader::decode(buf)?;
    let frame_len = header.frame_bsize as usize;
    if frame_len < FRAME_HEADER_LEN || frame_len > SELVA_PROTO_FRAME_SIZE_MAX {
        return Err(SelvaError::Ebadmsg("invalid frame_bsize".into()));
    }
    if buf.len() < frame_len {
        return Err(SelvaError::Ebadmsg("incomplete frame".into()));
    }
    let payload = &buf[FRAME_HEADER_LEN..frame_len];
    if !verify_frame_chk(&header, payload) {
        return Err(SelvaError::Ebadmsg("checksum mismatch".into()));
    }
    Ok((header, payload, frame_len))
}

#[cfg(test)]
mod frame_tests {
    use super::*;

    fn base_header() -> FrameHeader {
        FrameHeader {
            cmd: 0,
            flags: FLAG_FIRST | FLAG_LAST,
            seqno: 1,
            frame_bsize: 0,
            msg_bsize: 0,
            chk: 0,
        }
    }

    #[test]
    fn build_then_parse_round_trips() {
        let frame = base_header().build_frame(b"PONG").unwrap();
        let (header, payload, consumed) = parse_frame(&frame).unwrap();
        assert_eq!(payload, b"PONG");
        assert_eq!(consumed, frame.len());
        assert!(header.is_first());
        assert!(header.is_last());
    }

    #[test]
    fn corrupted_payload_fails_checksum() {
        let mut frame = base_header().build_frame(b"PONG").unwrap();
        let last = frame.len() - 1;
        frame[last] ^= 0xFF;
        assert!(parse_frame(&frame).is_err());
    }

    #[test]
    fn oversize_frame_rejected() {
        let payload = vec![0u8; SELVA_PROTO_FRAME_SIZE_MAX];
        assert!(base_header().build_frame(&payload).is_err());
    }

    #[test]
    fn flags_round_trip() {
        let h = FrameHeader {
            flags: FLAG_RESPONSE | FLAG_STREAM | FLAG_BATCH,
            ..base_header()
        };
        let frame = h.build_frame(b"").unwrap();
        let (decoded, _, _) = parse_frame(&frame).unwrap();
        assert!(decoded.is_response());
        assert!(decoded.is_stream());
        assert!(decoded.is_batch());
        assert!(!decoded.is_deflate());
    }
}
