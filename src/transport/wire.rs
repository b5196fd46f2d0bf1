//! On-wire framing for the shared slot ring
//!
//! Every message is an 8-byte header followed by the payload, padded so the
//! next header stays 8-byte aligned. The header packs the message kind and
//! both port numbers into a single word; a reserved kind marks inert padding
//! that fills the tail of a slot when a message would not fit.

use std::fmt;

use crate::error::{Error, Result};

/// Byte size of one ring slot, fixed by the remote firmware.
pub const SLOT_SIZE: usize = 4096;

/// Natural alignment of message headers inside a slot.
pub const MSG_ALIGN: usize = 8;

/// Bytes occupied by a message header (`msg_id` + `size`).
pub const HEADER_BYTES: usize = 8;

/// Largest payload a single slot can carry after header and alignment.
pub const MAX_PAYLOAD: usize = SLOT_SIZE - HEADER_BYTES;

const KIND_SHIFT: u32 = 24;
const SRC_SHIFT: u32 = 12;
const PORT_MASK: u32 = 0xfff;

/// Round `n` up to the message alignment.
pub const fn align_up(n: usize) -> usize {
    (n + MSG_ALIGN - 1) & !(MSG_ALIGN - 1)
}

/// Total on-wire bytes for a payload of `len` bytes.
pub const fn stride_for(len: usize) -> usize {
    HEADER_BYTES + align_up(len)
}

/// Message kinds understood by either endpoint.
///
/// `Padding` never reaches a dispatcher; readers skip it while walking a
/// slot. Anything outside this set is treated as ring corruption.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MsgKind {
    Padding,
    Connect,
    Open,
    OpenAck,
    Data,
}

impl MsgKind {
    fn from_raw(raw: u32) -> Result<Self> {
        match raw {
            0 => Ok(MsgKind::Padding),
            1 => Ok(MsgKind::Connect),
            2 => Ok(MsgKind::Open),
            3 => Ok(MsgKind::OpenAck),
            5 => Ok(MsgKind::Data),
            _ => Err(Error::Corrupted("unknown message kind")),
        }
    }

    const fn raw(self) -> u32 {
        match self {
            MsgKind::Padding => 0,
            MsgKind::Connect => 1,
            MsgKind::Open => 2,
            MsgKind::OpenAck => 3,
            MsgKind::Data => 5,
        }
    }
}

/// Pack kind and ports into a message id word.
pub fn pack_msg_id(kind: MsgKind, src_port: u16, dst_port: u16) -> u32 {
    (kind.raw() << KIND_SHIFT)
        | ((src_port as u32 & PORT_MASK) << SRC_SHIFT)
        | (dst_port as u32 & PORT_MASK)
}

/// Decoded view of a message id word.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct MsgId(pub u32);

impl MsgId {
    pub fn kind(self) -> Result<MsgKind> {
        MsgKind::from_raw(self.0 >> KIND_SHIFT)
    }

    pub fn src_port(self) -> u16 {
        ((self.0 >> SRC_SHIFT) & PORT_MASK) as u16
    }

    pub fn dst_port(self) -> u16 {
        (self.0 & PORT_MASK) as u16
    }
}

impl fmt::Debug for MsgId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MsgId")
            .field("kind", &self.kind())
            .field("src", &self.src_port())
            .field("dst", &self.dst_port())
            .finish()
    }
}

/// Four-character code used for service names and media encodings.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct FourCc(pub u32);

impl FourCc {
    pub const fn new(b: &[u8; 4]) -> Self {
        FourCc(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    pub fn bytes(self) -> [u8; 4] {
        self.0.to_le_bytes()
    }
}

impl fmt::Debug for FourCc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let b = self.bytes();
        for c in b {
            if c.is_ascii_graphic() || c == b' ' {
                write!(f, "{}", c as char)?;
            } else {
                write!(f, "\\x{c:02x}")?;
            }
        }
        Ok(())
    }
}

impl fmt::Display for FourCc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Write a message header into `slot` at `offset`.
///
/// Callers are responsible for writing the payload before publishing the new
/// write position; the header itself carries no commit semantics.
pub(crate) fn write_header(slot: &mut [u8], offset: usize, msg_id: u32, size: u32) {
    slot[offset..offset + 4].copy_from_slice(&msg_id.to_le_bytes());
    slot[offset + 4..offset + 8].copy_from_slice(&size.to_le_bytes());
}

/// Parse the header at `offset`, validating that the full message fits in
/// the remainder of the slot.
pub(crate) fn read_header(slot: &[u8], offset: usize) -> Result<(MsgId, usize)> {
    if offset + HEADER_BYTES > SLOT_SIZE {
        return Err(Error::Corrupted("message header overruns slot"));
    }
    let msg_id = u32::from_le_bytes(slot[offset..offset + 4].try_into().unwrap());
    let size = u32::from_le_bytes(slot[offset + 4..offset + 8].try_into().unwrap()) as usize;
    if offset + stride_for(size) > SLOT_SIZE {
        return Err(Error::Corrupted("message body overruns slot"));
    }
    Ok((MsgId(msg_id), size))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn msg_id_round_trip() {
        let id = MsgId(pack_msg_id(MsgKind::Data, 7, 90));
        assert_eq!(id.kind().unwrap(), MsgKind::Data);
        assert_eq!(id.src_port(), 7);
        assert_eq!(id.dst_port(), 90);
    }

    #[test]
    fn ports_are_twelve_bits() {
        let id = MsgId(pack_msg_id(MsgKind::Open, 0xfff, 0xfff));
        assert_eq!(id.src_port(), 0xfff);
        assert_eq!(id.dst_port(), 0xfff);
    }

    #[test]
    fn stride_is_aligned() {
        assert_eq!(stride_for(0), 8);
        assert_eq!(stride_for(1), 16);
        assert_eq!(stride_for(8), 16);
        assert_eq!(stride_for(9), 24);
    }

    #[test]
    fn header_rejects_overrun() {
        let mut slot = [0u8; SLOT_SIZE];
        write_header(&mut slot, SLOT_SIZE - 8, 0, 64);
        assert!(read_header(&slot, SLOT_SIZE - 8).is_err());
    }

    #[test]
    fn fourcc_renders_ascii() {
        assert_eq!(format!("{}", FourCc::new(b"mmal")), "mmal");
    }
}
