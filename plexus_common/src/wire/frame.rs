//! Frame header: the fixed 26-byte prefix of every frame.
//!
//! | offset | size | field |
//! |---|---|---|
//! | 0 | 4 | host |
//! | 4 | 2 | robot |
//! | 6 | 2 | interface |
//! | 8 | 2 | index |
//! | 10 | 1 | message type |
//! | 11 | 1 | subtype |
//! | 12 | 4 | payload length |
//! | 16 | 4 | timestamp seconds |
//! | 20 | 4 | timestamp microseconds |
//! | 24 | 2 | reserved (zero) |

use static_assertions::const_assert_eq;

use super::ProtocolError;
use super::cursor::{Reader, Writer};
use crate::address::Address;
use crate::consts::{FRAME_HEADER_LEN, MAX_PAYLOAD_SIZE};
use crate::message::{Header, MsgType, Timestamp};

/// Size of an address inside a frame or payload.
pub const ADDRESS_LEN: usize = 10;

const_assert_eq!(ADDRESS_LEN + 1 + 1 + 4 + 4 + 4 + 2, FRAME_HEADER_LEN);

/// Decoded frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub addr: Address,
    pub msg_type: MsgType,
    pub subtype: u8,
    /// Payload length in bytes.
    pub len: u32,
    pub timestamp: Timestamp,
}

impl FrameHeader {
    /// Build the frame header for a message header and payload length.
    pub fn for_message(header: &Header, len: usize) -> Self {
        Self {
            addr: header.addr,
            msg_type: header.msg_type,
            subtype: header.subtype,
            len: len as u32,
            timestamp: header.timestamp,
        }
    }

    /// Parse the first [`FRAME_HEADER_LEN`] bytes of `buf`.
    ///
    /// Rejects unknown message types and payload lengths that could not
    /// fit in one frame, so callers can size the body read safely.
    pub fn read(buf: &[u8]) -> Result<Self, ProtocolError> {
        let mut r = Reader::new(buf);
        r.ensure(FRAME_HEADER_LEN)?;

        let addr = read_address(&mut r)?;
        let raw_type = r.u8()?;
        let msg_type = MsgType::from_u8(raw_type).ok_or(ProtocolError::UnknownMsgType(raw_type))?;
        let subtype = r.u8()?;
        let len = r.u32()?;
        let timestamp = Timestamp {
            sec: r.u32()?,
            usec: r.u32()?,
        };
        let _reserved = r.u16()?;

        if len as usize > MAX_PAYLOAD_SIZE {
            return Err(ProtocolError::FrameTooLarge {
                len: FRAME_HEADER_LEN + len as usize,
                max: FRAME_HEADER_LEN + MAX_PAYLOAD_SIZE,
            });
        }

        Ok(Self {
            addr,
            msg_type,
            subtype,
            len,
            timestamp,
        })
    }

    pub fn write(&self, w: &mut Writer) {
        write_address(w, &self.addr);
        w.put_u8(self.msg_type as u8);
        w.put_u8(self.subtype);
        w.put_u32(self.len);
        w.put_u32(self.timestamp.sec);
        w.put_u32(self.timestamp.usec);
        w.put_u16(0);
    }

    /// Message header carried by this frame (sequence 0).
    pub fn to_header(&self) -> Header {
        Header {
            addr: self.addr,
            msg_type: self.msg_type,
            subtype: self.subtype,
            timestamp: self.timestamp,
            seq: 0,
        }
    }
}

/// Read a 10-byte address.
pub fn read_address(r: &mut Reader<'_>) -> Result<Address, ProtocolError> {
    Ok(Address {
        host: r.u32()?,
        robot: r.u16()?,
        interf: r.u16()?,
        index: r.u16()?,
    })
}

/// Write a 10-byte address.
pub fn write_address(w: &mut Writer, addr: &Address) {
    w.put_u32(addr.host);
    w.put_u16(addr.robot);
    w.put_u16(addr.interf);
    w.put_u16(addr.index);
}
