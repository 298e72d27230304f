//! Network wire codec.
//!
//! Every frame is a fixed 26-byte big-endian [`FrameHeader`] followed by a
//! payload whose layout is fixed per `(interface, type, subtype)` key.
//! There is no schema negotiation and no implicit padding.
//!
//! - `frame`: frame header layout.
//! - `cursor`: bounds-checked big-endian reader/writer.
//! - `payload`: typed payloads and their per-key layouts.
//! - `codec`: whole-message encode/decode.

pub mod codec;
pub mod cursor;
pub mod frame;
pub mod payload;

pub use codec::{decode, decode_payload, decode_with_header, encode};
pub use frame::FrameHeader;
pub use payload::Payload;

use thiserror::Error;

use crate::message::MsgType;

/// Malformed or unsupported wire data.
///
/// Fatal to the offending client connection only.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    /// Fewer bytes than a field requires.
    #[error("truncated: needed {needed} bytes, {available} available")]
    Truncated {
        /// Bytes the next field needs.
        needed: usize,
        /// Bytes left in the buffer.
        available: usize,
    },

    /// Declared length disagrees with the bytes actually present.
    #[error("length mismatch: declared {declared}, actual {actual}")]
    LengthMismatch {
        /// Length the header or layout declares.
        declared: usize,
        /// Length actually present.
        actual: usize,
    },

    /// An element-count prefix exceeds the layout's bound.
    #[error("count {count} exceeds maximum {max}")]
    CountOutOfRange {
        /// Declared count.
        count: usize,
        /// Layout bound.
        max: usize,
    },

    /// No layout is defined for this key.
    #[error("no layout for interface {interf} {msg_type} subtype {subtype}")]
    UnknownLayout {
        /// Interface code.
        interf: u16,
        /// Message type.
        msg_type: MsgType,
        /// Subtype.
        subtype: u8,
    },

    /// Message type byte is not a known type.
    #[error("unknown message type {0}")]
    UnknownMsgType(u8),

    /// Frame exceeds the maximum message size.
    #[error("frame of {len} bytes exceeds maximum {max}")]
    FrameTooLarge {
        /// Frame length.
        len: usize,
        /// Maximum allowed.
        max: usize,
    },

    /// Bytes left over after a complete payload.
    #[error("{0} trailing bytes after payload")]
    TrailingBytes(usize),

    /// A field holds a value outside its domain.
    #[error("invalid {field} value {value}")]
    InvalidValue {
        /// Field name.
        field: &'static str,
        /// Offending raw value.
        value: u32,
    },
}
