//! Whole-message encode / decode.
//!
//! `decode(encode(m)) == m` for every supported key, with two caveats:
//! the sequence number is server-local and decodes as 0, and reply
//! routes never travel on the wire.

use super::ProtocolError;
use super::cursor::Writer;
use super::frame::FrameHeader;
use super::payload::{Layout, Payload};
use crate::consts::{FRAME_HEADER_LEN, MAX_MESSAGE_SIZE};
use crate::message::{Header, Message, MsgType};

/// Resolve the layout for a key or fail with `UnknownLayout`.
fn layout_of(header: &Header, empty_body: bool) -> Result<Layout, ProtocolError> {
    Layout::for_key(
        header.addr.interf,
        header.msg_type,
        header.subtype,
        empty_body,
    )
    .ok_or(ProtocolError::UnknownLayout {
        interf: header.addr.interf,
        msg_type: header.msg_type,
        subtype: header.subtype,
    })
}

/// Encode a message into one frame.
///
/// Fails if the payload variant does not match the layout of the
/// message's key, or if the frame would exceed [`MAX_MESSAGE_SIZE`].
pub fn encode(msg: &Message) -> Result<Vec<u8>, ProtocolError> {
    let layout = layout_of(&msg.header, msg.payload.is_empty())?;
    if layout != msg.payload.layout() {
        return Err(ProtocolError::UnknownLayout {
            interf: msg.header.addr.interf,
            msg_type: msg.header.msg_type,
            subtype: msg.header.subtype,
        });
    }

    let body_len = msg.payload.encoded_len();
    let total = FRAME_HEADER_LEN + body_len;
    if total > MAX_MESSAGE_SIZE {
        return Err(ProtocolError::FrameTooLarge {
            len: total,
            max: MAX_MESSAGE_SIZE,
        });
    }

    let mut w = Writer::with_capacity(total);
    FrameHeader::for_message(&msg.header, body_len).write(&mut w);
    msg.payload.write(&mut w)?;
    debug_assert_eq!(w.len(), total);
    Ok(w.into_inner())
}

/// Decode one complete frame.
pub fn decode(frame: &[u8]) -> Result<Message, ProtocolError> {
    if frame.len() > MAX_MESSAGE_SIZE {
        return Err(ProtocolError::FrameTooLarge {
            len: frame.len(),
            max: MAX_MESSAGE_SIZE,
        });
    }
    let header = FrameHeader::read(frame)?;
    decode_with_header(&header, &frame[FRAME_HEADER_LEN..])
}

/// Decode a body whose frame header has already been read.
pub fn decode_with_header(header: &FrameHeader, body: &[u8]) -> Result<Message, ProtocolError> {
    if header.len as usize != body.len() {
        return Err(ProtocolError::LengthMismatch {
            declared: header.len as usize,
            actual: body.len(),
        });
    }
    let payload = decode_payload(header.addr.interf, header.msg_type, header.subtype, body)?;
    Ok(Message::new(header.to_header(), payload))
}

/// Decode a payload body for the given key.
pub fn decode_payload(
    interf: u16,
    msg_type: MsgType,
    subtype: u8,
    body: &[u8],
) -> Result<Payload, ProtocolError> {
    let layout = Layout::for_key(interf, msg_type, subtype, body.is_empty()).ok_or(
        ProtocolError::UnknownLayout {
            interf,
            msg_type,
            subtype,
        },
    )?;
    Payload::read(layout, body)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address::Address;
    use crate::interface::{LASER, POSITION, position};
    use crate::message::Timestamp;
    use crate::wire::payload::{PositionCmd, PowerData};

    fn msg(interf: u16, msg_type: MsgType, subtype: u8, payload: Payload) -> Message {
        Message::new(
            Header::new(Address::local(interf, 0), msg_type, subtype).at(Timestamp::new(5, 6)),
            payload,
        )
    }

    #[test]
    fn mismatched_variant_is_refused() {
        let m = msg(
            POSITION,
            MsgType::Cmd,
            position::CMD_STATE,
            Payload::Power(PowerData { charge: 1 }),
        );
        assert!(matches!(
            encode(&m),
            Err(ProtocolError::UnknownLayout { .. })
        ));
    }

    #[test]
    fn header_length_must_match_body() {
        let m = msg(
            POSITION,
            MsgType::Cmd,
            position::CMD_STATE,
            Payload::PositionCmd(PositionCmd::default()),
        );
        let mut bytes = encode(&m).unwrap();
        bytes.push(0);
        assert!(matches!(
            decode(&bytes),
            Err(ProtocolError::LengthMismatch { .. })
        ));
    }

    #[test]
    fn unknown_key_is_refused() {
        let m = msg(LASER, MsgType::Cmd, 9, Payload::Empty);
        assert!(matches!(
            encode(&m),
            Err(ProtocolError::UnknownLayout { .. })
        ));
    }

    #[test]
    fn oversized_opaque_frame_is_refused() {
        let m = msg(
            crate::interface::OPAQUE,
            MsgType::Data,
            1,
            Payload::Opaque(vec![0; MAX_MESSAGE_SIZE]),
        );
        assert!(matches!(
            encode(&m),
            Err(ProtocolError::FrameTooLarge { .. })
        ));
    }
}
