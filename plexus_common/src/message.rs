//! Message envelope shared by every data, command, request and reply.
//!
//! A [`Message`] is immutable once enqueued. Fan-out clones the whole
//! message (payload included), so each queue owns its own copy.

use std::fmt;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use crate::address::Address;
use crate::queue::QueueHandle;
use crate::wire::payload::Payload;

/// Message type carried in every header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MsgType {
    /// Periodic data from a device.
    Data = 1,
    /// Command to a device.
    Cmd = 2,
    /// Configuration request (expects a reply).
    Req = 3,
    /// Positive reply to a request.
    RespAck = 4,
    /// Synchronization marker.
    Synch = 5,
    /// Negative reply to a request.
    RespNack = 6,
}

impl MsgType {
    /// Convert from the wire byte. Returns `None` for invalid values.
    #[inline]
    pub const fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(Self::Data),
            2 => Some(Self::Cmd),
            3 => Some(Self::Req),
            4 => Some(Self::RespAck),
            5 => Some(Self::Synch),
            6 => Some(Self::RespNack),
            _ => None,
        }
    }

    /// True for RESP_ACK and RESP_NACK.
    #[inline]
    pub const fn is_response(self) -> bool {
        matches!(self, Self::RespAck | Self::RespNack)
    }

    /// True for types that may be replaced under latest-value discipline.
    #[inline]
    pub const fn is_replaceable(self) -> bool {
        matches!(self, Self::Data | Self::Cmd)
    }
}

impl fmt::Display for MsgType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Data => "DATA",
            Self::Cmd => "CMD",
            Self::Req => "REQ",
            Self::RespAck => "RESP_ACK",
            Self::Synch => "SYNCH",
            Self::RespNack => "RESP_NACK",
        };
        f.write_str(s)
    }
}

/// Wall-clock timestamp with microsecond resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Timestamp {
    /// Seconds since the Unix epoch.
    pub sec: u32,
    /// Microseconds within the second.
    pub usec: u32,
}

impl Timestamp {
    /// Create a timestamp from its parts. `usec` is carried into `sec`.
    pub const fn new(sec: u32, usec: u32) -> Self {
        Self {
            sec: sec + usec / 1_000_000,
            usec: usec % 1_000_000,
        }
    }

    /// Current server time.
    pub fn now() -> Self {
        let d = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        Self::from_duration(d)
    }

    /// Convert a duration since the epoch.
    pub fn from_duration(d: Duration) -> Self {
        Self {
            sec: d.as_secs() as u32,
            usec: d.subsec_micros(),
        }
    }

    /// Time since the epoch.
    pub fn as_duration(&self) -> Duration {
        Duration::new(self.sec as u64, self.usec * 1_000)
    }

    /// Age of this timestamp relative to `now`, saturating at zero.
    pub fn age(&self, now: Timestamp) -> Duration {
        now.as_duration().saturating_sub(self.as_duration())
    }
}

/// Message header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Header {
    /// Device the message concerns.
    pub addr: Address,
    /// Message type.
    pub msg_type: MsgType,
    /// Interface-specific subtype.
    pub subtype: u8,
    /// When the data was produced.
    pub timestamp: Timestamp,
    /// Dispatcher-assigned sequence number (server-local, not on the wire).
    pub seq: u64,
}

impl Header {
    /// Header stamped with the current time and sequence 0.
    pub fn new(addr: Address, msg_type: MsgType, subtype: u8) -> Self {
        Self {
            addr,
            msg_type,
            subtype,
            timestamp: Timestamp::now(),
            seq: 0,
        }
    }

    /// Builder-style timestamp override.
    pub fn at(mut self, timestamp: Timestamp) -> Self {
        self.timestamp = timestamp;
        self
    }
}

/// A typed envelope plus payload and optional reply route.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    /// Header.
    pub header: Header,
    /// Owned payload.
    pub payload: Payload,
    /// Queue that receives the reply to a REQ.
    pub reply_to: Option<QueueHandle>,
}

impl Message {
    /// Build a message without a reply route.
    pub fn new(header: Header, payload: Payload) -> Self {
        Self {
            header,
            payload,
            reply_to: None,
        }
    }

    /// Attach a reply route.
    pub fn with_reply(mut self, queue: QueueHandle) -> Self {
        self.reply_to = Some(queue);
        self
    }

    /// Shorthand for [`match_message`] on this message's header.
    pub fn matches(&self, msg_type: Option<MsgType>, subtype: Option<u8>, addr: &Address) -> bool {
        match_message(&self.header, msg_type, subtype, addr)
    }
}

/// Message filter predicate used inside driver message handlers.
///
/// `None` for `msg_type` or `subtype` is a wildcard. The address must
/// match exactly; callers that want policy-based matching compare
/// addresses themselves.
#[inline]
pub fn match_message(
    header: &Header,
    msg_type: Option<MsgType>,
    subtype: Option<u8>,
    addr: &Address,
) -> bool {
    msg_type.is_none_or(|t| t == header.msg_type)
        && subtype.is_none_or(|s| s == header.subtype)
        && header.addr == *addr
}

/// Selector conversions for wire-style `-1` wildcards.
pub struct MsgSelector;

impl MsgSelector {
    /// `-1` → wildcard; otherwise the message type code.
    pub fn msg_type(raw: i32) -> Option<MsgType> {
        u8::try_from(raw).ok().and_then(MsgType::from_u8)
    }

    /// `-1` → wildcard; otherwise the subtype.
    pub fn subtype(raw: i32) -> Option<u8> {
        u8::try_from(raw).ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::interface::{LASER, POSITION};

    fn hdr(msg_type: MsgType, subtype: u8) -> Header {
        Header::new(Address::local(POSITION, 0), msg_type, subtype)
    }

    #[test]
    fn msg_type_wire_codes() {
        for code in 1..=6u8 {
            let t = MsgType::from_u8(code).unwrap();
            assert_eq!(t as u8, code);
        }
        assert!(MsgType::from_u8(0).is_none());
        assert!(MsgType::from_u8(7).is_none());
    }

    #[test]
    fn match_exact() {
        let h = hdr(MsgType::Cmd, 1);
        let addr = Address::local(POSITION, 0);
        assert!(match_message(&h, Some(MsgType::Cmd), Some(1), &addr));
        assert!(!match_message(&h, Some(MsgType::Req), Some(1), &addr));
        assert!(!match_message(&h, Some(MsgType::Cmd), Some(2), &addr));
        assert!(!match_message(
            &h,
            Some(MsgType::Cmd),
            Some(1),
            &Address::local(LASER, 0)
        ));
    }

    #[test]
    fn match_wildcards() {
        let h = hdr(MsgType::Req, 4);
        let addr = Address::local(POSITION, 0);
        assert!(match_message(&h, None, Some(4), &addr));
        assert!(match_message(&h, Some(MsgType::Req), None, &addr));
        assert!(match_message(&h, None, None, &addr));
    }

    #[test]
    fn raw_selector_minus_one_is_wildcard() {
        assert_eq!(MsgSelector::msg_type(-1), None);
        assert_eq!(MsgSelector::msg_type(3), Some(MsgType::Req));
        assert_eq!(MsgSelector::subtype(-1), None);
        assert_eq!(MsgSelector::subtype(2), Some(2));
    }

    #[test]
    fn timestamp_normalizes_and_ages() {
        let t = Timestamp::new(10, 2_500_000);
        assert_eq!(t, Timestamp::new(12, 500_000));
        let later = Timestamp::new(13, 0);
        assert_eq!(t.age(later), Duration::from_millis(500));
        assert_eq!(later.age(t), Duration::ZERO);
    }
}
