//! Data delivery modes for client sessions.
//!
//! A session queue mixes replies with device data. Replies go out as soon
//! as they are queued; data is grouped into rounds according to the
//! session's [`DataMode`], and each round (except in `PushAsync` mode)
//! ends with a bodiless SYNCH frame on `player:0`.

use parking_lot::Mutex;
use plexus_common::address::Address;
use plexus_common::interface::{DataMode, PLAYER};
use plexus_common::message::{Header, Message, MsgType, Timestamp};
use plexus_common::queue::QueueHandle;
use plexus_common::wire::Payload;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;
use tracing::trace;

#[derive(Debug, Default)]
struct State {
    mode: DataMode,
    /// A pull-mode client asked for a round.
    requested: bool,
    /// Bound addresses whose data the client may read.
    readable: BTreeSet<Address>,
}

/// Delivery settings shared by a session's reader and writer.
#[derive(Debug, Clone, Default)]
pub struct Delivery(Arc<Mutex<State>>);

impl Delivery {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn mode(&self) -> DataMode {
        self.0.lock().mode
    }

    /// Switch mode. A round requested under the old mode is dropped.
    pub fn set_mode(&self, mode: DataMode) {
        let mut state = self.0.lock();
        state.mode = mode;
        state.requested = false;
    }

    /// Ask for one round. Returns `false` outside the pull modes, where
    /// rounds are sent unasked.
    pub fn request_round(&self) -> bool {
        let mut state = self.0.lock();
        state.requested = state.mode.is_pull();
        state.requested
    }

    pub fn set_readable(&self, addr: Address, readable: bool) {
        let mut state = self.0.lock();
        if readable {
            state.readable.insert(addr);
        } else {
            state.readable.remove(&addr);
        }
    }

    pub fn is_readable(&self, addr: &Address) -> bool {
        self.0.lock().readable.contains(addr)
    }

    pub fn clear_readable(&self) {
        self.0.lock().readable.clear();
    }

    fn take_request(&self) -> bool {
        std::mem::take(&mut self.0.lock().requested)
    }
}

type Key = (Address, u8);

fn key(msg: &Message) -> Key {
    (msg.header.addr, msg.header.subtype)
}

fn is_data(msg: &Message) -> bool {
    msg.header.msg_type == MsgType::Data
}

/// The frame that closes a round.
pub fn synch() -> Message {
    Message::new(
        Header::new(Address::local(PLAYER, 0), MsgType::Synch, 0).at(Timestamp::now()),
        Payload::Empty,
    )
}

/// Writer-side batching of one session queue into frames.
pub struct Rounds {
    delivery: Delivery,
    /// Latest data per (address, subtype), repeated by the `*All` modes.
    latest: BTreeMap<Key, Message>,
}

impl Rounds {
    pub fn new(delivery: Delivery) -> Self {
        Self {
            delivery,
            latest: BTreeMap::new(),
        }
    }

    /// Wait up to `timeout` for something to write.
    ///
    /// Returns the frames in write order; empty when nothing is due.
    pub fn next(&mut self, queue: &QueueHandle, timeout: Duration) -> Vec<Message> {
        let mode = self.delivery.mode();
        let mut out = Vec::new();
        if mode.is_pull() {
            // Data waits for a request; replies do not.
            if let Some(reply) = queue.pop_matching(|m| !is_data(m), timeout) {
                out.push(reply);
            }
            if self.delivery.take_request() {
                self.round(queue, mode, None, &mut out);
            }
        } else {
            match queue.pop_blocking(timeout) {
                Some(msg) if is_data(&msg) => self.round(queue, mode, Some(msg), &mut out),
                Some(msg) => out.push(msg),
                None => {}
            }
        }
        out
    }

    fn round(
        &mut self,
        queue: &QueueHandle,
        mode: DataMode,
        first: Option<Message>,
        out: &mut Vec<Message>,
    ) {
        let mut fresh: Vec<Message> = first.into_iter().collect();
        while let Some(msg) = queue.pop_matching(is_data, Duration::ZERO) {
            fresh.push(msg);
        }
        let delivery = &self.delivery;
        fresh.retain(|m| delivery.is_readable(&m.header.addr));

        let before = out.len();
        if mode.sends_all() {
            self.latest.retain(|(addr, _), _| delivery.is_readable(addr));
            let fresh_keys: BTreeSet<Key> = fresh.iter().map(key).collect();
            out.extend(
                self.latest
                    .iter()
                    .filter(|(k, _)| !fresh_keys.contains(k))
                    .map(|(_, m)| m.clone()),
            );
            for msg in &fresh {
                self.latest.insert(key(msg), msg.clone());
            }
        }
        out.extend(fresh);

        // An unasked round with nothing readable is not a round.
        if out.len() == before && !mode.is_pull() {
            return;
        }
        trace!(mode = %mode, frames = out.len() - before, "Data round");
        if mode.synchs() {
            out.push(synch());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use plexus_common::interface::{LASER, POSITION};
    use plexus_common::queue::Discipline;

    const SHORT: Duration = Duration::from_millis(10);

    fn data(addr: Address, tag: u8) -> Message {
        Message::new(
            Header::new(addr, MsgType::Data, 1).at(Timestamp::new(1, tag as u32)),
            Payload::Opaque(vec![tag]),
        )
    }

    fn ack(addr: Address) -> Message {
        Message::new(Header::new(addr, MsgType::RespAck, 1), Payload::Empty)
    }

    fn kinds(frames: &[Message]) -> Vec<MsgType> {
        frames.iter().map(|m| m.header.msg_type).collect()
    }

    fn setup(mode: DataMode, readable: &[Address]) -> (Rounds, Delivery, QueueHandle) {
        let delivery = Delivery::new();
        delivery.set_mode(mode);
        for addr in readable {
            delivery.set_readable(*addr, true);
        }
        (
            Rounds::new(delivery.clone()),
            delivery,
            QueueHandle::new(8, Discipline::Overwrite),
        )
    }

    #[test]
    fn push_new_round_ends_with_synch() {
        let pos = Address::local(POSITION, 0);
        let laser = Address::local(LASER, 0);
        let (mut rounds, _d, q) = setup(DataMode::PushNew, &[pos, laser]);
        q.push(data(pos, 1)).unwrap();
        q.push(data(laser, 2)).unwrap();

        let frames = rounds.next(&q, SHORT);
        assert_eq!(kinds(&frames), vec![MsgType::Data, MsgType::Data, MsgType::Synch]);
        let synch = frames.last().unwrap();
        assert_eq!(synch.header.addr, Address::local(PLAYER, 0));
        assert_eq!(synch.payload, Payload::Empty);

        // Nothing new, nothing sent.
        assert!(rounds.next(&q, SHORT).is_empty());
    }

    #[test]
    fn replies_are_never_batched() {
        let pos = Address::local(POSITION, 0);
        let (mut rounds, _d, q) = setup(DataMode::PushNew, &[pos]);
        q.push(ack(pos)).unwrap();
        assert_eq!(kinds(&rounds.next(&q, SHORT)), vec![MsgType::RespAck]);
    }

    #[test]
    fn unreadable_data_is_dropped() {
        let pos = Address::local(POSITION, 0);
        let (mut rounds, d, q) = setup(DataMode::PushNew, &[]);
        q.push(data(pos, 1)).unwrap();
        assert!(rounds.next(&q, SHORT).is_empty());
        assert!(q.is_empty());

        d.set_readable(pos, true);
        q.push(data(pos, 2)).unwrap();
        assert_eq!(rounds.next(&q, SHORT).len(), 2);
    }

    #[test]
    fn push_async_sends_no_synch() {
        let pos = Address::local(POSITION, 0);
        let (mut rounds, _d, q) = setup(DataMode::PushAsync, &[pos]);
        q.push(data(pos, 1)).unwrap();
        assert_eq!(kinds(&rounds.next(&q, SHORT)), vec![MsgType::Data]);
    }

    #[test]
    fn pull_mode_holds_data_until_requested() {
        let pos = Address::local(POSITION, 0);
        let (mut rounds, d, q) = setup(DataMode::PullNew, &[pos]);
        q.push(data(pos, 1)).unwrap();
        q.push(ack(pos)).unwrap();

        // The reply overtakes the held data.
        assert_eq!(kinds(&rounds.next(&q, SHORT)), vec![MsgType::RespAck]);
        assert!(rounds.next(&q, SHORT).is_empty());
        assert_eq!(q.len(), 1);

        assert!(d.request_round());
        let frames = rounds.next(&q, SHORT);
        assert_eq!(kinds(&frames), vec![MsgType::Data, MsgType::Synch]);
        assert_eq!(frames[0].payload, Payload::Opaque(vec![1]));

        // A requested round with no data is still closed by a SYNCH.
        assert!(d.request_round());
        assert_eq!(kinds(&rounds.next(&q, SHORT)), vec![MsgType::Synch]);
    }

    #[test]
    fn pull_all_repeats_latest_value() {
        let pos = Address::local(POSITION, 0);
        let laser = Address::local(LASER, 0);
        let (mut rounds, d, q) = setup(DataMode::PullAll, &[pos, laser]);
        q.push(data(pos, 1)).unwrap();
        q.push(data(laser, 2)).unwrap();
        d.request_round();
        assert_eq!(rounds.next(&q, SHORT).len(), 3);

        q.push(data(laser, 3)).unwrap();
        d.request_round();
        let frames = rounds.next(&q, SHORT);
        let tags: Vec<Payload> = frames.iter().map(|m| m.payload.clone()).collect();
        assert_eq!(
            tags,
            vec![Payload::Opaque(vec![1]), Payload::Opaque(vec![3]), Payload::Empty]
        );
    }

    #[test]
    fn round_requests_only_count_in_pull_modes() {
        let d = Delivery::new();
        assert_eq!(d.mode(), DataMode::PushNew);
        assert!(!d.request_round());
        d.set_mode(DataMode::PullNew);
        assert!(d.request_round());
        d.set_mode(DataMode::PushAll);
        assert!(!d.take_request());
    }
}
