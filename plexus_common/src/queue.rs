//! Bounded per-consumer message queues.
//!
//! Every consumer (driver inbox, client session) owns exactly one
//! [`MessageQueue`]. Producers push copies; the consumer pops. Two
//! disciplines exist:
//!
//! - [`Discipline::Overwrite`]: a DATA/CMD push replaces any unconsumed
//!   message with the same `(address, type, subtype)`. When the queue is
//!   full the oldest DATA/CMD message is evicted instead of failing.
//! - [`Discipline::Fifo`]: never drops; a push beyond capacity returns
//!   [`QueueError::Overflow`] to the producer.
//!
//! REQ, RESP and SYNCH messages are always lossless, whatever the
//! discipline.

use parking_lot::{Condvar, Mutex};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::ops::Deref;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use thiserror::Error;

use crate::consts::DEFAULT_QUEUE_CAPACITY;
use crate::message::Message;

/// Queue errors visible to producers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum QueueError {
    /// Lossless queue is at capacity.
    #[error("queue {queue} overflow (capacity {capacity})")]
    Overflow {
        /// Queue that rejected the push.
        queue: QueueId,
        /// Its bound.
        capacity: usize,
    },

    /// The consumer has gone away.
    #[error("queue {0} is closed")]
    Closed(QueueId),
}

/// Replacement discipline, declared per address at registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Discipline {
    /// Latest-value: newer DATA/CMD replaces the unconsumed older one.
    #[default]
    Overwrite,
    /// Lossless: never drops, overflow is an error.
    Fifo,
}

/// What a successful push did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    /// Appended without touching existing messages.
    Appended,
    /// Replaced an unconsumed message with the same key.
    Replaced,
    /// Queue was full; the oldest replaceable message was dropped.
    Evicted,
}

/// Process-unique queue identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct QueueId(u64);

impl QueueId {
    fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }

    /// Raw numeric id.
    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for QueueId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "q{}", self.0)
    }
}

#[derive(Default)]
struct QueueState {
    items: VecDeque<Message>,
    interrupted: bool,
    closed: bool,
}

/// Bounded, ordered message channel owned by a single consumer.
pub struct MessageQueue {
    id: QueueId,
    capacity: usize,
    discipline: Discipline,
    state: Mutex<QueueState>,
    ready: Condvar,
}

impl MessageQueue {
    /// Create a queue with the given bound and default discipline.
    pub fn new(capacity: usize, discipline: Discipline) -> Self {
        Self {
            id: QueueId::next(),
            capacity: capacity.max(1),
            discipline,
            state: Mutex::new(QueueState::default()),
            ready: Condvar::new(),
        }
    }

    /// Wrap in a shareable handle.
    pub fn into_handle(self) -> QueueHandle {
        QueueHandle(Arc::new(self))
    }

    pub fn id(&self) -> QueueId {
        self.id
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn discipline(&self) -> Discipline {
        self.discipline
    }

    pub fn len(&self) -> usize {
        self.state.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.lock().items.is_empty()
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    /// Push under this queue's default discipline.
    pub fn push(&self, msg: Message) -> Result<PushOutcome, QueueError> {
        self.push_with(msg, self.discipline)
    }

    /// Push under an explicit discipline.
    pub fn push_with(&self, msg: Message, discipline: Discipline) -> Result<PushOutcome, QueueError> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(QueueError::Closed(self.id));
        }

        let overwrite =
            discipline == Discipline::Overwrite && msg.header.msg_type.is_replaceable();

        let outcome = if overwrite
            && let Some(pos) = state.items.iter().position(|m| same_key(m, &msg))
        {
            state.items.remove(pos);
            PushOutcome::Replaced
        } else if state.items.len() < self.capacity {
            PushOutcome::Appended
        } else if overwrite
            && let Some(pos) = state
                .items
                .iter()
                .position(|m| m.header.msg_type.is_replaceable())
        {
            state.items.remove(pos);
            PushOutcome::Evicted
        } else {
            return Err(QueueError::Overflow {
                queue: self.id,
                capacity: self.capacity,
            });
        };

        state.items.push_back(msg);
        drop(state);
        // Waiters filter with different predicates; each must re-check.
        self.ready.notify_all();
        Ok(outcome)
    }

    /// Pop the head without waiting.
    pub fn try_pop(&self) -> Option<Message> {
        self.state.lock().items.pop_front()
    }

    /// Wait up to `timeout` for a message.
    ///
    /// Returns `None` on timeout, on [`interrupt`](Self::interrupt), or
    /// when the queue is closed and empty.
    pub fn pop_blocking(&self, timeout: Duration) -> Option<Message> {
        self.pop_matching(|_| true, timeout)
    }

    /// Wait up to `timeout` for the first message satisfying `pred`.
    ///
    /// Non-matching messages stay queued in their original order.
    pub fn pop_matching<F>(&self, mut pred: F, timeout: Duration) -> Option<Message>
    where
        F: FnMut(&Message) -> bool,
    {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock();
        loop {
            if let Some(pos) = state.items.iter().position(&mut pred) {
                return state.items.remove(pos);
            }
            if state.interrupted {
                state.interrupted = false;
                return None;
            }
            if state.closed {
                return None;
            }
            if self.ready.wait_until(&mut state, deadline).timed_out() {
                return state
                    .items
                    .iter()
                    .position(&mut pred)
                    .and_then(|pos| state.items.remove(pos));
            }
        }
    }

    /// Remove and return everything, in arrival order.
    pub fn drain(&self) -> Vec<Message> {
        self.state.lock().items.drain(..).collect()
    }

    /// Wake a blocked consumer; its pending pop returns `None`.
    ///
    /// The interrupt is consumed by exactly one pop.
    pub fn interrupt(&self) {
        self.state.lock().interrupted = true;
        self.ready.notify_all();
    }

    /// Drop a pending interrupt that nobody consumed.
    pub fn clear_interrupt(&self) {
        self.state.lock().interrupted = false;
    }

    /// Refuse further pushes and wake every waiter.
    pub fn close(&self) {
        self.state.lock().closed = true;
        self.ready.notify_all();
    }
}

impl Default for MessageQueue {
    fn default() -> Self {
        Self::new(DEFAULT_QUEUE_CAPACITY, Discipline::default())
    }
}

impl fmt::Debug for MessageQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MessageQueue")
            .field("id", &self.id)
            .field("capacity", &self.capacity)
            .field("discipline", &self.discipline)
            .field("len", &self.len())
            .finish()
    }
}

fn same_key(a: &Message, b: &Message) -> bool {
    a.header.addr == b.header.addr
        && a.header.msg_type == b.header.msg_type
        && a.header.subtype == b.header.subtype
}

/// Shared handle to a queue, compared by identity.
#[derive(Clone)]
pub struct QueueHandle(Arc<MessageQueue>);

impl QueueHandle {
    /// Convenience constructor.
    pub fn new(capacity: usize, discipline: Discipline) -> Self {
        MessageQueue::new(capacity, discipline).into_handle()
    }
}

impl Deref for QueueHandle {
    type Target = MessageQueue;

    fn deref(&self) -> &MessageQueue {
        &self.0
    }
}

impl PartialEq for QueueHandle {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl Eq for QueueHandle {}

impl Hash for QueueHandle {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.0.id.hash(state);
    }
}

impl fmt::Debug for QueueHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "QueueHandle({})", self.0.id)
    }
}
