//! Message routing: publish / fan-out, put to a driver's inbox, explicit
//! replies and subscription bookkeeping.
//!
//! The dispatcher never answers a request on its own; a reply only ever
//! comes from an explicit [`Dispatcher::reply`] by the driver that
//! handled the request.

use plexus_common::address::{Address, MatchPolicy};
use plexus_common::consts::MAX_PAYLOAD_SIZE;
use plexus_common::message::{Header, Message, MsgType, Timestamp};
use plexus_common::queue::{Discipline, QueueError, QueueHandle};
use plexus_common::wire::Payload;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, trace, warn};

use crate::device_registry::{DeviceRegistry, RegistryError};
use crate::lifecycle::LifecycleError;

/// Routing errors.
#[derive(Debug, Error)]
pub enum DispatchError {
    /// No device is bound at the address.
    #[error("no device at {0}")]
    UnknownAddress(Address),

    /// A reply was requested for a message without a reply route.
    #[error("message carries no reply queue")]
    NoReplyQueue,

    /// Replies must be RESP_ACK or RESP_NACK.
    #[error("{0} is not a reply type")]
    InvalidReplyType(MsgType),

    /// Payload would not fit in one frame.
    #[error("payload of {size} bytes exceeds maximum {max}")]
    PayloadTooLarge {
        /// Encoded payload size.
        size: usize,
        /// Maximum payload size.
        max: usize,
    },

    /// Some lossless subscriber queues were full.
    #[error("{failed} subscriber queue(s) of {addr} overflowed ({delivered} delivered)")]
    QueueOverflow {
        /// Publishing address.
        addr: Address,
        /// Queues that rejected the message.
        failed: usize,
        /// Queues that accepted it.
        delivered: usize,
    },

    /// Single-queue push failed.
    #[error(transparent)]
    Queue(#[from] QueueError),

    /// Subscribe / unsubscribe transition failed.
    #[error(transparent)]
    Lifecycle(#[from] LifecycleError),

    /// No reply arrived in time.
    #[error("no reply from {target} within {timeout:?}")]
    Timeout {
        /// Address the request was sent to.
        target: Address,
        /// How long we waited.
        timeout: Duration,
    },
}

impl From<RegistryError> for DispatchError {
    fn from(e: RegistryError) -> Self {
        match e {
            RegistryError::UnknownAddress(a) | RegistryError::DuplicateAddress(a) => {
                Self::UnknownAddress(a)
            }
        }
    }
}

impl DispatchError {
    /// `true` when a single message could not be delivered to its peer
    /// (queue gone or full, device unbound, reply route missing). Such
    /// failures concern that message only and never the sender's device.
    pub fn is_delivery(&self) -> bool {
        matches!(
            self,
            Self::UnknownAddress(_)
                | Self::NoReplyQueue
                | Self::PayloadTooLarge { .. }
                | Self::QueueOverflow { .. }
                | Self::Queue(_)
                | Self::Timeout { .. }
        )
    }
}

/// Cheaply cloneable router over one [`DeviceRegistry`].
#[derive(Clone)]
pub struct Dispatcher {
    registry: Arc<DeviceRegistry>,
    seq: Arc<AtomicU64>,
}

impl Dispatcher {
    pub fn new(registry: Arc<DeviceRegistry>) -> Self {
        Self {
            registry,
            seq: Arc::new(AtomicU64::new(1)),
        }
    }

    pub fn registry(&self) -> &Arc<DeviceRegistry> {
        &self.registry
    }

    pub fn policy(&self) -> MatchPolicy {
        self.registry.policy()
    }

    fn header(&self, addr: Address, msg_type: MsgType, subtype: u8, ts: Option<Timestamp>) -> Header {
        Header {
            addr,
            msg_type,
            subtype,
            timestamp: ts.unwrap_or_else(Timestamp::now),
            seq: self.seq.fetch_add(1, Ordering::Relaxed),
        }
    }

    fn check_size(payload: &Payload) -> Result<(), DispatchError> {
        let size = payload.encoded_len();
        if size > MAX_PAYLOAD_SIZE {
            return Err(DispatchError::PayloadTooLarge {
                size,
                max: MAX_PAYLOAD_SIZE,
            });
        }
        Ok(())
    }

    /// Fan a message out to every current subscriber of `addr`.
    ///
    /// The subscriber set is snapshotted once under the registry lock, so
    /// a concurrent subscribe either sees the whole message or none of it.
    /// Returns the number of queues that accepted the message.
    pub fn publish(
        &self,
        addr: &Address,
        msg_type: MsgType,
        subtype: u8,
        payload: Payload,
        timestamp: Option<Timestamp>,
    ) -> Result<usize, DispatchError> {
        Self::check_size(&payload)?;
        let fanout = self
            .registry
            .subscribers(addr)
            .ok_or(DispatchError::UnknownAddress(*addr))?;

        let msg = Message::new(self.header(*addr, msg_type, subtype, timestamp), payload);
        let mut delivered = 0;
        let mut failed = 0;
        for queue in &fanout.queues {
            match queue.push_with(msg.clone(), fanout.discipline) {
                Ok(_) => delivered += 1,
                Err(QueueError::Closed(id)) => {
                    trace!(addr = %addr, queue = %id, "Skipping closed subscriber queue");
                }
                Err(e) => {
                    debug!(addr = %addr, "{}", e);
                    failed += 1;
                }
            }
        }

        if failed > 0 {
            return Err(DispatchError::QueueOverflow {
                addr: *addr,
                failed,
                delivered,
            });
        }
        Ok(delivered)
    }

    /// Push a message onto one specific queue (used for replies).
    pub fn publish_to(
        &self,
        queue: &QueueHandle,
        addr: &Address,
        msg_type: MsgType,
        subtype: u8,
        payload: Payload,
    ) -> Result<(), DispatchError> {
        Self::check_size(&payload)?;
        let msg = Message::new(self.header(*addr, msg_type, subtype, None), payload);
        queue.push_with(msg, Discipline::Fifo)?;
        Ok(())
    }

    /// Answer a request on its reply queue.
    ///
    /// The reply carries the request's address and subtype.
    pub fn reply(
        &self,
        request: &Header,
        reply_to: &QueueHandle,
        msg_type: MsgType,
        payload: Payload,
    ) -> Result<(), DispatchError> {
        if !msg_type.is_response() {
            return Err(DispatchError::InvalidReplyType(msg_type));
        }
        self.publish_to(reply_to, &request.addr, msg_type, request.subtype, payload)
    }

    /// Enqueue a message onto the inbox of the driver owning `target`.
    ///
    /// Replaceable messages follow the discipline declared for `target`.
    pub fn put_msg(
        &self,
        target: &Address,
        msg_type: MsgType,
        subtype: u8,
        payload: Payload,
        reply_to: Option<QueueHandle>,
    ) -> Result<(), DispatchError> {
        Self::check_size(&payload)?;
        let (bound, driver) = self
            .registry
            .resolve(target)
            .ok_or(DispatchError::UnknownAddress(*target))?;
        let discipline = self.registry.discipline(&bound).unwrap_or_default();

        let mut msg = Message::new(self.header(bound, msg_type, subtype, None), payload);
        msg.reply_to = reply_to;
        driver.inbox().push_with(msg, discipline)?;
        Ok(())
    }

    /// Send a REQ from `requester` and wait for the matching RESP.
    ///
    /// Messages that are not the reply stay on `requester` in order.
    pub fn request(
        &self,
        requester: &QueueHandle,
        target: &Address,
        subtype: u8,
        payload: Payload,
        timeout: Duration,
    ) -> Result<Message, DispatchError> {
        self.put_msg(
            target,
            MsgType::Req,
            subtype,
            payload,
            Some(requester.clone()),
        )?;
        let policy = self.policy();
        requester
            .pop_matching(
                |m| {
                    m.header.msg_type.is_response()
                        && m.header.subtype == subtype
                        && policy.matches(&m.header.addr, target)
                },
                timeout,
            )
            .ok_or(DispatchError::Timeout {
                target: *target,
                timeout,
            })
    }

    /// Subscribe `queue` to `addr`.
    ///
    /// Starts the owning driver on its first subscription. The
    /// subscription edge is added only after a successful setup, so a
    /// failed subscribe leaves no trace.
    pub fn subscribe(&self, addr: &Address, queue: &QueueHandle) -> Result<(), DispatchError> {
        let (bound, driver) = self
            .registry
            .resolve(addr)
            .ok_or(DispatchError::UnknownAddress(*addr))?;
        driver.subscribe(&bound, self)?;
        if let Err(e) = self.registry.add_edge(&bound, queue) {
            // Unregistered in between: give the count back.
            if let Err(release) = driver.unsubscribe(&bound) {
                warn!(addr = %bound, "{}", release);
            }
            return Err(e.into());
        }
        debug!(addr = %bound, queue = %queue.id(), driver = driver.name(), "Queue subscribed");
        Ok(())
    }

    /// Release one subscription of `queue` to `addr`.
    ///
    /// The edge is removed before the count drops, so no message is
    /// fanned to `queue` once the driver starts shutting down.
    pub fn unsubscribe(&self, addr: &Address, queue: &QueueHandle) -> Result<(), DispatchError> {
        let (bound, driver) = self
            .registry
            .resolve(addr)
            .ok_or(DispatchError::UnknownAddress(*addr))?;
        if !self.registry.remove_edge(&bound, queue)? {
            return Err(LifecycleError::NotSubscribed { addr: bound }.into());
        }
        driver.unsubscribe(&bound)?;
        debug!(addr = %bound, queue = %queue.id(), driver = driver.name(), "Queue unsubscribed");
        Ok(())
    }

    /// Server-internal subscription with no queue (always-on drivers).
    pub fn subscribe_internal(&self, addr: &Address) -> Result<(), DispatchError> {
        let (bound, driver) = self
            .registry
            .resolve(addr)
            .ok_or(DispatchError::UnknownAddress(*addr))?;
        driver.subscribe(&bound, self)?;
        Ok(())
    }
}
