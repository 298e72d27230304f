//! Driver capability trait, per-run context and cancellation.
//!
//! This module defines:
//! - `Driver` trait - Interface every device driver implements
//! - `DriverContext` - What a driver sees while it is set up / running
//! - `CancelToken` - Cooperative cancellation with cancellable sleep
//! - `DriverError` enum - Error types for driver operations
//! - `DriverSpec` - Resolved config stanza handed to a driver factory

use parking_lot::{Condvar, Mutex};
use plexus_common::address::Address;
use plexus_common::message::{Message, MsgType, Timestamp};
use plexus_common::queue::{Discipline, QueueHandle};
use plexus_common::wire::{Payload, ProtocolError};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, warn};

use crate::dispatcher::{DispatchError, Dispatcher};

/// Error types for driver operations.
#[derive(Debug, Error)]
pub enum DriverError {
    /// Setup could not bring the device up.
    #[error("Setup failed: {0}")]
    SetupFailed(String),

    /// Unrecoverable fault in the main loop.
    #[error("Runtime fault: {0}")]
    Runtime(String),

    /// Invalid driver options or addresses.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Device I/O failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Malformed device data.
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// A dispatcher call made by the driver failed.
    #[error("Dispatch error: {0}")]
    Dispatch(#[from] Box<DispatchError>),
}

impl From<DispatchError> for DriverError {
    fn from(e: DispatchError) -> Self {
        Self::Dispatch(Box::new(e))
    }
}

/// One `[[driver]]` stanza after address resolution.
#[derive(Debug, Clone, Default)]
pub struct DriverSpec {
    /// Factory name (`"dummy"`, `"relay"`, ...).
    pub name: String,
    /// Addresses this instantiation will bind.
    pub provides: Vec<Address>,
    /// Addresses of other devices it depends on.
    pub requires: Vec<Address>,
    /// Free-form driver options.
    pub options: toml::Table,
}

impl DriverSpec {
    /// Numeric option, accepting integers or floats.
    pub fn option_f64(&self, key: &str) -> Result<Option<f64>, DriverError> {
        match self.options.get(key) {
            None => Ok(None),
            Some(toml::Value::Float(v)) => Ok(Some(*v)),
            Some(toml::Value::Integer(v)) => Ok(Some(*v as f64)),
            Some(other) => Err(DriverError::Config(format!(
                "option '{key}' must be a number, got {}",
                other.type_str()
            ))),
        }
    }

    /// Integer option.
    pub fn option_usize(&self, key: &str) -> Result<Option<usize>, DriverError> {
        match self.options.get(key) {
            None => Ok(None),
            Some(toml::Value::Integer(v)) if *v >= 0 => Ok(Some(*v as usize)),
            Some(other) => Err(DriverError::Config(format!(
                "option '{key}' must be a non-negative integer, got {other}"
            ))),
        }
    }
}

// ─── Cancellation ───────────────────────────────────────────────────

#[derive(Default)]
struct CancelState {
    cancelled: Mutex<bool>,
    wake: Condvar,
}

/// Cooperative cancellation token.
///
/// Checked by the driver at loop top and around blocking calls. Cancelling
/// also interrupts the bound inbox so a blocked `pop_blocking` returns.
#[derive(Clone, Default)]
pub struct CancelToken {
    state: Arc<CancelState>,
    inbox: Option<QueueHandle>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Token that also interrupts `inbox` when cancelled.
    pub fn for_queue(inbox: QueueHandle) -> Self {
        Self {
            state: Arc::default(),
            inbox: Some(inbox),
        }
    }

    pub fn cancel(&self) {
        *self.state.cancelled.lock() = true;
        self.state.wake.notify_all();
        if let Some(inbox) = &self.inbox {
            inbox.interrupt();
        }
    }

    pub fn is_cancelled(&self) -> bool {
        *self.state.cancelled.lock()
    }

    /// Sleep for `period` unless cancelled first.
    ///
    /// Returns `true` if the full period elapsed, `false` on cancellation.
    pub fn sleep(&self, period: Duration) -> bool {
        let deadline = Instant::now() + period;
        let mut cancelled = self.state.cancelled.lock();
        while !*cancelled {
            if self.state.wake.wait_until(&mut cancelled, deadline).timed_out() {
                return !*cancelled;
            }
        }
        false
    }
}

// ─── Context ────────────────────────────────────────────────────────

/// Everything a driver may touch while set up or running.
///
/// Built fresh for every Idle → Running transition and handed to
/// `setup`, `run` and `shutdown` of that run.
pub struct DriverContext {
    name: String,
    addresses: Vec<Address>,
    inbox: QueueHandle,
    dispatcher: Dispatcher,
    cancel: CancelToken,
}

impl DriverContext {
    pub fn new(
        name: impl Into<String>,
        addresses: Vec<Address>,
        inbox: QueueHandle,
        dispatcher: Dispatcher,
        cancel: CancelToken,
    ) -> Self {
        Self {
            name: name.into(),
            addresses,
            inbox,
            dispatcher,
            cancel,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Addresses this driver is bound to, in registration order.
    pub fn addresses(&self) -> &[Address] {
        &self.addresses
    }

    pub fn inbox(&self) -> &QueueHandle {
        &self.inbox
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    pub fn cancel_token(&self) -> &CancelToken {
        &self.cancel
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Cancellable fixed-period sleep. `false` means stop.
    pub fn sleep(&self, period: Duration) -> bool {
        self.cancel.sleep(period)
    }

    /// Block on the inbox for up to `timeout` (the "Wait" idiom).
    pub fn wait(&self, timeout: Duration) -> Option<Message> {
        if self.is_cancelled() {
            return None;
        }
        self.inbox.pop_blocking(timeout)
    }

    /// Publish to every subscriber of `addr`, stamped now.
    pub fn publish(
        &self,
        addr: &Address,
        msg_type: MsgType,
        subtype: u8,
        payload: Payload,
    ) -> Result<usize, DispatchError> {
        self.dispatcher
            .publish(addr, msg_type, subtype, payload, None)
    }

    /// Publish with the timestamp at which the data was produced.
    pub fn publish_at(
        &self,
        addr: &Address,
        msg_type: MsgType,
        subtype: u8,
        payload: Payload,
        timestamp: Timestamp,
    ) -> Result<usize, DispatchError> {
        self.dispatcher
            .publish(addr, msg_type, subtype, payload, Some(timestamp))
    }

    /// Answer `request` on the queue it names.
    pub fn reply(
        &self,
        request: &Message,
        msg_type: MsgType,
        payload: Payload,
    ) -> Result<(), DispatchError> {
        let queue = request
            .reply_to
            .as_ref()
            .ok_or(DispatchError::NoReplyQueue)?;
        self.dispatcher
            .reply(&request.header, queue, msg_type, payload)
    }

    /// Answer `request`, logging a reply that cannot be delivered.
    ///
    /// A requester that went away only loses its own reply.
    pub fn respond(&self, request: &Message, msg_type: MsgType, payload: Payload) {
        if let Err(e) = self.reply(request, msg_type, payload) {
            warn!(
                driver = self.name(),
                addr = %request.header.addr,
                subtype = request.header.subtype,
                "Reply not delivered: {}",
                e
            );
        }
    }

    /// Send a CMD (or any message) to the driver owning `target`.
    pub fn put_msg(
        &self,
        target: &Address,
        msg_type: MsgType,
        subtype: u8,
        payload: Payload,
    ) -> Result<(), DispatchError> {
        self.dispatcher
            .put_msg(target, msg_type, subtype, payload, None)
    }

    /// Send a REQ whose reply comes back to this driver's inbox.
    pub fn forward(
        &self,
        target: &Address,
        subtype: u8,
        payload: Payload,
    ) -> Result<(), DispatchError> {
        self.dispatcher.put_msg(
            target,
            MsgType::Req,
            subtype,
            payload,
            Some(self.inbox.clone()),
        )
    }

    /// Synchronous request: send a REQ and wait for its RESP.
    ///
    /// Other messages arriving meanwhile stay queued.
    pub fn request(
        &self,
        target: &Address,
        subtype: u8,
        payload: Payload,
        timeout: Duration,
    ) -> Result<Message, DispatchError> {
        self.dispatcher
            .request(&self.inbox, target, subtype, payload, timeout)
    }

    /// Subscribe this driver's inbox to another device.
    pub fn subscribe(&self, addr: &Address) -> Result<(), DispatchError> {
        self.dispatcher.subscribe(addr, &self.inbox)
    }

    pub fn unsubscribe(&self, addr: &Address) -> Result<(), DispatchError> {
        self.dispatcher.unsubscribe(addr, &self.inbox)
    }
}

// ─── Driver trait ───────────────────────────────────────────────────

/// Trait implemented by every device driver.
///
/// # Lifecycle
///
/// 1. `setup()` - On the first subscription, in the subscriber's thread
/// 2. `run()` - In the driver's own thread while subscribed
/// 3. `shutdown()` - After the last unsubscription, once `run()` has returned
///
/// The driver value is owned by exactly one thread at a time: it moves
/// into the worker thread for `run()` and back for `shutdown()`.
pub trait Driver: Send {
    /// Name reported in device-access replies.
    fn name(&self) -> &str;

    /// Bring the device up. Failure is returned to the subscriber.
    fn setup(&mut self, ctx: &DriverContext) -> Result<(), DriverError>;

    /// Release the device.
    fn shutdown(&mut self, ctx: &DriverContext) -> Result<(), DriverError>;

    /// Main loop. Must return promptly once `ctx.is_cancelled()`.
    ///
    /// Default: serve the inbox until cancelled.
    fn run(&mut self, ctx: &DriverContext) -> Result<(), DriverError> {
        while !ctx.is_cancelled() {
            if let Some(msg) = ctx.wait(Duration::from_millis(100)) {
                self.handle_message(ctx, &msg)?;
                self.process_messages(ctx)?;
            }
        }
        Ok(())
    }

    /// Handle one message. Return `Ok(false)` if it was not understood.
    fn process_message(
        &mut self,
        _ctx: &DriverContext,
        _msg: &Message,
    ) -> Result<bool, DriverError> {
        Ok(false)
    }

    /// Queue discipline for one of this driver's addresses, unless the
    /// configuration overrides it.
    fn default_discipline(&self, _addr: &Address) -> Discipline {
        Discipline::Overwrite
    }

    /// Run `process_message`, NACKing requests it did not handle.
    ///
    /// A dispatch error that only failed to deliver one message is logged
    /// and dropped; every other error ends the run.
    fn handle_message(&mut self, ctx: &DriverContext, msg: &Message) -> Result<(), DriverError> {
        let handled = match self.process_message(ctx, msg) {
            Ok(handled) => handled,
            Err(DriverError::Dispatch(e)) if e.is_delivery() => {
                warn!(
                    driver = ctx.name(),
                    addr = %msg.header.addr,
                    msg_type = %msg.header.msg_type,
                    subtype = msg.header.subtype,
                    "Message dropped: {}",
                    e
                );
                true
            }
            Err(e) => return Err(e),
        };
        if !handled {
            if msg.header.msg_type == MsgType::Req && msg.reply_to.is_some() {
                debug!(
                    driver = ctx.name(),
                    addr = %msg.header.addr,
                    subtype = msg.header.subtype,
                    "Unhandled request, sending NACK"
                );
                ctx.respond(msg, MsgType::RespNack, Payload::Empty);
            } else {
                debug!(
                    driver = ctx.name(),
                    addr = %msg.header.addr,
                    msg_type = %msg.header.msg_type,
                    subtype = msg.header.subtype,
                    "Ignoring unhandled message"
                );
            }
        }
        Ok(())
    }

    /// Drain the inbox without blocking. Returns the number handled.
    fn process_messages(&mut self, ctx: &DriverContext) -> Result<usize, DriverError> {
        let mut count = 0;
        while let Some(msg) = ctx.inbox().try_pop() {
            self.handle_message(ctx, &msg)?;
            count += 1;
        }
        Ok(count)
    }
}
