//! Relay driver.
//!
//! Re-exposes one downstream device under a new address. Data from the
//! downstream device is republished with its original timestamp, commands
//! are passed through, and requests use the forward-request pattern: the
//! relay keeps the original header and reply queue, forwards the request
//! with its own inbox as the reply route, and hands the downstream ACK/NACK
//! back verbatim.

use plexus_common::address::Address;
use plexus_common::message::{Header, Message, MsgType};
use plexus_common::queue::QueueHandle;
use plexus_common::wire::Payload;
use std::collections::VecDeque;
use tracing::{debug, info, warn};

use crate::driver::{Driver, DriverContext, DriverError, DriverSpec};

/// A forwarded request awaiting its downstream reply.
struct Pending {
    header: Header,
    reply_to: QueueHandle,
}

pub struct RelayDriver {
    own: Address,
    downstream: Address,
    pending: VecDeque<Pending>,
}

impl RelayDriver {
    pub fn new(own: Address, downstream: Address) -> Result<Self, DriverError> {
        if own.interf != downstream.interf {
            return Err(DriverError::Config(format!(
                "relay {own} and downstream {downstream} have different interfaces"
            )));
        }
        Ok(Self {
            own,
            downstream,
            pending: VecDeque::new(),
        })
    }

    /// Requests forwarded but not yet answered.
    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    fn from_downstream(&self, ctx: &DriverContext, msg: &Message) -> bool {
        ctx.dispatcher()
            .policy()
            .matches(&msg.header.addr, &self.downstream)
    }

    fn forward_request(&mut self, ctx: &DriverContext, msg: &Message) {
        let Some(reply_to) = msg.reply_to.clone() else {
            debug!(driver = ctx.name(), "Request without reply route dropped");
            return;
        };
        match ctx.forward(&self.downstream, msg.header.subtype, msg.payload.clone()) {
            Ok(()) => self.pending.push_back(Pending {
                header: msg.header,
                reply_to,
            }),
            Err(e) => {
                warn!(driver = ctx.name(), downstream = %self.downstream, "Forward failed: {}", e);
                ctx.respond(msg, MsgType::RespNack, Payload::Empty);
            }
        }
    }

    fn return_reply(&mut self, ctx: &DriverContext, msg: &Message) {
        // Downstream answers in order per subtype; take the oldest match.
        let Some(pos) = self
            .pending
            .iter()
            .position(|p| p.header.subtype == msg.header.subtype)
        else {
            debug!(
                driver = ctx.name(),
                subtype = msg.header.subtype,
                "Reply with no pending request dropped"
            );
            return;
        };
        let Some(original) = self.pending.remove(pos) else {
            return;
        };
        if let Err(e) = ctx.dispatcher().reply(
            &original.header,
            &original.reply_to,
            msg.header.msg_type,
            msg.payload.clone(),
        ) {
            // The requester may have gone away meanwhile.
            debug!(driver = ctx.name(), "Reply not delivered: {}", e);
        }
    }
}

impl Driver for RelayDriver {
    fn name(&self) -> &str {
        "relay"
    }

    fn setup(&mut self, ctx: &DriverContext) -> Result<(), DriverError> {
        self.pending.clear();
        ctx.subscribe(&self.downstream)?;
        info!(driver = ctx.name(), own = %self.own, downstream = %self.downstream, "Relay set up");
        Ok(())
    }

    fn shutdown(&mut self, ctx: &DriverContext) -> Result<(), DriverError> {
        for p in self.pending.drain(..) {
            if let Err(e) =
                ctx.dispatcher()
                    .reply(&p.header, &p.reply_to, MsgType::RespNack, Payload::Empty)
            {
                debug!(driver = ctx.name(), "NACK on shutdown not delivered: {}", e);
            }
        }
        ctx.unsubscribe(&self.downstream)?;
        info!(driver = ctx.name(), "Relay shut down");
        Ok(())
    }

    fn process_message(&mut self, ctx: &DriverContext, msg: &Message) -> Result<bool, DriverError> {
        let h = &msg.header;
        if self.from_downstream(ctx, msg) {
            match h.msg_type {
                MsgType::Data => {
                    if let Err(e) = ctx.publish_at(
                        &self.own,
                        MsgType::Data,
                        h.subtype,
                        msg.payload.clone(),
                        h.timestamp,
                    ) {
                        debug!(driver = ctx.name(), "Republish: {}", e);
                    }
                }
                MsgType::RespAck | MsgType::RespNack => self.return_reply(ctx, msg),
                _ => return Ok(false),
            }
            return Ok(true);
        }

        match h.msg_type {
            MsgType::Cmd => {
                if let Err(e) =
                    ctx.put_msg(&self.downstream, MsgType::Cmd, h.subtype, msg.payload.clone())
                {
                    warn!(driver = ctx.name(), downstream = %self.downstream, "Command not passed on: {}", e);
                }
                Ok(true)
            }
            MsgType::Req => {
                self.forward_request(ctx, msg);
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}

/// Factory: exactly one provided and one required address.
pub fn create_driver(spec: &DriverSpec) -> Result<Box<dyn Driver>, DriverError> {
    match (spec.provides.as_slice(), spec.requires.as_slice()) {
        ([own], [downstream]) => Ok(Box::new(RelayDriver::new(*own, *downstream)?)),
        _ => Err(DriverError::Config(format!(
            "relay needs exactly one provided and one required address, got {} and {}",
            spec.provides.len(),
            spec.requires.len()
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use plexus_common::interface::{LASER, POSITION};

    #[test]
    fn factory_checks_addresses() {
        let mut spec = DriverSpec {
            name: "relay".to_string(),
            provides: vec![Address::local(POSITION, 1)],
            ..Default::default()
        };
        assert!(create_driver(&spec).is_err());

        spec.requires = vec![Address::local(LASER, 0)];
        assert!(matches!(create_driver(&spec), Err(DriverError::Config(_))));

        spec.requires = vec![Address::local(POSITION, 0)];
        assert!(create_driver(&spec).is_ok());
    }
}
