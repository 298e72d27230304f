//! Logging sink driver.
//!
//! A lossless (FIFO) endpoint on the opaque interface. Every command it
//! receives is logged and kept in a bounded history; every request is
//! ACKed with the number of messages received so far. Data from the
//! devices listed in `requires` is logged too.

use plexus_common::address::Address;
use plexus_common::message::{Message, MsgType, Timestamp};
use plexus_common::queue::Discipline;
use plexus_common::wire::Payload;
use std::collections::VecDeque;
use tracing::{info, warn};

use crate::driver::{Driver, DriverContext, DriverError, DriverSpec};

/// Default number of history entries kept.
pub const DEFAULT_KEEP: usize = 64;

/// One logged message.
#[derive(Debug, Clone, PartialEq)]
pub struct Entry {
    pub addr: Address,
    pub msg_type: MsgType,
    pub subtype: u8,
    pub timestamp: Timestamp,
    pub bytes: usize,
}

pub struct LogSinkDriver {
    requires: Vec<Address>,
    keep: usize,
    received: u32,
    history: VecDeque<Entry>,
}

impl LogSinkDriver {
    pub fn new(requires: Vec<Address>, keep: usize) -> Self {
        Self {
            requires,
            keep,
            received: 0,
            history: VecDeque::with_capacity(keep.min(DEFAULT_KEEP)),
        }
    }

    /// Messages received since the last setup.
    pub fn received(&self) -> u32 {
        self.received
    }

    pub fn history(&self) -> impl Iterator<Item = &Entry> {
        self.history.iter()
    }

    fn record(&mut self, msg: &Message) {
        self.received = self.received.wrapping_add(1);
        if self.keep == 0 {
            return;
        }
        if self.history.len() == self.keep {
            self.history.pop_front();
        }
        self.history.push_back(Entry {
            addr: msg.header.addr,
            msg_type: msg.header.msg_type,
            subtype: msg.header.subtype,
            timestamp: msg.header.timestamp,
            bytes: msg.payload.encoded_len(),
        });
    }
}

impl Driver for LogSinkDriver {
    fn name(&self) -> &str {
        "logsink"
    }

    fn setup(&mut self, ctx: &DriverContext) -> Result<(), DriverError> {
        self.received = 0;
        self.history.clear();
        for (i, addr) in self.requires.iter().enumerate() {
            if let Err(e) = ctx.subscribe(addr) {
                for done in &self.requires[..i] {
                    if let Err(undo) = ctx.unsubscribe(done) {
                        warn!(driver = ctx.name(), addr = %done, "Rollback unsubscribe failed: {}", undo);
                    }
                }
                return Err(e.into());
            }
        }
        info!(driver = ctx.name(), sources = self.requires.len(), "Log sink set up");
        Ok(())
    }

    fn shutdown(&mut self, ctx: &DriverContext) -> Result<(), DriverError> {
        let mut result = Ok(());
        for addr in &self.requires {
            if let Err(e) = ctx.unsubscribe(addr) {
                result = Err(e.into());
            }
        }
        info!(driver = ctx.name(), received = self.received, "Log sink shut down");
        result
    }

    fn default_discipline(&self, _addr: &Address) -> Discipline {
        Discipline::Fifo
    }

    fn process_message(&mut self, ctx: &DriverContext, msg: &Message) -> Result<bool, DriverError> {
        let h = &msg.header;
        match h.msg_type {
            MsgType::Cmd | MsgType::Data => {
                self.record(msg);
                info!(
                    driver = ctx.name(),
                    addr = %h.addr,
                    msg_type = %h.msg_type,
                    subtype = h.subtype,
                    bytes = msg.payload.encoded_len(),
                    "Received"
                );
                Ok(true)
            }
            MsgType::Req => {
                self.record(msg);
                ctx.respond(
                    msg,
                    MsgType::RespAck,
                    Payload::Opaque(self.received.to_be_bytes().to_vec()),
                );
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}

/// Factory: reads the `keep` option (history length).
pub fn create_driver(spec: &DriverSpec) -> Result<Box<dyn Driver>, DriverError> {
    let keep = spec.option_usize("keep")?.unwrap_or(DEFAULT_KEEP);
    Ok(Box::new(LogSinkDriver::new(spec.requires.clone(), keep)))
}
