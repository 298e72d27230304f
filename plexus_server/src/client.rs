//! TCP client sessions.
//!
//! Each connection gets a [`Session`]: one reply/data queue, a reader
//! (the connection's own thread) that decodes frames and routes them, and
//! a writer thread that drains the queue onto the socket.
//!
//! Frames addressed to the `player` interface are handled here: device
//! list, driver info, device access (subscribe / close) and the data
//! delivery mode. Everything else goes to the driver owning the addressed
//! device, and only once the session has opened it: requests need any
//! access, commands need write access, and data is delivered only with
//! read access.

use plexus_common::address::Address;
use plexus_common::consts::{FRAME_HEADER_LEN, IDENT_LEN, IDENT_PREFIX};
use plexus_common::interface::{AccessMode, PLAYER, player};
use plexus_common::message::{Message, MsgType};
use plexus_common::queue::{Discipline, QueueHandle};
use plexus_common::wire::payload::{DeviceAccess, DriverInfo};
use plexus_common::wire::{FrameHeader, Payload, ProtocolError, decode_with_header, encode};
use std::collections::BTreeMap;
use std::io::{self, ErrorKind, Read, Write};
use std::net::{Shutdown, TcpStream};
use std::thread;
use std::time::Duration;
use tracing::{debug, info, trace, warn};

use crate::delivery::{Delivery, Rounds};
use crate::dispatcher::{DispatchError, Dispatcher};
use crate::lifecycle::LifecycleError;

/// How long the writer blocks before re-checking for session close.
const WRITER_POLL: Duration = Duration::from_millis(100);

/// Identification banner sent on connect: `"Plexus v<version>"`, NUL-padded.
pub fn banner() -> [u8; IDENT_LEN] {
    let mut out = [0u8; IDENT_LEN];
    let text = format!("{IDENT_PREFIX}{}", env!("CARGO_PKG_VERSION"));
    let n = text.len().min(IDENT_LEN);
    out[..n].copy_from_slice(&text.as_bytes()[..n]);
    out
}

/// Why the reader stopped.
#[derive(Debug)]
pub enum SessionEnd {
    /// Peer closed the connection.
    Disconnected,
    /// Peer sent a malformed frame.
    Protocol(ProtocolError),
    /// Socket failure (including server-initiated shutdown).
    Io(io::Error),
}

/// Routing state of one client.
pub struct Session {
    dispatcher: Dispatcher,
    queue: QueueHandle,
    delivery: Delivery,
    /// Granted access per opened device, keyed by bound address. Each
    /// entry holds exactly one subscription.
    grants: BTreeMap<Address, AccessMode>,
}

impl Session {
    pub fn new(dispatcher: Dispatcher, queue_capacity: usize) -> Self {
        Self {
            dispatcher,
            queue: QueueHandle::new(queue_capacity, Discipline::Overwrite),
            delivery: Delivery::new(),
            grants: BTreeMap::new(),
        }
    }

    /// Outbound queue: data, replies and NACKs for this client.
    pub fn queue(&self) -> &QueueHandle {
        &self.queue
    }

    /// Data mode and readable devices, shared with the writer.
    pub fn delivery(&self) -> &Delivery {
        &self.delivery
    }

    /// Subscriptions this session holds on `addr` (0 or 1).
    pub fn held(&self, addr: &Address) -> usize {
        usize::from(self.access(addr).is_some())
    }

    /// Access granted on `addr`, if the device is open.
    pub fn access(&self, addr: &Address) -> Option<AccessMode> {
        self.resolve(addr)
            .and_then(|bound| self.grants.get(&bound).copied())
    }

    fn resolve(&self, addr: &Address) -> Option<Address> {
        self.dispatcher.registry().resolve(addr).map(|(bound, _)| bound)
    }

    /// Route one decoded message from the client.
    pub fn handle(&mut self, msg: Message) {
        let h = msg.header;
        trace!(queue = %self.queue.id(), addr = %h.addr, msg_type = %h.msg_type, subtype = h.subtype, "Client frame");

        if h.addr.interf == PLAYER {
            match (h.msg_type, h.subtype) {
                (MsgType::Req, player::DEVLIST) => self.device_list(&msg),
                (MsgType::Req, player::DRIVERINFO) => self.driver_info(&msg),
                (MsgType::Req, player::DEV) => self.device_access(&msg),
                (MsgType::Req, player::DATA) => self.data_request(&msg),
                (MsgType::Req, player::DATAMODE) => self.data_mode(&msg),
                _ => self.nack(&msg, Payload::Empty),
            }
            return;
        }

        match h.msg_type {
            MsgType::Req => self.request(msg),
            MsgType::Cmd => self.command(msg),
            other => debug!(addr = %h.addr, msg_type = %other, "Ignoring client frame"),
        }
    }

    fn answer(&self, msg: &Message, msg_type: MsgType, payload: Payload) {
        if let Err(e) = self.dispatcher.reply(&msg.header, &self.queue, msg_type, payload) {
            warn!(queue = %self.queue.id(), "Reply not queued: {}", e);
        }
    }

    fn nack(&self, msg: &Message, payload: Payload) {
        self.answer(msg, MsgType::RespNack, payload);
    }

    fn device_list(&self, msg: &Message) {
        let devices = self.dispatcher.registry().devices();
        self.answer(msg, MsgType::RespAck, Payload::DeviceList(devices));
    }

    fn driver_info(&self, msg: &Message) {
        let Payload::DriverInfo(req) = &msg.payload else {
            self.nack(msg, Payload::Empty);
            return;
        };
        match self.dispatcher.registry().resolve(&req.addr) {
            Some((addr, driver)) => self.answer(
                msg,
                MsgType::RespAck,
                Payload::DriverInfo(DriverInfo {
                    addr,
                    driver_name: driver.name().to_string(),
                }),
            ),
            None => {
                debug!(addr = %req.addr, "Driver info for unknown device");
                self.nack(msg, Payload::Empty);
            }
        }
    }

    fn data_request(&self, msg: &Message) {
        if !self.delivery.request_round() {
            trace!(mode = %self.delivery.mode(), "Data request outside pull mode");
        }
        self.answer(msg, MsgType::RespAck, Payload::Empty);
    }

    fn data_mode(&self, msg: &Message) {
        let &Payload::DataMode(mode) = &msg.payload else {
            self.nack(msg, Payload::Empty);
            return;
        };
        self.delivery.set_mode(mode);
        info!(queue = %self.queue.id(), mode = %mode, "Data mode changed");
        self.answer(msg, MsgType::RespAck, Payload::Empty);
    }

    fn device_access(&mut self, msg: &Message) {
        let Payload::DeviceAccess(req) = &msg.payload else {
            self.nack(msg, Payload::Empty);
            return;
        };
        let refused = |addr| {
            Payload::DeviceAccess(DeviceAccess {
                addr,
                access: AccessMode::Error,
                driver_name: String::new(),
            })
        };

        let result = if req.access.opens() {
            self.open(&req.addr, req.access)
        } else if req.access == AccessMode::Close {
            self.close(&req.addr)
        } else {
            Err(DispatchError::UnknownAddress(req.addr))
        };

        match result {
            Ok((bound, driver_name)) => self.answer(
                msg,
                MsgType::RespAck,
                Payload::DeviceAccess(DeviceAccess {
                    addr: bound,
                    access: req.access,
                    driver_name,
                }),
            ),
            Err(e) => {
                info!(addr = %req.addr, access = %req.access, "Device access refused: {}", e);
                self.nack(msg, refused(req.addr));
            }
        }
    }

    /// Open `addr` with `access`, or change the access of an open device.
    ///
    /// Only the first open subscribes; changing between read, write and
    /// all keeps the one subscription.
    fn open(&mut self, addr: &Address, access: AccessMode) -> Result<(Address, String), DispatchError> {
        let (bound, driver) = self
            .dispatcher
            .registry()
            .resolve(addr)
            .ok_or(DispatchError::UnknownAddress(*addr))?;
        match self.grants.get(&bound).copied() {
            Some(previous) => {
                debug!(queue = %self.queue.id(), addr = %bound, from = %previous, to = %access, "Access changed");
            }
            None => {
                self.dispatcher.subscribe(&bound, &self.queue)?;
                info!(queue = %self.queue.id(), addr = %bound, driver = driver.name(), access = %access, "Client subscribed");
            }
        }
        self.grants.insert(bound, access);
        self.delivery.set_readable(bound, access.reads());
        Ok((bound, driver.name().to_string()))
    }

    fn close(&mut self, addr: &Address) -> Result<(Address, String), DispatchError> {
        let (bound, driver) = self
            .dispatcher
            .registry()
            .resolve(addr)
            .ok_or(DispatchError::UnknownAddress(*addr))?;
        if self.grants.remove(&bound).is_none() {
            return Err(LifecycleError::NotSubscribed { addr: bound }.into());
        }
        self.delivery.set_readable(bound, false);
        self.dispatcher.unsubscribe(&bound, &self.queue)?;
        info!(queue = %self.queue.id(), addr = %bound, "Client unsubscribed");
        Ok((bound, driver.name().to_string()))
    }

    fn request(&self, msg: Message) {
        if self.access(&msg.header.addr).is_none() {
            debug!(addr = %msg.header.addr, "Request to unsubscribed device");
            self.nack(&msg, Payload::Empty);
            return;
        }
        let h = msg.header;
        if let Err(e) = self.dispatcher.put_msg(
            &h.addr,
            MsgType::Req,
            h.subtype,
            msg.payload.clone(),
            Some(self.queue.clone()),
        ) {
            warn!(addr = %h.addr, "Request not delivered: {}", e);
            self.nack(&msg, Payload::Empty);
        }
    }

    fn command(&self, msg: Message) {
        let h = msg.header;
        match self.access(&h.addr) {
            Some(access) if access.writes() => {}
            Some(access) => {
                warn!(addr = %h.addr, access = %access, "Command without write access dropped");
                return;
            }
            None => {
                warn!(addr = %h.addr, "Command to unsubscribed device dropped");
                return;
            }
        }
        if let Err(e) = self
            .dispatcher
            .put_msg(&h.addr, MsgType::Cmd, h.subtype, msg.payload, None)
        {
            warn!(addr = %h.addr, "Command not delivered: {}", e);
        }
    }

    /// Release every subscription and close the queue.
    pub fn close_all(&mut self) {
        for addr in std::mem::take(&mut self.grants).into_keys() {
            if let Err(e) = self.dispatcher.unsubscribe(&addr, &self.queue) {
                warn!(queue = %self.queue.id(), addr = %addr, "Unsubscribe on close: {}", e);
            }
        }
        self.delivery.clear_readable();
        self.queue.close();
    }
}

/// Read until `buf` is full or the peer closes. Returns the bytes read.
fn fill(stream: &mut impl Read, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match stream.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

/// Read one frame. `Ok(None)` on clean EOF at a frame boundary; EOF
/// inside a frame is a truncated frame.
fn read_frame(stream: &mut impl Read) -> Result<Option<Message>, SessionEnd> {
    let mut head = [0u8; FRAME_HEADER_LEN];
    match fill(stream, &mut head).map_err(SessionEnd::Io)? {
        0 => return Ok(None),
        FRAME_HEADER_LEN => {}
        n => {
            return Err(SessionEnd::Protocol(ProtocolError::Truncated {
                needed: FRAME_HEADER_LEN,
                available: n,
            }));
        }
    }
    let header = FrameHeader::read(&head).map_err(SessionEnd::Protocol)?;
    let mut body = vec![0u8; header.len as usize];
    let n = fill(stream, &mut body).map_err(SessionEnd::Io)?;
    if n < body.len() {
        return Err(SessionEnd::Protocol(ProtocolError::Truncated {
            needed: body.len(),
            available: n,
        }));
    }
    decode_with_header(&header, &body)
        .map(Some)
        .map_err(SessionEnd::Protocol)
}

fn write_loop(mut stream: TcpStream, queue: QueueHandle, delivery: Delivery) {
    let mut rounds = Rounds::new(delivery);
    let mut buf = Vec::new();
    loop {
        let frames = rounds.next(&queue, WRITER_POLL);
        if frames.is_empty() {
            if queue.is_closed() {
                break;
            }
            continue;
        }
        buf.clear();
        for msg in &frames {
            match encode(msg) {
                Ok(frame) => buf.extend_from_slice(&frame),
                Err(e) => warn!(addr = %msg.header.addr, "Dropping unencodable message: {}", e),
            }
        }
        if let Err(e) = stream.write_all(&buf) {
            debug!(queue = %queue.id(), "Write failed: {}", e);
            // Unblock the reader too.
            let _ = stream.shutdown(Shutdown::Both);
            break;
        }
    }
}

/// Serve one connection until the peer goes away.
///
/// Sends the banner, then reads frames on the calling thread while a
/// writer thread drains the session queue. All subscriptions are released
/// before this returns.
pub fn serve(
    mut stream: TcpStream,
    dispatcher: Dispatcher,
    queue_capacity: usize,
) -> io::Result<SessionEnd> {
    let peer = stream.peer_addr()?;
    stream.set_nodelay(true)?;
    stream.write_all(&banner())?;

    let mut session = Session::new(dispatcher, queue_capacity);
    let writer_stream = stream.try_clone()?;
    let writer_queue = session.queue().clone();
    let writer_delivery = session.delivery().clone();
    let writer = thread::Builder::new()
        .name(format!("client-{peer}"))
        .spawn(move || write_loop(writer_stream, writer_queue, writer_delivery))?;
    info!(peer = %peer, queue = %session.queue().id(), "Client connected");

    let end = loop {
        match read_frame(&mut stream) {
            Ok(Some(msg)) => session.handle(msg),
            Ok(None) => break SessionEnd::Disconnected,
            Err(end) => break end,
        }
    };
    match &end {
        SessionEnd::Disconnected => info!(peer = %peer, "Client disconnected"),
        SessionEnd::Protocol(e) => warn!(peer = %peer, "Protocol error, dropping client: {}", e),
        SessionEnd::Io(e) => info!(peer = %peer, "Client connection closed: {}", e),
    }

    session.close_all();
    if writer.join().is_err() {
        warn!(peer = %peer, "Writer thread panicked");
    }
    let _ = stream.shutdown(Shutdown::Both);
    Ok(end)
}
