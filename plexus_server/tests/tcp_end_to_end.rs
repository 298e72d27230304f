//! # TCP End-to-End Tests
//!
//! A real `ServerCore` on an ephemeral port, driven by raw frames:
//!
//! - Banner, device list and device open / close
//! - Data streaming and request/reply over the socket
//! - Data rounds closed by SYNCH, push and pull data modes
//! - Access modes: commands need write access
//! - Commands and requests to a lossless sink
//! - Protocol errors drop only the offending client

use plexus_common::address::Address;
use plexus_common::config::ConfigLoader;
use plexus_common::consts::{FRAME_HEADER_LEN, IDENT_LEN, IDENT_PREFIX};
use plexus_common::interface::{
    AccessMode, DataMode, OPAQUE, PLAYER, POSITION, SONAR, player, position,
};
use plexus_common::message::{Header, Message, MsgType};
use plexus_common::wire::payload::{DeviceAccess, DriverInfo};
use plexus_common::wire::{FrameHeader, Payload, decode_with_header, encode};
use plexus_server::{Dispatcher, DriverRegistry, ServerConfig, ServerCore};
use std::io::{Read, Write};
use std::net::{Ipv4Addr, TcpStream};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

const CONFIG: &str = r#"
[server]
port = 0

[[driver]]
name = "dummy"
provides = ["position:0", "sonar:0"]

[driver.options]
rate = 50.0

[[driver]]
name = "logsink"
provides = ["opaque:0"]
"#;

// ─── Helpers ────────────────────────────────────────────────────────

struct Running {
    port: u16,
    dispatcher: Dispatcher,
    running: Arc<AtomicBool>,
    thread: JoinHandle<ServerCore>,
}

impl Running {
    fn start() -> Self {
        let config = ServerConfig::parse(CONFIG).expect("config");
        let mut core = ServerCore::new(config, DriverRegistry::with_builtin()).expect("core");
        core.init().expect("init");
        assert!(core.bind_report().is_clean());

        let port = core.local_addr().expect("listening").port();
        let dispatcher = core.dispatcher().clone();
        let running = core.running_flag();
        let thread = thread::spawn(move || {
            core.run().expect("accept loop");
            core
        });
        Self {
            port,
            dispatcher,
            running,
            thread,
        }
    }

    fn connect(&self) -> TcpStream {
        let mut stream = TcpStream::connect((Ipv4Addr::LOCALHOST, self.port)).expect("connect");
        stream
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();
        let mut banner = [0u8; IDENT_LEN];
        stream.read_exact(&mut banner).expect("banner");
        assert!(banner.starts_with(IDENT_PREFIX.as_bytes()));
        stream
    }

    fn subscriptions(&self, addr: &Address) -> usize {
        self.dispatcher
            .registry()
            .lookup(addr)
            .map_or(0, |h| h.total_subscriptions())
    }

    fn stop(self) {
        self.running.store(false, Ordering::SeqCst);
        let mut core = self.thread.join().expect("server thread");
        core.shutdown().expect("shutdown");
        assert!(core.dispatcher().registry().is_empty());
    }
}

fn send(stream: &mut TcpStream, addr: Address, msg_type: MsgType, subtype: u8, payload: Payload) {
    let frame = encode(&Message::new(Header::new(addr, msg_type, subtype), payload)).unwrap();
    stream.write_all(&frame).unwrap();
}

fn recv(stream: &mut TcpStream) -> Message {
    let mut head = [0u8; FRAME_HEADER_LEN];
    stream.read_exact(&mut head).expect("frame header");
    let header = FrameHeader::read(&head).unwrap();
    let mut body = vec![0u8; header.len as usize];
    stream.read_exact(&mut body).expect("frame body");
    decode_with_header(&header, &body).unwrap()
}

/// Read frames until one satisfies `pred`, skipping streamed data.
fn recv_until(stream: &mut TcpStream, pred: impl Fn(&Message) -> bool) -> Message {
    for _ in 0..500 {
        let msg = recv(stream);
        if pred(&msg) {
            return msg;
        }
    }
    panic!("expected frame never arrived");
}

fn is_response_to(msg: &Message, addr: Address, subtype: u8) -> bool {
    msg.header.msg_type.is_response() && msg.header.addr == addr && msg.header.subtype == subtype
}

fn access(stream: &mut TcpStream, addr: Address, mode: AccessMode) -> Message {
    let root = Address::local(PLAYER, 0);
    send(
        stream,
        root,
        MsgType::Req,
        player::DEV,
        Payload::DeviceAccess(DeviceAccess {
            addr,
            access: mode,
            driver_name: String::new(),
        }),
    );
    recv_until(stream, |m| is_response_to(m, root, player::DEV))
}

fn wait_until(mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        thread::sleep(Duration::from_millis(10));
    }
    false
}

// ─── Sessions ───────────────────────────────────────────────────────

#[test]
fn test_device_list_open_stream_and_close() {
    let server = Running::start();
    let mut client = server.connect();
    let pos = Address::local(POSITION, 0);

    let root = Address::local(PLAYER, 0);
    send(&mut client, root, MsgType::Req, player::DEVLIST, Payload::Empty);
    let list = recv(&mut client);
    assert_eq!(list.header.msg_type, MsgType::RespAck);
    assert_eq!(
        list.payload,
        Payload::DeviceList(vec![
            pos,
            Address::local(SONAR, 0),
            Address::local(OPAQUE, 0)
        ])
    );

    let ack = access(&mut client, pos, AccessMode::Read);
    assert_eq!(ack.header.msg_type, MsgType::RespAck);
    let Payload::DeviceAccess(granted) = ack.payload else {
        panic!("expected device access body");
    };
    assert_eq!(granted.addr, pos);
    assert_eq!(granted.driver_name, "dummy");
    assert_eq!(server.subscriptions(&pos), 1);

    let data = recv_until(&mut client, |m| m.header.msg_type == MsgType::Data);
    assert_eq!(data.header.addr, pos);
    assert!(matches!(data.payload, Payload::PositionData(_)));

    // Each round of pushed data is closed by a bodiless SYNCH.
    let synch = recv_until(&mut client, |m| m.header.msg_type == MsgType::Synch);
    assert_eq!(synch.header.addr, root);
    assert_eq!(synch.payload, Payload::Empty);

    send(&mut client, pos, MsgType::Req, position::GET_GEOM, Payload::Empty);
    let geom = recv_until(&mut client, |m| is_response_to(m, pos, position::GET_GEOM));
    assert_eq!(geom.header.msg_type, MsgType::RespAck);
    assert!(matches!(geom.payload, Payload::PositionGeom(_)));

    let closed = access(&mut client, pos, AccessMode::Close);
    assert_eq!(closed.header.msg_type, MsgType::RespAck);
    assert_eq!(server.subscriptions(&pos), 0);

    drop(client);
    server.stop();
}

#[test]
fn test_unknown_device_is_refused() {
    let server = Running::start();
    let mut client = server.connect();

    let nack = access(&mut client, Address::local(POSITION, 7), AccessMode::Read);
    assert_eq!(nack.header.msg_type, MsgType::RespNack);
    let Payload::DeviceAccess(refused) = nack.payload else {
        panic!("expected device access body");
    };
    assert_eq!(refused.access, AccessMode::Error);

    drop(client);
    server.stop();
}

#[test]
fn test_commands_and_requests_reach_lossless_sink() {
    let server = Running::start();
    let mut client = server.connect();
    let sink = Address::local(OPAQUE, 0);

    assert_eq!(access(&mut client, sink, AccessMode::All).header.msg_type, MsgType::RespAck);
    for n in 0..2u8 {
        send(&mut client, sink, MsgType::Cmd, 1, Payload::Opaque(vec![n]));
    }
    send(&mut client, sink, MsgType::Req, 9, Payload::Opaque(Vec::new()));

    let ack = recv_until(&mut client, |m| is_response_to(m, sink, 9));
    assert_eq!(ack.header.msg_type, MsgType::RespAck);
    assert_eq!(ack.payload, Payload::Opaque(3u32.to_be_bytes().to_vec()));

    drop(client);
    server.stop();
}

#[test]
fn test_protocol_error_drops_only_that_client() {
    let server = Running::start();
    let pos = Address::local(POSITION, 0);
    let mut good = server.connect();
    let mut bad = server.connect();

    access(&mut good, pos, AccessMode::Read);
    access(&mut bad, pos, AccessMode::Read);
    assert_eq!(server.subscriptions(&pos), 2);

    // Message type 99 does not exist.
    let mut garbage = [0u8; FRAME_HEADER_LEN];
    garbage[10] = 99;
    bad.write_all(&garbage).unwrap();

    // The server closes the bad connection; data may still be in flight.
    let mut sink = Vec::new();
    let _ = bad.read_to_end(&mut sink);
    assert!(wait_until(|| server.subscriptions(&pos) == 1));

    // The other client keeps streaming.
    let data = recv_until(&mut good, |m| m.header.msg_type == MsgType::Data);
    assert_eq!(data.header.addr, pos);

    drop(good);
    assert!(wait_until(|| server.subscriptions(&pos) == 0));
    server.stop();
}

#[test]
fn test_shutdown_disconnects_clients() {
    let server = Running::start();
    let mut client = server.connect();
    access(&mut client, Address::local(SONAR, 0), AccessMode::Read);

    server.stop();

    let mut rest = Vec::new();
    let _ = client.read_to_end(&mut rest);
    let mut byte = [0u8; 1];
    assert!(matches!(client.read(&mut byte), Ok(0) | Err(_)));
}

#[test]
fn test_driver_info_reports_driver_name() {
    let server = Running::start();
    let mut client = server.connect();
    let root = Address::local(PLAYER, 0);
    let sonar = Address::local(SONAR, 0);

    send(
        &mut client,
        root,
        MsgType::Req,
        player::DRIVERINFO,
        Payload::DriverInfo(DriverInfo {
            addr: sonar,
            driver_name: String::new(),
        }),
    );
    let info = recv(&mut client);
    assert_eq!(info.header.msg_type, MsgType::RespAck);
    assert_eq!(
        info.payload,
        Payload::DriverInfo(DriverInfo {
            addr: sonar,
            driver_name: "dummy".to_string(),
        })
    );

    drop(client);
    server.stop();
}

#[test]
fn test_pull_mode_sends_rounds_on_request() {
    let server = Running::start();
    let mut client = server.connect();
    let root = Address::local(PLAYER, 0);
    let pos = Address::local(POSITION, 0);

    access(&mut client, pos, AccessMode::Read);
    send(
        &mut client,
        root,
        MsgType::Req,
        player::DATAMODE,
        Payload::DataMode(DataMode::PullNew),
    );
    recv_until(&mut client, |m| is_response_to(m, root, player::DATAMODE));

    // Nothing arrives until asked for, although the device keeps publishing.
    client
        .set_read_timeout(Some(Duration::from_millis(300)))
        .unwrap();
    let mut byte = [0u8; 1];
    assert!(client.read(&mut byte).is_err());
    client
        .set_read_timeout(Some(Duration::from_secs(5)))
        .unwrap();

    send(&mut client, root, MsgType::Req, player::DATA, Payload::Empty);
    let (mut saw_data, mut saw_ack) = (false, false);
    loop {
        let msg = recv(&mut client);
        match msg.header.msg_type {
            MsgType::Data => {
                assert_eq!(msg.header.addr, pos);
                saw_data = true;
            }
            MsgType::RespAck => {
                assert!(is_response_to(&msg, root, player::DATA));
                saw_ack = true;
            }
            MsgType::Synch => {
                assert_eq!(msg.header.addr, root);
                break;
            }
            other => panic!("unexpected {other} frame"),
        }
    }
    assert!(saw_data);
    if !saw_ack {
        recv_until(&mut client, |m| is_response_to(m, root, player::DATA));
    }

    drop(client);
    server.stop();
}

#[test]
fn test_read_access_drops_commands() {
    let server = Running::start();
    let mut client = server.connect();
    let sink = Address::local(OPAQUE, 0);

    assert_eq!(access(&mut client, sink, AccessMode::Read).header.msg_type, MsgType::RespAck);
    send(&mut client, sink, MsgType::Cmd, 1, Payload::Opaque(vec![1]));
    send(&mut client, sink, MsgType::Req, 9, Payload::Opaque(Vec::new()));
    let ack = recv_until(&mut client, |m| is_response_to(m, sink, 9));
    // Only the request itself reached the sink.
    assert_eq!(ack.payload, Payload::Opaque(1u32.to_be_bytes().to_vec()));

    let upgraded = access(&mut client, sink, AccessMode::All);
    assert_eq!(upgraded.header.msg_type, MsgType::RespAck);
    assert_eq!(server.subscriptions(&sink), 1);
    send(&mut client, sink, MsgType::Cmd, 1, Payload::Opaque(vec![2]));
    send(&mut client, sink, MsgType::Req, 9, Payload::Opaque(Vec::new()));
    let ack = recv_until(&mut client, |m| is_response_to(m, sink, 9));
    assert_eq!(ack.payload, Payload::Opaque(3u32.to_be_bytes().to_vec()));

    drop(client);
    server.stop();
}
