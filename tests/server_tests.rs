// SPDX-FileCopyrightText: 2026 ArcheBase
//
// SPDX-License-Identifier: MulanPSL-2.0

//! End-to-end tests against a live server on ephemeral ports: the binary
//! protocol over real TCP/UDP sockets, quiet-variant batching, and
//! cross-connection consistency.

use std::io::{Read, Write};
use std::net::{Ipv4Addr, SocketAddr, TcpStream, UdpSocket};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use flatcached::proto::udp::{parse_udp_prefix, udp_header};
use flatcached::proto::wire::{
    cmd_info, encode_request, parse_reply, Reply, Request, Status, CMD_ADD, CMD_APPEND, CMD_DECR,
    CMD_DELETE, CMD_DELETEQ, CMD_ECHO, CMD_FLUSH_ALL, CMD_GET, CMD_GETQ, CMD_INCR, CMD_REPLACE,
    CMD_SERVERERR, CMD_SET, CMD_SETQ, CMD_STATS, CMD_VERSION,
};
use flatcached::{serve, Settings, Shared};

struct TestServer {
    shared: Arc<Shared>,
    tcp_port: u16,
    udp_port: u16,
}

impl TestServer {
    fn start() -> TestServer {
        let mut settings = Settings::default();
        settings.maxbytes = 4 * 1024 * 1024;
        settings.num_threads = 2;
        settings.maxconns = 64;
        settings.binary_port = 0;
        settings.binary_udpport = 0;
        settings.bind_ephemeral = true;
        settings.verbose = 0;

        let shared = Shared::new(settings).unwrap();
        {
            let shared = Arc::clone(&shared);
            std::thread::spawn(move || {
                let _ = serve(shared);
            });
        }

        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        let (mut tcp_port, mut udp_port) = (0, 0);
        while std::time::Instant::now() < deadline {
            tcp_port = shared.bound_tcp_port.load(Ordering::SeqCst);
            udp_port = shared.bound_udp_port.load(Ordering::SeqCst);
            if tcp_port != 0 && udp_port != 0 {
                break;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        assert!(tcp_port != 0, "server did not bind");

        TestServer {
            shared,
            tcp_port,
            udp_port,
        }
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.shared.request_shutdown();
    }
}

struct Client {
    stream: TcpStream,
}

impl Client {
    fn connect(port: u16) -> Client {
        let stream = TcpStream::connect((Ipv4Addr::LOCALHOST, port)).unwrap();
        stream
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();
        Client { stream }
    }

    fn send(&mut self, bytes: &[u8]) {
        self.stream.write_all(bytes).unwrap();
    }

    fn read_reply(&mut self) -> (Reply, Vec<u8>) {
        let mut header = [0u8; 12];
        self.stream.read_exact(&mut header).unwrap();
        let reply = parse_reply(&header).unwrap();
        let mut body = vec![0u8; reply.body_length as usize];
        self.stream.read_exact(&mut body).unwrap();
        (reply, body)
    }

    fn set(&mut self, key: &[u8], value: &[u8], flags: u32, exptime: u32) -> u8 {
        self.send(&set_request(CMD_SET, key, value, flags, exptime));
        let (reply, _) = self.read_reply();
        reply.status
    }

    fn get(&mut self, key: &[u8]) -> (u8, u32, Vec<u8>) {
        self.send(&key_request(CMD_GET, key));
        let (reply, body) = self.read_reply();
        if reply.status == Status::Found as u8 {
            assert!(body.len() >= 8);
            let flags = u32::from_be_bytes(body[4..8].try_into().unwrap());
            (reply.status, flags, body[8..].to_vec())
        } else {
            (reply.status, 0, Vec::new())
        }
    }
}

fn set_request(cmd: u8, key: &[u8], value: &[u8], flags: u32, exptime: u32) -> Vec<u8> {
    let info = cmd_info(cmd).unwrap();
    let mut bytes = encode_request(
        &Request {
            cmd,
            keylen: key.len() as u8,
            body_length: (8 + key.len() + value.len()) as u32,
            exptime,
            flags,
            ..Default::default()
        },
        &info,
    );
    bytes.extend_from_slice(key);
    bytes.extend_from_slice(value);
    bytes
}

fn key_request(cmd: u8, key: &[u8]) -> Vec<u8> {
    let info = cmd_info(cmd).unwrap();
    let mut bytes = encode_request(
        &Request {
            cmd,
            keylen: key.len() as u8,
            body_length: key.len() as u32,
            ..Default::default()
        },
        &info,
    );
    bytes.extend_from_slice(key);
    bytes
}

fn key_number_request(cmd: u8, key: &[u8], number: u32) -> Vec<u8> {
    let info = cmd_info(cmd).unwrap();
    let mut bytes = encode_request(
        &Request {
            cmd,
            keylen: key.len() as u8,
            body_length: (4 + key.len()) as u32,
            number,
            ..Default::default()
        },
        &info,
    );
    bytes.extend_from_slice(key);
    bytes
}

fn number_request(cmd: u8, number: u32) -> Vec<u8> {
    let info = cmd_info(cmd).unwrap();
    encode_request(
        &Request {
            cmd,
            body_length: 4,
            number,
            ..Default::default()
        },
        &info,
    )
}

fn string_request(cmd: u8, arg: &[u8]) -> Vec<u8> {
    let info = cmd_info(cmd).unwrap();
    let mut bytes = encode_request(
        &Request {
            cmd,
            body_length: arg.len() as u32,
            ..Default::default()
        },
        &info,
    );
    bytes.extend_from_slice(arg);
    bytes
}

fn empty_request(cmd: u8) -> Vec<u8> {
    let info = cmd_info(cmd).unwrap();
    encode_request(
        &Request {
            cmd,
            ..Default::default()
        },
        &info,
    )
}

#[test]
fn test_set_then_get_round_trips() {
    let server = TestServer::start();
    let mut client = Client::connect(server.tcp_port);

    assert_eq!(client.set(b"key", b"V", 9, 0), Status::Stored as u8);

    let (status, flags, value) = client.get(b"key");
    assert_eq!(status, Status::Found as u8);
    assert_eq!(status, 1);
    assert_eq!(flags, 9);
    assert_eq!(value, b"V");
}

#[test]
fn test_get_reply_echoes_cmd_and_opaque() {
    let server = TestServer::start();
    let mut client = Client::connect(server.tcp_port);
    client.set(b"key", b"value", 0, 0);

    let info = cmd_info(CMD_GET).unwrap();
    let mut bytes = encode_request(
        &Request {
            cmd: CMD_GET,
            keylen: 3,
            opaque: 0x11223344,
            body_length: 3,
            ..Default::default()
        },
        &info,
    );
    bytes.extend_from_slice(b"key");
    client.send(&bytes);

    let (reply, body) = client.read_reply();
    assert_eq!(reply.cmd, CMD_GET);
    assert_eq!(reply.opaque, 0x11223344);
    assert_eq!(reply.body_length as usize, 8 + 5);
    assert_eq!(&body[8..], b"value");
}

#[test]
fn test_add_replace_predicates() {
    let server = TestServer::start();
    let mut client = Client::connect(server.tcp_port);

    client.send(&set_request(CMD_ADD, b"fresh", b"1", 0, 0));
    assert_eq!(client.read_reply().0.status, Status::Stored as u8);

    client.send(&set_request(CMD_ADD, b"fresh", b"2", 0, 0));
    assert_eq!(client.read_reply().0.status, Status::NotStored as u8);

    client.send(&set_request(CMD_REPLACE, b"fresh", b"3", 0, 0));
    assert_eq!(client.read_reply().0.status, Status::Stored as u8);

    client.send(&set_request(CMD_REPLACE, b"absent", b"x", 0, 0));
    assert_eq!(client.read_reply().0.status, Status::NotStored as u8);

    assert_eq!(client.get(b"fresh").2, b"3");
}

#[test]
fn test_append_concatenates() {
    let server = TestServer::start();
    let mut client = Client::connect(server.tcp_port);

    client.set(b"log", b"hello", 0, 0);
    client.send(&set_request(CMD_APPEND, b"log", b" world", 0, 0));
    assert_eq!(client.read_reply().0.status, Status::Stored as u8);
    assert_eq!(client.get(b"log").2, b"hello world");
}

#[test]
fn test_delete_then_get_misses() {
    let server = TestServer::start();
    let mut client = Client::connect(server.tcp_port);

    client.set(b"temp", b"v", 0, 0);
    client.send(&key_number_request(CMD_DELETE, b"temp", 0));
    assert_eq!(client.read_reply().0.status, Status::Deleted as u8);

    assert_eq!(client.get(b"temp").0, Status::NotFound as u8);

    client.send(&key_number_request(CMD_DELETE, b"temp", 0));
    assert_eq!(client.read_reply().0.status, Status::NotFound as u8);
}

#[test]
fn test_incr_decr() {
    let server = TestServer::start();
    let mut client = Client::connect(server.tcp_port);

    client.set(b"n", b"10", 0, 0);

    client.send(&key_number_request(CMD_INCR, b"n", 5));
    let (reply, body) = client.read_reply();
    assert_eq!(reply.status, Status::Stored as u8);
    assert_eq!(u32::from_be_bytes(body[0..4].try_into().unwrap()), 15);

    // decr saturates at zero
    client.send(&key_number_request(CMD_DECR, b"n", 100));
    let (reply, body) = client.read_reply();
    assert_eq!(reply.status, Status::Stored as u8);
    assert_eq!(u32::from_be_bytes(body[0..4].try_into().unwrap()), 0);

    // non-numeric values are a client error
    client.set(b"s", b"abc", 0, 0);
    client.send(&key_number_request(CMD_INCR, b"s", 1));
    assert_eq!(client.read_reply().0.status, Status::LocalError as u8);

    // a value beyond 32 bits is unrepresentable: a server-side error
    client.set(b"wide", b"4294967296", 0, 0);
    client.send(&key_number_request(CMD_INCR, b"wide", 1));
    assert_eq!(client.read_reply().0.status, Status::RemoteError as u8);

    // missing key
    client.send(&key_number_request(CMD_INCR, b"absent", 1));
    assert_eq!(client.read_reply().0.status, Status::NotFound as u8);
}

#[test]
fn test_flush_all_makes_gets_miss() {
    let server = TestServer::start();
    let mut client = Client::connect(server.tcp_port);

    for index in 0..16 {
        client.set(format!("flush-{index}").as_bytes(), b"v", 0, 600);
    }

    // the flush watermark has one-second granularity; step past the
    // second the items were stored in
    server.shared.clock.advance(2);

    client.send(&number_request(CMD_FLUSH_ALL, 0));
    assert_eq!(client.read_reply().0.status, Status::Ok as u8);

    for index in 0..16 {
        let (status, _, _) = client.get(format!("flush-{index}").as_bytes());
        assert_eq!(status, Status::NotFound as u8);
    }

    // new sets land after the flush watermark
    client.set(b"after", b"v", 0, 0);
    assert_eq!(client.get(b"after").0, Status::Found as u8);
}

#[test]
fn test_setq_then_get_replies_exactly_once() {
    let server = TestServer::start();
    let mut client = Client::connect(server.tcp_port);

    // one TCP write carrying SETQ + GET: the server must answer only the
    // GET, with the value just stored
    let mut pipeline = set_request(CMD_SETQ, b"quiet", b"payload", 0, 0);
    pipeline.extend_from_slice(&key_request(CMD_GET, b"quiet"));
    client.send(&pipeline);

    let (reply, body) = client.read_reply();
    assert_eq!(reply.cmd, CMD_GET);
    assert_eq!(reply.status, Status::Found as u8);
    assert_eq!(&body[8..], b"payload");

    // nothing else pending: a follow-up echo answers first
    client.send(&empty_request(CMD_ECHO));
    let (reply, _) = client.read_reply();
    assert_eq!(reply.cmd, CMD_ECHO);
    assert_eq!(reply.status, Status::Ok as u8);
}

#[test]
fn test_deleteq_is_silent_on_miss_and_hit() {
    let server = TestServer::start();
    let mut client = Client::connect(server.tcp_port);
    client.set(b"doomed", b"v", 0, 0);

    // quiet deletes never answer: a hit is suppressed, a miss is
    // dropped; the trailing echo must be the only reply
    let mut pipeline = key_number_request(CMD_DELETEQ, b"doomed", 0);
    pipeline.extend_from_slice(&key_number_request(CMD_DELETEQ, b"never-there", 0));
    pipeline.extend_from_slice(&empty_request(CMD_ECHO));
    client.send(&pipeline);

    let (reply, _) = client.read_reply();
    assert_eq!(reply.cmd, CMD_ECHO);
    assert_eq!(reply.status, Status::Ok as u8);

    // the quiet delete really happened
    assert_eq!(client.get(b"doomed").0, Status::NotFound as u8);
}

#[test]
fn test_getq_miss_is_silent() {
    let server = TestServer::start();
    let mut client = Client::connect(server.tcp_port);

    let mut pipeline = key_request(CMD_GETQ, b"no-such-key");
    pipeline.extend_from_slice(&empty_request(CMD_ECHO));
    client.send(&pipeline);

    let (reply, _) = client.read_reply();
    assert_eq!(reply.cmd, CMD_ECHO);
}

#[test]
fn test_getq_hit_batches_with_next_reply() {
    let server = TestServer::start();
    let mut client = Client::connect(server.tcp_port);
    client.set(b"batched", b"bbb", 0, 0);

    let mut pipeline = key_request(CMD_GETQ, b"batched");
    pipeline.extend_from_slice(&empty_request(CMD_ECHO));
    client.send(&pipeline);

    let (reply, body) = client.read_reply();
    assert_eq!(reply.cmd, CMD_GETQ);
    assert_eq!(reply.status, Status::Found as u8);
    assert_eq!(&body[8..], b"bbb");

    let (reply, _) = client.read_reply();
    assert_eq!(reply.cmd, CMD_ECHO);
}

#[test]
fn test_version_echo_quit() {
    let server = TestServer::start();
    let mut client = Client::connect(server.tcp_port);

    client.send(&empty_request(CMD_VERSION));
    let (reply, body) = client.read_reply();
    assert_eq!(reply.status, Status::Ok as u8);
    assert_eq!(body, env!("CARGO_PKG_VERSION").as_bytes());

    client.send(&empty_request(CMD_ECHO));
    assert_eq!(client.read_reply().0.status, Status::Ok as u8);
}

#[test]
fn test_stats_sections() {
    let server = TestServer::start();
    let mut client = Client::connect(server.tcp_port);
    client.set(b"statted", b"v", 0, 0);

    client.send(&string_request(CMD_STATS, b""));
    let (reply, body) = client.read_reply();
    assert_eq!(reply.status, Status::Ok as u8);
    let text = String::from_utf8(body).unwrap();
    assert!(text.contains("STAT curr_items 1"));
    assert!(text.contains("STAT cmd_set 1"));
    assert!(text.ends_with("END\r\n"));

    client.send(&string_request(CMD_STATS, b"allocator"));
    let (_, body) = client.read_reply();
    let text = String::from_utf8(body).unwrap();
    assert!(text.contains("STAT large_free_list_sz"));
    assert!(text.contains("STAT break_events"));

    client.send(&string_request(CMD_STATS, b"buffers"));
    let (_, body) = client.read_reply();
    assert!(String::from_utf8(body).unwrap().contains("STAT total_rsize"));
}

#[test]
fn test_flush_regex_expires_matches() {
    let server = TestServer::start();
    let mut client = Client::connect(server.tcp_port);

    client.set(b"sess:1", b"a", 0, 0);
    client.set(b"sess:2", b"b", 0, 0);
    client.set(b"other", b"c", 0, 0);

    client.send(&string_request(flatcached::proto::wire::CMD_FLUSH_REGEX, b"^sess:"));
    assert_eq!(client.read_reply().0.status, Status::Ok as u8);

    assert_eq!(client.get(b"sess:1").0, Status::NotFound as u8);
    assert_eq!(client.get(b"sess:2").0, Status::NotFound as u8);
    assert_eq!(client.get(b"other").0, Status::Found as u8);
}

#[test]
fn test_bad_magic_gets_servererr_then_close() {
    let server = TestServer::start();
    let mut client = Client::connect(server.tcp_port);

    client.send(&[0xff, 0x20, 0x00, 0x00, 0, 0, 0, 0, 0, 0, 0, 0]);
    let (reply, body) = client.read_reply();
    assert_eq!(reply.cmd, CMD_SERVERERR);
    assert_eq!(reply.status, Status::RemoteError as u8);
    assert!(!body.is_empty());

    // the server closes after the error reply drains
    let mut probe = [0u8; 1];
    match client.stream.read(&mut probe) {
        Ok(0) => {}
        other => panic!("expected EOF after SERVERERR, got {other:?}"),
    }
}

#[test]
fn test_udp_get_round_trip() {
    let server = TestServer::start();
    assert!(server.udp_port != 0);

    let mut tcp = Client::connect(server.tcp_port);
    tcp.set(b"udpkey", b"datagram-value", 0, 0);

    let socket = UdpSocket::bind((Ipv4Addr::LOCALHOST, 0)).unwrap();
    socket
        .set_read_timeout(Some(Duration::from_secs(5)))
        .unwrap();
    let target = SocketAddr::from((Ipv4Addr::LOCALHOST, server.udp_port));

    let mut datagram = udp_header(0x4242, 0, 1).to_vec();
    datagram.extend_from_slice(&key_request(CMD_GET, b"udpkey"));
    socket.send_to(&datagram, target).unwrap();

    let mut buf = [0u8; 2048];
    let (len, _) = socket.recv_from(&mut buf).unwrap();
    let (request_id, payload) = parse_udp_prefix(&buf[..len]).unwrap();
    assert_eq!(request_id, 0x4242);

    let reply = parse_reply(payload).unwrap();
    assert_eq!(reply.status, Status::Found as u8);
    let body = &payload[12..];
    assert_eq!(&body[8..], b"datagram-value");
}

#[test]
fn test_udp_multipacket_request_rejected() {
    let server = TestServer::start();
    let socket = UdpSocket::bind((Ipv4Addr::LOCALHOST, 0)).unwrap();
    socket
        .set_read_timeout(Some(Duration::from_secs(5)))
        .unwrap();
    let target = SocketAddr::from((Ipv4Addr::LOCALHOST, server.udp_port));

    let mut datagram = udp_header(0x7777, 0, 2).to_vec();
    datagram.extend_from_slice(&key_request(CMD_GET, b"x"));
    socket.send_to(&datagram, target).unwrap();

    let mut buf = [0u8; 2048];
    let (len, _) = socket.recv_from(&mut buf).unwrap();
    let (_, payload) = parse_udp_prefix(&buf[..len]).unwrap();
    let reply = parse_reply(payload).unwrap();
    assert_eq!(reply.cmd, CMD_SERVERERR);
    assert_eq!(reply.status, Status::RemoteError as u8);
}

#[test]
fn test_interleaved_set_and_incr_from_two_connections() {
    let server = TestServer::start();
    let mut setup = Client::connect(server.tcp_port);
    setup.set(b"counter", b"0", 0, 0);

    let port = server.tcp_port;
    let per_thread = 250;
    let mut handles = Vec::new();
    for _ in 0..2 {
        handles.push(std::thread::spawn(move || {
            let mut client = Client::connect(port);
            for _ in 0..per_thread {
                client.send(&key_number_request(CMD_INCR, b"counter", 1));
                let (reply, _) = client.read_reply();
                assert_eq!(reply.status, Status::Stored as u8);
            }
        }));
    }
    for handle in handles {
        handle.join().unwrap();
    }

    let (status, _, value) = setup.get(b"counter");
    assert_eq!(status, Status::Found as u8);
    assert_eq!(value, (2 * per_thread).to_string().as_bytes());
}
