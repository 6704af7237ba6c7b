// SPDX-FileCopyrightText: 2026 ArcheBase
//
// SPDX-License-Identifier: MulanPSL-2.0

//! Wire-format conformance: exact byte layouts for each request shape
//! and the UDP packetizer.

use flatcached::proto::udp::{packetize, parse_udp_prefix, udp_header, UDP_HEADER_SIZE};
use flatcached::proto::wire::{
    cmd_info, encode_request, parse_reply, parse_request, Request, CMD_DELETE, CMD_FLUSH_ALL,
    CMD_GET, CMD_INCR, CMD_SET, CMD_STATS, HEADER_SIZE,
};

#[test]
fn test_get_request_is_bit_exact() {
    // magic 0x50, cmd 0x20 (get), keylen 3, reserved 0, opaque 0,
    // body_length 3 (network order), then "key"
    let info = cmd_info(CMD_GET).unwrap();
    let mut bytes = encode_request(
        &Request {
            cmd: CMD_GET,
            keylen: 3,
            body_length: 3,
            ..Default::default()
        },
        &info,
    );
    bytes.extend_from_slice(b"key");

    assert_eq!(
        bytes,
        [
            0x50, 0x20, 0x03, 0x00, // magic, cmd, keylen, reserved
            0x00, 0x00, 0x00, 0x00, // opaque
            0x00, 0x00, 0x00, 0x03, // body_length
            0x6B, 0x65, 0x79, // "key"
        ]
    );
}

#[test]
fn test_key_value_request_layout() {
    let info = cmd_info(CMD_SET).unwrap();
    let request = Request {
        cmd: CMD_SET,
        keylen: 1,
        body_length: 8 + 1 + 2,
        exptime: 0x01020304,
        flags: 0x0a0b0c0d,
        ..Default::default()
    };
    let bytes = encode_request(&request, &info);

    assert_eq!(bytes.len(), HEADER_SIZE + 8);
    assert_eq!(&bytes[12..16], &[0x01, 0x02, 0x03, 0x04]);
    assert_eq!(&bytes[16..20], &[0x0a, 0x0b, 0x0c, 0x0d]);

    let parsed = parse_request(&bytes, &info).unwrap();
    assert_eq!(parsed.exptime, 0x01020304);
    assert_eq!(parsed.flags, 0x0a0b0c0d);
    assert_eq!(parsed.payload_length(&info), 3);
}

#[test]
fn test_number_shapes_carry_the_number() {
    for cmd in [CMD_DELETE, CMD_INCR, CMD_FLUSH_ALL] {
        let info = cmd_info(cmd).unwrap();
        assert_eq!(info.header_size, HEADER_SIZE + 4);
        let bytes = encode_request(
            &Request {
                cmd,
                number: 0xcafe,
                ..Default::default()
            },
            &info,
        );
        let parsed = parse_request(&bytes, &info).unwrap();
        assert_eq!(parsed.number, 0xcafe);
    }
}

#[test]
fn test_string_shape_has_no_extras() {
    let info = cmd_info(CMD_STATS).unwrap();
    assert_eq!(info.header_size, HEADER_SIZE);
    assert!(info.has_string);
}

#[test]
fn test_reply_parse_rejects_request_magic() {
    let mut bytes = vec![0u8; HEADER_SIZE];
    bytes[0] = 0x50;
    assert!(parse_reply(&bytes).is_err());
}

#[test]
fn test_udp_packetizer_round_trip() {
    let payload: Vec<u8> = (0u8..=255).collect();
    let packets = packetize(0xbeef, &payload, 100);
    assert_eq!(packets.len(), 3);

    let mut reassembled = Vec::new();
    for (index, packet) in packets.iter().enumerate() {
        assert_eq!(&packet[..UDP_HEADER_SIZE], &udp_header(0xbeef, index as u16, 3));
        reassembled.extend_from_slice(&packet[UDP_HEADER_SIZE..]);
    }
    assert_eq!(reassembled, payload);

    // a single-part packet parses back as a valid request prefix
    let single = packetize(7, b"ping", 1400);
    let (id, body) = parse_udp_prefix(&single[0]).unwrap();
    assert_eq!(id, 7);
    assert_eq!(body, b"ping");
}
