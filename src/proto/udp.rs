// SPDX-FileCopyrightText: 2026 ArcheBase
//
// SPDX-License-Identifier: MulanPSL-2.0

//! UDP datagram framing.
//!
//! Every UDP request and reply carries an 8-byte big-endian prefix:
//! `request-id(2) part-no(2) n-parts(2) reserved(2)`. Multi-packet
//! requests are rejected outright. Replies that exceed the payload bound
//! are split into numbered parts sharing the request id; the packetizer
//! is a pure function so it tests without sockets.

use byteorder::{ByteOrder, NetworkEndian};

use crate::core::error::{CacheError, Result};

/// Datagram prefix length.
pub const UDP_HEADER_SIZE: usize = 8;

/// Maximum reply payload per datagram, prefix excluded.
pub const UDP_MAX_PAYLOAD_SIZE: usize = 1400;

/// Receive-buffer sizing for UDP pseudo-connections.
pub const UDP_READ_BUFFER_SIZE: usize = 65536;

/// Validate a request datagram's prefix; returns the request id and the
/// payload after the prefix.
pub fn parse_udp_prefix(datagram: &[u8]) -> Result<(u16, &[u8])> {
    if datagram.len() <= UDP_HEADER_SIZE {
        return Err(CacheError::protocol("udp prefix", "datagram too short"));
    }

    let request_id = NetworkEndian::read_u16(&datagram[0..2]);
    let part_no = NetworkEndian::read_u16(&datagram[2..4]);
    let n_parts = NetworkEndian::read_u16(&datagram[4..6]);

    if part_no != 0 || n_parts != 1 {
        return Err(CacheError::UdpFragmentation);
    }

    Ok((request_id, &datagram[UDP_HEADER_SIZE..]))
}

/// Build the prefix for part `part_no` of `n_parts`.
pub fn udp_header(request_id: u16, part_no: u16, n_parts: u16) -> [u8; UDP_HEADER_SIZE] {
    let mut header = [0u8; UDP_HEADER_SIZE];
    NetworkEndian::write_u16(&mut header[0..2], request_id);
    NetworkEndian::write_u16(&mut header[2..4], part_no);
    NetworkEndian::write_u16(&mut header[4..6], n_parts);
    header
}

/// Split a reply into datagrams of at most `max_payload` payload bytes,
/// each prefixed with a numbered header. An empty reply still produces
/// one packet so the client sees its request id answered.
pub fn packetize(request_id: u16, payload: &[u8], max_payload: usize) -> Vec<Vec<u8>> {
    debug_assert!(max_payload > 0);
    let n_parts = payload.len().div_ceil(max_payload).max(1);

    let mut packets = Vec::with_capacity(n_parts);
    for part in 0..n_parts {
        let start = part * max_payload;
        let end = (start + max_payload).min(payload.len());
        let mut packet = Vec::with_capacity(UDP_HEADER_SIZE + (end - start));
        packet.extend_from_slice(&udp_header(request_id, part as u16, n_parts as u16));
        packet.extend_from_slice(&payload[start..end]);
        packets.push(packet);
    }
    packets
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prefix_round_trip() {
        let mut datagram = udp_header(0x1234, 0, 1).to_vec();
        datagram.extend_from_slice(b"payload");

        let (request_id, payload) = parse_udp_prefix(&datagram).unwrap();
        assert_eq!(request_id, 0x1234);
        assert_eq!(payload, b"payload");
    }

    #[test]
    fn test_multi_packet_requests_rejected() {
        let mut datagram = udp_header(7, 0, 2).to_vec();
        datagram.extend_from_slice(b"x");
        assert!(matches!(
            parse_udp_prefix(&datagram),
            Err(CacheError::UdpFragmentation)
        ));

        let mut datagram = udp_header(7, 1, 1).to_vec();
        datagram.extend_from_slice(b"x");
        assert!(parse_udp_prefix(&datagram).is_err());
    }

    #[test]
    fn test_short_datagram_rejected() {
        assert!(parse_udp_prefix(&[0u8; 8]).is_err());
    }

    #[test]
    fn test_packetize_single() {
        let packets = packetize(9, b"hello", 1400);
        assert_eq!(packets.len(), 1);
        assert_eq!(&packets[0][..8], &udp_header(9, 0, 1));
        assert_eq!(&packets[0][8..], b"hello");
    }

    #[test]
    fn test_packetize_split() {
        let payload: Vec<u8> = (0..10).collect();
        let packets = packetize(3, &payload, 4);
        assert_eq!(packets.len(), 3);

        assert_eq!(&packets[0][..8], &udp_header(3, 0, 3));
        assert_eq!(&packets[0][8..], &[0, 1, 2, 3]);
        assert_eq!(&packets[1][..8], &udp_header(3, 1, 3));
        assert_eq!(&packets[1][8..], &[4, 5, 6, 7]);
        assert_eq!(&packets[2][..8], &udp_header(3, 2, 3));
        assert_eq!(&packets[2][8..], &[8, 9]);
    }

    #[test]
    fn test_packetize_empty_reply_still_answers() {
        let packets = packetize(5, b"", 1400);
        assert_eq!(packets.len(), 1);
        assert_eq!(&packets[0][..], &udp_header(5, 0, 1));
    }
}
