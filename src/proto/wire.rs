// SPDX-FileCopyrightText: 2026 ArcheBase
//
// SPDX-License-Identifier: MulanPSL-2.0

//! Binary wire format.
//!
//! Every request and reply starts with a 12-byte fixed header:
//! `magic(1) cmd(1) keylen|status(1) reserved(1) opaque(4) body_length(4)`.
//! `body_length` is network byte order and counts everything after the
//! fixed header; `opaque` is echoed back verbatim. The command byte packs
//! a request/reply shape in its high nibble, a quiet bit (`0x08`), and a
//! sub-opcode in the low three bits. Quiet variants elide success replies.
//!
//! Key/value requests carry `exptime(4) flags(4)` extras, key/number and
//! number requests carry `number(4)`; value replies carry
//! `exptime(4) flags(4)`, number replies carry `value(4)`.

use byteorder::{ByteOrder, NetworkEndian};

use crate::core::error::{CacheError, Result};

/// Request magic byte.
pub const REQ_MAGIC: u8 = 0x50;
/// Reply magic byte.
pub const REP_MAGIC: u8 = 0xA0;

/// Fixed header length.
pub const HEADER_SIZE: usize = 12;

/// Quiet bit in the command byte.
pub const QUIET_BIT: u8 = 0x08;

// shape nibbles (request → reply)
const SHAPE_E_E: u8 = 0x0 << 4;
const SHAPE_E_S: u8 = 0x1 << 4;
const SHAPE_K_V: u8 = 0x2 << 4;
const SHAPE_KV_E: u8 = 0x3 << 4;
const SHAPE_KN_E: u8 = 0x4 << 4;
const SHAPE_KN_N: u8 = 0x5 << 4;
const SHAPE_N_E: u8 = 0x6 << 4;
const SHAPE_S_E: u8 = 0x7 << 4;
const SHAPE_S_S: u8 = 0x8 << 4;

pub const CMD_ECHO: u8 = SHAPE_E_E;
pub const CMD_QUIT: u8 = SHAPE_E_E | 0x1;
pub const CMD_VERSION: u8 = SHAPE_E_S;
/// Reply-only pseudo-command carrying an out-of-band error string.
pub const CMD_SERVERERR: u8 = SHAPE_E_S | 0x1;
pub const CMD_GET: u8 = SHAPE_K_V;
pub const CMD_GETQ: u8 = SHAPE_K_V | QUIET_BIT;
pub const CMD_SET: u8 = SHAPE_KV_E;
pub const CMD_ADD: u8 = SHAPE_KV_E | 0x1;
pub const CMD_REPLACE: u8 = SHAPE_KV_E | 0x2;
pub const CMD_APPEND: u8 = SHAPE_KV_E | 0x3;
pub const CMD_SETQ: u8 = CMD_SET | QUIET_BIT;
pub const CMD_ADDQ: u8 = CMD_ADD | QUIET_BIT;
pub const CMD_REPLACEQ: u8 = CMD_REPLACE | QUIET_BIT;
pub const CMD_APPENDQ: u8 = CMD_APPEND | QUIET_BIT;
pub const CMD_DELETE: u8 = SHAPE_KN_E;
pub const CMD_DELETEQ: u8 = SHAPE_KN_E | QUIET_BIT;
pub const CMD_INCR: u8 = SHAPE_KN_N;
pub const CMD_DECR: u8 = SHAPE_KN_N | 0x1;
pub const CMD_FLUSH_ALL: u8 = SHAPE_N_E;
pub const CMD_FLUSH_REGEX: u8 = SHAPE_S_E;
pub const CMD_STATS: u8 = SHAPE_S_S;

/// Reply status byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Status {
    Ok = 0,
    Found = 1,
    Stored = 2,
    NotStored = 3,
    NotFound = 4,
    Deleted = 5,
    RemoteError = 6,
    LocalError = 7,
}

/// Shape-derived facts about a request, driving the state machine.
#[derive(Debug, Clone, Copy, Default)]
pub struct CmdInfo {
    /// Fixed header plus extras.
    pub header_size: usize,
    pub has_key: bool,
    pub has_value: bool,
    pub has_string: bool,
}

/// Table lookup from command byte to request shape. Unknown commands are
/// a framing error.
pub fn cmd_info(cmd: u8) -> Result<CmdInfo> {
    let info = match cmd {
        CMD_ECHO | CMD_QUIT | CMD_VERSION => CmdInfo {
            header_size: HEADER_SIZE,
            ..Default::default()
        },
        CMD_GET | CMD_GETQ => CmdInfo {
            header_size: HEADER_SIZE,
            has_key: true,
            ..Default::default()
        },
        CMD_SET | CMD_ADD | CMD_REPLACE | CMD_APPEND | CMD_SETQ | CMD_ADDQ | CMD_REPLACEQ
        | CMD_APPENDQ => CmdInfo {
            header_size: HEADER_SIZE + 8,
            has_key: true,
            has_value: true,
            ..Default::default()
        },
        CMD_DELETE | CMD_DELETEQ | CMD_INCR | CMD_DECR => CmdInfo {
            header_size: HEADER_SIZE + 4,
            has_key: true,
            ..Default::default()
        },
        CMD_FLUSH_ALL => CmdInfo {
            header_size: HEADER_SIZE + 4,
            ..Default::default()
        },
        CMD_FLUSH_REGEX | CMD_STATS => CmdInfo {
            header_size: HEADER_SIZE,
            has_string: true,
            ..Default::default()
        },
        other => {
            return Err(CacheError::protocol(
                "request header",
                format!("unknown command 0x{}", hex::encode([other])),
            ))
        }
    };
    Ok(info)
}

/// A parsed request: the fixed header plus any shape extras.
#[derive(Debug, Clone, Copy, Default)]
pub struct Request {
    pub cmd: u8,
    pub keylen: u8,
    pub opaque: u32,
    pub body_length: u32,
    /// key_value extras.
    pub exptime: u32,
    pub flags: u32,
    /// key_number / number extras.
    pub number: u32,
}

impl Request {
    /// Is this a quiet variant?
    #[inline]
    pub fn quiet(&self) -> bool {
        self.cmd & QUIET_BIT != 0
    }

    /// Bytes of body remaining after the extras (key+value or string).
    pub fn payload_length(&self, info: &CmdInfo) -> usize {
        (self.body_length as usize).saturating_sub(info.header_size - HEADER_SIZE)
    }
}

/// Parse the full request header (fixed part + extras) from `buf`, which
/// must hold at least `info.header_size` bytes. Copies into an owned
/// struct since the socket buffer carries no alignment guarantee.
pub fn parse_request(buf: &[u8], info: &CmdInfo) -> Result<Request> {
    debug_assert!(buf.len() >= info.header_size);

    if buf[0] != REQ_MAGIC {
        return Err(CacheError::protocol(
            "request header",
            format!("bad magic 0x{}", hex::encode([buf[0]])),
        ));
    }

    let mut request = Request {
        cmd: buf[1],
        keylen: buf[2],
        opaque: NetworkEndian::read_u32(&buf[4..8]),
        body_length: NetworkEndian::read_u32(&buf[8..12]),
        ..Default::default()
    };

    match info.header_size - HEADER_SIZE {
        0 => {}
        4 => request.number = NetworkEndian::read_u32(&buf[12..16]),
        8 => {
            request.exptime = NetworkEndian::read_u32(&buf[12..16]);
            request.flags = NetworkEndian::read_u32(&buf[16..20]);
        }
        other => unreachable!("no request shape has {other} extra bytes"),
    }

    Ok(request)
}

/// Encode a request header; test and client-side helper.
pub fn encode_request(request: &Request, info: &CmdInfo) -> Vec<u8> {
    let mut buf = vec![0u8; info.header_size];
    buf[0] = REQ_MAGIC;
    buf[1] = request.cmd;
    buf[2] = request.keylen;
    NetworkEndian::write_u32(&mut buf[4..8], request.opaque);
    NetworkEndian::write_u32(&mut buf[8..12], request.body_length);
    match info.header_size - HEADER_SIZE {
        0 => {}
        4 => NetworkEndian::write_u32(&mut buf[12..16], request.number),
        8 => {
            NetworkEndian::write_u32(&mut buf[12..16], request.exptime);
            NetworkEndian::write_u32(&mut buf[16..20], request.flags);
        }
        _ => unreachable!(),
    }
    buf
}

/// Reply sizes per shape, fixed header included.
pub const EMPTY_REP_SIZE: usize = HEADER_SIZE;
pub const STRING_REP_SIZE: usize = HEADER_SIZE;
pub const VALUE_REP_SIZE: usize = HEADER_SIZE + 8;
pub const NUMBER_REP_SIZE: usize = HEADER_SIZE + 4;

/// Fill a reply's fixed header in place. `body_length` counts extras plus
/// payload.
pub fn write_reply_header(buf: &mut [u8], cmd: u8, status: Status, opaque: u32, body_length: u32) {
    debug_assert!(buf.len() >= HEADER_SIZE);
    buf[0] = REP_MAGIC;
    buf[1] = cmd;
    buf[2] = status as u8;
    buf[3] = 0;
    NetworkEndian::write_u32(&mut buf[4..8], opaque);
    NetworkEndian::write_u32(&mut buf[8..12], body_length);
}

/// Fill a value reply's extras (exptime, flags) after the fixed header.
pub fn write_value_extras(buf: &mut [u8], exptime: u32, flags: u32) {
    debug_assert!(buf.len() >= VALUE_REP_SIZE);
    NetworkEndian::write_u32(&mut buf[12..16], exptime);
    NetworkEndian::write_u32(&mut buf[16..20], flags);
}

/// Fill a number reply's extra (the computed value).
pub fn write_number_extra(buf: &mut [u8], value: u32) {
    debug_assert!(buf.len() >= NUMBER_REP_SIZE);
    NetworkEndian::write_u32(&mut buf[12..16], value);
}

/// A parsed reply header; test and client-side helper.
#[derive(Debug, Clone, Copy)]
pub struct Reply {
    pub cmd: u8,
    pub status: u8,
    pub opaque: u32,
    pub body_length: u32,
}

pub fn parse_reply(buf: &[u8]) -> Result<Reply> {
    if buf.len() < HEADER_SIZE {
        return Err(CacheError::protocol("reply header", "short header"));
    }
    if buf[0] != REP_MAGIC {
        return Err(CacheError::protocol(
            "reply header",
            format!("bad magic 0x{}", hex::encode([buf[0]])),
        ));
    }
    Ok(Reply {
        cmd: buf[1],
        status: buf[2],
        opaque: NetworkEndian::read_u32(&buf[4..8]),
        body_length: NetworkEndian::read_u32(&buf[8..12]),
    })
}
