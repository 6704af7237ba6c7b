// SPDX-FileCopyrightText: 2026 ArcheBase
//
// SPDX-License-Identifier: MulanPSL-2.0

//! Binary protocol state machine.
//!
//! Each connection cycles `header_size_unknown → header_size_known →
//! (waiting_for_key | waiting_for_string) → (waiting_for_value) → process
//! → writing → header_size_unknown`, with `closing` and `error` as sinks.
//! Values are received zero-copy: readv lands client bytes directly in
//! the item's chunk-backed iovec chain. Replies are iovec chains
//! referencing the reply-header pool and item storage; nothing is copied
//! on the TCP send path.
//!
//! Quiet variants accumulate: they return straight to header parsing and
//! their queued reply bytes (hits for getq, failures for the others) ride
//! out with the next non-quiet command's transmit. Every item referenced
//! by a queued reply sits in `conn.ilist` holding a refcount until that
//! transmit completes, which is what keeps the arena pointers valid.
//!
//! Locking: the cache lock is taken per storage call and never held
//! across a syscall.

use std::io::ErrorKind;

use tracing::{debug, trace};

use crate::conn::{Conn, ConnState, OutMsg, OutSeg, RecvSeg};
use crate::proto::udp::{packetize, parse_udp_prefix, UDP_MAX_PAYLOAD_SIZE};
use crate::proto::wire::{
    self, cmd_info, parse_request, write_number_extra, write_reply_header, write_value_extras,
    Status, CMD_APPEND, CMD_DECR, CMD_GET, CMD_GETQ, CMD_QUIT, CMD_SERVERERR, CMD_SET,
    EMPTY_REP_SIZE, HEADER_SIZE, NUMBER_REP_SIZE, QUIET_BIT, STRING_REP_SIZE, VALUE_REP_SIZE,
};
use crate::server::Shared;
use crate::storage::items::ItemGet;
use crate::storage::{StoreMode, UnlinkReason};

/// What the worker should do with the connection after driving it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Drive {
    /// Wait for readability.
    Continue,
    /// Wait for writability (transmit hit EAGAIN).
    WantWrite,
    /// Tear the connection down.
    Close,
}

struct HandlerRes {
    stop: bool,
    try_read: bool,
}

impl HandlerRes {
    fn cont() -> Self {
        HandlerRes {
            stop: false,
            try_read: false,
        }
    }
    fn stop() -> Self {
        HandlerRes {
            stop: true,
            try_read: false,
        }
    }
    fn read_more() -> Self {
        HandlerRes {
            stop: false,
            try_read: true,
        }
    }
}

/// Run the state machine until it blocks on I/O or the connection dies.
pub fn drive(conn: &mut Conn, shared: &Shared) -> Drive {
    loop {
        trace!(fd = conn.fd, state = ?conn.state, rbytes = conn.rbytes, "drive");
        let result = match conn.state {
            ConnState::HeaderSizeUnknown => handle_header_size_unknown(conn, shared),
            ConnState::HeaderSizeKnown => handle_header_size_known(conn, shared),
            ConnState::WaitingForKey | ConnState::WaitingForValue | ConnState::WaitingForString => {
                handle_direct_receive(conn, shared)
            }
            ConnState::Process => handle_process(conn, shared),
            ConnState::Writing | ConnState::Error => handle_writing(conn, shared),
            ConnState::Closing => return Drive::Close,
        };

        if result.try_read {
            if conn.udp && conn.msgs.iter().any(|msg| !msg.iovs.is_empty()) {
                // a datagram is the reply boundary: flush accumulated
                // quiet replies before receiving the next request
                transmit_udp(conn, shared);
                continue;
            }
            let got_data = if conn.udp {
                try_read_udp(conn, shared)
            } else {
                try_read_network(conn, shared)
            };
            if got_data {
                continue;
            }
            return Drive::Continue;
        }

        if result.stop {
            return match conn.state {
                ConnState::Writing | ConnState::Error => Drive::WantWrite,
                ConnState::Closing => Drive::Close,
                _ => Drive::Continue,
            };
        }
    }
}

/// Queue a SERVERERR string reply and park the connection in the error
/// state; it closes once the reply drains.
fn write_err_msg(conn: &mut Conn, msg: &'static str) {
    debug!(fd = conn.fd, msg, "protocol error");
    ensure_msg(conn);
    let mut rep = conn.reply_pool.allocate(STRING_REP_SIZE, CMD_SERVERERR, 0);
    write_reply_header(
        rep.bytes_mut(),
        CMD_SERVERERR,
        Status::RemoteError,
        0,
        msg.len() as u32,
    );
    add_iov(conn, rep.as_ptr(), rep.len());
    add_iov(conn, msg.as_ptr(), msg.len());
    conn.state = ConnState::Error;
}

/// Start a new outbound message if none is open.
fn ensure_msg(conn: &mut Conn) {
    if conn.msgs.is_empty() {
        conn.msgs.push(OutMsg::default());
    }
}

/// Append a source range to the current outbound message.
fn add_iov(conn: &mut Conn, ptr: *const u8, len: usize) {
    if len == 0 {
        return;
    }
    ensure_msg(conn);
    conn.msgs
        .last_mut()
        .expect("ensure_msg keeps one open")
        .iovs
        .push(OutSeg { ptr, len });
}

fn handle_header_size_unknown(conn: &mut Conn, _shared: &Shared) -> HandlerRes {
    // magic and command byte are enough to size the header
    if conn.rbytes < 2 {
        return HandlerRes::read_more();
    }

    let (magic, cmd) = {
        let buf = conn.rbuf.as_ref().expect("conn has a read buffer").as_slice();
        (buf[conn.rcurr], buf[conn.rcurr + 1])
    };

    if magic != wire::REQ_MAGIC {
        write_err_msg(conn, "bad request magic");
        return HandlerRes::cont();
    }

    match cmd_info(cmd) {
        Ok(info) => {
            conn.info = info;
            conn.state = ConnState::HeaderSizeKnown;
            HandlerRes::cont()
        }
        Err(_) => {
            write_err_msg(conn, "unknown command");
            HandlerRes::cont()
        }
    }
}

fn handle_header_size_known(conn: &mut Conn, shared: &Shared) -> HandlerRes {
    let header_size = conn.info.header_size;
    if conn.rbytes < header_size {
        return HandlerRes::read_more();
    }

    // copy out of the socket buffer: it carries no alignment guarantee
    let request = {
        let buf = conn.rbuf.as_ref().expect("conn has a read buffer").as_slice();
        match parse_request(&buf[conn.rcurr..conn.rcurr + header_size], &conn.info) {
            Ok(request) => request,
            Err(_) => {
                write_err_msg(conn, "bad request magic");
                return HandlerRes::cont();
            }
        }
    };
    conn.rcurr += header_size;
    conn.rbytes -= header_size;
    conn.request = request;

    if conn.info.has_key {
        let keylen = request.keylen as usize;
        if request.payload_length(&conn.info) < keylen {
            write_err_msg(conn, "body length shorter than key");
            return HandlerRes::cont();
        }

        // a UDP request must be whole within its datagram
        if conn.udp && conn.rbytes < keylen {
            write_err_msg(conn, "UDP requests cannot be split across datagrams");
            return HandlerRes::cont();
        }

        conn.key.clear();
        conn.key.resize(keylen, 0);
        conn.riov.clear();
        conn.riov_curr = 0;
        if keylen > 0 {
            conn.riov.push(RecvSeg {
                ptr: conn.key.as_mut_ptr(),
                len: keylen,
            });
        }
        conn.state = ConnState::WaitingForKey;
    } else if conn.info.has_string {
        let str_size = request.payload_length(&conn.info);
        conn.riov.clear();
        conn.riov_curr = 0;
        conn.string_len = str_size;

        if str_size > 0 {
            let buffer = shared.buffers.lock().unwrap().alloc(str_size);
            match buffer {
                Some(mut buffer) => {
                    if str_size > buffer.len() {
                        shared.buffers.lock().unwrap().free(buffer, Some(0));
                        write_err_msg(conn, "string argument too large");
                        return HandlerRes::cont();
                    }
                    conn.riov.push(RecvSeg {
                        ptr: buffer.as_mut_slice().as_mut_ptr(),
                        len: str_size,
                    });
                    shared
                        .buffers
                        .lock()
                        .unwrap()
                        .report_max_rusage(&buffer, str_size);
                    conn.string_buf = Some(buffer);
                }
                None => {
                    write_err_msg(conn, "out of memory");
                    return HandlerRes::cont();
                }
            }
        }
        conn.state = ConnState::WaitingForString;
    } else {
        conn.state = ConnState::Process;
    }

    HandlerRes::cont()
}

fn handle_direct_receive(conn: &mut Conn, shared: &Shared) -> HandlerRes {
    // drain whatever the read buffer already holds into the destinations
    while conn.rbytes > 0 && conn.riov_curr < conn.riov.len() {
        let seg = &mut conn.riov[conn.riov_curr];
        let take = conn.rbytes.min(seg.len);
        {
            let buf = conn.rbuf.as_ref().expect("conn has a read buffer").as_slice();
            // SAFETY: seg.ptr targets either conn-owned buffers or the
            // value region of the builder item, which this connection
            // exclusively owns until it is linked.
            unsafe {
                std::ptr::copy_nonoverlapping(buf.as_ptr().add(conn.rcurr), seg.ptr, take);
            }
        }
        conn.rcurr += take;
        conn.rbytes -= take;
        // SAFETY: staying within the segment we were handed.
        seg.ptr = unsafe { seg.ptr.add(take) };
        seg.len -= take;
        if seg.len == 0 {
            conn.riov_curr += 1;
        }
    }

    let complete = conn.riov_curr >= conn.riov.len();

    if conn.udp && !complete {
        // the datagram was checked to contain the whole request
        write_err_msg(conn, "UDP requests cannot be split across datagrams");
        return HandlerRes::cont();
    }

    if complete {
        match conn.state {
            ConnState::WaitingForKey => {
                if conn.info.has_value {
                    return setup_value_receive(conn, shared);
                }
                conn.state = ConnState::Process;
            }
            ConnState::WaitingForValue | ConnState::WaitingForString => {
                conn.state = ConnState::Process;
            }
            _ => unreachable!("direct receive in state {:?}", conn.state),
        }
        return HandlerRes::cont();
    }

    // still short: read straight into the remaining destinations
    let iovs: Vec<libc::iovec> = conn.riov[conn.riov_curr..]
        .iter()
        .take(64)
        .map(|seg| libc::iovec {
            iov_base: seg.ptr as *mut libc::c_void,
            iov_len: seg.len,
        })
        .collect();

    // SAFETY: each iovec targets memory this connection exclusively owns
    // (see the copy above); readv writes at most iov_len per segment.
    let res = unsafe { libc::readv(conn.fd, iovs.as_ptr(), iovs.len() as libc::c_int) };

    if res > 0 {
        shared.stats.lock().unwrap().bytes_read += res as u64;
        let mut remaining = res as usize;
        while remaining > 0 {
            let seg = &mut conn.riov[conn.riov_curr];
            let filled = seg.len.min(remaining);
            remaining -= filled;
            // SAFETY: within the segment.
            seg.ptr = unsafe { seg.ptr.add(filled) };
            seg.len -= filled;
            if seg.len == 0 {
                conn.riov_curr += 1;
            }
        }
        return HandlerRes::cont();
    }

    if res == 0 {
        conn.state = ConnState::Closing;
        return HandlerRes::cont();
    }

    let err = std::io::Error::last_os_error();
    if matches!(err.kind(), ErrorKind::WouldBlock | ErrorKind::Interrupted) {
        HandlerRes::stop()
    } else {
        debug!(fd = conn.fd, error = %err, "read failed");
        conn.state = ConnState::Closing;
        HandlerRes::cont()
    }
}

/// Key received for a set-family command: allocate the builder item and
/// aim the receive iovecs at its chunk chain.
fn setup_value_receive(conn: &mut Conn, shared: &Shared) -> HandlerRes {
    let keylen = conn.key.len();
    let value_len = conn.request.payload_length(&conn.info) - keylen;
    let now = shared.clock.now();
    let exptime = shared.clock.realtime(conn.request.exptime);

    if shared.settings.detail_enabled {
        if let Some(prefix) = &shared.prefix_stats {
            prefix.record_set(&conn.key);
        }
    }

    let alloc = {
        let mut storage = shared.storage.lock().unwrap();
        storage
            .item_alloc(
                &conn.key,
                conn.request.flags,
                exptime,
                value_len + 2,
                conn.client_ip,
                now,
            )
            .map(|it| (it, storage.prepare_value_receive(it)))
    };

    match alloc {
        Ok((it, segments)) => {
            conn.item = Some(it);
            conn.riov.clear();
            conn.riov_curr = 0;
            for seg in segments {
                conn.riov.push(RecvSeg {
                    ptr: shared.arena.mut_ptr_at(seg.offset),
                    len: seg.len,
                });
            }
            conn.state = ConnState::WaitingForValue;
        }
        Err(err) => {
            debug!(fd = conn.fd, error = %err, "builder allocation failed");
            if value_len > crate::storage::chunk::MAX_ITEM_SIZE {
                // not worth buffering gigabytes just to say no
                write_err_msg(conn, "object too large for cache");
                return HandlerRes::cont();
            }
            // no storage for the value: swallow it to keep the framing
            // intact, then answer remote-error from the process state
            conn.item = None;
            conn.riov.clear();
            conn.riov_curr = 0;
            if value_len > 0 {
                conn.swallow.clear();
                conn.swallow.resize(value_len, 0);
                conn.riov.push(RecvSeg {
                    ptr: conn.swallow.as_mut_ptr(),
                    len: value_len,
                });
            }
            conn.state = ConnState::WaitingForValue;
        }
    }
    HandlerRes::cont()
}

fn handle_process(conn: &mut Conn, shared: &Shared) -> HandlerRes {
    ensure_msg(conn);

    match conn.request.cmd {
        wire::CMD_ECHO => {
            let rep = empty_reply(conn, Status::Ok);
            queue_reply(conn, rep);
            conn.state = ConnState::Writing;
        }
        CMD_QUIT => {
            conn.state = ConnState::Closing;
        }
        wire::CMD_VERSION => {
            process_version(conn);
        }
        CMD_GET | CMD_GETQ => {
            process_get(conn, shared);
        }
        cmd if cmd & !QUIET_BIT >= CMD_SET && cmd & !QUIET_BIT <= CMD_APPEND => {
            process_update(conn, shared);
        }
        wire::CMD_DELETE | wire::CMD_DELETEQ => {
            process_delete(conn, shared);
        }
        wire::CMD_INCR | CMD_DECR => {
            process_arith(conn, shared);
        }
        wire::CMD_FLUSH_ALL => {
            process_flush_all(conn, shared);
        }
        wire::CMD_FLUSH_REGEX => {
            process_flush_regex(conn, shared);
        }
        wire::CMD_STATS => {
            process_stats(conn, shared);
        }
        _ => unreachable!("cmd_info admitted an unknown command"),
    }

    HandlerRes::cont()
}

/// Allocate and fill an empty reply header.
fn empty_reply(conn: &mut Conn, status: Status) -> crate::proto::reply::ReplyHeader {
    let mut rep = conn
        .reply_pool
        .allocate(EMPTY_REP_SIZE, conn.request.cmd, conn.request.opaque);
    write_reply_header(rep.bytes_mut(), conn.request.cmd, status, conn.request.opaque, 0);
    rep
}

fn queue_reply(conn: &mut Conn, rep: crate::proto::reply::ReplyHeader) {
    add_iov(conn, rep.as_ptr(), rep.len());
}

fn process_version(conn: &mut Conn) {
    const VERSION: &str = env!("CARGO_PKG_VERSION");
    let mut rep = conn
        .reply_pool
        .allocate(STRING_REP_SIZE, conn.request.cmd, conn.request.opaque);
    write_reply_header(
        rep.bytes_mut(),
        conn.request.cmd,
        Status::Ok,
        conn.request.opaque,
        VERSION.len() as u32,
    );
    queue_reply(conn, rep);
    add_iov(conn, VERSION.as_ptr(), VERSION.len());
    conn.state = ConnState::Writing;
}

fn process_get(conn: &mut Conn, shared: &Shared) {
    let quiet = conn.request.quiet();
    let now = shared.clock.now();

    let hit = {
        let mut storage = shared.storage.lock().unwrap();
        match storage.item_get(&conn.key, now) {
            ItemGet::Hit(it) => {
                storage.do_item_update(it, now);
                let header = *storage.table().title(it);
                let segments = storage.value_segments(it);
                Some((it, header, segments))
            }
            // a delete-locked item reads as a miss
            ItemGet::Miss | ItemGet::DeleteLocked => None,
        }
    };

    {
        let mut stats = shared.stats.lock().unwrap();
        stats.get_cmds += 1;
        if hit.is_some() {
            stats.get_hits += 1;
        } else {
            stats.get_misses += 1;
        }
    }
    if shared.settings.detail_enabled {
        if let Some(prefix) = &shared.prefix_stats {
            prefix.record_get(&conn.key, hit.is_some());
        }
    }

    match hit {
        Some((it, header, segments)) => {
            // the reply references item storage; hold the refcount until
            // the transmit completes
            conn.ilist.push(it);

            let value_len = header.nbytes as usize - 2;
            let mut rep = conn
                .reply_pool
                .allocate(VALUE_REP_SIZE, conn.request.cmd, conn.request.opaque);
            write_reply_header(
                rep.bytes_mut(),
                conn.request.cmd,
                Status::Found,
                conn.request.opaque,
                (VALUE_REP_SIZE - HEADER_SIZE + value_len) as u32,
            );
            write_value_extras(rep.bytes_mut(), header.exptime, header.flags);
            queue_reply(conn, rep);
            for seg in segments {
                add_iov(conn, shared.arena.ptr_at(seg.offset), seg.len);
            }
        }
        None => {
            if quiet {
                // silent miss
                conn.state = ConnState::HeaderSizeUnknown;
                return;
            }
            let mut rep = conn
                .reply_pool
                .allocate(VALUE_REP_SIZE, conn.request.cmd, conn.request.opaque);
            write_reply_header(
                rep.bytes_mut(),
                conn.request.cmd,
                Status::NotFound,
                conn.request.opaque,
                (VALUE_REP_SIZE - HEADER_SIZE) as u32,
            );
            write_value_extras(rep.bytes_mut(), 0, 0);
            queue_reply(conn, rep);
        }
    }

    if quiet {
        // the reply (if any) rides out with the next non-quiet transmit
        conn.state = ConnState::HeaderSizeUnknown;
    } else {
        conn.state = ConnState::Writing;
    }
}

fn process_update(conn: &mut Conn, shared: &Shared) {
    let quiet = conn.request.quiet();

    shared.stats.lock().unwrap().set_cmds += 1;

    let Some(it) = conn.item.take() else {
        let rep = empty_reply(conn, Status::RemoteError);
        queue_reply(conn, rep);
        conn.state = ConnState::Writing;
        return;
    };

    let mode = match conn.request.cmd & !QUIET_BIT {
        CMD_SET => StoreMode::Set,
        wire::CMD_ADD => StoreMode::Add,
        wire::CMD_REPLACE => StoreMode::Replace,
        CMD_APPEND => StoreMode::Append,
        other => unreachable!("update dispatch got 0x{other:02x}"),
    };

    let now = shared.clock.now();
    let stored = {
        let mut storage = shared.storage.lock().unwrap();
        let stored = storage.store_item(it, mode, now);
        storage.do_item_deref(it);
        stored
    };

    if quiet && stored {
        conn.state = ConnState::HeaderSizeUnknown;
        return;
    }

    let status = if stored { Status::Stored } else { Status::NotStored };
    let rep = empty_reply(conn, status);
    queue_reply(conn, rep);
    conn.state = ConnState::Writing;
}

fn process_delete(conn: &mut Conn, shared: &Shared) {
    let quiet = conn.request.quiet();
    let now = shared.clock.now();

    if shared.settings.detail_enabled {
        if let Some(prefix) = &shared.prefix_stats {
            prefix.record_delete(&conn.key);
        }
    }

    let found = {
        let mut storage = shared.storage.lock().unwrap();
        match storage.item_get(&conn.key, now) {
            ItemGet::Hit(it) => {
                if conn.request.number == 0 {
                    storage.do_item_unlink(it, UnlinkReason::Normal, now);
                    storage.do_item_deref(it);
                } else {
                    // the queue takes over our reference
                    let deadline = shared.clock.realtime(conn.request.number);
                    storage.defer_delete(it, deadline);
                }
                true
            }
            ItemGet::Miss | ItemGet::DeleteLocked => false,
        }
    };

    if quiet {
        // quiet delete: the success reply is suppressed and a miss is
        // dropped outright, never answered
        conn.state = ConnState::HeaderSizeUnknown;
        return;
    }

    let status = if found { Status::Deleted } else { Status::NotFound };
    let rep = empty_reply(conn, status);
    queue_reply(conn, rep);
    conn.state = ConnState::Writing;
}

fn process_arith(conn: &mut Conn, shared: &Shared) {
    let incr = conn.request.cmd == wire::CMD_INCR;
    let delta = conn.request.number;
    let now = shared.clock.now();

    shared.stats.lock().unwrap().arith_cmds += 1;

    let outcome = {
        let mut storage = shared.storage.lock().unwrap();
        match storage.item_get(&conn.key, now) {
            ItemGet::Hit(it) => {
                let result = storage.add_delta(it, incr, delta, now);
                storage.do_item_deref(it);
                Some(result)
            }
            ItemGet::Miss | ItemGet::DeleteLocked => None,
        }
    };

    let (status, value) = match outcome {
        Some(Ok(value)) => {
            shared.stats.lock().unwrap().arith_hits += 1;
            (Status::Stored, value)
        }
        // the client's fault: the stored value is not a decimal number
        Some(Err(crate::core::error::CacheError::NumericParse { .. })) => (Status::LocalError, 0),
        // numeric but unrepresentable in 32 bits: the server's limit
        Some(Err(crate::core::error::CacheError::NumericRange { .. })) => (Status::RemoteError, 0),
        Some(Err(_)) => (Status::RemoteError, 0),
        None => (Status::NotFound, 0),
    };

    let mut rep = conn
        .reply_pool
        .allocate(NUMBER_REP_SIZE, conn.request.cmd, conn.request.opaque);
    write_reply_header(
        rep.bytes_mut(),
        conn.request.cmd,
        status,
        conn.request.opaque,
        (NUMBER_REP_SIZE - HEADER_SIZE) as u32,
    );
    write_number_extra(rep.bytes_mut(), value);
    queue_reply(conn, rep);
    conn.state = ConnState::Writing;
}

fn process_flush_all(conn: &mut Conn, shared: &Shared) {
    let now = shared.clock.now();
    let oldest = if conn.request.number == 0 {
        now.saturating_sub(1)
    } else {
        shared.clock.realtime(conn.request.number).saturating_sub(1)
    };

    {
        let mut storage = shared.storage.lock().unwrap();
        storage.set_oldest_live(oldest);
        storage.flush_expired(now);
    }

    let rep = empty_reply(conn, Status::Ok);
    queue_reply(conn, rep);
    conn.state = ConnState::Writing;
}

fn process_flush_regex(conn: &mut Conn, shared: &Shared) {
    let pattern = conn
        .string_buf
        .as_ref()
        .map(|buffer| buffer.as_slice()[..conn.string_len].to_vec())
        .unwrap_or_default();
    let now = shared.clock.now();

    let status = match std::str::from_utf8(&pattern)
        .ok()
        .and_then(|p| regex::Regex::new(p).ok())
    {
        Some(re) => {
            let removed = shared.storage.lock().unwrap().expire_regex(&re, now);
            debug!(fd = conn.fd, removed, "flush_regex");
            Status::Ok
        }
        None => Status::LocalError,
    };

    let rep = empty_reply(conn, status);
    queue_reply(conn, rep);
    conn.state = ConnState::Writing;
}

fn process_stats(conn: &mut Conn, shared: &Shared) {
    let section = conn
        .string_buf
        .as_ref()
        .map(|buffer| {
            String::from_utf8_lossy(&buffer.as_slice()[..conn.string_len]).to_string()
        })
        .unwrap_or_default();

    let text = shared.stats_text(section.trim());

    // park the reply body in the string buffer; it lives until the
    // transmit completes
    if conn.string_buf.is_none() {
        match shared.buffers.lock().unwrap().alloc(text.len()) {
            Some(buffer) => conn.string_buf = Some(buffer),
            None => {
                write_err_msg(conn, "out of memory");
                return;
            }
        }
    }
    let buffer = conn.string_buf.as_mut().expect("just ensured");
    if text.len() > buffer.len() {
        write_err_msg(conn, "stats text too large");
        return;
    }
    buffer.as_mut_slice()[..text.len()].copy_from_slice(text.as_bytes());
    shared
        .buffers
        .lock()
        .unwrap()
        .report_max_rusage(buffer, text.len());
    conn.string_len = text.len();

    let mut rep = conn
        .reply_pool
        .allocate(STRING_REP_SIZE, conn.request.cmd, conn.request.opaque);
    write_reply_header(
        rep.bytes_mut(),
        conn.request.cmd,
        Status::Ok,
        conn.request.opaque,
        text.len() as u32,
    );
    queue_reply(conn, rep);
    let ptr = conn.string_buf.as_ref().expect("just ensured").as_ptr() as *const u8;
    add_iov(conn, ptr, text.len());
    conn.state = ConnState::Writing;
}

fn handle_writing(conn: &mut Conn, shared: &Shared) -> HandlerRes {
    if conn.udp {
        return transmit_udp(conn, shared);
    }

    loop {
        // advance past finished messages
        while conn.msgcurr < conn.msgs.len() && conn.msgs[conn.msgcurr].done() {
            conn.msgcurr += 1;
        }

        if conn.msgcurr >= conn.msgs.len() {
            finish_transmit(conn, shared);
            return HandlerRes::cont();
        }

        let msg = &conn.msgs[conn.msgcurr];
        let iovs: Vec<libc::iovec> = msg.iovs[msg.iov_curr..]
            .iter()
            .take(64)
            .map(|seg| libc::iovec {
                iov_base: seg.ptr as *mut libc::c_void,
                iov_len: seg.len,
            })
            .collect();

        // SAFETY: iovecs reference the reply pool (released only after
        // this transmit completes), the string buffer, or item storage
        // pinned via conn.ilist refcounts.
        let res = unsafe {
            let mut hdr: libc::msghdr = std::mem::zeroed();
            hdr.msg_iov = iovs.as_ptr() as *mut libc::iovec;
            hdr.msg_iovlen = iovs.len() as _;
            libc::sendmsg(conn.fd, &hdr, 0)
        };

        if res > 0 {
            shared.stats.lock().unwrap().bytes_written += res as u64;
            let mut written = res as usize;
            let msg = &mut conn.msgs[conn.msgcurr];
            while written > 0 {
                let seg = &mut msg.iovs[msg.iov_curr];
                let sent = seg.len.min(written);
                written -= sent;
                // SAFETY: within the segment.
                seg.ptr = unsafe { seg.ptr.add(sent) };
                seg.len -= sent;
                if seg.len == 0 {
                    msg.iov_curr += 1;
                }
            }
            continue;
        }

        let err = std::io::Error::last_os_error();
        if res < 0 && matches!(err.kind(), ErrorKind::WouldBlock | ErrorKind::Interrupted) {
            return HandlerRes::stop();
        }

        debug!(fd = conn.fd, error = %err, "write failed");
        conn.state = ConnState::Closing;
        return HandlerRes::cont();
    }
}

/// UDP replies: gather the queued iovecs, split into prefixed datagrams,
/// send each to the requester.
fn transmit_udp(conn: &mut Conn, shared: &Shared) -> HandlerRes {
    let mut payload = Vec::new();
    for msg in &conn.msgs {
        for seg in &msg.iovs {
            let old_len = payload.len();
            payload.resize(old_len + seg.len, 0);
            // SAFETY: same pinning rules as the TCP path; a raw copy so
            // no reference is formed over bytes another thread may be
            // rewriting in place.
            unsafe {
                std::ptr::copy_nonoverlapping(seg.ptr, payload[old_len..].as_mut_ptr(), seg.len);
            }
        }
    }

    if let Some(addr) = conn.request_addr {
        let packets = packetize(conn.request_id, &payload, UDP_MAX_PAYLOAD_SIZE);
        for packet in packets {
            let (raw, raw_len) = sockaddr_for(&addr);
            // SAFETY: fd is our UDP socket; the packet buffer is live.
            let res = unsafe {
                libc::sendto(
                    conn.fd,
                    packet.as_ptr() as *const libc::c_void,
                    packet.len(),
                    0,
                    &raw as *const libc::sockaddr_storage as *const libc::sockaddr,
                    raw_len,
                )
            };
            if res >= 0 {
                shared.stats.lock().unwrap().bytes_written += res as u64;
            }
        }
    }

    finish_transmit(conn, shared);
    HandlerRes::cont()
}

fn sockaddr_for(addr: &std::net::SocketAddr) -> (libc::sockaddr_storage, libc::socklen_t) {
    // SAFETY: zeroed sockaddr_storage is a valid all-zero template.
    let mut storage: libc::sockaddr_storage = unsafe { std::mem::zeroed() };
    match addr {
        std::net::SocketAddr::V4(v4) => {
            let sin = libc::sockaddr_in {
                sin_family: libc::AF_INET as libc::sa_family_t,
                sin_port: v4.port().to_be(),
                sin_addr: libc::in_addr {
                    s_addr: u32::from_ne_bytes(v4.ip().octets()),
                },
                sin_zero: [0; 8],
            };
            // SAFETY: sockaddr_in fits within sockaddr_storage.
            unsafe {
                std::ptr::write(&mut storage as *mut _ as *mut libc::sockaddr_in, sin);
            }
            (
                storage,
                std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t,
            )
        }
        std::net::SocketAddr::V6(v6) => {
            let sin6 = libc::sockaddr_in6 {
                sin6_family: libc::AF_INET6 as libc::sa_family_t,
                sin6_port: v6.port().to_be(),
                sin6_flowinfo: v6.flowinfo(),
                sin6_addr: libc::in6_addr {
                    s6_addr: v6.ip().octets(),
                },
                sin6_scope_id: v6.scope_id(),
            };
            // SAFETY: sockaddr_in6 fits within sockaddr_storage.
            unsafe {
                std::ptr::write(&mut storage as *mut _ as *mut libc::sockaddr_in6, sin6);
            }
            (
                storage,
                std::mem::size_of::<libc::sockaddr_in6>() as libc::socklen_t,
            )
        }
    }
}

/// Transmit complete: release item references, reply headers, and the
/// string buffer; error state closes, everything else goes back to
/// header parsing.
fn finish_transmit(conn: &mut Conn, shared: &Shared) {
    {
        let mut storage = shared.storage.lock().unwrap();
        for it in conn.ilist.drain(..) {
            storage.do_item_deref(it);
        }
    }

    conn.msgs.clear();
    conn.msgcurr = 0;
    conn.reply_pool.release();

    if let Some(buffer) = conn.string_buf.take() {
        let used = conn.string_len;
        shared.buffers.lock().unwrap().free(buffer, Some(used));
        conn.string_len = 0;
    }

    // a TCP connection closes after an error reply drains; a UDP
    // pseudo-connection just drops the datagram and keeps serving
    conn.state = if conn.state == ConnState::Error && !conn.udp {
        ConnState::Closing
    } else {
        ConnState::HeaderSizeUnknown
    };
}

/// Pull bytes from the TCP socket into the read buffer, compacting the
/// consumed prefix first. Returns whether any data arrived.
fn try_read_network(conn: &mut Conn, shared: &Shared) -> bool {
    let capacity = conn.rbuf.as_ref().map(|b| b.len()).unwrap_or(0);
    if conn.rcurr != 0 {
        if conn.rbytes != 0 {
            let buf = conn.rbuf.as_mut().expect("conn has a read buffer").as_mut_slice();
            buf.copy_within(conn.rcurr..conn.rcurr + conn.rbytes, 0);
        }
        conn.rcurr = 0;
    }

    let mut got_data = false;
    loop {
        if conn.rbytes >= capacity {
            write_err_msg(conn, "request exceeds buffer capacity");
            return true;
        }

        let res = {
            let buf = conn.rbuf.as_mut().expect("conn has a read buffer").as_mut_slice();
            // SAFETY: reading into our exclusively owned buffer tail.
            unsafe {
                libc::read(
                    conn.fd,
                    buf.as_mut_ptr().add(conn.rbytes) as *mut libc::c_void,
                    capacity - conn.rbytes,
                )
            }
        };

        if res > 0 {
            shared.stats.lock().unwrap().bytes_read += res as u64;
            conn.rbytes += res as usize;
            conn.peak_rusage = conn.peak_rusage.max(conn.rbytes);
            got_data = true;
            continue;
        }
        if res == 0 {
            conn.state = ConnState::Closing;
            return true;
        }

        let err = std::io::Error::last_os_error();
        if matches!(err.kind(), ErrorKind::WouldBlock | ErrorKind::Interrupted) {
            break;
        }
        debug!(fd = conn.fd, error = %err, "read failed");
        conn.state = ConnState::Closing;
        return true;
    }

    got_data
}

/// Receive one UDP request datagram; validates the prefix and stages the
/// payload for the state machine. Returns whether a request is staged.
fn try_read_udp(conn: &mut Conn, shared: &Shared) -> bool {
    let capacity = conn.rbuf.as_ref().map(|b| b.len()).unwrap_or(0);

    let mut peer: libc::sockaddr_storage = unsafe { std::mem::zeroed() };
    let mut peer_len = std::mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;

    let res = {
        let buf = conn.rbuf.as_mut().expect("conn has a read buffer").as_mut_slice();
        // SAFETY: recvfrom writes at most `capacity` bytes into our
        // buffer and fills the peer sockaddr within its stated size.
        unsafe {
            libc::recvfrom(
                conn.fd,
                buf.as_mut_ptr() as *mut libc::c_void,
                capacity,
                0,
                &mut peer as *mut libc::sockaddr_storage as *mut libc::sockaddr,
                &mut peer_len,
            )
        }
    };

    if res < 0 {
        return false;
    }
    let len = res as usize;
    shared.stats.lock().unwrap().bytes_read += len as u64;

    conn.request_addr = sockaddr_to_std(&peer);
    conn.client_ip = match conn.request_addr {
        Some(std::net::SocketAddr::V4(v4)) => Some(*v4.ip()),
        _ => None,
    };

    // a datagram is a whole request; restart the machine on it
    conn.state = ConnState::HeaderSizeUnknown;
    conn.msgs.clear();
    conn.msgcurr = 0;

    let prefix = {
        let buf = conn.rbuf.as_ref().expect("conn has a read buffer").as_slice();
        // save the request id up front so even a rejection echoes it
        if len >= 2 {
            conn.request_id = u16::from_be_bytes([buf[0], buf[1]]);
        }
        parse_udp_prefix(&buf[..len]).map(|(id, payload)| (id, payload.len()))
    };

    match prefix {
        Ok((request_id, payload_len)) => {
            conn.request_id = request_id;
            conn.rcurr = crate::proto::udp::UDP_HEADER_SIZE;
            conn.rbytes = payload_len;
            conn.peak_rusage = conn.peak_rusage.max(len);
            true
        }
        Err(_) => {
            write_err_msg(conn, "multi-packet request not supported");
            // deliver the error reply now
            conn.rbytes = 0;
            conn.rcurr = 0;
            true
        }
    }
}

fn sockaddr_to_std(storage: &libc::sockaddr_storage) -> Option<std::net::SocketAddr> {
    match storage.ss_family as i32 {
        libc::AF_INET => {
            // SAFETY: family says this is a sockaddr_in.
            let sin = unsafe { &*(storage as *const _ as *const libc::sockaddr_in) };
            let ip = std::net::Ipv4Addr::from(sin.sin_addr.s_addr.to_ne_bytes());
            Some(std::net::SocketAddr::from((ip, u16::from_be(sin.sin_port))))
        }
        libc::AF_INET6 => {
            // SAFETY: family says this is a sockaddr_in6.
            let sin6 = unsafe { &*(storage as *const _ as *const libc::sockaddr_in6) };
            let ip = std::net::Ipv6Addr::from(sin6.sin6_addr.s6_addr);
            Some(std::net::SocketAddr::from((
                ip,
                u16::from_be(sin6.sin6_port),
            )))
        }
        _ => None,
    }
}
