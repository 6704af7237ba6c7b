// SPDX-FileCopyrightText: 2026 ArcheBase
//
// SPDX-License-Identifier: MulanPSL-2.0

//! Connection state and the connection-struct free list.
//!
//! A [`Conn`] owns everything one client needs across requests: the
//! socket, a pool-backed read buffer, the parsed request, the receive
//! iovec cursor, the outbound message list, the reply-header pool, and
//! the list of items whose references are released once a transmit
//! completes. Connections are owned by exactly one worker for their whole
//! life, so none of this is synchronized.
//!
//! Closed connections are recycled through a lock-free free list rather
//! than reallocated.

pub mod buffer_pool;

use std::net::{Ipv4Addr, SocketAddr};
use std::os::fd::RawFd;

use crossbeam_queue::ArrayQueue;

use crate::conn::buffer_pool::ConnBuffer;
use crate::proto::reply::ReplyHeaderPool;
use crate::proto::wire::{CmdInfo, Request};
use crate::storage::chunk::ItemPtr;

/// Initial capacity of the per-connection item list; grows by doubling.
pub const ITEM_LIST_INITIAL: usize = 200;

/// Protocol state machine states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    /// Waiting for enough bytes to read the command byte.
    HeaderSizeUnknown,
    /// Command known; waiting for the full fixed header + extras.
    HeaderSizeKnown,
    /// Header consumed; receiving the key.
    WaitingForKey,
    /// Key received; receiving the value into item storage.
    WaitingForValue,
    /// Header consumed; receiving a string argument.
    WaitingForString,
    /// Request complete; dispatch to the command handler.
    Process,
    /// Transmitting the reply.
    Writing,
    /// Tear the connection down.
    Closing,
    /// A SERVERERR reply is queued; close after it drains.
    Error,
}

/// One destination range for readv; advanced in place as bytes land.
#[derive(Debug, Clone, Copy)]
pub struct RecvSeg {
    pub ptr: *mut u8,
    pub len: usize,
}

/// One source range for sendmsg.
#[derive(Debug, Clone, Copy)]
pub struct OutSeg {
    pub ptr: *const u8,
    pub len: usize,
}

/// A sendmsg unit: one datagram for UDP, one reply group for TCP.
#[derive(Debug, Default)]
pub struct OutMsg {
    pub iovs: Vec<OutSeg>,
    /// First iovec not yet fully written.
    pub iov_curr: usize,
}

impl OutMsg {
    /// Whether every iovec of this message has been written.
    pub fn done(&self) -> bool {
        self.iov_curr >= self.iovs.len()
    }
}

/// Per-connection state.
pub struct Conn {
    pub fd: RawFd,
    pub udp: bool,
    pub state: ConnState,

    /// Read staging buffer from the pool.
    pub rbuf: Option<ConnBuffer>,
    /// Offset of the first unparsed byte in `rbuf`.
    pub rcurr: usize,
    /// Unparsed byte count starting at `rcurr`.
    pub rbytes: usize,
    /// High-water usage of `rbuf`, reported to the pool on release.
    pub peak_rusage: usize,

    /// Shape of the request in flight.
    pub info: CmdInfo,
    /// The request in flight (header + extras, aligned copy).
    pub request: Request,
    /// Key of the request in flight.
    pub key: Vec<u8>,

    /// Receive destinations for the key/value/string in flight.
    pub riov: Vec<RecvSeg>,
    pub riov_curr: usize,

    /// Exact-size buffer for string commands.
    pub string_buf: Option<ConnBuffer>,
    pub string_len: usize,

    /// Builder item for set/add/replace/append.
    pub item: Option<ItemPtr>,
    /// Sink for value bytes that arrive after a failed builder
    /// allocation; the command still answers remote-error.
    pub swallow: Vec<u8>,
    /// Items referenced by the outbound reply; deref'd after transmit.
    pub ilist: Vec<ItemPtr>,

    pub reply_pool: ReplyHeaderPool,
    /// Outbound messages; `msgs[msgcurr..]` still have bytes to send.
    pub msgs: Vec<OutMsg>,
    pub msgcurr: usize,

    /// UDP request id of the request in flight.
    pub request_id: u16,
    /// Peer of the most recent UDP request.
    pub request_addr: Option<SocketAddr>,
    /// Client IPv4, stamped into item slack.
    pub client_ip: Option<Ipv4Addr>,
}

// SAFETY: a connection migrates between threads only whole (dispatcher to
// its worker, before any request state exists). The raw pointers it
// carries reference either its own reply pool and buffers, or arena
// memory pinned by the references in `ilist`.
unsafe impl Send for Conn {}

impl Conn {
    pub fn new() -> Self {
        Conn {
            fd: -1,
            udp: false,
            state: ConnState::HeaderSizeUnknown,
            rbuf: None,
            rcurr: 0,
            rbytes: 0,
            peak_rusage: 0,
            info: CmdInfo::default(),
            request: Request::default(),
            key: Vec::with_capacity(256),
            riov: Vec::new(),
            riov_curr: 0,
            string_buf: None,
            string_len: 0,
            item: None,
            swallow: Vec::new(),
            ilist: Vec::with_capacity(ITEM_LIST_INITIAL),
            reply_pool: ReplyHeaderPool::new(),
            msgs: Vec::new(),
            msgcurr: 0,
            request_id: 0,
            request_addr: None,
            client_ip: None,
        }
    }

    /// Re-arm a recycled connection for a fresh socket. The read buffer is
    /// installed by the caller (it comes from the shared pool).
    pub fn reset_for(&mut self, fd: RawFd, udp: bool, client_ip: Option<Ipv4Addr>) {
        self.fd = fd;
        self.udp = udp;
        self.state = ConnState::HeaderSizeUnknown;
        self.rcurr = 0;
        self.rbytes = 0;
        self.peak_rusage = 0;
        self.info = CmdInfo::default();
        self.request = Request::default();
        self.key.clear();
        self.riov.clear();
        self.riov_curr = 0;
        self.string_len = 0;
        self.item = None;
        self.swallow = Vec::new();
        self.ilist.clear();
        self.reply_pool.release();
        self.msgs.clear();
        self.msgcurr = 0;
        self.request_id = 0;
        self.request_addr = None;
        self.client_ip = client_ip;
    }

}

impl Default for Conn {
    fn default() -> Self {
        Self::new()
    }
}

/// Lock-free recycling of connection structs across accepts.
pub struct ConnFreeList {
    queue: ArrayQueue<Box<Conn>>,
}

impl ConnFreeList {
    pub fn new(capacity: usize) -> Self {
        ConnFreeList {
            queue: ArrayQueue::new(capacity.max(1)),
        }
    }

    /// A recycled struct, if one is available.
    pub fn get(&self) -> Option<Box<Conn>> {
        self.queue.pop()
    }

    /// Return a struct for reuse; dropped if the list is full.
    pub fn put(&self, conn: Box<Conn>) {
        let _ = self.queue.push(conn);
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }
}
