// SPDX-FileCopyrightText: 2026 ArcheBase
//
// SPDX-License-Identifier: MulanPSL-2.0

//! Listener / dispatcher thread.
//!
//! Owns the binary TCP listener and the binary UDP socket. Accepted TCP
//! connections are shed when over `maxconns`, otherwise equipped with a
//! pool buffer and round-robined to workers (channel entry plus one wake
//! byte on the worker's pipe). The UDP socket becomes a long-lived
//! pseudo-connection serviced by worker 0.

use std::net::{Ipv4Addr, SocketAddr, TcpListener, UdpSocket};
use std::os::fd::{IntoRawFd, RawFd};
use std::sync::atomic::Ordering;
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::conn::Conn;
use crate::core::error::{CacheError, Result};
use crate::server::event::{self, PollEntry};
use crate::server::worker::WorkerHandle;
use crate::server::Shared;

const ACCEPT_POLL_TIMEOUT_MS: i32 = 250;

/// Run the dispatcher until shutdown. Binds the configured binary
/// surfaces, then accepts and distributes connections.
pub fn run_dispatcher(shared: &Arc<Shared>, workers: &[WorkerHandle]) -> Result<()> {
    let settings = &shared.settings;

    let listener_fd = if settings.binary_port != 0 || settings.bind_ephemeral {
        let port = if settings.bind_ephemeral {
            0
        } else {
            settings.binary_port
        };
        let listener = TcpListener::bind(SocketAddr::from((settings.interf, port)))?;
        listener.set_nonblocking(true)?;
        let port = listener.local_addr()?.port();
        shared.bound_tcp_port.store(port, Ordering::SeqCst);
        info!(port, "binary TCP listening");
        Some(listener.into_raw_fd())
    } else {
        None
    };

    if settings.binary_udpport != 0 || settings.bind_ephemeral {
        let port = if settings.bind_ephemeral {
            0
        } else {
            settings.binary_udpport
        };
        let socket = UdpSocket::bind(SocketAddr::from((settings.interf, port)))?;
        socket.set_nonblocking(true)?;
        let port = socket.local_addr()?.port();
        shared.bound_udp_port.store(port, Ordering::SeqCst);
        info!(port, "binary UDP listening");
        hand_off_udp(shared, workers, socket.into_raw_fd())?;
    }

    if settings.port != 0 || settings.udpport != 0 || settings.socketpath.is_some() {
        // the ASCII surfaces belong to the text-protocol front end
        warn!("ascii listener settings present; this server only binds the binary surfaces");
    }

    let Some(listener_fd) = listener_fd else {
        // UDP-only deployment: nothing to accept, just wait for shutdown
        while !shared.is_shutdown() {
            std::thread::sleep(std::time::Duration::from_millis(ACCEPT_POLL_TIMEOUT_MS as u64));
        }
        return Ok(());
    };

    let mut next_worker = 0usize;
    while !shared.is_shutdown() {
        let mut entries = [PollEntry::reading(listener_fd)];
        match event::poll(&mut entries, ACCEPT_POLL_TIMEOUT_MS) {
            Ok(0) => continue,
            Ok(_) => {}
            Err(err) => {
                warn!(error = %err, "dispatcher poll failed");
                continue;
            }
        }
        if !entries[0].readable {
            continue;
        }

        loop {
            let mut peer: libc::sockaddr_storage = unsafe { std::mem::zeroed() };
            let mut peer_len = std::mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
            // SAFETY: accept fills the peer sockaddr within its stated
            // size; the listener fd is ours.
            let fd = unsafe {
                libc::accept(
                    listener_fd,
                    &mut peer as *mut libc::sockaddr_storage as *mut libc::sockaddr,
                    &mut peer_len,
                )
            };
            if fd < 0 {
                break; // EAGAIN or transient
            }

            accept_one(shared, workers, fd, &peer, &mut next_worker);
        }
    }

    event::close(listener_fd);
    Ok(())
}

fn accept_one(
    shared: &Arc<Shared>,
    workers: &[WorkerHandle],
    fd: RawFd,
    peer: &libc::sockaddr_storage,
    next_worker: &mut usize,
) {
    if event::set_nonblocking(fd).is_err() {
        event::close(fd);
        return;
    }

    {
        let stats = shared.stats.lock().unwrap();
        if stats.curr_conns >= shared.settings.maxconns as u64 {
            drop(stats);
            debug!(fd, "shedding connection over maxconns");
            event::close(fd);
            return;
        }
    }

    let Some(buffer) = shared.buffers.lock().unwrap().alloc(0) else {
        warn!(fd, "no connection buffer available; shedding");
        event::close(fd);
        return;
    };

    let client_ip = match peer.ss_family as i32 {
        libc::AF_INET => {
            // SAFETY: family says sockaddr_in.
            let sin = unsafe { &*(peer as *const _ as *const libc::sockaddr_in) };
            Some(Ipv4Addr::from(sin.sin_addr.s_addr.to_ne_bytes()))
        }
        _ => None,
    };

    let mut conn = shared.conn_free.get().unwrap_or_else(|| {
        shared.stats.lock().unwrap().conn_structs += 1;
        Box::new(Conn::new())
    });
    conn.reset_for(fd, false, client_ip);
    conn.rbuf = Some(buffer);

    {
        let mut stats = shared.stats.lock().unwrap();
        stats.curr_conns += 1;
        stats.total_conns += 1;
    }

    let target = *next_worker % workers.len();
    *next_worker = next_worker.wrapping_add(1);
    if workers[target]
        .tx
        .send(crate::server::worker::WorkerMsg::NewConn(conn))
        .is_ok()
    {
        event::notify(workers[target].notify_send);
        debug!(fd, worker = target, "dispatched connection");
    } else {
        // worker gone: shutdown is in progress
        shared.stats.lock().unwrap().curr_conns -= 1;
        event::close(fd);
    }
}

/// Wrap the UDP socket in a pseudo-connection owned by worker 0.
fn hand_off_udp(shared: &Arc<Shared>, workers: &[WorkerHandle], fd: RawFd) -> Result<()> {
    let Some(buffer) = shared.buffers.lock().unwrap().alloc(0) else {
        return Err(CacheError::BufferExhausted);
    };

    let mut conn = Box::new(Conn::new());
    conn.reset_for(fd, true, None);
    conn.rbuf = Some(buffer);

    {
        let mut stats = shared.stats.lock().unwrap();
        stats.conn_structs += 1;
        stats.curr_conns += 1;
        stats.total_conns += 1;
    }

    workers[0]
        .tx
        .send(crate::server::worker::WorkerMsg::NewConn(conn))
        .map_err(|_| CacheError::Io("worker 0 is gone".to_string()))?;
    event::notify(workers[0].notify_send);
    Ok(())
}
