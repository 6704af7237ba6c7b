// SPDX-FileCopyrightText: 2026 ArcheBase
//
// SPDX-License-Identifier: MulanPSL-2.0

//! Worker threads.
//!
//! Each worker runs its own poll loop over a notification pipe and the
//! connections it owns. The dispatcher hands over new connections through
//! a channel plus one byte on the pipe; from then on a connection is
//! processed on this worker for its entire life. The worker drives the
//! protocol state machine on readiness and tears connections down when
//! the machine says so.

use std::collections::HashMap;
use std::os::fd::RawFd;
use std::sync::Arc;
use std::thread::JoinHandle;

use crossbeam_channel::{Receiver, Sender};
use tracing::{debug, info, warn};

use crate::conn::Conn;
use crate::proto::machine::{drive, Drive};
use crate::server::event::{self, PollEntry};
use crate::server::Shared;

/// Poll timeout; bounds shutdown latency.
const POLL_TIMEOUT_MS: i32 = 250;

/// Work handed to a worker.
pub enum WorkerMsg {
    NewConn(Box<Conn>),
}

/// The dispatcher's side of a worker.
pub struct WorkerHandle {
    pub tx: Sender<WorkerMsg>,
    pub notify_send: RawFd,
    pub join: JoinHandle<()>,
}

struct ConnSlot {
    conn: Box<Conn>,
    want_write: bool,
}

/// Spawn one worker thread.
pub fn spawn_worker(id: usize, shared: Arc<Shared>) -> std::io::Result<WorkerHandle> {
    let (tx, rx) = crossbeam_channel::unbounded();
    let (notify_recv, notify_send) = event::notify_pipe()?;

    let join = std::thread::Builder::new()
        .name(format!("worker-{id}"))
        .spawn(move || worker_loop(id, shared, rx, notify_recv))?;

    Ok(WorkerHandle {
        tx,
        notify_send,
        join,
    })
}

fn worker_loop(id: usize, shared: Arc<Shared>, rx: Receiver<WorkerMsg>, notify_recv: RawFd) {
    let mut conns: HashMap<RawFd, ConnSlot> = HashMap::new();
    debug!(worker = id, "worker up");

    loop {
        if shared.is_shutdown() {
            break;
        }

        let mut entries = Vec::with_capacity(conns.len() + 1);
        entries.push(PollEntry::reading(notify_recv));
        for slot in conns.values() {
            entries.push(if slot.want_write {
                PollEntry::writing(slot.conn.fd)
            } else {
                PollEntry::reading(slot.conn.fd)
            });
        }

        match event::poll(&mut entries, POLL_TIMEOUT_MS) {
            Ok(0) => continue,
            Ok(_) => {}
            Err(err) => {
                warn!(worker = id, error = %err, "poll failed");
                continue;
            }
        }

        if entries[0].readable {
            event::drain(notify_recv);
            while let Ok(WorkerMsg::NewConn(conn)) = rx.try_recv() {
                debug!(worker = id, fd = conn.fd, udp = conn.udp, "adopting connection");
                conns.insert(
                    conn.fd,
                    ConnSlot {
                        conn,
                        want_write: false,
                    },
                );
            }
        }

        for entry in &entries[1..] {
            if !(entry.readable || entry.writable || entry.closed) {
                continue;
            }
            let Some(mut slot) = conns.remove(&entry.fd) else {
                continue;
            };

            // a bare hangup with nothing to read means the peer is gone
            let outcome = if entry.closed && !entry.readable && !entry.writable {
                Drive::Close
            } else {
                drive(&mut slot.conn, &shared)
            };

            match outcome {
                Drive::Continue => {
                    slot.want_write = false;
                    conns.insert(entry.fd, slot);
                }
                Drive::WantWrite => {
                    slot.want_write = true;
                    conns.insert(entry.fd, slot);
                }
                Drive::Close => close_conn(&shared, slot.conn),
            }
        }
    }

    info!(worker = id, conns = conns.len(), "worker shutting down");
    for (_, slot) in conns.drain() {
        close_conn(&shared, slot.conn);
    }
    event::close(notify_recv);
}

/// Release everything a connection holds: item references, pool buffers,
/// the socket, and finally the struct itself back to the free list.
pub fn close_conn(shared: &Shared, mut conn: Box<Conn>) {
    {
        let mut storage = shared.storage.lock().unwrap();
        for it in conn.ilist.drain(..) {
            storage.do_item_deref(it);
        }
        if let Some(it) = conn.item.take() {
            storage.do_item_deref(it);
        }
    }

    {
        let mut buffers = shared.buffers.lock().unwrap();
        if let Some(buffer) = conn.rbuf.take() {
            buffers.free(buffer, Some(conn.peak_rusage));
        }
        if let Some(buffer) = conn.string_buf.take() {
            buffers.free(buffer, Some(conn.string_len));
        }
    }

    event::close(conn.fd);
    shared.stats.lock().unwrap().curr_conns -= 1;
    debug!(fd = conn.fd, "connection closed");
    shared.conn_free.put(conn);
}
