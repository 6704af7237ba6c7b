// SPDX-FileCopyrightText: 2026 ArcheBase
//
// SPDX-License-Identifier: MulanPSL-2.0

//! Minimal poll-based event loop.
//!
//! This is the network-event collaborator the engine expects: readable/
//! writable notification per file descriptor and nothing else. Workers
//! rebuild their interest set every round from their connection tables,
//! which keeps the state here trivially small.

use std::io;
use std::os::fd::RawFd;

/// Interest plus outcome for one descriptor in a poll round.
#[derive(Debug, Clone, Copy)]
pub struct PollEntry {
    pub fd: RawFd,
    /// Also wait for writability (a transmit hit EAGAIN).
    pub want_write: bool,
    pub readable: bool,
    pub writable: bool,
    /// Peer hung up or the descriptor errored.
    pub closed: bool,
}

impl PollEntry {
    pub fn reading(fd: RawFd) -> Self {
        PollEntry {
            fd,
            want_write: false,
            readable: false,
            writable: false,
            closed: false,
        }
    }

    pub fn writing(fd: RawFd) -> Self {
        PollEntry {
            want_write: true,
            ..Self::reading(fd)
        }
    }
}

/// Wait for events on the given descriptors. Fills the outcome flags and
/// returns how many descriptors fired.
pub fn poll(entries: &mut [PollEntry], timeout_ms: i32) -> io::Result<usize> {
    let mut fds: Vec<libc::pollfd> = entries
        .iter()
        .map(|entry| libc::pollfd {
            fd: entry.fd,
            events: libc::POLLIN | if entry.want_write { libc::POLLOUT } else { 0 },
            revents: 0,
        })
        .collect();

    // SAFETY: fds is a live, correctly sized array of pollfd.
    let res = unsafe { libc::poll(fds.as_mut_ptr(), fds.len() as libc::nfds_t, timeout_ms) };
    if res < 0 {
        let err = io::Error::last_os_error();
        if err.kind() == io::ErrorKind::Interrupted {
            return Ok(0);
        }
        return Err(err);
    }

    for (entry, fd) in entries.iter_mut().zip(&fds) {
        entry.readable = fd.revents & libc::POLLIN != 0;
        entry.writable = fd.revents & libc::POLLOUT != 0;
        entry.closed = fd.revents & (libc::POLLHUP | libc::POLLERR | libc::POLLNVAL) != 0;
    }

    Ok(res as usize)
}

/// A nonblocking notification pipe: (receive end, send end).
pub fn notify_pipe() -> io::Result<(RawFd, RawFd)> {
    let mut fds = [0 as RawFd; 2];
    // SAFETY: plain pipe(2) into a live two-element array.
    if unsafe { libc::pipe(fds.as_mut_ptr()) } != 0 {
        return Err(io::Error::last_os_error());
    }
    set_nonblocking(fds[0])?;
    Ok((fds[0], fds[1]))
}

/// Wake the worker owning the receive end of `fd`.
pub fn notify(fd: RawFd) {
    // SAFETY: one byte from a live buffer; a full pipe just means the
    // worker is already awake.
    unsafe {
        libc::write(fd, b"w".as_ptr() as *const libc::c_void, 1);
    }
}

/// Drain a notification pipe.
pub fn drain(fd: RawFd) {
    let mut buf = [0u8; 64];
    loop {
        // SAFETY: reading into a live stack buffer.
        let res = unsafe { libc::read(fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len()) };
        if res <= 0 {
            break;
        }
    }
}

pub fn set_nonblocking(fd: RawFd) -> io::Result<()> {
    // SAFETY: fcntl on a descriptor we own.
    unsafe {
        let flags = libc::fcntl(fd, libc::F_GETFL, 0);
        if flags < 0 || libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) < 0 {
            return Err(io::Error::last_os_error());
        }
    }
    Ok(())
}

pub fn close(fd: RawFd) {
    // SAFETY: closing a descriptor we own; errors are of no use here.
    unsafe {
        libc::close(fd);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pipe_notify_and_drain() {
        let (recv, send) = notify_pipe().unwrap();
        notify(send);
        notify(send);

        let mut entries = [PollEntry::reading(recv)];
        let fired = poll(&mut entries, 100).unwrap();
        assert_eq!(fired, 1);
        assert!(entries[0].readable);

        drain(recv);
        let mut entries = [PollEntry::reading(recv)];
        let fired = poll(&mut entries, 0).unwrap();
        assert_eq!(fired, 0);

        close(recv);
        close(send);
    }

    #[test]
    fn test_poll_timeout() {
        let (recv, send) = notify_pipe().unwrap();
        let mut entries = [PollEntry::reading(recv)];
        let fired = poll(&mut entries, 10).unwrap();
        assert_eq!(fired, 0);
        assert!(!entries[0].readable);
        close(recv);
        close(send);
    }
}
