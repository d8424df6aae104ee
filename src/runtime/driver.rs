//! The completion queue seam between the engine and an I/O backend.
//!
//! A driver accepts descriptors, runs them asynchronously and reports each
//! one back exactly once as a `Completion`. Implementations:
//! - `uring::UringDriver`: io_uring submission/completion rings (Linux)
//! - `mio::MioDriver`: readiness events turned into completions

use crate::runtime::error::SubmitError;
use crate::runtime::op::Op;
use std::io;
use std::os::unix::io::{BorrowedFd, RawFd};
use std::time::Duration;

/// A finished operation.
///
/// `result` is the byte count for receive and send, and the new peer
/// handle for accept.
#[derive(Debug)]
pub struct Completion {
    pub op: Op,
    pub result: io::Result<usize>,
}

impl Completion {
    pub fn new(op: Op, result: io::Result<usize>) -> Self {
        Self { op, result }
    }

    /// Build a completion from a raw kernel result (negative errno on failure).
    pub fn from_raw(op: Op, res: i32) -> Self {
        let result = if res < 0 {
            Err(io::Error::from_raw_os_error(-res))
        } else {
            Ok(res as usize)
        };
        Self { op, result }
    }
}

/// Asynchronous I/O facility owned by exactly one engine thread.
pub trait Driver {
    /// Enqueue an operation. Never blocks.
    ///
    /// On failure the descriptor is returned inside the error.
    fn submit(&mut self, op: Op) -> Result<(), SubmitError>;

    /// Hand queued submissions to the kernel without waiting.
    fn flush(&mut self) -> io::Result<()>;

    /// Block until at least one operation completes or `timeout` elapses,
    /// appending completions to `out` in the order they are reported.
    fn wait(&mut self, out: &mut Vec<Completion>, timeout: Option<Duration>) -> io::Result<()>;

    /// Operations submitted and not yet delivered.
    fn outstanding(&self) -> usize;

    /// Cancel everything in flight and hand every descriptor back.
    ///
    /// Used at shutdown only.
    fn cancel_all(&mut self, out: &mut Vec<Completion>) -> io::Result<()>;

    /// Apply per-peer socket options to a freshly accepted handle.
    fn prepare_peer(&mut self, fd: RawFd) {
        let fd = unsafe { BorrowedFd::borrow_raw(fd) };
        // Fails harmlessly on local sockets
        let _ = socket2::SockRef::from(&fd).set_nodelay(true);
    }

    /// Half-close the write side so the peer sees an orderly end of stream.
    fn shutdown(&mut self, fd: RawFd) {
        unsafe { libc::shutdown(fd, libc::SHUT_WR) };
    }

    /// Release a peer handle. Called exactly once per accepted connection.
    fn close(&mut self, fd: RawFd) {
        unsafe { libc::close(fd) };
    }
}
