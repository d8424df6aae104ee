//! Readiness-to-completion adapter over mio.
//!
//! Submitted descriptors are queued and their non-blocking syscall is
//! attempted on the next wait. An attempt that would block registers the
//! socket with the poller; the readiness event queues the attempt again.
//! Once the syscall finishes the socket is deregistered and the result is
//! reported as a completion, the same way io_uring would report it.

use crate::runtime::driver::{Completion, Driver};
use crate::runtime::error::SubmitError;
use crate::runtime::op::{Op, OpKind, OpTable};
use mio::unix::SourceFd;
use mio::{Events, Interest, Poll, Token};
use socket2::SockRef;
use std::collections::{HashSet, VecDeque};
use std::io::{self, Read, Write};
use std::os::unix::io::{BorrowedFd, IntoRawFd};
use std::time::Duration;
use tracing::{debug, trace, warn};

pub struct MioDriver {
    poll: Poll,
    events: Events,
    ops: OpTable,
    /// Tokens whose syscall is attempted on the next wait.
    ready: VecDeque<u64>,
    /// Tokens whose socket is registered with the poller.
    registered: HashSet<u64>,
}

impl MioDriver {
    pub fn new(batch_size: usize, capacity: usize) -> io::Result<Self> {
        let poll = Poll::new()?;
        debug!(batch_size, "mio poller created");
        Ok(Self {
            poll,
            events: Events::with_capacity(batch_size.max(1)),
            ops: OpTable::new(capacity),
            ready: VecDeque::with_capacity(capacity),
            registered: HashSet::with_capacity(capacity),
        })
    }

    /// Attempt every queued syscall, completing the ones that finish.
    fn attempt_ready(&mut self, out: &mut Vec<Completion>) -> io::Result<()> {
        let mut retry = VecDeque::new();
        while let Some(token) = self.ready.pop_front() {
            let op = match self.ops.get_mut(token) {
                Some(op) => op,
                None => continue,
            };
            let fd = op.fd();
            let kind = op.kind();

            match attempt(op) {
                Ok(n) => self.complete(token, Ok(n), out),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    if self.registered.insert(token) {
                        let interest = match kind {
                            OpKind::Send => Interest::WRITABLE,
                            _ => Interest::READABLE,
                        };
                        let registered = self.poll.registry().register(
                            &mut SourceFd(&fd),
                            Token(token as usize),
                            interest,
                        );
                        if let Err(e) = registered {
                            self.registered.remove(&token);
                            self.complete(token, Err(e), out);
                        } else {
                            trace!(token, fd, ?kind, "Waiting for readiness");
                        }
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => retry.push_back(token),
                Err(e) => self.complete(token, Err(e), out),
            }
        }
        self.ready = retry;
        Ok(())
    }

    /// Report `token` as finished. The descriptor is always handed back,
    /// even when the poller refuses to let go of its socket.
    fn complete(&mut self, token: u64, result: io::Result<usize>, out: &mut Vec<Completion>) {
        if let Some(op) = self.ops.remove(token) {
            if self.registered.remove(&token) {
                if let Err(e) = self.poll.registry().deregister(&mut SourceFd(&op.fd())) {
                    warn!(token, fd = op.fd(), error = %e, "Failed to deregister socket");
                }
            }
            out.push(Completion::new(op, result));
        }
    }
}

/// Run the non-blocking syscall for `op` once.
fn attempt(op: &mut Op) -> io::Result<usize> {
    let fd = unsafe { BorrowedFd::borrow_raw(op.fd()) };
    let socket = SockRef::from(&fd);
    match op.kind() {
        OpKind::Accept => {
            let (peer, _) = socket.accept()?;
            peer.set_nonblocking(true)?;
            Ok(peer.into_raw_fd() as usize)
        }
        OpKind::Receive => match op.read_buf_mut() {
            Some(buf) => (&*socket).read(buf.spare_mut()),
            None => Ok(0),
        },
        OpKind::Send => match op.payload() {
            Some(payload) => (&*socket).write(payload),
            None => Ok(0),
        },
    }
}

impl Driver for MioDriver {
    fn submit(&mut self, op: Op) -> Result<(), SubmitError> {
        let token = self.ops.insert(op).map_err(SubmitError::AcceptArmed)?;
        self.ready.push_back(token);
        Ok(())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }

    fn wait(&mut self, out: &mut Vec<Completion>, timeout: Option<Duration>) -> io::Result<()> {
        let before = out.len();
        self.attempt_ready(out)?;

        // Only block when nothing finished on the first attempt
        let timeout = if out.len() > before || !self.ready.is_empty() {
            Some(Duration::ZERO)
        } else {
            timeout
        };

        match self.poll.poll(&mut self.events, timeout) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::Interrupted => return Ok(()),
            Err(e) => return Err(e),
        }

        for event in self.events.iter() {
            self.ready.push_back(event.token().0 as u64);
        }
        self.attempt_ready(out)
    }

    fn outstanding(&self) -> usize {
        self.ops.len()
    }

    fn cancel_all(&mut self, out: &mut Vec<Completion>) -> io::Result<()> {
        self.ready.clear();
        for token in self.ops.tokens() {
            self.complete(token, Err(io::Error::from_raw_os_error(libc::ECANCELED)), out);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::buffer::BufferPool;
    use std::io::{Read, Write};
    use std::os::unix::io::AsRawFd;
    use std::os::unix::net::UnixStream;

    fn wait_one(driver: &mut MioDriver) -> Completion {
        let mut out = Vec::new();
        while out.is_empty() {
            driver.wait(&mut out, Some(Duration::from_secs(1))).unwrap();
        }
        assert_eq!(out.len(), 1);
        out.pop().unwrap()
    }

    #[test]
    fn test_receive_after_readiness() {
        let mut driver = MioDriver::new(16, 16).unwrap();
        let (mut client, server) = UnixStream::pair().unwrap();
        server.set_nonblocking(true).unwrap();
        let mut pool = BufferPool::new(1, 64);

        driver
            .submit(Op::receive(0, server.as_raw_fd(), pool.alloc().unwrap()))
            .unwrap();

        // Nothing to read yet: the socket gets registered
        let mut out = Vec::new();
        driver.wait(&mut out, Some(Duration::from_millis(10))).unwrap();
        assert!(out.is_empty());
        assert_eq!(driver.outstanding(), 1);

        client.write_all(b"hello").unwrap();
        let completion = wait_one(&mut driver);
        let n = completion.result.unwrap();
        let mut buf = completion.op.into_read_buf().unwrap();
        buf.commit(n);
        assert_eq!(buf.filled(), b"hello");
        assert_eq!(driver.outstanding(), 0);
    }

    #[test]
    fn test_send_and_eof() {
        let mut driver = MioDriver::new(16, 16).unwrap();
        let (mut client, server) = UnixStream::pair().unwrap();
        server.set_nonblocking(true).unwrap();

        driver
            .submit(Op::send(0, server.as_raw_fd(), bytes::Bytes::from_static(b"pong")))
            .unwrap();
        assert_eq!(wait_one(&mut driver).result.unwrap(), 4);
        let mut got = [0u8; 4];
        client.read_exact(&mut got).unwrap();
        assert_eq!(&got, b"pong");

        let mut pool = BufferPool::new(1, 64);
        driver
            .submit(Op::receive(0, server.as_raw_fd(), pool.alloc().unwrap()))
            .unwrap();
        drop(client);
        assert_eq!(wait_one(&mut driver).result.unwrap(), 0);
    }

    #[test]
    fn test_accept_completion() {
        let mut driver = MioDriver::new(16, 16).unwrap();
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        listener.set_nonblocking(true).unwrap();

        driver.submit(Op::accept(listener.as_raw_fd())).unwrap();
        assert!(matches!(
            driver.submit(Op::accept(listener.as_raw_fd())),
            Err(SubmitError::AcceptArmed(_))
        ));

        let _client = std::net::TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let completion = wait_one(&mut driver);
        assert_eq!(completion.op.kind(), OpKind::Accept);
        let fd = completion.result.unwrap() as i32;
        assert!(fd >= 0);
        unsafe { libc::close(fd) };
    }

    #[test]
    fn test_cancel_returns_descriptors() {
        let mut driver = MioDriver::new(16, 16).unwrap();
        let (_client, server) = UnixStream::pair().unwrap();
        server.set_nonblocking(true).unwrap();
        let mut pool = BufferPool::new(1, 64);

        driver
            .submit(Op::receive(0, server.as_raw_fd(), pool.alloc().unwrap()))
            .unwrap();
        let mut out = Vec::new();
        driver.wait(&mut out, Some(Duration::from_millis(10))).unwrap();

        driver.cancel_all(&mut out).unwrap();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].result.as_ref().unwrap_err().raw_os_error(), Some(libc::ECANCELED));
        assert_eq!(driver.outstanding(), 0);
    }

    #[test]
    fn test_descriptor_returned_when_deregister_fails() {
        let mut driver = MioDriver::new(16, 16).unwrap();
        let (_client, server) = UnixStream::pair().unwrap();
        server.set_nonblocking(true).unwrap();
        let mut pool = BufferPool::new(1, 64);

        driver
            .submit(Op::receive(0, server.as_raw_fd(), pool.alloc().unwrap()))
            .unwrap();
        let mut out = Vec::new();
        driver.wait(&mut out, Some(Duration::from_millis(10))).unwrap();
        assert!(out.is_empty());

        // Closing the socket drops it from the poller behind the driver's back
        drop(server);

        driver.cancel_all(&mut out).unwrap();
        assert_eq!(out.len(), 1);
        assert_eq!(driver.outstanding(), 0);
        pool.free(out.pop().unwrap().op.into_read_buf().unwrap());
        assert_eq!(pool.outstanding(), 0);
    }
}
