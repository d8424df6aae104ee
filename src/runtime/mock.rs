//! Instrumented in-memory driver for engine tests.
//!
//! Completions are produced on demand by the test. The driver panics on
//! anything a real kernel would turn into memory corruption or a leaked
//! handle: a buffer submitted while it is already outstanding, two
//! operations of the same kind on one socket, or a handle closed twice.

use crate::runtime::driver::{Completion, Driver};
use crate::runtime::error::SubmitError;
use crate::runtime::op::{Op, OpKind};
use bytes::Bytes;
use std::collections::{HashSet, VecDeque};
use std::io;
use std::os::unix::io::RawFd;
use std::time::Duration;

#[derive(Default)]
pub struct MockDriver {
    outstanding: Vec<Op>,
    ready: VecDeque<Completion>,
    open: HashSet<RawFd>,
    /// Submissions to refuse with `QueueFull` before accepting again.
    pub refuse: usize,
    pub flushes: usize,
    /// Most accepts ever outstanding at once.
    pub max_accepts: usize,
    pub closed: Vec<RawFd>,
    pub shut_down: Vec<RawFd>,
}

impl MockDriver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn outstanding_accepts(&self) -> usize {
        self.outstanding
            .iter()
            .filter(|op| op.kind() == OpKind::Accept)
            .count()
    }

    pub fn is_outstanding(&self, kind: OpKind, fd: RawFd) -> bool {
        self.outstanding
            .iter()
            .any(|op| op.kind() == kind && op.fd() == fd)
    }

    /// Buffer identity held by the receive outstanding on `fd`.
    pub fn outstanding_buffer(&self, fd: RawFd) -> Option<usize> {
        self.outstanding
            .iter()
            .find(|op| op.kind() == OpKind::Receive && op.fd() == fd)
            .and_then(Op::buffer_id)
    }

    fn take(&mut self, kind: OpKind, fd: Option<RawFd>) -> Op {
        let pos = self
            .outstanding
            .iter()
            .position(|op| op.kind() == kind && fd.map_or(true, |fd| op.fd() == fd))
            .unwrap_or_else(|| panic!("no outstanding {:?} on {:?}", kind, fd));
        self.outstanding.remove(pos)
    }

    pub fn complete_accept(&mut self, peer_fd: RawFd) {
        let op = self.take(OpKind::Accept, None);
        assert!(self.open.insert(peer_fd), "fd {} already open", peer_fd);
        self.ready.push_back(Completion::new(op, Ok(peer_fd as usize)));
    }

    pub fn fail_accept(&mut self, errno: i32) {
        let op = self.take(OpKind::Accept, None);
        self.ready.push_back(Completion::from_raw(op, -errno));
    }

    /// Deliver `data` into the receive outstanding on `fd`.
    pub fn complete_receive(&mut self, fd: RawFd, data: &[u8]) {
        let mut op = self.take(OpKind::Receive, Some(fd));
        let spare = op
            .read_buf_mut()
            .expect("receive without buffer")
            .spare_mut();
        assert!(data.len() <= spare.len(), "receive larger than buffer");
        spare[..data.len()].copy_from_slice(data);
        self.ready.push_back(Completion::new(op, Ok(data.len())));
    }

    pub fn complete_receive_eof(&mut self, fd: RawFd) {
        let op = self.take(OpKind::Receive, Some(fd));
        self.ready.push_back(Completion::new(op, Ok(0)));
    }

    pub fn fail_receive(&mut self, fd: RawFd, errno: i32) {
        let op = self.take(OpKind::Receive, Some(fd));
        self.ready.push_back(Completion::from_raw(op, -errno));
    }

    /// Write the whole payload of the send outstanding on `fd`.
    pub fn complete_send(&mut self, fd: RawFd) -> Bytes {
        let op = self.take(OpKind::Send, Some(fd));
        let payload = op.payload().cloned().unwrap_or_default();
        self.ready.push_back(Completion::new(op, Ok(payload.len())));
        payload
    }

    /// Write only the first `n` bytes of the outstanding send.
    pub fn complete_send_partial(&mut self, fd: RawFd, n: usize) -> Bytes {
        let op = self.take(OpKind::Send, Some(fd));
        let payload = op.payload().cloned().unwrap_or_default();
        assert!(n < payload.len(), "partial send must leave bytes behind");
        self.ready.push_back(Completion::new(op, Ok(n)));
        payload.slice(..n)
    }

    pub fn fail_send(&mut self, fd: RawFd, errno: i32) {
        let op = self.take(OpKind::Send, Some(fd));
        self.ready.push_back(Completion::from_raw(op, -errno));
    }
}

impl Driver for MockDriver {
    fn submit(&mut self, op: Op) -> Result<(), SubmitError> {
        if self.refuse > 0 {
            self.refuse -= 1;
            return Err(SubmitError::QueueFull(op));
        }
        if op.kind() == OpKind::Accept && self.outstanding_accepts() > 0 {
            return Err(SubmitError::AcceptArmed(op));
        }
        if let Some(id) = op.buffer_id() {
            assert!(
                !self.outstanding.iter().any(|o| o.buffer_id() == Some(id)),
                "buffer {} submitted while outstanding",
                id
            );
        }
        assert!(
            !self.is_outstanding(op.kind(), op.fd()),
            "overlapping {:?} on fd {}",
            op.kind(),
            op.fd()
        );

        self.outstanding.push(op);
        self.max_accepts = self.max_accepts.max(self.outstanding_accepts());
        Ok(())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.flushes += 1;
        Ok(())
    }

    fn wait(&mut self, out: &mut Vec<Completion>, _timeout: Option<Duration>) -> io::Result<()> {
        out.extend(self.ready.drain(..));
        Ok(())
    }

    fn outstanding(&self) -> usize {
        self.outstanding.len() + self.ready.len()
    }

    fn cancel_all(&mut self, out: &mut Vec<Completion>) -> io::Result<()> {
        out.extend(self.ready.drain(..));
        for op in self.outstanding.drain(..) {
            out.push(Completion::from_raw(op, -libc::ECANCELED));
        }
        Ok(())
    }

    fn prepare_peer(&mut self, _fd: RawFd) {}

    fn shutdown(&mut self, fd: RawFd) {
        self.shut_down.push(fd);
    }

    fn close(&mut self, fd: RawFd) {
        assert!(self.open.remove(&fd), "fd {} closed twice or never opened", fd);
        self.closed.push(fd);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::buffer::BufferPool;

    #[test]
    #[should_panic(expected = "submitted while outstanding")]
    fn test_outstanding_buffer_resubmitted() {
        let mut driver = MockDriver::new();
        let mut first = BufferPool::new(1, 16);
        let mut second = BufferPool::new(1, 16);

        // Both pools hand out id 0, standing in for a buffer still with the kernel
        driver.submit(Op::receive(0, 10, first.alloc().unwrap())).unwrap();
        let _ = driver.submit(Op::receive(1, 11, second.alloc().unwrap()));
    }

    #[test]
    #[should_panic(expected = "overlapping Receive")]
    fn test_overlapping_receive() {
        let mut driver = MockDriver::new();
        let mut pool = BufferPool::new(2, 16);
        driver.submit(Op::receive(0, 10, pool.alloc().unwrap())).unwrap();
        let _ = driver.submit(Op::receive(0, 10, pool.alloc().unwrap()));
    }

    #[test]
    fn test_completed_buffer_can_be_resubmitted() {
        let mut driver = MockDriver::new();
        let mut pool = BufferPool::new(1, 16);
        driver.submit(Op::receive(0, 10, pool.alloc().unwrap())).unwrap();
        driver.complete_receive(10, b"ping");

        let mut out = Vec::new();
        driver.wait(&mut out, None).unwrap();
        let buf = out.pop().unwrap().op.into_read_buf().unwrap();
        driver.submit(Op::receive(0, 10, buf)).unwrap();
        assert_eq!(driver.outstanding_buffer(10), Some(0));
    }

    #[test]
    #[should_panic(expected = "closed twice")]
    fn test_double_close() {
        let mut driver = MockDriver::new();
        driver.submit(Op::accept(3)).unwrap();
        driver.complete_accept(20);
        driver.close(20);
        driver.close(20);
    }
}
