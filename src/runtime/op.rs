//! Operation descriptors and completion correlation.
//!
//! An `Op` describes one asynchronous I/O request handed to a driver. It
//! owns the memory the kernel reads from or writes into, so the buffer
//! cannot be touched by anyone else until the completion hands the
//! descriptor back.
//!
//! Drivers park outstanding descriptors in an `OpTable`, keyed by the token
//! sent along with the request (io_uring `user_data`, mio `Token`).

use crate::runtime::buffer::ReadBuf;
use bytes::Bytes;
use slab::Slab;
use std::os::unix::io::RawFd;

/// Token reserved for the accept descriptor.
pub const ACCEPT_TOKEN: u64 = u64::MAX;

/// Kind of in-flight operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpKind {
    /// Accept on the listener socket.
    Accept,
    /// Receive into the connection's read buffer.
    Receive,
    /// Send a response payload.
    Send,
}

/// Memory owned by a descriptor while it is outstanding.
#[derive(Debug)]
pub enum OpBuffer {
    /// Accept does not transfer data.
    Empty,
    /// The connection's read buffer; data lands in its spare region.
    Read(ReadBuf),
    /// Payload still to be transmitted.
    Write(Bytes),
}

/// One asynchronous I/O request.
#[derive(Debug)]
pub struct Op {
    kind: OpKind,
    fd: RawFd,
    conn_id: Option<usize>,
    buffer: OpBuffer,
}

impl Op {
    /// Accept descriptor for `listener_fd`. Not owned by any connection.
    pub fn accept(listener_fd: RawFd) -> Self {
        Self {
            kind: OpKind::Accept,
            fd: listener_fd,
            conn_id: None,
            buffer: OpBuffer::Empty,
        }
    }

    /// Receive descriptor that takes ownership of the connection's buffer.
    pub fn receive(conn_id: usize, fd: RawFd, buf: ReadBuf) -> Self {
        Self {
            kind: OpKind::Receive,
            fd,
            conn_id: Some(conn_id),
            buffer: OpBuffer::Read(buf),
        }
    }

    /// Send descriptor for `payload`.
    pub fn send(conn_id: usize, fd: RawFd, payload: Bytes) -> Self {
        Self {
            kind: OpKind::Send,
            fd,
            conn_id: Some(conn_id),
            buffer: OpBuffer::Write(payload),
        }
    }

    #[inline]
    pub fn kind(&self) -> OpKind {
        self.kind
    }

    /// Socket the operation targets.
    #[inline]
    pub fn fd(&self) -> RawFd {
        self.fd
    }

    /// Owning connection, `None` for accept.
    #[inline]
    pub fn conn_id(&self) -> Option<usize> {
        self.conn_id
    }

    /// Identity of the read buffer this descriptor holds, if any.
    pub fn buffer_id(&self) -> Option<usize> {
        match &self.buffer {
            OpBuffer::Read(buf) => Some(buf.id()),
            _ => None,
        }
    }

    pub fn read_buf_mut(&mut self) -> Option<&mut ReadBuf> {
        match &mut self.buffer {
            OpBuffer::Read(buf) => Some(buf),
            _ => None,
        }
    }

    pub fn payload(&self) -> Option<&Bytes> {
        match &self.buffer {
            OpBuffer::Write(payload) => Some(payload),
            _ => None,
        }
    }

    /// Give the read buffer back, consuming the descriptor.
    pub fn into_read_buf(self) -> Option<ReadBuf> {
        match self.buffer {
            OpBuffer::Read(buf) => Some(buf),
            _ => None,
        }
    }

    /// Give the payload back, consuming the descriptor.
    pub fn into_payload(self) -> Option<Bytes> {
        match self.buffer {
            OpBuffer::Write(payload) => Some(payload),
            _ => None,
        }
    }
}

/// Outstanding descriptors of one driver, with O(1) token lookup.
///
/// Receive and send descriptors live in a slab; the accept descriptor has
/// its own slot under `ACCEPT_TOKEN` so at most one can ever be outstanding.
pub struct OpTable {
    ops: Slab<Op>,
    accept: Option<Op>,
}

impl OpTable {
    /// Create a table sized for `capacity` descriptors.
    pub fn new(capacity: usize) -> Self {
        Self {
            ops: Slab::with_capacity(capacity),
            accept: None,
        }
    }

    /// Park a descriptor and return its token.
    ///
    /// A second accept is refused and handed back.
    pub fn insert(&mut self, op: Op) -> Result<u64, Op> {
        if op.kind() == OpKind::Accept {
            if self.accept.is_some() {
                return Err(op);
            }
            self.accept = Some(op);
            return Ok(ACCEPT_TOKEN);
        }
        Ok(self.ops.insert(op) as u64)
    }

    pub fn get(&self, token: u64) -> Option<&Op> {
        if token == ACCEPT_TOKEN {
            self.accept.as_ref()
        } else {
            self.ops.get(token as usize)
        }
    }

    pub fn get_mut(&mut self, token: u64) -> Option<&mut Op> {
        if token == ACCEPT_TOKEN {
            self.accept.as_mut()
        } else {
            self.ops.get_mut(token as usize)
        }
    }

    /// Remove a descriptor when its completion arrives.
    ///
    /// Returns `None` for unknown or already removed tokens, which makes
    /// completion delivery at-most-once.
    pub fn remove(&mut self, token: u64) -> Option<Op> {
        if token == ACCEPT_TOKEN {
            return self.accept.take();
        }
        self.ops.try_remove(token as usize)
    }

    /// Tokens of all outstanding descriptors.
    pub fn tokens(&self) -> Vec<u64> {
        let mut tokens: Vec<u64> = self.ops.iter().map(|(idx, _)| idx as u64).collect();
        if self.accept.is_some() {
            tokens.push(ACCEPT_TOKEN);
        }
        tokens
    }

    /// Whether the accept descriptor is outstanding.
    pub fn accept_armed(&self) -> bool {
        self.accept.is_some()
    }

    /// Number of outstanding descriptors, accept included.
    pub fn len(&self) -> usize {
        self.ops.len() + usize::from(self.accept.is_some())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
