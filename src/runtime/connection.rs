//! Connection state machine for peer sockets.
//!
//! Each connection owns its socket handle and one read buffer, and builds
//! the descriptors for its own receives and sends. Arming refuses to
//! produce a second descriptor while one is in flight, which keeps I/O on
//! the socket strictly sequential.

use crate::runtime::buffer::ReadBuf;
use crate::runtime::op::{Op, OpKind};
use bytes::Bytes;
use slab::Slab;
use std::os::unix::io::RawFd;

/// Lifecycle of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    /// Accepted, no operation armed yet.
    Accepted,
    /// A receive is armed or its data is being processed.
    AwaitingReceive,
    /// A response is being sent.
    AwaitingSend,
    /// Terminal.
    Closed,
}

/// A single peer connection.
#[derive(Debug)]
pub struct Connection {
    /// File descriptor for the socket.
    pub fd: RawFd,
    state: ConnState,
    /// `None` exactly while a receive descriptor holds the buffer.
    read_buf: Option<ReadBuf>,
    buffer_id: usize,
    in_flight: Option<OpKind>,
    keep_alive: bool,
    exchanges: u64,
}

impl Connection {
    /// Create a new connection in `Accepted` state owning `buf`.
    pub fn new(fd: RawFd, buf: ReadBuf) -> Self {
        Self {
            fd,
            state: ConnState::Accepted,
            buffer_id: buf.id(),
            read_buf: Some(buf),
            in_flight: None,
            keep_alive: true,
            exchanges: 0,
        }
    }

    pub fn state(&self) -> ConnState {
        self.state
    }

    /// Operation currently outstanding on this socket.
    pub fn in_flight(&self) -> Option<OpKind> {
        self.in_flight
    }

    /// Identity of the read buffer this connection owns.
    pub fn buffer_id(&self) -> usize {
        self.buffer_id
    }

    /// Whether the last reply asked to keep the connection open.
    pub fn keep_alive(&self) -> bool {
        self.keep_alive
    }

    /// Completed request/response exchanges.
    pub fn exchanges(&self) -> u64 {
        self.exchanges
    }

    /// The read buffer, when no receive holds it.
    pub fn read_buf(&self) -> Option<&ReadBuf> {
        self.read_buf.as_ref()
    }

    pub fn read_buf_mut(&mut self) -> Option<&mut ReadBuf> {
        self.read_buf.as_mut()
    }

    /// Build a receive descriptor, moving the read buffer into it.
    ///
    /// Returns `None` if an operation is in flight, the buffer is away or
    /// the connection is closed.
    pub fn arm_receive(&mut self, conn_id: usize) -> Option<Op> {
        if self.in_flight.is_some() || self.state == ConnState::Closed {
            return None;
        }
        let buf = self.read_buf.take()?;
        self.state = ConnState::AwaitingReceive;
        self.in_flight = Some(OpKind::Receive);
        Some(Op::receive(conn_id, self.fd, buf))
    }

    /// Take the read buffer back from a completed receive.
    pub fn receive_completed(&mut self, buf: ReadBuf) {
        debug_assert_eq!(buf.id(), self.buffer_id, "foreign buffer returned");
        debug_assert_eq!(self.in_flight, Some(OpKind::Receive));
        self.in_flight = None;
        self.read_buf = Some(buf);
    }

    /// Build a send descriptor for a reply.
    ///
    /// Only valid after a receive has come back; `keep_alive` decides what
    /// happens once the payload is fully written.
    pub fn arm_send(&mut self, conn_id: usize, payload: Bytes, keep_alive: bool) -> Option<Op> {
        if self.in_flight.is_some() || self.state != ConnState::AwaitingReceive {
            return None;
        }
        self.state = ConnState::AwaitingSend;
        self.in_flight = Some(OpKind::Send);
        self.keep_alive = keep_alive;
        Some(Op::send(conn_id, self.fd, payload))
    }

    /// Build a send descriptor for the rest of a partially written payload.
    pub fn resume_send(&mut self, conn_id: usize, remaining: Bytes) -> Option<Op> {
        if self.in_flight.is_some() || self.state != ConnState::AwaitingSend {
            return None;
        }
        self.in_flight = Some(OpKind::Send);
        Some(Op::send(conn_id, self.fd, remaining))
    }

    /// Mark the outstanding send as completed.
    ///
    /// `finished` is true once the whole reply has been written; the
    /// connection is then ready for its next request.
    pub fn send_completed(&mut self, finished: bool) {
        debug_assert_eq!(self.in_flight, Some(OpKind::Send));
        self.in_flight = None;
        if finished {
            self.exchanges += 1;
            self.state = ConnState::AwaitingReceive;
        }
    }

    /// Transition to `Closed`, giving back the read buffer if it is home.
    pub fn close(&mut self) -> Option<ReadBuf> {
        self.state = ConnState::Closed;
        self.read_buf.take()
    }
}

/// Registry of active connections using slab allocation.
///
/// Provides O(1) insert, lookup, and remove operations.
pub struct ConnectionRegistry {
    connections: Slab<Connection>,
    max_connections: usize,
}

impl ConnectionRegistry {
    /// Create a new registry with specified maximum capacity.
    pub fn new(max_connections: usize) -> Self {
        Self {
            connections: Slab::with_capacity(max_connections),
            max_connections,
        }
    }

    /// Insert a new connection into the registry.
    ///
    /// Hands the connection back if the registry is at capacity.
    pub fn insert(&mut self, conn: Connection) -> Result<usize, Connection> {
        if self.connections.len() >= self.max_connections {
            return Err(conn);
        }
        Ok(self.connections.insert(conn))
    }

    pub fn get(&self, id: usize) -> Option<&Connection> {
        self.connections.get(id)
    }

    pub fn get_mut(&mut self, id: usize) -> Option<&mut Connection> {
        self.connections.get_mut(id)
    }

    /// Remove a connection, transferring ownership to the caller.
    pub fn remove(&mut self, id: usize) -> Option<Connection> {
        self.connections.try_remove(id)
    }

    pub fn contains(&self, id: usize) -> bool {
        self.connections.contains(id)
    }

    /// Number of active connections.
    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    /// Maximum number of connections allowed.
    pub fn capacity(&self) -> usize {
        self.max_connections
    }

    /// Ids of all active connections.
    pub fn ids(&self) -> Vec<usize> {
        self.connections.iter().map(|(id, _)| id).collect()
    }
}
