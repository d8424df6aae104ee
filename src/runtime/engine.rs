//! Completion handler for one worker.
//!
//! The engine owns a driver, the connections accepted through it and the
//! read buffer pool backing them. Every turn it waits for completions and
//! dispatches each one through the connection state machine:
//!
//! ```text
//! Accepted -> AwaitingReceive -> AwaitingSend -> AwaitingReceive (keep-alive)
//!                  |                  |
//!                  +---> Closed <-----+
//! ```
//!
//! Exactly one accept is outstanding per engine. Its descriptor is moved
//! between the accept slot and the driver and never dropped; an accept
//! completion re-arms it before the new connection is touched.

use crate::config::Config;
use crate::runtime::buffer::BufferPool;
use crate::runtime::connection::{Connection, ConnectionRegistry};
use crate::runtime::driver::{Completion, Driver};
use crate::runtime::op::{Op, OpKind};
use crate::runtime::protocol::{ProcessResult, ProtocolError, Respond};
use crate::runtime::stats::Stats;
use std::io;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, trace, warn};

/// Per-worker engine settings.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub worker_id: usize,
    /// Connections this worker may hold, and read buffers in its pool.
    pub max_connections: usize,
    /// Size of each read buffer, which caps the request size.
    pub buffer_size: usize,
    /// Initial capacity of the completion batch.
    pub batch_size: usize,
    /// Flush-and-retry attempts when the submission queue is full.
    pub submit_retries: usize,
    /// Upper bound on one wait, so the shutdown flag is observed.
    pub wait_timeout: Option<Duration>,
}

impl EngineConfig {
    pub fn from_config(config: &Config, worker_id: usize) -> Self {
        Self {
            worker_id,
            max_connections: config.max_connections,
            buffer_size: config.buffer_size,
            batch_size: config.batch_size,
            submit_retries: config.submit_retries,
            wait_timeout: config.wait_timeout(),
        }
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            worker_id: 0,
            max_connections: 4096,
            buffer_size: 4096,
            batch_size: 256,
            submit_retries: 8,
            wait_timeout: Some(Duration::from_millis(100)),
        }
    }
}

/// Connection engine driving one completion queue.
pub struct Engine<D: Driver, R: Respond> {
    worker_id: usize,
    driver: D,
    responder: Arc<R>,
    stats: Arc<Stats>,
    connections: ConnectionRegistry,
    buffers: BufferPool,
    /// Holds the accept descriptor whenever the driver does not.
    accept_slot: Option<Op>,
    completions: Vec<Completion>,
    submit_retries: usize,
    wait_timeout: Option<Duration>,
}

impl<D: Driver, R: Respond> Engine<D, R> {
    pub fn new(
        driver: D,
        listener_fd: RawFd,
        responder: Arc<R>,
        stats: Arc<Stats>,
        config: EngineConfig,
    ) -> Self {
        Self {
            worker_id: config.worker_id,
            driver,
            responder,
            stats,
            connections: ConnectionRegistry::new(config.max_connections),
            buffers: BufferPool::new(config.max_connections, config.buffer_size),
            accept_slot: Some(Op::accept(listener_fd)),
            completions: Vec::with_capacity(config.batch_size),
            submit_retries: config.submit_retries,
            wait_timeout: config.wait_timeout,
        }
    }

    /// Arm the accept and push it to the kernel.
    pub fn start(&mut self) -> io::Result<()> {
        self.arm_accept();
        self.driver.flush()?;
        if self.accept_slot.is_some() {
            return Err(io::Error::new(
                io::ErrorKind::Other,
                "failed to arm accept on listener",
            ));
        }
        info!(
            worker = self.worker_id,
            max_connections = self.connections.capacity(),
            buffer_size = self.buffers.buffer_size(),
            "Engine started"
        );
        Ok(())
    }

    /// Run one turn: wait for completions and dispatch them.
    ///
    /// Returns the number of completions handled. An error here is an
    /// error of the completion mechanism itself, not of a connection.
    pub fn wait_and_dispatch(&mut self) -> io::Result<usize> {
        // A deferred accept gets another chance every turn
        if self.accept_slot.is_some() {
            self.arm_accept();
        }

        let mut completions = std::mem::take(&mut self.completions);
        if let Err(e) = self.driver.wait(&mut completions, self.wait_timeout) {
            self.completions = completions;
            return Err(e);
        }

        let count = completions.len();
        for completion in completions.drain(..) {
            self.dispatch(completion);
        }
        self.completions = completions;

        if count > 0 {
            trace!(worker = self.worker_id, count, "Dispatched completions");
        }
        Ok(count)
    }

    /// Serve until `shutdown` is raised.
    pub fn run(&mut self, shutdown: &AtomicBool) -> io::Result<()> {
        self.start()?;
        while !shutdown.load(Ordering::Acquire) {
            self.wait_and_dispatch()?;
        }
        Ok(())
    }

    /// Tear down: cancel everything in flight, reclaim every buffer and
    /// close every connection. Returns the driver.
    pub fn shutdown(mut self) -> D {
        let mut cancelled = Vec::new();
        if let Err(e) = self.driver.cancel_all(&mut cancelled) {
            warn!(worker = self.worker_id, error = %e, "Cancel failed during shutdown");
        }
        for completion in cancelled {
            // An accept can still win the race against its cancel
            if let (OpKind::Accept, Ok(fd)) = (completion.op.kind(), &completion.result) {
                self.driver.close(*fd as RawFd);
            }
            self.reclaim(completion.op);
        }

        let ids = self.connections.ids();
        let open = ids.len();
        for conn_id in ids {
            self.close_connection(conn_id, false);
        }

        info!(
            worker = self.worker_id,
            closed = open,
            buffers_outstanding = self.buffers.outstanding(),
            "Engine stopped"
        );
        self.driver
    }

    /// Route one completion through the state machine.
    pub fn dispatch(&mut self, completion: Completion) {
        let Completion { op, result } = completion;
        match op.kind() {
            OpKind::Accept => self.on_accept(op, result),
            OpKind::Receive => self.on_receive(op, result),
            OpKind::Send => self.on_send(op, result),
        }
    }

    pub fn connections(&self) -> &ConnectionRegistry {
        &self.connections
    }

    pub fn buffers(&self) -> &BufferPool {
        &self.buffers
    }

    pub fn driver(&self) -> &D {
        &self.driver
    }

    pub fn driver_mut(&mut self) -> &mut D {
        &mut self.driver
    }

    /// Whether the accept descriptor is with the driver.
    pub fn accept_armed(&self) -> bool {
        self.accept_slot.is_none()
    }

    fn on_accept(&mut self, op: Op, result: io::Result<usize>) {
        // Re-arm first so new clients never wait on this one
        self.accept_slot = Some(op);
        self.arm_accept();

        let fd = match result {
            Ok(fd) => fd as RawFd,
            Err(e) => {
                self.stats.accept_error();
                warn!(worker = self.worker_id, error = %e, "Accept failed");
                return;
            }
        };

        let buf = match self.buffers.alloc() {
            Some(buf) => buf,
            None => {
                warn!(worker = self.worker_id, fd, "Buffer pool exhausted, rejecting connection");
                self.driver.close(fd);
                return;
            }
        };

        let conn_id = match self.connections.insert(Connection::new(fd, buf)) {
            Ok(id) => id,
            Err(mut conn) => {
                warn!(worker = self.worker_id, fd, "Connection limit reached, rejecting connection");
                if let Some(buf) = conn.close() {
                    self.buffers.free(buf);
                }
                self.driver.close(fd);
                return;
            }
        };

        self.driver.prepare_peer(fd);
        self.stats.connection_accepted();
        debug!(worker = self.worker_id, conn_id, fd, "Accepted connection");

        self.arm_receive(conn_id);
    }

    fn on_receive(&mut self, op: Op, result: io::Result<usize>) {
        let conn_id = op.conn_id();
        let buf = match op.into_read_buf() {
            Some(buf) => buf,
            None => return,
        };
        let conn_id = match conn_id {
            Some(id) if self.connections.contains(id) => id,
            _ => {
                self.buffers.free(buf);
                return;
            }
        };
        if let Some(conn) = self.connections.get_mut(conn_id) {
            conn.receive_completed(buf);
        }

        match result {
            Ok(0) => {
                debug!(worker = self.worker_id, conn_id, "Connection closed by peer");
                self.close_connection(conn_id, false);
            }
            Ok(n) => {
                if let Some(buf) = self.connections.get_mut(conn_id).and_then(|c| c.read_buf_mut()) {
                    buf.commit(n);
                }
                trace!(worker = self.worker_id, conn_id, bytes = n, "Received");
                self.serve(conn_id);
            }
            Err(e) => {
                debug!(worker = self.worker_id, conn_id, error = %e, "Receive failed");
                self.stats.io_error();
                self.close_connection(conn_id, false);
            }
        }
    }

    fn on_send(&mut self, op: Op, result: io::Result<usize>) {
        let conn_id = match op.conn_id() {
            Some(id) if self.connections.contains(id) => id,
            _ => return,
        };
        let payload = op.into_payload().unwrap_or_default();

        let written = match result {
            Ok(0) if !payload.is_empty() => {
                Err(io::Error::new(io::ErrorKind::WriteZero, "zero-byte send"))
            }
            Ok(n) => Ok(n),
            Err(e) => Err(e),
        };

        let conn = match self.connections.get_mut(conn_id) {
            Some(conn) => conn,
            None => return,
        };

        let written = match written {
            Ok(n) => n,
            Err(e) => {
                conn.send_completed(false);
                debug!(worker = self.worker_id, conn_id, error = %e, "Send failed");
                self.stats.io_error();
                self.close_connection(conn_id, false);
                return;
            }
        };

        if written < payload.len() {
            conn.send_completed(false);
            trace!(
                worker = self.worker_id,
                conn_id,
                written,
                remaining = payload.len() - written,
                "Partial send"
            );
            let op = conn.resume_send(conn_id, payload.slice(written..));
            self.submit_for(conn_id, op);
            return;
        }

        conn.send_completed(true);
        let keep_alive = conn.keep_alive();
        let buffered = conn.read_buf().map_or(false, |b| !b.is_empty());
        self.stats.response_sent();

        if !keep_alive {
            debug!(worker = self.worker_id, conn_id, "Closing after response");
            self.close_connection(conn_id, true);
        } else if buffered {
            self.serve(conn_id);
        } else {
            self.arm_receive(conn_id);
        }
    }

    /// Run the producer over the buffered bytes and arm the next operation.
    fn serve(&mut self, conn_id: usize) {
        let (outcome, full, capacity) = {
            let buf = match self.connections.get(conn_id).and_then(|c| c.read_buf()) {
                Some(buf) => buf,
                None => return,
            };
            (
                self.responder.respond(buf.filled()),
                buf.is_full(),
                buf.capacity(),
            )
        };

        match outcome {
            Ok(ProcessResult::NeedData) if full => {
                self.protocol_failure(conn_id, ProtocolError::RequestTooLarge(capacity));
            }
            Ok(ProcessResult::NeedData) => self.arm_receive(conn_id),
            Ok(ProcessResult::Reply(reply)) => {
                let op = match self.connections.get_mut(conn_id) {
                    Some(conn) => {
                        if let Some(buf) = conn.read_buf_mut() {
                            buf.consume(reply.consumed);
                        }
                        conn.arm_send(conn_id, reply.response, reply.keep_alive)
                    }
                    None => return,
                };
                self.submit_for(conn_id, op);
            }
            Err(e) => self.protocol_failure(conn_id, e),
        }
    }

    fn protocol_failure(&mut self, conn_id: usize, error: ProtocolError) {
        debug!(worker = self.worker_id, conn_id, error = %error, "Protocol error");
        self.stats.protocol_error();
        self.close_connection(conn_id, false);
    }

    fn arm_accept(&mut self) {
        if let Some(op) = self.accept_slot.take() {
            if let Err(op) = self.submit(op) {
                warn!(worker = self.worker_id, "Accept deferred to next turn");
                self.accept_slot = Some(op);
            }
        }
    }

    fn arm_receive(&mut self, conn_id: usize) {
        let op = self
            .connections
            .get_mut(conn_id)
            .and_then(|conn| conn.arm_receive(conn_id));
        self.submit_for(conn_id, op);
    }

    /// Submit a connection's descriptor, closing the connection if there is
    /// none or the driver will not take it.
    fn submit_for(&mut self, conn_id: usize, op: Option<Op>) {
        let op = match op {
            Some(op) => op,
            None => {
                warn!(worker = self.worker_id, conn_id, "Connection not in a state to arm I/O");
                self.close_connection(conn_id, false);
                return;
            }
        };
        if let Err(op) = self.submit(op) {
            self.reclaim(op);
            self.close_connection(conn_id, false);
        }
    }

    /// Submit with bounded retry, handing the descriptor back if the driver
    /// keeps refusing it.
    fn submit(&mut self, mut op: Op) -> Result<(), Op> {
        let mut attempts = 0;
        loop {
            match self.driver.submit(op) {
                Ok(()) => return Ok(()),
                Err(e) if e.is_retryable() && attempts < self.submit_retries => {
                    attempts += 1;
                    self.stats.submit_retry();
                    op = e.into_op();
                    if let Err(err) = self.driver.flush() {
                        warn!(worker = self.worker_id, error = %err, "Flush failed");
                    }
                }
                Err(e) => {
                    warn!(worker = self.worker_id, error = %e, attempts, "Submission dropped");
                    return Err(e.into_op());
                }
            }
        }
    }

    /// Return a descriptor's memory to its owner without acting on it.
    fn reclaim(&mut self, op: Op) {
        match op.kind() {
            OpKind::Accept => self.accept_slot = Some(op),
            OpKind::Receive => {
                let conn_id = op.conn_id();
                if let Some(buf) = op.into_read_buf() {
                    match conn_id.and_then(|id| self.connections.get_mut(id)) {
                        Some(conn) => conn.receive_completed(buf),
                        None => self.buffers.free(buf),
                    }
                }
            }
            OpKind::Send => {
                if let Some(conn) = op.conn_id().and_then(|id| self.connections.get_mut(id)) {
                    conn.send_completed(false);
                }
            }
        }
    }

    fn close_connection(&mut self, conn_id: usize, graceful: bool) {
        let mut conn = match self.connections.remove(conn_id) {
            Some(conn) => conn,
            None => return,
        };

        if let Some(kind) = conn.in_flight() {
            warn!(worker = self.worker_id, conn_id, op = ?kind, "Closing with I/O in flight");
        }
        if let Some(buf) = conn.close() {
            self.buffers.free(buf);
        }
        if graceful {
            self.driver.shutdown(conn.fd);
        }
        self.driver.close(conn.fd);
        self.stats.connection_closed();

        debug!(
            worker = self.worker_id,
            conn_id,
            fd = conn.fd,
            exchanges = conn.exchanges(),
            "Connection closed"
        );
    }
}
