//! io_uring completion queue driver.
//!
//! Each submitted descriptor is parked in an `OpTable` and its token sent
//! as the SQE `user_data`. The kernel reads from or writes into memory the
//! parked descriptor owns; the descriptor only leaves the table when its
//! CQE is reaped, so that memory outlives the operation.

use crate::runtime::driver::{Completion, Driver};
use crate::runtime::error::SubmitError;
use crate::runtime::op::{Op, OpKind, OpTable};
use io_uring::{opcode, squeue, types, IoUring};
use std::io;
use std::ptr;
use std::time::Duration;
use tracing::{debug, warn};

/// `user_data` of cancel requests issued at shutdown.
const CANCEL_TOKEN: u64 = u64::MAX - 1;
/// `user_data` of the timeout SQE used when the kernel lacks wait arguments.
const TIMEOUT_TOKEN: u64 = u64::MAX - 2;

/// Wait rounds given to cancellations before leftovers are abandoned.
const CANCEL_ROUNDS: usize = 16;

pub struct UringDriver {
    ring: IoUring,
    ops: OpTable,
    batch_size: usize,
    /// Kernel supports a timeout argument on `io_uring_enter`.
    ext_arg: bool,
    timeout_armed: bool,
    /// Read by the kernel when a timeout SQE is prepared.
    timeout_spec: Box<types::Timespec>,
}

impl UringDriver {
    /// Create a ring with `ring_size` submission entries.
    pub fn new(ring_size: u32, batch_size: usize, capacity: usize) -> io::Result<Self> {
        let ring = IoUring::new(ring_size)?;
        let ext_arg = ring.params().is_feature_ext_arg();

        debug!(ring_size, ext_arg, "io_uring instance created");

        Ok(Self {
            ring,
            ops: OpTable::new(capacity),
            batch_size: batch_size.max(1),
            ext_arg,
            timeout_armed: false,
            timeout_spec: Box::new(types::Timespec::new()),
        })
    }

    /// Enter the kernel, submitting everything queued and waiting for
    /// `want` completions. Interruptions count as success.
    fn enter(&mut self, want: usize) -> io::Result<()> {
        match self.ring.submit_and_wait(want) {
            Ok(_) => Ok(()),
            Err(e) if is_transient(&e) => Ok(()),
            Err(e) => Err(e),
        }
    }

    fn enter_with_timeout(&mut self, timeout: Duration) -> io::Result<()> {
        if self.ext_arg {
            let ts = timespec(timeout);
            let args = types::SubmitArgs::new().timespec(&ts);
            return match self.ring.submitter().submit_with_args(1, &args) {
                Ok(_) => Ok(()),
                Err(e) if is_transient(&e) || e.raw_os_error() == Some(libc::ETIME) => Ok(()),
                Err(e) => Err(e),
            };
        }

        if !self.timeout_armed {
            *self.timeout_spec = timespec(timeout);
            let entry = opcode::Timeout::new(&*self.timeout_spec as *const types::Timespec)
                .build()
                .user_data(TIMEOUT_TOKEN);
            // The kernel copies the timespec during submission
            self.timeout_armed = unsafe { self.ring.submission().push(&entry) }.is_ok();
        }
        self.enter(1)
    }

    /// Move up to one batch of reaped CQEs into `out`.
    fn drain(&mut self, out: &mut Vec<Completion>) {
        for cqe in self.ring.completion().take(self.batch_size) {
            let token = cqe.user_data();
            match token {
                CANCEL_TOKEN => continue,
                TIMEOUT_TOKEN => {
                    self.timeout_armed = false;
                    continue;
                }
                _ => {}
            }
            match self.ops.remove(token) {
                Some(op) => out.push(Completion::from_raw(op, cqe.result())),
                None => warn!(token, "Unknown token in completion"),
            }
        }
    }
}

/// Build the SQE for `op`, pointing at memory the descriptor owns.
fn prepare(op: &mut Op) -> squeue::Entry {
    let fd = types::Fd(op.fd());
    match op.kind() {
        OpKind::Accept => opcode::Accept::new(fd, ptr::null_mut(), ptr::null_mut())
            .flags(libc::SOCK_CLOEXEC)
            .build(),
        OpKind::Receive => {
            let (buf, len) = match op.read_buf_mut() {
                Some(read_buf) => {
                    let spare = read_buf.spare_mut();
                    (spare.as_mut_ptr(), spare.len())
                }
                None => (ptr::null_mut(), 0),
            };
            opcode::Recv::new(fd, buf, len as u32).build()
        }
        OpKind::Send => {
            let (buf, len) = op
                .payload()
                .map_or((ptr::null(), 0), |payload| (payload.as_ptr(), payload.len()));
            opcode::Send::new(fd, buf, len as u32)
                .flags(libc::MSG_NOSIGNAL)
                .build()
        }
    }
}

fn timespec(timeout: Duration) -> types::Timespec {
    types::Timespec::new()
        .sec(timeout.as_secs())
        .nsec(timeout.subsec_nanos())
}

fn is_transient(e: &io::Error) -> bool {
    matches!(e.raw_os_error(), Some(libc::EINTR) | Some(libc::EBUSY))
}

impl Driver for UringDriver {
    fn submit(&mut self, mut op: Op) -> Result<(), SubmitError> {
        if self.ring.submission().is_full() {
            return Err(SubmitError::QueueFull(op));
        }

        // Buffers live on the heap, so the pointers survive the move into the table
        let entry = prepare(&mut op);
        let token = self.ops.insert(op).map_err(SubmitError::AcceptArmed)?;
        let entry = entry.user_data(token);

        // The table keeps the descriptor, and with it the memory behind the
        // SQE, alive until the CQE for `token` is reaped.
        if unsafe { self.ring.submission().push(&entry) }.is_err() {
            if let Some(op) = self.ops.remove(token) {
                return Err(SubmitError::QueueFull(op));
            }
        }
        Ok(())
    }

    fn flush(&mut self) -> io::Result<()> {
        match self.ring.submit() {
            Ok(_) => Ok(()),
            Err(e) if is_transient(&e) => Ok(()),
            Err(e) => Err(e),
        }
    }

    fn wait(&mut self, out: &mut Vec<Completion>, timeout: Option<Duration>) -> io::Result<()> {
        if self.ring.completion().is_empty() {
            match timeout {
                Some(timeout) => self.enter_with_timeout(timeout)?,
                None => self.enter(1)?,
            }
        } else {
            self.flush()?;
        }
        self.drain(out);
        Ok(())
    }

    fn outstanding(&self) -> usize {
        self.ops.len()
    }

    fn cancel_all(&mut self, out: &mut Vec<Completion>) -> io::Result<()> {
        for token in self.ops.tokens() {
            let entry = opcode::AsyncCancel::new(token)
                .build()
                .user_data(CANCEL_TOKEN);
            if unsafe { self.ring.submission().push(&entry) }.is_err() {
                self.flush()?;
                if unsafe { self.ring.submission().push(&entry) }.is_err() {
                    warn!(token, "Submission queue full, cancel skipped");
                }
            }
        }

        let mut rounds = 0;
        while !self.ops.is_empty() && rounds < CANCEL_ROUNDS {
            rounds += 1;
            self.wait(out, Some(Duration::from_millis(10)))?;
        }

        if !self.ops.is_empty() {
            warn!(remaining = self.ops.len(), "Operations still in flight after cancel");
        }
        Ok(())
    }
}

impl Drop for UringDriver {
    fn drop(&mut self) {
        // The kernel may still write into buffers of unreaped operations
        let ops = std::mem::replace(&mut self.ops, OpTable::new(0));
        if !ops.is_empty() {
            warn!(count = ops.len(), "Leaking descriptors still owned by the kernel");
            std::mem::forget(ops);
        }
    }
}

/// Whether this kernel lets the process create a ring.
pub fn probe() -> bool {
    IoUring::new(8).is_ok()
}
