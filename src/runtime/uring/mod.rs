//! Linux io_uring backend.
//!
//! Completion-based I/O: receives and sends are handed to the kernel with
//! the descriptor's own buffer and reported back through the completion
//! queue.

mod driver;

pub(crate) use driver::probe;
pub use driver::UringDriver;
