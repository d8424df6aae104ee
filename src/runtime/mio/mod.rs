//! mio backend for Linux and macOS.
//!
//! Readiness-based I/O (epoll on Linux, kqueue on macOS) adapted to the
//! completion interface, so the same engine runs on it unchanged.

mod driver;

pub use driver::MioDriver;
