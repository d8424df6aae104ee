//! HTTP/1.1 response producer.
//!
//! Parses just enough of each request head to find its end and decide
//! keep-alive, then answers from a small routing table:
//!
//! ```text
//! GET /               configured body (default "Hello World!")
//! GET /api/hola       {"status":"success","requests":N,"engine":"nexus-httpd"}
//! GET /api/version    crate version
//! GET /api/stats      counter snapshot
//! anything else       404, or 405 for methods other than GET
//! ```
//!
//! The connection is kept open unless the client sends `Connection: close`.

pub mod parser;
pub mod responder;

pub use responder::{encode_response, HttpResponder, Status, SERVER_NAME};
