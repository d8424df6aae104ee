//! nexus-httpd: a completion-driven HTTP server.
//!
//! The core is the connection engine in `runtime`: one completion queue
//! per worker thread, with every in-flight operation owning the memory it
//! reads into or writes from. Around it:
//! - `protocols::http`: the response producer
//! - `server`: a Tokio backend serving the same producer
//! - `biometric`: Mahalanobis scoring utility
//! - `config`: CLI and TOML configuration

pub mod biometric;
pub mod config;
pub mod protocols;
pub mod runtime;
pub mod server;
