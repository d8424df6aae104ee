//! Protocol implementations.
//!
//! Each protocol provides a parser and a `Respond` implementation used by
//! every backend.
//!
//! - `http`: HTTP/1.1 with a fixed body and small JSON API

pub mod http;
