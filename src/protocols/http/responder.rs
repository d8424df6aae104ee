//! Request routing and response encoding.

use super::parser::{self, ParseResult, RequestHead};
use crate::config::Config;
use crate::runtime::protocol::{ProcessResult, ProtocolError, Reply, Respond};
use crate::runtime::stats::Stats;
use bytes::{Bytes, BytesMut};
use chrono::Utc;
use std::fmt::Write;
use std::sync::Arc;

/// Value of the `Server` header and the `engine` field of API replies.
pub const SERVER_NAME: &str = "nexus-httpd";

const JSON: &str = "application/json";

/// Response status line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Ok,
    NotFound,
    MethodNotAllowed,
}

impl Status {
    pub fn code(self) -> u16 {
        match self {
            Status::Ok => 200,
            Status::NotFound => 404,
            Status::MethodNotAllowed => 405,
        }
    }

    pub fn reason(self) -> &'static str {
        match self {
            Status::Ok => "OK",
            Status::NotFound => "Not Found",
            Status::MethodNotAllowed => "Method Not Allowed",
        }
    }
}

/// Response producer serving a fixed body plus a few JSON endpoints.
pub struct HttpResponder {
    body: Bytes,
    content_type: String,
    stats: Arc<Stats>,
}

impl HttpResponder {
    pub fn new(body: impl Into<Bytes>, content_type: impl Into<String>, stats: Arc<Stats>) -> Self {
        Self {
            body: body.into(),
            content_type: content_type.into(),
            stats,
        }
    }

    pub fn from_config(config: &Config, stats: Arc<Stats>) -> Self {
        Self::new(config.body.clone(), config.content_type.clone(), stats)
    }

    /// Pick status, content type and body for a request.
    fn route(&self, head: &RequestHead<'_>, requests: u64) -> (Status, &str, Bytes) {
        if head.method != b"GET" {
            return (
                Status::MethodNotAllowed,
                JSON,
                Bytes::from_static(b"{\"error\":\"method not allowed\"}"),
            );
        }

        let target = head.target;
        if head.path() == b"/" {
            (Status::Ok, self.content_type.as_str(), self.body.clone())
        } else if contains(target, b"/api/hola") {
            let body = format!(
                "{{\"status\":\"success\",\"requests\":{},\"engine\":\"{}\"}}",
                requests, SERVER_NAME
            );
            (Status::Ok, JSON, Bytes::from(body))
        } else if contains(target, b"/api/version") {
            let body = format!(
                "{{\"version\":\"{}\",\"engine\":\"{}\"}}",
                env!("CARGO_PKG_VERSION"),
                SERVER_NAME
            );
            (Status::Ok, JSON, Bytes::from(body))
        } else if contains(target, b"/api/stats") {
            (Status::Ok, JSON, Bytes::from(self.stats.snapshot().to_json()))
        } else {
            (
                Status::NotFound,
                JSON,
                Bytes::from_static(b"{\"error\":\"endpoint not found\"}"),
            )
        }
    }
}

impl Respond for HttpResponder {
    fn respond(&self, input: &[u8]) -> Result<ProcessResult, ProtocolError> {
        let (head, consumed) = match parser::parse(input) {
            ParseResult::Complete(head, consumed) => (head, consumed),
            ParseResult::Incomplete => return Ok(ProcessResult::NeedData),
            ParseResult::Error(reason) => return Err(ProtocolError::Malformed(reason)),
        };

        let requests = self.stats.request();
        let keep_alive = head.keep_alive();
        let (status, content_type, body) = self.route(&head, requests);

        Ok(ProcessResult::Reply(Reply {
            consumed,
            response: encode_response(status, content_type, &body, keep_alive),
            keep_alive,
        }))
    }
}

/// Encode a complete HTTP/1.1 response.
pub fn encode_response(status: Status, content_type: &str, body: &[u8], keep_alive: bool) -> Bytes {
    let mut out = BytesMut::with_capacity(192 + body.len());

    // Writing into BytesMut cannot fail
    let _ = write!(
        out,
        "HTTP/1.1 {} {}\r\n\
         Server: {}\r\n\
         Date: {}\r\n\
         Content-Type: {}\r\n\
         Content-Length: {}\r\n\
         Connection: {}\r\n\r\n",
        status.code(),
        status.reason(),
        SERVER_NAME,
        Utc::now().format("%a, %d %b %Y %H:%M:%S GMT"),
        content_type,
        body.len(),
        if keep_alive { "keep-alive" } else { "close" },
    );
    out.extend_from_slice(body);
    out.freeze()
}

fn contains(haystack: &[u8], needle: &[u8]) -> bool {
    haystack.windows(needle.len()).any(|w| w == needle)
}
