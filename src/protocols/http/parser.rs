//! HTTP/1.x request head parser.
//!
//! Only what the responder needs: method, target, version, the
//! `Connection` and `Content-Length` headers, and where the request ends.

/// Protocol version from the request line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Version {
    Http10,
    Http11,
    /// No version on the request line (`GET /`).
    Unspecified,
}

/// Value of the `Connection` header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionOption {
    KeepAlive,
    Close,
}

/// Parsed request head, borrowing from the input buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestHead<'a> {
    pub method: &'a [u8],
    pub target: &'a [u8],
    pub version: Version,
    pub connection: Option<ConnectionOption>,
    pub content_length: usize,
}

impl RequestHead<'_> {
    /// Path portion of the target, without the query string.
    pub fn path(&self) -> &[u8] {
        match self.target.iter().position(|&b| b == b'?') {
            Some(pos) => &self.target[..pos],
            None => self.target,
        }
    }

    /// The connection stays open unless the client asked to close it.
    pub fn keep_alive(&self) -> bool {
        self.connection != Some(ConnectionOption::Close)
    }
}

/// Parse result.
#[derive(Debug)]
pub enum ParseResult<'a> {
    /// Complete request with bytes consumed, body included.
    Complete(RequestHead<'a>, usize),
    /// Need more data.
    Incomplete,
    /// The request cannot be understood.
    Error(&'static str),
}

/// Parse one request from the front of `input`.
pub fn parse(input: &[u8]) -> ParseResult<'_> {
    let head_end = match find_head_end(input) {
        Some(pos) => pos,
        None => return ParseResult::Incomplete,
    };

    let mut lines = input[..head_end].split(|&b| b == b'\n').map(trim_cr);

    let (method, target, version) = match lines.next().map(parse_request_line) {
        Some(Ok(parts)) => parts,
        Some(Err(reason)) => return ParseResult::Error(reason),
        None => return ParseResult::Error("missing request line"),
    };

    let mut connection = None;
    let mut content_length = 0;

    for line in lines {
        if line.is_empty() {
            continue;
        }
        let colon = match line.iter().position(|&b| b == b':') {
            Some(pos) => pos,
            None => return ParseResult::Error("header without colon"),
        };
        let name = trim(&line[..colon]);
        let value = trim(&line[colon + 1..]);

        if name.eq_ignore_ascii_case(b"connection") {
            connection = parse_connection(value).or(connection);
        } else if name.eq_ignore_ascii_case(b"content-length") {
            content_length = match parse_usize(value) {
                Some(n) => n,
                None => return ParseResult::Error("invalid content-length"),
            };
        }
    }

    // Head, blank line, then the declared body
    let consumed = match (head_end + 4).checked_add(content_length) {
        Some(n) => n,
        None => return ParseResult::Error("invalid content-length"),
    };
    if input.len() < consumed {
        return ParseResult::Incomplete;
    }

    let head = RequestHead {
        method,
        target,
        version,
        connection,
        content_length,
    };
    ParseResult::Complete(head, consumed)
}

fn parse_request_line(line: &[u8]) -> Result<(&[u8], &[u8], Version), &'static str> {
    let mut parts = line.split(|&b| b == b' ').filter(|p| !p.is_empty());

    let method = parts.next().ok_or("empty request line")?;
    if !method.iter().all(|b| b.is_ascii_uppercase()) {
        return Err("invalid method");
    }
    let target = parts.next().ok_or("missing request target")?;

    let version = match parts.next() {
        None => Version::Unspecified,
        Some(b"HTTP/1.1") => Version::Http11,
        Some(b"HTTP/1.0") => Version::Http10,
        Some(_) => return Err("unsupported version"),
    };

    if parts.next().is_some() {
        return Err("trailing data on request line");
    }
    Ok((method, target, version))
}

/// Find the first token of a comma-separated `Connection` value we know.
fn parse_connection(value: &[u8]) -> Option<ConnectionOption> {
    value.split(|&b| b == b',').map(trim).find_map(|token| {
        if token.eq_ignore_ascii_case(b"close") {
            Some(ConnectionOption::Close)
        } else if token.eq_ignore_ascii_case(b"keep-alive") {
            Some(ConnectionOption::KeepAlive)
        } else {
            None
        }
    })
}

fn parse_usize(value: &[u8]) -> Option<usize> {
    if value.is_empty() || !value.iter().all(u8::is_ascii_digit) {
        return None;
    }
    std::str::from_utf8(value).ok()?.parse().ok()
}

/// Find `\r\n\r\n`, returning the position of its first byte.
fn find_head_end(buffer: &[u8]) -> Option<usize> {
    buffer.windows(4).position(|w| w == b"\r\n\r\n")
}

fn trim_cr(line: &[u8]) -> &[u8] {
    line.strip_suffix(b"\r").unwrap_or(line)
}

fn trim(bytes: &[u8]) -> &[u8] {
    let start = bytes
        .iter()
        .position(|b| !b.is_ascii_whitespace())
        .unwrap_or(bytes.len());
    let end = bytes
        .iter()
        .rposition(|b| !b.is_ascii_whitespace())
        .map_or(start, |pos| pos + 1);
    &bytes[start..end]
}
