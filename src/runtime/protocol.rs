//! Response producer contract.
//!
//! The engine hands the buffered request bytes to a `Respond`
//! implementation and gets back either a reply or a request for more
//! data. The producer runs on the thread that drives the completion queue,
//! so it must never block.

use bytes::Bytes;
use thiserror::Error;

/// A response ready to be sent.
#[derive(Debug, Clone)]
pub struct Reply {
    /// Bytes of the buffered input answered by this reply.
    pub consumed: usize,
    /// Complete response to transmit.
    pub response: Bytes,
    /// Keep the connection open after the response is written.
    pub keep_alive: bool,
}

/// Result of processing buffered input.
#[derive(Debug, Clone)]
pub enum ProcessResult {
    /// The request is not complete yet.
    NeedData,
    /// A response for the leading request.
    Reply(Reply),
}

/// Producer failure. Always closes the connection.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    /// The request does not fit in the connection's read buffer.
    #[error("request exceeds {0} byte buffer")]
    RequestTooLarge(usize),
    /// The request could not be understood.
    #[error("malformed request: {0}")]
    Malformed(&'static str),
}

/// Builds response bytes for received request bytes.
pub trait Respond: Send + Sync + 'static {
    fn respond(&self, input: &[u8]) -> Result<ProcessResult, ProtocolError>;
}

impl<F> Respond for F
where
    F: Fn(&[u8]) -> Result<ProcessResult, ProtocolError> + Send + Sync + 'static,
{
    fn respond(&self, input: &[u8]) -> Result<ProcessResult, ProtocolError> {
        self(input)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_closure_responder() {
        let echo = |input: &[u8]| -> Result<ProcessResult, ProtocolError> {
            if input.is_empty() {
                return Ok(ProcessResult::NeedData);
            }
            Ok(ProcessResult::Reply(Reply {
                consumed: input.len(),
                response: Bytes::copy_from_slice(input),
                keep_alive: true,
            }))
        };

        assert!(matches!(echo.respond(b""), Ok(ProcessResult::NeedData)));
        match echo.respond(b"hi") {
            Ok(ProcessResult::Reply(reply)) => {
                assert_eq!(reply.consumed, 2);
                assert_eq!(reply.response.as_ref(), b"hi");
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_protocol_error_display() {
        assert_eq!(
            ProtocolError::RequestTooLarge(4096).to_string(),
            "request exceeds 4096 byte buffer"
        );
    }
}
