//! Protocol implementations.
//!
//! Each protocol serializes requests and incrementally frames responses off
//! a connection's input buffer:
//! - `memcached`: Memcached text protocol (`get` / `set`)
//! - `http`: HTTP/1.1 with GET for reads and POST for writes
//!
//! `Protocol` is a closed enum; the connection owns exactly one and keeps
//! any partial-frame state inside it.

pub mod http;
pub mod memcached;

use crate::config::{ProtocolType, Target};
use crate::runtime::OpKind;
use bytes::{Bytes, BytesMut};
use thiserror::Error;

/// How a completed response resolved its operation.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    /// GET returned a value.
    Hit { key: Bytes, value: Bytes },
    /// GET for a missing key.
    Miss,
    Stored,
    /// NOT_STORED, EXISTS or NOT_FOUND.
    NotStored,
    /// ERROR, CLIENT_ERROR or SERVER_ERROR.
    ServerError,
    /// Any well-formed HTTP response.
    Http { status: ::http::StatusCode },
}

/// Framing errors. Queue/response alignment is lost after any of these,
/// so the connection must be reset.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("unexpected response line: {0}")]
    UnexpectedLine(String),
    #[error("malformed VALUE header: {0}")]
    InvalidValueHeader(String),
    #[error("value block not terminated by CRLF")]
    MissingDataTerminator,
    #[error("response line exceeds {0} bytes")]
    LineTooLong(usize),
    #[error("response received with no outstanding operation")]
    EmptyQueue,
    #[error("malformed HTTP response: {0}")]
    Http(#[from] httparse::Error),
    #[error("HTTP response head exceeds {0} bytes")]
    HeadTooLarge(usize),
    #[error("invalid HTTP status {0}")]
    InvalidStatus(u16),
    #[error("HTTP response has no Content-Length or chunked encoding")]
    MissingBodyLength,
    #[error("invalid Content-Length: {0}")]
    InvalidContentLength(String),
    #[error("invalid chunk: {0}")]
    InvalidChunk(String),
}

/// Result of consuming one line or segment of a response.
#[derive(Debug, PartialEq)]
pub enum Progress {
    /// Input ends mid-segment; wait for more bytes.
    NeedData,
    /// A segment was consumed but the frame is not finished.
    Continue,
    /// The frame is complete.
    Done(Outcome),
}

/// Wire codec bound to one connection.
#[derive(Debug)]
pub enum Protocol {
    Memcached(memcached::MemcachedProtocol),
    Http(http::HttpProtocol),
}

impl Protocol {
    pub fn new(target: &Target) -> Self {
        match target.protocol {
            ProtocolType::Memcached => Protocol::Memcached(memcached::MemcachedProtocol::new()),
            ProtocolType::Http => Protocol::Http(http::HttpProtocol::new(target)),
        }
    }

    /// Write any connection handshake into `out`.
    ///
    /// Returns `true` when no handshake response is expected. Neither
    /// protocol authenticates yet, so setup completes immediately.
    pub fn setup_connection_w(&mut self, _out: &mut BytesMut) -> bool {
        match self {
            Protocol::Memcached(_) | Protocol::Http(_) => true,
        }
    }

    /// Consume a handshake response; `Ok(true)` once setup is complete.
    pub fn setup_connection_r(&mut self, _input: &mut BytesMut) -> Result<bool, ProtocolError> {
        match self {
            Protocol::Memcached(_) | Protocol::Http(_) => Ok(true),
        }
    }

    /// Serialize a read of `key`; returns bytes written.
    pub fn get_request(&self, key: &str, out: &mut BytesMut) -> usize {
        match self {
            Protocol::Memcached(p) => p.get_request(key, out),
            Protocol::Http(p) => p.get_request(key, out),
        }
    }

    /// Serialize a write of `value` to `key`; returns bytes written.
    pub fn post_request(&self, key: &str, value: &[u8], out: &mut BytesMut) -> usize {
        match self {
            Protocol::Memcached(p) => p.set_request(key, value, out),
            Protocol::Http(p) => p.post_request(key, value, out),
        }
    }

    /// Frame as much of the oldest response as `input` holds.
    ///
    /// Consumed bytes are removed from `input`. Returns `Ok(None)` until the
    /// whole response has arrived.
    pub fn handle_response(
        &mut self,
        input: &mut BytesMut,
        kind: OpKind,
    ) -> Result<Option<Outcome>, ProtocolError> {
        loop {
            let progress = match self {
                Protocol::Memcached(p) => p.consume_ascii_line(input, kind)?,
                Protocol::Http(p) => p.consume(input)?,
            };
            match progress {
                Progress::NeedData => return Ok(None),
                Progress::Continue => continue,
                Progress::Done(outcome) => return Ok(Some(outcome)),
            }
        }
    }

    /// Drop any partial-frame state.
    pub fn reset(&mut self) {
        match self {
            Protocol::Memcached(p) => p.reset(),
            Protocol::Http(p) => p.reset(),
        }
    }
}

/// Find \r\n in buffer, returning the position of \r.
pub(crate) fn find_crlf(buffer: &[u8]) -> Option<usize> {
    buffer.windows(2).position(|w| w == b"\r\n")
}
