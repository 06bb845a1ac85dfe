//! HTTP/1.1 response framing.
//!
//! The response head is parsed with `httparse`; the body is skipped using
//! `Content-Length` or chunked transfer coding. Bodies are not retained:
//! a well-formed response is all the benchmark needs.

use crate::protocols::{find_crlf, Outcome, Progress, ProtocolError};
use bytes::{Buf, BytesMut};
use http::StatusCode;
use std::str;

/// Maximum number of response headers.
const MAX_HEADERS: usize = 64;

/// Largest response head accepted.
pub const MAX_HEAD_LENGTH: usize = 64 * 1024;

/// Longest chunk-size or trailer line accepted.
const MAX_CHUNK_LINE: usize = 1024;

/// How the body following a response head is delimited.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BodyFraming {
    /// 1xx: another head follows.
    Informational,
    /// No body (204, 304).
    Empty,
    Length(usize),
    Chunked,
}

/// Position inside the response currently being framed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ResponseFrame {
    #[default]
    Head,
    Body {
        status: StatusCode,
        remaining: usize,
    },
    ChunkSize {
        status: StatusCode,
    },
    ChunkData {
        status: StatusCode,
        remaining: usize,
    },
    ChunkEnd {
        status: StatusCode,
    },
    Trailer {
        status: StatusCode,
    },
}

impl ResponseFrame {
    /// Consume one segment (head, body bytes, chunk line) of a response.
    pub fn consume(&mut self, input: &mut BytesMut) -> Result<Progress, ProtocolError> {
        match *self {
            ResponseFrame::Head => self.consume_head(input),
            ResponseFrame::Body { status, remaining } => {
                let remaining = skip(input, remaining);
                if remaining == 0 {
                    *self = ResponseFrame::Head;
                    return Ok(Progress::Done(Outcome::Http { status }));
                }
                *self = ResponseFrame::Body { status, remaining };
                Ok(Progress::NeedData)
            }
            ResponseFrame::ChunkSize { status } => {
                let (consumed, size) = match httparse::parse_chunk_size(&input[..]) {
                    Ok(httparse::Status::Complete(parsed)) => parsed,
                    Ok(httparse::Status::Partial) if input.len() > MAX_CHUNK_LINE => {
                        return Err(ProtocolError::InvalidChunk(
                            "chunk line too long".to_string(),
                        ))
                    }
                    Ok(httparse::Status::Partial) => return Ok(Progress::NeedData),
                    Err(_) => {
                        return Err(ProtocolError::InvalidChunk("invalid chunk size".to_string()))
                    }
                };
                input.advance(consumed);
                let size = usize::try_from(size)
                    .map_err(|_| ProtocolError::InvalidChunk(format!("chunk size {}", size)))?;
                *self = if size == 0 {
                    ResponseFrame::Trailer { status }
                } else {
                    ResponseFrame::ChunkData {
                        status,
                        remaining: size,
                    }
                };
                Ok(Progress::Continue)
            }
            ResponseFrame::ChunkData { status, remaining } => {
                let remaining = skip(input, remaining);
                if remaining == 0 {
                    *self = ResponseFrame::ChunkEnd { status };
                    return Ok(Progress::Continue);
                }
                *self = ResponseFrame::ChunkData { status, remaining };
                Ok(Progress::NeedData)
            }
            ResponseFrame::ChunkEnd { status } => {
                if input.len() < 2 {
                    return Ok(Progress::NeedData);
                }
                if &input[..2] != b"\r\n" {
                    return Err(ProtocolError::InvalidChunk(
                        "chunk data not terminated by CRLF".to_string(),
                    ));
                }
                input.advance(2);
                *self = ResponseFrame::ChunkSize { status };
                Ok(Progress::Continue)
            }
            ResponseFrame::Trailer { status } => {
                let Some(line) = take_line(input)? else {
                    return Ok(Progress::NeedData);
                };
                if line.is_empty() {
                    *self = ResponseFrame::Head;
                    return Ok(Progress::Done(Outcome::Http { status }));
                }
                Ok(Progress::Continue)
            }
        }
    }

    fn consume_head(&mut self, input: &mut BytesMut) -> Result<Progress, ProtocolError> {
        let (head_len, status, framing) = {
            let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
            let mut response = httparse::Response::new(&mut headers);
            let head_len = match response.parse(&input[..])? {
                httparse::Status::Complete(len) => len,
                httparse::Status::Partial if input.len() > MAX_HEAD_LENGTH => {
                    return Err(ProtocolError::HeadTooLarge(MAX_HEAD_LENGTH))
                }
                httparse::Status::Partial => return Ok(Progress::NeedData),
            };

            let code = response.code.unwrap_or_default();
            let status =
                StatusCode::from_u16(code).map_err(|_| ProtocolError::InvalidStatus(code))?;
            let framing = body_framing(status, response.headers)?;
            (head_len, status, framing)
        };

        input.advance(head_len);

        match framing {
            BodyFraming::Informational => Ok(Progress::Continue),
            BodyFraming::Empty | BodyFraming::Length(0) => {
                Ok(Progress::Done(Outcome::Http { status }))
            }
            BodyFraming::Length(remaining) => {
                *self = ResponseFrame::Body { status, remaining };
                Ok(Progress::Continue)
            }
            BodyFraming::Chunked => {
                *self = ResponseFrame::ChunkSize { status };
                Ok(Progress::Continue)
            }
        }
    }
}

fn body_framing(
    status: StatusCode,
    headers: &[httparse::Header<'_>],
) -> Result<BodyFraming, ProtocolError> {
    if status.is_informational() {
        return Ok(BodyFraming::Informational);
    }
    if status == StatusCode::NO_CONTENT || status == StatusCode::NOT_MODIFIED {
        return Ok(BodyFraming::Empty);
    }

    let mut content_length = None;
    for header in headers {
        if header.name.eq_ignore_ascii_case("transfer-encoding") {
            let chunked = str::from_utf8(header.value)
                .map(|v| v.split(',').any(|c| c.trim().eq_ignore_ascii_case("chunked")))
                .unwrap_or(false);
            if chunked {
                return Ok(BodyFraming::Chunked);
            }
        } else if header.name.eq_ignore_ascii_case("content-length") {
            let value = String::from_utf8_lossy(header.value);
            let len = value
                .trim()
                .parse::<usize>()
                .map_err(|_| ProtocolError::InvalidContentLength(value.to_string()))?;
            content_length = Some(len);
        }
    }

    content_length
        .map(BodyFraming::Length)
        .ok_or(ProtocolError::MissingBodyLength)
}

/// Drop up to `remaining` bytes from `input`; returns what is still owed.
fn skip(input: &mut BytesMut, remaining: usize) -> usize {
    let n = remaining.min(input.len());
    input.advance(n);
    remaining - n
}

/// Split off one CRLF-terminated line, without the CRLF.
fn take_line(input: &mut BytesMut) -> Result<Option<BytesMut>, ProtocolError> {
    match find_crlf(input) {
        Some(pos) => {
            let mut line = input.split_to(pos + 2);
            line.truncate(pos);
            Ok(Some(line))
        }
        None if input.len() > MAX_CHUNK_LINE => Err(ProtocolError::InvalidChunk(
            "chunk line too long".to_string(),
        )),
        None => Ok(None),
    }
}
