//! Memcached text protocol, client side.
//!
//! ## Protocol Format
//!
//! ```text
//! Request:  get <key>\r\n
//! Response: VALUE <key> <flags> <bytes>\r\n<data>\r\nEND\r\n   (hit)
//!           END\r\n                                          (miss)
//!
//! Request:  set <key> <flags> <exptime> <bytes>\r\n<data>\r\n
//! Response: STORED\r\n | NOT_STORED\r\n | ERROR\r\n | ...
//! ```
//!
//! Responses are framed one line (or one data block) at a time so a frame
//! split across any number of reads is reassembled; a data block is taken
//! by its announced length rather than searched for.

pub mod parser;

use super::{find_crlf, Outcome, Progress, ProtocolError};
use crate::runtime::OpKind;
use bytes::{Buf, Bytes, BytesMut};
use parser::{parse_line, ResponseLine};
use std::mem;

/// Longest response line accepted before giving up on framing.
pub const MAX_LINE_LENGTH: usize = 2048;

/// Position inside the response currently being framed.
#[derive(Debug, Default)]
enum Frame {
    /// Expecting the first line of a response.
    #[default]
    Head,
    /// Expecting `len` bytes of value data plus CRLF.
    Data { key: Bytes, len: usize },
    /// Value received; expecting `END`.
    Tail { key: Bytes, value: Bytes },
}

#[derive(Debug, Default)]
pub struct MemcachedProtocol {
    frame: Frame,
}

impl MemcachedProtocol {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get_request(&self, key: &str, out: &mut BytesMut) -> usize {
        let start = out.len();
        out.extend_from_slice(b"get ");
        out.extend_from_slice(key.as_bytes());
        out.extend_from_slice(b"\r\n");
        out.len() - start
    }

    pub fn set_request(&self, key: &str, value: &[u8], out: &mut BytesMut) -> usize {
        let start = out.len();
        out.extend_from_slice(format!("set {} 0 0 {}\r\n", key, value.len()).as_bytes());
        out.extend_from_slice(value);
        out.extend_from_slice(b"\r\n");
        out.len() - start
    }

    /// Consume one line or data block of the response to an operation of
    /// kind `kind`.
    pub fn consume_ascii_line(
        &mut self,
        input: &mut BytesMut,
        kind: OpKind,
    ) -> Result<Progress, ProtocolError> {
        if let Frame::Data { key, len } = &mut self.frame {
            let len = *len;
            if input.len() < len.saturating_add(2) {
                return Ok(Progress::NeedData);
            }
            if &input[len..len + 2] != b"\r\n" {
                return Err(ProtocolError::MissingDataTerminator);
            }

            let key = mem::take(key);
            let value = input.split_to(len).freeze();
            input.advance(2);
            self.frame = Frame::Tail { key, value };
            return Ok(Progress::Continue);
        }

        let line_end = match find_crlf(input) {
            Some(pos) => pos,
            None if input.len() > MAX_LINE_LENGTH => {
                return Err(ProtocolError::LineTooLong(MAX_LINE_LENGTH))
            }
            None => return Ok(Progress::NeedData),
        };

        let raw = input.split_to(line_end + 2);
        let line = &raw[..line_end];
        let parsed = parse_line(line)?;

        let progress = match (mem::take(&mut self.frame), kind, parsed) {
            (Frame::Head, OpKind::Get, ResponseLine::End) => Progress::Done(Outcome::Miss),
            (Frame::Head, OpKind::Get, ResponseLine::Value { key, bytes, .. }) => {
                self.frame = Frame::Data {
                    key: Bytes::copy_from_slice(key),
                    len: bytes,
                };
                Progress::Continue
            }
            (Frame::Tail { key, value }, OpKind::Get, ResponseLine::End) => {
                Progress::Done(Outcome::Hit { key, value })
            }
            (Frame::Head, OpKind::Post, ResponseLine::Stored) => Progress::Done(Outcome::Stored),
            (
                Frame::Head,
                OpKind::Post,
                ResponseLine::NotStored | ResponseLine::Exists | ResponseLine::NotFound,
            ) => Progress::Done(Outcome::NotStored),
            (
                Frame::Head,
                _,
                ResponseLine::Error | ResponseLine::ClientError(_) | ResponseLine::ServerError(_),
            ) => Progress::Done(Outcome::ServerError),
            _ => {
                return Err(ProtocolError::UnexpectedLine(
                    String::from_utf8_lossy(line).into_owned(),
                ))
            }
        };

        Ok(progress)
    }

    pub fn reset(&mut self) {
        self.frame = Frame::Head;
    }
}
